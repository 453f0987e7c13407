//! harvester library crate.
//!
//! Credential-pooled, rate-limited and resumable collection of time-series
//! analytics. The binary wires these modules through [`services::ServiceContainer`].

pub mod config;
pub mod crawler;
pub mod credentials;
pub mod database;
pub mod error;
pub mod ledger;
pub mod logging;
pub mod services;
pub mod sink;
pub mod source;
pub mod utils;

pub use error::{Error, Result};
