//! Repository layer for database access.

pub mod credential;
pub mod ledger;
pub mod series;

pub use credential::*;
pub use ledger::*;
pub use series::*;
