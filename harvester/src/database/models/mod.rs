//! Database models.
//!
//! These map directly to the schema in `migrations/` and convert to and from
//! the domain types.

pub mod credential;
pub mod ledger;
pub mod series;

pub use credential::*;
pub use ledger::*;
pub use series::*;
