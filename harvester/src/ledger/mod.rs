//! Progress ledger.
//!
//! Records which task keys completed so an interrupted run resumes where it
//! left off. Success is sticky: once a key succeeded, nothing marks it failed.

mod journal;
mod progress;
mod store;
mod types;

pub use journal::JournalLedgerStore;
pub use progress::ProgressLedger;
pub use store::{LedgerStore, MemoryLedgerStore};
pub use types::{
    LedgerBackend, LedgerConfig, LedgerEntry, LedgerStats, LedgerStatus, coalesce, merge_into,
};
