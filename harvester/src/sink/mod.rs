//! Output sinks for harvested records.

mod jsonl;
mod sqlx_sink;

use async_trait::async_trait;

use crate::Result;
use crate::source::SeriesRecord;

pub use jsonl::JsonLinesSink;
pub use sqlx_sink::SqlxRecordSink;

/// Destination of decoded records.
///
/// `append` must not return `Ok` before the records survive a crash well
/// enough for the unit to be marked done in the ledger.
#[async_trait]
pub trait RecordSink: Send + Sync {
    async fn append(&self, records: Vec<SeriesRecord>) -> Result<()>;

    async fn flush(&self) -> Result<()>;
}
