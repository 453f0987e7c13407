use async_trait::async_trait;
use std::sync::Arc;

use super::RecordSink;
use crate::Result;
use crate::database::repositories::SeriesRecordRepository;
use crate::database::{BatchWriter, BatchWriterConfig};
use crate::source::SeriesRecord;

/// Writes records to `series_record`.
///
/// Appends from concurrent workers share one batch; each `append` waits for
/// the transaction that carries its rows.
pub struct SqlxRecordSink {
    writer: BatchWriter<SeriesRecord>,
}

impl SqlxRecordSink {
    pub fn new(repo: Arc<dyn SeriesRecordRepository>, config: BatchWriterConfig) -> Self {
        let writer = BatchWriter::new(config, move |batch: Vec<SeriesRecord>| {
            let repo = Arc::clone(&repo);
            async move { repo.upsert_batch(&batch).await }
        });
        Self { writer }
    }
}

#[async_trait]
impl RecordSink for SqlxRecordSink {
    async fn append(&self, records: Vec<SeriesRecord>) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        for record in records {
            self.writer.add(record).await?;
        }
        self.writer.flush().await
    }

    async fn flush(&self) -> Result<()> {
        self.writer.flush().await
    }
}
