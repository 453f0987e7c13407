use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::Mutex;

use super::RecordSink;
use crate::Result;
use crate::source::SeriesRecord;

/// Appends one JSON object per record to a file.
pub struct JsonLinesSink {
    path: PathBuf,
    file: Mutex<BufWriter<File>>,
}

impl JsonLinesSink {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        Ok(Self {
            path,
            file: Mutex::new(BufWriter::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl RecordSink for JsonLinesSink {
    async fn append(&self, records: Vec<SeriesRecord>) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let mut buf = Vec::new();
        for record in &records {
            serde_json::to_writer(&mut buf, record)?;
            buf.push(b'\n');
        }

        let mut file = self.file.lock().await;
        file.write_all(&buf).await?;
        file.flush().await?;
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        let mut file = self.file.lock().await;
        file.flush().await?;
        file.get_ref().sync_data().await?;
        Ok(())
    }
}
