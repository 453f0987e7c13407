//! Harvested series row.

use sqlx::FromRow;
use std::str::FromStr;

use crate::crawler::DataKind;
use crate::database::time::{date_to_text, now_ms, text_to_date};
use crate::source::SeriesRecord;

/// Row of the `series_record` table.
#[derive(Debug, Clone, FromRow)]
pub struct SeriesRecordDbModel {
    pub keyword: String,
    pub area_code: String,
    pub kind: String,
    /// ISO date, `YYYY-MM-DD`.
    pub date: String,
    pub value: Option<i64>,
    pub fetched_at: i64,
}

impl SeriesRecordDbModel {
    pub fn from_record(record: &SeriesRecord) -> Self {
        Self {
            keyword: record.keyword.clone(),
            area_code: record.area_code.clone(),
            kind: record.kind.to_string(),
            date: date_to_text(record.date),
            value: record.value,
            fetched_at: now_ms(),
        }
    }

    pub fn into_record(self) -> crate::Result<SeriesRecord> {
        let kind = DataKind::from_str(&self.kind)
            .map_err(|_| crate::Error::Database(format!("invalid data kind '{}'", self.kind)))?;
        Ok(SeriesRecord {
            date: text_to_date(&self.date)?,
            keyword: self.keyword,
            area_code: self.area_code,
            kind,
            value: self.value,
        })
    }
}
