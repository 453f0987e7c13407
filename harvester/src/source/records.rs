//! Decoded series rows.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::crawler::{CrawlError, DataKind, TaskUnit};

/// One day of one series.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeriesRecord {
    pub keyword: String,
    pub area_code: String,
    pub kind: DataKind,
    pub date: NaiveDate,
    /// `None` when the service has no value for that day.
    pub value: Option<i64>,
}

/// Turn per-day values into records, one per day of the task window.
pub fn records_from_values(
    task: &TaskUnit,
    values: &[Option<i64>],
) -> Result<Vec<SeriesRecord>, CrawlError> {
    let expected = task.window.days();
    if values.len() != expected {
        return Err(CrawlError::DataIncomplete(format!(
            "expected {expected} daily values for {}, got {}",
            task.key(),
            values.len()
        )));
    }

    values
        .iter()
        .enumerate()
        .map(|(offset, value)| {
            let date = task.window.date_at(offset).ok_or_else(|| {
                CrawlError::DataIncomplete(format!("day offset {offset} outside window"))
            })?;
            Ok(SeriesRecord {
                keyword: task.keyword.clone(),
                area_code: task.area_code.clone(),
                kind: task.kind,
                date,
                value: *value,
            })
        })
        .collect()
}

/// Parse decrypted comma separated values. Empty fields are missing days.
pub fn parse_values(plain: &str) -> Result<Vec<Option<i64>>, CrawlError> {
    plain
        .split(',')
        .map(|field| {
            let field = field.trim();
            if field.is_empty() {
                return Ok(None);
            }
            field
                .parse::<i64>()
                .map(Some)
                .map_err(|e| CrawlError::DataIncomplete(format!("bad value '{field}': {e}")))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crawler::TimeWindow;

    fn task(days: u32) -> TaskUnit {
        let start = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let end = NaiveDate::from_ymd_opt(2024, 1, days).unwrap();
        TaskUnit::new("kw", "0", TimeWindow::new(start, end).unwrap(), DataKind::Search)
    }

    #[test]
    fn test_values_to_records() {
        let values = parse_values("10,,30").unwrap();
        assert_eq!(values, vec![Some(10), None, Some(30)]);

        let records = records_from_values(&task(3), &values).unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[2].date, NaiveDate::from_ymd_opt(2024, 1, 3).unwrap());
        assert_eq!(records[1].value, None);
    }

    #[test]
    fn test_length_mismatch_is_incomplete() {
        let err = records_from_values(&task(3), &[Some(1)]).unwrap_err();
        assert!(matches!(err, CrawlError::DataIncomplete(_)));
        assert!(matches!(
            parse_values("1,x"),
            Err(CrawlError::DataIncomplete(_))
        ));
    }
}
