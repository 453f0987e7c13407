//! Units of work.

use chrono::{Days, NaiveDate};
use itertools::iproduct;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};

use crate::{Error, Result};

/// Category of series the analytics service serves.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DataKind {
    Search,
    Feed,
    News,
}

/// Inclusive date range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawWindow")]
pub struct TimeWindow {
    start: NaiveDate,
    end: NaiveDate,
}

#[derive(Deserialize)]
struct RawWindow {
    start: NaiveDate,
    end: NaiveDate,
}

impl TryFrom<RawWindow> for TimeWindow {
    type Error = Error;

    fn try_from(raw: RawWindow) -> Result<Self> {
        TimeWindow::new(raw.start, raw.end)
    }
}

impl TimeWindow {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self> {
        if start > end {
            return Err(Error::validation(format!(
                "time window start {start} is after end {end}"
            )));
        }
        Ok(Self { start, end })
    }

    pub fn start(&self) -> NaiveDate {
        self.start
    }

    pub fn end(&self) -> NaiveDate {
        self.end
    }

    /// Number of days, both ends included.
    pub fn days(&self) -> usize {
        (self.end - self.start).num_days() as usize + 1
    }

    /// The date `offset` days after `start`, if still inside the window.
    pub fn date_at(&self, offset: usize) -> Option<NaiveDate> {
        let date = self.start.checked_add_days(Days::new(offset as u64))?;
        (date <= self.end).then_some(date)
    }
}

/// One fetch: a keyword in an area over a window, for one kind of series.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskUnit {
    pub keyword: String,
    pub area_code: String,
    pub window: TimeWindow,
    pub kind: DataKind,
}

impl TaskUnit {
    pub fn new(
        keyword: impl Into<String>,
        area_code: impl Into<String>,
        window: TimeWindow,
        kind: DataKind,
    ) -> Self {
        Self {
            keyword: keyword.into(),
            area_code: area_code.into(),
            window,
            kind,
        }
    }

    /// Ledger key: `kind|area|start|end|keyword`.
    ///
    /// The keyword goes last since it is the only free-form component.
    pub fn key(&self) -> String {
        format!(
            "{}|{}|{}|{}|{}",
            self.kind, self.area_code, self.window.start, self.window.end, self.keyword
        )
    }
}

/// Cross product of the inputs, in keyword-major order, without duplicates.
pub fn expand(
    keywords: &[String],
    areas: &[String],
    windows: &[TimeWindow],
    kinds: &[DataKind],
) -> Vec<TaskUnit> {
    let mut seen = std::collections::HashSet::new();
    iproduct!(keywords, areas, windows, kinds)
        .map(|(k, a, w, d)| TaskUnit::new(k.as_str(), a.as_str(), *w, *d))
        .filter(|t| seen.insert(t.key()))
        .collect()
}
