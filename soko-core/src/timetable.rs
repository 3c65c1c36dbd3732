use async_trait::async_trait;
use chrono::NaiveDate;

use crate::train::{Direction, TimetableRecord};

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("Timetable request failed: {0}")]
    Transport(String),
    #[error("Timetable source responded with status {0}")]
    Status(u16),
    #[error("Timetable page could not be parsed: {0}")]
    Parse(String),
}

/// Authoritative schedule feed.
#[async_trait]
pub trait TimetableSource: Send + Sync {
    /// Records for one direction on one local calendar date, in feed order.
    async fn fetch(&self, direction: Direction, date: NaiveDate) -> Result<Vec<TimetableRecord>, SourceError>;
}
