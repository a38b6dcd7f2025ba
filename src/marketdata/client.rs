use crate::core::types::DailyClose;
use anyhow::Result;
use async_trait::async_trait;
use chrono::NaiveDate;

/// Read-only source of daily closes, oldest first. Empty answers are errors, not empty vectors.
#[async_trait]
pub trait PriceHistoryClient: Send + Sync + 'static {
    /// The most recent `days` trading days (fewer if the source is shorter).
    async fn fetch_recent(&self, days: usize) -> Result<Vec<DailyClose>>;

    /// Every close with `start <= date <= end`.
    async fn fetch_range(&self, start: NaiveDate, end: NaiveDate) -> Result<Vec<DailyClose>>;
}
