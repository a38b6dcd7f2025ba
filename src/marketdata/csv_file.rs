use crate::core::types::DailyClose;
use crate::marketdata::client::PriceHistoryClient;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, Deserialize)]
struct CsvRow {
    date: NaiveDate,
    close: f64,
}

/// Daily closes from a `date,close` file with ISO dates. Rows may come in any order.
pub struct CsvPriceHistoryClient {
    path: PathBuf,
}

impl CsvPriceHistoryClient {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn read_all(&self) -> Result<Vec<DailyClose>> {
        let mut reader = csv::Reader::from_path(&self.path)
            .with_context(|| format!("opening price file {:?}", self.path))?;

        let mut rows = Vec::new();
        for (i, rec) in reader.deserialize::<CsvRow>().enumerate() {
            let row = rec.with_context(|| format!("parsing row {} of {:?}", i + 1, self.path))?;
            anyhow::ensure!(
                row.close.is_finite() && row.close > 0.0,
                "row {} of {:?} has a non-positive close",
                i + 1,
                self.path
            );
            rows.push(DailyClose {
                date: row.date,
                close: row.close,
            });
        }
        rows.sort_by_key(|r| r.date);
        rows.dedup_by_key(|r| r.date);
        anyhow::ensure!(!rows.is_empty(), "price file {:?} has no rows", self.path);
        Ok(rows)
    }
}

#[async_trait]
impl PriceHistoryClient for CsvPriceHistoryClient {
    async fn fetch_recent(&self, days: usize) -> Result<Vec<DailyClose>> {
        anyhow::ensure!(days > 0, "requested an empty price history");
        let rows = self.read_all()?;
        let start = rows.len().saturating_sub(days);
        Ok(rows[start..].to_vec())
    }

    async fn fetch_range(&self, start: NaiveDate, end: NaiveDate) -> Result<Vec<DailyClose>> {
        let rows: Vec<DailyClose> = self
            .read_all()?
            .into_iter()
            .filter(|r| r.date >= start && r.date <= end)
            .collect();
        anyhow::ensure!(
            !rows.is_empty(),
            "no closes between {start} and {end} in {:?}",
            self.path
        );
        Ok(rows)
    }
}
