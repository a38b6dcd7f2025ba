use crate::core::types::DailyClose;
use crate::marketdata::client::PriceHistoryClient;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{Datelike, NaiveDate, Utc, Weekday};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Seeded geometric random walk over weekdays, walked backwards from `anchor_price` on the
/// end date. A given date always gets the same close regardless of how much history is asked
/// for.
pub struct SimPriceHistoryClient {
    seed: u64,
    anchor_price: f64,
    drift: f64,
    daily_vol: f64,
    end: Option<NaiveDate>,
}

impl SimPriceHistoryClient {
    pub fn new(seed: u64, anchor_price: f64, drift: f64, daily_vol: f64) -> Self {
        Self {
            seed,
            anchor_price,
            drift,
            daily_vol,
            end: None,
        }
    }

    /// Pin the last simulated date instead of using today.
    pub fn ending_on(mut self, end: NaiveDate) -> Self {
        self.end = Some(end);
        self
    }

    fn end_date(&self) -> NaiveDate {
        self.end.unwrap_or_else(|| Utc::now().date_naive())
    }

    /// `n` weekdays ending at or before `end`, oldest first.
    fn weekdays_back(end: NaiveDate, n: usize) -> Vec<NaiveDate> {
        let mut dates = Vec::with_capacity(n);
        let mut d = end;
        while dates.len() < n {
            if !matches!(d.weekday(), Weekday::Sat | Weekday::Sun) {
                dates.push(d);
            }
            match d.pred_opt() {
                Some(prev) => d = prev,
                None => break,
            }
        }
        dates.reverse();
        dates
    }

    fn generate(&self, n: usize) -> Vec<DailyClose> {
        let dates = Self::weekdays_back(self.end_date(), n);
        let mut rng = StdRng::seed_from_u64(self.seed);
        let mut closes = vec![0.0; dates.len()];
        let mut price = self.anchor_price;

        for slot in closes.iter_mut().rev() {
            *slot = price;
            // uniform shock scaled to unit variance
            let shock: f64 = rng.gen_range(-1.0..1.0) * 3f64.sqrt();
            price /= (self.drift + self.daily_vol * shock).exp();
        }

        dates
            .into_iter()
            .zip(closes)
            .map(|(date, close)| DailyClose { date, close })
            .collect()
    }
}

#[async_trait]
impl PriceHistoryClient for SimPriceHistoryClient {
    async fn fetch_recent(&self, days: usize) -> Result<Vec<DailyClose>> {
        anyhow::ensure!(days > 0, "requested an empty price history");
        Ok(self.generate(days))
    }

    async fn fetch_range(&self, start: NaiveDate, end: NaiveDate) -> Result<Vec<DailyClose>> {
        anyhow::ensure!(start <= end, "invalid range {start}..={end}");
        let span = (self.end_date() - start).num_days().max(0) as usize + 1;
        let rows: Vec<DailyClose> = self
            .generate(span)
            .into_iter()
            .filter(|d| d.date >= start && d.date <= end)
            .collect();
        anyhow::ensure!(!rows.is_empty(), "no simulated closes between {start} and {end}");
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> SimPriceHistoryClient {
        SimPriceHistoryClient::new(42, 180.0, 0.0003, 0.015)
            .ending_on(NaiveDate::from_ymd_opt(2025, 6, 13).unwrap())
    }

    #[tokio::test]
    async fn test_recent_is_chronological_weekdays() {
        let rows = client().fetch_recent(20).await.unwrap();
        assert_eq!(rows.len(), 20);
        assert_eq!(rows.last().unwrap().date, NaiveDate::from_ymd_opt(2025, 6, 13).unwrap());
        for pair in rows.windows(2) {
            assert!(pair[0].date < pair[1].date);
        }
        assert!(
            rows.iter()
                .all(|r| !matches!(r.date.weekday(), Weekday::Sat | Weekday::Sun))
        );
        assert!(rows.iter().all(|r| r.close > 0.0));
    }

    #[tokio::test]
    async fn test_deterministic_for_seed() {
        let a = client().fetch_recent(50).await.unwrap();
        let b = client().fetch_recent(50).await.unwrap();
        assert_eq!(a, b);

        // a shorter request is a suffix of the longer one
        let short = client().fetch_recent(10).await.unwrap();
        assert_eq!(short[..], a[40..]);
        assert_eq!(a.last().unwrap().close, 180.0);
    }

    #[tokio::test]
    async fn test_range_and_errors() {
        let c = client();
        let start = NaiveDate::from_ymd_opt(2025, 6, 2).unwrap();
        let end = NaiveDate::from_ymd_opt(2025, 6, 6).unwrap();
        let rows = c.fetch_range(start, end).await.unwrap();
        assert_eq!(rows.len(), 5);
        assert!(rows.iter().all(|r| r.date >= start && r.date <= end));

        assert!(c.fetch_recent(0).await.is_err());
        assert!(c.fetch_range(end, start).await.is_err());
    }
}
