use crate::quota::store::{InMemoryQuotaStore, QuotaStore};
use anyhow::Result;
use chrono::{NaiveDate, Utc};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Gate in front of the refinement backend: a fixed number of samples per UTC day.
///
/// Reservations are all-or-nothing and never refunded. The store handle is injected once and
/// shared by every caller, so concurrent pipelines draw from one counter.
#[derive(Clone)]
pub struct QuotaAllocator {
    store: Arc<dyn QuotaStore>,
    daily_budget: u64,
}

pub fn day_key(day: NaiveDate) -> String {
    day.format("%Y-%m-%d").to_string()
}

fn today() -> NaiveDate {
    Utc::now().date_naive()
}

impl QuotaAllocator {
    pub fn new(store: Arc<dyn QuotaStore>, daily_budget: u64) -> Self {
        Self {
            store,
            daily_budget,
        }
    }

    /// Allocator over a fresh process-local counter.
    pub fn in_memory(daily_budget: u64) -> Self {
        Self::new(Arc::new(InMemoryQuotaStore::new()), daily_budget)
    }

    pub fn daily_budget(&self) -> u64 {
        self.daily_budget
    }

    /// Reserve `n` samples against today's counter.
    pub async fn reserve(&self, n: u64) -> bool {
        self.reserve_on(today(), n).await
    }

    /// Reserve `n` samples against the counter for `day`.
    ///
    /// A store failure is treated as a denial: the caller falls back to unrefined results.
    #[tracing::instrument(skip(self))]
    pub async fn reserve_on(&self, day: NaiveDate, n: u64) -> bool {
        if n == 0 {
            return true;
        }
        if n > self.daily_budget {
            metrics::counter!("quota_reservations_total", "status" => "denied").increment(1);
            info!(
                "Reservation of {} exceeds the whole daily budget of {}",
                n, self.daily_budget
            );
            return false;
        }

        match self
            .store
            .reserve_if_available(&day_key(day), n, self.daily_budget)
            .await
        {
            Ok(true) => {
                metrics::counter!("quota_reservations_total", "status" => "granted").increment(1);
                true
            }
            Ok(false) => {
                metrics::counter!("quota_reservations_total", "status" => "denied").increment(1);
                warn!("Daily quota exhausted: {} more would exceed {}", n, self.daily_budget);
                false
            }
            Err(e) => {
                metrics::counter!("quota_reservations_total", "status" => "error").increment(1);
                error!("Quota store failure, treating as denial: {:?}", e);
                false
            }
        }
    }

    pub async fn usage(&self) -> Result<u64> {
        self.usage_on(today()).await
    }

    pub async fn usage_on(&self, day: NaiveDate) -> Result<u64> {
        self.store.usage(&day_key(day)).await
    }

    pub async fn remaining_on(&self, day: NaiveDate) -> Result<u64> {
        Ok(self.daily_budget.saturating_sub(self.usage_on(day).await?))
    }
}
