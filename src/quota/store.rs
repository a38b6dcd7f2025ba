use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::Mutex;

/// Day-keyed usage counters with a single fused check-and-commit primitive.
#[async_trait]
pub trait QuotaStore: Send + Sync + 'static {
    /// Atomically add `amount` to the counter for `day` if the result stays within `budget`.
    /// Returns whether the amount was committed; a denial leaves the counter untouched.
    async fn reserve_if_available(&self, day: &str, amount: u64, budget: u64) -> Result<bool>;

    /// Current usage for `day` (zero for a day never touched).
    async fn usage(&self, day: &str) -> Result<u64>;
}

/// Process-local store. The mutex covers the whole read-modify-write.
#[derive(Default)]
pub struct InMemoryQuotaStore {
    used: Mutex<HashMap<String, u64>>,
}

impl InMemoryQuotaStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QuotaStore for InMemoryQuotaStore {
    async fn reserve_if_available(&self, day: &str, amount: u64, budget: u64) -> Result<bool> {
        let mut used = self.used.lock().await;
        let current = used.get(day).copied().unwrap_or(0);
        match current.checked_add(amount) {
            Some(next) if next <= budget => {
                used.insert(day.to_string(), next);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn usage(&self, day: &str) -> Result<u64> {
        Ok(self.used.lock().await.get(day).copied().unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_reserve_and_deny() {
        let store = InMemoryQuotaStore::new();
        assert!(store.reserve_if_available("2025-01-01", 200, 250).await.unwrap());
        assert!(!store.reserve_if_available("2025-01-01", 100, 250).await.unwrap());
        assert_eq!(store.usage("2025-01-01").await.unwrap(), 200);
        assert!(store.reserve_if_available("2025-01-01", 50, 250).await.unwrap());
        assert_eq!(store.usage("2025-01-01").await.unwrap(), 250);
    }

    #[tokio::test]
    async fn test_days_are_independent() {
        let store = InMemoryQuotaStore::new();
        assert!(store.reserve_if_available("2025-01-01", 250, 250).await.unwrap());
        assert!(store.reserve_if_available("2025-01-02", 250, 250).await.unwrap());
        assert_eq!(store.usage("2025-01-03").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_overflow_is_denied() {
        let store = InMemoryQuotaStore::new();
        assert!(store.reserve_if_available("d", 10, u64::MAX).await.unwrap());
        assert!(!store.reserve_if_available("d", u64::MAX, u64::MAX).await.unwrap());
        assert_eq!(store.usage("d").await.unwrap(), 10);
    }
}
