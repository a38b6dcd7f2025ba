use crate::config::config::PipelineCfg;
use crate::config::rules::RuleSet;
use crate::core::errors::BackendError;
use crate::core::types::{FeatureRecord, MarketWindow, PredictionResult, Signal, VolatilitySnapshot};
use crate::marketdata::client::PriceHistoryClient;
use crate::quota::allocator::QuotaAllocator;
use crate::refinement::client::{OutcomeHistogram, RefinementBackend, RefinementDescriptor};
use crate::strategy::scoring::ClassicalScorer;
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Classical preview -> threshold filter -> quota reservation -> backend call -> fusion.
///
/// Clones share the quota counter, backend and market source.
#[derive(Clone)]
pub struct EscalationPipeline {
    scorer: ClassicalScorer,
    quota: QuotaAllocator,
    backend: Arc<dyn RefinementBackend>,
    market: Arc<dyn PriceHistoryClient>,
    volatility: VolatilitySnapshot,
    escalation_threshold: f64,
    lookback_days: usize,
    backend_timeout: Duration,
}

impl EscalationPipeline {
    pub fn new(
        cfg: &PipelineCfg,
        quota: QuotaAllocator,
        backend: Arc<dyn RefinementBackend>,
        market: Arc<dyn PriceHistoryClient>,
        volatility: VolatilitySnapshot,
    ) -> Self {
        Self {
            scorer: ClassicalScorer::new(),
            quota,
            backend,
            market,
            volatility,
            escalation_threshold: cfg.escalation_threshold,
            lookback_days: cfg.lookback_days,
            backend_timeout: cfg.backend_timeout,
        }
    }

    /// Same pipeline drawing from a different quota counter.
    pub fn with_quota(&self, quota: QuotaAllocator) -> Self {
        Self {
            quota,
            ..self.clone()
        }
    }

    pub fn lookback_days(&self) -> usize {
        self.lookback_days
    }

    pub fn volatility(&self) -> &VolatilitySnapshot {
        &self.volatility
    }

    /// Predict a batch against the current market window from the price source.
    pub async fn predict_batch(
        &self,
        records: &[FeatureRecord],
        rules: &RuleSet,
    ) -> Result<Vec<PredictionResult>> {
        if records.is_empty() {
            return Ok(Vec::new());
        }
        let history = self
            .market
            .fetch_recent(self.lookback_days)
            .await
            .context("fetching preview window")?;
        let window = MarketWindow::trailing(&history, self.lookback_days, self.volatility.clone());
        self.predict_batch_with_window(records, &window, rules).await
    }

    /// Predict a batch against an explicit market window.
    ///
    /// One preview is computed for the window and broadcast to every record; only escalated
    /// records can end up with a different answer. Output order and length match `records`.
    #[tracing::instrument(skip_all, fields(batch = records.len()))]
    pub async fn predict_batch_with_window(
        &self,
        records: &[FeatureRecord],
        window: &MarketWindow,
        rules: &RuleSet,
    ) -> Result<Vec<PredictionResult>> {
        if records.is_empty() {
            return Ok(Vec::new());
        }

        // 1. Preview
        let preview = self.scorer.score(window, rules)?;
        debug!(breakdown = ?preview.breakdown, "classical preview");
        let mut results = vec![preview.prediction; records.len()];

        // 2. Selection
        let selected: Vec<usize> = results
            .iter()
            .enumerate()
            .filter(|(_, r)| r.confidence >= self.escalation_threshold)
            .map(|(i, _)| i)
            .collect();
        if selected.is_empty() {
            return Ok(results);
        }

        // 3. Budget
        let needed = selected.len() as u64 * u64::from(self.backend.samples_per_item());
        if !self.quota.reserve(needed).await {
            info!(
                "Escalation of {} items ({} samples) denied by quota, keeping preview",
                selected.len(),
                needed
            );
            return Ok(results);
        }
        metrics::counter!("pipeline_escalated_items_total").increment(selected.len() as u64);

        // 4. Refinement
        match self.refine(records, &selected, rules).await {
            Ok(hists) => {
                for (&i, hist) in selected.iter().zip(&hists) {
                    results[i] = fuse(hist);
                }
            }
            Err(e) => {
                // reserved samples are not refunded
                warn!("Refinement failed, keeping preview for {} items: {}", selected.len(), e);
            }
        }

        Ok(results)
    }

    async fn refine(
        &self,
        records: &[FeatureRecord],
        selected: &[usize],
        rules: &RuleSet,
    ) -> Result<Vec<OutcomeHistogram>, BackendError> {
        let descriptors = selected
            .iter()
            .map(|&i| RefinementDescriptor::encode(&records[i], rules))
            .collect::<Result<Vec<_>, _>>()?;

        let submitted = tokio::time::timeout(self.backend_timeout, self.backend.submit(&descriptors));
        let outcome = match submitted.await {
            Ok(Ok(hists)) if hists.len() == descriptors.len() => Ok(hists),
            Ok(Ok(hists)) => Err(BackendError::ShapeMismatch {
                expected: descriptors.len(),
                got: hists.len(),
            }),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(BackendError::Timeout(self.backend_timeout)),
        };

        let status = if outcome.is_ok() { "success" } else { "error" };
        metrics::counter!("refinement_calls_total", "status" => status).increment(1);
        outcome
    }
}

/// Turn a histogram into a signal and a distance-from-coin-flip confidence.
pub fn fuse(hist: &OutcomeHistogram) -> PredictionResult {
    let p_up = hist.p_up();
    let signal = if p_up >= 0.5 {
        Signal::Bullish
    } else {
        Signal::Bearish
    };
    PredictionResult::new(signal, (p_up - 0.5).abs() * 2.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::DailyClose;
    use crate::refinement::simulator::SimRefinementBackend;
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use std::sync::atomic::{AtomicUsize, Ordering};

    // ---------- test doubles ----------

    struct FixedHistory(Vec<f64>);

    #[async_trait]
    impl PriceHistoryClient for FixedHistory {
        async fn fetch_recent(&self, days: usize) -> Result<Vec<DailyClose>> {
            let start = self.0.len().saturating_sub(days);
            Ok(self.0[start..]
                .iter()
                .enumerate()
                .map(|(i, c)| DailyClose {
                    date: NaiveDate::from_ymd_opt(2025, 1, 1).unwrap() + chrono::Days::new(i as u64),
                    close: *c,
                })
                .collect())
        }

        async fn fetch_range(&self, _: NaiveDate, _: NaiveDate) -> Result<Vec<DailyClose>> {
            self.fetch_recent(self.0.len()).await
        }
    }

    /// Returns a scripted histogram per item and counts calls.
    struct ScriptedBackend {
        hist: OutcomeHistogram,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl RefinementBackend for ScriptedBackend {
        fn samples_per_item(&self) -> u32 {
            100
        }
        async fn submit(
            &self,
            descriptors: &[RefinementDescriptor],
        ) -> Result<Vec<OutcomeHistogram>, BackendError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![self.hist; descriptors.len()])
        }
    }

    struct FailingBackend;

    #[async_trait]
    impl RefinementBackend for FailingBackend {
        fn samples_per_item(&self) -> u32 {
            100
        }
        async fn submit(
            &self,
            _: &[RefinementDescriptor],
        ) -> Result<Vec<OutcomeHistogram>, BackendError> {
            Err(BackendError::Unavailable("device offline".into()))
        }
    }

    struct SlowBackend;

    #[async_trait]
    impl RefinementBackend for SlowBackend {
        fn samples_per_item(&self) -> u32 {
            100
        }
        async fn submit(
            &self,
            d: &[RefinementDescriptor],
        ) -> Result<Vec<OutcomeHistogram>, BackendError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(vec![OutcomeHistogram::default(); d.len()])
        }
    }

    struct ShortBackend;

    #[async_trait]
    impl RefinementBackend for ShortBackend {
        fn samples_per_item(&self) -> u32 {
            100
        }
        async fn submit(
            &self,
            _: &[RefinementDescriptor],
        ) -> Result<Vec<OutcomeHistogram>, BackendError> {
            Ok(vec![OutcomeHistogram { ones: 100, zeros: 0 }])
        }
    }

    // ---------- fixtures ----------

    fn rising() -> Vec<f64> {
        (0..20).map(|i| 100.0 + i as f64).collect()
    }

    /// On a rising series only the trend vote survives: the preview is Bullish with
    /// confidence equal to `trend`.
    fn trend_only(trend: f64) -> RuleSet {
        RuleSet {
            ma_trend_weight: trend,
            momentum_3d_weight: 0.0,
            rsi_extreme_weight: 0.0,
            vol_rank_weight: 0.0,
            ..RuleSet::default()
        }
    }

    fn record(spot: f64) -> FeatureRecord {
        FeatureRecord {
            spot_price: spot,
            strike_price: 100.0,
            volatility: 0.25,
            time_to_maturity: 7.0 / 365.0,
            risk_free_rate: 0.03,
        }
    }

    fn pipeline(quota: QuotaAllocator, backend: Arc<dyn RefinementBackend>) -> EscalationPipeline {
        let cfg = PipelineCfg {
            backend_timeout: Duration::from_millis(200),
            ..PipelineCfg::default()
        };
        EscalationPipeline::new(
            &cfg,
            quota,
            backend,
            Arc::new(FixedHistory(rising())),
            VolatilitySnapshot::default(),
        )
    }

    fn scripted(ones: u32, zeros: u32) -> Arc<ScriptedBackend> {
        Arc::new(ScriptedBackend {
            hist: OutcomeHistogram { ones, zeros },
            calls: AtomicUsize::new(0),
        })
    }

    // ---------- scenarios ----------

    #[tokio::test]
    async fn test_empty_batch() {
        let quota = QuotaAllocator::in_memory(2_500);
        let p = pipeline(quota.clone(), scripted(80, 20));
        let out = p.predict_batch(&[], &trend_only(0.9)).await.unwrap();
        assert!(out.is_empty());
        assert_eq!(quota.usage().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_below_threshold_returns_preview_untouched() {
        let quota = QuotaAllocator::in_memory(2_500);
        let backend = scripted(80, 20);
        let p = pipeline(quota.clone(), backend.clone());

        let records = vec![record(105.0); 5];
        let out = p.predict_batch(&records, &trend_only(0.42)).await.unwrap();

        assert_eq!(out.len(), 5);
        for r in &out {
            assert_eq!(r.signal, Signal::Bullish);
            assert_eq!(r.confidence, 0.42);
        }
        assert_eq!(quota.usage().await.unwrap(), 0);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_denied_reservation_falls_back() {
        // 250 samples left today; 3 items x 100 samples does not fit
        let quota = QuotaAllocator::in_memory(250);
        let backend = scripted(10, 90);
        let p = pipeline(quota.clone(), backend.clone());

        let records = vec![record(105.0); 3];
        let out = p.predict_batch(&records, &trend_only(0.9)).await.unwrap();

        assert!(out.iter().all(|r| r.signal == Signal::Bullish && r.confidence == 0.9));
        assert_eq!(quota.usage().await.unwrap(), 0);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_partially_spent_budget_denies_escalation() {
        let quota = QuotaAllocator::in_memory(2_500);
        assert!(quota.reserve(2_250).await);
        let backend = scripted(10, 90);
        let p = pipeline(quota.clone(), backend.clone());

        let out = p
            .predict_batch(&vec![record(105.0); 3], &trend_only(0.9))
            .await
            .unwrap();
        assert!(out.iter().all(|r| r.confidence == 0.9));
        assert_eq!(quota.usage().await.unwrap(), 2_250);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_granted_reservation_refines_every_item() {
        let quota = QuotaAllocator::in_memory(1_000);
        // p_up = 0.1 -> Bearish, confidence 0.8
        let backend = scripted(10, 90);
        let p = pipeline(quota.clone(), backend.clone());

        let records = vec![record(95.0), record(105.0), record(110.0)];
        let out = p.predict_batch(&records, &trend_only(0.9)).await.unwrap();

        assert_eq!(out.len(), 3);
        for r in &out {
            assert_eq!(r.signal, Signal::Bearish);
            assert_eq!(r.confidence, 0.8);
        }
        assert_eq!(quota.usage().await.unwrap(), 300);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_refinement_with_simulated_backend_is_per_item_and_ordered() {
        let quota = QuotaAllocator::in_memory(1_000);
        let backend = Arc::new(SimRefinementBackend::new(100, Duration::ZERO));
        let p = pipeline(quota.clone(), backend.clone());
        let rules = trend_only(0.9);

        // theta ~ 0 (at the money), theta = pi (deep in the money)
        let records = vec![record(100.0), record(200.0)];
        let out = p.predict_batch(&records, &rules).await.unwrap();

        let expected: Vec<PredictionResult> = records
            .iter()
            .map(|r| {
                let d = RefinementDescriptor::encode(r, &rules).unwrap();
                fuse(&backend.run_one(&d).unwrap())
            })
            .collect();
        assert_eq!(out, expected);
        assert_eq!(out[0].signal, Signal::Bearish);
        assert_eq!(out[1].signal, Signal::Bullish);
        assert_eq!(quota.usage().await.unwrap(), 200);
    }

    #[tokio::test]
    async fn test_backend_failure_keeps_preview_and_consumes_quota() {
        let quota = QuotaAllocator::in_memory(1_000);
        let p = pipeline(quota.clone(), Arc::new(FailingBackend));

        let out = p
            .predict_batch(&vec![record(105.0); 2], &trend_only(0.9))
            .await
            .unwrap();
        assert!(out.iter().all(|r| r.confidence == 0.9 && r.signal == Signal::Bullish));
        assert_eq!(quota.usage().await.unwrap(), 200);
    }

    #[tokio::test]
    async fn test_backend_timeout_keeps_preview() {
        let quota = QuotaAllocator::in_memory(1_000);
        let p = pipeline(quota, Arc::new(SlowBackend));

        let out = p
            .predict_batch(&[record(105.0)], &trend_only(0.9))
            .await
            .unwrap();
        assert_eq!(out, vec![PredictionResult::new(Signal::Bullish, 0.9)]);
    }

    #[tokio::test]
    async fn test_short_backend_answer_is_rejected() {
        let quota = QuotaAllocator::in_memory(1_000);
        let p = pipeline(quota, Arc::new(ShortBackend));

        let out = p
            .predict_batch(&vec![record(105.0); 3], &trend_only(0.9))
            .await
            .unwrap();
        assert!(out.iter().all(|r| r.confidence == 0.9));
    }

    #[tokio::test]
    async fn test_unencodable_record_falls_back() {
        let quota = QuotaAllocator::in_memory(1_000);
        let backend = scripted(100, 0);
        let p = pipeline(quota, backend.clone());

        let mut bad = record(105.0);
        bad.strike_price = 0.0;
        let out = p
            .predict_batch(&[record(105.0), bad], &trend_only(0.9))
            .await
            .unwrap();
        assert_eq!(out.len(), 2);
        assert!(out.iter().all(|r| r.confidence == 0.9));
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_extreme_moneyness_falls_back_to_preview() {
        let quota = QuotaAllocator::in_memory(1_000);
        let p = pipeline(
            quota.clone(),
            Arc::new(SimRefinementBackend::new(100, Duration::ZERO)),
        );

        let mut extreme = record(1e300);
        extreme.strike_price = 1e-10;
        let out = p
            .predict_batch(&[extreme, record(105.0)], &trend_only(0.9))
            .await
            .unwrap();

        assert_eq!(out, vec![PredictionResult::new(Signal::Bullish, 0.9); 2]);
        assert_eq!(quota.usage().await.unwrap(), 200);
    }

    #[tokio::test]
    async fn test_length_preserved_for_various_sizes() {
        let p = pipeline(QuotaAllocator::in_memory(100_000), scripted(60, 40));
        for n in [0usize, 1, 7, 64] {
            let records: Vec<FeatureRecord> = (0..n).map(|i| record(90.0 + i as f64)).collect();
            for rules in [trend_only(0.2), trend_only(0.95)] {
                let out = p.predict_batch(&records, &rules).await.unwrap();
                assert_eq!(out.len(), n);
            }
        }
    }

    #[tokio::test]
    async fn test_insufficient_window_is_an_error() {
        let p = pipeline(QuotaAllocator::in_memory(1_000), scripted(60, 40));
        let window = MarketWindow::new(vec![100.0, 101.0], VolatilitySnapshot::default());
        assert!(p
            .predict_batch_with_window(&[record(100.0)], &window, &RuleSet::default())
            .await
            .is_err());
    }

    #[test]
    fn test_fuse() {
        let p = fuse(&OutcomeHistogram { ones: 50, zeros: 50 });
        assert_eq!((p.signal, p.confidence), (Signal::Bullish, 0.0));
        let p = fuse(&OutcomeHistogram { ones: 0, zeros: 0 });
        assert_eq!((p.signal, p.confidence), (Signal::Bearish, 1.0));
        let p = fuse(&OutcomeHistogram { ones: 87, zeros: 13 });
        assert_eq!((p.signal, p.confidence), (Signal::Bullish, 0.74));
    }
}
