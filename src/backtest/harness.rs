use crate::config::config::BacktestCfg;
use crate::config::rules::RuleSet;
use crate::core::errors::InsufficientHistoryError;
use crate::core::types::{DailyClose, FeatureRecord, MarketWindow, Signal};
use crate::quota::allocator::QuotaAllocator;
use crate::strategy::pipeline::EscalationPipeline;
use anyhow::Result;
use chrono::NaiveDate;
use serde::Serialize;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BacktestRow {
    pub date: NaiveDate,
    /// Relative change from this close to the close `horizon_days` rows later.
    pub realized_return: f64,
    pub signal: Signal,
}

#[derive(Debug, Clone, Serialize)]
pub struct BacktestReport {
    pub rows: Vec<BacktestRow>,
    pub hit_rate: f64,
}

/// Fraction of rows whose signal matches the sign of the realized return.
/// A flat return is a miss for either signal.
pub fn hit_rate(rows: &[BacktestRow]) -> f64 {
    if rows.is_empty() {
        return 0.0;
    }
    let hits = rows
        .iter()
        .filter(|r| match r.signal {
            Signal::Bullish => r.realized_return > 0.0,
            Signal::Bearish => r.realized_return < 0.0,
        })
        .count();
    hits as f64 / rows.len() as f64
}

/// Replays a price history through the escalation pipeline, one synthetic record per date.
#[derive(Clone)]
pub struct BacktestHarness {
    pipeline: EscalationPipeline,
    cfg: BacktestCfg,
    daily_budget: u64,
}

impl BacktestHarness {
    /// Every run draws from its own in-memory counter holding `daily_budget` samples.
    pub fn new(pipeline: EscalationPipeline, cfg: BacktestCfg, daily_budget: u64) -> Self {
        Self {
            pipeline,
            cfg,
            daily_budget,
        }
    }

    fn synthetic_record(&self, close: f64) -> FeatureRecord {
        FeatureRecord {
            spot_price: close,
            strike_price: close * (1.0 + self.cfg.strike_offset),
            volatility: self.cfg.stub_volatility,
            time_to_maturity: self.cfg.horizon_days as f64 / 365.0,
            risk_free_rate: self.cfg.risk_free_rate,
        }
    }

    #[tracing::instrument(skip_all, fields(days = history.len()))]
    pub async fn replay(
        &self,
        history: &[DailyClose],
        rules: &RuleSet,
    ) -> Result<Vec<BacktestRow>> {
        let horizon = self.cfg.horizon_days;
        if history.len() < horizon + 1 {
            return Err(InsufficientHistoryError {
                required: horizon + 1,
                available: history.len(),
            }
            .into());
        }

        let pipeline = self
            .pipeline
            .with_quota(QuotaAllocator::in_memory(self.daily_budget));
        let window = MarketWindow::trailing(
            history,
            pipeline.lookback_days(),
            pipeline.volatility().clone(),
        );

        let mut rows = Vec::with_capacity(history.len() - horizon);
        for (i, today) in history[..history.len() - horizon].iter().enumerate() {
            let ahead = &history[i + horizon];
            let record = self.synthetic_record(today.close);
            let predictions = pipeline
                .predict_batch_with_window(std::slice::from_ref(&record), &window, rules)
                .await?;
            let signal = predictions
                .first()
                .map(|p| p.signal)
                .ok_or_else(|| anyhow::anyhow!("pipeline returned no prediction for {}", today.date))?;

            rows.push(BacktestRow {
                date: today.date,
                realized_return: (ahead.close - today.close) / today.close,
                signal,
            });
        }

        Ok(rows)
    }

    pub async fn run(&self, history: &[DailyClose], rules: &RuleSet) -> Result<BacktestReport> {
        let rows = self.replay(history, rules).await?;
        let hit_rate = hit_rate(&rows);
        info!("Backtest over {} rows: hit rate {:.3}", rows.len(), hit_rate);
        Ok(BacktestReport { rows, hit_rate })
    }
}
