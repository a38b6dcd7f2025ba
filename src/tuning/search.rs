use crate::backtest::harness::BacktestHarness;
use crate::config::config::TuningCfg;
use crate::config::rules::RuleSet;
use crate::core::types::DailyClose;
use crate::tuning::persist::persist_json;
use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Share of each range explored around the incumbent once the startup trials are done.
const LOCAL_FRACTION: f64 = 0.10;

#[derive(Debug, Clone, PartialEq)]
pub struct ParamRange {
    pub key: &'static str,
    pub low: f64,
    pub high: f64,
}

/// Bounded box over a subset of rule keys.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchSpace {
    pub ranges: Vec<ParamRange>,
}

impl Default for SearchSpace {
    fn default() -> Self {
        let weight = |key| ParamRange {
            key,
            low: -1.0,
            high: 1.0,
        };
        let angle = |key| ParamRange {
            key,
            low: 0.0,
            high: 3.14159,
        };
        Self {
            ranges: vec![
                weight("ma_trend_weight"),
                weight("rsi_extreme_weight"),
                weight("vol_rank_weight"),
                weight("momentum_3d_weight"),
                angle("angle_0"),
                angle("angle_1"),
            ],
        }
    }
}

impl SearchSpace {
    pub fn sample_uniform(&self, rng: &mut StdRng) -> BTreeMap<String, f64> {
        self.ranges
            .iter()
            .map(|r| (r.key.to_string(), rng.gen_range(r.low..=r.high)))
            .collect()
    }

    /// Uniform inside a box of `fraction` of every range around `center`, clipped to bounds.
    pub fn sample_near(
        &self,
        rng: &mut StdRng,
        center: &BTreeMap<String, f64>,
        fraction: f64,
    ) -> BTreeMap<String, f64> {
        self.ranges
            .iter()
            .map(|r| {
                let mid = center.get(r.key).copied().unwrap_or((r.low + r.high) / 2.0);
                let half = (r.high - r.low) * fraction;
                let lo = (mid - half).max(r.low);
                let hi = (mid + half).min(r.high);
                (r.key.to_string(), rng.gen_range(lo..=hi))
            })
            .collect()
    }
}

/// Rewards landing on the target hit rate, not merely a high one.
pub fn metric(hit_rate: f64, target: f64) -> f64 {
    hit_rate - (target - hit_rate).abs()
}

/// What a trial measures: the hit rate a candidate rule set achieves.
#[async_trait]
pub trait Objective: Send + Sync {
    async fn hit_rate(&self, rules: &RuleSet) -> Result<f64>;
}

/// Backtest over a fixed history.
pub struct BacktestObjective {
    harness: BacktestHarness,
    history: Vec<DailyClose>,
}

impl BacktestObjective {
    pub fn new(harness: BacktestHarness, history: Vec<DailyClose>) -> Self {
        Self { harness, history }
    }
}

#[async_trait]
impl Objective for BacktestObjective {
    async fn hit_rate(&self, rules: &RuleSet) -> Result<f64> {
        Ok(self.harness.run(&self.history, rules).await?.hit_rate)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TrialOutcome {
    Complete { hit_rate: f64, metric: f64 },
    Failed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrialRecord {
    pub number: usize,
    pub params: BTreeMap<String, f64>,
    pub outcome: TrialOutcome,
}

impl TrialRecord {
    fn metric(&self) -> Option<f64> {
        match self.outcome {
            TrialOutcome::Complete { metric, .. } => Some(metric),
            TrialOutcome::Failed(_) => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TuningOutcome {
    pub best: TrialRecord,
    /// `base` with the best trial's parameters applied.
    pub rules: RuleSet,
    pub trials: Vec<TrialRecord>,
    pub output: PathBuf,
}

/// Seeded random search over [`SearchSpace`], run one trial at a time.
pub struct Tuner {
    space: SearchSpace,
    trials: usize,
    target_hit_rate: f64,
    seed: u64,
    startup_trials: usize,
    max_failed_trials: usize,
    output: PathBuf,
}

impl Tuner {
    pub fn new(cfg: &TuningCfg) -> Self {
        Self {
            space: SearchSpace::default(),
            trials: cfg.trials,
            target_hit_rate: cfg.target_hit_rate,
            seed: cfg.seed,
            startup_trials: cfg.startup_trials,
            max_failed_trials: cfg.max_failed_trials,
            output: cfg.output.clone(),
        }
    }

    async fn evaluate(
        &self,
        objective: &dyn Objective,
        base: &RuleSet,
        params: &BTreeMap<String, f64>,
    ) -> Result<f64> {
        let rules = base.with_overrides(params)?;
        let hit_rate = objective.hit_rate(&rules).await?;
        anyhow::ensure!(
            (0.0..=1.0).contains(&hit_rate),
            "hit rate {hit_rate} out of range"
        );
        Ok(hit_rate)
    }

    /// Run every trial, then persist the best parameters to the configured output.
    ///
    /// Nothing is written unless the whole search finishes: cancellation, too many failed
    /// trials, or a search without a single completed trial all return an error first.
    #[tracing::instrument(skip_all, fields(trials = self.trials, target = self.target_hit_rate))]
    pub async fn run(
        &self,
        objective: &dyn Objective,
        base: &RuleSet,
        shutdown: &CancellationToken,
    ) -> Result<TuningOutcome> {
        let mut rng = StdRng::seed_from_u64(self.seed);
        let mut records: Vec<TrialRecord> = Vec::with_capacity(self.trials);
        let mut best: Option<usize> = None;
        let mut failed = 0usize;

        for number in 0..self.trials {
            let params = match best {
                Some(b) if number >= self.startup_trials => {
                    self.space
                        .sample_near(&mut rng, &records[b].params, LOCAL_FRACTION)
                }
                _ => self.space.sample_uniform(&mut rng),
            };

            let result = tokio::select! {
                biased;
                _ = shutdown.cancelled() => bail!("tuning cancelled after {} trials", number),
                r = self.evaluate(objective, base, &params) => r,
            };

            let outcome = match result {
                Ok(hit_rate) => {
                    let m = metric(hit_rate, self.target_hit_rate);
                    info!("Trial {}: hit rate {:.3}, metric {:.3}", number, hit_rate, m);
                    metrics::counter!("tuning_trials_total", "status" => "complete").increment(1);
                    TrialOutcome::Complete { hit_rate, metric: m }
                }
                Err(e) => {
                    failed += 1;
                    warn!("Trial {} failed: {:#}", number, e);
                    metrics::counter!("tuning_trials_total", "status" => "failed").increment(1);
                    TrialOutcome::Failed(format!("{e:#}"))
                }
            };
            records.push(TrialRecord {
                number,
                params,
                outcome,
            });

            if failed > self.max_failed_trials {
                bail!("aborting search: {} of {} trials failed", failed, number + 1);
            }

            let current = records.len() - 1;
            if let Some(m) = records[current].metric() {
                let improved = match best.and_then(|b| records[b].metric()) {
                    Some(best_metric) => m > best_metric,
                    None => true,
                };
                if improved {
                    best = Some(current);
                }
            }
        }

        let best = match best {
            Some(b) => records[b].clone(),
            None => bail!("no trial completed out of {}", self.trials),
        };
        let rules = base.with_overrides(&best.params)?;

        // searched keys only; everything else keeps following the defaults
        let persisted: BTreeMap<String, f64> = rules
            .to_map()
            .into_iter()
            .filter(|(k, _)| best.params.contains_key(k))
            .collect();
        persist_json(&self.output, &persisted)
            .with_context(|| format!("persisting best parameters to {:?}", self.output))?;
        info!(
            "Best trial {} ({:?}) written to {:?}",
            best.number, best.outcome, self.output
        );

        Ok(TuningOutcome {
            best,
            rules,
            trials: records,
            output: self.output.clone(),
        })
    }
}
