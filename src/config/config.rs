use crate::core::types::VolatilitySnapshot;
use anyhow::{Context, Result};
use config::{Config, File};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppCfg {
    #[serde(default)]
    pub pipeline: PipelineCfg,
    #[serde(default)]
    pub quota: QuotaCfg,
    #[serde(default)]
    pub backend: BackendCfg,
    #[serde(default)]
    pub market: MarketCfg,
    #[serde(default)]
    pub rules: RulesCfg,
    #[serde(default)]
    pub backtest: BacktestCfg,
    #[serde(default)]
    pub tuning: TuningCfg,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineCfg {
    #[serde(default = "default_escalation_threshold")]
    pub escalation_threshold: f64,
    #[serde(default = "default_lookback_days")]
    pub lookback_days: usize,
    #[serde(with = "humantime_serde", default = "default_backend_timeout")]
    pub backend_timeout: Duration,
}

impl Default for PipelineCfg {
    fn default() -> Self {
        Self {
            escalation_threshold: default_escalation_threshold(),
            lookback_days: default_lookback_days(),
            backend_timeout: default_backend_timeout(),
        }
    }
}
fn default_escalation_threshold() -> f64 {
    0.75
}
fn default_lookback_days() -> usize {
    20
}
fn default_backend_timeout() -> Duration {
    Duration::from_secs(5)
}

#[derive(Debug, Deserialize, Clone)]
pub struct QuotaCfg {
    #[serde(default = "default_daily_budget")]
    pub daily_budget: u64,
    /// When set, the daily counter lives in Postgres and is shared across processes.
    #[serde(default)]
    pub database_url: Option<String>,
}

impl Default for QuotaCfg {
    fn default() -> Self {
        Self {
            daily_budget: default_daily_budget(),
            database_url: None,
        }
    }
}
fn default_daily_budget() -> u64 {
    2_500
}

#[derive(Debug, Deserialize, Clone)]
pub struct BackendCfg {
    #[serde(default = "default_samples_per_item")]
    pub samples_per_item: u32,
    #[serde(with = "humantime_serde", default = "default_latency")]
    pub latency: Duration,
}

impl Default for BackendCfg {
    fn default() -> Self {
        Self {
            samples_per_item: default_samples_per_item(),
            latency: default_latency(),
        }
    }
}
fn default_samples_per_item() -> u32 {
    100
}
fn default_latency() -> Duration {
    Duration::from_millis(2)
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum MarketSource {
    #[default]
    Sim,
    Csv,
}

#[derive(Debug, Deserialize, Clone)]
pub struct MarketCfg {
    #[serde(default)]
    pub source: MarketSource,
    #[serde(default)]
    pub csv_path: Option<PathBuf>,
    #[serde(default = "default_ticker")]
    pub ticker: String,
    #[serde(default = "default_market_seed")]
    pub seed: u64,
    #[serde(default = "default_anchor_price")]
    pub anchor_price: f64,
    #[serde(default = "default_drift")]
    pub drift: f64,
    #[serde(default = "default_daily_vol")]
    pub daily_vol: f64,
    #[serde(default)]
    pub volatility: VolatilitySnapshot,
}

impl Default for MarketCfg {
    fn default() -> Self {
        Self {
            source: MarketSource::default(),
            csv_path: None,
            ticker: default_ticker(),
            seed: default_market_seed(),
            anchor_price: default_anchor_price(),
            drift: default_drift(),
            daily_vol: default_daily_vol(),
            volatility: VolatilitySnapshot::default(),
        }
    }
}
fn default_ticker() -> String {
    "AAPL".into()
}
fn default_market_seed() -> u64 {
    42
}
fn default_anchor_price() -> f64 {
    180.0
}
fn default_drift() -> f64 {
    0.0003
}
fn default_daily_vol() -> f64 {
    0.015
}

#[derive(Debug, Deserialize, Clone)]
pub struct RulesCfg {
    /// Probed in order; the first one that exists wins.
    #[serde(default = "default_override_sources")]
    pub override_sources: Vec<PathBuf>,
}

impl Default for RulesCfg {
    fn default() -> Self {
        Self {
            override_sources: default_override_sources(),
        }
    }
}
fn default_override_sources() -> Vec<PathBuf> {
    vec![PathBuf::from("best_params.json"), PathBuf::from("rules.json")]
}

#[derive(Debug, Deserialize, Clone)]
pub struct BacktestCfg {
    #[serde(default = "default_horizon_days")]
    pub horizon_days: usize,
    #[serde(default = "default_backtest_window")]
    pub window_days: usize,
    #[serde(default = "default_strike_offset")]
    pub strike_offset: f64,
    #[serde(default = "default_stub_volatility")]
    pub stub_volatility: f64,
    #[serde(default = "default_risk_free_rate")]
    pub risk_free_rate: f64,
}

impl Default for BacktestCfg {
    fn default() -> Self {
        Self {
            horizon_days: default_horizon_days(),
            window_days: default_backtest_window(),
            strike_offset: default_strike_offset(),
            stub_volatility: default_stub_volatility(),
            risk_free_rate: default_risk_free_rate(),
        }
    }
}
fn default_horizon_days() -> usize {
    7
}
fn default_backtest_window() -> usize {
    252
}
fn default_strike_offset() -> f64 {
    0.05
}
fn default_stub_volatility() -> f64 {
    0.25
}
fn default_risk_free_rate() -> f64 {
    0.03
}

#[derive(Debug, Deserialize, Clone)]
pub struct TuningCfg {
    #[serde(default = "default_trials")]
    pub trials: usize,
    #[serde(default = "default_target_hit_rate")]
    pub target_hit_rate: f64,
    #[serde(default = "default_tuning_window")]
    pub window_days: usize,
    #[serde(default = "default_tuning_seed")]
    pub seed: u64,
    #[serde(default = "default_startup_trials")]
    pub startup_trials: usize,
    #[serde(default = "default_max_failed_trials")]
    pub max_failed_trials: usize,
    #[serde(default = "default_tuning_output")]
    pub output: PathBuf,
}

impl Default for TuningCfg {
    fn default() -> Self {
        Self {
            trials: default_trials(),
            target_hit_rate: default_target_hit_rate(),
            window_days: default_tuning_window(),
            seed: default_tuning_seed(),
            startup_trials: default_startup_trials(),
            max_failed_trials: default_max_failed_trials(),
            output: default_tuning_output(),
        }
    }
}
fn default_trials() -> usize {
    50
}
fn default_target_hit_rate() -> f64 {
    0.10
}
fn default_tuning_window() -> usize {
    63
}
fn default_tuning_seed() -> u64 {
    7
}
fn default_startup_trials() -> usize {
    10
}
fn default_max_failed_trials() -> usize {
    10
}
fn default_tuning_output() -> PathBuf {
    PathBuf::from("best_params.json")
}

impl AppCfg {
    pub fn load(path: &str) -> Result<Self> {
        let cfg = Config::builder()
            .add_source(File::with_name(path).required(false))
            .add_source(config::Environment::default().separator("__"))
            .build()
            .context("building config")?;

        let app: AppCfg = cfg.try_deserialize().context("deserializing config")?;
        app.validate()?;
        Ok(app)
    }

    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            (0.0..=1.0).contains(&self.pipeline.escalation_threshold),
            "pipeline.escalation_threshold must be within [0, 1]"
        );
        anyhow::ensure!(
            self.pipeline.lookback_days >= 4,
            "pipeline.lookback_days must be >= 4"
        );
        anyhow::ensure!(
            self.backend.samples_per_item > 0,
            "backend.samples_per_item must be > 0"
        );
        anyhow::ensure!(
            self.market.source != MarketSource::Csv || self.market.csv_path.is_some(),
            "market.csv_path required when market.source = csv"
        );
        anyhow::ensure!(
            self.backtest.horizon_days > 0,
            "backtest.horizon_days must be > 0"
        );
        anyhow::ensure!(
            self.backtest.window_days > self.backtest.horizon_days,
            "backtest.window_days must exceed backtest.horizon_days"
        );
        anyhow::ensure!(
            self.tuning.window_days > self.backtest.horizon_days,
            "tuning.window_days must exceed backtest.horizon_days"
        );
        anyhow::ensure!(self.tuning.trials > 0, "tuning.trials must be > 0");
        anyhow::ensure!(
            !self.rules.override_sources.is_empty(),
            "rules.override_sources must not be empty"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::io::Write;

    #[test]
    fn test_env_var_override() {
        // Set environment variable
        unsafe {
            env::set_var("QUOTA__DATABASE_URL", "postgres://env-user@localhost/quota");
        }

        // Test that config::Environment picks it up
        let cfg = Config::builder()
            .add_source(config::Environment::default().separator("__"))
            .build()
            .unwrap();

        let val = cfg.get_string("quota.database_url").unwrap();
        assert_eq!(val, "postgres://env-user@localhost/quota");

        unsafe {
            env::remove_var("QUOTA__DATABASE_URL");
        }
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let cfg = AppCfg::load("definitely-not-here.yml").unwrap();
        assert_eq!(cfg.quota.daily_budget, 2_500);
        assert_eq!(cfg.backend.samples_per_item, 100);
        assert_eq!(cfg.pipeline.escalation_threshold, 0.75);
        assert_eq!(cfg.pipeline.backend_timeout, Duration::from_secs(5));
        assert_eq!(cfg.backtest.horizon_days, 7);
        assert_eq!(
            cfg.rules.override_sources,
            vec![PathBuf::from("best_params.json"), PathBuf::from("rules.json")]
        );
    }

    #[test]
    fn test_yaml_sections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.yml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(
            f,
            "pipeline:\n  backend_timeout: 250ms\nquota:\n  daily_budget: 1000\nmarket:\n  source: csv\n  csv_path: prices.csv\n"
        )
        .unwrap();

        let cfg = AppCfg::load(path.to_str().unwrap()).unwrap();
        assert_eq!(cfg.pipeline.backend_timeout, Duration::from_millis(250));
        assert_eq!(cfg.quota.daily_budget, 1000);
        assert_eq!(cfg.market.source, MarketSource::Csv);
        assert_eq!(cfg.market.csv_path, Some(PathBuf::from("prices.csv")));
    }

    #[test]
    fn test_validate_rejects_csv_without_path() {
        let mut cfg = AppCfg::default();
        cfg.market.source = MarketSource::Csv;
        assert!(cfg.validate().is_err());
    }
}
