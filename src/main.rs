mod backtest;
mod config;
mod core;
mod marketdata;
mod persistence;
mod quota;
mod refinement;
mod strategy;
mod tuning;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn};
use tracing_subscriber::EnvFilter;

use crate::backtest::harness::BacktestHarness;
use crate::config::config::{AppCfg, MarketSource};
use crate::config::rules::RuleSet;
use crate::core::types::{FeatureRecord, Signal};
use crate::marketdata::client::PriceHistoryClient;
use crate::marketdata::csv_file::CsvPriceHistoryClient;
use crate::marketdata::simulator::SimPriceHistoryClient;
use crate::persistence::database::Database;
use crate::quota::allocator::QuotaAllocator;
use crate::quota::store::{InMemoryQuotaStore, QuotaStore};
use crate::refinement::simulator::SimRefinementBackend;
use crate::strategy::pipeline::EscalationPipeline;
use crate::tuning::search::{BacktestObjective, TrialOutcome, Tuner};

#[derive(Parser)]
#[command(name = "signalgate")]
#[command(about = "Budget-gated directional signals with optional refinement", long_about = None)]
struct Cli {
    /// Configuration file (missing file means defaults plus environment)
    #[arg(long, global = true, default_value = "config.yml")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Classify a batch of feature records
    Predict {
        /// JSON document `{"features": [...]}`; stdin when omitted
        #[arg(short, long)]
        input: Option<PathBuf>,
    },

    /// Replay recent history and report the hit rate
    Backtest,

    /// Search rule parameters and persist the best set
    Tune {
        #[arg(long)]
        trials: Option<usize>,
        /// Target hit rate the metric is centred on
        #[arg(long)]
        target: Option<f64>,
    },
}

#[derive(Deserialize)]
struct PredictRequest {
    features: Vec<FeatureRecord>,
}

#[derive(Serialize)]
struct PredictResponse {
    predictions: Vec<Signal>,
    confidences: Vec<f64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();
    dotenv::dotenv().ok();

    let cli = Cli::parse();
    let cfg = AppCfg::load(&cli.config)?;

    let span = info_span!(
        "Signalgate",
        pid = %std::process::id(),
        version = env!("CARGO_PKG_VERSION"),
        ticker = %cfg.market.ticker,
    );
    let _enter = span.enter();

    info!("Starting up");

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Ctrl-C received, cancelling");
                shutdown.cancel();
            }
        });
    }

    info!("Initializing market data ({:?})", cfg.market.source);
    let market: Arc<dyn PriceHistoryClient> = match cfg.market.source {
        MarketSource::Sim => Arc::new(SimPriceHistoryClient::new(
            cfg.market.seed,
            cfg.market.anchor_price,
            cfg.market.drift,
            cfg.market.daily_vol,
        )),
        MarketSource::Csv => {
            let path = cfg
                .market
                .csv_path
                .clone()
                .context("market.csv_path required when market.source = csv")?;
            Arc::new(CsvPriceHistoryClient::new(path))
        }
    };

    let store: Arc<dyn QuotaStore> = match &cfg.quota.database_url {
        Some(url) => {
            info!("Initializing Database");
            Arc::new(Database::new(url).await?)
        }
        None => {
            warn!("No quota.database_url, quota is tracked in-process only");
            Arc::new(InMemoryQuotaStore::new())
        }
    };
    let quota = QuotaAllocator::new(store, cfg.quota.daily_budget);
    info!("Quota budget: {} samples per UTC day", quota.daily_budget());

    let backend = Arc::new(SimRefinementBackend::new(
        cfg.backend.samples_per_item,
        cfg.backend.latency,
    ));
    let pipeline = EscalationPipeline::new(
        &cfg.pipeline,
        quota,
        backend,
        market.clone(),
        cfg.market.volatility.clone(),
    );
    let rules = RuleSet::load_or_default(&cfg.rules.override_sources);
    info!("Rule parameters: {:?}", rules.to_map());

    match cli.command {
        Commands::Predict { input } => {
            let text = match input {
                Some(path) => std::fs::read_to_string(&path)
                    .with_context(|| format!("reading {:?}", path))?,
                None => {
                    let mut buf = String::new();
                    std::io::stdin()
                        .read_to_string(&mut buf)
                        .context("reading stdin")?;
                    buf
                }
            };
            let request: PredictRequest =
                serde_json::from_str(&text).context("parsing predict request")?;

            let results = pipeline.predict_batch(&request.features, &rules).await?;
            let response = PredictResponse {
                predictions: results.iter().map(|r| r.signal).collect(),
                confidences: results.iter().map(|r| r.confidence).collect(),
            };
            println!("{}", serde_json::to_string(&response)?);
        }
        Commands::Backtest => {
            let history = market.fetch_recent(cfg.backtest.window_days).await?;
            let harness =
                BacktestHarness::new(pipeline, cfg.backtest.clone(), cfg.quota.daily_budget);
            let report = harness.run(&history, &rules).await?;
            println!(
                "{}",
                serde_json::json!({ "rows": report.rows.len(), "hit_rate": report.hit_rate })
            );
        }
        Commands::Tune { trials, target } => {
            let mut tuning = cfg.tuning.clone();
            if let Some(n) = trials {
                tuning.trials = n;
            }
            if let Some(t) = target {
                tuning.target_hit_rate = t;
            }
            anyhow::ensure!(tuning.trials > 0, "--trials must be > 0");

            let history = market.fetch_recent(tuning.window_days).await?;
            let harness =
                BacktestHarness::new(pipeline, cfg.backtest.clone(), cfg.quota.daily_budget);
            let objective = BacktestObjective::new(harness, history);

            let outcome = Tuner::new(&tuning)
                .run(&objective, &rules, &shutdown)
                .await?;
            let completed = outcome
                .trials
                .iter()
                .filter(|t| matches!(t.outcome, TrialOutcome::Complete { .. }))
                .count();
            info!(
                "Tuning finished: {} of {} trials completed, best trial {} written to {:?}",
                completed,
                outcome.trials.len(),
                outcome.best.number,
                outcome.output
            );
            println!("{}", serde_json::to_string_pretty(&outcome.rules.to_map())?);
        }
    }

    info!("Exit");
    Ok(())
}
