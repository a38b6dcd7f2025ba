use crate::config::rules::RuleSet;
use crate::core::errors::InsufficientHistoryError;
use crate::core::types::{MarketWindow, PredictionResult, Signal};
use crate::strategy::indicators::{self, RSI_PERIOD};

pub const TREND_WINDOW: usize = 10;
pub const MOMENTUM_LAG: usize = 4;

/// Intermediate values behind a preview, kept for logging.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScoreBreakdown {
    pub close: f64,
    pub moving_average: f64,
    pub momentum: f64,
    pub rsi: f64,
    pub vol_rank: f64,
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Preview {
    pub prediction: PredictionResult,
    pub breakdown: ScoreBreakdown,
}

/// Deterministic rule-based scorer: trend, momentum, oscillator and volatility-rank votes.
#[derive(Default, Clone)]
pub struct ClassicalScorer;

impl ClassicalScorer {
    pub fn new() -> Self {
        Self
    }

    pub fn score(
        &self,
        window: &MarketWindow,
        rules: &RuleSet,
    ) -> Result<Preview, InsufficientHistoryError> {
        let closes = &window.closes;
        let insufficient = || InsufficientHistoryError {
            required: MOMENTUM_LAG,
            available: closes.len(),
        };

        let close = *closes.last().ok_or_else(insufficient)?;
        let ma = indicators::moving_average(closes, TREND_WINDOW).ok_or_else(insufficient)?;
        let mom = indicators::momentum(closes, MOMENTUM_LAG).ok_or_else(insufficient)?;
        // Oscillator degrades to neutral on short history instead of failing
        let rsi = indicators::rsi(closes, RSI_PERIOD);
        let vol_rank =
            indicators::percentile_rank(window.volatility.current, &window.volatility.history);

        let mut score = 0.0;
        score += rules.ma_trend_weight * if close > ma { 1.0 } else { -1.0 };
        score += rules.momentum_3d_weight * if mom > 0.0 { 1.0 } else { -1.0 };

        if rsi >= rules.rsi_high {
            score -= rules.rsi_extreme_weight;
        } else if rsi <= rules.rsi_low {
            score += rules.rsi_extreme_weight;
        }

        if vol_rank >= rules.iv_rank_high {
            score -= rules.vol_rank_weight;
        } else if vol_rank <= rules.iv_rank_low {
            score += rules.vol_rank_weight;
        }

        let prediction = PredictionResult::new(Signal::from_score(score), score.abs().min(1.0));

        Ok(Preview {
            prediction,
            breakdown: ScoreBreakdown {
                close,
                moving_average: ma,
                momentum: mom,
                rsi,
                vol_rank,
                score,
            },
        })
    }
}
