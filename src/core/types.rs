use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

// ----------- Domain messages -----------------

/// One option-like item to classify. Owned by the caller; the pipeline only reads it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FeatureRecord {
    pub spot_price: f64,
    pub strike_price: f64,
    pub volatility: f64,
    pub time_to_maturity: f64,
    pub risk_free_rate: f64,
}

/// Directional call. Serialized as `1` / `-1` on the wire.
#[derive(Clone, Debug, PartialEq, Eq, Copy, Serialize, Deserialize)]
#[serde(into = "i8", try_from = "i8")]
pub enum Signal {
    Bullish,
    Bearish,
}

impl Signal {
    /// `+1` for a non-negative score, `-1` otherwise.
    pub fn from_score(score: f64) -> Self {
        if score >= 0.0 {
            Signal::Bullish
        } else {
            Signal::Bearish
        }
    }

    pub fn as_i8(self) -> i8 {
        match self {
            Signal::Bullish => 1,
            Signal::Bearish => -1,
        }
    }
}

impl From<Signal> for i8 {
    fn from(signal: Signal) -> Self {
        signal.as_i8()
    }
}

impl TryFrom<i8> for Signal {
    type Error = String;

    fn try_from(value: i8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Signal::Bullish),
            -1 => Ok(Signal::Bearish),
            other => Err(format!("signal must be 1 or -1, got {other}")),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Copy, Serialize, Deserialize)]
pub struct PredictionResult {
    pub signal: Signal,
    pub confidence: f64, // 0.0 to 1.0, two decimals
}

impl PredictionResult {
    pub fn new(signal: Signal, confidence: f64) -> Self {
        Self {
            signal,
            confidence: round2(confidence.clamp(0.0, 1.0)),
        }
    }
}

/// Rounds to two decimals, the precision every confidence is reported at.
pub fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DailyClose {
    pub date: NaiveDate,
    pub close: f64,
}

/// Current implied volatility plus the distribution it is ranked against.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VolatilitySnapshot {
    pub current: f64,
    pub history: Vec<f64>,
}

impl Default for VolatilitySnapshot {
    fn default() -> Self {
        Self {
            current: 0.35,
            history: vec![0.25, 0.28, 0.30, 0.27, 0.33, 0.38, 0.31],
        }
    }
}

/// Everything the classical scorer looks at: recent closes (oldest first) and a vol snapshot.
#[derive(Clone, Debug, PartialEq)]
pub struct MarketWindow {
    pub closes: Vec<f64>,
    pub volatility: VolatilitySnapshot,
}

impl MarketWindow {
    pub fn new(closes: Vec<f64>, volatility: VolatilitySnapshot) -> Self {
        Self { closes, volatility }
    }

    /// Trailing `lookback` observations of a price history.
    pub fn trailing(
        history: &[DailyClose],
        lookback: usize,
        volatility: VolatilitySnapshot,
    ) -> Self {
        let start = history.len().saturating_sub(lookback);
        Self {
            closes: history[start..].iter().map(|d| d.close).collect(),
            volatility,
        }
    }
}
