//! Plain indicator math over a chronological close series.

pub const RSI_PERIOD: usize = 14;
pub const RSI_NEUTRAL: f64 = 50.0;

/// Mean of the last `window` closes (all of them if fewer).
pub fn moving_average(closes: &[f64], window: usize) -> Option<f64> {
    if closes.is_empty() || window == 0 {
        return None;
    }
    let tail = &closes[closes.len().saturating_sub(window)..];
    Some(tail.iter().sum::<f64>() / tail.len() as f64)
}

/// Relative change of the last close versus the `lag`-th observation from the end.
///
/// `lag = 4` compares against `closes[n - 4]`. `None` only when the series is shorter than
/// `lag`; a zero base reads as flat.
pub fn momentum(closes: &[f64], lag: usize) -> Option<f64> {
    if lag == 0 || closes.len() < lag {
        return None;
    }
    let last = *closes.last()?;
    let base = closes[closes.len() - lag];
    if base == 0.0 {
        return Some(0.0);
    }
    Some((last - base) / base)
}

/// Simple-average RSI over the last `period` close-to-close moves.
///
/// Falls back to [`RSI_NEUTRAL`] when there are fewer than `period` moves.
pub fn rsi(closes: &[f64], period: usize) -> f64 {
    let deltas: Vec<f64> = closes.windows(2).map(|w| w[1] - w[0]).collect();
    if period == 0 || deltas.len() < period {
        return RSI_NEUTRAL;
    }
    let tail = &deltas[deltas.len() - period..];
    let avg_gain = tail.iter().map(|d| d.max(0.0)).sum::<f64>() / period as f64;
    let avg_loss = tail.iter().map(|d| (-d).max(0.0)).sum::<f64>() / period as f64;

    if avg_loss == 0.0 {
        return if avg_gain > 0.0 { 100.0 } else { RSI_NEUTRAL };
    }
    let rs = avg_gain / avg_loss;
    100.0 - 100.0 / (1.0 + rs)
}

/// Fraction of `history` strictly below `current`. Empty history ranks in the middle.
pub fn percentile_rank(current: f64, history: &[f64]) -> f64 {
    if history.is_empty() {
        return 0.5;
    }
    history.iter().filter(|h| **h < current).count() as f64 / history.len() as f64
}
