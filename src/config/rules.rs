use crate::core::errors::ConfigurationError;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Weights and thresholds read by the classical scorer, plus the refinement encoding angles.
///
/// Built from compiled-in defaults, optionally overlaid by one override document, and then
/// treated as immutable. Candidate configurations are derived with [`RuleSet::with_overrides`]
/// instead of mutating a shared instance.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RuleSet {
    pub ma_trend_weight: f64,
    pub rsi_extreme_weight: f64,
    pub vol_rank_weight: f64,
    pub momentum_3d_weight: f64,
    pub rsi_high: f64,
    pub rsi_low: f64,
    pub iv_rank_high: f64,
    pub iv_rank_low: f64,
    pub angle_0: f64,
    pub angle_1: f64,
}

impl Default for RuleSet {
    fn default() -> Self {
        Self {
            ma_trend_weight: 0.4,
            rsi_extreme_weight: 0.3,
            vol_rank_weight: 0.2,
            momentum_3d_weight: 0.1,
            rsi_high: 70.0,
            rsi_low: 30.0,
            iv_rank_high: 0.7,
            iv_rank_low: 0.3,
            angle_0: 1.5707,
            angle_1: 1.5707,
        }
    }
}

impl RuleSet {
    pub const KEYS: [&'static str; 10] = [
        "ma_trend_weight",
        "rsi_extreme_weight",
        "vol_rank_weight",
        "momentum_3d_weight",
        "rsi_high",
        "rsi_low",
        "iv_rank_high",
        "iv_rank_low",
        "angle_0",
        "angle_1",
    ];

    pub fn get(&self, key: &str) -> Option<f64> {
        let v = match key {
            "ma_trend_weight" => self.ma_trend_weight,
            "rsi_extreme_weight" => self.rsi_extreme_weight,
            "vol_rank_weight" => self.vol_rank_weight,
            "momentum_3d_weight" => self.momentum_3d_weight,
            "rsi_high" => self.rsi_high,
            "rsi_low" => self.rsi_low,
            "iv_rank_high" => self.iv_rank_high,
            "iv_rank_low" => self.iv_rank_low,
            "angle_0" => self.angle_0,
            "angle_1" => self.angle_1,
            _ => return None,
        };
        Some(v)
    }

    fn set(&mut self, key: &str, value: f64) -> Result<(), ConfigurationError> {
        if !value.is_finite() {
            return Err(ConfigurationError::Invalid(format!(
                "{key} must be finite, got {value}"
            )));
        }
        let slot = match key {
            "ma_trend_weight" => &mut self.ma_trend_weight,
            "rsi_extreme_weight" => &mut self.rsi_extreme_weight,
            "vol_rank_weight" => &mut self.vol_rank_weight,
            "momentum_3d_weight" => &mut self.momentum_3d_weight,
            "rsi_high" => &mut self.rsi_high,
            "rsi_low" => &mut self.rsi_low,
            "iv_rank_high" => &mut self.iv_rank_high,
            "iv_rank_low" => &mut self.iv_rank_low,
            "angle_0" => &mut self.angle_0,
            "angle_1" => &mut self.angle_1,
            _ => return Err(ConfigurationError::UnknownKey(key.to_string())),
        };
        *slot = value;
        Ok(())
    }

    /// Returns a copy with `overrides` applied on top. Keys not mentioned keep their value.
    pub fn with_overrides(
        &self,
        overrides: &BTreeMap<String, f64>,
    ) -> Result<Self, ConfigurationError> {
        let mut next = *self;
        for (k, v) in overrides {
            next.set(k, *v)?;
        }
        next.validate()?;
        Ok(next)
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if !(0.0 <= self.rsi_low && self.rsi_low <= self.rsi_high && self.rsi_high <= 100.0) {
            return Err(ConfigurationError::Invalid(format!(
                "need 0 <= rsi_low ({}) <= rsi_high ({}) <= 100",
                self.rsi_low, self.rsi_high
            )));
        }
        if !(0.0 <= self.iv_rank_low
            && self.iv_rank_low <= self.iv_rank_high
            && self.iv_rank_high <= 1.0)
        {
            return Err(ConfigurationError::Invalid(format!(
                "need 0 <= iv_rank_low ({}) <= iv_rank_high ({}) <= 1",
                self.iv_rank_low, self.iv_rank_high
            )));
        }
        Ok(())
    }

    pub fn to_map(&self) -> BTreeMap<String, f64> {
        Self::KEYS
            .iter()
            .filter_map(|k| self.get(k).map(|v| (k.to_string(), v)))
            .collect()
    }

    /// Defaults merged with the first override source that exists.
    ///
    /// Sources are probed in order and only the first existing one is read; a later source is
    /// never consulted as a fallback for a broken earlier one.
    pub fn load(sources: &[PathBuf]) -> Result<(Self, Option<PathBuf>), ConfigurationError> {
        for path in sources {
            if !path.exists() {
                continue;
            }
            info!("Loading rule parameters from {:?}", path);
            let overrides = read_overrides(path)?;
            let rules = Self::default().with_overrides(&overrides)?;
            return Ok((rules, Some(path.clone())));
        }
        Ok((Self::default(), None))
    }

    /// Like [`RuleSet::load`], but a broken override source degrades to pure defaults.
    pub fn load_or_default(sources: &[PathBuf]) -> Self {
        match Self::load(sources) {
            Ok((rules, _)) => rules,
            Err(e) => {
                warn!("Ignoring rule overrides, falling back to defaults: {}", e);
                Self::default()
            }
        }
    }
}

fn read_overrides(path: &Path) -> Result<BTreeMap<String, f64>, ConfigurationError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigurationError::Unreadable {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&text).map_err(|source| ConfigurationError::Malformed {
        path: path.to_path_buf(),
        source,
    })
}
