use crate::config::rules::RuleSet;
use crate::core::errors::BackendError;
use crate::core::types::FeatureRecord;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::f64::consts::{FRAC_PI_2, PI};

/// Backend-facing encoding of one FeatureRecord.
///
/// Derived deterministically: the same record under the same angles always yields the same
/// descriptor, so a backend may cache on `tag`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefinementDescriptor {
    pub tag: String,
    /// Half-turn scaled (spot - strike) / strike.
    pub theta: f64,
    /// Extra rotation on the measured qubit (`angle_0 - pi/2`).
    pub bias: f64,
    /// Rotation applied to the entangled ancilla (`angle_1 - pi/2`).
    pub ancilla: f64,
}

impl RefinementDescriptor {
    pub fn encode(record: &FeatureRecord, rules: &RuleSet) -> Result<Self, BackendError> {
        if !record.spot_price.is_finite() {
            return Err(BackendError::InvalidRecord(format!(
                "spot_price must be finite, got {}",
                record.spot_price
            )));
        }
        if !(record.strike_price.is_finite() && record.strike_price > 0.0) {
            return Err(BackendError::InvalidRecord(format!(
                "strike_price must be positive, got {}",
                record.strike_price
            )));
        }

        let theta = (record.spot_price - record.strike_price) / record.strike_price * PI;
        if !theta.is_finite() {
            return Err(BackendError::InvalidRecord(format!(
                "moneyness overflows for spot {} / strike {}",
                record.spot_price, record.strike_price
            )));
        }
        if !(rules.angle_0.is_finite() && rules.angle_1.is_finite()) {
            return Err(BackendError::InvalidRecord(format!(
                "encoding angles must be finite, got {} / {}",
                rules.angle_0, rules.angle_1
            )));
        }

        let canonical = serde_json::to_vec(&(record, rules.angle_0, rules.angle_1))
            .map_err(|e| BackendError::InvalidRecord(e.to_string()))?;
        let digest = Sha256::digest(&canonical);

        Ok(Self {
            tag: format!("sg_{}", hex::encode(&digest[..8])),
            theta,
            bias: rules.angle_0 - FRAC_PI_2,
            ancilla: rules.angle_1 - FRAC_PI_2,
        })
    }

    /// Stable 64-bit seed taken from the tag, for backends that sample.
    pub fn seed(&self) -> u64 {
        let hex_part = self.tag.trim_start_matches("sg_");
        u64::from_str_radix(hex_part, 16).unwrap_or_else(|_| {
            let digest = Sha256::digest(self.tag.as_bytes());
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&digest[..8]);
            u64::from_be_bytes(bytes)
        })
    }
}

/// Counts of the two measurement outcomes for one item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OutcomeHistogram {
    pub ones: u32,
    pub zeros: u32,
}

impl OutcomeHistogram {
    pub fn total(&self) -> u64 {
        u64::from(self.ones) + u64::from(self.zeros)
    }

    /// Share of "up" outcomes; an empty histogram reads as 0.
    pub fn p_up(&self) -> f64 {
        self.ones as f64 / self.total().max(1) as f64
    }
}

/// A metered refinement resource. Capacity accounting lives in the quota allocator, not here.
#[async_trait]
pub trait RefinementBackend: Send + Sync + 'static {
    /// Samples drawn per descriptor; the pipeline budgets `items * samples_per_item`.
    fn samples_per_item(&self) -> u32;

    /// One histogram per descriptor, in the same order.
    async fn submit(
        &self,
        descriptors: &[RefinementDescriptor],
    ) -> Result<Vec<OutcomeHistogram>, BackendError>;
}
