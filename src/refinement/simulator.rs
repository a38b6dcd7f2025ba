use crate::core::errors::BackendError;
use crate::refinement::client::{OutcomeHistogram, RefinementBackend, RefinementDescriptor};
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand::distributions::{Bernoulli, Distribution};
use std::time::Duration;
use tracing::debug;

/// Local stand-in for the metered device.
///
/// Runs a two-qubit rotation/entangler circuit per descriptor and measures the first qubit:
/// outcome one occurs with probability `sin^2((theta + bias) / 2)`. The ancilla rotation happens
/// after the entangler and never reaches the measured qubit, so it has no effect here.
/// Sampling is seeded per descriptor, so repeated submissions return identical histograms.
pub struct SimRefinementBackend {
    samples_per_item: u32,
    latency: Duration,
}

impl SimRefinementBackend {
    pub fn new(samples_per_item: u32, latency: Duration) -> Self {
        Self {
            samples_per_item,
            latency,
        }
    }

    pub fn run_one(
        &self,
        descriptor: &RefinementDescriptor,
    ) -> Result<OutcomeHistogram, BackendError> {
        let p_one = ((descriptor.theta + descriptor.bias) / 2.0)
            .sin()
            .powi(2)
            .clamp(0.0, 1.0);
        let coin = Bernoulli::new(p_one).map_err(|e| {
            BackendError::InvalidRecord(format!("{}: outcome probability {}: {}", descriptor.tag, p_one, e))
        })?;
        let mut rng = StdRng::seed_from_u64(descriptor.seed());

        let ones = (0..self.samples_per_item)
            .filter(|_| coin.sample(&mut rng))
            .count() as u32;

        Ok(OutcomeHistogram {
            ones,
            zeros: self.samples_per_item - ones,
        })
    }
}

#[async_trait]
impl RefinementBackend for SimRefinementBackend {
    fn samples_per_item(&self) -> u32 {
        self.samples_per_item
    }

    async fn submit(
        &self,
        descriptors: &[RefinementDescriptor],
    ) -> Result<Vec<OutcomeHistogram>, BackendError> {
        let mut results = Vec::with_capacity(descriptors.len());
        for d in descriptors {
            let hist = self.run_one(d)?;
            debug!(tag = %d.tag, ones = hist.ones, zeros = hist.zeros, "simulated refinement");
            results.push(hist);
            if !self.latency.is_zero() {
                // mimic network lag
                tokio::time::sleep(self.latency).await;
            }
        }
        Ok(results)
    }
}
