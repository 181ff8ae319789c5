//! CPU-bound stand-in for the segmentation algorithms.

use async_trait::async_trait;
use tracing::debug;

use segq_core::ArtifactRef;
use segq_infra::workers::Segmenter;
use segq_jobs::{CostClass, ExecutionError, RoutingMessage};

const DECODABLE: [&str; 3] = [".png", ".jpg", ".jpeg"];

/// Burns `rounds_per_repeat` mixing rounds per unit of `repeat`, four times
/// as many for the heavy method, on the blocking pool.
///
/// Inputs that are not a decodable image name fail with
/// [`ExecutionError::InputUnavailable`].
#[derive(Debug, Clone, Copy)]
pub struct SyntheticSegmenter {
    rounds_per_repeat: u64,
}

impl Default for SyntheticSegmenter {
    fn default() -> Self {
        Self::new(200_000)
    }
}

impl SyntheticSegmenter {
    pub fn new(rounds_per_repeat: u64) -> Self {
        Self { rounds_per_repeat }
    }

    pub fn rounds_for(&self, order: &RoutingMessage) -> u64 {
        let weight = match order.method.cost_class() {
            CostClass::Light => 1,
            CostClass::Heavy => 4,
        };
        self.rounds_per_repeat * u64::from(order.params.repeat) * weight
    }
}

#[async_trait]
impl Segmenter for SyntheticSegmenter {
    async fn segment(&self, order: &RoutingMessage) -> Result<ArtifactRef, ExecutionError> {
        let input = order.input_ref.as_str().to_ascii_lowercase();
        if !DECODABLE.iter().any(|ext| input.ends_with(ext)) {
            return Err(ExecutionError::InputUnavailable(format!(
                "cannot decode {}",
                order.input_ref
            )));
        }

        let rounds = self.rounds_for(order);
        let seed = order.job_id.get() ^ (u64::from(order.attempt) << 32);
        let digest = tokio::task::spawn_blocking(move || mix(seed, rounds))
            .await
            .map_err(|e| ExecutionError::Algorithm(e.to_string()))?;
        debug!(job_id = %order.job_id, method = %order.method, rounds, digest, "synthetic segmentation finished");

        ArtifactRef::new(order.result_key()).map_err(|e| ExecutionError::Algorithm(e.to_string()))
    }
}

/// xorshift64*
fn mix(seed: u64, rounds: u64) -> u64 {
    let mut x = seed | 1;
    for _ in 0..rounds {
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        x = x.wrapping_mul(0x2545_F491_4F6C_DD1D);
    }
    x
}
