//! Trainable scorers and the numeric helpers shared by both model managers

pub mod autoencoder;
pub mod isolation_forest;
pub mod normalizer;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::ModelError;

pub use autoencoder::{AutoencoderConfig, LstmAutoencoder};
pub use isolation_forest::{IsolationForest, IsolationForestConfig};
pub use normalizer::Normalizer;

/// Capability shared by the density and sequence models: fit from data, score
/// one sample, and check structural consistency after a reload.
pub trait TrainableScorer: Sized + Send + Sync + Serialize + DeserializeOwned {
    type Config: Clone + Send + Sync + Serialize;
    type Sample: Sync;

    /// Name used in logs and persisted metadata
    const NAME: &'static str;

    fn fit(config: &Self::Config, data: &[Self::Sample]) -> Result<Self, ModelError>;

    fn score(&self, sample: &Self::Sample) -> f64;

    /// Width of the feature vectors the model was fitted on
    fn input_dimension(&self) -> usize;

    fn validate(&self) -> Result<(), ModelError>;

    fn score_all(&self, samples: &[Self::Sample]) -> Vec<f64> {
        samples.iter().map(|s| self.score(s)).collect()
    }
}

/// Percentile with linear interpolation between closest ranks, `q` in [0, 100].
///
/// Returns `None` for an empty input or when any value is not finite.
pub fn percentile(values: &[f64], q: f64) -> Option<f64> {
    if values.is_empty() || values.iter().any(|v| !v.is_finite()) {
        return None;
    }

    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));

    let rank = (q.clamp(0.0, 100.0) / 100.0) * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    let fraction = rank - lower as f64;

    Some(sorted[lower] + (sorted[upper] - sorted[lower]) * fraction)
}
