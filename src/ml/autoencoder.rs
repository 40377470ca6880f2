//! Recurrent sequence autoencoder
//!
//! An LSTM encoder compresses a window into a latent vector; the latent vector
//! is expanded back to the hidden size, fed to an LSTM decoder at every step,
//! and a linear output layer maps each decoder state back to feature space.
//! Windows that reconstruct poorly (or suspiciously well) are anomalous.
//!
//! Training is mini-batch Adam on mean squared reconstruction error. Batches
//! are taken in window order, so a given seed always yields the same network.

use std::fmt;

use burn::backend::ndarray::NdArrayDevice;
use burn::backend::{Autodiff, NdArray};
use burn::module::{AutodiffModule, Module};
use burn::nn::loss::{MseLoss, Reduction};
use burn::nn::{Linear, LinearConfig, Lstm, LstmConfig};
use burn::optim::{AdamConfig, GradientsParams, Optimizer};
use burn::record::{BinBytesRecorder, FullPrecisionSettings, Recorder};
use burn::tensor::backend::Backend;
use burn::tensor::{ElementConversion, Tensor, TensorData};
use log::debug;
use parking_lot::Mutex;
use serde::de::{self, Deserializer};
use serde::ser::{self, Serializer};
use serde::{Deserialize, Serialize};

use super::TrainableScorer;
use crate::error::ModelError;
use crate::features::Window;

type ScoreBackend = NdArray<f32>;
type TrainBackend = Autodiff<ScoreBackend>;

/// Windows per forward pass when scoring
const SCORE_BATCH: usize = 256;

/// The ndarray backend draws initial weights from one process-wide seeded
/// generator; seeding and initialization must not interleave across threads.
static NETWORK_INIT: Mutex<()> = parking_lot::const_mutex(());

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoencoderConfig {
    pub hidden_dim: usize,
    pub latent_dim: usize,
    pub epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f64,
    pub seed: u64,
}

impl Default for AutoencoderConfig {
    fn default() -> Self {
        AutoencoderConfig {
            hidden_dim: 32,
            latent_dim: 16,
            epochs: 10,
            batch_size: 32,
            learning_rate: 1e-3,
            seed: 42,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
struct NetworkShape {
    input_dim: usize,
    hidden_dim: usize,
    latent_dim: usize,
}

impl NetworkShape {
    fn check(&self) -> Result<(), ModelError> {
        if self.input_dim == 0 || self.hidden_dim == 0 || self.latent_dim == 0 {
            return Err(ModelError::InvalidStructure(format!(
                "network sizes must be positive, got {}/{}/{}",
                self.input_dim, self.hidden_dim, self.latent_dim
            )));
        }
        Ok(())
    }

    fn parameter_count(&self) -> usize {
        let lstm = |input: usize, hidden: usize| 4 * (input * hidden + hidden + hidden * hidden + hidden);
        let linear = |input: usize, output: usize| input * output + output;

        lstm(self.input_dim, self.hidden_dim)
            + linear(self.hidden_dim, self.latent_dim)
            + linear(self.latent_dim, self.hidden_dim)
            + lstm(self.hidden_dim, self.hidden_dim)
            + linear(self.hidden_dim, self.input_dim)
    }
}

#[derive(Module, Debug)]
struct SequenceNetwork<B: Backend> {
    encoder: Lstm<B>,
    to_latent: Linear<B>,
    from_latent: Linear<B>,
    decoder: Lstm<B>,
    output: Linear<B>,
}

impl<B: Backend> SequenceNetwork<B> {
    fn new(shape: &NetworkShape, device: &B::Device) -> Self {
        SequenceNetwork {
            encoder: LstmConfig::new(shape.input_dim, shape.hidden_dim, true).init(device),
            to_latent: LinearConfig::new(shape.hidden_dim, shape.latent_dim).init(device),
            from_latent: LinearConfig::new(shape.latent_dim, shape.hidden_dim).init(device),
            decoder: LstmConfig::new(shape.hidden_dim, shape.hidden_dim, true).init(device),
            output: LinearConfig::new(shape.hidden_dim, shape.input_dim).init(device),
        }
    }

    /// `[batch, steps, features]` in, reconstruction of the same shape out
    fn forward(&self, input: Tensor<B, 3>) -> Tensor<B, 3> {
        let [_, steps, _] = input.dims();

        let (_, state) = self.encoder.forward(input, None);
        let latent = self.to_latent.forward(state.hidden);
        let expanded = self.from_latent.forward(latent).unsqueeze_dim::<3>(1);

        let repeated = Tensor::cat(vec![expanded; steps], 1);
        let (decoded, _) = self.decoder.forward(repeated, None);
        self.output.forward(decoded)
    }

    /// Mean squared error per window, `[batch]`
    fn reconstruction_errors(&self, input: Tensor<B, 3>) -> Tensor<B, 1> {
        let diff = self.forward(input.clone()) - input;
        (diff.clone() * diff).mean_dim(2).mean_dim(1).flatten::<1>(0, 2)
    }
}

/// Build a fresh network with the shared generator reseeded; parameters are
/// materialized by a forward pass before the lock is released.
fn init_network<B: Backend>(shape: &NetworkShape, seed: u64, device: &B::Device) -> SequenceNetwork<B> {
    let _guard = NETWORK_INIT.lock();
    B::seed(seed);
    let network = SequenceNetwork::new(shape, device);
    let _ = network.forward(Tensor::zeros([1, 1, shape.input_dim], device));
    network
}

pub struct LstmAutoencoder {
    shape: NetworkShape,
    // Burn modules are Send but not guaranteed Sync
    network: Mutex<SequenceNetwork<ScoreBackend>>,
}

impl fmt::Debug for LstmAutoencoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LstmAutoencoder")
            .field("input_dim", &self.shape.input_dim)
            .field("hidden_dim", &self.shape.hidden_dim)
            .field("latent_dim", &self.shape.latent_dim)
            .finish()
    }
}

impl LstmAutoencoder {
    pub fn hidden_dim(&self) -> usize {
        self.shape.hidden_dim
    }

    pub fn latent_dim(&self) -> usize {
        self.shape.latent_dim
    }

    /// Reconstruction errors for windows of one shape, NaN for anything that
    /// cannot be fed to the network
    fn score_uniform(&self, windows: &[Window]) -> Vec<f64> {
        let Some(data) = window_tensor_data(windows, self.shape.input_dim) else {
            return windows.iter().map(|w| self.score_one(w)).collect();
        };

        let device = NdArrayDevice::Cpu;
        let errors = self
            .network
            .lock()
            .reconstruction_errors(Tensor::from_data(data, &device));
        match errors.into_data().to_vec::<f32>() {
            Ok(values) => values.into_iter().map(f64::from).collect(),
            Err(_) => vec![f64::NAN; windows.len()],
        }
    }

    fn score_one(&self, window: &Window) -> f64 {
        if window.rows.is_empty() {
            return 0.0;
        }
        match window_tensor_data(std::slice::from_ref(window), self.shape.input_dim) {
            Some(_) => self.score_uniform(std::slice::from_ref(window))[0],
            None => f64::NAN,
        }
    }
}

/// Flatten equally shaped windows into `[batch, steps, features]` tensor data
fn window_tensor_data(windows: &[Window], width: usize) -> Option<TensorData> {
    let steps = windows.first()?.rows.len();
    if steps == 0 {
        return None;
    }

    let mut values = Vec::with_capacity(windows.len() * steps * width);
    for window in windows {
        if window.rows.len() != steps {
            return None;
        }
        for row in &window.rows {
            if row.len() != width {
                return None;
            }
            values.extend(row.iter().map(|&v| v as f32));
        }
    }

    Some(TensorData::new(values, [windows.len(), steps, width]))
}

impl TrainableScorer for LstmAutoencoder {
    type Config = AutoencoderConfig;
    type Sample = Window;

    const NAME: &'static str = "lstm_autoencoder";

    fn fit(config: &AutoencoderConfig, data: &[Window]) -> Result<Self, ModelError> {
        let first = data.first().ok_or(ModelError::EmptyData)?;
        let steps = first.rows.len();
        let input_dim = first.rows.first().map(|row| row.len()).ok_or(ModelError::EmptyData)?;
        if let Some(row) = data
            .iter()
            .flat_map(|w| w.rows.iter())
            .find(|row| row.len() != input_dim)
        {
            return Err(ModelError::DimensionMismatch {
                expected: input_dim,
                actual: row.len(),
            });
        }
        if let Some(window) = data.iter().find(|w| w.rows.len() != steps) {
            return Err(ModelError::DimensionMismatch {
                expected: steps,
                actual: window.rows.len(),
            });
        }
        if config.batch_size == 0 {
            return Err(ModelError::InvalidStructure("batch size must be positive".into()));
        }

        let shape = NetworkShape {
            input_dim,
            hidden_dim: config.hidden_dim,
            latent_dim: config.latent_dim,
        };
        shape.check()?;

        let device = NdArrayDevice::Cpu;
        let batches: Vec<Tensor<TrainBackend, 3>> = data
            .chunks(config.batch_size)
            .filter_map(|chunk| window_tensor_data(chunk, input_dim))
            .map(|batch| Tensor::from_data(batch, &device))
            .collect();

        let mut network = init_network::<TrainBackend>(&shape, config.seed, &device);
        let mut optimizer = AdamConfig::new().init::<TrainBackend, SequenceNetwork<TrainBackend>>();
        let loss_fn = MseLoss::new();

        for epoch in 0..config.epochs {
            let mut epoch_loss = 0.0;
            for batch in &batches {
                let reconstruction = network.forward(batch.clone());
                let loss = loss_fn.forward(reconstruction, batch.clone(), Reduction::Mean);

                let value: f64 = loss.clone().into_scalar().elem();
                if !value.is_finite() {
                    return Err(ModelError::NonFinite(format!("training loss at epoch {}", epoch + 1)));
                }
                epoch_loss += value;

                let grads = GradientsParams::from_grads(loss.backward(), &network);
                network = optimizer.step(config.learning_rate, network, grads);
            }
            debug!(
                "{} epoch {}/{} loss {:.6}",
                Self::NAME,
                epoch + 1,
                config.epochs,
                epoch_loss / batches.len().max(1) as f64
            );
        }

        let model = LstmAutoencoder {
            shape,
            network: Mutex::new(network.valid()),
        };
        model.validate()?;
        Ok(model)
    }

    fn score(&self, sample: &Window) -> f64 {
        self.score_one(sample)
    }

    fn input_dimension(&self) -> usize {
        self.shape.input_dim
    }

    fn validate(&self) -> Result<(), ModelError> {
        self.shape.check()?;

        let network = self.network.lock();
        let expected = self.shape.parameter_count();
        let actual = network.num_params();
        if actual != expected {
            return Err(ModelError::InvalidStructure(format!(
                "expected {} parameters, found {}",
                expected, actual
            )));
        }

        let device = NdArrayDevice::Cpu;
        let errors = network.reconstruction_errors(Tensor::zeros([1, 2, self.shape.input_dim], &device));
        let finite = errors
            .into_data()
            .to_vec::<f32>()
            .map(|values| values.iter().all(|v| v.is_finite()))
            .unwrap_or(false);
        if !finite {
            return Err(ModelError::NonFinite("network weights".into()));
        }
        Ok(())
    }

    fn score_all(&self, samples: &[Window]) -> Vec<f64> {
        samples
            .chunks(SCORE_BATCH)
            .flat_map(|chunk| self.score_uniform(chunk))
            .collect()
    }
}

/// On-disk form: the network shape plus the burn record of its parameters
#[derive(Serialize, Deserialize)]
struct PersistedNetwork {
    input_dim: usize,
    hidden_dim: usize,
    latent_dim: usize,
    record: Vec<u8>,
}

impl Serialize for LstmAutoencoder {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let recorder = BinBytesRecorder::<FullPrecisionSettings>::default();
        let record = self.network.lock().clone().into_record();
        let bytes = Recorder::<ScoreBackend>::record(&recorder, record, ())
            .map_err(|e| ser::Error::custom(format!("recording network: {:?}", e)))?;

        PersistedNetwork {
            input_dim: self.shape.input_dim,
            hidden_dim: self.shape.hidden_dim,
            latent_dim: self.shape.latent_dim,
            record: bytes,
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for LstmAutoencoder {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let persisted = PersistedNetwork::deserialize(deserializer)?;
        let shape = NetworkShape {
            input_dim: persisted.input_dim,
            hidden_dim: persisted.hidden_dim,
            latent_dim: persisted.latent_dim,
        };
        shape.check().map_err(de::Error::custom)?;

        let device = NdArrayDevice::Cpu;
        let recorder = BinBytesRecorder::<FullPrecisionSettings>::default();
        let record = Recorder::<ScoreBackend>::load(&recorder, persisted.record, &device)
            .map_err(|e| de::Error::custom(format!("loading network: {:?}", e)))?;

        let network = init_network::<ScoreBackend>(&shape, 0, &device).load_record(record);
        Ok(LstmAutoencoder {
            shape,
            network: Mutex::new(network),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::{build_windows, FeatureVector, WindowPolicy};

    fn wave(n: usize, features: usize) -> Vec<FeatureVector> {
        (0..n)
            .map(|t| {
                FeatureVector(
                    (0..features)
                        .map(|j| ((t as f64) * 0.3 + j as f64).sin())
                        .collect(),
                )
            })
            .collect()
    }

    fn small_config() -> AutoencoderConfig {
        AutoencoderConfig {
            hidden_dim: 6,
            latent_dim: 3,
            epochs: 5,
            batch_size: 16,
            learning_rate: 1e-2,
            seed: 42,
        }
    }

    fn mean(values: &[f64]) -> f64 {
        values.iter().sum::<f64>() / values.len() as f64
    }

    #[test]
    fn test_training_reduces_loss() {
        let windows = build_windows(&wave(60, 3), 8, WindowPolicy::Strict);
        let untrained = LstmAutoencoder::fit(
            &AutoencoderConfig {
                epochs: 0,
                ..small_config()
            },
            &windows,
        )
        .unwrap();
        let trained = LstmAutoencoder::fit(
            &AutoencoderConfig {
                epochs: 40,
                ..small_config()
            },
            &windows,
        )
        .unwrap();

        assert!(mean(&trained.score_all(&windows)) < mean(&untrained.score_all(&windows)));
    }

    #[test]
    fn test_fit_is_reproducible() {
        let windows = build_windows(&wave(40, 2), 5, WindowPolicy::Strict);
        let a = LstmAutoencoder::fit(&small_config(), &windows).unwrap();
        let b = LstmAutoencoder::fit(&small_config(), &windows).unwrap();

        assert_eq!(a.score_all(&windows), b.score_all(&windows));
    }

    #[test]
    fn test_batch_and_single_scores_agree() {
        let windows = build_windows(&wave(30, 3), 4, WindowPolicy::Strict);
        let model = LstmAutoencoder::fit(&small_config(), &windows).unwrap();

        let batched = model.score_all(&windows);
        for (window, expected) in windows.iter().zip(&batched) {
            assert!((model.score(window) - expected).abs() < 1e-6);
        }
    }

    #[test]
    fn test_outlying_window_reconstructs_badly() {
        let windows = build_windows(&wave(50, 3), 6, WindowPolicy::Strict);
        let model = LstmAutoencoder::fit(&small_config(), &windows).unwrap();

        let normal = mean(&model.score_all(&windows));
        let spike = Window {
            rows: vec![FeatureVector(vec![50.0, -50.0, 50.0]); 6],
            end: 5,
        };
        assert!(model.score(&spike) > 10.0 * normal);
    }

    #[test]
    fn test_wrong_width_window_scores_nan() {
        let windows = build_windows(&wave(20, 3), 4, WindowPolicy::Strict);
        let model = LstmAutoencoder::fit(&small_config(), &windows).unwrap();

        let narrow = Window {
            rows: vec![FeatureVector(vec![0.1, 0.2]); 4],
            end: 3,
        };
        assert!(model.score(&narrow).is_nan());

        let mixed = vec![windows[0].clone(), narrow];
        let scores = model.score_all(&mixed);
        assert!(scores[0].is_finite());
        assert!(scores[1].is_nan());
    }

    #[test]
    fn test_fit_rejects_bad_input() {
        assert_eq!(
            LstmAutoencoder::fit(&small_config(), &[]).unwrap_err(),
            ModelError::EmptyData
        );

        let ragged = vec![Window {
            rows: vec![FeatureVector(vec![1.0, 2.0]), FeatureVector(vec![1.0])],
            end: 1,
        }];
        assert!(matches!(
            LstmAutoencoder::fit(&small_config(), &ragged),
            Err(ModelError::DimensionMismatch { expected: 2, actual: 1 })
        ));

        let windows = build_windows(&wave(10, 2), 3, WindowPolicy::Strict);
        assert!(matches!(
            LstmAutoencoder::fit(
                &AutoencoderConfig {
                    latent_dim: 0,
                    ..small_config()
                },
                &windows
            ),
            Err(ModelError::InvalidStructure(_))
        ));
    }

    #[test]
    fn test_persisted_network_scores_identically() {
        let windows = build_windows(&wave(30, 2), 5, WindowPolicy::Strict);
        let model = LstmAutoencoder::fit(&small_config(), &windows).unwrap();

        let json = serde_json::to_string(&model).unwrap();
        let restored: LstmAutoencoder = serde_json::from_str(&json).unwrap();

        assert!(restored.validate().is_ok());
        assert_eq!(restored.input_dimension(), 2);
        for (a, b) in model.score_all(&windows).iter().zip(restored.score_all(&windows)) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn test_corrupted_record_is_rejected() {
        let windows = build_windows(&wave(20, 2), 4, WindowPolicy::Strict);
        let model = LstmAutoencoder::fit(&small_config(), &windows).unwrap();
        let mut value = serde_json::to_value(&model).unwrap();

        value["record"] = serde_json::json!([1, 2, 3]);
        assert!(serde_json::from_value::<LstmAutoencoder>(value.clone()).is_err());

        value["hidden_dim"] = serde_json::json!(0);
        assert!(serde_json::from_value::<LstmAutoencoder>(value).is_err());
    }
}
