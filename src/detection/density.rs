use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use log::{debug, error, info, warn};
use parking_lot::Mutex;

use super::ManagerStatus;
use crate::config::DensityConfig;
use crate::error::ScoringError;
use crate::features::FeatureVector;
use crate::ml::{percentile, IsolationForest, Normalizer, TrainableScorer};
use crate::models::{Assessment, Modality, Mode, ModelKind};
use crate::store::{Calibration, ModelMetadata, ModelStore};

/// Normalizer, model and threshold from one training run; replaced as a unit
struct FittedDensity<M> {
    normalizer: Normalizer,
    model: M,
    threshold: f64,
}

struct DensityState<M> {
    mode: Mode,
    buffer: VecDeque<FeatureVector>,
    capacity: usize,
    fitted: Option<FittedDensity<M>>,
    cycles_since_retrain: usize,
}

impl<M> DensityState<M> {
    fn push(&mut self, vector: FeatureVector) {
        while self.buffer.len() >= self.capacity {
            self.buffer.pop_front();
        }
        self.buffer.push_back(vector);
    }
}

/// Per-modality lifecycle of the single-vector density model:
/// collect, train, score, periodically retrain
pub struct DensityManager<M: TrainableScorer<Sample = FeatureVector> = IsolationForest> {
    config: DensityConfig,
    scorer_config: M::Config,
    store: Arc<ModelStore>,
    states: HashMap<Modality, Mutex<DensityState<M>>>,
}

impl DensityManager<IsolationForest> {
    pub fn new(config: &DensityConfig, store: Arc<ModelStore>) -> Self {
        Self::with_scorer_config(config, config.forest.clone(), store)
    }
}

impl<M: TrainableScorer<Sample = FeatureVector>> DensityManager<M> {
    /// Build the manager and restore any valid persisted models
    pub fn with_scorer_config(config: &DensityConfig, scorer_config: M::Config, store: Arc<ModelStore>) -> Self {
        let states = Modality::ALL
            .iter()
            .map(|&modality| {
                let initial = config.initial_samples.get(modality);
                let mut state = DensityState {
                    mode: Mode::Collecting,
                    buffer: VecDeque::new(),
                    capacity: config.retrain_interval + initial,
                    fitted: None,
                    cycles_since_retrain: 0,
                };

                match store.load::<M>(modality, ModelKind::Density) {
                    Some(stored) => {
                        if let Calibration::Threshold { value } = stored.metadata.calibration {
                            state.fitted = Some(FittedDensity {
                                normalizer: stored.normalizer,
                                model: stored.model,
                                threshold: value,
                            });
                            state.mode = Mode::Inference;
                            info!("[{}-density] Restored model (threshold={:.6}) -> inference", modality, value);
                        }
                    }
                    None => {
                        info!("[{}-density] No model, collecting {} samples before training", modality, initial);
                    }
                }

                (modality, Mutex::new(state))
            })
            .collect();

        DensityManager {
            config: config.clone(),
            scorer_config,
            store,
            states,
        }
    }

    /// Buffer a feature vector, training once enough samples are collected
    pub fn observe(&self, modality: Modality, vector: FeatureVector) {
        let Some(state) = self.states.get(&modality) else {
            return;
        };
        let mut state = state.lock();
        state.push(vector);

        if state.mode == Mode::Collecting {
            let count = state.buffer.len();
            let required = self.config.initial_samples.get(modality);
            if count % 25 == 0 || count == required {
                info!("[{}-density] collecting {}/{}", modality, count, required);
            }
            if count >= required {
                self.retrain(modality, &mut state);
            }
        }
    }

    /// Score one vector; neutral unless a fitted model is in inference.
    ///
    /// Every scored vector counts towards the periodic retrain, which runs
    /// inline before returning.
    pub fn predict(&self, modality: Modality, vector: &FeatureVector) -> Assessment {
        let Some(state) = self.states.get(&modality) else {
            return Assessment::neutral();
        };
        let mut state = state.lock();

        let assessment = match (&state.mode, &state.fitted) {
            (Mode::Inference, Some(fitted)) => {
                let score = fitted.model.score(&fitted.normalizer.transform(vector));
                if !score.is_finite() {
                    warn!("[{}-density] Non-finite score, returning neutral verdict", modality);
                    return Assessment::neutral();
                }
                Assessment {
                    score,
                    is_anomaly: score <= fitted.threshold - self.config.margin,
                }
            }
            _ => return Assessment::neutral(),
        };

        state.cycles_since_retrain += 1;
        if state.cycles_since_retrain >= self.config.retrain_interval {
            info!(
                "[{}-density] Periodic retrain on {} samples",
                modality,
                state.buffer.len()
            );
            self.retrain(modality, &mut state);
        }

        assessment
    }

    pub fn status(&self, modality: Modality) -> Option<ManagerStatus> {
        let state = self.states.get(&modality)?.lock();
        Some(ManagerStatus {
            mode: state.mode,
            buffered: state.buffer.len(),
            capacity: state.capacity,
            required_samples: self.config.initial_samples.get(modality),
            cycles_since_retrain: state.cycles_since_retrain,
            trained: state.fitted.is_some(),
        })
    }

    fn retrain(&self, modality: Modality, state: &mut DensityState<M>) {
        match self.train(modality, state) {
            Ok(fitted) => {
                info!(
                    "[{}-density] Training complete (threshold={:.6}) -> inference",
                    modality, fitted.threshold
                );
                state.fitted = Some(fitted);
                state.mode = Mode::Inference;
                state.cycles_since_retrain = 0;
            }
            Err(e) => {
                error!("[{}-density] {}", modality, e);
                state.fitted = None;
                state.mode = Mode::Collecting;
            }
        }
    }

    fn train(&self, modality: Modality, state: &DensityState<M>) -> Result<FittedDensity<M>, ScoringError> {
        let required = self.config.initial_samples.get(modality);
        if state.buffer.len() < required {
            return Err(ScoringError::InsufficientData {
                modality,
                available: state.buffer.len(),
                required,
            });
        }

        let failure = |reason: String| ScoringError::TrainingFailure {
            modality,
            kind: ModelKind::Density,
            reason,
        };

        debug!("[{}-density] Training on {} samples", modality, state.buffer.len());
        let data: Vec<FeatureVector> = state.buffer.iter().cloned().collect();

        let normalizer = Normalizer::fit(&data).map_err(|e| failure(e.to_string()))?;
        let scaled = normalizer.transform_all(&data);
        let model = M::fit(&self.scorer_config, &scaled).map_err(|e| failure(e.to_string()))?;

        let scores = model.score_all(&scaled);
        let threshold = percentile(&scores, self.config.anomaly_percentile * 100.0)
            .ok_or_else(|| failure("non-finite training scores".to_string()))?;

        let fitted = FittedDensity {
            normalizer,
            model,
            threshold,
        };
        self.persist(modality, &fitted, data.len());
        Ok(fitted)
    }

    fn persist(&self, modality: Modality, fitted: &FittedDensity<M>, samples: usize) {
        let hyperparameters = serde_json::json!({
            "scorer": serde_json::to_value(&self.scorer_config).unwrap_or_default(),
            "anomaly_percentile": self.config.anomaly_percentile,
            "margin": self.config.margin,
        });
        let metadata = ModelMetadata::new(
            modality,
            ModelKind::Density,
            M::NAME,
            Calibration::Threshold {
                value: fitted.threshold,
            },
        )
        .with_hyperparameters(hyperparameters)
        .with_training_samples(samples);

        if let Err(source) = self.store.save(
            modality,
            ModelKind::Density,
            &fitted.model,
            &fitted.normalizer,
            &metadata,
        ) {
            let err = ScoringError::PersistenceFailure {
                modality,
                kind: ModelKind::Density,
                source,
            };
            warn!("[{}-density] {}; keeping the in-memory model", modality, err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PerModality;
    use crate::features::extract;
    use crate::ml::IsolationForestConfig;
    use crate::models::Params;
    use serde_json::json;
    use std::fs;
    use tempfile::TempDir;

    fn config(initial: usize, retrain_interval: usize) -> DensityConfig {
        DensityConfig {
            initial_samples: PerModality::uniform(initial),
            retrain_interval,
            forest: IsolationForestConfig {
                n_estimators: 60,
                ..IsolationForestConfig::default()
            },
            ..DensityConfig::default()
        }
    }

    fn manager(dir: &TempDir, config: &DensityConfig) -> DensityManager {
        DensityManager::new(config, Arc::new(ModelStore::new(dir.path())))
    }

    fn sample(i: usize) -> FeatureVector {
        let t = i as f64 * 0.13;
        FeatureVector(vec![t.sin(), t.cos(), (t * 3.0).sin() * 0.2])
    }

    #[test]
    fn test_neutral_while_collecting() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir, &config(50, 1000));

        for i in 0..49 {
            manager.observe(Modality::Sensor, sample(i));
            assert_eq!(manager.predict(Modality::Sensor, &sample(i)), Assessment::neutral());
        }

        let status = manager.status(Modality::Sensor).unwrap();
        assert_eq!(status.mode, Mode::Collecting);
        assert_eq!(status.buffered, 49);
        assert!(!status.trained);
    }

    #[test]
    fn test_trains_at_initial_sample_count_and_persists() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir, &config(50, 1000));

        for i in 0..50 {
            manager.observe(Modality::Sensor, sample(i));
        }

        let status = manager.status(Modality::Sensor).unwrap();
        assert_eq!(status.mode, Mode::Inference);
        assert_eq!(status.cycles_since_retrain, 0);
        assert!(dir.path().join("sensor/density/meta.json").is_file());

        // Other modalities are untouched
        assert_eq!(manager.status(Modality::TouchDrag).unwrap().mode, Mode::Collecting);
    }

    #[test]
    fn test_buffer_never_exceeds_capacity() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir, &config(10, 5));

        for i in 0..100 {
            manager.observe(Modality::Sensor, sample(i));
            manager.predict(Modality::Sensor, &sample(i));
            let status = manager.status(Modality::Sensor).unwrap();
            assert!(status.buffered <= 15);
        }
        assert_eq!(manager.status(Modality::Sensor).unwrap().buffered, 15);
    }

    #[test]
    fn test_periodic_retrain_resets_counter() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir, &config(20, 3));
        for i in 0..20 {
            manager.observe(Modality::Sensor, sample(i));
        }

        manager.predict(Modality::Sensor, &sample(1));
        manager.predict(Modality::Sensor, &sample(2));
        assert_eq!(manager.status(Modality::Sensor).unwrap().cycles_since_retrain, 2);

        manager.predict(Modality::Sensor, &sample(3));
        let status = manager.status(Modality::Sensor).unwrap();
        assert_eq!(status.cycles_since_retrain, 0);
        assert_eq!(status.mode, Mode::Inference);
    }

    #[test]
    fn test_constant_sensor_stream_flags_outlier() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir, &config(500, 100_000));
        let zero = FeatureVector(vec![0.0, 0.0, 0.0]);

        for _ in 0..500 {
            manager.observe(Modality::Sensor, zero.clone());
        }
        assert_eq!(manager.status(Modality::Sensor).unwrap().mode, Mode::Inference);

        assert!(!manager.predict(Modality::Sensor, &zero).is_anomaly);
        let far = FeatureVector(vec![1000.0, 1000.0, 1000.0]);
        assert!(manager.predict(Modality::Sensor, &far).is_anomaly);
    }

    #[test]
    fn test_zero_duration_drags_train_without_errors() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir, &config(25, 1000));

        for i in 0..25 {
            let params: Params = json!({
                "duration": 0,
                "total_distance": 10.0 + i as f64,
                "drag_direction": "left"
            })
            .as_object()
            .cloned()
            .unwrap();
            let vector = extract(Modality::TouchDrag, Some(&params));
            assert_eq!(vector[2], 0.0);
            manager.observe(Modality::TouchDrag, vector);
        }

        assert_eq!(manager.status(Modality::TouchDrag).unwrap().mode, Mode::Inference);
        let probe = extract(Modality::TouchDrag, None);
        assert!(manager.predict(Modality::TouchDrag, &probe).score.is_finite());
    }

    #[test]
    fn test_same_seed_gives_same_scores() {
        let dir_a = TempDir::new().unwrap();
        let dir_b = TempDir::new().unwrap();
        let a = manager(&dir_a, &config(40, 1000));
        let b = manager(&dir_b, &config(40, 1000));

        for i in 0..40 {
            a.observe(Modality::TouchPressure, FeatureVector(sample(i).0.into_iter().chain([1.0]).collect()));
            b.observe(Modality::TouchPressure, FeatureVector(sample(i).0.into_iter().chain([1.0]).collect()));
        }

        let probe = FeatureVector(vec![0.3, -0.2, 0.1, 1.0]);
        assert_eq!(
            a.predict(Modality::TouchPressure, &probe),
            b.predict(Modality::TouchPressure, &probe)
        );
    }

    #[test]
    fn test_reload_restores_inference_with_same_scores() {
        let dir = TempDir::new().unwrap();
        let config = config(60, 1000);
        let first = manager(&dir, &config);
        for i in 0..60 {
            first.observe(Modality::Sensor, sample(i));
        }
        let probes: Vec<FeatureVector> = (100..110).map(sample).collect();
        let before: Vec<Assessment> = probes.iter().map(|p| first.predict(Modality::Sensor, p)).collect();

        let second = manager(&dir, &config);
        assert_eq!(second.status(Modality::Sensor).unwrap().mode, Mode::Inference);
        for (probe, expected) in probes.iter().zip(before) {
            let actual = second.predict(Modality::Sensor, probe);
            assert!((actual.score - expected.score).abs() < 1e-5);
            assert_eq!(actual.is_anomaly, expected.is_anomaly);
        }
    }

    #[test]
    fn test_invalid_persisted_state_starts_collecting() {
        let dir = TempDir::new().unwrap();
        let config = config(30, 1000);
        let first = manager(&dir, &config);
        for i in 0..30 {
            first.observe(Modality::Sensor, sample(i));
        }

        fs::write(
            dir.path().join("sensor/density/normalizer.json"),
            r#"{"mean":[0.0,0.0,0.0],"scale":[1.0,0.0,1.0]}"#,
        )
        .unwrap();

        let second = manager(&dir, &config);
        let status = second.status(Modality::Sensor).unwrap();
        assert_eq!(status.mode, Mode::Collecting);
        assert_eq!(second.predict(Modality::Sensor, &sample(0)), Assessment::neutral());
    }
}
