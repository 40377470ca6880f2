use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use log::{debug, error, info, warn};
use parking_lot::Mutex;

use super::ManagerStatus;
use crate::config::SequenceConfig;
use crate::error::ScoringError;
use crate::features::{build_tail_windows, build_windows, FeatureFrame, Window, WindowPolicy};
use crate::ml::{percentile, LstmAutoencoder, Normalizer, TrainableScorer};
use crate::models::{Assessment, Event, Modality, Mode, ModelKind, Verdict};
use crate::store::{Calibration, ModelMetadata, ModelStore};

/// Everything from one training run; replaced as a unit
struct FittedSequence<M> {
    normalizer: Normalizer,
    model: M,
    columns: Vec<String>,
    seq_len: usize,
    low: f64,
    high: f64,
}

struct SequenceState<M> {
    mode: Mode,
    buffer: VecDeque<Event>,
    capacity: usize,
    fitted: Option<FittedSequence<M>>,
    cycles_since_retrain: usize,
}

impl<M> SequenceState<M> {
    fn push(&mut self, event: Event) {
        while self.buffer.len() >= self.capacity {
            self.buffer.pop_front();
        }
        self.buffer.push_back(event);
    }
}

/// Per-modality lifecycle of the window reconstruction model.
///
/// Buffers raw events rather than feature vectors: the feature columns are
/// chosen from the data at every training run.
pub struct SequenceManager<M: TrainableScorer<Sample = Window> = LstmAutoencoder> {
    config: SequenceConfig,
    scorer_config: M::Config,
    store: Arc<ModelStore>,
    states: HashMap<Modality, Mutex<SequenceState<M>>>,
}

impl SequenceManager<LstmAutoencoder> {
    pub fn new(config: &SequenceConfig, store: Arc<ModelStore>) -> Self {
        Self::with_scorer_config(config, config.network.clone(), store)
    }
}

impl<M: TrainableScorer<Sample = Window>> SequenceManager<M> {
    /// Build the manager and restore any valid persisted models
    pub fn with_scorer_config(config: &SequenceConfig, scorer_config: M::Config, store: Arc<ModelStore>) -> Self {
        let states = Modality::ALL
            .iter()
            .map(|&modality| {
                let initial = config.initial_samples.get(modality);
                let mut state = SequenceState {
                    mode: Mode::Collecting,
                    buffer: VecDeque::new(),
                    capacity: config.retrain_interval + initial,
                    fitted: None,
                    cycles_since_retrain: 0,
                };

                let restored = store.load::<M>(modality, ModelKind::Sequence).and_then(|stored| {
                    match (stored.metadata.calibration, stored.metadata.seq_len) {
                        (Calibration::Band { low, high }, Some(seq_len)) => Some(FittedSequence {
                            normalizer: stored.normalizer,
                            model: stored.model,
                            columns: stored.metadata.feature_columns,
                            seq_len,
                            low,
                            high,
                        }),
                        _ => None,
                    }
                });

                match restored {
                    Some(fitted) => {
                        info!(
                            "[{}-sequence] Restored model (features={}, seq_len={}) -> inference",
                            modality,
                            fitted.columns.len(),
                            fitted.seq_len
                        );
                        state.fitted = Some(fitted);
                        state.mode = Mode::Inference;
                    }
                    None => {
                        info!("[{}-sequence] No model, collecting {} events before training", modality, initial);
                    }
                }

                (modality, Mutex::new(state))
            })
            .collect();

        SequenceManager {
            config: config.clone(),
            scorer_config,
            store,
            states,
        }
    }

    /// Buffer a raw event and drive the train / periodic retrain lifecycle
    pub fn observe(&self, modality: Modality, event: &Event) {
        let Some(state) = self.states.get(&modality) else {
            return;
        };
        let mut state = state.lock();
        state.push(event.clone());

        match state.mode {
            Mode::Collecting => {
                let count = state.buffer.len();
                let required = self.config.initial_samples.get(modality);
                if count % 25 == 0 || count == required {
                    info!("[{}-sequence] collecting {}/{}", modality, count, required);
                }
                if count >= required {
                    self.retrain(modality, &mut state);
                    state.cycles_since_retrain = 0;
                }
            }
            Mode::Inference => {
                state.cycles_since_retrain += 1;
                if state.cycles_since_retrain >= self.config.retrain_interval {
                    info!(
                        "[{}-sequence] Periodic retrain on {} events",
                        modality,
                        state.buffer.len()
                    );
                    let trained = self.retrain(modality, &mut state);
                    state.cycles_since_retrain = if trained {
                        0
                    } else {
                        state.cycles_since_retrain / 2
                    };
                }
            }
        }
    }

    /// Score every window of the buffer, keyed by the sequence index of the
    /// event each window ends at
    pub fn predict(&self, modality: Modality) -> BTreeMap<i64, Verdict> {
        self.predict_tail(modality, usize::MAX)
    }

    /// Score only the windows ending at the newest `count` buffered events
    pub fn predict_tail(&self, modality: Modality, count: usize) -> BTreeMap<i64, Verdict> {
        let mut verdicts = BTreeMap::new();
        let Some(state) = self.states.get(&modality) else {
            return verdicts;
        };
        let state = state.lock();

        let fitted = match (&state.mode, &state.fitted) {
            (Mode::Inference, Some(fitted)) => fitted,
            _ => return verdicts,
        };
        if state.buffer.is_empty() {
            return verdicts;
        }

        let frame = FeatureFrame::from_events(modality, &state.buffer);
        let scaled = fitted.normalizer.transform_all(&frame.select(&fitted.columns));
        let windows = build_tail_windows(&scaled, fitted.seq_len, WindowPolicy::Padded, count);
        let errors = fitted.model.score_all(&windows);

        let lower = fitted.low * self.config.low_multiplier;
        let upper = fitted.high * self.config.high_multiplier;

        for (window, error) in windows.iter().zip(errors) {
            if !error.is_finite() {
                warn!("[{}-sequence] Non-finite reconstruction error, window skipped", modality);
                continue;
            }
            let event = &state.buffer[window.end];
            let assessment = Assessment {
                score: error,
                is_anomaly: error <= lower || error >= upper,
            };
            verdicts.insert(
                event.sequence_index,
                Verdict::from_assessment(modality.as_str(), event, assessment),
            );
        }

        verdicts
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

    /// Returns whether training succeeded. Data problems leave the state as it
    /// was; numerical problems drop the fitted model and go back to collecting.
    fn retrain(&self, modality: Modality, state: &mut SequenceState<M>) -> bool {
        match self.train(modality, state) {
            Ok(fitted) => {
                info!(
                    "[{}-sequence] Training complete (features={}, seq_len={}) -> inference",
                    modality,
                    fitted.columns.len(),
                    fitted.seq_len
                );
                state.fitted = Some(fitted);
                state.mode = Mode::Inference;
                true
            }
            Err(e @ ScoringError::InsufficientData { .. }) | Err(e @ ScoringError::MissingFeatures(_)) => {
                warn!("[{}-sequence] Training skipped: {}", modality, e);
                false
            }
            Err(e) => {
                error!("[{}-sequence] {}", modality, e);
                state.fitted = None;
                state.mode = Mode::Collecting;
                false
            }
        }
    }

    fn train(&self, modality: Modality, state: &SequenceState<M>) -> Result<FittedSequence<M>, ScoringError> {
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
            kind: ModelKind::Sequence,
            reason,
        };

        let frame = FeatureFrame::from_events(modality, &state.buffer);
        let columns = frame.informative_columns();
        if columns.is_empty() {
            return Err(ScoringError::MissingFeatures(format!(
                "no varying numeric columns in {} buffered {} events",
                frame.len(),
                modality
            )));
        }

        let rows = frame.select(&columns);
        let normalizer = Normalizer::fit(&rows).map_err(|e| failure(e.to_string()))?;
        let scaled = normalizer.transform_all(&rows);

        let seq_len = self.config.seq_len.get(modality);
        let windows = build_windows(&scaled, seq_len, WindowPolicy::Strict);
        if windows.is_empty() {
            return Err(ScoringError::InsufficientData {
                modality,
                available: scaled.len(),
                required: seq_len,
            });
        }

        debug!(
            "[{}-sequence] Training on {} windows of {} x {}",
            modality,
            windows.len(),
            seq_len,
            columns.len()
        );
        let model = M::fit(&self.scorer_config, &windows).map_err(|e| failure(e.to_string()))?;

        let errors = model.score_all(&windows);
        let (low, high) = match (percentile(&errors, 1.0), percentile(&errors, 99.0)) {
            (Some(low), Some(high)) => (low, high),
            _ => return Err(failure("non-finite reconstruction errors".to_string())),
        };

        let fitted = FittedSequence {
            normalizer,
            model,
            columns,
            seq_len,
            low,
            high,
        };
        self.persist(modality, &fitted, state.buffer.len());
        Ok(fitted)
    }

    fn persist(&self, modality: Modality, fitted: &FittedSequence<M>, samples: usize) {
        let hyperparameters = serde_json::json!({
            "scorer": serde_json::to_value(&self.scorer_config).unwrap_or_default(),
            "low_multiplier": self.config.low_multiplier,
            "high_multiplier": self.config.high_multiplier,
        });
        let metadata = ModelMetadata::new(
            modality,
            ModelKind::Sequence,
            M::NAME,
            Calibration::Band {
                low: fitted.low,
                high: fitted.high,
            },
        )
        .with_hyperparameters(hyperparameters)
        .with_features(fitted.columns.clone(), fitted.seq_len)
        .with_training_samples(samples);

        if let Err(source) = self.store.save(
            modality,
            ModelKind::Sequence,
            &fitted.model,
            &fitted.normalizer,
            &metadata,
        ) {
            let err = ScoringError::PersistenceFailure {
                modality,
                kind: ModelKind::Sequence,
                source,
            };
            warn!("[{}-sequence] {}; keeping the in-memory model", modality, err);
        }
    }
}
