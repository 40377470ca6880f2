//! Per-modality model managers and the batch scoring engine driving them

pub mod density;
pub mod fusion;
pub mod sequence;

use std::collections::BTreeMap;
use std::panic;
use std::sync::Arc;
use std::thread;

use log::debug;
use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;

use crate::config::Config;
use crate::features::extract;
use crate::models::{Event, FusedVerdict, Modality, Mode, Verdict, UNKNOWN_MODALITY};
use crate::store::ModelStore;

pub use density::DensityManager;
pub use fusion::{combine, fuse};
pub use sequence::SequenceManager;

/// Snapshot of one manager's lifecycle for one modality
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ManagerStatus {
    pub mode: Mode,
    pub buffered: usize,
    pub capacity: usize,
    pub required_samples: usize,
    pub cycles_since_retrain: usize,
    pub trained: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModalityStatus {
    pub density: ManagerStatus,
    pub sequence: ManagerStatus,
}

pub type EngineStatus = BTreeMap<Modality, ModalityStatus>;

/// Batch entry point: routes events to their modality, drives both managers
/// and fuses their verdicts. Modalities are scored in parallel, one scoped
/// thread per modality group; events of one modality are processed in arrival
/// order.
///
/// A batch holds its modality's scope for the whole group, so concurrent
/// batches for the same modality never interleave their events in either
/// manager.
pub struct ScoringEngine {
    density: DensityManager,
    sequence: SequenceManager,
    scopes: BTreeMap<Modality, Mutex<()>>,
}

impl ScoringEngine {
    /// Create the engine, restoring persisted models from `config.model_dir`
    pub fn new(config: &Config) -> Self {
        let store = Arc::new(ModelStore::new(&config.model_dir));
        Self::with_managers(
            DensityManager::new(&config.density, store.clone()),
            SequenceManager::new(&config.sequence, store),
        )
    }

    pub fn with_managers(density: DensityManager, sequence: SequenceManager) -> Self {
        ScoringEngine {
            density,
            sequence,
            scopes: Modality::ALL.iter().map(|&m| (m, Mutex::new(()))).collect(),
        }
    }

    fn scope(&self, modality: Modality) -> Option<MutexGuard<'_, ()>> {
        self.scopes.get(&modality).map(|scope| scope.lock())
    }

    pub fn density(&self) -> &DensityManager {
        &self.density
    }

    pub fn sequence(&self) -> &SequenceManager {
        &self.sequence
    }

    /// Density verdict per event, in input order. The sequence model still
    /// observes every event so it keeps learning.
    pub fn score_batch(&self, events: &[Event]) -> Vec<Verdict> {
        let (groups, unknown) = group_by_modality(events);

        let mut slots: Vec<Option<Verdict>> = vec![None; events.len()];
        for position in unknown {
            slots[position] = Some(Verdict::neutral(UNKNOWN_MODALITY, &events[position]));
        }

        let scored = per_group(&groups, |modality, positions| {
            let _scope = self.scope(modality);
            positions
                .iter()
                .map(|&position| {
                    let event = &events[position];
                    let vector = extract(modality, event.params.as_ref());

                    self.density.observe(modality, vector.clone());
                    self.sequence.observe(modality, event);
                    let assessment = self.density.predict(modality, &vector);

                    (
                        position,
                        Verdict::from_assessment(modality.as_str(), event, assessment),
                    )
                })
                .collect()
        });

        for (position, verdict) in scored {
            slots[position] = Some(verdict);
        }
        slots.into_iter().flatten().collect()
    }

    /// Fused density and sequence verdict per event, in input order
    pub fn score_batch_hybrid(&self, events: &[Event]) -> Vec<FusedVerdict> {
        let (groups, unknown) = group_by_modality(events);

        let mut slots: Vec<Option<FusedVerdict>> = vec![None; events.len()];
        for position in unknown {
            let neutral = Verdict::neutral(UNKNOWN_MODALITY, &events[position]);
            slots[position] = Some(fuse(&neutral, None));
        }

        let scored = per_group(&groups, |modality, positions| {
            self.score_group_hybrid(modality, events, positions)
        });

        for (position, verdict) in scored {
            slots[position] = Some(verdict);
        }
        slots.into_iter().flatten().collect()
    }

    fn score_group_hybrid(&self, modality: Modality, events: &[Event], positions: &[usize]) -> Vec<(usize, FusedVerdict)> {
        let _scope = self.scope(modality);

        // Sequence model sees the whole group before scoring
        for &position in positions {
            self.sequence.observe(modality, &events[position]);
        }

        let density_verdicts: Vec<Verdict> = positions
            .iter()
            .map(|&position| {
                let event = &events[position];
                let vector = extract(modality, event.params.as_ref());
                self.density.observe(modality, vector.clone());
                let assessment = self.density.predict(modality, &vector);
                Verdict::from_assessment(modality.as_str(), event, assessment)
            })
            .collect();

        let sequence_verdicts = self.sequence.predict_tail(modality, positions.len());
        debug!(
            "[{}] {} events, {} sequence verdicts",
            modality,
            positions.len(),
            sequence_verdicts.len()
        );

        positions
            .iter()
            .zip(&density_verdicts)
            .map(|(&position, density)| {
                let sequence = sequence_verdicts.get(&density.sequence_index);
                (position, fuse(density, sequence))
            })
            .collect()
    }

    pub fn status(&self) -> EngineStatus {
        Modality::ALL
            .iter()
            .filter_map(|&modality| {
                let density = self.density.status(modality)?;
                let sequence = self.sequence.status(modality)?;
                Some((modality, ModalityStatus { density, sequence }))
            })
            .collect()
    }
}

/// Run `score` for every modality group and gather the results.
///
/// Groups hold modality locks while training, and training calls into rayon.
/// Running them on scoped threads rather than as rayon jobs keeps a pool
/// worker from stealing a second group that waits on a lock it already holds.
fn per_group<T, F>(groups: &[(Modality, Vec<usize>)], score: F) -> Vec<(usize, T)>
where
    T: Send,
    F: Fn(Modality, &[usize]) -> Vec<(usize, T)> + Sync,
{
    if let [(modality, positions)] = groups {
        return score(*modality, positions.as_slice());
    }

    thread::scope(|s| {
        let workers: Vec<_> = groups
            .iter()
            .map(|(modality, positions)| {
                let score = &score;
                s.spawn(move || score(*modality, positions.as_slice()))
            })
            .collect();

        workers
            .into_iter()
            .flat_map(|worker| worker.join().unwrap_or_else(|payload| panic::resume_unwind(payload)))
            .collect()
    })
}

/// Positions of events per modality (arrival order kept) and of unroutable events
fn group_by_modality(events: &[Event]) -> (Vec<(Modality, Vec<usize>)>, Vec<usize>) {
    let mut groups: BTreeMap<Modality, Vec<usize>> = BTreeMap::new();
    let mut unknown = Vec::new();

    for (position, event) in events.iter().enumerate() {
        match event.modality() {
            Some(modality) => groups.entry(modality).or_default().push(position),
            None => unknown.push(position),
        }
    }

    (groups.into_iter().collect(), unknown)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PerModality;
    use crate::ml::{AutoencoderConfig, IsolationForestConfig};
    use crate::models::Params;
    use serde_json::json;
    use tempfile::TempDir;

    fn engine(dir: &TempDir, initial: usize) -> ScoringEngine {
        let mut config = Config {
            model_dir: dir.path().to_path_buf(),
            ..Config::default()
        };
        config.density.initial_samples = PerModality::uniform(initial);
        config.density.forest = IsolationForestConfig {
            n_estimators: 50,
            ..IsolationForestConfig::default()
        };
        config.sequence.initial_samples = PerModality::uniform(initial);
        config.sequence.seq_len = PerModality::uniform(4);
        config.sequence.network = AutoencoderConfig {
            hidden_dim: 4,
            latent_dim: 2,
            epochs: 2,
            ..AutoencoderConfig::default()
        };
        ScoringEngine::new(&config)
    }

    fn event(action: &str, seq: i64, params: serde_json::Value) -> Event {
        let params: Params = params.as_object().cloned().unwrap_or_default();
        Event::new(action, seq, params)
    }

    #[test]
    fn test_unknown_modality_is_neutral_and_batch_continues() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir, 100);

        let events = vec![
            event("network_wifi", 1, json!({"ssid": "home"})),
            event("sensor_accel", 2, json!({"x": 0.1, "y": 0.2, "z": 9.8})),
            event("keyboard", 3, json!({})),
        ];
        let verdicts = engine.score_batch(&events);

        assert_eq!(verdicts.len(), 3);
        assert_eq!(verdicts[0].modality, UNKNOWN_MODALITY);
        assert_eq!(verdicts[1].modality, "sensor");
        assert_eq!(verdicts[2].modality, UNKNOWN_MODALITY);
        assert!(verdicts.iter().all(|v| v.score == 0.0 && !v.is_anomaly));
        assert_eq!(verdicts[2].sequence_index, 3);
    }

    #[test]
    fn test_constant_sensor_stream_then_outlier() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir, 500);

        let warmup: Vec<Event> = (0..500)
            .map(|i| event("sensor_accelerometer", i, json!({"x": 0.0, "y": 0.0, "z": 0.0})))
            .collect();
        engine.score_batch(&warmup);
        assert_eq!(engine.status()[&Modality::Sensor].density.mode, Mode::Inference);

        let probes = vec![
            event("sensor_accelerometer", 500, json!({"x": 0.0, "y": 0.0, "z": 0.0})),
            event("sensor_accelerometer", 501, json!({"x": 1000.0, "y": 1000.0, "z": 1000.0})),
        ];
        let verdicts = engine.score_batch(&probes);

        assert!(!verdicts[0].is_anomaly);
        assert!(verdicts[1].is_anomaly);
    }

    #[test]
    fn test_zero_duration_drags() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir, 25);

        let drags: Vec<Event> = (0..25)
            .map(|i| {
                event(
                    "touch_drag",
                    i,
                    json!({"duration": 0, "total_distance": 5.0 * i as f64, "drag_direction": "down"}),
                )
            })
            .collect();
        let verdicts = engine.score_batch(&drags);

        assert_eq!(verdicts.len(), 25);
        assert!(verdicts.iter().all(|v| v.score.is_finite()));
        assert_eq!(engine.status()[&Modality::TouchDrag].density.mode, Mode::Inference);
    }

    #[test]
    fn test_hybrid_returns_one_verdict_per_event_in_order() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir, 20);

        let events: Vec<Event> = (0..60)
            .map(|i| {
                let t = i as f64 * 0.3;
                match i % 3 {
                    0 => event("sensor_gyro", i, json!({"x": t.sin(), "y": t.cos(), "z": t})),
                    1 => event("touch_pressure", i, json!({"x": 10.0 * t.sin(), "y": 5.0 * t, "size": 0.1 * t})),
                    _ => event("network_lte", i, json!({})),
                }
            })
            .collect();

        let fused = engine.score_batch_hybrid(&events);
        assert_eq!(fused.len(), events.len());
        for (verdict, event) in fused.iter().zip(&events) {
            assert_eq!(verdict.sequence_index, event.sequence_index);
        }

        // Each of the scored modalities has seen 20 events and trained
        let status = engine.status();
        assert_eq!(status[&Modality::Sensor].density.mode, Mode::Inference);
        assert_eq!(status[&Modality::Sensor].sequence.mode, Mode::Inference);
        assert_eq!(status[&Modality::TouchDrag].density.buffered, 0);

        let more: Vec<Event> = (60..66)
            .map(|i| event("sensor_gyro", i, json!({"x": 0.5, "y": -0.5, "z": i as f64 * 0.3})))
            .collect();
        let fused = engine.score_batch_hybrid(&more);
        assert_eq!(fused.len(), 6);
        assert!(fused.iter().all(|v| v.modality == "sensor"));
        assert!(fused.iter().any(|v| v.anomaly_score_sequence != 0.0));
        for v in &fused {
            assert_eq!(v.is_anomaly_combined, v.is_anomaly_density || v.is_anomaly_sequence);
        }
    }

    #[test]
    fn test_concurrent_hybrid_batches_keep_sequence_verdicts() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir, 40);

        let gyro = |i: i64| {
            let t = i as f64 * 0.37;
            event("sensor_gyro", i, json!({"x": t.sin(), "y": t.cos(), "z": (0.5 * t).sin()}))
        };
        let warmup: Vec<Event> = (0..40).map(gyro).collect();
        engine.score_batch_hybrid(&warmup);
        assert_eq!(engine.status()[&Modality::Sensor].sequence.mode, Mode::Inference);

        let missing: usize = std::thread::scope(|s| {
            let workers: Vec<_> = (0..4i64)
                .map(|worker| {
                    let engine = &engine;
                    s.spawn(move || {
                        let mut missing = 0;
                        for batch in 0..30i64 {
                            let start = 10_000 + worker * 1_000 + batch * 10;
                            let events: Vec<Event> = (start..start + 10).map(gyro).collect();
                            let fused = engine.score_batch_hybrid(&events);
                            assert_eq!(fused.len(), 10);
                            missing += fused.iter().filter(|v| v.anomaly_score_sequence == 0.0).count();
                        }
                        missing
                    })
                })
                .collect();
            workers.into_iter().map(|w| w.join().unwrap()).sum()
        });

        assert_eq!(missing, 0);
    }

    #[test]
    fn test_status_covers_every_modality() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir, 10);

        let status = engine.status();
        assert_eq!(status.len(), Modality::ALL.len());
        for modality_status in status.values() {
            assert_eq!(modality_status.density.mode, Mode::Collecting);
            assert_eq!(modality_status.density.required_samples, 10);
        }
    }
}
