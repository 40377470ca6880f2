use std::sync::Arc;

use log::debug;
use tokio::task::{self, JoinError};

use crate::config::Config;
use crate::detection::{EngineStatus, ScoringEngine};
use crate::models::{Event, FusedVerdict, Verdict};

/// Async front for the scoring engine.
///
/// Scoring trains models inline and can block for a long time, so every call
/// runs on the blocking thread pool. Clones share one engine.
#[derive(Clone)]
pub struct ScoringService {
    engine: Arc<ScoringEngine>,
}

impl ScoringService {
    pub fn new(config: &Config) -> Self {
        Self::from_engine(ScoringEngine::new(config))
    }

    pub fn from_engine(engine: ScoringEngine) -> Self {
        ScoringService {
            engine: Arc::new(engine),
        }
    }

    pub fn engine(&self) -> &ScoringEngine {
        &self.engine
    }

    pub async fn score(&self, events: Vec<Event>) -> Result<Vec<Verdict>, JoinError> {
        debug!("Scoring batch of {} events", events.len());
        let engine = self.engine.clone();
        task::spawn_blocking(move || engine.score_batch(&events)).await
    }

    pub async fn score_hybrid(&self, events: Vec<Event>) -> Result<Vec<FusedVerdict>, JoinError> {
        debug!("Scoring hybrid batch of {} events", events.len());
        let engine = self.engine.clone();
        task::spawn_blocking(move || engine.score_batch_hybrid(&events)).await
    }

    pub async fn status(&self) -> Result<EngineStatus, JoinError> {
        let engine = self.engine.clone();
        task::spawn_blocking(move || engine.status()).await
    }
}
