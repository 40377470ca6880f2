use thiserror::Error;

use crate::models::{Modality, ModelKind};

/// Error types for the scoring engine.
///
/// None of these reach the caller of a scoring request: managers log them and
/// fall back to neutral verdicts.
#[derive(Error, Debug)]
pub enum ScoringError {
    #[error("Insufficient data for {modality}: {available}/{required}")]
    InsufficientData {
        modality: Modality,
        available: usize,
        required: usize,
    },

    #[error("Invalid persisted state for {modality}/{kind}: {reason}")]
    InvalidPersistedState {
        modality: Modality,
        kind: ModelKind,
        reason: String,
    },

    #[error("Training failed for {modality}/{kind}: {reason}")]
    TrainingFailure {
        modality: Modality,
        kind: ModelKind,
        reason: String,
    },

    #[error("Unknown modality for action label: {0}")]
    UnknownModality(String),

    #[error("Missing features: {0}")]
    MissingFeatures(String),

    #[error("Persistence failed for {modality}/{kind}: {source}")]
    PersistenceFailure {
        modality: Modality,
        kind: ModelKind,
        #[source]
        source: StoreError,
    },
}

/// Error types for the model store
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Validation error: {0}")]
    Validation(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

/// Error raised while fitting or validating a model
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModelError {
    #[error("Empty training data")]
    EmptyData,

    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Non-finite value encountered: {0}")]
    NonFinite(String),

    #[error("Invalid model structure: {0}")]
    InvalidStructure(String),
}

/// Error raised while loading recorded event logs
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to walk {path}: {source}")]
    Walk {
        path: String,
        #[source]
        source: walkdir::Error,
    },

    #[error("No event files found under {0}")]
    NoFiles(String),
}
