//! Online anomaly scoring for behavioral-biometric event streams

pub mod config;
pub mod detection;
pub mod error;
pub mod features;
pub mod ingest;
pub mod ml;
pub mod models;
pub mod service;
pub mod store;
pub mod utils;

pub use config::Config;
pub use detection::ScoringEngine;
pub use error::{IngestError, ModelError, ScoringError, StoreError};
pub use models::{Event, FusedVerdict, Modality, Verdict};
pub use service::ScoringService;
