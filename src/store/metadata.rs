use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::models::{Modality, ModelKind};

/// Decision boundary derived from the training score distribution
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Calibration {
    /// Density model: scores at or below `value - margin` are anomalous
    Threshold { value: f64 },
    /// Sequence model: errors outside the scaled `[low, high]` band are anomalous
    Band { low: f64, high: f64 },
}

impl Calibration {
    pub fn is_valid_for(&self, kind: ModelKind) -> bool {
        match (self, kind) {
            (Calibration::Threshold { value }, ModelKind::Density) => value.is_finite(),
            (Calibration::Band { low, high }, ModelKind::Sequence) => {
                low.is_finite() && high.is_finite() && low <= high
            }
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelMetadata {
    pub modality: Modality,
    pub kind: ModelKind,
    /// Scorer implementation name
    pub model: String,
    pub artifact_id: Uuid,
    pub saved_at: DateTime<Utc>,
    pub calibration: Calibration,
    pub hyperparameters: Value,
    #[serde(default)]
    pub feature_columns: Vec<String>,
    #[serde(default)]
    pub seq_len: Option<usize>,
    pub training_samples: usize,
}

impl ModelMetadata {
    pub fn new(modality: Modality, kind: ModelKind, model: &str, calibration: Calibration) -> Self {
        ModelMetadata {
            modality,
            kind,
            model: model.to_string(),
            artifact_id: Uuid::new_v4(),
            saved_at: Utc::now(),
            calibration,
            hyperparameters: Value::Null,
            feature_columns: Vec::new(),
            seq_len: None,
            training_samples: 0,
        }
    }

    pub fn with_hyperparameters(mut self, hyperparameters: Value) -> Self {
        self.hyperparameters = hyperparameters;
        self
    }

    pub fn with_features(mut self, feature_columns: Vec<String>, seq_len: usize) -> Self {
        self.feature_columns = feature_columns;
        self.seq_len = Some(seq_len);
        self
    }

    pub fn with_training_samples(mut self, training_samples: usize) -> Self {
        self.training_samples = training_samples;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_calibration_matches_kind() {
        assert!(Calibration::Threshold { value: -0.01 }.is_valid_for(ModelKind::Density));
        assert!(!Calibration::Threshold { value: f64::NAN }.is_valid_for(ModelKind::Density));
        assert!(!Calibration::Threshold { value: 0.0 }.is_valid_for(ModelKind::Sequence));
        assert!(Calibration::Band { low: 0.1, high: 0.4 }.is_valid_for(ModelKind::Sequence));
        assert!(!Calibration::Band { low: 0.5, high: 0.4 }.is_valid_for(ModelKind::Sequence));
    }

    #[test]
    fn test_calibration_serialized_with_tag() {
        let json = serde_json::to_value(Calibration::Band { low: 0.1, high: 0.9 }).unwrap();
        assert_eq!(json["type"], "band");
        assert_eq!(json["high"], 0.9);
    }
}
