use serde::{Deserialize, Serialize};

use crate::error::ModelError;
use crate::features::FeatureVector;

/// Standard-score normalizer: per-column mean and population standard deviation.
///
/// Columns with zero variance keep a scale of 1.0 so they pass through centred.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Normalizer {
    mean: Vec<f64>,
    scale: Vec<f64>,
}

impl Normalizer {
    pub fn fit(data: &[FeatureVector]) -> Result<Self, ModelError> {
        let first = data.first().ok_or(ModelError::EmptyData)?;
        let dimension = first.len();
        if dimension == 0 {
            return Err(ModelError::InvalidStructure("zero-width feature vectors".into()));
        }

        let mut mean = vec![0.0; dimension];
        for row in data {
            if row.len() != dimension {
                return Err(ModelError::DimensionMismatch {
                    expected: dimension,
                    actual: row.len(),
                });
            }
            for (m, v) in mean.iter_mut().zip(row.iter()) {
                *m += v;
            }
        }
        let n = data.len() as f64;
        mean.iter_mut().for_each(|m| *m /= n);

        let mut variance = vec![0.0; dimension];
        for row in data {
            for ((acc, v), m) in variance.iter_mut().zip(row.iter()).zip(&mean) {
                *acc += (v - m) * (v - m);
            }
        }

        let scale = variance
            .into_iter()
            .map(|var| {
                let std = (var / n).sqrt();
                if std > f64::EPSILON {
                    std
                } else {
                    1.0
                }
            })
            .collect();

        let normalizer = Normalizer { mean, scale };
        normalizer.validate()?;
        Ok(normalizer)
    }

    pub fn dimension(&self) -> usize {
        self.mean.len()
    }

    /// Normalize one vector; extra columns are ignored, missing ones read as 0
    pub fn transform(&self, values: &[f64]) -> FeatureVector {
        FeatureVector(
            self.mean
                .iter()
                .zip(&self.scale)
                .enumerate()
                .map(|(i, (m, s))| (values.get(i).copied().unwrap_or(0.0) - m) / s)
                .collect(),
        )
    }

    pub fn transform_all(&self, data: &[FeatureVector]) -> Vec<FeatureVector> {
        data.iter().map(|row| self.transform(row)).collect()
    }

    /// Fitted means non-empty, equal lengths, finite statistics, positive scales
    pub fn validate(&self) -> Result<(), ModelError> {
        if self.mean.is_empty() {
            return Err(ModelError::InvalidStructure("normalizer is not fitted".into()));
        }
        if self.mean.len() != self.scale.len() {
            return Err(ModelError::DimensionMismatch {
                expected: self.mean.len(),
                actual: self.scale.len(),
            });
        }
        if self.mean.iter().chain(&self.scale).any(|v| !v.is_finite()) {
            return Err(ModelError::NonFinite("normalizer statistics".into()));
        }
        if self.scale.iter().any(|s| *s <= 0.0) {
            return Err(ModelError::InvalidStructure("non-positive normalizer scale".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rows(values: &[[f64; 2]]) -> Vec<FeatureVector> {
        values.iter().map(|r| FeatureVector(r.to_vec())).collect()
    }

    #[test]
    fn test_fit_uses_population_std() {
        let normalizer = Normalizer::fit(&rows(&[[1.0, 5.0], [3.0, 5.0]])).unwrap();

        assert_eq!(normalizer.transform(&[3.0, 5.0]).0, vec![1.0, 0.0]);
        assert_eq!(normalizer.transform(&[1.0, 7.0]).0, vec![-1.0, 2.0]);
    }

    #[test]
    fn test_zero_variance_column_passes_through_centred() {
        let normalizer = Normalizer::fit(&rows(&[[0.0, 0.0], [0.0, 0.0], [0.0, 0.0]])).unwrap();

        assert_eq!(normalizer.transform(&[1000.0, -2.0]).0, vec![1000.0, -2.0]);
        assert!(normalizer.validate().is_ok());
    }

    #[test]
    fn test_fit_rejects_bad_input() {
        assert_eq!(Normalizer::fit(&[]), Err(ModelError::EmptyData));

        let ragged = vec![FeatureVector(vec![1.0, 2.0]), FeatureVector(vec![1.0])];
        assert!(matches!(
            Normalizer::fit(&ragged),
            Err(ModelError::DimensionMismatch { expected: 2, actual: 1 })
        ));
    }

    #[test]
    fn test_validate_rejects_unfitted_state() {
        let unfitted: Normalizer = serde_json::from_str(r#"{"mean":[],"scale":[]}"#).unwrap();
        assert!(unfitted.validate().is_err());

        let ragged: Normalizer = serde_json::from_str(r#"{"mean":[0.0,1.0],"scale":[1.0]}"#).unwrap();
        assert!(ragged.validate().is_err());

        let zero_scale: Normalizer = serde_json::from_str(r#"{"mean":[0.0],"scale":[0.0]}"#).unwrap();
        assert!(zero_scale.validate().is_err());
    }
}
