//! Feature engineering for behavioral events
//!
//! The density model consumes one fixed-dimension vector per event
//! (`extractor`); the sequence model consumes named numeric columns flattened
//! from the buffered raw events (`frame`) cut into fixed-length windows
//! (`window`).

pub mod extractor;
pub mod frame;
pub mod window;

use std::ops::Deref;

use serde::{Deserialize, Serialize};

pub use extractor::{extract, feature_names};
pub use frame::FeatureFrame;
pub use window::{build_tail_windows, build_windows, Window, WindowPolicy};

/// Fixed-dimension ordered numeric tuple
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector(pub Vec<f64>);

impl FeatureVector {
    pub fn zeros(dimension: usize) -> Self {
        FeatureVector(vec![0.0; dimension])
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.0
    }
}

impl Deref for FeatureVector {
    type Target = [f64];

    fn deref(&self) -> &[f64] {
        &self.0
    }
}

impl From<Vec<f64>> for FeatureVector {
    fn from(values: Vec<f64>) -> Self {
        FeatureVector(values)
    }
}
