//! Isolation forest density model
//!
//! Anomalies are easier to isolate and thus have shorter expected path lengths
//! in randomly built trees. Scores follow the decision-function convention:
//! positive for inliers, negative for outliers, shifted so that the
//! `contamination` fraction of training points scores below zero.

use rand::rngs::StdRng;
use rand::seq::index;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use super::{percentile, TrainableScorer};
use crate::error::ModelError;
use crate::features::FeatureVector;

const EULER_GAMMA: f64 = 0.577_215_664_901_532_9;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IsolationForestConfig {
    pub n_estimators: usize,
    pub contamination: f64,
    /// Upper bound on the per-tree subsample size
    pub max_samples: usize,
    pub seed: u64,
}

impl Default for IsolationForestConfig {
    fn default() -> Self {
        IsolationForestConfig {
            n_estimators: 200,
            contamination: 0.03,
            max_samples: 256,
            seed: 42,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IsolationForest {
    trees: Vec<IsolationTree>,
    /// Subsample size each tree was built from
    sample_size: usize,
    n_features: usize,
    /// Shift applied to raw scores so the contamination quantile sits at zero
    offset: f64,
}

impl IsolationForest {
    /// Raw isolation score in [-1, 0): the closer to -1, the more anomalous
    pub fn score_samples(&self, sample: &[f64]) -> f64 {
        let normalizer = average_path_length(self.sample_size);
        if self.trees.is_empty() || normalizer <= 0.0 {
            return -0.5;
        }

        let total: f64 = self.trees.iter().map(|tree| tree.path_length(sample)).sum();
        let mean_path = total / self.trees.len() as f64;

        -(2.0f64).powf(-mean_path / normalizer)
    }

    pub fn decision_function(&self, sample: &[f64]) -> f64 {
        self.score_samples(sample) - self.offset
    }

    pub fn n_estimators(&self) -> usize {
        self.trees.len()
    }
}

impl TrainableScorer for IsolationForest {
    type Config = IsolationForestConfig;
    type Sample = FeatureVector;

    const NAME: &'static str = "isolation_forest";

    fn fit(config: &IsolationForestConfig, data: &[FeatureVector]) -> Result<Self, ModelError> {
        let first = data.first().ok_or(ModelError::EmptyData)?;
        let n_features = first.len();
        if let Some(row) = data.iter().find(|row| row.len() != n_features) {
            return Err(ModelError::DimensionMismatch {
                expected: n_features,
                actual: row.len(),
            });
        }
        if data.iter().flat_map(|row| row.iter()).any(|v| !v.is_finite()) {
            return Err(ModelError::NonFinite("training data".into()));
        }
        if config.n_estimators == 0 {
            return Err(ModelError::InvalidStructure("n_estimators must be positive".into()));
        }

        let sample_size = config.max_samples.max(1).min(data.len());
        let max_depth = (sample_size as f64).log2().ceil().max(0.0) as usize;

        // Each tree draws from its own stream derived from the seed, so the
        // forest is identical however rayon schedules the work
        let trees: Vec<IsolationTree> = (0..config.n_estimators)
            .into_par_iter()
            .map(|i| {
                let mut rng = StdRng::seed_from_u64(config.seed.wrapping_add(i as u64));
                let picked: Vec<&[f64]> = index::sample(&mut rng, data.len(), sample_size)
                    .into_iter()
                    .map(|idx| data[idx].as_slice())
                    .collect();
                IsolationTree::build(&picked, n_features, max_depth, &mut rng)
            })
            .collect();

        let mut forest = IsolationForest {
            trees,
            sample_size,
            n_features,
            offset: 0.0,
        };

        let raw: Vec<f64> = data.par_iter().map(|row| forest.score_samples(row)).collect();
        forest.offset = percentile(&raw, 100.0 * config.contamination.clamp(0.0, 0.5))
            .ok_or_else(|| ModelError::NonFinite("training scores".into()))?;

        Ok(forest)
    }

    fn score(&self, sample: &FeatureVector) -> f64 {
        self.decision_function(sample)
    }

    fn input_dimension(&self) -> usize {
        self.n_features
    }

    fn validate(&self) -> Result<(), ModelError> {
        if self.trees.is_empty() {
            return Err(ModelError::InvalidStructure("forest has no trees".into()));
        }
        if self.n_features == 0 || self.sample_size == 0 {
            return Err(ModelError::InvalidStructure("forest was never fitted".into()));
        }
        if !self.offset.is_finite() {
            return Err(ModelError::NonFinite("score offset".into()));
        }
        self.trees
            .iter()
            .try_for_each(|tree| tree.root.validate(self.n_features))
    }

    fn score_all(&self, samples: &[FeatureVector]) -> Vec<f64> {
        samples.par_iter().map(|s| self.score(s)).collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IsolationTree {
    root: IsolationNode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum IsolationNode {
    Internal {
        feature: usize,
        split: f64,
        left: Box<IsolationNode>,
        right: Box<IsolationNode>,
    },
    Leaf {
        size: usize,
        /// Set when every sample reaching the leaf was identical
        point: Option<Vec<f64>>,
    },
}

impl IsolationTree {
    fn build<R: Rng>(samples: &[&[f64]], n_features: usize, max_depth: usize, rng: &mut R) -> Self {
        IsolationTree {
            root: Self::build_node(samples, n_features, 0, max_depth, rng),
        }
    }

    fn build_node<R: Rng>(
        samples: &[&[f64]],
        n_features: usize,
        depth: usize,
        max_depth: usize,
        rng: &mut R,
    ) -> IsolationNode {
        if samples.len() <= 1 || depth >= max_depth {
            return IsolationNode::Leaf {
                size: samples.len(),
                point: None,
            };
        }

        // Only features that still vary can split the node
        let ranges: Vec<(usize, f64, f64)> = (0..n_features)
            .filter_map(|feature| {
                let (min, max) = samples.iter().fold((f64::MAX, f64::MIN), |(lo, hi), s| {
                    (lo.min(s[feature]), hi.max(s[feature]))
                });
                (max > min).then_some((feature, min, max))
            })
            .collect();

        if ranges.is_empty() {
            return IsolationNode::Leaf {
                size: samples.len(),
                point: Some(samples[0].to_vec()),
            };
        }

        let (feature, min, max) = ranges[rng.gen_range(0..ranges.len())];
        let split = rng.gen_range(min..max);

        let (left, right): (Vec<&[f64]>, Vec<&[f64]>) =
            samples.iter().copied().partition(|s| s[feature] < split);

        IsolationNode::Internal {
            feature,
            split,
            left: Box::new(Self::build_node(&left, n_features, depth + 1, max_depth, rng)),
            right: Box::new(Self::build_node(&right, n_features, depth + 1, max_depth, rng)),
        }
    }

    fn path_length(&self, sample: &[f64]) -> f64 {
        let mut node = &self.root;
        let mut depth = 0usize;

        loop {
            match node {
                IsolationNode::Internal {
                    feature,
                    split,
                    left,
                    right,
                } => {
                    let value = sample.get(*feature).copied().unwrap_or(0.0);
                    node = if value < *split { left.as_ref() } else { right.as_ref() };
                    depth += 1;
                }
                IsolationNode::Leaf { size, point } => {
                    let differs = point
                        .as_ref()
                        .map(|p| p.iter().zip(sample).any(|(a, b)| a != b))
                        .unwrap_or(false);
                    return if differs {
                        // Isolated one level below a leaf of identical samples
                        depth as f64 + 1.0
                    } else {
                        depth as f64 + average_path_length(*size)
                    };
                }
            }
        }
    }
}

impl IsolationNode {
    fn validate(&self, n_features: usize) -> Result<(), ModelError> {
        match self {
            IsolationNode::Internal {
                feature,
                split,
                left,
                right,
            } => {
                if *feature >= n_features {
                    return Err(ModelError::DimensionMismatch {
                        expected: n_features,
                        actual: feature + 1,
                    });
                }
                if !split.is_finite() {
                    return Err(ModelError::NonFinite("split value".into()));
                }
                left.validate(n_features)?;
                right.validate(n_features)
            }
            IsolationNode::Leaf { point, .. } => match point {
                Some(p) if p.len() != n_features => Err(ModelError::DimensionMismatch {
                    expected: n_features,
                    actual: p.len(),
                }),
                _ => Ok(()),
            },
        }
    }
}

/// Average path length of an unsuccessful BST search over `n` points, c(n)
fn average_path_length(n: usize) -> f64 {
    match n {
        0 | 1 => 0.0,
        2 => 1.0,
        _ => {
            let n = n as f64;
            2.0 * ((n - 1.0).ln() + EULER_GAMMA) - 2.0 * (n - 1.0) / n
        }
    }
}
