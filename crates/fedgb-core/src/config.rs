//! Training configuration types

use crate::error::{Error, Result};
use crate::types::{FirstPredictType, MetricType, ObjectiveType};
use serde::{Deserialize, Serialize};

/// Main training configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TrainingConfig {
    /// Boosting hyper-parameters
    pub parameter: FgbParameter,

    /// Shard-count policy for distributed parties
    pub distribution: DistributionPolicy,
}

impl TrainingConfig {
    pub fn validate(&self) -> Result<()> {
        self.parameter.validate()?;
        self.distribution.validate()
    }
}

/// Federated gradient boosting hyper-parameters
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FgbParameter {
    /// Number of boosting rounds (one tree per class per round)
    pub num_boost_round: usize,

    /// Constant prediction every sample starts from
    pub first_round_pred: FirstPredictType,

    /// Minimum hessian sum a node needs to keep splitting
    pub min_child_weight: f64,

    /// Maximum tree depth (root has depth 1)
    pub max_depth: usize,

    /// Learning rate applied to leaf scores
    pub eta: f64,

    /// Maximum number of buckets per feature
    pub num_bin: usize,

    /// Objective name, e.g. "binary:logistic"
    pub objective: String,

    /// Number of classes (forced to 1 for non multi-class objectives)
    pub num_class: usize,

    /// Metrics recorded after every round
    pub eval_metric: Vec<MetricType>,

    /// Key size for the homomorphic key pair, in bits
    pub bit_length: usize,

    /// L2 regularization on leaf weights
    pub lambda: f64,

    /// Minimum gain a split must exceed
    pub gamma: f64,

    /// Nodes with at most this many samples become leaves
    pub min_sample_split: usize,

    /// Gradient/hessian multiplier for samples labelled 1
    pub scale_pos_weight: f64,

    /// Whether larger metric values are better
    pub maximize: bool,
}

impl Default for FgbParameter {
    fn default() -> Self {
        Self {
            num_boost_round: 3,
            first_round_pred: FirstPredictType::Avg,
            min_child_weight: 1.0,
            max_depth: 5,
            eta: 0.3,
            num_bin: 33,
            objective: ObjectiveType::BinaryLogistic.as_str().to_string(),
            num_class: 1,
            eval_metric: vec![MetricType::Auc],
            bit_length: 1024,
            lambda: 1.0,
            gamma: 0.0,
            min_sample_split: 10,
            scale_pos_weight: 1.0,
            maximize: true,
        }
    }
}

impl FgbParameter {
    /// Parse the configured objective
    pub fn objective_type(&self) -> Result<ObjectiveType> {
        self.objective.parse()
    }

    /// Check value ranges; the objective itself is checked at training init
    pub fn validate(&self) -> Result<()> {
        let invalid = |message: &str| {
            Err(Error::InvalidConfig {
                message: message.to_string(),
            })
        };

        if !(self.eta > 0.0 && self.eta <= 1.0) {
            return invalid("eta must be in (0, 1]");
        }
        if self.num_bin < 2 {
            return invalid("num_bin must be at least 2");
        }
        if self.max_depth == 0 {
            return invalid("max_depth must be at least 1");
        }
        if self.lambda < 0.0 {
            return invalid("lambda must be non-negative");
        }
        if self.num_class == 0 {
            return invalid("num_class must be at least 1");
        }
        if self.scale_pos_weight <= 0.0 {
            return invalid("scale_pos_weight must be positive");
        }
        if self.bit_length < 128 || self.bit_length % 2 != 0 {
            return invalid("bit_length must be an even number of at least 128 bits");
        }
        Ok(())
    }
}

/// Features assigned to each shard within a feature-count band
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum PerShard {
    /// At most this many features per shard
    Fixed(usize),

    /// Every feature goes to a single shard
    All,
}

/// Feature-count band inside a sample tier
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FeatureBand {
    /// Inclusive upper bound on feature count (None = unbounded)
    pub max_features: Option<usize>,

    /// Features per shard within this band
    pub per_shard: PerShard,
}

/// Sample-count tier of the shard-count policy
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SampleTier {
    /// Inclusive upper bound on sample count (None = unbounded)
    pub max_samples: Option<usize>,

    /// Ordered feature bands; the first band that fits is used
    pub bands: Vec<FeatureBand>,
}

/// Decides how many shards a party splits its features into
///
/// Tiers and bands are scanned in order; the first whose bound holds wins.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DistributionPolicy {
    /// Ordered sample tiers
    pub tiers: Vec<SampleTier>,

    /// Optional hard cap on the shard count
    pub max_shards: Option<usize>,
}

impl Default for DistributionPolicy {
    fn default() -> Self {
        let band = |max_features: Option<usize>, per_shard: PerShard| FeatureBand {
            max_features,
            per_shard,
        };
        Self {
            tiers: vec![
                SampleTier {
                    max_samples: Some(100_000),
                    bands: vec![
                        band(Some(10), PerShard::Fixed(2)),
                        band(Some(20), PerShard::Fixed(5)),
                        band(Some(30), PerShard::Fixed(8)),
                        band(Some(40), PerShard::Fixed(10)),
                        band(None, PerShard::Fixed(20)),
                    ],
                },
                SampleTier {
                    max_samples: Some(2_000_000),
                    bands: vec![
                        band(Some(2), PerShard::Fixed(1)),
                        band(Some(60), PerShard::All),
                        band(None, PerShard::Fixed(58)),
                    ],
                },
                SampleTier {
                    max_samples: None,
                    bands: vec![band(None, PerShard::Fixed(10))],
                },
            ],
            max_shards: None,
        }
    }
}

impl DistributionPolicy {
    /// Policy that never shards
    pub fn single_shard() -> Self {
        Self {
            tiers: vec![SampleTier {
                max_samples: None,
                bands: vec![FeatureBand {
                    max_features: None,
                    per_shard: PerShard::All,
                }],
            }],
            max_shards: Some(1),
        }
    }

    /// Number of shards for a party with the given sample and feature counts
    pub fn shard_count(&self, samples: usize, features: usize) -> usize {
        if features == 0 {
            return 1;
        }

        let per_shard = self
            .tiers
            .iter()
            .find(|t| t.max_samples.map_or(true, |max| samples <= max))
            .and_then(|t| {
                t.bands
                    .iter()
                    .find(|b| b.max_features.map_or(true, |max| features <= max))
            })
            .map(|b| match b.per_shard {
                PerShard::Fixed(n) => n.max(1),
                PerShard::All => features,
            })
            .unwrap_or(features);

        let count = features.div_ceil(per_shard).max(1);
        match self.max_shards {
            Some(cap) => count.min(cap.max(1)),
            None => count,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.tiers.is_empty() {
            return Err(Error::InvalidConfig {
                message: "distribution policy needs at least one tier".to_string(),
            });
        }
        let fixed_zero = self.tiers.iter().flat_map(|t| &t.bands).any(|b| {
            b.per_shard == PerShard::Fixed(0)
        });
        if fixed_zero {
            return Err(Error::InvalidConfig {
                message: "features per shard must be positive".to_string(),
            });
        }
        Ok(())
    }
}
