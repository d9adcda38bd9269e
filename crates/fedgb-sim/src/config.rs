//! Simulation configuration

use crate::dataset::SyntheticConfig;
use fedgb_core::{Result, TrainingConfig};
use serde::{Deserialize, Serialize};

/// Coordinator configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SimConfig {
    /// Hyper-parameters and shard-count policy
    pub training: TrainingConfig,

    /// Run every party as feature-range shards
    pub sharded: bool,

    /// Every n-th aligned sample is held out for inference (0 = none)
    pub holdout_every: usize,

    /// Dataset generated by the simulator binary
    pub dataset: SyntheticConfig,
}

impl SimConfig {
    pub fn validate(&self) -> Result<()> {
        self.training.validate()
    }

    /// Positions held out from training
    pub fn test_index(&self, samples: usize) -> Vec<usize> {
        match self.holdout_every {
            0 => Vec::new(),
            n => (0..samples).filter(|i| i % n == n - 1).collect(),
        }
    }

    /// Load from JSON; absent fields keep their defaults
    pub fn from_json(s: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(s)?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json() {
        let config = SimConfig::from_json(
            r#"{"sharded": true, "holdout_every": 4, "training": {"parameter": {"max_depth": 3}}}"#,
        )
        .unwrap();
        assert!(config.sharded);
        assert_eq!(config.training.parameter.max_depth, 3);
        assert_eq!(config.training.parameter.num_bin, 33);
        assert_eq!(config.test_index(10), vec![3, 7]);
    }

    #[test]
    fn test_invalid_parameter_rejected() {
        let err = SimConfig::from_json(r#"{"training": {"parameter": {"eta": 2.0}}}"#).unwrap_err();
        assert!(matches!(err, fedgb_core::Error::InvalidConfig { .. }));
    }
}
