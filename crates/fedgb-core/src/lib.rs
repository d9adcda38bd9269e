//! fedgb core - Foundation for federated gradient boosting
//!
//! Provides the error taxonomy, training configuration and shared types used
//! by every party, shard and coordinator in a federated boosting session.

pub mod config;
pub mod error;
pub mod types;

pub use config::{DistributionPolicy, FeatureBand, FgbParameter, PerShard, SampleTier, TrainingConfig};
pub use error::{Error, Result};
pub use types::*;
