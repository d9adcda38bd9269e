//! Local simulation of a federated boosting session
//!
//! This crate provides:
//! - **Coordinator**: drives phases 1-5 per node split across in-memory
//!   parties and walks the trees for inference
//! - **Sharded parties**: optionally runs every party as feature-range shards
//! - **Synthetic data**: seeded vertically partitioned datasets
//!
//! # Example
//!
//! ```no_run
//! use fedgb_crypto::PaillierTool;
//! use fedgb_sim::{generate, LocalCoordinator, SimConfig, SyntheticConfig};
//!
//! #[tokio::main]
//! async fn main() -> fedgb_core::Result<()> {
//!     let dataset = generate(&SyntheticConfig::default());
//!     let mut config = SimConfig::default();
//!     config.training.parameter.bit_length = 512;
//!
//!     let coordinator = LocalCoordinator::new(PaillierTool::default(), config, dataset.parties)?;
//!     let report = coordinator.train(&dataset.uids, &[]).await?;
//!     let prediction = coordinator.predict(&dataset.uids).await?;
//!     assert_eq!(prediction.values.len(), dataset.uids.len());
//!     println!("{} trees", report.trees);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod coordinator;
pub mod dataset;

pub use config::SimConfig;
pub use coordinator::{LocalCoordinator, Party, Prediction, TrainingReport};
pub use dataset::{generate, party_name, PartyData, SyntheticConfig, Task, VerticalDataset};
