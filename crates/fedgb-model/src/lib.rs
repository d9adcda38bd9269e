//! fedgb model - Federated gradient boosting over vertically split data
//!
//! Every party runs one [`FederatedGbModel`]. The label-holding (active)
//! party grows the trees; passive parties only see encrypted gradients and
//! keep a private query table of the thresholds they disclosed.
//!
//! - **bucket**: column sorting, histogram bins and split-gain search
//! - **tree**: arena tree with level-wise growth and post-pruning
//! - **model**: the five training phases, shard sync and inference phases
//! - **message**: protocol messages, JSON-encodable
//! - **serialize**: line-oriented model text format

pub mod bucket;
pub mod data;
pub mod loss;
pub mod message;
pub mod metrics;
pub mod model;
pub mod query;
pub mod serialize;
pub mod tree;

pub use data::{inference_init, split_uids, BoostTrainData, InferenceData};
pub use loss::Loss;
pub use message::Message;
pub use model::{first_round_predict, multi_label_transform, FederatedGbModel, RoundOutcome, TrainingHandle};
pub use query::{QueryEntry, QueryTable};
pub use serialize::ModelSnapshot;
pub use tree::{NodeId, Tree, TreeNode};
