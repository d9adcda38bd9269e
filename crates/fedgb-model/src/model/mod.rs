//! Per-party federated boosting state machine
//!
//! One [`FederatedGbModel`] holds everything a party knows during a session:
//! predictions, gradients, keys, trees and its private query table. The
//! coordinator drives it through five phases per node split:
//!
//! 1. the active party opens a node (and on a new tree encrypts all g/h)
//! 2. passive parties sum encrypted g/h per bucket of every feature
//! 3. the active party decrypts, searches gains and picks the best split
//! 4. the owner of the winning feature discloses the left instance ids
//! 5. the active party splits the node and finishes the tree when no node
//!    is left to split

mod distributed;
mod inference;
mod phases;

pub use phases::RoundOutcome;

use crate::bucket::{Bucket, GhCache};
use crate::data::{split_uids, BoostTrainData};
use crate::loss::Loss;
use crate::message::Message;
use crate::query::QueryTable;
use crate::tree::{NodeId, Tree};
use fedgb_core::{
    Error, FeatureId, Features, FgbParameter, FirstPredictType, MetricLedger, ObjectiveType,
    Result, Role, SessionId, ShardInfo, TrainOptions,
};
use fedgb_crypto::{EncryptionTool, PaillierTool};
use rand::Rng;
use std::collections::HashMap;
use tracing::info;

/// Training data and identity of one session, returned by `train_init`
#[derive(Debug, Clone)]
pub struct TrainingHandle {
    pub session_id: SessionId,
    pub data: BoostTrainData,
    /// Uids held out from training
    pub test_uids: Vec<String>,
}

/// Federated gradient boosting model of one party (or one shard of a party)
#[derive(Debug, Clone)]
pub struct FederatedGbModel<E: EncryptionTool> {
    tool: E,
    role: Role,
    parameter: FgbParameter,
    loss: Option<Loss>,
    num_class: usize,
    /// Class whose tree is being grown
    num_class_round: usize,
    dataset_size: usize,
    label: Vec<f64>,
    /// pred[class][sample], raw margins
    pred: Vec<Vec<f64>>,
    grad: Vec<Vec<f64>>,
    hess: Vec<Vec<f64>>,
    first_round_pred: f64,
    eta: f64,
    multi_class_labels: Vec<f64>,
    private_key: Option<E::PrivateKey>,
    public_key: Option<E::PublicKey>,
    trees: Vec<Tree>,
    /// Node of the last tree going through phases 1-5
    current_node: Option<NodeId>,
    /// Node of the last tree each sample is currently routed to
    corresponding_node: Vec<NodeId>,
    query_table: QueryTable,
    gh_cache: GhCache<E>,
    /// Buckets of the last phase 2/3, keyed by local 1-based column
    sorted_features: HashMap<FeatureId, Vec<Bucket>>,
    metrics: MetricLedger,
    shard: Option<ShardInfo>,
}

impl Default for FederatedGbModel<PaillierTool> {
    fn default() -> Self {
        Self::new(PaillierTool::default())
    }
}

impl<E: EncryptionTool> FederatedGbModel<E> {
    /// Create an untrained model using the given encryption scheme
    pub fn new(tool: E) -> Self {
        Self {
            tool,
            role: Role::NoLabel,
            parameter: FgbParameter::default(),
            loss: None,
            num_class: 1,
            num_class_round: 0,
            dataset_size: 0,
            label: Vec::new(),
            pred: Vec::new(),
            grad: Vec::new(),
            hess: Vec::new(),
            first_round_pred: 0.0,
            eta: FgbParameter::default().eta,
            multi_class_labels: Vec::new(),
            private_key: None,
            public_key: None,
            trees: Vec::new(),
            current_node: None,
            corresponding_node: Vec::new(),
            query_table: QueryTable::new(),
            gh_cache: HashMap::new(),
            sorted_features: HashMap::new(),
            metrics: MetricLedger::default(),
            shard: None,
        }
    }

    /// Set up a training session
    ///
    /// `raw` is the party's table (header row first), `uids` the aligned
    /// sample ids and `test_index` the positions held out from training.
    /// The party holds the label iff `features.label` is set.
    pub fn train_init(
        &mut self,
        raw: &[Vec<String>],
        uids: &[String],
        test_index: &[usize],
        parameter: FgbParameter,
        features: &Features,
        options: TrainOptions,
    ) -> Result<TrainingHandle> {
        parameter.validate()?;
        let objective = parameter.objective_type()?;

        let (train_uids, test_uids) = split_uids(uids, test_index);
        let data = BoostTrainData::new(raw, &train_uids, features)?;

        self.role = if features.has_label() {
            Role::HasLabel
        } else {
            Role::NoLabel
        };
        self.num_class = if objective.is_multi_class() {
            parameter.num_class
        } else {
            1
        };
        self.num_class_round = 0;
        self.dataset_size = data.dataset_size();
        self.eta = parameter.eta;
        self.shard = options.shard;
        self.trees.clear();
        self.query_table = QueryTable::new();
        self.gh_cache.clear();
        self.sorted_features.clear();
        self.parameter = parameter;

        if self.role == Role::HasLabel {
            let label = data.label().ok_or_else(|| Error::InvalidData {
                message: "label column missing".to_string(),
            })?;
            self.init_label_state(objective, label)?;
        }

        let session_id = uuid::Uuid::new_v4().to_string();
        info!(
            session = %session_id,
            role = ?self.role,
            samples = self.dataset_size,
            features = data.feature_dim(),
            objective = %objective,
            shard = ?self.shard.as_ref().map(|s| s.model_id),
            "Training session initialized"
        );

        Ok(TrainingHandle {
            session_id,
            data,
            test_uids,
        })
    }

    fn init_label_state(&mut self, objective: ObjectiveType, raw_label: &[f64]) -> Result<()> {
        let mut label = raw_label.to_vec();
        let loss = Loss::for_objective(objective, self.num_class);

        if objective == ObjectiveType::CountPoisson {
            if let Some(bad) = label.iter().find(|l| **l <= 0.0) {
                return Err(Error::InvalidLabel {
                    message: format!("count:poisson requires positive labels, found {bad}"),
                });
            }
        }
        if objective.is_multi_class() {
            self.multi_class_labels = multi_label_transform(&mut label, self.num_class)?;
        } else {
            self.multi_class_labels.clear();
        }

        self.first_round_pred = first_round_predict(self.parameter.first_round_pred, &label, loss);
        if loss == Loss::PoissonLog {
            label.iter_mut().for_each(|l| *l = l.ln());
        }

        self.loss = Some(loss);
        self.label = label;
        self.pred = vec![vec![self.first_round_pred; self.dataset_size]; self.num_class];
        self.metrics = MetricLedger::new(&self.parameter.eval_metric, self.parameter.maximize);
        self.update_grad_hess()
    }

    /// Recompute gradients and hessians from the current predictions
    fn update_grad_hess(&mut self) -> Result<()> {
        let loss = self.loss.ok_or_else(|| Error::internal("loss not initialized"))?;
        self.grad = loss.grad(&self.pred, &self.label);
        self.hess = loss.hess(&self.pred, &self.label);

        let weight = self.parameter.scale_pos_weight;
        if weight != 1.0 {
            let k = self.num_class_round;
            for (i, y) in self.label.iter().enumerate() {
                if *y == 1.0 {
                    self.grad[k][i] *= weight;
                    self.hess[k][i] *= weight;
                }
            }
        }
        Ok(())
    }

    /// Dispatch one training phase
    pub fn train(&mut self, phase: i32, message: Message, handle: &TrainingHandle) -> Result<Message> {
        match phase {
            1 => self.train_phase1(message, &handle.data),
            2 => self.train_phase2(message, &handle.data),
            3 => self.train_phase3(message, &handle.data),
            4 => self.train_phase4(message),
            5 => self.train_phase5(message).map(|outcome| {
                Message::P5Response(outcome.response)
            }),
            other => Err(Error::UnsupportedPhase { phase: other }),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn trees(&self) -> &[Tree] {
        &self.trees
    }

    pub fn query_table(&self) -> &QueryTable {
        &self.query_table
    }

    pub fn loss(&self) -> Option<Loss> {
        self.loss
    }

    pub fn first_round_pred(&self) -> f64 {
        self.first_round_pred
    }

    pub fn eta(&self) -> f64 {
        self.eta
    }

    pub fn num_class(&self) -> usize {
        self.num_class
    }

    pub fn num_class_round(&self) -> usize {
        self.num_class_round
    }

    pub fn multi_class_labels(&self) -> &[f64] {
        &self.multi_class_labels
    }

    pub fn metrics(&self) -> &MetricLedger {
        &self.metrics
    }

    pub fn shard(&self) -> Option<&ShardInfo> {
        self.shard.as_ref()
    }

    /// Raw margins `pred[class][sample]` of the training samples
    pub fn predictions(&self) -> &[Vec<f64>] {
        &self.pred
    }

    pub fn grad(&self) -> &[Vec<f64>] {
        &self.grad
    }

    pub fn hess(&self) -> &[Vec<f64>] {
        &self.hess
    }

    /// Node currently being split in the last tree
    pub fn current_node(&self) -> Option<NodeId> {
        self.current_node
    }

    /// Node of the last tree each sample is routed to
    pub fn corresponding_node(&self) -> &[NodeId] {
        &self.corresponding_node
    }

    /// Shard index, 0 when not sharded
    fn model_id(&self) -> usize {
        self.shard.as_ref().map_or(0, |s| s.model_id)
    }

    /// Global feature id of a local column
    fn global_feature(&self, local: FeatureId) -> FeatureId {
        self.shard
            .as_ref()
            .and_then(|s| s.global_feature(local))
            .unwrap_or(local)
    }

    /// Local column of a global feature id, None if another shard owns it
    fn local_feature(&self, global: FeatureId) -> Option<FeatureId> {
        match &self.shard {
            Some(s) => s.local_feature(global),
            None => Some(global),
        }
    }
}

/// Remap labels to class indices in order of first appearance
///
/// Returns the original label of every class; missing classes are padded
/// with labels above the largest seen.
pub fn multi_label_transform(label: &mut [f64], num_class: usize) -> Result<Vec<f64>> {
    let mut classes: Vec<f64> = Vec::new();
    for y in label.iter_mut() {
        let index = match classes.iter().position(|c| c == y) {
            Some(i) => i,
            None => {
                classes.push(*y);
                classes.len() - 1
            }
        };
        *y = index as f64;
    }

    if classes.len() > num_class {
        return Err(Error::InvalidLabel {
            message: format!(
                "{} distinct labels exceed num_class {}",
                classes.len(),
                num_class
            ),
        });
    }

    let max = classes.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let missing = num_class - classes.len();
    classes.extend((0..missing).map(|i| max + 1.0 + i as f64));
    Ok(classes)
}

/// Smallest mean the Poisson log link starts from
const POISSON_MIN_MEAN: f64 = 1e-6;

/// Constant prediction every sample starts from, in margin space
///
/// Poisson margins are `ln` of the value, floored at [`POISSON_MIN_MEAN`] so
/// a zero draw or an empty label still gives a finite start.
pub fn first_round_predict(kind: FirstPredictType, label: &[f64], loss: Loss) -> f64 {
    let value = match kind {
        FirstPredictType::Zero => return 0.0,
        FirstPredictType::Avg => {
            if label.is_empty() {
                0.0
            } else {
                label.iter().sum::<f64>() / label.len() as f64
            }
        }
        FirstPredictType::Random => rand::thread_rng().gen::<f64>(),
    };
    match loss {
        Loss::PoissonLog => value.max(POISSON_MIN_MEAN).ln(),
        _ => value,
    }
}
