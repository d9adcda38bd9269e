//! Inference phases and model snapshots

use super::FederatedGbModel;
use crate::data::InferenceData;
use crate::message::{Direction, InferenceTrees, Message, RoutingDecision};
use crate::serialize::ModelSnapshot;
use crate::tree::Tree;
use fedgb_core::{Error, Result, Role};
use fedgb_crypto::EncryptionTool;
use tracing::{debug, info};

impl<E: EncryptionTool> FederatedGbModel<E> {
    /// Answer one inference phase
    ///
    /// Phase -1 aligns `data` to the coordinator's uid list and returns the
    /// trees if this party trained any. Phase -2 answers routing queries
    /// against the local query table.
    pub fn inference(&self, phase: i32, message: Message, data: &mut InferenceData) -> Result<Message> {
        match phase {
            -1 => {
                let uids = match message {
                    Message::Uids(uids) => uids,
                    other => return Err(Error::phase_mismatch(-1, "Uids", other.kind())),
                };
                let missing = data.filter_other_uid(&uids);
                if !missing.is_empty() {
                    debug!(missing = missing.len(), "Samples absent locally route left");
                }
                if self.trees.is_empty() {
                    return Ok(Message::Empty);
                }
                Ok(Message::InferenceTrees(InferenceTrees {
                    trees: self.trees.iter().map(Tree::without_instances).collect(),
                    first_round_pred: self.first_round_pred,
                    multi_class_labels: self.multi_class_labels.clone(),
                    eta: self.eta,
                    loss: self.loss,
                }))
            }
            -2 => {
                let queries = match message {
                    Message::RoutingQueries(queries) => queries,
                    other => return Err(Error::phase_mismatch(-2, "RoutingQueries", other.kind())),
                };
                let decisions = queries
                    .iter()
                    .map(|query| {
                        let entry = self.query_table.get(query.record_id).ok_or(
                            Error::UnknownRecord {
                                record_id: query.record_id,
                            },
                        )?;
                        let value = data.value(query.sample, entry.feature).ok_or_else(|| {
                            Error::InvalidData {
                                message: format!(
                                    "no value for sample {} feature {}",
                                    query.sample, entry.feature
                                ),
                            }
                        })?;
                        // NaN compares false and goes left
                        let direction = if value > entry.threshold {
                            Direction::Right
                        } else {
                            Direction::Left
                        };
                        Ok(RoutingDecision {
                            sample: query.sample,
                            tree: query.tree,
                            direction,
                        })
                    })
                    .collect::<Result<Vec<_>>>()?;
                Ok(Message::RoutingDecisions(decisions))
            }
            other => Err(Error::UnsupportedPhase { phase: other }),
        }
    }

    /// Everything needed to serve inference, without training state
    pub fn snapshot(&self) -> ModelSnapshot {
        ModelSnapshot {
            first_round_pred: self.first_round_pred,
            eta: self.eta,
            loss: self.loss,
            trees: self.trees.iter().map(Tree::without_instances).collect(),
            query_table: self.query_table.clone(),
            multi_class_labels: self.multi_class_labels.clone(),
        }
    }

    /// Load a stored model for inference
    pub fn restore(&mut self, snapshot: ModelSnapshot) {
        self.role = if snapshot.loss.is_some() {
            Role::HasLabel
        } else {
            Role::NoLabel
        };
        self.num_class = snapshot.loss.map_or(1, |l| l.num_class());
        self.first_round_pred = snapshot.first_round_pred;
        self.eta = snapshot.eta;
        self.loss = snapshot.loss;
        self.trees = snapshot.trees;
        self.query_table = snapshot.query_table;
        self.multi_class_labels = snapshot.multi_class_labels;
        info!(
            trees = self.trees.len(),
            records = self.query_table.len(),
            "Model restored"
        );
    }
}
