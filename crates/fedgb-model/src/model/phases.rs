//! The five training phases

use super::FederatedGbModel;
use crate::bucket::{
    best_split, compute_gain, gh_sum, process_each_numeric_feature, sort_and_group, Bucket,
};
use crate::data::BoostTrainData;
use crate::message::{
    CipherPair, EncryptedGradHess, FeatureLeftGH, LeftTreeInfo, Message, P2Response, P3Response,
    P5Response, SplitChoice, SubModel,
};
use crate::metrics::calculate_metrics;
use crate::tree::{LeafCondition, NodeId, Tree, TreeNode};
use crate::loss::Loss;
use fedgb_core::{Error, FeatureId, MetricType, Result, Role, SampleId};
use fedgb_crypto::EncryptionTool;
use rayon::prelude::*;
use std::collections::BTreeMap;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Everything phase 5 changed
#[derive(Debug, Clone)]
pub struct RoundOutcome {
    pub response: P5Response,
    /// Class round after the update
    pub num_class_round: usize,
    /// Depth of the node that was split
    pub depth: usize,
    pub tree_finished: bool,
    /// Node that was split or closed
    pub current_node: Option<NodeId>,
    /// Node of the active tree each sample is routed to
    pub node_assignment: Vec<NodeId>,
    pub pred: Vec<Vec<f64>>,
    pub grad: Vec<Vec<f64>>,
    pub hess: Vec<Vec<f64>>,
    /// Metrics recorded when a full boosting round completed
    pub metrics: Option<BTreeMap<MetricType, f64>>,
}

fn pick_better(best: Option<SplitChoice>, candidate: SplitChoice) -> Option<SplitChoice> {
    match best {
        Some(b) if candidate.gain <= b.gain => Some(b),
        _ => Some(candidate),
    }
}

/// Move every sample one level down from a node that was split this level
fn advance_assignment(tree: &Tree, assignment: &mut [NodeId]) {
    for (sample, node) in assignment.iter_mut().enumerate() {
        let current = &tree[*node];
        if current.is_leaf {
            continue;
        }
        if let (Some(left), Some(right)) = (current.left, current.right) {
            *node = if tree[left].instance_space.binary_search(&sample).is_ok() {
                left
            } else {
                right
            };
        }
    }
}

impl<E: EncryptionTool> FederatedGbModel<E> {
    pub(super) fn current_node_ref(&self) -> Result<&TreeNode> {
        let id = self
            .current_node
            .ok_or_else(|| Error::internal("no node opened in phase 1"))?;
        self.trees
            .last()
            .and_then(|t| t.get(id))
            .ok_or_else(|| Error::internal("current node not in active tree"))
    }

    pub(super) fn cipher_pair(&self, g: &E::Ciphertext, h: &E::Ciphertext) -> CipherPair {
        CipherPair {
            g: self.tool.serialize_ciphertext(g),
            h: self.tool.serialize_ciphertext(h),
        }
    }

    pub(super) fn restore_pair(&self, pair: &CipherPair) -> Result<(E::Ciphertext, E::Ciphertext)> {
        Ok((
            self.tool.restore_ciphertext(&pair.g)?,
            self.tool.restore_ciphertext(&pair.h)?,
        ))
    }

    /// Replace the gh cache with pairs aligned to `ids`
    pub(super) fn load_gh(&mut self, ids: &[SampleId], gh: &[CipherPair]) -> Result<()> {
        if ids.len() != gh.len() {
            return Err(Error::internal(format!(
                "{} encrypted pairs for {} samples",
                gh.len(),
                ids.len()
            )));
        }
        let restored = gh
            .par_iter()
            .map(|pair| self.restore_pair(pair))
            .collect::<Result<Vec<_>>>()?;

        self.gh_cache.clear();
        self.gh_cache.extend(ids.iter().copied().zip(restored));
        Ok(())
    }

    /// Bucket every local feature column over an instance space
    fn bucket_features(
        &self,
        instance_space: &[SampleId],
        data: &BoostTrainData,
    ) -> Result<Vec<(FeatureId, Vec<Bucket>)>> {
        let num_bin = self.parameter.num_bin;
        (1..=data.feature_dim())
            .into_par_iter()
            .map(|col| {
                let column = data.feature(instance_space, col)?;
                Ok((col, sort_and_group(column, num_bin)))
            })
            .collect()
    }

    fn tree_init(&mut self, data: &BoostTrainData) -> Result<()> {
        let k = self.num_class_round;
        let (grad, hess) = match (self.grad.get(k), self.hess.get(k)) {
            (Some(g), Some(h)) => (g, h),
            _ => return Err(Error::internal("gradients not initialized")),
        };

        let root = TreeNode::new(
            1,
            1,
            data.feature_dim(),
            (0..self.dataset_size).collect(),
            grad.iter().sum(),
            hess.iter().sum(),
        );
        self.trees.push(Tree::new(root));
        self.corresponding_node = vec![0; self.dataset_size];

        info!(
            tree = self.trees.len(),
            class_round = k,
            samples = self.dataset_size,
            "Starting new tree"
        );
        Ok(())
    }

    fn encrypt_grad_hess(&self, public_key: &E::PublicKey) -> Result<Vec<CipherPair>> {
        let k = self.num_class_round;
        self.grad[k]
            .par_iter()
            .zip(self.hess[k].par_iter())
            .map(|(g, h)| {
                let g = self.tool.encrypt(*g, public_key)?;
                let h = self.tool.encrypt(*h, public_key)?;
                Ok(self.cipher_pair(&g, &h))
            })
            .collect()
    }

    /// Phase 1: open the next alive node; on a new tree also encrypt all g/h
    pub(super) fn train_phase1(&mut self, message: Message, data: &BoostTrainData) -> Result<Message> {
        let req = match message {
            Message::P1Request(req) => req,
            other => return Err(Error::phase_mismatch(1, "P1Request", other.kind())),
        };
        if self.role == Role::NoLabel {
            return Ok(Message::EncryptedGradHess(EncryptedGradHess {
                client: Some(req.client),
                ..Default::default()
            }));
        }

        let start = Instant::now();
        let mut gh = None;
        let mut public_key = None;
        if req.new_tree {
            self.tree_init(data)?;
            let private_key = self.tool.key_generate(self.parameter.bit_length)?;
            let pk = self.tool.public_key(&private_key);
            gh = Some(self.encrypt_grad_hess(&pk)?);
            public_key = Some(self.tool.serialize_public_key(&pk));
            self.private_key = Some(private_key);
            self.public_key = Some(pk);
        }

        let k = self.num_class_round;
        let tree = self
            .trees
            .last_mut()
            .ok_or_else(|| Error::internal("no active tree"))?;
        let node_id = tree
            .pop_alive()
            .ok_or_else(|| Error::internal("no alive node to split"))?;
        let node = &mut tree[node_id];
        node.grad = node.instance_space.iter().map(|&i| self.grad[k][i]).sum();
        node.hess = node.instance_space.iter().map(|&i| self.hess[k][i]).sum();
        let instance_space = node.instance_space.clone();
        let node_index = node.index;
        self.current_node = Some(node_id);

        let sub_model = match (&self.shard, self.trees.last()) {
            (Some(_), Some(tree)) => Some(SubModel::NodeOpened {
                public_key: public_key.clone(),
                tree: tree.clone(),
                current_node: node_id,
                num_class_round: k,
                new_tree: req.new_tree,
            }),
            _ => None,
        };

        debug!(
            node = node_index,
            samples = instance_space.len(),
            new_tree = req.new_tree,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Phase 1 complete"
        );

        Ok(Message::EncryptedGradHess(EncryptedGradHess {
            client: Some(req.client),
            instance_space,
            gh,
            public_key,
            new_tree: req.new_tree,
            sub_model,
        }))
    }

    /// Phase 2: encrypted per-bucket g/h sums of every local feature
    pub(super) fn train_phase2(&mut self, message: Message, data: &BoostTrainData) -> Result<Message> {
        if self.role == Role::HasLabel {
            return Ok(Message::P2Response(P2Response::default()));
        }
        let req = match message {
            Message::EncryptedGradHess(req) => req,
            other => return Err(Error::phase_mismatch(2, "EncryptedGradHess", other.kind())),
        };

        let start = Instant::now();
        if req.new_tree {
            let pk = req
                .public_key
                .as_deref()
                .ok_or_else(|| Error::phase_mismatch(2, "public key on new tree", "none"))?;
            self.public_key = Some(self.tool.restore_public_key(pk)?);
            if self.shard.is_none() {
                let gh = req
                    .gh
                    .as_deref()
                    .ok_or_else(|| Error::phase_mismatch(2, "encrypted pairs on new tree", "none"))?;
                self.load_gh(&req.instance_space, gh)?;
            }
        }

        let public_key = self
            .public_key
            .as_ref()
            .ok_or_else(|| Error::internal("public key not received"))?;
        let features = self.bucket_features(&req.instance_space, data)?;
        let distributed = self.shard.is_some();

        let feature_gl: Vec<FeatureLeftGH> = features
            .par_iter()
            .map(|(col, buckets)| {
                let gh_left = gh_sum(&self.tool, buckets, &self.gh_cache, public_key)
                    .into_iter()
                    .map(|pair| pair.map(|(g, h)| self.cipher_pair(&g, &h)))
                    .collect();
                let instance_list = if distributed {
                    buckets
                        .iter()
                        .map(|b| {
                            b.ids
                                .iter()
                                .copied()
                                .filter(|id| !self.gh_cache.contains_key(id))
                                .collect()
                        })
                        .collect()
                } else {
                    Vec::new()
                };
                FeatureLeftGH {
                    client: req.client.clone(),
                    feature: self.global_feature(*col),
                    gh_left,
                    instance_list,
                }
            })
            .collect();

        self.sorted_features = features.into_iter().collect();
        debug!(
            features = feature_gl.len(),
            samples = req.instance_space.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Phase 2 complete"
        );

        Ok(Message::P2Response(P2Response {
            feature_gl: Some(feature_gl),
        }))
    }

    fn decrypt_bucket_sums(
        &self,
        feature: &FeatureLeftGH,
        private_key: &E::PrivateKey,
    ) -> Result<Vec<(f64, f64)>> {
        feature
            .gh_left
            .iter()
            .enumerate()
            .map(|(bucket, pair)| {
                let pair = pair.as_ref().ok_or(Error::SplitBucketCorruption {
                    feature: feature.feature,
                    bucket,
                })?;
                let (g, h) = self.restore_pair(pair)?;
                Ok((
                    self.tool.decrypt(&g, private_key)?,
                    self.tool.decrypt(&h, private_key)?,
                ))
            })
            .collect()
    }

    /// Record the winning split on the current node
    pub(super) fn record_split(&mut self, best: Option<&SplitChoice>) -> Result<()> {
        let id = self
            .current_node
            .ok_or_else(|| Error::internal("no node opened in phase 1"))?;
        let node = self
            .trees
            .last_mut()
            .and_then(|t| t.get_mut(id))
            .ok_or_else(|| Error::internal("current node not in active tree"))?;

        match best {
            Some(best) => {
                node.client = Some(best.client.clone());
                node.split_feature = Some(best.feature);
                node.split_index = Some(best.split_index);
                node.gain = best.gain;
            }
            None => {
                node.client = None;
                node.split_feature = None;
                node.split_index = None;
                node.gain = 0.0;
            }
        }
        Ok(())
    }

    /// Phase 3: decrypt passive sums, search gains and pick the best split
    pub(super) fn train_phase3(&mut self, message: Message, data: &BoostTrainData) -> Result<Message> {
        if self.role == Role::NoLabel {
            return Ok(Message::P3Response(P3Response::default()));
        }
        let req = match message {
            Message::P3Request(req) => req,
            other => return Err(Error::phase_mismatch(3, "P3Request", other.kind())),
        };

        let start = Instant::now();
        let (g, h, instance_space) = {
            let node = self.current_node_ref()?;
            (node.grad, node.hess, node.instance_space.clone())
        };
        let (lambda, gamma) = (self.parameter.lambda, self.parameter.gamma);

        let mut best = None;
        if self.model_id() == 0 {
            let private_key = self
                .private_key
                .as_ref()
                .ok_or_else(|| Error::internal("private key missing"))?;
            let candidates = req
                .data_list
                .par_iter()
                .flatten()
                .map(|feature| {
                    let client = feature.client.clone().ok_or_else(|| {
                        Error::phase_mismatch(3, "feature sums with owner", "anonymous feature sums")
                    })?;
                    let sums = self.decrypt_bucket_sums(feature, private_key)?;
                    Ok(best_split(&compute_gain(&sums, g, h, lambda, gamma)).map(
                        |(split_index, gain)| SplitChoice {
                            client,
                            feature: feature.feature,
                            split_index,
                            gain,
                        },
                    ))
                })
                .collect::<Result<Vec<_>>>()?;
            best = candidates.into_iter().flatten().fold(None, pick_better);
        }

        let k = self.num_class_round;
        let local = self.bucket_features(&instance_space, data)?;
        let local_candidates: Vec<Option<SplitChoice>> = local
            .par_iter()
            .map(|(col, buckets)| {
                let sums = process_each_numeric_feature(buckets, &self.grad[k], &self.hess[k]);
                best_split(&compute_gain(&sums, g, h, lambda, gamma)).map(|(split_index, gain)| {
                    SplitChoice {
                        client: req.client.clone(),
                        feature: self.global_feature(*col),
                        split_index,
                        gain,
                    }
                })
            })
            .collect();
        best = local_candidates.into_iter().flatten().fold(best, pick_better);
        self.sorted_features = local.into_iter().collect();

        self.record_split(best.as_ref())?;
        match &best {
            Some(b) => debug!(
                client = %b.client,
                feature = b.feature,
                split_index = b.split_index,
                gain = b.gain,
                elapsed_ms = start.elapsed().as_millis() as u64,
                "Phase 3 complete"
            ),
            None => warn!("Phase 3 found no split candidate"),
        }

        let sub_model = self
            .shard
            .as_ref()
            .map(|_| SubModel::SplitChosen { best: best.clone() });
        Ok(Message::P3Response(P3Response { best, sub_model }))
    }

    /// Phase 4: the owner of the winning feature discloses the left instances
    pub(super) fn train_phase4(&mut self, message: Message) -> Result<Message> {
        let req = match message {
            Message::P4Request(req) => req,
            other => return Err(Error::phase_mismatch(4, "P4Request", other.kind())),
        };

        let mut response = LeftTreeInfo::default();
        if let Some(local) = self.local_feature(req.feature).filter(|_| req.accept) {
            let corruption = Error::SplitBucketCorruption {
                feature: req.feature,
                bucket: req.split_index,
            };
            let buckets = match self.sorted_features.get(&local) {
                Some(b) if req.split_index < b.len() => b,
                _ => return Err(corruption),
            };
            let threshold = buckets[req.split_index].split_value;

            let mut left: Vec<SampleId> = buckets[..=req.split_index]
                .iter()
                .flat_map(|b| b.ids.iter().copied())
                .collect();
            left.extend(buckets[req.split_index + 1..].iter().flat_map(|b| {
                b.ids
                    .iter()
                    .zip(&b.values)
                    .filter(|(_, v)| **v <= threshold)
                    .map(|(id, _)| *id)
            }));

            let record_id = self.query_table.append(req.feature, threshold);
            debug!(
                feature = req.feature,
                record_id,
                left = left.len(),
                "Phase 4 disclosed split"
            );
            response.record_id = record_id;
            response.left_instances = Some(left);
        }

        if self.role == Role::HasLabel {
            response.train_metric = Some(self.metrics.clone());
        }
        if self.shard.is_some() {
            response.sub_model = Some(SubModel::QueryTable(self.query_table.clone()));
        }
        Ok(Message::LeftTreeInfo(response))
    }

    /// Phase 5: split the current node and finish the tree once nothing is alive
    pub(super) fn train_phase5(&mut self, message: Message) -> Result<RoundOutcome> {
        if self.role == Role::NoLabel {
            return Ok(RoundOutcome {
                response: P5Response::default(),
                num_class_round: self.num_class_round,
                depth: 0,
                tree_finished: false,
                current_node: None,
                node_assignment: Vec::new(),
                pred: Vec::new(),
                grad: Vec::new(),
                hess: Vec::new(),
                metrics: None,
            });
        }
        let req = match message {
            Message::LeftTreeInfo(req) => req,
            other => return Err(Error::phase_mismatch(5, "LeftTreeInfo", other.kind())),
        };

        let node_id = self
            .current_node
            .ok_or_else(|| Error::internal("no node opened in phase 1"))?;
        let k = self.num_class_round;
        let lambda = self.parameter.lambda;
        let condition = LeafCondition {
            max_depth: self.parameter.max_depth,
            min_child_weight: self.parameter.min_child_weight,
            min_sample_split: self.parameter.min_sample_split,
        };

        let tree = self
            .trees
            .last_mut()
            .ok_or_else(|| Error::internal("no active tree"))?;
        if node_id >= tree.len() {
            return Err(Error::internal("current node not in active tree"));
        }
        tree[node_id].record_id = req.record_id;
        let depth = tree[node_id].depth;

        match req.left_instances {
            Some(mut left) => {
                left.sort_unstable();
                left.dedup();
                let space = &tree[node_id].instance_space;
                if let Some(foreign) = left.iter().find(|s| space.binary_search(s).is_err()) {
                    return Err(Error::phase_mismatch(
                        5,
                        "left instances within the node",
                        &format!("sample {foreign}"),
                    ));
                }
                let (lg, lh) = left.iter().fold((0.0, 0.0), |(g, h), &i| {
                    (g + self.grad[k][i], h + self.hess[k][i])
                });
                let (l, r) = tree.split_node(node_id, left, lg, lh);
                debug!(
                    node = tree[node_id].index,
                    left = tree[l].num_sample,
                    right = tree[r].num_sample,
                    "Node split"
                );
            }
            None => {
                warn!(node = tree[node_id].index, "No split disclosed, closing node as leaf");
                tree.make_leaf(node_id, lambda);
            }
        }

        let mut tree_finished = false;
        if tree.alive_is_empty() {
            advance_assignment(tree, &mut self.corresponding_node);
            for child in tree.take_pending() {
                if condition.is_leaf(&tree[child]) {
                    tree.make_leaf(child, lambda);
                } else {
                    tree.push_alive(child);
                }
            }
            tree_finished = tree.alive_is_empty();
        }

        let metrics = if tree_finished {
            self.finish_tree()?
        } else {
            None
        };

        let sub_model = match (&self.shard, self.trees.last()) {
            (Some(_), Some(tree)) => Some(SubModel::RoundUpdated {
                grad: self.grad.clone(),
                hess: self.hess.clone(),
                num_class_round: self.num_class_round,
                record_id: req.record_id,
                tree: tree.clone(),
                metrics: self.metrics.clone(),
            }),
            _ => None,
        };

        Ok(RoundOutcome {
            response: P5Response {
                is_stop: tree_finished,
                depth,
                train_metric: Some(self.metrics.clone()),
                sub_model,
            },
            num_class_round: self.num_class_round,
            depth,
            tree_finished,
            current_node: Some(node_id),
            node_assignment: self.corresponding_node.clone(),
            pred: self.pred.clone(),
            grad: self.grad.clone(),
            hess: self.hess.clone(),
            metrics,
        })
    }

    /// Prune, update predictions and gradients, and advance the class round
    fn finish_tree(&mut self) -> Result<Option<BTreeMap<MetricType, f64>>> {
        let k = self.num_class_round;
        let lambda = self.parameter.lambda;
        let eta = self.eta;

        let tree = self
            .trees
            .last_mut()
            .ok_or_else(|| Error::internal("no active tree"))?;
        let root = tree.root();
        tree.post_prune(root, lambda, &mut self.corresponding_node);

        for (i, node) in self.corresponding_node.iter().enumerate() {
            self.pred[k][i] += eta * tree[*node].leaf_score;
        }
        let leaves = tree.leaves().len();
        let depth = tree.depth();

        self.update_grad_hess()?;

        let metrics = if k + 1 >= self.num_class {
            self.num_class_round = 0;
            let round = self.evaluate()?;
            self.metrics.record(&round);
            Some(round)
        } else {
            self.num_class_round += 1;
            None
        };

        info!(
            tree = self.trees.len(),
            class_round = k,
            leaves,
            depth,
            metrics = ?metrics,
            "Tree finished"
        );
        Ok(metrics)
    }

    /// Evaluate the configured metrics on the training predictions
    fn evaluate(&self) -> Result<BTreeMap<MetricType, f64>> {
        let loss = self
            .loss
            .ok_or_else(|| Error::internal("loss not initialized"))?;
        let pred = loss.transform(&self.pred);
        let metrics = &self.parameter.eval_metric;
        Ok(match loss {
            Loss::PoissonLog => {
                let label: Vec<f64> = self.label.iter().map(|l| l.exp()).collect();
                calculate_metrics(metrics, &pred, &label)
            }
            _ => calculate_metrics(metrics, &pred, &self.label),
        })
    }
}
