//! In-process coordinator driving training rounds and inference walks
//!
//! Stands in for the networked coordinator: it fans every phase out to all
//! parties concurrently, forwards responses as the next phase's requests and
//! never looks inside ciphertexts.

use crate::config::SimConfig;
use crate::dataset::PartyData;
use dashmap::DashMap;
use fedgb_core::{Error, MetricLedger, PartyId, Result, TrainOptions};
use fedgb_crypto::EncryptionTool;
use fedgb_model::message::{
    Direction, EncryptedGradHess, InferenceTrees, LeftTreeInfo, P1Request, P3Request, P4Request,
    RoutingQuery, SplitChoice, TrainInit,
};
use fedgb_model::{FederatedGbModel, InferenceData, Message, ModelSnapshot, NodeId, TrainingHandle};
use fedgb_shard::ShardedParty;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

/// One party as seen by the coordinator
pub enum Party<E: EncryptionTool> {
    /// Single model; no training handle when restored from a snapshot
    Local {
        model: Arc<Mutex<FederatedGbModel<E>>>,
        handle: Option<Arc<TrainingHandle>>,
    },
    Sharded(ShardedParty<E>),
}

impl<E: EncryptionTool> Party<E> {
    async fn init(tool: E, data: &PartyData, init: TrainInit, config: &SimConfig) -> Result<Self> {
        if config.sharded {
            let policy = config.training.distribution.clone();
            return Ok(Party::Sharded(
                ShardedParty::init(tool, Arc::clone(&data.raw), init, policy).await?,
            ));
        }

        let raw = Arc::clone(&data.raw);
        tokio::task::spawn_blocking(move || {
            let mut model = FederatedGbModel::new(tool);
            let handle = model.train_init(
                &raw,
                &init.match_id,
                &init.test_index,
                init.parameter,
                &init.features,
                init.options,
            )?;
            Ok(Party::Local {
                model: Arc::new(Mutex::new(model)),
                handle: Some(Arc::new(handle)),
            })
        })
        .await
        .map_err(|e| Error::internal(format!("party init task failed: {e}")))?
    }

    /// Run one training phase
    pub async fn train(&self, phase: i32, message: Message) -> Result<Message> {
        match self {
            Party::Sharded(party) => party.train(phase, message).await,
            Party::Local { model, handle } => {
                let handle = handle
                    .clone()
                    .ok_or_else(|| Error::internal("party has no training session"))?;
                let model = Arc::clone(model);
                tokio::task::spawn_blocking(move || model.lock().train(phase, message, &handle))
                    .await
                    .map_err(|e| Error::internal(format!("party task failed: {e}")))?
            }
        }
    }

    pub fn inference(&self, phase: i32, message: Message, data: &mut InferenceData) -> Result<Message> {
        match self {
            Party::Sharded(party) => party.inference(phase, message, data),
            Party::Local { model, .. } => model.lock().inference(phase, message, data),
        }
    }

    pub fn snapshot(&self) -> ModelSnapshot {
        match self {
            Party::Sharded(party) => party.snapshot(),
            Party::Local { model, .. } => model.lock().snapshot(),
        }
    }

    pub fn test_uids(&self) -> Vec<String> {
        match self {
            Party::Sharded(party) => party.test_uids(),
            Party::Local { handle, .. } => handle
                .as_ref()
                .map(|h| h.test_uids.clone())
                .unwrap_or_default(),
        }
    }

    pub fn shard_count(&self) -> usize {
        match self {
            Party::Sharded(party) => party.shard_count(),
            Party::Local { .. } => 1,
        }
    }
}

/// Summary of a training run
#[derive(Debug, Clone, Serialize)]
pub struct TrainingReport {
    pub trees: usize,
    /// Splits performed, over all trees
    pub splits: usize,
    pub metrics: MetricLedger,
    pub test_uids: Vec<String>,
    pub elapsed_ms: u64,
}

/// Output of an inference walk
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Prediction {
    pub uids: Vec<String>,
    /// scores[class][sample] after the loss transform
    pub scores: Vec<Vec<f64>>,
    /// Per sample: the transformed score, or the class label for multi-class models
    pub values: Vec<f64>,
}

/// Local coordinator over in-memory parties
pub struct LocalCoordinator<E: EncryptionTool> {
    tool: E,
    config: SimConfig,
    data: Vec<PartyData>,
    active: PartyId,
    parties: DashMap<PartyId, Arc<Party<E>>>,
}

impl<E: EncryptionTool> LocalCoordinator<E> {
    /// Exactly one party must hold the label
    pub fn new(tool: E, config: SimConfig, data: Vec<PartyData>) -> Result<Self> {
        config.validate()?;
        let mut labelled = data.iter().filter(|d| d.features.has_label());
        let active = match (labelled.next(), labelled.next()) {
            (Some(party), None) => party.name.clone(),
            _ => {
                return Err(Error::InvalidConfig {
                    message: "exactly one party must hold the label".to_string(),
                })
            }
        };
        let mut names: Vec<&str> = data.iter().map(|d| d.name.as_str()).collect();
        names.sort_unstable();
        if names.windows(2).any(|w| w[0] == w[1]) {
            return Err(Error::InvalidConfig {
                message: "party names must be unique".to_string(),
            });
        }

        Ok(Self {
            tool,
            config,
            data,
            active,
            parties: DashMap::new(),
        })
    }

    /// Name of the label-holding party
    pub fn active_party(&self) -> &str {
        &self.active
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    fn party(&self, name: &str) -> Result<Arc<Party<E>>> {
        self.parties
            .get(name)
            .map(|p| Arc::clone(p.value()))
            .ok_or_else(|| Error::internal(format!("party {name} is not initialized")))
    }

    fn passive_names(&self) -> Vec<PartyId> {
        self.data
            .iter()
            .filter(|d| d.name != self.active)
            .map(|d| d.name.clone())
            .collect()
    }

    /// Shard count of a party, once initialized
    pub fn shard_count(&self, name: &str) -> Option<usize> {
        self.parties.get(name).map(|p| p.shard_count())
    }

    /// Inference snapshot of a party
    pub fn snapshot(&self, name: &str) -> Result<ModelSnapshot> {
        Ok(self.party(name)?.snapshot())
    }

    /// Replace a party by a stored model, for inference only
    pub fn restore(&self, name: &str, snapshot: ModelSnapshot) -> Result<()> {
        if !self.data.iter().any(|d| d.name == name) {
            return Err(Error::InvalidConfig {
                message: format!("unknown party {name}"),
            });
        }
        let mut model = FederatedGbModel::new(self.tool.clone());
        model.restore(snapshot);
        self.parties.insert(
            name.to_string(),
            Arc::new(Party::Local {
                model: Arc::new(Mutex::new(model)),
                handle: None,
            }),
        );
        Ok(())
    }

    /// Initialize every party concurrently
    async fn init_parties(&self, uids: &[String], test_index: &[usize]) -> Result<()> {
        let tasks: Vec<_> = self
            .data
            .iter()
            .map(|data| {
                let init = TrainInit {
                    parameter: self.config.training.parameter.clone(),
                    features: data.features.clone(),
                    test_index: test_index.to_vec(),
                    match_id: uids.to_vec(),
                    options: TrainOptions {
                        shard: None,
                        match_size: uids.len().saturating_sub(test_index.len()),
                    },
                };
                let name = data.name.clone();
                let tool = self.tool.clone();
                let data = data.clone();
                let config = self.config.clone();
                let task = tokio::spawn(async move { Party::init(tool, &data, init, &config).await });
                (name, task)
            })
            .collect();

        for (name, task) in tasks {
            let party = task
                .await
                .map_err(|e| Error::internal(format!("party init task failed: {e}")))??;
            info!(party = %name, shards = party.shard_count(), "Party initialized");
            self.parties.insert(name, Arc::new(party));
        }
        Ok(())
    }

    /// Send one phase to the given parties concurrently
    async fn fan_out(&self, phase: i32, requests: Vec<(PartyId, Message)>) -> Result<BTreeMap<PartyId, Message>> {
        let tasks = requests
            .into_iter()
            .map(|(name, message)| {
                let party = self.party(&name)?;
                Ok((name, tokio::spawn(async move { party.train(phase, message).await })))
            })
            .collect::<Result<Vec<_>>>()?;

        let mut responses = BTreeMap::new();
        for (name, task) in tasks {
            let response = task
                .await
                .map_err(|e| Error::internal(format!("phase {phase} task failed: {e}")))??;
            responses.insert(name, response);
        }
        Ok(responses)
    }

    /// Train every tree of the session
    ///
    /// `test_index` lists positions of `uids` held out from training.
    pub async fn train(&self, uids: &[String], test_index: &[usize]) -> Result<TrainingReport> {
        let start = Instant::now();
        self.init_parties(uids, test_index).await?;

        let parameter = &self.config.training.parameter;
        let num_class = if parameter.objective_type()?.is_multi_class() {
            parameter.num_class
        } else {
            1
        };
        let total_trees = parameter.num_boost_round * num_class;
        // Upper bound on node rounds per tree
        let max_splits = 1usize << parameter.max_depth.min(30);

        let mut metrics = MetricLedger::default();
        let mut splits = 0;
        for tree in 0..total_trees {
            let tree_start = Instant::now();
            let mut new_tree = true;
            let mut depth = 0;
            for step in 0.. {
                if step > max_splits {
                    return Err(Error::internal(format!("tree {tree} did not finish")));
                }
                let round = self.split_node(new_tree).await?;
                new_tree = false;
                splits += usize::from(round.split);
                depth = depth.max(round.depth);
                if let Some(ledger) = round.metrics {
                    metrics = ledger;
                }
                if round.finished {
                    break;
                }
            }
            info!(
                tree,
                depth,
                elapsed_ms = tree_start.elapsed().as_millis() as u64,
                "Tree trained"
            );
        }

        let report = TrainingReport {
            trees: total_trees,
            splits,
            metrics,
            test_uids: self.party(&self.active)?.test_uids(),
            elapsed_ms: start.elapsed().as_millis() as u64,
        };
        info!(
            trees = report.trees,
            splits = report.splits,
            rounds = report.metrics.rounds(),
            elapsed_ms = report.elapsed_ms,
            "Training finished"
        );
        Ok(report)
    }

    /// Run phases 1 to 5 for the next alive node of the active tree
    async fn split_node(&self, new_tree: bool) -> Result<NodeRound> {
        let active = self.active.clone();
        let passive = self.passive_names();
        let everyone: Vec<PartyId> = self.data.iter().map(|d| d.name.clone()).collect();

        // Phase 1
        let requests = everyone
            .iter()
            .map(|name| {
                let request = P1Request {
                    client: name.clone(),
                    new_tree,
                };
                (name.clone(), Message::P1Request(request))
            })
            .collect();
        let mut p1 = self.fan_out(1, requests).await?;
        let opened = match p1.remove(&active) {
            Some(Message::EncryptedGradHess(gh)) => gh,
            other => return Err(unexpected(1, "EncryptedGradHess", other.as_ref())),
        };

        // Phase 2
        let mut requests = vec![(active.clone(), Message::Empty)];
        requests.extend(passive.iter().map(|name| {
            let request = EncryptedGradHess {
                client: Some(name.clone()),
                ..opened.clone()
            };
            (name.clone(), Message::EncryptedGradHess(request))
        }));
        let p2 = self.fan_out(2, requests).await?;
        let data_list = passive
            .iter()
            .filter_map(|name| match p2.get(name) {
                Some(Message::P2Response(r)) => r.feature_gl.clone(),
                _ => None,
            })
            .collect();

        // Phase 3
        let mut requests = vec![(
            active.clone(),
            Message::P3Request(P3Request {
                client: active.clone(),
                data_list,
            }),
        )];
        requests.extend(passive.iter().map(|name| (name.clone(), Message::Empty)));
        let mut p3 = self.fan_out(3, requests).await?;
        let best: Option<SplitChoice> = match p3.remove(&active) {
            Some(Message::P3Response(r)) => r.best,
            other => return Err(unexpected(3, "P3Response", other.as_ref())),
        };

        // Phase 4
        let requests = everyone
            .iter()
            .map(|name| {
                let request = P4Request {
                    client: name.clone(),
                    feature: best.as_ref().map_or(0, |b| b.feature),
                    split_index: best.as_ref().map_or(0, |b| b.split_index),
                    accept: best.as_ref().is_some_and(|b| &b.client == name),
                };
                (name.clone(), Message::P4Request(request))
            })
            .collect();
        let mut p4 = self.fan_out(4, requests).await?;
        let owner = best.as_ref().map_or(&active, |b| &b.client);
        let left: LeftTreeInfo = match p4.remove(owner) {
            Some(Message::LeftTreeInfo(info)) => info,
            other => return Err(unexpected(4, "LeftTreeInfo", other.as_ref())),
        };
        let split = left.left_instances.is_some();

        // Phase 5
        let mut requests = vec![(active.clone(), Message::LeftTreeInfo(left))];
        requests.extend(passive.iter().map(|name| (name.clone(), Message::Empty)));
        let mut p5 = self.fan_out(5, requests).await?;
        let outcome = match p5.remove(&active) {
            Some(Message::P5Response(r)) => r,
            other => return Err(unexpected(5, "P5Response", other.as_ref())),
        };

        debug!(
            owner = %owner,
            split,
            depth = outcome.depth,
            finished = outcome.is_stop,
            "Node round complete"
        );
        Ok(NodeRound {
            split,
            depth: outcome.depth,
            finished: outcome.is_stop,
            metrics: outcome.train_metric,
        })
    }

    /// Walk every tree for `uids` and aggregate the leaf scores
    pub async fn predict(&self, uids: &[String]) -> Result<Prediction> {
        let mut data: BTreeMap<PartyId, InferenceData> = self
            .data
            .iter()
            .map(|d| Ok((d.name.clone(), InferenceData::new(&d.raw, &d.features)?)))
            .collect::<Result<_>>()?;

        // Phase -1
        let mut model: Option<InferenceTrees> = None;
        for (name, party_data) in data.iter_mut() {
            match self
                .party(name)?
                .inference(-1, Message::Uids(uids.to_vec()), party_data)?
            {
                Message::InferenceTrees(trees) => model = Some(trees),
                Message::Empty => {}
                other => return Err(unexpected(-1, "InferenceTrees", Some(&other))),
            }
        }
        let model = model.ok_or_else(|| Error::internal("no party holds trees"))?;
        let loss = model
            .loss
            .ok_or_else(|| Error::internal("tree holder has no loss"))?;

        // Phase -2, one level per iteration
        let mut positions: Vec<Vec<NodeId>> = model
            .trees
            .iter()
            .map(|t| vec![t.root(); uids.len()])
            .collect();
        let mut levels = 0;
        loop {
            let mut queries: BTreeMap<PartyId, Vec<RoutingQuery>> = BTreeMap::new();
            for (t, tree) in model.trees.iter().enumerate() {
                for (sample, &id) in positions[t].iter().enumerate() {
                    let node = tree
                        .get(id)
                        .ok_or_else(|| Error::internal(format!("tree {t} has no node {id}")))?;
                    if node.is_leaf {
                        continue;
                    }
                    let owner = node.client.clone().ok_or_else(|| {
                        Error::internal(format!("split node {} of tree {t} has no owner", node.index))
                    })?;
                    queries.entry(owner).or_default().push(RoutingQuery {
                        sample,
                        tree: t,
                        record_id: node.record_id,
                    });
                }
            }
            if queries.is_empty() {
                break;
            }
            levels += 1;

            for (owner, batch) in queries {
                let party_data = data
                    .get_mut(&owner)
                    .ok_or_else(|| Error::internal(format!("no inference data for {owner}")))?;
                let decisions = match self.party(&owner)?.inference(
                    -2,
                    Message::RoutingQueries(batch),
                    party_data,
                )? {
                    Message::RoutingDecisions(d) => d,
                    other => return Err(unexpected(-2, "RoutingDecisions", Some(&other))),
                };
                for decision in decisions {
                    let slot = positions
                        .get_mut(decision.tree)
                        .and_then(|p| p.get_mut(decision.sample))
                        .ok_or_else(|| Error::internal("routing decision out of range"))?;
                    let node = model.trees[decision.tree]
                        .get(*slot)
                        .ok_or_else(|| Error::internal("routing decision for unknown node"))?;
                    let next = match decision.direction {
                        Direction::Left => node.left,
                        Direction::Right => node.right,
                    };
                    *slot = next.ok_or_else(|| Error::internal("routing past a leaf"))?;
                }
            }
        }

        let num_class = loss.num_class();
        let mut margins = vec![vec![model.first_round_pred; uids.len()]; num_class];
        for (t, tree) in model.trees.iter().enumerate() {
            let class = t % num_class;
            for (sample, &id) in positions[t].iter().enumerate() {
                if let Some(node) = tree.get(id) {
                    margins[class][sample] += model.eta * node.leaf_score;
                }
            }
        }
        let scores = loss.transform(&margins);
        let values = if num_class > 1 {
            (0..uids.len())
                .map(|s| {
                    let best = (0..num_class)
                        .max_by(|&a, &b| scores[a][s].total_cmp(&scores[b][s]))
                        .unwrap_or(0);
                    model
                        .multi_class_labels
                        .get(best)
                        .copied()
                        .unwrap_or(best as f64)
                })
                .collect()
        } else {
            scores.first().cloned().unwrap_or_default()
        };

        debug!(samples = uids.len(), trees = model.trees.len(), levels, "Inference complete");
        Ok(Prediction {
            uids: uids.to_vec(),
            scores,
            values,
        })
    }
}

/// What one pass through phases 1-5 did
struct NodeRound {
    split: bool,
    depth: usize,
    finished: bool,
    metrics: Option<MetricLedger>,
}

fn unexpected(phase: i32, expected: &str, actual: Option<&Message>) -> Error {
    Error::phase_mismatch(phase, expected, actual.map_or("nothing", Message::kind))
}
