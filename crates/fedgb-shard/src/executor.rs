//! One party run as a set of feature-range shards

use crate::split::{pending_instances, ReduceStrategy, ShardPlanner};
use fedgb_core::{DistributionPolicy, Error, Result, ShardId};
use fedgb_crypto::EncryptionTool;
use fedgb_model::message::{GhSlice, PartialSums, PendingInstances, SubModel, TrainInit};
use fedgb_model::{FederatedGbModel, InferenceData, Message, ModelSnapshot, TrainingHandle};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

struct Shard<E: EncryptionTool> {
    model: Arc<Mutex<FederatedGbModel<E>>>,
    handle: Arc<TrainingHandle>,
}

impl<E: EncryptionTool> Clone for Shard<E> {
    fn clone(&self) -> Self {
        Self {
            model: Arc::clone(&self.model),
            handle: Arc::clone(&self.handle),
        }
    }
}

/// A party whose features are split across shards
///
/// Shard 0 owns decryption and tree growth. After each phase the state
/// delta of the shard that produced the merged response is applied to the
/// others, so every shard agrees on keys, trees and the query table.
pub struct ShardedParty<E: EncryptionTool> {
    planner: ShardPlanner,
    /// Never empty
    shards: Vec<Shard<E>>,
}

async fn join_all<T: Send + 'static>(tasks: Vec<JoinHandle<Result<T>>>) -> Result<Vec<T>> {
    let mut results = Vec::with_capacity(tasks.len());
    for task in tasks {
        let result = task
            .await
            .map_err(|e| Error::internal(format!("shard task failed: {e}")))??;
        results.push(result);
    }
    Ok(results)
}

impl<E: EncryptionTool> ShardedParty<E> {
    /// Split the party's training init by feature range and initialize every shard
    pub async fn init(
        tool: E,
        raw: Arc<Vec<Vec<String>>>,
        init: TrainInit,
        policy: DistributionPolicy,
    ) -> Result<Self> {
        let planner = ShardPlanner::new(policy);
        let plan = planner.split(0, Message::TrainInit(init))?;

        let tasks = plan
            .messages
            .into_iter()
            .map(|message| {
                let tool = tool.clone();
                let raw = Arc::clone(&raw);
                tokio::task::spawn_blocking(move || {
                    let init = match message {
                        Message::TrainInit(init) => init,
                        other => return Err(Error::phase_mismatch(0, "TrainInit", other.kind())),
                    };
                    let mut model = FederatedGbModel::new(tool);
                    let handle = model.train_init(
                        &raw,
                        &init.match_id,
                        &init.test_index,
                        init.parameter,
                        &init.features,
                        init.options,
                    )?;
                    Ok(Shard {
                        model: Arc::new(Mutex::new(model)),
                        handle: Arc::new(handle),
                    })
                })
            })
            .collect();
        let shards = join_all(tasks).await?;
        if shards.is_empty() {
            return Err(Error::internal("training init produced no shards"));
        }

        info!(
            shards = shards.len(),
            session = %shards[0].handle.session_id,
            "Party split into shards"
        );
        Ok(Self {
            planner: planner.with_shard_count(shards.len()),
            shards,
        })
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Session id of shard 0
    pub fn session_id(&self) -> String {
        self.shards[0].handle.session_id.clone()
    }

    /// Uids held out from training
    pub fn test_uids(&self) -> Vec<String> {
        self.shards[0].handle.test_uids.clone()
    }

    /// Inspect one shard's model
    pub fn with_shard<R>(&self, shard: ShardId, f: impl FnOnce(&FederatedGbModel<E>) -> R) -> Option<R> {
        self.shards.get(shard).map(|s| f(&s.model.lock()))
    }

    /// Run one training phase across the shards and merge the result
    pub async fn train(&self, phase: i32, message: Message) -> Result<Message> {
        let instance_space = match &message {
            Message::EncryptedGradHess(request) if phase == 2 => request.instance_space.clone(),
            _ => Vec::new(),
        };
        let plan = self.planner.split(phase, message)?;
        let instance_space = Arc::new(instance_space);
        let mut slices: HashMap<ShardId, GhSlice> =
            plan.gh_slices.into_iter().map(|s| (s.shard, s)).collect();

        let tasks = plan
            .shard_ids
            .iter()
            .zip(plan.messages)
            .map(|(&id, message)| {
                let shard = self
                    .shards
                    .get(id)
                    .cloned()
                    .ok_or_else(|| Error::internal(format!("no shard {id}")))?;
                let slice = slices.remove(&id);
                let instance_space = Arc::clone(&instance_space);
                Ok(tokio::task::spawn_blocking(move || {
                    let mut model = shard.model.lock();
                    if let Some(slice) = slice {
                        model.load_gh_slice(&instance_space, &slice)?;
                    }
                    model.train(phase, message, &shard.handle)
                }))
            })
            .collect::<Result<Vec<_>>>()?;
        let mut responses = join_all(tasks).await?;

        if phase == 2 && plan.reduce == ReduceStrategy::Concatenate && self.shards.len() > 1 {
            responses = self.exchange_partial_sums(responses).await?;
        }

        let (mut merged, position) = self.planner.merge_indexed(phase, responses)?;
        if let Some(sub_model) = merged.take_sub_model() {
            let source = plan.shard_ids.get(position).copied().unwrap_or(0);
            self.sync(source, sub_model).await?;
        }
        Ok(merged)
    }

    /// Complete each shard's bucket sums with the sums other shards hold
    async fn exchange_partial_sums(&self, responses: Vec<Message>) -> Result<Vec<Message>> {
        let pending: Arc<Vec<PendingInstances>> = Arc::new(
            responses
                .iter()
                .map(|r| match r {
                    Message::P2Response(p) => pending_instances(p),
                    _ => PendingInstances::new(),
                })
                .collect(),
        );
        debug!(
            shards = pending.len(),
            pending_features = pending.iter().map(|p| p.len()).sum::<usize>(),
            "Exchanging partial sums"
        );

        // partials[helper][origin]
        let tasks = self
            .shards
            .iter()
            .enumerate()
            .map(|(helper, shard)| {
                let model = Arc::clone(&shard.model);
                let pending = Arc::clone(&pending);
                tokio::task::spawn_blocking(move || {
                    let model = model.lock();
                    pending
                        .iter()
                        .enumerate()
                        .map(|(origin, p)| {
                            if origin == helper || p.is_empty() {
                                Ok(PartialSums::new())
                            } else {
                                model.sub_calculation(p)
                            }
                        })
                        .collect::<Result<Vec<_>>>()
                })
            })
            .collect();
        let partials = Arc::new(join_all(tasks).await?);

        let tasks = responses
            .into_iter()
            .enumerate()
            .map(|(origin, response)| {
                let model = Arc::clone(&self.shards[origin].model);
                let partials = Arc::clone(&partials);
                tokio::task::spawn_blocking(move || {
                    let response = match response {
                        Message::P2Response(r) => r,
                        other => return Err(Error::phase_mismatch(2, "P2Response", other.kind())),
                    };
                    let sums: Vec<PartialSums> = partials
                        .iter()
                        .enumerate()
                        .filter(|(helper, _)| *helper != origin)
                        .map(|(_, p)| p[origin].clone())
                        .collect();
                    let merged = model.lock().merge_sub_result(response, &sums)?;
                    Ok(Message::P2Response(merged))
                })
            })
            .collect();
        join_all(tasks).await
    }

    /// Apply a shard's state delta to every other shard
    async fn sync(&self, source: ShardId, sub_model: SubModel) -> Result<()> {
        let sub_model = Arc::new(sub_model);
        let tasks = self
            .shards
            .iter()
            .enumerate()
            .filter(|(id, _)| *id != source)
            .map(|(_, shard)| {
                let model = Arc::clone(&shard.model);
                let sub_model = Arc::clone(&sub_model);
                tokio::task::spawn_blocking(move || model.lock().apply_sub_model(&sub_model))
            })
            .collect();
        join_all(tasks).await?;
        Ok(())
    }

    /// Answer an inference phase from shard 0, which holds the synced state
    pub fn inference(&self, phase: i32, message: Message, data: &mut InferenceData) -> Result<Message> {
        self.shards[0].model.lock().inference(phase, message, data)
    }

    pub fn snapshot(&self) -> ModelSnapshot {
        self.shards[0].model.lock().snapshot()
    }
}
