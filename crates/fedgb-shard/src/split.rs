//! Splitting one party's phase across feature-range shards and reducing the
//! shard responses back into one message

use fedgb_core::{
    DistributionPolicy, Error, Features, Result, ShardId, ShardInfo, TrainOptions,
};
use fedgb_model::message::{
    EncryptedGradHess, GhSlice, P2Response, P3Response, PendingInstances, TrainInit,
};
use fedgb_model::Message;
use std::ops::Range;
use tracing::debug;

/// How shard responses of one phase are reduced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceStrategy {
    /// Single shard, response forwarded unchanged
    PassThrough,
    /// Feature results of every shard, in shard order
    Concatenate,
    /// Shard result with the largest gain, first one on ties
    MaxGain,
    /// First shard that disclosed left instances
    FirstNonEmpty,
}

/// Messages for the shards taking part in a phase
#[derive(Debug, Clone)]
pub struct SplitResult {
    pub shard_ids: Vec<ShardId>,
    pub messages: Vec<Message>,
    pub reduce: ReduceStrategy,
    /// Encrypted g/h slices to cache before running phase 2 on a new tree
    pub gh_slices: Vec<GhSlice>,
}

impl SplitResult {
    fn single(message: Message) -> Self {
        Self {
            shard_ids: vec![0],
            messages: vec![message],
            reduce: ReduceStrategy::PassThrough,
            gh_slices: Vec::new(),
        }
    }

    fn broadcast(message: Message, shards: usize, reduce: ReduceStrategy) -> Self {
        Self {
            shard_ids: (0..shards).collect(),
            messages: vec![message; shards],
            reduce,
            gh_slices: Vec::new(),
        }
    }
}

/// Contiguous ranges covering `0..len`; the first `len % parts` ranges are one longer
pub fn partition_ranges(len: usize, parts: usize) -> Vec<Range<usize>> {
    let parts = parts.max(1);
    let base = len / parts;
    let rem = len % parts;
    let mut start = 0;
    (0..parts)
        .map(|i| {
            let end = start + base + usize::from(i < rem);
            let range = start..end;
            start = end;
            range
        })
        .collect()
}

/// Cut a list into `parts` contiguous pieces, remainder to the leading pieces
pub fn split_list<T: Clone>(items: &[T], parts: usize) -> Vec<Vec<T>> {
    partition_ranges(items.len(), parts)
        .into_iter()
        .map(|r| items[r].to_vec())
        .collect()
}

/// Detach a new tree's encrypted pairs into one contiguous slice per shard
pub fn split_gh(request: &mut EncryptedGradHess, shards: usize) -> Vec<GhSlice> {
    let Some(gh) = request.gh.take() else {
        return Vec::new();
    };
    partition_ranges(gh.len(), shards)
        .into_iter()
        .enumerate()
        .map(|(shard, range)| GhSlice {
            shard,
            instance_min: range.start,
            instance_max: range.end,
            gh: gh[range].to_vec(),
        })
        .collect()
}

/// Per feature and bucket, sample ids the responding shard could not sum
pub fn pending_instances(response: &P2Response) -> PendingInstances {
    response
        .feature_gl
        .iter()
        .flatten()
        .filter(|f| f.instance_list.iter().any(|ids| !ids.is_empty()))
        .map(|f| (f.feature, f.instance_list.clone()))
        .collect()
}

/// Plans how a party's phases fan out over its shards
#[derive(Debug, Clone)]
pub struct ShardPlanner {
    policy: DistributionPolicy,
    shard_count: usize,
}

impl Default for ShardPlanner {
    fn default() -> Self {
        Self::new(DistributionPolicy::default())
    }
}

impl ShardPlanner {
    pub fn new(policy: DistributionPolicy) -> Self {
        Self {
            policy,
            shard_count: 1,
        }
    }

    /// Planner for a party already split into `shard_count` shards
    pub fn with_shard_count(mut self, shard_count: usize) -> Self {
        self.shard_count = shard_count.max(1);
        self
    }

    pub fn shard_count(&self) -> usize {
        self.shard_count
    }

    pub fn policy(&self) -> &DistributionPolicy {
        &self.policy
    }

    /// Split one phase's request into per-shard requests
    pub fn split(&self, phase: i32, message: Message) -> Result<SplitResult> {
        let shards = self.shard_count;
        let plan = match (phase, message) {
            (0, Message::TrainInit(init)) => self.split_init(init),
            (0, other) => return Err(Error::phase_mismatch(0, "TrainInit", other.kind())),
            (1 | 5, message) => SplitResult::single(message),
            (2 | 3, Message::Empty) => SplitResult::single(Message::Empty),
            (2, Message::EncryptedGradHess(mut request)) => {
                let gh_slices = split_gh(&mut request, shards);
                SplitResult {
                    gh_slices,
                    ..SplitResult::broadcast(
                        Message::EncryptedGradHess(request),
                        shards,
                        ReduceStrategy::Concatenate,
                    )
                }
            }
            (2, other) => return Err(Error::phase_mismatch(2, "EncryptedGradHess", other.kind())),
            (3, message) => SplitResult::broadcast(message, shards, ReduceStrategy::MaxGain),
            (4, Message::P4Request(request)) if request.accept => SplitResult::broadcast(
                Message::P4Request(request),
                shards,
                ReduceStrategy::FirstNonEmpty,
            ),
            (4, message) => SplitResult::single(message),
            (other, _) => return Err(Error::UnsupportedPhase { phase: other }),
        };

        debug!(
            phase,
            shards = plan.shard_ids.len(),
            reduce = ?plan.reduce,
            slices = plan.gh_slices.len(),
            "Split phase"
        );
        Ok(plan)
    }

    /// Training init split by contiguous feature ranges
    fn split_init(&self, init: TrainInit) -> SplitResult {
        let columns: Vec<_> = init
            .features
            .feature_columns()
            .into_iter()
            .cloned()
            .enumerate()
            .map(|(i, f)| (i + 1, f))
            .collect();
        let samples = if init.options.match_size > 0 {
            init.options.match_size
        } else {
            init.match_id.len()
        };
        let shards = self.policy.shard_count(samples, columns.len());

        let uid = init.features.list.first().cloned();
        let label = init.features.label.as_ref().and_then(|name| {
            init.features
                .list
                .iter()
                .find(|f| &f.name == name)
                .cloned()
        });

        let messages: Vec<Message> = split_list(&columns, shards)
            .into_iter()
            .enumerate()
            .map(|(model_id, part)| {
                let feature_indexes = part.iter().map(|(id, _)| *id).collect();
                let list = uid
                    .iter()
                    .cloned()
                    .chain(part.into_iter().map(|(_, f)| f))
                    .chain(label.iter().cloned())
                    .collect();
                Message::TrainInit(TrainInit {
                    features: Features::new(list, init.features.label.clone()),
                    options: TrainOptions {
                        shard: Some(ShardInfo {
                            worker_num: shards,
                            model_id,
                            feature_indexes,
                        }),
                        match_size: samples,
                    },
                    ..init.clone()
                })
            })
            .collect();

        SplitResult {
            shard_ids: (0..shards).collect(),
            messages,
            reduce: ReduceStrategy::PassThrough,
            gh_slices: Vec::new(),
        }
    }

    /// Reduce shard responses of a phase into one message
    pub fn merge(&self, phase: i32, responses: Vec<Message>) -> Result<Message> {
        self.merge_indexed(phase, responses).map(|(message, _)| message)
    }

    /// Like [`ShardPlanner::merge`], also returning the position of the
    /// response whose shard-sync delta the merged message carries
    pub fn merge_indexed(&self, phase: i32, mut responses: Vec<Message>) -> Result<(Message, usize)> {
        if responses.is_empty() {
            return Err(Error::MergeTypeError {
                phase,
                message: "no shard responses".to_string(),
            });
        }
        let expected = match phase {
            1 => "EncryptedGradHess",
            2 => "P2Response",
            3 => "P3Response",
            4 => "LeftTreeInfo",
            5 => "P5Response",
            other => return Err(Error::UnsupportedPhase { phase: other }),
        };
        if let Some(bad) = responses.iter().find(|r| r.kind() != expected) {
            return Err(Error::phase_mismatch(phase, expected, bad.kind()));
        }

        match phase {
            2 => {
                let mut merged: Option<Vec<_>> = None;
                for response in responses {
                    if let Message::P2Response(P2Response {
                        feature_gl: Some(features),
                    }) = response
                    {
                        merged.get_or_insert_with(Vec::new).extend(features);
                    }
                }
                Ok((
                    Message::P2Response(P2Response { feature_gl: merged }),
                    0,
                ))
            }
            3 => {
                let mut winner = 0;
                let mut best_gain = None;
                for (i, response) in responses.iter().enumerate() {
                    if let Message::P3Response(P3Response {
                        best: Some(choice), ..
                    }) = response
                    {
                        if best_gain.map_or(true, |g| choice.gain > g) {
                            best_gain = Some(choice.gain);
                            winner = i;
                        }
                    }
                }
                Ok((responses.swap_remove(winner), winner))
            }
            4 => {
                let owner = responses
                    .iter()
                    .position(|r| {
                        matches!(r, Message::LeftTreeInfo(info) if info.left_instances.is_some())
                    })
                    .unwrap_or(0);
                Ok((responses.swap_remove(owner), owner))
            }
            _ => Ok((responses.swap_remove(0), 0)),
        }
    }
}
