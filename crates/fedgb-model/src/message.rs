//! Protocol messages exchanged between the coordinator and parties
//!
//! Ciphertexts and keys travel in their string form so messages stay
//! independent of the encryption scheme.

use crate::loss::Loss;
use crate::query::QueryTable;
use crate::tree::{NodeId, Tree};
use fedgb_core::{
    FeatureId, Features, FgbParameter, MetricLedger, PartyId, RecordId, SampleId, ShardId,
    TrainOptions,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Serialized encrypted (gradient, hessian) pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CipherPair {
    pub g: String,
    pub h: String,
}

/// Phase 0: training initialization, split by feature range when sharded
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainInit {
    pub parameter: FgbParameter,
    pub features: Features,
    pub test_index: Vec<usize>,
    /// Aligned sample ids produced by ID matching
    pub match_id: Vec<String>,
    pub options: TrainOptions,
}

/// Phase 1 request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct P1Request {
    /// Receiving party
    pub client: PartyId,
    /// True on the first node of a tree
    pub new_tree: bool,
}

/// Phase 1 response of the active party, forwarded as the phase 2 request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EncryptedGradHess {
    /// Receiving party
    pub client: Option<PartyId>,
    /// Samples routed to the node being split
    pub instance_space: Vec<SampleId>,
    /// Encrypted pairs aligned with `instance_space`, only on a new tree
    pub gh: Option<Vec<CipherPair>>,
    /// Only on a new tree
    pub public_key: Option<String>,
    pub new_tree: bool,
    pub sub_model: Option<SubModel>,
}

/// Encrypted per-bucket (g, h) sums of one feature
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureLeftGH {
    /// Party owning the feature
    pub client: Option<PartyId>,
    pub feature: FeatureId,
    /// One entry per bucket; None when no sample of the bucket was cached
    pub gh_left: Vec<Option<CipherPair>>,
    /// Per bucket, sample ids whose ciphertexts this shard does not hold
    pub instance_list: Vec<Vec<SampleId>>,
}

/// Phase 2 response
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct P2Response {
    pub feature_gl: Option<Vec<FeatureLeftGH>>,
}

/// Phase 3 request to the active party
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct P3Request {
    /// Receiving (active) party
    pub client: PartyId,
    /// One list of feature sums per passive party
    pub data_list: Vec<Vec<FeatureLeftGH>>,
}

/// Winning split candidate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplitChoice {
    pub client: PartyId,
    pub feature: FeatureId,
    pub split_index: usize,
    pub gain: f64,
}

/// Phase 3 response; `best` is None from passive parties or when no
/// feature offers a split
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct P3Response {
    pub best: Option<SplitChoice>,
    pub sub_model: Option<SubModel>,
}

/// Phase 4 request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct P4Request {
    /// Receiving party
    pub client: PartyId,
    pub feature: FeatureId,
    pub split_index: usize,
    /// True only for the party owning the winning feature
    pub accept: bool,
}

/// Phase 4 response, forwarded as the phase 5 request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LeftTreeInfo {
    /// 0 when this party did not own the split
    pub record_id: RecordId,
    pub left_instances: Option<Vec<SampleId>>,
    pub train_metric: Option<MetricLedger>,
    pub sub_model: Option<SubModel>,
}

/// Phase 5 response
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct P5Response {
    /// The tree is finished
    pub is_stop: bool,
    pub depth: usize,
    pub train_metric: Option<MetricLedger>,
    pub sub_model: Option<SubModel>,
}

/// Phase -1 response of a party holding trees
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceTrees {
    pub trees: Vec<Tree>,
    pub first_round_pred: f64,
    pub multi_class_labels: Vec<f64>,
    pub eta: f64,
    pub loss: Option<Loss>,
}

/// Phase -2 request entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingQuery {
    pub sample: SampleId,
    pub tree: usize,
    pub record_id: RecordId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Left,
    Right,
}

/// Phase -2 response entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub sample: SampleId,
    pub tree: usize,
    pub direction: Direction,
}

/// State delta applied to the other shards of a party after a phase
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SubModel {
    /// Phase 1: public key (on a new tree), active tree and the node being split
    NodeOpened {
        public_key: Option<String>,
        tree: Tree,
        current_node: NodeId,
        num_class_round: usize,
        new_tree: bool,
    },
    /// Phase 3: winning split recorded on the current node
    SplitChosen { best: Option<SplitChoice> },
    /// Phase 4: query table after the owning shard appended its record
    QueryTable(QueryTable),
    /// Phase 5: refreshed gradients and the active tree
    RoundUpdated {
        grad: Vec<Vec<f64>>,
        hess: Vec<Vec<f64>>,
        num_class_round: usize,
        record_id: RecordId,
        tree: Tree,
        metrics: MetricLedger,
    },
}

/// Contiguous slice of a new tree's encrypted pairs handed to one shard
///
/// `instance_min..instance_max` are positions in the request's instance space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GhSlice {
    pub shard: ShardId,
    pub instance_min: usize,
    pub instance_max: usize,
    pub gh: Vec<CipherPair>,
}

/// Per feature and bucket, sample ids a shard could not sum itself
pub type PendingInstances = BTreeMap<FeatureId, Vec<Vec<SampleId>>>;

/// Per feature and bucket, encrypted sums another shard computed for them
pub type PartialSums = BTreeMap<FeatureId, Vec<Option<CipherPair>>>;

/// Any message of the training or inference protocol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "body")]
pub enum Message {
    Empty,
    TrainInit(TrainInit),
    P1Request(P1Request),
    EncryptedGradHess(EncryptedGradHess),
    P2Response(P2Response),
    P3Request(P3Request),
    P3Response(P3Response),
    P4Request(P4Request),
    LeftTreeInfo(LeftTreeInfo),
    P5Response(P5Response),
    Uids(Vec<String>),
    InferenceTrees(InferenceTrees),
    RoutingQueries(Vec<RoutingQuery>),
    RoutingDecisions(Vec<RoutingDecision>),
}

impl Message {
    /// Variant name, used in protocol errors
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Empty => "Empty",
            Message::TrainInit(_) => "TrainInit",
            Message::P1Request(_) => "P1Request",
            Message::EncryptedGradHess(_) => "EncryptedGradHess",
            Message::P2Response(_) => "P2Response",
            Message::P3Request(_) => "P3Request",
            Message::P3Response(_) => "P3Response",
            Message::P4Request(_) => "P4Request",
            Message::LeftTreeInfo(_) => "LeftTreeInfo",
            Message::P5Response(_) => "P5Response",
            Message::Uids(_) => "Uids",
            Message::InferenceTrees(_) => "InferenceTrees",
            Message::RoutingQueries(_) => "RoutingQueries",
            Message::RoutingDecisions(_) => "RoutingDecisions",
        }
    }

    /// Detach the shard sync delta carried by a response
    pub fn take_sub_model(&mut self) -> Option<SubModel> {
        match self {
            Message::EncryptedGradHess(m) => m.sub_model.take(),
            Message::P3Response(m) => m.sub_model.take(),
            Message::LeftTreeInfo(m) => m.sub_model.take(),
            Message::P5Response(m) => m.sub_model.take(),
            _ => None,
        }
    }

    /// Encode for transport
    pub fn to_json(&self) -> fedgb_core::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(s: &str) -> fedgb_core::Result<Self> {
        Ok(serde_json::from_str(s)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_kind() {
        assert_eq!(Message::Empty.kind(), "Empty");
        let msg = Message::P4Request(P4Request {
            client: "b".to_string(),
            feature: 2,
            split_index: 0,
            accept: true,
        });
        assert_eq!(msg.kind(), "P4Request");
    }

    #[test]
    fn test_take_sub_model() {
        let mut msg = Message::LeftTreeInfo(LeftTreeInfo {
            record_id: 1,
            left_instances: Some(vec![0, 2]),
            train_metric: None,
            sub_model: Some(SubModel::QueryTable(QueryTable::new())),
        });
        assert!(msg.take_sub_model().is_some());
        assert!(msg.take_sub_model().is_none());
        assert!(Message::Empty.clone().take_sub_model().is_none());
    }

    #[test]
    fn test_json_transport() {
        let msg = Message::EncryptedGradHess(EncryptedGradHess {
            client: Some("party-b".to_string()),
            instance_space: vec![0, 1, 2],
            gh: Some(vec![CipherPair {
                g: "ab".to_string(),
                h: "cd".to_string(),
            }]),
            public_key: Some("ff".to_string()),
            new_tree: true,
            sub_model: None,
        });
        let json = msg.to_json().unwrap();
        assert!(json.contains("\"type\":\"EncryptedGradHess\""));
        assert_eq!(Message::from_json(&json).unwrap(), msg);
    }
}
