//! Core type definitions shared across parties, shards and the coordinator

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Unique identifier types
pub type PartyId = String;
pub type SessionId = String;
pub type ShardId = usize;

/// Index of a sample within a party's aligned training data
pub type SampleId = usize;

/// 1-based feature column id (0 is the identifier column)
pub type FeatureId = usize;

/// Query-table record id (1-based, 0 means "no record")
pub type RecordId = u32;

/// Whether a party holds the training label
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Role {
    /// Active party: owns the label and the key pair
    HasLabel,

    /// Passive party: owns features only
    NoLabel,
}

/// Training objective
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ObjectiveType {
    #[serde(rename = "reg:square")]
    RegSquare,
    #[serde(rename = "reg:logistic")]
    RegLogistic,
    #[serde(rename = "binary:logistic")]
    BinaryLogistic,
    #[serde(rename = "count:poisson")]
    CountPoisson,
    #[serde(rename = "multi:softmax")]
    MultiSoftmax,
    #[serde(rename = "multi:softprob")]
    MultiSoftProb,
}

impl ObjectiveType {
    /// Returns true for the multi-class objectives
    pub fn is_multi_class(&self) -> bool {
        matches!(self, ObjectiveType::MultiSoftmax | ObjectiveType::MultiSoftProb)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectiveType::RegSquare => "reg:square",
            ObjectiveType::RegLogistic => "reg:logistic",
            ObjectiveType::BinaryLogistic => "binary:logistic",
            ObjectiveType::CountPoisson => "count:poisson",
            ObjectiveType::MultiSoftmax => "multi:softmax",
            ObjectiveType::MultiSoftProb => "multi:softprob",
        }
    }
}

impl FromStr for ObjectiveType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "reg:square" => Ok(ObjectiveType::RegSquare),
            "reg:logistic" => Ok(ObjectiveType::RegLogistic),
            "binary:logistic" => Ok(ObjectiveType::BinaryLogistic),
            "count:poisson" => Ok(ObjectiveType::CountPoisson),
            "multi:softmax" => Ok(ObjectiveType::MultiSoftmax),
            "multi:softprob" => Ok(ObjectiveType::MultiSoftProb),
            other => Err(Error::UnsupportedObjective {
                objective: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for ObjectiveType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the constant first-round prediction is chosen
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FirstPredictType {
    /// Start from zero
    Zero,

    /// Start from the mean label
    Avg,

    /// Start from a uniform random value in [0, 1)
    Random,
}

/// Evaluation metric recorded once per boosting round
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MetricType {
    Rmse,
    Mse,
    Mae,
    Mape,
    Maape,
    Acc,
    Error,
    Auc,
    F1,
    Recall,
    Precision,
    Macc,
    Merror,
}

/// A single column of a party's feature schema
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SingleFeature {
    /// Column name as it appears in the raw table header
    pub name: String,

    /// Column type tag (informational, e.g. "float")
    pub kind: String,
}

impl SingleFeature {
    pub fn new(name: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
        }
    }
}

/// Feature schema of one party
///
/// The first column is always the sample identifier. The label column, when
/// present, is listed last and named by `label`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Features {
    /// All columns including identifier and label
    pub list: Vec<SingleFeature>,

    /// Name of the label column, if this party holds the label
    pub label: Option<String>,
}

impl Features {
    pub fn new(list: Vec<SingleFeature>, label: Option<String>) -> Self {
        Self { list, label }
    }

    /// Build a float-typed schema from column names
    pub fn from_names(uid: &str, names: &[&str], label: Option<&str>) -> Self {
        let mut list = vec![SingleFeature::new(uid, "string")];
        list.extend(names.iter().map(|n| SingleFeature::new(*n, "float")));
        if let Some(label) = label {
            list.push(SingleFeature::new(label, "float"));
        }
        Self {
            list,
            label: label.map(str::to_string),
        }
    }

    pub fn has_label(&self) -> bool {
        self.label.is_some()
    }

    /// Name of the identifier column
    pub fn uid_name(&self) -> Option<&str> {
        self.list.first().map(|f| f.name.as_str())
    }

    /// Feature columns in order, excluding identifier and label
    pub fn feature_columns(&self) -> Vec<&SingleFeature> {
        self.list
            .iter()
            .skip(1)
            .filter(|f| Some(&f.name) != self.label.as_ref())
            .collect()
    }

    /// Number of feature columns, excluding identifier and label
    pub fn feature_count(&self) -> usize {
        self.feature_columns().len()
    }
}

/// Identity of one worker unit inside a sharded party
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ShardInfo {
    /// Number of shards the party was split into
    pub worker_num: usize,

    /// Index of this shard (0 is the shard that owns decryption and tree growth)
    pub model_id: usize,

    /// Global feature ids of this shard's columns, in local column order
    pub feature_indexes: Vec<FeatureId>,
}

impl ShardInfo {
    /// Global id of a 1-based local column
    pub fn global_feature(&self, local: FeatureId) -> Option<FeatureId> {
        local
            .checked_sub(1)
            .and_then(|i| self.feature_indexes.get(i).copied())
    }

    /// 1-based local column of a global feature id
    pub fn local_feature(&self, global: FeatureId) -> Option<FeatureId> {
        self.feature_indexes
            .iter()
            .position(|&f| f == global)
            .map(|i| i + 1)
    }
}

/// Per-session training options outside the hyper-parameters
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TrainOptions {
    /// Present when this model is one shard of a distributed party
    pub shard: Option<ShardInfo>,

    /// Number of aligned samples, used to size the shard count
    pub match_size: usize,
}

/// Per-metric history of (round, value) entries
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MetricLedger {
    pub values: BTreeMap<MetricType, Vec<(usize, f64)>>,
}

impl MetricLedger {
    /// Create a ledger seeded with the worst possible value for each metric
    pub fn new(metrics: &[MetricType], maximize: bool) -> Self {
        let seed = if maximize { -f64::MAX } else { f64::MAX };
        let values = metrics.iter().map(|m| (*m, vec![(0, seed)])).collect();
        Self { values }
    }

    /// Append one round of metric values
    pub fn record(&mut self, round: &BTreeMap<MetricType, f64>) {
        for (metric, value) in round {
            let history = self.values.entry(*metric).or_default();
            let index = history.len();
            history.push((index, *value));
        }
    }

    /// Most recent value of a metric
    pub fn latest(&self, metric: MetricType) -> Option<f64> {
        self.values
            .get(&metric)
            .and_then(|h| h.last())
            .map(|(_, v)| *v)
    }

    /// Number of recorded rounds, excluding the seed entry
    pub fn rounds(&self) -> usize {
        self.values
            .values()
            .map(|h| h.len().saturating_sub(1))
            .max()
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_objective_parse() {
        assert_eq!(
            "binary:logistic".parse::<ObjectiveType>().unwrap(),
            ObjectiveType::BinaryLogistic
        );
        assert!("multi:softprob"
            .parse::<ObjectiveType>()
            .unwrap()
            .is_multi_class());

        let err = "rank:ndcg".parse::<ObjectiveType>().unwrap_err();
        assert!(matches!(err, Error::UnsupportedObjective { .. }));
    }

    #[test]
    fn test_feature_columns() {
        let features = Features::from_names("uid", &["x1", "x2"], Some("y"));
        assert!(features.has_label());
        assert_eq!(features.uid_name(), Some("uid"));
        assert_eq!(features.feature_count(), 2);
        let names: Vec<_> = features
            .feature_columns()
            .iter()
            .map(|f| f.name.clone())
            .collect();
        assert_eq!(names, vec!["x1", "x2"]);
    }

    #[test]
    fn test_shard_feature_mapping() {
        let shard = ShardInfo {
            worker_num: 2,
            model_id: 1,
            feature_indexes: vec![4, 5, 6],
        };
        assert_eq!(shard.global_feature(1), Some(4));
        assert_eq!(shard.global_feature(0), None);
        assert_eq!(shard.local_feature(6), Some(3));
        assert_eq!(shard.local_feature(2), None);
    }

    #[test]
    fn test_metric_ledger() {
        let mut ledger = MetricLedger::new(&[MetricType::Auc], true);
        assert_eq!(ledger.latest(MetricType::Auc), Some(-f64::MAX));
        assert_eq!(ledger.rounds(), 0);

        let mut round = BTreeMap::new();
        round.insert(MetricType::Auc, 0.75);
        ledger.record(&round);

        assert_eq!(ledger.latest(MetricType::Auc), Some(0.75));
        assert_eq!(ledger.values[&MetricType::Auc][1], (1, 0.75));
        assert_eq!(ledger.rounds(), 1);
    }
}
