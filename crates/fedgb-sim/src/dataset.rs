//! Synthetic vertically partitioned datasets
//!
//! Every party sees the same sample ids but a disjoint set of feature
//! columns. The first party also holds the label, which is a function of
//! all parties' features so that no single party can fit it alone.

use fedgb_core::{Features, PartyId};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Kind of label to generate
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Task {
    /// 0/1 label
    Binary,
    /// Real-valued label
    Regression,
    /// Positive integer counts
    Count,
    /// Class labels 0..n
    MultiClass(usize),
}

/// Synthetic dataset configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SyntheticConfig {
    /// Number of samples
    pub samples: usize,

    /// Feature count of each party; the first party holds the label
    pub features_per_party: Vec<usize>,

    pub task: Task,

    /// Standard deviation of the label noise
    pub noise: f64,

    /// RNG seed
    pub seed: u64,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            samples: 200,
            features_per_party: vec![2, 3, 2],
            task: Task::Binary,
            noise: 0.1,
            seed: 42,
        }
    }
}

/// Raw table and schema of one party
#[derive(Debug, Clone)]
pub struct PartyData {
    pub name: PartyId,
    /// Header row first
    pub raw: Arc<Vec<Vec<String>>>,
    pub features: Features,
}

/// All parties of a generated dataset
#[derive(Debug, Clone)]
pub struct VerticalDataset {
    pub uids: Vec<String>,
    pub parties: Vec<PartyData>,
    /// Labels in `uids` order
    pub labels: Vec<f64>,
}

/// Party name for an index: "a", "b", ...
pub fn party_name(index: usize) -> PartyId {
    let letter = (b'a' + (index % 26) as u8) as char;
    if index < 26 {
        letter.to_string()
    } else {
        format!("{letter}{}", index / 26)
    }
}

/// Generate a dataset
pub fn generate(config: &SyntheticConfig) -> VerticalDataset {
    let mut rng = ChaCha8Rng::seed_from_u64(config.seed);
    let uids: Vec<String> = (0..config.samples).map(|i| format!("u{i:05}")).collect();

    // columns[party][feature][sample]
    let columns: Vec<Vec<Vec<f64>>> = config
        .features_per_party
        .iter()
        .map(|&n| {
            (0..n)
                .map(|_| (0..config.samples).map(|_| rng.gen_range(-1.0..1.0)).collect())
                .collect()
        })
        .collect();
    let weights: Vec<Vec<f64>> = config
        .features_per_party
        .iter()
        .map(|&n| (0..n).map(|_| rng.gen_range(0.5..2.0)).collect())
        .collect();

    let scores: Vec<f64> = (0..config.samples)
        .map(|s| {
            let signal: f64 = columns
                .iter()
                .zip(&weights)
                .flat_map(|(cols, ws)| cols.iter().zip(ws).map(move |(c, w)| c[s] * w))
                .sum();
            signal + config.noise * rng.gen_range(-1.0..1.0)
        })
        .collect();
    let labels = labels_for(config.task, &scores);

    let parties = columns
        .iter()
        .enumerate()
        .map(|(p, cols)| {
            let name = party_name(p);
            let names: Vec<String> = (1..=cols.len()).map(|j| format!("{name}_x{j}")).collect();
            let with_label = p == 0;

            let mut header = vec!["uid".to_string()];
            header.extend(names.iter().cloned());
            if with_label {
                header.push("y".to_string());
            }

            let mut raw = vec![header];
            for (s, uid) in uids.iter().enumerate() {
                let mut row = vec![uid.clone()];
                row.extend(cols.iter().map(|c| format!("{:.4}", c[s])));
                if with_label {
                    row.push(labels[s].to_string());
                }
                raw.push(row);
            }

            let refs: Vec<&str> = names.iter().map(String::as_str).collect();
            PartyData {
                name,
                raw: Arc::new(raw),
                features: Features::from_names("uid", &refs, with_label.then_some("y")),
            }
        })
        .collect();

    VerticalDataset {
        uids,
        parties,
        labels,
    }
}

fn labels_for(task: Task, scores: &[f64]) -> Vec<f64> {
    match task {
        Task::Binary => scores.iter().map(|s| f64::from(u8::from(*s > 0.0))).collect(),
        Task::Regression => scores.iter().map(|s| (s * 1000.0).round() / 1000.0).collect(),
        Task::Count => scores.iter().map(|s| s.exp().round() + 1.0).collect(),
        Task::MultiClass(n) => {
            let n = n.max(2);
            let mut sorted = scores.to_vec();
            sorted.sort_by(f64::total_cmp);
            // Equal-frequency classes
            scores
                .iter()
                .map(|s| {
                    let rank = sorted.partition_point(|v| v < s);
                    ((rank * n) / scores.len().max(1)).min(n - 1) as f64
                })
                .collect()
        }
    }
}
