//! Line-oriented text format of a trained model
//!
//! ```text
//! first_round_predict 0.5
//! eta 0.3
//! loss logistic
//! trees 1
//! tree 3 0
//! node 1 1 2 0 -1.5 2 4 1 2 3 0 0.8 party-b 1 0
//! node 2 2 2 1 -1 1 2 - - - - 0 - 0 0.5
//! node 4 2 2 1 -0.5 1 2 - - - - 0 - 0 0.25
//! end_tree
//! query_table 1
//! record 1 3 0.5
//! labels
//! ```
//!
//! Node fields: index, depth, feature_dim, leaf flag, grad, hess,
//! num_sample, left child, right child, split feature, split index, gain,
//! client, record id, leaf score. `-` marks an absent value. Instance spaces
//! are not stored.

use crate::loss::Loss;
use crate::query::{QueryEntry, QueryTable};
use crate::tree::{Tree, TreeNode};
use fedgb_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Write as _};
use std::str::FromStr;

/// Everything a party needs to serve inference
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSnapshot {
    pub first_round_pred: f64,
    pub eta: f64,
    /// Present only for the label-holding party
    pub loss: Option<Loss>,
    pub trees: Vec<Tree>,
    pub query_table: QueryTable,
    pub multi_class_labels: Vec<f64>,
}

fn optional<T: Display>(value: Option<T>) -> String {
    value.map_or_else(|| "-".to_string(), |v| v.to_string())
}

impl ModelSnapshot {
    /// Encode as text
    pub fn to_text(&self) -> Result<String> {
        let mut out = String::new();
        // fmt::Write into a String cannot fail
        let _ = writeln!(out, "first_round_predict {}", self.first_round_pred);
        let _ = writeln!(out, "eta {}", self.eta);
        let _ = writeln!(
            out,
            "loss {}",
            self.loss.map_or_else(|| "none".to_string(), |l| l.identifier())
        );

        let _ = writeln!(out, "trees {}", self.trees.len());
        for tree in &self.trees {
            let _ = writeln!(out, "tree {} {}", tree.len(), tree.root());
            for node in tree.nodes() {
                let client = match &node.client {
                    Some(c) if c.is_empty() || c.chars().any(char::is_whitespace) => {
                        return Err(Error::Serialization(format!(
                            "client id {c:?} cannot be written to the model text"
                        )));
                    }
                    other => optional(other.as_deref()),
                };
                let _ = writeln!(
                    out,
                    "node {} {} {} {} {} {} {} {} {} {} {} {} {} {} {}",
                    node.index,
                    node.depth,
                    node.feature_dim,
                    u8::from(node.is_leaf),
                    node.grad,
                    node.hess,
                    node.num_sample,
                    optional(node.left),
                    optional(node.right),
                    optional(node.split_feature),
                    optional(node.split_index),
                    node.gain,
                    client,
                    node.record_id,
                    node.leaf_score,
                );
            }
            let _ = writeln!(out, "end_tree");
        }

        let _ = writeln!(out, "query_table {}", self.query_table.len());
        for entry in self.query_table.entries() {
            let _ = writeln!(
                out,
                "record {} {} {}",
                entry.record_id, entry.feature, entry.threshold
            );
        }

        let labels: Vec<String> = self.multi_class_labels.iter().map(f64::to_string).collect();
        let _ = writeln!(out, "labels {}", labels.join(","));
        Ok(out)
    }

    /// Decode text produced by [`ModelSnapshot::to_text`]
    pub fn from_text(text: &str) -> Result<Self> {
        let mut reader = LineReader::new(text);

        let first_round_pred = reader.keyed("first_round_predict")?.value(0)?;
        let eta = reader.keyed("eta")?.value(0)?;
        let loss = {
            let line = reader.keyed("loss")?;
            match line.token(0)? {
                "none" => None,
                id => Some(Loss::from_identifier(id).map_err(|e| line.error(e.to_string()))?),
            }
        };

        let tree_count: usize = reader.keyed("trees")?.value(0)?;
        let mut trees = Vec::with_capacity(tree_count);
        for _ in 0..tree_count {
            let header = reader.keyed("tree")?;
            let node_count: usize = header.value(0)?;
            let root: usize = header.value(1)?;
            if root >= node_count {
                return Err(header.error(format!("root {root} outside {node_count} nodes")));
            }

            let mut nodes = Vec::with_capacity(node_count);
            for _ in 0..node_count {
                let line = reader.keyed("node")?;
                let node = line.node()?;
                for child in [node.left, node.right].into_iter().flatten() {
                    if child >= node_count {
                        return Err(line.error(format!("child {child} outside {node_count} nodes")));
                    }
                }
                nodes.push(node);
            }
            reader.keyed("end_tree")?;
            trees.push(Tree::from_nodes(nodes, root));
        }

        let record_count: usize = reader.keyed("query_table")?.value(0)?;
        let mut entries = Vec::with_capacity(record_count);
        for _ in 0..record_count {
            let line = reader.keyed("record")?;
            entries.push(QueryEntry {
                record_id: line.value(0)?,
                feature: line.value(1)?,
                threshold: line.value(2)?,
            });
        }

        let labels_line = reader.keyed("labels")?;
        let multi_class_labels = match labels_line.tokens.first() {
            None => Vec::new(),
            Some(list) => list
                .split(',')
                .map(|v| v.parse().map_err(|_| labels_line.error(format!("bad label {v:?}"))))
                .collect::<Result<Vec<f64>>>()?,
        };

        Ok(Self {
            first_round_pred,
            eta,
            loss,
            trees,
            query_table: QueryTable::from_entries(entries),
            multi_class_labels,
        })
    }
}

struct LineReader<'a> {
    lines: std::iter::Enumerate<std::str::Lines<'a>>,
}

struct Line<'a> {
    number: usize,
    tokens: Vec<&'a str>,
}

impl<'a> LineReader<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            lines: text.lines().enumerate(),
        }
    }

    /// Next non-blank line, which must start with `key`
    fn keyed(&mut self, key: &str) -> Result<Line<'a>> {
        for (i, raw) in self.lines.by_ref() {
            let mut tokens = raw.split_whitespace();
            let Some(first) = tokens.next() else {
                continue;
            };
            let line = Line {
                number: i + 1,
                tokens: tokens.collect(),
            };
            if first != key {
                return Err(line.error(format!("expected {key:?}, found {first:?}")));
            }
            return Ok(line);
        }
        Err(Error::ModelFormat {
            line: 0,
            message: format!("unexpected end of input, expected {key:?}"),
        })
    }
}

impl<'a> Line<'a> {
    fn error(&self, message: impl Into<String>) -> Error {
        Error::ModelFormat {
            line: self.number,
            message: message.into(),
        }
    }

    fn token(&self, i: usize) -> Result<&'a str> {
        self.tokens
            .get(i)
            .copied()
            .ok_or_else(|| self.error(format!("missing field {}", i + 1)))
    }

    fn value<T: FromStr>(&self, i: usize) -> Result<T> {
        let token = self.token(i)?;
        token
            .parse()
            .map_err(|_| self.error(format!("invalid value {token:?}")))
    }

    fn optional<T: FromStr>(&self, i: usize) -> Result<Option<T>> {
        match self.token(i)? {
            "-" => Ok(None),
            _ => self.value(i).map(Some),
        }
    }

    fn node(&self) -> Result<TreeNode> {
        if self.tokens.len() != 15 {
            return Err(self.error(format!("node has {} fields, expected 15", self.tokens.len())));
        }
        let is_leaf = match self.token(3)? {
            "0" => false,
            "1" => true,
            other => return Err(self.error(format!("invalid leaf flag {other:?}"))),
        };
        Ok(TreeNode {
            index: self.value(0)?,
            depth: self.value(1)?,
            feature_dim: self.value(2)?,
            is_leaf,
            grad: self.value(4)?,
            hess: self.value(5)?,
            num_sample: self.value(6)?,
            instance_space: Vec::new(),
            left: self.optional(7)?,
            right: self.optional(8)?,
            split_feature: self.optional(9)?,
            split_index: self.optional(10)?,
            gain: self.value(11)?,
            client: self.optional(12)?,
            record_id: self.value(13)?,
            leaf_score: self.value(14)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_snapshot() -> ModelSnapshot {
        let mut root = TreeNode::new(1, 1, 2, Vec::new(), -1.5, 2.0);
        root.num_sample = 4;
        root.left = Some(1);
        root.right = Some(2);
        root.split_feature = Some(3);
        root.split_index = Some(0);
        root.gain = 0.8;
        root.client = Some("party-b".to_string());
        root.record_id = 1;

        let mut left = TreeNode::new(2, 2, 2, Vec::new(), -1.0, 1.0);
        left.is_leaf = true;
        left.leaf_score = 0.5;
        let mut right = TreeNode::new(4, 2, 2, Vec::new(), -0.5, 1.0);
        right.is_leaf = true;
        right.leaf_score = 0.25;

        let mut table = QueryTable::new();
        table.append(3, 0.1);

        ModelSnapshot {
            first_round_pred: 0.5,
            eta: 0.3,
            loss: Some(Loss::Logistic),
            trees: vec![Tree::from_nodes(vec![root, left, right], 0)],
            query_table: table,
            multi_class_labels: Vec::new(),
        }
    }

    #[test]
    fn test_text_round_trip() {
        let snapshot = sample_snapshot();
        let text = snapshot.to_text().unwrap();
        assert!(text.starts_with("first_round_predict 0.5\neta 0.3\nloss logistic\n"));
        assert!(text.contains("node 1 1 2 0 -1.5 2 4 1 2 3 0 0.8 party-b 1 0\n"));
        assert!(text.contains("record 1 3 0.1\n"));
        assert_eq!(ModelSnapshot::from_text(&text).unwrap(), snapshot);
    }

    #[test]
    fn test_passive_model_without_loss() {
        let snapshot = ModelSnapshot {
            first_round_pred: 0.0,
            eta: 0.3,
            loss: None,
            trees: Vec::new(),
            query_table: QueryTable::from_entries(vec![QueryEntry {
                record_id: 1,
                feature: 2,
                threshold: -0.25,
            }]),
            multi_class_labels: vec![3.0, 7.0, 8.0],
        };
        let text = snapshot.to_text().unwrap();
        assert!(text.contains("loss none\n"));
        assert!(text.contains("labels 3,7,8\n"));
        assert_eq!(ModelSnapshot::from_text(&text).unwrap(), snapshot);
    }

    #[test]
    fn test_rejects_client_with_whitespace() {
        let mut snapshot = sample_snapshot();
        snapshot.trees = vec![{
            let mut node = TreeNode::new(1, 1, 1, Vec::new(), 0.0, 0.0);
            node.client = Some("party b".to_string());
            Tree::from_nodes(vec![node], 0)
        }];
        assert!(matches!(snapshot.to_text(), Err(Error::Serialization(_))));
    }

    #[test]
    fn test_format_errors_report_line() {
        let text = sample_snapshot().to_text().unwrap();

        let broken = text.replace("eta 0.3", "eta fast");
        match ModelSnapshot::from_text(&broken) {
            Err(Error::ModelFormat { line, .. }) => assert_eq!(line, 2),
            other => panic!("expected format error, got {other:?}"),
        }

        let dangling = text.replace("node 1 1 2 0 -1.5 2 4 1 2", "node 1 1 2 0 -1.5 2 4 1 9");
        assert!(matches!(
            ModelSnapshot::from_text(&dangling),
            Err(Error::ModelFormat { line: 6, .. })
        ));

        let truncated: String = text.lines().take(5).collect::<Vec<_>>().join("\n");
        assert!(matches!(
            ModelSnapshot::from_text(&truncated),
            Err(Error::ModelFormat { line: 0, .. })
        ));
    }
}
