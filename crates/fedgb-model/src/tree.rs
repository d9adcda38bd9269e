//! Arena-backed regression tree grown one node split at a time
//!
//! Nodes reference their children by arena id, so ownership stays a strict
//! tree and a whole tree can be cloned into shard sync messages.

use fedgb_core::{FeatureId, PartyId, RecordId, SampleId};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::ops::{Index, IndexMut};

/// Arena id of a node within its tree
pub type NodeId = usize;

/// Gain of splitting (g, h) into (gL, hL) and (g - gL, h - hL)
pub fn split_gain(gl: f64, hl: f64, g: f64, h: f64, lambda: f64, gamma: f64) -> f64 {
    let gr = g - gl;
    let hr = h - hl;
    0.5 * (score(gl, hl, lambda) + score(gr, hr, lambda) - score(g, h, lambda)) - gamma
}

/// g² / (h + λ); an empty side with λ = 0 scores 0
fn score(g: f64, h: f64, lambda: f64) -> f64 {
    let denominator = h + lambda;
    if denominator > 0.0 {
        g * g / denominator
    } else {
        0.0
    }
}

/// Closed-form leaf weight
///
/// A leaf no training sample reached has h = 0; with λ = 0 its weight is 0
/// rather than NaN, so inference never routes into a non-finite score.
pub fn leaf_score(g: f64, h: f64, lambda: f64) -> f64 {
    let denominator = h + lambda;
    if denominator > 0.0 {
        -g / denominator
    } else {
        0.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeNode {
    /// Heap-style index: root 1, children 3i-1 and 3i+1
    pub index: usize,
    /// Root depth is 1
    pub depth: usize,
    pub feature_dim: usize,
    pub is_leaf: bool,
    pub grad: f64,
    pub hess: f64,
    pub num_sample: usize,
    /// Sorted sample ids routed to this node
    pub instance_space: Vec<SampleId>,
    pub left: Option<NodeId>,
    pub right: Option<NodeId>,
    pub split_feature: Option<FeatureId>,
    pub split_index: Option<usize>,
    pub gain: f64,
    /// Party that owns the split feature
    pub client: Option<PartyId>,
    /// Query-table record of the owning party
    pub record_id: RecordId,
    pub leaf_score: f64,
}

impl TreeNode {
    pub fn new(
        index: usize,
        depth: usize,
        feature_dim: usize,
        instance_space: Vec<SampleId>,
        grad: f64,
        hess: f64,
    ) -> Self {
        Self {
            index,
            depth,
            feature_dim,
            is_leaf: false,
            grad,
            hess,
            num_sample: instance_space.len(),
            instance_space,
            left: None,
            right: None,
            split_feature: None,
            split_index: None,
            gain: 0.0,
            client: None,
            record_id: 0,
            leaf_score: 0.0,
        }
    }
}

/// Conditions under which a freshly created node stops splitting
#[derive(Debug, Clone, Copy)]
pub struct LeafCondition {
    pub max_depth: usize,
    pub min_child_weight: f64,
    pub min_sample_split: usize,
}

impl LeafCondition {
    pub fn is_leaf(&self, node: &TreeNode) -> bool {
        node.depth >= self.max_depth
            || node.hess < self.min_child_weight
            || node.num_sample <= self.min_sample_split
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tree {
    nodes: Vec<TreeNode>,
    root: NodeId,
    /// Nodes waiting for phases 1-5
    alive: VecDeque<NodeId>,
    /// Children created during the current level
    pending: Vec<NodeId>,
}

impl Index<NodeId> for Tree {
    type Output = TreeNode;

    fn index(&self, id: NodeId) -> &TreeNode {
        &self.nodes[id]
    }
}

impl IndexMut<NodeId> for Tree {
    fn index_mut(&mut self, id: NodeId) -> &mut TreeNode {
        &mut self.nodes[id]
    }
}

impl Tree {
    /// Start a tree from its root and queue the root for splitting
    pub fn new(root: TreeNode) -> Self {
        Self {
            nodes: vec![root],
            root: 0,
            alive: VecDeque::from([0]),
            pending: Vec::new(),
        }
    }

    /// Rebuild a finished tree from stored nodes
    pub fn from_nodes(nodes: Vec<TreeNode>, root: NodeId) -> Self {
        Self {
            nodes,
            root,
            alive: VecDeque::new(),
            pending: Vec::new(),
        }
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn nodes(&self) -> &[TreeNode] {
        &self.nodes
    }

    pub fn get(&self, id: NodeId) -> Option<&TreeNode> {
        self.nodes.get(id)
    }

    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut TreeNode> {
        self.nodes.get_mut(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn pop_alive(&mut self) -> Option<NodeId> {
        self.alive.pop_front()
    }

    pub fn push_alive(&mut self, id: NodeId) {
        self.alive.push_back(id);
    }

    pub fn alive_is_empty(&self) -> bool {
        self.alive.is_empty()
    }

    pub fn take_pending(&mut self) -> Vec<NodeId> {
        std::mem::take(&mut self.pending)
    }

    /// Split a node into children; `left` must be sorted and a subset of its instance space
    ///
    /// Returns (left, right) ids. Children are queued as pending.
    pub fn split_node(
        &mut self,
        id: NodeId,
        left: Vec<SampleId>,
        left_grad: f64,
        left_hess: f64,
    ) -> (NodeId, NodeId) {
        let parent = &self.nodes[id];
        let right: Vec<SampleId> = parent
            .instance_space
            .iter()
            .copied()
            .filter(|s| left.binary_search(s).is_err())
            .collect();

        let left_node = TreeNode::new(
            3 * parent.index - 1,
            parent.depth + 1,
            parent.feature_dim,
            left,
            left_grad,
            left_hess,
        );
        let right_node = TreeNode::new(
            3 * parent.index + 1,
            parent.depth + 1,
            parent.feature_dim,
            right,
            parent.grad - left_grad,
            parent.hess - left_hess,
        );

        let left_id = self.nodes.len();
        let right_id = left_id + 1;
        self.nodes.push(left_node);
        self.nodes.push(right_node);

        let parent = &mut self.nodes[id];
        parent.left = Some(left_id);
        parent.right = Some(right_id);
        parent.is_leaf = false;

        self.pending.push(left_id);
        self.pending.push(right_id);
        (left_id, right_id)
    }

    /// Collapse a node into a leaf with its closed-form score
    pub fn make_leaf(&mut self, id: NodeId, lambda: f64) {
        let node = &mut self.nodes[id];
        node.is_leaf = true;
        node.leaf_score = leaf_score(node.grad, node.hess, lambda);
        node.left = None;
        node.right = None;
    }

    /// Bottom-up pruning: a node whose children are both leaves and whose gain
    /// is not positive becomes a leaf, and its samples are routed back to it
    pub fn post_prune(&mut self, id: NodeId, lambda: f64, assignment: &mut [NodeId]) {
        let (left, right) = match (&self.nodes[id].left, &self.nodes[id].right) {
            (Some(l), Some(r)) if !self.nodes[id].is_leaf => (*l, *r),
            _ => return,
        };

        self.post_prune(left, lambda, assignment);
        self.post_prune(right, lambda, assignment);

        if self.nodes[left].is_leaf && self.nodes[right].is_leaf && self.nodes[id].gain <= 0.0 {
            for &sample in &self.nodes[id].instance_space {
                if let Some(slot) = assignment.get_mut(sample) {
                    *slot = id;
                }
            }
            self.make_leaf(id, lambda);
        }
    }

    /// Deepest node depth
    pub fn depth(&self) -> usize {
        self.nodes.iter().map(|n| n.depth).max().unwrap_or(0)
    }

    /// Leaves reachable from the root
    pub fn leaves(&self) -> Vec<NodeId> {
        let mut leaves = Vec::new();
        let mut stack = vec![self.root];
        while let Some(id) = stack.pop() {
            let node = &self.nodes[id];
            match (node.is_leaf, node.left, node.right) {
                (false, Some(l), Some(r)) => {
                    stack.push(r);
                    stack.push(l);
                }
                _ => leaves.push(id),
            }
        }
        leaves
    }

    /// Copy without per-node instance spaces, as stored in a trained model
    pub fn without_instances(&self) -> Self {
        let nodes = self
            .nodes
            .iter()
            .map(|n| TreeNode {
                instance_space: Vec::new(),
                ..n.clone()
            })
            .collect();
        Self::from_nodes(nodes, self.root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn root(n: usize, g: f64, h: f64) -> TreeNode {
        TreeNode::new(1, 1, 2, (0..n).collect(), g, h)
    }

    #[test]
    fn test_split_gain() {
        // Perfect separation beats the no-split baseline of 0
        let gain = split_gain(-2.0, 1.0, 0.0, 2.0, 1.0, 0.0);
        assert!((gain - 2.0).abs() < 1e-12);

        let gain = split_gain(0.0, 1.0, 0.0, 2.0, 1.0, 0.5);
        assert!((gain + 0.5).abs() < 1e-12);
        assert_eq!(leaf_score(2.0, 3.0, 1.0), -0.5);
    }

    #[test]
    fn test_empty_side_without_regularization_stays_finite() {
        // Every sample went left; the right child holds nothing
        assert_eq!(leaf_score(0.0, 0.0, 0.0), 0.0);
        assert_eq!(leaf_score(-1.0, 2.0, 0.0), 0.5);

        let gain = split_gain(1.5, 2.0, 1.5, 2.0, 0.0, 0.0);
        assert!(gain.is_finite());
        assert_eq!(gain, 0.0);
    }

    #[test]
    fn test_finish_empty_leaf_without_regularization() {
        let mut tree = Tree::new(root(3, 1.5, 2.0));
        let root_id = tree.pop_alive().unwrap();
        let (l, r) = tree.split_node(root_id, vec![0, 1, 2], 1.5, 2.0);
        tree.make_leaf(l, 0.0);
        tree.make_leaf(r, 0.0);

        assert!(tree[r].instance_space.is_empty());
        assert_eq!(tree[r].leaf_score, 0.0);
        assert_eq!(tree[l].leaf_score, -0.75);
    }

    #[test]
    fn test_split_node_partitions_instances() {
        let mut tree = Tree::new(root(5, 1.0, 5.0));
        let root_id = tree.pop_alive().unwrap();
        let (l, r) = tree.split_node(root_id, vec![1, 3], 0.4, 2.0);

        assert_eq!(tree[l].index, 2);
        assert_eq!(tree[r].index, 4);
        assert_eq!(tree[l].depth, 2);
        assert_eq!(tree[l].instance_space, vec![1, 3]);
        assert_eq!(tree[r].instance_space, vec![0, 2, 4]);
        assert_eq!(tree[r].num_sample, 3);
        assert!((tree[r].grad - 0.6).abs() < 1e-12);
        assert!((tree[r].hess - 3.0).abs() < 1e-12);
        assert_eq!(tree.take_pending(), vec![l, r]);
        assert!(tree.alive_is_empty());
    }

    #[test]
    fn test_leaf_condition() {
        let condition = LeafCondition {
            max_depth: 3,
            min_child_weight: 1.0,
            min_sample_split: 2,
        };
        let mut node = TreeNode::new(1, 1, 1, vec![0, 1, 2], 0.0, 3.0);
        assert!(!condition.is_leaf(&node));
        node.depth = 3;
        assert!(condition.is_leaf(&node));

        let node = TreeNode::new(1, 1, 1, vec![0, 1, 2], 0.0, 0.5);
        assert!(condition.is_leaf(&node));

        let node = TreeNode::new(1, 1, 1, vec![0, 1], 0.0, 3.0);
        assert!(condition.is_leaf(&node));
    }

    #[test]
    fn test_post_prune_collapses_non_positive_gain() {
        let mut tree = Tree::new(root(4, 2.0, 4.0));
        let root_id = tree.pop_alive().unwrap();
        tree[root_id].gain = -0.1;
        tree[root_id].client = Some("party-a".to_string());
        let (l, r) = tree.split_node(root_id, vec![0, 1], 1.0, 2.0);
        tree.make_leaf(l, 1.0);
        tree.make_leaf(r, 1.0);

        let mut assignment = vec![l, l, r, r];
        tree.post_prune(root_id, 1.0, &mut assignment);

        let node = &tree[root_id];
        assert!(node.is_leaf);
        assert!((node.leaf_score - (-2.0 / 5.0)).abs() < 1e-12);
        assert_eq!(node.depth, 1);
        assert_eq!(node.client.as_deref(), Some("party-a"));
        assert_eq!(assignment, vec![root_id; 4]);
        assert_eq!(tree.leaves(), vec![root_id]);
    }

    #[test]
    fn test_post_prune_keeps_positive_gain() {
        let mut tree = Tree::new(root(4, 2.0, 4.0));
        let root_id = tree.pop_alive().unwrap();
        tree[root_id].gain = 0.3;
        let (l, r) = tree.split_node(root_id, vec![0, 1], 1.0, 2.0);
        tree.make_leaf(l, 1.0);
        tree.make_leaf(r, 1.0);

        let mut assignment = vec![l, l, r, r];
        tree.post_prune(root_id, 1.0, &mut assignment);

        assert!(!tree[root_id].is_leaf);
        assert_eq!(assignment, vec![l, l, r, r]);
        assert_eq!(tree.leaves(), vec![l, r]);
        assert_eq!(tree.depth(), 2);
    }
}
