//! Shard-level operations of a party split by feature range
//!
//! Only one shard sees the full encrypted g/h of a new tree; each shard keeps
//! a contiguous slice and the others ask it for partial sums over the sample
//! ids they are missing.

use super::FederatedGbModel;
use crate::bucket::sum_present;
use crate::message::{GhSlice, P2Response, PartialSums, PendingInstances, SubModel};
use fedgb_core::{Error, Result, SampleId};
use fedgb_crypto::EncryptionTool;
use rayon::prelude::*;
use tracing::debug;

impl<E: EncryptionTool> FederatedGbModel<E> {
    /// Replace the gh cache with this shard's slice of a new tree's pairs
    pub fn load_gh_slice(&mut self, instance_space: &[SampleId], slice: &GhSlice) -> Result<()> {
        let ids = instance_space
            .get(slice.instance_min..slice.instance_max)
            .ok_or_else(|| {
                Error::internal(format!(
                    "slice {}..{} outside instance space of {}",
                    slice.instance_min,
                    slice.instance_max,
                    instance_space.len()
                ))
            })?;
        self.load_gh(ids, &slice.gh)?;
        debug!(
            shard = slice.shard,
            cached = self.gh_cache.len(),
            "Loaded encrypted g/h slice"
        );
        Ok(())
    }

    /// Encrypted sums over the pending ids this shard holds
    ///
    /// A bucket none of whose ids are cached here yields None.
    pub fn sub_calculation(&self, pending: &PendingInstances) -> Result<PartialSums> {
        let public_key = self
            .public_key
            .as_ref()
            .ok_or_else(|| Error::internal("public key not received"))?;
        Ok(pending
            .par_iter()
            .map(|(feature, lists)| {
                let sums = lists
                    .iter()
                    .map(|ids| {
                        sum_present(&self.tool, ids, &self.gh_cache, public_key)
                            .map(|(g, h)| self.cipher_pair(&g, &h))
                    })
                    .collect();
                (*feature, sums)
            })
            .collect())
    }

    /// Add the other shards' partial sums into this shard's phase 2 response
    ///
    /// Partial sums are only consulted for buckets with pending sample ids.
    pub fn merge_sub_result(&self, response: P2Response, partials: &[PartialSums]) -> Result<P2Response> {
        let public_key = self
            .public_key
            .as_ref()
            .ok_or_else(|| Error::internal("public key not received"))?;
        let features = match response.feature_gl {
            Some(features) => features,
            None => return Ok(P2Response::default()),
        };

        let merged = features
            .into_par_iter()
            .map(|mut feature| {
                for (bucket, slot) in feature.gh_left.iter_mut().enumerate() {
                    let mut acc = match slot.take() {
                        Some(pair) => Some(self.restore_pair(&pair)?),
                        None => None,
                    };
                    let pending = feature
                        .instance_list
                        .get(bucket)
                        .is_some_and(|ids| !ids.is_empty());
                    for partial in partials.iter().filter(|_| pending) {
                        let sums = partial.get(&feature.feature).ok_or_else(|| Error::MergeTypeError {
                            phase: 2,
                            message: format!("partial sums missing feature {}", feature.feature),
                        })?;
                        let entry = sums.get(bucket).ok_or_else(|| Error::MergeTypeError {
                            phase: 2,
                            message: format!(
                                "partial sums of feature {} missing bucket {bucket}",
                                feature.feature
                            ),
                        })?;
                        let Some(pair) = entry else {
                            continue;
                        };
                        let (g, h) = self.restore_pair(pair)?;
                        acc = Some(match acc {
                            Some((ag, ah)) => (
                                self.tool.add(&ag, &g, public_key),
                                self.tool.add(&ah, &h, public_key),
                            ),
                            None => (g, h),
                        });
                    }
                    let (g, h) = acc.ok_or(Error::SplitBucketCorruption {
                        feature: feature.feature,
                        bucket,
                    })?;
                    *slot = Some(self.cipher_pair(&g, &h));
                }
                feature.instance_list.clear();
                Ok(feature)
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(P2Response {
            feature_gl: Some(merged),
        })
    }

    /// Apply another shard's state delta
    pub fn apply_sub_model(&mut self, sub_model: &SubModel) -> Result<()> {
        match sub_model {
            SubModel::NodeOpened {
                public_key,
                tree,
                current_node,
                num_class_round,
                new_tree,
            } => {
                if let Some(pk) = public_key {
                    self.public_key = Some(self.tool.restore_public_key(pk)?);
                }
                if *new_tree || self.trees.is_empty() {
                    self.trees.push(tree.clone());
                } else if let Some(last) = self.trees.last_mut() {
                    *last = tree.clone();
                }
                self.current_node = Some(*current_node);
                self.num_class_round = *num_class_round;
            }
            SubModel::SplitChosen { best } => self.record_split(best.as_ref())?,
            SubModel::QueryTable(table) => self.query_table = table.clone(),
            SubModel::RoundUpdated {
                grad,
                hess,
                num_class_round,
                tree,
                metrics,
                ..
            } => {
                self.grad = grad.clone();
                self.hess = hess.clone();
                self.num_class_round = *num_class_round;
                self.metrics = metrics.clone();
                if let Some(last) = self.trees.last_mut() {
                    *last = tree.clone();
                } else {
                    self.trees.push(tree.clone());
                }
            }
        }
        Ok(())
    }

    /// Number of samples whose ciphertexts are cached
    pub fn cached_samples(&self) -> usize {
        self.gh_cache.len()
    }
}
