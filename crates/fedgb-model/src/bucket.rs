//! Feature bucketing and split-gain search
//!
//! A feature column restricted to a node is sorted ascending and grouped into
//! at most `num_bin` buckets. Bucket boundaries are the split candidates:
//! splitting after bucket `i` sends buckets `0..=i` left.

use crate::tree::split_gain;
use fedgb_core::SampleId;
use fedgb_crypto::EncryptionTool;
use itertools::Itertools;
use rayon::prelude::*;
use std::collections::HashMap;

/// Encrypted (gradient, hessian) per sample id
pub type GhCache<E> = HashMap<
    SampleId,
    (
        <E as EncryptionTool>::Ciphertext,
        <E as EncryptionTool>::Ciphertext,
    ),
>;

/// Histogram bin of one feature
#[derive(Debug, Clone, PartialEq)]
pub struct Bucket {
    pub ids: Vec<SampleId>,
    pub values: Vec<f64>,
    /// Largest value in the bin
    pub split_value: f64,
}

impl Bucket {
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// Sort a column (stable, ascending) and group it into buckets
///
/// With at most `num_bin` distinct values every distinct value gets its own
/// bucket. Otherwise the sorted samples are cut into `num_bin` contiguous
/// chunks whose sizes differ by at most one, larger chunks first.
pub fn sort_and_group(mut column: Vec<(SampleId, f64)>, num_bin: usize) -> Vec<Bucket> {
    if column.is_empty() || num_bin == 0 {
        return Vec::new();
    }
    column.sort_by(|a, b| a.1.total_cmp(&b.1));

    let distinct = column.iter().dedup_by(|a, b| a.1 == b.1).count();
    if distinct <= num_bin {
        let chunks = column.into_iter().chunk_by(|(_, v)| *v);
        let buckets: Vec<Bucket> = (&chunks)
            .into_iter()
            .map(|(value, chunk)| {
                let (ids, values) = chunk.unzip();
                Bucket {
                    ids,
                    values,
                    split_value: value,
                }
            })
            .collect();
        return buckets;
    }

    let n = column.len();
    let base = n / num_bin;
    let rem = n % num_bin;
    let mut samples = column.into_iter();
    (0..num_bin)
        .map(|i| {
            let size = base + usize::from(i < rem);
            let (ids, values): (Vec<_>, Vec<_>) = samples.by_ref().take(size).unzip();
            let split_value = values.last().copied().unwrap_or(f64::NAN);
            Bucket {
                ids,
                values,
                split_value,
            }
        })
        .collect()
}

/// Plaintext (g, h) sum of every bucket
pub fn process_each_numeric_feature(buckets: &[Bucket], grad: &[f64], hess: &[f64]) -> Vec<(f64, f64)> {
    buckets
        .iter()
        .map(|b| {
            b.ids.iter().fold((0.0, 0.0), |(g, h), &id| {
                (g + grad.get(id).copied().unwrap_or(0.0), h + hess.get(id).copied().unwrap_or(0.0))
            })
        })
        .collect()
}

/// Gain of every split candidate given per-bucket sums and node totals
///
/// Returns `(split index, gain)` for the first `len - 1` bucket boundaries;
/// splitting after the last bucket would leave the right side empty.
pub fn compute_gain(bucket_sums: &[(f64, f64)], g: f64, h: f64, lambda: f64, gamma: f64) -> Vec<(usize, f64)> {
    let boundaries = bucket_sums.len().saturating_sub(1);
    bucket_sums
        .iter()
        .take(boundaries)
        .scan((0.0, 0.0), |(gl, hl), (bg, bh)| {
            *gl += bg;
            *hl += bh;
            Some((*gl, *hl))
        })
        .enumerate()
        .map(|(i, (gl, hl))| (i, split_gain(gl, hl, g, h, lambda, gamma)))
        .collect()
}

/// First candidate with the largest gain
pub fn best_split(gains: &[(usize, f64)]) -> Option<(usize, f64)> {
    gains.iter().fold(None, |best, &(i, gain)| match best {
        Some((_, b)) if gain <= b => best,
        _ => Some((i, gain)),
    })
}

/// Homomorphic (g, h) sum over the ids present in the cache, None if none are
pub fn sum_present<E: EncryptionTool>(
    tool: &E,
    ids: &[SampleId],
    cache: &GhCache<E>,
    public_key: &E::PublicKey,
) -> Option<(E::Ciphertext, E::Ciphertext)> {
    let present: Vec<_> = ids.iter().filter_map(|id| cache.get(id)).collect();
    let g = tool.sum(present.iter().map(|(g, _)| g), public_key)?;
    let h = tool.sum(present.iter().map(|(_, h)| h), public_key)?;
    Some((g, h))
}

/// Encrypted (g, h) sum of every bucket
pub fn gh_sum<E: EncryptionTool>(
    tool: &E,
    buckets: &[Bucket],
    cache: &GhCache<E>,
    public_key: &E::PublicKey,
) -> Vec<Option<(E::Ciphertext, E::Ciphertext)>> {
    buckets
        .par_iter()
        .map(|b| sum_present(tool, &b.ids, cache, public_key))
        .collect()
}
