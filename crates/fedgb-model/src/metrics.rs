//! Training metrics evaluated after every boosting round
//!
//! Predictions are already in output space: probabilities for logistic and
//! softmax losses, raw values for regression.

use fedgb_core::MetricType;
use std::collections::BTreeMap;

/// Evaluate metrics for `pred[class][sample]` against labels
///
/// Multi-class labels are class indices.
pub fn calculate_metrics(metrics: &[MetricType], pred: &[Vec<f64>], label: &[f64]) -> BTreeMap<MetricType, f64> {
    let score = pred.first().map(Vec::as_slice).unwrap_or(&[]);
    metrics
        .iter()
        .map(|metric| {
            let value = match metric {
                MetricType::Rmse => mse(score, label).sqrt(),
                MetricType::Mse => mse(score, label),
                MetricType::Mae => mean(score.iter().zip(label).map(|(p, y)| (p - y).abs())),
                MetricType::Mape => mean(
                    score
                        .iter()
                        .zip(label)
                        .filter(|(_, y)| **y != 0.0)
                        .map(|(p, y)| ((y - p) / y).abs()),
                ),
                MetricType::Maape => mean(
                    score
                        .iter()
                        .zip(label)
                        .filter(|(_, y)| **y != 0.0)
                        .map(|(p, y)| ((y - p) / y).abs().atan()),
                ),
                MetricType::Acc => accuracy(&classes(pred), label),
                MetricType::Error => 1.0 - accuracy(&classes(pred), label),
                MetricType::Auc => auc(score, label),
                MetricType::F1 => {
                    let (precision, recall) = precision_recall(score, label);
                    if precision + recall == 0.0 {
                        0.0
                    } else {
                        2.0 * precision * recall / (precision + recall)
                    }
                }
                MetricType::Recall => precision_recall(score, label).1,
                MetricType::Precision => precision_recall(score, label).0,
                MetricType::Macc => accuracy(&classes(pred), label),
                MetricType::Merror => 1.0 - accuracy(&classes(pred), label),
            };
            (*metric, value)
        })
        .collect()
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, count) = values.fold((0.0, 0usize), |(s, c), v| (s + v, c + 1));
    if count == 0 {
        0.0
    } else {
        sum / count as f64
    }
}

fn mse(score: &[f64], label: &[f64]) -> f64 {
    mean(score.iter().zip(label).map(|(p, y)| (p - y) * (p - y)))
}

/// Predicted class per sample: threshold 0.5 for one output, argmax otherwise
fn classes(pred: &[Vec<f64>]) -> Vec<f64> {
    match pred {
        [] => Vec::new(),
        [score] => score.iter().map(|p| if *p >= 0.5 { 1.0 } else { 0.0 }).collect(),
        rows => (0..rows[0].len())
            .map(|i| {
                let mut best = 0;
                for k in 1..rows.len() {
                    if rows[k][i] > rows[best][i] {
                        best = k;
                    }
                }
                best as f64
            })
            .collect(),
    }
}

fn accuracy(predicted: &[f64], label: &[f64]) -> f64 {
    mean(predicted.iter().zip(label).map(|(p, y)| f64::from(u8::from(p == y))))
}

fn precision_recall(score: &[f64], label: &[f64]) -> (f64, f64) {
    let (mut tp, mut fp, mut fn_) = (0.0, 0.0, 0.0);
    for (p, y) in score.iter().zip(label) {
        match (*p >= 0.5, *y == 1.0) {
            (true, true) => tp += 1.0,
            (true, false) => fp += 1.0,
            (false, true) => fn_ += 1.0,
            (false, false) => {}
        }
    }
    let precision = if tp + fp == 0.0 { 0.0 } else { tp / (tp + fp) };
    let recall = if tp + fn_ == 0.0 { 0.0 } else { tp / (tp + fn_) };
    (precision, recall)
}

/// Rank-based AUC with average ranks for tied scores
fn auc(score: &[f64], label: &[f64]) -> f64 {
    let mut order: Vec<usize> = (0..score.len().min(label.len())).collect();
    order.sort_by(|a, b| score[*a].total_cmp(&score[*b]));

    let mut ranks = vec![0.0; order.len()];
    let mut start = 0;
    while start < order.len() {
        let mut end = start + 1;
        while end < order.len() && score[order[end]] == score[order[start]] {
            end += 1;
        }
        // ranks are 1-based; ties share the mean of their positions
        let rank = (start + end + 1) as f64 / 2.0;
        for &i in &order[start..end] {
            ranks[i] = rank;
        }
        start = end;
    }

    let positives = label.iter().take(ranks.len()).filter(|y| **y == 1.0).count() as f64;
    let negatives = ranks.len() as f64 - positives;
    if positives == 0.0 || negatives == 0.0 {
        return 0.5;
    }
    let rank_sum: f64 = ranks
        .iter()
        .zip(label)
        .filter(|(_, y)| **y == 1.0)
        .map(|(r, _)| r)
        .sum();
    (rank_sum - positives * (positives + 1.0) / 2.0) / (positives * negatives)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval(metric: MetricType, pred: Vec<Vec<f64>>, label: &[f64]) -> f64 {
        calculate_metrics(&[metric], &pred, label)[&metric]
    }

    #[test]
    fn test_regression_metrics() {
        let pred = vec![vec![1.0, 2.0, 4.0]];
        let label = [1.0, 3.0, 2.0];
        assert!((eval(MetricType::Mse, pred.clone(), &label) - 5.0 / 3.0).abs() < 1e-12);
        assert!((eval(MetricType::Rmse, pred.clone(), &label) - (5.0f64 / 3.0).sqrt()).abs() < 1e-12);
        assert!((eval(MetricType::Mae, pred.clone(), &label) - 1.0).abs() < 1e-12);
        assert!((eval(MetricType::Mape, pred, &label) - (0.0 + 1.0 / 3.0 + 1.0) / 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_classification_metrics() {
        let pred = vec![vec![0.9, 0.2, 0.6, 0.4]];
        let label = [1.0, 0.0, 0.0, 1.0];
        assert_eq!(eval(MetricType::Acc, pred.clone(), &label), 0.5);
        assert_eq!(eval(MetricType::Error, pred.clone(), &label), 0.5);
        assert_eq!(eval(MetricType::Precision, pred.clone(), &label), 0.5);
        assert_eq!(eval(MetricType::Recall, pred.clone(), &label), 0.5);
        assert_eq!(eval(MetricType::F1, pred.clone(), &label), 0.5);
        assert_eq!(eval(MetricType::Auc, pred, &label), 0.75);
    }

    #[test]
    fn test_auc_handles_ties_and_degenerate_labels() {
        assert_eq!(eval(MetricType::Auc, vec![vec![0.5, 0.5]], &[1.0, 0.0]), 0.5);
        assert_eq!(eval(MetricType::Auc, vec![vec![0.1, 0.9]], &[1.0, 1.0]), 0.5);
        assert_eq!(eval(MetricType::Auc, vec![vec![0.1, 0.9]], &[0.0, 1.0]), 1.0);
    }

    #[test]
    fn test_multi_class_accuracy() {
        let pred = vec![vec![0.7, 0.1, 0.2], vec![0.2, 0.8, 0.3], vec![0.1, 0.1, 0.5]];
        let label = [0.0, 1.0, 1.0];
        assert!((eval(MetricType::Macc, pred.clone(), &label) - 2.0 / 3.0).abs() < 1e-12);
        assert!((eval(MetricType::Merror, pred, &label) - 1.0 / 3.0).abs() < 1e-12);
    }
}
