//! Loss functions: gradient, hessian and link transforms
//!
//! Predictions are stored raw (margin space) as `pred[class][sample]`.

use fedgb_core::{Error, ObjectiveType, Result};
use serde::{Deserialize, Serialize};

/// Lower bound on hessians so leaf weights stay finite
const MIN_HESSIAN: f64 = 1e-16;

/// Training loss selected by the objective
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Loss {
    /// Squared error, identity link
    Square,

    /// Binary log loss, sigmoid link
    Logistic,

    /// Squared error on log-labels, exp link
    PoissonLog,

    /// Softmax cross entropy over `num_class` outputs
    CrossEntropy { num_class: usize },
}

fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

/// Per-sample softmax across class rows
fn softmax(pred: &[Vec<f64>]) -> Vec<Vec<f64>> {
    let num_class = pred.len();
    let n = pred.first().map_or(0, Vec::len);
    let mut out = vec![vec![0.0; n]; num_class];
    for i in 0..n {
        let max = pred.iter().map(|row| row[i]).fold(f64::NEG_INFINITY, f64::max);
        let denom: f64 = pred.iter().map(|row| (row[i] - max).exp()).sum();
        for (k, row) in pred.iter().enumerate() {
            out[k][i] = (row[i] - max).exp() / denom;
        }
    }
    out
}

impl Loss {
    /// Loss used to train an objective
    pub fn for_objective(objective: ObjectiveType, num_class: usize) -> Self {
        match objective {
            ObjectiveType::RegSquare => Loss::Square,
            ObjectiveType::RegLogistic | ObjectiveType::BinaryLogistic => Loss::Logistic,
            ObjectiveType::CountPoisson => Loss::PoissonLog,
            ObjectiveType::MultiSoftmax | ObjectiveType::MultiSoftProb => {
                Loss::CrossEntropy { num_class }
            }
        }
    }

    pub fn num_class(&self) -> usize {
        match self {
            Loss::CrossEntropy { num_class } => *num_class,
            _ => 1,
        }
    }

    /// First-order derivative per class and sample
    pub fn grad(&self, pred: &[Vec<f64>], label: &[f64]) -> Vec<Vec<f64>> {
        match self {
            Loss::Square | Loss::PoissonLog => pred
                .iter()
                .map(|row| row.iter().zip(label).map(|(p, y)| p - y).collect())
                .collect(),
            Loss::Logistic => pred
                .iter()
                .map(|row| row.iter().zip(label).map(|(p, y)| sigmoid(*p) - y).collect())
                .collect(),
            Loss::CrossEntropy { .. } => softmax(pred)
                .into_iter()
                .enumerate()
                .map(|(k, row)| {
                    row.into_iter()
                        .zip(label)
                        .map(|(p, y)| if *y as usize == k { p - 1.0 } else { p })
                        .collect()
                })
                .collect(),
        }
    }

    /// Second-order derivative per class and sample
    pub fn hess(&self, pred: &[Vec<f64>], label: &[f64]) -> Vec<Vec<f64>> {
        match self {
            Loss::Square | Loss::PoissonLog => pred.iter().map(|_| vec![1.0; label.len()]).collect(),
            Loss::Logistic => pred
                .iter()
                .map(|row| {
                    row.iter()
                        .map(|p| {
                            let s = sigmoid(*p);
                            (s * (1.0 - s)).max(MIN_HESSIAN)
                        })
                        .collect()
                })
                .collect(),
            Loss::CrossEntropy { .. } => softmax(pred)
                .into_iter()
                .map(|row| row.into_iter().map(|p| (p * (1.0 - p)).max(MIN_HESSIAN)).collect())
                .collect(),
        }
    }

    /// Map raw margins to the output space
    pub fn transform(&self, pred: &[Vec<f64>]) -> Vec<Vec<f64>> {
        match self {
            Loss::CrossEntropy { .. } => softmax(pred),
            _ => pred
                .iter()
                .map(|row| row.iter().map(|p| self.transform_value(*p)).collect())
                .collect(),
        }
    }

    /// Link function for a single-output margin
    pub fn transform_value(&self, raw: f64) -> f64 {
        match self {
            Loss::Square => raw,
            Loss::Logistic => sigmoid(raw),
            Loss::PoissonLog | Loss::CrossEntropy { .. } => raw.exp(),
        }
    }

    /// Inverse link for a single output value
    pub fn inverse_transform_value(&self, value: f64) -> f64 {
        match self {
            Loss::Square => value,
            Loss::Logistic => (value / (1.0 - value)).ln(),
            Loss::PoissonLog | Loss::CrossEntropy { .. } => value.ln(),
        }
    }

    /// Stable identifier used by the model text format
    pub fn identifier(&self) -> String {
        match self {
            Loss::Square => "square".to_string(),
            Loss::Logistic => "logistic".to_string(),
            Loss::PoissonLog => "poisson_log".to_string(),
            Loss::CrossEntropy { num_class } => format!("cross_entropy:{num_class}"),
        }
    }

    pub fn from_identifier(s: &str) -> Result<Self> {
        match s {
            "square" => Ok(Loss::Square),
            "logistic" => Ok(Loss::Logistic),
            "poisson_log" => Ok(Loss::PoissonLog),
            other => other
                .strip_prefix("cross_entropy:")
                .and_then(|n| n.parse().ok())
                .map(|num_class| Loss::CrossEntropy { num_class })
                .ok_or_else(|| Error::UnsupportedObjective {
                    objective: other.to_string(),
                }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_close(a: f64, b: f64) {
        assert!((a - b).abs() < 1e-9, "{a} != {b}");
    }

    #[test]
    fn test_square_loss() {
        let loss = Loss::Square;
        let pred = vec![vec![0.5, 2.0]];
        assert_eq!(loss.grad(&pred, &[1.0, 1.0]), vec![vec![-0.5, 1.0]]);
        assert_eq!(loss.hess(&pred, &[1.0, 1.0]), vec![vec![1.0, 1.0]]);
        assert_eq!(loss.transform(&pred), pred);
    }

    #[test]
    fn test_logistic_loss() {
        let loss = Loss::Logistic;
        let pred = vec![vec![0.0]];
        assert_close(loss.grad(&pred, &[1.0])[0][0], -0.5);
        assert_close(loss.hess(&pred, &[1.0])[0][0], 0.25);
        assert_close(loss.transform_value(0.0), 0.5);
        assert_close(loss.inverse_transform_value(loss.transform_value(1.3)), 1.3);
    }

    #[test]
    fn test_poisson_transforms() {
        let loss = Loss::PoissonLog;
        assert_close(loss.transform_value(2f64.ln()), 2.0);
        assert_close(loss.inverse_transform_value(5.0), 5f64.ln());
    }

    #[test]
    fn test_cross_entropy() {
        let loss = Loss::CrossEntropy { num_class: 2 };
        let pred = vec![vec![0.0, 0.0], vec![0.0, 0.0]];
        let label = [0.0, 1.0];

        let grad = loss.grad(&pred, &label);
        assert_close(grad[0][0], -0.5);
        assert_close(grad[1][0], 0.5);
        assert_close(grad[0][1], 0.5);
        assert_close(grad[1][1], -0.5);

        let prob = loss.transform(&pred);
        assert_close(prob[0][0] + prob[1][0], 1.0);
        assert_eq!(loss.num_class(), 2);
    }

    #[test]
    fn test_identifier_round_trip() {
        for loss in [
            Loss::Square,
            Loss::Logistic,
            Loss::PoissonLog,
            Loss::CrossEntropy { num_class: 4 },
        ] {
            assert_eq!(Loss::from_identifier(&loss.identifier()).unwrap(), loss);
        }
        assert!(Loss::from_identifier("hinge").is_err());
    }

    #[test]
    fn test_for_objective() {
        assert_eq!(Loss::for_objective(ObjectiveType::RegLogistic, 1), Loss::Logistic);
        assert_eq!(
            Loss::for_objective(ObjectiveType::MultiSoftmax, 3),
            Loss::CrossEntropy { num_class: 3 }
        );
    }
}
