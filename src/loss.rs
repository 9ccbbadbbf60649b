use ndarray::{Array1, Array2, ArrayView2, Axis, Zip};
use serde::{Deserialize, Serialize};

const PROBABILITY_CLIP: f64 = 1e-10;

/// Data term of the training objective. Each kind is paired with the
/// output activation for which the output delta reduces to `p - y`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LossKind {
    /// Half mean squared error, identity output.
    Squared,
    /// Cross-entropy, softmax output.
    Log,
    /// Binary cross-entropy, logistic output.
    BinaryLog,
}

impl LossKind {
    pub fn evaluate(self, y_true: ArrayView2<f64>, y_prob: ArrayView2<f64>) -> f64 {
        match self {
            Self::Squared => squared_loss(y_true, y_prob),
            Self::Log => log_loss(y_true, y_prob),
            Self::BinaryLog => binary_log_loss(y_true, y_prob),
        }
    }
}

fn n_rows(y: &ArrayView2<f64>) -> f64 {
    y.nrows().max(1) as f64
}

fn clip(p: f64) -> f64 {
    p.clamp(PROBABILITY_CLIP, 1.0 - PROBABILITY_CLIP)
}

/// `Σ (y - p)² / (2 n)`
pub fn squared_loss(y_true: ArrayView2<f64>, y_pred: ArrayView2<f64>) -> f64 {
    let mut total = 0.0;
    Zip::from(&y_true)
        .and(&y_pred)
        .for_each(|&y, &p| total += (y - p) * (y - p));
    total / (2.0 * n_rows(&y_true))
}

/// Cross-entropy of a softmax output. A single column is scored as a
/// binary problem.
pub fn log_loss(y_true: ArrayView2<f64>, y_prob: ArrayView2<f64>) -> f64 {
    if y_prob.ncols() == 1 {
        return binary_log_loss(y_true, y_prob);
    }

    let mut total = 0.0;
    Zip::from(&y_true)
        .and(&y_prob)
        .for_each(|&y, &p| total -= y * clip(p).ln());
    total / n_rows(&y_true)
}

pub fn binary_log_loss(y_true: ArrayView2<f64>, y_prob: ArrayView2<f64>) -> f64 {
    let mut total = 0.0;
    Zip::from(&y_true).and(&y_prob).for_each(|&y, &p| {
        let p = clip(p);
        total -= y * p.ln() + (1.0 - y) * (1.0 - p).ln();
    });
    total / n_rows(&y_true)
}

/// Row-wise `ln Σ exp(x)`.
pub fn log_sum_exp(values: &Array2<f64>) -> Array1<f64> {
    values.map_axis(Axis(1), |row| {
        let max = row.fold(f64::NEG_INFINITY, |acc, &v| acc.max(v));
        if max.is_infinite() {
            return max;
        }
        max + row.iter().map(|v| (v - max).exp()).sum::<f64>().ln()
    })
}
