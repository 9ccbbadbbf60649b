use ndarray::{ArrayView2, Axis, Zip};

/// Fraction of predictions equal to the truth.
pub fn accuracy_score<L: PartialEq>(y_true: &[L], y_pred: &[L]) -> f64 {
    if y_true.is_empty() {
        return 0.0;
    }
    let correct = y_true.iter().zip(y_pred).filter(|(t, p)| t == p).count();
    correct as f64 / y_true.len() as f64
}

/// Coefficient of determination, averaged uniformly over outputs.
///
/// An output with constant truth scores 1 when predicted exactly and 0
/// otherwise.
pub fn r2_score(y_true: ArrayView2<f64>, y_pred: ArrayView2<f64>) -> f64 {
    let n_outputs = y_true.ncols();
    if n_outputs == 0 || y_true.nrows() == 0 {
        return 0.0;
    }

    let total: f64 = y_true
        .axis_iter(Axis(1))
        .zip(y_pred.axis_iter(Axis(1)))
        .map(|(truth, prediction)| {
            let mean = truth.sum() / truth.len() as f64;
            let mut residual = 0.0;
            let mut spread = 0.0;
            Zip::from(&truth).and(&prediction).for_each(|&t, &p| {
                residual += (t - p) * (t - p);
                spread += (t - mean) * (t - mean);
            });

            if spread > 0.0 {
                1.0 - residual / spread
            } else if residual > 0.0 {
                0.0
            } else {
                1.0
            }
        })
        .sum();

    total / n_outputs as f64
}
