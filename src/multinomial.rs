//! Multinomial logistic regression fitted with L-BFGS.

use std::fmt::Debug;

use nalgebra::DVector;
use ndarray::{concatenate, s, Array1, Array2, ArrayView2, Axis};
use serde::{Deserialize, Serialize};

use crate::activation::{logistic, softmax};
use crate::error::{MlpError, Result};
use crate::estimator::check_inputs;
use crate::label::LabelBinarizer;
use crate::lbfgs::{self, LbfgsOptions};
use crate::loss::log_sum_exp;
use crate::metrics::accuracy_score;

/// Per-class rescaling of the loss.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClassWeight {
    #[default]
    Uniform,
    /// `n_samples / (n_classes * count(class))`
    Balanced,
    /// One weight per class, in sorted class order.
    Explicit(Vec<f64>),
}

/// Logistic regression minimising the cross-entropy over the full class
/// distribution `P(y = k | x)`, rather than one binary problem per class.
///
/// The objective is `-C Σ y ln softmax(x Wᵀ + b) + ½ ||W||²` with
/// `C = 1 / alpha`. The intercept is not penalised.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultinomialLr<L> {
    pub alpha: f64,
    pub fit_intercept: bool,
    pub class_weight: ClassWeight,
    pub lbfgs: LbfgsSettings,
    fitted: Option<Fitted<L>>,
}

/// Serializable subset of [`LbfgsOptions`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LbfgsSettings {
    pub max_iter: usize,
    pub max_fun: usize,
    pub gtol: f64,
}

impl Default for LbfgsSettings {
    fn default() -> Self {
        let options = LbfgsOptions::default();
        Self {
            max_iter: options.max_iter,
            max_fun: options.max_fun,
            gtol: options.gtol,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Fitted<L> {
    binarizer: LabelBinarizer<L>,
    class_weight: Vec<f64>,
    coef: Array2<f64>,
    intercept: Array1<f64>,
    n_iter: usize,
    loss: f64,
}

impl<L> Default for MultinomialLr<L> {
    fn default() -> Self {
        Self {
            alpha: 1e-4,
            fit_intercept: true,
            class_weight: ClassWeight::Uniform,
            lbfgs: LbfgsSettings::default(),
            fitted: None,
        }
    }
}

/// Objective and gradient over the flattened `(k, d [+ 1])` weight matrix.
fn loss_grad(
    w: &DVector<f64>,
    x: ArrayView2<f64>,
    y: ArrayView2<f64>,
    c: f64,
    fit_intercept: bool,
) -> Result<(f64, DVector<f64>)> {
    let n_classes = y.ncols();
    let n_features = x.ncols();
    let width = n_features + usize::from(fit_intercept);

    let weights = Array2::from_shape_vec((n_classes, width), w.iter().copied().collect())
        .map_err(|err| MlpError::invalid("weights", err.to_string()))?;
    let coef = weights.slice(s![.., ..n_features]);
    let intercept = if fit_intercept {
        weights.column(n_features).to_owned()
    } else {
        Array1::zeros(n_classes)
    };

    let mut log_p = x.dot(&coef.t());
    log_p += &intercept;
    let lse = log_sum_exp(&log_p);
    log_p -= &lse.insert_axis(Axis(1));

    let squared_norm = w.norm_squared() - intercept.dot(&intercept);
    let loss = -c * (&y * &log_p).sum() + 0.5 * squared_norm;

    // Rows of a class-weighted `y` sum to the sample's weight, not 1.
    let row_weights = y.sum_axis(Axis(1)).insert_axis(Axis(1));
    let diff = log_p.mapv(f64::exp) * &row_weights - y;
    let mut grad = diff.t().dot(&x) * c + coef;
    if fit_intercept {
        let intercept_grad = diff.sum_axis(Axis(0)) * c;
        grad = concatenate![Axis(1), grad, intercept_grad.insert_axis(Axis(1))];
    }

    Ok((loss, DVector::from_iterator(grad.len(), grad.iter().copied())))
}

impl<L: Ord + Clone + Debug> MultinomialLr<L> {
    pub fn new(alpha: f64) -> Self {
        Self {
            alpha,
            ..Self::default()
        }
    }

    fn class_weights(&self, encoded: &Array2<f64>) -> Result<Vec<f64>> {
        let n_classes = encoded.ncols();
        match &self.class_weight {
            ClassWeight::Uniform => Ok(vec![1.0; n_classes]),
            ClassWeight::Balanced => {
                let counts = encoded.sum_axis(Axis(0));
                let n_samples = encoded.nrows() as f64;
                Ok(counts
                    .iter()
                    .map(|&count| n_samples / (n_classes as f64 * count))
                    .collect())
            }
            ClassWeight::Explicit(weights) if weights.len() == n_classes => Ok(weights.clone()),
            ClassWeight::Explicit(weights) => Err(MlpError::invalid(
                "class_weight",
                format!("expected {n_classes} weights, got {}", weights.len()),
            )),
        }
    }

    pub fn fit(&mut self, x: ArrayView2<f64>, y: &[L]) -> Result<&mut Self> {
        check_inputs(&x, y.len())?;
        if !(self.alpha.is_finite() && self.alpha > 0.0) {
            return Err(MlpError::invalid(
                "alpha",
                format!("penalty term must be positive; got alpha={}", self.alpha),
            ));
        }

        let binarizer = LabelBinarizer::fit(y)?;
        let mut encoded = binarizer.transform(y)?;
        if encoded.ncols() == 1 {
            let positive = encoded.column(0).to_owned();
            encoded = concatenate![
                Axis(1),
                positive.mapv(|v| 1.0 - v).insert_axis(Axis(1)),
                positive.insert_axis(Axis(1))
            ];
        }

        let class_weight = self.class_weights(&encoded)?;
        if self.class_weight != ClassWeight::Uniform {
            let total: f64 = class_weight.iter().sum();
            let scale = Array1::from_iter(class_weight.iter().map(|w| w / total));
            encoded *= &scale;
        }

        let n_classes = encoded.ncols();
        let n_features = x.ncols();
        let width = n_features + usize::from(self.fit_intercept);
        let c = 1.0 / self.alpha;
        let fit_intercept = self.fit_intercept;

        let options = LbfgsOptions {
            max_iter: self.lbfgs.max_iter,
            max_fun: self.lbfgs.max_fun,
            gtol: self.lbfgs.gtol,
            ..LbfgsOptions::default()
        };
        let outcome = lbfgs::minimize(
            |w| loss_grad(w, x, encoded.view(), c, fit_intercept),
            DVector::zeros(n_classes * width),
            &options,
        )?;
        if !outcome.termination.converged() {
            tracing::warn!(
                "multinomial logistic regression did not converge: {}",
                outcome.termination.describe()
            );
        }

        let weights = Array2::from_shape_vec((n_classes, width), outcome.x.iter().copied().collect())
            .map_err(|err| MlpError::invalid("weights", err.to_string()))?;
        let mut coef = weights.slice(s![.., ..n_features]).to_owned();
        let mut intercept = if fit_intercept {
            weights.column(n_features).to_owned()
        } else {
            Array1::zeros(n_classes)
        };

        if binarizer.n_classes() == 2 {
            // Log-odds of the positive class against the negative one.
            coef = (&coef.row(1) - &coef.row(0)).insert_axis(Axis(0));
            intercept = Array1::from_elem(1, intercept[1] - intercept[0]);
        }

        self.fitted = Some(Fitted {
            binarizer,
            class_weight,
            coef,
            intercept,
            n_iter: outcome.iterations,
            loss: outcome.f,
        });
        Ok(self)
    }

    fn fitted(&self) -> Result<&Fitted<L>> {
        self.fitted.as_ref().ok_or(MlpError::NotFitted)
    }

    pub fn classes(&self) -> Option<&[L]> {
        self.fitted.as_ref().map(|fitted| fitted.binarizer.classes())
    }

    /// `(n_classes, n_features)`, or a single row of log-odds for binary
    /// problems.
    pub fn coef(&self) -> Result<&Array2<f64>> {
        Ok(&self.fitted()?.coef)
    }

    pub fn intercept(&self) -> Result<&Array1<f64>> {
        Ok(&self.fitted()?.intercept)
    }

    pub fn class_weight(&self) -> Result<&[f64]> {
        Ok(&self.fitted()?.class_weight)
    }

    pub fn n_iter(&self) -> Result<usize> {
        Ok(self.fitted()?.n_iter)
    }

    pub fn loss(&self) -> Result<f64> {
        Ok(self.fitted()?.loss)
    }

    pub fn decision_function(&self, x: ArrayView2<f64>) -> Result<Array2<f64>> {
        let fitted = self.fitted()?;
        if x.ncols() != fitted.coef.ncols() {
            return Err(MlpError::FeatureMismatch {
                expected: fitted.coef.ncols(),
                got: x.ncols(),
            });
        }
        let mut scores = x.dot(&fitted.coef.t());
        scores += &fitted.intercept;
        Ok(scores)
    }

    /// Probabilities ordered like [`MultinomialLr::classes`].
    pub fn predict_proba(&self, x: ArrayView2<f64>) -> Result<Array2<f64>> {
        let mut scores = self.decision_function(x)?;
        if scores.ncols() > 1 {
            softmax(&mut scores);
            return Ok(scores);
        }

        let positive = scores.column(0).mapv(logistic);
        Ok(concatenate![
            Axis(1),
            positive.mapv(|p| 1.0 - p).insert_axis(Axis(1)),
            positive.insert_axis(Axis(1))
        ])
    }

    pub fn predict_log_proba(&self, x: ArrayView2<f64>) -> Result<Array2<f64>> {
        Ok(self.predict_proba(x)?.mapv(f64::ln))
    }

    pub fn predict(&self, x: ArrayView2<f64>) -> Result<Vec<L>> {
        let fitted = self.fitted()?;
        let scores = self.decision_function(x)?;
        Ok(fitted.binarizer.inverse_transform(scores.view(), 0.0))
    }

    pub fn score(&self, x: ArrayView2<f64>, y: &[L]) -> Result<f64> {
        check_inputs(&x, y.len())?;
        Ok(accuracy_score(y, &self.predict(x)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn loss_gradient_matches_finite_differences() {
        let x = array![[0.5, -1.0], [1.5, 0.2], [-0.3, 0.8]];
        let y = array![[1.0, 0.0, 0.0], [0.0, 0.0, 1.0], [0.0, 1.0, 0.0]];
        let w = DVector::from_vec(vec![0.1, -0.2, 0.3, 0.0, 0.4, -0.1, 0.2, 0.1, -0.3]);

        let (_, analytic) = loss_grad(&w, x.view(), y.view(), 2.0, true).unwrap();
        let step = 1e-6;
        for i in 0..w.len() {
            let mut plus = w.clone();
            plus[i] += step;
            let mut minus = w.clone();
            minus[i] -= step;
            let (f_plus, _) = loss_grad(&plus, x.view(), y.view(), 2.0, true).unwrap();
            let (f_minus, _) = loss_grad(&minus, x.view(), y.view(), 2.0, true).unwrap();
            assert_abs_diff_eq!(analytic[i], (f_plus - f_minus) / (2.0 * step), epsilon = 1e-6);
        }
    }

    #[test]
    fn loss_gradient_matches_finite_differences_with_weighted_targets() {
        let x = array![[0.5, -1.0], [1.5, 0.2], [-0.3, 0.8], [0.9, 0.4]];
        // One-hot rows scaled by normalised class weights 0.2, 0.5, 0.3.
        let y = array![[0.2, 0.0, 0.0], [0.0, 0.0, 0.3], [0.0, 0.5, 0.0], [0.2, 0.0, 0.0]];
        let w = DVector::from_vec(vec![0.3, -0.1, 0.2, -0.4, 0.1, 0.5, 0.0, 0.2, -0.2]);

        let (_, analytic) = loss_grad(&w, x.view(), y.view(), 3.0, true).unwrap();
        let step = 1e-6;
        for i in 0..w.len() {
            let mut plus = w.clone();
            plus[i] += step;
            let mut minus = w.clone();
            minus[i] -= step;
            let (f_plus, _) = loss_grad(&plus, x.view(), y.view(), 3.0, true).unwrap();
            let (f_minus, _) = loss_grad(&minus, x.view(), y.view(), 3.0, true).unwrap();
            assert_abs_diff_eq!(analytic[i], (f_plus - f_minus) / (2.0 * step), epsilon = 1e-6);
        }
    }

    #[test]
    fn explicit_weights_still_fit_separable_data() {
        let x = array![[0.0], [0.2], [0.4], [3.0], [3.2], [3.4]];
        let y = [0, 0, 0, 1, 1, 1];
        let mut model = MultinomialLr::new(1e-2);
        model.class_weight = ClassWeight::Explicit(vec![1.0, 4.0]);
        model.fit(x.view(), &y).unwrap();

        assert_abs_diff_eq!(model.score(x.view(), &y).unwrap(), 1.0);
        let proba = model.predict_proba(array![[0.1], [3.3]].view()).unwrap();
        assert!(proba[[0, 0]] > 0.9);
        assert!(proba[[1, 1]] > 0.9);
    }

    #[test]
    fn separates_three_clusters() {
        let x = array![
            [0.0, 0.0], [0.2, 0.1], [0.1, 0.3],
            [5.0, 5.0], [5.2, 4.9], [4.8, 5.1],
            [0.0, 5.0], [0.3, 5.2], [-0.2, 4.8]
        ];
        let y = ["a", "a", "a", "b", "b", "b", "c", "c", "c"];
        let mut model = MultinomialLr::new(1e-2);
        model.fit(x.view(), &y).unwrap();

        assert_eq!(model.predict(x.view()).unwrap(), y.to_vec());
        assert_eq!(model.coef().unwrap().dim(), (3, 2));
        let proba = model.predict_proba(x.view()).unwrap();
        for row in proba.rows() {
            assert_abs_diff_eq!(row.sum(), 1.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn binary_problem_keeps_one_row_of_log_odds() {
        let x = array![[-2.0], [-1.0], [-0.5], [0.5], [1.0], [2.0]];
        let y = [0, 0, 0, 1, 1, 1];
        let mut model = MultinomialLr::new(1.0);
        model.fit(x.view(), &y).unwrap();

        assert_eq!(model.coef().unwrap().dim(), (1, 1));
        assert!(model.coef().unwrap()[[0, 0]] > 0.0);
        assert_abs_diff_eq!(model.score(x.view(), &y).unwrap(), 1.0);

        let proba = model.predict_proba(array![[3.0]].view()).unwrap();
        assert!(proba[[0, 1]] > 0.5);
    }

    #[test]
    fn balanced_weights_follow_class_frequencies() {
        let x = array![[0.0], [0.1], [0.2], [3.0]];
        let y = [0, 0, 0, 1];
        let mut model = MultinomialLr::new(1.0);
        model.class_weight = ClassWeight::Balanced;
        model.fit(x.view(), &y).unwrap();

        let weights = model.class_weight().unwrap();
        assert_abs_diff_eq!(weights[0], 4.0 / 6.0);
        assert_abs_diff_eq!(weights[1], 2.0);
    }

    #[test]
    fn rejects_bad_configuration() {
        let x = array![[0.0], [1.0]];
        let mut model = MultinomialLr::new(0.0);
        assert!(matches!(
            model.fit(x.view(), &[0, 1]),
            Err(MlpError::InvalidParameter { name: "alpha", .. })
        ));

        let mut model = MultinomialLr::new(1.0);
        model.class_weight = ClassWeight::Explicit(vec![1.0]);
        assert!(model.fit(x.view(), &[0, 1]).is_err());
    }
}
