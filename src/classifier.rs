use std::fmt::Debug;

use ndarray::{s, Array2, ArrayView2};
use serde::{Deserialize, Serialize};

use crate::activation::Activation;
use crate::error::{MlpError, Result};
use crate::estimator::{self, OutputSpec, TrainingState, ValidationMetric};
use crate::label::LabelBinarizer;
use crate::loss::LossKind;
use crate::metrics::accuracy_score;
use crate::params::MlpParams;

/// Multilayer perceptron classifier trained on cross-entropy.
///
/// Two classes use a single logistic output unit; more classes use a softmax
/// output layer. Labels can be any ordered type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MlpClassifier<L> {
    params: MlpParams,
    binarizer: Option<LabelBinarizer<L>>,
    state: Option<TrainingState>,
}

impl<L> Default for MlpClassifier<L> {
    fn default() -> Self {
        Self::new(MlpParams::default())
    }
}

impl<L> MlpClassifier<L> {
    pub fn new(params: MlpParams) -> Self {
        Self {
            params,
            binarizer: None,
            state: None,
        }
    }

    pub fn params(&self) -> &MlpParams {
        &self.params
    }

    /// Changing parameters does not reset the fitted state; set
    /// `warm_start` to continue from it.
    pub fn params_mut(&mut self) -> &mut MlpParams {
        &mut self.params
    }

    pub fn is_fitted(&self) -> bool {
        self.state.is_some()
    }

    pub fn state(&self) -> Result<&TrainingState> {
        self.state.as_ref().ok_or(MlpError::NotFitted)
    }
}

impl<L: Ord + Clone + Debug> MlpClassifier<L> {
    pub fn classes(&self) -> Option<&[L]> {
        self.binarizer.as_ref().map(LabelBinarizer::classes)
    }

    fn output_spec(n_classes: usize) -> OutputSpec {
        if n_classes == 2 {
            OutputSpec {
                activation: Activation::Logistic,
                loss: LossKind::BinaryLog,
                metric: ValidationMetric::Accuracy,
            }
        } else {
            OutputSpec {
                activation: Activation::Softmax,
                loss: LossKind::Log,
                metric: ValidationMetric::Accuracy,
            }
        }
    }

    /// Trains on `x` (one sample per row) and the labels `y`.
    pub fn fit(&mut self, x: ArrayView2<f64>, y: &[L]) -> Result<&mut Self> {
        estimator::check_inputs(&x, y.len())?;

        let binarizer = match self.binarizer.take() {
            Some(existing) if self.params.warm_start && self.state.is_some() => existing,
            _ => {
                self.state = None;
                LabelBinarizer::fit(y)?
            }
        };
        let encoded = binarizer.transform(y);
        let n_classes = binarizer.n_classes();
        self.binarizer = Some(binarizer);

        estimator::fit(
            &self.params,
            &mut self.state,
            x,
            encoded?.view(),
            Self::output_spec(n_classes),
            false,
        )?;
        Ok(self)
    }

    /// Runs a single epoch over `x`, `y`. The first call must list every
    /// class through `classes` since a mini-batch may not contain them all.
    pub fn partial_fit(
        &mut self,
        x: ArrayView2<f64>,
        y: &[L],
        classes: Option<&[L]>,
    ) -> Result<&mut Self> {
        if !self.params.solver.is_stochastic() {
            return Err(MlpError::PartialFitUnsupported(self.params.solver.name()));
        }
        estimator::check_inputs(&x, y.len())?;

        let binarizer = match (self.binarizer.take(), classes) {
            (None, None) => return Err(MlpError::MissingClasses),
            (None, Some(classes)) => {
                self.state = None;
                LabelBinarizer::from_classes(classes.to_vec())?
            }
            (Some(existing), Some(classes)) => {
                let mut requested = classes.to_vec();
                requested.sort();
                requested.dedup();
                if requested != existing.classes() {
                    let message = format!(
                        "{requested:?} differs from the classes of the previous call {:?}",
                        existing.classes()
                    );
                    self.binarizer = Some(existing);
                    return Err(MlpError::invalid("classes", message));
                }
                existing
            }
            (Some(existing), None) => existing,
        };
        let encoded = binarizer.transform(y);
        let spec = Self::output_spec(binarizer.n_classes());
        self.binarizer = Some(binarizer);
        let encoded = encoded?;

        estimator::fit(&self.params, &mut self.state, x, encoded.view(), spec, true)?;
        Ok(self)
    }

    fn fitted(&self) -> Result<(&LabelBinarizer<L>, &TrainingState)> {
        match (&self.binarizer, &self.state) {
            (Some(binarizer), Some(state)) => Ok((binarizer, state)),
            _ => Err(MlpError::NotFitted),
        }
    }

    /// Class probabilities, one column per class in the order of
    /// [`MlpClassifier::classes`].
    pub fn predict_proba(&self, x: ArrayView2<f64>) -> Result<Array2<f64>> {
        let (_, state) = self.fitted()?;
        let raw = state.network().predict_raw(x)?;
        if raw.ncols() != 1 {
            return Ok(raw);
        }

        let mut proba = Array2::zeros((raw.nrows(), 2));
        proba.slice_mut(s![.., 1]).assign(&raw.column(0));
        proba
            .slice_mut(s![.., 0])
            .assign(&raw.column(0).mapv(|p| 1.0 - p));
        Ok(proba)
    }

    pub fn predict_log_proba(&self, x: ArrayView2<f64>) -> Result<Array2<f64>> {
        Ok(self.predict_proba(x)?.mapv(f64::ln))
    }

    pub fn predict(&self, x: ArrayView2<f64>) -> Result<Vec<L>> {
        let (binarizer, state) = self.fitted()?;
        let raw = state.network().predict_raw(x)?;
        Ok(binarizer.inverse_transform(raw.view(), 0.5))
    }

    /// Mean accuracy on the given samples.
    pub fn score(&self, x: ArrayView2<f64>, y: &[L]) -> Result<f64> {
        estimator::check_inputs(&x, y.len())?;
        let predicted = self.predict(x)?;
        Ok(accuracy_score(y, &predicted))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::Solver;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn tiny_params(solver: Solver) -> MlpParams {
        MlpParams {
            hidden_layer_sizes: vec![4],
            solver,
            max_iter: 20,
            random_state: Some(3),
            ..MlpParams::default()
        }
    }

    #[test]
    fn predict_before_fit_fails() {
        let classifier: MlpClassifier<u8> = MlpClassifier::default();
        let x = array![[1.0, 2.0]];
        assert!(matches!(classifier.predict(x.view()), Err(MlpError::NotFitted)));
        assert!(matches!(classifier.state(), Err(MlpError::NotFitted)));
    }

    #[test]
    fn binary_probabilities_have_two_columns() {
        let x = array![[0.0, 0.0], [0.0, 1.0], [1.0, 0.0], [1.0, 1.0]];
        let y = ["no", "yes", "yes", "yes"];
        let mut classifier = MlpClassifier::new(tiny_params(Solver::Lbfgs));
        classifier.fit(x.view(), &y).unwrap();

        let proba = classifier.predict_proba(x.view()).unwrap();
        assert_eq!(proba.dim(), (4, 2));
        for row in proba.rows() {
            assert_abs_diff_eq!(row.sum(), 1.0, epsilon = 1e-12);
        }
        assert_eq!(classifier.state().unwrap().n_outputs(), 1);
        assert_eq!(classifier.state().unwrap().out_activation(), Activation::Logistic);
        assert_eq!(classifier.classes(), Some(&["no", "yes"][..]));
    }

    #[test]
    fn multiclass_uses_softmax_output() {
        let x = array![[0.0], [1.0], [2.0], [3.0], [4.0], [5.0]];
        let y = [0, 0, 1, 1, 2, 2];
        let mut classifier = MlpClassifier::new(tiny_params(Solver::Adam));
        classifier.fit(x.view(), &y).unwrap();

        let state = classifier.state().unwrap();
        assert_eq!(state.n_outputs(), 3);
        assert_eq!(state.out_activation(), Activation::Softmax);
        assert_eq!(state.n_layers(), 3);

        let log_proba = classifier.predict_log_proba(x.view()).unwrap();
        assert!(log_proba.iter().all(|v| *v <= 0.0));
    }

    #[test]
    fn partial_fit_requires_classes_first() {
        let x = array![[0.0], [1.0]];
        let mut classifier = MlpClassifier::new(tiny_params(Solver::Sgd));
        assert!(matches!(
            classifier.partial_fit(x.view(), &[0, 1], None),
            Err(MlpError::MissingClasses)
        ));

        classifier.partial_fit(x.view(), &[0, 0], Some(&[0, 1, 2][..])).unwrap();
        assert_eq!(classifier.classes(), Some(&[0, 1, 2][..]));
        classifier.partial_fit(x.view(), &[2, 1], None).unwrap();
        assert_eq!(classifier.state().unwrap().n_iter(), 2);

        assert!(matches!(
            classifier.partial_fit(x.view(), &[7, 1], None),
            Err(MlpError::UnknownLabel(_))
        ));
        assert!(classifier.partial_fit(x.view(), &[0, 1], Some(&[0, 1][..])).is_err());
    }

    #[test]
    fn partial_fit_is_rejected_for_lbfgs() {
        let x = array![[0.0], [1.0]];
        let mut classifier = MlpClassifier::new(tiny_params(Solver::Lbfgs));
        assert!(matches!(
            classifier.partial_fit(x.view(), &[0, 1], Some(&[0, 1][..])),
            Err(MlpError::PartialFitUnsupported("lbfgs"))
        ));
    }

    #[test]
    fn fit_rejects_mismatched_labels() {
        let x = array![[0.0], [1.0], [2.0]];
        let mut classifier = MlpClassifier::new(tiny_params(Solver::Adam));
        assert!(matches!(
            classifier.fit(x.view(), &[0, 1]),
            Err(MlpError::SampleMismatch { features: 3, targets: 2 })
        ));
        assert!(matches!(
            classifier.fit(x.view(), &[1, 1, 1]),
            Err(MlpError::SingleClass(1))
        ));
    }
}
