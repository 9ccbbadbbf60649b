use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use serde::{Deserialize, Serialize};

use crate::activation::Activation;
use crate::error::{MlpError, Result};
use crate::estimator::{self, OutputSpec, TrainingState, ValidationMetric};
use crate::loss::LossKind;
use crate::metrics::r2_score;
use crate::params::MlpParams;

const OUTPUT: OutputSpec = OutputSpec {
    activation: Activation::Identity,
    loss: LossKind::Squared,
    metric: ValidationMetric::R2,
};

/// Multilayer perceptron regressor trained on squared error, with an
/// identity output layer. Supports several targets per sample.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MlpRegressor {
    params: MlpParams,
    state: Option<TrainingState>,
}

impl MlpRegressor {
    pub fn new(params: MlpParams) -> Self {
        Self {
            params,
            state: None,
        }
    }

    pub fn params(&self) -> &MlpParams {
        &self.params
    }

    pub fn params_mut(&mut self) -> &mut MlpParams {
        &mut self.params
    }

    pub fn is_fitted(&self) -> bool {
        self.state.is_some()
    }

    pub fn state(&self) -> Result<&TrainingState> {
        self.state.as_ref().ok_or(MlpError::NotFitted)
    }

    /// Trains on `x` and a target matrix with one column per output.
    pub fn fit(&mut self, x: ArrayView2<f64>, y: ArrayView2<f64>) -> Result<&mut Self> {
        estimator::fit(&self.params, &mut self.state, x, y, OUTPUT, false)?;
        Ok(self)
    }

    pub fn fit_single(&mut self, x: ArrayView2<f64>, y: ArrayView1<f64>) -> Result<&mut Self> {
        self.fit(x, y.insert_axis(Axis(1)))
    }

    /// Runs a single epoch, continuing from the current network.
    pub fn partial_fit(&mut self, x: ArrayView2<f64>, y: ArrayView2<f64>) -> Result<&mut Self> {
        if !self.params.solver.is_stochastic() {
            return Err(MlpError::PartialFitUnsupported(self.params.solver.name()));
        }
        estimator::fit(&self.params, &mut self.state, x, y, OUTPUT, true)?;
        Ok(self)
    }

    pub fn predict(&self, x: ArrayView2<f64>) -> Result<Array2<f64>> {
        self.state()?.network().predict_raw(x)
    }

    /// Predictions of a single-output model as a vector.
    pub fn predict_single(&self, x: ArrayView2<f64>) -> Result<Array1<f64>> {
        let predicted = self.predict(x)?;
        if predicted.ncols() != 1 {
            return Err(MlpError::invalid(
                "predict_single",
                format!("model has {} outputs", predicted.ncols()),
            ));
        }
        Ok(predicted.column(0).to_owned())
    }

    /// Coefficient of determination of the predictions.
    pub fn score(&self, x: ArrayView2<f64>, y: ArrayView2<f64>) -> Result<f64> {
        estimator::check_inputs(&x, y.nrows())?;
        let predicted = self.predict(x)?;
        Ok(r2_score(y, predicted.view()))
    }
}
