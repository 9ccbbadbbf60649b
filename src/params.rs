use std::fmt;

use serde::{Deserialize, Serialize};

use crate::activation::Activation;
use crate::error::{MlpError, Result};
use crate::optimizer::LearningRateSchedule;

/// Weight optimisation method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Solver {
    /// Full-batch limited-memory BFGS. Usually the best choice for small
    /// datasets.
    Lbfgs,
    /// Mini-batch stochastic gradient descent with momentum.
    Sgd,
    /// Mini-batch Adam.
    #[default]
    Adam,
}

impl Solver {
    pub const fn name(self) -> &'static str {
        match self {
            Self::Lbfgs => "lbfgs",
            Self::Sgd => "sgd",
            Self::Adam => "adam",
        }
    }

    pub const fn is_stochastic(self) -> bool {
        !matches!(self, Self::Lbfgs)
    }
}

impl fmt::Display for Solver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Mini-batch size of the stochastic solvers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchSize {
    /// `min(200, n_samples)`
    #[default]
    Auto,
    #[serde(untagged)]
    Fixed(usize),
}

impl BatchSize {
    const AUTO_LIMIT: usize = 200;

    /// Effective batch size for `n_samples`. Oversized fixed batches are
    /// clipped.
    pub fn resolve(self, n_samples: usize) -> usize {
        match self {
            Self::Auto => n_samples.min(Self::AUTO_LIMIT),
            Self::Fixed(size) => {
                if size > n_samples {
                    tracing::warn!("batch_size {size} exceeds the {n_samples} samples, clipping");
                }
                size.clamp(1, n_samples.max(1))
            }
        }
    }
}

/// Hyperparameters shared by [`crate::MlpClassifier`] and
/// [`crate::MlpRegressor`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MlpParams {
    /// Number of units in each hidden layer.
    pub hidden_layer_sizes: Vec<usize>,
    /// Hidden layer activation.
    pub activation: Activation,
    pub solver: Solver,
    /// L2 penalty strength.
    pub alpha: f64,
    pub batch_size: BatchSize,
    /// Schedule for [`Solver::Sgd`].
    pub learning_rate: LearningRateSchedule,
    /// Step size of the stochastic solvers.
    pub learning_rate_init: f64,
    /// Exponent of [`LearningRateSchedule::InvScaling`].
    pub power_t: f64,
    /// Epochs for the stochastic solvers, iterations for L-BFGS.
    pub max_iter: usize,
    /// Reshuffle the samples before every epoch.
    pub shuffle: bool,
    /// Seed for weight initialisation, shuffling and the validation split.
    pub random_state: Option<u64>,
    /// Minimum improvement of the loss or validation score.
    pub tol: f64,
    /// Log progress at `info` instead of `debug`.
    pub verbose: bool,
    /// Continue from the previous solution when fitting again.
    pub warm_start: bool,
    pub momentum: f64,
    pub nesterovs_momentum: bool,
    /// Hold out part of the data and stop when the validation score stalls.
    pub early_stopping: bool,
    pub validation_fraction: f64,
    pub beta_1: f64,
    pub beta_2: f64,
    pub epsilon: f64,
    /// Epochs without improvement tolerated before stopping.
    pub n_iter_no_change: usize,
    /// Maximum number of objective evaluations for L-BFGS.
    pub max_fun: usize,
}

impl Default for MlpParams {
    fn default() -> Self {
        Self {
            hidden_layer_sizes: vec![100],
            activation: Activation::Relu,
            solver: Solver::Adam,
            alpha: 1e-4,
            batch_size: BatchSize::Auto,
            learning_rate: LearningRateSchedule::Constant,
            learning_rate_init: 1e-3,
            power_t: 0.5,
            max_iter: 200,
            shuffle: true,
            random_state: None,
            tol: 1e-4,
            verbose: false,
            warm_start: false,
            momentum: 0.9,
            nesterovs_momentum: true,
            early_stopping: false,
            validation_fraction: 0.1,
            beta_1: 0.9,
            beta_2: 0.999,
            epsilon: 1e-8,
            n_iter_no_change: 10,
            max_fun: 15_000,
        }
    }
}

fn non_negative(value: f64) -> bool {
    value >= 0.0
}

fn positive(value: f64) -> bool {
    value > 0.0
}

fn unit_interval(value: f64, closed_above: bool) -> bool {
    value >= 0.0 && (value < 1.0 || (closed_above && value <= 1.0))
}

impl MlpParams {
    pub fn validate(&self) -> Result<()> {
        if let Some(position) = self.hidden_layer_sizes.iter().position(|&size| size == 0) {
            return Err(MlpError::invalid(
                "hidden_layer_sizes",
                format!("layer {position} has no units"),
            ));
        }
        if self.activation == Activation::Softmax {
            return Err(MlpError::invalid(
                "activation",
                "softmax is reserved for the output layer",
            ));
        }
        if self.max_iter == 0 {
            return Err(MlpError::invalid("max_iter", "must be positive"));
        }
        if !(non_negative(self.alpha) && self.alpha.is_finite()) {
            return Err(MlpError::invalid("alpha", format!("must be >= 0, got {}", self.alpha)));
        }
        if !non_negative(self.tol) {
            return Err(MlpError::invalid("tol", format!("must be >= 0, got {}", self.tol)));
        }
        if !positive(self.learning_rate_init) {
            return Err(MlpError::invalid(
                "learning_rate_init",
                format!("must be > 0, got {}", self.learning_rate_init),
            ));
        }
        if !non_negative(self.power_t) {
            return Err(MlpError::invalid("power_t", format!("must be >= 0, got {}", self.power_t)));
        }
        if !unit_interval(self.momentum, true) {
            return Err(MlpError::invalid(
                "momentum",
                format!("must be in [0, 1], got {}", self.momentum),
            ));
        }
        if !unit_interval(self.validation_fraction, false)
            || (self.early_stopping && self.validation_fraction == 0.0)
        {
            return Err(MlpError::invalid(
                "validation_fraction",
                format!("must be in [0, 1), got {}", self.validation_fraction),
            ));
        }
        if !unit_interval(self.beta_1, false) {
            return Err(MlpError::invalid("beta_1", format!("must be in [0, 1), got {}", self.beta_1)));
        }
        if !unit_interval(self.beta_2, false) {
            return Err(MlpError::invalid("beta_2", format!("must be in [0, 1), got {}", self.beta_2)));
        }
        if !positive(self.epsilon) {
            return Err(MlpError::invalid("epsilon", format!("must be > 0, got {}", self.epsilon)));
        }
        if self.n_iter_no_change == 0 {
            return Err(MlpError::invalid("n_iter_no_change", "must be positive"));
        }
        if self.max_fun == 0 {
            return Err(MlpError::invalid("max_fun", "must be positive"));
        }
        if self.batch_size == BatchSize::Fixed(0) {
            return Err(MlpError::invalid("batch_size", "must be positive"));
        }
        Ok(())
    }
}
