//! Stochastic solvers used for mini-batch training.

use ndarray::{ArrayD, ArrayViewD, ArrayViewMutD, Zip};
use serde::{Deserialize, Serialize};

/// Learning rate schedule of [`Sgd`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LearningRateSchedule {
    #[default]
    Constant,
    /// `η = η₀ / (t + 1)^power_t` where `t` counts the samples seen.
    InvScaling,
    /// Keep `η` while the objective improves, divide it by 5 otherwise.
    Adaptive,
}

pub trait StochasticOptimizer {
    /// Applies one update given gradients in the same order as `params`.
    fn update_params(&mut self, params: Vec<ArrayViewMutD<'_, f64>>, grads: &[ArrayViewD<'_, f64>]);

    /// Called at the end of every epoch with the number of samples seen.
    fn iteration_ends(&mut self, _time_step: usize) {}

    /// Called when training stalls. Returns `true` if training should stop.
    fn trigger_stopping(&mut self, reason: &str, verbose: bool) -> bool;

    fn learning_rate(&self) -> f64;
}

fn zeros_like(shapes: &[ArrayViewD<'_, f64>]) -> Vec<ArrayD<f64>> {
    shapes.iter().map(|g| ArrayD::zeros(g.raw_dim())).collect()
}

fn log_stop(message: &str, verbose: bool) {
    if verbose {
        tracing::info!("{message}");
    } else {
        tracing::debug!("{message}");
    }
}

/// Stochastic gradient descent with momentum.
#[derive(Debug, Clone)]
pub struct Sgd {
    learning_rate_init: f64,
    learning_rate: f64,
    schedule: LearningRateSchedule,
    momentum: f64,
    nesterov: bool,
    power_t: f64,
    velocities: Vec<ArrayD<f64>>,
}

impl Sgd {
    pub fn new(
        learning_rate_init: f64,
        schedule: LearningRateSchedule,
        momentum: f64,
        nesterov: bool,
        power_t: f64,
    ) -> Self {
        Self {
            learning_rate_init,
            learning_rate: learning_rate_init,
            schedule,
            momentum,
            nesterov,
            power_t,
            velocities: Vec::new(),
        }
    }
}

impl StochasticOptimizer for Sgd {
    fn update_params(&mut self, params: Vec<ArrayViewMutD<'_, f64>>, grads: &[ArrayViewD<'_, f64>]) {
        if self.velocities.len() != grads.len() {
            self.velocities = zeros_like(grads);
        }

        let (momentum, learning_rate) = (self.momentum, self.learning_rate);
        for ((param, grad), velocity) in params.into_iter().zip(grads).zip(&mut self.velocities) {
            // v = μ v - η g
            Zip::from(&mut *velocity)
                .and(grad)
                .for_each(|v, &g| *v = momentum * *v - learning_rate * g);

            if self.nesterov {
                Zip::from(param)
                    .and(&*velocity)
                    .and(grad)
                    .for_each(|p, &v, &g| *p += momentum * v - learning_rate * g);
            } else {
                Zip::from(param).and(&*velocity).for_each(|p, &v| *p += v);
            }
        }
    }

    fn iteration_ends(&mut self, time_step: usize) {
        if self.schedule == LearningRateSchedule::InvScaling {
            self.learning_rate =
                self.learning_rate_init / ((time_step + 1) as f64).powf(self.power_t);
        }
    }

    fn trigger_stopping(&mut self, reason: &str, verbose: bool) -> bool {
        if self.schedule != LearningRateSchedule::Adaptive {
            log_stop(&format!("{reason} Stopping."), verbose);
            return true;
        }

        if self.learning_rate <= 1e-6 {
            log_stop(&format!("{reason} Learning rate too small. Stopping."), verbose);
            return true;
        }

        self.learning_rate /= 5.0;
        log_stop(
            &format!("{reason} Setting learning rate to {:.6}", self.learning_rate),
            verbose,
        );
        false
    }

    fn learning_rate(&self) -> f64 {
        self.learning_rate
    }
}

/// Adam: stochastic optimisation with bias-corrected moment estimates.
#[derive(Debug, Clone)]
pub struct Adam {
    learning_rate_init: f64,
    learning_rate: f64,
    beta_1: f64,
    beta_2: f64,
    epsilon: f64,
    t: i32,
    first_moments: Vec<ArrayD<f64>>,
    second_moments: Vec<ArrayD<f64>>,
}

impl Adam {
    pub fn new(learning_rate_init: f64, beta_1: f64, beta_2: f64, epsilon: f64) -> Self {
        Self {
            learning_rate_init,
            learning_rate: learning_rate_init,
            beta_1,
            beta_2,
            epsilon,
            t: 0,
            first_moments: Vec::new(),
            second_moments: Vec::new(),
        }
    }
}

impl StochasticOptimizer for Adam {
    fn update_params(&mut self, params: Vec<ArrayViewMutD<'_, f64>>, grads: &[ArrayViewD<'_, f64>]) {
        if self.first_moments.len() != grads.len() {
            self.first_moments = zeros_like(grads);
            self.second_moments = zeros_like(grads);
        }

        self.t = self.t.saturating_add(1);
        let (beta_1, beta_2, epsilon) = (self.beta_1, self.beta_2, self.epsilon);
        self.learning_rate = self.learning_rate_init * (1.0 - beta_2.powi(self.t)).sqrt()
            / (1.0 - beta_1.powi(self.t));
        let learning_rate = self.learning_rate;

        let moments = self.first_moments.iter_mut().zip(&mut self.second_moments);
        for ((param, grad), (m, v)) in params.into_iter().zip(grads).zip(moments) {
            Zip::from(param)
                .and(grad)
                .and(m)
                .and(v)
                .for_each(|p, &g, m, v| {
                    *m = beta_1 * *m + (1.0 - beta_1) * g;
                    *v = beta_2 * *v + (1.0 - beta_2) * g * g;
                    *p -= learning_rate * *m / (v.sqrt() + epsilon);
                });
        }
    }

    fn trigger_stopping(&mut self, reason: &str, verbose: bool) -> bool {
        log_stop(&format!("{reason} Stopping."), verbose);
        true
    }

    fn learning_rate(&self) -> f64 {
        self.learning_rate
    }
}
