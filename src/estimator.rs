//! Training loop shared by the classifier and the regressor.

use ndarray::{Array2, ArrayView2, ArrayViewD, ArrayViewMutD, Axis};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::activation::Activation;
use crate::dataset::{stratified_split, take_rows, train_test_split};
use crate::error::{MlpError, Result};
use crate::lbfgs::{self, LbfgsOptions};
use crate::loss::LossKind;
use crate::metrics::r2_score;
use crate::network::Network;
use crate::optimizer::{Adam, Sgd, StochasticOptimizer};
use crate::params::{MlpParams, Solver};

/// How the last layer is activated and scored.
#[derive(Debug, Clone, Copy)]
pub(crate) struct OutputSpec {
    pub activation: Activation,
    pub loss: LossKind,
    pub metric: ValidationMetric,
}

/// Score used for early stopping, computed on encoded targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ValidationMetric {
    Accuracy,
    R2,
}

impl ValidationMetric {
    fn evaluate(self, network: &Network, x: ArrayView2<f64>, y: ArrayView2<f64>) -> Result<f64> {
        let predicted = network.predict_raw(x)?;
        Ok(match self {
            Self::Accuracy => encoded_accuracy(y, predicted.view()),
            Self::R2 => r2_score(y, predicted.view()),
        })
    }
}

/// Row index of the largest entry, or the 0.5 threshold for a single column.
pub(crate) fn encoded_class(row: ndarray::ArrayView1<f64>) -> usize {
    if row.len() == 1 {
        return usize::from(row[0] > 0.5);
    }
    row.iter()
        .enumerate()
        .fold((0, f64::NEG_INFINITY), |best, (i, &v)| if v > best.1 { (i, v) } else { best })
        .0
}

fn encoded_accuracy(y: ArrayView2<f64>, predicted: ArrayView2<f64>) -> f64 {
    if y.nrows() == 0 {
        return 0.0;
    }
    let correct = y
        .axis_iter(Axis(0))
        .zip(predicted.axis_iter(Axis(0)))
        .filter(|(truth, guess)| encoded_class(*truth) == encoded_class(*guess))
        .count();
    correct as f64 / y.nrows() as f64
}

#[derive(Debug, Clone)]
enum SolverState {
    Sgd(Sgd),
    Adam(Adam),
}

impl SolverState {
    fn for_params(params: &MlpParams) -> Self {
        match params.solver {
            Solver::Sgd => Self::Sgd(Sgd::new(
                params.learning_rate_init,
                params.learning_rate,
                params.momentum,
                params.nesterovs_momentum,
                params.power_t,
            )),
            Solver::Adam | Solver::Lbfgs => Self::Adam(Adam::new(
                params.learning_rate_init,
                params.beta_1,
                params.beta_2,
                params.epsilon,
            )),
        }
    }

    fn inner(&mut self) -> &mut dyn StochasticOptimizer {
        match self {
            Self::Sgd(sgd) => sgd,
            Self::Adam(adam) => adam,
        }
    }
}

impl StochasticOptimizer for SolverState {
    fn update_params(&mut self, params: Vec<ArrayViewMutD<'_, f64>>, grads: &[ArrayViewD<'_, f64>]) {
        self.inner().update_params(params, grads);
    }

    fn iteration_ends(&mut self, time_step: usize) {
        self.inner().iteration_ends(time_step);
    }

    fn trigger_stopping(&mut self, reason: &str, verbose: bool) -> bool {
        self.inner().trigger_stopping(reason, verbose)
    }

    fn learning_rate(&self) -> f64 {
        match self {
            Self::Sgd(sgd) => sgd.learning_rate(),
            Self::Adam(adam) => adam.learning_rate(),
        }
    }
}

/// Fitted network and the bookkeeping of its training run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingState {
    network: Network,
    loss: Option<f64>,
    best_loss: Option<f64>,
    loss_curve: Vec<f64>,
    validation_scores: Vec<f64>,
    best_validation_score: Option<f64>,
    n_iter: usize,
    t: usize,
    #[serde(skip)]
    no_improvement_count: usize,
    #[serde(skip)]
    best_network: Option<Network>,
    #[serde(skip)]
    optimizer: Option<SolverState>,
}

impl TrainingState {
    fn new(network: Network) -> Self {
        Self {
            network,
            loss: None,
            best_loss: None,
            loss_curve: Vec::new(),
            validation_scores: Vec::new(),
            best_validation_score: None,
            n_iter: 0,
            t: 0,
            no_improvement_count: 0,
            best_network: None,
            optimizer: None,
        }
    }

    pub fn network(&self) -> &Network {
        &self.network
    }

    /// Objective value after the last epoch or L-BFGS iteration.
    pub fn loss(&self) -> Option<f64> {
        self.loss
    }

    /// Lowest training loss seen by a stochastic solver without early
    /// stopping.
    pub fn best_loss(&self) -> Option<f64> {
        self.best_loss
    }

    /// Loss after every epoch, or after every L-BFGS iteration.
    pub fn loss_curve(&self) -> &[f64] {
        &self.loss_curve
    }

    /// Validation score after every epoch when early stopping is enabled.
    pub fn validation_scores(&self) -> &[f64] {
        &self.validation_scores
    }

    pub fn best_validation_score(&self) -> Option<f64> {
        self.best_validation_score
    }

    /// Epochs (stochastic solvers) or iterations (L-BFGS) run so far.
    pub fn n_iter(&self) -> usize {
        self.n_iter
    }

    /// Training samples seen by the stochastic solvers.
    pub fn t(&self) -> usize {
        self.t
    }

    /// Current step size of the stochastic solver. `None` for L-BFGS fits
    /// and for models restored from disk.
    pub fn learning_rate(&self) -> Option<f64> {
        self.optimizer.as_ref().map(StochasticOptimizer::learning_rate)
    }

    pub fn n_layers(&self) -> usize {
        self.network.n_layers()
    }

    pub fn n_outputs(&self) -> usize {
        self.network.n_outputs()
    }

    pub fn out_activation(&self) -> Activation {
        self.network.output_activation()
    }

    pub fn coefs(&self) -> &[Array2<f64>] {
        self.network.coefs()
    }

    pub fn intercepts(&self) -> &[ndarray::Array1<f64>] {
        self.network.intercepts()
    }
}

pub(crate) fn check_inputs(x: &ArrayView2<f64>, n_targets: usize) -> Result<()> {
    if x.nrows() != n_targets {
        return Err(MlpError::SampleMismatch {
            features: x.nrows(),
            targets: n_targets,
        });
    }
    if x.nrows() == 0 || x.ncols() == 0 {
        return Err(MlpError::EmptyInput);
    }
    if x.iter().any(|v| !v.is_finite()) {
        return Err(MlpError::NonFinite);
    }
    Ok(())
}

fn rng_for(params: &MlpParams) -> StdRng {
    params
        .random_state
        .map_or_else(StdRng::from_entropy, StdRng::seed_from_u64)
}

fn log_progress(verbose: bool, message: &str) {
    if verbose {
        tracing::info!("{message}");
    } else {
        tracing::debug!("{message}");
    }
}

/// Fits `state` to the encoded targets `y`. A fresh network is created
/// unless the call is incremental or `warm_start` is set and a compatible
/// network exists. On error `state` is left as it was before a warm or
/// incremental call, and empty after a fresh one.
pub(crate) fn fit(
    params: &MlpParams,
    state: &mut Option<TrainingState>,
    x: ArrayView2<f64>,
    y: ArrayView2<f64>,
    output: OutputSpec,
    incremental: bool,
) -> Result<()> {
    params.validate()?;
    check_inputs(&x, y.nrows())?;
    if y.iter().any(|v| !v.is_finite()) {
        return Err(MlpError::NonFinite);
    }

    let mut rng = rng_for(params);
    let layer_sizes: Vec<usize> = std::iter::once(x.ncols())
        .chain(params.hidden_layer_sizes.iter().copied())
        .chain(std::iter::once(y.ncols()))
        .collect();

    let reuse = (incremental || params.warm_start) && state.is_some();
    let mut current = match state.take() {
        Some(existing) if reuse => {
            if existing.network.layer_sizes() != layer_sizes {
                let expected = existing.network.layer_sizes();
                *state = Some(existing);
                return Err(MlpError::invalid(
                    "hidden_layer_sizes",
                    format!("network has layers {expected:?}, data requires {layer_sizes:?}"),
                ));
            }
            existing
        }
        _ => TrainingState::new(Network::initialize(
            &layer_sizes,
            params.activation,
            output.activation,
            &mut rng,
        )),
    };

    let backup = reuse.then(|| current.clone());

    let outcome = if params.solver.is_stochastic() {
        fit_stochastic(params, &mut current, x, y, output, &mut rng, incremental)
    } else {
        fit_lbfgs(params, &mut current, x, y, output.loss)
    };
    match outcome {
        Ok(()) => {
            *state = Some(current);
            Ok(())
        }
        Err(err) => {
            *state = backup;
            Err(err)
        }
    }
}

fn fit_stochastic(
    params: &MlpParams,
    state: &mut TrainingState,
    x: ArrayView2<f64>,
    y: ArrayView2<f64>,
    output: OutputSpec,
    rng: &mut StdRng,
    incremental: bool,
) -> Result<()> {
    // Moment estimates and velocities only carry over between partial fits.
    let mut optimizer = match state.optimizer.take() {
        Some(optimizer) if incremental => optimizer,
        _ => SolverState::for_params(params),
    };

    let early_stopping = params.early_stopping && !incremental;
    let (x_train, y_train, validation) = if early_stopping {
        let (train, test) = match output.metric {
            ValidationMetric::Accuracy => {
                let strata: Vec<usize> = y.axis_iter(Axis(0)).map(encoded_class).collect();
                stratified_split(&strata, params.validation_fraction, rng)
            }
            ValidationMetric::R2 => train_test_split(x.nrows(), params.validation_fraction, rng),
        };
        if train.is_empty() || test.is_empty() {
            return Err(MlpError::invalid(
                "validation_fraction",
                format!(
                    "leaves {} training and {} validation samples",
                    train.len(),
                    test.len()
                ),
            ));
        }
        (
            take_rows(x, &train),
            take_rows(y, &train),
            Some((take_rows(x, &test), take_rows(y, &test))),
        )
    } else {
        (x.to_owned(), y.to_owned(), None)
    };

    let n_samples = x_train.nrows();
    let batch_size = params.batch_size.resolve(n_samples);
    let epochs = if incremental { 1 } else { params.max_iter };
    let mut indices: Vec<usize> = (0..n_samples).collect();

    let mut stopped = false;
    for _ in 0..epochs {
        if params.shuffle {
            indices.shuffle(rng);
        }

        let mut accumulated_loss = 0.0;
        for batch in indices.chunks(batch_size) {
            let x_batch = x_train.select(Axis(0), batch);
            let y_batch = y_train.select(Axis(0), batch);
            let (batch_loss, gradients) = state.network.loss_and_gradients(
                x_batch.view(),
                y_batch.view(),
                params.alpha,
                output.loss,
            )?;
            accumulated_loss += batch_loss * batch.len() as f64;
            optimizer.update_params(state.network.params_mut(), &gradients.views());
        }

        let epoch_loss = accumulated_loss / n_samples as f64;
        state.n_iter += 1;
        state.loss = Some(epoch_loss);
        state.t += n_samples;
        state.loss_curve.push(epoch_loss);
        log_progress(
            params.verbose,
            &format!("Iteration {}, loss = {epoch_loss:.8}", state.n_iter),
        );

        update_no_improvement_count(params, state, epoch_loss, validation.as_ref(), output.metric)?;
        optimizer.iteration_ends(state.t);

        if state.no_improvement_count > params.n_iter_no_change {
            let subject = if early_stopping {
                "Validation score"
            } else {
                "Training loss"
            };
            let reason = format!(
                "{subject} did not improve more than tol={} for {} consecutive epochs.",
                params.tol, params.n_iter_no_change
            );
            if optimizer.trigger_stopping(&reason, params.verbose) {
                stopped = true;
                break;
            }
            state.no_improvement_count = 0;
        }
    }

    if !incremental && !stopped {
        tracing::warn!(
            "Stochastic optimizer: maximum iterations ({}) reached and the optimization \
             hasn't converged yet.",
            params.max_iter
        );
    }

    if early_stopping {
        if let Some(best) = state.best_network.take() {
            state.network = best;
        }
    }
    state.optimizer = Some(optimizer);
    Ok(())
}

fn update_no_improvement_count(
    params: &MlpParams,
    state: &mut TrainingState,
    epoch_loss: f64,
    validation: Option<&(Array2<f64>, Array2<f64>)>,
    metric: ValidationMetric,
) -> Result<()> {
    if let Some((x_val, y_val)) = validation {
        let score = metric.evaluate(&state.network, x_val.view(), y_val.view())?;
        state.validation_scores.push(score);
        log_progress(params.verbose, &format!("Validation score: {score:.6}"));

        let best = state.best_validation_score.unwrap_or(f64::NEG_INFINITY);
        if score < best + params.tol {
            state.no_improvement_count += 1;
        } else {
            state.no_improvement_count = 0;
        }
        if score > best {
            state.best_validation_score = Some(score);
            state.best_network = Some(state.network.clone());
        }
    } else {
        let best = state.best_loss.unwrap_or(f64::INFINITY);
        if epoch_loss > best - params.tol {
            state.no_improvement_count += 1;
        } else {
            state.no_improvement_count = 0;
        }
        if epoch_loss < best {
            state.best_loss = Some(epoch_loss);
        }
    }
    Ok(())
}

fn fit_lbfgs(
    params: &MlpParams,
    state: &mut TrainingState,
    x: ArrayView2<f64>,
    y: ArrayView2<f64>,
    loss: LossKind,
) -> Result<()> {
    let options = LbfgsOptions {
        max_iter: params.max_iter,
        max_fun: params.max_fun,
        gtol: params.tol,
        ..LbfgsOptions::default()
    };

    let mut probe = state.network.clone();
    let alpha = params.alpha;
    let outcome = lbfgs::minimize(
        |theta| {
            probe.unpack(theta)?;
            let (value, gradients) = probe.loss_and_gradients(x, y, alpha, loss)?;
            Ok((value, gradients.pack()))
        },
        state.network.pack(),
        &options,
    )?;

    state.network.unpack(&outcome.x)?;
    state.optimizer = None;
    state.n_iter += outcome.iterations;
    state.loss = Some(outcome.f);
    state.loss_curve.extend_from_slice(&outcome.history);

    if outcome.termination.converged() {
        log_progress(
            params.verbose,
            &format!(
                "L-BFGS converged after {} iterations, loss = {:.8}",
                outcome.iterations, outcome.f
            ),
        );
    } else {
        tracing::warn!(
            "lbfgs failed to converge ({}). Increase the number of iterations (max_iter) \
             or scale the data.",
            outcome.termination.describe()
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimizer::LearningRateSchedule;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use rand::Rng;

    #[test]
    fn encoded_class_handles_binary_and_multiclass_rows() {
        assert_eq!(encoded_class(array![0.7].view()), 1);
        assert_eq!(encoded_class(array![0.2].view()), 0);
        assert_eq!(encoded_class(array![0.1, 0.3, 0.6].view()), 2);
    }

    #[test]
    fn check_inputs_rejects_bad_data() {
        let x = array![[1.0, 2.0], [3.0, f64::NAN]];
        assert!(matches!(check_inputs(&x.view(), 2), Err(MlpError::NonFinite)));
        assert!(matches!(
            check_inputs(&x.view(), 3),
            Err(MlpError::SampleMismatch { features: 2, targets: 3 })
        ));

        let empty = Array2::<f64>::zeros((0, 2));
        assert!(matches!(check_inputs(&empty.view(), 0), Err(MlpError::EmptyInput)));
    }

    fn regression_output() -> OutputSpec {
        OutputSpec {
            activation: Activation::Identity,
            loss: LossKind::Squared,
            metric: ValidationMetric::R2,
        }
    }

    #[test]
    fn stops_when_training_loss_stalls() {
        let x = array![[0.0], [1.0], [2.0], [3.0]];
        let y = array![[1.0], [1.0], [1.0], [1.0]];
        let params = MlpParams {
            hidden_layer_sizes: vec![2],
            solver: Solver::Sgd,
            learning_rate_init: 1e-9,
            max_iter: 500,
            n_iter_no_change: 3,
            random_state: Some(0),
            ..MlpParams::default()
        };

        let mut state = None;
        fit(&params, &mut state, x.view(), y.view(), regression_output(), false).unwrap();
        let state = state.unwrap();

        // tol is never beaten, so training ends once the counter exceeds 3.
        assert_eq!(state.n_iter(), 5);
        assert_eq!(state.loss_curve().len(), 5);
        assert_eq!(state.t(), 20);
    }

    #[test]
    fn incremental_fit_runs_one_epoch_and_keeps_network() {
        let x = array![[0.0, 1.0], [1.0, 0.0], [1.0, 1.0]];
        let y = array![[0.5], [1.5], [2.0]];
        let params = MlpParams {
            hidden_layer_sizes: vec![3],
            random_state: Some(1),
            ..MlpParams::default()
        };

        let mut state = None;
        fit(&params, &mut state, x.view(), y.view(), regression_output(), true).unwrap();
        assert_eq!(state.as_ref().unwrap().n_iter(), 1);

        fit(&params, &mut state, x.view(), y.view(), regression_output(), true).unwrap();
        let state = state.unwrap();
        assert_eq!(state.n_iter(), 2);
        assert_eq!(state.loss_curve().len(), 2);
        assert_eq!(state.t(), 6);
    }

    #[test]
    fn warm_start_rejects_incompatible_shapes() {
        let params = MlpParams {
            hidden_layer_sizes: vec![2],
            solver: Solver::Lbfgs,
            warm_start: true,
            max_iter: 5,
            random_state: Some(0),
            ..MlpParams::default()
        };
        let mut state = None;
        let x = array![[0.0], [1.0]];
        let y = array![[0.0], [1.0]];
        fit(&params, &mut state, x.view(), y.view(), regression_output(), false).unwrap();

        let wider = array![[0.0, 1.0], [1.0, 0.0]];
        let err = fit(&params, &mut state, wider.view(), y.view(), regression_output(), false);
        assert!(matches!(err, Err(MlpError::InvalidParameter { .. })));
        assert!(state.is_some());
    }

    #[test]
    fn warm_start_rebuilds_optimizer_for_new_solver() {
        let x = array![[0.0, 1.0], [1.0, 0.0], [1.0, 1.0], [0.0, 0.0]];
        let y = array![[1.0], [2.0], [3.0], [0.0]];
        let sgd = MlpParams {
            hidden_layer_sizes: vec![3],
            solver: Solver::Sgd,
            max_iter: 3,
            random_state: Some(2),
            ..MlpParams::default()
        };
        let mut state = None;
        fit(&sgd, &mut state, x.view(), y.view(), regression_output(), false).unwrap();
        assert!(matches!(state.as_ref().unwrap().optimizer, Some(SolverState::Sgd(_))));

        let adam = MlpParams {
            solver: Solver::Adam,
            warm_start: true,
            ..sgd
        };
        fit(&adam, &mut state, x.view(), y.view(), regression_output(), false).unwrap();
        let state = state.unwrap();
        assert!(matches!(state.optimizer, Some(SolverState::Adam(_))));
        assert_eq!(state.n_iter(), 6);
    }

    #[test]
    fn failed_fresh_fit_leaves_no_state() {
        let x = array![[0.0], [1.0]];
        let y = array![[0.0], [1.0]];
        let params = MlpParams {
            hidden_layer_sizes: vec![2],
            early_stopping: true,
            validation_fraction: 0.9,
            random_state: Some(0),
            ..MlpParams::default()
        };
        let mut state = None;
        let err = fit(&params, &mut state, x.view(), y.view(), regression_output(), false);
        assert!(matches!(err, Err(MlpError::InvalidParameter { name: "validation_fraction", .. })));
        assert!(state.is_none());
    }

    #[test]
    fn failed_warm_fit_keeps_previous_state() {
        let x = array![[0.0], [1.0]];
        let y = array![[0.0], [1.0]];
        let params = MlpParams {
            hidden_layer_sizes: vec![2],
            max_iter: 4,
            random_state: Some(0),
            ..MlpParams::default()
        };
        let mut state = None;
        fit(&params, &mut state, x.view(), y.view(), regression_output(), false).unwrap();
        let before = state.as_ref().unwrap().network().clone();

        let failing = MlpParams {
            warm_start: true,
            early_stopping: true,
            validation_fraction: 0.9,
            ..params
        };
        assert!(fit(&failing, &mut state, x.view(), y.view(), regression_output(), false).is_err());
        let state = state.unwrap();
        assert_eq!(state.network(), &before);
        assert_eq!(state.n_iter(), 4);
    }

    #[test]
    fn early_stopping_restores_best_network() {
        let mut rng = StdRng::seed_from_u64(4);
        let x = Array2::from_shape_fn((40, 2), |_| rng.gen_range(-1.0..1.0));
        let y = x.map_axis(Axis(1), |row| row[0] - 2.0 * row[1]).insert_axis(Axis(1));
        let params = MlpParams {
            hidden_layer_sizes: vec![8],
            learning_rate_init: 0.05,
            early_stopping: true,
            validation_fraction: 0.25,
            n_iter_no_change: 3,
            tol: 0.05,
            max_iter: 500,
            random_state: Some(6),
            ..MlpParams::default()
        };
        let mut state = None;
        fit(&params, &mut state, x.view(), y.view(), regression_output(), false).unwrap();
        let state = state.unwrap();
        assert!(state.n_iter() < 500);

        // Replay the seeded draws of the fit to recover its held-out rows.
        let mut replay = StdRng::seed_from_u64(6);
        Network::initialize(&[2, 8, 1], Activation::Relu, Activation::Identity, &mut replay);
        let (_, held_out) = train_test_split(40, 0.25, &mut replay);

        let score = ValidationMetric::R2
            .evaluate(
                state.network(),
                take_rows(x.view(), &held_out).view(),
                take_rows(y.view(), &held_out).view(),
            )
            .unwrap();
        assert_abs_diff_eq!(score, state.best_validation_score().unwrap(), epsilon = 1e-12);
    }

    #[test]
    fn adaptive_schedule_shrinks_until_too_small() {
        let x = array![[0.0], [1.0], [2.0], [3.0]];
        let y = array![[1.0], [1.0], [1.0], [1.0]];
        let params = MlpParams {
            hidden_layer_sizes: vec![2],
            solver: Solver::Sgd,
            learning_rate: LearningRateSchedule::Adaptive,
            learning_rate_init: 1e-5,
            momentum: 0.0,
            tol: 1e-2,
            n_iter_no_change: 2,
            max_iter: 500,
            random_state: Some(0),
            ..MlpParams::default()
        };
        let mut state = None;
        fit(&params, &mut state, x.view(), y.view(), regression_output(), false).unwrap();
        let state = state.unwrap();

        // Three stalls: 1e-5 -> 2e-6 -> 4e-7, then the step is too small.
        assert_eq!(state.n_iter(), 10);
        let learning_rate = state.learning_rate().unwrap();
        assert_abs_diff_eq!(learning_rate, 4e-7, epsilon = 1e-15);
        assert!(learning_rate <= 1e-6);
    }

    #[test]
    fn lbfgs_fit_clears_learning_rate() {
        let x = array![[0.0], [1.0], [2.0]];
        let y = array![[0.0], [1.0], [2.0]];
        let params = MlpParams {
            hidden_layer_sizes: vec![2],
            solver: Solver::Lbfgs,
            max_iter: 5,
            random_state: Some(1),
            ..MlpParams::default()
        };
        let mut state = None;
        fit(&params, &mut state, x.view(), y.view(), regression_output(), false).unwrap();
        assert_eq!(state.unwrap().learning_rate(), None);
    }
}
