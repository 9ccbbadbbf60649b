//! Limited-memory BFGS over flat parameter vectors.

use std::collections::VecDeque;

use nalgebra::DVector;

use crate::error::Result;

const ARMIJO_C1: f64 = 1e-4;
const BACKTRACK: f64 = 0.5;
const MAX_LINE_SEARCH_STEPS: usize = 30;
const MIN_CURVATURE: f64 = 1e-10;

#[derive(Debug, Clone, Copy)]
pub struct LbfgsOptions {
    pub max_iter: usize,
    /// Maximum number of objective evaluations.
    pub max_fun: usize,
    /// Stop once the largest gradient component is at most this.
    pub gtol: f64,
    /// Stop once the relative decrease of the objective is at most
    /// `factr * f64::EPSILON`.
    pub factr: f64,
    /// Number of correction pairs kept.
    pub memory: usize,
}

impl Default for LbfgsOptions {
    fn default() -> Self {
        Self {
            max_iter: 15_000,
            max_fun: 15_000,
            gtol: 1e-5,
            factr: 1e7,
            memory: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    GradientTolerance,
    RelativeReduction,
    MaxIterations,
    MaxEvaluations,
    LineSearchFailed,
}

impl Termination {
    pub fn converged(self) -> bool {
        matches!(self, Self::GradientTolerance | Self::RelativeReduction)
    }

    pub fn describe(self) -> &'static str {
        match self {
            Self::GradientTolerance => "projected gradient below tolerance",
            Self::RelativeReduction => "relative reduction of objective below tolerance",
            Self::MaxIterations => "maximum number of iterations reached",
            Self::MaxEvaluations => "maximum number of function evaluations reached",
            Self::LineSearchFailed => "line search could not decrease the objective",
        }
    }
}

#[derive(Debug, Clone)]
pub struct LbfgsOutcome {
    pub x: DVector<f64>,
    pub f: f64,
    pub iterations: usize,
    pub evaluations: usize,
    pub termination: Termination,
    /// Objective after every accepted step.
    pub history: Vec<f64>,
}

struct Memory {
    capacity: usize,
    s: VecDeque<DVector<f64>>,
    y: VecDeque<DVector<f64>>,
    rho: VecDeque<f64>,
}

impl Memory {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            s: VecDeque::new(),
            y: VecDeque::new(),
            rho: VecDeque::new(),
        }
    }

    fn is_empty(&self) -> bool {
        self.s.is_empty()
    }

    fn clear(&mut self) {
        self.s.clear();
        self.y.clear();
        self.rho.clear();
    }

    fn push(&mut self, s: DVector<f64>, y: DVector<f64>) {
        let sy = s.dot(&y);
        if sy <= MIN_CURVATURE {
            return;
        }
        if self.s.len() == self.capacity {
            self.s.pop_front();
            self.y.pop_front();
            self.rho.pop_front();
        }
        self.s.push_back(s);
        self.y.push_back(y);
        self.rho.push_back(1.0 / sy);
    }

    /// Two-loop recursion: returns `-H g`.
    fn direction(&self, gradient: &DVector<f64>) -> DVector<f64> {
        let mut q = gradient.clone();
        let mut alphas = vec![0.0; self.s.len()];

        for i in (0..self.s.len()).rev() {
            alphas[i] = self.rho[i] * self.s[i].dot(&q);
            q.axpy(-alphas[i], &self.y[i], 1.0);
        }

        let gamma = match (self.s.back(), self.y.back()) {
            (Some(s), Some(y)) => s.dot(y) / y.dot(y),
            _ => 1.0,
        };
        let mut r = q * gamma;

        for (i, alpha) in alphas.iter().enumerate() {
            let beta = self.rho[i] * self.y[i].dot(&r);
            r.axpy(alpha - beta, &self.s[i], 1.0);
        }

        -r
    }
}

/// Quasi-Newton direction and its slope `gᵀd`. Falls back to steepest
/// descent, dropping the stored pairs, when the direction does not descend.
fn search_direction(memory: &mut Memory, gradient: &DVector<f64>) -> (DVector<f64>, f64) {
    let direction = memory.direction(gradient);
    let slope = gradient.dot(&direction);
    if slope < 0.0 {
        return (direction, slope);
    }
    memory.clear();
    (-gradient, -gradient.dot(gradient))
}

/// Minimises `objective`, which returns the value and gradient at a point.
pub fn minimize<F>(mut objective: F, x0: DVector<f64>, options: &LbfgsOptions) -> Result<LbfgsOutcome>
where
    F: FnMut(&DVector<f64>) -> Result<(f64, DVector<f64>)>,
{
    let mut x = x0;
    let (mut f, mut g) = objective(&x)?;
    let mut evaluations = 1;
    let mut iterations = 0;
    let mut history = Vec::new();
    let mut memory = Memory::new(options.memory);

    let termination = loop {
        if g.amax() <= options.gtol {
            break Termination::GradientTolerance;
        }
        if iterations >= options.max_iter {
            break Termination::MaxIterations;
        }
        if evaluations >= options.max_fun {
            break Termination::MaxEvaluations;
        }

        let (direction, slope) = search_direction(&mut memory, &g);

        let mut step = if memory.is_empty() {
            (1.0 / g.norm()).min(1.0)
        } else {
            1.0
        };

        let mut accepted = None;
        for _ in 0..MAX_LINE_SEARCH_STEPS {
            if evaluations >= options.max_fun {
                break;
            }
            let candidate = &x + &direction * step;
            let (f_new, g_new) = objective(&candidate)?;
            evaluations += 1;

            if f_new.is_finite() && f_new <= f + ARMIJO_C1 * step * slope {
                accepted = Some((candidate, f_new, g_new));
                break;
            }
            step *= BACKTRACK;
        }

        let Some((x_new, f_new, g_new)) = accepted else {
            break if evaluations >= options.max_fun {
                Termination::MaxEvaluations
            } else {
                Termination::LineSearchFailed
            };
        };

        let reduction = (f - f_new) / f.abs().max(f_new.abs()).max(1.0);
        memory.push(&x_new - &x, &g_new - &g);

        x = x_new;
        f = f_new;
        g = g_new;
        iterations += 1;
        history.push(f);

        if reduction <= options.factr * f64::EPSILON {
            break Termination::RelativeReduction;
        }
    };

    tracing::debug!(
        iterations,
        evaluations,
        loss = f,
        "L-BFGS finished: {}",
        termination.describe()
    );

    Ok(LbfgsOutcome {
        x,
        f,
        iterations,
        evaluations,
        termination,
        history,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn rosenbrock(x: &DVector<f64>) -> Result<(f64, DVector<f64>)> {
        let (a, b) = (x[0], x[1]);
        let f = (1.0 - a).powi(2) + 100.0 * (b - a * a).powi(2);
        let g = DVector::from_vec(vec![
            -2.0 * (1.0 - a) - 400.0 * a * (b - a * a),
            200.0 * (b - a * a),
        ]);
        Ok((f, g))
    }

    #[test]
    fn minimizes_rosenbrock() {
        let options = LbfgsOptions {
            gtol: 1e-8,
            factr: 10.0,
            ..LbfgsOptions::default()
        };
        let outcome = minimize(rosenbrock, DVector::from_vec(vec![-1.2, 1.0]), &options).unwrap();

        assert_abs_diff_eq!(outcome.x[0], 1.0, epsilon = 1e-4);
        assert_abs_diff_eq!(outcome.x[1], 1.0, epsilon = 1e-4);
        assert_ne!(outcome.termination, Termination::MaxIterations);
        assert!(outcome.history.windows(2).all(|w| w[1] <= w[0]));
    }

    #[test]
    fn solves_quadratic_quickly() {
        let scales = DVector::from_vec(vec![1.0, 10.0, 100.0]);
        let objective = |x: &DVector<f64>| -> Result<(f64, DVector<f64>)> {
            let g = x.component_mul(&scales);
            Ok((0.5 * x.dot(&g), g))
        };
        let outcome = minimize(
            objective,
            DVector::from_vec(vec![1.0, 1.0, 1.0]),
            &LbfgsOptions::default(),
        )
        .unwrap();

        assert!(outcome.termination.converged());
        assert!(outcome.x.amax() < 1e-3);
        assert!(outcome.iterations < 50);
    }

    #[test]
    fn non_descent_direction_resets_to_steepest_descent() {
        // A pair with negative curvature, which `push` would never store.
        let mut memory = Memory::new(10);
        memory.s.push_back(DVector::from_vec(vec![1.0, 0.0]));
        memory.y.push_back(DVector::from_vec(vec![-1.0, 0.0]));
        memory.rho.push_back(-1.0);

        let gradient = DVector::from_vec(vec![1.0, 0.0]);
        assert!(gradient.dot(&memory.direction(&gradient)) > 0.0);

        let (direction, slope) = search_direction(&mut memory, &gradient);
        assert_eq!(direction, -&gradient);
        assert_abs_diff_eq!(slope, -1.0);
        assert!(memory.is_empty());
    }

    #[test]
    fn curvature_pairs_below_threshold_are_skipped() {
        let mut memory = Memory::new(2);
        memory.push(DVector::from_vec(vec![1.0]), DVector::from_vec(vec![-0.5]));
        assert!(memory.is_empty());

        for k in 1..=3 {
            memory.push(DVector::from_vec(vec![1.0]), DVector::from_vec(vec![f64::from(k)]));
        }
        assert_eq!(memory.s.len(), 2);
        assert_abs_diff_eq!(memory.rho[0], 0.5);
    }

    #[test]
    fn stops_at_max_iter() {
        let options = LbfgsOptions {
            max_iter: 3,
            gtol: 0.0,
            factr: 0.0,
            ..LbfgsOptions::default()
        };
        let outcome = minimize(rosenbrock, DVector::from_vec(vec![-1.2, 1.0]), &options).unwrap();

        assert_eq!(outcome.termination, Termination::MaxIterations);
        assert_eq!(outcome.iterations, 3);
        assert_eq!(outcome.history.len(), 3);
    }

    #[test]
    fn starting_at_optimum_returns_immediately() {
        let outcome = minimize(
            rosenbrock,
            DVector::from_vec(vec![1.0, 1.0]),
            &LbfgsOptions::default(),
        )
        .unwrap();

        assert_eq!(outcome.termination, Termination::GradientTolerance);
        assert_eq!(outcome.iterations, 0);
        assert_eq!(outcome.evaluations, 1);
    }

    #[test]
    fn respects_evaluation_budget() {
        let options = LbfgsOptions {
            max_fun: 5,
            gtol: 0.0,
            factr: 0.0,
            ..LbfgsOptions::default()
        };
        let outcome = minimize(rosenbrock, DVector::from_vec(vec![-1.2, 1.0]), &options).unwrap();

        assert_eq!(outcome.termination, Termination::MaxEvaluations);
        assert!(outcome.evaluations <= 5);
    }
}
