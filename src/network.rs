//! Feedforward network parameters, forward pass and backpropagation.

use nalgebra::DVector;
use ndarray::{Array1, Array2, ArrayView2, ArrayViewD, ArrayViewMutD, Axis};
use rand::distributions::{Distribution, Uniform};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::activation::Activation;
use crate::error::{MlpError, Result};
use crate::loss::LossKind;

/// Weights and intercepts of a fully connected network.
///
/// `coefs[i]` has shape `(layer_sizes[i], layer_sizes[i + 1])`, so a batch
/// of samples stored row-wise is propagated with `a · W + b`. Deserialised
/// networks go through [`Network::from_parts`], so shapes always chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "NetworkParts")]
pub struct Network {
    coefs: Vec<Array2<f64>>,
    intercepts: Vec<Array1<f64>>,
    hidden_activation: Activation,
    output_activation: Activation,
}

#[derive(Deserialize)]
struct NetworkParts {
    coefs: Vec<Array2<f64>>,
    intercepts: Vec<Array1<f64>>,
    hidden_activation: Activation,
    output_activation: Activation,
}

impl TryFrom<NetworkParts> for Network {
    type Error = MlpError;

    fn try_from(parts: NetworkParts) -> Result<Self> {
        Self::from_parts(
            parts.coefs,
            parts.intercepts,
            parts.hidden_activation,
            parts.output_activation,
        )
    }
}

/// Gradients of the objective, shaped like the network parameters.
#[derive(Debug, Clone)]
pub struct Gradients {
    pub coefs: Vec<Array2<f64>>,
    pub intercepts: Vec<Array1<f64>>,
}

impl Gradients {
    /// Coefficient gradients followed by intercept gradients, in the order of
    /// [`Network::params_mut`].
    pub fn views(&self) -> Vec<ArrayViewD<'_, f64>> {
        self.coefs
            .iter()
            .map(|c| c.view().into_dyn())
            .chain(self.intercepts.iter().map(|b| b.view().into_dyn()))
            .collect()
    }

    pub fn pack(&self) -> DVector<f64> {
        let len = self.coefs.iter().map(Array2::len).sum::<usize>()
            + self.intercepts.iter().map(Array1::len).sum::<usize>();
        DVector::from_iterator(
            len,
            self.coefs
                .iter()
                .flat_map(|c| c.iter().copied())
                .chain(self.intercepts.iter().flat_map(|b| b.iter().copied())),
        )
    }
}

impl Network {
    /// Glorot-uniform initialisation. The bound is
    /// `sqrt(factor / (fan_in + fan_out))` with factor 2 for logistic hidden
    /// units and 6 otherwise.
    pub fn initialize<R: Rng + ?Sized>(
        layer_sizes: &[usize],
        hidden_activation: Activation,
        output_activation: Activation,
        rng: &mut R,
    ) -> Self {
        let factor = if hidden_activation == Activation::Logistic {
            2.0
        } else {
            6.0
        };

        let mut coefs = Vec::with_capacity(layer_sizes.len().saturating_sub(1));
        let mut intercepts = Vec::with_capacity(layer_sizes.len().saturating_sub(1));

        for pair in layer_sizes.windows(2) {
            let (fan_in, fan_out) = (pair[0], pair[1]);
            let bound = (factor / (fan_in + fan_out) as f64).sqrt();
            let distribution = Uniform::new_inclusive(-bound, bound);

            coefs.push(Array2::from_shape_fn((fan_in, fan_out), |_| {
                distribution.sample(rng)
            }));
            intercepts.push(Array1::from_shape_fn(fan_out, |_| distribution.sample(rng)));
        }

        Self {
            coefs,
            intercepts,
            hidden_activation,
            output_activation,
        }
    }

    pub fn from_parts(
        coefs: Vec<Array2<f64>>,
        intercepts: Vec<Array1<f64>>,
        hidden_activation: Activation,
        output_activation: Activation,
    ) -> Result<Self> {
        if coefs.is_empty() || coefs.len() != intercepts.len() {
            return Err(MlpError::invalid(
                "coefs",
                "needs one intercept vector per weight matrix",
            ));
        }
        for (i, (w, b)) in coefs.iter().zip(&intercepts).enumerate() {
            if w.ncols() != b.len() {
                return Err(MlpError::invalid(
                    "intercepts",
                    format!("layer {i} has {} units but {} intercepts", w.ncols(), b.len()),
                ));
            }
            if let Some(next) = coefs.get(i + 1) {
                if next.nrows() != w.ncols() {
                    return Err(MlpError::invalid(
                        "coefs",
                        format!("layer {} expects {} inputs, got {}", i + 1, next.nrows(), w.ncols()),
                    ));
                }
            }
        }

        Ok(Self {
            coefs,
            intercepts,
            hidden_activation,
            output_activation,
        })
    }

    pub fn coefs(&self) -> &[Array2<f64>] {
        &self.coefs
    }

    pub fn intercepts(&self) -> &[Array1<f64>] {
        &self.intercepts
    }

    pub fn hidden_activation(&self) -> Activation {
        self.hidden_activation
    }

    pub fn output_activation(&self) -> Activation {
        self.output_activation
    }

    pub fn n_features(&self) -> usize {
        self.coefs.first().map_or(0, Array2::nrows)
    }

    pub fn n_outputs(&self) -> usize {
        self.coefs.last().map_or(0, Array2::ncols)
    }

    /// Number of layers including input and output.
    pub fn n_layers(&self) -> usize {
        self.coefs.len() + 1
    }

    pub fn layer_sizes(&self) -> Vec<usize> {
        std::iter::once(self.n_features())
            .chain(self.coefs.iter().map(Array2::ncols))
            .collect()
    }

    pub fn n_params(&self) -> usize {
        self.coefs.iter().map(Array2::len).sum::<usize>()
            + self.intercepts.iter().map(Array1::len).sum::<usize>()
    }

    pub fn check_features(&self, x: &ArrayView2<f64>) -> Result<()> {
        if x.ncols() == self.n_features() {
            Ok(())
        } else {
            Err(MlpError::FeatureMismatch {
                expected: self.n_features(),
                got: x.ncols(),
            })
        }
    }

    /// Activations of every layer, the input included.
    pub fn forward(&self, x: ArrayView2<f64>) -> Result<Vec<Array2<f64>>> {
        self.check_features(&x)?;

        let mut activations = Vec::with_capacity(self.n_layers());
        activations.push(x.to_owned());

        let last = self.coefs.len() - 1;
        for (i, (w, b)) in self.coefs.iter().zip(&self.intercepts).enumerate() {
            let mut z = activations[i].dot(w);
            z += b;

            let activation = if i == last {
                self.output_activation
            } else {
                self.hidden_activation
            };
            activation.apply(&mut z);
            activations.push(z);
        }

        Ok(activations)
    }

    /// Output layer activations.
    pub fn predict_raw(&self, x: ArrayView2<f64>) -> Result<Array2<f64>> {
        let mut activations = self.forward(x)?;
        Ok(activations.pop().unwrap_or_default())
    }

    /// Objective value and its gradients by backpropagation.
    ///
    /// The objective is the data loss plus `0.5 * alpha * Σ ||W||² / n`.
    /// Intercepts are not penalised.
    pub fn loss_and_gradients(
        &self,
        x: ArrayView2<f64>,
        y: ArrayView2<f64>,
        alpha: f64,
        loss_kind: LossKind,
    ) -> Result<(f64, Gradients)> {
        if x.nrows() != y.nrows() {
            return Err(MlpError::SampleMismatch {
                features: x.nrows(),
                targets: y.nrows(),
            });
        }
        if x.nrows() == 0 {
            return Err(MlpError::EmptyInput);
        }

        let n_samples = x.nrows() as f64;
        let activations = self.forward(x)?;
        let output = &activations[activations.len() - 1];

        let penalty: f64 = self
            .coefs
            .iter()
            .map(|w| w.iter().map(|v| v * v).sum::<f64>())
            .sum();
        let loss = loss_kind.evaluate(y, output.view()) + 0.5 * alpha * penalty / n_samples;

        let n_weight_layers = self.coefs.len();
        let mut coef_grads = Vec::with_capacity(n_weight_layers);
        let mut intercept_grads = Vec::with_capacity(n_weight_layers);

        let mut delta = output - &y;
        for layer in (0..n_weight_layers).rev() {
            let coef_grad =
                (activations[layer].t().dot(&delta) + alpha * &self.coefs[layer]) / n_samples;
            let intercept_grad = delta.sum_axis(Axis(0)) / n_samples;
            coef_grads.push(coef_grad);
            intercept_grads.push(intercept_grad);

            if layer > 0 {
                let mut previous = delta.dot(&self.coefs[layer].t());
                self.hidden_activation
                    .derivative_from_output(&activations[layer], &mut previous);
                delta = previous;
            }
        }

        coef_grads.reverse();
        intercept_grads.reverse();

        Ok((
            loss,
            Gradients {
                coefs: coef_grads,
                intercepts: intercept_grads,
            },
        ))
    }

    /// Mutable views of every parameter array: coefficients first, then
    /// intercepts.
    pub fn params_mut(&mut self) -> Vec<ArrayViewMutD<'_, f64>> {
        self.coefs
            .iter_mut()
            .map(|c| c.view_mut().into_dyn())
            .chain(self.intercepts.iter_mut().map(|b| b.view_mut().into_dyn()))
            .collect()
    }

    /// All parameters as one flat vector.
    pub fn pack(&self) -> DVector<f64> {
        DVector::from_iterator(
            self.n_params(),
            self.coefs
                .iter()
                .flat_map(|c| c.iter().copied())
                .chain(self.intercepts.iter().flat_map(|b| b.iter().copied())),
        )
    }

    /// Inverse of [`Network::pack`].
    pub fn unpack(&mut self, packed: &DVector<f64>) -> Result<()> {
        if packed.len() != self.n_params() {
            return Err(MlpError::invalid(
                "packed",
                format!("expected {} parameters, got {}", self.n_params(), packed.len()),
            ));
        }

        let mut values = packed.iter().copied();
        for param in self.params_mut() {
            for (dst, src) in param.into_iter().zip(&mut values) {
                *dst = src;
            }
        }
        Ok(())
    }
}
