use std::fmt;
use std::str::FromStr;

use ndarray::{Array2, Axis, Zip};
use serde::{Deserialize, Serialize};

/// Non-linearity applied after every affine layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    /// `f(z) = z`
    Identity,
    /// `f(z) = 1 / (1 + exp(-z))`
    Logistic,
    /// `f(z) = tanh(z)`
    Tanh,
    /// `f(z) = max(0, z)`
    #[default]
    Relu,
    /// Row-wise softmax; only used for the output layer of a multiclass
    /// classifier.
    Softmax,
}

impl Activation {
    pub fn apply(self, values: &mut Array2<f64>) {
        match self {
            Self::Identity => {}
            Self::Logistic => values.mapv_inplace(logistic),
            Self::Tanh => values.mapv_inplace(f64::tanh),
            Self::Relu => values.mapv_inplace(|z| z.max(0.0)),
            Self::Softmax => softmax(values),
        }
    }

    /// Multiplies `delta` by the derivative of the activation, written in
    /// terms of the already activated output.
    pub fn derivative_from_output(self, activated: &Array2<f64>, delta: &mut Array2<f64>) {
        match self {
            Self::Identity | Self::Softmax => {}
            Self::Logistic => Zip::from(delta)
                .and(activated)
                .for_each(|d, &z| *d *= z * (1.0 - z)),
            Self::Tanh => Zip::from(delta)
                .and(activated)
                .for_each(|d, &z| *d *= 1.0 - z * z),
            Self::Relu => Zip::from(delta).and(activated).for_each(|d, &z| {
                if z <= 0.0 {
                    *d = 0.0;
                }
            }),
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::Identity => "identity",
            Self::Logistic => "logistic",
            Self::Tanh => "tanh",
            Self::Relu => "relu",
            Self::Softmax => "softmax",
        }
    }
}

impl fmt::Display for Activation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Activation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "identity" => Ok(Self::Identity),
            "logistic" => Ok(Self::Logistic),
            "tanh" => Ok(Self::Tanh),
            "relu" => Ok(Self::Relu),
            "softmax" => Ok(Self::Softmax),
            other => Err(format!("unknown activation {other}")),
        }
    }
}

pub fn logistic(z: f64) -> f64 {
    1.0 / (1.0 + (-z).exp())
}

/// Row-wise softmax, shifted by the row maximum so large logits do not
/// overflow.
pub fn softmax(values: &mut Array2<f64>) {
    for mut row in values.axis_iter_mut(Axis(0)) {
        let max = row.fold(f64::NEG_INFINITY, |acc, &v| acc.max(v));
        row.mapv_inplace(|v| (v - max).exp());
        let sum = row.sum();
        row /= sum;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn softmax_rows_sum_to_one_even_for_large_logits() {
        let mut values = array![[1000.0, 1001.0, 1002.0], [-5.0, 0.0, 5.0]];
        softmax(&mut values);

        for row in values.rows() {
            assert_abs_diff_eq!(row.sum(), 1.0, epsilon = 1e-12);
        }
        assert!(values[[0, 2]] > values[[0, 1]]);
        assert!(values.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn relu_derivative_masks_inactive_units() {
        let activated = array![[0.0, 2.0], [3.0, 0.0]];
        let mut delta = array![[1.0, 1.0], [1.0, 1.0]];
        Activation::Relu.derivative_from_output(&activated, &mut delta);

        assert_eq!(delta, array![[0.0, 1.0], [1.0, 0.0]]);
    }

    #[test]
    fn logistic_and_tanh_derivatives_match_closed_form() {
        let activated = array![[0.5, 0.25]];

        let mut delta = array![[1.0, 2.0]];
        Activation::Logistic.derivative_from_output(&activated, &mut delta);
        assert_abs_diff_eq!(delta[[0, 0]], 0.25);
        assert_abs_diff_eq!(delta[[0, 1]], 2.0 * 0.25 * 0.75);

        let mut delta = array![[1.0, 1.0]];
        Activation::Tanh.derivative_from_output(&activated, &mut delta);
        assert_abs_diff_eq!(delta[[0, 0]], 0.75);
        assert_abs_diff_eq!(delta[[0, 1]], 1.0 - 0.0625);
    }

    #[test]
    fn parses_names() {
        assert_eq!("tanh".parse::<Activation>(), Ok(Activation::Tanh));
        assert!("sigmoid".parse::<Activation>().is_err());
        assert_eq!(Activation::Relu.to_string(), "relu");
    }
}
