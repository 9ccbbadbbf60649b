use ndarray::{Array1, Array2, ArrayView2, Axis};
use serde::{Deserialize, Serialize};

use crate::error::{MlpError, Result};

/// Per-feature z-score normalisation. MLPs are sensitive to feature
/// scaling, so inputs should usually pass through this first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StandardScaler {
    mean: Array1<f64>,
    scale: Array1<f64>,
}

impl StandardScaler {
    pub fn fit(x: ArrayView2<f64>) -> Result<Self> {
        if x.nrows() == 0 {
            return Err(MlpError::EmptyInput);
        }

        let mean = x.mean_axis(Axis(0)).ok_or(MlpError::EmptyInput)?;
        // Constant features keep their values, only shifted.
        let scale = x
            .std_axis(Axis(0), 0.0)
            .mapv(|std| if std > 0.0 { std } else { 1.0 });

        Ok(Self { mean, scale })
    }

    pub fn mean(&self) -> &Array1<f64> {
        &self.mean
    }

    pub fn scale(&self) -> &Array1<f64> {
        &self.scale
    }

    fn check(&self, x: &ArrayView2<f64>) -> Result<()> {
        if x.ncols() == self.mean.len() {
            Ok(())
        } else {
            Err(MlpError::FeatureMismatch {
                expected: self.mean.len(),
                got: x.ncols(),
            })
        }
    }

    pub fn transform(&self, x: ArrayView2<f64>) -> Result<Array2<f64>> {
        self.check(&x)?;
        Ok((&x - &self.mean) / &self.scale)
    }

    pub fn fit_transform(x: ArrayView2<f64>) -> Result<(Self, Array2<f64>)> {
        let scaler = Self::fit(x)?;
        let transformed = scaler.transform(x)?;
        Ok((scaler, transformed))
    }

    pub fn inverse_transform(&self, x: ArrayView2<f64>) -> Result<Array2<f64>> {
        self.check(&x)?;
        Ok(&x * &self.scale + &self.mean)
    }
}
