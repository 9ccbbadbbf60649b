use std::fmt::Debug;

use ndarray::{Array2, ArrayView2, Axis};
use serde::{Deserialize, Serialize};

use crate::error::{MlpError, Result};

/// One-hot encoding of class labels. Two classes encode to a single 0/1
/// column holding the indicator of the second (greater) class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelBinarizer<L> {
    classes: Vec<L>,
}

impl<L: Ord + Clone + Debug> LabelBinarizer<L> {
    /// Sorted unique labels of `y`.
    pub fn fit(y: &[L]) -> Result<Self> {
        let mut classes = y.to_vec();
        classes.sort();
        classes.dedup();
        Self::from_classes(classes)
    }

    pub fn from_classes(mut classes: Vec<L>) -> Result<Self> {
        classes.sort();
        classes.dedup();
        if classes.len() < 2 {
            return Err(MlpError::SingleClass(classes.len()));
        }
        Ok(Self { classes })
    }

    pub fn classes(&self) -> &[L] {
        &self.classes
    }

    pub fn n_classes(&self) -> usize {
        self.classes.len()
    }

    /// Width of the encoded matrix.
    pub fn n_columns(&self) -> usize {
        if self.classes.len() == 2 {
            1
        } else {
            self.classes.len()
        }
    }

    pub fn index_of(&self, label: &L) -> Result<usize> {
        self.classes
            .binary_search(label)
            .map_err(|_| MlpError::UnknownLabel(format!("{label:?}")))
    }

    pub fn transform(&self, y: &[L]) -> Result<Array2<f64>> {
        let mut encoded = Array2::zeros((y.len(), self.n_columns()));
        let binary = self.classes.len() == 2;

        for (row, label) in y.iter().enumerate() {
            let index = self.index_of(label)?;
            if binary {
                encoded[[row, 0]] = index as f64;
            } else {
                encoded[[row, index]] = 1.0;
            }
        }
        Ok(encoded)
    }

    /// Picks the most likely class per row of a score matrix shaped like the
    /// output of [`LabelBinarizer::transform`].
    pub fn inverse_transform(&self, scores: ArrayView2<f64>, threshold: f64) -> Vec<L> {
        if scores.ncols() == 1 {
            return scores
                .column(0)
                .iter()
                .map(|&p| self.classes[usize::from(p > threshold)].clone())
                .collect();
        }

        scores
            .axis_iter(Axis(0))
            .map(|row| {
                let best = row
                    .iter()
                    .enumerate()
                    .fold((0, f64::NEG_INFINITY), |best, (i, &v)| {
                        if v > best.1 {
                            (i, v)
                        } else {
                            best
                        }
                    })
                    .0;
                self.classes[best].clone()
            })
            .collect()
    }
}
