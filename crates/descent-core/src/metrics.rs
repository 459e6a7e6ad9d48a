//! Reductions of a (prediction, reference) pair onto a scalar loss.

use nalgebra::DMatrix;
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum MetricError {
    #[error("Prediction has shape {prediction:?} but reference has shape {reference:?}")]
    ShapeMismatch {
        prediction: (usize, usize),
        reference: (usize, usize),
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Metric {
    /// Mean of squared element-wise differences.
    #[default]
    Mse,
    /// Mean of absolute element-wise differences.
    Mae,
}

pub fn mse() -> Metric {
    Metric::Mse
}

pub fn mae() -> Metric {
    Metric::Mae
}

impl Metric {
    /// Returns the loss together with its derivative with respect to `prediction`.
    ///
    /// The mean runs over every element, so empty inputs contribute a loss of zero.
    pub fn evaluate(
        &self,
        prediction: &DMatrix<f64>,
        reference: &DMatrix<f64>,
    ) -> Result<(f64, DMatrix<f64>), MetricError> {
        if prediction.shape() != reference.shape() {
            return Err(MetricError::ShapeMismatch {
                prediction: prediction.shape(),
                reference: reference.shape(),
            });
        }
        if prediction.is_empty() {
            return Ok((0.0, DMatrix::zeros(prediction.nrows(), prediction.ncols())));
        }

        let count = prediction.len() as f64;
        let residual = prediction - reference;
        let result = match self {
            Self::Mse => (
                residual.norm_squared() / count,
                residual * (2.0 / count),
            ),
            Self::Mae => (
                residual.iter().map(|r| r.abs()).sum::<f64>() / count,
                residual.map(|r| if r == 0.0 { 0.0 } else { r.signum() / count }),
            ),
        };
        Ok(result)
    }
}
