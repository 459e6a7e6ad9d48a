//! Transforms applied identically to reference and predicted values before they
//! are compared by a [`Metric`](crate::metrics::Metric).
//!
//! Inputs are matrices with one row per conformer.

use nalgebra::DMatrix;
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum TransformError {
    #[error("Reference index {index} is out of range for {conformers} conformer(s)")]
    IndexOutOfRange { index: usize, conformers: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Transform {
    #[default]
    Identity,
    /// Values relative to those of the conformer at `index`.
    Relative {
        #[serde(default)]
        index: usize,
    },
}

pub fn identity() -> Transform {
    Transform::Identity
}

pub fn relative(index: usize) -> Transform {
    Transform::Relative { index }
}

impl Transform {
    /// Fails if this transform cannot be applied to `conformers` rows.
    pub fn validate(&self, conformers: usize) -> Result<(), TransformError> {
        match *self {
            Self::Identity => Ok(()),
            Self::Relative { index } if index < conformers => Ok(()),
            Self::Relative { index } => Err(TransformError::IndexOutOfRange { index, conformers }),
        }
    }

    pub fn apply(&self, values: &DMatrix<f64>) -> Result<DMatrix<f64>, TransformError> {
        self.validate(values.nrows())?;
        match *self {
            Self::Identity => Ok(values.clone()),
            Self::Relative { index } => {
                let reference = values.row(index).clone_owned();
                let mut relative = values.clone();
                for mut row in relative.row_iter_mut() {
                    row -= &reference;
                }
                Ok(relative)
            }
        }
    }

    /// The vector-Jacobian product of [`Transform::apply`] for a cotangent of its output.
    pub fn backward(&self, cotangent: &DMatrix<f64>) -> Result<DMatrix<f64>, TransformError> {
        self.validate(cotangent.nrows())?;
        match *self {
            Self::Identity => Ok(cotangent.clone()),
            Self::Relative { index } => {
                let total = cotangent.row_sum();
                let mut input = cotangent.clone();
                let mut reference = input.row_mut(index);
                reference -= total;
                Ok(input)
            }
        }
    }
}
