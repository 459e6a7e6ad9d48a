//! # Parameterization Models
//!
//! A parameterization model owns a flat vector of trainable adjustments (the
//! *parameter delta*) and knows how to apply it to a vectorized system.
//!
//! ## Overview
//!
//! Each entry of the delta is tied to one [`ParameterId`], i.e. one attribute of one
//! pattern of one handler. [`ParameterizationModel::forward`] produces a perturbed copy
//! of a system, and [`ParameterizationModel::backward`] maps derivatives with respect to
//! the perturbed parameter matrices back onto the delta. Optionally the delta lives in a
//! latent space and is mapped onto parameter space by a [`CovarianceTransform`].
//!
//! - [`smirnoff`] - The model for SMIRNOFF-style, pattern-keyed valence parameters

pub mod smirnoff;

use crate::core::forcefield::ids::ParameterId;
use crate::core::forcefield::params::ParameterSet;
use crate::core::forcefield::vectorized::{ParameterCotangents, VectorizedSystem};
use nalgebra::{DMatrix, DVector};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Clone)]
pub enum ModelError {
    #[error("Parameter {0} was provided more than once")]
    DuplicateParameter(ParameterId),
    #[error("Parameter {0} is not defined by the reference parameter set")]
    UnknownParameter(ParameterId),
    #[error("Expected {name} of length {expected}, found {found}")]
    ShapeMismatch {
        name: &'static str,
        expected: usize,
        found: usize,
    },
    #[error("This operation requires a reference parameter set but none was provided")]
    MissingReference,
}

/// How the trainable delta maps onto the per-parameter adjustments.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum CovarianceTransform {
    #[default]
    Identity,
    /// Effective delta is `matrix * delta`, with one row per trainable parameter.
    Matrix(DMatrix<f64>),
}

impl CovarianceTransform {
    /// Checks that this transform produces `n_parameters` adjustments.
    pub fn validate(&self, n_parameters: usize) -> Result<(), ModelError> {
        match self {
            Self::Matrix(matrix) if matrix.nrows() != n_parameters => {
                Err(ModelError::ShapeMismatch {
                    name: "covariance transform rows",
                    expected: n_parameters,
                    found: matrix.nrows(),
                })
            }
            _ => Ok(()),
        }
    }

    /// The length of the trainable delta for `n_parameters` adjustments.
    pub fn latent_dimension(&self, n_parameters: usize) -> usize {
        match self {
            Self::Identity => n_parameters,
            Self::Matrix(matrix) => matrix.ncols(),
        }
    }

    pub fn apply(&self, delta: &DVector<f64>) -> DVector<f64> {
        match self {
            Self::Identity => delta.clone(),
            Self::Matrix(matrix) => matrix * delta,
        }
    }

    /// Maps a gradient with respect to the effective delta onto the latent delta.
    pub fn backward(&self, gradient: &DVector<f64>) -> DVector<f64> {
        match self {
            Self::Identity => gradient.clone(),
            Self::Matrix(matrix) => matrix.tr_mul(gradient),
        }
    }
}

/// Which label [`ParameterizationModel::summarise`] uses for each parameter row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParameterIdType {
    /// The `id` of the parameter in the reference set.
    Id,
    #[default]
    Smirks,
}

pub trait ParameterizationModel {
    /// The trainable parameters, in the order of [`ParameterizationModel::parameter_delta`].
    fn parameter_delta_ids(&self) -> &[ParameterId];

    fn parameter_delta(&self) -> &DVector<f64>;

    fn set_parameter_delta(&mut self, delta: DVector<f64>) -> Result<(), ModelError>;

    /// A copy of `system` with the current delta added to every trainable parameter.
    fn forward(&self, system: &VectorizedSystem) -> VectorizedSystem;

    /// The gradient with respect to the parameter delta, given cotangents of the
    /// parameter matrices produced by [`ParameterizationModel::forward`].
    fn backward(&self, system: &VectorizedSystem, cotangents: &ParameterCotangents)
    -> DVector<f64>;

    /// The reference parameter set with the current delta applied.
    fn to_parameter_set(&self) -> Result<ParameterSet, ModelError>;

    /// A human readable table of the current delta, in native parameter units.
    fn summarise(&self, id_type: ParameterIdType) -> Result<String, ModelError>;
}
