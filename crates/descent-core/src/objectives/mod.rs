//! # Objectives
//!
//! Scalar training targets that are differentiable with respect to a parameter delta.
//!
//! ## Overview
//!
//! An [`ObjectiveContribution`] maps `(parameter delta, parameter ids)` onto a [`Loss`]
//! that carries both the scalar value and its gradient with respect to the delta.
//! Contributions are independent of each other, so a combined target is simply the
//! sum of its parts and gradients accumulate through [`Loss`] addition.
//!
//! - [`energy`] - Fits energies and coordinate gradients of a batch of conformers
//! - [`config`] - Serializable transform, metric and weight selections

pub mod config;
pub mod energy;

use crate::core::forcefield::energy::EvaluationError;
use crate::core::forcefield::ids::ParameterId;
use crate::metrics::MetricError;
use crate::models::ModelError;
use crate::transforms::TransformError;
use nalgebra::DVector;
use std::iter::Sum;
use std::ops::{Add, AddAssign};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ObjectiveError {
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error(transparent)]
    Evaluation(#[from] EvaluationError),
    #[error(transparent)]
    Transform(#[from] TransformError),
    #[error(transparent)]
    Metric(#[from] MetricError),
    #[error("Cannot add a loss gradient of length {found} to one of length {expected}")]
    GradientLength { expected: usize, found: usize },
}

/// A loss value together with its gradient with respect to the parameter delta.
///
/// The default loss is zero with an empty gradient and acts as the identity of
/// addition. Use [`Loss::try_add`] when the gradient lengths are not known to agree;
/// the operator impls panic on a mismatch.
#[derive(Debug, Clone, PartialEq)]
pub struct Loss {
    pub value: f64,
    pub gradient: DVector<f64>,
}

impl Loss {
    pub fn new(value: f64, gradient: DVector<f64>) -> Self {
        Self { value, gradient }
    }

    pub fn zeros(n_parameters: usize) -> Self {
        Self::new(0.0, DVector::zeros(n_parameters))
    }

    /// Adds `rhs`, failing if both gradients are non-empty and differ in length.
    pub fn try_add(mut self, rhs: Self) -> Result<Self, ObjectiveError> {
        if !self.gradient.is_empty()
            && !rhs.gradient.is_empty()
            && self.gradient.len() != rhs.gradient.len()
        {
            return Err(ObjectiveError::GradientLength {
                expected: self.gradient.len(),
                found: rhs.gradient.len(),
            });
        }
        self += rhs;
        Ok(self)
    }
}

impl Default for Loss {
    fn default() -> Self {
        Self::zeros(0)
    }
}

impl Add for Loss {
    type Output = Self;

    fn add(mut self, rhs: Self) -> Self::Output {
        self += rhs;
        self
    }
}

impl AddAssign for Loss {
    fn add_assign(&mut self, rhs: Self) {
        self.value += rhs.value;
        if self.gradient.is_empty() {
            self.gradient = rhs.gradient;
        } else if !rhs.gradient.is_empty() {
            debug_assert_eq!(self.gradient.len(), rhs.gradient.len());
            self.gradient += rhs.gradient;
        }
    }
}

impl Sum for Loss {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::default(), Add::add)
    }
}

pub trait ObjectiveContribution {
    fn evaluate(
        &self,
        parameter_delta: &DVector<f64>,
        parameter_ids: &[ParameterId],
    ) -> Result<Loss, ObjectiveError>;
}

impl<T: ObjectiveContribution> ObjectiveContribution for [T] {
    fn evaluate(
        &self,
        parameter_delta: &DVector<f64>,
        parameter_ids: &[ParameterId],
    ) -> Result<Loss, ObjectiveError> {
        self.iter().try_fold(Loss::default(), |total, contribution| {
            total.try_add(contribution.evaluate(parameter_delta, parameter_ids)?)
        })
    }
}

impl<T: ObjectiveContribution> ObjectiveContribution for Vec<T> {
    fn evaluate(
        &self,
        parameter_delta: &DVector<f64>,
        parameter_ids: &[ParameterId],
    ) -> Result<Loss, ObjectiveError> {
        self.as_slice().evaluate(parameter_delta, parameter_ids)
    }
}
