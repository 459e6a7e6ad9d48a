//! # Force Field Module
//!
//! Representation and evaluation of valence force fields whose parameters are keyed
//! by chemical patterns.
//!
//! ## Overview
//!
//! A force field enters the library as a [`params::ParameterSet`], either built in
//! code or loaded from TOML. Together with a [`vectorized::Topology`] that lists which
//! pattern was assigned to each bond, angle and torsion, it is flattened by
//! [`vectorized::vectorize_system`] into one parameter matrix per handler. Those
//! matrices are what training perturbs.
//!
//! ## Key Components
//!
//! - [`ids`] - Handler types, potential keys and trainable parameter ids
//! - [`units`] - Unit parsing and conversion into the internal unit system
//! - [`params`] - The full parameter set with per-attribute units
//! - [`potentials`] - Functional forms and their first and mixed derivatives
//! - [`vectorized`] - Batched per-handler parameter matrices and their cotangents
//! - [`energy`] - Energies and Cartesian gradients of conformer batches with a reverse pass
//!
//! ```ignore
//! use descent::core::forcefield::energy::{evaluate, EvaluationMode};
//! use descent::core::forcefield::vectorized::vectorize_system;
//!
//! let system = vectorize_system(&parameter_set, &topology)?;
//! let evaluation = evaluate(&system, &conformers, EvaluationMode::EnergiesAndGradients)?;
//! let cotangents = evaluation.backward(Some(&energy_cotangent), None)?;
//! ```

pub mod energy;
pub mod ids;
pub mod params;
pub mod potentials;
pub mod units;
pub mod vectorized;
