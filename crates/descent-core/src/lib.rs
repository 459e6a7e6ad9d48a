//! # descent
//!
//! Differentiable training of valence force-field parameters against reference
//! energies and gradients.
//!
//! ## Architectural Philosophy
//!
//! The library is split into layers with a strict dependency direction:
//!
//! - **[`core`]: The Foundation.** Stateless data models of a force field
//!   (`ParameterSet`, `VectorizedSystem`), functional forms with their analytic
//!   derivatives, physical units and internal-coordinate geometry.
//!
//! - **[`models`]: Parameterization.** Maps a flat, trainable parameter delta onto a
//!   vectorized system and back onto a full parameter set, including the reverse
//!   pass that turns parameter-matrix cotangents into a gradient on the delta.
//!
//! - **[`objectives`]: Training Targets.** Scalar losses that are differentiable with
//!   respect to the parameter delta, built from [`transforms`] and [`metrics`].
//!
//! A training driver owns the delta vector, calls
//! [`ObjectiveContribution::evaluate`](objectives::ObjectiveContribution::evaluate)
//! and applies whatever update rule it likes to the returned gradient.

pub mod core;
pub mod metrics;
pub mod models;
pub mod objectives;
pub mod transforms;
