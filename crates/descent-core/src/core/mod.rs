//! # Core Module
//!
//! Stateless building blocks shared by the parameterization and objective layers.
//!
//! - **Force Field** ([`forcefield`]) - Parameter identifiers, units, parameter sets,
//!   functional forms, the vectorized system and its energy evaluator
//! - **Geometry** ([`geometry`]) - Internal coordinates, Wilson B-matrix rows and the
//!   redundant internal coordinate gradient projection
//!
//! All values that cross module boundaries are expressed in the internal unit
//! system: kJ/mol for energies, Å for lengths and radians for angles.

pub mod forcefield;
pub mod geometry;
