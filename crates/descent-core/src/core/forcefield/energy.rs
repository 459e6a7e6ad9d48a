use super::potentials::{FunctionalForm, TermDerivatives};
use super::vectorized::{HandlerKey, ParameterCotangents, VectorizedSystem};
use crate::core::geometry::{GeometryError, InternalCoordinate};
use nalgebra::{DMatrix, Point3, Vector3};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvaluationMode {
    Energies,
    EnergiesAndGradients,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EvaluationError {
    #[error("Conformer {conformer} has {found} atoms, expected {expected}")]
    ConformerShape {
        conformer: usize,
        expected: usize,
        found: usize,
    },
    #[error("System references particle {index} but conformers only contain {n_atoms} atoms")]
    ParticleOutOfRange { index: usize, n_atoms: usize },
    #[error("Expected a {name} cotangent of shape {expected:?}, found {found:?}")]
    CotangentShape {
        name: &'static str,
        expected: (usize, usize),
        found: (usize, usize),
    },
    #[error(transparent)]
    Geometry(#[from] GeometryError),
}

#[derive(Debug, Clone, PartialEq)]
struct TermRecord {
    derivatives: TermDerivatives,
    coordinate_gradient: Vec<(usize, Vector3<f64>)>,
}

/// Energies (and optionally Cartesian gradients) of a batch of conformers.
///
/// The per-term derivatives computed during the forward pass are retained so
/// that [`Evaluation::backward`] can map cotangents of the outputs onto the
/// parameter matrices of the evaluated system.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    energies: DMatrix<f64>,
    gradients: Option<DMatrix<f64>>,
    n_atoms: usize,
    terms: BTreeMap<HandlerKey, Vec<Vec<TermRecord>>>,
    cotangent_template: ParameterCotangents,
}

impl Evaluation {
    /// Shape `(n_conformers, 1)`.
    pub fn energies(&self) -> &DMatrix<f64> {
        &self.energies
    }

    /// Shape `(n_conformers, 3 * n_atoms)`, atom-major `x, y, z`.
    pub fn gradients(&self) -> Option<&DMatrix<f64>> {
        self.gradients.as_ref()
    }

    pub fn n_conformers(&self) -> usize {
        self.energies.nrows()
    }

    pub fn n_atoms(&self) -> usize {
        self.n_atoms
    }

    /// Pulls cotangents of the energies and/or gradients back onto every
    /// parameter matrix of the evaluated system.
    pub fn backward(
        &self,
        energy_cotangent: Option<&DMatrix<f64>>,
        gradient_cotangent: Option<&DMatrix<f64>>,
    ) -> Result<ParameterCotangents, EvaluationError> {
        let n_conformers = self.n_conformers();
        if let Some(cotangent) = energy_cotangent {
            check_shape("energy", cotangent, (n_conformers, 1))?;
        }
        if let Some(cotangent) = gradient_cotangent {
            check_shape("gradient", cotangent, (n_conformers, 3 * self.n_atoms))?;
        }

        let mut cotangents = self.cotangent_template.clone();
        for (key, conformers) in &self.terms {
            let Some(cotangent) = cotangents.get_mut(key) else {
                continue;
            };
            for (conformer, records) in conformers.iter().enumerate() {
                let energy_weight = energy_cotangent.map_or(0.0, |e| e[(conformer, 0)]);

                for (row, record) in records.iter().enumerate() {
                    let coordinate_weight = gradient_cotangent.map_or(0.0, |g| {
                        record
                            .coordinate_gradient
                            .iter()
                            .map(|(atom, d)| {
                                (0..3)
                                    .map(|axis| g[(conformer, 3 * atom + axis)] * d[axis])
                                    .sum::<f64>()
                            })
                            .sum()
                    });

                    for column in 0..cotangent.ncols() {
                        cotangent[(row, column)] += energy_weight
                            * record.derivatives.d_energy_d_parameters[column]
                            + coordinate_weight
                                * record.derivatives.d2_energy_d_coordinate_d_parameters[column];
                    }
                }
            }
        }
        Ok(cotangents)
    }
}

fn check_shape(
    name: &'static str,
    matrix: &DMatrix<f64>,
    expected: (usize, usize),
) -> Result<(), EvaluationError> {
    if matrix.shape() != expected {
        return Err(EvaluationError::CotangentShape {
            name,
            expected,
            found: matrix.shape(),
        });
    }
    Ok(())
}

fn internal_coordinate(form: FunctionalForm, particles: &[usize]) -> InternalCoordinate {
    match (form, particles) {
        (FunctionalForm::HarmonicBond, &[i, j]) => InternalCoordinate::Distance(i, j),
        (FunctionalForm::HarmonicAngle, &[i, j, k]) => InternalCoordinate::Angle(i, j, k),
        (FunctionalForm::PeriodicTorsion, &[i, j, k, l]) => InternalCoordinate::Dihedral(i, j, k, l),
        _ => unreachable!("vectorized handlers validate the arity of their terms"),
    }
}

/// Evaluates every term of `system` for each conformer.
///
/// All conformers must contain the same number of atoms, which must cover
/// every particle index referenced by the system.
pub fn evaluate(
    system: &VectorizedSystem,
    conformers: &[Vec<Point3<f64>>],
    mode: EvaluationMode,
) -> Result<Evaluation, EvaluationError> {
    let n_atoms = conformers.first().map_or(0, Vec::len);
    if let Some((conformer, positions)) = conformers
        .iter()
        .enumerate()
        .find(|(_, positions)| positions.len() != n_atoms)
    {
        return Err(EvaluationError::ConformerShape {
            conformer,
            expected: n_atoms,
            found: positions.len(),
        });
    }
    let required = system.particle_count();
    if !conformers.is_empty() && required > n_atoms {
        return Err(EvaluationError::ParticleOutOfRange {
            index: required - 1,
            n_atoms,
        });
    }

    let n_conformers = conformers.len();
    let mut energies = DMatrix::<f64>::zeros(n_conformers, 1);
    let mut gradients = DMatrix::<f64>::zeros(n_conformers, 3 * n_atoms);
    let mut terms = BTreeMap::new();

    for (key, handler) in system {
        let form = handler.form();
        let coordinates: Vec<InternalCoordinate> = handler
            .particle_indices()
            .iter()
            .map(|particles| internal_coordinate(form, particles))
            .collect();
        let parameter_rows: Vec<Vec<f64>> = handler
            .parameters()
            .row_iter()
            .map(|row| row.iter().copied().collect())
            .collect();

        let mut per_conformer = Vec::with_capacity(n_conformers);
        for (conformer, positions) in conformers.iter().enumerate() {
            let mut records = Vec::with_capacity(coordinates.len());
            for (coordinate, parameters) in coordinates.iter().zip(&parameter_rows) {
                let (value, coordinate_gradient) = coordinate.evaluate(positions)?;
                let derivatives = form.evaluate(value, parameters);

                energies[(conformer, 0)] += derivatives.energy;
                for (atom, d) in &coordinate_gradient {
                    for axis in 0..3 {
                        gradients[(conformer, 3 * atom + axis)] +=
                            derivatives.d_energy_d_coordinate * d[axis];
                    }
                }
                records.push(TermRecord {
                    derivatives,
                    coordinate_gradient,
                });
            }
            per_conformer.push(records);
        }
        trace!(
            "Evaluated {} '{}' term(s) over {} conformer(s).",
            handler.len(),
            key.0,
            n_conformers
        );
        terms.insert(*key, per_conformer);
    }

    Ok(Evaluation {
        energies,
        gradients: (mode == EvaluationMode::EnergiesAndGradients).then_some(gradients),
        n_atoms,
        terms,
        cotangent_template: ParameterCotangents::zeros_like(system),
    })
}
