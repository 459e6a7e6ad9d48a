//! Internal coordinates and their derivatives with respect to Cartesian positions.
//!
//! The derivative rows returned here are the rows of the Wilson B-matrix,
//! `B[q, 3a + x] = dq / d(r_a)_x`. They are used both by the energy evaluator
//! (chain rule from `dE/dq` to Cartesian gradients) and to project Cartesian
//! gradients onto a set of redundant internal coordinates.

use itertools::Itertools;
use nalgebra::{DMatrix, Point3, Vector3};
use std::collections::BTreeSet;
use thiserror::Error;

const DEGENERACY_TOLERANCE: f64 = 1e-10;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GeometryError {
    #[error("Internal coordinate references particle {index} but only {n_atoms} positions were given")]
    ParticleOutOfRange { index: usize, n_atoms: usize },
    #[error("Failed to invert the internal coordinate metric: {0}")]
    Singular(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum InternalCoordinate {
    Distance(usize, usize),
    Angle(usize, usize, usize),
    Dihedral(usize, usize, usize, usize),
}

impl InternalCoordinate {
    pub fn particles(&self) -> Vec<usize> {
        match *self {
            Self::Distance(i, j) => vec![i, j],
            Self::Angle(i, j, k) => vec![i, j, k],
            Self::Dihedral(i, j, k, l) => vec![i, j, k, l],
        }
    }

    /// Evaluates the coordinate and its derivative with respect to each of its particles.
    pub fn evaluate(
        &self,
        positions: &[Point3<f64>],
    ) -> Result<(f64, Vec<(usize, Vector3<f64>)>), GeometryError> {
        let particles = self.particles();
        let points = particles
            .iter()
            .map(|&index| {
                positions
                    .get(index)
                    .ok_or(GeometryError::ParticleOutOfRange {
                        index,
                        n_atoms: positions.len(),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let (value, derivatives): (f64, Vec<Vector3<f64>>) = match points.as_slice() {
            [p1, p2] => {
                let (value, d) = distance_and_derivatives(p1, p2);
                (value, d.to_vec())
            }
            [p1, p2, p3] => {
                let (value, d) = angle_and_derivatives(p1, p2, p3);
                (value, d.to_vec())
            }
            [p1, p2, p3, p4] => {
                let (value, d) = dihedral_and_derivatives(p1, p2, p3, p4);
                (value, d.to_vec())
            }
            _ => unreachable!("internal coordinates span two to four particles"),
        };

        Ok((value, particles.into_iter().zip(derivatives).collect()))
    }
}

pub fn distance_and_derivatives(p1: &Point3<f64>, p2: &Point3<f64>) -> (f64, [Vector3<f64>; 2]) {
    let r12 = p1 - p2;
    let distance = r12.norm();
    if distance < DEGENERACY_TOLERANCE {
        return (distance, [Vector3::zeros(); 2]);
    }
    let unit = r12 / distance;
    (distance, [unit, -unit])
}

/// The angle at `p2`, in radians.
pub fn angle_and_derivatives(
    p1: &Point3<f64>,
    p2: &Point3<f64>,
    p3: &Point3<f64>,
) -> (f64, [Vector3<f64>; 3]) {
    let u = p1 - p2;
    let v = p3 - p2;
    let (u_norm, v_norm) = (u.norm(), v.norm());
    let cross = u.cross(&v);
    let angle = cross.norm().atan2(u.dot(&v));

    let sin = angle.sin();
    if u_norm < DEGENERACY_TOLERANCE || v_norm < DEGENERACY_TOLERANCE || sin.abs() < DEGENERACY_TOLERANCE
    {
        return (angle, [Vector3::zeros(); 3]);
    }

    let (u_hat, v_hat) = (u / u_norm, v / v_norm);
    let cos = angle.cos();
    let d1 = (u_hat * cos - v_hat) / (u_norm * sin);
    let d3 = (v_hat * cos - u_hat) / (v_norm * sin);
    (angle, [d1, -(d1 + d3), d3])
}

/// The dihedral angle about the `p2`-`p3` axis in `(-pi, pi]`.
pub fn dihedral_and_derivatives(
    p1: &Point3<f64>,
    p2: &Point3<f64>,
    p3: &Point3<f64>,
    p4: &Point3<f64>,
) -> (f64, [Vector3<f64>; 4]) {
    let f = p1 - p2;
    let g = p2 - p3;
    let h = p4 - p3;

    let a = f.cross(&g);
    let b = h.cross(&g);
    let g_norm = g.norm();
    let (a_sq, b_sq) = (a.norm_squared(), b.norm_squared());

    if g_norm < DEGENERACY_TOLERANCE || a_sq < DEGENERACY_TOLERANCE || b_sq < DEGENERACY_TOLERANCE {
        return (0.0, [Vector3::zeros(); 4]);
    }

    let dihedral = (b.cross(&a).dot(&g) / g_norm).atan2(a.dot(&b));

    let fg = f.dot(&g) / (a_sq * g_norm);
    let hg = h.dot(&g) / (b_sq * g_norm);
    let d1 = -a * (g_norm / a_sq);
    let d4 = b * (g_norm / b_sq);
    let d2 = -d1 + a * fg - b * hg;
    let d3 = -d4 - a * fg + b * hg;
    (dihedral, [d1, d2, d3, d4])
}

/// Enumerates bonds, angles and proper dihedrals implied by a bond graph.
///
/// The result is sorted and free of duplicates, so the same bond graph always
/// yields the same coordinate ordering.
pub fn redundant_internal_coordinates(bonds: &[(usize, usize)]) -> Vec<InternalCoordinate> {
    let edges: BTreeSet<(usize, usize)> = bonds
        .iter()
        .filter(|(i, j)| i != j)
        .map(|&(i, j)| (i.min(j), i.max(j)))
        .collect();

    let n_atoms = edges.iter().map(|&(_, j)| j + 1).max().unwrap_or(0);
    let mut neighbours = vec![BTreeSet::new(); n_atoms];
    for &(i, j) in &edges {
        neighbours[i].insert(j);
        neighbours[j].insert(i);
    }

    let mut coordinates: Vec<InternalCoordinate> = edges
        .iter()
        .map(|&(i, j)| InternalCoordinate::Distance(i, j))
        .collect();

    for (center, bonded) in neighbours.iter().enumerate() {
        for (i, k) in bonded.iter().tuple_combinations() {
            coordinates.push(InternalCoordinate::Angle(*i, center, *k));
        }
    }

    for &(j, k) in &edges {
        for &i in neighbours[j].iter().filter(|&&i| i != k) {
            for &l in neighbours[k].iter().filter(|&&l| l != j && l != i) {
                coordinates.push(InternalCoordinate::Dihedral(i, j, k, l));
            }
        }
    }

    coordinates
}

/// The Wilson B-matrix of `coordinates` at `positions`, shape `(n_coordinates, 3 * n_atoms)`.
pub fn wilson_b_matrix(
    coordinates: &[InternalCoordinate],
    positions: &[Point3<f64>],
) -> Result<DMatrix<f64>, GeometryError> {
    let mut b_matrix = DMatrix::zeros(coordinates.len(), 3 * positions.len());
    for (row, coordinate) in coordinates.iter().enumerate() {
        let (_, derivatives) = coordinate.evaluate(positions)?;
        for (atom, derivative) in derivatives {
            for axis in 0..3 {
                b_matrix[(row, 3 * atom + axis)] += derivative[axis];
            }
        }
    }
    Ok(b_matrix)
}

/// The linear map taking a flattened Cartesian gradient onto internal coordinates,
/// `g_q = (B Bᵀ)⁺ B g_x`.
pub fn gradient_projection(b_matrix: &DMatrix<f64>) -> Result<DMatrix<f64>, GeometryError> {
    let metric = b_matrix * b_matrix.transpose();
    let inverse = metric
        .pseudo_inverse(1e-10)
        .map_err(GeometryError::Singular)?;
    Ok(inverse * b_matrix)
}
