use super::ids::HandlerType;
use super::units::{AngleUnit, EnergyUnit, LengthUnit, Unit};
use std::fmt;

pub const MAX_ATTRIBUTES: usize = 4;

const KJ_PER_MOL: Unit = Unit::molar_energy(EnergyUnit::Kilojoule);

/// The analytic form a group of valence terms is evaluated with.
///
/// The order of [`FunctionalForm::attributes`] is the column order of the
/// parameter matrix of every vectorized handler using this form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FunctionalForm {
    /// `k/2*(r-length)**2`
    HarmonicBond,
    /// `k/2*(theta-angle)**2`
    HarmonicAngle,
    /// `k*(1+cos(periodicity*theta-phase))`, with `k` divided by `idivf`
    PeriodicTorsion,
}

impl FunctionalForm {
    pub fn for_handler(handler: HandlerType) -> Self {
        match handler {
            HandlerType::Bonds => Self::HarmonicBond,
            HandlerType::Angles => Self::HarmonicAngle,
            HandlerType::ProperTorsions | HandlerType::ImproperTorsions => Self::PeriodicTorsion,
        }
    }

    pub fn expression(&self) -> &'static str {
        match self {
            Self::HarmonicBond => "k/2*(r-length)**2",
            Self::HarmonicAngle => "k/2*(theta-angle)**2",
            Self::PeriodicTorsion => "k*(1+cos(periodicity*theta-phase))",
        }
    }

    pub fn attributes(&self) -> &'static [&'static str] {
        match self {
            Self::HarmonicBond => &["k", "length"],
            Self::HarmonicAngle => &["k", "angle"],
            Self::PeriodicTorsion => &["k", "periodicity", "phase", "idivf"],
        }
    }

    pub fn attribute_index(&self, attribute: &str) -> Option<usize> {
        self.attributes().iter().position(|a| *a == attribute)
    }

    pub fn particle_count(&self) -> usize {
        match self {
            Self::HarmonicBond => 2,
            Self::HarmonicAngle => 3,
            Self::PeriodicTorsion => 4,
        }
    }

    /// The unit values of `attribute` are stored in inside a vectorized system.
    pub fn internal_unit(&self, attribute: &str) -> Option<Unit> {
        let unit = match (self, attribute) {
            (Self::HarmonicBond, "k") => KJ_PER_MOL.with_length(LengthUnit::Angstrom, -2),
            (Self::HarmonicBond, "length") => Unit::length(LengthUnit::Angstrom),
            (Self::HarmonicAngle, "k") => KJ_PER_MOL.with_angle(AngleUnit::Radian, -2),
            (Self::HarmonicAngle, "angle") => Unit::angle(AngleUnit::Radian),
            (Self::PeriodicTorsion, "k") => KJ_PER_MOL,
            (Self::PeriodicTorsion, "phase") => Unit::angle(AngleUnit::Radian),
            (Self::PeriodicTorsion, "periodicity" | "idivf") => Unit::DIMENSIONLESS,
            _ => return None,
        };
        Some(unit)
    }

    /// Default values for attributes a parameter definition may omit.
    pub fn default_value(&self, attribute: &str) -> Option<f64> {
        match (self, attribute) {
            (Self::PeriodicTorsion, "idivf") => Some(1.0),
            _ => None,
        }
    }

    /// Evaluates one term at internal coordinate `q` with the given parameter row.
    pub fn evaluate(&self, q: f64, parameters: &[f64]) -> TermDerivatives {
        match self {
            Self::HarmonicBond | Self::HarmonicAngle => harmonic(q, parameters[0], parameters[1]),
            Self::PeriodicTorsion => periodic(
                q,
                parameters[0],
                parameters[1],
                parameters[2],
                parameters[3],
            ),
        }
    }
}

impl fmt::Display for FunctionalForm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.expression())
    }
}

/// Value and first derivatives of a single term.
///
/// `d2_energy_d_coordinate_d_parameters[j]` is the derivative of
/// `d_energy_d_coordinate` with respect to parameter column `j`, which is what
/// couples coordinate gradients back to the trainable parameters.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TermDerivatives {
    pub energy: f64,
    pub d_energy_d_coordinate: f64,
    pub d_energy_d_parameters: [f64; MAX_ATTRIBUTES],
    pub d2_energy_d_coordinate_d_parameters: [f64; MAX_ATTRIBUTES],
}

#[inline]
pub fn harmonic(q: f64, k: f64, q0: f64) -> TermDerivatives {
    let displacement = q - q0;
    TermDerivatives {
        energy: 0.5 * k * displacement * displacement,
        d_energy_d_coordinate: k * displacement,
        d_energy_d_parameters: [0.5 * displacement * displacement, -k * displacement, 0.0, 0.0],
        d2_energy_d_coordinate_d_parameters: [displacement, -k, 0.0, 0.0],
    }
}

#[inline]
pub fn periodic(phi: f64, k: f64, periodicity: f64, phase: f64, idivf: f64) -> TermDerivatives {
    let argument = periodicity * phi - phase;
    let (sin, cos) = argument.sin_cos();
    let scale = 1.0 / idivf;

    let energy = k * scale * (1.0 + cos);
    let d_energy_d_phi = -k * scale * periodicity * sin;

    TermDerivatives {
        energy,
        d_energy_d_coordinate: d_energy_d_phi,
        d_energy_d_parameters: [
            scale * (1.0 + cos),
            -k * scale * sin * phi,
            k * scale * sin,
            -energy * scale,
        ],
        d2_energy_d_coordinate_d_parameters: [
            -scale * periodicity * sin,
            -k * scale * (sin + periodicity * phi * cos),
            k * scale * periodicity * cos,
            -d_energy_d_phi * scale,
        ],
    }
}
