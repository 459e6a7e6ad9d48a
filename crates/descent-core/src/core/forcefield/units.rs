//! Physical units of force-field parameters.
//!
//! Parameter values stored inside a [`VectorizedSystem`](super::vectorized::VectorizedSystem)
//! are always expressed in the internal unit system (kJ/mol, Å, radians). A
//! [`Unit`] knows the factor that maps one of its values onto that system, which
//! is what lets trained deltas be written back in each attribute's native unit.

use phf::{Map, phf_map};
use serde::Deserialize;
use std::f64::consts::PI;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EnergyUnit {
    Kilojoule,
    Kilocalorie,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LengthUnit {
    Angstrom,
    Nanometer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AngleUnit {
    Radian,
    Degree,
}

impl EnergyUnit {
    fn factor(self) -> f64 {
        match self {
            Self::Kilojoule => 1.0,
            Self::Kilocalorie => 4.184,
        }
    }

    fn symbol(self) -> &'static str {
        match self {
            Self::Kilojoule => "kJ",
            Self::Kilocalorie => "kcal",
        }
    }
}

impl LengthUnit {
    fn factor(self) -> f64 {
        match self {
            Self::Angstrom => 1.0,
            Self::Nanometer => 10.0,
        }
    }

    fn symbol(self) -> &'static str {
        match self {
            Self::Angstrom => "Å",
            Self::Nanometer => "nm",
        }
    }
}

impl AngleUnit {
    fn factor(self) -> f64 {
        match self {
            Self::Radian => 1.0,
            Self::Degree => PI / 180.0,
        }
    }

    fn symbol(self) -> &'static str {
        match self {
            Self::Radian => "rad",
            Self::Degree => "deg",
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Symbol {
    Energy(EnergyUnit),
    Mole,
    Length(LengthUnit),
    Angle(AngleUnit),
}

static SYMBOLS: Map<&'static str, Symbol> = phf_map! {
    "kJ" => Symbol::Energy(EnergyUnit::Kilojoule),
    "kilojoule" => Symbol::Energy(EnergyUnit::Kilojoule),
    "kilojoules" => Symbol::Energy(EnergyUnit::Kilojoule),
    "kcal" => Symbol::Energy(EnergyUnit::Kilocalorie),
    "kilocalorie" => Symbol::Energy(EnergyUnit::Kilocalorie),
    "kilocalories" => Symbol::Energy(EnergyUnit::Kilocalorie),
    "mol" => Symbol::Mole,
    "mole" => Symbol::Mole,
    "Å" => Symbol::Length(LengthUnit::Angstrom),
    "A" => Symbol::Length(LengthUnit::Angstrom),
    "angstrom" => Symbol::Length(LengthUnit::Angstrom),
    "angstroms" => Symbol::Length(LengthUnit::Angstrom),
    "nm" => Symbol::Length(LengthUnit::Nanometer),
    "nanometer" => Symbol::Length(LengthUnit::Nanometer),
    "nanometers" => Symbol::Length(LengthUnit::Nanometer),
    "rad" => Symbol::Angle(AngleUnit::Radian),
    "radian" => Symbol::Angle(AngleUnit::Radian),
    "radians" => Symbol::Angle(AngleUnit::Radian),
    "deg" => Symbol::Angle(AngleUnit::Degree),
    "degree" => Symbol::Angle(AngleUnit::Degree),
    "degrees" => Symbol::Angle(AngleUnit::Degree),
    "°" => Symbol::Angle(AngleUnit::Degree),
};

#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum UnitError {
    #[error("Unknown unit symbol '{symbol}' in '{unit}'")]
    UnknownSymbol { unit: String, symbol: String },
    #[error("Malformed exponent '{exponent}' in '{unit}'")]
    MalformedExponent { unit: String, exponent: String },
    #[error("Unit '{0}' mixes different units of the same dimension")]
    MixedUnits(String),
    #[error("Energy in unit '{0}' must be expressed per mole")]
    NonMolarEnergy(String),
    #[error("Unit '{found}' is not compatible with '{expected}'")]
    Incompatible { expected: Unit, found: Unit },
}

/// A product of powers of a molar energy, a length and an angle unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
#[serde(try_from = "String")]
pub struct Unit {
    energy: Option<(EnergyUnit, i32)>,
    length: Option<(LengthUnit, i32)>,
    angle: Option<(AngleUnit, i32)>,
}

impl Unit {
    pub const DIMENSIONLESS: Unit = Unit {
        energy: None,
        length: None,
        angle: None,
    };

    pub const fn molar_energy(unit: EnergyUnit) -> Self {
        Self {
            energy: Some((unit, 1)),
            length: None,
            angle: None,
        }
    }

    pub const fn length(unit: LengthUnit) -> Self {
        Self {
            energy: None,
            length: Some((unit, 1)),
            angle: None,
        }
    }

    pub const fn angle(unit: AngleUnit) -> Self {
        Self {
            energy: None,
            length: None,
            angle: Some((unit, 1)),
        }
    }

    pub const fn with_length(mut self, unit: LengthUnit, power: i32) -> Self {
        self.length = if power == 0 { None } else { Some((unit, power)) };
        self
    }

    pub const fn with_angle(mut self, unit: AngleUnit, power: i32) -> Self {
        self.angle = if power == 0 { None } else { Some((unit, power)) };
        self
    }

    pub fn is_dimensionless(&self) -> bool {
        self.energy.is_none() && self.length.is_none() && self.angle.is_none()
    }

    /// The factor converting a value in this unit into the internal unit system.
    pub fn to_internal_factor(&self) -> f64 {
        let mut factor = 1.0;
        if let Some((unit, power)) = self.energy {
            factor *= unit.factor().powi(power);
        }
        if let Some((unit, power)) = self.length {
            factor *= unit.factor().powi(power);
        }
        if let Some((unit, power)) = self.angle {
            factor *= unit.factor().powi(power);
        }
        factor
    }

    pub fn to_internal(&self, value: f64) -> f64 {
        value * self.to_internal_factor()
    }

    pub fn from_internal(&self, value: f64) -> f64 {
        value / self.to_internal_factor()
    }

    fn powers(&self) -> (i32, i32, i32) {
        (
            self.energy.map_or(0, |(_, p)| p),
            self.length.map_or(0, |(_, p)| p),
            self.angle.map_or(0, |(_, p)| p),
        )
    }

    /// Whether both units measure the same physical dimension.
    pub fn is_compatible(&self, other: &Unit) -> bool {
        self.powers() == other.powers()
    }

    pub fn ensure_compatible(&self, expected: &Unit) -> Result<(), UnitError> {
        if self.is_compatible(expected) {
            Ok(())
        } else {
            Err(UnitError::Incompatible {
                expected: *expected,
                found: *self,
            })
        }
    }
}

fn superscript(power: i32) -> String {
    match power {
        1 => String::new(),
        2 => "²".to_string(),
        3 => "³".to_string(),
        p => format!("^{p}"),
    }
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_dimensionless() {
            return f.write_str("dimensionless");
        }

        let mut numerator = Vec::new();
        let mut denominator = Vec::new();

        if let Some((unit, power)) = self.energy {
            if power > 0 {
                numerator.push(format!("{}{}", unit.symbol(), superscript(power)));
                denominator.push(format!("mol{}", superscript(power)));
            } else {
                numerator.push(format!("mol{}", superscript(-power)));
                denominator.push(format!("{}{}", unit.symbol(), superscript(-power)));
            }
        }
        let others = [
            self.length.map(|(u, p)| (u.symbol(), p)),
            self.angle.map(|(u, p)| (u.symbol(), p)),
        ];
        for (symbol, power) in others.into_iter().flatten() {
            if power > 0 {
                numerator.push(format!("{symbol}{}", superscript(power)));
            } else {
                denominator.push(format!("{symbol}{}", superscript(-power)));
            }
        }

        let head = if numerator.is_empty() {
            "1".to_string()
        } else {
            numerator.join("*")
        };
        f.write_str(&head)?;
        for part in denominator {
            write!(f, "/{part}")?;
        }
        Ok(())
    }
}

fn split_exponent<'a>(factor: &'a str, unit: &str) -> Result<(&'a str, i32), UnitError> {
    let malformed = |exponent: &str| UnitError::MalformedExponent {
        unit: unit.to_string(),
        exponent: exponent.to_string(),
    };

    if let Some((base, exponent)) = factor.split_once('^') {
        let power = exponent.parse::<i32>().map_err(|_| malformed(exponent))?;
        return Ok((base, power));
    }
    if let Some(base) = factor.strip_suffix('²') {
        return Ok((base, 2));
    }
    if let Some(base) = factor.strip_suffix('³') {
        return Ok((base, 3));
    }
    Ok((factor, 1))
}

fn drop_zero<U>(slot: Option<(U, i32)>) -> Option<(U, i32)> {
    slot.filter(|(_, power)| *power != 0)
}

fn accumulate<U: PartialEq + Copy>(
    slot: &mut Option<(U, i32)>,
    unit: U,
    power: i32,
    text: &str,
) -> Result<(), UnitError> {
    match slot {
        None => *slot = Some((unit, power)),
        Some((existing, total)) if *existing == unit => *total += power,
        Some(_) => return Err(UnitError::MixedUnits(text.to_string())),
    }
    Ok(())
}

impl FromStr for Unit {
    type Err = UnitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let text: String = s.split_whitespace().collect();
        if text.is_empty() || text == "dimensionless" {
            return Ok(Self::DIMENSIONLESS);
        }
        let normalized = text.replace("**", "^");

        let mut energy = None;
        let mut length = None;
        let mut angle = None;
        let mut mole_power = 0;

        let mut sign = 1;
        let mut start = 0;
        let bytes = normalized.as_bytes();
        for end in 0..=bytes.len() {
            if end < bytes.len() && bytes[end] != b'*' && bytes[end] != b'/' {
                continue;
            }
            let factor = &normalized[start..end];
            if !factor.is_empty() && factor != "1" {
                let (base, power) = split_exponent(factor, s)?;
                let power = sign * power;
                match SYMBOLS.get(base) {
                    Some(Symbol::Energy(unit)) => accumulate(&mut energy, *unit, power, s)?,
                    Some(Symbol::Mole) => mole_power += power,
                    Some(Symbol::Length(unit)) => accumulate(&mut length, *unit, power, s)?,
                    Some(Symbol::Angle(unit)) => accumulate(&mut angle, *unit, power, s)?,
                    None => {
                        return Err(UnitError::UnknownSymbol {
                            unit: s.to_string(),
                            symbol: base.to_string(),
                        });
                    }
                }
            }
            if end < bytes.len() {
                sign = if bytes[end] == b'/' { -1 } else { 1 };
            }
            start = end + 1;
        }

        let energy_power = energy.map_or(0, |(_, p): (EnergyUnit, i32)| p);
        if mole_power != -energy_power {
            return Err(UnitError::NonMolarEnergy(s.to_string()));
        }

        Ok(Self {
            energy: drop_zero(energy),
            length: drop_zero(length),
            angle: drop_zero(angle),
        })
    }
}

impl TryFrom<String> for Unit {
    type Error = UnitError;
    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// A value paired with the unit it is expressed in.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Quantity {
    pub value: f64,
    #[serde(default)]
    pub unit: Unit,
}

impl Quantity {
    pub fn new(value: f64, unit: Unit) -> Self {
        Self { value, unit }
    }

    pub fn to_internal(&self) -> f64 {
        self.unit.to_internal(self.value)
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.unit.is_dimensionless() {
            write!(f, "{}", self.value)
        } else {
            write!(f, "{} {}", self.value, self.unit)
        }
    }
}
