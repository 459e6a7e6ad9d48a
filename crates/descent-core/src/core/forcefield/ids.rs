use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// The category of valence term a parameter belongs to.
///
/// Each handler type is evaluated with exactly one functional form, see
/// [`FunctionalForm::for_handler`](super::potentials::FunctionalForm::for_handler).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum HandlerType {
    Bonds,
    Angles,
    ProperTorsions,
    ImproperTorsions,
}

impl HandlerType {
    pub const ALL: [HandlerType; 4] = [
        HandlerType::Bonds,
        HandlerType::Angles,
        HandlerType::ProperTorsions,
        HandlerType::ImproperTorsions,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bonds => "Bonds",
            Self::Angles => "Angles",
            Self::ProperTorsions => "ProperTorsions",
            Self::ImproperTorsions => "ImproperTorsions",
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("Unknown handler type '{0}'")]
pub struct ParseHandlerTypeError(pub String);

impl FromStr for HandlerType {
    type Err = ParseHandlerTypeError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "Bonds" => Ok(Self::Bonds),
            "Angles" => Ok(Self::Angles),
            "ProperTorsions" => Ok(Self::ProperTorsions),
            "ImproperTorsions" => Ok(Self::ImproperTorsions),
            other => Err(ParseHandlerTypeError(other.to_string())),
        }
    }
}

impl fmt::Display for HandlerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifies the class of chemically equivalent terms a parameter was assigned to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PotentialKey {
    pub id: String,
    pub handler: HandlerType,
}

impl PotentialKey {
    pub fn new(id: impl Into<String>, handler: HandlerType) -> Self {
        Self {
            id: id.into(),
            handler,
        }
    }
}

impl fmt::Display for PotentialKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.handler, self.id)
    }
}

/// Uniquely identifies one scalar parameter, e.g. the force constant of a single bond pattern.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ParameterId {
    pub handler: HandlerType,
    pub key: PotentialKey,
    pub attribute: String,
}

impl ParameterId {
    pub fn new(handler: HandlerType, smirks: impl Into<String>, attribute: impl Into<String>) -> Self {
        Self {
            handler,
            key: PotentialKey::new(smirks, handler),
            attribute: attribute.into(),
        }
    }
}

impl fmt::Display for ParameterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.handler, self.key.id, self.attribute)
    }
}
