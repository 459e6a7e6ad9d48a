use super::ids::{HandlerType, ParseHandlerTypeError, PotentialKey};
use super::potentials::FunctionalForm;
use super::units::{Quantity, Unit, UnitError};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawQuantity {
    Bare(f64),
    Full {
        value: f64,
        #[serde(default)]
        unit: Unit,
    },
}

impl From<RawQuantity> for Quantity {
    fn from(raw: RawQuantity) -> Self {
        match raw {
            RawQuantity::Bare(value) => Quantity::new(value, Unit::DIMENSIONLESS),
            RawQuantity::Full { value, unit } => Quantity::new(value, unit),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawParameter {
    smirks: String,
    #[serde(default)]
    id: Option<String>,
    #[serde(flatten)]
    attributes: BTreeMap<String, RawQuantity>,
}

/// A single parameter of a handler, e.g. the harmonic bond assigned to one SMIRKS pattern.
#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    pub smirks: String,
    pub id: Option<String>,
    attributes: BTreeMap<String, Quantity>,
}

impl Parameter {
    pub fn new(smirks: impl Into<String>) -> Self {
        Self {
            smirks: smirks.into(),
            id: None,
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: Quantity) -> Self {
        self.attributes.insert(name.into(), value);
        self
    }

    pub fn attribute(&self, name: &str) -> Option<&Quantity> {
        self.attributes.get(name)
    }

    pub fn attribute_mut(&mut self, name: &str) -> Option<&mut Quantity> {
        self.attributes.get_mut(name)
    }

    pub fn attributes(&self) -> impl Iterator<Item = (&str, &Quantity)> {
        self.attributes.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// The internal-unit value of an attribute, falling back to the form's default.
    pub fn internal_value(&self, form: FunctionalForm, name: &str) -> Option<f64> {
        self.attribute(name)
            .map(Quantity::to_internal)
            .or_else(|| form.default_value(name))
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParameterHandler {
    parameters: Vec<Parameter>,
}

impl ParameterHandler {
    pub fn parameters(&self) -> &[Parameter] {
        &self.parameters
    }

    pub fn get(&self, smirks: &str) -> Option<&Parameter> {
        self.parameters.iter().find(|p| p.smirks == smirks)
    }

    pub fn get_mut(&mut self, smirks: &str) -> Option<&mut Parameter> {
        self.parameters.iter_mut().find(|p| p.smirks == smirks)
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum ParameterSetError {
    #[error(transparent)]
    UnknownHandler(#[from] ParseHandlerTypeError),
    #[error("Handler '{handler}' already defines a parameter for '{smirks}'")]
    DuplicateSmirks { handler: HandlerType, smirks: String },
    #[error("Parameter '{smirks}' of handler '{handler}' has no attribute named '{attribute}'")]
    UnknownAttribute {
        handler: HandlerType,
        smirks: String,
        attribute: String,
    },
    #[error("Attribute '{attribute}' of parameter '{smirks}' ({handler}) has an invalid unit: {source}")]
    InvalidUnit {
        handler: HandlerType,
        smirks: String,
        attribute: String,
        source: UnitError,
    },
}

#[derive(Debug, Error)]
pub enum ParamLoadError {
    #[error("File I/O error for '{path}': {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("TOML parsing error for '{path}': {source}")]
    Toml {
        path: String,
        source: toml::de::Error,
    },
    #[error("Invalid parameter definition in '{path}': {source}")]
    Invalid {
        path: String,
        source: ParameterSetError,
    },
}

/// The full, untrained force-field definition: parameters grouped by handler type.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParameterSet {
    handlers: BTreeMap<HandlerType, ParameterHandler>,
}

impl ParameterSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(path: &Path) -> Result<Self, ParamLoadError> {
        let content = std::fs::read_to_string(path).map_err(|e| ParamLoadError::Io {
            path: path.to_string_lossy().to_string(),
            source: e,
        })?;
        Self::parse(&content, &path.to_string_lossy())
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ParamLoadError> {
        Self::parse(content, "<string>")
    }

    fn parse(content: &str, path: &str) -> Result<Self, ParamLoadError> {
        let raw: BTreeMap<String, Vec<RawParameter>> =
            toml::from_str(content).map_err(|e| ParamLoadError::Toml {
                path: path.to_string(),
                source: e,
            })?;

        let invalid = |source| ParamLoadError::Invalid {
            path: path.to_string(),
            source,
        };

        let mut parameter_set = Self::new();
        for (handler_name, parameters) in raw {
            let handler: HandlerType = handler_name
                .parse()
                .map_err(|e: ParseHandlerTypeError| invalid(e.into()))?;
            // Handlers listed without parameters are still part of the definition.
            parameter_set.handlers.entry(handler).or_default();

            for raw_parameter in parameters {
                let mut parameter = Parameter::new(raw_parameter.smirks);
                parameter.id = raw_parameter.id;
                for (name, value) in raw_parameter.attributes {
                    parameter.attributes.insert(name, value.into());
                }
                parameter_set.add_parameter(handler, parameter).map_err(invalid)?;
            }
        }
        Ok(parameter_set)
    }

    /// Adds a parameter after checking its attributes against the handler's functional form.
    pub fn add_parameter(
        &mut self,
        handler: HandlerType,
        parameter: Parameter,
    ) -> Result<(), ParameterSetError> {
        let form = FunctionalForm::for_handler(handler);
        for (name, quantity) in &parameter.attributes {
            let expected =
                form.internal_unit(name)
                    .ok_or_else(|| ParameterSetError::UnknownAttribute {
                        handler,
                        smirks: parameter.smirks.clone(),
                        attribute: name.clone(),
                    })?;
            quantity
                .unit
                .ensure_compatible(&expected)
                .map_err(|source| ParameterSetError::InvalidUnit {
                    handler,
                    smirks: parameter.smirks.clone(),
                    attribute: name.clone(),
                    source,
                })?;
        }

        let entry = self.handlers.entry(handler).or_default();
        if entry.get(&parameter.smirks).is_some() {
            return Err(ParameterSetError::DuplicateSmirks {
                handler,
                smirks: parameter.smirks,
            });
        }
        entry.parameters.push(parameter);
        Ok(())
    }

    pub fn handler(&self, handler: HandlerType) -> Option<&ParameterHandler> {
        self.handlers.get(&handler)
    }

    pub fn handlers(&self) -> impl Iterator<Item = (HandlerType, &ParameterHandler)> {
        self.handlers.iter().map(|(h, p)| (*h, p))
    }

    pub fn parameter(&self, key: &PotentialKey) -> Option<&Parameter> {
        self.handlers.get(&key.handler)?.get(&key.id)
    }

    pub fn parameter_mut(&mut self, key: &PotentialKey) -> Option<&mut Parameter> {
        self.handlers.get_mut(&key.handler)?.get_mut(&key.id)
    }
}
