use super::{CovarianceTransform, ModelError, ParameterIdType, ParameterizationModel};
use crate::core::forcefield::ids::{HandlerType, ParameterId, PotentialKey};
use crate::core::forcefield::params::ParameterSet;
use crate::core::forcefield::potentials::FunctionalForm;
use crate::core::forcefield::units::Unit;
use crate::core::forcefield::vectorized::{
    ParameterCotangents, VectorizedHandler, VectorizedSystem,
};
use itertools::Itertools;
use nalgebra::DVector;
use std::collections::{HashMap, HashSet};
use tracing::{debug, trace};

/// One trainable entry of a handler: its pattern, attribute and position in the delta.
pub type TrainableEntry = (PotentialKey, String, usize);

/// Trains SMIRNOFF-style valence parameters keyed by `(handler, smirks, attribute)`.
///
/// Trainable ids are grouped by handler type, handlers ordered by their first
/// appearance in the input and ids within a handler keeping their relative order.
#[derive(Debug, Clone)]
pub struct SmirnoffModel {
    initial_parameter_set: Option<ParameterSet>,
    parameter_delta_ids: Vec<ParameterId>,
    parameter_delta: DVector<f64>,
    covariance: CovarianceTransform,
    handler_parameters: HashMap<HandlerType, Vec<TrainableEntry>>,
}

impl SmirnoffModel {
    pub fn new(
        parameter_ids: &[ParameterId],
        initial_parameter_set: Option<&ParameterSet>,
        covariance: CovarianceTransform,
    ) -> Result<Self, ModelError> {
        let mut seen = HashSet::with_capacity(parameter_ids.len());
        if let Some(duplicate) = parameter_ids.iter().find(|id| !seen.insert(*id)) {
            return Err(ModelError::DuplicateParameter(duplicate.clone()));
        }

        if let Some(parameter_set) = initial_parameter_set {
            let missing = parameter_ids.iter().find(|id| {
                parameter_set
                    .parameter(&id.key)
                    .and_then(|parameter| parameter.attribute(&id.attribute))
                    .is_none()
            });
            if let Some(id) = missing {
                return Err(ModelError::UnknownParameter(id.clone()));
            }
        }

        let parameter_delta_ids: Vec<ParameterId> = parameter_ids
            .iter()
            .map(|id| id.handler)
            .unique()
            .flat_map(|handler| parameter_ids.iter().filter(move |id| id.handler == handler))
            .cloned()
            .collect();

        let mut handler_parameters: HashMap<HandlerType, Vec<TrainableEntry>> = HashMap::new();
        for (index, id) in parameter_delta_ids.iter().enumerate() {
            handler_parameters.entry(id.handler).or_default().push((
                id.key.clone(),
                id.attribute.clone(),
                index,
            ));
        }

        covariance.validate(parameter_delta_ids.len())?;
        let latent = covariance.latent_dimension(parameter_delta_ids.len());
        debug!(
            "Created model with {} trainable parameter(s) across {} handler(s).",
            parameter_delta_ids.len(),
            handler_parameters.len()
        );

        Ok(Self {
            initial_parameter_set: initial_parameter_set.cloned(),
            parameter_delta_ids,
            parameter_delta: DVector::zeros(latent),
            covariance,
            handler_parameters,
        })
    }

    pub fn initial_parameter_set(&self) -> Option<&ParameterSet> {
        self.initial_parameter_set.as_ref()
    }

    /// The trainable entries of `handler` with their indices into the delta.
    pub fn handler_parameters(&self, handler: HandlerType) -> Option<&[TrainableEntry]> {
        self.handler_parameters.get(&handler).map(Vec::as_slice)
    }

    /// The per-parameter adjustments after the covariance transform.
    pub fn effective_delta(&self) -> DVector<f64> {
        self.covariance.apply(&self.parameter_delta)
    }

    /// `(column, delta index)` pairs of every trainable column of `handler`, keyed by row key.
    fn trainable_columns<'a>(
        &'a self,
        handler_type: HandlerType,
        handler: &VectorizedHandler,
    ) -> HashMap<&'a PotentialKey, Vec<(usize, usize)>> {
        let mut columns: HashMap<&PotentialKey, Vec<(usize, usize)>> = HashMap::new();
        let Some(entries) = self.handler_parameters.get(&handler_type) else {
            return columns;
        };
        let form = handler.form();
        for (key, attribute, index) in entries {
            match form.attribute_index(attribute) {
                Some(column) => columns.entry(key).or_default().push((column, *index)),
                None => trace!(
                    "Attribute '{}' of '{}' is not a parameter of form '{}', skipping.",
                    attribute, key, form
                ),
            }
        }
        columns
    }

    fn handler_order(&self) -> impl Iterator<Item = HandlerType> + '_ {
        self.parameter_delta_ids.iter().map(|id| id.handler).dedup()
    }

    fn native_unit(&self, form: FunctionalForm, key: &PotentialKey, attribute: &str) -> Unit {
        self.initial_parameter_set
            .as_ref()
            .and_then(|set| set.parameter(key))
            .and_then(|parameter| parameter.attribute(attribute))
            .map(|quantity| quantity.unit)
            .or_else(|| form.internal_unit(attribute))
            .unwrap_or(Unit::DIMENSIONLESS)
    }

    fn row_label(&self, key: &PotentialKey, id_type: ParameterIdType) -> String {
        match id_type {
            ParameterIdType::Smirks => key.id.clone(),
            ParameterIdType::Id => self
                .initial_parameter_set
                .as_ref()
                .and_then(|set| set.parameter(key))
                .and_then(|parameter| parameter.id.clone())
                .unwrap_or_else(|| key.id.clone()),
        }
    }
}

impl ParameterizationModel for SmirnoffModel {
    fn parameter_delta_ids(&self) -> &[ParameterId] {
        &self.parameter_delta_ids
    }

    fn parameter_delta(&self) -> &DVector<f64> {
        &self.parameter_delta
    }

    fn set_parameter_delta(&mut self, delta: DVector<f64>) -> Result<(), ModelError> {
        if delta.len() != self.parameter_delta.len() {
            return Err(ModelError::ShapeMismatch {
                name: "parameter delta",
                expected: self.parameter_delta.len(),
                found: delta.len(),
            });
        }
        self.parameter_delta = delta;
        Ok(())
    }

    fn forward(&self, system: &VectorizedSystem) -> VectorizedSystem {
        let delta = self.effective_delta();

        let handlers = system
            .iter()
            .map(|(key, handler)| {
                let columns = self.trainable_columns(key.0, handler);
                if columns.is_empty() {
                    return (*key, handler.clone());
                }

                let mut parameters = handler.parameters().clone();
                for (row, potential_key) in handler.parameter_ids().iter().enumerate() {
                    for &(column, index) in columns.get(potential_key).into_iter().flatten() {
                        parameters[(row, column)] += delta[index];
                    }
                }
                (*key, handler.with_parameters(parameters))
            })
            .collect();

        VectorizedSystem::from_handlers(handlers)
    }

    fn backward(
        &self,
        system: &VectorizedSystem,
        cotangents: &ParameterCotangents,
    ) -> DVector<f64> {
        let mut gradient = DVector::<f64>::zeros(self.parameter_delta_ids.len());

        for (key, handler) in system {
            let Some(cotangent) = cotangents.get(key) else {
                continue;
            };
            let columns = self.trainable_columns(key.0, handler);
            for (row, potential_key) in handler.parameter_ids().iter().enumerate() {
                for &(column, index) in columns.get(potential_key).into_iter().flatten() {
                    gradient[index] += cotangent[(row, column)];
                }
            }
        }

        self.covariance.backward(&gradient)
    }

    fn to_parameter_set(&self) -> Result<ParameterSet, ModelError> {
        let mut parameter_set = self
            .initial_parameter_set
            .clone()
            .ok_or(ModelError::MissingReference)?;
        let delta = self.effective_delta();

        for (id, value) in self.parameter_delta_ids.iter().zip(delta.iter()) {
            let quantity = parameter_set
                .parameter_mut(&id.key)
                .and_then(|parameter| parameter.attribute_mut(&id.attribute))
                .ok_or_else(|| ModelError::UnknownParameter(id.clone()))?;
            quantity.value += quantity.unit.from_internal(*value);
        }
        Ok(parameter_set)
    }

    fn summarise(&self, id_type: ParameterIdType) -> Result<String, ModelError> {
        if id_type == ParameterIdType::Id && self.initial_parameter_set.is_none() {
            return Err(ModelError::MissingReference);
        }
        let delta = self.effective_delta();

        let mut sections = Vec::new();
        for handler in self.handler_order() {
            let Some(entries) = self.handler_parameters.get(&handler) else {
                continue;
            };
            let form = FunctionalForm::for_handler(handler);

            let keys: Vec<&PotentialKey> = entries.iter().map(|(key, ..)| key).unique().collect();
            let attributes: Vec<&str> = entries
                .iter()
                .map(|(_, attribute, _)| attribute.as_str())
                .unique()
                .sorted()
                .collect();

            let column_units: Vec<Unit> = attributes
                .iter()
                .map(|attribute| {
                    entries
                        .iter()
                        .find(|(_, a, _)| a.as_str() == *attribute)
                        .map_or(Unit::DIMENSIONLESS, |(key, ..)| {
                            self.native_unit(form, key, attribute)
                        })
                })
                .collect();

            let header: Vec<String> = std::iter::once(String::new())
                .chain(
                    attributes
                        .iter()
                        .zip(&column_units)
                        .map(|(attribute, unit)| format!("{attribute} ({unit})")),
                )
                .collect();

            let mut rows = vec![header];
            for key in keys {
                let mut row = vec![self.row_label(key, id_type)];
                for (attribute, unit) in attributes.iter().zip(&column_units) {
                    let cell = entries
                        .iter()
                        .find(|(k, a, _)| k == key && a.as_str() == *attribute)
                        .map(|(.., index)| format!("{:.6}", unit.from_internal(delta[*index])))
                        .unwrap_or_default();
                    row.push(cell);
                }
                rows.push(row);
            }

            sections.push(render_section(handler, &rows));
        }

        Ok(sections.join("\n"))
    }
}

fn render_section(handler: HandlerType, rows: &[Vec<String>]) -> String {
    let n_columns = rows.first().map_or(0, Vec::len);
    let widths: Vec<usize> = (0..n_columns)
        .map(|column| {
            rows.iter()
                .map(|row| row[column].chars().count())
                .max()
                .unwrap_or(0)
        })
        .collect();

    let mut output = format!("{handler}\n");
    for row in rows {
        let mut line = String::new();
        for (column, (cell, &width)) in row.iter().zip(&widths).enumerate() {
            if column == 0 {
                line.push_str(&format!("{cell:<width$}"));
            } else {
                line.push_str(&format!("  {cell:>width$}"));
            }
        }
        output.push_str(line.trim_end());
        output.push('\n');
    }
    output
}
