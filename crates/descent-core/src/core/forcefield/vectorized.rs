use super::ids::{HandlerType, PotentialKey};
use super::params::ParameterSet;
use super::potentials::FunctionalForm;
use nalgebra::DMatrix;
use std::collections::BTreeMap;
use std::collections::btree_map;
use thiserror::Error;
use tracing::debug;

pub type HandlerKey = (HandlerType, FunctionalForm);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum VectorizedSystemError {
    #[error("Handler with form '{form}' has {ids} parameter ids, {rows} parameter rows and {particles} particle rows")]
    InconsistentRows {
        form: FunctionalForm,
        ids: usize,
        rows: usize,
        particles: usize,
    },
    #[error("Form '{form}' expects {expected} parameter columns, found {found}")]
    InconsistentColumns {
        form: FunctionalForm,
        expected: usize,
        found: usize,
    },
    #[error("Term {row} of form '{form}' acts on {found} particles, expected {expected}")]
    Arity {
        form: FunctionalForm,
        row: usize,
        expected: usize,
        found: usize,
    },
    #[error("Handler '{handler}' cannot be evaluated with form '{form}'")]
    FormMismatch {
        handler: HandlerType,
        form: FunctionalForm,
    },
}

/// All term instances of one functional form, in batched form.
///
/// Row `i` of `parameters` and `particle_indices` belongs to the term whose
/// parameter was assigned `parameter_ids[i]`. Columns of `parameters` follow
/// [`FunctionalForm::attributes`].
#[derive(Debug, Clone, PartialEq)]
pub struct VectorizedHandler {
    form: FunctionalForm,
    parameter_ids: Vec<PotentialKey>,
    parameters: DMatrix<f64>,
    particle_indices: Vec<Vec<usize>>,
}

impl VectorizedHandler {
    pub fn new(
        form: FunctionalForm,
        parameter_ids: Vec<PotentialKey>,
        parameters: DMatrix<f64>,
        particle_indices: Vec<Vec<usize>>,
    ) -> Result<Self, VectorizedSystemError> {
        if parameter_ids.len() != parameters.nrows() || parameters.nrows() != particle_indices.len() {
            return Err(VectorizedSystemError::InconsistentRows {
                form,
                ids: parameter_ids.len(),
                rows: parameters.nrows(),
                particles: particle_indices.len(),
            });
        }
        if parameters.ncols() != form.attributes().len() {
            return Err(VectorizedSystemError::InconsistentColumns {
                form,
                expected: form.attributes().len(),
                found: parameters.ncols(),
            });
        }
        if let Some((row, particles)) = particle_indices
            .iter()
            .enumerate()
            .find(|(_, p)| p.len() != form.particle_count())
        {
            return Err(VectorizedSystemError::Arity {
                form,
                row,
                expected: form.particle_count(),
                found: particles.len(),
            });
        }

        Ok(Self {
            form,
            parameter_ids,
            parameters,
            particle_indices,
        })
    }

    pub fn form(&self) -> FunctionalForm {
        self.form
    }

    pub fn parameter_ids(&self) -> &[PotentialKey] {
        &self.parameter_ids
    }

    pub fn parameters(&self) -> &DMatrix<f64> {
        &self.parameters
    }

    pub fn particle_indices(&self) -> &[Vec<usize>] {
        &self.particle_indices
    }

    pub fn len(&self) -> usize {
        self.parameter_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parameter_ids.is_empty()
    }

    /// A copy of this handler with its parameter matrix replaced.
    ///
    /// The replacement must have the same shape as the current matrix.
    pub(crate) fn with_parameters(&self, parameters: DMatrix<f64>) -> Self {
        debug_assert_eq!(parameters.shape(), self.parameters.shape());
        Self {
            form: self.form,
            parameter_ids: self.parameter_ids.clone(),
            parameters,
            particle_indices: self.particle_indices.clone(),
        }
    }
}

/// Batched representation of every valence term in a molecule, keyed by
/// `(handler type, functional form)`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct VectorizedSystem {
    handlers: BTreeMap<HandlerKey, VectorizedHandler>,
}

impl VectorizedSystem {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(
        &mut self,
        handler: HandlerType,
        entry: VectorizedHandler,
    ) -> Result<Option<VectorizedHandler>, VectorizedSystemError> {
        if FunctionalForm::for_handler(handler) != entry.form {
            return Err(VectorizedSystemError::FormMismatch {
                handler,
                form: entry.form,
            });
        }
        Ok(self.handlers.insert((handler, entry.form), entry))
    }

    pub fn get(&self, key: &HandlerKey) -> Option<&VectorizedHandler> {
        self.handlers.get(key)
    }

    pub fn contains_key(&self, key: &HandlerKey) -> bool {
        self.handlers.contains_key(key)
    }

    pub fn iter(&self) -> btree_map::Iter<'_, HandlerKey, VectorizedHandler> {
        self.handlers.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &HandlerKey> {
        self.handlers.keys()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// One more than the largest particle index referenced by any term.
    pub fn particle_count(&self) -> usize {
        self.handlers
            .values()
            .flat_map(|h| h.particle_indices.iter().flatten())
            .max()
            .map_or(0, |max| max + 1)
    }

    pub(crate) fn from_handlers(handlers: BTreeMap<HandlerKey, VectorizedHandler>) -> Self {
        Self { handlers }
    }
}

impl<'a> IntoIterator for &'a VectorizedSystem {
    type Item = (&'a HandlerKey, &'a VectorizedHandler);
    type IntoIter = btree_map::Iter<'a, HandlerKey, VectorizedHandler>;

    fn into_iter(self) -> Self::IntoIter {
        self.handlers.iter()
    }
}

/// Derivatives of a scalar with respect to every entry of every parameter matrix of a system.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ParameterCotangents {
    cotangents: BTreeMap<HandlerKey, DMatrix<f64>>,
}

impl ParameterCotangents {
    pub fn zeros_like(system: &VectorizedSystem) -> Self {
        let cotangents = system
            .iter()
            .map(|(key, handler)| {
                let (rows, cols) = handler.parameters.shape();
                (*key, DMatrix::zeros(rows, cols))
            })
            .collect();
        Self { cotangents }
    }

    pub fn get(&self, key: &HandlerKey) -> Option<&DMatrix<f64>> {
        self.cotangents.get(key)
    }

    pub fn get_mut(&mut self, key: &HandlerKey) -> Option<&mut DMatrix<f64>> {
        self.cotangents.get_mut(key)
    }
}

/// A valence term whose parameter has already been assigned by pattern matching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelledTerm {
    pub handler: HandlerType,
    pub smirks: String,
    pub particles: Vec<usize>,
}

/// The labelled valence terms of a single molecule.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Topology {
    pub n_atoms: usize,
    pub terms: Vec<LabelledTerm>,
}

impl Topology {
    pub fn new(n_atoms: usize) -> Self {
        Self {
            n_atoms,
            terms: Vec::new(),
        }
    }

    pub fn with_term(
        mut self,
        handler: HandlerType,
        smirks: impl Into<String>,
        particles: &[usize],
    ) -> Self {
        self.terms.push(LabelledTerm {
            handler,
            smirks: smirks.into(),
            particles: particles.to_vec(),
        });
        self
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum VectorizeError {
    #[error("No '{handler}' parameter is defined for pattern '{smirks}'")]
    MissingParameter { handler: HandlerType, smirks: String },
    #[error("Parameter '{smirks}' of handler '{handler}' does not define '{attribute}'")]
    MissingAttribute {
        handler: HandlerType,
        smirks: String,
        attribute: String,
    },
    #[error("Term over particles {particles:?} references atoms outside of a {n_atoms} atom topology")]
    ParticleOutOfRange {
        particles: Vec<usize>,
        n_atoms: usize,
    },
    #[error(transparent)]
    System(#[from] VectorizedSystemError),
}

/// Builds the vectorized representation of `topology` using values from `parameter_set`.
pub fn vectorize_system(
    parameter_set: &ParameterSet,
    topology: &Topology,
) -> Result<VectorizedSystem, VectorizeError> {
    let mut grouped: BTreeMap<HandlerType, Vec<&LabelledTerm>> = BTreeMap::new();
    for term in &topology.terms {
        if term.particles.iter().any(|&i| i >= topology.n_atoms) {
            return Err(VectorizeError::ParticleOutOfRange {
                particles: term.particles.clone(),
                n_atoms: topology.n_atoms,
            });
        }
        grouped.entry(term.handler).or_default().push(term);
    }

    let mut system = VectorizedSystem::new();
    for (handler, terms) in grouped {
        let form = FunctionalForm::for_handler(handler);
        let attributes = form.attributes();

        let mut parameter_ids = Vec::with_capacity(terms.len());
        let mut values = Vec::with_capacity(terms.len() * attributes.len());
        let mut particle_indices = Vec::with_capacity(terms.len());

        for term in terms {
            let key = PotentialKey::new(term.smirks.clone(), handler);
            let parameter =
                parameter_set
                    .parameter(&key)
                    .ok_or_else(|| VectorizeError::MissingParameter {
                        handler,
                        smirks: term.smirks.clone(),
                    })?;
            for attribute in attributes {
                let value = parameter.internal_value(form, attribute).ok_or_else(|| {
                    VectorizeError::MissingAttribute {
                        handler,
                        smirks: term.smirks.clone(),
                        attribute: attribute.to_string(),
                    }
                })?;
                values.push(value);
            }
            parameter_ids.push(key);
            particle_indices.push(term.particles.clone());
        }

        let parameters = DMatrix::from_row_slice(parameter_ids.len(), attributes.len(), &values);
        debug!(
            "Vectorized {} '{}' term(s) with form '{}'.",
            parameter_ids.len(),
            handler,
            form
        );
        system.insert(
            handler,
            VectorizedHandler::new(form, parameter_ids, parameters, particle_indices)?,
        )?;
    }

    Ok(system)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::forcefield::params::Parameter;
    use crate::core::forcefield::units::Quantity;

    fn water_parameter_set() -> ParameterSet {
        let mut parameter_set = ParameterSet::new();
        parameter_set
            .add_parameter(
                HandlerType::Bonds,
                Parameter::new("[#1:1]-[#8:2]")
                    .with_attribute("k", Quantity::new(5.0, "kJ/mol/Å**2".parse().unwrap()))
                    .with_attribute("length", Quantity::new(0.1, "nm".parse().unwrap())),
            )
            .unwrap();
        parameter_set
            .add_parameter(
                HandlerType::Angles,
                Parameter::new("[#1:1]-[#8:2]-[#1:3]")
                    .with_attribute("k", Quantity::new(1.0, "kJ/mol/rad**2".parse().unwrap()))
                    .with_attribute("angle", Quantity::new(180.0, "degree".parse().unwrap())),
            )
            .unwrap();
        parameter_set
    }

    fn water_topology() -> Topology {
        Topology::new(3)
            .with_term(HandlerType::Bonds, "[#1:1]-[#8:2]", &[0, 1])
            .with_term(HandlerType::Bonds, "[#1:1]-[#8:2]", &[0, 2])
            .with_term(HandlerType::Angles, "[#1:1]-[#8:2]-[#1:3]", &[1, 0, 2])
    }

    #[test]
    fn vectorize_system_groups_terms_by_handler_and_converts_units() {
        let system = vectorize_system(&water_parameter_set(), &water_topology()).unwrap();
        assert_eq!(system.len(), 2);

        let bonds = system
            .get(&(HandlerType::Bonds, FunctionalForm::HarmonicBond))
            .unwrap();
        assert_eq!(bonds.len(), 2);
        assert_eq!(bonds.parameters().shape(), (2, 2));
        assert!((bonds.parameters()[(0, 1)] - 1.0).abs() < 1e-12);
        assert_eq!(bonds.particle_indices()[1], vec![0, 2]);

        let angles = system
            .get(&(HandlerType::Angles, FunctionalForm::HarmonicAngle))
            .unwrap();
        assert!((angles.parameters()[(0, 1)] - std::f64::consts::PI).abs() < 1e-12);
        assert_eq!(system.particle_count(), 3);
    }

    #[test]
    fn vectorize_system_rejects_unassigned_patterns() {
        let topology = Topology::new(2).with_term(HandlerType::Bonds, "[#6:1]-[#6:2]", &[0, 1]);
        assert!(matches!(
            vectorize_system(&water_parameter_set(), &topology),
            Err(VectorizeError::MissingParameter { .. })
        ));
    }

    #[test]
    fn vectorize_system_rejects_missing_attributes() {
        let mut parameter_set = ParameterSet::new();
        parameter_set
            .add_parameter(
                HandlerType::Bonds,
                Parameter::new("[#1:1]-[#8:2]")
                    .with_attribute("k", Quantity::new(5.0, "kJ/mol/Å**2".parse().unwrap())),
            )
            .unwrap();
        let topology = Topology::new(2).with_term(HandlerType::Bonds, "[#1:1]-[#8:2]", &[0, 1]);
        assert!(matches!(
            vectorize_system(&parameter_set, &topology),
            Err(VectorizeError::MissingAttribute { attribute, .. }) if attribute == "length"
        ));
    }

    #[test]
    fn vectorize_system_rejects_out_of_range_particles() {
        let topology = Topology::new(2).with_term(HandlerType::Bonds, "[#1:1]-[#8:2]", &[0, 2]);
        assert!(matches!(
            vectorize_system(&water_parameter_set(), &topology),
            Err(VectorizeError::ParticleOutOfRange { .. })
        ));
    }

    #[test]
    fn vectorize_system_reports_wrong_arity() {
        let topology = Topology::new(3).with_term(HandlerType::Bonds, "[#1:1]-[#8:2]", &[0, 1, 2]);
        assert!(matches!(
            vectorize_system(&water_parameter_set(), &topology),
            Err(VectorizeError::System(VectorizedSystemError::Arity { .. }))
        ));
    }

    #[test]
    fn handler_new_rejects_inconsistent_rows() {
        let result = VectorizedHandler::new(
            FunctionalForm::HarmonicBond,
            vec![PotentialKey::new("[#1:1]-[#8:2]", HandlerType::Bonds)],
            DMatrix::zeros(2, 2),
            vec![vec![0, 1]],
        );
        assert!(matches!(
            result,
            Err(VectorizedSystemError::InconsistentRows { .. })
        ));
    }

    #[test]
    fn insert_rejects_form_that_does_not_match_handler() {
        let entry = VectorizedHandler::new(
            FunctionalForm::HarmonicBond,
            vec![],
            DMatrix::zeros(0, 2),
            vec![],
        )
        .unwrap();
        let mut system = VectorizedSystem::new();
        assert!(matches!(
            system.insert(HandlerType::Angles, entry),
            Err(VectorizedSystemError::FormMismatch { .. })
        ));
    }

    #[test]
    fn cotangents_zeros_like_matches_parameter_shapes() {
        let system = vectorize_system(&water_parameter_set(), &water_topology()).unwrap();
        let cotangents = ParameterCotangents::zeros_like(&system);
        for (key, handler) in &system {
            assert_eq!(
                cotangents.get(key).unwrap().shape(),
                handler.parameters().shape()
            );
        }
    }
}
