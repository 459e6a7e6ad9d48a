use super::config::{CoordinateSystem, ObjectiveSettings};
use super::{Loss, ObjectiveContribution, ObjectiveError};
use crate::core::forcefield::energy::{self, EvaluationMode};
use crate::core::forcefield::ids::ParameterId;
use crate::core::forcefield::potentials::FunctionalForm;
use crate::core::forcefield::vectorized::VectorizedSystem;
use crate::core::geometry::{
    GeometryError, gradient_projection, redundant_internal_coordinates, wilson_b_matrix,
};
use crate::metrics::Metric;
use crate::models::smirnoff::SmirnoffModel;
use crate::models::{CovarianceTransform, ParameterizationModel};
use crate::transforms::{Transform, TransformError};
use nalgebra::{DMatrix, DVector, Point3};
use thiserror::Error;
use tracing::{debug, info, instrument};

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("Missing required parameter: {0}")]
    MissingParameter(&'static str),
    #[error("At least one of reference energies or reference gradients must be provided")]
    NoReferenceData,
    #[error("Expected {name} of shape {expected:?}, found {found:?}")]
    ShapeMismatch {
        name: &'static str,
        expected: (usize, usize),
        found: (usize, usize),
    },
    #[error("Invalid conformers: {0}")]
    InvalidConformers(String),
    #[error("Weight of the {branch} loss must be finite and non-negative, found {value}")]
    InvalidWeight { branch: &'static str, value: f64 },
    #[error("Invalid {branch} transform: {source}")]
    Transform {
        branch: &'static str,
        source: TransformError,
    },
    #[error("Redundant internal coordinates require at least one bond in the starting system")]
    NoInternalCoordinates,
    #[error(transparent)]
    Geometry(#[from] GeometryError),
}

#[derive(Debug, Clone, PartialEq)]
struct Target {
    reference: DMatrix<f64>,
    transform: Transform,
    metric: Metric,
    weight: f64,
}

impl Target {
    /// Returns the weighted loss and its cotangent with respect to the untransformed prediction.
    fn loss(&self, prediction: &DMatrix<f64>) -> Result<(f64, DMatrix<f64>), ObjectiveError> {
        let transformed = self.transform.apply(prediction)?;
        let (loss, d_loss) = self.metric.evaluate(&transformed, &self.reference)?;
        let cotangent = self.transform.backward(&(d_loss * self.weight))?;
        Ok((self.weight * loss, cotangent))
    }
}

/// Maps flattened Cartesian gradients onto the space they are compared in.
#[derive(Debug, Clone, PartialEq)]
enum GradientProjection {
    Cartesian,
    /// One `(n_coordinates, 3 * n_atoms)` projection per conformer.
    Ric(Vec<DMatrix<f64>>),
}

impl GradientProjection {
    fn project(&self, gradients: &DMatrix<f64>) -> DMatrix<f64> {
        match self {
            Self::Cartesian => gradients.clone(),
            Self::Ric(projections) => {
                let n_coordinates = projections.first().map_or(0, DMatrix::nrows);
                let mut projected = DMatrix::<f64>::zeros(gradients.nrows(), n_coordinates);
                for (conformer, projection) in projections.iter().enumerate() {
                    let row = projection * gradients.row(conformer).transpose();
                    projected.set_row(conformer, &row.transpose());
                }
                projected
            }
        }
    }

    fn backward(&self, cotangent: &DMatrix<f64>) -> DMatrix<f64> {
        match self {
            Self::Cartesian => cotangent.clone(),
            Self::Ric(projections) => {
                let n_cartesian = projections.first().map_or(0, DMatrix::ncols);
                let mut cartesian = DMatrix::<f64>::zeros(cotangent.nrows(), n_cartesian);
                for (conformer, projection) in projections.iter().enumerate() {
                    let row = projection.tr_mul(&cotangent.row(conformer).transpose());
                    cartesian.set_row(conformer, &row.transpose());
                }
                cartesian
            }
        }
    }
}

/// Fits the energies and/or coordinate gradients of a fixed batch of conformers.
///
/// Every evaluation builds a fresh [`SmirnoffModel`] for the requested parameter ids,
/// so the objective itself holds no mutable state.
#[derive(Debug, Clone, PartialEq)]
pub struct EnergyObjective {
    starting_system: VectorizedSystem,
    conformers: Vec<Vec<Point3<f64>>>,
    energy: Option<Target>,
    gradient: Option<(Target, GradientProjection)>,
    covariance: CovarianceTransform,
}

impl EnergyObjective {
    pub fn builder() -> EnergyObjectiveBuilder {
        EnergyObjectiveBuilder::new()
    }

    pub fn starting_system(&self) -> &VectorizedSystem {
        &self.starting_system
    }

    pub fn n_conformers(&self) -> usize {
        self.conformers.len()
    }

    pub fn fits_energies(&self) -> bool {
        self.energy.is_some()
    }

    pub fn fits_gradients(&self) -> bool {
        self.gradient.is_some()
    }
}

impl ObjectiveContribution for EnergyObjective {
    #[instrument(skip_all, name = "energy_objective", fields(n_parameters = parameter_ids.len()))]
    fn evaluate(
        &self,
        parameter_delta: &DVector<f64>,
        parameter_ids: &[ParameterId],
    ) -> Result<Loss, ObjectiveError> {
        let mut model = SmirnoffModel::new(parameter_ids, None, self.covariance.clone())?;
        model.set_parameter_delta(parameter_delta.clone())?;
        let system = model.forward(&self.starting_system);

        let mode = if self.gradient.is_some() {
            EvaluationMode::EnergiesAndGradients
        } else {
            EvaluationMode::Energies
        };
        let evaluation = energy::evaluate(&system, &self.conformers, mode)?;

        let mut value = 0.0;

        let mut energy_cotangent = None;
        if let Some(target) = &self.energy {
            let (loss, cotangent) = target.loss(evaluation.energies())?;
            debug!(energy_loss = loss, "Evaluated energy loss.");
            value += loss;
            energy_cotangent = Some(cotangent);
        }

        let mut gradient_cotangent = None;
        if let (Some((target, projection)), Some(gradients)) = (&self.gradient, evaluation.gradients())
        {
            let (loss, cotangent) = target.loss(&projection.project(gradients))?;
            debug!(gradient_loss = loss, "Evaluated gradient loss.");
            value += loss;
            gradient_cotangent = Some(projection.backward(&cotangent));
        }

        let cotangents =
            evaluation.backward(energy_cotangent.as_ref(), gradient_cotangent.as_ref())?;
        let gradient = model.backward(&self.starting_system, &cotangents);

        Ok(Loss::new(value, gradient))
    }
}

#[derive(Default)]
pub struct EnergyObjectiveBuilder {
    starting_system: Option<VectorizedSystem>,
    conformers: Option<Vec<Vec<Point3<f64>>>>,
    reference_energies: Option<DMatrix<f64>>,
    reference_gradients: Option<DMatrix<f64>>,
    energy_transform: Option<Transform>,
    energy_metric: Option<Metric>,
    energy_weight: Option<f64>,
    gradient_transform: Option<Transform>,
    gradient_metric: Option<Metric>,
    gradient_weight: Option<f64>,
    gradient_coordinate_system: Option<CoordinateSystem>,
    covariance_transform: Option<CovarianceTransform>,
}

impl EnergyObjectiveBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn starting_system(mut self, system: VectorizedSystem) -> Self {
        self.starting_system = Some(system);
        self
    }
    /// Conformer coordinates in Å, one inner vector of atom positions per conformer.
    pub fn conformers(mut self, conformers: Vec<Vec<Point3<f64>>>) -> Self {
        self.conformers = Some(conformers);
        self
    }
    /// Shape `(n_conformers, 1)`, in kJ/mol.
    pub fn reference_energies(mut self, energies: DMatrix<f64>) -> Self {
        self.reference_energies = Some(energies);
        self
    }
    /// Shape `(n_conformers, 3 * n_atoms)`, atom-major `x, y, z`, in kJ/mol/Å.
    pub fn reference_gradients(mut self, gradients: DMatrix<f64>) -> Self {
        self.reference_gradients = Some(gradients);
        self
    }
    pub fn energy_transform(mut self, transform: Transform) -> Self {
        self.energy_transform = Some(transform);
        self
    }
    pub fn energy_metric(mut self, metric: Metric) -> Self {
        self.energy_metric = Some(metric);
        self
    }
    pub fn energy_weight(mut self, weight: f64) -> Self {
        self.energy_weight = Some(weight);
        self
    }
    pub fn gradient_transform(mut self, transform: Transform) -> Self {
        self.gradient_transform = Some(transform);
        self
    }
    pub fn gradient_metric(mut self, metric: Metric) -> Self {
        self.gradient_metric = Some(metric);
        self
    }
    pub fn gradient_weight(mut self, weight: f64) -> Self {
        self.gradient_weight = Some(weight);
        self
    }
    pub fn gradient_coordinate_system(mut self, coordinate_system: CoordinateSystem) -> Self {
        self.gradient_coordinate_system = Some(coordinate_system);
        self
    }
    pub fn covariance_transform(mut self, covariance: CovarianceTransform) -> Self {
        self.covariance_transform = Some(covariance);
        self
    }

    /// Applies every transform, metric, weight and coordinate system selection of `settings`.
    pub fn settings(self, settings: &ObjectiveSettings) -> Self {
        self.energy_transform(settings.energy.transform)
            .energy_metric(settings.energy.metric)
            .energy_weight(settings.energy.weight)
            .gradient_transform(settings.gradient.transform)
            .gradient_metric(settings.gradient.metric)
            .gradient_weight(settings.gradient.weight)
            .gradient_coordinate_system(settings.gradient.coordinate_system)
    }

    pub fn build(self) -> Result<EnergyObjective, ConfigError> {
        let starting_system = self
            .starting_system
            .ok_or(ConfigError::MissingParameter("starting_system"))?;
        let conformers = self
            .conformers
            .ok_or(ConfigError::MissingParameter("conformers"))?;
        if self.reference_energies.is_none() && self.reference_gradients.is_none() {
            return Err(ConfigError::NoReferenceData);
        }

        let n_atoms = validate_conformers(&conformers, &starting_system)?;
        let n_conformers = conformers.len();

        let energy = self
            .reference_energies
            .map(|reference| {
                check_shape("reference energies", &reference, (n_conformers, 1))?;
                build_target(
                    "energy",
                    reference,
                    self.energy_transform.unwrap_or_default(),
                    self.energy_metric.unwrap_or_default(),
                    self.energy_weight.unwrap_or(1.0),
                )
            })
            .transpose()?;

        let coordinate_system = self.gradient_coordinate_system.unwrap_or_default();
        let gradient = self
            .reference_gradients
            .map(|reference| {
                check_shape("reference gradients", &reference, (n_conformers, 3 * n_atoms))?;
                let projection = match coordinate_system {
                    CoordinateSystem::Cartesian => GradientProjection::Cartesian,
                    CoordinateSystem::Ric => ric_projection(&starting_system, &conformers)?,
                };
                let target = build_target(
                    "gradient",
                    projection.project(&reference),
                    self.gradient_transform.unwrap_or_default(),
                    self.gradient_metric.unwrap_or_default(),
                    self.gradient_weight.unwrap_or(1.0),
                )?;
                Ok::<_, ConfigError>((target, projection))
            })
            .transpose()?;

        info!(
            "Built energy objective over {} conformer(s) of {} atom(s) (energies: {}, gradients: {}).",
            n_conformers,
            n_atoms,
            energy.is_some(),
            gradient
                .as_ref()
                .map_or_else(|| "none".to_string(), |_| coordinate_system.to_string())
        );

        Ok(EnergyObjective {
            starting_system,
            conformers,
            energy,
            gradient,
            covariance: self.covariance_transform.unwrap_or_default(),
        })
    }
}

fn validate_conformers(
    conformers: &[Vec<Point3<f64>>],
    system: &VectorizedSystem,
) -> Result<usize, ConfigError> {
    let Some(first) = conformers.first() else {
        return Err(ConfigError::InvalidConformers(
            "at least one conformer is required".to_string(),
        ));
    };
    let n_atoms = first.len();
    if let Some(index) = conformers.iter().position(|c| c.len() != n_atoms) {
        return Err(ConfigError::InvalidConformers(format!(
            "conformer {index} has {} atoms but conformer 0 has {n_atoms}",
            conformers[index].len()
        )));
    }
    let required = system.particle_count();
    if required > n_atoms {
        return Err(ConfigError::InvalidConformers(format!(
            "the starting system references {required} atoms but conformers contain {n_atoms}"
        )));
    }
    Ok(n_atoms)
}

fn check_shape(
    name: &'static str,
    matrix: &DMatrix<f64>,
    expected: (usize, usize),
) -> Result<(), ConfigError> {
    if matrix.shape() != expected {
        return Err(ConfigError::ShapeMismatch {
            name,
            expected,
            found: matrix.shape(),
        });
    }
    Ok(())
}

fn build_target(
    branch: &'static str,
    reference: DMatrix<f64>,
    transform: Transform,
    metric: Metric,
    weight: f64,
) -> Result<Target, ConfigError> {
    if !weight.is_finite() || weight < 0.0 {
        return Err(ConfigError::InvalidWeight {
            branch,
            value: weight,
        });
    }
    let reference = transform
        .apply(&reference)
        .map_err(|source| ConfigError::Transform { branch, source })?;
    Ok(Target {
        reference,
        transform,
        metric,
        weight,
    })
}

fn ric_projection(
    system: &VectorizedSystem,
    conformers: &[Vec<Point3<f64>>],
) -> Result<GradientProjection, ConfigError> {
    let bonds: Vec<(usize, usize)> = system
        .iter()
        .filter(|(key, _)| key.1 == FunctionalForm::HarmonicBond)
        .flat_map(|(_, handler)| handler.particle_indices())
        .filter_map(|particles| match particles.as_slice() {
            &[i, j] => Some((i, j)),
            _ => None,
        })
        .collect();

    let coordinates = redundant_internal_coordinates(&bonds);
    if coordinates.is_empty() {
        return Err(ConfigError::NoInternalCoordinates);
    }
    debug!(
        "Projecting gradients onto {} redundant internal coordinate(s).",
        coordinates.len()
    );

    let projections = conformers
        .iter()
        .map(|positions| gradient_projection(&wilson_b_matrix(&coordinates, positions)?))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(GradientProjection::Ric(projections))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::forcefield::ids::HandlerType;
    use crate::core::forcefield::params::{Parameter, ParameterSet};
    use crate::core::forcefield::units::Quantity;
    use crate::core::forcefield::vectorized::{Topology, vectorize_system};
    use crate::models::ModelError;
    use crate::{metrics, transforms};

    fn hcl_system(k: f64, length: f64) -> VectorizedSystem {
        let mut parameter_set = ParameterSet::new();
        parameter_set
            .add_parameter(
                HandlerType::Bonds,
                Parameter::new("[#1:1]-[#17:2]")
                    .with_attribute("k", Quantity::new(k, "kJ/mol/Å**2".parse().unwrap()))
                    .with_attribute("length", Quantity::new(length, "Å".parse().unwrap())),
            )
            .unwrap();
        let topology = Topology::new(2).with_term(HandlerType::Bonds, "[#1:1]-[#17:2]", &[0, 1]);
        vectorize_system(&parameter_set, &topology).unwrap()
    }

    fn water_system() -> VectorizedSystem {
        let mut parameter_set = ParameterSet::new();
        parameter_set
            .add_parameter(
                HandlerType::Bonds,
                Parameter::new("[#1:1]-[#8:2]")
                    .with_attribute("k", Quantity::new(400.0, "kJ/mol/Å**2".parse().unwrap()))
                    .with_attribute("length", Quantity::new(0.96, "Å".parse().unwrap())),
            )
            .unwrap();
        parameter_set
            .add_parameter(
                HandlerType::Angles,
                Parameter::new("[#1:1]-[#8:2]-[#1:3]")
                    .with_attribute("k", Quantity::new(80.0, "kJ/mol/rad**2".parse().unwrap()))
                    .with_attribute("angle", Quantity::new(104.5, "degree".parse().unwrap())),
            )
            .unwrap();
        let topology = Topology::new(3)
            .with_term(HandlerType::Bonds, "[#1:1]-[#8:2]", &[0, 1])
            .with_term(HandlerType::Bonds, "[#1:1]-[#8:2]", &[0, 2])
            .with_term(HandlerType::Angles, "[#1:1]-[#8:2]-[#1:3]", &[1, 0, 2]);
        vectorize_system(&parameter_set, &topology).unwrap()
    }

    fn water_conformers() -> Vec<Vec<Point3<f64>>> {
        vec![
            vec![
                Point3::new(0.0, 0.0, 0.1),
                Point3::new(0.95, 0.1, 0.0),
                Point3::new(-0.3, 0.92, 0.05),
            ],
            vec![
                Point3::new(0.02, -0.05, 0.0),
                Point3::new(1.01, 0.0, -0.1),
                Point3::new(-0.21, 0.97, 0.0),
            ],
            vec![
                Point3::new(0.0, 0.03, 0.0),
                Point3::new(0.9, -0.2, 0.1),
                Point3::new(-0.35, 0.88, -0.05),
            ],
        ]
    }

    fn hcl_conformers() -> Vec<Vec<Point3<f64>>> {
        [1.0, 2.5]
            .iter()
            .map(|r| vec![Point3::new(-0.5 * r, 0.0, 0.0), Point3::new(0.5 * r, 0.0, 0.0)])
            .collect()
    }

    fn hcl_reference_energies() -> DMatrix<f64> {
        DMatrix::from_column_slice(2, 1, &[1.25 * 1.0, 1.25 * 0.25])
    }

    fn hcl_reference_gradients() -> DMatrix<f64> {
        DMatrix::from_row_slice(
            2,
            6,
            &[2.5, 0.0, 0.0, -2.5, 0.0, 0.0, -1.25, 0.0, 0.0, 1.25, 0.0, 0.0],
        )
    }

    fn bond_k() -> Vec<ParameterId> {
        vec![ParameterId::new(HandlerType::Bonds, "[#1:1]-[#17:2]", "k")]
    }

    #[test]
    fn build_requires_starting_system_and_conformers() {
        let result = EnergyObjective::builder()
            .conformers(hcl_conformers())
            .reference_energies(hcl_reference_energies())
            .build();
        assert_eq!(
            result.unwrap_err(),
            ConfigError::MissingParameter("starting_system")
        );

        let result = EnergyObjective::builder()
            .starting_system(hcl_system(5.0, 2.0))
            .reference_energies(hcl_reference_energies())
            .build();
        assert_eq!(result.unwrap_err(), ConfigError::MissingParameter("conformers"));
    }

    #[test]
    fn build_requires_reference_data() {
        let result = EnergyObjective::builder()
            .starting_system(hcl_system(5.0, 2.0))
            .conformers(hcl_conformers())
            .build();
        assert_eq!(result.unwrap_err(), ConfigError::NoReferenceData);
    }

    #[test]
    fn build_rejects_mismatched_reference_shapes() {
        let result = EnergyObjective::builder()
            .starting_system(hcl_system(5.0, 2.0))
            .conformers(hcl_conformers())
            .reference_gradients(DMatrix::zeros(2, 3))
            .build();
        assert_eq!(
            result.unwrap_err(),
            ConfigError::ShapeMismatch {
                name: "reference gradients",
                expected: (2, 6),
                found: (2, 3)
            }
        );
    }

    #[test]
    fn build_rejects_conformers_missing_atoms() {
        let result = EnergyObjective::builder()
            .starting_system(hcl_system(5.0, 2.0))
            .conformers(vec![vec![Point3::origin()]])
            .reference_energies(DMatrix::zeros(1, 1))
            .build();
        assert!(matches!(result, Err(ConfigError::InvalidConformers(_))));

        let result = EnergyObjective::builder()
            .starting_system(hcl_system(5.0, 2.0))
            .conformers(vec![])
            .reference_energies(DMatrix::zeros(0, 1))
            .build();
        assert!(matches!(result, Err(ConfigError::InvalidConformers(_))));
    }

    #[test]
    fn build_rejects_out_of_range_transform_index() {
        let result = EnergyObjective::builder()
            .starting_system(hcl_system(5.0, 2.0))
            .conformers(hcl_conformers())
            .reference_energies(hcl_reference_energies())
            .energy_transform(transforms::relative(2))
            .build();
        assert!(matches!(
            result,
            Err(ConfigError::Transform {
                branch: "energy",
                source: TransformError::IndexOutOfRange { index: 2, .. }
            })
        ));
    }

    #[test]
    fn build_rejects_negative_weights() {
        let result = EnergyObjective::builder()
            .starting_system(hcl_system(5.0, 2.0))
            .conformers(hcl_conformers())
            .reference_gradients(hcl_reference_gradients())
            .gradient_weight(-1.0)
            .build();
        assert_eq!(
            result.unwrap_err(),
            ConfigError::InvalidWeight {
                branch: "gradient",
                value: -1.0
            }
        );
    }

    #[test]
    fn build_applies_settings() {
        let settings = ObjectiveSettings::from_toml_str(
            "[gradient]\ncoordinate-system = \"ric\"\ntransform = { type = \"relative\" }\n",
        )
        .unwrap();
        let objective = EnergyObjective::builder()
            .starting_system(hcl_system(5.0, 2.0))
            .conformers(hcl_conformers())
            .reference_gradients(hcl_reference_gradients())
            .settings(&settings)
            .build()
            .unwrap();
        assert!(objective.fits_gradients());
        assert!(!objective.fits_energies());
        assert!(matches!(
            objective.gradient,
            Some((
                Target {
                    transform: Transform::Relative { index: 0 },
                    ..
                },
                GradientProjection::Ric(_)
            ))
        ));
    }

    #[test]
    fn energy_loss_matches_closed_form() {
        let objective = EnergyObjective::builder()
            .starting_system(hcl_system(5.0, 2.0))
            .conformers(hcl_conformers())
            .reference_energies(hcl_reference_energies())
            .build()
            .unwrap();

        // E(k) = k/2 (r - 2)^2 so residuals are (k - 2.5)/2 * (r - 2)^2.
        let loss = objective.evaluate(&DVector::zeros(1), &bond_k()).unwrap();
        let residuals = [1.25 * 1.0, 1.25 * 0.25];
        let expected = residuals.iter().map(|r| r * r).sum::<f64>() / 2.0;
        let expected_gradient =
            residuals.iter().zip([0.5, 0.125]).map(|(r, d)| r * d).sum::<f64>();
        assert!((loss.value - expected).abs() < 1e-12);
        assert!((loss.gradient[0] - expected_gradient).abs() < 1e-12);
    }

    #[test]
    fn loss_is_zero_at_reference_parameters() {
        for coordinate_system in [CoordinateSystem::Cartesian, CoordinateSystem::Ric] {
            let objective = EnergyObjective::builder()
                .starting_system(hcl_system(5.0, 2.0))
                .conformers(hcl_conformers())
                .reference_energies(hcl_reference_energies())
                .reference_gradients(hcl_reference_gradients())
                .gradient_coordinate_system(coordinate_system)
                .build()
                .unwrap();
            let loss = objective
                .evaluate(&DVector::from_element(1, -2.5), &bond_k())
                .unwrap();
            assert!(loss.value.abs() < 1e-20, "{coordinate_system}");
            assert!(loss.gradient[0].abs() < 1e-10, "{coordinate_system}");
        }
    }

    #[test]
    fn ric_and_cartesian_gradient_losses_agree_for_diatomic() {
        let build = |coordinate_system| {
            EnergyObjective::builder()
                .starting_system(hcl_system(5.0, 2.0))
                .conformers(hcl_conformers())
                .reference_gradients(hcl_reference_gradients())
                .gradient_coordinate_system(coordinate_system)
                .build()
                .unwrap()
        };
        let cartesian = build(CoordinateSystem::Cartesian)
            .evaluate(&DVector::zeros(1), &bond_k())
            .unwrap();
        let ric = build(CoordinateSystem::Ric)
            .evaluate(&DVector::zeros(1), &bond_k())
            .unwrap();

        // One bond coordinate against six Cartesian components, two of them nonzero.
        assert!((ric.value - 3.0 * cartesian.value).abs() < 1e-9);
        assert!(ric.gradient[0] * cartesian.gradient[0] > 0.0);
    }

    #[test]
    fn gradient_matches_finite_differences() {
        let parameter_ids = vec![
            ParameterId::new(HandlerType::Bonds, "[#1:1]-[#8:2]", "k"),
            ParameterId::new(HandlerType::Bonds, "[#1:1]-[#8:2]", "length"),
            ParameterId::new(HandlerType::Angles, "[#1:1]-[#8:2]-[#1:3]", "angle"),
        ];
        let conformers = water_conformers();
        let reference_system = water_system();
        let reference = energy::evaluate(
            &reference_system,
            &conformers,
            EvaluationMode::EnergiesAndGradients,
        )
        .unwrap();
        let perturbed_energies = reference.energies().map(|e| e * 1.1 + 0.3);
        let perturbed_gradients = reference.gradients().unwrap().map(|g| g * 0.9 - 0.05);

        for (energy_transform, coordinate_system, metric) in [
            (transforms::identity(), CoordinateSystem::Cartesian, metrics::mse()),
            (transforms::relative(1), CoordinateSystem::Ric, metrics::mse()),
            (transforms::relative(0), CoordinateSystem::Cartesian, metrics::mae()),
        ] {
            let objective = EnergyObjective::builder()
                .starting_system(water_system())
                .conformers(conformers.clone())
                .reference_energies(perturbed_energies.clone())
                .reference_gradients(perturbed_gradients.clone())
                .energy_transform(energy_transform)
                .energy_metric(metric)
                .gradient_metric(metrics::mse())
                .gradient_transform(transforms::relative(2))
                .gradient_coordinate_system(coordinate_system)
                .energy_weight(0.7)
                .gradient_weight(0.2)
                .build()
                .unwrap();

            let delta = DVector::from_vec(vec![5.0, 0.02, -0.03]);
            let analytic = objective.evaluate(&delta, &parameter_ids).unwrap();

            let step = 1e-6;
            for i in 0..delta.len() {
                let mut plus = delta.clone();
                plus[i] += step;
                let mut minus = delta.clone();
                minus[i] -= step;
                let numeric = (objective.evaluate(&plus, &parameter_ids).unwrap().value
                    - objective.evaluate(&minus, &parameter_ids).unwrap().value)
                    / (2.0 * step);
                assert!(
                    (numeric - analytic.gradient[i]).abs() < 1e-4 * (1.0 + numeric.abs()),
                    "{coordinate_system} {i}: {numeric} vs {}",
                    analytic.gradient[i]
                );
            }
        }
    }

    #[test]
    fn covariance_transform_maps_gradient_onto_latent_delta() {
        let parameter_ids = vec![
            ParameterId::new(HandlerType::Bonds, "[#1:1]-[#8:2]", "k"),
            ParameterId::new(HandlerType::Bonds, "[#1:1]-[#8:2]", "length"),
        ];
        let conformers = water_conformers();
        let energies = energy::evaluate(&water_system(), &conformers, EvaluationMode::Energies)
            .unwrap()
            .energies()
            .map(|e| e + 1.0);

        let build = |covariance| {
            EnergyObjective::builder()
                .starting_system(water_system())
                .conformers(conformers.clone())
                .reference_energies(energies.clone())
                .covariance_transform(covariance)
                .build()
                .unwrap()
        };

        let matrix = DMatrix::from_row_slice(2, 1, &[10.0, 0.01]);
        let latent = build(CovarianceTransform::Matrix(matrix.clone()))
            .evaluate(&DVector::from_element(1, 0.5), &parameter_ids)
            .unwrap();
        let direct = build(CovarianceTransform::Identity)
            .evaluate(&(&matrix * DVector::from_element(1, 0.5)), &parameter_ids)
            .unwrap();

        assert!((latent.value - direct.value).abs() < 1e-12);
        assert_eq!(latent.gradient.len(), 1);
        assert!((latent.gradient[0] - matrix.tr_mul(&direct.gradient)[0]).abs() < 1e-9);
    }

    #[test]
    fn evaluate_rejects_delta_of_wrong_length() {
        let objective = EnergyObjective::builder()
            .starting_system(hcl_system(5.0, 2.0))
            .conformers(hcl_conformers())
            .reference_energies(hcl_reference_energies())
            .build()
            .unwrap();
        assert!(matches!(
            objective.evaluate(&DVector::zeros(2), &bond_k()),
            Err(ObjectiveError::Model(ModelError::ShapeMismatch { .. }))
        ));
    }

    #[test]
    fn evaluate_is_deterministic() {
        let objective = EnergyObjective::builder()
            .starting_system(water_system())
            .conformers(water_conformers())
            .reference_energies(DMatrix::zeros(3, 1))
            .reference_gradients(DMatrix::zeros(3, 9))
            .gradient_coordinate_system(CoordinateSystem::Ric)
            .build()
            .unwrap();
        let ids = vec![ParameterId::new(HandlerType::Angles, "[#1:1]-[#8:2]-[#1:3]", "k")];
        let delta = DVector::from_element(1, 3.0);
        assert_eq!(
            objective.evaluate(&delta, &ids).unwrap(),
            objective.evaluate(&delta, &ids).unwrap()
        );
    }
}
