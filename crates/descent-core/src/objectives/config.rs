use crate::metrics::Metric;
use crate::transforms::Transform;
use serde::Deserialize;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

/// The space reference and predicted gradients are compared in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CoordinateSystem {
    #[default]
    Cartesian,
    /// Redundant internal coordinates: bonds, angles and proper dihedrals.
    Ric,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("Unknown coordinate system '{0}', expected 'cartesian' or 'ric'")]
pub struct ParseCoordinateSystemError(pub String);

impl FromStr for CoordinateSystem {
    type Err = ParseCoordinateSystemError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cartesian" => Ok(Self::Cartesian),
            "ric" => Ok(Self::Ric),
            other => Err(ParseCoordinateSystemError(other.to_string())),
        }
    }
}

impl fmt::Display for CoordinateSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Cartesian => "cartesian",
            Self::Ric => "ric",
        })
    }
}

#[derive(Debug, Error)]
pub enum SettingsError {
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
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct EnergySettings {
    pub transform: Transform,
    pub metric: Metric,
    pub weight: f64,
}

impl Default for EnergySettings {
    fn default() -> Self {
        Self {
            transform: Transform::Identity,
            metric: Metric::Mse,
            weight: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct GradientSettings {
    pub transform: Transform,
    pub metric: Metric,
    pub weight: f64,
    pub coordinate_system: CoordinateSystem,
}

impl Default for GradientSettings {
    fn default() -> Self {
        Self {
            transform: Transform::Identity,
            metric: Metric::Mse,
            weight: 1.0,
            coordinate_system: CoordinateSystem::Cartesian,
        }
    }
}

/// Transform, metric and weight selections of an energy objective.
///
/// ```toml
/// [energy]
/// transform = { type = "relative", index = 0 }
/// metric = "mse"
///
/// [gradient]
/// coordinate-system = "ric"
/// weight = 0.5
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Default, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct ObjectiveSettings {
    pub energy: EnergySettings,
    pub gradient: GradientSettings,
}

impl ObjectiveSettings {
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        let content = std::fs::read_to_string(path).map_err(|e| SettingsError::Io {
            path: path.to_string_lossy().to_string(),
            source: e,
        })?;
        Self::parse(&content, &path.to_string_lossy())
    }

    pub fn from_toml_str(content: &str) -> Result<Self, SettingsError> {
        Self::parse(content, "<string>")
    }

    fn parse(content: &str, path: &str) -> Result<Self, SettingsError> {
        toml::from_str(content).map_err(|e| SettingsError::Toml {
            path: path.to_string(),
            source: e,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{metrics, transforms};
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn defaults_use_identity_mse_and_unit_weights() {
        let settings = ObjectiveSettings::from_toml_str("").unwrap();
        assert_eq!(settings, ObjectiveSettings::default());
        assert_eq!(settings.energy.weight, 1.0);
        assert_eq!(settings.gradient.coordinate_system, CoordinateSystem::Cartesian);
    }

    #[test]
    fn from_toml_str_reads_every_selection() {
        let settings = ObjectiveSettings::from_toml_str(
            r#"
            [energy]
            transform = { type = "relative", index = 1 }
            metric = "mae"
            weight = 2.0

            [gradient]
            transform = { type = "identity" }
            coordinate-system = "ric"
            weight = 0.5
            "#,
        )
        .unwrap();

        assert_eq!(settings.energy.transform, transforms::relative(1));
        assert_eq!(settings.energy.metric, metrics::mae());
        assert_eq!(settings.energy.weight, 2.0);
        assert_eq!(settings.gradient.transform, transforms::identity());
        assert_eq!(settings.gradient.metric, metrics::mse());
        assert_eq!(settings.gradient.coordinate_system, CoordinateSystem::Ric);
    }

    #[test]
    fn from_toml_str_rejects_unknown_fields() {
        let result = ObjectiveSettings::from_toml_str(
            r#"
            [energy]
            learning-rate = 0.1
            "#,
        );
        assert!(matches!(result, Err(SettingsError::Toml { .. })));
    }

    #[test]
    fn load_reads_settings_from_disk() {
        let dir = tempdir().unwrap();
        let file_path = dir.path().join("objective.toml");
        fs::write(&file_path, "[gradient]\ncoordinate-system = \"ric\"\n").unwrap();

        let settings = ObjectiveSettings::load(&file_path).unwrap();
        assert_eq!(settings.gradient.coordinate_system, CoordinateSystem::Ric);
    }

    #[test]
    fn load_fails_for_missing_file() {
        let dir = tempdir().unwrap();
        let result = ObjectiveSettings::load(&dir.path().join("missing.toml"));
        assert!(matches!(result, Err(SettingsError::Io { .. })));
    }

    #[test]
    fn coordinate_system_parses_selector_strings() {
        assert_eq!("cartesian".parse::<CoordinateSystem>(), Ok(CoordinateSystem::Cartesian));
        assert_eq!(" RIC ".parse::<CoordinateSystem>(), Ok(CoordinateSystem::Ric));
        assert_eq!(
            "internal".parse::<CoordinateSystem>(),
            Err(ParseCoordinateSystemError("internal".to_string()))
        );
        assert_eq!(CoordinateSystem::Ric.to_string(), "ric");
    }
}
