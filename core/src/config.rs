//! Filter configuration and its file formats.
//!
//! A single [`LocalizationConfig`] carries every tunable of the pipeline: the swarm size, the
//! stride constant, the noise model, the geometric filter tolerances, the resampling scheme and the
//! floor-map decoding thresholds. Configurations can be written to and read from JSON, YAML or
//! TOML; [`LocalizationConfig::to_file`] and [`LocalizationConfig::from_file`] pick the format from
//! the file extension. Missing fields fall back to their defaults.
use serde::{Deserialize, Serialize};
use std::f64::consts::{FRAC_PI_2, PI};
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;

use crate::error::{LocalizationError, Result};
use crate::heading::{GyroAxis, IntegrationMethod};
use crate::particle::{ParticleAveragingStrategy, ResamplingStrategy};

/// Thresholds used to turn floor-plan pixels into walkable and blocked cells.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FloorMapConfig {
    /// World units per pixel.
    pub resolution: f64,
    /// Minimum luminance (0-255) of a walkable pixel. Darker pixels are walls.
    pub occupied_threshold: u8,
    /// Minimum alpha (0-255) of a walkable pixel. More transparent pixels are outside the floor.
    pub alpha_threshold: u8,
}

impl Default for FloorMapConfig {
    fn default() -> Self {
        FloorMapConfig {
            resolution: 1.0,
            occupied_threshold: 128,
            alpha_threshold: 128,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalizationConfig {
    /// Number of particles N carried by every generation.
    pub num_particles: usize,
    /// Stride length applied for every detected step (world units).
    pub step_length: f64,
    /// Standard deviation of the heading noise added during prediction (radians).
    pub heading_noise_std: f64,
    /// Standard deviation of the positional noise added during prediction (world units).
    pub position_noise_std: f64,
    /// Half-width of the uniform heading jitter given to freshly seeded particles (radians).
    pub initial_heading_jitter: f64,
    /// Largest accepted angle between a particle's travel direction and its heading (radians).
    pub direction_tolerance: f64,
    /// Positional jitter of resampled duplicates per unit of step length.
    pub resample_position_jitter: f64,
    /// Heading jitter of resampled duplicates per unit of step length (radians).
    pub resample_heading_jitter: f64,
    /// Wall clearance beyond which a particle gains no additional resampling weight.
    pub clearance_cap: f64,
    /// Spread at or below which the swarm is considered converged.
    pub convergence_threshold: f64,
    pub resampling_strategy: ResamplingStrategy,
    pub averaging_strategy: ParticleAveragingStrategy,
    pub integration_method: IntegrationMethod,
    pub gyro_axis: GyroAxis,
    /// Base seed used by the replay tooling.
    pub seed: u64,
    pub floor_map: FloorMapConfig,
}

impl Default for LocalizationConfig {
    fn default() -> Self {
        LocalizationConfig {
            num_particles: 500,
            step_length: 0.7,
            heading_noise_std: 0.05,
            position_noise_std: 0.05,
            initial_heading_jitter: PI,
            direction_tolerance: FRAC_PI_2,
            resample_position_jitter: 0.1,
            resample_heading_jitter: 0.05,
            clearance_cap: 5.0,
            convergence_threshold: 5.0,
            resampling_strategy: ResamplingStrategy::default(),
            averaging_strategy: ParticleAveragingStrategy::default(),
            integration_method: IntegrationMethod::default(),
            gyro_axis: GyroAxis::default(),
            seed: 42,
            floor_map: FloorMapConfig::default(),
        }
    }
}

fn non_negative(name: &str, value: f64) -> Result<()> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(LocalizationError::InvalidConfiguration(format!(
            "{name} must be finite and non-negative, got {value}"
        )))
    }
}

impl LocalizationConfig {
    /// Check every field for a usable value.
    pub fn validate(&self) -> Result<()> {
        if self.num_particles == 0 {
            return Err(LocalizationError::InvalidConfiguration(
                "num_particles must be positive".to_string(),
            ));
        }
        non_negative("step_length", self.step_length)?;
        non_negative("heading_noise_std", self.heading_noise_std)?;
        non_negative("position_noise_std", self.position_noise_std)?;
        non_negative("initial_heading_jitter", self.initial_heading_jitter)?;
        non_negative("resample_position_jitter", self.resample_position_jitter)?;
        non_negative("resample_heading_jitter", self.resample_heading_jitter)?;
        non_negative("clearance_cap", self.clearance_cap)?;
        non_negative("convergence_threshold", self.convergence_threshold)?;
        if !(self.direction_tolerance > 0.0 && self.direction_tolerance <= PI) {
            return Err(LocalizationError::InvalidConfiguration(format!(
                "direction_tolerance must lie in (0, pi], got {}",
                self.direction_tolerance
            )));
        }
        if !(self.floor_map.resolution.is_finite() && self.floor_map.resolution > 0.0) {
            return Err(LocalizationError::InvalidConfiguration(format!(
                "floor_map.resolution must be positive, got {}",
                self.floor_map.resolution
            )));
        }
        Ok(())
    }

    /// Save as pretty-printed JSON.
    pub fn to_json<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        serde_json::to_writer_pretty(File::create(path)?, self).map_err(io::Error::other)
    }

    pub fn from_json<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        serde_json::from_reader(File::open(path)?).map_err(io::Error::other)
    }

    pub fn to_yaml<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let text = serde_yaml::to_string(self).map_err(io::Error::other)?;
        File::create(path)?.write_all(text.as_bytes())
    }

    pub fn from_yaml<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        serde_yaml::from_reader(File::open(path)?).map_err(io::Error::other)
    }

    pub fn to_toml<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let text = toml::to_string(self).map_err(io::Error::other)?;
        File::create(path)?.write_all(text.as_bytes())
    }

    /// Load a TOML filter configuration. Tables and keys left out keep their defaults.
    pub fn from_toml<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let mut text = String::new();
        File::open(path)?.read_to_string(&mut text)?;
        toml::from_str(&text).map_err(io::Error::other)
    }

    /// Save in the format named by the extension of `path`.
    ///
    /// Fails with [`io::ErrorKind::InvalidInput`] for anything other than `json`, `yaml`, `yml` or
    /// `toml`.
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let path = path.as_ref();
        match ConfigFormat::of(path)? {
            ConfigFormat::Json => self.to_json(path),
            ConfigFormat::Yaml => self.to_yaml(path),
            ConfigFormat::Toml => self.to_toml(path),
        }
    }

    /// Counterpart of [`to_file`](Self::to_file). The result is not validated.
    pub fn from_file<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let path = path.as_ref();
        match ConfigFormat::of(path)? {
            ConfigFormat::Json => Self::from_json(path),
            ConfigFormat::Yaml => Self::from_yaml(path),
            ConfigFormat::Toml => Self::from_toml(path),
        }
    }
}

/// On-disk encodings of a [`LocalizationConfig`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ConfigFormat {
    Json,
    Yaml,
    Toml,
}

impl ConfigFormat {
    fn of(path: &Path) -> io::Result<Self> {
        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase);
        match extension.as_deref() {
            Some("json") => Ok(ConfigFormat::Json),
            Some("yaml" | "yml") => Ok(ConfigFormat::Yaml),
            Some("toml") => Ok(ConfigFormat::Toml),
            other => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "cannot infer a configuration format from {} (extension {:?})",
                    path.display(),
                    other.unwrap_or("")
                ),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn sample_cfg() -> LocalizationConfig {
        LocalizationConfig {
            num_particles: 250,
            step_length: 0.65,
            resampling_strategy: ResamplingStrategy::Residual,
            averaging_strategy: ParticleAveragingStrategy::UnweightedAverage,
            integration_method: IntegrationMethod::Rectangular,
            gyro_axis: GyroAxis::X,
            floor_map: FloorMapConfig {
                resolution: 0.05,
                occupied_threshold: 100,
                alpha_threshold: 10,
            },
            seed: 7,
            ..LocalizationConfig::default()
        }
    }

    #[test]
    fn default_config_is_valid() {
        assert!(LocalizationConfig::default().validate().is_ok());
    }

    #[test]
    fn validate_rejects_bad_values() {
        let cfg = LocalizationConfig {
            num_particles: 0,
            ..LocalizationConfig::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(LocalizationError::InvalidConfiguration(_))
        ));

        let cfg = LocalizationConfig {
            heading_noise_std: -0.1,
            ..LocalizationConfig::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = LocalizationConfig {
            direction_tolerance: 0.0,
            ..LocalizationConfig::default()
        };
        assert!(cfg.validate().is_err());

        let mut cfg = LocalizationConfig::default();
        cfg.floor_map.resolution = 0.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn json_roundtrip() {
        let cfg = sample_cfg();
        let f = NamedTempFile::new().unwrap();
        let path = f.path().with_extension("json");
        cfg.to_json(&path).unwrap();
        let loaded = LocalizationConfig::from_json(&path).unwrap();
        assert_eq!(cfg, loaded);
    }

    #[test]
    fn yaml_roundtrip() {
        let cfg = sample_cfg();
        let f = NamedTempFile::new().unwrap();
        let path = f.path().with_extension("yaml");
        cfg.to_yaml(&path).unwrap();
        let loaded = LocalizationConfig::from_yaml(&path).unwrap();
        assert_eq!(cfg, loaded);
    }

    #[test]
    fn toml_roundtrip() {
        let cfg = sample_cfg();
        let f = NamedTempFile::new().unwrap();
        let path = f.path().with_extension("toml");
        cfg.to_toml(&path).unwrap();
        let loaded = LocalizationConfig::from_toml(&path).unwrap();
        assert_eq!(cfg, loaded);
    }

    #[test]
    fn partial_file_uses_defaults() {
        let f = NamedTempFile::new().unwrap();
        let path = f.path().with_extension("toml");
        std::fs::write(&path, "num_particles = 64\n[floor_map]\nresolution = 0.1\n").unwrap();
        let loaded = LocalizationConfig::from_file(&path).unwrap();
        assert_eq!(loaded.num_particles, 64);
        assert_eq!(loaded.floor_map.resolution, 0.1);
        assert_eq!(loaded.floor_map.occupied_threshold, 128);
        assert_eq!(loaded.step_length, 0.7);
    }

    #[test]
    fn format_follows_extension_case_insensitively() {
        assert_eq!(ConfigFormat::of(Path::new("a/filter.JSON")).unwrap(), ConfigFormat::Json);
        assert_eq!(ConfigFormat::of(Path::new("filter.yml")).unwrap(), ConfigFormat::Yaml);
        assert_eq!(ConfigFormat::of(Path::new("filter.Toml")).unwrap(), ConfigFormat::Toml);
        assert!(ConfigFormat::of(Path::new("filter")).is_err());
    }

    #[test]
    fn unsupported_extension_error() {
        let cfg = sample_cfg();
        let f = NamedTempFile::new().unwrap();
        let path = f.path().with_extension("txt");

        let result = cfg.to_file(&path);
        assert!(result.is_err());
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::InvalidInput);

        let result = LocalizationConfig::from_file(&path);
        assert!(result.is_err());
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::InvalidInput);
    }
}
