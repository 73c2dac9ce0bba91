//! Localizer configuration.
//!
//! Every tunable of the filter lives in [`LocalizerConfig`]. Configurations can be written to and
//! read from JSON, YAML, or TOML; the format is chosen by file extension. Missing fields fall back to
//! their defaults, so a configuration file only needs to list what it changes.
use crate::error::LocalizerError;
use crate::motion::{MotionNoise, UpdateThresholds};
use crate::particle::{ParticleAveragingStrategy, ParticleResamplingStrategy};
use crate::sensor::LikelihoodFieldConfig;

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::Path;

/// Names of the three frames the localizer works with.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FrameNames {
    pub map: String,
    pub odom: String,
    pub base: String,
}
impl Default for FrameNames {
    fn default() -> Self {
        FrameNames {
            map: "map".to_string(),
            odom: "odom".to_string(),
            base: "base_link".to_string(),
        }
    }
}

/// Standard deviations of the Gaussian scatter used when (re)initializing the cloud.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InitialScatter {
    pub xy_std: f64,
    pub theta_std: f64,
}
impl Default for InitialScatter {
    fn default() -> Self {
        InitialScatter {
            xy_std: 0.1,
            theta_std: 0.05,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalizerConfig {
    /// Number of particles; fixed for the lifetime of the filter.
    pub num_particles: usize,
    /// Seed of the filter's random number generator.
    pub seed: u64,
    /// How long a cycle may wait for the odometry transform before it is skipped (seconds).
    pub transform_timeout_s: f64,
    pub resampling: ParticleResamplingStrategy,
    pub averaging: ParticleAveragingStrategy,
    /// Resample only when the effective sample size is at most this fraction of the particle count.
    /// `1.0` resamples on every weighted cycle.
    pub resample_threshold: f64,
    /// Rate at which the map-to-odometry correction is re-published (Hz).
    pub publish_rate_hz: f64,
    pub frames: FrameNames,
    pub initial_scatter: InitialScatter,
    pub motion_noise: MotionNoise,
    pub thresholds: UpdateThresholds,
    pub likelihood: LikelihoodFieldConfig,
}

impl Default for LocalizerConfig {
    fn default() -> Self {
        LocalizerConfig {
            num_particles: 300,
            seed: 42,
            transform_timeout_s: 2.0,
            resampling: ParticleResamplingStrategy::default(),
            averaging: ParticleAveragingStrategy::default(),
            resample_threshold: 1.0,
            publish_rate_hz: 5.0,
            frames: FrameNames::default(),
            initial_scatter: InitialScatter::default(),
            motion_noise: MotionNoise::default(),
            thresholds: UpdateThresholds::default(),
            likelihood: LikelihoodFieldConfig::default(),
        }
    }
}

fn check_std(name: &str, value: f64) -> Result<(), LocalizerError> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(LocalizerError::InvalidConfig(format!(
            "{name} must be a finite, non-negative standard deviation (got {value})"
        )))
    }
}

fn check_positive(name: &str, value: f64) -> Result<(), LocalizerError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(LocalizerError::InvalidConfig(format!(
            "{name} must be positive (got {value})"
        )))
    }
}

impl LocalizerConfig {
    /// Reject configurations the filter cannot run with.
    pub fn validate(&self) -> Result<(), LocalizerError> {
        if self.num_particles == 0 {
            return Err(LocalizerError::InvalidConfig(
                "num_particles must be at least 1".into(),
            ));
        }
        check_positive("transform_timeout_s", self.transform_timeout_s)?;
        check_positive("publish_rate_hz", self.publish_rate_hz)?;
        check_std("initial_scatter.xy_std", self.initial_scatter.xy_std)?;
        check_std("initial_scatter.theta_std", self.initial_scatter.theta_std)?;
        check_std("motion_noise.x_std", self.motion_noise.x_std)?;
        check_std("motion_noise.y_std", self.motion_noise.y_std)?;
        check_std("motion_noise.theta_std", self.motion_noise.theta_std)?;
        check_std("thresholds.linear", self.thresholds.linear)?;
        check_std("thresholds.angular", self.thresholds.angular)?;
        if self.likelihood.scan_stride == 0 {
            return Err(LocalizerError::InvalidConfig(
                "likelihood.scan_stride must be at least 1".into(),
            ));
        }
        check_positive(
            "likelihood.max_obstacle_distance",
            self.likelihood.max_obstacle_distance,
        )?;
        check_positive("likelihood.hit_std", self.likelihood.hit_std)?;
        if !(self.resample_threshold > 0.0 && self.resample_threshold <= 1.0) {
            return Err(LocalizerError::InvalidConfig(format!(
                "resample_threshold must be in (0, 1] (got {})",
                self.resample_threshold
            )));
        }
        let frames = &self.frames;
        if frames.map.is_empty() || frames.odom.is_empty() || frames.base.is_empty() {
            return Err(LocalizerError::InvalidConfig(
                "frame names must not be empty".into(),
            ));
        }
        Ok(())
    }

    /// Write the configuration to `path`, in the format named by its extension.
    ///
    /// # Arguments
    /// * `path` - destination file; `.json`, `.yaml`/`.yml`, or `.toml`
    ///
    /// # Errors
    /// `InvalidInput` for an unknown extension, otherwise any serialization or write failure.
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let path = path.as_ref();
        let text = match ConfigFormat::of(path)? {
            ConfigFormat::Json => serde_json::to_string_pretty(self).map_err(io::Error::other)?,
            ConfigFormat::Yaml => serde_yaml::to_string(self).map_err(io::Error::other)?,
            ConfigFormat::Toml => toml::to_string(self).map_err(io::Error::other)?,
        };
        fs::write(path, text)
    }
    /// Read a configuration from `path`, in the format named by its extension. Fields absent from
    /// the file keep their defaults; the result is not validated.
    ///
    /// # Errors
    /// `InvalidInput` for an unknown extension, otherwise any read or parse failure.
    pub fn from_file<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let path = path.as_ref();
        let format = ConfigFormat::of(path)?;
        let text = fs::read_to_string(path)?;
        match format {
            ConfigFormat::Json => serde_json::from_str(&text).map_err(io::Error::other),
            ConfigFormat::Yaml => serde_yaml::from_str(&text).map_err(io::Error::other),
            ConfigFormat::Toml => toml::from_str(&text).map_err(io::Error::other),
        }
    }
}

/// On-disk configuration encodings.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ConfigFormat {
    Json,
    Yaml,
    Toml,
}
impl ConfigFormat {
    fn of(path: &Path) -> io::Result<Self> {
        let ext = path
            .extension()
            .and_then(|s| s.to_str())
            .map(str::to_ascii_lowercase);
        match ext.as_deref() {
            Some("json") => Ok(ConfigFormat::Json),
            Some("yaml" | "yml") => Ok(ConfigFormat::Yaml),
            Some("toml") => Ok(ConfigFormat::Toml),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("unsupported configuration file '{}'", path.display()),
            )),
        }
    }
}
