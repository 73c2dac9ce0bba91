//! Odometry motion model.
//!
//! Odometry is consumed as the difference between two odometry-frame poses of the robot base. The
//! displacement is re-expressed in the robot's body frame at the start of the motion, then applied to
//! every particle in that particle's own heading frame, with independent Gaussian process noise added
//! per axis. The noise is what keeps the cloud diverse after resampling; without it every particle
//! eventually collapses onto a single hypothesis.
use crate::error::LocalizerError;
use crate::particle::ParticleCloud;
use crate::{Pose2D, wrap_to_pi};

use rand::Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

/// Incremental motion between two odometry poses, expressed in the odometry frame.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct OdometryDelta {
    pub dx: f64,
    pub dy: f64,
    pub dtheta: f64,
}
impl OdometryDelta {
    pub fn new(dx: f64, dy: f64, dtheta: f64) -> Self {
        OdometryDelta {
            dx,
            dy,
            dtheta: wrap_to_pi(dtheta),
        }
    }
    /// Motion from `previous` to `current`, both odometry-frame poses of the robot base.
    pub fn between(previous: &Pose2D, current: &Pose2D) -> Self {
        OdometryDelta::new(
            current.x - previous.x,
            current.y - previous.y,
            current.theta - previous.theta,
        )
    }
    /// The translation re-expressed in the body frame of a robot whose odometry heading was
    /// `heading` when the motion started: `(forward, left)`.
    pub fn body_translation(&self, heading: f64) -> (f64, f64) {
        let (sin, cos) = heading.sin_cos();
        (cos * self.dx + sin * self.dy, -sin * self.dx + cos * self.dy)
    }
}

/// Movement needed since the last filter update before particles are propagated again.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateThresholds {
    /// Applied independently to `|dx|` and `|dy|`.
    pub linear: f64,
    /// Applied to `|dtheta|` (radians).
    pub angular: f64,
}
impl Default for UpdateThresholds {
    fn default() -> Self {
        UpdateThresholds {
            linear: 0.002,
            angular: std::f64::consts::PI / 6.0,
        }
    }
}
impl UpdateThresholds {
    pub fn exceeded_by(&self, delta: &OdometryDelta) -> bool {
        delta.dx.abs() > self.linear
            || delta.dy.abs() > self.linear
            || delta.dtheta.abs() > self.angular
    }
}

/// Standard deviations of the zero-mean process noise added per particle and axis on each update.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MotionNoise {
    pub x_std: f64,
    pub y_std: f64,
    pub theta_std: f64,
}
impl Default for MotionNoise {
    fn default() -> Self {
        MotionNoise {
            x_std: 0.05,
            y_std: 0.05,
            theta_std: 0.05,
        }
    }
}

/// Propagates the particle cloud by an odometry delta plus process noise.
#[derive(Clone, Debug)]
pub struct MotionModel {
    x_noise: Normal<f64>,
    y_noise: Normal<f64>,
    theta_noise: Normal<f64>,
}
impl MotionModel {
    pub fn new(noise: &MotionNoise) -> Result<Self, LocalizerError> {
        let normal = |std: f64, axis: &str| {
            Normal::new(0.0, std).map_err(|e| {
                LocalizerError::InvalidConfig(format!("{axis} motion noise std {std}: {e}"))
            })
        };
        Ok(MotionModel {
            x_noise: normal(noise.x_std, "x")?,
            y_noise: normal(noise.y_std, "y")?,
            theta_noise: normal(noise.theta_std, "theta")?,
        })
    }
    /// Advance every particle in place.
    ///
    /// `odom_heading` is the odometry-frame heading of the robot when the motion started; it is
    /// used to move the delta into the body frame, which is then rotated into each particle's own
    /// heading.
    pub fn propagate<R: Rng + ?Sized>(
        &self,
        cloud: &mut ParticleCloud,
        delta: &OdometryDelta,
        odom_heading: f64,
        rng: &mut R,
    ) {
        let (forward, left) = delta.body_translation(odom_heading);
        for particle in cloud.particles_mut() {
            let (sin, cos) = particle.theta.sin_cos();
            particle.x += cos * forward - sin * left + self.x_noise.sample(rng);
            particle.y += sin * forward + cos * left + self.y_noise.sample(rng);
            let turn = delta.dtheta + self.theta_noise.sample(rng);
            particle.theta = wrap_to_pi(particle.theta + turn);
        }
    }
}
