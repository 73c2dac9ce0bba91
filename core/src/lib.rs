//! Monte Carlo localization toolbox for planar mobile robots
//!
//! This crate estimates the pose of a mobile robot (position and heading) inside a known map by fusing
//! relative motion from wheel odometry with range-sensor observations using a sequential Monte Carlo
//! (particle) filter. The filter is designed to run once per sensor frame and to keep a best-estimate
//! pose available at all times, together with the full weighted particle cloud as a representation of
//! the estimate's uncertainty.
//!
//! The map itself and the coordinate-frame bookkeeping of the robot are treated as external
//! collaborators. The filter only needs two things from the outside world:
//! - an obstacle distance field ([sensor::DistanceField]) answering "how far is the nearest known
//!   obstacle from this map point", and
//! - a transform provider ([frames::TransformProvider]) answering "where is the robot base in the
//!   odometry frame at this time".
//!
//! This crate is primarily built off of three additional dependencies:
//! - [`nalgebra`](https://crates.io/crates/nalgebra): Provides the rigid-body transform algebra.
//! - [`rand`](https://crates.io/crates/rand) and [`rand_distr`](https://crates.io/crates/rand_distr): Provide the random number generation for process noise, initialization scatter, and resampling.
//! - [`rayon`](https://crates.io/crates/rayon): Evaluates the per-particle observation likelihood in parallel.
//!
//! All other functionality is auxiliary (configuration I/O, logging, CSV replay).
//!
//! ## Crate overview
//!
//! This crate is organized into several modules:
//! - [error]: The error type shared by every fallible operation.
//! - [particle]: Particles, the particle cloud, weight normalization, resampling and pose averaging.
//! - [motion]: The odometry motion model and the update trigger thresholds.
//! - [sensor]: The likelihood-field observation model, range scans and the distance field interface.
//! - [frames]: The transform provider interface and a time-stamped transform buffer.
//! - [config]: Filter configuration and its (de)serialization.
//! - [filter]: The filter controller that orchestrates a full localization cycle.
//! - [publish]: The shared estimate snapshot and the map-to-odometry correction broadcaster.
//! - [sim]: CSV replay utilities used to run the localizer offline.
//!
//! ## Coordinate and state definitions
//!
//! Three planar frames are used throughout:
//! - `map`: the fixed frame of the known map. Particles and the pose estimate live here.
//! - `odom`: the odometry frame. Continuous, but drifts with respect to `map`.
//! - `base_link`: the robot body frame. Range-sensor points are expressed here.
//!
//! A pose is the triple $(x, y, \theta)$ where $\theta$ is the heading (yaw) in radians, always wrapped
//! to $(-\pi, \pi]$. A pose doubles as a rigid transform from the child frame into the parent frame:
//!
//! $$
//! p^{parent} = R(\theta) p^{child} + t
//! $$
//!
//! The filter publishes its estimate as the correction transform $T_{odom}^{map}$ such that
//!
//! $$
//! T_{base}^{map} = T_{odom}^{map} T_{base}^{odom}
//! $$
//!
//! which lets downstream consumers keep using smooth odometry while the filter removes its drift.
//!
//! ## Filter cycle
//!
//! Each range-sensor frame drives one cycle of the [filter::Localizer]:
//! 1. Resolve the robot's odometry pose (skipped on timeout).
//! 2. Compute the odometry delta since the last motion update.
//! 3. Propagate the particles if the accumulated motion exceeds the trigger thresholds.
//! 4. Weight the particles against the distance field.
//! 5. Normalize the weights, falling back to a uniform distribution when degenerate.
//! 6. Reduce the cloud to a pose estimate (circular mean for the heading).
//! 7. Resample.
//! 8. Publish the estimate and the map-to-odometry correction.
pub mod config;
pub mod error;
pub mod filter;
pub mod frames;
pub mod motion;
pub mod particle;
pub mod publish;
pub mod sensor;
pub mod sim;

use nalgebra::{Isometry2, Point2, Vector2};
use serde::{Deserialize, Serialize};

use std::f64::consts::PI;
use std::fmt::{self, Display};
use std::ops::Mul;

pub use crate::error::LocalizerError;

/// A point in the plane, tagged with nothing but its coordinates. The frame it is expressed in is
/// implied by context (range-sensor points are in the body frame, queries to the distance field are
/// in the map frame).
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Point2D {
    pub x: f64,
    pub y: f64,
}
impl Point2D {
    pub fn new(x: f64, y: f64) -> Self {
        Point2D { x, y }
    }
    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
    pub fn distance_to(&self, other: &Point2D) -> f64 {
        (self.x - other.x).hypot(self.y - other.y)
    }
}
impl From<Point2<f64>> for Point2D {
    fn from(p: Point2<f64>) -> Self {
        Point2D::new(p.x, p.y)
    }
}
impl From<Point2D> for Point2<f64> {
    fn from(p: Point2D) -> Self {
        Point2::new(p.x, p.y)
    }
}

/// Planar pose of the robot: position and heading in some parent frame.
///
/// The heading is wrapped to $(-\pi, \pi]$ on construction.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Pose2D {
    pub x: f64,
    pub y: f64,
    pub theta: f64,
}
impl Display for Pose2D {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:.3}, {:.3}, {:.3} rad)", self.x, self.y, self.theta)
    }
}
impl Pose2D {
    pub fn new(x: f64, y: f64, theta: f64) -> Self {
        Pose2D {
            x,
            y,
            theta: wrap_to_pi(theta),
        }
    }
    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.theta.is_finite()
    }
    pub fn position(&self) -> Point2D {
        Point2D::new(self.x, self.y)
    }
    /// The rigid transform that maps points from this pose's local frame into its parent frame.
    pub fn as_transform(&self) -> Transform2D {
        Transform2D::new(self.x, self.y, self.theta)
    }
}
impl From<Transform2D> for Pose2D {
    fn from(t: Transform2D) -> Self {
        Pose2D::new(t.x, t.y, t.theta)
    }
}

/// Rigid 2D transform (rotation by `theta`, then translation by `(x, y)`).
///
/// Composition follows the usual convention: `(a * b).apply(p) == a.apply(b.apply(p))`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Transform2D {
    pub x: f64,
    pub y: f64,
    pub theta: f64,
}
impl Default for Transform2D {
    fn default() -> Self {
        Transform2D::identity()
    }
}
impl Transform2D {
    pub fn new(x: f64, y: f64, theta: f64) -> Self {
        Transform2D {
            x,
            y,
            theta: wrap_to_pi(theta),
        }
    }
    pub fn identity() -> Self {
        Transform2D {
            x: 0.0,
            y: 0.0,
            theta: 0.0,
        }
    }
    pub fn to_isometry(&self) -> Isometry2<f64> {
        Isometry2::new(Vector2::new(self.x, self.y), self.theta)
    }
    pub fn inverse(&self) -> Transform2D {
        self.to_isometry().inverse().into()
    }
    pub fn apply(&self, point: &Point2D) -> Point2D {
        self.to_isometry().transform_point(&(*point).into()).into()
    }
    /// Linear interpolation of the translation and shortest-arc interpolation of the rotation.
    /// `fraction` is clamped to `[0, 1]`.
    pub fn interpolate(&self, other: &Transform2D, fraction: f64) -> Transform2D {
        let s = fraction.clamp(0.0, 1.0);
        let dtheta = wrap_to_pi(other.theta - self.theta);
        Transform2D::new(
            self.x + s * (other.x - self.x),
            self.y + s * (other.y - self.y),
            self.theta + s * dtheta,
        )
    }
}
impl Mul for Transform2D {
    type Output = Transform2D;
    fn mul(self, rhs: Transform2D) -> Transform2D {
        (self.to_isometry() * rhs.to_isometry()).into()
    }
}
impl From<Isometry2<f64>> for Transform2D {
    fn from(iso: Isometry2<f64>) -> Self {
        Transform2D::new(
            iso.translation.vector.x,
            iso.translation.vector.y,
            iso.rotation.angle(),
        )
    }
}
impl From<Pose2D> for Transform2D {
    fn from(pose: Pose2D) -> Self {
        pose.as_transform()
    }
}

/// Wrap an angle to the half-open range $(-\pi, \pi]$ radians
///
/// # Example
/// ```rust
/// use mcl::wrap_to_pi;
/// use std::f64::consts::PI;
/// assert!((wrap_to_pi(3.0 * PI / 2.0) + PI / 2.0).abs() < 1e-12);
/// assert_eq!(wrap_to_pi(-PI), PI);
/// ```
pub fn wrap_to_pi(angle: f64) -> f64 {
    if !angle.is_finite() {
        return angle;
    }
    let mut wrapped = angle % (2.0 * PI);
    if wrapped > PI {
        wrapped -= 2.0 * PI;
    } else if wrapped <= -PI {
        wrapped += 2.0 * PI;
    }
    wrapped
}

/// Weighted circular mean of a set of headings.
///
/// Headings are averaged as unit vectors, so angles on either side of the $\pm\pi$ seam average to
/// $\pm\pi$ rather than to zero. Returns `None` when the resultant vector vanishes (e.g. two opposite
/// headings with equal weight) or when no weight is positive.
pub fn circular_mean<I>(weighted_headings: I) -> Option<f64>
where
    I: IntoIterator<Item = (f64, f64)>,
{
    let (sin_sum, cos_sum) = weighted_headings
        .into_iter()
        .fold((0.0, 0.0), |(s, c), (theta, w)| {
            (s + w * theta.sin(), c + w * theta.cos())
        });
    if sin_sum.hypot(cos_sum) < 1e-12 {
        None
    } else {
        Some(wrap_to_pi(sin_sum.atan2(cos_sum)))
    }
}
