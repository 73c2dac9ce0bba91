//! Range-sensor observation model.
//!
//! The filter uses a likelihood-field model: a particle is likely if, when the current scan is
//! placed on the map at that particle's pose, the scan points land close to known obstacles. The
//! map is only ever accessed through a [`DistanceField`], which answers nearest-obstacle distance
//! queries and is built once from the static map by an external collaborator.
//!
//! # Likelihood
//!
//! For particle pose $(x, y, \theta)$ and body-frame scan points $p_j$ (sub-sampled every
//! `scan_stride` points):
//!
//! $$
//! \bar d = \frac{1}{M} \sum_j \min\left(d\left(R(\theta) p_j + t\right), d_{max}\right), \qquad
//! w = \exp\left(-\frac{\bar d^2}{2 \sigma^2}\right)
//! $$
//!
//! Unknown distances (queries outside the map) are charged the full `d_max` penalty.
use crate::error::LocalizerError;
use crate::particle::ParticleCloud;
use crate::{Point2D, Transform2D};

use log::{debug, warn};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::path::Path;

/// Upper bound on the number of cells in a [`GridDistanceField`].
pub const MAX_GRID_CELLS: usize = 1 << 26;

/// Nearest-obstacle distance lookup over the static map.
///
/// Implementations must be pure: the filter evaluates particles in parallel and queries the field
/// concurrently from several threads. A non-finite return value means "unknown" (e.g. outside the
/// mapped area).
pub trait DistanceField: Sync {
    fn distance(&self, x: f64, y: f64) -> f64;
}
impl<F> DistanceField for F
where
    F: Fn(f64, f64) -> f64 + Sync,
{
    fn distance(&self, x: f64, y: f64) -> f64 {
        self(x, y)
    }
}

/// Dense nearest-obstacle distance grid.
///
/// Distances are stored per cell (measured from the cell center). Queries outside the grid return
/// `f64::NAN`.
#[derive(Clone, Debug)]
pub struct GridDistanceField {
    origin: Point2D,
    resolution: f64,
    width: usize,
    height: usize,
    distances: Vec<f64>,
}
impl GridDistanceField {
    /// Build the field from obstacle points with a two-pass nearest-site propagation over the
    /// 8-neighbourhood.
    pub fn from_obstacles(
        origin: Point2D,
        resolution: f64,
        width: usize,
        height: usize,
        obstacles: &[Point2D],
    ) -> Result<Self, LocalizerError> {
        let cells = width.checked_mul(height).filter(|&n| n <= MAX_GRID_CELLS);
        if !(resolution > 0.0 && resolution.is_finite()) || cells.is_none_or(|n| n == 0) {
            return Err(LocalizerError::InvalidConfig(format!(
                "distance grid {width}x{height} at resolution {resolution}"
            )));
        }
        let center = |col: usize, row: usize| {
            Point2D::new(
                origin.x + (col as f64 + 0.5) * resolution,
                origin.y + (row as f64 + 0.5) * resolution,
            )
        };
        let mut nearest: Vec<Option<Point2D>> = vec![None; width * height];
        for obstacle in obstacles.iter().filter(|p| p.is_finite()) {
            let col = ((obstacle.x - origin.x) / resolution).floor();
            let row = ((obstacle.y - origin.y) / resolution).floor();
            if col < 0.0 || row < 0.0 || col >= width as f64 || row >= height as f64 {
                continue;
            }
            let (col, row) = (col as usize, row as usize);
            let cell = &mut nearest[row * width + col];
            let here = center(col, row);
            if cell.is_none_or(|site| here.distance_to(obstacle) < here.distance_to(&site)) {
                *cell = Some(*obstacle);
            }
        }
        let mut relax = |col: usize, row: usize, neighbours: &[(isize, isize)]| {
            let here = center(col, row);
            for &(dc, dr) in neighbours {
                let (nc, nr) = (col as isize + dc, row as isize + dr);
                if nc < 0 || nr < 0 || nc >= width as isize || nr >= height as isize {
                    continue;
                }
                let Some(site) = nearest[nr as usize * width + nc as usize] else {
                    continue;
                };
                let index = row * width + col;
                let closer =
                    |current: Point2D| here.distance_to(&site) < here.distance_to(&current);
                if nearest[index].is_none_or(closer) {
                    nearest[index] = Some(site);
                }
            }
        };
        const FORWARD: [(isize, isize); 4] = [(-1, -1), (0, -1), (1, -1), (-1, 0)];
        const BACKWARD: [(isize, isize); 4] = [(1, 1), (0, 1), (-1, 1), (1, 0)];
        for row in 0..height {
            for col in 0..width {
                relax(col, row, &FORWARD);
            }
        }
        for row in (0..height).rev() {
            for col in (0..width).rev() {
                relax(col, row, &BACKWARD);
            }
        }
        let distances = (0..height)
            .flat_map(|row| (0..width).map(move |col| (col, row)))
            .map(|(col, row)| match nearest[row * width + col] {
                Some(site) => center(col, row).distance_to(&site),
                None => f64::INFINITY,
            })
            .collect();
        debug!(
            "built {width}x{height} distance grid at {resolution} m from {} obstacles",
            obstacles.len()
        );
        Ok(GridDistanceField {
            origin,
            resolution,
            width,
            height,
            distances,
        })
    }
    /// Load obstacle points from a CSV with `x,y` columns and build a grid covering their bounding
    /// box plus `margin` on every side.
    pub fn from_csv<P: AsRef<Path>>(
        path: P,
        resolution: f64,
        margin: f64,
    ) -> Result<Self, Box<dyn Error>> {
        if !(resolution > 0.0 && resolution.is_finite()) {
            let reason = format!("grid resolution {resolution}");
            return Err(LocalizerError::InvalidConfig(reason).into());
        }
        if !(margin >= 0.0 && margin.is_finite()) {
            let reason = format!("grid margin {margin}");
            return Err(LocalizerError::InvalidConfig(reason).into());
        }
        let mut rdr = csv::Reader::from_path(path)?;
        let mut obstacles = Vec::new();
        for result in rdr.deserialize() {
            let point: Point2D = result?;
            if point.is_finite() {
                obstacles.push(point);
            }
        }
        if obstacles.is_empty() {
            return Err("obstacle file contains no points".into());
        }
        let (min_x, min_y, max_x, max_y) = obstacles.iter().fold(
            (f64::INFINITY, f64::INFINITY, f64::NEG_INFINITY, f64::NEG_INFINITY),
            |(a, b, c, d), p| (a.min(p.x), b.min(p.y), c.max(p.x), d.max(p.y)),
        );
        let cells_across = |span: f64| {
            let n = (span / resolution).ceil() + 1.0;
            if n.is_finite() && n <= MAX_GRID_CELLS as f64 {
                Ok(n as usize)
            } else {
                Err(LocalizerError::InvalidConfig(format!(
                    "span {span} m at {resolution} m needs more than {MAX_GRID_CELLS} cells"
                )))
            }
        };
        let width = cells_across(max_x - min_x + 2.0 * margin)?;
        let height = cells_across(max_y - min_y + 2.0 * margin)?;
        let origin = Point2D::new(min_x - margin, min_y - margin);
        Ok(Self::from_obstacles(
            origin, resolution, width, height, &obstacles,
        )?)
    }
    pub fn width(&self) -> usize {
        self.width
    }
    pub fn height(&self) -> usize {
        self.height
    }
    pub fn resolution(&self) -> f64 {
        self.resolution
    }
}
impl DistanceField for GridDistanceField {
    fn distance(&self, x: f64, y: f64) -> f64 {
        let col = ((x - self.origin.x) / self.resolution).floor();
        let row = ((y - self.origin.y) / self.resolution).floor();
        if !(col >= 0.0 && row >= 0.0 && col < self.width as f64 && row < self.height as f64) {
            return f64::NAN;
        }
        self.distances[row as usize * self.width + col as usize]
    }
}

/// A batch of range-sensor points in the robot body frame.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RangeScan {
    pub stamp: f64,
    pub points: Vec<Point2D>,
}
impl RangeScan {
    /// Non-finite points are dropped.
    pub fn from_points(stamp: f64, points: Vec<Point2D>) -> Self {
        let points = points.into_iter().filter(Point2D::is_finite).collect();
        RangeScan { stamp, points }
    }
    /// Convert a planar laser scan into body-frame points.
    ///
    /// Beam `i` points along `angle_min + i * angle_increment` in the sensor frame; returns outside
    /// `[range_min, range_max]` or non-finite are discarded. `sensor_pose` is the mount of the sensor
    /// on the robot body.
    pub fn from_polar(
        stamp: f64,
        angle_min: f64,
        angle_increment: f64,
        ranges: &[f64],
        range_min: f64,
        range_max: f64,
        sensor_pose: &Transform2D,
    ) -> Self {
        let points = ranges
            .iter()
            .enumerate()
            .filter(|(_, r)| r.is_finite() && **r >= range_min && **r <= range_max)
            .map(|(i, &r)| {
                let angle = angle_min + i as f64 * angle_increment;
                sensor_pose.apply(&Point2D::new(r * angle.cos(), r * angle.sin()))
            })
            .collect();
        RangeScan { stamp, points }
    }
    pub fn len(&self) -> usize {
        self.points.len()
    }
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

/// Parameters of the likelihood-field model.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LikelihoodFieldConfig {
    /// Use every `scan_stride`-th point of the batch.
    pub scan_stride: usize,
    /// Cap on the per-point distance penalty; also charged for unknown distances.
    pub max_obstacle_distance: f64,
    /// Standard deviation of the mean-distance likelihood.
    pub hit_std: f64,
}
impl Default for LikelihoodFieldConfig {
    fn default() -> Self {
        LikelihoodFieldConfig {
            scan_stride: 10,
            max_obstacle_distance: 2.0,
            hit_std: 0.2,
        }
    }
}

#[derive(Clone, Debug)]
pub struct LikelihoodFieldModel {
    config: LikelihoodFieldConfig,
}
impl LikelihoodFieldModel {
    pub fn new(config: LikelihoodFieldConfig) -> Result<Self, LocalizerError> {
        if config.scan_stride == 0 {
            return Err(LocalizerError::InvalidConfig(
                "scan_stride must be at least 1".into(),
            ));
        }
        if !(config.max_obstacle_distance > 0.0 && config.max_obstacle_distance.is_finite()) {
            return Err(LocalizerError::InvalidConfig(format!(
                "max_obstacle_distance {} must be positive",
                config.max_obstacle_distance
            )));
        }
        if !(config.hit_std > 0.0 && config.hit_std.is_finite()) {
            return Err(LocalizerError::InvalidConfig(format!(
                "hit_std {} must be positive",
                config.hit_std
            )));
        }
        Ok(LikelihoodFieldModel { config })
    }
    pub fn config(&self) -> &LikelihoodFieldConfig {
        &self.config
    }
    /// Mean clamped obstacle distance of the (sub-sampled) scan placed at `pose`.
    pub fn mean_distance<F: DistanceField + ?Sized>(
        &self,
        pose: &Transform2D,
        scan: &RangeScan,
        field: &F,
    ) -> f64 {
        let max = self.config.max_obstacle_distance;
        let (total, count) = scan
            .points
            .iter()
            .step_by(self.config.scan_stride)
            .map(|point| {
                let mapped = pose.apply(point);
                let d = field.distance(mapped.x, mapped.y);
                if d.is_finite() { d.clamp(0.0, max) } else { max }
            })
            .fold((0.0, 0usize), |(sum, n), d| (sum + d, n + 1));
        if count == 0 { f64::NAN } else { total / count as f64 }
    }
    /// One unnormalized likelihood per particle, in cloud order. Non-finite results are zero.
    ///
    /// # Errors
    /// [`LocalizerError::EmptySensorBatch`] if the scan has no points.
    pub fn likelihoods<F: DistanceField + ?Sized>(
        &self,
        cloud: &ParticleCloud,
        scan: &RangeScan,
        field: &F,
    ) -> Result<Vec<f64>, LocalizerError> {
        if scan.is_empty() {
            return Err(LocalizerError::EmptySensorBatch);
        }
        let two_var = 2.0 * self.config.hit_std * self.config.hit_std;
        Ok(cloud
            .particles()
            .par_iter()
            .map(|particle| {
                let pose = Transform2D::new(particle.x, particle.y, particle.theta);
                let d = self.mean_distance(&pose, scan, field);
                let w = (-d * d / two_var).exp();
                if w.is_finite() { w } else { 0.0 }
            })
            .collect())
    }
    /// Multiply each particle's weight by its observation likelihood.
    ///
    /// On an empty scan the weights are left untouched and the error is returned.
    pub fn update_weights<F: DistanceField + ?Sized>(
        &self,
        cloud: &mut ParticleCloud,
        scan: &RangeScan,
        field: &F,
    ) -> Result<(), LocalizerError> {
        let likelihoods = self.likelihoods(cloud, scan, field)?;
        let mut zeroed = 0usize;
        for (particle, likelihood) in cloud.particles_mut().iter_mut().zip(likelihoods) {
            let w = particle.weight * likelihood;
            particle.weight = if w.is_finite() { w } else { 0.0 };
            if particle.weight == 0.0 {
                zeroed += 1;
            }
        }
        if zeroed == cloud.len() {
            warn!("every particle scored zero likelihood against {} scan points", scan.len());
        }
        Ok(())
    }
}
