//! The localization controller.
//!
//! [`Localizer`] owns the particle cloud, the odometry baseline and the current estimate, and runs
//! one filter cycle per range-sensor frame:
//!
//! 1. resolve the odometry pose of the robot base at the scan time;
//! 2. apply a pending re-seed request, if any, anchored at that odometry pose;
//! 3. lazily initialize the cloud around the odometry pose on first use;
//! 4. propagate the cloud if the motion since the last update exceeds the trigger thresholds
//!    (smaller motion keeps accumulating against the old baseline);
//! 5. weight the particles against the distance field and normalize;
//! 6. reduce the cloud to a pose estimate;
//! 7. resample;
//! 8. publish the estimate and the map-to-odometry correction.
//!
//! A cycle that cannot resolve odometry is skipped without touching any state; a queued re-seed stays
//! queued for the next cycle. Degenerate weights and empty scans do not abort the cycle; they are
//! reported in [`CycleReport::warnings`]. Every re-seed publishes a fresh estimate immediately.
use crate::config::LocalizerConfig;
use crate::error::LocalizerError;
use crate::frames::{StampedTransform, TransformProvider};
use crate::motion::{MotionModel, OdometryDelta};
use crate::particle::{ParticleCloud, WeightNormalization};
use crate::publish::{EstimateHandle, EstimateSnapshot};
use crate::sensor::{DistanceField, LikelihoodFieldModel, RangeScan};
use crate::{Pose2D, Transform2D};

use log::{debug, info, warn};
use nalgebra::Matrix3;
use parking_lot::Mutex;
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FilterState {
    /// No particle cloud yet; waiting for a seed pose or the first odometry.
    Uninitialized,
    Ready,
}

/// An externally supplied pose hypothesis, e.g. an operator's initial pose guess.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PoseWithCovariance {
    pub pose: Pose2D,
    /// Covariance of `(x, y, theta)`. Only the diagonal is used; `None` uses the configured scatter.
    pub covariance: Option<Matrix3<f64>>,
}

/// Mailbox for re-seed requests coming from other threads. The newest request wins.
#[derive(Clone, Default)]
pub struct ReseedHandle {
    pending: Arc<Mutex<Option<PoseWithCovariance>>>,
}
impl ReseedHandle {
    pub fn request(&self, pose: Pose2D, covariance: Option<Matrix3<f64>>) {
        *self.pending.lock() = Some(PoseWithCovariance { pose, covariance });
    }
    pub fn is_pending(&self) -> bool {
        self.pending.lock().is_some()
    }
    fn take(&self) -> Option<PoseWithCovariance> {
        self.pending.lock().take()
    }
}

/// Summary of one completed cycle.
#[derive(Debug)]
pub struct CycleReport {
    pub stamp: f64,
    pub pose: Pose2D,
    pub covariance: Matrix3<f64>,
    /// Pose of the odometry frame in the map frame.
    pub correction: Transform2D,
    /// Motion accumulated since the previous motion update.
    pub odometry_delta: OdometryDelta,
    pub initialized: bool,
    /// A queued re-seed request was applied at the start of this cycle.
    pub reseeded: bool,
    pub motion_applied: bool,
    pub weighted: bool,
    pub resampled: bool,
    /// Effective sample size after normalization, before resampling.
    pub effective_sample_size: f64,
    /// Recoverable conditions encountered during the cycle.
    pub warnings: Vec<LocalizerError>,
}

pub struct Localizer<F: DistanceField + ?Sized, T: TransformProvider + ?Sized> {
    config: LocalizerConfig,
    field: Arc<F>,
    frames: Arc<T>,
    motion: MotionModel,
    sensor: LikelihoodFieldModel,
    rng: StdRng,
    state: FilterState,
    cloud: ParticleCloud,
    /// Odometry pose the cloud was last propagated to.
    odom_baseline: Option<Pose2D>,
    /// Most recently resolved odometry pose and its stamp.
    last_odom: Option<(f64, Pose2D)>,
    estimate: Option<Pose2D>,
    reseeds: ReseedHandle,
    published: EstimateHandle,
}

impl<F: DistanceField + ?Sized, T: TransformProvider + ?Sized> Localizer<F, T> {
    /// # Errors
    /// [`LocalizerError::InvalidConfig`] if the configuration cannot be run.
    pub fn new(
        config: LocalizerConfig,
        field: Arc<F>,
        frames: Arc<T>,
    ) -> Result<Self, LocalizerError> {
        config.validate()?;
        let motion = MotionModel::new(&config.motion_noise)?;
        let sensor = LikelihoodFieldModel::new(config.likelihood)?;
        let rng = StdRng::seed_from_u64(config.seed);
        Ok(Localizer {
            config,
            field,
            frames,
            motion,
            sensor,
            rng,
            state: FilterState::Uninitialized,
            cloud: ParticleCloud::default(),
            odom_baseline: None,
            last_odom: None,
            estimate: None,
            reseeds: ReseedHandle::default(),
            published: EstimateHandle::new(),
        })
    }
    pub fn config(&self) -> &LocalizerConfig {
        &self.config
    }
    pub fn state(&self) -> FilterState {
        self.state
    }
    pub fn is_initialized(&self) -> bool {
        self.state == FilterState::Ready
    }
    pub fn cloud(&self) -> &ParticleCloud {
        &self.cloud
    }
    /// The latest pose estimate.
    ///
    /// # Errors
    /// [`LocalizerError::UninitializedCloud`] before the first initialization.
    pub fn estimate(&self) -> Result<Pose2D, LocalizerError> {
        self.estimate.ok_or(LocalizerError::UninitializedCloud)
    }
    /// Handle through which other threads read the published estimates.
    pub fn estimate_handle(&self) -> EstimateHandle {
        self.published.clone()
    }
    /// Handle through which other threads request a re-seed.
    pub fn reseed_handle(&self) -> ReseedHandle {
        self.reseeds.clone()
    }

    /// Discard the current cloud and scatter a new one around `pose`. With a covariance the scatter
    /// uses its diagonal standard deviations; otherwise the configured initial scatter.
    ///
    /// The new estimate is published at once, with the correction anchored at the most recent
    /// odometry pose (or at the odometry origin if none has been seen yet).
    pub fn reseed(
        &mut self,
        pose: Pose2D,
        covariance: Option<Matrix3<f64>>,
    ) -> Result<(), LocalizerError> {
        let scatter = &self.config.initial_scatter;
        let (x_std, y_std, theta_std) = match covariance {
            Some(cov) if (0..3).all(|i| cov[(i, i)].is_finite() && cov[(i, i)] >= 0.0) => {
                (cov[(0, 0)].sqrt(), cov[(1, 1)].sqrt(), cov[(2, 2)].sqrt())
            }
            Some(_) => {
                warn!("ignoring invalid re-seed covariance, using configured scatter");
                (scatter.xy_std, scatter.xy_std, scatter.theta_std)
            }
            None => (scatter.xy_std, scatter.xy_std, scatter.theta_std),
        };
        let cloud = ParticleCloud::scatter(
            &pose,
            self.config.num_particles,
            x_std,
            y_std,
            theta_std,
            &mut self.rng,
        )?;
        let estimate = cloud
            .estimate(self.config.averaging)
            .ok_or(LocalizerError::UninitializedCloud)?;
        self.cloud = cloud;
        self.odom_baseline = self.last_odom.map(|(_, odom)| odom);
        self.estimate = Some(estimate);
        self.state = FilterState::Ready;
        let stamp = self.last_odom.map_or(0.0, |(stamp, _)| stamp);
        let covariance = self.cloud.covariance(&estimate);
        self.publish(stamp, estimate, covariance);
        info!(
            "particle cloud seeded with {} particles around {}",
            self.cloud.len(),
            pose
        );
        Ok(())
    }

    /// Publish `pose` together with the correction anchored at the odometry baseline, and return
    /// that correction.
    fn publish(&self, stamp: f64, pose: Pose2D, covariance: Matrix3<f64>) -> Transform2D {
        let anchor = self
            .odom_baseline
            .map_or_else(Transform2D::identity, |odom| odom.as_transform());
        let correction = pose.as_transform() * anchor.inverse();
        self.published.publish(EstimateSnapshot {
            stamp,
            pose,
            covariance,
            correction: StampedTransform {
                parent_frame: self.config.frames.map.clone(),
                child_frame: self.config.frames.odom.clone(),
                stamp,
                transform: correction,
            },
            particles: self.cloud.particles().to_vec(),
        });
        correction
    }

    /// Apply the newest queued re-seed request, if any. Returns whether one was applied.
    pub fn apply_pending_reseed(&mut self) -> Result<bool, LocalizerError> {
        match self.reseeds.take() {
            Some(request) => {
                self.reseed(request.pose, request.covariance)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Odometry pose of the robot base at `stamp`.
    pub fn resolve_odometry(&self, stamp: f64) -> Result<Pose2D, LocalizerError> {
        let timeout = Duration::from_secs_f64(self.config.transform_timeout_s);
        let transform =
            self.frames
                .resolve(&self.config.frames.odom, &self.config.frames.base, stamp, timeout)?;
        Ok(transform.into())
    }

    /// Run one cycle for a scan, resolving the odometry pose through the transform provider.
    ///
    /// # Errors
    /// [`LocalizerError::TransformUnavailable`] if odometry could not be resolved; the cycle is
    /// skipped and no state changes. A pending re-seed stays queued.
    pub fn process_scan(&mut self, scan: &RangeScan) -> Result<CycleReport, LocalizerError> {
        let odom_pose = match self.resolve_odometry(scan.stamp) {
            Ok(pose) => pose,
            Err(e) => {
                warn!("skipping cycle at t = {:.3}: {e}", scan.stamp);
                return Err(e);
            }
        };
        self.cycle_at(scan, odom_pose)
    }

    /// Run one cycle with an odometry pose supplied directly by the caller.
    pub fn process_scan_with_odometry(
        &mut self,
        scan: &RangeScan,
        odom_pose: Pose2D,
    ) -> Result<CycleReport, LocalizerError> {
        self.cycle_at(scan, odom_pose)
    }

    fn cycle_at(
        &mut self,
        scan: &RangeScan,
        odom_pose: Pose2D,
    ) -> Result<CycleReport, LocalizerError> {
        self.last_odom = Some((scan.stamp, odom_pose));
        let reseeded = self.apply_pending_reseed()?;
        self.run_cycle(scan, odom_pose, reseeded)
    }

    fn run_cycle(
        &mut self,
        scan: &RangeScan,
        odom_pose: Pose2D,
        reseeded: bool,
    ) -> Result<CycleReport, LocalizerError> {
        let mut warnings = Vec::new();
        let mut initialized = false;
        if self.cloud.is_empty() {
            self.reseed(odom_pose, None)?;
            initialized = true;
        }
        let baseline = *self.odom_baseline.get_or_insert(odom_pose);

        let odometry_delta = OdometryDelta::between(&baseline, &odom_pose);
        let motion_applied = self.config.thresholds.exceeded_by(&odometry_delta);
        if motion_applied {
            self.motion
                .propagate(&mut self.cloud, &odometry_delta, baseline.theta, &mut self.rng);
            self.odom_baseline = Some(odom_pose);
        }

        let weighted = match self.sensor.update_weights(&mut self.cloud, scan, &*self.field) {
            Ok(()) => true,
            Err(e) => {
                warn!("t = {:.3}: {e}; keeping prior weights", scan.stamp);
                warnings.push(e);
                false
            }
        };
        let normalization = self.cloud.normalize_weights();
        if let WeightNormalization::UniformFallback { sum } = normalization {
            warn!(
                "t = {:.3}: weight sum {sum} is degenerate, falling back to uniform weights",
                scan.stamp
            );
            warnings.push(LocalizerError::DegenerateWeights { sum });
        }

        let pose = self
            .cloud
            .estimate(self.config.averaging)
            .ok_or(LocalizerError::UninitializedCloud)?;
        let covariance = self.cloud.covariance(&pose);
        let effective_sample_size = self.cloud.effective_sample_size();

        let n = self.cloud.len() as f64;
        let wants_resample = self.config.resample_threshold >= 1.0
            || effective_sample_size <= self.config.resample_threshold * n;
        let resampled = if weighted && !normalization.is_degenerate() && wants_resample {
            match self.cloud.resample(self.config.resampling, &mut self.rng) {
                Ok(()) => true,
                Err(e) => {
                    warn!("t = {:.3}: resampling skipped: {e}", scan.stamp);
                    warnings.push(e);
                    false
                }
            }
        } else {
            false
        };

        // The cloud describes the robot at the baseline odometry pose, not the current one.
        let correction = self.publish(scan.stamp, pose, covariance);
        self.estimate = Some(pose);
        self.state = FilterState::Ready;
        debug!(
            "t = {:.3}: pose {} ess {:.1} motion {} resampled {}",
            scan.stamp, pose, effective_sample_size, motion_applied, resampled
        );
        Ok(CycleReport {
            stamp: scan.stamp,
            pose,
            covariance,
            correction,
            odometry_delta,
            initialized,
            reseeded,
            motion_applied,
            weighted,
            resampled,
            effective_sample_size,
            warnings,
        })
    }
}
