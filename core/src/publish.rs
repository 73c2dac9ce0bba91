//! Sharing the filter output with other threads.
//!
//! The controller publishes a complete [`EstimateSnapshot`] at the end of every cycle by swapping
//! a reference-counted pointer under a lock, so readers only ever observe a fully-updated estimate
//! and never one caught in the middle of a resample. The [`CorrectionBroadcaster`] runs on its own
//! thread and keeps re-sending the latest map-to-odometry correction at a fixed rate, including
//! between sensor frames.
use crate::Pose2D;
use crate::frames::StampedTransform;
use crate::particle::Particle;

use log::{debug, error};
use nalgebra::Matrix3;
use parking_lot::RwLock;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Everything the filter knows at the end of one cycle.
#[derive(Clone, Debug)]
pub struct EstimateSnapshot {
    pub stamp: f64,
    pub pose: Pose2D,
    /// Weighted covariance of `(x, y, theta)`.
    pub covariance: Matrix3<f64>,
    /// Pose of the odometry frame in the map frame.
    pub correction: StampedTransform,
    /// The particle cloud after the cycle, for diagnostics only.
    pub particles: Vec<Particle>,
}

/// Cheaply clonable handle on the latest published snapshot.
#[derive(Clone, Default)]
pub struct EstimateHandle {
    latest: Arc<RwLock<Option<Arc<EstimateSnapshot>>>>,
}
impl EstimateHandle {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn publish(&self, snapshot: EstimateSnapshot) {
        let snapshot = Arc::new(snapshot);
        *self.latest.write() = Some(snapshot);
    }
    pub fn latest(&self) -> Option<Arc<EstimateSnapshot>> {
        self.latest.read().clone()
    }
    pub fn pose(&self) -> Option<Pose2D> {
        self.latest().map(|s| s.pose)
    }
    pub fn correction(&self) -> Option<StampedTransform> {
        self.latest().map(|s| s.correction.clone())
    }
}

/// Destination of the re-published correction transform.
pub trait CorrectionSink: Send {
    fn send(&mut self, correction: &StampedTransform);
}
impl<F> CorrectionSink for F
where
    F: FnMut(&StampedTransform) + Send,
{
    fn send(&mut self, correction: &StampedTransform) {
        self(correction)
    }
}

/// Background loop re-sending the latest correction at a fixed rate until stopped or dropped.
pub struct CorrectionBroadcaster {
    stop: Option<Sender<()>>,
    worker: Option<JoinHandle<()>>,
}
impl CorrectionBroadcaster {
    pub fn spawn<S>(estimates: EstimateHandle, rate_hz: f64, mut sink: S) -> Self
    where
        S: CorrectionSink + 'static,
    {
        let period = Duration::from_secs_f64(1.0 / rate_hz.max(1e-3));
        let (stop, stopped) = mpsc::channel::<()>();
        let worker = thread::spawn(move || {
            debug!("correction broadcaster started ({:.1} Hz)", 1.0 / period.as_secs_f64());
            loop {
                if let Some(correction) = estimates.correction() {
                    sink.send(&correction);
                }
                match stopped.recv_timeout(period) {
                    Err(RecvTimeoutError::Timeout) => continue,
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            debug!("correction broadcaster stopped");
        });
        CorrectionBroadcaster {
            stop: Some(stop),
            worker: Some(worker),
        }
    }
    pub fn stop(mut self) {
        self.shutdown();
    }
    fn shutdown(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(worker) = self.worker.take()
            && worker.join().is_err()
        {
            error!("correction broadcaster thread panicked");
        }
    }
}
impl Drop for CorrectionBroadcaster {
    fn drop(&mut self) {
        self.shutdown();
    }
}
