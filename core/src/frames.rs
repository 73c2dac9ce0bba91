//! Coordinate-frame transform lookup.
//!
//! The filter never tracks frame relationships itself. It asks a [`TransformProvider`] for the pose
//! of the robot base in the odometry frame at the time of each scan. [`TransformBuffer`] is a small
//! time-indexed implementation of that interface, good enough for replaying logs and for tests; a
//! robot integration would normally adapt its own transform tree instead.
use crate::Transform2D;
use crate::error::LocalizerError;

use log::trace;
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Resolves rigid transforms between named frames.
pub trait TransformProvider: Send + Sync {
    /// Transform taking points in `source_frame` into `target_frame` at time `stamp` (seconds).
    /// Equivalently, the pose of `source_frame` expressed in `target_frame`.
    ///
    /// # Errors
    /// [`LocalizerError::TransformUnavailable`] if the transform cannot be resolved within
    /// `timeout`.
    fn resolve(
        &self,
        target_frame: &str,
        source_frame: &str,
        stamp: f64,
        timeout: Duration,
    ) -> Result<Transform2D, LocalizerError>;
}

/// A transform between two named frames at a point in time.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StampedTransform {
    pub parent_frame: String,
    pub child_frame: String,
    pub stamp: f64,
    pub transform: Transform2D,
}

type EdgeKey = (String, String);

/// Time-stamped transform history keyed by `(parent, child)` frame pairs.
///
/// Lookups interpolate between the two samples bracketing the requested stamp, answer the inverse
/// direction of any stored edge, and wait up to the timeout for samples that have not arrived yet.
/// Samples older than `cache_duration` behind the newest sample of the same edge are discarded.
pub struct TransformBuffer {
    edges: Mutex<HashMap<EdgeKey, Vec<(f64, Transform2D)>>>,
    updated: Condvar,
    cache_duration: f64,
}
impl Default for TransformBuffer {
    fn default() -> Self {
        TransformBuffer::new(10.0)
    }
}
impl TransformBuffer {
    pub fn new(cache_duration: f64) -> Self {
        TransformBuffer {
            edges: Mutex::new(HashMap::new()),
            updated: Condvar::new(),
            cache_duration,
        }
    }
    pub fn insert(
        &self,
        parent_frame: &str,
        child_frame: &str,
        stamp: f64,
        transform: Transform2D,
    ) {
        let mut edges = self.edges.lock();
        let history = edges
            .entry((parent_frame.to_string(), child_frame.to_string()))
            .or_default();
        let index = history.partition_point(|(t, _)| *t <= stamp);
        if index > 0 && history[index - 1].0 == stamp {
            history[index - 1].1 = transform;
        } else {
            history.insert(index, (stamp, transform));
        }
        if let Some(&(newest, _)) = history.last() {
            let horizon = newest - self.cache_duration;
            let stale = history.partition_point(|(t, _)| *t < horizon);
            history.drain(..stale);
        }
        drop(edges);
        self.updated.notify_all();
    }
    /// Newest stamp stored for the `(parent, child)` edge.
    pub fn latest_stamp(&self, parent_frame: &str, child_frame: &str) -> Option<f64> {
        self.edges
            .lock()
            .get(&(parent_frame.to_string(), child_frame.to_string()))
            .and_then(|history| history.last().map(|(t, _)| *t))
    }
    /// Interpolated lookup on one stored edge. `Err(true)` means "not yet available, a newer
    /// sample may still arrive".
    fn lookup_edge(history: &[(f64, Transform2D)], stamp: f64) -> Result<Transform2D, bool> {
        let (Some(first), Some(last)) = (history.first(), history.last()) else {
            return Err(true);
        };
        if stamp > last.0 {
            return Err(true);
        }
        if stamp < first.0 {
            return Err(false);
        }
        let index = history.partition_point(|(t, _)| *t < stamp);
        let (t1, after) = history[index];
        if t1 == stamp || index == 0 {
            return Ok(after);
        }
        let (t0, before) = history[index - 1];
        Ok(before.interpolate(&after, (stamp - t0) / (t1 - t0)))
    }
    fn try_resolve(
        edges: &HashMap<EdgeKey, Vec<(f64, Transform2D)>>,
        target_frame: &str,
        source_frame: &str,
        stamp: f64,
    ) -> Result<Transform2D, bool> {
        if target_frame == source_frame {
            return Ok(Transform2D::identity());
        }
        if let Some(history) = edges.get(&(target_frame.to_string(), source_frame.to_string())) {
            return Self::lookup_edge(history, stamp);
        }
        if let Some(history) = edges.get(&(source_frame.to_string(), target_frame.to_string())) {
            return Self::lookup_edge(history, stamp).map(|t| t.inverse());
        }
        Err(true)
    }
}
impl TransformProvider for TransformBuffer {
    fn resolve(
        &self,
        target_frame: &str,
        source_frame: &str,
        stamp: f64,
        timeout: Duration,
    ) -> Result<Transform2D, LocalizerError> {
        let unavailable = || LocalizerError::TransformUnavailable {
            target_frame: target_frame.to_string(),
            source_frame: source_frame.to_string(),
            stamp,
        };
        let deadline = Instant::now() + timeout;
        let mut edges = self.edges.lock();
        loop {
            match Self::try_resolve(&edges, target_frame, source_frame, stamp) {
                Ok(transform) => return Ok(transform),
                Err(false) => return Err(unavailable()),
                Err(true) => {
                    let now = Instant::now();
                    if now >= deadline {
                        trace!("timed out waiting for {source_frame} -> {target_frame} at {stamp}");
                        return Err(unavailable());
                    }
                    self.updated.wait_for(&mut edges, deadline - now);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use std::f64::consts::PI;
    use std::sync::Arc;
    use std::thread;

    const NO_WAIT: Duration = Duration::from_millis(0);

    #[test]
    fn test_exact_and_interpolated_lookup() {
        let buffer = TransformBuffer::default();
        buffer.insert("odom", "base_link", 1.0, Transform2D::new(0.0, 0.0, 0.0));
        buffer.insert("odom", "base_link", 2.0, Transform2D::new(2.0, 0.0, PI / 2.0));
        let exact = buffer.resolve("odom", "base_link", 2.0, NO_WAIT).unwrap();
        assert_approx_eq!(exact.x, 2.0);
        let mid = buffer.resolve("odom", "base_link", 1.5, NO_WAIT).unwrap();
        assert_approx_eq!(mid.x, 1.0);
        assert_approx_eq!(mid.theta, PI / 4.0);
    }
    #[test]
    fn test_inverse_and_identity_lookup() {
        let buffer = TransformBuffer::default();
        buffer.insert("odom", "base_link", 0.0, Transform2D::new(1.0, 2.0, 0.3));
        let forward = buffer.resolve("odom", "base_link", 0.0, NO_WAIT).unwrap();
        let inverse = buffer.resolve("base_link", "odom", 0.0, NO_WAIT).unwrap();
        let round = forward * inverse;
        assert_approx_eq!(round.x, 0.0);
        assert_approx_eq!(round.y, 0.0);
        assert_approx_eq!(round.theta, 0.0);
        assert_eq!(
            buffer.resolve("map", "map", 5.0, NO_WAIT).unwrap(),
            Transform2D::identity()
        );
    }
    #[test]
    fn test_unknown_or_future_stamp_times_out() {
        let buffer = TransformBuffer::default();
        buffer.insert("odom", "base_link", 1.0, Transform2D::identity());
        let start = Instant::now();
        let result = buffer.resolve("odom", "base_link", 3.0, Duration::from_millis(20));
        assert!(matches!(result, Err(LocalizerError::TransformUnavailable { .. })));
        assert!(start.elapsed() >= Duration::from_millis(20));
        assert!(buffer.resolve("odom", "laser", 1.0, NO_WAIT).is_err());
        assert!(buffer.resolve("odom", "base_link", 0.5, NO_WAIT).is_err());
    }
    #[test]
    fn test_waits_for_late_sample() {
        let buffer = Arc::new(TransformBuffer::default());
        buffer.insert("odom", "base_link", 0.0, Transform2D::identity());
        let writer = Arc::clone(&buffer);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            writer.insert("odom", "base_link", 1.0, Transform2D::new(4.0, 0.0, 0.0));
        });
        let t = buffer
            .resolve("odom", "base_link", 1.0, Duration::from_secs(5))
            .unwrap();
        assert_approx_eq!(t.x, 4.0);
        handle.join().unwrap();
    }
    #[test]
    fn test_stale_samples_dropped() {
        let buffer = TransformBuffer::new(1.0);
        buffer.insert("odom", "base_link", 0.0, Transform2D::identity());
        buffer.insert("odom", "base_link", 5.0, Transform2D::identity());
        assert!(buffer.resolve("odom", "base_link", 0.0, NO_WAIT).is_err());
        assert_eq!(buffer.latest_stamp("odom", "base_link"), Some(5.0));
    }
}
