//! Replaying recorded data through the localizer.
//!
//! This module provides:
//! - record types for odometry (`time,x,y,theta`) and scan points (`time,x,y`) CSV files
//! - an event stream merging both sources in time order
//! - [`run_replay`], which feeds odometry into a [`TransformBuffer`] and runs one filter cycle per
//!   scan
//! - [`LocalizationResult`] for storing the per-cycle output and writing it back to CSV
//!
//! Scans are held back until odometry at or after their stamp has been replayed, the same way a
//! live system waits for the transform tree to catch up with the sensor.
use crate::error::LocalizerError;
use crate::filter::{CycleReport, Localizer};
use crate::frames::TransformBuffer;
use crate::sensor::{DistanceField, RangeScan};
use crate::{Point2D, Pose2D};

use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::error::Error;
use std::io;
use std::path::Path;

/// One odometry sample: pose of the robot base in the odometry frame.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct OdometryRecord {
    /// Seconds
    pub time: f64,
    pub x: f64,
    pub y: f64,
    /// Radians
    pub theta: f64,
}
impl OdometryRecord {
    pub fn pose(&self) -> Pose2D {
        Pose2D::new(self.x, self.y, self.theta)
    }
    /// Reads odometry records from a CSV file with a `time,x,y,theta` header.
    pub fn from_csv<P: AsRef<Path>>(path: P) -> Result<Vec<Self>, Box<dyn Error>> {
        let mut rdr = csv::Reader::from_path(path)?;
        let mut records = Vec::new();
        for result in rdr.deserialize() {
            let record: Self = result?;
            records.push(record);
        }
        Ok(records)
    }
    pub fn to_csv<P: AsRef<Path>>(records: &[Self], path: P) -> io::Result<()> {
        let mut writer = csv::Writer::from_path(path)?;
        for record in records {
            writer.serialize(record)?;
        }
        writer.flush()?;
        Ok(())
    }
}

/// One range point in the sensor's Cartesian frame. Rows sharing a `time` form one scan.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScanPointRecord {
    pub time: f64,
    pub x: f64,
    pub y: f64,
}
impl ScanPointRecord {
    pub fn from_csv<P: AsRef<Path>>(path: P) -> Result<Vec<Self>, Box<dyn Error>> {
        let mut rdr = csv::Reader::from_path(path)?;
        let mut records = Vec::new();
        for result in rdr.deserialize() {
            let record: Self = result?;
            records.push(record);
        }
        Ok(records)
    }
    pub fn to_csv<P: AsRef<Path>>(records: &[Self], path: P) -> io::Result<()> {
        let mut writer = csv::Writer::from_path(path)?;
        for record in records {
            writer.serialize(record)?;
        }
        writer.flush()?;
        Ok(())
    }
    /// Group point rows into scans, one per distinct stamp, sorted by time.
    pub fn group_scans(records: &[Self]) -> Vec<RangeScan> {
        let mut sorted = records.to_vec();
        sorted.sort_by(|a, b| a.time.total_cmp(&b.time));
        let mut scans: Vec<RangeScan> = Vec::new();
        let mut points = Vec::new();
        let mut stamp = None;
        for record in sorted {
            if let Some(t) = stamp
                && t != record.time
            {
                scans.push(RangeScan::from_points(t, std::mem::take(&mut points)));
            }
            stamp = Some(record.time);
            points.push(Point2D::new(record.x, record.y));
        }
        if let Some(t) = stamp {
            scans.push(RangeScan::from_points(t, points));
        }
        scans
    }
}

/// Range points a noiseless sensor mounted at the robot base would report for `obstacles` when the
/// robot is at `pose` in the map frame.
pub fn observe_obstacles(pose: &Pose2D, obstacles: &[Point2D], stamp: f64) -> RangeScan {
    let map_to_base = pose.as_transform().inverse();
    RangeScan::from_points(
        stamp,
        obstacles.iter().map(|p| map_to_base.apply(p)).collect(),
    )
}

pub enum Event {
    Odometry { stamp: f64, pose: Pose2D },
    Scan(RangeScan),
}
impl Event {
    pub fn stamp(&self) -> f64 {
        match self {
            Event::Odometry { stamp, .. } => *stamp,
            Event::Scan(scan) => scan.stamp,
        }
    }
}

/// Time-ordered replay input.
pub struct EventStream {
    pub events: Vec<Event>,
}

/// Merge odometry and scans into a single stream ordered by stamp. At equal stamps odometry
/// comes first.
pub fn build_event_stream(odometry: &[OdometryRecord], scans: Vec<RangeScan>) -> EventStream {
    let mut events: Vec<Event> = odometry
        .iter()
        .map(|r| Event::Odometry {
            stamp: r.time,
            pose: r.pose(),
        })
        .chain(scans.into_iter().map(Event::Scan))
        .collect();
    // Stable sort keeps odometry ahead of scans with the same stamp.
    events.sort_by(|a, b| a.stamp().total_cmp(&b.stamp()));
    EventStream { events }
}

/// One row of localizer output.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct LocalizationRecord {
    pub time: f64,
    pub x: f64,
    pub y: f64,
    pub theta: f64,
    pub map_odom_x: f64,
    pub map_odom_y: f64,
    pub map_odom_theta: f64,
    pub ess: f64,
    pub resampled: bool,
}
impl From<&CycleReport> for LocalizationRecord {
    fn from(report: &CycleReport) -> Self {
        LocalizationRecord {
            time: report.stamp,
            x: report.pose.x,
            y: report.pose.y,
            theta: report.pose.theta,
            map_odom_x: report.correction.x,
            map_odom_y: report.correction.y,
            map_odom_theta: report.correction.theta,
            ess: report.effective_sample_size,
            resampled: report.resampled,
        }
    }
}

/// Output of a replay.
#[derive(Clone, Debug, Default)]
pub struct LocalizationResult {
    pub records: Vec<LocalizationRecord>,
    /// Scans dropped because odometry for their stamp was never available.
    pub skipped: usize,
}
impl LocalizationResult {
    pub fn to_csv<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let mut writer = csv::Writer::from_path(path)?;
        for record in &self.records {
            writer.serialize(record)?;
        }
        writer.flush()?;
        Ok(())
    }
    pub fn from_csv<P: AsRef<Path>>(path: P) -> Result<Self, Box<dyn Error>> {
        let mut rdr = csv::Reader::from_path(path)?;
        let mut records = Vec::new();
        for result in rdr.deserialize() {
            let record: LocalizationRecord = result?;
            records.push(record);
        }
        Ok(LocalizationResult {
            records,
            skipped: 0,
        })
    }
}

fn run_cycle<F: DistanceField + ?Sized>(
    localizer: &mut Localizer<F, TransformBuffer>,
    scan: &RangeScan,
    result: &mut LocalizationResult,
) -> Result<(), LocalizerError> {
    match localizer.process_scan(scan) {
        Ok(report) => {
            result.records.push(LocalizationRecord::from(&report));
            Ok(())
        }
        Err(e) if e.is_recoverable() => {
            result.skipped += 1;
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Replay `stream` through `localizer`. Odometry events are written into `buffer` as the
/// odometry-to-base transform; `buffer` must be the transform provider the localizer was built with.
///
/// # Errors
/// Only unrecoverable localizer errors end the replay; skipped cycles are counted in the result.
pub fn run_replay<F: DistanceField + ?Sized>(
    localizer: &mut Localizer<F, TransformBuffer>,
    buffer: &TransformBuffer,
    stream: &EventStream,
) -> Result<LocalizationResult, LocalizerError> {
    let odom_frame = localizer.config().frames.odom.clone();
    let base_frame = localizer.config().frames.base.clone();
    let mut result = LocalizationResult::default();
    let mut pending: VecDeque<&RangeScan> = VecDeque::new();
    for event in &stream.events {
        match event {
            Event::Odometry { stamp, pose } => {
                buffer.insert(&odom_frame, &base_frame, *stamp, pose.as_transform());
                while let Some(scan) = pending.front().copied()
                    && scan.stamp <= *stamp
                {
                    pending.pop_front();
                    run_cycle(localizer, scan, &mut result)?;
                }
            }
            Event::Scan(scan) => {
                let caught_up = buffer
                    .latest_stamp(&odom_frame, &base_frame)
                    .is_some_and(|t| t >= scan.stamp);
                if caught_up && pending.is_empty() {
                    run_cycle(localizer, scan, &mut result)?;
                } else {
                    pending.push_back(scan);
                }
            }
        }
    }
    if !pending.is_empty() {
        warn!(
            "{} scans after the last odometry sample were not processed",
            pending.len()
        );
        result.skipped += pending.len();
    }
    info!(
        "replay finished: {} cycles, {} skipped",
        result.records.len(),
        result.skipped
    );
    Ok(result)
}
