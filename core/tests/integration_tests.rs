//! End-to-end tests for the localizer.
//!
//! These run complete filter cycles against a small synthetic world: a handful of point obstacles
//! whose exact distance field is computed on the fly, scans generated by observing those obstacles
//! from the true robot pose, and odometry delivered through a [`TransformBuffer`].
//!
//! The accuracy bounds are regression checks, loose enough to hold for any seed.
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use assert_approx_eq::assert_approx_eq;
use mcl::config::LocalizerConfig;
use mcl::filter::{FilterState, Localizer};
use mcl::frames::{StampedTransform, TransformBuffer, TransformProvider};
use mcl::publish::CorrectionBroadcaster;
use mcl::sensor::{DistanceField, GridDistanceField};
use mcl::sim::observe_obstacles;
use mcl::{LocalizerError, Point2D, Pose2D, Transform2D};
use parking_lot::Mutex;

const OBSTACLES: [Point2D; 4] = [
    Point2D { x: 1.0, y: 0.0 },
    Point2D { x: 0.0, y: 2.0 },
    Point2D { x: -1.5, y: 0.0 },
    Point2D { x: 0.5, y: -1.0 },
];

fn nearest_obstacle(x: f64, y: f64) -> f64 {
    let here = Point2D::new(x, y);
    OBSTACLES
        .iter()
        .map(|o| o.distance_to(&here))
        .fold(f64::INFINITY, f64::min)
}

type TestLocalizer = Localizer<dyn DistanceField, TransformBuffer>;

fn localizer_with(config: LocalizerConfig) -> (TestLocalizer, Arc<TransformBuffer>) {
    let buffer = Arc::new(TransformBuffer::default());
    let field: Arc<dyn DistanceField> = Arc::new(nearest_obstacle);
    let localizer = Localizer::new(config, field, Arc::clone(&buffer)).unwrap();
    (localizer, buffer)
}

fn sharp_config() -> LocalizerConfig {
    let mut config = LocalizerConfig {
        num_particles: 100,
        transform_timeout_s: 0.05,
        ..LocalizerConfig::default()
    };
    config.likelihood.scan_stride = 1;
    config.likelihood.hit_std = 0.05;
    config
}

#[test]
fn test_single_cycle_concentrates_cloud() {
    let (mut localizer, buffer) = localizer_with(sharp_config());
    localizer.reseed(Pose2D::default(), None).unwrap();
    let scatter_radius = localizer.config().initial_scatter.xy_std;
    let variance_before = localizer.cloud().positional_variance();

    buffer.insert("odom", "base_link", 1.0, Transform2D::identity());
    let scan = observe_obstacles(&Pose2D::default(), &OBSTACLES, 1.0);
    let report = localizer.process_scan(&scan).unwrap();

    assert!(!report.motion_applied);
    assert!(report.resampled);
    assert!(report.warnings.is_empty());
    let error = report.pose.x.hypot(report.pose.y);
    assert!(error < scatter_radius, "estimate {} too far from origin", report.pose);
    assert!(report.pose.theta.abs() < 0.1);
    let variance_after = localizer.cloud().positional_variance();
    assert!(
        variance_after < variance_before,
        "variance grew from {variance_before} to {variance_after}"
    );
    assert_eq!(localizer.cloud().len(), 100);
    let sum: f64 = localizer.cloud().iter().map(|p| p.weight).sum();
    assert_approx_eq!(sum, 1.0, 1e-9);
}

#[test]
fn test_transform_timeout_skips_cycle() {
    let (mut localizer, buffer) = localizer_with(sharp_config());
    buffer.insert("odom", "base_link", 0.0, Transform2D::identity());
    let scan = observe_obstacles(&Pose2D::default(), &OBSTACLES, 0.0);
    let first = localizer.process_scan(&scan).unwrap();
    let cloud_before = localizer.cloud().clone();
    let published_before = localizer.estimate_handle().latest().unwrap();

    let late = observe_obstacles(&Pose2D::default(), &OBSTACLES, 5.0);
    let err = localizer.process_scan(&late).unwrap_err();
    assert!(matches!(err, LocalizerError::TransformUnavailable { .. }));
    assert!(err.is_recoverable());
    assert_eq!(&cloud_before, localizer.cloud());
    assert_eq!(localizer.estimate().unwrap(), first.pose);
    let published_after = localizer.estimate_handle().latest().unwrap();
    assert!(Arc::ptr_eq(&published_before, &published_after));
}

#[test]
fn test_lazy_initialization_at_odometry_pose() {
    let (mut localizer, buffer) = localizer_with(sharp_config());
    assert_eq!(localizer.state(), FilterState::Uninitialized);
    let truth = Pose2D::new(0.1, -0.05, 0.02);
    buffer.insert("odom", "base_link", 2.0, truth.as_transform());
    let report = localizer
        .process_scan(&observe_obstacles(&truth, &OBSTACLES, 2.0))
        .unwrap();
    assert!(report.initialized);
    assert_eq!(localizer.state(), FilterState::Ready);
    assert!((report.pose.x - truth.x).hypot(report.pose.y - truth.y) < 0.1);
}

#[test]
fn test_tracks_motion() {
    let mut config = sharp_config();
    config.num_particles = 300;
    config.likelihood.hit_std = 0.1;
    config.motion_noise.x_std = 0.01;
    config.motion_noise.y_std = 0.01;
    config.motion_noise.theta_std = 0.01;
    let (mut localizer, buffer) = localizer_with(config);

    // Odometry starts at its own origin while the robot really sits at (0.2, 0.1) in the map.
    let offset = Transform2D::new(0.2, 0.1, 0.0);
    localizer.reseed(Pose2D::new(0.2, 0.1, 0.0), None).unwrap();
    let mut last = None;
    for step in 0..=20 {
        let stamp = step as f64 * 0.1;
        let odom = Pose2D::new(step as f64 * 0.02, 0.0, step as f64 * 0.01);
        let truth = Pose2D::from(offset * odom.as_transform());
        buffer.insert("odom", "base_link", stamp, odom.as_transform());
        let report = localizer
            .process_scan(&observe_obstacles(&truth, &OBSTACLES, stamp))
            .unwrap();
        assert!(report.motion_applied || step == 0);
        last = Some((report, truth, odom));
    }
    let (report, truth, odom) = last.unwrap();
    assert!(
        (report.pose.x - truth.x).hypot(report.pose.y - truth.y) < 0.15,
        "estimate {} vs truth {}",
        report.pose,
        truth
    );
    let map_pose = report.correction * odom.as_transform();
    assert_approx_eq!(map_pose.x, report.pose.x, 1e-9);
    assert_approx_eq!(map_pose.y, report.pose.y, 1e-9);
    assert!((report.correction.x - offset.x).abs() < 0.15);
}

#[test]
fn test_reseed_from_another_thread() {
    let (mut localizer, buffer) = localizer_with(sharp_config());
    localizer.reseed(Pose2D::new(5.0, 5.0, 0.0), None).unwrap();
    let handle = localizer.reseed_handle();
    thread::spawn(move || handle.request(Pose2D::default(), None))
        .join()
        .unwrap();
    buffer.insert("odom", "base_link", 0.0, Transform2D::identity());
    let report = localizer
        .process_scan(&observe_obstacles(&Pose2D::default(), &OBSTACLES, 0.0))
        .unwrap();
    assert!(report.pose.x.hypot(report.pose.y) < 0.1);
}

#[test]
fn test_reseed_request_waits_out_skipped_cycle() {
    let (mut localizer, buffer) = localizer_with(sharp_config());
    buffer.insert("odom", "base_link", 0.0, Transform2D::identity());
    localizer
        .process_scan(&observe_obstacles(&Pose2D::default(), &OBSTACLES, 0.0))
        .unwrap();
    let cloud_before = localizer.cloud().clone();
    let estimate_before = localizer.estimate().unwrap();

    let handle = localizer.reseed_handle();
    let truth = Pose2D::new(0.3, 0.2, 0.0);
    thread::spawn(move || handle.request(truth, None))
        .join()
        .unwrap();
    let scan = observe_obstacles(&truth, &OBSTACLES, 1.0);
    let err = localizer.process_scan(&scan).unwrap_err();
    assert!(err.is_recoverable());
    assert_eq!(&cloud_before, localizer.cloud());
    assert_eq!(localizer.estimate().unwrap(), estimate_before);
    assert!(localizer.reseed_handle().is_pending());

    buffer.insert("odom", "base_link", 1.0, Transform2D::identity());
    let report = localizer.process_scan(&scan).unwrap();
    assert!(report.reseeded);
    assert!((report.pose.x - truth.x).hypot(report.pose.y - truth.y) < 0.1);
}

#[test]
fn test_broadcaster_follows_reseed() {
    let (mut localizer, buffer) = localizer_with(sharp_config());
    let odom = Pose2D::new(0.5, 0.0, 0.0);
    buffer.insert("odom", "base_link", 0.0, odom.as_transform());
    localizer
        .process_scan(&observe_obstacles(&Pose2D::default(), &OBSTACLES, 0.0))
        .unwrap();

    let received = Arc::new(Mutex::new(Vec::new()));
    let sink_received = Arc::clone(&received);
    let sink = move |c: &StampedTransform| sink_received.lock().push(c.transform);
    let broadcaster = CorrectionBroadcaster::spawn(localizer.estimate_handle(), 200.0, sink);

    localizer.reseed(Pose2D::new(3.0, -2.0, 0.5), None).unwrap();
    let expected = localizer.estimate_handle().correction().unwrap();
    thread::sleep(Duration::from_millis(60));
    broadcaster.stop();

    let received = received.lock();
    let last = received.last().copied().unwrap();
    assert_eq!(last, expected.transform);
    let map_pose = last * odom.as_transform();
    assert!((map_pose.x - 3.0).hypot(map_pose.y + 2.0) < 0.1);
}

#[test]
fn test_readers_never_block_cycles() {
    let (mut localizer, buffer) = localizer_with(sharp_config());
    let estimates = localizer.estimate_handle();
    let reader = thread::spawn(move || {
        let mut seen = 0;
        for _ in 0..200 {
            if let Some(snapshot) = estimates.latest() {
                assert_eq!(snapshot.particles.len(), 100);
                assert_eq!(snapshot.correction.stamp, snapshot.stamp);
                seen += 1;
            }
            thread::sleep(Duration::from_micros(100));
        }
        seen
    });
    for step in 0..10 {
        let stamp = step as f64;
        buffer.insert("odom", "base_link", stamp, Transform2D::identity());
        localizer
            .process_scan(&observe_obstacles(&Pose2D::default(), &OBSTACLES, stamp))
            .unwrap();
    }
    let _ = reader.join().unwrap();
    let latest = localizer.estimate_handle().latest().unwrap();
    assert_eq!(latest.stamp, 9.0);
}

#[test]
fn test_grid_field_matches_exact_distances() {
    let grid = GridDistanceField::from_obstacles(
        Point2D::new(-3.0, -3.0),
        0.05,
        120,
        120,
        &OBSTACLES,
    )
    .unwrap();
    for &(x, y) in &[(0.0, 0.0), (0.9, 0.1), (-1.0, 1.0), (2.0, -2.0)] {
        assert!((grid.distance(x, y) - nearest_obstacle(x, y)).abs() < 0.1);
    }
    assert!(grid.distance(10.0, 10.0).is_nan());

    let buffer = Arc::new(TransformBuffer::default());
    let mut localizer =
        Localizer::new(sharp_config(), Arc::new(grid), Arc::clone(&buffer)).unwrap();
    localizer.reseed(Pose2D::default(), None).unwrap();
    buffer.insert("odom", "base_link", 0.0, Transform2D::identity());
    let report = localizer
        .process_scan(&observe_obstacles(&Pose2D::default(), &OBSTACLES, 0.0))
        .unwrap();
    assert!(report.pose.x.hypot(report.pose.y) < 0.1);
    assert!(buffer.resolve("map", "odom", 0.0, Duration::ZERO).is_err());
}
