//! MCL: replay recorded odometry and range scans through the Monte Carlo localizer.
//!
//! The `run` subcommand builds a distance field from an obstacle point file, replays an odometry
//! CSV and a scan-point CSV in time order, and writes one row per filter cycle (pose estimate,
//! map-to-odometry correction, effective sample size). The `config` subcommand writes a template
//! configuration file (TOML/JSON/YAML, chosen by extension).
use clap::{Args, Parser, Subcommand};
use log::{LevelFilter, debug, error, info};
use mcl::Pose2D;
use mcl::config::LocalizerConfig;
use mcl::filter::Localizer;
use mcl::frames::{StampedTransform, TransformBuffer};
use mcl::particle::ParticleResamplingStrategy;
use mcl::publish::CorrectionBroadcaster;
use mcl::sensor::GridDistanceField;
use mcl::sim::{OdometryRecord, ScanPointRecord, build_event_stream, run_replay};
use std::error::Error;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(author, version, about = "Monte Carlo localization of a planar robot against an obstacle map.")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Log level (off, error, warn, info, debug, trace)
    #[arg(long, default_value = "info", global = true)]
    log_level: LevelFilter,

    /// Log file path (if not specified, logs to stderr)
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    #[command(
        name = "run",
        about = "Replay odometry and scans through the localizer",
        long_about = "Replay an odometry CSV (time,x,y,theta) and a scan CSV (time,x,y; rows sharing a time form one scan) against a distance field built from an obstacle CSV (x,y). Writes time,x,y,theta,map_odom_x,map_odom_y,map_odom_theta,ess,resampled."
    )]
    Run(RunArgs),
    #[command(name = "config", about = "Generate a template configuration file")]
    CreateConfig {
        /// Output path; the extension selects the format
        path: PathBuf,
    },
}

#[derive(Args, Clone, Debug)]
struct RunArgs {
    /// Localizer configuration (TOML/JSON/YAML); defaults are used if omitted
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Obstacle points in the map frame (CSV with x,y columns)
    #[arg(short, long)]
    map: PathBuf,
    /// Distance field cell size (m)
    #[arg(long, default_value_t = 0.05)]
    resolution: f64,
    /// Free space added around the obstacle bounds (m)
    #[arg(long, default_value_t = 2.0)]
    margin: f64,
    /// Odometry CSV (time,x,y,theta)
    #[arg(long)]
    odometry: PathBuf,
    /// Scan points CSV (time,x,y)
    #[arg(long)]
    scans: PathBuf,
    /// Output CSV path
    #[arg(short, long)]
    output: PathBuf,
    /// Initial pose guess "x,y,theta"; without it the cloud starts at the first odometry pose
    #[arg(long, value_parser = parse_pose, allow_hyphen_values = true)]
    initial_pose: Option<Pose2D>,
    /// Override the configured particle count
    #[arg(long)]
    particles: Option<usize>,
    /// Override the configured resampling strategy
    #[arg(long, value_enum)]
    resampling: Option<ParticleResamplingStrategy>,
}

fn parse_pose(s: &str) -> Result<Pose2D, String> {
    let values = s
        .split(',')
        .map(|v| v.trim().parse::<f64>().map_err(|e| format!("'{v}': {e}")))
        .collect::<Result<Vec<f64>, String>>()?;
    match values.as_slice() {
        [x, y, theta] => Ok(Pose2D::new(*x, *y, *theta)),
        _ => Err(format!("expected x,y,theta, got '{s}'")),
    }
}

/// Open `path` for appending log lines, creating missing parent directories.
fn log_file_target(path: &Path) -> io::Result<env_logger::Target> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)?;
    }
    let file = fs::OpenOptions::new().create(true).append(true).open(path)?;
    Ok(env_logger::Target::Pipe(Box::new(file)))
}

/// Install the global logger: millisecond local timestamps, then level and message.
///
/// # Arguments
/// * `level` - most verbose level that is emitted
/// * `log_file` - append to this file instead of writing to stderr
///
/// # Errors
/// Fails if the log file cannot be opened or a logger is already installed.
fn init_logger(level: LevelFilter, log_file: Option<&Path>) -> Result<(), Box<dyn Error>> {
    let mut builder = env_logger::Builder::new();
    builder.filter_level(level).format(|buf, record| {
        let now = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
        writeln!(buf, "{now} [{}] - {}", record.level(), record.args())
    });
    if let Some(path) = log_file {
        builder.target(log_file_target(path)?);
    }
    builder.try_init()?;
    Ok(())
}

fn run(args: &RunArgs) -> Result<(), Box<dyn Error>> {
    let mut config = match &args.config {
        Some(path) => LocalizerConfig::from_file(path)?,
        None => LocalizerConfig::default(),
    };
    if let Some(n) = args.particles {
        config.num_particles = n;
    }
    if let Some(strategy) = args.resampling {
        config.resampling = strategy;
    }

    let field = Arc::new(GridDistanceField::from_csv(&args.map, args.resolution, args.margin)?);
    info!(
        "distance field: {} x {} cells at {} m",
        field.width(),
        field.height(),
        field.resolution()
    );
    let odometry = OdometryRecord::from_csv(&args.odometry)?;
    let scans = ScanPointRecord::group_scans(&ScanPointRecord::from_csv(&args.scans)?);
    info!("loaded {} odometry samples and {} scans", odometry.len(), scans.len());

    let buffer = Arc::new(TransformBuffer::default());
    let publish_rate_hz = config.publish_rate_hz;
    let mut localizer = Localizer::new(config, field, Arc::clone(&buffer))?;
    if let Some(pose) = args.initial_pose {
        localizer.reseed(pose, None)?;
    }
    let broadcaster = CorrectionBroadcaster::spawn(
        localizer.estimate_handle(),
        publish_rate_hz,
        |correction: &StampedTransform| {
            debug!(
                "{} -> {} at t = {:.3}: ({:.3}, {:.3}, {:.3})",
                correction.parent_frame,
                correction.child_frame,
                correction.stamp,
                correction.transform.x,
                correction.transform.y,
                correction.transform.theta
            );
        },
    );

    let stream = build_event_stream(&odometry, scans);
    let result = run_replay(&mut localizer, &buffer, &stream);
    broadcaster.stop();
    let result = result?;
    if let Ok(pose) = localizer.estimate() {
        info!("final estimate: {pose}");
    }
    result.to_csv(&args.output)?;
    info!("results written to {}", args.output.display());
    Ok(())
}

fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    init_logger(cli.log_level, cli.log_file.as_deref())?;
    match cli.command {
        Command::Run(args) => {
            info!("replaying {} against {}", args.scans.display(), args.map.display());
            run(&args).inspect_err(|e| error!("replay failed: {e}"))
        }
        Command::CreateConfig { path } => {
            LocalizerConfig::default().to_file(&path)?;
            info!("template configuration written to {}", path.display());
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pose() {
        assert_eq!(parse_pose("1, -2.5, 0.3").unwrap(), Pose2D::new(1.0, -2.5, 0.3));
        assert!(parse_pose("1,2").is_err());
        assert!(parse_pose("1,2,x").is_err());
    }

    #[test]
    fn test_cli_log_level() {
        let parse =
            |level: &str| Cli::try_parse_from(["mcl", "--log-level", level, "config", "c.toml"]);
        let cli = parse("debug").unwrap();
        assert_eq!(cli.log_level, LevelFilter::Debug);
        assert!(matches!(cli.command, Command::CreateConfig { .. }));
        assert!(parse("loud").is_err());
    }

    #[test]
    fn test_log_file_target_creates_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("nested").join("mcl.log");
        log_file_target(&path).unwrap();
        assert!(path.exists());
    }
}
