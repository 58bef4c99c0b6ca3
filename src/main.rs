use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing::info;

use tongs_teleop::archive::SessionArchive;
use tongs_teleop::calibration::{CalibrationBoard, CalibrationEngine, load_extrinsics};
use tongs_teleop::computer_vision::{CameraExtrinsics, MarkerDetector};
use tongs_teleop::config::{RECORDED_TICK_PERIOD, SpeedProfile, TeleopConfig};
use tongs_teleop::frame_buffer::latest_frame_channel;
use tongs_teleop::orchestrator::MotionOrchestrator;
use tongs_teleop::session::{LoggingActuator, Session};

#[derive(Parser)]
#[command(name = "tongs-teleop")]
#[command(about = "Teleoperate a mobile manipulator with marker-fitted tongs")]
#[command(version)]
struct Cli {
    /// Teleoperation settings (YAML). Defaults are used without.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Solve the camera extrinsics from images of the calibration board.
    Calibrate {
        /// Board description (YAML).
        #[arg(long)]
        board: PathBuf,

        /// Where to write the extrinsics (JSON).
        #[arg(long)]
        out: PathBuf,

        /// Images of the board taken with the teleoperation camera.
        #[arg(required = true)]
        images: Vec<PathBuf>,
    },

    /// Write a printable marker as PNG.
    PrintMarker {
        #[arg(long)]
        id: u32,

        #[arg(long)]
        out: PathBuf,

        /// Side of one cell, pixels.
        #[arg(long, default_value = "40")]
        cell_px: u32,

        /// White margin around the marker, cells.
        #[arg(long, default_value = "1")]
        quiet_zone: u32,
    },

    /// Print the effective configuration.
    ShowConfig,

    /// Track the tongs through a sequence of recorded camera frames.
    Track {
        /// Camera extrinsics from `calibrate`.
        #[arg(long)]
        calibration: PathBuf,

        /// Save the emitted commands as a session archive.
        #[arg(long)]
        record: Option<PathBuf>,

        /// Frames in capture order.
        #[arg(required = true)]
        frames: Vec<PathBuf>,
    },

    /// Play back a recorded session.
    Replay {
        archive: PathBuf,

        /// Start from the ground manipulation configuration instead of the first recorded one.
        #[arg(short, long)]
        ground: bool,

        /// Speed profile of the move to the first recorded configuration.
        #[arg(short, long)]
        speed: Option<SpeedProfile>,

        /// Playback rate multiplier, 2.0 plays twice as fast.
        #[arg(long, default_value = "1.0")]
        rate: f64,

        /// Repeat until interrupted.
        #[arg(long = "loop")]
        repeat: bool,
    },

    /// Validate a recorded session.
    CheckArchive { archive: PathBuf },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => TeleopConfig::from_yaml_file(path)
            .with_context(|| format!("cannot read configuration {}", path.display()))?,
        None => TeleopConfig::default(),
    };

    match cli.command {
        Commands::Calibrate { board, out, images } => calibrate(&config, &board, &out, &images),
        Commands::PrintMarker {
            id,
            out,
            cell_px,
            quiet_zone,
        } => print_marker(&config, id, &out, cell_px, quiet_zone),
        Commands::ShowConfig => {
            print!("{}", config.to_yaml());
            Ok(())
        }
        Commands::Track {
            calibration,
            record,
            frames,
        } => track(&config, &calibration, record.as_deref(), frames),
        Commands::Replay {
            archive,
            ground,
            speed,
            rate,
            repeat,
        } => {
            let mut config = config;
            config.ground |= ground;
            if let Some(speed) = speed {
                config.speed = speed;
            }
            replay(config, &archive, rate, repeat)
        }
        Commands::CheckArchive { archive } => check_archive(&config, &archive),
    }
}

fn stop_on_interrupt() -> Result<Arc<AtomicBool>> {
    let stop = Arc::new(AtomicBool::new(false));
    let flag = stop.clone();
    ctrlc::set_handler(move || flag.store(true, Ordering::SeqCst))?;
    Ok(stop)
}

fn load_gray(path: &Path) -> Result<image::GrayImage> {
    Ok(image::open(path)
        .with_context(|| format!("failed to open image {}", path.display()))?
        .to_luma8())
}

fn calibrate(config: &TeleopConfig, board_path: &Path, out: &Path, images: &[PathBuf]) -> Result<()> {
    let board = CalibrationBoard::from_yaml_file(board_path)
        .with_context(|| format!("cannot read board {}", board_path.display()))?;
    let detector = MarkerDetector::new(config.camera, board.marker_size(), config.detector.clone())?;
    let mut engine = CalibrationEngine::new(board, config.camera, config.calibration.max_reprojection_error_px)?;

    for path in images {
        let used = engine.observe(&detector, &load_gray(path)?);
        info!("{}: {} board markers", path.display(), used);
    }

    let extrinsics = engine.solve().context("calibration must be redone")?;
    extrinsics.save(out)?;
    info!(
        "extrinsics written to {} ({:.3} px)",
        out.display(),
        extrinsics.reprojection_error_px()
    );
    Ok(())
}

fn print_marker(config: &TeleopConfig, id: u32, out: &Path, cell_px: u32, quiet_zone: u32) -> Result<()> {
    let dictionary = config.detector.dictionary()?;
    let Some(marker) = dictionary.render_marker(id, cell_px, quiet_zone) else {
        bail!("marker {} is not in the dictionary of {} markers", id, dictionary.len());
    };
    marker.save(out)?;
    info!("marker {} written to {}", id, out.display());
    Ok(())
}

fn track(config: &TeleopConfig, calibration: &Path, record: Option<&Path>, frames: Vec<PathBuf>) -> Result<()> {
    let extrinsics = load_extrinsics(calibration, config.calibration.max_reprojection_error_px)?;
    let detector = config.marker_detector()?;
    let orchestrator = MotionOrchestrator::new(config, extrinsics)?;
    let mut session = Session::new(orchestrator, LoggingActuator::default())?;
    if record.is_some() {
        session = session.recording();
    }
    let stop = stop_on_interrupt()?;

    // Frames are fed at the configured rate, as a camera would.
    let (mut writer, mut reader) = latest_frame_channel();
    let period = Duration::from_secs_f64(config.tick_duration());
    let producer_stop = stop.clone();
    let producer = thread::spawn(move || -> Result<()> {
        let clock = Instant::now();
        for path in frames {
            if producer_stop.load(Ordering::Relaxed) {
                break;
            }
            writer.publish(clock.elapsed().as_secs_f64(), load_gray(&path)?);
            thread::sleep(period);
        }
        Ok(())
    });

    let result = session.run(&mut reader, &detector, &stop);
    stop.store(true, Ordering::SeqCst);
    match producer.join() {
        Ok(produced) => produced?,
        Err(_) => bail!("frame producer panicked"),
    }
    result?;

    if let (Some(path), Some(archive)) = (record, session.take_recording()) {
        archive.save(path)?;
    }
    Ok(())
}

fn replay(mut config: TeleopConfig, path: &Path, rate: f64, repeat: bool) -> Result<()> {
    if !(rate.is_finite() && rate > 0.0) {
        bail!("playback rate must be positive, got {}", rate);
    }
    let archive = SessionArchive::load(path)?;
    if archive.is_empty() {
        bail!("no configurations found in {}", path.display());
    }
    config.base_mode = archive.base_move_mode;
    let limits = config.limits()?;
    let first = archive.configurations(&limits)?[0];
    let mut orchestrator = MotionOrchestrator::new(&config, CameraExtrinsics::identity())?;
    if !config.ground {
        orchestrator = orchestrator.with_start(first)?;
    }
    info!(
        "replaying in {} mode at {} speed, starting from {}",
        archive.base_move_mode,
        config.speed,
        orchestrator.starting_configuration()
    );

    let mut session = Session::new(orchestrator, LoggingActuator::default())?;
    let stop = stop_on_interrupt()?;
    let tick = Duration::from_secs_f64(config.tick_duration());
    let pace = Duration::from_secs_f64(RECORDED_TICK_PERIOD / rate);

    let mut playback = 0;
    loop {
        playback += 1;
        session.approach(&first, Some(tick), &stop)?;
        if stop.load(Ordering::SeqCst) {
            break;
        }
        info!("playback #{}", playback);
        let sent = session.replay(&archive, Some(pace), &stop)?;
        info!("playback #{} complete, {} configurations sent", playback, sent);
        if !repeat || stop.load(Ordering::SeqCst) {
            break;
        }
        thread::sleep(Duration::from_secs(1));
    }
    session.stop();
    Ok(())
}

fn check_archive(config: &TeleopConfig, path: &Path) -> Result<()> {
    let archive = SessionArchive::load(path)?;
    let configurations = archive.configurations(&config.limits()?)?;
    println!(
        "{}: {} mode, {} configurations, {:.1} s at the recorded rate",
        path.display(),
        archive.base_move_mode,
        configurations.len(),
        configurations.len() as f64 * RECORDED_TICK_PERIOD
    );
    Ok(())
}
