mod head;
mod replay;
mod scene;

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use frame_settle_common::config::Config;
use frame_settle_common::{Frame, Location};
use frame_settle_vision::focus::FocusSearch;
use frame_settle_vision::motion::Movable;
use frame_settle_vision::overlay::DiagnosticOverlay;
use frame_settle_vision::parallax::ParallaxHeightEstimator;
use frame_settle_vision::source::FrameSource;
use frame_settle_vision::{Camera, CameraBuilder, VisionError};
use rand::Rng;
use tracing::{error, info, warn};

use crate::head::SimulatedHead;
use crate::replay::ReplaySource;
use crate::scene::{Optics, SimulatedCamera};

/// Largest subject the focus mode sizes its sampling circle for, mm.
const FOCUS_SUBJECT_MM: f64 = 2.0;
/// Half of the Z range the focus mode sweeps around the true focus.
const FOCUS_SWEEP_MM: f64 = 1.5;

#[derive(Debug, thiserror::Error)]
pub enum SimError {
    #[error("config error: {0}")]
    Config(#[from] frame_settle_common::config::ConfigError),
    #[error(transparent)]
    Vision(#[from] VisionError),
    #[error(transparent)]
    Motion(#[from] frame_settle_vision::motion::MotionError),
    #[error("camera setup failed: {0}")]
    Setup(#[from] frame_settle_vision::ConfigurationError),
    #[error("replay: {0}")]
    Replay(String),
    #[error("worker task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("unknown mode '{0}', expected settle, focus, parallax, preview or replay")]
    UnknownMode(String),
}

struct Rig {
    head: Arc<SimulatedHead>,
    camera: Camera,
}

fn log_overlay(overlay: DiagnosticOverlay) {
    info!(
        caption = %overlay.caption,
        width = overlay.image.width(),
        height = overlay.image.height(),
        "diagnostic overlay"
    );
}

fn build_rig(config: &Config) -> Result<Rig, SimError> {
    let head = Arc::new(SimulatedHead::new(
        config.simulator.vibration_px,
        config.simulator.vibration_decay_ms,
    ));
    let source = SimulatedCamera::new(
        head.clone(),
        config.simulator.clone(),
        Optics {
            units_per_pixel: config.camera.units_per_pixel_x,
            default_z: config.camera.default_z,
            focal_point_z: config.parallax.focal_point_z,
        },
    );
    let camera = CameraBuilder::from_config(config)
        .source(Arc::new(source))
        .machine(head.clone())
        .overlay_sink(Arc::new(log_overlay))
        .build()?;
    Ok(Rig { head, camera })
}

fn run_settle(config: &Config, rig: &Rig) -> Result<(), SimError> {
    let mut rng = rand::rng();
    for cycle in 0..config.simulator.cycles {
        let target = Location::new(rng.random_range(-5.0..5.0), rng.random_range(-5.0..5.0), 0.0, 0.0);
        rig.head.move_to(target, None)?;
        let result = rig.camera.settle_and_capture()?;
        info!(
            cycle,
            elapsed_ms = result.elapsed.as_millis() as u64,
            frames = result.frames_captured,
            score = result.score,
            timed_out = result.timed_out,
            "settled"
        );
        if let Some(recording) = rig.camera.settle_recording() {
            info!(
                cycle,
                frames = recording.frame_count(),
                max_score = recording.graph().max_score(),
                "settle recording kept"
            );
            // replay the moment the scene was accepted
            if let Some(last) = recording.frame_times().last() {
                rig.camera.play_settle_recording(last);
            }
        }
    }
    Ok(())
}

fn run_focus(config: &Config, rig: &Rig) -> Result<(), SimError> {
    let focus_z = config.simulator.focus_z;
    let search = FocusSearch::new(config.focus.clone());
    let outcome = search.search(
        &rig.camera,
        rig.head.as_ref(),
        FOCUS_SUBJECT_MM,
        Location::new(0.0, 0.0, focus_z - FOCUS_SWEEP_MM, 0.0),
        Location::new(0.0, 0.0, focus_z + FOCUS_SWEEP_MM, 0.0),
    )?;
    info!(
        best = %outcome.best,
        passes = outcome.passes.len(),
        error_mm = outcome.best.z - focus_z,
        "auto focus done"
    );
    Ok(())
}

fn run_parallax(config: &Config, rig: &Rig) -> Result<(), SimError> {
    let estimator = ParallaxHeightEstimator::new(config.parallax.clone());
    let start = Location::new(0.0, 0.0, config.simulator.focus_z, 0.0);
    let found = estimator.auto_focus(&rig.camera, rig.head.as_ref(), start)?;
    info!(
        z = found.z,
        expected = config.simulator.feature_z,
        "parallax height measured"
    );
    Ok(())
}

async fn run_preview(config: &Config, rig: Rig) -> Result<(), SimError> {
    let received = Arc::new(AtomicU64::new(0));
    let listener = {
        let received = received.clone();
        move |_frame: Arc<Frame>| {
            received.fetch_add(1, Ordering::Relaxed);
        }
    };
    let id = rig.camera.start_continuous_capture(Arc::new(listener), None)?;

    // keep the head moving so the preview has something to show
    let head = rig.head.clone();
    let camera = rig.camera.clone();
    let jog = tokio::spawn(async move {
        let mut x = 0.0;
        loop {
            tokio::time::sleep(Duration::from_millis(700)).await;
            x = if x == 0.0 { 3.0 } else { 0.0 };
            head.set_busy(true);
            if let Err(e) = head.move_to(Location::new(x, 0.0, 0.0, 0.0), None) {
                warn!(error = %e, "jog failed");
            }
            camera.machine_head_activity();
            head.set_busy(false);
            camera.machine_busy(false);
        }
    });

    let duration = Duration::from_secs(config.simulator.preview_secs);
    tokio::select! {
        _ = tokio::time::sleep(duration) => info!("preview duration elapsed"),
        _ = tokio::signal::ctrl_c() => info!("interrupted"),
    }
    jog.abort();

    let camera = rig.camera.clone();
    tokio::task::spawn_blocking(move || camera.stop_continuous_capture(id)).await?;
    let frames = received.load(Ordering::Relaxed);
    info!(
        frames,
        fps = frames as f64 / duration.as_secs_f64().max(1e-3),
        "preview stopped"
    );
    Ok(())
}

fn run_replay(config: &Config) -> Result<(), SimError> {
    let dir = config
        .simulator
        .replay_dir
        .clone()
        .ok_or_else(|| SimError::Replay("simulator.replay_dir is not set".into()))?;
    let source = Arc::new(ReplaySource::open_dir(&dir)?);
    let frames = source.len();
    let camera = CameraBuilder::from_config(config)
        .source(source.clone() as Arc<dyn FrameSource>)
        .overlay_sink(Arc::new(log_overlay))
        .build()?;
    for cycle in 0..config.simulator.cycles {
        let result = camera.settle_and_capture()?;
        info!(
            cycle,
            frames_in_dir = frames,
            seq = result.frame.seq(),
            captured = result.frames_captured,
            score = result.score,
            timed_out = result.timed_out,
            "replay settled"
        );
    }
    Ok(())
}

async fn run(config: Config, mode: String) -> Result<(), SimError> {
    if mode == "replay" {
        return tokio::task::spawn_blocking(move || run_replay(&config)).await?;
    }
    let rig = build_rig(&config)?;
    match mode.as_str() {
        "settle" => tokio::task::spawn_blocking(move || run_settle(&config, &rig)).await?,
        "focus" => tokio::task::spawn_blocking(move || run_focus(&config, &rig)).await?,
        "parallax" => tokio::task::spawn_blocking(move || run_parallax(&config, &rig)).await?,
        "preview" => run_preview(&config, rig).await,
        other => Err(SimError::UnknownMode(other.to_string())),
    }
}

#[tokio::main]
async fn main() {
    let mut args = std::env::args().skip(1);
    let config_path = args
        .next()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = match Config::load(&config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config from {}: {e}", config_path.display());
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.parse().unwrap_or_default()),
        )
        .init();

    let mode = args.next().unwrap_or_else(|| config.simulator.mode.clone());
    info!(
        camera = config.camera.name,
        mode,
        settle_method = ?config.settle.method(),
        "starting frame-settle simulator"
    );

    if let Err(e) = run(config, mode).await {
        error!(error = %e, "simulator failed");
        std::process::exit(1);
    }
}
