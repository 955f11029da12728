use anyhow::{Context, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

mod config;
mod engine;
mod gallery;
mod recorder;
mod replay;

use config::Config;
use engine::EngineParts;
use gallery::GalleryResolver;
use recorder::Recorder;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("livegated starting");

    let config = Config::from_env().context("failed to load configuration")?;
    let (source, detector, landmarks) = replay::open(&config.frames_dir)
        .with_context(|| format!("failed to open frames in {}", config.frames_dir.display()))?;
    let resolver = GalleryResolver::load(
        &config.gallery_path,
        config.match_tolerance,
        config.min_match_accuracy,
    )
    .context("failed to load gallery")?;
    tracing::info!(
        subjects = resolver.subject_count(),
        require_liveness = config.liveness.require_liveness,
        log = %config.attendance_log.display(),
        "configuration loaded"
    );

    let cancel = Arc::new(AtomicBool::new(false));
    let (tx, rx) = mpsc::unbounded_channel();
    let engine = engine::spawn_engine(
        EngineParts {
            source: Box::new(source),
            detector: Box::new(detector),
            landmarks: Box::new(landmarks),
            resolver: Box::new(resolver),
            config: config.liveness,
            seed: config.seed,
            frame_interval: config.frame_interval,
        },
        Arc::clone(&cancel),
        tx,
    )
    .context("failed to spawn engine thread")?;

    let recorder = Recorder::new(config.attendance_log, config.notify_command);
    let mut recorder = tokio::spawn(recorder.run(rx));

    tracing::info!("livegated ready");

    // The recorder finishes once the engine drops its sender.
    let recorded = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal?;
            tracing::info!("livegated shutting down");
            cancel.store(true, Ordering::Relaxed);
            recorder.await?
        }
        recorded = &mut recorder => recorded?,
    };

    let summary = tokio::task::spawn_blocking(move || engine.join())
        .await?
        .map_err(|_| anyhow::anyhow!("engine thread panicked"))?;
    tracing::info!(
        frames = summary.frames,
        confirmations = summary.confirmations,
        recorded,
        "livegated stopped"
    );

    Ok(())
}
