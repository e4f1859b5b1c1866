//! camwatch worker
//!
//! One process per camera: capture, detect, publish. Spawned and reaped by
//! the server's supervisor; all wiring arrives through `CAMWATCH_*`
//! environment variables. The exit code reports the terminal state so the
//! supervisor can tell a cooperative stop from a fault.

use arc_swap::ArcSwap;
use camwatch::{
    capture::VideoSource,
    config_notify,
    control_plane::{BlockingPublisher, ControlPlane},
    detection_loop::{DetectionLoop, LoopConfig, LoopExit},
    detector::{Detector, DetectorParams, HttpDetector, NullDetector},
};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Exit codes reported to the supervisor
const EXIT_CRASHED: i32 = 1;
const EXIT_SOURCE_EXHAUSTED: i32 = 2;

/// Worker wiring from environment
#[derive(Debug, Clone)]
struct WorkerConfig {
    camera_id: String,
    source: String,
    channel_url: String,
    detector_url: Option<String>,
    process_every: Option<u32>,
    width: u32,
    height: u32,
    stats_interval: Duration,
}

impl WorkerConfig {
    fn from_env() -> anyhow::Result<Self> {
        let camera_id = std::env::var("CAMWATCH_CAMERA_ID")
            .map_err(|_| anyhow::anyhow!("CAMWATCH_CAMERA_ID is required"))?;
        let source = std::env::var("CAMWATCH_SOURCE")
            .or_else(|_| std::env::var("CAMWATCH_DEVICE"))
            .map_err(|_| anyhow::anyhow!("CAMWATCH_SOURCE is required"))?;
        Ok(Self {
            camera_id,
            source,
            channel_url: std::env::var("CAMWATCH_CHANNEL_URL")
                .unwrap_or_else(|_| "redis://127.0.0.1:6379/".to_string()),
            detector_url: std::env::var("CAMWATCH_DETECTOR_URL").ok(),
            process_every: std::env::var("CAMWATCH_PROCESS_EVERY")
                .ok()
                .and_then(|n| n.parse().ok()),
            width: std::env::var("CAMWATCH_FRAME_WIDTH")
                .ok()
                .and_then(|n| n.parse().ok())
                .unwrap_or(640),
            height: std::env::var("CAMWATCH_FRAME_HEIGHT")
                .ok()
                .and_then(|n| n.parse().ok())
                .unwrap_or(480),
            stats_interval: std::env::var("CAMWATCH_STATS_INTERVAL_SECS")
                .ok()
                .and_then(|n| n.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(Duration::from_secs(5)),
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "camwatch=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = WorkerConfig::from_env()?;
    tracing::info!(
        camera_id = %config.camera_id,
        source = %config.source,
        channel_url = %config.channel_url,
        "Starting camwatch worker v{}",
        env!("CARGO_PKG_VERSION")
    );

    // Fail fast: an unusable source is a crash, not a retry loop
    let source = VideoSource::open(&config.source, config.width, config.height)?;
    let release_handle = source.release_handle();
    let source = Arc::new(Mutex::new(source));

    // Initial parameters, then hot reloads through the listener
    let mut initial = DetectorParams::default();
    if let Some(every) = config.process_every {
        initial.process_every = every.max(1);
    }
    let params = Arc::new(ArcSwap::from_pointee(initial));

    let detector: Box<dyn Detector> = match &config.detector_url {
        Some(url) => Box::new(HttpDetector::new(url.clone(), config.camera_id.clone())?),
        None => {
            tracing::warn!("No detector endpoint configured, frames pass through undetected");
            Box::new(NullDetector)
        }
    };

    let token = CancellationToken::new();

    // Config listener: swap parameters wholesale on each matching delta
    let channel = Arc::new(ControlPlane::new(&config.channel_url)?);
    let listener_params = params.clone();
    config_notify::spawn_listener(
        channel,
        Some(config.camera_id.clone()),
        Arc::new(move |delta| {
            let next = listener_params.load().apply_delta(&delta);
            listener_params.store(Arc::new(next));
            tracing::info!(
                domain = %delta.domain.as_str(),
                key = %delta.key,
                "Detector parameters reloaded"
            );
        }),
        token.clone(),
    )?;

    // Signal path: cancel the loop and kill the decode child through the
    // lock-free handle. The loop may be mid-read holding the source lock;
    // killing the child ends that read, so a blocking read cannot outlive
    // the grace period.
    let signal_token = token.clone();
    tokio::spawn(async move {
        let mut sigterm =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(s) => s,
                Err(e) => {
                    tracing::error!(error = %e, "SIGTERM handler install failed");
                    return;
                }
            };
        tokio::select! {
            _ = sigterm.recv() => tracing::info!("SIGTERM received"),
            r = tokio::signal::ctrl_c() => {
                if let Err(e) = r {
                    tracing::error!(error = %e, "Ctrl-C handler failed");
                }
                tracing::info!("Interrupt received");
            }
        }
        signal_token.cancel();
        release_handle.release();
    });

    let publisher = BlockingPublisher::new(&config.channel_url)?;
    let mut loop_config = LoopConfig::new(config.camera_id.clone());
    loop_config.stats_interval = config.stats_interval;

    let mut detection_loop = DetectionLoop::new(
        loop_config,
        source,
        detector,
        params,
        publisher,
        token.clone(),
    );

    // The loop is synchronous; run it on a blocking thread
    let exit = tokio::task::spawn_blocking(move || detection_loop.run()).await?;
    token.cancel();

    match exit {
        LoopExit::Signal => {
            tracing::info!(camera_id = %config.camera_id, "Worker stopped on signal");
            Ok(())
        }
        LoopExit::SourceExhausted => {
            tracing::warn!(camera_id = %config.camera_id, "Worker stopped, source exhausted");
            std::process::exit(EXIT_SOURCE_EXHAUSTED);
        }
        LoopExit::Crashed(e) => {
            tracing::error!(camera_id = %config.camera_id, error = %e, "Worker crashed");
            std::process::exit(EXIT_CRASHED);
        }
    }
}
