//! camwatch server
//!
//! Always-on process: Frame Distribution Bridge, stats cache, worker
//! supervisor and the web surface.

use camwatch::{
    config_notify::ConfigNotifier,
    control_plane::ControlPlane,
    frame_bridge::FrameBridge,
    state::{AppConfig, AppState},
    stats_cache::StatsCache,
    supervisor::{InMemoryDirectory, ProcessSupervisor, SupervisorConfig, WorkerDirectory, WorkerSpec},
    web_api,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "camwatch=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting camwatch server v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = AppConfig::default();
    tracing::info!(
        host = %config.host,
        port = config.port,
        channel_url = %config.channel_url,
        pid_dir = %config.pid_dir.display(),
        log_dir = %config.log_dir.display(),
        queue_capacity = config.queue_capacity,
        "Configuration loaded"
    );

    // Control channel
    let channel = Arc::new(ControlPlane::new(&config.channel_url)?);

    // Camera directory, seeded from CAMWATCH_CAMERAS ("cam1=0,cam2=rtsp://...")
    let directory = Arc::new(InMemoryDirectory::new());
    if let Ok(raw) = std::env::var("CAMWATCH_CAMERAS") {
        for entry in raw.split(',').filter(|s| !s.trim().is_empty()) {
            match entry.split_once('=') {
                Some((camera_id, source)) => {
                    directory.insert(WorkerSpec {
                        camera_id: camera_id.trim().to_string(),
                        source: source.trim().to_string(),
                        profile: None,
                        device: None,
                        process_every: None,
                        active: true,
                    });
                }
                None => tracing::warn!(entry = %entry, "Skipping malformed camera entry"),
            }
        }
    }
    tracing::info!(cameras = directory.all().len(), "Camera directory loaded");

    // Components
    let stats_cache = Arc::new(StatsCache::new());
    let bridge = Arc::new(FrameBridge::new(
        channel.clone(),
        stats_cache.clone(),
        config.queue_capacity,
    ));
    let mut sup_config = SupervisorConfig::new(
        config.pid_dir.clone(),
        config.log_dir.clone(),
        config.worker_program.clone(),
        config.channel_url.clone(),
    );
    sup_config.detector_url = config.detector_url.clone();
    let supervisor = Arc::new(ProcessSupervisor::new(sup_config, directory.clone()));
    let notifier = Arc::new(ConfigNotifier::new(channel.clone()));

    // Bridge tasks run until shutdown cancels the token
    let token = CancellationToken::new();
    bridge.run(token.clone());

    let state = AppState {
        config: config.clone(),
        channel,
        bridge,
        stats_cache,
        supervisor,
        notifier,
        directory,
    };
    let app = web_api::create_router(state);

    // Start server
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);

    let shutdown_token = token.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Shutdown signal listener failed");
            }
            tracing::info!("Shutdown signal received");
            shutdown_token.cancel();
        })
        .await?;

    token.cancel();
    tracing::info!("camwatch server stopped");
    Ok(())
}
