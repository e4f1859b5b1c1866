//! Application state
//!
//! Holds all shared components and state

use crate::config_notify::ConfigNotifier;
use crate::control_plane::ControlPlane;
use crate::frame_bridge::FrameBridge;
use crate::stats_cache::StatsCache;
use crate::supervisor::{ProcessSupervisor, WorkerDirectory};
use std::path::PathBuf;
use std::sync::Arc;

/// Application configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Server host
    pub host: String,
    /// Server port
    pub port: u16,
    /// Control channel (redis) URL
    pub channel_url: String,
    /// PID record directory
    pub pid_dir: PathBuf,
    /// Worker log directory
    pub log_dir: PathBuf,
    /// Worker executable (defaults to camwatch-worker next to the server)
    pub worker_program: PathBuf,
    /// Bridge send-queue capacity
    pub queue_capacity: usize,
    /// Inference server URL forwarded to workers
    pub detector_url: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: std::env::var("PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(8080),
            channel_url: std::env::var("CAMWATCH_CHANNEL_URL")
                .unwrap_or_else(|_| "redis://127.0.0.1:6379/".to_string()),
            pid_dir: std::env::var("CAMWATCH_PID_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("/var/run/camwatch")),
            log_dir: std::env::var("CAMWATCH_LOG_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("/var/log/camwatch")),
            worker_program: std::env::var("CAMWATCH_WORKER_BIN")
                .map(PathBuf::from)
                .unwrap_or_else(|_| default_worker_program()),
            queue_capacity: std::env::var("CAMWATCH_QUEUE_CAPACITY")
                .ok()
                .and_then(|c| c.parse().ok())
                .unwrap_or(64),
            detector_url: std::env::var("CAMWATCH_DETECTOR_URL").ok(),
        }
    }
}

/// The worker binary ships alongside the server binary
fn default_worker_program() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(|d| d.join("camwatch-worker")))
        .unwrap_or_else(|| PathBuf::from("camwatch-worker"))
}

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    /// Application config
    pub config: AppConfig,
    /// Control channel client
    pub channel: Arc<ControlPlane>,
    /// Frame Distribution Bridge
    pub bridge: Arc<FrameBridge>,
    /// Per-camera stats snapshots
    pub stats_cache: Arc<StatsCache>,
    /// Worker process supervisor
    pub supervisor: Arc<ProcessSupervisor>,
    /// Config delta publisher
    pub notifier: Arc<ConfigNotifier>,
    /// Camera directory
    pub directory: Arc<dyn WorkerDirectory>,
}
