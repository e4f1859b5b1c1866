//! camwatch - Camera Detection-Worker Fabric
//!
//! ## Architecture (8 Components)
//!
//! 1. ControlPlane - pub/sub channel for frames, stats and config deltas
//! 2. ConfigNotify - config delta publishing and scoped listening
//! 3. Capture - camera/file/stream frame acquisition
//! 4. Detector - external detection collaborator seam
//! 5. DetectionLoop - per-camera capture/detect/publish cycle
//! 6. FrameBridge - viewer fan-out with latest-frame cache
//! 7. Supervisor - worker OS-process lifecycle
//! 8. WebAPI - REST/WebSocket surface
//!
//! ## Design Principles
//!
//! - One worker process per camera; process multiplicity is the
//!   concurrency model
//! - The channel is the only coupling between server and workers
//! - Bounded queues everywhere a slow consumer could stall a producer

pub mod capture;
pub mod config_notify;
pub mod control_plane;
pub mod detection_loop;
pub mod detector;
pub mod error;
pub mod frame_bridge;
pub mod state;
pub mod stats_cache;
pub mod supervisor;
pub mod web_api;

pub use error::{Error, Result};
pub use state::AppState;
