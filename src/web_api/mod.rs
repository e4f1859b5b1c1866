//! Web API - HTTP/WebSocket surface
//!
//! ## Responsibilities
//!
//! - Viewer WebSocket endpoint bridging registered connections to the
//!   Frame Distribution Bridge
//! - Supervisor operations (start/stop/restart/status) per camera
//! - Stats and bridge counters for dashboards
//! - Config delta ingestion (publishes to the control channel)

mod routes;
mod ws;

pub use routes::create_router;
