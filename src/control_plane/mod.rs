//! Control-Plane Channel - Pub/Sub Bus Client
//!
//! ## Responsibilities
//!
//! - Typed publish/subscribe over the shared Redis channel family
//! - Topic naming (fixed for interoperability with other processes)
//! - Async publisher for server-side components, blocking publisher for the
//!   synchronous detection loop
//!
//! No component owns the bus; every component holds its own client handle.

mod types;

pub use types::{ChangeKind, ConfigDelta, ConfigDomain, StatsSnapshot};

use crate::error::{Error, Result};
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use std::time::Duration;
use tokio::sync::Mutex;

/// Topic names. Exact strings are part of the external interface; other
/// processes (and the deployed front-end) address the same channels.
pub mod topics {
    /// Frame topic for one camera
    pub fn frame(camera_id: &str) -> String {
        format!("video:{camera_id}")
    }

    /// Pattern matching every camera's frame topic
    pub const FRAME_PATTERN: &str = "video:*";

    /// Single shared stats topic; payloads are tagged with `camera_id`
    pub const STATS: &str = "stats";

    /// Umbrella config topic mirroring every delta (observability)
    pub const CONFIG_CHANGE: &str = "config:change";

    /// Global config topic (deltas for all cameras)
    pub const CONFIG_GLOBAL: &str = "config:change:global";

    /// Camera-scoped config topic
    pub fn config_camera(camera_id: &str) -> String {
        format!("config:change:camera:{camera_id}")
    }

    /// Extract the camera id from a frame topic name
    pub fn camera_from_frame_topic(topic: &str) -> Option<&str> {
        topic.strip_prefix("video:")
    }
}

/// How long subscriber loops wait on the channel before re-checking their
/// cancellation token. Keeps every subscription cancellable.
pub const SUBSCRIBE_POLL_TIMEOUT: Duration = Duration::from_secs(1);

/// Fixed backoff applied before reconnecting a failed subscription
pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Async control-plane client. Cheap to clone the underlying connection;
/// publish failures surface as `Error::Channel` and the cached connection is
/// discarded so the next publish reconnects.
pub struct ControlPlane {
    client: redis::Client,
    conn: Mutex<Option<MultiplexedConnection>>,
}

impl ControlPlane {
    /// Create a client for the given channel URL. Does not connect yet;
    /// connections are established lazily on first use.
    pub fn new(channel_url: &str) -> Result<Self> {
        let client = redis::Client::open(channel_url)?;
        Ok(Self {
            client,
            conn: Mutex::new(None),
        })
    }

    async fn connection(&self) -> Result<MultiplexedConnection> {
        let mut guard = self.conn.lock().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }
        let conn = self.client.get_multiplexed_async_connection().await?;
        *guard = Some(conn.clone());
        Ok(conn)
    }

    async fn invalidate(&self) {
        let mut guard = self.conn.lock().await;
        *guard = None;
    }

    /// Publish raw bytes on a topic
    pub async fn publish(&self, topic: &str, payload: &[u8]) -> Result<()> {
        let mut conn = self.connection().await?;
        match conn.publish::<_, _, i64>(topic, payload).await {
            Ok(_) => Ok(()),
            Err(e) => {
                self.invalidate().await;
                Err(Error::Channel(e))
            }
        }
    }

    /// Publish one frame on the camera's frame topic
    pub async fn publish_frame(&self, camera_id: &str, payload: &[u8]) -> Result<()> {
        self.publish(&topics::frame(camera_id), payload).await
    }

    /// Publish a stats snapshot on the shared stats topic
    pub async fn publish_stats(&self, snapshot: &StatsSnapshot) -> Result<()> {
        let payload = serde_json::to_vec(snapshot)?;
        self.publish(topics::STATS, &payload).await
    }

    /// Open a subscription for the given channels
    pub async fn subscribe(&self, channels: &[&str]) -> Result<redis::aio::PubSub> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        for channel in channels {
            pubsub.subscribe(*channel).await?;
        }
        Ok(pubsub)
    }

    /// Open a pattern subscription (e.g. all frame topics)
    pub async fn psubscribe(&self, pattern: &str) -> Result<redis::aio::PubSub> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.psubscribe(pattern).await?;
        Ok(pubsub)
    }
}

/// Blocking publisher for the synchronous capture/detect/publish loop.
///
/// Reconnects lazily: a failed publish drops the connection and the next
/// call re-establishes it, so a channel outage never stalls the loop beyond
/// one connection attempt per frame.
pub struct BlockingPublisher {
    client: redis::Client,
    conn: Option<redis::Connection>,
}

impl BlockingPublisher {
    pub fn new(channel_url: &str) -> Result<Self> {
        let client = redis::Client::open(channel_url)?;
        Ok(Self { client, conn: None })
    }

    /// Publish raw bytes on a topic
    pub fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<()> {
        use redis::Commands;

        if self.conn.is_none() {
            self.conn = Some(
                self.client
                    .get_connection_with_timeout(Duration::from_secs(2))?,
            );
        }

        // Connection is Some here by construction
        let conn = self.conn.as_mut().ok_or_else(|| {
            Error::Internal("blocking publisher connection missing".to_string())
        })?;

        match conn.publish::<_, _, i64>(topic, payload) {
            Ok(_) => Ok(()),
            Err(e) => {
                self.conn = None;
                Err(Error::Channel(e))
            }
        }
    }

    /// Publish one frame on the camera's frame topic
    pub fn publish_frame(&mut self, camera_id: &str, payload: &[u8]) -> Result<()> {
        self.publish(&topics::frame(camera_id), payload)
    }

    /// Publish a stats snapshot on the shared stats topic
    pub fn publish_stats(&mut self, snapshot: &StatsSnapshot) -> Result<()> {
        let payload = serde_json::to_vec(snapshot)?;
        self.publish(topics::STATS, &payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_names() {
        assert_eq!(topics::frame("cam1"), "video:cam1");
        assert_eq!(topics::config_camera("cam1"), "config:change:camera:cam1");
        assert_eq!(topics::STATS, "stats");
        assert_eq!(topics::CONFIG_GLOBAL, "config:change:global");
    }

    #[test]
    fn test_camera_from_frame_topic() {
        assert_eq!(topics::camera_from_frame_topic("video:cam7"), Some("cam7"));
        assert_eq!(topics::camera_from_frame_topic("stats"), None);
    }
}
