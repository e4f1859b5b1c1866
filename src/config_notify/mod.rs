//! Config Change Notifier/Listener
//!
//! ## Responsibilities
//!
//! - Publish typed config deltas to the scoped topic (camera or global) and
//!   mirror every delta on the umbrella topic for observability
//! - Run a persistent subscribe loop that dispatches received deltas to a
//!   registered callback, reconnecting with a fixed backoff on failure
//!
//! Configuration sync is an optimization, not a correctness requirement:
//! every consumer re-derives its baseline config on startup, so publish is
//! best-effort and malformed payloads are skipped, never fatal.

use crate::control_plane::{topics, ConfigDelta, ControlPlane, RECONNECT_DELAY, SUBSCRIBE_POLL_TIMEOUT};
use crate::error::Result;
use futures::StreamExt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Callback invoked for each received delta
pub type DeltaCallback = Arc<dyn Fn(ConfigDelta) + Send + Sync>;

/// Publishes typed config deltas. Used by the API process (writer side).
pub struct ConfigNotifier {
    channel: Arc<ControlPlane>,
}

impl ConfigNotifier {
    pub fn new(channel: Arc<ControlPlane>) -> Self {
        Self { channel }
    }

    /// Publish a delta to its scoped topic and the umbrella topic.
    ///
    /// Best-effort: failures are logged and swallowed.
    pub async fn publish(&self, delta: &ConfigDelta) {
        let payload = match serde_json::to_vec(delta) {
            Ok(p) => p,
            Err(e) => {
                tracing::error!(error = %e, "Failed to serialize config delta");
                return;
            }
        };

        let scoped_topic = match &delta.camera_id {
            Some(id) => topics::config_camera(id),
            None => topics::CONFIG_GLOBAL.to_string(),
        };

        for topic in [scoped_topic.as_str(), topics::CONFIG_CHANGE] {
            if let Err(e) = self.channel.publish(topic, &payload).await {
                tracing::warn!(
                    topic = %topic,
                    domain = %delta.domain.as_str(),
                    key = %delta.key,
                    error = %e,
                    "Config delta publish failed (consumers re-derive on startup)"
                );
            }
        }

        tracing::debug!(
            camera_id = ?delta.camera_id,
            domain = %delta.domain.as_str(),
            key = %delta.key,
            change_kind = ?delta.change_kind,
            "Config delta published"
        );
    }
}

/// Subscribes to config topics and invokes a callback per delta.
/// Used by detection workers (reader side).
pub struct ConfigListener {
    channel: Arc<ControlPlane>,
    /// When set, only deltas applying to this camera are dispatched
    camera_id: Option<String>,
    callback: DeltaCallback,
}

impl ConfigListener {
    pub fn new(channel: Arc<ControlPlane>, camera_id: Option<String>, callback: DeltaCallback) -> Self {
        Self {
            channel,
            camera_id,
            callback,
        }
    }

    /// Topics this listener subscribes to: always the global topic, plus the
    /// camera-scoped topic when a camera id is configured.
    fn subscription_topics(&self) -> Vec<String> {
        let mut channels = vec![topics::CONFIG_GLOBAL.to_string()];
        if let Some(id) = &self.camera_id {
            channels.push(topics::config_camera(id));
        }
        channels
    }

    /// Persistent subscribe loop. Returns when the token is cancelled.
    /// Channel failures trigger a reconnect after a fixed delay.
    pub async fn run(&self, token: CancellationToken) {
        let channels = self.subscription_topics();

        loop {
            if token.is_cancelled() {
                return;
            }

            let channel_refs: Vec<&str> = channels.iter().map(String::as_str).collect();
            let mut pubsub = match self.channel.subscribe(&channel_refs).await {
                Ok(p) => {
                    tracing::info!(channels = ?channels, "Config listener subscribed");
                    p
                }
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        retry_in_secs = RECONNECT_DELAY.as_secs(),
                        "Config channel unavailable, retrying"
                    );
                    tokio::select! {
                        _ = token.cancelled() => return,
                        _ = tokio::time::sleep(RECONNECT_DELAY) => continue,
                    }
                }
            };

            {
                let mut stream = pubsub.on_message();
                loop {
                    tokio::select! {
                        _ = token.cancelled() => return,
                        msg = tokio::time::timeout(SUBSCRIBE_POLL_TIMEOUT, stream.next()) => {
                            match msg {
                                // Poll timeout: re-check cancellation
                                Err(_) => continue,
                                // Stream closed: reconnect
                                Ok(None) => break,
                                Ok(Some(m)) => self.dispatch(m.get_payload_bytes()),
                            }
                        }
                    }
                }
            }

            tracing::warn!(
                retry_in_secs = RECONNECT_DELAY.as_secs(),
                "Config subscription lost, reconnecting"
            );
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(RECONNECT_DELAY) => {}
            }
        }
    }

    /// Decode one payload and dispatch it. Malformed payloads are logged and
    /// skipped; deltas scoped to another camera are ignored.
    pub fn dispatch(&self, payload: &[u8]) {
        let delta: ConfigDelta = match serde_json::from_slice(payload) {
            Ok(d) => d,
            Err(e) => {
                tracing::warn!(error = %e, "Skipping malformed config delta");
                return;
            }
        };

        if let Some(id) = &self.camera_id {
            if !delta.applies_to(id) {
                tracing::trace!(
                    camera_id = %id,
                    delta_camera = ?delta.camera_id,
                    "Ignoring delta scoped to another camera"
                );
                return;
            }
        }

        tracing::debug!(
            camera_id = ?delta.camera_id,
            domain = %delta.domain.as_str(),
            key = %delta.key,
            "Dispatching config delta"
        );
        (self.callback)(delta);
    }

    /// Spawn the listener loop as a background task
    pub fn spawn(self: Arc<Self>, token: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move { self.run(token).await })
    }
}

/// Convenience: build and spawn a listener in one call
pub fn spawn_listener(
    channel: Arc<ControlPlane>,
    camera_id: Option<String>,
    callback: DeltaCallback,
    token: CancellationToken,
) -> Result<tokio::task::JoinHandle<()>> {
    let listener = Arc::new(ConfigListener::new(channel, camera_id, callback));
    Ok(listener.spawn(token))
}
