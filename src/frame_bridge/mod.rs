//! Frame Distribution Bridge
//!
//! ## Responsibilities
//!
//! - Subscribe once to every camera's frame topic and the shared stats topic
//! - Keep a single-slot "latest frame" cache per camera (encode once, serve
//!   many; a freshly connecting viewer gets an immediate first paint)
//! - Fan frames out to registered viewer connections through a bounded
//!   drop-oldest queue, so a slow viewer can never stall the subscriber
//!
//! Runs inside the always-on server process. Exactly two tasks: the channel
//! subscriber (producer) and the queue-draining sender (consumer), connected
//! only by the bounded queue. The cache and viewer registry are mutated on
//! connect/disconnect, which is rare relative to frame throughput.

mod queue;

pub use queue::{FrameQueue, QueuedFrame};

use crate::control_plane::{
    topics, ControlPlane, StatsSnapshot, RECONNECT_DELAY, SUBSCRIBE_POLL_TIMEOUT,
};
use crate::stats_cache::StatsCache;
use futures::StreamExt;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Frame bytes shared across the cache and every viewer without copying
pub type FrameBytes = Arc<Vec<u8>>;

/// Aggregate counters for operational visibility
#[derive(Debug, Clone, Serialize)]
pub struct BridgeStats {
    pub frames_received: u64,
    pub frames_sent: u64,
    pub frames_dropped: u64,
    /// Cameras with at least one registered viewer
    pub active_cameras: usize,
    pub viewer_connections: usize,
}

/// Frame Distribution Bridge instance
pub struct FrameBridge {
    channel: Arc<ControlPlane>,
    stats_cache: Arc<StatsCache>,
    /// camera_id -> most recently received frame. Never an older one.
    latest_frame: RwLock<HashMap<String, FrameBytes>>,
    /// camera_id -> connection_id -> sender
    viewers: RwLock<HashMap<String, HashMap<Uuid, mpsc::UnboundedSender<FrameBytes>>>>,
    queue: FrameQueue,
    frames_received: AtomicU64,
    frames_sent: AtomicU64,
}

impl FrameBridge {
    pub fn new(channel: Arc<ControlPlane>, stats_cache: Arc<StatsCache>, queue_capacity: usize) -> Self {
        Self {
            channel,
            stats_cache,
            latest_frame: RwLock::new(HashMap::new()),
            viewers: RwLock::new(HashMap::new()),
            queue: FrameQueue::new(queue_capacity),
            frames_received: AtomicU64::new(0),
            frames_sent: AtomicU64::new(0),
        }
    }

    /// Register a viewer for a camera.
    ///
    /// If a frame is cached for the camera it is sent to the new connection
    /// immediately, before any live frame arrives (fast first paint).
    pub async fn register(&self, camera_id: &str) -> (Uuid, mpsc::UnboundedReceiver<FrameBytes>) {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();

        if let Some(cached) = self.latest_frame.read().await.get(camera_id) {
            let _ = tx.send(cached.clone());
        }

        self.viewers
            .write()
            .await
            .entry(camera_id.to_string())
            .or_default()
            .insert(id, tx);

        tracing::info!(camera_id = %camera_id, connection_id = %id, "Viewer connected");
        (id, rx)
    }

    /// Deregister a viewer. When the camera's viewer set becomes empty its
    /// cached frame is evicted, so a later first-time joiner waits for the
    /// next live frame instead of seeing stale data.
    pub async fn unregister(&self, camera_id: &str, id: &Uuid) {
        let emptied = {
            let mut viewers = self.viewers.write().await;
            match viewers.get_mut(camera_id) {
                Some(set) => {
                    set.remove(id);
                    if set.is_empty() {
                        viewers.remove(camera_id);
                        true
                    } else {
                        false
                    }
                }
                None => false,
            }
        };

        if emptied {
            self.latest_frame.write().await.remove(camera_id);
            tracing::debug!(camera_id = %camera_id, "Last viewer left, frame cache evicted");
        }

        tracing::info!(camera_id = %camera_id, connection_id = %id, "Viewer disconnected");
    }

    /// Handle one inbound frame. Public so the bridge is testable without a
    /// real channel; the subscriber task is a thin wrapper over this.
    ///
    /// The cache is updated unconditionally (even with zero viewers); the
    /// frame is enqueued for fan-out only when viewers exist.
    pub async fn handle_frame(&self, camera_id: &str, payload: Vec<u8>) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
        let payload: FrameBytes = Arc::new(payload);

        self.latest_frame
            .write()
            .await
            .insert(camera_id.to_string(), payload.clone());

        let has_viewers = self
            .viewers
            .read()
            .await
            .get(camera_id)
            .map(|set| !set.is_empty())
            .unwrap_or(false);

        if has_viewers {
            self.queue.push(QueuedFrame {
                camera_id: camera_id.to_string(),
                payload,
            });
        }
    }

    /// Fan one dequeued frame out to every registered connection for its
    /// camera. A failed send marks that connection for removal without
    /// aborting delivery to the others.
    pub async fn deliver(&self, frame: QueuedFrame) {
        let mut dead: Vec<Uuid> = Vec::new();

        {
            let viewers = self.viewers.read().await;
            let Some(set) = viewers.get(&frame.camera_id) else {
                return;
            };
            for (id, tx) in set {
                if tx.send(frame.payload.clone()).is_err() {
                    dead.push(*id);
                } else {
                    self.frames_sent.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        for id in dead {
            tracing::debug!(
                camera_id = %frame.camera_id,
                connection_id = %id,
                "Viewer send failed, removing connection"
            );
            self.unregister(&frame.camera_id, &id).await;
        }
    }

    /// Latest cached frame for a camera, if any
    pub async fn cached_frame(&self, camera_id: &str) -> Option<FrameBytes> {
        self.latest_frame.read().await.get(camera_id).cloned()
    }

    pub async fn stats(&self) -> BridgeStats {
        let viewers = self.viewers.read().await;
        BridgeStats {
            frames_received: self.frames_received.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_dropped: self.queue.dropped_count(),
            active_cameras: viewers.len(),
            viewer_connections: viewers.values().map(HashMap::len).sum(),
        }
    }

    /// Current send-queue depth (operational visibility, tests)
    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Start the two bridge tasks: channel subscriber and queue sender.
    /// Both stop when the token is cancelled.
    pub fn run(self: &Arc<Self>, token: CancellationToken) {
        let subscriber = self.clone();
        let sub_token = token.clone();
        tokio::spawn(async move { subscriber.subscriber_loop(sub_token).await });

        let sender = self.clone();
        tokio::spawn(async move { sender.sender_loop(token).await });
    }

    /// Subscribes once to the frame pattern and the stats topic; reconnects
    /// with a fixed backoff when the channel fails.
    async fn subscriber_loop(self: Arc<Self>, token: CancellationToken) {
        loop {
            if token.is_cancelled() {
                return;
            }

            let mut pubsub = match self.channel.psubscribe(topics::FRAME_PATTERN).await {
                Ok(mut p) => match p.subscribe(topics::STATS).await {
                    Ok(()) => {
                        tracing::info!(
                            pattern = topics::FRAME_PATTERN,
                            "Bridge subscribed to frame and stats topics"
                        );
                        p
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Stats subscription failed, retrying");
                        tokio::select! {
                            _ = token.cancelled() => return,
                            _ = tokio::time::sleep(RECONNECT_DELAY) => continue,
                        }
                    }
                },
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        retry_in_secs = RECONNECT_DELAY.as_secs(),
                        "Frame channel unavailable, retrying"
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
                                Err(_) => continue,
                                Ok(None) => break,
                                Ok(Some(m)) => {
                                    let channel = m.get_channel_name().to_string();
                                    let payload = m.get_payload_bytes().to_vec();
                                    self.handle_message(&channel, payload).await;
                                }
                            }
                        }
                    }
                }
            }

            tracing::warn!(
                retry_in_secs = RECONNECT_DELAY.as_secs(),
                "Frame subscription lost, reconnecting"
            );
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(RECONNECT_DELAY) => {}
            }
        }
    }

    async fn handle_message(&self, channel: &str, payload: Vec<u8>) {
        if channel == topics::STATS {
            match serde_json::from_slice::<StatsSnapshot>(&payload) {
                Ok(snapshot) => self.stats_cache.update(snapshot).await,
                Err(e) => tracing::warn!(error = %e, "Skipping malformed stats snapshot"),
            }
            return;
        }

        match topics::camera_from_frame_topic(channel) {
            Some(camera_id) => {
                let camera_id = camera_id.to_string();
                self.handle_frame(&camera_id, payload).await;
            }
            None => tracing::trace!(channel = %channel, "Ignoring message on unknown topic"),
        }
    }

    /// Drains the queue FIFO and fans frames out
    async fn sender_loop(self: Arc<Self>, token: CancellationToken) {
        loop {
            let frame = tokio::select! {
                _ = token.cancelled() => return,
                frame = self.queue.pop() => frame,
            };
            self.deliver(frame).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bridge(capacity: usize) -> Arc<FrameBridge> {
        let channel = Arc::new(ControlPlane::new("redis://127.0.0.1/").unwrap());
        let stats_cache = Arc::new(StatsCache::new());
        Arc::new(FrameBridge::new(channel, stats_cache, capacity))
    }

    #[tokio::test]
    async fn test_cache_updated_without_viewers_queue_stays_empty() {
        let bridge = bridge(16);
        for i in 0..10u8 {
            bridge.handle_frame("cam1", vec![i]).await;
        }
        // Cache follows every publish, but nothing is enqueued with zero
        // viewers
        assert_eq!(bridge.cached_frame("cam1").await.unwrap()[0], 9);
        assert_eq!(bridge.queue_len(), 0);
        assert_eq!(bridge.stats().await.frames_received, 10);
    }

    #[tokio::test]
    async fn test_cache_holds_most_recent_frame_only() {
        let bridge = bridge(16);
        bridge.handle_frame("cam1", vec![1]).await;
        bridge.handle_frame("cam1", vec![2]).await;
        bridge.handle_frame("cam1", vec![3]).await;
        assert_eq!(bridge.cached_frame("cam1").await.unwrap()[0], 3);
    }

    #[tokio::test]
    async fn test_late_joiner_gets_cached_frame_immediately() {
        let bridge = bridge(16);
        bridge.handle_frame("cam1", vec![10]).await;

        let (_id, mut rx) = bridge.register("cam1").await;
        // Delivered before any live frame arrives
        let first = rx.try_recv().unwrap();
        assert_eq!(first[0], 10);
    }

    #[tokio::test]
    async fn test_eviction_on_last_disconnect() {
        let bridge = bridge(16);
        bridge.handle_frame("cam1", vec![7]).await;

        let (id, _rx) = bridge.register("cam1").await;
        bridge.unregister("cam1", &id).await;

        // No stale first paint for the next joiner
        assert!(bridge.cached_frame("cam1").await.is_none());
        let (_id2, mut rx2) = bridge.register("cam1").await;
        assert!(rx2.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_eviction_waits_for_last_viewer() {
        let bridge = bridge(16);
        bridge.handle_frame("cam1", vec![7]).await;

        let (id1, _rx1) = bridge.register("cam1").await;
        let (id2, _rx2) = bridge.register("cam1").await;
        bridge.unregister("cam1", &id1).await;
        assert!(bridge.cached_frame("cam1").await.is_some());
        bridge.unregister("cam1", &id2).await;
        assert!(bridge.cached_frame("cam1").await.is_none());
    }

    #[tokio::test]
    async fn test_frames_enqueued_only_with_viewers() {
        let bridge = bridge(16);
        let (_id, _rx) = bridge.register("cam1").await;
        bridge.handle_frame("cam1", vec![1]).await;
        bridge.handle_frame("cam2", vec![2]).await;
        // cam1 has a viewer, cam2 does not
        assert_eq!(bridge.queue_len(), 1);
    }

    #[tokio::test]
    async fn test_deliver_fans_out_and_tolerates_dead_connection() {
        let bridge = bridge(16);
        let (_id1, mut rx1) = bridge.register("cam1").await;
        let (_id2, rx2) = bridge.register("cam1").await;
        drop(rx2); // dead viewer

        bridge
            .deliver(QueuedFrame {
                camera_id: "cam1".to_string(),
                payload: Arc::new(vec![42]),
            })
            .await;

        // Healthy viewer still served
        assert_eq!(rx1.try_recv().unwrap()[0], 42);
        // Dead connection removed from the registry
        let stats = bridge.stats().await;
        assert_eq!(stats.viewer_connections, 1);
        assert_eq!(stats.frames_sent, 1);
    }

    #[tokio::test]
    async fn test_stats_snapshot_routed_to_cache() {
        let channel = Arc::new(ControlPlane::new("redis://127.0.0.1/").unwrap());
        let stats_cache = Arc::new(StatsCache::new());
        let bridge = Arc::new(FrameBridge::new(channel, stats_cache.clone(), 16));

        let snapshot = StatsSnapshot {
            camera_id: "cam1".to_string(),
            total_frames: 100,
            processed_frames: 30,
            class_counts: Default::default(),
            avg_fps: 9.5,
            avg_processing_time_ms: 40.0,
            sampled_at: chrono::Utc::now(),
        };
        bridge
            .handle_message(topics::STATS, serde_json::to_vec(&snapshot).unwrap())
            .await;

        assert_eq!(
            stats_cache.get("cam1").await.unwrap().snapshot.total_frames,
            100
        );
    }

    #[tokio::test]
    async fn test_frame_message_routed_by_topic() {
        let bridge = bridge(16);
        bridge.handle_message("video:cam9", vec![5]).await;
        assert_eq!(bridge.cached_frame("cam9").await.unwrap()[0], 5);
    }
}
