//! Stats Cache - Read-Side Snapshot Store
//!
//! Holds the most recent `StatsSnapshot` per camera. Overwrite-only: a new
//! snapshot replaces the previous one and no history is retained in this
//! subsystem. Fed by the bridge's channel subscriber, queried by the web
//! surface.

use crate::control_plane::StatsSnapshot;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// A cached snapshot with its arrival time, so the read side can expose
/// staleness (a worker that stopped publishing shows an old `received_at`).
#[derive(Debug, Clone, Serialize)]
pub struct CachedStats {
    #[serde(flatten)]
    pub snapshot: StatsSnapshot,
    pub received_at: DateTime<Utc>,
}

#[derive(Default)]
pub struct StatsCache {
    entries: RwLock<HashMap<String, CachedStats>>,
}

impl StatsCache {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Store a snapshot, overwriting any prior one for the camera
    pub async fn update(&self, snapshot: StatsSnapshot) {
        let camera_id = snapshot.camera_id.clone();
        let cached = CachedStats {
            snapshot,
            received_at: Utc::now(),
        };
        self.entries.write().await.insert(camera_id, cached);
    }

    pub async fn get(&self, camera_id: &str) -> Option<CachedStats> {
        self.entries.read().await.get(camera_id).cloned()
    }

    pub async fn all(&self) -> Vec<CachedStats> {
        let mut all: Vec<_> = self.entries.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.snapshot.camera_id.cmp(&b.snapshot.camera_id));
        all
    }

    /// Drop a camera's snapshot (camera removed or worker retired)
    pub async fn remove(&self, camera_id: &str) {
        self.entries.write().await.remove(camera_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(camera_id: &str, total: u64) -> StatsSnapshot {
        StatsSnapshot {
            camera_id: camera_id.to_string(),
            total_frames: total,
            processed_frames: total / 2,
            class_counts: HashMap::new(),
            avg_fps: 10.0,
            avg_processing_time_ms: 12.0,
            sampled_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_newer_snapshot_overwrites_older() {
        let cache = StatsCache::new();
        cache.update(snapshot("cam1", 10)).await;
        cache.update(snapshot("cam1", 25)).await;

        let cached = cache.get("cam1").await.unwrap();
        assert_eq!(cached.snapshot.total_frames, 25);
        assert_eq!(cache.all().await.len(), 1);
    }

    #[tokio::test]
    async fn test_all_sorted_by_camera() {
        let cache = StatsCache::new();
        cache.update(snapshot("cam2", 1)).await;
        cache.update(snapshot("cam1", 1)).await;
        let all = cache.all().await;
        assert_eq!(all[0].snapshot.camera_id, "cam1");
        assert_eq!(all[1].snapshot.camera_id, "cam2");
    }
}
