//! Detection Loop Driver
//!
//! ## Responsibilities
//!
//! - Own one camera's capture lifecycle and drive the
//!   capture -> detect -> annotate -> publish cycle until told to stop
//! - Accumulate rolling counters and publish a stats snapshot on a
//!   wall-clock interval
//! - Apply hot-reloaded detector parameters between frames
//!
//! One loop per OS process; concurrency across cameras is process
//! multiplicity. The cycle itself is blocking and sequential; the config
//! listener runs as a separate task and swaps parameters through an
//! `ArcSwap`, so reloads never stall capture.

use crate::capture::VideoSource;
use crate::control_plane::{BlockingPublisher, StatsSnapshot};
use crate::detector::{Detector, DetectorParams};
use crate::error::Error;
use arc_swap::ArcSwap;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Loop lifecycle. There is no pause state; restart means a new process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Starting,
    Running,
    StoppingViaSignal,
    StoppingViaSourceExhausted,
    Crashed,
    Stopped,
}

/// Terminal outcome of a loop run, mapped to the worker's exit code
#[derive(Debug)]
pub enum LoopExit {
    /// Cooperative stop via signal/cancellation
    Signal,
    /// Live source stopped producing frames
    SourceExhausted,
    /// Unrecoverable failure (source unusable, ...)
    Crashed(Error),
}

/// Rolling counters for one worker process.
///
/// Counters accumulate for the process lifetime and are snapshotted on
/// publish; a restart (new process) starts from zero.
pub struct RollingStats {
    camera_id: String,
    total_frames: u64,
    processed_frames: u64,
    class_counts: HashMap<String, u64>,
    processing_time_total_ms: f64,
    started_at: Instant,
    last_published: Instant,
    interval: Duration,
}

impl RollingStats {
    pub fn new(camera_id: impl Into<String>, interval: Duration) -> Self {
        let now = Instant::now();
        Self {
            camera_id: camera_id.into(),
            total_frames: 0,
            processed_frames: 0,
            class_counts: HashMap::new(),
            processing_time_total_ms: 0.0,
            started_at: now,
            last_published: now,
            interval,
        }
    }

    /// Record one frame read from the source
    pub fn record_frame(&mut self) -> u64 {
        self.total_frames += 1;
        self.total_frames
    }

    /// Record one frame that went through detection. Class counts are
    /// additive across frames, not a running maximum.
    pub fn record_processed(&mut self, elapsed_ms: f64, class_counts: &HashMap<String, u64>) {
        self.processed_frames += 1;
        self.processing_time_total_ms += elapsed_ms;
        for (class, count) in class_counts {
            *self.class_counts.entry(class.clone()).or_insert(0) += count;
        }
    }

    pub fn total_frames(&self) -> u64 {
        self.total_frames
    }

    /// Build a snapshot of the current counters
    pub fn snapshot(&self) -> StatsSnapshot {
        let elapsed_secs = self.started_at.elapsed().as_secs_f64();
        let avg_fps = if elapsed_secs > 0.0 {
            self.total_frames as f64 / elapsed_secs
        } else {
            0.0
        };
        let avg_processing_time_ms = if self.processed_frames > 0 {
            self.processing_time_total_ms / self.processed_frames as f64
        } else {
            0.0
        };

        StatsSnapshot {
            camera_id: self.camera_id.clone(),
            total_frames: self.total_frames,
            processed_frames: self.processed_frames,
            class_counts: self.class_counts.clone(),
            avg_fps,
            avg_processing_time_ms,
            sampled_at: Utc::now(),
        }
    }

    /// Snapshot at most once per interval, no matter how often this is
    /// called. Returns `None` while inside the rate-limit window.
    pub fn maybe_snapshot(&mut self) -> Option<StatsSnapshot> {
        if self.last_published.elapsed() < self.interval {
            return None;
        }
        self.last_published = Instant::now();
        Some(self.snapshot())
    }
}

/// Frame-skip policy: process only every Nth frame
pub fn should_process(total_frames: u64, process_every: u32) -> bool {
    let every = process_every.max(1) as u64;
    total_frames % every == 0
}

/// Detection loop configuration (fixed for the process lifetime; tunable
/// parameters live in [`DetectorParams`])
#[derive(Debug, Clone)]
pub struct LoopConfig {
    pub camera_id: String,
    /// Stats publish rate limit (default 5s)
    pub stats_interval: Duration,
}

impl LoopConfig {
    pub fn new(camera_id: impl Into<String>) -> Self {
        Self {
            camera_id: camera_id.into(),
            stats_interval: Duration::from_secs(5),
        }
    }
}

/// Drives one camera's detect -> annotate -> publish cycle
pub struct DetectionLoop {
    config: LoopConfig,
    /// The loop is the only locker during reads; the signal path stops
    /// capture through the source's lock-free release handle instead
    source: Arc<Mutex<VideoSource>>,
    detector: Box<dyn Detector>,
    params: Arc<ArcSwap<DetectorParams>>,
    publisher: BlockingPublisher,
    token: CancellationToken,
    state: LoopState,
}

impl DetectionLoop {
    pub fn new(
        config: LoopConfig,
        source: Arc<Mutex<VideoSource>>,
        detector: Box<dyn Detector>,
        params: Arc<ArcSwap<DetectorParams>>,
        publisher: BlockingPublisher,
        token: CancellationToken,
    ) -> Self {
        Self {
            config,
            source,
            detector,
            params,
            publisher,
            token,
            state: LoopState::Starting,
        }
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    /// Run the loop to completion. Blocking; callers run this on a dedicated
    /// thread (`spawn_blocking` in the worker binary).
    pub fn run(&mut self) -> LoopExit {
        let camera_id = self.config.camera_id.clone();
        let mut stats = RollingStats::new(&camera_id, self.config.stats_interval);

        self.state = LoopState::Running;
        tracing::info!(camera_id = %camera_id, "Detection loop running");

        let exit = loop {
            if self.token.is_cancelled() {
                break LoopExit::Signal;
            }

            let frame = {
                let mut source = match self.source.lock() {
                    Ok(s) => s,
                    Err(poisoned) => poisoned.into_inner(),
                };
                source.read_frame()
            };

            let frame = match frame {
                Ok(f) => f,
                // The signal path kills the pipeline under us; a read error
                // after cancellation is the cooperative stop, not a fault.
                Err(_) if self.token.is_cancelled() => break LoopExit::Signal,
                Err(Error::SourceExhausted(msg)) => {
                    tracing::warn!(camera_id = %camera_id, reason = %msg, "Live source exhausted");
                    break LoopExit::SourceExhausted;
                }
                Err(e) => {
                    tracing::error!(camera_id = %camera_id, error = %e, "Capture failed");
                    break LoopExit::Crashed(e);
                }
            };

            let total = stats.record_frame();
            let params = self.params.load_full();

            // Frame-skip policy: only every Nth frame goes to detection;
            // skipped frames can still be forwarded for smooth viewing.
            let payload = if should_process(total, params.process_every) {
                let start = Instant::now();
                match self.detector.detect(&frame, &params) {
                    Ok(detections) => {
                        let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
                        stats.record_processed(elapsed_ms, &detections.class_counts);
                        match detections.annotated {
                            Some(annotated) => Some(annotated),
                            None => frame.to_jpeg(params.jpeg_quality).ok(),
                        }
                    }
                    Err(e) => {
                        // Best-effort: a failed detection pass never stops
                        // the loop, and the raw frame is still served
                        tracing::warn!(camera_id = %camera_id, error = %e, "Detection pass failed");
                        frame.to_jpeg(params.jpeg_quality).ok()
                    }
                }
            } else if params.forward_skipped {
                frame.to_jpeg(params.jpeg_quality).ok()
            } else {
                None
            };

            if let Some(bytes) = payload {
                // Fire-and-forget: a channel outage is logged, never fatal
                if let Err(e) = self.publisher.publish_frame(&camera_id, &bytes) {
                    tracing::warn!(camera_id = %camera_id, error = %e, "Frame publish failed");
                }
            }

            if let Some(snapshot) = stats.maybe_snapshot() {
                if let Err(e) = self.publisher.publish_stats(&snapshot) {
                    tracing::warn!(camera_id = %camera_id, error = %e, "Stats publish failed");
                } else {
                    tracing::debug!(
                        camera_id = %camera_id,
                        total_frames = snapshot.total_frames,
                        processed_frames = snapshot.processed_frames,
                        avg_fps = snapshot.avg_fps,
                        "Stats snapshot published"
                    );
                }
            }
        };

        self.state = match &exit {
            LoopExit::Signal => LoopState::StoppingViaSignal,
            LoopExit::SourceExhausted => LoopState::StoppingViaSourceExhausted,
            LoopExit::Crashed(_) => LoopState::Crashed,
        };

        // Secondary cleanup; idempotent with the signal handler's release
        if let Ok(mut source) = self.source.lock() {
            source.release();
        }

        self.state = LoopState::Stopped;
        tracing::info!(camera_id = %camera_id, exit = ?exit, "Detection loop stopped");
        exit
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    #[test]
    fn test_should_process_every_nth() {
        assert!(should_process(3, 3));
        assert!(!should_process(4, 3));
        assert!(!should_process(5, 3));
        assert!(should_process(6, 3));
        // N = 1 processes everything
        assert!(should_process(7, 1));
        // Zero is clamped to one, not a division by zero
        assert!(should_process(7, 0));
    }

    #[test]
    fn test_stats_accumulate_additively() {
        let mut stats = RollingStats::new("cam1", Duration::from_secs(5));
        stats.record_frame();
        stats.record_frame();

        let mut counts = HashMap::new();
        counts.insert("person".to_string(), 2);
        stats.record_processed(10.0, &counts);
        counts.insert("person".to_string(), 3);
        stats.record_processed(20.0, &counts);

        let snap = stats.snapshot();
        assert_eq!(snap.total_frames, 2);
        assert_eq!(snap.processed_frames, 2);
        // Additive across frames, not max
        assert_eq!(snap.class_counts["person"], 5);
        assert_eq!(snap.avg_processing_time_ms, 15.0);
    }

    #[test]
    fn test_maybe_snapshot_rate_limited() {
        let mut stats = RollingStats::new("cam1", Duration::from_secs(3600));
        stats.record_frame();
        // Inside the window: nothing published no matter how often asked
        assert!(stats.maybe_snapshot().is_none());
        assert!(stats.maybe_snapshot().is_none());
    }

    #[test]
    fn test_maybe_snapshot_after_interval() {
        let mut stats = RollingStats::new("cam1", Duration::from_millis(10));
        stats.record_frame();
        sleep(Duration::from_millis(20));
        assert!(stats.maybe_snapshot().is_some());
        // Window restarts after a publish
        assert!(stats.maybe_snapshot().is_none());
    }

    #[test]
    fn test_snapshot_with_no_processed_frames() {
        let stats = RollingStats::new("cam1", Duration::from_secs(5));
        let snap = stats.snapshot();
        assert_eq!(snap.avg_processing_time_ms, 0.0);
        assert!(snap.class_counts.is_empty());
    }
}
