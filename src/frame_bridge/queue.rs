//! Bounded drop-oldest frame queue
//!
//! Connects the bridge's channel subscriber (producer) to its fan-out
//! sender (consumer). Enqueue never blocks: on overflow the oldest queued
//! frame is dropped to admit the new one, favoring recency over
//! completeness so a slow consumer can never stall the subscriber loop.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

/// One queued frame awaiting fan-out
#[derive(Debug, Clone)]
pub struct QueuedFrame {
    pub camera_id: String,
    pub payload: Arc<Vec<u8>>,
}

pub struct FrameQueue {
    items: Mutex<VecDeque<QueuedFrame>>,
    capacity: usize,
    notify: Notify,
    dropped: AtomicU64,
}

impl FrameQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
        }
    }

    /// Enqueue a frame, dropping the oldest queued frame on overflow.
    /// Never blocks and never exceeds the configured capacity.
    pub fn push(&self, frame: QueuedFrame) {
        {
            let mut items = match self.items.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if items.len() >= self.capacity {
                if let Some(dropped) = items.pop_front() {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    tracing::trace!(
                        camera_id = %dropped.camera_id,
                        "Send queue full, dropped oldest frame"
                    );
                }
            }
            items.push_back(frame);
        }
        self.notify.notify_one();
    }

    /// Dequeue the oldest frame, waiting until one is available
    pub async fn pop(&self) -> QueuedFrame {
        loop {
            {
                let mut items = match self.items.lock() {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
                if let Some(frame) = items.pop_front() {
                    return frame;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Non-blocking dequeue
    pub fn try_pop(&self) -> Option<QueuedFrame> {
        match self.items.lock() {
            Ok(mut guard) => guard.pop_front(),
            Err(poisoned) => poisoned.into_inner().pop_front(),
        }
    }

    pub fn len(&self) -> usize {
        match self.items.lock() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(camera_id: &str, tag: u8) -> QueuedFrame {
        QueuedFrame {
            camera_id: camera_id.to_string(),
            payload: Arc::new(vec![tag]),
        }
    }

    #[test]
    fn test_capacity_never_exceeded_under_overload() {
        let queue = FrameQueue::new(3);
        for i in 0..100 {
            queue.push(frame("cam1", i));
            assert!(queue.len() <= 3);
        }
        assert_eq!(queue.dropped_count(), 97);
    }

    #[test]
    fn test_overflow_drops_oldest_keeps_newest() {
        let queue = FrameQueue::new(3);
        for i in 1..=5 {
            queue.push(frame("cam1", i));
        }
        // Frames 1 and 2 dropped; 3, 4, 5 remain in FIFO order, so the
        // newest frame is always delivered after (never before) the older
        // surviving ones, and ahead of anything that was dropped.
        assert_eq!(queue.try_pop().unwrap().payload[0], 3);
        assert_eq!(queue.try_pop().unwrap().payload[0], 4);
        assert_eq!(queue.try_pop().unwrap().payload[0], 5);
        assert!(queue.try_pop().is_none());
        assert_eq!(queue.dropped_count(), 2);
    }

    #[tokio::test]
    async fn test_pop_wakes_on_push() {
        let queue = Arc::new(FrameQueue::new(4));
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await })
        };
        tokio::task::yield_now().await;
        queue.push(frame("cam1", 9));
        let got = consumer.await.unwrap();
        assert_eq!(got.payload[0], 9);
    }
}
