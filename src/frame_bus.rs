//! Bounded many-producer, one-consumer mailbox of captured frames. Capacity
//! is `frame_queue_size`; the producer discipline is drop-on-full, never
//! block the acquisition thread.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use opencv::core::Mat;

pub struct Frame {
    pub camera_id: i64,
    pub image: Mat,
    pub capture_time: DateTime<Utc>,
    pub sequence: u64,
}

#[derive(Default)]
pub struct FrameBusStats {
    pub dropped: AtomicU64,
    pub delivered: AtomicU64,
}

pub struct FrameBusSender {
    tx: flume::Sender<Frame>,
    stats: Arc<FrameBusStats>,
}

impl Clone for FrameBusSender {
    fn clone(&self) -> Self {
        Self { tx: self.tx.clone(), stats: self.stats.clone() }
    }
}

impl FrameBusSender {
    /// Attempt a non-blocking publish. On a full bus the frame is dropped
    /// and the dropped counter is incremented; the caller never blocks.
    /// Returns whether the frame was delivered, so per-producer callers can
    /// keep their own drop counts.
    pub fn publish(&self, frame: Frame) -> bool {
        match self.tx.try_send(frame) {
            Ok(()) => {
                self.stats.delivered.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(_) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }
}

pub struct FrameBusReceiver {
    rx: flume::Receiver<Frame>,
}

impl FrameBusReceiver {
    /// Block for up to `timeout` waiting for the next frame so the
    /// processor remains responsive to the shutdown flag.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<Frame> {
        self.rx.recv_timeout(timeout).ok()
    }
}

pub fn frame_bus(capacity: usize) -> (FrameBusSender, FrameBusReceiver, Arc<FrameBusStats>) {
    let (tx, rx) = flume::bounded(capacity.max(1));
    let stats = Arc::new(FrameBusStats::default());
    (FrameBusSender { tx, stats: stats.clone() }, FrameBusReceiver { rx }, stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use opencv::core::Mat;

    fn dummy_frame(camera_id: i64, seq: u64) -> Frame {
        Frame { camera_id, image: Mat::default(), capture_time: Utc::now(), sequence: seq }
    }

    #[test]
    fn drops_on_full_and_counts_exactly() {
        let (tx, rx, stats) = frame_bus(2);
        for i in 0..10u64 {
            tx.publish(dummy_frame(1, i));
        }
        assert_eq!(stats.dropped.load(Ordering::Relaxed), 8);
        assert_eq!(stats.delivered.load(Ordering::Relaxed), 2);
        drop(rx);
    }

    #[test]
    fn delivers_within_capacity() {
        let (tx, rx, stats) = frame_bus(4);
        tx.publish(dummy_frame(1, 0));
        tx.publish(dummy_frame(1, 1));
        assert_eq!(stats.dropped.load(Ordering::Relaxed), 0);
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_some());
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_some());
    }
}
