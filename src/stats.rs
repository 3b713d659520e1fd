//! Process-wide counters surfaced to the external read API. Write-heavy from
//! many workers, read-only from the API; relaxed atomicity is acceptable —
//! no transactional guarantees are made across counters.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

#[derive(Default)]
pub struct StatsRegistry {
    pub frames_delivered: AtomicU64,
    pub frames_dropped: AtomicU64,
    pub writer_enqueued: AtomicU64,
    pub writer_dropped: AtomicU64,
    pub writer_committed: AtomicU64,
    pub writer_failed: AtomicU64,
    pub total_entries: AtomicU64,
    pub total_exits: AtomicU64,
    pub ocr_calls: AtomicU64,
    pub ocr_successful: AtomicU64,
    pub ocr_failed: AtomicU64,
    ready: AtomicBool,
}

impl StatsRegistry {
    pub fn mark_ready(&self) {
        self.ready.store(true, Ordering::Relaxed);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            frames_delivered: self.frames_delivered.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            writer_enqueued: self.writer_enqueued.load(Ordering::Relaxed),
            writer_dropped: self.writer_dropped.load(Ordering::Relaxed),
            writer_committed: self.writer_committed.load(Ordering::Relaxed),
            writer_failed: self.writer_failed.load(Ordering::Relaxed),
            total_entries: self.total_entries.load(Ordering::Relaxed),
            total_exits: self.total_exits.load(Ordering::Relaxed),
            ocr_calls: self.ocr_calls.load(Ordering::Relaxed),
            ocr_successful: self.ocr_successful.load(Ordering::Relaxed),
            ocr_failed: self.ocr_failed.load(Ordering::Relaxed),
            ready: self.is_ready(),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct StatsSnapshot {
    pub frames_delivered: u64,
    pub frames_dropped: u64,
    pub writer_enqueued: u64,
    pub writer_dropped: u64,
    pub writer_committed: u64,
    pub writer_failed: u64,
    pub total_entries: u64,
    pub total_exits: u64,
    pub ocr_calls: u64,
    pub ocr_successful: u64,
    pub ocr_failed: u64,
    pub ready: bool,
}
