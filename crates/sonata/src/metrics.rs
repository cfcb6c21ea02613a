// src/metrics.rs
use std::sync::atomic::{AtomicUsize, Ordering};

/// Engine-wide counters, logged on every tick. Live connections are counted
/// by the connection table.
#[repr(C, align(64))]
pub struct EngineMetrics {
    pub requests: AtomicUsize,
    pub bytes_sent: AtomicUsize,
    /// Busy responses plus work items dropped on a full queue.
    pub rejected: AtomicUsize,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self {
            requests: AtomicUsize::new(0),
            bytes_sent: AtomicUsize::new(0),
            rejected: AtomicUsize::new(0),
        }
    }

    pub fn inc_req(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_bytes(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn inc_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub requests: usize,
    pub bytes_sent: usize,
    pub rejected: usize,
}
