//! Process-wide cycle counters, shared between the scheduler and the health
//! endpoint.

use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug)]
pub struct CycleMetrics {
    started: Instant,
    cycles: AtomicU64,
    discovered: AtomicU64,
    processed: AtomicU64,
    forwarded: AtomicU64,
    errors: AtomicU64,
    consecutive_errors: AtomicU32,
    /// Unix seconds of the last completed cycle, 0 before the first.
    last_check: AtomicI64,
}

/// Point-in-time copy of [`CycleMetrics`], as served by the health endpoint.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub cycles: u64,
    pub discovered: u64,
    pub processed: u64,
    pub forwarded: u64,
    pub errors: u64,
    pub consecutive_errors: u32,
    pub last_check: Option<DateTime<Utc>>,
}

impl CycleMetrics {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            cycles: AtomicU64::new(0),
            discovered: AtomicU64::new(0),
            processed: AtomicU64::new(0),
            forwarded: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            consecutive_errors: AtomicU32::new(0),
            last_check: AtomicI64::new(0),
        }
    }

    pub fn add_discovered(&self, n: u64) {
        self.discovered.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_processed(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_forwarded(&self) {
        self.forwarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Close out a cycle: bump the count, stamp the time, publish the
    /// scheduler's current consecutive-error counter.
    pub fn finish_cycle(&self, consecutive_errors: u32, at: DateTime<Utc>) {
        self.cycles.fetch_add(1, Ordering::Relaxed);
        self.consecutive_errors
            .store(consecutive_errors, Ordering::Relaxed);
        self.last_check.store(at.timestamp(), Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let last_check = match self.last_check.load(Ordering::Relaxed) {
            0 => None,
            secs => DateTime::from_timestamp(secs, 0),
        };
        MetricsSnapshot {
            uptime_secs: self.started.elapsed().as_secs(),
            cycles: self.cycles.load(Ordering::Relaxed),
            discovered: self.discovered.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            forwarded: self.forwarded.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            consecutive_errors: self.consecutive_errors.load(Ordering::Relaxed),
            last_check,
        }
    }
}

impl Default for CycleMetrics {
    fn default() -> Self {
        Self::new()
    }
}
