//! Engine statistics.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Atomic counters shared by every thread of one dispatcher.
pub struct Stats {
    pub queries: AtomicU64,
    pub answered: AtomicU64,
    pub failed: AtomicU64,
    pub timed_out: AtomicU64,
    pub collisions: AtomicU64,
    pub connections: AtomicU64,
    pub bind_retries: AtomicU64,
    /// Cumulative time to completion in microseconds, for averaging.
    total_response_time_us: AtomicU64,
}

impl Stats {
    pub fn new() -> Self {
        Self {
            queries: AtomicU64::new(0),
            answered: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            timed_out: AtomicU64::new(0),
            collisions: AtomicU64::new(0),
            connections: AtomicU64::new(0),
            bind_retries: AtomicU64::new(0),
            total_response_time_us: AtomicU64::new(0),
        }
    }

    pub fn record_query(&self) {
        self.queries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_answered(&self, elapsed: Duration) {
        self.answered.fetch_add(1, Ordering::Relaxed);
        self.add_time(elapsed);
    }

    pub fn record_failed(&self, elapsed: Duration) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        self.add_time(elapsed);
    }

    pub fn record_timed_out(&self, elapsed: Duration) {
        self.timed_out.fetch_add(1, Ordering::Relaxed);
        self.add_time(elapsed);
    }

    pub fn record_collision(&self) {
        self.collisions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection(&self, bind_retries: u32) {
        self.connections.fetch_add(1, Ordering::Relaxed);
        self.bind_retries
            .fetch_add(u64::from(bind_retries), Ordering::Relaxed);
    }

    fn add_time(&self, elapsed: Duration) {
        self.total_response_time_us
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        self.collect(|counter| counter.load(Ordering::Relaxed))
    }

    pub fn snapshot_and_reset(&self) -> StatsSnapshot {
        self.collect(|counter| counter.swap(0, Ordering::Relaxed))
    }

    fn collect(&self, read: impl Fn(&AtomicU64) -> u64) -> StatsSnapshot {
        let queries = read(&self.queries);
        let answered = read(&self.answered);
        let failed = read(&self.failed);
        let timed_out = read(&self.timed_out);
        let collisions = read(&self.collisions);
        let connections = read(&self.connections);
        let bind_retries = read(&self.bind_retries);
        let total_us = read(&self.total_response_time_us);

        let completed = answered + failed + timed_out;
        let avg_response_ms = if completed > 0 {
            (total_us as f64 / completed as f64) / 1000.0
        } else {
            0.0
        };

        StatsSnapshot {
            queries,
            answered,
            failed,
            timed_out,
            collisions,
            connections,
            bind_retries,
            avg_response_ms,
        }
    }
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StatsSnapshot {
    pub queries: u64,
    pub answered: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub collisions: u64,
    pub connections: u64,
    pub bind_retries: u64,
    pub avg_response_ms: f64,
}

impl StatsSnapshot {
    /// Queries submitted but not completed yet.
    pub fn in_flight(&self) -> u64 {
        self.queries
            .saturating_sub(self.answered + self.failed + self.timed_out)
    }
}
