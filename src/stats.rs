//! Counters for the DNS responder.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::policy::Route;

/// Atomic statistics, drained by the periodic stats log line.
pub struct Stats {
    started: Instant,
    pub requests: AtomicU64,
    pub direct: AtomicU64,
    pub tunneled: AtomicU64,
    pub blocked: AtomicU64,
    /// Queries answered with SERVFAIL
    pub failed: AtomicU64,
    /// Cumulative response time in microseconds for averaging.
    total_response_time_us: AtomicU64,
}

impl Stats {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            requests: AtomicU64::new(0),
            direct: AtomicU64::new(0),
            tunneled: AtomicU64::new(0),
            blocked: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            total_response_time_us: AtomicU64::new(0),
        }
    }

    /// Count an answered query under its route.
    pub fn record(&self, route: Route, elapsed: Duration) {
        let counter = match route {
            Route::Direct => &self.direct,
            Route::Tunnel => &self.tunneled,
            Route::Blocked => &self.blocked,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.add_request(elapsed);
    }

    pub fn record_failed(&self, elapsed: Duration) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        self.add_request(elapsed);
    }

    fn add_request(&self, elapsed: Duration) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.total_response_time_us
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn snapshot_and_reset(&self) -> StatsSnapshot {
        let requests = self.requests.swap(0, Ordering::Relaxed);
        let direct = self.direct.swap(0, Ordering::Relaxed);
        let tunneled = self.tunneled.swap(0, Ordering::Relaxed);
        let blocked = self.blocked.swap(0, Ordering::Relaxed);
        let failed = self.failed.swap(0, Ordering::Relaxed);
        let total_us = self.total_response_time_us.swap(0, Ordering::Relaxed);

        let avg_response_ms = if requests > 0 {
            (total_us as f64 / requests as f64) / 1000.0
        } else {
            0.0
        };

        StatsSnapshot {
            uptime_secs: self.started.elapsed().as_secs(),
            requests,
            direct,
            tunneled,
            blocked,
            failed,
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
    pub uptime_secs: u64,
    pub requests: u64,
    pub direct: u64,
    pub tunneled: u64,
    pub blocked: u64,
    pub failed: u64,
    pub avg_response_ms: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_averages_and_resets() {
        let stats = Stats::new();
        stats.record(Route::Direct, Duration::from_millis(2));
        stats.record(Route::Tunnel, Duration::from_millis(4));
        stats.record_failed(Duration::from_millis(6));

        let snapshot = stats.snapshot_and_reset();
        assert_eq!(snapshot.requests, 3);
        assert_eq!(snapshot.direct, 1);
        assert_eq!(snapshot.tunneled, 1);
        assert_eq!(snapshot.failed, 1);
        assert!((snapshot.avg_response_ms - 4.0).abs() < 0.01);

        assert_eq!(stats.snapshot_and_reset().requests, 0);
    }
}
