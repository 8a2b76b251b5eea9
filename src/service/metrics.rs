//! Instance-owned operational counters.
//!
//! One `Metrics` lives per `Service`; components update it with relaxed
//! atomics and readers take a point-in-time `MetricsSnapshot`.

use serde::Serialize;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

/// Count, total and maximum of observed durations.
#[derive(Debug, Default)]
pub struct DurationSummary {
    count: AtomicU64,
    total_us: AtomicU64,
    max_us: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DurationSnapshot {
    pub count: u64,
    pub total_ms: u64,
    pub max_ms: u64,
}

impl DurationSummary {
    pub fn observe(&self, elapsed: Duration) {
        let us = elapsed.as_micros().min(u64::MAX as u128) as u64;
        self.count.fetch_add(1, Ordering::Relaxed);
        self.total_us.fetch_add(us, Ordering::Relaxed);
        self.max_us.fetch_max(us, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DurationSnapshot {
        DurationSnapshot {
            count: self.count.load(Ordering::Relaxed),
            total_ms: self.total_us.load(Ordering::Relaxed) / 1000,
            max_ms: self.max_us.load(Ordering::Relaxed) / 1000,
        }
    }
}

#[derive(Debug, Default)]
pub struct Metrics {
    index_in_flight: AtomicI64,
    search_in_flight: AtomicI64,
    index_runs: AtomicU64,
    index_failures: AtomicU64,
    index_coalesced: AtomicU64,
    searches: AtomicU64,
    search_failures: AtomicU64,
    repos_evicted: AtomicU64,
    repos: AtomicI64,
    pub index_duration: DurationSummary,
    pub search_duration: DurationSummary,
    /// Time index requests spent queued before a worker picked them up
    pub queue_age: DurationSummary,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub index_in_flight: i64,
    pub search_in_flight: i64,
    pub index_runs: u64,
    pub index_failures: u64,
    pub index_coalesced: u64,
    pub searches: u64,
    pub search_failures: u64,
    pub repos_evicted: u64,
    pub repos: i64,
    pub index_duration: DurationSnapshot,
    pub search_duration: DurationSnapshot,
    pub queue_age: DurationSnapshot,
}

/// Operation kinds tracked by the in-flight gauges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Index,
    Search,
}

/// Holds an in-flight gauge up until dropped.
pub struct InFlight<'a> {
    gauge: &'a AtomicI64,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.gauge.fetch_sub(1, Ordering::Relaxed);
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&self, op: Operation) -> InFlight<'_> {
        let (gauge, total) = match op {
            Operation::Index => (&self.index_in_flight, &self.index_runs),
            Operation::Search => (&self.search_in_flight, &self.searches),
        };
        gauge.fetch_add(1, Ordering::Relaxed);
        total.fetch_add(1, Ordering::Relaxed);
        InFlight { gauge }
    }

    pub fn record_failure(&self, op: Operation) {
        let counter = match op {
            Operation::Index => &self.index_failures,
            Operation::Search => &self.search_failures,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_coalesced(&self) {
        self.index_coalesced.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_evicted(&self, count: u64) {
        self.repos_evicted.fetch_add(count, Ordering::Relaxed);
    }

    pub fn set_repos(&self, count: usize) {
        self.repos.store(count as i64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            index_in_flight: self.index_in_flight.load(Ordering::Relaxed),
            search_in_flight: self.search_in_flight.load(Ordering::Relaxed),
            index_runs: self.index_runs.load(Ordering::Relaxed),
            index_failures: self.index_failures.load(Ordering::Relaxed),
            index_coalesced: self.index_coalesced.load(Ordering::Relaxed),
            searches: self.searches.load(Ordering::Relaxed),
            search_failures: self.search_failures.load(Ordering::Relaxed),
            repos_evicted: self.repos_evicted.load(Ordering::Relaxed),
            repos: self.repos.load(Ordering::Relaxed),
            index_duration: self.index_duration.snapshot(),
            search_duration: self.search_duration.snapshot(),
            queue_age: self.queue_age.snapshot(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_flight_gauge() {
        let metrics = Metrics::new();
        let a = metrics.start(Operation::Index);
        let b = metrics.start(Operation::Index);
        assert_eq!(metrics.snapshot().index_in_flight, 2);
        drop(a);
        drop(b);

        let snap = metrics.snapshot();
        assert_eq!(snap.index_in_flight, 0);
        assert_eq!(snap.index_runs, 2);
        assert_eq!(snap.searches, 0);
    }

    #[test]
    fn test_duration_summary() {
        let summary = DurationSummary::default();
        summary.observe(Duration::from_millis(5));
        summary.observe(Duration::from_millis(20));
        assert_eq!(
            summary.snapshot(),
            DurationSnapshot {
                count: 2,
                total_ms: 25,
                max_ms: 20
            }
        );
    }

    #[test]
    fn test_failures_and_gauges() {
        let metrics = Metrics::new();
        metrics.record_failure(Operation::Search);
        metrics.record_coalesced();
        metrics.record_evicted(3);
        metrics.set_repos(7);
        let snap = metrics.snapshot();
        assert_eq!(snap.search_failures, 1);
        assert_eq!(snap.index_failures, 0);
        assert_eq!(snap.index_coalesced, 1);
        assert_eq!(snap.repos_evicted, 3);
        assert_eq!(snap.repos, 7);
    }
}
