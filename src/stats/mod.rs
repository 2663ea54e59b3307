//! Loader statistics — lock-free counters for hits, misses and batches.
//!
//! Every [`load`](crate::Loader::load) records one request and every executed
//! batch records its size and duration. Counters are atomics, so concurrent
//! loads and flushes update them without coordination. A single
//! [`StatsCollector`] can be shared between loaders through an [`Arc`].
//!
//! [`Arc`]: std::sync::Arc

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

/// Aggregates request and batch counters for one or more loaders.
#[derive(Debug, Default)]
pub struct StatsCollector {
    total_requests: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    batch_count: AtomicU64,
    keys_batched: AtomicU64,
    load_time_nanos: AtomicU64,
}

impl StatsCollector {
    /// Creates a collector with every counter at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one request, counted as a cache hit or miss.
    pub fn record_request(&self, hit: bool) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        if hit {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.cache_misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Records one executed batch of `size` keys that took `duration`.
    pub fn record_batch(&self, size: usize, duration: Duration) {
        self.batch_count.fetch_add(1, Ordering::Relaxed);
        self.keys_batched.fetch_add(size as u64, Ordering::Relaxed);
        let nanos = u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX);
        self.load_time_nanos.fetch_add(nanos, Ordering::Relaxed);
    }

    /// Returns a point-in-time copy of the counters.
    ///
    /// Counters are read individually, so a snapshot taken during heavy
    /// traffic may mix values from neighbouring instants.
    pub fn snapshot(&self) -> StatsSnapshot {
        let batch_count = self.batch_count.load(Ordering::Relaxed);
        let keys_batched = self.keys_batched.load(Ordering::Relaxed);
        let average_batch_size = if batch_count == 0 {
            0.0
        } else {
            keys_batched as f64 / batch_count as f64
        };

        StatsSnapshot {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            batch_count,
            average_batch_size,
            total_load_time: Duration::from_nanos(self.load_time_nanos.load(Ordering::Relaxed)),
        }
    }
}

/// Immutable view of a [`StatsCollector`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub total_requests: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub batch_count: u64,
    /// Mean number of keys per executed batch.
    pub average_batch_size: f64,
    /// Wall-clock time spent inside batch executions, summed.
    pub total_load_time: Duration,
}

impl StatsSnapshot {
    /// Fraction of requests served from the cache, `0.0` when idle.
    pub fn hit_ratio(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.cache_hits as f64 / self.total_requests as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn fresh_collector_is_zeroed() {
        let stats = StatsCollector::new().snapshot();
        assert_eq!(stats, StatsSnapshot::default());
        assert_eq!(stats.hit_ratio(), 0.0);
    }

    #[test]
    fn requests_split_into_hits_and_misses() {
        let stats = StatsCollector::new();
        stats.record_request(true);
        stats.record_request(false);
        stats.record_request(false);
        let snap = stats.snapshot();
        assert_eq!(snap.total_requests, 3);
        assert_eq!(snap.cache_hits, 1);
        assert_eq!(snap.cache_misses, 2);
        assert!((snap.hit_ratio() - 1.0 / 3.0).abs() < f64::EPSILON);
    }

    #[test]
    fn batches_accumulate_size_and_time() {
        let stats = StatsCollector::new();
        stats.record_batch(4, Duration::from_millis(10));
        stats.record_batch(2, Duration::from_millis(5));
        let snap = stats.snapshot();
        assert_eq!(snap.batch_count, 2);
        assert_eq!(snap.average_batch_size, 3.0);
        assert_eq!(snap.total_load_time, Duration::from_millis(15));
    }

    #[test]
    fn concurrent_writers_are_all_counted() {
        let stats = Arc::new(StatsCollector::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let stats = Arc::clone(&stats);
                std::thread::spawn(move || {
                    for i in 0..1000 {
                        stats.record_request(i % 2 == 0);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        let snap = stats.snapshot();
        assert_eq!(snap.total_requests, 8000);
        assert_eq!(snap.cache_hits, 4000);
        assert_eq!(snap.cache_misses, 4000);
    }

    #[test]
    fn snapshot_serializes_to_json() {
        let stats = StatsCollector::new();
        stats.record_request(true);
        let json = serde_json::to_value(stats.snapshot()).unwrap();
        assert_eq!(json["total_requests"], 1);
        assert_eq!(json["cache_hits"], 1);
        assert!(json.get("total_load_time").is_some());
    }
}
