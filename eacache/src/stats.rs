//! Cache statistics for prefetch effectiveness.
//!
//! The engine records events on lock-free atomic counters; callers read a
//! point-in-time [`CacheStatsSnapshot`]:
//!
//! ```text
//! Engine events ─────► CacheStats ─────► CacheStatsSnapshot ─────► Report
//!                      (atomic counters)  (point-in-time copy)      (Display)
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Atomic counters for cache events.
#[derive(Debug, Default)]
pub struct CacheStats {
    hints: AtomicU64,
    prefetches_issued: AtomicU64,
    demand_requests: AtomicU64,
    hits: AtomicU64,
    completed_fetches: AtomicU64,
    cancelled_fetches: AtomicU64,
    promotion_delay_total_ms: AtomicU64,
}

impl CacheStats {
    /// Creates zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// A prefetch was hinted.
    pub fn prefetch_hinted(&self) {
        self.hints.fetch_add(1, Ordering::Relaxed);
    }

    /// A prefetch attempt was started.
    pub fn prefetch_issued(&self) {
        self.prefetches_issued.fetch_add(1, Ordering::Relaxed);
    }

    /// A caller demanded a result.
    ///
    /// `already_done` marks a cache hit; `since_created` is the delay between
    /// the submission and this demand.
    pub fn demand_fetch(&self, already_done: bool, since_created: Duration) {
        self.demand_requests.fetch_add(1, Ordering::Relaxed);
        if already_done {
            self.hits.fetch_add(1, Ordering::Relaxed);
        }
        let delay_ms = u64::try_from(since_created.as_millis()).unwrap_or(u64::MAX);
        let _ = self
            .promotion_delay_total_ms
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |total| {
                Some(total.saturating_add(delay_ms))
            });
    }

    /// A fetch produced its result.
    pub fn fetch_completed(&self) {
        self.completed_fetches.fetch_add(1, Ordering::Relaxed);
    }

    /// A fetch was cancelled.
    pub fn fetch_cancelled(&self) {
        self.cancelled_fetches.fetch_add(1, Ordering::Relaxed);
    }

    /// Takes a point-in-time copy of the counters.
    pub fn snapshot(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            hints: self.hints.load(Ordering::Relaxed),
            prefetches_issued: self.prefetches_issued.load(Ordering::Relaxed),
            demand_requests: self.demand_requests.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            completed_fetches: self.completed_fetches.load(Ordering::Relaxed),
            cancelled_fetches: self.cancelled_fetches.load(Ordering::Relaxed),
            promotion_delay_total_ms: self.promotion_delay_total_ms.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time cache statistics.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStatsSnapshot {
    /// Prefetches hinted through background submission.
    pub hints: u64,
    /// Prefetch attempts started.
    pub prefetches_issued: u64,
    /// Times a caller demanded a result.
    pub demand_requests: u64,
    /// Demands that found the fetch already complete.
    pub hits: u64,
    /// Fetches that produced a result.
    pub completed_fetches: u64,
    /// Fetches that were cancelled.
    pub cancelled_fetches: u64,
    /// Sum of submission-to-demand delays.
    pub promotion_delay_total_ms: u64,
}

impl CacheStatsSnapshot {
    /// Demands that had to wait for the fetch.
    pub fn misses(&self) -> u64 {
        self.demand_requests.saturating_sub(self.hits)
    }

    /// Fraction of demands that were hits, or 0.0 with no demands.
    pub fn hit_rate(&self) -> f64 {
        if self.demand_requests == 0 {
            return 0.0;
        }
        self.hits as f64 / self.demand_requests as f64
    }

    /// Mean submission-to-demand delay.
    pub fn mean_promotion_delay(&self) -> Duration {
        if self.demand_requests == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(self.promotion_delay_total_ms / self.demand_requests)
    }
}

impl fmt::Display for CacheStatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Cache stats:")?;
        writeln!(f, "  Items hinted: {}", self.hints)?;
        writeln!(f, "  Items fetched: {}", self.completed_fetches)?;
        writeln!(f, "  Demand requests: {}", self.demand_requests)?;
        writeln!(f, "  Cache hits: {}", self.hits)?;
        writeln!(f, "  Cache misses: {}", self.misses())?;
        writeln!(f, "  Cancelled: {}", self.cancelled_fetches)?;
        write!(f, "  Hit rate: {:.2} %", self.hit_rate() * 100.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_counts_events() {
        let stats = CacheStats::new();
        stats.prefetch_hinted();
        stats.prefetch_hinted();
        stats.prefetch_issued();
        stats.demand_fetch(true, Duration::from_millis(100));
        stats.demand_fetch(false, Duration::from_millis(300));
        stats.fetch_completed();
        stats.fetch_cancelled();

        let snap = stats.snapshot();
        assert_eq!(snap.hints, 2);
        assert_eq!(snap.prefetches_issued, 1);
        assert_eq!(snap.demand_requests, 2);
        assert_eq!(snap.hits, 1);
        assert_eq!(snap.misses(), 1);
        assert_eq!(snap.completed_fetches, 1);
        assert_eq!(snap.cancelled_fetches, 1);
        assert_eq!(snap.hit_rate(), 0.5);
        assert_eq!(snap.mean_promotion_delay(), Duration::from_millis(200));
    }

    #[test]
    fn test_promotion_delay_saturates() {
        let stats = CacheStats::new();
        stats.demand_fetch(false, Duration::MAX);
        stats.demand_fetch(false, Duration::from_millis(5));
        assert_eq!(stats.snapshot().promotion_delay_total_ms, u64::MAX);
    }

    #[test]
    fn test_empty_snapshot_rates() {
        let snap = CacheStatsSnapshot::default();
        assert_eq!(snap.hit_rate(), 0.0);
        assert_eq!(snap.misses(), 0);
        assert_eq!(snap.mean_promotion_delay(), Duration::ZERO);
    }

    #[test]
    fn test_report_format() {
        let snap = CacheStatsSnapshot {
            hints: 4,
            demand_requests: 4,
            hits: 3,
            completed_fetches: 4,
            ..Default::default()
        };
        let report = snap.to_string();
        assert!(report.starts_with("Cache stats:"));
        assert!(report.contains("Items hinted: 4"));
        assert!(report.contains("Cache misses: 1"));
        assert!(report.contains("Hit rate: 75.00 %"));
    }
}
