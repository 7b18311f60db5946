//! CINDER - Engine Metrics & Observability
//! Atomic counters for tracking engine operations lock-free with `AtomicU64`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Atomic operation counters for the Cinder engine.
///
/// All counters use `Ordering::Relaxed`; they are read for reporting only
/// and never used to synchronize.
#[derive(Debug)]
pub struct EngineMetrics {
    /// Total number of `put` operations (including TTL changes).
    pub puts: AtomicU64,
    /// Total number of `get` operations.
    pub gets: AtomicU64,
    /// Total number of tombstones written.
    pub deletes: AtomicU64,
    /// Total number of iterations started.
    pub scans: AtomicU64,
    /// Completed merge passes.
    pub merges: AtomicU64,
    /// Committed write batches.
    pub batches: AtomicU64,
    /// Total bytes written (keys + values).
    pub bytes_written: AtomicU64,
    /// Total bytes read (values returned by get).
    pub bytes_read: AtomicU64,
    /// Segment bytes released by merges.
    pub reclaimed_bytes: AtomicU64,
    /// Records replayed when the engine was opened.
    pub recovered_records: AtomicU64,
    /// Watch events dropped because the dispatch queue was full.
    pub watch_dropped: AtomicU64,
    engine_started: Instant,
}

impl EngineMetrics {
    /// Create a new metrics instance with all counters at zero.
    pub fn new() -> Self {
        Self {
            puts: AtomicU64::new(0),
            gets: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
            scans: AtomicU64::new(0),
            merges: AtomicU64::new(0),
            batches: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            bytes_read: AtomicU64::new(0),
            reclaimed_bytes: AtomicU64::new(0),
            recovered_records: AtomicU64::new(0),
            watch_dropped: AtomicU64::new(0),
            engine_started: Instant::now(),
        }
    }

    pub fn record_put(&self, key_size: usize, value_size: usize) {
        self.puts.fetch_add(1, Ordering::Relaxed);
        self.bytes_written
            .fetch_add((key_size + value_size) as u64, Ordering::Relaxed);
    }

    /// Record a get; `None` is a miss.
    pub fn record_get(&self, value_size: Option<usize>) {
        self.gets.fetch_add(1, Ordering::Relaxed);
        if let Some(size) = value_size {
            self.bytes_read.fetch_add(size as u64, Ordering::Relaxed);
        }
    }

    pub fn record_delete(&self) {
        self.deletes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_scan(&self) {
        self.scans.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a finished merge and the bytes it gave back.
    pub fn record_merge(&self, reclaimed: u64) {
        self.merges.fetch_add(1, Ordering::Relaxed);
        self.reclaimed_bytes.fetch_add(reclaimed, Ordering::Relaxed);
    }

    pub fn record_batch(&self) {
        self.batches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_recovery(&self, records: u64) {
        self.recovered_records.fetch_add(records, Ordering::Relaxed);
    }

    pub fn record_watch_drop(&self) {
        self.watch_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Get engine uptime in seconds.
    pub fn uptime_secs(&self) -> f64 {
        self.engine_started.elapsed().as_secs_f64()
    }

    /// Get total number of operations (puts + gets + deletes + scans).
    pub fn total_ops(&self) -> u64 {
        self.puts.load(Ordering::Relaxed)
            + self.gets.load(Ordering::Relaxed)
            + self.deletes.load(Ordering::Relaxed)
            + self.scans.load(Ordering::Relaxed)
    }

    pub fn ops_per_sec(&self) -> f64 {
        let uptime = self.uptime_secs();
        if uptime < 0.001 {
            return 0.0;
        }
        self.total_ops() as f64 / uptime
    }

    /// Format metrics as a human-readable report.
    pub fn report(&self) -> String {
        format!(
            "\n═══ CINDER Engine Metrics ═══\n\
             Operations:\n\
               puts:      {}\n\
               gets:      {}\n\
               deletes:   {}\n\
               scans:     {}\n\
               merges:    {}\n\
               batches:   {}\n\
             Throughput:\n\
               total ops: {}\n\
               ops/sec:   {:.2}\n\
             I/O:\n\
               written:   {} bytes\n\
               read:      {} bytes\n\
               reclaimed: {} bytes\n\
             Recovery:\n\
               records:   {}\n\
             Watch:\n\
               dropped:   {}\n\
             Uptime: {:.2}s",
            self.puts.load(Ordering::Relaxed),
            self.gets.load(Ordering::Relaxed),
            self.deletes.load(Ordering::Relaxed),
            self.scans.load(Ordering::Relaxed),
            self.merges.load(Ordering::Relaxed),
            self.batches.load(Ordering::Relaxed),
            self.total_ops(),
            self.ops_per_sec(),
            self.bytes_written.load(Ordering::Relaxed),
            self.bytes_read.load(Ordering::Relaxed),
            self.reclaimed_bytes.load(Ordering::Relaxed),
            self.recovered_records.load(Ordering::Relaxed),
            self.watch_dropped.load(Ordering::Relaxed),
            self.uptime_secs(),
        )
    }
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_operations() {
        let m = EngineMetrics::new();

        m.record_put(5, 10);
        m.record_put(3, 7);
        m.record_get(Some(10));
        m.record_get(None); // miss
        m.record_delete();
        m.record_scan();
        m.record_merge(4096);

        assert_eq!(m.puts.load(Ordering::Relaxed), 2);
        assert_eq!(m.gets.load(Ordering::Relaxed), 2);
        assert_eq!(m.deletes.load(Ordering::Relaxed), 1);
        assert_eq!(m.scans.load(Ordering::Relaxed), 1);
        assert_eq!(m.merges.load(Ordering::Relaxed), 1);
        assert_eq!(m.bytes_written.load(Ordering::Relaxed), 25);
        assert_eq!(m.bytes_read.load(Ordering::Relaxed), 10);
        assert_eq!(m.reclaimed_bytes.load(Ordering::Relaxed), 4096);
    }

    #[test]
    fn test_total_ops() {
        let m = EngineMetrics::new();
        m.record_put(1, 1);
        m.record_get(None);
        m.record_delete();
        m.record_scan();
        m.record_recovery(100);
        assert_eq!(m.total_ops(), 4);
    }

    #[test]
    fn test_report_format() {
        let m = EngineMetrics::new();
        m.record_put(10, 20);
        m.record_watch_drop();
        let report = m.report();
        assert!(report.contains("puts:"));
        assert!(report.contains("ops/sec:"));
        assert!(report.contains("dropped:   1"));
    }
}
