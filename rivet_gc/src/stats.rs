//! Collector statistics.
//!
//! Counters are atomics so a shared runtime can be inspected from another
//! thread without taking the runtime lock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Statistics about heap and collector activity.
#[derive(Debug)]
pub struct GcStats {
    // =========================================================================
    // Allocation Statistics
    // =========================================================================
    /// Total objects allocated since start.
    pub objects_allocated: AtomicU64,
    /// Approximate bytes allocated since start.
    pub bytes_allocated: AtomicU64,
    /// Live objects after the last collection.
    pub live_objects: AtomicU64,
    /// Allocations refused because of the object limit.
    pub allocation_failures: AtomicU64,

    // =========================================================================
    // Collection Statistics
    // =========================================================================
    /// Number of collections.
    pub collections: AtomicU64,
    /// Number of collections that compacted.
    pub compactions: AtomicU64,
    /// Total objects reclaimed.
    pub objects_freed: AtomicU64,
    /// Total objects relocated by compaction.
    pub objects_moved: AtomicU64,
    /// Objects that compaction left in place because they were pinned.
    pub pinned_skipped: AtomicU64,
    /// Total time spent collecting (nanoseconds).
    pub gc_time_ns: AtomicU64,
}

impl GcStats {
    /// Create new empty statistics.
    pub const fn new() -> Self {
        Self {
            objects_allocated: AtomicU64::new(0),
            bytes_allocated: AtomicU64::new(0),
            live_objects: AtomicU64::new(0),
            allocation_failures: AtomicU64::new(0),
            collections: AtomicU64::new(0),
            compactions: AtomicU64::new(0),
            objects_freed: AtomicU64::new(0),
            objects_moved: AtomicU64::new(0),
            pinned_skipped: AtomicU64::new(0),
            gc_time_ns: AtomicU64::new(0),
        }
    }

    /// Record an allocation.
    #[inline]
    pub fn record_allocation(&self, size: usize) {
        self.objects_allocated.fetch_add(1, Ordering::Relaxed);
        self.bytes_allocated
            .fetch_add(size as u64, Ordering::Relaxed);
    }

    /// Record a refused allocation.
    #[inline]
    pub fn record_allocation_failure(&self) {
        self.allocation_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a finished collection.
    pub fn record_collection(
        &self,
        duration: Duration,
        freed: usize,
        moved: usize,
        pinned_skipped: usize,
        compacted: bool,
        live: usize,
    ) {
        self.collections.fetch_add(1, Ordering::Relaxed);
        if compacted {
            self.compactions.fetch_add(1, Ordering::Relaxed);
        }
        self.objects_freed.fetch_add(freed as u64, Ordering::Relaxed);
        self.objects_moved.fetch_add(moved as u64, Ordering::Relaxed);
        self.pinned_skipped
            .fetch_add(pinned_skipped as u64, Ordering::Relaxed);
        self.gc_time_ns
            .fetch_add(duration.as_nanos() as u64, Ordering::Relaxed);
        self.live_objects.store(live as u64, Ordering::Relaxed);
    }

    /// Total time spent collecting.
    pub fn total_gc_time(&self) -> Duration {
        Duration::from_nanos(self.gc_time_ns.load(Ordering::Relaxed))
    }

    /// Average pause per collection.
    pub fn avg_pause(&self) -> Duration {
        let count = self.collections.load(Ordering::Relaxed);
        if count == 0 {
            return Duration::ZERO;
        }
        Duration::from_nanos(self.gc_time_ns.load(Ordering::Relaxed) / count)
    }

    /// Reset all statistics.
    pub fn reset(&self) {
        self.objects_allocated.store(0, Ordering::Relaxed);
        self.bytes_allocated.store(0, Ordering::Relaxed);
        self.live_objects.store(0, Ordering::Relaxed);
        self.allocation_failures.store(0, Ordering::Relaxed);
        self.collections.store(0, Ordering::Relaxed);
        self.compactions.store(0, Ordering::Relaxed);
        self.objects_freed.store(0, Ordering::Relaxed);
        self.objects_moved.store(0, Ordering::Relaxed);
        self.pinned_skipped.store(0, Ordering::Relaxed);
        self.gc_time_ns.store(0, Ordering::Relaxed);
    }

    /// Log a summary of collector activity.
    pub fn log_summary(&self) {
        log::info!(
            "gc: {} objects allocated ({}), {} live",
            self.objects_allocated.load(Ordering::Relaxed),
            format_bytes(self.bytes_allocated.load(Ordering::Relaxed)),
            self.live_objects.load(Ordering::Relaxed)
        );
        log::info!(
            "gc: {} collections ({} compacting), {} freed, {} moved, {:?} total ({:?} avg)",
            self.collections.load(Ordering::Relaxed),
            self.compactions.load(Ordering::Relaxed),
            self.objects_freed.load(Ordering::Relaxed),
            self.objects_moved.load(Ordering::Relaxed),
            self.total_gc_time(),
            self.avg_pause()
        );
    }
}

impl Default for GcStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Format bytes in human-readable form.
fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;

    if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} bytes", bytes)
    }
}

/// Timer for measuring a collection phase.
pub struct GcTimer {
    start: Instant,
    label: &'static str,
}

impl GcTimer {
    /// Start a new timer with the given label.
    pub fn start(label: &'static str) -> Self {
        Self {
            start: Instant::now(),
            label,
        }
    }

    /// Stop the timer and return the elapsed duration.
    pub fn stop(self) -> Duration {
        let elapsed = self.start.elapsed();
        log::trace!("gc {}: {:?}", self.label, elapsed);
        elapsed
    }
}
