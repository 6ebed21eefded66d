//! Collector configuration parameters.
//!
//! Thresholds are counted in objects rather than bytes: the heap is a
//! slot arena and every object occupies exactly one slot.

use thiserror::Error;

/// Configuration for the managed heap and its collector.
///
/// # Example
///
/// ```ignore
/// use rivet_gc::GcConfig;
///
/// // Collect on every allocation safepoint, useful for shaking out
/// // missing roots in native extensions.
/// let config = GcConfig {
///     alloc_trigger: 1,
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone)]
pub struct GcConfig {
    // =========================================================================
    // Collection Triggers
    // =========================================================================
    /// Allocations since the last collection before one is requested.
    ///
    /// Allocation never collects on its own; crossing this threshold only
    /// raises a flag that the next safepoint honours.
    ///
    /// Default: 10,000
    pub alloc_trigger: usize,

    // =========================================================================
    // Capacity
    // =========================================================================
    /// Slots reserved up front.
    ///
    /// Default: 1024
    pub initial_capacity: usize,

    /// Maximum number of live objects before allocation fails.
    ///
    /// Set to 0 for unlimited.
    ///
    /// Default: 0 (unlimited)
    pub max_objects: usize,

    // =========================================================================
    // Compaction
    // =========================================================================
    /// Allow the collector to slide objects toward the start of the heap.
    ///
    /// Pinned objects are never moved regardless of this setting.
    ///
    /// Default: true
    pub compact: bool,

    /// Free-slot ratio that triggers a compacting cycle.
    ///
    /// Set to 1.0 to compact only when explicitly forced.
    ///
    /// Default: 0.25
    pub compaction_threshold: f64,

    // =========================================================================
    // Debugging
    // =========================================================================
    /// Log a summary line for every collection.
    ///
    /// Default: false
    pub trace: bool,

    /// Check every live reference after each collection.
    ///
    /// Default: false (enabled in debug builds)
    pub verify_heap: bool,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            alloc_trigger: 10_000,
            initial_capacity: 1024,
            max_objects: 0,
            compact: true,
            compaction_threshold: 0.25,
            trace: false,
            verify_heap: cfg!(debug_assertions),
        }
    }
}

impl GcConfig {
    /// Configuration for small embedded runtimes.
    pub fn low_memory() -> Self {
        Self {
            alloc_trigger: 2_000,
            initial_capacity: 128,
            compaction_threshold: 0.1,
            ..Default::default()
        }
    }

    /// Configuration that collects rarely and never moves objects.
    pub fn high_throughput() -> Self {
        Self {
            alloc_trigger: 100_000,
            initial_capacity: 16 * 1024,
            compact: false,
            ..Default::default()
        }
    }

    /// Collect and compact at every safepoint.
    ///
    /// Any handle or cached buffer that is not properly rooted shows up
    /// as a stale access almost immediately under this preset.
    pub fn stress() -> Self {
        Self {
            alloc_trigger: 1,
            initial_capacity: 16,
            compaction_threshold: 0.0,
            verify_heap: true,
            ..Default::default()
        }
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.alloc_trigger == 0 {
            return Err(ConfigError::ZeroAllocTrigger);
        }
        if !(0.0..=1.0).contains(&self.compaction_threshold) {
            return Err(ConfigError::InvalidCompactionThreshold);
        }
        if self.max_objects != 0 && self.max_objects < self.initial_capacity.min(16) {
            return Err(ConfigError::MaxObjectsTooSmall);
        }
        Ok(())
    }
}

/// Configuration validation errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// The allocation trigger must be at least 1.
    #[error("allocation trigger must be at least 1")]
    ZeroAllocTrigger,
    /// The compaction threshold is a ratio.
    #[error("compaction threshold must be between 0.0 and 1.0")]
    InvalidCompactionThreshold,
    /// A non-zero object limit must leave room for bootstrap objects.
    #[error("max_objects must be 0 (unlimited) or at least 16")]
    MaxObjectsTooSmall,
}
