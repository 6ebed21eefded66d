//! Bridge configuration.

use rivet_gc::roots::MAX_HANDLE_ENTRIES;
use rivet_gc::{ConfigError as GcConfigError, GcConfig};
use thiserror::Error;

/// Configuration for a [`Runtime`](crate::Runtime).
///
/// # Example
///
/// ```ignore
/// use rivet_capi::{CapiConfig, Runtime};
///
/// let config = CapiConfig {
///     max_call_depth: 256,
///     ..Default::default()
/// };
/// let rt = Runtime::new(config)?;
/// ```
#[derive(Debug, Clone)]
pub struct CapiConfig {
    /// Heap and collector parameters.
    pub gc: GcConfig,

    /// Maximum live native handles.
    ///
    /// Exhausting the table is a fatal error in the extension.
    ///
    /// Default: 1,048,576
    pub max_handles: usize,

    /// Maximum nesting of managed calls before `SystemStackError`.
    ///
    /// Default: 1024
    pub max_call_depth: usize,

    /// Escalate buffer-view misuse to a fatal diagnostic.
    ///
    /// When false, checked view accessors only return the violation.
    ///
    /// Default: true
    pub strict_views: bool,
}

impl Default for CapiConfig {
    fn default() -> Self {
        Self {
            gc: GcConfig::default(),
            max_handles: 1 << 20,
            max_call_depth: 1024,
            strict_views: true,
        }
    }
}

impl CapiConfig {
    /// Collect and compact at every safepoint with strict checking.
    ///
    /// Intended for running extension test suites.
    pub fn stress() -> Self {
        Self {
            gc: GcConfig::stress(),
            ..Default::default()
        }
    }

    /// Small heap and handle table.
    pub fn low_memory() -> Self {
        Self {
            gc: GcConfig::low_memory(),
            max_handles: 1 << 14,
            max_call_depth: 256,
            ..Default::default()
        }
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.gc.validate()?;
        if self.max_handles == 0 || self.max_handles > MAX_HANDLE_ENTRIES {
            return Err(ConfigError::InvalidHandleCapacity(self.max_handles));
        }
        if self.max_call_depth == 0 {
            return Err(ConfigError::ZeroCallDepth);
        }
        Ok(())
    }
}

/// Configuration validation errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// Invalid collector configuration.
    #[error(transparent)]
    Gc(#[from] GcConfigError),
    /// Handle capacity is zero or beyond what the encoding can address.
    #[error("handle capacity {0} is out of range")]
    InvalidHandleCapacity(usize),
    /// Call depth must be at least 1.
    #[error("maximum call depth must be at least 1")]
    ZeroCallDepth,
}
