//! Error types crossing the bridge.
//!
//! Two kinds of failure travel through this crate:
//!
//! - **Managed exceptions** ride the `Err` side of [`CapiResult`] as an
//!   [`Unwind`]. They are ordinary control flow and any enclosing
//!   `rescue`/`protect` can stop them.
//! - **Protocol violations** are bugs in native code (stale handles,
//!   retired views, out-of-order scope exits). They are reported as
//!   [`ProtocolViolation`] and normally escalated through
//!   [`bug`](crate::exception::bug).

use rivet_core::Value;
use rivet_gc::roots::HandleError;
use thiserror::Error;

// =============================================================================
// Unwinding
// =============================================================================

/// Non-local exit status, numerically compatible with the C API tags.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JumpTag {
    /// A raised exception.
    Raise = 6,
    /// A `fatal` error; skips `rescue` but is captured by `protect`.
    Fatal = 8,
}

impl JumpTag {
    /// Status code handed to native code by `protect`.
    #[inline]
    pub const fn status(self) -> i32 {
        self as i32
    }

    /// Decode a status code.
    pub const fn from_status(status: i32) -> Option<Self> {
        match status {
            6 => Some(JumpTag::Raise),
            8 => Some(JumpTag::Fatal),
            _ => None,
        }
    }
}

/// An exception in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Unwind {
    /// Why the stack is unwinding.
    pub tag: JumpTag,
    /// The exception object.
    pub exception: Value,
}

impl Unwind {
    /// Unwind for an ordinary raise.
    #[inline]
    pub const fn raise(exception: Value) -> Self {
        Self {
            tag: JumpTag::Raise,
            exception,
        }
    }
}

/// Result of any operation that may raise a managed exception.
pub type CapiResult<T> = Result<T, Unwind>;

// =============================================================================
// Protocol Violations
// =============================================================================

/// Identifier of a mutable buffer view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ViewId {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

/// Misuse of the bridge by native code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolViolation {
    /// Handle table misuse.
    #[error(transparent)]
    Handle(#[from] HandleError),

    /// The view's checkout window has closed.
    #[error("buffer view {0:?} used after its frame exited")]
    ViewRetired(ViewId),

    /// The view was superseded by a re-checkout.
    #[error("buffer view {0:?} is stale; check the object out again")]
    StaleView(ViewId),

    /// The object was resized after the view was checked out.
    #[error("object behind buffer view {0:?} was resized since checkout")]
    ObjectResized(ViewId),

    /// A read-only pointer outlived a resize of its object.
    #[error("read-only view of object #{0} invalidated by a resize")]
    ReadonlyResized(u32),

    /// The view does not hold the requested element kind.
    #[error("buffer view {0:?} holds a different element kind")]
    ViewKindMismatch(ViewId),

    /// A native method returned the "no value" marker.
    #[error("native method `{0}' returned undef")]
    UndefResult(String),

    /// A handle scope was closed out of order.
    #[error("native frame {expected} exited while frame {actual} is innermost")]
    FrameMismatch {
        /// Depth of the frame being exited.
        expected: u32,
        /// Depth of the innermost frame.
        actual: u32,
    },

    /// `jump_tag` was handed a status that no `protect` produced.
    #[error("unknown jump tag {0}")]
    UnknownJumpTag(i32),

    /// `jump_tag` found no pending exception to resume.
    #[error("jump_tag({0}) without a pending exception")]
    NothingToResume(i32),

    /// The native method arity disagrees with the function's shape.
    #[error("arity {declared} does not fit native function taking {actual}")]
    ArityMismatch {
        /// Arity passed at registration.
        declared: i32,
        /// Arity implied by the function pointer.
        actual: i32,
    },

    /// `push_ensure` with no native frame to attach to.
    #[error("ensure action registered outside a native frame")]
    NoNativeFrame,

    /// `scan_args` template could not be parsed.
    #[error("invalid argument template {0:?}")]
    InvalidArgSpec(String),
}

// =============================================================================
// Top-level Failures
// =============================================================================

/// An exception escaped every `rescue` and `protect`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("uncaught {class}: {message}")]
pub struct UncaughtException {
    /// Class name of the exception.
    pub class: String,
    /// Exception message.
    pub message: String,
    /// Backtrace lines, innermost first.
    pub backtrace: Vec<String>,
    /// Status that would have been reported.
    pub tag: JumpTag,
}
