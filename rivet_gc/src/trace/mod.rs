//! Object tracing for garbage collection.
//!
//! The `Trace` trait is the interface between heap objects and the
//! collector: it reports outgoing references during marking, rewrites them
//! after compaction, and releases external resources when the object dies.

pub mod forwarding;
pub mod tracer;

pub use forwarding::Forwarding;
pub use tracer::{CollectingTracer, NullTracer, Tracer};

use rivet_core::Value;

/// Trait for types stored in the managed heap.
///
/// Implementations must:
/// 1. Report every value they hold from `trace`
/// 2. Rewrite every value they hold in `relocate`
///
/// A reference missed by `trace` is reclaimed while still in use; one
/// missed by `relocate` points at whatever compaction slid into the old
/// slot.
///
/// # Example
///
/// ```ignore
/// use rivet_gc::{Forwarding, Trace, Tracer};
///
/// struct Pair {
///     car: Value,
///     cdr: Value,
/// }
///
/// impl Trace for Pair {
///     fn trace(&self, tracer: &mut dyn Tracer) {
///         tracer.trace_value(self.car);
///         tracer.trace_value(self.cdr);
///     }
///
///     fn relocate(&mut self, fwd: &Forwarding) {
///         fwd.update(&mut self.car);
///         fwd.update(&mut self.cdr);
///     }
/// }
/// ```
pub trait Trace {
    /// Visit all object references held by this object.
    fn trace(&self, tracer: &mut dyn Tracer);

    /// Rewrite held references after compaction moved their targets.
    fn relocate(&mut self, fwd: &Forwarding);

    /// Called once when the object is reclaimed.
    ///
    /// Other heap objects may already be gone; do not reach into the heap
    /// from here.
    ///
    /// Default implementation does nothing.
    fn finalize(&mut self) {}

    /// Approximate size in bytes, for statistics.
    #[inline]
    fn size_of(&self) -> usize {
        std::mem::size_of_val(self)
    }
}

// =============================================================================
// Trace implementations for common containers
// =============================================================================

impl Trace for Value {
    #[inline]
    fn trace(&self, tracer: &mut dyn Tracer) {
        tracer.trace_value(*self);
    }

    #[inline]
    fn relocate(&mut self, fwd: &Forwarding) {
        fwd.update(self);
    }
}

impl<T: Trace> Trace for Option<T> {
    #[inline]
    fn trace(&self, tracer: &mut dyn Tracer) {
        if let Some(inner) = self {
            inner.trace(tracer);
        }
    }

    #[inline]
    fn relocate(&mut self, fwd: &Forwarding) {
        if let Some(inner) = self {
            inner.relocate(fwd);
        }
    }
}

impl<T: Trace> Trace for Vec<T> {
    fn trace(&self, tracer: &mut dyn Tracer) {
        for item in self {
            item.trace(tracer);
        }
    }

    fn relocate(&mut self, fwd: &Forwarding) {
        for item in self.iter_mut() {
            item.relocate(fwd);
        }
    }

    fn size_of(&self) -> usize {
        std::mem::size_of::<Self>() + self.capacity() * std::mem::size_of::<T>()
    }
}
