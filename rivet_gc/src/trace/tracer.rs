//! Tracer interface for object graph traversal.

use rivet_core::{ObjRef, Value};

/// Tracer interface for visiting object references during GC.
///
/// The collector calls `trace()` on each reachable object, which reports
/// its outgoing references through this tracer.
///
/// # Example
///
/// ```ignore
/// struct MarkingTracer<'a> {
///     marks: &'a mut [bool],
///     worklist: &'a mut Vec<ObjRef>,
/// }
///
/// impl Tracer for MarkingTracer<'_> {
///     fn trace_ref(&mut self, obj: ObjRef) {
///         if !std::mem::replace(&mut self.marks[obj.index()], true) {
///             self.worklist.push(obj);
///         }
///     }
/// }
/// ```
pub trait Tracer {
    /// Trace a value that may contain an object reference.
    ///
    /// Immediates are ignored.
    #[inline]
    fn trace_value(&mut self, value: Value) {
        if let Some(obj) = value.as_ref() {
            self.trace_ref(obj);
        }
    }

    /// Mark an object slot as reachable.
    fn trace_ref(&mut self, obj: ObjRef);
}

/// A tracer that does nothing (for testing).
pub struct NullTracer;

impl Tracer for NullTracer {
    #[inline]
    fn trace_ref(&mut self, _obj: ObjRef) {}
}

/// A tracer that records every reference it sees.
#[derive(Debug, Default)]
pub struct CollectingTracer {
    /// References in visit order.
    pub refs: Vec<ObjRef>,
    /// Number of values traced, immediates included.
    pub value_count: usize,
}

impl CollectingTracer {
    /// Create an empty tracer.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Tracer for CollectingTracer {
    fn trace_value(&mut self, value: Value) {
        self.value_count += 1;
        if let Some(obj) = value.as_ref() {
            self.trace_ref(obj);
        }
    }

    fn trace_ref(&mut self, obj: ObjRef) {
        self.refs.push(obj);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_trace_value_skips_immediates() {
        let mut tracer = CollectingTracer::new();
        tracer.trace_value(Value::NIL);
        tracer.trace_value(Value::fixnum_unchecked(4));
        tracer.trace_value(Value::reference(ObjRef(3)));
        assert_eq!(tracer.value_count, 3);
        assert_eq!(tracer.refs, vec![ObjRef(3)]);
    }

    #[test]
    fn test_null_tracer() {
        let mut tracer = NullTracer;
        tracer.trace_value(Value::reference(ObjRef(1)));
        tracer.trace_ref(ObjRef(2));
    }
}
