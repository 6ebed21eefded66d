//! Root tracking.
//!
//! GC roots are the starting points for tracing:
//! - Handles held by native code ([`HandleTable`])
//! - Permanent runtime values such as bootstrap classes ([`RootSet`])
//! - Whatever else the embedding runtime reports through [`RootProvider`]

mod globals;
mod handles;

pub use globals::GlobalRegistry;
pub use handles::{Handle, HandleError, HandleTable, MAX_HANDLE_ENTRIES, ScopeExit, ScopeToken};

use crate::trace::{Forwarding, Tracer};
use rivet_core::Value;

/// Permanent roots.
#[derive(Debug, Default)]
pub struct RootSet {
    values: Vec<Value>,
}

impl RootSet {
    /// Create a new empty root set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a permanent root. Immediates are ignored.
    pub fn add(&mut self, value: Value) {
        if value.is_reference() {
            self.values.push(value);
        }
    }

    /// Remove one occurrence of a root.
    pub fn remove(&mut self, value: Value) -> bool {
        match self.values.iter().position(|v| *v == value) {
            Some(pos) => {
                self.values.swap_remove(pos);
                true
            }
            None => false,
        }
    }

    /// Number of roots.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// True if there are no roots.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl RootProvider for RootSet {
    fn trace_roots(&self, tracer: &mut dyn Tracer) {
        for value in &self.values {
            tracer.trace_value(*value);
        }
    }

    fn relocate_roots(&mut self, fwd: &Forwarding) {
        for value in &mut self.values {
            fwd.update(value);
        }
    }
}

impl RootProvider for HandleTable {
    fn trace_roots(&self, tracer: &mut dyn Tracer) {
        self.mark_roots(tracer);
    }

    fn relocate_roots(&mut self, fwd: &Forwarding) {
        self.relocate(fwd);
    }
}

/// Trait for types that can provide roots to the GC.
pub trait RootProvider {
    /// Trace all roots held by this provider.
    fn trace_roots(&self, tracer: &mut dyn Tracer);

    /// Rewrite held roots after compaction.
    fn relocate_roots(&mut self, fwd: &Forwarding);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::CollectingTracer;
    use rivet_core::ObjRef;

    #[test]
    fn test_root_set_ignores_immediates() {
        let mut roots = RootSet::new();
        roots.add(Value::NIL);
        roots.add(Value::reference(ObjRef(2)));
        assert_eq!(roots.len(), 1);

        let mut tracer = CollectingTracer::new();
        roots.trace_roots(&mut tracer);
        assert_eq!(tracer.refs, vec![ObjRef(2)]);
    }

    #[test]
    fn test_root_set_relocate() {
        let mut roots = RootSet::new();
        roots.add(Value::reference(ObjRef(5)));
        let mut fwd = Forwarding::new();
        fwd.insert(ObjRef(5), ObjRef(0));
        roots.relocate_roots(&fwd);
        assert!(roots.remove(Value::reference(ObjRef(0))));
        assert!(roots.is_empty());
    }
}
