//! Forwarding table produced by a compacting collection.

use rivet_core::{ObjRef, Value};
use rustc_hash::FxHashMap;

/// Old-slot to new-slot mapping for objects moved by compaction.
///
/// Objects absent from the table did not move.
#[derive(Debug, Default, Clone)]
pub struct Forwarding {
    moved: FxHashMap<ObjRef, ObjRef>,
}

impl Forwarding {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `from` now lives at `to`.
    #[inline]
    pub fn insert(&mut self, from: ObjRef, to: ObjRef) {
        self.moved.insert(from, to);
    }

    /// Current location of `obj`.
    #[inline]
    pub fn forward(&self, obj: ObjRef) -> ObjRef {
        self.moved.get(&obj).copied().unwrap_or(obj)
    }

    /// Rewrite a value if it references a moved object.
    #[inline]
    pub fn forward_value(&self, value: Value) -> Value {
        match value.as_ref() {
            Some(obj) if !self.moved.is_empty() => Value::reference(self.forward(obj)),
            _ => value,
        }
    }

    /// Rewrite a value in place.
    #[inline]
    pub fn update(&self, value: &mut Value) {
        *value = self.forward_value(*value);
    }

    /// Whether `obj` moved.
    pub fn moved(&self, obj: ObjRef) -> bool {
        self.moved.contains_key(&obj)
    }

    /// Number of moved objects.
    pub fn len(&self) -> usize {
        self.moved.len()
    }

    /// True if nothing moved.
    pub fn is_empty(&self) -> bool {
        self.moved.is_empty()
    }
}
