//! Native handles and the scoped handle table.
//!
//! Native code never sees heap slot indices. It holds [`Handle`]s: words
//! that are bit-identical to [`Value`] for immediates and, for references,
//! name an entry in the [`HandleTable`]. The table entry keeps the object
//! alive and tracks it across compaction, so a handle stays valid for as
//! long as its scope does.
//!
//! # Handle Encoding
//!
//! ```text
//!  63                 32 31                      7 6     0
//! ┌─────────────────────┬─────────────────────────┬───────┐
//! │     generation      │      entry index + 1    │ 00000 │
//! └─────────────────────┴─────────────────────────┴───────┘
//! ```
//!
//! Freeing an entry bumps its generation, so a handle that outlives its
//! entry is detected rather than silently aliasing the next occupant.
//!
//! # Scopes
//!
//! Scope 0 is the global scope and is never popped. Every other scope
//! belongs to one native frame. A handle is owned by the scope that first
//! acquired it; re-acquiring the same object from an inner scope returns
//! the same handle and records a borrow.

use crate::trace::{Forwarding, Tracer};
use rivet_core::value::{NIL_BITS, REFERENCE_MASK, REFERENCE_SHIFT, SYMBOL_MASK, SYMBOL_TAG};
use rivet_core::{ObjRef, Value};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use std::fmt;
use thiserror::Error;

/// Largest number of table entries the encoding can address.
pub const MAX_HANDLE_ENTRIES: usize = (1 << (32 - REFERENCE_SHIFT)) - 1;

// =============================================================================
// Handle
// =============================================================================

/// A native-facing value word.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(u64);

impl Handle {
    /// `false`.
    pub const FALSE: Handle = Handle(Value::FALSE.bits());
    /// `true`.
    pub const TRUE: Handle = Handle(Value::TRUE.bits());
    /// `nil`.
    pub const NIL: Handle = Handle(Value::NIL.bits());
    /// The "no value" marker.
    pub const UNDEF: Handle = Handle(Value::UNDEF.bits());

    /// Reinterpret a raw word.
    #[inline]
    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    /// Raw word.
    #[inline]
    pub const fn bits(self) -> u64 {
        self.0
    }

    /// Encode a boolean.
    #[inline]
    pub const fn bool(b: bool) -> Self {
        if b { Self::TRUE } else { Self::FALSE }
    }

    /// Wrap an immediate value; `None` for references.
    #[inline]
    pub const fn from_immediate(value: Value) -> Option<Self> {
        if value.is_reference() {
            None
        } else {
            Some(Self(value.bits()))
        }
    }

    /// The immediate this handle carries; `None` for references.
    #[inline]
    pub const fn as_immediate(self) -> Option<Value> {
        if self.is_reference() {
            None
        } else {
            Some(Value::from_bits(self.0))
        }
    }

    /// Truth test: everything except `false` and `nil` is truthy.
    #[inline(always)]
    pub const fn test(self) -> bool {
        self.0 & !NIL_BITS != 0
    }

    /// True if this handle names a table entry.
    #[inline(always)]
    pub const fn is_reference(self) -> bool {
        self.0 != 0 && self.0 & REFERENCE_MASK == 0
    }

    /// True for `nil`.
    #[inline(always)]
    pub const fn is_nil(self) -> bool {
        self.0 == NIL_BITS
    }

    /// True for the undefined marker.
    #[inline(always)]
    pub const fn is_undef(self) -> bool {
        self.0 == Value::UNDEF.bits()
    }

    /// True for an immediate integer.
    #[inline(always)]
    pub const fn is_fixnum(self) -> bool {
        self.0 & 1 != 0
    }

    /// True for an immediate symbol.
    #[inline(always)]
    pub const fn is_symbol(self) -> bool {
        self.0 & SYMBOL_MASK == SYMBOL_TAG
    }

    #[inline]
    const fn encode(index: u32, generation: u32) -> Self {
        Self(((generation as u64) << 32) | ((index as u64 + 1) << REFERENCE_SHIFT))
    }

    /// Entry index and generation of a reference handle.
    #[inline]
    const fn decode(self) -> Option<(u32, u32)> {
        if !self.is_reference() {
            return None;
        }
        let low = self.0 & 0xffff_ffff;
        if low == 0 {
            return None;
        }
        Some((((low >> REFERENCE_SHIFT) - 1) as u32, (self.0 >> 32) as u32))
    }
}

impl Default for Handle {
    fn default() -> Self {
        Self::NIL
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.decode() {
            Some((index, generation)) => write!(f, "Handle(#{index} gen {generation})"),
            None => write!(f, "Handle({:?})", Value::from_bits(self.0)),
        }
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Handle table misuse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum HandleError {
    /// The handle's entry has been released.
    #[error("stale handle {0:?}")]
    Stale(Handle),
    /// The word does not name any entry.
    #[error("invalid handle {0:?}")]
    Invalid(Handle),
    /// The handle belongs to an outer scope.
    #[error("handle {handle:?} owned by scope {owner} released from scope {current}")]
    OutOfOrderRelease {
        /// The handle being released.
        handle: Handle,
        /// Owning scope depth.
        owner: u32,
        /// Innermost scope depth.
        current: u32,
    },
    /// A scope was popped out of order.
    #[error("scope {actual} popped while scope {expected} is innermost")]
    ScopeMismatch {
        /// Innermost scope depth.
        expected: u32,
        /// Depth of the popped token.
        actual: u32,
    },
    /// All entries are in use.
    #[error("handle table exhausted ({capacity} entries)")]
    Exhausted {
        /// Configured capacity.
        capacity: usize,
    },
}

// =============================================================================
// Handle Table
// =============================================================================

#[derive(Debug, Clone, Copy)]
struct Entry {
    object: Option<ObjRef>,
    generation: u32,
    owner: u32,
}

#[derive(Debug, Default)]
struct ScopeFrame {
    owned: SmallVec<[u32; 8]>,
    borrowed: SmallVec<[u32; 4]>,
}

/// Proof of an open scope, consumed by [`HandleTable::pop_scope`].
#[must_use = "a pushed scope must be popped"]
#[derive(Debug)]
pub struct ScopeToken {
    depth: u32,
}

impl ScopeToken {
    /// Depth of the scope this token opened.
    pub fn depth(&self) -> u32 {
        self.depth
    }
}

/// Outcome of popping a scope.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ScopeExit {
    /// Entries released.
    pub released: usize,
    /// Entries moved to the global scope.
    pub promoted: usize,
}

/// Table of live native handles.
pub struct HandleTable {
    entries: Vec<Entry>,
    free: Vec<u32>,
    by_object: FxHashMap<ObjRef, u32>,
    scopes: Vec<ScopeFrame>,
    capacity: usize,
}

impl HandleTable {
    /// Create a table holding at most `capacity` live entries.
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::new(),
            free: Vec::new(),
            by_object: FxHashMap::default(),
            scopes: vec![ScopeFrame::default()],
            capacity: capacity.min(MAX_HANDLE_ENTRIES),
        }
    }

    // =========================================================================
    // Scopes
    // =========================================================================

    /// Innermost scope depth; 0 is the global scope.
    #[inline]
    pub fn depth(&self) -> u32 {
        (self.scopes.len() - 1) as u32
    }

    /// Open a new innermost scope.
    pub fn push_scope(&mut self) -> ScopeToken {
        self.scopes.push(ScopeFrame::default());
        ScopeToken {
            depth: self.depth(),
        }
    }

    /// Close the innermost scope.
    ///
    /// Every handle the scope owns is released unless `keep` returns true
    /// for it, in which case it moves to the global scope.
    pub fn pop_scope(
        &mut self,
        token: ScopeToken,
        mut keep: impl FnMut(Handle) -> bool,
    ) -> Result<ScopeExit, HandleError> {
        let current = self.depth();
        if token.depth != current || token.depth == 0 {
            return Err(HandleError::ScopeMismatch {
                expected: current,
                actual: token.depth,
            });
        }
        let frame = self.scopes.pop().unwrap_or_default();
        let mut exit = ScopeExit::default();
        for index in frame.owned {
            let entry = &mut self.entries[index as usize];
            let handle = Handle::encode(index, entry.generation);
            if keep(handle) {
                entry.owner = 0;
                self.scopes[0].owned.push(index);
                exit.promoted += 1;
            } else {
                self.free_entry(index);
                exit.released += 1;
            }
        }
        Ok(exit)
    }

    // =========================================================================
    // Acquire / Release
    // =========================================================================

    /// Handle for `obj` in the innermost scope.
    ///
    /// Acquiring an object that already has a handle returns that handle.
    pub fn acquire(&mut self, obj: ObjRef) -> Result<Handle, HandleError> {
        let current = self.depth();
        if let Some(&index) = self.by_object.get(&obj) {
            let entry = self.entries[index as usize];
            if entry.owner != current {
                let borrowed = &mut self.scopes[current as usize].borrowed;
                if !borrowed.contains(&index) {
                    borrowed.push(index);
                }
            }
            return Ok(Handle::encode(index, entry.generation));
        }
        self.insert_entry(obj, current)
    }

    /// Handle for `obj` that lives at least as long as the scope at
    /// `depth`.
    ///
    /// An existing handle owned by a scope inside `depth` is handed out
    /// to `depth`; it stays valid for the inner scopes that use it.
    pub fn acquire_at(&mut self, obj: ObjRef, depth: u32) -> Result<Handle, HandleError> {
        let current = self.depth();
        if depth > current {
            return Err(HandleError::ScopeMismatch {
                expected: current,
                actual: depth,
            });
        }
        if depth == current {
            return self.acquire(obj);
        }
        let Some(&index) = self.by_object.get(&obj) else {
            return self.insert_entry(obj, depth);
        };
        let owner = self.entries[index as usize].owner;
        if owner > depth {
            let owned = &mut self.scopes[owner as usize].owned;
            if let Some(pos) = owned.iter().position(|&i| i == index) {
                owned.swap_remove(pos);
            }
            self.entries[index as usize].owner = depth;
            self.scopes[depth as usize].owned.push(index);
        } else if owner < depth {
            let borrowed = &mut self.scopes[depth as usize].borrowed;
            if !borrowed.contains(&index) {
                borrowed.push(index);
            }
        }
        Ok(Handle::encode(index, self.entries[index as usize].generation))
    }

    fn insert_entry(&mut self, obj: ObjRef, owner: u32) -> Result<Handle, HandleError> {
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                if self.entries.len() >= self.capacity {
                    return Err(HandleError::Exhausted {
                        capacity: self.capacity,
                    });
                }
                self.entries.push(Entry {
                    object: None,
                    generation: 0,
                    owner: 0,
                });
                (self.entries.len() - 1) as u32
            }
        };
        let entry = &mut self.entries[index as usize];
        entry.object = Some(obj);
        entry.owner = owner;
        let generation = entry.generation;
        self.scopes[owner as usize].owned.push(index);
        self.by_object.insert(obj, index);
        Ok(Handle::encode(index, generation))
    }

    /// Handle for any value; immediates pass through unchanged.
    pub fn acquire_value(&mut self, value: Value) -> Result<Handle, HandleError> {
        match value.as_ref() {
            Some(obj) => self.acquire(obj),
            None => Ok(Handle(value.bits())),
        }
    }

    /// Release a handle before its scope closes.
    ///
    /// Immediates and borrowed handles are no-ops; releasing a handle
    /// owned by an outer scope is an error.
    pub fn release(&mut self, handle: Handle) -> Result<(), HandleError> {
        if !handle.is_reference() {
            return Ok(());
        }
        let index = self.live_index(handle)?;
        let current = self.depth();
        let borrowed = &mut self.scopes[current as usize].borrowed;
        if let Some(pos) = borrowed.iter().position(|&i| i == index) {
            borrowed.swap_remove(pos);
            return Ok(());
        }
        let owner = self.entries[index as usize].owner;
        if owner != current {
            return Err(HandleError::OutOfOrderRelease {
                handle,
                owner,
                current,
            });
        }
        let owned = &mut self.scopes[current as usize].owned;
        if let Some(pos) = owned.iter().position(|&i| i == index) {
            owned.swap_remove(pos);
        }
        self.free_entry(index);
        Ok(())
    }

    /// Move a handle into the global scope so it survives its frame.
    pub fn promote(&mut self, handle: Handle) -> Result<(), HandleError> {
        if !handle.is_reference() {
            return Ok(());
        }
        let index = self.live_index(handle)?;
        let owner = self.entries[index as usize].owner;
        if owner == 0 {
            return Ok(());
        }
        let owned = &mut self.scopes[owner as usize].owned;
        if let Some(pos) = owned.iter().position(|&i| i == index) {
            owned.swap_remove(pos);
        }
        self.entries[index as usize].owner = 0;
        self.scopes[0].owned.push(index);
        Ok(())
    }

    /// Hand a handle owned by the innermost scope to the scope just
    /// outside it, so it survives the innermost scope's exit.
    ///
    /// Handles already owned further out are left alone.
    pub fn reparent(&mut self, handle: Handle) -> Result<(), HandleError> {
        if !handle.is_reference() {
            return Ok(());
        }
        let index = self.live_index(handle)?;
        let current = self.depth();
        let owner = self.entries[index as usize].owner;
        if owner != current || current == 0 {
            return Ok(());
        }
        let owned = &mut self.scopes[current as usize].owned;
        if let Some(pos) = owned.iter().position(|&i| i == index) {
            owned.swap_remove(pos);
        }
        let parent = current - 1;
        self.entries[index as usize].owner = parent;
        self.scopes[parent as usize].owned.push(index);
        Ok(())
    }

    /// Release a handle held by the global scope.
    pub fn release_global(&mut self, handle: Handle) -> Result<(), HandleError> {
        if !handle.is_reference() {
            return Ok(());
        }
        let index = self.live_index(handle)?;
        let owner = self.entries[index as usize].owner;
        if owner != 0 {
            return Err(HandleError::OutOfOrderRelease {
                handle,
                owner,
                current: 0,
            });
        }
        let owned = &mut self.scopes[0].owned;
        if let Some(pos) = owned.iter().position(|&i| i == index) {
            owned.swap_remove(pos);
        }
        self.free_entry(index);
        Ok(())
    }

    // =========================================================================
    // Resolution
    // =========================================================================

    /// Object named by a reference handle.
    #[inline]
    pub fn resolve(&self, handle: Handle) -> Result<ObjRef, HandleError> {
        let index = self.live_index(handle)?;
        self.entries[index as usize]
            .object
            .ok_or(HandleError::Stale(handle))
    }

    /// Value named by any handle; immediates pass through unchanged.
    #[inline]
    pub fn resolve_value(&self, handle: Handle) -> Result<Value, HandleError> {
        if handle.is_reference() {
            self.resolve(handle).map(Value::reference)
        } else {
            Ok(Value::from_bits(handle.0))
        }
    }

    /// Whether `handle` is an immediate or a live reference.
    pub fn is_valid(&self, handle: Handle) -> bool {
        !handle.is_reference() || self.live_index(handle).is_ok()
    }

    /// Scope depth owning a reference handle.
    pub fn owner_of(&self, handle: Handle) -> Result<u32, HandleError> {
        let index = self.live_index(handle)?;
        Ok(self.entries[index as usize].owner)
    }

    /// The existing handle for `obj`, if any.
    pub fn handle_of(&self, obj: ObjRef) -> Option<Handle> {
        let &index = self.by_object.get(&obj)?;
        Some(Handle::encode(index, self.entries[index as usize].generation))
    }

    // =========================================================================
    // Accounting
    // =========================================================================

    /// Number of live entries.
    #[inline]
    pub fn live_count(&self) -> usize {
        self.by_object.len()
    }

    /// Entries owned by the scope at `depth`.
    pub fn owned_in_scope(&self, depth: u32) -> usize {
        self.scopes
            .get(depth as usize)
            .map_or(0, |frame| frame.owned.len())
    }

    /// Configured capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    // =========================================================================
    // Collector Interface
    // =========================================================================

    /// Report every live entry's object exactly once.
    pub fn mark_roots(&self, tracer: &mut dyn Tracer) {
        for obj in self.by_object.keys() {
            tracer.trace_ref(*obj);
        }
    }

    /// Follow objects moved by compaction. Handles stay valid.
    pub fn relocate(&mut self, fwd: &Forwarding) {
        if fwd.is_empty() {
            return;
        }
        self.by_object.clear();
        for (index, entry) in self.entries.iter_mut().enumerate() {
            if let Some(obj) = entry.object.as_mut() {
                *obj = fwd.forward(*obj);
                self.by_object.insert(*obj, index as u32);
            }
        }
    }

    fn live_index(&self, handle: Handle) -> Result<u32, HandleError> {
        let (index, generation) = handle.decode().ok_or(HandleError::Invalid(handle))?;
        match self.entries.get(index as usize) {
            Some(entry) if entry.generation == generation && entry.object.is_some() => Ok(index),
            Some(_) => Err(HandleError::Stale(handle)),
            None => Err(HandleError::Invalid(handle)),
        }
    }

    fn free_entry(&mut self, index: u32) {
        let entry = &mut self.entries[index as usize];
        if let Some(obj) = entry.object.take() {
            self.by_object.remove(&obj);
        }
        entry.generation = entry.generation.wrapping_add(1);
        entry.owner = 0;
        self.free.push(index);
    }
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new(MAX_HANDLE_ENTRIES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::CollectingTracer;

    // =========================================================================
    // Encoding
    // =========================================================================

    #[test]
    fn test_immediates_are_bit_identical() {
        for v in [
            Value::FALSE,
            Value::TRUE,
            Value::NIL,
            Value::fixnum_unchecked(-9),
            Value::symbol(rivet_core::SymbolId(3)),
        ] {
            let h = Handle::from_immediate(v).unwrap();
            assert_eq!(h.bits(), v.bits());
            assert_eq!(h.as_immediate(), Some(v));
            assert!(!h.is_reference());
        }
        assert!(Handle::from_immediate(Value::reference(ObjRef(0))).is_none());
    }

    #[test]
    fn test_reference_handles_are_truthy() {
        let mut table = HandleTable::default();
        for i in 0..200 {
            let h = table.acquire(ObjRef(i)).unwrap();
            assert!(h.is_reference());
            assert!(h.test());
            assert!(!h.is_fixnum());
            assert!(!h.is_symbol());
        }
        assert!(!Handle::NIL.test());
        assert!(!Handle::FALSE.test());
    }

    // =========================================================================
    // Acquire / Release
    // =========================================================================

    mod lifecycle {
        use super::*;

        #[test]
        fn test_acquire_is_idempotent() {
            let mut table = HandleTable::default();
            let a = table.acquire(ObjRef(7)).unwrap();
            let b = table.acquire(ObjRef(7)).unwrap();
            assert_eq!(a, b);
            assert_eq!(table.live_count(), 1);
            assert_eq!(table.resolve(a), Ok(ObjRef(7)));
        }

        #[test]
        fn test_release_then_use_is_stale() {
            let mut table = HandleTable::default();
            let h = table.acquire(ObjRef(1)).unwrap();
            table.release(h).unwrap();
            assert_eq!(table.resolve(h), Err(HandleError::Stale(h)));
            assert_eq!(table.release(h), Err(HandleError::Stale(h)));
        }

        #[test]
        fn test_reused_entry_gets_new_generation() {
            let mut table = HandleTable::default();
            let old = table.acquire(ObjRef(1)).unwrap();
            table.release(old).unwrap();
            let new = table.acquire(ObjRef(2)).unwrap();
            assert_ne!(old, new);
            assert_eq!(table.resolve(new), Ok(ObjRef(2)));
            assert!(table.resolve(old).is_err());
        }

        #[test]
        fn test_immediate_release_is_noop() {
            let mut table = HandleTable::default();
            assert!(table.release(Handle::NIL).is_ok());
            assert_eq!(table.resolve_value(Handle::TRUE), Ok(Value::TRUE));
        }

        #[test]
        fn test_invalid_word() {
            let table = HandleTable::default();
            let bogus = Handle::encode(500, 0);
            assert_eq!(table.resolve(bogus), Err(HandleError::Invalid(bogus)));
        }

        #[test]
        fn test_capacity_exhausted() {
            let mut table = HandleTable::new(2);
            table.acquire(ObjRef(0)).unwrap();
            table.acquire(ObjRef(1)).unwrap();
            assert_eq!(
                table.acquire(ObjRef(2)),
                Err(HandleError::Exhausted { capacity: 2 })
            );
        }
    }

    // =========================================================================
    // Scopes
    // =========================================================================

    mod scopes {
        use super::*;

        #[test]
        fn test_pop_releases_owned() {
            let mut table = HandleTable::default();
            let scope = table.push_scope();
            let h = table.acquire(ObjRef(3)).unwrap();
            let exit = table.pop_scope(scope, |_| false).unwrap();
            assert_eq!(exit.released, 1);
            assert!(!table.is_valid(h));
            assert_eq!(table.live_count(), 0);
        }

        #[test]
        fn test_inner_acquire_borrows_outer_handle() {
            let mut table = HandleTable::default();
            let outer = table.push_scope();
            let h = table.acquire(ObjRef(3)).unwrap();

            let inner = table.push_scope();
            let again = table.acquire(ObjRef(3)).unwrap();
            assert_eq!(h, again);
            // Releasing a borrow leaves the outer handle alive.
            table.release(again).unwrap();
            assert!(table.is_valid(h));
            table.pop_scope(inner, |_| false).unwrap();

            assert!(table.is_valid(h));
            assert_eq!(table.owner_of(h), Ok(outer.depth()));
            table.pop_scope(outer, |_| false).unwrap();
            assert!(!table.is_valid(h));
        }

        #[test]
        fn test_out_of_order_release() {
            let mut table = HandleTable::default();
            let outer = table.push_scope();
            let h = table.acquire(ObjRef(3)).unwrap();
            let inner = table.push_scope();
            assert_eq!(
                table.release(h),
                Err(HandleError::OutOfOrderRelease {
                    handle: h,
                    owner: 1,
                    current: 2
                })
            );
            table.pop_scope(inner, |_| false).unwrap();
            table.pop_scope(outer, |_| false).unwrap();
        }

        #[test]
        fn test_scope_mismatch() {
            let mut table = HandleTable::default();
            let outer = table.push_scope();
            let inner = table.push_scope();
            assert_eq!(
                table.pop_scope(outer, |_| false),
                Err(HandleError::ScopeMismatch {
                    expected: 2,
                    actual: 1
                })
            );
            table.pop_scope(inner, |_| false).unwrap();
        }

        #[test]
        fn test_acquire_at_outer_scope() {
            let mut table = HandleTable::default();
            let outer = table.push_scope();
            let inner = table.push_scope();
            let moved = table.acquire(ObjRef(1)).unwrap();
            let handed_out = table.acquire_at(ObjRef(1), outer.depth()).unwrap();
            assert_eq!(moved, handed_out);
            let fresh = table.acquire_at(ObjRef(2), outer.depth()).unwrap();
            assert_eq!(table.owner_of(fresh), Ok(1));
            assert_eq!(
                table.acquire_at(ObjRef(3), 5),
                Err(HandleError::ScopeMismatch {
                    expected: 2,
                    actual: 5
                })
            );
            table.pop_scope(inner, |_| false).unwrap();
            assert!(table.is_valid(moved));
            assert!(table.is_valid(fresh));
            table.pop_scope(outer, |_| false).unwrap();
            assert!(!table.is_valid(moved));
        }

        #[test]
        fn test_keep_promotes_to_global() {
            let mut table = HandleTable::default();
            let scope = table.push_scope();
            let kept = table.acquire(ObjRef(1)).unwrap();
            let dropped = table.acquire(ObjRef(2)).unwrap();
            let exit = table.pop_scope(scope, |h| h == kept).unwrap();
            assert_eq!(exit, ScopeExit { released: 1, promoted: 1 });
            assert!(table.is_valid(kept));
            assert!(!table.is_valid(dropped));
            assert_eq!(table.owner_of(kept), Ok(0));
            table.release_global(kept).unwrap();
            assert!(!table.is_valid(kept));
        }

        #[test]
        fn test_reparent_moves_one_level_out() {
            let mut table = HandleTable::default();
            let outer = table.push_scope();
            let inner = table.push_scope();
            let h = table.acquire(ObjRef(5)).unwrap();
            table.reparent(h).unwrap();
            table.pop_scope(inner, |_| false).unwrap();
            assert_eq!(table.owner_of(h), Ok(1));
            assert_eq!(table.acquire(ObjRef(5)), Ok(h));
            table.pop_scope(outer, |_| false).unwrap();
            assert!(!table.is_valid(h));
        }

        #[test]
        fn test_explicit_promote() {
            let mut table = HandleTable::default();
            let scope = table.push_scope();
            let h = table.acquire(ObjRef(9)).unwrap();
            table.promote(h).unwrap();
            table.pop_scope(scope, |_| false).unwrap();
            assert_eq!(table.resolve(h), Ok(ObjRef(9)));
        }
    }

    // =========================================================================
    // Collector Interface
    // =========================================================================

    #[test]
    fn test_mark_roots_visits_each_object_once() {
        let mut table = HandleTable::default();
        table.acquire(ObjRef(1)).unwrap();
        let scope = table.push_scope();
        table.acquire(ObjRef(1)).unwrap();
        table.acquire(ObjRef(2)).unwrap();

        let mut tracer = CollectingTracer::new();
        table.mark_roots(&mut tracer);
        tracer.refs.sort();
        assert_eq!(tracer.refs, vec![ObjRef(1), ObjRef(2)]);
        table.pop_scope(scope, |_| false).unwrap();
    }

    #[test]
    fn test_relocate_keeps_handles_valid() {
        let mut table = HandleTable::default();
        let h = table.acquire(ObjRef(10)).unwrap();
        let mut fwd = Forwarding::new();
        fwd.insert(ObjRef(10), ObjRef(0));
        table.relocate(&fwd);
        assert_eq!(table.resolve(h), Ok(ObjRef(0)));
        assert_eq!(table.handle_of(ObjRef(0)), Some(h));
        assert_eq!(table.handle_of(ObjRef(10)), None);
    }
}
