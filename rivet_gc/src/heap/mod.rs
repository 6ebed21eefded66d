//! Slot-arena heap.
//!
//! Every object occupies one slot addressed by an [`ObjRef`]. Freed slots
//! are threaded onto a free list kept in ascending order after each
//! collection, so new objects fill the low end of the arena first and
//! compaction has less to move.
//!
//! ```text
//!   slot:   0     1     2     3     4     5
//!         ┌─────┬─────┬─────┬─────┬─────┬─────┐
//!         │ obj │free │ obj │ obj │free │ obj │
//!         └─────┴──┬──┴─────┴─────┴──▲──┴─────┘
//!                  └─────────────────┘
//!   free_head ─► 1 ─► 4 ─► None
//! ```
//!
//! Allocation never collects. Crossing the configured allocation trigger
//! only sets [`Heap::gc_requested`]; the owner decides when it is safe to
//! run the collector.

use crate::config::GcConfig;
use crate::stats::GcStats;
use crate::trace::{CollectingTracer, Forwarding, Trace};

use rivet_core::ObjRef;
use thiserror::Error;

/// Allocation failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AllocError {
    /// The configured object limit has been reached.
    #[error("heap exhausted: {limit} live objects")]
    OutOfMemory {
        /// The configured `max_objects`.
        limit: usize,
    },
    /// The slot index space is exhausted.
    #[error("heap slot space exhausted")]
    SlotSpaceExhausted,
}

struct Cell<T> {
    object: T,
    pins: u32,
}

enum Slot<T> {
    Free { next: Option<u32> },
    Live(Cell<T>),
}

impl<T> Slot<T> {
    #[inline]
    fn is_live(&self) -> bool {
        matches!(self, Slot::Live(_))
    }
}

/// Managed heap of `T` objects.
pub struct Heap<T> {
    /// Configuration parameters.
    config: GcConfig,

    /// Object slots, live or free.
    slots: Vec<Slot<T>>,

    /// First free slot.
    free_head: Option<u32>,

    /// Live object count.
    live: usize,

    /// Allocations since the last collection.
    allocated_since_gc: usize,

    /// Set by `request_collection` regardless of the trigger.
    forced: bool,

    /// Heap statistics.
    stats: GcStats,
}

impl<T: Trace> Heap<T> {
    /// Create an empty heap.
    pub fn new(config: GcConfig) -> Self {
        Self {
            slots: Vec::with_capacity(config.initial_capacity),
            config,
            free_head: None,
            live: 0,
            allocated_since_gc: 0,
            forced: false,
            stats: GcStats::new(),
        }
    }

    // =========================================================================
    // Allocation
    // =========================================================================

    /// Allocate a new object.
    ///
    /// Fails when the object limit is reached; never triggers collection.
    pub fn alloc(&mut self, object: T) -> Result<ObjRef, AllocError> {
        if self.config.max_objects != 0 && self.live >= self.config.max_objects {
            self.stats.record_allocation_failure();
            return Err(AllocError::OutOfMemory {
                limit: self.config.max_objects,
            });
        }

        let size = object.size_of();
        let cell = Cell { object, pins: 0 };
        let index = match self.free_head {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                self.free_head = match slot {
                    Slot::Free { next } => *next,
                    Slot::Live(_) => unreachable!("free list names a live slot"),
                };
                *slot = Slot::Live(cell);
                index
            }
            None => {
                let index = u32::try_from(self.slots.len())
                    .map_err(|_| AllocError::SlotSpaceExhausted)?;
                if index == u32::MAX {
                    return Err(AllocError::SlotSpaceExhausted);
                }
                self.slots.push(Slot::Live(cell));
                index
            }
        };

        self.live += 1;
        self.allocated_since_gc += 1;
        self.stats.record_allocation(size);
        Ok(ObjRef(index))
    }

    /// True once enough allocation has happened that a collection is due.
    #[inline]
    pub fn gc_requested(&self) -> bool {
        self.forced || self.allocated_since_gc >= self.config.alloc_trigger
    }

    /// Ask for a collection at the next safepoint.
    pub fn request_collection(&mut self) {
        self.forced = true;
    }

    // =========================================================================
    // Access
    // =========================================================================

    /// Borrow a live object.
    #[inline]
    pub fn get(&self, obj: ObjRef) -> Option<&T> {
        match self.slots.get(obj.index()) {
            Some(Slot::Live(cell)) => Some(&cell.object),
            _ => None,
        }
    }

    /// Mutably borrow a live object.
    #[inline]
    pub fn get_mut(&mut self, obj: ObjRef) -> Option<&mut T> {
        match self.slots.get_mut(obj.index()) {
            Some(Slot::Live(cell)) => Some(&mut cell.object),
            _ => None,
        }
    }

    /// Whether `obj` names a live slot.
    #[inline]
    pub fn contains(&self, obj: ObjRef) -> bool {
        matches!(self.slots.get(obj.index()), Some(Slot::Live(_)))
    }

    /// Iterate live objects in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (ObjRef, &T)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| match slot {
                Slot::Live(cell) => Some((ObjRef(i as u32), &cell.object)),
                Slot::Free { .. } => None,
            })
    }

    // =========================================================================
    // Pinning
    // =========================================================================

    /// Pin an object so compaction leaves it in place.
    ///
    /// Pins nest; each `pin` needs a matching `unpin`.
    pub fn pin(&mut self, obj: ObjRef) -> bool {
        match self.slots.get_mut(obj.index()) {
            Some(Slot::Live(cell)) => {
                cell.pins += 1;
                true
            }
            _ => false,
        }
    }

    /// Drop one pin.
    pub fn unpin(&mut self, obj: ObjRef) -> bool {
        match self.slots.get_mut(obj.index()) {
            Some(Slot::Live(cell)) if cell.pins > 0 => {
                cell.pins -= 1;
                true
            }
            _ => false,
        }
    }

    /// Whether any pin is held on `obj`.
    #[inline]
    pub fn is_pinned(&self, obj: ObjRef) -> bool {
        matches!(self.slots.get(obj.index()), Some(Slot::Live(cell)) if cell.pins > 0)
    }

    // =========================================================================
    // Accounting
    // =========================================================================

    /// Number of live objects.
    #[inline]
    pub fn live_count(&self) -> usize {
        self.live
    }

    /// Number of slots, live or free.
    #[inline]
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Fraction of slots that are free.
    pub fn fragmentation(&self) -> f64 {
        if self.slots.is_empty() {
            0.0
        } else {
            (self.slots.len() - self.live) as f64 / self.slots.len() as f64
        }
    }

    /// Configuration parameters.
    pub fn config(&self) -> &GcConfig {
        &self.config
    }

    /// Heap statistics.
    pub fn stats(&self) -> &GcStats {
        &self.stats
    }

    // =========================================================================
    // Collector Interface
    // =========================================================================

    /// Reclaim every live slot not set in `marks`, finalizing each.
    pub(crate) fn sweep(&mut self, marks: &[bool]) -> usize {
        let mut freed = 0;
        for (i, slot) in self.slots.iter_mut().enumerate() {
            if !slot.is_live() || marks.get(i).copied().unwrap_or(false) {
                continue;
            }
            if let Slot::Live(mut cell) = std::mem::replace(slot, Slot::Free { next: None }) {
                cell.object.finalize();
            }
            freed += 1;
        }
        self.live -= freed;
        self.rebuild_free_list();
        freed
    }

    /// Slide unpinned objects into the lowest free slots.
    ///
    /// Returns the forwarding table and the number of pinned objects
    /// that stayed put. Objects are not yet relocated; see
    /// [`Heap::relocate_all`].
    pub(crate) fn compact(&mut self) -> (Forwarding, usize) {
        let mut fwd = Forwarding::new();
        let mut pinned_skipped = 0;
        let mut target = 0usize;

        for i in 0..self.slots.len() {
            let pinned = match &self.slots[i] {
                Slot::Live(cell) => cell.pins > 0,
                Slot::Free { .. } => continue,
            };
            if pinned {
                pinned_skipped += 1;
                continue;
            }
            while target < i && self.slots[target].is_live() {
                target += 1;
            }
            if target < i {
                self.slots.swap(i, target);
                fwd.insert(ObjRef(i as u32), ObjRef(target as u32));
                target += 1;
            }
        }

        while matches!(self.slots.last(), Some(Slot::Free { .. })) {
            self.slots.pop();
        }
        self.rebuild_free_list();
        (fwd, pinned_skipped)
    }

    /// Rewrite references held by every live object.
    pub(crate) fn relocate_all(&mut self, fwd: &Forwarding) {
        if fwd.is_empty() {
            return;
        }
        for slot in &mut self.slots {
            if let Slot::Live(cell) = slot {
                cell.object.relocate(fwd);
            }
        }
    }

    /// Reset the allocation trigger after a collection.
    pub(crate) fn reset_trigger(&mut self) {
        self.allocated_since_gc = 0;
        self.forced = false;
    }

    /// References held by live objects that name free slots.
    pub fn verify(&self) -> Vec<(ObjRef, ObjRef)> {
        let mut dangling = Vec::new();
        for (owner, object) in self.iter() {
            let mut tracer = CollectingTracer::new();
            object.trace(&mut tracer);
            for target in tracer.refs {
                if !self.contains(target) {
                    dangling.push((owner, target));
                }
            }
        }
        dangling
    }

    fn rebuild_free_list(&mut self) {
        let mut head = None;
        for i in (0..self.slots.len()).rev() {
            if let Slot::Free { next } = &mut self.slots[i] {
                *next = head;
                head = Some(i as u32);
            }
        }
        self.free_head = head;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::Tracer;
    use rivet_core::Value;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Node {
        next: Value,
        drops: Option<Arc<AtomicUsize>>,
    }

    impl Node {
        fn leaf() -> Self {
            Self {
                next: Value::NIL,
                drops: None,
            }
        }
    }

    impl Trace for Node {
        fn trace(&self, tracer: &mut dyn Tracer) {
            tracer.trace_value(self.next);
        }

        fn relocate(&mut self, fwd: &Forwarding) {
            fwd.update(&mut self.next);
        }

        fn finalize(&mut self) {
            if let Some(drops) = &self.drops {
                drops.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    #[test]
    fn test_alloc_and_get() {
        let mut heap = Heap::new(GcConfig::default());
        let a = heap.alloc(Node::leaf()).unwrap();
        let b = heap.alloc(Node::leaf()).unwrap();
        assert_ne!(a, b);
        assert!(heap.contains(a));
        assert_eq!(heap.live_count(), 2);
        assert!(heap.get(b).unwrap().next.is_nil());
    }

    #[test]
    fn test_object_limit() {
        let config = GcConfig {
            max_objects: 16,
            ..Default::default()
        };
        let mut heap = Heap::new(config);
        for _ in 0..16 {
            heap.alloc(Node::leaf()).unwrap();
        }
        assert_eq!(
            heap.alloc(Node::leaf()),
            Err(AllocError::OutOfMemory { limit: 16 })
        );
        assert_eq!(heap.stats().allocation_failures.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_trigger_only_requests() {
        let config = GcConfig {
            alloc_trigger: 2,
            ..Default::default()
        };
        let mut heap = Heap::new(config);
        heap.alloc(Node::leaf()).unwrap();
        assert!(!heap.gc_requested());
        heap.alloc(Node::leaf()).unwrap();
        assert!(heap.gc_requested());
        assert_eq!(heap.live_count(), 2);
        heap.reset_trigger();
        assert!(!heap.gc_requested());
        heap.request_collection();
        assert!(heap.gc_requested());
    }

    #[test]
    fn test_sweep_finalizes_and_reuses_lowest_slot() {
        let drops = Arc::new(AtomicUsize::new(0));
        let mut heap = Heap::new(GcConfig::default());
        let a = heap.alloc(Node::leaf()).unwrap();
        let b = heap
            .alloc(Node {
                next: Value::NIL,
                drops: Some(drops.clone()),
            })
            .unwrap();
        let c = heap.alloc(Node::leaf()).unwrap();

        let marks = vec![true, false, true];
        assert_eq!(heap.sweep(&marks), 1);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
        assert!(!heap.contains(b));
        assert!(heap.contains(a) && heap.contains(c));

        let d = heap.alloc(Node::leaf()).unwrap();
        assert_eq!(d, b);
    }

    #[test]
    fn test_pin_nesting() {
        let mut heap = Heap::new(GcConfig::default());
        let a = heap.alloc(Node::leaf()).unwrap();
        assert!(heap.pin(a));
        assert!(heap.pin(a));
        assert!(heap.unpin(a));
        assert!(heap.is_pinned(a));
        assert!(heap.unpin(a));
        assert!(!heap.is_pinned(a));
        assert!(!heap.unpin(a));
    }

    #[test]
    fn test_compact_slides_and_skips_pinned() {
        let mut heap = Heap::new(GcConfig::default());
        let refs: Vec<_> = (0..5).map(|_| heap.alloc(Node::leaf()).unwrap()).collect();
        heap.pin(refs[3]);
        heap.sweep(&[false, true, false, true, true]);

        let (fwd, pinned) = heap.compact();
        assert_eq!(pinned, 1);
        assert_eq!(fwd.forward(refs[1]), ObjRef(0));
        assert_eq!(fwd.forward(refs[4]), ObjRef(1));
        assert_eq!(fwd.forward(refs[3]), refs[3]);
        assert_eq!(fwd.len(), 2);
        assert_eq!(heap.slot_count(), 4);
        assert_eq!(heap.live_count(), 3);
        assert!(!heap.contains(ObjRef(2)));
        assert!(heap.is_pinned(refs[3]));
    }

    #[test]
    fn test_verify_reports_dangling() {
        let mut heap = Heap::new(GcConfig::default());
        let a = heap.alloc(Node::leaf()).unwrap();
        let b = heap
            .alloc(Node {
                next: Value::reference(a),
                drops: None,
            })
            .unwrap();
        assert!(heap.verify().is_empty());
        heap.sweep(&[false, true]);
        assert_eq!(heap.verify(), vec![(b, a)]);
    }
}
