//! Mark-sweep collection with optional sliding compaction.
//!
//! A cycle runs in up to four phases:
//!
//! ```text
//! ┌──────────┐   ┌──────────┐   ┌──────────────┐   ┌──────────────────┐
//! │  mark    │──▶│  sweep   │──▶│  compact     │──▶│  relocate        │
//! │ roots +  │   │ finalize │   │ slide live   │   │ heap objects and │
//! │ closure  │   │ unmarked │   │ objects down │   │ root holders     │
//! └──────────┘   └──────────┘   └──────────────┘   └──────────────────┘
//!                                 (skipped when not permitted or
//!                                  fragmentation is below threshold)
//! ```
//!
//! Pinned objects survive compaction in place. The collector never runs
//! on its own: the owner calls [`Collector::collect`] at a safepoint where
//! every live reference is reachable from its [`RootProvider`].

use crate::heap::Heap;
use crate::roots::RootProvider;
use crate::stats::GcTimer;
use crate::trace::{Trace, Tracer};
use rivet_core::ObjRef;

/// Whether a cycle may move objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionMode {
    /// Never move objects.
    NonMoving,
    /// Compact if fragmentation crosses the configured threshold.
    Auto,
    /// Compact unconditionally (still honouring pins).
    ForceCompact,
}

/// Result of a collection cycle.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CollectionResult {
    /// Objects reached from the roots.
    pub marked: usize,
    /// Objects reclaimed.
    pub freed: usize,
    /// Objects moved by compaction.
    pub moved: usize,
    /// Pinned objects compaction left in place.
    pub pinned_skipped: usize,
    /// Whether compaction ran.
    pub compacted: bool,
    /// References, from roots or objects, that named free slots.
    pub dangling: usize,
}

struct MarkingTracer<'a> {
    marks: &'a mut [bool],
    worklist: &'a mut Vec<ObjRef>,
    dangling: &'a mut usize,
}

impl Tracer for MarkingTracer<'_> {
    #[inline]
    fn trace_ref(&mut self, obj: ObjRef) {
        match self.marks.get_mut(obj.index()) {
            Some(mark) if !*mark => {
                *mark = true;
                self.worklist.push(obj);
            }
            Some(_) => {}
            None => *self.dangling += 1,
        }
    }
}

/// Tracing collector over a [`Heap`].
pub struct Collector {
    /// Gray objects awaiting a scan.
    worklist: Vec<ObjRef>,
    /// Mark bits indexed by slot.
    marks: Vec<bool>,
}

impl Collector {
    /// Create a collector.
    pub fn new() -> Self {
        Self {
            worklist: Vec::with_capacity(256),
            marks: Vec::new(),
        }
    }

    /// Run a full cycle.
    ///
    /// Roots are traced through `roots`; if compaction moves anything, both
    /// heap objects and `roots` are rewritten before returning.
    pub fn collect<T, R>(
        &mut self,
        heap: &mut Heap<T>,
        roots: &mut R,
        mode: CollectionMode,
    ) -> CollectionResult
    where
        T: Trace,
        R: RootProvider + ?Sized,
    {
        let timer = GcTimer::start("collect");
        let mut result = CollectionResult::default();

        // Phase 1: mark
        self.marks.clear();
        self.marks.resize(heap.slot_count(), false);
        self.worklist.clear();
        let mut dangling = 0;
        {
            let mut tracer = MarkingTracer {
                marks: &mut self.marks,
                worklist: &mut self.worklist,
                dangling: &mut dangling,
            };
            roots.trace_roots(&mut tracer);
        }

        // Marks on free slots are harmless: sweep only visits live slots.
        while let Some(obj) = self.worklist.pop() {
            let Some(object) = heap.get(obj) else {
                dangling += 1;
                continue;
            };
            result.marked += 1;
            let mut tracer = MarkingTracer {
                marks: &mut self.marks,
                worklist: &mut self.worklist,
                dangling: &mut dangling,
            };
            object.trace(&mut tracer);
        }
        result.dangling = dangling;

        // Phase 2: sweep
        result.freed = heap.sweep(&self.marks);

        // Phase 3/4: compact and relocate
        let compact = match mode {
            CollectionMode::NonMoving => false,
            CollectionMode::ForceCompact => true,
            CollectionMode::Auto => {
                heap.config().compact
                    && heap.fragmentation() >= heap.config().compaction_threshold
                    && heap.fragmentation() > 0.0
            }
        };
        if compact {
            let (fwd, pinned_skipped) = heap.compact();
            heap.relocate_all(&fwd);
            roots.relocate_roots(&fwd);
            result.moved = fwd.len();
            result.pinned_skipped = pinned_skipped;
            result.compacted = true;
        }

        heap.reset_trigger();
        let elapsed = timer.stop();
        heap.stats().record_collection(
            elapsed,
            result.freed,
            result.moved,
            result.pinned_skipped,
            result.compacted,
            heap.live_count(),
        );

        if heap.config().trace {
            log::debug!(
                "gc: marked {} freed {} moved {} pinned {} in {:?}",
                result.marked,
                result.freed,
                result.moved,
                result.pinned_skipped,
                elapsed
            );
        }
        if result.dangling > 0 {
            log::warn!("gc: {} references named free slots", result.dangling);
        }
        if heap.config().verify_heap {
            for (owner, target) in heap.verify() {
                log::error!("gc: object {} references free slot {}", owner.0, target.0);
            }
        }
        result
    }

    /// Collect with [`CollectionMode::Auto`] if the heap has asked for it.
    pub fn collect_if_requested<T, R>(
        &mut self,
        heap: &mut Heap<T>,
        roots: &mut R,
        allow_moving: bool,
    ) -> Option<CollectionResult>
    where
        T: Trace,
        R: RootProvider + ?Sized,
    {
        if !heap.gc_requested() {
            return None;
        }
        let mode = if allow_moving {
            CollectionMode::Auto
        } else {
            CollectionMode::NonMoving
        };
        Some(self.collect(heap, roots, mode))
    }
}

impl Default for Collector {
    fn default() -> Self {
        Self::new()
    }
}
