//! The runtime: heap, roots, class table and call stacks.
//!
//! A [`Runtime`] is the explicit context every bridge operation runs
//! against. There is no ambient singleton; hosts that share a runtime
//! across threads wrap it in [`SharedRuntime`].
//!
//! # Safepoints
//!
//! Collection only happens at the native→managed transition
//! ([`funcall2`](Runtime::funcall2) and friends, before any handle is
//! resolved) and at explicit [`gc_start`](Runtime::gc_start) /
//! [`gc_compact`](Runtime::gc_compact). Objects only move when no
//! managed or native frame is active, so `Value`s held in Rust locals
//! by an active frame stay valid; they are kept alive through the frame
//! (receiver, arguments, temporaries).

mod bootstrap;
mod dispatch;
mod shared;

pub use bootstrap::CoreClasses;
pub(crate) use bootstrap::format_float;
pub use dispatch::CallStyle;
pub(crate) use dispatch::CallFrame;
pub use shared::SharedRuntime;

use crate::api::constants::CApiConstant;
use crate::api::globals::GlobalVar;
use crate::cache::ViewCache;
use crate::call::NativeFrame;
use crate::config::{CapiConfig, ConfigError};
use crate::error::CapiResult;
use crate::exception::{BridgeFrame, BridgeState, bug};
use crate::object::{ModuleBody, Object, ObjectBody};
use rivet_core::{ObjRef, SymbolId, SymbolTable, Value};
use rivet_gc::{
    AllocError, CollectionMode, CollectionResult, Collector, Forwarding, GcStats, GlobalRegistry,
    HandleError, HandleTable, Heap, RootProvider, RootSet, Tracer,
};
use rustc_hash::FxHashMap;
use thiserror::Error;

/// Failure to bring up a runtime.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InitError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("bootstrap allocation failed: {0}")]
    Alloc(#[from] AllocError),
    #[error("bootstrap handle allocation failed: {0}")]
    Handle(#[from] HandleError),
}

/// A managed runtime with its native bridge.
pub struct Runtime {
    pub(crate) heap: Heap<Object>,
    collector: Collector,
    pub(crate) handles: HandleTable,
    pub(crate) registry: GlobalRegistry,
    pub(crate) roots: RootSet,
    pub(crate) symbols: SymbolTable,
    pub(crate) classes: CoreClasses,
    pub(crate) frames: Vec<CallFrame>,
    pub(crate) natives: Vec<NativeFrame>,
    pub(crate) bridge: Vec<BridgeFrame>,
    pub(crate) last_bridge_state: BridgeState,
    pub(crate) views: ViewCache,
    pub(crate) global_vars: FxHashMap<SymbolId, GlobalVar>,
    pub(crate) errinfo: Value,
    pub(crate) config: CapiConfig,
    /// Raised when allocation fails; allocated up front.
    pub(crate) no_memory: Value,
    /// Top-level `self`.
    pub(crate) main: Value,
    last_collection: Option<CollectionResult>,
}

impl Runtime {
    /// Create a runtime and bootstrap the core classes.
    pub fn new(config: CapiConfig) -> Result<Self, InitError> {
        config.validate()?;
        let mut heap = Heap::new(config.gc.clone());
        let mut handles = HandleTable::new(config.max_handles);
        let mut symbols = SymbolTable::new();
        let mut roots = RootSet::new();
        let boot = bootstrap::bootstrap(&mut heap, &mut handles, &mut symbols, &mut roots)?;

        let mut rt = Self {
            heap,
            collector: Collector::new(),
            handles,
            registry: GlobalRegistry::new(),
            roots,
            symbols,
            classes: boot.classes,
            frames: Vec::new(),
            natives: Vec::new(),
            bridge: Vec::new(),
            last_bridge_state: BridgeState::Normal,
            views: ViewCache::new(),
            global_vars: FxHashMap::default(),
            errinfo: Value::NIL,
            config,
            no_memory: boot.no_memory,
            main: boot.main,
            last_collection: None,
        };
        rt.install_core_methods();
        crate::builtins::install(&mut rt);
        log::debug!(
            "runtime: bootstrapped {} objects, {} symbols",
            rt.heap.live_count(),
            rt.symbols.len()
        );
        Ok(rt)
    }

    /// Runtime with the default configuration.
    pub fn with_defaults() -> Result<Self, InitError> {
        Self::new(CapiConfig::default())
    }

    #[inline]
    pub fn config(&self) -> &CapiConfig {
        &self.config
    }

    // =========================================================================
    // Symbols
    // =========================================================================

    /// Intern a name (`rb_intern`).
    #[inline]
    pub fn intern(&mut self, name: &str) -> SymbolId {
        self.symbols.intern(name)
    }

    /// Name of an interned id (`rb_id2name`).
    #[inline]
    pub fn id2name(&self, id: SymbolId) -> Option<&str> {
        self.symbols.name(id)
    }

    pub(crate) fn symbol_name(&self, id: SymbolId) -> String {
        self.symbols.name(id).unwrap_or("?").to_string()
    }

    // =========================================================================
    // Heap access
    // =========================================================================

    /// Allocate an object, rooting it in the innermost managed frame.
    ///
    /// Allocation never collects. Exhaustion raises the preallocated
    /// `NoMemoryError`.
    pub(crate) fn alloc(&mut self, class: ObjRef, body: ObjectBody) -> CapiResult<Value> {
        match self.heap.alloc(Object::new(class, body)) {
            Ok(obj) => {
                let value = Value::reference(obj);
                if let Some(frame) = self.frames.last_mut() {
                    frame.temps.push(value);
                }
                Ok(value)
            }
            Err(err) => {
                log::warn!("alloc: {err}");
                let exc = self.no_memory;
                Err(self.raise_value(exc))
            }
        }
    }

    /// Allocate an instance of a built-in class.
    #[inline]
    pub(crate) fn alloc_core(
        &mut self,
        constant: CApiConstant,
        body: ObjectBody,
    ) -> CapiResult<Value> {
        let class = self.core(constant);
        self.alloc(class, body)
    }

    /// Live object behind `obj`; a dead slot is a fatal bug.
    #[inline]
    pub(crate) fn get(&self, obj: ObjRef) -> &Object {
        match self.heap.get(obj) {
            Some(object) => object,
            None => bug(format!("object #{} is not live", obj.0)),
        }
    }

    #[inline]
    pub(crate) fn get_mut(&mut self, obj: ObjRef) -> &mut Object {
        match self.heap.get_mut(obj) {
            Some(object) => object,
            None => bug(format!("object #{} is not live", obj.0)),
        }
    }

    /// Object behind a reference value.
    #[inline]
    pub(crate) fn object_of(&self, value: Value) -> Option<&Object> {
        value.as_ref().map(|obj| self.get(obj))
    }

    #[inline]
    pub(crate) fn object_of_mut(&mut self, value: Value) -> Option<&mut Object> {
        match value.as_ref() {
            Some(obj) => Some(self.get_mut(obj)),
            None => None,
        }
    }

    /// Module body of a class or module.
    pub(crate) fn module(&self, obj: ObjRef) -> &ModuleBody {
        match self.get(obj).as_module() {
            Some(m) => m,
            None => bug(format!("object #{} is not a module", obj.0)),
        }
    }

    pub(crate) fn module_mut(&mut self, obj: ObjRef) -> &mut ModuleBody {
        match self.get_mut(obj).as_module_mut() {
            Some(m) => m,
            None => bug(format!("object #{} is not a module", obj.0)),
        }
    }

    /// Number of live heap objects.
    #[inline]
    pub fn live_objects(&self) -> usize {
        self.heap.live_count()
    }

    /// Collector statistics.
    #[inline]
    pub fn gc_stats(&self) -> &GcStats {
        self.heap.stats()
    }

    /// Outcome of the most recent collection.
    #[inline]
    pub fn last_collection(&self) -> Option<CollectionResult> {
        self.last_collection
    }

    /// Top-level `self`.
    pub fn main(&mut self) -> rivet_gc::Handle {
        let main = self.main;
        self.handle_for(main)
    }

    // =========================================================================
    // Collection
    // =========================================================================

    /// Objects may only move while no frame holds raw values.
    #[inline]
    fn moving_allowed(&self) -> bool {
        self.frames.is_empty() && self.natives.is_empty() && self.bridge.is_empty()
    }

    /// Collect if the allocation trigger has been crossed.
    pub(crate) fn safepoint(&mut self) {
        if self.heap.gc_requested() {
            let mode = if self.moving_allowed() {
                CollectionMode::Auto
            } else {
                CollectionMode::NonMoving
            };
            self.collect(mode);
        }
    }

    /// Run a full collection now (`rb_gc_start`).
    pub fn gc_start(&mut self) -> CollectionResult {
        let mode = if self.moving_allowed() {
            CollectionMode::Auto
        } else {
            CollectionMode::NonMoving
        };
        self.collect(mode)
    }

    /// Collect and compact regardless of fragmentation.
    ///
    /// Degrades to a non-moving cycle inside an active call.
    pub fn gc_compact(&mut self) -> CollectionResult {
        let mode = if self.moving_allowed() {
            CollectionMode::ForceCompact
        } else {
            log::debug!("gc: compaction deferred, frames active");
            CollectionMode::NonMoving
        };
        self.collect(mode)
    }

    fn collect(&mut self, mode: CollectionMode) -> CollectionResult {
        for (name, handle) in self.registry.current() {
            if handle.is_reference() && !self.handles.is_valid(handle) {
                log::error!("gc: global `{name}' holds stale handle {handle:?}");
            }
        }
        let mut roots = RuntimeRoots {
            handles: &mut self.handles,
            roots: &mut self.roots,
            frames: &mut self.frames,
            bridge: &mut self.bridge,
            views: &mut self.views,
            global_vars: &mut self.global_vars,
            errinfo: &mut self.errinfo,
        };
        let result = self.collector.collect(&mut self.heap, &mut roots, mode);
        let heap = &self.heap;
        self.views.prune_readonly(|obj| heap.contains(obj));
        if result.compacted {
            log::info!(
                "gc: compacted, {} moved, {} pinned in place",
                result.moved,
                result.pinned_skipped
            );
        }
        self.last_collection = Some(result);
        result
    }
}

/// Every root holder of a runtime, borrowed for one collection.
struct RuntimeRoots<'a> {
    handles: &'a mut HandleTable,
    roots: &'a mut RootSet,
    frames: &'a mut Vec<CallFrame>,
    bridge: &'a mut Vec<BridgeFrame>,
    views: &'a mut ViewCache,
    global_vars: &'a mut FxHashMap<SymbolId, GlobalVar>,
    errinfo: &'a mut Value,
}

impl RootProvider for RuntimeRoots<'_> {
    fn trace_roots(&self, tracer: &mut dyn Tracer) {
        self.handles.mark_roots(tracer);
        self.roots.trace_roots(tracer);
        for frame in self.frames.iter() {
            frame.trace(tracer);
        }
        for frame in self.bridge.iter() {
            frame.trace(tracer);
        }
        self.views.trace(tracer);
        for var in self.global_vars.values() {
            var.trace(tracer);
        }
        tracer.trace_value(*self.errinfo);
    }

    fn relocate_roots(&mut self, fwd: &Forwarding) {
        self.handles.relocate(fwd);
        self.roots.relocate_roots(fwd);
        for frame in self.frames.iter_mut() {
            frame.relocate(fwd);
        }
        for frame in self.bridge.iter_mut() {
            frame.relocate(fwd);
        }
        self.views.relocate(fwd);
        for var in self.global_vars.values_mut() {
            var.relocate(fwd);
        }
        fwd.update(self.errinfo);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::StringBody;

    fn runtime() -> Runtime {
        Runtime::new(CapiConfig::default()).unwrap()
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = CapiConfig {
            max_call_depth: 0,
            ..Default::default()
        };
        assert!(matches!(
            Runtime::new(config),
            Err(InitError::Config(ConfigError::ZeroCallDepth))
        ));
    }

    #[test]
    fn test_bootstrap_objects_survive_collection() {
        let mut rt = runtime();
        let before = rt.live_objects();
        let result = rt.gc_start();
        assert_eq!(result.freed, 0);
        assert_eq!(rt.live_objects(), before);
    }

    #[test]
    fn test_unrooted_objects_are_collected() {
        let mut rt = runtime();
        let before = rt.live_objects();
        rt.alloc_core(CApiConstant::String, ObjectBody::String(StringBody::default()))
            .unwrap();
        assert_eq!(rt.live_objects(), before + 1);
        let result = rt.gc_start();
        assert_eq!(result.freed, 1);
        assert_eq!(rt.live_objects(), before);
    }

    #[test]
    fn test_allocation_failure_raises_no_memory() {
        let baseline = runtime().live_objects();
        let mut config = CapiConfig::default();
        config.gc.max_objects = baseline + 2;
        let mut rt = Runtime::new(config).unwrap();
        rt.alloc_core(CApiConstant::Object, ObjectBody::Plain).unwrap();
        rt.alloc_core(CApiConstant::Object, ObjectBody::Plain).unwrap();
        let err = rt
            .alloc_core(CApiConstant::Object, ObjectBody::Plain)
            .unwrap_err();
        assert_eq!(err.exception, rt.no_memory);
        assert_eq!(rt.errinfo, rt.no_memory);
        assert_eq!(
            rt.gc_stats()
                .allocation_failures
                .load(std::sync::atomic::Ordering::Relaxed),
            1
        );
    }

    #[test]
    fn test_compaction_deferred_inside_frames() {
        let mut rt = runtime();
        rt.frames.push(CallFrame::new(Value::NIL, SymbolId(0), None, &[], None));
        let result = rt.gc_compact();
        assert!(!result.compacted);
        rt.frames.pop();
    }
}
