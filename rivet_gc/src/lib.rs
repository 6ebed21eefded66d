//! Rivet managed heap.
//!
//! A precise, non-generational collector for runtimes that expose their
//! objects to native extensions.
//!
//! # Architecture
//!
//! - **Heap**: a slot arena. Every object lives in one slot named by an
//!   [`ObjRef`](rivet_core::ObjRef).
//!
//! - **Collector**: mark-sweep with optional sliding compaction. Pinned
//!   objects never move. Collection only happens when the owner asks for
//!   it at a safepoint.
//!
//! - **Handle table**: the indirection native code sees. Handles survive
//!   compaction unchanged and detect use after release via generations.
//!
//! # Usage
//!
//! ```ignore
//! use rivet_gc::{Collector, CollectionMode, GcConfig, Heap, HandleTable};
//!
//! let mut heap = Heap::new(GcConfig::default());
//! let mut handles = HandleTable::default();
//!
//! let obj = heap.alloc(MyObject::new())?;
//! let handle = handles.acquire(obj)?;
//!
//! if heap.gc_requested() {
//!     Collector::new().collect(&mut heap, &mut handles, CollectionMode::Auto);
//! }
//! assert!(handles.resolve(handle).is_ok());
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod collector;
pub mod config;
pub mod heap;
pub mod roots;
pub mod trace;

mod stats;

// Re-exports for convenient access
pub use collector::{CollectionMode, CollectionResult, Collector};
pub use config::{ConfigError, GcConfig};
pub use heap::{AllocError, Heap};
pub use roots::{
    GlobalRegistry, Handle, HandleError, HandleTable, RootProvider, RootSet, ScopeExit, ScopeToken,
};
pub use stats::GcStats;
pub use trace::{CollectingTracer, Forwarding, NullTracer, Trace, Tracer};
