//! Native extension bridge for the Rivet runtime.
//!
//! Extensions written against a C-style object API (`VALUE` words,
//! `rb_funcall`, `RSTRING_PTR`, `rb_protect`) run unmodified against a
//! managed heap whose objects may move:
//!
//! - **Handles** ([`rivet_gc::Handle`]) stand in for object pointers and
//!   stay stable across compaction. Each native call gets its own scope.
//! - **Views** ([`cache`]) give native code raw byte or element buffers
//!   and keep them coherent with the managed object across calls.
//! - **Calls** ([`call`]) marshal native→managed and managed→native with
//!   arity checks, handle scopes and ensure actions.
//! - **Exceptions** ([`exception`]) travel as `Err(Unwind)` and are
//!   observed through `rescue`, `ensure` and `protect`.
//!
//! A [`Runtime`] is the explicit context for all of it.
#![deny(unsafe_op_in_unsafe_fn)]

pub mod abi;
pub mod api;
pub mod builtins;
pub mod cache;
pub mod call;
pub mod config;
pub mod error;
pub mod exception;
pub mod handle;
pub mod method;
pub mod object;
pub mod runtime;

pub use api::{CApiConstant, CApiType, ForeachControl};
pub use cache::{BufferView, ViewKind};
pub use call::EnsureAction;
pub use config::{CapiConfig, ConfigError};
pub use error::{CapiResult, JumpTag, ProtocolViolation, UncaughtException, Unwind, ViewId};
pub use exception::{BridgeState, bug};
pub use method::{Arity, ArgSpec, ManagedFn, MethodKind, NativeFn, ScannedArgs, Visibility};
pub use rivet_core::{SymbolId, Value};
pub use rivet_gc::Handle;
pub use runtime::{InitError, Runtime, SharedRuntime};
