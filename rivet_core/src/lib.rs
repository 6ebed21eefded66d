//! Rivet core types.
//!
//! The word-level vocabulary shared by the heap, the collector and the
//! native bridge:
//!
//! - [`Value`]: the tagged word (immediates inline, references by slot)
//! - [`ObjRef`]: a heap slot index
//! - [`SymbolTable`]: interned names (`ID` on the native side)

#![warn(clippy::all)]

pub mod symbol;
pub mod value;

pub use symbol::{SymbolId, SymbolKind, SymbolTable};
pub use value::{FIXNUM_MAX, FIXNUM_MIN, ObjRef, Value, ValueKind};
