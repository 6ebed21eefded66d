//! The extension-facing surface of [`Runtime`](crate::Runtime).
//!
//! Every function here takes and returns [`Handle`](rivet_gc::Handle)s;
//! raw heap values never cross into native code. Functions that can raise
//! return [`CapiResult`](crate::CapiResult).

pub mod array;
pub mod constants;
pub mod convert;
pub mod data;
pub mod define;
pub mod globals;
pub mod hash;
pub mod object;
pub mod string;

pub use constants::{CApiConstant, CApiType};
pub use hash::ForeachControl;
