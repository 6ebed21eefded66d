//! Word-level helpers with C linkage.
//!
//! These are the macros of the C API (`RTEST`, `NIL_P`, `INT2FIX`, ...)
//! as callable functions. They only look at the bits of a handle and
//! never touch the runtime.

use rivet_core::{FIXNUM_MAX, FIXNUM_MIN};
use rivet_gc::Handle;

// =============================================================================
// Predicates
// =============================================================================

/// `RTEST`.
#[unsafe(no_mangle)]
pub extern "C" fn rivet_rtest(word: u64) -> bool {
    Handle::from_bits(word).test()
}

/// `NIL_P`.
#[unsafe(no_mangle)]
pub extern "C" fn rivet_nil_p(word: u64) -> bool {
    Handle::from_bits(word).is_nil()
}

/// `FIXNUM_P`.
#[unsafe(no_mangle)]
pub extern "C" fn rivet_fixnum_p(word: u64) -> bool {
    Handle::from_bits(word).is_fixnum()
}

/// `SYMBOL_P`.
#[unsafe(no_mangle)]
pub extern "C" fn rivet_symbol_p(word: u64) -> bool {
    Handle::from_bits(word).is_symbol()
}

/// `IMMEDIATE_P`: fixnums and symbols.
#[unsafe(no_mangle)]
pub extern "C" fn rivet_immediate_p(word: u64) -> bool {
    let h = Handle::from_bits(word);
    h.is_fixnum() || h.is_symbol()
}

/// `SPECIAL_CONST_P`: anything that is not a reference.
#[unsafe(no_mangle)]
pub extern "C" fn rivet_special_const_p(word: u64) -> bool {
    !Handle::from_bits(word).is_reference()
}

// =============================================================================
// Fixnums
// =============================================================================

/// `FIXABLE`.
#[unsafe(no_mangle)]
pub extern "C" fn rivet_fixable(n: i64) -> bool {
    (FIXNUM_MIN..=FIXNUM_MAX).contains(&n)
}

/// `INT2FIX`. The caller guarantees `n` is fixable; out-of-range input
/// loses its top bit.
#[unsafe(no_mangle)]
pub extern "C" fn rivet_int2fix(n: i64) -> u64 {
    ((n << 1) | 1) as u64
}

/// `FIX2LONG`: arithmetic shift, no tag check.
#[unsafe(no_mangle)]
pub extern "C" fn rivet_fix2long(word: u64) -> i64 {
    (word as i64) >> 1
}
