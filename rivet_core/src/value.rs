//! Tagged word representation shared by the managed heap and native code.
//!
//! Every guest value fits in a single 64-bit word. Immediates carry their
//! payload inline and never touch the heap; references carry a heap slot
//! index and are only meaningful while the referent is rooted.
//!
//! # Encoding
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │  Kind        │  Bit pattern                         │  Example       │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │  false       │  0x00                                │  0x00          │
//! │  true        │  0x22                                │  0x22          │
//! │  nil         │  0x42                                │  0x42          │
//! │  undef       │  0x62                                │  0x62          │
//! │  Fixnum      │  (n << 1) | 1                        │  7 → 0x0f      │
//! │  Symbol      │  (id << 3) | 0b110                   │  id 2 → 0x16   │
//! │  Reference   │  (slot + 1) << 7, low seven bits 0   │  slot 0 → 0x80 │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! `false` is the all-zero word. Native extensions test C-style falsiness
//! directly against zero, so this pattern is fixed.
//!
//! Truth testing is a single mask: only `false` and `nil` have no bits
//! outside `nil`'s pattern. References keep their low seven bits clear so
//! no slot index can collide with that mask.

use crate::symbol::SymbolId;
use std::fmt;

// =============================================================================
// Tag Constants
// =============================================================================

/// Low bit set on every Fixnum.
pub const FIXNUM_FLAG: u64 = 0x1;

/// Mask selecting the symbol tag bits.
pub const SYMBOL_MASK: u64 = 0x7;

/// Tag identifying a Symbol.
pub const SYMBOL_TAG: u64 = 0x6;

/// Mask selecting the reference tag bits.
pub const REFERENCE_MASK: u64 = 0x7f;

/// Tag identifying a reference (with a non-zero word).
pub const REFERENCE_TAG: u64 = 0x0;

/// Shift applied to symbol ids.
pub const SYMBOL_SHIFT: u32 = 3;

/// Shift applied to heap slot indices.
pub const REFERENCE_SHIFT: u32 = 7;

/// Bit pattern of `false`.
pub const FALSE_BITS: u64 = 0x00;
/// Bit pattern of `true`.
pub const TRUE_BITS: u64 = 0x22;
/// Bit pattern of `nil`.
pub const NIL_BITS: u64 = 0x42;
/// Bit pattern of the internal "no value" marker.
pub const UNDEF_BITS: u64 = 0x62;

/// Largest integer representable as a Fixnum.
pub const FIXNUM_MAX: i64 = i64::MAX >> 1;

/// Smallest integer representable as a Fixnum.
pub const FIXNUM_MIN: i64 = i64::MIN >> 1;

// =============================================================================
// Object Reference
// =============================================================================

/// Index of an object slot in the managed heap.
///
/// An `ObjRef` is only stable between compactions; code outside the
/// collector should hold a rooted handle instead of a raw `ObjRef`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjRef(pub u32);

impl ObjRef {
    /// Slot index as `usize`.
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

// =============================================================================
// Value
// =============================================================================

/// A tagged guest value.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Value(u64);

/// Decoded view of a [`Value`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    /// The `false` singleton.
    False,
    /// The `true` singleton.
    True,
    /// The `nil` singleton.
    Nil,
    /// The internal "no value" marker.
    Undef,
    /// Small integer.
    Fixnum(i64),
    /// Interned symbol.
    Symbol(SymbolId),
    /// Heap reference.
    Reference(ObjRef),
}

impl Value {
    /// `false`.
    pub const FALSE: Value = Value(FALSE_BITS);
    /// `true`.
    pub const TRUE: Value = Value(TRUE_BITS);
    /// `nil`.
    pub const NIL: Value = Value(NIL_BITS);
    /// Internal "no value" marker. Never handed to guest code.
    pub const UNDEF: Value = Value(UNDEF_BITS);

    /// Reinterpret a raw word.
    ///
    /// Any word is a syntactically valid `Value`; whether a reference word
    /// names a live object is a question for the heap.
    #[inline]
    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    /// Raw word.
    #[inline]
    pub const fn bits(self) -> u64 {
        self.0
    }

    // =========================================================================
    // Construction
    // =========================================================================

    /// Encode a boolean.
    #[inline]
    pub const fn bool(b: bool) -> Self {
        if b { Self::TRUE } else { Self::FALSE }
    }

    /// Encode an integer as a Fixnum, or `None` when it does not fit.
    #[inline]
    pub const fn fixnum(n: i64) -> Option<Self> {
        if n < FIXNUM_MIN || n > FIXNUM_MAX {
            None
        } else {
            Some(Self::fixnum_unchecked(n))
        }
    }

    /// Encode an integer known to be in Fixnum range.
    #[inline]
    pub const fn fixnum_unchecked(n: i64) -> Self {
        Self(((n << 1) as u64) | FIXNUM_FLAG)
    }

    /// Encode a symbol.
    #[inline]
    pub const fn symbol(id: SymbolId) -> Self {
        Self(((id.0 as u64) << SYMBOL_SHIFT) | SYMBOL_TAG)
    }

    /// Encode a heap reference.
    #[inline]
    pub const fn reference(obj: ObjRef) -> Self {
        Self((obj.0 as u64 + 1) << REFERENCE_SHIFT)
    }

    // =========================================================================
    // Classification
    // =========================================================================

    /// Truth test: everything except `false` and `nil` is truthy.
    #[inline(always)]
    pub const fn test(self) -> bool {
        self.0 & !NIL_BITS != 0
    }

    /// True for words that alias a heap object.
    #[inline(always)]
    pub const fn is_reference(self) -> bool {
        self.0 != 0 && (self.0 & REFERENCE_MASK) == REFERENCE_TAG
    }

    /// True for words whose payload is fully inline.
    #[inline(always)]
    pub const fn is_immediate(self) -> bool {
        !self.is_reference()
    }

    /// True for immediates, `false` and `nil`.
    #[inline]
    pub const fn is_special_const(self) -> bool {
        self.is_immediate() || !self.test()
    }

    #[inline(always)]
    pub const fn is_fixnum(self) -> bool {
        self.0 & FIXNUM_FLAG != 0
    }

    #[inline(always)]
    pub const fn is_symbol(self) -> bool {
        self.0 & SYMBOL_MASK == SYMBOL_TAG
    }

    #[inline(always)]
    pub const fn is_nil(self) -> bool {
        self.0 == NIL_BITS
    }

    #[inline(always)]
    pub const fn is_false(self) -> bool {
        self.0 == FALSE_BITS
    }

    #[inline(always)]
    pub const fn is_true(self) -> bool {
        self.0 == TRUE_BITS
    }

    #[inline(always)]
    pub const fn is_undef(self) -> bool {
        self.0 == UNDEF_BITS
    }

    // =========================================================================
    // Decoding
    // =========================================================================

    /// Decode a Fixnum payload.
    #[inline]
    pub const fn as_fixnum(self) -> Option<i64> {
        if self.is_fixnum() {
            Some((self.0 as i64) >> 1)
        } else {
            None
        }
    }

    /// Decode a symbol id.
    #[inline]
    pub const fn as_symbol(self) -> Option<SymbolId> {
        if self.is_symbol() {
            Some(SymbolId((self.0 >> SYMBOL_SHIFT) as u32))
        } else {
            None
        }
    }

    /// Decode a heap reference.
    #[inline]
    pub const fn as_ref(self) -> Option<ObjRef> {
        if self.is_reference() {
            Some(ObjRef(((self.0 >> REFERENCE_SHIFT) - 1) as u32))
        } else {
            None
        }
    }

    /// Decode into a [`ValueKind`].
    ///
    /// Words with an unknown immediate pattern decode as `Undef`.
    pub const fn kind(self) -> ValueKind {
        if let Some(n) = self.as_fixnum() {
            return ValueKind::Fixnum(n);
        }
        if let Some(id) = self.as_symbol() {
            return ValueKind::Symbol(id);
        }
        if let Some(obj) = self.as_ref() {
            return ValueKind::Reference(obj);
        }
        match self.0 {
            FALSE_BITS => ValueKind::False,
            TRUE_BITS => ValueKind::True,
            NIL_BITS => ValueKind::Nil,
            _ => ValueKind::Undef,
        }
    }
}

impl Default for Value {
    fn default() -> Self {
        Self::NIL
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind() {
            ValueKind::False => write!(f, "false"),
            ValueKind::True => write!(f, "true"),
            ValueKind::Nil => write!(f, "nil"),
            ValueKind::Undef => write!(f, "undef({:#x})", self.0),
            ValueKind::Fixnum(n) => write!(f, "{}", n),
            ValueKind::Symbol(id) => write!(f, ":#{}", id.0),
            ValueKind::Reference(obj) => write!(f, "#<ref {}>", obj.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_false_is_zero() {
        assert_eq!(Value::FALSE.bits(), 0);
        assert_eq!(Value::FALSE.bits() as i64, 0);
    }

    #[test]
    fn test_truthiness() {
        assert!(!Value::FALSE.test());
        assert!(!Value::NIL.test());
        assert!(Value::TRUE.test());
        assert!(Value::fixnum_unchecked(0).test());
        assert!(Value::symbol(SymbolId(0)).test());
        assert!(Value::reference(ObjRef(0)).test());
    }

    #[test]
    fn test_fixnum_round_trip_extremes() {
        for n in [0, 1, -1, 42, -42, FIXNUM_MAX, FIXNUM_MIN, FIXNUM_MAX - 1] {
            let v = Value::fixnum(n).unwrap();
            assert!(v.is_fixnum());
            assert!(v.is_immediate());
            assert_eq!(v.as_fixnum(), Some(n));
        }
    }

    #[test]
    fn test_fixnum_out_of_range() {
        assert!(Value::fixnum(FIXNUM_MAX + 1).is_none());
        assert!(Value::fixnum(FIXNUM_MIN - 1).is_none());
        assert!(Value::fixnum(i64::MAX).is_none());
        assert!(Value::fixnum(i64::MIN).is_none());
    }

    #[test]
    fn test_fixnum_stride() {
        let mut n = FIXNUM_MIN;
        while n < FIXNUM_MAX - (1 << 50) {
            assert_eq!(Value::fixnum(n).unwrap().as_fixnum(), Some(n));
            n += (1 << 50) + 7;
        }
    }

    #[test]
    fn test_specials_are_not_references() {
        for v in [Value::FALSE, Value::TRUE, Value::NIL, Value::UNDEF] {
            assert!(v.is_immediate());
            assert!(!v.is_fixnum());
            assert!(!v.is_symbol());
            assert!(v.as_ref().is_none());
        }
    }

    #[test]
    fn test_reference_encoding() {
        for slot in [0u32, 1, 7, 1 << 20, u32::MAX - 1] {
            let v = Value::reference(ObjRef(slot));
            assert!(v.is_reference());
            assert!(v.test());
            assert!(!v.is_fixnum());
            assert!(!v.is_symbol());
            assert_eq!(v.as_ref(), Some(ObjRef(slot)));
            assert_eq!(v.kind(), ValueKind::Reference(ObjRef(slot)));
        }
    }

    #[test]
    fn test_symbol_encoding() {
        let v = Value::symbol(SymbolId(12));
        assert!(v.is_symbol());
        assert!(!v.is_reference());
        assert_eq!(v.as_symbol(), Some(SymbolId(12)));
    }

    #[test]
    fn test_special_const() {
        assert!(Value::NIL.is_special_const());
        assert!(Value::FALSE.is_special_const());
        assert!(Value::fixnum_unchecked(3).is_special_const());
        assert!(!Value::reference(ObjRef(3)).is_special_const());
    }

    #[test]
    fn test_kind_decoding() {
        assert_eq!(Value::NIL.kind(), ValueKind::Nil);
        assert_eq!(Value::TRUE.kind(), ValueKind::True);
        assert_eq!(Value::FALSE.kind(), ValueKind::False);
        assert_eq!(Value::UNDEF.kind(), ValueKind::Undef);
        assert_eq!(Value::fixnum_unchecked(-5).kind(), ValueKind::Fixnum(-5));
    }
}
