//! Numeric and symbol conversions.
//!
//! Integers that fit the fixnum range stay immediate; anything wider is
//! boxed as a Bignum and every conversion back checks the target width.

use crate::api::constants::CApiConstant;
use crate::error::CapiResult;
use crate::object::ObjectBody;
use crate::runtime::Runtime;
use num_bigint::BigInt;
use num_traits::{FromPrimitive, Signed, ToPrimitive};
use rivet_core::{SymbolId, Value};
use rivet_gc::Handle;

impl Runtime {
    // =========================================================================
    // Value Helpers
    // =========================================================================

    /// Fixnum when it fits, Bignum otherwise.
    pub(crate) fn new_integer(&mut self, n: i64) -> CapiResult<Value> {
        match Value::fixnum(n) {
            Some(value) => Ok(value),
            None => self.alloc_core(CApiConstant::Bignum, ObjectBody::Bignum(BigInt::from(n))),
        }
    }

    /// Normalizing constructor: small results collapse to fixnums.
    pub(crate) fn new_bignum(&mut self, n: BigInt) -> CapiResult<Value> {
        if let Some(value) = n.to_i64().and_then(Value::fixnum) {
            return Ok(value);
        }
        self.alloc_core(CApiConstant::Bignum, ObjectBody::Bignum(n))
    }

    pub(crate) fn new_float(&mut self, f: f64) -> CapiResult<Value> {
        self.alloc_core(CApiConstant::Float, ObjectBody::Float(f))
    }

    pub(crate) fn integer_of(&self, value: Value) -> Option<BigInt> {
        if let Some(n) = value.as_fixnum() {
            return Some(BigInt::from(n));
        }
        match self.object_of(value).map(|o| &o.body) {
            Some(ObjectBody::Bignum(n)) => Some(n.clone()),
            _ => None,
        }
    }

    pub(crate) fn expect_integer(&mut self, value: Value) -> CapiResult<BigInt> {
        match self.integer_of(value) {
            Some(n) => Ok(n),
            None => {
                let name = self.class_name_of(value);
                Err(self.type_error(format!("{name} can't be coerced into Integer")))
            }
        }
    }

    pub(crate) fn is_float(&self, value: Value) -> bool {
        matches!(self.object_of(value).map(|o| &o.body), Some(ObjectBody::Float(_)))
    }

    pub(crate) fn is_numeric(&self, value: Value) -> bool {
        value.is_fixnum()
            || matches!(
                self.object_of(value).map(|o| &o.body),
                Some(ObjectBody::Float(_) | ObjectBody::Bignum(_))
            )
    }

    /// `NUM2DBL` on a value.
    pub(crate) fn num_to_f64(&mut self, value: Value) -> CapiResult<f64> {
        if let Some(n) = value.as_fixnum() {
            return Ok(n as f64);
        }
        match self.object_of(value).map(|o| &o.body) {
            Some(ObjectBody::Float(f)) => return Ok(*f),
            Some(ObjectBody::Bignum(n)) => {
                let n = n.clone();
                return Ok(self.bignum_to_f64(&n));
            }
            _ => {}
        }
        let what = if value.is_nil() {
            "nil".to_string()
        } else if self.string_bytes(value).is_some() {
            "string".to_string()
        } else {
            self.class_name_of(value)
        };
        Err(self.type_error(format!("no implicit conversion to float from {what}")))
    }

    /// `NUM2LONG` on a value, honoring `to_int`.
    pub(crate) fn integer_value(&mut self, value: Value) -> CapiResult<i64> {
        if let Some(n) = value.as_fixnum() {
            return Ok(n);
        }
        match self.object_of(value).map(|o| &o.body) {
            Some(ObjectBody::Bignum(n)) => {
                return match n.to_i64() {
                    Some(n) => Ok(n),
                    None => Err(self.error(
                        CApiConstant::RangeError,
                        "bignum too big to convert into `long'",
                    )),
                };
            }
            Some(ObjectBody::Float(f)) => {
                let f = *f;
                if f.is_finite() && f >= i64::MIN as f64 && f < i64::MAX as f64 {
                    return Ok(f as i64);
                }
                let text = crate::runtime::format_float(f);
                return Err(self.error(
                    CApiConstant::RangeError,
                    format!("float {text} out of range of integer"),
                ));
            }
            _ => {}
        }
        if value.is_nil() {
            return Err(self.type_error("no implicit conversion from nil to integer"));
        }
        let to_int = self.intern("to_int");
        if value.is_reference() && self.respond_to_value(value, to_int, true) {
            let converted = self.call_into_managed(
                value,
                to_int,
                &[],
                None,
                crate::runtime::CallStyle::FunctionCall,
            )?;
            if converted.is_fixnum() || self.integer_of(converted).is_some() {
                return self.integer_value(converted);
            }
        }
        let name = self.class_name_of(value);
        Err(self.type_error(format!("can't convert {name} into Integer")))
    }

    pub(crate) fn integer_to_s(&mut self, value: Value, base: i64) -> CapiResult<Value> {
        if !(2..=36).contains(&base) {
            return Err(self.arg_error(format!("invalid radix {base}")));
        }
        let n = self.expect_integer(value)?;
        self.new_string(n.to_str_radix(base as u32))
    }

    fn bignum_to_f64(&self, n: &BigInt) -> f64 {
        match n.to_f64().filter(|f| f.is_finite()) {
            Some(f) => f,
            None => {
                log::warn!("bignum out of Float range");
                if n.is_negative() {
                    f64::NEG_INFINITY
                } else {
                    f64::INFINITY
                }
            }
        }
    }

    fn bignum_of(&mut self, handle: Handle) -> CapiResult<BigInt> {
        let value = self.value_of(handle);
        match self.object_of(value).map(|o| &o.body) {
            Some(ObjectBody::Bignum(n)) => Ok(n.clone()),
            _ => Err(self.wrong_type(value, "Bignum")),
        }
    }

    // =========================================================================
    // Integer Conversions
    // =========================================================================

    /// `INT2NUM`: every `int` fits a fixnum.
    pub fn int2num(&mut self, n: i32) -> Handle {
        Handle::from_bits(Value::fixnum_unchecked(n as i64).bits())
    }

    /// `LONG2NUM`.
    pub fn long2num(&mut self, n: i64) -> CapiResult<Handle> {
        let value = self.new_integer(n)?;
        Ok(self.handle_for(value))
    }

    /// `LL2NUM` / `rb_ll2inum`.
    pub fn ll2inum(&mut self, n: i64) -> CapiResult<Handle> {
        self.long2num(n)
    }

    /// `ULL2NUM` / `rb_ull2inum`.
    pub fn ull2inum(&mut self, n: u64) -> CapiResult<Handle> {
        let value = self.new_bignum(BigInt::from(n))?;
        Ok(self.handle_for(value))
    }

    /// `NUM2LONG`.
    pub fn num2long(&mut self, handle: Handle) -> CapiResult<i64> {
        let value = self.value_of(handle);
        self.integer_value(value)
    }

    /// `NUM2INT`.
    pub fn num2int(&mut self, handle: Handle) -> CapiResult<i32> {
        let n = self.num2long(handle)?;
        match i32::try_from(n) {
            Ok(n) => Ok(n),
            Err(_) => {
                let kind = if n < 0 { "small" } else { "big" };
                Err(self.error(
                    CApiConstant::RangeError,
                    format!("integer {n} too {kind} to convert to `int'"),
                ))
            }
        }
    }

    /// `NUM2ULONG`. Negative fixnums wrap as in C.
    pub fn num2ulong(&mut self, handle: Handle) -> CapiResult<u64> {
        let value = self.value_of(handle);
        if let Some(ObjectBody::Bignum(_)) = self.object_of(value).map(|o| &o.body) {
            return self.big2ulong(handle);
        }
        Ok(self.integer_value(value)? as u64)
    }

    /// `NUM2DBL`.
    pub fn num2dbl(&mut self, handle: Handle) -> CapiResult<f64> {
        let value = self.value_of(handle);
        self.num_to_f64(value)
    }

    /// `rb_float_new`.
    pub fn float_new(&mut self, f: f64) -> CapiResult<Handle> {
        let value = self.new_float(f)?;
        Ok(self.handle_for(value))
    }

    /// `rb_dbl2big`: integral part of a finite float.
    pub fn dbl2big(&mut self, f: f64) -> CapiResult<Handle> {
        let Some(n) = BigInt::from_f64(f.trunc()).filter(|_| f.is_finite()) else {
            let text = crate::runtime::format_float(f);
            return Err(self.error(CApiConstant::FloatDomainError, text));
        };
        let value = self.new_bignum(n)?;
        Ok(self.handle_for(value))
    }

    // =========================================================================
    // Bignum Conversions
    // =========================================================================

    /// `rb_big2long`.
    pub fn big2long(&mut self, handle: Handle) -> CapiResult<i64> {
        let n = self.bignum_of(handle)?;
        match n.to_i64() {
            Some(n) => Ok(n),
            None => Err(self.error(
                CApiConstant::RangeError,
                "bignum too big to convert into `long'",
            )),
        }
    }

    /// `rb_big2ulong`. Negative values within `long` range wrap as in C.
    pub fn big2ulong(&mut self, handle: Handle) -> CapiResult<u64> {
        let n = self.bignum_of(handle)?;
        if let Some(n) = n.to_u64() {
            return Ok(n);
        }
        match n.to_i64() {
            Some(n) => Ok(n as u64),
            None => Err(self.error(
                CApiConstant::RangeError,
                "bignum too big to convert into `unsigned long'",
            )),
        }
    }

    /// `rb_big2dbl`. Out of range values warn and saturate to infinity.
    pub fn big2dbl(&mut self, handle: Handle) -> CapiResult<f64> {
        let n = self.bignum_of(handle)?;
        Ok(self.bignum_to_f64(&n))
    }

    /// `rb_big2str`.
    pub fn big2str(&mut self, handle: Handle, base: u32) -> CapiResult<Handle> {
        let value = self.value_of(handle);
        let value = self.integer_to_s(value, base as i64)?;
        Ok(self.handle_for(value))
    }

    // =========================================================================
    // Symbols
    // =========================================================================

    /// `ID2SYM`.
    pub fn id2sym(&self, id: SymbolId) -> Handle {
        Handle::from_bits(Value::symbol(id).bits())
    }

    /// `SYM2ID`.
    pub fn sym2id(&mut self, handle: Handle) -> CapiResult<SymbolId> {
        let value = self.value_of(handle);
        match value.as_symbol() {
            Some(id) => Ok(id),
            None => Err(self.wrong_type(value, "Symbol")),
        }
    }
}
