//! String protocol.
//!
//! Mutators flush any outstanding view of the string first and refresh
//! it afterwards, so a resize leaves the view stale instead of silently
//! writing through an old buffer.

use crate::api::constants::CApiConstant;
use crate::error::CapiResult;
use crate::object::{ObjectBody, StringBody};
use crate::runtime::{CallStyle, Runtime};
use rivet_core::Value;
use rivet_gc::Handle;
use std::cmp::Ordering;
use std::ffi::{CStr, CString};

impl Runtime {
    // =========================================================================
    // Value Helpers
    // =========================================================================

    pub(crate) fn new_string(&mut self, bytes: impl AsRef<[u8]>) -> CapiResult<Value> {
        let body = StringBody::new(bytes.as_ref().to_vec());
        self.alloc_core(CApiConstant::String, ObjectBody::String(body))
    }

    /// Bytes of a String value; `None` for anything else.
    pub(crate) fn string_bytes(&self, value: Value) -> Option<&[u8]> {
        self.object_of(value)
            .and_then(|o| o.as_string())
            .map(StringBody::bytes)
    }

    pub(crate) fn expect_string_bytes(&mut self, value: Value) -> CapiResult<&[u8]> {
        if self.string_bytes(value).is_none() {
            return Err(self.wrong_type(value, "String"));
        }
        Ok(self.string_bytes(value).unwrap_or_default())
    }

    pub(crate) fn string_append_value(&mut self, value: Value, bytes: &[u8]) -> CapiResult<()> {
        self.with_string_mut(value, |s| s.append(bytes))
    }

    /// Run a mutation on a String, keeping any view coherent.
    fn with_string_mut(
        &mut self,
        value: Value,
        mutate: impl FnOnce(&mut StringBody),
    ) -> CapiResult<()> {
        self.expect_string_bytes(value)?;
        self.check_frozen(value)?;
        let Some(obj) = value.as_ref() else {
            return Ok(());
        };
        self.flush_object(obj);
        if let Some(s) = self.get_mut(obj).as_string_mut() {
            mutate(s);
        }
        self.refresh_object(obj);
        Ok(())
    }

    /// Resolve a String handle, syncing its view so reads see native writes.
    fn string_handle(&mut self, string: Handle) -> CapiResult<Value> {
        let value = self.value_of(string);
        self.expect_string_bytes(value)?;
        if let Some(obj) = value.as_ref() {
            self.sync_object(obj);
        }
        Ok(value)
    }

    // =========================================================================
    // Construction
    // =========================================================================

    /// `rb_str_new`.
    pub fn str_new(&mut self, bytes: &[u8]) -> CapiResult<Handle> {
        let value = self.new_string(bytes)?;
        Ok(self.handle_for(value))
    }

    /// `rb_str_new2` / `rb_str_new_cstr`.
    pub fn str_new_cstr(&mut self, cstr: &CStr) -> CapiResult<Handle> {
        self.str_new(cstr.to_bytes())
    }

    /// `rb_str_buf_new`: empty String with reserved capacity.
    pub fn str_buf_new(&mut self, capacity: usize) -> CapiResult<Handle> {
        let body = StringBody::new(Vec::with_capacity(capacity));
        let value = self.alloc_core(CApiConstant::String, ObjectBody::String(body))?;
        Ok(self.handle_for(value))
    }

    /// `rb_str_dup`: same class, fresh buffer.
    pub fn str_dup(&mut self, string: Handle) -> CapiResult<Handle> {
        let value = self.string_handle(string)?;
        let bytes = self.string_bytes(value).map(<[u8]>::to_vec).unwrap_or_default();
        let class = self.real_class(value);
        let copy = self.alloc(class, ObjectBody::String(StringBody::new(bytes)))?;
        Ok(self.handle_for(copy))
    }

    // =========================================================================
    // Reading
    // =========================================================================

    /// `RSTRING_LEN`.
    pub fn str_len(&mut self, string: Handle) -> CapiResult<usize> {
        let value = self.string_handle(string)?;
        Ok(self.string_bytes(value).map_or(0, <[u8]>::len))
    }

    /// `rb_str_to_str`: the String itself, or the result of `to_str`.
    pub fn str_to_str(&mut self, obj: Handle) -> CapiResult<Handle> {
        let value = self.value_of(obj);
        if self.string_bytes(value).is_some() {
            return Ok(obj);
        }
        let to_str = self.intern("to_str");
        if self.respond_to_value(value, to_str, true) {
            let converted =
                self.call_into_managed(value, to_str, &[], None, CallStyle::FunctionCall)?;
            if self.string_bytes(converted).is_some() {
                return Ok(self.handle_for(converted));
            }
            let name = self.class_name_of(value);
            let got = self.class_name_of(converted);
            return Err(self.type_error(format!(
                "can't convert {name} to String ({name}#to_str gives {got})"
            )));
        }
        let name = if value.is_nil() {
            "nil".to_string()
        } else {
            self.class_name_of(value)
        };
        Err(self.type_error(format!("can't convert {name} into String")))
    }

    /// `StringValue`: the bytes of a String or of its `to_str`.
    pub fn string_value(&mut self, obj: Handle) -> CapiResult<Vec<u8>> {
        let string = self.str_to_str(obj)?;
        let value = self.string_handle(string)?;
        Ok(self.string_bytes(value).map(<[u8]>::to_vec).unwrap_or_default())
    }

    /// `StringValueCStr`: rejects embedded NUL bytes.
    pub fn string_value_cstr(&mut self, obj: Handle) -> CapiResult<CString> {
        let bytes = self.string_value(obj)?;
        match CString::new(bytes) {
            Ok(cstr) => Ok(cstr),
            Err(_) => Err(self.arg_error("string contains null byte")),
        }
    }

    /// `rb_str_cmp`: bytewise, returning -1, 0 or 1.
    pub fn str_cmp(&mut self, a: Handle, b: Handle) -> CapiResult<i32> {
        let a = self.string_handle(a)?;
        let b = self.string_handle(b)?;
        let ordering = self.string_bytes(a).cmp(&self.string_bytes(b));
        Ok(match ordering {
            Ordering::Less => -1,
            Ordering::Equal => 0,
            Ordering::Greater => 1,
        })
    }

    /// `rb_str_substr`; nil when `start` is out of range or `len` negative.
    pub fn str_substr(&mut self, string: Handle, start: i64, len: i64) -> CapiResult<Handle> {
        let value = self.string_handle(string)?;
        let bytes = self.string_bytes(value).unwrap_or_default();
        let total = bytes.len() as i64;
        let start = if start < 0 { start + total } else { start };
        if len < 0 || start < 0 || start > total {
            return Ok(Handle::NIL);
        }
        let end = start.saturating_add(len).min(total);
        let slice = bytes[start as usize..end as usize].to_vec();
        self.str_new(&slice)
    }

    /// `rb_str_intern`.
    pub fn str_intern(&mut self, string: Handle) -> CapiResult<Handle> {
        let value = self.string_handle(string)?;
        let text = String::from_utf8_lossy(self.string_bytes(value).unwrap_or_default()).into_owned();
        let id = self.intern(&text);
        Ok(self.id2sym(id))
    }

    // =========================================================================
    // Mutation
    // =========================================================================

    /// `rb_str_cat`.
    pub fn str_cat(&mut self, string: Handle, bytes: &[u8]) -> CapiResult<Handle> {
        let value = self.value_of(string);
        self.string_append_value(value, bytes)?;
        Ok(string)
    }

    /// `rb_str_cat2`.
    pub fn str_cat_cstr(&mut self, string: Handle, cstr: &CStr) -> CapiResult<Handle> {
        self.str_cat(string, cstr.to_bytes())
    }

    /// `rb_str_append`: append another String.
    pub fn str_append(&mut self, string: Handle, other: Handle) -> CapiResult<Handle> {
        let other = self.string_value(other)?;
        self.str_cat(string, &other)
    }

    /// `rb_str_resize`: truncate or zero-extend.
    pub fn str_resize(&mut self, string: Handle, len: usize) -> CapiResult<Handle> {
        let value = self.value_of(string);
        self.with_string_mut(value, |s| s.resize(len))?;
        Ok(string)
    }

    /// `rb_str_update` analogue: replace the whole contents.
    pub fn str_replace(&mut self, string: Handle, bytes: &[u8]) -> CapiResult<Handle> {
        let value = self.value_of(string);
        self.with_string_mut(value, |s| s.replace(bytes))?;
        Ok(string)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CapiConfig;

    fn runtime() -> Runtime {
        Runtime::new(CapiConfig::default()).unwrap()
    }

    #[test]
    fn test_new_and_read() {
        let mut rt = runtime();
        let s = rt.str_new(b"hello").unwrap();
        assert_eq!(rt.str_len(s).unwrap(), 5);
        assert_eq!(rt.string_value(s).unwrap(), b"hello");
        let c = rt.str_new_cstr(c"from c").unwrap();
        assert_eq!(rt.string_value(c).unwrap(), b"from c");
    }

    #[test]
    fn test_cat_and_resize() {
        let mut rt = runtime();
        let s = rt.str_new(b"ab").unwrap();
        rt.str_cat(s, b"cd").unwrap();
        rt.str_cat_cstr(s, c"e").unwrap();
        assert_eq!(rt.string_value(s).unwrap(), b"abcde");
        rt.str_resize(s, 2).unwrap();
        assert_eq!(rt.string_value(s).unwrap(), b"ab");
        rt.str_resize(s, 4).unwrap();
        assert_eq!(rt.string_value(s).unwrap(), b"ab\0\0");
    }

    #[test]
    fn test_frozen_string_rejects_cat() {
        let mut rt = runtime();
        let s = rt.str_new(b"ice").unwrap();
        rt.obj_freeze(s);
        let err = rt.str_cat(s, b"!").unwrap_err();
        assert_eq!(rt.class_name_of(err.exception), "TypeError");
        assert_eq!(rt.string_value(s).unwrap(), b"ice");
    }

    #[test]
    fn test_string_value_conversion() {
        let mut rt = runtime();
        let err = rt.string_value(Handle::NIL).unwrap_err();
        assert_eq!(rt.exception_message(err.exception), "can't convert nil into String");
        let one = rt.int2num(1);
        let err = rt.string_value(one).unwrap_err();
        assert_eq!(rt.class_name_of(err.exception), "TypeError");
    }

    #[test]
    fn test_string_value_cstr_rejects_nul() {
        let mut rt = runtime();
        let ok = rt.str_new(b"plain").unwrap();
        assert_eq!(rt.string_value_cstr(ok).unwrap().as_bytes(), b"plain");
        let bad = rt.str_new(b"a\0b").unwrap();
        let err = rt.string_value_cstr(bad).unwrap_err();
        assert_eq!(rt.class_name_of(err.exception), "ArgumentError");
    }

    #[test]
    fn test_dup_is_independent() {
        let mut rt = runtime();
        let s = rt.str_new(b"one").unwrap();
        let d = rt.str_dup(s).unwrap();
        rt.str_cat(d, b"!").unwrap();
        assert_eq!(rt.string_value(s).unwrap(), b"one");
        assert_eq!(rt.string_value(d).unwrap(), b"one!");
    }

    #[test]
    fn test_cmp_and_substr() {
        let mut rt = runtime();
        let a = rt.str_new(b"abc").unwrap();
        let b = rt.str_new(b"abd").unwrap();
        assert_eq!(rt.str_cmp(a, b).unwrap(), -1);
        assert_eq!(rt.str_cmp(b, a).unwrap(), 1);
        assert_eq!(rt.str_cmp(a, a).unwrap(), 0);

        let sub = rt.str_substr(a, 1, 5).unwrap();
        assert_eq!(rt.string_value(sub).unwrap(), b"bc");
        let tail = rt.str_substr(a, -1, 1).unwrap();
        assert_eq!(rt.string_value(tail).unwrap(), b"c");
        assert!(rt.str_substr(a, 4, 1).unwrap().is_nil());
    }

    #[test]
    fn test_substr_length_saturates() {
        let mut rt = runtime();
        let s = rt.str_new(b"abc").unwrap();
        let sub = rt.str_substr(s, 1, i64::MAX).unwrap();
        assert_eq!(rt.string_value(sub).unwrap(), b"bc");
        let whole = rt.str_substr(s, -3, i64::MAX).unwrap();
        assert_eq!(rt.string_value(whole).unwrap(), b"abc");
    }

    #[test]
    fn test_intern() {
        let mut rt = runtime();
        let s = rt.str_new(b"name").unwrap();
        let sym = rt.str_intern(s).unwrap();
        let id = rt.intern("name");
        assert_eq!(rt.sym2id(sym).unwrap(), id);
    }
}
