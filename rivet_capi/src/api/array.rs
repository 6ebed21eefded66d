//! Array protocol.

use crate::api::constants::CApiConstant;
use crate::error::CapiResult;
use crate::object::array::ARY_MAX_SIZE;
use crate::object::{ArrayBody, ObjectBody};
use crate::runtime::{CallStyle, Runtime};
use rivet_core::{ObjRef, Value};
use rivet_gc::Handle;

impl Runtime {
    // =========================================================================
    // Value Helpers
    // =========================================================================

    pub(crate) fn new_array(&mut self, items: Vec<Value>) -> CapiResult<Value> {
        self.alloc_core(CApiConstant::Array, ObjectBody::Array(ArrayBody::new(items)))
    }

    /// Elements of an Array value; `None` for anything else.
    pub(crate) fn array_items(&self, value: Value) -> Option<&[Value]> {
        self.object_of(value)
            .and_then(|o| o.as_array())
            .map(ArrayBody::items)
    }

    /// Element at `index`, nil when out of range.
    pub(crate) fn array_entry(&self, value: Value, index: i64) -> Value {
        self.object_of(value)
            .and_then(|o| o.as_array())
            .and_then(|a| a.get(index))
            .unwrap_or(Value::NIL)
    }

    pub(crate) fn array_store(&mut self, value: Value, index: i64, item: Value) -> CapiResult<()> {
        let len = self.expect_array_len(value)?;
        let slot = self
            .object_of(value)
            .and_then(|o| o.as_array())
            .and_then(|a| a.normalize(index));
        let Some(slot) = slot else {
            let min = -(len as i64);
            return Err(self.error(
                CApiConstant::IndexError,
                format!("index {index} too small for array; minimum: {min}"),
            ));
        };
        if slot >= ARY_MAX_SIZE {
            return Err(self.error(
                CApiConstant::IndexError,
                format!("index {index} too big"),
            ));
        }
        match self.with_array_mut(value, |a| a.store(slot, item))? {
            Ok(()) => Ok(()),
            Err(err) => {
                log::warn!("array: store at {slot}: {err}");
                let exc = self.no_memory;
                Err(self.raise_value(exc))
            }
        }
    }

    pub(crate) fn array_push(&mut self, value: Value, item: Value) -> CapiResult<()> {
        self.with_array_mut(value, |a| a.push(item))
    }

    pub(crate) fn array_pop(&mut self, value: Value) -> CapiResult<Value> {
        let popped = self.with_array_mut(value, ArrayBody::pop)?;
        Ok(popped.unwrap_or(Value::NIL))
    }

    /// Join the elements' string forms, descending into nested arrays.
    pub(crate) fn join_bytes(&mut self, value: Value, sep: &[u8]) -> CapiResult<Vec<u8>> {
        let mut out = Vec::new();
        let mut active = Vec::new();
        self.join_into(value, sep, &mut out, &mut active)?;
        Ok(out)
    }

    fn join_into(
        &mut self,
        value: Value,
        sep: &[u8],
        out: &mut Vec<u8>,
        active: &mut Vec<ObjRef>,
    ) -> CapiResult<()> {
        let Some(obj) = value.as_ref() else {
            return Ok(());
        };
        if active.contains(&obj) {
            return Err(self.arg_error("recursive array join"));
        }
        active.push(obj);
        let mut first = out.is_empty();
        let mut i = 0;
        while let Some(item) = self.array_items(value).and_then(|items| items.get(i).copied()) {
            i += 1;
            if !first {
                out.extend_from_slice(sep);
            }
            first = false;
            if self.array_items(item).is_some() {
                self.join_into(item, sep, out, active)?;
                continue;
            }
            let bytes = self.to_s_bytes(item)?;
            out.extend_from_slice(&bytes);
        }
        active.pop();
        Ok(())
    }

    /// Bytes of `to_s`, falling back to the default form.
    fn to_s_bytes(&mut self, value: Value) -> CapiResult<Vec<u8>> {
        if let Some(bytes) = self.string_bytes(value) {
            return Ok(bytes.to_vec());
        }
        let to_s = self.intern("to_s");
        let text = self.call_into_managed(value, to_s, &[], None, CallStyle::FunctionCall)?;
        match self.string_bytes(text) {
            Some(bytes) => Ok(bytes.to_vec()),
            None => Ok(self.default_to_s(value).into_bytes()),
        }
    }

    fn expect_array_len(&mut self, value: Value) -> CapiResult<usize> {
        match self.array_items(value) {
            Some(items) => Ok(items.len()),
            None => Err(self.wrong_type(value, "Array")),
        }
    }

    /// Run a mutation on an Array, keeping any view coherent.
    fn with_array_mut<R>(
        &mut self,
        value: Value,
        mutate: impl FnOnce(&mut ArrayBody) -> R,
    ) -> CapiResult<R> {
        self.expect_array_len(value)?;
        self.check_frozen(value)?;
        let Some(obj) = value.as_ref() else {
            return Err(self.wrong_type(value, "Array"));
        };
        self.flush_object(obj);
        let result = match self.get_mut(obj).as_array_mut() {
            Some(a) => mutate(a),
            None => return Err(self.wrong_type(value, "Array")),
        };
        self.refresh_object(obj);
        Ok(result)
    }

    /// Resolve an Array handle, syncing its view first.
    fn array_handle(&mut self, ary: Handle) -> CapiResult<Value> {
        let value = self.value_of(ary);
        self.expect_array_len(value)?;
        if let Some(obj) = value.as_ref() {
            self.sync_object(obj);
        }
        Ok(value)
    }

    // =========================================================================
    // Handle API
    // =========================================================================

    /// `rb_ary_new`.
    pub fn ary_new(&mut self) -> CapiResult<Handle> {
        let value = self.new_array(Vec::new())?;
        Ok(self.handle_for(value))
    }

    /// `rb_ary_new_capa`.
    pub fn ary_new_capa(&mut self, capacity: usize) -> CapiResult<Handle> {
        let value = self.new_array(Vec::with_capacity(capacity))?;
        Ok(self.handle_for(value))
    }

    /// `rb_ary_new_from_values`.
    pub fn ary_new_from(&mut self, items: &[Handle]) -> CapiResult<Handle> {
        let values = items.iter().map(|&h| self.value_of(h)).collect();
        let value = self.new_array(values)?;
        Ok(self.handle_for(value))
    }

    /// `RARRAY_LEN`.
    pub fn ary_len(&mut self, ary: Handle) -> CapiResult<usize> {
        let value = self.array_handle(ary)?;
        Ok(self.array_items(value).map_or(0, <[Value]>::len))
    }

    /// `rb_ary_entry`: nil when out of range.
    pub fn ary_entry(&mut self, ary: Handle, index: i64) -> CapiResult<Handle> {
        let value = self.array_handle(ary)?;
        let item = self.array_entry(value, index);
        Ok(self.handle_for(item))
    }

    /// `rb_ary_store`: pads with nil past the end.
    pub fn ary_store(&mut self, ary: Handle, index: i64, item: Handle) -> CapiResult<()> {
        let value = self.value_of(ary);
        let item = self.value_of(item);
        self.array_store(value, index, item)
    }

    /// `rb_ary_push`.
    pub fn ary_push(&mut self, ary: Handle, item: Handle) -> CapiResult<Handle> {
        let value = self.value_of(ary);
        let item = self.value_of(item);
        self.array_push(value, item)?;
        Ok(ary)
    }

    /// `rb_ary_pop`: nil when empty.
    pub fn ary_pop(&mut self, ary: Handle) -> CapiResult<Handle> {
        let value = self.value_of(ary);
        let item = self.array_pop(value)?;
        Ok(self.handle_for(item))
    }

    /// `rb_ary_shift`: nil when empty.
    pub fn ary_shift(&mut self, ary: Handle) -> CapiResult<Handle> {
        let value = self.value_of(ary);
        let item = self.with_array_mut(value, ArrayBody::shift)?;
        Ok(self.handle_for(item.unwrap_or(Value::NIL)))
    }

    /// `rb_ary_unshift`.
    pub fn ary_unshift(&mut self, ary: Handle, item: Handle) -> CapiResult<Handle> {
        let value = self.value_of(ary);
        let item = self.value_of(item);
        self.with_array_mut(value, |a| a.unshift(item))?;
        Ok(ary)
    }

    /// `rb_ary_clear`.
    pub fn ary_clear(&mut self, ary: Handle) -> CapiResult<Handle> {
        let value = self.value_of(ary);
        self.with_array_mut(value, ArrayBody::clear)?;
        Ok(ary)
    }

    /// `rb_ary_dup`: shallow copy.
    pub fn ary_dup(&mut self, ary: Handle) -> CapiResult<Handle> {
        let value = self.array_handle(ary)?;
        let items = self.array_items(value).map(<[Value]>::to_vec).unwrap_or_default();
        let copy = self.new_array(items)?;
        Ok(self.handle_for(copy))
    }

    /// `rb_ary_subseq`: nil when `start` is past the end.
    pub fn ary_subseq(&mut self, ary: Handle, start: i64, len: i64) -> CapiResult<Handle> {
        let value = self.array_handle(ary)?;
        let items = self.array_items(value).unwrap_or_default();
        let total = items.len() as i64;
        let start = if start < 0 { start + total } else { start };
        if len < 0 || start < 0 || start > total {
            return Ok(Handle::NIL);
        }
        let end = start.saturating_add(len).min(total);
        let slice = items[start as usize..end as usize].to_vec();
        let sub = self.new_array(slice)?;
        Ok(self.handle_for(sub))
    }

    /// `rb_ary_join`; `sep` may be nil.
    pub fn ary_join(&mut self, ary: Handle, sep: Handle) -> CapiResult<Handle> {
        let value = self.array_handle(ary)?;
        let sep = if sep.is_nil() {
            Vec::new()
        } else {
            self.string_value(sep)?
        };
        let bytes = self.join_bytes(value, &sep)?;
        self.str_new(&bytes)
    }

    /// Call `body` with each element; the array may grow while iterating.
    pub fn ary_each(
        &mut self,
        ary: Handle,
        mut body: impl FnMut(&mut Runtime, Handle) -> CapiResult<()>,
    ) -> CapiResult<()> {
        self.array_handle(ary)?;
        let mut i = 0;
        loop {
            // `body` may reach a safepoint, so re-resolve every turn.
            let value = self.value_of(ary);
            let Some(item) = self.array_items(value).and_then(|items| items.get(i).copied()) else {
                break;
            };
            let handle = self.handle_for(item);
            body(self, handle)?;
            i += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CapiConfig;

    fn runtime() -> Runtime {
        Runtime::new(CapiConfig::default()).unwrap()
    }

    fn ints(rt: &mut Runtime, ary: Handle) -> Vec<i64> {
        let mut out = Vec::new();
        rt.ary_each(ary, |rt, h| {
            out.push(rt.num2long(h)?);
            Ok(())
        })
        .unwrap();
        out
    }

    // =========================================================================
    // Access
    // =========================================================================

    #[test]
    fn test_entry_in_and_out_of_range() {
        let mut rt = runtime();
        let items = [rt.int2num(1), rt.int2num(2), rt.int2num(3)];
        let ary = rt.ary_new_from(&items).unwrap();
        assert_eq!(rt.ary_len(ary).unwrap(), 3);
        let last = rt.ary_entry(ary, -1).unwrap();
        assert_eq!(rt.num2long(last).unwrap(), 3);
        assert!(rt.ary_entry(ary, 3).unwrap().is_nil());
        assert!(rt.ary_entry(ary, -4).unwrap().is_nil());
    }

    #[test]
    fn test_store_pads_with_nil() {
        let mut rt = runtime();
        let ary = rt.ary_new().unwrap();
        let seven = rt.int2num(7);
        rt.ary_store(ary, 2, seven).unwrap();
        assert_eq!(rt.ary_len(ary).unwrap(), 3);
        assert!(rt.ary_entry(ary, 0).unwrap().is_nil());
        let stored = rt.ary_entry(ary, 2).unwrap();
        assert_eq!(rt.num2long(stored).unwrap(), 7);
    }

    #[test]
    fn test_store_before_start_is_index_error() {
        let mut rt = runtime();
        let one = rt.int2num(1);
        let ary = rt.ary_new_from(&[one]).unwrap();
        let err = rt.ary_store(ary, -3, one).unwrap_err();
        assert_eq!(rt.class_name_of(err.exception), "IndexError");
        assert_eq!(
            rt.exception_message(err.exception),
            "index -3 too small for array; minimum: -1"
        );
    }

    #[test]
    fn test_store_far_past_end_raises() {
        let mut rt = runtime();
        let one = rt.int2num(1);
        let ary = rt.ary_new_from(&[one]).unwrap();

        let err = rt.ary_store(ary, i64::MAX, Handle::NIL).unwrap_err();
        assert_eq!(rt.class_name_of(err.exception), "IndexError");
        assert_eq!(
            rt.exception_message(err.exception),
            format!("index {} too big", i64::MAX)
        );

        let err = rt
            .ary_store(ary, (ARY_MAX_SIZE - 1) as i64, Handle::NIL)
            .unwrap_err();
        assert_eq!(rt.class_name_of(err.exception), "NoMemoryError");
        assert_eq!(rt.ary_len(ary).unwrap(), 1);
    }

    // =========================================================================
    // Mutation
    // =========================================================================

    #[test]
    fn test_push_pop_shift_unshift() {
        let mut rt = runtime();
        let ary = rt.ary_new().unwrap();
        for i in 1..=3 {
            let n = rt.int2num(i);
            rt.ary_push(ary, n).unwrap();
        }
        let zero = rt.int2num(0);
        rt.ary_unshift(ary, zero).unwrap();
        assert_eq!(ints(&mut rt, ary), vec![0, 1, 2, 3]);

        let popped = rt.ary_pop(ary).unwrap();
        assert_eq!(rt.num2long(popped).unwrap(), 3);
        let shifted = rt.ary_shift(ary).unwrap();
        assert_eq!(rt.num2long(shifted).unwrap(), 0);
        assert_eq!(ints(&mut rt, ary), vec![1, 2]);

        rt.ary_clear(ary).unwrap();
        assert!(rt.ary_pop(ary).unwrap().is_nil());
        assert!(rt.ary_shift(ary).unwrap().is_nil());
    }

    #[test]
    fn test_frozen_array_rejects_push() {
        let mut rt = runtime();
        let ary = rt.ary_new().unwrap();
        rt.obj_freeze(ary);
        let err = rt.ary_push(ary, Handle::NIL).unwrap_err();
        assert_eq!(rt.class_name_of(err.exception), "TypeError");
        assert_eq!(rt.ary_len(ary).unwrap(), 0);
    }

    #[test]
    fn test_dup_and_subseq() {
        let mut rt = runtime();
        let items = [rt.int2num(1), rt.int2num(2), rt.int2num(3)];
        let ary = rt.ary_new_from(&items).unwrap();
        let copy = rt.ary_dup(ary).unwrap();
        rt.ary_pop(copy).unwrap();
        assert_eq!(ints(&mut rt, ary), vec![1, 2, 3]);

        let sub = rt.ary_subseq(ary, 1, 10).unwrap();
        assert_eq!(ints(&mut rt, sub), vec![2, 3]);
        let empty = rt.ary_subseq(ary, 3, 1).unwrap();
        assert_eq!(rt.ary_len(empty).unwrap(), 0);
        assert!(rt.ary_subseq(ary, 4, 1).unwrap().is_nil());
        let tail = rt.ary_subseq(ary, 2, i64::MAX).unwrap();
        assert_eq!(ints(&mut rt, tail), vec![3]);
    }

    // =========================================================================
    // Join
    // =========================================================================

    #[test]
    fn test_join_flattens_nested_arrays() {
        let mut rt = runtime();
        let two = rt.int2num(2);
        let three = rt.int2num(3);
        let inner = rt.ary_new_from(&[two, three]).unwrap();
        let one = rt.int2num(1);
        let word = rt.str_new(b"x").unwrap();
        let outer = rt.ary_new_from(&[one, inner, word]).unwrap();
        let sep = rt.str_new(b",").unwrap();
        let joined = rt.ary_join(outer, sep).unwrap();
        assert_eq!(rt.string_value(joined).unwrap(), b"1,2,3,x");
        let bare = rt.ary_join(outer, Handle::NIL).unwrap();
        assert_eq!(rt.string_value(bare).unwrap(), b"123x");
    }

    #[test]
    fn test_recursive_join_is_argument_error() {
        let mut rt = runtime();
        let ary = rt.ary_new().unwrap();
        rt.ary_push(ary, ary).unwrap();
        let err = rt.ary_join(ary, Handle::NIL).unwrap_err();
        assert_eq!(rt.exception_message(err.exception), "recursive array join");
    }
}
