//! Hash protocol.

use crate::api::constants::CApiConstant;
use crate::error::CapiResult;
use crate::object::{HashBody, HashKey, Object, ObjectBody, StringBody};
use crate::runtime::Runtime;
use rivet_core::Value;
use rivet_gc::Handle;

/// What [`Runtime::hash_foreach`] does after each pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForeachControl {
    /// `ST_CONTINUE`.
    Continue,
    /// `ST_STOP`.
    Stop,
    /// `ST_DELETE`: remove the pair just visited and continue.
    Delete,
}

impl Runtime {
    // =========================================================================
    // Value Helpers
    // =========================================================================

    /// Lookup key: strings by content, floats and bignums by value.
    pub(crate) fn hash_key(&self, key: Value) -> HashKey {
        match self.object_of(key).map(|o| &o.body) {
            Some(ObjectBody::String(s)) => HashKey::Bytes(s.bytes().to_vec()),
            Some(ObjectBody::Float(f)) => {
                let f = if *f == 0.0 { 0.0 } else { *f };
                HashKey::Float(f.to_bits())
            }
            Some(ObjectBody::Bignum(n)) => HashKey::Big(n.clone()),
            _ => HashKey::Word(key.bits()),
        }
    }

    fn expect_hash(&mut self, value: Value) -> CapiResult<()> {
        if self.object_of(value).and_then(Object::as_hash).is_none() {
            return Err(self.wrong_type(value, "Hash"));
        }
        Ok(())
    }

    fn hash_body_mut(&mut self, value: Value) -> Option<&mut HashBody> {
        self.object_of_mut(value).and_then(Object::as_hash_mut)
    }

    /// Value for `key`, or the hash default.
    pub(crate) fn hash_get(&mut self, hash: Value, key: Value) -> CapiResult<Value> {
        self.expect_hash(hash)?;
        let key = self.hash_key(key);
        let body = self.object_of(hash).and_then(Object::as_hash);
        Ok(body.map_or(Value::NIL, |h| h.get(&key).unwrap_or(h.default)))
    }

    /// Store a pair. Unfrozen String keys are copied and frozen first.
    pub(crate) fn hash_set(&mut self, hash: Value, key: Value, value: Value) -> CapiResult<()> {
        self.expect_hash(hash)?;
        self.check_frozen(hash)?;
        let hash_key = self.hash_key(key);
        let key = match &hash_key {
            HashKey::Bytes(bytes) if !self.is_frozen(key) => {
                let copy = self.alloc_core(
                    CApiConstant::String,
                    ObjectBody::String(StringBody::new(bytes.clone())),
                )?;
                if let Some(o) = self.object_of_mut(copy) {
                    o.frozen = true;
                }
                copy
            }
            _ => key,
        };
        if let Some(h) = self.hash_body_mut(hash) {
            h.insert(hash_key, key, value);
        }
        Ok(())
    }

    /// Remove `key`, returning its value or nil.
    pub(crate) fn hash_remove(&mut self, hash: Value, key: Value) -> CapiResult<Value> {
        self.expect_hash(hash)?;
        self.check_frozen(hash)?;
        let key = self.hash_key(key);
        Ok(self
            .hash_body_mut(hash)
            .and_then(|h| h.remove(&key))
            .unwrap_or(Value::NIL))
    }

    // =========================================================================
    // Handle API
    // =========================================================================

    /// `rb_hash_new`.
    pub fn hash_new(&mut self) -> CapiResult<Handle> {
        let value = self.alloc_core(CApiConstant::Hash, ObjectBody::Hash(HashBody::new()))?;
        Ok(self.handle_for(value))
    }

    /// `rb_hash_aref`: the default when missing.
    pub fn hash_aref(&mut self, hash: Handle, key: Handle) -> CapiResult<Handle> {
        let hash = self.value_of(hash);
        let key = self.value_of(key);
        let value = self.hash_get(hash, key)?;
        Ok(self.handle_for(value))
    }

    /// `rb_hash_lookup2`: `missing` instead of the default.
    pub fn hash_lookup2(&mut self, hash: Handle, key: Handle, missing: Handle) -> CapiResult<Handle> {
        let hash = self.value_of(hash);
        self.expect_hash(hash)?;
        let key = self.hash_key(self.value_of(key));
        let found = self
            .object_of(hash)
            .and_then(Object::as_hash)
            .and_then(|h| h.get(&key));
        match found {
            Some(value) => Ok(self.handle_for(value)),
            None => Ok(missing),
        }
    }

    /// `rb_hash_aset`.
    pub fn hash_aset(&mut self, hash: Handle, key: Handle, value: Handle) -> CapiResult<Handle> {
        let (h, k, v) = (self.value_of(hash), self.value_of(key), self.value_of(value));
        self.hash_set(h, k, v)?;
        Ok(value)
    }

    /// `rb_hash_delete`: nil when absent.
    pub fn hash_delete(&mut self, hash: Handle, key: Handle) -> CapiResult<Handle> {
        let (h, k) = (self.value_of(hash), self.value_of(key));
        let removed = self.hash_remove(h, k)?;
        Ok(self.handle_for(removed))
    }

    /// `RHASH_SIZE`.
    pub fn hash_size(&mut self, hash: Handle) -> CapiResult<usize> {
        let hash = self.value_of(hash);
        self.expect_hash(hash)?;
        Ok(self.object_of(hash).and_then(Object::as_hash).map_or(0, HashBody::len))
    }

    /// `rb_hash_clear`.
    pub fn hash_clear(&mut self, hash: Handle) -> CapiResult<Handle> {
        let value = self.value_of(hash);
        self.expect_hash(value)?;
        self.check_frozen(value)?;
        if let Some(h) = self.hash_body_mut(value) {
            h.clear();
        }
        Ok(hash)
    }

    /// `RHASH_SET_IFNONE`: value returned for missing keys.
    pub fn hash_set_ifnone(&mut self, hash: Handle, default: Handle) -> CapiResult<Handle> {
        let value = self.value_of(hash);
        self.expect_hash(value)?;
        let default = self.value_of(default);
        if let Some(h) = self.hash_body_mut(value) {
            h.default = default;
        }
        Ok(hash)
    }

    /// `rb_hash_foreach`.
    ///
    /// Visits the pairs present when iteration starts, in insertion
    /// order; pairs added by `body` are not visited.
    pub fn hash_foreach(
        &mut self,
        hash: Handle,
        mut body: impl FnMut(&mut Runtime, Handle, Handle) -> CapiResult<ForeachControl>,
    ) -> CapiResult<()> {
        let value = self.value_of(hash);
        self.expect_hash(value)?;
        let pairs: Vec<(Value, Value)> = self
            .object_of(value)
            .and_then(Object::as_hash)
            .map(|h| h.iter().collect())
            .unwrap_or_default();
        // Handles keep every pair reachable, and current, across `body`.
        let pairs: Vec<(Handle, Handle)> = pairs
            .into_iter()
            .map(|(k, v)| (self.handle_for(k), self.handle_for(v)))
            .collect();
        for (k, v) in pairs {
            match body(self, k, v)? {
                ForeachControl::Continue => {}
                ForeachControl::Stop => break,
                ForeachControl::Delete => {
                    let (h, k) = (self.value_of(hash), self.value_of(k));
                    self.hash_remove(h, k)?;
                }
            }
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

    #[test]
    fn test_string_keys_match_by_content() {
        let mut rt = runtime();
        let h = rt.hash_new().unwrap();
        let k1 = rt.str_new(b"key").unwrap();
        let k2 = rt.str_new(b"key").unwrap();
        let v = rt.int2num(5);
        rt.hash_aset(h, k1, v).unwrap();
        let got = rt.hash_aref(h, k2).unwrap();
        assert_eq!(rt.num2long(got).unwrap(), 5);
        assert_eq!(rt.hash_size(h).unwrap(), 1);
    }

    #[test]
    fn test_string_key_is_copied_and_frozen() {
        let mut rt = runtime();
        let h = rt.hash_new().unwrap();
        let k = rt.str_new(b"key").unwrap();
        rt.hash_aset(h, k, Handle::TRUE).unwrap();
        rt.str_cat(k, b"!").unwrap();
        let mut keys = Vec::new();
        rt.hash_foreach(h, |rt, key, _| {
            keys.push((rt.string_value(key)?, rt.obj_frozen(key)));
            Ok(ForeachControl::Continue)
        })
        .unwrap();
        assert_eq!(keys, vec![(b"key".to_vec(), true)]);
    }

    #[test]
    fn test_missing_key_default_and_lookup2() {
        let mut rt = runtime();
        let h = rt.hash_new().unwrap();
        let k = rt.int2num(1);
        assert!(rt.hash_aref(h, k).unwrap().is_nil());
        let zero = rt.int2num(0);
        rt.hash_set_ifnone(h, zero).unwrap();
        let got = rt.hash_aref(h, k).unwrap();
        assert_eq!(rt.num2long(got).unwrap(), 0);
        assert_eq!(rt.hash_lookup2(h, k, Handle::UNDEF).unwrap(), Handle::UNDEF);
    }

    #[test]
    fn test_float_and_bignum_keys_by_value() {
        let mut rt = runtime();
        let h = rt.hash_new().unwrap();
        let f1 = rt.float_new(1.5).unwrap();
        let f2 = rt.float_new(1.5).unwrap();
        rt.hash_aset(h, f1, Handle::TRUE).unwrap();
        assert_eq!(rt.hash_aref(h, f2).unwrap(), Handle::TRUE);

        let b1 = rt.ull2inum(u64::MAX).unwrap();
        let b2 = rt.ull2inum(u64::MAX).unwrap();
        rt.hash_aset(h, b1, Handle::FALSE).unwrap();
        assert_eq!(rt.hash_aref(h, b2).unwrap(), Handle::FALSE);
    }

    #[test]
    fn test_foreach_stop_and_delete() {
        let mut rt = runtime();
        let h = rt.hash_new().unwrap();
        for i in 0..4 {
            let k = rt.int2num(i);
            let v = rt.int2num(i * 10);
            rt.hash_aset(h, k, v).unwrap();
        }
        rt.hash_foreach(h, |rt, k, _| {
            let even = rt.num2long(k)? % 2 == 0;
            Ok(if even {
                ForeachControl::Delete
            } else {
                ForeachControl::Continue
            })
        })
        .unwrap();
        assert_eq!(rt.hash_size(h).unwrap(), 2);

        let mut seen = 0;
        rt.hash_foreach(h, |_, _, _| {
            seen += 1;
            Ok(ForeachControl::Stop)
        })
        .unwrap();
        assert_eq!(seen, 1);
    }

    #[test]
    fn test_delete_and_frozen() {
        let mut rt = runtime();
        let h = rt.hash_new().unwrap();
        let k = rt.int2num(1);
        rt.hash_aset(h, k, Handle::TRUE).unwrap();
        assert_eq!(rt.hash_delete(h, k).unwrap(), Handle::TRUE);
        assert!(rt.hash_delete(h, k).unwrap().is_nil());
        rt.obj_freeze(h);
        let err = rt.hash_aset(h, k, Handle::TRUE).unwrap_err();
        assert_eq!(rt.class_name_of(err.exception), "TypeError");
    }
}
