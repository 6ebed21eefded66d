//! Insertion-ordered hash storage.
//!
//! Keys are indexed by a [`HashKey`] computed by the runtime: strings by
//! content, floats and bignums by value, everything else by identity.
//! Deleted entries leave tombstones that are squeezed out once they
//! outnumber the live entries.

use num_bigint::BigInt;
use rivet_core::Value;
use rivet_gc::Forwarding;
use rustc_hash::FxHashMap;

/// Lookup key derived from a key value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HashKey {
    /// Immediates and identity-compared references, by word.
    Word(u64),
    /// Strings, by content.
    Bytes(Vec<u8>),
    /// Floats, by bit pattern.
    Float(u64),
    /// Bignums, by value.
    Big(BigInt),
}

impl HashKey {
    fn relocate(&mut self, fwd: &Forwarding) {
        if let HashKey::Word(bits) = self {
            *bits = fwd.forward_value(Value::from_bits(*bits)).bits();
        }
    }
}

#[derive(Debug, Clone)]
struct Entry {
    key: HashKey,
    k: Value,
    v: Value,
}

/// Hash body.
#[derive(Debug, Clone)]
pub struct HashBody {
    entries: Vec<Option<Entry>>,
    index: FxHashMap<HashKey, usize>,
    /// Value returned for missing keys.
    pub default: Value,
}

impl Default for HashBody {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            index: FxHashMap::default(),
            default: Value::NIL,
        }
    }
}

impl HashBody {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.index.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Value for `key`.
    pub fn get(&self, key: &HashKey) -> Option<Value> {
        let &slot = self.index.get(key)?;
        self.entries[slot].as_ref().map(|e| e.v)
    }

    /// Insert or overwrite. The original key object is kept on overwrite.
    pub fn insert(&mut self, key: HashKey, k: Value, v: Value) {
        if let Some(&slot) = self.index.get(&key) {
            if let Some(entry) = self.entries[slot].as_mut() {
                entry.v = v;
                return;
            }
        }
        self.index.insert(key.clone(), self.entries.len());
        self.entries.push(Some(Entry { key, k, v }));
    }

    /// Remove `key`, returning its value.
    pub fn remove(&mut self, key: &HashKey) -> Option<Value> {
        let slot = self.index.remove(key)?;
        let entry = self.entries[slot].take();
        if self.entries.len() > 8 && self.index.len() * 2 < self.entries.len() {
            self.squeeze();
        }
        entry.map(|e| e.v)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.index.clear();
    }

    /// Live `(key, value)` pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (Value, Value)> + '_ {
        self.entries.iter().flatten().map(|e| (e.k, e.v))
    }

    /// Pair at position `n` in insertion order.
    pub fn nth(&self, n: usize) -> Option<(Value, Value)> {
        self.iter().nth(n)
    }

    /// All held values, keys and default included.
    pub fn values(&self) -> impl Iterator<Item = Value> + '_ {
        self.entries
            .iter()
            .flatten()
            .flat_map(|e| [e.k, e.v])
            .chain(std::iter::once(self.default))
    }

    /// Rewrite keys, values and the index after compaction.
    pub fn relocate(&mut self, fwd: &Forwarding) {
        fwd.update(&mut self.default);
        self.index.clear();
        for (slot, entry) in self.entries.iter_mut().enumerate() {
            if let Some(entry) = entry {
                fwd.update(&mut entry.k);
                fwd.update(&mut entry.v);
                entry.key.relocate(fwd);
                self.index.insert(entry.key.clone(), slot);
            }
        }
    }

    fn squeeze(&mut self) {
        self.entries.retain(Option::is_some);
        self.index.clear();
        for (slot, entry) in self.entries.iter().enumerate() {
            if let Some(entry) = entry {
                self.index.insert(entry.key.clone(), slot);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rivet_core::ObjRef;

    fn int(n: i64) -> Value {
        Value::fixnum_unchecked(n)
    }

    fn word(v: Value) -> HashKey {
        HashKey::Word(v.bits())
    }

    #[test]
    fn test_insertion_order_and_overwrite() {
        let mut h = HashBody::new();
        h.insert(word(int(2)), int(2), int(20));
        h.insert(word(int(1)), int(1), int(10));
        h.insert(word(int(2)), int(2), int(21));
        let pairs: Vec<_> = h.iter().collect();
        assert_eq!(pairs, vec![(int(2), int(21)), (int(1), int(10))]);
    }

    #[test]
    fn test_string_keys_by_content() {
        let mut h = HashBody::new();
        let a = Value::reference(ObjRef(1));
        let b = Value::reference(ObjRef(2));
        h.insert(HashKey::Bytes(b"k".to_vec()), a, int(1));
        h.insert(HashKey::Bytes(b"k".to_vec()), b, int(2));
        assert_eq!(h.len(), 1);
        assert_eq!(h.nth(0), Some((a, int(2))));
    }

    #[test]
    fn test_remove_and_squeeze() {
        let mut h = HashBody::new();
        for i in 0..20 {
            h.insert(word(int(i)), int(i), int(i * 10));
        }
        for i in 0..15 {
            assert_eq!(h.remove(&word(int(i))), Some(int(i * 10)));
        }
        assert_eq!(h.len(), 5);
        assert_eq!(h.get(&word(int(17))), Some(int(170)));
        assert_eq!(h.nth(0), Some((int(15), int(150))));
        assert_eq!(h.remove(&word(int(0))), None);
    }

    #[test]
    fn test_relocate_identity_keys() {
        let mut h = HashBody::new();
        let k = Value::reference(ObjRef(9));
        h.insert(word(k), k, int(1));
        let mut fwd = Forwarding::new();
        fwd.insert(ObjRef(9), ObjRef(3));
        h.relocate(&fwd);
        let moved = Value::reference(ObjRef(3));
        assert_eq!(h.get(&word(moved)), Some(int(1)));
        assert_eq!(h.nth(0), Some((moved, int(1))));
    }
}
