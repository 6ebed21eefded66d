//! Array storage.

use rivet_core::Value;
use std::collections::TryReserveError;

/// Largest index an array can grow to.
pub const ARY_MAX_SIZE: usize = isize::MAX as usize / std::mem::size_of::<Value>();

/// Array body.
///
/// `epoch` advances whenever the length changes.
#[derive(Debug, Clone, Default)]
pub struct ArrayBody {
    items: Vec<Value>,
    epoch: u32,
}

impl ArrayBody {
    /// Create from elements.
    pub fn new(items: Vec<Value>) -> Self {
        Self { items, epoch: 0 }
    }

    /// Elements.
    #[inline]
    pub fn items(&self) -> &[Value] {
        &self.items
    }

    /// Elements, for edits that keep the length.
    #[inline]
    pub fn items_mut(&mut self) -> &mut [Value] {
        &mut self.items
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Resize epoch.
    #[inline]
    pub fn epoch(&self) -> u32 {
        self.epoch
    }

    /// Element at a possibly negative index; `None` when out of range.
    pub fn get(&self, index: i64) -> Option<Value> {
        let index = self.normalize(index)?;
        self.items.get(index).copied()
    }

    /// Resolve a negative index against the length.
    pub fn normalize(&self, index: i64) -> Option<usize> {
        if index < 0 {
            let from_end = index.unsigned_abs() as usize;
            self.items.len().checked_sub(from_end)
        } else {
            Some(index as usize)
        }
    }

    /// Store at a non-negative index, padding with nil. Fails without
    /// touching the array when the padding cannot be allocated.
    pub fn store(&mut self, index: usize, value: Value) -> Result<(), TryReserveError> {
        if index >= self.items.len() {
            self.items.try_reserve(index + 1 - self.items.len())?;
            self.bump();
            self.items.resize(index + 1, Value::NIL);
        }
        self.items[index] = value;
        Ok(())
    }

    pub fn push(&mut self, value: Value) {
        self.bump();
        self.items.push(value);
    }

    pub fn pop(&mut self) -> Option<Value> {
        let v = self.items.pop();
        if v.is_some() {
            self.bump();
        }
        v
    }

    pub fn shift(&mut self) -> Option<Value> {
        if self.items.is_empty() {
            return None;
        }
        self.bump();
        Some(self.items.remove(0))
    }

    pub fn unshift(&mut self, value: Value) {
        self.bump();
        self.items.insert(0, value);
    }

    pub fn remove(&mut self, index: usize) -> Option<Value> {
        if index >= self.items.len() {
            return None;
        }
        self.bump();
        Some(self.items.remove(index))
    }

    pub fn clear(&mut self) {
        if !self.items.is_empty() {
            self.bump();
            self.items.clear();
        }
    }

    /// Append several elements.
    pub fn extend(&mut self, values: &[Value]) {
        if !values.is_empty() {
            self.bump();
            self.items.extend_from_slice(values);
        }
    }

    /// Replace every element.
    pub fn replace(&mut self, values: Vec<Value>) {
        if values.len() != self.items.len() {
            self.bump();
        }
        self.items = values;
    }

    #[inline]
    fn bump(&mut self) {
        self.epoch = self.epoch.wrapping_add(1);
    }
}
