//! Native global handle registry.
//!
//! Native extensions keep handles in their own static storage and register
//! the storage address. The registry reads the address whenever it needs to
//! know what the extension currently holds, so re-assigning the global
//! after registration is picked up without another call.

use super::handles::Handle;
use rustc_hash::FxHashSet;
use std::ptr::NonNull;
use std::sync::Arc;

struct GlobalEntry {
    name: Arc<str>,
    address: NonNull<Handle>,
}

/// Registered native global addresses.
#[derive(Default)]
pub struct GlobalRegistry {
    entries: Vec<GlobalEntry>,
}

// SAFETY: addresses are only dereferenced by the thread holding the
// runtime, which is serialized by the runtime lock.
unsafe impl Send for GlobalRegistry {}

impl GlobalRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a storage address under `name`.
    ///
    /// Registering an address twice renames the existing entry and
    /// returns false.
    ///
    /// # Safety
    ///
    /// `address` must stay valid for reads until it is unregistered.
    pub unsafe fn register(&mut self, name: &str, address: NonNull<Handle>) -> bool {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.address == address) {
            entry.name = Arc::from(name);
            return false;
        }
        self.entries.push(GlobalEntry {
            name: Arc::from(name),
            address,
        });
        true
    }

    /// Forget a storage address.
    pub fn unregister(&mut self, address: NonNull<Handle>) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.address != address);
        self.entries.len() != before
    }

    /// Whether `address` is registered.
    pub fn contains(&self, address: NonNull<Handle>) -> bool {
        self.entries.iter().any(|e| e.address == address)
    }

    /// Current contents of every registered address.
    pub fn current(&self) -> impl Iterator<Item = (&str, Handle)> + '_ {
        self.entries.iter().map(|e| {
            // SAFETY: guaranteed valid by the `register` contract.
            let handle = unsafe { e.address.as_ptr().read_volatile() };
            (&*e.name, handle)
        })
    }

    /// Set of handles currently stored in registered addresses.
    pub fn snapshot(&self) -> FxHashSet<Handle> {
        self.current()
            .map(|(_, h)| h)
            .filter(|h| h.is_reference())
            .collect()
    }

    /// Number of registered addresses.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
