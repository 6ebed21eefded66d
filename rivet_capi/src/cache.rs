//! Buffer views: raw pointers into String and Array storage.
//!
//! Native code wants a stable `char *` or `VALUE *`; the collector wants
//! to move and resize objects. A mutable view resolves this with a
//! write-back cache owned by the bridge:
//!
//! ```text
//!   checkout ──► cache ◄─── refresh ────┐
//!                  │                    │
//!                  └──── flush ───► object (heap)
//! ```
//!
//! Exactly one side is authoritative at a time. Checkout and refresh make
//! the cache authoritative. Bridge reads and explicit flushes write the
//! cache back and leave it authoritative. Bridge mutators and every
//! transition into managed code hand authority to the object, and reload
//! the cache once they are done.
//!
//! Each view is identified by a [`ViewId`] carrying a generation, and
//! records the object's resize epoch. Using a view after its frame exited,
//! after a re-checkout superseded it, or after its object was resized is
//! a [`ProtocolViolation`].
//!
//! Read-only views skip the cache: they pin the object and point into its
//! own storage.

use crate::api::constants::CApiType;
use crate::error::{CapiResult, ProtocolViolation, ViewId};
use crate::object::ObjectBody;
use crate::runtime::Runtime;
use rivet_core::{ObjRef, Value};
use rivet_gc::{Forwarding, Handle, Tracer};
use rustc_hash::FxHashMap;

// =============================================================================
// Public View Types
// =============================================================================

/// Element type of a view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewKind {
    /// String bytes, NUL-terminated.
    Bytes,
    /// Array elements as handles.
    Handles,
}

/// A checked-out mutable view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferView {
    id: ViewId,
    ptr: *mut u8,
    len: usize,
    kind: ViewKind,
}

impl BufferView {
    #[inline]
    pub fn id(&self) -> ViewId {
        self.id
    }

    /// Element count, excluding the trailing NUL of byte views.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn kind(&self) -> ViewKind {
        self.kind
    }

    /// `char *` for byte views.
    pub fn as_bytes_ptr(&self) -> Option<*mut u8> {
        (self.kind == ViewKind::Bytes).then_some(self.ptr)
    }

    /// `VALUE *` for array views.
    pub fn as_handles_ptr(&self) -> Option<*mut Handle> {
        (self.kind == ViewKind::Handles).then_some(self.ptr as *mut Handle)
    }
}

// =============================================================================
// Cache Storage
// =============================================================================

/// Native-owned buffer. Accessed only through the raw pointer handed out
/// at checkout so native writes and bridge reads never alias a reference.
#[derive(Debug)]
enum Storage {
    /// `len + 1` bytes; the last is always NUL.
    Bytes { raw: *mut [u8], len: usize },
    Handles { raw: *mut [Handle], len: usize },
}

impl Storage {
    fn bytes(src: &[u8]) -> Self {
        let mut buf = Vec::with_capacity(src.len() + 1);
        buf.extend_from_slice(src);
        buf.push(0);
        Storage::Bytes {
            raw: Box::into_raw(buf.into_boxed_slice()),
            len: src.len(),
        }
    }

    fn handles(src: &[Handle]) -> Self {
        Storage::Handles {
            raw: Box::into_raw(src.to_vec().into_boxed_slice()),
            len: src.len(),
        }
    }

    fn kind(&self) -> ViewKind {
        match self {
            Storage::Bytes { .. } => ViewKind::Bytes,
            Storage::Handles { .. } => ViewKind::Handles,
        }
    }

    fn len(&self) -> usize {
        match self {
            Storage::Bytes { len, .. } | Storage::Handles { len, .. } => *len,
        }
    }

    fn ptr(&self) -> *mut u8 {
        match self {
            Storage::Bytes { raw, .. } => *raw as *mut u8,
            Storage::Handles { raw, .. } => *raw as *mut u8,
        }
    }

    fn read_bytes(&self) -> Option<&[u8]> {
        match self {
            // SAFETY: `raw` owns `len + 1` initialized bytes until drop.
            Storage::Bytes { raw, len } => {
                Some(unsafe { std::slice::from_raw_parts(*raw as *const u8, *len) })
            }
            Storage::Handles { .. } => None,
        }
    }

    fn read_handles(&self) -> Option<&[Handle]> {
        match self {
            // SAFETY: `raw` owns `len` initialized handles until drop.
            Storage::Handles { raw, len } => {
                Some(unsafe { std::slice::from_raw_parts(*raw as *const Handle, *len) })
            }
            Storage::Bytes { .. } => None,
        }
    }

    fn write_bytes(&mut self, src: &[u8]) {
        if let Storage::Bytes { raw, len } = self {
            let n = src.len().min(*len);
            // SAFETY: `n` is within the owned allocation; `src` is heap
            // storage of another object and cannot overlap.
            unsafe { std::ptr::copy_nonoverlapping(src.as_ptr(), *raw as *mut u8, n) };
        }
    }

    fn write_handles(&mut self, src: &[Handle]) {
        if let Storage::Handles { raw, len } = self {
            let n = src.len().min(*len);
            // SAFETY: as for `write_bytes`.
            unsafe { std::ptr::copy_nonoverlapping(src.as_ptr(), *raw as *mut Handle, n) };
        }
    }
}

impl Drop for Storage {
    fn drop(&mut self) {
        // SAFETY: both pointers came from `Box::into_raw` and are dropped once.
        match self {
            Storage::Bytes { raw, .. } => drop(unsafe { Box::from_raw(*raw) }),
            Storage::Handles { raw, .. } => drop(unsafe { Box::from_raw(*raw) }),
        }
    }
}

/// Which side holds the truth.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Authority {
    View,
    Object,
}

#[derive(Debug)]
struct ActiveView {
    object: ObjRef,
    storage: Storage,
    /// Object resize epoch the cache was filled from.
    epoch: u32,
    /// Native frame depth that checked the view out.
    frame: usize,
    authority: Authority,
}

#[derive(Debug)]
enum ViewState {
    Active(ActiveView),
    Retired,
}

#[derive(Debug)]
struct ViewEntry {
    generation: u32,
    state: ViewState,
}

#[derive(Debug, Clone, Copy)]
struct ReadonlyView {
    epoch: u32,
    ptr: *const u8,
}

/// All views of a runtime.
#[derive(Debug, Default)]
pub(crate) struct ViewCache {
    entries: Vec<ViewEntry>,
    free: Vec<u32>,
    by_object: FxHashMap<ObjRef, u32>,
    readonly: FxHashMap<ObjRef, ReadonlyView>,
}

// SAFETY: the raw buffers are owned by the cache and only touched by the
// thread holding the runtime.
unsafe impl Send for ViewCache {}

impl ViewCache {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Number of active mutable views.
    pub(crate) fn active_count(&self) -> usize {
        self.by_object.len()
    }

    fn active(&self, index: u32) -> Option<&ActiveView> {
        match self.entries.get(index as usize).map(|e| &e.state) {
            Some(ViewState::Active(view)) => Some(view),
            _ => None,
        }
    }

    fn active_mut(&mut self, index: u32) -> Option<&mut ActiveView> {
        match self.entries.get_mut(index as usize).map(|e| &mut e.state) {
            Some(ViewState::Active(view)) => Some(view),
            _ => None,
        }
    }

    fn id_of(&self, index: u32) -> ViewId {
        ViewId {
            index,
            generation: self.entries[index as usize].generation,
        }
    }

    fn insert(&mut self, view: ActiveView) -> u32 {
        let object = view.object;
        let index = match self.free.pop() {
            Some(index) => {
                let entry = &mut self.entries[index as usize];
                entry.generation = entry.generation.wrapping_add(1);
                entry.state = ViewState::Active(view);
                index
            }
            None => {
                self.entries.push(ViewEntry {
                    generation: 0,
                    state: ViewState::Active(view),
                });
                (self.entries.len() - 1) as u32
            }
        };
        self.by_object.insert(object, index);
        index
    }

    /// Retire one entry, keeping its generation so late users see
    /// `ViewRetired` rather than a stale id.
    fn retire(&mut self, index: u32) {
        let entry = &mut self.entries[index as usize];
        if let ViewState::Active(view) = std::mem::replace(&mut entry.state, ViewState::Retired) {
            self.by_object.remove(&view.object);
            self.free.push(index);
        }
    }

    pub(crate) fn trace(&self, tracer: &mut dyn Tracer) {
        for entry in &self.entries {
            if let ViewState::Active(view) = &entry.state {
                tracer.trace_ref(view.object);
            }
        }
    }

    pub(crate) fn relocate(&mut self, fwd: &Forwarding) {
        if fwd.is_empty() {
            return;
        }
        self.by_object.clear();
        for (index, entry) in self.entries.iter_mut().enumerate() {
            if let ViewState::Active(view) = &mut entry.state {
                view.object = fwd.forward(view.object);
                self.by_object.insert(view.object, index as u32);
            }
        }
        self.readonly = self
            .readonly
            .drain()
            .map(|(obj, view)| (fwd.forward(obj), view))
            .collect();
    }

    /// Drop read-only records of objects that died.
    pub(crate) fn prune_readonly(&mut self, live: impl Fn(ObjRef) -> bool) {
        self.readonly.retain(|&obj, _| live(obj));
    }
}

// =============================================================================
// Runtime Operations
// =============================================================================

/// Contents of a buffer-backed object.
enum Snapshot {
    Bytes(Vec<u8>),
    Items(Vec<Value>),
}

impl Runtime {
    /// Mutable view of a String's bytes (`RSTRING_PTR`).
    ///
    /// The buffer is NUL-terminated and belongs to the current native
    /// frame. Checking out the same object again returns the same view
    /// while its length is unchanged, otherwise a fresh one.
    pub fn str_ptr(&mut self, string: Handle) -> CapiResult<BufferView> {
        let obj = self.expect_buffer(string, CApiType::String)?;
        Ok(self.checkout(obj))
    }

    /// Mutable view of an Array's elements (`RARRAY_PTR`).
    pub fn ary_ptr(&mut self, array: Handle) -> CapiResult<BufferView> {
        let obj = self.expect_buffer(array, CApiType::Array)?;
        Ok(self.checkout(obj))
    }

    /// Read-only pointer into a String's own storage.
    ///
    /// Pins the string for the rest of its life. The pointer is valid
    /// until the string is resized; see [`check_readonly`](Self::check_readonly).
    pub fn str_ptr_readonly(&mut self, string: Handle) -> CapiResult<*const u8> {
        let obj = self.expect_buffer(string, CApiType::String)?;
        self.sync_object(obj);
        let Some(body) = self.get(obj).as_string() else {
            crate::exception::bug("read-only view of a non-string")
        };
        let view = ReadonlyView {
            epoch: body.epoch(),
            ptr: body.bytes().as_ptr(),
        };
        if self.views.readonly.insert(obj, view).is_none() {
            self.heap.pin(obj);
            log::trace!("views: read-only checkout of #{}", obj.0);
        }
        Ok(view.ptr)
    }

    /// Verify a read-only pointer is still current.
    pub fn check_readonly(&self, string: Handle) -> Result<(), ProtocolViolation> {
        let value = self.value_of(string);
        let Some(obj) = value.as_ref() else {
            return self.view_violation(ProtocolViolation::ReadonlyResized(u32::MAX));
        };
        let current = self
            .heap
            .get(obj)
            .and_then(|o| o.as_string())
            .map(|s| (s.epoch(), s.bytes().as_ptr()));
        match (self.views.readonly.get(&obj), current) {
            (Some(view), Some((epoch, ptr))) if view.epoch == epoch && view.ptr == ptr => Ok(()),
            _ => self.view_violation(ProtocolViolation::ReadonlyResized(obj.0)),
        }
    }

    /// Bytes behind a read-only checkout.
    pub fn readonly_bytes(&self, string: Handle) -> Result<&[u8], ProtocolViolation> {
        self.check_readonly(string)?;
        let value = self.value_of(string);
        Ok(self
            .object_of(value)
            .and_then(|o| o.as_string())
            .map_or(&[][..], |s| s.bytes()))
    }

    // =========================================================================
    // Checked Access
    // =========================================================================

    /// Validate a view.
    ///
    /// With `strict_views` set, any violation is fatal.
    pub fn check_view(&self, view: &BufferView) -> Result<(), ProtocolViolation> {
        match self.view_state(view) {
            Ok(()) => Ok(()),
            Err(violation) => self.view_violation(violation),
        }
    }

    fn view_state(&self, view: &BufferView) -> Result<(), ProtocolViolation> {
        let id = view.id;
        let entry = match self.views.entries.get(id.index as usize) {
            Some(entry) if entry.generation == id.generation => entry,
            _ => return Err(ProtocolViolation::StaleView(id)),
        };
        let active = match &entry.state {
            ViewState::Active(active) => active,
            ViewState::Retired => return Err(ProtocolViolation::ViewRetired(id)),
        };
        if active.storage.kind() != view.kind {
            return Err(ProtocolViolation::ViewKindMismatch(id));
        }
        if self.buffer_epoch(active.object) != Some(active.epoch) {
            return Err(ProtocolViolation::ObjectResized(id));
        }
        Ok(())
    }

    fn view_violation<T>(&self, violation: ProtocolViolation) -> Result<T, ProtocolViolation> {
        if self.config.strict_views {
            self.violation(violation);
        }
        log::warn!("views: {violation}");
        Err(violation)
    }

    /// Bytes of a byte view.
    pub fn view_bytes(&self, view: &BufferView) -> Result<&[u8], ProtocolViolation> {
        self.check_view(view)?;
        self.views
            .active(view.id.index)
            .and_then(|a| a.storage.read_bytes())
            .ok_or(ProtocolViolation::ViewKindMismatch(view.id))
    }

    /// Mutable bytes of a byte view.
    pub fn view_bytes_mut(&mut self, view: &BufferView) -> Result<&mut [u8], ProtocolViolation> {
        self.check_view(view)?;
        match self.views.active_mut(view.id.index).map(|a| &mut a.storage) {
            // SAFETY: the allocation is owned by the entry borrowed here.
            Some(Storage::Bytes { raw, len }) => {
                Ok(unsafe { std::slice::from_raw_parts_mut(*raw as *mut u8, *len) })
            }
            _ => Err(ProtocolViolation::ViewKindMismatch(view.id)),
        }
    }

    /// Handles of an array view.
    pub fn view_handles(&self, view: &BufferView) -> Result<&[Handle], ProtocolViolation> {
        self.check_view(view)?;
        self.views
            .active(view.id.index)
            .and_then(|a| a.storage.read_handles())
            .ok_or(ProtocolViolation::ViewKindMismatch(view.id))
    }

    /// Mutable handles of an array view.
    pub fn view_handles_mut(
        &mut self,
        view: &BufferView,
    ) -> Result<&mut [Handle], ProtocolViolation> {
        self.check_view(view)?;
        match self.views.active_mut(view.id.index).map(|a| &mut a.storage) {
            // SAFETY: the allocation is owned by the entry borrowed here.
            Some(Storage::Handles { raw, len }) => {
                Ok(unsafe { std::slice::from_raw_parts_mut(*raw as *mut Handle, *len) })
            }
            _ => Err(ProtocolViolation::ViewKindMismatch(view.id)),
        }
    }

    // =========================================================================
    // Explicit Flush / Refresh
    // =========================================================================

    /// Write a view back into its object now.
    pub fn flush(&mut self, view: &BufferView) -> Result<(), ProtocolViolation> {
        self.check_view(view)?;
        let index = view.id.index;
        if self.views.active(index).map(|a| a.authority) == Some(Authority::View) {
            self.write_back(index);
        }
        Ok(())
    }

    /// Reload a view from its object, discarding unflushed writes.
    pub fn refresh(&mut self, view: &BufferView) -> Result<(), ProtocolViolation> {
        self.check_view(view)?;
        self.reload(view.id.index);
        Ok(())
    }

    /// Flush a view and end its checkout early.
    pub fn release_view(&mut self, view: &BufferView) -> Result<(), ProtocolViolation> {
        self.flush(view)?;
        self.views.retire(view.id.index);
        Ok(())
    }

    /// Number of active mutable views.
    pub fn active_views(&self) -> usize {
        self.views.active_count()
    }

    // =========================================================================
    // Bridge Transitions
    // =========================================================================

    /// Hand authority back to every object before managed code runs.
    ///
    /// Returns the views that were authoritative, for
    /// [`reload_flushed`](Self::reload_flushed).
    pub(crate) fn flush_all_views(&mut self) -> Vec<u32> {
        let indices: Vec<u32> = self.views.by_object.values().copied().collect();
        let mut flushed = Vec::new();
        for index in indices {
            if self.views.active(index).map(|a| a.authority) == Some(Authority::View) {
                self.write_back(index);
                if let Some(active) = self.views.active_mut(index) {
                    active.authority = Authority::Object;
                }
                flushed.push(index);
            }
        }
        flushed
    }

    /// Give authority back to views taken by [`flush_all_views`](Self::flush_all_views).
    pub(crate) fn reload_flushed(&mut self, flushed: &[u32]) {
        for &index in flushed {
            self.reload(index);
        }
    }

    /// Reload the current native frame's views after managed code ran.
    pub(crate) fn refresh_views(&mut self) {
        let frame = self.natives.len();
        let indices: Vec<u32> = self
            .views
            .by_object
            .values()
            .copied()
            .filter(|&i| self.views.active(i).is_some_and(|a| a.frame == frame))
            .collect();
        for index in indices {
            self.reload(index);
        }
    }

    /// Write a single object's view back so a bridge read sees native
    /// writes. The view stays authoritative.
    pub(crate) fn sync_object(&mut self, obj: ObjRef) {
        let Some(&index) = self.views.by_object.get(&obj) else {
            return;
        };
        if self.views.active(index).map(|a| a.authority) == Some(Authority::View) {
            self.write_back(index);
        }
    }

    /// Flush a single object's view before a bridge mutator touches it.
    /// The mutator must call [`refresh_object`](Self::refresh_object) after.
    pub(crate) fn flush_object(&mut self, obj: ObjRef) {
        let Some(&index) = self.views.by_object.get(&obj) else {
            return;
        };
        if self.views.active(index).map(|a| a.authority) == Some(Authority::View) {
            self.write_back(index);
            if let Some(active) = self.views.active_mut(index) {
                active.authority = Authority::Object;
            }
        }
    }

    /// Reload a single object's view after a bridge mutator.
    pub(crate) fn refresh_object(&mut self, obj: ObjRef) {
        if let Some(&index) = self.views.by_object.get(&obj) {
            self.reload(index);
        }
    }

    /// Flush and retire every view checked out at native depth `frame`
    /// or deeper.
    pub(crate) fn retire_frame(&mut self, frame: usize) {
        let indices: Vec<u32> = self
            .views
            .by_object
            .values()
            .copied()
            .filter(|&i| self.views.active(i).is_some_and(|a| a.frame >= frame))
            .collect();
        for index in indices {
            if self.views.active(index).map(|a| a.authority) == Some(Authority::View) {
                self.write_back(index);
            }
            self.views.retire(index);
        }
        if !self.views.by_object.is_empty() || frame > 0 {
            log::trace!("views: retired frame {frame}");
        }
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn expect_buffer(&mut self, handle: Handle, expected: CApiType) -> CapiResult<ObjRef> {
        self.check_type(handle, expected)?;
        match self.value_of(handle).as_ref() {
            Some(obj) => Ok(obj),
            None => crate::exception::bug("buffer type check passed for an immediate"),
        }
    }

    pub(crate) fn buffer_epoch(&self, obj: ObjRef) -> Option<u32> {
        match &self.heap.get(obj)?.body {
            ObjectBody::String(s) => Some(s.epoch()),
            ObjectBody::Array(a) => Some(a.epoch()),
            _ => None,
        }
    }

    fn snapshot(&self, obj: ObjRef) -> Option<(Snapshot, u32)> {
        match &self.heap.get(obj)?.body {
            ObjectBody::String(s) => Some((Snapshot::Bytes(s.bytes().to_vec()), s.epoch())),
            ObjectBody::Array(a) => Some((Snapshot::Items(a.items().to_vec()), a.epoch())),
            _ => None,
        }
    }

    /// Handle scope depth belonging to native frame `frame`.
    fn frame_scope(&self, frame: usize) -> u32 {
        frame
            .checked_sub(1)
            .and_then(|i| self.natives.get(i))
            .and_then(|n| n.scope.as_ref())
            .map_or(0, |token| token.depth())
    }

    fn element_handles(&mut self, items: &[Value], frame: usize) -> Vec<Handle> {
        let depth = self.frame_scope(frame);
        let mut handles = Vec::with_capacity(items.len());
        for &item in items {
            let handle = match item.as_ref() {
                Some(obj) => match self.handles.acquire_at(obj, depth) {
                    Ok(h) => h,
                    Err(err) => self.violation(ProtocolViolation::Handle(err)),
                },
                None => Handle::from_bits(item.bits()),
            };
            handles.push(handle);
        }
        handles
    }

    fn checkout(&mut self, obj: ObjRef) -> BufferView {
        let frame = self.natives.len();
        if let Some(&index) = self.views.by_object.get(&obj) {
            if self.views.active(index).map(|a| a.authority) == Some(Authority::View) {
                self.write_back(index);
            }
            let (epoch, len, kind) = match self.views.active(index) {
                Some(a) => (a.epoch, a.storage.len(), a.storage.kind()),
                None => crate::exception::bug("view index without an active entry"),
            };
            let current_len = match self.snapshot(obj) {
                Some((Snapshot::Bytes(b), _)) => b.len(),
                Some((Snapshot::Items(i), _)) => i.len(),
                None => 0,
            };
            if self.buffer_epoch(obj) == Some(epoch) && current_len == len {
                self.reload(index);
                let view = self.views.active(index).map(|a| a.storage.ptr());
                return BufferView {
                    id: self.views.id_of(index),
                    ptr: view.unwrap_or(std::ptr::null_mut()),
                    len,
                    kind,
                };
            }
            // Resized since checkout: the old id goes stale.
            let outer = self.views.active(index).map_or(frame, |a| a.frame);
            self.views.retire(index);
            return self.fresh_checkout(obj, outer);
        }
        self.fresh_checkout(obj, frame)
    }

    fn fresh_checkout(&mut self, obj: ObjRef, frame: usize) -> BufferView {
        let Some((snapshot, epoch)) = self.snapshot(obj) else {
            crate::exception::bug(format!("object #{} has no buffer", obj.0));
        };
        let storage = match snapshot {
            Snapshot::Bytes(bytes) => Storage::bytes(&bytes),
            Snapshot::Items(items) => {
                let handles = self.element_handles(&items, frame);
                Storage::handles(&handles)
            }
        };
        let (ptr, len, kind) = (storage.ptr(), storage.len(), storage.kind());
        let index = self.views.insert(ActiveView {
            object: obj,
            storage,
            epoch,
            frame,
            authority: Authority::View,
        });
        // A retired slot being reused still has the generation of its
        // last user; `insert` bumped it already.
        let id = self.views.id_of(index);
        log::trace!("views: checkout #{} as {id:?} ({len} {kind:?})", obj.0);
        BufferView { id, ptr, len, kind }
    }

    /// cache → object. Authority is left to the caller.
    fn write_back(&mut self, index: u32) {
        let Some(active) = self.views.active(index) else {
            return;
        };
        let (obj, epoch) = (active.object, active.epoch);
        if self.buffer_epoch(obj) != Some(epoch) {
            let violation = ProtocolViolation::ObjectResized(self.views.id_of(index));
            if self.config.strict_views {
                self.violation(violation);
            }
            log::error!("views: dropping write-back: {violation}");
            return;
        }
        let Some(active) = self.views.active(index) else {
            return;
        };
        match &active.storage {
            Storage::Bytes { .. } => {
                let bytes = active.storage.read_bytes().map(<[u8]>::to_vec).unwrap_or_default();
                if let Some(s) = self.get_mut(obj).as_string_mut() {
                    let n = bytes.len().min(s.len());
                    s.bytes_mut()[..n].copy_from_slice(&bytes[..n]);
                }
            }
            Storage::Handles { .. } => {
                let handles = active.storage.read_handles().map(<[Handle]>::to_vec).unwrap_or_default();
                let mut values = Vec::with_capacity(handles.len());
                for h in handles {
                    values.push(self.value_of(h));
                }
                if let Some(a) = self.get_mut(obj).as_array_mut() {
                    for (slot, value) in a.items_mut().iter_mut().zip(values) {
                        *slot = value;
                    }
                }
            }
        }
    }

    /// object → cache, making the cache authoritative. A resized object
    /// leaves the entry stale until the next checkout.
    fn reload(&mut self, index: u32) {
        let Some(active) = self.views.active(index) else {
            return;
        };
        let (obj, epoch, frame) = (active.object, active.epoch, active.frame);
        let Some((snapshot, current)) = self.snapshot(obj) else {
            return;
        };
        if current != epoch {
            if let Some(active) = self.views.active_mut(index) {
                active.authority = Authority::Object;
            }
            return;
        }
        match snapshot {
            Snapshot::Bytes(bytes) => {
                if let Some(active) = self.views.active_mut(index) {
                    active.storage.write_bytes(&bytes);
                    active.authority = Authority::View;
                }
            }
            Snapshot::Items(items) => {
                let handles = self.element_handles(&items, frame);
                if let Some(active) = self.views.active_mut(index) {
                    active.storage.write_handles(&handles);
                    active.authority = Authority::View;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CapiConfig;

    fn runtime() -> Runtime {
        Runtime::new(CapiConfig::default()).unwrap()
    }

    fn lenient() -> Runtime {
        Runtime::new(CapiConfig {
            strict_views: false,
            ..Default::default()
        })
        .unwrap()
    }

    fn write(rt: &mut Runtime, view: &BufferView, at: usize, byte: u8) {
        rt.view_bytes_mut(view).unwrap()[at] = byte;
    }

    // =========================================================================
    // Coherency
    // =========================================================================

    #[test]
    fn test_write_flush_read() {
        let mut rt = runtime();
        let s = rt.str_new(b"hello").unwrap();
        let view = rt.str_ptr(s).unwrap();
        write(&mut rt, &view, 0, b'j');
        let obj = rt.value_of(s).as_ref().unwrap();
        assert_eq!(rt.get(obj).as_string().unwrap().bytes(), b"hello");
        rt.flush(&view).unwrap();
        assert_eq!(rt.get(obj).as_string().unwrap().bytes(), b"jello");
        assert_eq!(rt.string_value(s).unwrap(), b"jello");
    }

    #[test]
    fn test_bridge_read_leaves_view_authoritative() {
        let mut rt = runtime();
        let s = rt.str_new(b"abc").unwrap();
        let view = rt.str_ptr(s).unwrap();
        assert_eq!(rt.str_len(s).unwrap(), 3);
        write(&mut rt, &view, 0, b'X');
        rt.flush(&view).unwrap();
        assert_eq!(rt.string_value(s).unwrap(), b"Xbc");

        // Reads in between see each write without ending the checkout.
        write(&mut rt, &view, 1, b'Y');
        assert_eq!(rt.string_value(s).unwrap(), b"XYc");
        write(&mut rt, &view, 2, b'Z');
        rt.retire_frame(0);
        assert_eq!(rt.string_value(s).unwrap(), b"XYZ");
    }

    #[test]
    fn test_array_read_leaves_view_authoritative() {
        let mut rt = runtime();
        let ary = rt.ary_new_from(&[Handle::NIL, Handle::NIL]).unwrap();
        let view = rt.ary_ptr(ary).unwrap();
        assert_eq!(rt.ary_len(ary).unwrap(), 2);
        rt.view_handles_mut(&view).unwrap()[0] = Handle::TRUE;
        rt.flush(&view).unwrap();
        assert_eq!(rt.ary_entry(ary, 0).unwrap(), Handle::TRUE);
        rt.view_handles_mut(&view).unwrap()[1] = Handle::FALSE;
        rt.flush(&view).unwrap();
        assert_eq!(rt.ary_entry(ary, 1).unwrap(), Handle::FALSE);
    }

    #[test]
    fn test_bridge_mutator_reloads_view() {
        let mut rt = runtime();
        let s = rt.str_new(b"ab").unwrap();
        let view = rt.str_ptr(s).unwrap();
        write(&mut rt, &view, 0, b'A');
        rt.str_cat(s, b"").unwrap();
        write(&mut rt, &view, 1, b'B');
        rt.flush(&view).unwrap();
        assert_eq!(rt.string_value(s).unwrap(), b"AB");
    }

    #[test]
    fn test_managed_equality_sees_unflushed_writes() {
        let mut rt = runtime();
        let s = rt.str_new(b"abc").unwrap();
        let expected = rt.str_new(b"Xbc").unwrap();
        let view = rt.str_ptr(s).unwrap();
        write(&mut rt, &view, 0, b'X');
        assert!(rt.equal(s, expected).unwrap());
        // The view is authoritative again once `==` returns.
        write(&mut rt, &view, 1, b'Y');
        rt.flush(&view).unwrap();
        assert_eq!(rt.string_value(s).unwrap(), b"XYc");
    }

    fn label(rt: &mut Runtime, _recv: Handle) -> CapiResult<Handle> {
        rt.str_new(b"w")
    }

    fn write_around_join(
        rt: &mut Runtime,
        _recv: Handle,
        target: Handle,
        items: Handle,
    ) -> CapiResult<Handle> {
        let view = rt.str_ptr(target)?;
        let joined = rt.ary_join(items, Handle::NIL)?;
        rt.view_bytes_mut(&view).unwrap()[0] = b'X';
        Ok(joined)
    }

    #[test]
    fn test_nested_native_call_keeps_outer_view_live() {
        use crate::api::constants::CApiConstant;
        use crate::method::{MethodKind, NativeFn};

        let mut rt = runtime();
        let object = rt.get_constant(CApiConstant::Object);
        let widget = rt.define_class("Widget", object).unwrap();
        rt.define_method(widget, "to_s", NativeFn::Arity0(label), 0, MethodKind::Public)
            .unwrap();
        rt.define_method(
            widget,
            "edit",
            NativeFn::Arity2(write_around_join),
            2,
            MethodKind::Public,
        )
        .unwrap();
        let w = rt.class_new_instance(widget, &[]).unwrap();
        let items = rt.ary_new_from(&[w, w]).unwrap();
        let target = rt.str_new(b"abc").unwrap();

        let joined = crate::funcall!(&mut rt, w, "edit", target, items).unwrap();
        assert_eq!(rt.string_value(joined).unwrap(), b"ww");
        assert_eq!(rt.string_value(target).unwrap(), b"Xbc");
        assert_eq!(rt.active_views(), 0);
    }

    #[test]
    fn test_object_write_refresh_read() {
        let mut rt = runtime();
        let s = rt.str_new(b"abc").unwrap();
        let view = rt.str_ptr(s).unwrap();
        let obj = rt.value_of(s).as_ref().unwrap();
        rt.get_mut(obj).as_string_mut().unwrap().bytes_mut()[2] = b'z';
        assert_eq!(rt.view_bytes(&view).unwrap(), b"abc");
        rt.refresh(&view).unwrap();
        assert_eq!(rt.view_bytes(&view).unwrap(), b"abz");
    }

    #[test]
    fn test_byte_view_is_nul_terminated() {
        let mut rt = runtime();
        let s = rt.str_new(b"xy").unwrap();
        let view = rt.str_ptr(s).unwrap();
        let ptr = view.as_bytes_ptr().unwrap();
        // SAFETY: byte views own len + 1 bytes.
        assert_eq!(unsafe { *ptr.add(view.len()) }, 0);
        assert!(view.as_handles_ptr().is_none());
    }

    #[test]
    fn test_flush_all_hands_authority_to_object() {
        let mut rt = runtime();
        let s = rt.str_new(b"ab").unwrap();
        let view = rt.str_ptr(s).unwrap();
        write(&mut rt, &view, 1, b'!');
        rt.flush_all_views();
        assert_eq!(rt.string_value(s).unwrap(), b"a!");

        // Managed code edits the object; the cache must not clobber it.
        let obj = rt.value_of(s).as_ref().unwrap();
        rt.get_mut(obj).as_string_mut().unwrap().bytes_mut()[0] = b'Z';
        rt.flush_all_views();
        assert_eq!(rt.string_value(s).unwrap(), b"Z!");
        rt.refresh_views();
        assert_eq!(rt.view_bytes(&view).unwrap(), b"Z!");
    }

    #[test]
    fn test_array_view_round_trip() {
        let mut rt = runtime();
        let one = Handle::from_bits(Value::fixnum_unchecked(1).bits());
        let ary = rt.ary_new_from(&[one, Handle::NIL]).unwrap();
        let view = rt.ary_ptr(ary).unwrap();
        assert_eq!(rt.view_handles(&view).unwrap(), &[one, Handle::NIL]);

        let s = rt.str_new(b"elem").unwrap();
        rt.view_handles_mut(&view).unwrap()[1] = s;
        rt.flush(&view).unwrap();
        let entry = rt.ary_entry(ary, 1).unwrap();
        assert_eq!(rt.string_value(entry).unwrap(), b"elem");
    }

    // =========================================================================
    // Misuse Detection
    // =========================================================================

    #[test]
    fn test_resize_invalidates_view() {
        let mut rt = lenient();
        let s = rt.str_new(b"abc").unwrap();
        let view = rt.str_ptr(s).unwrap();
        rt.str_cat(s, b"def").unwrap();
        assert_eq!(
            rt.check_view(&view),
            Err(ProtocolViolation::ObjectResized(view.id()))
        );
        assert!(rt.view_bytes(&view).is_err());
    }

    #[test]
    #[should_panic(expected = "resized")]
    fn test_resize_is_fatal_when_strict() {
        let mut rt = runtime();
        let s = rt.str_new(b"abc").unwrap();
        let view = rt.str_ptr(s).unwrap();
        rt.str_cat(s, b"d").unwrap();
        let _ = rt.view_bytes(&view);
    }

    #[test]
    fn test_recheckout_after_resize_supersedes_old_id() {
        let mut rt = lenient();
        let s = rt.str_new(b"abc").unwrap();
        let old = rt.str_ptr(s).unwrap();
        rt.str_cat(s, b"d").unwrap();
        let new = rt.str_ptr(s).unwrap();
        assert_ne!(old.id(), new.id());
        assert_eq!(new.len(), 4);
        assert_eq!(rt.view_bytes(&new).unwrap(), b"abcd");
        assert!(matches!(
            rt.check_view(&old),
            Err(ProtocolViolation::ViewRetired(_) | ProtocolViolation::StaleView(_))
        ));
    }

    #[test]
    fn test_recheckout_same_length_reuses_view() {
        let mut rt = runtime();
        let s = rt.str_new(b"abc").unwrap();
        let first = rt.str_ptr(s).unwrap();
        write(&mut rt, &first, 0, b'x');
        let second = rt.str_ptr(s).unwrap();
        assert_eq!(first, second);
        assert_eq!(rt.string_value(s).unwrap(), b"xbc");
        assert_eq!(rt.active_views(), 1);
    }

    #[test]
    fn test_retired_view_is_rejected() {
        let mut rt = lenient();
        let s = rt.str_new(b"abc").unwrap();
        let view = rt.str_ptr(s).unwrap();
        write(&mut rt, &view, 0, b'q');
        rt.retire_frame(0);
        assert_eq!(rt.string_value(s).unwrap(), b"qbc");
        assert_eq!(
            rt.check_view(&view),
            Err(ProtocolViolation::ViewRetired(view.id()))
        );

        // The slot is reused; the old id is now merely stale.
        let other = rt.str_new(b"zz").unwrap();
        let fresh = rt.str_ptr(other).unwrap();
        assert_eq!(fresh.id().index, view.id().index);
        assert_eq!(
            rt.check_view(&view),
            Err(ProtocolViolation::StaleView(view.id()))
        );
    }

    #[test]
    fn test_kind_mismatch() {
        let mut rt = lenient();
        let s = rt.str_new(b"abc").unwrap();
        let view = rt.str_ptr(s).unwrap();
        let forged = BufferView {
            kind: ViewKind::Handles,
            ..view
        };
        assert_eq!(
            rt.check_view(&forged),
            Err(ProtocolViolation::ViewKindMismatch(view.id()))
        );
    }

    #[test]
    fn test_checkout_rejects_wrong_type() {
        let mut rt = runtime();
        let ary = rt.ary_new().unwrap();
        let err = rt.str_ptr(ary).unwrap_err();
        assert_eq!(rt.class_name_of(err.exception), "TypeError");
    }

    // =========================================================================
    // Collection
    // =========================================================================

    #[test]
    fn test_views_survive_compaction() {
        let mut rt = runtime();
        for _ in 0..16 {
            rt.alloc_core(crate::api::constants::CApiConstant::Object, ObjectBody::Plain)
                .unwrap();
        }
        let s = rt.str_new(b"moving").unwrap();
        let view = rt.str_ptr(s).unwrap();
        let result = rt.gc_compact();
        assert!(result.compacted);
        write(&mut rt, &view, 0, b'M');
        rt.flush(&view).unwrap();
        assert_eq!(rt.string_value(s).unwrap(), b"Moving");
    }

    #[test]
    fn test_readonly_view_pins_and_detects_resize() {
        let mut rt = lenient();
        let s = rt.str_new(b"fixed").unwrap();
        let ptr = rt.str_ptr_readonly(s).unwrap();
        let obj = rt.value_of(s).as_ref().unwrap();
        assert!(rt.heap.is_pinned(obj));
        assert!(rt.check_readonly(s).is_ok());
        assert_eq!(rt.readonly_bytes(s).unwrap(), b"fixed");
        // SAFETY: the string is live and unchanged.
        assert_eq!(unsafe { *ptr }, b'f');

        rt.str_cat(s, &[b'!'; 64]).unwrap();
        assert_eq!(
            rt.check_readonly(s),
            Err(ProtocolViolation::ReadonlyResized(obj.0))
        );
    }
}
