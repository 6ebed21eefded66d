//! Handle operations on the runtime.
//!
//! Everything native code holds is a [`Handle`]. Reference handles live in
//! the innermost handle scope: the scope of the running native method, or
//! the global scope for host code outside any native frame. Host code
//! that makes many short-lived handles should bracket the work with
//! [`Runtime::with_handle_scope`].

use crate::error::ProtocolViolation;
use crate::runtime::Runtime;
use rivet_core::Value;
use rivet_gc::{Handle, HandleError, ScopeExit};

impl Runtime {
    /// Value behind a handle. Stale or forged handles are fatal.
    #[inline]
    pub(crate) fn value_of(&self, handle: Handle) -> Value {
        match self.handles.resolve_value(handle) {
            Ok(value) => value,
            Err(err) => self.violation(ProtocolViolation::Handle(err)),
        }
    }

    /// Handle for a value in the innermost scope.
    #[inline]
    pub(crate) fn handle_for(&mut self, value: Value) -> Handle {
        match self.handles.acquire_value(value) {
            Ok(handle) => handle,
            Err(err) => self.violation(ProtocolViolation::Handle(err)),
        }
    }

    /// Whether `handle` is an immediate or a live reference.
    #[inline]
    pub fn is_valid_handle(&self, handle: Handle) -> bool {
        self.handles.is_valid(handle)
    }

    /// Release a handle before its scope ends.
    ///
    /// Releasing a handle owned by an enclosing scope is fatal.
    pub fn release_handle(&mut self, handle: Handle) {
        if let Err(err) = self.handles.release(handle) {
            self.violation(ProtocolViolation::Handle(err));
        }
    }

    /// Number of live reference handles.
    #[inline]
    pub fn live_handles(&self) -> usize {
        self.handles.live_count()
    }

    /// Current handle scope depth; 0 outside any native frame.
    #[inline]
    pub fn handle_scope_depth(&self) -> u32 {
        self.handles.depth()
    }

    /// Run `body` in a fresh handle scope.
    ///
    /// Handles created inside are released on exit, except the one
    /// `body` returns (moved to the enclosing scope) and any stored at a
    /// registered global address (moved to the global scope).
    pub fn with_handle_scope(&mut self, body: impl FnOnce(&mut Runtime) -> Handle) -> Handle {
        let token = self.handles.push_scope();
        let depth = token.depth();
        log::trace!("handles: open scope {depth}");
        let result = body(self);
        if let Err(err) = self.handles.reparent(result) {
            self.violation(ProtocolViolation::Handle(err));
        }
        let exit = self.close_scope(token);
        log::trace!(
            "handles: close scope {depth}, {} released, {} promoted",
            exit.released,
            exit.promoted
        );
        result
    }

    /// Pop a handle scope, keeping handles stored at registered globals.
    pub(crate) fn close_scope(&mut self, token: rivet_gc::ScopeToken) -> ScopeExit {
        let keep = self.registry.snapshot();
        let expected = token.depth();
        match self.handles.pop_scope(token, |h| keep.contains(&h)) {
            Ok(exit) => exit,
            Err(HandleError::ScopeMismatch { expected: actual, .. }) => {
                self.violation(ProtocolViolation::FrameMismatch { expected, actual })
            }
            Err(err) => self.violation(ProtocolViolation::Handle(err)),
        }
    }
}
