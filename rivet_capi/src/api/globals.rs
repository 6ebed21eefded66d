//! Global variables and native global roots.
//!
//! A global is either a managed value held by the runtime or a native
//! `Handle` variable bound with [`Runtime::define_variable`]. Bound
//! variables are read through their address on every access, so native
//! code may assign them directly.

use crate::api::constants::CApiConstant;
use crate::error::{CapiResult, ProtocolViolation};
use crate::runtime::Runtime;
use rivet_core::Value;
use rivet_gc::{Forwarding, Handle, Tracer};
use std::ptr::NonNull;

/// Storage behind a `$name`.
#[derive(Debug)]
pub(crate) enum GlobalVar {
    /// Held by the runtime.
    Value(Value),
    /// A native `Handle` variable registered as a global root.
    Bound {
        address: NonNull<Handle>,
        readonly: bool,
    },
}

// SAFETY: bound addresses are only dereferenced by the thread holding the
// runtime.
unsafe impl Send for GlobalVar {}

impl GlobalVar {
    pub(crate) fn trace(&self, tracer: &mut dyn Tracer) {
        // Bound variables hold handles, which the handle table roots.
        if let GlobalVar::Value(value) = self {
            tracer.trace_value(*value);
        }
    }

    pub(crate) fn relocate(&mut self, fwd: &Forwarding) {
        if let GlobalVar::Value(value) = self {
            fwd.update(value);
        }
    }
}

/// `$name` with the sigil added if missing.
fn global_name(name: &str) -> String {
    if name.starts_with('$') {
        name.to_string()
    } else {
        format!("${name}")
    }
}

impl Runtime {
    unsafe fn bind_variable(&mut self, name: &str, address: NonNull<Handle>, readonly: bool) {
        let name = global_name(name);
        // SAFETY: forwarded from the caller.
        unsafe { self.registry.register(&name, address) };
        // SAFETY: forwarded from the caller.
        let current = unsafe { address.as_ptr().read() };
        if let Err(err) = self.handles.promote(current) {
            self.violation(ProtocolViolation::Handle(err));
        }
        let id = self.intern(&name);
        log::debug!("globals: bind {name}");
        self.global_vars
            .insert(id, GlobalVar::Bound { address, readonly });
    }

    /// `rb_define_variable`: expose a native handle variable as `$name`.
    ///
    /// # Safety
    ///
    /// `address` must stay valid for reads and writes, and hold a valid
    /// handle, for the life of the runtime.
    pub unsafe fn define_variable(&mut self, name: &str, address: NonNull<Handle>) {
        // SAFETY: forwarded from the caller.
        unsafe { self.bind_variable(name, address, false) }
    }

    /// `rb_define_readonly_variable`: assignment from managed code raises.
    ///
    /// # Safety
    ///
    /// As for [`define_variable`](Self::define_variable).
    pub unsafe fn define_readonly_variable(&mut self, name: &str, address: NonNull<Handle>) {
        // SAFETY: forwarded from the caller.
        unsafe { self.bind_variable(name, address, true) }
    }

    /// `rb_gv_get`: nil for unknown globals.
    pub fn gv_get(&mut self, name: &str) -> Handle {
        let id = self.intern(&global_name(name));
        match self.global_vars.get(&id) {
            Some(GlobalVar::Value(value)) => {
                let value = *value;
                self.handle_for(value)
            }
            Some(GlobalVar::Bound { address, .. }) => {
                // SAFETY: guaranteed by the `define_variable` contract.
                let handle = unsafe { address.as_ptr().read() };
                let value = self.value_of(handle);
                self.handle_for(value)
            }
            None => Handle::NIL,
        }
    }

    /// `rb_gv_set`.
    pub fn gv_set(&mut self, name: &str, value: Handle) -> CapiResult<Handle> {
        let name = global_name(name);
        let id = self.intern(&name);
        match self.global_vars.get(&id) {
            Some(&GlobalVar::Bound { readonly: true, .. }) => Err(self.name_error(
                CApiConstant::NameError,
                format!("{name} is a read-only variable"),
                id,
            )),
            Some(&GlobalVar::Bound { address, .. }) => {
                self.value_of(value);
                if let Err(err) = self.handles.promote(value) {
                    self.violation(ProtocolViolation::Handle(err));
                }
                // SAFETY: guaranteed by the `define_variable` contract.
                unsafe { address.as_ptr().write(value) };
                Ok(value)
            }
            _ => {
                let v = self.value_of(value);
                self.global_vars.insert(id, GlobalVar::Value(v));
                Ok(value)
            }
        }
    }

    /// `rb_gc_register_address`: the handle stored at `address` is a root
    /// until unregistered, and survives the scope that created it.
    ///
    /// # Safety
    ///
    /// `address` must stay valid for reads until it is unregistered.
    pub unsafe fn gc_register_address(&mut self, address: NonNull<Handle>) {
        let name = format!("{:p}", address.as_ptr());
        // SAFETY: forwarded from the caller.
        unsafe { self.registry.register(&name, address) };
        // SAFETY: forwarded from the caller.
        let current = unsafe { address.as_ptr().read() };
        if current.is_reference() && self.handles.is_valid(current) {
            if let Err(err) = self.handles.promote(current) {
                self.violation(ProtocolViolation::Handle(err));
            }
        }
    }

    /// `rb_gc_unregister_address`.
    pub fn gc_unregister_address(&mut self, address: NonNull<Handle>) {
        if !self.registry.unregister(address) {
            log::warn!("globals: {:p} was not registered", address.as_ptr());
        }
    }

    /// `rb_gc_register_mark_object`: root `obj` permanently.
    pub fn gc_register_mark_object(&mut self, obj: Handle) {
        let value = self.value_of(obj);
        self.roots.add(value);
    }
}
