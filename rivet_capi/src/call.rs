//! Call marshaling between native code and managed dispatch.
//!
//! Native → managed: [`Runtime::funcall2`] and friends flush every
//! outstanding mutable view, pass the safepoint, resolve handles and
//! dispatch. On return, views of the calling native frame are reloaded,
//! since managed code may have written the objects directly.
//!
//! Managed → native: dispatch reaching a [`MethodBody::Native`] entry
//! lands in [`Runtime::call_native`], the trampoline. It opens a native
//! frame:
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │ NativeFrame                                   │
//! │   handle scope   receiver, args, temporaries  │
//! │   views          checked out at this depth    │
//! │   ensures        run innermost-first on exit  │
//! │   bridge frame   Normal / Raised / ...        │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! and tears it down in reverse on every exit path.
//!
//! [`MethodBody::Native`]: crate::method::MethodBody::Native

use crate::api::constants::CApiConstant;
use crate::error::{CapiResult, ProtocolViolation};
use crate::exception::{BridgeState, FrameKind};
use crate::method::{ArgSpec, NativeFn, ScannedArgs};
use crate::object::{ObjectBody, ProcBody};
use crate::runtime::{CallStyle, Runtime};
use rivet_core::{SymbolId, Value};
use rivet_gc::{Handle, ScopeToken};
use smallvec::SmallVec;
use std::sync::Arc;

/// Cleanup registered with [`Runtime::push_ensure`].
pub type EnsureAction = Box<dyn FnOnce(&mut Runtime) -> CapiResult<()> + Send>;

/// One active native method.
pub(crate) struct NativeFrame {
    pub method: SymbolId,
    pub ensures: Vec<EnsureAction>,
    /// Taken when the frame's scope is closed.
    pub scope: Option<ScopeToken>,
}

impl NativeFrame {
    fn new(method: SymbolId, scope: ScopeToken) -> Self {
        Self {
            method,
            ensures: Vec::new(),
            scope: Some(scope),
        }
    }
}

/// Call a method from native code: `funcall!(rt, recv, "name", a, b)`.
///
/// Expands to [`Runtime::funcall2`] with the arguments collected into a
/// slice, so it builds exactly the frame the slice form builds.
#[macro_export]
macro_rules! funcall {
    ($rt:expr, $recv:expr, $name:expr $(, $arg:expr)* $(,)?) => {{
        let rt: &mut $crate::Runtime = $rt;
        let id = rt.intern($name);
        rt.funcall2($recv, id, &[$($arg),*])
    }};
}

impl Runtime {
    // =========================================================================
    // Trampoline
    // =========================================================================

    /// Run a native method body for managed dispatch.
    pub(crate) fn call_native(
        &mut self,
        func: NativeFn,
        recv: Value,
        args: &[Value],
        name: SymbolId,
    ) -> CapiResult<Value> {
        let arity = func.arity();
        if !arity.accepts(args.len()) {
            return Err(self.arity_error(args.len(), arity.to_c()));
        }

        let scope = self.handles.push_scope();
        self.natives.push(NativeFrame::new(name, scope));
        self.push_bridge(FrameKind::Native);
        let depth = self.natives.len();
        log::trace!("native: enter {} at depth {depth}", self.symbol_name(name));

        let this = self.handle_for(recv);
        let argv: SmallVec<[Handle; 4]> = args.iter().map(|&a| self.handle_for(a)).collect();
        let result = match func {
            NativeFn::Arity0(f) => f(self, this),
            NativeFn::Arity1(f) => f(self, this, argv[0]),
            NativeFn::Arity2(f) => f(self, this, argv[0], argv[1]),
            NativeFn::Arity3(f) => f(self, this, argv[0], argv[1], argv[2]),
            NativeFn::Arity4(f) => f(self, this, argv[0], argv[1], argv[2], argv[3]),
            NativeFn::Variadic(f) => f(self, &argv, this),
            NativeFn::ArgsArray(f) => match self.new_array(args.to_vec()) {
                Ok(packed) => {
                    let packed = self.handle_for(packed);
                    f(self, this, packed)
                }
                Err(unwind) => Err(unwind),
            },
        };

        let mut result = match result {
            Ok(handle) if handle.is_undef() => {
                self.violation(ProtocolViolation::UndefResult(self.symbol_name(name)))
            }
            Ok(handle) => {
                let value = self.value_of(handle);
                // The caller gets back the very handle the method returned.
                if let Err(err) = self.handles.reparent(handle) {
                    self.violation(ProtocolViolation::Handle(err));
                }
                Ok(value)
            }
            Err(unwind) => Err(unwind),
        };

        self.flush_all_views();
        self.retire_frame(depth);

        let ensures = match self.natives.last_mut() {
            Some(frame) => std::mem::take(&mut frame.ensures),
            None => Vec::new(),
        };
        for action in ensures.into_iter().rev() {
            if let Err(unwind) = action(self) {
                log::debug!("native: ensure action raised, replacing result");
                result = Err(unwind);
            }
        }

        let state = if result.is_ok() {
            BridgeState::Normal
        } else {
            BridgeState::Propagated
        };
        self.pop_bridge(state);
        let scope = self.natives.last_mut().and_then(|frame| frame.scope.take());
        if let Some(scope) = scope {
            self.close_scope(scope);
        }
        self.natives.pop();
        log::trace!("native: exit {} ({state:?})", self.symbol_name(name));
        result
    }

    /// Register `action` to run when the current native method exits,
    /// normally or by an exception.
    ///
    /// Actions run innermost-first. One that raises replaces the method's
    /// result or pending exception.
    pub fn push_ensure(&mut self, action: impl FnOnce(&mut Runtime) -> CapiResult<()> + Send + 'static) {
        match self.natives.last_mut() {
            Some(frame) => frame.ensures.push(Box::new(action)),
            None => self.violation(ProtocolViolation::NoNativeFrame),
        }
    }

    /// Name of the running native method.
    pub fn current_native_method(&self) -> Option<SymbolId> {
        self.natives.last().map(|frame| frame.method)
    }

    // =========================================================================
    // Native → Managed
    // =========================================================================

    fn call_managed(
        &mut self,
        recv: Handle,
        name: SymbolId,
        args: &[Handle],
        block: Option<Handle>,
        style: CallStyle,
    ) -> CapiResult<Handle> {
        self.flush_all_views();
        self.safepoint();
        let recv = self.value_of(recv);
        let argv: SmallVec<[Value; 4]> = args.iter().map(|&a| self.value_of(a)).collect();
        let block = match block.map(|b| self.value_of(b)) {
            Some(b) if b.is_nil() => None,
            Some(b) => Some(self.expect_proc(b)?),
            None => None,
        };
        let result = self.dispatch(recv, name, &argv, block, style);
        self.refresh_views();
        let value = result?;
        Ok(self.handle_for(value))
    }

    /// Dispatch from inside a bridge function that holds raw values.
    ///
    /// Views are flushed before managed code runs and the ones flushed
    /// here get authority back afterwards. No safepoint: the caller's
    /// values are not rooted by handles.
    pub(crate) fn call_into_managed(
        &mut self,
        recv: Value,
        name: SymbolId,
        args: &[Value],
        block: Option<Value>,
        style: CallStyle,
    ) -> CapiResult<Value> {
        let flushed = self.flush_all_views();
        let result = self.dispatch(recv, name, args, block, style);
        self.reload_flushed(&flushed);
        result
    }

    /// `rb_funcall2`: call `name` on `recv`, ignoring visibility.
    pub fn funcall2(&mut self, recv: Handle, name: SymbolId, args: &[Handle]) -> CapiResult<Handle> {
        self.call_managed(recv, name, args, None, CallStyle::FunctionCall)
    }

    /// Like [`funcall2`](Self::funcall2) but as `recv.name`, so private
    /// methods raise `NoMethodError`.
    pub fn funcall2_public(
        &mut self,
        recv: Handle,
        name: SymbolId,
        args: &[Handle],
    ) -> CapiResult<Handle> {
        self.call_managed(recv, name, args, None, CallStyle::Public)
    }

    /// Call with a Proc (or nil) as the block.
    pub fn funcall_with_block(
        &mut self,
        recv: Handle,
        name: SymbolId,
        args: &[Handle],
        block: Handle,
    ) -> CapiResult<Handle> {
        self.call_managed(recv, name, args, Some(block), CallStyle::FunctionCall)
    }

    /// `rb_block_call`: call `name` with a native block.
    pub fn block_call(
        &mut self,
        recv: Handle,
        name: SymbolId,
        args: &[Handle],
        block: impl Fn(&mut Runtime, &[Handle]) -> CapiResult<Handle> + Send + Sync + 'static,
    ) -> CapiResult<Handle> {
        let block = self.proc_new(-1, block)?;
        self.funcall_with_block(recv, name, args, block)
    }

    /// `rb_call_super`: the next definition of the running method.
    pub fn call_super(&mut self, args: &[Handle]) -> CapiResult<Handle> {
        self.flush_all_views();
        let argv: SmallVec<[Value; 4]> = args.iter().map(|&a| self.value_of(a)).collect();
        let result = self.call_super_value(&argv);
        self.refresh_views();
        let value = result?;
        Ok(self.handle_for(value))
    }

    /// `rb_yield_values`: call the current method's block.
    pub fn yield_values(&mut self, args: &[Handle]) -> CapiResult<Handle> {
        self.flush_all_views();
        let argv: SmallVec<[Value; 4]> = args.iter().map(|&a| self.value_of(a)).collect();
        let result = self.yield_value(&argv);
        self.refresh_views();
        let value = result?;
        Ok(self.handle_for(value))
    }

    /// `rb_block_given_p`.
    #[inline]
    pub fn block_given(&self) -> bool {
        self.current_block().is_some()
    }

    /// `rb_block_proc`: the current block as a Proc.
    pub fn block_proc(&mut self) -> CapiResult<Handle> {
        match self.current_block() {
            Some(block) => Ok(self.handle_for(block)),
            None => Err(self.arg_error("tried to create Proc object without a block")),
        }
    }

    /// `rb_proc_new`: wrap a native closure as a Proc.
    pub fn proc_new(
        &mut self,
        arity: i32,
        body: impl Fn(&mut Runtime, &[Handle]) -> CapiResult<Handle> + Send + Sync + 'static,
    ) -> CapiResult<Handle> {
        let func = Arc::new(move |rt: &mut Runtime, _recv: Value, args: &[Value]| {
            let scope = rt.handles.push_scope();
            let argv: SmallVec<[Handle; 4]> = args.iter().map(|&a| rt.handle_for(a)).collect();
            let result = body(rt, &argv).map(|h| rt.value_of(h));
            rt.close_scope(scope);
            if let (Ok(value), Some(frame)) = (&result, rt.frames.last_mut()) {
                if value.is_reference() {
                    frame.temps.push(*value);
                }
            }
            result
        });
        let value = self.alloc_core(CApiConstant::Proc, ObjectBody::Proc(ProcBody { func, arity }))?;
        Ok(self.handle_for(value))
    }

    fn expect_proc(&mut self, value: Value) -> CapiResult<Value> {
        match self.object_of(value).map(|o| &o.body) {
            Some(ObjectBody::Proc(_)) => Ok(value),
            _ => Err(self.wrong_type(value, "Proc")),
        }
    }

    // =========================================================================
    // Instantiation
    // =========================================================================

    /// `rb_class_new_instance`: allocate and run `initialize`.
    pub fn class_new_instance(&mut self, class: Handle, args: &[Handle]) -> CapiResult<Handle> {
        self.flush_all_views();
        self.safepoint();
        let class = self.expect_module(self.value_of(class))?;
        let argv: SmallVec<[Value; 4]> = args.iter().map(|&a| self.value_of(a)).collect();
        let result = self.new_instance(class, &argv, None);
        self.refresh_views();
        let obj = result?;
        Ok(self.handle_for(obj))
    }

    /// `rb_obj_call_init`: run `initialize` on `obj`, passing the current
    /// block along.
    pub fn obj_call_init(&mut self, obj: Handle, args: &[Handle]) -> CapiResult<()> {
        let init = self.intern("initialize");
        self.flush_all_views();
        let recv = self.value_of(obj);
        let argv: SmallVec<[Value; 4]> = args.iter().map(|&a| self.value_of(a)).collect();
        let block = self.current_block();
        let result = self.dispatch(recv, init, &argv, block, CallStyle::FunctionCall);
        self.refresh_views();
        result.map(|_| ())
    }

    // =========================================================================
    // Argument Scanning
    // =========================================================================

    /// `rb_scan_args`: unpack `argv` by a template such as `"12*&"`.
    ///
    /// Missing optionals are nil. A malformed template is a bug; a count
    /// the template rejects raises `ArgumentError`.
    pub fn scan_args(&mut self, argv: &[Handle], template: &str) -> CapiResult<ScannedArgs> {
        let Some(spec) = ArgSpec::parse(template) else {
            self.violation(ProtocolViolation::InvalidArgSpec(template.to_string()));
        };
        if !spec.accepts(argv.len()) {
            return Err(self.arity_error(argv.len(), spec.expected()));
        }

        let fixed = spec.required + spec.optional;
        let required = argv[..spec.required].to_vec();
        let optional = (spec.required..fixed)
            .map(|i| argv.get(i).copied().unwrap_or(Handle::NIL))
            .collect();
        let splat = if spec.splat {
            let rest = argv.get(fixed..).unwrap_or(&[]);
            Some(self.ary_new_from(rest)?)
        } else {
            None
        };
        let block = if spec.block {
            Some(match self.current_block() {
                Some(block) => self.handle_for(block),
                None => Handle::NIL,
            })
        } else {
            None
        };
        Ok(ScannedArgs {
            required,
            optional,
            splat,
            block,
        })
    }
}
