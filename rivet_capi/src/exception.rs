//! Exception bridge between managed code and native frames.
//!
//! Managed exceptions travel as the `Err` side of [`CapiResult`]. Native
//! code observes and steers them through the classic primitives:
//!
//! ```text
//! ┌───────────┬──────────────────────────────────────────────────────┐
//! │ raise     │ Normal → Raised; unwinds to the nearest boundary     │
//! │ rescue    │ Raised → Rescued when the class filter matches       │
//! │ ensure    │ cleanup runs exactly once; Raised → Ensured          │
//! │ protect   │ Raised → Rescued; hands back (UNDEF, status)         │
//! │ jump_tag  │ resumes a protected failure with the same object     │
//! └───────────┴──────────────────────────────────────────────────────┘
//! ```
//!
//! Every boundary pushes a [`BridgeFrame`]. The pending exception is held
//! in the frame and in `$!` (`errinfo`), both of which are roots.
//!
//! Protocol violations are not exceptions. They go through [`bug`], which
//! logs a diagnostic and panics.

use crate::api::constants::CApiConstant;
use crate::error::{CapiResult, JumpTag, ProtocolViolation, UncaughtException, Unwind};
use crate::object::{ExceptionBody, Object, ObjectBody, StringBody};
use crate::runtime::Runtime;
use rivet_core::{ObjRef, SymbolId, Value};
use rivet_gc::{Forwarding, Handle, Tracer};
use std::fmt;
use std::io;

// =============================================================================
// Fatal Diagnostics
// =============================================================================

/// Report a native-code bug and abort the current thread.
#[cold]
#[track_caller]
pub fn bug(message: impl fmt::Display) -> ! {
    log::error!("[BUG] {message}");
    panic!("[BUG] {message}");
}

// =============================================================================
// Bridge Frames
// =============================================================================

/// Propagation state of one bridge frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Normal,
    Raised,
    Rescued,
    Ensured,
    Propagated,
}

/// What pushed a bridge frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FrameKind {
    Native,
    Rescue,
    Ensure,
    Protect,
}

#[derive(Debug)]
pub(crate) struct BridgeFrame {
    pub kind: FrameKind,
    pub state: BridgeState,
    /// Exception raised inside this frame, or nil.
    pub pending: Value,
    /// `$!` on entry.
    pub saved_errinfo: Value,
}

impl BridgeFrame {
    pub(crate) fn new(kind: FrameKind, saved_errinfo: Value) -> Self {
        Self {
            kind,
            state: BridgeState::Normal,
            pending: Value::NIL,
            saved_errinfo,
        }
    }

    pub(crate) fn trace(&self, tracer: &mut dyn Tracer) {
        tracer.trace_value(self.pending);
        tracer.trace_value(self.saved_errinfo);
    }

    pub(crate) fn relocate(&mut self, fwd: &Forwarding) {
        fwd.update(&mut self.pending);
        fwd.update(&mut self.saved_errinfo);
    }
}

impl Runtime {
    // =========================================================================
    // Frames
    // =========================================================================

    pub(crate) fn push_bridge(&mut self, kind: FrameKind) {
        let errinfo = self.errinfo;
        self.bridge.push(BridgeFrame::new(kind, errinfo));
    }

    pub(crate) fn pop_bridge(&mut self, state: BridgeState) -> BridgeFrame {
        let Some(mut frame) = self.bridge.pop() else {
            bug("bridge frame stack underflow");
        };
        frame.state = state;
        self.last_bridge_state = state;
        log::trace!("bridge: {:?} frame exits {:?}", frame.kind, state);
        frame
    }

    /// State of the innermost bridge frame, or of the last one to exit.
    pub fn bridge_state(&self) -> BridgeState {
        self.bridge
            .last()
            .map_or(self.last_bridge_state, |frame| frame.state)
    }

    /// Nesting of bridge frames.
    #[inline]
    pub fn bridge_depth(&self) -> usize {
        self.bridge.len()
    }

    /// Escalate a protocol violation.
    #[cold]
    pub(crate) fn violation(&self, violation: ProtocolViolation) -> ! {
        bug(violation)
    }

    // =========================================================================
    // Raising
    // =========================================================================

    /// Start unwinding with `exc`.
    ///
    /// Fills in the backtrace on first raise, sets `$!`, and marks the
    /// innermost bridge frame as raised.
    pub(crate) fn raise_value(&mut self, exc: Value) -> Unwind {
        self.fill_backtrace(exc);
        self.errinfo = exc;
        if let Some(frame) = self.bridge.last_mut() {
            frame.state = BridgeState::Raised;
            frame.pending = exc;
        }
        let tag = if self.is_kind_of(exc, self.core(CApiConstant::Fatal)) {
            JumpTag::Fatal
        } else {
            JumpTag::Raise
        };
        if log::log_enabled!(log::Level::Debug) {
            log::debug!(
                "raise {}: {}",
                self.class_name_of(exc),
                self.exception_message(exc)
            );
        }
        Unwind { tag, exception: exc }
    }

    fn fill_backtrace(&mut self, exc: Value) {
        if self.frames.is_empty() {
            return;
        }
        let needs_trace = match self.object_of(exc) {
            Some(obj) if !obj.frozen => {
                matches!(&obj.body, ObjectBody::Exception(e) if e.backtrace.is_nil())
            }
            _ => false,
        };
        if !needs_trace {
            return;
        }
        let lines: Vec<String> = self
            .frames
            .iter()
            .rev()
            .map(|f| self.frame_label(f.owner, f.method))
            .collect();

        // Direct heap allocation: failure here just leaves the backtrace nil.
        let string_class = self.core(CApiConstant::String);
        let mut items = Vec::with_capacity(lines.len());
        for line in lines {
            let body = ObjectBody::String(StringBody::new(line.into_bytes()));
            match self.heap.alloc(Object::new(string_class, body)) {
                Ok(obj) => items.push(Value::reference(obj)),
                Err(_) => return,
            }
        }
        let array_class = self.core(CApiConstant::Array);
        let body = ObjectBody::Array(crate::object::ArrayBody::new(items));
        let Ok(array) = self.heap.alloc(Object::new(array_class, body)) else {
            return;
        };
        if let Some(ObjectBody::Exception(e)) = self.object_of_mut(exc).map(|o| &mut o.body) {
            e.backtrace = Value::reference(array);
        }
    }

    fn frame_label(&self, owner: Option<ObjRef>, method: SymbolId) -> String {
        match owner {
            Some(owner) => format!("in `{}#{}'", self.module_path(owner), self.symbol_name(method)),
            None => format!("in `{}'", self.symbol_name(method)),
        }
    }

    /// Fresh exception of `class` with a String message.
    pub(crate) fn new_exception(&mut self, class: ObjRef, message: &[u8]) -> CapiResult<Value> {
        let message = self.new_string(message)?;
        self.alloc(
            class,
            ObjectBody::Exception(ExceptionBody {
                message,
                backtrace: Value::NIL,
            }),
        )
    }

    fn error_in(&mut self, class: ObjRef, message: &str) -> Unwind {
        match self.new_exception(class, message.as_bytes()) {
            Ok(exc) => self.raise_value(exc),
            Err(unwind) => unwind,
        }
    }

    /// Raise a built-in exception class with `message`.
    pub fn error(&mut self, constant: CApiConstant, message: impl Into<String>) -> Unwind {
        let class = self.core(constant);
        self.error_in(class, &message.into())
    }

    pub(crate) fn type_error(&mut self, message: impl Into<String>) -> Unwind {
        self.error(CApiConstant::TypeError, message)
    }

    pub(crate) fn arg_error(&mut self, message: impl Into<String>) -> Unwind {
        self.error(CApiConstant::ArgumentError, message)
    }

    pub(crate) fn arity_error(&mut self, given: usize, expected: impl fmt::Display) -> Unwind {
        self.arg_error(format!("wrong number of arguments ({given} for {expected})"))
    }

    /// `NameError`-family exception carrying the offending name in `@name`.
    pub(crate) fn name_error(
        &mut self,
        constant: CApiConstant,
        message: impl Into<String>,
        name: SymbolId,
    ) -> Unwind {
        let class = self.core(constant);
        let message = message.into();
        let exc = match self.new_exception(class, message.as_bytes()) {
            Ok(exc) => exc,
            Err(unwind) => return unwind,
        };
        let ivar = self.intern("@name");
        if let Some(obj) = self.object_of_mut(exc) {
            obj.set_ivar(ivar, Value::symbol(name));
        }
        self.raise_value(exc)
    }

    /// Raise the exception object behind `exc` (`rb_exc_raise`).
    pub fn raise(&mut self, exc: Handle) -> Unwind {
        let value = self.value_of(exc);
        if !self.is_kind_of(value, self.core(CApiConstant::Exception)) {
            return self.type_error("exception object expected");
        }
        self.raise_value(value)
    }

    /// Raise a new instance of `class` with `message` (`rb_raise`).
    pub fn raise_error(&mut self, class: Handle, message: &str) -> Unwind {
        let class = match self.expect_module(self.value_of(class)) {
            Ok(class) => class,
            Err(unwind) => return unwind,
        };
        if !self.ancestors(class).contains(&self.core(CApiConstant::Exception)) {
            return self.type_error("exception class expected");
        }
        self.error_in(class, message)
    }

    /// Build an exception of `class` with a message, running `initialize`.
    pub fn exc_new(&mut self, class: Handle, message: &[u8]) -> CapiResult<Handle> {
        let class = self.expect_module(self.value_of(class))?;
        let message = self.new_string(message)?;
        let exc = self.new_instance(class, &[message], None)?;
        Ok(self.handle_for(exc))
    }

    /// Build an exception of `class` from a String message.
    pub fn exc_new_str(&mut self, class: Handle, message: Handle) -> CapiResult<Handle> {
        let class = self.expect_module(self.value_of(class))?;
        let message = self.value_of(message);
        self.expect_string_bytes(message)?;
        let exc = self.new_instance(class, &[message], None)?;
        Ok(self.handle_for(exc))
    }

    /// Raise `SystemCallError` for the calling thread's last OS error.
    pub fn sys_fail(&mut self, message: Option<&str>) -> Unwind {
        self.sys_fail_error(io::Error::last_os_error(), message)
    }

    /// Raise `SystemCallError` for an explicit errno.
    pub fn sys_fail_errno(&mut self, errno: i32, message: Option<&str>) -> Unwind {
        self.sys_fail_error(io::Error::from_raw_os_error(errno), message)
    }

    fn sys_fail_error(&mut self, err: io::Error, message: Option<&str>) -> Unwind {
        let errno = err.raw_os_error().unwrap_or(0);
        let text = err.to_string();
        let text = match text.rfind(" (os error ") {
            Some(pos) => text[..pos].to_string(),
            None => text,
        };
        let text = match message {
            Some(detail) => format!("{text} - {detail}"),
            None => text,
        };
        let class = self.core(CApiConstant::SystemCallError);
        let exc = match self.new_exception(class, text.as_bytes()) {
            Ok(exc) => exc,
            Err(unwind) => return unwind,
        };
        let ivar = self.intern("@errno");
        if let Some(obj) = self.object_of_mut(exc) {
            obj.set_ivar(ivar, Value::fixnum_unchecked(errno as i64));
        }
        self.raise_value(exc)
    }

    /// Raise `fatal`. `rescue` never stops it; `protect` does.
    pub fn fatal(&mut self, message: &str) -> Unwind {
        self.error(CApiConstant::Fatal, message)
    }

    // =========================================================================
    // Boundaries
    // =========================================================================

    /// Run `body`; on any non-fatal exception run `handler` instead
    /// (`rb_rescue`).
    pub fn rescue(
        &mut self,
        body: impl FnOnce(&mut Runtime) -> CapiResult<Handle>,
        handler: impl FnOnce(&mut Runtime, Handle) -> CapiResult<Handle>,
    ) -> CapiResult<Handle> {
        self.rescue_filtered(body, handler, None)
    }

    /// Run `body`; rescue only exceptions that are a kind of one of
    /// `classes` (`rb_rescue2`).
    pub fn rescue2(
        &mut self,
        body: impl FnOnce(&mut Runtime) -> CapiResult<Handle>,
        handler: impl FnOnce(&mut Runtime, Handle) -> CapiResult<Handle>,
        classes: &[Handle],
    ) -> CapiResult<Handle> {
        let mut filter = Vec::with_capacity(classes.len());
        for &class in classes {
            filter.push(self.expect_module(self.value_of(class))?);
        }
        self.rescue_filtered(body, handler, Some(filter.as_slice()))
    }

    fn rescue_filtered(
        &mut self,
        body: impl FnOnce(&mut Runtime) -> CapiResult<Handle>,
        handler: impl FnOnce(&mut Runtime, Handle) -> CapiResult<Handle>,
        filter: Option<&[ObjRef]>,
    ) -> CapiResult<Handle> {
        self.push_bridge(FrameKind::Rescue);
        let unwind = match body(self) {
            Ok(value) => {
                self.pop_bridge(BridgeState::Normal);
                return Ok(value);
            }
            Err(unwind) => unwind,
        };

        let matches = unwind.tag == JumpTag::Raise
            && match filter {
                Some(classes) => classes.iter().any(|&c| self.is_kind_of(unwind.exception, c)),
                None => true,
            };
        if !matches {
            self.pop_bridge(BridgeState::Propagated);
            return Err(unwind);
        }

        let frame = self.pop_bridge(BridgeState::Rescued);
        let exc = self.handle_for(unwind.exception);
        let result = handler(self, exc);
        if result.is_ok() {
            self.errinfo = frame.saved_errinfo;
        }
        result
    }

    /// Run `body`, then `cleanup` exactly once (`rb_ensure`).
    ///
    /// If `cleanup` raises, its exception replaces whatever `body`
    /// produced, including a pending exception.
    pub fn ensure(
        &mut self,
        body: impl FnOnce(&mut Runtime) -> CapiResult<Handle>,
        cleanup: impl FnOnce(&mut Runtime) -> CapiResult<Handle>,
    ) -> CapiResult<Handle> {
        self.push_bridge(FrameKind::Ensure);
        let result = body(self);
        if let (Err(unwind), Some(frame)) = (&result, self.bridge.last_mut()) {
            frame.state = BridgeState::Raised;
            frame.pending = unwind.exception;
        }
        let cleaned = cleanup(self);
        let raised = result.is_err();

        let outcome = match (result, cleaned) {
            (_, Err(secondary)) => {
                log::debug!("ensure: cleanup raised, replacing pending exception");
                Err(secondary)
            }
            (Err(primary), Ok(_)) => {
                self.errinfo = primary.exception;
                Err(primary)
            }
            (Ok(value), Ok(_)) => Ok(value),
        };
        let state = if raised || outcome.is_err() {
            BridgeState::Ensured
        } else {
            BridgeState::Normal
        };
        self.pop_bridge(state);
        outcome
    }

    /// Run `body`, capturing any exception (`rb_protect`).
    ///
    /// Returns `(result, 0)` on success and `(UNDEF, status)` on failure,
    /// with the exception left in `$!` for [`jump_tag`](Self::jump_tag).
    pub fn protect(&mut self, body: impl FnOnce(&mut Runtime) -> CapiResult<Handle>) -> (Handle, i32) {
        self.push_bridge(FrameKind::Protect);
        match body(self) {
            Ok(value) => {
                self.pop_bridge(BridgeState::Normal);
                (value, 0)
            }
            Err(unwind) => {
                self.pop_bridge(BridgeState::Rescued);
                self.errinfo = unwind.exception;
                (Handle::UNDEF, unwind.tag.status())
            }
        }
    }

    /// Resume a failure captured by [`protect`](Self::protect)
    /// (`rb_jump_tag`). Status 0 is a no-op.
    pub fn jump_tag(&mut self, status: i32) -> CapiResult<()> {
        if status == 0 {
            return Ok(());
        }
        let Some(tag) = JumpTag::from_status(status) else {
            self.violation(ProtocolViolation::UnknownJumpTag(status));
        };
        let exc = self.errinfo;
        if exc.is_nil() {
            self.violation(ProtocolViolation::NothingToResume(status));
        }
        if let Some(frame) = self.bridge.last_mut() {
            frame.state = BridgeState::Raised;
            frame.pending = exc;
        }
        Err(Unwind { tag, exception: exc })
    }

    /// Current `$!`.
    pub fn errinfo(&mut self) -> Handle {
        let exc = self.errinfo;
        self.handle_for(exc)
    }

    /// Set `$!`; accepts nil or an exception.
    pub fn set_errinfo(&mut self, exc: Handle) -> CapiResult<()> {
        let value = self.value_of(exc);
        if !value.is_nil() && !self.is_kind_of(value, self.core(CApiConstant::Exception)) {
            return Err(self.type_error("assigning non-exception to $!"));
        }
        self.errinfo = value;
        Ok(())
    }

    /// Run `body` as the outermost frame of an extension entry point.
    ///
    /// An exception escaping `body` is reported and returned as
    /// [`UncaughtException`].
    pub fn run_toplevel(
        &mut self,
        body: impl FnOnce(&mut Runtime) -> CapiResult<Handle>,
    ) -> Result<Handle, UncaughtException> {
        match body(self) {
            Ok(value) => Ok(value),
            Err(unwind) => {
                let exc = unwind.exception;
                let uncaught = UncaughtException {
                    class: self.class_name_of(exc),
                    message: self.exception_message(exc),
                    backtrace: self.exception_backtrace(exc),
                    tag: unwind.tag,
                };
                log::error!("{uncaught}");
                for line in &uncaught.backtrace {
                    log::error!("    {line}");
                }
                Err(uncaught)
            }
        }
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    /// Message text of an exception.
    pub(crate) fn exception_message(&self, exc: Value) -> String {
        let message = match self.object_of(exc).map(|o| &o.body) {
            Some(ObjectBody::Exception(body)) => body.message,
            _ => Value::NIL,
        };
        match self.string_bytes(message) {
            Some(bytes) => String::from_utf8_lossy(bytes).into_owned(),
            None => self.class_name_of(exc),
        }
    }

    pub(crate) fn exception_backtrace(&self, exc: Value) -> Vec<String> {
        let trace = match self.object_of(exc).map(|o| &o.body) {
            Some(ObjectBody::Exception(body)) => body.backtrace,
            _ => return Vec::new(),
        };
        self.array_items(trace)
            .unwrap_or_default()
            .iter()
            .filter_map(|&line| self.string_bytes(line))
            .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
            .collect()
    }

    /// Exception for `Kernel#raise` arguments.
    pub(crate) fn make_exception(&mut self, args: &[Value]) -> CapiResult<Value> {
        let exception = self.core(CApiConstant::Exception);
        match args {
            [] => {
                if self.errinfo.is_nil() {
                    let class = self.core(CApiConstant::RuntimeError);
                    self.new_exception(class, b"unhandled exception")
                } else {
                    Ok(self.errinfo)
                }
            }
            [message] if self.string_bytes(*message).is_some() => {
                let class = self.core(CApiConstant::RuntimeError);
                self.new_instance(class, &[*message], None)
            }
            [exc] if self.is_kind_of(*exc, exception) => Ok(*exc),
            [class, rest @ ..] if rest.len() <= 1 => {
                let Some(class) = class
                    .as_ref()
                    .filter(|&c| self.get(c).as_module().is_some())
                    .filter(|&c| self.ancestors(c).contains(&exception))
                else {
                    return Err(self.type_error("exception class/object expected"));
                };
                self.new_instance(class, rest, None)
            }
            _ => Err(self.arg_error(format!(
                "wrong number of arguments ({} for 0..2)",
                args.len()
            ))),
        }
    }
}
