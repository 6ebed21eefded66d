//! Managed method dispatch.
//!
//! Lookup walks the receiver's singleton class, its class, included
//! modules (most recent first) and superclasses. An `Undefined` entry
//! stops the walk. Both managed closures and native trampolines sit
//! behind the same [`MethodBody`] variant so callers never care which
//! kind of method they reached.

use super::Runtime;
use crate::api::constants::CApiConstant;
use crate::error::CapiResult;
use crate::exception::bug;
use crate::method::{MethodBody, MethodEntry, Visibility};
use crate::object::{ModuleBody, ModuleKind, ObjectBody};
use rivet_core::{ObjRef, SymbolId, Value};
use rivet_gc::{Forwarding, Tracer};
use smallvec::SmallVec;

/// How a call names its receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallStyle {
    /// `recv.foo`: private methods are rejected.
    Public,
    /// `foo` or a native `funcall`: visibility is not checked.
    FunctionCall,
}

/// One managed invocation.
#[derive(Debug)]
pub(crate) struct CallFrame {
    pub receiver: Value,
    pub method: SymbolId,
    /// Module the running method was found in.
    pub owner: Option<ObjRef>,
    pub args: SmallVec<[Value; 4]>,
    pub block: Option<Value>,
    /// Objects allocated by this frame or returned to it.
    pub temps: Vec<Value>,
}

impl CallFrame {
    pub(crate) fn new(
        receiver: Value,
        method: SymbolId,
        owner: Option<ObjRef>,
        args: &[Value],
        block: Option<Value>,
    ) -> Self {
        Self {
            receiver,
            method,
            owner,
            args: SmallVec::from_slice(args),
            block,
            temps: Vec::new(),
        }
    }

    pub(crate) fn trace(&self, tracer: &mut dyn Tracer) {
        tracer.trace_value(self.receiver);
        if let Some(owner) = self.owner {
            tracer.trace_ref(owner);
        }
        for arg in &self.args {
            tracer.trace_value(*arg);
        }
        if let Some(block) = self.block {
            tracer.trace_value(block);
        }
        for temp in &self.temps {
            tracer.trace_value(*temp);
        }
    }

    pub(crate) fn relocate(&mut self, fwd: &Forwarding) {
        fwd.update(&mut self.receiver);
        if let Some(owner) = self.owner.as_mut() {
            *owner = fwd.forward(*owner);
        }
        for arg in self.args.iter_mut() {
            fwd.update(arg);
        }
        if let Some(block) = self.block.as_mut() {
            fwd.update(block);
        }
        for temp in self.temps.iter_mut() {
            fwd.update(temp);
        }
    }
}

impl Runtime {
    // =========================================================================
    // Classes
    // =========================================================================

    /// Class lookup starts from: the singleton class if one exists.
    pub(crate) fn class_of_value(&self, value: Value) -> ObjRef {
        match value.as_ref() {
            Some(obj) => self.get(obj).class,
            None => self.immediate_class(value),
        }
    }

    fn immediate_class(&self, value: Value) -> ObjRef {
        let constant = if value.is_fixnum() {
            CApiConstant::Fixnum
        } else if value.is_symbol() {
            CApiConstant::Symbol
        } else if value.is_nil() {
            CApiConstant::NilClass
        } else if value.is_true() {
            CApiConstant::TrueClass
        } else if value.is_false() {
            CApiConstant::FalseClass
        } else {
            CApiConstant::Object
        };
        self.core(constant)
    }

    /// Class of `value`, skipping singleton classes.
    pub(crate) fn real_class(&self, value: Value) -> ObjRef {
        let mut class = self.class_of_value(value);
        loop {
            let module = self.module(class);
            match (module.is_singleton(), module.superclass) {
                (true, Some(sup)) => class = sup,
                _ => return class,
            }
        }
    }

    /// Lookup order for `class`: itself, its includes, then superclasses.
    pub(crate) fn ancestors(&self, class: ObjRef) -> Vec<ObjRef> {
        let mut chain = Vec::new();
        let mut current = Some(class);
        while let Some(c) = current {
            chain.push(c);
            let module = self.module(c);
            for &inc in module.includes.iter().rev() {
                if !chain.contains(&inc) {
                    chain.push(inc);
                }
            }
            current = module.superclass;
        }
        chain
    }

    /// `value.kind_of?(module)`.
    pub(crate) fn is_kind_of(&self, value: Value, module: ObjRef) -> bool {
        self.ancestors(self.class_of_value(value)).contains(&module)
    }

    /// Singleton class of `value`, created on demand.
    ///
    /// A class's singleton inherits from its superclass's singleton so
    /// class methods are inherited.
    pub(crate) fn singleton_class_of(&mut self, value: Value) -> CapiResult<ObjRef> {
        let Some(obj) = value.as_ref() else {
            if value.is_nil() || value.is_true() || value.is_false() {
                return Ok(self.immediate_class(value));
            }
            return Err(self.type_error("can't define singleton"));
        };
        let current = self.get(obj).class;
        let current_module = self.module(current);
        if current_module.is_singleton() && current_module.attached == Some(value) {
            return Ok(current);
        }

        let superclass = match self.get(obj).as_module() {
            Some(m) if m.is_class() => match m.superclass {
                Some(sup) => self.singleton_class_of(Value::reference(sup))?,
                None => self.core(CApiConstant::Class),
            },
            _ => current,
        };
        let mut body = ModuleBody::new(ModuleKind::Singleton, Some(superclass));
        body.attached = Some(value);
        let meta = self.core(CApiConstant::Class);
        let singleton = self.alloc(meta, ObjectBody::Module(Box::new(body)))?;
        let Some(singleton) = singleton.as_ref() else {
            bug("singleton class allocation returned an immediate");
        };
        self.get_mut(obj).class = singleton;
        Ok(singleton)
    }

    // =========================================================================
    // Method tables
    // =========================================================================

    /// Install or replace a method.
    pub(crate) fn add_method(&mut self, module: ObjRef, name: SymbolId, entry: MethodEntry) {
        if log::log_enabled!(log::Level::Trace) {
            log::trace!(
                "define {}#{} ({:?})",
                self.module_path(module),
                self.symbol_name(name),
                entry.body
            );
        }
        self.module_mut(module).methods.insert(name, entry);
    }

    /// First definition of `name` along the ancestors of `class`.
    pub(crate) fn find_method(&self, class: ObjRef, name: SymbolId) -> Option<(ObjRef, MethodEntry)> {
        self.find_method_in(&self.ancestors(class), name)
    }

    fn find_method_in(&self, chain: &[ObjRef], name: SymbolId) -> Option<(ObjRef, MethodEntry)> {
        for &module in chain {
            if let Some(entry) = self.module(module).methods.get(&name) {
                if entry.is_undefined() {
                    return None;
                }
                return Some((module, entry.clone()));
            }
        }
        None
    }

    pub(crate) fn respond_to_value(&self, value: Value, name: SymbolId, include_private: bool) -> bool {
        match self.find_method(self.class_of_value(value), name) {
            Some((_, entry)) => include_private || entry.visibility != Visibility::Private,
            None => false,
        }
    }

    // =========================================================================
    // Calls
    // =========================================================================

    /// Block of the innermost frame.
    #[inline]
    pub(crate) fn current_block(&self) -> Option<Value> {
        self.frames.last().and_then(|f| f.block)
    }

    /// `self` of the innermost frame.
    #[inline]
    pub(crate) fn current_self(&self) -> Value {
        self.frames.last().map_or(self.main, |f| f.receiver)
    }

    /// Look up and invoke `name` on `recv`.
    pub(crate) fn dispatch(
        &mut self,
        recv: Value,
        name: SymbolId,
        args: &[Value],
        block: Option<Value>,
        style: CallStyle,
    ) -> CapiResult<Value> {
        let class = self.class_of_value(recv);
        let Some((owner, entry)) = self.find_method(class, name) else {
            let message = format!(
                "undefined method `{}' for {}",
                self.symbol_name(name),
                self.describe(recv)
            );
            return Err(self.name_error(CApiConstant::NoMethodError, message, name));
        };

        if style == CallStyle::Public {
            match entry.visibility {
                Visibility::Public => {}
                Visibility::Private => {
                    let message = format!(
                        "private method `{}' called for {}",
                        self.symbol_name(name),
                        self.describe(recv)
                    );
                    return Err(self.name_error(CApiConstant::NoMethodError, message, name));
                }
                Visibility::Protected => {
                    if !self.is_kind_of(self.current_self(), owner) {
                        let message = format!(
                            "protected method `{}' called for {}",
                            self.symbol_name(name),
                            self.describe(recv)
                        );
                        return Err(self.name_error(CApiConstant::NoMethodError, message, name));
                    }
                }
            }
        }
        self.invoke(owner, entry, recv, name, args, block)
    }

    fn invoke(
        &mut self,
        owner: ObjRef,
        entry: MethodEntry,
        recv: Value,
        name: SymbolId,
        args: &[Value],
        block: Option<Value>,
    ) -> CapiResult<Value> {
        if self.frames.len() >= self.config.max_call_depth {
            return Err(self.error(CApiConstant::SystemStackError, "stack level too deep"));
        }
        log::trace!("call {} argc={}", self.symbol_name(name), args.len());

        self.frames
            .push(CallFrame::new(recv, name, Some(owner), args, block));
        let result = match entry.body {
            MethodBody::Managed { func, arity } => {
                if managed_arity_accepts(arity, args.len()) {
                    func(self, recv, args)
                } else {
                    Err(self.arity_error(args.len(), managed_arity_expected(arity)))
                }
            }
            MethodBody::Native(func) => self.call_native(func, recv, args, name),
            MethodBody::Undefined => unreachable!("lookup never returns undefined entries"),
        };
        self.frames.pop();

        if let (Ok(value), Some(caller)) = (&result, self.frames.last_mut()) {
            if value.is_reference() {
                caller.temps.push(*value);
            }
        }
        result
    }

    /// Invoke the next definition of the running method (`super`).
    pub(crate) fn call_super_value(&mut self, args: &[Value]) -> CapiResult<Value> {
        let Some(frame) = self.frames.last() else {
            return Err(self.error(CApiConstant::RuntimeError, "super called outside of method"));
        };
        let (recv, name, owner, block) = (frame.receiver, frame.method, frame.owner, frame.block);
        let chain = self.ancestors(self.class_of_value(recv));
        let start = owner
            .and_then(|o| chain.iter().position(|&m| m == o))
            .map_or(chain.len(), |pos| pos + 1);
        match self.find_method_in(&chain[start..], name) {
            Some((next_owner, entry)) => self.invoke(next_owner, entry, recv, name, args, block),
            None => {
                let message = format!(
                    "super: no superclass method `{}'",
                    self.symbol_name(name)
                );
                Err(self.name_error(CApiConstant::NoMethodError, message, name))
            }
        }
    }

    /// Call the current method's block.
    pub(crate) fn yield_value(&mut self, args: &[Value]) -> CapiResult<Value> {
        match self.current_block() {
            Some(block) => self.call_proc(block, args),
            None => Err(self.error(CApiConstant::LocalJumpError, "no block given")),
        }
    }

    /// Call a `Proc`.
    pub(crate) fn call_proc(&mut self, proc: Value, args: &[Value]) -> CapiResult<Value> {
        let func = match self.object_of(proc).map(|o| &o.body) {
            Some(ObjectBody::Proc(body)) => body.func.clone(),
            _ => {
                let message = format!("{} is not a Proc", self.describe(proc));
                return Err(self.type_error(message));
            }
        };
        let recv = self.current_self();
        func(self, recv, args)
    }
}

fn managed_arity_accepts(arity: i32, argc: usize) -> bool {
    if arity >= 0 {
        argc == arity as usize
    } else {
        argc >= (-arity - 1) as usize
    }
}

fn managed_arity_expected(arity: i32) -> String {
    if arity >= 0 {
        arity.to_string()
    } else {
        format!("{}+", -arity - 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CapiConfig;
    use crate::error::JumpTag;

    fn runtime() -> Runtime {
        Runtime::new(CapiConfig::default()).unwrap()
    }

    fn new_class(rt: &mut Runtime, sup: CApiConstant) -> ObjRef {
        let sup = rt.core(sup);
        let meta = rt.core(CApiConstant::Class);
        let value = rt
            .alloc(meta, ObjectBody::Module(Box::new(ModuleBody::new(ModuleKind::Class, Some(sup)))))
            .unwrap();
        rt.roots.add(value);
        value.as_ref().unwrap()
    }

    fn instance(rt: &mut Runtime, class: ObjRef) -> Value {
        let value = rt.alloc(class, ObjectBody::Plain).unwrap();
        rt.roots.add(value);
        value
    }

    #[test]
    fn test_managed_arity() {
        assert!(managed_arity_accepts(2, 2));
        assert!(!managed_arity_accepts(2, 1));
        assert!(managed_arity_accepts(-1, 0));
        assert!(managed_arity_accepts(-2, 1));
        assert!(!managed_arity_accepts(-2, 0));
        assert_eq!(managed_arity_expected(-2), "1+");
    }

    #[test]
    fn test_dispatch_finds_kernel_methods() {
        let mut rt = runtime();
        let nil_p = rt.intern("nil?");
        let result = rt.dispatch(Value::NIL, nil_p, &[], None, CallStyle::Public);
        assert_eq!(result, Ok(Value::TRUE));
        let result = rt.dispatch(Value::fixnum_unchecked(1), nil_p, &[], None, CallStyle::Public);
        assert_eq!(result, Ok(Value::FALSE));
    }

    #[test]
    fn test_missing_method_raises_no_method_error() {
        let mut rt = runtime();
        let name = rt.intern("frobnicate");
        let err = rt
            .dispatch(Value::NIL, name, &[], None, CallStyle::Public)
            .unwrap_err();
        assert_eq!(err.tag, JumpTag::Raise);
        assert_eq!(
            rt.real_class(err.exception),
            rt.core(CApiConstant::NoMethodError)
        );
        assert_eq!(
            rt.exception_message(err.exception),
            "undefined method `frobnicate' for nil:NilClass"
        );
    }

    #[test]
    fn test_private_rejects_public_style() {
        let mut rt = runtime();
        let init = rt.intern("initialize");
        let object = rt.core(CApiConstant::Object);
        let obj = instance(&mut rt, object);
        assert!(rt.dispatch(obj, init, &[], None, CallStyle::Public).is_err());
        assert!(rt.dispatch(obj, init, &[], None, CallStyle::FunctionCall).is_ok());
    }

    #[test]
    fn test_protected_requires_kindred_caller() {
        let mut rt = runtime();
        let class = new_class(&mut rt, CApiConstant::Object);
        let name = rt.intern("secret");
        rt.add_method(
            class,
            name,
            MethodEntry::managed(0, |_, _, _| Ok(Value::TRUE)).with_visibility(Visibility::Protected),
        );
        let obj = instance(&mut rt, class);
        assert!(rt.dispatch(obj, name, &[], None, CallStyle::Public).is_err());

        rt.frames.push(CallFrame::new(obj, name, Some(class), &[], None));
        let result = rt.dispatch(obj, name, &[], None, CallStyle::Public);
        rt.frames.pop();
        assert_eq!(result, Ok(Value::TRUE));
    }

    #[test]
    fn test_undef_stops_lookup() {
        let mut rt = runtime();
        let class = new_class(&mut rt, CApiConstant::Object);
        let name = rt.intern("nil?");
        rt.add_method(
            class,
            name,
            MethodEntry {
                body: MethodBody::Undefined,
                visibility: Visibility::Public,
            },
        );
        let obj = instance(&mut rt, class);
        assert!(rt.dispatch(obj, name, &[], None, CallStyle::Public).is_err());
        assert!(!rt.respond_to_value(obj, name, true));
    }

    #[test]
    fn test_include_order_most_recent_first() {
        let mut rt = runtime();
        let class = new_class(&mut rt, CApiConstant::Object);
        let first = rt.core(CApiConstant::Comparable);
        let second = rt.core(CApiConstant::Enumerable);
        rt.module_mut(class).includes.push(first);
        rt.module_mut(class).includes.push(second);
        let chain = rt.ancestors(class);
        assert_eq!(&chain[..3], &[class, second, first]);
    }

    #[test]
    fn test_super_reaches_parent_definition() {
        let mut rt = runtime();
        let parent = new_class(&mut rt, CApiConstant::Object);
        let child = rt.alloc(
            rt.core(CApiConstant::Class),
            ObjectBody::Module(Box::new(ModuleBody::new(ModuleKind::Class, Some(parent)))),
        );
        let child = child.unwrap();
        rt.roots.add(child);
        let child = child.as_ref().unwrap();

        let name = rt.intern("value");
        rt.add_method(parent, name, MethodEntry::managed(0, |_, _, _| {
            Ok(Value::fixnum_unchecked(1))
        }));
        rt.add_method(child, name, MethodEntry::managed(0, |rt, _, _| {
            let up = rt.call_super_value(&[])?;
            Ok(Value::fixnum_unchecked(up.as_fixnum().unwrap_or(0) + 10))
        }));
        let obj = instance(&mut rt, child);
        let result = rt.dispatch(obj, name, &[], None, CallStyle::Public);
        assert_eq!(result, Ok(Value::fixnum_unchecked(11)));
    }

    #[test]
    fn test_call_depth_limit() {
        let mut rt = Runtime::new(CapiConfig {
            max_call_depth: 8,
            ..Default::default()
        })
        .unwrap();
        let class = new_class(&mut rt, CApiConstant::Object);
        let name = rt.intern("recurse");
        rt.add_method(class, name, MethodEntry::managed(0, move |rt, recv, _| {
            rt.dispatch(recv, name, &[], None, CallStyle::FunctionCall)
        }));
        let obj = instance(&mut rt, class);
        let err = rt
            .dispatch(obj, name, &[], None, CallStyle::Public)
            .unwrap_err();
        assert_eq!(
            rt.real_class(err.exception),
            rt.core(CApiConstant::SystemStackError)
        );
        assert!(rt.frames.is_empty());
    }

    #[test]
    fn test_singleton_class_is_reused() {
        let mut rt = runtime();
        let object = rt.core(CApiConstant::Object);
        let obj = instance(&mut rt, object);
        let first = rt.singleton_class_of(obj).unwrap();
        let second = rt.singleton_class_of(obj).unwrap();
        assert_eq!(first, second);
        assert_eq!(rt.real_class(obj), rt.core(CApiConstant::Object));
        assert_eq!(rt.class_of_value(obj), first);
    }

    #[test]
    fn test_yield_without_block() {
        let mut rt = runtime();
        let err = rt.yield_value(&[]).unwrap_err();
        assert_eq!(
            rt.real_class(err.exception),
            rt.core(CApiConstant::LocalJumpError)
        );
    }
}
