//! Object protocol: classes, instance variables, constants, freezing.

use crate::api::constants::CApiConstant;
use crate::error::{CapiResult, Unwind};
use crate::runtime::{CallStyle, Runtime};
use rivet_core::{ObjRef, SymbolId, Value};
use rivet_gc::Handle;

impl Runtime {
    // =========================================================================
    // Names and Diagnostics
    // =========================================================================

    /// Display path of a module: `Outer::Inner`, or a `#<Class:...>` form
    /// for anonymous and singleton classes.
    pub(crate) fn module_path(&self, module: ObjRef) -> String {
        let body = self.module(module);
        if let Some(name) = &body.name {
            return name.clone();
        }
        if body.is_singleton() {
            let attached = body.attached.unwrap_or(Value::NIL);
            return format!("#<Class:{}>", self.attached_label(attached));
        }
        let kind = if body.is_class() { "Class" } else { "Module" };
        format!("#<{kind}:0x{:x}>", Value::reference(module).bits())
    }

    fn attached_label(&self, value: Value) -> String {
        match value.as_ref() {
            Some(obj) if self.get(obj).as_module().is_some() => self.module_path(obj),
            _ => self.default_to_s(value),
        }
    }

    /// Name of the (non-singleton) class of `value`.
    pub(crate) fn class_name_of(&self, value: Value) -> String {
        self.module_path(self.real_class(value))
    }

    /// `#<Foo:0x...>`.
    pub(crate) fn default_to_s(&self, value: Value) -> String {
        format!("#<{}:0x{:x}>", self.class_name_of(value), value.bits())
    }

    /// Short receiver description for error messages.
    pub(crate) fn describe(&self, value: Value) -> String {
        if value.is_nil() {
            return "nil:NilClass".to_string();
        }
        if value.is_true() {
            return "true:TrueClass".to_string();
        }
        if value.is_false() {
            return "false:FalseClass".to_string();
        }
        if let Some(n) = value.as_fixnum() {
            return format!("{n}:Fixnum");
        }
        if let Some(id) = value.as_symbol() {
            return format!(":{}:Symbol", self.symbol_name(id));
        }
        match value.as_ref() {
            Some(obj) => match self.get(obj).as_module() {
                Some(m) => {
                    let kind = if m.is_class() { "Class" } else { "Module" };
                    format!("{}:{kind}", self.module_path(obj))
                }
                None => format!("#<{}>", self.class_name_of(value)),
            },
            None => "undef".to_string(),
        }
    }

    /// `inspect` through dispatch, as text.
    pub(crate) fn inspect_string(&mut self, value: Value) -> CapiResult<String> {
        let id = self.intern("inspect");
        let text = self.call_into_managed(value, id, &[], None, CallStyle::FunctionCall)?;
        let bytes = self.expect_string_bytes(text)?;
        Ok(String::from_utf8_lossy(bytes).into_owned())
    }

    /// `TypeError: wrong argument type X (expected Y)`.
    pub(crate) fn wrong_type(&mut self, value: Value, expected: &str) -> Unwind {
        let got = self.class_name_of(value);
        self.type_error(format!("wrong argument type {got} (expected {expected})"))
    }

    // =========================================================================
    // Value Helpers
    // =========================================================================

    pub(crate) fn expect_module(&mut self, value: Value) -> CapiResult<ObjRef> {
        match value.as_ref() {
            Some(obj) if self.get(obj).as_module().is_some() => Ok(obj),
            _ => {
                let what = self.describe(value);
                Err(self.type_error(format!("{what} is not a class/module")))
            }
        }
    }

    pub(crate) fn is_frozen(&self, value: Value) -> bool {
        self.object_of(value).is_some_and(|o| o.frozen)
    }

    /// Raise `TypeError` when `value` is frozen.
    pub(crate) fn check_frozen(&mut self, value: Value) -> CapiResult<()> {
        if self.is_frozen(value) {
            let name = self.class_name_of(value);
            return Err(self.type_error(format!("can't modify frozen {name}")));
        }
        Ok(())
    }

    pub(crate) fn ivar_value(&self, value: Value, name: SymbolId) -> Value {
        self.object_of(value)
            .and_then(|o| o.ivar(name))
            .unwrap_or(Value::NIL)
    }

    pub(crate) fn set_ivar_value(
        &mut self,
        value: Value,
        name: SymbolId,
        ivar: Value,
    ) -> CapiResult<()> {
        if !value.is_reference() {
            let name = self.class_name_of(value);
            return Err(self.arg_error(format!("can't set instance variable on {name}")));
        }
        self.check_frozen(value)?;
        if let Some(obj) = self.object_of_mut(value) {
            obj.set_ivar(name, ivar);
        }
        Ok(())
    }

    // =========================================================================
    // Classes
    // =========================================================================

    /// `rb_class_of`: the lookup class, singleton included.
    pub fn class_of(&mut self, obj: Handle) -> Handle {
        let class = self.class_of_value(self.value_of(obj));
        self.handle_for(Value::reference(class))
    }

    /// `rb_obj_class`: the real class.
    pub fn obj_class(&mut self, obj: Handle) -> Handle {
        let class = self.real_class(self.value_of(obj));
        self.handle_for(Value::reference(class))
    }

    /// `rb_obj_classname`.
    pub fn obj_classname(&self, obj: Handle) -> String {
        self.class_name_of(self.value_of(obj))
    }

    /// `rb_class2name`.
    pub fn class2name(&mut self, class: Handle) -> CapiResult<String> {
        let module = self.expect_module(self.value_of(class))?;
        Ok(self.module_path(module))
    }

    /// `rb_obj_is_kind_of`.
    pub fn obj_is_kind_of(&mut self, obj: Handle, module: Handle) -> CapiResult<bool> {
        let module = self.expect_module(self.value_of(module))?;
        Ok(self.is_kind_of(self.value_of(obj), module))
    }

    /// `rb_obj_is_instance_of`.
    pub fn obj_is_instance_of(&mut self, obj: Handle, class: Handle) -> CapiResult<bool> {
        let class = self.expect_module(self.value_of(class))?;
        Ok(self.real_class(self.value_of(obj)) == class)
    }

    /// `rb_singleton_class`.
    pub fn singleton_class(&mut self, obj: Handle) -> CapiResult<Handle> {
        let singleton = self.singleton_class_of(self.value_of(obj))?;
        Ok(self.handle_for(Value::reference(singleton)))
    }

    /// `rb_respond_to`: public methods only.
    pub fn respond_to(&self, obj: Handle, name: SymbolId) -> bool {
        self.respond_to_value(self.value_of(obj), name, false)
    }

    /// `rb_obj_respond_to` with an explicit private flag.
    pub fn obj_respond_to(&self, obj: Handle, name: SymbolId, include_private: bool) -> bool {
        self.respond_to_value(self.value_of(obj), name, include_private)
    }

    /// `rb_equal`: identity, then `==`.
    pub fn equal(&mut self, a: Handle, b: Handle) -> CapiResult<bool> {
        let (a, b) = (self.value_of(a), self.value_of(b));
        if a == b {
            return Ok(true);
        }
        let eq = self.intern("==");
        Ok(self.call_into_managed(a, eq, &[b], None, CallStyle::FunctionCall)?.test())
    }

    /// `rb_inspect`.
    pub fn inspect(&mut self, obj: Handle) -> CapiResult<Handle> {
        let text = self.inspect_string(self.value_of(obj))?;
        let value = self.new_string(text)?;
        Ok(self.handle_for(value))
    }

    /// `rb_obj_as_string`: `to_s` unless already a String.
    pub fn obj_as_string(&mut self, obj: Handle) -> CapiResult<Handle> {
        let value = self.value_of(obj);
        if self.string_bytes(value).is_some() {
            return Ok(obj);
        }
        let to_s = self.intern("to_s");
        let text = self.call_into_managed(value, to_s, &[], None, CallStyle::FunctionCall)?;
        if self.string_bytes(text).is_none() {
            let fallback = self.default_to_s(value);
            let fallback = self.new_string(fallback)?;
            return Ok(self.handle_for(fallback));
        }
        Ok(self.handle_for(text))
    }

    // =========================================================================
    // Freezing
    // =========================================================================

    /// `rb_obj_freeze`. Immediates are always frozen.
    pub fn obj_freeze(&mut self, obj: Handle) -> Handle {
        let value = self.value_of(obj);
        if let Some(object) = self.object_of_mut(value) {
            object.frozen = true;
        }
        obj
    }

    /// `OBJ_FROZEN`.
    pub fn obj_frozen(&self, obj: Handle) -> bool {
        let value = self.value_of(obj);
        !value.is_reference() || self.is_frozen(value)
    }

    /// `rb_check_frozen`.
    pub fn check_frozen_handle(&mut self, obj: Handle) -> CapiResult<()> {
        let value = self.value_of(obj);
        self.check_frozen(value)
    }

    // =========================================================================
    // Instance Variables
    // =========================================================================

    /// `rb_ivar_get`; unset variables read as nil.
    pub fn ivar_get(&mut self, obj: Handle, name: SymbolId) -> Handle {
        let value = self.ivar_value(self.value_of(obj), name);
        self.handle_for(value)
    }

    /// `rb_ivar_set`.
    pub fn ivar_set(&mut self, obj: Handle, name: SymbolId, value: Handle) -> CapiResult<Handle> {
        let ivar = self.value_of(value);
        self.set_ivar_value(self.value_of(obj), name, ivar)?;
        Ok(value)
    }

    /// `rb_ivar_defined`.
    pub fn ivar_defined(&self, obj: Handle, name: SymbolId) -> bool {
        self.object_of(self.value_of(obj))
            .is_some_and(|o| o.ivar(name).is_some())
    }

    /// `rb_iv_get`: by name, `@` included.
    pub fn iv_get(&mut self, obj: Handle, name: &str) -> Handle {
        let id = self.intern(name);
        self.ivar_get(obj, id)
    }

    /// `rb_iv_set`.
    pub fn iv_set(&mut self, obj: Handle, name: &str, value: Handle) -> CapiResult<Handle> {
        let id = self.intern(name);
        self.ivar_set(obj, id, value)
    }

    // =========================================================================
    // Constants
    // =========================================================================

    /// Constant lookup: the module, its ancestors, then `Object`.
    pub(crate) fn lookup_const(&self, module: ObjRef, name: SymbolId) -> Option<Value> {
        let mut chain = self.ancestors(module);
        chain.push(self.core(CApiConstant::Object));
        chain
            .into_iter()
            .find_map(|m| self.module(m).constants.get(&name).copied())
    }

    /// Bind a constant, naming anonymous modules after it.
    pub(crate) fn set_const_value(&mut self, module: ObjRef, name: SymbolId, value: Value) {
        if self.module(module).constants.contains_key(&name) {
            log::warn!(
                "already initialized constant {}",
                self.symbol_name(name)
            );
        }
        if let Some(obj) = value.as_ref() {
            if self.get(obj).as_module().is_some_and(|m| m.name.is_none()) {
                let path = self.nested_name(module, name);
                let body = self.module_mut(obj);
                body.name = Some(path);
                body.parent = Some(module);
            }
        }
        self.module_mut(module).constants.insert(name, value);
    }

    /// `Outer::name`, or bare `name` under `Object`.
    pub(crate) fn nested_name(&self, outer: ObjRef, name: SymbolId) -> String {
        if outer == self.core(CApiConstant::Object) {
            self.symbol_name(name)
        } else {
            format!("{}::{}", self.module_path(outer), self.symbol_name(name))
        }
    }

    fn uninitialized_constant(&mut self, module: ObjRef, name: SymbolId) -> Unwind {
        let path = self.nested_name(module, name);
        self.name_error(
            CApiConstant::NameError,
            format!("uninitialized constant {path}"),
            name,
        )
    }

    /// `rb_const_get`.
    pub fn const_get(&mut self, module: Handle, name: SymbolId) -> CapiResult<Handle> {
        let module = self.expect_module(self.value_of(module))?;
        match self.lookup_const(module, name) {
            Some(value) => Ok(self.handle_for(value)),
            None => Err(self.uninitialized_constant(module, name)),
        }
    }

    /// `rb_const_get_at`: only the module's own table.
    pub fn const_get_at(&mut self, module: Handle, name: SymbolId) -> CapiResult<Handle> {
        let module = self.expect_module(self.value_of(module))?;
        match self.module(module).constants.get(&name).copied() {
            Some(value) => Ok(self.handle_for(value)),
            None => Err(self.uninitialized_constant(module, name)),
        }
    }

    /// `rb_const_set`.
    pub fn const_set(&mut self, module: Handle, name: SymbolId, value: Handle) -> CapiResult<()> {
        let module = self.expect_module(self.value_of(module))?;
        self.check_frozen(Value::reference(module))?;
        let value = self.value_of(value);
        self.set_const_value(module, name, value);
        Ok(())
    }

    /// `rb_const_defined`.
    pub fn const_defined(&mut self, module: Handle, name: SymbolId) -> CapiResult<bool> {
        let module = self.expect_module(self.value_of(module))?;
        Ok(self.lookup_const(module, name).is_some())
    }
}
