//! Class, module, method and constant definition.

use crate::api::constants::CApiConstant;
use crate::error::{CapiResult, ProtocolViolation};
use crate::method::{Arity, MethodBody, MethodEntry, MethodKind, NativeFn, Visibility};
use crate::object::{Allocator, ModuleBody, ModuleKind, NativeAllocFn, ObjectBody};
use crate::runtime::Runtime;
use crate::exception::bug;
use rivet_core::{ObjRef, SymbolId, Value};
use rivet_gc::Handle;

impl Runtime {
    // =========================================================================
    // Classes and Modules
    // =========================================================================

    fn new_module_object(&mut self, kind: ModuleKind, superclass: Option<ObjRef>) -> CapiResult<ObjRef> {
        let meta = match kind {
            ModuleKind::Module => self.core(CApiConstant::Module),
            _ => self.core(CApiConstant::Class),
        };
        let body = ModuleBody::new(kind, superclass);
        let value = self.alloc(meta, ObjectBody::Module(Box::new(body)))?;
        match value.as_ref() {
            Some(obj) => Ok(obj),
            None => bug("module allocation returned an immediate"),
        }
    }

    /// Superclass argument: a real class.
    fn expect_superclass(&mut self, superclass: Handle) -> CapiResult<ObjRef> {
        let value = self.value_of(superclass);
        let sup = self.expect_module(value)?;
        let body = self.module(sup);
        if !body.is_class() || body.is_singleton() {
            let what = self.class_name_of(value);
            return Err(self.type_error(format!("superclass must be a Class ({what} given)")));
        }
        Ok(sup)
    }

    fn define_class_in(&mut self, outer: ObjRef, name: &str, superclass: Handle) -> CapiResult<Handle> {
        let sup = self.expect_superclass(superclass)?;
        let id = self.intern(name);
        if let Some(existing) = self.module(outer).constants.get(&id).copied() {
            let path = self.nested_name(outer, id);
            let class = match existing.as_ref() {
                Some(obj) if self.get(obj).as_module().is_some_and(ModuleBody::is_class) => obj,
                _ => return Err(self.type_error(format!("{path} is not a class"))),
            };
            if self.module(class).superclass != Some(sup) {
                return Err(self.type_error(format!("superclass mismatch for class {path}")));
            }
            return Ok(self.handle_for(existing));
        }
        let class = self.new_module_object(ModuleKind::Class, Some(sup))?;
        self.set_const_value(outer, id, Value::reference(class));
        log::debug!("define class {}", self.module_path(class));
        Ok(self.handle_for(Value::reference(class)))
    }

    fn define_module_in(&mut self, outer: ObjRef, name: &str) -> CapiResult<Handle> {
        let id = self.intern(name);
        if let Some(existing) = self.module(outer).constants.get(&id).copied() {
            let is_module = existing
                .as_ref()
                .and_then(|obj| self.get(obj).as_module())
                .is_some_and(|m| m.kind == ModuleKind::Module);
            if !is_module {
                let path = self.nested_name(outer, id);
                return Err(self.type_error(format!("{path} is not a module")));
            }
            return Ok(self.handle_for(existing));
        }
        let module = self.new_module_object(ModuleKind::Module, None)?;
        self.set_const_value(outer, id, Value::reference(module));
        log::debug!("define module {}", self.module_path(module));
        Ok(self.handle_for(Value::reference(module)))
    }

    /// `rb_define_class`: top-level class, reopened if it exists.
    pub fn define_class(&mut self, name: &str, superclass: Handle) -> CapiResult<Handle> {
        let object = self.core(CApiConstant::Object);
        self.define_class_in(object, name, superclass)
    }

    /// `rb_define_class_under`.
    pub fn define_class_under(
        &mut self,
        outer: Handle,
        name: &str,
        superclass: Handle,
    ) -> CapiResult<Handle> {
        let outer = self.expect_module(self.value_of(outer))?;
        self.define_class_in(outer, name, superclass)
    }

    /// `rb_define_module`.
    pub fn define_module(&mut self, name: &str) -> CapiResult<Handle> {
        let object = self.core(CApiConstant::Object);
        self.define_module_in(object, name)
    }

    /// `rb_define_module_under`.
    pub fn define_module_under(&mut self, outer: Handle, name: &str) -> CapiResult<Handle> {
        let outer = self.expect_module(self.value_of(outer))?;
        self.define_module_in(outer, name)
    }

    /// `rb_class_new`: anonymous class.
    pub fn class_new(&mut self, superclass: Handle) -> CapiResult<Handle> {
        let sup = self.expect_superclass(superclass)?;
        let class = self.new_module_object(ModuleKind::Class, Some(sup))?;
        Ok(self.handle_for(Value::reference(class)))
    }

    /// `rb_module_new`: anonymous module.
    pub fn module_new(&mut self) -> CapiResult<Handle> {
        let module = self.new_module_object(ModuleKind::Module, None)?;
        Ok(self.handle_for(Value::reference(module)))
    }

    /// `rb_path2class`: resolve `"A::B::C"` from `Object`.
    pub fn path2class(&mut self, path: &str) -> CapiResult<Handle> {
        let mut current = self.core(CApiConstant::Object);
        let mut walked = String::new();
        for segment in path.split("::") {
            if !walked.is_empty() {
                walked.push_str("::");
            }
            walked.push_str(segment);
            let id = self.intern(segment);
            let Some(value) = self.module(current).constants.get(&id).copied() else {
                return Err(self.arg_error(format!("undefined class/module {walked}")));
            };
            let Some(module) = value.as_ref().filter(|&obj| self.get(obj).as_module().is_some()) else {
                return Err(self.type_error(format!("{walked} does not refer to class/module")));
            };
            current = module;
        }
        Ok(self.handle_for(Value::reference(current)))
    }

    /// `rb_include_module`.
    pub fn include_module(&mut self, class: Handle, module: Handle) -> CapiResult<()> {
        let target = self.expect_module(self.value_of(class))?;
        let module_value = self.value_of(module);
        let module = self.expect_module(module_value)?;
        if self.module(module).kind != ModuleKind::Module {
            return Err(self.wrong_type(module_value, "Module"));
        }
        if self.ancestors(target).contains(&module) {
            return Ok(());
        }
        self.module_mut(target).includes.push(module);
        Ok(())
    }

    /// `rb_extend_object`: include into the singleton class.
    pub fn extend_object(&mut self, obj: Handle, module: Handle) -> CapiResult<()> {
        let singleton = self.singleton_class_of(self.value_of(obj))?;
        let singleton = self.handle_for(Value::reference(singleton));
        self.include_module(singleton, module)
    }

    // =========================================================================
    // Allocators
    // =========================================================================

    /// `rb_define_alloc_func`.
    pub fn define_alloc_func(&mut self, class: Handle, func: NativeAllocFn) -> CapiResult<()> {
        let class = self.expect_module(self.value_of(class))?;
        self.module_mut(class).allocator = Some(Allocator::Native(func));
        Ok(())
    }

    /// `rb_undef_alloc_func`: instances can no longer be allocated.
    pub fn undef_alloc_func(&mut self, class: Handle) -> CapiResult<()> {
        let class = self.expect_module(self.value_of(class))?;
        self.module_mut(class).allocator = Some(Allocator::Undefined);
        Ok(())
    }

    // =========================================================================
    // Methods
    // =========================================================================

    /// `rb_define_method` and friends.
    ///
    /// `arity` must match the shape of `func`; a mismatch is a bug in the
    /// extension and is fatal. Defining an existing name replaces it.
    pub fn define_method(
        &mut self,
        module: Handle,
        name: &str,
        func: NativeFn,
        arity: i32,
        kind: MethodKind,
    ) -> CapiResult<()> {
        let actual = func.arity();
        if Arity::from_c(arity) != Some(actual) {
            self.violation(ProtocolViolation::ArityMismatch {
                declared: arity,
                actual: actual.to_c(),
            });
        }
        let value = self.value_of(module);
        let target = match kind {
            MethodKind::Singleton => self.singleton_class_of(value)?,
            _ => self.expect_module(value)?,
        };
        let id = self.intern(name);
        let entry = MethodEntry::native(func).with_visibility(kind.visibility());
        self.add_method(target, id, entry);
        Ok(())
    }

    /// `rb_define_private_method`.
    pub fn define_private_method(
        &mut self,
        module: Handle,
        name: &str,
        func: NativeFn,
        arity: i32,
    ) -> CapiResult<()> {
        self.define_method(module, name, func, arity, MethodKind::Private)
    }

    /// `rb_define_protected_method`.
    pub fn define_protected_method(
        &mut self,
        module: Handle,
        name: &str,
        func: NativeFn,
        arity: i32,
    ) -> CapiResult<()> {
        self.define_method(module, name, func, arity, MethodKind::Protected)
    }

    /// `rb_define_singleton_method`.
    pub fn define_singleton_method(
        &mut self,
        obj: Handle,
        name: &str,
        func: NativeFn,
        arity: i32,
    ) -> CapiResult<()> {
        self.define_method(obj, name, func, arity, MethodKind::Singleton)
    }

    /// `rb_define_module_function`: private instance method plus a public
    /// singleton method.
    pub fn define_module_function(
        &mut self,
        module: Handle,
        name: &str,
        func: NativeFn,
        arity: i32,
    ) -> CapiResult<()> {
        self.define_method(module, name, func, arity, MethodKind::Private)?;
        self.define_method(module, name, func, arity, MethodKind::Singleton)
    }

    /// `rb_define_global_function`: a module function of `Kernel`.
    pub fn define_global_function(&mut self, name: &str, func: NativeFn, arity: i32) -> CapiResult<()> {
        let kernel = self.get_constant(CApiConstant::Kernel);
        self.define_module_function(kernel, name, func, arity)
    }

    /// `rb_define_alias`.
    pub fn define_alias(&mut self, module: Handle, new_name: &str, old_name: &str) -> CapiResult<()> {
        let module = self.expect_module(self.value_of(module))?;
        let old = self.intern(old_name);
        let Some((_, entry)) = self.find_method(module, old) else {
            let class = self.module_path(module);
            return Err(self.name_error(
                CApiConstant::NameError,
                format!("undefined method `{old_name}' for class `{class}'"),
                old,
            ));
        };
        let new = self.intern(new_name);
        self.add_method(module, new, entry);
        Ok(())
    }

    /// `rb_undef_method`: later lookups stop here.
    pub fn undef_method(&mut self, module: Handle, name: &str) -> CapiResult<()> {
        let module = self.expect_module(self.value_of(module))?;
        let id = self.intern(name);
        let entry = MethodEntry {
            body: MethodBody::Undefined,
            visibility: Visibility::Public,
        };
        self.add_method(module, id, entry);
        Ok(())
    }

    /// `rb_define_attr`: `@name` reader and/or writer.
    pub fn define_attr(&mut self, module: Handle, name: &str, read: bool, write: bool) -> CapiResult<()> {
        let module = self.expect_module(self.value_of(module))?;
        let ivar = self.intern(&format!("@{name}"));
        if read {
            let id = self.intern(name);
            let reader = MethodEntry::managed(0, move |rt, recv, _| Ok(rt.ivar_value(recv, ivar)));
            self.add_method(module, id, reader);
        }
        if write {
            let id = self.intern(&format!("{name}="));
            let writer = MethodEntry::managed(1, move |rt, recv, args| {
                rt.check_frozen(recv)?;
                rt.set_ivar_value(recv, ivar, args[0])?;
                Ok(args[0])
            });
            self.add_method(module, id, writer);
        }
        Ok(())
    }

    // =========================================================================
    // Constants
    // =========================================================================

    fn constant_id(&mut self, name: &str) -> CapiResult<SymbolId> {
        let id = self.intern(name);
        if !name.starts_with(|c: char| c.is_ascii_uppercase()) {
            return Err(self.name_error(
                CApiConstant::NameError,
                format!("wrong constant name {name}"),
                id,
            ));
        }
        Ok(id)
    }

    /// `rb_define_const`.
    pub fn define_const(&mut self, module: Handle, name: &str, value: Handle) -> CapiResult<()> {
        let module = self.expect_module(self.value_of(module))?;
        let id = self.constant_id(name)?;
        let value = self.value_of(value);
        self.set_const_value(module, id, value);
        Ok(())
    }

    /// `rb_define_global_const`.
    pub fn define_global_const(&mut self, name: &str, value: Handle) -> CapiResult<()> {
        let object = self.get_constant(CApiConstant::Object);
        self.define_const(object, name, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CapiConfig;

    fn runtime() -> Runtime {
        Runtime::new(CapiConfig::default()).unwrap()
    }

    fn answer(rt: &mut Runtime, _recv: Handle) -> CapiResult<Handle> {
        Ok(rt.int2num(42))
    }

    fn echo(_rt: &mut Runtime, _recv: Handle, arg: Handle) -> CapiResult<Handle> {
        Ok(arg)
    }

    fn call(rt: &mut Runtime, recv: Handle, name: &str, args: &[Handle]) -> CapiResult<Handle> {
        let id = rt.intern(name);
        rt.funcall2(recv, id, args)
    }

    // =========================================================================
    // Classes and Modules
    // =========================================================================

    #[test]
    fn test_define_class_reopens_with_same_superclass() {
        let mut rt = runtime();
        let object = rt.get_constant(CApiConstant::Object);
        let foo = rt.define_class("Foo", object).unwrap();
        let again = rt.define_class("Foo", object).unwrap();
        assert_eq!(rt.value_of(foo), rt.value_of(again));
        assert_eq!(rt.class2name(foo).unwrap(), "Foo");
    }

    #[test]
    fn test_superclass_mismatch() {
        let mut rt = runtime();
        let object = rt.get_constant(CApiConstant::Object);
        let string = rt.get_constant(CApiConstant::String);
        rt.define_class("Foo", object).unwrap();
        let err = rt.define_class("Foo", string).unwrap_err();
        assert_eq!(rt.exception_message(err.exception), "superclass mismatch for class Foo");
    }

    #[test]
    fn test_class_and_module_name_clashes() {
        let mut rt = runtime();
        let object = rt.get_constant(CApiConstant::Object);
        rt.define_module("Util").unwrap();
        let err = rt.define_class("Util", object).unwrap_err();
        assert_eq!(rt.exception_message(err.exception), "Util is not a class");
        let err = rt.define_module("String").unwrap_err();
        assert_eq!(rt.exception_message(err.exception), "String is not a module");
    }

    #[test]
    fn test_nested_definitions_and_path2class() {
        let mut rt = runtime();
        let object = rt.get_constant(CApiConstant::Object);
        let outer = rt.define_module("Outer").unwrap();
        let inner = rt.define_class_under(outer, "Inner", object).unwrap();
        assert_eq!(rt.class2name(inner).unwrap(), "Outer::Inner");
        let found = rt.path2class("Outer::Inner").unwrap();
        assert_eq!(rt.value_of(found), rt.value_of(inner));

        let err = rt.path2class("Outer::Missing").unwrap_err();
        assert_eq!(
            rt.exception_message(err.exception),
            "undefined class/module Outer::Missing"
        );
    }

    #[test]
    fn test_include_module_adds_methods() {
        let mut rt = runtime();
        let object = rt.get_constant(CApiConstant::Object);
        let helpers = rt.define_module("Helpers").unwrap();
        rt.define_method(helpers, "answer", NativeFn::Arity0(answer), 0, MethodKind::Public)
            .unwrap();
        let foo = rt.define_class("Foo", object).unwrap();
        rt.include_module(foo, helpers).unwrap();
        let obj = rt.class_new_instance(foo, &[]).unwrap();
        let result = call(&mut rt, obj, "answer", &[]).unwrap();
        assert_eq!(rt.num2long(result).unwrap(), 42);
        assert!(rt.obj_is_kind_of(obj, helpers).unwrap());

        let err = rt.include_module(foo, object).unwrap_err();
        assert_eq!(rt.class_name_of(err.exception), "TypeError");
    }

    // =========================================================================
    // Methods
    // =========================================================================

    #[test]
    #[should_panic(expected = "does not fit native function")]
    fn test_arity_mismatch_is_fatal() {
        let mut rt = runtime();
        let object = rt.get_constant(CApiConstant::Object);
        rt.define_method(object, "bad", NativeFn::Arity1(echo), 2, MethodKind::Public)
            .unwrap();
    }

    #[test]
    fn test_redefinition_replaces() {
        let mut rt = runtime();
        let object = rt.get_constant(CApiConstant::Object);
        let foo = rt.define_class("Foo", object).unwrap();
        rt.define_method(foo, "m", NativeFn::Arity1(echo), 1, MethodKind::Public)
            .unwrap();
        rt.define_method(foo, "m", NativeFn::Arity0(answer), 0, MethodKind::Public)
            .unwrap();
        let obj = rt.class_new_instance(foo, &[]).unwrap();
        let result = call(&mut rt, obj, "m", &[]).unwrap();
        assert_eq!(rt.num2long(result).unwrap(), 42);
    }

    #[test]
    fn test_private_method_rejects_public_call() {
        let mut rt = runtime();
        let object = rt.get_constant(CApiConstant::Object);
        let foo = rt.define_class("Foo", object).unwrap();
        rt.define_private_method(foo, "secret", NativeFn::Arity0(answer), 0)
            .unwrap();
        let obj = rt.class_new_instance(foo, &[]).unwrap();
        let id = rt.intern("secret");
        assert!(rt.funcall2(obj, id, &[]).is_ok());
        let err = rt.funcall2_public(obj, id, &[]).unwrap_err();
        assert_eq!(rt.class_name_of(err.exception), "NoMethodError");
    }

    #[test]
    fn test_module_function_and_singleton() {
        let mut rt = runtime();
        let util = rt.define_module("Util").unwrap();
        rt.define_module_function(util, "answer", NativeFn::Arity0(answer), 0)
            .unwrap();
        let result = call(&mut rt, util, "answer", &[]).unwrap();
        assert_eq!(rt.num2long(result).unwrap(), 42);
        let id = rt.intern("answer");
        assert!(rt.respond_to(util, id));
    }

    #[test]
    fn test_alias_and_undef() {
        let mut rt = runtime();
        let object = rt.get_constant(CApiConstant::Object);
        let foo = rt.define_class("Foo", object).unwrap();
        rt.define_method(foo, "answer", NativeFn::Arity0(answer), 0, MethodKind::Public)
            .unwrap();
        rt.define_alias(foo, "reply", "answer").unwrap();
        rt.undef_method(foo, "answer").unwrap();
        let obj = rt.class_new_instance(foo, &[]).unwrap();
        let result = call(&mut rt, obj, "reply", &[]).unwrap();
        assert_eq!(rt.num2long(result).unwrap(), 42);
        let err = call(&mut rt, obj, "answer", &[]).unwrap_err();
        assert_eq!(rt.class_name_of(err.exception), "NoMethodError");

        let err = rt.define_alias(foo, "x", "missing").unwrap_err();
        assert_eq!(
            rt.exception_message(err.exception),
            "undefined method `missing' for class `Foo'"
        );
    }

    #[test]
    fn test_attr_reader_and_writer() {
        let mut rt = runtime();
        let object = rt.get_constant(CApiConstant::Object);
        let point = rt.define_class("Point", object).unwrap();
        rt.define_attr(point, "x", true, true).unwrap();
        let p = rt.class_new_instance(point, &[]).unwrap();
        assert!(call(&mut rt, p, "x", &[]).unwrap().is_nil());
        let three = rt.int2num(3);
        call(&mut rt, p, "x=", &[three]).unwrap();
        let x = call(&mut rt, p, "x", &[]).unwrap();
        assert_eq!(rt.num2long(x).unwrap(), 3);
        let ivar = rt.iv_get(p, "@x");
        assert_eq!(rt.num2long(ivar).unwrap(), 3);
    }

    #[test]
    fn test_undef_alloc_func() {
        let mut rt = runtime();
        let object = rt.get_constant(CApiConstant::Object);
        let foo = rt.define_class("Sealed", object).unwrap();
        rt.undef_alloc_func(foo).unwrap();
        let err = rt.class_new_instance(foo, &[]).unwrap_err();
        assert_eq!(rt.exception_message(err.exception), "allocator undefined for Sealed");
    }

    // =========================================================================
    // Constants
    // =========================================================================

    #[test]
    fn test_define_const() {
        let mut rt = runtime();
        let object = rt.get_constant(CApiConstant::Object);
        let seven = rt.int2num(7);
        rt.define_global_const("SEVEN", seven).unwrap();
        let id = rt.intern("SEVEN");
        let found = rt.const_get(object, id).unwrap();
        assert_eq!(rt.num2long(found).unwrap(), 7);

        let err = rt.define_const(object, "lower", seven).unwrap_err();
        assert_eq!(rt.exception_message(err.exception), "wrong constant name lower");
    }
}
