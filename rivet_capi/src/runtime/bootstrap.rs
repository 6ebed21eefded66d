//! Core class hierarchy and the managed methods every object answers.
//!
//! Bootstrap objects are pinned and listed in the root set: they never
//! move and never die, so their `ObjRef`s and handles can be cached.

use super::{InitError, Runtime};
use crate::api::constants::{BOOT_ORDER, CApiConstant, ConstantShape};
use crate::error::CapiResult;
use crate::method::{MethodEntry, Visibility};
use crate::object::{
    Allocator, BodyKind, ExceptionBody, ModuleBody, ModuleKind, Object, ObjectBody,
    StringBody,
};
use num_bigint::BigInt;
use rivet_core::{ObjRef, SymbolTable, Value};
use rivet_gc::{Handle, HandleTable, Heap, RootSet};

/// Built-in classes by [`CApiConstant`].
#[derive(Debug)]
pub struct CoreClasses {
    refs: Vec<ObjRef>,
    handles: Vec<Handle>,
}

impl CoreClasses {
    #[inline]
    pub fn get(&self, constant: CApiConstant) -> ObjRef {
        self.refs[constant as usize]
    }

    /// Global-scope handle; valid for the runtime's life.
    #[inline]
    pub fn handle(&self, constant: CApiConstant) -> Handle {
        self.handles[constant as usize]
    }

    /// Reverse lookup for a built-in.
    pub fn constant_of(&self, obj: ObjRef) -> Option<CApiConstant> {
        let index = self.refs.iter().position(|&r| r == obj)?;
        CApiConstant::from_id(index as u32)
    }
}

pub(super) struct Boot {
    pub classes: CoreClasses,
    pub main: Value,
    pub no_memory: Value,
}

const UNSET: ObjRef = ObjRef(u32::MAX);

fn allocator_for(constant: CApiConstant) -> Option<Allocator> {
    use CApiConstant as C;
    match constant {
        C::Object => Some(Allocator::Instance(BodyKind::Plain)),
        C::String => Some(Allocator::Instance(BodyKind::String)),
        C::Array => Some(Allocator::Instance(BodyKind::Array)),
        C::Hash => Some(Allocator::Instance(BodyKind::Hash)),
        C::Exception => Some(Allocator::Instance(BodyKind::Exception)),
        C::Regexp => Some(Allocator::Instance(BodyKind::Regexp)),
        C::Module
        | C::Class
        | C::Numeric
        | C::Float
        | C::Symbol
        | C::NilClass
        | C::TrueClass
        | C::FalseClass
        | C::Match
        | C::Proc
        | C::Data => Some(Allocator::Undefined),
        _ => None,
    }
}

pub(super) fn bootstrap(
    heap: &mut Heap<Object>,
    handles: &mut HandleTable,
    symbols: &mut SymbolTable,
    roots: &mut RootSet,
) -> Result<Boot, InitError> {
    let mut refs = vec![UNSET; CApiConstant::COUNT];

    for def in BOOT_ORDER.iter() {
        let (kind, superclass) = match def.shape {
            ConstantShape::Module => (ModuleKind::Module, None),
            ConstantShape::Class(sup) => (ModuleKind::Class, sup.map(|s| refs[s as usize])),
        };
        let mut body = ModuleBody::new(kind, superclass);
        body.name = Some(def.name.to_string());
        body.allocator = allocator_for(def.constant);
        let meta = match kind {
            ModuleKind::Module => refs[CApiConstant::Module as usize],
            _ => refs[CApiConstant::Class as usize],
        };
        let obj = heap.alloc(Object::new(meta, ObjectBody::Module(Box::new(body))))?;
        heap.pin(obj);
        roots.add(Value::reference(obj));
        refs[def.constant as usize] = obj;
    }

    // Object and Module exist before Class does.
    let class = refs[CApiConstant::Class as usize];
    for &obj in &refs {
        if let Some(object) = heap.get_mut(obj) {
            if object.class == UNSET {
                object.class = class;
            }
        }
    }

    let object = refs[CApiConstant::Object as usize];
    let kernel = refs[CApiConstant::Kernel as usize];
    for def in BOOT_ORDER.iter().filter(|def| def.visible) {
        let name = symbols.intern(def.name);
        let value = Value::reference(refs[def.constant as usize]);
        if let Some(m) = heap.get_mut(object).and_then(Object::as_module_mut) {
            m.constants.insert(name, value);
        }
    }
    if let Some(m) = heap.get_mut(object).and_then(Object::as_module_mut) {
        m.includes.push(kernel);
    }

    let mut class_handles = Vec::with_capacity(refs.len());
    for &obj in &refs {
        class_handles.push(handles.acquire(obj)?);
    }

    let main = heap.alloc(Object::new(object, ObjectBody::Plain))?;
    heap.pin(main);
    roots.add(Value::reference(main));

    let message = heap.alloc(Object::new(
        refs[CApiConstant::String as usize],
        ObjectBody::String(StringBody::new(b"failed to allocate memory".to_vec())),
    ))?;
    let no_memory = heap.alloc(Object::new(
        refs[CApiConstant::NoMemoryError as usize],
        ObjectBody::Exception(ExceptionBody {
            message: Value::reference(message),
            backtrace: Value::NIL,
        }),
    ))?;
    heap.pin(no_memory);
    if let Some(obj) = heap.get_mut(no_memory) {
        obj.frozen = true;
    }
    roots.add(Value::reference(no_memory));

    Ok(Boot {
        classes: CoreClasses {
            refs,
            handles: class_handles,
        },
        main: Value::reference(main),
        no_memory: Value::reference(no_memory),
    })
}

// =============================================================================
// Core methods
// =============================================================================

fn def(
    rt: &mut Runtime,
    class: CApiConstant,
    name: &str,
    arity: i32,
    func: impl Fn(&mut Runtime, Value, &[Value]) -> CapiResult<Value> + Send + Sync + 'static,
) {
    let class = rt.core(class);
    let id = rt.intern(name);
    rt.add_method(class, id, MethodEntry::managed(arity, func));
}

fn def_private(
    rt: &mut Runtime,
    class: CApiConstant,
    name: &str,
    arity: i32,
    func: impl Fn(&mut Runtime, Value, &[Value]) -> CapiResult<Value> + Send + Sync + 'static,
) {
    let class = rt.core(class);
    let id = rt.intern(name);
    rt.add_method(
        class,
        id,
        MethodEntry::managed(arity, func).with_visibility(Visibility::Private),
    );
}

impl Runtime {
    pub(super) fn install_core_methods(&mut self) {
        install_kernel(self);
        install_module(self);
        install_immediates(self);
        install_numeric(self);
        install_string(self);
        install_array(self);
        install_hash(self);
        install_exception(self);
        install_misc(self);
    }
}

fn install_kernel(rt: &mut Runtime) {
    use CApiConstant::Kernel as K;

    def_private(rt, K, "initialize", -1, |_, _, _| Ok(Value::NIL));
    def(rt, K, "class", 0, |rt, recv, _| {
        Ok(Value::reference(rt.real_class(recv)))
    });
    def(rt, K, "==", 1, |_, recv, args| Ok(Value::bool(recv == args[0])));
    def(rt, K, "equal?", 1, |_, recv, args| Ok(Value::bool(recv == args[0])));
    def(rt, K, "eql?", 1, |_, recv, args| Ok(Value::bool(recv == args[0])));
    def(rt, K, "hash", 0, |rt, recv, _| rt.new_integer(recv.bits() as i64 >> 1));
    def(rt, K, "object_id", 0, |rt, recv, _| {
        rt.new_integer(recv.bits() as i64 >> 1)
    });
    def(rt, K, "to_s", 0, |rt, recv, _| {
        let text = rt.default_to_s(recv);
        rt.new_string(text)
    });
    def(rt, K, "inspect", 0, |rt, recv, _| {
        let id = rt.intern("to_s");
        rt.dispatch(recv, id, &[], None, super::CallStyle::FunctionCall)
    });
    def(rt, K, "nil?", 0, |_, _, _| Ok(Value::FALSE));
    def(rt, K, "freeze", 0, |rt, recv, _| {
        if let Some(obj) = rt.object_of_mut(recv) {
            obj.frozen = true;
        }
        Ok(recv)
    });
    def(rt, K, "frozen?", 0, |rt, recv, _| Ok(Value::bool(rt.is_frozen(recv))));
    def(rt, K, "respond_to?", -1, |rt, recv, args| {
        let Some(name) = args.first().and_then(|v| v.as_symbol()) else {
            return Err(rt.arg_error("respond_to? expects a symbol"));
        };
        let include_private = args.get(1).is_some_and(|v| v.test());
        Ok(Value::bool(rt.respond_to_value(recv, name, include_private)))
    });
    for name in ["kind_of?", "is_a?"] {
        def(rt, K, name, 1, |rt, recv, args| {
            let module = rt.expect_module(args[0])?;
            Ok(Value::bool(rt.is_kind_of(recv, module)))
        });
    }
    def(rt, K, "instance_of?", 1, |rt, recv, args| {
        let module = rt.expect_module(args[0])?;
        Ok(Value::bool(rt.real_class(recv) == module))
    });
    def(rt, K, "instance_variable_get", 1, |rt, recv, args| {
        let Some(name) = args[0].as_symbol() else {
            return Err(rt.type_error("instance variable name must be a symbol"));
        };
        Ok(rt.ivar_value(recv, name))
    });
    def(rt, K, "instance_variable_set", 2, |rt, recv, args| {
        let Some(name) = args[0].as_symbol() else {
            return Err(rt.type_error("instance variable name must be a symbol"));
        };
        rt.set_ivar_value(recv, name, args[1])?;
        Ok(args[1])
    });
    def(rt, K, "send", -1, |rt, recv, args| {
        let Some((name, rest)) = args.split_first() else {
            return Err(rt.arg_error("no method name given"));
        };
        let Some(id) = name.as_symbol() else {
            return Err(rt.type_error("method name must be a symbol"));
        };
        let block = rt.current_block();
        rt.dispatch(recv, id, rest, block, super::CallStyle::FunctionCall)
    });
    def_private(rt, K, "raise", -1, |rt, _, args| {
        let exc = rt.make_exception(args)?;
        Err(rt.raise_value(exc))
    });
    def_private(rt, K, "block_given?", 0, |rt, _, _| {
        // The frame for this call is on top; the block belongs to the caller.
        let caller = rt.frames.len().checked_sub(2);
        Ok(Value::bool(
            caller.is_some_and(|i| rt.frames[i].block.is_some()),
        ))
    });
}

fn install_module(rt: &mut Runtime) {
    use CApiConstant::{Class, Module as M};

    def(rt, M, "name", 0, |rt, recv, _| {
        let Some(obj) = recv.as_ref() else {
            return Ok(Value::NIL);
        };
        match rt.module(obj).name.clone() {
            Some(name) => rt.new_string(name),
            None => Ok(Value::NIL),
        }
    });
    def(rt, M, "to_s", 0, |rt, recv, _| {
        let module = rt.expect_module(recv)?;
        let name = rt.module_path(module);
        rt.new_string(name)
    });
    def(rt, M, "===", 1, |rt, recv, args| {
        let module = rt.expect_module(recv)?;
        Ok(Value::bool(rt.is_kind_of(args[0], module)))
    });
    def(rt, M, "include?", 1, |rt, recv, args| {
        let module = rt.expect_module(recv)?;
        let other = rt.expect_module(args[0])?;
        Ok(Value::bool(
            module != other && rt.ancestors(module).contains(&other),
        ))
    });
    def(rt, M, "ancestors", 0, |rt, recv, _| {
        let module = rt.expect_module(recv)?;
        let items = rt
            .ancestors(module)
            .into_iter()
            .filter(|&m| !rt.module(m).is_singleton())
            .map(Value::reference)
            .collect();
        rt.new_array(items)
    });
    def(rt, Class, "allocate", 0, |rt, recv, _| {
        let class = rt.expect_module(recv)?;
        rt.allocate_instance(class)
    });
    def(rt, Class, "new", -1, |rt, recv, args| {
        let class = rt.expect_module(recv)?;
        let block = rt.current_block();
        rt.new_instance(class, args, block)
    });
    def(rt, Class, "superclass", 0, |rt, recv, _| {
        let class = rt.expect_module(recv)?;
        let mut sup = rt.module(class).superclass;
        while let Some(s) = sup {
            if !rt.module(s).is_singleton() {
                break;
            }
            sup = rt.module(s).superclass;
        }
        Ok(sup.map_or(Value::NIL, Value::reference))
    });
}

fn install_immediates(rt: &mut Runtime) {
    use CApiConstant::{FalseClass, NilClass, Symbol, TrueClass};

    def(rt, NilClass, "to_s", 0, |rt, _, _| rt.new_string(""));
    def(rt, NilClass, "inspect", 0, |rt, _, _| rt.new_string("nil"));
    def(rt, NilClass, "nil?", 0, |_, _, _| Ok(Value::TRUE));
    def(rt, NilClass, "to_a", 0, |rt, _, _| rt.new_array(Vec::new()));
    def(rt, TrueClass, "to_s", 0, |rt, _, _| rt.new_string("true"));
    def(rt, FalseClass, "to_s", 0, |rt, _, _| rt.new_string("false"));
    def(rt, Symbol, "to_s", 0, |rt, recv, _| {
        let name = recv.as_symbol().map(|id| rt.symbol_name(id)).unwrap_or_default();
        rt.new_string(name)
    });
    def(rt, Symbol, "inspect", 0, |rt, recv, _| {
        let name = recv.as_symbol().map(|id| rt.symbol_name(id)).unwrap_or_default();
        rt.new_string(format!(":{name}"))
    });
    def(rt, Symbol, "to_sym", 0, |_, recv, _| Ok(recv));
}

fn install_numeric(rt: &mut Runtime) {
    use CApiConstant::{Float, Integer};

    fn binop(
        rt: &mut Runtime,
        recv: Value,
        arg: Value,
        op: fn(BigInt, BigInt) -> BigInt,
        float: fn(f64, f64) -> f64,
    ) -> CapiResult<Value> {
        if rt.is_float(arg) {
            let lhs = rt.num_to_f64(recv)?;
            let rhs = rt.num_to_f64(arg)?;
            return rt.new_float(float(lhs, rhs));
        }
        let lhs = rt.expect_integer(recv)?;
        let rhs = rt.expect_integer(arg)?;
        rt.new_bignum(op(lhs, rhs))
    }

    def(rt, Integer, "+", 1, |rt, recv, args| {
        binop(rt, recv, args[0], |a, b| a + b, |a, b| a + b)
    });
    def(rt, Integer, "-", 1, |rt, recv, args| {
        binop(rt, recv, args[0], |a, b| a - b, |a, b| a - b)
    });
    def(rt, Integer, "*", 1, |rt, recv, args| {
        binop(rt, recv, args[0], |a, b| a * b, |a, b| a * b)
    });
    def(rt, Integer, "==", 1, |rt, recv, args| {
        if rt.is_float(args[0]) {
            let lhs = rt.num_to_f64(recv)?;
            return Ok(Value::bool(lhs == rt.num_to_f64(args[0])?));
        }
        match rt.integer_of(args[0]) {
            Some(rhs) => Ok(Value::bool(rt.integer_of(recv) == Some(rhs))),
            None => Ok(Value::FALSE),
        }
    });
    def(rt, Integer, "<", 1, |rt, recv, args| {
        if rt.is_float(args[0]) {
            let lhs = rt.num_to_f64(recv)?;
            let rhs = rt.num_to_f64(args[0])?;
            return Ok(Value::bool(lhs < rhs));
        }
        let lhs = rt.expect_integer(recv)?;
        let rhs = rt.expect_integer(args[0])?;
        Ok(Value::bool(lhs < rhs))
    });
    def(rt, Integer, "hash", 0, |rt, recv, _| {
        let n = rt.expect_integer(recv)?;
        rt.new_bignum(n)
    });
    def(rt, Integer, "to_s", -1, |rt, recv, args| {
        let base = match args.first() {
            Some(&b) => rt.integer_value(b)?,
            None => 10,
        };
        rt.integer_to_s(recv, base)
    });
    def(rt, Integer, "inspect", 0, |rt, recv, _| rt.integer_to_s(recv, 10));
    def(rt, Integer, "to_i", 0, |_, recv, _| Ok(recv));
    def(rt, Float, "to_s", 0, |rt, recv, _| {
        let f = rt.num_to_f64(recv)?;
        rt.new_string(format_float(f))
    });
    def(rt, Float, "+", 1, |rt, recv, args| {
        let lhs = rt.num_to_f64(recv)?;
        let rhs = rt.num_to_f64(args[0])?;
        rt.new_float(lhs + rhs)
    });
    def(rt, Float, "==", 1, |rt, recv, args| {
        if !rt.is_numeric(args[0]) {
            return Ok(Value::FALSE);
        }
        let lhs = rt.num_to_f64(recv)?;
        let rhs = rt.num_to_f64(args[0])?;
        Ok(Value::bool(lhs == rhs))
    });
}

/// `1.0`, `-2.5`, `Infinity`, `NaN`.
pub(crate) fn format_float(f: f64) -> String {
    if f.is_nan() {
        "NaN".to_string()
    } else if f.is_infinite() {
        let text = if f > 0.0 { "Infinity" } else { "-Infinity" };
        text.to_string()
    } else if f.fract() == 0.0 && f.abs() < 1e16 {
        format!("{f:.1}")
    } else {
        format!("{f}")
    }
}

fn install_string(rt: &mut Runtime) {
    use CApiConstant::String as S;

    for name in ["length", "size"] {
        def(rt, S, name, 0, |rt, recv, _| {
            let len = rt.string_bytes(recv).map_or(0, <[u8]>::len);
            rt.new_integer(len as i64)
        });
    }
    for name in ["to_s", "to_str"] {
        def(rt, S, name, 0, |_, recv, _| Ok(recv));
    }
    def(rt, S, "==", 1, |rt, recv, args| {
        Ok(Value::bool(
            rt.string_bytes(args[0]).is_some() && rt.string_bytes(recv) == rt.string_bytes(args[0]),
        ))
    });
    def(rt, S, "eql?", 1, |rt, recv, args| {
        Ok(Value::bool(
            rt.string_bytes(args[0]).is_some() && rt.string_bytes(recv) == rt.string_bytes(args[0]),
        ))
    });
    def(rt, S, "hash", 0, |rt, recv, _| {
        use std::hash::{Hash, Hasher};
        let mut hasher = rustc_hash::FxHasher::default();
        rt.string_bytes(recv).hash(&mut hasher);
        rt.new_integer((hasher.finish() >> 2) as i64)
    });
    def(rt, S, "+", 1, |rt, recv, args| {
        let other = rt.expect_string_bytes(args[0])?.to_vec();
        let mut bytes = rt.expect_string_bytes(recv)?.to_vec();
        bytes.extend_from_slice(&other);
        rt.new_string(bytes)
    });
    def(rt, S, "<<", 1, |rt, recv, args| {
        let other = rt.expect_string_bytes(args[0])?.to_vec();
        rt.string_append_value(recv, &other)?;
        Ok(recv)
    });
    def(rt, S, "inspect", 0, |rt, recv, _| {
        let text = String::from_utf8_lossy(rt.expect_string_bytes(recv)?).into_owned();
        rt.new_string(format!("{text:?}"))
    });
    def(rt, S, "to_sym", 0, |rt, recv, _| {
        let text = String::from_utf8_lossy(rt.expect_string_bytes(recv)?).into_owned();
        Ok(Value::symbol(rt.intern(&text)))
    });
}

fn install_array(rt: &mut Runtime) {
    use CApiConstant::Array as A;

    for name in ["length", "size"] {
        def(rt, A, name, 0, |rt, recv, _| {
            let len = rt.array_items(recv).map_or(0, <[Value]>::len);
            rt.new_integer(len as i64)
        });
    }
    def(rt, A, "[]", 1, |rt, recv, args| {
        let index = rt.integer_value(args[0])?;
        Ok(rt.array_entry(recv, index))
    });
    def(rt, A, "[]=", 2, |rt, recv, args| {
        let index = rt.integer_value(args[0])?;
        rt.array_store(recv, index, args[1])?;
        Ok(args[1])
    });
    for name in ["<<", "push"] {
        def(rt, A, name, 1, |rt, recv, args| {
            rt.array_push(recv, args[0])?;
            Ok(recv)
        });
    }
    def(rt, A, "pop", 0, |rt, recv, _| rt.array_pop(recv));
    def(rt, A, "to_a", 0, |_, recv, _| Ok(recv));
    def(rt, A, "each", 0, |rt, recv, _| {
        let mut i = 0;
        loop {
            let Some(item) = rt.array_items(recv).and_then(|items| items.get(i).copied()) else {
                break;
            };
            rt.yield_value(&[item])?;
            i += 1;
        }
        Ok(recv)
    });
    def(rt, A, "inspect", 0, |rt, recv, _| {
        let items = rt.array_items(recv).map(<[Value]>::to_vec).unwrap_or_default();
        let mut parts = Vec::with_capacity(items.len());
        for item in items {
            parts.push(rt.inspect_string(item)?);
        }
        rt.new_string(format!("[{}]", parts.join(", ")))
    });
    def(rt, A, "join", -1, |rt, recv, args| {
        let sep = match args.first() {
            Some(&sep) => rt.expect_string_bytes(sep)?.to_vec(),
            None => Vec::new(),
        };
        let bytes = rt.join_bytes(recv, &sep)?;
        rt.new_string(bytes)
    });
}

fn install_hash(rt: &mut Runtime) {
    use CApiConstant::Hash as H;

    def(rt, H, "[]", 1, |rt, recv, args| rt.hash_get(recv, args[0]));
    def(rt, H, "[]=", 2, |rt, recv, args| {
        rt.hash_set(recv, args[0], args[1])?;
        Ok(args[1])
    });
    for name in ["size", "length"] {
        def(rt, H, name, 0, |rt, recv, _| {
            let len = rt.object_of(recv).and_then(Object::as_hash).map_or(0, |h| h.len());
            rt.new_integer(len as i64)
        });
    }
    def(rt, H, "key?", 1, |rt, recv, args| {
        let key = rt.hash_key(args[0]);
        let found = rt
            .object_of(recv)
            .and_then(Object::as_hash)
            .is_some_and(|h| h.get(&key).is_some());
        Ok(Value::bool(found))
    });
    def(rt, H, "delete", 1, |rt, recv, args| rt.hash_remove(recv, args[0]));
}

fn install_exception(rt: &mut Runtime) {
    use CApiConstant::Exception as E;

    def_private(rt, E, "initialize", -1, |rt, recv, args| {
        let message = args.first().copied().unwrap_or(Value::NIL);
        if let Some(ObjectBody::Exception(body)) = rt.object_of_mut(recv).map(|o| &mut o.body) {
            body.message = message;
        }
        Ok(Value::NIL)
    });
    for name in ["message", "to_s"] {
        def(rt, E, name, 0, |rt, recv, _| {
            let message = match rt.object_of(recv).map(|o| &o.body) {
                Some(ObjectBody::Exception(body)) => body.message,
                _ => Value::NIL,
            };
            if message.is_nil() {
                let name = rt.class_name_of(recv);
                return rt.new_string(name);
            }
            Ok(message)
        });
    }
    def(rt, E, "backtrace", 0, |rt, recv, _| match rt.object_of(recv).map(|o| &o.body) {
        Some(ObjectBody::Exception(body)) => Ok(body.backtrace),
        _ => Ok(Value::NIL),
    });
    def(rt, E, "inspect", 0, |rt, recv, _| {
        let class = rt.class_name_of(recv);
        let message = rt.exception_message(recv);
        rt.new_string(format!("#<{class}: {message}>"))
    });
}

fn install_misc(rt: &mut Runtime) {
    use CApiConstant::{Proc, Range};

    def(rt, Proc, "call", -1, |rt, recv, args| rt.call_proc(recv, args));
    def(rt, Proc, "arity", 0, |rt, recv, _| {
        let arity = match rt.object_of(recv).map(|o| &o.body) {
            Some(ObjectBody::Proc(p)) => p.arity,
            _ => -1,
        };
        rt.new_integer(arity as i64)
    });
    for name in ["first", "begin"] {
        def(rt, Range, name, 0, |rt, recv, _| match rt.object_of(recv).map(|o| &o.body) {
            Some(ObjectBody::Range(r)) => Ok(r.begin),
            _ => Ok(Value::NIL),
        });
    }
    for name in ["last", "end"] {
        def(rt, Range, name, 0, |rt, recv, _| match rt.object_of(recv).map(|o| &o.body) {
            Some(ObjectBody::Range(r)) => Ok(r.end),
            _ => Ok(Value::NIL),
        });
    }
    def(rt, Range, "exclude_end?", 0, |rt, recv, _| {
        match rt.object_of(recv).map(|o| &o.body) {
            Some(ObjectBody::Range(r)) => Ok(Value::bool(r.exclusive)),
            _ => Ok(Value::FALSE),
        }
    });
}

// =============================================================================
// Instantiation
// =============================================================================

impl Runtime {
    /// Allocator in effect for `class`, walking superclasses.
    pub(crate) fn allocator_of(&self, class: ObjRef) -> Allocator {
        let mut current = Some(class);
        while let Some(c) = current {
            let module = self.module(c);
            if let Some(allocator) = module.allocator {
                return allocator;
            }
            current = module.superclass;
        }
        Allocator::Instance(BodyKind::Plain)
    }

    /// Fresh, uninitialized instance of `class`.
    pub(crate) fn allocate_instance(&mut self, class: ObjRef) -> CapiResult<Value> {
        if !self.module(class).is_class() {
            let name = self.module_path(class);
            return Err(self.type_error(format!("can't instantiate module {name}")));
        }
        match self.allocator_of(class) {
            Allocator::Instance(kind) => self.alloc(class, kind.empty()),
            Allocator::Native(func) => {
                let class_handle = self.handle_for(Value::reference(class));
                let result = func(self, class_handle)?;
                Ok(self.value_of(result))
            }
            Allocator::Undefined => {
                let name = self.module_path(class);
                Err(self.type_error(format!("allocator undefined for {name}")))
            }
        }
    }

    /// Allocate and send `initialize`.
    pub(crate) fn new_instance(
        &mut self,
        class: ObjRef,
        args: &[Value],
        block: Option<Value>,
    ) -> CapiResult<Value> {
        let obj = self.allocate_instance(class)?;
        let init = self.intern("initialize");
        self.call_into_managed(obj, init, args, block, super::CallStyle::FunctionCall)?;
        Ok(obj)
    }
}
