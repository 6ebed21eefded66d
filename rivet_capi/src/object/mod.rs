//! Heap object layout.
//!
//! Every reference names an [`Object`]: a class pointer, instance
//! variables, a frozen flag and a typed body.
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │ Object                                        │
//! │   class ──────────► Module body (class)       │
//! │   ivars  [(SymbolId, Value)]                  │
//! │   frozen                                      │
//! │   body   String | Array | Hash | Float | ...  │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! Singleton classes are spliced in through `class`: an object with a
//! singleton class points at it, and the singleton's superclass is the
//! object's real class.

pub mod array;
pub mod data;
pub mod hash;
pub mod module;
pub mod string;

pub use array::ArrayBody;
pub use data::{DataBody, DataFreeFn};
pub use hash::{HashBody, HashKey};
pub use module::{Allocator, ModuleBody, ModuleKind, NativeAllocFn};
pub use string::StringBody;

use crate::builtins::regexp::{MatchBody, RegexpBody};
use crate::method::ManagedFn;
use num_bigint::BigInt;
use rivet_core::{ObjRef, SymbolId, Value};
use rivet_gc::{Forwarding, Trace, Tracer};
use std::fmt;

/// Shape of a freshly allocated instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyKind {
    Plain,
    String,
    Array,
    Hash,
    Exception,
    Data,
    Regexp,
}

impl BodyKind {
    /// Empty body of this kind.
    pub fn empty(self) -> ObjectBody {
        match self {
            BodyKind::Plain => ObjectBody::Plain,
            BodyKind::String => ObjectBody::String(StringBody::default()),
            BodyKind::Array => ObjectBody::Array(ArrayBody::default()),
            BodyKind::Hash => ObjectBody::Hash(HashBody::default()),
            BodyKind::Exception => ObjectBody::Exception(ExceptionBody::default()),
            BodyKind::Data => ObjectBody::Data(DataBody::default()),
            BodyKind::Regexp => ObjectBody::Regexp(Box::default()),
        }
    }
}

/// Exception payload.
#[derive(Debug, Clone, Copy)]
pub struct ExceptionBody {
    /// Message String or nil.
    pub message: Value,
    /// Array of Strings or nil.
    pub backtrace: Value,
}

impl Default for ExceptionBody {
    fn default() -> Self {
        Self {
            message: Value::NIL,
            backtrace: Value::NIL,
        }
    }
}

/// Closure object.
#[derive(Clone)]
pub struct ProcBody {
    pub func: ManagedFn,
    pub arity: i32,
}

impl fmt::Debug for ProcBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ProcBody(arity {})", self.arity)
    }
}

/// Range payload.
#[derive(Debug, Clone, Copy)]
pub struct RangeBody {
    pub begin: Value,
    pub end: Value,
    pub exclusive: bool,
}

/// Typed object payload.
#[derive(Debug)]
pub enum ObjectBody {
    Plain,
    String(StringBody),
    Array(ArrayBody),
    Hash(HashBody),
    Float(f64),
    Bignum(BigInt),
    Module(Box<ModuleBody>),
    Exception(ExceptionBody),
    Regexp(Box<RegexpBody>),
    MatchData(Box<MatchBody>),
    Data(DataBody),
    Proc(ProcBody),
    Range(RangeBody),
}

impl ObjectBody {
    /// Body kind name for diagnostics.
    pub fn kind_name(&self) -> &'static str {
        match self {
            ObjectBody::Plain => "object",
            ObjectBody::String(_) => "string",
            ObjectBody::Array(_) => "array",
            ObjectBody::Hash(_) => "hash",
            ObjectBody::Float(_) => "float",
            ObjectBody::Bignum(_) => "bignum",
            ObjectBody::Module(_) => "module",
            ObjectBody::Exception(_) => "exception",
            ObjectBody::Regexp(_) => "regexp",
            ObjectBody::MatchData(_) => "match",
            ObjectBody::Data(_) => "data",
            ObjectBody::Proc(_) => "proc",
            ObjectBody::Range(_) => "range",
        }
    }
}

/// A heap object.
#[derive(Debug)]
pub struct Object {
    pub class: ObjRef,
    pub ivars: Vec<(SymbolId, Value)>,
    pub frozen: bool,
    pub body: ObjectBody,
}

impl Object {
    /// New unfrozen object.
    pub fn new(class: ObjRef, body: ObjectBody) -> Self {
        Self {
            class,
            ivars: Vec::new(),
            frozen: false,
            body,
        }
    }

    /// Instance variable, if set.
    pub fn ivar(&self, name: SymbolId) -> Option<Value> {
        self.ivars
            .iter()
            .find_map(|&(id, v)| (id == name).then_some(v))
    }

    /// Set an instance variable, keeping first-assignment order.
    pub fn set_ivar(&mut self, name: SymbolId, value: Value) {
        match self.ivars.iter_mut().find(|(id, _)| *id == name) {
            Some(slot) => slot.1 = value,
            None => self.ivars.push((name, value)),
        }
    }

    #[inline]
    pub fn as_module(&self) -> Option<&ModuleBody> {
        match &self.body {
            ObjectBody::Module(m) => Some(m),
            _ => None,
        }
    }

    #[inline]
    pub fn as_module_mut(&mut self) -> Option<&mut ModuleBody> {
        match &mut self.body {
            ObjectBody::Module(m) => Some(m),
            _ => None,
        }
    }

    #[inline]
    pub fn as_string(&self) -> Option<&StringBody> {
        match &self.body {
            ObjectBody::String(s) => Some(s),
            _ => None,
        }
    }

    #[inline]
    pub fn as_string_mut(&mut self) -> Option<&mut StringBody> {
        match &mut self.body {
            ObjectBody::String(s) => Some(s),
            _ => None,
        }
    }

    #[inline]
    pub fn as_array(&self) -> Option<&ArrayBody> {
        match &self.body {
            ObjectBody::Array(a) => Some(a),
            _ => None,
        }
    }

    #[inline]
    pub fn as_array_mut(&mut self) -> Option<&mut ArrayBody> {
        match &mut self.body {
            ObjectBody::Array(a) => Some(a),
            _ => None,
        }
    }

    #[inline]
    pub fn as_hash(&self) -> Option<&HashBody> {
        match &self.body {
            ObjectBody::Hash(h) => Some(h),
            _ => None,
        }
    }

    #[inline]
    pub fn as_hash_mut(&mut self) -> Option<&mut HashBody> {
        match &mut self.body {
            ObjectBody::Hash(h) => Some(h),
            _ => None,
        }
    }
}

impl Trace for Object {
    fn trace(&self, tracer: &mut dyn Tracer) {
        tracer.trace_ref(self.class);
        for (_, value) in &self.ivars {
            tracer.trace_value(*value);
        }
        match &self.body {
            ObjectBody::Plain
            | ObjectBody::String(_)
            | ObjectBody::Float(_)
            | ObjectBody::Bignum(_)
            | ObjectBody::Proc(_) => {}
            ObjectBody::Regexp(r) => {
                tracer.trace_value(r.source);
                tracer.trace_value(r.names);
            }
            ObjectBody::Array(a) => {
                for v in a.items() {
                    tracer.trace_value(*v);
                }
            }
            ObjectBody::Hash(h) => {
                for v in h.values() {
                    tracer.trace_value(v);
                }
            }
            ObjectBody::Module(m) => m.trace(tracer),
            ObjectBody::Exception(e) => {
                tracer.trace_value(e.message);
                tracer.trace_value(e.backtrace);
            }
            ObjectBody::MatchData(m) => {
                tracer.trace_value(m.source);
                tracer.trace_value(m.regexp);
            }
            ObjectBody::Data(d) => {
                for v in &d.retained {
                    tracer.trace_value(*v);
                }
            }
            ObjectBody::Range(r) => {
                tracer.trace_value(r.begin);
                tracer.trace_value(r.end);
            }
        }
    }

    fn relocate(&mut self, fwd: &Forwarding) {
        self.class = fwd.forward(self.class);
        for (_, value) in self.ivars.iter_mut() {
            fwd.update(value);
        }
        match &mut self.body {
            ObjectBody::Plain
            | ObjectBody::String(_)
            | ObjectBody::Float(_)
            | ObjectBody::Bignum(_)
            | ObjectBody::Proc(_) => {}
            ObjectBody::Regexp(r) => {
                fwd.update(&mut r.source);
                fwd.update(&mut r.names);
            }
            ObjectBody::Array(a) => {
                for v in a.items_mut() {
                    fwd.update(v);
                }
            }
            ObjectBody::Hash(h) => h.relocate(fwd),
            ObjectBody::Module(m) => m.relocate(fwd),
            ObjectBody::Exception(e) => {
                fwd.update(&mut e.message);
                fwd.update(&mut e.backtrace);
            }
            ObjectBody::MatchData(m) => {
                fwd.update(&mut m.source);
                fwd.update(&mut m.regexp);
            }
            ObjectBody::Data(d) => {
                for v in d.retained.iter_mut() {
                    fwd.update(v);
                }
            }
            ObjectBody::Range(r) => {
                fwd.update(&mut r.begin);
                fwd.update(&mut r.end);
            }
        }
    }

    fn finalize(&mut self) {
        if let ObjectBody::Data(d) = &mut self.body {
            d.release();
        }
    }

    fn size_of(&self) -> usize {
        let body = match &self.body {
            ObjectBody::String(s) => s.len(),
            ObjectBody::Array(a) => a.len() * std::mem::size_of::<Value>(),
            ObjectBody::Hash(h) => h.len() * 3 * std::mem::size_of::<Value>(),
            ObjectBody::Module(m) => {
                std::mem::size_of::<ModuleBody>() + m.methods.len() * 48 + m.constants.len() * 16
            }
            _ => 0,
        };
        std::mem::size_of::<Self>() + self.ivars.len() * 16 + body
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rivet_gc::CollectingTracer;

    #[test]
    fn test_ivar_order_and_overwrite() {
        let mut obj = Object::new(ObjRef(0), ObjectBody::Plain);
        obj.set_ivar(SymbolId(2), Value::TRUE);
        obj.set_ivar(SymbolId(1), Value::NIL);
        obj.set_ivar(SymbolId(2), Value::FALSE);
        assert_eq!(obj.ivar(SymbolId(2)), Some(Value::FALSE));
        assert_eq!(obj.ivars[0].0, SymbolId(2));
        assert_eq!(obj.ivar(SymbolId(9)), None);
    }

    #[test]
    fn test_trace_reports_class_ivars_and_elements() {
        let mut obj = Object::new(
            ObjRef(1),
            ObjectBody::Array(ArrayBody::new(vec![
                Value::reference(ObjRef(5)),
                Value::fixnum_unchecked(3),
            ])),
        );
        obj.set_ivar(SymbolId(0), Value::reference(ObjRef(7)));
        let mut tracer = CollectingTracer::new();
        obj.trace(&mut tracer);
        assert_eq!(tracer.refs, vec![ObjRef(1), ObjRef(7), ObjRef(5)]);
    }

    #[test]
    fn test_relocate_rewrites_class_and_range() {
        let mut obj = Object::new(
            ObjRef(4),
            ObjectBody::Range(RangeBody {
                begin: Value::reference(ObjRef(4)),
                end: Value::NIL,
                exclusive: false,
            }),
        );
        let mut fwd = Forwarding::new();
        fwd.insert(ObjRef(4), ObjRef(0));
        obj.relocate(&fwd);
        assert_eq!(obj.class, ObjRef(0));
        match obj.body {
            ObjectBody::Range(r) => assert_eq!(r.begin, Value::reference(ObjRef(0))),
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_empty_bodies() {
        assert!(matches!(BodyKind::String.empty(), ObjectBody::String(_)));
        assert!(matches!(BodyKind::Regexp.empty(), ObjectBody::Regexp(_)));
        assert_eq!(BodyKind::Hash.empty().kind_name(), "hash");
    }
}
