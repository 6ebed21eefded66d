//! Class and module storage.

use crate::error::CapiResult;
use crate::method::MethodEntry;
use crate::object::BodyKind;
use crate::runtime::Runtime;
use rivet_core::{ObjRef, SymbolId, Value};
use rivet_gc::{Forwarding, Handle, Tracer};
use rustc_hash::FxHashMap;

/// Native allocator registered with `define_alloc_func`.
pub type NativeAllocFn = fn(&mut Runtime, Handle) -> CapiResult<Handle>;

/// How instances of a class come into existence.
#[derive(Debug, Clone, Copy)]
pub enum Allocator {
    /// Fresh object with an empty body of this kind.
    Instance(BodyKind),
    /// Registered native allocator.
    Native(NativeAllocFn),
    /// `allocate` raises `TypeError`.
    Undefined,
}

/// Module, class or singleton class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleKind {
    Module,
    Class,
    Singleton,
}

/// Body shared by modules and classes.
#[derive(Debug)]
pub struct ModuleBody {
    /// Fully qualified name, once assigned to a constant.
    pub name: Option<String>,
    pub kind: ModuleKind,
    pub superclass: Option<ObjRef>,
    pub methods: FxHashMap<SymbolId, MethodEntry>,
    pub constants: FxHashMap<SymbolId, Value>,
    /// Included modules, most recent last.
    pub includes: Vec<ObjRef>,
    /// The object a singleton class belongs to.
    pub attached: Option<Value>,
    /// Lexical parent for nested naming.
    pub parent: Option<ObjRef>,
    /// `None` inherits the superclass allocator.
    pub allocator: Option<Allocator>,
}

impl ModuleBody {
    /// An anonymous module or class.
    pub fn new(kind: ModuleKind, superclass: Option<ObjRef>) -> Self {
        Self {
            name: None,
            kind,
            superclass,
            methods: FxHashMap::default(),
            constants: FxHashMap::default(),
            includes: Vec::new(),
            attached: None,
            parent: None,
            allocator: None,
        }
    }

    #[inline]
    pub fn is_class(&self) -> bool {
        !matches!(self.kind, ModuleKind::Module)
    }

    #[inline]
    pub fn is_singleton(&self) -> bool {
        matches!(self.kind, ModuleKind::Singleton)
    }

    pub(crate) fn trace(&self, tracer: &mut dyn Tracer) {
        if let Some(sup) = self.superclass {
            tracer.trace_ref(sup);
        }
        for value in self.constants.values() {
            tracer.trace_value(*value);
        }
        for module in &self.includes {
            tracer.trace_ref(*module);
        }
        if let Some(attached) = self.attached {
            tracer.trace_value(attached);
        }
        if let Some(parent) = self.parent {
            tracer.trace_ref(parent);
        }
    }

    pub(crate) fn relocate(&mut self, fwd: &Forwarding) {
        if let Some(sup) = self.superclass.as_mut() {
            *sup = fwd.forward(*sup);
        }
        for value in self.constants.values_mut() {
            fwd.update(value);
        }
        for module in self.includes.iter_mut() {
            *module = fwd.forward(*module);
        }
        if let Some(attached) = self.attached.as_mut() {
            fwd.update(attached);
        }
        if let Some(parent) = self.parent.as_mut() {
            *parent = fwd.forward(*parent);
        }
    }
}
