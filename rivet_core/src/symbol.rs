//! Symbol interning.
//!
//! Method names, instance variable names and constant names all cross the
//! native boundary as symbols (`ID` in the C API). The table hands out dense
//! ids so a symbol encodes as an immediate [`Value`](crate::Value).

use rustc_hash::FxHashMap;
use std::sync::Arc;

/// Interned symbol id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SymbolId(pub u32);

/// Lexical category of a symbol name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolKind {
    /// `@name`
    InstanceVariable,
    /// `@@name`
    ClassVariable,
    /// `$name`
    Global,
    /// `Name`
    Constant,
    /// Anything else (method names, operators).
    Local,
}

impl SymbolKind {
    /// Classify a symbol name.
    pub fn of(name: &str) -> Self {
        let bytes = name.as_bytes();
        match bytes {
            [b'@', b'@', ..] => SymbolKind::ClassVariable,
            [b'@', ..] => SymbolKind::InstanceVariable,
            [b'$', ..] => SymbolKind::Global,
            [first, ..] if first.is_ascii_uppercase() => SymbolKind::Constant,
            _ => SymbolKind::Local,
        }
    }
}

/// Bidirectional name ⇄ id table.
#[derive(Debug, Default)]
pub struct SymbolTable {
    names: Vec<Arc<str>>,
    index: FxHashMap<Arc<str>, SymbolId>,
}

impl SymbolTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern `name`, returning its id. Repeated calls return the same id.
    pub fn intern(&mut self, name: &str) -> SymbolId {
        if let Some(&id) = self.index.get(name) {
            return id;
        }
        let id = SymbolId(self.names.len() as u32);
        let name: Arc<str> = Arc::from(name);
        self.names.push(name.clone());
        self.index.insert(name, id);
        id
    }

    /// Look up an already interned name.
    #[inline]
    pub fn lookup(&self, name: &str) -> Option<SymbolId> {
        self.index.get(name).copied()
    }

    /// Name of an interned symbol.
    #[inline]
    pub fn name(&self, id: SymbolId) -> Option<&str> {
        self.names.get(id.0 as usize).map(|s| &**s)
    }

    /// Shared name of an interned symbol.
    #[inline]
    pub fn name_arc(&self, id: SymbolId) -> Option<Arc<str>> {
        self.names.get(id.0 as usize).cloned()
    }

    /// Number of interned symbols.
    #[inline]
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// True when nothing has been interned.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}
