//! Stable numeric ids for built-in classes, modules and exceptions.
//!
//! Extensions never see class layout; they ask for a constant by id and
//! get back a handle that stays valid for the life of the runtime.

use crate::error::CapiResult;
use crate::object::ObjectBody;
use crate::runtime::Runtime;
use rivet_core::{ObjRef, Value};
use rivet_gc::Handle;

/// Built-in class, module and exception ids.
///
/// The discriminants are part of the extension ABI; new entries go at
/// the end of their group.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CApiConstant {
    Array = 0,
    Bignum,
    Class,
    Comparable,
    Data,
    Enumerable,
    FalseClass,
    File,
    Fixnum,
    Float,
    Hash,
    Integer,
    IO,
    Kernel,
    Match,
    Module,
    NilClass,
    Numeric,
    Object,
    Range,
    Regexp,
    Rivet,
    String,
    Struct,
    Symbol,
    Thread,
    Time,
    TrueClass,
    Proc,

    ArgumentError,
    EOFError,
    Errno,
    Exception,
    Fatal,
    FloatDomainError,
    IndexError,
    Interrupt,
    IOError,
    LoadError,
    LocalJumpError,
    NameError,
    NoMemoryError,
    NoMethodError,
    NotImplementedError,
    RangeError,
    RegexpError,
    RuntimeError,
    ScriptError,
    SecurityError,
    SignalException,
    StandardError,
    SyntaxError,
    SystemCallError,
    SystemExit,
    SystemStackError,
    TypeError,
    ThreadError,
    ZeroDivisionError,
}

impl CApiConstant {
    /// Number of constants.
    pub const COUNT: usize = CApiConstant::ZeroDivisionError as usize + 1;

    /// Constant for a raw id.
    pub fn from_id(id: u32) -> Option<Self> {
        BOOT_ORDER
            .iter()
            .find(|def| def.constant as u32 == id)
            .map(|def| def.constant)
    }

    #[inline]
    pub fn id(self) -> u32 {
        self as u32
    }

    /// Name as bound in `Object`.
    pub fn name(self) -> &'static str {
        self.def().name
    }

    pub(crate) fn def(self) -> &'static ConstantDef {
        // BOOT_ORDER covers every variant; checked by tests.
        BOOT_ORDER
            .iter()
            .find(|def| def.constant == self)
            .unwrap_or(&BOOT_ORDER[0])
    }
}

/// How a built-in is created during bootstrap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConstantShape {
    Module,
    Class(Option<CApiConstant>),
}

#[derive(Debug)]
pub(crate) struct ConstantDef {
    pub constant: CApiConstant,
    pub name: &'static str,
    pub shape: ConstantShape,
    /// Bound as a constant of `Object`.
    pub visible: bool,
}

const fn class(constant: CApiConstant, name: &'static str, sup: CApiConstant) -> ConstantDef {
    ConstantDef {
        constant,
        name,
        shape: ConstantShape::Class(Some(sup)),
        visible: true,
    }
}

const fn module(constant: CApiConstant, name: &'static str) -> ConstantDef {
    ConstantDef {
        constant,
        name,
        shape: ConstantShape::Module,
        visible: true,
    }
}

use CApiConstant as C;

/// Creation order: every superclass precedes its subclasses.
/// `Object`, `Module` and `Class` are wired by hand first.
pub(crate) static BOOT_ORDER: [ConstantDef; CApiConstant::COUNT] = [
    ConstantDef {
        constant: C::Object,
        name: "Object",
        shape: ConstantShape::Class(None),
        visible: true,
    },
    class(C::Module, "Module", C::Object),
    class(C::Class, "Class", C::Module),
    module(C::Kernel, "Kernel"),
    module(C::Comparable, "Comparable"),
    module(C::Enumerable, "Enumerable"),
    module(C::Errno, "Errno"),
    module(C::Rivet, "Rivet"),
    class(C::String, "String", C::Object),
    class(C::Array, "Array", C::Object),
    class(C::Hash, "Hash", C::Object),
    class(C::Numeric, "Numeric", C::Object),
    class(C::Integer, "Integer", C::Numeric),
    class(C::Fixnum, "Fixnum", C::Integer),
    class(C::Bignum, "Bignum", C::Integer),
    class(C::Float, "Float", C::Numeric),
    class(C::NilClass, "NilClass", C::Object),
    class(C::TrueClass, "TrueClass", C::Object),
    class(C::FalseClass, "FalseClass", C::Object),
    class(C::Symbol, "Symbol", C::Object),
    class(C::Regexp, "Regexp", C::Object),
    class(C::Match, "MatchData", C::Object),
    class(C::Range, "Range", C::Object),
    class(C::Proc, "Proc", C::Object),
    class(C::Data, "Data", C::Object),
    class(C::IO, "IO", C::Object),
    class(C::File, "File", C::IO),
    class(C::Struct, "Struct", C::Object),
    class(C::Thread, "Thread", C::Object),
    class(C::Time, "Time", C::Object),
    class(C::Exception, "Exception", C::Object),
    class(C::NoMemoryError, "NoMemoryError", C::Exception),
    class(C::ScriptError, "ScriptError", C::Exception),
    class(C::LoadError, "LoadError", C::ScriptError),
    class(C::NotImplementedError, "NotImplementedError", C::ScriptError),
    class(C::SyntaxError, "SyntaxError", C::ScriptError),
    class(C::SignalException, "SignalException", C::Exception),
    class(C::Interrupt, "Interrupt", C::SignalException),
    class(C::StandardError, "StandardError", C::Exception),
    class(C::ArgumentError, "ArgumentError", C::StandardError),
    class(C::IOError, "IOError", C::StandardError),
    class(C::EOFError, "EOFError", C::IOError),
    class(C::IndexError, "IndexError", C::StandardError),
    class(C::LocalJumpError, "LocalJumpError", C::StandardError),
    class(C::NameError, "NameError", C::StandardError),
    class(C::NoMethodError, "NoMethodError", C::NameError),
    class(C::RangeError, "RangeError", C::StandardError),
    class(C::FloatDomainError, "FloatDomainError", C::RangeError),
    class(C::RegexpError, "RegexpError", C::StandardError),
    class(C::RuntimeError, "RuntimeError", C::StandardError),
    class(C::SecurityError, "SecurityError", C::StandardError),
    class(C::SystemCallError, "SystemCallError", C::StandardError),
    class(C::ThreadError, "ThreadError", C::StandardError),
    class(C::TypeError, "TypeError", C::StandardError),
    class(C::ZeroDivisionError, "ZeroDivisionError", C::StandardError),
    class(C::SystemExit, "SystemExit", C::Exception),
    class(C::SystemStackError, "SystemStackError", C::Exception),
    ConstantDef {
        constant: C::Fatal,
        name: "fatal",
        shape: ConstantShape::Class(Some(C::Exception)),
        visible: false,
    },
];

/// Type tags reported by [`Runtime::type_of`].
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CApiType {
    Array,
    None,
    Nil,
    Object,
    Class,
    IClass,
    Module,
    Float,
    String,
    Regexp,
    Fixnum,
    Hash,
    Struct,
    Bignum,
    File,
    True,
    False,
    Data,
    Match,
    Symbol,
    BlkTag,
    Undef,
}

impl CApiType {
    fn describe(self) -> &'static str {
        match self {
            CApiType::Array => "Array",
            CApiType::Nil => "nil",
            CApiType::Class => "Class",
            CApiType::Module => "Module",
            CApiType::Float => "Float",
            CApiType::String => "String",
            CApiType::Regexp => "Regexp",
            CApiType::Fixnum => "Fixnum",
            CApiType::Hash => "Hash",
            CApiType::Struct => "Struct",
            CApiType::Bignum => "Bignum",
            CApiType::File => "File",
            CApiType::True => "true",
            CApiType::False => "false",
            CApiType::Data => "Data",
            CApiType::Match => "MatchData",
            CApiType::Symbol => "Symbol",
            CApiType::Undef => "undef",
            _ => "Object",
        }
    }
}

impl Runtime {
    /// Handle for a built-in class, module or exception.
    #[inline]
    pub fn get_constant(&self, constant: CApiConstant) -> Handle {
        self.classes.handle(constant)
    }

    /// Handle for a raw constant id, as passed through the C ABI.
    pub fn get_constant_id(&self, id: u32) -> Option<Handle> {
        CApiConstant::from_id(id).map(|c| self.get_constant(c))
    }

    #[inline]
    pub(crate) fn core(&self, constant: CApiConstant) -> ObjRef {
        self.classes.get(constant)
    }

    /// Type tag of the object behind `handle`.
    pub fn type_of(&self, handle: Handle) -> CApiType {
        self.type_of_value(self.value_of(handle))
    }

    pub(crate) fn type_of_value(&self, value: Value) -> CApiType {
        if value.is_fixnum() {
            return CApiType::Fixnum;
        }
        if value.is_symbol() {
            return CApiType::Symbol;
        }
        if value.is_nil() {
            return CApiType::Nil;
        }
        if value.is_true() {
            return CApiType::True;
        }
        if value.is_false() {
            return CApiType::False;
        }
        if value.is_undef() {
            return CApiType::Undef;
        }
        let Some(obj) = value.as_ref() else {
            return CApiType::None;
        };
        let object = self.get(obj);
        match &object.body {
            ObjectBody::String(_) => CApiType::String,
            ObjectBody::Array(_) => CApiType::Array,
            ObjectBody::Hash(_) => CApiType::Hash,
            ObjectBody::Float(_) => CApiType::Float,
            ObjectBody::Bignum(_) => CApiType::Bignum,
            ObjectBody::Module(m) if m.is_class() => CApiType::Class,
            ObjectBody::Module(_) => CApiType::Module,
            ObjectBody::Regexp(_) => CApiType::Regexp,
            ObjectBody::MatchData(_) => CApiType::Match,
            ObjectBody::Data(_) => CApiType::Data,
            _ => {
                if self.is_kind_of(value, self.core(CApiConstant::Struct)) {
                    CApiType::Struct
                } else if self.is_kind_of(value, self.core(CApiConstant::File)) {
                    CApiType::File
                } else {
                    CApiType::Object
                }
            }
        }
    }

    /// Raise `TypeError` unless `handle` has type `expected`.
    pub fn check_type(&mut self, handle: Handle, expected: CApiType) -> CapiResult<()> {
        let actual = self.type_of(handle);
        if actual == expected {
            return Ok(());
        }
        let got = match actual {
            CApiType::Object | CApiType::Class | CApiType::Module => {
                let value = self.value_of(handle);
                self.class_name_of(value)
            }
            other => other.describe().to_string(),
        };
        Err(self.type_error(format!(
            "wrong argument type {got} (expected {})",
            expected.describe()
        )))
    }
}
