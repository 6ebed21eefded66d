//! Method implementations and native registration templates.
//!
//! A method table entry is either a managed body (a Rust closure standing
//! in for interpreted code) or a native function registered through the
//! extension API. Both sit behind the same dispatch path; only the native
//! variant goes through the trampoline in [`call`](crate::call).
//!
//! # Native Calling Conventions
//!
//! ```text
//! ┌───────────┬───────────────────────────────────────┬───────┐
//! │ Variant   │ Rust signature                        │ arity │
//! ├───────────┼───────────────────────────────────────┼───────┤
//! │ ArityN    │ fn(rt, self, a1, .., aN)              │  N    │
//! │ Variadic  │ fn(rt, argv: &[Handle], self)         │  -1   │
//! │ ArgsArray │ fn(rt, self, args: Array)             │  -2   │
//! └───────────┴───────────────────────────────────────┴───────┘
//! ```

use crate::error::CapiResult;
use crate::runtime::Runtime;
use rivet_core::Value;
use rivet_gc::Handle;
use std::fmt;
use std::sync::Arc;

/// Body of a managed method: `(runtime, self, args) -> result`.
///
/// Closures must not capture heap references; anything they need to keep
/// alive belongs in an instance variable or constant.
pub type ManagedFn = Arc<dyn Fn(&mut Runtime, Value, &[Value]) -> CapiResult<Value> + Send + Sync>;

/// Native function pointer in one of the C calling conventions.
#[derive(Clone, Copy)]
pub enum NativeFn {
    Arity0(fn(&mut Runtime, Handle) -> CapiResult<Handle>),
    Arity1(fn(&mut Runtime, Handle, Handle) -> CapiResult<Handle>),
    Arity2(fn(&mut Runtime, Handle, Handle, Handle) -> CapiResult<Handle>),
    Arity3(fn(&mut Runtime, Handle, Handle, Handle, Handle) -> CapiResult<Handle>),
    Arity4(fn(&mut Runtime, Handle, Handle, Handle, Handle, Handle) -> CapiResult<Handle>),
    /// `argc/argv/self`.
    Variadic(fn(&mut Runtime, &[Handle], Handle) -> CapiResult<Handle>),
    /// `self, args` with the arguments packed into an Array.
    ArgsArray(fn(&mut Runtime, Handle, Handle) -> CapiResult<Handle>),
}

impl NativeFn {
    /// Arity implied by the calling convention.
    pub fn arity(&self) -> Arity {
        match self {
            NativeFn::Arity0(_) => Arity::Fixed(0),
            NativeFn::Arity1(_) => Arity::Fixed(1),
            NativeFn::Arity2(_) => Arity::Fixed(2),
            NativeFn::Arity3(_) => Arity::Fixed(3),
            NativeFn::Arity4(_) => Arity::Fixed(4),
            NativeFn::Variadic(_) => Arity::Variadic,
            NativeFn::ArgsArray(_) => Arity::ArgsArray,
        }
    }
}

impl fmt::Debug for NativeFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NativeFn({})", self.arity().to_c())
    }
}

/// Argument count contract, encoded as in the C API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    /// Exactly `n` arguments.
    Fixed(u8),
    /// Any count, passed as `argc/argv` (`-1`).
    Variadic,
    /// Any count, passed as an Array (`-2`).
    ArgsArray,
}

impl Arity {
    /// Largest fixed arity a native function can take.
    pub const MAX_FIXED: i32 = 4;

    /// Decode a C arity.
    pub fn from_c(arity: i32) -> Option<Self> {
        match arity {
            -1 => Some(Arity::Variadic),
            -2 => Some(Arity::ArgsArray),
            0..=Self::MAX_FIXED => Some(Arity::Fixed(arity as u8)),
            _ => None,
        }
    }

    /// C encoding.
    pub fn to_c(self) -> i32 {
        match self {
            Arity::Fixed(n) => n as i32,
            Arity::Variadic => -1,
            Arity::ArgsArray => -2,
        }
    }

    /// Whether `argc` arguments satisfy this arity.
    #[inline]
    pub fn accepts(self, argc: usize) -> bool {
        match self {
            Arity::Fixed(n) => argc == n as usize,
            Arity::Variadic | Arity::ArgsArray => true,
        }
    }
}

/// Method visibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Public,
    Protected,
    Private,
}

/// How a native method is attached at registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodKind {
    Public,
    Protected,
    Private,
    /// Public method on the owner's singleton class.
    Singleton,
}

impl MethodKind {
    pub(crate) fn visibility(self) -> Visibility {
        match self {
            MethodKind::Public | MethodKind::Singleton => Visibility::Public,
            MethodKind::Protected => Visibility::Protected,
            MethodKind::Private => Visibility::Private,
        }
    }
}

/// What a method table entry runs.
#[derive(Clone)]
pub enum MethodBody {
    /// Managed code. `arity` follows the C convention; `-1` accepts any.
    Managed { func: ManagedFn, arity: i32 },
    /// A registered native function.
    Native(NativeFn),
    /// `undef_method` marker; stops lookup.
    Undefined,
}

impl fmt::Debug for MethodBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MethodBody::Managed { arity, .. } => write!(f, "Managed({arity})"),
            MethodBody::Native(func) => write!(f, "{func:?}"),
            MethodBody::Undefined => write!(f, "Undefined"),
        }
    }
}

/// A method table entry.
#[derive(Debug, Clone)]
pub struct MethodEntry {
    pub body: MethodBody,
    pub visibility: Visibility,
}

impl MethodEntry {
    /// Public managed method.
    pub fn managed(
        arity: i32,
        func: impl Fn(&mut Runtime, Value, &[Value]) -> CapiResult<Value> + Send + Sync + 'static,
    ) -> Self {
        Self {
            body: MethodBody::Managed {
                func: Arc::new(func),
                arity,
            },
            visibility: Visibility::Public,
        }
    }

    /// Public native method.
    pub fn native(func: NativeFn) -> Self {
        Self {
            body: MethodBody::Native(func),
            visibility: Visibility::Public,
        }
    }

    /// Builder: set visibility.
    pub fn with_visibility(mut self, visibility: Visibility) -> Self {
        self.visibility = visibility;
        self
    }

    /// True for `undef_method` markers.
    #[inline]
    pub fn is_undefined(&self) -> bool {
        matches!(self.body, MethodBody::Undefined)
    }
}

// =============================================================================
// Argument Templates
// =============================================================================

/// Parsed `scan_args` template such as `"12*&"`.
///
/// Digits give required then optional counts, `*` collects the rest into
/// an Array, `&` captures the block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ArgSpec {
    pub required: usize,
    pub optional: usize,
    pub splat: bool,
    pub block: bool,
}

impl ArgSpec {
    /// Parse a template; `None` if malformed.
    pub fn parse(template: &str) -> Option<Self> {
        let mut spec = ArgSpec::default();
        let mut chars = template.chars().peekable();

        if let Some(c) = chars.peek().copied().filter(char::is_ascii_digit) {
            spec.required = c.to_digit(10)? as usize;
            chars.next();
            if let Some(c) = chars.peek().copied().filter(char::is_ascii_digit) {
                spec.optional = c.to_digit(10)? as usize;
                chars.next();
            }
        }
        if chars.peek() == Some(&'*') {
            spec.splat = true;
            chars.next();
        }
        if chars.peek() == Some(&'&') {
            spec.block = true;
            chars.next();
        }
        if chars.next().is_some() {
            return None;
        }
        Some(spec)
    }

    /// Whether `argc` positional arguments fit the template.
    pub fn accepts(&self, argc: usize) -> bool {
        argc >= self.required && (self.splat || argc <= self.required + self.optional)
    }

    /// Arity as reported by `Method#arity`.
    pub fn arity(&self) -> i32 {
        if self.optional > 0 || self.splat {
            -(self.required as i32) - 1
        } else {
            self.required as i32
        }
    }

    /// "n for m" description used in `ArgumentError` messages.
    pub fn expected(&self) -> String {
        if self.splat {
            format!("{}+", self.required)
        } else if self.optional > 0 {
            format!("{}..{}", self.required, self.required + self.optional)
        } else {
            self.required.to_string()
        }
    }
}

/// Arguments unpacked by [`Runtime::scan_args`].
#[derive(Debug, Clone, Default)]
pub struct ScannedArgs {
    /// Required arguments in order.
    pub required: Vec<Handle>,
    /// Optional arguments; `nil` where not supplied.
    pub optional: Vec<Handle>,
    /// Remaining arguments packed into an Array.
    pub splat: Option<Handle>,
    /// The block as a Proc, or `nil`.
    pub block: Option<Handle>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arity_round_trip() {
        for c in [-2, -1, 0, 1, 4] {
            assert_eq!(Arity::from_c(c).unwrap().to_c(), c);
        }
        assert_eq!(Arity::from_c(5), None);
        assert_eq!(Arity::from_c(-3), None);
    }

    #[test]
    fn test_arity_accepts() {
        assert!(Arity::Fixed(2).accepts(2));
        assert!(!Arity::Fixed(2).accepts(1));
        assert!(Arity::Variadic.accepts(0));
        assert!(Arity::ArgsArray.accepts(9));
    }

    mod arg_spec {
        use super::*;

        #[test]
        fn test_parse_full_template() {
            let spec = ArgSpec::parse("12*&").unwrap();
            assert_eq!(
                spec,
                ArgSpec {
                    required: 1,
                    optional: 2,
                    splat: true,
                    block: true
                }
            );
        }

        #[test]
        fn test_parse_partial_templates() {
            assert_eq!(ArgSpec::parse("").unwrap(), ArgSpec::default());
            assert_eq!(ArgSpec::parse("2").unwrap().required, 2);
            assert!(ArgSpec::parse("*").unwrap().splat);
            assert!(ArgSpec::parse("&").unwrap().block);
            assert_eq!(ArgSpec::parse("01").unwrap().optional, 1);
        }

        #[test]
        fn test_parse_rejects_garbage() {
            assert!(ArgSpec::parse("1x").is_none());
            assert!(ArgSpec::parse("&*").is_none());
            assert!(ArgSpec::parse("123").is_none());
        }

        #[test]
        fn test_accepts_and_arity() {
            let spec = ArgSpec::parse("11").unwrap();
            assert!(!spec.accepts(0));
            assert!(spec.accepts(1));
            assert!(spec.accepts(2));
            assert!(!spec.accepts(3));
            assert_eq!(spec.arity(), -2);
            assert_eq!(spec.expected(), "1..2");

            let splat = ArgSpec::parse("1*").unwrap();
            assert!(splat.accepts(10));
            assert_eq!(splat.expected(), "1+");
            assert_eq!(ArgSpec::parse("2").unwrap().arity(), 2);
        }
    }

    #[test]
    fn test_method_kind_visibility() {
        assert_eq!(MethodKind::Singleton.visibility(), Visibility::Public);
        assert_eq!(MethodKind::Private.visibility(), Visibility::Private);
    }
}
