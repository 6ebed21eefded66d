//! `Regexp` and `MatchData`.
//!
//! A consumer of the extension API: every method here is a native
//! function registered through [`Runtime::define_method`]'s table path,
//! and reaches the heap only through handles and the bridge helpers.
//!
//! Positions are byte offsets into the subject String. The subject must
//! be valid UTF-8.

pub mod engine;
mod match_data;

pub use engine::{EXTENDED, IGNORECASE, MULTILINE, NO_ENCODING};
pub use match_data::MatchBody;

use crate::api::constants::CApiConstant;
use crate::error::CapiResult;
use crate::method::{MethodEntry, NativeFn};
use crate::object::ObjectBody;
use crate::runtime::Runtime;
use engine::{Engine, Spans};
use rivet_core::Value;
use rivet_gc::Handle;

/// Compiled pattern plus the managed fields a Regexp exposes.
#[derive(Debug)]
pub struct RegexpBody {
    /// `None` until `initialize` runs.
    pub(crate) engine: Option<Box<dyn Engine>>,
    pub(crate) options: u32,
    /// Pattern String, or nil before `initialize`.
    pub source: Value,
    /// Hash of group name → index, or nil without named groups.
    pub names: Value,
}

impl Default for RegexpBody {
    fn default() -> Self {
        Self {
            engine: None,
            options: 0,
            source: Value::NIL,
            names: Value::NIL,
        }
    }
}

/// What a search needs from a Regexp, copied out of the heap.
enum Compiled<'a> {
    Ready(&'a dyn Engine),
    Uninitialized,
    NotRegexp,
}

impl Runtime {
    // =========================================================================
    // Compilation
    // =========================================================================

    /// Compile `pattern` into the Regexp `re` (`Regexp#initialize`).
    pub(crate) fn regexp_initialize(&mut self, re: Value, pattern: Value, options: u32) -> CapiResult<()> {
        if !matches!(self.object_of(re).map(|o| &o.body), Some(ObjectBody::Regexp(_))) {
            return Err(self.wrong_type(re, "Regexp"));
        }
        self.check_frozen(re)?;
        let bytes = self.expect_string_bytes(pattern)?.to_vec();
        let Ok(text) = String::from_utf8(bytes) else {
            return Err(self.error(CApiConstant::RegexpError, "invalid multibyte character"));
        };
        let engine = match engine::compile_pattern(&text, options) {
            Ok(engine) => engine,
            Err(message) => {
                return Err(self.error(CApiConstant::RegexpError, format!("{message}: /{text}/")));
            }
        };
        let source = self.new_string(&text)?;
        if let Some(o) = self.object_of_mut(source) {
            o.frozen = true;
        }
        let names = self.group_names_hash(engine.as_ref())?;
        log::trace!("regexp: compiled /{text}/ with {:?}", engine.kind());
        if let Some(ObjectBody::Regexp(body)) = self.object_of_mut(re).map(|o| &mut o.body) {
            body.engine = Some(engine);
            body.options = NO_ENCODING | engine::engine_flags(options);
            body.source = source;
            body.names = names;
        }
        Ok(())
    }

    fn group_names_hash(&mut self, engine: &dyn Engine) -> CapiResult<Value> {
        let names = engine.group_names();
        if names.is_empty() {
            return Ok(Value::NIL);
        }
        let hash = self.alloc_core(CApiConstant::Hash, ObjectBody::Hash(Default::default()))?;
        for (name, index) in names {
            let key = self.new_string(name)?;
            self.hash_set(hash, key, Value::fixnum_unchecked(index as i64))?;
        }
        Ok(hash)
    }

    fn compiled(&self, re: Value) -> Compiled<'_> {
        match self.object_of(re).map(|o| &o.body) {
            Some(ObjectBody::Regexp(body)) => match &body.engine {
                Some(engine) => Compiled::Ready(engine.as_ref()),
                None => Compiled::Uninitialized,
            },
            _ => Compiled::NotRegexp,
        }
    }

    /// Run `search` against the subject text of `string`.
    fn regexp_run(
        &mut self,
        re: Value,
        string: Value,
        search: impl FnOnce(&dyn Engine, &str) -> Option<Spans>,
    ) -> CapiResult<Option<Spans>> {
        self.expect_string_bytes(string)?;
        let bytes = self.string_bytes(string).unwrap_or_default();
        let Ok(text) = std::str::from_utf8(bytes) else {
            return Err(self.arg_error("invalid byte sequence in subject string"));
        };
        match self.compiled(re) {
            Compiled::Ready(engine) => Ok(search(engine, text)),
            Compiled::Uninitialized => Err(self.type_error("uninitialized Regexp")),
            Compiled::NotRegexp => Err(self.wrong_type(re, "Regexp")),
        }
    }

    // =========================================================================
    // Searching
    // =========================================================================

    /// MatchData for the first match starting in `start..=end`, or nil.
    pub(crate) fn regexp_search_region(
        &mut self,
        re: Value,
        string: Value,
        start: usize,
        end: usize,
        forward: bool,
    ) -> CapiResult<Value> {
        let spans = self.regexp_run(re, string, |engine, text| {
            engine::search_region(engine, text, start, end, forward)
        })?;
        match spans {
            Some(spans) => self.new_match_data(re, string, spans),
            None => Ok(Value::NIL),
        }
    }

    /// MatchData for a match anchored at `pos`, or nil.
    pub(crate) fn regexp_match_start(&mut self, re: Value, string: Value, pos: usize) -> CapiResult<Value> {
        let spans = self.regexp_run(re, string, |engine, text| engine::match_at(engine, text, pos))?;
        match spans {
            Some(spans) => self.new_match_data(re, string, spans),
            None => Ok(Value::NIL),
        }
    }

    // =========================================================================
    // Handle API
    // =========================================================================

    /// `rb_reg_new`: compile `pattern` with option bits.
    pub fn reg_new(&mut self, pattern: &[u8], options: u32) -> CapiResult<Handle> {
        let class = self.core(CApiConstant::Regexp);
        let re = self.alloc(class, ObjectBody::Regexp(Box::default()))?;
        let source = self.new_string(pattern)?;
        self.regexp_initialize(re, source, options)?;
        Ok(self.handle_for(re))
    }

    /// Search `string` from `pos`; backward searches start at `pos` and
    /// move toward the beginning (`rb_reg_search`).
    pub fn reg_search(&mut self, re: Handle, string: Handle, pos: usize, reverse: bool) -> CapiResult<Handle> {
        let (re, string) = (self.value_of(re), self.value_of(string));
        if let Some(obj) = string.as_ref() {
            self.sync_object(obj);
        }
        let len = self.expect_string_bytes(string)?.len();
        let result = if reverse {
            self.regexp_search_region(re, string, 0, pos, false)?
        } else {
            self.regexp_search_region(re, string, pos, len, true)?
        };
        Ok(self.handle_for(result))
    }

    /// `Regexp#match`: first match anywhere, or nil.
    pub fn reg_match(&mut self, re: Handle, string: Handle) -> CapiResult<Handle> {
        self.reg_search(re, string, 0, false)
    }

    /// `Regexp#options`.
    pub fn reg_options(&mut self, re: Handle) -> CapiResult<u32> {
        let value = self.value_of(re);
        match self.object_of(value).map(|o| &o.body) {
            Some(ObjectBody::Regexp(body)) => Ok(body.options),
            _ => Err(self.wrong_type(value, "Regexp")),
        }
    }
}

// =============================================================================
// Native Methods
// =============================================================================

fn index_arg(rt: &mut Runtime, handle: Handle) -> CapiResult<usize> {
    let n = rt.num2long(handle)?;
    usize::try_from(n).map_err(|_| rt.error(CApiConstant::IndexError, format!("index {n} out of string")))
}

fn regexp_init(rt: &mut Runtime, argv: &[Handle], recv: Handle) -> CapiResult<Handle> {
    let args = rt.scan_args(argv, "11")?;
    let options = match args.optional[0] {
        h if h.is_nil() || h == Handle::FALSE => 0,
        h if h.is_fixnum() => rt.num2long(h)? as u32,
        _ => IGNORECASE,
    };
    let (re, pattern) = (rt.value_of(recv), rt.value_of(args.required[0]));
    let pattern = match rt.object_of(pattern).map(|o| &o.body) {
        Some(ObjectBody::Regexp(body)) => body.source,
        _ => pattern,
    };
    rt.regexp_initialize(re, pattern, options)?;
    Ok(recv)
}

fn regexp_source(rt: &mut Runtime, recv: Handle) -> CapiResult<Handle> {
    let re = rt.value_of(recv);
    match rt.object_of(re).map(|o| &o.body) {
        Some(ObjectBody::Regexp(body)) => {
            let source = body.source;
            Ok(rt.handle_for(source))
        }
        _ => Err(rt.wrong_type(re, "Regexp")),
    }
}

fn regexp_options(rt: &mut Runtime, recv: Handle) -> CapiResult<Handle> {
    let options = rt.reg_options(recv)?;
    Ok(rt.int2num(options as i32))
}

fn regexp_names(rt: &mut Runtime, recv: Handle) -> CapiResult<Handle> {
    let re = rt.value_of(recv);
    match rt.object_of(re).map(|o| &o.body) {
        Some(ObjectBody::Regexp(body)) => {
            let names = body.names;
            Ok(rt.handle_for(names))
        }
        _ => Err(rt.wrong_type(re, "Regexp")),
    }
}

fn regexp_search_region(
    rt: &mut Runtime,
    recv: Handle,
    string: Handle,
    start: Handle,
    end: Handle,
    forward: Handle,
) -> CapiResult<Handle> {
    let (start, end) = (index_arg(rt, start)?, index_arg(rt, end)?);
    let forward = rt.value_of(forward).test();
    let (re, string) = (rt.value_of(recv), rt.value_of(string));
    let result = rt.regexp_search_region(re, string, start, end, forward)?;
    Ok(rt.handle_for(result))
}

fn regexp_match_start(rt: &mut Runtime, recv: Handle, string: Handle, pos: Handle) -> CapiResult<Handle> {
    let pos = index_arg(rt, pos)?;
    let (re, string) = (rt.value_of(recv), rt.value_of(string));
    let result = rt.regexp_match_start(re, string, pos)?;
    Ok(rt.handle_for(result))
}

fn regexp_match(rt: &mut Runtime, recv: Handle, string: Handle) -> CapiResult<Handle> {
    if string.is_nil() {
        return Ok(Handle::NIL);
    }
    rt.reg_match(recv, string)
}

fn regexp_match_op(rt: &mut Runtime, recv: Handle, string: Handle) -> CapiResult<Handle> {
    let m = regexp_match(rt, recv, string)?;
    if m.is_nil() {
        return Ok(Handle::NIL);
    }
    let m = rt.value_of(m);
    let begin = rt.match_span(m, 0).map_or(0, |(s, _)| s);
    rt.long2num(begin as i64)
}

fn regexp_inspect(rt: &mut Runtime, recv: Handle) -> CapiResult<Handle> {
    let source = regexp_source(rt, recv)?;
    let mut text = b"/".to_vec();
    if !source.is_nil() {
        text.extend_from_slice(&rt.string_value(source)?);
    }
    text.push(b'/');
    let options = rt.reg_options(recv)?;
    for (bit, flag) in [(MULTILINE, b'm'), (IGNORECASE, b'i'), (EXTENDED, b'x')] {
        if options & bit != 0 {
            text.push(flag);
        }
    }
    rt.str_new(&text)
}

fn def_native(rt: &mut Runtime, class: CApiConstant, name: &str, func: NativeFn) {
    let class = rt.core(class);
    let id = rt.intern(name);
    rt.add_method(class, id, MethodEntry::native(func));
}

pub(crate) fn install(rt: &mut Runtime) {
    use CApiConstant::Regexp as R;

    def_native(rt, R, "initialize", NativeFn::Variadic(regexp_init));
    def_native(rt, R, "source", NativeFn::Arity0(regexp_source));
    def_native(rt, R, "options", NativeFn::Arity0(regexp_options));
    def_native(rt, R, "names", NativeFn::Arity0(regexp_names));
    def_native(rt, R, "search_region", NativeFn::Arity4(regexp_search_region));
    def_native(rt, R, "match_start", NativeFn::Arity2(regexp_match_start));
    def_native(rt, R, "match", NativeFn::Arity1(regexp_match));
    def_native(rt, R, "=~", NativeFn::Arity1(regexp_match_op));
    def_native(rt, R, "inspect", NativeFn::Arity0(regexp_inspect));
    def_native(rt, R, "to_s", NativeFn::Arity0(regexp_inspect));

    match_data::install(rt);
}
