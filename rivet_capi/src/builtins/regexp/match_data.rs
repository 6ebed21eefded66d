//! `MatchData`: the spans of one successful search.

use super::engine::Spans;
use crate::api::constants::CApiConstant;
use crate::error::CapiResult;
use crate::method::NativeFn;
use crate::object::ObjectBody;
use crate::runtime::Runtime;
use rivet_core::Value;
use rivet_gc::Handle;

/// A finished match. Spans are byte offsets into `source`.
#[derive(Debug)]
pub struct MatchBody {
    /// Frozen copy of the subject.
    pub source: Value,
    pub regexp: Value,
    pub full: (usize, usize),
    /// Capture groups from 1; `None` where a group did not participate.
    pub region: Vec<Option<(usize, usize)>>,
}

impl Default for MatchBody {
    fn default() -> Self {
        Self {
            source: Value::NIL,
            regexp: Value::NIL,
            full: (0, 0),
            region: Vec::new(),
        }
    }
}

impl MatchBody {
    /// Span of group `n`; group 0 is the whole match.
    #[inline]
    pub fn span(&self, n: usize) -> Option<(usize, usize)> {
        match n {
            0 => Some(self.full),
            n => self.region.get(n - 1).copied().flatten(),
        }
    }

    /// Group count including the whole match.
    #[inline]
    pub fn size(&self) -> usize {
        self.region.len() + 1
    }
}

impl Runtime {
    pub(crate) fn new_match_data(&mut self, re: Value, string: Value, spans: Spans) -> CapiResult<Value> {
        let bytes = self.expect_string_bytes(string)?.to_vec();
        let source = self.new_string(bytes)?;
        if let Some(o) = self.object_of_mut(source) {
            o.frozen = true;
        }
        let mut spans = spans.into_iter();
        let full = spans.next().flatten().unwrap_or((0, 0));
        let body = MatchBody {
            source,
            regexp: re,
            full,
            region: spans.collect(),
        };
        self.alloc_core(CApiConstant::Match, ObjectBody::MatchData(Box::new(body)))
    }

    fn match_body(&self, m: Value) -> Option<&MatchBody> {
        match self.object_of(m).map(|o| &o.body) {
            Some(ObjectBody::MatchData(body)) => Some(body),
            _ => None,
        }
    }

    fn expect_match(&mut self, m: Value) -> CapiResult<&MatchBody> {
        if self.match_body(m).is_none() {
            return Err(self.wrong_type(m, "MatchData"));
        }
        self.match_body(m)
            .ok_or_else(|| crate::exception::bug("match body vanished"))
    }

    /// Span of group `n` of the MatchData `m`.
    pub(crate) fn match_span(&self, m: Value, n: usize) -> Option<(usize, usize)> {
        self.match_body(m).and_then(|body| body.span(n))
    }

    /// Substring of the subject for group `n`, or nil.
    fn match_group(&mut self, m: Value, n: usize) -> CapiResult<Value> {
        let body = self.expect_match(m)?;
        let Some((start, end)) = body.span(n) else {
            return Ok(Value::NIL);
        };
        let source = body.source;
        let bytes = self.string_bytes(source).unwrap_or_default()[start..end].to_vec();
        self.new_string(bytes)
    }

    /// Group index for a name, Symbol, or Integer argument.
    fn group_index(&mut self, m: Value, group: Handle) -> CapiResult<Option<usize>> {
        let size = self.expect_match(m)?.size();
        let value = self.value_of(group);
        if value.is_fixnum() {
            let n = self.num2long(group)?;
            let n = if n < 0 { n + size as i64 } else { n };
            return Ok(usize::try_from(n).ok().filter(|&n| n < size));
        }
        let name = match value.as_symbol() {
            Some(id) => self.symbol_name(id),
            None => String::from_utf8_lossy(&self.string_value(group)?).into_owned(),
        };
        let regexp = self.expect_match(m)?.regexp;
        let index = match self.object_of(regexp).map(|o| &o.body) {
            Some(ObjectBody::Regexp(body)) => body.engine.as_ref().and_then(|engine| {
                engine
                    .group_names()
                    .into_iter()
                    .find_map(|(n, i)| (n == name).then_some(i))
            }),
            _ => None,
        };
        match index {
            Some(i) => Ok(Some(i)),
            None => Err(self.error(
                CApiConstant::IndexError,
                format!("undefined group name reference: {name}"),
            )),
        }
    }

    /// `rb_reg_nth_match`: group `n` of `m` as a String, or nil.
    pub fn reg_nth_match(&mut self, n: usize, m: Handle) -> CapiResult<Handle> {
        if m.is_nil() {
            return Ok(Handle::NIL);
        }
        let m = self.value_of(m);
        let group = self.match_group(m, n)?;
        Ok(self.handle_for(group))
    }
}

// =============================================================================
// Native Methods
// =============================================================================

fn offset(rt: &mut Runtime, recv: Handle, group: Handle, end: bool) -> CapiResult<Handle> {
    let m = rt.value_of(recv);
    let Some(n) = rt.group_index(m, group)? else {
        let n = rt.num2long(group)?;
        return Err(rt.error(CApiConstant::IndexError, format!("index {n} out of matches")));
    };
    match rt.match_span(m, n) {
        Some((s, e)) => {
            let at = if end { e } else { s };
            rt.long2num(at as i64)
        }
        None => Ok(Handle::NIL),
    }
}

fn match_begin(rt: &mut Runtime, recv: Handle, group: Handle) -> CapiResult<Handle> {
    offset(rt, recv, group, false)
}

fn match_end(rt: &mut Runtime, recv: Handle, group: Handle) -> CapiResult<Handle> {
    offset(rt, recv, group, true)
}

fn match_aref(rt: &mut Runtime, recv: Handle, group: Handle) -> CapiResult<Handle> {
    let m = rt.value_of(recv);
    match rt.group_index(m, group)? {
        Some(n) => rt.reg_nth_match(n, recv),
        None => Ok(Handle::NIL),
    }
}

fn groups_from(rt: &mut Runtime, recv: Handle, first: usize) -> CapiResult<Handle> {
    let m = rt.value_of(recv);
    let size = rt.expect_match(m)?.size();
    let mut items = Vec::with_capacity(size);
    for n in first..size {
        items.push(rt.match_group(m, n)?);
    }
    let ary = rt.new_array(items)?;
    Ok(rt.handle_for(ary))
}

fn match_captures(rt: &mut Runtime, recv: Handle) -> CapiResult<Handle> {
    groups_from(rt, recv, 1)
}

fn match_to_a(rt: &mut Runtime, recv: Handle) -> CapiResult<Handle> {
    groups_from(rt, recv, 0)
}

fn match_pre_match(rt: &mut Runtime, recv: Handle) -> CapiResult<Handle> {
    let m = rt.value_of(recv);
    let body = rt.expect_match(m)?;
    let (source, start) = (body.source, body.full.0);
    let bytes = rt.string_bytes(source).unwrap_or_default()[..start].to_vec();
    rt.str_new(&bytes)
}

fn match_post_match(rt: &mut Runtime, recv: Handle) -> CapiResult<Handle> {
    let m = rt.value_of(recv);
    let body = rt.expect_match(m)?;
    let (source, end) = (body.source, body.full.1);
    let bytes = rt.string_bytes(source).unwrap_or_default()[end..].to_vec();
    rt.str_new(&bytes)
}

fn match_string(rt: &mut Runtime, recv: Handle) -> CapiResult<Handle> {
    let m = rt.value_of(recv);
    let source = rt.expect_match(m)?.source;
    Ok(rt.handle_for(source))
}

fn match_regexp(rt: &mut Runtime, recv: Handle) -> CapiResult<Handle> {
    let m = rt.value_of(recv);
    let regexp = rt.expect_match(m)?.regexp;
    Ok(rt.handle_for(regexp))
}

fn match_size(rt: &mut Runtime, recv: Handle) -> CapiResult<Handle> {
    let m = rt.value_of(recv);
    let size = rt.expect_match(m)?.size();
    Ok(rt.int2num(size as i32))
}

fn match_to_s(rt: &mut Runtime, recv: Handle) -> CapiResult<Handle> {
    rt.reg_nth_match(0, recv)
}

pub(super) fn install(rt: &mut Runtime) {
    use super::def_native;
    use CApiConstant::Match as M;

    def_native(rt, M, "begin", NativeFn::Arity1(match_begin));
    def_native(rt, M, "end", NativeFn::Arity1(match_end));
    def_native(rt, M, "[]", NativeFn::Arity1(match_aref));
    def_native(rt, M, "captures", NativeFn::Arity0(match_captures));
    def_native(rt, M, "to_a", NativeFn::Arity0(match_to_a));
    def_native(rt, M, "pre_match", NativeFn::Arity0(match_pre_match));
    def_native(rt, M, "post_match", NativeFn::Arity0(match_post_match));
    def_native(rt, M, "string", NativeFn::Arity0(match_string));
    def_native(rt, M, "regexp", NativeFn::Arity0(match_regexp));
    def_native(rt, M, "size", NativeFn::Arity0(match_size));
    def_native(rt, M, "length", NativeFn::Arity0(match_size));
    def_native(rt, M, "to_s", NativeFn::Arity0(match_to_s));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CapiConfig;
    use crate::funcall;

    fn runtime() -> Runtime {
        Runtime::new(CapiConfig::default()).unwrap()
    }

    fn first_match(rt: &mut Runtime, pattern: &str, subject: &str) -> Handle {
        let re = rt.reg_new(pattern.as_bytes(), 0).unwrap();
        let s = rt.str_new(subject.as_bytes()).unwrap();
        rt.reg_match(re, s).unwrap()
    }

    fn text(rt: &mut Runtime, h: Handle) -> String {
        String::from_utf8(rt.string_value(h).unwrap()).unwrap()
    }

    // =========================================================================
    // Groups
    // =========================================================================

    #[test]
    fn test_nth_match_and_non_participating_group() {
        let mut rt = runtime();
        let m = first_match(&mut rt, "(a)|(b)", "xb");
        let whole = rt.reg_nth_match(0, m).unwrap();
        assert_eq!(text(&mut rt, whole), "b");
        assert!(rt.reg_nth_match(1, m).unwrap().is_nil());
        let second = rt.reg_nth_match(2, m).unwrap();
        assert_eq!(text(&mut rt, second), "b");
        assert!(rt.reg_nth_match(3, m).unwrap().is_nil());

        let one = rt.int2num(1);
        assert!(funcall!(&mut rt, m, "begin", one).unwrap().is_nil());
    }

    #[test]
    fn test_nth_match_of_nil() {
        let mut rt = runtime();
        assert!(rt.reg_nth_match(0, Handle::NIL).unwrap().is_nil());
    }

    #[test]
    fn test_aref_by_index_and_name() {
        let mut rt = runtime();
        let m = first_match(&mut rt, r"(?<year>\d+)-(?<month>\d+)", "on 2024-06");
        let month = rt.str_new(b"month").unwrap();
        let got = funcall!(&mut rt, m, "[]", month).unwrap();
        assert_eq!(text(&mut rt, got), "06");
        let last = rt.int2num(-1);
        let got = funcall!(&mut rt, m, "[]", last).unwrap();
        assert_eq!(text(&mut rt, got), "06");
        let year = rt.intern("year");
        let year = rt.id2sym(year);
        let got = funcall!(&mut rt, m, "[]", year).unwrap();
        assert_eq!(text(&mut rt, got), "2024");

        let missing = rt.str_new(b"day").unwrap();
        let err = funcall!(&mut rt, m, "[]", missing).unwrap_err();
        assert_eq!(
            rt.exception_message(err.exception),
            "undefined group name reference: day"
        );
    }

    #[test]
    fn test_begin_out_of_range_raises() {
        let mut rt = runtime();
        let m = first_match(&mut rt, "b", "abc");
        let five = rt.int2num(5);
        let err = funcall!(&mut rt, m, "begin", five).unwrap_err();
        assert_eq!(rt.class_name_of(err.exception), "IndexError");
        assert_eq!(rt.exception_message(err.exception), "index 5 out of matches");
    }

    // =========================================================================
    // Subject
    // =========================================================================

    #[test]
    fn test_pre_and_post_match() {
        let mut rt = runtime();
        let m = first_match(&mut rt, "b+", "abbc");
        let pre = funcall!(&mut rt, m, "pre_match").unwrap();
        let post = funcall!(&mut rt, m, "post_match").unwrap();
        let whole = funcall!(&mut rt, m, "to_s").unwrap();
        assert_eq!(text(&mut rt, pre), "a");
        assert_eq!(text(&mut rt, post), "c");
        assert_eq!(text(&mut rt, whole), "bb");
    }

    #[test]
    fn test_subject_is_a_frozen_copy() {
        let mut rt = runtime();
        let re = rt.reg_new(b"b", 0).unwrap();
        let s = rt.str_new(b"abc").unwrap();
        let m = rt.reg_match(re, s).unwrap();
        rt.str_replace(s, b"zzzzzz").unwrap();

        let string = funcall!(&mut rt, m, "string").unwrap();
        assert_eq!(text(&mut rt, string), "abc");
        assert!(rt.obj_frozen(string));
        let regexp = funcall!(&mut rt, m, "regexp").unwrap();
        assert_eq!(rt.value_of(regexp), rt.value_of(re));
    }

    #[test]
    fn test_captures_and_to_a() {
        let mut rt = runtime();
        let m = first_match(&mut rt, "(a)(x)?(c)", "ac");
        let captures = funcall!(&mut rt, m, "captures").unwrap();
        assert_eq!(rt.ary_len(captures).unwrap(), 3);
        assert!(rt.ary_entry(captures, 1).unwrap().is_nil());
        let all = funcall!(&mut rt, m, "to_a").unwrap();
        let first = rt.ary_entry(all, 0).unwrap();
        assert_eq!(text(&mut rt, first), "ac");
        let size = funcall!(&mut rt, m, "length").unwrap();
        assert_eq!(rt.num2long(size).unwrap(), 4);
    }

    #[test]
    fn test_match_data_survives_compaction() {
        let mut rt = runtime();
        let m = first_match(&mut rt, "(b)", "abc");
        rt.gc_compact();
        let group = rt.reg_nth_match(1, m).unwrap();
        assert_eq!(text(&mut rt, group), "b");
        let regexp = funcall!(&mut rt, m, "regexp").unwrap();
        let source = funcall!(&mut rt, regexp, "source").unwrap();
        assert_eq!(text(&mut rt, source), "(b)");
    }
}
