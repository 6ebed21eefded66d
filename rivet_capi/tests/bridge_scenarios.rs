//! End-to-end scenarios driving the bridge the way an extension does.
//!
//! Coverage:
//! - Handle rooting across collection and compaction
//! - Buffer view coherency across calls into managed code
//! - protect / jump_tag / ensure / rescue2 semantics
//! - A small native extension registered through the definition API
//! - Regexp used through method dispatch

use rivet_capi::{
    CApiConstant, CapiConfig, CapiResult, Handle, JumpTag, MethodKind, NativeFn, ProtocolViolation,
    Runtime, SharedRuntime, funcall,
};
use std::cell::Cell;
use std::sync::atomic::{AtomicUsize, Ordering};

fn runtime() -> Runtime {
    Runtime::new(CapiConfig::default()).unwrap()
}

/// Class name and message of the exception `body` raises.
fn raised(rt: &mut Runtime, body: impl FnOnce(&mut Runtime) -> CapiResult<Handle>) -> (String, String) {
    let err = rt.run_toplevel(body).unwrap_err();
    (err.class, err.message)
}

// =============================================================================
// Handles
// =============================================================================

#[test]
fn test_handles_survive_compaction() {
    let mut rt = runtime();
    let strings: Vec<Handle> = (0..64)
        .map(|i| rt.str_new(format!("s{i}").as_bytes()).unwrap())
        .collect();

    // Garbage interleaved with the live strings gives compaction work.
    rt.with_handle_scope(|rt| {
        for _ in 0..256 {
            rt.ary_new().unwrap();
        }
        Handle::NIL
    });
    rt.gc_compact();

    for (i, &s) in strings.iter().enumerate() {
        assert!(rt.is_valid_handle(s));
        assert_eq!(rt.string_value(s).unwrap(), format!("s{i}").as_bytes());
    }
    let mut bits: Vec<u64> = strings.iter().map(|h| h.bits()).collect();
    bits.sort_unstable();
    bits.dedup();
    assert_eq!(bits.len(), strings.len());
}

#[test]
fn test_scope_exit_invalidates_inner_handles() {
    let mut rt = runtime();
    let leaked = Cell::new(Handle::NIL);
    let kept = rt.with_handle_scope(|rt| {
        let inner = rt.str_new(b"inner").unwrap();
        leaked.set(inner);
        rt.str_new(b"returned").unwrap()
    });
    assert!(!rt.is_valid_handle(leaked.get()));
    assert_eq!(rt.string_value(kept).unwrap(), b"returned");
}

// =============================================================================
// Views
// =============================================================================

fn upcase_first(rt: &mut Runtime, recv: Handle) -> CapiResult<Handle> {
    let view = rt.str_ptr(recv)?;
    if let Ok(bytes) = rt.view_bytes_mut(&view) {
        if let Some(b) = bytes.first_mut() {
            b.make_ascii_uppercase();
        }
    }
    Ok(recv)
}

#[test]
fn test_view_writes_visible_to_managed_callee() {
    let mut rt = runtime();
    let string = rt.get_constant(CApiConstant::String);
    rt.define_method(string, "upcase_first!", NativeFn::Arity0(upcase_first), 0, MethodKind::Public)
        .unwrap();

    let s = rt.str_new(b"rivet").unwrap();
    let view = rt.str_ptr(s).unwrap();
    rt.view_bytes_mut(&view).unwrap()[4] = b'T';

    // The call flushes the top-level view before dispatch and refreshes it
    // afterwards.
    funcall!(&mut rt, s, "upcase_first!").unwrap();
    assert_eq!(rt.view_bytes(&view).unwrap(), b"RiveT");
    assert_eq!(rt.string_value(s).unwrap(), b"RiveT");
}

#[test]
fn test_stale_view_after_resize_is_flagged() {
    let mut rt = Runtime::new(CapiConfig {
        strict_views: false,
        ..Default::default()
    })
    .unwrap();
    let s = rt.str_new(b"abc").unwrap();
    let view = rt.str_ptr(s).unwrap();
    rt.str_cat(s, b"def").unwrap();
    assert_eq!(
        rt.check_view(&view),
        Err(ProtocolViolation::ObjectResized(view.id()))
    );
    let fresh = rt.str_ptr(s).unwrap();
    assert_eq!(rt.view_bytes(&fresh).unwrap(), b"abcdef");
}

// =============================================================================
// Exception Bridge
// =============================================================================

#[test]
fn test_protect_then_jump_tag_resumes_same_exception() {
    let mut rt = runtime();
    let runtime_error = rt.get_constant(CApiConstant::RuntimeError);
    let mut original = None;
    let (result, status) = rt.protect(|rt| {
        let unwind = rt.raise_error(runtime_error, "boom");
        original = Some(unwind);
        Err(unwind)
    });
    assert!(result.is_undef());
    assert_eq!(status, JumpTag::Raise.status());

    let resumed = rt.jump_tag(status).unwrap_err();
    assert_eq!(Some(resumed), original);
    assert_eq!(rt.jump_tag(0), Ok(()));
}

#[test]
fn test_ensure_runs_once_on_both_paths() {
    let mut rt = runtime();
    let runs = Cell::new(0);

    let ok = rt.ensure(
        |rt| Ok(rt.int2num(1)),
        |_| {
            runs.set(runs.get() + 1);
            Ok(Handle::NIL)
        },
    );
    assert!(ok.is_ok());
    assert_eq!(runs.get(), 1);

    let err = rt.ensure(
        |rt| Err(rt.error(CApiConstant::ArgumentError, "bad")),
        |_| {
            runs.set(runs.get() + 1);
            Ok(Handle::NIL)
        },
    );
    assert!(err.is_err());
    assert_eq!(runs.get(), 2);
}

#[test]
fn test_rescue2_filter_lets_other_classes_through() {
    let mut rt = runtime();
    let type_error = rt.get_constant(CApiConstant::TypeError);
    let handled = Cell::new(false);
    let (class, message) = raised(&mut rt, |rt| {
        rt.rescue2(
            |rt| Err(rt.error(CApiConstant::ArgumentError, "not a type error")),
            |_, _| {
                handled.set(true);
                Ok(Handle::NIL)
            },
            &[type_error],
        )
    });
    assert!(!handled.get());
    assert_eq!(class, "ArgumentError");
    assert_eq!(message, "not a type error");
}

#[test]
fn test_rescue_restores_errinfo() {
    let mut rt = runtime();
    assert!(rt.errinfo().is_nil());
    let value = rt
        .rescue(
            |rt| Err(rt.error(CApiConstant::IndexError, "gone")),
            |rt, exc| {
                assert_eq!(rt.obj_classname(exc), "IndexError");
                Ok(rt.int2num(3))
            },
        )
        .unwrap();
    assert_eq!(rt.num2long(value).unwrap(), 3);
    assert!(rt.errinfo().is_nil());
}

// =============================================================================
// A Native Extension
// =============================================================================

static COUNTER_FREES: AtomicUsize = AtomicUsize::new(0);

unsafe extern "C" fn counter_free(ptr: *mut std::ffi::c_void) {
    // SAFETY: allocated by `counter_alloc`.
    drop(unsafe { Box::from_raw(ptr as *mut i64) });
    COUNTER_FREES.fetch_add(1, Ordering::SeqCst);
}

fn counter_alloc(rt: &mut Runtime, class: Handle) -> CapiResult<Handle> {
    let ptr = Box::into_raw(Box::new(0i64));
    rt.data_object_alloc(class, ptr.cast(), Some(counter_free))
}

fn counter_cell(rt: &mut Runtime, obj: Handle) -> CapiResult<&mut i64> {
    let ptr = rt.data_ptr(obj)?;
    // SAFETY: every Counter carries a boxed i64.
    Ok(unsafe { &mut *(ptr as *mut i64) })
}

fn counter_init(rt: &mut Runtime, argv: &[Handle], recv: Handle) -> CapiResult<Handle> {
    let args = rt.scan_args(argv, "01")?;
    let start = match args.optional[0] {
        h if h.is_nil() => 0,
        h => rt.num2long(h)?,
    };
    *counter_cell(rt, recv)? = start;
    Ok(Handle::NIL)
}

fn counter_incr(rt: &mut Runtime, recv: Handle, by: Handle) -> CapiResult<Handle> {
    let by = rt.num2long(by)?;
    let cell = counter_cell(rt, recv)?;
    *cell += by;
    let value = *cell;
    rt.long2num(value)
}

fn counter_times(rt: &mut Runtime, recv: Handle) -> CapiResult<Handle> {
    let n = *counter_cell(rt, recv)?;
    let results = rt.ary_new()?;
    for i in 0..n {
        let arg = rt.long2num(i)?;
        let r = rt.yield_values(&[arg])?;
        rt.ary_push(results, r)?;
    }
    Ok(results)
}

fn define_counter(rt: &mut Runtime) -> Handle {
    let object = rt.get_constant(CApiConstant::Object);
    let class = rt.define_class("Counter", object).unwrap();
    rt.define_alloc_func(class, counter_alloc).unwrap();
    rt.define_method(class, "initialize", NativeFn::Variadic(counter_init), -1, MethodKind::Private)
        .unwrap();
    rt.define_method(class, "incr", NativeFn::Arity1(counter_incr), 1, MethodKind::Public)
        .unwrap();
    rt.define_method(class, "times", NativeFn::Arity0(counter_times), 0, MethodKind::Public)
        .unwrap();
    class
}

#[test]
fn test_native_extension_round_trip() {
    let mut rt = runtime();
    let class = define_counter(&mut rt);
    let ten = rt.int2num(10);
    let counter = rt.class_new_instance(class, &[ten]).unwrap();
    let five = rt.int2num(5);
    let total = funcall!(&mut rt, counter, "incr", five).unwrap();
    assert_eq!(rt.num2long(total).unwrap(), 15);
    assert_eq!(rt.obj_classname(counter), "Counter");

    let (class_name, message) = raised(&mut rt, |rt| {
        let s = rt.str_new(b"x")?;
        funcall!(rt, counter, "incr", s)
    });
    assert_eq!(class_name, "TypeError");
    assert!(message.contains("String"), "{message}");
}

#[test]
fn test_native_yield_through_block_call() {
    let mut rt = runtime();
    let class = define_counter(&mut rt);
    let three = rt.int2num(3);
    let counter = rt.class_new_instance(class, &[three]).unwrap();
    let id = rt.intern("times");
    let squares = rt
        .block_call(counter, id, &[], |rt, args| {
            let n = rt.num2long(args[0])?;
            rt.long2num(n * n)
        })
        .unwrap();
    assert_eq!(rt.ary_len(squares).unwrap(), 3);
    let last = rt.ary_entry(squares, 2).unwrap();
    assert_eq!(rt.num2long(last).unwrap(), 4);

    let (class_name, _) = raised(&mut rt, |rt| funcall!(rt, counter, "times"));
    assert_eq!(class_name, "LocalJumpError");
}

#[test]
fn test_data_free_runs_on_collection() {
    let mut rt = runtime();
    let class = define_counter(&mut rt);
    let before = COUNTER_FREES.load(Ordering::SeqCst);
    rt.with_handle_scope(|rt| {
        rt.class_new_instance(class, &[]).unwrap();
        Handle::NIL
    });
    rt.gc_start();
    assert!(COUNTER_FREES.load(Ordering::SeqCst) > before);
}

// =============================================================================
// Regexp Through Dispatch
// =============================================================================

#[test]
fn test_regexp_scan_from_native_code() {
    let mut rt = runtime();
    let re = rt.reg_new(br"(\w+)@(\w+)", 0).unwrap();
    let s = rt.str_new(b"mail alice@home and bob@work").unwrap();

    let mut found = Vec::new();
    let mut pos = 0;
    loop {
        let m = rt.reg_search(re, s, pos, false).unwrap();
        if m.is_nil() {
            break;
        }
        let user = rt.reg_nth_match(1, m).unwrap();
        found.push(String::from_utf8(rt.string_value(user).unwrap()).unwrap());
        let zero = rt.int2num(0);
        let end = funcall!(&mut rt, m, "end", zero).unwrap();
        pos = rt.num2long(end).unwrap() as usize;
    }
    assert_eq!(found, ["alice", "bob"]);
}

#[test]
fn test_regexp_subclass_instances() {
    let mut rt = runtime();
    let regexp = rt.get_constant(CApiConstant::Regexp);
    let sub = rt.define_class("Pattern", regexp).unwrap();
    let source = rt.str_new(b"a+").unwrap();
    let re = rt.class_new_instance(sub, &[source]).unwrap();
    assert_eq!(rt.obj_classname(re), "Pattern");
    let s = rt.str_new(b"baaa").unwrap();
    let at = funcall!(&mut rt, re, "=~", s).unwrap();
    assert_eq!(rt.num2long(at).unwrap(), 1);

    let (class_name, message) = raised(&mut rt, |rt| {
        let bad = rt.str_new(b"(?")?;
        rt.class_new_instance(sub, &[bad])
    });
    assert_eq!(class_name, "RegexpError");
    assert!(message.ends_with(": /(?/"), "{message}");
}

// =============================================================================
// Threads
// =============================================================================

#[test]
fn test_shared_runtime_serializes_native_calls() {
    let shared = SharedRuntime::new(CapiConfig::default()).unwrap();
    let counter = shared.with(|rt| {
        let class = define_counter(rt);
        let c = rt.class_new_instance(class, &[]).unwrap();
        rt.gc_register_mark_object(c);
        c
    });

    let workers: Vec<_> = (0..4)
        .map(|_| {
            let shared = shared.clone();
            std::thread::spawn(move || {
                for _ in 0..50 {
                    shared.with(|rt| {
                        let one = rt.int2num(1);
                        funcall!(rt, counter, "incr", one).unwrap();
                    });
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    shared.with(|rt| {
        let zero = rt.int2num(0);
        let total = funcall!(rt, counter, "incr", zero).unwrap();
        assert_eq!(rt.num2long(total).unwrap(), 200);
    });
}
