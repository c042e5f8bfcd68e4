// To debug or develop a test, try `eprintln!("{:#?}", out)`

use std::path::{Path, PathBuf};

use ptaflow::{
    analysis::query::{check_directives, DirectiveKind},
    ir::{FunctionName, Module},
    pointer::{self, Options, Solution},
    Diagnostic, Signatures,
};

// ------------------------------------------------------------------
// Helpers

fn path(program: &str, dir: &str) -> PathBuf {
    PathBuf::from(format!("tests/{}/{}.json", dir, program))
}

fn signatures(program: &str, dir: &str) -> Signatures {
    let path_str = format!("tests/{}/{}.signatures.json", dir, program);
    let signatures_path = Path::new(&path_str);
    if signatures_path.try_exists().unwrap() {
        let signatures_string =
            std::fs::read_to_string(signatures_path).expect("Couldn't read points-to signatures");
        Signatures::from_json(&signatures_string).unwrap()
    } else {
        Signatures::default()
    }
}

struct NamedModule {
    dir: String,
    program: String,
    module: Module,
}

fn convert(program: &str, dir: &str) -> NamedModule {
    let json = std::fs::read_to_string(path(program, dir)).unwrap();
    match Module::from_json(&json) {
        Ok(m) => NamedModule {
            dir: dir.to_owned(),
            program: program.to_owned(),
            module: m,
        },
        Err(e) => panic!("{}", e),
    }
}

fn check_module(out: &Solution, module: &Module) {
    let (directives, unknown) = check_directives(module, out);
    if let Some(d) = unknown.first() {
        panic!("{}", d);
    }
    for d in directives {
        assert!(
            d.holds,
            "assertion failed: {:?} at {} ({:?})",
            d.kind,
            d.site,
            d.args
                .iter()
                .map(|a| out.points_to(&d.site.function, a).iter().collect::<Vec<_>>())
                .collect::<Vec<_>>()
        );
    }
    let violations: Vec<_> = out.strict_violations().collect();
    assert!(violations.is_empty(), "points to nothing: {:?}", violations);
}

fn check_with(module: &NamedModule, opts: &Options) -> Solution {
    let sigs = signatures(&module.program, &module.dir);
    let out = pointer::analysis(&module.module, &sigs, opts).unwrap();
    check_module(&out, &module.module);
    out
}

fn check(module: &NamedModule) -> Solution {
    let opts = Options {
        check_assertions: true,
        // This program intentionally constructs a nonsense pointer, triggering
        // an assertion failure before the test can complete.
        check_strict: module.program != "fail-assert-points-to-something",
        contexts: 1,
        metrics: true,
        unification: true,
        ..Options::default()
    };
    check_with(module, &opts)
}

fn check_precise(module: &NamedModule, contexts: u8) -> Solution {
    let opts = Options {
        check_assertions: true,
        contexts,
        metrics: true,
        ..Options::default()
    };
    check_with(module, &opts)
}

fn imprecise(program: &str) -> NamedModule {
    convert(program, "pointer/imprecision")
}

fn precise(program: &str) -> NamedModule {
    convert(program, "pointer/precision")
}

fn sound(program: &str) -> NamedModule {
    convert(program, "pointer/soundness")
}

// ------------------------------------------------------------------

#[test]
fn alloca() {
    let module = sound("alloca");
    let _out = check(&module);
}

#[test]
fn argv_0() {
    let module = sound("argv-0");
    let _out = check(&module);
}

#[test]
fn call() {
    let module = sound("call");
    let out = check(&module);
    assert!(out.reachable.len() == 3); // main, callee, assert_reachable
}

#[test]
fn call_alloca() {
    let module = sound("call-alloca");
    let _out = check(&module);
}

#[test]
fn callback() {
    let module = sound("callback");
    let out = check(&module);
    assert!(out.is_reachable(&FunctionName::from("cmp")));
}

// Calls to unknown code may return anything.
#[test]
fn external() {
    let module = sound("external");
    let out = check(&module);
    assert!(out.needs_signature.contains(&FunctionName::from("getenv")));
    assert!(out.metrics.unwrap().points_to_top > 0);
}

#[test]
fn errno() {
    let module = sound("errno");
    let out = check(&module);
    assert!(out.needs_signature.is_empty());
}

// XFAIL: This proves that this assertion is being handled properly by tests
#[test]
#[should_panic(expected = "assertion failed: PointsToSomething")]
fn fail_assert_points_to_something() {
    let module = sound("fail-assert-points-to-something");
    let _out = check(&module);
}

// XFAIL: This proves that this assertion is being handled properly by tests
#[test]
#[should_panic(expected = "assertion failed: Reachable")]
fn fail_assert_reachable() {
    let module = sound("fail-assert-reachable");
    let _out = check(&module);
}

#[test]
fn func_ptr() {
    let module = sound("func-ptr");
    let _out = check(&module);
}

#[test]
fn function_table() {
    let module = sound("function-table");
    let out = check(&module);
    for f in ["foo", "bar", "baz"] {
        assert!(out.is_reachable(&FunctionName::from(f)));
    }
}

#[test]
fn gep() {
    let module = sound("gep");
    let _out = check(&module);
}

#[test]
fn global() {
    let module = sound("global");
    let _out = check(&module);
}

#[test]
fn global_array() {
    let module = sound("global-array");
    let _out = check(&module);
}

#[test]
fn global_expr() {
    let module = sound("global-expr");
    let _out = check(&module);
}

#[test]
fn global_load() {
    let module = sound("global-load");
    let _out = check(&module);
}

#[test]
fn global_store() {
    let module = sound("global-store");
    let _out = check(&module);
}

#[test]
fn global_struct() {
    let module = sound("global-struct");
    let _out = check(&module);
}

#[test]
fn indirect_call() {
    let module = sound("indirect-call");
    let out = check(&module);
    assert!(out.is_reachable(&FunctionName::from("foo")));
    assert!(out.is_reachable(&FunctionName::from("bar")));
}

// Pointer arithmetic done on integers still moves between fields.
#[test]
fn int_arith() {
    let module = sound("int-arith");
    let out = check(&module);
    assert!(out
        .diagnostics
        .iter()
        .any(|d| matches!(d, Diagnostic::Collapsed { .. })));
}

#[test]
fn malloc() {
    let module = sound("malloc");
    let _out = check(&module);
}

#[test]
fn memcpy() {
    let module = sound("memcpy");
    let _out = check(&module);
}

#[test]
fn new() {
    let module = sound("new");
    let _out = check(&module);
}

#[test]
fn phi() {
    let module = sound("phi");
    let _out = check(&module);
}

#[test]
fn ptr_arg() {
    let module = sound("ptr-arg");
    let _out = check(&module);
}

#[test]
fn ptr_ret() {
    let module = sound("ptr-ret");
    let _out = check(&module);
}

#[test]
fn ptr_to_int() {
    let module = sound("ptr-to-int");
    let _out = check(&module);
}

#[test]
fn ptr_to_int_sub() {
    let module = sound("ptr-to-int-sub");
    let _out = check(&module);
}

#[test]
fn realloc() {
    let module = sound("realloc");
    let _out = check(&module);
}

#[test]
fn reallocarray() {
    let module = sound("reallocarray");
    let _out = check(&module);
}

#[test]
fn stack_array() {
    let module = sound("stack-array");
    let _out = check(&module);
}

#[test]
fn stack_cast() {
    let module = sound("stack-cast");
    let _out = check(&module);
}

#[test]
fn stack_struct() {
    let module = sound("stack-struct");
    let _out = check(&module);
}

#[test]
fn stderr() {
    let module = sound("stderr");
    let _out = check(&module);
}

#[test]
fn throw() {
    let module = sound("throw");
    let _out = check(&module);
}

#[test]
fn undef() {
    let module = sound("undef");
    let out = check(&module);
    assert!(out.is_reachable(&FunctionName::from("baz")));
}

#[test]
fn varargs() {
    let module = sound("varargs");
    let _out = check(&module);
}

#[test]
fn all_soundness_at_every_depth() {
    for entry in std::fs::read_dir("tests/pointer/soundness").unwrap() {
        let path = entry.unwrap().path();
        let name = path.file_name().unwrap().to_str().unwrap();
        let Some(program) = name.strip_suffix(".json") else {
            continue;
        };
        if program.ends_with(".signatures") || program.starts_with("fail-") {
            continue;
        }
        let module = sound(program);
        for contexts in 0..3 {
            for unification in [false, true] {
                let opts = Options {
                    check_assertions: true,
                    check_strict: true,
                    contexts,
                    unification,
                    ..Options::default()
                };
                check_with(&module, &opts);
            }
        }
    }
}

#[test]
fn memcpy_size() {
    let module = precise("memcpy-size");
    let out = check_precise(&module, 1);
    assert!(out
        .diagnostics
        .iter()
        .any(|d| matches!(d, Diagnostic::InvalidMemcpy { .. })));
}

#[test]
fn field_disjoint() {
    let module = precise("field-disjoint");
    let _out = check_precise(&module, 0);
}

#[test]
fn varargs_positional() {
    let module = precise("varargs-positional");
    let _out = check_precise(&module, 0);
}

// Yay, context-sensitivity!
#[test]
fn context_k1() {
    let module = precise("context");
    let _out = check_precise(&module, 1);
}

#[test]
#[should_panic(expected = "assertion failed: Disjoint")]
fn context_k0() {
    let module = precise("context");
    let _out = check_precise(&module, 0);
}

#[test]
fn context_imprecise_k0() {
    let module = imprecise("context");
    let _out = check_precise(&module, 0);
}

// XFAIL: Yay, context-sensitivity!
#[test]
#[should_panic(expected = "assertion failed: MayAlias")]
fn context_imprecise_k1() {
    let module = imprecise("context");
    let _out = check_precise(&module, 1);
}

#[test]
fn solution_is_deterministic() {
    let module = sound("function-table");
    let a = check(&module);
    let b = check(&module);
    assert_eq!(a.operand_points_to(), b.operand_points_to());
    assert_eq!(a.alloc_points_to(), b.alloc_points_to());
    assert_eq!(a.calls, b.calls);
}

#[test]
fn directive_kinds() {
    assert_eq!(
        Some(DirectiveKind::Disjoint),
        DirectiveKind::from_name("assert_disjoint")
    );
    assert_eq!(None, DirectiveKind::from_name("assert"));
}
