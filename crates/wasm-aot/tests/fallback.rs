//! Oversized functions under each fallback policy, with diagnostics captured
//! from `tracing`.

use std::io::Write;
use std::sync::{Arc, Mutex};

use tracing_subscriber::fmt::MakeWriter;
use wasm_aot::test_harness::*;
use wasm_aot::vm::Opcode;
use wasm_aot::{
    CompileOptions, Engine, Error, FallbackPolicy, Imports, Module, Resolution, Store, Value,
    compile,
};

/// Enough additions to push function 2 past the default code unit limit.
const ADDITIONS: u32 = 12_000;

/// Log sink shared between the subscriber and the test.
#[derive(Clone, Default)]
struct Captured(Arc<Mutex<Vec<u8>>>);

impl Captured {
    fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().expect("lock")).into_owned()
    }
}

impl Write for Captured {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().expect("lock").extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for Captured {
    type Writer = Captured;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Run `f` with warnings and above written to the returned sink.
fn with_captured_logs<T>(f: impl FnOnce() -> T) -> (T, String) {
    let sink = Captured::default();
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::WARN)
        .with_ansi(false)
        .with_writer(sink.clone())
        .finish();
    let value = tracing::subscriber::with_default(subscriber, f);
    (value, sink.contents())
}

fn oversized() -> Arc<Module> {
    let wasm = oversized_function_module(ADDITIONS);
    Arc::new(Module::parse(&wasm).expect("decode"))
}

fn run_all(module: &Arc<Module>, fallback: FallbackPolicy) -> Vec<Value> {
    let mut store = Store::new();
    let id = store
        .instantiate(
            module,
            &Imports::new(),
            &Engine::Compiled(CompileOptions::default().with_fallback(fallback)),
        )
        .expect("instantiate");
    let mut results = Vec::new();
    for name in ["small", "double", "big"] {
        results.extend(store.invoke(id, name, &[Value::I32(5)]).expect(name));
    }
    results
}

#[test]
fn test_fail_policy_names_the_function() {
    let module = oversized();
    let err = compile(&module, &CompileOptions::default()).expect_err("too large");
    assert!(matches!(err, Error::FallbackRequired { function: 2, .. }));
    let message = err.to_string();
    assert!(
        message.contains("interpreter fallback mode: WASM function index: 2"),
        "unexpected message: {message}"
    );
}

#[test]
fn test_warn_policy_logs_and_runs_interpreted() {
    let module = oversized();
    let (results, logs) = with_captured_logs(|| run_all(&module, FallbackPolicy::Warn));

    assert!(
        logs.contains("using interpreted mode for WASM function index: 2"),
        "missing warning in: {logs}"
    );
    assert!(logs.contains("WARN"));
    let expected_big = 5 + i32::try_from(ADDITIONS).expect("fits");
    assert_eq!(
        results,
        vec![Value::I32(12), Value::I32(10), Value::I32(expected_big)]
    );
}

#[test]
fn test_silent_policy_produces_no_output() {
    let module = oversized();
    let (results, logs) = with_captured_logs(|| run_all(&module, FallbackPolicy::Silent));

    assert!(logs.is_empty(), "unexpected output: {logs}");
    let expected_big = 5 + i32::try_from(ADDITIONS).expect("fits");
    assert_eq!(results[2], Value::I32(expected_big));
}

#[test]
fn test_only_the_oversized_function_falls_back() {
    let module = oversized();
    let compiled = compile(
        &module,
        &CompileOptions::default().with_fallback(FallbackPolicy::Silent),
    )
    .expect("compile");
    assert_eq!(
        compiled.resolutions(),
        &[Resolution::Compiled, Resolution::Compiled, Resolution::Interpreted]
    );
    let stats = compiled.stats();
    assert_eq!((stats.compiled, stats.interpreted), (2, 1));
    // the stub standing in for the oversized function is small
    let stub = compiled.unit(2).expect("unit");
    assert!(stub.size() < 64);
    assert_eq!(count_opcode(&unit_instructions(stub), Opcode::CallInterpreter), 1);
    let small = unit_instructions(compiled.unit(0).expect("unit"));
    assert!(!has_opcode(&small, Opcode::CallInterpreter));
}

#[test]
fn test_fallback_message_includes_function_name() {
    let wat = r#"(module
        (func $tiny (result i32) i32.const 1)
        (func $chatty (result i32)
            i32.const 1 i32.const 2 i32.add i32.const 3 i32.add i32.const 4 i32.add))"#;
    let options = CompileOptions::default().with_max_code_size(20);

    let err = compile_wat(wat, &options).expect_err("too large");
    assert!(
        err.to_string()
            .contains("interpreter fallback mode: WASM function index: 1 (name: chatty)")
    );

    let (result, logs) =
        with_captured_logs(|| compile_wat(wat, &options.with_fallback(FallbackPolicy::Warn)));
    result.expect("fallback");
    assert!(logs.contains("using interpreted mode for WASM function index: 1 (name: chatty)"));
}

#[test]
fn test_explicit_interpreted_set_ignores_size() {
    let module = oversized();
    let err = compile(
        &module,
        &CompileOptions::default().with_interpreted_functions([0]),
    )
    .expect_err("big still too large");
    assert!(matches!(err, Error::FallbackRequired { function: 2, .. }));

    let compiled = compile(
        &module,
        &CompileOptions::default().with_interpreted_functions([0, 2]),
    )
    .expect("compile");
    assert_eq!(
        compiled.resolutions(),
        &[Resolution::Interpreted, Resolution::Compiled, Resolution::Interpreted]
    );
}
