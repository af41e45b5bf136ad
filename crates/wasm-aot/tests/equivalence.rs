//! Compiled and interpreted execution must agree on results, traps and
//! memory side effects, including calls that cross between the two.

use std::sync::Arc;

use wasm_aot::test_harness::*;
use wasm_aot::{
    CompileOptions, Engine, Error, Imports, InstanceId, Module, Resolution, Store, Trap, Value,
    compile,
};

const PROGRAM: &str = r#"
(module
    (type $binop (func (param i32 i32) (result i32)))
    (memory 1)
    (table 4 funcref)
    (elem (i32.const 0) $add $sub $mul)
    (global $calls (mut i32) (i32.const 0))

    (func $add (type $binop) local.get 0 local.get 1 i32.add)
    (func $sub (type $binop) local.get 0 local.get 1 i32.sub)
    (func $mul (type $binop) local.get 0 local.get 1 i32.mul)

    ;; op selects a table entry; the result is also stored at 8 * op
    (func (export "apply") (param $op i32) (param $a i32) (param $b i32) (result i32)
        global.get $calls
        i32.const 1
        i32.add
        global.set $calls
        local.get $op
        i32.const 8
        i32.mul
        local.get $a
        local.get $b
        local.get $op
        call_indirect (type $binop)
        i32.store
        local.get $op
        i32.const 8
        i32.mul
        i32.load)

    (func $fib (export "fib") (param i32) (result i64)
        local.get 0
        i32.const 2
        i32.lt_u
        if (result i64)
            local.get 0
            i64.extend_i32_u
        else
            local.get 0
            i32.const 1
            i32.sub
            call $fib
            local.get 0
            i32.const 2
            i32.sub
            call $fib
            i64.add
        end)

    (func (export "mix") (param f64 i64 f32) (result f64 i64 i32)
        local.get 0
        local.get 2
        f64.promote_f32
        f64.mul
        local.get 1
        i64.const 3
        i64.rotl
        local.get 1
        i64.eqz)

    (func (export "bytes") (param $n i32) (result i32)
        (local $i i32) (local $acc i32)
        i32.const 100
        i32.const 7
        local.get $n
        memory.fill
        block $done
            loop $next
                local.get $i
                local.get $n
                i32.ge_u
                br_if $done
                local.get $acc
                local.get $i
                i32.const 100
                i32.add
                i32.load8_u
                i32.add
                local.set $acc
                local.get $i
                i32.const 1
                i32.add
                local.set $i
                br $next
            end
        end
        local.get $acc)

    (func (export "counter") (result i32) global.get $calls))
"#;

/// Compiled, interpreted, and compiled with every defined function forced
/// into the interpreter except `apply` and `fib`.
fn engines(module: &Module) -> Vec<(&'static str, Engine)> {
    let imports = module.import_count();
    let mixed: Vec<u32> = (imports..module.function_count())
        .filter(|f| ![3, 4].contains(f))
        .collect();
    vec![
        ("compiled", Engine::default()),
        ("interpreted", Engine::Interpreted),
        (
            "mixed",
            Engine::Compiled(CompileOptions::default().with_interpreted_functions(mixed)),
        ),
    ]
}

fn outcome(
    store: &mut Store,
    id: InstanceId,
    name: &str,
    args: &[Value],
) -> Result<Vec<Value>, Trap> {
    match store.invoke(id, name, args) {
        Ok(values) => Ok(values),
        Err(Error::Trap(trap)) => Err(trap),
        Err(e) => panic!("{name}: unexpected error {e}"),
    }
}

fn memory_snapshot(store: &Store, id: InstanceId) -> Vec<u8> {
    let memory = store.instance(id).and_then(|i| i.memory()).expect("memory");
    memory.read(0, 256).expect("read").to_vec()
}

#[test]
fn test_engines_agree_on_results_and_side_effects() {
    let module = Arc::new(parse_wat(PROGRAM));
    let calls: Vec<(&str, Vec<Value>)> = vec![
        ("apply", vec![Value::I32(0), Value::I32(5), Value::I32(7)]),
        ("apply", vec![Value::I32(1), Value::I32(5), Value::I32(7)]),
        ("apply", vec![Value::I32(2), Value::I32(-3), Value::I32(7)]),
        ("apply", vec![Value::I32(3), Value::I32(1), Value::I32(1)]),
        ("apply", vec![Value::I32(9), Value::I32(1), Value::I32(1)]),
        ("fib", vec![Value::I32(20)]),
        (
            "mix",
            vec![Value::from_f64(2.5), Value::I64(i64::MIN + 1), Value::from_f32(-4.0)],
        ),
        ("mix", vec![Value::from_f64(0.0), Value::I64(0), Value::from_f32(1.0)]),
        ("bytes", vec![Value::I32(10)]),
        ("counter", vec![]),
    ];

    let mut reference: Option<(Vec<Result<Vec<Value>, Trap>>, Vec<u8>)> = None;
    for (label, engine) in engines(&module) {
        let mut store = Store::new();
        let id = store
            .instantiate(&module, &Imports::new(), &engine)
            .unwrap_or_else(|e| panic!("{label}: {e}"));
        let results: Vec<_> = calls
            .iter()
            .map(|(name, args)| outcome(&mut store, id, name, args))
            .collect();
        let memory = memory_snapshot(&store, id);

        match &reference {
            None => reference = Some((results, memory)),
            Some((expected, expected_memory)) => {
                assert_eq!(&results, expected, "{label} results differ");
                assert_eq!(&memory, expected_memory, "{label} memory differs");
            }
        }
    }

    let (results, memory) = reference.expect("at least one engine");
    assert_eq!(results[0], Ok(vec![Value::I32(12)]));
    assert_eq!(results[1], Ok(vec![Value::I32(-2)]));
    assert_eq!(results[2], Ok(vec![Value::I32(-21)]));
    assert_eq!(results[3], Err(Trap::UninitializedElement));
    assert_eq!(results[4], Err(Trap::UndefinedElement));
    assert_eq!(results[5], Ok(vec![Value::I64(6765)]));
    assert_eq!(
        results[6],
        Ok(vec![
            Value::from_f64(-10.0),
            Value::I64((i64::MIN + 1).rotate_left(3)),
            Value::I32(0),
        ])
    );
    assert_eq!(results[8], Ok(vec![Value::I32(70)]));
    // trapping calls still bumped the counter before the indirect call
    assert_eq!(results[9], Ok(vec![Value::I32(5)]));
    assert_eq!(&memory[8..12], &(-2i32).to_le_bytes());
    assert_eq!(memory[100], 7);
}

#[test]
fn test_mixed_engine_resolutions() {
    let module = Arc::new(parse_wat(PROGRAM));
    let compiled = compile(
        &module,
        &CompileOptions::default().with_interpreted_functions([0, 2]),
    )
    .expect("compile");
    assert_eq!(compiled.resolution(0), Some(Resolution::Interpreted));
    assert_eq!(compiled.resolution(1), Some(Resolution::Compiled));
    assert_eq!(compiled.resolution(2), Some(Resolution::Interpreted));

    // a compiled caller reaching interpreted callees through call_indirect
    let mut store = Store::new();
    let id = store
        .instantiate_compiled(&Arc::new(compiled), &Imports::new())
        .expect("instantiate");
    assert_eq!(
        store
            .invoke(id, "apply", &[Value::I32(2), Value::I32(6), Value::I32(7)])
            .expect("apply"),
        vec![Value::I32(42)]
    );
}

#[test]
fn test_interpreted_caller_reaches_compiled_callee() {
    let wat = r#"(module
        (func $leaf (param i64) (result i64) local.get 0 i64.const 1 i64.shl)
        (func (export "outer") (param i64) (result i64)
            local.get 0
            call $leaf
            call $leaf))"#;
    let module = Arc::new(parse_wat(wat));
    let mut store = Store::new();
    let id = store
        .instantiate(
            &module,
            &Imports::new(),
            &Engine::Compiled(CompileOptions::default().with_interpreted_functions([1])),
        )
        .expect("instantiate");
    assert_eq!(
        store.invoke(id, "outer", &[Value::I64(5)]).expect("outer"),
        vec![Value::I64(20)]
    );
}

/// Functions of a type too wide for slot arguments: 130 i64 parameters
/// (260 slots) and two results, called directly, through the table and from
/// the embedder.
fn wide_module() -> String {
    let params = "i64 ".repeat(130);
    let consts: String = (1..130).map(|i| format!("i64.const {i}\n")).collect();
    format!(
        r#"(module
    (type $wide (func (param {params}) (result i64 i64)))
    (table 1 funcref)
    (elem (i32.const 0) $wide)
    (func $wide (export "wide") (type $wide)
        local.get 0
        local.get 129
        i64.add
        local.get 64)
    (func (export "direct") (param i64) (result i64)
        local.get 0
        {consts}
        call $wide
        i64.sub)
    (func (export "indirect") (param i64) (result i64)
        local.get 0
        {consts}
        i32.const 0
        call_indirect (type $wide)
        i64.mul))"#
    )
}

#[test]
fn test_wide_signatures_agree_across_engines() {
    let wat = wide_module();
    let module = Arc::new(parse_wat(&wat));
    let wide_args: Vec<Value> = (0..130).map(|i| Value::I64(i * 10)).collect();

    let mut configs = engines(&module);
    configs.push((
        "callers interpreted",
        Engine::Compiled(CompileOptions::default().with_interpreted_functions([1, 2])),
    ));
    configs.push((
        "callee interpreted",
        Engine::Compiled(CompileOptions::default().with_interpreted_functions([0])),
    ));
    for (label, engine) in configs {
        let mut store = Store::new();
        let id = store
            .instantiate(&module, &Imports::new(), &engine)
            .expect("instantiate");
        // (x + 129) - 64
        assert_eq!(
            outcome(&mut store, id, "direct", &[Value::I64(-5)]),
            Ok(vec![Value::I64(60)]),
            "{label}"
        );
        // (x + 129) * 64
        assert_eq!(
            outcome(&mut store, id, "indirect", &[Value::I64(1)]),
            Ok(vec![Value::I64(8320)]),
            "{label}"
        );
        assert_eq!(
            outcome(&mut store, id, "wide", &wide_args),
            Ok(vec![Value::I64(1290), Value::I64(640)]),
            "{label}"
        );
    }

    let compiled = compile_wat(&wat, &CompileOptions::default()).expect("compile");
    let callee = unit_instructions(compiled.unit(0).expect("unit"));
    assert!(has_opcode(&callee, wasm_aot::vm::Opcode::UnboxParams));
    assert!(has_opcode(&callee, wasm_aot::vm::Opcode::BoxResults));
    for caller in [1, 2] {
        let code = unit_instructions(compiled.unit(caller).expect("unit"));
        assert!(has_opcode(&code, wasm_aot::vm::Opcode::BoxParams));
        assert!(has_opcode(&code, wasm_aot::vm::Opcode::UnboxResults));
    }
}
