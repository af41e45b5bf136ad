//! Runtime traps carry the same category and message in both engines.

use wasm_aot::test_harness::*;
use wasm_aot::{Engine, Error, Trap, TrapKind, Value};

const FAULTS: &str = r#"(module
    (memory 1 2)
    (func (export "unreachable") unreachable)
    (func (export "load") (param i32) (result i32)
        local.get 0
        i32.load)
    (func (export "load_far") (param i32) (result i64)
        local.get 0
        i64.load offset=65528)
    (func (export "store_byte") (param i32)
        local.get 0
        i32.const 255
        i32.store8)
    (func (export "div_s") (param i32 i32) (result i32)
        local.get 0
        local.get 1
        i32.div_s)
    (func (export "rem_u64") (param i64 i64) (result i64)
        local.get 0
        local.get 1
        i64.rem_u)
    (func (export "trunc") (param f32) (result i32)
        local.get 0
        i32.trunc_f32_s)
    (func (export "trunc_sat") (param f64) (result i32)
        local.get 0
        i32.trunc_sat_f64_u)
    (func (export "grow") (param i32) (result i32)
        local.get 0
        memory.grow)
    (func (export "copy") (param i32 i32 i32)
        local.get 0
        local.get 1
        local.get 2
        memory.copy))"#;

fn outcomes(name: &str, args: &[Value]) -> Vec<Result<Vec<Value>, Trap>> {
    [Engine::default(), Engine::Interpreted]
        .into_iter()
        .map(|engine| {
            let (mut store, id) = instantiate_wat(FAULTS, &engine);
            match store.invoke(id, name, args) {
                Ok(values) => Ok(values),
                Err(Error::Trap(trap)) => Err(trap),
                Err(e) => panic!("{name}: {e}"),
            }
        })
        .collect()
}

fn assert_trap(name: &str, args: &[Value], kind: TrapKind, message: &str) {
    for outcome in outcomes(name, args) {
        let trap = outcome.expect_err(name);
        assert_eq!(trap.category(), kind, "{name}");
        assert_eq!(trap.to_string(), message, "{name}");
    }
}

fn assert_returns(name: &str, args: &[Value], expected: &[Value]) {
    for outcome in outcomes(name, args) {
        assert_eq!(outcome.as_deref(), Ok(expected), "{name}{args:?}");
    }
}

#[test]
fn test_unreachable() {
    assert_trap(
        "unreachable",
        &[],
        TrapKind::Unreachable,
        "Trapped on unreachable instruction",
    );
}

#[test]
fn test_memory_bounds() {
    assert_returns("load", &[Value::I32(65_532)], &[Value::I32(0)]);
    for addr in [65_533, -1] {
        assert_trap(
            "load",
            &[Value::I32(addr)],
            TrapKind::MemoryOutOfBounds,
            "out of bounds memory access",
        );
    }
    assert_returns("load_far", &[Value::I32(0)], &[Value::I64(0)]);
    assert_trap(
        "load_far",
        &[Value::I32(1)],
        TrapKind::MemoryOutOfBounds,
        "out of bounds memory access",
    );
    assert_trap(
        "store_byte",
        &[Value::I32(65_536)],
        TrapKind::MemoryOutOfBounds,
        "out of bounds memory access",
    );
}

#[test]
fn test_integer_faults() {
    assert_returns("div_s", &[Value::I32(-7), Value::I32(2)], &[Value::I32(-3)]);
    assert_trap(
        "div_s",
        &[Value::I32(1), Value::I32(0)],
        TrapKind::IntegerDivideByZero,
        "integer divide by zero",
    );
    assert_trap(
        "div_s",
        &[Value::I32(i32::MIN), Value::I32(-1)],
        TrapKind::IntegerOverflow,
        "integer overflow",
    );
    assert_trap(
        "rem_u64",
        &[Value::I64(5), Value::I64(0)],
        TrapKind::IntegerDivideByZero,
        "integer divide by zero",
    );
    assert_returns(
        "rem_u64",
        &[Value::I64(-1), Value::I64(10)],
        &[Value::I64(5)],
    );
}

#[test]
fn test_float_conversions() {
    assert_returns("trunc", &[Value::from_f32(-3.9)], &[Value::I32(-3)]);
    assert_trap(
        "trunc",
        &[Value::from_f32(f32::NAN)],
        TrapKind::InvalidConversion,
        "invalid conversion to integer",
    );
    assert_trap(
        "trunc",
        &[Value::from_f32(3.0e9)],
        TrapKind::IntegerOverflow,
        "integer overflow",
    );
    assert_returns("trunc_sat", &[Value::from_f64(-5.0)], &[Value::I32(0)]);
    assert_returns("trunc_sat", &[Value::from_f64(1e20)], &[Value::I32(-1)]);
}

#[test]
fn test_memory_growth_respects_the_maximum() {
    assert_returns("grow", &[Value::I32(1)], &[Value::I32(1)]);
    assert_returns("grow", &[Value::I32(2)], &[Value::I32(-1)]);
}

#[test]
fn test_bulk_copy_bounds() {
    assert_returns(
        "copy",
        &[Value::I32(0), Value::I32(100), Value::I32(16)],
        &[],
    );
    assert_trap(
        "copy",
        &[Value::I32(65_530), Value::I32(0), Value::I32(16)],
        TrapKind::MemoryOutOfBounds,
        "out of bounds memory access",
    );
}

#[test]
fn test_traps_surface_through_the_embedding_error() {
    let (mut store, id) = instantiate_wat(FAULTS, &Engine::default());
    let err = store
        .invoke(id, "unreachable", &[])
        .expect_err("trap");
    assert!(matches!(err, Error::Trap(Trap::Unreachable)));
    assert_eq!(err.to_string(), "Trapped on unreachable instruction");
}
