//! Property-based tests: compiled and interpreted arithmetic agree with
//! each other and with Rust's wrapping semantics for random operands.

use std::fmt::Write;

use proptest::prelude::*;
use wasm_aot::test_harness::*;
use wasm_aot::{Engine, Error, InstanceId, Store, Trap, Value};

const I32_OPS: &[&str] = &[
    "add", "sub", "mul", "div_s", "div_u", "rem_s", "rem_u", "and", "or", "xor", "shl", "shr_s",
    "shr_u", "rotl", "rotr", "eq", "lt_s", "ge_u",
];

const I64_OPS: &[&str] = &["add", "sub", "mul", "div_s", "rem_u", "shl", "rotr", "lt_u"];

/// One export per operator, named `{ty}.{op}`.
fn arithmetic_module() -> String {
    let mut wat = String::from("(module\n");
    for (ty, ops) in [("i32", I32_OPS), ("i64", I64_OPS)] {
        for op in ops {
            let result = if ["eq", "lt_s", "ge_u", "lt_u"].contains(op) {
                "i32"
            } else {
                ty
            };
            writeln!(
                wat,
                "(func (export \"{ty}.{op}\") (param {ty} {ty}) (result {result}) \
                 local.get 0 local.get 1 {ty}.{op})"
            )
            .expect("write");
        }
    }
    wat.push(')');
    wat
}

struct Engines {
    stores: Vec<(Store, InstanceId)>,
}

impl Engines {
    fn new() -> Self {
        let wat = arithmetic_module();
        Self {
            stores: [Engine::default(), Engine::Interpreted]
                .iter()
                .map(|engine| instantiate_wat(&wat, engine))
                .collect(),
        }
    }

    /// Results of every engine, checked to be identical.
    fn call(&mut self, name: &str, args: &[Value]) -> Result<Vec<Value>, Trap> {
        let mut outcomes = self.stores.iter_mut().map(|(store, id)| {
            match store.invoke(*id, name, args) {
                Ok(values) => Ok(values),
                Err(Error::Trap(trap)) => Err(trap),
                Err(e) => panic!("{name}: {e}"),
            }
        });
        let first = outcomes.next().expect("engine");
        for other in outcomes {
            assert_eq!(other, first, "engines disagree on {name}{args:?}");
        }
        first
    }
}

fn i32_reference(op: &str, a: i32, b: i32) -> Result<i32, Trap> {
    let (ua, ub) = (a as u32, b as u32);
    Ok(match op {
        "add" => a.wrapping_add(b),
        "sub" => a.wrapping_sub(b),
        "mul" => a.wrapping_mul(b),
        "div_s" => {
            if b == 0 {
                return Err(Trap::IntegerDivideByZero);
            }
            a.checked_div(b).ok_or(Trap::IntegerOverflow)?
        }
        "div_u" => ua.checked_div(ub).ok_or(Trap::IntegerDivideByZero)? as i32,
        "rem_s" => {
            if b == 0 {
                return Err(Trap::IntegerDivideByZero);
            }
            a.wrapping_rem(b)
        }
        "rem_u" => ua.checked_rem(ub).ok_or(Trap::IntegerDivideByZero)? as i32,
        "and" => a & b,
        "or" => a | b,
        "xor" => a ^ b,
        "shl" => a.wrapping_shl(ub),
        "shr_s" => a.wrapping_shr(ub),
        "shr_u" => ua.wrapping_shr(ub) as i32,
        "rotl" => ua.rotate_left(ub % 32) as i32,
        "rotr" => ua.rotate_right(ub % 32) as i32,
        "eq" => i32::from(a == b),
        "lt_s" => i32::from(a < b),
        "ge_u" => i32::from(ua >= ub),
        other => panic!("no reference for i32.{other}"),
    })
}

fn i64_reference(op: &str, a: i64, b: i64) -> Result<Value, Trap> {
    let (ua, ub) = (a as u64, b as u64);
    Ok(match op {
        "add" => Value::I64(a.wrapping_add(b)),
        "sub" => Value::I64(a.wrapping_sub(b)),
        "mul" => Value::I64(a.wrapping_mul(b)),
        "div_s" => {
            if b == 0 {
                return Err(Trap::IntegerDivideByZero);
            }
            Value::I64(a.checked_div(b).ok_or(Trap::IntegerOverflow)?)
        }
        "rem_u" => Value::I64(ua.checked_rem(ub).ok_or(Trap::IntegerDivideByZero)? as i64),
        "shl" => Value::I64(a.wrapping_shl(ub as u32)),
        "rotr" => Value::I64(ua.rotate_right((ub % 64) as u32) as i64),
        "lt_u" => Value::I32(i32::from(ua < ub)),
        other => panic!("no reference for i64.{other}"),
    })
}

fn edge_i32() -> impl Strategy<Value = i32> {
    prop_oneof![
        Just(0),
        Just(-1),
        Just(1),
        Just(i32::MIN),
        Just(i32::MAX),
        0i32..64,
        any::<i32>(),
    ]
}

fn edge_i64() -> impl Strategy<Value = i64> {
    prop_oneof![
        Just(0),
        Just(-1),
        Just(i64::MIN),
        Just(i64::MAX),
        0i64..128,
        any::<i64>(),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn test_i32_operators_agree(a in edge_i32(), b in edge_i32()) {
        let mut engines = Engines::new();
        for op in I32_OPS {
            let got = engines.call(&format!("i32.{op}"), &[Value::I32(a), Value::I32(b)]);
            let expected = i32_reference(op, a, b).map(|v| vec![Value::I32(v)]);
            prop_assert_eq!(got, expected, "i32.{}({}, {})", op, a, b);
        }
    }

    #[test]
    fn test_i64_operators_agree(a in edge_i64(), b in edge_i64()) {
        let mut engines = Engines::new();
        for op in I64_OPS {
            let got = engines.call(&format!("i64.{op}"), &[Value::I64(a), Value::I64(b)]);
            let expected = i64_reference(op, a, b).map(|v| vec![v]);
            prop_assert_eq!(got, expected, "i64.{}({}, {})", op, a, b);
        }
    }

    #[test]
    fn test_sum_loop_matches_closed_form(n in 0i32..2_000) {
        let wat = r#"(module
            (func (export "sum") (param $n i32) (result i64)
                (local $acc i64)
                block $done
                    loop $next
                        local.get $n
                        i32.eqz
                        br_if $done
                        local.get $acc
                        local.get $n
                        i64.extend_i32_u
                        i64.add
                        local.set $acc
                        local.get $n
                        i32.const 1
                        i32.sub
                        local.set $n
                        br $next
                    end
                end
                local.get $acc))"#;
        let expected = i64::from(n) * (i64::from(n) + 1) / 2;
        for engine in [Engine::default(), Engine::Interpreted] {
            let (mut store, id) = instantiate_wat(wat, &engine);
            let got = store.invoke(id, "sum", &[Value::I32(n)]).expect("sum");
            prop_assert_eq!(got, vec![Value::I64(expected)]);
        }
    }

    #[test]
    fn test_compilation_never_panics_on_straight_line_code(ops in prop::collection::vec(0u8..6, 0..64)) {
        let mut body = String::from("i32.const 1\n");
        for op in ops {
            body.push_str(match op {
                0 => "i32.const 3 i32.add\n",
                1 => "i32.const 5 i32.mul\n",
                2 => "i32.eqz\n",
                3 => "i64.extend_i32_u i32.wrap_i64\n",
                4 => "i32.const 7 i32.xor\n",
                _ => "i32.const 1 i32.rotl\n",
            });
        }
        let wat = format!("(module (func (export \"main\") (result i32)\n{body}))");
        let compiled = compile_wat(&wat, &wasm_aot::CompileOptions::default());
        prop_assert!(compiled.is_ok());

        let (mut a, ia) = instantiate_wat(&wat, &Engine::default());
        let (mut b, ib) = instantiate_wat(&wat, &Engine::Interpreted);
        prop_assert_eq!(
            a.invoke(ia, "main", &[]).expect("compiled"),
            b.invoke(ib, "main", &[]).expect("interpreted")
        );
    }
}
