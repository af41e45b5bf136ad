// Numeric operator semantics shared by the code-unit executor and the interpreter.
//
// Operands and results travel as raw 64-bit payloads (see `Value::to_bits`),
// so both engines produce bit-identical results, NaN payloads included.

#![allow(
    clippy::cast_possible_truncation, // payloads are narrowed to the operator's kind
    clippy::cast_possible_wrap,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss, // int-to-float conversions round per IEEE 754
    clippy::float_cmp,
    clippy::too_many_lines
)]

use crate::Trap;
use crate::wasm::NumOp;

type NumResult = std::result::Result<u64, Trap>;

const F32_SIGN: u32 = 0x8000_0000;
const F64_SIGN: u64 = 0x8000_0000_0000_0000;

#[inline]
fn i32_of(bits: u64) -> i32 {
    bits as u32 as i32
}

#[inline]
fn u32_of(bits: u64) -> u32 {
    bits as u32
}

#[inline]
fn f32_of(bits: u64) -> f32 {
    f32::from_bits(bits as u32)
}

#[inline]
fn f64_of(bits: u64) -> f64 {
    f64::from_bits(bits)
}

#[inline]
fn from_i32(v: i32) -> u64 {
    u64::from(v as u32)
}

#[inline]
fn from_bool(v: bool) -> u64 {
    u64::from(v)
}

#[inline]
fn from_f32(v: f32) -> u64 {
    u64::from(v.to_bits())
}

#[inline]
fn from_f64(v: f64) -> u64 {
    v.to_bits()
}

/// Evaluate a numeric operator. `args` holds the operands in stack order
/// (first pushed first) and must match `op.params()` in length.
pub fn eval(op: NumOp, args: &[u64]) -> NumResult {
    match args {
        [x] => unary(op, *x),
        [x, y] => binary(op, *x, *y),
        _ => unreachable!("numeric operators take one or two operands"),
    }
}

fn unary(op: NumOp, x: u64) -> NumResult {
    use NumOp as N;
    Ok(match op {
        N::I32Eqz => from_bool(u32_of(x) == 0),
        N::I64Eqz => from_bool(x == 0),
        N::I32Clz => u64::from(u32_of(x).leading_zeros()),
        N::I32Ctz => u64::from(u32_of(x).trailing_zeros()),
        N::I32Popcnt => u64::from(u32_of(x).count_ones()),
        N::I64Clz => u64::from(x.leading_zeros()),
        N::I64Ctz => u64::from(x.trailing_zeros()),
        N::I64Popcnt => u64::from(x.count_ones()),

        N::F32Abs => u64::from(u32_of(x) & !F32_SIGN),
        N::F32Neg => u64::from(u32_of(x) ^ F32_SIGN),
        N::F32Ceil => from_f32(f32_of(x).ceil()),
        N::F32Floor => from_f32(f32_of(x).floor()),
        N::F32Trunc => from_f32(f32_of(x).trunc()),
        N::F32Nearest => from_f32(f32_of(x).round_ties_even()),
        N::F32Sqrt => from_f32(f32_of(x).sqrt()),
        N::F64Abs => x & !F64_SIGN,
        N::F64Neg => x ^ F64_SIGN,
        N::F64Ceil => from_f64(f64_of(x).ceil()),
        N::F64Floor => from_f64(f64_of(x).floor()),
        N::F64Trunc => from_f64(f64_of(x).trunc()),
        N::F64Nearest => from_f64(f64_of(x).round_ties_even()),
        N::F64Sqrt => from_f64(f64_of(x).sqrt()),

        N::I32WrapI64 => u64::from(x as u32),
        N::I32TruncF32S => from_i32(trunc_f32_to_i32(f32_of(x))?),
        N::I32TruncF32U => u64::from(trunc_f32_to_u32(f32_of(x))?),
        N::I32TruncF64S => from_i32(trunc_f64_to_i32(f64_of(x))?),
        N::I32TruncF64U => u64::from(trunc_f64_to_u32(f64_of(x))?),
        N::I64ExtendI32S => i64::from(i32_of(x)) as u64,
        N::I64ExtendI32U => u64::from(u32_of(x)),
        N::I64TruncF32S => trunc_f64_to_i64(f64::from(f32_of(x)))? as u64,
        N::I64TruncF32U => trunc_f64_to_u64(f64::from(f32_of(x)))?,
        N::I64TruncF64S => trunc_f64_to_i64(f64_of(x))? as u64,
        N::I64TruncF64U => trunc_f64_to_u64(f64_of(x))?,
        N::F32ConvertI32S => from_f32(i32_of(x) as f32),
        N::F32ConvertI32U => from_f32(u32_of(x) as f32),
        N::F32ConvertI64S => from_f32(x as i64 as f32),
        N::F32ConvertI64U => from_f32(x as f32),
        N::F32DemoteF64 => from_f32(f64_of(x) as f32),
        N::F64ConvertI32S => from_f64(f64::from(i32_of(x))),
        N::F64ConvertI32U => from_f64(f64::from(u32_of(x))),
        N::F64ConvertI64S => from_f64(x as i64 as f64),
        N::F64ConvertI64U => from_f64(x as f64),
        N::F64PromoteF32 => from_f64(f64::from(f32_of(x))),
        N::I32ReinterpretF32
        | N::I64ReinterpretF64
        | N::F32ReinterpretI32
        | N::F64ReinterpretI64 => x,

        N::I32Extend8S => from_i32(i32::from(x as i8)),
        N::I32Extend16S => from_i32(i32::from(x as i16)),
        N::I64Extend8S => i64::from(x as i8) as u64,
        N::I64Extend16S => i64::from(x as i16) as u64,
        N::I64Extend32S => i64::from(x as i32) as u64,

        // `as` saturates and maps NaN to zero, matching the saturating operators.
        N::I32TruncSatF32S => from_i32(f32_of(x) as i32),
        N::I32TruncSatF32U => u64::from(f32_of(x) as u32),
        N::I32TruncSatF64S => from_i32(f64_of(x) as i32),
        N::I32TruncSatF64U => u64::from(f64_of(x) as u32),
        N::I64TruncSatF32S => f32_of(x) as i64 as u64,
        N::I64TruncSatF32U => f32_of(x) as u64,
        N::I64TruncSatF64S => f64_of(x) as i64 as u64,
        N::I64TruncSatF64U => f64_of(x) as u64,

        other => unreachable!("{other} is not a unary operator"),
    })
}

fn binary(op: NumOp, x: u64, y: u64) -> NumResult {
    use NumOp as N;
    let (a32, b32) = (i32_of(x), i32_of(y));
    let (ua32, ub32) = (u32_of(x), u32_of(y));
    let (a64, b64) = (x as i64, y as i64);
    Ok(match op {
        N::I32Eq => from_bool(ua32 == ub32),
        N::I32Ne => from_bool(ua32 != ub32),
        N::I32LtS => from_bool(a32 < b32),
        N::I32LtU => from_bool(ua32 < ub32),
        N::I32GtS => from_bool(a32 > b32),
        N::I32GtU => from_bool(ua32 > ub32),
        N::I32LeS => from_bool(a32 <= b32),
        N::I32LeU => from_bool(ua32 <= ub32),
        N::I32GeS => from_bool(a32 >= b32),
        N::I32GeU => from_bool(ua32 >= ub32),
        N::I64Eq => from_bool(x == y),
        N::I64Ne => from_bool(x != y),
        N::I64LtS => from_bool(a64 < b64),
        N::I64LtU => from_bool(x < y),
        N::I64GtS => from_bool(a64 > b64),
        N::I64GtU => from_bool(x > y),
        N::I64LeS => from_bool(a64 <= b64),
        N::I64LeU => from_bool(x <= y),
        N::I64GeS => from_bool(a64 >= b64),
        N::I64GeU => from_bool(x >= y),
        N::F32Eq => from_bool(f32_of(x) == f32_of(y)),
        N::F32Ne => from_bool(f32_of(x) != f32_of(y)),
        N::F32Lt => from_bool(f32_of(x) < f32_of(y)),
        N::F32Gt => from_bool(f32_of(x) > f32_of(y)),
        N::F32Le => from_bool(f32_of(x) <= f32_of(y)),
        N::F32Ge => from_bool(f32_of(x) >= f32_of(y)),
        N::F64Eq => from_bool(f64_of(x) == f64_of(y)),
        N::F64Ne => from_bool(f64_of(x) != f64_of(y)),
        N::F64Lt => from_bool(f64_of(x) < f64_of(y)),
        N::F64Gt => from_bool(f64_of(x) > f64_of(y)),
        N::F64Le => from_bool(f64_of(x) <= f64_of(y)),
        N::F64Ge => from_bool(f64_of(x) >= f64_of(y)),

        N::I32Add => u64::from(ua32.wrapping_add(ub32)),
        N::I32Sub => u64::from(ua32.wrapping_sub(ub32)),
        N::I32Mul => u64::from(ua32.wrapping_mul(ub32)),
        N::I32DivS => {
            if b32 == 0 {
                return Err(Trap::IntegerDivideByZero);
            }
            if a32 == i32::MIN && b32 == -1 {
                return Err(Trap::IntegerOverflow);
            }
            from_i32(a32 / b32)
        }
        N::I32DivU => u64::from(ua32.checked_div(ub32).ok_or(Trap::IntegerDivideByZero)?),
        N::I32RemS => {
            if b32 == 0 {
                return Err(Trap::IntegerDivideByZero);
            }
            from_i32(a32.wrapping_rem(b32))
        }
        N::I32RemU => u64::from(ua32.checked_rem(ub32).ok_or(Trap::IntegerDivideByZero)?),
        N::I32And => u64::from(ua32 & ub32),
        N::I32Or => u64::from(ua32 | ub32),
        N::I32Xor => u64::from(ua32 ^ ub32),
        N::I32Shl => u64::from(ua32.wrapping_shl(ub32)),
        N::I32ShrS => from_i32(a32.wrapping_shr(ub32)),
        N::I32ShrU => u64::from(ua32.wrapping_shr(ub32)),
        N::I32Rotl => u64::from(ua32.rotate_left(ub32 % 32)),
        N::I32Rotr => u64::from(ua32.rotate_right(ub32 % 32)),

        N::I64Add => x.wrapping_add(y),
        N::I64Sub => x.wrapping_sub(y),
        N::I64Mul => x.wrapping_mul(y),
        N::I64DivS => {
            if b64 == 0 {
                return Err(Trap::IntegerDivideByZero);
            }
            if a64 == i64::MIN && b64 == -1 {
                return Err(Trap::IntegerOverflow);
            }
            (a64 / b64) as u64
        }
        N::I64DivU => x.checked_div(y).ok_or(Trap::IntegerDivideByZero)?,
        N::I64RemS => {
            if b64 == 0 {
                return Err(Trap::IntegerDivideByZero);
            }
            a64.wrapping_rem(b64) as u64
        }
        N::I64RemU => x.checked_rem(y).ok_or(Trap::IntegerDivideByZero)?,
        N::I64And => x & y,
        N::I64Or => x | y,
        N::I64Xor => x ^ y,
        N::I64Shl => x.wrapping_shl(y as u32),
        N::I64ShrS => a64.wrapping_shr(y as u32) as u64,
        N::I64ShrU => x.wrapping_shr(y as u32),
        N::I64Rotl => x.rotate_left((y % 64) as u32),
        N::I64Rotr => x.rotate_right((y % 64) as u32),

        N::F32Add => from_f32(f32_of(x) + f32_of(y)),
        N::F32Sub => from_f32(f32_of(x) - f32_of(y)),
        N::F32Mul => from_f32(f32_of(x) * f32_of(y)),
        N::F32Div => from_f32(f32_of(x) / f32_of(y)),
        N::F32Min => from_f32(f32_min(f32_of(x), f32_of(y))),
        N::F32Max => from_f32(f32_max(f32_of(x), f32_of(y))),
        N::F32Copysign => u64::from((u32_of(x) & !F32_SIGN) | (u32_of(y) & F32_SIGN)),
        N::F64Add => from_f64(f64_of(x) + f64_of(y)),
        N::F64Sub => from_f64(f64_of(x) - f64_of(y)),
        N::F64Mul => from_f64(f64_of(x) * f64_of(y)),
        N::F64Div => from_f64(f64_of(x) / f64_of(y)),
        N::F64Min => from_f64(f64_min(f64_of(x), f64_of(y))),
        N::F64Max => from_f64(f64_max(f64_of(x), f64_of(y))),
        N::F64Copysign => (x & !F64_SIGN) | (y & F64_SIGN),

        other => unreachable!("{other} is not a binary operator"),
    })
}

fn f32_min(a: f32, b: f32) -> f32 {
    if a.is_nan() || b.is_nan() {
        f32::NAN
    } else if a == b {
        // -0.0 < +0.0
        f32::from_bits(a.to_bits() | b.to_bits())
    } else {
        a.min(b)
    }
}

fn f32_max(a: f32, b: f32) -> f32 {
    if a.is_nan() || b.is_nan() {
        f32::NAN
    } else if a == b {
        f32::from_bits(a.to_bits() & b.to_bits())
    } else {
        a.max(b)
    }
}

fn f64_min(a: f64, b: f64) -> f64 {
    if a.is_nan() || b.is_nan() {
        f64::NAN
    } else if a == b {
        f64::from_bits(a.to_bits() | b.to_bits())
    } else {
        a.min(b)
    }
}

fn f64_max(a: f64, b: f64) -> f64 {
    if a.is_nan() || b.is_nan() {
        f64::NAN
    } else if a == b {
        f64::from_bits(a.to_bits() & b.to_bits())
    } else {
        a.max(b)
    }
}

fn trunc_f32_to_i32(v: f32) -> Result<i32, Trap> {
    if v.is_nan() {
        return Err(Trap::InvalidConversion);
    }
    let t = v.trunc();
    if t < -2_147_483_648.0 || t >= 2_147_483_648.0 {
        return Err(Trap::IntegerOverflow);
    }
    Ok(t as i32)
}

fn trunc_f32_to_u32(v: f32) -> Result<u32, Trap> {
    if v.is_nan() {
        return Err(Trap::InvalidConversion);
    }
    let t = v.trunc();
    if t <= -1.0 || t >= 4_294_967_296.0 {
        return Err(Trap::IntegerOverflow);
    }
    Ok(t as u32)
}

fn trunc_f64_to_i32(v: f64) -> Result<i32, Trap> {
    if v.is_nan() {
        return Err(Trap::InvalidConversion);
    }
    let t = v.trunc();
    if t < -2_147_483_648.0 || t > 2_147_483_647.0 {
        return Err(Trap::IntegerOverflow);
    }
    Ok(t as i32)
}

fn trunc_f64_to_u32(v: f64) -> Result<u32, Trap> {
    if v.is_nan() {
        return Err(Trap::InvalidConversion);
    }
    let t = v.trunc();
    if t <= -1.0 || t > 4_294_967_295.0 {
        return Err(Trap::IntegerOverflow);
    }
    Ok(t as u32)
}

fn trunc_f64_to_i64(v: f64) -> Result<i64, Trap> {
    if v.is_nan() {
        return Err(Trap::InvalidConversion);
    }
    let t = v.trunc();
    if t < -9_223_372_036_854_775_808.0 || t >= 9_223_372_036_854_775_808.0 {
        return Err(Trap::IntegerOverflow);
    }
    Ok(t as i64)
}

fn trunc_f64_to_u64(v: f64) -> Result<u64, Trap> {
    if v.is_nan() {
        return Err(Trap::InvalidConversion);
    }
    let t = v.trunc();
    if t <= -1.0 || t >= 18_446_744_073_709_551_616.0 {
        return Err(Trap::IntegerOverflow);
    }
    Ok(t as u64)
}
