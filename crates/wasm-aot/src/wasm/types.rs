// Value kinds, function types and runtime values.
//
// Every kind has a fixed width on the target machine: I32/F32 take one 32-bit
// slot, I64/F64 and references take two.

use std::fmt;

use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    I32,
    I64,
    F32,
    F64,
    FuncRef,
    ExternRef,
}

impl ValueKind {
    /// Number of target-machine slots occupied by a value of this kind.
    #[must_use]
    pub const fn slots(self) -> usize {
        match self {
            Self::I32 | Self::F32 => 1,
            Self::I64 | Self::F64 | Self::FuncRef | Self::ExternRef => 2,
        }
    }

    #[must_use]
    pub const fn is_ref(self) -> bool {
        matches!(self, Self::FuncRef | Self::ExternRef)
    }

    #[must_use]
    pub const fn default_value(self) -> Value {
        match self {
            Self::I32 => Value::I32(0),
            Self::I64 => Value::I64(0),
            Self::F32 => Value::F32(0),
            Self::F64 => Value::F64(0),
            Self::FuncRef => Value::FuncRef(None),
            Self::ExternRef => Value::ExternRef(None),
        }
    }

    pub fn from_val_type(ty: wasmparser::ValType) -> Result<Self> {
        match ty {
            wasmparser::ValType::I32 => Ok(Self::I32),
            wasmparser::ValType::I64 => Ok(Self::I64),
            wasmparser::ValType::F32 => Ok(Self::F32),
            wasmparser::ValType::F64 => Ok(Self::F64),
            wasmparser::ValType::V128 => Err(Error::Unsupported("SIMD (v128)".to_string())),
            wasmparser::ValType::Ref(r) => Self::from_ref_type(r),
        }
    }

    pub fn from_ref_type(ty: wasmparser::RefType) -> Result<Self> {
        if ty.is_func_ref() {
            Ok(Self::FuncRef)
        } else if ty.is_extern_ref() {
            Ok(Self::ExternRef)
        } else {
            Err(Error::Unsupported(format!("reference type {ty:?}")))
        }
    }

    /// Total slot width of a sequence of kinds.
    #[must_use]
    pub fn slot_count(kinds: &[ValueKind]) -> usize {
        kinds.iter().map(|k| k.slots()).sum()
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::I32 => "i32",
            Self::I64 => "i64",
            Self::F32 => "f32",
            Self::F64 => "f64",
            Self::FuncRef => "funcref",
            Self::ExternRef => "externref",
        };
        f.write_str(name)
    }
}

/// Parameter and result kinds of a function or block.
///
/// Compared structurally: two separately declared types with the same
/// parameter and result lists are the same type for indirect calls.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct FunctionType {
    pub params: Vec<ValueKind>,
    pub results: Vec<ValueKind>,
}

impl FunctionType {
    #[must_use]
    pub fn new(params: Vec<ValueKind>, results: Vec<ValueKind>) -> Self {
        Self { params, results }
    }

    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn returning(kind: ValueKind) -> Self {
        Self {
            params: Vec::new(),
            results: vec![kind],
        }
    }

    #[must_use]
    pub fn param_slots(&self) -> usize {
        ValueKind::slot_count(&self.params)
    }

    #[must_use]
    pub fn result_slots(&self) -> usize {
        ValueKind::slot_count(&self.results)
    }
}

impl fmt::Display for FunctionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let join = |kinds: &[ValueKind]| {
            kinds
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(" ")
        };
        write!(f, "[{}] -> [{}]", join(&self.params), join(&self.results))
    }
}

/// Identifies an instance inside a [`crate::Store`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceId(pub u32);

/// A non-null function reference: the owning instance plus its function index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FuncRef {
    pub instance: InstanceId,
    pub index: u32,
}

/// A runtime value. Floats are kept as raw bits so NaN payloads compare exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Value {
    I32(i32),
    I64(i64),
    F32(u32),
    F64(u64),
    FuncRef(Option<FuncRef>),
    ExternRef(Option<u32>),
}

const NULL_REF: u64 = u64::MAX;

impl Value {
    #[must_use]
    pub const fn kind(&self) -> ValueKind {
        match self {
            Self::I32(_) => ValueKind::I32,
            Self::I64(_) => ValueKind::I64,
            Self::F32(_) => ValueKind::F32,
            Self::F64(_) => ValueKind::F64,
            Self::FuncRef(_) => ValueKind::FuncRef,
            Self::ExternRef(_) => ValueKind::ExternRef,
        }
    }

    #[must_use]
    pub fn from_f32(v: f32) -> Self {
        Self::F32(v.to_bits())
    }

    #[must_use]
    pub fn from_f64(v: f64) -> Self {
        Self::F64(v.to_bits())
    }

    #[must_use]
    pub const fn as_i32(&self) -> Option<i32> {
        match self {
            Self::I32(v) => Some(*v),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_i64(&self) -> Option<i64> {
        match self {
            Self::I64(v) => Some(*v),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_f32(&self) -> Option<f32> {
        match self {
            Self::F32(v) => Some(f32::from_bits(*v)),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::F64(v) => Some(f64::from_bits(*v)),
            _ => None,
        }
    }

    /// Raw 64-bit representation used by the slot machine. References pack
    /// `(instance << 32) | index`, with `u64::MAX` standing for null.
    #[must_use]
    #[allow(clippy::cast_sign_loss)]
    pub fn to_bits(&self) -> u64 {
        match *self {
            Self::I32(v) => u64::from(v as u32),
            Self::I64(v) => v as u64,
            Self::F32(v) => u64::from(v),
            Self::F64(v) => v,
            Self::FuncRef(None) | Self::ExternRef(None) => NULL_REF,
            Self::FuncRef(Some(r)) => (u64::from(r.instance.0) << 32) | u64::from(r.index),
            Self::ExternRef(Some(v)) => u64::from(v),
        }
    }

    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)] // payloads are truncated by kind
    pub fn from_bits(kind: ValueKind, bits: u64) -> Self {
        match kind {
            ValueKind::I32 => Self::I32(bits as u32 as i32),
            ValueKind::I64 => Self::I64(bits as i64),
            ValueKind::F32 => Self::F32(bits as u32),
            ValueKind::F64 => Self::F64(bits),
            ValueKind::FuncRef if bits == NULL_REF => Self::FuncRef(None),
            ValueKind::FuncRef => Self::FuncRef(Some(FuncRef {
                instance: InstanceId((bits >> 32) as u32),
                index: bits as u32,
            })),
            ValueKind::ExternRef if bits == NULL_REF => Self::ExternRef(None),
            ValueKind::ExternRef => Self::ExternRef(Some(bits as u32)),
        }
    }

    #[must_use]
    pub const fn is_null_ref(&self) -> bool {
        matches!(self, Self::FuncRef(None) | Self::ExternRef(None))
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::I32(v) => write!(f, "{v}:i32"),
            Self::I64(v) => write!(f, "{v}:i64"),
            Self::F32(v) => write!(f, "{}:f32", f32::from_bits(*v)),
            Self::F64(v) => write!(f, "{}:f64", f64::from_bits(*v)),
            Self::FuncRef(None) | Self::ExternRef(None) => f.write_str("null"),
            Self::FuncRef(Some(r)) => write!(f, "func[{}:{}]", r.instance.0, r.index),
            Self::ExternRef(Some(v)) => write!(f, "extern[{v}]"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_widths() {
        assert_eq!(ValueKind::I32.slots(), 1);
        assert_eq!(ValueKind::F32.slots(), 1);
        assert_eq!(ValueKind::I64.slots(), 2);
        assert_eq!(ValueKind::F64.slots(), 2);
        assert_eq!(ValueKind::FuncRef.slots(), 2);
        let ty = FunctionType::new(
            vec![ValueKind::I32, ValueKind::I64, ValueKind::F32],
            vec![ValueKind::F64],
        );
        assert_eq!(ty.param_slots(), 4);
        assert_eq!(ty.result_slots(), 2);
    }

    #[test]
    fn test_function_types_compare_structurally() {
        let a = FunctionType::new(vec![ValueKind::I32], vec![ValueKind::I32]);
        let b = FunctionType::new(vec![ValueKind::I32], vec![ValueKind::I32]);
        let c = FunctionType::new(vec![ValueKind::I64], vec![ValueKind::I32]);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.to_string(), "[i32] -> [i32]");
    }

    #[test]
    fn test_bits_preserve_values() {
        let values = [
            Value::I32(-7),
            Value::I64(i64::MIN),
            Value::F32(0x7fc0_0001),
            Value::F64(f64::NEG_INFINITY.to_bits()),
            Value::FuncRef(None),
            Value::FuncRef(Some(FuncRef {
                instance: InstanceId(3),
                index: 17,
            })),
            Value::ExternRef(Some(5)),
        ];
        for value in values {
            assert_eq!(Value::from_bits(value.kind(), value.to_bits()), value);
        }
    }
}
