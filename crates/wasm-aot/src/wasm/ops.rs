// Decoded WASM operators.
//
// Numeric operators are grouped into `NumOp`, whose stack effect is fixed and
// table-driven. Everything else has its own `Op` variant.

use std::fmt;

use super::ValueKind;

macro_rules! num_ops {
    ($($name:ident: [$($param:ident),+] -> $result:ident, $text:literal;)*) => {
        /// A numeric operator with a fixed `[params] -> [result]` stack effect.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum NumOp {
            $($name,)*
        }

        impl NumOp {
            pub const ALL: &'static [NumOp] = &[$(NumOp::$name,)*];

            #[must_use]
            pub const fn params(self) -> &'static [ValueKind] {
                match self {
                    $(NumOp::$name => &[$(ValueKind::$param),+],)*
                }
            }

            #[must_use]
            pub const fn result(self) -> ValueKind {
                match self {
                    $(NumOp::$name => ValueKind::$result,)*
                }
            }

            #[must_use]
            pub const fn name(self) -> &'static str {
                match self {
                    $(NumOp::$name => $text,)*
                }
            }

            #[must_use]
            pub fn from_operator(op: &wasmparser::Operator<'_>) -> Option<Self> {
                match op {
                    $(wasmparser::Operator::$name => Some(NumOp::$name),)*
                    _ => None,
                }
            }
        }
    };
}

num_ops! {
    I32Eqz: [I32] -> I32, "i32.eqz";
    I32Eq: [I32, I32] -> I32, "i32.eq";
    I32Ne: [I32, I32] -> I32, "i32.ne";
    I32LtS: [I32, I32] -> I32, "i32.lt_s";
    I32LtU: [I32, I32] -> I32, "i32.lt_u";
    I32GtS: [I32, I32] -> I32, "i32.gt_s";
    I32GtU: [I32, I32] -> I32, "i32.gt_u";
    I32LeS: [I32, I32] -> I32, "i32.le_s";
    I32LeU: [I32, I32] -> I32, "i32.le_u";
    I32GeS: [I32, I32] -> I32, "i32.ge_s";
    I32GeU: [I32, I32] -> I32, "i32.ge_u";
    I64Eqz: [I64] -> I32, "i64.eqz";
    I64Eq: [I64, I64] -> I32, "i64.eq";
    I64Ne: [I64, I64] -> I32, "i64.ne";
    I64LtS: [I64, I64] -> I32, "i64.lt_s";
    I64LtU: [I64, I64] -> I32, "i64.lt_u";
    I64GtS: [I64, I64] -> I32, "i64.gt_s";
    I64GtU: [I64, I64] -> I32, "i64.gt_u";
    I64LeS: [I64, I64] -> I32, "i64.le_s";
    I64LeU: [I64, I64] -> I32, "i64.le_u";
    I64GeS: [I64, I64] -> I32, "i64.ge_s";
    I64GeU: [I64, I64] -> I32, "i64.ge_u";
    F32Eq: [F32, F32] -> I32, "f32.eq";
    F32Ne: [F32, F32] -> I32, "f32.ne";
    F32Lt: [F32, F32] -> I32, "f32.lt";
    F32Gt: [F32, F32] -> I32, "f32.gt";
    F32Le: [F32, F32] -> I32, "f32.le";
    F32Ge: [F32, F32] -> I32, "f32.ge";
    F64Eq: [F64, F64] -> I32, "f64.eq";
    F64Ne: [F64, F64] -> I32, "f64.ne";
    F64Lt: [F64, F64] -> I32, "f64.lt";
    F64Gt: [F64, F64] -> I32, "f64.gt";
    F64Le: [F64, F64] -> I32, "f64.le";
    F64Ge: [F64, F64] -> I32, "f64.ge";
    I32Clz: [I32] -> I32, "i32.clz";
    I32Ctz: [I32] -> I32, "i32.ctz";
    I32Popcnt: [I32] -> I32, "i32.popcnt";
    I32Add: [I32, I32] -> I32, "i32.add";
    I32Sub: [I32, I32] -> I32, "i32.sub";
    I32Mul: [I32, I32] -> I32, "i32.mul";
    I32DivS: [I32, I32] -> I32, "i32.div_s";
    I32DivU: [I32, I32] -> I32, "i32.div_u";
    I32RemS: [I32, I32] -> I32, "i32.rem_s";
    I32RemU: [I32, I32] -> I32, "i32.rem_u";
    I32And: [I32, I32] -> I32, "i32.and";
    I32Or: [I32, I32] -> I32, "i32.or";
    I32Xor: [I32, I32] -> I32, "i32.xor";
    I32Shl: [I32, I32] -> I32, "i32.shl";
    I32ShrS: [I32, I32] -> I32, "i32.shr_s";
    I32ShrU: [I32, I32] -> I32, "i32.shr_u";
    I32Rotl: [I32, I32] -> I32, "i32.rotl";
    I32Rotr: [I32, I32] -> I32, "i32.rotr";
    I64Clz: [I64] -> I64, "i64.clz";
    I64Ctz: [I64] -> I64, "i64.ctz";
    I64Popcnt: [I64] -> I64, "i64.popcnt";
    I64Add: [I64, I64] -> I64, "i64.add";
    I64Sub: [I64, I64] -> I64, "i64.sub";
    I64Mul: [I64, I64] -> I64, "i64.mul";
    I64DivS: [I64, I64] -> I64, "i64.div_s";
    I64DivU: [I64, I64] -> I64, "i64.div_u";
    I64RemS: [I64, I64] -> I64, "i64.rem_s";
    I64RemU: [I64, I64] -> I64, "i64.rem_u";
    I64And: [I64, I64] -> I64, "i64.and";
    I64Or: [I64, I64] -> I64, "i64.or";
    I64Xor: [I64, I64] -> I64, "i64.xor";
    I64Shl: [I64, I64] -> I64, "i64.shl";
    I64ShrS: [I64, I64] -> I64, "i64.shr_s";
    I64ShrU: [I64, I64] -> I64, "i64.shr_u";
    I64Rotl: [I64, I64] -> I64, "i64.rotl";
    I64Rotr: [I64, I64] -> I64, "i64.rotr";
    F32Abs: [F32] -> F32, "f32.abs";
    F32Neg: [F32] -> F32, "f32.neg";
    F32Ceil: [F32] -> F32, "f32.ceil";
    F32Floor: [F32] -> F32, "f32.floor";
    F32Trunc: [F32] -> F32, "f32.trunc";
    F32Nearest: [F32] -> F32, "f32.nearest";
    F32Sqrt: [F32] -> F32, "f32.sqrt";
    F32Add: [F32, F32] -> F32, "f32.add";
    F32Sub: [F32, F32] -> F32, "f32.sub";
    F32Mul: [F32, F32] -> F32, "f32.mul";
    F32Div: [F32, F32] -> F32, "f32.div";
    F32Min: [F32, F32] -> F32, "f32.min";
    F32Max: [F32, F32] -> F32, "f32.max";
    F32Copysign: [F32, F32] -> F32, "f32.copysign";
    F64Abs: [F64] -> F64, "f64.abs";
    F64Neg: [F64] -> F64, "f64.neg";
    F64Ceil: [F64] -> F64, "f64.ceil";
    F64Floor: [F64] -> F64, "f64.floor";
    F64Trunc: [F64] -> F64, "f64.trunc";
    F64Nearest: [F64] -> F64, "f64.nearest";
    F64Sqrt: [F64] -> F64, "f64.sqrt";
    F64Add: [F64, F64] -> F64, "f64.add";
    F64Sub: [F64, F64] -> F64, "f64.sub";
    F64Mul: [F64, F64] -> F64, "f64.mul";
    F64Div: [F64, F64] -> F64, "f64.div";
    F64Min: [F64, F64] -> F64, "f64.min";
    F64Max: [F64, F64] -> F64, "f64.max";
    F64Copysign: [F64, F64] -> F64, "f64.copysign";
    I32WrapI64: [I64] -> I32, "i32.wrap_i64";
    I32TruncF32S: [F32] -> I32, "i32.trunc_f32_s";
    I32TruncF32U: [F32] -> I32, "i32.trunc_f32_u";
    I32TruncF64S: [F64] -> I32, "i32.trunc_f64_s";
    I32TruncF64U: [F64] -> I32, "i32.trunc_f64_u";
    I64ExtendI32S: [I32] -> I64, "i64.extend_i32_s";
    I64ExtendI32U: [I32] -> I64, "i64.extend_i32_u";
    I64TruncF32S: [F32] -> I64, "i64.trunc_f32_s";
    I64TruncF32U: [F32] -> I64, "i64.trunc_f32_u";
    I64TruncF64S: [F64] -> I64, "i64.trunc_f64_s";
    I64TruncF64U: [F64] -> I64, "i64.trunc_f64_u";
    F32ConvertI32S: [I32] -> F32, "f32.convert_i32_s";
    F32ConvertI32U: [I32] -> F32, "f32.convert_i32_u";
    F32ConvertI64S: [I64] -> F32, "f32.convert_i64_s";
    F32ConvertI64U: [I64] -> F32, "f32.convert_i64_u";
    F32DemoteF64: [F64] -> F32, "f32.demote_f64";
    F64ConvertI32S: [I32] -> F64, "f64.convert_i32_s";
    F64ConvertI32U: [I32] -> F64, "f64.convert_i32_u";
    F64ConvertI64S: [I64] -> F64, "f64.convert_i64_s";
    F64ConvertI64U: [I64] -> F64, "f64.convert_i64_u";
    F64PromoteF32: [F32] -> F64, "f64.promote_f32";
    I32ReinterpretF32: [F32] -> I32, "i32.reinterpret_f32";
    I64ReinterpretF64: [F64] -> I64, "i64.reinterpret_f64";
    F32ReinterpretI32: [I32] -> F32, "f32.reinterpret_i32";
    F64ReinterpretI64: [I64] -> F64, "f64.reinterpret_i64";
    I32Extend8S: [I32] -> I32, "i32.extend8_s";
    I32Extend16S: [I32] -> I32, "i32.extend16_s";
    I64Extend8S: [I64] -> I64, "i64.extend8_s";
    I64Extend16S: [I64] -> I64, "i64.extend16_s";
    I64Extend32S: [I64] -> I64, "i64.extend32_s";
    I32TruncSatF32S: [F32] -> I32, "i32.trunc_sat_f32_s";
    I32TruncSatF32U: [F32] -> I32, "i32.trunc_sat_f32_u";
    I32TruncSatF64S: [F64] -> I32, "i32.trunc_sat_f64_s";
    I32TruncSatF64U: [F64] -> I32, "i32.trunc_sat_f64_u";
    I64TruncSatF32S: [F32] -> I64, "i64.trunc_sat_f32_s";
    I64TruncSatF32U: [F32] -> I64, "i64.trunc_sat_f32_u";
    I64TruncSatF64S: [F64] -> I64, "i64.trunc_sat_f64_s";
    I64TruncSatF64U: [F64] -> I64, "i64.trunc_sat_f64_u";
}

impl NumOp {
    /// Stable encoding used by the target machine's numeric helper instruction.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)] // fewer than 256 operators
    pub const fn code(self) -> u8 {
        self as u8
    }

    #[must_use]
    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.get(usize::from(code)).copied()
    }
}

impl fmt::Display for NumOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoadKind {
    I32,
    I64,
    F32,
    F64,
    I32_8S,
    I32_8U,
    I32_16S,
    I32_16U,
    I64_8S,
    I64_8U,
    I64_16S,
    I64_16U,
    I64_32S,
    I64_32U,
}

impl LoadKind {
    pub const ALL: [LoadKind; 14] = [
        Self::I32,
        Self::I64,
        Self::F32,
        Self::F64,
        Self::I32_8S,
        Self::I32_8U,
        Self::I32_16S,
        Self::I32_16U,
        Self::I64_8S,
        Self::I64_8U,
        Self::I64_16S,
        Self::I64_16U,
        Self::I64_32S,
        Self::I64_32U,
    ];

    #[must_use]
    pub const fn result(self) -> ValueKind {
        match self {
            Self::I32 | Self::I32_8S | Self::I32_8U | Self::I32_16S | Self::I32_16U => {
                ValueKind::I32
            }
            Self::F32 => ValueKind::F32,
            Self::F64 => ValueKind::F64,
            _ => ValueKind::I64,
        }
    }

    /// Bytes read from memory.
    #[must_use]
    pub const fn width(self) -> usize {
        match self {
            Self::I32_8S | Self::I32_8U | Self::I64_8S | Self::I64_8U => 1,
            Self::I32_16S | Self::I32_16U | Self::I64_16S | Self::I64_16U => 2,
            Self::I32 | Self::F32 | Self::I64_32S | Self::I64_32U => 4,
            Self::I64 | Self::F64 => 8,
        }
    }

    #[must_use]
    pub const fn signed(self) -> bool {
        matches!(
            self,
            Self::I32_8S | Self::I32_16S | Self::I64_8S | Self::I64_16S | Self::I64_32S
        )
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::I32 => "i32.load",
            Self::I64 => "i64.load",
            Self::F32 => "f32.load",
            Self::F64 => "f64.load",
            Self::I32_8S => "i32.load8_s",
            Self::I32_8U => "i32.load8_u",
            Self::I32_16S => "i32.load16_s",
            Self::I32_16U => "i32.load16_u",
            Self::I64_8S => "i64.load8_s",
            Self::I64_8U => "i64.load8_u",
            Self::I64_16S => "i64.load16_s",
            Self::I64_16U => "i64.load16_u",
            Self::I64_32S => "i64.load32_s",
            Self::I64_32U => "i64.load32_u",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreKind {
    I32,
    I64,
    F32,
    F64,
    I32_8,
    I32_16,
    I64_8,
    I64_16,
    I64_32,
}

impl StoreKind {
    pub const ALL: [StoreKind; 9] = [
        Self::I32,
        Self::I64,
        Self::F32,
        Self::F64,
        Self::I32_8,
        Self::I32_16,
        Self::I64_8,
        Self::I64_16,
        Self::I64_32,
    ];

    #[must_use]
    pub const fn operand(self) -> ValueKind {
        match self {
            Self::I32 | Self::I32_8 | Self::I32_16 => ValueKind::I32,
            Self::F32 => ValueKind::F32,
            Self::F64 => ValueKind::F64,
            Self::I64 | Self::I64_8 | Self::I64_16 | Self::I64_32 => ValueKind::I64,
        }
    }

    #[must_use]
    pub const fn width(self) -> usize {
        match self {
            Self::I32_8 | Self::I64_8 => 1,
            Self::I32_16 | Self::I64_16 => 2,
            Self::I32 | Self::F32 | Self::I64_32 => 4,
            Self::I64 | Self::F64 => 8,
        }
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::I32 => "i32.store",
            Self::I64 => "i64.store",
            Self::F32 => "f32.store",
            Self::F64 => "f64.store",
            Self::I32_8 => "i32.store8",
            Self::I32_16 => "i32.store16",
            Self::I64_8 => "i64.store8",
            Self::I64_16 => "i64.store16",
            Self::I64_32 => "i64.store32",
        }
    }
}

/// Static offset of a load or store. Alignment hints are dropped by the decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemArg {
    pub offset: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockType {
    Empty,
    Value(ValueKind),
    Func(u32),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    Unreachable,
    Nop,
    Block(BlockType),
    Loop(BlockType),
    If(BlockType),
    Else,
    End,
    Br(u32),
    BrIf(u32),
    BrTable { targets: Vec<u32>, default: u32 },
    Return,
    Call(u32),
    CallIndirect { type_index: u32, table: u32 },
    ReturnCall(u32),
    ReturnCallIndirect { type_index: u32, table: u32 },
    Drop,
    Select,
    TypedSelect(ValueKind),
    LocalGet(u32),
    LocalSet(u32),
    LocalTee(u32),
    GlobalGet(u32),
    GlobalSet(u32),
    TableGet(u32),
    TableSet(u32),
    TableSize(u32),
    TableGrow(u32),
    TableFill(u32),
    TableCopy { dst: u32, src: u32 },
    TableInit { elem: u32, table: u32 },
    ElemDrop(u32),
    Load(LoadKind, MemArg),
    Store(StoreKind, MemArg),
    MemorySize,
    MemoryGrow,
    MemoryFill,
    MemoryCopy,
    MemoryInit(u32),
    DataDrop(u32),
    I32Const(i32),
    I64Const(i64),
    F32Const(u32),
    F64Const(u64),
    RefNull(ValueKind),
    RefIsNull,
    RefFunc(u32),
    Num(NumOp),
}

impl Op {
    #[must_use]
    pub const fn is_block_start(&self) -> bool {
        matches!(self, Self::Block(_) | Self::Loop(_) | Self::If(_))
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unreachable => f.write_str("unreachable"),
            Self::Nop => f.write_str("nop"),
            Self::Block(_) => f.write_str("block"),
            Self::Loop(_) => f.write_str("loop"),
            Self::If(_) => f.write_str("if"),
            Self::Else => f.write_str("else"),
            Self::End => f.write_str("end"),
            Self::Br(depth) => write!(f, "br {depth}"),
            Self::BrIf(depth) => write!(f, "br_if {depth}"),
            Self::BrTable { targets, default } => {
                f.write_str("br_table")?;
                for t in targets {
                    write!(f, " {t}")?;
                }
                write!(f, " {default}")
            }
            Self::Return => f.write_str("return"),
            Self::Call(idx) => write!(f, "call {idx}"),
            Self::CallIndirect { type_index, table } => {
                write!(f, "call_indirect {table} (type {type_index})")
            }
            Self::ReturnCall(idx) => write!(f, "return_call {idx}"),
            Self::ReturnCallIndirect { type_index, table } => {
                write!(f, "return_call_indirect {table} (type {type_index})")
            }
            Self::Drop => f.write_str("drop"),
            Self::Select => f.write_str("select"),
            Self::TypedSelect(kind) => write!(f, "select (result {kind})"),
            Self::LocalGet(idx) => write!(f, "local.get {idx}"),
            Self::LocalSet(idx) => write!(f, "local.set {idx}"),
            Self::LocalTee(idx) => write!(f, "local.tee {idx}"),
            Self::GlobalGet(idx) => write!(f, "global.get {idx}"),
            Self::GlobalSet(idx) => write!(f, "global.set {idx}"),
            Self::TableGet(idx) => write!(f, "table.get {idx}"),
            Self::TableSet(idx) => write!(f, "table.set {idx}"),
            Self::TableSize(idx) => write!(f, "table.size {idx}"),
            Self::TableGrow(idx) => write!(f, "table.grow {idx}"),
            Self::TableFill(idx) => write!(f, "table.fill {idx}"),
            Self::TableCopy { dst, src } => write!(f, "table.copy {dst} {src}"),
            Self::TableInit { elem, table } => write!(f, "table.init {table} {elem}"),
            Self::ElemDrop(idx) => write!(f, "elem.drop {idx}"),
            Self::Load(kind, arg) => write!(f, "{} offset={}", kind.name(), arg.offset),
            Self::Store(kind, arg) => write!(f, "{} offset={}", kind.name(), arg.offset),
            Self::MemorySize => f.write_str("memory.size"),
            Self::MemoryGrow => f.write_str("memory.grow"),
            Self::MemoryFill => f.write_str("memory.fill"),
            Self::MemoryCopy => f.write_str("memory.copy"),
            Self::MemoryInit(idx) => write!(f, "memory.init {idx}"),
            Self::DataDrop(idx) => write!(f, "data.drop {idx}"),
            Self::I32Const(v) => write!(f, "i32.const {v}"),
            Self::I64Const(v) => write!(f, "i64.const {v}"),
            Self::F32Const(bits) => write!(f, "f32.const {}", f32::from_bits(*bits)),
            Self::F64Const(bits) => write!(f, "f64.const {}", f64::from_bits(*bits)),
            Self::RefNull(kind) => write!(f, "ref.null {kind}"),
            Self::RefIsNull => f.write_str("ref.is_null"),
            Self::RefFunc(idx) => write!(f, "ref.func {idx}"),
            Self::Num(op) => f.write_str(op.name()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_num_op_codes_are_dense() {
        for (i, op) in NumOp::ALL.iter().enumerate() {
            assert_eq!(usize::from(op.code()), i);
            assert_eq!(NumOp::from_code(op.code()), Some(*op));
        }
        assert!(NumOp::ALL.len() < 256);
    }

    #[test]
    fn test_num_op_signatures() {
        assert_eq!(NumOp::I32Add.params(), &[ValueKind::I32, ValueKind::I32]);
        assert_eq!(NumOp::I64Eqz.result(), ValueKind::I32);
        assert_eq!(NumOp::F64ConvertI64U.params(), &[ValueKind::I64]);
        assert_eq!(NumOp::F64ConvertI64U.result(), ValueKind::F64);
    }

    #[test]
    fn test_from_operator() {
        assert_eq!(
            NumOp::from_operator(&wasmparser::Operator::I64Rotl),
            Some(NumOp::I64Rotl)
        );
        assert_eq!(NumOp::from_operator(&wasmparser::Operator::Nop), None);
    }
}
