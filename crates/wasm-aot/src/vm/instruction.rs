// Target-machine instructions and their binary encoding.
//
// Layout: one opcode byte followed by fixed-width little-endian operands.
// Jump offsets are relative to the start of the jumping instruction.

use std::fmt;

use super::Opcode;
use crate::wasm::{LoadKind, NumOp, StoreKind};

/// Trap raised by a `Trap` instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TrapCode {
    Unreachable = 0,
    MemoryOutOfBounds = 1,
}

impl TrapCode {
    const fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::Unreachable),
            1 => Some(Self::MemoryOutOfBounds),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction {
    Trap(TrapCode),
    /// Poll the store's interrupt flag.
    CheckInterrupt,
    Const32(u32),
    Const64(u64),
    Load(u16),
    Load2(u16),
    Store(u16),
    Store2(u16),
    Pop,
    Pop2,
    Dup,
    Dup2,
    /// Discard `drop` slots beneath the top `keep` slots.
    DropKeep {
        drop: u16,
        keep: u16,
    },
    Select,
    Select2,
    Goto(i32),
    IfEq(i32),
    IfNe(i32),
    /// Jump table; the last entry is the default.
    Switch(Vec<i32>),
    /// Return the top `n` slots to the caller.
    Return(u16),
    Num(NumOp),
    MemLoad {
        kind: LoadKind,
        offset: u32,
    },
    MemStore {
        kind: StoreKind,
        offset: u32,
    },
    MemorySize,
    MemoryGrow,
    MemoryFill,
    MemoryCopy,
    MemoryInit(u32),
    DataDrop(u32),
    GlobalGet(u32),
    GlobalGet2(u32),
    GlobalSet(u32),
    GlobalSet2(u32),
    TableGet(u32),
    TableSet(u32),
    TableSize(u32),
    TableGrow(u32),
    TableFill(u32),
    TableCopy {
        dst: u32,
        src: u32,
    },
    TableInit {
        elem: u32,
        table: u32,
    },
    ElemDrop(u32),
    RefFunc(u32),
    RefIsNull,
    /// `sig` indexes the unit's signature pool.
    Call {
        func: u32,
        sig: u16,
    },
    CallIndirect {
        type_index: u32,
        table: u32,
        sig: u16,
    },
    CallImport {
        func: u32,
        sig: u16,
    },
    CallInterpreter {
        func: u32,
        sig: u16,
    },
    BoxParams(u16),
    UnboxParams(u16),
    BoxResults(u16),
    UnboxResults(u16),
}

impl Instruction {
    #[must_use]
    pub fn opcode(&self) -> Opcode {
        match self {
            Self::Trap(_) => Opcode::Trap,
            Self::CheckInterrupt => Opcode::CheckInterrupt,
            Self::Const32(_) => Opcode::Const32,
            Self::Const64(_) => Opcode::Const64,
            Self::Load(_) => Opcode::Load,
            Self::Load2(_) => Opcode::Load2,
            Self::Store(_) => Opcode::Store,
            Self::Store2(_) => Opcode::Store2,
            Self::Pop => Opcode::Pop,
            Self::Pop2 => Opcode::Pop2,
            Self::Dup => Opcode::Dup,
            Self::Dup2 => Opcode::Dup2,
            Self::DropKeep { .. } => Opcode::DropKeep,
            Self::Select => Opcode::Select,
            Self::Select2 => Opcode::Select2,
            Self::Goto(_) => Opcode::Goto,
            Self::IfEq(_) => Opcode::IfEq,
            Self::IfNe(_) => Opcode::IfNe,
            Self::Switch(_) => Opcode::Switch,
            Self::Return(_) => Opcode::Return,
            Self::Num(_) => Opcode::Num,
            Self::MemLoad { .. } => Opcode::MemLoad,
            Self::MemStore { .. } => Opcode::MemStore,
            Self::MemorySize => Opcode::MemorySize,
            Self::MemoryGrow => Opcode::MemoryGrow,
            Self::MemoryFill => Opcode::MemoryFill,
            Self::MemoryCopy => Opcode::MemoryCopy,
            Self::MemoryInit(_) => Opcode::MemoryInit,
            Self::DataDrop(_) => Opcode::DataDrop,
            Self::GlobalGet(_) => Opcode::GlobalGet,
            Self::GlobalGet2(_) => Opcode::GlobalGet2,
            Self::GlobalSet(_) => Opcode::GlobalSet,
            Self::GlobalSet2(_) => Opcode::GlobalSet2,
            Self::TableGet(_) => Opcode::TableGet,
            Self::TableSet(_) => Opcode::TableSet,
            Self::TableSize(_) => Opcode::TableSize,
            Self::TableGrow(_) => Opcode::TableGrow,
            Self::TableFill(_) => Opcode::TableFill,
            Self::TableCopy { .. } => Opcode::TableCopy,
            Self::TableInit { .. } => Opcode::TableInit,
            Self::ElemDrop(_) => Opcode::ElemDrop,
            Self::RefFunc(_) => Opcode::RefFunc,
            Self::RefIsNull => Opcode::RefIsNull,
            Self::Call { .. } => Opcode::Call,
            Self::CallIndirect { .. } => Opcode::CallIndirect,
            Self::CallImport { .. } => Opcode::CallImport,
            Self::CallInterpreter { .. } => Opcode::CallInterpreter,
            Self::BoxParams(_) => Opcode::BoxParams,
            Self::UnboxParams(_) => Opcode::UnboxParams,
            Self::BoxResults(_) => Opcode::BoxResults,
            Self::UnboxResults(_) => Opcode::UnboxResults,
        }
    }

    #[must_use]
    pub fn is_terminating(&self) -> bool {
        self.opcode().is_terminating()
    }

    /// Relative jump offsets carried by this instruction.
    #[must_use]
    pub fn jump_offsets(&self) -> &[i32] {
        match self {
            Self::Goto(off) | Self::IfEq(off) | Self::IfNe(off) => std::slice::from_ref(off),
            Self::Switch(offsets) => offsets,
            _ => &[],
        }
    }

    pub fn jump_offsets_mut(&mut self) -> &mut [i32] {
        match self {
            Self::Goto(off) | Self::IfEq(off) | Self::IfNe(off) => std::slice::from_mut(off),
            Self::Switch(offsets) => offsets,
            _ => &mut [],
        }
    }

    /// Encoded size in bytes, without allocating.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        1 + match self {
            Self::CheckInterrupt
            | Self::Pop
            | Self::Pop2
            | Self::Dup
            | Self::Dup2
            | Self::Select
            | Self::Select2
            | Self::MemorySize
            | Self::MemoryGrow
            | Self::MemoryFill
            | Self::MemoryCopy
            | Self::RefIsNull => 0,
            Self::Trap(_) | Self::Num(_) => 1,
            Self::Load(_)
            | Self::Load2(_)
            | Self::Store(_)
            | Self::Store2(_)
            | Self::Return(_)
            | Self::BoxParams(_)
            | Self::UnboxParams(_)
            | Self::BoxResults(_)
            | Self::UnboxResults(_) => 2,
            Self::Const32(_)
            | Self::Goto(_)
            | Self::IfEq(_)
            | Self::IfNe(_)
            | Self::DropKeep { .. }
            | Self::MemoryInit(_)
            | Self::DataDrop(_)
            | Self::GlobalGet(_)
            | Self::GlobalGet2(_)
            | Self::GlobalSet(_)
            | Self::GlobalSet2(_)
            | Self::TableGet(_)
            | Self::TableSet(_)
            | Self::TableSize(_)
            | Self::TableGrow(_)
            | Self::TableFill(_)
            | Self::ElemDrop(_)
            | Self::RefFunc(_) => 4,
            Self::MemLoad { .. } | Self::MemStore { .. } => 5,
            Self::Call { .. } | Self::CallImport { .. } | Self::CallInterpreter { .. } => 6,
            Self::Const64(_) | Self::TableCopy { .. } | Self::TableInit { .. } => 8,
            Self::CallIndirect { .. } => 10,
            Self::Switch(offsets) => 2 + 4 * offsets.len(),
        }
    }

    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.encoded_len());
        self.encode_into(&mut bytes);
        bytes
    }

    #[allow(clippy::cast_possible_truncation)] // switch tables are bounded by the emitter
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.push(self.opcode() as u8);
        match self {
            Self::CheckInterrupt
            | Self::Pop
            | Self::Pop2
            | Self::Dup
            | Self::Dup2
            | Self::Select
            | Self::Select2
            | Self::MemorySize
            | Self::MemoryGrow
            | Self::MemoryFill
            | Self::MemoryCopy
            | Self::RefIsNull => {}
            Self::Trap(code) => out.push(*code as u8),
            Self::Num(op) => out.push(op.code()),
            Self::Load(v)
            | Self::Load2(v)
            | Self::Store(v)
            | Self::Store2(v)
            | Self::Return(v)
            | Self::BoxParams(v)
            | Self::UnboxParams(v)
            | Self::BoxResults(v)
            | Self::UnboxResults(v) => out.extend_from_slice(&v.to_le_bytes()),
            Self::Const32(v) => out.extend_from_slice(&v.to_le_bytes()),
            Self::Goto(off) | Self::IfEq(off) | Self::IfNe(off) => {
                out.extend_from_slice(&off.to_le_bytes());
            }
            Self::DropKeep { drop, keep } => {
                out.extend_from_slice(&drop.to_le_bytes());
                out.extend_from_slice(&keep.to_le_bytes());
            }
            Self::MemoryInit(v)
            | Self::DataDrop(v)
            | Self::GlobalGet(v)
            | Self::GlobalGet2(v)
            | Self::GlobalSet(v)
            | Self::GlobalSet2(v)
            | Self::TableGet(v)
            | Self::TableSet(v)
            | Self::TableSize(v)
            | Self::TableGrow(v)
            | Self::TableFill(v)
            | Self::ElemDrop(v)
            | Self::RefFunc(v) => out.extend_from_slice(&v.to_le_bytes()),
            Self::MemLoad { kind, offset } => {
                out.push(*kind as u8);
                out.extend_from_slice(&offset.to_le_bytes());
            }
            Self::MemStore { kind, offset } => {
                out.push(*kind as u8);
                out.extend_from_slice(&offset.to_le_bytes());
            }
            Self::Call { func, sig }
            | Self::CallImport { func, sig }
            | Self::CallInterpreter { func, sig } => {
                out.extend_from_slice(&func.to_le_bytes());
                out.extend_from_slice(&sig.to_le_bytes());
            }
            Self::Const64(v) => out.extend_from_slice(&v.to_le_bytes()),
            Self::TableCopy { dst: a, src: b } | Self::TableInit { elem: a, table: b } => {
                out.extend_from_slice(&a.to_le_bytes());
                out.extend_from_slice(&b.to_le_bytes());
            }
            Self::CallIndirect {
                type_index,
                table,
                sig,
            } => {
                out.extend_from_slice(&type_index.to_le_bytes());
                out.extend_from_slice(&table.to_le_bytes());
                out.extend_from_slice(&sig.to_le_bytes());
            }
            Self::Switch(offsets) => {
                out.extend_from_slice(&(offsets.len() as u16).to_le_bytes());
                for off in offsets {
                    out.extend_from_slice(&off.to_le_bytes());
                }
            }
        }
    }

    /// Decode one instruction from the start of `bytes`, returning it with its
    /// encoded length. `None` on an unknown opcode or truncated operands.
    #[must_use]
    pub fn decode(bytes: &[u8]) -> Option<(Self, usize)> {
        let opcode = Opcode::from_byte(*bytes.first()?)?;
        let mut r = Reader { bytes, pos: 1 };
        let ins = match opcode {
            Opcode::Trap => Self::Trap(TrapCode::from_byte(r.u8()?)?),
            Opcode::CheckInterrupt => Self::CheckInterrupt,
            Opcode::Const32 => Self::Const32(r.u32()?),
            Opcode::Const64 => Self::Const64(r.u64()?),
            Opcode::Load => Self::Load(r.u16()?),
            Opcode::Load2 => Self::Load2(r.u16()?),
            Opcode::Store => Self::Store(r.u16()?),
            Opcode::Store2 => Self::Store2(r.u16()?),
            Opcode::Pop => Self::Pop,
            Opcode::Pop2 => Self::Pop2,
            Opcode::Dup => Self::Dup,
            Opcode::Dup2 => Self::Dup2,
            Opcode::DropKeep => Self::DropKeep {
                drop: r.u16()?,
                keep: r.u16()?,
            },
            Opcode::Select => Self::Select,
            Opcode::Select2 => Self::Select2,
            Opcode::Goto => Self::Goto(r.i32()?),
            Opcode::IfEq => Self::IfEq(r.i32()?),
            Opcode::IfNe => Self::IfNe(r.i32()?),
            Opcode::Switch => {
                let count = r.u16()?;
                let offsets = (0..count).map(|_| r.i32()).collect::<Option<Vec<_>>>()?;
                Self::Switch(offsets)
            }
            Opcode::Return => Self::Return(r.u16()?),
            Opcode::Num => Self::Num(NumOp::from_code(r.u8()?)?),
            Opcode::MemLoad => Self::MemLoad {
                kind: *LoadKind::ALL.get(usize::from(r.u8()?))?,
                offset: r.u32()?,
            },
            Opcode::MemStore => Self::MemStore {
                kind: *StoreKind::ALL.get(usize::from(r.u8()?))?,
                offset: r.u32()?,
            },
            Opcode::MemorySize => Self::MemorySize,
            Opcode::MemoryGrow => Self::MemoryGrow,
            Opcode::MemoryFill => Self::MemoryFill,
            Opcode::MemoryCopy => Self::MemoryCopy,
            Opcode::MemoryInit => Self::MemoryInit(r.u32()?),
            Opcode::DataDrop => Self::DataDrop(r.u32()?),
            Opcode::GlobalGet => Self::GlobalGet(r.u32()?),
            Opcode::GlobalGet2 => Self::GlobalGet2(r.u32()?),
            Opcode::GlobalSet => Self::GlobalSet(r.u32()?),
            Opcode::GlobalSet2 => Self::GlobalSet2(r.u32()?),
            Opcode::TableGet => Self::TableGet(r.u32()?),
            Opcode::TableSet => Self::TableSet(r.u32()?),
            Opcode::TableSize => Self::TableSize(r.u32()?),
            Opcode::TableGrow => Self::TableGrow(r.u32()?),
            Opcode::TableFill => Self::TableFill(r.u32()?),
            Opcode::TableCopy => Self::TableCopy {
                dst: r.u32()?,
                src: r.u32()?,
            },
            Opcode::TableInit => Self::TableInit {
                elem: r.u32()?,
                table: r.u32()?,
            },
            Opcode::ElemDrop => Self::ElemDrop(r.u32()?),
            Opcode::RefFunc => Self::RefFunc(r.u32()?),
            Opcode::RefIsNull => Self::RefIsNull,
            Opcode::Call => Self::Call {
                func: r.u32()?,
                sig: r.u16()?,
            },
            Opcode::CallIndirect => Self::CallIndirect {
                type_index: r.u32()?,
                table: r.u32()?,
                sig: r.u16()?,
            },
            Opcode::CallImport => Self::CallImport {
                func: r.u32()?,
                sig: r.u16()?,
            },
            Opcode::CallInterpreter => Self::CallInterpreter {
                func: r.u32()?,
                sig: r.u16()?,
            },
            Opcode::BoxParams => Self::BoxParams(r.u16()?),
            Opcode::UnboxParams => Self::UnboxParams(r.u16()?),
            Opcode::BoxResults => Self::BoxResults(r.u16()?),
            Opcode::UnboxResults => Self::UnboxResults(r.u16()?),
        };
        Some((ins, r.pos))
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl Reader<'_> {
    fn take<const N: usize>(&mut self) -> Option<[u8; N]> {
        let chunk = self.bytes.get(self.pos..self.pos + N)?;
        self.pos += N;
        chunk.try_into().ok()
    }

    fn u8(&mut self) -> Option<u8> {
        self.take::<1>().map(|[b]| b)
    }

    fn u16(&mut self) -> Option<u16> {
        self.take().map(u16::from_le_bytes)
    }

    fn u32(&mut self) -> Option<u32> {
        self.take().map(u32::from_le_bytes)
    }

    fn i32(&mut self) -> Option<i32> {
        self.take().map(i32::from_le_bytes)
    }

    fn u64(&mut self) -> Option<u64> {
        self.take().map(u64::from_le_bytes)
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Trap(code) => write!(f, "trap {code:?}"),
            Self::Num(op) => write!(f, "num {op}"),
            Self::MemLoad { kind, offset } => write!(f, "{} offset={offset}", kind.name()),
            Self::MemStore { kind, offset } => write!(f, "{} offset={offset}", kind.name()),
            Self::Switch(offsets) => write!(f, "switch {offsets:?}"),
            other => write!(f, "{other:?}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encoded_len_matches_encoding() {
        let samples = vec![
            Instruction::Trap(TrapCode::MemoryOutOfBounds),
            Instruction::Const64(u64::MAX),
            Instruction::Load2(3),
            Instruction::DropKeep { drop: 3, keep: 2 },
            Instruction::Switch(vec![-4, 12, 30]),
            Instruction::Num(NumOp::F64Copysign),
            Instruction::MemLoad {
                kind: LoadKind::I64_16S,
                offset: 0x1234,
            },
            Instruction::CallIndirect {
                type_index: 2,
                table: 0,
                sig: 1,
            },
            Instruction::TableCopy { dst: 1, src: 0 },
        ];
        for ins in samples {
            let bytes = ins.encode();
            assert_eq!(bytes.len(), ins.encoded_len(), "{ins}");
            assert_eq!(Instruction::decode(&bytes), Some((ins, bytes.len())));
        }
    }

    #[test]
    fn test_decode_rejects_truncated_operands() {
        let bytes = Instruction::Const32(7).encode();
        assert_eq!(Instruction::decode(&bytes[..3]), None);
        assert_eq!(Instruction::decode(&[0xFF]), None);
        assert_eq!(Instruction::decode(&[]), None);
    }

    #[test]
    fn test_jump_offsets_are_little_endian() {
        let bytes = Instruction::Goto(-2).encode();
        assert_eq!(bytes, vec![Opcode::Goto as u8, 0xFE, 0xFF, 0xFF, 0xFF]);
    }
}
