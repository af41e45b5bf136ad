// Flat, label-based instruction set produced by the analyzer.
//
// Labels are numbered by instruction index of the original body; the analyzer
// allocates labels above the body length for synthetic targets.

use std::fmt;

use crate::wasm::{Op, ValueKind};

pub type Label = usize;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NormalizedInstruction {
    /// Marks a jump target.
    Label(Label),
    Goto(Label),
    /// Pop an i32; jump when it is zero.
    IfEq(Label),
    /// Pop an i32; jump when it is non-zero.
    IfNe(Label),
    /// Pop an i32 index; jump to `targets[index]`, or to the last entry when
    /// the index is out of range.
    Switch(Vec<Label>),
    /// Discard `drop` (bottom first) from beneath the `keep` values on top.
    DropKeep {
        drop: Vec<ValueKind>,
        keep: Vec<ValueKind>,
    },
    Return(Vec<ValueKind>),
    /// `unreachable`.
    Trap,
    Drop(ValueKind),
    Select(ValueKind),
    LocalTee { local: u32, kind: ValueKind },
    Call(u32),
    CallIndirect { type_index: u32, table: u32 },
    /// Any other operator, lowered one-to-one.
    Wasm(Op),
}

impl NormalizedInstruction {
    /// Labels this instruction may jump to.
    #[must_use]
    pub fn targets(&self) -> &[Label] {
        match self {
            Self::Goto(l) | Self::IfEq(l) | Self::IfNe(l) => std::slice::from_ref(l),
            Self::Switch(targets) => targets,
            _ => &[],
        }
    }
}

fn join(kinds: &[ValueKind]) -> String {
    kinds
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" ")
}

impl fmt::Display for NormalizedInstruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Label(l) => write!(f, "L{l}:"),
            Self::Goto(l) => write!(f, "  GOTO L{l}"),
            Self::IfEq(l) => write!(f, "  IFEQ L{l}"),
            Self::IfNe(l) => write!(f, "  IFNE L{l}"),
            Self::Switch(targets) => {
                f.write_str("  SWITCH")?;
                for t in targets {
                    write!(f, " L{t}")?;
                }
                Ok(())
            }
            Self::DropKeep { drop, keep } => {
                write!(f, "  DROP_KEEP drop=[{}] keep=[{}]", join(drop), join(keep))
            }
            Self::Return(kinds) => write!(f, "  RETURN [{}]", join(kinds)),
            Self::Trap => f.write_str("  TRAP"),
            Self::Drop(kind) => write!(f, "  DROP {kind}"),
            Self::Select(kind) => write!(f, "  SELECT {kind}"),
            Self::LocalTee { local, kind } => write!(f, "  LOCAL_TEE {local} {kind}"),
            Self::Call(idx) => write!(f, "  CALL {idx}"),
            Self::CallIndirect { type_index, table } => {
                write!(f, "  CALL_INDIRECT type={type_index} table={table}")
            }
            Self::Wasm(op) => write!(f, "  {op}"),
        }
    }
}
