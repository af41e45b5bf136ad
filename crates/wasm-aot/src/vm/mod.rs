// Target machine: code-unit encoding, loading, verification and execution.
#![allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]

mod exec;
mod instruction;
mod opcode;
mod unit;
mod verifier;

pub(crate) use exec::{ExecState, Executor};
pub use instruction::{Instruction, TrapCode};
pub use opcode::Opcode;
pub use unit::{CodeUnit, Convention, LoadedUnit, MAX_PARAM_SLOTS, arg_slots, return_slots};
pub use verifier::verify;
