//! Decoded module model: value kinds, function types, operators and
//! annotated instructions, as produced by the wasmparser-backed decoder.

mod instruction;
mod module;
mod ops;
mod types;

pub use instruction::{Instruction, annotate};
pub use module::{
    ConstExpr, DataMode, DataSegment, ElementMode, ElementSegment, Export, ExportKind,
    FunctionBody, FunctionImport, Global, MemoryType, Module, TableType,
};
pub use ops::{BlockType, LoadKind, MemArg, NumOp, Op, StoreKind};
pub use types::{FuncRef, FunctionType, InstanceId, Value, ValueKind};
