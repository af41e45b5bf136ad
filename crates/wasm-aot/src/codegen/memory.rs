// Locals, globals, linear memory and tables.

#![allow(clippy::cast_sign_loss)] // constants are reinterpreted as raw slot payloads

use crate::Result;
use crate::runtime::NULL_REF;
use crate::vm::{Instruction, TrapCode};
use crate::wasm::{LoadKind, MemArg, StoreKind, ValueKind};

use super::emitter::{LoweringContext, UnitEmitter};

/// Largest static offset that can still land inside a supported memory.
const MAX_STATIC_OFFSET: u64 = i32::MAX as u64;

pub fn lower_local_get(e: &mut UnitEmitter, ctx: &LoweringContext, index: u32) -> Result<()> {
    let (slot, kind) = ctx.local(index)?;
    e.emit(if kind.slots() == 1 {
        Instruction::Load(slot)
    } else {
        Instruction::Load2(slot)
    });
    Ok(())
}

pub fn lower_local_set(e: &mut UnitEmitter, ctx: &LoweringContext, index: u32) -> Result<()> {
    let (slot, kind) = ctx.local(index)?;
    e.emit(if kind.slots() == 1 {
        Instruction::Store(slot)
    } else {
        Instruction::Store2(slot)
    });
    Ok(())
}

pub fn lower_local_tee(
    e: &mut UnitEmitter,
    ctx: &LoweringContext,
    index: u32,
    kind: ValueKind,
) -> Result<()> {
    e.emit(if kind.slots() == 1 {
        Instruction::Dup
    } else {
        Instruction::Dup2
    });
    lower_local_set(e, ctx, index)
}

/// Reference locals start out null; numeric locals are zeroed by the frame.
pub fn lower_local_defaults(e: &mut UnitEmitter, ctx: &LoweringContext) {
    let params = ctx.signature.params.len();
    for (kind, slot) in ctx.local_kinds.iter().zip(&ctx.local_slots).skip(params) {
        if kind.is_ref() {
            e.emit(Instruction::Const64(NULL_REF));
            e.emit(Instruction::Store2(*slot));
        }
    }
}

pub fn lower_global_get(e: &mut UnitEmitter, ctx: &LoweringContext, index: u32) -> Result<()> {
    let kind = ctx.global_kind(index)?;
    e.emit(if kind.slots() == 1 {
        Instruction::GlobalGet(index)
    } else {
        Instruction::GlobalGet2(index)
    });
    Ok(())
}

pub fn lower_global_set(e: &mut UnitEmitter, ctx: &LoweringContext, index: u32) -> Result<()> {
    let kind = ctx.global_kind(index)?;
    e.emit(if kind.slots() == 1 {
        Instruction::GlobalSet(index)
    } else {
        Instruction::GlobalSet2(index)
    });
    Ok(())
}

/// Typed load. The executor rejects a negative base at run time; an offset
/// that no supported memory can reach becomes an unconditional trap.
pub fn lower_load(e: &mut UnitEmitter, kind: LoadKind, memarg: MemArg) {
    match u32::try_from(memarg.offset) {
        Ok(offset) if memarg.offset <= MAX_STATIC_OFFSET => {
            e.emit(Instruction::MemLoad { kind, offset });
        }
        _ => {
            e.emit(Instruction::Pop);
            e.emit(Instruction::Trap(TrapCode::MemoryOutOfBounds));
        }
    }
}

pub fn lower_store(e: &mut UnitEmitter, kind: StoreKind, memarg: MemArg) {
    match u32::try_from(memarg.offset) {
        Ok(offset) if memarg.offset <= MAX_STATIC_OFFSET => {
            e.emit(Instruction::MemStore { kind, offset });
        }
        _ => {
            super::control_flow::lower_drop(e, kind.operand());
            e.emit(Instruction::Pop);
            e.emit(Instruction::Trap(TrapCode::MemoryOutOfBounds));
        }
    }
}

pub fn lower_i32_const(e: &mut UnitEmitter, value: i32) {
    e.emit(Instruction::Const32(value as u32));
}

pub fn lower_i64_const(e: &mut UnitEmitter, value: i64) {
    e.emit(Instruction::Const64(value as u64));
}

pub fn lower_ref_null(e: &mut UnitEmitter) {
    e.emit(Instruction::Const64(NULL_REF));
}
