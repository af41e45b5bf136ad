// Control flow: labels, jumps, jump tables, unwinds and returns.

use crate::Result;
use crate::analysis::Label;
use crate::vm::{Instruction, TrapCode, return_slots};
use crate::wasm::ValueKind;

use super::emitter::{LoweringContext, UnitEmitter};

pub fn lower_label(e: &mut UnitEmitter, label: Label) {
    let id = e.label_for(label);
    e.define_label(id);
}

/// Unconditional jump; backward jumps poll the interrupt flag first.
pub fn lower_goto(e: &mut UnitEmitter, label: Label) {
    let id = e.label_for(label);
    if e.is_defined(id) {
        e.emit(Instruction::CheckInterrupt);
    }
    e.emit_jump_to_label(id);
}

pub fn lower_if_eq(e: &mut UnitEmitter, label: Label) {
    let id = e.label_for(label);
    if e.is_defined(id) {
        e.emit(Instruction::CheckInterrupt);
    }
    e.emit_if_eq_to_label(id);
}

pub fn lower_if_ne(e: &mut UnitEmitter, label: Label) {
    let id = e.label_for(label);
    if e.is_defined(id) {
        e.emit(Instruction::CheckInterrupt);
    }
    e.emit_if_ne_to_label(id);
}

pub fn lower_switch(e: &mut UnitEmitter, labels: &[Label]) -> Result<()> {
    let ids: Vec<usize> = labels.iter().map(|l| e.label_for(*l)).collect();
    if ids.iter().any(|id| e.is_defined(*id)) {
        e.emit(Instruction::CheckInterrupt);
    }
    e.emit_switch_to_labels(&ids)
}

/// Discard the `drop` values beneath the `keep` values.
pub fn lower_drop_keep(e: &mut UnitEmitter, drop: &[ValueKind], keep: &[ValueKind]) -> Result<()> {
    let drop_slots = ValueKind::slot_count(drop);
    let keep_slots = ValueKind::slot_count(keep);
    if drop_slots == 0 {
        return Ok(());
    }
    let too_wide = |_| crate::Error::Unsupported("unwind wider than 65535 slots".to_string());
    e.emit(Instruction::DropKeep {
        drop: u16::try_from(drop_slots).map_err(too_wide)?,
        keep: u16::try_from(keep_slots).map_err(too_wide)?,
    });
    Ok(())
}

/// Return the function's results; more than one travels boxed.
pub fn lower_return(e: &mut UnitEmitter, ctx: &LoweringContext) -> Result<()> {
    if ctx.signature.results.len() > 1 {
        let sig = e.signature(&ctx.signature)?;
        e.emit(Instruction::BoxResults(sig));
    }
    let slots = u16::try_from(return_slots(&ctx.signature))
        .map_err(|_| crate::Error::Unsupported("too many result slots".to_string()))?;
    e.emit(Instruction::Return(slots));
    Ok(())
}

pub fn lower_trap(e: &mut UnitEmitter) {
    e.emit(Instruction::Trap(TrapCode::Unreachable));
}

pub fn lower_drop(e: &mut UnitEmitter, kind: ValueKind) {
    e.emit(if kind.slots() == 1 {
        Instruction::Pop
    } else {
        Instruction::Pop2
    });
}

pub fn lower_select(e: &mut UnitEmitter, kind: ValueKind) {
    e.emit(if kind.slots() == 1 {
        Instruction::Select
    } else {
        Instruction::Select2
    });
}
