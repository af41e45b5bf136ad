// Code emitter: lowers normalized instructions to code units.
//
// This module is organized into submodules:
// - `emitter`: UnitEmitter (buffer, labels, fixups) and the lowering context
// - `control_flow`: labels, jumps, switch, unwinds, returns
// - `memory`: locals, globals, loads/stores and constants
// - `calls`: direct and indirect calls, delegation stubs

mod calls;
mod control_flow;
mod emitter;
mod memory;

pub use calls::{Delegate, emit_delegation};
pub use emitter::{LoweringContext, UnitEmitter};

use crate::analysis::NormalizedInstruction as N;
use crate::vm::{CodeUnit, Convention, Instruction};
use crate::wasm::{Module, Op};
use crate::{Error, Result};

/// Lower the analyzed body of `function` into a verified code unit.
pub fn emit_function(
    module: &Module,
    function: u32,
    code: &[N],
    max_code_size: usize,
) -> Result<CodeUnit> {
    let ctx = LoweringContext::new(module, function)?;
    let mut e = UnitEmitter::new(function, ctx.frame_slots);

    emit_prologue(&mut e, &ctx)?;
    for ins in code {
        lower(&mut e, &ctx, ins)?;
    }

    let unit = e.finish(&ctx.signature, max_code_size)?;
    tracing::debug!(
        function,
        size = unit.size(),
        max_stack = unit.max_stack,
        "compiled code unit"
    );
    Ok(unit)
}

fn emit_prologue(e: &mut UnitEmitter, ctx: &LoweringContext) -> Result<()> {
    if Convention::of(&ctx.signature) == Convention::Boxed {
        // slot 0 holds the argument box; spread it over the parameter slots
        let sig = e.signature(&ctx.signature)?;
        e.emit(Instruction::Load(0));
        e.emit(Instruction::UnboxParams(sig));
        for index in (0..ctx.signature.params.len()).rev() {
            let index = u32::try_from(index)
                .map_err(|_| Error::Internal("parameter index overflow".to_string()))?;
            memory::lower_local_set(e, ctx, index)?;
        }
    }
    memory::lower_local_defaults(e, ctx);
    Ok(())
}

fn lower(e: &mut UnitEmitter, ctx: &LoweringContext, ins: &N) -> Result<()> {
    match ins {
        N::Label(label) => control_flow::lower_label(e, *label),
        N::Goto(label) => control_flow::lower_goto(e, *label),
        N::IfEq(label) => control_flow::lower_if_eq(e, *label),
        N::IfNe(label) => control_flow::lower_if_ne(e, *label),
        N::Switch(labels) => control_flow::lower_switch(e, labels)?,
        N::DropKeep { drop, keep } => control_flow::lower_drop_keep(e, drop, keep)?,
        N::Return(_) => control_flow::lower_return(e, ctx)?,
        N::Trap => control_flow::lower_trap(e),
        N::Drop(kind) => control_flow::lower_drop(e, *kind),
        N::Select(kind) => control_flow::lower_select(e, *kind),
        N::LocalTee { local, kind } => memory::lower_local_tee(e, ctx, *local, *kind)?,
        N::Call(func) => calls::lower_call(e, ctx.module, *func)?,
        N::CallIndirect { type_index, table } => {
            calls::lower_call_indirect(e, ctx.module, *type_index, *table)?;
        }
        N::Wasm(op) => lower_op(e, ctx, op)?,
    }
    Ok(())
}

/// Operators without control semantics map one-to-one, or nearly so.
fn lower_op(e: &mut UnitEmitter, ctx: &LoweringContext, op: &Op) -> Result<()> {
    match op {
        Op::LocalGet(idx) => memory::lower_local_get(e, ctx, *idx)?,
        Op::LocalSet(idx) => memory::lower_local_set(e, ctx, *idx)?,
        Op::GlobalGet(idx) => memory::lower_global_get(e, ctx, *idx)?,
        Op::GlobalSet(idx) => memory::lower_global_set(e, ctx, *idx)?,
        Op::Load(kind, memarg) => memory::lower_load(e, *kind, *memarg),
        Op::Store(kind, memarg) => memory::lower_store(e, *kind, *memarg),
        Op::MemorySize => e.emit(Instruction::MemorySize),
        Op::MemoryGrow => e.emit(Instruction::MemoryGrow),
        Op::MemoryFill => e.emit(Instruction::MemoryFill),
        Op::MemoryCopy => e.emit(Instruction::MemoryCopy),
        Op::MemoryInit(seg) => e.emit(Instruction::MemoryInit(*seg)),
        Op::DataDrop(seg) => e.emit(Instruction::DataDrop(*seg)),
        Op::TableGet(t) => e.emit(Instruction::TableGet(*t)),
        Op::TableSet(t) => e.emit(Instruction::TableSet(*t)),
        Op::TableSize(t) => e.emit(Instruction::TableSize(*t)),
        Op::TableGrow(t) => e.emit(Instruction::TableGrow(*t)),
        Op::TableFill(t) => e.emit(Instruction::TableFill(*t)),
        Op::TableCopy { dst, src } => e.emit(Instruction::TableCopy {
            dst: *dst,
            src: *src,
        }),
        Op::TableInit { elem, table } => e.emit(Instruction::TableInit {
            elem: *elem,
            table: *table,
        }),
        Op::ElemDrop(seg) => e.emit(Instruction::ElemDrop(*seg)),
        Op::I32Const(v) => memory::lower_i32_const(e, *v),
        Op::I64Const(v) => memory::lower_i64_const(e, *v),
        Op::F32Const(bits) => e.emit(Instruction::Const32(*bits)),
        Op::F64Const(bits) => e.emit(Instruction::Const64(*bits)),
        Op::RefNull(_) => memory::lower_ref_null(e),
        Op::RefIsNull => e.emit(Instruction::RefIsNull),
        Op::RefFunc(func) => e.emit(Instruction::RefFunc(*func)),
        Op::Num(num) => e.emit(Instruction::Num(*num)),
        other => return Err(Error::UnsupportedOpcode(other.to_string())),
    }
    Ok(())
}
