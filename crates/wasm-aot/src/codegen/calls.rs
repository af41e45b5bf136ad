// Function calls: direct, indirect, and the delegation stubs that route an
// index to the interpreter or an import.

use crate::vm::{Convention, Instruction, arg_slots, return_slots};
use crate::wasm::{FunctionType, Module};
use crate::{Error, Result};

use super::emitter::UnitEmitter;

/// Box the arguments when the callee takes them as one vector.
fn box_args(e: &mut UnitEmitter, ty: &FunctionType, sig: u16) {
    if Convention::of(ty) == Convention::Boxed {
        e.emit(Instruction::BoxParams(sig));
    }
}

/// Spread a boxed multi-value result back onto the stack.
fn unbox_results(e: &mut UnitEmitter, ty: &FunctionType, sig: u16) {
    if ty.results.len() > 1 {
        e.emit(Instruction::UnboxResults(sig));
    }
}

pub fn lower_call(e: &mut UnitEmitter, module: &Module, func: u32) -> Result<()> {
    let ty = module
        .function_type(func)
        .ok_or_else(|| Error::Internal(format!("call to unknown function {func}")))?;
    let sig = e.signature(ty)?;
    box_args(e, ty, sig);
    e.emit(Instruction::CheckInterrupt);
    e.emit(Instruction::Call { func, sig });
    unbox_results(e, ty, sig);
    Ok(())
}

pub fn lower_call_indirect(
    e: &mut UnitEmitter,
    module: &Module,
    type_index: u32,
    table: u32,
) -> Result<()> {
    let ty = module
        .types
        .get(type_index as usize)
        .ok_or_else(|| Error::Internal(format!("type index {type_index} out of range")))?;
    let sig = e.signature(ty)?;

    if Convention::of(ty) == Convention::Boxed {
        // element index sits above the arguments
        let scratch = e.scratch_slot()?;
        e.emit(Instruction::Store(scratch));
        e.emit(Instruction::BoxParams(sig));
        e.emit(Instruction::Load(scratch));
    }
    e.emit(Instruction::CheckInterrupt);
    e.emit(Instruction::CallIndirect {
        type_index,
        table,
        sig,
    });
    unbox_results(e, ty, sig);
    Ok(())
}

/// Where a delegation stub forwards its call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delegate {
    Interpreter,
    Import,
}

/// A unit that forwards its arguments unchanged to the interpreter or an
/// import and returns what it gets back.
pub fn emit_delegation(
    function: u32,
    ty: &FunctionType,
    delegate: Delegate,
    max_code_size: usize,
) -> Result<crate::vm::CodeUnit> {
    let args = arg_slots(ty);
    let mut e = UnitEmitter::new(function, args);
    let sig = e.signature(ty)?;

    let mut slot = 0;
    while slot < args {
        let index = u16::try_from(slot)
            .map_err(|_| Error::Internal(format!("argument slot {slot} out of range")))?;
        // pairs of slots move as one wide value
        if args - slot >= 2 {
            e.emit(Instruction::Load2(index));
            slot += 2;
        } else {
            e.emit(Instruction::Load(index));
            slot += 1;
        }
    }

    e.emit(match delegate {
        Delegate::Interpreter => Instruction::CallInterpreter { func: function, sig },
        Delegate::Import => Instruction::CallImport { func: function, sig },
    });
    let results = u16::try_from(return_slots(ty))
        .map_err(|_| Error::Unsupported("too many result slots".to_string()))?;
    e.emit(Instruction::Return(results));
    e.finish(ty, max_code_size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wasm::ValueKind;

    #[test]
    fn test_delegation_stub_forwards_all_slots() {
        let ty = FunctionType::new(
            vec![ValueKind::I32, ValueKind::F64, ValueKind::I32],
            vec![ValueKind::I64],
        );
        let unit = emit_delegation(3, &ty, Delegate::Interpreter, 1024).expect("stub");
        let loaded = unit.load().expect("load");
        assert_eq!(
            loaded.code,
            vec![
                Instruction::Load2(0),
                Instruction::Load2(2),
                Instruction::CallInterpreter { func: 3, sig: 0 },
                Instruction::Return(2),
            ]
        );
        assert_eq!(unit.max_stack, 4);
    }

    #[test]
    fn test_boxed_stub_passes_the_handle() {
        let ty = FunctionType::new(vec![ValueKind::I64; 200], vec![ValueKind::I32, ValueKind::I32]);
        let unit = emit_delegation(0, &ty, Delegate::Import, 1024).expect("stub");
        let loaded = unit.load().expect("load");
        assert_eq!(
            loaded.code,
            vec![
                Instruction::Load(0),
                Instruction::CallImport { func: 0, sig: 0 },
                Instruction::Return(1),
            ]
        );
    }
}
