// Structural verifier for loaded code units.
//
// Every reachable instruction must be entered with one consistent slot depth,
// never pop below the frame base, and only touch declared local slots.
// Unreachable instructions are not checked.

use super::unit::{LoadedUnit, arg_slots, return_slots};
use super::Instruction;
use crate::{Error, Result};

/// Slots popped and pushed by `ins`.
fn stack_effect(unit: &LoadedUnit, ins: &Instruction) -> Result<(usize, usize)> {
    use Instruction as I;
    Ok(match ins {
        I::Trap(_) | I::CheckInterrupt | I::Goto(_) | I::DataDrop(_) | I::ElemDrop(_) => (0, 0),
        I::Const32(_) | I::Load(_) | I::GlobalGet(_) | I::MemorySize | I::TableSize(_) => (0, 1),
        I::Const64(_) | I::Load2(_) | I::GlobalGet2(_) | I::RefFunc(_) => (0, 2),
        I::Store(_) | I::Pop | I::GlobalSet(_) | I::IfEq(_) | I::IfNe(_) | I::Switch(_) => (1, 0),
        I::Store2(_) | I::Pop2 | I::GlobalSet2(_) => (2, 0),
        I::Dup => (1, 2),
        I::Dup2 => (2, 4),
        I::DropKeep { drop, keep } => (usize::from(*drop) + usize::from(*keep), usize::from(*keep)),
        I::Select => (3, 1),
        I::Select2 => (5, 2),
        I::Return(n) => (usize::from(*n), 0),
        I::Num(op) => (
            op.params().iter().map(|k| k.slots()).sum(),
            op.result().slots(),
        ),
        I::MemLoad { kind, .. } => (1, kind.result().slots()),
        I::MemStore { kind, .. } => (1 + kind.operand().slots(), 0),
        I::MemoryGrow => (1, 1),
        I::MemoryFill
        | I::MemoryCopy
        | I::MemoryInit(_)
        | I::TableCopy { .. }
        | I::TableInit { .. } => {
            (3, 0)
        }
        I::TableGet(_) => (1, 2),
        I::TableSet(_) => (3, 0),
        I::TableGrow(_) => (3, 1),
        I::TableFill(_) => (4, 0),
        I::RefIsNull => (2, 1),
        I::Call { sig, .. } | I::CallImport { sig, .. } | I::CallInterpreter { sig, .. } => {
            let ty = unit.signature_at(*sig)?;
            (arg_slots(ty), return_slots(ty))
        }
        I::CallIndirect { sig, .. } => {
            let ty = unit.signature_at(*sig)?;
            (1 + arg_slots(ty), return_slots(ty))
        }
        I::BoxParams(sig) => (unit.signature_at(*sig)?.param_slots(), 1),
        I::UnboxParams(sig) => (1, unit.signature_at(*sig)?.param_slots()),
        I::BoxResults(sig) => (unit.signature_at(*sig)?.result_slots(), 1),
        I::UnboxResults(sig) => (1, unit.signature_at(*sig)?.result_slots()),
    })
}

fn touched_local(ins: &Instruction) -> Option<usize> {
    match ins {
        Instruction::Load(slot) | Instruction::Store(slot) => Some(usize::from(*slot)),
        Instruction::Load2(slot) | Instruction::Store2(slot) => Some(usize::from(*slot) + 1),
        _ => None,
    }
}

/// Verify `unit` and return its maximum operand-stack depth in slots.
#[allow(clippy::cast_sign_loss)] // jump operands are resolved, non-negative indices
pub fn verify(unit: &LoadedUnit) -> Result<usize> {
    let fail = |pc: usize, message: String| Error::Verification {
        function: unit.function,
        message: format!("at instruction {pc}: {message}"),
    };
    let expected_return = return_slots(&unit.signature);

    let mut depths: Vec<Option<usize>> = vec![None; unit.code.len()];
    let mut worklist = vec![(0usize, 0usize)];
    let mut max_stack = 0;

    while let Some((mut pc, mut depth)) = worklist.pop() {
        loop {
            let Some(ins) = unit.code.get(pc) else {
                return Err(fail(pc, "control falls off the end of the unit".to_string()));
            };
            match depths[pc] {
                Some(seen) if seen == depth => break,
                Some(seen) => {
                    return Err(fail(
                        pc,
                        format!("inconsistent stack depth: {seen} and {depth}"),
                    ));
                }
                None => depths[pc] = Some(depth),
            }

            if let Some(slot) = touched_local(ins) {
                if slot >= unit.local_slots {
                    return Err(fail(
                        pc,
                        format!("local slot {slot} out of {} slots", unit.local_slots),
                    ));
                }
            }

            let (pops, pushes) = stack_effect(unit, ins)?;
            depth = depth
                .checked_sub(pops)
                .ok_or_else(|| fail(pc, format!("{ins} underflows stack of depth {depth}")))?;
            depth += pushes;
            max_stack = max_stack.max(depth);

            if let Instruction::Return(n) = ins {
                if usize::from(*n) != expected_return {
                    return Err(fail(
                        pc,
                        format!("returns {n} slots, signature needs {expected_return}"),
                    ));
                }
            }

            for &target in ins.jump_offsets() {
                worklist.push((target as usize, depth));
            }
            if ins.is_terminating() {
                break;
            }
            pc += 1;
        }
    }

    Ok(max_stack)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::{Convention, TrapCode};
    use crate::wasm::{FunctionType, NumOp, ValueKind};

    fn loaded(code: Vec<Instruction>, signature: FunctionType, local_slots: usize) -> LoadedUnit {
        LoadedUnit {
            function: 7,
            code,
            convention: Convention::of(&signature),
            signature,
            local_slots,
            max_stack: 0,
            signatures: Vec::new(),
        }
    }

    #[test]
    fn test_computes_max_stack() {
        let unit = loaded(
            vec![
                Instruction::Const64(1),
                Instruction::Const64(2),
                Instruction::Num(NumOp::I64Add),
                Instruction::Return(2),
            ],
            FunctionType::returning(ValueKind::I64),
            0,
        );
        assert_eq!(verify(&unit).expect("valid"), 4);
    }

    #[test]
    fn test_rejects_inconsistent_join() {
        // 0: load 0; 1: ifeq -> 3; 2: const32; 3: return 1
        let unit = loaded(
            vec![
                Instruction::Load(0),
                Instruction::IfEq(3),
                Instruction::Const32(5),
                Instruction::Return(1),
            ],
            FunctionType::new(vec![ValueKind::I32], vec![ValueKind::I32]),
            1,
        );
        let err = verify(&unit).expect_err("depth 0 vs 1 at the join");
        assert!(err.to_string().contains("inconsistent stack depth"));
    }

    #[test]
    fn test_rejects_underflow_and_bad_locals() {
        let underflow = loaded(
            vec![Instruction::Pop, Instruction::Return(0)],
            FunctionType::empty(),
            0,
        );
        assert!(verify(&underflow).is_err());

        let bad_local = loaded(
            vec![Instruction::Load2(0), Instruction::Pop2, Instruction::Return(0)],
            FunctionType::empty(),
            1,
        );
        assert!(verify(&bad_local).is_err());
    }

    #[test]
    fn test_skips_unreachable_code() {
        let unit = loaded(
            vec![Instruction::Trap(TrapCode::Unreachable), Instruction::Pop],
            FunctionType::empty(),
            0,
        );
        assert_eq!(verify(&unit).expect("dead pop is ignored"), 0);
    }
}
