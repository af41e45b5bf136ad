// Code units: the encoded output for one function plus its calling convention.

use super::Instruction;
use crate::wasm::FunctionType;
use crate::{Error, Result};

/// Parameter slots above which arguments travel as one boxed vector.
pub const MAX_PARAM_SLOTS: usize = 253;

/// How arguments reach a unit's first locals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Convention {
    /// One slot per parameter slot.
    Slots,
    /// Slot 0 holds a box handle; the unit unboxes it in its prologue.
    Boxed,
}

impl Convention {
    #[must_use]
    pub fn of(ty: &FunctionType) -> Self {
        if ty.param_slots() > MAX_PARAM_SLOTS {
            Self::Boxed
        } else {
            Self::Slots
        }
    }
}

/// Slots a caller pushes for a call with type `ty`.
#[must_use]
pub fn arg_slots(ty: &FunctionType) -> usize {
    match Convention::of(ty) {
        Convention::Slots => ty.param_slots(),
        Convention::Boxed => 1,
    }
}

/// Slots a call with type `ty` leaves on the caller's stack. Multiple results
/// come back as one boxed vector.
#[must_use]
pub fn return_slots(ty: &FunctionType) -> usize {
    if ty.results.len() > 1 {
        1
    } else {
        ty.result_slots()
    }
}

/// One compiled function: self-contained encoded code plus the metadata needed
/// to load and call it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeUnit {
    pub function: u32,
    pub bytes: Vec<u8>,
    pub signature: FunctionType,
    pub convention: Convention,
    pub local_slots: usize,
    pub max_stack: usize,
    /// Signature pool referenced by call and box instructions.
    pub signatures: Vec<FunctionType>,
}

impl CodeUnit {
    #[must_use]
    pub fn size(&self) -> usize {
        self.bytes.len()
    }

    /// Decode the unit into executable form. Jump operands of the loaded
    /// instructions hold absolute instruction indices.
    pub fn load(&self) -> Result<LoadedUnit> {
        let fail = |message: String| Error::Verification {
            function: self.function,
            message,
        };

        let mut code = Vec::new();
        let mut offsets = Vec::new();
        let mut pos = 0;
        while pos < self.bytes.len() {
            let (ins, len) = Instruction::decode(&self.bytes[pos..])
                .ok_or_else(|| fail(format!("undecodable instruction at byte {pos}")))?;
            offsets.push(pos);
            code.push(ins);
            pos += len;
        }

        for (idx, ins) in code.iter_mut().enumerate() {
            let start = offsets[idx];
            for off in ins.jump_offsets_mut() {
                let target = i64::try_from(start).unwrap_or(i64::MAX) + i64::from(*off);
                let index = usize::try_from(target)
                    .ok()
                    .and_then(|t| offsets.binary_search(&t).ok())
                    .ok_or_else(|| {
                        fail(format!("jump at byte {start} to {target} is not an instruction"))
                    })?;
                *off = i32::try_from(index)
                    .map_err(|_| fail(format!("jump target {index} out of range")))?;
            }
        }

        Ok(LoadedUnit {
            function: self.function,
            code,
            signature: self.signature.clone(),
            convention: self.convention,
            local_slots: self.local_slots,
            max_stack: self.max_stack,
            signatures: self.signatures.clone(),
        })
    }
}

/// A decoded, jump-resolved code unit ready for the executor.
#[derive(Debug, Clone)]
pub struct LoadedUnit {
    pub function: u32,
    pub code: Vec<Instruction>,
    pub signature: FunctionType,
    pub convention: Convention,
    pub local_slots: usize,
    pub max_stack: usize,
    pub signatures: Vec<FunctionType>,
}

impl LoadedUnit {
    pub fn signature_at(&self, sig: u16) -> Result<&FunctionType> {
        self.signatures.get(usize::from(sig)).ok_or_else(|| Error::Verification {
            function: self.function,
            message: format!("signature {sig} not in pool"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wasm::ValueKind;

    fn unit(code: &[Instruction]) -> CodeUnit {
        let mut bytes = Vec::new();
        for ins in code {
            ins.encode_into(&mut bytes);
        }
        CodeUnit {
            function: 0,
            bytes,
            signature: FunctionType::empty(),
            convention: Convention::Slots,
            local_slots: 0,
            max_stack: 0,
            signatures: Vec::new(),
        }
    }

    #[test]
    fn test_load_resolves_jumps_to_indices() {
        // 0: const32 (5 bytes), 5: goto -5
        let loaded = unit(&[Instruction::Const32(1), Instruction::Goto(-5)])
            .load()
            .expect("load");
        assert_eq!(loaded.code[1], Instruction::Goto(0));
    }

    #[test]
    fn test_load_rejects_jump_into_operands() {
        let err = unit(&[Instruction::Const32(1), Instruction::Goto(-3)])
            .load()
            .expect_err("mid-instruction target");
        assert!(matches!(err, Error::Verification { .. }));
    }

    #[test]
    fn test_conventions() {
        let small =
            FunctionType::new(vec![ValueKind::I64; 3], vec![ValueKind::I32, ValueKind::I32]);
        assert_eq!(Convention::of(&small), Convention::Slots);
        assert_eq!(arg_slots(&small), 6);
        assert_eq!(return_slots(&small), 1);

        let wide = FunctionType::new(vec![ValueKind::I64; 127], vec![ValueKind::F64]);
        assert_eq!(Convention::of(&wide), Convention::Boxed);
        assert_eq!(arg_slots(&wide), 1);
        assert_eq!(return_slots(&wide), 2);
    }
}
