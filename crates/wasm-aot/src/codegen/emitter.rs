// Core code-unit emitter: instruction buffer, labels and jump fixups.
//
// Jumps are emitted with a zero offset and patched once every label has a
// byte position; offsets are relative to the start of the jumping instruction.

use std::collections::HashMap;

use crate::analysis::Label;
use crate::vm::{CodeUnit, Convention, Instruction, verify};
use crate::wasm::{FunctionType, Module, ValueKind};
use crate::{Error, Result};

/// Per-function facts the lowering routines need, fixed before emission.
pub struct LoweringContext<'m> {
    pub module: &'m Module,
    pub function: u32,
    pub signature: FunctionType,
    /// Kind of every local, parameters first.
    pub local_kinds: Vec<ValueKind>,
    /// First slot of every local.
    pub local_slots: Vec<u16>,
    /// Slots used by locals.
    pub frame_slots: usize,
}

impl<'m> LoweringContext<'m> {
    pub fn new(module: &'m Module, function: u32) -> Result<Self> {
        let signature = module
            .function_type(function)
            .cloned()
            .ok_or_else(|| Error::Internal(format!("function {function} has no type")))?;
        let body = module
            .body(function)
            .ok_or_else(|| Error::Internal(format!("function {function} has no body")))?;

        let mut local_kinds = signature.params.clone();
        local_kinds.extend_from_slice(&body.locals);

        let mut local_slots = Vec::with_capacity(local_kinds.len());
        let mut next = 0usize;
        for kind in &local_kinds {
            let slot = u16::try_from(next).map_err(|_| too_many_locals(function, next))?;
            local_slots.push(slot);
            next += kind.slots();
        }
        if next > usize::from(u16::MAX) {
            return Err(too_many_locals(function, next));
        }

        Ok(Self {
            module,
            function,
            signature,
            local_kinds,
            local_slots,
            frame_slots: next,
        })
    }

    pub fn local(&self, index: u32) -> Result<(u16, ValueKind)> {
        let i = index as usize;
        match (self.local_slots.get(i), self.local_kinds.get(i)) {
            (Some(slot), Some(kind)) => Ok((*slot, *kind)),
            _ => Err(Error::Internal(format!("local {index} out of range"))),
        }
    }

    pub fn global_kind(&self, index: u32) -> Result<ValueKind> {
        self.module
            .globals
            .get(index as usize)
            .map(|g| g.kind)
            .ok_or_else(|| Error::Internal(format!("global {index} out of range")))
    }
}

fn too_many_locals(function: u32, slots: usize) -> Error {
    Error::Unsupported(format!(
        "function {function} needs {slots} local slots, more than a code unit can address"
    ))
}

/// Emitter for a single code unit.
pub struct UnitEmitter {
    pub(crate) function: u32,
    pub(crate) instructions: Vec<Instruction>,
    pub(crate) labels: Vec<Option<usize>>,
    /// (instruction index, jump operand index, label).
    pub(crate) fixups: Vec<(usize, usize, usize)>,
    /// Current byte offset of the emitted code.
    pub(crate) byte_offset: usize,
    /// Analyzer label → emitter label.
    label_map: HashMap<Label, usize>,
    signatures: Vec<FunctionType>,
    signature_index: HashMap<FunctionType, u16>,
    pub(crate) local_slots: usize,
    scratch: Option<u16>,
}

impl UnitEmitter {
    #[must_use]
    pub fn new(function: u32, local_slots: usize) -> Self {
        Self {
            function,
            instructions: Vec::new(),
            labels: Vec::new(),
            fixups: Vec::new(),
            byte_offset: 0,
            label_map: HashMap::new(),
            signatures: Vec::new(),
            signature_index: HashMap::new(),
            local_slots,
            scratch: None,
        }
    }

    pub fn emit(&mut self, instr: Instruction) {
        self.byte_offset += instr.encoded_len();
        self.instructions.push(instr);
    }

    pub fn alloc_label(&mut self) -> usize {
        let id = self.labels.len();
        self.labels.push(None);
        id
    }

    /// Emitter label for an analyzer label, allocated on first use.
    pub fn label_for(&mut self, label: Label) -> usize {
        if let Some(id) = self.label_map.get(&label) {
            return *id;
        }
        let id = self.alloc_label();
        self.label_map.insert(label, id);
        id
    }

    pub fn define_label(&mut self, label: usize) {
        self.labels[label] = Some(self.byte_offset);
    }

    /// A jump to a label that is already defined goes backwards.
    #[must_use]
    pub fn is_defined(&self, label: usize) -> bool {
        self.labels.get(label).is_some_and(Option::is_some)
    }

    pub fn emit_jump_to_label(&mut self, label: usize) {
        self.fixups.push((self.instructions.len(), 0, label));
        self.emit(Instruction::Goto(0));
    }

    pub fn emit_if_eq_to_label(&mut self, label: usize) {
        self.fixups.push((self.instructions.len(), 0, label));
        self.emit(Instruction::IfEq(0));
    }

    pub fn emit_if_ne_to_label(&mut self, label: usize) {
        self.fixups.push((self.instructions.len(), 0, label));
        self.emit(Instruction::IfNe(0));
    }

    /// Jump table over `labels`; the last one is the default.
    pub fn emit_switch_to_labels(&mut self, labels: &[usize]) -> Result<()> {
        if labels.len() > usize::from(u16::MAX) {
            return Err(Error::Unsupported(format!(
                "branch table with {} targets",
                labels.len()
            )));
        }
        let idx = self.instructions.len();
        for (operand, label) in labels.iter().enumerate() {
            self.fixups.push((idx, operand, *label));
        }
        self.emit(Instruction::Switch(vec![0; labels.len()]));
        Ok(())
    }

    /// Pool index of `ty`, added on first use.
    pub fn signature(&mut self, ty: &FunctionType) -> Result<u16> {
        if let Some(idx) = self.signature_index.get(ty) {
            return Ok(*idx);
        }
        let idx = u16::try_from(self.signatures.len())
            .map_err(|_| Error::Unsupported("signature pool overflow".to_string()))?;
        self.signatures.push(ty.clone());
        self.signature_index.insert(ty.clone(), idx);
        Ok(idx)
    }

    /// One extra local slot for shuffling a single-slot operand.
    pub fn scratch_slot(&mut self) -> Result<u16> {
        if let Some(slot) = self.scratch {
            return Ok(slot);
        }
        let slot = u16::try_from(self.local_slots)
            .map_err(|_| too_many_locals(self.function, self.local_slots + 1))?;
        self.local_slots += 1;
        self.scratch = Some(slot);
        Ok(slot)
    }

    pub fn resolve_fixups(&mut self) -> Result<()> {
        // Precompute byte offsets for each instruction to avoid O(n²) re-scanning.
        let mut offsets = Vec::with_capacity(self.instructions.len());
        let mut running = 0usize;
        for instr in &self.instructions {
            offsets.push(running);
            running += instr.encoded_len();
        }

        for &(instr_idx, operand, label_id) in &self.fixups {
            let target_offset = self.labels[label_id]
                .ok_or_else(|| Error::Internal(format!("unresolved label {label_id}")))?;
            let instr_start = offsets[instr_idx];
            let relative = i64::try_from(target_offset).unwrap_or(i64::MAX)
                - i64::try_from(instr_start).unwrap_or(i64::MAX);
            let relative = i32::try_from(relative)
                .map_err(|_| Error::Internal(format!("jump distance {relative} overflows")))?;

            let slot = self.instructions[instr_idx]
                .jump_offsets_mut()
                .get_mut(operand)
                .ok_or_else(|| Error::Internal(format!("fixup on non-jump {instr_idx}")))?;
            *slot = relative;
        }
        Ok(())
    }

    /// Patch jumps, encode, enforce the size limit and verify the result.
    pub fn finish(mut self, signature: &FunctionType, max_code_size: usize) -> Result<CodeUnit> {
        self.resolve_fixups()?;

        let size = self.byte_offset;
        if size > max_code_size {
            return Err(Error::CodeTooLarge {
                function: self.function,
                size,
                limit: max_code_size,
            });
        }

        let mut bytes = Vec::with_capacity(size);
        for instr in &self.instructions {
            instr.encode_into(&mut bytes);
        }

        let mut unit = CodeUnit {
            function: self.function,
            bytes,
            signature: signature.clone(),
            convention: Convention::of(signature),
            local_slots: self.local_slots,
            max_stack: 0,
            signatures: self.signatures,
        };
        unit.max_stack = verify(&unit.load()?)?;
        Ok(unit)
    }
}
