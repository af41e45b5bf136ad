// Single-pass analysis of one function body.
//
// Drives the type stack through the structured control flow and produces a
// flat list of normalized instructions: explicit labels and jumps, and a
// DROP_KEEP before every branch that leaves extra values on the stack.

use std::collections::{BTreeSet, HashMap};

use super::normalized::{Label, NormalizedInstruction as N};
use super::type_stack::{ScopeId, TypeStack};
use crate::wasm::{FunctionBody, FunctionType, Instruction, Module, Op, ValueKind};
use crate::{Error, Result};

/// Per-module analysis context.
pub struct Analyzer<'m> {
    module: &'m Module,
    global_kinds: Vec<ValueKind>,
    table_kinds: Vec<ValueKind>,
}

impl<'m> Analyzer<'m> {
    #[must_use]
    pub fn new(module: &'m Module) -> Self {
        Self {
            module,
            global_kinds: module.globals.iter().map(|g| g.kind).collect(),
            table_kinds: module.tables.iter().map(|t| t.element).collect(),
        }
    }

    #[must_use]
    pub fn module(&self) -> &'m Module {
        self.module
    }

    /// Analyze the function with index `func` (a defined function).
    pub fn analyze(&self, func: u32) -> Result<Vec<N>> {
        let body = self
            .module
            .body(func)
            .ok_or_else(|| Error::Internal(format!("function {func} has no body")))?;
        let ty = self
            .module
            .function_type(func)
            .ok_or_else(|| Error::Internal(format!("function {func} has no type")))?;

        let mut locals = ty.params.clone();
        locals.extend_from_slice(&body.locals);

        let mut pass = FunctionPass {
            analyzer: self,
            ty,
            body,
            locals,
            stack: TypeStack::new(),
            out: Vec::with_capacity(body.instructions.len()),
            next_label: body.instructions.len(),
        };
        let out = pass.run(func)?;

        if tracing::enabled!(tracing::Level::TRACE) {
            for ins in &out {
                tracing::trace!(function = func, "{ins}");
            }
        }
        Ok(out)
    }
}

struct FunctionPass<'a, 'm> {
    analyzer: &'a Analyzer<'m>,
    ty: &'m FunctionType,
    body: &'m FunctionBody,
    locals: Vec<ValueKind>,
    stack: TypeStack,
    out: Vec<N>,
    next_label: Label,
}

impl FunctionPass<'_, '_> {
    fn run(&mut self, func: u32) -> Result<Vec<N>> {
        let body = self.body;
        let instructions = &body.instructions;
        let wrap = |index: usize, source: Error| Error::Analysis {
            function: func,
            index,
            opcode: instructions
                .get(index)
                .map_or_else(|| "end".to_string(), |ins| ins.op.to_string()),
            source: Box::new(source),
        };

        let labels: BTreeSet<Label> = instructions.iter().flat_map(Instruction::labels).collect();

        // implicit block for the function
        let function_scope = FunctionType::new(Vec::new(), self.ty.results.clone());
        self.stack
            .enter_scope(ScopeId::Function, &function_scope)
            .map_err(|e| wrap(0, e))?;

        // depth of the last unconditional transfer; code is skipped until the
        // matching `else`/`end`
        let mut exit_depth: Option<usize> = None;
        for (idx, ins) in instructions.iter().enumerate() {
            if labels.contains(&idx) {
                self.out.push(N::Label(idx));
            }

            if let Some(depth) = exit_depth {
                if ins.depth > depth || !matches!(ins.op, Op::Else | Op::End) {
                    continue;
                }
                exit_depth = None;
                if ins.op == Op::End {
                    let scope = ins.scope.map_or(ScopeId::Function, ScopeId::Block);
                    self.stack
                        .restore_after_unreachable(scope)
                        .map_err(|e| wrap(idx, e))?;
                }
            }

            if self.step(idx, ins).map_err(|e| wrap(idx, e))? {
                exit_depth = Some(ins.depth);
            }
        }

        // implicit return at end of function
        let last = instructions.len().saturating_sub(1);
        self.emit_return().map_err(|e| wrap(last, e))?;
        self.stack.verify_empty().map_err(|e| wrap(last, e))?;
        Ok(std::mem::take(&mut self.out))
    }

    /// Process one instruction. Returns `true` after an unconditional transfer.
    fn step(&mut self, idx: usize, ins: &Instruction) -> Result<bool> {
        let module = self.analyzer.module;
        match &ins.op {
            Op::Nop => {}
            Op::Unreachable => {
                self.out.push(N::Trap);
                return Ok(true);
            }
            Op::Block(bt) | Op::Loop(bt) => {
                self.stack
                    .enter_scope(ScopeId::Block(idx), &module.block_type(*bt)?)?;
            }
            Op::If(bt) => {
                self.stack.pop(ValueKind::I32)?;
                self.stack
                    .enter_scope(ScopeId::Block(idx), &module.block_type(*bt)?)?;
                let label_false = label(ins.label_false)?;
                // both arms start from the same stack shape
                if self.body.instructions[label_false - 1].op == Op::Else {
                    self.stack.push_snapshot();
                }
                self.out.push(N::IfEq(label_false));
            }
            Op::Else => {
                self.stack.pop_snapshot()?;
                self.out.push(N::Goto(label(ins.label_true)?));
            }
            Op::End => {
                if let Some(opener) = ins.scope {
                    self.stack.exit_scope(ScopeId::Block(opener))?;
                }
            }
            Op::Br(_) => {
                let target = label(ins.label_true)?;
                if let Some(unwind) = self.unwind(idx, target)? {
                    self.out.push(unwind);
                }
                self.out.push(N::Goto(target));
                return Ok(true);
            }
            Op::BrIf(_) => {
                self.stack.pop(ValueKind::I32)?;
                let target = label(ins.label_true)?;
                if let Some(unwind) = self.unwind(idx, target)? {
                    self.out.push(N::IfEq(label(ins.label_false)?));
                    self.out.push(unwind);
                    self.out.push(N::Goto(target));
                } else {
                    self.out.push(N::IfNe(target));
                }
            }
            Op::BrTable { .. } => {
                self.stack.pop(ValueKind::I32)?;
                self.br_table(idx, &ins.label_table)?;
                return Ok(true);
            }
            Op::Return => {
                self.emit_return()?;
                return Ok(true);
            }
            Op::Call(func) => {
                self.call(*func)?;
            }
            Op::CallIndirect { type_index, table } => {
                self.stack.pop(ValueKind::I32)?;
                self.update_stack(&self.declared_type(*type_index)?)?;
                self.out.push(N::CallIndirect {
                    type_index: *type_index,
                    table: *table,
                });
            }
            // Tail calls are a call followed by the function's return sequence.
            Op::ReturnCall(func) => {
                self.call(*func)?;
                self.emit_return()?;
                return Ok(true);
            }
            Op::ReturnCallIndirect { type_index, table } => {
                self.stack.pop(ValueKind::I32)?;
                self.update_stack(&self.declared_type(*type_index)?)?;
                self.out.push(N::CallIndirect {
                    type_index: *type_index,
                    table: *table,
                });
                self.emit_return()?;
                return Ok(true);
            }
            Op::Drop => {
                let kind = self.stack.pop_any()?;
                self.out.push(N::Drop(kind));
            }
            Op::Select | Op::TypedSelect(_) => {
                self.stack.pop(ValueKind::I32)?;
                let kind = self.stack.peek()?;
                self.stack.pop(kind)?;
                self.stack.pop(kind)?;
                self.stack.push(kind);
                self.out.push(N::Select(kind));
            }
            Op::LocalTee(local) => {
                let kind = self.local(*local)?;
                self.stack.pop(kind)?;
                self.stack.push(kind);
                self.out.push(N::LocalTee {
                    local: *local,
                    kind,
                });
            }
            op => {
                self.simple(op)?;
                self.out.push(N::Wasm(op.clone()));
            }
        }
        Ok(false)
    }

    /// Table-driven stack effect of every operator without control semantics.
    fn simple(&mut self, op: &Op) -> Result<()> {
        use ValueKind::{FuncRef, I32, I64};
        let s = &mut self.stack;
        match op {
            Op::LocalGet(idx) => {
                let kind = local_kind(&self.locals, *idx)?;
                s.push(kind);
            }
            Op::LocalSet(idx) => s.pop(local_kind(&self.locals, *idx)?)?,
            Op::GlobalGet(idx) => s.push(kind_at(&self.analyzer.global_kinds, *idx, "global")?),
            Op::GlobalSet(idx) => s.pop(kind_at(&self.analyzer.global_kinds, *idx, "global")?)?,
            Op::TableGet(t) => {
                s.pop(I32)?;
                s.push(kind_at(&self.analyzer.table_kinds, *t, "table")?);
            }
            Op::TableSet(t) => {
                s.pop(kind_at(&self.analyzer.table_kinds, *t, "table")?)?;
                s.pop(I32)?;
            }
            Op::TableSize(_) | Op::MemorySize => s.push(I32),
            Op::TableGrow(t) => {
                s.pop(I32)?;
                s.pop(kind_at(&self.analyzer.table_kinds, *t, "table")?)?;
                s.push(I32);
            }
            Op::TableFill(t) => {
                s.pop(I32)?;
                s.pop(kind_at(&self.analyzer.table_kinds, *t, "table")?)?;
                s.pop(I32)?;
            }
            Op::TableCopy { .. }
            | Op::TableInit { .. }
            | Op::MemoryFill
            | Op::MemoryCopy
            | Op::MemoryInit(_) => {
                s.pop(I32)?;
                s.pop(I32)?;
                s.pop(I32)?;
            }
            Op::ElemDrop(_) | Op::DataDrop(_) => {}
            Op::Load(kind, _) => {
                s.pop(I32)?;
                s.push(kind.result());
            }
            Op::Store(kind, _) => {
                s.pop(kind.operand())?;
                s.pop(I32)?;
            }
            Op::MemoryGrow => {
                s.pop(I32)?;
                s.push(I32);
            }
            Op::I32Const(_) => s.push(I32),
            Op::I64Const(_) => s.push(I64),
            Op::F32Const(_) => s.push(ValueKind::F32),
            Op::F64Const(_) => s.push(ValueKind::F64),
            Op::RefNull(kind) => s.push(*kind),
            Op::RefIsNull => {
                let kind = s.pop_any()?;
                if !kind.is_ref() {
                    return Err(Error::TypeMismatch {
                        expected: FuncRef,
                        actual: Some(kind),
                    });
                }
                s.push(I32);
            }
            Op::RefFunc(_) => s.push(FuncRef),
            Op::Num(num) => {
                for kind in num.params().iter().rev() {
                    s.pop(*kind)?;
                }
                s.push(num.result());
            }
            other => return Err(Error::UnsupportedOpcode(other.to_string())),
        }
        Ok(())
    }

    fn local(&self, idx: u32) -> Result<ValueKind> {
        local_kind(&self.locals, idx)
    }

    fn declared_type(&self, type_index: u32) -> Result<FunctionType> {
        self.analyzer
            .module
            .types
            .get(type_index as usize)
            .cloned()
            .ok_or_else(|| Error::Internal(format!("type index {type_index} out of range")))
    }

    fn call(&mut self, func: u32) -> Result<()> {
        let ty = self
            .analyzer
            .module
            .function_type(func)
            .ok_or_else(|| Error::Internal(format!("call to unknown function {func}")))?;
        self.update_stack(ty)?;
        self.out.push(N::Call(func));
        Ok(())
    }

    fn update_stack(&mut self, ty: &FunctionType) -> Result<()> {
        for kind in ty.params.iter().rev() {
            self.stack.pop(*kind)?;
        }
        for kind in &ty.results {
            self.stack.push(*kind);
        }
        Ok(())
    }

    fn emit_return(&mut self) -> Result<()> {
        for kind in self.ty.results.iter().rev() {
            self.stack.pop(*kind)?;
        }
        self.out.push(N::Return(self.ty.results.clone()));
        Ok(())
    }

    fn br_table(&mut self, idx: usize, table: &[Label]) -> Result<()> {
        // only a default target: plain jump
        if let [target] = table {
            self.out.push(N::Drop(ValueKind::I32));
            if let Some(unwind) = self.unwind(idx, *target)? {
                self.out.push(unwind);
            }
            self.out.push(N::Goto(*target));
            return Ok(());
        }

        // one label (and one unwind) per unique target
        let mut unwinds = Vec::new();
        let mut resolved: HashMap<Label, Label> = HashMap::new();
        for &target in table {
            if resolved.contains_key(&target) {
                continue;
            }
            let mut label = target;
            if let Some(unwind) = self.unwind(idx, target)? {
                label = self.next_label;
                self.next_label += 1;
                unwinds.push(N::Label(label));
                unwinds.push(unwind);
                unwinds.push(N::Goto(target));
            }
            resolved.insert(target, label);
        }
        self.out
            .push(N::Switch(table.iter().map(|t| resolved[t]).collect()));
        self.out.extend(unwinds);
        Ok(())
    }

    /// Unwind sequence for a jump from instruction `at` to `label`, if values
    /// have to be discarded beneath the ones the target expects.
    fn unwind(&self, at: usize, label: Label) -> Result<Option<N>> {
        let module = self.analyzer.module;
        let instructions = &self.body.instructions;
        let forward = label > at;

        let (scope, block_type) = if forward {
            let end = instructions
                .get(label)
                .ok_or_else(|| Error::Internal(format!("branch target {label} out of range")))?;
            match end.scope {
                Some(opener) => (
                    ScopeId::Block(opener),
                    block_type_of(module, &instructions[opener])?,
                ),
                None => (
                    ScopeId::Function,
                    FunctionType::new(Vec::new(), self.ty.results.clone()),
                ),
            }
        } else {
            (
                ScopeId::Block(label),
                block_type_of(module, &instructions[label])?,
            )
        };

        // forward jumps carry the block results, loop re-entry its parameters
        let kept = if forward {
            block_type.results.len()
        } else {
            block_type.params.len()
        };
        let base = self.stack.scope_depth_at(scope)? - self.stack.scope_params(scope)?;
        let depth = self.stack.len();
        let Some(drop) = depth.checked_sub(base + kept).filter(|d| *d > 0) else {
            return Ok(None);
        };

        let types = self.stack.types();
        let start = depth - kept - drop;
        Ok(Some(N::DropKeep {
            drop: types[start..start + drop].to_vec(),
            keep: types[depth - kept..].to_vec(),
        }))
    }
}

fn label(label: Option<Label>) -> Result<Label> {
    label.ok_or_else(|| Error::Internal("branch without resolved label".to_string()))
}

fn local_kind(locals: &[ValueKind], idx: u32) -> Result<ValueKind> {
    kind_at(locals, idx, "local")
}

fn kind_at(kinds: &[ValueKind], idx: u32, what: &str) -> Result<ValueKind> {
    kinds
        .get(idx as usize)
        .copied()
        .ok_or_else(|| Error::Internal(format!("{what} index {idx} out of range")))
}

fn block_type_of(module: &Module, opener: &Instruction) -> Result<FunctionType> {
    match opener.op {
        Op::Block(bt) | Op::Loop(bt) | Op::If(bt) => module.block_type(bt),
        ref other => Err(Error::Internal(format!("{other} does not open a block"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wasm::{LoadKind, NumOp};

    fn analyze(wat: &str, func: u32) -> Vec<N> {
        let wasm = wat::parse_str(wat).expect("wat");
        let module = Module::parse(&wasm).expect("parse");
        Analyzer::new(&module).analyze(func).expect("analyze")
    }

    fn drop_keeps(out: &[N]) -> Vec<(Vec<ValueKind>, Vec<ValueKind>)> {
        out.iter()
            .filter_map(|ins| match ins {
                N::DropKeep { drop, keep } => Some((drop.clone(), keep.clone())),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_forward_branch_drops_beneath_results() {
        let out = analyze(
            r#"(module (func (result i32)
                (block (result i32)
                    i32.const 1
                    i64.const 2
                    i32.const 3
                    br 0)))"#,
            0,
        );
        assert_eq!(
            drop_keeps(&out),
            vec![(vec![ValueKind::I32, ValueKind::I64], vec![ValueKind::I32])]
        );
        assert!(out.contains(&N::Return(vec![ValueKind::I32])));
    }

    #[test]
    fn test_no_unwind_when_stack_matches() {
        let out = analyze(
            r#"(module (func (param i32) (result i32)
                (block (result i32)
                    i32.const 1
                    local.get 0
                    br_if 0)))"#,
            0,
        );
        assert!(drop_keeps(&out).is_empty());
        assert!(out.iter().any(|i| matches!(i, N::IfNe(_))));
    }

    #[test]
    fn test_backward_branch_keeps_loop_params() {
        let out = analyze(
            r#"(module
                (type $t (func (param i64) (result i64)))
                (func (param i32) (result i64)
                    i64.const 10
                    (loop (type $t)
                        i32.const 99
                        drop
                        f32.const 1
                        i64.const 3
                        local.get 0
                        br_if 0
                        drop
                        drop)))"#,
            0,
        );
        // loop param plus f32 sit beneath the i64 carried back
        assert_eq!(
            drop_keeps(&out),
            vec![(vec![ValueKind::I64, ValueKind::F32], vec![ValueKind::I64])]
        );
        let loop_label = out
            .iter()
            .find_map(|i| match i {
                N::Label(l) => Some(*l),
                _ => None,
            })
            .expect("loop label");
        assert!(out.contains(&N::Goto(loop_label)));
    }

    #[test]
    fn test_block_params_are_not_counted_twice() {
        let out = analyze(
            r#"(module
                (type $t (func (param i32) (result i32)))
                (func (result i32)
                    i32.const 7
                    (block (type $t)
                        i32.const 1
                        i32.add
                        i32.const 5
                        br 0)))"#,
            0,
        );
        assert_eq!(
            drop_keeps(&out),
            vec![(vec![ValueKind::I32], vec![ValueKind::I32])]
        );
    }

    #[test]
    fn test_unreachable_tail_is_skipped_and_restored() {
        let out = analyze(
            r#"(module (func (result i32)
                (block (result i32)
                    i32.const 1
                    br 0
                    i64.const 5
                    drop
                    i32.const 9)
                i32.const 2
                i32.add))"#,
            0,
        );
        assert!(!out.contains(&N::Wasm(Op::I64Const(5))));
        assert!(!out.contains(&N::Wasm(Op::I32Const(9))));
        assert!(out.contains(&N::Wasm(Op::Num(NumOp::I32Add))));
    }

    #[test]
    fn test_if_else_arms_share_snapshot() {
        let out = analyze(
            r#"(module (func (param i32) (result i64)
                local.get 0
                (if (result i64)
                    (then unreachable)
                    (else i64.const 4))))"#,
            0,
        );
        assert!(out.contains(&N::Trap));
        assert!(out.contains(&N::Wasm(Op::I64Const(4))));
        assert!(out.iter().any(|i| matches!(i, N::IfEq(_))));
    }

    #[test]
    fn test_br_table_unique_targets_get_unwinds() {
        let out = analyze(
            r#"(module (func (param i32) (result i32)
                (block $a (result i32)
                    i32.const 5
                    (block $b (result i32)
                        i32.const 10
                        i32.const 20
                        local.get 0
                        br_table $a $b $a)
                    i32.add)))"#,
            0,
        );
        let switch = out
            .iter()
            .find_map(|i| match i {
                N::Switch(t) => Some(t.clone()),
                _ => None,
            })
            .expect("switch");
        assert_eq!(switch.len(), 3);
        assert_eq!(switch[0], switch[2]);
        assert_ne!(switch[0], switch[1]);
        // $a sits below one extra value, $b does not
        let unwinds = drop_keeps(&out);
        assert_eq!(unwinds.len(), 2);
        assert!(unwinds.contains(&(vec![ValueKind::I32], vec![ValueKind::I32])));
        assert!(unwinds.contains(&(vec![ValueKind::I32, ValueKind::I32], vec![ValueKind::I32])));
        // synthetic labels follow the switch
        let pos = out.iter().position(|i| matches!(i, N::Switch(_))).expect("switch");
        assert!(matches!(out[pos + 1], N::Label(l) if l == switch[0] || l == switch[1]));
    }

    #[test]
    fn test_br_table_with_only_default_is_a_jump() {
        let out = analyze(
            r#"(module (func (param i32)
                (block
                    local.get 0
                    br_table 0)))"#,
            0,
        );
        assert!(out.contains(&N::Drop(ValueKind::I32)));
        assert!(!out.iter().any(|i| matches!(i, N::Switch(_))));
    }

    #[test]
    fn test_tail_call_becomes_call_and_return() {
        let out = analyze(
            r#"(module
                (func $f (param i64) (result i64) local.get 0)
                (func (result i64)
                    i64.const 1
                    return_call $f))"#,
            1,
        );
        let pos = out.iter().position(|i| *i == N::Call(0)).expect("call");
        assert_eq!(out[pos + 1], N::Return(vec![ValueKind::I64]));
    }

    #[test]
    fn test_records_operand_kinds() {
        let out = analyze(
            r#"(module (memory 1) (func (param i32) (result f64)
                (local f64)
                local.get 0
                f64.load
                local.tee 1
                f64.const 0
                local.get 0
                select
                i64.const 1
                drop))"#,
            0,
        );
        assert!(out.contains(&N::LocalTee {
            local: 1,
            kind: ValueKind::F64
        }));
        assert!(out.contains(&N::Select(ValueKind::F64)));
        assert!(out.contains(&N::Drop(ValueKind::I64)));
        assert!(out.iter().any(|i| matches!(i, N::Wasm(Op::Load(LoadKind::F64, _)))));
    }
}
