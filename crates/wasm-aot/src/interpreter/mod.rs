// Baseline interpreter over annotated instructions.
//
// Values are raw 64-bit payloads, one stack entry per value. Interpreted
// callees of the same instance run on this interpreter's own frame stack.
// Compiled callees of the same instance suspend the interpreter and go to the
// machine driver; imports and other instances go back through the store.

#![allow(
    clippy::cast_possible_truncation, // i32 payloads live zero-extended in u64 entries
    clippy::cast_sign_loss,
    clippy::too_many_lines
)]

use std::sync::Arc;

use crate::Trap;
use crate::machine::Exit;
use crate::numeric;
use crate::runtime::{Instance, NULL_REF, Store};
use crate::wasm::{BlockType, FuncRef, InstanceId, Instruction, Module, Op, Value, ValueKind};

type Result<T> = std::result::Result<T, Trap>;

/// An open block. Branches to it keep `arity` values above `height`.
#[derive(Debug, Clone, Copy)]
struct Control {
    height: usize,
    arity: usize,
    is_loop: bool,
}

struct Frame {
    func: u32,
    pc: usize,
    locals: Vec<u64>,
    /// Operand stack height below this frame's values.
    base: usize,
    /// Control stack height below this frame's function-level block.
    controls: usize,
    results: usize,
    /// Set by `return_call`: return as soon as the callee does.
    tail: bool,
}

enum Transfer {
    Call(u32),
    Return,
    /// Run a compiled function of this instance; its arguments are on top of
    /// the stack.
    Compiled(u32),
}

/// One call started by the driver, above the frames suspended below it.
#[derive(Debug, Clone, Copy)]
struct Segment {
    entry: u32,
    frames: usize,
    base: usize,
}

/// Interpreter stacks kept while the executor runs.
#[derive(Default)]
pub(crate) struct InterpState {
    stack: Vec<u64>,
    controls: Vec<Control>,
    frames: Vec<Frame>,
    segments: Vec<Segment>,
}

/// Run `func` of instance `id` in the interpreter. Compiled callees of the
/// same instance are called through the store.
pub(crate) fn execute(
    store: &mut Store,
    id: InstanceId,
    func: u32,
    args: &[Value],
) -> Result<Vec<Value>> {
    let module = Arc::clone(&store.live(id)?.module);
    if func < module.import_count() {
        return store.call_import(id, func, args);
    }

    let depth = store.depth;
    let mut interpreter = Interpreter::attach(store, id, module, InterpState::default());
    let result = interpreter.run(func, args);
    interpreter.store.depth = depth;
    result
}

pub(crate) struct Interpreter<'a> {
    store: &'a mut Store,
    instance: InstanceId,
    module: Arc<Module>,
    stack: Vec<u64>,
    controls: Vec<Control>,
    frames: Vec<Frame>,
    segments: Vec<Segment>,
}

impl<'a> Interpreter<'a> {
    pub(crate) fn attach(
        store: &'a mut Store,
        instance: InstanceId,
        module: Arc<Module>,
        state: InterpState,
    ) -> Self {
        Self {
            store,
            instance,
            module,
            stack: state.stack,
            controls: state.controls,
            frames: state.frames,
            segments: state.segments,
        }
    }

    pub(crate) fn detach(self) -> InterpState {
        InterpState {
            stack: self.stack,
            controls: self.controls,
            frames: self.frames,
            segments: self.segments,
        }
    }

    fn run(&mut self, entry: u32, args: &[Value]) -> Result<Vec<Value>> {
        let mut exit = self.start(entry, args)?;
        loop {
            match exit {
                Exit::Return(values) => return Ok(values),
                Exit::Call(func, args) => {
                    let results = self.store.call(self.instance, func, &args)?;
                    exit = self.resume_with(&results)?;
                }
            }
        }
    }

    /// Call defined function `entry` above the suspended frames.
    pub(crate) fn start(&mut self, entry: u32, args: &[Value]) -> Result<Exit> {
        let base = self.stack.len();
        self.push_values(args);
        self.segments.push(Segment {
            entry,
            frames: self.frames.len(),
            base,
        });
        self.enter(entry)?;
        self.step()
    }

    /// Continue the frame suspended on a compiled callee with its results.
    pub(crate) fn resume_with(&mut self, results: &[Value]) -> Result<Exit> {
        self.push_values(results);
        if self.frames.last().is_some_and(|f| f.tail) {
            self.unwind_return();
        }
        self.step()
    }

    /// Run until the current segment's entry returns or control passes to
    /// compiled code.
    fn step(&mut self) -> Result<Exit> {
        loop {
            let segment = *self
                .segments
                .last()
                .ok_or_else(|| Trap::Host("no active call".to_string()))?;
            let Some(frame) = self.frames.last().filter(|_| self.frames.len() > segment.frames)
            else {
                self.segments.pop();
                return self.segment_results(segment).map(Exit::Return);
            };
            let (func, pc) = (frame.func, frame.pc);
            let module = Arc::clone(&self.module);
            let body = module.body(func).ok_or(Trap::UnknownFunction(func))?;
            match self.execute(&body.instructions, pc)? {
                Transfer::Call(callee) => self.enter(callee)?,
                Transfer::Return => self.unwind_return(),
                Transfer::Compiled(callee) => {
                    let ty = module
                        .function_type(callee)
                        .ok_or(Trap::UnknownFunction(callee))?;
                    let args = self.pop_values(&ty.params);
                    return Ok(Exit::Call(callee, args));
                }
            }
        }
    }

    fn segment_results(&mut self, segment: Segment) -> Result<Vec<Value>> {
        let module = Arc::clone(&self.module);
        let ty = module
            .function_type(segment.entry)
            .ok_or(Trap::UnknownFunction(segment.entry))?;
        let bits = self.stack.split_off(segment.base.min(self.stack.len()));
        Ok(ty
            .results
            .iter()
            .zip(bits)
            .map(|(kind, bits)| Value::from_bits(*kind, bits))
            .collect())
    }

    /// Leave the returning frame and every tail-calling frame waiting on it,
    /// without crossing into suspended callers of the current segment.
    fn unwind_return(&mut self) {
        let floor = self.segments.last().map_or(0, |s| s.frames);
        self.leave();
        while self.frames.len() > floor && self.frames.last().is_some_and(|f| f.tail) {
            self.leave();
        }
    }

    fn check_interrupt(&self) -> Result<()> {
        if self.store.take_interrupt() {
            Err(Trap::Interrupted)
        } else {
            Ok(())
        }
    }

    fn instance(&mut self) -> Result<&mut Instance> {
        self.store.live(self.instance)
    }

    fn enter(&mut self, func: u32) -> Result<()> {
        if self.store.depth >= self.store.limits().max_call_depth {
            return Err(Trap::CallStackExhausted);
        }
        let ty = self
            .module
            .function_type(func)
            .ok_or(Trap::UnknownFunction(func))?;
        let body = self.module.body(func).ok_or(Trap::UnknownFunction(func))?;

        let base = self.stack.len().saturating_sub(ty.params.len());
        let mut locals = self.stack.split_off(base);
        locals.extend(body.locals.iter().map(|kind| kind.default_value().to_bits()));

        let controls = self.controls.len();
        self.controls.push(Control {
            height: base,
            arity: ty.results.len(),
            is_loop: false,
        });
        self.frames.push(Frame {
            func,
            pc: 0,
            locals,
            base,
            controls,
            results: ty.results.len(),
            tail: false,
        });
        self.store.depth += 1;
        Ok(())
    }

    /// Pop the current frame, moving its results down to its base.
    fn leave(&mut self) {
        let Some(frame) = self.frames.pop() else {
            return;
        };
        let at = self.stack.len().saturating_sub(frame.results);
        self.stack.drain(frame.base..at);
        self.controls.truncate(frame.controls);
        self.store.depth -= 1;
    }

    fn suspend(&mut self, pc: usize, tail: bool) {
        if let Some(frame) = self.frames.last_mut() {
            frame.pc = pc;
            frame.tail = tail;
        }
    }

    // Validated code never underflows the operand stack.
    fn pop(&mut self) -> u64 {
        self.stack.pop().unwrap_or_default()
    }

    fn pop_u32(&mut self) -> u32 {
        self.pop() as u32
    }

    fn push_u32(&mut self, v: u32) {
        self.stack.push(u64::from(v));
    }

    fn pop_values(&mut self, kinds: &[ValueKind]) -> Vec<Value> {
        let at = self.stack.len().saturating_sub(kinds.len());
        let bits = self.stack.split_off(at);
        kinds
            .iter()
            .zip(bits)
            .map(|(kind, bits)| Value::from_bits(*kind, bits))
            .collect()
    }

    fn push_values(&mut self, values: &[Value]) {
        self.stack.extend(values.iter().map(Value::to_bits));
    }

    fn enter_block(&mut self, block: BlockType, is_loop: bool) -> Result<()> {
        let ty = self
            .module
            .block_type(block)
            .map_err(|e| Trap::Host(e.to_string()))?;
        let height = self.stack.len().saturating_sub(ty.params.len());
        let arity = if is_loop {
            ty.params.len()
        } else {
            ty.results.len()
        };
        self.controls.push(Control {
            height,
            arity,
            is_loop,
        });
        Ok(())
    }

    /// Branch `depth` blocks out and return the next pc. `target` is the
    /// annotated label: a loop opener or the closing `end`.
    fn branch(&mut self, depth: u32, target: usize) -> Result<usize> {
        let index = self
            .controls
            .len()
            .checked_sub(1 + depth as usize)
            .ok_or_else(|| Trap::Host(format!("branch depth {depth} out of range")))?;
        let control = self.controls[index];
        let keep_from = self.stack.len().saturating_sub(control.arity);
        self.stack.drain(control.height..keep_from);
        if control.is_loop {
            self.check_interrupt()?;
            self.controls.truncate(index + 1);
            Ok(target + 1)
        } else {
            // the closing `end` pops the target block itself
            self.controls.truncate(index + 1);
            Ok(target)
        }
    }

    /// Call `func` of this instance. Returns a transfer when the callee runs
    /// on this interpreter's frame stack.
    fn call(&mut self, func: u32, pc: usize, tail: bool) -> Result<Option<Transfer>> {
        self.check_interrupt()?;
        let imported = func < self.module.import_count();
        if !imported {
            self.suspend(pc, tail);
            return Ok(Some(if self.instance()?.machine.interprets(func) {
                Transfer::Call(func)
            } else {
                Transfer::Compiled(func)
            }));
        }

        let module = Arc::clone(&self.module);
        let ty = module
            .function_type(func)
            .ok_or(Trap::UnknownFunction(func))?;
        let args = self.pop_values(&ty.params);
        let results = if imported {
            self.store.call_import(self.instance, func, &args)?
        } else {
            self.store.call(self.instance, func, &args)?
        };
        self.push_values(&results);
        Ok(tail.then_some(Transfer::Return))
    }

    fn call_indirect(
        &mut self,
        type_index: u32,
        table: u32,
        pc: usize,
        tail: bool,
    ) -> Result<Option<Transfer>> {
        let module = Arc::clone(&self.module);
        let expected = module
            .types
            .get(type_index as usize)
            .ok_or_else(|| Trap::Host(format!("type index {type_index} out of range")))?;

        let element = self.pop_u32();
        let table = self.instance()?.tab(table)?;
        if element >= table.size() {
            return Err(Trap::UndefinedElement);
        }
        let Value::FuncRef(Some(callee)) = table.get_value(element)? else {
            return Err(Trap::UninitializedElement);
        };

        if callee.instance == self.instance {
            if module.function_type(callee.index) != Some(expected) {
                return Err(Trap::IndirectCallTypeMismatch);
            }
            return self.call(callee.index, pc, tail);
        }

        if self.store.function_type(callee)? != expected {
            return Err(Trap::IndirectCallTypeMismatch);
        }
        self.check_interrupt()?;
        let args = self.pop_values(&expected.params);
        let results = self.store.call(callee.instance, callee.index, &args)?;
        self.push_values(&results);
        Ok(tail.then_some(Transfer::Return))
    }

    fn execute(&mut self, code: &[Instruction], mut pc: usize) -> Result<Transfer> {
        let controls_base = self.frames.last().map_or(0, |f| f.controls);
        loop {
            let Some(ins) = code.get(pc) else {
                return Ok(Transfer::Return);
            };
            pc += 1;

            match &ins.op {
                Op::Unreachable => return Err(Trap::Unreachable),
                Op::Nop => {}
                Op::Block(bt) => self.enter_block(*bt, false)?,
                Op::Loop(bt) => self.enter_block(*bt, true)?,
                Op::If(bt) => {
                    let cond = self.pop_u32();
                    self.enter_block(*bt, false)?;
                    if cond == 0 {
                        pc = ins.label_false.unwrap_or(pc);
                    }
                }
                Op::Else => pc = ins.label_true.unwrap_or(pc),
                Op::End => {
                    self.controls.pop();
                    if self.controls.len() <= controls_base {
                        return Ok(Transfer::Return);
                    }
                }
                Op::Br(depth) => {
                    let target = ins.label_true.unwrap_or(pc);
                    pc = self.branch(*depth, target)?;
                }
                Op::BrIf(depth) => {
                    if self.pop_u32() != 0 {
                        let target = ins.label_true.unwrap_or(pc);
                        pc = self.branch(*depth, target)?;
                    }
                }
                Op::BrTable { targets, default } => {
                    let index = self.pop_u32() as usize;
                    let (depth, slot) = match targets.get(index) {
                        Some(depth) => (*depth, index),
                        None => (*default, targets.len()),
                    };
                    let target = ins.label_table.get(slot).copied().unwrap_or(pc);
                    pc = self.branch(depth, target)?;
                }
                Op::Return => return Ok(Transfer::Return),

                Op::Call(func) => {
                    if let Some(transfer) = self.call(*func, pc, false)? {
                        return Ok(transfer);
                    }
                }
                Op::ReturnCall(func) => {
                    return Ok(self.call(*func, pc, true)?.unwrap_or(Transfer::Return));
                }
                Op::CallIndirect { type_index, table } => {
                    if let Some(transfer) = self.call_indirect(*type_index, *table, pc, false)? {
                        return Ok(transfer);
                    }
                }
                Op::ReturnCallIndirect { type_index, table } => {
                    return Ok(self
                        .call_indirect(*type_index, *table, pc, true)?
                        .unwrap_or(Transfer::Return));
                }

                Op::Drop => {
                    self.pop();
                }
                Op::Select | Op::TypedSelect(_) => {
                    let cond = self.pop_u32();
                    let b = self.pop();
                    let a = self.pop();
                    self.stack.push(if cond != 0 { a } else { b });
                }
                Op::LocalGet(index) => {
                    let v = self.frame_locals()?[*index as usize];
                    self.stack.push(v);
                }
                Op::LocalSet(index) => {
                    let v = self.pop();
                    self.frame_locals()?[*index as usize] = v;
                }
                Op::LocalTee(index) => {
                    let v = self.stack.last().copied().unwrap_or_default();
                    self.frame_locals()?[*index as usize] = v;
                }
                Op::GlobalGet(index) => {
                    let v = self.instance()?.globals[*index as usize];
                    self.stack.push(v);
                }
                Op::GlobalSet(index) => {
                    let v = self.pop();
                    self.instance()?.globals[*index as usize] = v;
                }

                Op::TableGet(table) => {
                    let index = self.pop_u32();
                    let v = self.instance()?.tab(*table)?.get(index)?;
                    self.stack.push(v);
                }
                Op::TableSet(table) => {
                    let v = self.pop();
                    let index = self.pop_u32();
                    self.instance()?.tab(*table)?.set(index, v)?;
                }
                Op::TableSize(table) => {
                    let size = self.instance()?.tab(*table)?.size();
                    self.push_u32(size);
                }
                Op::TableGrow(table) => {
                    let delta = self.pop_u32();
                    let init = self.pop();
                    let old = self
                        .instance()?
                        .tab(*table)?
                        .grow(delta, init)
                        .unwrap_or(u32::MAX);
                    self.push_u32(old);
                }
                Op::TableFill(table) => {
                    let len = self.pop_u32();
                    let v = self.pop();
                    let start = self.pop_u32();
                    self.instance()?.tab(*table)?.fill(start, v, len)?;
                }
                Op::TableCopy { dst, src } => {
                    let len = self.pop_u32();
                    let s = self.pop_u32();
                    let d = self.pop_u32();
                    self.instance()?.table_copy(*dst, *src, d, s, len)?;
                }
                Op::TableInit { elem, table } => {
                    let len = self.pop_u32();
                    let s = self.pop_u32();
                    let d = self.pop_u32();
                    self.instance()?.table_init(*elem, *table, d, s, len)?;
                }
                Op::ElemDrop(segment) => self.instance()?.elem_drop(*segment),

                Op::Load(kind, memarg) => {
                    let addr = u64::from(self.pop_u32()).saturating_add(memarg.offset);
                    let v = self.instance()?.mem()?.load(*kind, addr)?;
                    self.stack.push(v);
                }
                Op::Store(kind, memarg) => {
                    let v = self.pop();
                    let addr = u64::from(self.pop_u32()).saturating_add(memarg.offset);
                    self.instance()?.mem()?.store(*kind, addr, v)?;
                }
                Op::MemorySize => {
                    let pages = self.instance()?.mem()?.pages();
                    self.push_u32(pages);
                }
                Op::MemoryGrow => {
                    let delta = self.pop_u32();
                    let old = self.instance()?.mem()?.grow(delta).unwrap_or(u32::MAX);
                    self.push_u32(old);
                }
                Op::MemoryFill => {
                    let len = self.pop_u32();
                    let value = self.pop_u32();
                    let dst = self.pop_u32();
                    self.instance()?.mem()?.fill(dst, value as u8, len)?;
                }
                Op::MemoryCopy => {
                    let len = self.pop_u32();
                    let src = self.pop_u32();
                    let dst = self.pop_u32();
                    self.instance()?.mem()?.copy(dst, src, len)?;
                }
                Op::MemoryInit(segment) => {
                    let len = self.pop_u32();
                    let src = self.pop_u32();
                    let dst = self.pop_u32();
                    self.instance()?.memory_init(*segment, dst, src, len)?;
                }
                Op::DataDrop(segment) => self.instance()?.data_drop(*segment),

                Op::I32Const(v) => self.push_u32(*v as u32),
                Op::I64Const(v) => self.stack.push(*v as u64),
                Op::F32Const(bits) => self.push_u32(*bits),
                Op::F64Const(bits) => self.stack.push(*bits),
                Op::RefNull(_) => self.stack.push(NULL_REF),
                Op::RefIsNull => {
                    let v = self.pop();
                    self.push_u32(u32::from(v == NULL_REF));
                }
                Op::RefFunc(index) => {
                    let func = FuncRef {
                        instance: self.instance,
                        index: *index,
                    };
                    self.stack.push(Value::FuncRef(Some(func)).to_bits());
                }
                Op::Num(op) => {
                    let arity = op.params().len();
                    let at = self.stack.len().saturating_sub(arity);
                    let result = numeric::eval(*op, &self.stack[at..])?;
                    self.stack.truncate(at);
                    self.stack.push(result);
                }
            }
        }
    }

    fn frame_locals(&mut self) -> Result<&mut Vec<u64>> {
        self.frames
            .last_mut()
            .map(|frame| &mut frame.locals)
            .ok_or_else(|| Trap::Host("no active frame".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{Engine, Imports, StoreLimits};
    use crate::test_harness::parse_wat;

    fn run(wat: &str, export: &str, args: &[Value]) -> std::result::Result<Vec<Value>, Trap> {
        let mut store = Store::new();
        let module = Arc::new(parse_wat(wat));
        let id = store
            .instantiate(&module, &Imports::new(), &Engine::Interpreted)
            .expect("instantiate");
        let func = module.exported_function(export).expect("export");
        store.call(id, func, args)
    }

    #[test]
    fn test_block_results_survive_branches() {
        let wat = r#"(module (func (export "f") (param i32) (result i32)
            (block (result i32)
                i32.const 7
                i32.const 100
                local.get 0
                br_if 0
                drop
                drop
                i32.const 1)))"#;
        assert_eq!(run(wat, "f", &[Value::I32(1)]), Ok(vec![Value::I32(100)]));
        assert_eq!(run(wat, "f", &[Value::I32(0)]), Ok(vec![Value::I32(1)]));
    }

    #[test]
    fn test_loop_params_are_kept_on_back_edges() {
        // sum 1..=n with the accumulator carried as a loop parameter
        let wat = r#"(module (func (export "sum") (param $n i32) (result i32)
            i32.const 0
            (loop $l (param i32) (result i32)
                local.get $n
                i32.add
                local.get $n
                i32.const 1
                i32.sub
                local.tee $n
                br_if $l)))"#;
        assert_eq!(run(wat, "sum", &[Value::I32(10)]), Ok(vec![Value::I32(55)]));
    }

    #[test]
    fn test_br_table_and_if_else() {
        let wat = r#"(module (func (export "pick") (param i32) (result i32)
            (block $b2 (block $b1 (block $b0
                local.get 0
                br_table $b0 $b1 $b2)
                i32.const 10
                return)
                i32.const 11
                return)
            local.get 0
            i32.const 5
            i32.gt_u
            (if (result i32) (then i32.const 99) (else i32.const 12))))"#;
        assert_eq!(run(wat, "pick", &[Value::I32(0)]), Ok(vec![Value::I32(10)]));
        assert_eq!(run(wat, "pick", &[Value::I32(1)]), Ok(vec![Value::I32(11)]));
        assert_eq!(run(wat, "pick", &[Value::I32(2)]), Ok(vec![Value::I32(12)]));
        assert_eq!(run(wat, "pick", &[Value::I32(9)]), Ok(vec![Value::I32(99)]));
    }

    #[test]
    fn test_tail_calls_return_callee_results() {
        let wat = r#"(module
            (func $id (param i64) (result i64) local.get 0)
            (func (export "f") (param i64) (result i64)
                (block (result i64)
                    local.get 0
                    return_call $id)))"#;
        assert_eq!(run(wat, "f", &[Value::I64(-4)]), Ok(vec![Value::I64(-4)]));
    }

    #[test]
    fn test_runaway_recursion_is_bounded() {
        let wat = r#"(module (func $f (export "f") call $f))"#;
        let mut store = Store::with_limits(StoreLimits {
            max_call_depth: 500,
            max_native_reentry: 8,
        });
        let module = Arc::new(parse_wat(wat));
        let id = store
            .instantiate(&module, &Imports::new(), &Engine::Interpreted)
            .expect("instantiate");
        assert_eq!(store.call(id, 0, &[]), Err(Trap::CallStackExhausted));
        assert_eq!(store.depth, 0);
    }
}
