// Code-unit executor.
//
// Same-instance calls between code units run on an explicit frame stack, so
// WASM recursion never grows the native stack. A call to an interpreted
// function of the same instance suspends the executor and hands the call to
// the machine driver. Imports and cross-instance callees re-enter the store.

#![allow(clippy::cast_sign_loss, clippy::too_many_lines)]

use std::sync::Arc;

use super::{Convention, Instruction, LoadedUnit, TrapCode};
use crate::Trap;
use crate::machine::Exit;
use crate::numeric;
use crate::runtime::{Instance, NULL_REF, Store};
use crate::wasm::{FuncRef, FunctionType, InstanceId, NumOp, Value, ValueKind};

type Result<T> = std::result::Result<T, Trap>;

struct Frame {
    func: u32,
    /// Resume point while a callee runs.
    pc: usize,
    /// Operand stack height below the arguments.
    base: usize,
    /// First local slot of this frame.
    locals: usize,
}

enum Transfer {
    Call(u32),
    Return(usize),
    /// Run an interpreted function of this instance with these arguments.
    Interpret(u32, Vec<Value>),
}

/// One call started by the driver, on top of whatever frames were already
/// suspended below it.
#[derive(Debug, Clone, Copy)]
struct Segment {
    entry: u32,
    frames: usize,
    /// Operand stack height below the entry's arguments.
    base: usize,
}

/// Slab of boxed slot vectors, addressed by 32-bit handles.
#[derive(Default)]
struct Boxes {
    slots: Vec<Option<Vec<u32>>>,
    free: Vec<u32>,
}

impl Boxes {
    fn put(&mut self, slots: Vec<u32>) -> u32 {
        if let Some(handle) = self.free.pop() {
            self.slots[handle as usize] = Some(slots);
            return handle;
        }
        self.slots.push(Some(slots));
        (self.slots.len() - 1) as u32
    }

    fn take(&mut self, handle: u32) -> Result<Vec<u32>> {
        let slots = self
            .slots
            .get_mut(handle as usize)
            .and_then(Option::take)
            .ok_or_else(|| Trap::Host(format!("invalid box handle {handle}")))?;
        self.free.push(handle);
        Ok(slots)
    }
}

/// Flatten values into slots, low half first.
fn encode(values: &[Value]) -> Vec<u32> {
    let mut slots = Vec::with_capacity(values.len());
    for value in values {
        let bits = value.to_bits();
        slots.push(bits as u32);
        if value.kind().slots() == 2 {
            slots.push((bits >> 32) as u32);
        }
    }
    slots
}

fn decode(kinds: &[ValueKind], slots: &[u32]) -> Vec<Value> {
    let mut values = Vec::with_capacity(kinds.len());
    let mut at = 0;
    for kind in kinds {
        let mut bits = u64::from(slots.get(at).copied().unwrap_or_default());
        if kind.slots() == 2 {
            bits |= u64::from(slots.get(at + 1).copied().unwrap_or_default()) << 32;
        }
        at += kind.slots();
        values.push(Value::from_bits(*kind, bits));
    }
    values
}

fn signature(unit: &LoadedUnit, sig: u16) -> Result<&FunctionType> {
    unit.signature_at(sig).map_err(|e| Trap::Host(e.to_string()))
}

/// Jump operands of loaded units are instruction indices.
fn target(index: i32) -> usize {
    index as usize
}

/// Executor stacks kept while the other engine runs.
#[derive(Default)]
pub(crate) struct ExecState {
    stack: Vec<u32>,
    locals: Vec<u32>,
    frames: Vec<Frame>,
    boxes: Boxes,
    segments: Vec<Segment>,
}

pub(crate) struct Executor<'a> {
    store: &'a mut Store,
    instance: InstanceId,
    /// Loaded unit of every function index.
    units: &'a [Arc<LoadedUnit>],
    /// Per type index, the sorted function indices with a structurally equal
    /// type.
    dispatch: &'a [Vec<u32>],
    stack: Vec<u32>,
    locals: Vec<u32>,
    frames: Vec<Frame>,
    boxes: Boxes,
    segments: Vec<Segment>,
}

impl<'a> Executor<'a> {
    pub(crate) fn attach(
        store: &'a mut Store,
        instance: InstanceId,
        units: &'a [Arc<LoadedUnit>],
        dispatch: &'a [Vec<u32>],
        state: ExecState,
    ) -> Self {
        Self {
            store,
            instance,
            units,
            dispatch,
            stack: state.stack,
            locals: state.locals,
            frames: state.frames,
            boxes: state.boxes,
            segments: state.segments,
        }
    }

    pub(crate) fn detach(self) -> ExecState {
        ExecState {
            stack: self.stack,
            locals: self.locals,
            frames: self.frames,
            boxes: self.boxes,
            segments: self.segments,
        }
    }

    /// Call `entry` above the suspended frames. Frames pushed here count
    /// against the store's depth; the driver restores it.
    pub(crate) fn start(&mut self, entry: u32, args: &[Value]) -> Result<Exit> {
        let boxed = Convention::of(&self.unit(entry)?.signature) == Convention::Boxed;
        let base = self.stack.len();
        let slots = encode(args);
        if boxed {
            let handle = self.boxes.put(slots);
            self.stack.push(handle);
        } else {
            self.stack.extend(slots);
        }
        self.segments.push(Segment {
            entry,
            frames: self.frames.len(),
            base,
        });
        self.enter(entry)?;
        self.step()
    }

    /// Continue the frame suspended at `CallInterpreter` with the results of
    /// its interpreted callee.
    pub(crate) fn resume_with(&mut self, results: &[Value]) -> Result<Exit> {
        let frame = self
            .frames
            .last()
            .ok_or_else(|| Trap::Host("no suspended frame".to_string()))?;
        let unit = Arc::clone(self.unit(frame.func)?);
        let Some(Instruction::CallInterpreter { sig, .. }) =
            frame.pc.checked_sub(1).and_then(|at| unit.code.get(at))
        else {
            return Err(Trap::Host(format!(
                "function {} is not waiting on the interpreter",
                frame.func
            )));
        };
        let ty = signature(&unit, *sig)?;
        self.push_results(ty, results);
        self.step()
    }

    /// Run until the current segment's entry returns or control passes to
    /// the interpreter.
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
            let unit = Arc::clone(self.unit(frame.func)?);
            let pc = frame.pc;
            match self.execute(&unit, pc)? {
                Transfer::Call(func) => self.enter(func)?,
                Transfer::Return(slots) => self.leave(slots),
                Transfer::Interpret(func, args) => return Ok(Exit::Call(func, args)),
            }
        }
    }

    fn segment_results(&mut self, segment: Segment) -> Result<Vec<Value>> {
        let ty = self.unit(segment.entry)?.signature.clone();
        let slots = if ty.results.len() > 1 {
            let handle = self.pop();
            self.boxes.take(handle)?
        } else {
            self.stack.split_off(segment.base.min(self.stack.len()))
        };
        Ok(decode(&ty.results, &slots))
    }

    fn unit(&self, func: u32) -> Result<&Arc<LoadedUnit>> {
        self.units
            .get(func as usize)
            .ok_or(Trap::UnknownFunction(func))
    }

    fn instance(&mut self) -> Result<&mut Instance> {
        self.store.live(self.instance)
    }

    /// Push a frame for `func`, moving its arguments into locals.
    fn enter(&mut self, func: u32) -> Result<()> {
        if self.store.depth >= self.store.limits().max_call_depth {
            return Err(Trap::CallStackExhausted);
        }
        let unit = self.unit(func)?;
        let args = super::arg_slots(&unit.signature);
        let local_slots = unit.local_slots.max(args);

        let base = self.stack.len().saturating_sub(args);
        let locals = self.locals.len();
        self.locals.extend_from_slice(&self.stack[base..]);
        self.locals.resize(locals + local_slots, 0);
        self.stack.truncate(base);

        self.frames.push(Frame {
            func,
            pc: 0,
            base,
            locals,
        });
        self.store.depth += 1;
        Ok(())
    }

    /// Pop the current frame, leaving its top `slots` on the caller's stack.
    fn leave(&mut self, slots: usize) {
        let Some(frame) = self.frames.pop() else {
            return;
        };
        let results = self.stack.split_off(self.stack.len().saturating_sub(slots));
        self.stack.truncate(frame.base);
        self.stack.extend(results);
        self.locals.truncate(frame.locals);
        self.store.depth -= 1;
    }

    fn save_pc(&mut self, pc: usize) {
        if let Some(frame) = self.frames.last_mut() {
            frame.pc = pc;
        }
    }

    // Verified units never underflow the operand stack.
    fn pop(&mut self) -> u32 {
        self.stack.pop().unwrap_or_default()
    }

    fn pop64(&mut self) -> u64 {
        let hi = self.pop();
        let lo = self.pop();
        (u64::from(hi) << 32) | u64::from(lo)
    }

    fn push64(&mut self, bits: u64) {
        self.stack.push(bits as u32);
        self.stack.push((bits >> 32) as u32);
    }

    fn pop_kind(&mut self, kind: ValueKind) -> u64 {
        if kind.slots() == 1 {
            u64::from(self.pop())
        } else {
            self.pop64()
        }
    }

    fn push_kind(&mut self, kind: ValueKind, bits: u64) {
        if kind.slots() == 1 {
            self.stack.push(bits as u32);
        } else {
            self.push64(bits);
        }
    }

    fn pop_args(&mut self, ty: &FunctionType) -> Result<Vec<Value>> {
        let slots = if Convention::of(ty) == Convention::Boxed {
            let handle = self.pop();
            self.boxes.take(handle)?
        } else {
            let at = self.stack.len().saturating_sub(ty.param_slots());
            self.stack.split_off(at)
        };
        Ok(decode(&ty.params, &slots))
    }

    fn push_results(&mut self, ty: &FunctionType, values: &[Value]) {
        let slots = encode(values);
        if ty.results.len() > 1 {
            let handle = self.boxes.put(slots);
            self.stack.push(handle);
        } else {
            self.stack.extend(slots);
        }
    }

    fn box_top(&mut self, slots: usize) {
        let at = self.stack.len().saturating_sub(slots);
        let boxed = self.stack.split_off(at);
        let handle = self.boxes.put(boxed);
        self.stack.push(handle);
    }

    fn unbox_top(&mut self) -> Result<()> {
        let handle = self.pop();
        let slots = self.boxes.take(handle)?;
        self.stack.extend(slots);
        Ok(())
    }

    fn num(&mut self, op: NumOp) -> Result<()> {
        let params = op.params();
        let mut args = [0u64; 2];
        for i in (0..params.len()).rev() {
            args[i] = self.pop_kind(params[i]);
        }
        let result = numeric::eval(op, &args[..params.len()])?;
        self.push_kind(op.result(), result);
        Ok(())
    }

    /// Resolve a table entry for `call_indirect`, checking the callee's type.
    fn indirect_target(
        &mut self,
        type_index: u32,
        table: u32,
        ty: &FunctionType,
    ) -> Result<FuncRef> {
        let element = self.pop();
        let table = self.instance()?.tab(table)?;
        if element >= table.size() {
            return Err(Trap::UndefinedElement);
        }
        let bits = table.get(element)?;
        if bits == NULL_REF {
            return Err(Trap::UninitializedElement);
        }
        let Value::FuncRef(Some(callee)) = Value::from_bits(ValueKind::FuncRef, bits) else {
            return Err(Trap::UninitializedElement);
        };

        let matches = if callee.instance == self.instance {
            self.dispatch
                .get(type_index as usize)
                .is_some_and(|funcs| funcs.binary_search(&callee.index).is_ok())
        } else {
            self.store.function_type(callee)? == ty
        };
        if matches {
            Ok(callee)
        } else {
            Err(Trap::IndirectCallTypeMismatch)
        }
    }

    /// Run the top frame from `pc` until it calls a code unit or returns.
    fn execute(&mut self, unit: &LoadedUnit, mut pc: usize) -> Result<Transfer> {
        use Instruction as I;

        let locals = self.frames.last().map_or(0, |f| f.locals);
        loop {
            let Some(ins) = unit.code.get(pc) else {
                return Err(Trap::Host(format!(
                    "function {} ran past the end of its code",
                    unit.function
                )));
            };
            pc += 1;

            match ins {
                I::Trap(TrapCode::Unreachable) => return Err(Trap::Unreachable),
                I::Trap(TrapCode::MemoryOutOfBounds) => return Err(Trap::MemoryOutOfBounds),
                I::CheckInterrupt => {
                    if self.store.take_interrupt() {
                        return Err(Trap::Interrupted);
                    }
                }

                I::Const32(v) => self.stack.push(*v),
                I::Const64(v) => self.push64(*v),
                I::Load(slot) => self.stack.push(self.locals[locals + usize::from(*slot)]),
                I::Load2(slot) => {
                    let at = locals + usize::from(*slot);
                    self.stack.push(self.locals[at]);
                    self.stack.push(self.locals[at + 1]);
                }
                I::Store(slot) => {
                    let v = self.pop();
                    self.locals[locals + usize::from(*slot)] = v;
                }
                I::Store2(slot) => {
                    let hi = self.pop();
                    let lo = self.pop();
                    let at = locals + usize::from(*slot);
                    self.locals[at] = lo;
                    self.locals[at + 1] = hi;
                }
                I::Pop => {
                    self.pop();
                }
                I::Pop2 => {
                    self.pop64();
                }
                I::Dup => {
                    let v = self.stack[self.stack.len() - 1];
                    self.stack.push(v);
                }
                I::Dup2 => {
                    let len = self.stack.len();
                    self.stack.extend_from_within(len - 2..);
                }
                I::DropKeep { drop, keep } => {
                    let end = self.stack.len() - usize::from(*keep);
                    self.stack.drain(end - usize::from(*drop)..end);
                }
                I::Select => {
                    let cond = self.pop();
                    let b = self.pop();
                    let a = self.pop();
                    self.stack.push(if cond != 0 { a } else { b });
                }
                I::Select2 => {
                    let cond = self.pop();
                    let b = self.pop64();
                    let a = self.pop64();
                    self.push64(if cond != 0 { a } else { b });
                }

                I::Goto(t) => pc = target(*t),
                I::IfEq(t) => {
                    if self.pop() == 0 {
                        pc = target(*t);
                    }
                }
                I::IfNe(t) => {
                    if self.pop() != 0 {
                        pc = target(*t);
                    }
                }
                I::Switch(targets) => {
                    let index = self.pop() as usize;
                    let chosen = targets.get(index).or(targets.last()).copied();
                    pc = target(chosen.unwrap_or_default());
                }
                I::Return(slots) => return Ok(Transfer::Return(usize::from(*slots))),

                I::Num(op) => self.num(*op)?,

                I::MemLoad { kind, offset } => {
                    let addr = u64::from(self.pop()) + u64::from(*offset);
                    let bits = self.instance()?.mem()?.load(*kind, addr)?;
                    self.push_kind(kind.result(), bits);
                }
                I::MemStore { kind, offset } => {
                    let bits = self.pop_kind(kind.operand());
                    let addr = u64::from(self.pop()) + u64::from(*offset);
                    self.instance()?.mem()?.store(*kind, addr, bits)?;
                }
                I::MemorySize => {
                    let pages = self.instance()?.mem()?.pages();
                    self.stack.push(pages);
                }
                I::MemoryGrow => {
                    let delta = self.pop();
                    let old = self.instance()?.mem()?.grow(delta).unwrap_or(u32::MAX);
                    self.stack.push(old);
                }
                I::MemoryFill => {
                    let len = self.pop();
                    let value = self.pop();
                    let dst = self.pop();
                    self.instance()?.mem()?.fill(dst, value as u8, len)?;
                }
                I::MemoryCopy => {
                    let len = self.pop();
                    let src = self.pop();
                    let dst = self.pop();
                    self.instance()?.mem()?.copy(dst, src, len)?;
                }
                I::MemoryInit(segment) => {
                    let len = self.pop();
                    let src = self.pop();
                    let dst = self.pop();
                    self.instance()?.memory_init(*segment, dst, src, len)?;
                }
                I::DataDrop(segment) => self.instance()?.data_drop(*segment),

                I::GlobalGet(index) => {
                    let bits = self.instance()?.globals[*index as usize];
                    self.stack.push(bits as u32);
                }
                I::GlobalGet2(index) => {
                    let bits = self.instance()?.globals[*index as usize];
                    self.push64(bits);
                }
                I::GlobalSet(index) => {
                    let v = self.pop();
                    self.instance()?.globals[*index as usize] = u64::from(v);
                }
                I::GlobalSet2(index) => {
                    let bits = self.pop64();
                    self.instance()?.globals[*index as usize] = bits;
                }

                I::TableGet(table) => {
                    let index = self.pop();
                    let bits = self.instance()?.tab(*table)?.get(index)?;
                    self.push64(bits);
                }
                I::TableSet(table) => {
                    let bits = self.pop64();
                    let index = self.pop();
                    self.instance()?.tab(*table)?.set(index, bits)?;
                }
                I::TableSize(table) => {
                    let size = self.instance()?.tab(*table)?.size();
                    self.stack.push(size);
                }
                I::TableGrow(table) => {
                    let delta = self.pop();
                    let init = self.pop64();
                    let old = self
                        .instance()?
                        .tab(*table)?
                        .grow(delta, init)
                        .unwrap_or(u32::MAX);
                    self.stack.push(old);
                }
                I::TableFill(table) => {
                    let len = self.pop();
                    let bits = self.pop64();
                    let start = self.pop();
                    self.instance()?.tab(*table)?.fill(start, bits, len)?;
                }
                I::TableCopy { dst, src } => {
                    let len = self.pop();
                    let s = self.pop();
                    let d = self.pop();
                    self.instance()?.table_copy(*dst, *src, d, s, len)?;
                }
                I::TableInit { elem, table } => {
                    let len = self.pop();
                    let s = self.pop();
                    let d = self.pop();
                    self.instance()?.table_init(*elem, *table, d, s, len)?;
                }
                I::ElemDrop(segment) => self.instance()?.elem_drop(*segment),
                I::RefFunc(index) => {
                    let func = FuncRef {
                        instance: self.instance,
                        index: *index,
                    };
                    self.push64(Value::FuncRef(Some(func)).to_bits());
                }
                I::RefIsNull => {
                    let bits = self.pop64();
                    self.stack.push(u32::from(bits == NULL_REF));
                }

                I::Call { func, .. } => {
                    self.save_pc(pc);
                    return Ok(Transfer::Call(*func));
                }
                I::CallIndirect {
                    type_index,
                    table,
                    sig,
                } => {
                    let ty = signature(unit, *sig)?;
                    let callee = self.indirect_target(*type_index, *table, ty)?;
                    if callee.instance == self.instance {
                        self.save_pc(pc);
                        return Ok(Transfer::Call(callee.index));
                    }
                    let args = self.pop_args(ty)?;
                    let results = self.store.call(callee.instance, callee.index, &args)?;
                    self.push_results(ty, &results);
                }
                I::CallImport { func, sig } => {
                    let ty = signature(unit, *sig)?;
                    let args = self.pop_args(ty)?;
                    let results = self.store.call_import(self.instance, *func, &args)?;
                    self.push_results(ty, &results);
                }
                I::CallInterpreter { func, sig } => {
                    let ty = signature(unit, *sig)?;
                    let args = self.pop_args(ty)?;
                    self.save_pc(pc);
                    return Ok(Transfer::Interpret(*func, args));
                }

                I::BoxParams(sig) => {
                    let slots = signature(unit, *sig)?.param_slots();
                    self.box_top(slots);
                }
                I::BoxResults(sig) => {
                    let slots = signature(unit, *sig)?.result_slots();
                    self.box_top(slots);
                }
                I::UnboxParams(_) | I::UnboxResults(_) => self.unbox_top()?,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::drive;
    use crate::runtime::StoreLimits;

    fn unit(
        function: u32,
        signature: FunctionType,
        code: Vec<Instruction>,
        locals: usize,
    ) -> Arc<LoadedUnit> {
        Arc::new(LoadedUnit {
            function,
            code,
            convention: Convention::of(&signature),
            signature,
            local_slots: locals,
            max_stack: 0,
            signatures: vec![FunctionType::new(vec![ValueKind::I32], vec![ValueKind::I32])],
        })
    }

    #[test]
    fn test_switch_clamps_to_default() {
        // 0: load 0; 1: switch [3, 5]; 2: -; 3: const 10; 4: return; 5: const 20; 6: return
        let ty = FunctionType::new(vec![ValueKind::I32], vec![ValueKind::I32]);
        let units = vec![unit(
            0,
            ty,
            vec![
                Instruction::Load(0),
                Instruction::Switch(vec![3, 5]),
                Instruction::Trap(TrapCode::Unreachable),
                Instruction::Const32(10),
                Instruction::Return(1),
                Instruction::Const32(20),
                Instruction::Return(1),
            ],
            1,
        )];
        let mut store = Store::new();
        for (arg, expected) in [(0, 10), (1, 20), (7, 20), (-1, 20)] {
            let results = drive(&mut store, InstanceId(0), &units, &[], 0, &[Value::I32(arg)])
                .expect("run");
            assert_eq!(results, vec![Value::I32(expected)]);
        }
    }

    #[test]
    fn test_deep_recursion_stays_off_the_native_stack() {
        // countdown(n) = n == 0 ? 0 : countdown(n - 1)
        let ty = FunctionType::new(vec![ValueKind::I32], vec![ValueKind::I32]);
        let units = vec![unit(
            0,
            ty,
            vec![
                Instruction::Load(0),
                Instruction::IfNe(4),
                Instruction::Const32(0),
                Instruction::Return(1),
                Instruction::Load(0),
                Instruction::Const32(1),
                Instruction::Num(NumOp::I32Sub),
                Instruction::Call { func: 0, sig: 0 },
                Instruction::Return(1),
            ],
            1,
        )];

        let mut store = Store::with_limits(StoreLimits {
            max_call_depth: 100_000,
            max_native_reentry: 4,
        });
        let results = drive(&mut store, InstanceId(0), &units, &[], 0, &[Value::I32(50_000)])
            .expect("deep but bounded");
        assert_eq!(results, vec![Value::I32(0)]);
        assert_eq!(store.depth, 0);

        let mut store = Store::with_limits(StoreLimits {
            max_call_depth: 1_000,
            max_native_reentry: 4,
        });
        let err = drive(&mut store, InstanceId(0), &units, &[], 0, &[Value::I32(5_000)])
            .expect_err("too deep");
        assert_eq!(err, Trap::CallStackExhausted);
        assert_eq!(store.depth, 0);
    }

    #[test]
    fn test_box_handles_are_recycled() {
        let mut boxes = Boxes::default();
        let a = boxes.put(vec![1, 2]);
        assert_eq!(boxes.take(a).expect("boxed"), vec![1, 2]);
        assert!(boxes.take(a).is_err());
        let b = boxes.put(vec![3]);
        assert_eq!(a, b);
    }

    #[test]
    fn test_slot_encoding_is_low_half_first() {
        let values = [Value::I64(0x1_0000_0002), Value::I32(-1)];
        let slots = encode(&values);
        assert_eq!(slots, vec![2, 1, u32::MAX]);
        assert_eq!(decode(&[ValueKind::I64, ValueKind::I32], &slots), values);
    }
}
