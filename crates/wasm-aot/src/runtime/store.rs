// Store, instances, imports and instantiation.
//
// A store owns every instance it creates. Calls enter through `Store::call`,
// which dispatches to the instance's machine; engines re-enter the store for
// host imports and cross-instance calls.

#![allow(clippy::cast_possible_truncation)] // segment and function counts fit in u32

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use super::memory::Memory;
use super::table::{NULL_REF, Table};
use crate::compiler::{CompileOptions, CompiledModule, compile};
use crate::machine::{AotMachine, InterpreterMachine, Machine};
use crate::wasm::{
    ConstExpr, DataMode, ElementMode, FuncRef, FunctionType, InstanceId, Module, Value, ValueKind,
};
use crate::{Error, Result, Trap};

type HostCallback = dyn Fn(&mut Store, &[Value]) -> std::result::Result<Vec<Value>, Trap>
    + Send
    + Sync;

/// A function implemented by the embedder.
#[derive(Clone)]
pub struct HostFunc {
    ty: FunctionType,
    callback: Arc<HostCallback>,
}

impl HostFunc {
    pub fn new<F>(ty: FunctionType, callback: F) -> Self
    where
        F: Fn(&mut Store, &[Value]) -> std::result::Result<Vec<Value>, Trap>
            + Send
            + Sync
            + 'static,
    {
        Self {
            ty,
            callback: Arc::new(callback),
        }
    }

    #[must_use]
    pub fn ty(&self) -> &FunctionType {
        &self.ty
    }

    fn call(&self, store: &mut Store, args: &[Value]) -> std::result::Result<Vec<Value>, Trap> {
        let results = (self.callback)(store, args)?;
        if !kinds_match(&self.ty.results, &results) {
            return Err(Trap::Host(format!(
                "host function declared {} but returned {}",
                self.ty,
                describe(&results)
            )));
        }
        Ok(results)
    }
}

impl fmt::Debug for HostFunc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostFunc").field("ty", &self.ty).finish_non_exhaustive()
    }
}

/// Where an imported function resolves to.
#[derive(Debug, Clone)]
pub enum ImportTarget {
    Host(HostFunc),
    /// A function of another instance in the same store.
    Instance(FuncRef),
}

/// Import definitions used to link a module at instantiation.
#[derive(Debug, Clone, Default)]
pub struct Imports {
    funcs: HashMap<(String, String), HostFunc>,
    instances: HashMap<String, InstanceId>,
}

impl Imports {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn define(&mut self, module: &str, name: &str, func: HostFunc) -> &mut Self {
        self.funcs.insert((module.to_string(), name.to_string()), func);
        self
    }

    /// Resolve every import from `module` against the exports of `instance`.
    pub fn define_instance(&mut self, module: &str, instance: InstanceId) -> &mut Self {
        self.instances.insert(module.to_string(), instance);
        self
    }
}

/// How an instance executes its functions.
#[derive(Debug, Clone)]
pub enum Engine {
    Compiled(CompileOptions),
    Interpreted,
}

impl Default for Engine {
    fn default() -> Self {
        Self::Compiled(CompileOptions::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreLimits {
    /// Frames live at once, across all engines.
    pub max_call_depth: usize,
    /// Nested entries into the store from running code (host imports and
    /// cross-instance calls).
    pub max_native_reentry: usize,
}

impl Default for StoreLimits {
    fn default() -> Self {
        Self {
            max_call_depth: 20_000,
            max_native_reentry: 200,
        }
    }
}

/// Requests cancellation of whatever the store is running. Checked at calls
/// and backward branches.
#[derive(Debug, Clone)]
pub struct InterruptHandle {
    flag: Arc<AtomicBool>,
}

impl InterruptHandle {
    pub fn interrupt(&self) {
        self.flag.store(true, Ordering::Release);
    }
}

pub struct Instance {
    pub(crate) module: Arc<Module>,
    pub(crate) machine: Arc<dyn Machine>,
    pub(crate) imports: Vec<ImportTarget>,
    pub(crate) memory: Option<Memory>,
    pub(crate) tables: Vec<Table>,
    pub(crate) globals: Vec<u64>,
    pub(crate) data: Vec<Vec<u8>>,
    pub(crate) elements: Vec<Vec<u64>>,
}

impl Instance {
    #[must_use]
    pub fn module(&self) -> &Arc<Module> {
        &self.module
    }

    #[must_use]
    pub fn memory(&self) -> Option<&Memory> {
        self.memory.as_ref()
    }

    pub fn memory_mut(&mut self) -> Option<&mut Memory> {
        self.memory.as_mut()
    }

    #[must_use]
    pub fn table(&self, index: u32) -> Option<&Table> {
        self.tables.get(index as usize)
    }

    #[must_use]
    pub fn global(&self, index: u32) -> Option<Value> {
        let kind = self.module.globals.get(index as usize)?.kind;
        let bits = *self.globals.get(index as usize)?;
        Some(Value::from_bits(kind, bits))
    }

    pub(crate) fn mem(&mut self) -> std::result::Result<&mut Memory, Trap> {
        self.memory.as_mut().ok_or(Trap::MemoryOutOfBounds)
    }

    pub(crate) fn tab(&mut self, index: u32) -> std::result::Result<&mut Table, Trap> {
        self.tables
            .get_mut(index as usize)
            .ok_or(Trap::TableOutOfBounds)
    }

    pub(crate) fn memory_init(
        &mut self,
        segment: u32,
        dst: u32,
        src: u32,
        len: u32,
    ) -> std::result::Result<(), Trap> {
        let memory = self.memory.as_mut().ok_or(Trap::MemoryOutOfBounds)?;
        let data = self
            .data
            .get(segment as usize)
            .ok_or(Trap::MemoryOutOfBounds)?;
        memory.init(dst, data, src, len)
    }

    pub(crate) fn data_drop(&mut self, segment: u32) {
        if let Some(data) = self.data.get_mut(segment as usize) {
            *data = Vec::new();
        }
    }

    pub(crate) fn table_init(
        &mut self,
        segment: u32,
        table: u32,
        dst: u32,
        src: u32,
        len: u32,
    ) -> std::result::Result<(), Trap> {
        let items = self
            .elements
            .get(segment as usize)
            .ok_or(Trap::TableOutOfBounds)?;
        let table = self
            .tables
            .get_mut(table as usize)
            .ok_or(Trap::TableOutOfBounds)?;
        table.copy_from(dst, items, src, len)
    }

    pub(crate) fn elem_drop(&mut self, segment: u32) {
        if let Some(items) = self.elements.get_mut(segment as usize) {
            *items = Vec::new();
        }
    }

    pub(crate) fn table_copy(
        &mut self,
        dst_table: u32,
        src_table: u32,
        dst: u32,
        src: u32,
        len: u32,
    ) -> std::result::Result<(), Trap> {
        if dst_table == src_table {
            return self.tab(dst_table)?.copy_within(dst, src, len);
        }
        let source = self
            .tables
            .get(src_table as usize)
            .ok_or(Trap::TableOutOfBounds)?;
        let end = u64::from(src) + u64::from(len);
        if end > u64::from(source.size()) {
            return Err(Trap::TableOutOfBounds);
        }
        let items = source.entries()[src as usize..end as usize].to_vec();
        self.tab(dst_table)?.copy_from(dst, &items, 0, len)
    }
}

pub struct Store {
    instances: Vec<Instance>,
    interrupt: Arc<AtomicBool>,
    limits: StoreLimits,
    /// Frames currently live across all engines.
    pub(crate) depth: usize,
    native_depth: usize,
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl Store {
    #[must_use]
    pub fn new() -> Self {
        Self::with_limits(StoreLimits::default())
    }

    #[must_use]
    pub fn with_limits(limits: StoreLimits) -> Self {
        Self {
            instances: Vec::new(),
            interrupt: Arc::new(AtomicBool::new(false)),
            limits,
            depth: 0,
            native_depth: 0,
        }
    }

    #[must_use]
    pub fn limits(&self) -> StoreLimits {
        self.limits
    }

    #[must_use]
    pub fn interrupt_handle(&self) -> InterruptHandle {
        InterruptHandle {
            flag: Arc::clone(&self.interrupt),
        }
    }

    /// Consume a pending interrupt request.
    pub(crate) fn take_interrupt(&self) -> bool {
        self.interrupt.swap(false, Ordering::AcqRel)
    }

    #[must_use]
    pub fn instance(&self, id: InstanceId) -> Option<&Instance> {
        self.instances.get(id.0 as usize)
    }

    pub fn instance_mut(&mut self, id: InstanceId) -> Option<&mut Instance> {
        self.instances.get_mut(id.0 as usize)
    }

    pub(crate) fn live(&mut self, id: InstanceId) -> std::result::Result<&mut Instance, Trap> {
        self.instances
            .get_mut(id.0 as usize)
            .ok_or_else(|| Trap::Host(format!("unknown instance {}", id.0)))
    }

    /// Parse-free instantiation of a decoded module with the given engine.
    pub fn instantiate(
        &mut self,
        module: &Arc<Module>,
        imports: &Imports,
        engine: &Engine,
    ) -> Result<InstanceId> {
        let machine: Arc<dyn Machine> = match engine {
            Engine::Compiled(options) => {
                let compiled = compile(module, options)?;
                Arc::new(AotMachine::new(Arc::new(compiled))?)
            }
            Engine::Interpreted => Arc::new(InterpreterMachine),
        };
        self.instantiate_with(module, imports, machine)
    }

    /// Instantiate an already compiled module. Code units are shared between
    /// every instance created from the same `CompiledModule`.
    pub fn instantiate_compiled(
        &mut self,
        compiled: &Arc<CompiledModule>,
        imports: &Imports,
    ) -> Result<InstanceId> {
        let machine = Arc::new(AotMachine::new(Arc::clone(compiled))?);
        let module = Arc::clone(compiled.module());
        self.instantiate_with(&module, imports, machine)
    }

    fn instantiate_with(
        &mut self,
        module: &Arc<Module>,
        imports: &Imports,
        machine: Arc<dyn Machine>,
    ) -> Result<InstanceId> {
        let id = InstanceId(
            u32::try_from(self.instances.len())
                .map_err(|_| Error::Link("too many instances".to_string()))?,
        );
        let resolved = self.resolve_imports(module, imports)?;

        let mut globals = Vec::with_capacity(module.globals.len());
        for global in &module.globals {
            let bits = eval_const(global.init, &globals, id)?;
            globals.push(bits);
        }

        let memory = match module.memory {
            Some(ty) => Some(Memory::new(ty).ok_or_else(|| {
                Error::Unsupported(format!("memory of {} pages", ty.initial))
            })?),
            None => None,
        };

        let mut tables = Vec::with_capacity(module.tables.len());
        for table in &module.tables {
            let init = match table.init {
                Some(expr) => eval_const(expr, &globals, id)?,
                None => NULL_REF,
            };
            tables.push(Table::new(table.element, table.initial, table.maximum, init));
        }

        let mut elements = Vec::with_capacity(module.elements.len());
        for segment in &module.elements {
            let items = segment
                .items
                .iter()
                .map(|item| eval_const(*item, &globals, id))
                .collect::<Result<Vec<_>>>()?;
            elements.push(items);
        }

        self.instances.push(Instance {
            module: Arc::clone(module),
            machine,
            imports: resolved,
            memory,
            tables,
            globals,
            data: module.data.iter().map(|d| d.bytes.clone()).collect(),
            elements,
        });

        let started = self.initialize(id, module).and_then(|()| match module.start {
            Some(start) => self.call(id, start, &[]).map(drop).map_err(Error::from),
            None => Ok(()),
        });
        if let Err(e) = started {
            // drop the failed instance and anything created while starting it
            self.instances.truncate(id.0 as usize);
            return Err(e);
        }
        tracing::debug!(instance = id.0, functions = module.function_count(), "instantiated");
        Ok(id)
    }

    /// Apply active segments, then drop active and declared ones.
    fn initialize(&mut self, id: InstanceId, module: &Module) -> Result<()> {
        let instance = self.live(id)?;
        for (idx, segment) in module.elements.iter().enumerate() {
            let idx = idx as u32;
            match &segment.mode {
                ElementMode::Active { table, offset } => {
                    let offset = const_offset(*offset, &instance.globals, id)?;
                    let len = segment.items.len() as u32;
                    instance.table_init(idx, *table, offset, 0, len)?;
                    instance.elem_drop(idx);
                }
                ElementMode::Declared => instance.elem_drop(idx),
                ElementMode::Passive => {}
            }
        }
        for (idx, segment) in module.data.iter().enumerate() {
            if let DataMode::Active { offset } = segment.mode {
                let idx = idx as u32;
                let offset = const_offset(offset, &instance.globals, id)?;
                let len = segment.bytes.len() as u32;
                instance.memory_init(idx, offset, 0, len)?;
                instance.data_drop(idx);
            }
        }
        Ok(())
    }

    fn resolve_imports(&self, module: &Module, imports: &Imports) -> Result<Vec<ImportTarget>> {
        let mut resolved = Vec::with_capacity(module.imports.len());
        for import in &module.imports {
            let expected = module
                .types
                .get(import.type_index as usize)
                .ok_or_else(|| Error::Internal(format!("import type {}", import.type_index)))?;
            let key = (import.module.clone(), import.name.clone());

            let (target, actual) = if let Some(func) = imports.funcs.get(&key) {
                (ImportTarget::Host(func.clone()), func.ty().clone())
            } else if let Some(&instance) = imports.instances.get(&import.module) {
                let other = self.instance(instance).ok_or_else(|| {
                    Error::Link(format!("unknown instance {} for {}", instance.0, import.module))
                })?;
                let index = other.module.exported_function(&import.name).ok_or_else(|| {
                    Error::Link(format!(
                        "instance {} does not export function {}",
                        instance.0, import.name
                    ))
                })?;
                let ty = other
                    .module
                    .function_type(index)
                    .cloned()
                    .ok_or_else(|| Error::Internal(format!("export {} has no type", import.name)))?;
                (ImportTarget::Instance(FuncRef { instance, index }), ty)
            } else {
                return Err(Error::Link(format!(
                    "unknown import {}.{}",
                    import.module, import.name
                )));
            };

            if actual != *expected {
                return Err(Error::Link(format!(
                    "import {}.{} has type {actual}, module expects {expected}",
                    import.module, import.name
                )));
            }
            resolved.push(target);
        }
        Ok(resolved)
    }

    /// Call an exported function by name.
    pub fn invoke(&mut self, id: InstanceId, export: &str, args: &[Value]) -> Result<Vec<Value>> {
        let func = self
            .instance(id)
            .ok_or_else(|| Error::Link(format!("unknown instance {}", id.0)))?
            .module
            .exported_function(export)
            .ok_or_else(|| Error::Link(format!("no exported function named {export}")))?;
        Ok(self.call(id, func, args)?)
    }

    /// The machine façade: run function `func` of instance `id`, whichever
    /// engine executes it.
    pub fn call(
        &mut self,
        id: InstanceId,
        func: u32,
        args: &[Value],
    ) -> std::result::Result<Vec<Value>, Trap> {
        let instance = self.live(id)?;
        let ty = instance
            .module
            .function_type(func)
            .ok_or(Trap::UnknownFunction(func))?;
        if !kinds_match(&ty.params, args) {
            return Err(Trap::Host(format!(
                "function {func} expects {ty}, called with {}",
                describe(args)
            )));
        }
        let machine = Arc::clone(&instance.machine);
        self.reenter(|store| machine.call(store, id, func, args))
    }

    /// Call through an import of instance `id`.
    pub(crate) fn call_import(
        &mut self,
        id: InstanceId,
        func: u32,
        args: &[Value],
    ) -> std::result::Result<Vec<Value>, Trap> {
        let target = self
            .live(id)?
            .imports
            .get(func as usize)
            .cloned()
            .ok_or(Trap::UnknownFunction(func))?;
        match target {
            ImportTarget::Host(host) => self.reenter(|store| host.call(store, args)),
            ImportTarget::Instance(target) => self.call(target.instance, target.index, args),
        }
    }

    /// Declared type of a function of any instance.
    pub(crate) fn function_type(&self, func: FuncRef) -> std::result::Result<&FunctionType, Trap> {
        self.instance(func.instance)
            .and_then(|i| i.module.function_type(func.index))
            .ok_or(Trap::UnknownFunction(func.index))
    }

    fn reenter<T>(
        &mut self,
        f: impl FnOnce(&mut Self) -> std::result::Result<T, Trap>,
    ) -> std::result::Result<T, Trap> {
        if self.native_depth >= self.limits.max_native_reentry {
            return Err(Trap::CallStackExhausted);
        }
        self.native_depth += 1;
        let result = f(self);
        self.native_depth -= 1;
        result
    }
}

fn kinds_match(kinds: &[ValueKind], values: &[Value]) -> bool {
    kinds.len() == values.len() && kinds.iter().zip(values).all(|(k, v)| *k == v.kind())
}

fn describe(values: &[Value]) -> String {
    let parts: Vec<String> = values.iter().map(ToString::to_string).collect();
    format!("[{}]", parts.join(", "))
}

fn eval_const(expr: ConstExpr, globals: &[u64], instance: InstanceId) -> Result<u64> {
    Ok(match expr {
        ConstExpr::I32(v) => Value::I32(v).to_bits(),
        ConstExpr::I64(v) => Value::I64(v).to_bits(),
        ConstExpr::F32(v) => Value::F32(v).to_bits(),
        ConstExpr::F64(v) => Value::F64(v).to_bits(),
        ConstExpr::RefNull(_) => NULL_REF,
        ConstExpr::RefFunc(index) => Value::FuncRef(Some(FuncRef { instance, index })).to_bits(),
        ConstExpr::GlobalGet(idx) => *globals.get(idx as usize).ok_or_else(|| {
            Error::Link(format!("constant expression reads uninitialized global {idx}"))
        })?,
    })
}

#[allow(clippy::cast_possible_truncation)] // i32 offsets travel as u32
fn const_offset(expr: ConstExpr, globals: &[u64], instance: InstanceId) -> Result<u32> {
    Ok(eval_const(expr, globals, instance)? as u32)
}
