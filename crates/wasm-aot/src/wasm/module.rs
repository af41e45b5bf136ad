// Decoder adapter: validates a binary with wasmparser and produces the immutable
// module structures the compiler and runtime consume.

// Parsing code narrows WASM u64 limits and indices to u32/usize.
#![allow(clippy::cast_possible_truncation)]

use std::collections::HashMap;

use wasmparser::{Parser, Payload};

use super::{
    BlockType, FunctionType, Instruction, LoadKind, MemArg, NumOp, Op, StoreKind, ValueKind,
    annotate,
};
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionImport {
    pub module: String,
    pub name: String,
    pub type_index: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportKind {
    Func,
    Table,
    Memory,
    Global,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Export {
    pub name: String,
    pub kind: ExportKind,
    pub index: u32,
}

/// A constant expression, evaluated at instantiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstExpr {
    I32(i32),
    I64(i64),
    F32(u32),
    F64(u64),
    RefNull(ValueKind),
    RefFunc(u32),
    GlobalGet(u32),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Global {
    pub kind: ValueKind,
    pub mutable: bool,
    pub init: ConstExpr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableType {
    pub element: ValueKind,
    pub initial: u32,
    pub maximum: Option<u32>,
    pub init: Option<ConstExpr>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryType {
    pub initial: u32,
    pub maximum: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElementMode {
    Passive,
    Active { table: u32, offset: ConstExpr },
    Declared,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElementSegment {
    pub kind: ValueKind,
    pub items: Vec<ConstExpr>,
    pub mode: ElementMode,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataMode {
    Passive,
    Active { offset: ConstExpr },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataSegment {
    pub bytes: Vec<u8>,
    pub mode: DataMode,
}

/// A decoded function body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionBody {
    /// Declared locals, excluding parameters.
    pub locals: Vec<ValueKind>,
    pub instructions: Vec<Instruction>,
}

/// A validated, decoded module. Function indices cover imports first, then
/// the functions defined by the module.
#[derive(Debug, Clone, Default)]
pub struct Module {
    pub types: Vec<FunctionType>,
    pub imports: Vec<FunctionImport>,
    /// Type index of each defined function.
    pub functions: Vec<u32>,
    pub tables: Vec<TableType>,
    pub memory: Option<MemoryType>,
    pub globals: Vec<Global>,
    pub exports: Vec<Export>,
    pub start: Option<u32>,
    pub elements: Vec<ElementSegment>,
    pub data: Vec<DataSegment>,
    pub bodies: Vec<FunctionBody>,
    /// Function names from the `name` custom section.
    pub names: HashMap<u32, String>,
}

impl Module {
    /// Validate and decode a WASM binary. Proposals beyond the supported set
    /// validate but are rejected while decoding.
    pub fn parse(wasm: &[u8]) -> Result<Self> {
        wasmparser::validate(wasm)?;

        let mut module = Module::default();
        for payload in Parser::new(0).parse_all(wasm) {
            match payload? {
                Payload::TypeSection(reader) => {
                    for rec_group in reader {
                        for sub_type in rec_group?.into_types() {
                            let wasmparser::CompositeInnerType::Func(f) =
                                &sub_type.composite_type.inner
                            else {
                                return Err(Error::Unsupported("non-function type".to_string()));
                            };
                            module.types.push(FunctionType::new(
                                kinds(f.params())?,
                                kinds(f.results())?,
                            ));
                        }
                    }
                }
                Payload::ImportSection(reader) => {
                    for import in reader {
                        let import = import?;
                        let wasmparser::TypeRef::Func(type_index) = import.ty else {
                            return Err(Error::Unsupported(format!(
                                "non-function import {}.{}",
                                import.module, import.name
                            )));
                        };
                        module.imports.push(FunctionImport {
                            module: import.module.to_string(),
                            name: import.name.to_string(),
                            type_index,
                        });
                    }
                }
                Payload::FunctionSection(reader) => {
                    for type_index in reader {
                        module.functions.push(type_index?);
                    }
                }
                Payload::TableSection(reader) => {
                    for table in reader {
                        let table = table?;
                        let init = match table.init {
                            wasmparser::TableInit::RefNull => None,
                            wasmparser::TableInit::Expr(expr) => Some(const_expr(&expr)?),
                        };
                        module.tables.push(TableType {
                            element: ValueKind::from_ref_type(table.ty.element_type)?,
                            initial: table.ty.initial as u32,
                            maximum: table.ty.maximum.map(|m| m as u32),
                            init,
                        });
                    }
                }
                Payload::MemorySection(reader) => {
                    for memory in reader {
                        let memory = memory?;
                        if module.memory.is_some() {
                            return Err(Error::Unsupported("multiple memories".to_string()));
                        }
                        module.memory = Some(MemoryType {
                            initial: memory.initial as u32,
                            maximum: memory.maximum.map(|m| m as u32),
                        });
                    }
                }
                Payload::GlobalSection(reader) => {
                    for global in reader {
                        let global = global?;
                        module.globals.push(Global {
                            kind: ValueKind::from_val_type(global.ty.content_type)?,
                            mutable: global.ty.mutable,
                            init: const_expr(&global.init_expr)?,
                        });
                    }
                }
                Payload::ExportSection(reader) => {
                    for export in reader {
                        let export = export?;
                        let kind = match export.kind {
                            wasmparser::ExternalKind::Func => ExportKind::Func,
                            wasmparser::ExternalKind::Table => ExportKind::Table,
                            wasmparser::ExternalKind::Memory => ExportKind::Memory,
                            wasmparser::ExternalKind::Global => ExportKind::Global,
                            wasmparser::ExternalKind::Tag => {
                                return Err(Error::Unsupported("tag export".to_string()));
                            }
                        };
                        module.exports.push(Export {
                            name: export.name.to_string(),
                            kind,
                            index: export.index,
                        });
                    }
                }
                Payload::StartSection { func, .. } => module.start = Some(func),
                Payload::ElementSection(reader) => {
                    for element in reader {
                        module.elements.push(element_segment(element?)?);
                    }
                }
                Payload::DataSection(reader) => {
                    for data in reader {
                        let data = data?;
                        let mode = match data.kind {
                            wasmparser::DataKind::Passive => DataMode::Passive,
                            wasmparser::DataKind::Active { offset_expr, .. } => DataMode::Active {
                                offset: const_expr(&offset_expr)?,
                            },
                        };
                        module.data.push(DataSegment {
                            bytes: data.data.to_vec(),
                            mode,
                        });
                    }
                }
                Payload::CodeSectionEntry(body) => {
                    module.bodies.push(function_body(&body)?);
                }
                Payload::CustomSection(reader) => {
                    if let wasmparser::KnownCustom::Name(names) = reader.as_known() {
                        read_function_names(names, &mut module.names);
                    }
                }
                _ => {}
            }
        }
        Ok(module)
    }

    #[must_use]
    pub fn import_count(&self) -> u32 {
        self.imports.len() as u32
    }

    /// Total number of functions, imports included.
    #[must_use]
    pub fn function_count(&self) -> u32 {
        (self.imports.len() + self.functions.len()) as u32
    }

    #[must_use]
    pub fn function_type_index(&self, func: u32) -> Option<u32> {
        let func = func as usize;
        if func < self.imports.len() {
            Some(self.imports[func].type_index)
        } else {
            self.functions.get(func - self.imports.len()).copied()
        }
    }

    #[must_use]
    pub fn function_type(&self, func: u32) -> Option<&FunctionType> {
        self.function_type_index(func)
            .and_then(|idx| self.types.get(idx as usize))
    }

    /// Body of a defined (non-imported) function, by function index.
    #[must_use]
    pub fn body(&self, func: u32) -> Option<&FunctionBody> {
        (func as usize)
            .checked_sub(self.imports.len())
            .and_then(|local| self.bodies.get(local))
    }

    pub fn block_type(&self, block_type: BlockType) -> Result<FunctionType> {
        match block_type {
            BlockType::Empty => Ok(FunctionType::empty()),
            BlockType::Value(kind) => Ok(FunctionType::returning(kind)),
            BlockType::Func(idx) => self
                .types
                .get(idx as usize)
                .cloned()
                .ok_or_else(|| Error::Internal(format!("block type {idx} out of range"))),
        }
    }

    #[must_use]
    pub fn export(&self, name: &str) -> Option<&Export> {
        self.exports.iter().find(|e| e.name == name)
    }

    #[must_use]
    pub fn exported_function(&self, name: &str) -> Option<u32> {
        self.export(name)
            .filter(|e| e.kind == ExportKind::Func)
            .map(|e| e.index)
    }

    #[must_use]
    pub fn function_name(&self, func: u32) -> Option<&str> {
        self.names.get(&func).map(String::as_str)
    }
}

fn kinds(types: &[wasmparser::ValType]) -> Result<Vec<ValueKind>> {
    types.iter().map(|t| ValueKind::from_val_type(*t)).collect()
}

fn read_function_names(reader: wasmparser::NameSectionReader<'_>, out: &mut HashMap<u32, String>) {
    // The name section is advisory: malformed subsections are skipped.
    for name in reader.into_iter().flatten() {
        if let wasmparser::Name::Function(map) = name {
            for naming in map.into_iter().flatten() {
                out.insert(naming.index, naming.name.to_string());
            }
        }
    }
}

fn heap_kind(heap: wasmparser::HeapType) -> Result<ValueKind> {
    match heap {
        wasmparser::HeapType::Abstract {
            ty: wasmparser::AbstractHeapType::Func,
            ..
        } => Ok(ValueKind::FuncRef),
        wasmparser::HeapType::Abstract {
            ty: wasmparser::AbstractHeapType::Extern,
            ..
        } => Ok(ValueKind::ExternRef),
        other => Err(Error::Unsupported(format!("heap type {other:?}"))),
    }
}

fn const_expr(expr: &wasmparser::ConstExpr<'_>) -> Result<ConstExpr> {
    let mut reader = expr.get_operators_reader();
    let mut value = None;
    while !reader.eof() {
        let op = reader.read()?;
        let decoded = match op {
            wasmparser::Operator::I32Const { value } => ConstExpr::I32(value),
            wasmparser::Operator::I64Const { value } => ConstExpr::I64(value),
            wasmparser::Operator::F32Const { value } => ConstExpr::F32(value.bits()),
            wasmparser::Operator::F64Const { value } => ConstExpr::F64(value.bits()),
            wasmparser::Operator::RefNull { hty } => ConstExpr::RefNull(heap_kind(hty)?),
            wasmparser::Operator::RefFunc { function_index } => ConstExpr::RefFunc(function_index),
            wasmparser::Operator::GlobalGet { global_index } => ConstExpr::GlobalGet(global_index),
            wasmparser::Operator::End => break,
            other => {
                return Err(Error::Unsupported(format!(
                    "constant expression operator {other:?}"
                )));
            }
        };
        if value.replace(decoded).is_some() {
            return Err(Error::Unsupported("extended constant expressions".to_string()));
        }
    }
    value.ok_or_else(|| Error::Internal("empty constant expression".to_string()))
}

fn element_segment(element: wasmparser::Element<'_>) -> Result<ElementSegment> {
    let (kind, items) = match element.items {
        wasmparser::ElementItems::Functions(reader) => {
            let mut items = Vec::new();
            for func in reader {
                items.push(ConstExpr::RefFunc(func?));
            }
            (ValueKind::FuncRef, items)
        }
        wasmparser::ElementItems::Expressions(ty, reader) => {
            let mut items = Vec::new();
            for expr in reader {
                items.push(const_expr(&expr?)?);
            }
            (ValueKind::from_ref_type(ty)?, items)
        }
    };
    let mode = match element.kind {
        wasmparser::ElementKind::Passive => ElementMode::Passive,
        wasmparser::ElementKind::Declared => ElementMode::Declared,
        wasmparser::ElementKind::Active {
            table_index,
            offset_expr,
        } => ElementMode::Active {
            table: table_index.unwrap_or(0),
            offset: const_expr(&offset_expr)?,
        },
    };
    Ok(ElementSegment { kind, items, mode })
}

fn function_body(body: &wasmparser::FunctionBody<'_>) -> Result<FunctionBody> {
    let mut locals = Vec::new();
    for local in body.get_locals_reader()? {
        let (count, ty) = local?;
        let kind = ValueKind::from_val_type(ty)?;
        locals.extend(std::iter::repeat_n(kind, count as usize));
    }

    let mut ops = Vec::new();
    let mut reader = body.get_operators_reader()?;
    while !reader.eof() {
        ops.push(decode_operator(&reader.read()?)?);
    }
    Ok(FunctionBody {
        locals,
        instructions: annotate(ops),
    })
}

fn mem(memarg: wasmparser::MemArg) -> MemArg {
    MemArg {
        offset: memarg.offset,
    }
}

fn block_type(ty: wasmparser::BlockType) -> Result<BlockType> {
    Ok(match ty {
        wasmparser::BlockType::Empty => BlockType::Empty,
        wasmparser::BlockType::Type(t) => BlockType::Value(ValueKind::from_val_type(t)?),
        wasmparser::BlockType::FuncType(idx) => BlockType::Func(idx),
    })
}

#[allow(clippy::too_many_lines)]
fn decode_operator(op: &wasmparser::Operator<'_>) -> Result<Op> {
    use wasmparser::Operator as O;

    if let Some(num) = NumOp::from_operator(op) {
        return Ok(Op::Num(num));
    }

    Ok(match *op {
        O::Unreachable => Op::Unreachable,
        O::Nop => Op::Nop,
        O::Block { blockty } => Op::Block(block_type(blockty)?),
        O::Loop { blockty } => Op::Loop(block_type(blockty)?),
        O::If { blockty } => Op::If(block_type(blockty)?),
        O::Else => Op::Else,
        O::End => Op::End,
        O::Br { relative_depth } => Op::Br(relative_depth),
        O::BrIf { relative_depth } => Op::BrIf(relative_depth),
        O::BrTable { ref targets } => Op::BrTable {
            targets: targets.targets().collect::<std::result::Result<Vec<_>, _>>()?,
            default: targets.default(),
        },
        O::Return => Op::Return,
        O::Call { function_index } => Op::Call(function_index),
        O::CallIndirect {
            type_index,
            table_index,
        } => Op::CallIndirect {
            type_index,
            table: table_index,
        },
        O::ReturnCall { function_index } => Op::ReturnCall(function_index),
        O::ReturnCallIndirect {
            type_index,
            table_index,
        } => Op::ReturnCallIndirect {
            type_index,
            table: table_index,
        },
        O::Drop => Op::Drop,
        O::Select => Op::Select,
        O::TypedSelect { ty } => Op::TypedSelect(ValueKind::from_val_type(ty)?),
        O::LocalGet { local_index } => Op::LocalGet(local_index),
        O::LocalSet { local_index } => Op::LocalSet(local_index),
        O::LocalTee { local_index } => Op::LocalTee(local_index),
        O::GlobalGet { global_index } => Op::GlobalGet(global_index),
        O::GlobalSet { global_index } => Op::GlobalSet(global_index),
        O::TableGet { table } => Op::TableGet(table),
        O::TableSet { table } => Op::TableSet(table),
        O::TableSize { table } => Op::TableSize(table),
        O::TableGrow { table } => Op::TableGrow(table),
        O::TableFill { table } => Op::TableFill(table),
        O::TableCopy {
            dst_table,
            src_table,
        } => Op::TableCopy {
            dst: dst_table,
            src: src_table,
        },
        O::TableInit { elem_index, table } => Op::TableInit {
            elem: elem_index,
            table,
        },
        O::ElemDrop { elem_index } => Op::ElemDrop(elem_index),
        O::I32Load { memarg } => Op::Load(LoadKind::I32, mem(memarg)),
        O::I64Load { memarg } => Op::Load(LoadKind::I64, mem(memarg)),
        O::F32Load { memarg } => Op::Load(LoadKind::F32, mem(memarg)),
        O::F64Load { memarg } => Op::Load(LoadKind::F64, mem(memarg)),
        O::I32Load8S { memarg } => Op::Load(LoadKind::I32_8S, mem(memarg)),
        O::I32Load8U { memarg } => Op::Load(LoadKind::I32_8U, mem(memarg)),
        O::I32Load16S { memarg } => Op::Load(LoadKind::I32_16S, mem(memarg)),
        O::I32Load16U { memarg } => Op::Load(LoadKind::I32_16U, mem(memarg)),
        O::I64Load8S { memarg } => Op::Load(LoadKind::I64_8S, mem(memarg)),
        O::I64Load8U { memarg } => Op::Load(LoadKind::I64_8U, mem(memarg)),
        O::I64Load16S { memarg } => Op::Load(LoadKind::I64_16S, mem(memarg)),
        O::I64Load16U { memarg } => Op::Load(LoadKind::I64_16U, mem(memarg)),
        O::I64Load32S { memarg } => Op::Load(LoadKind::I64_32S, mem(memarg)),
        O::I64Load32U { memarg } => Op::Load(LoadKind::I64_32U, mem(memarg)),
        O::I32Store { memarg } => Op::Store(StoreKind::I32, mem(memarg)),
        O::I64Store { memarg } => Op::Store(StoreKind::I64, mem(memarg)),
        O::F32Store { memarg } => Op::Store(StoreKind::F32, mem(memarg)),
        O::F64Store { memarg } => Op::Store(StoreKind::F64, mem(memarg)),
        O::I32Store8 { memarg } => Op::Store(StoreKind::I32_8, mem(memarg)),
        O::I32Store16 { memarg } => Op::Store(StoreKind::I32_16, mem(memarg)),
        O::I64Store8 { memarg } => Op::Store(StoreKind::I64_8, mem(memarg)),
        O::I64Store16 { memarg } => Op::Store(StoreKind::I64_16, mem(memarg)),
        O::I64Store32 { memarg } => Op::Store(StoreKind::I64_32, mem(memarg)),
        O::MemorySize { .. } => Op::MemorySize,
        O::MemoryGrow { .. } => Op::MemoryGrow,
        O::MemoryFill { .. } => Op::MemoryFill,
        O::MemoryCopy { .. } => Op::MemoryCopy,
        O::MemoryInit { data_index, .. } => Op::MemoryInit(data_index),
        O::DataDrop { data_index } => Op::DataDrop(data_index),
        O::I32Const { value } => Op::I32Const(value),
        O::I64Const { value } => Op::I64Const(value),
        O::F32Const { value } => Op::F32Const(value.bits()),
        O::F64Const { value } => Op::F64Const(value.bits()),
        O::RefNull { hty } => Op::RefNull(heap_kind(hty)?),
        O::RefIsNull => Op::RefIsNull,
        O::RefFunc { function_index } => Op::RefFunc(function_index),
        ref other => {
            return Err(Error::UnsupportedOpcode(format!("{other:?}")));
        }
    })
}
