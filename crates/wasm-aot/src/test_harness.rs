//! Test harness for wasm-aot unit and integration tests
//!
//! Helpers to turn WAT into decoded, analyzed, compiled or instantiated
//! modules, generators for modules too large to write by hand, and pattern
//! matching over normalized instructions.
//!
//! # Example
//!
//! ```rust
//! use wasm_aot::test_harness::*;
//!
//! let code = analyze_wat(
//!     r#"(module
//!         (func (param i32) (result i32)
//!             block (result i32)
//!                 local.get 0
//!                 br 0
//!             end))"#,
//!     0,
//! );
//!
//! assert_has_pattern(&code, &[
//!     CodePattern::Wasm(Pat::Exact(wasm_aot::wasm::Op::LocalGet(0))),
//!     CodePattern::Goto(Pat::Any),
//! ]);
//! ```

#![allow(
    clippy::match_same_arms,
    clippy::must_use_candidate,
    clippy::manual_assert,
    clippy::missing_panics_doc,
    clippy::uninlined_format_args
)]

use std::sync::Arc;

use wasm_encoder::{
    CodeSection, ExportKind, ExportSection, Function, FunctionSection, Instruction as W,
    TypeSection, ValType,
};

use crate::analysis::{Analyzer, Label, NormalizedInstruction};
use crate::runtime::{Engine, Imports, Store};
use crate::vm::{CodeUnit, Instruction, Opcode};
use crate::wasm::{InstanceId, Module, Op};
use crate::{CompileOptions, CompiledModule, Error, Result, compile};

/// Parse WAT (WebAssembly Text) format to WASM binary
pub fn wat_to_wasm(wat: &str) -> Result<Vec<u8>> {
    wat::parse_str(wat).map_err(|e| Error::Internal(format!("WAT parse error: {e}")))
}

/// Parse and decode WAT, panicking on malformed input.
pub fn parse_wat(wat: &str) -> Module {
    let wasm = wat_to_wasm(wat).unwrap_or_else(|e| panic!("{e}"));
    Module::parse(&wasm).unwrap_or_else(|e| panic!("decode failed: {e}"))
}

/// Compile WAT with the given options.
pub fn compile_wat(wat: &str, options: &CompileOptions) -> Result<CompiledModule> {
    let wasm = wat_to_wasm(wat)?;
    compile(&Arc::new(Module::parse(&wasm)?), options)
}

/// Normalized instructions of function `func`.
pub fn analyze_wat(wat: &str, func: u32) -> Vec<NormalizedInstruction> {
    let module = parse_wat(wat);
    Analyzer::new(&module)
        .analyze(func)
        .unwrap_or_else(|e| panic!("analysis failed: {e}"))
}

/// A fresh store holding one instance of `wat`, without imports.
pub fn instantiate_wat(wat: &str, engine: &Engine) -> (Store, InstanceId) {
    let module = Arc::new(parse_wat(wat));
    let mut store = Store::new();
    let id = store
        .instantiate(&module, &Imports::new(), engine)
        .unwrap_or_else(|e| panic!("instantiation failed: {e}"));
    (store, id)
}

/// `count` functions of type `(i32) -> i32`; function `i` returns its
/// argument plus `i`. Function `i` is exported as `f{i}`.
pub fn many_functions_module(count: u32) -> Vec<u8> {
    let mut module = wasm_encoder::Module::new();

    let mut types = TypeSection::new();
    types.ty().function([ValType::I32], [ValType::I32]);
    module.section(&types);

    let mut functions = FunctionSection::new();
    for _ in 0..count {
        functions.function(0);
    }
    module.section(&functions);

    let mut exports = ExportSection::new();
    for i in 0..count {
        exports.export(&format!("f{i}"), ExportKind::Func, i);
    }
    module.section(&exports);

    let mut code = CodeSection::new();
    for i in 0..count {
        let mut f = Function::new([]);
        f.instruction(&W::LocalGet(0));
        f.instruction(&W::I32Const(i32::try_from(i).unwrap_or(i32::MAX)));
        f.instruction(&W::I32Add);
        f.instruction(&W::End);
        code.function(&f);
    }
    module.section(&code);

    module.finish()
}

/// Three `(i32) -> i32` functions exported as `small`, `double` and `big`.
/// `big` (index 2) adds one to its argument `additions` times, which makes
/// its code unit far larger than its body.
pub fn oversized_function_module(additions: u32) -> Vec<u8> {
    let mut module = wasm_encoder::Module::new();

    let mut types = TypeSection::new();
    types.ty().function([ValType::I32], [ValType::I32]);
    module.section(&types);

    let mut functions = FunctionSection::new();
    for _ in 0..3 {
        functions.function(0);
    }
    module.section(&functions);

    let mut exports = ExportSection::new();
    exports.export("small", ExportKind::Func, 0);
    exports.export("double", ExportKind::Func, 1);
    exports.export("big", ExportKind::Func, 2);
    module.section(&exports);

    let mut code = CodeSection::new();

    let mut small = Function::new([]);
    small.instruction(&W::LocalGet(0));
    small.instruction(&W::I32Const(7));
    small.instruction(&W::I32Add);
    small.instruction(&W::End);
    code.function(&small);

    let mut double = Function::new([]);
    double.instruction(&W::LocalGet(0));
    double.instruction(&W::LocalGet(0));
    double.instruction(&W::I32Add);
    double.instruction(&W::End);
    code.function(&double);

    let mut big = Function::new([]);
    big.instruction(&W::LocalGet(0));
    for _ in 0..additions {
        big.instruction(&W::I32Const(1));
        big.instruction(&W::I32Add);
    }
    big.instruction(&W::End);
    code.function(&big);

    module.section(&code);
    module.finish()
}

/// Pattern matching for instruction fields
#[derive(Debug, Clone)]
pub enum Pat<T> {
    /// Match any value
    Any,
    /// Match exact value
    Exact(T),
    /// Match if value satisfies predicate
    Predicate(fn(&T) -> bool),
}

impl<T: PartialEq> Pat<T> {
    /// Check if a value matches this pattern
    pub fn matches(&self, value: &T) -> bool {
        match self {
            Pat::Any => true,
            Pat::Exact(expected) => value == expected,
            Pat::Predicate(pred) => pred(value),
        }
    }
}

/// Pattern over one normalized instruction. Slot-carrying variants match on
/// value counts.
#[derive(Debug, Clone)]
pub enum CodePattern {
    Any,
    Label(Pat<Label>),
    Goto(Pat<Label>),
    IfEq(Pat<Label>),
    IfNe(Pat<Label>),
    /// Number of targets, default included.
    Switch(Pat<usize>),
    DropKeep { drop: Pat<usize>, keep: Pat<usize> },
    Return(Pat<usize>),
    Trap,
    Drop,
    Select,
    LocalTee(Pat<u32>),
    Call(Pat<u32>),
    CallIndirect(Pat<u32>),
    Wasm(Pat<Op>),
}

impl CodePattern {
    pub fn matches(&self, instruction: &NormalizedInstruction) -> bool {
        use NormalizedInstruction as N;
        match (self, instruction) {
            (CodePattern::Any, _) => true,
            (CodePattern::Label(p), N::Label(l))
            | (CodePattern::Goto(p), N::Goto(l))
            | (CodePattern::IfEq(p), N::IfEq(l))
            | (CodePattern::IfNe(p), N::IfNe(l)) => p.matches(l),
            (CodePattern::Switch(p), N::Switch(targets)) => p.matches(&targets.len()),
            (CodePattern::DropKeep { drop, keep }, N::DropKeep { drop: d, keep: k }) => {
                drop.matches(&d.len()) && keep.matches(&k.len())
            }
            (CodePattern::Return(p), N::Return(kinds)) => p.matches(&kinds.len()),
            (CodePattern::Trap, N::Trap) => true,
            (CodePattern::Drop, N::Drop(_)) => true,
            (CodePattern::Select, N::Select(_)) => true,
            (CodePattern::LocalTee(p), N::LocalTee { local, .. }) => p.matches(local),
            (CodePattern::Call(p), N::Call(func)) => p.matches(func),
            (CodePattern::CallIndirect(p), N::CallIndirect { type_index, .. }) => {
                p.matches(type_index)
            }
            (CodePattern::Wasm(p), N::Wasm(op)) => p.matches(op),
            _ => false,
        }
    }
}

/// Find the first index at which `pattern` matches a contiguous run of
/// `code`.
pub fn find_pattern(code: &[NormalizedInstruction], pattern: &[CodePattern]) -> Option<usize> {
    if pattern.is_empty() {
        return Some(0);
    }
    if pattern.len() > code.len() {
        return None;
    }

    'outer: for start in 0..=(code.len() - pattern.len()) {
        for (offset, pat) in pattern.iter().enumerate() {
            if !pat.matches(&code[start + offset]) {
                continue 'outer;
            }
        }
        return Some(start);
    }
    None
}

/// Assert that `pattern` occurs somewhere in `code`.
pub fn assert_has_pattern(code: &[NormalizedInstruction], pattern: &[CodePattern]) {
    if find_pattern(code, pattern).is_none() {
        let listing: Vec<String> = code.iter().map(ToString::to_string).collect();
        panic!(
            "Pattern not found in instruction sequence.\n\nExpected pattern:\n{:#?}\n\nActual instructions:\n{}",
            pattern,
            listing.join("\n")
        );
    }
}

/// Assert that `pattern` does not occur anywhere in `code`.
pub fn assert_no_pattern(code: &[NormalizedInstruction], pattern: &[CodePattern]) {
    if let Some(at) = find_pattern(code, pattern) {
        panic!("Unexpected pattern at instruction {at}: {:#?}", pattern);
    }
}

/// Decoded instructions of a code unit, with relative jump offsets.
pub fn unit_instructions(unit: &CodeUnit) -> Vec<Instruction> {
    let mut out = Vec::new();
    let mut pos = 0;
    while pos < unit.bytes.len() {
        let (ins, len) = Instruction::decode(&unit.bytes[pos..])
            .unwrap_or_else(|| panic!("undecodable instruction at byte {pos}"));
        out.push(ins);
        pos += len;
    }
    out
}

/// How many of `instructions` are `opcode`.
pub fn count_opcode(instructions: &[Instruction], opcode: Opcode) -> usize {
    instructions.iter().filter(|i| i.opcode() == opcode).count()
}

pub fn has_opcode(instructions: &[Instruction], opcode: Opcode) -> bool {
    instructions.iter().any(|i| i.opcode() == opcode)
}
