#![allow(
    clippy::cast_possible_truncation, // intentional: slot counts and indices are bounded by the decoder
    clippy::cast_possible_wrap, // intentional: WASM integers are reinterpreted between signed and unsigned
    clippy::cast_sign_loss, // intentional: WASM addresses are i32 but used as u32
    clippy::too_many_lines, // the executor and interpreter dispatch loops are single matches
    clippy::missing_errors_doc // every fallible API returns the crate Error or a Trap
)]

pub mod analysis;
pub mod codegen;
pub mod compiler;
pub mod error;
mod interpreter;
pub mod machine;
mod numeric;
pub mod runtime;
pub mod vm;
pub mod wasm;

/// Test harness module for writing unit and integration tests.
///
/// This module is only available when running tests or when the
/// `test-harness` feature is enabled.
#[cfg(any(test, feature = "test-harness"))]
pub mod test_harness;

pub use compiler::{
    CompileOptions, CompileStats, CompiledModule, FallbackPolicy, MAX_CODE_SIZE, Resolution,
    compile,
};
pub use error::{Error, Result, Trap, TrapKind, describe_function};
pub use machine::{AotMachine, InterpreterMachine, Machine};
pub use runtime::{Engine, HostFunc, Imports, InterruptHandle, Store, StoreLimits};
pub use wasm::{FuncRef, FunctionType, InstanceId, Module, Value, ValueKind};
