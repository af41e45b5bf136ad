//! Function analysis: abstract type stack plus the single pass that turns
//! structured control flow into label-based normalized instructions.

mod analyzer;
mod normalized;
mod type_stack;

pub use analyzer::Analyzer;
pub use normalized::{Label, NormalizedInstruction};
pub use type_stack::{ScopeId, TypeStack};
