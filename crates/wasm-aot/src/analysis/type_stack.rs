// Abstract operand-stack model used while analyzing one function.
//
// Open scopes live on an explicit stack indexed by `ScopeId`; each entry keeps
// the stack depth at entry and the shape the block leaves behind, which is what
// the stack is reset to after unreachable code.

use crate::wasm::{FunctionType, ValueKind};
use crate::{Error, Result};

/// A block-like region: the function's implicit block, or the instruction
/// index of a `block`, `loop` or `if`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScopeId {
    Function,
    Block(usize),
}

#[derive(Debug, Clone)]
struct Scope {
    id: ScopeId,
    /// Stack depth at entry, parameters included.
    depth: usize,
    params: usize,
    /// Stack shape after the block completes.
    restore: Vec<ValueKind>,
}

#[derive(Debug, Clone)]
pub struct TypeStack {
    /// Live stack on top, if/else snapshots below it.
    types: Vec<Vec<ValueKind>>,
    scopes: Vec<Scope>,
}

impl Default for TypeStack {
    fn default() -> Self {
        Self::new()
    }
}

impl TypeStack {
    #[must_use]
    pub fn new() -> Self {
        Self {
            types: vec![Vec::new()],
            scopes: Vec::new(),
        }
    }

    fn live(&self) -> &Vec<ValueKind> {
        // `types` is never empty: `pop_snapshot` refuses to remove the base.
        &self.types[self.types.len() - 1]
    }

    fn live_mut(&mut self) -> &mut Vec<ValueKind> {
        let top = self.types.len() - 1;
        &mut self.types[top]
    }

    /// Live stack, bottom first.
    #[must_use]
    pub fn types(&self) -> &[ValueKind] {
        self.live()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.live().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.live().is_empty()
    }

    pub fn push(&mut self, kind: ValueKind) {
        self.live_mut().push(kind);
    }

    pub fn pop(&mut self, expected: ValueKind) -> Result<()> {
        match self.live_mut().pop() {
            Some(actual) if actual == expected => Ok(()),
            actual => Err(Error::TypeMismatch { expected, actual }),
        }
    }

    /// Pop whatever is on top, for polymorphic operators (`drop`, `select`).
    pub fn pop_any(&mut self) -> Result<ValueKind> {
        self.live_mut()
            .pop()
            .ok_or_else(|| Error::Internal("pop from empty type stack".to_string()))
    }

    pub fn peek(&self) -> Result<ValueKind> {
        self.live()
            .last()
            .copied()
            .ok_or_else(|| Error::Internal("peek on empty type stack".to_string()))
    }

    pub fn enter_scope(&mut self, id: ScopeId, block_type: &FunctionType) -> Result<()> {
        let live = self.live();
        let params = block_type.params.len();
        let base = live.len().checked_sub(params).ok_or_else(|| {
            Error::Internal(format!("block parameters exceed stack depth at {id:?}"))
        })?;
        let mut restore = live[..base].to_vec();
        restore.extend_from_slice(&block_type.results);
        let depth = live.len();
        self.scopes.push(Scope {
            id,
            depth,
            params,
            restore,
        });
        Ok(())
    }

    pub fn exit_scope(&mut self, id: ScopeId) -> Result<()> {
        match self.scopes.pop() {
            Some(scope) if scope.id == id => Ok(()),
            other => Err(Error::Internal(format!(
                "exiting scope {id:?} but innermost is {:?}",
                other.map(|s| s.id)
            ))),
        }
    }

    fn scope(&self, id: ScopeId) -> Result<&Scope> {
        self.scopes
            .iter()
            .rev()
            .find(|s| s.id == id)
            .ok_or_else(|| Error::Internal(format!("scope {id:?} is not open")))
    }

    /// Stack depth recorded when `id` was entered, its parameters included.
    pub fn scope_depth_at(&self, id: ScopeId) -> Result<usize> {
        self.scope(id).map(|s| s.depth)
    }

    /// Number of parameters `id` took from the stack on entry.
    pub fn scope_params(&self, id: ScopeId) -> Result<usize> {
        self.scope(id).map(|s| s.params)
    }

    #[must_use]
    pub fn scope_count(&self) -> usize {
        self.scopes.len()
    }

    /// Save the live stack so the `else` arm starts from the same shape as the
    /// `then` arm.
    pub fn push_snapshot(&mut self) {
        let copy = self.live().clone();
        self.types.push(copy);
    }

    pub fn pop_snapshot(&mut self) -> Result<()> {
        if self.types.len() < 2 {
            return Err(Error::Internal("no if/else snapshot to pop".to_string()));
        }
        self.types.pop();
        Ok(())
    }

    /// Reset the live stack to the shape `id` leaves behind. Used when the end
    /// of a block is reached after an unconditional transfer.
    pub fn restore_after_unreachable(&mut self, id: ScopeId) -> Result<()> {
        let restore = match self.scopes.last() {
            Some(scope) if scope.id == id => scope.restore.clone(),
            other => {
                return Err(Error::Internal(format!(
                    "restoring scope {id:?} but innermost is {:?}",
                    other.map(|s| s.id)
                )));
            }
        };
        *self.live_mut() = restore;
        Ok(())
    }

    /// Only the function's implicit scope remains and the stack is empty.
    pub fn verify_empty(&self) -> Result<()> {
        if self.types.len() != 1 {
            return Err(Error::Internal(format!(
                "{} if/else snapshots left open",
                self.types.len() - 1
            )));
        }
        if self.scopes.len() != 1 || self.scopes[0].id != ScopeId::Function {
            return Err(Error::Internal(format!(
                "unbalanced scopes at function end: {:?}",
                self.scopes.iter().map(|s| s.id).collect::<Vec<_>>()
            )));
        }
        if !self.is_empty() {
            return Err(Error::Internal(format!(
                "types left on stack at function end: {:?}",
                self.types()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ValueKind::{F64, I32, I64};

    #[test]
    fn test_pop_checks_kind() {
        let mut stack = TypeStack::new();
        stack.push(I32);
        stack.push(I64);
        assert!(matches!(
            stack.pop(I32),
            Err(Error::TypeMismatch {
                expected: I32,
                actual: Some(I64)
            })
        ));
        stack.pop(I32).expect("i32 below");
        assert!(matches!(
            stack.pop(I32),
            Err(Error::TypeMismatch { actual: None, .. })
        ));
    }

    #[test]
    fn test_scope_depth_and_restore() {
        let mut stack = TypeStack::new();
        stack
            .enter_scope(ScopeId::Function, &FunctionType::returning(I32))
            .expect("function scope");
        stack.push(F64);
        stack.push(I64);
        let block = FunctionType::new(vec![I64], vec![I32, I32]);
        stack.enter_scope(ScopeId::Block(4), &block).expect("block");
        assert_eq!(stack.scope_depth_at(ScopeId::Block(4)).expect("depth"), 2);
        assert_eq!(stack.scope_params(ScopeId::Block(4)).expect("params"), 1);

        // unreachable tail leaves garbage behind
        stack.pop(I64).expect("param");
        stack.push(F64);
        stack
            .restore_after_unreachable(ScopeId::Block(4))
            .expect("restore");
        assert_eq!(stack.types(), &[F64, I32, I32]);
        stack.exit_scope(ScopeId::Block(4)).expect("exit");
        assert!(stack.exit_scope(ScopeId::Block(4)).is_err());
    }

    #[test]
    fn test_snapshots_give_both_arms_the_same_start() {
        let mut stack = TypeStack::new();
        stack.push(I32);
        stack.push_snapshot();
        stack.pop(I32).expect("then arm consumes");
        stack.push(I64);
        stack.pop_snapshot().expect("else");
        assert_eq!(stack.types(), &[I32]);
        assert!(stack.pop_snapshot().is_err());
    }

    #[test]
    fn test_verify_empty() {
        let mut stack = TypeStack::new();
        stack
            .enter_scope(ScopeId::Function, &FunctionType::empty())
            .expect("function scope");
        stack.verify_empty().expect("empty");
        stack.push(I32);
        assert!(stack.verify_empty().is_err());
    }
}
