// Annotated instructions: each decoded operator plus its structural metadata.
//
// Branch targets are instruction indices. A forward target is the index of the
// closing `end` of the target block; a backward target is the index of the
// `loop` itself. Branches to the function level target the body's final `end`.

use super::Op;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    pub op: Op,
    /// Number of enclosing open blocks. `else` and `end` report the depth of
    /// the block they belong to, i.e. one more than its opener.
    pub depth: usize,
    /// Index of the opener of the enclosing block. For `else`/`end` it is the
    /// block being continued or closed. `None` at function level.
    pub scope: Option<usize>,
    pub label_true: Option<usize>,
    pub label_false: Option<usize>,
    pub label_table: Vec<usize>,
}

impl Instruction {
    fn plain(op: Op, depth: usize, scope: Option<usize>) -> Self {
        Self {
            op,
            depth,
            scope,
            label_true: None,
            label_false: None,
            label_table: Vec::new(),
        }
    }

    /// Every label this instruction can transfer control to.
    pub fn labels(&self) -> impl Iterator<Item = usize> + '_ {
        self.label_true
            .into_iter()
            .chain(self.label_false)
            .chain(self.label_table.iter().copied())
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct BlockInfo {
    else_index: Option<usize>,
    end_index: usize,
}

/// Resolve depth, scope and label targets for a function body.
///
/// `ops` must be a validated body, terminated by the function-level `end`.
pub fn annotate(ops: Vec<Op>) -> Vec<Instruction> {
    let last = ops.len().saturating_sub(1);

    // Pass 1: match every opener with its `else` and `end`.
    let mut blocks = vec![BlockInfo::default(); ops.len()];
    let mut open: Vec<usize> = Vec::new();
    for (i, op) in ops.iter().enumerate() {
        match op {
            Op::Block(_) | Op::Loop(_) | Op::If(_) => open.push(i),
            Op::Else => {
                if let Some(&opener) = open.last() {
                    blocks[opener].else_index = Some(i);
                }
            }
            Op::End => {
                if let Some(opener) = open.pop() {
                    blocks[opener].end_index = i;
                }
            }
            _ => {}
        }
    }

    let branch_target = |open: &[usize], relative_depth: u32| -> usize {
        let depth = relative_depth as usize;
        if depth >= open.len() {
            return last;
        }
        let opener = open[open.len() - 1 - depth];
        if matches!(ops[opener], Op::Loop(_)) {
            opener
        } else {
            blocks[opener].end_index
        }
    };

    // Pass 2: assign metadata.
    let mut out = Vec::with_capacity(ops.len());
    let mut open: Vec<usize> = Vec::new();
    for (i, op) in ops.iter().enumerate() {
        let scope = open.last().copied();
        let depth = open.len();
        let instruction = match op {
            Op::Block(_) | Op::Loop(_) => {
                open.push(i);
                Instruction::plain(op.clone(), depth, scope)
            }
            Op::If(_) => {
                let info = blocks[i];
                let mut ins = Instruction::plain(op.clone(), depth, scope);
                ins.label_true = Some(info.end_index);
                ins.label_false = Some(info.else_index.map_or(info.end_index, |e| e + 1));
                open.push(i);
                ins
            }
            Op::Else => {
                let mut ins = Instruction::plain(op.clone(), depth, scope);
                if let Some(opener) = scope {
                    ins.label_true = Some(blocks[opener].end_index);
                }
                ins
            }
            Op::End => {
                open.pop();
                Instruction::plain(op.clone(), depth, scope)
            }
            Op::Br(d) => {
                let mut ins = Instruction::plain(op.clone(), depth, scope);
                ins.label_true = Some(branch_target(&open, *d));
                ins
            }
            Op::BrIf(d) => {
                let mut ins = Instruction::plain(op.clone(), depth, scope);
                ins.label_true = Some(branch_target(&open, *d));
                ins.label_false = Some(i + 1);
                ins
            }
            Op::BrTable { targets, default } => {
                let mut ins = Instruction::plain(op.clone(), depth, scope);
                ins.label_table = targets
                    .iter()
                    .chain(std::iter::once(default))
                    .map(|d| branch_target(&open, *d))
                    .collect();
                ins
            }
            _ => Instruction::plain(op.clone(), depth, scope),
        };
        out.push(instruction);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wasm::{BlockType, NumOp};

    #[test]
    fn test_block_and_loop_targets() {
        // 0 block
        // 1   loop
        // 2     br_if 1
        // 3     br 0
        // 4   end
        // 5 end
        // 6 end (function)
        let ops = vec![
            Op::Block(BlockType::Empty),
            Op::Loop(BlockType::Empty),
            Op::BrIf(1),
            Op::Br(0),
            Op::End,
            Op::End,
            Op::End,
        ];
        let ins = annotate(ops);
        assert_eq!(ins[2].label_true, Some(5));
        assert_eq!(ins[2].label_false, Some(3));
        assert_eq!(ins[3].label_true, Some(1));
        assert_eq!(ins[2].depth, 2);
        assert_eq!(ins[4].depth, 2);
        assert_eq!(ins[4].scope, Some(1));
        assert_eq!(ins[5].depth, 1);
        assert_eq!(ins[5].scope, Some(0));
        assert_eq!(ins[6].depth, 0);
        assert_eq!(ins[6].scope, None);
    }

    #[test]
    fn test_if_else_labels() {
        // 0 if
        // 1   i32.const 1
        // 2 else
        // 3   i32.const 2
        // 4 end
        // 5 end
        let ops = vec![
            Op::If(BlockType::Value(crate::wasm::ValueKind::I32)),
            Op::I32Const(1),
            Op::Else,
            Op::I32Const(2),
            Op::End,
            Op::End,
        ];
        let ins = annotate(ops);
        assert_eq!(ins[0].label_false, Some(3));
        assert_eq!(ins[0].label_true, Some(4));
        assert_eq!(ins[2].label_true, Some(4));
        assert_eq!(ins[2].scope, Some(0));
    }

    #[test]
    fn test_function_level_branch_targets_final_end() {
        let ops = vec![
            Op::I32Const(0),
            Op::BrTable {
                targets: vec![0],
                default: 0,
            },
            Op::Num(NumOp::I32Add),
            Op::End,
        ];
        let ins = annotate(ops);
        assert_eq!(ins[1].label_table, vec![3, 3]);
    }
}
