use std::collections::{BTreeMap, BTreeSet};

use skiff_lexer::Span;
use skiff_object::SourceMap;

use crate::opcode::{make_instruction, patch_u32, read_operands, OpCode};

/// Per-function cleanup run once a function body is compiled.
///
/// Instructions after a `Return` are unreachable until the next jump target
/// and are dropped. Jumps are re-pointed at the surviving instructions, and
/// a trailing `Return` is appended when the body can fall off its end or a
/// jump targets the old end.
pub fn optimize_func(instructions: &mut Vec<u8>, source_map: &mut SourceMap, span: Span) {
    let targets = jump_targets(instructions);

    let mut kept = Vec::with_capacity(instructions.len());
    let mut pos_map: BTreeMap<usize, usize> = BTreeMap::new();
    let mut dead = false;
    let mut pos = 0;
    while pos < instructions.len() {
        let Ok(op) = OpCode::try_from(instructions[pos]) else {
            break;
        };
        let (_, len) = read_operands(op, instructions, pos);
        if targets.contains(&pos) {
            dead = false;
        }
        if !dead {
            pos_map.insert(pos, kept.len());
            kept.extend_from_slice(&instructions[pos..pos + len]);
            if op == OpCode::Return {
                dead = true;
            }
        }
        pos += len;
    }

    let old_end = instructions.len();
    let new_end = kept.len();
    let mut append_return = false;
    let mut last_op = None;
    let mut pos = 0;
    while pos < kept.len() {
        let Ok(op) = OpCode::try_from(kept[pos]) else {
            break;
        };
        let (operands, len) = read_operands(op, &kept, pos);
        if op.is_jump() {
            let target = match pos_map.get(&operands[0]) {
                Some(&new) => new,
                None => {
                    debug_assert_eq!(operands[0], old_end, "jump into removed code");
                    append_return = true;
                    new_end
                }
            };
            patch_u32(&mut kept, pos + 1, target);
        }
        last_op = Some(op);
        pos += len;
    }
    if last_op != Some(OpCode::Return) {
        append_return = true;
    }

    *source_map = source_map
        .iter()
        .filter_map(|(old, span)| pos_map.get(old).map(|&new| (new, *span)))
        .collect();
    *instructions = kept;

    if append_return {
        source_map.insert(instructions.len(), span);
        instructions.extend(make_instruction(OpCode::Return, &[0]));
    }
}

fn jump_targets(code: &[u8]) -> BTreeSet<usize> {
    let mut targets = BTreeSet::new();
    let mut pos = 0;
    while pos < code.len() {
        let Ok(op) = OpCode::try_from(code[pos]) else {
            break;
        };
        let (operands, len) = read_operands(op, code, pos);
        if op.is_jump() {
            targets.insert(operands[0]);
        }
        pos += len;
    }
    targets
}
