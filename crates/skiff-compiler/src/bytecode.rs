use std::fmt::Write as _;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use skiff_lexer::SourceFileSet;
use skiff_object::{CompiledFunction, Value};

use crate::opcode::{make_instruction, read_operands, OpCode};

/// A compiled program: the main function plus the constant pool every
/// function indexes into.
#[derive(Debug, Clone)]
pub struct Bytecode {
    pub file_set: SourceFileSet,
    pub main_function: Arc<CompiledFunction>,
    pub constants: Vec<Value>,
}

impl Bytecode {
    /// Merge identical constants and rewrite every `Constant` and `Closure`
    /// operand to the merged indexes.
    ///
    /// Functions are merged by identity and scalars by value. Running it
    /// twice changes nothing the second time.
    pub fn remove_duplicates(&mut self) {
        let mut deduped: Vec<Value> = Vec::with_capacity(self.constants.len());
        let mut index_map: Vec<usize> = Vec::with_capacity(self.constants.len());

        let mut fns: FxHashMap<*const CompiledFunction, usize> = FxHashMap::default();
        let mut ints: FxHashMap<i64, usize> = FxHashMap::default();
        let mut floats: FxHashMap<u64, usize> = FxHashMap::default();
        let mut strings: FxHashMap<Arc<str>, usize> = FxHashMap::default();
        let mut chars: FxHashMap<char, usize> = FxHashMap::default();

        for constant in self.constants.drain(..) {
            let next = deduped.len();
            let existing = match &constant {
                Value::Function(f) => *fns.entry(Arc::as_ptr(f)).or_insert(next),
                Value::Int(i) => *ints.entry(*i).or_insert(next),
                Value::Float(f) => *floats.entry(f.to_bits()).or_insert(next),
                Value::String(s) => *strings.entry(s.clone()).or_insert(next),
                Value::Char(c) => *chars.entry(*c).or_insert(next),
                _ => next,
            };
            index_map.push(existing);
            if existing == next {
                deduped.push(constant);
            }
        }

        for constant in deduped.iter_mut() {
            if let Value::Function(f) = constant {
                *f = Arc::new(rewrite_constant_indexes(f, &index_map));
            }
        }
        self.main_function = Arc::new(rewrite_constant_indexes(&self.main_function, &index_map));
        self.constants = deduped;
    }

    /// Human-readable listing of the main function and every function
    /// constant.
    pub fn disassemble(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Main:");
        for line in format_instructions(&self.main_function.instructions, 0) {
            let _ = writeln!(out, "{}", line);
        }
        let _ = writeln!(out, "Constants:");
        for (i, constant) in self.constants.iter().enumerate() {
            match constant {
                Value::Function(f) => {
                    let _ = writeln!(
                        out,
                        "[{:3}] compiled-function (locals={}, params={}{})",
                        i,
                        f.num_locals,
                        f.num_parameters,
                        if f.var_args { ", varargs" } else { "" }
                    );
                    for line in format_instructions(&f.instructions, 0) {
                        let _ = writeln!(out, "     {}", line);
                    }
                }
                other => {
                    let _ = writeln!(out, "[{:3}] {:?}", i, other);
                }
            }
        }
        out
    }
}

fn rewrite_constant_indexes(func: &CompiledFunction, index_map: &[usize]) -> CompiledFunction {
    let mut code = func.instructions.to_vec();
    let mut pos = 0;
    while pos < code.len() {
        let Ok(op) = OpCode::try_from(code[pos]) else {
            break;
        };
        let (operands, len) = read_operands(op, &code, pos);
        match op {
            OpCode::Constant | OpCode::Closure => {
                let old = operands[0];
                if let Some(&new) = index_map.get(old) {
                    let mut patched = operands.clone();
                    patched[0] = new;
                    let ins = make_instruction(op, &patched);
                    code[pos..pos + ins.len()].copy_from_slice(&ins);
                }
            }
            _ => {}
        }
        pos += len;
    }
    CompiledFunction {
        instructions: code.into(),
        num_locals: func.num_locals,
        num_parameters: func.num_parameters,
        var_args: func.var_args,
        source_map: func.source_map.clone(),
        free: func.free.clone(),
    }
}

/// One line per instruction: `offset NAME operands`.
pub fn format_instructions(code: &[u8], pos_offset: usize) -> Vec<String> {
    let mut out = Vec::new();
    let mut pos = 0;
    while pos < code.len() {
        let op = match OpCode::try_from(code[pos]) {
            Ok(op) => op,
            Err(byte) => {
                out.push(format!("{:04} <invalid 0x{:02x}>", pos_offset + pos, byte));
                pos += 1;
                continue;
            }
        };
        let (operands, len) = read_operands(op, code, pos);
        let line = match operands.as_slice() {
            [] => format!("{:04} {}", pos_offset + pos, op.name()),
            [a] => format!("{:04} {:<8} {:<5}", pos_offset + pos, op.name(), a),
            [a, b, ..] => format!("{:04} {:<8} {:<5} {:<5}", pos_offset + pos, op.name(), a, b),
        };
        out.push(line.trim_end().to_string());
        pos += len;
    }
    out
}
