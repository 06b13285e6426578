use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::Mutex;
use skiff_compiler::{Bytecode, OpCode, CALL_KWARGS, CALL_SPREAD_ARGS, CALL_SPREAD_KWARGS};
use skiff_lexer::{SourceFileSet, SourcePosition};
use skiff_object::{
    Builtin, CancelToken, CompiledFunction, FreeCell, Kwargs, Operator, Routine, RuntimeError,
    Value, ValueIterator,
};

use crate::builtins;

/// A runtime error together with the call stack it unwound.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("Runtime Error: {error}{}", render_trace(.trace))]
pub struct VmError {
    #[source]
    pub error: RuntimeError,
    /// Innermost frame first.
    pub trace: Vec<SourcePosition>,
}

fn render_trace(trace: &[SourcePosition]) -> String {
    trace.iter().map(|pos| format!("\n\tat {}", pos)).collect()
}

/// VM limits.
#[derive(Debug, Clone)]
pub struct VmConfig {
    /// Value stack slots.
    pub stack_size: usize,
    /// Maximum call depth.
    pub max_frames: usize,
    /// Initial number of global slots.
    pub globals_size: usize,
    /// Allocation budget per run; negative means unbounded.
    pub max_allocs: i64,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            stack_size: 2048,
            max_frames: 1024,
            globals_size: 1024,
            max_allocs: -1,
        }
    }
}

#[derive(Debug, Clone)]
struct Frame {
    func: Arc<CompiledFunction>,
    /// Resume position, valid for every frame but the running one.
    ip: usize,
    /// Stack slot of the first argument. The callee sits just below.
    base: usize,
    /// Set when a `Pop; Return` tail call was folded into this frame.
    discard_result: bool,
}

/// The Skiff virtual machine.
///
/// Runs one [`Bytecode`] on the current thread. Constants and instruction
/// bytes are shared with the VMs of spawned routines.
pub struct Vm {
    constants: Arc<[Value]>,
    file_set: Arc<SourceFileSet>,
    main: Arc<CompiledFunction>,
    stack: Vec<Value>,
    sp: usize,
    globals: Vec<Value>,
    frames: Vec<Frame>,
    // Running frame, cached out of `frames`.
    func: Arc<CompiledFunction>,
    code: Arc<[u8]>,
    ip: usize,
    base: usize,
    /// Allocations left before the budget is exhausted. Shared with every
    /// routine this run spawns.
    allocs: Option<Arc<AtomicI64>>,
    config: VmConfig,
    cancel: CancelToken,
}

impl Vm {
    pub fn new(bytecode: Bytecode, globals: Option<Vec<Value>>, max_allocs: i64) -> Self {
        let config = VmConfig {
            max_allocs,
            ..VmConfig::default()
        };
        Self::with_config(bytecode, globals, config)
    }

    pub fn with_config(bytecode: Bytecode, globals: Option<Vec<Value>>, config: VmConfig) -> Self {
        let mut globals = globals.unwrap_or_default();
        if globals.len() < config.globals_size {
            globals.resize(config.globals_size, Value::Undefined);
        }
        let main = bytecode.main_function;
        Self {
            constants: bytecode.constants.into(),
            file_set: Arc::new(bytecode.file_set),
            stack: vec![Value::Undefined; config.stack_size],
            sp: 0,
            globals,
            frames: Vec::with_capacity(config.max_frames),
            code: main.instructions.clone(),
            func: main.clone(),
            main,
            ip: 0,
            base: 0,
            allocs: budget(config.max_allocs),
            config,
            cancel: CancelToken::new(),
        }
    }

    /// A VM for a spawned routine: same program, snapshot of the globals,
    /// fresh stack.
    pub(crate) fn fork(&self, cancel: CancelToken) -> Self {
        Self {
            constants: self.constants.clone(),
            file_set: self.file_set.clone(),
            main: self.main.clone(),
            stack: vec![Value::Undefined; self.config.stack_size],
            sp: 0,
            globals: self.globals.clone(),
            frames: Vec::with_capacity(self.config.max_frames),
            func: self.main.clone(),
            code: self.main.instructions.clone(),
            ip: 0,
            base: 0,
            allocs: self.allocs.clone(),
            config: self.config.clone(),
            cancel,
        }
    }

    /// Run the main function to completion.
    pub fn run(&mut self) -> Result<(), VmError> {
        let cancel = self.cancel.clone();
        self.run_with_cancel(&cancel)
    }

    /// Run with an externally owned cancellation token. The token stays
    /// with the VM afterwards.
    pub fn run_with_cancel(&mut self, cancel: &CancelToken) -> Result<(), VmError> {
        self.cancel = cancel.clone();
        self.allocs = budget(self.config.max_allocs);
        self.sp = 0;
        self.frames.clear();
        self.func = self.main.clone();
        self.code = self.main.instructions.clone();
        self.ip = 0;
        self.base = 0;
        self.frames.push(Frame {
            func: self.main.clone(),
            ip: 0,
            base: 0,
            discard_result: false,
        });

        let result = self.execute(0);
        let result = result.map(|_| ()).map_err(|e| self.error_with_trace(e));
        self.clear_stack(0);
        self.frames.clear();
        result
    }

    /// Cancel the running program and every routine it spawned.
    pub fn abort(&self) {
        tracing::debug!("vm aborted");
        self.cancel.cancel();
    }

    /// Handle for aborting the VM from another thread.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn globals(&self) -> &[Value] {
        &self.globals
    }

    pub fn globals_mut(&mut self) -> &mut Vec<Value> {
        &mut self.globals
    }

    pub fn into_globals(self) -> Vec<Value> {
        self.globals
    }

    pub(crate) fn cancel(&self) -> &CancelToken {
        &self.cancel
    }

    /// Call `callee` with `args` and run it to completion.
    pub fn call(&mut self, callee: &Value, args: &[Value]) -> Result<Value, VmError> {
        let depth = self.frames.len();
        let sp = self.sp;
        let result = self.call_inner(callee, args, depth);
        result.map_err(|e| {
            let err = self.error_with_trace(e);
            self.frames.truncate(depth);
            self.restore_running_frame();
            self.clear_stack(sp);
            err
        })
    }

    fn call_inner(&mut self, callee: &Value, args: &[Value], depth: usize) -> Result<Value, RuntimeError> {
        match callee {
            Value::Function(func) => {
                self.push(callee.clone())?;
                for arg in args {
                    self.push(arg.clone())?;
                }
                self.call_compiled(func.clone(), args.len(), false)?;
                self.execute(depth)
            }
            other => self.call_native(other, args, &Kwargs::new()),
        }
    }

    // ---
    // Stack operations
    // ---

    fn push(&mut self, value: Value) -> Result<(), RuntimeError> {
        if self.sp >= self.stack.len() {
            return Err(RuntimeError::StackOverflow);
        }
        self.stack[self.sp] = value;
        self.sp += 1;
        Ok(())
    }

    fn pop(&mut self) -> Result<Value, RuntimeError> {
        if self.sp == 0 {
            return Err(RuntimeError::StackUnderflow);
        }
        self.sp -= 1;
        Ok(std::mem::take(&mut self.stack[self.sp]))
    }

    fn top(&self) -> Result<&Value, RuntimeError> {
        self.sp
            .checked_sub(1)
            .map(|i| &self.stack[i])
            .ok_or(RuntimeError::StackUnderflow)
    }

    /// Pop the top `n` values, oldest first.
    fn pop_n(&mut self, n: usize) -> Result<Vec<Value>, RuntimeError> {
        if n > self.sp {
            return Err(RuntimeError::StackUnderflow);
        }
        let start = self.sp - n;
        let values = self.stack[start..self.sp]
            .iter_mut()
            .map(std::mem::take)
            .collect();
        self.sp = start;
        Ok(values)
    }

    /// Drop everything at and above `sp`.
    fn clear_stack(&mut self, sp: usize) {
        let end = self.sp.min(self.stack.len());
        for slot in self.stack.iter_mut().take(end).skip(sp) {
            *slot = Value::Undefined;
        }
        self.sp = sp;
    }

    fn alloc(&self) -> Result<(), RuntimeError> {
        self.charge(1)
    }

    /// Draw `n` allocations from the budget.
    pub(crate) fn charge(&self, n: usize) -> Result<(), RuntimeError> {
        let Some(left) = &self.allocs else {
            return Ok(());
        };
        let n = i64::try_from(n).unwrap_or(i64::MAX);
        let before = left
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| Some(v.saturating_sub(n)))
            .unwrap_or_else(|v| v);
        if before <= n {
            return Err(RuntimeError::AllocationLimitExceeded);
        }
        Ok(())
    }

    // ---
    // Instruction decoding
    // ---

    fn read_u8(&mut self) -> usize {
        let v = self.code[self.ip] as usize;
        self.ip += 1;
        v
    }

    fn read_u16(&mut self) -> usize {
        let v = u16::from_le_bytes([self.code[self.ip], self.code[self.ip + 1]]) as usize;
        self.ip += 2;
        v
    }

    fn read_u32(&mut self) -> usize {
        let bytes = [
            self.code[self.ip],
            self.code[self.ip + 1],
            self.code[self.ip + 2],
            self.code[self.ip + 3],
        ];
        self.ip += 4;
        u32::from_le_bytes(bytes) as usize
    }

    fn constant(&self, idx: usize) -> Result<Value, RuntimeError> {
        self.constants
            .get(idx)
            .cloned()
            .ok_or_else(|| RuntimeError::Custom(format!("invalid constant index: {}", idx)))
    }

    fn global(&self, idx: usize) -> Value {
        self.globals.get(idx).cloned().unwrap_or_default()
    }

    fn set_global(&mut self, idx: usize, value: Value) {
        if idx >= self.globals.len() {
            self.globals.resize(idx + 1, Value::Undefined);
        }
        self.globals[idx] = value;
    }

    fn free_cell(&self, idx: usize) -> Result<FreeCell, RuntimeError> {
        self.func
            .free
            .get(idx)
            .cloned()
            .ok_or_else(|| RuntimeError::Custom(format!("invalid free variable index: {}", idx)))
    }

    // ---
    // Main execution loop
    // ---

    /// Run until the frame count drops back to `stop_depth` or the main
    /// function suspends.
    fn execute(&mut self, stop_depth: usize) -> Result<Value, RuntimeError> {
        loop {
            if self.cancel.is_cancelled() {
                return Err(RuntimeError::Aborted);
            }
            let Some(&byte) = self.code.get(self.ip) else {
                return Err(RuntimeError::Custom("instruction pointer out of range".into()));
            };
            let op = OpCode::try_from(byte).map_err(RuntimeError::InvalidOpcode)?;
            self.ip += 1;

            match op {
                OpCode::Constant => {
                    let idx = self.read_u16();
                    let value = self.constant(idx)?;
                    self.push(value)?;
                }
                OpCode::Null => self.push(Value::Undefined)?,
                OpCode::True => self.push(Value::Bool(true))?,
                OpCode::False => self.push(Value::Bool(false))?,
                OpCode::Pop => {
                    self.pop()?;
                }

                OpCode::BinaryOp => {
                    let operator = self.read_u8();
                    let operator = Operator::from_u8(operator as u8)
                        .ok_or(RuntimeError::InvalidOpcode(operator as u8))?;
                    let right = self.pop()?;
                    let left = self.pop()?;
                    let result = left.binary_op(operator, &right)?;
                    self.alloc()?;
                    self.push(result)?;
                }
                OpCode::Equal | OpCode::NotEqual => {
                    let right = self.pop()?;
                    let left = self.pop()?;
                    let equal = left == right;
                    self.push(Value::Bool(if op == OpCode::Equal { equal } else { !equal }))?;
                }
                OpCode::Minus => {
                    let value = self.pop()?.negate()?;
                    self.alloc()?;
                    self.push(value)?;
                }
                OpCode::LNot => {
                    let value = self.pop()?;
                    self.push(Value::Bool(value.is_falsy()))?;
                }
                OpCode::BComplement => {
                    let value = self.pop()?.complement()?;
                    self.alloc()?;
                    self.push(value)?;
                }

                OpCode::Jump => {
                    self.ip = self.read_u32();
                }
                OpCode::JumpFalsy => {
                    let target = self.read_u32();
                    if self.pop()?.is_falsy() {
                        self.ip = target;
                    }
                }
                OpCode::AndJump => {
                    let target = self.read_u32();
                    if self.top()?.is_falsy() {
                        self.ip = target;
                    } else {
                        self.pop()?;
                    }
                }
                OpCode::OrJump => {
                    let target = self.read_u32();
                    if self.top()?.is_truthy() {
                        self.ip = target;
                    } else {
                        self.pop()?;
                    }
                }

                OpCode::GetGlobal => {
                    let idx = self.read_u16();
                    let value = self.global(idx);
                    self.push(value)?;
                }
                OpCode::SetGlobal => {
                    let idx = self.read_u16();
                    let value = self.pop()?;
                    self.set_global(idx, value);
                }
                OpCode::SetSelGlobal => {
                    let idx = self.read_u16();
                    let num_sel = self.read_u8();
                    let target = self.global(idx);
                    self.assign_selectors(target, num_sel)?;
                }

                OpCode::GetLocal => {
                    let idx = self.read_u8();
                    let value = self.stack[self.base + idx].clone().deref_cell();
                    self.push(value)?;
                }
                OpCode::SetLocal => {
                    let idx = self.read_u8();
                    let value = self.pop()?;
                    let slot = self.base + idx;
                    if let Value::Cell(cell) = &self.stack[slot] {
                        cell.set(value);
                    } else {
                        self.stack[slot] = value;
                    }
                }
                OpCode::DefineLocal => {
                    let idx = self.read_u8();
                    let value = self.pop()?;
                    self.stack[self.base + idx] = value;
                }
                OpCode::SetSelLocal => {
                    let idx = self.read_u8();
                    let num_sel = self.read_u8();
                    let target = self.stack[self.base + idx].clone().deref_cell();
                    self.assign_selectors(target, num_sel)?;
                }
                OpCode::GetLocalPtr => {
                    let idx = self.read_u8();
                    let slot = &mut self.stack[self.base + idx];
                    let cell = match slot {
                        Value::Cell(cell) => cell.clone(),
                        other => {
                            let cell = FreeCell::new(std::mem::take(other));
                            *other = Value::Cell(cell.clone());
                            cell
                        }
                    };
                    self.push(Value::Cell(cell))?;
                }

                OpCode::GetFree => {
                    let idx = self.read_u8();
                    let value = self.free_cell(idx)?.get();
                    self.push(value)?;
                }
                OpCode::SetFree => {
                    let idx = self.read_u8();
                    let value = self.pop()?;
                    self.free_cell(idx)?.set(value);
                }
                OpCode::SetSelFree => {
                    let idx = self.read_u8();
                    let num_sel = self.read_u8();
                    let target = self.free_cell(idx)?.get();
                    self.assign_selectors(target, num_sel)?;
                }
                OpCode::GetFreePtr => {
                    let idx = self.read_u8();
                    let cell = self.free_cell(idx)?;
                    self.push(Value::Cell(cell))?;
                }

                OpCode::GetBuiltin => {
                    let idx = self.read_u8();
                    let builtin = Builtin::from_index(idx as u8)
                        .ok_or_else(|| RuntimeError::Custom(format!("invalid builtin index: {}", idx)))?;
                    self.push(Value::Builtin(builtin))?;
                }

                OpCode::Array => {
                    let n = self.read_u16();
                    let items = self.pop_n(n)?;
                    self.alloc()?;
                    self.push(Value::array(items))?;
                }
                OpCode::Map => {
                    let n = self.read_u16();
                    let items = self.pop_n(n)?;
                    let mut entries = IndexMap::with_capacity(n / 2);
                    let mut items = items.into_iter();
                    while let (Some(key), Some(value)) = (items.next(), items.next()) {
                        match key {
                            Value::String(key) => {
                                entries.insert(key.to_string(), value);
                            }
                            other => return Err(RuntimeError::InvalidIndexType(other.type_name())),
                        }
                    }
                    self.alloc()?;
                    self.push(Value::map(entries))?;
                }
                OpCode::Error => {
                    let value = self.pop()?;
                    self.alloc()?;
                    self.push(Value::error(value))?;
                }
                OpCode::Immutable => {
                    let value = self.pop()?.immutable();
                    self.alloc()?;
                    self.push(value)?;
                }
                OpCode::Index => {
                    let index = self.pop()?;
                    let left = self.pop()?;
                    let value = left.index_get(&index)?;
                    self.push(value)?;
                }
                OpCode::SliceIndex => {
                    let high = self.pop()?;
                    let low = self.pop()?;
                    let left = self.pop()?;
                    let value = left.slice(&low, &high)?;
                    self.alloc()?;
                    self.push(value)?;
                }

                OpCode::Call => {
                    let num_args = self.read_u8();
                    let flags = self.read_u8() as u8;
                    self.execute_call(num_args, flags)?;
                }
                OpCode::Return => {
                    let has_value = self.read_u8() == 1;
                    let value = if has_value { self.pop()? } else { Value::Undefined };
                    let frame = self.frames.pop().ok_or(RuntimeError::StackUnderflow)?;
                    let value = if frame.discard_result { Value::Undefined } else { value };
                    self.clear_stack(frame.base.saturating_sub(1));
                    if self.frames.len() <= stop_depth {
                        self.restore_running_frame();
                        return Ok(value);
                    }
                    self.restore_running_frame();
                    self.push(value)?;
                }
                OpCode::Closure => {
                    let idx = self.read_u16();
                    let num_free = self.read_u8();
                    let Value::Function(func) = self.constant(idx)? else {
                        return Err(RuntimeError::Custom(format!("not a function constant: {}", idx)));
                    };
                    let free = self
                        .pop_n(num_free)?
                        .into_iter()
                        .map(|value| match value {
                            Value::Cell(cell) => cell,
                            other => FreeCell::new(other),
                        })
                        .collect();
                    self.alloc()?;
                    self.push(Value::Function(Arc::new(func.with_free(free))))?;
                }

                OpCode::IteratorInit => {
                    let value = self.pop()?.deref_cell();
                    let iter = ValueIterator::new(&value)?;
                    self.alloc()?;
                    self.push(Value::Iterator(Arc::new(Mutex::new(iter))))?;
                }
                OpCode::IteratorNext | OpCode::IteratorKey | OpCode::IteratorValue => {
                    let Value::Iterator(iter) = self.pop()? else {
                        return Err(RuntimeError::Custom("iterator expected".into()));
                    };
                    let value = {
                        let mut it = iter.lock();
                        match op {
                            OpCode::IteratorNext => Value::Bool(it.next()),
                            OpCode::IteratorKey => it.key(),
                            _ => it.value(),
                        }
                    };
                    self.push(value)?;
                }

                OpCode::Suspend => return Ok(Value::Undefined),
            }
        }
    }

    /// `target[s0][s1]...[sn] = value`, with the selectors and the value on
    /// the stack.
    fn assign_selectors(&mut self, target: Value, num_sel: usize) -> Result<(), RuntimeError> {
        let selectors = self.pop_n(num_sel)?;
        let value = self.pop()?;
        let Some((last, path)) = selectors.split_last() else {
            return Ok(());
        };
        let mut dst = target;
        for sel in path {
            dst = dst.index_get(sel)?;
        }
        dst.index_set(last, value)
    }

    // ---
    // Calls
    // ---

    fn execute_call(&mut self, num_args: usize, flags: u8) -> Result<(), RuntimeError> {
        let mut num_args = num_args;
        let mut kwargs = Kwargs::new();
        if flags & CALL_SPREAD_KWARGS != 0 {
            let spread = self.pop()?;
            merge_kwargs(&mut kwargs, spread)?;
        }
        if flags & CALL_KWARGS != 0 {
            let explicit = self.pop()?;
            let mut named = Kwargs::new();
            merge_kwargs(&mut named, explicit)?;
            kwargs.extend(named);
        }
        if flags & CALL_SPREAD_ARGS != 0 {
            let spread = self.pop()?;
            let items = match &spread {
                Value::Array(items) | Value::ImmutableArray(items) => items.read().clone(),
                other => {
                    return Err(RuntimeError::InvalidArgumentType {
                        name: "spread".into(),
                        expected: "array",
                        found: other.type_name(),
                    })
                }
            };
            num_args = num_args - 1 + items.len();
            for item in items {
                self.push(item)?;
            }
        }

        let callee_slot = self
            .sp
            .checked_sub(num_args + 1)
            .ok_or(RuntimeError::StackUnderflow)?;
        let callee = self.stack[callee_slot].clone();
        match &callee {
            Value::Function(func) => {
                if !kwargs.is_empty() {
                    return Err(RuntimeError::UnexpectedKeywordArguments);
                }
                self.call_compiled(func.clone(), num_args, true)
            }
            other => {
                let args = self.pop_n(num_args)?;
                self.pop()?;
                let result = self.call_native(other, &args, &kwargs)?;
                self.push(result)
            }
        }
    }

    fn call_native(&mut self, callee: &Value, args: &[Value], kwargs: &Kwargs) -> Result<Value, RuntimeError> {
        let result = match callee {
            Value::Builtin(builtin) => builtins::call(self, *builtin, args, kwargs),
            Value::Host(host) => host.call(args, kwargs),
            Value::Method(method) => {
                if !kwargs.is_empty() {
                    return Err(RuntimeError::UnexpectedKeywordArguments);
                }
                method.call(args, &self.cancel)
            }
            other => Err(RuntimeError::NotCallable(other.type_name())),
        }?;
        self.alloc()?;
        Ok(result)
    }

    /// Check arity and roll surplus arguments of a var-args function into
    /// an array. Returns the argument count left on the stack.
    fn pack_args(&mut self, func: &CompiledFunction, num_args: usize) -> Result<usize, RuntimeError> {
        if func.var_args {
            let fixed = func.num_parameters.saturating_sub(1);
            if num_args < fixed {
                return Err(RuntimeError::WrongNumArgumentsVariadic {
                    want: fixed,
                    got: num_args,
                });
            }
            let rest = self.pop_n(num_args - fixed)?;
            self.push(Value::array(rest))?;
            Ok(fixed + 1)
        } else if num_args != func.num_parameters {
            Err(RuntimeError::WrongNumArguments {
                want: func.num_parameters,
                got: num_args,
            })
        } else {
            Ok(num_args)
        }
    }

    /// What the instruction after the current call does with its result:
    /// `Some(false)` returns it, `Some(true)` discards it, `None` uses it.
    fn tail_position(&self) -> Option<bool> {
        let next = |offset: usize| self.code.get(self.ip + offset).copied();
        let ret = OpCode::Return as u8;
        match next(0)? {
            b if b == ret => Some(next(1) == Some(0)),
            b if b == OpCode::Pop as u8 && next(1) == Some(ret) => Some(true),
            _ => None,
        }
    }

    fn call_compiled(
        &mut self,
        func: Arc<CompiledFunction>,
        num_args: usize,
        allow_tail: bool,
    ) -> Result<(), RuntimeError> {
        let num_args = self.pack_args(&func, num_args)?;

        if allow_tail && Arc::ptr_eq(&func, &self.func) {
            if let Some(discard) = self.tail_position() {
                let base = self.base;
                let args = self.pop_n(num_args)?;
                self.clear_stack(base);
                for arg in args {
                    self.push(arg)?;
                }
                self.reserve_locals(base, func.num_locals)?;
                self.ip = 0;
                if let Some(frame) = self.frames.last_mut() {
                    frame.discard_result |= discard;
                }
                tracing::trace!(discard, "tail call folded");
                return Ok(());
            }
        }

        if self.frames.len() >= self.config.max_frames {
            return Err(RuntimeError::StackOverflow);
        }
        let base = self.sp - num_args;
        self.reserve_locals(base, func.num_locals)?;
        if let Some(caller) = self.frames.last_mut() {
            caller.ip = self.ip;
        }
        self.frames.push(Frame {
            func: func.clone(),
            ip: 0,
            base,
            discard_result: false,
        });
        self.code = func.instructions.clone();
        self.func = func;
        self.ip = 0;
        self.base = base;
        Ok(())
    }

    /// Grow the stack pointer to cover the frame's locals.
    fn reserve_locals(&mut self, base: usize, num_locals: usize) -> Result<(), RuntimeError> {
        let top = base + num_locals.max(self.sp - base);
        if top > self.stack.len() {
            return Err(RuntimeError::StackOverflow);
        }
        for slot in &mut self.stack[self.sp..top] {
            *slot = Value::Undefined;
        }
        self.sp = top;
        Ok(())
    }

    fn restore_running_frame(&mut self) {
        if let Some(frame) = self.frames.last() {
            self.func = frame.func.clone();
            self.code = frame.func.instructions.clone();
            self.ip = frame.ip;
            self.base = frame.base;
        }
    }

    // ---
    // Errors
    // ---

    fn error_with_trace(&self, error: RuntimeError) -> VmError {
        let mut trace = Vec::with_capacity(self.frames.len());
        let mut running = Some((&self.func, self.ip));
        for frame in self.frames.iter().rev() {
            let (func, ip) = running.take().unwrap_or((&frame.func, frame.ip));
            if let Some(span) = func.source_pos(ip.saturating_sub(1)) {
                trace.push(self.file_set.position(span));
            }
        }
        VmError { error, trace }
    }

    // ---
    // Concurrency
    // ---

    /// Start `callee(args...)` on a new thread with its own VM.
    pub(crate) fn spawn(&self, callee: Value, args: Vec<Value>) -> Result<Value, RuntimeError> {
        if !callee.is_callable() {
            return Err(RuntimeError::InvalidArgumentType {
                name: "first".into(),
                expected: "callable",
                found: callee.type_name(),
            });
        }
        let token = self.cancel.child();
        let routine = Arc::new(Routine::new(token.clone()));
        let mut vm = self.fork(token);
        let handle = routine.clone();
        std::thread::Builder::new()
            .name("skiff-routine".into())
            .spawn(move || {
                tracing::debug!("routine started");
                let result = vm.call(&callee, &args).map_err(|e| e.error.to_string());
                if let Err(message) = &result {
                    tracing::debug!(error = %message, "routine failed");
                } else {
                    tracing::debug!("routine finished");
                }
                handle.finish(result);
            })
            .map_err(|e| RuntimeError::Custom(format!("failed to spawn routine: {}", e)))?;
        Ok(Value::Routine(routine))
    }
}

fn budget(max_allocs: i64) -> Option<Arc<AtomicI64>> {
    (max_allocs >= 0).then(|| Arc::new(AtomicI64::new(max_allocs.saturating_add(1))))
}

fn merge_kwargs(into: &mut Kwargs, value: Value) -> Result<(), RuntimeError> {
    match value {
        Value::Map(map) | Value::ImmutableMap(map) => {
            for (k, v) in map.read().iter() {
                into.insert(k.clone(), v.clone());
            }
            Ok(())
        }
        other => Err(RuntimeError::InvalidArgumentType {
            name: "kwargs".into(),
            expected: "map",
            found: other.type_name(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skiff_compiler::Compiler;
    use skiff_parser::parse;

    fn compile(source: &str) -> Bytecode {
        let file = parse(source, 0).expect("parse errors");
        let mut files = SourceFileSet::new();
        files.add_file("test", source);
        let mut compiler = Compiler::new(files);
        compiler.compile(&file).expect("compile error");
        compiler.bytecode()
    }

    /// Run `source` and return global 0, the first variable it defines.
    fn run(source: &str) -> Result<Value, VmError> {
        let mut vm = Vm::new(compile(source), None, -1);
        vm.run()?;
        Ok(vm.globals()[0].clone())
    }

    fn run_ok(source: &str) -> Value {
        run(source).unwrap_or_else(|e| panic!("{}", e))
    }

    fn run_err(source: &str) -> String {
        run(source).expect_err("expected a runtime error").error.to_string()
    }

    #[test]
    fn test_arithmetic() {
        assert_eq!(run_ok("out := 1 + 2 * 3"), Value::Int(7));
        assert_eq!(run_ok("out := 7 / 2"), Value::Int(3));
        assert_eq!(run_ok("out := 1.5 + 1"), Value::Float(2.5));
        assert_eq!(run_ok("out := \"a\" + 1"), Value::from("a1"));
        assert_eq!(run_ok("out := -(3)"), Value::Int(-3));
        assert_eq!(run_ok("out := ^0"), Value::Int(-1));
        assert_eq!(run_ok("out := !0"), Value::Bool(true));
    }

    #[test]
    fn test_short_circuit_and_conditional() {
        assert_eq!(run_ok("out := 0 || \"x\""), Value::from("x"));
        assert_eq!(run_ok("out := 0 && 1 / 0"), Value::Int(0));
        assert_eq!(run_ok("out := 1 > 2 ? \"a\" : \"b\""), Value::from("b"));
    }

    #[test]
    fn test_loops() {
        assert_eq!(
            run_ok("out := 0\nfor i := 0; i < 10; i++ { if i == 5 { continue }; if i == 8 { break }; out += i }"),
            Value::Int(1 + 2 + 3 + 4 + 6 + 7)
        );
        assert_eq!(
            run_ok("out := 0\nfor k, v in [10, 20, 30] { out += k * v }"),
            Value::Int(20 + 60)
        );
        assert_eq!(
            run_ok("out := \"\"\nfor k, v in {a: 1, b: 2} { out += k + string(v) }"),
            Value::from("a1b2")
        );
    }

    #[test]
    fn test_functions_and_varargs() {
        assert_eq!(run_ok("out := func(a, b) { return a - b }(5, 3)"), Value::Int(2));
        assert_eq!(
            run_ok("out := func(a, rest...) { return len(rest) }(1, 2, 3)"),
            Value::Int(2)
        );
        assert_eq!(
            run_ok("out := func(rest...) { return rest }()"),
            Value::array(vec![])
        );
    }

    #[test]
    fn test_spread_call() {
        let mut vm = Vm::new(
            compile("f := func(a, b, c) { return a + b + c }\nout := f([1, 2, 3]...)"),
            None,
            -1,
        );
        vm.run().unwrap();
        assert_eq!(vm.globals()[1], Value::Int(6));
    }

    #[test]
    fn test_wrong_arity() {
        assert_eq!(
            run_err("f := func(a) { return a }\nf(1, 2)"),
            "wrong number of arguments: want=1, got=2"
        );
        assert_eq!(
            run_err("f := func(a, b, c...) { return a }\nf(1)"),
            "wrong number of arguments: want>=2, got=1"
        );
    }

    #[test]
    fn test_keyword_arguments_rejected_by_compiled_functions() {
        assert_eq!(
            run_err("f := func(a) { return a }\nf(1, x=2)"),
            "function does not accept keyword arguments"
        );
    }

    #[test]
    fn test_closures_share_cells() {
        let source = "
counter := func() {
    n := 0
    return {inc: func() { n += 1; return n }, get: func() { return n }}
}
c := counter()
c.inc()
c.inc()
out := c.get()
";
        let mut vm = Vm::new(compile(source), None, -1);
        vm.run().unwrap();
        assert_eq!(vm.globals()[2], Value::Int(2));
    }

    #[test]
    fn test_local_recursion() {
        let source = "
out := func() {
    fib := func(n) { return n < 2 ? n : fib(n - 1) + fib(n - 2) }
    return fib(15)
}()
";
        assert_eq!(run_ok(source), Value::Int(610));
    }

    #[test]
    fn test_tail_call_reuses_frame() {
        let source = "
sum := func(n, acc) {
    if n == 0 { return acc }
    return sum(n - 1, acc + n)
}
out := sum(100000, 0)
";
        let mut vm = Vm::new(compile(source), None, -1);
        vm.run().unwrap();
        assert_eq!(vm.globals()[1], Value::Int(5_000_050_000));
    }

    #[test]
    fn test_discarded_tail_call_returns_undefined() {
        let source = "
f := func(n) {
    if n == 0 { return 42 }
    f(n - 1)
}
out := f(3)
";
        let mut vm = Vm::new(compile(source), None, -1);
        vm.run().unwrap();
        assert_eq!(vm.globals()[1], Value::Undefined);
    }

    #[test]
    fn test_deep_non_tail_recursion_overflows() {
        let err = run("f := func(n) { return n == 0 ? 0 : 1 + f(n - 1) }\nf(100000)").unwrap_err();
        assert_eq!(err.error, RuntimeError::StackOverflow);
    }

    #[test]
    fn test_selector_assignment() {
        assert_eq!(
            run_ok("m := {a: {b: [1, 2]}}\nm.a.b[1] = 5\nm = m.a.b[1]"),
            Value::Int(5)
        );
        assert_eq!(
            run_err("a := [1]\na[3] = 1"),
            "index out of bounds"
        );
    }

    #[test]
    fn test_reference_semantics() {
        assert_eq!(run_ok("a := [1]\nb := a\nb[0] = 9\na = a[0]"), Value::Int(9));
        assert_eq!(run_ok("a := [1]\nb := copy(a)\nb[0] = 9\na = a[0]"), Value::Int(1));
    }

    #[test]
    fn test_immutable() {
        assert_eq!(
            run_err("a := immutable([1, 2])\na[0] = 3"),
            "not index-assignable: immutable-array"
        );
        assert_eq!(
            run_ok("a := immutable({x: [1]})\na.x[0] = 7\na = a.x[0]"),
            Value::Int(7)
        );
    }

    #[test]
    fn test_error_values() {
        assert_eq!(run_ok("e := error(\"boom\")\ne = e.value"), Value::from("boom"));
        assert_eq!(run_ok("out := is_error(error(1))"), Value::Bool(true));
    }

    #[test]
    fn test_alloc_budget() {
        let mut vm = Vm::new(compile("a := 0\nfor i := 0; i < 100; i++ { a = [i] }"), None, 10);
        let err = vm.run().unwrap_err();
        assert_eq!(err.error, RuntimeError::AllocationLimitExceeded);

        let mut vm = Vm::new(compile("a := 1 + 1"), None, 10);
        vm.run().unwrap();
    }

    #[test]
    fn test_alloc_budget_boundary() {
        let bytecode = compile("a := [1]\nb := [2]\nc := 1 + 2");
        let mut vm = Vm::new(bytecode.clone(), None, 3);
        vm.run().unwrap();
        // A rerun starts from a fresh budget.
        vm.run().unwrap();

        let mut vm = Vm::new(bytecode, None, 2);
        assert_eq!(vm.run().unwrap_err().error, RuntimeError::AllocationLimitExceeded);
    }

    #[test]
    fn test_error_trace() {
        let source = "f := func() {\n  return 1 / 0\n}\nf()";
        let err = run(source).unwrap_err();
        assert_eq!(err.error, RuntimeError::DivisionByZero);
        assert_eq!(
            err.to_string(),
            "Runtime Error: division by zero\n\tat test:2:10\n\tat test:4:1"
        );
        let source = std::error::Error::source(&err).map(|e| e.to_string());
        assert_eq!(source.as_deref(), Some("division by zero"));
    }

    #[test]
    fn test_globals_carry_over() {
        let mut vm = Vm::new(compile("a := 40"), None, -1);
        vm.run().unwrap();
        let globals = vm.into_globals();
        let mut vm = Vm::new(compile("a := 0\na += 2"), Some(globals), -1);
        vm.run().unwrap();
        assert_eq!(vm.globals()[0], Value::Int(2));
    }

    #[test]
    fn test_host_call() {
        let mut vm = Vm::new(compile("double := func(x) { return x * 2 }"), None, -1);
        vm.run().unwrap();
        let f = vm.globals()[0].clone();
        assert_eq!(vm.call(&f, &[Value::Int(21)]).unwrap(), Value::Int(42));
        assert_eq!(vm.call(&f, &[Value::Int(1)]).unwrap(), Value::Int(2));
    }

    #[test]
    fn test_abort_before_run() {
        let mut vm = Vm::new(compile("for {}"), None, -1);
        let token = CancelToken::new();
        token.cancel();
        let err = vm.run_with_cancel(&token).unwrap_err();
        assert_eq!(err.error, RuntimeError::Aborted);
    }
}
