use std::path::{Path, PathBuf};
use std::sync::Arc;

use skiff_lexer::{SourceFileSet, Span};
use skiff_object::{CompiledFunction, Operator, SourceMap, Value, MAX_STRING_LEN};
use skiff_parser::ast::*;
use skiff_parser::parse;

use crate::bytecode::Bytecode;
use crate::modules::{CompilationContext, CompilerOptions, Module, ModuleMap};
use crate::opcode::{
    make_instruction, patch_u32, OpCode, CALL_KWARGS, CALL_SPREAD_ARGS, CALL_SPREAD_KWARGS,
};
use crate::optimizer::optimize_func;
use crate::symbol_table::{Symbol, SymbolId, SymbolScope, SymbolTable};

/// Compilation errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CompileErrorKind {
    #[error("unresolved reference '{0}'")]
    UnresolvedReference(Arc<str>),
    #[error("'{0}' redeclared in this block")]
    Redeclared(Arc<str>),
    #[error("cannot assign to builtin '{0}'")]
    AssignToBuiltin(Arc<str>),
    #[error("operator ':=' not allowed with selector")]
    DefineWithSelector,
    #[error("invalid assignment target")]
    InvalidAssignTarget,
    #[error("break not allowed outside loop")]
    BreakOutsideLoop,
    #[error("continue not allowed outside loop")]
    ContinueOutsideLoop,
    #[error("return not allowed outside function")]
    ReturnOutsideFunction,
    #[error("export not allowed inside function")]
    ExportInsideFunction,
    #[error("export not allowed outside module")]
    ExportOutsideModule,
    #[error("empty module name")]
    EmptyModuleName,
    #[error("module '{0}' not found")]
    ModuleNotFound(String),
    #[error("module file read error: {0}")]
    ModuleFileRead(String),
    #[error("cyclic module import: {0}")]
    CyclicImport(String),
    #[error("in module '{module}': {message}")]
    ModuleParse { module: String, message: String },
    #[error("exceeding string size limit")]
    StringLimit,
    #[error("too many constants")]
    TooManyConstants,
    #[error("too many global variables")]
    TooManyGlobals,
    #[error("too many local variables")]
    TooManyLocals,
    #[error("too many free variables")]
    TooManyFreeVariables,
    #[error("too many arguments")]
    TooManyArguments,
    #[error("too many elements")]
    TooManyElements,
}

/// A compilation error and where it happened.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{kind}")]
pub struct CompileError {
    pub kind: CompileErrorKind,
    pub span: Span,
}

impl CompileError {
    pub fn new(kind: CompileErrorKind, span: Span) -> Self {
        Self { kind, span }
    }

    /// `Compile Error: <message>` followed by the resolved position.
    pub fn render(&self, files: &SourceFileSet) -> String {
        format!("Compile Error: {}\n\tat {}", self.kind, files.position(self.span))
    }
}

type Result<T> = std::result::Result<T, CompileError>;

/// Jump positions waiting for the end of a loop.
#[derive(Debug, Default)]
struct Loop {
    breaks: Vec<usize>,
    continues: Vec<usize>,
}

/// Instruction buffer of one function being compiled.
#[derive(Debug, Default)]
struct CompilationScope {
    instructions: Vec<u8>,
    source_map: SourceMap,
    loops: Vec<Loop>,
}

/// Left-hand side element of an assignment after the variable name.
enum Selector<'a> {
    Index(&'a Expr),
    Field(&'a Identifier),
}

/// The Skiff compiler.
///
/// One compiler handles one source file. Imported modules are compiled by a
/// child compiler that borrows this one's constant pool, file set and
/// module cache for the duration of the import.
pub struct Compiler {
    file_set: SourceFileSet,
    constants: Vec<Value>,
    symbol_table: SymbolTable,
    scopes: Vec<CompilationScope>,
    module_map: Arc<ModuleMap>,
    options: CompilerOptions,
    context: CompilationContext,
    /// Path of the module being compiled, `None` for the main file.
    module: Option<String>,
}

impl Compiler {
    /// A compiler for the main file, with every builtin in scope.
    pub fn new(file_set: SourceFileSet) -> Self {
        Self {
            file_set,
            constants: Vec::new(),
            symbol_table: SymbolTable::with_builtins(),
            scopes: vec![CompilationScope::default()],
            module_map: Arc::new(ModuleMap::new()),
            options: CompilerOptions::default(),
            context: CompilationContext::default(),
            module: None,
        }
    }

    /// Continue from an existing symbol table, e.g. across REPL lines.
    pub fn with_symbol_table(mut self, symbol_table: SymbolTable) -> Self {
        self.symbol_table = symbol_table;
        self
    }

    /// Continue from an existing constant pool.
    pub fn with_constants(mut self, constants: Vec<Value>) -> Self {
        self.constants = constants;
        self
    }

    pub fn with_module_map(mut self, module_map: ModuleMap) -> Self {
        self.module_map = Arc::new(module_map);
        self
    }

    pub fn with_options(mut self, options: CompilerOptions) -> Self {
        self.options = options;
        self
    }

    pub fn compile(&mut self, file: &File) -> Result<()> {
        for stmt in &file.stmts {
            self.compile_stmt(stmt)?;
        }
        Ok(())
    }

    /// Every file seen so far, including imported modules.
    pub fn file_set(&self) -> &SourceFileSet {
        &self.file_set
    }

    pub fn bytecode(self) -> Bytecode {
        self.into_parts().0
    }

    /// The compiled program and the symbol table it was compiled against.
    pub fn into_parts(mut self) -> (Bytecode, SymbolTable) {
        let main = std::mem::take(&mut self.scopes[0]);
        let mut instructions = main.instructions;
        instructions.extend(make_instruction(OpCode::Suspend, &[]));
        let main_function = CompiledFunction::new(instructions, 0, 0, false, main.source_map);
        let bytecode = Bytecode {
            file_set: self.file_set,
            main_function: Arc::new(main_function),
            constants: self.constants,
        };
        (bytecode, self.symbol_table)
    }

    // ---
    // Emission
    // ---

    fn scope_mut(&mut self) -> &mut CompilationScope {
        let last = self.scopes.len() - 1;
        &mut self.scopes[last]
    }

    fn current_pos(&self) -> usize {
        self.scopes[self.scopes.len() - 1].instructions.len()
    }

    fn emit(&mut self, span: Span, op: OpCode, operands: &[usize]) -> usize {
        let ins = make_instruction(op, operands);
        let scope = self.scope_mut();
        let pos = scope.instructions.len();
        scope.instructions.extend_from_slice(&ins);
        scope.source_map.insert(pos, span);
        pos
    }

    /// Point the jump at `pos` to `target`.
    fn change_operand(&mut self, pos: usize, target: usize) {
        patch_u32(&mut self.scope_mut().instructions, pos + 1, target);
    }

    fn add_constant(&mut self, span: Span, value: Value) -> Result<usize> {
        if self.constants.len() > u16::MAX as usize {
            return Err(CompileError::new(CompileErrorKind::TooManyConstants, span));
        }
        self.constants.push(value);
        Ok(self.constants.len() - 1)
    }

    fn emit_constant(&mut self, span: Span, value: Value) -> Result<()> {
        let idx = self.add_constant(span, value)?;
        self.emit(span, OpCode::Constant, &[idx]);
        Ok(())
    }

    fn enter_scope(&mut self) {
        self.scopes.push(CompilationScope::default());
        self.symbol_table.fork(false);
    }

    fn leave_scope(&mut self) -> CompilationScope {
        self.symbol_table.unfork();
        self.scopes.pop().unwrap_or_default()
    }

    fn enter_loop(&mut self) {
        self.scope_mut().loops.push(Loop::default());
    }

    fn leave_loop(&mut self) -> Loop {
        self.scope_mut().loops.pop().unwrap_or_default()
    }

    fn check_operand(&self, span: Span, symbol: &Symbol) -> Result<()> {
        let (limit, kind) = match symbol.scope {
            SymbolScope::Global => (u16::MAX as usize, CompileErrorKind::TooManyGlobals),
            SymbolScope::Local => (u8::MAX as usize, CompileErrorKind::TooManyLocals),
            SymbolScope::Free => (u8::MAX as usize, CompileErrorKind::TooManyFreeVariables),
            SymbolScope::Builtin => return Ok(()),
        };
        if symbol.index > limit {
            return Err(CompileError::new(kind, span));
        }
        Ok(())
    }

    // ---
    // Statements
    // ---

    fn compile_stmt(&mut self, stmt: &Stmt) -> Result<()> {
        let span = stmt.span;
        match &stmt.kind {
            StmtKind::Expr(expr) => {
                self.compile_expr(expr)?;
                self.emit(span, OpCode::Pop, &[]);
            }
            StmtKind::Assign { target, op, value } => {
                self.compile_assign(span, target, value, *op)?;
            }
            StmtKind::IncDec { target, increment } => {
                let one = Expr::new(ExprKind::Literal(Literal::Int(1)), span);
                let op = if *increment { BinaryOp::Add } else { BinaryOp::Sub };
                self.compile_assign(span, target, &one, AssignOp::Compound(op))?;
            }
            StmtKind::Block(block) => self.compile_block(block)?,
            StmtKind::If {
                init,
                cond,
                then_branch,
                else_branch,
            } => {
                self.symbol_table.fork(true);
                let result = self.compile_if(span, init.as_deref(), cond, then_branch, else_branch.as_deref());
                self.symbol_table.unfork();
                result?;
            }
            StmtKind::For {
                init,
                cond,
                post,
                body,
            } => {
                self.symbol_table.fork(true);
                let result = self.compile_for(span, init.as_deref(), cond.as_ref(), post.as_deref(), body);
                self.symbol_table.unfork();
                result?;
            }
            StmtKind::ForIn {
                key,
                value,
                iterable,
                body,
            } => {
                self.symbol_table.fork(true);
                let result = self.compile_for_in(span, key, value, iterable, body);
                self.symbol_table.unfork();
                result?;
            }
            StmtKind::Return(value) => {
                if !self.symbol_table.in_function() {
                    return Err(CompileError::new(CompileErrorKind::ReturnOutsideFunction, span));
                }
                match value {
                    Some(value) => {
                        self.compile_expr(value)?;
                        self.emit(span, OpCode::Return, &[1]);
                    }
                    None => {
                        self.emit(span, OpCode::Return, &[0]);
                    }
                }
            }
            StmtKind::Export(value) => {
                if self.scopes.len() > 1 {
                    return Err(CompileError::new(CompileErrorKind::ExportInsideFunction, span));
                }
                if self.module.is_none() {
                    return Err(CompileError::new(CompileErrorKind::ExportOutsideModule, span));
                }
                self.compile_expr(value)?;
                self.emit(span, OpCode::Immutable, &[]);
                self.emit(span, OpCode::Return, &[1]);
            }
            StmtKind::Break => {
                let pos = self.emit(span, OpCode::Jump, &[0]);
                match self.scope_mut().loops.last_mut() {
                    Some(l) => l.breaks.push(pos),
                    None => return Err(CompileError::new(CompileErrorKind::BreakOutsideLoop, span)),
                }
            }
            StmtKind::Continue => {
                let pos = self.emit(span, OpCode::Jump, &[0]);
                match self.scope_mut().loops.last_mut() {
                    Some(l) => l.continues.push(pos),
                    None => {
                        return Err(CompileError::new(CompileErrorKind::ContinueOutsideLoop, span))
                    }
                }
            }
            StmtKind::Empty => {}
        }
        Ok(())
    }

    fn compile_block(&mut self, block: &Block) -> Result<()> {
        self.symbol_table.fork(true);
        let result = block.stmts.iter().try_for_each(|stmt| self.compile_stmt(stmt));
        self.symbol_table.unfork();
        result
    }

    fn compile_if(
        &mut self,
        span: Span,
        init: Option<&Stmt>,
        cond: &Expr,
        then_branch: &Block,
        else_branch: Option<&Stmt>,
    ) -> Result<()> {
        if let Some(init) = init {
            self.compile_stmt(init)?;
        }
        self.compile_expr(cond)?;
        let jump_falsy = self.emit(span, OpCode::JumpFalsy, &[0]);
        self.compile_block(then_branch)?;
        match else_branch {
            Some(else_branch) => {
                let jump_end = self.emit(span, OpCode::Jump, &[0]);
                let else_pos = self.current_pos();
                self.change_operand(jump_falsy, else_pos);
                self.compile_stmt(else_branch)?;
                let end = self.current_pos();
                self.change_operand(jump_end, end);
            }
            None => {
                let end = self.current_pos();
                self.change_operand(jump_falsy, end);
            }
        }
        Ok(())
    }

    fn compile_for(
        &mut self,
        span: Span,
        init: Option<&Stmt>,
        cond: Option<&Expr>,
        post: Option<&Stmt>,
        body: &Block,
    ) -> Result<()> {
        if let Some(init) = init {
            self.compile_stmt(init)?;
        }
        let pre_cond = self.current_pos();
        let post_cond = match cond {
            Some(cond) => {
                self.compile_expr(cond)?;
                Some(self.emit(span, OpCode::JumpFalsy, &[0]))
            }
            None => None,
        };

        self.enter_loop();
        let body_result = self.compile_block(body);
        let lp = self.leave_loop();
        body_result?;

        let post_body = self.current_pos();
        if let Some(post) = post {
            self.compile_stmt(post)?;
        }
        self.emit(span, OpCode::Jump, &[pre_cond]);

        let post_stmt = self.current_pos();
        if let Some(pos) = post_cond {
            self.change_operand(pos, post_stmt);
        }
        for pos in lp.breaks {
            self.change_operand(pos, post_stmt);
        }
        for pos in lp.continues {
            self.change_operand(pos, post_body);
        }
        Ok(())
    }

    /// `for k, v in x { body }` becomes, with a hidden `:it` variable:
    ///
    /// ```text
    /// :it := iterator(x)
    /// for :it.next() { k := :it.key(); v := :it.value(); body }
    /// ```
    fn compile_for_in(
        &mut self,
        span: Span,
        key: &Identifier,
        value: &Identifier,
        iterable: &Expr,
        body: &Block,
    ) -> Result<()> {
        let it = self.symbol_table.define(":it");
        self.compile_expr(iterable)?;
        self.emit(span, OpCode::IteratorInit, &[]);
        self.emit_define(span, it)?;

        let pre_cond = self.current_pos();
        self.emit_get(span, it)?;
        self.emit(span, OpCode::IteratorNext, &[]);
        let post_cond = self.emit(span, OpCode::JumpFalsy, &[0]);

        self.enter_loop();
        let result = self.compile_for_in_body(span, it, key, value, body);
        let lp = self.leave_loop();
        result?;

        let post_body = self.current_pos();
        self.emit(span, OpCode::Jump, &[pre_cond]);
        let post_stmt = self.current_pos();
        self.change_operand(post_cond, post_stmt);
        for pos in lp.breaks {
            self.change_operand(pos, post_stmt);
        }
        for pos in lp.continues {
            self.change_operand(pos, post_body);
        }
        Ok(())
    }

    fn compile_for_in_body(
        &mut self,
        span: Span,
        it: SymbolId,
        key: &Identifier,
        value: &Identifier,
        body: &Block,
    ) -> Result<()> {
        for (ident, op) in [(key, OpCode::IteratorKey), (value, OpCode::IteratorValue)] {
            if ident.is_blank() {
                continue;
            }
            let symbol = self.symbol_table.define(&ident.name);
            self.emit_get(span, it)?;
            self.emit(ident.span, op, &[]);
            self.emit_define(ident.span, symbol)?;
        }
        self.compile_block(body)
    }

    /// Store the top of the stack into a freshly defined variable.
    fn emit_define(&mut self, span: Span, id: SymbolId) -> Result<()> {
        let symbol = self.symbol_table.symbol(id).clone();
        self.check_operand(span, &symbol)?;
        if symbol.scope == SymbolScope::Global {
            self.emit(span, OpCode::SetGlobal, &[symbol.index]);
        } else {
            self.symbol_table.mark_assigned(id);
            self.emit(span, OpCode::DefineLocal, &[symbol.index]);
        }
        Ok(())
    }

    fn emit_get(&mut self, span: Span, id: SymbolId) -> Result<()> {
        let symbol = self.symbol_table.symbol(id).clone();
        self.check_operand(span, &symbol)?;
        let op = match symbol.scope {
            SymbolScope::Global => OpCode::GetGlobal,
            SymbolScope::Local => OpCode::GetLocal,
            SymbolScope::Builtin => OpCode::GetBuiltin,
            SymbolScope::Free => OpCode::GetFree,
        };
        self.emit(span, op, &[symbol.index]);
        Ok(())
    }

    // ---
    // Assignment
    // ---

    fn compile_assign(&mut self, span: Span, target: &Expr, value: &Expr, op: AssignOp) -> Result<()> {
        let mut selectors = Vec::new();
        let name = resolve_assign_lhs(target, &mut selectors)
            .ok_or_else(|| CompileError::new(CompileErrorKind::InvalidAssignTarget, target.span))?;
        if op == AssignOp::Define && !selectors.is_empty() {
            return Err(CompileError::new(CompileErrorKind::DefineWithSelector, span));
        }
        if selectors.len() > u8::MAX as usize {
            return Err(CompileError::new(CompileErrorKind::TooManyElements, span));
        }

        let is_func = matches!(value.kind, ExprKind::Func(_));
        let resolved = self.symbol_table.resolve(name, false);
        let symbol = match (op, resolved) {
            (AssignOp::Define, Some((_, 0))) => {
                return Err(CompileError::new(
                    CompileErrorKind::Redeclared(name.clone()),
                    target.span,
                ));
            }
            (AssignOp::Define, _) if is_func => Some(self.symbol_table.define(name)),
            (AssignOp::Define, _) => None,
            (_, Some((id, _))) => Some(id),
            (_, None) => {
                return Err(CompileError::new(
                    CompileErrorKind::UnresolvedReference(name.clone()),
                    target.span,
                ));
            }
        };

        if let AssignOp::Compound(bin) = op {
            self.compile_expr(target)?;
            self.compile_expr(value)?;
            self.emit(span, OpCode::BinaryOp, &[binary_operator(bin) as usize]);
        } else {
            self.compile_expr(value)?;
        }

        let id = match symbol {
            Some(id) => id,
            None => self.symbol_table.define(name),
        };

        for selector in &selectors {
            match selector {
                Selector::Index(expr) => self.compile_expr(expr)?,
                Selector::Field(field) => {
                    self.emit_constant(field.span, Value::String(field.name.clone()))?
                }
            }
        }

        let sym = self.symbol_table.symbol(id).clone();
        self.check_operand(span, &sym)?;
        let num_sel = selectors.len();
        match sym.scope {
            SymbolScope::Global => {
                if num_sel > 0 {
                    self.emit(span, OpCode::SetSelGlobal, &[sym.index, num_sel]);
                } else {
                    self.emit(span, OpCode::SetGlobal, &[sym.index]);
                }
            }
            SymbolScope::Local => {
                if num_sel > 0 {
                    self.emit(span, OpCode::SetSelLocal, &[sym.index, num_sel]);
                } else if op == AssignOp::Define && !sym.local_assigned {
                    self.emit(span, OpCode::DefineLocal, &[sym.index]);
                } else {
                    self.emit(span, OpCode::SetLocal, &[sym.index]);
                }
                self.symbol_table.mark_assigned(id);
            }
            SymbolScope::Free => {
                if num_sel > 0 {
                    self.emit(span, OpCode::SetSelFree, &[sym.index, num_sel]);
                } else {
                    self.emit(span, OpCode::SetFree, &[sym.index]);
                }
            }
            SymbolScope::Builtin => {
                return Err(CompileError::new(
                    CompileErrorKind::AssignToBuiltin(sym.name.clone()),
                    target.span,
                ));
            }
        }
        Ok(())
    }

    // ---
    // Expressions
    // ---

    fn compile_expr(&mut self, expr: &Expr) -> Result<()> {
        let span = expr.span;
        match &expr.kind {
            ExprKind::Literal(lit) => self.compile_literal(span, lit)?,
            ExprKind::Ident(name) => {
                let (id, _) = self.symbol_table.resolve(name, false).ok_or_else(|| {
                    CompileError::new(CompileErrorKind::UnresolvedReference(name.clone()), span)
                })?;
                self.emit_get(span, id)?;
            }
            ExprKind::Array(items) => {
                if items.len() > u16::MAX as usize {
                    return Err(CompileError::new(CompileErrorKind::TooManyElements, span));
                }
                for item in items {
                    self.compile_expr(item)?;
                }
                self.emit(span, OpCode::Array, &[items.len()]);
            }
            ExprKind::Map(entries) => {
                if entries.len() * 2 > u16::MAX as usize {
                    return Err(CompileError::new(CompileErrorKind::TooManyElements, span));
                }
                for entry in entries {
                    self.emit_constant(entry.key_span, Value::String(entry.key.clone()))?;
                    self.compile_expr(&entry.value)?;
                }
                self.emit(span, OpCode::Map, &[entries.len() * 2]);
            }
            ExprKind::Func(func) => self.compile_func_lit(span, func)?,
            ExprKind::Unary { op, operand } => {
                self.compile_expr(operand)?;
                match op {
                    UnaryOp::Neg => {
                        self.emit(span, OpCode::Minus, &[]);
                    }
                    UnaryOp::Not => {
                        self.emit(span, OpCode::LNot, &[]);
                    }
                    UnaryOp::BitNot => {
                        self.emit(span, OpCode::BComplement, &[]);
                    }
                    UnaryOp::Plus => {}
                }
            }
            ExprKind::Binary { op, left, right } => self.compile_binary(span, *op, left, right)?,
            ExprKind::Cond {
                cond,
                then_expr,
                else_expr,
            } => {
                self.compile_expr(cond)?;
                let jump_falsy = self.emit(span, OpCode::JumpFalsy, &[0]);
                self.compile_expr(then_expr)?;
                let jump_end = self.emit(span, OpCode::Jump, &[0]);
                let else_pos = self.current_pos();
                self.change_operand(jump_falsy, else_pos);
                self.compile_expr(else_expr)?;
                let end = self.current_pos();
                self.change_operand(jump_end, end);
            }
            ExprKind::Call { callee, args } => self.compile_call(span, callee, args)?,
            ExprKind::Index { object, index } => {
                self.compile_expr(object)?;
                self.compile_expr(index)?;
                self.emit(span, OpCode::Index, &[]);
            }
            ExprKind::Selector { object, field } => {
                self.compile_expr(object)?;
                self.emit_constant(field.span, Value::String(field.name.clone()))?;
                self.emit(span, OpCode::Index, &[]);
            }
            ExprKind::Slice { object, low, high } => {
                self.compile_expr(object)?;
                for bound in [low, high] {
                    match bound {
                        Some(bound) => self.compile_expr(bound)?,
                        None => {
                            self.emit(span, OpCode::Null, &[]);
                        }
                    }
                }
                self.emit(span, OpCode::SliceIndex, &[]);
            }
            ExprKind::Paren(inner) => self.compile_expr(inner)?,
            ExprKind::Error(inner) => {
                self.compile_expr(inner)?;
                self.emit(span, OpCode::Error, &[]);
            }
            ExprKind::Immutable(inner) => {
                self.compile_expr(inner)?;
                self.emit(span, OpCode::Immutable, &[]);
            }
            ExprKind::Import(name) => self.compile_import(span, name)?,
        }
        Ok(())
    }

    fn compile_literal(&mut self, span: Span, lit: &Literal) -> Result<()> {
        match lit {
            Literal::Int(i) => self.emit_constant(span, Value::Int(*i))?,
            Literal::Float(f) => self.emit_constant(span, Value::Float(*f))?,
            Literal::Char(c) => self.emit_constant(span, Value::Char(*c))?,
            Literal::String(s) => {
                if s.len() > MAX_STRING_LEN {
                    return Err(CompileError::new(CompileErrorKind::StringLimit, span));
                }
                self.emit_constant(span, Value::String(s.clone()))?;
            }
            Literal::Bool(true) => {
                self.emit(span, OpCode::True, &[]);
            }
            Literal::Bool(false) => {
                self.emit(span, OpCode::False, &[]);
            }
            Literal::Undefined => {
                self.emit(span, OpCode::Null, &[]);
            }
        }
        Ok(())
    }

    fn compile_binary(&mut self, span: Span, op: BinaryOp, left: &Expr, right: &Expr) -> Result<()> {
        match op {
            BinaryOp::And | BinaryOp::Or => {
                self.compile_expr(left)?;
                let jump_op = if op == BinaryOp::And {
                    OpCode::AndJump
                } else {
                    OpCode::OrJump
                };
                let jump = self.emit(span, jump_op, &[0]);
                self.compile_expr(right)?;
                let end = self.current_pos();
                self.change_operand(jump, end);
            }
            BinaryOp::Eq | BinaryOp::Ne => {
                self.compile_expr(left)?;
                self.compile_expr(right)?;
                let eq_op = if op == BinaryOp::Eq {
                    OpCode::Equal
                } else {
                    OpCode::NotEqual
                };
                self.emit(span, eq_op, &[]);
            }
            _ => {
                self.compile_expr(left)?;
                self.compile_expr(right)?;
                self.emit(span, OpCode::BinaryOp, &[binary_operator(op) as usize]);
            }
        }
        Ok(())
    }

    fn compile_call(&mut self, span: Span, callee: &Expr, args: &CallArgs) -> Result<()> {
        if args.positional.len() > u8::MAX as usize {
            return Err(CompileError::new(CompileErrorKind::TooManyArguments, span));
        }
        self.compile_expr(callee)?;
        for arg in &args.positional {
            self.compile_expr(arg)?;
        }
        let mut flags = 0u8;
        if args.spread {
            flags |= CALL_SPREAD_ARGS;
        }
        if !args.keywords.is_empty() {
            for (name, value) in &args.keywords {
                self.emit_constant(name.span, Value::String(name.name.clone()))?;
                self.compile_expr(value)?;
            }
            self.emit(span, OpCode::Map, &[args.keywords.len() * 2]);
            flags |= CALL_KWARGS;
        }
        if let Some(spread) = &args.keyword_spread {
            self.compile_expr(spread)?;
            flags |= CALL_SPREAD_KWARGS;
        }
        self.emit(span, OpCode::Call, &[args.positional.len(), flags as usize]);
        Ok(())
    }

    fn compile_func_lit(&mut self, span: Span, func: &FuncLit) -> Result<()> {
        if func.params.len() > u8::MAX as usize {
            return Err(CompileError::new(CompileErrorKind::TooManyLocals, span));
        }
        self.enter_scope();
        for param in &func.params {
            let id = self.symbol_table.define(&param.name);
            self.symbol_table.mark_assigned(id);
        }
        if let Err(err) = self.compile_block(&func.body) {
            self.leave_scope();
            return Err(err);
        }

        let free_symbols = self.symbol_table.free_symbols().to_vec();
        let num_locals = self.symbol_table.max_symbols();
        let mut scope = self.leave_scope();
        optimize_func(&mut scope.instructions, &mut scope.source_map, span);
        if num_locals > u8::MAX as usize + 1 {
            return Err(CompileError::new(CompileErrorKind::TooManyLocals, span));
        }
        if free_symbols.len() > u8::MAX as usize {
            return Err(CompileError::new(CompileErrorKind::TooManyFreeVariables, span));
        }

        for &id in &free_symbols {
            let symbol = self.symbol_table.symbol(id).clone();
            match symbol.scope {
                SymbolScope::Local => {
                    // Captured before its first assignment, as in a local
                    // recursive function. Give the slot a value so there is
                    // a cell to share.
                    if !symbol.local_assigned {
                        self.emit(span, OpCode::Null, &[]);
                        self.emit(span, OpCode::DefineLocal, &[symbol.index]);
                        self.symbol_table.mark_assigned(id);
                    }
                    self.emit(span, OpCode::GetLocalPtr, &[symbol.index]);
                }
                SymbolScope::Free => {
                    self.emit(span, OpCode::GetFreePtr, &[symbol.index]);
                }
                SymbolScope::Global | SymbolScope::Builtin => {}
            }
        }

        let compiled = CompiledFunction::new(
            scope.instructions,
            num_locals,
            func.params.len(),
            func.var_args,
            scope.source_map,
        );
        let idx = self.add_constant(span, Value::Function(Arc::new(compiled)))?;
        if free_symbols.is_empty() {
            self.emit(span, OpCode::Constant, &[idx]);
        } else {
            self.emit(span, OpCode::Closure, &[idx, free_symbols.len()]);
        }
        Ok(())
    }

    // ---
    // Modules
    // ---

    fn compile_import(&mut self, span: Span, name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(CompileError::new(CompileErrorKind::EmptyModuleName, span));
        }
        let modules = self.module_map.clone();
        match modules.get(name) {
            Some(Module::Source(source)) => {
                let idx = self.compile_module(span, name, source.clone(), None)?;
                self.emit(span, OpCode::Constant, &[idx]);
                self.emit(span, OpCode::Call, &[0, 0]);
            }
            Some(module @ Module::Native(_)) => {
                let idx = match self.context.native.get(name) {
                    Some(&idx) => idx,
                    None => {
                        let idx = self.add_constant(span, module.as_value().unwrap_or_default())?;
                        self.context.native.insert(name.to_string(), idx);
                        idx
                    }
                };
                self.emit(span, OpCode::Constant, &[idx]);
            }
            None if self.options.allow_file_import => {
                let path = self.module_file_path(name);
                let source = std::fs::read_to_string(&path).map_err(|e| {
                    CompileError::new(CompileErrorKind::ModuleFileRead(e.to_string()), span)
                })?;
                let import_dir = path.parent().map(Path::to_path_buf);
                let key = path.to_string_lossy().into_owned();
                let idx = self.compile_module(span, &key, source.into(), import_dir)?;
                self.emit(span, OpCode::Constant, &[idx]);
                self.emit(span, OpCode::Call, &[0, 0]);
            }
            None => {
                return Err(CompileError::new(
                    CompileErrorKind::ModuleNotFound(name.to_string()),
                    span,
                ));
            }
        }
        Ok(())
    }

    fn module_file_path(&self, name: &str) -> PathBuf {
        let ext = &self.options.import_file_ext;
        let mut file_name = name.to_string();
        if !ext.is_empty() && !file_name.ends_with(ext.as_str()) {
            file_name.push_str(ext);
        }
        let joined = self.options.import_dir.join(file_name);
        std::path::absolute(&joined).unwrap_or(joined)
    }

    /// Compile a module body into a function constant, at most once per
    /// path. Returns the constant index.
    fn compile_module(
        &mut self,
        span: Span,
        path: &str,
        source: Arc<str>,
        import_dir: Option<PathBuf>,
    ) -> Result<usize> {
        if self.context.is_compiling(path) {
            return Err(CompileError::new(
                CompileErrorKind::CyclicImport(path.to_string()),
                span,
            ));
        }
        if let Some(func) = self.context.cache.get(path).cloned() {
            tracing::debug!(module = path, "module cache hit");
            return self.add_constant(span, Value::Function(func));
        }

        let file_id = self.file_set.add_file(path, source.clone());
        let file = parse(&source, file_id).map_err(|errors| {
            let first = errors.into_iter().next();
            let err_span = first.as_ref().map(|e| e.span()).unwrap_or(span);
            let message = first.map(|e| e.to_string()).unwrap_or_default();
            CompileError::new(
                CompileErrorKind::ModuleParse {
                    module: path.to_string(),
                    message,
                },
                err_span,
            )
        })?;

        let mut symbol_table = SymbolTable::new();
        let builtins: Vec<(usize, Arc<str>)> = self
            .symbol_table
            .builtin_symbols()
            .into_iter()
            .map(|s| (s.index, s.name.clone()))
            .collect();
        for (index, name) in &builtins {
            symbol_table.define_builtin(*index, name);
        }
        symbol_table.fork(false);

        let mut options = self.options.clone();
        if let Some(dir) = import_dir {
            options.import_dir = dir;
        }
        let mut child = Compiler {
            file_set: std::mem::take(&mut self.file_set),
            constants: std::mem::take(&mut self.constants),
            symbol_table,
            scopes: vec![CompilationScope::default()],
            module_map: self.module_map.clone(),
            options,
            context: std::mem::take(&mut self.context),
            module: Some(path.to_string()),
        };
        child.context.stack.push(path.to_string());
        let result = child.compile_module_body(&file);
        child.context.stack.pop();

        self.file_set = child.file_set;
        self.constants = child.constants;
        self.context = child.context;

        let func = Arc::new(result?);
        tracing::debug!(module = path, locals = func.num_locals, "compiled module");
        self.context.cache.insert(path.to_string(), func.clone());
        self.add_constant(span, Value::Function(func))
    }

    fn compile_module_body(&mut self, file: &File) -> Result<CompiledFunction> {
        self.compile(file)?;
        let num_locals = self.symbol_table.max_symbols();
        if num_locals > u8::MAX as usize + 1 {
            return Err(CompileError::new(CompileErrorKind::TooManyLocals, file.span));
        }
        let mut scope = std::mem::take(&mut self.scopes[0]);
        optimize_func(&mut scope.instructions, &mut scope.source_map, file.span);
        Ok(CompiledFunction::new(
            scope.instructions,
            num_locals,
            0,
            false,
            scope.source_map,
        ))
    }
}

/// Split an assignment target into the variable name and the selectors
/// applied to it, outermost first.
fn resolve_assign_lhs<'a>(expr: &'a Expr, selectors: &mut Vec<Selector<'a>>) -> Option<&'a Arc<str>> {
    match &expr.kind {
        ExprKind::Ident(name) => Some(name),
        ExprKind::Index { object, index } => {
            let name = resolve_assign_lhs(object, selectors)?;
            selectors.push(Selector::Index(index));
            Some(name)
        }
        ExprKind::Selector { object, field } => {
            let name = resolve_assign_lhs(object, selectors)?;
            selectors.push(Selector::Field(field));
            Some(name)
        }
        _ => None,
    }
}

fn binary_operator(op: BinaryOp) -> Operator {
    match op {
        BinaryOp::Add => Operator::Add,
        BinaryOp::Sub => Operator::Sub,
        BinaryOp::Mul => Operator::Mul,
        BinaryOp::Div => Operator::Quo,
        BinaryOp::Rem => Operator::Rem,
        BinaryOp::BitAnd => Operator::And,
        BinaryOp::BitOr => Operator::Or,
        BinaryOp::BitXor => Operator::Xor,
        BinaryOp::AndNot => Operator::AndNot,
        BinaryOp::Shl => Operator::Shl,
        BinaryOp::Shr => Operator::Shr,
        BinaryOp::Lt => Operator::Less,
        BinaryOp::Le => Operator::LessEq,
        BinaryOp::Gt => Operator::Greater,
        BinaryOp::Ge => Operator::GreaterEq,
        // Compiled with dedicated opcodes.
        BinaryOp::Eq | BinaryOp::Ne | BinaryOp::And | BinaryOp::Or => Operator::Add,
    }
}
