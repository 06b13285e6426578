use skiff_lexer::Span;
use std::sync::Arc;

/// An interned string symbol.
pub type Symbol = Arc<str>;

// ---
// File
// ---

/// A complete Skiff source file: the main script or one module.
#[derive(Debug, Clone)]
pub struct File {
    pub stmts: Vec<Stmt>,
    pub span: Span,
}

/// An identifier with its source location.
#[derive(Debug, Clone, PartialEq)]
pub struct Identifier {
    pub name: Symbol,
    pub span: Span,
}

impl Identifier {
    pub fn new(name: impl Into<Symbol>, span: Span) -> Self {
        Self {
            name: name.into(),
            span,
        }
    }

    /// `_` binds nothing in `for _, v in ...`.
    pub fn is_blank(&self) -> bool {
        &*self.name == "_"
    }
}

/// A brace-delimited list of statements.
#[derive(Debug, Clone)]
pub struct Block {
    pub stmts: Vec<Stmt>,
    pub span: Span,
}

// ---
// Statements
// ---

#[derive(Debug, Clone)]
pub struct Stmt {
    pub kind: StmtKind,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub enum StmtKind {
    /// An expression evaluated for its side effects.
    Expr(Expr),
    /// `target := value`, `target = value` or `target op= value`.
    Assign {
        target: Expr,
        op: AssignOp,
        value: Expr,
    },
    /// `target++` / `target--`
    IncDec { target: Expr, increment: bool },
    Block(Block),
    If {
        init: Option<Box<Stmt>>,
        cond: Expr,
        then_branch: Block,
        /// Either a `Block` or another `If` statement.
        else_branch: Option<Box<Stmt>>,
    },
    /// C-style loop. All three header parts are optional.
    For {
        init: Option<Box<Stmt>>,
        cond: Option<Expr>,
        post: Option<Box<Stmt>>,
        body: Block,
    },
    /// `for key, value in iterable { }`. With a single identifier the
    /// identifier receives the value and `key` is `_`.
    ForIn {
        key: Identifier,
        value: Identifier,
        iterable: Expr,
        body: Block,
    },
    Return(Option<Expr>),
    Export(Expr),
    Break,
    Continue,
    Empty,
}

/// Assignment operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignOp {
    /// `=`
    Assign,
    /// `:=`
    Define,
    /// `+=`, `-=`, ...
    Compound(BinaryOp),
}

// ---
// Expressions
// ---

#[derive(Debug, Clone)]
pub struct Expr {
    pub kind: ExprKind,
    pub span: Span,
}

impl Expr {
    pub fn new(kind: ExprKind, span: Span) -> Self {
        Self { kind, span }
    }
}

#[derive(Debug, Clone)]
pub enum ExprKind {
    Literal(Literal),
    Ident(Symbol),
    Array(Vec<Expr>),
    Map(Vec<MapEntry>),
    Func(FuncLit),
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    /// `cond ? then_expr : else_expr`
    Cond {
        cond: Box<Expr>,
        then_expr: Box<Expr>,
        else_expr: Box<Expr>,
    },
    Call {
        callee: Box<Expr>,
        args: CallArgs,
    },
    Index {
        object: Box<Expr>,
        index: Box<Expr>,
    },
    /// `object.field`, sugar for `object["field"]`.
    Selector {
        object: Box<Expr>,
        field: Identifier,
    },
    Slice {
        object: Box<Expr>,
        low: Option<Box<Expr>>,
        high: Option<Box<Expr>>,
    },
    Paren(Box<Expr>),
    /// `error(expr)`
    Error(Box<Expr>),
    /// `immutable(expr)`
    Immutable(Box<Expr>),
    /// `import("name")`
    Import(Symbol),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Int(i64),
    Float(f64),
    String(Symbol),
    Char(char),
    Bool(bool),
    Undefined,
}

#[derive(Debug, Clone)]
pub struct MapEntry {
    pub key: Symbol,
    pub key_span: Span,
    pub value: Expr,
}

/// A function literal: `func(a, b, rest...) { ... }`.
#[derive(Debug, Clone)]
pub struct FuncLit {
    pub params: Vec<Identifier>,
    /// The last parameter collects any extra arguments into an array.
    pub var_args: bool,
    pub body: Block,
}

/// Arguments of a call expression, in the only order the grammar accepts:
/// positional arguments (the last one may be spread with `...`), then
/// keyword arguments, then an optional spread keyword map.
#[derive(Debug, Clone, Default)]
pub struct CallArgs {
    pub positional: Vec<Expr>,
    pub spread: bool,
    pub keywords: Vec<(Identifier, Expr)>,
    pub keyword_spread: Option<Box<Expr>>,
}

impl CallArgs {
    pub fn has_keywords(&self) -> bool {
        !self.keywords.is_empty() || self.keyword_spread.is_some()
    }
}

/// Binary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    // Arithmetic
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    // Bitwise
    BitAnd,
    BitOr,
    BitXor,
    AndNot,
    Shl,
    Shr,
    // Comparison
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    // Logical
    And,
    Or,
}

impl BinaryOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Rem => "%",
            BinaryOp::BitAnd => "&",
            BinaryOp::BitOr => "|",
            BinaryOp::BitXor => "^",
            BinaryOp::AndNot => "&^",
            BinaryOp::Shl => "<<",
            BinaryOp::Shr => ">>",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::And => "&&",
            BinaryOp::Or => "||",
        }
    }
}

/// Unary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    /// `-x`
    Neg,
    /// `+x`
    Plus,
    /// `!x`
    Not,
    /// `^x`
    BitNot,
}
