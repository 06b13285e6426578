use logos::Logos;

use crate::Span;

/// Kinds of Skiff tokens.
///
/// Whitespace and comments are skipped by the lexer; line breaks are
/// recorded on the following token instead (see [`Token::newline_before`]).
#[derive(Logos, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[logos(skip r"[ \t\r\n\f]+")]
#[logos(skip(r"//[^\n]*", allow_greedy = true))]
#[logos(skip r"/\*([^*]|\*+[^*/])*\*+/")]
pub enum TokenKind {
    // Literals. Underscores are digit separators.
    #[regex(r"0[xX][0-9a-fA-F][0-9a-fA-F_]*", priority = 3)]
    #[regex(r"0[bB][01][01_]*", priority = 3)]
    #[regex(r"0[oO][0-7][0-7_]*", priority = 3)]
    #[regex(r"[0-9][0-9_]*", priority = 2)]
    Int,
    #[regex(r"[0-9][0-9_]*\.[0-9][0-9_]*([eE][+-]?[0-9]+)?")]
    #[regex(r"[0-9][0-9_]*[eE][+-]?[0-9]+")]
    Float,
    #[regex(r#""([^"\\\n]|\\.)*""#)]
    String,
    /// Back-quoted, no escapes, may span lines.
    #[regex(r"`[^`]*`")]
    RawString,
    #[regex(r"'([^'\\]|\\[^']+|\\')'")]
    Char,
    #[token("true")]
    True,
    #[token("false")]
    False,
    #[token("undefined")]
    Undefined,

    #[regex(r"[a-zA-Z_][a-zA-Z0-9_]*")]
    Ident,

    // Keywords
    #[token("func")]
    Func,
    #[token("if")]
    If,
    #[token("else")]
    Else,
    #[token("for")]
    For,
    #[token("in")]
    In,
    #[token("break")]
    Break,
    #[token("continue")]
    Continue,
    #[token("return")]
    Return,
    #[token("export")]
    Export,
    #[token("import")]
    Import,
    #[token("error")]
    Error,
    #[token("immutable")]
    Immutable,

    // Operators
    #[token("+")]
    Add,
    #[token("-")]
    Sub,
    #[token("*")]
    Mul,
    #[token("/")]
    Quo,
    #[token("%")]
    Rem,
    #[token("&")]
    And,
    #[token("|")]
    Or,
    #[token("^")]
    Xor,
    #[token("&^")]
    AndNot,
    #[token("<<")]
    Shl,
    #[token(">>")]
    Shr,
    #[token("&&")]
    LAnd,
    #[token("||")]
    LOr,
    #[token("++")]
    Inc,
    #[token("--")]
    Dec,
    #[token("==")]
    Equal,
    #[token("!=")]
    NotEqual,
    #[token("<")]
    Less,
    #[token("<=")]
    LessEq,
    #[token(">")]
    Greater,
    #[token(">=")]
    GreaterEq,
    #[token("!")]
    Not,

    #[token("=")]
    Assign,
    #[token(":=")]
    Define,
    #[token("+=")]
    AddAssign,
    #[token("-=")]
    SubAssign,
    #[token("*=")]
    MulAssign,
    #[token("/=")]
    QuoAssign,
    #[token("%=")]
    RemAssign,
    #[token("&=")]
    AndAssign,
    #[token("|=")]
    OrAssign,
    #[token("^=")]
    XorAssign,
    #[token("&^=")]
    AndNotAssign,
    #[token("<<=")]
    ShlAssign,
    #[token(">>=")]
    ShrAssign,

    // Delimiters
    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[token("[")]
    LBrack,
    #[token("]")]
    RBrack,
    #[token("{")]
    LBrace,
    #[token("}")]
    RBrace,
    #[token(",")]
    Comma,
    #[token(";")]
    Semicolon,
    #[token(":")]
    Colon,
    #[token(".")]
    Period,
    #[token("...")]
    Ellipsis,
    #[token("?")]
    Question,

    Eof,
    /// Input the lexer could not match.
    Illegal,
}

mod tables {
    use super::TokenKind::{self, *};

    pub(super) const KEYWORDS: &[(TokenKind, &str)] = &[
        (Func, "func"),
        (If, "if"),
        (Else, "else"),
        (For, "for"),
        (In, "in"),
        (Break, "break"),
        (Continue, "continue"),
        (Return, "return"),
        (Export, "export"),
        (Import, "import"),
        (Error, "error"),
        (Immutable, "immutable"),
        (True, "true"),
        (False, "false"),
        (Undefined, "undefined"),
    ];

    pub(super) const OPERATORS: &[(TokenKind, &str)] = &[
        (Add, "+"),
        (Sub, "-"),
        (Mul, "*"),
        (Quo, "/"),
        (Rem, "%"),
        (And, "&"),
        (Or, "|"),
        (Xor, "^"),
        (AndNot, "&^"),
        (Shl, "<<"),
        (Shr, ">>"),
        (LAnd, "&&"),
        (LOr, "||"),
        (Inc, "++"),
        (Dec, "--"),
        (Equal, "=="),
        (NotEqual, "!="),
        (Less, "<"),
        (LessEq, "<="),
        (Greater, ">"),
        (GreaterEq, ">="),
        (Not, "!"),
        (Assign, "="),
        (Define, ":="),
        (AddAssign, "+="),
        (SubAssign, "-="),
        (MulAssign, "*="),
        (QuoAssign, "/="),
        (RemAssign, "%="),
        (AndAssign, "&="),
        (OrAssign, "|="),
        (XorAssign, "^="),
        (AndNotAssign, "&^="),
        (ShlAssign, "<<="),
        (ShrAssign, ">>="),
        (LParen, "("),
        (RParen, ")"),
        (LBrack, "["),
        (RBrack, "]"),
        (LBrace, "{"),
        (RBrace, "}"),
        (Comma, ","),
        (Semicolon, ";"),
        (Colon, ":"),
        (Period, "."),
        (Ellipsis, "..."),
        (Question, "?"),
    ];
}

impl TokenKind {
    pub fn is_keyword(self) -> bool {
        tables::KEYWORDS.iter().any(|(k, _)| *k == self)
    }

    pub fn is_literal(self) -> bool {
        use TokenKind::*;
        matches!(
            self,
            Int | Float | String | RawString | Char | True | False | Undefined
        )
    }

    /// `=`, `:=` and every compound assignment.
    pub fn is_assign_op(self) -> bool {
        use TokenKind::*;
        matches!(
            self,
            Assign
                | Define
                | AddAssign
                | SubAssign
                | MulAssign
                | QuoAssign
                | RemAssign
                | AndAssign
                | OrAssign
                | XorAssign
                | AndNotAssign
                | ShlAssign
                | ShrAssign
        )
    }

    /// Source text for fixed tokens, a description for the rest.
    pub fn name(self) -> &'static str {
        use TokenKind::*;
        let fixed = tables::KEYWORDS.iter().chain(tables::OPERATORS).find(|(k, _)| *k == self);
        if let Some((_, text)) = fixed {
            return *text;
        }
        match self {
            Int => "integer",
            Float => "float",
            String => "string",
            RawString => "raw string",
            Char => "character",
            Ident => "identifier",
            Eof => "end of file",
            _ => "illegal token",
        }
    }
}

impl std::fmt::Display for TokenKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    pub span: Span,
    /// A line break separates this token from the previous one.
    pub newline_before: bool,
}

impl Token {
    pub fn new(kind: TokenKind, span: Span) -> Self {
        Self {
            kind,
            span,
            newline_before: false,
        }
    }

    pub fn dummy(kind: TokenKind) -> Self {
        Self::new(kind, Span::dummy())
    }
}
