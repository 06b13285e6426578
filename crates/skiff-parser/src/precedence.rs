use crate::ast::BinaryOp;
use skiff_lexer::TokenKind;

/// Operator precedence levels (higher = binds tighter).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Precedence {
    /// Lowest precedence (for statements, etc.)
    Lowest = 0,
    /// Conditional: `? :`
    Ternary = 1,
    /// Logical or: `||`
    Or = 2,
    /// Logical and: `&&`
    And = 3,
    /// Comparison: `==`, `!=`, `<`, `<=`, `>`, `>=`
    Comparison = 4,
    /// Additive: `+`, `-`, `|`, `^`
    Term = 5,
    /// Multiplicative: `*`, `/`, `%`, `<<`, `>>`, `&`, `&^`
    Factor = 6,
    /// Unary operators: `-`, `+`, `!`, `^`
    Unary = 7,
    /// Call, index, selector: `()`, `[]`, `.`
    Postfix = 8,
}

impl Precedence {
    /// Get the precedence for a token that can be an infix or postfix operator.
    pub fn of_infix_token(kind: TokenKind) -> Option<Self> {
        Some(match kind {
            TokenKind::Question => Precedence::Ternary,
            TokenKind::LOr => Precedence::Or,
            TokenKind::LAnd => Precedence::And,

            TokenKind::Equal
            | TokenKind::NotEqual
            | TokenKind::Less
            | TokenKind::LessEq
            | TokenKind::Greater
            | TokenKind::GreaterEq => Precedence::Comparison,

            TokenKind::Add | TokenKind::Sub | TokenKind::Or | TokenKind::Xor => {
                Precedence::Term
            }

            TokenKind::Mul
            | TokenKind::Quo
            | TokenKind::Rem
            | TokenKind::Shl
            | TokenKind::Shr
            | TokenKind::And
            | TokenKind::AndNot => Precedence::Factor,

            TokenKind::LParen | TokenKind::LBrack | TokenKind::Period => Precedence::Postfix,

            _ => return None,
        })
    }

    /// Returns true for right-associative levels.
    pub fn is_right_associative(self) -> bool {
        matches!(self, Precedence::Ternary)
    }

    /// The next tighter level.
    pub fn next(self) -> Self {
        match self {
            Precedence::Lowest => Precedence::Ternary,
            Precedence::Ternary => Precedence::Or,
            Precedence::Or => Precedence::And,
            Precedence::And => Precedence::Comparison,
            Precedence::Comparison => Precedence::Term,
            Precedence::Term => Precedence::Factor,
            Precedence::Factor => Precedence::Unary,
            Precedence::Unary | Precedence::Postfix => Precedence::Postfix,
        }
    }
}

/// Convert a token kind to a binary operator.
pub fn token_to_binary_op(kind: TokenKind) -> Option<BinaryOp> {
    Some(match kind {
        TokenKind::Add => BinaryOp::Add,
        TokenKind::Sub => BinaryOp::Sub,
        TokenKind::Mul => BinaryOp::Mul,
        TokenKind::Quo => BinaryOp::Div,
        TokenKind::Rem => BinaryOp::Rem,
        TokenKind::Equal => BinaryOp::Eq,
        TokenKind::NotEqual => BinaryOp::Ne,
        TokenKind::Less => BinaryOp::Lt,
        TokenKind::LessEq => BinaryOp::Le,
        TokenKind::Greater => BinaryOp::Gt,
        TokenKind::GreaterEq => BinaryOp::Ge,
        TokenKind::LAnd => BinaryOp::And,
        TokenKind::LOr => BinaryOp::Or,
        TokenKind::And => BinaryOp::BitAnd,
        TokenKind::Or => BinaryOp::BitOr,
        TokenKind::Xor => BinaryOp::BitXor,
        TokenKind::AndNot => BinaryOp::AndNot,
        TokenKind::Shl => BinaryOp::Shl,
        TokenKind::Shr => BinaryOp::Shr,
        _ => return None,
    })
}

/// Convert a compound assignment token to the corresponding binary operator.
pub fn compound_assign_to_op(kind: TokenKind) -> Option<BinaryOp> {
    Some(match kind {
        TokenKind::AddAssign => BinaryOp::Add,
        TokenKind::SubAssign => BinaryOp::Sub,
        TokenKind::MulAssign => BinaryOp::Mul,
        TokenKind::QuoAssign => BinaryOp::Div,
        TokenKind::RemAssign => BinaryOp::Rem,
        TokenKind::AndAssign => BinaryOp::BitAnd,
        TokenKind::OrAssign => BinaryOp::BitOr,
        TokenKind::XorAssign => BinaryOp::BitXor,
        TokenKind::AndNotAssign => BinaryOp::AndNot,
        TokenKind::ShlAssign => BinaryOp::Shl,
        TokenKind::ShrAssign => BinaryOp::Shr,
        _ => return None,
    })
}
