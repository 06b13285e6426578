use crate::ast::*;
use crate::precedence::{compound_assign_to_op, token_to_binary_op, Precedence};
use skiff_lexer::{
    parse_char, parse_float, parse_int, parse_raw_string, parse_string, Lexer, Span, Token,
    TokenKind,
};

/// Parsing stops once this many errors have been collected.
pub const MAX_ERRORS: usize = 10;

#[derive(Debug, Clone, thiserror::Error)]
pub enum ParseError {
    #[error("expected {expected}, found {found}")]
    UnexpectedToken {
        expected: String,
        found: String,
        span: Span,
    },
    #[error("invalid literal: {message}")]
    InvalidLiteral { message: String, span: Span },
    #[error("{message}")]
    Custom { message: String, span: Span },
}

impl ParseError {
    pub fn span(&self) -> Span {
        match *self {
            ParseError::UnexpectedToken { span, .. }
            | ParseError::InvalidLiteral { span, .. }
            | ParseError::Custom { span, .. } => span,
        }
    }
}

/// Parse a whole source file. Fails with every error collected along the
/// way, never more than [`MAX_ERRORS`].
pub fn parse(source: &str, file_id: u16) -> Result<File, Vec<ParseError>> {
    let mut parser = Parser::new(source, file_id);
    let file = parser.parse_file();
    match parser.take_errors() {
        errors if errors.is_empty() => Ok(file),
        errors => Err(errors),
    }
}

/// Recursive descent parser with Pratt-style binary expressions.
///
/// Statements end at a `;`, at a line break, before a closing `}` or at the
/// end of the file. An infix operator on a new line never continues the
/// previous expression.
pub struct Parser<'src> {
    tokens: Lexer<'src>,
    current: Token,
    errors: Vec<ParseError>,
}

impl<'src> Parser<'src> {
    pub fn new(source: &'src str, file_id: u16) -> Self {
        let mut tokens = Lexer::new(source, file_id);
        let current = tokens.next_token();
        Parser {
            tokens,
            current,
            errors: Vec::new(),
        }
    }

    pub fn errors(&self) -> &[ParseError] {
        &self.errors
    }

    pub fn take_errors(&mut self) -> Vec<ParseError> {
        std::mem::take(&mut self.errors)
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Move past the current token and return it.
    fn advance(&mut self) -> Token {
        let next = self.tokens.next_token();
        std::mem::replace(&mut self.current, next)
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.current.kind == kind
    }

    /// Kind test on the token after `current`.
    fn peek_is(&mut self, kind: TokenKind) -> bool {
        self.tokens.peek().kind == kind
    }

    fn consume(&mut self, kind: TokenKind) -> bool {
        let matched = self.check(kind);
        if matched {
            self.advance();
        }
        matched
    }

    fn expect(&mut self, kind: TokenKind) -> Result<Token, ParseError> {
        match self.check(kind) {
            true => Ok(self.advance()),
            false => Err(self.unexpected(kind.name())),
        }
    }

    /// Keep a copy of `err` in the error list and return it.
    fn record(&mut self, err: ParseError) -> ParseError {
        self.errors.push(err.clone());
        err
    }

    fn unexpected(&mut self, expected: &str) -> ParseError {
        let found = match self.current.kind {
            TokenKind::Illegal => format!("illegal input '{}'", self.slice(self.current.span)),
            kind => kind.name().to_string(),
        };
        self.record(ParseError::UnexpectedToken {
            expected: expected.to_string(),
            found,
            span: self.current.span,
        })
    }

    fn error(&mut self, message: impl Into<String>, span: Span) -> ParseError {
        let message = message.into();
        self.record(ParseError::Custom { message, span })
    }

    fn invalid_literal(&mut self, message: impl Into<String>, span: Span) -> ParseError {
        let message = message.into();
        self.record(ParseError::InvalidLiteral { message, span })
    }

    fn slice(&self, span: Span) -> &'src str {
        &self.tokens.source()[span.range()]
    }

    fn symbol(&self, span: Span) -> Symbol {
        Symbol::from(self.slice(span))
    }

    fn too_many_errors(&self) -> bool {
        self.errors.len() >= MAX_ERRORS
    }

    fn at_stmt_end(&self) -> bool {
        self.current.newline_before
            || self.check(TokenKind::Semicolon)
            || self.check(TokenKind::RBrace)
            || self.check(TokenKind::Eof)
    }

    fn expect_terminator(&mut self) -> Result<(), ParseError> {
        if self.consume(TokenKind::Semicolon) || self.at_stmt_end() {
            Ok(())
        } else {
            Err(self.unexpected("';' or newline"))
        }
    }

    /// Skip the rest of a broken statement.
    fn recover_to_stmt(&mut self) {
        if !self.check(TokenKind::Eof) && !self.check(TokenKind::RBrace) {
            self.advance();
        }
        while !self.check(TokenKind::Eof)
            && !self.check(TokenKind::RBrace)
            && !self.current.newline_before
        {
            if self.consume(TokenKind::Semicolon) {
                return;
            }
            self.advance();
        }
    }

    // ---
    // Files and blocks
    // ---

    /// Parse a complete file.
    pub fn parse_file(&mut self) -> File {
        let start = self.current.span;
        let mut stmts = Vec::new();

        loop {
            stmts.extend(self.parse_stmt_list());
            if self.check(TokenKind::RBrace) && !self.too_many_errors() {
                let stray = self.advance();
                self.error("unexpected '}'", stray.span);
                continue;
            }
            break;
        }

        let span = start.merge(self.current.span);
        File { stmts, span }
    }

    fn parse_stmt_list(&mut self) -> Vec<Stmt> {
        let mut stmts = Vec::new();
        while !self.check(TokenKind::RBrace) && !self.check(TokenKind::Eof) {
            if self.too_many_errors() {
                break;
            }
            match self.parse_stmt() {
                Ok(stmt) => match self.expect_terminator() {
                    Ok(()) => stmts.push(stmt),
                    Err(_) => self.recover_to_stmt(),
                },
                Err(_) => self.recover_to_stmt(),
            }
        }
        stmts
    }

    fn parse_block(&mut self) -> Result<Block, ParseError> {
        let open = self.expect(TokenKind::LBrace)?;
        let stmts = self.parse_stmt_list();
        let close = self.expect(TokenKind::RBrace)?;
        Ok(Block {
            stmts,
            span: open.span.merge(close.span),
        })
    }

    // ---
    // Statements
    // ---

    fn parse_stmt(&mut self) -> Result<Stmt, ParseError> {
        let start = self.current.span;

        match self.current.kind {
            TokenKind::Semicolon => Ok(Stmt {
                kind: StmtKind::Empty,
                span: start,
            }),
            TokenKind::If => self.parse_if(),
            TokenKind::For => self.parse_for(),
            TokenKind::LBrace => {
                let block = self.parse_block()?;
                Ok(Stmt {
                    span: block.span,
                    kind: StmtKind::Block(block),
                })
            }
            TokenKind::Return => {
                self.advance();
                if self.at_stmt_end() {
                    return Ok(Stmt {
                        kind: StmtKind::Return(None),
                        span: start,
                    });
                }
                let value = self.parse_expression()?;
                Ok(Stmt {
                    span: start.merge(value.span),
                    kind: StmtKind::Return(Some(value)),
                })
            }
            TokenKind::Export => {
                self.advance();
                let value = self.parse_expression()?;
                Ok(Stmt {
                    span: start.merge(value.span),
                    kind: StmtKind::Export(value),
                })
            }
            TokenKind::Break => {
                self.advance();
                Ok(Stmt {
                    kind: StmtKind::Break,
                    span: start,
                })
            }
            TokenKind::Continue => {
                self.advance();
                Ok(Stmt {
                    kind: StmtKind::Continue,
                    span: start,
                })
            }
            _ => self.parse_simple_stmt(),
        }
    }

    /// Expression, assignment or increment statement.
    fn parse_simple_stmt(&mut self) -> Result<Stmt, ParseError> {
        let expr = self.parse_expression()?;
        let start = expr.span;

        if self.current.kind.is_assign_op() {
            let op = match self.current.kind {
                TokenKind::Assign => AssignOp::Assign,
                TokenKind::Define => AssignOp::Define,
                kind => match compound_assign_to_op(kind) {
                    Some(op) => AssignOp::Compound(op),
                    None => return Err(self.unexpected("assignment operator")),
                },
            };
            self.advance();
            let value = self.parse_expression()?;
            return Ok(Stmt {
                span: start.merge(value.span),
                kind: StmtKind::Assign {
                    target: expr,
                    op,
                    value,
                },
            });
        }

        if (self.check(TokenKind::Inc) || self.check(TokenKind::Dec))
            && !self.current.newline_before
        {
            let op = self.advance();
            return Ok(Stmt {
                span: start.merge(op.span),
                kind: StmtKind::IncDec {
                    target: expr,
                    increment: op.kind == TokenKind::Inc,
                },
            });
        }

        Ok(Stmt {
            span: start,
            kind: StmtKind::Expr(expr),
        })
    }

    fn parse_if(&mut self) -> Result<Stmt, ParseError> {
        let start = self.expect(TokenKind::If)?.span;

        let first = self.parse_simple_stmt()?;
        let (init, cond) = if self.consume(TokenKind::Semicolon) {
            (Some(Box::new(first)), self.parse_expression()?)
        } else {
            match first.kind {
                StmtKind::Expr(cond) => (None, cond),
                _ => return Err(self.error("missing condition in if statement", first.span)),
            }
        };

        let then_branch = self.parse_block()?;
        let mut end = then_branch.span;

        let else_branch = if self.consume(TokenKind::Else) {
            let stmt = if self.check(TokenKind::If) {
                self.parse_if()?
            } else {
                let block = self.parse_block()?;
                Stmt {
                    span: block.span,
                    kind: StmtKind::Block(block),
                }
            };
            end = stmt.span;
            Some(Box::new(stmt))
        } else {
            None
        };

        Ok(Stmt {
            span: start.merge(end),
            kind: StmtKind::If {
                init,
                cond,
                then_branch,
                else_branch,
            },
        })
    }

    fn parse_for(&mut self) -> Result<Stmt, ParseError> {
        let start = self.expect(TokenKind::For)?.span;

        if self.check(TokenKind::LBrace) {
            let body = self.parse_block()?;
            return Ok(Stmt {
                span: start.merge(body.span),
                kind: StmtKind::For {
                    init: None,
                    cond: None,
                    post: None,
                    body,
                },
            });
        }

        if self.check(TokenKind::Ident)
            && (self.peek_is(TokenKind::Comma) || self.peek_is(TokenKind::In))
        {
            return self.parse_for_in(start);
        }

        let init = if self.check(TokenKind::Semicolon) {
            None
        } else {
            let stmt = self.parse_simple_stmt()?;
            if self.check(TokenKind::LBrace) {
                // for cond { }
                let cond = match stmt.kind {
                    StmtKind::Expr(cond) => cond,
                    _ => return Err(self.error("expected for loop condition", stmt.span)),
                };
                let body = self.parse_block()?;
                return Ok(Stmt {
                    span: start.merge(body.span),
                    kind: StmtKind::For {
                        init: None,
                        cond: Some(cond),
                        post: None,
                        body,
                    },
                });
            }
            Some(Box::new(stmt))
        };
        self.expect(TokenKind::Semicolon)?;

        let cond = if self.check(TokenKind::Semicolon) {
            None
        } else {
            Some(self.parse_expression()?)
        };
        self.expect(TokenKind::Semicolon)?;

        let post = if self.check(TokenKind::LBrace) {
            None
        } else {
            Some(Box::new(self.parse_simple_stmt()?))
        };

        let body = self.parse_block()?;
        Ok(Stmt {
            span: start.merge(body.span),
            kind: StmtKind::For {
                init,
                cond,
                post,
                body,
            },
        })
    }

    fn parse_for_in(&mut self, start: Span) -> Result<Stmt, ParseError> {
        let first = self.parse_identifier()?;
        let (key, value) = if self.consume(TokenKind::Comma) {
            let second = self.parse_identifier()?;
            (first, second)
        } else {
            (Identifier::new("_", first.span), first)
        };
        self.expect(TokenKind::In)?;
        let iterable = self.parse_expression()?;
        let body = self.parse_block()?;

        Ok(Stmt {
            span: start.merge(body.span),
            kind: StmtKind::ForIn {
                key,
                value,
                iterable,
                body,
            },
        })
    }

    // ---
    // Expressions
    // ---

    /// Parse an expression.
    pub fn parse_expression(&mut self) -> Result<Expr, ParseError> {
        self.parse_expr_precedence(Precedence::Lowest)
    }

    fn parse_expr_precedence(&mut self, min_prec: Precedence) -> Result<Expr, ParseError> {
        let mut left = self.parse_unary_expr()?;

        while let Some(prec) = Precedence::of_infix_token(self.current.kind) {
            if prec < min_prec || self.current.newline_before {
                break;
            }

            let next_prec = if prec.is_right_associative() {
                prec
            } else {
                prec.next()
            };

            left = self.parse_infix_expr(left, next_prec)?;
        }

        Ok(left)
    }

    fn parse_unary_expr(&mut self) -> Result<Expr, ParseError> {
        let op = match self.current.kind {
            TokenKind::Sub => UnaryOp::Neg,
            TokenKind::Add => UnaryOp::Plus,
            TokenKind::Not => UnaryOp::Not,
            TokenKind::Xor => UnaryOp::BitNot,
            _ => return self.parse_primary_expr(),
        };
        let start = self.advance().span;
        let operand = self.parse_expr_precedence(Precedence::Unary)?;
        let span = start.merge(operand.span);
        Ok(Expr::new(
            ExprKind::Unary {
                op,
                operand: Box::new(operand),
            },
            span,
        ))
    }

    fn parse_infix_expr(&mut self, left: Expr, prec: Precedence) -> Result<Expr, ParseError> {
        let start = left.span;

        match self.current.kind {
            TokenKind::Question => {
                self.advance();
                let then_expr = self.parse_expression()?;
                self.expect(TokenKind::Colon)?;
                let else_expr = self.parse_expr_precedence(prec)?;
                let span = start.merge(else_expr.span);
                Ok(Expr::new(
                    ExprKind::Cond {
                        cond: Box::new(left),
                        then_expr: Box::new(then_expr),
                        else_expr: Box::new(else_expr),
                    },
                    span,
                ))
            }

            // Function call
            TokenKind::LParen => {
                self.advance();
                let args = self.parse_call_args()?;
                let end = self.expect(TokenKind::RParen)?;
                Ok(Expr::new(
                    ExprKind::Call {
                        callee: Box::new(left),
                        args,
                    },
                    start.merge(end.span),
                ))
            }

            // Index or slice
            TokenKind::LBrack => self.parse_index_or_slice(left),

            // Selector
            TokenKind::Period => {
                self.advance();
                let field = self.parse_identifier()?;
                let span = start.merge(field.span);
                Ok(Expr::new(
                    ExprKind::Selector {
                        object: Box::new(left),
                        field,
                    },
                    span,
                ))
            }

            kind => match token_to_binary_op(kind) {
                Some(op) => {
                    self.advance();
                    let right = self.parse_expr_precedence(prec)?;
                    let span = start.merge(right.span);
                    Ok(Expr::new(
                        ExprKind::Binary {
                            op,
                            left: Box::new(left),
                            right: Box::new(right),
                        },
                        span,
                    ))
                }
                None => Err(self.unexpected("operator")),
            },
        }
    }

    fn parse_call_args(&mut self) -> Result<CallArgs, ParseError> {
        let mut args = CallArgs::default();

        while !self.check(TokenKind::RParen) && !self.check(TokenKind::Eof) {
            if self.check(TokenKind::Ident) && self.peek_is(TokenKind::Assign) {
                let name = self.parse_identifier()?;
                self.advance();
                if args.keyword_spread.is_some() {
                    return Err(self.error("keyword argument after keyword spread", name.span));
                }
                let value = self.parse_expression()?;
                args.keywords.push((name, value));
            } else {
                let expr = self.parse_expression()?;
                let spread = self.consume(TokenKind::Ellipsis);
                if args.keyword_spread.is_some() {
                    return Err(self.error("argument after keyword spread", expr.span));
                }
                if spread && (args.spread || !args.keywords.is_empty()) {
                    args.keyword_spread = Some(Box::new(expr));
                } else if args.spread || !args.keywords.is_empty() {
                    return Err(self.error(
                        "positional argument after spread or keyword argument",
                        expr.span,
                    ));
                } else {
                    args.positional.push(expr);
                    args.spread = spread;
                }
            }

            if !self.consume(TokenKind::Comma) {
                break;
            }
        }

        Ok(args)
    }

    fn parse_index_or_slice(&mut self, object: Expr) -> Result<Expr, ParseError> {
        let start = object.span;
        self.expect(TokenKind::LBrack)?;

        let low = if self.check(TokenKind::Colon) {
            None
        } else {
            Some(Box::new(self.parse_expression()?))
        };

        if self.consume(TokenKind::Colon) {
            let high = if self.check(TokenKind::RBrack) {
                None
            } else {
                Some(Box::new(self.parse_expression()?))
            };
            let end = self.expect(TokenKind::RBrack)?;
            return Ok(Expr::new(
                ExprKind::Slice {
                    object: Box::new(object),
                    low,
                    high,
                },
                start.merge(end.span),
            ));
        }

        let end = self.expect(TokenKind::RBrack)?;
        match low {
            Some(index) => Ok(Expr::new(
                ExprKind::Index {
                    object: Box::new(object),
                    index,
                },
                start.merge(end.span),
            )),
            None => Err(self.error("missing index expression", end.span)),
        }
    }

    fn parse_primary_expr(&mut self) -> Result<Expr, ParseError> {
        let start = self.current.span;

        match self.current.kind {
            TokenKind::Int
            | TokenKind::Float
            | TokenKind::String
            | TokenKind::RawString
            | TokenKind::Char
            | TokenKind::True
            | TokenKind::False
            | TokenKind::Undefined => self.parse_literal(),

            TokenKind::Ident => {
                let token = self.advance();
                Ok(Expr::new(ExprKind::Ident(self.symbol(token.span)), token.span))
            }

            TokenKind::LParen => {
                self.advance();
                let inner = self.parse_expression()?;
                let end = self.expect(TokenKind::RParen)?;
                Ok(Expr::new(ExprKind::Paren(Box::new(inner)), start.merge(end.span)))
            }

            TokenKind::LBrack => {
                self.advance();
                let mut elements = Vec::new();
                while !self.check(TokenKind::RBrack) && !self.check(TokenKind::Eof) {
                    elements.push(self.parse_expression()?);
                    if !self.consume(TokenKind::Comma) {
                        break;
                    }
                }
                let end = self.expect(TokenKind::RBrack)?;
                Ok(Expr::new(ExprKind::Array(elements), start.merge(end.span)))
            }

            TokenKind::LBrace => self.parse_map_literal(),
            TokenKind::Func => self.parse_func_literal(),

            TokenKind::Error | TokenKind::Immutable => {
                let keyword = self.advance();
                self.expect(TokenKind::LParen)?;
                let inner = Box::new(self.parse_expression()?);
                let end = self.expect(TokenKind::RParen)?;
                let kind = if keyword.kind == TokenKind::Error {
                    ExprKind::Error(inner)
                } else {
                    ExprKind::Immutable(inner)
                };
                Ok(Expr::new(kind, start.merge(end.span)))
            }

            TokenKind::Import => {
                self.advance();
                self.expect(TokenKind::LParen)?;
                let name_token = self.expect(TokenKind::String)?;
                let name = match parse_string(self.slice(name_token.span)) {
                    Ok(name) => name,
                    Err(e) => return Err(self.invalid_literal(e.to_string(), name_token.span)),
                };
                let end = self.expect(TokenKind::RParen)?;
                Ok(Expr::new(
                    ExprKind::Import(Symbol::from(name)),
                    start.merge(end.span),
                ))
            }

            _ => Err(self.unexpected("expression")),
        }
    }

    fn parse_literal(&mut self) -> Result<Expr, ParseError> {
        let token = self.advance();
        let text = self.slice(token.span);
        let literal = match token.kind {
            TokenKind::Int => parse_int(text)
                .map(Literal::Int)
                .map_err(|e| format!("{}: {}", text, e)),
            TokenKind::Float => parse_float(text)
                .map(Literal::Float)
                .map_err(|e| format!("{}: {}", text, e)),
            TokenKind::String => parse_string(text)
                .map(|s| Literal::String(s.into()))
                .map_err(|e| e.to_string()),
            TokenKind::RawString => Ok(Literal::String(parse_raw_string(text).into())),
            TokenKind::Char => parse_char(text)
                .map(Literal::Char)
                .map_err(|e| e.to_string()),
            TokenKind::True => Ok(Literal::Bool(true)),
            TokenKind::False => Ok(Literal::Bool(false)),
            _ => Ok(Literal::Undefined),
        };
        match literal {
            Ok(literal) => Ok(Expr::new(ExprKind::Literal(literal), token.span)),
            Err(message) => Err(self.invalid_literal(message, token.span)),
        }
    }

    fn parse_map_literal(&mut self) -> Result<Expr, ParseError> {
        let start = self.expect(TokenKind::LBrace)?.span;
        let mut entries = Vec::new();

        while !self.check(TokenKind::RBrace) && !self.check(TokenKind::Eof) {
            let key_token = self.advance();
            let key: Symbol = match key_token.kind {
                TokenKind::Ident => self.symbol(key_token.span),
                TokenKind::String => match parse_string(self.slice(key_token.span)) {
                    Ok(s) => Symbol::from(s),
                    Err(e) => return Err(self.invalid_literal(e.to_string(), key_token.span)),
                },
                TokenKind::RawString => {
                    Symbol::from(parse_raw_string(self.slice(key_token.span)))
                }
                other => {
                    return Err(self.record(ParseError::UnexpectedToken {
                        expected: "map key".to_string(),
                        found: other.name().to_string(),
                        span: key_token.span,
                    }))
                }
            };
            self.expect(TokenKind::Colon)?;
            let value = self.parse_expression()?;
            entries.push(MapEntry {
                key,
                key_span: key_token.span,
                value,
            });
            if !self.consume(TokenKind::Comma) {
                break;
            }
        }

        let end = self.expect(TokenKind::RBrace)?;
        Ok(Expr::new(ExprKind::Map(entries), start.merge(end.span)))
    }

    fn parse_func_literal(&mut self) -> Result<Expr, ParseError> {
        let start = self.expect(TokenKind::Func)?.span;
        self.expect(TokenKind::LParen)?;

        let mut params = Vec::new();
        let mut var_args = false;
        while !self.check(TokenKind::RParen) && !self.check(TokenKind::Eof) {
            params.push(self.parse_identifier()?);
            if self.consume(TokenKind::Ellipsis) {
                var_args = true;
                break;
            }
            if !self.consume(TokenKind::Comma) {
                break;
            }
        }
        self.expect(TokenKind::RParen)?;

        let body = self.parse_block()?;
        let span = start.merge(body.span);
        Ok(Expr::new(
            ExprKind::Func(FuncLit {
                params,
                var_args,
                body,
            }),
            span,
        ))
    }

    fn parse_identifier(&mut self) -> Result<Identifier, ParseError> {
        let token = self.expect(TokenKind::Ident)?;
        Ok(Identifier::new(self.symbol(token.span), token.span))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_expr(source: &str) -> Expr {
        let mut parser = Parser::new(source, 0);
        parser.parse_expression().unwrap()
    }

    fn parse_ok(source: &str) -> File {
        match parse(source, 0) {
            Ok(file) => file,
            Err(errors) => panic!("parse errors: {:?}", errors),
        }
    }

    #[test]
    fn test_literals() {
        assert!(matches!(parse_expr("42").kind, ExprKind::Literal(Literal::Int(42))));
        assert!(matches!(parse_expr("3.14").kind, ExprKind::Literal(Literal::Float(_))));
        assert!(matches!(parse_expr("true").kind, ExprKind::Literal(Literal::Bool(true))));
        assert!(matches!(parse_expr("'x'").kind, ExprKind::Literal(Literal::Char('x'))));
        assert!(matches!(parse_expr("undefined").kind, ExprKind::Literal(Literal::Undefined)));
        match parse_expr(r#""hi\n""#).kind {
            ExprKind::Literal(Literal::String(s)) => assert_eq!(&*s, "hi\n"),
            other => panic!("expected string, got {:?}", other),
        }
    }

    #[test]
    fn test_binary_precedence() {
        // 1 + 2 * 3 parses as 1 + (2 * 3)
        if let ExprKind::Binary { op, right, .. } = parse_expr("1 + 2 * 3").kind {
            assert_eq!(op, BinaryOp::Add);
            assert!(matches!(right.kind, ExprKind::Binary { op: BinaryOp::Mul, .. }));
        } else {
            panic!("expected binary expression");
        }

        // a || b && c parses as a || (b && c)
        if let ExprKind::Binary { op, right, .. } = parse_expr("a || b && c").kind {
            assert_eq!(op, BinaryOp::Or);
            assert!(matches!(right.kind, ExprKind::Binary { op: BinaryOp::And, .. }));
        } else {
            panic!("expected binary expression");
        }
    }

    #[test]
    fn test_left_associativity() {
        if let ExprKind::Binary { left, .. } = parse_expr("a - b - c").kind {
            assert!(matches!(left.kind, ExprKind::Binary { op: BinaryOp::Sub, .. }));
        } else {
            panic!("expected binary expression");
        }
    }

    #[test]
    fn test_unary_binds_tighter_than_binary() {
        if let ExprKind::Binary { op, left, .. } = parse_expr("-a * b").kind {
            assert_eq!(op, BinaryOp::Mul);
            assert!(matches!(left.kind, ExprKind::Unary { op: UnaryOp::Neg, .. }));
        } else {
            panic!("expected binary expression");
        }
    }

    #[test]
    fn test_ternary() {
        if let ExprKind::Cond { else_expr, .. } = parse_expr("a ? 1 : b ? 2 : 3").kind {
            assert!(matches!(else_expr.kind, ExprKind::Cond { .. }));
        } else {
            panic!("expected conditional expression");
        }
    }

    #[test]
    fn test_postfix_chain() {
        let expr = parse_expr("a.b[1](x)[2:]");
        match expr.kind {
            ExprKind::Slice { object, low, high } => {
                assert!(low.is_some());
                assert!(high.is_none());
                assert!(matches!(object.kind, ExprKind::Call { .. }));
            }
            other => panic!("expected slice, got {:?}", other),
        }
    }

    #[test]
    fn test_call_args() {
        let expr = parse_expr("f(1, rest..., key=2, opts...)");
        match expr.kind {
            ExprKind::Call { args, .. } => {
                assert_eq!(args.positional.len(), 2);
                assert!(args.spread);
                assert_eq!(args.keywords.len(), 1);
                assert_eq!(&*args.keywords[0].0.name, "key");
                assert!(args.keyword_spread.is_some());
            }
            other => panic!("expected call, got {:?}", other),
        }

        let mut parser = Parser::new("f(a=1, 2)", 0);
        assert!(parser.parse_expression().is_err());
    }

    #[test]
    fn test_literals_composite() {
        match parse_expr(r#"{a: 1, "b c": [1, 2,], }"#).kind {
            ExprKind::Map(entries) => {
                assert_eq!(entries.len(), 2);
                assert_eq!(&*entries[1].key, "b c");
                assert!(matches!(&entries[1].value.kind, ExprKind::Array(items) if items.len() == 2));
            }
            other => panic!("expected map, got {:?}", other),
        }

        match parse_expr("func(a, b...) { return a }").kind {
            ExprKind::Func(func) => {
                assert_eq!(func.params.len(), 2);
                assert!(func.var_args);
                assert_eq!(func.body.stmts.len(), 1);
            }
            other => panic!("expected func, got {:?}", other),
        }
    }

    #[test]
    fn test_newline_terminates_statements() {
        let file = parse_ok("a := 1\n-2\nb = a; c := 3");
        assert_eq!(file.stmts.len(), 4);
        assert!(matches!(file.stmts[1].kind, StmtKind::Expr(_)));
    }

    #[test]
    fn test_assignments() {
        let file = parse_ok("x := 1\nx += 2\nx++\nm.a[0] = 5");
        assert!(matches!(
            file.stmts[0].kind,
            StmtKind::Assign { op: AssignOp::Define, .. }
        ));
        assert!(matches!(
            file.stmts[1].kind,
            StmtKind::Assign { op: AssignOp::Compound(BinaryOp::Add), .. }
        ));
        assert!(matches!(file.stmts[2].kind, StmtKind::IncDec { increment: true, .. }));
        assert!(matches!(
            &file.stmts[3].kind,
            StmtKind::Assign { target: Expr { kind: ExprKind::Index { .. }, .. }, .. }
        ));
    }

    #[test]
    fn test_if_else_chain() {
        let file = parse_ok("if x := f(); x > 1 { a() } else if y { b() } else { c() }");
        match &file.stmts[0].kind {
            StmtKind::If {
                init, else_branch, ..
            } => {
                assert!(init.is_some());
                let else_branch = else_branch.as_ref().unwrap();
                assert!(matches!(else_branch.kind, StmtKind::If { .. }));
            }
            other => panic!("expected if, got {:?}", other),
        }
    }

    #[test]
    fn test_for_forms() {
        let file = parse_ok(
            "for { break }\nfor x < 3 { x++ }\nfor i := 0; i < 3; i++ { }\nfor v in arr { }\nfor k, v in m { continue }",
        );
        assert_eq!(file.stmts.len(), 5);
        assert!(matches!(
            file.stmts[0].kind,
            StmtKind::For { init: None, cond: None, post: None, .. }
        ));
        assert!(matches!(
            file.stmts[1].kind,
            StmtKind::For { init: None, cond: Some(_), post: None, .. }
        ));
        assert!(matches!(
            file.stmts[2].kind,
            StmtKind::For { init: Some(_), cond: Some(_), post: Some(_), .. }
        ));
        match &file.stmts[3].kind {
            StmtKind::ForIn { key, value, .. } => {
                assert!(key.is_blank());
                assert_eq!(&*value.name, "v");
            }
            other => panic!("expected for-in, got {:?}", other),
        }
    }

    #[test]
    fn test_import_export() {
        let file = parse_ok("m := import(\"math\")\nexport {a: m}");
        assert!(matches!(
            &file.stmts[0].kind,
            StmtKind::Assign { value: Expr { kind: ExprKind::Import(name), .. }, .. } if &**name == "math"
        ));
        assert!(matches!(file.stmts[1].kind, StmtKind::Export(_)));
    }

    #[test]
    fn test_missing_terminator() {
        let errors = parse("a := 1 b := 2", 0).unwrap_err();
        assert!(!errors.is_empty());
        assert!(errors[0].to_string().contains("';' or newline"));
    }

    #[test]
    fn test_error_cap() {
        let source = ")\n".repeat(50);
        let errors = parse(&source, 0).unwrap_err();
        assert_eq!(errors.len(), MAX_ERRORS);
    }

    #[test]
    fn test_stray_brace() {
        let errors = parse("a := 1\n}\nb := 2", 0).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].to_string().contains("unexpected '}'"));
    }
}
