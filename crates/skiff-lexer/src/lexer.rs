use logos::Logos;

use crate::{Span, Token, TokenKind};

/// Pull-based tokenizer over one source file with a single token of
/// lookahead.
///
/// Line breaks never become tokens. Each token instead carries
/// `newline_before`, which the parser uses for automatic semicolons.
pub struct Lexer<'src> {
    logos: logos::Lexer<'src, TokenKind>,
    source: &'src str,
    file_id: u16,
    lookahead: Option<Token>,
    prev_end: usize,
    done: bool,
}

impl<'src> Lexer<'src> {
    pub fn new(source: &'src str, file_id: u16) -> Self {
        Lexer {
            logos: TokenKind::lexer(source),
            source,
            file_id,
            lookahead: None,
            prev_end: 0,
            done: false,
        }
    }

    pub fn source(&self) -> &'src str {
        self.source
    }

    pub fn file_id(&self) -> u16 {
        self.file_id
    }

    /// Consume one token. Once input is exhausted every call yields `Eof`.
    pub fn next_token(&mut self) -> Token {
        if let Some(token) = self.lookahead.take() {
            return token;
        }
        let (kind, range) = match self.done {
            true => (TokenKind::Eof, self.source.len()..self.source.len()),
            false => match self.logos.next() {
                Some(result) => (result.unwrap_or(TokenKind::Illegal), self.logos.span()),
                None => {
                    self.done = true;
                    (TokenKind::Eof, self.source.len()..self.source.len())
                }
            },
        };
        let skipped = &self.source[self.prev_end.min(range.start)..range.start];
        self.prev_end = range.end;
        Token {
            kind,
            span: Span::new(range.start, range.end, self.file_id),
            newline_before: skipped.contains('\n'),
        }
    }

    pub fn peek(&mut self) -> &Token {
        let token = match self.lookahead.take() {
            Some(token) => token,
            None => self.next_token(),
        };
        self.lookahead.insert(token)
    }

    pub fn check(&mut self, kind: TokenKind) -> bool {
        self.peek().kind == kind
    }

    pub fn slice(&self, span: Span) -> &'src str {
        &self.source[span.range()]
    }

    /// Every remaining token, `Eof` included.
    pub fn collect_all(&mut self) -> Vec<Token> {
        let mut tokens = Vec::new();
        loop {
            let token = self.next_token();
            let last = token.kind == TokenKind::Eof;
            tokens.push(token);
            if last {
                return tokens;
            }
        }
    }
}
