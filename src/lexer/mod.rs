use lazy_static::lazy_static;
use regex::Regex;

use crate::lexer::cursor::Cursor;
use crate::span::{Idx, Span};

pub mod cursor;

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Token {
    pub kind: TokenKind,
    pub span: Span,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum LiteralKind {
    Hex,
    Dec,
    Char,
    Str,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TokenKind {
    /// Identifier with a trailing `:`, e.g. `loop:`
    Label,
    /// Mnemonic, register, condition or symbol reference
    Ident,
    Lit(LiteralKind),
    Comma,
    LParen,
    RParen,
    Plus,
    Minus,
    /// Bare `:` separating statements on one line
    Sep,
    /// Whitespace
    Junk,
    Comment,
    Unknown,
    Eof,
}

impl std::fmt::Display for TokenKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TokenKind::Label => "label",
            TokenKind::Ident => "identifier",
            TokenKind::Lit(LiteralKind::Hex) => "hex literal",
            TokenKind::Lit(LiteralKind::Dec) => "decimal literal",
            TokenKind::Lit(LiteralKind::Char) => "char literal",
            TokenKind::Lit(LiteralKind::Str) => "string literal",
            TokenKind::Comma => "`,`",
            TokenKind::LParen => "`(`",
            TokenKind::RParen => "`)`",
            TokenKind::Plus => "`+`",
            TokenKind::Minus => "`-`",
            TokenKind::Sep => "`:`",
            TokenKind::Junk => "whitespace",
            TokenKind::Comment => "comment",
            TokenKind::Unknown => "unknown token",
            TokenKind::Eof => "end of line",
        };
        f.write_str(s)
    }
}

lazy_static! {
    // Order is important since some patterns are subpatterns of others.
    // Do NOT rearrange without a good hard think.
    static ref PATTERNS: Vec<(TokenKind, Regex)> = vec![
        (TokenKind::Junk, Regex::new(r"^[ \t]+").unwrap()),
        (TokenKind::Comment, Regex::new(r"^;.*").unwrap()),
        (
            TokenKind::Lit(LiteralKind::Hex),
            Regex::new(r"^0[xX][0-9a-fA-F]+\b").unwrap(),
        ),
        (
            TokenKind::Lit(LiteralKind::Dec),
            Regex::new(r"^[0-9]+\b").unwrap(),
        ),
        (
            TokenKind::Lit(LiteralKind::Char),
            Regex::new(r"^'([^'\\]|\\.)'").unwrap(),
        ),
        (
            TokenKind::Lit(LiteralKind::Str),
            Regex::new(r#"^"([^"\\]|\\.)*""#).unwrap(),
        ),
        // Label definitions carry the colon; `AF'` keeps its tick.
        (TokenKind::Label, Regex::new(r"^[a-zA-Z_]\w*:").unwrap()),
        (TokenKind::Ident, Regex::new(r"^[a-zA-Z_]\w*'?").unwrap()),
        (TokenKind::Comma, Regex::new(r"^,").unwrap()),
        (TokenKind::LParen, Regex::new(r"^\(").unwrap()),
        (TokenKind::RParen, Regex::new(r"^\)").unwrap()),
        (TokenKind::Plus, Regex::new(r"^\+").unwrap()),
        (TokenKind::Minus, Regex::new(r"^-").unwrap()),
        (TokenKind::Sep, Regex::new(r"^:").unwrap()),
    ];
}

impl Cursor<'_> {
    pub fn advance_token(&mut self) -> Token {
        if self.is_eof() {
            return Token {
                kind: TokenKind::Eof,
                span: Span::new(Idx(self.abs_pos()), 0),
            };
        }

        for (kind, re) in PATTERNS.iter() {
            if let Some(tok) = re.find(self.rest()) {
                let token = Token {
                    kind: *kind,
                    span: Span::new(Idx(self.abs_pos()), tok.len() as u32),
                };
                self.advance(tok.len());
                return token;
            }
        }

        let start = self.abs_pos();
        self.bump();
        Token {
            kind: TokenKind::Unknown,
            span: Span::new(Idx(start), self.abs_pos() - start),
        }
    }
}

/// Lex one source line into tokens, dropping whitespace and comments.
/// `base` is the byte offset of the line within the full source.
pub fn tokenize_line(line: &str, base: u32) -> Vec<Token> {
    let mut cursor = Cursor::new(line, base);
    let mut toks = Vec::new();
    loop {
        let token = cursor.advance_token();
        match token.kind {
            TokenKind::Eof => break,
            TokenKind::Junk | TokenKind::Comment => continue,
            _ => toks.push(token),
        }
    }
    toks
}

#[cfg(test)]
mod test {
    use super::*;

    fn kinds(src: &str) -> Vec<TokenKind> {
        tokenize_line(src, 0).iter().map(|t| t.kind).collect()
    }

    #[test]
    fn lex_instruction() {
        assert_eq!(
            kinds("LD A, 0x10"),
            vec![
                TokenKind::Ident,
                TokenKind::Ident,
                TokenKind::Comma,
                TokenKind::Lit(LiteralKind::Hex)
            ]
        );
    }

    #[test]
    fn lex_label_and_separator() {
        assert_eq!(
            kinds("loop: INC A : DJNZ loop"),
            vec![
                TokenKind::Label,
                TokenKind::Ident,
                TokenKind::Ident,
                TokenKind::Sep,
                TokenKind::Ident,
                TokenKind::Ident,
            ]
        );
    }

    #[test]
    fn lex_indexed_operand() {
        assert_eq!(
            kinds("LD (IX+5), B"),
            vec![
                TokenKind::Ident,
                TokenKind::LParen,
                TokenKind::Ident,
                TokenKind::Plus,
                TokenKind::Lit(LiteralKind::Dec),
                TokenKind::RParen,
                TokenKind::Comma,
                TokenKind::Ident,
            ]
        );
    }

    #[test]
    fn lex_shadow_pair() {
        let toks = tokenize_line("EX AF, AF'", 0);
        assert_eq!(toks[2].kind, TokenKind::Ident);
        assert_eq!(toks[2].span.len(), 3);
    }

    #[test]
    fn lex_comment_dropped() {
        assert_eq!(kinds("NOP ; does nothing"), vec![TokenKind::Ident]);
    }

    #[test]
    fn lex_trailing_hex_garbage() {
        // `0x` with no digits does not lex as a number
        assert!(kinds("0x").contains(&TokenKind::Unknown));
    }

    #[test]
    fn lex_spans_are_absolute() {
        let toks = tokenize_line("ADD A, 20", 100);
        assert_eq!(toks[0].span.offs(), 100);
        assert_eq!(toks[2].span.offs(), 105);
    }
}
