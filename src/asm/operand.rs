//! Operand classifier: turns the token soup between commas into a tagged
//! variant the encoder can pattern-match on.

use std::fmt;

use miette::Result;

use crate::error;
use crate::lexer::{LiteralKind, Token, TokenKind};
use crate::span::Span;

/// 8-bit registers, including the index-register halves.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Reg8 {
    B,
    C,
    D,
    E,
    H,
    L,
    A,
    I,
    R,
    Ixh,
    Ixl,
    Iyh,
    Iyl,
}

impl Reg8 {
    /// Opcode register field, where encodable (I and R live on the ED page).
    pub fn code(self) -> Option<u8> {
        match self {
            Reg8::B => Some(0),
            Reg8::C => Some(1),
            Reg8::D => Some(2),
            Reg8::E => Some(3),
            Reg8::H | Reg8::Ixh | Reg8::Iyh => Some(4),
            Reg8::L | Reg8::Ixl | Reg8::Iyl => Some(5),
            Reg8::A => Some(7),
            Reg8::I | Reg8::R => None,
        }
    }

    /// Index prefix byte demanded by the register half, if any.
    pub fn prefix(self) -> Option<u8> {
        match self {
            Reg8::Ixh | Reg8::Ixl => Some(0xDD),
            Reg8::Iyh | Reg8::Iyl => Some(0xFD),
            _ => None,
        }
    }

    fn from_name(name: &str) -> Option<Reg8> {
        Some(match name {
            "B" => Reg8::B,
            "C" => Reg8::C,
            "D" => Reg8::D,
            "E" => Reg8::E,
            "H" => Reg8::H,
            "L" => Reg8::L,
            "A" => Reg8::A,
            "I" => Reg8::I,
            "R" => Reg8::R,
            "IXH" => Reg8::Ixh,
            "IXL" => Reg8::Ixl,
            "IYH" => Reg8::Iyh,
            "IYL" => Reg8::Iyl,
            _ => return None,
        })
    }
}

/// 16-bit register pairs and index registers.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Reg16 {
    Bc,
    De,
    Hl,
    Sp,
    Af,
    AfShadow,
    Ix,
    Iy,
}

impl Reg16 {
    /// Opcode pair field for the BC/DE/HL/SP family (IX/IY share the HL
    /// slot behind their prefix).
    pub fn rp(self) -> Option<u8> {
        match self {
            Reg16::Bc => Some(0),
            Reg16::De => Some(1),
            Reg16::Hl | Reg16::Ix | Reg16::Iy => Some(2),
            Reg16::Sp => Some(3),
            _ => None,
        }
    }

    pub fn prefix(self) -> Option<u8> {
        match self {
            Reg16::Ix => Some(0xDD),
            Reg16::Iy => Some(0xFD),
            _ => None,
        }
    }

    fn from_name(name: &str) -> Option<Reg16> {
        Some(match name {
            "BC" => Reg16::Bc,
            "DE" => Reg16::De,
            "HL" => Reg16::Hl,
            "SP" => Reg16::Sp,
            "AF" => Reg16::Af,
            "AF'" => Reg16::AfShadow,
            "IX" => Reg16::Ix,
            "IY" => Reg16::Iy,
            _ => return None,
        })
    }
}

/// Branch conditions in opcode order.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Cond {
    Nz,
    Z,
    Nc,
    C,
    Po,
    Pe,
    P,
    M,
}

impl Cond {
    pub fn code(self) -> u8 {
        match self {
            Cond::Nz => 0,
            Cond::Z => 1,
            Cond::Nc => 2,
            Cond::C => 3,
            Cond::Po => 4,
            Cond::Pe => 5,
            Cond::P => 6,
            Cond::M => 7,
        }
    }

    fn from_name(name: &str) -> Option<Cond> {
        Some(match name {
            "NZ" => Cond::Nz,
            "Z" => Cond::Z,
            "NC" => Cond::Nc,
            "C" => Cond::C,
            "PO" => Cond::Po,
            "PE" => Cond::Pe,
            "P" => Cond::P,
            "M" => Cond::M,
            _ => return None,
        })
    }
}

/// A number, or a symbol resolved against the label table.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Term {
    Num(i32),
    Sym(String),
}

/// One-level arithmetic: an optionally negated term, plus or minus another.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Expr {
    pub negate: bool,
    pub first: Term,
    pub rest: Option<(bool, Term)>,
    pub span: Span,
}

/// Classified operand.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Operand {
    R8(Reg8),
    R16(Reg16),
    Cond(Cond),
    /// Immediate value or address expression
    Imm(Expr),
    /// `(expr)` memory reference
    Ind(Expr),
    /// `(BC)`, `(DE)`, `(HL)`, `(SP)`, `(IX)`, `(IY)`
    IndR16(Reg16),
    /// `(C)` port reference
    IndC,
    /// `(IX+d)` / `(IY+d)`
    Idx(Reg16, Expr),
    /// String literal, only meaningful to DB
    Str(String, Span),
}

impl Operand {
    /// Conditions overlap the register namespace on `C`; branch handlers
    /// reinterpret through this.
    pub fn as_cond(&self) -> Option<Cond> {
        match self {
            Operand::Cond(cond) => Some(*cond),
            Operand::R8(Reg8::C) => Some(Cond::C),
            _ => None,
        }
    }
}

/// Parse the tokens of a single operand (the text between commas).
pub fn parse_operand(toks: &[Token], src: &str) -> Result<Operand> {
    let [first, rest @ ..] = toks else {
        return Err(error::unexpected_token("an operand", Span::dummy(), src));
    };

    // parenthesised operands: memory, port or indexed reference
    if first.kind == TokenKind::LParen {
        let Some((last, inner)) = rest.split_last() else {
            return Err(error::unexpected_token("`)`", first.span, src));
        };
        if last.kind != TokenKind::RParen {
            return Err(error::unexpected_token("`)`", last.span, src));
        }
        if let [tok] = inner {
            if tok.kind == TokenKind::Ident {
                let name = text(tok, src).to_uppercase();
                match Reg16::from_name(&name) {
                    Some(Reg16::Af) | Some(Reg16::AfShadow) => {
                        return Err(error::unexpected_token("an addressable pair", tok.span, src))
                    }
                    Some(reg) => return Ok(Operand::IndR16(reg)),
                    None => {}
                }
                if Reg8::from_name(&name) == Some(Reg8::C) {
                    return Ok(Operand::IndC);
                }
            }
        }
        if let [base, sign, disp @ ..] = inner {
            if base.kind == TokenKind::Ident
                && matches!(sign.kind, TokenKind::Plus | TokenKind::Minus)
            {
                let name = text(base, src).to_uppercase();
                if let reg @ (Some(Reg16::Ix) | Some(Reg16::Iy)) = Reg16::from_name(&name) {
                    let mut expr = parse_expr(disp, src)?;
                    if sign.kind == TokenKind::Minus {
                        expr.negate = !expr.negate;
                        if let Some((sub, _)) = &mut expr.rest {
                            *sub = !*sub;
                        }
                    }
                    expr.span = base.span.join(expr.span);
                    return Ok(Operand::Idx(reg.unwrap(), expr));
                }
            }
        }
        return Ok(Operand::Ind(parse_expr(inner, src)?));
    }

    // bare register, condition or string
    if rest.is_empty() {
        match first.kind {
            TokenKind::Ident => {
                let name = text(first, src).to_uppercase();
                if let Some(reg) = Reg8::from_name(&name) {
                    return Ok(Operand::R8(reg));
                }
                if let Some(reg) = Reg16::from_name(&name) {
                    return Ok(Operand::R16(reg));
                }
                if let Some(cond) = Cond::from_name(&name) {
                    return Ok(Operand::Cond(cond));
                }
            }
            TokenKind::Lit(LiteralKind::Str) => {
                let raw = text(first, src);
                return Ok(Operand::Str(unescape(&raw[1..raw.len() - 1]), first.span));
            }
            _ => {}
        }
    }

    // anything else is an expression
    Ok(Operand::Imm(parse_expr(toks, src)?))
}

/// Parse `[-] term [(+|-) term]`.
pub fn parse_expr(toks: &[Token], src: &str) -> Result<Expr> {
    let mut toks = toks;
    let mut negate = false;
    if let Some(first) = toks.first() {
        if first.kind == TokenKind::Minus {
            negate = true;
            toks = &toks[1..];
        }
    }
    let [first_tok, rest @ ..] = toks else {
        return Err(error::unexpected_token("an expression", Span::dummy(), src));
    };
    let first = parse_term(first_tok, src)?;
    let mut span = first_tok.span;

    let rest = match rest {
        [] => None,
        [sign, term_tok] if matches!(sign.kind, TokenKind::Plus | TokenKind::Minus) => {
            span = span.join(term_tok.span);
            Some((sign.kind == TokenKind::Minus, parse_term(term_tok, src)?))
        }
        [bad, ..] => return Err(error::unexpected_token("`+` or `-`", bad.span, src)),
    };

    Ok(Expr {
        negate,
        first,
        rest,
        span,
    })
}

fn parse_term(tok: &Token, src: &str) -> Result<Term> {
    let raw = text(tok, src);
    match tok.kind {
        TokenKind::Lit(LiteralKind::Hex) => i32::from_str_radix(&raw[2..], 16)
            .ok()
            .filter(|v| *v <= 0xFFFF)
            .map(Term::Num)
            .ok_or_else(|| error::bad_number(raw, tok.span, src)),
        TokenKind::Lit(LiteralKind::Dec) => raw
            .parse::<i32>()
            .ok()
            .filter(|v| *v <= 0xFFFF)
            .map(Term::Num)
            .ok_or_else(|| error::bad_number(raw, tok.span, src)),
        TokenKind::Lit(LiteralKind::Char) => {
            let inner = unescape(&raw[1..raw.len() - 1]);
            let mut chars = inner.chars();
            match (chars.next(), chars.next()) {
                (Some(c), None) if (c as u32) < 0x100 => Ok(Term::Num(c as i32)),
                _ => Err(error::bad_number(raw, tok.span, src)),
            }
        }
        TokenKind::Ident => Ok(Term::Sym(raw.to_uppercase())),
        TokenKind::Unknown => Err(error::lex_unknown(tok.span, src)),
        _ => Err(error::unexpected_token("a number or label", tok.span, src)),
    }
}

fn text<'a>(tok: &Token, src: &'a str) -> &'a str {
    &src[tok.span.as_range()]
}

/// Resolve backslash escapes in char and string literals.
pub fn unescape(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            result.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => result.push('\n'),
            Some('t') => result.push('\t'),
            Some('r') => result.push('\r'),
            Some('0') => result.push('\0'),
            Some(other) => result.push(other),
            None => result.push('\\'),
        }
    }
    result
}

impl fmt::Display for Reg8 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Reg8::B => "B",
            Reg8::C => "C",
            Reg8::D => "D",
            Reg8::E => "E",
            Reg8::H => "H",
            Reg8::L => "L",
            Reg8::A => "A",
            Reg8::I => "I",
            Reg8::R => "R",
            Reg8::Ixh => "IXH",
            Reg8::Ixl => "IXL",
            Reg8::Iyh => "IYH",
            Reg8::Iyl => "IYL",
        };
        f.write_str(name)
    }
}

impl fmt::Display for Reg16 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Reg16::Bc => "BC",
            Reg16::De => "DE",
            Reg16::Hl => "HL",
            Reg16::Sp => "SP",
            Reg16::Af => "AF",
            Reg16::AfShadow => "AF'",
            Reg16::Ix => "IX",
            Reg16::Iy => "IY",
        };
        f.write_str(name)
    }
}

impl fmt::Display for Cond {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Cond::Nz => "NZ",
            Cond::Z => "Z",
            Cond::Nc => "NC",
            Cond::C => "C",
            Cond::Po => "PO",
            Cond::Pe => "PE",
            Cond::P => "P",
            Cond::M => "M",
        };
        f.write_str(name)
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Term::Num(val) => write!(f, "{val}"),
            Term::Sym(name) => f.write_str(name),
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.negate {
            f.write_str("-")?;
        }
        write!(f, "{}", self.first)?;
        if let Some((sub, term)) = &self.rest {
            write!(f, "{}{}", if *sub { "-" } else { "+" }, term)?;
        }
        Ok(())
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::R8(reg) => write!(f, "{reg}"),
            Operand::R16(reg) => write!(f, "{reg}"),
            Operand::Cond(cond) => write!(f, "{cond}"),
            Operand::Imm(expr) => write!(f, "{expr}"),
            Operand::Ind(expr) => write!(f, "({expr})"),
            Operand::IndR16(reg) => write!(f, "({reg})"),
            Operand::IndC => f.write_str("(C)"),
            Operand::Idx(reg, expr) => write!(f, "({reg}+{expr})"),
            Operand::Str(text, _) => write!(f, "{text:?}"),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::lexer::tokenize_line;

    fn operand(src: &str) -> Operand {
        parse_operand(&tokenize_line(src, 0), src).unwrap()
    }

    #[test]
    fn classify_registers() {
        assert_eq!(operand("a"), Operand::R8(Reg8::A));
        assert_eq!(operand("IXH"), Operand::R8(Reg8::Ixh));
        assert_eq!(operand("hl"), Operand::R16(Reg16::Hl));
        assert_eq!(operand("AF'"), Operand::R16(Reg16::AfShadow));
    }

    #[test]
    fn classify_conditions() {
        assert_eq!(operand("NZ"), Operand::Cond(Cond::Nz));
        assert_eq!(operand("pe"), Operand::Cond(Cond::Pe));
        // C classifies as a register and reinterprets in branch position
        assert_eq!(operand("C").as_cond(), Some(Cond::C));
    }

    #[test]
    fn classify_indirect() {
        assert_eq!(operand("(HL)"), Operand::IndR16(Reg16::Hl));
        assert_eq!(operand("(C)"), Operand::IndC);
        match operand("(0x8000)") {
            Operand::Ind(expr) => assert_eq!(expr.first, Term::Num(0x8000)),
            other => panic!("expected indirect, got {other:?}"),
        }
    }

    #[test]
    fn classify_indexed() {
        match operand("(IX+5)") {
            Operand::Idx(Reg16::Ix, expr) => {
                assert!(!expr.negate);
                assert_eq!(expr.first, Term::Num(5));
            }
            other => panic!("expected indexed, got {other:?}"),
        }
        match operand("(IY-2)") {
            Operand::Idx(Reg16::Iy, expr) => assert!(expr.negate),
            other => panic!("expected indexed, got {other:?}"),
        }
    }

    #[test]
    fn expressions_resolve_symbols_later() {
        match operand("table + 2") {
            Operand::Imm(expr) => {
                assert_eq!(expr.first, Term::Sym("TABLE".into()));
                assert_eq!(expr.rest, Some((false, Term::Num(2))));
            }
            other => panic!("expected immediate, got {other:?}"),
        }
    }

    #[test]
    fn char_and_string_literals() {
        match operand("'A'") {
            Operand::Imm(expr) => assert_eq!(expr.first, Term::Num(0x41)),
            other => panic!("expected immediate, got {other:?}"),
        }
        match operand(r#""hi\n""#) {
            Operand::Str(text, _) => assert_eq!(text, "hi\n"),
            other => panic!("expected string, got {other:?}"),
        }
    }

    #[test]
    fn rejects_oversized_literal() {
        let toks = tokenize_line("99999999", 0);
        assert!(parse_operand(&toks, "99999999").is_err());
    }
}
