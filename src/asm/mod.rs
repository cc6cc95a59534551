//! Two-pass assembler.
//!
//! Pass 1 walks the statements, collects labels and sizes every instruction
//! with tolerant symbol resolution (unresolved symbols read as zero, which
//! cannot change an encoding's length). Pass 2 encodes strictly into a flat
//! 64KB image, recording the PC-to-line map and the listing as it goes.

use fxhash::FxHashMap;
use miette::Result;

use crate::error;
use crate::lexer::{tokenize_line, Token, TokenKind};
use crate::memory::MEMORY_MAX;
use crate::span::Span;

pub mod encode;
pub mod operand;

use encode::Encoder;
use operand::{parse_operand, Operand};

/// Everything an assemble run produces.
#[derive(Debug)]
pub struct Assembly {
    /// Flat image from address zero up to the high-water mark.
    pub image: Vec<u8>,
    /// Label and EQU values, keys uppercased.
    pub labels: FxHashMap<String, u16>,
    /// Start address of each encoded statement to its 1-based source line.
    pub line_map: FxHashMap<u16, u32>,
    /// Human-readable `addr | bytes | line | source` listing.
    pub listing: String,
}

/// A mnemonic with its operands.
#[derive(Debug)]
pub struct Op {
    pub name: String,
    pub span: Span,
    pub operands: Vec<Operand>,
}

/// One statement: an optional label and an optional instruction/directive.
#[derive(Debug)]
pub struct Stmt {
    pub line: u32,
    pub span: Span,
    pub label: Option<(String, Span)>,
    pub op: Option<Op>,
}

/// Assemble Z80 source into an image, label table, line map and listing.
pub fn assemble(src: &str) -> Result<Assembly> {
    let stmts = parse(src)?;

    // Pass 1: collect labels, size statements
    let mut labels: FxHashMap<String, u16> = FxHashMap::default();
    let mut addrs = Vec::with_capacity(stmts.len());
    let mut addr: u32 = 0;
    for stmt in &stmts {
        let is_equ = matches!(&stmt.op, Some(op) if op.name == "EQU");
        if let Some((name, span)) = &stmt.label {
            let value = if is_equ {
                let strict = Encoder {
                    labels: &labels,
                    tolerant: false,
                    src,
                };
                match stmt.op.as_ref().unwrap().operands.as_slice() {
                    [Operand::Imm(e)] => {
                        let val = strict.eval(e)?;
                        if !(-32768..=65535).contains(&val) {
                            return Err(error::value_range(val as i64, "a 16-bit word", e.span, src));
                        }
                        val as u16
                    }
                    _ => {
                        let op = stmt.op.as_ref().unwrap();
                        return Err(error::unexpected_token("a constant expression", op.span, src));
                    }
                }
            } else {
                addr as u16
            };
            if labels.insert(name.clone(), value).is_some() {
                return Err(error::duplicate_label(name, *span, src));
            }
        }
        let Some(op) = &stmt.op else {
            addrs.push(addr as u16);
            continue;
        };
        match op.name.as_str() {
            "EQU" => {
                if stmt.label.is_none() {
                    return Err(error::misplaced_directive("EQU", op.span, src));
                }
                addrs.push(addr as u16);
            }
            "ORG" => {
                let strict = Encoder {
                    labels: &labels,
                    tolerant: false,
                    src,
                };
                let target = match op.operands.as_slice() {
                    [Operand::Imm(e)] => strict.eval(e)?,
                    _ => return Err(error::unexpected_token("an address expression", op.span, src)),
                };
                if !(0..MEMORY_MAX as i32).contains(&target) {
                    return Err(error::value_range(target as i64, "an address", op.span, src));
                }
                addr = target as u32;
                addrs.push(addr as u16);
            }
            _ => {
                let sizing = Encoder {
                    labels: &labels,
                    tolerant: true,
                    src,
                };
                addrs.push(addr as u16);
                addr += sizing.encode(op, addr as u16)?.len() as u32;
                if addr > MEMORY_MAX as u32 {
                    return Err(error::value_range(addr as i64, "the 64KB address space", op.span, src));
                }
            }
        }
    }

    // Pass 2: strict encode into the image
    let encoder = Encoder {
        labels: &labels,
        tolerant: false,
        src,
    };
    let mut buf = vec![0u8; MEMORY_MAX];
    let mut high_water = 0usize;
    let mut line_map: FxHashMap<u16, u32> = FxHashMap::default();
    let mut listing = String::new();
    for (stmt, &addr) in stmts.iter().zip(&addrs) {
        let mut bytes = Vec::new();
        if let Some(op) = &stmt.op {
            if op.name != "EQU" && op.name != "ORG" {
                bytes = encoder.encode(op, addr)?;
                buf[addr as usize..addr as usize + bytes.len()].copy_from_slice(&bytes);
                high_water = high_water.max(addr as usize + bytes.len());
                line_map.entry(addr).or_insert(stmt.line);
            }
        }
        push_listing_row(&mut listing, addr, &bytes, stmt, src);
    }
    buf.truncate(high_water);

    Ok(Assembly {
        image: buf,
        labels,
        line_map,
        listing,
    })
}

fn push_listing_row(listing: &mut String, addr: u16, bytes: &[u8], stmt: &Stmt, src: &str) {
    use std::fmt::Write as _;
    let rendered = bytes
        .iter()
        .take(6)
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(" ");
    let source = &src[stmt.span.as_range()];
    let _ = writeln!(
        listing,
        "{addr:04X} | {rendered:<17} | {line:4} | {source}",
        line = stmt.line
    );
}

/// Split the source into statements: lines, then ` : `-separated chunks,
/// each an optional label plus an optional mnemonic with comma-separated
/// operands.
fn parse(src: &str) -> Result<Vec<Stmt>> {
    let mut stmts = Vec::new();
    let mut offset = 0u32;
    for (idx, raw) in src.split('\n').enumerate() {
        let line = raw.strip_suffix('\r').unwrap_or(raw);
        let toks = tokenize_line(line, offset);
        offset += raw.len() as u32 + 1;
        for chunk in toks.split(|tok| tok.kind == TokenKind::Sep) {
            if let Some(stmt) = parse_stmt(chunk, idx as u32 + 1, src)? {
                stmts.push(stmt);
            }
        }
    }
    Ok(stmts)
}

fn parse_stmt(toks: &[Token], line: u32, src: &str) -> Result<Option<Stmt>> {
    if let Some(bad) = toks.iter().find(|tok| tok.kind == TokenKind::Unknown) {
        return Err(error::lex_unknown(bad.span, src));
    }
    let mut toks = toks;
    let span = match (toks.first(), toks.last()) {
        (Some(first), Some(last)) => first.span.join(last.span),
        _ => return Ok(None),
    };

    let mut label = None;
    if toks[0].kind == TokenKind::Label {
        let text = &src[toks[0].span.as_range()];
        let name = text[..text.len() - 1].to_uppercase();
        label = Some((name, toks[0].span));
        toks = &toks[1..];
    }

    let op = match toks {
        [] => None,
        [head, rest @ ..] if head.kind == TokenKind::Ident => {
            let name = src[head.span.as_range()].to_uppercase();
            let mut operands = Vec::new();
            if !rest.is_empty() {
                for group in rest.split(|tok| tok.kind == TokenKind::Comma) {
                    operands.push(parse_operand(group, src)?);
                }
            }
            Some(Op {
                name,
                span,
                operands,
            })
        }
        [head, ..] => return Err(error::unexpected_token("a mnemonic or directive", head.span, src)),
    };

    Ok(Some(Stmt {
        line,
        span,
        label,
        op,
    }))
}

#[cfg(test)]
mod test {
    use super::*;

    fn image(src: &str) -> Vec<u8> {
        assemble(src).unwrap().image
    }

    #[test]
    fn encode_basic_loads() {
        assert_eq!(image("LD A, 10"), vec![0x3E, 0x0A]);
        assert_eq!(image("LD B, C"), vec![0x41]);
        assert_eq!(image("LD (HL), A"), vec![0x77]);
        assert_eq!(image("LD HL, 0x1234"), vec![0x21, 0x34, 0x12]);
        assert_eq!(image("LD SP, HL"), vec![0xF9]);
        assert_eq!(image("LD A, (BC)"), vec![0x0A]);
        assert_eq!(image("LD (0x8000), A"), vec![0x32, 0x00, 0x80]);
        assert_eq!(image("LD A, I"), vec![0xED, 0x57]);
    }

    #[test]
    fn encode_indexed_loads() {
        assert_eq!(image("LD A, (IX+5)"), vec![0xDD, 0x7E, 0x05]);
        assert_eq!(image("LD (IY-2), B"), vec![0xFD, 0x70, 0xFE]);
        assert_eq!(image("LD (IX+1), 0x42"), vec![0xDD, 0x36, 0x01, 0x42]);
        assert_eq!(image("LD IXH, 0x12"), vec![0xDD, 0x26, 0x12]);
        assert_eq!(image("LD IX, 0x4000"), vec![0xDD, 0x21, 0x00, 0x40]);
        assert_eq!(image("LD H, (IX+0)"), vec![0xDD, 0x66, 0x00]);
    }

    #[test]
    fn encode_sixteen_bit_memory() {
        assert_eq!(image("LD (0x9000), HL"), vec![0x22, 0x00, 0x90]);
        assert_eq!(image("LD HL, (0x9000)"), vec![0x2A, 0x00, 0x90]);
        assert_eq!(image("LD (0x9000), BC"), vec![0xED, 0x43, 0x00, 0x90]);
        assert_eq!(image("LD SP, (0x9000)"), vec![0xED, 0x7B, 0x00, 0x90]);
    }

    #[test]
    fn encode_alu_forms() {
        assert_eq!(image("ADD A, 20"), vec![0xC6, 0x14]);
        assert_eq!(image("ADD A, B"), vec![0x80]);
        assert_eq!(image("SUB (HL)"), vec![0x96]);
        assert_eq!(image("SUB A, B"), vec![0x90]);
        assert_eq!(image("XOR A"), vec![0xAF]);
        assert_eq!(image("CP 0x2A"), vec![0xFE, 0x2A]);
        assert_eq!(image("ADC A, (IX+3)"), vec![0xDD, 0x8E, 0x03]);
        assert_eq!(image("ADD HL, DE"), vec![0x19]);
        assert_eq!(image("ADD IX, IX"), vec![0xDD, 0x29]);
        assert_eq!(image("ADC HL, BC"), vec![0xED, 0x4A]);
        assert_eq!(image("SBC HL, SP"), vec![0xED, 0x72]);
    }

    #[test]
    fn encode_inc_dec() {
        assert_eq!(image("INC A"), vec![0x3C]);
        assert_eq!(image("DEC (HL)"), vec![0x35]);
        assert_eq!(image("INC (IX+4)"), vec![0xDD, 0x34, 0x04]);
        assert_eq!(image("INC BC"), vec![0x03]);
        assert_eq!(image("DEC IY"), vec![0xFD, 0x2B]);
    }

    #[test]
    fn encode_stack_and_exchange() {
        assert_eq!(image("PUSH BC"), vec![0xC5]);
        assert_eq!(image("POP AF"), vec![0xF1]);
        assert_eq!(image("PUSH IX"), vec![0xDD, 0xE5]);
        assert_eq!(image("EX AF, AF'"), vec![0x08]);
        assert_eq!(image("EX DE, HL"), vec![0xEB]);
        assert_eq!(image("EX (SP), IY"), vec![0xFD, 0xE3]);
        assert_eq!(image("EXX"), vec![0xD9]);
    }

    #[test]
    fn encode_jumps_and_calls() {
        assert_eq!(image("JP 0x1234"), vec![0xC3, 0x34, 0x12]);
        assert_eq!(image("JP NZ, 0x1234"), vec![0xC2, 0x34, 0x12]);
        assert_eq!(image("JP C, 0x1234"), vec![0xDA, 0x34, 0x12]);
        assert_eq!(image("JP (HL)"), vec![0xE9]);
        assert_eq!(image("JP (IX)"), vec![0xDD, 0xE9]);
        assert_eq!(image("CALL 0x0005"), vec![0xCD, 0x05, 0x00]);
        assert_eq!(image("CALL PE, 0x0005"), vec![0xEC, 0x05, 0x00]);
        assert_eq!(image("RET"), vec![0xC9]);
        assert_eq!(image("RET M"), vec![0xF8]);
        assert_eq!(image("RST 0x18"), vec![0xDF]);
    }

    #[test]
    fn encode_relative_jumps() {
        // JR to own address: offset -2
        assert_eq!(image("self: JR self"), vec![0x18, 0xFE]);
        assert_eq!(image("JR NC, next\nnext: NOP"), vec![0x30, 0x00, 0x00]);
        // DJNZ back over a 1-byte body
        assert_eq!(
            image("LD B, 3\nloop: INC A\nDJNZ loop"),
            vec![0x06, 0x03, 0x3C, 0x10, 0xFD]
        );
    }

    #[test]
    fn relative_out_of_range_is_rejected() {
        let err = assemble("JR far\nDS 0x200\nfar: NOP").unwrap_err();
        assert!(err.to_string().contains("exceeds"));
    }

    #[test]
    fn encode_cb_page() {
        assert_eq!(image("RLC B"), vec![0xCB, 0x00]);
        assert_eq!(image("SRL (HL)"), vec![0xCB, 0x3E]);
        assert_eq!(image("BIT 7, A"), vec![0xCB, 0x7F]);
        assert_eq!(image("SET 0, (HL)"), vec![0xCB, 0xC6]);
        assert_eq!(image("RES 3, (IX+2)"), vec![0xDD, 0xCB, 0x02, 0x9E]);
        assert_eq!(image("RL (IY-1)"), vec![0xFD, 0xCB, 0xFF, 0x16]);
    }

    #[test]
    fn encode_io_and_ed_page() {
        assert_eq!(image("OUT (0x17), A"), vec![0xD3, 0x17]);
        assert_eq!(image("IN A, (0x40)"), vec![0xDB, 0x40]);
        assert_eq!(image("IN B, (C)"), vec![0xED, 0x40]);
        assert_eq!(image("OUT (C), E"), vec![0xED, 0x59]);
        assert_eq!(image("NEG"), vec![0xED, 0x44]);
        assert_eq!(image("IM 1"), vec![0xED, 0x56]);
        assert_eq!(image("RETI"), vec![0xED, 0x4D]);
        assert_eq!(image("LDIR"), vec![0xED, 0xB0]);
        assert_eq!(image("OTDR"), vec![0xED, 0xBB]);
        assert_eq!(image("RLD"), vec![0xED, 0x6F]);
    }

    #[test]
    fn forward_references_resolve_in_pass_two() {
        let asm = assemble("JP end\nNOP\nend: HALT").unwrap();
        assert_eq!(asm.image, vec![0xC3, 0x04, 0x00, 0x00, 0x76]);
        assert_eq!(asm.labels.get("END"), Some(&0x0004));
    }

    #[test]
    fn org_moves_the_cursor() {
        let asm = assemble("ORG 0x10\nstart: LD A, 1").unwrap();
        assert_eq!(asm.labels.get("START"), Some(&0x10));
        assert_eq!(asm.image.len(), 0x12);
        assert_eq!(&asm.image[0x10..], &[0x3E, 0x01]);
    }

    #[test]
    fn equ_defines_constants() {
        let asm = assemble("LEDS: EQU 0x00\nLD A, 0xFF\nOUT (LEDS), A").unwrap();
        assert_eq!(asm.image, vec![0x3E, 0xFF, 0xD3, 0x00]);
        assert_eq!(asm.labels.get("LEDS"), Some(&0x0000));
    }

    #[test]
    fn equ_without_label_is_rejected() {
        assert!(assemble("EQU 5").is_err());
    }

    #[test]
    fn data_directives() {
        assert_eq!(image("DB 1, 2, 0xFF"), vec![1, 2, 0xFF]);
        assert_eq!(image("DW 0x1234, 5"), vec![0x34, 0x12, 0x05, 0x00]);
        assert_eq!(image("DS 3\nDB 9"), vec![0, 0, 0, 9]);
        assert_eq!(image("DB \"AB\", 0"), vec![0x41, 0x42, 0]);
    }

    #[test]
    fn label_arithmetic() {
        let asm = assemble("table: DW 1, 2\nLD HL, table + 2").unwrap();
        assert_eq!(&asm.image[4..], &[0x21, 0x02, 0x00]);
    }

    #[test]
    fn multiple_statements_per_line() {
        let asm = assemble("LD A, 10 : ADD A, 20 : OUT (0x17), A : HALT").unwrap();
        assert_eq!(asm.image, vec![0x3E, 0x0A, 0xC6, 0x14, 0xD3, 0x17, 0x76]);
    }

    #[test]
    fn inline_label_between_separators() {
        let asm = assemble("LD B, 3 : LD A, 0 :L: INC A : DJNZ L : HALT").unwrap();
        assert_eq!(asm.labels.get("L"), Some(&0x0004));
        assert_eq!(
            asm.image,
            vec![0x06, 0x03, 0x3E, 0x00, 0x3C, 0x10, 0xFD, 0x76]
        );
    }

    #[test]
    fn line_map_tracks_statement_starts() {
        let asm = assemble("NOP\nloop: LD A, 1\nJR loop").unwrap();
        assert_eq!(asm.line_map.get(&0), Some(&1));
        assert_eq!(asm.line_map.get(&1), Some(&2));
        assert_eq!(asm.line_map.get(&3), Some(&3));
    }

    #[test]
    fn listing_shows_addresses_and_bytes() {
        let asm = assemble("LD A, 10\nHALT").unwrap();
        let lines: Vec<&str> = asm.listing.lines().collect();
        assert!(lines[0].starts_with("0000 | 3E 0A"));
        assert!(lines[0].ends_with("LD A, 10"));
        assert!(lines[1].starts_with("0002 | 76"));
    }

    #[test]
    fn undefined_label_is_reported() {
        let err = assemble("JP nowhere").unwrap_err();
        assert!(err.to_string().contains("NOWHERE"));
    }

    #[test]
    fn duplicate_label_is_reported() {
        assert!(assemble("x: NOP\nx: NOP").is_err());
    }

    #[test]
    fn invalid_operands_are_reported() {
        assert!(assemble("LD (HL), (HL)").is_err());
        assert!(assemble("ADD HL, IX").is_err());
        assert!(assemble("JR PO, 0").is_err());
        assert!(assemble("RLC IXH").is_err());
        assert!(assemble("LD IXH, H").is_err());
    }

    #[test]
    fn case_insensitive_everything() {
        assert_eq!(image("ld a, 0x0a"), vec![0x3E, 0x0A]);
        let asm = assemble("Loop: jr LOOP").unwrap();
        assert_eq!(asm.image, vec![0x18, 0xFE]);
    }

    #[test]
    fn comments_are_ignored() {
        assert_eq!(image("NOP ; the idle loop"), vec![0x00]);
    }
}
