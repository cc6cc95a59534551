//! Instruction encoder: one statement in, opcode bytes out.
//!
//! The same encoder runs both passes. In tolerant mode unresolved symbols
//! evaluate to zero, which never changes an instruction's length, so pass 1
//! can size everything before the label table is complete.

use fxhash::FxHashMap;
use miette::Result;

use super::operand::{Expr, Operand, Reg16, Reg8, Term};
use super::Op;
use crate::error;

/// Register-field view of an 8-bit operand: opcode bits, required index
/// prefix and indexed displacement.
#[derive(Clone, Copy)]
struct R8Bits {
    code: u8,
    prefix: Option<u8>,
    disp: Option<i8>,
}

pub struct Encoder<'a> {
    pub labels: &'a FxHashMap<String, u16>,
    pub tolerant: bool,
    pub src: &'a str,
}

impl Encoder<'_> {
    pub fn encode(&self, op: &Op, addr: u16) -> Result<Vec<u8>> {
        let ops = op.operands.as_slice();
        match op.name.as_str() {
            "LD" => self.ld(op),
            "PUSH" => self.push_pop(op, 0xC5),
            "POP" => self.push_pop(op, 0xC1),
            "EX" => self.ex(op),
            "ADD" => match ops {
                [Operand::R16(dst), Operand::R16(rhs)] => self.add16(op, *dst, *rhs),
                _ => self.alu(op, 0),
            },
            "ADC" => match ops {
                [Operand::R16(Reg16::Hl), Operand::R16(rhs)] => self.carry16(op, 0x4A, *rhs),
                _ => self.alu(op, 1),
            },
            "SUB" => self.alu(op, 2),
            "SBC" => match ops {
                [Operand::R16(Reg16::Hl), Operand::R16(rhs)] => self.carry16(op, 0x42, *rhs),
                _ => self.alu(op, 3),
            },
            "AND" => self.alu(op, 4),
            "XOR" => self.alu(op, 5),
            "OR" => self.alu(op, 6),
            "CP" => self.alu(op, 7),
            "INC" => self.inc_dec(op, 0x04, 0x03),
            "DEC" => self.inc_dec(op, 0x05, 0x0B),
            "RLC" => self.rot(op, 0x00),
            "RRC" => self.rot(op, 0x08),
            "RL" => self.rot(op, 0x10),
            "RR" => self.rot(op, 0x18),
            "SLA" => self.rot(op, 0x20),
            "SRA" => self.rot(op, 0x28),
            "SRL" => self.rot(op, 0x38),
            "BIT" => self.bit_op(op, 0x40),
            "RES" => self.bit_op(op, 0x80),
            "SET" => self.bit_op(op, 0xC0),
            "JP" => self.jp(op),
            "JR" => self.relative(op, addr, 0x18, true),
            "DJNZ" => self.relative(op, addr, 0x10, false),
            "CALL" => self.call(op),
            "RET" => match ops {
                [] => Ok(vec![0xC9]),
                [cond] if cond.as_cond().is_some() => {
                    Ok(vec![0xC0 | cond.as_cond().unwrap().code() << 3])
                }
                _ => self.invalid(op),
            },
            "RST" => match ops {
                [Operand::Imm(e)] => {
                    let val = self.eval(e)?;
                    if val & !0x38 != 0 {
                        return Err(error::value_range(val as i64, "a restart vector", e.span, self.src));
                    }
                    Ok(vec![0xC7 | val as u8])
                }
                _ => self.invalid(op),
            },
            "IN" => match ops {
                [Operand::R8(Reg8::A), Operand::Ind(e)] => Ok(vec![0xDB, self.imm8(e)?]),
                [Operand::R8(reg), Operand::IndC] => match reg.code() {
                    Some(code) if reg.prefix().is_none() => Ok(vec![0xED, 0x40 | code << 3]),
                    _ => self.invalid(op),
                },
                _ => self.invalid(op),
            },
            "OUT" => match ops {
                [Operand::Ind(e), Operand::R8(Reg8::A)] => Ok(vec![0xD3, self.imm8(e)?]),
                [Operand::IndC, Operand::R8(reg)] => match reg.code() {
                    Some(code) if reg.prefix().is_none() => Ok(vec![0xED, 0x41 | code << 3]),
                    _ => self.invalid(op),
                },
                _ => self.invalid(op),
            },
            "IM" => match ops {
                [Operand::Imm(e)] => match self.eval(e)? {
                    0 => Ok(vec![0xED, 0x46]),
                    1 => Ok(vec![0xED, 0x56]),
                    2 => Ok(vec![0xED, 0x5E]),
                    val => Err(error::value_range(val as i64, "an interrupt mode", e.span, self.src)),
                },
                _ => self.invalid(op),
            },
            "DB" => self.db(op),
            "DW" => self.dw(op),
            "DS" => self.ds(op),
            name => match (simple_opcode(name), ops.is_empty()) {
                (Some(bytes), true) => Ok(bytes),
                _ => self.invalid(op),
            },
        }
    }

    // expression evaluation

    pub(super) fn eval(&self, expr: &Expr) -> Result<i32> {
        let mut val = self.term(&expr.first, expr)?;
        if expr.negate {
            val = -val;
        }
        if let Some((sub, term)) = &expr.rest {
            let rhs = self.term(term, expr)?;
            val += if *sub { -rhs } else { rhs };
        }
        Ok(val)
    }

    fn term(&self, term: &Term, expr: &Expr) -> Result<i32> {
        match term {
            Term::Num(val) => Ok(*val),
            Term::Sym(name) => match self.labels.get(name) {
                Some(val) => Ok(*val as i32),
                None if self.tolerant => Ok(0),
                None => Err(error::undefined_label(name, expr.span, self.src)),
            },
        }
    }

    fn imm8(&self, expr: &Expr) -> Result<u8> {
        let val = self.eval(expr)?;
        if !(-128..=255).contains(&val) && !self.tolerant {
            return Err(error::value_range(val as i64, "a byte", expr.span, self.src));
        }
        Ok(val as u8)
    }

    fn imm16(&self, expr: &Expr) -> Result<u16> {
        let val = self.eval(expr)?;
        if !(-32768..=65535).contains(&val) && !self.tolerant {
            return Err(error::value_range(val as i64, "a 16-bit word", expr.span, self.src));
        }
        Ok(val as u16)
    }

    fn disp8(&self, expr: &Expr) -> Result<i8> {
        let val = self.eval(expr)?;
        if !(-128..=127).contains(&val) && !self.tolerant {
            return Err(error::value_range(val as i64, "a signed displacement byte", expr.span, self.src));
        }
        Ok(val as i8)
    }

    // operand views

    fn r8(&self, operand: &Operand) -> Result<Option<R8Bits>> {
        Ok(match operand {
            Operand::R8(reg) => reg.code().map(|code| R8Bits {
                code,
                prefix: reg.prefix(),
                disp: None,
            }),
            Operand::IndR16(Reg16::Hl) => Some(R8Bits {
                code: 6,
                prefix: None,
                disp: None,
            }),
            Operand::IndR16(reg @ (Reg16::Ix | Reg16::Iy)) => Some(R8Bits {
                code: 6,
                prefix: reg.prefix(),
                disp: Some(0),
            }),
            Operand::Idx(reg, expr) => Some(R8Bits {
                code: 6,
                prefix: reg.prefix(),
                disp: Some(self.disp8(expr)?),
            }),
            _ => None,
        })
    }

    /// Emit prefix, opcode and displacement for a single r8-field operand.
    fn r8_bytes(&self, bits: R8Bits, opcode: u8) -> Vec<u8> {
        let mut out = Vec::with_capacity(3);
        if let Some(prefix) = bits.prefix {
            out.push(prefix);
        }
        out.push(opcode);
        if let Some(disp) = bits.disp {
            out.push(disp as u8);
        }
        out
    }

    fn invalid(&self, op: &Op) -> Result<Vec<u8>> {
        let rendered = op
            .operands
            .iter()
            .map(|operand| operand.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        Err(error::invalid_operands(&op.name, &rendered, op.span, self.src))
    }

    // instruction families

    fn ld(&self, op: &Op) -> Result<Vec<u8>> {
        match op.operands.as_slice() {
            // special registers
            [Operand::R16(Reg16::Sp), Operand::R16(src @ (Reg16::Hl | Reg16::Ix | Reg16::Iy))] => {
                Ok(with_prefix(src.prefix(), vec![0xF9]))
            }
            [Operand::R8(Reg8::A), Operand::R8(Reg8::I)] => Ok(vec![0xED, 0x57]),
            [Operand::R8(Reg8::A), Operand::R8(Reg8::R)] => Ok(vec![0xED, 0x5F]),
            [Operand::R8(Reg8::I), Operand::R8(Reg8::A)] => Ok(vec![0xED, 0x47]),
            [Operand::R8(Reg8::R), Operand::R8(Reg8::A)] => Ok(vec![0xED, 0x4F]),

            // accumulator and pair-indirect memory
            [Operand::R8(Reg8::A), Operand::IndR16(Reg16::Bc)] => Ok(vec![0x0A]),
            [Operand::R8(Reg8::A), Operand::IndR16(Reg16::De)] => Ok(vec![0x1A]),
            [Operand::IndR16(Reg16::Bc), Operand::R8(Reg8::A)] => Ok(vec![0x02]),
            [Operand::IndR16(Reg16::De), Operand::R8(Reg8::A)] => Ok(vec![0x12]),
            [Operand::R8(Reg8::A), Operand::Ind(e)] => {
                let addr = self.imm16(e)?;
                Ok(vec![0x3A, addr as u8, (addr >> 8) as u8])
            }
            [Operand::Ind(e), Operand::R8(Reg8::A)] => {
                let addr = self.imm16(e)?;
                Ok(vec![0x32, addr as u8, (addr >> 8) as u8])
            }

            // 16-bit forms
            [Operand::R16(dst), Operand::Imm(e)] => {
                let Some(idx) = dst.rp() else { return self.invalid(op) };
                let val = self.imm16(e)?;
                Ok(with_prefix(
                    dst.prefix(),
                    vec![0x01 | idx << 4, val as u8, (val >> 8) as u8],
                ))
            }
            [Operand::R16(dst), Operand::Ind(e)] => {
                let addr = self.imm16(e)?;
                let (lo, hi) = (addr as u8, (addr >> 8) as u8);
                match dst {
                    Reg16::Hl | Reg16::Ix | Reg16::Iy => {
                        Ok(with_prefix(dst.prefix(), vec![0x2A, lo, hi]))
                    }
                    Reg16::Bc | Reg16::De | Reg16::Sp => {
                        Ok(vec![0xED, 0x4B | dst.rp().unwrap() << 4, lo, hi])
                    }
                    _ => self.invalid(op),
                }
            }
            [Operand::Ind(e), Operand::R16(src)] => {
                let addr = self.imm16(e)?;
                let (lo, hi) = (addr as u8, (addr >> 8) as u8);
                match src {
                    Reg16::Hl | Reg16::Ix | Reg16::Iy => {
                        Ok(with_prefix(src.prefix(), vec![0x22, lo, hi]))
                    }
                    Reg16::Bc | Reg16::De | Reg16::Sp => {
                        Ok(vec![0xED, 0x43 | src.rp().unwrap() << 4, lo, hi])
                    }
                    _ => self.invalid(op),
                }
            }

            // 8-bit immediate and register-to-register forms
            [dst, Operand::Imm(e)] => {
                let Some(bits) = self.r8(dst)? else { return self.invalid(op) };
                let mut out = self.r8_bytes(bits, 0x06 | bits.code << 3);
                out.push(self.imm8(e)?);
                Ok(out)
            }
            [dst, src] => {
                let (Some(d), Some(s)) = (self.r8(dst)?, self.r8(src)?) else {
                    return self.invalid(op);
                };
                self.ld_r_r(op, d, s)
            }
            _ => self.invalid(op),
        }
    }

    fn ld_r_r(&self, op: &Op, d: R8Bits, s: R8Bits) -> Result<Vec<u8>> {
        // two memory operands would collide with the HALT encoding
        if d.code == 6 && s.code == 6 {
            return self.invalid(op);
        }
        let opcode = 0x40 | d.code << 3 | s.code;
        match (d.prefix, s.prefix) {
            (None, None) => Ok(vec![opcode]),
            // index-register halves pair only with themselves
            (Some(p), Some(q)) if p == q && d.disp.is_none() && s.disp.is_none() => {
                Ok(vec![p, opcode])
            }
            (Some(_), None) => {
                let legal = match d.disp {
                    // (IX+d) destination takes any plain register
                    Some(_) => s.code != 6,
                    // IXH/IXL destination refuses plain H, L and (HL)
                    None => !matches!(s.code, 4 | 5 | 6),
                };
                if legal {
                    Ok(self.r8_bytes(d, opcode))
                } else {
                    self.invalid(op)
                }
            }
            (None, Some(_)) => {
                let legal = match s.disp {
                    Some(_) => d.code != 6,
                    None => !matches!(d.code, 4 | 5 | 6),
                };
                if legal {
                    Ok(self.r8_bytes(s, opcode))
                } else {
                    self.invalid(op)
                }
            }
            _ => self.invalid(op),
        }
    }

    fn push_pop(&self, op: &Op, base: u8) -> Result<Vec<u8>> {
        match op.operands.as_slice() {
            [Operand::R16(reg)] => {
                let idx = match reg {
                    Reg16::Bc => 0,
                    Reg16::De => 1,
                    Reg16::Hl | Reg16::Ix | Reg16::Iy => 2,
                    Reg16::Af => 3,
                    _ => return self.invalid(op),
                };
                Ok(with_prefix(reg.prefix(), vec![base | idx << 4]))
            }
            _ => self.invalid(op),
        }
    }

    fn ex(&self, op: &Op) -> Result<Vec<u8>> {
        match op.operands.as_slice() {
            [Operand::R16(Reg16::Af), Operand::R16(Reg16::AfShadow)] => Ok(vec![0x08]),
            [Operand::R16(Reg16::De), Operand::R16(Reg16::Hl)] => Ok(vec![0xEB]),
            [Operand::IndR16(Reg16::Sp), Operand::R16(reg @ (Reg16::Hl | Reg16::Ix | Reg16::Iy))] => {
                Ok(with_prefix(reg.prefix(), vec![0xE3]))
            }
            _ => self.invalid(op),
        }
    }

    fn alu(&self, op: &Op, row: u8) -> Result<Vec<u8>> {
        // both `OP src` and the spelled-out `OP A, src` are accepted
        let src = match op.operands.as_slice() {
            [src] => src,
            [Operand::R8(Reg8::A), src] => src,
            _ => return self.invalid(op),
        };
        if let Operand::Imm(e) = src {
            return Ok(vec![0xC6 | row << 3, self.imm8(e)?]);
        }
        match self.r8(src)? {
            Some(bits) => Ok(self.r8_bytes(bits, 0x80 | row << 3 | bits.code)),
            None => self.invalid(op),
        }
    }

    fn add16(&self, op: &Op, dst: Reg16, rhs: Reg16) -> Result<Vec<u8>> {
        if !matches!(dst, Reg16::Hl | Reg16::Ix | Reg16::Iy) {
            return self.invalid(op);
        }
        // the HL slot aliases the destination: ADD IX,IX is legal, ADD IX,HL is not
        let idx = match rhs {
            Reg16::Bc => 0,
            Reg16::De => 1,
            Reg16::Sp => 3,
            _ if rhs == dst => 2,
            _ => return self.invalid(op),
        };
        Ok(with_prefix(dst.prefix(), vec![0x09 | idx << 4]))
    }

    fn carry16(&self, op: &Op, base: u8, rhs: Reg16) -> Result<Vec<u8>> {
        match rhs.rp() {
            Some(idx) if rhs.prefix().is_none() => Ok(vec![0xED, base | idx << 4]),
            _ => self.invalid(op),
        }
    }

    fn inc_dec(&self, op: &Op, r8_base: u8, rp_base: u8) -> Result<Vec<u8>> {
        match op.operands.as_slice() {
            [Operand::R16(reg)] => match reg.rp() {
                Some(idx) => Ok(with_prefix(reg.prefix(), vec![rp_base | idx << 4])),
                None => self.invalid(op),
            },
            [target] => match self.r8(target)? {
                Some(bits) => Ok(self.r8_bytes(bits, r8_base | bits.code << 3)),
                None => self.invalid(op),
            },
            _ => self.invalid(op),
        }
    }

    fn rot(&self, op: &Op, base: u8) -> Result<Vec<u8>> {
        match op.operands.as_slice() {
            [target] => self.cb_target(op, target, base),
            _ => self.invalid(op),
        }
    }

    fn bit_op(&self, op: &Op, group: u8) -> Result<Vec<u8>> {
        match op.operands.as_slice() {
            [Operand::Imm(e), target] => {
                let bit = self.eval(e)?;
                if !(0..=7).contains(&bit) {
                    return Err(error::value_range(bit as i64, "a bit number", e.span, self.src));
                }
                self.cb_target(op, target, group | (bit as u8) << 3)
            }
            _ => self.invalid(op),
        }
    }

    /// CB-page operand: plain register, (HL), or indexed memory. The
    /// index-register halves have no CB encodings.
    fn cb_target(&self, op: &Op, target: &Operand, base: u8) -> Result<Vec<u8>> {
        match self.r8(target)? {
            Some(bits) if bits.prefix.is_none() => Ok(vec![0xCB, base | bits.code]),
            Some(bits) if bits.disp.is_some() => Ok(vec![
                bits.prefix.unwrap(),
                0xCB,
                bits.disp.unwrap() as u8,
                base | 6,
            ]),
            _ => self.invalid(op),
        }
    }

    fn jp(&self, op: &Op) -> Result<Vec<u8>> {
        match op.operands.as_slice() {
            [Operand::IndR16(reg @ (Reg16::Hl | Reg16::Ix | Reg16::Iy))] => {
                Ok(with_prefix(reg.prefix(), vec![0xE9]))
            }
            [Operand::Imm(e)] => {
                let addr = self.imm16(e)?;
                Ok(vec![0xC3, addr as u8, (addr >> 8) as u8])
            }
            [cond, Operand::Imm(e)] if cond.as_cond().is_some() => {
                let addr = self.imm16(e)?;
                let cc = cond.as_cond().unwrap().code();
                Ok(vec![0xC2 | cc << 3, addr as u8, (addr >> 8) as u8])
            }
            _ => self.invalid(op),
        }
    }

    fn call(&self, op: &Op) -> Result<Vec<u8>> {
        match op.operands.as_slice() {
            [Operand::Imm(e)] => {
                let addr = self.imm16(e)?;
                Ok(vec![0xCD, addr as u8, (addr >> 8) as u8])
            }
            [cond, Operand::Imm(e)] if cond.as_cond().is_some() => {
                let addr = self.imm16(e)?;
                let cc = cond.as_cond().unwrap().code();
                Ok(vec![0xC4 | cc << 3, addr as u8, (addr >> 8) as u8])
            }
            _ => self.invalid(op),
        }
    }

    /// JR and DJNZ: the displacement is relative to the byte after the
    /// 2-byte instruction.
    fn relative(&self, op: &Op, addr: u16, opcode: u8, allow_cond: bool) -> Result<Vec<u8>> {
        let (head, target) = match op.operands.as_slice() {
            [Operand::Imm(e)] => (opcode, e),
            [cond, Operand::Imm(e)] if allow_cond && cond.as_cond().is_some() => {
                let cc = cond.as_cond().unwrap().code();
                if cc >= 4 {
                    return self.invalid(op);
                }
                (0x20 | cc << 3, e)
            }
            _ => return self.invalid(op),
        };
        let dest = self.imm16(target)?;
        let offset = dest as i32 - (addr as i32 + 2);
        if !self.tolerant && !(-128..=127).contains(&offset) {
            return Err(error::relative_range(offset, op.span, self.src));
        }
        Ok(vec![head, offset as u8])
    }

    // data directives

    fn db(&self, op: &Op) -> Result<Vec<u8>> {
        if op.operands.is_empty() {
            return self.invalid(op);
        }
        let mut out = Vec::new();
        for operand in &op.operands {
            match operand {
                Operand::Imm(e) => out.push(self.imm8(e)?),
                Operand::Str(text, _) => out.extend(text.bytes()),
                _ => return self.invalid(op),
            }
        }
        Ok(out)
    }

    fn dw(&self, op: &Op) -> Result<Vec<u8>> {
        if op.operands.is_empty() {
            return self.invalid(op);
        }
        let mut out = Vec::new();
        for operand in &op.operands {
            match operand {
                Operand::Imm(e) => {
                    let val = self.imm16(e)?;
                    out.push(val as u8);
                    out.push((val >> 8) as u8);
                }
                _ => return self.invalid(op),
            }
        }
        Ok(out)
    }

    /// DS must size identically in both passes, so its count is always
    /// resolved strictly: forward references are not allowed.
    fn ds(&self, op: &Op) -> Result<Vec<u8>> {
        match op.operands.as_slice() {
            [Operand::Imm(e)] => {
                let strict = Encoder {
                    labels: self.labels,
                    tolerant: false,
                    src: self.src,
                };
                let count = strict.eval(e)?;
                if !(0..=0x10000).contains(&count) {
                    return Err(error::value_range(count as i64, "a reservation size", e.span, self.src));
                }
                Ok(vec![0; count as usize])
            }
            _ => self.invalid(op),
        }
    }
}

fn with_prefix(prefix: Option<u8>, mut body: Vec<u8>) -> Vec<u8> {
    if let Some(prefix) = prefix {
        body.insert(0, prefix);
    }
    body
}

/// Operand-free instructions.
fn simple_opcode(name: &str) -> Option<Vec<u8>> {
    Some(match name {
        "NOP" => vec![0x00],
        "HALT" => vec![0x76],
        "DI" => vec![0xF3],
        "EI" => vec![0xFB],
        "EXX" => vec![0xD9],
        "DAA" => vec![0x27],
        "CPL" => vec![0x2F],
        "SCF" => vec![0x37],
        "CCF" => vec![0x3F],
        "RLCA" => vec![0x07],
        "RRCA" => vec![0x0F],
        "RLA" => vec![0x17],
        "RRA" => vec![0x1F],
        "NEG" => vec![0xED, 0x44],
        "RETI" => vec![0xED, 0x4D],
        "RETN" => vec![0xED, 0x45],
        "RRD" => vec![0xED, 0x67],
        "RLD" => vec![0xED, 0x6F],
        "LDI" => vec![0xED, 0xA0],
        "LDIR" => vec![0xED, 0xB0],
        "LDD" => vec![0xED, 0xA8],
        "LDDR" => vec![0xED, 0xB8],
        "CPI" => vec![0xED, 0xA1],
        "CPIR" => vec![0xED, 0xB1],
        "CPD" => vec![0xED, 0xA9],
        "CPDR" => vec![0xED, 0xB9],
        "INI" => vec![0xED, 0xA2],
        "INIR" => vec![0xED, 0xB2],
        "IND" => vec![0xED, 0xAA],
        "INDR" => vec![0xED, 0xBA],
        "OUTI" => vec![0xED, 0xA3],
        "OTIR" => vec![0xED, 0xB3],
        "OUTD" => vec![0xED, 0xAB],
        "OTDR" => vec![0xED, 0xBB],
        _ => return None,
    })
}
