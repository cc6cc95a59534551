//! Disassembler producing text the assembler accepts back.
//!
//! Only canonical encodings decode to mnemonics; duplicate or undocumented
//! encodings come out as DB lines so no byte sequence is ever lost in a
//! disassemble/re-assemble round trip.

use crate::memory::Memory;

/// One decoded instruction.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Instr {
    pub len: u16,
    pub text: String,
}

const R: [&str; 8] = ["B", "C", "D", "E", "H", "L", "(HL)", "A"];
const RP: [&str; 4] = ["BC", "DE", "HL", "SP"];
const RP2: [&str; 4] = ["BC", "DE", "HL", "AF"];
const CC: [&str; 8] = ["NZ", "Z", "NC", "C", "PO", "PE", "P", "M"];
const ALU: [&str; 8] = ["ADD A", "ADC A", "SUB", "SBC A", "AND", "XOR", "OR", "CP"];
const ROT: [&str; 8] = ["RLC", "RRC", "RL", "RR", "SLA", "SRA", "???", "SRL"];

#[derive(Clone, Copy, PartialEq, Eq)]
enum Idx {
    Ix,
    Iy,
}

impl Idx {
    fn name(self) -> &'static str {
        match self {
            Idx::Ix => "IX",
            Idx::Iy => "IY",
        }
    }

    fn half(self, code: u8) -> &'static str {
        match (self, code) {
            (Idx::Ix, 4) => "IXH",
            (Idx::Ix, 5) => "IXL",
            (Idx::Iy, 4) => "IYH",
            (Idx::Iy, 5) => "IYL",
            _ => unreachable!("only H and L have index halves"),
        }
    }
}

/// Sequential byte reader over memory.
struct Reader<'a> {
    mem: &'a Memory,
    start: u16,
    len: u16,
}

impl<'a> Reader<'a> {
    fn new(mem: &'a Memory, start: u16) -> Self {
        Reader { mem, start, len: 0 }
    }

    fn byte(&mut self) -> u8 {
        let val = self.mem.read(self.start.wrapping_add(self.len));
        self.len += 1;
        val
    }

    fn word(&mut self) -> u16 {
        let lo = self.byte() as u16;
        let hi = self.byte() as u16;
        (hi << 8) | lo
    }

    fn peek(&self) -> u8 {
        self.mem.read(self.start.wrapping_add(self.len))
    }

    /// `(IX+0x05)` / `(IX-0x05)` operand, consuming the displacement.
    fn idx_operand(&mut self, idx: Idx) -> String {
        let d = self.byte() as i8;
        if d < 0 {
            format!("({}-0x{:02X})", idx.name(), -(d as i16))
        } else {
            format!("({}+0x{:02X})", idx.name(), d)
        }
    }

    /// Register operand for field `code`; under a prefix, H/L become halves
    /// unless the instruction also touches memory.
    fn r_operand(&mut self, code: u8, prefix: Option<Idx>, mem_involved: bool) -> String {
        match (prefix, code) {
            (Some(idx), 6) => self.idx_operand(idx),
            (Some(idx), 4 | 5) if !mem_involved => idx.half(code).to_string(),
            _ => R[code as usize].to_string(),
        }
    }
}

fn rp_name(idx: u8, prefix: Option<Idx>) -> &'static str {
    match (prefix, idx) {
        (Some(p), 2) => p.name(),
        _ => RP[idx as usize],
    }
}

/// Raw-byte fallback for encodings the assembler would not produce.
fn db_line(bytes: &[u8]) -> String {
    let rendered = bytes
        .iter()
        .map(|b| format!("0x{b:02X}"))
        .collect::<Vec<_>>()
        .join(", ");
    format!("DB {rendered}")
}

/// Decode a single instruction starting at `addr`.
pub fn disasm_one(mem: &Memory, addr: u16) -> Instr {
    let mut r = Reader::new(mem, addr);
    let mut prefix = None;
    let mut op = r.byte();
    if op == 0xDD || op == 0xFD {
        if matches!(r.peek(), 0xDD | 0xFD) {
            // a prefix shadowed by another prefix does nothing by itself
            return Instr {
                len: 1,
                text: db_line(&[op]),
            };
        }
        prefix = Some(if op == 0xDD { Idx::Ix } else { Idx::Iy });
        op = r.byte();
    }

    let text = match op {
        0xCB => disasm_cb(&mut r, prefix),
        0xED => disasm_ed(&mut r),
        _ => disasm_main(&mut r, op, prefix),
    };
    Instr { len: r.len, text }
}

/// Decode instructions from `start` until `end`, yielding their addresses.
pub fn disasm_range(mem: &Memory, start: u16, end: u16) -> Vec<(u16, Instr)> {
    let mut out = Vec::new();
    let mut addr = start as u32;
    while addr < end as u32 {
        let instr = disasm_one(mem, addr as u16);
        let len = instr.len as u32;
        out.push((addr as u16, instr));
        addr += len;
    }
    out
}

fn disasm_main(r: &mut Reader, op: u8, prefix: Option<Idx>) -> String {
    let x = op >> 6;
    let y = (op >> 3) & 7;
    let z = op & 7;
    let p = y >> 1;
    let q = y & 1;

    match (x, z) {
        (0, 0) => match y {
            0 => "NOP".into(),
            1 => "EX AF, AF'".into(),
            2 => {
                let off = r.byte() as i8;
                let target = r.start.wrapping_add(r.len).wrapping_add(off as i16 as u16);
                format!("DJNZ 0x{target:04X}")
            }
            3 => {
                let off = r.byte() as i8;
                let target = r.start.wrapping_add(r.len).wrapping_add(off as i16 as u16);
                format!("JR 0x{target:04X}")
            }
            _ => {
                let off = r.byte() as i8;
                let target = r.start.wrapping_add(r.len).wrapping_add(off as i16 as u16);
                format!("JR {}, 0x{target:04X}", CC[(y - 4) as usize])
            }
        },
        (0, 1) => {
            if q == 0 {
                let val = r.word();
                format!("LD {}, 0x{val:04X}", rp_name(p, prefix))
            } else {
                format!("ADD {}, {}", rp_name(2, prefix), rp_name(p, prefix))
            }
        }
        (0, 2) => {
            let pair = rp_name(2, prefix);
            match (q, p) {
                (0, 0) => "LD (BC), A".into(),
                (0, 1) => "LD (DE), A".into(),
                (0, 2) => format!("LD (0x{:04X}), {pair}", r.word()),
                (0, 3) => format!("LD (0x{:04X}), A", r.word()),
                (1, 0) => "LD A, (BC)".into(),
                (1, 1) => "LD A, (DE)".into(),
                (1, 2) => format!("LD {pair}, (0x{:04X})", r.word()),
                _ => format!("LD A, (0x{:04X})", r.word()),
            }
        }
        (0, 3) => {
            let verb = if q == 0 { "INC" } else { "DEC" };
            format!("{verb} {}", rp_name(p, prefix))
        }
        (0, 4) => {
            let target = r.r_operand(y, prefix, false);
            format!("INC {target}")
        }
        (0, 5) => {
            let target = r.r_operand(y, prefix, false);
            format!("DEC {target}")
        }
        (0, 6) => {
            // displacement precedes the immediate
            let target = r.r_operand(y, prefix, false);
            let val = r.byte();
            format!("LD {target}, 0x{val:02X}")
        }
        (0, 7) => ["RLCA", "RRCA", "RLA", "RRA", "DAA", "CPL", "SCF", "CCF"][y as usize].into(),

        (1, _) if op == 0x76 => "HALT".into(),
        (1, _) => {
            let mem_involved = y == 6 || z == 6;
            let dst = r.r_operand(y, prefix, mem_involved);
            let src = r.r_operand(z, prefix, mem_involved);
            format!("LD {dst}, {src}")
        }
        (2, _) => {
            let src = r.r_operand(z, prefix, z == 6);
            alu_line(y, &src)
        }

        (3, 0) => format!("RET {}", CC[y as usize]),
        (3, 1) => match (q, p) {
            (0, _) => format!("POP {}", rp2_name(p, prefix)),
            (1, 0) => "RET".into(),
            (1, 1) => "EXX".into(),
            (1, 2) => format!("JP ({})", hl_name(prefix)),
            _ => format!("LD SP, {}", hl_name(prefix)),
        },
        (3, 2) => format!("JP {}, 0x{:04X}", CC[y as usize], r.word()),
        (3, 3) => match y {
            0 => format!("JP 0x{:04X}", r.word()),
            2 => format!("OUT (0x{:02X}), A", r.byte()),
            3 => format!("IN A, (0x{:02X})", r.byte()),
            4 => format!("EX (SP), {}", hl_name(prefix)),
            5 => "EX DE, HL".into(),
            6 => "DI".into(),
            _ => "EI".into(),
        },
        (3, 4) => format!("CALL {}, 0x{:04X}", CC[y as usize], r.word()),
        (3, 5) => match p {
            0 | 1 | 2 | 3 if q == 0 => format!("PUSH {}", rp2_name(p, prefix)),
            _ => format!("CALL 0x{:04X}", r.word()),
        },
        (3, 6) => {
            let val = format!("0x{:02X}", r.byte());
            alu_line(y, &val)
        }
        (3, 7) => format!("RST 0x{:02X}", y * 8),
        _ => unreachable!("opcode quadrant is two bits"),
    }
}

fn alu_line(row: u8, operand: &str) -> String {
    let name = ALU[row as usize];
    if name.ends_with('A') {
        format!("{name}, {operand}")
    } else {
        format!("{name} {operand}")
    }
}

fn hl_name(prefix: Option<Idx>) -> &'static str {
    match prefix {
        Some(idx) => idx.name(),
        None => "HL",
    }
}

fn rp2_name(idx: u8, prefix: Option<Idx>) -> &'static str {
    match (prefix, idx) {
        (Some(p), 2) => p.name(),
        _ => RP2[idx as usize],
    }
}

fn disasm_cb(r: &mut Reader, prefix: Option<Idx>) -> String {
    let (sub, operand) = match prefix {
        None => {
            let sub = r.byte();
            if sub >> 6 == 0 && (sub >> 3) & 7 == 6 {
                // the undocumented SLL row
                return db_line(&[0xCB, sub]);
            }
            (sub, R[(sub & 7) as usize].to_string())
        }
        Some(idx) => {
            let d = r.byte();
            let sub = r.byte();
            let pfx = if idx == Idx::Ix { 0xDD } else { 0xFD };
            // register-copy variants and the SLL row are undocumented
            if sub & 7 != 6 || (sub >> 6 == 0 && (sub >> 3) & 7 == 6) {
                return db_line(&[pfx, 0xCB, d, sub]);
            }
            let rendered = if (d as i8) < 0 {
                format!("({}-0x{:02X})", idx.name(), -((d as i8) as i16))
            } else {
                format!("({}+0x{:02X})", idx.name(), d)
            };
            (sub, rendered)
        }
    };
    let bit = (sub >> 3) & 7;
    match sub >> 6 {
        0 => format!("{} {operand}", ROT[bit as usize]),
        1 => format!("BIT {bit}, {operand}"),
        2 => format!("RES {bit}, {operand}"),
        3 => format!("SET {bit}, {operand}"),
        _ => unreachable!("sub-opcode group is two bits"),
    }
}

fn disasm_ed(r: &mut Reader) -> String {
    let sub = r.byte();
    match sub {
        0x40 | 0x48 | 0x50 | 0x58 | 0x60 | 0x68 | 0x78 => {
            format!("IN {}, (C)", R[((sub >> 3) & 7) as usize])
        }
        0x41 | 0x49 | 0x51 | 0x59 | 0x61 | 0x69 | 0x79 => {
            format!("OUT (C), {}", R[((sub >> 3) & 7) as usize])
        }
        0x42 | 0x52 | 0x62 | 0x72 => format!("SBC HL, {}", RP[((sub >> 4) & 3) as usize]),
        0x4A | 0x5A | 0x6A | 0x7A => format!("ADC HL, {}", RP[((sub >> 4) & 3) as usize]),
        0x43 | 0x53 | 0x73 => {
            format!("LD (0x{:04X}), {}", r.word(), RP[((sub >> 4) & 3) as usize])
        }
        0x4B | 0x5B | 0x7B => {
            format!("LD {}, (0x{:04X})", RP[((sub >> 4) & 3) as usize], r.word())
        }
        0x44 => "NEG".into(),
        0x45 => "RETN".into(),
        0x4D => "RETI".into(),
        0x46 => "IM 0".into(),
        0x56 => "IM 1".into(),
        0x5E => "IM 2".into(),
        0x47 => "LD I, A".into(),
        0x4F => "LD R, A".into(),
        0x57 => "LD A, I".into(),
        0x5F => "LD A, R".into(),
        0x67 => "RRD".into(),
        0x6F => "RLD".into(),
        0xA0 => "LDI".into(),
        0xA1 => "CPI".into(),
        0xA2 => "INI".into(),
        0xA3 => "OUTI".into(),
        0xA8 => "LDD".into(),
        0xA9 => "CPD".into(),
        0xAA => "IND".into(),
        0xAB => "OUTD".into(),
        0xB0 => "LDIR".into(),
        0xB1 => "CPIR".into(),
        0xB2 => "INIR".into(),
        0xB3 => "OTIR".into(),
        0xB8 => "LDDR".into(),
        0xB9 => "CPDR".into(),
        0xBA => "INDR".into(),
        0xBB => "OTDR".into(),
        _ => db_line(&[0xED, sub]),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::asm::assemble;

    fn disasm_bytes(bytes: &[u8]) -> Vec<String> {
        let mut mem = Memory::new();
        mem.load(0, bytes);
        disasm_range(&mem, 0, bytes.len() as u16)
            .into_iter()
            .map(|(_, instr)| instr.text)
            .collect()
    }

    #[test]
    fn decode_main_page() {
        assert_eq!(
            disasm_bytes(&[0x00, 0x3E, 0x0A, 0xC6, 0x14, 0x76]),
            vec!["NOP", "LD A, 0x0A", "ADD A, 0x14", "HALT"]
        );
    }

    #[test]
    fn decode_prefixed() {
        assert_eq!(
            disasm_bytes(&[0xDD, 0x7E, 0x05]),
            vec!["LD A, (IX+0x05)"]
        );
        assert_eq!(
            disasm_bytes(&[0xFD, 0x70, 0xFE]),
            vec!["LD (IY-0x02), B"]
        );
        assert_eq!(disasm_bytes(&[0xDD, 0x09]), vec!["ADD IX, BC"]);
        assert_eq!(disasm_bytes(&[0xDD, 0x26, 0x12]), vec!["LD IXH, 0x12"]);
        assert_eq!(disasm_bytes(&[0xDD, 0x66, 0x01]), vec!["LD H, (IX+0x01)"]);
    }

    #[test]
    fn decode_relative_targets_absolute() {
        let mut mem = Memory::new();
        mem.load(0x100, &[0x18, 0xFE]); // JR to itself
        let instr = disasm_one(&mem, 0x100);
        assert_eq!(instr.text, "JR 0x0100");
        assert_eq!(instr.len, 2);
    }

    #[test]
    fn decode_cb_and_ed() {
        assert_eq!(
            disasm_bytes(&[0xCB, 0x00, 0xCB, 0x7E, 0xED, 0xB0]),
            vec!["RLC B", "BIT 7, (HL)", "LDIR"]
        );
        assert_eq!(
            disasm_bytes(&[0xDD, 0xCB, 0x02, 0x9E]),
            vec!["RES 3, (IX+0x02)"]
        );
    }

    #[test]
    fn unknown_bytes_decode_as_data() {
        assert_eq!(disasm_bytes(&[0xED, 0x77]), vec!["DB 0xED, 0x77"]);
        assert_eq!(disasm_bytes(&[0xCB, 0x30]), vec!["DB 0xCB, 0x30"]);
    }

    #[test]
    fn reassembling_disassembly_reproduces_image() {
        let src = "
            start: LD A, 0x10
            LD HL, 0x8000
            LD (HL), A
            LD B, 4
            loop: RLC A
            DJNZ loop
            LD IX, 0x9000
            LD (IX+2), 0x55
            SET 7, (IX+2)
            ADD HL, DE
            EX DE, HL
            LDIR
            OUT (0x17), A
            IN A, (0x40)
            CALL sub
            HALT
            sub: BIT 3, B
            RET NZ
            NEG
            RETI
        ";
        let first = assemble(src).unwrap();
        let mut mem = Memory::new();
        mem.load(0, &first.image);
        let listing = disasm_range(&mem, 0, first.image.len() as u16)
            .into_iter()
            .map(|(_, instr)| instr.text)
            .collect::<Vec<_>>()
            .join("\n");
        let second = assemble(&listing).unwrap();
        assert_eq!(first.image, second.image);
    }
}
