//! Z80 instruction interpreter: fetch, decode and execute with full register
//! file, prefix handling and the maskable-interrupt state machine.

use log::warn;
use thiserror::Error;

use crate::bus::{Bus, IrqLine};
use crate::memory::Memory;

pub mod alu;
mod bits;
mod extended;
pub mod registers;

pub use registers::{Prefix, Registers, FLAG_C, FLAG_H, FLAG_N, FLAG_PV, FLAG_S, FLAG_Z};

/// The maskable-interrupt service routine address (IM 1).
pub const INT_VECTOR: u16 = 0x0038;

/// Fatal runtime faults. The CPU halts and keeps its registers intact so the
/// embedder can inspect the wreck.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Error)]
pub enum Fault {
    #[error("stack overflow: SP cannot decrement below 0x0000")]
    StackOverflow,
    #[error("stack underflow: SP cannot increment above 0xFFFF")]
    StackUnderflow,
    #[error("unknown opcode 0x{opcode:02X} at 0x{addr:04X}")]
    UnknownOpcode { addr: u16, opcode: u8 },
}

/// The processor. Owns no memory or bus; both are passed into [`Cpu::step`]
/// so the embedder keeps control of the machine layout.
pub struct Cpu {
    pub regs: Registers,
    pub halted: bool,
    pub iff1: bool,
    pub iff2: bool,
    /// Interrupt mode 0, 1 or 2. All three acknowledge through 0x0038 here.
    pub im: u8,
    irq: IrqLine,
    prefix: Prefix,
}

impl Cpu {
    pub fn new(irq: IrqLine) -> Self {
        let mut cpu = Cpu {
            regs: Registers::default(),
            halted: false,
            iff1: false,
            iff2: false,
            im: 0,
            irq,
            prefix: Prefix::None,
        };
        cpu.reset();
        cpu
    }

    pub fn reset(&mut self) {
        self.regs = Registers::default();
        self.regs.sp = 0xFFFF;
        self.halted = false;
        self.iff1 = false;
        self.iff2 = false;
        self.im = 0;
        self.prefix = Prefix::None;
        self.irq.acknowledge();
    }

    /// Latch a maskable interrupt request. With interrupts enabled this also
    /// wakes a halted CPU so the next step acknowledges.
    pub fn interrupt(&mut self) {
        self.irq.raise();
        if self.iff1 {
            self.halted = false;
        }
    }

    pub fn irq_pending(&self) -> bool {
        self.irq.pending()
    }

    /// Execute one logical instruction including its prefix bytes.
    ///
    /// A pending interrupt with IFF1 set is acknowledged instead: PC is
    /// pushed and control transfers to 0x0038. Repeating block instructions
    /// (LDIR and friends) complete within a single call, so interrupts are
    /// only sampled between instructions, not mid-repeat.
    pub fn step(&mut self, mem: &mut Memory, bus: &mut Bus) -> Result<(), Fault> {
        self.prefix = Prefix::None;

        if self.irq.pending() && self.iff1 {
            self.irq.acknowledge();
            self.iff1 = false;
            self.halted = false;
            self.push16(mem, self.regs.pc)?;
            self.regs.pc = INT_VECTOR;
            return Ok(());
        }
        if self.halted {
            return Ok(());
        }

        let mut opcode = self.fetch(mem);
        loop {
            match opcode {
                0xDD => self.prefix = Prefix::Ix,
                0xFD => self.prefix = Prefix::Iy,
                _ => break,
            }
            opcode = self.fetch(mem);
        }
        self.exec_main(opcode, mem, bus)
    }

    fn fetch(&mut self, mem: &Memory) -> u8 {
        let byte = mem.read(self.regs.pc);
        self.regs.pc = self.regs.pc.wrapping_add(1);
        // R is a 7-bit counter; bit 7 is only written by LD R,A
        self.regs.r = (self.regs.r & 0x80) | (self.regs.r.wrapping_add(1) & 0x7F);
        byte
    }

    fn fetch_word(&mut self, mem: &Memory) -> u16 {
        let lo = self.fetch(mem) as u16;
        let hi = self.fetch(mem) as u16;
        (hi << 8) | lo
    }

    /// Register read by opcode field (0..=7 except 6, which is the memory
    /// operand and handled at the call site).
    fn get_r(&self, code: u8, pfx: Prefix) -> u8 {
        match code {
            0 => self.regs.b,
            1 => self.regs.c,
            2 => self.regs.d,
            3 => self.regs.e,
            4 => self.regs.h_pref(pfx),
            5 => self.regs.l_pref(pfx),
            7 => self.regs.a,
            _ => unreachable!("register code 6 is a memory operand"),
        }
    }

    fn set_r(&mut self, code: u8, val: u8, pfx: Prefix) {
        match code {
            0 => self.regs.b = val,
            1 => self.regs.c = val,
            2 => self.regs.d = val,
            3 => self.regs.e = val,
            4 => self.regs.set_h_pref(pfx, val),
            5 => self.regs.set_l_pref(pfx, val),
            7 => self.regs.a = val,
            _ => unreachable!("register code 6 is a memory operand"),
        }
    }

    /// Effective address of the (HL) operand. Under an index prefix this
    /// fetches the displacement byte, so call it exactly once per
    /// instruction and before any trailing immediate.
    fn addr_hl(&mut self, mem: &Memory) -> u16 {
        match self.prefix {
            Prefix::None => self.regs.hl(),
            Prefix::Ix => {
                let d = self.fetch(mem) as i8;
                self.regs.ix.wrapping_add(d as i16 as u16)
            }
            Prefix::Iy => {
                let d = self.fetch(mem) as i8;
                self.regs.iy.wrapping_add(d as i16 as u16)
            }
        }
    }

    /// BC/DE/HL/SP by opcode pair field; the HL slot follows the prefix.
    fn get_rp(&self, idx: u8) -> u16 {
        match idx {
            0 => self.regs.bc(),
            1 => self.regs.de(),
            2 => self.regs.hl_pref(self.prefix),
            3 => self.regs.sp,
            _ => unreachable!("register pair field is two bits"),
        }
    }

    fn set_rp(&mut self, idx: u8, val: u16) {
        match idx {
            0 => self.regs.set_bc(val),
            1 => self.regs.set_de(val),
            2 => self.regs.set_hl_pref(self.prefix, val),
            3 => self.regs.sp = val,
            _ => unreachable!("register pair field is two bits"),
        }
    }

    /// PUSH/POP variant of the pair field: slot 3 is AF instead of SP.
    fn get_rp2(&self, idx: u8) -> u16 {
        match idx {
            3 => self.regs.af(),
            _ => self.get_rp(idx),
        }
    }

    fn set_rp2(&mut self, idx: u8, val: u16) {
        match idx {
            3 => self.regs.set_af(val),
            _ => self.set_rp(idx, val),
        }
    }

    fn push16(&mut self, mem: &mut Memory, val: u16) -> Result<(), Fault> {
        for byte in [(val >> 8) as u8, val as u8] {
            if self.regs.sp == 0 {
                self.halted = true;
                return Err(Fault::StackOverflow);
            }
            self.regs.sp -= 1;
            mem.write(self.regs.sp, byte);
        }
        Ok(())
    }

    fn pop16(&mut self, mem: &Memory) -> Result<u16, Fault> {
        let mut lo = 0u8;
        let mut hi = 0u8;
        for byte in [&mut lo, &mut hi] {
            *byte = mem.read(self.regs.sp);
            if self.regs.sp == 0xFFFF {
                self.halted = true;
                return Err(Fault::StackUnderflow);
            }
            self.regs.sp += 1;
        }
        Ok(((hi as u16) << 8) | lo as u16)
    }

    /// Relative jump. PC already points past the displacement byte.
    fn jump_rel(&mut self, off: i8) {
        self.regs.pc = self.regs.pc.wrapping_add(off as i16 as u16);
    }

    /// ALU group by opcode row: ADD ADC SUB SBC AND XOR OR CP.
    fn alu_op(&mut self, kind: u8, val: u8) {
        let carry = self.regs.flag(FLAG_C);
        match kind {
            0 => self.regs.add_a(val, false),
            1 => self.regs.add_a(val, carry),
            2 => self.regs.sub_a(val, false, true),
            3 => self.regs.sub_a(val, carry, true),
            4 => self.regs.and_a(val),
            5 => self.regs.xor_a(val),
            6 => self.regs.or_a(val),
            7 => self.regs.sub_a(val, false, false),
            _ => unreachable!("alu row is three bits"),
        }
    }

    fn exec_main(&mut self, op: u8, mem: &mut Memory, bus: &mut Bus) -> Result<(), Fault> {
        match op {
            0x00 => {} // NOP
            0x08 => self.regs.ex_af(),
            0x10 => {
                // DJNZ e
                let off = self.fetch(mem) as i8;
                self.regs.b = self.regs.b.wrapping_sub(1);
                if self.regs.b != 0 {
                    self.jump_rel(off);
                }
            }
            0x18 => {
                let off = self.fetch(mem) as i8;
                self.jump_rel(off);
            }
            0x20 | 0x28 | 0x30 | 0x38 => {
                // JR cc,e: conditions limited to NZ/Z/NC/C
                let off = self.fetch(mem) as i8;
                if self.regs.condition((op >> 3) & 0x03) {
                    self.jump_rel(off);
                }
            }
            0x01 | 0x11 | 0x21 | 0x31 => {
                let val = self.fetch_word(mem);
                self.set_rp((op >> 4) & 3, val);
            }
            0x09 | 0x19 | 0x29 | 0x39 => {
                let lhs = self.regs.hl_pref(self.prefix);
                let rhs = self.get_rp((op >> 4) & 3);
                let res = self.regs.add16(lhs, rhs);
                self.regs.set_hl_pref(self.prefix, res);
            }
            0x02 => mem.write(self.regs.bc(), self.regs.a),
            0x12 => mem.write(self.regs.de(), self.regs.a),
            0x0A => self.regs.a = mem.read(self.regs.bc()),
            0x1A => self.regs.a = mem.read(self.regs.de()),
            0x22 => {
                let addr = self.fetch_word(mem);
                mem.write_word(addr, self.regs.hl_pref(self.prefix));
            }
            0x2A => {
                let addr = self.fetch_word(mem);
                let val = mem.read_word(addr);
                self.regs.set_hl_pref(self.prefix, val);
            }
            0x32 => {
                let addr = self.fetch_word(mem);
                mem.write(addr, self.regs.a);
            }
            0x3A => {
                let addr = self.fetch_word(mem);
                self.regs.a = mem.read(addr);
            }
            0x03 | 0x13 | 0x23 | 0x33 => {
                // INC rp: no flags
                let idx = (op >> 4) & 3;
                self.set_rp(idx, self.get_rp(idx).wrapping_add(1));
            }
            0x0B | 0x1B | 0x2B | 0x3B => {
                let idx = (op >> 4) & 3;
                self.set_rp(idx, self.get_rp(idx).wrapping_sub(1));
            }
            0x34 => {
                let addr = self.addr_hl(mem);
                let res = self.regs.inc8(mem.read(addr));
                mem.write(addr, res);
            }
            0x35 => {
                let addr = self.addr_hl(mem);
                let res = self.regs.dec8(mem.read(addr));
                mem.write(addr, res);
            }
            0x04 | 0x0C | 0x14 | 0x1C | 0x24 | 0x2C | 0x3C => {
                let code = (op >> 3) & 7;
                let res = self.regs.inc8(self.get_r(code, self.prefix));
                self.set_r(code, res, self.prefix);
            }
            0x05 | 0x0D | 0x15 | 0x1D | 0x25 | 0x2D | 0x3D => {
                let code = (op >> 3) & 7;
                let res = self.regs.dec8(self.get_r(code, self.prefix));
                self.set_r(code, res, self.prefix);
            }
            0x36 => {
                // LD (HL),n: under a prefix the displacement precedes n
                let addr = self.addr_hl(mem);
                let val = self.fetch(mem);
                mem.write(addr, val);
            }
            0x06 | 0x0E | 0x16 | 0x1E | 0x26 | 0x2E | 0x3E => {
                let val = self.fetch(mem);
                self.set_r((op >> 3) & 7, val, self.prefix);
            }
            0x07 => self.regs.rlca(),
            0x0F => self.regs.rrca(),
            0x17 => self.regs.rla(),
            0x1F => self.regs.rra(),
            0x27 => self.regs.daa(),
            0x2F => self.regs.cpl(),
            0x37 => self.regs.scf(),
            0x3F => self.regs.ccf(),

            0x76 => self.halted = true, // HALT
            0x40..=0x7F => {
                // LD r,r': a memory operand pins the other side to the
                // plain register bank
                let dst = (op >> 3) & 7;
                let src = op & 7;
                if src == 6 {
                    let addr = self.addr_hl(mem);
                    let val = mem.read(addr);
                    self.set_r(dst, val, Prefix::None);
                } else if dst == 6 {
                    let addr = self.addr_hl(mem);
                    mem.write(addr, self.get_r(src, Prefix::None));
                } else {
                    let val = self.get_r(src, self.prefix);
                    self.set_r(dst, val, self.prefix);
                }
            }
            0x80..=0xBF => {
                let src = op & 7;
                let val = if src == 6 {
                    let addr = self.addr_hl(mem);
                    mem.read(addr)
                } else {
                    self.get_r(src, self.prefix)
                };
                self.alu_op((op >> 3) & 7, val);
            }

            0xC6 | 0xCE | 0xD6 | 0xDE | 0xE6 | 0xEE | 0xF6 | 0xFE => {
                let val = self.fetch(mem);
                self.alu_op((op >> 3) & 7, val);
            }
            0xC0 | 0xC8 | 0xD0 | 0xD8 | 0xE0 | 0xE8 | 0xF0 | 0xF8 => {
                if self.regs.condition((op >> 3) & 7) {
                    self.regs.pc = self.pop16(mem)?;
                }
            }
            0xC9 => self.regs.pc = self.pop16(mem)?,
            0xC1 | 0xD1 | 0xE1 | 0xF1 => {
                let val = self.pop16(mem)?;
                self.set_rp2((op >> 4) & 3, val);
            }
            0xC5 | 0xD5 | 0xE5 | 0xF5 => {
                let val = self.get_rp2((op >> 4) & 3);
                self.push16(mem, val)?;
            }
            0xC3 => self.regs.pc = self.fetch_word(mem),
            0xC2 | 0xCA | 0xD2 | 0xDA | 0xE2 | 0xEA | 0xF2 | 0xFA => {
                let addr = self.fetch_word(mem);
                if self.regs.condition((op >> 3) & 7) {
                    self.regs.pc = addr;
                }
            }
            0xCD => {
                let addr = self.fetch_word(mem);
                self.push16(mem, self.regs.pc)?;
                self.regs.pc = addr;
            }
            0xC4 | 0xCC | 0xD4 | 0xDC | 0xE4 | 0xEC | 0xF4 | 0xFC => {
                // CALL cc,nn: no stack traffic when not taken
                let addr = self.fetch_word(mem);
                if self.regs.condition((op >> 3) & 7) {
                    self.push16(mem, self.regs.pc)?;
                    self.regs.pc = addr;
                }
            }
            0xC7 | 0xCF | 0xD7 | 0xDF | 0xE7 | 0xEF | 0xF7 | 0xFF => {
                self.push16(mem, self.regs.pc)?;
                self.regs.pc = (op & 0x38) as u16;
            }

            0xCB => return bits::exec_cb(self, mem),
            0xED => return extended::exec_ed(self, mem, bus),

            0xD3 => {
                let port = self.fetch(mem);
                bus.write(port, self.regs.a);
            }
            0xDB => {
                let port = self.fetch(mem);
                self.regs.a = bus.read(port);
            }
            0xD9 => self.regs.exx(),
            0xE3 => {
                // EX (SP),HL / IX / IY
                let sp = self.regs.sp;
                let stacked = mem.read_word(sp);
                mem.write_word(sp, self.regs.hl_pref(self.prefix));
                self.regs.set_hl_pref(self.prefix, stacked);
            }
            0xE9 => self.regs.pc = self.regs.hl_pref(self.prefix), // JP (HL)
            0xEB => self.regs.ex_de_hl(), // never prefix-rewritten
            0xF3 => {
                self.iff1 = false;
                self.iff2 = false;
            }
            0xFB => {
                // EI takes effect immediately here; the real part delays it
                // by one instruction
                self.iff1 = true;
                self.iff2 = true;
            }
            0xF9 => self.regs.sp = self.regs.hl_pref(self.prefix),

            _ => {
                let addr = self.regs.pc.wrapping_sub(1);
                warn!("halting on unknown opcode 0x{op:02X} at 0x{addr:04X}");
                self.halted = true;
                return Err(Fault::UnknownOpcode { addr, opcode: op });
            }
        }
        Ok(())
    }
}
