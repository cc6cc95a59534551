//! Complete machine state: CPU, memory and I/O bus wired to one interrupt
//! line, plus the console peripherals the CLI attaches for `run`.

use std::time::{SystemTime, UNIX_EPOCH};

use colored::Colorize;
use log::warn;

use crate::asm::Assembly;
use crate::bus::{Bus, IrqLine};
use crate::cpu::{Cpu, Fault};
use crate::memory::Memory;

/// Ceiling on `run` so a wild program cannot spin forever.
pub const DEFAULT_STEP_LIMIT: u64 = 50_000_000;

/// Represents complete machine state during execution.
pub struct Machine {
    pub cpu: Cpu,
    pub mem: Memory,
    pub bus: Bus,
}

impl Machine {
    pub fn new() -> Self {
        let irq = IrqLine::new();
        Machine {
            cpu: Cpu::new(irq.clone()),
            mem: Memory::new(),
            bus: Bus::new(irq),
        }
    }

    /// Place an image at `base` and point the CPU at the reset vector.
    pub fn load(&mut self, base: u16, image: &[u8]) {
        self.mem.load(base, image);
        self.cpu.reset();
    }

    pub fn load_assembly(&mut self, assembly: &Assembly) {
        self.load(0, &assembly.image);
    }

    pub fn reset(&mut self) {
        self.cpu.reset();
        self.mem.reset();
    }

    pub fn step(&mut self) -> Result<(), Fault> {
        self.cpu.step(&mut self.mem, &mut self.bus)
    }

    /// Raise the maskable interrupt line from outside the step loop.
    pub fn interrupt(&mut self) {
        self.cpu.interrupt();
    }

    /// Step until HALT, a fault, or the step limit. Returns steps taken.
    pub fn run(&mut self, limit: u64) -> Result<u64, Fault> {
        let mut steps = 0;
        while !self.cpu.halted {
            self.step()?;
            steps += 1;
            if steps >= limit {
                warn!("stopping after {steps} steps without reaching HALT");
                break;
            }
        }
        Ok(steps)
    }
}

impl Default for Machine {
    fn default() -> Self {
        Machine::new()
    }
}

/// Port map of the stock peripherals, as the sample programs expect them.
pub mod ports {
    /// Eight LEDs, one bit each.
    pub const LEDS: u8 = 0x00;
    /// Eight 7-segment digits.
    pub const SEGMENT_BASE: u8 = 0x10;
    /// LCD command register (0x01 clear, 0x18 shift left, 0x80|addr cursor).
    pub const LCD_CMD: u8 = 0x20;
    /// LCD data register, one character per write.
    pub const LCD_DATA: u8 = 0x21;
    /// Buzzer tone code, zero silences.
    pub const BUZZER: u8 = 0x30;
    /// Keypad: key code 0..15, 0xFF when idle.
    pub const KEYPAD: u8 = 0x40;
    /// Eight DIP switches, bit 0 is the switch state.
    pub const DIP_BASE: u8 = 0x50;
    /// Push-button mask.
    pub const BUTTONS: u8 = 0x60;
    /// 16x16 dot matrix rows.
    pub const MATRIX_BASE: u8 = 0x80;
    /// Real-time clock seconds/minutes/hours.
    pub const RTC_SECONDS: u8 = 0xC0;
    pub const RTC_MINUTES: u8 = 0xC1;
    pub const RTC_HOURS: u8 = 0xC2;
}

/// Wire terminal-flavored stand-ins for the board peripherals: output ports
/// print what a display would show, input ports read idle values, and the
/// clock ports read the host clock.
pub fn attach_console_peripherals(bus: &mut Bus) {
    bus.register_out(ports::LEDS, |val| {
        println!("{:>12} {}", "led".cyan(), render_leds(val));
    });
    for digit in 0..8u8 {
        bus.register_out(ports::SEGMENT_BASE + digit, move |val| {
            println!("{:>12} digit {digit} segments 0b{val:08b}", "7seg".cyan());
        });
    }
    bus.register_out(ports::LCD_CMD, |val| {
        println!("{:>12} command 0x{val:02X}", "lcd".cyan());
    });
    bus.register_out(ports::LCD_DATA, |val| {
        println!("{:>12} {:?}", "lcd".cyan(), (val as char));
    });
    bus.register_out(ports::BUZZER, |val| {
        println!("{:>12} tone 0x{val:02X}", "buzzer".cyan());
    });

    bus.register_in(ports::KEYPAD, || 0xFF);
    for dip in 0..8u8 {
        bus.register_in(ports::DIP_BASE + dip, || 0);
    }
    bus.register_in(ports::BUTTONS, || 0);

    bus.register_in(ports::RTC_SECONDS, || (host_seconds() % 60) as u8);
    bus.register_in(ports::RTC_MINUTES, || (host_seconds() / 60 % 60) as u8);
    bus.register_in(ports::RTC_HOURS, || (host_seconds() / 3600 % 24) as u8);
}

fn host_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn render_leds(val: u8) -> String {
    (0..8)
        .rev()
        .map(|bit| if val & (1 << bit) != 0 { '#' } else { '.' })
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::asm::assemble;
    use std::cell::Cell;
    use std::rc::Rc;

    fn capture_port(machine: &mut Machine, port: u8) -> Rc<Cell<u8>> {
        let seen = Rc::new(Cell::new(0u8));
        let sink = seen.clone();
        machine.bus.register_out(port, move |val| sink.set(val));
        seen
    }

    #[test]
    fn assemble_load_run() {
        let asm = assemble("LD A, 10 : ADD A, 20 : OUT (0x17), A : HALT").unwrap();
        let mut machine = Machine::new();
        let seen = capture_port(&mut machine, 0x17);
        machine.load_assembly(&asm);
        let steps = machine.run(DEFAULT_STEP_LIMIT).unwrap();
        assert_eq!(steps, 4);
        assert_eq!(seen.get(), 30);
        assert_eq!(machine.cpu.regs.a, 30);
    }

    #[test]
    fn run_stops_at_limit() {
        let asm = assemble("loop: JR loop").unwrap();
        let mut machine = Machine::new();
        machine.load_assembly(&asm);
        let steps = machine.run(100).unwrap();
        assert_eq!(steps, 100);
        assert!(!machine.cpu.halted);
    }

    #[test]
    fn fault_surfaces_with_state_preserved() {
        let asm = assemble("LD B, 0x55\nRET").unwrap();
        let mut machine = Machine::new();
        machine.load_assembly(&asm);
        let err = machine.run(DEFAULT_STEP_LIMIT).unwrap_err();
        assert_eq!(err, Fault::StackUnderflow);
        assert!(machine.cpu.halted);
        assert_eq!(machine.cpu.regs.b, 0x55);
    }

    #[test]
    fn reset_clears_memory_and_cpu() {
        let mut machine = Machine::new();
        machine.load(0, &[0x76]);
        machine.run(10).unwrap();
        machine.reset();
        assert_eq!(machine.mem.read(0), 0);
        assert!(!machine.cpu.halted);
        assert_eq!(machine.cpu.regs.pc, 0);
    }

    #[test]
    fn rtc_ports_answer() {
        let mut machine = Machine::new();
        attach_console_peripherals(&mut machine.bus);
        assert!(machine.bus.read(ports::RTC_SECONDS) < 60);
        assert!(machine.bus.read(ports::RTC_HOURS) < 24);
        assert_eq!(machine.bus.read(ports::KEYPAD), 0xFF);
    }

    #[test]
    fn led_rendering() {
        assert_eq!(render_leds(0b1000_0001), "#......#");
    }
}
