//! End-to-end programs through the public API: assemble, load, run, and
//! check the observable machine state afterwards.

use std::cell::Cell;
use std::rc::Rc;

use zax::cpu::{FLAG_C, FLAG_H, FLAG_PV, FLAG_Z};
use zax::runtime::DEFAULT_STEP_LIMIT;
use zax::{assemble, disasm, Machine, Memory};

fn run_program(src: &str) -> Machine {
    let assembly = assemble(src).expect("program should assemble");
    let mut machine = Machine::new();
    machine.load_assembly(&assembly);
    machine.run(DEFAULT_STEP_LIMIT).expect("program should not fault");
    assert!(machine.cpu.halted, "program should reach HALT");
    machine
}

fn capture_port(machine: &mut Machine, port: u8) -> Rc<Cell<u8>> {
    let seen = Rc::new(Cell::new(0u8));
    let sink = seen.clone();
    machine.bus.register_out(port, move |val| sink.set(val));
    seen
}

#[test]
fn add_and_out() {
    let assembly = assemble("LD A, 10 : ADD A, 20 : OUT (0x17), A : HALT").unwrap();
    let mut machine = Machine::new();
    let seen = capture_port(&mut machine, 0x17);
    machine.load_assembly(&assembly);
    machine.run(DEFAULT_STEP_LIMIT).unwrap();
    assert_eq!(seen.get(), 30);
    assert_eq!(machine.cpu.regs.a, 30);
    assert!(!machine.cpu.regs.flag(FLAG_C));
}

#[test]
fn overflow_sets_carry_zero_half() {
    let assembly = assemble("LD A, 0xFF : ADD A, 0x01 : OUT (0x00), A : HALT").unwrap();
    let mut machine = Machine::new();
    let seen = capture_port(&mut machine, 0x00);
    machine.load_assembly(&assembly);
    machine.run(DEFAULT_STEP_LIMIT).unwrap();
    assert_eq!(seen.get(), 0);
    assert!(machine.cpu.regs.flag(FLAG_Z));
    assert!(machine.cpu.regs.flag(FLAG_C));
    assert!(machine.cpu.regs.flag(FLAG_H));
}

#[test]
fn djnz_loop_counts() {
    let assembly =
        assemble("LD B, 3 : LD A, 0 :L: INC A : DJNZ L : OUT (0x17), A : HALT").unwrap();
    let mut machine = Machine::new();
    let seen = capture_port(&mut machine, 0x17);
    machine.load_assembly(&assembly);
    machine.run(DEFAULT_STEP_LIMIT).unwrap();
    assert_eq!(seen.get(), 3);
}

#[test]
fn sixteen_bit_store_and_reload() {
    let machine = run_program(
        "LD HL, 0x1234 : LD (0x8000), HL : LD HL, 0 : LD HL, (0x8000) : HALT",
    );
    assert_eq!(machine.cpu.regs.h, 0x12);
    assert_eq!(machine.cpu.regs.l, 0x34);
    assert_eq!(machine.mem.read(0x8000), 0x34);
    assert_eq!(machine.mem.read(0x8001), 0x12);
}

#[test]
fn rlca_wraps_into_carry() {
    let assembly = assemble("LD A, 0x80 : RLCA : OUT (0x17), A : HALT").unwrap();
    let mut machine = Machine::new();
    let seen = capture_port(&mut machine, 0x17);
    machine.load_assembly(&assembly);
    machine.run(DEFAULT_STEP_LIMIT).unwrap();
    assert_eq!(seen.get(), 0x01);
    assert!(machine.cpu.regs.flag(FLAG_C));
}

#[test]
fn ldir_copies_and_clears_pv() {
    let machine = run_program(
        "LD HL, src : LD DE, dst : LD BC, 4 : LDIR : HALT
         src: DB 0xAA, 0xBB, 0xCC, 0xDD
         dst: DS 4",
    );
    let dst = machine.cpu.regs.de().wrapping_sub(4);
    assert_eq!(machine.mem.read(dst), 0xAA);
    assert_eq!(machine.mem.read(dst.wrapping_add(3)), 0xDD);
    assert_eq!(machine.cpu.regs.bc(), 0);
    assert!(!machine.cpu.regs.flag(FLAG_PV));
}

#[test]
fn push_pop_roundtrip_preserves_state() {
    let machine = run_program(
        "LD BC, 0xBEEF : LD HL, 0x1234 : PUSH BC : POP DE : HALT",
    );
    assert_eq!(machine.cpu.regs.de(), 0xBEEF);
    assert_eq!(machine.cpu.regs.bc(), 0xBEEF);
    assert_eq!(machine.cpu.regs.hl(), 0x1234);
    assert_eq!(machine.cpu.regs.sp, 0xFFFF);
}

#[test]
fn exchange_twice_restores() {
    let machine = run_program(
        "LD HL, 0x1111 : LD DE, 0x2222 : EX DE, HL : EX DE, HL : EXX : EXX : HALT",
    );
    assert_eq!(machine.cpu.regs.hl(), 0x1111);
    assert_eq!(machine.cpu.regs.de(), 0x2222);
}

#[test]
fn add_carry_truth_table() {
    // exhaustive 8-bit addition against the reference semantics
    let assembly = assemble("ADD A, B : HALT").unwrap();
    for x in 0..=255u16 {
        for y in (0..=255u16).step_by(17) {
            let mut machine = Machine::new();
            machine.load_assembly(&assembly);
            machine.cpu.regs.a = x as u8;
            machine.cpu.regs.b = y as u8;
            machine.run(DEFAULT_STEP_LIMIT).unwrap();
            assert_eq!(machine.cpu.regs.a, ((x + y) & 0xFF) as u8);
            assert_eq!(machine.cpu.regs.flag(FLAG_C), x + y > 0xFF);
        }
    }
}

#[test]
fn jr_offsets_land_on_labels() {
    let src = "
        start: JR mid
        DS 0x40
        mid: JR fin
        DS 0x60
        fin: HALT
    ";
    let assembly = assemble(src).unwrap();
    // walk the two JRs and verify target arithmetic
    let mid = assembly.labels["MID"];
    let fin = assembly.labels["FIN"];
    let e0 = assembly.image[1] as i8;
    assert_eq!(0i32 + 2 + e0 as i32, mid as i32);
    let e1 = assembly.image[mid as usize + 1] as i8;
    assert_eq!(mid as i32 + 2 + e1 as i32, fin as i32);

    let mut machine = Machine::new();
    machine.load_assembly(&assembly);
    machine.run(DEFAULT_STEP_LIMIT).unwrap();
    assert_eq!(machine.cpu.regs.pc, fin + 1);
}

#[test]
fn interrupt_service_routine_runs() {
    let src = "
        ORG 0x00
        EI
        idle: JR idle

        ORG 0x38
        LD A, 0x42
        OUT (0x17), A
        HALT
    ";
    let assembly = assemble(src).unwrap();
    let mut machine = Machine::new();
    let seen = capture_port(&mut machine, 0x17);
    machine.load_assembly(&assembly);
    for _ in 0..10 {
        machine.step().unwrap();
    }
    machine.bus.trigger_interrupt();
    machine.run(DEFAULT_STEP_LIMIT).unwrap();
    assert_eq!(seen.get(), 0x42);
    assert!(machine.cpu.halted);
}

#[test]
fn peripheral_input_feeds_program() {
    let src = "
        IN A, (0x50)
        AND 0x01
        OUT (0x00), A
        HALT
    ";
    let assembly = assemble(src).unwrap();
    let mut machine = Machine::new();
    machine.bus.register_in(0x50, || 0x81);
    let seen = capture_port(&mut machine, 0x00);
    machine.load_assembly(&assembly);
    machine.run(DEFAULT_STEP_LIMIT).unwrap();
    assert_eq!(seen.get(), 0x01);
}

#[test]
fn registers_stay_in_range_through_noise() {
    // pseudo-random arithmetic program; every register must stay 8/16-bit
    let src = "
        LD A, 0x5A
        LD B, 0xC3
        loop: ADD A, B
        RLCA
        DJNZ loop
        HALT
    ";
    let machine = run_program(src);
    assert_eq!(machine.cpu.regs.b, 0);
    // fields are u8/u16 by construction; PC must sit just past HALT
    assert_eq!(machine.cpu.regs.pc as usize, assemble(src).unwrap().image.len());
}

#[test]
fn reassembled_disassembly_matches_for_sample_programs() {
    let samples = [
        "LD A, 10 : ADD A, 20 : OUT (0x17), A : HALT",
        "LD B, 3 : LD A, 0 :L: INC A : DJNZ L : OUT (0x17), A : HALT",
        "LD HL, 0x1234 : LD (0x8000), HL : LD HL, 0 : LD HL, (0x8000) : HALT",
        "LD A, 0x80 : RLCA : OUT (0x17), A : HALT",
        "LD HL, 0x4000 : LD DE, 0x5000 : LD BC, 4 : LDIR : HALT",
        "LD IX, 0x9000 : LD (IX+2), 0x55 : SET 7, (IX+2) : BIT 3, B : RETI",
    ];
    for src in samples {
        let first = assemble(src).unwrap();
        let mut mem = Memory::new();
        mem.load(0, &first.image);
        let listing = disasm::disasm_range(&mem, 0, first.image.len() as u16)
            .into_iter()
            .map(|(_, instr)| instr.text)
            .collect::<Vec<_>>()
            .join("\n");
        let second = assemble(&listing).unwrap();
        assert_eq!(first.image, second.image, "round trip diverged for {src:?}");
    }
}
