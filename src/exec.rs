//! Execution engine
//!
//! Implements the architectural semantics of every RV32IM opcode
//! (unprivileged spec chapters 2 "RV32I" and 7 "RV32M"). Each
//! instruction either updates the program counter exactly once or
//! returns a [`Trap`] (§3 invariants); this module is the only place
//! PC can be written other than [`crate::state::State::reset`].

use crate::decode::{opcode, Decoded};
use crate::memory::Memory;
use crate::state::State;
use crate::trap::{Cause, Trap};

/// Execute one decoded instruction.
///
/// `pc` is the address the instruction was fetched from. On success,
/// `state`'s program counter has been updated exactly once: to
/// `pc + 4` for everything but a taken branch/jump, or to the taken
/// target otherwise. On failure, a [`Trap`] is returned and the
/// program counter is left untouched; the caller (the CPU front-end)
/// decides how to resume.
pub fn execute(decoded: &Decoded, pc: u32, state: &mut State, memory: &mut Memory) -> Result<(), Trap> {
    let next_pc = pc.wrapping_add(4);
    let mut branch_target: Option<u32> = None;
    let imm = decoded.imm as u32;

    match decoded.opcode {
        opcode::LUI => {
            set_reg(state, decoded.rd, imm);
        }
        opcode::AUIPC => {
            set_reg(state, decoded.rd, pc.wrapping_add(imm));
        }
        opcode::JAL => {
            set_reg(state, decoded.rd, next_pc);
            branch_target = Some(pc.wrapping_add(imm));
        }
        opcode::JALR => {
            let target = read_reg(state, decoded.rs1).wrapping_add(imm) & !1u32;
            set_reg(state, decoded.rd, next_pc);
            branch_target = Some(target);
        }
        opcode::BRANCH => {
            let a = read_reg(state, decoded.rs1);
            let b = read_reg(state, decoded.rs2);
            let taken = match decoded.funct3 {
                0 => a == b,                                 // BEQ
                1 => a != b,                                 // BNE
                4 => (a as i32) < (b as i32),                 // BLT
                5 => (a as i32) >= (b as i32),                // BGE
                6 => a < b,                                  // BLTU
                7 => a >= b,                                 // BGEU
                _ => return Err(illegal(pc, decoded.raw)),
            };
            if taken {
                branch_target = Some(pc.wrapping_add(imm));
            }
        }
        opcode::LOAD => {
            let addr = read_reg(state, decoded.rs1).wrapping_add(imm);
            let value = match decoded.funct3 {
                0 => sext8(load_byte(memory, addr, pc)?),
                1 => sext16(load_half(memory, addr, pc)?),
                2 => load_word(memory, addr, pc)?,
                4 => u32::from(load_byte(memory, addr, pc)?),
                5 => load_half(memory, addr, pc)?,
                _ => return Err(illegal(pc, decoded.raw)),
            };
            set_reg(state, decoded.rd, value);
        }
        opcode::STORE => {
            let addr = read_reg(state, decoded.rs1).wrapping_add(imm);
            let value = read_reg(state, decoded.rs2);
            match decoded.funct3 {
                0 => store_byte(memory, addr, value as u8, pc)?,
                1 => store_half(memory, addr, value, pc)?,
                2 => store_word(memory, addr, value, pc)?,
                _ => return Err(illegal(pc, decoded.raw)),
            }
        }
        opcode::OP_IMM => {
            let a = read_reg(state, decoded.rs1);
            let shamt = imm & 0x1f;
            let value = match decoded.funct3 {
                0 => a.wrapping_add(imm),                            // ADDI
                2 => u32::from((a as i32) < (decoded.imm)),           // SLTI
                3 => u32::from(a < imm),                              // SLTIU
                4 => a ^ imm,                                         // XORI
                6 => a | imm,                                        // ORI
                7 => a & imm,                                        // ANDI
                1 => a << shamt,                                      // SLLI
                5 => {
                    if decoded.funct7 & 0x20 != 0 {
                        ((a as i32) >> shamt) as u32 // SRAI
                    } else {
                        a >> shamt // SRLI
                    }
                }
                _ => return Err(illegal(pc, decoded.raw)),
            };
            set_reg(state, decoded.rd, value);
        }
        opcode::OP => {
            let a = read_reg(state, decoded.rs1);
            let b = read_reg(state, decoded.rs2);
            let value = if decoded.funct7 == 0x01 {
                execute_muldiv(decoded.funct3, a, b)
            } else {
                match (decoded.funct3, decoded.funct7) {
                    (0, 0x00) => a.wrapping_add(b),       // ADD
                    (0, 0x20) => a.wrapping_sub(b),        // SUB
                    (1, 0x00) => a << (b & 0x1f),          // SLL
                    (2, 0x00) => u32::from((a as i32) < (b as i32)), // SLT
                    (3, 0x00) => u32::from(a < b),         // SLTU
                    (4, 0x00) => a ^ b,                    // XOR
                    (5, 0x00) => a >> (b & 0x1f),          // SRL
                    (5, 0x20) => ((a as i32) >> (b & 0x1f)) as u32, // SRA
                    (6, 0x00) => a | b,                    // OR
                    (7, 0x00) => a & b,                    // AND
                    _ => return Err(illegal(pc, decoded.raw)),
                }
            };
            set_reg(state, decoded.rd, value);
        }
        opcode::SYSTEM => {
            if decoded.is_environment_call() {
                return Err(Trap::new(Cause::EnvironmentCall, pc, None, decoded.raw));
            }
            return Err(illegal(pc, decoded.raw));
        }
        _ => return Err(illegal(pc, decoded.raw)),
    }

    state.write_pc(branch_target.unwrap_or(next_pc));
    Ok(())
}

fn set_reg(state: &mut State, rd: u8, value: u32) {
    // rd is always a valid 5-bit field straight out of decode, so this
    // can only fail for a programming error elsewhere in the engine.
    state.write_register(rd, value).expect("decoded rd is always in range 0..=31");
}

fn read_reg(state: &State, rs: u8) -> u32 {
    // rs1/rs2 are always valid 5-bit fields straight out of decode.
    state.read_register(rs).expect("decoded rs1/rs2 is always in range 0..=31")
}

fn illegal(pc: u32, raw: u32) -> Trap {
    Trap::new(Cause::IllegalInstruction, pc, None, raw)
}

fn sext8(v: u8) -> u32 {
    v as i8 as i32 as u32
}

fn sext16(v: u32) -> u32 {
    v as u16 as i16 as i32 as u32
}

fn load_byte(memory: &Memory, addr: u32, pc: u32) -> Result<u8, Trap> {
    memory.read_byte(addr).map_err(|t| t.with_pc(pc))
}

fn load_half(memory: &Memory, addr: u32, pc: u32) -> Result<u32, Trap> {
    memory.read_half(addr).map_err(|t| t.with_pc(pc))
}

fn load_word(memory: &Memory, addr: u32, pc: u32) -> Result<u32, Trap> {
    memory.read_word(addr).map_err(|t| t.with_pc(pc))
}

fn store_byte(memory: &mut Memory, addr: u32, value: u8, pc: u32) -> Result<(), Trap> {
    memory.write_byte(addr, value).map_err(|t| t.with_pc(pc)).map(|_| ())
}

fn store_half(memory: &mut Memory, addr: u32, value: u32, pc: u32) -> Result<(), Trap> {
    memory.write_half(addr, value).map_err(|t| t.with_pc(pc)).map(|_| ())
}

fn store_word(memory: &mut Memory, addr: u32, value: u32, pc: u32) -> Result<(), Trap> {
    memory.write_word(addr, value).map_err(|t| t.with_pc(pc)).map(|_| ())
}

/// RV32M: multiply/divide (unprivileged spec chapter 7).
fn execute_muldiv(funct3: u8, a: u32, b: u32) -> u32 {
    let a_s = a as i32;
    let b_s = b as i32;
    match funct3 {
        0 => a.wrapping_mul(b), // MUL (low 32 bits; signed/unsigned low half coincide)
        1 => (((a_s as i64).wrapping_mul(b_s as i64)) >> 32) as u32, // MULH
        2 => (((a_s as i64).wrapping_mul(b as i64)) >> 32) as u32,  // MULHSU
        3 => (((a as u64).wrapping_mul(b as u64)) >> 32) as u32,    // MULHU
        4 => {
            // DIV
            if b == 0 {
                u32::MAX
            } else if a_s == i32::MIN && b_s == -1 {
                i32::MIN as u32
            } else {
                a_s.wrapping_div(b_s) as u32
            }
        }
        5 => {
            // DIVU
            if b == 0 {
                u32::MAX
            } else {
                a.wrapping_div(b)
            }
        }
        6 => {
            // REM
            if b == 0 {
                a
            } else if a_s == i32::MIN && b_s == -1 {
                0
            } else {
                a_s.wrapping_rem(b_s) as u32
            }
        }
        7 => {
            // REMU
            if b == 0 {
                a
            } else {
                a.wrapping_rem(b)
            }
        }
        _ => unreachable!("funct3 is a 3-bit field, all 8 values are handled above"),
    }
}
