//! CPU front-end
//!
//! Ties together fetch, decode, execute and trap handling into the
//! step loop (§4.1 "Execution cycle"). This is also where the
//! responsibility split documented in `crate::trap` and `crate::memory`
//! is resolved: traps raised deep in the memory subsystem carry
//! `pc = 0` and get the real fetch/execute address stamped on here.

use crate::decode::decode;
use crate::exec::execute;
use crate::memory::Memory;
use crate::state::State;
use crate::syscall::{self, SyscallArgs, SyscallOutcome, SyscallState};
use crate::trap::{Cause, Trap};

/// Why a call to [`Cpu::run`] returned.
#[derive(Debug)]
pub enum StopReason {
    /// The guest issued `exit`/`exit_group` with this status code.
    Exited(i32),
    /// An unrecoverable trap reached the front-end.
    Trapped(Trap),
    /// A configured breakpoint (PC or cycle count) was hit.
    Breakpoint,
    /// The guest issued a syscall number this emulator does not
    /// implement (§4.6, §7).
    UnknownSyscall(u32),
}

/// One per-instruction trace line's worth of decoded fields (§6 "Trace
/// sink"): `PC=0x<hex> INST=0x<hex> rd=<dec> rs1=<dec> rs2=<dec>
/// imm=<dec>`.
#[derive(Debug, Clone, Copy)]
pub struct TraceRecord {
    pub pc: u32,
    pub raw: u32,
    pub rd: u8,
    pub rs1: u8,
    pub rs2: u8,
    pub imm: i32,
}

/// Optional hooks the front-end can install to observe execution
/// without the step loop itself knowing about tracing, breakpoints or
/// statistics (§10.5, §10.6).
#[derive(Default)]
pub struct StepHooks {
    pub pc_breakpoint: Option<u32>,
    pub cycle_breakpoint: Option<u64>,
    pub trace: Option<Box<dyn FnMut(TraceRecord)>>,
}

pub struct Cpu {
    pub state: State,
    pub memory: Memory,
    pub syscalls: SyscallState,
    pub instructions_retired: u64,
}

impl Cpu {
    pub fn new(state: State, memory: Memory, syscalls: SyscallState) -> Self {
        Self { state, memory, syscalls, instructions_retired: 0 }
    }

    /// Execute exactly one instruction: fetch, decode, execute, and
    /// handle any trap raised along the way.
    ///
    /// Returns `Ok(None)` when the instruction retired normally,
    /// `Ok(Some(reason))` when the guest requested termination, and
    /// `Err(trap)` for any trap other than a recoverable `ecall`.
    pub fn step(&mut self) -> Result<Option<StopReason>, Trap> {
        let pc = self.state.read_pc();
        if pc % 4 != 0 {
            return Err(Trap::misaligned(pc, pc));
        }

        let word = self.memory.read_word(pc).map_err(|t| t.with_pc(pc))?;
        let decoded = decode(word);

        match execute(&decoded, pc, &mut self.state, &mut self.memory) {
            Ok(()) => {
                self.instructions_retired += 1;
                Ok(None)
            }
            Err(trap) if trap.cause == Cause::EnvironmentCall => {
                self.instructions_retired += 1;
                match self.handle_ecall(pc)? {
                    SyscallOutcome::Continue => {
                        self.state.write_pc(pc.wrapping_add(4));
                        Ok(None)
                    }
                    SyscallOutcome::Exit(code) => Ok(Some(StopReason::Exited(code))),
                    SyscallOutcome::Unknown(number) => Ok(Some(StopReason::UnknownSyscall(number))),
                }
            }
            Err(trap) => Err(trap),
        }
    }

    fn handle_ecall(&mut self, pc: u32) -> Result<SyscallOutcome, Trap> {
        let args = SyscallArgs {
            number: self.state.read_register(17).unwrap_or(0),
            a0: self.state.read_register(10).unwrap_or(0),
            a1: self.state.read_register(11).unwrap_or(0),
            a2: self.state.read_register(12).unwrap_or(0),
        };
        syscall::handle(&args, &mut self.state, &mut self.memory, &mut self.syscalls)
            .map_err(|e| e.into_trap().with_pc(pc))
    }

    /// Run until the guest exits, an unrecoverable trap occurs, or a
    /// configured breakpoint is hit.
    pub fn run(&mut self, hooks: &mut StepHooks) -> StopReason {
        loop {
            if let Some(bp) = hooks.pc_breakpoint {
                if self.state.read_pc() == bp {
                    return StopReason::Breakpoint;
                }
            }
            if let Some(bp) = hooks.cycle_breakpoint {
                if self.instructions_retired == bp {
                    return StopReason::Breakpoint;
                }
            }

            let pc = self.state.read_pc();
            // Emitted before execute, per §4.5/§6: a decode-only peek at
            // the about-to-run instruction, independent of `step`'s own
            // fetch so the step loop's public API stays trace-agnostic.
            if let Some(trace) = hooks.trace.as_mut() {
                if let Ok(word) = self.memory.read_word(pc) {
                    let decoded = decode(word);
                    trace(TraceRecord {
                        pc,
                        raw: word,
                        rd: decoded.rd,
                        rs1: decoded.rs1,
                        rs2: decoded.rs2,
                        imm: decoded.imm,
                    });
                }
            }

            match self.step() {
                Ok(None) => {}
                Ok(Some(reason)) => return reason,
                Err(trap) => return StopReason::Trapped(trap),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryMap, RegionDescriptor};

    fn cpu_with(words: &[u32]) -> Cpu {
        let map: MemoryMap = vec![RegionDescriptor::ram(0, 0x1000)];
        let mut memory = Memory::new(&map).unwrap();
        for (i, word) in words.iter().enumerate() {
            memory.write_word((i as u32) * 4, *word).unwrap();
        }
        let state = State::new();
        let syscalls = SyscallState::new(0x800);
        Cpu::new(state, memory, syscalls)
    }

    #[test]
    fn steps_advance_pc_and_count_instructions() {
        // addi x1, x0, 1 ; addi x1, x1, 1
        let mut cpu = cpu_with(&[0x0010_0093, 0x0010_8093]);
        cpu.step().unwrap();
        cpu.step().unwrap();
        assert_eq!(cpu.state.read_pc(), 8);
        assert_eq!(cpu.instructions_retired, 2);
        assert_eq!(cpu.state.read_register(1).unwrap(), 2);
    }

    #[test]
    fn misaligned_fetch_traps_at_the_unaligned_pc() {
        let mut cpu = cpu_with(&[0x0000_0013]);
        cpu.state.write_pc(2);
        let err = cpu.step().unwrap_err();
        assert_eq!(err.cause, Cause::MisalignedAccess);
        assert_eq!(err.pc, 2);
    }

    #[test]
    fn ecall_exit_is_reported_as_a_stop_reason() {
        // addi a0, x0, 7 ; addi a7, x0, 93 ; ecall
        let mut cpu = cpu_with(&[0x0070_0513, 0x05d0_0893, 0x0000_0073]);
        cpu.step().unwrap();
        cpu.step().unwrap();
        let reason = cpu.step().unwrap();
        assert!(matches!(reason, Some(StopReason::Exited(7))));
    }

    #[test]
    fn illegal_instruction_is_not_swallowed() {
        let mut cpu = cpu_with(&[0xffff_ffff]);
        let err = cpu.step().unwrap_err();
        assert_eq!(err.cause, Cause::IllegalInstruction);
    }
}
