//! Synchronous trap descriptor
//!
//! A [`Trap`] is the value-typed payload carried out of the execution
//! engine whenever architectural semantics cannot complete normally.
//! Traps are synchronous: they are always detected during the fetch or
//! execute phase of exactly one instruction, and are always caught at
//! the step boundary in the CPU front-end (see `crate::cpu`).
//!
//! There is no interrupt, privilege level, or asynchronous signal in
//! this emulator (see the non-goals in the crate-level documentation);
//! `Cause` is therefore a small, closed set.

use std::fmt;

/// The closed set of synchronous exception causes this emulator can
/// raise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cause {
    IllegalInstruction,
    LoadAccessFault,
    StoreAccessFault,
    MisalignedAccess,
    EnvironmentCall,
}

impl fmt::Display for Cause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Cause::IllegalInstruction => "IllegalInstruction",
            Cause::LoadAccessFault => "LoadAccessFault",
            Cause::StoreAccessFault => "StoreAccessFault",
            Cause::MisalignedAccess => "MisalignedAccess",
            Cause::EnvironmentCall => "EnvironmentCall",
        };
        f.write_str(name)
    }
}

/// A synchronous trap.
///
/// `pc` is the address of the faulting instruction. Components that
/// raise a trap before the front-end has substituted the current PC
/// (for example the memory subsystem, which has no notion of PC) set
/// `pc` to 0; the front-end fills in the real value when it catches
/// the trap (§4.2 "Responsibility split").
///
/// `addr` is the faulting address, when the cause is address-related
/// (a load/store fault or a misaligned access); `None` otherwise.
///
/// `raw` is the raw instruction word, kept for illegal-instruction and
/// trap diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Trap {
    pub cause: Cause,
    pub pc: u32,
    pub addr: Option<u32>,
    pub raw: u32,
}

impl Trap {
    pub fn new(cause: Cause, pc: u32, addr: Option<u32>, raw: u32) -> Self {
        Self { cause, pc, addr, raw }
    }

    /// Construct a misaligned-access trap, e.g. for the fetch-time
    /// alignment check in the CPU front-end.
    pub fn misaligned(pc: u32, addr: u32) -> Self {
        Self::new(Cause::MisalignedAccess, pc, Some(addr), 0)
    }

    /// A numeric index for the cause, used only in diagnostics.
    pub fn cause_index(&self) -> u32 {
        match self.cause {
            Cause::IllegalInstruction => 0,
            Cause::LoadAccessFault => 1,
            Cause::StoreAccessFault => 2,
            Cause::MisalignedAccess => 3,
            Cause::EnvironmentCall => 4,
        }
    }

    /// Rewrite the PC carried by this trap. Used by the front-end to
    /// fill in the real faulting PC for traps raised deep inside the
    /// memory subsystem, which has no notion of PC (§4.2).
    pub fn with_pc(mut self, pc: u32) -> Self {
        self.pc = pc;
        self
    }
}

impl fmt::Display for Trap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at pc=0x{:08x}", self.cause, self.pc)?;
        if let Some(addr) = self.addr {
            write!(f, " addr=0x{addr:08x}")?;
        }
        Ok(())
    }
}
