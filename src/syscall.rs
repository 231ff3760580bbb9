//! Guest syscall ABI
//!
//! A minimal Linux-like syscall surface, enough to run statically
//! linked newlib/musl-style programs that only need console I/O and a
//! bump-pointer heap (SPEC_FULL.md §4.6, grounded in
//! `original_source/include/riscv/platform/Syscall.hpp`). The calling
//! convention matches the standard RISC-V Linux ABI: `a7` selects the
//! syscall, `a0`..`a2` carry its arguments, and the return value (or
//! `-1` as `0xffff_ffff` on error) is written back to `a0`.

use std::io::Read as _;
use std::sync::mpsc;
use std::thread;

use queues::{IsQueue, Queue};
use thiserror::Error;

use crate::memory::Memory;
use crate::state::State;
use crate::trap::Trap;

const SYS_READ: u32 = 63;
const SYS_WRITE: u32 = 64;
const SYS_EXIT: u32 = 93;
const SYS_BRK: u32 = 214;
const SYS_BRK_LEGACY: u32 = 80;
const SYS_MUNMAP: u32 = 215;
const SYS_MMAP: u32 = 222;

const PAGE_SIZE: u32 = 4096;
/// Offset below the guest stack pointer where the anonymous-mapping
/// watermark starts (§4.6: `mmap_top ← sp − 0x10000`).
const MMAP_BELOW_SP: u32 = 0x10000;
/// Register index of the guest stack pointer in the standard RISC-V
/// calling convention.
const SP_REGISTER: u8 = 2;

const NEG_ONE: u32 = 0xffff_ffff;

/// Registers `a0`..`a2` and `a7` at the point of an ECALL.
pub struct SyscallArgs {
    pub number: u32,
    pub a0: u32,
    pub a1: u32,
    pub a2: u32,
}

/// Outcome of handling one syscall: either guest execution continues
/// (with `a0` set to the return value already written into `State`),
/// or the guest asked to terminate.
pub enum SyscallOutcome {
    Continue,
    Exit(i32),
    /// The guest issued a syscall number this emulator does not
    /// implement. Per §4.6/§7 this halts the run rather than returning
    /// `-1` to the guest: an unrecognized call number means the guest
    /// ABI contract itself was violated, not an ordinary I/O failure.
    Unknown(u32),
}

#[derive(Debug, Error)]
pub enum SyscallError {
    #[error(transparent)]
    Memory(#[from] TrapAsError),
}

impl SyscallError {
    /// Recover the [`Trap`] a failed guest memory access raised, so the
    /// caller can report its real cause and address instead of
    /// fabricating one (§3, §6 "Termination").
    pub fn into_trap(self) -> Trap {
        let SyscallError::Memory(TrapAsError(trap)) = self;
        trap
    }
}

/// A [`Trap`] raised by a memory access performed on behalf of a
/// syscall. Wrapped so [`SyscallError`] can implement
/// [`std::error::Error`] without requiring `Trap` itself to (it is a
/// value type consumed by the CPU's trap-handling path, not a
/// host-facing error).
#[derive(Debug)]
pub struct TrapAsError(pub Trap);

impl std::fmt::Display for TrapAsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for TrapAsError {}

impl From<Trap> for SyscallError {
    fn from(trap: Trap) -> Self {
        SyscallError::Memory(TrapAsError(trap))
    }
}

/// Guest-visible memory management and console I/O state that outlives
/// any single syscall. `program_break` and `mmap_top` are `None` until
/// the first `brk`/`mmap` call lazily initializes them (§4.6, §3 "Heap/
/// mmap bookkeeping"): zero is a legitimate guest address, so it cannot
/// double as "uninitialized".
pub struct SyscallState {
    image_end: u32,
    program_break: Option<u32>,
    mmap_top: Option<u32>,
    stdin_queue: Queue<u8>,
    /// The receiving end of a background stdin-reading thread, started
    /// lazily by the first `read` syscall (see `ensure_stdin_reader`).
    /// `None` until then, so a guest that never reads never touches
    /// host stdin at all.
    stdin_rx: Option<mpsc::Receiver<u8>>,
}

impl SyscallState {
    /// `image_end` is the first address past the loaded ELF image,
    /// supplied by the loader and used to seed `program_break` on the
    /// first heap call.
    pub fn new(image_end: u32) -> Self {
        Self {
            image_end,
            program_break: None,
            mmap_top: None,
            stdin_queue: Queue::new(),
            stdin_rx: None,
        }
    }

    /// Lazily initialize both `program_break` and `mmap_top` together,
    /// the first time either is observed to be unset (§4.6: "Lazy init
    /// on first call"). `sp` is the guest stack pointer (`x2`) at the
    /// moment of the call that triggers initialization.
    fn ensure_init(&mut self, sp: u32) {
        if self.program_break.is_none() {
            self.program_break = Some(self.image_end);
        }
        if self.mmap_top.is_none() {
            self.mmap_top = Some(sp.wrapping_sub(MMAP_BELOW_SP));
        }
    }

    /// Feed bytes directly into the buffered stdin queue, bypassing host
    /// stdin entirely. Lets a harness (or a test) drive a guest's `read`
    /// syscall with deterministic input instead of the process's actual
    /// stdin.
    pub fn feed_stdin(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            let _ = self.stdin_queue.add(byte);
        }
    }

    /// Start the background thread that reads host stdin one byte at a
    /// time and forwards it over a channel, if it is not already
    /// running. Only `sys_read` calls this, and only on its first
    /// invocation: nothing in the CPU step loop touches host stdin, so a
    /// guest that never issues `read` never blocks on it (§5).
    fn ensure_stdin_reader(&mut self) {
        if self.stdin_rx.is_some() {
            return;
        }
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let stdin = std::io::stdin();
            let mut byte = [0u8; 1];
            loop {
                match stdin.lock().read(&mut byte) {
                    Ok(1) => {
                        if tx.send(byte[0]).is_err() {
                            break;
                        }
                    }
                    _ => break,
                }
            }
        });
        self.stdin_rx = Some(rx);
    }

    /// Block for exactly one byte of input: the manually-fed queue
    /// first (so tests and harnesses stay deterministic), falling back
    /// to the real host stdin reader thread.
    fn blocking_stdin_byte(&mut self) -> Option<u8> {
        match self.stdin_queue.remove() {
            Ok(byte) => Some(byte),
            Err(_) => self.stdin_rx.as_ref().and_then(|rx| rx.recv().ok()),
        }
    }

    /// Take one more byte of input only if it is already available,
    /// without blocking.
    fn nonblocking_stdin_byte(&mut self) -> Option<u8> {
        match self.stdin_queue.remove() {
            Ok(byte) => Some(byte),
            Err(_) => self.stdin_rx.as_ref().and_then(|rx| rx.try_recv().ok()),
        }
    }
}

fn round_up_to_page(size: u32) -> u32 {
    size.div_ceil(PAGE_SIZE) * PAGE_SIZE
}

/// Handle one ECALL. `state` and `memory` are the guest's architectural
/// state; `syscalls` is the host-side bookkeeping carried across calls.
pub fn handle(
    args: &SyscallArgs,
    state: &mut State,
    memory: &mut Memory,
    syscalls: &mut SyscallState,
) -> Result<SyscallOutcome, SyscallError> {
    let result = match args.number {
        SYS_READ => sys_read(args, memory, syscalls)?,
        SYS_WRITE => sys_write(args, memory)?,
        SYS_BRK | SYS_BRK_LEGACY => sys_brk(args, state, memory, syscalls)?,
        SYS_MMAP => sys_mmap(args, state, memory, syscalls)?,
        SYS_MUNMAP => sys_munmap(args, syscalls),
        SYS_EXIT => {
            let code = args.a0 as i32;
            use std::io::Write as _;
            let mut out = std::io::stdout();
            let _ = write!(out, "\n[program exited with code {code}]\n");
            let _ = out.flush();
            return Ok(SyscallOutcome::Exit(code));
        }
        other => {
            eprintln!("=== UNRECOGNIZED SYSCALL ===");
            eprintln!("number:  {other}");
            eprintln!("a0..a2:  0x{:08x} 0x{:08x} 0x{:08x}", args.a0, args.a1, args.a2);
            return Ok(SyscallOutcome::Unknown(other));
        }
    };
    state.write_register(10, result).expect("a0 is a valid register index");
    Ok(SyscallOutcome::Continue)
}

/// `read(fd, buf, len)`: blocks for exactly one byte (or observes
/// end-of-stream), then opportunistically drains any further bytes
/// already available from the host, up to `len` (§4.6). Host stdin is
/// only ever touched from here, on a guest's actual `read` call — never
/// from the CPU step loop, so a guest that does no I/O never blocks on
/// it (§5).
fn sys_read(
    args: &SyscallArgs,
    memory: &mut Memory,
    syscalls: &mut SyscallState,
) -> Result<u32, SyscallError> {
    if args.a0 != 0 {
        return Ok(NEG_ONE);
    }
    let (buf, count) = (args.a1, args.a2);
    if count == 0 {
        return Ok(0);
    }

    syscalls.ensure_stdin_reader();

    let Some(first) = syscalls.blocking_stdin_byte() else {
        return Ok(0);
    };
    memory.write_byte(buf, first)?;

    let mut written = 1u32;
    while written < count {
        match syscalls.nonblocking_stdin_byte() {
            Some(byte) => {
                memory.write_byte(buf.wrapping_add(written), byte)?;
                written += 1;
            }
            None => break,
        }
    }
    Ok(written)
}

/// `write(fd, buf, len)`: only `fd` 1 (stdout) and 2 (stderr) are
/// accepted, both mapped onto host stdout (§4.6).
fn sys_write(args: &SyscallArgs, memory: &Memory) -> Result<u32, SyscallError> {
    if args.a0 != 1 && args.a0 != 2 {
        return Ok(NEG_ONE);
    }
    let (buf, count) = (args.a1, args.a2);
    let mut out = std::io::stdout();
    use std::io::Write as _;
    for i in 0..count {
        let byte = memory.read_byte(buf.wrapping_add(i))?;
        let _ = out.write_all(&[byte]);
    }
    let _ = out.flush();
    Ok(count)
}

/// `brk(new_brk)`: `0` queries the current break; otherwise the
/// request must land in `[current_break, mmap_top - 4096)` or it is
/// rejected without mutating any bookkeeping (§4.6).
fn sys_brk(
    args: &SyscallArgs,
    state: &State,
    memory: &mut Memory,
    syscalls: &mut SyscallState,
) -> Result<u32, SyscallError> {
    let sp = state.read_register(SP_REGISTER).unwrap_or(0);
    syscalls.ensure_init(sp);
    let current = syscalls.program_break.expect("ensure_init just set this");
    let mmap_top = syscalls.mmap_top.expect("ensure_init just set this");

    let requested = args.a0;
    if requested == 0 {
        return Ok(current);
    }
    if requested < current || requested >= mmap_top.wrapping_sub(PAGE_SIZE) {
        return Ok(NEG_ONE);
    }

    memory.fill(current, 0, requested - current)?;
    syscalls.program_break = Some(requested);
    Ok(requested)
}

/// `mmap(_, len, ...)`: allocates the next page-aligned window
/// immediately below `mmap_top`, rejecting the request if it would
/// come within one guard page of `program_break` (§4.6).
fn sys_mmap(
    args: &SyscallArgs,
    state: &State,
    memory: &mut Memory,
    syscalls: &mut SyscallState,
) -> Result<u32, SyscallError> {
    let sp = state.read_register(SP_REGISTER).unwrap_or(0);
    syscalls.ensure_init(sp);
    let program_break = syscalls.program_break.expect("ensure_init just set this");
    let mmap_top = syscalls.mmap_top.expect("ensure_init just set this");

    let length = round_up_to_page(args.a1);
    let new_base = mmap_top.wrapping_sub(length);
    if new_base < program_break.wrapping_add(PAGE_SIZE) {
        return Ok(NEG_ONE);
    }

    memory.fill(new_base, 0, length)?;
    syscalls.mmap_top = Some(new_base);
    Ok(new_base)
}

/// `munmap(addr, len)`: only shrinks bookkeeping when `addr` is
/// exactly the current watermark; always reports success (§4.6).
fn sys_munmap(args: &SyscallArgs, syscalls: &mut SyscallState) -> u32 {
    let length = round_up_to_page(args.a1);
    if let Some(top) = syscalls.mmap_top {
        if args.a0 == top {
            syscalls.mmap_top = Some(top.wrapping_add(length));
        }
    }
    0
}
