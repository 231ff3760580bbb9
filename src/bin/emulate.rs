//! Command-line front-end
//!
//! Loads an ELF executable, runs it on the emulator core, and prints
//! run statistics or trap diagnostics when it stops. Grounded in the
//! teacher's `bin/emulate.rs` argument layout, generalized to RV32IM
//! and extended with the trace/statistics surface described in
//! `original_source/src/emulator/main.cpp`.

use std::fs::File;
use std::io::{self, Read, Write};
use std::sync::mpsc;
use std::thread;
use std::time::Instant;

use clap::Parser;
use clap_num::maybe_hex;

use rv32im_emu::cpu::{Cpu, StepHooks, StopReason, TraceRecord};
use rv32im_emu::loader;
use rv32im_emu::memory::{default_memory_map, Memory};
use rv32im_emu::state::State;
use rv32im_emu::syscall::SyscallState;

/// Emulate a 32-bit RISC-V (RV32IM) user-mode executable.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the input ELF executable.
    input: String,

    /// Print a per-instruction trace (pc, raw word, cycle count).
    #[arg(short, long)]
    trace: bool,

    /// Write the trace to this file instead of stdout; implies --trace.
    #[arg(long)]
    trace_file: Option<String>,

    /// Single-step through each instruction, printing state between
    /// steps.
    #[arg(short, long)]
    debug: bool,

    /// Treat any trap other than exit as a reported error instead of a
    /// silent halt.
    #[arg(short, long)]
    exceptions_are_errors: bool,

    /// Break on program counter match and begin single-stepping (use a
    /// 0x prefix for hexadecimal).
    #[arg(long, value_parser=maybe_hex::<u32>)]
    pc_breakpoint: Option<u32>,

    /// Break on retired-instruction count match and begin
    /// single-stepping (use a 0x prefix for hexadecimal).
    #[arg(long, value_parser=maybe_hex::<u64>)]
    cycle_breakpoint: Option<u64>,

    /// Print the 8-word memory region starting at this address at
    /// every breakpoint stop (use a 0x prefix for hexadecimal).
    #[arg(short, long, value_parser=maybe_hex::<u32>)]
    memory: Option<u32>,
}

fn press_enter_to_continue() {
    let mut stdout = io::stdout();
    write!(stdout, "Press enter to continue...").unwrap();
    stdout.flush().unwrap();
    let _ = io::stdin().read(&mut [0u8]).unwrap();
}

fn print_memory(memory: &Memory, base: u32) {
    for n in 0..8 {
        let addr = base.wrapping_add(4 * n);
        match memory.read_word(addr) {
            Ok(word) => println!("{addr:08x}: {word:08x}"),
            Err(trap) => println!("{addr:08x}: <{trap}>"),
        }
    }
}

fn build_cpu(input: &str) -> Result<(Cpu, u32), String> {
    let mut memory = Memory::new(&default_memory_map()).map_err(|e| e.to_string())?;
    let mut state = State::new();
    let image = loader::load(input, &mut memory, &mut state).map_err(|e| e.to_string())?;
    let syscalls = SyscallState::new(image.image_end);
    Ok((Cpu::new(state, memory, syscalls), image.entry))
}

fn report_stop(reason: &StopReason, cpu: &Cpu, exceptions_are_errors: bool) -> i32 {
    match reason {
        StopReason::Exited(code) => *code,
        StopReason::Trapped(trap) => {
            eprintln!("=== CPU TRAP ===");
            eprintln!("pc:      0x{:08x}", trap.pc);
            eprintln!("cause:   {} ({})", trap.cause, trap.cause_index());
            match trap.addr {
                Some(addr) => eprintln!("addr:    0x{addr:08x}"),
                None => eprintln!("addr:    <none>"),
            }
            eprintln!("raw:     0x{:08x}", trap.raw);
            eprintln!("retired: {}", cpu.instructions_retired);
            if exceptions_are_errors {
                1
            } else {
                0
            }
        }
        StopReason::Breakpoint => 0,
        StopReason::UnknownSyscall(_) => 1,
    }
}

fn run_debug(args: &Args, mut cpu: Cpu) {
    loop {
        if let Some(base) = args.memory {
            print_memory(&cpu.memory, base);
        }

        let pc = cpu.state.read_pc();
        match cpu.step() {
            Ok(Some(reason)) => {
                println!("Stopped: {:?}", reason);
                return;
            }
            Ok(None) => {
                println!("pc=0x{pc:08x} retired={}", cpu.instructions_retired);
            }
            Err(trap) => {
                println!("{trap} (instructions retired: {})", cpu.instructions_retired);
                return;
            }
        }

        press_enter_to_continue();
    }
}

fn run_with_breakpoints(args: &Args, mut cpu: Cpu) -> i32 {
    let mut hooks = StepHooks {
        pc_breakpoint: args.pc_breakpoint,
        cycle_breakpoint: args.cycle_breakpoint,
        trace: None,
    };

    loop {
        if let Some(bp) = hooks.pc_breakpoint {
            if cpu.state.read_pc() == bp {
                hooks.pc_breakpoint = None;
                if let Some(base) = args.memory {
                    print_memory(&cpu.memory, base);
                }
                press_enter_to_continue();
            }
        }
        if let Some(bp) = hooks.cycle_breakpoint {
            if cpu.instructions_retired == bp {
                hooks.cycle_breakpoint = None;
                if let Some(base) = args.memory {
                    print_memory(&cpu.memory, base);
                }
                press_enter_to_continue();
            }
        }

        match cpu.step() {
            Ok(None) => continue,
            Ok(Some(reason)) => return report_stop(&reason, &cpu, args.exceptions_are_errors),
            Err(trap) => return report_stop(&StopReason::Trapped(trap), &cpu, args.exceptions_are_errors),
        }
    }
}

fn run_free(args: Args) -> i32 {
    let wants_trace = args.trace || args.trace_file.is_some();
    let (done_tx, done_rx) = mpsc::channel();

    let input = args.input.clone();
    let exceptions_are_errors = args.exceptions_are_errors;
    let trace_file = args.trace_file.clone();

    let handle = thread::spawn(move || {
        let (mut cpu, _entry) = match build_cpu(&input) {
            Ok(built) => built,
            Err(e) => {
                eprintln!("Error loading ELF: {e}");
                return 1;
            }
        };

        let mut trace_out: Box<dyn Write + Send> = match trace_file {
            Some(path) => match File::create(&path) {
                Ok(f) => Box::new(f),
                Err(e) => {
                    eprintln!("Could not open trace file {path}: {e}");
                    Box::new(io::stdout())
                }
            },
            None => Box::new(io::stdout()),
        };

        let started = Instant::now();
        let mut hooks = StepHooks { pc_breakpoint: None, cycle_breakpoint: None, trace: None };
        if wants_trace {
            hooks.trace = Some(Box::new(move |record: TraceRecord| {
                let _ = writeln!(
                    trace_out,
                    "PC=0x{:08x} INST=0x{:08x} rd={} rs1={} rs2={} imm={}",
                    record.pc, record.raw, record.rd, record.rs1, record.rs2, record.imm
                );
            }));
        }

        let reason = cpu.run(&mut hooks);
        let elapsed = started.elapsed();
        let code = report_stop(&reason, &cpu, exceptions_are_errors);

        let secs = elapsed.as_secs_f64();
        let ips = if secs > 0.0 { cpu.instructions_retired as f64 / secs } else { 0.0 };
        eprintln!(
            "{} instructions in {:.3}s ({:.0} instr/s)",
            cpu.instructions_retired, secs, ips
        );

        let _ = done_tx.send(());
        code
    });

    let _ = done_rx.recv();
    handle.join().unwrap_or(1)
}

fn main() {
    let args = Args::parse();

    let exit_code = if args.debug {
        match build_cpu(&args.input) {
            Ok((cpu, _entry)) => {
                run_debug(&args, cpu);
                0
            }
            Err(e) => {
                eprintln!("Error loading ELF: {e}");
                1
            }
        }
    } else if args.pc_breakpoint.is_some() || args.cycle_breakpoint.is_some() {
        match build_cpu(&args.input) {
            Ok((cpu, _entry)) => run_with_breakpoints(&args, cpu),
            Err(e) => {
                eprintln!("Error loading ELF: {e}");
                1
            }
        }
    } else {
        run_free(args)
    };

    std::process::exit(exit_code);
}
