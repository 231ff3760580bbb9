//! ELF image loading
//!
//! Maps `PT_LOAD` segments of a 32-bit RISC-V ELF executable into guest
//! memory and applies the small set of relocation types produced by a
//! statically linked, position-independent newlib/musl build
//! (`R_RISCV_RELATIVE`, `R_RISCV_32`, `R_RISCV_JUMP_SLOT`). Grounded in
//! `original_source/src/platform/ElfLoader.cpp`, rebuilt on top of the
//! `elf` crate rather than raw struct punning over a byte buffer.

use elf::abi::{PT_LOAD, SHT_RELA};
use elf::endian::AnyEndian;
use elf::ElfBytes;
use thiserror::Error;

use crate::memory::Memory;
use crate::state::State;

// The `elf` crate's own constant tables only cover relocation types
// shared across architectures; RISC-V's are not among them, so they
// are named here the same way the ELF psABI spec does.
const R_RISCV_32: u32 = 1;
const R_RISCV_RELATIVE: u32 = 3;
const R_RISCV_JUMP_SLOT: u32 = 5;

#[derive(Debug, Error)]
pub enum LoaderError {
    #[error("could not read {path}: {source}")]
    Io { path: String, #[source] source: std::io::Error },
    #[error("{0} is not a valid ELF file")]
    Malformed(String),
    #[error("{0} is not a 32-bit RISC-V, soft-float executable")]
    UnsupportedTarget(String),
    #[error("writing loaded segment into guest memory failed: {0}")]
    Memory(String),
    #[error("relocation type {0} is not supported")]
    UnsupportedRelocation(u32),
}

/// Result of loading an image: where execution should start, and the
/// first address past the loaded segments (the initial program break,
/// §10.2).
pub struct LoadedImage {
    pub entry: u32,
    pub image_end: u32,
}

/// Load `path` into `memory` and set `state`'s program counter to the
/// ELF entry point.
pub fn load(path: &str, memory: &mut Memory, state: &mut State) -> Result<LoadedImage, LoaderError> {
    let bytes = std::fs::read(path).map_err(|source| LoaderError::Io { path: path.to_string(), source })?;
    let file = ElfBytes::<AnyEndian>::minimal_parse(&bytes)
        .map_err(|_| LoaderError::Malformed(path.to_string()))?;

    if file.ehdr.class != elf::file::Class::ELF32 {
        return Err(LoaderError::UnsupportedTarget(path.to_string()));
    }
    if file.ehdr.e_machine != elf::abi::EM_RISCV {
        return Err(LoaderError::UnsupportedTarget(path.to_string()));
    }
    // EF_RISCV_FLOAT_ABI_SOFT: bits 2-3 of e_flags are zero for the
    // soft-float ABI; this crate has no FPU, so anything else is
    // rejected rather than silently mis-executed.
    if file.ehdr.e_flags & 0x0006 != 0 {
        return Err(LoaderError::UnsupportedTarget(path.to_string()));
    }

    let mut image_end: u32 = 0;

    if let Some(segments) = file.segments() {
        for phdr in segments.iter() {
            if phdr.p_type != PT_LOAD {
                continue;
            }
            let vaddr = phdr.p_vaddr as u32;
            let offset = phdr.p_offset as usize;
            let filesz = phdr.p_filesz as usize;
            let memsz = phdr.p_memsz as u32;

            let segment_bytes = bytes
                .get(offset..offset + filesz)
                .ok_or_else(|| LoaderError::Malformed(path.to_string()))?;
            for (i, byte) in segment_bytes.iter().enumerate() {
                memory
                    .write_byte(vaddr.wrapping_add(i as u32), *byte)
                    .map_err(|t| LoaderError::Memory(t.to_string()))?;
            }
            if memsz as usize > filesz {
                memory
                    .fill(vaddr.wrapping_add(filesz as u32), 0, memsz - filesz as u32)
                    .map_err(|t| LoaderError::Memory(t.to_string()))?;
            }

            image_end = image_end.max(vaddr.wrapping_add(memsz));
        }
    }

    apply_relocations(&file, memory, path)?;

    let entry = file.ehdr.e_entry as u32;
    state.reset(entry);

    Ok(LoadedImage { entry, image_end })
}

fn apply_relocations(
    file: &ElfBytes<AnyEndian>,
    memory: &mut Memory,
    path: &str,
) -> Result<(), LoaderError> {
    let Some((section_headers, _strtab)) = file
        .section_headers_with_strtab()
        .map_err(|_| LoaderError::Malformed(path.to_string()))?
    else {
        return Ok(());
    };

    let symbols = file
        .symbol_table()
        .map_err(|_| LoaderError::Malformed(path.to_string()))?;

    for shdr in section_headers.iter() {
        if shdr.sh_type != SHT_RELA {
            continue;
        }
        let relas = file
            .section_data_as_relas(&shdr)
            .map_err(|_| LoaderError::Malformed(path.to_string()))?;

        for rela in relas {
            let addend = rela.r_addend as i32 as u32;
            let symbol_value = if rela.r_sym == 0 {
                0
            } else if let Some((symtab, _)) = &symbols {
                symtab
                    .get(rela.r_sym as usize)
                    .map(|sym| sym.st_value as u32)
                    .unwrap_or(0)
            } else {
                0
            };

            let result = match rela.r_type {
                R_RISCV_RELATIVE => addend,
                R_RISCV_32 | R_RISCV_JUMP_SLOT => symbol_value.wrapping_add(addend),
                other => return Err(LoaderError::UnsupportedRelocation(other)),
            };

            memory
                .write_word(rela.r_offset as u32, result)
                .map_err(|t| LoaderError::Memory(t.to_string()))?;
        }
    }

    Ok(())
}
