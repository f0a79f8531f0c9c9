// SPDX-FileCopyrightText: 2026 TriliTech <contact@trili.tech>
//
// SPDX-License-Identifier: MIT

//! ELF loading and symbol resolution.
//!
//! Only statically linked RISC-V executables are supported, in both the
//! ELF32 and ELF64 classes. The program keeps its raw image around so
//! symbols can be resolved later, e.g. for backtraces.

use elf::abi::EM_RISCV;
use elf::abi::ET_EXEC;
use elf::abi::PF_R;
use elf::abi::PF_W;
use elf::abi::PF_X;
use elf::abi::PT_GNU_RELRO;
use elf::abi::PT_GNU_STACK;
use elf::abi::PT_LOAD;
use elf::abi::STT_FUNC;
use elf::endian::LittleEndian;
use elf::file::Class;
use elf::ElfBytes;

use crate::log;
use crate::machine_state::memory::Address;
use crate::machine_state::memory::Memory;
use crate::machine_state::memory::MemoryError;
use crate::machine_state::memory::PAGE_SIZE;
use crate::machine_state::memory::page::PageAttributes;
use crate::machine_state::MachineState;
use crate::machine_state::Xlen;

/// Error when parsing and loading the guest ELF file
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Failed to parse the ELF file
    #[error("Failed to parse ELF file: {0}")]
    Elf(#[from] elf::ParseError),

    /// The file is valid ELF but not for RISC-V
    #[error("Not a RISC-V executable (machine type {0})")]
    NotRiscV(u16),

    /// Only statically linked executables can be loaded
    #[error("Not a static executable (type {0})")]
    NotExecutable(u16),

    /// An ELF with no loadable program headers is useless
    #[error("ELF with no program headers")]
    NoProgramHeaders,

    /// A program header points beyond the file
    #[error("Not enough room for ELF program segment at offset {0:#x}")]
    TruncatedSegment(u64),

    /// Copying a segment into guest memory failed
    #[error(transparent)]
    Memory(#[from] MemoryError),
}

/// A function symbol enclosing (or preceding) a code address.
#[derive(Clone, Debug, PartialEq, Eq, derive_more::Display)]
#[display("{name} @ {address:#x} + {offset:#x}")]
pub struct Callsite {
    pub name: String,
    pub address: Address,
    pub offset: u64,
}

/// A parsed guest program.
pub struct Program {
    binary: Vec<u8>,

    /// Guest register width, from the ELF class
    pub xlen: Xlen,

    /// Program entry point
    pub entry: Address,
}

impl Program {
    /// Validate the ELF header and wrap the image.
    pub fn new(binary: Vec<u8>) -> Result<Self, Error> {
        let elf = ElfBytes::<LittleEndian>::minimal_parse(&binary)?;

        if elf.ehdr.e_machine != EM_RISCV {
            return Err(Error::NotRiscV(elf.ehdr.e_machine));
        }
        if elf.ehdr.e_type != ET_EXEC {
            return Err(Error::NotExecutable(elf.ehdr.e_type));
        }
        if elf.segments().map_or(0, |segments| segments.len()) == 0 {
            return Err(Error::NoProgramHeaders);
        }

        let xlen = match elf.ehdr.class {
            Class::ELF32 => Xlen::Rv32,
            Class::ELF64 => Xlen::Rv64,
        };
        let entry = elf.ehdr.e_entry;

        Ok(Self {
            binary,
            xlen,
            entry,
        })
    }

    /// The raw ELF image.
    pub fn image(&self) -> &[u8] {
        &self.binary
    }

    fn elf(&self) -> Result<ElfBytes<'_, LittleEndian>, Error> {
        Ok(ElfBytes::minimal_parse(&self.binary)?)
    }

    /// Load every `PT_LOAD` segment into guest memory and fill in the
    /// memory's program scalars.
    pub fn load_into(&self, memory: &mut Memory) -> Result<(), Error> {
        let elf = self.elf()?;
        let segments = elf.segments().ok_or(Error::NoProgramHeaders)?;

        let mut program_begin = None;

        for segment in segments.iter() {
            match segment.p_type {
                PT_LOAD => {
                    let offset = segment.p_offset as usize;
                    let filesz = segment.p_filesz as usize;
                    if self.binary.len() < offset + filesz {
                        return Err(Error::TruncatedSegment(segment.p_offset));
                    }

                    log::debug!(
                        vaddr = segment.p_vaddr,
                        filesz,
                        "Loading program segment"
                    );

                    // The remainder up to p_memsz is zero already because
                    // pages are zeroed on allocation.
                    memory.memcpy(segment.p_vaddr, &self.binary[offset..offset + filesz])?;

                    let attr = if memory.protect_segments {
                        PageAttributes::rwx(
                            segment.p_flags & PF_R != 0,
                            segment.p_flags & PF_W != 0,
                            segment.p_flags & PF_X != 0,
                        )
                    } else {
                        // This might help execute simplistic barebones
                        // programs.
                        PageAttributes::rwx(true, true, true)
                    };
                    memory.set_page_attr(segment.p_vaddr, filesz, attr)?;

                    program_begin = Some(program_begin.unwrap_or(segment.p_vaddr));
                    memory.elf_end_vaddr =
                        memory.elf_end_vaddr.max(segment.p_vaddr + filesz as Address);
                }
                PT_GNU_STACK => {
                    if segment.p_vaddr != 0 {
                        memory.stack_address = segment.p_vaddr;
                    }
                }
                PT_GNU_RELRO => {
                    // Recognized but unused: relocations are a no-op for
                    // static executables.
                }
                _ => {}
            }
        }

        memory.start_address = self.entry;
        if memory.stack_address == 0 {
            // The stack grows downwards from the lowest loaded segment.
            memory.stack_address = program_begin.unwrap_or(0);
        }
        memory.heap_address = memory.elf_end_vaddr.next_multiple_of(PAGE_SIZE);
        memory.mmap_address = memory.heap_address + memory.brk_max + PAGE_SIZE;
        memory.exit_address = self.resolve_symbol("_exit").unwrap_or(0);

        Ok(())
    }

    /// The section header with the given name, as `(offset, size)` into
    /// the image.
    pub fn section_by_name(&self, name: &str) -> Option<(u64, u64)> {
        let elf = self.elf().ok()?;
        let section = elf.section_header_by_name(name).ok()??;
        Some((section.sh_offset, section.sh_size))
    }

    /// The address of a named symbol, if the symbol table has it.
    pub fn resolve_symbol(&self, name: &str) -> Option<Address> {
        let elf = self.elf().ok()?;
        let (symbols, strings) = elf.symbol_table().ok()??;
        symbols.iter().find_map(|symbol| {
            let symbol_name = strings.get(symbol.st_name as usize).ok()?;
            (symbol_name == name).then_some(symbol.st_value)
        })
    }

    /// The function symbol enclosing `address`, or the closest preceding
    /// one. Names are demangled where possible.
    pub fn lookup(&self, address: Address) -> Option<Callsite> {
        // Backtraces can sometimes find null addresses
        if address == 0 {
            return None;
        }

        let elf = self.elf().ok()?;
        let (symbols, strings) = elf.symbol_table().ok()??;

        let callsite = |st_name: u32, st_value: Address| {
            let raw = strings.get(st_name as usize).unwrap_or("");
            Callsite {
                name: rustc_demangle::demangle(raw).to_string(),
                address: st_value,
                offset: address - st_value,
            }
        };

        let mut best: Option<(u32, Address)> = None;
        for symbol in symbols.iter() {
            if symbol.st_symtype() != STT_FUNC {
                continue;
            }
            if address >= symbol.st_value && address < symbol.st_value + symbol.st_size {
                // Exact match
                return Some(callsite(symbol.st_name, symbol.st_value));
            }
            if address > symbol.st_value
                && best.map_or(true, |(_, value)| symbol.st_value > value)
            {
                // Best guess (symbol + offset)
                best = Some((symbol.st_name, symbol.st_value));
            }
        }
        best.map(|(st_name, st_value)| callsite(st_name, st_value))
    }
}

impl MachineState {
    /// Write a two-frame backtrace (pc and ra) through the stdout sink.
    pub fn print_backtrace(&mut self, program: &Program) {
        let pc = self.core.hart.pc;
        let ra = self
            .core
            .hart
            .xregisters
            .read(crate::machine_state::registers::ra);

        for (frame, addr) in [(0, pc), (1, ra)].into_iter() {
            let line = match program.lookup(addr) {
                Some(site) => format!(
                    "[{frame}] 0x{:08x} + 0x{:03x}: {}\n",
                    site.address, site.offset, site.name
                ),
                None => format!("[{frame}] 0x{addr:08x}\n"),
            };
            self.print(line.as_bytes());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_non_elf() {
        assert!(matches!(
            Program::new(vec![0u8; 16]),
            Err(Error::Elf(_))
        ));
    }

    #[test]
    fn test_rejects_wrong_machine() {
        // A minimal x86-64 ELF header.
        let mut image = crate::testing::elf_builder::minimal_rv64(&[0x0000_0073]);
        // Patch e_machine (offset 18) to EM_X86_64.
        image[18] = 62;
        assert!(matches!(Program::new(image), Err(Error::NotRiscV(62))));
    }

    #[test]
    fn test_load_sets_scalars() {
        let code = [0x0015_0513u32, 0x0000_0073];
        let image = crate::testing::elf_builder::minimal_rv64(&code);
        let program = Program::new(image).unwrap();
        assert_eq!(program.xlen, Xlen::Rv64);

        let mut memory = Memory::new(1024);
        program.load_into(&mut memory).unwrap();

        assert_eq!(memory.start_address, crate::testing::elf_builder::BASE_VADDR);
        assert!(memory.elf_end_vaddr > memory.start_address);
        assert_eq!(memory.heap_address % PAGE_SIZE, 0);
        assert!(memory.heap_address >= memory.elf_end_vaddr);

        // The code is mapped readable and executable but not writable.
        let pageno = memory.start_address >> crate::machine_state::memory::PAGE_SHIFT;
        let attr = memory.get_page(pageno).unwrap().attr;
        assert!(attr.read && attr.exec && !attr.write);
    }
}
