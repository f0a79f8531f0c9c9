// SPDX-FileCopyrightText: 2026 TriliTech <contact@trili.tech>
//
// SPDX-License-Identifier: MIT

//! The machine: hart state, guest memory, the decoder-cache driven
//! interpreter loop and the system-call dispatch table.

pub mod decoder_cache;
pub mod hart_state;
pub mod memory;
pub mod registers;

use std::collections::BTreeMap;
use std::io::Write;

use thiserror::Error;

use crate::linux::fds::FileDescriptors;
use crate::linux::signals::Signals;
use crate::log;
use crate::machine_state::decoder_cache::DecoderCache;
use crate::machine_state::decoder_cache::DecoderEntry;
use crate::machine_state::hart_state::HartState;
use crate::machine_state::memory::Address;
use crate::machine_state::memory::Memory;
use crate::machine_state::memory::MemoryError;
use crate::machine_state::memory::PAGE_SHIFT;
use crate::machine_state::memory::PAGE_SIZE;

/// Guest register width, decided by the ELF class of the loaded program.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Xlen {
    Rv32,
    Rv64,
}

impl Xlen {
    /// Size in bytes of a guest pointer.
    pub const fn addr_bytes(self) -> usize {
        match self {
            Xlen::Rv32 => 4,
            Xlen::Rv64 => 8,
        }
    }
}

/// Conditions raised by instruction handlers back to the dispatch loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq, derive_more::From)]
pub enum Exception {
    /// `ecall`
    EnvCall,

    /// `ebreak`
    Breakpoint,

    /// The encoding has no handler.
    IllegalInstruction(u32),

    /// A data access faulted fatally.
    #[from]
    MemoryFault(MemoryError),
}

/// Fatal machine errors. Any of these terminates the run; they are never
/// reflected into the guest as an errno.
#[derive(Debug, Error)]
pub enum MachineError {
    #[error(transparent)]
    Memory(#[from] MemoryError),

    #[error("Unhandled system call: {0}")]
    UnhandledSyscall(&'static str),

    #[error("Illegal instruction {instr:#010x} at pc {pc:#x}")]
    IllegalInstruction { instr: u32, pc: Address },

    #[error(transparent)]
    Program(#[from] crate::program::Error),
}

/// Hart and memory: the state instruction handlers operate on.
pub struct MachineCoreState {
    pub hart: HartState,
    pub main_memory: Memory,
    pub xlen: Xlen,
}

impl MachineCoreState {
    pub fn new(xlen: Xlen, pages_total: usize) -> Self {
        Self {
            hart: HartState::new(),
            main_memory: Memory::new(pages_total),
            xlen,
        }
    }
}

/// Host function implementing one guest system call.
pub type SyscallHandler = fn(&mut MachineState) -> Result<(), MachineError>;

/// Number of entries in the system-call dispatch table. Numbers at or
/// above this are unconditionally "not implemented".
pub const SYSCALL_TABLE_SIZE: usize = 512;

/// Host-side I/O hooks.
pub struct MachineHooks {
    /// Sink for guest writes to stdout and stderr.
    pub stdout: Box<dyn FnMut(&[u8])>,

    /// Source for guest reads from stdin. Returns the number of bytes
    /// placed in the buffer; 0 means end of input.
    pub stdin: Box<dyn FnMut(&mut [u8]) -> usize>,
}

impl Default for MachineHooks {
    fn default() -> Self {
        Self {
            stdout: Box::new(|bytes| {
                let _ = std::io::stdout().write_all(bytes);
            }),
            stdin: Box::new(|_| 0),
        }
    }
}

/// Construction-time configuration knobs.
pub struct MachineOptions {
    /// Guest memory limit in bytes; converted to a page quota.
    pub memory_max: u64,

    /// Apply ELF segment permissions when loading.
    pub protect_segments: bool,

    /// Maximum distance the program break may move.
    pub brk_max: u64,
}

impl Default for MachineOptions {
    fn default() -> Self {
        Self {
            memory_max: 64 * 1024 * 1024,
            protect_segments: true,
            brk_max: 0x100_0000,
        }
    }
}

/// A complete machine instance. Single-threaded: the interpreter, the
/// system-call dispatcher and the memory subsystem share one mutator.
pub struct MachineState {
    pub core: MachineCoreState,

    /// Host I/O hooks
    pub hooks: MachineHooks,

    /// Per-page decoder caches for executable pages
    decoder: BTreeMap<u64, Box<DecoderCache>>,

    /// System-call dispatch table, indexed by the value of `a7`
    syscall_handlers: Box<[SyscallHandler; SYSCALL_TABLE_SIZE]>,

    /// Remaining instruction budget; [`stop`](Self::stop) zeroes it
    steps_left: u64,

    /// Virtual file-descriptor table, present when filesystem or socket
    /// support was enabled
    pub(crate) fds: Option<FileDescriptors>,

    /// Signal actions and the per-thread alternate stack
    pub(crate) signals: Signals,
}

impl MachineState {
    /// Create a machine with empty memory and an all-stub system-call
    /// table.
    pub fn new(xlen: Xlen, options: MachineOptions) -> Self {
        let pages_total = (options.memory_max / PAGE_SIZE) as usize;
        let mut core = MachineCoreState::new(xlen, pages_total);
        core.main_memory.protect_segments = options.protect_segments;
        core.main_memory.brk_max = options.brk_max;

        Self {
            core,
            hooks: MachineHooks::default(),
            decoder: BTreeMap::new(),
            syscall_handlers: Box::new(
                [syscall_unimplemented as SyscallHandler; SYSCALL_TABLE_SIZE],
            ),
            steps_left: 0,
            fds: None,
            signals: Signals::new(),
        }
    }

    /// Install a handler for one system-call number. Numbers beyond the
    /// table are ignored.
    pub fn install_syscall_handler(&mut self, number: usize, handler: SyscallHandler) {
        if number < SYSCALL_TABLE_SIZE {
            self.syscall_handlers[number] = handler;
        }
    }

    /// Read system-call argument `index` (registers `a0..a5`).
    pub fn sysarg(&self, index: usize) -> u64 {
        debug_assert!(index < 6, "system calls take at most six arguments");
        let reg = registers::parse_xregister(arbitrary_int::u5::new(10 + index as u8));
        self.core.hart.xregisters.read(reg)
    }

    /// Write the system-call result into `a0`.
    pub fn set_result(&mut self, value: u64) {
        self.core.hart.xregisters.write(registers::a0, value);
    }

    /// The current value of `a0`.
    pub fn return_value(&self) -> u64 {
        self.core.hart.xregisters.read(registers::a0)
    }

    /// Zero the instruction budget so the dispatch loop returns at its
    /// next check. A blocking system call in progress is not interrupted.
    pub fn stop(&mut self) {
        self.steps_left = 0;
    }

    /// Has the instruction budget run out?
    pub fn stopped(&self) -> bool {
        self.steps_left == 0
    }

    /// Send bytes to the configured stdout sink.
    pub fn print(&mut self, bytes: &[u8]) {
        (self.hooks.stdout)(bytes)
    }

    /// Fill a buffer from the configured stdin source.
    pub fn stdin_read(&mut self, buffer: &mut [u8]) -> usize {
        (self.hooks.stdin)(buffer)
    }

    pub fn has_file_descriptors(&self) -> bool {
        self.fds.is_some()
    }

    pub(crate) fn fds_mut(&mut self) -> Option<&mut FileDescriptors> {
        self.fds.as_mut()
    }

    /// The signal table.
    pub fn signals(&mut self) -> &mut Signals {
        &mut self.signals
    }

    /// Drop the decoder cache of one page, e.g. after the page was
    /// remapped.
    pub fn invalidate_decoder_cache(&mut self, pageno: u64) {
        self.decoder.remove(&pageno);
    }

    /// The decoder caches built so far, in page order.
    pub fn decoder_caches(&self) -> impl Iterator<Item = (u64, &DecoderCache)> {
        self.decoder.iter().map(|(pageno, cache)| (*pageno, cache.as_ref()))
    }

    /// Install a pre-built decoder cache for a page, e.g. one loaded from
    /// disk.
    pub fn install_decoder_cache(&mut self, pageno: u64, cache: Box<DecoderCache>) {
        self.decoder.insert(pageno, cache);
    }

    /// The pre-decoded descriptor for `pc`, building the page's cache on
    /// first execution.
    fn fetch(&mut self, pc: Address) -> Result<DecoderEntry, MachineError> {
        let pageno = pc >> PAGE_SHIFT;
        if !self.decoder.contains_key(&pageno) {
            let data = self.core.main_memory.exec_page_data(pageno)?;
            let cache = DecoderCache::generate(data);
            self.decoder.insert(pageno, cache);
        }
        Ok(*self.decoder[&pageno].entry_for(pc))
    }

    /// Execute up to `max_instructions` instructions. Returns early when
    /// the machine is stopped, e.g. by the guest exiting.
    pub fn run(&mut self, max_instructions: u64) -> Result<(), MachineError> {
        self.steps_left = max_instructions;
        while self.steps_left > 0 {
            self.steps_left -= 1;
            self.step()?;
        }
        Ok(())
    }

    /// Execute a single instruction.
    pub fn step(&mut self) -> Result<(), MachineError> {
        let pc = self.core.hart.pc;
        let entry = self.fetch(pc)?;
        match entry.execute(&mut self.core) {
            Ok(()) => Ok(()),
            Err(Exception::EnvCall) => {
                // The `ecall` instruction is always 4 bytes wide.
                self.core.hart.pc = pc.wrapping_add(4);
                let number = self.core.hart.xregisters.read(registers::a7);
                self.dispatch_syscall(number)
            }
            Err(Exception::Breakpoint) => {
                self.dispatch_syscall(crate::linux::SYSCALL_EBREAK)
            }
            Err(Exception::IllegalInstruction(instr)) => {
                Err(MachineError::IllegalInstruction { instr, pc })
            }
            Err(Exception::MemoryFault(err)) => Err(err.into()),
        }
    }

    /// Look up and invoke the system-call handler for `number`.
    fn dispatch_syscall(&mut self, number: u64) -> Result<(), MachineError> {
        let handler = match usize::try_from(number) {
            Ok(idx) if idx < SYSCALL_TABLE_SIZE => self.syscall_handlers[idx],
            _ => syscall_unimplemented,
        };
        handler(self)
    }
}

/// Default entry of the dispatch table: report the call and return
/// `-ENOSYS`.
fn syscall_unimplemented(machine: &mut MachineState) -> Result<(), MachineError> {
    let number = machine.core.hart.xregisters.read(registers::a7);
    log::warning!(number, "Unimplemented system call");
    machine.set_result(crate::linux::error::Error::NoSystemCall.into_xvalue());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sysargs_map_to_argument_registers() {
        let mut machine = MachineState::new(Xlen::Rv64, MachineOptions::default());
        for i in 0..6u64 {
            let reg = registers::parse_xregister(arbitrary_int::u5::new(10 + i as u8));
            machine.core.hart.xregisters.write(reg, 100 + i);
        }
        for i in 0..6 {
            assert_eq!(machine.sysarg(i), 100 + i as u64);
        }
    }

    #[test]
    fn test_run_executes_until_budget() {
        let mut machine = MachineState::new(Xlen::Rv64, MachineOptions::default());
        // A page of `addi a0, a0, 1` at 0x1000, executable.
        let addi = 0x0015_0513u32.to_le_bytes().repeat(1024);
        machine.core.main_memory.memcpy(0x1000, &addi).unwrap();
        machine
            .core
            .main_memory
            .set_page_attr(0x1000, 4096, crate::machine_state::memory::page::PageAttributes::rwx(true, false, true))
            .unwrap();
        machine.core.hart.pc = 0x1000;

        machine.run(10).unwrap();
        assert_eq!(machine.return_value(), 10);
        assert!(machine.stopped());
    }

    #[test]
    fn test_unknown_syscall_returns_nosys() {
        let mut machine = MachineState::new(Xlen::Rv64, MachineOptions::default());
        machine
            .core
            .hart
            .xregisters
            .write(registers::a7, 9999);
        machine.dispatch_syscall(9999).unwrap();
        assert_eq!(machine.return_value() as i64, -38);
    }

    #[test]
    fn test_stop_zeroes_budget() {
        let mut machine = MachineState::new(Xlen::Rv64, MachineOptions::default());
        machine.steps_left = 1000;
        machine.stop();
        assert!(machine.stopped());
    }
}
