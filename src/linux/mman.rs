// SPDX-FileCopyrightText: 2026 TriliTech <contact@trili.tech>
//
// SPDX-License-Identifier: MIT

//! Memory-mapping system calls over the guest page table.
//!
//! Only anonymous private mappings are modelled; the pages come from the
//! same on-demand pool as everything else, placed at a cursor that starts
//! above the program break area.

use super::error::Error;
use crate::machine_state::memory::page::PageAttributes;
use crate::machine_state::memory::PAGE_SIZE;
use crate::machine_state::MachineError;
use crate::machine_state::MachineState;

const PROT_READ: u64 = 0x1;
const PROT_WRITE: u64 = 0x2;
const PROT_EXEC: u64 = 0x4;

const MAP_PRIVATE: u64 = 0x02;
const MAP_FIXED: u64 = 0x10;
const MAP_ANONYMOUS: u64 = 0x20;

fn prot_attr(prot: u64) -> PageAttributes {
    PageAttributes::rwx(
        prot & PROT_READ != 0,
        prot & PROT_WRITE != 0,
        prot & PROT_EXEC != 0,
    )
}

/// Handle `mmap`. Anonymous private mappings only; everything file-backed
/// or shared is refused.
///
/// See: <https://man7.org/linux/man-pages/man2/mmap.2.html>
pub fn syscall_mmap(machine: &mut MachineState) -> Result<(), MachineError> {
    let addr_hint = machine.sysarg(0);
    let length = machine.sysarg(1);
    let prot = machine.sysarg(2);
    let flags = machine.sysarg(3);

    if length == 0 {
        machine.set_result(Error::InvalidArgument.into_xvalue());
        return Ok(());
    }
    if flags & MAP_ANONYMOUS == 0 || flags & MAP_PRIVATE == 0 {
        machine.set_result(Error::NoDevice.into_xvalue());
        return Ok(());
    }

    let length = length.next_multiple_of(PAGE_SIZE);
    let addr = if flags & MAP_FIXED != 0 {
        if addr_hint % PAGE_SIZE != 0 {
            machine.set_result(Error::InvalidArgument.into_xvalue());
            return Ok(());
        }
        addr_hint
    } else {
        let addr = machine.core.main_memory.mmap_address;
        machine.core.main_memory.mmap_address = addr + length;
        addr
    };

    machine
        .core
        .main_memory
        .set_page_attr(addr, length as usize, prot_attr(prot))?;
    machine.set_result(addr);
    Ok(())
}

/// Handle `munmap`, evicting the covered pages. Unmapping the top of the
/// mapping area rewinds the cursor.
///
/// See: <https://man7.org/linux/man-pages/man2/munmap.2.html>
pub fn syscall_munmap(machine: &mut MachineState) -> Result<(), MachineError> {
    let addr = machine.sysarg(0);
    let length = machine.sysarg(1);

    if addr % PAGE_SIZE != 0 {
        machine.set_result(Error::InvalidArgument.into_xvalue());
        return Ok(());
    }

    let length = length.next_multiple_of(PAGE_SIZE);
    machine.core.main_memory.free_pages(addr, length as usize);

    let memory = &mut machine.core.main_memory;
    if addr + length == memory.mmap_address {
        memory.mmap_address = addr;
    }

    machine.set_result(0);
    Ok(())
}

/// Handle `mprotect`, applying R/W/X attributes page by page.
///
/// See: <https://man7.org/linux/man-pages/man2/mprotect.2.html>
pub fn syscall_mprotect(machine: &mut MachineState) -> Result<(), MachineError> {
    let addr = machine.sysarg(0);
    let length = machine.sysarg(1);
    let prot = machine.sysarg(2);

    if addr % PAGE_SIZE != 0 {
        machine.set_result(Error::InvalidArgument.into_xvalue());
        return Ok(());
    }

    machine
        .core
        .main_memory
        .set_page_attr(addr, length as usize, prot_attr(prot))?;
    machine.set_result(0);
    Ok(())
}

/// Handle `madvise`. Advice is always taken and always ignored.
///
/// See: <https://man7.org/linux/man-pages/man2/madvise.2.html>
pub fn syscall_madvise(machine: &mut MachineState) -> Result<(), MachineError> {
    machine.set_result(0);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine_state::registers;
    use crate::machine_state::MachineOptions;
    use crate::machine_state::Xlen;

    fn machine() -> MachineState {
        let mut machine = MachineState::new(Xlen::Rv64, MachineOptions::default());
        machine.core.main_memory.mmap_address = 0x100_0000;
        machine
    }

    fn set_args(machine: &mut MachineState, args: &[u64]) {
        for (i, &value) in args.iter().enumerate() {
            let reg =
                registers::parse_xregister(arbitrary_int::u5::new(10 + i as u8));
            machine.core.hart.xregisters.write(reg, value);
        }
    }

    #[test]
    fn test_mmap_advances_cursor() {
        let mut machine = machine();
        set_args(
            &mut machine,
            &[0, 0x2000, PROT_READ | PROT_WRITE, MAP_PRIVATE | MAP_ANONYMOUS],
        );
        syscall_mmap(&mut machine).unwrap();
        assert_eq!(machine.return_value(), 0x100_0000);
        assert_eq!(machine.core.main_memory.mmap_address, 0x100_2000);

        // The mapping is usable.
        machine.core.main_memory.write_u64(0x100_0000, 42).unwrap();
    }

    #[test]
    fn test_mmap_rejects_file_backed() {
        let mut machine = machine();
        set_args(&mut machine, &[0, 0x1000, PROT_READ, MAP_PRIVATE]);
        syscall_mmap(&mut machine).unwrap();
        assert_eq!(machine.return_value() as i64, -19);
    }

    #[test]
    fn test_munmap_rewinds_cursor() {
        let mut machine = machine();
        set_args(
            &mut machine,
            &[0, 0x2000, PROT_READ | PROT_WRITE, MAP_PRIVATE | MAP_ANONYMOUS],
        );
        syscall_mmap(&mut machine).unwrap();
        let addr = machine.return_value();

        set_args(&mut machine, &[addr, 0x2000]);
        syscall_munmap(&mut machine).unwrap();
        assert_eq!(machine.return_value(), 0);
        assert_eq!(machine.core.main_memory.mmap_address, addr);
    }

    #[test]
    fn test_mprotect_denies_writes() {
        let mut machine = machine();
        machine.core.main_memory.write_u8(0x20_0000, 1).unwrap();
        set_args(&mut machine, &[0x20_0000, 0x1000, PROT_READ]);
        syscall_mprotect(&mut machine).unwrap();
        assert_eq!(machine.return_value(), 0);
        assert!(machine.core.main_memory.write_u8(0x20_0000, 2).is_err());
        assert!(machine.core.main_memory.read_u8(0x20_0000).is_ok());
    }
}
