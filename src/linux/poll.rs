// SPDX-FileCopyrightText: 2026 TriliTech <contact@trili.tech>
//
// SPDX-License-Identifier: MIT

//! Readiness system calls.
//!
//! Only the shapes that libc start-up code relies on are implemented: a
//! `ppoll` over the standard descriptors and an always-ready `pselect`.
//! The epoll family is declared in the dispatch table but not emulated.

use super::error::Error;
use crate::machine_state::MachineError;
use crate::machine_state::MachineState;

/// sizeof(struct pollfd)
const SIZE_POLLFD: u64 = 8;

/// offsetof(struct pollfd, fd)
const OFFSET_FD: u64 = 0;

/// offsetof(struct pollfd, revents)
const OFFSET_REVENTS: u64 = 6;

/// Upper bound on the pollfd array, akin to RLIMIT_NOFILE.
const POLL_MAX_FDS: u64 = 512;

/// Handle `ppoll` in a way that only satisfies the usage by Musl's and
/// the Rust standard library's initialisation code: the standard
/// descriptors report no pending events and the timeout is ignored.
///
/// See: <https://man7.org/linux/man-pages/man2/poll.2.html>
pub fn syscall_ppoll(machine: &mut MachineState) -> Result<(), MachineError> {
    let fd_ptrs = machine.sysarg(0);
    let num_fds = machine.sysarg(1);

    if num_fds > POLL_MAX_FDS {
        machine.set_result(Error::InvalidArgument.into_xvalue());
        return Ok(());
    }

    for i in 0..num_fds {
        let fd_addr = i * SIZE_POLLFD + OFFSET_FD + fd_ptrs;
        let fd = machine.core.main_memory.read_u32(fd_addr)? as i32;
        if !(0..=2).contains(&fd) {
            machine.set_result(Error::NoSystemCall.into_xvalue());
            return Ok(());
        }
    }

    for i in 0..num_fds {
        let revents_addr = i * SIZE_POLLFD + OFFSET_REVENTS + fd_ptrs;
        machine.core.main_memory.write_u16(revents_addr, 0)?;
    }

    machine.set_result(0);
    Ok(())
}

/// Handle `pselect`. Always reports zero ready descriptors.
///
/// See: <https://man7.org/linux/man-pages/man2/select.2.html>
pub fn syscall_pselect(machine: &mut MachineState) -> Result<(), MachineError> {
    machine.set_result(0);
    Ok(())
}

/// `epoll_create1` is declared but not emulated.
pub fn syscall_epoll_create(machine: &mut MachineState) -> Result<(), MachineError> {
    machine.set_result(Error::NoSystemCall.into_xvalue());
    Ok(())
}

/// `epoll_ctl` is declared but not emulated.
pub fn syscall_epoll_ctl(machine: &mut MachineState) -> Result<(), MachineError> {
    machine.set_result(Error::NoSystemCall.into_xvalue());
    Ok(())
}

/// `epoll_pwait` is declared but not emulated.
pub fn syscall_epoll_pwait(machine: &mut MachineState) -> Result<(), MachineError> {
    machine.set_result(Error::NoSystemCall.into_xvalue());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine_state::registers;
    use crate::machine_state::MachineOptions;
    use crate::machine_state::Xlen;

    fn set_args(machine: &mut MachineState, args: &[u64]) {
        for (i, &value) in args.iter().enumerate() {
            let reg =
                registers::parse_xregister(arbitrary_int::u5::new(10 + i as u8));
            machine.core.hart.xregisters.write(reg, value);
        }
    }

    #[test]
    fn test_ppoll_clears_revents_for_std_fds() {
        let mut machine = MachineState::new(Xlen::Rv64, MachineOptions::default());
        let g_fds = 0x5000u64;
        // pollfd { fd: 1, events: POLLOUT, revents: 0xffff }
        machine.core.main_memory.write_u32(g_fds, 1).unwrap();
        machine.core.main_memory.write_u16(g_fds + 4, 4).unwrap();
        machine
            .core
            .main_memory
            .write_u16(g_fds + 6, 0xffff)
            .unwrap();

        set_args(&mut machine, &[g_fds, 1, 0, 0]);
        syscall_ppoll(&mut machine).unwrap();
        assert_eq!(machine.return_value(), 0);
        assert_eq!(machine.core.main_memory.read_u16(g_fds + 6).unwrap(), 0);
    }

    #[test]
    fn test_ppoll_rejects_other_fds() {
        let mut machine = MachineState::new(Xlen::Rv64, MachineOptions::default());
        let g_fds = 0x5000u64;
        machine.core.main_memory.write_u32(g_fds, 7).unwrap();
        set_args(&mut machine, &[g_fds, 1, 0, 0]);
        syscall_ppoll(&mut machine).unwrap();
        assert_eq!(machine.return_value() as i64, -38);
    }
}
