// SPDX-FileCopyrightText: 2026 TriliTech <contact@trili.tech>
//
// SPDX-License-Identifier: MIT

//! The Linux system-call emulation layer.
//!
//! Guest system calls are dispatched by RISC-V syscall number (register
//! `a7`) through the machine's handler table. Arguments come from
//! `a0..a5`; the result goes to `a0`; host failures are reflected as the
//! negated errno per the kernel ABI.

pub mod error;
pub mod fds;
pub mod fs;
pub mod mman;
pub mod poll;
pub mod signals;

use serde::Deserialize;
use serde::Serialize;

use self::error::Error;
use self::fds::FileDescriptors;
use crate::log;
use crate::machine_state::memory::Address;
use crate::machine_state::memory::GuestStruct;
use crate::machine_state::registers;
use crate::machine_state::MachineError;
use crate::machine_state::MachineState;
use crate::machine_state::Xlen;
use crate::program::Program;

/// Pseudo system call raised by the `ebreak` instruction.
pub const SYSCALL_EBREAK: u64 = 17;

/// Ceiling on a single `getrandom` request.
const GETRANDOM_MAX: usize = 256;

/// `utsname` fields are 65 bytes each.
const UTSLEN: usize = 65;

impl MachineState {
    /// Write a host call result into `a0`, translating failures into the
    /// negated errno.
    pub(crate) fn set_result_or_error(&mut self, result: i64) {
        if result >= 0 {
            self.set_result(result as u64);
        } else {
            let errno = std::io::Error::last_os_error()
                .raw_os_error()
                .unwrap_or(libc::EINVAL);
            self.set_result(-(errno as i64) as u64);
        }
    }

    /// Add data to the stack, returning the updated stack pointer.
    pub fn push_stack(&mut self, align: u64, data: &[u8]) -> Result<Address, MachineError> {
        let stack_ptr = self.core.hart.xregisters.read(registers::sp);
        let stack_ptr = stack_ptr
            .saturating_sub(stack_ptr % align)
            .saturating_sub(data.len() as u64);

        self.core.hart.xregisters.write(registers::sp, stack_ptr);
        self.core.main_memory.memcpy(stack_ptr, data)?;

        Ok(stack_ptr)
    }

    /// Push a guest pointer with the guest's width.
    fn push_stack_ptr(&mut self, value: Address) -> Result<Address, MachineError> {
        match self.core.xlen {
            Xlen::Rv64 => self.push_stack(8, &value.to_le_bytes()),
            Xlen::Rv32 => self.push_stack(4, &(value as u32).to_le_bytes()),
        }
    }

    /// Initialise the stack for a Linux program: program name, arguments,
    /// environment and an empty auxiliary vector, laid out the way libc
    /// start-up code expects them.
    fn init_linux_stack(&mut self, args: &[&str], env: &[&str]) -> Result<(), MachineError> {
        // First we push all strings so that they are at the top of the
        // stack
        let arg_ptrs = args
            .iter()
            .map(|arg| {
                let mut bytes = arg.as_bytes().to_vec();
                bytes.push(0);
                self.push_stack(1, &bytes)
            })
            .collect::<Result<Vec<_>, _>>()?;
        let env_ptrs = env
            .iter()
            .map(|var| {
                let mut bytes = var.as_bytes().to_vec();
                bytes.push(0);
                self.push_stack(1, &bytes)
            })
            .collect::<Result<Vec<_>, _>>()?;

        // auxv[0] = [null, null]
        self.push_stack_ptr(0)?;
        self.push_stack_ptr(0)?;

        // envp[n] = null
        self.push_stack_ptr(0)?;

        for &env_ptr in env_ptrs.iter().rev() {
            // envp[i]
            self.push_stack_ptr(env_ptr)?;
        }

        // argv[n] = null
        self.push_stack_ptr(0)?;

        for &arg_ptr in arg_ptrs.iter().rev() {
            // argv[i]
            self.push_stack_ptr(arg_ptr)?;
        }

        // argc
        let sp = self.push_stack_ptr(args.len() as Address)?;

        // Registers mirror the stack for runtimes that look there first.
        let ptr_bytes = self.core.xlen.addr_bytes() as Address;
        self.core
            .hart
            .xregisters
            .write(registers::a0, args.len() as u64);
        self.core
            .hart
            .xregisters
            .write(registers::a1, sp + ptr_bytes);

        Ok(())
    }

    /// Install a Linux program and configure the hart to start it.
    pub fn setup_linux_process(
        &mut self,
        program: &Program,
        args: &[&str],
        env: &[&str],
    ) -> Result<(), MachineError> {
        program.load_into(&mut self.core.main_memory)?;
        self.core.hart.reset(self.core.main_memory.start_address);

        // The stack grows downwards from the configured stack address.
        let stack_top = self.core.main_memory.stack_address & !0xF;
        self.core.hart.xregisters.write(registers::sp, stack_top);

        self.init_linux_stack(args, env)
    }

    /// Install the full Linux syscall table. Filesystem or socket support
    /// brings the virtual fd table to life and makes broken pipes
    /// harmless to the host.
    pub fn setup_linux_syscalls(&mut self, filesystem: bool, sockets: bool) {
        self.install_syscall_handler(SYSCALL_EBREAK as usize, syscall_ebreak);

        // epoll_create
        self.install_syscall_handler(20, poll::syscall_epoll_create);
        // epoll_ctl
        self.install_syscall_handler(21, poll::syscall_epoll_ctl);
        // epoll_pwait
        self.install_syscall_handler(22, poll::syscall_epoll_pwait);
        // dup
        self.install_syscall_handler(23, fs::syscall_dup);
        // fcntl
        self.install_syscall_handler(25, fs::syscall_fcntl);
        // ioctl
        self.install_syscall_handler(29, fs::syscall_ioctl);
        // faccessat
        self.install_syscall_handler(48, fs::syscall_faccessat);

        self.install_syscall_handler(56, fs::syscall_openat);
        self.install_syscall_handler(57, fs::syscall_close);
        self.install_syscall_handler(59, fs::syscall_pipe2);
        self.install_syscall_handler(62, fs::syscall_lseek);
        self.install_syscall_handler(63, fs::syscall_read);
        self.install_syscall_handler(64, fs::syscall_write);
        self.install_syscall_handler(65, fs::syscall_readv);
        self.install_syscall_handler(66, fs::syscall_writev);
        self.install_syscall_handler(72, poll::syscall_pselect);
        self.install_syscall_handler(73, poll::syscall_ppoll);
        self.install_syscall_handler(78, fs::syscall_readlinkat);
        // fstatat
        self.install_syscall_handler(79, fs::syscall_fstatat);
        // fstat
        self.install_syscall_handler(80, fs::syscall_fstat);

        // exit and exit_group
        self.install_syscall_handler(93, syscall_exit);
        self.install_syscall_handler(94, syscall_exit);

        // nanosleep
        self.install_syscall_handler(101, syscall_nanosleep);
        // clock_gettime
        self.install_syscall_handler(113, syscall_clock_gettime);
        // clock_nanosleep
        self.install_syscall_handler(115, syscall_clock_nanosleep);
        // sched_getaffinity
        self.install_syscall_handler(123, syscall_stub_nosys);
        // kill and tgkill
        self.install_syscall_handler(130, signals::syscall_kill);
        // sigaltstack
        self.install_syscall_handler(132, signals::syscall_sigaltstack);
        // rt_sigaction
        self.install_syscall_handler(134, signals::syscall_sigaction);
        // rt_sigprocmask
        self.install_syscall_handler(135, signals::syscall_sigprocmask);
        // uname
        self.install_syscall_handler(160, syscall_uname);
        // gettimeofday
        self.install_syscall_handler(169, syscall_gettimeofday);
        // getpid, getppid, getuid, geteuid, getgid, getegid
        self.install_syscall_handler(172, syscall_stub_zero);
        self.install_syscall_handler(173, syscall_stub_zero);
        self.install_syscall_handler(174, syscall_stub_zero);
        self.install_syscall_handler(175, syscall_stub_zero);
        self.install_syscall_handler(176, syscall_stub_zero);
        self.install_syscall_handler(177, syscall_stub_zero);

        self.install_syscall_handler(214, syscall_brk);

        // Memory mappings
        self.install_syscall_handler(215, mman::syscall_munmap);
        self.install_syscall_handler(222, mman::syscall_mmap);
        self.install_syscall_handler(226, mman::syscall_mprotect);
        // msync
        self.install_syscall_handler(227, syscall_stub_zero);
        self.install_syscall_handler(233, mman::syscall_madvise);

        self.install_syscall_handler(278, syscall_getrandom);

        #[cfg(target_os = "linux")]
        self.install_syscall_handler(291, fs::syscall_statx);

        self.install_syscall_handler(403, syscall_clock_gettime64);

        if filesystem || sockets {
            // Closing sockets that are already closed raises SIGPIPE,
            // which must not terminate the host.
            unsafe {
                libc::signal(libc::SIGPIPE, libc::SIG_IGN);
            }
            self.fds = Some(FileDescriptors::new(filesystem));
        }
    }

    /// Install the reduced table that bare-metal newlib guests need.
    pub fn setup_newlib_syscalls(&mut self) {
        self.install_syscall_handler(57, syscall_stub_zero); // close
        self.install_syscall_handler(62, fs::syscall_lseek);
        self.install_syscall_handler(63, fs::syscall_read);
        self.install_syscall_handler(64, fs::syscall_write);
        self.install_syscall_handler(80, syscall_stub_nosys); // fstat
        self.install_syscall_handler(93, syscall_exit);
        self.install_syscall_handler(214, syscall_brk);
    }
}

fn syscall_stub_zero(machine: &mut MachineState) -> Result<(), MachineError> {
    log::trace!(
        number = machine.core.hart.xregisters.read(registers::a7),
        "System call stubbed (zero)"
    );
    machine.set_result(0);
    Ok(())
}

fn syscall_stub_nosys(machine: &mut MachineState) -> Result<(), MachineError> {
    log::trace!(
        number = machine.core.hart.xregisters.read(registers::a7),
        "System call stubbed (nosys)"
    );
    machine.set_result(Error::NoSystemCall.into_xvalue());
    Ok(())
}

/// Handle `exit` and `exit_group`.
///
/// Stopping zeroes the instruction budget, which ends most dispatch
/// loops. It is not the only way to leave a program; tighter integrations
/// provide their own exits.
fn syscall_exit(machine: &mut MachineState) -> Result<(), MachineError> {
    log::debug!(
        code = machine.sysarg(0),
        "Guest requested exit"
    );
    machine.stop();
    Ok(())
}

/// The `ebreak` pseudo system call is always fatal.
fn syscall_ebreak(_machine: &mut MachineState) -> Result<(), MachineError> {
    Err(MachineError::UnhandledSyscall("EBREAK instruction"))
}

/// Handle `brk`. The break may only move within
/// `[heap_address, heap_address + brk_max]`; requests outside are
/// clamped, never an error.
///
/// See: <https://man7.org/linux/man-pages/man2/brk.2.html>
fn syscall_brk(machine: &mut MachineState) -> Result<(), MachineError> {
    let heap = machine.core.main_memory.heap_address;
    let ceiling = heap + machine.core.main_memory.brk_max;
    let new_end = machine.sysarg(0).clamp(heap, ceiling);
    machine.set_result(new_end);
    Ok(())
}

/// Handle `getrandom`. Requests above the ceiling fail outright.
///
/// See: <https://man7.org/linux/man-pages/man2/getrandom.2.html>
fn syscall_getrandom(machine: &mut MachineState) -> Result<(), MachineError> {
    let g_addr = machine.sysarg(0);
    let g_len = machine.sysarg(1) as usize;

    if g_len > GETRANDOM_MAX {
        machine.set_result(-1i64 as u64);
        return Ok(());
    }

    let mut buffer = [0u8; GETRANDOM_MAX];
    rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut buffer[..g_len]);
    machine.core.main_memory.memcpy(g_addr, &buffer[..g_len])?;
    machine.set_result(g_len as u64);
    Ok(())
}

/// Handle `uname`, reporting a machine string that matches the guest
/// width.
///
/// See: <https://man7.org/linux/man-pages/man2/uname.2.html>
fn syscall_uname(machine: &mut MachineState) -> Result<(), MachineError> {
    let buffer = machine.sysarg(0);

    let mut uts = [0u8; 6 * UTSLEN];
    let mut put = |field: usize, value: &str| {
        let start = field * UTSLEN;
        uts[start..start + value.len()].copy_from_slice(value.as_bytes());
    };
    put(0, "Linux");
    put(1, "riscv-usermode");
    put(2, "6.6.0");
    put(3, "");
    put(
        4,
        match machine.core.xlen {
            Xlen::Rv32 => "rv32imafdc",
            Xlen::Rv64 => "rv64imafdc",
        },
    );
    put(5, "(none)");

    machine.core.main_memory.memcpy(buffer, &uts)?;
    machine.set_result(0);
    Ok(())
}

/// `timespec` in the RV64 guest layout.
#[derive(Serialize, Deserialize)]
struct GuestTimespec64 {
    tv_sec: i64,
    tv_nsec: i64,
}

impl GuestStruct for GuestTimespec64 {
    const SIZE: usize = 16;
}

/// `timespec` in the RV32 guest layout.
#[derive(Serialize, Deserialize)]
struct GuestTimespec32 {
    tv_sec: i32,
    tv_nsec: i32,
}

impl GuestStruct for GuestTimespec32 {
    const SIZE: usize = 8;
}

/// `timeval` in the host layout, copied to the guest verbatim.
#[derive(Serialize, Deserialize)]
struct GuestTimeval {
    tv_sec: i64,
    tv_usec: i64,
}

impl GuestStruct for GuestTimeval {
    const SIZE: usize = 16;
}

/// `clock_gettime64` result layout, shared by both widths.
#[derive(Serialize, Deserialize)]
struct GuestTime64 {
    tv_sec: i64,
    tv_msec: i64,
}

impl GuestStruct for GuestTime64 {
    const SIZE: usize = 16;
}

fn read_guest_timespec(
    machine: &mut MachineState,
    addr: Address,
) -> Result<libc::timespec, MachineError> {
    let (tv_sec, tv_nsec) = match machine.core.xlen {
        Xlen::Rv64 => {
            let ts: GuestTimespec64 = machine.core.main_memory.copy_from_guest(addr)?;
            (ts.tv_sec, ts.tv_nsec)
        }
        Xlen::Rv32 => {
            let ts: GuestTimespec32 = machine.core.main_memory.copy_from_guest(addr)?;
            (ts.tv_sec as i64, ts.tv_nsec as i64)
        }
    };
    Ok(libc::timespec { tv_sec, tv_nsec })
}

fn write_guest_timespec(
    machine: &mut MachineState,
    addr: Address,
    ts: &libc::timespec,
) -> Result<(), MachineError> {
    match machine.core.xlen {
        Xlen::Rv64 => {
            let out = GuestTimespec64 {
                tv_sec: ts.tv_sec,
                tv_nsec: ts.tv_nsec,
            };
            machine.core.main_memory.copy_to_guest(addr, &out)?;
        }
        Xlen::Rv32 => {
            let out = GuestTimespec32 {
                tv_sec: ts.tv_sec as i32,
                tv_nsec: ts.tv_nsec as i32,
            };
            machine.core.main_memory.copy_to_guest(addr, &out)?;
        }
    }
    Ok(())
}

/// Handle `gettimeofday`.
///
/// See: <https://man7.org/linux/man-pages/man2/gettimeofday.2.html>
fn syscall_gettimeofday(machine: &mut MachineState) -> Result<(), MachineError> {
    let buffer = machine.sysarg(0);

    let mut tv: libc::timeval = unsafe { std::mem::zeroed() };
    let res = unsafe { libc::gettimeofday(&mut tv, std::ptr::null_mut()) };
    if res >= 0 {
        let out = GuestTimeval {
            tv_sec: tv.tv_sec,
            tv_usec: tv.tv_usec,
        };
        machine.core.main_memory.copy_to_guest(buffer, &out)?;
    }
    machine.set_result_or_error(res as i64);
    Ok(())
}

/// Handle `clock_gettime`, honouring the guest's timespec width.
///
/// See: <https://man7.org/linux/man-pages/man2/clock_gettime.2.html>
fn syscall_clock_gettime(machine: &mut MachineState) -> Result<(), MachineError> {
    let clkid = machine.sysarg(0) as i32;
    let buffer = machine.sysarg(1);

    let mut ts: libc::timespec = unsafe { std::mem::zeroed() };
    let res = unsafe { libc::clock_gettime(clkid, &mut ts) };
    if res >= 0 {
        write_guest_timespec(machine, buffer, &ts)?;
    }
    machine.set_result_or_error(res as i64);
    Ok(())
}

/// Handle `clock_gettime64`, which reports milliseconds rather than
/// nanoseconds in its second field.
fn syscall_clock_gettime64(machine: &mut MachineState) -> Result<(), MachineError> {
    let clkid = machine.sysarg(0) as i32;
    let buffer = machine.sysarg(1);

    let mut ts: libc::timespec = unsafe { std::mem::zeroed() };
    let res = unsafe { libc::clock_gettime(clkid, &mut ts) };
    if res >= 0 {
        let out = GuestTime64 {
            tv_sec: ts.tv_sec,
            tv_msec: ts.tv_nsec / 1_000_000,
        };
        machine.core.main_memory.copy_to_guest(buffer, &out)?;
    }
    machine.set_result_or_error(res as i64);
    Ok(())
}

/// Handle `nanosleep`. Blocks the host thread, and therefore the guest.
///
/// See: <https://man7.org/linux/man-pages/man2/nanosleep.2.html>
fn syscall_nanosleep(machine: &mut MachineState) -> Result<(), MachineError> {
    let g_req = machine.sysarg(0);
    let g_rem = machine.sysarg(1);

    let ts_req = read_guest_timespec(machine, g_req)?;
    let mut ts_rem = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };

    let rem_ptr = if g_rem != 0 {
        &mut ts_rem as *mut libc::timespec
    } else {
        std::ptr::null_mut()
    };
    let res = unsafe { libc::nanosleep(&ts_req, rem_ptr) };
    if res >= 0 {
        write_guest_timespec(machine, g_req, &ts_req)?;
        if g_rem != 0 {
            write_guest_timespec(machine, g_rem, &ts_rem)?;
        }
    }
    machine.set_result_or_error(res as i64);
    Ok(())
}

/// Handle `clock_nanosleep`. The host reports its failures as a positive
/// errno rather than through the errno variable.
///
/// See: <https://man7.org/linux/man-pages/man2/clock_nanosleep.2.html>
fn syscall_clock_nanosleep(machine: &mut MachineState) -> Result<(), MachineError> {
    let clkid = machine.sysarg(0) as i32;
    let flags = machine.sysarg(1) as i32;
    let g_request = machine.sysarg(2);
    let g_remain = machine.sysarg(3);

    let ts_req = read_guest_timespec(machine, g_request)?;
    let mut ts_rem = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };

    let res = unsafe { libc::clock_nanosleep(clkid, flags, &ts_req, &mut ts_rem) };
    if res == 0 {
        if g_remain != 0 {
            write_guest_timespec(machine, g_remain, &ts_rem)?;
        }
        machine.set_result(0);
    } else {
        machine.set_result(-(res as i64) as u64);
    }
    Ok(())
}
