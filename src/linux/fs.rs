// SPDX-FileCopyrightText: 2026 TriliTech <contact@trili.tech>
//
// SPDX-License-Identifier: MIT

//! File-system and I/O system calls.
//!
//! Reads and writes are zero-copy: guest ranges are gathered into host
//! `{ptr, len}` spans which feed the host's vectored I/O directly. Stdout
//! and stderr bypass the host fds and go through the machine's print
//! hook; stdin goes through the stdin hook.

use std::ffi::CString;

use serde::Deserialize;
use serde::Serialize;

use super::error::Error;
use crate::machine_state::memory::Address;
use crate::machine_state::memory::GuestStruct;
use crate::machine_state::memory::VBuffer;
use crate::machine_state::MachineError;
use crate::machine_state::MachineState;
use crate::machine_state::Xlen;

/// Cap on stdin reads, to bound the bounce buffer.
const STDIN_READ_MAX: usize = 16 * 1024 * 1024;

/// Cap on `readlinkat` output.
const READLINK_MAX: usize = 16 * 1024;

/// Most gather spans a plain read may produce.
const READ_BUFFERS: usize = 256;

/// Most gather spans a single write or iovec entry may produce.
const WRITE_BUFFERS: usize = 64;

/// Iovec count bounds, per `readv`/`writev`.
const READV_MAX_IOVEC: usize = 128;
const WRITEV_MAX_IOVEC: usize = 256;

fn empty_spans<const N: usize>() -> [VBuffer; N] {
    [VBuffer {
        ptr: std::ptr::null_mut(),
        len: 0,
    }; N]
}

/// Adapt neutral gather spans to the host's iovec type.
fn host_iovecs(spans: &[VBuffer]) -> Vec<libc::iovec> {
    spans
        .iter()
        .map(|span| libc::iovec {
            iov_base: span.ptr.cast(),
            iov_len: span.len,
        })
        .collect()
}

/// Translate a guest fd to a host fd, treating a missing fd table as a
/// bad descriptor.
fn translate_fd(machine: &MachineState, vfd: i32) -> Result<i32, Error> {
    match machine.fds.as_ref() {
        Some(fds) => fds.translate(vfd),
        None => Err(Error::BadFileDescriptor),
    }
}

/// Does the open filter veto this path?
fn open_filter_denies(machine: &MachineState, path: &str) -> bool {
    machine
        .fds
        .as_ref()
        .and_then(|fds| fds.filter_open.as_ref())
        .is_some_and(|filter| !filter(path))
}

/// `struct iovec` as the guest lays it out.
fn read_guest_iovecs(
    machine: &mut MachineState,
    addr: Address,
    count: usize,
) -> Result<Vec<(Address, u64)>, MachineError> {
    let mut entries = Vec::with_capacity(count);
    match machine.core.xlen {
        Xlen::Rv64 => {
            for i in 0..count {
                let base = machine.core.main_memory.read_u64(addr + i as u64 * 16)?;
                let len = machine.core.main_memory.read_u64(addr + i as u64 * 16 + 8)?;
                entries.push((base, len));
            }
        }
        Xlen::Rv32 => {
            for i in 0..count {
                let base = machine.core.main_memory.read_u32(addr + i as u64 * 8)?;
                let len = machine.core.main_memory.read_u32(addr + i as u64 * 8 + 4)?;
                entries.push((base as Address, len as u64));
            }
        }
    }
    Ok(entries)
}

/// Handle `openat`. Paths pass through the open filter; successful opens
/// get a fresh virtual fd.
///
/// See: <https://man7.org/linux/man-pages/man2/openat.2.html>
pub fn syscall_openat(machine: &mut MachineState) -> Result<(), MachineError> {
    let dir_fd = machine.sysarg(0) as i32;
    let g_path = machine.sysarg(1);
    let flags = machine.sysarg(2) as i32;

    // We go through memstring to prevent accessing memory out of bounds.
    let path = machine.core.main_memory.memstring(g_path)?;

    let permitted = machine
        .fds
        .as_ref()
        .is_some_and(|fds| fds.permit_filesystem);
    if !permitted {
        machine.set_result(Error::BadFileDescriptor.into_xvalue());
        return Ok(());
    }
    if open_filter_denies(machine, &path) {
        machine.set_result(Error::Permission.into_xvalue());
        return Ok(());
    }
    let real_dir = match translate_fd(machine, dir_fd) {
        Ok(fd) => fd,
        Err(err) => {
            machine.set_result(err.into_xvalue());
            return Ok(());
        }
    };

    let Ok(c_path) = CString::new(path) else {
        machine.set_result(Error::InvalidArgument.into_xvalue());
        return Ok(());
    };

    let real_fd =
        unsafe { libc::openat(real_dir, c_path.as_ptr(), flags, 0o666 as libc::c_uint) };
    if real_fd > 0 {
        let vfd = machine
            .fds_mut()
            .expect("checked above")
            .assign_file(real_fd);
        machine.set_result(vfd as u64);
    } else {
        machine.set_result_or_error(real_fd as i64);
    }
    Ok(())
}

/// Handle `close`. The standard descriptors are silently accepted.
///
/// See: <https://man7.org/linux/man-pages/man2/close.2.html>
pub fn syscall_close(machine: &mut MachineState) -> Result<(), MachineError> {
    let vfd = machine.sysarg(0) as i32;

    if (0..=2).contains(&vfd) {
        machine.set_result(0);
    } else if let Some(fds) = machine.fds_mut() {
        match fds.erase(vfd) {
            Some(real_fd) => {
                unsafe {
                    libc::close(real_fd);
                }
                machine.set_result(0);
            }
            None => machine.set_result(Error::BadFileDescriptor.into_xvalue()),
        }
    } else {
        machine.set_result(Error::BadFileDescriptor.into_xvalue());
    }
    Ok(())
}

/// Handle `dup`. The duplicated host fd gets its own virtual fd, so the
/// guest can close both independently.
///
/// See: <https://man7.org/linux/man-pages/man2/dup.2.html>
pub fn syscall_dup(machine: &mut MachineState) -> Result<(), MachineError> {
    let vfd = machine.sysarg(0) as i32;

    let real_fd = match translate_fd(machine, vfd) {
        Ok(fd) => fd,
        Err(err) => {
            machine.set_result(err.into_xvalue());
            return Ok(());
        }
    };

    let duped = unsafe { libc::dup(real_fd) };
    if duped >= 0 {
        let new_vfd = machine
            .fds_mut()
            .expect("checked above")
            .assign_file(duped);
        machine.set_result(new_vfd as u64);
    } else {
        machine.set_result_or_error(duped as i64);
    }
    Ok(())
}

/// Handle `pipe2`: create a host pipe and hand both ends to the guest as
/// virtual fds.
///
/// See: <https://man7.org/linux/man-pages/man2/pipe.2.html>
pub fn syscall_pipe2(machine: &mut MachineState) -> Result<(), MachineError> {
    let vfd_array = machine.sysarg(0);
    let flags = machine.sysarg(1) as i32;

    if machine.fds.is_none() {
        machine.set_result(Error::BadFileDescriptor.into_xvalue());
        return Ok(());
    }

    let mut pipes = [0i32; 2];
    let res = unsafe { libc::pipe2(pipes.as_mut_ptr(), flags) };
    if res == 0 {
        let fds = machine.fds_mut().expect("checked above");
        let vpipes = (fds.assign_file(pipes[0]), fds.assign_file(pipes[1]));
        machine.core.main_memory.copy_to_guest(vfd_array, &vpipes)?;
        machine.set_result(0);
    } else {
        machine.set_result_or_error(res as i64);
    }
    Ok(())
}

/// Handle `lseek`.
///
/// See: <https://man7.org/linux/man-pages/man2/lseek.2.html>
pub fn syscall_lseek(machine: &mut MachineState) -> Result<(), MachineError> {
    let vfd = machine.sysarg(0) as i32;
    let offset = machine.sysarg(1) as i64;
    let whence = machine.sysarg(2) as i32;

    match translate_fd(machine, vfd) {
        Ok(real_fd) => {
            let res = unsafe { libc::lseek(real_fd, offset, whence) };
            machine.set_result_or_error(res);
        }
        Err(err) => machine.set_result(err.into_xvalue()),
    }
    Ok(())
}

/// Handle `read`. Stdin goes through the machine's stdin hook via a
/// bounce buffer; other fds gather guest spans and `readv` straight into
/// them.
///
/// See: <https://man7.org/linux/man-pages/man2/read.2.html>
pub fn syscall_read(machine: &mut MachineState) -> Result<(), MachineError> {
    let vfd = machine.sysarg(0) as i32;
    let address = machine.sysarg(1);
    let len = machine.sysarg(2) as usize;

    if vfd == 0 {
        if len > STDIN_READ_MAX {
            machine.set_result(Error::NoMemory.into_xvalue());
            return Ok(());
        }
        let mut buffer = vec![0u8; len];
        let n = machine.stdin_read(&mut buffer);
        if n > 0 {
            machine.core.main_memory.memcpy(address, &buffer[..n])?;
        }
        machine.set_result(n as u64);
        return Ok(());
    }

    let real_fd = match translate_fd(machine, vfd) {
        Ok(fd) => fd,
        Err(err) => {
            machine.set_result(err.into_xvalue());
            return Ok(());
        }
    };

    let mut spans = empty_spans::<READ_BUFFERS>();
    let count = machine
        .core
        .main_memory
        .gather_buffers_from_range(&mut spans, address, len)?;
    let iov = host_iovecs(&spans[..count]);
    let res = unsafe { libc::readv(real_fd, iov.as_ptr(), iov.len() as i32) };
    machine.set_result_or_error(res as i64);
    Ok(())
}

/// Handle `write`. Stdout and stderr go through the machine's print hook;
/// other fds require write permission and use host `writev`.
///
/// See: <https://man7.org/linux/man-pages/man2/write.2.html>
pub fn syscall_write(machine: &mut MachineState) -> Result<(), MachineError> {
    let vfd = machine.sysarg(0) as i32;
    let address = machine.sysarg(1);
    let len = machine.sysarg(2) as usize;

    // Zero-copy retrieval of buffers
    let mut spans = empty_spans::<WRITE_BUFFERS>();

    if vfd == 1 || vfd == 2 {
        let count = machine
            .core
            .main_memory
            .gather_buffers_from_range(&mut spans, address, len)?;
        for span in &spans[..count] {
            let bytes = unsafe { span.as_slice() }.to_vec();
            machine.print(&bytes);
        }
        machine.set_result(len as u64);
        return Ok(());
    }

    let permitted = machine
        .fds
        .as_ref()
        .is_some_and(|fds| fds.permit_write(vfd));
    if !permitted {
        machine.set_result(Error::BadFileDescriptor.into_xvalue());
        return Ok(());
    }
    let real_fd = match translate_fd(machine, vfd) {
        Ok(fd) => fd,
        Err(err) => {
            machine.set_result(err.into_xvalue());
            return Ok(());
        }
    };

    let count = machine
        .core
        .main_memory
        .gather_buffers_from_range(&mut spans, address, len)?;
    let iov = host_iovecs(&spans[..count]);
    let res = unsafe { libc::writev(real_fd, iov.as_ptr(), iov.len() as i32) };
    machine.set_result_or_error(res as i64);
    Ok(())
}

/// Handle `readv`: expand every guest iovec into gather spans and issue a
/// single host `readv`.
///
/// See: <https://man7.org/linux/man-pages/man2/readv.2.html>
pub fn syscall_readv(machine: &mut MachineState) -> Result<(), MachineError> {
    let vfd = machine.sysarg(0) as i32;
    let iov_g = machine.sysarg(1);
    let count = machine.sysarg(2) as i64;

    if !(1..=READV_MAX_IOVEC as i64).contains(&count) {
        machine.set_result(Error::InvalidArgument.into_xvalue());
        return Ok(());
    }

    let real_fd = match machine.fds.as_ref() {
        _ if vfd == 1 || vfd == 2 => None,
        Some(fds) => fds.translate(vfd).ok(),
        None => None,
    };
    let Some(real_fd) = real_fd else {
        machine.set_result(Error::BadFileDescriptor.into_xvalue());
        return Ok(());
    };

    let entries = read_guest_iovecs(machine, iov_g, count as usize)?;

    let mut iov = Vec::new();
    for (base, len) in entries {
        let mut spans = empty_spans::<WRITE_BUFFERS>();
        let spans_used = machine
            .core
            .main_memory
            .gather_buffers_from_range(&mut spans, base, len as usize)?;
        if iov.len() + spans_used > READ_BUFFERS {
            machine.set_result(Error::InvalidArgument.into_xvalue());
            return Ok(());
        }
        iov.extend(host_iovecs(&spans[..spans_used]));
    }

    let res = unsafe { libc::readv(real_fd, iov.as_ptr(), iov.len() as i32) };
    machine.set_result_or_error(res as i64);
    Ok(())
}

/// Handle `writev`. Stdout and stderr print every gathered span and
/// report the full length; other fds write one guest iovec at a time and
/// stop at the first short result.
///
/// See: <https://man7.org/linux/man-pages/man2/writev.2.html>
pub fn syscall_writev(machine: &mut MachineState) -> Result<(), MachineError> {
    let vfd = machine.sysarg(0) as i32;
    let iov_g = machine.sysarg(1);
    let count = machine.sysarg(2) as i64;

    if !(0..=WRITEV_MAX_IOVEC as i64).contains(&count) {
        machine.set_result(Error::InvalidArgument.into_xvalue());
        return Ok(());
    }

    let standard = vfd == 1 || vfd == 2;
    let real_fd = if standard {
        vfd
    } else {
        match translate_fd(machine, vfd) {
            Ok(fd) => fd,
            Err(err) => {
                machine.set_result(err.into_xvalue());
                return Ok(());
            }
        }
    };

    let entries = read_guest_iovecs(machine, iov_g, count as usize)?;

    let mut res: i64 = 0;
    for (base, len) in entries {
        // Zero-copy retrieval of buffers
        let mut spans = empty_spans::<WRITE_BUFFERS>();
        let spans_used = machine
            .core
            .main_memory
            .gather_buffers_from_range(&mut spans, base, len as usize)?;

        if standard {
            for span in &spans[..spans_used] {
                let bytes = unsafe { span.as_slice() }.to_vec();
                machine.print(&bytes);
            }
            res += len as i64;
        } else {
            let iov = host_iovecs(&spans[..spans_used]);
            let written = unsafe { libc::writev(real_fd, iov.as_ptr(), iov.len() as i32) };
            if written > 0 {
                res += written as i64;
            } else if written < 0 {
                res = written as i64;
                break;
            } else {
                break;
            }
        }
    }
    machine.set_result_or_error(res);
    Ok(())
}

/// Handle `fcntl`, forwarding the extra arguments untouched.
///
/// See: <https://man7.org/linux/man-pages/man2/fcntl.2.html>
pub fn syscall_fcntl(machine: &mut MachineState) -> Result<(), MachineError> {
    let vfd = machine.sysarg(0) as i32;
    let cmd = machine.sysarg(1) as i32;
    let arg1 = machine.sysarg(2);
    let arg2 = machine.sysarg(3);
    let arg3 = machine.sysarg(4);

    match translate_fd(machine, vfd) {
        Ok(real_fd) => {
            let res = unsafe { libc::fcntl(real_fd, cmd, arg1, arg2, arg3) };
            machine.set_result_or_error(res as i64);
        }
        Err(err) => machine.set_result(err.into_xvalue()),
    }
    Ok(())
}

/// Handle `ioctl`. Request codes pass through the ioctl filter; only the
/// single pointer/integer argument is forwarded, which covers every
/// request that reaches a host `ioctl` on Linux.
///
/// See: <https://man7.org/linux/man-pages/man2/ioctl.2.html>
pub fn syscall_ioctl(machine: &mut MachineState) -> Result<(), MachineError> {
    let vfd = machine.sysarg(0) as i32;
    let req = machine.sysarg(1);
    let arg1 = machine.sysarg(2);

    if machine.fds.is_none() {
        machine.set_result(Error::BadFileDescriptor.into_xvalue());
        return Ok(());
    }
    let denied = machine
        .fds
        .as_ref()
        .and_then(|fds| fds.filter_ioctl.as_ref())
        .is_some_and(|filter| !filter(req));
    if denied {
        machine.set_result(Error::Permission.into_xvalue());
        return Ok(());
    }
    match translate_fd(machine, vfd) {
        Ok(real_fd) => {
            let res = unsafe { libc::ioctl(real_fd, req as libc::c_ulong, arg1) };
            machine.set_result_or_error(res as i64);
        }
        Err(err) => machine.set_result(err.into_xvalue()),
    }
    Ok(())
}

/// Handle `readlinkat`, bouncing the result through a bounded host
/// buffer.
///
/// See: <https://man7.org/linux/man-pages/man2/readlinkat.2.html>
pub fn syscall_readlinkat(machine: &mut MachineState) -> Result<(), MachineError> {
    let vfd = machine.sysarg(0) as i32;
    let g_path = machine.sysarg(1);
    let g_buf = machine.sysarg(2);
    let bufsize = machine.sysarg(3) as usize;

    let path = machine.core.main_memory.memstring(g_path)?;

    if bufsize > READLINK_MAX {
        machine.set_result(Error::NoMemory.into_xvalue());
        return Ok(());
    }

    if machine.fds.is_none() {
        machine.set_result(Error::NoSystemCall.into_xvalue());
        return Ok(());
    }
    if open_filter_denies(machine, &path) {
        machine.set_result(Error::Permission.into_xvalue());
        return Ok(());
    }
    let real_fd = match translate_fd(machine, vfd) {
        Ok(fd) => fd,
        Err(err) => {
            machine.set_result(err.into_xvalue());
            return Ok(());
        }
    };

    let Ok(c_path) = CString::new(path) else {
        machine.set_result(Error::InvalidArgument.into_xvalue());
        return Ok(());
    };
    let mut buffer = [0u8; READLINK_MAX];
    let res = unsafe {
        libc::readlinkat(
            real_fd,
            c_path.as_ptr(),
            buffer.as_mut_ptr().cast(),
            bufsize,
        )
    };
    if res > 0 {
        machine
            .core
            .main_memory
            .memcpy(g_buf, &buffer[..res as usize])?;
    }
    machine.set_result_or_error(res as i64);
    Ok(())
}

/// Handle `faccessat`.
///
/// See: <https://man7.org/linux/man-pages/man2/faccessat.2.html>
pub fn syscall_faccessat(machine: &mut MachineState) -> Result<(), MachineError> {
    let g_path = machine.sysarg(1);
    let mode = machine.sysarg(2) as i32;
    let flags = machine.sysarg(3) as i32;

    let path = machine.core.main_memory.memstring(g_path)?;
    let Ok(c_path) = CString::new(path) else {
        machine.set_result(Error::InvalidArgument.into_xvalue());
        return Ok(());
    };

    let res = unsafe { libc::faccessat(libc::AT_FDCWD, c_path.as_ptr(), mode, flags) };
    machine.set_result_or_error(res as i64);
    Ok(())
}

/// The RISC-V stat structure is different from the host's; 128 bytes,
/// packed.
#[derive(Serialize, Deserialize, Default)]
pub struct RiscvStat {
    pub st_dev: u64,
    pub st_ino: u64,
    pub st_mode: u32,
    pub st_nlink: u32,
    pub st_uid: u32,
    pub st_gid: u32,
    pub st_rdev: u64,
    __pad1: u64,
    pub st_size: i64,
    pub st_blksize: i32,
    __pad2: i32,
    pub st_blocks: i64,
    pub rv_atime: i64,
    pub rv_atime_nsec: u64,
    pub rv_mtime: i64,
    pub rv_mtime_nsec: u64,
    pub rv_ctime: i64,
    pub rv_ctime_nsec: u64,
    __unused4: u32,
    __unused5: u32,
}

impl GuestStruct for RiscvStat {
    const SIZE: usize = 128;
}

impl RiscvStat {
    fn from_host(st: &libc::stat) -> Self {
        Self {
            st_dev: st.st_dev as u64,
            st_ino: st.st_ino as u64,
            st_mode: st.st_mode,
            st_nlink: st.st_nlink as u32,
            st_uid: st.st_uid,
            st_gid: st.st_gid,
            st_rdev: st.st_rdev as u64,
            __pad1: 0,
            st_size: st.st_size,
            st_blksize: st.st_blksize as i32,
            __pad2: 0,
            st_blocks: st.st_blocks,
            rv_atime: st.st_atime,
            rv_atime_nsec: st.st_atime_nsec as u64,
            rv_mtime: st.st_mtime,
            rv_mtime_nsec: st.st_mtime_nsec as u64,
            rv_ctime: st.st_ctime,
            rv_ctime_nsec: st.st_ctime_nsec as u64,
            __unused4: 0,
            __unused5: 0,
        }
    }
}

/// Handle `fstatat`/`newfstatat`, translating the host stat into the
/// RISC-V layout.
///
/// See: <https://man7.org/linux/man-pages/man2/fstatat.2.html>
pub fn syscall_fstatat(machine: &mut MachineState) -> Result<(), MachineError> {
    let vfd = machine.sysarg(0) as i32;
    let g_path = machine.sysarg(1);
    let g_buf = machine.sysarg(2);
    let flags = machine.sysarg(3) as i32;

    let path = machine.core.main_memory.memstring(g_path)?;

    if machine.fds.is_none() {
        machine.set_result(Error::NoSystemCall.into_xvalue());
        return Ok(());
    }
    let real_fd = match translate_fd(machine, vfd) {
        Ok(fd) => fd,
        Err(err) => {
            machine.set_result(err.into_xvalue());
            return Ok(());
        }
    };
    let Ok(c_path) = CString::new(path) else {
        machine.set_result(Error::InvalidArgument.into_xvalue());
        return Ok(());
    };

    let mut st: libc::stat = unsafe { std::mem::zeroed() };
    let res = unsafe { libc::fstatat(real_fd, c_path.as_ptr(), &mut st, flags) };
    if res == 0 {
        // Convert to the RISC-V structure
        let rst = RiscvStat::from_host(&st);
        machine.core.main_memory.copy_to_guest(g_buf, &rst)?;
    }
    machine.set_result_or_error(res as i64);
    Ok(())
}

/// Handle `fstat`.
///
/// See: <https://man7.org/linux/man-pages/man2/fstat.2.html>
pub fn syscall_fstat(machine: &mut MachineState) -> Result<(), MachineError> {
    let vfd = machine.sysarg(0) as i32;
    let g_buf = machine.sysarg(1);

    if machine.fds.is_none() {
        machine.set_result(Error::NoSystemCall.into_xvalue());
        return Ok(());
    }
    let real_fd = match translate_fd(machine, vfd) {
        Ok(fd) => fd,
        Err(err) => {
            machine.set_result(err.into_xvalue());
            return Ok(());
        }
    };

    let mut st: libc::stat = unsafe { std::mem::zeroed() };
    let res = unsafe { libc::fstat(real_fd, &mut st) };
    if res == 0 {
        let rst = RiscvStat::from_host(&st);
        machine.core.main_memory.copy_to_guest(g_buf, &rst)?;
    }
    machine.set_result_or_error(res as i64);
    Ok(())
}

/// Handle `statx`. The host struct is copied to the guest verbatim; its
/// layout is identical on RISC-V.
///
/// See: <https://man7.org/linux/man-pages/man2/statx.2.html>
#[cfg(target_os = "linux")]
pub fn syscall_statx(machine: &mut MachineState) -> Result<(), MachineError> {
    let dir_fd = machine.sysarg(0) as i32;
    let g_path = machine.sysarg(1);
    let flags = machine.sysarg(2) as i32;
    let mask = machine.sysarg(3) as u32;
    let buffer = machine.sysarg(4);

    let path = machine.core.main_memory.memstring(g_path)?;

    if machine.fds.is_none() {
        machine.set_result(Error::NoSystemCall.into_xvalue());
        return Ok(());
    }
    let denied = machine
        .fds
        .as_ref()
        .and_then(|fds| fds.filter_stat.as_ref())
        .is_some_and(|filter| !filter(&path));
    if denied {
        machine.set_result(Error::Permission.into_xvalue());
        return Ok(());
    }
    let real_dir = match translate_fd(machine, dir_fd) {
        Ok(fd) => fd,
        Err(err) => {
            machine.set_result(err.into_xvalue());
            return Ok(());
        }
    };
    let Ok(c_path) = CString::new(path) else {
        machine.set_result(Error::InvalidArgument.into_xvalue());
        return Ok(());
    };

    let mut stx: libc::statx = unsafe { std::mem::zeroed() };
    let res = unsafe { libc::statx(real_dir, c_path.as_ptr(), flags, mask, &mut stx) };
    if res == 0 {
        // SAFETY: `statx` is plain old data; its bytes are a valid guest
        // image of the identical RISC-V layout.
        let bytes = unsafe {
            std::slice::from_raw_parts(
                (&stx as *const libc::statx).cast::<u8>(),
                std::mem::size_of::<libc::statx>(),
            )
        };
        machine.core.main_memory.memcpy(buffer, bytes)?;
    }
    machine.set_result_or_error(res as i64);
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::linux::fds::FileDescriptors;
    use crate::machine_state::registers;
    use crate::machine_state::MachineOptions;
    use crate::machine_state::MachineState;

    fn machine_with_fds() -> MachineState {
        let mut machine = MachineState::new(Xlen::Rv64, MachineOptions::default());
        machine.fds = Some(FileDescriptors::new(true));
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
    fn test_openat_read_close_lifecycle() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"emulator test data").unwrap();

        let mut machine = machine_with_fds();

        // Guest path string
        let path = file.path().to_str().unwrap();
        let g_path = 0x5000u64;
        machine
            .core
            .main_memory
            .memcpy(g_path, path.as_bytes())
            .unwrap();
        machine
            .core
            .main_memory
            .write_u8(g_path + path.len() as u64, 0)
            .unwrap();

        // openat(AT_FDCWD, path, O_RDONLY)
        set_args(&mut machine, &[libc::AT_FDCWD as u64, g_path, 0]);
        syscall_openat(&mut machine).unwrap();
        let vfd = machine.return_value() as i64;
        assert!(vfd >= 3, "fresh virtual fds start at 3, got {vfd}");

        // read(vfd, buf, 64)
        let g_buf = 0x6000u64;
        set_args(&mut machine, &[vfd as u64, g_buf, 64]);
        syscall_read(&mut machine).unwrap();
        assert_eq!(machine.return_value(), 18);
        let mut readback = vec![0u8; 18];
        machine
            .core
            .main_memory
            .memcpy_out(&mut readback, g_buf)
            .unwrap();
        assert_eq!(&readback, b"emulator test data");

        // close(vfd)
        set_args(&mut machine, &[vfd as u64]);
        syscall_close(&mut machine).unwrap();
        assert_eq!(machine.return_value(), 0);
        assert!(!machine.fds.as_ref().unwrap().contains(vfd as i32));

        // A second close is EBADF.
        set_args(&mut machine, &[vfd as u64]);
        syscall_close(&mut machine).unwrap();
        assert_eq!(machine.return_value() as i64, -9);
    }

    #[test]
    fn test_open_filter_denies_with_eperm() {
        let mut machine = machine_with_fds();
        machine.fds.as_mut().unwrap().filter_open =
            Some(Box::new(|path| !path.starts_with("/etc")));

        let g_path = 0x5000u64;
        machine
            .core
            .main_memory
            .memcpy(g_path, b"/etc/hostname\0")
            .unwrap();
        set_args(&mut machine, &[libc::AT_FDCWD as u64, g_path, 0]);
        syscall_openat(&mut machine).unwrap();
        assert_eq!(machine.return_value() as i64, -1);
    }

    #[test]
    fn test_write_to_stdout_goes_through_hook() {
        use std::cell::RefCell;
        use std::rc::Rc;

        let mut machine = machine_with_fds();
        let captured = Rc::new(RefCell::new(Vec::new()));
        let sink = captured.clone();
        machine.hooks.stdout = Box::new(move |bytes| {
            sink.borrow_mut().extend_from_slice(bytes);
        });

        let g_buf = 0x7000u64;
        machine.core.main_memory.memcpy(g_buf, b"hello\n").unwrap();
        set_args(&mut machine, &[1, g_buf, 6]);
        syscall_write(&mut machine).unwrap();

        assert_eq!(machine.return_value(), 6);
        assert_eq!(captured.borrow().as_slice(), b"hello\n");
    }

    #[test]
    fn test_writev_to_stdout_sums_lengths() {
        use std::cell::RefCell;
        use std::rc::Rc;

        let mut machine = machine_with_fds();
        let captured = Rc::new(RefCell::new(Vec::new()));
        let sink = captured.clone();
        machine.hooks.stdout = Box::new(move |bytes| {
            sink.borrow_mut().extend_from_slice(bytes);
        });

        // Buffer "hello\n" split into two iovecs: {buf, 5} and {buf+5, 1}.
        let g_buf = 0x7000u64;
        machine.core.main_memory.memcpy(g_buf, b"hello\n").unwrap();
        let g_iov = 0x7100u64;
        for (i, (base, len)) in [(g_buf, 5u64), (g_buf + 5, 1u64)].iter().enumerate() {
            let at = g_iov + i as u64 * 16;
            machine.core.main_memory.write_u64(at, *base).unwrap();
            machine.core.main_memory.write_u64(at + 8, *len).unwrap();
        }

        set_args(&mut machine, &[1, g_iov, 2]);
        syscall_writev(&mut machine).unwrap();
        assert_eq!(machine.return_value(), 6);
        assert_eq!(captured.borrow().as_slice(), b"hello\n");
    }

    #[test]
    fn test_writev_iovec_bounds() {
        let mut machine = machine_with_fds();
        set_args(&mut machine, &[1, 0x7000, 257]);
        syscall_writev(&mut machine).unwrap();
        assert_eq!(machine.return_value() as i64, -22);
    }

    #[test]
    fn test_readv_count_bounds() {
        let mut machine = machine_with_fds();
        set_args(&mut machine, &[3, 0x7000, 0]);
        syscall_readv(&mut machine).unwrap();
        assert_eq!(machine.return_value() as i64, -22);

        set_args(&mut machine, &[3, 0x7000, 129]);
        syscall_readv(&mut machine).unwrap();
        assert_eq!(machine.return_value() as i64, -22);
    }

    #[test]
    fn test_write_without_fds_is_ebadf() {
        let mut machine = MachineState::new(Xlen::Rv64, MachineOptions::default());
        machine.core.main_memory.memcpy(0x7000, b"data").unwrap();
        set_args(&mut machine, &[5, 0x7000, 4]);
        syscall_write(&mut machine).unwrap();
        assert_eq!(machine.return_value() as i64, -9);
    }

    #[test]
    fn test_fstat_translates_struct() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"0123456789").unwrap();
        file.flush().unwrap();

        use std::os::fd::AsRawFd;

        let mut machine = machine_with_fds();
        let real = unsafe { libc::dup(file.as_file().as_raw_fd()) };
        let vfd = machine.fds.as_mut().unwrap().assign_file(real);

        let g_buf = 0x8000u64;
        set_args(&mut machine, &[vfd as u64, g_buf]);
        syscall_fstat(&mut machine).unwrap();
        assert_eq!(machine.return_value(), 0);

        let rst: RiscvStat = machine.core.main_memory.copy_from_guest(g_buf).unwrap();
        assert_eq!(rst.st_size, 10);
        assert!(rst.st_mode & libc::S_IFREG > 0);
    }

    #[test]
    fn test_pipe2_assigns_two_vfds() {
        let mut machine = machine_with_fds();
        let g_fds = 0x9000u64;
        set_args(&mut machine, &[g_fds, 0]);
        syscall_pipe2(&mut machine).unwrap();
        assert_eq!(machine.return_value(), 0);

        let read_vfd = machine.core.main_memory.read_u32(g_fds).unwrap() as i32;
        let write_vfd = machine.core.main_memory.read_u32(g_fds + 4).unwrap() as i32;
        assert!(read_vfd >= 3);
        assert_eq!(write_vfd, read_vfd + 1);
        assert!(machine.fds.as_ref().unwrap().contains(read_vfd));
        assert!(machine.fds.as_ref().unwrap().contains(write_vfd));
    }
}
