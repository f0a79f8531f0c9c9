// SPDX-FileCopyrightText: 2026 TriliTech <contact@trili.tech>
//
// SPDX-License-Identifier: MIT

//! The virtual file-descriptor table.
//!
//! Guests never see host file descriptors: every host fd handed out by a
//! system call is wrapped in a virtual fd, small integers allocated
//! sequentially from 3. The standard descriptors 0, 1 and 2 translate to
//! themselves. Policy filters can veto opens, ioctls, stats and writes.

use std::collections::BTreeMap;

use super::error::Error;

/// Callback deciding whether a path may be opened or statted.
pub type PathFilter = Box<dyn Fn(&str) -> bool>;

/// Callback deciding whether an ioctl request may pass through.
pub type IoctlFilter = Box<dyn Fn(u64) -> bool>;

/// Callback deciding whether a virtual fd may be written to.
pub type WriteFilter = Box<dyn Fn(i32) -> bool>;

/// Virtual-fd to host-fd translation with policy filters. Owns every host
/// fd in the table; they are closed when the entry is erased or the table
/// is dropped.
pub struct FileDescriptors {
    translation: BTreeMap<i32, i32>,

    /// Next virtual fd to hand out
    counter: i32,

    /// Whether file-system system calls are allowed at all
    pub permit_filesystem: bool,

    /// Veto for `openat` and `readlinkat` paths
    pub filter_open: Option<PathFilter>,

    /// Veto for `ioctl` request codes
    pub filter_ioctl: Option<IoctlFilter>,

    /// Veto for `statx` paths
    pub filter_stat: Option<PathFilter>,

    /// Veto for writes to specific virtual fds
    pub filter_write: Option<WriteFilter>,
}

impl FileDescriptors {
    pub fn new(permit_filesystem: bool) -> Self {
        Self {
            translation: BTreeMap::new(),
            counter: 3,
            permit_filesystem,
            filter_open: None,
            filter_ioctl: None,
            filter_stat: None,
            filter_write: None,
        }
    }

    /// Take ownership of a host fd, returning the virtual fd the guest
    /// will use for it.
    pub fn assign_file(&mut self, real_fd: i32) -> i32 {
        let vfd = self.counter;
        self.counter += 1;
        self.translation.insert(vfd, real_fd);
        vfd
    }

    /// Translate a guest fd to a host fd. The standard descriptors and
    /// `AT_FDCWD` pass through unchanged.
    pub fn translate(&self, vfd: i32) -> Result<i32, Error> {
        if (0..=2).contains(&vfd) || vfd == libc::AT_FDCWD {
            return Ok(vfd);
        }
        self.translation
            .get(&vfd)
            .copied()
            .ok_or(Error::BadFileDescriptor)
    }

    /// Remove a virtual fd, returning the host fd it owned. The caller is
    /// responsible for closing it.
    pub fn erase(&mut self, vfd: i32) -> Option<i32> {
        self.translation.remove(&vfd)
    }

    /// Is the guest allowed to write to this virtual fd?
    pub fn permit_write(&self, vfd: i32) -> bool {
        match &self.filter_write {
            Some(filter) => filter(vfd),
            None => true,
        }
    }

    /// Does the table hold this virtual fd?
    pub fn contains(&self, vfd: i32) -> bool {
        self.translation.contains_key(&vfd)
    }
}

impl Drop for FileDescriptors {
    fn drop(&mut self) {
        // Close all the real fds
        for real_fd in self.translation.values() {
            // SAFETY: The table owns these fds; nothing else closes them.
            unsafe {
                libc::close(*real_fd);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_std_fds_translate_to_themselves() {
        let fds = FileDescriptors::new(true);
        for fd in 0..=2 {
            assert_eq!(fds.translate(fd), Ok(fd));
        }
        assert_eq!(fds.translate(libc::AT_FDCWD), Ok(libc::AT_FDCWD));
    }

    #[test]
    fn test_vfds_start_at_three() {
        let mut fds = FileDescriptors::new(true);
        // Use fds we do not own so the drop impl closes nothing real.
        let a = fds.assign_file(-1);
        let b = fds.assign_file(-1);
        assert_eq!(a, 3);
        assert_eq!(b, 4);
        fds.erase(a);
        fds.erase(b);
    }

    #[test]
    fn test_unknown_vfd_is_ebadf() {
        let fds = FileDescriptors::new(true);
        assert_eq!(fds.translate(17), Err(Error::BadFileDescriptor));
    }

    #[test]
    fn test_erase_returns_real_fd() {
        let mut fds = FileDescriptors::new(true);
        let vfd = fds.assign_file(-1);
        assert_eq!(fds.erase(vfd), Some(-1));
        assert_eq!(fds.erase(vfd), None);
        assert!(!fds.contains(vfd));
    }

    #[test]
    fn test_write_filter() {
        let mut fds = FileDescriptors::new(true);
        assert!(fds.permit_write(3));
        fds.filter_write = Some(Box::new(|vfd| vfd != 3));
        assert!(!fds.permit_write(3));
        assert!(fds.permit_write(4));
    }
}
