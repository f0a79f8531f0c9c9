// SPDX-FileCopyrightText: 2026 TriliTech <contact@trili.tech>
//
// SPDX-License-Identifier: MIT

//! Linux system call error codes.
//!
//! These are the guest-visible errors: they are negated into `a0` per the
//! kernel ABI and the guest continues. Fatal machine conditions live in
//! [`MachineError`](crate::machine_state::MachineError) instead.

use crate::machine_state::registers::XValue;

/// Linux system call error codes
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(i32)]
pub enum Error {
    /// Operation not permitted
    ///
    /// See [`EPERM`](https://github.com/torvalds/linux/blob/master/include/uapi/asm-generic/errno-base.h#L5)
    Permission = 1,

    /// Process or thread not found
    ///
    /// See [`ESRCH`](https://github.com/torvalds/linux/blob/master/include/uapi/asm-generic/errno-base.h#L7)
    Search = 3,

    /// File descriptor is bad
    ///
    /// See [`EBADF`](https://github.com/torvalds/linux/blob/master/include/uapi/asm-generic/errno-base.h#L13)
    BadFileDescriptor = 9,

    /// Out of memory
    ///
    /// See [`ENOMEM`](https://github.com/torvalds/linux/blob/master/include/uapi/asm-generic/errno-base.h#L16)
    NoMemory = 12,

    /// Access denied
    ///
    /// See [`EACCES`](https://github.com/torvalds/linux/blob/master/include/uapi/asm-generic/errno-base.h#L17)
    Access = 13,

    /// Fault during memory access
    ///
    /// See [`EFAULT`](https://github.com/torvalds/linux/blob/master/include/uapi/asm-generic/errno-base.h#L18)
    Fault = 14,

    /// No such device
    ///
    /// See [`ENODEV`](https://github.com/torvalds/linux/blob/master/include/uapi/asm-generic/errno-base.h#L23)
    NoDevice = 19,

    /// Invalid argument
    ///
    /// See [`EINVAL`](https://github.com/torvalds/linux/blob/master/include/uapi/asm-generic/errno-base.h#L26)
    InvalidArgument = 22,

    /// Out of range
    ///
    /// See [`ERANGE`](https://github.com/torvalds/linux/blob/master/include/uapi/asm-generic/errno-base.h#L38)
    Range = 34,

    /// System call is not supported
    ///
    /// See [`ENOSYS`](https://github.com/torvalds/linux/blob/master/include/uapi/asm-generic/errno.h#L18)
    NoSystemCall = 38,
}

impl Error {
    /// Turn into an error code that can be returned via an integer
    /// register.
    pub fn into_xvalue(self) -> XValue {
        // The discriminant matches the error code
        let error_code = -(self as i32);
        error_code as i64 as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_negate() {
        assert_eq!(Error::BadFileDescriptor.into_xvalue() as i64, -9);
        assert_eq!(Error::NoSystemCall.into_xvalue() as i64, -38);
        assert_eq!(Error::Permission.into_xvalue() as i64, -1);
    }

    #[test]
    fn test_errno_range_is_kernel_abi() {
        // Negative values in [-4095, -1] are errno by convention.
        let value = Error::Range.into_xvalue() as i64;
        assert!((-4095..=-1).contains(&value));
    }
}
