// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use thiserror::Error;

/// Wire-level error numbers carried in response headers.
///
/// The numeric values are the conventional POSIX codes so that responses
/// remain meaningful to tooling that formats them with strerror-like tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[repr(u32)]
pub enum Errno {
    #[error("operation not permitted")]
    Perm = 1,
    #[error("no such entry")]
    NoEnt = 2,
    #[error("input/output error")]
    Io = 5,
    #[error("resource temporarily unavailable")]
    Again = 11,
    #[error("out of memory")]
    NoMem = 12,
    #[error("resource busy")]
    Busy = 16,
    #[error("entry exists")]
    Exist = 17,
    #[error("invalid argument")]
    Inval = 22,
    #[error("function not implemented")]
    NoSys = 38,
    #[error("protocol error")]
    Proto = 71,
    #[error("no route to host")]
    HostUnreach = 113,
}

impl Errno {
    pub fn code(self) -> u32 {
        self as u32
    }

    pub fn from_code(code: u32) -> Option<Self> {
        let errno = match code {
            1 => Errno::Perm,
            2 => Errno::NoEnt,
            5 => Errno::Io,
            11 => Errno::Again,
            12 => Errno::NoMem,
            16 => Errno::Busy,
            17 => Errno::Exist,
            22 => Errno::Inval,
            38 => Errno::NoSys,
            71 => Errno::Proto,
            113 => Errno::HostUnreach,
            _ => return None,
        };
        Some(errno)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_round_trip() {
        for errno in [
            Errno::Perm,
            Errno::NoEnt,
            Errno::Io,
            Errno::Again,
            Errno::NoMem,
            Errno::Busy,
            Errno::Exist,
            Errno::Inval,
            Errno::NoSys,
            Errno::Proto,
            Errno::HostUnreach,
        ] {
            assert_eq!(Errno::from_code(errno.code()), Some(errno));
        }
        assert_eq!(Errno::from_code(0), None);
        assert_eq!(Errno::from_code(9999), None);
    }
}
