//! Open, mount, and seek flags.
//!
//! These are internal bits, not raw POSIX values; the syscall shim translates
//! at the boundary.

use crate::{FsError, FsErrorKind, FsResult};
use bitflags::bitflags;

bitflags! {
    /// Open semantics flags. Read-only access is the empty access set.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct OpenFlags: u32 {
        const WRONLY = 1 << 0;
        const RDWR = 1 << 1;
        const CREAT = 1 << 2;
        const TRUNC = 1 << 3;
        const APPEND = 1 << 4;
        const EXCL = 1 << 5;
    }
}

impl OpenFlags {
    pub fn readable(self) -> bool {
        !self.contains(OpenFlags::WRONLY) || self.contains(OpenFlags::RDWR)
    }

    pub fn writable(self) -> bool {
        self.intersects(OpenFlags::WRONLY | OpenFlags::RDWR | OpenFlags::APPEND)
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct MountFlags: u32 {
        const READ_ONLY = 1 << 0;
        const NO_EXEC = 1 << 1;
        const NO_SUID = 1 << 2;
    }
}

/// Seek origin, converted from the raw `whence` values the libc layer uses.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SeekWhence {
    Set,
    Cur,
    End,
}

impl SeekWhence {
    pub fn from_raw(whence: i32) -> FsResult<Self> {
        match whence {
            0 => Ok(SeekWhence::Set),
            1 => Ok(SeekWhence::Cur),
            2 => Ok(SeekWhence::End),
            _ => Err(FsError::new(FsErrorKind::InvalidInput, "flags.whence")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn access_bits() {
        assert!(OpenFlags::empty().readable());
        assert!(!OpenFlags::empty().writable());
        assert!(!OpenFlags::WRONLY.readable());
        assert!(OpenFlags::WRONLY.writable());
        assert!(OpenFlags::RDWR.readable());
        assert!(OpenFlags::RDWR.writable());
        assert!((OpenFlags::RDWR | OpenFlags::APPEND).writable());
    }

    #[test]
    fn whence_conversion() {
        assert_eq!(SeekWhence::from_raw(0).expect("set"), SeekWhence::Set);
        assert_eq!(SeekWhence::from_raw(1).expect("cur"), SeekWhence::Cur);
        assert_eq!(SeekWhence::from_raw(2).expect("end"), SeekWhence::End);
        let err = SeekWhence::from_raw(9).expect_err("bad whence should fail");
        assert_eq!(err.kind(), FsErrorKind::InvalidInput);
    }
}
