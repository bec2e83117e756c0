//! Error surface for the whole stack.
//!
//! The kinds are intentionally errno-like: semantic failure modes that a
//! syscall shim can map to POSIX error numbers in a single place. Every
//! error carries a static context string naming the operation that raised
//! it, which is what shows up in logs and test assertions.

use std::fmt;
use std::io::ErrorKind;
use thiserror::Error;

/// Semantic failure modes raised by the core.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Error)]
pub enum FsErrorKind {
    #[error("not found")]
    NotFound, // ENOENT
    #[error("not a directory")]
    NotDir, // ENOTDIR
    #[error("is a directory")]
    IsDir, // EISDIR
    #[error("permission denied")]
    PermissionDenied, // EACCES
    #[error("already exists")]
    AlreadyExists, // EEXIST
    #[error("directory not empty")]
    DirNotEmpty, // ENOTEMPTY
    #[error("invalid argument")]
    InvalidInput, // EINVAL
    #[error("io error")]
    Io, // EIO
    #[error("out of memory")]
    NoMemory, // ENOMEM
    #[error("read-only device or filesystem")]
    ReadOnly, // EROFS
    #[error("no space left on device")]
    NoSpace, // ENOSPC
    #[error("cross-device link")]
    CrossDevice, // EXDEV
    #[error("too many levels of symbolic links")]
    TooManySymlinks, // ELOOP
    #[error("operation not supported")]
    NotSupported, // ENOTSUP
    #[error("resource busy")]
    Busy, // EBUSY
}

impl FsErrorKind {
    /// POSIX errno value for this kind, for the syscall boundary.
    pub fn to_errno(self) -> i32 {
        match self {
            FsErrorKind::NotFound => libc::ENOENT,
            FsErrorKind::NotDir => libc::ENOTDIR,
            FsErrorKind::IsDir => libc::EISDIR,
            FsErrorKind::PermissionDenied => libc::EACCES,
            FsErrorKind::AlreadyExists => libc::EEXIST,
            FsErrorKind::DirNotEmpty => libc::ENOTEMPTY,
            FsErrorKind::InvalidInput => libc::EINVAL,
            FsErrorKind::Io => libc::EIO,
            FsErrorKind::NoMemory => libc::ENOMEM,
            FsErrorKind::ReadOnly => libc::EROFS,
            FsErrorKind::NoSpace => libc::ENOSPC,
            FsErrorKind::CrossDevice => libc::EXDEV,
            FsErrorKind::TooManySymlinks => libc::ELOOP,
            FsErrorKind::NotSupported => libc::ENOTSUP,
            FsErrorKind::Busy => libc::EBUSY,
        }
    }
}

/// An error kind plus the operation that raised it (e.g. `"blockdev.write"`).
#[derive(Clone, Copy, Debug)]
pub struct FsError {
    kind: FsErrorKind,
    context: &'static str,
}

impl FsError {
    pub fn new(kind: FsErrorKind, context: &'static str) -> Self {
        Self { kind, context }
    }

    pub fn kind(&self) -> FsErrorKind {
        self.kind
    }

    pub fn context(&self) -> &'static str {
        self.context
    }

    pub fn to_errno(&self) -> i32 {
        self.kind.to_errno()
    }
}

impl fmt::Display for FsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.kind, self.context)
    }
}

impl std::error::Error for FsError {}

impl PartialEq for FsError {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind
    }
}

impl From<std::io::Error> for FsError {
    fn from(err: std::io::Error) -> Self {
        FsError::new(io_error_kind(&err), "io")
    }
}

/// Best-effort normalization of host `std::io::Error`s.
pub fn io_error_kind(err: &std::io::Error) -> FsErrorKind {
    if let Some(kind) = map_unix_errno(err) {
        return kind;
    }
    match err.kind() {
        ErrorKind::NotFound => FsErrorKind::NotFound,
        ErrorKind::PermissionDenied => FsErrorKind::PermissionDenied,
        ErrorKind::AlreadyExists => FsErrorKind::AlreadyExists,
        ErrorKind::InvalidInput => FsErrorKind::InvalidInput,
        ErrorKind::OutOfMemory => FsErrorKind::NoMemory,
        ErrorKind::Unsupported => FsErrorKind::NotSupported,
        _ => FsErrorKind::Io,
    }
}

fn map_unix_errno(err: &std::io::Error) -> Option<FsErrorKind> {
    let raw = err.raw_os_error()?;
    let kind = match raw {
        libc::ENOENT => FsErrorKind::NotFound,
        libc::ENOTDIR => FsErrorKind::NotDir,
        libc::EISDIR => FsErrorKind::IsDir,
        libc::EACCES => FsErrorKind::PermissionDenied,
        libc::EEXIST => FsErrorKind::AlreadyExists,
        libc::ENOTEMPTY => FsErrorKind::DirNotEmpty,
        libc::EINVAL => FsErrorKind::InvalidInput,
        libc::ENOMEM => FsErrorKind::NoMemory,
        libc::EROFS => FsErrorKind::ReadOnly,
        libc::ENOSPC => FsErrorKind::NoSpace,
        libc::EXDEV => FsErrorKind::CrossDevice,
        libc::ELOOP => FsErrorKind::TooManySymlinks,
        libc::EBUSY => FsErrorKind::Busy,
        _ => return None,
    };
    Some(kind)
}

pub type FsResult<T> = Result<T, FsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_round_trip_for_common_kinds() {
        assert_eq!(FsErrorKind::NotFound.to_errno(), libc::ENOENT);
        assert_eq!(FsErrorKind::ReadOnly.to_errno(), libc::EROFS);
        assert_eq!(FsErrorKind::NotDir.to_errno(), libc::ENOTDIR);
        assert_eq!(FsErrorKind::NoSpace.to_errno(), libc::ENOSPC);
    }

    #[test]
    fn error_carries_kind_and_context() {
        let err = FsError::new(FsErrorKind::InvalidInput, "blockdev.read");
        assert_eq!(err.kind(), FsErrorKind::InvalidInput);
        assert_eq!(err.context(), "blockdev.read");
        assert_eq!(err.to_string(), "invalid argument (blockdev.read)");
    }

    #[test]
    fn host_errno_is_normalized() {
        let err = std::io::Error::from_raw_os_error(libc::EROFS);
        assert_eq!(FsError::from(err).kind(), FsErrorKind::ReadOnly);
    }

    #[test]
    fn unknown_io_error_maps_to_io() {
        let err = std::io::Error::new(ErrorKind::UnexpectedEof, "eof");
        assert_eq!(io_error_kind(&err), FsErrorKind::Io);
    }
}
