//! Shared vocabulary for the pagefs stack.
//!
//! Everything the other crates agree on lives here: the error surface, file
//! attributes and mode bits, open/mount flags, and the block-device contract
//! (including the asynchronous BIO request type). Higher layers depend on
//! this crate only, never on each other's internals.

pub mod attr;
pub mod block;
pub mod error;
pub mod flags;

pub use attr::{DirEntry, FileAttr, FileMode, FileType, StatFs};
pub use block::{Bio, BioCompletion, BioKind, BlockDevice};
pub use error::{FsError, FsErrorKind, FsResult};
pub use flags::{MountFlags, OpenFlags, SeekWhence};

/// Default sector size in bytes. Device geometry may override it, but every
/// sector size must divide [`PAGE_SIZE`].
pub const SECTOR_SIZE: u32 = 512;

/// Fixed page size in bytes for cached file content.
pub const PAGE_SIZE: usize = 4096;

/// Default filesystem block size in bytes.
pub const BLOCK_SIZE: u32 = 4096;

/// Longest permitted name component.
pub const MAX_NAME_LEN: usize = 255;

/// Bound on symlink indirection during a path walk.
pub const MAX_SYMLINK_DEPTH: usize = 40;
