//! The polymorphic filesystem layer.
//!
//! Generic objects (inode, dentry, superblock, open file) dispatch to
//! per-filesystem operation tables ([`InodeOps`], [`SuperBlockOps`],
//! [`Filesystem`]); the [`Vfs`] service binds them together with a
//! filesystem-type registry, a mount table, and the path walker.
//!
//! Content I/O is uniform across filesystems: [`generic_read`] and
//! [`generic_write`] route through the page cache, and a filesystem's ops
//! table picks them up by default.

mod dentry;
mod file;
mod inode;
mod super_block;
mod vfs;

pub use dentry::Dentry;
pub use file::File;
pub use inode::{generic_read, generic_write, Inode, InodeOps};
pub use super_block::{Filesystem, SuperBlock, SuperBlockOps};
pub use vfs::{Vfs, VfsMount};
