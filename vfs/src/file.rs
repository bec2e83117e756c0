//! Open-file handles.

use crate::{Dentry, Inode};
use pagefs_core::{
    DirEntry, FileAttr, FsError, FsErrorKind, FsResult, OpenFlags, SeekWhence,
};
use parking_lot::Mutex;
use std::sync::Arc;

/// Open-file state: a dentry, the open flags, and a current position under
/// its own lock.
#[derive(Debug)]
pub struct File {
    dentry: Arc<Dentry>,
    flags: OpenFlags,
    pos: Mutex<u64>,
}

impl File {
    pub fn new(dentry: Arc<Dentry>, flags: OpenFlags) -> Arc<Self> {
        Arc::new(Self {
            dentry,
            flags,
            pos: Mutex::new(0),
        })
    }

    pub fn dentry(&self) -> &Arc<Dentry> {
        &self.dentry
    }

    pub fn inode(&self) -> &Arc<Inode> {
        self.dentry.inode()
    }

    pub fn flags(&self) -> OpenFlags {
        self.flags
    }

    pub fn pos(&self) -> u64 {
        *self.pos.lock()
    }

    /// Read from the current position, advancing it by the bytes read.
    pub fn read(&self, buf: &mut [u8]) -> FsResult<usize> {
        if !self.flags.readable() {
            return Err(FsError::new(FsErrorKind::PermissionDenied, "file.read"));
        }
        let mut pos = self.pos.lock();
        let n = self.inode().read(*pos, buf)?;
        *pos += n as u64;
        Ok(n)
    }

    /// Write at the current position (or at EOF for append-mode handles),
    /// advancing it by the bytes written.
    pub fn write(&self, buf: &[u8]) -> FsResult<usize> {
        if !self.flags.writable() {
            return Err(FsError::new(FsErrorKind::PermissionDenied, "file.write"));
        }
        let mut pos = self.pos.lock();
        if self.flags.contains(OpenFlags::APPEND) {
            *pos = self.inode().size();
        }
        let n = self.inode().write(*pos, buf)?;
        *pos += n as u64;
        Ok(n)
    }

    pub fn seek(&self, offset: i64, whence: SeekWhence) -> FsResult<u64> {
        let mut pos = self.pos.lock();
        let base = match whence {
            SeekWhence::Set => 0,
            SeekWhence::Cur => *pos,
            SeekWhence::End => self.inode().size(),
        };
        let next = base
            .checked_add_signed(offset)
            .ok_or(FsError::new(FsErrorKind::InvalidInput, "file.seek"))?;
        *pos = next;
        Ok(next)
    }

    pub fn fsync(&self) -> FsResult<()> {
        self.inode().sync()
    }

    pub fn truncate(&self, size: u64) -> FsResult<()> {
        if !self.flags.writable() {
            return Err(FsError::new(FsErrorKind::PermissionDenied, "file.truncate"));
        }
        self.inode().truncate(size)
    }

    pub fn readdir(&self) -> FsResult<Vec<DirEntry>> {
        self.inode().readdir()
    }

    pub fn fstat(&self) -> FsResult<FileAttr> {
        Ok(self.inode().getattr())
    }
}
