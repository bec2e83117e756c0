//! Inodes and the per-filesystem inode operation table.

use crate::SuperBlock;
use pagefs_cache::{PageCache, PageOwner};
use pagefs_core::{
    BlockDevice, DirEntry, FileAttr, FileMode, FileType, FsError, FsErrorKind, FsResult, PAGE_SIZE,
};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::SystemTime;

/// Per-filesystem inode operations.
///
/// Directory operations take the directory inode as an explicit first
/// argument, so one value can serve every inode of its filesystem. Content
/// I/O defaults to the generic page-cache path; filesystems with their own
/// data path may override `read`/`write`.
pub trait InodeOps: Send + Sync {
    fn read(&self, inode: &Arc<Inode>, pos: u64, buf: &mut [u8]) -> FsResult<usize> {
        generic_read(inode, pos, buf)
    }

    fn write(&self, inode: &Arc<Inode>, pos: u64, buf: &[u8]) -> FsResult<usize> {
        generic_write(inode, pos, buf)
    }

    fn readdir(&self, dir: &Arc<Inode>) -> FsResult<Vec<DirEntry>>;

    fn lookup(&self, dir: &Arc<Inode>, name: &str) -> FsResult<Arc<Inode>>;

    fn create(&self, dir: &Arc<Inode>, name: &str, mode: FileMode) -> FsResult<Arc<Inode>>;

    fn unlink(&self, dir: &Arc<Inode>, name: &str) -> FsResult<()>;

    fn mkdir(&self, dir: &Arc<Inode>, name: &str, mode: FileMode) -> FsResult<Arc<Inode>>;

    fn rmdir(&self, dir: &Arc<Inode>, name: &str) -> FsResult<()>;

    fn rename(
        &self,
        old_dir: &Arc<Inode>,
        old_name: &str,
        new_dir: &Arc<Inode>,
        new_name: &str,
    ) -> FsResult<()>;

    fn symlink(&self, _dir: &Arc<Inode>, _name: &str, _target: &str) -> FsResult<Arc<Inode>> {
        Err(FsError::new(FsErrorKind::NotSupported, "inode_ops.symlink"))
    }

    fn readlink(&self, _inode: &Arc<Inode>) -> FsResult<String> {
        Err(FsError::new(FsErrorKind::NotSupported, "inode_ops.readlink"))
    }

    /// Notification that the in-core attributes changed.
    fn setattr(&self, _inode: &Arc<Inode>, _attr: &FileAttr) -> FsResult<()> {
        Ok(())
    }

    fn getxattr(&self, _inode: &Arc<Inode>, _name: &str) -> FsResult<String> {
        Err(FsError::new(FsErrorKind::NotSupported, "inode_ops.getxattr"))
    }

    fn setxattr(&self, _inode: &Arc<Inode>, _name: &str, _value: &str) -> FsResult<()> {
        Err(FsError::new(FsErrorKind::NotSupported, "inode_ops.setxattr"))
    }

    fn listxattr(&self, _inode: &Arc<Inode>) -> FsResult<Vec<String>> {
        Err(FsError::new(FsErrorKind::NotSupported, "inode_ops.listxattr"))
    }

    fn removexattr(&self, _inode: &Arc<Inode>, _name: &str) -> FsResult<()> {
        Err(FsError::new(
            FsErrorKind::NotSupported,
            "inode_ops.removexattr",
        ))
    }
}

/// Handle for one filesystem object: identity, attributes, and the route to
/// its superblock, operation table, and page cache.
///
/// The attribute mutex doubles as the per-inode lock for directory
/// mutations; `rename` orders two of them by ascending inode number.
pub struct Inode {
    ino: u64,
    sb: Weak<SuperBlock>,
    ops: Arc<dyn InodeOps>,
    cache: Arc<PageCache>,
    attr: Mutex<FileAttr>,
}

impl PageOwner for Inode {
    fn device(&self) -> FsResult<Arc<dyn BlockDevice>> {
        Ok(self.sb()?.device().clone())
    }
}

impl Inode {
    pub fn new(
        ino: u64,
        sb: &Arc<SuperBlock>,
        ops: Arc<dyn InodeOps>,
        attr: FileAttr,
    ) -> Arc<Self> {
        Arc::new(Self {
            ino,
            sb: Arc::downgrade(sb),
            ops,
            cache: sb.cache().clone(),
            attr: Mutex::new(attr),
        })
    }

    pub fn ino(&self) -> u64 {
        self.ino
    }

    pub fn sb(&self) -> FsResult<Arc<SuperBlock>> {
        self.sb
            .upgrade()
            .ok_or(FsError::new(FsErrorKind::Io, "inode.superblock"))
    }

    pub fn cache(&self) -> &Arc<PageCache> {
        &self.cache
    }

    pub fn ops(&self) -> &Arc<dyn InodeOps> {
        &self.ops
    }

    pub fn block_device(&self) -> FsResult<Arc<dyn BlockDevice>> {
        Ok(self.sb()?.device().clone())
    }

    /// This inode in its role as a page-cache key.
    pub fn as_page_owner(self: &Arc<Self>) -> Arc<dyn PageOwner> {
        self.clone()
    }

    pub fn getattr(&self) -> FileAttr {
        self.attr.lock().clone()
    }

    pub fn size(&self) -> u64 {
        self.attr.lock().size
    }

    pub fn mode(&self) -> FileMode {
        self.attr.lock().mode
    }

    pub fn is_dir(&self) -> bool {
        self.mode().file_type() == Some(FileType::Directory)
    }

    pub fn is_reg(&self) -> bool {
        self.mode().file_type() == Some(FileType::Regular)
    }

    pub fn is_symlink(&self) -> bool {
        self.mode().file_type() == Some(FileType::Symlink)
    }

    fn require_dir(&self, context: &'static str) -> FsResult<()> {
        if self.is_dir() {
            Ok(())
        } else {
            Err(FsError::new(FsErrorKind::NotDir, context))
        }
    }

    pub fn read(self: &Arc<Self>, pos: u64, buf: &mut [u8]) -> FsResult<usize> {
        self.ops.clone().read(self, pos, buf)
    }

    pub fn write(self: &Arc<Self>, pos: u64, buf: &[u8]) -> FsResult<usize> {
        self.ops.clone().write(self, pos, buf)
    }

    pub fn readdir(self: &Arc<Self>) -> FsResult<Vec<DirEntry>> {
        self.require_dir("inode.readdir")?;
        let _guard = self.attr.lock();
        self.ops.readdir(self)
    }

    pub fn lookup(self: &Arc<Self>, name: &str) -> FsResult<Arc<Inode>> {
        self.require_dir("inode.lookup")?;
        let _guard = self.attr.lock();
        self.ops.lookup(self, name)
    }

    pub fn create(self: &Arc<Self>, name: &str, mode: FileMode) -> FsResult<Arc<Inode>> {
        self.require_dir("inode.create")?;
        let mut guard = self.attr.lock();
        if !guard.mode.is_writable() {
            return Err(FsError::new(FsErrorKind::PermissionDenied, "inode.create"));
        }
        let inode = self.ops.create(self, name, mode)?;
        let now = SystemTime::now();
        guard.mtime = now;
        guard.ctime = now;
        Ok(inode)
    }

    pub fn unlink(self: &Arc<Self>, name: &str) -> FsResult<()> {
        self.require_dir("inode.unlink")?;
        let mut guard = self.attr.lock();
        if !guard.mode.is_writable() {
            return Err(FsError::new(FsErrorKind::PermissionDenied, "inode.unlink"));
        }
        self.ops.unlink(self, name)?;
        let now = SystemTime::now();
        guard.mtime = now;
        guard.ctime = now;
        Ok(())
    }

    pub fn mkdir(self: &Arc<Self>, name: &str, mode: FileMode) -> FsResult<Arc<Inode>> {
        self.require_dir("inode.mkdir")?;
        let mut guard = self.attr.lock();
        if !guard.mode.is_writable() {
            return Err(FsError::new(FsErrorKind::PermissionDenied, "inode.mkdir"));
        }
        let inode = self.ops.mkdir(self, name, mode)?;
        let now = SystemTime::now();
        guard.mtime = now;
        guard.ctime = now;
        Ok(inode)
    }

    pub fn rmdir(self: &Arc<Self>, name: &str) -> FsResult<()> {
        self.require_dir("inode.rmdir")?;
        let mut guard = self.attr.lock();
        if !guard.mode.is_writable() {
            return Err(FsError::new(FsErrorKind::PermissionDenied, "inode.rmdir"));
        }
        self.ops.rmdir(self, name)?;
        let now = SystemTime::now();
        guard.mtime = now;
        guard.ctime = now;
        Ok(())
    }

    /// Rename within or across directories of one filesystem. The two
    /// directory locks are taken in ascending inode-number order and held
    /// across the operation, so opposite-direction renames cannot deadlock.
    pub fn rename(
        self: &Arc<Self>,
        old_name: &str,
        new_dir: &Arc<Inode>,
        new_name: &str,
    ) -> FsResult<()> {
        self.require_dir("inode.rename")?;
        new_dir.require_dir("inode.rename")?;

        let same = Arc::ptr_eq(self, new_dir);
        let (mut old_guard, mut new_guard) = if same {
            (self.attr.lock(), None)
        } else if self.ino < new_dir.ino {
            let old = self.attr.lock();
            let new = new_dir.attr.lock();
            (old, Some(new))
        } else {
            let new = new_dir.attr.lock();
            let old = self.attr.lock();
            (old, Some(new))
        };

        if !old_guard.mode.is_writable()
            || new_guard.as_ref().is_some_and(|g| !g.mode.is_writable())
        {
            return Err(FsError::new(FsErrorKind::PermissionDenied, "inode.rename"));
        }

        self.ops.rename(self, old_name, new_dir, new_name)?;

        let now = SystemTime::now();
        old_guard.mtime = now;
        old_guard.ctime = now;
        if let Some(guard) = new_guard.as_mut() {
            guard.mtime = now;
            guard.ctime = now;
        }
        Ok(())
    }

    pub fn setattr(self: &Arc<Self>, new_attr: FileAttr) -> FsResult<()> {
        let mut guard = self.attr.lock();
        *guard = new_attr;
        guard.ctime = SystemTime::now();
        let snapshot = guard.clone();
        drop(guard);
        self.ops.setattr(self, &snapshot)
    }

    pub fn getxattr(self: &Arc<Self>, name: &str) -> FsResult<String> {
        self.ops.getxattr(self, name)
    }

    pub fn setxattr(self: &Arc<Self>, name: &str, value: &str) -> FsResult<()> {
        self.ops.setxattr(self, name, value)?;
        self.attr.lock().ctime = SystemTime::now();
        Ok(())
    }

    pub fn listxattr(self: &Arc<Self>) -> FsResult<Vec<String>> {
        self.ops.listxattr(self)
    }

    pub fn removexattr(self: &Arc<Self>, name: &str) -> FsResult<()> {
        self.ops.removexattr(self, name)?;
        self.attr.lock().ctime = SystemTime::now();
        Ok(())
    }

    pub fn symlink(self: &Arc<Self>, name: &str, target: &str) -> FsResult<Arc<Inode>> {
        self.require_dir("inode.symlink")?;
        let mut guard = self.attr.lock();
        if !guard.mode.is_writable() {
            return Err(FsError::new(FsErrorKind::PermissionDenied, "inode.symlink"));
        }
        let inode = self.ops.symlink(self, name, target)?;
        let now = SystemTime::now();
        guard.mtime = now;
        guard.ctime = now;
        Ok(inode)
    }

    pub fn readlink(self: &Arc<Self>) -> FsResult<String> {
        if !self.is_symlink() {
            return Err(FsError::new(FsErrorKind::InvalidInput, "inode.readlink"));
        }
        self.ops.readlink(self)
    }

    /// Flush this inode's pages through the cache, then persist metadata
    /// via the superblock's operation table.
    pub fn sync(self: &Arc<Self>) -> FsResult<()> {
        self.cache.sync_pages(Some(&self.as_page_owner()))?;
        if let Some(sb) = self.sb.upgrade() {
            sb.write_inode(self)?;
        }
        Ok(())
    }

    /// Resize the file. Shrinking invalidates pages lying entirely beyond
    /// the new end and zeroes the retained tail of the boundary page, so a
    /// later re-grow reads zeros.
    pub fn truncate(self: &Arc<Self>, new_size: u64) -> FsResult<()> {
        let mut guard = self.attr.lock();
        if new_size == guard.size {
            return Ok(());
        }
        if new_size < guard.size {
            let owner = self.as_page_owner();
            self.cache.truncate_pages(&owner, new_size);
            let tail = (new_size % PAGE_SIZE as u64) as usize;
            if tail != 0 {
                let page_off = new_size - tail as u64;
                if let Some(page) = self.cache.find_page(&owner, page_off) {
                    page.with_data_mut(|d| d[tail..].fill(0));
                    self.cache.write_page(&page);
                    self.cache.unpin(&page);
                }
            }
        }
        guard.size = new_size;
        let now = SystemTime::now();
        guard.mtime = now;
        guard.ctime = now;
        Ok(())
    }

    fn attr_lock(&self) -> parking_lot::MutexGuard<'_, FileAttr> {
        self.attr.lock()
    }
}

impl Drop for Inode {
    fn drop(&mut self) {
        // Cached pages hold strong references, so by the time this runs the
        // page cache has nothing left for this inode.
        if let Some(sb) = self.sb.upgrade() {
            sb.evict_inode(self.ino);
        }
    }
}

impl std::fmt::Debug for Inode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inode").field("ino", &self.ino).finish()
    }
}

/// Read file content through the page cache: iterate page-aligned spans,
/// populate each page on demand, copy out, unpin. Reads stop at EOF and
/// refresh `atime`.
pub fn generic_read(inode: &Arc<Inode>, pos: u64, buf: &mut [u8]) -> FsResult<usize> {
    let mut attr = inode.attr_lock();
    if pos >= attr.size {
        return Ok(0);
    }
    let want = buf.len().min((attr.size - pos) as usize);
    let owner = inode.as_page_owner();
    let page_size = PAGE_SIZE as u64;
    let mut done = 0usize;
    while done < want {
        let abs = pos + done as u64;
        let page_off = abs & !(page_size - 1);
        let in_page = (abs & (page_size - 1)) as usize;
        let n = (want - done).min(PAGE_SIZE - in_page);
        let page = inode.cache.read_page(&owner, page_off)?;
        page.with_data(|data| buf[done..done + n].copy_from_slice(&data[in_page..in_page + n]));
        inode.cache.unpin(&page);
        done += n;
    }
    attr.atime = SystemTime::now();
    Ok(done)
}

/// Write file content through the page cache. Partial pages are populated
/// before the copy-in; every touched page is marked dirty. Grows the file
/// size and refreshes `mtime`/`ctime` on success.
pub fn generic_write(inode: &Arc<Inode>, pos: u64, buf: &[u8]) -> FsResult<usize> {
    let mut attr = inode.attr_lock();
    if !attr.mode.is_writable() {
        return Err(FsError::new(FsErrorKind::PermissionDenied, "inode.write"));
    }
    if inode.sb()?.readonly() {
        return Err(FsError::new(FsErrorKind::ReadOnly, "inode.write"));
    }
    let owner = inode.as_page_owner();
    let page_size = PAGE_SIZE as u64;
    let mut done = 0usize;
    while done < buf.len() {
        let abs = pos + done as u64;
        let page_off = abs & !(page_size - 1);
        let in_page = (abs & (page_size - 1)) as usize;
        let n = (buf.len() - done).min(PAGE_SIZE - in_page);
        // A full-page overwrite needs no prior contents; anything partial
        // reads the page in first.
        let page = if in_page == 0 && n == PAGE_SIZE {
            inode.cache.find_or_create_page(&owner, page_off)
        } else {
            inode.cache.read_page(&owner, page_off)?
        };
        page.with_data_mut(|data| data[in_page..in_page + n].copy_from_slice(&buf[done..done + n]));
        inode.cache.write_page(&page);
        inode.cache.unpin(&page);
        done += n;
    }
    if pos + done as u64 > attr.size {
        attr.size = pos + done as u64;
    }
    let now = SystemTime::now();
    attr.mtime = now;
    attr.ctime = now;
    Ok(done)
}
