//! Superblocks and the per-filesystem-type capability traits.

use crate::{Dentry, Inode};
use pagefs_cache::PageCache;
use pagefs_core::{BlockDevice, FileMode, FsError, FsErrorKind, FsResult, MountFlags, StatFs};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tracing::trace;

/// Per-mount instance operations, dispatched through the superblock.
///
/// The superblock is an explicit argument so implementations carry no
/// back-pointer to it.
pub trait SuperBlockOps: Send + Sync {
    fn alloc_inode(&self, sb: &Arc<SuperBlock>, mode: FileMode) -> FsResult<Arc<Inode>>;

    fn free_inode(&self, sb: &Arc<SuperBlock>, inode: &Arc<Inode>) -> FsResult<()>;

    fn read_inode(&self, sb: &Arc<SuperBlock>, ino: u64) -> FsResult<Arc<Inode>>;

    fn write_inode(&self, sb: &Arc<SuperBlock>, inode: &Arc<Inode>) -> FsResult<()>;

    fn sync(&self, sb: &Arc<SuperBlock>) -> FsResult<()>;

    fn statfs(&self, sb: &Arc<SuperBlock>) -> FsResult<StatFs>;

    fn remount(&self, sb: &Arc<SuperBlock>, flags: MountFlags) -> FsResult<()>;
}

/// Static per-filesystem-type capability: how instances come and go.
pub trait Filesystem: Send + Sync {
    fn name(&self) -> &'static str;

    fn mount(
        &self,
        device: Arc<dyn BlockDevice>,
        flags: MountFlags,
        options: &str,
        cache: &Arc<PageCache>,
    ) -> FsResult<Arc<SuperBlock>>;

    fn unmount(&self, sb: &Arc<SuperBlock>) -> FsResult<()>;

    fn statfs(&self, sb: &Arc<SuperBlock>) -> FsResult<StatFs>;
}

/// Per-mounted-filesystem state: the backing device, the operation table,
/// the root dentry, and a weak inode cache keyed by inode number.
pub struct SuperBlock {
    device: Arc<dyn BlockDevice>,
    fs_name: &'static str,
    flags: Mutex<MountFlags>,
    cache: Arc<PageCache>,
    ops: Arc<dyn SuperBlockOps>,
    root: RwLock<Option<Arc<Dentry>>>,
    icache: Mutex<HashMap<u64, Weak<Inode>>>,
}

impl SuperBlock {
    pub fn new(
        device: Arc<dyn BlockDevice>,
        fs_name: &'static str,
        flags: MountFlags,
        cache: Arc<PageCache>,
        ops: Arc<dyn SuperBlockOps>,
    ) -> Arc<Self> {
        Arc::new(Self {
            device,
            fs_name,
            flags: Mutex::new(flags),
            cache,
            ops,
            root: RwLock::new(None),
            icache: Mutex::new(HashMap::new()),
        })
    }

    pub fn device(&self) -> &Arc<dyn BlockDevice> {
        &self.device
    }

    pub fn fs_name(&self) -> &'static str {
        self.fs_name
    }

    pub fn flags(&self) -> MountFlags {
        *self.flags.lock()
    }

    pub fn set_flags(&self, flags: MountFlags) {
        *self.flags.lock() = flags;
    }

    pub fn readonly(&self) -> bool {
        self.flags().contains(MountFlags::READ_ONLY) || self.device.readonly()
    }

    pub fn cache(&self) -> &Arc<PageCache> {
        &self.cache
    }

    pub fn ops(&self) -> &Arc<dyn SuperBlockOps> {
        &self.ops
    }

    pub fn root(&self) -> Option<Arc<Dentry>> {
        self.root.read().clone()
    }

    pub fn set_root(&self, root: Arc<Dentry>) {
        *self.root.write() = Some(root);
    }

    /// Look an inode up by number: weak cache first, then the filesystem's
    /// `read_inode`. Dead cache entries are pruned on the way; a racing
    /// loader's inode wins over ours so each number has one live identity.
    pub fn get_inode(self: &Arc<Self>, ino: u64) -> FsResult<Arc<Inode>> {
        {
            let mut icache = self.icache.lock();
            match icache.get(&ino).map(Weak::upgrade) {
                Some(Some(inode)) => return Ok(inode),
                Some(None) => {
                    icache.remove(&ino);
                }
                None => {}
            }
        }
        let inode = self.ops.read_inode(self, ino)?;
        let mut icache = self.icache.lock();
        if let Some(existing) = icache.get(&ino).and_then(Weak::upgrade) {
            return Ok(existing);
        }
        trace!(ino, fs = self.fs_name, "inode loaded");
        icache.insert(ino, Arc::downgrade(&inode));
        Ok(inode)
    }

    /// Insert a freshly created inode into the weak cache.
    pub fn cache_inode(&self, inode: &Arc<Inode>) {
        self.icache
            .lock()
            .insert(inode.ino(), Arc::downgrade(inode));
    }

    /// Drop an inode number from the cache once its last holder is gone.
    /// Only dead entries are pruned: a concurrently reloaded inode under
    /// the same number stays cached.
    pub fn evict_inode(&self, ino: u64) {
        let mut icache = self.icache.lock();
        let dead = icache
            .get(&ino)
            .is_some_and(|weak| weak.upgrade().is_none());
        if dead {
            icache.remove(&ino);
        }
    }

    pub fn alloc_inode(self: &Arc<Self>, mode: FileMode) -> FsResult<Arc<Inode>> {
        if self.readonly() {
            return Err(FsError::new(FsErrorKind::ReadOnly, "superblock.alloc_inode"));
        }
        let inode = self.ops.alloc_inode(self, mode)?;
        self.cache_inode(&inode);
        Ok(inode)
    }

    pub fn write_inode(self: &Arc<Self>, inode: &Arc<Inode>) -> FsResult<()> {
        self.ops.write_inode(self, inode)
    }

    pub fn sync(self: &Arc<Self>) -> FsResult<()> {
        self.ops.sync(self)
    }

    pub fn statfs(self: &Arc<Self>) -> FsResult<StatFs> {
        self.ops.statfs(self)
    }

    pub fn remount(self: &Arc<Self>, flags: MountFlags) -> FsResult<()> {
        self.ops.remount(self, flags)?;
        self.set_flags(flags);
        Ok(())
    }
}

impl std::fmt::Debug for SuperBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SuperBlock")
            .field("fs", &self.fs_name)
            .field("device", &self.device.name())
            .finish()
    }
}
