//! An in-memory filesystem over a block device.
//!
//! Directory tables, attributes, xattrs, and symlink targets live in one
//! mutex-guarded state map keyed by inode number. Regular-file content is
//! not stored here at all: it flows through the page cache onto the
//! superblock's block device, so the cache and device layers do real work
//! under this filesystem.
//!
//! [`MemFs`] is the registrable filesystem type; each mount gets its own
//! [`MemFsVolume`], which implements both the superblock and the inode
//! operation tables on one value.

mod config;

pub use config::MemFsConfig;

use pagefs_cache::PageCache;
use pagefs_core::attr::check_name;
use pagefs_core::{
    BlockDevice, DirEntry, FileAttr, FileMode, FileType, FsError, FsErrorKind, FsResult,
    MountFlags, StatFs, MAX_NAME_LEN, PAGE_SIZE,
};
use pagefs_vfs::{Dentry, Filesystem, Inode, InodeOps, SuperBlock, SuperBlockOps};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};
use tracing::{debug, trace};

const ROOT_INO: u64 = 1;

/// The registrable "memfs" filesystem type.
pub struct MemFs {
    config: MemFsConfig,
}

impl MemFs {
    pub fn new(config: MemFsConfig) -> Arc<Self> {
        Arc::new(Self { config })
    }
}

impl Default for MemFs {
    fn default() -> Self {
        Self {
            config: MemFsConfig::default(),
        }
    }
}

impl Filesystem for MemFs {
    fn name(&self) -> &'static str {
        "memfs"
    }

    fn mount(
        &self,
        device: Arc<dyn BlockDevice>,
        flags: MountFlags,
        _options: &str,
        cache: &Arc<PageCache>,
    ) -> FsResult<Arc<SuperBlock>> {
        if device.size() == 0
            || device.sector_size() == 0
            || PAGE_SIZE as u32 % device.sector_size() != 0
        {
            return Err(FsError::new(FsErrorKind::InvalidInput, "memfs.mount"));
        }
        let volume = MemFsVolume::new(&self.config);
        let ops: Arc<dyn SuperBlockOps> = volume.clone();
        let sb = SuperBlock::new(device, "memfs", flags, cache.clone(), ops);
        let root = sb.get_inode(ROOT_INO)?;
        sb.set_root(Dentry::new_root(root));
        debug!(device = sb.device().name(), "memfs mounted");
        Ok(sb)
    }

    fn unmount(&self, sb: &Arc<SuperBlock>) -> FsResult<()> {
        sb.device().flush()?;
        debug!(device = sb.device().name(), "memfs unmounted");
        Ok(())
    }

    fn statfs(&self, sb: &Arc<SuperBlock>) -> FsResult<StatFs> {
        sb.statfs()
    }
}

struct MemFsState {
    next_ino: u64,
    attrs: HashMap<u64, FileAttr>,
    /// Directory tables: inode number -> (name -> child inode number).
    dirs: HashMap<u64, BTreeMap<String, u64>>,
    symlinks: HashMap<u64, String>,
    xattrs: HashMap<u64, BTreeMap<String, String>>,
}

impl MemFsState {
    fn entries(&self, dir: u64, context: &'static str) -> FsResult<&BTreeMap<String, u64>> {
        self.dirs
            .get(&dir)
            .ok_or(FsError::new(FsErrorKind::NotDir, context))
    }

    fn entries_mut(
        &mut self,
        dir: u64,
        context: &'static str,
    ) -> FsResult<&mut BTreeMap<String, u64>> {
        self.dirs
            .get_mut(&dir)
            .ok_or(FsError::new(FsErrorKind::NotDir, context))
    }

    fn alloc_ino(&mut self) -> u64 {
        let ino = self.next_ino;
        self.next_ino += 1;
        ino
    }

    fn is_dir(&self, ino: u64) -> bool {
        self.dirs.contains_key(&ino)
    }

    fn drop_object(&mut self, ino: u64) {
        self.attrs.remove(&ino);
        self.dirs.remove(&ino);
        self.symlinks.remove(&ino);
        self.xattrs.remove(&ino);
    }
}

/// One mounted memfs volume. Implements both per-instance capability sets
/// ([`SuperBlockOps`] and [`InodeOps`]) on a single value.
pub struct MemFsVolume {
    self_ref: Weak<MemFsVolume>,
    state: Mutex<MemFsState>,
}

impl MemFsVolume {
    fn new(config: &MemFsConfig) -> Arc<Self> {
        let mut attrs = HashMap::new();
        attrs.insert(
            ROOT_INO,
            FileAttr::new(FileMode::directory(config.root_perm)),
        );
        let mut dirs = HashMap::new();
        dirs.insert(ROOT_INO, BTreeMap::new());
        Arc::new_cyclic(|weak| Self {
            self_ref: weak.clone(),
            state: Mutex::new(MemFsState {
                next_ino: ROOT_INO + 1,
                attrs,
                dirs,
                symlinks: HashMap::new(),
                xattrs: HashMap::new(),
            }),
        })
    }

    fn ops(&self) -> FsResult<Arc<dyn InodeOps>> {
        let arc = self
            .self_ref
            .upgrade()
            .ok_or(FsError::new(FsErrorKind::Io, "memfs.volume"))?;
        Ok(arc)
    }

    fn require_writable(dir: &Arc<Inode>, context: &'static str) -> FsResult<()> {
        if dir.sb()?.readonly() {
            return Err(FsError::new(FsErrorKind::ReadOnly, context));
        }
        Ok(())
    }

    /// Allocate an inode number with fresh attributes inside the state lock.
    fn new_object(&self, state: &mut MemFsState, mode: FileMode) -> u64 {
        let ino = state.alloc_ino();
        state.attrs.insert(ino, FileAttr::new(mode));
        if mode.file_type() == Some(FileType::Directory) {
            state.dirs.insert(ino, BTreeMap::new());
        }
        ino
    }
}

impl SuperBlockOps for MemFsVolume {
    fn alloc_inode(&self, sb: &Arc<SuperBlock>, mode: FileMode) -> FsResult<Arc<Inode>> {
        let ino = {
            let mut state = self.state.lock();
            self.new_object(&mut state, mode)
        };
        trace!(ino, "inode allocated");
        sb.get_inode(ino)
    }

    fn free_inode(&self, _sb: &Arc<SuperBlock>, inode: &Arc<Inode>) -> FsResult<()> {
        self.state.lock().drop_object(inode.ino());
        Ok(())
    }

    fn read_inode(&self, sb: &Arc<SuperBlock>, ino: u64) -> FsResult<Arc<Inode>> {
        let attr = self
            .state
            .lock()
            .attrs
            .get(&ino)
            .cloned()
            .ok_or(FsError::new(FsErrorKind::NotFound, "memfs.read_inode"))?;
        Ok(Inode::new(ino, sb, self.ops()?, attr))
    }

    fn write_inode(&self, _sb: &Arc<SuperBlock>, inode: &Arc<Inode>) -> FsResult<()> {
        let mut state = self.state.lock();
        if !state.attrs.contains_key(&inode.ino()) {
            return Err(FsError::new(FsErrorKind::NotFound, "memfs.write_inode"));
        }
        state.attrs.insert(inode.ino(), inode.getattr());
        Ok(())
    }

    fn sync(&self, sb: &Arc<SuperBlock>) -> FsResult<()> {
        sb.device().flush()
    }

    fn statfs(&self, sb: &Arc<SuperBlock>) -> FsResult<StatFs> {
        let state = self.state.lock();
        let device = sb.device();
        let block_size = device.block_size().max(1);
        Ok(StatFs {
            block_size,
            blocks: device.size() / block_size as u64,
            blocks_free: 0,
            files: state.attrs.len() as u64,
            files_free: 0,
            name_max: MAX_NAME_LEN as u32,
        })
    }

    fn remount(&self, _sb: &Arc<SuperBlock>, _flags: MountFlags) -> FsResult<()> {
        Ok(())
    }
}

impl InodeOps for MemFsVolume {
    fn readdir(&self, dir: &Arc<Inode>) -> FsResult<Vec<DirEntry>> {
        let state = self.state.lock();
        let entries = state.entries(dir.ino(), "memfs.readdir")?;
        Ok(entries
            .iter()
            .map(|(name, &ino)| DirEntry {
                ino,
                name: name.clone(),
                file_type: state
                    .attrs
                    .get(&ino)
                    .and_then(|attr| attr.file_type())
                    .unwrap_or(FileType::Regular),
            })
            .collect())
    }

    fn lookup(&self, dir: &Arc<Inode>, name: &str) -> FsResult<Arc<Inode>> {
        let ino = {
            let state = self.state.lock();
            state
                .entries(dir.ino(), "memfs.lookup")?
                .get(name)
                .copied()
                .ok_or(FsError::new(FsErrorKind::NotFound, "memfs.lookup"))?
        };
        dir.sb()?.get_inode(ino)
    }

    fn create(&self, dir: &Arc<Inode>, name: &str, mode: FileMode) -> FsResult<Arc<Inode>> {
        check_name(name)?;
        Self::require_writable(dir, "memfs.create")?;
        let ino = {
            let mut state = self.state.lock();
            if state.entries(dir.ino(), "memfs.create")?.contains_key(name) {
                return Err(FsError::new(FsErrorKind::AlreadyExists, "memfs.create"));
            }
            let ino = self.new_object(&mut state, mode);
            state
                .entries_mut(dir.ino(), "memfs.create")?
                .insert(name.to_string(), ino);
            ino
        };
        trace!(ino, name, "created");
        dir.sb()?.get_inode(ino)
    }

    fn unlink(&self, dir: &Arc<Inode>, name: &str) -> FsResult<()> {
        Self::require_writable(dir, "memfs.unlink")?;
        let mut state = self.state.lock();
        let ino = state
            .entries(dir.ino(), "memfs.unlink")?
            .get(name)
            .copied()
            .ok_or(FsError::new(FsErrorKind::NotFound, "memfs.unlink"))?;
        if state.is_dir(ino) {
            return Err(FsError::new(FsErrorKind::IsDir, "memfs.unlink"));
        }
        state
            .entries_mut(dir.ino(), "memfs.unlink")?
            .remove(name);
        state.drop_object(ino);
        Ok(())
    }

    fn mkdir(&self, dir: &Arc<Inode>, name: &str, mode: FileMode) -> FsResult<Arc<Inode>> {
        check_name(name)?;
        Self::require_writable(dir, "memfs.mkdir")?;
        let mode = FileMode::new(FileType::Directory, mode.perm());
        let ino = {
            let mut state = self.state.lock();
            if state.entries(dir.ino(), "memfs.mkdir")?.contains_key(name) {
                return Err(FsError::new(FsErrorKind::AlreadyExists, "memfs.mkdir"));
            }
            let ino = self.new_object(&mut state, mode);
            state
                .entries_mut(dir.ino(), "memfs.mkdir")?
                .insert(name.to_string(), ino);
            ino
        };
        dir.sb()?.get_inode(ino)
    }

    fn rmdir(&self, dir: &Arc<Inode>, name: &str) -> FsResult<()> {
        Self::require_writable(dir, "memfs.rmdir")?;
        let mut state = self.state.lock();
        let ino = state
            .entries(dir.ino(), "memfs.rmdir")?
            .get(name)
            .copied()
            .ok_or(FsError::new(FsErrorKind::NotFound, "memfs.rmdir"))?;
        if !state.is_dir(ino) {
            return Err(FsError::new(FsErrorKind::NotDir, "memfs.rmdir"));
        }
        if !state.dirs.get(&ino).is_some_and(BTreeMap::is_empty) {
            return Err(FsError::new(FsErrorKind::DirNotEmpty, "memfs.rmdir"));
        }
        state
            .entries_mut(dir.ino(), "memfs.rmdir")?
            .remove(name);
        state.drop_object(ino);
        Ok(())
    }

    fn rename(
        &self,
        old_dir: &Arc<Inode>,
        old_name: &str,
        new_dir: &Arc<Inode>,
        new_name: &str,
    ) -> FsResult<()> {
        check_name(new_name)?;
        Self::require_writable(old_dir, "memfs.rename")?;
        let mut state = self.state.lock();
        let ino = state
            .entries(old_dir.ino(), "memfs.rename")?
            .get(old_name)
            .copied()
            .ok_or(FsError::new(FsErrorKind::NotFound, "memfs.rename"))?;

        let existing_dest = state
            .entries(new_dir.ino(), "memfs.rename")?
            .get(new_name)
            .copied();
        if let Some(dest) = existing_dest {
            let src_is_dir = state.is_dir(ino);
            let dest_is_dir = state.is_dir(dest);
            if dest_is_dir && !src_is_dir {
                return Err(FsError::new(FsErrorKind::IsDir, "memfs.rename"));
            }
            if !dest_is_dir && src_is_dir {
                return Err(FsError::new(FsErrorKind::NotDir, "memfs.rename"));
            }
            if dest_is_dir && !state.dirs.get(&dest).is_some_and(BTreeMap::is_empty) {
                return Err(FsError::new(FsErrorKind::DirNotEmpty, "memfs.rename"));
            }
            state.drop_object(dest);
            state
                .entries_mut(new_dir.ino(), "memfs.rename")?
                .remove(new_name);
        }

        state
            .entries_mut(old_dir.ino(), "memfs.rename")?
            .remove(old_name);
        state
            .entries_mut(new_dir.ino(), "memfs.rename")?
            .insert(new_name.to_string(), ino);
        Ok(())
    }

    fn symlink(&self, dir: &Arc<Inode>, name: &str, target: &str) -> FsResult<Arc<Inode>> {
        check_name(name)?;
        Self::require_writable(dir, "memfs.symlink")?;
        let ino = {
            let mut state = self.state.lock();
            if state
                .entries(dir.ino(), "memfs.symlink")?
                .contains_key(name)
            {
                return Err(FsError::new(FsErrorKind::AlreadyExists, "memfs.symlink"));
            }
            let ino = self.new_object(&mut state, FileMode::symlink());
            if let Some(attr) = state.attrs.get_mut(&ino) {
                attr.size = target.len() as u64;
            }
            state.symlinks.insert(ino, target.to_string());
            state
                .entries_mut(dir.ino(), "memfs.symlink")?
                .insert(name.to_string(), ino);
            ino
        };
        dir.sb()?.get_inode(ino)
    }

    fn readlink(&self, inode: &Arc<Inode>) -> FsResult<String> {
        self.state
            .lock()
            .symlinks
            .get(&inode.ino())
            .cloned()
            .ok_or(FsError::new(FsErrorKind::InvalidInput, "memfs.readlink"))
    }

    fn setattr(&self, inode: &Arc<Inode>, attr: &FileAttr) -> FsResult<()> {
        let mut state = self.state.lock();
        if !state.attrs.contains_key(&inode.ino()) {
            return Err(FsError::new(FsErrorKind::NotFound, "memfs.setattr"));
        }
        state.attrs.insert(inode.ino(), attr.clone());
        Ok(())
    }

    fn getxattr(&self, inode: &Arc<Inode>, name: &str) -> FsResult<String> {
        self.state
            .lock()
            .xattrs
            .get(&inode.ino())
            .and_then(|map| map.get(name))
            .cloned()
            .ok_or(FsError::new(FsErrorKind::NotFound, "memfs.getxattr"))
    }

    fn setxattr(&self, inode: &Arc<Inode>, name: &str, value: &str) -> FsResult<()> {
        self.state
            .lock()
            .xattrs
            .entry(inode.ino())
            .or_default()
            .insert(name.to_string(), value.to_string());
        Ok(())
    }

    fn listxattr(&self, inode: &Arc<Inode>) -> FsResult<Vec<String>> {
        Ok(self
            .state
            .lock()
            .xattrs
            .get(&inode.ino())
            .map(|map| map.keys().cloned().collect())
            .unwrap_or_default())
    }

    fn removexattr(&self, inode: &Arc<Inode>, name: &str) -> FsResult<()> {
        let removed = self
            .state
            .lock()
            .xattrs
            .get_mut(&inode.ino())
            .and_then(|map| map.remove(name));
        if removed.is_none() {
            return Err(FsError::new(FsErrorKind::NotFound, "memfs.removexattr"));
        }
        Ok(())
    }
}
