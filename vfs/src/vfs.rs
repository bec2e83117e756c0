//! Filesystem-type registry, mount table, and path walk.

use crate::{Dentry, File, Filesystem, Inode, SuperBlock};
use pagefs_cache::{CacheConfig, PageCache};
use pagefs_core::attr::check_name;
use pagefs_core::{
    BlockDevice, FileAttr, FileMode, FileType, FsError, FsErrorKind, FsResult, MountFlags,
    OpenFlags, StatFs, MAX_SYMLINK_DEPTH,
};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, trace};

/// Binding of a superblock into the namespace.
pub struct VfsMount {
    sb: Arc<SuperBlock>,
    fs: Arc<dyn Filesystem>,
    /// `None` for the root mount.
    mountpoint: Option<Arc<Dentry>>,
    root: Arc<Dentry>,
    device_name: String,
    options: String,
    flags: MountFlags,
}

impl VfsMount {
    pub fn sb(&self) -> &Arc<SuperBlock> {
        &self.sb
    }

    pub fn mountpoint(&self) -> Option<&Arc<Dentry>> {
        self.mountpoint.as_ref()
    }

    pub fn root(&self) -> &Arc<Dentry> {
        &self.root
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    pub fn options(&self) -> &str {
        &self.options
    }

    pub fn flags(&self) -> MountFlags {
        self.flags
    }
}

/// The VFS service object: filesystem registry, mount table, process root,
/// and the shared page cache.
pub struct Vfs {
    filesystems: Mutex<HashMap<&'static str, Arc<dyn Filesystem>>>,
    mounts: Mutex<Vec<Arc<VfsMount>>>,
    root: RwLock<Option<Arc<Dentry>>>,
    cache: Arc<PageCache>,
}

impl Vfs {
    pub fn new() -> Self {
        Self::with_cache(Arc::new(PageCache::new(CacheConfig::default())))
    }

    pub fn with_cache(cache: Arc<PageCache>) -> Self {
        Self {
            filesystems: Mutex::new(HashMap::new()),
            mounts: Mutex::new(Vec::new()),
            root: RwLock::new(None),
            cache,
        }
    }

    pub fn cache(&self) -> &Arc<PageCache> {
        &self.cache
    }

    pub fn register_filesystem(&self, fs: Arc<dyn Filesystem>) -> FsResult<()> {
        let mut filesystems = self.filesystems.lock();
        let name = fs.name();
        if filesystems.contains_key(name) {
            return Err(FsError::new(FsErrorKind::AlreadyExists, "vfs.register"));
        }
        debug!(name, "filesystem registered");
        filesystems.insert(name, fs);
        Ok(())
    }

    pub fn unregister_filesystem(&self, name: &str) -> FsResult<()> {
        if self.filesystems.lock().remove(name).is_none() {
            return Err(FsError::new(FsErrorKind::NotFound, "vfs.unregister"));
        }
        Ok(())
    }

    pub fn get_filesystem(&self, name: &str) -> Option<Arc<dyn Filesystem>> {
        self.filesystems.lock().get(name).cloned()
    }

    /// Mount a device at `mountpoint`. The first mount must be at `/` and
    /// establishes the process root; later mounts attach to an existing
    /// directory dentry and are entered during path walks.
    pub fn mount(
        &self,
        device: Arc<dyn BlockDevice>,
        mountpoint: &str,
        fstype: &str,
        flags: MountFlags,
        options: &str,
    ) -> FsResult<()> {
        let fs = self
            .get_filesystem(fstype)
            .ok_or(FsError::new(FsErrorKind::NotFound, "vfs.mount.fstype"))?;

        // One live superblock per device.
        {
            let mounts = self.mounts.lock();
            if mounts.iter().any(|m| {
                let dev = m.sb.device();
                dev.major() == device.major() && dev.minor() == device.minor()
            }) {
                return Err(FsError::new(FsErrorKind::Busy, "vfs.mount.device"));
            }
        }

        let at_root = mountpoint == "/";
        let mountpoint_dentry = if at_root {
            if self.root.read().is_some() {
                return Err(FsError::new(FsErrorKind::Busy, "vfs.mount.root"));
            }
            None
        } else {
            let dentry = self.resolve(mountpoint)?;
            if !dentry.inode().is_dir() {
                return Err(FsError::new(FsErrorKind::NotDir, "vfs.mount.point"));
            }
            let mounts = self.mounts.lock();
            if mounts
                .iter()
                .any(|m| m.mountpoint.as_ref().is_some_and(|mp| Arc::ptr_eq(mp, &dentry)))
            {
                return Err(FsError::new(FsErrorKind::Busy, "vfs.mount.point"));
            }
            Some(dentry)
        };

        let device_name = device.name().to_string();
        let sb = fs.mount(device, flags, options, &self.cache)?;
        let sb_root = sb
            .root()
            .ok_or(FsError::new(FsErrorKind::Io, "vfs.mount.no_root"))?;

        debug!(fstype, mountpoint, device = %device_name, "mounted");
        if at_root {
            *self.root.write() = Some(sb_root.clone());
        }
        self.mounts.lock().push(Arc::new(VfsMount {
            sb,
            fs,
            mountpoint: mountpoint_dentry,
            root: sb_root,
            device_name,
            options: options.to_string(),
            flags,
        }));
        Ok(())
    }

    /// Detach the mount at `mountpoint` after flushing it. The root mount
    /// refuses to go while anything else is still mounted.
    pub fn unmount(&self, mountpoint: &str) -> FsResult<()> {
        let target = self.resolve(mountpoint)?;
        let mount = {
            let mounts = self.mounts.lock();
            mounts
                .iter()
                .find(|m| match &m.mountpoint {
                    Some(mp) => Arc::ptr_eq(&m.root, &target) || Arc::ptr_eq(mp, &target),
                    None => mountpoint == "/",
                })
                .cloned()
                .ok_or(FsError::new(FsErrorKind::NotFound, "vfs.unmount"))?
        };
        if mount.mountpoint.is_none() && self.mounts.lock().len() > 1 {
            return Err(FsError::new(FsErrorKind::Busy, "vfs.unmount.root"));
        }

        mount.sb.sync()?;
        self.cache.flush_all()?;
        mount.fs.unmount(&mount.sb)?;

        let mut mounts = self.mounts.lock();
        mounts.retain(|m| !Arc::ptr_eq(m, &mount));
        if mount.mountpoint.is_none() {
            *self.root.write() = None;
        }
        debug!(mountpoint, "unmounted");
        Ok(())
    }

    pub fn get_mounts(&self) -> Vec<Arc<VfsMount>> {
        self.mounts.lock().clone()
    }

    fn root_dentry(&self) -> FsResult<Arc<Dentry>> {
        self.root
            .read()
            .clone()
            .ok_or(FsError::new(FsErrorKind::NotFound, "vfs.root"))
    }

    /// Follow a mount point onto the mounted filesystem's root.
    fn enter_mount(&self, dentry: Arc<Dentry>) -> Arc<Dentry> {
        let mounts = self.mounts.lock();
        for mount in mounts.iter() {
            if let Some(mp) = &mount.mountpoint {
                if Arc::ptr_eq(mp, &dentry) {
                    return mount.root.clone();
                }
            }
        }
        dentry
    }

    /// Resolve a path, following symlinks everywhere including the final
    /// component.
    pub fn resolve(&self, path: &str) -> FsResult<Arc<Dentry>> {
        let mut depth = 0;
        self.walk_path(path, None, true, &mut depth)
    }

    /// Resolve a path without following a symlink in the final component.
    pub fn resolve_nofollow(&self, path: &str) -> FsResult<Arc<Dentry>> {
        let mut depth = 0;
        self.walk_path(path, None, false, &mut depth)
    }

    /// Alias for [`Vfs::resolve`], matching the exported surface.
    pub fn lookup(&self, path: &str) -> FsResult<Arc<Dentry>> {
        self.resolve(path)
    }

    fn walk_path(
        &self,
        path: &str,
        base: Option<Arc<Dentry>>,
        follow_last: bool,
        depth: &mut usize,
    ) -> FsResult<Arc<Dentry>> {
        let mut current = if path.starts_with('/') {
            self.root_dentry()?
        } else {
            match base {
                Some(base) => base,
                None => self.root_dentry()?,
            }
        };

        let components: Vec<&str> = path.split('/').filter(|c| !c.is_empty()).collect();
        for (index, component) in components.iter().enumerate() {
            let last = index == components.len() - 1;
            // Traversing through a component requires a directory, whatever
            // the component is.
            if !current.inode().is_dir() {
                return Err(FsError::new(FsErrorKind::NotDir, "vfs.walk"));
            }
            match *component {
                "." => {}
                ".." => {
                    // Never ascend above the process root (or a mounted
                    // root, whose dentry has no parent).
                    if let Some(parent) = current.parent() {
                        current = parent;
                    }
                }
                name => {
                    let child = self.walk_component(&current, name)?;
                    let mut child = self.enter_mount(child);
                    if child.inode().is_symlink() && (!last || follow_last) {
                        *depth += 1;
                        if *depth > MAX_SYMLINK_DEPTH {
                            return Err(FsError::new(
                                FsErrorKind::TooManySymlinks,
                                "vfs.walk",
                            ));
                        }
                        let target = child.inode().readlink()?;
                        child = self.walk_path(&target, Some(current.clone()), true, depth)?;
                    }
                    current = child;
                }
            }
        }
        Ok(current)
    }

    /// One component: dentry cache first, then the filesystem's lookup.
    fn walk_component(&self, dir: &Arc<Dentry>, name: &str) -> FsResult<Arc<Dentry>> {
        if let Some(child) = dir.lookup_child(name) {
            return Ok(child);
        }
        let inode = dir.inode().lookup(name)?;
        let child = Dentry::new(name, inode, Some(dir));
        trace!(name, parent = %dir.path(), "dentry populated");
        dir.add_child(child.clone());
        Ok(child)
    }

    /// Split a path into its parent directory dentry and final name.
    fn resolve_parent<'p>(&self, path: &'p str) -> FsResult<(Arc<Dentry>, &'p str)> {
        let trimmed = path.trim_end_matches('/');
        if trimmed.is_empty() {
            return Err(FsError::new(FsErrorKind::InvalidInput, "vfs.parent"));
        }
        let (dir_path, name) = match trimmed.rfind('/') {
            Some(0) => ("/", &trimmed[1..]),
            Some(idx) => (&trimmed[..idx], &trimmed[idx + 1..]),
            None => ("/", trimmed),
        };
        check_name(name)?;
        let parent = self.resolve(dir_path)?;
        if !parent.inode().is_dir() {
            return Err(FsError::new(FsErrorKind::NotDir, "vfs.parent"));
        }
        Ok((parent, name))
    }

    /// Open (and possibly create) a file.
    pub fn open(&self, path: &str, flags: OpenFlags, mode: FileMode) -> FsResult<Arc<File>> {
        match self.resolve(path) {
            Ok(dentry) => {
                if flags.contains(OpenFlags::CREAT | OpenFlags::EXCL) {
                    return Err(FsError::new(FsErrorKind::AlreadyExists, "vfs.open"));
                }
                if dentry.inode().is_dir() && flags.writable() {
                    return Err(FsError::new(FsErrorKind::IsDir, "vfs.open"));
                }
                if flags.contains(OpenFlags::TRUNC) && flags.writable() {
                    dentry.inode().truncate(0)?;
                }
                Ok(File::new(dentry, flags))
            }
            Err(err) if err.kind() == FsErrorKind::NotFound && flags.contains(OpenFlags::CREAT) => {
                let (parent, name) = self.resolve_parent(path)?;
                let mode = match mode.file_type() {
                    Some(_) => mode,
                    None => FileMode::new(FileType::Regular, mode.perm()),
                };
                let inode = parent.inode().create(name, mode)?;
                let dentry = Dentry::new(name, inode, Some(&parent));
                parent.add_child(dentry.clone());
                trace!(path, "file created");
                Ok(File::new(dentry, flags))
            }
            Err(err) => Err(err),
        }
    }

    /// Drop an open-file handle. The last `Arc` clone going away releases
    /// the dentry reference; nothing else to do here.
    pub fn close(&self, _file: Arc<File>) -> FsResult<()> {
        Ok(())
    }

    pub fn mkdir(&self, path: &str, mode: FileMode) -> FsResult<Arc<Inode>> {
        let (parent, name) = self.resolve_parent(path)?;
        if parent.lookup_child(name).is_some() {
            return Err(FsError::new(FsErrorKind::AlreadyExists, "vfs.mkdir"));
        }
        let mode = FileMode::new(FileType::Directory, mode.perm());
        let inode = parent.inode().mkdir(name, mode)?;
        let dentry = Dentry::new(name, inode.clone(), Some(&parent));
        parent.add_child(dentry);
        Ok(inode)
    }

    pub fn rmdir(&self, path: &str) -> FsResult<()> {
        let (parent, name) = self.resolve_parent(path)?;
        parent.inode().rmdir(name)?;
        parent.remove_child(name);
        Ok(())
    }

    pub fn unlink(&self, path: &str) -> FsResult<()> {
        let (parent, name) = self.resolve_parent(path)?;
        parent.inode().unlink(name)?;
        parent.remove_child(name);
        Ok(())
    }

    pub fn rename(&self, old_path: &str, new_path: &str) -> FsResult<()> {
        let (old_parent, old_name) = self.resolve_parent(old_path)?;
        let (new_parent, new_name) = self.resolve_parent(new_path)?;

        let old_sb = old_parent.inode().sb()?;
        let new_sb = new_parent.inode().sb()?;
        if !Arc::ptr_eq(&old_sb, &new_sb) {
            return Err(FsError::new(FsErrorKind::CrossDevice, "vfs.rename"));
        }

        old_parent
            .inode()
            .rename(old_name, new_parent.inode(), new_name)?;
        old_parent.remove_child(old_name);
        new_parent.remove_child(new_name);
        Ok(())
    }

    pub fn symlink(&self, target: &str, linkpath: &str) -> FsResult<()> {
        let (parent, name) = self.resolve_parent(linkpath)?;
        if parent.lookup_child(name).is_some() {
            return Err(FsError::new(FsErrorKind::AlreadyExists, "vfs.symlink"));
        }
        let inode = parent.inode().symlink(name, target)?;
        let dentry = Dentry::new(name, inode, Some(&parent));
        parent.add_child(dentry);
        Ok(())
    }

    pub fn readlink(&self, path: &str) -> FsResult<String> {
        let dentry = self.resolve_nofollow(path)?;
        dentry.inode().readlink()
    }

    pub fn stat(&self, path: &str) -> FsResult<FileAttr> {
        Ok(self.resolve(path)?.inode().getattr())
    }

    pub fn lstat(&self, path: &str) -> FsResult<FileAttr> {
        Ok(self.resolve_nofollow(path)?.inode().getattr())
    }

    pub fn chmod(&self, path: &str, perm: u16) -> FsResult<()> {
        let dentry = self.resolve(path)?;
        let inode = dentry.inode();
        let mut attr = inode.getattr();
        attr.mode = attr.mode.with_perm(perm);
        inode.setattr(attr)
    }

    pub fn chown(&self, path: &str, uid: u32, gid: u32) -> FsResult<()> {
        let dentry = self.resolve(path)?;
        let inode = dentry.inode();
        let mut attr = inode.getattr();
        attr.uid = uid;
        attr.gid = gid;
        inode.setattr(attr)
    }

    pub fn statfs(&self, path: &str) -> FsResult<StatFs> {
        let dentry = self.resolve(path)?;
        dentry.inode().sb()?.statfs()
    }

    /// Flush every mounted filesystem, then every dirty page. All mounts
    /// are attempted; the first error is reported afterwards.
    pub fn sync(&self) -> FsResult<()> {
        let mounts = self.get_mounts();
        let mut first_err = None;
        for mount in mounts {
            if let Err(err) = mount.sb.sync() {
                first_err.get_or_insert(err);
            }
        }
        if let Err(err) = self.cache.flush_all() {
            first_err.get_or_insert(err);
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl Default for Vfs {
    fn default() -> Self {
        Self::new()
    }
}
