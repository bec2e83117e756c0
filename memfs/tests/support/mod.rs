//! Shared fixtures for the integration tests.
#![allow(dead_code)]

use pagefs_block::{MemBlockDevice, MemDeviceConfig};
use pagefs_cache::{CacheConfig, PageCache};
use pagefs_core::{Bio, BlockDevice, FsResult, MountFlags};
use pagefs_memfs::{MemFs, MemFsConfig};
use pagefs_vfs::Vfs;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Delegating block device that counts synchronous reads and writes.
pub struct CountingDevice {
    inner: Arc<dyn BlockDevice>,
    reads: AtomicU64,
    writes: AtomicU64,
}

impl CountingDevice {
    pub fn new(inner: Arc<dyn BlockDevice>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        })
    }

    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }
}

impl BlockDevice for CountingDevice {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn size(&self) -> u64 {
        self.inner.size()
    }

    fn sector_size(&self) -> u32 {
        self.inner.sector_size()
    }

    fn block_size(&self) -> u32 {
        self.inner.block_size()
    }

    fn readonly(&self) -> bool {
        self.inner.readonly()
    }

    fn major(&self) -> u32 {
        self.inner.major()
    }

    fn minor(&self) -> u32 {
        self.inner.minor()
    }

    fn read_at(&self, sector: u64, buf: &mut [u8]) -> FsResult<usize> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.inner.read_at(sector, buf)
    }

    fn write_at(&self, sector: u64, buf: &[u8]) -> FsResult<usize> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.write_at(sector, buf)
    }

    fn flush(&self) -> FsResult<()> {
        self.inner.flush()
    }

    fn trim(&self, sector: u64, len: usize) -> FsResult<()> {
        self.inner.trim(sector, len)
    }

    fn submit(&self, bio: Bio) {
        self.inner.submit(bio)
    }
}

pub fn mem_device(size: u64) -> Arc<dyn BlockDevice> {
    Arc::new(MemBlockDevice::new(MemDeviceConfig {
        size,
        ..MemDeviceConfig::default()
    }))
}

/// A 4 MiB memfs volume mounted at `/`.
pub fn mount_default() -> Vfs {
    let vfs = Vfs::new();
    vfs.register_filesystem(Arc::new(MemFs::default()))
        .expect("register memfs");
    vfs.mount(
        mem_device(4 * 1024 * 1024),
        "/",
        "memfs",
        MountFlags::empty(),
        "",
    )
    .expect("mount memfs at /");
    vfs
}

/// Same, but with a counting device and an explicit cache capacity.
pub fn mount_counted(max_pages: usize) -> (Vfs, Arc<CountingDevice>) {
    let device = CountingDevice::new(mem_device(4 * 1024 * 1024));
    let cache = Arc::new(PageCache::new(CacheConfig { max_pages }));
    let vfs = Vfs::with_cache(cache);
    vfs.register_filesystem(MemFs::new(MemFsConfig::default()))
        .expect("register memfs");
    vfs.mount(device.clone(), "/", "memfs", MountFlags::empty(), "")
        .expect("mount memfs at /");
    (vfs, device)
}
