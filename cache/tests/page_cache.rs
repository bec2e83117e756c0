//! Behavioral tests for the page cache against a real in-memory device.

use pagefs_block::{MemBlockDevice, MemDeviceConfig};
use pagefs_cache::{CacheConfig, PageCache, PageOwner, PageState};
use pagefs_core::{Bio, BlockDevice, FsErrorKind, FsResult, PAGE_SIZE};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Test-only page owner bound to one device.
struct Owner {
    device: Arc<dyn BlockDevice>,
}

impl Owner {
    fn new(device: Arc<dyn BlockDevice>) -> Arc<dyn PageOwner> {
        Arc::new(Owner { device })
    }
}

impl PageOwner for Owner {
    fn device(&self) -> FsResult<Arc<dyn BlockDevice>> {
        Ok(self.device.clone())
    }
}

/// Delegating device that counts reads and writes.
struct CountingDevice {
    inner: Arc<dyn BlockDevice>,
    reads: AtomicU64,
    writes: AtomicU64,
}

impl CountingDevice {
    fn new(inner: Arc<dyn BlockDevice>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        })
    }

    fn reads(&self) -> u64 {
        self.reads.load(Ordering::SeqCst)
    }

    fn writes(&self) -> u64 {
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

fn mem_device(size: u64) -> Arc<dyn BlockDevice> {
    Arc::new(MemBlockDevice::new(MemDeviceConfig {
        size,
        ..MemDeviceConfig::default()
    }))
}

fn counted_setup(size: u64) -> (Arc<CountingDevice>, Arc<dyn PageOwner>) {
    let counting = CountingDevice::new(mem_device(size));
    let owner = Owner::new(counting.clone());
    (counting, owner)
}

#[test]
fn at_most_one_page_per_key() {
    let (_, owner) = counted_setup(1 << 20);
    let cache = PageCache::new(CacheConfig::default());

    let a = cache.find_or_create_page(&owner, 0);
    let b = cache.find_or_create_page(&owner, 0);
    assert!(Arc::ptr_eq(&a, &b), "same key must yield the same page");
    assert_eq!(cache.page_count(), 1);
    assert_eq!(cache.misses(), 1);
    assert_eq!(cache.hits(), 1);

    cache.unpin(&a);
    cache.unpin(&b);
}

#[test]
fn distinct_owners_do_not_share_pages() {
    let (_, owner_a) = counted_setup(1 << 20);
    let (_, owner_b) = counted_setup(1 << 20);
    let cache = PageCache::new(CacheConfig::default());

    let a = cache.find_or_create_page(&owner_a, 0);
    let b = cache.find_or_create_page(&owner_b, 0);
    assert!(!Arc::ptr_eq(&a, &b));
    assert_eq!(cache.page_count(), 2);

    cache.unpin(&a);
    cache.unpin(&b);
}

#[test]
fn read_page_populates_from_device() {
    let (device, owner) = counted_setup(1 << 20);
    device.inner.write_at(0, &[0xAB; PAGE_SIZE]).expect("seed device");
    let cache = PageCache::new(CacheConfig::default());

    let page = cache.read_page(&owner, 0).expect("read_page");
    assert_eq!(page.state(), PageState::Uptodate);
    page.with_data(|d| assert!(d.iter().all(|&b| b == 0xAB)));
    assert_eq!(device.reads(), 1);

    // Second read is served from cache.
    let again = cache.read_page(&owner, 0).expect("cached read");
    assert_eq!(device.reads(), 1);
    cache.unpin(&again);
    cache.unpin(&page);
}

#[test]
fn write_page_is_deferred_until_sync() {
    let (device, owner) = counted_setup(1 << 20);
    let cache = PageCache::new(CacheConfig::default());

    let page = cache.find_or_create_page(&owner, 0);
    page.with_data_mut(|d| d.fill(0x5C));
    cache.write_page(&page);
    assert!(page.is_dirty());
    assert_eq!(device.writes(), 0, "write_page does no synchronous I/O");

    cache.sync_pages(Some(&owner)).expect("sync");
    assert_eq!(device.writes(), 1);
    assert_eq!(cache.writebacks(), 1);
    assert_eq!(page.state(), PageState::Uptodate);

    let mut buf = [0u8; PAGE_SIZE];
    device.inner.read_at(0, &mut buf).expect("device read");
    assert!(buf.iter().all(|&b| b == 0x5C));
    cache.unpin(&page);
}

#[test]
fn sync_is_idempotent() {
    let (device, owner) = counted_setup(1 << 20);
    let cache = PageCache::new(CacheConfig::default());

    let page = cache.find_or_create_page(&owner, 0);
    page.with_data_mut(|d| d.fill(1));
    cache.write_page(&page);
    cache.unpin(&page);

    cache.sync_pages(None).expect("first sync");
    let writes = device.writes();
    let writebacks = cache.writebacks();

    cache.sync_pages(None).expect("second sync");
    assert_eq!(device.writes(), writes, "no new device writes");
    assert_eq!(cache.writebacks(), writebacks, "no new writebacks");
}

#[test]
fn lru_evicts_least_recent_first() {
    // Capacity 2, three reads in order: the first page read must go first.
    let (device, owner) = counted_setup(1 << 20);
    let cache = PageCache::new(CacheConfig { max_pages: 2 });

    for offset in [0, PAGE_SIZE as u64, 2 * PAGE_SIZE as u64] {
        let page = cache.read_page(&owner, offset).expect("read");
        cache.unpin(&page);
    }
    assert_eq!(cache.page_count(), 2);
    assert_eq!(cache.evictions(), 1);

    let misses_before = cache.misses();
    let reads_before = device.reads();
    let page = cache.read_page(&owner, 0).expect("re-read evicted page");
    assert_eq!(cache.misses(), misses_before + 1, "page 0 was evicted");
    assert_eq!(device.reads(), reads_before + 1);
    cache.unpin(&page);
}

#[test]
fn pinned_pages_are_never_evicted() {
    let (_, owner) = counted_setup(1 << 20);
    let cache = PageCache::new(CacheConfig { max_pages: 2 });

    let pinned = cache.read_page(&owner, 0).expect("read");
    for offset in [PAGE_SIZE as u64, 2 * PAGE_SIZE as u64, 3 * PAGE_SIZE as u64] {
        let page = cache.read_page(&owner, offset).expect("read");
        cache.unpin(&page);
    }

    // The pinned page must still be indexed: finding it is a hit.
    let hits_before = cache.hits();
    let found = cache.find_page(&owner, 0).expect("pinned page still cached");
    assert!(Arc::ptr_eq(&found, &pinned));
    assert_eq!(cache.hits(), hits_before + 1);
    cache.unpin(&found);
    cache.unpin(&pinned);
}

#[test]
fn dirty_eviction_writes_back_exactly_once() {
    let (device, owner) = counted_setup(1 << 20);
    let cache = PageCache::new(CacheConfig { max_pages: 1 });

    let page = cache.find_or_create_page(&owner, 0);
    page.with_data_mut(|d| d.fill(0xEE));
    cache.write_page(&page);
    cache.unpin(&page);

    // Allocating a second page forces the dirty page out.
    let other = cache.find_or_create_page(&owner, PAGE_SIZE as u64);
    assert_eq!(device.writes(), 1, "one writeback before removal");
    assert_eq!(cache.evictions(), 1);
    assert_eq!(cache.page_count(), 1);

    let mut buf = [0u8; PAGE_SIZE];
    device.inner.read_at(0, &mut buf).expect("device read");
    assert!(buf.iter().all(|&b| b == 0xEE), "evicted data landed on disk");
    cache.unpin(&other);
}

#[test]
fn concurrent_misses_collapse_to_one_read() {
    // Four threads, one missing key, exactly one device read.
    let (device, owner) = counted_setup(1 << 20);
    device.inner.write_at(0, &[0x42; PAGE_SIZE]).expect("seed");
    let cache = Arc::new(PageCache::new(CacheConfig::default()));

    std::thread::scope(|scope| {
        for _ in 0..4 {
            let cache = cache.clone();
            let owner = owner.clone();
            scope.spawn(move || {
                let page = cache.read_page(&owner, 0).expect("concurrent read");
                page.with_data(|d| assert!(d.iter().all(|&b| b == 0x42)));
                cache.unpin(&page);
            });
        }
    });

    assert_eq!(device.reads(), 1, "exactly one device read issued");
    assert_eq!(cache.misses(), 1);
    assert_eq!(cache.hits(), 3);
}

#[test]
fn failed_reads_are_not_cached() {
    // Offset far past the device end: the device read fails.
    let (_, owner) = counted_setup(PAGE_SIZE as u64);
    let cache = PageCache::new(CacheConfig::default());

    let far = 1024 * PAGE_SIZE as u64;
    let err = cache.read_page(&owner, far).expect_err("read past device");
    assert_eq!(err.kind(), FsErrorKind::InvalidInput);
    assert_eq!(cache.page_count(), 0, "failed miss left nothing behind");
}

#[test]
fn invalidate_drops_pages_after_writeback() {
    let (device, owner) = counted_setup(1 << 20);
    let cache = PageCache::new(CacheConfig::default());

    let page = cache.find_or_create_page(&owner, 0);
    page.with_data_mut(|d| d.fill(7));
    cache.write_page(&page);
    cache.unpin(&page);

    cache.invalidate_pages(&owner);
    assert_eq!(cache.page_count(), 0);
    assert_eq!(device.writes(), 1, "dirty page flushed before the drop");
}

#[test]
fn truncate_keeps_partial_boundary_page() {
    let (_, owner) = counted_setup(1 << 20);
    let cache = PageCache::new(CacheConfig::default());

    for offset in [0, PAGE_SIZE as u64, 2 * PAGE_SIZE as u64] {
        let page = cache.find_or_create_page(&owner, offset);
        cache.unpin(&page);
    }
    // Cut inside the second page: page 2 goes, pages 0 and 1 stay.
    cache.truncate_pages(&owner, PAGE_SIZE as u64 + 100);
    assert_eq!(cache.page_count(), 2);

    let hits = cache.hits();
    assert!(cache.find_page(&owner, 2 * PAGE_SIZE as u64).is_none());
    let kept = cache
        .find_page(&owner, PAGE_SIZE as u64)
        .expect("boundary page kept");
    assert_eq!(cache.hits(), hits + 1);
    cache.unpin(&kept);
}

#[test]
fn shrinking_ceiling_evicts_down() {
    let (_, owner) = counted_setup(1 << 20);
    let cache = PageCache::new(CacheConfig { max_pages: 8 });

    for i in 0..8u64 {
        let page = cache.find_or_create_page(&owner, i * PAGE_SIZE as u64);
        cache.unpin(&page);
    }
    assert_eq!(cache.page_count(), 8);

    cache.set_max_pages(3);
    assert_eq!(cache.page_count(), 3);
    assert_eq!(cache.max_pages(), 3);
}

#[test]
fn hit_rate_converges_when_working_set_fits() {
    let (_, owner) = counted_setup(1 << 20);
    let cache = PageCache::new(CacheConfig { max_pages: 4 });

    for _round in 0..100 {
        for i in 0..4u64 {
            let page = cache.read_page(&owner, i * PAGE_SIZE as u64).expect("read");
            cache.unpin(&page);
        }
    }
    assert!(
        cache.hit_rate() > 0.98,
        "hit rate {} should approach 1.0",
        cache.hit_rate()
    );
}

#[test]
fn clear_dirty_discards_without_writeback() {
    let (device, owner) = counted_setup(1 << 20);
    let cache = PageCache::new(CacheConfig::default());

    let page = cache.find_or_create_page(&owner, 0);
    page.with_data_mut(|d| d.fill(2));
    cache.write_page(&page);
    assert!(page.is_dirty());

    cache.clear_dirty(&page);
    assert_eq!(page.state(), PageState::Uptodate);
    cache.sync_pages(None).expect("sync");
    assert_eq!(device.writes(), 0, "discarded dirt is never written");
    cache.unpin(&page);
}

#[test]
fn clear_empties_everything() {
    let (_, owner) = counted_setup(1 << 20);
    let cache = PageCache::new(CacheConfig::default());
    let page = cache.find_or_create_page(&owner, 0);
    cache.write_page(&page);
    cache.unpin(&page);

    cache.clear();
    assert_eq!(cache.page_count(), 0);
}
