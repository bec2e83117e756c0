//! The page cache proper: index, recency tracking, dirty tracking, writeback.

use crate::page::{Page, PageOwner, PageState, WritebackOutcome, WritebackStart};
use pagefs_core::{FsError, FsResult, PAGE_SIZE};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{trace, warn};

/// Construction parameters for [`PageCache`].
#[derive(Clone, Debug)]
pub struct CacheConfig {
    /// Page ceiling. The default of 1024 pages is 4 MiB of buffered content.
    pub max_pages: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { max_pages: 1024 }
    }
}

/// Point-in-time counter snapshot.
#[derive(Clone, Copy, Debug, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub writebacks: u64,
    pub page_count: usize,
    pub max_pages: usize,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
struct PageKey {
    owner: usize,
    offset: u64,
}

fn owner_addr(owner: &Arc<dyn PageOwner>) -> usize {
    Arc::as_ptr(owner) as *const () as usize
}

fn key_for(owner: &Arc<dyn PageOwner>, offset: u64) -> PageKey {
    PageKey {
        owner: owner_addr(owner),
        offset,
    }
}

fn key_of(page: &Page) -> PageKey {
    key_for(page.owner(), page.offset())
}

struct CacheLists {
    pages: HashMap<PageKey, Arc<Page>>,
    dirty: Vec<Arc<Page>>,
}

impl CacheLists {
    fn unlink(&mut self, page: &Arc<Page>) {
        if let Some(existing) = self.pages.get(&key_of(page)) {
            if Arc::ptr_eq(existing, page) {
                self.pages.remove(&key_of(page));
            }
        }
        self.dirty.retain(|p| !Arc::ptr_eq(p, page));
    }
}

enum EvictAction {
    /// A clean victim was unlinked inline; retry under the ceiling.
    Evicted,
    /// No unpinned victim exists right now.
    NoCandidate,
    /// A dirty victim was claimed for writeback; flush it outside the lock.
    NeedsWriteback(Arc<Page>),
}

/// Keyed buffer pool with LRU eviction and dirty-writeback policy.
///
/// One mutex guards the index and both membership lists; device I/O and data
/// copies always happen outside it. Recency is a per-page access tick:
/// promotion stores the current tick, eviction picks the lowest tick among
/// unpinned pages.
pub struct PageCache {
    lists: Mutex<CacheLists>,
    max_pages: AtomicUsize,
    tick: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    writebacks: AtomicU64,
}

impl PageCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            lists: Mutex::new(CacheLists {
                pages: HashMap::new(),
                dirty: Vec::new(),
            }),
            max_pages: AtomicUsize::new(config.max_pages.max(1)),
            tick: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            writebacks: AtomicU64::new(0),
        }
    }

    fn touch(&self, page: &Page) {
        let tick = self.tick.fetch_add(1, Ordering::Relaxed) + 1;
        page.last_used.store(tick, Ordering::Relaxed);
    }

    /// Probe for a page; never allocates. Returned pages are pinned.
    pub fn find_page(&self, owner: &Arc<dyn PageOwner>, offset: u64) -> Option<Arc<Page>> {
        debug_assert_eq!(offset % PAGE_SIZE as u64, 0);
        let lists = self.lists.lock();
        match lists.pages.get(&key_for(owner, offset)) {
            Some(page) => {
                page.pin();
                self.touch(page);
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(page.clone())
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Find a page or allocate a fresh `Clean` one, evicting as needed to
    /// honor the ceiling. Returned pages are pinned.
    pub fn find_or_create_page(&self, owner: &Arc<dyn PageOwner>, offset: u64) -> Arc<Page> {
        debug_assert_eq!(offset % PAGE_SIZE as u64, 0);
        let key = key_for(owner, offset);
        // Bounded eviction attempts: if no victim frees up, the cache
        // temporarily exceeds its ceiling instead of spinning.
        let mut attempts = 0usize;
        loop {
            let action = {
                let mut lists = self.lists.lock();
                if let Some(page) = lists.pages.get(&key) {
                    page.pin();
                    self.touch(page);
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return page.clone();
                }
                if lists.pages.len() < self.max_pages.load(Ordering::Relaxed) || attempts >= 8 {
                    let page = Page::new(owner.clone(), offset);
                    self.touch(&page);
                    lists.pages.insert(key, page.clone());
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    return page;
                }
                self.evict_locked(&mut lists)
            };
            attempts += 1;
            match action {
                EvictAction::Evicted => {}
                EvictAction::NoCandidate => {
                    attempts = 8;
                }
                EvictAction::NeedsWriteback(victim) => {
                    self.writeback_for_eviction(&victim);
                }
            }
        }
    }

    /// Return a page with current contents, reading it from the owner's
    /// block device if necessary. Concurrent callers for the same missing
    /// key collapse onto a single device read; late arrivers block on the
    /// page lock. Returned pages are pinned.
    pub fn read_page(&self, owner: &Arc<dyn PageOwner>, offset: u64) -> FsResult<Arc<Page>> {
        let page = self.find_or_create_page(owner, offset);
        let prev = page.lock_for_io();
        if matches!(
            prev,
            PageState::Uptodate | PageState::Dirty | PageState::Writeback
        ) {
            page.unlock_to(prev);
            return Ok(page);
        }
        // Clean or Error: populate from the device while holding the page
        // lock so every concurrent reader waits on exactly this I/O.
        let result = page.owner().device().and_then(|device| {
            let sector = offset / device.sector_size() as u64;
            page.with_data_mut(|buf| {
                let n = device.read_at(sector, buf)?;
                buf[n..].fill(0);
                Ok(())
            })
        });
        match result {
            Ok(()) => {
                trace!(offset, "page populated from device");
                page.unlock_to(PageState::Uptodate);
                Ok(page)
            }
            Err(err) => {
                warn!(offset, %err, "page read failed");
                page.unlock_to(PageState::Error);
                // Failed misses are not cached: dropping the pin releases
                // the Error page from the index.
                self.unpin(&page);
                Err(err)
            }
        }
    }

    /// Mark a page dirty and promote it. No synchronous I/O.
    pub fn write_page(&self, page: &Arc<Page>) {
        let newly_dirty = page.mark_dirty();
        let mut lists = self.lists.lock();
        self.touch(page);
        if newly_dirty {
            lists.dirty.push(page.clone());
        }
    }

    /// Discard a page's dirty mark without writing it back: the page
    /// returns to `Uptodate` and leaves the dirty list.
    pub fn clear_dirty(&self, page: &Arc<Page>) {
        if page.clear_dirty_state() {
            let mut lists = self.lists.lock();
            lists.dirty.retain(|p| !Arc::ptr_eq(p, page));
        }
    }

    /// Drop a caller's pin. The last pin hands the page back to the cache.
    pub fn unpin(&self, page: &Arc<Page>) {
        if page.unpin() == 0 {
            self.release_page(page);
        }
    }

    /// Called when a page's pin count reaches zero: the page becomes a pure
    /// eviction candidate. Error pages are dropped outright so failed reads
    /// never linger in the index.
    pub fn release_page(&self, page: &Arc<Page>) {
        if page.pins() > 0 {
            return;
        }
        if page.state() == PageState::Error {
            let mut lists = self.lists.lock();
            if page.pins() == 0 && !lists.dirty.iter().any(|p| Arc::ptr_eq(p, page)) {
                lists.unlink(page);
            }
        }
    }

    /// Flush dirty pages for one owner, or for every owner when `owner` is
    /// `None`. Iterates a snapshot of the dirty list; every page that was
    /// dirty at call time has been attempted by return time, and the first
    /// failure is reported after the full pass.
    pub fn sync_pages(&self, owner: Option<&Arc<dyn PageOwner>>) -> FsResult<()> {
        let snapshot: Vec<Arc<Page>> = {
            let lists = self.lists.lock();
            match owner {
                Some(owner) => {
                    let addr = owner_addr(owner);
                    lists
                        .dirty
                        .iter()
                        .filter(|p| owner_addr(p.owner()) == addr)
                        .cloned()
                        .collect()
                }
                None => lists.dirty.clone(),
            }
        };
        let mut first_err: Option<FsError> = None;
        for page in snapshot {
            if let Err(err) = self.flush_page(&page) {
                warn!(offset = page.offset(), %err, "writeback failed");
                first_err.get_or_insert(err);
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Flush every dirty page.
    pub fn flush_all(&self) -> FsResult<()> {
        self.sync_pages(None)
    }

    /// Drop all pages for an owner, writing dirty ones back first on a
    /// best-effort basis.
    pub fn invalidate_pages(&self, owner: &Arc<dyn PageOwner>) {
        let _ = self.sync_pages(Some(owner));
        let addr = owner_addr(owner);
        let mut lists = self.lists.lock();
        lists.pages.retain(|key, _| key.owner != addr);
        lists.dirty.retain(|p| owner_addr(p.owner()) != addr);
    }

    /// Drop the owner's pages lying entirely at or beyond `new_size`.
    /// The partial boundary page, if any, is retained. Truncated data is
    /// discarded, not written back.
    pub fn truncate_pages(&self, owner: &Arc<dyn PageOwner>, new_size: u64) {
        let addr = owner_addr(owner);
        let mut lists = self.lists.lock();
        lists
            .pages
            .retain(|key, _| key.owner != addr || key.offset < new_size);
        lists
            .dirty
            .retain(|p| owner_addr(p.owner()) != addr || p.offset() < new_size);
    }

    /// Adjust the page ceiling, evicting down to it if necessary.
    pub fn set_max_pages(&self, max_pages: usize) {
        let max_pages = max_pages.max(1);
        self.max_pages.store(max_pages, Ordering::Relaxed);
        loop {
            let action = {
                let mut lists = self.lists.lock();
                if lists.pages.len() <= max_pages {
                    return;
                }
                self.evict_locked(&mut lists)
            };
            match action {
                EvictAction::Evicted => {}
                EvictAction::NoCandidate => return,
                EvictAction::NeedsWriteback(victim) => self.writeback_for_eviction(&victim),
            }
        }
    }

    /// Drop everything without writeback. Teardown only.
    pub fn clear(&self) {
        let mut lists = self.lists.lock();
        lists.pages.clear();
        lists.dirty.clear();
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    pub fn writebacks(&self) -> u64 {
        self.writebacks.load(Ordering::Relaxed)
    }

    pub fn page_count(&self) -> usize {
        self.lists.lock().pages.len()
    }

    pub fn max_pages(&self) -> usize {
        self.max_pages.load(Ordering::Relaxed)
    }

    pub fn hit_rate(&self) -> f64 {
        self.stats().hit_rate()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits(),
            misses: self.misses(),
            evictions: self.evictions(),
            writebacks: self.writebacks(),
            page_count: self.page_count(),
            max_pages: self.max_pages(),
        }
    }

    /// Pick and act on the least-recently-used unpinned page. Clean victims
    /// are unlinked inline; dirty ones are claimed for writeback and handed
    /// back to the caller, which must flush without holding the list mutex.
    fn evict_locked(&self, lists: &mut CacheLists) -> EvictAction {
        let mut victim: Option<Arc<Page>> = None;
        for page in lists.pages.values() {
            if page.pins() != 0 {
                continue;
            }
            let better = match &victim {
                None => true,
                Some(v) => {
                    page.last_used.load(Ordering::Relaxed) < v.last_used.load(Ordering::Relaxed)
                }
            };
            if better {
                victim = Some(page.clone());
            }
        }
        let Some(victim) = victim else {
            return EvictAction::NoCandidate;
        };
        match victim.try_begin_writeback() {
            WritebackStart::Started => EvictAction::NeedsWriteback(victim),
            WritebackStart::CleanAlready => {
                trace!(offset = victim.offset(), "evicting clean page");
                lists.unlink(&victim);
                self.evictions.fetch_add(1, Ordering::Relaxed);
                EvictAction::Evicted
            }
            WritebackStart::Busy => EvictAction::NoCandidate,
        }
    }

    /// Flush an eviction victim (claimed as `Writeback`) and unlink it.
    /// On write failure the page enters `Error` and is unlinked anyway: the
    /// caller is already under eviction pressure and the data is lost.
    fn writeback_for_eviction(&self, victim: &Arc<Page>) {
        let result = self.write_out(victim);
        let ok = result.is_ok();
        let outcome = victim.complete_writeback(ok);
        let mut lists = self.lists.lock();
        match outcome {
            WritebackOutcome::Clean => {
                self.writebacks.fetch_add(1, Ordering::Relaxed);
                if victim.pins() == 0 {
                    trace!(offset = victim.offset(), "evicted after writeback");
                    lists.unlink(victim);
                    self.evictions.fetch_add(1, Ordering::Relaxed);
                }
            }
            WritebackOutcome::Failed => {
                warn!(offset = victim.offset(), "eviction writeback failed, dropping page");
                lists.unlink(victim);
                self.evictions.fetch_add(1, Ordering::Relaxed);
            }
            WritebackOutcome::Redirtied => {}
        }
    }

    /// One dirty-list flush: claim, write, settle state and membership.
    fn flush_page(&self, page: &Arc<Page>) -> FsResult<()> {
        if !page.begin_writeback() {
            return Ok(());
        }
        match self.write_out(page) {
            Ok(()) => {
                match page.complete_writeback(true) {
                    WritebackOutcome::Clean => {
                        self.writebacks.fetch_add(1, Ordering::Relaxed);
                        let mut lists = self.lists.lock();
                        lists.dirty.retain(|p| !Arc::ptr_eq(p, page));
                    }
                    // Re-dirtied mid-flush: stays enrolled for the next sync.
                    WritebackOutcome::Redirtied | WritebackOutcome::Failed => {}
                }
                Ok(())
            }
            Err(err) => {
                // Error state, but still on the dirty list: the next sync
                // retries the write.
                page.complete_writeback(false);
                Err(err)
            }
        }
    }

    fn write_out(&self, page: &Arc<Page>) -> FsResult<()> {
        let device = page.owner().device()?;
        let sector = page.offset() / device.sector_size() as u64;
        page.with_data(|buf| device.write_at(sector, buf))?;
        Ok(())
    }
}

impl Default for PageCache {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

impl std::fmt::Debug for PageCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageCache")
            .field("stats", &self.stats())
            .finish()
    }
}

impl Drop for PageCache {
    fn drop(&mut self) {
        let _ = self.flush_all();
    }
}
