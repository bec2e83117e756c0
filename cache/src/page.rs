//! A single cached page and its state machine.

use pagefs_core::{BlockDevice, FsResult, PAGE_SIZE};
use parking_lot::{Condvar, Mutex, RwLock};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

/// The cache's view of whatever owns a page (an inode, in practice).
///
/// The owner hands the cache its block device on demand; the cache never
/// reaches into filesystem internals. Owners are compared by pointer
/// identity, so two separately mounted instances never share pages.
pub trait PageOwner: Send + Sync {
    fn device(&self) -> FsResult<Arc<dyn BlockDevice>>;
}

/// Page lifecycle states.
///
/// `Locked` means I/O is in progress and waiters must block; `Writeback`
/// means a dirty page is being flushed. `Error` marks untrusted contents
/// after a failed I/O.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PageState {
    Clean,
    Uptodate,
    Locked,
    Dirty,
    Writeback,
    Error,
}

pub(crate) enum WritebackStart {
    /// Transitioned to `Writeback`; caller owns the flush.
    Started,
    /// Nothing to write.
    CleanAlready,
    /// Locked or already in writeback elsewhere.
    Busy,
}

pub(crate) enum WritebackOutcome {
    /// Flush landed; page is `Uptodate` again.
    Clean,
    /// Flush failed; page is `Error`.
    Failed,
    /// A writer re-dirtied the page mid-flush; it stays `Dirty`.
    Redirtied,
}

/// Fixed-size buffer caching one `(owner, offset)` region.
///
/// The buffer lock (`data`) serializes actual byte access; the state mutex
/// plus condvar implement the page lock that readers wait on during I/O.
/// The pin count tracks outstanding users beyond the cache itself.
pub struct Page {
    owner: Arc<dyn PageOwner>,
    offset: u64,
    data: RwLock<Box<[u8]>>,
    state: Mutex<PageState>,
    unlocked: Condvar,
    pins: AtomicU32,
    pub(crate) last_used: AtomicU64,
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Page")
            .field("offset", &self.offset)
            .field("state", &*self.state.lock())
            .field("pins", &self.pins.load(Ordering::Relaxed))
            .finish()
    }
}

impl Page {
    pub(crate) fn new(owner: Arc<dyn PageOwner>, offset: u64) -> Arc<Self> {
        Arc::new(Self {
            owner,
            offset,
            data: RwLock::new(vec![0u8; PAGE_SIZE].into_boxed_slice()),
            state: Mutex::new(PageState::Clean),
            unlocked: Condvar::new(),
            pins: AtomicU32::new(1),
            last_used: AtomicU64::new(0),
        })
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn owner(&self) -> &Arc<dyn PageOwner> {
        &self.owner
    }

    pub fn state(&self) -> PageState {
        *self.state.lock()
    }

    pub fn pins(&self) -> u32 {
        self.pins.load(Ordering::Acquire)
    }

    pub(crate) fn pin(&self) {
        self.pins.fetch_add(1, Ordering::AcqRel);
    }

    /// Decrement the pin count, returning the remaining pins.
    pub(crate) fn unpin(&self) -> u32 {
        let prev = self.pins.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "unpin of an unpinned page");
        prev - 1
    }

    /// Read access to the page buffer.
    pub fn with_data<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        f(&self.data.read())
    }

    /// Write access to the page buffer.
    pub fn with_data_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        f(&mut self.data.write())
    }

    /// Whether the buffer can be served without a device read.
    pub fn is_current(&self) -> bool {
        matches!(
            self.state(),
            PageState::Uptodate | PageState::Dirty | PageState::Writeback
        )
    }

    pub fn is_dirty(&self) -> bool {
        self.state() == PageState::Dirty
    }

    /// Acquire the page lock for I/O: waits until the page is not `Locked`,
    /// then transitions to `Locked` and returns the prior state.
    pub(crate) fn lock_for_io(&self) -> PageState {
        let mut state = self.state.lock();
        while *state == PageState::Locked {
            self.unlocked.wait(&mut state);
        }
        let prev = *state;
        *state = PageState::Locked;
        prev
    }

    /// Release the page lock, entering `next`, and wake all waiters.
    pub(crate) fn unlock_to(&self, next: PageState) {
        *self.state.lock() = next;
        self.unlocked.notify_all();
    }

    /// Transition towards `Dirty`, waiting out any in-flight page lock.
    /// Returns true when the page newly needs dirty-list enrollment.
    pub(crate) fn mark_dirty(&self) -> bool {
        let mut state = self.state.lock();
        while *state == PageState::Locked {
            self.unlocked.wait(&mut state);
        }
        match *state {
            PageState::Dirty => false,
            // Flush in progress: the completion sees `Dirty` and keeps the
            // page enrolled.
            PageState::Writeback => {
                *state = PageState::Dirty;
                false
            }
            _ => {
                *state = PageState::Dirty;
                true
            }
        }
    }

    /// Drop a dirty mark without writing back. Returns true when the page
    /// was dirty. List membership is settled by the cache.
    pub(crate) fn clear_dirty_state(&self) -> bool {
        let mut state = self.state.lock();
        while *state == PageState::Locked {
            self.unlocked.wait(&mut state);
        }
        if *state == PageState::Dirty {
            *state = PageState::Uptodate;
            true
        } else {
            false
        }
    }

    /// Claim the page for writeback without blocking on a page lock.
    pub(crate) fn try_begin_writeback(&self) -> WritebackStart {
        let mut state = self.state.lock();
        match *state {
            PageState::Dirty | PageState::Error => {
                *state = PageState::Writeback;
                WritebackStart::Started
            }
            PageState::Clean | PageState::Uptodate => WritebackStart::CleanAlready,
            PageState::Locked | PageState::Writeback => WritebackStart::Busy,
        }
    }

    /// Claim the page for writeback, waiting out an in-flight page lock.
    /// Returns false when there is nothing left to flush.
    pub(crate) fn begin_writeback(&self) -> bool {
        let mut state = self.state.lock();
        while *state == PageState::Locked {
            self.unlocked.wait(&mut state);
        }
        match *state {
            PageState::Dirty | PageState::Error => {
                *state = PageState::Writeback;
                true
            }
            _ => false,
        }
    }

    /// Finish a writeback claimed via `begin_writeback`/`try_begin_writeback`.
    pub(crate) fn complete_writeback(&self, ok: bool) -> WritebackOutcome {
        let mut state = self.state.lock();
        let outcome = match *state {
            PageState::Dirty => WritebackOutcome::Redirtied,
            PageState::Writeback => {
                if ok {
                    *state = PageState::Uptodate;
                    WritebackOutcome::Clean
                } else {
                    *state = PageState::Error;
                    WritebackOutcome::Failed
                }
            }
            // Unexpected transition raced us; leave the state alone.
            _ => WritebackOutcome::Redirtied,
        };
        drop(state);
        self.unlocked.notify_all();
        outcome
    }
}
