//! In-memory block device with a queued I/O worker.

use crate::MemDeviceConfig;
use pagefs_core::{Bio, BioKind, BlockDevice, FsError, FsErrorKind, FsResult};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, trace};

/// Maximum number of queued BIOs before `submit` blocks.
const QUEUE_DEPTH: usize = 256;

/// Sector storage in a `Vec<u8>`, plus a dedicated worker thread that drains
/// a bounded FIFO of BIO requests in submission order.
pub struct MemBlockDevice {
    inner: Arc<MemDeviceInner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

struct MemDeviceInner {
    sector_size: u32,
    block_size: u32,
    readonly: bool,
    name: String,
    major: u32,
    minor: u32,
    data: Mutex<Vec<u8>>,
    size: u64,
    queue: Mutex<BioQueue>,
    /// Signals the worker that the queue is non-empty or shutting down.
    ready: Condvar,
    /// Signals submitters that queue space freed up.
    space: Condvar,
}

struct BioQueue {
    bios: VecDeque<Bio>,
    shutdown: bool,
}

impl MemBlockDevice {
    pub fn new(config: MemDeviceConfig) -> Self {
        let inner = Arc::new(MemDeviceInner {
            sector_size: config.sector_size,
            block_size: config.block_size,
            readonly: config.readonly,
            name: config.name,
            major: config.major,
            minor: config.minor,
            data: Mutex::new(vec![0; config.size as usize]),
            size: config.size,
            queue: Mutex::new(BioQueue {
                bios: VecDeque::new(),
                shutdown: false,
            }),
            ready: Condvar::new(),
            space: Condvar::new(),
        });
        debug!(name = %inner.name, size = inner.size, "mem block device created");
        let worker_inner = inner.clone();
        let worker = std::thread::Builder::new()
            .name(format!("{}-io", inner.name))
            .spawn(move || worker_inner.run())
            .expect("spawn block-device io worker");
        Self {
            inner,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Bulk-load an image into the device, up to its capacity. Returns the
    /// number of bytes copied in.
    pub fn load_from<R: io::Read>(&self, reader: &mut R) -> FsResult<u64> {
        let mut data = self.inner.data.lock();
        let mut total = 0usize;
        while total < data.len() {
            let n = reader.read(&mut data[total..])?;
            if n == 0 {
                break;
            }
            total += n;
        }
        Ok(total as u64)
    }

    /// Dump the whole device image.
    pub fn save_to<W: io::Write>(&self, writer: &mut W) -> FsResult<()> {
        let data = self.inner.data.lock();
        writer.write_all(&data)?;
        Ok(())
    }
}

impl Drop for MemBlockDevice {
    fn drop(&mut self) {
        {
            let mut queue = self.inner.queue.lock();
            queue.shutdown = true;
        }
        self.inner.ready.notify_all();
        self.inner.space.notify_all();
        if let Some(worker) = self.worker.lock().take() {
            let _ = worker.join();
        }
        debug!(name = %self.inner.name, "mem block device shut down");
    }
}

impl MemDeviceInner {
    /// Worker loop: one BIO at a time, in submission order. Shutdown drains
    /// the queue before the thread exits.
    fn run(self: Arc<Self>) {
        loop {
            let bio = {
                let mut queue = self.queue.lock();
                loop {
                    if let Some(bio) = queue.bios.pop_front() {
                        self.space.notify_one();
                        break bio;
                    }
                    if queue.shutdown {
                        return;
                    }
                    self.ready.wait(&mut queue);
                }
            };
            self.execute(bio);
        }
    }

    fn execute(&self, mut bio: Bio) {
        trace!(kind = ?bio.kind, sector = bio.sector, len = bio.len, "bio execute");
        let result = match bio.kind {
            BioKind::Read => self.read_impl(bio.sector, &mut bio.buf),
            BioKind::Write => self.write_impl(bio.sector, &bio.buf),
            BioKind::Flush => self.flush_impl().map(|_| 0),
            BioKind::Discard => self.trim_impl(bio.sector, bio.len).map(|_| 0),
        };
        bio.finish(result);
    }

    fn read_impl(&self, sector: u64, buf: &mut [u8]) -> FsResult<usize> {
        let offset = sector
            .checked_mul(self.sector_size as u64)
            .ok_or(FsError::new(FsErrorKind::InvalidInput, "memblk.read"))?;
        let data = self.data.lock();
        if offset >= data.len() as u64 {
            return Err(FsError::new(FsErrorKind::InvalidInput, "memblk.read"));
        }
        let offset = offset as usize;
        let n = buf.len().min(data.len() - offset);
        buf[..n].copy_from_slice(&data[offset..offset + n]);
        Ok(n)
    }

    fn write_impl(&self, sector: u64, buf: &[u8]) -> FsResult<usize> {
        if self.readonly {
            return Err(FsError::new(FsErrorKind::ReadOnly, "memblk.write"));
        }
        let offset = sector
            .checked_mul(self.sector_size as u64)
            .ok_or(FsError::new(FsErrorKind::InvalidInput, "memblk.write"))?;
        let mut data = self.data.lock();
        if offset >= data.len() as u64 {
            return Err(FsError::new(FsErrorKind::InvalidInput, "memblk.write"));
        }
        let offset = offset as usize;
        let n = buf.len().min(data.len() - offset);
        data[offset..offset + n].copy_from_slice(&buf[..n]);
        Ok(n)
    }

    fn flush_impl(&self) -> FsResult<()> {
        Ok(())
    }

    fn trim_impl(&self, sector: u64, len: usize) -> FsResult<()> {
        if self.readonly {
            return Err(FsError::new(FsErrorKind::ReadOnly, "memblk.trim"));
        }
        let offset = sector
            .checked_mul(self.sector_size as u64)
            .ok_or(FsError::new(FsErrorKind::InvalidInput, "memblk.trim"))?;
        let mut data = self.data.lock();
        if offset >= data.len() as u64 {
            return Err(FsError::new(FsErrorKind::InvalidInput, "memblk.trim"));
        }
        let offset = offset as usize;
        let n = len.min(data.len() - offset);
        data[offset..offset + n].fill(0);
        Ok(())
    }
}

impl BlockDevice for MemBlockDevice {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn size(&self) -> u64 {
        self.inner.size
    }

    fn sector_size(&self) -> u32 {
        self.inner.sector_size
    }

    fn block_size(&self) -> u32 {
        self.inner.block_size
    }

    fn readonly(&self) -> bool {
        self.inner.readonly
    }

    fn major(&self) -> u32 {
        self.inner.major
    }

    fn minor(&self) -> u32 {
        self.inner.minor
    }

    fn read_at(&self, sector: u64, buf: &mut [u8]) -> FsResult<usize> {
        self.inner.read_impl(sector, buf)
    }

    fn write_at(&self, sector: u64, buf: &[u8]) -> FsResult<usize> {
        self.inner.write_impl(sector, buf)
    }

    fn flush(&self) -> FsResult<()> {
        self.inner.flush_impl()
    }

    fn trim(&self, sector: u64, len: usize) -> FsResult<()> {
        self.inner.trim_impl(sector, len)
    }

    fn submit(&self, bio: Bio) {
        trace!(kind = ?bio.kind, sector = bio.sector, "bio submit");
        let mut queue = self.inner.queue.lock();
        while queue.bios.len() >= QUEUE_DEPTH && !queue.shutdown {
            self.inner.space.wait(&mut queue);
        }
        if queue.shutdown {
            drop(queue);
            bio.finish(Err(FsError::new(FsErrorKind::Io, "memblk.submit")));
            return;
        }
        queue.bios.push_back(bio);
        drop(queue);
        self.inner.ready.notify_one();
    }
}
