//! Host-file backed block device.
//!
//! Sectors map linearly onto a regular file. BIOs execute inline on the
//! submitting thread: the host OS already blocks us, so a second queue
//! would add nothing.

use crate::FileDeviceConfig;
use pagefs_core::{Bio, BioKind, BlockDevice, FsError, FsErrorKind, FsResult};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use tracing::{debug, trace};

pub struct FileBlockDevice {
    file: File,
    path: String,
    size: u64,
    sector_size: u32,
    block_size: u32,
    readonly: bool,
    major: u32,
    minor: u32,
}

impl FileBlockDevice {
    pub fn open(path: impl AsRef<Path>, config: FileDeviceConfig) -> FsResult<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(!config.readonly)
            .open(path)?;
        let size = file.metadata()?.len();
        debug!(path = %path.display(), size, "file block device opened");
        Ok(Self {
            file,
            path: path.display().to_string(),
            size,
            sector_size: config.sector_size,
            block_size: config.block_size,
            readonly: config.readonly,
            major: config.major,
            minor: config.minor,
        })
    }

    fn byte_offset(&self, sector: u64, context: &'static str) -> FsResult<u64> {
        let offset = sector
            .checked_mul(self.sector_size as u64)
            .ok_or(FsError::new(FsErrorKind::InvalidInput, context))?;
        if offset >= self.size {
            return Err(FsError::new(FsErrorKind::InvalidInput, context));
        }
        Ok(offset)
    }
}

impl BlockDevice for FileBlockDevice {
    fn name(&self) -> &str {
        &self.path
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn sector_size(&self) -> u32 {
        self.sector_size
    }

    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn readonly(&self) -> bool {
        self.readonly
    }

    fn major(&self) -> u32 {
        self.major
    }

    fn minor(&self) -> u32 {
        self.minor
    }

    fn read_at(&self, sector: u64, buf: &mut [u8]) -> FsResult<usize> {
        let offset = self.byte_offset(sector, "fileblk.read")?;
        let n = buf.len().min((self.size - offset) as usize);
        self.file.read_exact_at(&mut buf[..n], offset)?;
        Ok(n)
    }

    fn write_at(&self, sector: u64, buf: &[u8]) -> FsResult<usize> {
        if self.readonly {
            return Err(FsError::new(FsErrorKind::ReadOnly, "fileblk.write"));
        }
        let offset = self.byte_offset(sector, "fileblk.write")?;
        let n = buf.len().min((self.size - offset) as usize);
        self.file.write_all_at(&buf[..n], offset)?;
        Ok(n)
    }

    fn flush(&self) -> FsResult<()> {
        self.file.sync_all()?;
        Ok(())
    }

    fn trim(&self, _sector: u64, _len: usize) -> FsResult<()> {
        // The host filesystem owns the blocks; nothing to discard here.
        Ok(())
    }

    fn submit(&self, mut bio: Bio) {
        trace!(kind = ?bio.kind, sector = bio.sector, "inline bio");
        let result = match bio.kind {
            BioKind::Read => self.read_at(bio.sector, &mut bio.buf),
            BioKind::Write => self.write_at(bio.sector, &bio.buf),
            BioKind::Flush => self.flush().map(|_| 0),
            BioKind::Discard => self.trim(bio.sector, bio.len).map(|_| 0),
        };
        bio.finish(result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn backing(size: usize) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        file.write_all(&vec![0u8; size]).expect("fill backing file");
        file.flush().expect("flush backing file");
        file
    }

    #[test]
    fn write_then_read_round_trips() {
        let file = backing(4096);
        let dev = FileBlockDevice::open(file.path(), FileDeviceConfig::default())
            .expect("open device");
        assert_eq!(dev.size(), 4096);

        dev.write_at(2, &[0x7E; 512]).expect("write");
        let mut buf = [0u8; 512];
        let n = dev.read_at(2, &mut buf).expect("read");
        assert_eq!(n, 512);
        assert!(buf.iter().all(|&b| b == 0x7E));
    }

    #[test]
    fn readonly_refuses_writes() {
        let file = backing(1024);
        let dev = FileBlockDevice::open(
            file.path(),
            FileDeviceConfig {
                readonly: true,
                ..FileDeviceConfig::default()
            },
        )
        .expect("open device");
        let err = dev.write_at(0, &[1; 512]).expect_err("readonly write");
        assert_eq!(err.kind(), FsErrorKind::ReadOnly);
    }

    #[test]
    fn out_of_range_sector_is_invalid() {
        let file = backing(1024);
        let dev = FileBlockDevice::open(file.path(), FileDeviceConfig::default())
            .expect("open device");
        let mut buf = [0u8; 512];
        let err = dev.read_at(4, &mut buf).expect_err("past end");
        assert_eq!(err.kind(), FsErrorKind::InvalidInput);
    }

    #[test]
    fn bios_run_inline_before_submit_returns() {
        let file = backing(4096);
        let dev = FileBlockDevice::open(file.path(), FileDeviceConfig::default())
            .expect("open device");

        let done = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = done.clone();
        dev.submit(Bio::write(
            0,
            vec![0x11; 512].into_boxed_slice(),
            Box::new(move |res, _| {
                res.expect("inline write");
                flag.store(true, std::sync::atomic::Ordering::SeqCst);
            }),
        ));
        assert!(done.load(std::sync::atomic::Ordering::SeqCst));
    }
}
