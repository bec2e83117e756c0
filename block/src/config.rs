use pagefs_core::{BLOCK_SIZE, SECTOR_SIZE};

/// Construction parameters for [`crate::MemBlockDevice`].
#[derive(Clone, Debug)]
pub struct MemDeviceConfig {
    /// Device capacity in bytes.
    pub size: u64,
    pub sector_size: u32,
    pub block_size: u32,
    pub readonly: bool,
    pub name: String,
    pub major: u32,
    pub minor: u32,
}

impl Default for MemDeviceConfig {
    fn default() -> Self {
        Self {
            size: 4 * 1024 * 1024,
            sector_size: SECTOR_SIZE,
            block_size: BLOCK_SIZE,
            readonly: false,
            name: "memblk".to_string(),
            major: 8,
            minor: 0,
        }
    }
}

/// Construction parameters for [`crate::FileBlockDevice`].
#[derive(Clone, Debug)]
pub struct FileDeviceConfig {
    pub readonly: bool,
    pub sector_size: u32,
    pub block_size: u32,
    pub major: u32,
    pub minor: u32,
}

impl Default for FileDeviceConfig {
    fn default() -> Self {
        Self {
            readonly: false,
            sector_size: SECTOR_SIZE,
            block_size: BLOCK_SIZE,
            major: 8,
            minor: 1,
        }
    }
}
