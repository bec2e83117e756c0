//! Block-device backends.
//!
//! Two variants with the same capability set: [`MemBlockDevice`] keeps its
//! sectors in memory and runs BIOs on a dedicated worker thread;
//! [`FileBlockDevice`] maps sectors onto a host file and executes BIOs
//! inline on the submitting thread, since the host OS already blocks there.

mod config;
mod file;
mod mem;

pub use config::{FileDeviceConfig, MemDeviceConfig};
pub use file::FileBlockDevice;
pub use mem::MemBlockDevice;
