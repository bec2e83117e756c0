/// Construction parameters for a [`crate::MemFs`] filesystem type.
#[derive(Clone, Debug)]
pub struct MemFsConfig {
    /// Permission bits for the root directory of each mounted volume.
    pub root_perm: u16,
}

impl Default for MemFsConfig {
    fn default() -> Self {
        Self { root_perm: 0o755 }
    }
}
