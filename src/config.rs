use std::path::PathBuf;

/// Extension of the primary-key file.
pub const PRIMARY_KEY_EXTENSION: &str = "pk";
/// Extension of the data file.
pub const DATA_EXTENSION: &str = "dat";
/// Extension of the schema description written beside the data.
pub const META_EXTENSION: &str = "meta";
/// Extension of a persisted index, `<entity>.<index>.idx`.
pub const INDEX_EXTENSION: &str = "idx";
/// Suffix of the replacement files written during defragmentation.
pub const DEFRAG_SUFFIX: &str = "defrag";
/// Suffix the originals are moved to while defragmentation swaps the files.
pub const BACKUP_SUFFIX: &str = "old";

/// Where the store lives and how hard it flushes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    /// Directory holding every entity's files.
    pub root: PathBuf,
    /// `sync_data` each file when a write session ends.
    pub sync_writes: bool,
}

impl StoreConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            sync_writes: false,
        }
    }

    pub fn with_sync_writes(mut self, sync_writes: bool) -> Self {
        self.sync_writes = sync_writes;
        self
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::new(default_root())
    }
}

/// `$HOME/.recordb`, or the working directory when there is no home.
pub fn default_root() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(".recordb"))
        .unwrap_or_else(|| PathBuf::from("."))
}
