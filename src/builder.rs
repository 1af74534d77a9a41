//! Builder for [`DiskCache`].
//!
//! Collects the tunables in one place and validates them before any file is
//! touched.
//!
//! ## Example
//!
//! ```rust
//! use blobcache::builder::DiskCacheBuilder;
//! use blobcache::edit::EditMode;
//!
//! let dir = tempfile::tempdir().unwrap();
//! let cache = DiskCacheBuilder::new(dir.path(), 1024)
//!     .edit_mode(EditMode::Block)
//!     .compaction_threshold(4)
//!     .try_open()
//!     .unwrap();
//! assert_eq!(cache.max_size(), 1024);
//! ```
//!
//! ## Settings
//!
//! | Setting                  | Default          | Meaning                                   |
//! |--------------------------|------------------|-------------------------------------------|
//! | `edit_mode`              | `FailFast`       | `edit` on a busy key fails or waits       |
//! | `compaction_threshold`   | 2                | compact at records > threshold × entries  |
//! | `compaction_min_records` | 64               | never compact below this many records     |
//! | `file_system`            | `StdFileSystem`  | file-system collaborator                  |

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use crate::cache::{CacheConfig, DiskCache};
use crate::edit::EditMode;
use crate::error::{ConfigError, Result};
use crate::fs::{FileSystem, StdFileSystem};
use crate::journal::CompactionPolicy;

/// Configures and opens a [`DiskCache`].
#[derive(Clone)]
pub struct DiskCacheBuilder {
    directory: PathBuf,
    max_size: u64,
    edit_mode: EditMode,
    compaction: CompactionPolicy,
    fs: Option<Arc<dyn FileSystem>>,
}

impl DiskCacheBuilder {
    /// Starts a builder for a cache in `directory` holding at most
    /// `max_size` bytes of values.
    pub fn new(directory: impl Into<PathBuf>, max_size: u64) -> Self {
        Self {
            directory: directory.into(),
            max_size,
            edit_mode: EditMode::default(),
            compaction: CompactionPolicy::default(),
            fs: None,
        }
    }

    pub fn edit_mode(mut self, mode: EditMode) -> Self {
        self.edit_mode = mode;
        self
    }

    /// Compact once the journal holds more than `multiple` records per live
    /// entry.
    pub fn compaction_threshold(mut self, multiple: u64) -> Self {
        self.compaction.multiple = multiple;
        self
    }

    pub fn compaction_min_records(mut self, records: u64) -> Self {
        self.compaction.min_records = records;
        self
    }

    /// Replaces the file-system collaborator, e.g. with a fault-injecting
    /// wrapper in tests.
    pub fn file_system(mut self, fs: Arc<dyn FileSystem>) -> Self {
        self.fs = Some(fs);
        self
    }

    fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.max_size == 0 {
            return Err(ConfigError::new("max_size must be > 0"));
        }
        if self.compaction.multiple == 0 {
            return Err(ConfigError::new("compaction_threshold must be >= 1"));
        }
        if self.directory.as_os_str().is_empty() {
            return Err(ConfigError::new("directory must not be empty"));
        }
        Ok(())
    }

    /// Validates the settings, recovers the directory and opens the cache.
    pub fn try_open(self) -> Result<DiskCache> {
        self.validate()?;
        DiskCache::with_config(CacheConfig {
            directory: self.directory,
            max_size: self.max_size,
            edit_mode: self.edit_mode,
            compaction: self.compaction,
            fs: self.fs.unwrap_or_else(|| Arc::new(StdFileSystem)),
        })
    }
}

impl fmt::Debug for DiskCacheBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiskCacheBuilder")
            .field("directory", &self.directory)
            .field("max_size", &self.max_size)
            .field("edit_mode", &self.edit_mode)
            .field("compaction", &self.compaction)
            .field("fs", &self.fs)
            .finish()
    }
}
