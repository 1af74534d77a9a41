pub use crate::builder::DiskCacheBuilder;
pub use crate::cache::{DiskCache, ReadHandle};
pub use crate::ds::{AccessOrder, InsertionOrder, OrderedIndex, RecencyMode};
pub use crate::edit::{EditMode, Editor};
pub use crate::error::{CacheError, ConfigError, JournalError};
pub use crate::fs::{FileSystem, StdFileSystem, SyncWrite};
pub use crate::lru::{CacheCore, EntryTooLarge};
pub use crate::recovery::RecoveryReport;
pub use crate::stats::CacheStats;
