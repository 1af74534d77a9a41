//! Error types for the blobcache library.
//!
//! ## Key Components
//!
//! - [`CacheError`]: Returned by every public [`DiskCache`](crate::DiskCache)
//!   operation. Distinguishes retryable conditions (`Busy`), caller mistakes
//!   (`EntryTooLarge`, `InvalidKey`, `NotFound`), lifecycle errors (`Closed`)
//!   and I/O failures.
//! - [`JournalError`]: Returned when opening or replaying a journal. Recovery
//!   handles it by falling back to a directory scan, so it only reaches callers
//!   of the low-level [`Journal`](crate::journal::Journal) API.
//! - [`ConfigError`]: Returned when builder parameters are invalid
//!   (e.g. a zero byte budget).
//!
//! ## Example Usage
//!
//! ```
//! use blobcache::error::{CacheError, ConfigError};
//!
//! let err = CacheError::from(ConfigError::new("max_size must be > 0"));
//! assert!(err.to_string().contains("max_size"));
//! assert!(!err.is_retryable());
//! ```

use std::fmt;
use std::io;
use std::path::PathBuf;

use crate::lru::EntryTooLarge;

/// Convenience alias for results returned by the cache.
pub type Result<T, E = CacheError> = std::result::Result<T, E>;

// ---------------------------------------------------------------------------
// CacheError
// ---------------------------------------------------------------------------

/// Errors surfaced by [`DiskCache`](crate::DiskCache) and its handles.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// The key already has an edit in progress.
    #[error("key {key:?} is being edited")]
    Busy { key: String },

    /// A single value is larger than the whole cache.
    #[error("entry of {size} bytes exceeds maximum cache size of {max_size} bytes")]
    EntryTooLarge { size: u64, max_size: u64 },

    /// The journal could not be parsed.
    #[error("journal is corrupt: {0}")]
    Corrupt(String),

    /// Writing, syncing or publishing an edit failed; the edit was aborted
    /// and the previous state of the key is unchanged.
    #[error("failed to commit edit for key {key:?}")]
    Commit {
        key: String,
        #[source]
        source: io::Error,
    },

    /// The key is not in the cache.
    #[error("key {key:?} not found")]
    NotFound { key: String },

    /// The cache has been closed.
    #[error("cache is closed")]
    Closed,

    /// The key cannot be mapped to an artifact file name.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl CacheError {
    /// Returns `true` for conditions that may clear up if the caller retries.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CacheError::Busy { .. })
    }

    pub(crate) fn busy(key: &str) -> Self {
        CacheError::Busy {
            key: key.to_owned(),
        }
    }

    pub(crate) fn not_found(key: &str) -> Self {
        CacheError::NotFound {
            key: key.to_owned(),
        }
    }

    pub(crate) fn commit(key: &str, source: io::Error) -> Self {
        CacheError::Commit {
            key: key.to_owned(),
            source,
        }
    }
}

impl From<EntryTooLarge> for CacheError {
    fn from(err: EntryTooLarge) -> Self {
        CacheError::EntryTooLarge {
            size: err.size,
            max_size: err.max_size,
        }
    }
}

impl From<JournalError> for CacheError {
    fn from(err: JournalError) -> Self {
        match err {
            JournalError::Io(source) => CacheError::Io(source),
            other => CacheError::Corrupt(other.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// JournalError
// ---------------------------------------------------------------------------

/// Errors produced while opening or replaying a journal file.
#[derive(Debug, thiserror::Error)]
pub enum JournalError {
    /// No journal file exists at the path.
    #[error("journal not found at {0}")]
    Missing(PathBuf),

    /// The header or a record in the middle of the log is malformed.
    #[error("corrupt journal at byte {offset}: {reason}")]
    Corrupt { offset: u64, reason: String },

    #[error("journal I/O error: {0}")]
    Io(#[from] io::Error),
}

impl JournalError {
    pub(crate) fn corrupt(offset: u64, reason: impl Into<String>) -> Self {
        JournalError::Corrupt {
            offset,
            reason: reason.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// ConfigError
// ---------------------------------------------------------------------------

/// Error returned when cache configuration parameters are invalid.
///
/// Produced by [`DiskCacheBuilder::try_open`](crate::builder::DiskCacheBuilder::try_open).
/// Carries a human-readable description of which parameter failed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError(String);

impl ConfigError {
    /// Creates a new `ConfigError` with the given description.
    #[inline]
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }

    /// Returns the error description.
    #[inline]
    pub fn message(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for ConfigError {}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
