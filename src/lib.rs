//! blobcache: a journal-backed, crash-safe disk LRU cache for binary blobs.
//!
//! Values live as files in one directory. A write-ahead journal records every
//! edit, commit and removal, so reopening the directory after a crash
//! restores exactly the committed entries in their recency order. Once the
//! total size of the values exceeds the byte budget, least recently used
//! entries are deleted.
//!
//! ## Layers
//!
//! | Module                 | Role                                            |
//! |------------------------|-------------------------------------------------|
//! | [`ds::ordered_index`]  | hash-indexed recency list, O(1) reordering      |
//! | [`lru`]                | size accounting and LRU trimming                |
//! | [`journal`]            | append-only redo log with checksummed records   |
//! | [`store`]              | key → artifact paths, temp/rename publishing    |
//! | [`recovery`]           | journal replay and directory reconciliation     |
//! | [`edit`]               | per-key edit leases and the [`Editor`] handle   |
//! | [`cache`]              | [`DiskCache`], the public entry point           |
//!
//! ## Example
//!
//! ```rust
//! use std::io::Write;
//!
//! use blobcache::DiskCache;
//!
//! let dir = tempfile::tempdir().unwrap();
//! let cache = DiskCache::open(dir.path(), 1024).unwrap();
//! cache.put("greeting", |w| w.write_all(b"hello")).unwrap();
//! assert_eq!(cache.get_bytes("greeting").unwrap().as_deref(), Some(&b"hello"[..]));
//! cache.close().unwrap();
//!
//! // Reopening restores committed entries.
//! let cache = DiskCache::open(dir.path(), 1024).unwrap();
//! assert!(cache.contains_key("greeting"));
//! ```

pub mod builder;
pub mod cache;
pub mod ds;
pub mod edit;
pub mod error;
pub mod fs;
pub mod journal;
pub mod lru;
pub mod prelude;
pub mod recovery;
pub mod stats;
pub mod store;

pub use builder::DiskCacheBuilder;
pub use cache::{DiskCache, ReadHandle};
pub use edit::{EditMode, Editor};
pub use error::{CacheError, ConfigError, Result};
pub use stats::CacheStats;
