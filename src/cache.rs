//! The persistent cache.
//!
//! [`DiskCache`] ties the pieces together:
//!
//! ```text
//!   DiskCache ──► Shared
//!                  ├── EditCoordinator    per-key leases (outside the state lock)
//!                  ├── DiskEntryStore     temp / clean artifacts
//!                  └── Mutex<State>
//!                        ├── EntryIndex   clean entries, LRU order, byte total
//!                        ├── Journal      redo log
//!                        └── dirty        keys with an edit in flight
//! ```
//!
//! ## Commit protocol
//!
//! 1. `edit(key)`: take the key lease, journal `BeginEdit`, create the temp
//!    artifact. The key is now dirty and invisible to `get`.
//! 2. The caller writes through [`Editor`]; no locks are held.
//! 3. `commit()`: sync the temp artifact (no locks), then under the state
//!    lock rename it over the clean artifact, journal `Commit`, index the
//!    entry at the MRU end and evict from the LRU end until the budget holds.
//!    Evicted artifacts are deleted and journaled as `Remove`.
//! 4. The key lease is released.
//!
//! Aborts delete the temp artifact and journal `Cancel`. Reads journal a
//! buffered `Read` so recency survives a restart.
//!
//! ## Thread safety
//!
//! `DiskCache` is `Clone + Send + Sync`; clones share one cache. The state
//! lock is held for index and journal updates only. Bytes are copied by the
//! caller through [`ReadHandle`] and [`Editor`] outside of it.

use std::fmt;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashMap;

use crate::builder::DiskCacheBuilder;
use crate::edit::{EditCoordinator, EditMode, Editor};
use crate::error::{CacheError, ConfigError, Result};
use crate::fs::FileSystem;
use crate::journal::{CompactionPolicy, Journal, JournalRecord};
use crate::recovery::{EntryIndex, RecoveryManager, RecoveryReport};
use crate::stats::{CacheStats, StatsCounters};
use crate::store::{DiskEntryStore, EntryMeta, encode_key};

/// Resolved configuration handed over by the builder.
pub(crate) struct CacheConfig {
    pub(crate) directory: PathBuf,
    pub(crate) max_size: u64,
    pub(crate) edit_mode: EditMode,
    pub(crate) compaction: CompactionPolicy,
    pub(crate) fs: Arc<dyn FileSystem>,
}

struct State {
    index: EntryIndex,
    journal: Option<Journal>,
    /// Key → sequence number of its in-flight edit.
    dirty: FxHashMap<String, u64>,
    next_sequence: u64,
    /// An append failed; the journal tail may be garbage until rewritten.
    journal_broken: bool,
    closing: bool,
}

impl State {
    fn ensure_open(&self) -> Result<()> {
        if self.journal.is_none() {
            return Err(CacheError::Closed);
        }
        Ok(())
    }

    fn ensure_accepting_edits(&self) -> Result<()> {
        self.ensure_open()?;
        if self.closing {
            return Err(CacheError::Closed);
        }
        Ok(())
    }

    /// Durably appends `record`.
    fn record(&mut self, record: &JournalRecord) -> io::Result<()> {
        let journal = self
            .journal
            .as_mut()
            .ok_or_else(|| io::Error::other(CacheError::Closed))?;
        let result = journal.append(record);
        if result.is_err() {
            self.journal_broken = true;
        }
        result
    }

    /// Appends `record` without syncing.
    fn record_buffered(&mut self, record: &JournalRecord) {
        let Some(journal) = self.journal.as_mut() else {
            return;
        };
        if let Err(e) = journal.append_buffered(record) {
            tracing::warn!(key = %record.key(), error = %e, "journal append failed");
            self.journal_broken = true;
        }
    }

    fn sync_journal(&mut self) {
        let Some(journal) = self.journal.as_mut() else {
            return;
        };
        if let Err(e) = journal.sync() {
            tracing::warn!(error = %e, "journal sync failed");
            self.journal_broken = true;
        }
    }

    fn is_visible(&self, key: &str) -> bool {
        !self.dirty.contains_key(key) && self.index.contains_key(key)
    }

    fn visible_keys(&self) -> Vec<String> {
        self.index
            .iter()
            .filter(|(key, _)| !self.dirty.contains_key(key.as_str()))
            .map(|(key, _)| key.clone())
            .collect()
    }
}

/// State shared by every clone of a [`DiskCache`] and its editors.
pub(crate) struct Shared {
    store: DiskEntryStore,
    coordinator: EditCoordinator,
    compaction: CompactionPolicy,
    state: Mutex<State>,
    edits_finished: Condvar,
    stats: StatsCounters,
    recovery: RecoveryReport,
}

impl Shared {
    fn open(config: CacheConfig) -> Result<Self> {
        let store = DiskEntryStore::new(config.fs, config.directory);
        let recovered = RecoveryManager::new(&store, config.max_size).recover()?;
        Ok(Self {
            store,
            coordinator: EditCoordinator::new(config.edit_mode),
            compaction: config.compaction,
            state: Mutex::new(State {
                index: recovered.index,
                journal: Some(recovered.journal),
                dirty: FxHashMap::default(),
                next_sequence: recovered.next_sequence,
                journal_broken: false,
                closing: false,
            }),
            edits_finished: Condvar::new(),
            stats: StatsCounters::default(),
            recovery: recovered.report,
        })
    }

    fn begin_edit(self: &Arc<Self>, key: &str) -> Result<Editor> {
        encode_key(key)?;
        self.state.lock().ensure_accepting_edits()?;
        let lease = self.coordinator.lease(key)?;

        let (sequence, budget) = {
            let mut state = self.state.lock();
            state.ensure_accepting_edits()?;
            let sequence = state.next_sequence;
            state.next_sequence += 1;
            state.record(&JournalRecord::BeginEdit {
                key: key.to_owned(),
            })?;
            state.dirty.insert(key.to_owned(), sequence);
            (sequence, state.index.max_size())
        };

        match self.store.begin_edit(key) {
            Ok((temp, writer)) => {
                tracing::debug!(key = %key, sequence, "began edit");
                Ok(Editor::new(
                    Arc::clone(self),
                    key.to_owned(),
                    sequence,
                    budget,
                    temp,
                    writer,
                    lease,
                ))
            },
            Err(e) => {
                self.cancel_edit(key, None);
                Err(e)
            },
        }
    }

    pub(crate) fn max_size(&self) -> u64 {
        self.state.lock().index.max_size()
    }

    /// Abandons the in-flight edit of `key`.
    pub(crate) fn cancel_edit(&self, key: &str, temp: Option<&Path>) {
        let mut state = self.state.lock();
        self.abandon(&mut state, key, temp);
    }

    fn abandon(&self, state: &mut State, key: &str, temp: Option<&Path>) {
        if let Some(temp) = temp {
            self.store.discard(temp);
        }
        let cancel = JournalRecord::Cancel {
            key: key.to_owned(),
        };
        if let Err(e) = state.record(&cancel) {
            tracing::warn!(key = %key, error = %e, "failed to journal cancelled edit");
        }
        state.dirty.remove(key);
        self.stats.inc_abort();
        tracing::debug!(key = %key, "aborted edit");
        self.edits_finished.notify_all();
    }

    /// Publishes a synced temp artifact. Runs with the key lease held.
    pub(crate) fn commit_edit(&self, key: &str, sequence: u64, temp: &Path) -> Result<()> {
        let size = match self.store.temp_size(temp) {
            Ok(size) => size,
            Err(e) => {
                self.cancel_edit(key, Some(temp));
                return Err(CacheError::commit(key, e));
            },
        };

        let mut state = self.state.lock();
        let max_size = state.index.max_size();
        if size > max_size {
            self.abandon(&mut state, key, Some(temp));
            return Err(CacheError::EntryTooLarge { size, max_size });
        }

        let size = match self.store.commit(key, temp) {
            Ok((_, size)) => size,
            Err(e) => {
                self.abandon(&mut state, key, None);
                return Err(CacheError::commit(key, e));
            },
        };

        let commit = JournalRecord::Commit {
            key: key.to_owned(),
            size,
            sequence,
        };
        if let Err(e) = state.record(&commit) {
            // The clean artifact already holds the new bytes but the journal
            // does not say so; forget the key entirely.
            state.index.remove(key);
            if let Err(e) = self.store.delete_clean(key) {
                tracing::warn!(key = %key, error = %e, "failed to delete unjournaled artifact");
            }
            state.dirty.remove(key);
            self.stats.inc_abort();
            self.edits_finished.notify_all();
            self.maybe_compact(&mut state);
            return Err(CacheError::commit(key, e));
        }

        let mut evicted = Vec::new();
        let meta = EntryMeta { size, sequence };
        if state
            .index
            .put(key.to_owned(), meta, |k, _| evicted.push(k))
            .is_err()
        {
            evicted.push(key.to_owned());
        }
        state.dirty.remove(key);
        self.stats.inc_commit();
        tracing::debug!(key = %key, size, sequence, "committed entry");

        self.evict(&mut state, evicted);
        self.maybe_compact(&mut state);
        self.edits_finished.notify_all();
        Ok(())
    }

    /// Deletes artifacts of entries already removed from the index and
    /// journals their removal.
    fn delete_entries(&self, state: &mut State, keys: &[String]) {
        if keys.is_empty() {
            return;
        }
        for key in keys {
            if let Err(e) = self.store.delete_clean(key) {
                tracing::warn!(key = %key, error = %e, "failed to delete artifact");
            }
            state.record_buffered(&JournalRecord::Remove { key: key.clone() });
        }
        state.sync_journal();
    }

    fn evict(&self, state: &mut State, evicted: Vec<String>) {
        if evicted.is_empty() {
            return;
        }
        for key in &evicted {
            tracing::debug!(key = %key, "evicted entry");
        }
        self.delete_entries(state, &evicted);
        self.stats.add_evictions(evicted.len() as u64);
    }

    fn maybe_compact(&self, state: &mut State) {
        let Some(journal) = state.journal.as_ref() else {
            return;
        };
        let live = state.index.len() + state.dirty.len();
        if !state.journal_broken && !self.compaction.should_compact(journal.record_count(), live)
        {
            return;
        }
        if let Err(e) = self.compact_locked(state) {
            tracing::warn!(error = %e, "journal compaction failed");
        }
    }

    /// Rewrites the journal as one `Commit` per entry plus one `BeginEdit`
    /// per in-flight edit.
    fn compact_locked(&self, state: &mut State) -> Result<()> {
        let State {
            index,
            journal,
            dirty,
            journal_broken,
            ..
        } = state;
        let journal = journal.as_mut().ok_or(CacheError::Closed)?;
        let commits = index.iter().map(|(key, meta)| JournalRecord::Commit {
            key: key.clone(),
            size: meta.size,
            sequence: meta.sequence,
        });
        let pending = dirty
            .keys()
            .map(|key| JournalRecord::BeginEdit { key: key.clone() });
        if let Err(e) = journal.compact(commits.chain(pending)) {
            // The swap may have happened with the writer left on the old file.
            *journal_broken = true;
            return Err(e.into());
        }
        *journal_broken = false;
        self.stats.inc_compaction();
        Ok(())
    }

    fn flush_locked(&self, state: &mut State) -> Result<()> {
        state.ensure_open()?;
        if state.journal_broken {
            return self.compact_locked(state);
        }
        if let Some(journal) = state.journal.as_mut()
            && journal.has_unsynced()
        {
            journal.sync()?;
        }
        self.maybe_compact(state);
        Ok(())
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        if let Some(journal) = self.state.get_mut().journal.as_mut()
            && journal.has_unsynced()
            && let Err(e) = journal.sync()
        {
            tracing::warn!(error = %e, "journal sync on drop failed");
        }
    }
}

/// Journal-backed disk LRU cache.
///
/// Values are byte blobs keyed by non-empty strings. The cache keeps the sum
/// of all value sizes at or below `max_size` by deleting least recently used
/// entries, and reopening the same directory after a crash restores every
/// committed entry.
///
/// While a key is being edited its committed value is hidden from
/// [`get`](Self::get), [`keys`](Self::keys) and [`len`](Self::len), but its
/// bytes stay on disk and still count toward [`size`](Self::size) until the
/// edit commits or aborts.
///
/// ```no_run
/// use std::io::{Read, Write};
///
/// use blobcache::DiskCache;
///
/// # fn main() -> blobcache::Result<()> {
/// let cache = DiskCache::open("/var/cache/app", 10 * 1024 * 1024)?;
///
/// let mut editor = cache.edit("avatar/7")?;
/// editor.write_all(b"png")?;
/// editor.commit()?;
///
/// if let Some(mut handle) = cache.get("avatar/7")? {
///     let mut bytes = Vec::new();
///     handle.read_to_end(&mut bytes)?;
///     assert_eq!(bytes, b"png");
/// }
/// cache.close()?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct DiskCache {
    shared: Arc<Shared>,
}

impl DiskCache {
    /// Opens (or creates) the cache in `directory` with default settings.
    pub fn open(directory: impl Into<PathBuf>, max_size: u64) -> Result<Self> {
        DiskCacheBuilder::new(directory, max_size).try_open()
    }

    /// Creates a [`DiskCacheBuilder`] for non-default settings.
    pub fn builder(directory: impl Into<PathBuf>, max_size: u64) -> DiskCacheBuilder {
        DiskCacheBuilder::new(directory, max_size)
    }

    pub(crate) fn with_config(config: CacheConfig) -> Result<Self> {
        Ok(Self {
            shared: Arc::new(Shared::open(config)?),
        })
    }

    pub fn directory(&self) -> &Path {
        self.shared.store.directory()
    }

    /// What recovery did when this cache was opened.
    pub fn recovery_report(&self) -> &RecoveryReport {
        &self.shared.recovery
    }

    /// Returns a read handle for `key`, or `None` if it is absent or being
    /// edited. A hit makes `key` the most recently used entry.
    pub fn get(&self, key: &str) -> Result<Option<ReadHandle>> {
        encode_key(key)?;
        let shared = &self.shared;
        let mut state = shared.state.lock();
        state.ensure_open()?;

        if state.dirty.contains_key(key) {
            shared.stats.inc_miss();
            return Ok(None);
        }
        let Some(meta) = state.index.peek(key).copied() else {
            shared.stats.inc_miss();
            return Ok(None);
        };

        let reader = match shared.store.open_clean(key) {
            Ok(reader) => reader,
            Err(CacheError::Io(e)) if e.kind() == io::ErrorKind::NotFound => {
                tracing::warn!(key = %key, "artifact vanished; dropping entry");
                state.index.remove(key);
                shared.delete_entries(&mut state, &[key.to_owned()]);
                shared.stats.inc_miss();
                return Ok(None);
            },
            Err(e) => return Err(e),
        };

        state.index.touch(key);
        state.record_buffered(&JournalRecord::Read {
            key: key.to_owned(),
        });
        shared.maybe_compact(&mut state);
        shared.stats.inc_hit();
        Ok(Some(ReadHandle {
            key: key.to_owned(),
            size: meta.size,
            reader,
        }))
    }

    /// Reads the whole value of `key`.
    pub fn get_bytes(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match self.get(key)? {
            Some(handle) => Ok(Some(handle.into_bytes()?)),
            None => Ok(None),
        }
    }

    /// Starts an edit of `key`.
    ///
    /// Fails with [`CacheError::Busy`] if another edit of `key` is in flight
    /// and the cache was built with [`EditMode::FailFast`]; waits for it with
    /// [`EditMode::Block`].
    pub fn edit(&self, key: &str) -> Result<Editor> {
        self.shared.begin_edit(key)
    }

    /// Writes a value through `write` and commits it.
    ///
    /// If `write` fails the edit is aborted and its error returned.
    pub fn put<F>(&self, key: &str, write: F) -> Result<()>
    where
        F: FnOnce(&mut Editor) -> io::Result<()>,
    {
        let mut editor = self.edit(key)?;
        if let Err(e) = write(&mut editor) {
            editor.abort();
            return Err(CacheError::Io(e));
        }
        editor.commit()
    }

    /// Deletes `key`.
    pub fn remove(&self, key: &str) -> Result<()> {
        encode_key(key)?;
        let shared = &self.shared;
        let mut state = shared.state.lock();
        state.ensure_open()?;
        if state.dirty.contains_key(key) {
            return Err(CacheError::busy(key));
        }
        if state.index.remove(key).is_none() {
            return Err(CacheError::not_found(key));
        }
        shared.delete_entries(&mut state, &[key.to_owned()]);
        shared.stats.inc_remove();
        tracing::debug!(key = %key, "removed entry");
        shared.maybe_compact(&mut state);
        Ok(())
    }

    /// Removes every entry that is not being edited. Returns how many.
    pub fn clear(&self) -> Result<usize> {
        let shared = &self.shared;
        let mut state = shared.state.lock();
        state.ensure_open()?;
        let keys = state.visible_keys();
        for key in &keys {
            state.index.remove(key);
            shared.stats.inc_remove();
        }
        shared.delete_entries(&mut state, &keys);
        shared.maybe_compact(&mut state);
        tracing::debug!(removed = keys.len(), "cleared cache");
        Ok(keys.len())
    }

    /// Returns `true` if `key` has a readable value. Does not touch recency.
    pub fn contains_key(&self, key: &str) -> bool {
        self.shared.state.lock().is_visible(key)
    }

    /// Readable keys from least to most recently used.
    pub fn keys(&self) -> Vec<String> {
        self.shared.state.lock().visible_keys()
    }

    /// Keys with an edit in flight, sorted.
    pub fn keys_under_edit(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.shared.state.lock().dirty.keys().cloned().collect();
        keys.sort_unstable();
        keys
    }

    /// Number of readable entries.
    pub fn len(&self) -> usize {
        let state = self.shared.state.lock();
        state
            .index
            .iter()
            .filter(|(key, _)| !state.dirty.contains_key(key.as_str()))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total bytes of committed entries, including ones whose key is
    /// currently being edited.
    pub fn size(&self) -> u64 {
        self.shared.state.lock().index.current_size()
    }

    pub fn max_size(&self) -> u64 {
        self.shared.max_size()
    }

    /// Changes the byte budget, evicting immediately if it shrank.
    pub fn resize(&self, max_size: u64) -> Result<()> {
        if max_size == 0 {
            return Err(ConfigError::new("max_size must be > 0").into());
        }
        let shared = &self.shared;
        let mut state = shared.state.lock();
        state.ensure_open()?;
        let mut evicted = Vec::new();
        state.index.set_max_size(max_size, |k, _| evicted.push(k));
        tracing::info!(max_size, evicted = evicted.len(), "resized cache");
        shared.evict(&mut state, evicted);
        shared.maybe_compact(&mut state);
        Ok(())
    }

    /// Makes every journal record durable, compacting if due.
    pub fn flush(&self) -> Result<()> {
        let mut state = self.shared.state.lock();
        self.shared.flush_locked(&mut state)
    }

    /// Rewrites the journal immediately instead of waiting for the
    /// compaction threshold.
    pub fn compact(&self) -> Result<()> {
        let mut state = self.shared.state.lock();
        state.ensure_open()?;
        self.shared.compact_locked(&mut state)
    }

    /// Flushes and releases the journal. Waits for in-flight edits to
    /// finish; new edits fail with [`CacheError::Closed`] meanwhile.
    ///
    /// Calling this while the same thread holds an [`Editor`] deadlocks.
    /// Closing twice is a no-op.
    pub fn close(&self) -> Result<()> {
        let shared = &self.shared;
        let mut state = shared.state.lock();
        if state.journal.is_none() {
            return Ok(());
        }
        state.closing = true;
        while !state.dirty.is_empty() {
            shared.edits_finished.wait(&mut state);
        }
        let flushed = shared.flush_locked(&mut state);
        state.journal = None;
        tracing::info!(
            directory = %shared.store.directory().display(),
            entries = state.index.len(),
            size = state.index.current_size(),
            "closed disk cache"
        );
        flushed
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().journal.is_none()
    }

    pub fn stats(&self) -> CacheStats {
        self.shared.stats.snapshot()
    }

    #[cfg(any(test, debug_assertions))]
    pub fn debug_validate_invariants(&self) {
        let state = self.shared.state.lock();
        state.index.debug_validate_invariants();
        assert!(state.index.current_size() <= state.index.max_size());
    }
}

impl fmt::Debug for DiskCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("DiskCache")
            .field("directory", &self.shared.store.directory())
            .field("entries", &state.index.len())
            .field("size", &state.index.current_size())
            .field("max_size", &state.index.max_size())
            .field("editing", &state.dirty.len())
            .field("closed", &state.journal.is_none())
            .finish()
    }
}

/// Open handle to a committed value.
///
/// The handle stays readable even if the entry is replaced, removed or
/// evicted after it was returned.
pub struct ReadHandle {
    key: String,
    size: u64,
    reader: Box<dyn Read + Send>,
}

impl ReadHandle {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Size of the value in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Reads the remaining bytes of the value.
    pub fn into_bytes(mut self) -> io::Result<Vec<u8>> {
        let mut bytes = Vec::with_capacity(usize::try_from(self.size).unwrap_or(0));
        self.reader.read_to_end(&mut bytes)?;
        Ok(bytes)
    }
}

impl Read for ReadHandle {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.reader.read(buf)
    }
}

impl fmt::Debug for ReadHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadHandle")
            .field("key", &self.key)
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}
