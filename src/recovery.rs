//! Startup recovery.
//!
//! Rebuilds the clean-entry index from the journal, then makes the directory
//! agree with it:
//!
//! 1. Replay: `BeginEdit` marks a key pending, `Commit` makes it clean at the
//!    MRU end, `Cancel` clears the pending mark, `Remove` forgets the key and
//!    `Read` moves it to the MRU end.
//! 2. Keys still pending at the end of the log are dropped with all of their
//!    artifacts; a crash could have left either version on disk.
//! 3. Clean entries whose artifact is missing are dropped. Sizes are taken
//!    from the artifacts.
//! 4. Temp files, compaction leftovers and stray files are deleted.
//! 5. The index is trimmed to the byte budget and a fresh journal is written.
//!
//! A missing or corrupt journal is not fatal: every well-formed clean
//! artifact is adopted in directory listing order instead.

use rustc_hash::{FxHashMap, FxHashSet};

use crate::ds::ordered_index::{InsertionOrder, OrderedIndex};
use crate::error::{CacheError, JournalError, Result};
use crate::journal::{Journal, JournalRecord};
use crate::lru::CacheCore;
use crate::store::{Artifact, DiskEntryStore, EntryMeta, entry_size};

/// Clean-entry index used by the running cache.
pub(crate) type EntryIndex = CacheCore<String, EntryMeta, fn(&EntryMeta) -> u64>;

/// What recovery found and fixed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub records_replayed: usize,
    /// The journal was missing or corrupt and a directory scan was used.
    pub fell_back_to_scan: bool,
    pub torn_tail: bool,
    pub entries: usize,
    pub dropped_pending: usize,
    pub dropped_missing: usize,
    pub resized: usize,
    pub orphans_deleted: usize,
    pub evicted: usize,
}

pub(crate) struct Recovered {
    pub(crate) index: EntryIndex,
    pub(crate) journal: Journal,
    pub(crate) next_sequence: u64,
    pub(crate) report: RecoveryReport,
}

/// Replayed journal state before it is checked against the directory.
#[derive(Default)]
struct Replayed {
    entries: OrderedIndex<String, EntryMeta, InsertionOrder>,
    pending: FxHashSet<String>,
    max_sequence: u64,
}

impl Replayed {
    fn apply(&mut self, record: JournalRecord) {
        match record {
            JournalRecord::BeginEdit { key } => {
                self.pending.insert(key);
            },
            JournalRecord::Commit {
                key,
                size,
                sequence,
            } => {
                self.pending.remove(&key);
                self.max_sequence = self.max_sequence.max(sequence);
                self.entries.put(key.clone(), EntryMeta { size, sequence });
                self.entries.touch(&key);
            },
            JournalRecord::Cancel { key } => {
                self.pending.remove(&key);
            },
            JournalRecord::Remove { key } => {
                self.pending.remove(&key);
                self.entries.remove(&key);
            },
            JournalRecord::Read { key } => {
                self.entries.touch(&key);
            },
        }
    }
}

pub(crate) struct RecoveryManager<'a> {
    store: &'a DiskEntryStore,
    max_size: u64,
}

impl<'a> RecoveryManager<'a> {
    pub(crate) fn new(store: &'a DiskEntryStore, max_size: u64) -> Self {
        Self { store, max_size }
    }

    pub(crate) fn recover(&self) -> Result<Recovered> {
        self.store.ensure_directory()?;
        let listing = self.store.list_artifacts()?;
        let mut report = RecoveryReport::default();

        let journal_path = self.store.journal_path();
        let replayed = match Journal::replay(self.store.fs().as_ref(), &journal_path) {
            Ok(replay) => {
                report.records_replayed = replay.records.len();
                report.torn_tail = replay.torn_tail;
                if replay.torn_tail {
                    tracing::warn!(
                        directory = %self.store.directory().display(),
                        valid_len = replay.valid_len,
                        "journal ends in a torn record; ignoring it"
                    );
                }
                let mut replayed = Replayed::default();
                for record in replay.records {
                    replayed.apply(record);
                }
                self.reconcile(replayed, &listing, &mut report)
            },
            Err(JournalError::Io(e)) => return Err(CacheError::Io(e)),
            Err(err) => {
                let has_artifacts = listing
                    .iter()
                    .any(|(_, artifact)| !matches!(artifact, Artifact::Other));
                if let JournalError::Missing(_) = err
                    && !has_artifacts
                {
                    tracing::debug!(directory = %self.store.directory().display(), "starting empty cache");
                } else {
                    tracing::warn!(
                        directory = %self.store.directory().display(),
                        error = %err,
                        "journal unusable; rebuilding from directory scan"
                    );
                    report.fell_back_to_scan = true;
                }
                self.scan(&listing, &mut report)
            },
        };

        let mut index: EntryIndex =
            CacheCore::new(self.max_size, entry_size as fn(&EntryMeta) -> u64);
        let mut evicted = Vec::new();
        for (key, meta) in replayed.entries.iter() {
            if let Err(too_large) = index.put(key.clone(), *meta, |k, _| evicted.push(k)) {
                tracing::warn!(key = %key, size = too_large.size, "entry exceeds cache size; dropping");
                evicted.push(key.clone());
            }
        }
        for key in &evicted {
            if let Err(e) = self.store.delete_clean(key) {
                tracing::warn!(key = %key, error = %e, "failed to delete evicted artifact");
            }
        }
        report.evicted = evicted.len();
        report.entries = index.len();

        let records = index.iter().map(|(key, meta)| JournalRecord::Commit {
            key: key.clone(),
            size: meta.size,
            sequence: meta.sequence,
        });
        let journal = Journal::create(self.store.fs().clone(), journal_path, records)?;

        tracing::info!(
            directory = %self.store.directory().display(),
            entries = report.entries,
            size = index.current_size(),
            replayed = report.records_replayed,
            fell_back = report.fell_back_to_scan,
            orphans = report.orphans_deleted,
            evicted = report.evicted,
            "recovered disk cache"
        );

        Ok(Recovered {
            index,
            journal,
            next_sequence: replayed.max_sequence + 1,
            report,
        })
    }

    fn reconcile(
        &self,
        mut replayed: Replayed,
        listing: &[(String, Artifact)],
        report: &mut RecoveryReport,
    ) -> Replayed {
        // The sweep below deletes their artifacts.
        for key in std::mem::take(&mut replayed.pending) {
            tracing::warn!(key = %key, "dropping entry with unfinished edit");
            replayed.entries.remove(&key);
            report.dropped_pending += 1;
        }

        let on_disk: FxHashMap<&str, &str> = listing
            .iter()
            .filter_map(|(name, artifact)| match artifact {
                Artifact::Clean(key) => Some((key.as_str(), name.as_str())),
                _ => None,
            })
            .collect();

        let keys: Vec<String> = replayed.entries.keys().cloned().collect();
        for key in keys {
            let Some(name) = on_disk.get(key.as_str()) else {
                tracing::warn!(key = %key, "artifact missing; dropping entry");
                replayed.entries.remove(&key);
                report.dropped_missing += 1;
                continue;
            };
            match self.store.size_named(name) {
                Ok(actual) => {
                    if let Some(meta) = replayed.entries.peek_mut(&key)
                        && meta.size != actual
                    {
                        tracing::warn!(
                            key = %key,
                            recorded = meta.size,
                            actual,
                            "artifact size differs from journal; using artifact size"
                        );
                        meta.size = actual;
                        report.resized += 1;
                    }
                },
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "artifact unreadable; dropping entry");
                    replayed.entries.remove(&key);
                    report.dropped_missing += 1;
                },
            }
        }

        self.sweep(listing, |key| replayed.entries.contains_key(key), report);
        replayed
    }

    fn scan(&self, listing: &[(String, Artifact)], report: &mut RecoveryReport) -> Replayed {
        let mut replayed = Replayed::default();
        for (name, artifact) in listing {
            let Artifact::Clean(key) = artifact else {
                continue;
            };
            match self.store.size_named(name) {
                Ok(size) => {
                    replayed
                        .entries
                        .put(key.clone(), EntryMeta { size, sequence: 0 });
                },
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "skipping unreadable artifact");
                },
            }
        }
        self.sweep(listing, |key| replayed.entries.contains_key(key), report);
        replayed
    }

    /// Deletes every file that is not the journal or a live clean artifact.
    fn sweep(
        &self,
        listing: &[(String, Artifact)],
        is_live: impl Fn(&str) -> bool,
        report: &mut RecoveryReport,
    ) {
        for (name, artifact) in listing {
            let stale = match artifact {
                Artifact::Journal => false,
                Artifact::Clean(key) => !is_live(key),
                Artifact::JournalSide | Artifact::Temp(_) | Artifact::Other => true,
            };
            if !stale {
                continue;
            }
            if self.store.is_dir_named(name) {
                tracing::warn!(name = %name, "leaving unexpected directory in cache directory");
                continue;
            }
            match self.store.delete_named(name) {
                Ok(()) => report.orphans_deleted += 1,
                Err(e) => tracing::warn!(name = %name, error = %e, "failed to delete orphan"),
            }
        }
        if report.orphans_deleted > 0 {
            tracing::warn!(
                directory = %self.store.directory().display(),
                count = report.orphans_deleted,
                "deleted orphaned files"
            );
        }
    }
}
