//! Edit coordination: one writer per key.
//!
//! [`EditCoordinator`] hands out a [`KeyLease`] per key. Leases are backed by
//! a map from key to a reference-counted slot; the slot is dropped from the
//! map as soon as nobody holds or waits on it, so the map only ever contains
//! keys with live edits.
//!
//! [`Editor`] is the caller-facing write handle. It implements
//! [`io::Write`] against the key's temp artifact and finishes with
//! [`Editor::commit`] or [`Editor::abort`]. Dropping an editor without
//! committing aborts it.
//!
//! Lock order is always key lease first, then the cache's global state
//! lock. The lease is released last, after the journal and the index have
//! been updated.

use std::fmt;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashMap;

use crate::cache::Shared;
use crate::error::{CacheError, Result};
use crate::fs::SyncWrite;

/// What [`DiskCache::edit`](crate::DiskCache::edit) does when the key is
/// already being edited.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EditMode {
    /// Return [`CacheError::Busy`] immediately.
    #[default]
    FailFast,
    /// Wait until the current editor commits or aborts.
    Block,
}

#[derive(Debug, Default)]
struct KeySlot {
    held: Mutex<bool>,
    released: Condvar,
}

type SlotMap = Mutex<FxHashMap<String, Arc<KeySlot>>>;

/// Per-key mutual exclusion for edits.
#[derive(Debug)]
pub(crate) struct EditCoordinator {
    mode: EditMode,
    slots: Arc<SlotMap>,
}

impl EditCoordinator {
    pub(crate) fn new(mode: EditMode) -> Self {
        Self {
            mode,
            slots: Arc::default(),
        }
    }

    /// Acquires the lease for `key`, failing with `Busy` or waiting
    /// according to the configured [`EditMode`].
    pub(crate) fn lease(&self, key: &str) -> Result<KeyLease> {
        let slot = Arc::clone(self.slots.lock().entry(key.to_owned()).or_default());

        let acquired = {
            let mut held = slot.held.lock();
            match self.mode {
                EditMode::FailFast if *held => false,
                EditMode::FailFast => {
                    *held = true;
                    true
                },
                EditMode::Block => {
                    while *held {
                        slot.released.wait(&mut held);
                    }
                    *held = true;
                    true
                },
            }
        };

        if acquired {
            Ok(KeyLease {
                slots: Arc::clone(&self.slots),
                key: key.to_owned(),
                slot: Some(slot),
            })
        } else {
            drop(slot);
            prune(&self.slots, key);
            Err(CacheError::busy(key))
        }
    }

    /// Number of keys with a live slot.
    #[cfg(test)]
    fn tracked_keys(&self) -> usize {
        self.slots.lock().len()
    }
}

fn prune(slots: &SlotMap, key: &str) {
    let mut slots = slots.lock();
    if slots.get(key).is_some_and(|slot| Arc::strong_count(slot) == 1) {
        slots.remove(key);
    }
}

/// Exclusive right to edit one key. Released on drop.
pub(crate) struct KeyLease {
    slots: Arc<SlotMap>,
    key: String,
    slot: Option<Arc<KeySlot>>,
}

impl Drop for KeyLease {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            *slot.held.lock() = false;
            slot.released.notify_one();
            drop(slot);
            prune(&self.slots, &self.key);
        }
    }
}

impl fmt::Debug for KeyLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyLease").field("key", &self.key).finish()
    }
}

/// Write handle for one in-progress edit.
///
/// Bytes written go to a temp artifact that no reader can see. Nothing is
/// published until [`commit`](Self::commit) returns `Ok`.
///
/// ```no_run
/// use std::io::Write;
///
/// # fn main() -> blobcache::Result<()> {
/// let cache = blobcache::DiskCache::open("/tmp/thumbs", 64 * 1024 * 1024)?;
/// let mut editor = cache.edit("thumb/42")?;
/// editor.write_all(b"...png bytes...")?;
/// editor.commit()?;
/// # Ok(())
/// # }
/// ```
pub struct Editor {
    shared: Arc<Shared>,
    key: String,
    sequence: u64,
    temp: PathBuf,
    writer: Option<BufWriter<Box<dyn SyncWrite>>>,
    written: u64,
    /// Largest value the cache accepted when last checked.
    budget: u64,
    /// Bytes past `budget` were offered and dropped.
    overflowed: bool,
    finished: bool,
    // Dropped after `Drop::drop` has finished the edit.
    _lease: KeyLease,
}

impl Editor {
    pub(crate) fn new(
        shared: Arc<Shared>,
        key: String,
        sequence: u64,
        budget: u64,
        temp: PathBuf,
        writer: Box<dyn SyncWrite>,
        lease: KeyLease,
    ) -> Self {
        Self {
            shared,
            key,
            sequence,
            temp,
            writer: Some(BufWriter::new(writer)),
            written: 0,
            budget,
            overflowed: false,
            finished: false,
            _lease: lease,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Edit sequence number assigned when the edit began.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Bytes offered through [`Write`] so far, including any that were
    /// dropped because the value outgrew the cache.
    pub fn bytes_written(&self) -> u64 {
        self.written
    }

    /// Publishes the written bytes as the new value of the key.
    ///
    /// On error the edit is aborted and the previous value of the key, if
    /// any, is still readable. A value larger than the cache fails with
    /// [`CacheError::EntryTooLarge`] without syncing anything.
    pub fn commit(mut self) -> Result<()> {
        self.finished = true;
        let Some(mut writer) = self.writer.take() else {
            return Err(CacheError::commit(&self.key, io::Error::other("writer already closed")));
        };

        if self.overflowed {
            drop(writer);
            self.shared.cancel_edit(&self.key, Some(&self.temp));
            return Err(CacheError::EntryTooLarge {
                size: self.written,
                max_size: self.budget,
            });
        }

        let synced = writer.flush().and_then(|()| writer.get_mut().sync());
        drop(writer);
        if let Err(e) = synced {
            self.shared.cancel_edit(&self.key, Some(&self.temp));
            return Err(CacheError::commit(&self.key, e));
        }

        self.shared.commit_edit(&self.key, self.sequence, &self.temp)
    }

    /// Discards the written bytes; the key keeps its previous state.
    pub fn abort(mut self) {
        self.finish_abort();
    }

    fn finish_abort(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        drop(self.writer.take());
        self.shared.cancel_edit(&self.key, Some(&self.temp));
    }
}

impl Write for Editor {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.writer.is_none() {
            return Err(io::Error::other("editor is finished"));
        }
        let offered = self.written + buf.len() as u64;
        if !self.overflowed && offered > self.budget {
            // The cache may have been resized since the edit began.
            self.budget = self.shared.max_size();
            self.overflowed = offered > self.budget;
        }
        if self.overflowed {
            self.written = offered;
            return Ok(buf.len());
        }

        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| io::Error::other("editor is finished"))?;
        let n = writer.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.writer.as_mut() {
            Some(writer) => writer.flush(),
            None => Ok(()),
        }
    }
}

impl Drop for Editor {
    fn drop(&mut self) {
        self.finish_abort();
    }
}

impl fmt::Debug for Editor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Editor")
            .field("key", &self.key)
            .field("sequence", &self.sequence)
            .field("written", &self.written)
            .field("overflowed", &self.overflowed)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Barrier;
    use std::thread;
    use std::time::Duration;

    use super::*;

    #[test]
    fn fail_fast_reports_busy_until_release() {
        let coordinator = EditCoordinator::new(EditMode::FailFast);
        let lease = coordinator.lease("k").unwrap();
        assert!(matches!(
            coordinator.lease("k"),
            Err(CacheError::Busy { ref key }) if key == "k"
        ));
        // Other keys are independent.
        let other = coordinator.lease("j").unwrap();
        drop(other);

        drop(lease);
        let again = coordinator.lease("k").unwrap();
        drop(again);
    }

    #[test]
    fn slots_are_pruned_when_unreferenced() {
        let coordinator = EditCoordinator::new(EditMode::FailFast);
        let a = coordinator.lease("a").unwrap();
        let b = coordinator.lease("b").unwrap();
        assert_eq!(coordinator.tracked_keys(), 2);
        let _ = coordinator.lease("a");
        assert_eq!(coordinator.tracked_keys(), 2);
        drop(a);
        assert_eq!(coordinator.tracked_keys(), 1);
        drop(b);
        assert_eq!(coordinator.tracked_keys(), 0);
    }

    #[test]
    fn block_mode_waits_for_release() {
        let coordinator = Arc::new(EditCoordinator::new(EditMode::Block));
        let lease = coordinator.lease("k").unwrap();
        let barrier = Arc::new(Barrier::new(2));

        let waiter = {
            let coordinator = Arc::clone(&coordinator);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                let lease = coordinator.lease("k").unwrap();
                drop(lease);
            })
        };

        barrier.wait();
        thread::sleep(Duration::from_millis(20));
        assert!(!waiter.is_finished());
        drop(lease);
        waiter.join().unwrap();
        assert_eq!(coordinator.tracked_keys(), 0);
    }
}
