//! Append-only redo log.
//!
//! The journal is the only thing recovery trusts. Every state change that
//! must survive a crash is appended here, in the order it happened, before
//! the change is made visible to readers.
//!
//! ## File format
//!
//! ```text
//!   header   ┌──────────────┬─────────────┐
//!            │ "BLOBJRNL"   │ version u32 │              12 bytes
//!            └──────────────┴─────────────┘
//!   record   ┌─────┬─────────────┬───────────────┬───────────┐
//!            │ tag │ len u32 LE  │ payload (len) │ crc32 u32 │
//!            └─────┴─────────────┴───────────────┴───────────┘
//!   payload  key_len u32 | key utf-8 [| size u64 | sequence u64]   (Commit)
//! ```
//!
//! The checksum covers `tag` and `payload`. A record cut short by end of file,
//! or a final record whose checksum fails, is a torn write from a crash and
//! replay stops in front of it. A bad checksum followed by more data is real
//! corruption and fails the replay.
//!
//! ## Compaction
//!
//! Over time the log accumulates superseded records. [`Journal::compact`]
//! writes one synthetic `Commit` per live entry (LRU first) into a side file,
//! syncs it, and renames it over the journal. A crash at any point leaves
//! either the old or the new journal in place.

use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::JournalError;
use crate::fs::{FileSystem, SyncWrite};

/// File name of the journal inside the cache directory.
pub const JOURNAL_FILE: &str = "journal";
/// Side file used while compacting.
pub const JOURNAL_COMPACT_FILE: &str = "journal.compact";

const MAGIC: &[u8; 8] = b"BLOBJRNL";
const VERSION: u32 = 1;
const HEADER_LEN: usize = MAGIC.len() + 4;
const FRAME_OVERHEAD: usize = 1 + 4 + 4;
const MAX_PAYLOAD: usize = 1 << 20;

const TAG_BEGIN_EDIT: u8 = 1;
const TAG_COMMIT: u8 = 2;
const TAG_CANCEL: u8 = 3;
const TAG_REMOVE: u8 = 4;
const TAG_READ: u8 = 5;

/// One journal entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JournalRecord {
    /// An edit started; the key is dirty until a matching commit or cancel.
    BeginEdit { key: String },
    /// An edit was published with `size` bytes under edit number `sequence`.
    Commit {
        key: String,
        size: u64,
        sequence: u64,
    },
    /// An edit was abandoned; the previous clean state stands.
    Cancel { key: String },
    /// The entry was removed or evicted.
    Remove { key: String },
    /// The entry was read; it becomes most recently used.
    Read { key: String },
}

impl JournalRecord {
    pub fn key(&self) -> &str {
        match self {
            JournalRecord::BeginEdit { key }
            | JournalRecord::Commit { key, .. }
            | JournalRecord::Cancel { key }
            | JournalRecord::Remove { key }
            | JournalRecord::Read { key } => key,
        }
    }

    fn tag(&self) -> u8 {
        match self {
            JournalRecord::BeginEdit { .. } => TAG_BEGIN_EDIT,
            JournalRecord::Commit { .. } => TAG_COMMIT,
            JournalRecord::Cancel { .. } => TAG_CANCEL,
            JournalRecord::Remove { .. } => TAG_REMOVE,
            JournalRecord::Read { .. } => TAG_READ,
        }
    }

    /// Appends the framed record to `buf`.
    fn encode_into(&self, buf: &mut Vec<u8>) {
        let key = self.key().as_bytes();
        let mut payload_len = 4 + key.len();
        if let JournalRecord::Commit { .. } = self {
            payload_len += 16;
        }

        let start = buf.len();
        buf.push(self.tag());
        buf.extend_from_slice(&(payload_len as u32).to_le_bytes());
        buf.extend_from_slice(&(key.len() as u32).to_le_bytes());
        buf.extend_from_slice(key);
        if let JournalRecord::Commit { size, sequence, .. } = self {
            buf.extend_from_slice(&size.to_le_bytes());
            buf.extend_from_slice(&sequence.to_le_bytes());
        }

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&buf[start..start + 1]);
        hasher.update(&buf[start + 5..]);
        buf.extend_from_slice(&hasher.finalize().to_le_bytes());
    }

    fn decode(tag: u8, payload: &[u8]) -> Result<Self, String> {
        let key_len = read_u32(payload, 0).ok_or("payload too short for key length")? as usize;
        let key_end = 4 + key_len;
        let key_bytes = payload.get(4..key_end).ok_or("key overruns payload")?;
        let key = std::str::from_utf8(key_bytes)
            .map_err(|_| "key is not valid UTF-8")?
            .to_owned();
        let rest = &payload[key_end..];

        let record = match tag {
            TAG_BEGIN_EDIT => JournalRecord::BeginEdit { key },
            TAG_CANCEL => JournalRecord::Cancel { key },
            TAG_REMOVE => JournalRecord::Remove { key },
            TAG_READ => JournalRecord::Read { key },
            TAG_COMMIT => {
                let size = read_u64(rest, 0).ok_or("commit missing size")?;
                let sequence = read_u64(rest, 8).ok_or("commit missing sequence")?;
                return if rest.len() == 16 {
                    Ok(JournalRecord::Commit {
                        key,
                        size,
                        sequence,
                    })
                } else {
                    Err("trailing bytes after commit".to_owned())
                };
            },
            other => return Err(format!("unknown record tag {other}")),
        };
        if rest.is_empty() {
            Ok(record)
        } else {
            Err("trailing bytes after key".to_owned())
        }
    }
}

fn read_u32(buf: &[u8], at: usize) -> Option<u32> {
    let bytes = buf.get(at..at + 4)?;
    Some(u32::from_le_bytes(bytes.try_into().ok()?))
}

fn read_u64(buf: &[u8], at: usize) -> Option<u64> {
    let bytes = buf.get(at..at + 8)?;
    Some(u64::from_le_bytes(bytes.try_into().ok()?))
}

/// Result of reading a journal from disk.
#[derive(Debug, Default)]
pub struct Replay {
    pub records: Vec<JournalRecord>,
    /// Byte length of the well-formed prefix.
    pub valid_len: u64,
    /// `true` if bytes after `valid_len` were dropped as a torn write.
    pub torn_tail: bool,
}

/// Parses a complete journal image.
pub fn parse(bytes: &[u8]) -> Result<Replay, JournalError> {
    if bytes.len() < HEADER_LEN || &bytes[..MAGIC.len()] != MAGIC {
        return Err(JournalError::corrupt(0, "bad magic"));
    }
    let version = read_u32(bytes, MAGIC.len()).unwrap_or(0);
    if version != VERSION {
        return Err(JournalError::corrupt(
            MAGIC.len() as u64,
            format!("unsupported version {version}"),
        ));
    }

    let mut replay = Replay::default();
    let mut offset = HEADER_LEN;
    while offset < bytes.len() {
        let remaining = &bytes[offset..];
        let Some(payload_len) = read_u32(remaining, 1).map(|len| len as usize) else {
            replay.torn_tail = true;
            break;
        };
        let frame_len = FRAME_OVERHEAD + payload_len;
        if payload_len > MAX_PAYLOAD || remaining.len() < frame_len {
            // Either a length field that was only partly written or a frame
            // cut off by the crash.
            if payload_len > MAX_PAYLOAD && remaining.len() >= FRAME_OVERHEAD + MAX_PAYLOAD {
                return Err(JournalError::corrupt(offset as u64, "oversized record"));
            }
            replay.torn_tail = true;
            break;
        }

        let tag = remaining[0];
        let payload = &remaining[5..5 + payload_len];
        let stored_crc = read_u32(remaining, 5 + payload_len).unwrap_or(0);
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&remaining[..1]);
        hasher.update(payload);
        if hasher.finalize() != stored_crc {
            if remaining.len() == frame_len {
                replay.torn_tail = true;
                break;
            }
            return Err(JournalError::corrupt(offset as u64, "checksum mismatch"));
        }

        let record = JournalRecord::decode(tag, payload)
            .map_err(|reason| JournalError::corrupt(offset as u64, reason))?;
        replay.records.push(record);
        offset += frame_len;
    }
    replay.valid_len = offset as u64;
    Ok(replay)
}

/// When to rewrite the journal.
///
/// Compaction runs once the record count exceeds both `min_records` and
/// `multiple` times the number of live entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactionPolicy {
    pub multiple: u64,
    pub min_records: u64,
}

impl Default for CompactionPolicy {
    fn default() -> Self {
        Self {
            multiple: 2,
            min_records: 64,
        }
    }
}

impl CompactionPolicy {
    pub fn should_compact(&self, record_count: u64, live_entries: usize) -> bool {
        let live_bound = self.multiple.saturating_mul(live_entries as u64);
        record_count > self.min_records && record_count > live_bound
    }
}

/// Open, appendable journal.
pub struct Journal {
    fs: Arc<dyn FileSystem>,
    path: PathBuf,
    writer: BufWriter<Box<dyn SyncWrite>>,
    record_count: u64,
    unsynced: bool,
    scratch: Vec<u8>,
}

impl std::fmt::Debug for Journal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Journal")
            .field("path", &self.path)
            .field("record_count", &self.record_count)
            .field("unsynced", &self.unsynced)
            .finish()
    }
}

impl Journal {
    /// Reads and parses the journal at `path` without opening it for writes.
    pub fn replay(fs: &dyn FileSystem, path: &Path) -> Result<Replay, JournalError> {
        let mut reader = match fs.open(path) {
            Ok(reader) => reader,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(JournalError::Missing(path.to_path_buf()));
            },
            Err(e) => return Err(e.into()),
        };
        let mut bytes = Vec::new();
        reader.read_to_end(&mut bytes)?;
        parse(&bytes)
    }

    /// Atomically replaces whatever is at `path` with a journal holding
    /// `records`, then opens it for appending.
    pub fn create(
        fs: Arc<dyn FileSystem>,
        path: impl Into<PathBuf>,
        records: impl IntoIterator<Item = JournalRecord>,
    ) -> Result<Self, JournalError> {
        let path = path.into();
        let record_count = write_atomically(fs.as_ref(), &path, records)?;
        let writer = fs.append(&path)?;
        Ok(Self {
            fs,
            path,
            writer: BufWriter::new(writer),
            record_count,
            unsynced: false,
            scratch: Vec::new(),
        })
    }

    /// Number of records in the file, including superseded ones.
    pub fn record_count(&self) -> u64 {
        self.record_count
    }

    /// Appends `record` and waits until it is on stable storage.
    ///
    /// Any buffered records written before it become durable too.
    pub fn append(&mut self, record: &JournalRecord) -> io::Result<()> {
        self.write_record(record)?;
        self.sync()
    }

    /// Appends `record` without forcing it to disk.
    ///
    /// Used for `Read` records: losing them in a crash only loses recency
    /// information, never data.
    pub fn append_buffered(&mut self, record: &JournalRecord) -> io::Result<()> {
        self.write_record(record)?;
        self.unsynced = true;
        Ok(())
    }

    /// Flushes buffered records and syncs the file.
    pub fn sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_mut().sync()?;
        self.unsynced = false;
        Ok(())
    }

    /// Returns `true` if buffered records have not been synced yet.
    pub fn has_unsynced(&self) -> bool {
        self.unsynced
    }

    /// Replaces the journal with `records`.
    ///
    /// Callers pass one `Commit` per live entry, LRU first, followed by a
    /// `BeginEdit` for every edit still in flight.
    pub fn compact(
        &mut self,
        records: impl IntoIterator<Item = JournalRecord>,
    ) -> Result<(), JournalError> {
        // The old writer may be the broken one; its flush error is not fatal.
        if let Err(e) = self.writer.flush() {
            tracing::warn!(path = %self.path.display(), error = %e, "journal flush before compaction failed");
        }
        self.record_count = write_atomically(self.fs.as_ref(), &self.path, records)?;
        self.writer = BufWriter::new(self.fs.append(&self.path)?);
        self.unsynced = false;
        tracing::info!(
            path = %self.path.display(),
            records = self.record_count,
            "compacted journal"
        );
        Ok(())
    }

    fn write_record(&mut self, record: &JournalRecord) -> io::Result<()> {
        self.scratch.clear();
        record.encode_into(&mut self.scratch);
        self.writer.write_all(&self.scratch)?;
        self.record_count += 1;
        Ok(())
    }
}

/// Writes `records` to the side file next to `path`, syncs it, and renames it
/// into place. Returns the number of records written.
fn write_atomically(
    fs: &dyn FileSystem,
    path: &Path,
    records: impl IntoIterator<Item = JournalRecord>,
) -> Result<u64, JournalError> {
    let side = path.with_file_name(JOURNAL_COMPACT_FILE);
    let mut buf = Vec::with_capacity(HEADER_LEN);
    buf.extend_from_slice(MAGIC);
    buf.extend_from_slice(&VERSION.to_le_bytes());
    let mut count = 0u64;
    for record in records {
        record.encode_into(&mut buf);
        count += 1;
    }

    let result = (|| -> io::Result<()> {
        let mut writer = fs.create(&side)?;
        writer.write_all(&buf)?;
        writer.sync()?;
        drop(writer);
        fs.rename(&side, path)
    })();

    if let Err(e) = result {
        let _ = fs.delete(&side);
        return Err(e.into());
    }
    // The new journal is already in place; a failed directory sync only
    // weakens durability of the rename itself.
    if let Some(dir) = path.parent()
        && let Err(e) = fs.sync_dir(dir)
    {
        tracing::warn!(dir = %dir.display(), error = %e, "directory sync after journal swap failed");
    }
    Ok(count)
}
