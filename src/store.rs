//! On-disk artifacts for cache entries.
//!
//! Every key maps to two paths inside the cache directory:
//!
//! ```text
//!   key "img/42"  ──hex──►  696d672f3432          clean artifact (readable)
//!                           696d672f3432.tmp      temp artifact (being written)
//! ```
//!
//! Hex encoding is reversible and only produces `[0-9a-f]`, so artifact
//! names never collide with each other or with the journal files, and a
//! directory scan can recover keys without the journal.
//!
//! Publishing an edit is `sync(temp)` then `rename(temp, clean)`; the rename
//! replaces any previous clean artifact in one step.

use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{CacheError, Result};
use crate::fs::{FileSystem, SyncWrite};
use crate::journal::{JOURNAL_COMPACT_FILE, JOURNAL_FILE};

/// Suffix of artifacts that are still being written.
pub const TEMP_SUFFIX: &str = ".tmp";

/// Longest accepted key, in bytes. Its encoded temp name stays well under
/// the common 255-byte file name limit.
pub const MAX_KEY_LEN: usize = 120;

/// Metadata kept in the index for every clean entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryMeta {
    pub size: u64,
    pub sequence: u64,
}

pub(crate) fn entry_size(meta: &EntryMeta) -> u64 {
    meta.size
}

/// What a file name in the cache directory refers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Artifact {
    Journal,
    /// Leftover side file from an interrupted compaction.
    JournalSide,
    Clean(String),
    Temp(String),
    /// Anything the cache did not create.
    Other,
}

impl Artifact {
    pub fn classify(name: &str) -> Self {
        match name {
            JOURNAL_FILE => return Artifact::Journal,
            JOURNAL_COMPACT_FILE => return Artifact::JournalSide,
            _ => {},
        }
        if let Some(stem) = name.strip_suffix(TEMP_SUFFIX) {
            return decode_key(stem).map_or(Artifact::Other, Artifact::Temp);
        }
        decode_key(name).map_or(Artifact::Other, Artifact::Clean)
    }
}

/// Encodes `key` as an artifact file name.
pub fn encode_key(key: &str) -> Result<String> {
    if key.is_empty() {
        return Err(CacheError::InvalidKey("key is empty".to_owned()));
    }
    if key.len() > MAX_KEY_LEN {
        return Err(CacheError::InvalidKey(format!(
            "key is {} bytes, limit is {MAX_KEY_LEN}",
            key.len()
        )));
    }
    Ok(hex::encode(key.as_bytes()))
}

/// Inverse of [`encode_key`]; `None` for names it cannot have produced.
pub fn decode_key(name: &str) -> Option<String> {
    if name.is_empty() || name.bytes().any(|b| b.is_ascii_uppercase()) {
        return None;
    }
    let bytes = hex::decode(name).ok()?;
    let key = String::from_utf8(bytes).ok()?;
    (key.len() <= MAX_KEY_LEN).then_some(key)
}

/// Maps keys to artifact paths and moves bytes between them.
#[derive(Debug, Clone)]
pub struct DiskEntryStore {
    fs: Arc<dyn FileSystem>,
    directory: PathBuf,
}

impl DiskEntryStore {
    pub fn new(fs: Arc<dyn FileSystem>, directory: impl Into<PathBuf>) -> Self {
        Self {
            fs,
            directory: directory.into(),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn fs(&self) -> &Arc<dyn FileSystem> {
        &self.fs
    }

    pub fn journal_path(&self) -> PathBuf {
        self.directory.join(JOURNAL_FILE)
    }

    pub fn clean_path(&self, key: &str) -> Result<PathBuf> {
        Ok(self.directory.join(encode_key(key)?))
    }

    pub fn temp_path(&self, key: &str) -> Result<PathBuf> {
        let mut name = encode_key(key)?;
        name.push_str(TEMP_SUFFIX);
        Ok(self.directory.join(name))
    }

    /// Creates the cache directory if needed.
    pub fn ensure_directory(&self) -> Result<()> {
        if self.fs.exists(&self.directory) && !self.fs.is_dir(&self.directory) {
            return Err(CacheError::Io(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("{} is not a directory", self.directory.display()),
            )));
        }
        self.fs.create_dirs(&self.directory)?;
        Ok(())
    }

    /// Lists every file in the cache directory with its classification.
    pub fn list_artifacts(&self) -> Result<Vec<(String, Artifact)>> {
        let names = self.fs.list_contents(&self.directory)?.unwrap_or_default();
        Ok(names
            .into_iter()
            .map(|name| {
                let artifact = Artifact::classify(&name);
                (name, artifact)
            })
            .collect())
    }

    /// Creates (or truncates) the temp artifact for `key`.
    pub fn begin_edit(&self, key: &str) -> Result<(PathBuf, Box<dyn SyncWrite>)> {
        let temp = self.temp_path(key)?;
        let writer = self.fs.create(&temp)?;
        Ok((temp, writer))
    }

    /// Size of a fully written temp artifact.
    pub fn temp_size(&self, temp: &Path) -> io::Result<u64> {
        self.fs.size(temp)
    }

    /// Publishes `temp` as the clean artifact of `key`.
    ///
    /// The temp artifact must already be synced. On failure the temp
    /// artifact is deleted and any previous clean artifact is untouched.
    pub fn commit(&self, key: &str, temp: &Path) -> io::Result<(PathBuf, u64)> {
        let published = self.clean_path(key).map_err(io::Error::other).and_then(|clean| {
            let size = self.fs.size(temp)?;
            self.fs.rename(temp, &clean)?;
            Ok((clean, size))
        });
        match published {
            Ok(published) => {
                if let Err(e) = self.fs.sync_dir(&self.directory) {
                    tracing::warn!(key = %key, error = %e, "directory sync after commit failed");
                }
                Ok(published)
            },
            Err(e) => {
                self.discard(temp);
                Err(e)
            },
        }
    }

    /// Deletes a temp artifact. Failures are logged; recovery sweeps leftovers.
    pub fn discard(&self, temp: &Path) {
        if let Err(e) = self.fs.delete(temp) {
            tracing::warn!(path = %temp.display(), error = %e, "failed to delete temp artifact");
        }
    }

    /// Deletes the clean artifact of `key`.
    pub fn delete_clean(&self, key: &str) -> Result<()> {
        self.fs.delete(&self.clean_path(key)?)?;
        Ok(())
    }

    /// Opens the clean artifact of `key` for reading.
    pub fn open_clean(&self, key: &str) -> Result<Box<dyn Read + Send>> {
        Ok(self.fs.open(&self.clean_path(key)?)?)
    }

    /// Deletes a file in the cache directory by name.
    pub(crate) fn delete_named(&self, name: &str) -> io::Result<()> {
        self.fs.delete(&self.directory.join(name))
    }

    pub(crate) fn size_named(&self, name: &str) -> io::Result<u64> {
        self.fs.size(&self.directory.join(name))
    }

    pub(crate) fn is_dir_named(&self, name: &str) -> bool {
        self.fs.is_dir(&self.directory.join(name))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::fs::StdFileSystem;

    fn store(dir: &Path) -> DiskEntryStore {
        DiskEntryStore::new(Arc::new(StdFileSystem), dir)
    }

    #[test]
    fn key_encoding_round_trips_and_rejects_bad_keys() {
        for key in ["a", "img/42", "with space", "ünïcødé", "../../etc/passwd"] {
            let name = encode_key(key).unwrap();
            assert!(name.bytes().all(|b| b.is_ascii_hexdigit()));
            assert_eq!(decode_key(&name).as_deref(), Some(key));
        }

        assert!(matches!(encode_key(""), Err(CacheError::InvalidKey(_))));
        let long = "k".repeat(MAX_KEY_LEN + 1);
        assert!(matches!(encode_key(&long), Err(CacheError::InvalidKey(_))));
        assert!(encode_key(&"k".repeat(MAX_KEY_LEN)).is_ok());
    }

    #[test]
    fn classify_distinguishes_artifacts() {
        let clean = encode_key("k").unwrap();
        assert_eq!(Artifact::classify(&clean), Artifact::Clean("k".into()));
        assert_eq!(
            Artifact::classify(&format!("{clean}{TEMP_SUFFIX}")),
            Artifact::Temp("k".into())
        );
        assert_eq!(Artifact::classify(JOURNAL_FILE), Artifact::Journal);
        assert_eq!(
            Artifact::classify(JOURNAL_COMPACT_FILE),
            Artifact::JournalSide
        );
        assert_eq!(Artifact::classify("notes.txt"), Artifact::Other);
        assert_eq!(Artifact::classify("6B"), Artifact::Other);
        assert_eq!(Artifact::classify("abc"), Artifact::Other);
        // Valid hex but not UTF-8.
        assert_eq!(Artifact::classify("ff"), Artifact::Other);
    }

    #[test]
    fn begin_commit_publishes_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        store.ensure_directory().unwrap();

        let (temp, mut writer) = store.begin_edit("k").unwrap();
        writer.write_all(b"payload").unwrap();
        writer.sync().unwrap();
        drop(writer);
        assert_eq!(store.temp_size(&temp).unwrap(), 7);

        let (clean, size) = store.commit("k", &temp).unwrap();
        assert_eq!(size, 7);
        assert_eq!(clean, store.clean_path("k").unwrap());
        assert!(!temp.exists());

        let mut contents = Vec::new();
        store
            .open_clean("k")
            .unwrap()
            .read_to_end(&mut contents)
            .unwrap();
        assert_eq!(contents, b"payload");
    }

    #[test]
    fn commit_replaces_previous_clean_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        std::fs::write(store.clean_path("k").unwrap(), b"old").unwrap();

        let (temp, mut writer) = store.begin_edit("k").unwrap();
        writer.write_all(b"newer").unwrap();
        writer.sync().unwrap();
        drop(writer);
        let (_, size) = store.commit("k", &temp).unwrap();
        assert_eq!(size, 5);
        assert_eq!(
            std::fs::read(store.clean_path("k").unwrap()).unwrap(),
            b"newer"
        );
    }

    #[test]
    fn failed_commit_deletes_temp_and_keeps_clean() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        std::fs::write(store.clean_path("k").unwrap(), b"old").unwrap();
        let temp = store.temp_path("k").unwrap();

        // Nothing to rename: the temp was never created.
        assert!(store.commit("k", &temp).is_err());
        assert_eq!(std::fs::read(store.clean_path("k").unwrap()).unwrap(), b"old");
    }

    #[test]
    fn list_artifacts_classifies_directory() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        std::fs::write(store.clean_path("a").unwrap(), b"").unwrap();
        std::fs::write(store.temp_path("b").unwrap(), b"").unwrap();
        std::fs::write(dir.path().join("stray"), b"").unwrap();

        let mut artifacts: Vec<_> = store
            .list_artifacts()
            .unwrap()
            .into_iter()
            .map(|(_, artifact)| artifact)
            .collect();
        artifacts.sort_by_key(|a| format!("{a:?}"));
        assert_eq!(
            artifacts,
            vec![
                Artifact::Clean("a".into()),
                Artifact::Other,
                Artifact::Temp("b".into())
            ]
        );
    }

    #[test]
    fn ensure_directory_rejects_regular_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("file");
        std::fs::write(&file, b"").unwrap();
        assert!(store(&file).ensure_directory().is_err());
        store(&dir.path().join("nested/cache"))
            .ensure_directory()
            .unwrap();
    }
}
