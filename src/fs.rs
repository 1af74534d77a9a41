//! File-system collaborator.
//!
//! The cache never calls `std::fs` directly; it goes through a
//! [`FileSystem`] trait object injected at construction. Production code uses
//! [`StdFileSystem`]; tests substitute wrappers that inject faults (failed
//! renames, failed syncs) to exercise the abort paths.
//!
//! Contract the engine relies on:
//!
//! | Method               | Requirement                                      |
//! |----------------------|--------------------------------------------------|
//! | `rename`             | atomic when both paths are in one directory      |
//! | `delete`             | deleting a missing file succeeds                 |
//! | `list_contents`      | UTF-8 file names; `None` if the directory is gone |
//! | `SyncWrite::sync`    | returns only once data is on stable storage      |

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::Path;

/// A writable file that can be forced to stable storage.
pub trait SyncWrite: Write + Send {
    /// Flushes buffered data and waits for the device to persist it.
    fn sync(&mut self) -> io::Result<()>;
}

impl SyncWrite for File {
    fn sync(&mut self) -> io::Result<()> {
        self.flush()?;
        self.sync_all()
    }
}

/// File-system primitives used by the disk cache.
pub trait FileSystem: Send + Sync + fmt::Debug {
    fn exists(&self, path: &Path) -> bool;

    fn is_dir(&self, path: &Path) -> bool;

    /// Size in bytes of the file at `path`.
    fn size(&self, path: &Path) -> io::Result<u64>;

    /// Names of the entries in `dir`, or `None` if it does not exist.
    /// Names that are not valid UTF-8 are left out.
    fn list_contents(&self, dir: &Path) -> io::Result<Option<Vec<String>>>;

    fn delete(&self, path: &Path) -> io::Result<()>;

    fn delete_recursively(&self, path: &Path) -> io::Result<()>;

    /// Atomically replaces `to` with `from`.
    fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;

    fn create_dirs(&self, path: &Path) -> io::Result<()>;

    /// Creates (or truncates) `path` for writing.
    fn create(&self, path: &Path) -> io::Result<Box<dyn SyncWrite>>;

    /// Opens `path` for appending, creating it if needed.
    fn append(&self, path: &Path) -> io::Result<Box<dyn SyncWrite>>;

    /// Opens `path` for reading.
    fn open(&self, path: &Path) -> io::Result<Box<dyn Read + Send>>;

    /// Persists directory metadata (renames, creations) in `dir`.
    fn sync_dir(&self, _dir: &Path) -> io::Result<()> {
        Ok(())
    }
}

/// [`FileSystem`] backed by `std::fs`.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdFileSystem;

impl FileSystem for StdFileSystem {
    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn is_dir(&self, path: &Path) -> bool {
        path.is_dir()
    }

    fn size(&self, path: &Path) -> io::Result<u64> {
        Ok(fs::metadata(path)?.len())
    }

    fn list_contents(&self, dir: &Path) -> io::Result<Option<Vec<String>>> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry?;
            match entry.file_name().into_string() {
                Ok(name) => names.push(name),
                // Never one of ours, and not addressable through a `String`.
                Err(name) => {
                    tracing::warn!(dir = %dir.display(), name = ?name, "skipping non UTF-8 file name");
                },
            }
        }
        names.sort();
        Ok(Some(names))
    }

    fn delete(&self, path: &Path) -> io::Result<()> {
        match fs::remove_file(path) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }

    fn delete_recursively(&self, path: &Path) -> io::Result<()> {
        match fs::remove_dir_all(path) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        fs::rename(from, to)
    }

    fn create_dirs(&self, path: &Path) -> io::Result<()> {
        fs::create_dir_all(path)
    }

    fn create(&self, path: &Path) -> io::Result<Box<dyn SyncWrite>> {
        let file = File::create(path)?;
        Ok(Box::new(file))
    }

    fn append(&self, path: &Path) -> io::Result<Box<dyn SyncWrite>> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Box::new(file))
    }

    fn open(&self, path: &Path) -> io::Result<Box<dyn Read + Send>> {
        let file = File::open(path)?;
        Ok(Box::new(file))
    }

    #[cfg(unix)]
    fn sync_dir(&self, dir: &Path) -> io::Result<()> {
        File::open(dir)?.sync_all()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_write_sync_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let fs = StdFileSystem;
        let path = dir.path().join("blob");

        let mut writer = fs.create(&path).unwrap();
        writer.write_all(b"hello").unwrap();
        writer.sync().unwrap();
        drop(writer);

        assert!(fs.exists(&path));
        assert!(!fs.is_dir(&path));
        assert_eq!(fs.size(&path).unwrap(), 5);

        let mut contents = String::new();
        fs.open(&path).unwrap().read_to_string(&mut contents).unwrap();
        assert_eq!(contents, "hello");
    }

    #[test]
    fn append_extends_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let fs = StdFileSystem;
        let path = dir.path().join("log");

        fs.append(&path).unwrap().write_all(b"ab").unwrap();
        fs.append(&path).unwrap().write_all(b"cd").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"abcd");
    }

    #[test]
    fn list_contents_of_missing_dir_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let fs = StdFileSystem;
        assert_eq!(fs.list_contents(&dir.path().join("nope")).unwrap(), None);

        std::fs::write(dir.path().join("b"), b"").unwrap();
        std::fs::write(dir.path().join("a"), b"").unwrap();
        assert_eq!(
            fs.list_contents(dir.path()).unwrap(),
            Some(vec!["a".to_string(), "b".to_string()])
        );
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn non_utf8_names_are_not_listed() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let dir = tempfile::tempdir().unwrap();
        let fs = StdFileSystem;
        let odd = dir.path().join(OsStr::from_bytes(b"bad\xff"));
        std::fs::write(&odd, b"").unwrap();
        std::fs::write(dir.path().join("good"), b"").unwrap();

        assert_eq!(
            fs.list_contents(dir.path()).unwrap(),
            Some(vec!["good".to_string()])
        );
        assert!(odd.exists());
    }

    #[test]
    fn delete_missing_file_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let fs = StdFileSystem;
        fs.delete(&dir.path().join("ghost")).unwrap();
        fs.delete_recursively(&dir.path().join("ghost_dir")).unwrap();
    }

    #[test]
    fn rename_replaces_target() {
        let dir = tempfile::tempdir().unwrap();
        let fs = StdFileSystem;
        let from = dir.path().join("from");
        let to = dir.path().join("to");
        std::fs::write(&from, b"new").unwrap();
        std::fs::write(&to, b"old").unwrap();

        fs.rename(&from, &to).unwrap();
        assert!(!fs.exists(&from));
        assert_eq!(std::fs::read(&to).unwrap(), b"new");
        fs.sync_dir(dir.path()).unwrap();
    }
}
