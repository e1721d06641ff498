// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Filesystem abstraction (§6 "Env interface"). This is an external
//! collaborator per §1 — the engines only ever talk to the store through
//! this trait, never to `std::fs` directly, so a host can swap in an
//! in-memory or instrumented filesystem for testing.

use crate::Result;
use std::{
    fs::{File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

/// A sequential file open for appending, used by WAL and manifest writers.
pub trait AppendFile: Write + Send {
    fn sync(&mut self) -> Result<()>;
}

/// A file open for positioned reads, used by table/page readers.
pub trait RandomAccessFile: Send + Sync {
    fn read_at(&self, offset: u64, len: usize) -> Result<Vec<u8>>;
    fn len(&self) -> Result<u64>;
}

/// A file open for positioned reads *and* writes, used by the paged engine's
/// data file (§4.7): pages are updated in place at a caller-chosen offset,
/// unlike the append-only WAL/manifest/table-builder writers.
pub trait RandomWriteFile: Send + Sync {
    fn read_at(&self, offset: u64, len: usize) -> Result<Vec<u8>>;
    fn write_at(&self, offset: u64, data: &[u8]) -> Result<()>;
    fn len(&self) -> Result<u64>;
    fn set_len(&self, len: u64) -> Result<()>;
    fn sync(&self) -> Result<()>;
}

/// The filesystem surface the engines depend on.
///
/// `OsEnv` is the default implementation, backed by `std::fs`. Hosts may
/// substitute their own (e.g. for fault-injection testing); the engines
/// hold `Arc<dyn Env>` and never assume a particular backing store.
pub trait Env: Send + Sync {
    fn create_append_file(&self, path: &Path) -> Result<Box<dyn AppendFile>>;
    fn create_random_access_file(&self, path: &Path) -> Result<Box<dyn RandomAccessFile>>;
    fn create_random_write_file(&self, path: &Path) -> Result<Box<dyn RandomWriteFile>>;
    fn file_exists(&self, path: &Path) -> bool;
    fn delete_file(&self, path: &Path) -> Result<()>;
    fn get_children(&self, dir: &Path) -> Result<Vec<String>>;
    fn create_dir(&self, path: &Path) -> Result<()>;
    fn get_file_size(&self, path: &Path) -> Result<u64>;
    fn rename_file(&self, from: &Path, to: &Path) -> Result<()>;

    /// Reads the whole file, or `None` if it doesn't exist.
    fn read_to_string(&self, path: &Path) -> Result<Option<String>>;

    /// Atomically (write-then-rename) writes `contents` to `path`.
    fn write_atomic(&self, path: &Path, contents: &[u8]) -> Result<()>;
}

struct OsAppendFile(File);

impl Write for OsAppendFile {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.0.flush()
    }
}

impl AppendFile for OsAppendFile {
    fn sync(&mut self) -> Result<()> {
        self.0.sync_all()?;
        Ok(())
    }
}

struct OsRandomAccessFile(std::sync::Mutex<File>);

impl RandomAccessFile for OsRandomAccessFile {
    fn read_at(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        #[allow(clippy::expect_used)]
        let mut file = self.0.lock().expect("lock poisoned");
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; len];
        file.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn len(&self) -> Result<u64> {
        #[allow(clippy::expect_used)]
        let file = self.0.lock().expect("lock poisoned");
        Ok(file.metadata()?.len())
    }
}

struct OsRandomWriteFile(std::sync::Mutex<File>);

impl RandomWriteFile for OsRandomWriteFile {
    fn read_at(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        #[allow(clippy::expect_used)]
        let mut file = self.0.lock().expect("lock poisoned");
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; len];
        file.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        #[allow(clippy::expect_used)]
        let mut file = self.0.lock().expect("lock poisoned");
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        Ok(())
    }

    fn len(&self) -> Result<u64> {
        #[allow(clippy::expect_used)]
        let file = self.0.lock().expect("lock poisoned");
        Ok(file.metadata()?.len())
    }

    fn set_len(&self, len: u64) -> Result<()> {
        #[allow(clippy::expect_used)]
        let file = self.0.lock().expect("lock poisoned");
        file.set_len(len)?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        #[allow(clippy::expect_used)]
        let file = self.0.lock().expect("lock poisoned");
        file.sync_all()?;
        Ok(())
    }
}

/// The default, local-disk [`Env`].
#[derive(Debug, Default, Clone, Copy)]
pub struct OsEnv;

impl Env for OsEnv {
    fn create_append_file(&self, path: &Path) -> Result<Box<dyn AppendFile>> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(path)?;
        Ok(Box::new(OsAppendFile(file)))
    }

    fn create_random_access_file(&self, path: &Path) -> Result<Box<dyn RandomAccessFile>> {
        let file = OpenOptions::new().read(true).open(path)?;
        Ok(Box::new(OsRandomAccessFile(std::sync::Mutex::new(file))))
    }

    fn create_random_write_file(&self, path: &Path) -> Result<Box<dyn RandomWriteFile>> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(path)?;
        Ok(Box::new(OsRandomWriteFile(std::sync::Mutex::new(file))))
    }

    fn file_exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn delete_file(&self, path: &Path) -> Result<()> {
        std::fs::remove_file(path)?;
        Ok(())
    }

    fn get_children(&self, dir: &Path) -> Result<Vec<String>> {
        let mut out = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str() {
                out.push(name.to_owned());
            }
        }
        Ok(out)
    }

    fn create_dir(&self, path: &Path) -> Result<()> {
        std::fs::create_dir_all(path)?;
        Ok(())
    }

    fn get_file_size(&self, path: &Path) -> Result<u64> {
        Ok(std::fs::metadata(path)?.len())
    }

    fn rename_file(&self, from: &Path, to: &Path) -> Result<()> {
        std::fs::rename(from, to)?;
        Ok(())
    }

    fn read_to_string(&self, path: &Path) -> Result<Option<String>> {
        match std::fs::read_to_string(path) {
            Ok(s) => Ok(Some(s)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write_atomic(&self, path: &Path, contents: &[u8]) -> Result<()> {
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(contents)?;
        tmp.flush()?;
        tmp.persist(path)
            .map_err(|e| crate::Error::Io(e.error))?;
        Ok(())
    }
}

/// Advisory process lock over a DB directory's `LOCK` file.
pub struct FileLock {
    _file: File,
    path: PathBuf,
}

impl FileLock {
    pub fn acquire(dir: &Path) -> Result<Self> {
        let path = dir.join("LOCK");
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&path)?;
        Ok(Self { _file: file, path })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}
