// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The top-level `Open` facade (§6): one handle dispatching to whichever of
//! the two storage engines backs a given directory.

use crate::{
    balance,
    env::Env,
    key,
    lsm,
    merge::KvIterator,
    options::{db_path, EngineName, Options, ReadOptions, WriteOptions},
    snapshot::SnapshotHandle,
    version, Error, Result,
};
use std::{path::Path, sync::Arc};

/// The operations both storage engines expose, so callers (including this
/// module's own `Db` enum) can handle either one through a single interface
/// instead of re-deriving engine-specific call sites at every site.
pub trait Engine {
    fn put(&self, key: &[u8], value: &[u8], wo: &WriteOptions) -> Result<()>;
    fn delete(&self, key: &[u8], wo: &WriteOptions) -> Result<()>;
    fn write(&self, ops: &[(Vec<u8>, Option<Vec<u8>>)], wo: &WriteOptions) -> Result<()>;
    fn get(&self, key: &[u8], ro: &ReadOptions) -> Result<Option<Vec<u8>>>;
    fn new_iterator(&self, ro: &ReadOptions) -> Result<Box<dyn KvIterator>>;
    fn get_snapshot(&self) -> SnapshotHandle;
    fn last_version(&self) -> key::Version;
}

impl Engine for balance::Db {
    fn put(&self, key: &[u8], value: &[u8], wo: &WriteOptions) -> Result<()> {
        balance::Db::put(self, key, value, wo)
    }

    fn delete(&self, key: &[u8], wo: &WriteOptions) -> Result<()> {
        balance::Db::delete(self, key, wo)
    }

    fn write(&self, ops: &[(Vec<u8>, Option<Vec<u8>>)], wo: &WriteOptions) -> Result<()> {
        balance::Db::write(self, ops, wo)
    }

    fn get(&self, key: &[u8], ro: &ReadOptions) -> Result<Option<Vec<u8>>> {
        balance::Db::get(self, key, ro)
    }

    fn new_iterator(&self, ro: &ReadOptions) -> Result<Box<dyn KvIterator>> {
        Ok(Box::new(balance::Db::new_iterator(self, ro)))
    }

    fn get_snapshot(&self) -> SnapshotHandle {
        balance::Db::get_snapshot(self)
    }

    fn last_version(&self) -> key::Version {
        balance::Db::last_version(self)
    }
}

impl Engine for lsm::Db {
    fn put(&self, key: &[u8], value: &[u8], wo: &WriteOptions) -> Result<()> {
        lsm::Db::put(self, key, value, wo)
    }

    fn delete(&self, key: &[u8], wo: &WriteOptions) -> Result<()> {
        lsm::Db::delete(self, key, wo)
    }

    fn write(&self, ops: &[(Vec<u8>, Option<Vec<u8>>)], wo: &WriteOptions) -> Result<()> {
        lsm::Db::write(self, ops, wo)
    }

    fn get(&self, key: &[u8], ro: &ReadOptions) -> Result<Option<Vec<u8>>> {
        lsm::Db::get(self, key, ro)
    }

    fn new_iterator(&self, ro: &ReadOptions) -> Result<Box<dyn KvIterator>> {
        Ok(Box::new(lsm::Db::new_iterator(self, ro)?))
    }

    fn get_snapshot(&self) -> SnapshotHandle {
        lsm::Db::get_snapshot(self)
    }

    fn last_version(&self) -> key::Version {
        lsm::Db::last_version(self)
    }
}

/// An embedded, ordered key-value store.
///
/// Wraps either the [`balance`] (paged B+tree) or [`lsm`] (log-structured
/// merge-tree) engine behind one handle, both implementing [`Engine`]. Which
/// engine backs an *existing* directory is read off its on-disk `CURRENT`
/// marker, never re-derived from `options.engine_name` — that field only
/// chooses the engine for a directory being created for the first time (§6
/// Open).
pub enum Db {
    Balance(balance::Db),
    Lsm(lsm::Db),
}

impl Db {
    /// Opens (or creates) a store at `dir` per `options`.
    ///
    /// # Errors
    ///
    /// Returns an error if `options` fails validation, if the directory
    /// exists and `options.error_if_exists` is set, if it's missing and
    /// `options.create_if_missing` is unset, or if the engine itself fails
    /// to create/recover (I/O error, corrupt manifest, comparator mismatch).
    pub fn open(dir: impl AsRef<Path>, options: Options) -> Result<Self> {
        options.validate()?;
        let dir = db_path(dir.as_ref());
        let env = Arc::clone(&options.env);
        let current = dir.join(version::CURRENT_FILE_NAME);

        if env.file_exists(&current) {
            if options.error_if_exists {
                return Err(Error::InvalidArgument(format!(
                    "{} already exists",
                    dir.display()
                )));
            }
            log::debug!("opening existing store at {}", dir.display());
            return Self::recover(&dir, env, &options, &current);
        }

        if !options.create_if_missing {
            return Err(Error::InvalidArgument(format!(
                "{} does not exist and create_if_missing is false",
                dir.display()
            )));
        }

        env.create_dir(&dir)?;
        log::debug!(
            "creating new {:?} store at {}",
            options.engine_name,
            dir.display()
        );
        match options.engine_name {
            EngineName::Balance => Ok(Self::Balance(balance::Db::create(&dir, env, &options)?)),
            EngineName::Lsm => Ok(Self::Lsm(lsm::Db::create(&dir, env, &options)?)),
        }
    }

    /// Picks an engine for a directory that already has a `CURRENT` marker,
    /// by reading what that marker names: the balance engine writes the
    /// literal `DATA\n`, the LSM engine writes its current manifest's file
    /// name (`MANIFEST-NNNNNN\n`).
    fn recover(dir: &Path, env: Arc<dyn Env>, options: &Options, current: &Path) -> Result<Self> {
        let marker = env
            .read_to_string(current)?
            .ok_or_else(|| Error::Corruption("missing CURRENT file".into()))?;
        if marker.trim_end() == "DATA" {
            Ok(Self::Balance(balance::Db::recover(dir, env, options)?))
        } else {
            Ok(Self::Lsm(lsm::Db::recover(dir, env, options)?))
        }
    }

    /// Writes `key -> value` with default [`WriteOptions`].
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.put_opts(key, value, &WriteOptions::default())
    }

    pub fn put_opts(&self, key: &[u8], value: &[u8], wo: &WriteOptions) -> Result<()> {
        match self {
            Self::Balance(db) => Engine::put(db, key, value, wo),
            Self::Lsm(db) => Engine::put(db, key, value, wo),
        }
    }

    /// Logs a deletion tombstone for `key` with default [`WriteOptions`].
    pub fn delete(&self, key: &[u8]) -> Result<()> {
        self.delete_opts(key, &WriteOptions::default())
    }

    pub fn delete_opts(&self, key: &[u8], wo: &WriteOptions) -> Result<()> {
        match self {
            Self::Balance(db) => Engine::delete(db, key, wo),
            Self::Lsm(db) => Engine::delete(db, key, wo),
        }
    }

    /// Applies a batch of puts (`Some(value)`) and deletes (`None`) as one
    /// unit, with default [`WriteOptions`].
    pub fn write(&self, ops: &[(Vec<u8>, Option<Vec<u8>>)]) -> Result<()> {
        self.write_opts(ops, &WriteOptions::default())
    }

    pub fn write_opts(&self, ops: &[(Vec<u8>, Option<Vec<u8>>)], wo: &WriteOptions) -> Result<()> {
        match self {
            Self::Balance(db) => Engine::write(db, ops, wo),
            Self::Lsm(db) => Engine::write(db, ops, wo),
        }
    }

    /// Reads the newest live value for `key` as of the latest version, with
    /// default [`ReadOptions`].
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.get_opts(key, &ReadOptions::default())
    }

    pub fn get_opts(&self, key: &[u8], ro: &ReadOptions) -> Result<Option<Vec<u8>>> {
        match self {
            Self::Balance(db) => Engine::get(db, key, ro),
            Self::Lsm(db) => Engine::get(db, key, ro),
        }
    }

    /// Builds a cursor over every live key, with default [`ReadOptions`].
    pub fn new_iterator(&self) -> Result<Box<dyn KvIterator>> {
        self.new_iterator_opts(&ReadOptions::default())
    }

    pub fn new_iterator_opts(&self, ro: &ReadOptions) -> Result<Box<dyn KvIterator>> {
        match self {
            Self::Balance(db) => Engine::new_iterator(db, ro),
            Self::Lsm(db) => Engine::new_iterator(db, ro),
        }
    }

    /// Pins the current version so later writes don't affect what reads
    /// made with the returned handle can see.
    #[must_use]
    pub fn get_snapshot(&self) -> SnapshotHandle {
        match self {
            Self::Balance(db) => Engine::get_snapshot(db),
            Self::Lsm(db) => Engine::get_snapshot(db),
        }
    }

    /// Releases a previously pinned snapshot; `SnapshotHandle::drop` already
    /// does this, the method exists for callers that prefer to be explicit.
    pub fn release_snapshot(&self, snapshot: SnapshotHandle) {
        drop(snapshot);
    }

    #[must_use]
    pub fn last_version(&self) -> key::Version {
        match self {
            Self::Balance(db) => Engine::last_version(db),
            Self::Lsm(db) => Engine::last_version(db),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::BytewiseComparator;
    use test_log::test;

    #[test]
    fn open_with_create_if_missing_creates_a_store() {
        let tmp = tempfile::tempdir().unwrap();
        let db = Db::open(tmp.path(), Options::default().create_if_missing(true)).unwrap();
        assert!(matches!(db, Db::Lsm(_)));
        db.put(b"k", b"v").unwrap();
        assert_eq!(db.get(b"k").unwrap(), Some(b"v".to_vec()));
    }

    #[test]
    fn open_missing_without_create_if_missing_errors() {
        let tmp = tempfile::tempdir().unwrap();
        let missing = tmp.path().join("nope");
        assert!(Db::open(missing, Options::default()).is_err());
    }

    #[test]
    fn open_existing_without_error_if_exists_reopens_it() {
        let tmp = tempfile::tempdir().unwrap();
        {
            let db = Db::open(tmp.path(), Options::default().create_if_missing(true)).unwrap();
            db.put(b"k", b"v").unwrap();
        }
        let db = Db::open(tmp.path(), Options::default()).unwrap();
        assert_eq!(db.get(b"k").unwrap(), Some(b"v".to_vec()));
    }

    #[test]
    fn open_existing_with_error_if_exists_errors() {
        let tmp = tempfile::tempdir().unwrap();
        Db::open(tmp.path(), Options::default().create_if_missing(true)).unwrap();
        let result = Db::open(
            tmp.path(),
            Options::default()
                .create_if_missing(true)
                .error_if_exists(true),
        );
        assert!(result.is_err());
    }

    #[test]
    fn balance_engine_round_trips_through_the_facade() {
        let tmp = tempfile::tempdir().unwrap();
        let options = Options::new(EngineName::Balance).create_if_missing(true);
        let db = Db::open(tmp.path(), options).unwrap();
        assert!(matches!(db, Db::Balance(_)));
        db.put(b"a", b"1").unwrap();
        db.delete(b"a").unwrap();
        assert_eq!(db.get(b"a").unwrap(), None);
    }

    #[test]
    fn reopening_a_balance_store_picks_the_balance_engine_back_up() {
        let tmp = tempfile::tempdir().unwrap();
        {
            let options = Options::new(EngineName::Balance).create_if_missing(true);
            let db = Db::open(tmp.path(), options).unwrap();
            db.put(b"a", b"1").unwrap();
        }
        let db = Db::open(tmp.path(), Options::default()).unwrap();
        assert!(matches!(db, Db::Balance(_)));
        assert_eq!(db.get(b"a").unwrap(), Some(b"1".to_vec()));
    }

    #[test]
    fn snapshot_and_iterator_work_through_the_facade() {
        let tmp = tempfile::tempdir().unwrap();
        let db = Db::open(tmp.path(), Options::default().create_if_missing(true)).unwrap();
        db.put(b"a", b"1").unwrap();
        let snapshot = db.get_snapshot();
        db.put(b"b", b"2").unwrap();

        let mut ro = ReadOptions::default();
        ro.snapshot = Some(snapshot);
        assert_eq!(db.get_opts(b"b", &ro).unwrap(), None);

        let mut it = db.new_iterator().unwrap();
        it.seek_to_first();
        let mut seen = Vec::new();
        while it.valid() {
            seen.push(it.key().to_vec());
            it.next();
        }
        assert_eq!(seen, vec![b"a".to_vec(), b"b".to_vec()]);
    }

    #[test]
    fn custom_comparator_is_accepted() {
        let tmp = tempfile::tempdir().unwrap();
        let options = Options::default()
            .create_if_missing(true)
            .comparator(Arc::new(BytewiseComparator));
        let db = Db::open(tmp.path(), options).unwrap();
        db.put(b"k", b"v").unwrap();
        assert_eq!(db.get(b"k").unwrap(), Some(b"v".to_vec()));
    }
}
