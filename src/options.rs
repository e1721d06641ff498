// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Options structs and the injected [`Comparator`] (§6).

use crate::{env::Env, env::OsEnv, snapshot::SnapshotHandle, Error, Result};
use std::{cmp::Ordering, path::PathBuf, sync::Arc};

/// A total order over user keys, injected at `Open` time.
///
/// The name is persisted into the manifest (§4.8) so a later `Open` can
/// detect a mismatched comparator instead of silently corrupting ordering.
pub trait Comparator: Send + Sync {
    fn name(&self) -> &'static str;
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering;
}

/// The default comparator: plain byte-lexicographic order.
#[derive(Debug, Default, Clone, Copy)]
pub struct BytewiseComparator;

impl Comparator for BytewiseComparator {
    fn name(&self) -> &'static str {
        "yukino.BytewiseComparator"
    }

    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }
}

/// Minimum page / block size accepted by either engine (§7).
pub const MIN_PAGE_SIZE: u32 = 256;

/// Maximum page / block size accepted by either engine (§7).
pub const MAX_PAGE_SIZE: u32 = 64 * 1024;

/// Engine selector (§6): `engine_name ∈ {"yukino.balance", "lsm"}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineName {
    /// The paged B+tree engine.
    Balance,
    /// The LSM-tree engine.
    Lsm,
}

impl EngineName {
    pub const BALANCE: &'static str = "yukino.balance";
    pub const LSM: &'static str = "lsm";

    pub fn parse(name: &str) -> Result<Self> {
        match name {
            Self::BALANCE => Ok(Self::Balance),
            Self::LSM => Ok(Self::Lsm),
            other => Err(Error::InvalidArgument(format!(
                "unknown engine_name {other:?}, expected {:?} or {:?}",
                Self::BALANCE,
                Self::LSM
            ))),
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Balance => Self::BALANCE,
            Self::Lsm => Self::LSM,
        }
    }
}

/// Options recognized by `Db::open` (§6).
#[derive(Clone)]
pub struct Options {
    pub engine_name: EngineName,
    pub comparator: Arc<dyn Comparator>,
    pub create_if_missing: bool,
    pub error_if_exists: bool,
    pub env: Arc<dyn Env>,

    /// B+tree order (max entries per page); default 127 (§3 Page).
    pub btree_order: usize,

    /// Page size for the paged engine, and block size for the LSM engine.
    /// Must lie within `[MIN_PAGE_SIZE, MAX_PAGE_SIZE]`.
    pub page_size: u32,

    /// Memtable size threshold that triggers a rotation to immutable + flush.
    pub write_buffer_size: u64,

    /// Restart interval for LSM data blocks (§4.10); default 32.
    pub restart_interval: usize,

    /// Number of level-0 tables that trigger write backpressure (§4.13/§5).
    pub level0_stall_threshold: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            engine_name: EngineName::Lsm,
            comparator: Arc::new(BytewiseComparator),
            create_if_missing: false,
            error_if_exists: false,
            env: Arc::new(OsEnv),
            btree_order: 127,
            page_size: 4096,
            write_buffer_size: 4 * 1024 * 1024,
            restart_interval: 32,
            level0_stall_threshold: 12,
        }
    }
}

impl Options {
    #[must_use]
    pub fn new(engine_name: EngineName) -> Self {
        Self {
            engine_name,
            ..Default::default()
        }
    }

    #[must_use]
    pub fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    #[must_use]
    pub fn error_if_exists(mut self, value: bool) -> Self {
        self.error_if_exists = value;
        self
    }

    #[must_use]
    pub fn comparator(mut self, cmp: Arc<dyn Comparator>) -> Self {
        self.comparator = cmp;
        self
    }

    #[must_use]
    pub fn env(mut self, env: Arc<dyn Env>) -> Self {
        self.env = env;
        self
    }

    #[must_use]
    pub fn page_size(mut self, size: u32) -> Self {
        self.page_size = size;
        self
    }

    #[must_use]
    pub fn btree_order(mut self, order: usize) -> Self {
        self.btree_order = order;
        self
    }

    #[must_use]
    pub fn write_buffer_size(mut self, bytes: u64) -> Self {
        self.write_buffer_size = bytes;
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&self.page_size) {
            return Err(Error::InvalidArgument(format!(
                "page_size {} outside [{MIN_PAGE_SIZE}, {MAX_PAGE_SIZE}]",
                self.page_size
            )));
        }
        if self.btree_order < 3 {
            return Err(Error::InvalidArgument(
                "btree_order must be at least 3".into(),
            ));
        }
        Ok(())
    }
}

/// Per-write options (§6).
#[derive(Debug, Clone, Copy, Default)]
pub struct WriteOptions {
    /// Whether to `fsync` the WAL before returning.
    pub sync: bool,
}

/// Per-read options (§6).
#[derive(Clone, Default)]
pub struct ReadOptions {
    pub verify_checksums: bool,
    pub fill_cache: bool,
    pub snapshot: Option<SnapshotHandle>,
}

pub(crate) fn db_path(path: impl Into<PathBuf>) -> PathBuf {
    path.into()
}
