// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The LSM-tree engine's facade (C9-C13), tying the memtable, SSTables, the
//! version set/manifest, and background compaction together behind one
//! `&self`-everywhere [`Db`], mirroring [`crate::balance::Db`]'s shape so the
//! top-level [`crate::Db`] can dispatch to either engine uniformly.
//!
//! Writes go to an active [`LogWriter`] and the active [`Memtable`] under one
//! lock. Once the memtable crosses `write_buffer_size` it is swapped for a
//! fresh one and handed to the background worker as an immutable memtable to
//! flush into a new level-0 `.sst`; that worker also runs compactions picked
//! by [`crate::compaction::pick_compaction`]. A background error is latched
//! and surfaced on the next foreground call, the same contract the paged
//! engine's redo log errors out through directly since it has no background
//! thread of its own.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use crate::{
    compaction::{self, CompactionJob, CompactionWorker, Compactor},
    env::Env,
    key::{self, InternalKeyComparator, ValueKind},
    memtable::{LookupResult, Memtable},
    merge::{DbIterator, KvIterator, MaterializedIter, MergingIterator},
    options::{Comparator, Options, ReadOptions, WriteOptions},
    snapshot::{SnapshotHandle, SnapshotList},
    table::{Table, TableBuilder, TableOptions},
    version::{self, FileMetadata, VersionPatch, VersionSet, MAX_LEVEL},
    wal::{LogReader, LogWriter},
    Error, Result,
};

fn wal_file_name(number: u64) -> String {
    format!("{number:06}.log")
}

/// Adapts an [`crate::env::AppendFile`] into a plain `Box<dyn Write>`, for
/// callers (compaction's output tables) that need that exact trait object
/// rather than a generic `W: Write`.
struct AppendWriter(Box<dyn crate::env::AppendFile>);

impl std::io::Write for AppendWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.0.flush()
    }
}

/// The manifest/WAL command set for a logged write, the LSM engine's
/// analogue of [`crate::balance`]'s redo log command (same `Put`/
/// begin/commit shape, kept as a separate type since the two engines' logs
/// are never read by each other).
#[derive(Debug, Clone)]
enum LogCommand {
    BeginTransaction(key::Version),
    CommitTransaction(key::Version),
    Put {
        version: key::Version,
        kind: ValueKind,
        key: Vec<u8>,
        value: Vec<u8>,
    },
}

impl LogCommand {
    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            Self::BeginTransaction(v) => {
                out.push(1);
                crate::coding::varint::encode_u64(*v, &mut out);
            }
            Self::CommitTransaction(v) => {
                out.push(3);
                crate::coding::varint::encode_u64(*v, &mut out);
            }
            Self::Put { version, kind, key, value } => {
                out.push(4);
                crate::coding::varint::encode_u64(*version, &mut out);
                out.push(*kind as u8);
                crate::coding::varint::encode_u64(key.len() as u64, &mut out);
                out.extend_from_slice(key);
                crate::coding::varint::encode_u64(value.len() as u64, &mut out);
                out.extend_from_slice(value);
            }
        }
        out
    }

    fn decode(buf: &[u8]) -> Result<Self> {
        let tag = *buf.first().ok_or_else(too_short)?;
        let mut cur = &buf[1..];
        let mut u64_field = |cur: &mut &[u8]| -> Result<u64> {
            let (v, n) = crate::coding::varint::decode_u64(cur)?;
            *cur = &cur[n..];
            Ok(v)
        };
        match tag {
            1 => Ok(Self::BeginTransaction(u64_field(&mut cur)?)),
            3 => Ok(Self::CommitTransaction(u64_field(&mut cur)?)),
            4 => {
                let version = u64_field(&mut cur)?;
                let kind = ValueKind::from_u8(*cur.first().ok_or_else(too_short)?)
                    .ok_or_else(|| Error::Corruption("bad wal value kind".into()))?;
                cur = &cur[1..];
                let klen = u64_field(&mut cur)? as usize;
                let (k, rest) = cur.split_at(klen.min(cur.len()));
                cur = rest;
                let vlen = u64_field(&mut cur)? as usize;
                let (v, _rest) = cur.split_at(vlen.min(cur.len()));
                Ok(Self::Put { version, kind, key: k.to_vec(), value: v.to_vec() })
            }
            _ => Err(Error::Corruption(format!("unknown wal tag {tag}"))),
        }
    }
}

fn too_short() -> Error {
    Error::Corruption("lsm wal record truncated".into())
}

/// Caches open [`Table`]s by file number (§4.11/C11), so a hot key doesn't
/// re-open and re-load its table's index on every lookup. Evicted whenever
/// compaction deletes the underlying file.
struct TableCache {
    env: Arc<dyn Env>,
    dir: PathBuf,
    comparator: Arc<dyn Comparator>,
    tables: Mutex<HashMap<u64, Arc<Table>>>,
}

impl TableCache {
    fn new(env: Arc<dyn Env>, dir: PathBuf, comparator: Arc<dyn Comparator>) -> Self {
        Self { env, dir, comparator, tables: Mutex::new(HashMap::new()) }
    }

    fn get(&self, number: u64) -> Result<Arc<Table>> {
        #[allow(clippy::expect_used)]
        if let Some(table) = self.tables.lock().expect("lock poisoned").get(&number) {
            return Ok(Arc::clone(table));
        }
        let path = self.dir.join(version::table_file_name(number));
        let file = self.env.create_random_access_file(&path)?;
        let table = Arc::new(Table::open(file, Arc::clone(&self.comparator), false)?);
        #[allow(clippy::expect_used)]
        self.tables.lock().expect("lock poisoned").insert(number, Arc::clone(&table));
        Ok(table)
    }

    fn evict(&self, number: u64) {
        #[allow(clippy::expect_used)]
        self.tables.lock().expect("lock poisoned").remove(&number);
    }
}

struct State {
    mem: Arc<Memtable>,
    imm: Option<Arc<Memtable>>,
    wal: LogWriter,
    wal_number: u64,
    /// The previous generation's WAL file, still on disk until its memtable
    /// is durably flushed into a `.sst` and the version patch committed.
    pending_old_wal: Option<u64>,
    versions: VersionSet,
}

/// Everything a background compaction/flush job needs, split out from [`Db`]
/// so the worker thread's closure can hold a `Weak` reference to it without
/// keeping the whole `Db` (and its own worker) alive forever.
struct Shared {
    dir: PathBuf,
    env: Arc<dyn Env>,
    user_comparator: Arc<dyn Comparator>,
    internal_comparator: Arc<InternalKeyComparator>,
    write_buffer_size: u64,
    max_file_size: u64,
    restart_interval: usize,
    block_size: u32,
    snapshots: Arc<SnapshotList>,
    table_cache: TableCache,
    state: Mutex<State>,
    background_error: Mutex<Option<String>>,
}

impl Shared {
    fn table_options(&self) -> TableOptions {
        TableOptions {
            block_size: self.block_size,
            restart_interval: self.restart_interval,
            ..TableOptions::default()
        }
    }

    fn check_background_error(&self) -> Result<()> {
        #[allow(clippy::expect_used)]
        if let Some(msg) = self.background_error.lock().expect("lock poisoned").clone() {
            return Err(Error::Corruption(format!("background worker failed: {msg}")));
        }
        Ok(())
    }

    fn record_background_error(&self, err: Error) {
        log::warn!("lsm background worker failed: {err}");
        #[allow(clippy::expect_used)]
        {
            *self.background_error.lock().expect("lock poisoned") = Some(err.to_string());
        }
    }

    /// Runs whatever background work is pending: flush the immutable
    /// memtable (if any), then compactions, until neither has anything left
    /// to do. Driven either by the worker thread or synchronously by
    /// [`Db::recover`] before the worker starts.
    fn do_background_work(&self) {
        loop {
            match self.flush_immutable() {
                Ok(true) => continue,
                Ok(false) => {}
                Err(err) => {
                    self.record_background_error(err);
                    return;
                }
            }
            match self.run_compaction() {
                Ok(true) => continue,
                Ok(false) => break,
                Err(err) => {
                    self.record_background_error(err);
                    return;
                }
            }
        }
    }

    /// Flushes the current immutable memtable (if any) into a new level-0
    /// `.sst`, commits the version patch, then drops the WAL generation it
    /// superseded. Returns `false` if there was nothing to flush.
    fn flush_immutable(&self) -> Result<bool> {
        #[allow(clippy::expect_used)]
        let (imm, old_wal) = {
            let mut state = self.state.lock().expect("lock poisoned");
            let Some(imm) = state.imm.clone() else { return Ok(false) };
            (imm, state.pending_old_wal.take())
        };

        #[allow(clippy::expect_used)]
        let file_number = {
            let mut state = self.state.lock().expect("lock poisoned");
            state.versions.new_file_number()
        };
        let path = self.dir.join(version::table_file_name(file_number));
        log::debug!("flushing memtable to {path:?}");
        let writer = self.env.create_append_file(&path)?;
        let mut builder = TableBuilder::new(writer, self.table_options());

        let mut it = imm.iter();
        it.seek_to_first();
        let mut smallest: Option<Vec<u8>> = None;
        let mut largest = Vec::new();
        let mut size = 0u64;
        while it.valid() {
            let entry = it.key();
            builder.append(entry.internal_key(), entry.value())?;
            if smallest.is_none() {
                smallest = Some(entry.internal_key().to_vec());
            }
            largest = entry.internal_key().to_vec();
            size += entry.internal_key().len() as u64 + entry.value().len() as u64;
            it.next();
        }

        if let Some(smallest) = smallest {
            builder.finalize()?;
            let mut sync_handle = self.env.create_append_file(&path)?;
            sync_handle.sync()?;

            let mut patch = VersionPatch::new();
            patch.add_file(0, FileMetadata { number: file_number, smallest_key: smallest, largest_key: largest, size, ctime: 0 });
            #[allow(clippy::expect_used)]
            let mut state = self.state.lock().expect("lock poisoned");
            state.versions.log_and_apply(patch)?;
            state.imm = None;
            drop(state);
            log::debug!("flushed memtable to {path:?} ({size} bytes)");
        } else {
            drop(builder);
            #[allow(clippy::expect_used)]
            let mut state = self.state.lock().expect("lock poisoned");
            state.imm = None;
        }

        if let Some(old_wal) = old_wal {
            let _ = self.env.delete_file(&self.dir.join(wal_file_name(old_wal)));
        }
        Ok(true)
    }

    fn run_compaction(&self) -> Result<bool> {
        #[allow(clippy::expect_used)]
        let (compaction, oldest_live, table_options) = {
            let state = self.state.lock().expect("lock poisoned");
            let Some(compaction) = compaction::pick_compaction(state.versions.current(), self.user_comparator.as_ref()) else {
                return Ok(false);
            };
            let oldest_live = self.snapshots.oldest_live().unwrap_or(state.versions.last_version());
            (compaction, oldest_live, self.table_options())
        };

        if compaction.is_trivial_move() {
            #[allow(clippy::expect_used)]
            let file = Arc::clone(&compaction.inputs[0][0]);
            let mut patch = VersionPatch::new();
            patch.delete_file(compaction.level, file.number);
            patch.add_file(compaction.output_level, (*file).clone());
            #[allow(clippy::expect_used)]
            let mut state = self.state.lock().expect("lock poisoned");
            state.versions.log_and_apply(patch)?;
            log::debug!("moved table {} from level {} to {} without rewriting", file.number, compaction.level, compaction.output_level);
            return Ok(true);
        }

        log::debug!("compacting level {} -> {} ({} + {} input files)", compaction.level, compaction.output_level, compaction.inputs[0].len(), compaction.inputs[1].len());

        let compactor = Compactor::new(Arc::clone(&self.internal_comparator) as Arc<dyn Comparator>);
        let mut new_files = Vec::new();
        let outputs = compactor.compact(
            &compaction,
            oldest_live,
            table_options,
            |file_meta| {
                let table = self.table_cache.get(file_meta.number)?;
                compaction::materialize_table(&table, false, Arc::clone(&self.internal_comparator) as Arc<dyn Comparator>)
            },
            || {
                #[allow(clippy::expect_used)]
                let number = self.state.lock().expect("lock poisoned").versions.new_file_number();
                new_files.push(number);
                let path = self.dir.join(version::table_file_name(number));
                let writer = self.env.create_append_file(&path)?;
                Ok((number, Box::new(AppendWriter(writer)) as Box<dyn std::io::Write>))
            },
            self.max_file_size,
        )?;

        for number in &new_files {
            let path = self.dir.join(version::table_file_name(*number));
            let mut f = self.env.create_append_file(&path)?;
            f.sync()?;
        }

        let mut patch = VersionPatch::new();
        for file in &compaction.inputs[0] {
            patch.delete_file(compaction.level, file.number);
        }
        for file in &compaction.inputs[1] {
            patch.delete_file(compaction.output_level, file.number);
        }
        for meta in outputs {
            patch.add_file(compaction.output_level, meta);
        }
        #[allow(clippy::expect_used)]
        {
            let mut state = self.state.lock().expect("lock poisoned");
            state.versions.log_and_apply(patch)?;
        }

        for file in compaction.inputs[0].iter().chain(compaction.inputs[1].iter()) {
            self.table_cache.evict(file.number);
            let _ = self.env.delete_file(&self.dir.join(version::table_file_name(file.number)));
        }
        log::debug!("compaction finished, wrote {} new table(s)", new_files.len());
        Ok(true)
    }
}

/// The LSM engine's facade (§4.13), a sibling of [`crate::balance::Db`] with
/// the same `&self`-everywhere shape so both engines can sit behind the
/// top-level [`crate::Db`] dispatch enum.
pub struct Db {
    shared: Arc<Shared>,
    worker: CompactionWorker,
    _lock: crate::env::FileLock,
}

impl Db {
    pub fn create(dir: &Path, env: Arc<dyn Env>, options: &Options) -> Result<Self> {
        env.create_dir(dir)?;
        let lock = crate::env::FileLock::acquire(dir)?;
        let user_comparator = Arc::clone(&options.comparator);
        let internal_comparator = Arc::new(InternalKeyComparator::new(Arc::clone(&user_comparator)));

        let db_name = dir.to_str().ok_or_else(|| Error::InvalidArgument("db path is not valid UTF-8".into()))?;
        let versions = VersionSet::create(db_name, Arc::clone(&env), InternalKeyComparator::new(Arc::clone(&user_comparator)))?;

        let wal_number = 1;
        let wal_path = dir.join(wal_file_name(wal_number));
        let wal = LogWriter::new(env.create_append_file(&wal_path)?);

        let state = State {
            mem: Arc::new(Memtable::new(Arc::clone(&user_comparator))),
            imm: None,
            wal,
            wal_number,
            pending_old_wal: None,
            versions,
        };

        let shared = Arc::new(Shared {
            table_cache: TableCache::new(Arc::clone(&env), dir.to_path_buf(), Arc::clone(&internal_comparator) as Arc<dyn Comparator>),
            dir: dir.to_path_buf(),
            env,
            user_comparator,
            internal_comparator,
            write_buffer_size: options.write_buffer_size,
            max_file_size: options.write_buffer_size.max(1),
            restart_interval: options.restart_interval,
            block_size: options.page_size,
            snapshots: SnapshotList::new(),
            state: Mutex::new(state),
            background_error: Mutex::new(None),
        });

        Ok(Self { worker: start_worker(&shared), shared, _lock: lock })
    }

    pub fn recover(dir: &Path, env: Arc<dyn Env>, options: &Options) -> Result<Self> {
        let lock = crate::env::FileLock::acquire(dir)?;
        let user_comparator = Arc::clone(&options.comparator);
        let internal_comparator = Arc::new(InternalKeyComparator::new(Arc::clone(&user_comparator)));

        let db_name = dir.to_str().ok_or_else(|| Error::InvalidArgument("db path is not valid UTF-8".into()))?;
        let mut versions = VersionSet::recover(db_name, Arc::clone(&env), InternalKeyComparator::new(Arc::clone(&user_comparator)))?;

        let recovered_mem = Memtable::new(Arc::clone(&user_comparator));
        let mut max_version = versions.last_version();
        let mut log_numbers: Vec<u64> = env
            .get_children(dir)?
            .iter()
            .filter_map(|name| name.strip_suffix(".log").and_then(|n| n.parse::<u64>().ok()))
            .collect();
        log_numbers.sort_unstable();

        for number in &log_numbers {
            let path = dir.join(wal_file_name(*number));
            let raf = env.create_random_access_file(&path)?;
            let len = raf.len()?;
            let bytes = raf.read_at(0, len as usize)?;
            let mut reader = LogReader::new(bytes.as_slice(), true);
            while let Some(record) = reader.read()? {
                if let Ok(cmd) = LogCommand::decode(&record) {
                    match cmd {
                        LogCommand::Put { version, kind, key, value } => {
                            recovered_mem.add(version, kind, &key, &value);
                            max_version = max_version.max(version);
                        }
                        LogCommand::BeginTransaction(v) | LogCommand::CommitTransaction(v) => {
                            max_version = max_version.max(v);
                        }
                    }
                }
            }
        }
        if max_version > versions.last_version() {
            versions.advance_version(max_version - versions.last_version());
        }

        let wal_number = versions.new_file_number();
        let wal_path = dir.join(wal_file_name(wal_number));
        let wal = LogWriter::new(env.create_append_file(&wal_path)?);

        let imm = if recovered_mem.is_empty() { None } else { Some(Arc::new(recovered_mem)) };

        let state = State {
            mem: Arc::new(Memtable::new(Arc::clone(&user_comparator))),
            imm,
            wal,
            wal_number,
            pending_old_wal: None,
            versions,
        };

        let shared = Arc::new(Shared {
            table_cache: TableCache::new(Arc::clone(&env), dir.to_path_buf(), Arc::clone(&internal_comparator) as Arc<dyn Comparator>),
            dir: dir.to_path_buf(),
            env: Arc::clone(&env),
            user_comparator,
            internal_comparator,
            write_buffer_size: options.write_buffer_size,
            max_file_size: options.write_buffer_size.max(1),
            restart_interval: options.restart_interval,
            block_size: options.page_size,
            snapshots: SnapshotList::new(),
            state: Mutex::new(state),
            background_error: Mutex::new(None),
        });

        // Recovered data must be durable before the old log generations are
        // dropped, so this flush runs synchronously, before the background
        // worker (and thus any further writes) exists.
        #[allow(clippy::expect_used)]
        let has_recovered_data = shared.state.lock().expect("lock poisoned").imm.is_some();
        if has_recovered_data {
            shared.flush_immutable()?;
        }
        for number in log_numbers {
            let _ = env.delete_file(&dir.join(wal_file_name(number)));
        }

        Ok(Self { worker: start_worker(&shared), shared, _lock: lock })
    }

    fn maybe_schedule_flush(&self, state: &mut State) -> Result<()> {
        if state.imm.is_some() || state.mem.approximate_memory_usage() < self.shared.write_buffer_size {
            return Ok(());
        }
        let old_mem = std::mem::replace(&mut state.mem, Arc::new(Memtable::new(Arc::clone(&self.shared.user_comparator))));
        state.imm = Some(old_mem);

        let new_wal_number = state.versions.new_file_number();
        let new_wal_path = self.shared.dir.join(wal_file_name(new_wal_number));
        state.wal = LogWriter::new(self.shared.env.create_append_file(&new_wal_path)?);
        state.pending_old_wal = Some(state.wal_number);
        state.wal_number = new_wal_number;

        self.worker.submit(CompactionJob { level: 0 });
        Ok(())
    }

    /// Writes `key -> value`.
    pub fn put(&self, key: &[u8], value: &[u8], wo: &WriteOptions) -> Result<()> {
        self.write(&[(key.to_vec(), Some(value.to_vec()))], wo)
    }

    /// Logs a deletion tombstone for `key`.
    pub fn delete(&self, key: &[u8], wo: &WriteOptions) -> Result<()> {
        self.write(&[(key.to_vec(), None)], wo)
    }

    /// Applies a batch of puts/deletes as one WAL-logged unit, visible under
    /// a single version (§4.9/§4.13). As with the paged engine, recovery
    /// replays every logged `Put` record regardless of whether its
    /// surrounding transaction record made it to disk.
    pub fn write(&self, ops: &[(Vec<u8>, Option<Vec<u8>>)], wo: &WriteOptions) -> Result<()> {
        self.shared.check_background_error()?;
        #[allow(clippy::expect_used)]
        let mut state = self.shared.state.lock().expect("lock poisoned");
        let version = state.versions.advance_version(1);

        Self::log(&mut state.wal, &LogCommand::BeginTransaction(version), wo)?;
        for (key, value) in ops {
            let (kind, raw_value) = match value {
                Some(v) => (ValueKind::Value, v.clone()),
                None => (ValueKind::Deletion, Vec::new()),
            };
            Self::log(&mut state.wal, &LogCommand::Put { version, kind, key: key.clone(), value: raw_value.clone() }, wo)?;
            state.mem.add(version, kind, key, &raw_value);
        }
        Self::log(&mut state.wal, &LogCommand::CommitTransaction(version), wo)?;

        self.maybe_schedule_flush(&mut state)
    }

    fn log(wal: &mut LogWriter, command: &LogCommand, wo: &WriteOptions) -> Result<()> {
        wal.append(&command.encode())?;
        if wo.sync {
            wal.sync()?;
        }
        Ok(())
    }

    /// Reads the newest value for `key` visible as of `ro`'s pinned snapshot,
    /// checking the memtable, then the immutable memtable, then each level
    /// in turn (§4.13). Level 0 files may overlap, so every overlapping L0
    /// file is checked and the entry with the greatest version `<=
    /// read_version` wins; levels >= 1 are disjoint, so at most one file can
    /// hold the key.
    pub fn get(&self, key: &[u8], ro: &ReadOptions) -> Result<Option<Vec<u8>>> {
        self.shared.check_background_error()?;
        #[allow(clippy::expect_used)]
        let (mem, imm, version, read_version) = {
            let state = self.shared.state.lock().expect("lock poisoned");
            let read_version = ro.snapshot.as_ref().map_or(state.versions.last_version(), SnapshotHandle::version);
            (Arc::clone(&state.mem), state.imm.clone(), state.versions.current().clone(), read_version)
        };

        if let Some(result) = mem.get(key, read_version) {
            return Ok(match result {
                LookupResult::Found(v) => Some(v),
                LookupResult::Deleted => None,
            });
        }
        if let Some(imm) = imm {
            if let Some(result) = imm.get(key, read_version) {
                return Ok(match result {
                    LookupResult::Found(v) => Some(v),
                    LookupResult::Deleted => None,
                });
            }
        }

        let smallest_probe = key::build_internal_key(key, key::MAX_VERSION, ValueKind::Value);
        let largest_probe = key::build_internal_key(key, 0, ValueKind::Value);
        for level in 0..MAX_LEVEL {
            let files = version.overlapping_at(level, self.shared.internal_comparator.as_ref(), &smallest_probe, &largest_probe);
            if files.is_empty() {
                continue;
            }
            let mut best: Option<(key::Version, ValueKind, Vec<u8>)> = None;
            for file in &files {
                let table = self.shared.table_cache.get(file.number)?;
                let mut it = table.iter(ro.verify_checksums);
                let probe = key::build_internal_key(key, read_version, ValueKind::Value);
                it.seek(&probe)?;
                if !it.valid() {
                    continue;
                }
                let Some(parsed) = key::parse_internal_key(it.key()) else { continue };
                if parsed.user_key != key || parsed.version > read_version {
                    continue;
                }
                let better = best.as_ref().is_none_or(|(v, _, _)| parsed.version > *v);
                if better {
                    let kind = ValueKind::from_u8(parsed.kind).unwrap_or(ValueKind::Deletion);
                    best = Some((parsed.version, kind, it.value().to_vec()));
                }
            }
            if let Some((_, kind, value)) = best {
                return Ok(match kind {
                    ValueKind::Value => Some(value),
                    ValueKind::Deletion => None,
                });
            }
        }
        Ok(None)
    }

    /// Builds a cursor over every live user key as of `ro`'s snapshot.
    /// Materializes the memtable generations and every table at every level
    /// into [`MaterializedIter`]s, merges them with a [`MergingIterator`],
    /// and wraps the result in a [`DbIterator`] to collapse MVCC versions and
    /// drop tombstones (§4.12/§4.13).
    pub fn new_iterator(&self, ro: &ReadOptions) -> Result<DbIterator> {
        self.shared.check_background_error()?;
        #[allow(clippy::expect_used)]
        let (mem, imm, version, read_version) = {
            let state = self.shared.state.lock().expect("lock poisoned");
            let read_version = ro.snapshot.as_ref().map_or(state.versions.last_version(), SnapshotHandle::version);
            (Arc::clone(&state.mem), state.imm.clone(), state.versions.current().clone(), read_version)
        };

        let internal_comparator = Arc::clone(&self.shared.internal_comparator) as Arc<dyn Comparator>;
        let mut children: Vec<Box<dyn KvIterator>> = vec![Box::new(materialize_memtable(&mem, Arc::clone(&internal_comparator)))];
        if let Some(imm) = &imm {
            children.push(Box::new(materialize_memtable(imm, Arc::clone(&internal_comparator))));
        }
        for level in 0..MAX_LEVEL {
            for file in version.files(level) {
                let table = self.shared.table_cache.get(file.number)?;
                children.push(Box::new(compaction::materialize_table(&table, ro.verify_checksums, Arc::clone(&internal_comparator))?));
            }
        }

        let merger = MergingIterator::new(children, internal_comparator);
        Ok(DbIterator::new(merger, Arc::clone(&self.shared.user_comparator), read_version))
    }

    /// Pins the current version (§3 Snapshot).
    #[must_use]
    pub fn get_snapshot(&self) -> SnapshotHandle {
        #[allow(clippy::expect_used)]
        let version = self.shared.state.lock().expect("lock poisoned").versions.last_version();
        self.shared.snapshots.acquire(version)
    }

    /// Releases a previously pinned snapshot; `SnapshotHandle::drop` already
    /// does this, the method exists for callers that prefer to be explicit.
    pub fn release_snapshot(&self, snapshot: SnapshotHandle) {
        drop(snapshot);
    }

    /// Forces the current memtable to flush, blocking until durable. Mainly
    /// useful for tests that want a deterministic L0 file without waiting on
    /// the background worker's timing.
    pub fn flush(&self) -> Result<()> {
        {
            #[allow(clippy::expect_used)]
            let mut state = self.shared.state.lock().expect("lock poisoned");
            if state.imm.is_none() && !state.mem.is_empty() {
                let old_mem = std::mem::replace(&mut state.mem, Arc::new(Memtable::new(Arc::clone(&self.shared.user_comparator))));
                state.imm = Some(old_mem);
                let new_wal_number = state.versions.new_file_number();
                let new_wal_path = self.shared.dir.join(wal_file_name(new_wal_number));
                state.wal = LogWriter::new(self.shared.env.create_append_file(&new_wal_path)?);
                state.pending_old_wal = Some(state.wal_number);
                state.wal_number = new_wal_number;
            }
        }
        while self.shared.flush_immutable()? {}
        Ok(())
    }

    #[must_use]
    pub fn last_version(&self) -> key::Version {
        #[allow(clippy::expect_used)]
        self.shared.state.lock().expect("lock poisoned").versions.last_version()
    }
}

fn materialize_memtable(mt: &Memtable, comparator: Arc<dyn Comparator>) -> MaterializedIter {
    let mut it = mt.iter();
    it.seek_to_first();
    let mut out = Vec::new();
    while it.valid() {
        out.push((it.key().internal_key().to_vec(), it.key().value().to_vec()));
        it.next();
    }
    MaterializedIter::new(out, comparator)
}

fn start_worker(shared: &Arc<Shared>) -> CompactionWorker {
    let weak = Arc::downgrade(shared);
    CompactionWorker::start(move |_job| {
        if let Some(shared) = weak.upgrade() {
            shared.do_background_work();
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{env::OsEnv, options::Options};
    use test_log::test;

    fn opened(dir: &Path) -> Db {
        let options = Options::default();
        Db::create(dir, Arc::new(OsEnv), &options).expect("create")
    }

    #[test]
    fn put_then_get_roundtrips() {
        let tmp = tempfile::tempdir().unwrap();
        let db = opened(tmp.path());
        db.put(b"hello", b"world", &WriteOptions::default()).unwrap();
        assert_eq!(db.get(b"hello", &ReadOptions::default()).unwrap(), Some(b"world".to_vec()));
    }

    #[test]
    fn delete_hides_the_key() {
        let tmp = tempfile::tempdir().unwrap();
        let db = opened(tmp.path());
        db.put(b"k", b"v", &WriteOptions::default()).unwrap();
        db.delete(b"k", &WriteOptions::default()).unwrap();
        assert_eq!(db.get(b"k", &ReadOptions::default()).unwrap(), None);
    }

    #[test]
    fn write_batch_applies_all_ops() {
        let tmp = tempfile::tempdir().unwrap();
        let db = opened(tmp.path());
        db.write(&[(b"x".to_vec(), Some(b"1".to_vec())), (b"y".to_vec(), Some(b"2".to_vec()))], &WriteOptions::default()).unwrap();
        assert_eq!(db.get(b"x", &ReadOptions::default()).unwrap(), Some(b"1".to_vec()));
        assert_eq!(db.get(b"y", &ReadOptions::default()).unwrap(), Some(b"2".to_vec()));
    }

    #[test]
    fn recover_replays_unflushed_wal() {
        let tmp = tempfile::tempdir().unwrap();
        let env: Arc<dyn Env> = Arc::new(OsEnv);
        let options = Options::default();
        {
            let db = Db::create(tmp.path(), Arc::clone(&env), &options).unwrap();
            db.put(b"a", b"1", &WriteOptions::default()).unwrap();
            db.put(b"b", b"2", &WriteOptions::default()).unwrap();
        }
        let db = Db::recover(tmp.path(), env, &options).unwrap();
        assert_eq!(db.get(b"a", &ReadOptions::default()).unwrap(), Some(b"1".to_vec()));
        assert_eq!(db.get(b"b", &ReadOptions::default()).unwrap(), Some(b"2".to_vec()));
    }

    #[test]
    fn flush_moves_memtable_into_a_level0_table_and_get_still_finds_it() {
        let tmp = tempfile::tempdir().unwrap();
        let db = opened(tmp.path());
        db.put(b"k", b"v", &WriteOptions::default()).unwrap();
        db.flush().unwrap();
        assert_eq!(db.get(b"k", &ReadOptions::default()).unwrap(), Some(b"v".to_vec()));
    }

    #[test]
    fn flush_then_overwrite_returns_the_newer_value() {
        let tmp = tempfile::tempdir().unwrap();
        let db = opened(tmp.path());
        db.put(b"k", b"v1", &WriteOptions::default()).unwrap();
        db.flush().unwrap();
        db.put(b"k", b"v2", &WriteOptions::default()).unwrap();
        assert_eq!(db.get(b"k", &ReadOptions::default()).unwrap(), Some(b"v2".to_vec()));
    }

    #[test]
    fn snapshot_isolates_reads_from_later_writes() {
        let tmp = tempfile::tempdir().unwrap();
        let db = opened(tmp.path());
        db.put(b"k", b"v1", &WriteOptions::default()).unwrap();
        let snapshot = db.get_snapshot();
        db.put(b"k", b"v2", &WriteOptions::default()).unwrap();

        let mut ro = ReadOptions::default();
        ro.snapshot = Some(snapshot);
        assert_eq!(db.get(b"k", &ro).unwrap(), Some(b"v1".to_vec()));
        assert_eq!(db.get(b"k", &ReadOptions::default()).unwrap(), Some(b"v2".to_vec()));
    }

    #[test]
    fn iterator_collapses_versions_across_memtable_and_flushed_table() {
        let tmp = tempfile::tempdir().unwrap();
        let db = opened(tmp.path());
        db.put(b"a", b"1", &WriteOptions::default()).unwrap();
        db.put(b"b", b"2", &WriteOptions::default()).unwrap();
        db.flush().unwrap();
        db.delete(b"b", &WriteOptions::default()).unwrap();
        db.put(b"c", b"3", &WriteOptions::default()).unwrap();

        let mut it = db.new_iterator(&ReadOptions::default()).unwrap();
        it.seek_to_first();
        let mut seen = Vec::new();
        while it.valid() {
            seen.push((it.key().to_vec(), it.value().to_vec()));
            it.next();
        }
        assert_eq!(seen, vec![(b"a".to_vec(), b"1".to_vec()), (b"c".to_vec(), b"3".to_vec())]);
    }
}
