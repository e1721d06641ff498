// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! An embedded, ordered key-value store with two interchangeable storage
//! engines behind one `Db` facade:
//!
//! - `balance`: a paged B+tree engine with a page cache, a free-space
//!   bitmap, and a redo log for crash recovery.
//! - `lsm`: a log-structured merge-tree engine with skiplist memtables,
//!   prefix-compressed sorted-table files, and background compaction.
//!
//! Both engines share the same write-ahead log framing, varint/CRC32
//! primitives, and internal-key encoding; see [`wal`], [`coding`], and
//! [`key`].
//!
//! # Example
//!
//! ```
//! use yukino::{Db, Options};
//! # let dir = tempfile::tempdir()?;
//!
//! let db = Db::open(dir.path(), Options::default().create_if_missing(true))?;
//! db.put(b"my_key", b"my_value")?;
//! assert_eq!(db.get(b"my_key")?, Some(b"my_value".to_vec()));
//! # Ok::<(), yukino::Error>(())
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod area;
pub mod balance;
pub mod block;
pub mod bloom;
pub mod btree;
pub mod coding;
pub mod compaction;
pub mod db;
pub mod env;
mod error;
pub mod key;
pub mod lsm;
pub mod memtable;
pub mod merge;
pub mod options;
pub mod skiplist;
pub mod snapshot;
pub mod table;
pub mod version;
pub mod wal;

pub use db::Db;
pub use error::{Error, Result};
pub use options::{Options, ReadOptions, WriteOptions};
