// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! LSM engine memtable (C9), grounded on `lsm/skiplist.h`'s use as the
//! memtable backing structure in the original source, realized here on top
//! of the crate's own [`crate::skiplist`].
//!
//! Entries are stored as complete internal-key blobs (`user_key ‖ tag ‖
//! value`, value length implicit from the slice the skiplist holds), so one
//! comparator over raw bytes drives both the skiplist ordering and lookups.

use std::sync::{atomic::{AtomicU64, Ordering as AtomicOrdering}, Arc};

use crate::{
    key::{self, InternalKeyComparator, Version, ValueKind},
    options::Comparator,
    skiplist::{Compare, Iter as SkipIter, SkipList},
};

/// One packed entry: `user_key ‖ tag(8) ‖ value`. Kept as a single `Vec<u8>`
/// so the skiplist's comparator only ever needs to look at bytes.
#[derive(Clone, Debug)]
pub struct Entry {
    bytes: Arc<Vec<u8>>,
    key_len: usize,
}

impl Entry {
    fn new(user_key: &[u8], version: Version, kind: ValueKind, value: &[u8]) -> Self {
        let mut bytes = Vec::with_capacity(user_key.len() + 8 + value.len());
        key::append_internal_key(&mut bytes, user_key, version, kind);
        let key_len = bytes.len();
        bytes.extend_from_slice(value);
        Self {
            bytes: Arc::new(bytes),
            key_len,
        }
    }

    #[must_use]
    pub fn internal_key(&self) -> &[u8] {
        &self.bytes[..self.key_len]
    }

    #[must_use]
    pub fn value(&self) -> &[u8] {
        &self.bytes[self.key_len..]
    }

    #[must_use]
    pub fn parsed(&self) -> key::ParsedKey<'_> {
        #[allow(clippy::expect_used)]
        key::parse_internal_key(self.internal_key()).expect("entries are always well-formed")
    }

    #[must_use]
    pub fn approximate_memory_usage(&self) -> usize {
        self.bytes.len() + std::mem::size_of::<Self>()
    }
}

struct EntryOrder(InternalKeyComparator);

impl Compare<Entry> for EntryOrder {
    fn compare(&self, a: &Entry, b: &Entry) -> std::cmp::Ordering {
        self.0.compare(a.internal_key(), b.internal_key())
    }
}

/// The write buffer backing one generation of the LSM engine (§4.9).
pub struct Memtable {
    list: SkipList<Entry, EntryOrder>,
    approximate_size: AtomicU64,
}

impl Memtable {
    #[must_use]
    pub fn new(user_comparator: Arc<dyn Comparator>) -> Self {
        Self {
            list: SkipList::with_comparator(EntryOrder(InternalKeyComparator::new(user_comparator))),
            approximate_size: AtomicU64::new(0),
        }
    }

    pub fn add(&self, version: Version, kind: ValueKind, user_key: &[u8], value: &[u8]) {
        let entry = Entry::new(user_key, version, kind, value);
        self.approximate_size
            .fetch_add(entry.approximate_memory_usage() as u64, AtomicOrdering::Relaxed);
        self.list.insert(entry);
    }

    #[must_use]
    pub fn approximate_memory_usage(&self) -> u64 {
        self.approximate_size.load(AtomicOrdering::Relaxed)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.list.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    /// Looks up the newest visible value for `user_key` as of `version`.
    /// Returns `None` if absent or masked by a deletion at or below
    /// `version` (§4.9).
    #[must_use]
    pub fn get(&self, user_key: &[u8], version: Version) -> Option<LookupResult> {
        let seek_key = Entry::new(user_key, version, ValueKind::Value, &[]);
        let mut it = self.list.iter();
        it.seek(&seek_key);
        if !it.valid() {
            return None;
        }
        let entry = it.key();
        let parsed = entry.parsed();
        if parsed.user_key != user_key {
            return None;
        }
        match ValueKind::from_u8(parsed.kind) {
            Some(ValueKind::Deletion) => Some(LookupResult::Deleted),
            _ => Some(LookupResult::Found(entry.value().to_vec())),
        }
    }

    #[must_use]
    pub fn iter(&self) -> SkipIter<'_, Entry, EntryOrder> {
        self.list.iter()
    }
}

/// Outcome of a memtable lookup: present and unmasked, or masked by a
/// tombstone (the caller must not fall through to older layers once it sees
/// `Deleted` for a matching user key).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupResult {
    Found(Vec<u8>),
    Deleted,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::BytewiseComparator;
    use test_log::test;

    fn memtable() -> Memtable {
        Memtable::new(Arc::new(BytewiseComparator))
    }

    #[test]
    fn put_then_get_returns_value() {
        let mt = memtable();
        mt.add(1, ValueKind::Value, b"k", b"v1");
        assert_eq!(mt.get(b"k", 1), Some(LookupResult::Found(b"v1".to_vec())));
    }

    #[test]
    fn newer_version_shadows_older_at_same_or_later_snapshot() {
        let mt = memtable();
        mt.add(1, ValueKind::Value, b"k", b"v1");
        mt.add(2, ValueKind::Value, b"k", b"v2");
        assert_eq!(mt.get(b"k", 2), Some(LookupResult::Found(b"v2".to_vec())));
        assert_eq!(mt.get(b"k", 1), Some(LookupResult::Found(b"v1".to_vec())));
    }

    #[test]
    fn deletion_masks_older_versions() {
        let mt = memtable();
        mt.add(1, ValueKind::Value, b"k", b"v1");
        mt.add(2, ValueKind::Deletion, b"k", b"");
        assert_eq!(mt.get(b"k", 2), Some(LookupResult::Deleted));
    }

    #[test]
    fn missing_key_returns_none() {
        let mt = memtable();
        mt.add(1, ValueKind::Value, b"k", b"v1");
        assert_eq!(mt.get(b"other", 1), None);
    }

    #[test]
    fn iterator_sees_entries_in_internal_key_order() {
        let mt = memtable();
        mt.add(1, ValueKind::Value, b"b", b"2");
        mt.add(1, ValueKind::Value, b"a", b"1");
        mt.add(2, ValueKind::Value, b"a", b"1-new");
        let mut it = mt.iter();
        it.seek_to_first();
        let mut seen = Vec::new();
        while it.valid() {
            seen.push(it.key().parsed().user_key.to_vec());
            it.next();
        }
        assert_eq!(seen, vec![b"a".to_vec(), b"a".to_vec(), b"b".to_vec()]);
    }
}
