// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! LSM merging iterator and DB-level iterator (C12), grounded on
//! `lsm/merger.h`/`merger.cc` and `lsm/db_iter.h`/`db_iter.cc`.
//!
//! The low-level table iterator ([`crate::table::TableIterator`]) is
//! forward-only: it does not support `Prev`/`SeekToLast` (§4.11). Rather than
//! teach it true backward iteration, child iterators that need to
//! participate in a [`MergingIterator`] are fully decoded up front into a
//! [`MaterializedIter`], which does support both directions over the owned
//! copy. This trades memory (one full copy of whatever is being scanned) for
//! a merging/DB iterator that can be a straightforward, faithful port of the
//! source's direction-flip protocol.

use std::{cmp::Ordering, sync::Arc};

use crate::{
    key::{self, ValueKind},
    options::Comparator,
};

/// A bidirectional cursor over key/value pairs, ordered by some comparator.
///
/// `key`/`value` are only meaningful while [`KvIterator::valid`] is `true`.
pub trait KvIterator {
    fn valid(&self) -> bool;
    fn seek_to_first(&mut self);
    fn seek_to_last(&mut self);
    fn seek(&mut self, target: &[u8]);
    fn next(&mut self);
    fn prev(&mut self);
    fn key(&self) -> &[u8];
    fn value(&self) -> &[u8];
}

/// A fully bidirectional iterator over an owned, pre-sorted list of entries.
///
/// Used to adapt otherwise forward-only sources (a decoded table, a memtable
/// snapshot) into something [`MergingIterator`] can drive in both
/// directions.
pub struct MaterializedIter {
    entries: Vec<(Vec<u8>, Vec<u8>)>,
    comparator: Arc<dyn Comparator>,
    pos: Option<usize>,
}

impl MaterializedIter {
    /// Sorts `entries` by `comparator` and wraps them for iteration.
    #[must_use]
    pub fn new(mut entries: Vec<(Vec<u8>, Vec<u8>)>, comparator: Arc<dyn Comparator>) -> Self {
        entries.sort_by(|a, b| comparator.compare(&a.0, &b.0));
        Self {
            entries,
            comparator,
            pos: None,
        }
    }
}

impl KvIterator for MaterializedIter {
    fn valid(&self) -> bool {
        self.pos.is_some_and(|p| p < self.entries.len())
    }

    fn seek_to_first(&mut self) {
        self.pos = if self.entries.is_empty() { None } else { Some(0) };
    }

    fn seek_to_last(&mut self) {
        self.pos = self.entries.len().checked_sub(1);
    }

    fn seek(&mut self, target: &[u8]) {
        let idx =
            self.entries
                .partition_point(|(k, _)| self.comparator.compare(k, target) == Ordering::Less);
        self.pos = Some(idx);
    }

    fn next(&mut self) {
        self.pos = self.pos.map(|p| p + 1);
    }

    fn prev(&mut self) {
        self.pos = match self.pos {
            Some(0) | None => None,
            Some(p) => Some(p - 1),
        };
    }

    #[allow(clippy::indexing_slicing)]
    fn key(&self) -> &[u8] {
        &self.entries[self.pos.expect("valid() checked by caller")].0
    }

    #[allow(clippy::indexing_slicing)]
    fn value(&self) -> &[u8] {
        &self.entries[self.pos.expect("valid() checked by caller")].1
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Forward,
    Reverse,
}

/// Merges several internal-key-ordered children into one ordered stream
/// (§4.12), grounded on `merger.cc`'s `MergingIterator`.
///
/// `Next`/`Prev` implement the source's direction-flip protocol: when the
/// scan changes direction, every non-current child is re-seeked to the
/// current key and nudged one step further in the new direction, so that a
/// subsequent `FindSmallest`/`FindLargest` resumes consistently.
pub struct MergingIterator {
    children: Vec<Box<dyn KvIterator>>,
    comparator: Arc<dyn Comparator>,
    current: Option<usize>,
    direction: Direction,
}

impl MergingIterator {
    #[must_use]
    pub fn new(children: Vec<Box<dyn KvIterator>>, comparator: Arc<dyn Comparator>) -> Self {
        Self {
            children,
            comparator,
            current: None,
            direction: Direction::Forward,
        }
    }

    fn find_smallest(&mut self) {
        let mut smallest: Option<usize> = None;
        for (i, child) in self.children.iter().enumerate() {
            if !child.valid() {
                continue;
            }
            smallest = match smallest {
                None => Some(i),
                Some(s) if self.comparator.compare(child.key(), self.children[s].key()) == Ordering::Less => {
                    Some(i)
                }
                Some(s) => Some(s),
            };
        }
        self.current = smallest;
    }

    fn find_largest(&mut self) {
        let mut largest: Option<usize> = None;
        for (i, child) in self.children.iter().enumerate() {
            if !child.valid() {
                continue;
            }
            largest = match largest {
                None => Some(i),
                Some(l)
                    if self.comparator.compare(child.key(), self.children[l].key()) == Ordering::Greater =>
                {
                    Some(i)
                }
                Some(l) => Some(l),
            };
        }
        self.current = largest;
    }
}

impl KvIterator for MergingIterator {
    fn valid(&self) -> bool {
        self.current.is_some()
    }

    fn seek_to_first(&mut self) {
        for child in &mut self.children {
            child.seek_to_first();
        }
        self.direction = Direction::Forward;
        self.find_smallest();
    }

    fn seek_to_last(&mut self) {
        for child in &mut self.children {
            child.seek_to_last();
        }
        self.direction = Direction::Reverse;
        self.find_largest();
    }

    fn seek(&mut self, target: &[u8]) {
        for child in &mut self.children {
            child.seek(target);
        }
        self.direction = Direction::Forward;
        self.find_smallest();
    }

    fn next(&mut self) {
        debug_assert!(self.valid());
        let current = self.current.expect("valid() checked by caller");

        if self.direction != Direction::Forward {
            let key = self.key().to_vec();
            for (i, child) in self.children.iter_mut().enumerate() {
                if i == current {
                    continue;
                }
                child.seek(&key);
                if child.valid() && self.comparator.compare(child.key(), &key) == Ordering::Equal {
                    child.next();
                }
            }
            self.direction = Direction::Forward;
        }

        #[allow(clippy::indexing_slicing)]
        self.children[current].next();
        self.find_smallest();
    }

    fn prev(&mut self) {
        debug_assert!(self.valid());
        let current = self.current.expect("valid() checked by caller");

        if self.direction != Direction::Reverse {
            let key = self.key().to_vec();
            for (i, child) in self.children.iter_mut().enumerate() {
                if i == current {
                    continue;
                }
                child.seek(&key);
                if child.valid() {
                    child.prev();
                } else {
                    child.seek_to_last();
                }
            }
            self.direction = Direction::Reverse;
        }

        #[allow(clippy::indexing_slicing)]
        self.children[current].prev();
        self.find_largest();
    }

    #[allow(clippy::indexing_slicing)]
    fn key(&self) -> &[u8] {
        self.children[self.current.expect("valid() checked by caller")].key()
    }

    #[allow(clippy::indexing_slicing)]
    fn value(&self) -> &[u8] {
        self.children[self.current.expect("valid() checked by caller")].value()
    }
}

/// Collapses MVCC versions of a [`MergingIterator`] over internal keys into
/// one entry per user key, as of a fixed snapshot version (§4.12), grounded
/// on `db_iter.cc`'s `DBIter`.
pub struct DbIterator {
    comparator: Arc<dyn Comparator>,
    delegate: MergingIterator,
    version: key::Version,
    saved_key: Vec<u8>,
    saved_value: Vec<u8>,
    direction: Direction,
    valid: bool,
}

const SAVED_VALUE_SHRINK_THRESHOLD: usize = 1024 * 1024;

impl DbIterator {
    #[must_use]
    pub fn new(delegate: MergingIterator, comparator: Arc<dyn Comparator>, version: key::Version) -> Self {
        Self {
            comparator,
            delegate,
            version,
            saved_key: Vec::new(),
            saved_value: Vec::new(),
            direction: Direction::Forward,
            valid: false,
        }
    }

    #[must_use]
    pub fn valid(&self) -> bool {
        self.valid
    }

    #[must_use]
    pub fn key(&self) -> &[u8] {
        if self.direction == Direction::Forward {
            key::parse_internal_key(self.delegate.key())
                .expect("well-formed internal key")
                .user_key
        } else {
            &self.saved_key
        }
    }

    #[must_use]
    pub fn value(&self) -> &[u8] {
        if self.direction == Direction::Forward {
            self.delegate.value()
        } else {
            &self.saved_value
        }
    }

    fn clear_saved_value(&mut self) {
        if self.saved_value.capacity() > SAVED_VALUE_SHRINK_THRESHOLD {
            self.saved_value = Vec::new();
        } else {
            self.saved_value.clear();
        }
    }

    pub fn seek_to_first(&mut self) {
        self.direction = Direction::Forward;
        self.saved_key.clear();
        self.delegate.seek_to_first();
        if self.delegate.valid() {
            self.find_next_user_entry(false);
        } else {
            self.valid = false;
        }
    }

    pub fn seek(&mut self, target: &[u8]) {
        self.direction = Direction::Forward;
        self.saved_key.clear();
        self.saved_key
            .extend_from_slice(&key::build_internal_key(target, self.version, ValueKind::Value));
        self.delegate.seek(&self.saved_key);
        if self.delegate.valid() {
            self.find_next_user_entry(false);
        } else {
            self.valid = false;
        }
    }

    pub fn next(&mut self) {
        debug_assert!(self.valid);
        if self.direction == Direction::Reverse {
            self.direction = Direction::Forward;
            if !self.delegate.valid() {
                self.delegate.seek_to_first();
            } else {
                self.delegate.next();
            }
            if !self.delegate.valid() {
                self.valid = false;
                self.saved_key.clear();
                return;
            }
        } else {
            self.saved_key.clear();
            self.saved_key.extend_from_slice(self.user_key_at_delegate());
        }
        self.find_next_user_entry(true);
    }

    fn user_key_at_delegate(&self) -> &[u8] {
        key::parse_internal_key(self.delegate.key())
            .expect("well-formed internal key")
            .user_key
    }

    /// Forward scan that collapses MVCC versions of one user key and skips
    /// entries masked by a deletion tombstone.
    fn find_next_user_entry(&mut self, mut skipping: bool) {
        debug_assert!(self.delegate.valid());
        debug_assert_eq!(self.direction, Direction::Forward);
        loop {
            if let Some(parsed) = key::parse_internal_key(self.delegate.key()) {
                if parsed.version <= self.version {
                    match ValueKind::from_u8(parsed.kind) {
                        Some(ValueKind::Deletion) => {
                            self.saved_key.clear();
                            self.saved_key.extend_from_slice(parsed.user_key);
                            skipping = true;
                        }
                        _ => {
                            if skipping
                                && self.comparator.compare(parsed.user_key, &self.saved_key) != Ordering::Greater
                            {
                                // still masked by the deletion we just saw
                            } else {
                                self.valid = true;
                                self.saved_key.clear();
                                return;
                            }
                        }
                    }
                }
            }
            self.delegate.next();
            if !self.delegate.valid() {
                break;
            }
        }
        self.saved_key.clear();
        self.valid = false;
    }

    pub fn seek_to_last(&mut self) {
        self.direction = Direction::Reverse;
        self.clear_saved_value();
        self.delegate.seek_to_last();
        self.find_prev_user_entry();
    }

    pub fn prev(&mut self) {
        debug_assert!(self.valid);
        if self.direction == Direction::Forward {
            self.saved_key.clear();
            self.saved_key.extend_from_slice(self.user_key_at_delegate());
            loop {
                self.delegate.prev();
                if !self.delegate.valid() {
                    self.valid = false;
                    self.saved_key.clear();
                    self.clear_saved_value();
                    return;
                }
                if self.comparator.compare(self.user_key_at_delegate(), &self.saved_key) == Ordering::Less {
                    break;
                }
            }
            self.direction = Direction::Reverse;
        }
        self.find_prev_user_entry();
    }

    /// Backward scan that buffers the newest non-deleted value seen for the
    /// current user key, flushing it once the user key changes (so that a
    /// deletion further back doesn't resurrect a value that is actually
    /// masked, and so we always return the newest version as of `version`).
    fn find_prev_user_entry(&mut self) {
        debug_assert_eq!(self.direction, Direction::Reverse);
        let mut value_kind = ValueKind::Deletion;
        if self.delegate.valid() {
            loop {
                if let Some(parsed) = key::parse_internal_key(self.delegate.key()) {
                    if parsed.version <= self.version {
                        if value_kind != ValueKind::Deletion
                            && self.comparator.compare(parsed.user_key, &self.saved_key) == Ordering::Less
                        {
                            break;
                        }
                        value_kind = ValueKind::from_u8(parsed.kind).unwrap_or(ValueKind::Deletion);
                        if value_kind == ValueKind::Deletion {
                            self.saved_key.clear();
                            self.clear_saved_value();
                        } else {
                            let raw_value = self.delegate.value();
                            if self.saved_value.capacity() > raw_value.len() + SAVED_VALUE_SHRINK_THRESHOLD {
                                self.saved_value = Vec::new();
                            }
                            self.saved_key.clear();
                            self.saved_key.extend_from_slice(parsed.user_key);
                            self.saved_value.clear();
                            self.saved_value.extend_from_slice(raw_value);
                        }
                    }
                }
                self.delegate.prev();
                if !self.delegate.valid() {
                    break;
                }
            }
        }

        if value_kind == ValueKind::Deletion {
            self.valid = false;
            self.saved_key.clear();
            self.clear_saved_value();
            self.direction = Direction::Forward;
        } else {
            self.valid = true;
        }
    }
}

impl KvIterator for DbIterator {
    fn valid(&self) -> bool {
        Self::valid(self)
    }

    fn seek_to_first(&mut self) {
        Self::seek_to_first(self);
    }

    fn seek_to_last(&mut self) {
        Self::seek_to_last(self);
    }

    fn seek(&mut self, target: &[u8]) {
        Self::seek(self, target);
    }

    fn next(&mut self) {
        Self::next(self);
    }

    fn prev(&mut self) {
        Self::prev(self);
    }

    fn key(&self) -> &[u8] {
        Self::key(self)
    }

    fn value(&self) -> &[u8] {
        Self::value(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::BytewiseComparator;
    use test_log::test;

    fn cmp() -> Arc<dyn Comparator> {
        Arc::new(BytewiseComparator)
    }

    fn entry(user_key: &[u8], version: key::Version, kind: ValueKind, value: &[u8]) -> (Vec<u8>, Vec<u8>) {
        (key::build_internal_key(user_key, version, kind), value.to_vec())
    }

    #[test]
    fn materialized_iter_walks_both_directions() {
        let entries = vec![
            entry(b"a", 1, ValueKind::Value, b"1"),
            entry(b"b", 1, ValueKind::Value, b"2"),
            entry(b"c", 1, ValueKind::Value, b"3"),
        ];
        let mut it = MaterializedIter::new(entries, cmp());
        it.seek_to_first();
        let mut forward = Vec::new();
        while it.valid() {
            forward.push(it.key().to_vec());
            it.next();
        }
        assert_eq!(forward.len(), 3);

        it.seek_to_last();
        let mut backward = Vec::new();
        while it.valid() {
            backward.push(it.key().to_vec());
            it.prev();
        }
        assert_eq!(backward, forward.into_iter().rev().collect::<Vec<_>>());
    }

    fn merging(children: Vec<Vec<(Vec<u8>, Vec<u8>)>>) -> MergingIterator {
        let children = children
            .into_iter()
            .map(|c| Box::new(MaterializedIter::new(c, cmp())) as Box<dyn KvIterator>)
            .collect();
        MergingIterator::new(children, cmp())
    }

    #[test]
    fn merging_iterator_interleaves_children_in_order() {
        let mut it = merging(vec![
            vec![entry(b"a", 1, ValueKind::Value, b"a1"), entry(b"c", 1, ValueKind::Value, b"c1")],
            vec![entry(b"b", 1, ValueKind::Value, b"b1")],
        ]);
        it.seek_to_first();
        let mut users = Vec::new();
        while it.valid() {
            users.push(key::parse_internal_key(it.key()).unwrap().user_key.to_vec());
            it.next();
        }
        assert_eq!(users, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
    }

    #[test]
    fn merging_iterator_supports_direction_flip() {
        let mut it = merging(vec![
            vec![entry(b"a", 1, ValueKind::Value, b"a1"), entry(b"c", 1, ValueKind::Value, b"c1")],
            vec![entry(b"b", 1, ValueKind::Value, b"b1")],
        ]);
        it.seek_to_first();
        it.next();
        it.next(); // now at "c"
        it.prev(); // flip to reverse, should land back on "b"
        assert_eq!(key::parse_internal_key(it.key()).unwrap().user_key, b"b");
    }

    fn db_iter(entries: Vec<(Vec<u8>, Vec<u8>)>, version: key::Version) -> DbIterator {
        let children = vec![Box::new(MaterializedIter::new(entries, cmp())) as Box<dyn KvIterator>];
        let merge = MergingIterator::new(children, cmp());
        DbIterator::new(merge, cmp(), version)
    }

    #[test]
    fn db_iterator_collapses_versions_to_newest_visible() {
        let entries = vec![
            entry(b"k", 1, ValueKind::Value, b"v1"),
            entry(b"k", 2, ValueKind::Value, b"v2"),
        ];
        let mut it = db_iter(entries, 2);
        it.seek_to_first();
        assert!(it.valid());
        assert_eq!(it.key(), b"k");
        assert_eq!(it.value(), b"v2");
        it.next();
        assert!(!it.valid());
    }

    #[test]
    fn db_iterator_hides_deleted_keys() {
        let entries = vec![
            entry(b"k", 1, ValueKind::Value, b"v1"),
            entry(b"k", 2, ValueKind::Deletion, b""),
            entry(b"z", 1, ValueKind::Value, b"vz"),
        ];
        let mut it = db_iter(entries, 2);
        it.seek_to_first();
        assert!(it.valid());
        assert_eq!(it.key(), b"z");
        it.next();
        assert!(!it.valid());
    }

    #[test]
    fn db_iterator_respects_snapshot_version() {
        let entries = vec![
            entry(b"k", 1, ValueKind::Value, b"v1"),
            entry(b"k", 2, ValueKind::Value, b"v2"),
        ];
        let mut it = db_iter(entries, 1);
        it.seek_to_first();
        assert!(it.valid());
        assert_eq!(it.value(), b"v1");
    }

    #[test]
    fn db_iterator_walks_backward() {
        let entries = vec![
            entry(b"a", 1, ValueKind::Value, b"1"),
            entry(b"b", 1, ValueKind::Value, b"2"),
        ];
        let mut it = db_iter(entries, 1);
        it.seek_to_last();
        assert!(it.valid());
        assert_eq!(it.key(), b"b");
        it.prev();
        assert!(it.valid());
        assert_eq!(it.key(), b"a");
        it.prev();
        assert!(!it.valid());
    }
}
