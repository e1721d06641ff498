// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! A generic, comparator-driven skip list (C3), grounded on `lsm/skiplist.h`
//! in the original source: single writer, many concurrent readers, no
//! deletion, random tower heights capped at [`MAX_HEIGHT`].
//!
//! The source publishes new nodes with a relaxed-then-release atomic store
//! on each `next` pointer, relying on the fact that a reader who observes
//! the new pointer also observes a fully-initialized node. This crate
//! forbids `unsafe`, so each tower slot is an `RwLock<Option<Arc<Node<T>>>>`
//! instead: readers take a (cheap, shared) read lock, and the single writer
//! takes a write lock only for the instant it publishes a new link. The
//! external contract — no reader ever sees a half-linked node — holds
//! because a write lock can't be acquired concurrently with the read locks
//! protecting traversal.

use std::{
    cmp::Ordering,
    sync::{
        atomic::{AtomicUsize, Ordering as AtomicOrdering},
        Arc, Mutex, RwLock,
    },
};

/// Maximum tower height, matching `kMaxHeight` in the source.
pub const MAX_HEIGHT: usize = 12;

/// Branching factor, matching `kBranching` in the source.
const BRANCHING: u32 = 4;

/// Orders two items of type `T`. Stand-in for the source's `Comparator`
/// template parameter.
pub trait Compare<T: ?Sized>: Send + Sync {
    fn compare(&self, a: &T, b: &T) -> Ordering;
}

/// A [`Compare`] for any `T: Ord`.
#[derive(Debug, Default, Clone, Copy)]
pub struct NaturalOrder;

impl<T: Ord + ?Sized> Compare<T> for NaturalOrder {
    fn compare(&self, a: &T, b: &T) -> Ordering {
        a.cmp(b)
    }
}

type Link<T> = RwLock<Option<Arc<Node<T>>>>;

struct Node<T> {
    item: Option<T>,
    next: Vec<Link<T>>,
}

impl<T> Node<T> {
    fn new(item: Option<T>, height: usize) -> Arc<Self> {
        let mut next = Vec::with_capacity(height);
        next.resize_with(height, || RwLock::new(None));
        Arc::new(Self { item, next })
    }

    fn next_at(&self, level: usize) -> Option<Arc<Node<T>>> {
        #[allow(clippy::expect_used)]
        self.next[level].read().expect("lock poisoned").clone()
    }

    fn set_next_at(&self, level: usize, node: Option<Arc<Node<T>>>) {
        #[allow(clippy::expect_used)]
        let mut slot = self.next[level].write().expect("lock poisoned");
        *slot = node;
    }
}

/// A single-writer, many-reader skip list over items of type `T`.
///
/// Insertion does not allow duplicates under `cmp`; callers that need
/// "insert or overwrite" semantics (as the LSM memtable does, by appending
/// a new internal key with a fresher tag rather than mutating in place)
/// should pick a `T`/`Compare` pair where equal items can't arise, or
/// filter them out before calling [`SkipList::insert`].
pub struct SkipList<T, C = NaturalOrder> {
    head: Arc<Node<T>>,
    max_height: AtomicUsize,
    len: AtomicUsize,
    seed: Mutex<u32>,
    cmp: C,
}

impl<T> SkipList<T, NaturalOrder> {
    #[must_use]
    pub fn new() -> Self {
        Self::with_comparator(NaturalOrder)
    }
}

impl<T> Default for SkipList<T, NaturalOrder> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, C: Compare<T>> SkipList<T, C> {
    pub fn with_comparator(cmp: C) -> Self {
        Self {
            head: Node::new(None, MAX_HEIGHT),
            max_height: AtomicUsize::new(1),
            len: AtomicUsize::new(0),
            seed: Mutex::new(0x1234_5678),
            cmp,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len.load(AtomicOrdering::Relaxed)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn max_height(&self) -> usize {
        self.max_height.load(AtomicOrdering::Relaxed)
    }

    fn key_is_after_node(&self, key: &T, n: &Option<Arc<Node<T>>>) -> bool {
        match n {
            None => false,
            Some(n) => {
                #[allow(clippy::expect_used)]
                let item = n.item.as_ref().expect("non-head node always has an item");
                self.cmp.compare(item, key) == Ordering::Less
            }
        }
    }

    /// Finds the first node whose item is `>= key`, recording the
    /// predecessor at each level into `prev` (if given).
    fn find_greater_or_equal(
        &self,
        key: &T,
        mut prev: Option<&mut [Option<Arc<Node<T>>>; MAX_HEIGHT]>,
    ) -> Option<Arc<Node<T>>> {
        let mut x = Arc::clone(&self.head);
        let mut level = self.max_height() - 1;
        loop {
            let next = x.next_at(level);
            if self.key_is_after_node(key, &next) {
                #[allow(clippy::expect_used)]
                {
                    x = next.expect("key_is_after_node implies Some");
                }
            } else {
                if let Some(prev) = prev.as_deref_mut() {
                    prev[level] = Some(Arc::clone(&x));
                }
                if level == 0 {
                    return next;
                }
                level -= 1;
            }
        }
    }

    fn find_less_than(&self, key: &T) -> Arc<Node<T>> {
        let mut x = Arc::clone(&self.head);
        let mut level = self.max_height() - 1;
        loop {
            let next = x.next_at(level);
            let keep_going = match &next {
                None => false,
                #[allow(clippy::expect_used)]
                Some(n) => {
                    self.cmp
                        .compare(n.item.as_ref().expect("data node"), key)
                        == Ordering::Less
                }
            };
            if keep_going {
                #[allow(clippy::expect_used)]
                {
                    x = next.expect("keep_going implies Some");
                }
            } else if level == 0 {
                return x;
            } else {
                level -= 1;
            }
        }
    }

    fn find_last(&self) -> Arc<Node<T>> {
        let mut x = Arc::clone(&self.head);
        let mut level = self.max_height() - 1;
        loop {
            match x.next_at(level) {
                Some(next) => x = next,
                None => {
                    if level == 0 {
                        return x;
                    }
                    level -= 1;
                }
            }
        }
    }

    fn random_height(&self) -> usize {
        let mut height = 1;
        while height < MAX_HEIGHT && self.next_rand() == 0 {
            height += 1;
        }
        height
    }

    /// Xorshift32, matching the unseeded-but-deterministic spirit of the
    /// source's `std::mt19937` (this crate has no production dependency on
    /// `rand`, so the tower-height coin flip is homegrown, same as the
    /// xorshift32 `random_height` in fjall's skip map).
    fn next_rand(&self) -> u32 {
        #[allow(clippy::expect_used)]
        let mut seed = self.seed.lock().expect("lock poisoned");
        let mut x = *seed;
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        *seed = x;
        x % (BRANCHING + 1)
    }

    /// Inserts `item`. The caller must not concurrently call `insert` from
    /// more than one thread (single-writer); concurrent [`SkipList::seek`]
    /// and iteration from other threads is safe.
    pub fn insert(&self, item: T) {
        let mut prev: [Option<Arc<Node<T>>>; MAX_HEIGHT] = Default::default();
        self.find_greater_or_equal(&item, Some(&mut prev));

        let height = self.random_height();
        if height > self.max_height() {
            for slot in prev.iter_mut().take(height).skip(self.max_height()) {
                *slot = Some(Arc::clone(&self.head));
            }
            self.max_height.store(height, AtomicOrdering::Relaxed);
        }

        let node = Node::new(Some(item), height);
        for (level, prev_node) in prev.iter().enumerate().take(height) {
            #[allow(clippy::expect_used)]
            let prev_node = prev_node.as_ref().expect("prev filled for levels < height");
            node.set_next_at(level, prev_node.next_at(level));
            prev_node.set_next_at(level, Some(Arc::clone(&node)));
        }
        self.len.fetch_add(1, AtomicOrdering::Relaxed);
    }

    #[must_use]
    pub fn contains(&self, key: &T) -> bool {
        match self.find_greater_or_equal(key, None) {
            #[allow(clippy::expect_used)]
            Some(n) => self.cmp.compare(n.item.as_ref().expect("data node"), key) == Ordering::Equal,
            None => false,
        }
    }

    #[must_use]
    pub fn iter(&self) -> Iter<'_, T, C> {
        Iter {
            list: self,
            node: None,
        }
    }
}

/// A cursor over a [`SkipList`]. Mirrors the source's `Iterator` inner
/// class: `Seek`/`SeekToFirst`/`SeekToLast`/`Next`/`Prev`.
pub struct Iter<'a, T, C> {
    list: &'a SkipList<T, C>,
    node: Option<Arc<Node<T>>>,
}

impl<'a, T, C: Compare<T>> Iter<'a, T, C> {
    #[must_use]
    pub fn valid(&self) -> bool {
        self.node.is_some()
    }

    #[must_use]
    pub fn key(&self) -> &T {
        #[allow(clippy::expect_used)]
        self.node
            .as_ref()
            .expect("valid() must be checked before key()")
            .item
            .as_ref()
            .expect("data node")
    }

    pub fn next(&mut self) {
        #[allow(clippy::expect_used)]
        let n = self.node.as_ref().expect("valid() must be checked before next()");
        self.node = n.next_at(0);
    }

    pub fn prev(&mut self) {
        #[allow(clippy::expect_used)]
        let cur = self.node.as_ref().expect("valid() must be checked before prev()").clone();
        #[allow(clippy::expect_used)]
        let key = cur.item.as_ref().expect("data node");
        let pred = self.list.find_less_than(key);
        self.node = if Arc::ptr_eq(&pred, &self.list.head) {
            None
        } else {
            Some(pred)
        };
    }

    pub fn seek(&mut self, target: &T) {
        self.node = self.list.find_greater_or_equal(target, None);
    }

    pub fn seek_to_first(&mut self) {
        self.node = self.list.head.next_at(0);
    }

    pub fn seek_to_last(&mut self) {
        let last = self.list.find_last();
        self.node = if Arc::ptr_eq(&last, &self.list.head) {
            None
        } else {
            Some(last)
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn insert_and_contains() {
        let list = SkipList::<i32>::new();
        for x in [5, 1, 9, 3, 7] {
            list.insert(x);
        }
        assert_eq!(list.len(), 5);
        for x in [5, 1, 9, 3, 7] {
            assert!(list.contains(&x));
        }
        assert!(!list.contains(&42));
    }

    #[test]
    fn iterates_in_sorted_order() {
        let list = SkipList::<i32>::new();
        for x in [5, 1, 9, 3, 7, 0, 100] {
            list.insert(x);
        }
        let mut it = list.iter();
        it.seek_to_first();
        let mut seen = Vec::new();
        while it.valid() {
            seen.push(*it.key());
            it.next();
        }
        assert_eq!(seen, vec![0, 1, 3, 5, 7, 9, 100]);
    }

    #[test]
    fn seek_and_prev_walk_backwards() {
        let list = SkipList::<i32>::new();
        for x in [10, 20, 30, 40] {
            list.insert(x);
        }
        let mut it = list.iter();
        it.seek(&25);
        assert!(it.valid());
        assert_eq!(*it.key(), 30);
        it.prev();
        assert!(it.valid());
        assert_eq!(*it.key(), 20);
    }

    #[test]
    fn seek_to_last_then_walk_back_to_head() {
        let list = SkipList::<i32>::new();
        for x in [1, 2, 3] {
            list.insert(x);
        }
        let mut it = list.iter();
        it.seek_to_last();
        assert_eq!(*it.key(), 3);
        it.prev();
        assert_eq!(*it.key(), 2);
        it.prev();
        assert_eq!(*it.key(), 1);
        it.prev();
        assert!(!it.valid());
    }

    #[test]
    fn empty_list_iteration() {
        let list = SkipList::<i32>::new();
        let mut it = list.iter();
        it.seek_to_first();
        assert!(!it.valid());
        it.seek_to_last();
        assert!(!it.valid());
    }

    #[test]
    fn many_inserts_grow_height_safely() {
        let list = SkipList::<i32>::new();
        for x in 0..2000 {
            list.insert(x);
        }
        assert_eq!(list.len(), 2000);
        let mut it = list.iter();
        it.seek(&1999);
        assert!(it.valid());
        assert_eq!(*it.key(), 1999);
    }

    #[test]
    fn random_insertion_order_still_iterates_sorted() {
        use rand::seq::SliceRandom;

        let mut values: Vec<i32> = (0..1000).collect();
        values.shuffle(&mut rand::rng());

        let list = SkipList::<i32>::new();
        for x in &values {
            list.insert(*x);
        }
        assert_eq!(list.len(), 1000);

        let mut it = list.iter();
        it.seek_to_first();
        let mut seen = Vec::new();
        while it.valid() {
            seen.push(*it.key());
            it.next();
        }
        assert_eq!(seen, (0..1000).collect::<Vec<_>>());
    }
}
