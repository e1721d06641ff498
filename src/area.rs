// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Slab allocator ("area", C2), grounded on `util/area.h`/`area-inl.h` in
//! the original source.
//!
//! Used during key packing, where the B+tree (§4.4) and Table (§4.7) need
//! many short-lived, same-sized byte buffers that are all freed together
//! (e.g. duplicated keys held only for the lifetime of one page-split).
//! The source implements this with an intrusive doubly-linked free list
//! threaded through raw memory and recovers a chunk's owning page by
//! masking the pointer with `~(page_size-1)`. Since this crate forbids
//! `unsafe`, chunks are addressed by `(class, page, slot)` handles instead
//! of raw pointers — the "arena + indices" pattern called out in §9,
//! applied one level below the B+tree.

const PAGE_BEGIN_SHIFT: u32 = 3; // smallest class holds 8-byte chunks
const NUM_SIZE_CLASSES: usize = 6; // shifts 3..=8 => 8..=256 bytes
const PAGE_SIZE: usize = 4096;

fn class_chunk_size(class: usize) -> usize {
    1usize << (PAGE_BEGIN_SHIFT as usize + class)
}

fn class_for(size: usize) -> Option<usize> {
    (0..NUM_SIZE_CLASSES).find(|&c| size <= class_chunk_size(c))
}

struct SlabPage {
    chunk_size: usize,
    data: Vec<u8>,
    /// Free slot indices (LIFO reuse is fine; the source only cares about
    /// "the freest page floats to the front").
    free_slots: Vec<u32>,
    freed: u32,
}

impl SlabPage {
    fn new(chunk_size: usize) -> Self {
        let capacity = PAGE_SIZE / chunk_size;
        Self {
            chunk_size,
            data: vec![0u8; capacity * chunk_size],
            free_slots: (0..capacity as u32).rev().collect(),
            freed: capacity as u32,
        }
    }

    fn capacity(&self) -> u32 {
        (self.data.len() / self.chunk_size) as u32
    }

    fn is_fully_free(&self) -> bool {
        self.freed == self.capacity()
    }
}

struct LargePage {
    data: Vec<u8>,
}

/// A handle to a chunk allocated from an [`Area`]. Opaque outside this module.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AreaHandle {
    Slab { class: usize, page: usize, slot: u32 },
    Large { index: usize },
}

/// The slab allocator itself. Not `Send`/`Sync`; matches the single-threaded
/// `Rc`-based ownership model used elsewhere in the paged engine (§5).
#[derive(Default)]
pub struct Area {
    classes: [Vec<SlabPage>; NUM_SIZE_CLASSES],
    large: Vec<Option<LargePage>>,
}

impl Area {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates a chunk able to hold `len` bytes.
    pub fn allocate(&mut self, len: usize) -> AreaHandle {
        match class_for(len) {
            Some(class) => self.allocate_in_class(class),
            None => {
                let index = self.first_free_large_slot();
                self.large[index] = Some(LargePage { data: vec![0u8; len] });
                AreaHandle::Large { index }
            }
        }
    }

    fn first_free_large_slot(&mut self) -> usize {
        if let Some(index) = self.large.iter().position(Option::is_none) {
            return index;
        }
        self.large.push(None);
        self.large.len() - 1
    }

    fn allocate_in_class(&mut self, class: usize) -> AreaHandle {
        let chunk_size = class_chunk_size(class);
        let pages = &mut self.classes[class];

        // Pick the page with a free slot that has the fewest free slots
        // remaining after this allocation (keeps near-full pages together,
        // mirroring "rotate pages in size-decreasing order").
        let mut best: Option<usize> = None;
        for (i, page) in pages.iter().enumerate() {
            if !page.free_slots.is_empty()
                && best.map_or(true, |b: usize| page.freed < pages[b].freed)
            {
                best = Some(i);
            }
        }

        let page_idx = best.unwrap_or_else(|| {
            pages.push(SlabPage::new(chunk_size));
            pages.len() - 1
        });

        let page = &mut pages[page_idx];
        #[allow(clippy::expect_used)]
        let slot = page.free_slots.pop().expect("page had a free slot");
        page.freed -= 1;

        AreaHandle::Slab {
            class,
            page: page_idx,
            slot,
        }
    }

    /// Returns the readable bytes backing `handle`, sized to the handle's
    /// chunk capacity (callers that asked for fewer bytes than a chunk
    /// holds should slice the result down themselves).
    #[must_use]
    pub fn get(&self, handle: AreaHandle) -> &[u8] {
        match handle {
            AreaHandle::Slab { class, page, slot } => {
                let page = &self.classes[class][page];
                let start = slot as usize * page.chunk_size;
                &page.data[start..start + page.chunk_size]
            }
            AreaHandle::Large { index } => {
                #[allow(clippy::expect_used)]
                &self.large[index].as_ref().expect("handle freed").data
            }
        }
    }

    #[must_use]
    pub fn get_mut(&mut self, handle: AreaHandle) -> &mut [u8] {
        match handle {
            AreaHandle::Slab { class, page, slot } => {
                let page = &mut self.classes[class][page];
                let start = slot as usize * page.chunk_size;
                &mut page.data[start..start + page.chunk_size]
            }
            AreaHandle::Large { index } => {
                #[allow(clippy::expect_used)]
                &mut self.large[index].as_mut().expect("handle freed").data
            }
        }
    }

    /// Frees a chunk. If its page becomes wholly free, the page is dropped
    /// (returned to the OS, in spirit).
    pub fn free(&mut self, handle: AreaHandle) {
        match handle {
            AreaHandle::Slab { class, page, slot } => {
                let pages = &mut self.classes[class];
                let p = &mut pages[page];
                p.free_slots.push(slot);
                p.freed += 1;
                if p.is_fully_free() {
                    pages.remove(page);
                }
            }
            AreaHandle::Large { index } => {
                self.large[index] = None;
            }
        }
    }

    /// Approximate bytes currently held live (used bytes across all pages).
    #[must_use]
    pub fn approximate_memory_usage(&self) -> usize {
        let slab: usize = self
            .classes
            .iter()
            .flatten()
            .map(|p| ((p.capacity() - p.freed) as usize) * p.chunk_size)
            .sum();
        let large: usize = self
            .large
            .iter()
            .flatten()
            .map(|p| p.data.len())
            .sum();
        slab + large
    }

    /// Releases every page, regardless of outstanding handles. Handles
    /// obtained before `purge` must not be used afterwards.
    pub fn purge(&mut self) {
        for pages in &mut self.classes {
            pages.clear();
        }
        self.large.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn allocate_and_roundtrip_bytes() {
        let mut area = Area::new();
        let h = area.allocate(5);
        area.get_mut(h)[..5].copy_from_slice(b"hello");
        assert_eq!(&area.get(h)[..5], b"hello");
    }

    #[test]
    fn large_allocation_roundtrip() {
        let mut area = Area::new();
        let h = area.allocate(10_000);
        area.get_mut(h)[..3].copy_from_slice(b"abc");
        assert_eq!(&area.get(h)[..3], b"abc");
    }

    #[test]
    fn free_then_reallocate_reuses_space() {
        let mut area = Area::new();
        let h1 = area.allocate(4);
        area.free(h1);
        let before = area.approximate_memory_usage();
        let _h2 = area.allocate(4);
        assert!(area.approximate_memory_usage() >= before);
    }

    #[test]
    fn purge_releases_everything() {
        let mut area = Area::new();
        for _ in 0..20 {
            area.allocate(16);
        }
        assert!(area.approximate_memory_usage() > 0);
        area.purge();
        assert_eq!(area.approximate_memory_usage(), 0);
    }
}
