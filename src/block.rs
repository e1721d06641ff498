// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! LSM engine block builder/reader (C10), grounded on `lsm/block.h`/
//! `lsm/block.cc` in the original source: entries are written with
//! shared-prefix compression against the previous key, restarting the
//! prefix chain every `restart_interval` entries so a reader can binary
//! search restart points before scanning linearly.
//!
//! Block layout:
//! ```text
//! chunk0 .. chunkN | restart_offset[0..num_restarts] (u32 LE each)
//!                  | num_restarts (u32 LE) | type (u8) | crc32 (u32 LE)
//! ```
//! Each chunk is `varint(shared_size) ‖ varint(unshared_size) ‖
//! varint(value_size) ‖ unshared_key_bytes ‖ value_bytes`. The checksum
//! covers everything before it, including the restart index and type byte.

use std::cmp::Ordering;

use crate::{
    coding::{varint, Crc32, DecodeError},
    options::Comparator,
    Error, Result,
};

const TRAILER_SIZE: usize = 4 + 1 + 4; // num_restarts + type + crc32

/// Accumulates chunks into one block's byte layout.
pub struct BlockBuilder {
    buf: Vec<u8>,
    restart_interval: usize,
    restarts: Vec<u32>,
    counter: usize,
    last_key: Vec<u8>,
    last_shared_size: usize,
}

impl BlockBuilder {
    #[must_use]
    pub fn new(restart_interval: usize) -> Self {
        Self {
            buf: Vec::new(),
            restart_interval: restart_interval.max(1),
            restarts: Vec::new(),
            counter: 0,
            last_key: Vec::new(),
            last_shared_size: 0,
        }
    }

    #[must_use]
    pub fn current_size_estimate(&self) -> usize {
        self.buf.len() + self.restarts.len() * 4 + TRAILER_SIZE
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.restarts.is_empty() && self.buf.is_empty()
    }

    /// Whether `key` would trigger a restart if appended next, and if not,
    /// how much of it is shared with the last-appended key.
    fn next_shared_len(&self, key: &[u8]) -> (bool, usize) {
        let mut should_restart = self.counter % self.restart_interval == 0;
        let mut shared = 0;
        if !should_restart {
            let min_len = key.len().min(self.last_key.len());
            while shared < min_len && key[shared] == self.last_key[shared] {
                shared += 1;
            }
            if shared == 0 || shared < self.last_shared_size {
                should_restart = true;
                shared = 0;
            }
        }
        (should_restart, shared)
    }

    /// Exact encoded size of one chunk for `(key, value)` if appended next.
    #[must_use]
    pub fn calc_chunk_size(&self, key: &[u8], value: &[u8]) -> usize {
        let (_, shared) = self.next_shared_len(key);
        let unshared_len = key.len() - shared;
        varint::sizeof_u32(shared as u32)
            + varint::sizeof_u32(unshared_len as u32)
            + varint::sizeof_u64(value.len() as u64)
            + unshared_len
            + value.len()
    }

    /// Whether `(key, value)` can be appended without the block exceeding
    /// `limit` bytes once finished. `limit` is advisory: a single entry
    /// larger than `limit` is still accepted into an empty block.
    #[must_use]
    pub fn can_append(&self, key: &[u8], value: &[u8], limit: usize) -> bool {
        self.is_empty() || self.current_size_estimate() + self.calc_chunk_size(key, value) <= limit
    }

    /// Appends one entry. `key` must be `>=` the previously-added key under
    /// the block's comparator (enforced by callers, not checked here).
    pub fn add(&mut self, key: &[u8], value: &[u8]) {
        let (should_restart, shared) = self.next_shared_len(key);

        if should_restart {
            self.restarts.push(self.buf.len() as u32);
            self.counter = 1;
        } else {
            self.counter += 1;
        }

        let unshared = &key[shared..];
        varint::encode_u32(shared as u32, &mut self.buf);
        varint::encode_u32(unshared.len() as u32, &mut self.buf);
        varint::encode_u64(value.len() as u64, &mut self.buf);
        self.buf.extend_from_slice(unshared);
        self.buf.extend_from_slice(value);

        self.last_shared_size = shared;
        self.last_key.clear();
        self.last_key.extend_from_slice(key);
    }

    /// Closes the block, appending the restart index, trailer, and
    /// checksum, and returns the complete on-disk byte layout.
    #[must_use]
    pub fn finish(mut self, block_type: u8) -> Vec<u8> {
        for &offset in &self.restarts {
            self.buf.extend_from_slice(&offset.to_le_bytes());
        }
        self.buf
            .extend_from_slice(&(self.restarts.len() as u32).to_le_bytes());
        self.buf.push(block_type);
        let crc = Crc32::compute(&self.buf);
        self.buf.extend_from_slice(&crc.as_u32().to_le_bytes());
        self.buf
    }
}

/// A parsed, validated block ready for iteration.
pub struct Block<'a> {
    chunks: &'a [u8],
    restarts: &'a [u8],
    num_restarts: usize,
    block_type: u8,
}

impl<'a> Block<'a> {
    pub fn parse(data: &'a [u8], verify_checksums: bool) -> Result<Self> {
        if data.len() < TRAILER_SIZE {
            return Err(Error::from(DecodeError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "block shorter than trailer",
            ))));
        }
        let crc_off = data.len() - 4;
        let type_off = crc_off - 1;
        let num_restarts_off = type_off - 4;

        #[allow(clippy::expect_used)]
        let num_restarts = u32::from_le_bytes(
            data[num_restarts_off..num_restarts_off + 4]
                .try_into()
                .expect("4 bytes"),
        ) as usize;
        if num_restarts_off < num_restarts * 4 {
            return Err(Error::Corruption("block restart index overruns block".into()));
        }
        let restarts_off = num_restarts_off - num_restarts * 4;

        if verify_checksums {
            #[allow(clippy::expect_used)]
            let stored = u32::from_le_bytes(data[crc_off..].try_into().expect("4 bytes"));
            let computed = Crc32::compute(&data[..crc_off]).as_u32();
            if stored != computed {
                return Err(Error::from(DecodeError::ChecksumMismatch {
                    expected: stored,
                    got: computed,
                }));
            }
        }

        Ok(Self {
            chunks: &data[..restarts_off],
            restarts: &data[restarts_off..num_restarts_off],
            num_restarts,
            block_type: data[type_off],
        })
    }

    #[must_use]
    pub fn block_type(&self) -> u8 {
        self.block_type
    }

    fn restart_offset(&self, i: usize) -> usize {
        #[allow(clippy::expect_used)]
        u32::from_le_bytes(self.restarts[i * 4..i * 4 + 4].try_into().expect("4 bytes")) as usize
    }

    fn decode_entry(&self, mut pos: usize, prev_key: &[u8]) -> Result<(Vec<u8>, &'a [u8], usize)> {
        let (shared, n) = varint::decode_u32(&self.chunks[pos..])?;
        pos += n;
        let (unshared, n) = varint::decode_u32(&self.chunks[pos..])?;
        pos += n;
        let (value_len, n) = varint::decode_u64(&self.chunks[pos..])?;
        pos += n;

        let mut key = Vec::with_capacity(shared as usize + unshared as usize);
        key.extend_from_slice(&prev_key[..shared as usize]);
        key.extend_from_slice(&self.chunks[pos..pos + unshared as usize]);
        pos += unshared as usize;

        let value = &self.chunks[pos..pos + value_len as usize];
        pos += value_len as usize;

        Ok((key, value, pos))
    }

    /// Materializes every entry in the restart window starting at restart
    /// index `i`, mirroring `PrepareRead` in the source.
    fn read_window(&self, i: usize) -> Result<Vec<(Vec<u8>, &'a [u8])>> {
        let start = self.restart_offset(i);
        let end = if i + 1 == self.num_restarts {
            self.chunks.len()
        } else {
            self.restart_offset(i + 1)
        };

        let mut out = Vec::new();
        let mut pos = start;
        let mut prev_key = Vec::new();
        while pos < end {
            let (key, value, next_pos) = self.decode_entry(pos, &prev_key)?;
            prev_key.clone_from(&key);
            out.push((key, value));
            pos = next_pos;
        }
        Ok(out)
    }

    /// Materializes every entry in the block as owned bytes. Used by callers
    /// (the table reader) that need to drop the backing buffer once the
    /// block has been decoded, rather than holding a borrow on it.
    pub fn decode_all(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut out = Vec::new();
        for i in 0..self.num_restarts {
            for (key, value) in self.read_window(i)? {
                out.push((key, value.to_vec()));
            }
        }
        Ok(out)
    }
}

/// Iterates over a [`Block`]'s entries in key order.
pub struct BlockIterator<'a, 'c> {
    block: &'a Block<'a>,
    comparator: &'c dyn Comparator,
    window: Vec<(Vec<u8>, &'a [u8])>,
    restart_idx: isize,
    local_idx: isize,
}

impl<'a, 'c> BlockIterator<'a, 'c> {
    #[must_use]
    pub fn new(block: &'a Block<'a>, comparator: &'c dyn Comparator) -> Self {
        Self {
            block,
            comparator,
            window: Vec::new(),
            restart_idx: -1,
            local_idx: -1,
        }
    }

    #[must_use]
    pub fn valid(&self) -> bool {
        self.restart_idx >= 0
            && (self.restart_idx as usize) < self.block.num_restarts
            && self.local_idx >= 0
            && (self.local_idx as usize) < self.window.len()
    }

    fn load_window(&mut self, i: usize) -> Result<()> {
        self.window = self.block.read_window(i)?;
        self.restart_idx = i as isize;
        Ok(())
    }

    pub fn seek_to_first(&mut self) -> Result<()> {
        self.load_window(0)?;
        self.local_idx = 0;
        Ok(())
    }

    pub fn seek_to_last(&mut self) -> Result<()> {
        let last = self.block.num_restarts - 1;
        self.load_window(last)?;
        self.local_idx = self.window.len() as isize - 1;
        Ok(())
    }

    /// Positions at the first entry with key `>= target`.
    pub fn seek(&mut self, target: &[u8]) -> Result<()> {
        let mut found = 0usize;
        let mut any = false;
        for i in (0..self.block.num_restarts).rev() {
            let window = self.block.read_window(i)?;
            #[allow(clippy::expect_used)]
            let (first_key, _) = window.first().expect("non-empty restart window");
            if self.comparator.compare(target, first_key) != Ordering::Less {
                found = i;
                any = true;
                break;
            }
        }
        if !any {
            found = 0;
        }

        self.load_window(found)?;
        for (j, (key, _)) in self.window.iter().enumerate() {
            if self.comparator.compare(target, key) != Ordering::Greater {
                self.local_idx = j as isize;
                return Ok(());
            }
        }
        self.restart_idx = -1;
        self.local_idx = -1;
        Ok(())
    }

    pub fn next(&mut self) -> Result<()> {
        if self.local_idx as usize + 1 >= self.window.len() {
            let next_restart = self.restart_idx + 1;
            if (next_restart as usize) < self.block.num_restarts {
                self.load_window(next_restart as usize)?;
            } else {
                self.restart_idx = next_restart;
            }
            self.local_idx = 0;
        } else {
            self.local_idx += 1;
        }
        Ok(())
    }

    pub fn prev(&mut self) -> Result<()> {
        if self.local_idx == 0 {
            let prev_restart = self.restart_idx - 1;
            if prev_restart >= 0 {
                self.load_window(prev_restart as usize)?;
                self.local_idx = self.window.len() as isize - 1;
            } else {
                self.restart_idx = -1;
                self.local_idx = -1;
            }
        } else {
            self.local_idx -= 1;
        }
        Ok(())
    }

    #[must_use]
    pub fn key(&self) -> &[u8] {
        #[allow(clippy::expect_used)]
        &self.window[self.local_idx as usize].0
    }

    #[must_use]
    pub fn value(&self) -> &'a [u8] {
        self.window[self.local_idx as usize].1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::BytewiseComparator;
    use test_log::test;

    fn build(entries: &[(&[u8], &[u8])], restart_interval: usize) -> Vec<u8> {
        let mut builder = BlockBuilder::new(restart_interval);
        for (k, v) in entries {
            builder.add(k, v);
        }
        builder.finish(1)
    }

    #[test]
    fn roundtrips_entries_in_order() {
        let entries: Vec<(&[u8], &[u8])> = vec![
            (b"apple", b"1"),
            (b"banana", b"2"),
            (b"bandana", b"3"),
            (b"cherry", b"4"),
        ];
        let bytes = build(&entries, 2);
        let block = Block::parse(&bytes, true).unwrap();
        let cmp = BytewiseComparator;
        let mut it = BlockIterator::new(&block, &cmp);
        it.seek_to_first().unwrap();
        let mut seen = Vec::new();
        while it.valid() {
            seen.push((it.key().to_vec(), it.value().to_vec()));
            it.next().unwrap();
        }
        let expected: Vec<_> = entries.iter().map(|(k, v)| (k.to_vec(), v.to_vec())).collect();
        assert_eq!(seen, expected);
    }

    #[test]
    fn seek_lands_on_first_key_greater_or_equal() {
        let entries: Vec<(&[u8], &[u8])> =
            vec![(b"a", b"1"), (b"c", b"2"), (b"e", b"3"), (b"g", b"4")];
        let bytes = build(&entries, 2);
        let block = Block::parse(&bytes, true).unwrap();
        let cmp = BytewiseComparator;
        let mut it = BlockIterator::new(&block, &cmp);
        it.seek(b"d").unwrap();
        assert!(it.valid());
        assert_eq!(it.key(), b"e");
    }

    #[test]
    fn seek_to_last_then_walk_backwards() {
        let entries: Vec<(&[u8], &[u8])> = vec![(b"a", b"1"), (b"b", b"2"), (b"c", b"3")];
        let bytes = build(&entries, 1);
        let block = Block::parse(&bytes, true).unwrap();
        let cmp = BytewiseComparator;
        let mut it = BlockIterator::new(&block, &cmp);
        it.seek_to_last().unwrap();
        assert_eq!(it.key(), b"c");
        it.prev().unwrap();
        assert_eq!(it.key(), b"b");
        it.prev().unwrap();
        assert_eq!(it.key(), b"a");
    }

    #[test]
    fn corrupted_block_fails_checksum() {
        let entries: Vec<(&[u8], &[u8])> = vec![(b"a", b"1")];
        let mut bytes = build(&entries, 16);
        let n = bytes.len();
        bytes[n / 2] ^= 0xFF;
        assert!(Block::parse(&bytes, true).is_err());
    }
}
