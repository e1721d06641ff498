// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Byte-level primitives (C1): varints, CRC32, and buffered I/O helpers
//! shared by every on-disk format in the crate.

pub mod varint;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

/// Appends `v` to `out` as 4 little-endian bytes.
///
/// Fixed-width fields go through `byteorder` rather than `to_le_bytes`, the
/// same split the host crate draws between "ordinary framing" and the
/// varint codec (§4.1), which stays hand-rolled because it's the thing
/// under test.
pub fn write_u32_le(out: &mut Vec<u8>, v: u32) {
    #[allow(clippy::expect_used)]
    out.write_u32::<LittleEndian>(v).expect("Vec<u8> writes cannot fail");
}

/// Appends `v` to `out` as 8 little-endian bytes.
pub fn write_u64_le(out: &mut Vec<u8>, v: u64) {
    #[allow(clippy::expect_used)]
    out.write_u64::<LittleEndian>(v).expect("Vec<u8> writes cannot fail");
}

/// Reads 4 little-endian bytes from the front of `buf`.
pub fn read_u32_le(mut buf: &[u8]) -> std::io::Result<u32> {
    buf.read_u32::<LittleEndian>()
}

/// Reads 8 little-endian bytes from the front of `buf`.
pub fn read_u64_le(mut buf: &[u8]) -> std::io::Result<u64> {
    buf.read_u64::<LittleEndian>()
}

/// Error during serialization.
#[derive(Debug)]
pub struct EncodeError(pub(crate) std::io::Error);

impl std::fmt::Display for EncodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "encode error: {}", self.0)
    }
}

impl std::error::Error for EncodeError {}

impl From<std::io::Error> for EncodeError {
    fn from(value: std::io::Error) -> Self {
        Self(value)
    }
}

/// Error during deserialization.
#[derive(Debug)]
pub enum DecodeError {
    /// Underlying I/O failure (including short reads).
    Io(std::io::Error),

    /// A tag byte did not map to a known enum variant.
    InvalidTag(&'static str),

    /// A magic number did not match what was expected.
    InvalidMagic,

    /// A CRC32 trailer did not match the recomputed digest.
    ChecksumMismatch { expected: u32, got: u32 },
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "decode error: {e}"),
            Self::InvalidTag(what) => write!(f, "invalid tag: {what}"),
            Self::InvalidMagic => write!(f, "invalid magic number"),
            Self::ChecksumMismatch { expected, got } => {
                write!(f, "checksum mismatch: expected {expected:#x}, got {got:#x}")
            }
        }
    }
}

impl std::error::Error for DecodeError {}

impl From<std::io::Error> for DecodeError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

/// Trait for types that know how to serialize themselves.
pub trait Encode {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError>;

    fn encode_into_vec(&self) -> Vec<u8> {
        let mut v = Vec::new();
        #[allow(clippy::expect_used)]
        self.encode_into(&mut v).expect("Vec<u8> writes cannot fail");
        v
    }
}

/// Trait for types that know how to deserialize themselves.
pub trait Decode {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, crate::Error>
    where
        Self: Sized;
}

/// A CRC32 digest using the zlib polynomial (same one `crc32fast` implements).
///
/// Wraps the external crate behind a newtype so call sites read
/// `Crc32::compute`/`Crc32::extend` the way the rest of the crate reads
/// `Checksum`/`Encode`/`Decode`, instead of depending on `crc32fast`'s API
/// shape directly.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Crc32(u32);

impl Crc32 {
    /// Computes the digest of a single buffer.
    #[must_use]
    pub fn compute(bytes: &[u8]) -> Self {
        Self(crc32fast::hash(bytes))
    }

    /// Extends a previously computed digest with more bytes.
    ///
    /// Property (testable, §8.2): `crc32(A ++ B) == crc32_update(crc32(A), B)`.
    #[must_use]
    pub fn extend(prior: Self, bytes: &[u8]) -> Self {
        let mut hasher = crc32fast::Hasher::new_with_initial(prior.0);
        hasher.update(bytes);
        Self(hasher.finalize())
    }

    #[must_use]
    pub fn as_u32(self) -> u32 {
        self.0
    }

    #[must_use]
    pub fn from_raw(value: u32) -> Self {
        Self(value)
    }

    pub fn check(self, expected: Self) -> Result<(), DecodeError> {
        if self.0 == expected.0 {
            Ok(())
        } else {
            Err(DecodeError::ChecksumMismatch {
                expected: expected.0,
                got: self.0,
            })
        }
    }
}

/// A running CRC32 accumulator for a reader, so block trailers can be
/// checked after the payload has already streamed through.
pub struct ChecksumReader<R> {
    inner: R,
    hasher: crc32fast::Hasher,
}

impl<R: Read> ChecksumReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: crc32fast::Hasher::new(),
        }
    }

    #[must_use]
    pub fn checksum(&self) -> Crc32 {
        Crc32(self.hasher.clone().finalize())
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: Read> Read for ChecksumReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }
}

/// A writer whose backing buffer grows geometrically, as described in §4.1:
/// `cap' = max(cap*2+128, cap+add)`.
#[derive(Default)]
pub struct BufferedWriter {
    buf: Vec<u8>,
}

impl BufferedWriter {
    #[must_use]
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    #[must_use]
    pub fn with_capacity(cap: usize) -> Self {
        Self {
            buf: Vec::with_capacity(cap),
        }
    }

    fn grow_for(&mut self, add: usize) {
        let cap = self.buf.capacity();
        let needed = self.buf.len() + add;
        if needed > cap {
            let new_cap = (cap * 2 + 128).max(cap + add);
            self.buf.reserve(new_cap - self.buf.len());
        }
    }

    /// Appends `n` zero bytes without requiring the caller to materialize them.
    pub fn skip(&mut self, n: usize) {
        self.grow_for(n);
        self.buf.resize(self.buf.len() + n, 0);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    #[must_use]
    pub fn into_vec(self) -> Vec<u8> {
        self.buf
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }
}

impl Write for BufferedWriter {
    fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
        self.grow_for(data.len());
        self.buf.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn crc32_determinism() {
        let a = b"hello ";
        let b = b"world";
        let whole = Crc32::compute(b"hello world");
        let incremental = Crc32::extend(Crc32::compute(a), b);
        assert_eq!(whole, incremental);
    }

    #[test]
    fn buffered_writer_skip_zero_fills() {
        let mut w = BufferedWriter::new();
        w.write_all(b"ab").unwrap();
        w.skip(3);
        assert_eq!(w.into_vec(), vec![b'a', b'b', 0, 0, 0]);
    }
}
