// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! LEB128 varints, grounded on `base/varint_encoding.h` in the original
//! source: 7 bits of payload per byte, continuation bit set on all but the
//! last byte.

use std::io::{Read, Write};

use super::DecodeError;

/// Maximum encoded length of a `u32` varint.
pub const MAX_LEN_32: usize = 5;

/// Maximum encoded length of a `u64` varint.
pub const MAX_LEN_64: usize = 10;

const CONTINUATION: u8 = 0b1000_0000;
const PAYLOAD: u8 = 0b0111_1111;

/// Encodes `value` into `out`, returning the number of bytes written.
pub fn encode_u64(mut value: u64, out: &mut Vec<u8>) -> usize {
    let start = out.len();
    loop {
        let byte = (value & u64::from(PAYLOAD)) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            break;
        }
        out.push(byte | CONTINUATION);
    }
    out.len() - start
}

/// Encodes `value` into `out`, returning the number of bytes written.
pub fn encode_u32(value: u32, out: &mut Vec<u8>) -> usize {
    encode_u64(u64::from(value), out)
}

/// Exact encoded length of `value`, without actually encoding it.
#[must_use]
pub fn sizeof_u64(value: u64) -> usize {
    if value == 0 {
        return 1;
    }
    let bits = 64 - value.leading_zeros() as usize;
    (bits + 6) / 7
}

/// Exact encoded length of `value`, without actually encoding it.
#[must_use]
pub fn sizeof_u32(value: u32) -> usize {
    sizeof_u64(u64::from(value))
}

/// Decodes a `u64` varint from the front of `buf`, returning the value and
/// the number of bytes consumed.
pub fn decode_u64(buf: &[u8]) -> Result<(u64, usize), DecodeError> {
    let mut result: u64 = 0;
    for (i, &byte) in buf.iter().enumerate().take(MAX_LEN_64) {
        let payload = u64::from(byte & PAYLOAD);
        result |= payload << (7 * i);
        if byte & CONTINUATION == 0 {
            return Ok((result, i + 1));
        }
    }
    Err(DecodeError::Io(std::io::Error::new(
        std::io::ErrorKind::UnexpectedEof,
        "truncated varint",
    )))
}

/// Decodes a `u32` varint from the front of `buf`.
pub fn decode_u32(buf: &[u8]) -> Result<(u32, usize), DecodeError> {
    let (value, len) = decode_u64(buf)?;
    Ok((value as u32, len))
}

/// Reader-side convenience: reads one byte at a time (for streaming sources
/// like the WAL reader, where the whole buffer isn't resident up front).
pub fn read_u64<R: Read>(reader: &mut R) -> Result<u64, DecodeError> {
    let mut result: u64 = 0;
    let mut shift = 0;
    loop {
        let mut byte = [0u8; 1];
        reader.read_exact(&mut byte)?;
        let byte = byte[0];
        result |= u64::from(byte & PAYLOAD) << shift;
        if byte & CONTINUATION == 0 {
            return Ok(result);
        }
        shift += 7;
        if shift >= 64 {
            return Err(DecodeError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "varint too long",
            )));
        }
    }
}

pub fn read_u32<R: Read>(reader: &mut R) -> Result<u32, DecodeError> {
    Ok(read_u64(reader)? as u32)
}

pub fn write_u64<W: Write>(writer: &mut W, value: u64) -> std::io::Result<()> {
    let mut buf = Vec::with_capacity(MAX_LEN_64);
    encode_u64(value, &mut buf);
    writer.write_all(&buf)
}

pub fn write_u32<W: Write>(writer: &mut W, value: u32) -> std::io::Result<()> {
    write_u64(writer, u64::from(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn roundtrip_u32_samples() {
        for x in [0u32, 1, 127, 128, 300, u32::MAX / 2, u32::MAX] {
            let mut buf = Vec::new();
            let written = encode_u32(x, &mut buf);
            assert_eq!(written, sizeof_u32(x));
            assert_eq!(written, buf.len());

            let (decoded, consumed) = decode_u32(&buf).unwrap();
            assert_eq!(decoded, x);
            assert_eq!(consumed, written);
        }
    }

    #[test]
    fn roundtrip_u64_samples() {
        for x in [0u64, 1, 127, 128, 300, 1 << 40, u64::MAX / 2, u64::MAX] {
            let mut buf = Vec::new();
            let written = encode_u64(x, &mut buf);
            assert_eq!(written, sizeof_u64(x));

            let (decoded, consumed) = decode_u64(&buf).unwrap();
            assert_eq!(decoded, x);
            assert_eq!(consumed, written);
        }
    }

    #[test]
    fn roundtrip_exhaustive_u16_range() {
        for x in 0u32..=70_000 {
            let mut buf = Vec::new();
            encode_u32(x, &mut buf);
            let (decoded, _) = decode_u32(&buf).unwrap();
            assert_eq!(decoded, x);
        }
    }

    #[test]
    fn max_len_constants() {
        let mut buf = Vec::new();
        encode_u32(u32::MAX, &mut buf);
        assert!(buf.len() <= MAX_LEN_32);

        let mut buf = Vec::new();
        encode_u64(u64::MAX, &mut buf);
        assert!(buf.len() <= MAX_LEN_64);
    }

    #[test]
    fn reader_writer_roundtrip() {
        let mut buf = Vec::new();
        write_u64(&mut buf, 123_456_789).unwrap();
        let mut cursor = &buf[..];
        let value = read_u64(&mut cursor).unwrap();
        assert_eq!(value, 123_456_789);
    }
}
