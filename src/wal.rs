// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The write-ahead log shared by both engines (C5), grounded on
//! `lsm/log.h`/`lsm/log.cc` in the original source.
//!
//! Records are split into fixed-size blocks so a reader can resynchronize
//! after a torn write without scanning the whole file. Each physical
//! fragment is framed as:
//!
//! ```text
//! +-------+-----+------+---------+
//! | crc32 | len | type | payload |
//! | 4B    | 2B  | 1B   | len B   |
//! +-------+-----+------+---------+
//! ```
//!
//! The checksum covers the type byte and the payload, not the length — same
//! as the source. A logical record larger than one block's free space is
//! split across `First`/`Middle`/`Last` fragments; one that fits whole is a
//! single `Full` fragment.

use std::io::{Read, Write};

use crate::{
    coding::{Crc32, DecodeError},
    env::AppendFile,
    Error, Result,
};

pub const BLOCK_SIZE: usize = 32 * 1024;
const HEADER_SIZE: usize = 4 + 2 + 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum RecordType {
    Zero = 0,
    Full = 1,
    First = 2,
    Middle = 3,
    Last = 4,
}

impl RecordType {
    fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::Zero),
            1 => Some(Self::Full),
            2 => Some(Self::First),
            3 => Some(Self::Middle),
            4 => Some(Self::Last),
            _ => None,
        }
    }
}

/// Appends records to one log file, fragmenting them across
/// [`BLOCK_SIZE`]-byte blocks.
pub struct LogWriter {
    file: Box<dyn AppendFile>,
    block_offset: usize,
}

impl LogWriter {
    #[must_use]
    pub fn new(file: Box<dyn AppendFile>) -> Self {
        Self {
            file,
            block_offset: 0,
        }
    }

    /// Resumes writing after `initial_offset` bytes already on disk
    /// (recovery from an existing log: the offset must land on a block
    /// boundary modulus, same as the source's assumption).
    #[must_use]
    pub fn resuming_at(file: Box<dyn AppendFile>, initial_offset: u64) -> Self {
        Self {
            file,
            block_offset: (initial_offset as usize) % BLOCK_SIZE,
        }
    }

    pub fn append(&mut self, record: &[u8]) -> Result<()> {
        let mut data = record;
        let mut begin = true;

        loop {
            let left_over = BLOCK_SIZE - self.block_offset;
            if left_over < HEADER_SIZE {
                if left_over > 0 {
                    self.file.write_all(&vec![0u8; left_over])?;
                }
                self.block_offset = 0;
            }

            let avail = BLOCK_SIZE - self.block_offset - HEADER_SIZE;
            let fragment_len = data.len().min(avail);
            let end = fragment_len == data.len();

            let record_type = match (begin, end) {
                (true, true) => RecordType::Full,
                (true, false) => RecordType::First,
                (false, true) => RecordType::Last,
                (false, false) => RecordType::Middle,
            };

            self.emit_physical_record(&data[..fragment_len], record_type)?;
            data = &data[fragment_len..];
            begin = false;

            if data.is_empty() {
                break;
            }
        }
        Ok(())
    }

    fn emit_physical_record(&mut self, payload: &[u8], record_type: RecordType) -> Result<()> {
        debug_assert!(payload.len() <= u16::MAX as usize);

        let checksum = Crc32::extend(Crc32::compute(&[record_type as u8]), payload);
        let mut header = [0u8; HEADER_SIZE];
        header[0..4].copy_from_slice(&checksum.as_u32().to_le_bytes());
        header[4..6].copy_from_slice(&(payload.len() as u16).to_le_bytes());
        header[6] = record_type as u8;

        self.file.write_all(&header)?;
        self.file.write_all(payload)?;
        self.block_offset += HEADER_SIZE + payload.len();
        Ok(())
    }

    pub fn sync(&mut self) -> Result<()> {
        self.file.sync()
    }
}

/// Reads records back out of a log file written by [`LogWriter`].
pub struct LogReader<R> {
    reader: R,
    block_offset: usize,
    verify_checksums: bool,
    eof: bool,
}

impl<R: Read> LogReader<R> {
    #[must_use]
    pub fn new(reader: R, verify_checksums: bool) -> Self {
        Self {
            reader,
            block_offset: 0,
            verify_checksums,
            eof: false,
        }
    }

    /// Reads the next logical record, re-assembling fragments as needed.
    /// Returns `Ok(None)` at a clean end of file.
    pub fn read(&mut self) -> Result<Option<Vec<u8>>> {
        if self.eof {
            return Ok(None);
        }

        let mut scratch = Vec::new();
        let mut segment = 0usize;

        loop {
            let left_over = BLOCK_SIZE - self.block_offset;
            if left_over < HEADER_SIZE {
                if left_over > 0 && self.skip(left_over).is_err() {
                    self.eof = true;
                    return Ok(if scratch.is_empty() { None } else { Some(scratch) });
                }
                self.block_offset = 0;
            }

            let Some((record_type, payload)) = self.read_physical_record()? else {
                self.eof = true;
                return Ok(if scratch.is_empty() { None } else { Some(scratch) });
            };

            segment += 1;
            scratch.extend_from_slice(&payload);

            match record_type {
                RecordType::Full | RecordType::Last => return Ok(Some(scratch)),
                RecordType::First | RecordType::Middle => {}
                RecordType::Zero => {
                    // Preallocated padding; treat as end of the written log.
                    self.eof = true;
                    return Ok(if segment > 1 { Some(scratch) } else { None });
                }
            }
        }
    }

    fn skip(&mut self, len: usize) -> std::io::Result<()> {
        let mut buf = vec![0u8; len];
        self.reader.read_exact(&mut buf)
    }

    fn read_physical_record(&mut self) -> Result<Option<(RecordType, Vec<u8>)>> {
        let mut header = [0u8; HEADER_SIZE];
        match self.reader.read_exact(&mut header) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        let checksum = u32::from_le_bytes(header[0..4].try_into().expect("4 bytes"));
        let len = u16::from_le_bytes(header[4..6].try_into().expect("2 bytes")) as usize;
        let record_type = RecordType::from_u8(header[6])
            .ok_or_else(|| Error::from(DecodeError::InvalidTag("wal record type")))?;

        let mut payload = vec![0u8; len];
        self.reader.read_exact(&mut payload)?;
        self.block_offset += HEADER_SIZE + len;

        if self.verify_checksums {
            let expected = Crc32::extend(Crc32::compute(&[header[6]]), &payload);
            if expected.as_u32() != checksum {
                return Err(Error::from(DecodeError::ChecksumMismatch {
                    expected: checksum,
                    got: expected.as_u32(),
                }));
            }
        }

        Ok(Some((record_type, payload)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        io::Cursor,
        sync::{Arc, Mutex},
    };
    use test_log::test;

    struct VecFile(Arc<Mutex<Vec<u8>>>);

    impl Write for VecFile {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().expect("lock poisoned").write(buf)
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl AppendFile for VecFile {
        fn sync(&mut self) -> Result<()> {
            Ok(())
        }
    }

    fn roundtrip(records: &[&[u8]]) -> Vec<Vec<u8>> {
        let backing = Arc::new(Mutex::new(Vec::new()));
        let mut writer = LogWriter::new(Box::new(VecFile(Arc::clone(&backing))));
        for record in records {
            writer.append(record).unwrap();
        }

        let bytes = backing.lock().unwrap().clone();
        let mut reader = LogReader::new(Cursor::new(bytes), true);
        let mut out = Vec::new();
        while let Some(record) = reader.read().unwrap() {
            out.push(record);
        }
        out
    }

    #[test]
    fn single_small_record_roundtrips() {
        let out = roundtrip(&[b"hello world"]);
        assert_eq!(out, vec![b"hello world".to_vec()]);
    }

    #[test]
    fn multiple_records_roundtrip_in_order() {
        let out = roundtrip(&[b"one", b"two", b"three"]);
        assert_eq!(
            out,
            vec![b"one".to_vec(), b"two".to_vec(), b"three".to_vec()]
        );
    }

    #[test]
    fn record_spanning_multiple_blocks_roundtrips() {
        let big = vec![b'x'; BLOCK_SIZE * 2 + 123];
        let out = roundtrip(&[&big]);
        assert_eq!(out, vec![big]);
    }

    #[test]
    fn corrupted_payload_is_detected() {
        let backing = Arc::new(Mutex::new(Vec::new()));
        let mut writer = LogWriter::new(Box::new(VecFile(Arc::clone(&backing))));
        writer.append(b"payload").unwrap();

        let mut bytes = backing.lock().unwrap().clone();
        let corrupt_at = HEADER_SIZE; // first payload byte
        bytes[corrupt_at] ^= 0xFF;

        let mut reader = LogReader::new(Cursor::new(bytes), true);
        assert!(reader.read().is_err());
    }

    #[test]
    fn empty_log_reads_as_none() {
        let mut reader = LogReader::new(Cursor::new(Vec::<u8>::new()), true);
        assert!(reader.read().unwrap().is_none());
    }
}
