//! Chunk codec: splitting an outbound file into ordered byte ranges and
//! reassembling an inbound one.
//!
//! The sender picks the chunk size; only the resulting `chunk_count`
//! travels in the metadata message. The receiver therefore never assumes a
//! chunk length, it appends whatever arrives in index order and completes
//! once `received == expected`.
//!
//! Chunk `i` covers bytes `[i * chunk_size, min((i + 1) * chunk_size, N))`;
//! the last chunk is the unpadded remainder.

use bytes::{Bytes, BytesMut};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;
use tracing::warn;

use crate::core::error::TransferError;

/// One ordered slice of the source file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkRange {
    /// Zero-based index within the file.
    pub index: u32,
    /// Byte offset of the first byte.
    pub offset: u64,
    /// Length in bytes (equal to the chunk size except possibly for the last).
    pub len: usize,
}

/// `ceil(byte_size / chunk_size)`; zero bytes yields zero chunks.
///
/// Chunk indices are `u32` on the wire, so a file that would need more
/// chunks than that is rejected.
pub fn chunk_count(byte_size: u64, chunk_size: usize) -> Result<u32, TransferError> {
    debug_assert!(chunk_size > 0);
    let chunk_size = chunk_size.max(1) as u64;
    let count = byte_size.div_ceil(chunk_size);
    u32::try_from(count).map_err(|_| {
        TransferError::Validation(format!(
            "{byte_size} bytes in {chunk_size}-byte chunks needs {count} chunks"
        ))
    })
}

/// Ordered byte ranges covering `[0, byte_size)`.
pub fn split(byte_size: u64, chunk_size: usize) -> Result<Vec<ChunkRange>, TransferError> {
    let chunk_size = chunk_size.max(1);
    let count = chunk_count(byte_size, chunk_size)?;
    Ok((0..count)
        .map(|index| {
            let offset = index as u64 * chunk_size as u64;
            let len = (byte_size - offset).min(chunk_size as u64) as usize;
            ChunkRange { index, offset, len }
        })
        .collect())
}

// ── Outbound ─────────────────────────────────────────────────────────────────

/// Where an outbound file's bytes come from.
#[derive(Debug, Clone)]
pub enum FileSource {
    /// Already in memory (tests, small payloads).
    Memory(Bytes),
    /// Read lazily from disk, one range at a time.
    Path(PathBuf),
}

impl FileSource {
    /// A reader that materializes ranges of this source.
    pub fn reader(&self) -> ChunkReader {
        ChunkReader {
            source: self.clone(),
            file: None,
        }
    }
}

/// Materializes chunk bytes from a [`FileSource`].
///
/// Keeps the file handle open between calls so sequential reads don't
/// reopen the file for every chunk.
pub struct ChunkReader {
    source: FileSource,
    file: Option<File>,
}

impl ChunkReader {
    /// Produce the bytes for `range`.
    pub fn encode_chunk(&mut self, range: &ChunkRange) -> std::io::Result<Bytes> {
        match &self.source {
            FileSource::Memory(data) => {
                let start = range.offset as usize;
                let end = start + range.len;
                if end > data.len() {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        format!("range {start}..{end} beyond {} bytes", data.len()),
                    ));
                }
                Ok(data.slice(start..end))
            }
            FileSource::Path(path) => {
                let file = match &mut self.file {
                    Some(f) => f,
                    None => self.file.insert(File::open(path)?),
                };
                file.seek(SeekFrom::Start(range.offset))?;
                let mut buf = vec![0u8; range.len];
                file.read_exact(&mut buf)?;
                Ok(Bytes::from(buf))
            }
        }
    }
}

// ── Inbound ──────────────────────────────────────────────────────────────────

/// Result of offering one chunk to an [`Assembly`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// Appended; more chunks are expected.
    Accepted { received: u32 },
    /// Appended and this was the last expected chunk.
    Complete,
    /// Out of order, duplicate, or past the announced count. Dropped.
    Discarded,
}

/// Receiver-side reassembly of one file.
#[derive(Debug)]
pub struct Assembly {
    expected: u32,
    received: u32,
    byte_size: u64,
    buf: BytesMut,
}

/// Upper bound on up-front reservation; larger files grow as chunks land.
const MAX_PREALLOC: u64 = 64 * 1024 * 1024;

impl Assembly {
    pub fn new(chunk_count: u32, byte_size: u64) -> Self {
        Self {
            expected: chunk_count,
            received: 0,
            byte_size,
            buf: BytesMut::with_capacity(byte_size.min(MAX_PREALLOC) as usize),
        }
    }

    pub fn expected(&self) -> u32 {
        self.expected
    }

    pub fn received(&self) -> u32 {
        self.received
    }

    pub fn is_complete(&self) -> bool {
        self.received == self.expected
    }

    /// `received / expected * 100`; an empty file is complete from the start.
    pub fn progress_percent(&self) -> f64 {
        if self.expected == 0 {
            100.0
        } else {
            self.received as f64 / self.expected as f64 * 100.0
        }
    }

    /// Append chunk `index`. Only the next index in sequence is accepted.
    pub fn append_received(&mut self, index: u32, data: &[u8]) -> AppendOutcome {
        if index != self.received || self.received >= self.expected {
            warn!(
                event = "chunk_discarded",
                index,
                expected_index = self.received,
                chunk_count = self.expected,
                "Discarding chunk with unexpected index"
            );
            return AppendOutcome::Discarded;
        }
        self.buf.extend_from_slice(data);
        self.received += 1;
        if self.is_complete() {
            AppendOutcome::Complete
        } else {
            AppendOutcome::Accepted {
                received: self.received,
            }
        }
    }

    /// Hand out the reassembled file once every chunk has arrived.
    pub fn finalize(self) -> Result<Bytes, TransferError> {
        if !self.is_complete() {
            return Err(TransferError::CountMismatch {
                expected: self.expected,
                received: self.received,
            });
        }
        if self.buf.len() as u64 != self.byte_size {
            warn!(
                event = "assembly_size_mismatch",
                announced = self.byte_size,
                actual = self.buf.len(),
                "Reassembled size differs from announced size"
            );
        }
        Ok(self.buf.freeze())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pattern(n: usize) -> Bytes {
        Bytes::from((0..n).map(|i| (i % 251) as u8).collect::<Vec<_>>())
    }

    #[test]
    fn chunk_count_is_ceiling() {
        assert_eq!(chunk_count(0, 16_384), Ok(0));
        assert_eq!(chunk_count(1, 16_384), Ok(1));
        assert_eq!(chunk_count(16_384, 16_384), Ok(1));
        assert_eq!(chunk_count(16_385, 16_384), Ok(2));
        assert_eq!(chunk_count(10_000_000, 16_384), Ok(611));
        for n in 0..200u64 {
            for c in 1..17usize {
                assert_eq!(chunk_count(n, c).map(u64::from), Ok(n.div_ceil(c as u64)));
            }
        }
    }

    #[test]
    fn chunk_count_beyond_u32_is_rejected() {
        let max = u64::from(u32::MAX);
        assert_eq!(chunk_count(max, 1), Ok(u32::MAX));
        assert!(matches!(chunk_count(max + 1, 1), Err(TransferError::Validation(_))));
        assert!(matches!(chunk_count(u64::MAX, 16), Err(TransferError::Validation(_))));
        assert!(split(max + 1, 1).is_err());
    }

    #[test]
    fn split_covers_file_with_unpadded_tail() {
        let ranges = split(10_000_000, 16_384).unwrap();
        assert_eq!(ranges.len(), 611);
        assert_eq!(ranges[0], ChunkRange { index: 0, offset: 0, len: 16_384 });
        let last = ranges[610];
        assert_eq!(last.offset, 610 * 16_384);
        assert_eq!(last.len, 10_000_000 - 610 * 16_384);
        let total: u64 = ranges.iter().map(|r| r.len as u64).sum();
        assert_eq!(total, 10_000_000);
        assert!(split(0, 16_384).unwrap().is_empty());
    }

    #[test]
    fn ten_megabytes_round_trip() {
        let data = pattern(10_000_000);
        let mut reader = FileSource::Memory(data.clone()).reader();
        let ranges = split(data.len() as u64, 16_384).unwrap();
        let mut asm = Assembly::new(ranges.len() as u32, data.len() as u64);

        for r in &ranges {
            let chunk = reader.encode_chunk(r).unwrap();
            let outcome = asm.append_received(r.index, &chunk);
            if r.index as usize == ranges.len() - 1 {
                assert_eq!(outcome, AppendOutcome::Complete);
            } else {
                assert_eq!(outcome, AppendOutcome::Accepted { received: r.index + 1 });
            }
        }
        let rebuilt = asm.finalize().unwrap();
        assert_eq!(rebuilt.len(), 10_000_000);
        assert_eq!(rebuilt, data);
    }

    #[test]
    fn empty_file_is_complete_immediately() {
        let asm = Assembly::new(0, 0);
        assert!(asm.is_complete());
        assert_eq!(asm.progress_percent(), 100.0);
        assert!(asm.finalize().unwrap().is_empty());
    }

    #[test]
    fn out_of_order_and_duplicate_chunks_are_discarded() {
        let mut asm = Assembly::new(3, 3);
        assert_eq!(asm.append_received(1, b"b"), AppendOutcome::Discarded);
        assert_eq!(asm.append_received(0, b"a"), AppendOutcome::Accepted { received: 1 });
        assert_eq!(asm.append_received(0, b"a"), AppendOutcome::Discarded);
        assert_eq!(asm.append_received(1, b"b"), AppendOutcome::Accepted { received: 2 });
        assert_eq!(asm.received(), 2);

        let err = asm.finalize().unwrap_err();
        assert_eq!(
            err,
            TransferError::CountMismatch {
                expected: 3,
                received: 2
            }
        );
    }

    #[test]
    fn chunks_past_count_are_discarded() {
        let mut asm = Assembly::new(1, 1);
        assert_eq!(asm.append_received(0, b"x"), AppendOutcome::Complete);
        assert_eq!(asm.append_received(1, b"y"), AppendOutcome::Discarded);
        assert_eq!(asm.finalize().unwrap(), Bytes::from_static(b"x"));
    }

    #[test]
    fn path_source_reads_ranges() {
        let path = std::env::temp_dir().join(format!("peerdrop_chunk_{}.bin", std::process::id()));
        let data = pattern(40_000);
        std::fs::write(&path, &data).unwrap();

        let mut reader = FileSource::Path(path.clone()).reader();
        let ranges = split(data.len() as u64, 16_384).unwrap();
        let mut rebuilt = Vec::new();
        // Read backwards to exercise seeking on the cached handle.
        for r in ranges.iter().rev() {
            let chunk = reader.encode_chunk(r).unwrap();
            assert_eq!(chunk.len(), r.len);
            rebuilt.insert(0, chunk);
        }
        assert_eq!(rebuilt.concat(), data.to_vec());

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn memory_source_rejects_out_of_bounds() {
        let mut reader = FileSource::Memory(Bytes::from_static(b"abc")).reader();
        let bad = ChunkRange { index: 0, offset: 2, len: 4 };
        assert!(reader.encode_chunk(&bad).is_err());
    }
}
