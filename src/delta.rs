//! Delta stage — source-predicted encoding against an external reader.
//!
//! The encoder compares the entry's bytes against a named delta source at
//! the same offsets, in fixed 4 KiB blocks.  Runs of matching blocks become
//! COPY records, everything else is carried literally.  Unchanged regions of
//! a large file therefore cost a few bytes regardless of size.
//!
//! # Record stream
//! ```text
//! 0x01  COPY    sourceOffset u64 BE ∥ length u64 BE
//! 0x02  INSERT  length u32 BE ∥ literal bytes
//! 0x00  END
//! ```
//!
//! The record stream is what enters the byte-compression stage; the
//! reconstructor is a pull reader binding the same named source.

use std::io::{Read, Seek, SeekFrom};

use byteorder::{BigEndian, ByteOrder};

use crate::errors::{Error, Result};

/// Comparison granularity of the encoder.
pub const DELTA_BLOCK_SIZE: usize = 4096;

const OP_END: u8 = 0x00;
const OP_COPY: u8 = 0x01;
const OP_INSERT: u8 = 0x02;

/// Seekable byte source used as prediction.
pub trait SourceReader: Read + Seek + Send {}
impl<T: Read + Seek + Send> SourceReader for T {}

/// One opened delta source.
pub struct DeltaSource {
    pub size: u64,
    pub reader: Box<dyn SourceReader>,
}

/// Name-indexed supplier of delta sources, shared read-only across workers.
pub trait DeltaSourceProvider: Send + Sync {
    /// `Ok(None)` when the provider has no source under this name; the
    /// pipeline turns that into `DELTA_SOURCE_NOT_FOUND` or degrades to
    /// no-delta when permitted.
    fn open(&self, name: &str) -> Result<Option<DeltaSource>>;
}

/// Provider with no sources; every lookup misses.
pub struct NoDeltaSources;

impl DeltaSourceProvider for NoDeltaSources {
    fn open(&self, _name: &str) -> Result<Option<DeltaSource>> {
        Ok(None)
    }
}

// ── Encoder ──────────────────────────────────────────────────────────────────

enum PendingOp {
    Copy { offset: u64, len: u64 },
    Insert(Vec<u8>),
}

/// Push-side delta encoder.
pub struct DeltaEncoder {
    source: Box<dyn SourceReader>,
    source_size: u64,
    /// Next offset in both streams (same-position prediction).
    position: u64,
    input_buf: Vec<u8>,
    pending: Option<PendingOp>,
    output: Vec<u8>,
    finished: bool,
    total_in: u64,
}

impl DeltaEncoder {
    pub fn new(source: DeltaSource) -> Self {
        Self::new_at(source, 0)
    }

    /// Encoder for an entry fragment starting at `offset`; copy records stay
    /// absolute into the source, so every fragment decodes standalone.
    pub fn new_at(source: DeltaSource, offset: u64) -> Self {
        Self {
            source: source.reader,
            source_size: source.size,
            position: offset,
            input_buf: Vec::new(),
            pending: None,
            output: Vec::new(),
            finished: false,
            total_in: 0,
        }
    }

    pub fn write(&mut self, input: &[u8]) -> Result<()> {
        debug_assert!(!self.finished, "write after finish");
        self.total_in += input.len() as u64;
        self.input_buf.extend_from_slice(input);
        while self.input_buf.len() >= DELTA_BLOCK_SIZE {
            let block: Vec<u8> = self.input_buf.drain(..DELTA_BLOCK_SIZE).collect();
            self.process_block(&block)?;
        }
        Ok(())
    }

    pub fn finish(&mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        if !self.input_buf.is_empty() {
            let block = std::mem::take(&mut self.input_buf);
            self.process_block(&block)?;
        }
        self.flush_pending();
        self.output.push(OP_END);
        Ok(())
    }

    pub fn take_output(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.output)
    }

    pub fn total_in(&self) -> u64 {
        self.total_in
    }

    fn process_block(&mut self, block: &[u8]) -> Result<()> {
        let offset = self.position;
        self.position += block.len() as u64;

        let matches = if offset + block.len() as u64 <= self.source_size {
            self.source.seek(SeekFrom::Start(offset))?;
            let mut src = vec![0u8; block.len()];
            self.source.read_exact(&mut src)?;
            src == block
        } else {
            false
        };

        if matches {
            match &mut self.pending {
                Some(PendingOp::Copy { offset: o, len }) if *o + *len == offset => {
                    *len += block.len() as u64;
                }
                _ => {
                    self.flush_pending();
                    self.pending = Some(PendingOp::Copy { offset, len: block.len() as u64 });
                }
            }
        } else {
            match &mut self.pending {
                Some(PendingOp::Insert(bytes)) => bytes.extend_from_slice(block),
                _ => {
                    self.flush_pending();
                    self.pending = Some(PendingOp::Insert(block.to_vec()));
                }
            }
        }
        Ok(())
    }

    fn flush_pending(&mut self) {
        match self.pending.take() {
            None => {}
            Some(PendingOp::Copy { offset, len }) => {
                self.output.push(OP_COPY);
                let mut fields = [0u8; 16];
                BigEndian::write_u64(&mut fields[..8], offset);
                BigEndian::write_u64(&mut fields[8..], len);
                self.output.extend_from_slice(&fields);
            }
            Some(PendingOp::Insert(bytes)) => {
                self.output.push(OP_INSERT);
                let mut len_field = [0u8; 4];
                BigEndian::write_u32(&mut len_field, bytes.len() as u32);
                self.output.extend_from_slice(&len_field);
                self.output.extend_from_slice(&bytes);
            }
        }
    }
}

// ── Reconstructor ────────────────────────────────────────────────────────────

enum DecodeState {
    /// Between records; the next byte is an opcode.
    NextOp,
    /// Streaming a COPY from the source.
    Copy { remaining: u64 },
    /// Streaming INSERT literals from the record stream.
    Insert { remaining: u64 },
    End,
}

/// Pull-side delta reconstructor: record stream + bound source → plain bytes.
pub struct DeltaReader {
    records: Box<dyn Read + Send>,
    source: Box<dyn SourceReader>,
    source_size: u64,
    state: DecodeState,
}

impl DeltaReader {
    pub fn new(records: Box<dyn Read + Send>, source: DeltaSource) -> Self {
        Self {
            records,
            source: source.reader,
            source_size: source.size,
            state: DecodeState::NextOp,
        }
    }

    fn read_record_header(&mut self) -> Result<DecodeState> {
        let mut op = [0u8; 1];
        self.records.read_exact(&mut op).map_err(|_| Error::EndOfFile)?;
        match op[0] {
            OP_END => Ok(DecodeState::End),
            OP_COPY => {
                let mut fields = [0u8; 16];
                self.records.read_exact(&mut fields).map_err(|_| Error::EndOfFile)?;
                let offset = BigEndian::read_u64(&fields[..8]);
                let len = BigEndian::read_u64(&fields[8..]);
                if offset + len > self.source_size {
                    return Err(Error::CorruptData(format!(
                        "delta copy {offset}+{len} exceeds source size {}",
                        self.source_size
                    )));
                }
                self.source.seek(SeekFrom::Start(offset))?;
                Ok(DecodeState::Copy { remaining: len })
            }
            OP_INSERT => {
                let mut len_field = [0u8; 4];
                self.records.read_exact(&mut len_field).map_err(|_| Error::EndOfFile)?;
                Ok(DecodeState::Insert { remaining: u64::from(BigEndian::read_u32(&len_field)) })
            }
            op => Err(Error::CorruptData(format!("unknown delta record 0x{op:02x}"))),
        }
    }
}

impl Read for DeltaReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        loop {
            match &mut self.state {
                DecodeState::End => return Ok(0),
                DecodeState::NextOp => {
                    self.state = self
                        .read_record_header()
                        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
                }
                DecodeState::Copy { remaining } => {
                    if *remaining == 0 {
                        self.state = DecodeState::NextOp;
                        continue;
                    }
                    let want = buf.len().min(*remaining as usize);
                    let n = self.source.read(&mut buf[..want])?;
                    if n == 0 {
                        return Err(std::io::Error::new(
                            std::io::ErrorKind::UnexpectedEof,
                            "delta source truncated",
                        ));
                    }
                    *remaining -= n as u64;
                    return Ok(n);
                }
                DecodeState::Insert { remaining } => {
                    if *remaining == 0 {
                        self.state = DecodeState::NextOp;
                        continue;
                    }
                    let want = buf.len().min(*remaining as usize);
                    let n = self.records.read(&mut buf[..want])?;
                    if n == 0 {
                        return Err(std::io::Error::new(
                            std::io::ErrorKind::UnexpectedEof,
                            "delta record stream truncated",
                        ));
                    }
                    *remaining -= n as u64;
                    return Ok(n);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn source_of(bytes: &[u8]) -> DeltaSource {
        DeltaSource { size: bytes.len() as u64, reader: Box::new(Cursor::new(bytes.to_vec())) }
    }

    fn encode(source: &[u8], input: &[u8]) -> Vec<u8> {
        let mut enc = DeltaEncoder::new(source_of(source));
        for block in input.chunks(1000) {
            enc.write(block).unwrap();
        }
        enc.finish().unwrap();
        enc.take_output()
    }

    fn decode(source: &[u8], records: Vec<u8>) -> Vec<u8> {
        let mut out = Vec::new();
        DeltaReader::new(Box::new(Cursor::new(records)), source_of(source))
            .read_to_end(&mut out)
            .unwrap();
        out
    }

    #[test]
    fn identical_input_is_one_copy() {
        let data: Vec<u8> = (0..64 * 1024u32).map(|i| (i % 253) as u8).collect();
        let records = encode(&data, &data);
        // COPY header + END, no literals.
        assert_eq!(records.len(), 1 + 16 + 1);
        assert_eq!(decode(&data, records), data);
    }

    #[test]
    fn single_byte_change_stays_small() {
        let source: Vec<u8> = (0..1024 * 1024u32).map(|i| (i % 247) as u8).collect();
        let mut input = source.clone();
        input[500_000] ^= 0xFF;
        let records = encode(&source, &input);
        // One literal block plus copy records.
        assert!(records.len() < 2 * DELTA_BLOCK_SIZE, "records = {}", records.len());
        assert_eq!(decode(&source, records), input);
    }

    #[test]
    fn input_longer_than_source() {
        let source = vec![1u8; 8192];
        let mut input = vec![1u8; 8192];
        input.extend_from_slice(&[7u8; 5000]);
        let records = encode(&source, &input);
        assert_eq!(decode(&source, records), input);
    }

    #[test]
    fn empty_input() {
        let records = encode(b"some source", b"");
        assert_eq!(records, vec![OP_END]);
        assert_eq!(decode(b"some source", records), b"");
    }

    #[test]
    fn copy_past_source_end_is_corrupt() {
        let mut records = Vec::new();
        records.push(OP_COPY);
        records.extend_from_slice(&100u64.to_be_bytes());
        records.extend_from_slice(&100u64.to_be_bytes());
        records.push(OP_END);
        let mut out = Vec::new();
        let err = DeltaReader::new(Box::new(Cursor::new(records)), source_of(b"short"))
            .read_to_end(&mut out)
            .unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }
}
