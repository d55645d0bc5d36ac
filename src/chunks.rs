//! Chunk framing — the self-delimiting record layer of the archive format.
//!
//! # On-disk layout (all fields big-endian)
//!
//! ```text
//! Offset  Size  Field
//!    0      4   id       4 ASCII bytes ("BAR0", "FILE", "DATA", ...)
//!    4      8   length   body length in bytes (BE u64, header excluded)
//!   12      N   body     opaque; MAY contain further chunks (sub-chunks)
//! ```
//!
//! There is no padding between chunks; sub-chunks are tightly packed within
//! the parent body.  A header that cannot be fully read is end-of-archive,
//! not corruption — the writer is not crash-safe and a truncated tail is the
//! expected failure shape.  A declared length that exceeds the storage bounds
//! IS corruption.
//!
//! The writer back-patches each chunk's length on `end()`, so lengths are
//! exact even for streamed bodies whose size is unknown at `begin()` time.

use std::io::{self, Read, Seek, SeekFrom, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use log::debug;

use crate::errors::{Error, Result};

/// Fixed byte size of every chunk header (4-byte id + 8-byte length).
pub const CHUNK_HEADER_SIZE: u64 = 12;

// ── Chunk ids ────────────────────────────────────────────────────────────────

/// 4-byte ASCII chunk identifier.  The values below are frozen wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkId(pub [u8; 4]);

/// Archive header: version u16 ∥ flags u16.
pub const CHUNK_BAR0: ChunkId = ChunkId(*b"BAR0");
/// Key-derivation salt, 64 raw bytes.
pub const CHUNK_SALT: ChunkId = ChunkId(*b"SALT");
/// RSA-wrapped session key: len u32 ∥ bytes.
pub const CHUNK_KEY: ChunkId = ChunkId(*b"KEY0");
/// Archive meta attributes: (attr-id u16 ∥ attr-len u16 ∥ body)*.
pub const CHUNK_META: ChunkId = ChunkId(*b"META");
/// Entry starts, one id per entry kind.
pub const CHUNK_FILE: ChunkId = ChunkId(*b"FILE");
pub const CHUNK_IMAGE: ChunkId = ChunkId(*b"IMGE");
pub const CHUNK_DIRECTORY: ChunkId = ChunkId(*b"DIR0");
pub const CHUNK_LINK: ChunkId = ChunkId(*b"LINK");
pub const CHUNK_HARDLINK: ChunkId = ChunkId(*b"HLNK");
pub const CHUNK_SPECIAL: ChunkId = ChunkId(*b"SPEC");
/// Entry payload sub-chunk (inside an entry start).
pub const CHUNK_DATA: ChunkId = ChunkId(*b"DATA");
/// Hardlink peer name sub-chunk (repeatable inside HLNK, before DATA).
pub const CHUNK_HARDLINK_NAME: ChunkId = ChunkId(*b"HNAM");
/// Signature: algorithm u16 ∥ signature bytes.
pub const CHUNK_SIGNATURE: ChunkId = ChunkId(*b"SIGN");

impl ChunkId {
    /// Lossy ASCII rendering for diagnostics.
    pub fn as_str(&self) -> String {
        self.0.iter().map(|&b| b as char).collect()
    }

    /// True for ids defined by this format version.
    pub fn is_known(&self) -> bool {
        matches!(
            *self,
            CHUNK_BAR0
                | CHUNK_SALT
                | CHUNK_KEY
                | CHUNK_META
                | CHUNK_FILE
                | CHUNK_IMAGE
                | CHUNK_DIRECTORY
                | CHUNK_LINK
                | CHUNK_HARDLINK
                | CHUNK_SPECIAL
                | CHUNK_DATA
                | CHUNK_HARDLINK_NAME
                | CHUNK_SIGNATURE
        )
    }

    /// True for the six entry-start ids.
    pub fn is_entry_start(&self) -> bool {
        matches!(
            *self,
            CHUNK_FILE | CHUNK_IMAGE | CHUNK_DIRECTORY | CHUNK_LINK | CHUNK_HARDLINK | CHUNK_SPECIAL
        )
    }
}

impl std::fmt::Display for ChunkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ── Cursor ───────────────────────────────────────────────────────────────────

/// Position record for one chunk: where its body lives and how long it is.
/// The header sits at `body_offset - CHUNK_HEADER_SIZE`.
#[derive(Debug, Clone, Copy)]
pub struct ChunkCursor {
    pub id: ChunkId,
    pub body_offset: u64,
    pub body_len: u64,
}

impl ChunkCursor {
    /// Offset of the first byte after this chunk.
    #[inline]
    pub fn end_offset(&self) -> u64 {
        self.body_offset + self.body_len
    }

    /// Offset of the chunk header itself.
    #[inline]
    pub fn header_offset(&self) -> u64 {
        self.body_offset - CHUNK_HEADER_SIZE
    }
}

// ── Reader ───────────────────────────────────────────────────────────────────

/// Forward-only chunk reader.  Restartable only by reopening.
pub struct ChunkReader<R: Read + Seek> {
    inner: R,
    /// Total storage size, used to reject lengths that overrun the file.
    size: u64,
    /// Skip chunks with unknown ids instead of failing with `UNKNOWN_CHUNK`.
    skip_unknown: bool,
}

impl<R: Read + Seek> ChunkReader<R> {
    pub fn new(mut inner: R, skip_unknown: bool) -> Result<Self> {
        let pos = inner.stream_position()?;
        let size = inner.seek(SeekFrom::End(0))?;
        inner.seek(SeekFrom::Start(pos))?;
        Ok(Self { inner, size, skip_unknown })
    }

    /// Current read position.
    pub fn position(&mut self) -> Result<u64> {
        Ok(self.inner.stream_position()?)
    }

    pub fn seek(&mut self, offset: u64) -> Result<()> {
        self.inner.seek(SeekFrom::Start(offset))?;
        Ok(())
    }

    /// Read one chunk header at the current position.
    ///
    /// `None` means end-of-archive: either clean EOF or a header that could
    /// not be fully read (truncated tail from a crashed writer).  Unknown ids
    /// are skipped (with a debug log) when the reader was opened with
    /// `skip_unknown`, otherwise they fail with [`Error::UnknownChunk`].
    pub fn next(&mut self) -> Result<Option<ChunkCursor>> {
        loop {
            let header_offset = self.inner.stream_position()?;
            if header_offset + CHUNK_HEADER_SIZE > self.size {
                return Ok(None);
            }
            let mut id = [0u8; 4];
            if read_exact_or_eof(&mut self.inner, &mut id)?.is_none() {
                return Ok(None);
            }
            let body_len = match self.inner.read_u64::<BigEndian>() {
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
                Err(e) => return Err(e.into()),
            };
            let cursor = ChunkCursor {
                id: ChunkId(id),
                body_offset: header_offset + CHUNK_HEADER_SIZE,
                body_len,
            };
            if cursor.end_offset() > self.size {
                return Err(Error::CorruptData(format!(
                    "chunk {} at offset {} declares {} body bytes but only {} remain",
                    cursor.id,
                    header_offset,
                    body_len,
                    self.size - cursor.body_offset
                )));
            }
            if !cursor.id.is_known() {
                if self.skip_unknown {
                    debug!("skipping unknown chunk {} ({} bytes)", cursor.id, body_len);
                    self.skip(&cursor)?;
                    continue;
                }
                return Err(Error::UnknownChunk(cursor.id.as_str()));
            }
            return Ok(Some(cursor));
        }
    }

    /// Read the next sub-chunk within `parent`, or `None` once the parent
    /// body is exhausted.  The reader position must be inside the parent.
    pub fn next_in(&mut self, parent: &ChunkCursor) -> Result<Option<ChunkCursor>> {
        let pos = self.inner.stream_position()?;
        if pos + CHUNK_HEADER_SIZE > parent.end_offset() {
            return Ok(None);
        }
        match self.next()? {
            // A skip may have carried us past the parent; rewind and stop.
            Some(c) if c.header_offset() >= parent.end_offset() => {
                self.inner.seek(SeekFrom::Start(c.header_offset()))?;
                Ok(None)
            }
            Some(c) if c.end_offset() <= parent.end_offset() => Ok(Some(c)),
            Some(c) => Err(Error::CorruptData(format!(
                "sub-chunk {} overruns parent {} body",
                c.id, parent.id
            ))),
            None => Ok(None),
        }
    }

    /// Seek past the chunk body.
    pub fn skip(&mut self, cursor: &ChunkCursor) -> Result<()> {
        self.inner.seek(SeekFrom::Start(cursor.end_offset()))?;
        Ok(())
    }

    /// Read a whole (small) chunk body into memory.
    pub fn read_body(&mut self, cursor: &ChunkCursor) -> Result<Vec<u8>> {
        self.inner.seek(SeekFrom::Start(cursor.body_offset))?;
        let mut body = vec![0u8; cursor.body_len as usize];
        self.inner.read_exact(&mut body)?;
        Ok(body)
    }

    /// Bounded reader over the chunk body, for streamed payloads.
    pub fn body_reader(&mut self, cursor: &ChunkCursor) -> Result<BodyReader<'_, R>> {
        self.inner.seek(SeekFrom::Start(cursor.body_offset))?;
        Ok(BodyReader { inner: &mut self.inner, remaining: cursor.body_len })
    }

    /// Raw byte read of an arbitrary range, used by signature verification.
    pub fn read_range(&mut self, offset: u64, len: u64) -> Result<Vec<u8>> {
        self.inner.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; len as usize];
        self.inner.read_exact(&mut buf)?;
        Ok(buf)
    }

    pub fn storage_size(&self) -> u64 {
        self.size
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

/// `Read` bounded to one chunk body.
pub struct BodyReader<'a, R: Read + Seek> {
    inner: &'a mut R,
    remaining: u64,
}

impl<R: Read + Seek> BodyReader<'_, R> {
    pub fn remaining(&self) -> u64 {
        self.remaining
    }
}

impl<R: Read + Seek> Read for BodyReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.remaining == 0 {
            return Ok(0);
        }
        let want = buf.len().min(self.remaining as usize);
        let n = self.inner.read(&mut buf[..want])?;
        self.remaining -= n as u64;
        Ok(n)
    }
}

fn read_exact_or_eof<R: Read>(r: &mut R, buf: &mut [u8]) -> Result<Option<()>> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = r.read(&mut buf[filled..])?;
        if n == 0 {
            return Ok(None);
        }
        filled += n;
    }
    Ok(Some(()))
}

// ── Writer ───────────────────────────────────────────────────────────────────

/// Chunk writer with nested open slots.
///
/// `begin()` emits the header with a zero length placeholder; `end()` patches
/// the true body length in place.  Nested `begin()` under an open slot
/// produces a sub-chunk whose bytes count toward every enclosing body.
/// Not crash-safe: a crash mid-chunk leaves the archive truncated at the
/// last completed chunk.
pub struct ChunkWriter<W: Write + Seek> {
    inner: W,
    open: Vec<OpenSlot>,
}

struct OpenSlot {
    id: ChunkId,
    header_offset: u64,
}

impl<W: Write + Seek> ChunkWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner, open: Vec::new() }
    }

    pub fn position(&mut self) -> Result<u64> {
        Ok(self.inner.stream_position()?)
    }

    /// Open a chunk slot.  Returns the header offset.
    pub fn begin(&mut self, id: ChunkId) -> Result<u64> {
        let header_offset = self.inner.stream_position()?;
        self.inner.write_all(&id.0)?;
        self.inner.write_u64::<BigEndian>(0)?;
        self.open.push(OpenSlot { id, header_offset });
        Ok(header_offset)
    }

    /// Append bytes to the innermost open slot.
    pub fn write(&mut self, bytes: &[u8]) -> Result<()> {
        debug_assert!(!self.open.is_empty(), "write outside any open chunk");
        self.inner.write_all(bytes)?;
        Ok(())
    }

    /// Close the innermost open slot, back-patching its length.
    /// Returns the final body length.
    pub fn end(&mut self) -> Result<u64> {
        let slot = self
            .open
            .pop()
            .ok_or_else(|| Error::Internal("end() without begin()".into()))?;
        let end_pos = self.inner.stream_position()?;
        let body_len = end_pos - slot.header_offset - CHUNK_HEADER_SIZE;
        self.inner.seek(SeekFrom::Start(slot.header_offset + 4))?;
        self.inner.write_u64::<BigEndian>(body_len)?;
        self.inner.seek(SeekFrom::Start(end_pos))?;
        debug!("chunk {} closed, {} body bytes", slot.id, body_len);
        Ok(body_len)
    }

    /// Write a complete chunk whose body is already in memory.
    pub fn write_chunk(&mut self, id: ChunkId, body: &[u8]) -> Result<()> {
        self.inner.write_all(&id.0)?;
        self.inner.write_u64::<BigEndian>(body.len() as u64)?;
        self.inner.write_all(body)?;
        Ok(())
    }

    /// Patch arbitrary bytes at an absolute offset, preserving the current
    /// position.  Used to rewrite fragment fields in a closed entry header.
    pub fn patch(&mut self, offset: u64, bytes: &[u8]) -> Result<()> {
        let pos = self.inner.stream_position()?;
        self.inner.seek(SeekFrom::Start(offset))?;
        self.inner.write_all(bytes)?;
        self.inner.seek(SeekFrom::Start(pos))?;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.inner.flush()?;
        Ok(())
    }

    /// Depth of currently open slots.
    pub fn open_depth(&self) -> usize {
        self.open.len()
    }

    pub fn into_inner(self) -> W {
        self.inner
    }

    pub fn get_mut(&mut self) -> &mut W {
        &mut self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn roundtrip_nested() {
        let mut w = ChunkWriter::new(Cursor::new(Vec::new()));
        w.begin(CHUNK_FILE).unwrap();
        w.write(b"header-bytes").unwrap();
        w.begin(CHUNK_DATA).unwrap();
        w.write(b"payload").unwrap();
        w.end().unwrap();
        w.end().unwrap();
        w.write_chunk(CHUNK_SIGNATURE, b"sig").unwrap();
        let buf = w.into_inner().into_inner();

        let mut r = ChunkReader::new(Cursor::new(buf), false).unwrap();
        let file = r.next().unwrap().unwrap();
        assert_eq!(file.id, CHUNK_FILE);
        // 12 header bytes + DATA sub-chunk (12 + 7)
        assert_eq!(file.body_len, 12 + 12 + 7);

        r.seek(file.body_offset + 12).unwrap();
        let data = r.next_in(&file).unwrap().unwrap();
        assert_eq!(data.id, CHUNK_DATA);
        assert_eq!(r.read_body(&data).unwrap(), b"payload");
        assert!(r.next_in(&file).unwrap().is_none());

        r.seek(file.end_offset()).unwrap();
        let sig = r.next().unwrap().unwrap();
        assert_eq!(sig.id, CHUNK_SIGNATURE);
        assert_eq!(r.read_body(&sig).unwrap(), b"sig");
        r.seek(sig.end_offset()).unwrap();
        assert!(r.next().unwrap().is_none());
    }

    #[test]
    fn truncated_header_is_end_of_archive() {
        let mut w = ChunkWriter::new(Cursor::new(Vec::new()));
        w.write_chunk(CHUNK_SALT, &[0u8; 64]).unwrap();
        let mut buf = w.into_inner().into_inner();
        buf.extend_from_slice(b"FI"); // torn header tail

        let mut r = ChunkReader::new(Cursor::new(buf), false).unwrap();
        let salt = r.next().unwrap().unwrap();
        assert_eq!(salt.id, CHUNK_SALT);
        r.skip(&salt).unwrap();
        assert!(r.next().unwrap().is_none());
    }

    #[test]
    fn oversized_length_is_corrupt() {
        let mut buf = Vec::new();
        buf.extend_from_slice(b"SALT");
        buf.extend_from_slice(&u64::MAX.to_be_bytes());
        let mut r = ChunkReader::new(Cursor::new(buf), false).unwrap();
        assert!(matches!(r.next(), Err(Error::CorruptData(_))));
    }

    #[test]
    fn unknown_chunk_skip_flag() {
        let mut w = ChunkWriter::new(Cursor::new(Vec::new()));
        w.write_chunk(ChunkId(*b"XXXX"), b"future").unwrap();
        w.write_chunk(CHUNK_SALT, &[1u8; 64]).unwrap();
        let buf = w.into_inner().into_inner();

        let mut strict = ChunkReader::new(Cursor::new(buf.clone()), false).unwrap();
        assert!(matches!(strict.next(), Err(Error::UnknownChunk(_))));

        let mut lax = ChunkReader::new(Cursor::new(buf), true).unwrap();
        let c = lax.next().unwrap().unwrap();
        assert_eq!(c.id, CHUNK_SALT);
    }

    #[test]
    fn self_delimiting_walk_visits_every_top_chunk() {
        let mut w = ChunkWriter::new(Cursor::new(Vec::new()));
        for i in 0..7u8 {
            w.write_chunk(CHUNK_META, &vec![i; (i as usize + 1) * 3]).unwrap();
        }
        let buf = w.into_inner().into_inner();
        let mut r = ChunkReader::new(Cursor::new(buf), false).unwrap();
        let mut seen = 0;
        while let Some(c) = r.next().unwrap() {
            seen += 1;
            r.skip(&c).unwrap();
        }
        assert_eq!(seen, 7);
    }
}
