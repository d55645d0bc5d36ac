//! Byte-compression stage — stateless stream codecs.
//!
//! Two orthogonal stages run per entry: the delta stage (`delta.rs`) and the
//! byte stage here.  Either may be `none`.
//!
//! # Wire code (u16, frozen)
//! `algorithmId << 4 | level`.  Ids: 0 none · 1 zip (raw deflate) · 2 bzip2 ·
//! 3 lzma · 4 xdelta (reserved for the delta stage, never a byte codec) ·
//! 5 zstd.  The 4-bit level field caps at 15; zstd levels 16–19 are clamped
//! on the wire, which only affects re-compression hints, never decoding.
//!
//! # Streaming contract
//! Compressors are push/drain: the pipeline feeds input blocks with
//! `write()`, drains produced bytes with `take_output()`, and `finish()`
//! emits the trailing frame after which no further input is accepted.
//! Decompressors are pull readers composing over the decrypted stream.
//! Byte counters are informational only and never gate correctness.

use std::io::{self, Cursor, Read, Write};
use std::sync::{Arc, Mutex};

use crate::errors::{Error, Result};

/// Pump block size recommended for the entry pipeline.
pub const PIPELINE_BLOCK_SIZE: usize = 1024 * 1024;

// ── Algorithm table ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteAlgorithm {
    None,
    /// Raw deflate, levels 0–9.
    Zip(u8),
    /// bzip2, levels 1–9.
    Bzip2(u8),
    /// LZMA, levels 1–9 (level is a re-compression hint only).
    Lzma(u8),
    /// Zstandard, levels 1–19.
    Zstd(u8),
}

impl ByteAlgorithm {
    pub fn wire_code(self) -> u16 {
        let (id, level) = match self {
            ByteAlgorithm::None => (0u16, 0u8),
            ByteAlgorithm::Zip(l) => (1, l),
            ByteAlgorithm::Bzip2(l) => (2, l),
            ByteAlgorithm::Lzma(l) => (3, l),
            ByteAlgorithm::Zstd(l) => (5, l.min(15)),
        };
        (id << 4) | u16::from(level & 0x0F)
    }

    pub fn from_wire_code(code: u16) -> Result<Self> {
        let level = (code & 0x0F) as u8;
        match code >> 4 {
            0 => Ok(ByteAlgorithm::None),
            1 => Ok(ByteAlgorithm::Zip(level)),
            2 => Ok(ByteAlgorithm::Bzip2(level)),
            3 => Ok(ByteAlgorithm::Lzma(level)),
            4 => Err(Error::FunctionNotSupported("xdelta as byte codec")),
            5 => Ok(ByteAlgorithm::Zstd(level)),
            id => Err(Error::CorruptData(format!("unknown compression algorithm id {id}"))),
        }
    }

    pub fn name(self) -> String {
        match self {
            ByteAlgorithm::None => "none".into(),
            ByteAlgorithm::Zip(l) => format!("zip{l}"),
            ByteAlgorithm::Bzip2(l) => format!("bzip2-{l}"),
            ByteAlgorithm::Lzma(l) => format!("lzma{l}"),
            ByteAlgorithm::Zstd(l) => format!("zstd{l}"),
        }
    }

    /// Parse a CLI spelling: algorithm name with an optional trailing level
    /// ("zstd", "zstd19", "zip9", "bzip2-9").
    pub fn from_name(s: &str) -> Option<Self> {
        let s = s.to_lowercase();
        let split = |prefix: &str, default: u8, min: u8, max: u8| -> Option<u8> {
            let rest = s.strip_prefix(prefix)?;
            let rest = rest.strip_prefix('-').unwrap_or(rest);
            if rest.is_empty() {
                return Some(default);
            }
            let level: u8 = rest.parse().ok()?;
            (min..=max).contains(&level).then_some(level)
        };
        if s == "none" {
            Some(ByteAlgorithm::None)
        } else if let Some(l) = split("zstd", 3, 1, 19) {
            Some(ByteAlgorithm::Zstd(l))
        } else if let Some(l) = split("bzip2", 9, 1, 9) {
            Some(ByteAlgorithm::Bzip2(l))
        } else if let Some(l) = split("lzma", 6, 1, 9) {
            Some(ByteAlgorithm::Lzma(l))
        } else if let Some(l) = split("zip", 6, 0, 9) {
            Some(ByteAlgorithm::Zip(l))
        } else {
            None
        }
    }

    #[inline]
    pub fn is_none(self) -> bool {
        self == ByteAlgorithm::None
    }
}

// ── Shared sink ──────────────────────────────────────────────────────────────

/// Byte sink shared between an owning encoder and the pipeline, so produced
/// output can be drained while the encoder stays alive.
#[derive(Clone, Default)]
struct SharedSink(Arc<Mutex<Vec<u8>>>);

impl SharedSink {
    fn drain(&self) -> Vec<u8> {
        std::mem::take(&mut *self.0.lock().unwrap())
    }

    fn len(&self) -> usize {
        self.0.lock().unwrap().len()
    }
}

impl Write for SharedSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

// ── Compressor (push side) ───────────────────────────────────────────────────

/// Push-side byte compressor.  `finish()` asserts "no further input".
pub trait ByteCompressor: Send {
    fn write(&mut self, input: &[u8]) -> Result<()>;
    fn finish(&mut self) -> Result<()>;
    /// Drain bytes produced so far.
    fn take_output(&mut self) -> Vec<u8>;
    fn total_in(&self) -> u64;
    fn total_out(&self) -> u64;
}

enum Engine {
    None,
    Zip(Option<flate2::write::DeflateEncoder<SharedSink>>),
    Bzip2(Option<bzip2::write::BzEncoder<SharedSink>>),
    /// lzma-rs has no streaming encoder; input accumulates until finish.
    Lzma(Vec<u8>),
    Zstd(Option<zstd::stream::write::Encoder<'static, SharedSink>>),
}

pub struct Compressor {
    engine: Engine,
    sink: SharedSink,
    finished: bool,
    total_in: u64,
    drained_out: u64,
}

impl Compressor {
    pub fn new(algorithm: ByteAlgorithm) -> Result<Self> {
        let sink = SharedSink::default();
        let engine = match algorithm {
            ByteAlgorithm::None => Engine::None,
            ByteAlgorithm::Zip(level) => Engine::Zip(Some(flate2::write::DeflateEncoder::new(
                sink.clone(),
                flate2::Compression::new(u32::from(level)),
            ))),
            ByteAlgorithm::Bzip2(level) => Engine::Bzip2(Some(bzip2::write::BzEncoder::new(
                sink.clone(),
                bzip2::Compression::new(u32::from(level)),
            ))),
            ByteAlgorithm::Lzma(_) => Engine::Lzma(Vec::new()),
            ByteAlgorithm::Zstd(level) => Engine::Zstd(Some(
                zstd::stream::write::Encoder::new(sink.clone(), i32::from(level))
                    .map_err(|e| Error::DeflateFail(e.to_string()))?,
            )),
        };
        Ok(Self { engine, sink, finished: false, total_in: 0, drained_out: 0 })
    }
}

impl ByteCompressor for Compressor {
    fn write(&mut self, input: &[u8]) -> Result<()> {
        debug_assert!(!self.finished, "write after finish");
        self.total_in += input.len() as u64;
        let deflate = |e: io::Error| Error::DeflateFail(e.to_string());
        match &mut self.engine {
            Engine::None => self.sink.write_all(input).map_err(deflate)?,
            Engine::Zip(enc) => enc.as_mut().unwrap().write_all(input).map_err(deflate)?,
            Engine::Bzip2(enc) => enc.as_mut().unwrap().write_all(input).map_err(deflate)?,
            Engine::Lzma(buf) => buf.extend_from_slice(input),
            Engine::Zstd(enc) => enc.as_mut().unwrap().write_all(input).map_err(deflate)?,
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        let deflate = |e: io::Error| Error::DeflateFail(e.to_string());
        match &mut self.engine {
            Engine::None => {}
            Engine::Zip(enc) => {
                enc.take().unwrap().finish().map_err(deflate)?;
            }
            Engine::Bzip2(enc) => {
                enc.take().unwrap().finish().map_err(deflate)?;
            }
            Engine::Lzma(buf) => {
                let input = std::mem::take(buf);
                lzma_rs::lzma_compress(&mut Cursor::new(input), &mut self.sink)
                    .map_err(|e| Error::DeflateFail(e.to_string()))?;
            }
            Engine::Zstd(enc) => {
                enc.take().unwrap().finish().map_err(deflate)?;
            }
        }
        Ok(())
    }

    fn take_output(&mut self) -> Vec<u8> {
        let out = self.sink.drain();
        self.drained_out += out.len() as u64;
        out
    }

    fn total_in(&self) -> u64 {
        self.total_in
    }

    fn total_out(&self) -> u64 {
        self.drained_out + self.sink.len() as u64
    }
}

// ── Decompressor (pull side) ─────────────────────────────────────────────────

/// Pull-side decompressor over the decrypted byte stream.
///
/// The returned reader terminates at the compressed stream's own end; any
/// cipher padding after it is never consumed.
pub fn make_decompressor(
    algorithm: ByteAlgorithm,
    inner: Box<dyn Read + Send>,
) -> Result<Box<dyn Read + Send>> {
    Ok(match algorithm {
        ByteAlgorithm::None => inner,
        ByteAlgorithm::Zip(_) => Box::new(flate2::read::DeflateDecoder::new(inner)),
        ByteAlgorithm::Bzip2(_) => Box::new(bzip2::read::BzDecoder::new(inner)),
        ByteAlgorithm::Lzma(_) => {
            // One-shot codec: inflate fully, then serve from memory.
            let mut input = Vec::new();
            let mut inner = inner;
            inner.read_to_end(&mut input)?;
            let mut output = Vec::new();
            lzma_rs::lzma_decompress(&mut Cursor::new(input), &mut output)
                .map_err(|e| Error::InflateFail(e.to_string()))?;
            Box::new(Cursor::new(output))
        }
        ByteAlgorithm::Zstd(_) => Box::new(
            zstd::stream::read::Decoder::new(inner)
                .map_err(|e| Error::InflateFail(e.to_string()))?,
        ),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(algorithm: ByteAlgorithm, data: &[u8]) -> Vec<u8> {
        let mut c = Compressor::new(algorithm).unwrap();
        let mut compressed = Vec::new();
        for block in data.chunks(1024) {
            c.write(block).unwrap();
            compressed.extend(c.take_output());
        }
        c.finish().unwrap();
        compressed.extend(c.take_output());
        assert_eq!(c.total_in(), data.len() as u64);
        assert_eq!(c.total_out(), compressed.len() as u64);

        let mut out = Vec::new();
        make_decompressor(algorithm, Box::new(Cursor::new(compressed)))
            .unwrap()
            .read_to_end(&mut out)
            .unwrap();
        out
    }

    #[test]
    fn all_codecs_roundtrip() {
        let data: Vec<u8> = (0..40_000u32).map(|i| (i % 251) as u8).collect();
        for alg in [
            ByteAlgorithm::None,
            ByteAlgorithm::Zip(6),
            ByteAlgorithm::Bzip2(9),
            ByteAlgorithm::Lzma(6),
            ByteAlgorithm::Zstd(3),
        ] {
            assert_eq!(roundtrip(alg, &data), data, "{}", alg.name());
        }
    }

    #[test]
    fn none_is_identity_length() {
        let data = vec![42u8; 1000];
        let mut c = Compressor::new(ByteAlgorithm::None).unwrap();
        c.write(&data).unwrap();
        c.finish().unwrap();
        assert_eq!(c.take_output().len(), data.len());
    }

    #[test]
    fn trailing_garbage_after_stream_is_ignored() {
        let mut c = Compressor::new(ByteAlgorithm::Zstd(3)).unwrap();
        c.write(b"payload bytes").unwrap();
        c.finish().unwrap();
        let mut compressed = c.take_output();
        compressed.extend_from_slice(&[0u8; 16]); // cipher block padding
        let mut out = Vec::new();
        make_decompressor(ByteAlgorithm::Zstd(3), Box::new(Cursor::new(compressed)))
            .unwrap()
            .read_to_end(&mut out)
            .unwrap();
        assert_eq!(out, b"payload bytes");
    }

    #[test]
    fn wire_codes() {
        assert_eq!(ByteAlgorithm::None.wire_code(), 0);
        assert_eq!(ByteAlgorithm::Zip(6).wire_code(), 0x16);
        assert_eq!(ByteAlgorithm::Zstd(19).wire_code(), 0x5F); // clamped level
        assert_eq!(
            ByteAlgorithm::from_wire_code(0x29).unwrap(),
            ByteAlgorithm::Bzip2(9)
        );
        assert!(matches!(
            ByteAlgorithm::from_wire_code(0x40),
            Err(Error::FunctionNotSupported(_))
        ));
    }

    #[test]
    fn name_parsing() {
        assert_eq!(ByteAlgorithm::from_name("zstd19"), Some(ByteAlgorithm::Zstd(19)));
        assert_eq!(ByteAlgorithm::from_name("bzip2-5"), Some(ByteAlgorithm::Bzip2(5)));
        assert_eq!(ByteAlgorithm::from_name("zip"), Some(ByteAlgorithm::Zip(6)));
        assert_eq!(ByteAlgorithm::from_name("none"), Some(ByteAlgorithm::None));
        assert_eq!(ByteAlgorithm::from_name("zstd99"), None);
    }
}
