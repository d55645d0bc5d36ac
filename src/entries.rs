//! Entry model — one logical filesystem object and its wire encoding.
//!
//! # Entry-start body layout (big-endian)
//!
//! ```text
//! compressionAlg u16 ∥ cryptAlg u16 ∥ cryptSalt[32]
//! ∥ fragmentOffset u64 ∥ fragmentSize u64
//! ∥ name (u16 len ∥ utf-8)
//! ∥ size u64 ∥ mtime u64 ∥ atime u64 ∥ ctime u64
//! ∥ uid u32 ∥ gid u32 ∥ mode u32 ∥ attributes u64
//! ∥ userName (u16 len ∥ utf-8) ∥ groupName (u16 len ∥ utf-8)
//! ∥ xattrCount u16 ∥ (nameLen u16 ∥ name ∥ valueLen u32 ∥ value)*
//! ∥ kind-specific extension
//! ```
//!
//! Kind extensions: LINK target string; HLNK peer count (names travel in
//! HNAM sub-chunks); SPEC special-kind u16 ∥ major u32 ∥ minor u32; IMGE
//! blockSize u32 ∥ filesystemAware u8.  FILE and DIR0 have none.
//!
//! The fragment fields sit at fixed offsets 36 and 44 so the container can
//! patch them when an entry is split across volumes.

use std::io::{Cursor, Read};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::chunks::{
    ChunkId, CHUNK_DIRECTORY, CHUNK_FILE, CHUNK_HARDLINK, CHUNK_IMAGE, CHUNK_LINK, CHUNK_SPECIAL,
};
use crate::compress::ByteAlgorithm;
use crate::crypt::{CryptAlgorithm, ENTRY_SALT_LEN};
use crate::errors::{Error, Result};

/// Byte offset of `fragmentOffset` within an entry-start body.
pub const FRAGMENT_OFFSET_FIELD: u64 = 36;
/// Byte offset of `fragmentSize` within an entry-start body.
pub const FRAGMENT_SIZE_FIELD: u64 = 44;

// ── Kinds ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryKind {
    File,
    Image,
    Directory,
    Link,
    Hardlink,
    Special,
}

impl EntryKind {
    pub fn chunk_id(self) -> ChunkId {
        match self {
            EntryKind::File => CHUNK_FILE,
            EntryKind::Image => CHUNK_IMAGE,
            EntryKind::Directory => CHUNK_DIRECTORY,
            EntryKind::Link => CHUNK_LINK,
            EntryKind::Hardlink => CHUNK_HARDLINK,
            EntryKind::Special => CHUNK_SPECIAL,
        }
    }

    pub fn from_chunk_id(id: ChunkId) -> Option<Self> {
        match id {
            CHUNK_FILE => Some(EntryKind::File),
            CHUNK_IMAGE => Some(EntryKind::Image),
            CHUNK_DIRECTORY => Some(EntryKind::Directory),
            CHUNK_LINK => Some(EntryKind::Link),
            CHUNK_HARDLINK => Some(EntryKind::Hardlink),
            CHUNK_SPECIAL => Some(EntryKind::Special),
            _ => None,
        }
    }

    /// File, image and hardlink entries carry payload bytes.
    pub fn has_payload(self) -> bool {
        matches!(self, EntryKind::File | EntryKind::Image | EntryKind::Hardlink)
    }

    pub fn name(self) -> &'static str {
        match self {
            EntryKind::File => "file",
            EntryKind::Image => "image",
            EntryKind::Directory => "directory",
            EntryKind::Link => "link",
            EntryKind::Hardlink => "hardlink",
            EntryKind::Special => "special",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpecialKind {
    CharDevice,
    BlockDevice,
    Fifo,
    Socket,
}

impl SpecialKind {
    pub fn wire_code(self) -> u16 {
        match self {
            SpecialKind::CharDevice => 0,
            SpecialKind::BlockDevice => 1,
            SpecialKind::Fifo => 2,
            SpecialKind::Socket => 3,
        }
    }

    pub fn from_wire_code(code: u16) -> Result<Self> {
        match code {
            0 => Ok(SpecialKind::CharDevice),
            1 => Ok(SpecialKind::BlockDevice),
            2 => Ok(SpecialKind::Fifo),
            3 => Ok(SpecialKind::Socket),
            _ => Err(Error::CorruptData(format!("unknown special kind {code}"))),
        }
    }
}

// ── File attributes ──────────────────────────────────────────────────────────

/// Filesystem attribute flag bits of the `attributes` field.
pub mod attributes {
    pub const COMPRESS: u64 = 0x01;
    pub const NO_COMPRESS: u64 = 0x02;
    pub const IMMUTABLE: u64 = 0x04;
    pub const APPEND: u64 = 0x08;
    pub const NO_DUMP: u64 = 0x10;
}

// ── File info ────────────────────────────────────────────────────────────────

/// Stat-like metadata captured for every entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileInfo {
    pub size: u64,
    pub mtime: u64,
    pub atime: u64,
    pub ctime: u64,
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
    pub attributes: u64,
    pub user_name: String,
    pub group_name: String,
    pub xattrs: Vec<(String, Vec<u8>)>,
}

impl FileInfo {
    /// Cheap change fingerprint for incremental mode.
    pub fn cast(&self) -> (u64, u64) {
        (self.mtime, self.ctime)
    }
}

// ── Kind extension ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryExt {
    None,
    Link { target: String },
    Hardlink { peer_count: u16 },
    Special { kind: SpecialKind, major: u32, minor: u32 },
    Image { block_size: u32, filesystem_aware: bool },
}

// ── Entry header ─────────────────────────────────────────────────────────────

/// Bit 15 of the compression field: the payload passed through the delta
/// stage, predicted by the delta source named like the entry.
pub const COMPRESSION_DELTA_FLAG: u16 = 0x8000;

/// Decoded entry-start chunk: everything but the payload.
#[derive(Debug, Clone)]
pub struct EntryHeader {
    pub kind: EntryKind,
    pub name: String,
    pub compression: ByteAlgorithm,
    /// Delta stage applied before byte compression.
    pub delta: bool,
    pub crypt: CryptAlgorithm,
    pub crypt_salt: [u8; ENTRY_SALT_LEN],
    pub fragment_offset: u64,
    pub fragment_size: u64,
    pub info: FileInfo,
    pub ext: EntryExt,
}

impl EntryHeader {
    /// True when this fragment starts at byte 0 and covers the whole entry.
    pub fn is_whole(&self) -> bool {
        self.fragment_offset == 0 && self.fragment_size == self.info.size
    }

    /// Encode the entry-start body (without sub-chunks).
    pub fn encode_body(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(128);
        let mut compression_code = self.compression.wire_code();
        if self.delta {
            compression_code |= COMPRESSION_DELTA_FLAG;
        }
        out.write_u16::<BigEndian>(compression_code).unwrap();
        out.write_u16::<BigEndian>(self.crypt.wire_code()).unwrap();
        out.extend_from_slice(&self.crypt_salt);
        out.write_u64::<BigEndian>(self.fragment_offset).unwrap();
        out.write_u64::<BigEndian>(self.fragment_size).unwrap();
        write_string(&mut out, &self.name);

        let info = &self.info;
        out.write_u64::<BigEndian>(info.size).unwrap();
        out.write_u64::<BigEndian>(info.mtime).unwrap();
        out.write_u64::<BigEndian>(info.atime).unwrap();
        out.write_u64::<BigEndian>(info.ctime).unwrap();
        out.write_u32::<BigEndian>(info.uid).unwrap();
        out.write_u32::<BigEndian>(info.gid).unwrap();
        out.write_u32::<BigEndian>(info.mode).unwrap();
        out.write_u64::<BigEndian>(info.attributes).unwrap();
        write_string(&mut out, &info.user_name);
        write_string(&mut out, &info.group_name);
        out.write_u16::<BigEndian>(info.xattrs.len() as u16).unwrap();
        for (name, value) in &info.xattrs {
            write_string(&mut out, name);
            out.write_u32::<BigEndian>(value.len() as u32).unwrap();
            out.extend_from_slice(value);
        }

        match &self.ext {
            EntryExt::None => {}
            EntryExt::Link { target } => write_string(&mut out, target),
            EntryExt::Hardlink { peer_count } => {
                out.write_u16::<BigEndian>(*peer_count).unwrap();
            }
            EntryExt::Special { kind, major, minor } => {
                out.write_u16::<BigEndian>(kind.wire_code()).unwrap();
                out.write_u32::<BigEndian>(*major).unwrap();
                out.write_u32::<BigEndian>(*minor).unwrap();
            }
            EntryExt::Image { block_size, filesystem_aware } => {
                out.write_u32::<BigEndian>(*block_size).unwrap();
                out.push(u8::from(*filesystem_aware));
            }
        }
        out
    }

    /// Decode an entry-start body for the given entry kind.
    pub fn decode_body(kind: EntryKind, body: &[u8]) -> Result<Self> {
        Ok(Self::decode_body_consumed(kind, body)?.0)
    }

    /// Decode and report how many bytes the header occupied; the remainder
    /// of the chunk body is sub-chunks.
    pub fn decode_body_consumed(kind: EntryKind, body: &[u8]) -> Result<(Self, usize)> {
        let mut c = Cursor::new(body);
        let short = |_| Error::CorruptData(format!("short {} entry header", kind.name()));

        let compression_code = c.read_u16::<BigEndian>().map_err(short)?;
        let delta = compression_code & COMPRESSION_DELTA_FLAG != 0;
        let compression = ByteAlgorithm::from_wire_code(compression_code & !COMPRESSION_DELTA_FLAG)?;
        let crypt = CryptAlgorithm::from_wire_code(c.read_u16::<BigEndian>().map_err(short)?)?;
        let mut crypt_salt = [0u8; ENTRY_SALT_LEN];
        c.read_exact(&mut crypt_salt).map_err(short)?;
        let fragment_offset = c.read_u64::<BigEndian>().map_err(short)?;
        let fragment_size = c.read_u64::<BigEndian>().map_err(short)?;
        let name = read_string(&mut c, kind)?;

        let mut info = FileInfo {
            size: c.read_u64::<BigEndian>().map_err(short)?,
            mtime: c.read_u64::<BigEndian>().map_err(short)?,
            atime: c.read_u64::<BigEndian>().map_err(short)?,
            ctime: c.read_u64::<BigEndian>().map_err(short)?,
            uid: c.read_u32::<BigEndian>().map_err(short)?,
            gid: c.read_u32::<BigEndian>().map_err(short)?,
            mode: c.read_u32::<BigEndian>().map_err(short)?,
            attributes: c.read_u64::<BigEndian>().map_err(short)?,
            ..FileInfo::default()
        };
        info.user_name = read_string(&mut c, kind)?;
        info.group_name = read_string(&mut c, kind)?;
        let xattr_count = c.read_u16::<BigEndian>().map_err(short)?;
        for _ in 0..xattr_count {
            let name = read_string(&mut c, kind)?;
            let len = c.read_u32::<BigEndian>().map_err(short)? as usize;
            let mut value = vec![0u8; len];
            c.read_exact(&mut value).map_err(short)?;
            info.xattrs.push((name, value));
        }

        let ext = match kind {
            EntryKind::File | EntryKind::Directory => EntryExt::None,
            EntryKind::Link => EntryExt::Link { target: read_string(&mut c, kind)? },
            EntryKind::Hardlink => {
                EntryExt::Hardlink { peer_count: c.read_u16::<BigEndian>().map_err(short)? }
            }
            EntryKind::Special => EntryExt::Special {
                kind: SpecialKind::from_wire_code(c.read_u16::<BigEndian>().map_err(short)?)?,
                major: c.read_u32::<BigEndian>().map_err(short)?,
                minor: c.read_u32::<BigEndian>().map_err(short)?,
            },
            EntryKind::Image => EntryExt::Image {
                block_size: c.read_u32::<BigEndian>().map_err(short)?,
                filesystem_aware: c.read_u8().map_err(short)? != 0,
            },
        };

        let consumed = c.position() as usize;
        Ok((
            Self {
                kind,
                name,
                compression,
                delta,
                crypt,
                crypt_salt,
                fragment_offset,
                fragment_size,
                info,
                ext,
            },
            consumed,
        ))
    }
}

fn write_string(out: &mut Vec<u8>, s: &str) {
    out.write_u16::<BigEndian>(s.len() as u16).unwrap();
    out.extend_from_slice(s.as_bytes());
}

fn read_string(c: &mut Cursor<&[u8]>, kind: EntryKind) -> Result<String> {
    let len = c
        .read_u16::<BigEndian>()
        .map_err(|_| Error::CorruptData(format!("short {} entry header", kind.name())))?
        as usize;
    let mut raw = vec![0u8; len];
    c.read_exact(&mut raw)
        .map_err(|_| Error::CorruptData(format!("short {} entry header", kind.name())))?;
    String::from_utf8(raw)
        .map_err(|_| Error::CorruptData(format!("non-UTF-8 string in {} entry", kind.name())))
}

/// Encode a hardlink peer name for an HNAM sub-chunk body.
pub fn encode_hardlink_name(name: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 + name.len());
    write_string(&mut out, name);
    out
}

/// Decode an HNAM sub-chunk body.
pub fn decode_hardlink_name(body: &[u8]) -> Result<String> {
    let mut c = Cursor::new(body);
    read_string(&mut c, EntryKind::Hardlink)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header(kind: EntryKind, ext: EntryExt) -> EntryHeader {
        EntryHeader {
            kind,
            name: "/home/u/data.bin".into(),
            compression: ByteAlgorithm::Zstd(3),
            delta: false,
            crypt: CryptAlgorithm::Aes256Ctr,
            crypt_salt: [0xAB; ENTRY_SALT_LEN],
            fragment_offset: 4096,
            fragment_size: 8192,
            info: FileInfo {
                size: 123_456,
                mtime: 1_700_000_001,
                atime: 1_700_000_002,
                ctime: 1_700_000_003,
                uid: 1000,
                gid: 100,
                mode: 0o100644,
                attributes: attributes::NO_DUMP,
                user_name: "u".into(),
                group_name: "users".into(),
                xattrs: vec![("user.comment".into(), b"hello".to_vec())],
            },
            ext,
        }
    }

    #[test]
    fn roundtrip_all_kinds() {
        let cases = vec![
            sample_header(EntryKind::File, EntryExt::None),
            sample_header(EntryKind::Directory, EntryExt::None),
            sample_header(EntryKind::Link, EntryExt::Link { target: "../x".into() }),
            sample_header(EntryKind::Hardlink, EntryExt::Hardlink { peer_count: 3 }),
            sample_header(
                EntryKind::Special,
                EntryExt::Special { kind: SpecialKind::BlockDevice, major: 8, minor: 1 },
            ),
            sample_header(
                EntryKind::Image,
                EntryExt::Image { block_size: 512, filesystem_aware: true },
            ),
        ];
        for header in cases {
            let body = header.encode_body();
            let decoded = EntryHeader::decode_body(header.kind, &body).unwrap();
            assert_eq!(decoded.name, header.name);
            assert_eq!(decoded.compression, header.compression);
            assert_eq!(decoded.crypt, header.crypt);
            assert_eq!(decoded.crypt_salt, header.crypt_salt);
            assert_eq!(decoded.fragment_offset, header.fragment_offset);
            assert_eq!(decoded.fragment_size, header.fragment_size);
            assert_eq!(decoded.info, header.info);
            assert_eq!(decoded.ext, header.ext);
        }
    }

    #[test]
    fn delta_flag_roundtrip() {
        let mut header = sample_header(EntryKind::File, EntryExt::None);
        header.delta = true;
        let body = header.encode_body();
        let decoded = EntryHeader::decode_body(EntryKind::File, &body).unwrap();
        assert!(decoded.delta);
        assert_eq!(decoded.compression, ByteAlgorithm::Zstd(3));
    }

    #[test]
    fn fragment_fields_sit_at_fixed_offsets() {
        let header = sample_header(EntryKind::File, EntryExt::None);
        let body = header.encode_body();
        let off = u64::from_be_bytes(
            body[FRAGMENT_OFFSET_FIELD as usize..FRAGMENT_OFFSET_FIELD as usize + 8]
                .try_into()
                .unwrap(),
        );
        let size = u64::from_be_bytes(
            body[FRAGMENT_SIZE_FIELD as usize..FRAGMENT_SIZE_FIELD as usize + 8]
                .try_into()
                .unwrap(),
        );
        assert_eq!(off, 4096);
        assert_eq!(size, 8192);
    }

    #[test]
    fn truncated_body_is_corrupt() {
        let header = sample_header(EntryKind::File, EntryExt::None);
        let body = header.encode_body();
        let err = EntryHeader::decode_body(EntryKind::File, &body[..20]).unwrap_err();
        assert!(matches!(err, Error::CorruptData(_)));
    }

    #[test]
    fn hardlink_name_roundtrip() {
        let body = encode_hardlink_name("/etc/alias");
        assert_eq!(decode_hardlink_name(&body).unwrap(), "/etc/alias");
    }

    #[test]
    fn cast_pair() {
        let header = sample_header(EntryKind::File, EntryExt::None);
        assert_eq!(header.info.cast(), (1_700_000_001, 1_700_000_003));
    }
}
