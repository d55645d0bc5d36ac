//! Archive container — entry iterator, streaming entry pipeline, volume
//! splitting and signature placement.
//!
//! # Layout of one volume
//!
//! ```text
//! BAR0 ∥ SALT? ∥ KEY0? ∥ META ∥ (entry | SIGN)*
//! ```
//!
//! Every volume restarts with the full prologue, so any single piece is a
//! readable archive prefix; entry fragments carry (fragmentOffset,
//! fragmentSize) and never require concatenation.
//!
//! # Entry pipeline
//! On write each entry streams source → delta → byte-compressor → cipher →
//! DATA sub-chunk, pumped in 1 MiB blocks and split-checked in 64 KiB
//! slices.  When a slice would cross the configured part size the current
//! fragment is flushed layer by layer in reverse push order, its fragment
//! fields are patched in place, the volume is finalized and the entry
//! continues on the next volume with a fresh layer stack.  On read the
//! stack runs in reverse, exposed as a pull reader whose length equals the
//! fragment size.
//!
//! Chunk append is serialized by the caller holding the writer; between two
//! completed entries chunks appear in acquisition order.

use std::io::{self, Read, Seek, SeekFrom};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use byteorder::{BigEndian, ByteOrder, ReadBytesExt};
use ed25519_dalek::{SigningKey, VerifyingKey};
use log::{debug, info, warn};
use rand::RngCore;
use rsa::{RsaPrivateKey, RsaPublicKey};
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::chunks::{
    ChunkCursor, ChunkReader, ChunkWriter, CHUNK_BAR0, CHUNK_DATA, CHUNK_HARDLINK_NAME,
    CHUNK_HEADER_SIZE, CHUNK_KEY, CHUNK_META, CHUNK_SALT, CHUNK_SIGNATURE,
};
use crate::compress::{
    make_decompressor, ByteAlgorithm, ByteCompressor, Compressor, PIPELINE_BLOCK_SIZE,
};
use crate::crypt::{
    entry_counter_seed, make_entry_cipher, random_salt, unwrap_session_key, wrap_session_key,
    CryptAlgorithm, EntryCipher, SessionKey, CIPHER_BLOCK_LEN, ENTRY_SALT_LEN, SALT_LEN,
};
use crate::delta::{DeltaEncoder, DeltaReader, DeltaSourceProvider};
use crate::entries::{
    decode_hardlink_name, encode_hardlink_name, EntryExt, EntryHeader, EntryKind, FileInfo,
    FRAGMENT_OFFSET_FIELD, FRAGMENT_SIZE_FIELD,
};
use crate::errors::{Error, Result};
use crate::signature::{sign_chunk_body, verify_chunk_body, RangeHasher, SignatureState};
use crate::storage::{ReadView, ReadViewFactory, Storage};

/// Archive format version written into BAR0.
pub const ARCHIVE_VERSION: u16 = 1;

/// BAR0 flag: readers should skip unknown chunk ids.
pub const ARCHIVE_FLAG_SKIP_UNKNOWN: u16 = 0x0001;
/// BAR0 flag: entry payloads are encrypted.
pub const ARCHIVE_FLAG_ENCRYPTED: u16 = 0x0002;
/// BAR0 flag: the archive carries SIGN chunks.
pub const ARCHIVE_FLAG_SIGNED: u16 = 0x0004;

/// Split-check granularity within the pump loop.
const SPLIT_SLICE: usize = 64 * 1024;
/// Reserved headroom for layer trailers and cipher padding at a split point.
const SPLIT_MARGIN: u64 = 4096;
/// Entry headers are read in growing prefixes up to this cap.
const MAX_ENTRY_HEADER: u64 = 16 * 1024 * 1024;

/// Process-wide cancellation flag, polled at inter-entry boundaries.
pub type CancelFlag = Arc<AtomicBool>;

fn check_cancel(cancel: &Option<CancelFlag>) -> Result<()> {
    match cancel {
        Some(flag) if flag.load(Ordering::Relaxed) => Err(Error::Aborted),
        _ => Ok(()),
    }
}

// ── Options ──────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct ArchiveOptions {
    pub compression: ByteAlgorithm,
    pub crypt: CryptAlgorithm,
    /// Maximum volume size; `None` disables splitting.
    pub part_size: Option<u64>,
    pub skip_unknown_chunks: bool,
    /// Run payloads through the delta stage on create.
    pub delta_enabled: bool,
    /// Degrade to no-delta instead of failing when a source is missing.
    pub allow_missing_delta_source: bool,
    pub cancel: Option<CancelFlag>,
}

impl Default for ArchiveOptions {
    fn default() -> Self {
        Self {
            compression: ByteAlgorithm::None,
            crypt: CryptAlgorithm::None,
            part_size: None,
            skip_unknown_chunks: false,
            delta_enabled: false,
            allow_missing_delta_source: false,
            cancel: None,
        }
    }
}

/// Key material for `create`.
#[derive(Default)]
pub struct CreateKeys {
    pub password: Option<String>,
    pub public_key: Option<RsaPublicKey>,
    pub signing_key: Option<SigningKey>,
}

/// Key material for `open`.  The password callback is invoked at most once
/// per archive, with (purpose, retry).
#[derive(Default)]
pub struct OpenKeys {
    pub password: Option<Box<dyn Fn(&str, bool) -> Option<String> + Send>>,
    pub private_key: Option<RsaPrivateKey>,
}

// ── Archive meta ─────────────────────────────────────────────────────────────

const META_ATTR_UUID: u16 = 1;
const META_ATTR_CREATED: u16 = 2;
const META_ATTR_HOST_NAME: u16 = 3;
const META_ATTR_USER_NAME: u16 = 4;
const META_ATTR_KEY_VERIFIER: u16 = 5;

/// Archive-level attributes carried in the META chunk.
#[derive(Debug, Clone)]
pub struct ArchiveMeta {
    pub uuid: Uuid,
    pub created: u64,
    pub host_name: String,
    pub user_name: String,
    /// Session-key verifier; present for password-derived keys only.
    pub key_verifier: Option<[u8; 8]>,
}

impl ArchiveMeta {
    fn collect(key_verifier: Option<[u8; 8]>) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            created: chrono::Utc::now().timestamp().max(0) as u64,
            host_name: std::env::var("HOSTNAME").unwrap_or_default(),
            user_name: std::env::var("USER").unwrap_or_default(),
            key_verifier,
        }
    }

    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        let mut attr = |id: u16, body: &[u8]| {
            out.extend_from_slice(&id.to_be_bytes());
            out.extend_from_slice(&(body.len() as u16).to_be_bytes());
            out.extend_from_slice(body);
        };
        attr(META_ATTR_UUID, self.uuid.as_bytes());
        attr(META_ATTR_CREATED, &self.created.to_be_bytes());
        attr(META_ATTR_HOST_NAME, self.host_name.as_bytes());
        attr(META_ATTR_USER_NAME, self.user_name.as_bytes());
        if let Some(v) = &self.key_verifier {
            attr(META_ATTR_KEY_VERIFIER, v);
        }
        out
    }

    fn decode(body: &[u8]) -> Result<Self> {
        let mut meta = Self {
            uuid: Uuid::nil(),
            created: 0,
            host_name: String::new(),
            user_name: String::new(),
            key_verifier: None,
        };
        let mut c = io::Cursor::new(body);
        while (c.position() as usize) < body.len() {
            let short = |_| Error::CorruptData("short meta attribute".into());
            let id = c.read_u16::<BigEndian>().map_err(short)?;
            let len = c.read_u16::<BigEndian>().map_err(short)? as usize;
            let mut attr = vec![0u8; len];
            c.read_exact(&mut attr).map_err(short)?;
            match id {
                META_ATTR_UUID if len == 16 => {
                    meta.uuid = Uuid::from_bytes(attr.as_slice().try_into().unwrap());
                }
                META_ATTR_CREATED if len == 8 => {
                    meta.created = BigEndian::read_u64(&attr);
                }
                META_ATTR_HOST_NAME => meta.host_name = String::from_utf8_lossy(&attr).into_owned(),
                META_ATTR_USER_NAME => meta.user_name = String::from_utf8_lossy(&attr).into_owned(),
                META_ATTR_KEY_VERIFIER if len == 8 => {
                    meta.key_verifier = Some(attr.as_slice().try_into().unwrap());
                }
                other => debug!("skipping unknown meta attribute {other} ({len} bytes)"),
            }
        }
        Ok(meta)
    }
}

// ── Crypt context ────────────────────────────────────────────────────────────

/// Decryption context captured at the iterator's position; workers use the
/// snapshot referenced by their descriptor, so a mid-archive SALT/KEY chunk
/// never mutates state under them.
pub struct CryptContext {
    pub salt: [u8; SALT_LEN],
    pub key: Option<Arc<SessionKey>>,
}

impl CryptContext {
    fn unencrypted() -> Self {
        Self { salt: [0u8; SALT_LEN], key: None }
    }
}

// ── Entry spec (write side) ──────────────────────────────────────────────────

/// What the caller supplies to store one entry.
pub struct EntrySpec {
    pub kind: EntryKind,
    pub name: String,
    pub info: FileInfo,
    pub ext: EntryExt,
    /// All peer names of a hardlink group; payload is stored once.
    pub hardlink_names: Vec<String>,
}

/// Byte accounting for one stored entry.
#[derive(Debug, Default, Clone, Copy)]
pub struct EntryWriteStats {
    pub plain_bytes: u64,
    pub stored_bytes: u64,
    pub fragments: u32,
}

// ── Writer ───────────────────────────────────────────────────────────────────

#[derive(PartialEq)]
enum WriterState {
    Writing,
    Failed,
    Closed,
}

type SinkFactory<S> = Box<dyn FnMut(u32) -> Result<S> + Send>;

/// Archive creation handle.  Chunk append is serialized through `&mut self`;
/// concurrent producers share the writer behind a mutex.
pub struct ArchiveWriter<S: Storage> {
    sink_factory: SinkFactory<S>,
    chunk: ChunkWriter<S>,
    options: ArchiveOptions,
    delta_sources: Arc<dyn DeltaSourceProvider>,
    salt: [u8; SALT_LEN],
    session_key: Option<Arc<SessionKey>>,
    wrapped_key: Option<Vec<u8>>,
    signing_key: Option<SigningKey>,
    meta: ArchiveMeta,
    volume: u32,
    entry_sequence: u64,
    signed_range_start: u64,
    state: WriterState,
}

struct FragmentCtx {
    name: String,
    body_offset: u64,
    has_data: bool,
    /// Absolute entry-content offset where this fragment begins.
    fragment_offset: u64,
    /// Plaintext bytes streamed into this fragment so far.
    plain: u64,
    delta: Option<DeltaEncoder>,
    compressor: Compressor,
    cipher: Box<dyn EntryCipher>,
    cipher_buf: Vec<u8>,
    crypt: CryptAlgorithm,
}

impl<S: Storage> ArchiveWriter<S> {
    /// Create a multi-volume-capable archive; the factory supplies each
    /// volume's sink, numbered from 1.
    pub fn create(
        mut sink_factory: SinkFactory<S>,
        options: ArchiveOptions,
        keys: CreateKeys,
        delta_sources: Arc<dyn DeltaSourceProvider>,
    ) -> Result<Self> {
        let sink = sink_factory(1)?;
        let mut salt = [0u8; SALT_LEN];
        let mut session_key = None;
        let mut wrapped_key = None;
        let mut key_verifier = None;

        if !options.crypt.is_none() {
            salt = random_salt();
            if let Some(public_key) = &keys.public_key {
                let key = SessionKey::random();
                wrapped_key = Some(wrap_session_key(public_key, &key)?);
                session_key = Some(Arc::new(key));
            } else if let Some(password) = &keys.password {
                let key = SessionKey::derive(password, &salt)?;
                key_verifier = Some(key.verifier(&salt));
                session_key = Some(Arc::new(key));
            } else {
                return Err(Error::WrongPassword);
            }
        }

        let mut writer = Self {
            sink_factory,
            chunk: ChunkWriter::new(sink),
            options,
            delta_sources,
            salt,
            session_key,
            wrapped_key,
            signing_key: keys.signing_key,
            meta: ArchiveMeta::collect(key_verifier),
            volume: 1,
            entry_sequence: 0,
            signed_range_start: 0,
            state: WriterState::Writing,
        };
        writer.write_prologue()?;
        Ok(writer)
    }

    /// Convenience constructor for a single-volume archive.
    pub fn create_single(
        sink: S,
        options: ArchiveOptions,
        keys: CreateKeys,
        delta_sources: Arc<dyn DeltaSourceProvider>,
    ) -> Result<Self> {
        let mut sink = Some(sink);
        Self::create(
            Box::new(move |volume| {
                sink.take().ok_or_else(|| {
                    Error::Internal(format!(
                        "volume {volume} requested but archive is single-volume"
                    ))
                })
            }),
            options,
            keys,
            delta_sources,
        )
    }

    pub fn current_volume(&self) -> u32 {
        self.volume
    }

    pub fn meta(&self) -> &ArchiveMeta {
        &self.meta
    }

    fn header_flags(&self) -> u16 {
        let mut flags = 0;
        if self.options.skip_unknown_chunks {
            flags |= ARCHIVE_FLAG_SKIP_UNKNOWN;
        }
        if !self.options.crypt.is_none() {
            flags |= ARCHIVE_FLAG_ENCRYPTED;
        }
        if self.signing_key.is_some() {
            flags |= ARCHIVE_FLAG_SIGNED;
        }
        flags
    }

    fn write_prologue(&mut self) -> Result<()> {
        let mut bar0 = [0u8; 4];
        BigEndian::write_u16(&mut bar0[..2], ARCHIVE_VERSION);
        BigEndian::write_u16(&mut bar0[2..], self.header_flags());
        self.chunk.write_chunk(CHUNK_BAR0, &bar0)?;

        if !self.options.crypt.is_none() {
            self.chunk.write_chunk(CHUNK_SALT, &self.salt)?;
        }
        if let Some(wrapped) = &self.wrapped_key {
            let mut body = Vec::with_capacity(4 + wrapped.len());
            body.extend_from_slice(&(wrapped.len() as u32).to_be_bytes());
            body.extend_from_slice(wrapped);
            self.chunk.write_chunk(CHUNK_KEY, &body)?;
        }
        self.chunk.write_chunk(CHUNK_META, &self.meta.encode())?;
        self.signed_range_start = 0;
        Ok(())
    }

    /// Sign the byte range since the previous signature (or volume start)
    /// and append a SIGN chunk.  No-op without a signing key or when the
    /// range is empty.
    fn append_signature(&mut self) -> Result<()> {
        let Some(key) = self.signing_key.clone() else {
            return Ok(());
        };
        self.chunk.flush()?;
        let end = self.chunk.position()?;
        if end == self.signed_range_start {
            return Ok(());
        }
        let digest = hash_storage_range(self.chunk.get_mut(), self.signed_range_start, end)?;
        self.chunk.write_chunk(CHUNK_SIGNATURE, &sign_chunk_body(&key, &digest))?;
        self.signed_range_start = self.chunk.position()?;
        Ok(())
    }

    /// Finalize the current volume and open the next one.
    fn advance_volume(&mut self) -> Result<()> {
        self.append_signature()?;
        self.chunk.flush()?;
        self.volume += 1;
        let next = (self.sink_factory)(self.volume)?;
        let old = std::mem::replace(&mut self.chunk, ChunkWriter::new(next));
        old.into_inner().sync()?;
        info!("continuing on volume {}", self.volume);
        self.write_prologue()
    }

    fn should_split(&mut self, upcoming: usize) -> Result<bool> {
        let Some(part_size) = self.options.part_size else {
            return Ok(false);
        };
        let position = self.chunk.position()?;
        Ok(position + upcoming as u64 + SPLIT_MARGIN > part_size)
    }

    /// Store one entry, streaming its payload from `source`.
    pub fn write_entry(
        &mut self,
        spec: &EntrySpec,
        source: Option<&mut dyn Read>,
    ) -> Result<EntryWriteStats> {
        if self.state != WriterState::Writing {
            return Err(Error::Internal("archive writer is closed or failed".into()));
        }
        check_cancel(&self.options.cancel)?;
        let result = self.write_entry_inner(spec, source);
        if matches!(result, Err(Error::Io(_)) | Err(Error::Internal(_))) {
            self.state = WriterState::Failed;
        }
        result
    }

    fn write_entry_inner(
        &mut self,
        spec: &EntrySpec,
        mut source: Option<&mut dyn Read>,
    ) -> Result<EntryWriteStats> {
        // Rotate before the entry when the volume is nearly full.
        if spec.info.size > 0 && self.should_split(SPLIT_SLICE)? {
            self.advance_volume()?;
        }

        let use_delta = self.options.delta_enabled
            && spec.kind.has_payload()
            && self.delta_source_available(&spec.name)?;

        let mut stats = EntryWriteStats::default();
        let mut ctx = self.begin_fragment(spec, 0, use_delta)?;
        stats.fragments = 1;

        if let (Some(src), true) = (source.as_mut(), spec.kind.has_payload()) {
            let mut buf = vec![0u8; PIPELINE_BLOCK_SIZE];
            loop {
                check_cancel(&self.options.cancel)?;
                let n = src.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                let mut offset = 0;
                while offset < n {
                    let end = (offset + SPLIT_SLICE).min(n);
                    let slice = &buf[offset..end];
                    if ctx.plain > 0 && self.should_split(slice.len())? {
                        let next_offset = ctx.fragment_offset + ctx.plain;
                        stats.stored_bytes += self.end_fragment(&mut ctx)?;
                        self.advance_volume()?;
                        ctx = self.begin_fragment(spec, next_offset, use_delta)?;
                        stats.fragments += 1;
                    }
                    self.push_plain(&mut ctx, slice)?;
                    offset = end;
                }
            }
        }

        stats.plain_bytes = ctx.fragment_offset + ctx.plain;
        stats.stored_bytes += self.end_fragment(&mut ctx)?;
        Ok(stats)
    }

    fn delta_source_available(&self, name: &str) -> Result<bool> {
        match self.delta_sources.open(name)? {
            Some(_) => Ok(true),
            None if self.options.allow_missing_delta_source => {
                warn!("no delta source for {name}, storing without delta");
                Ok(false)
            }
            None => Err(Error::DeltaSourceNotFound(name.to_string())),
        }
    }

    fn begin_fragment(
        &mut self,
        spec: &EntrySpec,
        fragment_offset: u64,
        use_delta: bool,
    ) -> Result<FragmentCtx> {
        let sequence = self.entry_sequence;
        self.entry_sequence += 1;

        let mut crypt_salt = [0u8; ENTRY_SALT_LEN];
        crypt_salt[..CIPHER_BLOCK_LEN].copy_from_slice(&entry_counter_seed(&self.salt, sequence));
        rand::thread_rng().fill_bytes(&mut crypt_salt[CIPHER_BLOCK_LEN..]);

        let compression = if !spec.kind.has_payload()
            || spec.info.attributes & crate::entries::attributes::NO_COMPRESS != 0
        {
            ByteAlgorithm::None
        } else {
            self.options.compression
        };
        let crypt = if spec.kind.has_payload() { self.options.crypt } else { CryptAlgorithm::None };

        let header = EntryHeader {
            kind: spec.kind,
            name: spec.name.clone(),
            compression,
            delta: use_delta,
            crypt,
            crypt_salt,
            fragment_offset,
            fragment_size: 0, // patched in end_fragment
            info: spec.info.clone(),
            ext: spec.ext.clone(),
        };

        let header_offset = self.chunk.begin(spec.kind.chunk_id())?;
        let body_offset = header_offset + CHUNK_HEADER_SIZE;
        self.chunk.write(&header.encode_body())?;
        for name in &spec.hardlink_names {
            self.chunk.write_chunk(CHUNK_HARDLINK_NAME, &encode_hardlink_name(name))?;
        }
        let has_data = spec.kind.has_payload();
        if has_data {
            self.chunk.begin(CHUNK_DATA)?;
        }

        let iv: [u8; CIPHER_BLOCK_LEN] = crypt_salt[..CIPHER_BLOCK_LEN].try_into().unwrap();
        let delta = if use_delta {
            let src = self
                .delta_sources
                .open(&spec.name)?
                .ok_or_else(|| Error::DeltaSourceNotFound(spec.name.clone()))?;
            Some(DeltaEncoder::new_at(src, fragment_offset))
        } else {
            None
        };

        Ok(FragmentCtx {
            name: spec.name.clone(),
            body_offset,
            has_data,
            fragment_offset,
            plain: 0,
            delta,
            compressor: Compressor::new(compression)?,
            cipher: make_entry_cipher(crypt, self.session_key.as_deref(), &iv)?,
            cipher_buf: Vec::new(),
            crypt,
        })
    }

    fn push_plain(&mut self, ctx: &mut FragmentCtx, slice: &[u8]) -> Result<()> {
        ctx.plain += slice.len() as u64;
        if let Some(delta) = &mut ctx.delta {
            delta.write(slice)?;
            let records = delta.take_output();
            ctx.compressor.write(&records)?;
        } else {
            ctx.compressor.write(slice)?;
        }
        let produced = ctx.compressor.take_output();
        self.write_ciphertext(ctx, produced)
    }

    fn write_ciphertext(&mut self, ctx: &mut FragmentCtx, produced: Vec<u8>) -> Result<()> {
        if produced.is_empty() {
            return Ok(());
        }
        if ctx.crypt.is_none() {
            return self.chunk.write(&produced);
        }
        ctx.cipher_buf.extend_from_slice(&produced);
        let full = ctx.cipher_buf.len() - ctx.cipher_buf.len() % CIPHER_BLOCK_LEN;
        if full > 0 {
            ctx.cipher.apply(&mut ctx.cipher_buf[..full]);
            self.chunk.write(&ctx.cipher_buf[..full])?;
            ctx.cipher_buf.drain(..full);
        }
        Ok(())
    }

    /// Flush every layer in reverse push order, close the sub-chunk and the
    /// entry chunk, and patch the fragment fields.  Returns the DATA body
    /// length.
    fn end_fragment(&mut self, ctx: &mut FragmentCtx) -> Result<u64> {
        if let Some(delta) = &mut ctx.delta {
            delta.finish()?;
            let records = delta.take_output();
            ctx.compressor.write(&records)?;
        }
        ctx.compressor.finish()?;
        let produced = ctx.compressor.take_output();
        self.write_ciphertext(ctx, produced)?;

        // Pad the trailing partial cipher block with zeros.
        if !ctx.crypt.is_none() && !ctx.cipher_buf.is_empty() {
            let pad = CIPHER_BLOCK_LEN - ctx.cipher_buf.len() % CIPHER_BLOCK_LEN;
            ctx.cipher_buf.resize(ctx.cipher_buf.len() + pad, 0);
            ctx.cipher.apply(&mut ctx.cipher_buf[..]);
            let rest = std::mem::take(&mut ctx.cipher_buf);
            self.chunk.write(&rest)?;
        }

        let data_len = if ctx.has_data { self.chunk.end()? } else { 0 };
        self.chunk.end()?;

        let mut field = [0u8; 8];
        BigEndian::write_u64(&mut field, ctx.fragment_offset);
        self.chunk.patch(ctx.body_offset + FRAGMENT_OFFSET_FIELD, &field)?;
        BigEndian::write_u64(&mut field, ctx.plain);
        self.chunk.patch(ctx.body_offset + FRAGMENT_SIZE_FIELD, &field)?;
        debug!(
            "entry {} fragment [{},{}) stored as {} bytes",
            ctx.name,
            ctx.fragment_offset,
            ctx.fragment_offset + ctx.plain,
            data_len
        );
        Ok(data_len)
    }

    /// Finish the archive.  Optionally appends a terminal signature covering
    /// the last signed range.  The session key is wiped on drop.
    pub fn close(mut self, append_signature: bool) -> Result<()> {
        if self.chunk.open_depth() != 0 {
            return Err(Error::Internal("close with an open entry".into()));
        }
        if append_signature {
            self.append_signature()?;
        }
        self.chunk.flush()?;
        self.chunk.into_inner().sync()?;
        self.state = WriterState::Closed;
        Ok(())
    }
}

fn hash_storage_range<R: Read + Seek>(storage: &mut R, start: u64, end: u64) -> Result<[u8; 64]> {
    let restore = storage.stream_position()?;
    storage.seek(SeekFrom::Start(start))?;
    let mut hasher = RangeHasher::new();
    let mut remaining = end - start;
    let mut buf = vec![0u8; 256 * 1024];
    while remaining > 0 {
        let want = buf.len().min(remaining as usize);
        storage.read_exact(&mut buf[..want])?;
        hasher.update(&buf[..want]);
        remaining -= want as u64;
    }
    storage.seek(SeekFrom::Start(restore))?;
    Ok(hasher.finalize())
}

// ── Entry start (read side) ──────────────────────────────────────────────────

/// One parsed entry-start record; the payload has not been read.
pub struct EntryStart {
    pub header: EntryHeader,
    pub hardlink_names: Vec<String>,
    /// DATA sub-chunk position; `None` for payload-less kinds.
    pub data: Option<ChunkCursor>,
    /// Offset of the entry-start chunk header within its piece.
    pub start_offset: u64,
    /// Crypt context captured at the iterator's position.
    pub crypt: Arc<CryptContext>,
}

/// Open payload stream of one entry fragment; its length equals the
/// fragment size.
pub struct EntryPayload {
    pub reader: Box<dyn Read + Send>,
    pub fragment_offset: u64,
    pub fragment_size: u64,
}

// ── Reader ───────────────────────────────────────────────────────────────────

/// Forward iterator over one archive piece.  `next_entry` never rewinds;
/// workers open their own read views at recorded offsets.
pub struct ArchiveReader {
    factory: Arc<dyn ReadViewFactory>,
    chunks: ChunkReader<Box<dyn ReadView>>,
    pub version: u16,
    pub flags: u16,
    pub meta: Option<ArchiveMeta>,
    crypt: Arc<CryptContext>,
    options: ArchiveOptions,
    password: Option<Zeroizing<String>>,
    private_key: Option<RsaPrivateKey>,
    pending: Option<ChunkCursor>,
    finished: bool,
}

impl ArchiveReader {
    pub fn open(
        factory: Arc<dyn ReadViewFactory>,
        options: ArchiveOptions,
        keys: OpenKeys,
    ) -> Result<Self> {
        let view = factory.open_view()?;
        let mut chunks = ChunkReader::new(view, options.skip_unknown_chunks)?;

        let bar0 = chunks
            .next()?
            .ok_or_else(|| Error::CorruptData("missing archive header".into()))?;
        if bar0.id != CHUNK_BAR0 || bar0.body_len < 4 {
            return Err(Error::CorruptData("missing archive header".into()));
        }
        let body = chunks.read_body(&bar0)?;
        let version = BigEndian::read_u16(&body[..2]);
        let flags = BigEndian::read_u16(&body[2..4]);
        if version != ARCHIVE_VERSION {
            return Err(Error::UnsupportedVersion(version));
        }

        let mut options = options;
        if flags & ARCHIVE_FLAG_SKIP_UNKNOWN != 0 && !options.skip_unknown_chunks {
            // The header may raise skip-unknown; reopen the cursor with it.
            options.skip_unknown_chunks = true;
            let view = factory.open_view()?;
            let mut reopened = ChunkReader::new(view, true)?;
            reopened.seek(bar0.end_offset())?;
            chunks = reopened;
        }

        let mut reader = Self {
            factory,
            chunks,
            version,
            flags,
            meta: None,
            crypt: Arc::new(CryptContext::unencrypted()),
            options,
            password: None,
            private_key: keys.private_key,
            pending: None,
            finished: false,
        };
        reader.scan_prologue(keys.password.as_deref())?;
        Ok(reader)
    }

    /// Consume SALT/KEY/META chunks up to the first entry or signature, so
    /// a wrong password is rejected before any entry is listed.
    fn scan_prologue(
        &mut self,
        password_cb: Option<&(dyn Fn(&str, bool) -> Option<String> + Send)>,
    ) -> Result<()> {
        loop {
            let Some(cursor) = self.chunks.next()? else {
                self.finished = true;
                return Ok(());
            };
            match cursor.id {
                CHUNK_SALT => self.handle_salt(&cursor, password_cb)?,
                CHUNK_KEY => self.handle_key(&cursor)?,
                CHUNK_META => self.handle_meta(&cursor)?,
                _ => {
                    self.pending = Some(cursor);
                    return Ok(());
                }
            }
        }
    }

    fn handle_salt(
        &mut self,
        cursor: &ChunkCursor,
        password_cb: Option<&(dyn Fn(&str, bool) -> Option<String> + Send)>,
    ) -> Result<()> {
        let body = self.chunks.read_body(cursor)?;
        if body.len() != SALT_LEN {
            return Err(Error::CorruptData("salt chunk length".into()));
        }
        let mut salt = [0u8; SALT_LEN];
        salt.copy_from_slice(&body);

        if self.password.is_none() {
            if let Some(cb) = password_cb {
                self.password = cb("archive password", false).map(Zeroizing::new);
            }
        }
        let key = match &self.password {
            Some(password) => Some(Arc::new(SessionKey::derive(password, &salt)?)),
            None => None,
        };
        self.crypt = Arc::new(CryptContext { salt, key });
        Ok(())
    }

    fn handle_key(&mut self, cursor: &ChunkCursor) -> Result<()> {
        let body = self.chunks.read_body(cursor)?;
        if body.len() < 4 {
            return Err(Error::CorruptData("key chunk length".into()));
        }
        let len = BigEndian::read_u32(&body[..4]) as usize;
        if body.len() < 4 + len {
            return Err(Error::CorruptData("key chunk length".into()));
        }
        if let Some(private_key) = &self.private_key {
            let key = unwrap_session_key(private_key, &body[4..4 + len])?;
            self.crypt = Arc::new(CryptContext { salt: self.crypt.salt, key: Some(Arc::new(key)) });
        }
        Ok(())
    }

    fn handle_meta(&mut self, cursor: &ChunkCursor) -> Result<()> {
        let body = self.chunks.read_body(cursor)?;
        let meta = ArchiveMeta::decode(&body)?;
        if let (Some(verifier), Some(key)) = (&meta.key_verifier, &self.crypt.key) {
            if key.verifier(&self.crypt.salt) != *verifier {
                return Err(Error::WrongPassword);
            }
        }
        self.meta = Some(meta);
        Ok(())
    }

    /// Advance to the next entry-start.  Returns `None` at end of archive.
    /// SALT/KEY/META chunks update the crypt context in passing; SIGN chunks
    /// are skipped here and read separately by [`verify_signatures`].
    pub fn next_entry(&mut self) -> Result<Option<EntryStart>> {
        check_cancel(&self.options.cancel)?;
        if self.finished {
            return Ok(None);
        }
        loop {
            let cursor = match self.pending.take() {
                Some(c) => c,
                None => match self.chunks.next()? {
                    Some(c) => c,
                    None => {
                        self.finished = true;
                        return Ok(None);
                    }
                },
            };
            match cursor.id {
                CHUNK_SALT => self.handle_salt(&cursor, None)?,
                CHUNK_KEY => self.handle_key(&cursor)?,
                CHUNK_META => self.handle_meta(&cursor)?,
                CHUNK_SIGNATURE => self.chunks.skip(&cursor)?,
                CHUNK_BAR0 => {
                    return Err(Error::CorruptData("archive header repeated mid-stream".into()))
                }
                id if id.is_entry_start() => return Ok(Some(self.parse_entry(cursor)?)),
                id => {
                    return Err(Error::CorruptData(format!(
                        "chunk {id} not allowed at archive top level"
                    )))
                }
            }
        }
    }

    fn parse_entry(&mut self, cursor: ChunkCursor) -> Result<EntryStart> {
        let kind = EntryKind::from_chunk_id(cursor.id)
            .ok_or_else(|| Error::Internal("entry id mismatch".into()))?;

        // The header length is implicit; read a growing prefix until it
        // decodes, then walk the sub-chunks that follow it.
        let hard_cap = cursor.body_len.min(MAX_ENTRY_HEADER);
        let mut prefix_len = (64 * 1024u64).min(hard_cap);
        let (header, consumed) = loop {
            let prefix = self.chunks.read_range(cursor.body_offset, prefix_len)?;
            match EntryHeader::decode_body_consumed(kind, &prefix) {
                Ok(done) => break done,
                Err(_) if prefix_len < hard_cap => {
                    prefix_len = (prefix_len * 2).min(hard_cap);
                }
                Err(e) => return Err(e),
            }
        };

        let mut hardlink_names = Vec::new();
        let mut data = None;
        self.chunks.seek(cursor.body_offset + consumed as u64)?;
        while let Some(sub) = self.chunks.next_in(&cursor)? {
            match sub.id {
                CHUNK_HARDLINK_NAME => {
                    let body = self.chunks.read_body(&sub)?;
                    hardlink_names.push(decode_hardlink_name(&body)?);
                }
                CHUNK_DATA => {
                    data = Some(sub);
                    self.chunks.skip(&sub)?;
                }
                id => {
                    return Err(Error::CorruptData(format!(
                        "unexpected sub-chunk {id} in {} entry",
                        kind.name()
                    )))
                }
            }
        }
        self.chunks.seek(cursor.end_offset())?;

        if kind.has_payload() && data.is_none() {
            return Err(Error::CorruptData(format!(
                "{} entry {} has no payload sub-chunk",
                kind.name(),
                header.name
            )));
        }

        Ok(EntryStart {
            header,
            hardlink_names,
            data,
            start_offset: cursor.header_offset(),
            crypt: Arc::clone(&self.crypt),
        })
    }

    /// Reposition the iterator; workers use fresh views instead, this is for
    /// read views opened from a writer-quiescent handle.
    pub fn seek_to(&mut self, offset: u64) -> Result<()> {
        self.pending = None;
        self.finished = false;
        self.chunks.seek(offset)
    }

    pub fn read_view_factory(&self) -> Arc<dyn ReadViewFactory> {
        Arc::clone(&self.factory)
    }

    /// Current crypt context snapshot.
    pub fn crypt_context(&self) -> Arc<CryptContext> {
        Arc::clone(&self.crypt)
    }

    /// Verify all SIGN chunks of this piece with a fresh read view.
    pub fn verify_signatures(&self, key: Option<&VerifyingKey>) -> Result<SignatureState> {
        verify_signatures(self.factory.as_ref(), key)
    }
}

/// Walk a piece and verify every SIGN chunk against the byte range it
/// covers, from the previous signature (or piece start) to the SIGN chunk
/// header.  Aggregates to one [`SignatureState`].
pub fn verify_signatures(
    factory: &dyn ReadViewFactory,
    key: Option<&VerifyingKey>,
) -> Result<SignatureState> {
    let view = factory.open_view()?;
    let mut chunks = ChunkReader::new(view, true)?;
    let mut state = SignatureState::Skipped;
    let mut range_start = 0u64;
    while let Some(cursor) = chunks.next()? {
        if cursor.id == CHUNK_SIGNATURE {
            let body = chunks.read_body(&cursor)?;
            let mut view = factory.open_view()?;
            let digest = hash_storage_range(&mut view, range_start, cursor.header_offset())?;
            state = state.merge(verify_chunk_body(key, &digest, &body)?);
            range_start = cursor.end_offset();
            chunks.seek(cursor.end_offset())?;
        } else {
            chunks.skip(&cursor)?;
        }
    }
    Ok(state)
}

// ── Delta sources from previous archives ─────────────────────────────────────

/// Delta-source provider backed by previously written archives.
///
/// A lookup scans the pieces for entries with the requested name, spools
/// their fragments into an anonymous temp file (exclusive-create, reclaimed
/// by the OS on close or crash), and serves that as the seekable source.
/// Incomplete coverage counts as "source not found".
pub struct ArchiveDeltaSources {
    pieces: Vec<Arc<dyn ReadViewFactory>>,
    password: Option<String>,
    private_key: Option<RsaPrivateKey>,
    tmp_directory: Option<std::path::PathBuf>,
}

impl ArchiveDeltaSources {
    pub fn new(
        pieces: Vec<Arc<dyn ReadViewFactory>>,
        password: Option<String>,
        private_key: Option<RsaPrivateKey>,
        tmp_directory: Option<std::path::PathBuf>,
    ) -> Self {
        Self { pieces, password, private_key, tmp_directory }
    }

    fn open_keys(&self) -> OpenKeys {
        let password = self.password.clone();
        OpenKeys {
            password: password.map(|p| {
                Box::new(move |_: &str, _: bool| Some(p.clone()))
                    as Box<dyn Fn(&str, bool) -> Option<String> + Send>
            }),
            private_key: self.private_key.clone(),
        }
    }

    fn spool_file(&self) -> Result<std::fs::File> {
        let dir = self.tmp_directory.clone().unwrap_or_else(std::env::temp_dir);
        Ok(tempfile::tempfile_in(dir)?)
    }
}

impl DeltaSourceProvider for ArchiveDeltaSources {
    fn open(&self, name: &str) -> Result<Option<crate::delta::DeltaSource>> {
        let mut spool: Option<std::fs::File> = None;
        let mut total: Option<u64> = None;
        let mut covered: Vec<(u64, u64)> = Vec::new();

        for piece in &self.pieces {
            let options =
                ArchiveOptions { skip_unknown_chunks: true, ..ArchiveOptions::default() };
            let mut reader = ArchiveReader::open(Arc::clone(piece), options, self.open_keys())?;
            while let Some(entry) = reader.next_entry()? {
                if entry.header.name != name || !entry.header.kind.has_payload() {
                    continue;
                }
                if entry.header.delta {
                    return Err(Error::FunctionNotSupported("nested delta sources"));
                }
                let size = entry.header.info.size;
                match total {
                    None => total = Some(size),
                    Some(existing) if existing != size => {
                        return Err(Error::EntrySizeMismatch {
                            name: name.to_string(),
                            expected: existing,
                            actual: size,
                        })
                    }
                    Some(_) => {}
                }
                if spool.is_none() {
                    spool = Some(self.spool_file()?);
                }
                let file = spool.as_mut().unwrap();
                let mut payload =
                    open_payload(piece.as_ref(), &entry, &crate::delta::NoDeltaSources)?;
                file.seek(SeekFrom::Start(payload.fragment_offset))?;
                io::copy(&mut payload.reader, file)?;
                covered.push((payload.fragment_offset, payload.fragment_size));
            }
        }

        let Some(total) = total else {
            return Ok(None);
        };
        let registry = crate::fragments::FragmentRegistry::new();
        let node = registry.find_or_create(name, total)?;
        {
            let mut node = node.lock().unwrap();
            for (offset, len) in covered {
                node.add_range(offset, len);
            }
            if !node.is_complete() {
                warn!("delta source {name} is incomplete, treating as missing");
                return Ok(None);
            }
        }
        let mut file = match spool {
            Some(file) => file,
            None => self.spool_file()?, // zero-size source
        };
        file.seek(SeekFrom::Start(0))?;
        Ok(Some(crate::delta::DeltaSource { size: total, reader: Box::new(file) }))
    }
}

// ── Payload reading ──────────────────────────────────────────────────────────

struct SectionReader {
    inner: Box<dyn ReadView>,
    remaining: u64,
}

impl Read for SectionReader {
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

struct DecryptReader {
    inner: SectionReader,
    cipher: Box<dyn EntryCipher>,
}

impl Read for DecryptReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.cipher.apply(&mut buf[..n]);
        Ok(n)
    }
}

/// Open the payload stream of one entry fragment: DATA → decrypt →
/// decompress → delta-reconstruct, cut at the fragment size.
///
/// Payload-less kinds yield an empty reader.
pub fn open_payload(
    factory: &dyn ReadViewFactory,
    entry: &EntryStart,
    delta_sources: &dyn DeltaSourceProvider,
) -> Result<EntryPayload> {
    let header = &entry.header;
    let Some(data) = entry.data else {
        return Ok(EntryPayload {
            reader: Box::new(io::empty()),
            fragment_offset: 0,
            fragment_size: 0,
        });
    };

    // With no compression layers, exact framing is expected.
    if header.compression.is_none() && !header.delta {
        let expected = header.crypt.padded_len(header.fragment_size);
        if data.body_len != expected {
            return Err(Error::CorruptData(format!(
                "entry {}: payload is {} bytes, expected {expected}",
                header.name, data.body_len
            )));
        }
    }

    let mut view = factory.open_view()?;
    view.seek(SeekFrom::Start(data.body_offset))?;
    let section = SectionReader { inner: view, remaining: data.body_len };

    let decrypted: Box<dyn Read + Send> = if header.crypt.is_none() {
        Box::new(section)
    } else {
        let key = entry.crypt.key.as_deref().ok_or(Error::WrongPassword)?;
        let iv: [u8; CIPHER_BLOCK_LEN] = header.crypt_salt[..CIPHER_BLOCK_LEN].try_into().unwrap();
        let cipher = make_entry_cipher(header.crypt, Some(key), &iv)?;
        Box::new(DecryptReader { inner: section, cipher })
    };

    let decompressed = make_decompressor(header.compression, decrypted)?;

    let top: Box<dyn Read + Send> = if header.delta {
        let source = delta_sources
            .open(&header.name)?
            .ok_or_else(|| Error::DeltaSourceNotFound(header.name.clone()))?;
        Box::new(DeltaReader::new(decompressed, source))
    } else {
        decompressed
    };

    Ok(EntryPayload {
        reader: Box::new(top.take(header.fragment_size)),
        fragment_offset: header.fragment_offset,
        fragment_size: header.fragment_size,
    })
}
