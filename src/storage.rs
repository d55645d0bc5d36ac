//! Storage adapters — the byte-level collaborators of the archive core.
//!
//! The core never opens files itself: it talks to a [`Storage`] for the
//! archive bytes and a [`VolumeProvider`] when a multi-volume write needs
//! the next sink.  I/O retry and bandwidth throttling happen here and only
//! here; the pipeline above surfaces the first unrecoverable error.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::warn;

use crate::errors::{Error, Result};

/// Independent, seekable read view over an archive piece.  Workers open one
/// per entry so no read position is shared across threads.
pub trait ReadView: Read + Seek + Send {}
impl<T: Read + Seek + Send> ReadView for T {}

/// Shared handle from which any number of read views can be opened.
pub trait ReadViewFactory: Send + Sync {
    fn open_view(&self) -> Result<Box<dyn ReadView>>;
}

impl ReadViewFactory for PathBuf {
    fn open_view(&self) -> Result<Box<dyn ReadView>> {
        let file = File::open(self).map_err(|e| map_open_error(e, self))?;
        Ok(Box::new(file))
    }
}

impl ReadViewFactory for MemoryStorage {
    fn open_view(&self) -> Result<Box<dyn ReadView>> {
        Storage::open_read_view(self)
    }
}

/// One archive piece (volume) the container reads or writes.
pub trait Storage: Read + Write + Seek + Send {
    /// Open an independent read view over the same bytes.
    fn open_read_view(&self) -> Result<Box<dyn ReadView>>;

    /// Total size in bytes.
    fn size(&mut self) -> Result<u64> {
        let pos = self.stream_position()?;
        let size = self.seek(SeekFrom::End(0))?;
        self.seek(SeekFrom::Start(pos))?;
        Ok(size)
    }

    /// Flush everything to durable storage.
    fn sync(&mut self) -> Result<()>;
}

// ── Bandwidth limiter ────────────────────────────────────────────────────────

/// Token-bucket rate limiter consulted between I/O blocks.
pub struct BandwidthLimiter {
    bytes_per_second: u64,
    state: Mutex<BucketState>,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl BandwidthLimiter {
    pub fn new(bytes_per_second: u64) -> Self {
        Self {
            bytes_per_second,
            state: Mutex::new(BucketState {
                tokens: bytes_per_second as f64,
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn current_limit(&self) -> u64 {
        self.bytes_per_second
    }

    /// Block until `bytes` tokens are available.
    pub fn throttle(&self, bytes: usize) {
        if self.bytes_per_second == 0 {
            return;
        }
        let mut state = self.state.lock().unwrap();
        let now = Instant::now();
        let refill = now.duration_since(state.last_refill).as_secs_f64() * self.bytes_per_second as f64;
        state.tokens = (state.tokens + refill).min(self.bytes_per_second as f64);
        state.last_refill = now;
        if state.tokens < bytes as f64 {
            let deficit = bytes as f64 - state.tokens;
            let wait = Duration::from_secs_f64(deficit / self.bytes_per_second as f64);
            drop(state);
            std::thread::sleep(wait);
            let mut state = self.state.lock().unwrap();
            state.tokens = 0.0;
            state.last_refill = Instant::now();
        } else {
            state.tokens -= bytes as f64;
        }
    }
}

// ── File storage ─────────────────────────────────────────────────────────────

/// Transient-error retry budget of the adapter.
const IO_RETRIES: u32 = 3;

/// Archive piece backed by a regular file.
pub struct FileStorage {
    file: File,
    path: PathBuf,
    limiter: Option<Arc<BandwidthLimiter>>,
}

impl FileStorage {
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_owned();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| map_open_error(e, &path))?;
        Ok(Self { file, path, limiter: None })
    }

    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_owned();
        let file = File::open(&path).map_err(|e| map_open_error(e, &path))?;
        Ok(Self { file, path, limiter: None })
    }

    pub fn with_limiter(mut self, limiter: Arc<BandwidthLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn retry<T>(&mut self, mut op: impl FnMut(&mut File) -> io::Result<T>) -> io::Result<T> {
        let mut attempt = 0;
        loop {
            match op(&mut self.file) {
                Err(e) if e.kind() == io::ErrorKind::Interrupted && attempt < IO_RETRIES => {
                    attempt += 1;
                    warn!("transient I/O error on {} (retry {attempt}): {e}", self.path.display());
                }
                other => return other,
            }
        }
    }
}

fn map_open_error(e: io::Error, path: &Path) -> Error {
    match e.kind() {
        io::ErrorKind::NotFound => Error::FileNotFound(path.display().to_string()),
        io::ErrorKind::PermissionDenied => Error::PermissionDenied(path.display().to_string()),
        _ => Error::Io(e),
    }
}

impl Read for FileStorage {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if let Some(limiter) = &self.limiter {
            limiter.throttle(buf.len());
        }
        self.retry(|f| f.read(buf))
    }
}

impl Write for FileStorage {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if let Some(limiter) = &self.limiter {
            limiter.throttle(buf.len());
        }
        self.retry(|f| f.write(buf))
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl Seek for FileStorage {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.file.seek(pos)
    }
}

impl Storage for FileStorage {
    fn open_read_view(&self) -> Result<Box<dyn ReadView>> {
        let file = File::open(&self.path).map_err(|e| map_open_error(e, &self.path))?;
        Ok(Box::new(file))
    }

    fn sync(&mut self) -> Result<()> {
        self.file.flush()?;
        self.file.sync_all()?;
        Ok(())
    }
}

// ── Memory storage ───────────────────────────────────────────────────────────

/// In-memory archive piece; read views share the underlying buffer.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    data: Arc<Mutex<Vec<u8>>>,
    position: u64,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> Vec<u8> {
        self.data.lock().unwrap().clone()
    }
}

impl Read for MemoryStorage {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let data = self.data.lock().unwrap();
        let pos = self.position as usize;
        if pos >= data.len() {
            return Ok(0);
        }
        let n = buf.len().min(data.len() - pos);
        buf[..n].copy_from_slice(&data[pos..pos + n]);
        drop(data);
        self.position += n as u64;
        Ok(n)
    }
}

impl Write for MemoryStorage {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut data = self.data.lock().unwrap();
        let pos = self.position as usize;
        if pos + buf.len() > data.len() {
            data.resize(pos + buf.len(), 0);
        }
        data[pos..pos + buf.len()].copy_from_slice(buf);
        drop(data);
        self.position += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Seek for MemoryStorage {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let len = self.data.lock().unwrap().len() as i64;
        let target = match pos {
            SeekFrom::Start(n) => n as i64,
            SeekFrom::End(n) => len + n,
            SeekFrom::Current(n) => self.position as i64 + n,
        };
        if target < 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "seek before start"));
        }
        self.position = target as u64;
        Ok(self.position)
    }
}

impl Storage for MemoryStorage {
    fn open_read_view(&self) -> Result<Box<dyn ReadView>> {
        Ok(Box::new(MemoryStorage { data: Arc::clone(&self.data), position: 0 }))
    }

    fn sync(&mut self) -> Result<()> {
        Ok(())
    }
}

// ── Volume provider ──────────────────────────────────────────────────────────

/// Supplies the sink for each volume of a split archive.  Volume numbers
/// start at 1.
pub trait VolumeProvider: Send {
    fn request(&self, volume: u32) -> Result<PathBuf>;
}

/// `backup.bar` → `backup-001.bar`, `backup-002.bar`, …
pub struct NumberedVolumes {
    base: PathBuf,
}

impl NumberedVolumes {
    pub fn new<P: AsRef<Path>>(base: P) -> Self {
        Self { base: base.as_ref().to_owned() }
    }

    /// Path of volume `n` under this naming scheme.
    pub fn volume_path(base: &Path, volume: u32) -> PathBuf {
        let stem = base.file_stem().unwrap_or_default().to_string_lossy();
        let ext = base.extension().map(|e| e.to_string_lossy().into_owned());
        let name = match ext {
            Some(ext) => format!("{stem}-{volume:03}.{ext}"),
            None => format!("{stem}-{volume:03}"),
        };
        base.with_file_name(name)
    }
}

impl VolumeProvider for NumberedVolumes {
    fn request(&self, volume: u32) -> Result<PathBuf> {
        Ok(Self::volume_path(&self.base, volume))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_storage_roundtrip_and_views() {
        let mut s = MemoryStorage::new();
        s.write_all(b"hello storage").unwrap();
        s.seek(SeekFrom::Start(6)).unwrap();
        s.write_all(b"STORAGE").unwrap();
        assert_eq!(s.size().unwrap(), 13);

        let mut view = s.open_read_view().unwrap();
        let mut out = String::new();
        view.read_to_string(&mut out).unwrap();
        assert_eq!(out, "hello STORAGE");
    }

    #[test]
    fn volume_naming() {
        let p = NumberedVolumes::volume_path(Path::new("/tmp/backup.bar"), 2);
        assert_eq!(p, Path::new("/tmp/backup-002.bar"));
        let q = NumberedVolumes::volume_path(Path::new("backup"), 11);
        assert_eq!(q, Path::new("backup-011"));
    }

    #[test]
    fn limiter_allows_within_budget() {
        let limiter = BandwidthLimiter::new(1_000_000);
        let start = Instant::now();
        limiter.throttle(1000);
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn missing_file_maps_to_file_not_found() {
        let err = FileStorage::open("/nonexistent/bar/archive.bar").unwrap_err();
        assert!(matches!(err, Error::FileNotFound(_)));
    }
}
