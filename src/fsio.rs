//! Filesystem adapters — uniform capture and materialization of entries.
//!
//! Everything the container knows about the host filesystem funnels through
//! here: stat capture into [`FileInfo`], payload sources with atime
//! preservation and cache-dropping reads, tree enumeration with hard-link
//! grouping, device-image access, and entry materialization on restore.
//!
//! In-archive names are always `/`-separated regardless of host.  Owner and
//! group symbolic names are captured alongside ids so restores on a
//! different host can fall back by name.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use log::{debug, warn};

use crate::archive::{EntryPayload, EntrySpec};
use crate::entries::{EntryExt, EntryKind, FileInfo, SpecialKind};
use crate::errors::{Error, Result};
use crate::workers::CreatePlan;

/// Behavior switches for source reads and restores.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsOptions {
    /// Preserve access times on read (O_NOATIME, else restore afterwards).
    pub no_atime: bool,
    /// Drop OS read-ahead caches after streaming a payload.
    pub no_cache: bool,
}

// ── Path canonicalization ────────────────────────────────────────────────────

/// In-archive name of a host path: `/`-separated, no trailing slash.
pub fn archive_name(path: &Path) -> String {
    let mut name = path.to_string_lossy().replace('\\', "/");
    while name.len() > 1 && name.ends_with('/') {
        name.pop();
    }
    name
}

/// Host path of an in-archive name, placed under `dest`.
pub fn restore_path(dest: &Path, name: &str) -> PathBuf {
    dest.join(name.trim_start_matches('/'))
}

// ── Stat capture ─────────────────────────────────────────────────────────────

/// Capture one filesystem object as (kind, info, ext).  Symlinks are not
/// followed.
pub fn stat_entry(path: &Path) -> Result<(EntryKind, FileInfo, EntryExt)> {
    let meta = fs::symlink_metadata(path).map_err(|e| map_fs_error(e, path))?;
    let info = file_info_from(&meta, path);
    let file_type = meta.file_type();

    #[cfg(unix)]
    {
        use std::os::unix::fs::FileTypeExt;
        use std::os::unix::fs::MetadataExt;
        if file_type.is_symlink() {
            let target = fs::read_link(path).map_err(|e| map_fs_error(e, path))?;
            return Ok((
                EntryKind::Link,
                info,
                EntryExt::Link { target: archive_name(&target) },
            ));
        }
        if file_type.is_dir() {
            return Ok((EntryKind::Directory, info, EntryExt::None));
        }
        let special = if file_type.is_char_device() {
            Some(SpecialKind::CharDevice)
        } else if file_type.is_block_device() {
            Some(SpecialKind::BlockDevice)
        } else if file_type.is_fifo() {
            Some(SpecialKind::Fifo)
        } else if file_type.is_socket() {
            Some(SpecialKind::Socket)
        } else {
            None
        };
        if let Some(kind) = special {
            let rdev = meta.rdev();
            return Ok((
                EntryKind::Special,
                info,
                EntryExt::Special {
                    kind,
                    major: nix::sys::stat::major(rdev) as u32,
                    minor: nix::sys::stat::minor(rdev) as u32,
                },
            ));
        }
        return Ok((EntryKind::File, info, EntryExt::None));
    }

    #[cfg(not(unix))]
    {
        if file_type.is_symlink() {
            let target = fs::read_link(path).map_err(|e| map_fs_error(e, path))?;
            return Ok((
                EntryKind::Link,
                info,
                EntryExt::Link { target: archive_name(&target) },
            ));
        }
        if file_type.is_dir() {
            return Ok((EntryKind::Directory, info, EntryExt::None));
        }
        Ok((EntryKind::File, info, EntryExt::None))
    }
}

#[cfg(unix)]
fn file_info_from(meta: &fs::Metadata, path: &Path) -> FileInfo {
    use std::os::unix::fs::MetadataExt;
    FileInfo {
        size: if meta.is_file() { meta.len() } else { 0 },
        mtime: meta.mtime().max(0) as u64,
        atime: meta.atime().max(0) as u64,
        ctime: meta.ctime().max(0) as u64,
        uid: meta.uid(),
        gid: meta.gid(),
        mode: meta.mode(),
        attributes: 0,
        user_name: user_name(meta.uid()),
        group_name: group_name(meta.gid()),
        xattrs: read_xattrs(path),
    }
}

#[cfg(not(unix))]
fn file_info_from(meta: &fs::Metadata, _path: &Path) -> FileInfo {
    let ts = |t: std::result::Result<std::time::SystemTime, io::Error>| {
        t.ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs())
            .unwrap_or(0)
    };
    FileInfo {
        size: if meta.is_file() { meta.len() } else { 0 },
        mtime: ts(meta.modified()),
        atime: ts(meta.accessed()),
        ctime: ts(meta.created()),
        mode: if meta.permissions().readonly() { 0o100444 } else { 0o100644 },
        ..FileInfo::default()
    }
}

#[cfg(unix)]
fn user_name(uid: u32) -> String {
    nix::unistd::User::from_uid(nix::unistd::Uid::from_raw(uid))
        .ok()
        .flatten()
        .map(|u| u.name)
        .unwrap_or_default()
}

#[cfg(unix)]
fn group_name(gid: u32) -> String {
    nix::unistd::Group::from_gid(nix::unistd::Gid::from_raw(gid))
        .ok()
        .flatten()
        .map(|g| g.name)
        .unwrap_or_default()
}

#[cfg(unix)]
fn read_xattrs(path: &Path) -> Vec<(String, Vec<u8>)> {
    let mut out = Vec::new();
    if let Ok(names) = xattr::list(path) {
        for name in names {
            let name_str = name.to_string_lossy().into_owned();
            if let Ok(Some(value)) = xattr::get(path, &name) {
                out.push((name_str, value));
            }
        }
    }
    out
}

fn map_fs_error(e: io::Error, path: &Path) -> Error {
    match e.kind() {
        io::ErrorKind::NotFound => Error::FileNotFound(path.display().to_string()),
        io::ErrorKind::PermissionDenied => Error::PermissionDenied(path.display().to_string()),
        _ => Error::Io(e),
    }
}

// ── Payload source ───────────────────────────────────────────────────────────

/// Readable payload source honoring the atime and cache options.
pub struct FileSource {
    file: File,
    path: PathBuf,
    options: FsOptions,
    /// (atime, mtime) to restore when O_NOATIME was unavailable.
    restore_times: Option<(filetime::FileTime, filetime::FileTime)>,
}

impl FileSource {
    pub fn open(path: &Path, options: FsOptions) -> Result<Self> {
        let mut restore_times = None;
        let file = {
            #[cfg(unix)]
            {
                use std::os::unix::fs::OpenOptionsExt;
                if options.no_atime {
                    // O_NOATIME fails for files we do not own; fall back to
                    // restoring the timestamp after reading.
                    match OpenOptions::new()
                        .read(true)
                        .custom_flags(libc::O_NOATIME)
                        .open(path)
                    {
                        Ok(f) => f,
                        Err(_) => {
                            let meta = fs::symlink_metadata(path)
                                .map_err(|e| map_fs_error(e, path))?;
                            restore_times = Some((
                                filetime::FileTime::from_last_access_time(&meta),
                                filetime::FileTime::from_last_modification_time(&meta),
                            ));
                            File::open(path).map_err(|e| map_fs_error(e, path))?
                        }
                    }
                } else {
                    File::open(path).map_err(|e| map_fs_error(e, path))?
                }
            }
            #[cfg(not(unix))]
            {
                File::open(path).map_err(|e| map_fs_error(e, path))?
            }
        };
        Ok(Self { file, path: path.to_owned(), options, restore_times })
    }
}

impl Read for FileSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

impl Drop for FileSource {
    fn drop(&mut self) {
        #[cfg(unix)]
        if self.options.no_cache {
            use std::os::fd::AsRawFd;
            let _ = nix::fcntl::posix_fadvise(
                self.file.as_raw_fd(),
                0,
                0,
                nix::fcntl::PosixFadviseAdvice::POSIX_FADV_DONTNEED,
            );
        }
        if let Some((atime, mtime)) = self.restore_times {
            let _ = filetime::set_file_times(&self.path, atime, mtime);
        }
    }
}

/// Byte-for-byte compare of one payload fragment against the live file.
/// Never writes; reports the first mismatching byte offset.
pub fn compare_payload(path: &Path, payload: &mut EntryPayload, options: FsOptions) -> Result<()> {
    let mut live = FileSource::open(path, options)?;
    live.file.seek(SeekFrom::Start(payload.fragment_offset))?;

    let name = archive_name(path);
    let mut archived = vec![0u8; 64 * 1024];
    let mut on_disk = vec![0u8; 64 * 1024];
    let mut position = payload.fragment_offset;
    let mut remaining = payload.fragment_size;
    while remaining > 0 {
        let want = archived.len().min(remaining as usize);
        let n = payload.reader.read(&mut archived[..want])?;
        if n == 0 {
            return Err(Error::CorruptData(format!("payload for {name} ended early")));
        }
        let mut filled = 0;
        while filled < n {
            let got = live.read(&mut on_disk[filled..n])?;
            if got == 0 {
                return Err(Error::EntriesDiffer { name, offset: position + filled as u64 });
            }
            filled += got;
        }
        if archived[..n] != on_disk[..n] {
            let mismatch = archived[..n]
                .iter()
                .zip(&on_disk[..n])
                .position(|(a, b)| a != b)
                .unwrap_or(0);
            return Err(Error::EntriesDiffer { name, offset: position + mismatch as u64 });
        }
        position += n as u64;
        remaining -= n as u64;
    }
    Ok(())
}

// ── Device images ────────────────────────────────────────────────────────────

/// Predicate over device blocks; filesystem-aware image mode stores zeros
/// for blocks the predicate rejects.
pub trait BlockUsePredicate: Send + Sync {
    fn is_used(&self, block_index: u64) -> bool;
}

/// Raw mode: every block is used.
pub struct AllBlocksUsed;

impl BlockUsePredicate for AllBlocksUsed {
    fn is_used(&self, _block_index: u64) -> bool {
        true
    }
}

/// Open a block device (or image file) for capture.  Returns the device
/// size, its block size, and a blockwise reader that zero-fills unused
/// blocks.
pub fn open_image(
    path: &Path,
    predicate: Box<dyn BlockUsePredicate>,
    options: FsOptions,
) -> Result<(u64, u32, ImageReader)> {
    let mut source = FileSource::open(path, options)?;
    let size = source.file.seek(SeekFrom::End(0))?;
    source.file.seek(SeekFrom::Start(0))?;

    let block_size = device_block_size(&source.file);
    if block_size == 0 || size % u64::from(block_size) != 0 {
        return Err(Error::InvalidDeviceBlockSize(u64::from(block_size)));
    }
    Ok((size, block_size, ImageReader { source, size, block_size, position: 0, predicate }))
}

#[cfg(unix)]
fn device_block_size(file: &File) -> u32 {
    use std::os::unix::fs::MetadataExt;
    file.metadata().map(|m| m.blksize() as u32).unwrap_or(512).max(512)
}

#[cfg(not(unix))]
fn device_block_size(_file: &File) -> u32 {
    512
}

/// Blockwise image reader; unused blocks come back zeroed.
pub struct ImageReader {
    source: FileSource,
    size: u64,
    block_size: u32,
    position: u64,
    predicate: Box<dyn BlockUsePredicate>,
}

impl ImageReader {
    pub fn block_count(&self) -> u64 {
        self.size / u64::from(self.block_size)
    }
}

impl Read for ImageReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.position >= self.size {
            return Ok(0);
        }
        let block_size = u64::from(self.block_size);
        let block_index = self.position / block_size;
        let block_remaining = (block_size - self.position % block_size) as usize;
        let want = buf.len().min(block_remaining).min((self.size - self.position) as usize);

        let n = if self.predicate.is_used(block_index) {
            self.source.file.seek(SeekFrom::Start(self.position))?;
            self.source.file.read(&mut buf[..want])?
        } else {
            buf[..want].iter_mut().for_each(|b| *b = 0);
            want
        };
        self.position += n as u64;
        Ok(n)
    }
}

// ── Tree enumeration ─────────────────────────────────────────────────────────

/// Walk the roots depth-first and plan one entry per filesystem object.
/// Hard-link groups (regular files with link count > 1) collapse into one
/// hardlink entry carrying every peer name found during the walk.
pub fn plan_tree(roots: &[PathBuf]) -> Result<Vec<CreatePlan>> {
    let mut plans = Vec::new();
    #[cfg(unix)]
    let mut hardlinks: HashMap<(u64, u64), usize> = HashMap::new();
    #[cfg(not(unix))]
    let hardlinks: HashMap<(u64, u64), usize> = HashMap::new();
    let _ = &hardlinks;

    let mut pending: Vec<PathBuf> = roots.iter().rev().cloned().collect();
    while let Some(path) = pending.pop() {
        let (kind, info, ext) = match stat_entry(&path) {
            Ok(done) => done,
            Err(e) => {
                warn!("skipping {}: {e}", path.display());
                continue;
            }
        };
        let name = archive_name(&path);

        if kind == EntryKind::Directory {
            let mut children: Vec<PathBuf> = fs::read_dir(&path)
                .map_err(|e| map_fs_error(e, &path))?
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .collect();
            // Reverse-sorted so the stack pops in lexical order.
            children.sort();
            children.reverse();
            plans.push(CreatePlan {
                spec: EntrySpec { kind, name, info, ext, hardlink_names: Vec::new() },
                source: None,
            });
            pending.extend(children);
            continue;
        }

        #[cfg(unix)]
        if kind == EntryKind::File {
            use std::os::unix::fs::MetadataExt;
            let meta = fs::symlink_metadata(&path).map_err(|e| map_fs_error(e, &path))?;
            if meta.nlink() > 1 {
                let key = (meta.dev(), meta.ino());
                if let Some(&index) = hardlinks.get(&key) {
                    // Another name for an already-planned inode.
                    plans[index].spec.hardlink_names.push(name);
                    if let EntryExt::Hardlink { peer_count } = &mut plans[index].spec.ext {
                        *peer_count += 1;
                    }
                    continue;
                }
                hardlinks.insert(key, plans.len());
                plans.push(CreatePlan {
                    spec: EntrySpec {
                        kind: EntryKind::Hardlink,
                        name: name.clone(),
                        info,
                        ext: EntryExt::Hardlink { peer_count: 1 },
                        hardlink_names: vec![name],
                    },
                    source: Some(path),
                });
                continue;
            }
        }

        let source = (kind == EntryKind::File).then(|| path.clone());
        plans.push(CreatePlan {
            spec: EntrySpec { kind, name, info, ext, hardlink_names: Vec::new() },
            source,
        });
    }
    Ok(plans)
}

// ── Restore ──────────────────────────────────────────────────────────────────

/// Materialize one entry fragment under `dest`.
///
/// File fragments are written at their fragment offset, so volumes may be
/// restored in any order.  Metadata is (re)applied after every fragment;
/// hard links are created once the first peer exists.
pub fn restore_entry(
    dest: &Path,
    spec_name: &str,
    kind: EntryKind,
    info: &FileInfo,
    ext: &EntryExt,
    hardlink_names: &[String],
    payload: Option<&mut EntryPayload>,
) -> Result<()> {
    let target_path = restore_path(dest, spec_name);
    if let Some(parent) = target_path.parent() {
        fs::create_dir_all(parent).map_err(|e| map_fs_error(e, parent))?;
    }

    match kind {
        EntryKind::Directory => {
            if !target_path.is_dir() {
                fs::create_dir_all(&target_path).map_err(|e| map_fs_error(e, &target_path))?;
            }
        }
        EntryKind::Link => {
            let EntryExt::Link { target } = ext else {
                return Err(Error::WrongEntryType { expected: "link" });
            };
            let _ = fs::remove_file(&target_path);
            make_symlink(target, &target_path)?;
        }
        EntryKind::File | EntryKind::Image => {
            let payload = payload.ok_or(Error::WrongEntryType { expected: "file payload" })?;
            write_fragment(&target_path, payload, info.size)?;
        }
        EntryKind::Hardlink => {
            let payload = payload.ok_or(Error::WrongEntryType { expected: "hardlink payload" })?;
            let first = restore_path(dest, hardlink_names.first().map_or(spec_name, |n| n));
            write_fragment(&first, payload, info.size)?;
            for peer in hardlink_names.iter().skip(1) {
                let peer_path = restore_path(dest, peer);
                if let Some(parent) = peer_path.parent() {
                    fs::create_dir_all(parent).map_err(|e| map_fs_error(e, parent))?;
                }
                let _ = fs::remove_file(&peer_path);
                fs::hard_link(&first, &peer_path).map_err(|e| map_fs_error(e, &peer_path))?;
            }
        }
        EntryKind::Special => {
            let EntryExt::Special { kind: special, major, minor } = ext else {
                return Err(Error::WrongEntryType { expected: "special" });
            };
            make_special(&target_path, *special, *major, *minor, info.mode)?;
        }
    }

    apply_metadata(&target_path, info, kind == EntryKind::Link)?;
    debug!("restored {} {}", kind.name(), target_path.display());
    Ok(())
}

fn write_fragment(path: &Path, payload: &mut EntryPayload, total_size: u64) -> Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .map_err(|e| map_fs_error(e, path))?;
    // Pre-size to the full entry so fragments restore in any order and a
    // stale larger file is cut back.
    file.set_len(total_size)?;
    file.seek(SeekFrom::Start(payload.fragment_offset))?;
    let mut buf = vec![0u8; 256 * 1024];
    let mut remaining = payload.fragment_size;
    while remaining > 0 {
        let want = buf.len().min(remaining as usize);
        let n = payload.reader.read(&mut buf[..want])?;
        if n == 0 {
            return Err(Error::CorruptData(format!(
                "payload for {} ended {remaining} bytes early",
                path.display()
            )));
        }
        file.write_all(&buf[..n])?;
        remaining -= n as u64;
    }
    Ok(())
}

fn make_symlink(target: &str, path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        std::os::unix::fs::symlink(target, path).map_err(|e| map_fs_error(e, path))
    }
    #[cfg(not(unix))]
    {
        let _ = (target, path);
        Err(Error::FunctionNotSupported("symbolic links"))
    }
}

fn make_special(path: &Path, kind: SpecialKind, major: u32, minor: u32, mode: u32) -> Result<()> {
    #[cfg(unix)]
    {
        use nix::sys::stat::{makedev, mknod, Mode, SFlag};
        let _ = fs::remove_file(path);
        let flag = match kind {
            SpecialKind::CharDevice => SFlag::S_IFCHR,
            SpecialKind::BlockDevice => SFlag::S_IFBLK,
            SpecialKind::Socket => SFlag::S_IFSOCK,
            SpecialKind::Fifo => {
                let perm = Mode::from_bits_truncate(mode & 0o7777);
                return nix::unistd::mkfifo(path, perm)
                    .map_err(|e| Error::Io(io::Error::from(e)));
            }
        };
        let perm = Mode::from_bits_truncate(mode & 0o7777);
        mknod(path, flag, perm, makedev(u64::from(major), u64::from(minor)))
            .map_err(|e| Error::Io(io::Error::from(e)))
    }
    #[cfg(not(unix))]
    {
        let _ = (path, kind, major, minor, mode);
        Err(Error::FunctionNotSupported("special files"))
    }
}

/// Apply mode, ownership, xattrs and timestamps.  Ownership and xattr
/// failures degrade to warnings so unprivileged restores still succeed.
fn apply_metadata(path: &Path, info: &FileInfo, is_symlink: bool) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if !is_symlink {
            let perm = fs::Permissions::from_mode(info.mode & 0o7777);
            if let Err(e) = fs::set_permissions(path, perm) {
                warn!("cannot set mode on {}: {e}", path.display());
            }
        }
        let chown: fn(&Path, Option<u32>, Option<u32>) -> io::Result<()> = if is_symlink {
            std::os::unix::fs::lchown::<&Path>
        } else {
            std::os::unix::fs::chown::<&Path>
        };
        if let Err(e) = chown(path, Some(info.uid), Some(info.gid)) {
            debug!("cannot set owner on {}: {e}", path.display());
        }
        for (name, value) in &info.xattrs {
            if let Err(e) = xattr::set(path, name, value) {
                warn!("cannot set xattr {name} on {}: {e}", path.display());
            }
        }
    }

    let atime = filetime::FileTime::from_unix_time(info.atime as i64, 0);
    let mtime = filetime::FileTime::from_unix_time(info.mtime as i64, 0);
    let set = if is_symlink {
        filetime::set_symlink_file_times(path, atime, mtime)
    } else {
        filetime::set_file_times(path, atime, mtime)
    };
    if let Err(e) = set {
        warn!("cannot set times on {}: {e}", path.display());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn archive_names_are_slash_canonical() {
        assert_eq!(archive_name(Path::new("/a/b/c/")), "/a/b/c");
        assert_eq!(archive_name(Path::new("rel/x")), "rel/x");
        assert_eq!(archive_name(Path::new("/")), "/");
    }

    #[test]
    fn stat_and_plan_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("tree");
        fs::create_dir(&root).unwrap();
        fs::write(root.join("a.txt"), b"hello").unwrap();
        fs::create_dir(root.join("sub")).unwrap();
        fs::write(root.join("sub/b.bin"), vec![7u8; 100]).unwrap();
        #[cfg(unix)]
        std::os::unix::fs::symlink("a.txt", root.join("l")).unwrap();

        let plans = plan_tree(&[root.clone()]).unwrap();
        let names: Vec<&str> = plans.iter().map(|p| p.spec.name.as_str()).collect();
        assert!(names[0].ends_with("/tree"));
        assert!(names.iter().any(|n| n.ends_with("/a.txt")));
        assert!(names.iter().any(|n| n.ends_with("/sub/b.bin")));

        let file_plan = plans.iter().find(|p| p.spec.name.ends_with("/a.txt")).unwrap();
        assert_eq!(file_plan.spec.kind, EntryKind::File);
        assert_eq!(file_plan.spec.info.size, 5);
        assert!(file_plan.source.is_some());
    }

    #[cfg(unix)]
    #[test]
    fn hardlink_groups_collapse() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("hl");
        fs::create_dir(&root).unwrap();
        fs::write(root.join("x"), vec![1u8; 4096]).unwrap();
        fs::hard_link(root.join("x"), root.join("y")).unwrap();

        let plans = plan_tree(&[root]).unwrap();
        let groups: Vec<_> =
            plans.iter().filter(|p| p.spec.kind == EntryKind::Hardlink).collect();
        assert_eq!(groups.len(), 1, "one inode, one group");
        assert_eq!(groups[0].spec.hardlink_names.len(), 2);
        assert_eq!(groups[0].spec.ext, EntryExt::Hardlink { peer_count: 2 });
    }

    #[test]
    fn restore_file_fragment_at_offset() {
        let dir = tempfile::tempdir().unwrap();
        let mut payload = EntryPayload {
            reader: Box::new(io::Cursor::new(b"world".to_vec())),
            fragment_offset: 5,
            fragment_size: 5,
        };
        let info = FileInfo { size: 10, mode: 0o100600, mtime: 1_700_000_000, ..FileInfo::default() };
        restore_entry(
            dir.path(),
            "/out.bin",
            EntryKind::File,
            &info,
            &EntryExt::None,
            &[],
            Some(&mut payload),
        )
        .unwrap();

        let mut payload0 = EntryPayload {
            reader: Box::new(io::Cursor::new(b"hello".to_vec())),
            fragment_offset: 0,
            fragment_size: 5,
        };
        restore_entry(
            dir.path(),
            "/out.bin",
            EntryKind::File,
            &info,
            &EntryExt::None,
            &[],
            Some(&mut payload0),
        )
        .unwrap();

        assert_eq!(fs::read(dir.path().join("out.bin")).unwrap(), b"helloworld");
    }

    #[cfg(unix)]
    #[test]
    fn restore_hardlinks_share_inode() {
        use std::os::unix::fs::MetadataExt;
        let dir = tempfile::tempdir().unwrap();
        let data = vec![9u8; 2048];
        let mut payload = EntryPayload {
            reader: Box::new(io::Cursor::new(data.clone())),
            fragment_offset: 0,
            fragment_size: data.len() as u64,
        };
        let info = FileInfo { size: data.len() as u64, mode: 0o100644, ..FileInfo::default() };
        restore_entry(
            dir.path(),
            "/x",
            EntryKind::Hardlink,
            &info,
            &EntryExt::Hardlink { peer_count: 2 },
            &["/x".into(), "/y".into()],
            Some(&mut payload),
        )
        .unwrap();

        let x = fs::metadata(dir.path().join("x")).unwrap();
        let y = fs::metadata(dir.path().join("y")).unwrap();
        assert_eq!(x.ino(), y.ino());
        assert_eq!(fs::read(dir.path().join("y")).unwrap(), data);
    }

    #[test]
    fn image_reader_zeroes_unused_blocks() {
        struct EvenBlocks;
        impl BlockUsePredicate for EvenBlocks {
            fn is_used(&self, block_index: u64) -> bool {
                block_index % 2 == 0
            }
        }
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("img");
        // Two "blocks" of the filesystem block size.
        let probe = File::create(&path).unwrap();
        let block = device_block_size(&probe) as usize;
        drop(probe);
        fs::write(&path, vec![0xABu8; block * 2]).unwrap();

        let (size, block_size, mut reader) =
            open_image(&path, Box::new(EvenBlocks), FsOptions::default()).unwrap();
        assert_eq!(size, (block * 2) as u64);
        assert_eq!(block_size as usize, block);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert!(out[..block].iter().all(|&b| b == 0xAB));
        assert!(out[block..].iter().all(|&b| b == 0));
    }
}
