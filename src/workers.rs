//! Worker pool and entry-message bus.
//!
//! One iterator thread walks the archive forward and posts entry-start
//! descriptors to a bounded queue; up to `max_workers` native threads pull
//! descriptors, open their own read view by seek-and-reopen, and reverse the
//! pipeline.  Descriptors are delivered in file order, workers execute out
//! of order, and the only shared mutable state is the fragment registry.
//!
//! Cancellation is a flag polled by the iterator and by every worker
//! between entries; a recorded per-entry error raises it unless
//! no-stop-on-error is in effect.  Read-side payload readers short-circuit
//! cooperatively because workers simply stop pulling.
//!
//! On create, a single source-reader thread runs ahead of the container:
//! it prefetches small payloads into memory and hands larger ones over as
//! lazily-opened paths, so file I/O overlaps compression.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use crossbeam_channel::{bounded, Receiver, Sender};
use log::debug;

use crate::archive::{CancelFlag, EntrySpec, EntryStart};
use crate::errors::{Error, Result};
use crate::storage::ReadViewFactory;

/// Default bound of the entry-descriptor queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

// ── Read-side bus ────────────────────────────────────────────────────────────

/// One entry-start descriptor posted by the iterator thread.
pub struct EntryJob {
    /// Archive sequence id: which storage piece the entry lives in.
    pub piece: u32,
    /// Read views of that piece; the worker opens its own.
    pub factory: Arc<dyn ReadViewFactory>,
    /// Parsed entry-start with crypt-info snapshot and byte offsets.
    pub entry: EntryStart,
}

/// Per-entry failures collected during a worker run.
pub type EntryErrors = Vec<(String, Error)>;

/// Run the single-producer / many-workers read loop.
///
/// `producer` runs on the calling thread (the iterator); it posts jobs and
/// observes backpressure through the bounded sender.  `worker` handles one
/// entry and reports entry-scoped failures as errors; the first failure
/// raises the cancellation flag unless `stop_on_error` is false.
///
/// Returns the per-entry failures in completion order.
pub fn run_entry_workers<P, W>(
    max_workers: usize,
    queue_capacity: usize,
    stop_on_error: bool,
    cancel: Option<CancelFlag>,
    producer: P,
    worker: W,
) -> Result<EntryErrors>
where
    P: FnOnce(&Sender<EntryJob>, &CancelFlag) -> Result<()>,
    W: Fn(&EntryJob) -> Result<()> + Sync,
{
    let cancel = cancel.unwrap_or_else(|| Arc::new(AtomicBool::new(false)));
    let errors: Mutex<EntryErrors> = Mutex::new(Vec::new());
    let workers = max_workers.max(1);

    let produced = thread::scope(|scope| {
        let (tx, rx) = bounded::<EntryJob>(queue_capacity);
        let cancel_ref = &cancel;
        let errors_ref = &errors;
        let worker_ref = &worker;

        for id in 0..workers {
            let rx = rx.clone();
            scope.spawn(move || {
                while let Ok(job) = rx.recv() {
                    if cancel_ref.load(Ordering::Relaxed) {
                        // Drain the queue without processing so the
                        // producer never blocks on a dead bus.
                        continue;
                    }
                    let name = job.entry.header.name.clone();
                    if let Err(e) = worker_ref(&job) {
                        debug!("worker {id}: entry {name} failed: {e}");
                        errors_ref.lock().unwrap().push((name, e));
                        if stop_on_error {
                            cancel_ref.store(true, Ordering::Relaxed);
                        }
                    }
                }
            });
        }
        drop(rx);

        let result = producer(&tx, cancel_ref);
        drop(tx);
        result
    });

    produced?;
    if cancel.load(Ordering::Relaxed) && errors.lock().unwrap().is_empty() {
        return Err(Error::Aborted);
    }
    Ok(errors.into_inner().unwrap())
}

// ── Create-side prefetch ─────────────────────────────────────────────────────

/// Payloads at or below this size are prefetched into memory by the reader
/// thread; larger ones are opened lazily by the container thread.
pub const PREFETCH_INLINE_LIMIT: u64 = 1024 * 1024;

/// Queue bound of the create bus; together with the inline limit this caps
/// prefetch memory.
pub const CREATE_QUEUE_CAPACITY: usize = 64;

/// Payload hand-off for one entry on create.
pub enum CreatePayload {
    /// Entry kind without content bytes.
    None,
    /// Small payload, already read.
    Inline(Vec<u8>),
    /// Large payload; the consumer streams it from the path.
    Stream(PathBuf),
}

pub struct CreateJob {
    pub spec: EntrySpec,
    pub payload: CreatePayload,
}

/// Planned input for the prefetch thread: the spec and, for content
/// entries, the source path to read.
pub struct CreatePlan {
    pub spec: EntrySpec,
    pub source: Option<PathBuf>,
}

/// Spawn the source-reader thread.  Jobs arrive in plan order; the bounded
/// channel applies backpressure against the container thread.
pub fn spawn_create_reader(
    plans: Vec<CreatePlan>,
    cancel: Option<CancelFlag>,
) -> (Receiver<CreateJob>, thread::JoinHandle<Result<()>>) {
    let (tx, rx) = bounded::<CreateJob>(CREATE_QUEUE_CAPACITY);
    let handle = thread::spawn(move || {
        for plan in plans {
            if let Some(flag) = &cancel {
                if flag.load(Ordering::Relaxed) {
                    return Err(Error::Aborted);
                }
            }
            let payload = match &plan.source {
                None => CreatePayload::None,
                Some(path) => {
                    if plan.spec.info.size <= PREFETCH_INLINE_LIMIT {
                        match std::fs::read(path) {
                            Ok(bytes) => CreatePayload::Inline(bytes),
                            // Surface open/read failures to the consumer as
                            // a lazy stream so error policy stays in one
                            // place.
                            Err(_) => CreatePayload::Stream(path.clone()),
                        }
                    } else {
                        CreatePayload::Stream(path.clone())
                    }
                }
            };
            if tx.send(CreateJob { spec: plan.spec, payload }).is_err() {
                // Consumer is gone; nothing left to do.
                return Ok(());
            }
        }
        Ok(())
    });
    (rx, handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::{
        open_payload, ArchiveOptions, ArchiveReader, ArchiveWriter, CreateKeys, OpenKeys,
    };
    use crate::delta::NoDeltaSources;
    use crate::entries::{EntryExt, EntryKind, FileInfo};
    use crate::fragments::FragmentRegistry;
    use crate::storage::MemoryStorage;
    use std::io::{Cursor, Read};

    fn archive_with_files(contents: &[(&str, Vec<u8>)]) -> MemoryStorage {
        let storage = MemoryStorage::new();
        let mut writer = ArchiveWriter::create_single(
            storage.clone(),
            ArchiveOptions::default(),
            CreateKeys::default(),
            Arc::new(NoDeltaSources),
        )
        .unwrap();
        for (name, data) in contents {
            let spec = EntrySpec {
                kind: EntryKind::File,
                name: (*name).into(),
                info: FileInfo { size: data.len() as u64, ..FileInfo::default() },
                ext: EntryExt::None,
                hardlink_names: Vec::new(),
            };
            writer.write_entry(&spec, Some(&mut Cursor::new(data.clone()))).unwrap();
        }
        writer.close(false).unwrap();
        storage
    }

    #[test]
    fn workers_verify_all_entries_out_of_order() {
        let contents: Vec<(String, Vec<u8>)> = (0..32)
            .map(|i| (format!("/f{i:02}"), vec![i as u8; 10_000 + i * 37]))
            .collect();
        let borrowed: Vec<(&str, Vec<u8>)> =
            contents.iter().map(|(n, d)| (n.as_str(), d.clone())).collect();
        let storage = archive_with_files(&borrowed);
        let factory: Arc<dyn ReadViewFactory> = Arc::new(storage);
        let registry = FragmentRegistry::new();

        let errors = run_entry_workers(
            4,
            DEFAULT_QUEUE_CAPACITY,
            true,
            None,
            |tx, _cancel| {
                let mut reader = ArchiveReader::open(
                    Arc::clone(&factory),
                    ArchiveOptions::default(),
                    OpenKeys::default(),
                )?;
                while let Some(entry) = reader.next_entry()? {
                    tx.send(EntryJob { piece: 1, factory: Arc::clone(&factory), entry })
                        .map_err(|_| Error::Internal("entry bus closed".into()))?;
                }
                Ok(())
            },
            |job| {
                let mut payload = open_payload(job.factory.as_ref(), &job.entry, &NoDeltaSources)?;
                let mut out = Vec::new();
                payload.reader.read_to_end(&mut out)?;
                let expected = contents
                    .iter()
                    .find(|(n, _)| *n == job.entry.header.name)
                    .map(|(_, d)| d.clone())
                    .unwrap();
                if out != expected {
                    return Err(Error::EntriesDiffer {
                        name: job.entry.header.name.clone(),
                        offset: 0,
                    });
                }
                let node = registry
                    .find_or_create(&job.entry.header.name, job.entry.header.info.size)?;
                let mut node = node.lock().unwrap();
                node.add_range(job.entry.header.fragment_offset, job.entry.header.fragment_size);
                Ok(())
            },
        )
        .unwrap();

        assert!(errors.is_empty(), "{errors:?}");
        assert_eq!(registry.len(), 32);
        assert!(registry.incomplete().is_empty());
    }

    #[test]
    fn first_error_stops_iteration() {
        let borrowed: Vec<(&str, Vec<u8>)> =
            vec![("/a", vec![1; 100]), ("/b", vec![2; 100]), ("/c", vec![3; 100])];
        let storage = archive_with_files(&borrowed);
        let factory: Arc<dyn ReadViewFactory> = Arc::new(storage);

        let errors = run_entry_workers(
            1,
            4,
            true,
            None,
            |tx, cancel| {
                let mut reader = ArchiveReader::open(
                    Arc::clone(&factory),
                    ArchiveOptions::default(),
                    OpenKeys::default(),
                )?;
                while let Some(entry) = reader.next_entry()? {
                    if cancel.load(Ordering::Relaxed) {
                        break;
                    }
                    tx.send(EntryJob { piece: 1, factory: Arc::clone(&factory), entry })
                        .map_err(|_| Error::Internal("entry bus closed".into()))?;
                }
                Ok(())
            },
            |job| {
                Err(Error::EntriesDiffer { name: job.entry.header.name.clone(), offset: 7 })
            },
        )
        .unwrap();

        assert!(!errors.is_empty());
        assert!(errors.len() < 3, "cancellation should cut the run short: {errors:?}");
    }

    #[test]
    fn create_reader_prefetches_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut plans = Vec::new();
        for i in 0..8 {
            let path = dir.path().join(format!("f{i}"));
            std::fs::write(&path, vec![i as u8; 100]).unwrap();
            plans.push(CreatePlan {
                spec: EntrySpec {
                    kind: EntryKind::File,
                    name: format!("/f{i}"),
                    info: FileInfo { size: 100, ..FileInfo::default() },
                    ext: EntryExt::None,
                    hardlink_names: Vec::new(),
                },
                source: Some(path),
            });
        }
        let (rx, handle) = spawn_create_reader(plans, None);
        let mut seen = Vec::new();
        while let Ok(job) = rx.recv() {
            match job.payload {
                CreatePayload::Inline(bytes) => assert_eq!(bytes.len(), 100),
                _ => panic!("small files should be inlined"),
            }
            seen.push(job.spec.name);
        }
        handle.join().unwrap().unwrap();
        let expected: Vec<String> = (0..8).map(|i| format!("/f{i}")).collect();
        assert_eq!(seen, expected);
    }
}
