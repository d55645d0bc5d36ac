//! End-to-end archive round-trips over real files.

use std::fs;
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bar::archive::{
    open_payload, verify_signatures, ArchiveOptions, ArchiveReader, ArchiveWriter, CreateKeys,
    OpenKeys,
};
use bar::compress::ByteAlgorithm;
use bar::crypt::CryptAlgorithm;
use bar::delta::NoDeltaSources;
use bar::entries::{EntryExt, EntryKind, FileInfo};
use bar::errors::Error;
use bar::fragments::FragmentRegistry;
use bar::fsio;
use bar::signature::SignatureState;
use bar::storage::{FileStorage, NumberedVolumes, ReadViewFactory, VolumeProvider};
use bar::workers::{run_entry_workers, EntryJob, DEFAULT_QUEUE_CAPACITY};
use ed25519_dalek::SigningKey;

fn file_spec(name: &str, size: u64) -> bar::archive::EntrySpec {
    bar::archive::EntrySpec {
        kind: EntryKind::File,
        name: name.into(),
        info: FileInfo { size, mtime: 1_700_000_000, mode: 0o100644, ..FileInfo::default() },
        ext: EntryExt::None,
        hardlink_names: Vec::new(),
    }
}

fn open_piece(path: &Path) -> (Arc<dyn ReadViewFactory>, ArchiveReader) {
    let factory: Arc<dyn ReadViewFactory> = Arc::new(path.to_owned());
    let reader = ArchiveReader::open(
        Arc::clone(&factory),
        ArchiveOptions::default(),
        OpenKeys::default(),
    )
    .unwrap();
    (factory, reader)
}

#[test]
fn tree_roundtrip_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("src");
    fs::create_dir(&source).unwrap();
    fs::write(source.join("a.txt"), b"hello, world\n").unwrap();
    fs::create_dir(source.join("nested")).unwrap();
    let big: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
    fs::write(source.join("nested/big.bin"), &big).unwrap();
    fs::write(source.join("empty"), b"").unwrap();

    // Create.
    let archive = dir.path().join("backup.bar");
    let plans = fsio::plan_tree(&[source.clone()]).unwrap();
    let options = ArchiveOptions {
        compression: ByteAlgorithm::Zstd(3),
        ..ArchiveOptions::default()
    };
    let mut writer = ArchiveWriter::create_single(
        FileStorage::create(&archive).unwrap(),
        options,
        CreateKeys::default(),
        Arc::new(NoDeltaSources),
    )
    .unwrap();
    for plan in &plans {
        match &plan.source {
            Some(path) => {
                let mut src = fs::File::open(path).unwrap();
                writer.write_entry(&plan.spec, Some(&mut src)).unwrap();
            }
            None => {
                writer.write_entry(&plan.spec, None).unwrap();
            }
        }
    }
    writer.close(false).unwrap();

    // Restore.
    let restored = dir.path().join("out");
    let (factory, mut reader) = open_piece(&archive);
    while let Some(entry) = reader.next_entry().unwrap() {
        let mut payload = if entry.header.kind.has_payload() {
            Some(open_payload(factory.as_ref(), &entry, &NoDeltaSources).unwrap())
        } else {
            None
        };
        fsio::restore_entry(
            &restored,
            &entry.header.name,
            entry.header.kind,
            &entry.header.info,
            &entry.header.ext,
            &entry.hardlink_names,
            payload.as_mut(),
        )
        .unwrap();
    }

    let base = restored.join(source.strip_prefix("/").unwrap_or(&source));
    assert_eq!(fs::read(base.join("a.txt")).unwrap(), b"hello, world\n");
    assert_eq!(fs::read(base.join("nested/big.bin")).unwrap(), big);
    assert_eq!(fs::read(base.join("empty")).unwrap(), b"");
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        let mode = fs::metadata(base.join("a.txt")).unwrap().mode();
        assert_eq!(mode & 0o7777, 0o644);
    }
}

#[test]
fn encrypted_compressed_file_archive() {
    let dir = tempfile::tempdir().unwrap();
    let archive = dir.path().join("secret.bar");
    let data: Vec<u8> = (0..500_000u32).map(|i| (i * 7 % 253) as u8).collect();

    let options = ArchiveOptions {
        compression: ByteAlgorithm::Bzip2(9),
        crypt: CryptAlgorithm::Twofish256Ctr,
        ..ArchiveOptions::default()
    };
    let mut writer = ArchiveWriter::create_single(
        FileStorage::create(&archive).unwrap(),
        options.clone(),
        CreateKeys { password: Some("sekret".into()), ..CreateKeys::default() },
        Arc::new(NoDeltaSources),
    )
    .unwrap();
    writer
        .write_entry(&file_spec("/blob", data.len() as u64), Some(&mut Cursor::new(data.clone())))
        .unwrap();
    writer.close(false).unwrap();

    let factory: Arc<dyn ReadViewFactory> = Arc::new(archive.clone());
    let mut reader = ArchiveReader::open(
        Arc::clone(&factory),
        options.clone(),
        OpenKeys { password: Some(Box::new(|_, _| Some("sekret".into()))), ..OpenKeys::default() },
    )
    .unwrap();
    let entry = reader.next_entry().unwrap().unwrap();
    let mut payload = open_payload(factory.as_ref(), &entry, &NoDeltaSources).unwrap();
    let mut out = Vec::new();
    payload.reader.read_to_end(&mut out).unwrap();
    assert_eq!(out, data);

    let err = ArchiveReader::open(
        Arc::clone(&factory),
        options,
        OpenKeys { password: Some(Box::new(|_, _| Some("nope".into()))), ..OpenKeys::default() },
    )
    .unwrap_err();
    assert!(matches!(err, Error::WrongPassword));
}

#[test]
fn split_volumes_with_missing_piece() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("big.bar");
    let data: Vec<u8> = (0..2_000_000u32).map(|i| (i * 13 % 241) as u8).collect();

    let options = ArchiveOptions { part_size: Some(400_000), ..ArchiveOptions::default() };
    let provider = NumberedVolumes::new(&base);
    let base_for_factory = base.clone();
    let mut writer = ArchiveWriter::create(
        Box::new(move |volume| {
            FileStorage::create(NumberedVolumes::new(&base_for_factory).request(volume)?)
        }),
        options,
        CreateKeys::default(),
        Arc::new(NoDeltaSources),
    )
    .unwrap();
    let stats = writer
        .write_entry(&file_spec("/big.bin", data.len() as u64), Some(&mut Cursor::new(data.clone())))
        .unwrap();
    writer.close(false).unwrap();
    assert!(stats.fragments >= 4, "fragments: {}", stats.fragments);

    // All volumes exist on disk under the numbered naming scheme.
    let mut volumes: Vec<PathBuf> = Vec::new();
    for volume in 1..=stats.fragments {
        let path = provider.request(volume).unwrap();
        assert!(path.exists(), "{} should exist", path.display());
        volumes.push(path);
    }

    // Complete read: every byte comes back.
    let registry = FragmentRegistry::new();
    let mut reconstructed = vec![0u8; data.len()];
    for path in &volumes {
        let (factory, mut reader) = open_piece(path);
        while let Some(entry) = reader.next_entry().unwrap() {
            let mut payload = open_payload(factory.as_ref(), &entry, &NoDeltaSources).unwrap();
            let mut bytes = Vec::new();
            payload.reader.read_to_end(&mut bytes).unwrap();
            let at = entry.header.fragment_offset as usize;
            reconstructed[at..at + bytes.len()].copy_from_slice(&bytes);
            let node = registry
                .find_or_create(&entry.header.name, entry.header.info.size)
                .unwrap();
            node.lock().unwrap().add_range(entry.header.fragment_offset, entry.header.fragment_size);
        }
    }
    assert!(registry.incomplete().is_empty());
    assert_eq!(reconstructed, data);

    // Delete volume 2: the entry is incomplete and the gap is reported.
    fs::remove_file(&volumes[1]).unwrap();
    let registry = FragmentRegistry::new();
    for path in volumes.iter().filter(|p| p.exists()) {
        let (_factory, mut reader) = open_piece(path);
        while let Some(entry) = reader.next_entry().unwrap() {
            let node = registry
                .find_or_create(&entry.header.name, entry.header.info.size)
                .unwrap();
            node.lock().unwrap().add_range(entry.header.fragment_offset, entry.header.fragment_size);
        }
    }
    let incomplete = registry.incomplete();
    assert_eq!(incomplete.len(), 1);
    assert_eq!(incomplete[0].0, "/big.bin");
    assert_eq!(incomplete[0].1.len(), 1, "one contiguous gap from volume 2");
}

#[test]
fn signed_archive_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let archive = dir.path().join("signed.bar");
    let signing = SigningKey::from_bytes(&[42u8; 32]);
    let public = signing.verifying_key();

    let mut writer = ArchiveWriter::create_single(
        FileStorage::create(&archive).unwrap(),
        ArchiveOptions::default(),
        CreateKeys { signing_key: Some(signing), ..CreateKeys::default() },
        Arc::new(NoDeltaSources),
    )
    .unwrap();
    writer
        .write_entry(&file_spec("/doc", 9), Some(&mut Cursor::new(b"signed me".to_vec())))
        .unwrap();
    writer.close(true).unwrap();

    let factory: Arc<dyn ReadViewFactory> = Arc::new(archive.clone());
    assert_eq!(
        verify_signatures(factory.as_ref(), Some(&public)).unwrap(),
        SignatureState::Ok
    );

    // Flip one payload byte on disk: the signature over that range breaks.
    let mut bytes = fs::read(&archive).unwrap();
    let position = bytes
        .windows(9)
        .position(|w| w == b"signed me")
        .expect("plaintext payload present");
    bytes[position] ^= 0xFF;
    fs::write(&archive, bytes).unwrap();
    assert_eq!(
        verify_signatures(factory.as_ref(), Some(&public)).unwrap(),
        SignatureState::Invalid
    );
}

#[test]
fn parallel_compare_against_live_tree() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("cmp");
    fs::create_dir(&source).unwrap();
    let mut originals = Vec::new();
    for i in 0..12 {
        let data: Vec<u8> = (0..50_000u32).map(|n| ((n + i) % 250) as u8).collect();
        fs::write(source.join(format!("f{i:02}")), &data).unwrap();
        originals.push(data);
    }

    let archive = dir.path().join("cmp.bar");
    let plans = fsio::plan_tree(&[source.clone()]).unwrap();
    let mut writer = ArchiveWriter::create_single(
        FileStorage::create(&archive).unwrap(),
        ArchiveOptions { compression: ByteAlgorithm::Zstd(3), ..ArchiveOptions::default() },
        CreateKeys::default(),
        Arc::new(NoDeltaSources),
    )
    .unwrap();
    for plan in &plans {
        match &plan.source {
            Some(path) => {
                let mut src = fs::File::open(path).unwrap();
                writer.write_entry(&plan.spec, Some(&mut src)).unwrap();
            }
            None => {
                writer.write_entry(&plan.spec, None).unwrap();
            }
        }
    }
    writer.close(false).unwrap();

    let compare = |expect_clean: bool| {
        let factory: Arc<dyn ReadViewFactory> = Arc::new(archive.clone());
        run_entry_workers(
            4,
            DEFAULT_QUEUE_CAPACITY,
            false,
            None,
            |tx, _cancel| {
                let mut reader = ArchiveReader::open(
                    Arc::clone(&factory),
                    ArchiveOptions::default(),
                    OpenKeys::default(),
                )?;
                while let Some(entry) = reader.next_entry()? {
                    tx.send(EntryJob { piece: 1, factory: Arc::clone(&factory), entry })
                        .map_err(|_| Error::Internal("bus closed".into()))?;
                }
                Ok(())
            },
            |job| {
                if !job.entry.header.kind.has_payload() {
                    return Ok(());
                }
                let mut payload =
                    open_payload(job.factory.as_ref(), &job.entry, &NoDeltaSources)?;
                fsio::compare_payload(
                    Path::new(&job.entry.header.name),
                    &mut payload,
                    fsio::FsOptions::default(),
                )
            },
        )
        .map(|errors| {
            if expect_clean {
                assert!(errors.is_empty(), "{errors:?}");
            } else {
                assert!(errors
                    .iter()
                    .any(|(_, e)| matches!(e, Error::EntriesDiffer { offset: 777, .. })));
            }
        })
        .unwrap()
    };

    compare(true);

    // Flip one live byte; the comparator pinpoints the offset.
    let victim = source.join("f05");
    let mut bytes = fs::read(&victim).unwrap();
    bytes[777] ^= 1;
    fs::write(&victim, bytes).unwrap();
    compare(false);
}
