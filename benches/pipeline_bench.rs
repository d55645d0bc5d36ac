use std::io::{Cursor, Read};
use std::sync::Arc;

use criterion::{criterion_group, criterion_main, Criterion, Throughput};

use bar::archive::{
    open_payload, ArchiveOptions, ArchiveReader, ArchiveWriter, CreateKeys, OpenKeys,
};
use bar::compress::ByteAlgorithm;
use bar::crypt::CryptAlgorithm;
use bar::delta::NoDeltaSources;
use bar::entries::{EntryExt, EntryKind, FileInfo};
use bar::storage::{MemoryStorage, ReadViewFactory};

const PAYLOAD: usize = 4 * 1024 * 1024;

fn sample_data() -> Vec<u8> {
    (0..PAYLOAD as u32).map(|i| (i.wrapping_mul(2654435761) >> 24) as u8).collect()
}

fn write_archive(options: ArchiveOptions, keys: CreateKeys, data: &[u8]) -> MemoryStorage {
    let storage = MemoryStorage::new();
    let mut writer = ArchiveWriter::create_single(
        storage.clone(),
        options,
        keys,
        Arc::new(NoDeltaSources),
    )
    .unwrap();
    let spec = bar::archive::EntrySpec {
        kind: EntryKind::File,
        name: "/bench".into(),
        info: FileInfo { size: data.len() as u64, ..FileInfo::default() },
        ext: EntryExt::None,
        hardlink_names: Vec::new(),
    };
    writer.write_entry(&spec, Some(&mut Cursor::new(data.to_vec()))).unwrap();
    writer.close(false).unwrap();
    storage
}

fn bench_pipeline(c: &mut Criterion) {
    let data = sample_data();
    let mut group = c.benchmark_group("entry_pipeline");
    group.throughput(Throughput::Bytes(PAYLOAD as u64));

    for (label, options, keys) in [
        ("store", ArchiveOptions::default(), CreateKeys::default()),
        (
            "zstd3",
            ArchiveOptions { compression: ByteAlgorithm::Zstd(3), ..ArchiveOptions::default() },
            CreateKeys::default(),
        ),
        (
            "zstd3+aes256",
            ArchiveOptions {
                compression: ByteAlgorithm::Zstd(3),
                crypt: CryptAlgorithm::Aes256Ctr,
                ..ArchiveOptions::default()
            },
            CreateKeys { password: Some("bench".into()), ..CreateKeys::default() },
        ),
    ] {
        group.bench_function(format!("write/{label}"), |b| {
            b.iter(|| {
                write_archive(options.clone(), clone_keys(&keys), &data);
            })
        });

        let storage = write_archive(options.clone(), clone_keys(&keys), &data);
        group.bench_function(format!("read/{label}"), |b| {
            b.iter(|| {
                let factory: Arc<dyn ReadViewFactory> = Arc::new(storage.clone());
                let mut reader = ArchiveReader::open(
                    Arc::clone(&factory),
                    ArchiveOptions::default(),
                    OpenKeys {
                        password: Some(Box::new(|_, _| Some("bench".into()))),
                        ..OpenKeys::default()
                    },
                )
                .unwrap();
                let entry = reader.next_entry().unwrap().unwrap();
                let mut payload =
                    open_payload(factory.as_ref(), &entry, &NoDeltaSources).unwrap();
                let mut out = Vec::with_capacity(PAYLOAD);
                payload.reader.read_to_end(&mut out).unwrap();
                assert_eq!(out.len(), PAYLOAD);
            })
        });
    }
    group.finish();
}

fn clone_keys(keys: &CreateKeys) -> CreateKeys {
    CreateKeys { password: keys.password.clone(), ..CreateKeys::default() }
}

criterion_group!(benches, bench_pipeline);
criterion_main!(benches);
