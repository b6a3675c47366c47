use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use lumen_storage::{
    FileStorage, FilesystemStorage, MemoryStorage, MetadataOverrides, Payload, dimensions,
};
use std::hint::black_box;
use std::time::Duration;
use tempfile::TempDir;

const CHUNK: usize = 64 * 1024;

fn payload(len: usize) -> Payload {
    Payload::typed((0..len).map(|i| u8::try_from(i % 251).unwrap_or(0)).collect::<Vec<_>>(), "video/mp4")
}

// Direct writes stay under `chunk_size * stream_threshold_chunks`; chunked writes cross it.
fn bench_filesystem_writes(c: &mut Criterion) {
    let mut group = c.benchmark_group("filesystem_write");
    group.measurement_time(Duration::from_secs(10));

    let rt = tokio::runtime::Runtime::new().unwrap();
    let temp = TempDir::new().unwrap();
    let storage = FilesystemStorage::builder().root(temp.path()).chunk_size(CHUNK).build().unwrap();
    rt.block_on(storage.initialize()).unwrap();

    for (name, len) in [("direct_256KB", 4 * CHUNK), ("chunked_1MB", 16 * CHUNK)] {
        let data = payload(len);
        group.throughput(Throughput::Bytes(len as u64));
        group.bench_with_input(BenchmarkId::from_parameter(name), &data, |b, data| {
            b.to_async(&rt).iter(|| async {
                black_box(
                    storage
                        .save_file("bench.mp4", data.clone(), MetadataOverrides::default())
                        .await
                        .unwrap(),
                );
            });
        });
    }

    group.finish();
}

fn bench_memory_writes(c: &mut Criterion) {
    let mut group = c.benchmark_group("memory_write");
    let rt = tokio::runtime::Runtime::new().unwrap();
    let storage = MemoryStorage::default();
    let data = payload(CHUNK);

    group.throughput(Throughput::Bytes(CHUNK as u64));
    group.bench_function("64KB", |b| {
        b.to_async(&rt).iter(|| async {
            black_box(
                storage.save_file("bench", data.clone(), MetadataOverrides::default()).await.unwrap(),
            );
        });
    });

    group.finish();
}

fn bench_thumbnail_dimensions(c: &mut Criterion) {
    c.bench_function("thumbnail_dimensions", |b| {
        b.iter(|| black_box(dimensions(black_box(4032), black_box(3024), black_box(256))));
    });
}

criterion_group!(benches, bench_filesystem_writes, bench_memory_writes, bench_thumbnail_dimensions);
criterion_main!(benches);
