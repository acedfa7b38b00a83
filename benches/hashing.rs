//! 内容哈希吞吐量：内存中的数据和磁盘文件

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use sharesync_lib::core::file_state::{hash_file, hash_reader};
use std::io::Cursor;

const SIZES: [usize; 3] = [64 * 1024, 1024 * 1024, 16 * 1024 * 1024];

fn payload(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i % 251) as u8).collect()
}

fn hash_in_memory(c: &mut Criterion) {
    let mut group = c.benchmark_group("hash_reader");
    for size in SIZES {
        let data = payload(size);
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &data, |b, data| {
            b.iter(|| hash_reader(&mut Cursor::new(black_box(data))).unwrap());
        });
    }
    group.finish();
}

fn hash_on_disk(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let mut group = c.benchmark_group("hash_file");
    for size in SIZES {
        let path = dir.path().join(format!("file_{size}.bin"));
        std::fs::write(&path, payload(size)).unwrap();
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &path, |b, path| {
            b.iter(|| hash_file(black_box(path)).unwrap());
        });
    }
    group.finish();
}

criterion_group!(benches, hash_in_memory, hash_on_disk);
criterion_main!(benches);
