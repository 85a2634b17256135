// Benchmarks for the archive and the change id tie-break
// Measures appends, range iteration during live sync and compaction to disk

use std::hint::black_box;
use std::sync::Arc;

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};

use strand_api::model::{ChangePackage, ChangeScope};
use strand_core::service::archive::{Archive, ArchiveConfig, ArchiveCursor, FileArchiveStore};
use strand_core::service::quorum::{tie_break, wins_tie_break};

fn change(id: u64) -> Arc<ChangePackage> {
    Arc::new(ChangePackage::new(
        id,
        (id % 5) as u32,
        ChangeScope::Collection(1),
        vec![vec![0u8; 64]],
    ))
}

fn filled(n: u64, threshold: usize) -> Archive {
    let mut archive = Archive::new(&ArchiveConfig { threshold });
    for id in 1..=n {
        archive.append(change(id)).unwrap();
    }
    archive
}

fn bench_append(c: &mut Criterion) {
    let changes: Vec<_> = (1..=1000).map(change).collect();
    c.bench_function("archive_append_1000", |b| {
        b.iter(|| {
            let mut archive = Archive::new(&ArchiveConfig { threshold: 1000 });
            for change in &changes {
                archive.append(change.clone()).unwrap();
            }
            black_box(archive.len())
        })
    });
}

fn bench_range(c: &mut Criterion) {
    let mut group = c.benchmark_group("archive_range");
    for size in [1_000u64, 10_000] {
        let archive = filled(size, size as usize);
        group.bench_with_input(BenchmarkId::from_parameter(size), &archive, |b, archive| {
            b.iter(|| black_box(archive.range(size / 2).count()))
        });
    }
    group.finish();
}

fn bench_cursor(c: &mut Criterion) {
    let archive = filled(10_000, 10_000);
    c.bench_function("archive_cursor_walk", |b| {
        b.iter(|| {
            let mut cursor = ArchiveCursor::new(1);
            let mut n = 0;
            while cursor.advance(&archive).is_some() {
                n += 1;
            }
            black_box(n)
        })
    });
}

fn bench_compact(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let store = FileArchiveStore::new(dir.path()).unwrap();
    c.bench_function("archive_compact_1000", |b| {
        b.iter_batched(
            || filled(2_000, 1_000),
            |mut archive| black_box(archive.compact(&store).unwrap()),
            criterion::BatchSize::SmallInput,
        )
    });
}

fn bench_tie_break(c: &mut Criterion) {
    c.bench_function("tie_break", |b| {
        b.iter(|| black_box(tie_break(black_box(17), black_box(123_456), black_box(5))))
    });
    c.bench_function("wins_tie_break_64", |b| {
        b.iter(|| {
            (0..64u32)
                .filter(|other| wins_tie_break(black_box(7), *other, black_box(99), 64))
                .count()
        })
    });
}

criterion_group!(
    benches,
    bench_append,
    bench_range,
    bench_cursor,
    bench_compact,
    bench_tie_break
);
criterion_main!(benches);
