use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use gridstore_chunk::{Chunk, ChunkContext, ChunkEncoding, ChunkFactory};
use gridstore_model::{ChunkId, ChunkShape};
use uuid::Uuid;

const NO_DATA: f64 = -9999.0;
const SIDE: usize = 256;

fn chunk_with_exceptions(
    factory: &ChunkFactory,
    encoding: ChunkEncoding,
    every: usize,
) -> Chunk<f64> {
    let ctx = ChunkContext::new(&NO_DATA);
    let shape = ChunkShape::new(SIDE, SIDE);
    let mut chunk = factory
        .create_encoded(encoding, Uuid::new_v4(), ChunkId::new(0, 0), shape, &0.0)
        .unwrap();
    for offset in (0..SIDE * SIDE).step_by(every) {
        chunk
            .set(ctx, offset / SIDE, offset % SIDE, (offset % 97) as f64)
            .unwrap();
    }
    chunk
}

fn bench_encodings(c: &mut Criterion) {
    let factory = ChunkFactory::default();
    let ctx = ChunkContext::new(&NO_DATA);
    let cells = (SIDE * SIDE) as u64;

    let mut group = c.benchmark_group("chunk_encodings");
    group.throughput(Throughput::Elements(cells));

    for encoding in [ChunkEncoding::DenseArray, ChunkEncoding::SparseMap] {
        let chunk = chunk_with_exceptions(&factory, encoding, 50);

        group.bench_with_input(BenchmarkId::new("scan", encoding), &chunk, |b, chunk| {
            b.iter(|| {
                let total: f64 = chunk.cells(ctx).unwrap().map(|(_, _, value)| value).sum();
                black_box(total);
            })
        });

        group.bench_with_input(BenchmarkId::new("histogram", encoding), &chunk, |b, chunk| {
            b.iter(|| black_box(chunk.histogram(ctx).n()))
        });

        group.bench_with_input(BenchmarkId::new("write", encoding), &chunk, |b, chunk| {
            b.iter_batched(
                || chunk.clone(),
                |mut chunk| {
                    for offset in (0..SIDE * SIDE).step_by(211) {
                        chunk.set(ctx, offset / SIDE, offset % SIDE, 1.5).unwrap();
                    }
                    black_box(chunk)
                },
                criterion::BatchSize::LargeInput,
            )
        });
    }

    let dense = chunk_with_exceptions(&factory, ChunkEncoding::DenseArray, 50);
    group.bench_function("convert_dense_to_sparse", |b| {
        b.iter(|| black_box(factory.convert(&dense, ChunkEncoding::SparseMap, ctx).unwrap()))
    });

    group.finish();
}

criterion_group!(benches, bench_encodings);
criterion_main!(benches);
