use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use slabpool::Pool;
use std::hint::black_box;

const OPS: u64 = 100_000;

/// slabpool alloc/free throughput.
fn pool_alloc_free(pool: &Pool) {
  for _ in 0..OPS {
    let entry = pool.allocate();
    black_box(entry);
    unsafe { pool.free(entry) };
  }
}

/// libc alloc/free throughput.
fn libc_malloc_free(size: usize) {
  for _ in 0..OPS {
    unsafe {
      let ptr = libc::malloc(size);
      black_box(ptr);
      libc::free(ptr);
    }
  }
}

fn benchmark_pool_throughput(c: &mut Criterion) {
  let mut group = c.benchmark_group("pool_throughput");

  for size in [16, 64, 256, 1024] {
    let pool = Pool::new(size).unwrap();
    group.throughput(Throughput::Elements(OPS));

    group.bench_with_input(BenchmarkId::new("slabpool", size), &size, |b, _| {
      b.iter(|| pool_alloc_free(&pool))
    });

    group.bench_with_input(BenchmarkId::new("libc", size), &size, |b, &size| {
      b.iter(|| libc_malloc_free(size))
    });
  }

  group.finish();
}

criterion_group!(benches, benchmark_pool_throughput);
criterion_main!(benches);
