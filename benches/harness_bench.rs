use chunkpool::{partition, workloads, Backend, Harness, HarnessConfig};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

fn partition_benchmark(c: &mut Criterion) {
    c.bench_function("partition 1GiB over 8 workers", |b| {
        b.iter(|| partition(black_box(1 << 30), black_box(8)).unwrap())
    });
}

fn prime_count_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("count primes below 200k");
    group.sample_size(10);

    for backend in [Backend::Threaded, Backend::Multiprocess] {
        for workers in [1usize, 4] {
            let harness = Harness::new(HarnessConfig {
                num_workers: workers,
                backend,
                ..Default::default()
            });
            group.bench_with_input(
                BenchmarkId::new(backend.to_string(), workers),
                &harness,
                |b, harness| {
                    b.iter(|| {
                        harness
                            .map_range(black_box(200_000), workloads::count_primes)
                            .unwrap()
                    })
                },
            );
        }
    }
    group.finish();
}

criterion_group!(benches, partition_benchmark, prime_count_benchmark);
criterion_main!(benches);
