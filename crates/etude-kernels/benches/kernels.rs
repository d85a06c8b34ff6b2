//! Criterion benchmarks comparing backends against the dispatch façade

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use etude_core::HardwareProfile;
use etude_kernels::{dispatch, scalar, KernelRegistry};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

fn random_vec(rng: &mut ChaCha8Rng, n: usize) -> Vec<f32> {
    (0..n).map(|_| rng.gen_range(-4.0f32..4.0)).collect()
}

fn bench_vector_add(c: &mut Criterion) {
    let mut reg = KernelRegistry::new();
    reg.init(HardwareProfile::detect()).unwrap();
    let mut rng = ChaCha8Rng::seed_from_u64(42);

    let mut group = c.benchmark_group("vector_add");
    for &n in &[64usize, 1024, 16_384] {
        let a = random_vec(&mut rng, n);
        let b = random_vec(&mut rng, n);
        let mut out = vec![0.0f32; n];

        group.bench_with_input(BenchmarkId::new("scalar", n), &n, |bench, _| {
            bench.iter(|| scalar::vector_add(black_box(&a), black_box(&b), &mut out));
        });
        group.bench_with_input(BenchmarkId::new("dispatch", n), &n, |bench, _| {
            bench.iter(|| {
                dispatch::vector_add_optimal(&reg, black_box(&a), black_box(&b), &mut out)
                    .unwrap()
            });
        });
    }
    group.finish();
}

fn bench_matmul(c: &mut Criterion) {
    let mut reg = KernelRegistry::new();
    reg.init(HardwareProfile::detect()).unwrap();

    let mut rng = ChaCha8Rng::seed_from_u64(7);
    let mut group = c.benchmark_group("matmul");
    group.sample_size(20);
    for &dim in &[32usize, 100, 256] {
        let a = random_vec(&mut rng, dim * dim);
        let b = random_vec(&mut rng, dim * dim);
        let mut out = vec![0.0f32; dim * dim];

        group.bench_with_input(BenchmarkId::new("scalar", dim), &dim, |bench, _| {
            bench.iter(|| scalar::matmul(black_box(&a), black_box(&b), &mut out, dim, dim, dim));
        });
        group.bench_with_input(BenchmarkId::new("dispatch", dim), &dim, |bench, _| {
            bench.iter(|| {
                dispatch::matmul_optimal(&reg, black_box(&a), black_box(&b), &mut out, dim, dim, dim)
                    .unwrap()
            });
        });
    }
    group.finish();
}

fn bench_softmax(c: &mut Criterion) {
    let mut reg = KernelRegistry::new();
    reg.init(HardwareProfile::detect()).unwrap();

    let n = 10_000;
    let x: Vec<f32> = (0..n).map(|i| (i as f32 * 0.017).sin() * 6.0).collect();
    let mut out = vec![0.0f32; n];

    c.bench_function("softmax_10k", |bench| {
        bench.iter(|| dispatch::softmax_optimal(&reg, black_box(&x), &mut out).unwrap());
    });
}

criterion_group!(benches, bench_vector_add, bench_matmul, bench_softmax);
criterion_main!(benches);
