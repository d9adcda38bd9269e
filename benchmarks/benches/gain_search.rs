//! Benchmarks for bucketing and split-gain search

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use fedgb_core::SampleId;
use fedgb_crypto::{EncryptionTool, PaillierTool};
use fedgb_model::bucket::{
    best_split, compute_gain, gh_sum, process_each_numeric_feature, sort_and_group, GhCache,
};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

fn column(samples: usize, seed: u64) -> Vec<(SampleId, f64)> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    (0..samples).map(|i| (i, rng.gen_range(-1.0..1.0))).collect()
}

fn bench_sort_and_group(c: &mut Criterion) {
    let mut group = c.benchmark_group("sort_and_group");

    for samples in [1_000, 10_000, 100_000].iter() {
        let values = column(*samples, 1);
        group.throughput(Throughput::Elements(*samples as u64));
        group.bench_with_input(BenchmarkId::from_parameter(samples), samples, |b, _| {
            b.iter(|| sort_and_group(values.clone(), 33))
        });
    }

    group.finish();
}

fn bench_plain_gain_search(c: &mut Criterion) {
    let samples = 100_000;
    let buckets = sort_and_group(column(samples, 2), 33);
    let mut rng = ChaCha8Rng::seed_from_u64(3);
    let grad: Vec<f64> = (0..samples).map(|_| rng.gen_range(-0.5..0.5)).collect();
    let hess: Vec<f64> = (0..samples).map(|_| rng.gen_range(0.0..0.25)).collect();
    let g: f64 = grad.iter().sum();
    let h: f64 = hess.iter().sum();

    c.bench_function("plain_gain_search_100k", |b| {
        b.iter(|| {
            let sums = process_each_numeric_feature(&buckets, &grad, &hess);
            best_split(&compute_gain(&sums, g, h, 1.0, 0.0))
        })
    });
}

fn bench_encrypted_bucket_sums(c: &mut Criterion) {
    let tool = PaillierTool::default();
    let private_key = tool.key_generate(512).unwrap();
    let public_key = tool.public_key(&private_key);

    let mut group = c.benchmark_group("encrypted_bucket_sums");
    group.sample_size(10);

    for samples in [500, 2_000].iter() {
        let buckets = sort_and_group(column(*samples, 4), 33);
        let cache: GhCache<PaillierTool> = (0..*samples)
            .map(|id| {
                let g = tool.encrypt(0.1, &public_key).unwrap();
                let h = tool.encrypt(0.25, &public_key).unwrap();
                (id, (g, h))
            })
            .collect();

        group.throughput(Throughput::Elements(*samples as u64));
        group.bench_with_input(BenchmarkId::from_parameter(samples), samples, |b, _| {
            b.iter(|| gh_sum(&tool, &buckets, &cache, &public_key))
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_sort_and_group,
    bench_plain_gain_search,
    bench_encrypted_bucket_sums
);
criterion_main!(benches);
