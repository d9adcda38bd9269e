//! Benchmarks for phase splitting and response merging

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use fedgb_core::{DistributionPolicy, Features, FgbParameter, TrainOptions};
use fedgb_model::message::{CipherPair, EncryptedGradHess, P3Response, SplitChoice, TrainInit};
use fedgb_model::Message;
use fedgb_shard::{split_gh, split_list, ShardPlanner};

fn bench_split_list(c: &mut Criterion) {
    let items: Vec<usize> = (0..10_000).collect();
    let mut group = c.benchmark_group("split_list");

    for parts in [2, 8, 64].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(parts), parts, |b, &parts| {
            b.iter(|| split_list(&items, parts))
        });
    }

    group.finish();
}

fn bench_split_init(c: &mut Criterion) {
    let names: Vec<String> = (1..=200).map(|i| format!("x{}", i)).collect();
    let names: Vec<&str> = names.iter().map(String::as_str).collect();
    let init = TrainInit {
        parameter: FgbParameter::default(),
        features: Features::from_names("uid", &names, Some("y")),
        test_index: Vec::new(),
        match_id: (0..50_000).map(|i| format!("u{}", i)).collect(),
        options: TrainOptions::default(),
    };
    let planner = ShardPlanner::new(DistributionPolicy::default());

    c.bench_function("split_init_200_features", |b| {
        b.iter(|| planner.split(0, Message::TrainInit(init.clone())))
    });
}

fn bench_split_gh(c: &mut Criterion) {
    let request = EncryptedGradHess {
        client: Some("b".to_string()),
        instance_space: (0..100_000).collect(),
        gh: Some(
            (0..100_000)
                .map(|i| CipherPair {
                    g: format!("{:x}", i),
                    h: format!("{:x}", i + 1),
                })
                .collect(),
        ),
        public_key: Some("ff".to_string()),
        new_tree: true,
        sub_model: None,
    };

    c.bench_function("split_gh_100k", |b| {
        b.iter(|| {
            let mut request = request.clone();
            split_gh(&mut request, 8)
        })
    });
}

fn bench_merge_max_gain(c: &mut Criterion) {
    let planner = ShardPlanner::default().with_shard_count(64);
    let responses: Vec<Message> = (0..64)
        .map(|i| {
            Message::P3Response(P3Response {
                best: Some(SplitChoice {
                    client: "a".to_string(),
                    feature: i + 1,
                    split_index: 0,
                    gain: (i % 7) as f64,
                }),
                sub_model: None,
            })
        })
        .collect();

    c.bench_function("merge_max_gain_64_shards", |b| {
        b.iter(|| planner.merge(3, responses.clone()))
    });
}

criterion_group!(
    benches,
    bench_split_list,
    bench_split_init,
    bench_split_gh,
    bench_merge_max_gain
);
criterion_main!(benches);
