//! End-to-end training simulation test
//!
//! Runs whole sessions through the local coordinator:
//! - Three parties, one holding the label
//! - Local and feature-sharded parties on the same data
//! - Inference walks over the trained trees
//! - Model text round trip and restore

use anyhow::{Context, Result};
use fedgb_core::{DistributionPolicy, FeatureBand, MetricType, PerShard, SampleTier};
use fedgb_crypto::PaillierTool;
use fedgb_model::ModelSnapshot;
use fedgb_sim::{generate, LocalCoordinator, SimConfig, SyntheticConfig, Task, VerticalDataset};

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// One feature per shard, so every party is split
fn per_feature_policy() -> DistributionPolicy {
    DistributionPolicy {
        tiers: vec![SampleTier {
            max_samples: None,
            bands: vec![FeatureBand {
                max_features: None,
                per_shard: PerShard::Fixed(1),
            }],
        }],
        max_shards: None,
    }
}

fn sim_config(objective: &str, sharded: bool) -> SimConfig {
    let mut config = SimConfig {
        sharded,
        ..SimConfig::default()
    };
    config.training.distribution = per_feature_policy();

    let parameter = &mut config.training.parameter;
    parameter.objective = objective.to_string();
    parameter.bit_length = 256;
    parameter.num_boost_round = 2;
    parameter.max_depth = 3;
    parameter.num_bin = 8;
    parameter.min_sample_split = 10;
    config
}

fn dataset(task: Task) -> VerticalDataset {
    generate(&SyntheticConfig {
        samples: 120,
        features_per_party: vec![2, 3, 2],
        task,
        noise: 0.05,
        seed: 7,
    })
}

async fn train(config: SimConfig, data: &VerticalDataset) -> Result<LocalCoordinator<PaillierTool>> {
    let coordinator = LocalCoordinator::new(PaillierTool::default(), config, data.parties.clone())?;
    coordinator.train(&data.uids, &[]).await?;
    Ok(coordinator)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_binary_training_session() -> Result<()> {
    init_tracing();
    let data = dataset(Task::Binary);
    let coordinator =
        LocalCoordinator::new(PaillierTool::default(), sim_config("binary:logistic", false), data.parties.clone())?;

    let report = coordinator.train(&data.uids, &[]).await?;
    assert_eq!(report.trees, 2);
    assert!(report.splits > 0, "no split in {} trees", report.trees);
    assert_eq!(report.metrics.rounds(), 2);

    let auc = report
        .metrics
        .latest(MetricType::Auc)
        .context("AUC not recorded")?;
    assert!(auc > 0.6, "train AUC {auc}");

    let prediction = coordinator.predict(&data.uids).await?;
    assert_eq!(prediction.values.len(), data.uids.len());
    assert!(prediction.values.iter().all(|p| *p > 0.0 && *p < 1.0));

    // Passive parties only hold query records, never trees
    let passive = coordinator.snapshot("b")?;
    assert!(passive.trees.is_empty());
    assert!(passive.loss.is_none());
    let active = coordinator.snapshot("a")?;
    assert_eq!(active.trees.len(), 2);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_sharded_training_matches_local() -> Result<()> {
    init_tracing();
    let data = dataset(Task::Binary);

    let local = train(sim_config("binary:logistic", false), &data).await?;
    let sharded = train(sim_config("binary:logistic", true), &data).await?;

    assert_eq!(local.shard_count("b"), Some(1));
    assert_eq!(sharded.shard_count("a"), Some(2));
    assert_eq!(sharded.shard_count("b"), Some(3));
    assert_eq!(sharded.shard_count("c"), Some(2));

    for party in ["a", "b", "c"] {
        assert_eq!(
            local.snapshot(party)?,
            sharded.snapshot(party)?,
            "party {party} diverged"
        );
    }

    let expected = local.predict(&data.uids).await?;
    let actual = sharded.predict(&data.uids).await?;
    assert_eq!(actual, expected);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_model_text_round_trip_serves_same_predictions() -> Result<()> {
    init_tracing();
    let data = dataset(Task::Binary);
    let trained = train(sim_config("binary:logistic", false), &data).await?;
    let expected = trained.predict(&data.uids).await?;

    let restored = LocalCoordinator::new(
        PaillierTool::default(),
        sim_config("binary:logistic", false),
        data.parties.clone(),
    )?;
    for party in ["a", "b", "c"] {
        let text = trained.snapshot(party)?.to_text()?;
        let snapshot = ModelSnapshot::from_text(&text)?;
        assert_eq!(snapshot.to_text()?, text);
        restored.restore(party, snapshot)?;
    }

    let actual = restored.predict(&data.uids).await?;
    assert_eq!(actual, expected);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_regression_reduces_rmse() -> Result<()> {
    init_tracing();
    let data = dataset(Task::Regression);
    let mut config = sim_config("reg:square", false);
    config.training.parameter.num_boost_round = 3;
    config.training.parameter.eval_metric = vec![MetricType::Rmse];
    config.training.parameter.maximize = false;

    let coordinator = LocalCoordinator::new(PaillierTool::default(), config, data.parties.clone())?;
    let report = coordinator.train(&data.uids, &[]).await?;

    let history = &report.metrics.values[&MetricType::Rmse];
    assert_eq!(history.len(), 4);
    assert_eq!(history[0].1, f64::MAX);
    assert!(history[3].1 <= history[1].1, "RMSE grew: {history:?}");
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_multi_class_predicts_known_labels() -> Result<()> {
    init_tracing();
    let data = dataset(Task::MultiClass(3));
    let mut config = sim_config("multi:softmax", true);
    config.training.parameter.num_class = 3;
    config.training.parameter.eval_metric = vec![MetricType::Macc];

    let coordinator = LocalCoordinator::new(PaillierTool::default(), config, data.parties.clone())?;
    let report = coordinator.train(&data.uids, &[]).await?;
    assert_eq!(report.trees, 6);

    let prediction = coordinator.predict(&data.uids).await?;
    assert_eq!(prediction.scores.len(), 3);
    assert!(prediction
        .values
        .iter()
        .all(|v| [0.0, 1.0, 2.0].contains(v)));
    for s in 0..data.uids.len() {
        let total: f64 = prediction.scores.iter().map(|row| row[s]).sum();
        assert!((total - 1.0).abs() < 1e-9);
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_poisson_predictions_are_positive() -> Result<()> {
    init_tracing();
    let data = dataset(Task::Count);
    let mut config = sim_config("count:poisson", false);
    config.training.parameter.eval_metric = vec![MetricType::Rmse];
    config.training.parameter.maximize = false;

    let coordinator = train(config, &data).await?;
    let prediction = coordinator.predict(&data.uids).await?;
    assert!(prediction.values.iter().all(|v| *v > 0.0));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_held_out_samples_route_through_trees() -> Result<()> {
    init_tracing();
    let data = dataset(Task::Binary);
    let mut config = sim_config("binary:logistic", false);
    config.holdout_every = 4;
    let test_index = config.test_index(data.uids.len());
    assert_eq!(test_index.len(), 30);

    let coordinator = LocalCoordinator::new(PaillierTool::default(), config, data.parties.clone())?;
    let report = coordinator.train(&data.uids, &test_index).await?;
    assert_eq!(report.test_uids.len(), 30);
    assert_eq!(report.test_uids[0], data.uids[3]);

    // One uid unknown to every party: NaN features route left everywhere
    let mut uids = report.test_uids.clone();
    uids.push("missing".to_string());
    let prediction = coordinator.predict(&uids).await?;
    assert_eq!(prediction.uids, uids);
    assert_eq!(prediction.values.len(), 31);
    Ok(())
}
