//! Simulator entry point
//!
//! Generates a synthetic vertically partitioned dataset, trains across the
//! parties and scores the held-out samples.
//!
//! Usage: `fedgb-sim [config.json]`

use fedgb_crypto::PaillierTool;
use fedgb_model::metrics::calculate_metrics;
use fedgb_sim::{generate, LocalCoordinator, SimConfig};
use std::collections::HashMap;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fedgb_sim=info,fedgb_model=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => SimConfig::from_json(&std::fs::read_to_string(path)?)?,
        None => {
            let mut config = SimConfig {
                holdout_every: 5,
                ..SimConfig::default()
            };
            config.training.parameter.bit_length = 512;
            config.training.parameter.max_depth = 3;
            config
        }
    };

    let dataset = generate(&config.dataset);
    tracing::info!(
        samples = dataset.uids.len(),
        parties = dataset.parties.len(),
        sharded = config.sharded,
        objective = %config.training.parameter.objective,
        "Generated dataset"
    );

    let test_index = config.test_index(dataset.uids.len());
    let metrics = config.training.parameter.eval_metric.clone();
    let labels: HashMap<&str, f64> = dataset
        .uids
        .iter()
        .map(String::as_str)
        .zip(dataset.labels.iter().copied())
        .collect();

    let coordinator = LocalCoordinator::new(PaillierTool::default(), config, dataset.parties.clone())?;
    let report = coordinator.train(&dataset.uids, &test_index).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);

    if !report.test_uids.is_empty() {
        let prediction = coordinator.predict(&report.test_uids).await?;
        let truth: Vec<f64> = prediction
            .uids
            .iter()
            .map(|uid| labels.get(uid.as_str()).copied().unwrap_or(f64::NAN))
            .collect();
        let held_out = calculate_metrics(&metrics, &prediction.scores, &truth);
        for (metric, value) in held_out {
            tracing::info!(metric = ?metric, value, "Held-out metric");
        }
    }

    let model = coordinator.snapshot(coordinator.active_party())?.to_text()?;
    tracing::info!(bytes = model.len(), "Serialized active party model");
    Ok(())
}
