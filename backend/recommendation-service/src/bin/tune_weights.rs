//! Offline fusion weight tuning.
//!
//! Holds out part of each user's interactions, builds a training epoch on the
//! rest and grid-searches the Content/Latent weights for NDCG@k. Prints the
//! report as JSON on stdout.
//!
//! Environment: the service variables plus `TUNE_K` (10), `TUNE_HOLDOUT` (0.2),
//! `TUNE_STEP` (0.05), `TUNE_REFINE_ROUNDS` (2) and `TUNE_SEED` (42).

use anyhow::{bail, Context};
use artifact_cache::ArtifactCache;
use recommendation_service::services::engine::EpochArtifacts;
use recommendation_service::services::snapshot::{load_snapshot, Snapshot};
use recommendation_service::services::tuning::{holdout_split, WeightTuner};
use recommendation_service::{Config, HybridEngine};
use std::str::FromStr;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn env_or<T: FromStr>(key: &str, default: T) -> anyhow::Result<T> {
    match std::env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| anyhow::anyhow!("invalid value for {}: {}", key, raw)),
        Err(_) => Ok(default),
    }
}

fn main() -> anyhow::Result<()> {
    // stdout carries the report
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .init();

    let config = Config::from_env().context("Failed to load config")?;
    let k: usize = env_or("TUNE_K", 10)?;
    let fraction: f64 = env_or("TUNE_HOLDOUT", 0.2)?;
    let step: f64 = env_or("TUNE_STEP", 0.05)?;
    let refine_rounds: usize = env_or("TUNE_REFINE_ROUNDS", 2)?;
    let seed: u64 = env_or("TUNE_SEED", 42)?;

    if k == 0 {
        bail!("TUNE_K must be positive");
    }
    if !(0.0..1.0).contains(&fraction) || fraction == 0.0 {
        bail!("TUNE_HOLDOUT must be in (0, 1)");
    }

    let snapshot = load_snapshot(&config.data.snapshot_dir).context("Failed to load snapshot")?;
    let split = holdout_split(&snapshot.interactions, fraction, seed);
    info!(
        epoch_id = %snapshot.epoch_id,
        train_rows = split.train.len(),
        holdout_users = split.holdout.len(),
        "Holdout split ready"
    );

    let training = Snapshot {
        epoch_id: format!("{}-train", snapshot.epoch_id),
        items: snapshot.items,
        users: snapshot.users,
        interactions: split.train,
    };
    let artifacts = EpochArtifacts::build(&training, &config, &ArtifactCache::in_memory())
        .context("Failed to build training epoch")?;
    let engine = HybridEngine::from_artifacts(Arc::new(artifacts), &config)?;

    let tuner = WeightTuner::new(&engine, &split.holdout, k);
    if tuner.validation_users() == 0 {
        bail!("no validation users left after the holdout split");
    }

    let report = tuner.tune(step, refine_rounds)?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
