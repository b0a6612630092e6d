use anyhow::Context;
use artifact_cache::{ArtifactCache, FsArtifactStore, RedisArtifactStore};
use recommendation_service::config::CacheBackend;
use recommendation_service::jobs::{spawn_epoch_refresh, EpochRefreshConfig};
use recommendation_service::models::AlgorithmSelector;
use recommendation_service::{factory_for, Config, EngineHandle, EngineState};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const FALLBACK_HOT_LIST_SIZE: usize = 200;

fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = Config::from_env().context("Failed to load config")?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.service.worker_threads)
        .thread_name("recommendation-worker")
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    runtime.block_on(run(config))
}

fn init_tracing() {
    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(EnvFilter::from_default_env())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(EnvFilter::from_default_env())
            .init();
    }
}

fn artifact_cache(config: &Config) -> anyhow::Result<ArtifactCache> {
    let cache = match config.cache.backend {
        CacheBackend::Fs => ArtifactCache::new(Arc::new(
            FsArtifactStore::new(&config.cache.dir).context("Failed to open artifact cache directory")?,
        )),
        CacheBackend::Redis => ArtifactCache::new(Arc::new(
            RedisArtifactStore::new(&config.cache.redis_url).context("Failed to create Redis client")?,
        )),
        CacheBackend::Memory => ArtifactCache::in_memory(),
    };
    Ok(cache)
}

async fn run(config: Config) -> anyhow::Result<()> {
    info!(
        service = %config.service.service_name,
        worker_threads = config.service.worker_threads,
        snapshot_dir = %config.data.snapshot_dir.display(),
        "Starting recommendation engine"
    );

    let cache = artifact_cache(&config)?;
    let factory = factory_for(&config, cache);
    let handle = EngineHandle::new(factory, &config);

    match handle.initialize().await {
        EngineState::Initialized => {
            match handle.write_fallback_hot_list(&config.data.fallback_hot_list_path, FALLBACK_HOT_LIST_SIZE) {
                Ok(count) => info!(count, "Fallback hot list refreshed"),
                Err(e) => warn!(error = %e, "Could not refresh fallback hot list"),
            }
        }
        EngineState::Degraded => warn!("Engine started in degraded mode"),
        state => error!(state = state.as_str(), "Engine is not serving"),
    }

    // One-shot query mode: recommendation-service --recommend <user_id> [n] [algorithm]
    let args: Vec<String> = std::env::args().collect();
    if args.get(1).map(String::as_str) == Some("--recommend") {
        let user_id = args.get(2).context("--recommend needs a user id")?;
        let n: usize = match args.get(3) {
            Some(raw) => raw.parse().context("n must be a positive integer")?,
            None => 10,
        };
        let selector: AlgorithmSelector = match args.get(4) {
            Some(raw) => raw.parse().map_err(anyhow::Error::msg)?,
            None => AlgorithmSelector::Hybrid,
        };

        let recommendations = handle.recommend(user_id, n, selector).await?;
        println!("{}", serde_json::to_string_pretty(&recommendations)?);
        return Ok(());
    }

    info!(health = %serde_json::to_string(&handle.health())?, "Engine health");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let refresh = spawn_epoch_refresh(
        EpochRefreshConfig {
            interval: Duration::from_secs(config.data.epoch_refresh_interval_secs),
            snapshot_dir: config.data.snapshot_dir.clone(),
        },
        handle.clone(),
        shutdown_rx,
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown signal received");

    shutdown_tx.send(true).ok();
    match refresh.await {
        Ok(stats) => info!(swaps = stats.swaps, failures = stats.failures, "Epoch refresh job finished"),
        Err(e) => error!(error = %e, "Epoch refresh job panicked"),
    }

    Ok(())
}
