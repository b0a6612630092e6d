//! Recommendation engine strategies
//!
//! `RecommendationEngine` is what the handle serves requests from;
//! `EngineFactory` builds one for the current snapshot and is chosen once at
//! startup from `ENGINE_KIND`.

mod artifacts;
mod hybrid;
mod popularity;

pub use artifacts::EpochArtifacts;
pub use hybrid::HybridEngine;
pub use popularity::PopularityEngine;

use crate::config::{Config, EngineKind};
use crate::error::Result;
use crate::models::{AlgorithmSelector, Recommendation, ScoredItems};
use crate::services::index::{build_interactions, Catalog};
use crate::services::snapshot::{compute_epoch_id, load_snapshot};
use artifact_cache::ArtifactCache;
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::info;

#[async_trait]
pub trait RecommendationEngine: Send + Sync {
    fn name(&self) -> &'static str;

    fn epoch_id(&self) -> &str;

    /// Up to `n` items for `user_id`, best first, without duplicates
    async fn recommend(&self, user_id: &str, n: usize, selector: AlgorithmSelector) -> Result<Vec<Recommendation>>;

    /// Most popular items of the epoch, used for the static fallback list
    fn hot_items(&self, limit: usize) -> ScoredItems;
}

/// Builds an engine for the snapshot currently on disk. `build` is CPU-bound
/// and is run on the blocking pool by the handle.
#[cfg_attr(test, mockall::automock)]
pub trait EngineFactory: Send + Sync {
    fn kind(&self) -> EngineKind;

    /// Epoch id of the snapshot a `build` would load now
    fn current_epoch(&self) -> Result<String>;

    fn build(&self) -> Result<Arc<dyn RecommendationEngine>>;
}

pub struct HybridEngineFactory {
    config: Config,
    cache: ArtifactCache,
}

impl HybridEngineFactory {
    pub fn new(config: Config, cache: ArtifactCache) -> Self {
        Self { config, cache }
    }

    /// Build the concrete engine, for callers that need more than the trait
    pub fn build_hybrid(&self) -> Result<HybridEngine> {
        let snapshot = load_snapshot(&self.config.data.snapshot_dir)?;
        let artifacts = EpochArtifacts::build(&snapshot, &self.config, &self.cache)?;
        HybridEngine::from_artifacts(Arc::new(artifacts), &self.config)
    }
}

impl EngineFactory for HybridEngineFactory {
    fn kind(&self) -> EngineKind {
        EngineKind::Hybrid
    }

    fn current_epoch(&self) -> Result<String> {
        compute_epoch_id(&self.config.data.snapshot_dir)
    }

    fn build(&self) -> Result<Arc<dyn RecommendationEngine>> {
        Ok(Arc::new(self.build_hybrid()?))
    }
}

pub struct PopularityEngineFactory {
    config: Config,
}

impl PopularityEngineFactory {
    pub fn new(config: Config) -> Self {
        Self { config }
    }
}

impl EngineFactory for PopularityEngineFactory {
    fn kind(&self) -> EngineKind {
        EngineKind::Popularity
    }

    fn current_epoch(&self) -> Result<String> {
        compute_epoch_id(&self.config.data.snapshot_dir)
    }

    fn build(&self) -> Result<Arc<dyn RecommendationEngine>> {
        let snapshot = load_snapshot(&self.config.data.snapshot_dir)?;
        let catalog = Catalog::build(&snapshot.items, &self.config.cold_start);
        let known_users: Option<HashSet<String>> = snapshot
            .users
            .as_ref()
            .map(|users| users.iter().map(|u| u.user_id.clone()).collect());
        let interactions = build_interactions(
            &snapshot.interactions,
            &catalog,
            known_users.as_ref(),
            &self.config.weighting,
        )?;

        Ok(Arc::new(PopularityEngine::new(
            snapshot.epoch_id,
            Arc::new(catalog),
            Arc::new(interactions.users),
            Arc::new(interactions.matrix),
        )))
    }
}

/// Factory for the configured engine kind
pub fn factory_for(config: &Config, cache: ArtifactCache) -> Arc<dyn EngineFactory> {
    info!(engine_kind = ?config.service.engine_kind, cache_backend = cache.backend(), "Engine strategy selected");
    match config.service.engine_kind {
        EngineKind::Hybrid => Arc::new(HybridEngineFactory::new(config.clone(), cache)),
        EngineKind::Popularity => Arc::new(PopularityEngineFactory::new(config.clone())),
    }
}
