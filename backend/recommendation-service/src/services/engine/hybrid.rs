use super::{EpochArtifacts, RecommendationEngine};
use crate::config::Config;
use crate::error::{EngineError, Result};
use crate::models::{AlgorithmSelector, GeneratorKind, Recommendation, ScoredItems};
use crate::services::cold_start::ColdStartHandler;
use crate::services::diversity::{ContentSimilarity, DiversityLayer};
use crate::services::fusion::{fuse, pad_with_hot_items, FusionConfig, FusionWeights};
use crate::services::recall::{
    CandidateGenerator, ContentRecall, InteractionView, ItemCfRecall, LatentRecall, RecallLayer, UserCfRecall,
};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Full hybrid engine over one epoch's artifacts.
///
/// Request flow:
/// 1. Recall: fan out to every generator under the request deadline
/// 2. Fusion: normalize, blend, penalize popularity, pad weak pools
/// 3. Diversity: MMR rerank down to `n`
///
/// Users below the interaction threshold go straight to cold start.
pub struct HybridEngine {
    artifacts: Arc<EpochArtifacts>,
    view: Arc<InteractionView>,
    recall: RecallLayer,
    fusion: FusionConfig,
    diversity: DiversityLayer,
    similarity: ContentSimilarity,
    cold_start: ColdStartHandler,
    generator_limit: usize,
    pool_multiplier: usize,
    min_interactions: usize,
}

impl HybridEngine {
    pub fn from_artifacts(artifacts: Arc<EpochArtifacts>, config: &Config) -> Result<Self> {
        let view = artifacts.view();

        let mut generators: Vec<Arc<dyn CandidateGenerator>> = vec![
            Arc::new(ItemCfRecall::new(
                Arc::clone(&view),
                Arc::clone(&artifacts.item_neighbors),
                config.recall.max_items_per_user,
            )),
            Arc::new(UserCfRecall::new(Arc::clone(&artifacts.user_cf))),
            Arc::new(ContentRecall::new(
                Arc::clone(&view),
                Arc::clone(&artifacts.content_neighbors),
                config.recall.content_seed_items,
            )),
        ];
        if let Some(factors) = &artifacts.factors {
            generators.push(Arc::new(LatentRecall::new(
                Arc::clone(&view),
                Arc::clone(factors),
                artifacts.ann.clone(),
            )));
        }

        let recall = RecallLayer::new(generators, config.service.request_timeout());
        info!(
            epoch_id = %artifacts.epoch_id,
            generators = ?recall.kinds(),
            "Hybrid engine ready"
        );

        Ok(Self {
            view,
            recall,
            fusion: FusionConfig::from_settings(&config.fusion)?,
            diversity: DiversityLayer::new(config.fusion.mmr_lambda),
            similarity: ContentSimilarity::new(
                Arc::clone(&artifacts.content_neighbors),
                Arc::clone(&artifacts.catalog),
                config.fusion.same_category_similarity,
            ),
            cold_start: ColdStartHandler::new(Arc::clone(&artifacts.catalog), config.cold_start.hit_ratio),
            generator_limit: config.recall.generator_limit,
            pool_multiplier: config.fusion.mmr_pool_multiplier.max(1),
            min_interactions: config.cold_start.min_interactions,
            artifacts,
        })
    }

    pub fn artifacts(&self) -> &Arc<EpochArtifacts> {
        &self.artifacts
    }

    pub fn fusion_weights(&self) -> FusionWeights {
        self.fusion.weights
    }

    /// Ids of items the user already interacted with
    pub fn known_item_ids(&self, user_id: &str) -> HashSet<String> {
        self.view
            .user_index(user_id)
            .map(|u| {
                self.view
                    .known_items(u)
                    .into_iter()
                    .filter_map(|idx| self.view.items.id_of(idx).map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Sequential recall without a deadline, for offline evaluation
    pub fn recall_offline(&self, user_id: &str) -> Vec<(GeneratorKind, ScoredItems)> {
        self.recall.recall_blocking(user_id, self.generator_limit)
    }

    /// Fuse, pad and rerank `contributions` with `weights`. Shared by the
    /// request path and the weight tuner. Returns `n` items whenever the
    /// catalog holds that many the user has not seen.
    pub fn rank_contributions(
        &self,
        contributions: &[(GeneratorKind, ScoredItems)],
        weights: FusionWeights,
        exclude: &HashSet<String>,
        n: usize,
    ) -> ScoredItems {
        let config = FusionConfig {
            weights,
            ..self.fusion.clone()
        };
        let catalog = &self.artifacts.catalog;
        let pool_target = n.saturating_mul(self.pool_multiplier);

        let mut pool = fuse(contributions, &config, |id| catalog.normalized_popularity_of(id));
        pool.retain(|(id, _)| !exclude.contains(id));
        let hot = catalog.hot_items(pool_target + pool.len() + exclude.len());
        pad_with_hot_items(&mut pool, &hot, config.score_floor, n, pool_target, exclude);
        pool.truncate(pool_target);

        self.diversity.rerank(&pool, n, &self.similarity)
    }

    fn lookup_user(&self, user_id: &str) -> Result<u32> {
        self.view
            .user_index(user_id)
            .ok_or_else(|| EngineError::UnknownEntity(user_id.to_string()))
    }

    fn cold_start_for(&self, user_id: &str, n: usize) -> Result<Vec<Recommendation>> {
        let profile = self.artifacts.profile(user_id);
        let exclude = self.known_item_ids(user_id);
        let profile = profile.has_preferences().then_some(&profile);
        let recommendations = self
            .cold_start
            .recommend(profile, n, &exclude, &mut rand::thread_rng());

        if recommendations.is_empty() {
            return Err(EngineError::EmptyCandidatePool(user_id.to_string()));
        }
        Ok(recommendations)
    }

    async fn recommend_single(&self, kind: GeneratorKind, user_id: &str, n: usize) -> Result<Vec<Recommendation>> {
        let list = match self.recall.recall_single(kind, user_id, n).await {
            Ok(list) => list,
            Err(e) => {
                warn!(user_id = %user_id, generator = %kind, error = %e, "Forced generator failed");
                Vec::new()
            }
        };

        if list.is_empty() {
            debug!(user_id = %user_id, generator = %kind, "Forced generator had no opinion, using cold start");
            return self.cold_start_for(user_id, n);
        }

        Ok(list
            .into_iter()
            .take(n)
            .map(|(item_id, score)| Recommendation {
                item_id,
                score,
                is_cold_start: false,
            })
            .collect())
    }

    async fn recommend_hybrid(&self, user_id: &str, n: usize) -> Result<Vec<Recommendation>> {
        let known = match self.lookup_user(user_id) {
            Ok(user) => self.view.matrix.row_len(user),
            Err(e) => {
                debug!(user_id = %user_id, error = %e, "No interaction history, using cold start");
                return self.cold_start_for(user_id, n);
            }
        };
        if known < self.min_interactions {
            debug!(user_id = %user_id, known, "Below interaction threshold, using cold start");
            return self.cold_start_for(user_id, n);
        }

        let outcome = self.recall.recall_candidates(user_id, self.generator_limit).await;
        let exclude = self.known_item_ids(user_id);
        let ranked = self.rank_contributions(&outcome.contributions, self.fusion.weights, &exclude, n);

        if ranked.is_empty() {
            return self.cold_start_for(user_id, n);
        }

        Ok(ranked
            .into_iter()
            .map(|(item_id, score)| Recommendation {
                item_id,
                score,
                is_cold_start: false,
            })
            .collect())
    }
}

#[async_trait]
impl RecommendationEngine for HybridEngine {
    fn name(&self) -> &'static str {
        "hybrid"
    }

    fn epoch_id(&self) -> &str {
        &self.artifacts.epoch_id
    }

    async fn recommend(&self, user_id: &str, n: usize, selector: AlgorithmSelector) -> Result<Vec<Recommendation>> {
        if n == 0 {
            return Ok(Vec::new());
        }
        match selector.generator() {
            Some(kind) => self.recommend_single(kind, user_id, n).await,
            None => self.recommend_hybrid(user_id, n).await,
        }
    }

    fn hot_items(&self, limit: usize) -> ScoredItems {
        self.artifacts.catalog.hot_items(limit)
    }
}
