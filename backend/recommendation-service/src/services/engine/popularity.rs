use super::RecommendationEngine;
use crate::error::{EngineError, Result};
use crate::models::{AlgorithmSelector, Recommendation, ScoredItems};
use crate::services::index::{Catalog, EntityIndex, InteractionMatrix};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;

/// Non-personalized baseline: most popular items the user has not seen.
/// The selector is ignored.
pub struct PopularityEngine {
    epoch_id: String,
    catalog: Arc<Catalog>,
    users: Arc<EntityIndex>,
    matrix: Arc<InteractionMatrix>,
}

impl PopularityEngine {
    pub fn new(
        epoch_id: impl Into<String>,
        catalog: Arc<Catalog>,
        users: Arc<EntityIndex>,
        matrix: Arc<InteractionMatrix>,
    ) -> Self {
        Self {
            epoch_id: epoch_id.into(),
            catalog,
            users,
            matrix,
        }
    }
}

#[async_trait]
impl RecommendationEngine for PopularityEngine {
    fn name(&self) -> &'static str {
        "popularity"
    }

    fn epoch_id(&self) -> &str {
        &self.epoch_id
    }

    async fn recommend(&self, user_id: &str, n: usize, _selector: AlgorithmSelector) -> Result<Vec<Recommendation>> {
        if n == 0 {
            return Ok(Vec::new());
        }

        let user = self.users.index_of(user_id);
        let known: HashSet<u32> = user
            .map(|u| self.matrix.row(u).0.iter().copied().collect())
            .unwrap_or_default();

        let recommendations: Vec<Recommendation> = self
            .catalog
            .hot_items(n + known.len())
            .into_iter()
            .filter(|(id, _)| {
                self.catalog
                    .items
                    .index_of(id)
                    .map(|idx| !known.contains(&idx))
                    .unwrap_or(false)
            })
            .take(n)
            .map(|(item_id, score)| Recommendation {
                item_id,
                score,
                is_cold_start: user.is_none(),
            })
            .collect();

        if recommendations.is_empty() {
            return Err(EngineError::EmptyCandidatePool(user_id.to_string()));
        }
        Ok(recommendations)
    }

    fn hot_items(&self, limit: usize) -> ScoredItems {
        self.catalog.hot_items(limit)
    }
}
