use super::{CandidateGenerator, InteractionView, RecallContext};
use crate::error::GeneratorError;
use crate::models::{GeneratorKind, ScoredItems};
use crate::services::latent::{LatentFactors, LshIndex};
use crate::utils::top_k;
use std::sync::Arc;

const CHECKPOINT_EVERY: usize = 4096;

/// Latent-factor recall.
///
/// Exact path: `user . item` for every item. With an LSH index the user vector
/// is normalized and matched by cosine against the indexed item factors.
/// Known items are excluded either way; non-positive affinities are dropped.
pub struct LatentRecall {
    view: Arc<InteractionView>,
    factors: Arc<LatentFactors>,
    ann: Option<Arc<LshIndex>>,
}

impl LatentRecall {
    pub fn new(view: Arc<InteractionView>, factors: Arc<LatentFactors>, ann: Option<Arc<LshIndex>>) -> Self {
        Self { view, factors, ann }
    }
}

impl CandidateGenerator for LatentRecall {
    fn kind(&self) -> GeneratorKind {
        GeneratorKind::Latent
    }

    fn generate(
        &self,
        ctx: &RecallContext,
        user_id: &str,
        limit: usize,
    ) -> Result<ScoredItems, GeneratorError> {
        let Some(user) = self.view.user_index(user_id) else {
            return Ok(Vec::new());
        };
        let Some(user_vector) = self.factors.user_vector(user) else {
            return Ok(Vec::new());
        };
        let known = self.view.known_items(user);

        if let Some(ann) = &self.ann {
            ctx.checkpoint()?;
            return Ok(ann
                .query(user_vector, limit, &known)
                .into_iter()
                .filter(|(_, score)| *score > 0.0)
                .filter_map(|(item, score)| {
                    self.view.items.id_of(item).map(|id| (id.to_string(), score))
                })
                .collect());
        }

        let Some(scores) = self.factors.score_all_items(user) else {
            return Ok(Vec::new());
        };
        let mut candidates = Vec::new();
        for (item, score) in scores.iter().enumerate() {
            if item % CHECKPOINT_EVERY == 0 {
                ctx.checkpoint()?;
            }
            if *score <= 0.0 || !score.is_finite() || known.contains(&(item as u32)) {
                continue;
            }
            if let Some(id) = self.view.items.id_of(item as u32) {
                candidates.push((id.to_string(), *score));
            }
        }

        Ok(top_k(candidates, limit))
    }
}
