use super::{CandidateGenerator, InteractionView, RecallContext};
use crate::error::GeneratorError;
use crate::models::{GeneratorKind, NeighborTable, ScoredItems};
use crate::utils::top_k;
use std::collections::HashMap;
use std::sync::Arc;

/// Content-based recall: sums content-neighbour similarities over the user's
/// `seed_items` heaviest interactions.
pub struct ContentRecall {
    view: Arc<InteractionView>,
    neighbors: Arc<NeighborTable>,
    seed_items: usize,
}

impl ContentRecall {
    pub fn new(view: Arc<InteractionView>, neighbors: Arc<NeighborTable>, seed_items: usize) -> Self {
        Self {
            view,
            neighbors,
            seed_items,
        }
    }
}

impl CandidateGenerator for ContentRecall {
    fn kind(&self) -> GeneratorKind {
        GeneratorKind::Content
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
        let known = self.view.known_items(user);

        let mut scores: HashMap<String, f64> = HashMap::new();
        for (seed, _) in self.view.history(user, self.seed_items) {
            ctx.checkpoint()?;
            for (neighbor, similarity) in self.neighbors.get(&seed) {
                match self.view.items.index_of(neighbor) {
                    Some(idx) if !known.contains(&idx) => {
                        *scores.entry(neighbor.clone()).or_insert(0.0) += similarity;
                    }
                    _ => {}
                }
            }
        }

        Ok(top_k(scores.into_iter().collect(), limit))
    }
}
