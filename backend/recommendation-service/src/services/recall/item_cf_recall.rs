use super::{CandidateGenerator, InteractionView, RecallContext};
use crate::error::GeneratorError;
use crate::models::{GeneratorKind, NeighborTable, ScoredItems};
use crate::utils::top_k;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Item-based Collaborative Filtering Recall
///
/// Algorithm:
/// 1. Take the user's heaviest interacted items as seeds
/// 2. Walk each seed's row in the item co-occurrence table
/// 3. Accumulate `similarity × seed weight` per neighbour, skipping known items
///
/// The co-occurrence table is built once per epoch (see `neighbors`).
pub struct ItemCfRecall {
    view: Arc<InteractionView>,
    neighbors: Arc<NeighborTable>,
    max_seed_items: usize,
}

impl ItemCfRecall {
    pub fn new(view: Arc<InteractionView>, neighbors: Arc<NeighborTable>, max_seed_items: usize) -> Self {
        Self {
            view,
            neighbors,
            max_seed_items,
        }
    }
}

impl CandidateGenerator for ItemCfRecall {
    fn kind(&self) -> GeneratorKind {
        GeneratorKind::ItemCf
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
        let seeds = self.view.history(user, self.max_seed_items);
        let mut scores: HashMap<String, f64> = HashMap::new();

        for (seed, seed_weight) in &seeds {
            ctx.checkpoint()?;
            for (neighbor, similarity) in self.neighbors.get(seed) {
                let already_known = self
                    .view
                    .items
                    .index_of(neighbor)
                    .map(|idx| known.contains(&idx))
                    .unwrap_or(true);
                if already_known {
                    continue;
                }
                *scores.entry(neighbor.clone()).or_insert(0.0) += similarity * seed_weight;
            }
        }

        debug!(
            user_id = %user_id,
            seeds = seeds.len(),
            candidates = scores.len(),
            "Item-CF recall"
        );

        Ok(top_k(scores.into_iter().collect(), limit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::recall::fixtures::view;

    #[test]
    fn test_walks_neighbors_and_skips_known() {
        let view = view(
            &[("u1", "i1"), ("u1", "i2"), ("u2", "i3")],
            &["i1", "i2", "i3", "i4", "i5"],
        );
        let mut table = NeighborTable::new(20);
        table.insert("i1", vec![("i3".into(), 0.8), ("i4".into(), 0.5), ("i2".into(), 0.9)]);
        let recall = ItemCfRecall::new(view, Arc::new(table), 200);

        let list = recall.generate(&RecallContext::unbounded(), "u1", 10).unwrap();
        let ids: Vec<&str> = list.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["i3", "i4"]);

        assert!(recall
            .generate(&RecallContext::unbounded(), "unknown", 10)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_cancelled_context_stops_generation() {
        let view = view(&[("u1", "i1")], &["i1", "i2"]);
        let recall = ItemCfRecall::new(view, Arc::new(NeighborTable::new(5)), 200);
        let ctx = RecallContext::unbounded();
        ctx.cancel();
        assert_eq!(
            recall.generate(&ctx, "u1", 10),
            Err(GeneratorError::Cancelled)
        );
    }
}
