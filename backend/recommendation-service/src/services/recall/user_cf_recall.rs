use super::{CandidateGenerator, RecallContext};
use crate::error::GeneratorError;
use crate::models::{GeneratorKind, NeighborTable, ScoredItems};
use std::sync::Arc;

/// User-based Collaborative Filtering Recall
///
/// The aggregation `score[item] = Σ sim(user, v) × w(v, item)` over the
/// user's top-K similar users is precomputed per user when the epoch is
/// built, so a request is a single lookup.
pub struct UserCfRecall {
    aggregates: Arc<NeighborTable>,
}

impl UserCfRecall {
    pub fn new(aggregates: Arc<NeighborTable>) -> Self {
        Self { aggregates }
    }
}

impl CandidateGenerator for UserCfRecall {
    fn kind(&self) -> GeneratorKind {
        GeneratorKind::UserCf
    }

    fn generate(
        &self,
        ctx: &RecallContext,
        user_id: &str,
        limit: usize,
    ) -> Result<ScoredItems, GeneratorError> {
        ctx.checkpoint()?;
        Ok(self
            .aggregates
            .get(user_id)
            .iter()
            .take(limit)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_and_unknown_user() {
        let mut table = NeighborTable::new(100);
        table.insert(
            "u1",
            vec![("i7".to_string(), 2.0), ("i8".to_string(), 1.0)],
        );
        let recall = UserCfRecall::new(Arc::new(table));
        let ctx = RecallContext::unbounded();

        let list = recall.generate(&ctx, "u1", 1).unwrap();
        assert_eq!(list, vec![("i7".to_string(), 2.0)]);
        assert!(recall.generate(&ctx, "ghost", 10).unwrap().is_empty());
    }
}
