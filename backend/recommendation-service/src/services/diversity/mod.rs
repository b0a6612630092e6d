use crate::models::{NeighborTable, ScoredItems};
use crate::services::index::Catalog;
use crate::utils::normalize_score;
use std::cmp::Ordering;
use std::sync::Arc;

/// Pairwise item similarity used by the reranker
pub trait ItemSimilarity: Send + Sync {
    fn similarity(&self, a: &str, b: &str) -> f64;
}

/// Content-neighbour similarity with a same-category fallback for pairs the
/// neighbour table does not cover
pub struct ContentSimilarity {
    neighbors: Arc<NeighborTable>,
    catalog: Arc<Catalog>,
    same_category: f64,
}

impl ContentSimilarity {
    pub fn new(neighbors: Arc<NeighborTable>, catalog: Arc<Catalog>, same_category: f64) -> Self {
        Self {
            neighbors,
            catalog,
            same_category,
        }
    }
}

impl ItemSimilarity for ContentSimilarity {
    fn similarity(&self, a: &str, b: &str) -> f64 {
        if a == b {
            return 1.0;
        }
        if let Some(score) = self
            .neighbors
            .score(a, b)
            .or_else(|| self.neighbors.score(b, a))
        {
            return score;
        }
        match (self.catalog.category_of(a), self.catalog.category_of(b)) {
            (Some(ca), Some(cb)) if !ca.is_empty() && ca == cb => self.same_category,
            _ => 0.0,
        }
    }
}

/// Diversity Layer: MMR (Maximal Marginal Relevance) reranking
///
/// `mmr(i) = lambda * rel(i) - (1 - lambda) * max_{s in selected} sim(i, s)`
///
/// lambda = 1.0 ranks purely by relevance, lambda = 0.0 purely by novelty.
/// Relevance is min-max normalized over the candidate pool. Ties go to the
/// higher relevance, then the smaller item id, so output is deterministic.
pub struct DiversityLayer {
    lambda: f64,
}

impl DiversityLayer {
    pub fn new(lambda: f64) -> Self {
        Self {
            lambda: lambda.clamp(0.0, 1.0),
        }
    }

    /// Select up to `top_k` items from `pool`. Output scores are the fused
    /// scores the items came in with.
    pub fn rerank(&self, pool: &[(String, f64)], top_k: usize, similarity: &dyn ItemSimilarity) -> ScoredItems {
        if pool.is_empty() || top_k == 0 {
            return Vec::new();
        }

        let min = pool.iter().map(|(_, s)| *s).fold(f64::INFINITY, f64::min);
        let max = pool.iter().map(|(_, s)| *s).fold(f64::NEG_INFINITY, f64::max);

        let mut remaining: Vec<Candidate> = pool
            .iter()
            .map(|(id, score)| Candidate {
                id: id.clone(),
                score: *score,
                relevance: normalize_score(*score, min, max),
                max_similarity: 0.0,
            })
            .collect();
        let mut selected: ScoredItems = Vec::with_capacity(top_k.min(pool.len()));

        while selected.len() < top_k && !remaining.is_empty() {
            let mut best = 0;
            for i in 1..remaining.len() {
                if self.compare(&remaining[i], &remaining[best]) == Ordering::Greater {
                    best = i;
                }
            }

            let chosen = remaining.swap_remove(best);
            // Incremental max-similarity against the selected set
            for candidate in remaining.iter_mut() {
                let sim = similarity.similarity(&candidate.id, &chosen.id);
                if sim > candidate.max_similarity {
                    candidate.max_similarity = sim;
                }
            }
            selected.push((chosen.id, chosen.score));
        }

        selected
    }

    fn mmr(&self, candidate: &Candidate) -> f64 {
        self.lambda * candidate.relevance - (1.0 - self.lambda) * candidate.max_similarity
    }

    fn compare(&self, a: &Candidate, b: &Candidate) -> Ordering {
        self.mmr(a)
            .partial_cmp(&self.mmr(b))
            .unwrap_or(Ordering::Equal)
            .then_with(|| {
                a.relevance
                    .partial_cmp(&b.relevance)
                    .unwrap_or(Ordering::Equal)
            })
            .then_with(|| b.id.cmp(&a.id))
    }
}

struct Candidate {
    id: String,
    score: f64,
    relevance: f64,
    max_similarity: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ColdStartConfig;
    use crate::models::ItemRecord;

    struct Pairs(Vec<(&'static str, &'static str, f64)>);

    impl ItemSimilarity for Pairs {
        fn similarity(&self, a: &str, b: &str) -> f64 {
            self.0
                .iter()
                .find(|(x, y, _)| (*x == a && *y == b) || (*x == b && *y == a))
                .map(|(_, _, s)| *s)
                .unwrap_or(0.0)
        }
    }

    fn pool(items: &[(&str, f64)]) -> ScoredItems {
        items.iter().map(|(id, s)| (id.to_string(), *s)).collect()
    }

    #[test]
    fn test_lambda_one_is_relevance_order() {
        let layer = DiversityLayer::new(1.0);
        let sims = Pairs(vec![("a", "b", 1.0)]);
        let out = layer.rerank(&pool(&[("a", 0.9), ("b", 0.8), ("c", 0.1)]), 3, &sims);
        let ids: Vec<&str> = out.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_near_duplicate_is_pushed_down() {
        let layer = DiversityLayer::new(0.5);
        let sims = Pairs(vec![("a", "b", 0.95)]);
        let out = layer.rerank(&pool(&[("a", 1.0), ("b", 0.9), ("c", 0.6)]), 2, &sims);
        let ids: Vec<&str> = out.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c"]);
        // Scores are carried through unchanged
        assert_eq!(out[1].1, 0.6);
    }

    #[test]
    fn test_ties_break_by_id() {
        let layer = DiversityLayer::new(0.7);
        let sims = Pairs(vec![]);
        let out = layer.rerank(&pool(&[("z", 0.5), ("m", 0.5), ("a", 0.5)]), 3, &sims);
        let ids: Vec<&str> = out.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["a", "m", "z"]);
    }

    #[test]
    fn test_small_pool_and_empty() {
        let layer = DiversityLayer::new(0.7);
        let sims = Pairs(vec![]);
        assert_eq!(layer.rerank(&pool(&[("a", 1.0)]), 5, &sims).len(), 1);
        assert!(layer.rerank(&[], 5, &sims).is_empty());
    }

    #[test]
    fn test_content_similarity_falls_back_to_category() {
        let records: Vec<ItemRecord> = [("a", "rock"), ("b", "rock"), ("c", "jazz"), ("d", "jazz")]
            .iter()
            .map(|(id, cat)| ItemRecord {
                item_id: id.to_string(),
                category: cat.to_string(),
                popularity: 1.0,
                features: vec![],
                tier: None,
            })
            .collect();
        let catalog = Arc::new(Catalog::build(&records, &ColdStartConfig::default()));
        let mut table = NeighborTable::new(5);
        table.insert("c", vec![("d".to_string(), 0.9)]);

        let sim = ContentSimilarity::new(Arc::new(table), catalog, 0.5);
        assert_eq!(sim.similarity("c", "d"), 0.9);
        assert_eq!(sim.similarity("d", "c"), 0.9);
        assert_eq!(sim.similarity("a", "b"), 0.5);
        assert_eq!(sim.similarity("a", "c"), 0.0);
    }
}
