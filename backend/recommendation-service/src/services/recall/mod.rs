mod content_recall;
mod item_cf_recall;
mod latent_recall;
mod user_cf_recall;

use crate::error::{EngineError, GeneratorError};
use crate::models::{GeneratorKind, ItemId, ScoredItems};
use crate::services::index::{EntityIndex, InteractionMatrix};
use resilience::with_deadline;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub use content_recall::ContentRecall;
pub use item_cf_recall::ItemCfRecall;
pub use latent_recall::LatentRecall;
pub use user_cf_recall::UserCfRecall;

/// Per-request cancellation state shared by every generator of one fan-out.
///
/// Generators are CPU-bound and run on the blocking pool, so they cannot be
/// aborted from outside; they call `checkpoint()` between units of work.
#[derive(Debug, Clone, Default)]
pub struct RecallContext {
    deadline: Option<Instant>,
    cancelled: Arc<AtomicBool>,
}

impl RecallContext {
    pub fn new(deadline: Option<Instant>) -> Self {
        Self {
            deadline,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// No deadline; used by offline jobs
    pub fn unbounded() -> Self {
        Self::new(None)
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn checkpoint(&self) -> Result<(), GeneratorError> {
        if self.cancelled.load(Ordering::Relaxed) {
            return Err(GeneratorError::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Err(GeneratorError::TimedOut),
            _ => Ok(()),
        }
    }
}

/// One independent recall path. Implementations must be free of side effects
/// and safe to call concurrently; an unknown user or a user without relevant
/// history yields `Ok(vec![])`.
#[cfg_attr(test, mockall::automock)]
pub trait CandidateGenerator: Send + Sync {
    fn kind(&self) -> GeneratorKind;

    fn generate(
        &self,
        ctx: &RecallContext,
        user_id: &str,
        limit: usize,
    ) -> Result<ScoredItems, GeneratorError>;
}

/// Read-only view of the epoch's interactions shared by the generators
#[derive(Debug, Clone)]
pub struct InteractionView {
    pub users: Arc<EntityIndex>,
    pub items: Arc<EntityIndex>,
    pub matrix: Arc<InteractionMatrix>,
}

impl InteractionView {
    pub fn user_index(&self, user_id: &str) -> Option<u32> {
        self.users.index_of(user_id)
    }

    pub fn known_items(&self, user: u32) -> HashSet<u32> {
        self.matrix.row(user).0.iter().copied().collect()
    }

    /// The user's `limit` heaviest items as `(item_id, weight)`
    pub fn history(&self, user: u32, limit: usize) -> Vec<(ItemId, f64)> {
        self.matrix
            .top_row_items(user, limit)
            .into_iter()
            .filter_map(|(item, w)| self.items.id_of(item).map(|id| (id.to_string(), w)))
            .collect()
    }
}

#[derive(Debug, Clone, Default)]
pub struct RecallStats {
    pub counts: Vec<(GeneratorKind, usize)>,
    pub failed: Vec<GeneratorKind>,
    pub timed_out: Vec<GeneratorKind>,
}

#[derive(Debug, Clone, Default)]
pub struct RecallOutcome {
    /// Per-generator lists in generator order; failed paths contribute empty
    pub contributions: Vec<(GeneratorKind, ScoredItems)>,
    pub stats: RecallStats,
}

impl RecallOutcome {
    pub fn is_empty(&self) -> bool {
        self.contributions.iter().all(|(_, list)| list.is_empty())
    }
}

/// Recall layer: fans one request out to every generator
pub struct RecallLayer {
    generators: Vec<Arc<dyn CandidateGenerator>>,
    timeout: Duration,
}

impl RecallLayer {
    pub fn new(generators: Vec<Arc<dyn CandidateGenerator>>, timeout: Duration) -> Self {
        Self {
            generators,
            timeout,
        }
    }

    pub fn kinds(&self) -> Vec<GeneratorKind> {
        self.generators.iter().map(|g| g.kind()).collect()
    }

    fn generator(&self, kind: GeneratorKind) -> Option<&Arc<dyn CandidateGenerator>> {
        self.generators.iter().find(|g| g.kind() == kind)
    }

    /// Run every generator concurrently on the blocking pool and join before
    /// the request deadline. A generator that fails or misses the deadline
    /// contributes an empty list; the outstanding work is told to stop.
    pub async fn recall_candidates(&self, user_id: &str, limit: usize) -> RecallOutcome {
        let deadline = Instant::now() + self.timeout;
        let ctx = RecallContext::new(Some(deadline));

        let tasks = self.generators.iter().map(|generator| {
            let generator = Arc::clone(generator);
            let ctx = ctx.clone();
            let user = user_id.to_string();
            async move {
                let kind = generator.kind();
                let handle =
                    tokio::task::spawn_blocking(move || generator.generate(&ctx, &user, limit));
                let result = match with_deadline(deadline, handle).await {
                    Ok(Ok(result)) => result,
                    Ok(Err(join_err)) => Err(GeneratorError::Failed(join_err.to_string())),
                    Err(_) => Err(GeneratorError::TimedOut),
                };
                (kind, result)
            }
        });

        let results = futures::future::join_all(tasks).await;
        // Whatever is still running belongs to a request that has moved on
        ctx.cancel();

        let mut outcome = RecallOutcome::default();
        for (kind, result) in results {
            let list = match result {
                Ok(list) => list,
                Err(GeneratorError::TimedOut) | Err(GeneratorError::Cancelled) => {
                    warn!(user_id = %user_id, generator = %kind, "Generator timed out, contributing no candidates");
                    outcome.stats.timed_out.push(kind);
                    Vec::new()
                }
                Err(e) => {
                    warn!(user_id = %user_id, generator = %kind, error = %e, "Generator failed, contributing no candidates");
                    outcome.stats.failed.push(kind);
                    Vec::new()
                }
            };
            outcome.stats.counts.push((kind, list.len()));
            outcome.contributions.push((kind, list));
        }

        debug!(
            user_id = %user_id,
            counts = ?outcome.stats.counts,
            failed = outcome.stats.failed.len(),
            timed_out = outcome.stats.timed_out.len(),
            "Recall completed"
        );

        outcome
    }

    /// Run one generator under the same deadline rules. A failure surfaces as
    /// `TransientGenerator` so the caller can decide how to degrade.
    pub async fn recall_single(
        &self,
        kind: GeneratorKind,
        user_id: &str,
        limit: usize,
    ) -> crate::error::Result<ScoredItems> {
        let Some(generator) = self.generator(kind) else {
            info!(generator = %kind, "Generator disabled for this epoch");
            return Ok(Vec::new());
        };

        let deadline = Instant::now() + self.timeout;
        let ctx = RecallContext::new(Some(deadline));
        let generator = Arc::clone(generator);
        let task_ctx = ctx.clone();
        let user = user_id.to_string();
        let handle = tokio::task::spawn_blocking(move || generator.generate(&task_ctx, &user, limit));

        let result = match with_deadline(deadline, handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(GeneratorError::Failed(join_err.to_string())),
            Err(_) => Err(GeneratorError::TimedOut),
        };
        ctx.cancel();
        result.map_err(|e| EngineError::TransientGenerator {
            generator: kind.as_str(),
            reason: e.to_string(),
        })
    }

    /// Sequential, deadline-free variant for offline evaluation
    pub fn recall_blocking(&self, user_id: &str, limit: usize) -> Vec<(GeneratorKind, ScoredItems)> {
        let ctx = RecallContext::unbounded();
        self.generators
            .iter()
            .map(|generator| {
                let list = generator.generate(&ctx, user_id, limit).unwrap_or_else(|e| {
                    warn!(generator = %generator.kind(), error = %e, "Generator failed during evaluation");
                    Vec::new()
                });
                (generator.kind(), list)
            })
            .collect()
    }
}

/// Interaction views over tiny catalogs for the generator tests
#[cfg(test)]
pub(crate) mod fixtures {
    use super::InteractionView;
    use crate::config::{ColdStartConfig, WeightingConfig};
    use crate::models::{InteractionRow, ItemRecord};
    use crate::services::index::{build_interactions, Catalog};
    use std::sync::Arc;

    /// Users are indexed in order of first appearance in `pairs`, items in
    /// `items` order. Every pair carries the same weight.
    pub fn view(pairs: &[(&str, &str)], items: &[&str]) -> Arc<InteractionView> {
        let records: Vec<ItemRecord> = items
            .iter()
            .map(|id| ItemRecord {
                item_id: id.to_string(),
                category: "c".into(),
                popularity: 1.0,
                features: vec![],
                tier: None,
            })
            .collect();
        let catalog = Catalog::build(&records, &ColdStartConfig::default());
        let rows: Vec<InteractionRow> = pairs
            .iter()
            .map(|(u, i)| InteractionRow {
                user_id: u.to_string(),
                item_id: i.to_string(),
                play_count: 2,
                kinds: vec![],
            })
            .collect();
        let built = build_interactions(&rows, &catalog, None, &WeightingConfig::default()).unwrap();
        Arc::new(InteractionView {
            users: Arc::new(built.users),
            items: Arc::new(catalog.items),
            matrix: Arc::new(built.matrix),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mock(kind: GeneratorKind, items: &[(&str, f64)]) -> Arc<dyn CandidateGenerator> {
        let items: ScoredItems = items.iter().map(|(id, s)| (id.to_string(), *s)).collect();
        let mut generator = MockCandidateGenerator::new();
        generator.expect_kind().return_const(kind);
        generator
            .expect_generate()
            .returning(move |_, _, _| Ok(items.clone()));
        Arc::new(generator)
    }

    #[tokio::test]
    async fn test_failed_generator_contributes_empty() {
        let mut failing = MockCandidateGenerator::new();
        failing.expect_kind().return_const(GeneratorKind::Content);
        failing
            .expect_generate()
            .returning(|_, _, _| Err(GeneratorError::Failed("corrupt table".into())));

        let layer = RecallLayer::new(
            vec![
                mock(GeneratorKind::ItemCf, &[("i3", 0.8)]),
                Arc::new(failing),
            ],
            Duration::from_secs(1),
        );

        let outcome = layer.recall_candidates("u1", 10).await;
        assert_eq!(outcome.contributions.len(), 2);
        assert_eq!(outcome.contributions[0].1.len(), 1);
        assert!(outcome.contributions[1].1.is_empty());
        assert_eq!(outcome.stats.failed, vec![GeneratorKind::Content]);
        assert!(!outcome.is_empty());
    }

    #[tokio::test]
    async fn test_slow_generator_times_out_without_blocking_others() {
        let mut slow = MockCandidateGenerator::new();
        slow.expect_kind().return_const(GeneratorKind::Latent);
        slow.expect_generate().returning(|ctx, _, _| {
            // Cooperative loop, exits once the fan-out cancels it
            loop {
                ctx.checkpoint()?;
                std::thread::sleep(Duration::from_millis(5));
            }
        });

        let layer = RecallLayer::new(
            vec![mock(GeneratorKind::ItemCf, &[("i3", 0.8)]), Arc::new(slow)],
            Duration::from_millis(50),
        );

        let started = Instant::now();
        let outcome = layer.recall_candidates("u1", 10).await;
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(outcome.stats.timed_out, vec![GeneratorKind::Latent]);
        assert_eq!(outcome.contributions[0].1[0].0, "i3");
    }

    #[tokio::test]
    async fn test_missing_generator_is_empty() {
        let layer = RecallLayer::new(vec![mock(GeneratorKind::ItemCf, &[])], Duration::from_secs(1));
        let result = layer
            .recall_single(GeneratorKind::Latent, "u1", 5)
            .await
            .unwrap();
        assert!(result.is_empty());
    }

    #[tokio::test]
    async fn test_forced_generator_failure_is_transient() {
        let mut failing = MockCandidateGenerator::new();
        failing.expect_kind().return_const(GeneratorKind::Content);
        failing
            .expect_generate()
            .returning(|_, _, _| Err(GeneratorError::Failed("corrupt table".into())));
        let layer = RecallLayer::new(vec![Arc::new(failing)], Duration::from_secs(1));

        let err = layer
            .recall_single(GeneratorKind::Content, "u1", 5)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::TransientGenerator { generator: "content", .. }
        ));
        assert!(err.is_retryable());
        assert!(err.to_string().contains("corrupt table"));
    }

    #[test]
    fn test_checkpoint_after_cancel() {
        let ctx = RecallContext::unbounded();
        assert!(ctx.checkpoint().is_ok());
        ctx.cancel();
        assert_eq!(ctx.checkpoint(), Err(GeneratorError::Cancelled));

        let expired = RecallContext::new(Some(Instant::now()));
        assert_eq!(expired.checkpoint(), Err(GeneratorError::TimedOut));
    }
}
