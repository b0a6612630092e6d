//! Engine handle
//!
//! Owns the engine lifecycle for the process:
//!
//! ```text
//! Uninitialized ──initialize()──▶ Initializing ──ok──▶ Initialized
//!                                      │
//!                                      └─err──▶ Failed ──fallback loaded──▶ Degraded
//!
//! any state ──force_reinitialize()──▶ Initializing
//! ```
//!
//! Exactly one caller performs the `Uninitialized → Initializing` transition;
//! everyone else waits on the state channel for a terminal state. Per-request
//! calls go through a circuit breaker that is independent of this lifecycle.

use crate::config::Config;
use crate::error::{EngineError, Result};
use crate::models::{AlgorithmSelector, Recommendation};
use crate::services::engine::{EngineFactory, RecommendationEngine};
use crate::services::snapshot::{load_fallback, write_fallback, FallbackHotList};
use dashmap::DashMap;
use parking_lot::RwLock;
use resilience::{CircuitBreaker, CircuitBreakerConfig};
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex, Semaphore};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineState {
    Uninitialized,
    Initializing,
    Initialized,
    Degraded,
    Failed,
}

impl EngineState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EngineState::Initialized | EngineState::Degraded | EngineState::Failed
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EngineState::Uninitialized => "uninitialized",
            EngineState::Initializing => "initializing",
            EngineState::Initialized => "initialized",
            EngineState::Degraded => "degraded",
            EngineState::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub state: EngineState,
    pub circuit_breaker_state: &'static str,
    pub consecutive_failures: u32,
    pub cached_artifact_epoch: Option<String>,
    pub fallback_item_count: usize,
    pub engine: Option<&'static str>,
    pub memoized_users: usize,
}

struct MemoEntry {
    at: Instant,
    epoch_id: String,
    recommendations: Vec<Recommendation>,
}

type UserMemo = HashMap<(usize, AlgorithmSelector), MemoEntry>;

struct Inner {
    factory: Arc<dyn EngineFactory>,
    state_tx: watch::Sender<EngineState>,
    /// Serializes initialization, forced re-initialization and epoch swaps
    init_lock: Mutex<()>,
    engine: RwLock<Option<Arc<dyn RecommendationEngine>>>,
    fallback: RwLock<Option<Arc<FallbackHotList>>>,
    fallback_path: PathBuf,
    breaker: CircuitBreaker,
    memo: DashMap<String, UserMemo>,
    memo_ttl: Duration,
    in_flight: Semaphore,
    init_wait_timeout: Duration,
}

/// Shared handle to the process's engine. Cheap to clone.
#[derive(Clone)]
pub struct EngineHandle {
    inner: Arc<Inner>,
}

impl EngineHandle {
    pub fn new(factory: Arc<dyn EngineFactory>, config: &Config) -> Self {
        let (state_tx, _) = watch::channel(EngineState::Uninitialized);
        Self {
            inner: Arc::new(Inner {
                factory,
                state_tx,
                init_lock: Mutex::new(()),
                engine: RwLock::new(None),
                fallback: RwLock::new(None),
                fallback_path: config.data.fallback_hot_list_path.clone(),
                breaker: CircuitBreaker::new(CircuitBreakerConfig {
                    failure_threshold: config.breaker.failure_threshold,
                    cooldown: Duration::from_millis(config.breaker.cooldown_ms),
                }),
                memo: DashMap::new(),
                memo_ttl: Duration::from_secs(config.cache.user_memo_ttl_secs),
                in_flight: Semaphore::new(config.service.max_in_flight_requests.max(1)),
                init_wait_timeout: config.service.init_wait_timeout(),
            }),
        }
    }

    pub fn state(&self) -> EngineState {
        *self.inner.state_tx.borrow()
    }

    /// Subscribe to state transitions
    pub fn watch_state(&self) -> watch::Receiver<EngineState> {
        self.inner.state_tx.subscribe()
    }

    /// Bring the engine up once. Returns the terminal state reached, or
    /// `Initializing` when another caller's build outlives the wait timeout.
    pub async fn initialize(&self) -> EngineState {
        let current = self.state();
        if current.is_terminal() {
            return current;
        }

        let won = self.inner.state_tx.send_if_modified(|state| {
            if *state == EngineState::Uninitialized {
                *state = EngineState::Initializing;
                true
            } else {
                false
            }
        });

        if won {
            info!(engine_kind = ?self.inner.factory.kind(), "Engine state: Uninitialized → Initializing");
            let _guard = self.inner.init_lock.lock().await;
            return self.build_and_settle().await;
        }

        self.wait_for_terminal().await
    }

    /// Rebuild from scratch regardless of the current state
    pub async fn force_reinitialize(&self) -> EngineState {
        let _guard = self.inner.init_lock.lock().await;
        let previous = self.inner.state_tx.send_replace(EngineState::Initializing);
        info!(previous = previous.as_str(), "Engine state: forced re-initialization");
        self.build_and_settle().await
    }

    async fn wait_for_terminal(&self) -> EngineState {
        let mut rx = self.inner.state_tx.subscribe();
        let wait = rx.wait_for(|state| state.is_terminal());
        let state = match tokio::time::timeout(self.inner.init_wait_timeout, wait).await {
            Ok(Ok(state)) => *state,
            Ok(Err(_)) => self.state(),
            Err(_) => {
                warn!(
                    timeout_ms = self.inner.init_wait_timeout.as_millis() as u64,
                    "Timed out waiting for engine initialization"
                );
                self.state()
            }
        };
        state
    }

    /// Caller holds `init_lock`
    async fn build_and_settle(&self) -> EngineState {
        let started = Instant::now();
        match self.build_engine().await {
            Ok(engine) => {
                let epoch_id = engine.epoch_id().to_string();
                *self.inner.engine.write() = Some(engine);
                self.inner.memo.clear();
                self.inner.state_tx.send_replace(EngineState::Initialized);
                info!(
                    epoch_id = %epoch_id,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Engine state: Initializing → Initialized"
                );
                EngineState::Initialized
            }
            Err(e) => {
                error!(error = %e, "Engine build failed");
                *self.inner.engine.write() = None;
                self.inner.memo.clear();
                self.inner.state_tx.send_replace(EngineState::Failed);
                warn!("Engine state: Initializing → Failed");

                match load_fallback(&self.inner.fallback_path) {
                    Ok(list) if !list.is_empty() => {
                        *self.inner.fallback.write() = Some(Arc::new(list));
                        self.inner.state_tx.send_replace(EngineState::Degraded);
                        warn!("Engine state: Failed → Degraded (serving static hot list)");
                        EngineState::Degraded
                    }
                    Ok(_) => {
                        error!(path = %self.inner.fallback_path.display(), "Fallback hot list is empty, staying Failed");
                        EngineState::Failed
                    }
                    Err(e) => {
                        error!(
                            path = %self.inner.fallback_path.display(),
                            error = %e,
                            "No usable fallback hot list, staying Failed"
                        );
                        EngineState::Failed
                    }
                }
            }
        }
    }

    async fn build_engine(&self) -> Result<Arc<dyn RecommendationEngine>> {
        let factory = Arc::clone(&self.inner.factory);
        tokio::task::spawn_blocking(move || factory.build())
            .await
            .map_err(|e| EngineError::ServiceUnavailable(format!("engine build task failed: {}", e)))?
    }

    /// Build the snapshot's new epoch next to the live one and swap it in.
    /// Requests keep using the old engine until the swap. Returns the new
    /// epoch id, or `None` when nothing changed or the handle is not serving
    /// a healthy engine (recovery goes through `force_reinitialize`).
    pub async fn refresh_epoch(&self) -> Result<Option<String>> {
        let Ok(_guard) = self.inner.init_lock.try_lock() else {
            debug!("Initialization in progress, epoch refresh skipped");
            return Ok(None);
        };
        if self.state() != EngineState::Initialized {
            return Ok(None);
        }

        let current_epoch = self.current_epoch();
        let factory = Arc::clone(&self.inner.factory);
        let snapshot_epoch = tokio::task::spawn_blocking(move || factory.current_epoch())
            .await
            .map_err(|e| EngineError::ServiceUnavailable(format!("epoch lookup failed: {}", e)))??;
        if current_epoch.as_deref() == Some(snapshot_epoch.as_str()) {
            return Ok(None);
        }

        let engine = self.build_engine().await?;
        let epoch_id = engine.epoch_id().to_string();
        *self.inner.engine.write() = Some(engine);
        self.inner.memo.clear();
        info!(
            previous_epoch = ?current_epoch,
            epoch_id = %epoch_id,
            "Epoch swapped"
        );
        Ok(Some(epoch_id))
    }

    /// Persist the live engine's hot items as the static fallback and keep
    /// them in memory for degraded serving
    pub fn write_fallback_hot_list(&self, path: &Path, limit: usize) -> Result<usize> {
        let engine = self
            .engine()
            .ok_or_else(|| EngineError::ServiceUnavailable("no engine to export hot items from".to_string()))?;
        let list = FallbackHotList::from_scored(engine.hot_items(limit));
        if list.is_empty() {
            return Err(EngineError::Dataset("engine has no hot items".to_string()));
        }
        write_fallback(path, &list)?;
        let count = list.len();
        *self.inner.fallback.write() = Some(Arc::new(list));
        Ok(count)
    }

    pub async fn recommend(&self, user_id: &str, n: usize, selector: AlgorithmSelector) -> Result<Vec<Recommendation>> {
        let _permit = self
            .inner
            .in_flight
            .acquire()
            .await
            .map_err(|_| EngineError::ServiceUnavailable("request pool closed".to_string()))?;

        let state = match self.state() {
            state if state.is_terminal() => state,
            _ => self.initialize().await,
        };

        match state {
            EngineState::Initialized => match self.engine() {
                Some(engine) => self.recommend_with(engine, user_id, n, selector).await,
                None => self.serve_fallback(user_id, n),
            },
            EngineState::Degraded => self.serve_fallback(user_id, n),
            EngineState::Failed => Err(EngineError::ServiceUnavailable(
                "engine initialization failed and no fallback is available".to_string(),
            )),
            EngineState::Uninitialized | EngineState::Initializing => Err(EngineError::ServiceUnavailable(
                "engine is still initializing".to_string(),
            )),
        }
    }

    async fn recommend_with(
        &self,
        engine: Arc<dyn RecommendationEngine>,
        user_id: &str,
        n: usize,
        selector: AlgorithmSelector,
    ) -> Result<Vec<Recommendation>> {
        if let Some(hit) = self.memo_lookup(user_id, n, selector, engine.epoch_id()) {
            return Ok(hit);
        }

        let permit = self
            .inner
            .breaker
            .try_acquire()
            .ok_or_else(|| EngineError::ServiceUnavailable("circuit breaker open".to_string()))?;

        match engine.recommend(user_id, n, selector).await {
            Ok(recommendations) => {
                permit.record_success();
                self.memo_store(user_id, n, selector, engine.epoch_id(), &recommendations);
                Ok(recommendations)
            }
            Err(e) if e.is_benign() => {
                permit.record_success();
                Err(e)
            }
            Err(e) => {
                warn!(user_id = %user_id, error = %e, "Engine call failed");
                permit.record_failure();
                Err(e)
            }
        }
    }

    fn serve_fallback(&self, user_id: &str, n: usize) -> Result<Vec<Recommendation>> {
        let fallback = self.inner.fallback.read().clone();
        let Some(list) = fallback.filter(|list| !list.is_empty()) else {
            return Err(EngineError::ServiceUnavailable(
                "no engine and no fallback hot list".to_string(),
            ));
        };
        debug!(user_id = %user_id, "Serving static fallback hot list");
        Ok(list
            .items
            .iter()
            .take(n)
            .map(|item| Recommendation {
                item_id: item.item_id.clone(),
                score: item.score,
                is_cold_start: true,
            })
            .collect())
    }

    fn memo_lookup(&self, user_id: &str, n: usize, selector: AlgorithmSelector, epoch_id: &str) -> Option<Vec<Recommendation>> {
        if self.inner.memo_ttl.is_zero() {
            return None;
        }
        let entries = self.inner.memo.get(user_id)?;
        let entry = entries.get(&(n, selector))?;
        (entry.epoch_id == epoch_id && entry.at.elapsed() < self.inner.memo_ttl).then(|| entry.recommendations.clone())
    }

    fn memo_store(
        &self,
        user_id: &str,
        n: usize,
        selector: AlgorithmSelector,
        epoch_id: &str,
        recommendations: &[Recommendation],
    ) {
        if self.inner.memo_ttl.is_zero() {
            return;
        }
        self.inner.memo.entry(user_id.to_string()).or_default().insert(
            (n, selector),
            MemoEntry {
                at: Instant::now(),
                epoch_id: epoch_id.to_string(),
                recommendations: recommendations.to_vec(),
            },
        );
    }

    /// Drop the user's memoized results. Shared epoch artifacts are untouched.
    pub fn invalidate_user(&self, user_id: &str) -> bool {
        let removed = self.inner.memo.remove(user_id).is_some();
        debug!(user_id = %user_id, removed, "User memo invalidated");
        removed
    }

    pub fn health(&self) -> HealthReport {
        let engine = self.engine();
        HealthReport {
            state: self.state(),
            circuit_breaker_state: self.inner.breaker.state().as_str(),
            consecutive_failures: self.inner.breaker.consecutive_failures(),
            cached_artifact_epoch: engine.as_ref().map(|e| e.epoch_id().to_string()),
            fallback_item_count: self.inner.fallback.read().as_ref().map(|l| l.len()).unwrap_or(0),
            engine: engine.as_ref().map(|e| e.name()),
            memoized_users: self.inner.memo.len(),
        }
    }

    pub fn current_epoch(&self) -> Option<String> {
        self.engine().map(|e| e.epoch_id().to_string())
    }

    fn engine(&self) -> Option<Arc<dyn RecommendationEngine>> {
        self.inner.engine.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineKind;
    use crate::models::ScoredItems;
    use crate::services::engine::MockEngineFactory;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// Engine that counts calls and either answers with fixed items or fails
    struct StubEngine {
        epoch: String,
        calls: Arc<AtomicUsize>,
        fail: bool,
    }

    #[async_trait]
    impl RecommendationEngine for StubEngine {
        fn name(&self) -> &'static str {
            "stub"
        }

        fn epoch_id(&self) -> &str {
            &self.epoch
        }

        async fn recommend(&self, user_id: &str, n: usize, _selector: AlgorithmSelector) -> Result<Vec<Recommendation>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(EngineError::Snapshot(format!("corrupt entry for {}", user_id)));
            }
            Ok((0..n)
                .map(|i| Recommendation {
                    item_id: format!("i{}", i),
                    score: 1.0 / (i + 1) as f64,
                    is_cold_start: false,
                })
                .collect())
        }

        fn hot_items(&self, limit: usize) -> ScoredItems {
            (0..limit).map(|i| (format!("hot{}", i), 1.0 - i as f64 * 0.1)).collect()
        }
    }

    fn config(dir: &Path) -> Config {
        let mut config = Config::for_snapshot(dir);
        config.breaker.failure_threshold = 3;
        config.breaker.cooldown_ms = 50;
        config.service.init_wait_timeout_ms = 5_000;
        config
    }

    fn factory(epoch: &'static str, calls: Arc<AtomicUsize>, builds: Arc<AtomicUsize>, fail_calls: bool) -> MockEngineFactory {
        let mut factory = MockEngineFactory::new();
        factory.expect_kind().return_const(EngineKind::Hybrid);
        factory.expect_current_epoch().returning(move || Ok(epoch.to_string()));
        factory.expect_build().returning(move || {
            builds.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(30));
            Ok(Arc::new(StubEngine {
                epoch: "e1".to_string(),
                calls: Arc::clone(&calls),
                fail: fail_calls,
            }) as Arc<dyn RecommendationEngine>)
        });
        factory
    }

    fn failing_factory() -> MockEngineFactory {
        let mut factory = MockEngineFactory::new();
        factory.expect_kind().return_const(EngineKind::Hybrid);
        factory
            .expect_build()
            .returning(|| Err(EngineError::Dataset("no usable rows".to_string())));
        factory
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_initialize_builds_once() {
        let dir = TempDir::new().unwrap();
        let builds = Arc::new(AtomicUsize::new(0));
        let f = factory("e1", Arc::new(AtomicUsize::new(0)), Arc::clone(&builds), false);
        let handle = EngineHandle::new(Arc::new(f), &config(dir.path()));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let handle = handle.clone();
                tokio::spawn(async move { handle.initialize().await })
            })
            .collect();
        for task in tasks {
            assert_eq!(task.await.unwrap(), EngineState::Initialized);
        }
        assert_eq!(builds.load(Ordering::SeqCst), 1);
        assert_eq!(handle.health().cached_artifact_epoch.as_deref(), Some("e1"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_waiter_gives_up_after_init_wait_timeout() {
        let dir = TempDir::new().unwrap();
        let mut config = config(dir.path());
        config.service.init_wait_timeout_ms = 1;
        let f = factory("e1", Arc::new(AtomicUsize::new(0)), Arc::new(AtomicUsize::new(0)), false);
        let handle = EngineHandle::new(Arc::new(f), &config);

        let winner = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.initialize().await })
        };
        let mut rx = handle.watch_state();
        rx.wait_for(|state| *state != EngineState::Uninitialized).await.unwrap();

        assert_eq!(handle.initialize().await, EngineState::Initializing);
        assert_eq!(winner.await.unwrap(), EngineState::Initialized);
        assert_eq!(handle.initialize().await, EngineState::Initialized);
    }

    #[tokio::test]
    async fn test_failed_build_degrades_to_fallback() {
        let dir = TempDir::new().unwrap();
        let config = config(dir.path());
        let list = FallbackHotList::from_scored(vec![("h1".into(), 1.0), ("h2".into(), 0.9), ("h3".into(), 0.8)]);
        write_fallback(&config.data.fallback_hot_list_path, &list).unwrap();

        let handle = EngineHandle::new(Arc::new(failing_factory()), &config);
        let recs = handle.recommend("u1", 2, AlgorithmSelector::Hybrid).await.unwrap();

        assert_eq!(handle.state(), EngineState::Degraded);
        assert_eq!(recs.len(), 2);
        assert!(recs.iter().all(|r| r.is_cold_start));
        let health = handle.health();
        assert_eq!(health.fallback_item_count, 3);
        assert!(health.cached_artifact_epoch.is_none());
    }

    #[tokio::test]
    async fn test_failed_build_without_fallback_is_unavailable() {
        let dir = TempDir::new().unwrap();
        let handle = EngineHandle::new(Arc::new(failing_factory()), &config(dir.path()));

        let err = handle.recommend("u1", 5, AlgorithmSelector::Hybrid).await.unwrap_err();
        assert!(matches!(err, EngineError::ServiceUnavailable(_)));
        assert!(err.is_retryable());
        assert_eq!(handle.state(), EngineState::Failed);
    }

    #[tokio::test]
    async fn test_breaker_opens_after_threshold_then_admits_one_trial() {
        let dir = TempDir::new().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let f = factory("e1", Arc::clone(&calls), Arc::new(AtomicUsize::new(0)), true);
        let handle = EngineHandle::new(Arc::new(f), &config(dir.path()));
        assert_eq!(handle.initialize().await, EngineState::Initialized);

        for _ in 0..3 {
            let err = handle.recommend("u1", 5, AlgorithmSelector::Hybrid).await.unwrap_err();
            assert!(matches!(err, EngineError::Snapshot(_)));
        }
        assert_eq!(handle.health().circuit_breaker_state, "open");

        let err = handle.recommend("u1", 5, AlgorithmSelector::Hybrid).await.unwrap_err();
        assert!(matches!(err, EngineError::ServiceUnavailable(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(handle.recommend("u1", 5, AlgorithmSelector::Hybrid).await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(handle.health().circuit_breaker_state, "open");
    }

    #[tokio::test]
    async fn test_memo_and_invalidate_user() {
        let dir = TempDir::new().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let f = factory("e1", Arc::clone(&calls), Arc::new(AtomicUsize::new(0)), false);
        let handle = EngineHandle::new(Arc::new(f), &config(dir.path()));

        let first = handle.recommend("u1", 3, AlgorithmSelector::Hybrid).await.unwrap();
        let second = handle.recommend("u1", 3, AlgorithmSelector::Hybrid).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        assert!(handle.invalidate_user("u1"));
        handle.recommend("u1", 3, AlgorithmSelector::Hybrid).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(!handle.invalidate_user("nobody"));
    }

    #[tokio::test]
    async fn test_refresh_epoch_swaps_only_on_change() {
        let dir = TempDir::new().unwrap();
        let builds = Arc::new(AtomicUsize::new(0));

        let same = factory("e1", Arc::new(AtomicUsize::new(0)), Arc::clone(&builds), false);
        let handle = EngineHandle::new(Arc::new(same), &config(dir.path()));
        handle.initialize().await;
        assert_eq!(handle.refresh_epoch().await.unwrap(), None);
        assert_eq!(builds.load(Ordering::SeqCst), 1);

        let changed = factory("e2", Arc::new(AtomicUsize::new(0)), Arc::clone(&builds), false);
        let handle = EngineHandle::new(Arc::new(changed), &config(dir.path()));
        handle.initialize().await;
        assert_eq!(handle.refresh_epoch().await.unwrap().as_deref(), Some("e1"));
        assert_eq!(builds.load(Ordering::SeqCst), 3);
        assert_eq!(handle.state(), EngineState::Initialized);
    }

    #[tokio::test]
    async fn test_fallback_written_from_live_engine_then_force_reinit() {
        let dir = TempDir::new().unwrap();
        let config = config(dir.path());
        let f = factory("e1", Arc::new(AtomicUsize::new(0)), Arc::new(AtomicUsize::new(0)), false);
        let handle = EngineHandle::new(Arc::new(f), &config);

        assert!(handle
            .write_fallback_hot_list(&config.data.fallback_hot_list_path, 5)
            .is_err());
        handle.initialize().await;
        assert_eq!(
            handle
                .write_fallback_hot_list(&config.data.fallback_hot_list_path, 5)
                .unwrap(),
            5
        );
        assert_eq!(load_fallback(&config.data.fallback_hot_list_path).unwrap().len(), 5);

        assert_eq!(handle.force_reinitialize().await, EngineState::Initialized);
        assert_eq!(handle.health().fallback_item_count, 5);
    }
}
