// ============================================
// Epoch Refresh Job
// ============================================
//
// Periodically checks the snapshot for a new data epoch and swaps it in.
//
// Workflow:
// 1. Healthy engine: `refresh_epoch()` builds the new epoch next to the live
//    one and swaps it atomically; a failed build keeps the old epoch
// 2. Degraded/Failed engine: once the snapshot epoch differs from the one
//    that last failed, try a forced re-initialization
// 3. Stop when the shutdown signal flips to `true`

use crate::services::handle::{EngineHandle, EngineState};
use crate::services::snapshot::compute_epoch_id;
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct EpochRefreshConfig {
    pub interval: Duration,
    pub snapshot_dir: PathBuf,
}

#[derive(Debug, Clone, Default)]
pub struct RefreshStats {
    pub last_run_at: Option<DateTime<Utc>>,
    pub checks: u64,
    pub swaps: u64,
    pub failures: u64,
    pub recoveries: u64,
}

pub struct EpochRefreshJob {
    config: EpochRefreshConfig,
    handle: EngineHandle,
    stats: RefreshStats,
    /// Snapshot epoch that the last forced re-initialization was attempted on
    last_recovery_epoch: Option<String>,
}

impl EpochRefreshJob {
    pub fn new(config: EpochRefreshConfig, handle: EngineHandle) -> Self {
        Self {
            config,
            handle,
            stats: RefreshStats::default(),
            last_recovery_epoch: None,
        }
    }

    pub fn stats(&self) -> &RefreshStats {
        &self.stats
    }

    /// Run until `shutdown` becomes `true`
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> RefreshStats {
        let mut ticker = interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick fires immediately; startup already built this epoch
        ticker.tick().await;

        info!(
            interval_secs = self.config.interval.as_secs(),
            "Epoch refresh job started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.run_once().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!(
            checks = self.stats.checks,
            swaps = self.stats.swaps,
            failures = self.stats.failures,
            "Epoch refresh job stopped"
        );
        self.stats
    }

    /// One check; returns whether a new engine went live
    pub async fn run_once(&mut self) -> bool {
        self.stats.checks += 1;
        self.stats.last_run_at = Some(Utc::now());

        match self.handle.state() {
            EngineState::Initialized => match self.handle.refresh_epoch().await {
                Ok(Some(epoch_id)) => {
                    self.stats.swaps += 1;
                    info!(epoch_id = %epoch_id, "New epoch live");
                    true
                }
                Ok(None) => {
                    debug!("Snapshot epoch unchanged");
                    false
                }
                Err(e) => {
                    self.stats.failures += 1;
                    error!(error = %e, "Epoch refresh failed, keeping the current epoch");
                    false
                }
            },
            EngineState::Degraded | EngineState::Failed => self.try_recover().await,
            EngineState::Uninitialized | EngineState::Initializing => false,
        }
    }

    async fn try_recover(&mut self) -> bool {
        let epoch = match compute_epoch_id(&self.config.snapshot_dir) {
            Ok(epoch) => epoch,
            Err(e) => {
                warn!(error = %e, "Snapshot unreadable, staying degraded");
                return false;
            }
        };
        if self.last_recovery_epoch.as_deref() == Some(epoch.as_str()) {
            return false;
        }
        self.last_recovery_epoch = Some(epoch.clone());

        info!(epoch_id = %epoch, "New snapshot while degraded, forcing re-initialization");
        let recovered = self.handle.force_reinitialize().await == EngineState::Initialized;
        if recovered {
            self.stats.recoveries += 1;
        } else {
            self.stats.failures += 1;
        }
        recovered
    }
}

/// Spawn the job on the current runtime
pub fn spawn_epoch_refresh(
    config: EpochRefreshConfig,
    handle: EngineHandle,
    shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<RefreshStats> {
    tokio::spawn(EpochRefreshJob::new(config, handle).run(shutdown))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::models::{InteractionRow, ItemRecord};
    use crate::services::engine::HybridEngineFactory;
    use crate::services::snapshot::write_snapshot;
    use artifact_cache::ArtifactCache;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn write(dir: &std::path::Path, epoch: Option<&str>, plays: u32) {
        let items: Vec<ItemRecord> = (0..8)
            .map(|i| ItemRecord {
                item_id: format!("i{}", i),
                category: "rock".into(),
                popularity: (8 - i) as f64,
                features: vec![i as f64],
                tier: None,
            })
            .collect();
        let rows: Vec<InteractionRow> = (0..6)
            .flat_map(|u| {
                (0..3).map(move |s| InteractionRow {
                    user_id: format!("u{}", u),
                    item_id: format!("i{}", (u + s) % 8),
                    play_count: plays,
                    kinds: vec![],
                })
            })
            .collect();
        write_snapshot(dir, &items, None, &rows, epoch).unwrap();
    }

    fn job(dir: &TempDir) -> (EpochRefreshJob, EngineHandle) {
        let config = Config::for_snapshot(dir.path());
        let factory = HybridEngineFactory::new(config.clone(), ArtifactCache::in_memory());
        let handle = EngineHandle::new(Arc::new(factory), &config);
        let job = EpochRefreshJob::new(
            EpochRefreshConfig {
                interval: Duration::from_millis(10),
                snapshot_dir: dir.path().to_path_buf(),
            },
            handle.clone(),
        );
        (job, handle)
    }

    #[tokio::test]
    async fn test_swaps_when_epoch_changes() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), Some("e1"), 1);
        let (mut job, handle) = job(&dir);
        assert_eq!(handle.initialize().await, EngineState::Initialized);

        assert!(!job.run_once().await);
        write(dir.path(), Some("e2"), 2);
        assert!(job.run_once().await);
        assert_eq!(handle.current_epoch().as_deref(), Some("e2"));
        assert_eq!(job.stats().swaps, 1);
    }

    #[tokio::test]
    async fn test_recovers_from_failed_once_snapshot_appears() {
        let dir = TempDir::new().unwrap();
        let (mut job, handle) = job(&dir);
        assert_eq!(handle.initialize().await, EngineState::Failed);

        write(dir.path(), None, 1);
        assert!(job.run_once().await);
        assert_eq!(handle.state(), EngineState::Initialized);
        assert_eq!(job.stats().recoveries, 1);
    }

    #[tokio::test]
    async fn test_stops_on_shutdown() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), Some("e1"), 1);
        let (job, handle) = job(&dir);
        handle.initialize().await;

        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(job.run(rx));
        tokio::time::sleep(Duration::from_millis(35)).await;
        tx.send(true).unwrap();

        let stats = task.await.unwrap();
        assert!(stats.checks >= 1);
        assert_eq!(stats.swaps, 0);
    }
}
