//! Lifecycle manager: hands out live artifacts and consumes them on verification.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use clickgate_common::{ArtifactId, CaptchaError, MaskError, Symbol};
use serde::Serialize;
use tokio::sync::broadcast;

use super::blocking;
use super::pool::{PregenStatsSnapshot, Pregenerator, Watermarks, pregeneration_worker};
use super::renderer::{Renderer, ShapeRenderer};
use super::storage::ArtifactStore;
use crate::config::{AppConfig, CaptchaConfig, LedgerBackend};
use crate::ledger::{FileLedger, MemoryLedger, PoolLedger, Withdrawal, withdraw};
use crate::mask::MaskReader;

/// Runtime statistics
#[derive(Default)]
pub struct ManagerStats {
    /// Artifacts promoted from the pool
    pub served_from_pool: AtomicU64,
    /// Artifacts rendered on demand
    pub fallback_renders: AtomicU64,
    pub verified_accepted: AtomicU64,
    pub verified_rejected: AtomicU64,
    pub deleted: AtomicU64,
    pub swept: AtomicU64,
    /// Requests that found the pool at or below the low watermark
    pub replenish_signals: AtomicU64,
}

/// Snapshot of manager statistics
#[derive(Clone, Debug, Serialize)]
pub struct ManagerStatsSnapshot {
    pub served_from_pool: u64,
    pub fallback_renders: u64,
    pub verified_accepted: u64,
    pub verified_rejected: u64,
    pub deleted: u64,
    pub swept: u64,
    pub replenish_signals: u64,
    pub worker_running: bool,
    pub pool: Option<PregenStatsSnapshot>,
}

/// Issues, verifies and deletes challenge artifacts
pub struct CaptchaManager {
    store: ArtifactStore,
    ledger: Option<Arc<dyn PoolLedger>>,
    renderer: Arc<dyn Renderer>,
    pregen: Option<Arc<Pregenerator>>,
    watch_delay: Duration,
    auto_spawn_worker: bool,
    /// Set while a worker task spawned by this manager is alive
    watching: Arc<AtomicBool>,
    stopped: AtomicBool,
    shutdown: broadcast::Sender<()>,
    stats: ManagerStats,
}

impl CaptchaManager {
    /// Create a manager; without a ledger every artifact is rendered on demand
    pub fn new(
        config: &CaptchaConfig,
        ledger: Option<Arc<dyn PoolLedger>>,
        renderer: Arc<dyn Renderer>,
    ) -> Self {
        let store = ArtifactStore::from_config(config);
        let pregen = ledger.as_ref().map(|ledger| {
            let pregen = Pregenerator::new(
                ledger.clone(),
                renderer.clone(),
                store.clone(),
                config.pattern.clone(),
                Watermarks {
                    min_threshold: config.min_threshold,
                    max_threshold: config.max_threshold,
                },
            )
            .with_live_ttl(config.live_ttl_secs.map(Duration::from_secs));
            Arc::new(pregen)
        });
        let (shutdown, _) = broadcast::channel(1);

        Self {
            store,
            ledger,
            renderer,
            pregen,
            watch_delay: Duration::from_secs(config.watch_delay_secs),
            auto_spawn_worker: config.auto_spawn_worker,
            watching: Arc::new(AtomicBool::new(false)),
            stopped: AtomicBool::new(false),
            shutdown,
            stats: ManagerStats::default(),
        }
    }

    /// Build the ledger backend and the shape renderer from configuration
    pub fn from_config(config: &AppConfig) -> Self {
        let ledger: Option<Arc<dyn PoolLedger>> = match config.captcha.ledger {
            LedgerBackend::File => Some(Arc::new(FileLedger::new(&config.captcha.ledger_path))),
            LedgerBackend::Memory => Some(Arc::new(MemoryLedger::new())),
            LedgerBackend::Disabled => None,
        };
        let renderer = Arc::new(ShapeRenderer::new(config.renderer.clone()));
        Self::new(&config.captcha, ledger, renderer)
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    pub fn ledger(&self) -> Option<&Arc<dyn PoolLedger>> {
        self.ledger.as_ref()
    }

    pub fn pregenerator(&self) -> Option<&Arc<Pregenerator>> {
        self.pregen.as_ref()
    }

    /// Challenge image to serve for a live artifact
    pub fn live_image_path(&self, id: &ArtifactId) -> PathBuf {
        self.store.live(id).image
    }

    /// Issue a live artifact, from the pool when possible
    pub async fn get_artifact(&self) -> Result<ArtifactId, CaptchaError> {
        let withdrawal = match &self.ledger {
            Some(ledger) => {
                let ledger = ledger.clone();
                blocking(move || withdraw(Some(&*ledger))).await?
            }
            None => Withdrawal::Empty,
        };

        match withdrawal {
            Withdrawal::Delivered(withdrawn) => {
                let id = ArtifactId::generate();
                let promoted = self
                    .store
                    .promote(&withdrawn.pattern, withdrawn.sequential_id, &id)
                    .await;
                self.maybe_replenish(withdrawn.remaining);

                match promoted {
                    Ok(_) => {
                        self.stats.served_from_pool.fetch_add(1, Ordering::Relaxed);
                        tracing::debug!(
                            artifact_id = %id,
                            sequential_id = withdrawn.sequential_id,
                            remaining = withdrawn.remaining,
                            "Artifact served from pool"
                        );
                        return Ok(id);
                    }
                    Err(e) => {
                        tracing::warn!(
                            sequential_id = withdrawn.sequential_id,
                            error = %e,
                            "Pooled artifact unavailable - rendering on demand"
                        );
                    }
                }
            }
            Withdrawal::Empty => {
                tracing::debug!("Pool empty - rendering on demand");
                self.maybe_replenish(0);
            }
            Withdrawal::LedgerCorrupt(reason) | Withdrawal::IoFailure(reason) => {
                tracing::warn!(reason = %reason, "Pool ledger unusable - rendering on demand");
                self.maybe_replenish(0);
            }
        }

        self.render_live().await
    }

    /// Check a click against a live artifact and consume it.
    ///
    /// The artifact is deleted whatever the outcome. A second call for the
    /// same id fails with `ArtifactNotFound`.
    pub async fn verify(&self, id: &ArtifactId, x: i64, y: i64) -> Result<bool, CaptchaError> {
        let claimed = match self.store.claim_mask(id).await {
            Ok(path) => path,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::debug!(artifact_id = %id, "Verification for unknown or consumed artifact");
                return Err(CaptchaError::ArtifactNotFound(id.to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        let checked =
            blocking(move || MaskReader::open_and_check(&claimed, x, y, Symbol::CLICKABLE)).await;

        if let Err(e) = self.store.remove_live(id).await {
            tracing::error!(artifact_id = %id, error = %e, "Failed to delete consumed artifact");
        }

        let accepted = match checked? {
            Ok(accepted) => accepted,
            Err(e @ MaskError::OutOfRange { .. }) => {
                self.stats.verified_rejected.fetch_add(1, Ordering::Relaxed);
                return Err(e.into());
            }
            Err(e) => return Err(e.into()),
        };

        let counter = if accepted {
            &self.stats.verified_accepted
        } else {
            &self.stats.verified_rejected
        };
        counter.fetch_add(1, Ordering::Relaxed);
        tracing::info!(artifact_id = %id, x = x, y = y, accepted = accepted, "Artifact verified");

        Ok(accepted)
    }

    /// Remove a live artifact; absent artifacts are not an error.
    ///
    /// Returns true if anything was removed.
    pub async fn delete(&self, id: &ArtifactId) -> Result<bool, CaptchaError> {
        let removed = self.store.remove_live(id).await?;
        if removed {
            self.stats.deleted.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(artifact_id = %id, "Artifact deleted");
        }
        Ok(removed)
    }

    /// Delete live artifacts older than `ttl`
    pub async fn sweep_expired(&self, ttl: Duration) -> Result<usize, CaptchaError> {
        let swept = self.store.sweep_expired(ttl).await?;
        self.stats.swept.fetch_add(swept as u64, Ordering::Relaxed);
        Ok(swept)
    }

    /// Start the pregeneration worker unless one is already running.
    ///
    /// Returns false if no worker was started.
    pub fn spawn_worker(&self) -> bool {
        let Some(pregen) = self.pregen.clone() else {
            return false;
        };
        if self.stopped.load(Ordering::Acquire) || self.watching.swap(true, Ordering::AcqRel) {
            return false;
        }

        let watching = self.watching.clone();
        let shutdown = self.shutdown.subscribe();
        let delay = self.watch_delay;
        tokio::spawn(async move {
            pregeneration_worker(pregen, delay, shutdown).await;
            watching.store(false, Ordering::Release);
        });
        true
    }

    pub fn is_watching(&self) -> bool {
        self.watching.load(Ordering::Acquire)
    }

    /// Ask a running worker to stop after its current cycle
    pub fn shutdown(&self) {
        self.stopped.store(true, Ordering::Release);
        // no receivers just means no worker is running
        let _ = self.shutdown.send(());
    }

    /// Get statistics snapshot
    pub fn get_stats(&self) -> ManagerStatsSnapshot {
        ManagerStatsSnapshot {
            served_from_pool: self.stats.served_from_pool.load(Ordering::Relaxed),
            fallback_renders: self.stats.fallback_renders.load(Ordering::Relaxed),
            verified_accepted: self.stats.verified_accepted.load(Ordering::Relaxed),
            verified_rejected: self.stats.verified_rejected.load(Ordering::Relaxed),
            deleted: self.stats.deleted.load(Ordering::Relaxed),
            swept: self.stats.swept.load(Ordering::Relaxed),
            replenish_signals: self.stats.replenish_signals.load(Ordering::Relaxed),
            worker_running: self.is_watching(),
            pool: self.pregen.as_ref().map(|pregen| pregen.get_stats()),
        }
    }

    fn maybe_replenish(&self, remaining: u64) {
        let Some(pregen) = &self.pregen else {
            return;
        };
        if remaining > pregen.watermarks().min_threshold {
            return;
        }

        self.stats.replenish_signals.fetch_add(1, Ordering::Relaxed);
        if self.auto_spawn_worker && self.spawn_worker() {
            tracing::info!(remaining = remaining, "Pool low - pregeneration worker spawned");
        }
    }

    /// Render a fresh artifact straight into live storage
    async fn render_live(&self) -> Result<ArtifactId, CaptchaError> {
        self.store.ensure_live_dirs().await?;

        let id = ArtifactId::generate();
        let live = self.store.live(&id);
        let renderer = self.renderer.clone();
        let rendered = blocking(move || renderer.generate(&live.image, &live.mask)).await?;

        match rendered {
            Ok(artifact) => {
                self.stats.fallback_renders.fetch_add(1, Ordering::Relaxed);
                tracing::info!(
                    artifact_id = %id,
                    width = artifact.width,
                    height = artifact.height,
                    "Artifact rendered on demand"
                );
                Ok(id)
            }
            Err(e) => {
                if let Err(cleanup) = self.store.remove_live(&id).await {
                    tracing::warn!(artifact_id = %id, error = %cleanup, "Failed to clean up partial artifact");
                }
                tracing::error!(error = %e, "On-demand render failed");
                Err(e.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::captcha::pool::CycleOutcome;
    use crate::captcha::renderer::testing::GridRenderer;
    use clickgate_common::PoolIndexRecord;
    use std::collections::HashSet;
    use std::path::Path;
    use tokio_test::{assert_err, assert_ok};

    fn config(root: &Path) -> CaptchaConfig {
        CaptchaConfig {
            live_image_dir: root.join("live"),
            live_mask_dir: root.join("live"),
            pool_image_dir: root.join("pool"),
            pool_mask_dir: root.join("pool"),
            ledger_path: root.join("pool/preindex.txt"),
            min_threshold: 1,
            max_threshold: 4,
            auto_spawn_worker: false,
            ..CaptchaConfig::default()
        }
    }

    fn manager(root: &Path, renderer: Arc<GridRenderer>) -> (CaptchaManager, Arc<MemoryLedger>) {
        let ledger = Arc::new(MemoryLedger::new());
        let manager = CaptchaManager::new(&config(root), Some(ledger.clone()), renderer);
        (manager, ledger)
    }

    fn live_files(root: &Path) -> usize {
        match std::fs::read_dir(root.join("live")) {
            Ok(entries) => entries.count(),
            Err(_) => 0,
        }
    }

    #[tokio::test]
    async fn test_pool_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, ledger) = manager(dir.path(), Arc::new(GridRenderer::new()));
        let pregen = manager.pregenerator().unwrap().clone();

        // A missing ledger does not hand out id 1 on this first call. The call
        // renders on demand and requests replenishment; the worker's bootstrap
        // cycle then pools ids 1..=4 and the next call withdraws id 1.
        assert_ok!(manager.get_artifact().await);
        assert_eq!(manager.get_stats().fallback_renders, 1);
        assert_eq!(manager.get_stats().replenish_signals, 1);

        assert_eq!(assert_ok!(pregen.cycle().await), CycleOutcome::Bootstrapped { last_id: 5 });

        let first = assert_ok!(manager.get_artifact().await);
        assert!(!dir.path().join("pool/pre1.jpg").exists());
        assert!(!dir.path().join("pool/pre1.rle").exists());
        assert!(manager.live_image_path(&first).exists());
        assert_eq!(ledger.read().unwrap(), PoolIndexRecord::new("pre", 2, 5));

        assert_ok!(manager.get_artifact().await);
        assert_eq!(manager.get_stats().replenish_signals, 1);
        assert_ok!(manager.get_artifact().await);
        assert_eq!(manager.get_stats().replenish_signals, 2);
        assert_ok!(manager.get_artifact().await);
        assert_eq!(manager.get_stats().served_from_pool, 4);

        assert_eq!(assert_ok!(pregen.cycle().await), CycleOutcome::Extended { from: 5, to: 9 });
        assert_ok!(manager.get_artifact().await);
        assert_eq!(ledger.read().unwrap(), PoolIndexRecord::new("pre", 6, 9));
        assert_eq!(manager.get_stats().served_from_pool, 5);
    }

    #[tokio::test]
    async fn test_verify_consumes_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _) = manager(dir.path(), Arc::new(GridRenderer::new()));

        let id = assert_ok!(manager.get_artifact().await);
        assert!(assert_ok!(manager.verify(&id, 1, 1).await));
        assert_eq!(live_files(dir.path()), 0);

        let err = assert_err!(manager.verify(&id, 1, 1).await);
        assert!(matches!(err, CaptchaError::ArtifactNotFound(_)));
        assert!(err.is_rejection());
    }

    #[tokio::test]
    async fn test_verify_rejects_background_click() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _) = manager(dir.path(), Arc::new(GridRenderer::new()));

        let id = assert_ok!(manager.get_artifact().await);
        assert!(!assert_ok!(manager.verify(&id, 6, 2).await));
        assert_eq!(live_files(dir.path()), 0);
        assert_eq!(manager.get_stats().verified_rejected, 1);
    }

    #[tokio::test]
    async fn test_verify_out_of_range_still_consumes() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _) = manager(dir.path(), Arc::new(GridRenderer::new()));

        let id = assert_ok!(manager.get_artifact().await);
        let err = assert_err!(manager.verify(&id, 100, 0).await);
        assert!(matches!(err, CaptchaError::Mask(MaskError::OutOfRange { .. })));
        assert!(err.is_rejection());
        assert_eq!(live_files(dir.path()), 0);
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _) = manager(dir.path(), Arc::new(GridRenderer::new()));

        let id = assert_ok!(manager.get_artifact().await);
        assert!(assert_ok!(manager.delete(&id).await));
        assert!(!assert_ok!(manager.delete(&id).await));
        assert_eq!(manager.get_stats().deleted, 1);
    }

    #[tokio::test]
    async fn test_without_ledger_renders_on_demand() {
        let dir = tempfile::tempdir().unwrap();
        let renderer = Arc::new(GridRenderer::new());
        let manager = CaptchaManager::new(&config(dir.path()), None, renderer.clone());

        let a = assert_ok!(manager.get_artifact().await);
        let b = assert_ok!(manager.get_artifact().await);
        assert_ne!(a, b);
        assert_eq!(renderer.calls(), 2);
        assert!(!manager.spawn_worker());
        assert!(manager.get_stats().pool.is_none());
    }

    #[tokio::test]
    async fn test_render_failure_propagates() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CaptchaManager::new(
            &config(dir.path()),
            None,
            Arc::new(GridRenderer::failing_after(0)),
        );

        let err = assert_err!(manager.get_artifact().await);
        assert!(matches!(err, CaptchaError::Render(_)));
        assert!(!err.is_rejection());
        assert_eq!(live_files(dir.path()), 0);
    }

    #[tokio::test]
    async fn test_corrupt_ledger_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let ledger_path = dir.path().join("pool/preindex.txt");
        std::fs::create_dir_all(dir.path().join("pool")).unwrap();
        std::fs::write(&ledger_path, "garbage").unwrap();

        let ledger = Arc::new(FileLedger::new(&ledger_path));
        let manager =
            CaptchaManager::new(&config(dir.path()), Some(ledger), Arc::new(GridRenderer::new()));

        assert_ok!(manager.get_artifact().await);
        let stats = manager.get_stats();
        assert_eq!(stats.fallback_renders, 1);
        assert_eq!(stats.replenish_signals, 1);
    }

    #[tokio::test]
    async fn test_debug_mask_follows_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let renderer = Arc::new(GridRenderer {
            debug_png: true,
            ..GridRenderer::new()
        });
        let (manager, _) = manager(dir.path(), renderer);
        assert_ok!(manager.pregenerator().unwrap().cycle().await);

        let id = assert_ok!(manager.get_artifact().await);
        let live = manager.store().live(&id);
        assert!(live.debug.exists());
        assert!(!dir.path().join("pool/pre1.png").exists());

        assert_ok!(manager.verify(&id, 0, 0).await);
        assert!(!live.debug.exists());
    }

    #[tokio::test]
    async fn test_missing_pending_files_fall_back() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Arc::new(MemoryLedger::with_record(PoolIndexRecord::new("pre", 1, 3)));
        let manager = CaptchaManager::new(
            &config(dir.path()),
            Some(ledger.clone()),
            Arc::new(GridRenderer::new()),
        );

        let id = assert_ok!(manager.get_artifact().await);
        assert!(manager.live_image_path(&id).exists());
        assert_eq!(manager.get_stats().fallback_renders, 1);
        // the id is spent even though its files were gone
        assert_eq!(ledger.read().unwrap().current_id, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_withdrawals_are_distinct() {
        let dir = tempfile::tempdir().unwrap();
        let renderer = Arc::new(GridRenderer::new());
        let (manager, _) = manager(dir.path(), renderer.clone());
        assert_ok!(manager.pregenerator().unwrap().cycle().await);

        let manager = Arc::new(manager);
        let handles: Vec<_> = (0..10)
            .map(|_| {
                let manager = manager.clone();
                tokio::spawn(async move { manager.get_artifact().await })
            })
            .collect();

        let mut ids = HashSet::new();
        for handle in handles {
            ids.insert(handle.await.unwrap().unwrap());
        }

        assert_eq!(ids.len(), 10);
        let stats = manager.get_stats();
        assert_eq!(stats.served_from_pool, 4);
        assert_eq!(stats.fallback_renders, 6);
        assert_eq!(renderer.calls(), 10);
        for seq in 1..=4 {
            assert!(!dir.path().join(format!("pool/pre{seq}.rle")).exists());
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_worker_spawned_on_demand() {
        let dir = tempfile::tempdir().unwrap();
        let config = CaptchaConfig {
            auto_spawn_worker: true,
            watch_delay_secs: 3600,
            ..config(dir.path())
        };
        let ledger = Arc::new(MemoryLedger::new());
        let manager =
            CaptchaManager::new(&config, Some(ledger.clone()), Arc::new(GridRenderer::new()));

        assert_ok!(manager.get_artifact().await);
        assert!(manager.is_watching());
        assert!(!manager.spawn_worker());

        tokio::time::timeout(Duration::from_secs(10), async {
            while ledger.read().is_err() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        assert_ok!(manager.get_artifact().await);
        assert_eq!(manager.get_stats().served_from_pool, 1);

        manager.shutdown();
        tokio::time::timeout(Duration::from_secs(10), async {
            while manager.is_watching() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert!(!manager.spawn_worker());
    }

    #[tokio::test]
    async fn test_sweep_expired() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _) = manager(dir.path(), Arc::new(GridRenderer::new()));

        let id = assert_ok!(manager.get_artifact().await);
        assert_eq!(assert_ok!(manager.sweep_expired(Duration::from_secs(3600)).await), 0);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(assert_ok!(manager.sweep_expired(Duration::from_millis(1)).await), 1);
        assert!(!manager.live_image_path(&id).exists());
        assert_eq!(manager.get_stats().swept, 1);
    }
}
