//! Pregeneration: keeps the pending pool between its watermarks.
//!
//! The background worker runs one [`Pregenerator::cycle`] per iteration:
//! - Ledger missing or corrupt: generate `max_threshold` artifacts from id 1, then bootstrap
//! - Depth at or below `min_threshold`: generate `max_threshold` more, then extend
//! - Otherwise: nothing to do
//!
//! A cycle is never interrupted; the stop signal is only observed between
//! cycles.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use clickgate_common::CaptchaError;
use serde::Serialize;
use tokio::sync::{Mutex, broadcast};

use super::blocking;
use super::renderer::Renderer;
use super::storage::ArtifactStore;
use crate::ledger::PoolLedger;

/// Pool replenishment policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Watermarks {
    /// Replenish once depth is at or below this
    pub min_threshold: u64,
    /// Artifacts generated per replenish
    pub max_threshold: u64,
}

/// What one cycle did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Pool rebuilt from id 1; `last_id` is the new upper bound
    Bootstrapped { last_id: u64 },
    /// Upper bound raised from `from` to `to`
    Extended { from: u64, to: u64 },
    /// Depth above the low watermark
    Sufficient { depth: u64 },
}

/// Runtime statistics
#[derive(Default)]
pub struct PregenStats {
    pub cycles: AtomicU64,
    pub generated: AtomicU64,
    pub render_failures: AtomicU64,
}

/// Snapshot of pregeneration statistics
#[derive(Clone, Debug, Serialize)]
pub struct PregenStatsSnapshot {
    pub cycles: u64,
    pub generated: u64,
    pub render_failures: u64,
}

/// Result of one batch: ids `[start_id, next_id)` were written
struct Batch {
    next_id: u64,
    failure: Option<CaptchaError>,
}

/// Single producer of pending artifacts for one pattern
pub struct Pregenerator {
    ledger: Arc<dyn PoolLedger>,
    renderer: Arc<dyn Renderer>,
    store: ArtifactStore,
    pattern: String,
    watermarks: Watermarks,
    live_ttl: Option<Duration>,
    /// Held for a whole cycle so a second worker cannot double-generate
    producer: Mutex<()>,
    stats: PregenStats,
}

impl Pregenerator {
    pub fn new(
        ledger: Arc<dyn PoolLedger>,
        renderer: Arc<dyn Renderer>,
        store: ArtifactStore,
        pattern: impl Into<String>,
        watermarks: Watermarks,
    ) -> Self {
        Self {
            ledger,
            renderer,
            store,
            pattern: pattern.into(),
            watermarks,
            live_ttl: None,
            producer: Mutex::new(()),
            stats: PregenStats::default(),
        }
    }

    /// Also sweep live artifacts older than `ttl` on every worker iteration
    pub fn with_live_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.live_ttl = ttl;
        self
    }

    pub fn watermarks(&self) -> Watermarks {
        self.watermarks
    }

    pub fn ledger(&self) -> &Arc<dyn PoolLedger> {
        &self.ledger
    }

    pub fn get_stats(&self) -> PregenStatsSnapshot {
        PregenStatsSnapshot {
            cycles: self.stats.cycles.load(Ordering::Relaxed),
            generated: self.stats.generated.load(Ordering::Relaxed),
            render_failures: self.stats.render_failures.load(Ordering::Relaxed),
        }
    }

    /// Run one replenish cycle
    pub async fn cycle(&self) -> Result<CycleOutcome, CaptchaError> {
        let _producer = self.producer.lock().await;
        self.stats.cycles.fetch_add(1, Ordering::Relaxed);

        let ledger = self.ledger.clone();
        let record = match blocking(move || ledger.read()).await? {
            Ok(record) => record,
            Err(e) if e.needs_bootstrap() => {
                tracing::warn!(error = %e, pattern = %self.pattern, "Pool ledger unusable, bootstrapping");
                return self.bootstrap().await;
            }
            Err(e) => return Err(e.into()),
        };

        let depth = record.depth();
        if depth > self.watermarks.min_threshold {
            return Ok(CycleOutcome::Sufficient { depth });
        }

        tracing::debug!(
            pattern = %record.pattern,
            depth = depth,
            min_threshold = self.watermarks.min_threshold,
            "Pool at low watermark - replenishing"
        );
        let from = record.last_id;
        let batch = self.generate_batch(record.pattern, from).await?;
        if batch.next_id > from {
            let ledger = self.ledger.clone();
            let to = batch.next_id;
            blocking(move || ledger.extend(to)).await??;
            tracing::info!(from = from, to = to, "Pool extended");
        }

        match batch.failure {
            Some(e) => Err(e),
            None => Ok(CycleOutcome::Extended { from, to: batch.next_id }),
        }
    }

    async fn bootstrap(&self) -> Result<CycleOutcome, CaptchaError> {
        let batch = self.generate_batch(self.pattern.clone(), 1).await?;
        if batch.next_id > 1 {
            let ledger = self.ledger.clone();
            let pattern = self.pattern.clone();
            let last_id = batch.next_id;
            blocking(move || ledger.bootstrap(&pattern, last_id)).await??;
            tracing::info!(pattern = %self.pattern, last_id = last_id, "Pool bootstrapped");
        }

        match batch.failure {
            Some(e) => Err(e),
            None => Ok(CycleOutcome::Bootstrapped { last_id: batch.next_id }),
        }
    }

    /// Render `max_threshold` pending artifacts starting at `start_id`,
    /// stopping at the first failure
    async fn generate_batch(&self, pattern: String, start_id: u64) -> Result<Batch, CaptchaError> {
        let renderer = self.renderer.clone();
        let store = self.store.clone();
        let count = self.watermarks.max_threshold;

        let batch = blocking(move || {
            if let Err(e) = store.ensure_pool_dirs_blocking() {
                return Batch { next_id: start_id, failure: Some(e.into()) };
            }

            let mut next_id = start_id;
            for _ in 0..count {
                let pending = store.pending(&pattern, next_id);
                if let Err(e) = renderer.generate(&pending.image, &pending.mask) {
                    tracing::error!(sequential_id = next_id, error = %e, "Pregeneration render failed");
                    return Batch { next_id, failure: Some(e.into()) };
                }
                next_id += 1;
            }
            Batch { next_id, failure: None }
        })
        .await?;

        self.stats
            .generated
            .fetch_add(batch.next_id - start_id, Ordering::Relaxed);
        if batch.failure.is_some() {
            self.stats.render_failures.fetch_add(1, Ordering::Relaxed);
        }
        Ok(batch)
    }
}

/// Background worker that maintains the pool until `shutdown` fires
pub async fn pregeneration_worker(
    pregen: Arc<Pregenerator>,
    delay: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let watermarks = pregen.watermarks();
    tracing::info!(
        pattern = %pregen.pattern,
        min_threshold = watermarks.min_threshold,
        max_threshold = watermarks.max_threshold,
        "🎯 Pregeneration worker started"
    );

    loop {
        match pregen.cycle().await {
            Ok(CycleOutcome::Sufficient { depth }) => {
                tracing::trace!(depth = depth, "Pool depth sufficient");
            }
            Ok(outcome) => tracing::debug!(outcome = ?outcome, "Pregeneration cycle complete"),
            Err(e) => tracing::error!(error = %e, "Pregeneration cycle failed"),
        }

        if let Some(ttl) = pregen.live_ttl {
            if let Err(e) = pregen.store.sweep_expired(ttl).await {
                tracing::warn!(error = %e, "Live artifact sweep failed");
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.recv() => {
                tracing::info!("🎯 Pregeneration worker shutting down...");
                break;
            }
        }
    }
}
