//! Background retention: expired records are deleted on a fixed cadence.
//!
//! A [`Reaper`] runs one deletion cycle over every storage category; the
//! [`RetentionScheduler`] drives it from a tokio interval. Expiration
//! windows are read fresh from the config registry on every cycle, so
//! a reconfigure takes effect at the next cycle with no restart.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::config::ConfigRegistry;

/// Default scheduling period between deletion cycles.
pub const DEFAULT_PERIOD: Duration = Duration::from_secs(60 * 60);

const MILLIS_PER_HOUR: u64 = 60 * 60 * 1000;

/// A category of durable records with its own expiration window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageCategory {
    /// Aggregated metric rollups.
    AggregateMetrics,
    /// Detailed trace records.
    DetailedTraces,
    /// Periodic gauge samples.
    GaugeSamples,
}

impl StorageCategory {
    /// Every category, in the fixed cycle order.
    pub const ALL: [Self; 3] = [
        Self::AggregateMetrics,
        Self::DetailedTraces,
        Self::GaugeSamples,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::AggregateMetrics => "aggregate-metrics",
            Self::DetailedTraces => "detailed-traces",
            Self::GaugeSamples => "gauge-samples",
        }
    }
}

impl std::fmt::Display for StorageCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error types for storage deletion
#[derive(Debug, Error)]
pub enum StorageError {
    /// The backend rejected or could not complete the deletion.
    #[error("storage backend error: {0}")]
    Backend(String),
    /// I/O failure reaching the backend.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// A durable store whose records expire by timestamp.
pub trait ExpirableStore: Send + Sync {
    /// Deletes every record captured strictly before `cutoff_millis`
    /// (epoch milliseconds).
    ///
    /// Must be idempotent and tolerate cutoffs in the future or far past;
    /// repeating a deletion is harmless.
    fn delete_before(&self, cutoff_millis: u64) -> Result<(), StorageError>;
}

/// Thread-safe retention counters (uses atomics)
#[derive(Debug, Default)]
pub struct RetentionMetrics {
    cycles_completed: AtomicU64,
    deletions_issued: AtomicU64,
    deletion_failures: AtomicU64,
}

impl RetentionMetrics {
    pub fn cycles_completed(&self) -> u64 {
        self.cycles_completed.load(Ordering::Relaxed)
    }

    pub fn deletions_issued(&self) -> u64 {
        self.deletions_issued.load(Ordering::Relaxed)
    }

    pub fn deletion_failures(&self) -> u64 {
        self.deletion_failures.load(Ordering::Relaxed)
    }

    fn record_cycle(&self) {
        self.cycles_completed.fetch_add(1, Ordering::Relaxed);
    }

    fn record_deletion(&self) {
        self.deletions_issued.fetch_add(1, Ordering::Relaxed);
    }

    fn record_failure(&self) {
        self.deletion_failures.fetch_add(1, Ordering::Relaxed);
    }
}

/// Issues delete-before-cutoff calls for every registered category.
///
/// Pure scheduling-free logic; the [`RetentionScheduler`] owns the cadence.
pub struct Reaper {
    registry: Arc<ConfigRegistry>,
    clock: Arc<dyn Clock>,
    stores: Vec<(StorageCategory, Arc<dyn ExpirableStore>)>,
    metrics: Arc<RetentionMetrics>,
}

impl Reaper {
    pub fn new(registry: Arc<ConfigRegistry>, clock: Arc<dyn Clock>) -> Self {
        Self {
            registry,
            clock,
            stores: Vec::new(),
            metrics: Arc::new(RetentionMetrics::default()),
        }
    }

    /// Registers the store responsible for one category.
    #[must_use]
    pub fn with_store(mut self, category: StorageCategory, store: Arc<dyn ExpirableStore>) -> Self {
        self.stores.push((category, store));
        self
    }

    pub fn metrics(&self) -> &Arc<RetentionMetrics> {
        &self.metrics
    }

    /// Runs one deletion cycle.
    ///
    /// Categories are processed sequentially and independently: each reads
    /// its window fresh from the registry, and a failed category is logged
    /// and counted without aborting the rest of the cycle.
    pub fn run_cycle(&self) {
        let now = self.clock.now_millis();
        for (category, store) in &self.stores {
            let window_hours = self.registry.retention_window_hours(*category);
            let cutoff = now.saturating_sub(window_hours.saturating_mul(MILLIS_PER_HOUR));
            match store.delete_before(cutoff) {
                Ok(()) => {
                    self.metrics.record_deletion();
                    debug!(category = %category, cutoff, "expired records deleted");
                }
                Err(err) => {
                    self.metrics.record_failure();
                    warn!(category = %category, cutoff, error = %err, "retention deletion failed");
                }
            }
        }
        self.metrics.record_cycle();
    }
}

/// Drives the reaper on a fixed cadence from a background task.
pub struct RetentionScheduler {
    reaper_task: Option<JoinHandle<()>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    metrics: Arc<RetentionMetrics>,
}

impl RetentionScheduler {
    /// Spawns the retention task with the given period.
    ///
    /// The first cycle runs immediately. Missed ticks are delayed rather
    /// than burst, so a long-running cycle pushes the next one out instead
    /// of overlapping with it; a cycle is never concurrent with itself.
    pub fn spawn(reaper: Reaper, period: Duration) -> Self {
        let metrics = Arc::clone(reaper.metrics());
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        let reaper_task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = interval.tick() => reaper.run_cycle(),
                }
            }
        });

        Self {
            reaper_task: Some(reaper_task),
            shutdown_tx: Some(shutdown_tx),
            metrics,
        }
    }

    pub fn metrics(&self) -> &Arc<RetentionMetrics> {
        &self.metrics
    }

    /// Gracefully stops the retention task.
    ///
    /// Waits for an in-progress cycle to finish; no cycle is interrupted
    /// mid-category.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.reaper_task.take() {
            let _ = task.await;
        }
    }
}
