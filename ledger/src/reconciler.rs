//! Reconciliation loop.
//!
//! Every tick the reconciler lists stale uncancelled transactions and cancels
//! each one independently. A failed cancel is logged and counted; it never
//! stops the rest of the batch or the loop. Shutdown is cooperative: a batch
//! in progress always completes before the loop exits.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};

use wallet_common::{constants, DurationExt};

use crate::store::{CancelOutcome, LedgerStore, StalenessPolicy, StoreResult};

/// Reconciler configuration.
#[derive(Debug, Clone, Copy)]
pub struct ReconcilerConfig {
    /// Time between batches.
    pub interval: Duration,
    /// Which transactions a batch picks up.
    pub policy: StalenessPolicy,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            interval: constants::reconcile_interval().as_std(),
            policy: StalenessPolicy::default(),
        }
    }
}

/// Result of one batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Transactions returned by the listing.
    pub scanned: usize,
    /// Transactions moved to cancelled by this batch.
    pub cancelled: usize,
    /// Transactions someone else already cancelled.
    pub already_handled: usize,
    /// Cancels that errored.
    pub failed: usize,
}

/// Cumulative reconciler counters.
#[derive(Debug, Default)]
pub struct ReconcileStats {
    runs: AtomicU64,
    cancelled: AtomicU64,
    failures: AtomicU64,
}

impl ReconcileStats {
    fn record(&self, report: &ReconcileReport) {
        self.runs.fetch_add(1, Ordering::Relaxed);
        self.cancelled
            .fetch_add(report.cancelled as u64, Ordering::Relaxed);
        self.failures.fetch_add(report.failed as u64, Ordering::Relaxed);
    }

    fn record_failed_run(&self) {
        self.runs.fetch_add(1, Ordering::Relaxed);
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Get a snapshot of the counters.
    pub fn snapshot(&self) -> ReconcileStatsSnapshot {
        ReconcileStatsSnapshot {
            runs: self.runs.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`ReconcileStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileStatsSnapshot {
    pub runs: u64,
    pub cancelled: u64,
    pub failures: u64,
}

/// Background task that voids stale transactions.
pub struct Reconciler<S: LedgerStore> {
    store: Arc<S>,
    config: ReconcilerConfig,
    stats: Arc<ReconcileStats>,
}

impl<S: LedgerStore> Reconciler<S> {
    /// Create a new reconciler.
    pub fn new(store: Arc<S>, config: ReconcilerConfig) -> Self {
        Self {
            store,
            config,
            stats: Arc::new(ReconcileStats::default()),
        }
    }

    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    /// Shared counters, readable while the loop runs.
    pub fn stats(&self) -> Arc<ReconcileStats> {
        Arc::clone(&self.stats)
    }

    /// Run a single batch.
    ///
    /// Only a failure to list is returned; per-transaction failures are
    /// logged and reported in the counts.
    #[instrument(skip(self), fields(limit = self.config.policy.limit))]
    pub async fn run_once(&self) -> StoreResult<ReconcileReport> {
        let stale = match self.store.list_stale_uncancelled(&self.config.policy).await {
            Ok(stale) => stale,
            Err(e) => {
                self.stats.record_failed_run();
                return Err(e);
            }
        };

        let mut report = ReconcileReport {
            scanned: stale.len(),
            ..ReconcileReport::default()
        };

        for transaction in stale {
            match self.store.cancel(transaction.id).await {
                Ok(CancelOutcome::Cancelled) => {
                    report.cancelled += 1;
                    info!(
                        transaction_id = %transaction.id,
                        external_id = %transaction.external_id,
                        user_id = %transaction.user_id,
                        "Transaction cancelled"
                    );
                }
                Ok(CancelOutcome::AlreadyHandled) => {
                    report.already_handled += 1;
                    debug!(transaction_id = %transaction.id, "Transaction already cancelled");
                }
                Err(e) => {
                    report.failed += 1;
                    warn!(
                        transaction_id = %transaction.id,
                        error = %e,
                        "Failed to cancel transaction"
                    );
                }
            }
        }

        self.stats.record(&report);
        if report.scanned > 0 {
            info!(
                scanned = report.scanned,
                cancelled = report.cancelled,
                failed = report.failed,
                "Reconciliation batch finished"
            );
        }
        Ok(report)
    }

    /// Run batches on the configured interval until `shutdown` turns true or
    /// its sender is dropped.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        if *shutdown.borrow() {
            return;
        }

        info!(
            interval_ms = self.config.interval.as_millis() as u64,
            limit = self.config.policy.limit,
            grace_secs = self.config.policy.grace_period.num_seconds(),
            "Reconciler started"
        );

        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.run_once().await {
                        error!(error = %e, "Reconciliation batch failed");
                    }
                }
            }
        }

        info!("Reconciler stopped");
    }

    /// Spawn [`Reconciler::run`] onto the runtime.
    pub fn spawn(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(shutdown).await })
    }
}
