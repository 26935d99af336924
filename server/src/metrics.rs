//! Metrics collection for wallet service monitoring.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;

use wallet_common::WalletError;
use wallet_ledger::ReconcileStatsSnapshot;

/// Wallet service metrics.
pub struct Metrics {
    /// Total transactions received.
    pub transactions_total: AtomicU64,
    /// Transactions applied to a balance.
    pub transactions_applied: AtomicU64,
    /// Transactions rejected for a semantic reason.
    pub transactions_rejected: AtomicU64,
    /// Transactions that failed with an internal error.
    pub transactions_failed: AtomicU64,
    /// Transactions currently being processed.
    pub transactions_in_flight: AtomicU64,
}

impl Metrics {
    /// Create new metrics instance.
    pub fn new() -> Self {
        Self {
            transactions_total: AtomicU64::new(0),
            transactions_applied: AtomicU64::new(0),
            transactions_rejected: AtomicU64::new(0),
            transactions_failed: AtomicU64::new(0),
            transactions_in_flight: AtomicU64::new(0),
        }
    }

    /// Increment transaction received. The request counts as in flight
    /// until the returned guard is dropped.
    pub fn transaction_received(&self) -> InFlightGuard<'_> {
        self.transactions_total.fetch_add(1, Ordering::Relaxed);
        self.transactions_in_flight.fetch_add(1, Ordering::Relaxed);
        InFlightGuard { metrics: self }
    }

    /// Record transaction applied.
    pub fn transaction_applied(&self) {
        self.transactions_applied.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a transaction that ended in `err`.
    pub fn transaction_errored(&self, err: &WalletError) {
        let counter = match err {
            WalletError::InternalError(_) => &self.transactions_failed,
            _ => &self.transactions_rejected,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current metrics snapshot.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            transactions_total: self.transactions_total.load(Ordering::Relaxed),
            transactions_applied: self.transactions_applied.load(Ordering::Relaxed),
            transactions_rejected: self.transactions_rejected.load(Ordering::Relaxed),
            transactions_failed: self.transactions_failed.load(Ordering::Relaxed),
            transactions_in_flight: self.transactions_in_flight.load(Ordering::Relaxed),
        }
    }

    /// Export metrics in Prometheus format.
    pub fn to_prometheus(&self, reconcile: ReconcileStatsSnapshot) -> String {
        let snapshot = self.snapshot();
        format!(
            r#"# HELP wallet_transactions_total Total number of transactions received
# TYPE wallet_transactions_total counter
wallet_transactions_total {}

# HELP wallet_transactions_applied Total transactions applied to a balance
# TYPE wallet_transactions_applied counter
wallet_transactions_applied {}

# HELP wallet_transactions_rejected Total transactions rejected
# TYPE wallet_transactions_rejected counter
wallet_transactions_rejected {}

# HELP wallet_transactions_failed Total transactions failed with an internal error
# TYPE wallet_transactions_failed counter
wallet_transactions_failed {}

# HELP wallet_transactions_in_flight Transactions currently being processed
# TYPE wallet_transactions_in_flight gauge
wallet_transactions_in_flight {}

# HELP wallet_reconcile_runs Total reconciliation batches
# TYPE wallet_reconcile_runs counter
wallet_reconcile_runs {}

# HELP wallet_reconcile_cancelled Total transactions cancelled by reconciliation
# TYPE wallet_reconcile_cancelled counter
wallet_reconcile_cancelled {}

# HELP wallet_reconcile_failures Total reconciliation failures
# TYPE wallet_reconcile_failures counter
wallet_reconcile_failures {}
"#,
            snapshot.transactions_total,
            snapshot.transactions_applied,
            snapshot.transactions_rejected,
            snapshot.transactions_failed,
            snapshot.transactions_in_flight,
            reconcile.runs,
            reconcile.cancelled,
            reconcile.failures,
        )
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Decrements the in-flight gauge on drop, including when the request
/// future is cancelled.
#[must_use = "the request stops counting as in flight when the guard is dropped"]
pub struct InFlightGuard<'a> {
    metrics: &'a Metrics,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.metrics
            .transactions_in_flight
            .fetch_sub(1, Ordering::Relaxed);
    }
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub transactions_total: u64,
    pub transactions_applied: u64,
    pub transactions_rejected: u64,
    pub transactions_failed: u64,
    pub transactions_in_flight: u64,
}

/// Shared metrics instance.
pub type SharedMetrics = Arc<Metrics>;
