//! Time utilities and constants for the wallet ledger.

use chrono::{DateTime, Duration, Utc};

/// Reconciliation timing constants.
pub mod constants {
    use super::Duration;

    /// Interval between reconciliation runs (1 second).
    pub fn reconcile_interval() -> Duration {
        Duration::seconds(1)
    }

    /// Maximum transactions voided per reconciliation run.
    pub const RECONCILE_BATCH_SIZE: usize = 10;

    /// Minimum age before an uncancelled transaction is voided (60 seconds).
    pub fn reconcile_grace_period() -> Duration {
        Duration::seconds(60)
    }
}

/// A timestamp with timezone (always UTC).
pub type Timestamp = DateTime<Utc>;

/// Get the current timestamp.
pub fn now() -> Timestamp {
    Utc::now()
}

/// Latest creation time a transaction may have to count as stale.
pub fn stale_cutoff(grace_period: Duration) -> Timestamp {
    now() - grace_period
}

/// Check if `created_at` is at least `grace_period` in the past.
pub fn is_stale(created_at: Timestamp, grace_period: Duration) -> bool {
    created_at <= stale_cutoff(grace_period)
}

/// Duration extensions for convenient conversion.
pub trait DurationExt {
    fn as_std(&self) -> std::time::Duration;
}

impl DurationExt for Duration {
    fn as_std(&self) -> std::time::Duration {
        self.to_std().unwrap_or(std::time::Duration::ZERO)
    }
}
