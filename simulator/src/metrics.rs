//! Simulation metrics.

use std::collections::VecDeque;

use wallet_common::WalletError;

/// Simulation metrics.
#[derive(Debug, Clone)]
pub struct SimulationMetrics {
    /// Total transactions submitted.
    pub total_transactions: u64,
    /// Transactions applied.
    pub applied: u64,
    /// Rejected as duplicates.
    pub duplicates: u64,
    /// Rejected for insufficient balance.
    pub insufficient: u64,
    /// Any other rejection.
    pub other_rejections: u64,
    /// Internal errors.
    pub failed: u64,
    /// Transactions cancelled by reconciliation.
    pub cancelled: u64,
    /// Latency samples (microseconds).
    latency_samples: VecDeque<u64>,
    /// Maximum samples to keep.
    max_samples: usize,
}

impl SimulationMetrics {
    /// Create new metrics.
    pub fn new() -> Self {
        Self {
            total_transactions: 0,
            applied: 0,
            duplicates: 0,
            insufficient: 0,
            other_rejections: 0,
            failed: 0,
            cancelled: 0,
            latency_samples: VecDeque::with_capacity(10000),
            max_samples: 10000,
        }
    }

    /// Record the outcome of one submission.
    pub fn record<T>(&mut self, outcome: &Result<T, WalletError>, latency_us: u64) {
        self.total_transactions += 1;

        match outcome {
            Ok(_) => self.applied += 1,
            Err(WalletError::TransactionAlreadyExists(_)) => self.duplicates += 1,
            Err(WalletError::InsufficientBalance { .. }) => self.insufficient += 1,
            Err(WalletError::InternalError(_)) => self.failed += 1,
            Err(_) => self.other_rejections += 1,
        }

        if self.latency_samples.len() >= self.max_samples {
            self.latency_samples.pop_front();
        }
        self.latency_samples.push_back(latency_us);
    }

    /// Record transactions cancelled by a reconciliation batch.
    pub fn record_cancelled(&mut self, count: usize) {
        self.cancelled += count as u64;
    }

    /// Get average latency in microseconds.
    pub fn average_latency_us(&self) -> u64 {
        if self.latency_samples.is_empty() {
            return 0;
        }

        let sum: u64 = self.latency_samples.iter().sum();
        sum / self.latency_samples.len() as u64
    }

    /// Get p50 latency.
    pub fn p50_latency_us(&self) -> u64 {
        self.percentile_latency(50)
    }

    /// Get p99 latency.
    pub fn p99_latency_us(&self) -> u64 {
        self.percentile_latency(99)
    }

    fn percentile_latency(&self, percentile: usize) -> u64 {
        if self.latency_samples.is_empty() {
            return 0;
        }

        let mut sorted: Vec<_> = self.latency_samples.iter().copied().collect();
        sorted.sort_unstable();

        let idx = (sorted.len() * percentile / 100).min(sorted.len() - 1);
        sorted[idx]
    }

    /// Fraction of submissions that were applied.
    pub fn success_rate(&self) -> f64 {
        if self.total_transactions == 0 {
            return 0.0;
        }

        self.applied as f64 / self.total_transactions as f64
    }

    /// Get throughput (transactions per second).
    pub fn throughput(&self, duration_secs: f64) -> f64 {
        if duration_secs <= 0.0 {
            return 0.0;
        }

        self.total_transactions as f64 / duration_secs
    }
}

impl Default for SimulationMetrics {
    fn default() -> Self {
        Self::new()
    }
}
