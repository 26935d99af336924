//! Wallet Ledger Engine
//!
//! Ledger storage, the balance engine that applies transactions to user
//! balances, and the reconciliation loop that voids stale transactions.

pub mod store;
pub mod postgres;
pub mod memory;
pub mod balance;
pub mod engine;
pub mod reconciler;

pub use store::{CancelOutcome, LedgerStore, StalenessPolicy, StoreError, StoreResult, UnitOfWork};
pub use postgres::PgLedgerStore;
pub use memory::{Fault, InMemoryLedgerStore};
pub use balance::BalanceChange;
pub use engine::BalanceEngine;
pub use reconciler::{
    ReconcileReport, ReconcileStats, ReconcileStatsSnapshot, Reconciler, ReconcilerConfig,
};
