//! Ledger store contract.
//!
//! A [`LedgerStore`] holds user balances and transaction records. Balance
//! mutations happen inside a [`UnitOfWork`]: an all-or-nothing group of
//! operations that owns an exclusive row lock on the user it touched until it
//! commits or rolls back. Dropping a unit of work without committing discards
//! its writes and releases its lock.

use async_trait::async_trait;
use rust_decimal::Decimal;
use thiserror::Error;

use wallet_common::{ExternalId, NewTransaction, Transaction, TransactionId, User, UserId};

/// Errors raised by store implementations. Never surfaced past the engine.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The user row does not exist.
    #[error("user not found: {0}")]
    UserNotFound(UserId),

    /// Uniqueness constraint on the external id fired.
    #[error("duplicate external id: {0}")]
    DuplicateExternalId(ExternalId),

    /// A check or foreign-key constraint fired.
    #[error("constraint violated: {0}")]
    ConstraintViolation(String),

    /// A write was attempted on a user the unit of work has not locked.
    #[error("user {0} is not locked by this unit of work")]
    NotLocked(UserId),

    /// A stored row could not be mapped back into a domain type.
    #[error("corrupt row: {0}")]
    Decode(String),

    /// Underlying database failure.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Schema migration failure.
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// Store refused or failed the operation for a non-database reason.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Result type alias for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Which uncancelled transactions count as stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StalenessPolicy {
    /// Maximum rows returned per listing.
    pub limit: usize,
    /// Minimum age of a transaction before it may be voided.
    pub grace_period: chrono::Duration,
}

impl StalenessPolicy {
    /// Create a policy.
    pub fn new(limit: usize, grace_period: chrono::Duration) -> Self {
        Self {
            limit,
            grace_period,
        }
    }
}

impl Default for StalenessPolicy {
    fn default() -> Self {
        Self {
            limit: wallet_common::constants::RECONCILE_BATCH_SIZE,
            grace_period: wallet_common::constants::reconcile_grace_period(),
        }
    }
}

/// Result of a cancel request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The transaction went from active to cancelled.
    Cancelled,
    /// Already cancelled or missing; nothing changed.
    AlreadyHandled,
}

/// An atomic group of writes holding an exclusive lock on one user row.
#[async_trait]
pub trait UnitOfWork: Send + Sized {
    /// Lock the user row for the rest of the unit of work and read its balance.
    ///
    /// Waits while another unit of work holds the same row.
    async fn lock_user_for_update(&mut self, user_id: &UserId) -> StoreResult<User>;

    /// Write a new balance. Fails with [`StoreError::ConstraintViolation`]
    /// if the balance would be negative.
    async fn update_user_balance(&mut self, user_id: &UserId, balance: Decimal) -> StoreResult<()>;

    /// Append a transaction row. Fails with [`StoreError::DuplicateExternalId`]
    /// if the external id is already taken.
    async fn insert_transaction(&mut self, record: &NewTransaction) -> StoreResult<Transaction>;

    /// Make every write durable and release the lock.
    async fn commit(self) -> StoreResult<()>;

    /// Discard every write and release the lock.
    async fn rollback(self) -> StoreResult<()>;
}

/// Durable storage of users and transactions.
#[async_trait]
pub trait LedgerStore: Send + Sync + 'static {
    /// Unit of work type produced by [`LedgerStore::begin`].
    type Uow: UnitOfWork + 'static;

    /// Open a unit of work.
    async fn begin(&self) -> StoreResult<Self::Uow>;

    /// Check whether a committed transaction carries this external id.
    async fn exists_transaction(&self, external_id: &ExternalId) -> StoreResult<bool>;

    /// Read a user without locking.
    async fn get_user(&self, user_id: &UserId) -> StoreResult<Option<User>>;

    /// Read a transaction by its store id.
    async fn get_transaction(&self, id: TransactionId) -> StoreResult<Option<Transaction>>;

    /// Uncancelled transactions older than the grace period, newest first,
    /// at most `policy.limit` of them.
    async fn list_stale_uncancelled(&self, policy: &StalenessPolicy) -> StoreResult<Vec<Transaction>>;

    /// Mark one transaction cancelled with the current timestamp.
    async fn cancel(&self, id: TransactionId) -> StoreResult<CancelOutcome>;
}
