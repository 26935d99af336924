//! In-memory ledger store.
//!
//! Mirrors the locking and constraint behaviour of the PostgreSQL store:
//! one async mutex per user row held by the unit of work until it finishes,
//! staged writes that only become visible on commit, a uniqueness check on
//! external ids that also covers inserts still in flight, and a non-negative
//! balance check. Used by the engine tests and the simulator.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use tokio::sync::OwnedMutexGuard;
use tracing::debug;

use wallet_common::{
    stale_cutoff, ExternalId, NewTransaction, Transaction, TransactionId, User, UserId,
};

use crate::store::{
    CancelOutcome, LedgerStore, StalenessPolicy, StoreError, StoreResult, UnitOfWork,
};

/// Store operations that can be made to fail once, for exercising error paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Fault {
    UpdateBalance,
    InsertTransaction,
    Commit,
    Rollback,
    ListStale,
    Cancel,
}

#[derive(Default)]
struct Ledger {
    transactions: HashMap<TransactionId, Transaction>,
    by_external_id: HashMap<ExternalId, TransactionId>,
}

#[derive(Default)]
struct Inner {
    /// Committed balances.
    balances: DashMap<UserId, Decimal>,
    /// Row locks, one per user.
    row_locks: DashMap<UserId, Arc<tokio::sync::Mutex<()>>>,
    ledger: RwLock<Ledger>,
    /// External ids claimed by units of work that have not finished yet.
    pending_keys: Mutex<HashSet<ExternalId>>,
    faults: Mutex<HashSet<Fault>>,
}

impl Inner {
    fn take_fault(&self, fault: Fault) -> StoreResult<()> {
        if self.faults.lock().remove(&fault) {
            return Err(StoreError::Unavailable(format!("injected {fault:?} failure")));
        }
        Ok(())
    }
}

/// Ledger store held entirely in process memory.
#[derive(Clone, Default)]
pub struct InMemoryLedgerStore {
    inner: Arc<Inner>,
}

impl InMemoryLedgerStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Provision a user, replacing any existing balance.
    pub fn insert_user(&self, user_id: impl Into<UserId>, balance: Decimal) {
        let user_id = user_id.into();
        self.inner
            .row_locks
            .entry(user_id.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())));
        self.inner.balances.insert(user_id, balance);
    }

    /// Insert an already-materialised transaction without touching balances.
    pub fn seed_transaction(&self, transaction: Transaction) {
        let mut ledger = self.inner.ledger.write();
        ledger
            .by_external_id
            .insert(transaction.external_id.clone(), transaction.id);
        ledger.transactions.insert(transaction.id, transaction);
    }

    /// Committed balance of a user.
    pub fn balance(&self, user_id: &UserId) -> Option<Decimal> {
        self.inner.balances.get(user_id).map(|b| *b.value())
    }

    /// Identifiers of every provisioned user.
    pub fn user_ids(&self) -> Vec<UserId> {
        self.inner.balances.iter().map(|e| e.key().clone()).collect()
    }

    /// Snapshot of committed transactions, oldest first.
    pub fn transactions(&self) -> Vec<Transaction> {
        let mut all: Vec<Transaction> = self.inner.ledger.read().transactions.values().cloned().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        all
    }

    /// Arm a one-shot failure of the given operation.
    pub fn inject_fault(&self, fault: Fault) {
        self.inner.faults.lock().insert(fault);
    }
}

/// Unit of work over the in-memory store.
pub struct InMemoryUnitOfWork {
    inner: Arc<Inner>,
    lock: Option<(UserId, OwnedMutexGuard<()>)>,
    staged_balance: Option<Decimal>,
    staged_transactions: Vec<Transaction>,
    reserved_keys: Vec<ExternalId>,
    finished: bool,
}

impl InMemoryUnitOfWork {
    fn new(inner: Arc<Inner>) -> Self {
        Self {
            inner,
            lock: None,
            staged_balance: None,
            staged_transactions: Vec::new(),
            reserved_keys: Vec::new(),
            finished: false,
        }
    }

    fn locked_user(&self) -> Option<&UserId> {
        self.lock.as_ref().map(|(user_id, _)| user_id)
    }

    /// Drop staged writes and release claimed external ids.
    fn discard(&mut self) {
        self.staged_balance = None;
        self.staged_transactions.clear();
        if !self.reserved_keys.is_empty() {
            let mut pending = self.inner.pending_keys.lock();
            for key in self.reserved_keys.drain(..) {
                pending.remove(&key);
            }
        }
        self.finished = true;
    }
}

impl Drop for InMemoryUnitOfWork {
    fn drop(&mut self) {
        if !self.finished {
            self.discard();
        }
    }
}

#[async_trait]
impl UnitOfWork for InMemoryUnitOfWork {
    async fn lock_user_for_update(&mut self, user_id: &UserId) -> StoreResult<User> {
        match self.locked_user() {
            Some(locked) if locked == user_id => {
                let balance = match self.staged_balance {
                    Some(staged) => staged,
                    None => self
                        .inner
                        .balances
                        .get(user_id)
                        .map(|b| *b.value())
                        .ok_or_else(|| StoreError::UserNotFound(user_id.clone()))?,
                };
                return Ok(User::new(user_id.clone(), balance));
            }
            Some(locked) => {
                return Err(StoreError::Unavailable(format!(
                    "unit of work already holds the lock of user {locked}"
                )));
            }
            None => {}
        }

        let row_lock = self
            .inner
            .row_locks
            .get(user_id)
            .map(|l| Arc::clone(l.value()))
            .ok_or_else(|| StoreError::UserNotFound(user_id.clone()))?;

        let guard = row_lock.lock_owned().await;

        let balance = self
            .inner
            .balances
            .get(user_id)
            .map(|b| *b.value())
            .ok_or_else(|| StoreError::UserNotFound(user_id.clone()))?;

        self.lock = Some((user_id.clone(), guard));
        Ok(User::new(user_id.clone(), balance))
    }

    async fn update_user_balance(&mut self, user_id: &UserId, balance: Decimal) -> StoreResult<()> {
        self.inner.take_fault(Fault::UpdateBalance)?;

        if self.locked_user() != Some(user_id) {
            return Err(StoreError::NotLocked(user_id.clone()));
        }
        if balance < Decimal::ZERO {
            return Err(StoreError::ConstraintViolation(
                "users_balance_non_negative".to_string(),
            ));
        }

        self.staged_balance = Some(balance);
        Ok(())
    }

    async fn insert_transaction(&mut self, record: &NewTransaction) -> StoreResult<Transaction> {
        self.inner.take_fault(Fault::InsertTransaction)?;

        if !self.inner.balances.contains_key(&record.user_id) {
            return Err(StoreError::ConstraintViolation(
                "transactions_user_id_fkey".to_string(),
            ));
        }

        {
            let mut pending = self.inner.pending_keys.lock();
            let committed = self
                .inner
                .ledger
                .read()
                .by_external_id
                .contains_key(&record.external_id);

            if committed || pending.contains(&record.external_id) {
                return Err(StoreError::DuplicateExternalId(record.external_id.clone()));
            }
            pending.insert(record.external_id.clone());
        }
        self.reserved_keys.push(record.external_id.clone());

        let transaction = Transaction::from_new(TransactionId::new(), record.clone(), Utc::now());
        self.staged_transactions.push(transaction.clone());
        Ok(transaction)
    }

    async fn commit(mut self) -> StoreResult<()> {
        self.inner.take_fault(Fault::Commit)?;

        {
            let mut pending = self.inner.pending_keys.lock();
            let mut ledger = self.inner.ledger.write();

            if let (Some((user_id, _)), Some(balance)) = (&self.lock, self.staged_balance) {
                self.inner.balances.insert(user_id.clone(), balance);
            }
            for transaction in self.staged_transactions.drain(..) {
                ledger
                    .by_external_id
                    .insert(transaction.external_id.clone(), transaction.id);
                ledger.transactions.insert(transaction.id, transaction);
            }
            for key in self.reserved_keys.drain(..) {
                pending.remove(&key);
            }
        }

        self.finished = true;
        debug!("Unit of work committed");
        Ok(())
    }

    async fn rollback(mut self) -> StoreResult<()> {
        // Writes are discarded even when the rollback itself reports failure,
        // the same way a dropped database connection aborts its transaction.
        self.discard();
        self.inner.take_fault(Fault::Rollback)
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    type Uow = InMemoryUnitOfWork;

    async fn begin(&self) -> StoreResult<InMemoryUnitOfWork> {
        Ok(InMemoryUnitOfWork::new(Arc::clone(&self.inner)))
    }

    async fn exists_transaction(&self, external_id: &ExternalId) -> StoreResult<bool> {
        Ok(self.inner.ledger.read().by_external_id.contains_key(external_id))
    }

    async fn get_user(&self, user_id: &UserId) -> StoreResult<Option<User>> {
        Ok(self.balance(user_id).map(|balance| User::new(user_id.clone(), balance)))
    }

    async fn get_transaction(&self, id: TransactionId) -> StoreResult<Option<Transaction>> {
        Ok(self.inner.ledger.read().transactions.get(&id).cloned())
    }

    async fn list_stale_uncancelled(&self, policy: &StalenessPolicy) -> StoreResult<Vec<Transaction>> {
        self.inner.take_fault(Fault::ListStale)?;

        let cutoff = stale_cutoff(policy.grace_period);
        let mut stale: Vec<Transaction> = self
            .inner
            .ledger
            .read()
            .transactions
            .values()
            .filter(|t| !t.cancelled && t.created_at <= cutoff)
            .cloned()
            .collect();

        stale.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        stale.truncate(policy.limit);
        Ok(stale)
    }

    async fn cancel(&self, id: TransactionId) -> StoreResult<CancelOutcome> {
        self.inner.take_fault(Fault::Cancel)?;

        let mut ledger = self.inner.ledger.write();
        let cancelled = ledger
            .transactions
            .get_mut(&id)
            .is_some_and(|transaction| transaction.cancel(Utc::now()).is_ok());
        if cancelled {
            Ok(CancelOutcome::Cancelled)
        } else {
            Ok(CancelOutcome::AlreadyHandled)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use wallet_common::{Amount, SourceType, TransactionKind};

    fn record(external_id: &str, user_id: &str) -> NewTransaction {
        NewTransaction {
            external_id: ExternalId::new(external_id),
            user_id: UserId::new(user_id),
            source_type: SourceType::Game,
            kind: TransactionKind::Win,
            amount: Amount::new(Decimal::from(1)).unwrap(),
        }
    }

    fn store_with_user(balance: i64) -> (InMemoryLedgerStore, UserId) {
        let store = InMemoryLedgerStore::new();
        store.insert_user("u1", Decimal::from(balance));
        (store, UserId::new("u1"))
    }

    #[tokio::test]
    async fn test_writes_invisible_until_commit() {
        let (store, user) = store_with_user(10);

        let mut uow = store.begin().await.unwrap();
        uow.lock_user_for_update(&user).await.unwrap();
        uow.update_user_balance(&user, Decimal::from(4)).await.unwrap();
        uow.insert_transaction(&record("t1", "u1")).await.unwrap();

        assert_eq!(store.balance(&user), Some(Decimal::from(10)));
        assert!(!store.exists_transaction(&ExternalId::new("t1")).await.unwrap());

        uow.commit().await.unwrap();

        assert_eq!(store.balance(&user), Some(Decimal::from(4)));
        assert!(store.exists_transaction(&ExternalId::new("t1")).await.unwrap());
    }

    #[tokio::test]
    async fn test_rollback_and_drop_discard_writes() {
        let (store, user) = store_with_user(10);

        let mut uow = store.begin().await.unwrap();
        uow.lock_user_for_update(&user).await.unwrap();
        uow.update_user_balance(&user, Decimal::from(1)).await.unwrap();
        uow.insert_transaction(&record("t1", "u1")).await.unwrap();
        uow.rollback().await.unwrap();

        let mut uow = store.begin().await.unwrap();
        uow.lock_user_for_update(&user).await.unwrap();
        uow.insert_transaction(&record("t2", "u1")).await.unwrap();
        drop(uow);

        assert_eq!(store.balance(&user), Some(Decimal::from(10)));
        assert!(store.transactions().is_empty());

        // Both keys were released and can be claimed again.
        let mut uow = store.begin().await.unwrap();
        uow.insert_transaction(&record("t1", "u1")).await.unwrap();
        uow.insert_transaction(&record("t2", "u1")).await.unwrap();
    }

    #[tokio::test]
    async fn test_row_lock_blocks_until_release() {
        let (store, user) = store_with_user(10);

        let mut first = store.begin().await.unwrap();
        first.lock_user_for_update(&user).await.unwrap();

        let mut second = store.begin().await.unwrap();
        let blocked =
            tokio::time::timeout(Duration::from_millis(50), second.lock_user_for_update(&user)).await;
        assert!(blocked.is_err(), "second lock must wait for the first");

        first.update_user_balance(&user, Decimal::from(3)).await.unwrap();
        first.commit().await.unwrap();

        let locked = second.lock_user_for_update(&user).await.unwrap();
        assert_eq!(locked.balance, Decimal::from(3));
    }

    #[tokio::test]
    async fn test_in_flight_external_id_is_unique() {
        let (store, _) = store_with_user(10);
        store.insert_user("u2", Decimal::ZERO);

        let mut first = store.begin().await.unwrap();
        first.insert_transaction(&record("t1", "u1")).await.unwrap();

        let mut second = store.begin().await.unwrap();
        let err = second.insert_transaction(&record("t1", "u2")).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateExternalId(_)));
    }

    #[tokio::test]
    async fn test_constraints() {
        let (store, user) = store_with_user(10);

        let mut uow = store.begin().await.unwrap();
        let err = uow
            .update_user_balance(&user, Decimal::from(1))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotLocked(_)));

        uow.lock_user_for_update(&user).await.unwrap();
        let err = uow
            .update_user_balance(&user, Decimal::from(-1))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::ConstraintViolation(_)));

        let err = uow.insert_transaction(&record("t1", "ghost")).await.unwrap_err();
        assert!(matches!(err, StoreError::ConstraintViolation(_)));

        let err = uow
            .lock_user_for_update(&UserId::new("ghost"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));

        let mut other = store.begin().await.unwrap();
        let err = other
            .lock_user_for_update(&UserId::new("ghost"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::UserNotFound(_)));
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent() {
        let (store, _) = store_with_user(10);
        let mut uow = store.begin().await.unwrap();
        let tx = uow.insert_transaction(&record("t1", "u1")).await.unwrap();
        uow.commit().await.unwrap();

        assert_eq!(store.cancel(tx.id).await.unwrap(), CancelOutcome::Cancelled);
        let first = store.get_transaction(tx.id).await.unwrap().unwrap();

        assert_eq!(store.cancel(tx.id).await.unwrap(), CancelOutcome::AlreadyHandled);
        assert_eq!(
            store.cancel(TransactionId::new()).await.unwrap(),
            CancelOutcome::AlreadyHandled
        );

        let second = store.get_transaction(tx.id).await.unwrap().unwrap();
        assert!(second.cancelled);
        assert_eq!(first.cancelled_at, second.cancelled_at);
    }

    #[tokio::test]
    async fn test_list_stale_newest_first_with_limit() {
        let (store, _) = store_with_user(10);
        let now = Utc::now();

        for (i, age) in [50i64, 10, 30, 5].into_iter().enumerate() {
            let mut tx = Transaction::from_new(
                TransactionId::new(),
                record(&format!("t{i}"), "u1"),
                now - chrono::Duration::minutes(age),
            );
            if age == 5 {
                tx.cancel(now).unwrap();
            }
            store.seed_transaction(tx);
        }

        let policy = StalenessPolicy::new(2, chrono::Duration::minutes(1));
        let stale = store.list_stale_uncancelled(&policy).await.unwrap();
        let ids: Vec<&str> = stale.iter().map(|t| t.external_id.as_str()).collect();
        assert_eq!(ids, vec!["t1", "t2"]);

        let policy = StalenessPolicy::new(10, chrono::Duration::minutes(20));
        let stale = store.list_stale_uncancelled(&policy).await.unwrap();
        let ids: Vec<&str> = stale.iter().map(|t| t.external_id.as_str()).collect();
        assert_eq!(ids, vec!["t2", "t0"]);
    }

    #[tokio::test]
    async fn test_injected_faults_fire_once() {
        let (store, _) = store_with_user(10);
        store.inject_fault(Fault::ListStale);

        let policy = StalenessPolicy::default();
        assert!(store.list_stale_uncancelled(&policy).await.is_err());
        assert!(store.list_stale_uncancelled(&policy).await.is_ok());
    }
}
