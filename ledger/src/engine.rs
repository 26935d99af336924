//! Balance engine: applies one transaction to one user's balance inside a
//! single unit of work.

use std::sync::Arc;

use rust_decimal::Decimal;
use tracing::{debug, error, info, instrument, warn};

use wallet_common::{NewTransaction, Result, User, UserId, WalletError};

use crate::balance::BalanceChange;
use crate::store::{LedgerStore, StoreError, UnitOfWork};

fn internal(operation: &str, err: StoreError) -> WalletError {
    WalletError::InternalError(format!("{operation}: {err}"))
}

/// The balance engine serialises balance mutations per user and enforces
/// idempotency and non-negativity.
pub struct BalanceEngine<S: LedgerStore> {
    store: Arc<S>,
}

impl<S: LedgerStore> Clone for BalanceEngine<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<S: LedgerStore> BalanceEngine<S> {
    /// Create a new engine over a shared store.
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// The underlying store.
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Apply a transaction.
    ///
    /// Either the balance update and the ledger row are both committed, or
    /// neither is. Every store failure is mapped to a [`WalletError`].
    #[instrument(
        skip(self, record),
        fields(
            external_id = %record.external_id,
            user_id = %record.user_id,
            kind = %record.kind,
            amount = %record.amount,
        )
    )]
    pub async fn process(&self, record: NewTransaction) -> Result<BalanceChange> {
        if record.amount.value() <= Decimal::ZERO {
            return Err(WalletError::invalid("amount", "amount must be greater than zero"));
        }

        // Fast path only; the unique constraint on insert is authoritative.
        let exists = self
            .store
            .exists_transaction(&record.external_id)
            .await
            .map_err(|e| internal("existence check", e))?;
        if exists {
            info!("Transaction already applied");
            return Err(WalletError::TransactionAlreadyExists(record.external_id));
        }

        let mut uow = self
            .store
            .begin()
            .await
            .map_err(|e| internal("begin unit of work", e))?;

        let user = match uow.lock_user_for_update(&record.user_id).await {
            Ok(user) => user,
            Err(StoreError::UserNotFound(user_id)) => {
                return Err(Self::abort(uow, WalletError::UserNotFound(user_id)).await);
            }
            Err(e) => return Err(Self::abort(uow, internal("lock user", e)).await),
        };

        let Some(candidate) = record.kind.apply(user.balance, record.amount) else {
            error!(balance = %user.balance, "Balance arithmetic overflowed");
            let err = WalletError::InternalError("balance arithmetic overflowed".to_string());
            return Err(Self::abort(uow, err).await);
        };
        if candidate < Decimal::ZERO {
            info!(balance = %user.balance, "Insufficient balance");
            let err = WalletError::InsufficientBalance {
                balance: user.balance,
                required: record.amount.value(),
            };
            return Err(Self::abort(uow, err).await);
        }

        if let Err(e) = uow.update_user_balance(&record.user_id, candidate).await {
            let err = match e {
                StoreError::ConstraintViolation(constraint) => {
                    warn!(%constraint, "Balance constraint rejected update");
                    WalletError::InsufficientBalance {
                        balance: user.balance,
                        required: record.amount.value(),
                    }
                }
                other => internal("update balance", other),
            };
            return Err(Self::abort(uow, err).await);
        }

        let transaction = match uow.insert_transaction(&record).await {
            Ok(transaction) => transaction,
            Err(StoreError::DuplicateExternalId(external_id)) => {
                info!("Lost idempotency race to a concurrent request");
                let err = WalletError::TransactionAlreadyExists(external_id);
                return Err(Self::abort(uow, err).await);
            }
            Err(e) => return Err(Self::abort(uow, internal("insert transaction", e)).await),
        };

        uow.commit().await.map_err(|e| {
            error!(error = %e, "Commit failed");
            internal("commit", e)
        })?;

        info!(
            transaction_id = %transaction.id,
            balance_before = %user.balance,
            balance_after = %candidate,
            "Transaction applied"
        );

        Ok(BalanceChange {
            transaction,
            balance_before: user.balance,
            balance_after: candidate,
        })
    }

    /// Current committed balance of a user.
    pub async fn balance(&self, user_id: &UserId) -> Result<User> {
        self.store
            .get_user(user_id)
            .await
            .map_err(|e| internal("get user", e))?
            .ok_or_else(|| WalletError::UserNotFound(user_id.clone()))
    }

    /// Roll back and return the error to surface. A failed rollback replaces
    /// whatever caused the abort.
    async fn abort(uow: S::Uow, cause: WalletError) -> WalletError {
        match uow.rollback().await {
            Ok(()) => {
                debug!(error_code = cause.error_code(), "Unit of work rolled back");
                cause
            }
            Err(rollback_error) => {
                error!(
                    cause = %cause,
                    rollback_error = %rollback_error,
                    "Rollback failed"
                );
                WalletError::InternalError(format!(
                    "rollback failed: {rollback_error} (while handling: {cause})"
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{Fault, InMemoryLedgerStore};
    use proptest::prelude::*;
    use wallet_common::{Amount, ExternalId, SourceType, TransactionKind};

    fn request(external_id: &str, user_id: &str, kind: TransactionKind, amount: i64) -> NewTransaction {
        NewTransaction {
            external_id: ExternalId::new(external_id),
            user_id: UserId::new(user_id),
            source_type: SourceType::Game,
            kind,
            amount: Amount::new(Decimal::from(amount)).unwrap(),
        }
    }

    fn engine_with_user(balance: i64) -> (BalanceEngine<InMemoryLedgerStore>, Arc<InMemoryLedgerStore>) {
        let store = Arc::new(InMemoryLedgerStore::new());
        store.insert_user("u1", Decimal::from(balance));
        (BalanceEngine::new(Arc::clone(&store)), store)
    }

    fn balance_of(store: &InMemoryLedgerStore) -> Decimal {
        store.balance(&UserId::new("u1")).unwrap()
    }

    #[tokio::test]
    async fn test_win_lost_sequence() {
        let (engine, store) = engine_with_user(10);

        let change = engine
            .process(request("t1", "u1", TransactionKind::Lost, 7))
            .await
            .unwrap();
        assert_eq!(change.balance_after, Decimal::from(3));
        assert_eq!(change.delta(), Decimal::from(-7));

        let err = engine
            .process(request("t1", "u1", TransactionKind::Lost, 7))
            .await
            .unwrap_err();
        assert_eq!(err, WalletError::TransactionAlreadyExists(ExternalId::new("t1")));
        assert_eq!(balance_of(&store), Decimal::from(3));

        let err = engine
            .process(request("t2", "u1", TransactionKind::Lost, 5))
            .await
            .unwrap_err();
        assert!(matches!(err, WalletError::InsufficientBalance { .. }));
        assert_eq!(balance_of(&store), Decimal::from(3));

        engine
            .process(request("t3", "u1", TransactionKind::Win, 2))
            .await
            .unwrap();
        assert_eq!(balance_of(&store), Decimal::from(5));

        let rows: Vec<String> = store
            .transactions()
            .iter()
            .map(|t| t.external_id.to_string())
            .collect();
        assert_eq!(rows, vec!["t1", "t3"]);
    }

    #[tokio::test]
    async fn test_unknown_user() {
        let (engine, store) = engine_with_user(10);

        let err = engine
            .process(request("t1", "nobody", TransactionKind::Win, 1))
            .await
            .unwrap_err();
        assert_eq!(err, WalletError::UserNotFound(UserId::new("nobody")));
        assert!(store.transactions().is_empty());

        let err = engine.balance(&UserId::new("nobody")).await.unwrap_err();
        assert_eq!(err.error_code(), "USER_NOT_FOUND");
    }

    #[tokio::test]
    async fn test_balance_overflow_is_internal_error() {
        let store = Arc::new(InMemoryLedgerStore::new());
        store.insert_user("u1", Decimal::MAX);
        let engine = BalanceEngine::new(Arc::clone(&store));

        let err = engine
            .process(request("t1", "u1", TransactionKind::Win, 10))
            .await
            .unwrap_err();
        assert!(matches!(err, WalletError::InternalError(_)));
        assert_eq!(balance_of(&store), Decimal::MAX);
        assert!(store.transactions().is_empty());

        // The row lock was released by the rollback.
        engine
            .process(request("t2", "u1", TransactionKind::Lost, 10))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_failed_insert_rolls_back_balance() {
        let (engine, store) = engine_with_user(10);
        store.inject_fault(Fault::InsertTransaction);

        let err = engine
            .process(request("t1", "u1", TransactionKind::Lost, 4))
            .await
            .unwrap_err();
        assert!(matches!(err, WalletError::InternalError(_)));
        assert_eq!(balance_of(&store), Decimal::from(10));
        assert!(store.transactions().is_empty());

        // The key was never committed, so a retry goes through.
        engine
            .process(request("t1", "u1", TransactionKind::Lost, 4))
            .await
            .unwrap();
        assert_eq!(balance_of(&store), Decimal::from(6));
    }

    #[tokio::test]
    async fn test_failed_commit_leaves_state_untouched() {
        let (engine, store) = engine_with_user(10);
        store.inject_fault(Fault::Commit);

        let err = engine
            .process(request("t1", "u1", TransactionKind::Win, 4))
            .await
            .unwrap_err();
        assert!(matches!(err, WalletError::InternalError(_)));
        assert_eq!(balance_of(&store), Decimal::from(10));
        assert!(store.transactions().is_empty());
    }

    #[tokio::test]
    async fn test_rollback_failure_is_internal_error() {
        let (engine, store) = engine_with_user(1);
        store.inject_fault(Fault::Rollback);

        // Would otherwise be InsufficientBalance.
        let err = engine
            .process(request("t1", "u1", TransactionKind::Lost, 5))
            .await
            .unwrap_err();
        match err {
            WalletError::InternalError(message) => assert!(message.contains("rollback failed")),
            other => panic!("expected internal error, got {other:?}"),
        }
        assert_eq!(balance_of(&store), Decimal::from(1));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_debits_serialised() {
        let (engine, store) = engine_with_user(10);

        let a = tokio::spawn({
            let engine = engine.clone();
            async move { engine.process(request("a", "u1", TransactionKind::Lost, 6)).await }
        });
        let b = tokio::spawn({
            let engine = engine.clone();
            async move { engine.process(request("b", "u1", TransactionKind::Lost, 6)).await }
        });

        let results = [a.await.unwrap(), b.await.unwrap()];
        let ok = results.iter().filter(|r| r.is_ok()).count();
        let insufficient = results
            .iter()
            .filter(|r| matches!(r, Err(WalletError::InsufficientBalance { .. })))
            .count();

        assert_eq!((ok, insufficient), (1, 1));
        assert_eq!(balance_of(&store), Decimal::from(4));
        assert_eq!(store.transactions().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_duplicates_apply_once() {
        let (engine, store) = engine_with_user(0);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let engine = engine.clone();
                tokio::spawn(async move {
                    engine.process(request("dup", "u1", TransactionKind::Win, 3)).await
                })
            })
            .collect();

        let mut applied = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => applied += 1,
                Err(err) => assert_eq!(err, WalletError::TransactionAlreadyExists(ExternalId::new("dup"))),
            }
        }

        assert_eq!(applied, 1);
        assert_eq!(balance_of(&store), Decimal::from(3));
        assert_eq!(store.transactions().len(), 1);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_concurrent_debits_never_overdraw(
            initial in 0i64..100,
            amounts in prop::collection::vec(1i64..40, 1..12),
        ) {
            let (engine, store) = engine_with_user(initial);

            let results = tokio_test::block_on(futures::future::join_all(
                amounts.iter().enumerate().map(|(i, amount)| {
                    engine.process(request(&format!("t{i}"), "u1", TransactionKind::Lost, *amount))
                }),
            ));

            let final_balance = balance_of(&store);
            prop_assert!(final_balance >= Decimal::ZERO);

            let mut spent = Decimal::ZERO;
            for (amount, result) in amounts.iter().zip(&results) {
                match result {
                    Ok(_) => spent += Decimal::from(*amount),
                    Err(WalletError::InsufficientBalance { .. }) => {
                        // The balance only falls, so a rejected debit also
                        // exceeds what is left at the end.
                        prop_assert!(Decimal::from(*amount) > final_balance);
                    }
                    Err(other) => prop_assert!(false, "unexpected error {:?}", other),
                }
            }

            prop_assert_eq!(final_balance, Decimal::from(initial) - spent);
            prop_assert_eq!(
                store.transactions().len(),
                results.iter().filter(|r| r.is_ok()).count()
            );
        }
    }
}
