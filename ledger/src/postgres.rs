//! PostgreSQL ledger store.
//!
//! Row locking uses `SELECT ... FOR UPDATE`; idempotency is enforced by the
//! unique index on `transactions.transaction_id`; non-negativity by the
//! `users_balance_non_negative` check constraint.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{FromRow, Postgres};
use tracing::{debug, info};
use uuid::Uuid;

use wallet_common::{
    Amount, ExternalId, NewTransaction, Transaction, TransactionId, User, UserId,
};

use crate::store::{
    CancelOutcome, LedgerStore, StalenessPolicy, StoreError, StoreResult, UnitOfWork,
};

const TRANSACTION_COLUMNS: &str = "id, user_id, transaction_id, source_type, state, amount, \
     created_at, cancelled, cancelled_at";

#[derive(Debug, FromRow)]
struct UserRow {
    id: String,
    balance: Decimal,
}

impl From<UserRow> for User {
    fn from(row: UserRow) -> Self {
        User::new(row.id, row.balance)
    }
}

#[derive(Debug, FromRow)]
struct TransactionRow {
    id: Uuid,
    user_id: String,
    transaction_id: String,
    source_type: String,
    state: String,
    amount: Decimal,
    created_at: DateTime<Utc>,
    cancelled: bool,
    cancelled_at: Option<DateTime<Utc>>,
}

impl TryFrom<TransactionRow> for Transaction {
    type Error = StoreError;

    fn try_from(row: TransactionRow) -> Result<Self, Self::Error> {
        let id = row.id;
        let decode = move |e: &dyn std::fmt::Display| StoreError::Decode(format!("transaction {id}: {e}"));

        Ok(Transaction {
            id: TransactionId::from_uuid(id),
            external_id: ExternalId::new(row.transaction_id),
            user_id: UserId::new(row.user_id),
            source_type: row.source_type.parse().map_err(|e| decode(&e))?,
            kind: row.state.parse().map_err(|e| decode(&e))?,
            amount: Amount::new(row.amount).map_err(|e| decode(&e))?,
            created_at: row.created_at,
            cancelled: row.cancelled,
            cancelled_at: row.cancelled_at,
        })
    }
}

/// Translate constraint violations into store errors the engine understands.
fn map_write_error(err: sqlx::Error, record: Option<&NewTransaction>) -> StoreError {
    if let sqlx::Error::Database(db) = &err {
        if db.is_unique_violation() {
            if let Some(record) = record {
                return StoreError::DuplicateExternalId(record.external_id.clone());
            }
        }
        if db.is_check_violation() || db.is_foreign_key_violation() {
            return StoreError::ConstraintViolation(
                db.constraint().unwrap_or("unnamed").to_string(),
            );
        }
    }
    StoreError::Database(err)
}

/// Ledger store backed by a PostgreSQL connection pool.
#[derive(Clone)]
pub struct PgLedgerStore {
    pool: PgPool,
}

impl PgLedgerStore {
    /// Connect a new pool.
    pub async fn connect(
        database_url: &str,
        max_connections: u32,
        acquire_timeout: Duration,
    ) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(acquire_timeout)
            .connect(database_url)
            .await?;

        info!(max_connections, "Connected to PostgreSQL");
        Ok(Self { pool })
    }

    /// Wrap an existing pool.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply pending schema migrations.
    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Database migrations applied");
        Ok(())
    }
}

/// A PostgreSQL transaction used as a unit of work.
pub struct PgUnitOfWork {
    tx: sqlx::Transaction<'static, Postgres>,
    locked: Option<UserId>,
}

#[async_trait]
impl UnitOfWork for PgUnitOfWork {
    async fn lock_user_for_update(&mut self, user_id: &UserId) -> StoreResult<User> {
        let row = sqlx::query_as::<_, UserRow>(
            r#"
            SELECT id, balance
            FROM users
            WHERE id = $1
            FOR UPDATE
            "#,
        )
        .bind(user_id.as_str())
        .fetch_optional(&mut *self.tx)
        .await?;

        let user: User = row
            .ok_or_else(|| StoreError::UserNotFound(user_id.clone()))?
            .into();
        self.locked = Some(user.id.clone());
        Ok(user)
    }

    async fn update_user_balance(&mut self, user_id: &UserId, balance: Decimal) -> StoreResult<()> {
        if self.locked.as_ref() != Some(user_id) {
            return Err(StoreError::NotLocked(user_id.clone()));
        }

        let result = sqlx::query(
            r#"
            UPDATE users
            SET balance = $1
            WHERE id = $2
            "#,
        )
        .bind(balance)
        .bind(user_id.as_str())
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_write_error(e, None))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::UserNotFound(user_id.clone()));
        }
        Ok(())
    }

    async fn insert_transaction(&mut self, record: &NewTransaction) -> StoreResult<Transaction> {
        let id = TransactionId::new();

        let created_at = sqlx::query_scalar::<_, DateTime<Utc>>(
            r#"
            INSERT INTO transactions (id, user_id, transaction_id, source_type, state, amount)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING created_at
            "#,
        )
        .bind(*id.as_uuid())
        .bind(record.user_id.as_str())
        .bind(record.external_id.as_str())
        .bind(record.source_type.as_str())
        .bind(record.kind.as_str())
        .bind(record.amount.value())
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|e| map_write_error(e, Some(record)))?;

        Ok(Transaction::from_new(id, record.clone(), created_at))
    }

    async fn commit(self) -> StoreResult<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self) -> StoreResult<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for PgLedgerStore {
    type Uow = PgUnitOfWork;

    async fn begin(&self) -> StoreResult<PgUnitOfWork> {
        let tx = self.pool.begin().await?;
        Ok(PgUnitOfWork { tx, locked: None })
    }

    async fn exists_transaction(&self, external_id: &ExternalId) -> StoreResult<bool> {
        let exists = sqlx::query_scalar::<_, bool>(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM transactions WHERE transaction_id = $1
            )
            "#,
        )
        .bind(external_id.as_str())
        .fetch_one(&self.pool)
        .await?;

        Ok(exists)
    }

    async fn get_user(&self, user_id: &UserId) -> StoreResult<Option<User>> {
        let row = sqlx::query_as::<_, UserRow>("SELECT id, balance FROM users WHERE id = $1")
            .bind(user_id.as_str())
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(User::from))
    }

    async fn get_transaction(&self, id: TransactionId) -> StoreResult<Option<Transaction>> {
        let query = format!("SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE id = $1");
        let row = sqlx::query_as::<_, TransactionRow>(&query)
            .bind(*id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;

        row.map(Transaction::try_from).transpose()
    }

    async fn list_stale_uncancelled(&self, policy: &StalenessPolicy) -> StoreResult<Vec<Transaction>> {
        // The cutoff is computed from the database clock so that every process
        // sharing the store agrees on staleness.
        let grace_secs = policy.grace_period.num_milliseconds() as f64 / 1000.0;
        let query = format!(
            "SELECT {TRANSACTION_COLUMNS} FROM transactions \
             WHERE cancelled = false AND created_at <= NOW() - ($1 * INTERVAL '1 second') \
             ORDER BY created_at DESC \
             LIMIT $2"
        );

        let rows = sqlx::query_as::<_, TransactionRow>(&query)
            .bind(grace_secs)
            .bind(policy.limit as i64)
            .fetch_all(&self.pool)
            .await?;

        debug!(count = rows.len(), "Listed stale transactions");
        rows.into_iter().map(Transaction::try_from).collect()
    }

    async fn cancel(&self, id: TransactionId) -> StoreResult<CancelOutcome> {
        let result = sqlx::query(
            r#"
            UPDATE transactions
            SET cancelled = true, cancelled_at = NOW()
            WHERE id = $1 AND cancelled = false
            "#,
        )
        .bind(*id.as_uuid())
        .execute(&self.pool)
        .await?;

        Ok(if result.rows_affected() == 1 {
            CancelOutcome::Cancelled
        } else {
            CancelOutcome::AlreadyHandled
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::BalanceEngine;
    use std::sync::Arc;
    use wallet_common::{SourceType, TransactionKind, WalletError};

    fn row(state: &str, amount: i64) -> TransactionRow {
        TransactionRow {
            id: Uuid::now_v7(),
            user_id: "u1".to_string(),
            transaction_id: "t1".to_string(),
            source_type: "game".to_string(),
            state: state.to_string(),
            amount: Decimal::from(amount),
            created_at: Utc::now(),
            cancelled: false,
            cancelled_at: None,
        }
    }

    #[test]
    fn test_row_decodes() {
        let tx = Transaction::try_from(row("lost", 7)).unwrap();
        assert_eq!(tx.kind, TransactionKind::Lost);
        assert_eq!(tx.amount.value(), Decimal::from(7));
        assert_eq!(tx.external_id.as_str(), "t1");
    }

    #[test]
    fn test_corrupt_rows_rejected() {
        assert!(matches!(
            Transaction::try_from(row("draw", 7)),
            Err(StoreError::Decode(_))
        ));
        assert!(matches!(
            Transaction::try_from(row("win", 0)),
            Err(StoreError::Decode(_))
        ));
    }

    #[test]
    fn test_non_database_errors_pass_through() {
        assert!(matches!(
            map_write_error(sqlx::Error::RowNotFound, None),
            StoreError::Database(sqlx::Error::RowNotFound)
        ));
    }

    // The tests below need a PostgreSQL server reachable through DATABASE_URL:
    // `cargo test -p wallet-ledger -- --ignored`

    fn record(external_id: &str, user_id: &str, kind: TransactionKind, amount: i64) -> NewTransaction {
        NewTransaction {
            external_id: ExternalId::new(external_id),
            user_id: UserId::new(user_id),
            source_type: SourceType::Payment,
            kind,
            amount: Amount::new(Decimal::from(amount)).unwrap(),
        }
    }

    async fn insert_aged(pool: &PgPool, external_id: &str, age_secs: i64) -> TransactionId {
        let id = TransactionId::new();
        sqlx::query(
            r#"
            INSERT INTO transactions (id, user_id, transaction_id, source_type, state, amount, created_at)
            VALUES ($1, '1', $2, 'game', 'win', 1, NOW() - ($3 * INTERVAL '1 second'))
            "#,
        )
        .bind(*id.as_uuid())
        .bind(external_id)
        .bind(age_secs as f64)
        .execute(pool)
        .await
        .unwrap();
        id
    }

    #[sqlx::test(migrations = "./migrations")]
    #[ignore = "requires DATABASE_URL"]
    async fn test_unique_violation_maps_to_duplicate(pool: PgPool) {
        let store = PgLedgerStore::from_pool(pool);

        let mut uow = store.begin().await.unwrap();
        uow.insert_transaction(&record("t1", "1", TransactionKind::Win, 5))
            .await
            .unwrap();
        uow.commit().await.unwrap();
        assert!(store.exists_transaction(&ExternalId::new("t1")).await.unwrap());

        let mut uow = store.begin().await.unwrap();
        let err = uow
            .insert_transaction(&record("t1", "2", TransactionKind::Win, 5))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateExternalId(ref id) if id.as_str() == "t1"));
        uow.rollback().await.unwrap();
    }

    #[sqlx::test(migrations = "./migrations")]
    #[ignore = "requires DATABASE_URL"]
    async fn test_check_violations_map_to_constraint(pool: PgPool) {
        let store = PgLedgerStore::from_pool(pool);
        let user = UserId::new("1");

        let mut uow = store.begin().await.unwrap();
        assert_eq!(uow.lock_user_for_update(&user).await.unwrap().balance, Decimal::ZERO);
        let err = uow
            .update_user_balance(&user, Decimal::from(-1))
            .await
            .unwrap_err();
        assert!(
            matches!(err, StoreError::ConstraintViolation(ref name) if name == "users_balance_non_negative")
        );
        uow.rollback().await.unwrap();

        let mut uow = store.begin().await.unwrap();
        let err = uow
            .insert_transaction(&record("t1", "nobody", TransactionKind::Win, 5))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::ConstraintViolation(_)));
        uow.rollback().await.unwrap();

        let mut uow = store.begin().await.unwrap();
        let err = uow
            .update_user_balance(&user, Decimal::ONE)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotLocked(_)));
        uow.rollback().await.unwrap();
    }

    #[sqlx::test(migrations = "./migrations")]
    #[ignore = "requires DATABASE_URL"]
    async fn test_stale_cutoff_uses_database_clock(pool: PgPool) {
        let old = insert_aged(&pool, "old", 120).await;
        let older = insert_aged(&pool, "older", 300).await;
        let fresh = insert_aged(&pool, "fresh", 0).await;
        let store = PgLedgerStore::from_pool(pool);

        let graced = StalenessPolicy::new(10, chrono::Duration::seconds(60));
        let ids: Vec<_> = store
            .list_stale_uncancelled(&graced)
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(ids, vec![old, older]);

        let latest = StalenessPolicy::new(2, chrono::Duration::zero());
        let ids: Vec<_> = store
            .list_stale_uncancelled(&latest)
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(ids, vec![fresh, old]);

        assert_eq!(store.cancel(old).await.unwrap(), CancelOutcome::Cancelled);
        let first = store.get_transaction(old).await.unwrap().unwrap();
        assert_eq!(store.cancel(old).await.unwrap(), CancelOutcome::AlreadyHandled);
        let second = store.get_transaction(old).await.unwrap().unwrap();
        assert!(second.cancelled);
        assert_eq!(first.cancelled_at, second.cancelled_at);

        let ids: Vec<_> = store
            .list_stale_uncancelled(&graced)
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(ids, vec![older]);
    }

    #[sqlx::test(migrations = "./migrations")]
    #[ignore = "requires DATABASE_URL"]
    async fn test_engine_over_postgres(pool: PgPool) {
        let store = Arc::new(PgLedgerStore::from_pool(pool));
        let engine = BalanceEngine::new(Arc::clone(&store));

        let change = engine
            .process(record("t1", "1", TransactionKind::Win, 10))
            .await
            .unwrap();
        assert_eq!(change.balance_after, Decimal::from(10));

        let err = engine
            .process(record("t1", "1", TransactionKind::Win, 10))
            .await
            .unwrap_err();
        assert!(matches!(err, WalletError::TransactionAlreadyExists(_)));

        let err = engine
            .process(record("t2", "1", TransactionKind::Lost, 11))
            .await
            .unwrap_err();
        assert!(matches!(err, WalletError::InsufficientBalance { .. }));

        let user = store.get_user(&UserId::new("1")).await.unwrap().unwrap();
        assert_eq!(user.balance, Decimal::from(10));
    }
}
