//! Transaction records and their lifecycle state machine.

use crate::{Amount, ExternalId, TransactionId, UserId};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Direction of a transaction's effect on the balance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionKind {
    /// Credit: the amount is added to the balance.
    Win,
    /// Debit: the amount is subtracted from the balance.
    Lost,
}

impl TransactionKind {
    /// Wire and storage representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionKind::Win => "win",
            TransactionKind::Lost => "lost",
        }
    }

    /// Signed effect of `amount` under this kind.
    pub fn signed(&self, amount: Amount) -> Decimal {
        match self {
            TransactionKind::Win => amount.value(),
            TransactionKind::Lost => -amount.value(),
        }
    }

    /// Balance that results from applying `amount` to `balance`, or `None`
    /// if the result is not representable.
    pub fn apply(&self, balance: Decimal, amount: Amount) -> Option<Decimal> {
        balance.checked_add(self.signed(amount))
    }
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionKind {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "win" => Ok(TransactionKind::Win),
            "lost" => Ok(TransactionKind::Lost),
            other => Err(UnknownVariant {
                field: "state",
                value: other.to_string(),
            }),
        }
    }
}

/// Origin of a transaction, supplied through the `Source-Type` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Game,
    Server,
    Payment,
}

impl SourceType {
    /// All accepted source types.
    pub const ALL: [SourceType; 3] = [SourceType::Game, SourceType::Server, SourceType::Payment];

    /// Wire and storage representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Game => "game",
            SourceType::Server => "server",
            SourceType::Payment => "payment",
        }
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceType {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SourceType::ALL
            .into_iter()
            .find(|source| source.as_str() == s)
            .ok_or_else(|| UnknownVariant {
                field: "Source-Type",
                value: s.to_string(),
            })
    }
}

/// A string that does not name a known enum variant.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {field} value {value:?}")]
pub struct UnknownVariant {
    pub field: &'static str,
    pub value: String,
}

/// Lifecycle status of a ledger transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionStatus {
    /// Applied and not yet voided.
    Active,
    /// Voided by reconciliation. Terminal.
    Cancelled,
}

impl TransactionStatus {
    /// Check if this is a final state.
    pub fn is_final(&self) -> bool {
        matches!(self, TransactionStatus::Cancelled)
    }

    /// Get valid next states from current state.
    pub fn valid_transitions(&self) -> &[TransactionStatus] {
        match self {
            TransactionStatus::Active => &[TransactionStatus::Cancelled],
            TransactionStatus::Cancelled => &[],
        }
    }

    /// Check if transition to given state is valid.
    pub fn can_transition_to(&self, next: TransactionStatus) -> bool {
        self.valid_transitions().contains(&next)
    }
}

/// Error for invalid state transitions.
#[derive(Debug, Clone, thiserror::Error)]
#[error("invalid transition from {from:?} to {to:?}")]
pub struct InvalidTransition {
    pub from: TransactionStatus,
    pub to: TransactionStatus,
}

/// A validated transaction ready to be applied by the balance engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewTransaction {
    /// Idempotency key.
    pub external_id: ExternalId,
    /// Owning user.
    pub user_id: UserId,
    /// Origin of the request.
    pub source_type: SourceType,
    /// Credit or debit.
    pub kind: TransactionKind,
    /// Positive magnitude.
    pub amount: Amount,
}

/// A persisted ledger transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TransactionId,
    pub external_id: ExternalId,
    pub user_id: UserId,
    pub source_type: SourceType,
    pub kind: TransactionKind,
    pub amount: Amount,
    pub created_at: DateTime<Utc>,
    pub cancelled: bool,
    pub cancelled_at: Option<DateTime<Utc>>,
}

impl Transaction {
    /// Materialise a freshly inserted record.
    pub fn from_new(id: TransactionId, record: NewTransaction, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            external_id: record.external_id,
            user_id: record.user_id,
            source_type: record.source_type,
            kind: record.kind,
            amount: record.amount,
            created_at,
            cancelled: false,
            cancelled_at: None,
        }
    }

    /// Current lifecycle status.
    pub fn status(&self) -> TransactionStatus {
        if self.cancelled {
            TransactionStatus::Cancelled
        } else {
            TransactionStatus::Active
        }
    }

    /// Void the transaction. Cancelled records are immutable.
    pub fn cancel(&mut self, at: DateTime<Utc>) -> Result<(), InvalidTransition> {
        let from = self.status();
        if !from.can_transition_to(TransactionStatus::Cancelled) {
            return Err(InvalidTransition {
                from,
                to: TransactionStatus::Cancelled,
            });
        }

        self.cancelled = true;
        self.cancelled_at = Some(at);
        Ok(())
    }
}

/// A wallet holder and their current balance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub balance: Decimal,
}

impl User {
    /// Create a user with the given balance.
    pub fn new(id: impl Into<UserId>, balance: Decimal) -> Self {
        Self {
            id: id.into(),
            balance,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(kind: TransactionKind, amount: i64) -> Transaction {
        Transaction::from_new(
            TransactionId::new(),
            NewTransaction {
                external_id: ExternalId::new("t1"),
                user_id: UserId::new("u1"),
                source_type: SourceType::Game,
                kind,
                amount: Amount::new(Decimal::from(amount)).unwrap(),
            },
            Utc::now(),
        )
    }

    #[test]
    fn test_kind_apply() {
        let seven = Amount::new(Decimal::from(7)).unwrap();
        assert_eq!(TransactionKind::Lost.apply(Decimal::from(10), seven), Some(Decimal::from(3)));
        assert_eq!(TransactionKind::Win.apply(Decimal::from(10), seven), Some(Decimal::from(17)));
        assert_eq!(TransactionKind::Win.apply(Decimal::MAX, seven), None);
    }

    #[test]
    fn test_kind_and_source_parse() {
        assert_eq!("win".parse::<TransactionKind>().unwrap(), TransactionKind::Win);
        assert_eq!("lost".parse::<TransactionKind>().unwrap(), TransactionKind::Lost);
        assert!("draw".parse::<TransactionKind>().is_err());
        assert_eq!("payment".parse::<SourceType>().unwrap(), SourceType::Payment);
        assert!("Game".parse::<SourceType>().is_err());
    }

    #[test]
    fn test_cancel_is_terminal() {
        let mut tx = sample(TransactionKind::Win, 5);
        assert_eq!(tx.status(), TransactionStatus::Active);

        let at = Utc::now();
        tx.cancel(at).unwrap();
        assert_eq!(tx.status(), TransactionStatus::Cancelled);
        assert_eq!(tx.cancelled_at, Some(at));

        // A second cancel must not move the timestamp.
        assert!(tx.cancel(Utc::now()).is_err());
        assert_eq!(tx.cancelled_at, Some(at));
    }

    #[test]
    fn test_valid_transitions() {
        assert!(TransactionStatus::Active.can_transition_to(TransactionStatus::Cancelled));
        assert!(!TransactionStatus::Cancelled.can_transition_to(TransactionStatus::Active));
        assert!(TransactionStatus::Cancelled.is_final());
    }
}
