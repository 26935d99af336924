//! Balance change tracking.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use wallet_common::{Transaction, UserId};

/// Outcome of applying one transaction to a user's balance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceChange {
    /// The ledger row written alongside the balance update.
    pub transaction: Transaction,
    /// Balance read under the row lock.
    pub balance_before: Decimal,
    /// Balance committed.
    pub balance_after: Decimal,
}

impl BalanceChange {
    /// Owning user.
    pub fn user_id(&self) -> &UserId {
        &self.transaction.user_id
    }

    /// Signed difference applied to the balance.
    pub fn delta(&self) -> Decimal {
        self.balance_after - self.balance_before
    }
}
