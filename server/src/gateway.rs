//! Transaction gateway: turns an inbound request into a validated
//! [`NewTransaction`].

use rust_decimal::Decimal;
use serde::Deserialize;

use wallet_common::{
    Amount, AmountError, ExternalId, NewTransaction, Result, SourceType, TransactionKind, UserId,
    WalletError,
};

/// Header carrying the request origin.
pub const SOURCE_TYPE_HEADER: &str = "Source-Type";

/// Request body as received. Every field is optional so that a missing field
/// is reported by name instead of as a generic decode failure.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionRequest {
    pub transaction_id: Option<String>,
    pub state: Option<String>,
    pub amount: Option<Decimal>,
}

impl TransactionRequest {
    /// Validate the request for `user_id` with the given `Source-Type` value.
    pub fn validate(self, user_id: &str, source_type: Option<&str>) -> Result<NewTransaction> {
        let user_id = UserId::new(user_id);
        if !user_id.is_valid() {
            return Err(WalletError::invalid("userId", "invalid user id"));
        }

        let source_type = source_type
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| {
                WalletError::invalid(SOURCE_TYPE_HEADER, "missing Source-Type header")
            })?
            .to_ascii_lowercase()
            .parse::<SourceType>()
            .map_err(|e| WalletError::invalid(SOURCE_TYPE_HEADER, e.to_string()))?;

        let external_id = ExternalId::new(
            self.transaction_id
                .ok_or_else(|| WalletError::invalid("transactionId", "transactionId is required"))?,
        );
        if !external_id.is_valid() {
            return Err(WalletError::invalid(
                "transactionId",
                format!(
                    "transactionId must be non-blank and at most {} characters",
                    ExternalId::MAX_LEN
                ),
            ));
        }

        let kind = self
            .state
            .ok_or_else(|| WalletError::invalid("state", "state is required"))?
            .parse::<TransactionKind>()
            .map_err(|e| WalletError::invalid("state", e.to_string()))?;

        let amount = self
            .amount
            .ok_or_else(|| WalletError::invalid("amount", "amount is required"))?;
        let amount = Amount::new(amount).map_err(|e| {
            let message = match e {
                AmountError::NotPositive(_) => "amount must be greater than zero".to_string(),
                other => other.to_string(),
            };
            WalletError::invalid("amount", message)
        })?;

        Ok(NewTransaction {
            external_id,
            user_id,
            source_type,
            kind,
            amount,
        })
    }
}
