//! Error types returned across the balance engine boundary.

use crate::{ExternalId, UserId};
use rust_decimal::Decimal;
use thiserror::Error;

/// Main error type for wallet ledger operations.
///
/// No raw storage error travels past the balance engine; everything is
/// recovered into one of these kinds.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WalletError {
    /// Referenced user does not exist.
    #[error("user not found: {0}")]
    UserNotFound(UserId),

    /// The idempotency key was already applied.
    #[error("transaction already exists: {0}")]
    TransactionAlreadyExists(ExternalId),

    /// Applying the transaction would drive the balance negative.
    #[error("insufficient balance: balance {balance}, required {required}")]
    InsufficientBalance { balance: Decimal, required: Decimal },

    /// Malformed or out-of-range request field.
    #[error("invalid request: {message}")]
    InvalidRequest {
        message: String,
        field: Option<String>,
    },

    /// Storage or transport failure, including a failed rollback.
    #[error("internal error: {0}")]
    InternalError(String),
}

impl WalletError {
    /// Build a validation error for a specific field.
    pub fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        WalletError::InvalidRequest {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Every kind is a semantic rejection or an opaque failure; none is retried
    /// by the engine.
    pub fn is_retryable(&self) -> bool {
        false
    }

    /// Get error code for responses and logs.
    pub fn error_code(&self) -> &'static str {
        match self {
            WalletError::UserNotFound(_) => "USER_NOT_FOUND",
            WalletError::TransactionAlreadyExists(_) => "TRANSACTION_ALREADY_EXISTS",
            WalletError::InsufficientBalance { .. } => "INSUFFICIENT_BALANCE",
            WalletError::InvalidRequest { .. } => "INVALID_REQUEST",
            WalletError::InternalError(_) => "INTERNAL_ERROR",
        }
    }

    /// Message safe to show to the caller. Internal details stay in the logs.
    pub fn public_message(&self) -> String {
        match self {
            WalletError::UserNotFound(_) => "user not found".to_string(),
            WalletError::TransactionAlreadyExists(_) => "transactionId already exists".to_string(),
            WalletError::InsufficientBalance { .. } => "insufficient balance".to_string(),
            WalletError::InvalidRequest { message, .. } => message.clone(),
            WalletError::InternalError(_) => "internal server error".to_string(),
        }
    }
}

/// Result type alias for wallet ledger operations.
pub type Result<T> = std::result::Result<T, WalletError>;
