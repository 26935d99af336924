//! # HTTP API
//!
//! Builds the axum router that exposes the wallet service.
//!
//! | Method | Path                              | Description                 |
//! |--------|-----------------------------------|-----------------------------|
//! | POST   | `/api/v1/users/:id/transactions`  | Apply a win/lost transaction |
//! | GET    | `/api/v1/users/:id`               | Current balance of a user   |
//! | GET    | `/health`                         | Liveness and service state  |
//! | GET    | `/metrics`                        | Prometheus counters         |

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::{error, warn};

use wallet_common::{UserId, WalletError};
use wallet_ledger::LedgerStore;

use crate::gateway::{TransactionRequest, SOURCE_TYPE_HEADER};
use crate::service::WalletService;
use crate::state::ServiceState;

/// Shared application state available to all request handlers.
pub struct AppState<S: LedgerStore> {
    pub service: Arc<WalletService<S>>,
}

impl<S: LedgerStore> Clone for AppState<S> {
    fn clone(&self) -> Self {
        Self {
            service: Arc::clone(&self.service),
        }
    }
}

/// Builds the axum [`Router`] with all API routes and request tracing.
pub fn create_router<S: LedgerStore>(state: AppState<S>) -> Router {
    Router::new()
        .route("/api/v1/users/:id/transactions", post(post_transaction::<S>))
        .route("/api/v1/users/:id", get(get_user::<S>))
        .route("/health", get(health_handler::<S>))
        .route("/metrics", get(metrics_handler::<S>))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Error body returned for every non-2xx response.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// HTTP status code.
    pub code: u16,
    /// Stable machine-readable error kind.
    pub error: String,
    pub message: String,
}

/// A [`WalletError`] rendered as an HTTP response.
#[derive(Debug)]
pub struct ApiError(pub WalletError);

impl From<WalletError> for ApiError {
    fn from(err: WalletError) -> Self {
        Self(err)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            WalletError::UserNotFound(_) => StatusCode::NOT_FOUND,
            WalletError::TransactionAlreadyExists(_) => StatusCode::CONFLICT,
            WalletError::InsufficientBalance { .. } => StatusCode::FORBIDDEN,
            WalletError::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
            WalletError::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self.0, "Request failed");
        }

        let body = ErrorResponse {
            code: status.as_u16(),
            error: self.0.error_code().to_string(),
            message: self.0.public_message(),
        };
        (status, Json(body)).into_response()
    }
}

/// Successful transaction response.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionResponse {
    pub transaction_id: String,
    pub balance: Decimal,
}

/// Balance lookup response.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserResponse {
    pub user_id: String,
    pub balance: Decimal,
}

/// Health check response.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub state: String,
}

async fn post_transaction<S: LedgerStore>(
    State(state): State<AppState<S>>,
    Path(user_id): Path<String>,
    headers: HeaderMap,
    body: Result<Json<TransactionRequest>, JsonRejection>,
) -> Result<Json<TransactionResponse>, ApiError> {
    let Json(request) = body.map_err(|rejection| {
        warn!(error = %rejection.body_text(), "Malformed transaction body");
        WalletError::InvalidRequest {
            message: rejection.body_text(),
            field: None,
        }
    })?;

    let source_type = headers
        .get(SOURCE_TYPE_HEADER)
        .and_then(|value| value.to_str().ok());

    let record = request.validate(&user_id, source_type)?;
    let change = state.service.process(record).await?;

    Ok(Json(TransactionResponse {
        transaction_id: change.transaction.external_id.to_string(),
        balance: change.balance_after,
    }))
}

async fn get_user<S: LedgerStore>(
    State(state): State<AppState<S>>,
    Path(user_id): Path<String>,
) -> Result<Json<UserResponse>, ApiError> {
    let user = state.service.balance(&UserId::new(user_id)).await?;

    Ok(Json(UserResponse {
        user_id: user.id.to_string(),
        balance: user.balance,
    }))
}

async fn health_handler<S: LedgerStore>(State(state): State<AppState<S>>) -> impl IntoResponse {
    let service_state = state.service.state();
    let (status, label) = if service_state == ServiceState::Running {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "unavailable")
    };

    (
        status,
        Json(HealthResponse {
            status: label.to_string(),
            state: service_state.as_str().to_string(),
        }),
    )
}

async fn metrics_handler<S: LedgerStore>(State(state): State<AppState<S>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.service.prometheus(),
    )
}
