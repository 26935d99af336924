//! Wallet Service
//!
//! HTTP delivery surface for the wallet ledger: request validation, the
//! service lifecycle around the balance engine and reconciliation loop,
//! configuration and metrics.

pub mod api;
pub mod config;
pub mod gateway;
pub mod metrics;
pub mod service;
pub mod state;

pub use api::{create_router, AppState};
pub use config::{LogFormat, WalletConfig};
pub use service::WalletService;
pub use state::ServiceState;
