//! Wallet Server Binary
//!
//! Serves the wallet ledger over HTTP and runs the reconciliation loop.

use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wallet_ledger::PgLedgerStore;
use wallet_server::{create_router, AppState, LogFormat, WalletConfig, WalletService};

fn init_tracing(config: &WalletConfig) {
    let filter = tracing_subscriber::EnvFilter::new(&config.log_level);
    let registry = tracing_subscriber::registry().with(filter);

    match config.log_format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer().pretty()).init(),
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = WalletConfig::from_env();
    init_tracing(&config);

    info!("Starting wallet server");

    if let Err(e) = config.validate() {
        error!(error = %e, "Invalid configuration");
        return Err(anyhow::anyhow!("Configuration error: {}", e));
    }

    let store = PgLedgerStore::connect(
        &config.database.url,
        config.database.max_connections,
        config.database.acquire_timeout,
    )
    .await?;

    if config.database.run_migrations {
        store.migrate().await?;
    }

    let service = Arc::new(WalletService::new(
        Arc::new(store),
        config.reconciler_config(),
        config.reconcile.enabled,
    ));
    service.start().await?;

    let router = create_router(AppState {
        service: Arc::clone(&service),
    });
    let listener = tokio::net::TcpListener::bind(config.bind_addr()).await?;

    info!(
        listen_addr = %config.listen_addr,
        listen_port = %config.listen_port,
        "Wallet server running"
    );

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    service.stop().await?;

    info!("Wallet server shutdown complete");
    Ok(())
}
