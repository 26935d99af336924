//! Wallet service: owns the balance engine, the reconciliation task and the
//! service lifecycle.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};

use wallet_common::{NewTransaction, Result, User, UserId, WalletError};
use wallet_ledger::{
    BalanceChange, BalanceEngine, LedgerStore, ReconcileStatsSnapshot, Reconciler,
    ReconcilerConfig,
};

use crate::metrics::{Metrics, SharedMetrics};
use crate::state::ServiceState;

/// The wallet service.
pub struct WalletService<S: LedgerStore> {
    /// Balance engine shared by all requests.
    engine: BalanceEngine<S>,
    /// Reconciler run in the background while the service is running.
    reconciler: Arc<Reconciler<S>>,
    /// Whether `start` spawns the reconciler.
    reconcile_enabled: bool,
    /// Current service state.
    state: Arc<RwLock<ServiceState>>,
    /// Request metrics.
    metrics: SharedMetrics,
    /// Shutdown signal for background tasks.
    shutdown_tx: watch::Sender<bool>,
    /// Handle of the reconciler task.
    reconciler_task: Mutex<Option<JoinHandle<()>>>,
}

impl<S: LedgerStore> WalletService<S> {
    /// Create a new service over `store`.
    pub fn new(store: Arc<S>, reconciler_config: ReconcilerConfig, reconcile_enabled: bool) -> Self {
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            engine: BalanceEngine::new(Arc::clone(&store)),
            reconciler: Arc::new(Reconciler::new(store, reconciler_config)),
            reconcile_enabled,
            state: Arc::new(RwLock::new(ServiceState::Starting)),
            metrics: Arc::new(Metrics::new()),
            shutdown_tx,
            reconciler_task: Mutex::new(None),
        }
    }

    /// Start background tasks and begin accepting requests.
    #[instrument(skip(self))]
    pub async fn start(&self) -> Result<()> {
        if *self.state.read() != ServiceState::Starting {
            return Err(WalletError::InternalError(format!(
                "cannot start service in state {}",
                self.state().as_str()
            )));
        }

        info!(reconcile_enabled = self.reconcile_enabled, "Starting wallet service");

        if self.reconcile_enabled {
            let handle = Arc::clone(&self.reconciler).spawn(self.shutdown_tx.subscribe());
            *self.reconciler_task.lock() = Some(handle);
        } else {
            warn!("Reconciliation disabled");
        }

        *self.state.write() = ServiceState::Running;
        info!("Wallet service started");
        Ok(())
    }

    /// Stop accepting requests and wait for the reconciler to finish its
    /// current batch.
    #[instrument(skip(self))]
    pub async fn stop(&self) -> Result<()> {
        if self.state().is_terminal() {
            return Ok(());
        }

        info!("Stopping wallet service");
        *self.state.write() = ServiceState::ShuttingDown;

        // No receivers just means the reconciler never ran.
        let _ = self.shutdown_tx.send(true);

        let task = self.reconciler_task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!(error = %e, "Reconciler task ended abnormally");
            }
        }

        *self.state.write() = ServiceState::Stopped;
        info!("Wallet service stopped");
        Ok(())
    }

    /// Apply a validated transaction.
    pub async fn process(&self, record: NewTransaction) -> Result<BalanceChange> {
        if !self.is_accepting_requests() {
            return Err(WalletError::InternalError(format!(
                "service is {}",
                self.state().as_str()
            )));
        }

        let _in_flight = self.metrics.transaction_received();
        let result = self.engine.process(record).await;
        match &result {
            Ok(_) => self.metrics.transaction_applied(),
            Err(e) => self.metrics.transaction_errored(e),
        }
        result
    }

    /// Current committed balance of a user.
    pub async fn balance(&self, user_id: &UserId) -> Result<User> {
        self.engine.balance(user_id).await
    }

    /// Get current state.
    pub fn state(&self) -> ServiceState {
        *self.state.read()
    }

    /// Check if the service is accepting requests.
    pub fn is_accepting_requests(&self) -> bool {
        self.state().accepts_requests()
    }

    pub fn metrics(&self) -> &SharedMetrics {
        &self.metrics
    }

    pub fn reconcile_stats(&self) -> ReconcileStatsSnapshot {
        self.reconciler.stats().snapshot()
    }

    /// Metrics in Prometheus text format.
    pub fn prometheus(&self) -> String {
        self.metrics.to_prometheus(self.reconcile_stats())
    }
}
