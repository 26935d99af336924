//! Simulation controller.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, ensure};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::Decimal;
use tokio::sync::{watch, RwLock};
use tracing::{info, warn};

use wallet_common::{
    Amount, ExternalId, NewTransaction, SourceType, TransactionKind, UserId, WalletError,
};
use wallet_ledger::{
    BalanceEngine, InMemoryLedgerStore, Reconciler, ReconcilerConfig, StalenessPolicy,
};

use crate::metrics::SimulationMetrics;
use crate::scenario::{AssertCondition, Expect, Scenario, ScenarioStep};

fn parse_decimal(value: &str) -> anyhow::Result<Decimal> {
    Decimal::from_str(value).map_err(|e| anyhow!("invalid amount {value:?}: {e}"))
}

fn matches_expectation(outcome: &Result<(), WalletError>, expect: Expect) -> bool {
    matches!(
        (outcome, expect),
        (Ok(()), Expect::Applied)
            | (Err(WalletError::TransactionAlreadyExists(_)), Expect::AlreadyExists)
            | (Err(WalletError::InsufficientBalance { .. }), Expect::InsufficientBalance)
            | (Err(WalletError::UserNotFound(_)), Expect::UserNotFound)
    )
}

/// Controls the simulation.
pub struct SimulationController {
    /// Number of users provisioned for continuous mode.
    user_count: usize,
    /// Balance each provisioned user starts with.
    initial_balance: Decimal,
    /// Simulation speed multiplier.
    speed: f64,
    /// Random number generator.
    rng: Arc<RwLock<StdRng>>,
    /// Ledger shared by the engine and the reconciler.
    store: Arc<InMemoryLedgerStore>,
    engine: BalanceEngine<InMemoryLedgerStore>,
    reconciler: Arc<Reconciler<InMemoryLedgerStore>>,
    /// Balance each user was provisioned with.
    opening_balances: Arc<RwLock<HashMap<UserId, Decimal>>>,
    /// Simulation metrics.
    metrics: Arc<RwLock<SimulationMetrics>>,
    /// Running flag.
    running: Arc<RwLock<bool>>,
}

impl SimulationController {
    /// Create a new simulation controller.
    pub fn new(
        user_count: usize,
        initial_balance: Decimal,
        speed: f64,
        seed: Option<u64>,
        grace_period: chrono::Duration,
    ) -> Self {
        let rng = match seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };

        let store = Arc::new(InMemoryLedgerStore::new());
        let reconciler_config = ReconcilerConfig {
            policy: StalenessPolicy {
                grace_period,
                ..StalenessPolicy::default()
            },
            ..ReconcilerConfig::default()
        };

        Self {
            user_count,
            initial_balance,
            speed,
            rng: Arc::new(RwLock::new(rng)),
            engine: BalanceEngine::new(Arc::clone(&store)),
            reconciler: Arc::new(Reconciler::new(Arc::clone(&store), reconciler_config)),
            store,
            opening_balances: Arc::new(RwLock::new(HashMap::new())),
            metrics: Arc::new(RwLock::new(SimulationMetrics::new())),
            running: Arc::new(RwLock::new(false)),
        }
    }

    /// Provision the users used by continuous mode.
    pub async fn initialize(&self) -> anyhow::Result<()> {
        info!(users = self.user_count, balance = %self.initial_balance, "Initializing simulation");

        for i in 1..=self.user_count {
            self.set_balance(UserId::new(i.to_string()), self.initial_balance)
                .await;
        }

        Ok(())
    }

    async fn set_balance(&self, user: UserId, balance: Decimal) {
        self.store.insert_user(user.clone(), balance);
        self.opening_balances.write().await.insert(user, balance);
    }

    /// Run a scenario, then check the ledger invariants.
    pub async fn run_scenario(&self, scenario: Scenario) -> anyhow::Result<()> {
        info!(name = %scenario.name, description = %scenario.description, "Running scenario");

        *self.running.write().await = true;

        for step in &scenario.steps {
            if !*self.running.read().await {
                break;
            }

            self.execute_step(step).await?;
        }

        *self.running.write().await = false;

        self.verify_invariants().await
    }

    /// Run random load until `duration` elapses or Ctrl+C, with the
    /// reconciler running in the background.
    pub async fn run(&self, duration: Option<Duration>) -> anyhow::Result<()> {
        info!("Running simulation in continuous mode");

        let users: Vec<UserId> = self.opening_balances.read().await.keys().cloned().collect();
        ensure!(!users.is_empty(), "No users provisioned");

        *self.running.write().await = true;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let reconciler_handle = Arc::clone(&self.reconciler).spawn(shutdown_rx);

        let engine = self.engine.clone();
        let metrics = Arc::clone(&self.metrics);
        let rng = Arc::clone(&self.rng);
        let running = Arc::clone(&self.running);
        let speed = self.speed;

        let generator = tokio::spawn(async move {
            let mut sequence: u64 = 0;

            while *running.read().await {
                let record = {
                    let mut rng = rng.write().await;
                    let user = users[rng.gen_range(0..users.len())].clone();
                    let kind = if rng.gen_bool(0.5) {
                        TransactionKind::Win
                    } else {
                        TransactionKind::Lost
                    };
                    // Roughly one in twenty submissions replays an earlier id.
                    let external_id = if sequence > 0 && rng.gen_bool(0.05) {
                        format!("sim-{}", rng.gen_range(0..sequence))
                    } else {
                        sequence += 1;
                        format!("sim-{}", sequence - 1)
                    };
                    let cents: i64 = rng.gen_range(1..=2_000);
                    let source_type = SourceType::ALL[rng.gen_range(0..SourceType::ALL.len())];

                    Amount::new(Decimal::new(cents, 2)).map(|amount| NewTransaction {
                        external_id: ExternalId::new(external_id),
                        user_id: user,
                        source_type,
                        kind,
                        amount,
                    })
                };

                let Ok(record) = record else { continue };

                let started = Instant::now();
                let outcome = engine.process(record).await;
                let latency_us = started.elapsed().as_micros() as u64;
                metrics.write().await.record(&outcome, latency_us);

                let delay = Duration::from_micros((10_000.0 / speed) as u64);
                tokio::time::sleep(delay).await;
            }
        });

        match duration {
            Some(d) => tokio::time::sleep(d).await,
            None => tokio::signal::ctrl_c().await?,
        }

        *self.running.write().await = false;
        generator.await?;

        let _ = shutdown_tx.send(true);
        reconciler_handle.await?;
        self.metrics
            .write()
            .await
            .record_cancelled(self.reconciler.stats().snapshot().cancelled as usize);

        self.verify_invariants().await
    }

    /// Execute a single scenario step.
    async fn execute_step(&self, step: &ScenarioStep) -> anyhow::Result<()> {
        match step {
            ScenarioStep::Wait { millis } => {
                let adjusted = (*millis as f64 / self.speed) as u64;
                tokio::time::sleep(Duration::from_millis(adjusted)).await;
            }
            ScenarioStep::SetBalance { user, amount } => {
                self.set_balance(UserId::new(user.as_str()), parse_decimal(amount)?)
                    .await;
            }
            ScenarioStep::Submit {
                transaction_id,
                user,
                kind,
                amount,
                expect,
            } => {
                let record = NewTransaction {
                    external_id: ExternalId::new(transaction_id.as_str()),
                    user_id: UserId::new(user.as_str()),
                    source_type: SourceType::Game,
                    kind: *kind,
                    amount: Amount::parse(amount)?,
                };

                let started = Instant::now();
                let outcome = self.engine.process(record).await.map(|_| ());
                self.metrics
                    .write()
                    .await
                    .record(&outcome, started.elapsed().as_micros() as u64);

                info!(%transaction_id, %user, ?outcome, "Submitted transaction");
                ensure!(
                    matches_expectation(&outcome, *expect),
                    "transaction {transaction_id}: expected {expect:?}, got {outcome:?}"
                );
            }
            ScenarioStep::Burst {
                user,
                kind,
                amount,
                count,
                shared_id,
            } => {
                let amount = Amount::parse(amount)?;
                let handles: Vec<_> = (0..*count)
                    .map(|i| {
                        let engine = self.engine.clone();
                        let metrics = Arc::clone(&self.metrics);
                        let external_id = shared_id
                            .clone()
                            .unwrap_or_else(|| format!("{user}-burst-{i}"));
                        let record = NewTransaction {
                            external_id: ExternalId::new(external_id),
                            user_id: UserId::new(user.as_str()),
                            source_type: SourceType::Server,
                            kind: *kind,
                            amount,
                        };

                        tokio::spawn(async move {
                            let started = Instant::now();
                            let outcome = engine.process(record).await;
                            metrics
                                .write()
                                .await
                                .record(&outcome, started.elapsed().as_micros() as u64);
                            outcome.is_ok()
                        })
                    })
                    .collect();

                let mut applied = 0;
                for handle in handles {
                    if handle.await? {
                        applied += 1;
                    }
                }
                info!(%user, count, applied, "Burst finished");
            }
            ScenarioStep::Reconcile => {
                let report = self.reconciler.run_once().await?;
                self.metrics.write().await.record_cancelled(report.cancelled);
                info!(
                    scanned = report.scanned,
                    cancelled = report.cancelled,
                    "Reconciliation batch"
                );
            }
            ScenarioStep::Assert { condition } => self.check(condition)?,
        }

        Ok(())
    }

    fn check(&self, condition: &AssertCondition) -> anyhow::Result<()> {
        match condition {
            AssertCondition::BalanceEquals { user, amount } => {
                let expected = parse_decimal(amount)?;
                let actual = self
                    .store
                    .balance(&UserId::new(user.as_str()))
                    .ok_or_else(|| anyhow!("user {user} not provisioned"))?;
                ensure!(
                    actual == expected,
                    "balance of {user}: expected {expected}, got {actual}"
                );
            }
            AssertCondition::LedgerRows { user, count } => {
                let actual = self
                    .store
                    .transactions()
                    .iter()
                    .filter(|t| t.user_id.as_str() == user)
                    .count();
                ensure!(
                    actual == *count,
                    "ledger rows of {user}: expected {count}, got {actual}"
                );
            }
            AssertCondition::CancelledRows { count } => {
                let actual = self
                    .store
                    .transactions()
                    .iter()
                    .filter(|t| t.cancelled)
                    .count();
                ensure!(
                    actual == *count,
                    "cancelled rows: expected {count}, got {actual}"
                );
            }
        }

        Ok(())
    }

    /// Every balance is non-negative and equals its opening balance plus the
    /// signed sum of the user's ledger rows.
    pub async fn verify_invariants(&self) -> anyhow::Result<()> {
        let transactions = self.store.transactions();
        let opening = self.opening_balances.read().await;

        for (user, opening_balance) in opening.iter() {
            let balance = self
                .store
                .balance(user)
                .ok_or_else(|| anyhow!("user {user} disappeared"))?;
            if balance < Decimal::ZERO {
                bail!("balance of {user} is negative: {balance}");
            }

            let applied: Decimal = transactions
                .iter()
                .filter(|t| &t.user_id == user)
                .map(|t| t.kind.signed(t.amount))
                .sum();
            if *opening_balance + applied != balance {
                warn!(%user, %balance, %opening_balance, %applied, "Ledger mismatch");
                bail!("balance of {user} does not match its ledger");
            }
        }

        info!(users = opening.len(), rows = transactions.len(), "Invariants hold");
        Ok(())
    }

    /// Get simulation metrics.
    pub async fn metrics(&self) -> SimulationMetrics {
        self.metrics.read().await.clone()
    }
}
