//! Wallet Ledger Simulator
//!
//! Drives concurrent transactions against an in-memory ledger and checks that
//! balances stay non-negative and consistent with the ledger rows.

use std::time::Instant;

use clap::Parser;
use rust_decimal::Decimal;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod controller;
mod metrics;
mod scenario;

use controller::SimulationController;
use scenario::Scenario;

/// Wallet ledger simulator CLI
#[derive(Parser, Debug)]
#[command(name = "wallet-simulator")]
#[command(about = "Load and invariant simulator for the wallet ledger")]
struct Args {
    /// Number of users to provision for continuous mode
    #[arg(short, long, default_value = "3")]
    users: usize,

    /// Opening balance of each provisioned user
    #[arg(long, default_value = "100")]
    initial_balance: Decimal,

    /// Scenario to run (basic, overdraw-race, duplicate-storm, reconcile)
    #[arg(short, long)]
    scenario: Option<String>,

    /// Simulation speed multiplier
    #[arg(long, default_value = "1.0")]
    speed: f64,

    /// Random seed for reproducibility
    #[arg(long)]
    seed: Option<u64>,

    /// Run duration in seconds (0 = until Ctrl+C)
    #[arg(long, default_value = "0")]
    duration: u64,

    /// Minimum transaction age before reconciliation cancels it
    #[arg(long, default_value = "0")]
    grace_secs: i64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    anyhow::ensure!(args.speed > 0.0, "speed must be positive");
    anyhow::ensure!(args.grace_secs >= 0, "grace period cannot be negative");

    info!(users = args.users, speed = args.speed, "Starting wallet simulator");

    let controller = SimulationController::new(
        args.users,
        args.initial_balance,
        args.speed,
        args.seed,
        chrono::Duration::seconds(args.grace_secs),
    );

    let started = Instant::now();

    if let Some(scenario_name) = &args.scenario {
        let scenario = Scenario::load(scenario_name)?;
        controller.run_scenario(scenario).await?;
    } else {
        controller.initialize().await?;
        info!("Running until stopped; press Ctrl+C to stop");

        let duration = if args.duration > 0 {
            Some(std::time::Duration::from_secs(args.duration))
        } else {
            None
        };

        controller.run(duration).await?;
    }

    let elapsed = started.elapsed().as_secs_f64();
    let metrics = controller.metrics().await;
    info!(
        total = metrics.total_transactions,
        applied = metrics.applied,
        duplicates = metrics.duplicates,
        insufficient = metrics.insufficient,
        other_rejections = metrics.other_rejections,
        failed = metrics.failed,
        cancelled = metrics.cancelled,
        "Simulation complete"
    );
    info!(
        avg_us = metrics.average_latency_us(),
        p50_us = metrics.p50_latency_us(),
        p99_us = metrics.p99_latency_us(),
        success_rate = metrics.success_rate(),
        throughput = metrics.throughput(elapsed),
        "Latency"
    );

    Ok(())
}
