//! Wallet service configuration.

use std::str::FromStr;
use std::time::Duration;

use wallet_ledger::{ReconcilerConfig, StalenessPolicy};

/// Database configuration.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Connection URL.
    pub url: String,
    /// Pool size.
    pub max_connections: u32,
    /// How long to wait for a pooled connection.
    pub acquire_timeout: Duration,
    /// Apply migrations at startup.
    pub run_migrations: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgres://localhost/wallet".to_string(),
            max_connections: 10,
            acquire_timeout: Duration::from_secs(5),
            run_migrations: true,
        }
    }
}

/// Reconciliation configuration.
#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    /// Run the reconciliation loop at all.
    pub enabled: bool,
    /// Time between batches.
    pub interval: Duration,
    /// Maximum transactions cancelled per batch.
    pub batch_size: usize,
    /// Minimum transaction age before cancellation.
    pub grace_period: Duration,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(1),
            batch_size: 10,
            grace_period: Duration::from_secs(60),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "pretty" | "text" | "console" => Ok(LogFormat::Pretty),
            other => Err(format!("unknown log format: {other}")),
        }
    }
}

/// Main wallet service configuration.
#[derive(Debug, Clone)]
pub struct WalletConfig {
    /// Listen address.
    pub listen_addr: String,
    /// Listen port.
    pub listen_port: u16,
    /// Database configuration.
    pub database: DatabaseConfig,
    /// Reconciliation configuration.
    pub reconcile: ReconcileConfig,
    /// Log level or filter directive.
    pub log_level: String,
    /// Log output format.
    pub log_format: LogFormat,
}

impl Default for WalletConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0".to_string(),
            listen_port: 8080,
            database: DatabaseConfig::default(),
            reconcile: ReconcileConfig::default(),
            log_level: "info".to_string(),
            log_format: LogFormat::Json,
        }
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

impl WalletConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from any key/value source. Unparseable values keep
    /// their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(addr) = lookup("WALLET_LISTEN_ADDR") {
            config.listen_addr = addr;
        }
        if let Some(port) = lookup("WALLET_LISTEN_PORT").and_then(|v| v.parse().ok()) {
            config.listen_port = port;
        }

        if let Some(url) = lookup("DATABASE_URL") {
            config.database.url = url;
        }
        if let Some(max) = lookup("WALLET_DB_MAX_CONNECTIONS").and_then(|v| v.parse().ok()) {
            config.database.max_connections = max;
        }
        if let Some(secs) = lookup("WALLET_DB_ACQUIRE_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
            config.database.acquire_timeout = Duration::from_secs(secs);
        }
        if let Some(run) = lookup("WALLET_RUN_MIGRATIONS").and_then(|v| parse_bool(&v)) {
            config.database.run_migrations = run;
        }

        if let Some(enabled) = lookup("WALLET_RECONCILE_ENABLED").and_then(|v| parse_bool(&v)) {
            config.reconcile.enabled = enabled;
        }
        if let Some(secs) = lookup("WALLET_RECONCILE_INTERVAL_SECS").and_then(|v| v.parse().ok()) {
            config.reconcile.interval = Duration::from_secs(secs);
        }
        if let Some(size) = lookup("WALLET_RECONCILE_BATCH_SIZE").and_then(|v| v.parse().ok()) {
            config.reconcile.batch_size = size;
        }
        if let Some(secs) = lookup("WALLET_RECONCILE_GRACE_SECS").and_then(|v| v.parse().ok()) {
            config.reconcile.grace_period = Duration::from_secs(secs);
        }

        if let Some(level) = lookup("RUST_LOG").or_else(|| lookup("LOG_LEVEL")) {
            config.log_level = level;
        }
        if let Some(format) = lookup("WALLET_LOG_FORMAT").and_then(|v| v.parse().ok()) {
            config.log_format = format;
        }

        config
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.listen_port == 0 {
            return Err("Listen port cannot be 0".to_string());
        }

        if self.database.url.is_empty() {
            return Err("Database URL cannot be empty".to_string());
        }

        if self.database.max_connections == 0 {
            return Err("Database pool needs at least one connection".to_string());
        }

        if self.reconcile.interval.is_zero() {
            return Err("Reconcile interval must be positive".to_string());
        }

        if self.reconcile.batch_size == 0 {
            return Err("Reconcile batch size must be positive".to_string());
        }

        if chrono::Duration::from_std(self.reconcile.grace_period).is_err() {
            return Err("Reconcile grace period is out of range".to_string());
        }

        Ok(())
    }

    /// Socket address string to bind.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.listen_addr, self.listen_port)
    }

    /// Reconciler settings derived from this configuration.
    pub fn reconciler_config(&self) -> ReconcilerConfig {
        let grace_period = chrono::Duration::from_std(self.reconcile.grace_period)
            .unwrap_or_else(|_| wallet_common::constants::reconcile_grace_period());

        ReconcilerConfig {
            interval: self.reconcile.interval,
            policy: StalenessPolicy::new(self.reconcile.batch_size, grace_period),
        }
    }
}
