//! Service state definitions.

use serde::Serialize;

/// Wallet service operational state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    /// Service is starting up.
    Starting,
    /// Service is running and accepting requests.
    Running,
    /// Service is shutting down, not accepting new requests.
    ShuttingDown,
    /// Service is stopped.
    Stopped,
}

impl ServiceState {
    /// Check if the service is accepting new transactions.
    pub fn accepts_requests(&self) -> bool {
        matches!(self, ServiceState::Running)
    }

    /// Check if the service is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ServiceState::Stopped)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceState::Starting => "starting",
            ServiceState::Running => "running",
            ServiceState::ShuttingDown => "shutting_down",
            ServiceState::Stopped => "stopped",
        }
    }
}
