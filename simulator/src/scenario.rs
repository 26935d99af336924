//! Simulation scenarios.

use serde::{Deserialize, Serialize};

use wallet_common::TransactionKind;

/// A simulation scenario.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scenario {
    /// Scenario name.
    pub name: String,
    /// Description.
    pub description: String,
    /// Steps in the scenario.
    pub steps: Vec<ScenarioStep>,
}

/// A step in a scenario.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ScenarioStep {
    /// Wait for a duration.
    Wait { millis: u64 },
    /// Provision a user or reset their balance.
    SetBalance { user: String, amount: String },
    /// Submit one transaction and check its outcome.
    Submit {
        transaction_id: String,
        user: String,
        kind: TransactionKind,
        amount: String,
        expect: Expect,
    },
    /// Submit `count` transactions concurrently. With `shared_id` every
    /// submission reuses the same transaction id.
    Burst {
        user: String,
        kind: TransactionKind,
        amount: String,
        count: usize,
        shared_id: Option<String>,
    },
    /// Run one reconciliation batch.
    Reconcile,
    /// Assert a condition.
    Assert { condition: AssertCondition },
}

/// Expected outcome of a submitted transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Expect {
    Applied,
    AlreadyExists,
    InsufficientBalance,
    UserNotFound,
}

/// Conditions that can be asserted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AssertCondition {
    /// User balance equals.
    BalanceEquals { user: String, amount: String },
    /// Number of ledger rows owned by a user.
    LedgerRows { user: String, count: usize },
    /// Number of cancelled ledger rows overall.
    CancelledRows { count: usize },
}

fn submit(id: &str, user: &str, kind: TransactionKind, amount: &str, expect: Expect) -> ScenarioStep {
    ScenarioStep::Submit {
        transaction_id: id.to_string(),
        user: user.to_string(),
        kind,
        amount: amount.to_string(),
        expect,
    }
}

fn balance(user: &str, amount: &str) -> ScenarioStep {
    ScenarioStep::Assert {
        condition: AssertCondition::BalanceEquals {
            user: user.to_string(),
            amount: amount.to_string(),
        },
    }
}

fn rows(user: &str, count: usize) -> ScenarioStep {
    ScenarioStep::Assert {
        condition: AssertCondition::LedgerRows {
            user: user.to_string(),
            count,
        },
    }
}

fn set_balance(user: &str, amount: &str) -> ScenarioStep {
    ScenarioStep::SetBalance {
        user: user.to_string(),
        amount: amount.to_string(),
    }
}

impl Scenario {
    /// Names accepted by [`Scenario::load`].
    pub const NAMES: [&'static str; 4] = ["basic", "overdraw-race", "duplicate-storm", "reconcile"];

    /// Load a scenario by name.
    pub fn load(name: &str) -> anyhow::Result<Self> {
        match name {
            "basic" => Ok(Self::basic()),
            "overdraw-race" => Ok(Self::overdraw_race()),
            "duplicate-storm" => Ok(Self::duplicate_storm()),
            "reconcile" => Ok(Self::reconcile()),
            _ => Err(anyhow::anyhow!(
                "Unknown scenario: {} (expected one of {})",
                name,
                Self::NAMES.join(", ")
            )),
        }
    }

    /// Win/lost sequence with a duplicate and an overdraw.
    fn basic() -> Self {
        use TransactionKind::{Lost, Win};

        Self {
            name: "basic".to_string(),
            description: "Sequential win/lost transactions with a duplicate and an overdraw"
                .to_string(),
            steps: vec![
                set_balance("basic", "10"),
                submit("basic-t1", "basic", Lost, "7", Expect::Applied),
                balance("basic", "3"),
                submit("basic-t1", "basic", Lost, "7", Expect::AlreadyExists),
                submit("basic-t2", "basic", Lost, "5", Expect::InsufficientBalance),
                balance("basic", "3"),
                submit("basic-t3", "basic", Win, "2", Expect::Applied),
                balance("basic", "5"),
                submit("basic-t4", "nobody", Win, "2", Expect::UserNotFound),
                rows("basic", 2),
            ],
        }
    }

    /// Concurrent debits that jointly overdraw.
    fn overdraw_race() -> Self {
        Self {
            name: "overdraw-race".to_string(),
            description: "Ten concurrent debits of 3 against a balance of 10".to_string(),
            steps: vec![
                set_balance("race", "10"),
                ScenarioStep::Burst {
                    user: "race".to_string(),
                    kind: TransactionKind::Lost,
                    amount: "3".to_string(),
                    count: 10,
                    shared_id: None,
                },
                balance("race", "1"),
                rows("race", 3),
            ],
        }
    }

    /// Many concurrent submissions of one transaction id.
    fn duplicate_storm() -> Self {
        Self {
            name: "duplicate-storm".to_string(),
            description: "Sixteen concurrent credits sharing one transaction id".to_string(),
            steps: vec![
                set_balance("storm", "0"),
                ScenarioStep::Burst {
                    user: "storm".to_string(),
                    kind: TransactionKind::Win,
                    amount: "5".to_string(),
                    count: 16,
                    shared_id: Some("storm-dup".to_string()),
                },
                balance("storm", "5"),
                rows("storm", 1),
            ],
        }
    }

    /// Reconciliation voids uncancelled rows once.
    fn reconcile() -> Self {
        use TransactionKind::Win;

        Self {
            name: "reconcile".to_string(),
            description: "Three transactions cancelled by one batch, none by the next".to_string(),
            steps: vec![
                set_balance("recon", "0"),
                submit("recon-t1", "recon", Win, "1", Expect::Applied),
                submit("recon-t2", "recon", Win, "2", Expect::Applied),
                submit("recon-t3", "recon", Win, "3", Expect::Applied),
                ScenarioStep::Wait { millis: 10 },
                ScenarioStep::Reconcile,
                ScenarioStep::Assert {
                    condition: AssertCondition::CancelledRows { count: 3 },
                },
                ScenarioStep::Reconcile,
                ScenarioStep::Assert {
                    condition: AssertCondition::CancelledRows { count: 3 },
                },
                // Cancellation never revisits the balance.
                balance("recon", "6"),
            ],
        }
    }
}
