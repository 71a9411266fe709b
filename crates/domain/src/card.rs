//! The card model — the atomic unit of work.
//!
//! Cards carry a kind (initiative/project/task), a lifecycle status, an
//! assigned role seat, a numeric priority, and a dependency set. Legacy
//! kind names (`rock`/`epic`/`issue`) and string priorities
//! (`High`/`Medium`/`Low`) are migrated on parse.

use std::collections::BTreeSet;
use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Kind
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The three cardinal kinds of work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CardKind {
    Initiative,
    Project,
    Task,
}

impl CardKind {
    /// Parse a kind name, accepting the legacy aliases.
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "initiative" | "rock" => Ok(CardKind::Initiative),
            "project" | "epic" => Ok(CardKind::Project),
            "task" | "issue" => Ok(CardKind::Task),
            other => Err(Error::ConfigInvalid(format!("unknown card kind '{other}'"))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CardKind::Initiative => "initiative",
            CardKind::Project => "project",
            CardKind::Task => "task",
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Status
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Card lifecycle statuses.
///
/// `Blocked` and `WaitingForDeveloper` are the blocked-class statuses and
/// require a [`WaitReason`]. `Done`, `Failed`, and `Archived` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CardStatus {
    New,
    Ready,
    InProgress,
    CodeReview,
    Blocked,
    WaitingForDeveloper,
    Done,
    Failed,
    Archived,
}

impl CardStatus {
    pub fn parse(s: &str) -> Result<Self> {
        serde_json::from_value(serde_json::Value::String(s.to_owned()))
            .map_err(|_| Error::ConfigInvalid(format!("unknown card status '{s}'")))
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CardStatus::New => "NEW",
            CardStatus::Ready => "READY",
            CardStatus::InProgress => "IN_PROGRESS",
            CardStatus::CodeReview => "CODE_REVIEW",
            CardStatus::Blocked => "BLOCKED",
            CardStatus::WaitingForDeveloper => "WAITING_FOR_DEVELOPER",
            CardStatus::Done => "DONE",
            CardStatus::Failed => "FAILED",
            CardStatus::Archived => "ARCHIVED",
        }
    }

    /// Terminal statuses are sinks: no outgoing transitions except the
    /// operator-initiated un-archive.
    pub fn is_terminal(&self) -> bool {
        matches!(self, CardStatus::Done | CardStatus::Failed | CardStatus::Archived)
    }

    /// Statuses that require a wait reason.
    pub fn is_blocked_class(&self) -> bool {
        matches!(self, CardStatus::Blocked | CardStatus::WaitingForDeveloper)
    }

    /// Whether a dependency in this status releases its dependents.
    /// FAILED deliberately does not — dependents stay unready until an
    /// operator re-drives or archives the failed card.
    pub fn satisfies_dependency(&self) -> bool {
        matches!(self, CardStatus::Done | CardStatus::Archived)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Wait reason
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Why a card sits in a blocked-class status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WaitReason {
    Resource,
    Dependency,
    Review,
    Input,
}

impl WaitReason {
    pub fn parse(s: &str) -> Result<Self> {
        serde_json::from_value(serde_json::Value::String(s.to_owned()))
            .map_err(|_| Error::ConfigInvalid(format!("unknown wait reason '{s}'")))
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WaitReason::Resource => "RESOURCE",
            WaitReason::Dependency => "DEPENDENCY",
            WaitReason::Review => "REVIEW",
            WaitReason::Input => "INPUT",
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Priority
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Numeric card priority. 3.0 = high, 2.0 = medium, 1.0 = low.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Priority(pub f64);

impl Priority {
    pub const HIGH: Priority = Priority(3.0);
    pub const MEDIUM: Priority = Priority(2.0);
    pub const LOW: Priority = Priority(1.0);

    /// Migrate a priority value from its persisted/imported form.
    ///
    /// Legacy string labels map to the fixed scale; numeric values pass
    /// through unchanged (re-migration is a no-op).
    pub fn migrate(value: &serde_json::Value) -> Result<Priority> {
        match value {
            serde_json::Value::Number(n) => n
                .as_f64()
                .map(Priority)
                .ok_or_else(|| Error::ConfigInvalid("priority is not a finite number".into())),
            serde_json::Value::String(s) => match s.to_ascii_lowercase().as_str() {
                "high" => Ok(Priority::HIGH),
                "medium" => Ok(Priority::MEDIUM),
                "low" => Ok(Priority::LOW),
                other => Err(Error::ConfigInvalid(format!("unknown priority label '{other}'"))),
            },
            other => Err(Error::ConfigInvalid(format!("priority must be a number or label, got {other}"))),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Card
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The atomic unit of work.
///
/// `id` is immutable and workspace-unique. Mutation happens only through
/// the repository's transition API; `depends_on` must stay acyclic across
/// the workspace (enforced by the repository on edge insert).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Card {
    pub id: String,
    pub kind: CardKind,
    #[serde(default)]
    pub parent_id: Option<String>,
    pub title: String,
    pub status: CardStatus,
    /// Assigned role seat (e.g. `lead_architect`).
    pub role: String,
    pub priority: Priority,
    #[serde(default)]
    pub depends_on: BTreeSet<String>,
    /// Required iff `status` is blocked-class.
    #[serde(default)]
    pub wait_reason: Option<WaitReason>,
    #[serde(default)]
    pub requirements_ref: Option<String>,
    #[serde(default)]
    pub verification_ref: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Card {
    /// Validate the wait-reason invariant: present iff blocked-class.
    pub fn wait_reason_consistent(&self) -> bool {
        self.status.is_blocked_class() == self.wait_reason.is_some()
    }
}
