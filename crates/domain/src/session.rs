//! Session and turn records — the rows of the session ledger.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::card::{CardStatus, WaitReason};

/// Internal tool call format. Every dialect parser converts the model's
/// surface syntax to/from this.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub call_id: String,
    pub tool_name: String,
    pub arguments: serde_json::Value,
}

/// How a finished session summarises itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionOutcome {
    Completed,
    Failed { reason: String },
    Interrupted,
}

/// One orchestration run over an initiative/project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: String,
    pub target_card_id: String,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    pub turn_count: u32,
    #[serde(default)]
    pub outcome: Option<SessionOutcome>,
}

impl SessionRecord {
    pub fn is_active(&self) -> bool {
        self.ended_at.is_none()
    }
}

/// The transition a turn proposed and what the repository said.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionSummary {
    pub from: CardStatus,
    pub to: CardStatus,
    #[serde(default)]
    pub wait_reason: Option<WaitReason>,
}

/// One model invocation inside a session — a single atomic unit in the
/// audit ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnRecord {
    pub turn_id: String,
    pub session_id: String,
    pub card_id: String,
    pub role: String,
    /// SHA-256 hex of the compiled prompt bytes.
    pub prompt_digest: String,
    /// SHA-256 hex of the raw response bytes.
    pub response_digest: String,
    pub tool_calls: Vec<ToolCall>,
    #[serde(default)]
    pub transition_proposed: Option<TransitionSummary>,
    #[serde(default)]
    pub transition_applied: Option<TransitionSummary>,
    #[serde(default)]
    pub failure_code: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}
