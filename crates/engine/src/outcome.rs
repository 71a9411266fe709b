//! The typed result of one turn.

use ork_domain::card::{CardStatus, WaitReason};
use ork_governance::gate::Violation;

/// Everything a turn can come back with. The orchestrator matches this
/// exhaustively — there is no catch-all error path across the turn
/// boundary.
#[derive(Debug, Clone)]
pub enum TurnOutcome {
    /// The proposed transition committed.
    Applied {
        to: CardStatus,
        wait_reason: Option<WaitReason>,
    },
    /// Another loop moved the card first; this turn is superseded.
    StaleState,
    /// Model output did not yield a usable action.
    ParseFailure { issues: Vec<String> },
    /// A tool call was refused by the gate; the turn short-circuited.
    ToolGateViolation(Violation),
    /// The proposed transition is not in the state-machine table.
    IllegalTransition {
        from: CardStatus,
        to: CardStatus,
        reason: String,
    },
    /// Transient provider failure after the in-turn retry budget.
    ProviderTimeout { detail: String },
    /// The provider rejected the request outright (4xx-class).
    ProviderRejected { status: u16, detail: String },
    Cancelled,
    /// Unexpected internal failure (unknown role, storage error, ...).
    Internal { detail: String },
}

impl TurnOutcome {
    /// Stable failure code stored on the turn record (`None` = success).
    pub fn failure_code(&self) -> Option<&'static str> {
        match self {
            TurnOutcome::Applied { .. } => None,
            TurnOutcome::StaleState => Some("SUPERSEDED"),
            TurnOutcome::ParseFailure { .. } => Some("PARSE_FAILURE"),
            TurnOutcome::ToolGateViolation(_) => Some("TOOL_GATE_VIOLATION"),
            TurnOutcome::IllegalTransition { .. } => Some("ILLEGAL_TRANSITION"),
            TurnOutcome::ProviderTimeout { .. } => Some("PROVIDER_TIMEOUT"),
            TurnOutcome::ProviderRejected { .. } => Some("PROVIDER_REJECTED"),
            TurnOutcome::Cancelled => Some("CANCELLED"),
            TurnOutcome::Internal { .. } => Some("INTERNAL"),
        }
    }

    /// Transient outcomes are requeued (with backoff) by the orchestrator.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TurnOutcome::ProviderTimeout { .. } | TurnOutcome::ProviderRejected { .. }
        )
    }
}
