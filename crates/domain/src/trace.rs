use serde::Serialize;

/// Structured trace events emitted across all Orket crates.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event_type")]
pub enum TraceEvent {
    SessionStarted {
        session_id: String,
        target_card_id: String,
    },
    SessionEnded {
        session_id: String,
        outcome: String,
        turn_count: u32,
    },
    CardSelected {
        session_id: String,
        card_id: String,
        weight: f64,
    },
    TurnCompleted {
        turn_id: String,
        card_id: String,
        outcome: String,
        duration_ms: u64,
    },
    TransitionApplied {
        card_id: String,
        from: String,
        to: String,
    },
    ProviderRetry {
        provider: String,
        attempt: u32,
        delay_ms: u64,
        error: String,
    },
    GateViolation {
        card_id: String,
        code: String,
        path: Option<String>,
    },
    BottleneckDiagnostic {
        severity: String,
        dominant_reason: Option<String>,
        blocked_total: usize,
    },
    VerificationFinished {
        card_id: String,
        passed: bool,
        failure_count: usize,
    },
    WebhookAccepted {
        event: String,
        card_id: String,
    },
}

impl TraceEvent {
    pub fn emit(&self) {
        let json = serde_json::to_string(self).unwrap_or_default();
        tracing::info!(trace_event = %json, "ork_event");
    }
}
