//! The turn executor — one card activation, end to end.
//!
//! One turn = one atomic unit: load snapshot, compile prompt, invoke the
//! provider, parse, govern, apply side effects, propose the transition,
//! and append the turn record. Every failure mode is a typed
//! [`TurnOutcome`] variant; nothing is swallowed and nothing is retried
//! here — retry policy belongs to the orchestrator.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use ork_dialect::{parse, CompiledPrompt, ContextEntry, PromptCompiler, ToolSpec};
use ork_domain::card::{Card, CardStatus, WaitReason};
use ork_domain::clock::{new_turn_id, SharedClock};
use ork_domain::digest::sha256_hex;
use ork_domain::role::{Dialect, Role};
use ork_domain::session::{ToolCall, TransitionSummary, TurnRecord};
use ork_domain::trace::TraceEvent;
use ork_governance::gate::{GateContext, ToolGate};
use ork_providers::{
    complete_with_retry, CancelToken, CompletionRequest, ModelProvider, ProviderError,
    RetryPolicy,
};
use ork_repository::{CardStore, SessionLedger, TransitionOutcome, TransitionRequest};

use crate::effects::ToolEffects;
use crate::outcome::TurnOutcome;

/// What one execution hands back to the orchestrator.
#[derive(Debug)]
pub struct TurnReport {
    pub turn_id: String,
    pub card_id: String,
    pub outcome: TurnOutcome,
}

pub struct TurnExecutor {
    store: Arc<CardStore>,
    ledger: Arc<SessionLedger>,
    provider: Arc<dyn ModelProvider>,
    compiler: PromptCompiler,
    gate: Arc<ToolGate>,
    effects: ToolEffects,
    roles: HashMap<String, Role>,
    dialect: Dialect,
    tools: Vec<ToolSpec>,
    retry: RetryPolicy,
    turn_timeout: Duration,
    clock: SharedClock,
}

impl TurnExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<CardStore>,
        ledger: Arc<SessionLedger>,
        provider: Arc<dyn ModelProvider>,
        compiler: PromptCompiler,
        gate: Arc<ToolGate>,
        effects: ToolEffects,
        roles: HashMap<String, Role>,
        dialect: Dialect,
        tools: Vec<ToolSpec>,
        retry: RetryPolicy,
        turn_timeout: Duration,
        clock: SharedClock,
    ) -> Self {
        Self {
            store,
            ledger,
            provider,
            compiler,
            gate,
            effects,
            roles,
            dialect,
            tools,
            retry,
            turn_timeout,
            clock,
        }
    }

    /// Execute one turn against a card the orchestrator already moved to
    /// IN_PROGRESS.
    pub async fn execute(
        &self,
        card_id: &str,
        session_id: &str,
        cancel: &CancelToken,
    ) -> TurnReport {
        let turn_id = new_turn_id();
        let started_at = self.clock.now();

        // 1. Load the snapshot S0.
        let card = match self.store.get_card(card_id) {
            Ok(card) => card,
            Err(e) => {
                return self.report_early(
                    &turn_id,
                    card_id,
                    session_id,
                    TurnOutcome::Internal {
                        detail: format!("loading card: {e}"),
                    },
                );
            }
        };

        let Some(role) = self.roles.get(&card.role) else {
            return self.report_early(
                &turn_id,
                card_id,
                session_id,
                TurnOutcome::Internal {
                    detail: format!("unknown role '{}'", card.role),
                },
            );
        };

        // 2. Compile the prompt from role, dialect, card, recent context.
        let recent = self.recent_context(session_id);
        let prompt = self
            .compiler
            .compile(role, &self.dialect, &card, &recent, &self.tools);

        // 3. Invoke the provider under cancellation and the turn timeout.
        let completion = match self
            .invoke_provider(&prompt, session_id, cancel)
            .await
        {
            Ok(c) => c,
            Err(outcome) => {
                return self.finish(
                    &turn_id,
                    &card,
                    session_id,
                    &prompt,
                    "",
                    Vec::new(),
                    None,
                    None,
                    outcome,
                    started_at,
                );
            }
        };

        // 4. Parse tool calls; any issue fails the turn.
        let parsed = parse(&completion.text, &self.dialect, &self.tools);
        if !parsed.is_clean() {
            let issues = parsed
                .issues
                .iter()
                .map(|i| format!("{i:?}"))
                .collect::<Vec<_>>();
            return self.finish(
                &turn_id,
                &card,
                session_id,
                &prompt,
                &completion.text,
                parsed.calls,
                None,
                None,
                TurnOutcome::ParseFailure { issues },
                started_at,
            );
        }

        // 5. The turn must declare its transition via set_status.
        let declared = match extract_declaration(&parsed.calls) {
            Ok(d) => d,
            Err(issue) => {
                return self.finish(
                    &turn_id,
                    &card,
                    session_id,
                    &prompt,
                    &completion.text,
                    parsed.calls,
                    None,
                    None,
                    TurnOutcome::ParseFailure {
                        issues: vec![issue],
                    },
                    started_at,
                );
            }
        };
        let proposed = TransitionSummary {
            from: card.status,
            to: declared.to,
            wait_reason: declared.wait_reason,
        };

        // 6. Gate and apply each tool call in order; first denial
        //    short-circuits the turn before the next side effect.
        let gate_ctx = GateContext {
            role,
            sandbox_root: self.effects.sandbox_root(),
            initiative_child_count: self.initiative_child_count(&card),
        };
        for call in &parsed.calls {
            if cancel.is_cancelled() {
                return self.finish(
                    &turn_id,
                    &card,
                    session_id,
                    &prompt,
                    &completion.text,
                    parsed.calls.clone(),
                    Some(proposed.clone()),
                    None,
                    TurnOutcome::Cancelled,
                    started_at,
                );
            }

            if let Err(violation) = self.gate.review(call, &gate_ctx) {
                TraceEvent::GateViolation {
                    card_id: card.id.clone(),
                    code: format!("{:?}", violation.code),
                    path: violation.path.as_ref().map(|p| p.display().to_string()),
                }
                .emit();
                return self.finish(
                    &turn_id,
                    &card,
                    session_id,
                    &prompt,
                    &completion.text,
                    parsed.calls.clone(),
                    Some(proposed.clone()),
                    None,
                    TurnOutcome::ToolGateViolation(violation),
                    started_at,
                );
            }

            if let Err(e) = self.apply_side_effect(call, &turn_id).await {
                return self.finish(
                    &turn_id,
                    &card,
                    session_id,
                    &prompt,
                    &completion.text,
                    parsed.calls.clone(),
                    Some(proposed.clone()),
                    None,
                    TurnOutcome::Internal { detail: e },
                    started_at,
                );
            }
        }

        // 7. Propose the transition with optimistic concurrency on S0.
        let request = TransitionRequest {
            card_id: card.id.clone(),
            from: card.status,
            to: declared.to,
            acting_roles: std::iter::once(card.role.clone()).collect(),
            wait_reason: declared.wait_reason,
            detail: serde_json::json!({ "turn_id": turn_id }),
            at: self.clock.now(),
        };
        let (outcome, applied) = match self.store.propose_transition(&request) {
            Ok(TransitionOutcome::Applied) => {
                TraceEvent::TransitionApplied {
                    card_id: card.id.clone(),
                    from: card.status.as_str().into(),
                    to: declared.to.as_str().into(),
                }
                .emit();
                (
                    TurnOutcome::Applied {
                        to: declared.to,
                        wait_reason: declared.wait_reason,
                    },
                    Some(proposed.clone()),
                )
            }
            // Superseded by a racing loop: do not retry here.
            Ok(TransitionOutcome::StaleState { .. }) => (TurnOutcome::StaleState, None),
            Ok(TransitionOutcome::IllegalTransition { from, to, reason }) => {
                (TurnOutcome::IllegalTransition { from, to, reason }, None)
            }
            Ok(TransitionOutcome::RoleDenied { .. }) => (
                TurnOutcome::IllegalTransition {
                    from: card.status,
                    to: declared.to,
                    reason: "role_denied".into(),
                },
                None,
            ),
            Err(e) => (
                TurnOutcome::Internal {
                    detail: format!("transition commit: {e}"),
                },
                None,
            ),
        };

        // 8. Append the turn record.
        self.finish(
            &turn_id,
            &card,
            session_id,
            &prompt,
            &completion.text,
            parsed.calls,
            Some(proposed),
            applied,
            outcome,
            started_at,
        )
    }

    // ── Internals ──────────────────────────────────────────────────

    async fn invoke_provider(
        &self,
        prompt: &CompiledPrompt,
        session_id: &str,
        cancel: &CancelToken,
    ) -> Result<ork_providers::Completion, TurnOutcome> {
        let request = CompletionRequest {
            prompt: prompt.text.clone(),
            ..Default::default()
        };
        let ledger = &self.ledger;
        let clock = &self.clock;
        let provider_id = self.provider.provider_id().to_owned();

        let attempt = complete_with_retry(
            self.provider.as_ref(),
            &request,
            cancel,
            self.retry,
            |attempt, delay, error| {
                TraceEvent::ProviderRetry {
                    provider: provider_id.clone(),
                    attempt,
                    delay_ms: delay.as_millis() as u64,
                    error: error.to_string(),
                }
                .emit();
                if let Err(e) = ledger.append_event(
                    session_id,
                    clock.now(),
                    "provider_retry",
                    &serde_json::json!({
                        "attempt": attempt,
                        "delay_ms": delay.as_millis() as u64,
                        "error": error.to_string(),
                    }),
                ) {
                    tracing::warn!(error = %e, "failed to record retry event");
                }
            },
        );

        match tokio::time::timeout(self.turn_timeout, attempt).await {
            Ok(Ok(completion)) => Ok(completion),
            Ok(Err(ProviderError::Cancelled)) => Err(TurnOutcome::Cancelled),
            Ok(Err(ProviderError::Rejected { status, message })) => {
                Err(TurnOutcome::ProviderRejected {
                    status,
                    detail: message,
                })
            }
            Ok(Err(e)) => Err(TurnOutcome::ProviderTimeout {
                detail: e.to_string(),
            }),
            Err(_) => Err(TurnOutcome::ProviderTimeout {
                detail: format!("turn exceeded {:?}", self.turn_timeout),
            }),
        }
    }

    async fn apply_side_effect(&self, call: &ToolCall, turn_id: &str) -> Result<(), String> {
        match call.tool_name.as_str() {
            "write_file" => {
                let path = call.arguments["path"].as_str().unwrap_or_default();
                let content = call.arguments["content"].as_str().unwrap_or_default();
                self.effects
                    .write_file(path, content, turn_id)
                    .await
                    .map(|_| ())
                    .map_err(|e| e.to_string())
            }
            "read_card" => {
                let id = call.arguments["card_id"].as_str().unwrap_or_default();
                // The snapshot feeds the next turn's context window; the
                // read itself is the auditable effect.
                self.effects.read_card(id).map(|_| ()).map_err(|e| e.to_string())
            }
            // Interpreted by the executor, no side effect.
            "set_status" => Ok(()),
            other => Err(format!("no effect handler for tool '{other}'")),
        }
    }

    /// Recent-session window: turns and checkpoint events merged in time
    /// order.
    fn recent_context(&self, session_id: &str) -> Vec<ContextEntry> {
        let Ok(snapshot) = self.ledger.snapshot(session_id) else {
            return Vec::new();
        };
        let mut entries: Vec<(chrono::DateTime<chrono::Utc>, ContextEntry)> = Vec::new();
        for turn in &snapshot.turns {
            let outcome = turn.failure_code.as_deref().unwrap_or("applied");
            entries.push((
                turn.started_at,
                ContextEntry {
                    kind: "turn".into(),
                    text: format!("card {} ({}): {outcome}", turn.card_id, turn.role),
                },
            ));
        }
        for event in &snapshot.events {
            if event.kind == "checkpoint" {
                entries.push((
                    event.at,
                    ContextEntry {
                        kind: "checkpoint".into(),
                        text: format!("checkpoint at turn {}", event.detail["turn_count"]),
                    },
                ));
            }
        }
        entries.sort_by_key(|(at, _)| *at);
        entries.into_iter().map(|(_, e)| e).collect()
    }

    /// Direct child count of the card's owning initiative (complexity
    /// gate input). Walks the parent chain to the root.
    fn initiative_child_count(&self, card: &Card) -> usize {
        let mut root_id = card.id.clone();
        let mut parent = card.parent_id.clone();
        let mut hops = 0;
        while let Some(pid) = parent {
            if hops > 16 {
                break;
            }
            hops += 1;
            match self.store.get_card(&pid) {
                Ok(p) => {
                    root_id = p.id.clone();
                    parent = p.parent_id;
                }
                Err(_) => break,
            }
        }
        self.store.child_count(&root_id).unwrap_or(0)
    }

    /// Failure before the prompt existed (card/role missing).
    fn report_early(
        &self,
        turn_id: &str,
        card_id: &str,
        session_id: &str,
        outcome: TurnOutcome,
    ) -> TurnReport {
        let now = self.clock.now();
        let record = TurnRecord {
            turn_id: turn_id.to_owned(),
            session_id: session_id.to_owned(),
            card_id: card_id.to_owned(),
            role: String::new(),
            prompt_digest: String::new(),
            response_digest: String::new(),
            tool_calls: Vec::new(),
            transition_proposed: None,
            transition_applied: None,
            failure_code: outcome.failure_code().map(str::to_owned),
            started_at: now,
            ended_at: now,
        };
        if let Err(e) = self.ledger.append_turn(&record) {
            tracing::error!(error = %e, turn_id, "failed to append turn record");
        }
        TurnReport {
            turn_id: turn_id.to_owned(),
            card_id: card_id.to_owned(),
            outcome,
        }
    }

    /// Append the turn record and close out the report.
    #[allow(clippy::too_many_arguments)]
    fn finish(
        &self,
        turn_id: &str,
        card: &Card,
        session_id: &str,
        prompt: &CompiledPrompt,
        response_text: &str,
        tool_calls: Vec<ToolCall>,
        proposed: Option<TransitionSummary>,
        applied: Option<TransitionSummary>,
        outcome: TurnOutcome,
        started_at: chrono::DateTime<chrono::Utc>,
    ) -> TurnReport {
        let ended_at = self.clock.now();
        let record = TurnRecord {
            turn_id: turn_id.to_owned(),
            session_id: session_id.to_owned(),
            card_id: card.id.clone(),
            role: card.role.clone(),
            prompt_digest: prompt.digest.clone(),
            response_digest: sha256_hex(response_text.as_bytes()),
            tool_calls,
            transition_proposed: proposed,
            transition_applied: applied,
            failure_code: outcome.failure_code().map(str::to_owned),
            started_at,
            ended_at,
        };
        if let Err(e) = self.ledger.append_turn(&record) {
            tracing::error!(error = %e, turn_id, "failed to append turn record");
        }

        TraceEvent::TurnCompleted {
            turn_id: turn_id.to_owned(),
            card_id: card.id.clone(),
            outcome: outcome.failure_code().unwrap_or("APPLIED").to_owned(),
            duration_ms: (ended_at - started_at).num_milliseconds().max(0) as u64,
        }
        .emit();

        TurnReport {
            turn_id: turn_id.to_owned(),
            card_id: card.id.clone(),
            outcome,
        }
    }
}

/// The transition a turn declared through its `set_status` call.
#[derive(Debug)]
struct Declaration {
    to: CardStatus,
    wait_reason: Option<WaitReason>,
}

fn extract_declaration(calls: &[ToolCall]) -> Result<Declaration, String> {
    let call = calls
        .iter()
        .rev()
        .find(|c| c.tool_name == "set_status")
        .ok_or_else(|| "MissingStatusDeclaration".to_owned())?;

    let to = call.arguments["to"]
        .as_str()
        .ok_or_else(|| "MalformedStatusDeclaration".to_owned())
        .and_then(|s| {
            CardStatus::parse(s).map_err(|_| format!("UnknownStatus: {s}"))
        })?;

    let wait_reason = match call.arguments.get("wait_reason").and_then(|v| v.as_str()) {
        Some(raw) => Some(
            WaitReason::parse(raw).map_err(|_| format!("UnknownWaitReason: {raw}"))?,
        ),
        None => None,
    };

    Ok(Declaration { to, wait_reason })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn declaration_uses_last_set_status() {
        let calls = vec![
            ToolCall {
                call_id: "c1".into(),
                tool_name: "set_status".into(),
                arguments: serde_json::json!({"to": "BLOCKED", "wait_reason": "INPUT"}),
            },
            ToolCall {
                call_id: "c2".into(),
                tool_name: "set_status".into(),
                arguments: serde_json::json!({"to": "DONE"}),
            },
        ];
        let d = extract_declaration(&calls).unwrap();
        assert_eq!(d.to, CardStatus::Done);
        assert_eq!(d.wait_reason, None);
    }

    #[test]
    fn missing_declaration_is_reported() {
        let calls = vec![ToolCall {
            call_id: "c1".into(),
            tool_name: "write_file".into(),
            arguments: serde_json::json!({"path": "a", "content": "b"}),
        }];
        assert_eq!(
            extract_declaration(&calls).unwrap_err(),
            "MissingStatusDeclaration"
        );
    }

    #[test]
    fn unknown_status_is_reported() {
        let calls = vec![ToolCall {
            call_id: "c1".into(),
            tool_name: "set_status".into(),
            arguments: serde_json::json!({"to": "FINISHED"}),
        }];
        assert!(extract_declaration(&calls)
            .unwrap_err()
            .starts_with("UnknownStatus"));
    }
}
