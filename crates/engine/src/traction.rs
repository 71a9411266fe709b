//! The traction loop — the top-level orchestrator.
//!
//! One workspace, one target card, one cooperative scheduling thread:
//! Scan → Prepare → Execute → Govern → Persist, until the target is done
//! or the workspace is quiescent. All error-kind branching lives here;
//! the executor only reports typed outcomes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use ork_domain::card::{Card, CardKind, CardStatus};
use ork_domain::clock::{new_session_id, SharedClock};
use ork_domain::error::{Error, Result};
use ork_domain::session::{SessionOutcome, SessionRecord};
use ork_domain::trace::TraceEvent;
use ork_providers::{CancelToken, RetryPolicy};
use ork_repository::{CardStore, SessionLedger, TransitionOutcome, TransitionRequest};

use crate::diagnostics::Diagnostician;
use crate::executor::TurnExecutor;
use crate::outcome::TurnOutcome;
use crate::registry::SessionRegistry;
use crate::selector::CriticalPathSelector;
use crate::verify::{VerificationProfile, Verifier};

/// How long to sleep when waiting on work driven by another session.
const WAIT_POLL: Duration = Duration::from_millis(100);

/// Loop observability states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Scanning,
    Dispatched,
    Waiting,
    Quiescent,
    Stopping,
}

/// Options from the CLI/HTTP surface.
#[derive(Debug, Clone, Default)]
pub struct TractionOpts {
    pub max_turns: Option<u32>,
    pub dry_run: bool,
}

/// A registered-but-not-yet-driven session.
pub struct PreparedSession {
    pub session_id: String,
    pub target_card_id: String,
    pub cancel: CancelToken,
}

/// What a finished session looks like to the caller.
#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub session_id: String,
    pub outcome: SessionOutcome,
    pub turns: u32,
    pub final_state: LoopState,
    /// Dispatch order computed in dry-run mode.
    pub planned: Vec<String>,
}

pub struct TractionLoop {
    store: Arc<CardStore>,
    ledger: Arc<SessionLedger>,
    executor: TurnExecutor,
    selector: CriticalPathSelector,
    diagnostician: Diagnostician,
    registry: Arc<SessionRegistry>,
    verifier: Verifier,
    clock: SharedClock,
    requeue_policy: RetryPolicy,
    checkpoint_every: u32,
    max_transient_attempts: u32,
}

impl TractionLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<CardStore>,
        ledger: Arc<SessionLedger>,
        executor: TurnExecutor,
        selector: CriticalPathSelector,
        diagnostician: Diagnostician,
        registry: Arc<SessionRegistry>,
        verifier: Verifier,
        clock: SharedClock,
        requeue_policy: RetryPolicy,
        checkpoint_every: u32,
        max_transient_attempts: u32,
    ) -> Self {
        Self {
            store,
            ledger,
            executor,
            selector,
            diagnostician,
            registry,
            verifier,
            clock,
            requeue_policy,
            checkpoint_every: checkpoint_every.max(1),
            max_transient_attempts: max_transient_attempts.max(1),
        }
    }

    /// Register a session on a target and open its ledger row. The
    /// caller then drives it with [`TractionLoop::run_prepared`] —
    /// immediately (CLI) or from a spawned task (HTTP).
    pub fn prepare(&self, target_card_id: &str) -> Result<PreparedSession> {
        // The target must exist before we claim it.
        self.store
            .get_card(target_card_id)
            .map_err(|_| Error::CardNotFound(target_card_id.to_owned()))?;

        let session_id = new_session_id();
        let cancel = self.registry.register(target_card_id, &session_id)?;
        let started_at = self.clock.now();
        if let Err(e) = self.ledger.open_session(&SessionRecord {
            session_id: session_id.clone(),
            target_card_id: target_card_id.to_owned(),
            started_at,
            ended_at: None,
            turn_count: 0,
            outcome: None,
        }) {
            self.registry.finish(target_card_id);
            return Err(Error::Other(e.to_string()));
        }
        TraceEvent::SessionStarted {
            session_id: session_id.clone(),
            target_card_id: target_card_id.to_owned(),
        }
        .emit();

        Ok(PreparedSession {
            session_id,
            target_card_id: target_card_id.to_owned(),
            cancel,
        })
    }

    /// Drive a session over the target card until done, quiescent,
    /// cancelled, or out of turn budget.
    pub async fn run(&self, target_card_id: &str, opts: &TractionOpts) -> Result<SessionSummary> {
        let prepared = self.prepare(target_card_id)?;
        self.run_prepared(prepared, opts).await
    }

    /// Drive a prepared session to completion.
    pub async fn run_prepared(
        &self,
        prepared: PreparedSession,
        opts: &TractionOpts,
    ) -> Result<SessionSummary> {
        let PreparedSession {
            session_id,
            target_card_id,
            cancel,
        } = prepared;

        let result = self
            .drive(&target_card_id, &session_id, &cancel, opts)
            .await;
        self.registry.finish(&target_card_id);

        let (outcome, turns, final_state, planned) = match result {
            Ok(done) => done,
            Err(e) => {
                // Storage failures mid-loop end the session as failed.
                (
                    SessionOutcome::Failed {
                        reason: e.to_string(),
                    },
                    0,
                    LoopState::Stopping,
                    Vec::new(),
                )
            }
        };

        self.ledger
            .close_session(&session_id, self.clock.now(), &outcome)?;
        TraceEvent::SessionEnded {
            session_id: session_id.clone(),
            outcome: format!("{outcome:?}"),
            turn_count: turns,
        }
        .emit();

        Ok(SessionSummary {
            session_id,
            outcome,
            turns,
            final_state,
            planned,
        })
    }

    /// Cancel a running session by id (HTTP surface).
    pub fn cancel(&self, session_id: &str) -> bool {
        self.registry.cancel_session(session_id)
    }

    // ── The loop proper ────────────────────────────────────────────

    async fn drive(
        &self,
        target: &str,
        session_id: &str,
        cancel: &CancelToken,
        opts: &TractionOpts,
    ) -> Result<(SessionOutcome, u32, LoopState, Vec<String>)> {
        if opts.dry_run {
            return self.dry_run(target, session_id);
        }

        // Crash recovery: give stranded IN_PROGRESS cards back to the pool.
        self.requeue_stranded(target)?;

        let mut turns: u32 = 0;
        let mut transient_attempts: HashMap<String, u32> = HashMap::new();

        loop {
            // ── Scan ────────────────────────────────────────────────
            if cancel.is_cancelled() {
                return Ok((SessionOutcome::Interrupted, turns, LoopState::Stopping, vec![]));
            }
            if let Some(max) = opts.max_turns {
                if turns >= max {
                    tracing::info!(turns, "turn budget exhausted");
                    return Ok((SessionOutcome::Interrupted, turns, LoopState::Stopping, vec![]));
                }
            }

            self.emit_diagnostic(session_id)?;
            self.promote_new(target)?;

            let subtree = self.subtree_ids(target)?;
            let all = self.store.list_all()?;
            let ready_owned = self.store.list_ready()?;
            // Only leaf tasks execute turns; containers complete by
            // propagation once their children finish.
            let ready: Vec<&Card> = ready_owned
                .iter()
                .filter(|c| subtree.contains(&c.id) && c.kind == CardKind::Task)
                .collect();
            let ordered = self.selector.order(&ready, &all);

            let Some(card) = ordered.first().copied() else {
                // Nothing ready. Figure out why.
                let in_progress = all
                    .iter()
                    .any(|c| subtree.contains(&c.id) && c.status == CardStatus::InProgress);
                if in_progress {
                    // Another session is mid-turn on this tree.
                    tokio::select! {
                        _ = tokio::time::sleep(WAIT_POLL) => {}
                        _ = cancel.cancelled() => {}
                    }
                    continue;
                }

                self.propagate_completion(Some(target.to_owned()))?;
                let target_card = self.store.get_card(target)?;
                if target_card.status.satisfies_dependency() {
                    return Ok((SessionOutcome::Completed, turns, LoopState::Quiescent, vec![]));
                }

                let blocked = all.iter().any(|c| {
                    subtree.contains(&c.id) && c.status.is_blocked_class()
                });
                let reason = if blocked {
                    "quiescent: blocked cards need outside help"
                } else {
                    "quiescent: no runnable work"
                };
                self.emit_diagnostic(session_id)?;
                return Ok((
                    SessionOutcome::Failed {
                        reason: reason.to_owned(),
                    },
                    turns,
                    LoopState::Quiescent,
                    vec![],
                ));
            };

            TraceEvent::CardSelected {
                session_id: session_id.to_owned(),
                card_id: card.id.clone(),
                weight: self.selector.weight(card, &all),
            }
            .emit();

            // ── Prepare: claim the card for this session ────────────
            let claim = self.transition(
                &card.id,
                CardStatus::Ready,
                CardStatus::InProgress,
                &card.role,
                None,
                serde_json::json!({"session_id": session_id}),
            )?;
            match claim {
                TransitionOutcome::Applied => {}
                // Someone else claimed it first — rescan.
                TransitionOutcome::StaleState { .. } => continue,
                other => {
                    tracing::warn!(card_id = %card.id, ?other, "unexpected claim result");
                    continue;
                }
            }

            // ── Execute ─────────────────────────────────────────────
            let report = self.executor.execute(&card.id, session_id, cancel).await;
            turns += 1;

            // ── Govern: branch on the typed outcome ────────────────
            match report.outcome {
                TurnOutcome::Applied { to, wait_reason } => {
                    transient_attempts.remove(&card.id);
                    match to {
                        CardStatus::Done => {
                            let parent = self.store.get_card(&card.id)?.parent_id;
                            self.propagate_completion(parent)?;
                        }
                        CardStatus::CodeReview => {
                            self.run_verification(&card.id, session_id).await?;
                        }
                        CardStatus::Blocked | CardStatus::WaitingForDeveloper => {
                            self.ledger.append_event(
                                session_id,
                                self.clock.now(),
                                "card_waiting",
                                &serde_json::json!({
                                    "card_id": card.id,
                                    "wait_reason": wait_reason.map(|w| w.as_str()),
                                }),
                            )?;
                        }
                        _ => {}
                    }
                }
                TurnOutcome::StaleState => {
                    // Superseded mid-turn; the rescan will sort it out.
                }
                TurnOutcome::ProviderTimeout { .. } | TurnOutcome::ProviderRejected { .. } => {
                    let attempts = transient_attempts.entry(card.id.clone()).or_insert(0);
                    *attempts += 1;
                    if *attempts >= self.max_transient_attempts {
                        self.fail_card(&card.id, session_id, report.outcome.failure_code())?;
                        transient_attempts.remove(&card.id);
                    } else {
                        let delay = self.requeue_policy.delay_after(*attempts);
                        tracing::info!(
                            card_id = %card.id,
                            attempt = *attempts,
                            delay_ms = delay.as_millis() as u64,
                            "transient failure, requeueing with backoff"
                        );
                        self.requeue(&card.id)?;
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = cancel.cancelled() => {}
                        }
                    }
                }
                TurnOutcome::ToolGateViolation(_)
                | TurnOutcome::ParseFailure { .. }
                | TurnOutcome::IllegalTransition { .. }
                | TurnOutcome::Internal { .. } => {
                    // Contract failures are never retried.
                    self.fail_card(&card.id, session_id, report.outcome.failure_code())?;
                }
                TurnOutcome::Cancelled => {
                    // Give the card back and exit cleanly.
                    self.requeue(&card.id)?;
                    return Ok((SessionOutcome::Interrupted, turns, LoopState::Stopping, vec![]));
                }
            }

            // ── Persist: periodic checkpoint ────────────────────────
            if turns % self.checkpoint_every == 0 {
                self.ledger.append_event(
                    session_id,
                    self.clock.now(),
                    "checkpoint",
                    &serde_json::json!({"turn_count": turns}),
                )?;
            }
        }
    }

    fn dry_run(
        &self,
        target: &str,
        session_id: &str,
    ) -> Result<(SessionOutcome, u32, LoopState, Vec<String>)> {
        self.emit_diagnostic(session_id)?;
        let subtree = self.subtree_ids(target)?;
        let all = self.store.list_all()?;
        let ready_owned = self.store.list_ready()?;
        let ready: Vec<&Card> = ready_owned
            .iter()
            .filter(|c| subtree.contains(&c.id) && c.kind == CardKind::Task)
            .collect();
        let planned: Vec<String> = self
            .selector
            .order(&ready, &all)
            .iter()
            .map(|c| c.id.clone())
            .collect();
        self.ledger.append_event(
            session_id,
            self.clock.now(),
            "dry_run_plan",
            &serde_json::json!({"order": planned}),
        )?;
        Ok((SessionOutcome::Completed, 0, LoopState::Quiescent, planned))
    }

    // ── Helpers ────────────────────────────────────────────────────

    fn emit_diagnostic(&self, session_id: &str) -> Result<()> {
        let by_reason = self
            .store
            .count_blocked_by_reason()
            .map_err(|e| Error::Other(e.to_string()))?;
        let active_turns = self
            .store
            .list_by_status(CardStatus::InProgress)
            .map_err(|e| Error::Other(e.to_string()))?
            .len();
        let diagnostic = self.diagnostician.assess(&by_reason, active_turns);
        TraceEvent::BottleneckDiagnostic {
            severity: format!("{:?}", diagnostic.severity),
            dominant_reason: diagnostic.dominant_reason.map(|r| r.as_str().to_owned()),
            blocked_total: diagnostic.blocked_total,
        }
        .emit();
        self.ledger.append_event(
            session_id,
            self.clock.now(),
            "diagnostic",
            &serde_json::to_value(&diagnostic).unwrap_or_default(),
        )?;
        Ok(())
    }

    /// IDs of the target and every descendant.
    fn subtree_ids(&self, target: &str) -> Result<std::collections::HashSet<String>> {
        let all = self.store.list_all().map_err(|e| Error::Other(e.to_string()))?;
        let mut members: std::collections::HashSet<String> =
            std::iter::once(target.to_owned()).collect();
        // Cards form a forest; a few passes settle the closure.
        loop {
            let before = members.len();
            for card in &all {
                if let Some(parent) = &card.parent_id {
                    if members.contains(parent) {
                        members.insert(card.id.clone());
                    }
                }
            }
            if members.len() == before {
                break;
            }
        }
        Ok(members)
    }

    /// NEW cards in the subtree become READY (their turn in the pool).
    fn promote_new(&self, target: &str) -> Result<()> {
        let subtree = self.subtree_ids(target)?;
        for card in self
            .store
            .list_by_status(CardStatus::New)
            .map_err(|e| Error::Other(e.to_string()))?
        {
            if subtree.contains(&card.id) {
                self.transition(
                    &card.id,
                    CardStatus::New,
                    CardStatus::Ready,
                    &card.role,
                    None,
                    serde_json::json!({"reason": "scan_promotion"}),
                )?;
            }
        }
        Ok(())
    }

    /// Give stranded IN_PROGRESS cards (from an interrupted session) back.
    fn requeue_stranded(&self, target: &str) -> Result<()> {
        let subtree = self.subtree_ids(target)?;
        for card in self
            .store
            .list_by_status(CardStatus::InProgress)
            .map_err(|e| Error::Other(e.to_string()))?
        {
            if subtree.contains(&card.id) {
                tracing::warn!(card_id = %card.id, "requeueing stranded card");
                self.requeue(&card.id)?;
            }
        }
        Ok(())
    }

    fn requeue(&self, card_id: &str) -> Result<()> {
        let card = self.store.get_card(card_id).map_err(|e| Error::Other(e.to_string()))?;
        self.transition(
            card_id,
            card.status,
            CardStatus::Ready,
            &card.role,
            None,
            serde_json::json!({"reason": "requeue"}),
        )?;
        Ok(())
    }

    fn fail_card(
        &self,
        card_id: &str,
        session_id: &str,
        failure_code: Option<&str>,
    ) -> Result<()> {
        let card = self.store.get_card(card_id).map_err(|e| Error::Other(e.to_string()))?;
        self.transition(
            card_id,
            card.status,
            CardStatus::Failed,
            &card.role,
            None,
            serde_json::json!({"failure_code": failure_code}),
        )?;
        self.ledger.append_event(
            session_id,
            self.clock.now(),
            "card_failed",
            &serde_json::json!({"card_id": card_id, "failure_code": failure_code}),
        )?;
        Ok(())
    }

    fn transition(
        &self,
        card_id: &str,
        from: CardStatus,
        to: CardStatus,
        role: &str,
        wait_reason: Option<ork_domain::card::WaitReason>,
        detail: serde_json::Value,
    ) -> Result<TransitionOutcome> {
        self.store
            .propose_transition(&TransitionRequest {
                card_id: card_id.to_owned(),
                from,
                to,
                acting_roles: std::iter::once(role.to_owned()).collect(),
                wait_reason,
                detail,
                at: self.clock.now(),
            })
            .map_err(|e| Error::Other(e.to_string()))
    }

    /// Walk up the parent chain completing parents whose children are all
    /// complete.
    fn propagate_completion(&self, mut parent_id: Option<String>) -> Result<()> {
        let mut hops = 0;
        while let Some(pid) = parent_id {
            if hops > 16 {
                break;
            }
            hops += 1;

            let parent = match self.store.get_card(&pid) {
                Ok(p) => p,
                Err(_) => break,
            };
            let children = self
                .store
                .list_by_parent(&pid)
                .map_err(|e| Error::Other(e.to_string()))?;
            let complete = !children.is_empty()
                && children.iter().all(|c| c.status.satisfies_dependency());
            if !complete || parent.status.is_terminal() {
                break;
            }

            // Drive the parent to DONE along a legal path, acting as the
            // operator seat.
            let path: &[CardStatus] = match parent.status {
                CardStatus::New => &[CardStatus::Ready, CardStatus::InProgress, CardStatus::Done],
                CardStatus::Ready => &[CardStatus::InProgress, CardStatus::Done],
                CardStatus::InProgress | CardStatus::CodeReview => &[CardStatus::Done],
                _ => break,
            };
            let mut from = parent.status;
            for &to in path {
                let outcome = self.transition(
                    &parent.id,
                    from,
                    to,
                    "operator",
                    None,
                    serde_json::json!({"reason": "children_complete"}),
                )?;
                if outcome != TransitionOutcome::Applied {
                    tracing::warn!(card_id = %parent.id, ?outcome, "completion propagation halted");
                    return Ok(());
                }
                from = to;
            }

            parent_id = parent.parent_id;
        }
        Ok(())
    }

    /// A card entered CODE_REVIEW: run its verification profile and move
    /// it on (pass → DONE, fail → back to the pool with a lesson).
    async fn run_verification(&self, card_id: &str, session_id: &str) -> Result<()> {
        let card = self.store.get_card(card_id).map_err(|e| Error::Other(e.to_string()))?;
        let profile = verification_profile(&card);

        let report = match &profile {
            Some(p) => self.verifier.run(p).await?,
            // No profile declared: review passes vacuously.
            None => crate::verify::VerificationReport {
                passed: true,
                failures: Vec::new(),
            },
        };

        TraceEvent::VerificationFinished {
            card_id: card_id.to_owned(),
            passed: report.passed,
            failure_count: report.failures.len(),
        }
        .emit();

        if report.passed {
            let outcome = self.transition(
                card_id,
                CardStatus::CodeReview,
                CardStatus::Done,
                "operator",
                None,
                serde_json::json!({"reason": "verification_passed"}),
            )?;
            if outcome == TransitionOutcome::Applied {
                self.propagate_completion(card.parent_id)?;
            }
        } else {
            // Advisory memory for the next attempt, then back to the pool.
            self.ledger.append_event(
                session_id,
                self.clock.now(),
                "failure_lesson",
                &serde_json::json!({
                    "card_id": card_id,
                    "failures": report.failures,
                }),
            )?;
            self.transition(
                card_id,
                CardStatus::CodeReview,
                CardStatus::InProgress,
                &card.role,
                None,
                serde_json::json!({"reason": "verification_failed"}),
            )?;
            self.transition(
                card_id,
                CardStatus::InProgress,
                CardStatus::Ready,
                &card.role,
                None,
                serde_json::json!({"reason": "verification_requeue"}),
            )?;
        }
        Ok(())
    }
}

/// Extract a verification profile from the card's metadata
/// (`verify_commands`: array of shell commands).
fn verification_profile(card: &Card) -> Option<VerificationProfile> {
    let commands = card
        .metadata
        .get("verify_commands")?
        .as_array()?
        .iter()
        .filter_map(|v| v.as_str().map(str::to_owned))
        .collect::<Vec<_>>();
    if commands.is_empty() {
        return None;
    }
    Some(VerificationProfile {
        commands,
        timeout_secs: 120,
        tail_bytes: 4096,
    })
}
