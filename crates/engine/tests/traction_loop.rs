//! End-to-end scenarios for the traction loop, driven by the stub
//! provider against in-memory stores and a tempdir sandbox.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use ork_dialect::{standard_tools, PromptCompiler};
use ork_domain::card::{Card, CardKind, CardStatus, Priority, WaitReason};
use ork_domain::clock::SystemClock;
use ork_domain::role::{Dialect, Role};
use ork_domain::session::SessionOutcome;
use ork_engine::{
    CriticalPathSelector, Diagnostician, SessionRegistry, ToolEffects, TractionLoop,
    TractionOpts, TurnExecutor, Verifier,
};
use ork_governance::{StateMachine, ToolGate};
use ork_providers::{Completion, ModelProvider, ProviderError, RetryPolicy, StubProvider, Usage};
use ork_repository::{CardStore, SessionLedger};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Harness
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct Harness {
    store: Arc<CardStore>,
    ledger: Arc<SessionLedger>,
    registry: Arc<SessionRegistry>,
    traction: TractionLoop,
    workspace: tempfile::TempDir,
}

fn response(text: &str) -> Result<Completion, ProviderError> {
    Ok(Completion {
        text: text.to_owned(),
        usage: Usage {
            prompt_tokens: 10,
            completion_tokens: 10,
        },
    })
}

fn done_response() -> Result<Completion, ProviderError> {
    response(r#"{"call_id":"c1","tool":"set_status","args":{"to":"DONE"}}"#)
}

fn harness_with_policy(
    script: Vec<Result<Completion, ProviderError>>,
    requeue_policy: RetryPolicy,
) -> Harness {
    let machine = Arc::new(StateMachine::standard());
    let store = Arc::new(CardStore::open_in_memory(machine).unwrap());
    let ledger = Arc::new(SessionLedger::open_in_memory().unwrap());
    let registry = Arc::new(SessionRegistry::new());
    let workspace = tempfile::tempdir().unwrap();
    let agent_out = workspace.path().join("agent_out");
    let verifier_dir = workspace.path().join("verifier");
    std::fs::create_dir_all(&agent_out).unwrap();
    std::fs::create_dir_all(&verifier_dir).unwrap();

    let provider: Arc<dyn ModelProvider> = Arc::new(StubProvider::new(script));
    let clock = Arc::new(SystemClock);

    let mut roles = HashMap::new();
    roles.insert(
        "builder".to_owned(),
        Role {
            role_id: "builder".into(),
            system_prompt: "You are the builder seat.".into(),
            tools_allowed: ["write_file", "read_card", "set_status"]
                .iter()
                .map(|s| s.to_string())
                .collect::<BTreeSet<_>>(),
            boundary_policy: Default::default(),
        },
    );

    let retry = RetryPolicy {
        base_ms: 5,
        factor: 2.0,
        cap_ms: 40,
        max_attempts: 5,
    };

    let executor = TurnExecutor::new(
        store.clone(),
        ledger.clone(),
        provider,
        PromptCompiler::new(8_000, None),
        Arc::new(ToolGate::new(&[r"\.(exe|dll)$".to_string()], 7, true).unwrap()),
        ToolEffects::new(agent_out, store.clone()),
        roles,
        Dialect::plain_json(),
        standard_tools(),
        retry,
        Duration::from_secs(10),
        clock.clone(),
    );

    let traction = TractionLoop::new(
        store.clone(),
        ledger.clone(),
        executor,
        CriticalPathSelector::new(0.5),
        Diagnostician::new(Default::default()),
        registry.clone(),
        Verifier::new(verifier_dir),
        clock,
        requeue_policy,
        10,
        3,
    );

    Harness {
        store,
        ledger,
        registry,
        traction,
        workspace,
    }
}

fn harness(script: Vec<Result<Completion, ProviderError>>) -> Harness {
    harness_with_policy(
        script,
        RetryPolicy {
            base_ms: 5,
            factor: 2.0,
            cap_ms: 40,
            max_attempts: 3,
        },
    )
}

fn card(id: &str, status: CardStatus) -> Card {
    let now = Utc::now();
    Card {
        id: id.into(),
        kind: CardKind::Task,
        parent_id: None,
        title: format!("card {id}"),
        status,
        role: "builder".into(),
        priority: Priority::MEDIUM,
        depends_on: BTreeSet::new(),
        wait_reason: None,
        requirements_ref: None,
        verification_ref: None,
        metadata: HashMap::new(),
        created_at: now,
        updated_at: now,
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scenarios
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn happy_path_single_task() {
    let h = harness(vec![response(concat!(
        r#"{"call_id":"c1","tool":"write_file","args":{"path":"report.md","content":"done"}}"#,
        "\n",
        r#"{"call_id":"c2","tool":"set_status","args":{"to":"DONE"}}"#,
    ))]);
    h.store.insert_card(&card("T1", CardStatus::Ready)).unwrap();

    let summary = h
        .traction
        .run("T1", &TractionOpts::default())
        .await
        .unwrap();

    assert_eq!(summary.outcome, SessionOutcome::Completed);
    assert_eq!(h.store.get_card("T1").unwrap().status, CardStatus::Done);

    let snap = h.ledger.snapshot(&summary.session_id).unwrap();
    assert_eq!(snap.turns.len(), 1);
    assert_eq!(snap.turns[0].failure_code, None);
    assert!(h
        .workspace
        .path()
        .join("agent_out")
        .join("report.md")
        .exists());
}

#[tokio::test]
async fn dependency_ordering_drives_t1_before_t2() {
    let h = harness(vec![done_response()]);
    h.store.insert_card(&card("T1", CardStatus::Ready)).unwrap();
    let mut t2 = card("T2", CardStatus::Ready);
    t2.depends_on.insert("T1".into());
    h.store.insert_card(&t2).unwrap();

    // Dry run first: only T1 is dispatchable.
    let plan = h
        .traction
        .run(
            "T1",
            &TractionOpts {
                dry_run: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(plan.planned, vec!["T1".to_owned()]);

    // Drive T1 to completion; T2 becomes ready only afterwards.
    let summary = h
        .traction
        .run("T1", &TractionOpts::default())
        .await
        .unwrap();
    assert_eq!(summary.outcome, SessionOutcome::Completed);
    assert_eq!(h.store.get_card("T1").unwrap().status, CardStatus::Done);

    let ready: Vec<String> = h
        .store
        .list_ready()
        .unwrap()
        .into_iter()
        .map(|c| c.id)
        .collect();
    assert!(ready.contains(&"T2".to_owned()));
}

#[tokio::test]
async fn parent_tree_completes_bottom_up() {
    let h = harness(vec![done_response()]);
    let mut root = card("E1", CardStatus::New);
    root.kind = CardKind::Project;
    root.role = "builder".into();
    h.store.insert_card(&root).unwrap();
    let mut t1 = card("T1", CardStatus::Ready);
    t1.parent_id = Some("E1".into());
    h.store.insert_card(&t1).unwrap();
    let mut t2 = card("T2", CardStatus::Ready);
    t2.parent_id = Some("E1".into());
    t2.depends_on.insert("T1".into());
    h.store.insert_card(&t2).unwrap();

    let summary = h
        .traction
        .run("E1", &TractionOpts::default())
        .await
        .unwrap();

    assert_eq!(summary.outcome, SessionOutcome::Completed);
    assert_eq!(summary.turns, 2);
    assert_eq!(h.store.get_card("T1").unwrap().status, CardStatus::Done);
    assert_eq!(h.store.get_card("T2").unwrap().status, CardStatus::Done);
    // Parent completion propagated when all children finished.
    assert_eq!(h.store.get_card("E1").unwrap().status, CardStatus::Done);
}

#[tokio::test]
async fn transition_race_exactly_one_applies() {
    use ork_repository::{TransitionOutcome, TransitionRequest};

    let h = harness(vec![done_response()]);
    h.store.insert_card(&card("T1", CardStatus::Ready)).unwrap();

    let store = h.store.clone();
    let request = || TransitionRequest {
        card_id: "T1".into(),
        from: CardStatus::Ready,
        to: CardStatus::InProgress,
        acting_roles: std::iter::once("builder".to_owned()).collect(),
        wait_reason: None,
        detail: serde_json::Value::Null,
        at: Utc::now(),
    };

    let a = {
        let store = store.clone();
        let req = request();
        tokio::task::spawn_blocking(move || store.propose_transition(&req).unwrap())
    };
    let b = {
        let store = store.clone();
        let req = request();
        tokio::task::spawn_blocking(move || store.propose_transition(&req).unwrap())
    };
    let (ra, rb) = (a.await.unwrap(), b.await.unwrap());

    let applied = [&ra, &rb]
        .iter()
        .filter(|o| matches!(o, TransitionOutcome::Applied))
        .count();
    let stale = [&ra, &rb]
        .iter()
        .filter(|o| matches!(o, TransitionOutcome::StaleState { .. }))
        .count();
    assert_eq!((applied, stale), (1, 1));
    assert_eq!(
        h.store.get_card("T1").unwrap().status,
        CardStatus::InProgress
    );
}

#[tokio::test]
async fn path_traversal_fails_card_with_no_side_effect() {
    let h = harness(vec![response(concat!(
        r#"{"call_id":"c1","tool":"write_file","args":{"path":"../../etc/passwd","content":"x"}}"#,
        "\n",
        r#"{"call_id":"c2","tool":"set_status","args":{"to":"DONE"}}"#,
    ))]);
    h.store.insert_card(&card("T1", CardStatus::Ready)).unwrap();

    let summary = h
        .traction
        .run("T1", &TractionOpts::default())
        .await
        .unwrap();

    assert!(matches!(summary.outcome, SessionOutcome::Failed { .. }));
    assert_eq!(h.store.get_card("T1").unwrap().status, CardStatus::Failed);

    let snap = h.ledger.snapshot(&summary.session_id).unwrap();
    assert_eq!(
        snap.turns[0].failure_code.as_deref(),
        Some("TOOL_GATE_VIOLATION")
    );
    // Filesystem probe: nothing escaped the sandbox root.
    let agent_out = h.workspace.path().join("agent_out");
    assert!(std::fs::read_dir(&agent_out).unwrap().next().is_none());
    assert!(!h.workspace.path().join("etc").exists());
}

#[tokio::test]
async fn blocked_without_wait_reason_is_illegal_and_fails_card() {
    let h = harness(vec![response(
        r#"{"call_id":"c1","tool":"set_status","args":{"to":"BLOCKED"}}"#,
    )]);
    h.store.insert_card(&card("T1", CardStatus::Ready)).unwrap();

    let summary = h
        .traction
        .run("T1", &TractionOpts::default())
        .await
        .unwrap();

    assert_eq!(h.store.get_card("T1").unwrap().status, CardStatus::Failed);
    let snap = h.ledger.snapshot(&summary.session_id).unwrap();
    assert_eq!(
        snap.turns[0].failure_code.as_deref(),
        Some("ILLEGAL_TRANSITION")
    );
}

#[tokio::test]
async fn blocked_with_wait_reason_ends_quiescent() {
    let h = harness(vec![response(
        r#"{"call_id":"c1","tool":"set_status","args":{"to":"BLOCKED","wait_reason":"INPUT"}}"#,
    )]);
    h.store.insert_card(&card("T1", CardStatus::Ready)).unwrap();

    let summary = h
        .traction
        .run("T1", &TractionOpts::default())
        .await
        .unwrap();

    let got = h.store.get_card("T1").unwrap();
    assert_eq!(got.status, CardStatus::Blocked);
    assert_eq!(got.wait_reason, Some(WaitReason::Input));
    assert!(matches!(summary.outcome, SessionOutcome::Failed { .. }));

    // The ledger captured the critical blocked-but-idle diagnostic.
    let snap = h.ledger.snapshot(&summary.session_id).unwrap();
    assert!(snap
        .events
        .iter()
        .any(|e| e.kind == "diagnostic" && e.detail["severity"] == "CRITICAL"));
}

#[tokio::test]
async fn provider_retries_emit_audit_events_then_succeed() {
    let h = harness(vec![
        Err(ProviderError::Unreachable("connection refused".into())),
        Err(ProviderError::Unreachable("connection refused".into())),
        done_response(),
    ]);
    h.store.insert_card(&card("T1", CardStatus::Ready)).unwrap();

    let summary = h
        .traction
        .run("T1", &TractionOpts::default())
        .await
        .unwrap();

    assert_eq!(summary.outcome, SessionOutcome::Completed);
    assert_eq!(h.store.get_card("T1").unwrap().status, CardStatus::Done);

    let snap = h.ledger.snapshot(&summary.session_id).unwrap();
    let retries: Vec<_> = snap
        .events
        .iter()
        .filter(|e| e.kind == "provider_retry")
        .collect();
    assert_eq!(retries.len(), 2);
    assert_eq!(retries[0].detail["attempt"], 1);
    assert_eq!(retries[1].detail["attempt"], 2);
    // One successful turn in the ledger.
    assert_eq!(snap.turns.len(), 1);
    assert_eq!(snap.turns[0].failure_code, None);
}

#[tokio::test]
async fn rejected_provider_exhausts_requeue_budget_and_fails() {
    let h = harness(vec![Err(ProviderError::Rejected {
        status: 400,
        message: "bad prompt".into(),
    })]);
    h.store.insert_card(&card("T1", CardStatus::Ready)).unwrap();

    let summary = h
        .traction
        .run("T1", &TractionOpts::default())
        .await
        .unwrap();

    assert_eq!(h.store.get_card("T1").unwrap().status, CardStatus::Failed);
    assert!(matches!(summary.outcome, SessionOutcome::Failed { .. }));
    // Requeue budget is 3: three turns were attempted before giving up.
    let snap = h.ledger.snapshot(&summary.session_id).unwrap();
    assert_eq!(snap.turns.len(), 3);
}

#[tokio::test]
async fn code_review_runs_verification_and_completes() {
    let mut t1 = card("T1", CardStatus::Ready);
    t1.metadata.insert(
        "verify_commands".into(),
        serde_json::json!(["true"]),
    );
    let h = harness(vec![response(
        r#"{"call_id":"c1","tool":"set_status","args":{"to":"CODE_REVIEW"}}"#,
    )]);
    h.store.insert_card(&t1).unwrap();

    let summary = h
        .traction
        .run("T1", &TractionOpts::default())
        .await
        .unwrap();

    assert_eq!(summary.outcome, SessionOutcome::Completed);
    assert_eq!(h.store.get_card("T1").unwrap().status, CardStatus::Done);
}

#[tokio::test]
async fn failed_verification_records_lesson_and_retries() {
    let mut t1 = card("T1", CardStatus::Ready);
    t1.metadata.insert(
        "verify_commands".into(),
        serde_json::json!(["echo nope >&2; exit 1"]),
    );
    let h = harness(vec![
        response(r#"{"call_id":"c1","tool":"set_status","args":{"to":"CODE_REVIEW"}}"#),
        done_response(),
    ]);
    h.store.insert_card(&t1).unwrap();

    let summary = h
        .traction
        .run("T1", &TractionOpts::default())
        .await
        .unwrap();

    // Second attempt (after the lesson) declared DONE.
    assert_eq!(summary.outcome, SessionOutcome::Completed);
    assert_eq!(h.store.get_card("T1").unwrap().status, CardStatus::Done);

    let snap = h.ledger.snapshot(&summary.session_id).unwrap();
    let lesson = snap
        .events
        .iter()
        .find(|e| e.kind == "failure_lesson")
        .expect("failure lesson recorded");
    assert_eq!(lesson.detail["card_id"], "T1");
    assert!(lesson.detail["failures"][0]["tail"]
        .as_str()
        .unwrap()
        .contains("nope"));
}

#[tokio::test]
async fn one_active_session_per_target() {
    let h = harness(vec![done_response()]);
    h.store.insert_card(&card("T1", CardStatus::Ready)).unwrap();

    h.registry.register("T1", "sess-manual").unwrap();
    let err = h.traction.run("T1", &TractionOpts::default()).await;
    assert!(err.is_err());
    h.registry.finish("T1");

    // After release the target is runnable again.
    let summary = h
        .traction
        .run("T1", &TractionOpts::default())
        .await
        .unwrap();
    assert_eq!(summary.outcome, SessionOutcome::Completed);
}

#[tokio::test]
async fn unknown_target_is_card_not_found() {
    let h = harness(vec![done_response()]);
    assert!(h
        .traction
        .run("ghost", &TractionOpts::default())
        .await
        .is_err());
}

#[tokio::test]
async fn max_turns_bounds_the_session() {
    // The stub keeps sending the card back to the pool.
    let h = harness(vec![response(
        r#"{"call_id":"c1","tool":"set_status","args":{"to":"READY"}}"#,
    )]);
    h.store.insert_card(&card("T1", CardStatus::Ready)).unwrap();

    let summary = h
        .traction
        .run(
            "T1",
            &TractionOpts {
                max_turns: Some(2),
                dry_run: false,
            },
        )
        .await
        .unwrap();

    assert_eq!(summary.turns, 2);
    assert_eq!(summary.outcome, SessionOutcome::Interrupted);
}

#[tokio::test]
async fn cancellation_during_backoff_exits_cleanly() {
    // Transient failures with a long requeue backoff: cancel mid-wait.
    let h = harness_with_policy(
        vec![Err(ProviderError::Unreachable("refused".into()))],
        RetryPolicy {
            base_ms: 60_000,
            factor: 2.0,
            cap_ms: 60_000,
            max_attempts: 5,
        },
    );
    h.store.insert_card(&card("T1", CardStatus::Ready)).unwrap();

    let registry = h.registry.clone();
    tokio::spawn(async move {
        // Wait for the session to register, then cancel it.
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if let Some(session_id) = registry.session_for_target("T1") {
                registry.cancel_session(&session_id);
                return;
            }
        }
    });

    let summary = tokio::time::timeout(
        Duration::from_secs(10),
        h.traction.run("T1", &TractionOpts::default()),
    )
    .await
    .expect("loop exited before the timeout")
    .unwrap();

    assert_eq!(summary.outcome, SessionOutcome::Interrupted);
}
