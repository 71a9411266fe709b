//! Process-wide registry of active sessions.
//!
//! Enforces the one-active-session-per-target invariant and owns the
//! cancellation tokens handed to running loops. Serialized by a mutex;
//! the scheduler task is the only writer in practice.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use ork_domain::error::{Error, Result};
use ork_domain::session::SessionOutcome;
use ork_providers::CancelToken;
use ork_repository::SessionLedger;

struct ActiveSession {
    session_id: String,
    cancel: CancelToken,
}

#[derive(Default)]
pub struct SessionRegistry {
    /// target_card_id -> active session.
    active: Mutex<HashMap<String, ActiveSession>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session on a target. Fails if the target already has one.
    pub fn register(&self, target_card_id: &str, session_id: &str) -> Result<CancelToken> {
        let mut active = self.active.lock();
        if active.contains_key(target_card_id) {
            return Err(Error::SessionActive(target_card_id.to_owned()));
        }
        let cancel = CancelToken::new();
        active.insert(
            target_card_id.to_owned(),
            ActiveSession {
                session_id: session_id.to_owned(),
                cancel: cancel.clone(),
            },
        );
        Ok(cancel)
    }

    /// Release a target when its session ends.
    pub fn finish(&self, target_card_id: &str) {
        self.active.lock().remove(target_card_id);
    }

    /// Cancel by session id. Returns false when the session is not active.
    pub fn cancel_session(&self, session_id: &str) -> bool {
        let active = self.active.lock();
        match active.values().find(|s| s.session_id == session_id) {
            Some(session) => {
                session.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Session id active on a target, if any.
    pub fn session_for_target(&self, target_card_id: &str) -> Option<String> {
        self.active
            .lock()
            .get(target_card_id)
            .map(|s| s.session_id.clone())
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }

    /// Teardown: cancel every running loop and mark their sessions
    /// interrupted in the ledger.
    pub fn interrupt_all(&self, ledger: &SessionLedger, at: DateTime<Utc>) {
        let mut active = self.active.lock();
        for (target, session) in active.drain() {
            session.cancel.cancel();
            if let Err(e) =
                ledger.close_session(&session.session_id, at, &SessionOutcome::Interrupted)
            {
                tracing::warn!(
                    target = %target,
                    session_id = %session.session_id,
                    error = %e,
                    "failed to mark session interrupted"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_session_per_target() {
        let registry = SessionRegistry::new();
        registry.register("E1", "s1").unwrap();
        assert!(matches!(
            registry.register("E1", "s2"),
            Err(Error::SessionActive(_))
        ));
        // A different target is fine.
        registry.register("E2", "s3").unwrap();
        assert_eq!(registry.active_count(), 2);

        registry.finish("E1");
        registry.register("E1", "s4").unwrap();
    }

    #[test]
    fn cancel_by_session_id() {
        let registry = SessionRegistry::new();
        let token = registry.register("E1", "s1").unwrap();
        assert!(registry.cancel_session("s1"));
        assert!(token.is_cancelled());
        assert!(!registry.cancel_session("ghost"));
    }

    #[test]
    fn interrupt_all_closes_ledger_sessions() {
        let registry = SessionRegistry::new();
        let ledger = SessionLedger::open_in_memory().unwrap();
        let now = Utc::now();

        ledger
            .open_session(&ork_domain::session::SessionRecord {
                session_id: "s1".into(),
                target_card_id: "E1".into(),
                started_at: now,
                ended_at: None,
                turn_count: 0,
                outcome: None,
            })
            .unwrap();
        let token = registry.register("E1", "s1").unwrap();

        registry.interrupt_all(&ledger, now);
        assert!(token.is_cancelled());
        assert_eq!(registry.active_count(), 0);
        assert_eq!(
            ledger.get_session("s1").unwrap().outcome,
            Some(SessionOutcome::Interrupted)
        );
    }
}
