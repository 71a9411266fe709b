//! The card state machine.
//!
//! A transition table keyed by `(from, to)` with a required role set per
//! rule. Legality is checked, never coerced: an illegal request returns a
//! typed [`TransitionError`] and the caller decides what to do with it.

use std::collections::BTreeSet;
use std::collections::HashMap;

use serde::Serialize;

use ork_domain::card::{CardStatus, WaitReason};

/// Stable reason strings carried inside [`TransitionError::Illegal`].
pub mod reason {
    pub const NO_RULE: &str = "no_rule";
    pub const TERMINAL_STATUS: &str = "terminal_status";
    pub const WAIT_REASON_REQUIRED: &str = "wait_reason_required";
    pub const WAIT_REASON_FORBIDDEN: &str = "wait_reason_forbidden";
}

/// Typed transition failure. Callers match on the variant (and on
/// `reason` for `Illegal`), never on the display string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize)]
pub enum TransitionError {
    #[error("illegal transition {from:?} -> {to:?}: {reason}")]
    Illegal {
        from: CardStatus,
        to: CardStatus,
        reason: String,
    },

    #[error("role(s) {acting:?} not in required set {required:?}")]
    RoleDenied {
        acting: Vec<String>,
        required: Vec<String>,
    },
}

/// Which roles may drive a transition.
#[derive(Debug, Clone)]
enum RoleSet {
    /// Any role seat.
    Any,
    /// The acting agent's role set must intersect this set.
    OneOf(BTreeSet<String>),
}

#[derive(Debug, Clone)]
struct Rule {
    roles: RoleSet,
}

/// The transition table. Built once at composition time and shared.
pub struct StateMachine {
    rules: HashMap<(CardStatus, CardStatus), Rule>,
}

impl StateMachine {
    /// The standard Orket lifecycle table.
    pub fn standard() -> Self {
        use CardStatus::*;

        let mut rules = HashMap::new();
        let mut add = |from: CardStatus, to: CardStatus, roles: RoleSet| {
            rules.insert((from, to), Rule { roles });
        };

        let operator = || RoleSet::OneOf(BTreeSet::from(["operator".to_owned()]));

        // Planning.
        add(New, Ready, RoleSet::Any);

        // Execution.
        add(Ready, InProgress, RoleSet::Any);
        add(InProgress, CodeReview, RoleSet::Any);
        add(InProgress, Done, RoleSet::Any);
        add(InProgress, Blocked, RoleSet::Any);
        add(InProgress, WaitingForDeveloper, RoleSet::Any);
        add(InProgress, Failed, RoleSet::Any);
        // Give-back: a superseded or requeued card returns to the pool.
        add(InProgress, Ready, RoleSet::Any);

        // Review.
        add(
            CodeReview,
            Done,
            RoleSet::OneOf(BTreeSet::from([
                "reviewer".to_owned(),
                "lead_architect".to_owned(),
                "operator".to_owned(),
            ])),
        );
        add(CodeReview, InProgress, RoleSet::Any);
        add(CodeReview, Blocked, RoleSet::Any);
        add(CodeReview, Failed, RoleSet::Any);

        // Unblocking.
        add(Blocked, Ready, RoleSet::Any);
        add(Blocked, Failed, RoleSet::Any);
        add(WaitingForDeveloper, Ready, RoleSet::Any);
        add(WaitingForDeveloper, Failed, RoleSet::Any);

        // Operator archive of anything not yet terminal.
        for from in [New, Ready, InProgress, CodeReview, Blocked, WaitingForDeveloper] {
            add(from, Archived, operator());
        }

        // The only exit from a terminal status: operator un-archive.
        add(Archived, New, operator());

        Self { rules }
    }

    /// Check a proposed transition.
    ///
    /// Order: terminal sink, rule existence, wait-reason shape, role set.
    pub fn check(
        &self,
        from: CardStatus,
        to: CardStatus,
        acting_roles: &BTreeSet<String>,
        wait_reason: Option<WaitReason>,
    ) -> Result<(), TransitionError> {
        let illegal = |reason: &str| TransitionError::Illegal {
            from,
            to,
            reason: reason.to_owned(),
        };

        // Terminal statuses are sinks. ARCHIVED -> NEW is the one carved-out
        // exit and is present in the table, so it falls through to the rule.
        if from.is_terminal() && !(from == CardStatus::Archived && to == CardStatus::New) {
            return Err(illegal(reason::TERMINAL_STATUS));
        }

        let rule = self
            .rules
            .get(&(from, to))
            .ok_or_else(|| illegal(reason::NO_RULE))?;

        if to.is_blocked_class() && wait_reason.is_none() {
            return Err(illegal(reason::WAIT_REASON_REQUIRED));
        }
        if !to.is_blocked_class() && wait_reason.is_some() {
            return Err(illegal(reason::WAIT_REASON_FORBIDDEN));
        }

        match &rule.roles {
            RoleSet::Any => Ok(()),
            RoleSet::OneOf(required) => {
                if acting_roles.intersection(required).next().is_some() {
                    Ok(())
                } else {
                    Err(TransitionError::RoleDenied {
                        acting: acting_roles.iter().cloned().collect(),
                        required: required.iter().cloned().collect(),
                    })
                }
            }
        }
    }

    /// Whether `(from, to)` exists in the table at all (role- and
    /// wait-reason-agnostic). Used by audit verification.
    pub fn has_rule(&self, from: CardStatus, to: CardStatus) -> bool {
        self.rules.contains_key(&(from, to))
    }
}
