//! Card store — cards, dependency edges, and the per-card audit trail.
//!
//! Backed by one `cards.db` file per workspace. A single connection behind
//! a mutex serializes all writes; each logical write is one SQL
//! transaction, so a crash mid-commit leaves the previous state intact.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};

use ork_domain::card::{Card, CardKind, CardStatus, Priority, WaitReason};
use ork_governance::machine::{StateMachine, TransitionError};

use crate::error::{RepositoryError, RepositoryResult};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Transition request / outcome
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A proposed status transition, with the caller's view of the current
/// status for optimistic concurrency.
#[derive(Debug, Clone)]
pub struct TransitionRequest {
    pub card_id: String,
    pub from: CardStatus,
    pub to: CardStatus,
    /// Role seats held by the acting agent.
    pub acting_roles: BTreeSet<String>,
    pub wait_reason: Option<WaitReason>,
    /// Free-form audit detail (turn id, violation, ...).
    pub detail: serde_json::Value,
    pub at: DateTime<Utc>,
}

/// What the store decided. `Applied` is the only mutating outcome.
#[derive(Debug, Clone, PartialEq)]
pub enum TransitionOutcome {
    Applied,
    /// The caller's `from` no longer matches the stored status.
    StaleState { current: CardStatus },
    IllegalTransition {
        from: CardStatus,
        to: CardStatus,
        reason: String,
    },
    RoleDenied {
        acting: Vec<String>,
        required: Vec<String>,
    },
}

/// One audit row (per-card FIFO ordering via `seq`).
#[derive(Debug, Clone)]
pub struct AuditEntry {
    pub card_id: String,
    pub seq: i64,
    pub at: DateTime<Utc>,
    pub actor_role: String,
    pub event_kind: String,
    pub from_status: Option<CardStatus>,
    pub to_status: Option<CardStatus>,
    pub wait_reason: Option<WaitReason>,
    pub detail: serde_json::Value,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS cards (
    id               TEXT PRIMARY KEY,
    kind             TEXT NOT NULL,
    parent_id        TEXT,
    title            TEXT NOT NULL,
    status           TEXT NOT NULL,
    role             TEXT NOT NULL,
    priority         REAL NOT NULL,
    wait_reason      TEXT,
    requirements_ref TEXT,
    verification_ref TEXT,
    metadata         TEXT NOT NULL DEFAULT '{}',
    created_at       TEXT NOT NULL,
    updated_at       TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_cards_status ON cards(status);
CREATE INDEX IF NOT EXISTS idx_cards_parent ON cards(parent_id);

CREATE TABLE IF NOT EXISTS dependencies (
    from_card_id TEXT NOT NULL REFERENCES cards(id),
    to_card_id   TEXT NOT NULL REFERENCES cards(id),
    PRIMARY KEY (from_card_id, to_card_id)
);
CREATE INDEX IF NOT EXISTS idx_deps_to ON dependencies(to_card_id);

CREATE TABLE IF NOT EXISTS audit (
    card_id     TEXT NOT NULL REFERENCES cards(id),
    seq         INTEGER NOT NULL,
    at          TEXT NOT NULL,
    actor_role  TEXT NOT NULL,
    event_kind  TEXT NOT NULL,
    from_status TEXT,
    to_status   TEXT,
    wait_reason TEXT,
    detail      TEXT NOT NULL DEFAULT '{}',
    PRIMARY KEY (card_id, seq)
);
";

/// Durable card repository. Single writer, serialized through the
/// connection mutex; readers share the same handle.
pub struct CardStore {
    conn: Mutex<Connection>,
    machine: Arc<StateMachine>,
}

impl CardStore {
    /// Open (or create) `cards.db` and apply the schema.
    pub fn open(path: &Path, machine: Arc<StateMachine>) -> RepositoryResult<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA)?;
        tracing::info!(path = %path.display(), "card store open");
        Ok(Self {
            conn: Mutex::new(conn),
            machine,
        })
    }

    /// In-memory store for tests.
    pub fn open_in_memory(machine: Arc<StateMachine>) -> RepositoryResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
            machine,
        })
    }

    // ── Writes ─────────────────────────────────────────────────────

    /// Insert a new card (with its dependency edges) and a `created`
    /// audit row, in one transaction.
    pub fn insert_card(&self, card: &Card) -> RepositoryResult<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let exists: Option<i64> = tx
            .query_row("SELECT 1 FROM cards WHERE id = ?1", params![card.id], |r| r.get(0))
            .optional()?;
        if exists.is_some() {
            return Err(RepositoryError::DuplicateCard(card.id.clone()));
        }

        tx.execute(
            "INSERT INTO cards (id, kind, parent_id, title, status, role, priority,
                                wait_reason, requirements_ref, verification_ref,
                                metadata, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                card.id,
                card.kind.as_str(),
                card.parent_id,
                card.title,
                card.status.as_str(),
                card.role,
                card.priority.0,
                card.wait_reason.map(|w| w.as_str()),
                card.requirements_ref,
                card.verification_ref,
                serde_json::to_string(&card.metadata).unwrap_or_else(|_| "{}".into()),
                card.created_at.to_rfc3339(),
                card.updated_at.to_rfc3339(),
            ],
        )?;

        for dep in &card.depends_on {
            insert_edge_checked(&tx, &card.id, dep)?;
        }

        append_audit(
            &tx,
            &card.id,
            card.created_at,
            &card.role,
            "created",
            None,
            Some(card.status),
            card.wait_reason,
            &serde_json::json!({"title": card.title}),
        )?;

        tx.commit()?;
        Ok(())
    }

    /// Add a dependency edge `from -> to` (from depends on to), rejecting
    /// edges that would close a cycle.
    pub fn add_dependency(&self, from: &str, to: &str) -> RepositoryResult<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        insert_edge_checked(&tx, from, to)?;
        tx.commit()?;
        Ok(())
    }

    /// Propose an optimistic status transition.
    ///
    /// Commits status, wait_reason, `updated_at`, and the audit row in one
    /// transaction — or mutates nothing at all.
    pub fn propose_transition(
        &self,
        req: &TransitionRequest,
    ) -> RepositoryResult<TransitionOutcome> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let current: Option<String> = tx
            .query_row(
                "SELECT status FROM cards WHERE id = ?1",
                params![req.card_id],
                |r| r.get(0),
            )
            .optional()?;
        let current = match current {
            Some(s) => parse_status(&s)?,
            None => return Err(RepositoryError::CardNotFound(req.card_id.clone())),
        };

        if current != req.from {
            return Ok(TransitionOutcome::StaleState { current });
        }

        if let Err(e) = self
            .machine
            .check(req.from, req.to, &req.acting_roles, req.wait_reason)
        {
            return Ok(match e {
                TransitionError::Illegal { from, to, reason } => {
                    TransitionOutcome::IllegalTransition { from, to, reason }
                }
                TransitionError::RoleDenied { acting, required } => {
                    TransitionOutcome::RoleDenied { acting, required }
                }
            });
        }

        let changed = tx.execute(
            "UPDATE cards SET status = ?2, wait_reason = ?3, updated_at = ?4
             WHERE id = ?1 AND status = ?5",
            params![
                req.card_id,
                req.to.as_str(),
                req.wait_reason.map(|w| w.as_str()),
                req.at.to_rfc3339(),
                req.from.as_str(),
            ],
        )?;
        if changed == 0 {
            return Ok(TransitionOutcome::StaleState { current });
        }

        let actor = req
            .acting_roles
            .iter()
            .next()
            .cloned()
            .unwrap_or_else(|| "unknown".into());
        append_audit(
            &tx,
            &req.card_id,
            req.at,
            &actor,
            "transition",
            Some(req.from),
            Some(req.to),
            req.wait_reason,
            &req.detail,
        )?;

        tx.commit()?;
        Ok(TransitionOutcome::Applied)
    }

    // ── Reads ──────────────────────────────────────────────────────

    pub fn get_card(&self, id: &str) -> RepositoryResult<Card> {
        let conn = self.conn.lock();
        let card = query_card(&conn, id)?;
        card.ok_or_else(|| RepositoryError::CardNotFound(id.to_owned()))
    }

    /// Cards in READY status whose every dependency satisfies readiness.
    /// Ordering is left to the critical path selector.
    pub fn list_ready(&self) -> RepositoryResult<Vec<Card>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT c.id FROM cards c
             WHERE c.status = 'READY'
               AND NOT EXISTS (
                   SELECT 1 FROM dependencies d
                   JOIN cards dep ON dep.id = d.to_card_id
                   WHERE d.from_card_id = c.id
                     AND dep.status NOT IN ('DONE', 'ARCHIVED')
               )
             ORDER BY c.created_at ASC, c.id ASC",
        )?;
        let ids: Vec<String> = stmt
            .query_map([], |r| r.get(0))?
            .collect::<Result<_, _>>()?;
        drop(stmt);
        ids.iter()
            .map(|id| {
                query_card(&conn, id)?
                    .ok_or_else(|| RepositoryError::CardNotFound(id.clone()))
            })
            .collect()
    }

    pub fn list_by_parent(&self, parent_id: &str) -> RepositoryResult<Vec<Card>> {
        self.list_where("parent_id = ?1", params![parent_id])
    }

    pub fn list_by_status(&self, status: CardStatus) -> RepositoryResult<Vec<Card>> {
        self.list_where("status = ?1", params![status.as_str()])
    }

    pub fn list_all(&self) -> RepositoryResult<Vec<Card>> {
        self.list_where("1=1", params![])
    }

    fn list_where(
        &self,
        clause: &str,
        args: impl rusqlite::Params,
    ) -> RepositoryResult<Vec<Card>> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT id FROM cards WHERE {clause} ORDER BY created_at ASC, id ASC"
        );
        let mut stmt = conn.prepare(&sql)?;
        let ids: Vec<String> = stmt
            .query_map(args, |r| r.get(0))?
            .collect::<Result<_, _>>()?;
        drop(stmt);
        ids.iter()
            .map(|id| {
                query_card(&conn, id)?
                    .ok_or_else(|| RepositoryError::CardNotFound(id.clone()))
            })
            .collect()
    }

    /// Direct children count (complexity gate input).
    pub fn child_count(&self, parent_id: &str) -> RepositoryResult<usize> {
        let conn = self.conn.lock();
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM cards WHERE parent_id = ?1",
            params![parent_id],
            |r| r.get(0),
        )?;
        Ok(n as usize)
    }

    /// Blocked-class cards grouped by wait reason (diagnostician input).
    pub fn count_blocked_by_reason(&self) -> RepositoryResult<HashMap<WaitReason, usize>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT wait_reason, COUNT(*) FROM cards
             WHERE status IN ('BLOCKED', 'WAITING_FOR_DEVELOPER')
               AND wait_reason IS NOT NULL
             GROUP BY wait_reason",
        )?;
        let rows: Vec<(String, i64)> = stmt
            .query_map([], |r| Ok((r.get(0)?, r.get(1)?)))?
            .collect::<Result<_, _>>()?;
        let mut out = HashMap::new();
        for (reason, count) in rows {
            let reason = WaitReason::parse(&reason)
                .map_err(|_| RepositoryError::Corrupt(format!("wait_reason '{reason}'")))?;
            out.insert(reason, count as usize);
        }
        Ok(out)
    }

    /// Full audit trail for one card, in commit order.
    pub fn audit_entries(&self, card_id: &str) -> RepositoryResult<Vec<AuditEntry>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT card_id, seq, at, actor_role, event_kind,
                    from_status, to_status, wait_reason, detail
             FROM audit WHERE card_id = ?1 ORDER BY seq ASC",
        )?;
        let rows = stmt.query_map(params![card_id], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, i64>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, String>(3)?,
                r.get::<_, String>(4)?,
                r.get::<_, Option<String>>(5)?,
                r.get::<_, Option<String>>(6)?,
                r.get::<_, Option<String>>(7)?,
                r.get::<_, String>(8)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (card_id, seq, at, actor_role, event_kind, from, to, wait, detail) = row?;
            out.push(AuditEntry {
                card_id,
                seq,
                at: parse_timestamp(&at)?,
                actor_role,
                event_kind,
                from_status: from.as_deref().map(parse_status).transpose()?,
                to_status: to.as_deref().map(parse_status).transpose()?,
                wait_reason: wait
                    .as_deref()
                    .map(|w| {
                        WaitReason::parse(w)
                            .map_err(|_| RepositoryError::Corrupt(format!("wait_reason '{w}'")))
                    })
                    .transpose()?,
                detail: serde_json::from_str(&detail).unwrap_or(serde_json::Value::Null),
            });
        }
        Ok(out)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Row helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn parse_status(s: &str) -> Result<CardStatus, RepositoryError> {
    CardStatus::parse(s).map_err(|_| RepositoryError::Corrupt(format!("status '{s}'")))
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| RepositoryError::Corrupt(format!("timestamp '{s}'")))
}

fn query_card(conn: &Connection, id: &str) -> RepositoryResult<Option<Card>> {
    let row = conn
        .query_row(
            "SELECT id, kind, parent_id, title, status, role, priority,
                    wait_reason, requirements_ref, verification_ref,
                    metadata, created_at, updated_at
             FROM cards WHERE id = ?1",
            params![id],
            |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, Option<String>>(2)?,
                    r.get::<_, String>(3)?,
                    r.get::<_, String>(4)?,
                    r.get::<_, String>(5)?,
                    r.get::<_, f64>(6)?,
                    r.get::<_, Option<String>>(7)?,
                    r.get::<_, Option<String>>(8)?,
                    r.get::<_, Option<String>>(9)?,
                    r.get::<_, String>(10)?,
                    r.get::<_, String>(11)?,
                    r.get::<_, String>(12)?,
                ))
            },
        )
        .optional()?;

    let Some((
        id,
        kind,
        parent_id,
        title,
        status,
        role,
        priority,
        wait_reason,
        requirements_ref,
        verification_ref,
        metadata,
        created_at,
        updated_at,
    )) = row
    else {
        return Ok(None);
    };

    let mut stmt = conn.prepare(
        "SELECT to_card_id FROM dependencies WHERE from_card_id = ?1",
    )?;
    let depends_on: BTreeSet<String> = stmt
        .query_map(params![id], |r| r.get(0))?
        .collect::<Result<_, _>>()?;

    Ok(Some(Card {
        id,
        kind: CardKind::parse(&kind)
            .map_err(|_| RepositoryError::Corrupt(format!("kind '{kind}'")))?,
        parent_id,
        title,
        status: parse_status(&status)?,
        role,
        priority: Priority(priority),
        depends_on,
        wait_reason: wait_reason
            .as_deref()
            .map(|w| {
                WaitReason::parse(w)
                    .map_err(|_| RepositoryError::Corrupt(format!("wait_reason '{w}'")))
            })
            .transpose()?,
        requirements_ref,
        verification_ref,
        metadata: serde_json::from_str(&metadata).unwrap_or_default(),
        created_at: parse_timestamp(&created_at)?,
        updated_at: parse_timestamp(&updated_at)?,
    }))
}

/// Insert a dependency edge after checking it keeps the graph acyclic.
fn insert_edge_checked(
    tx: &rusqlite::Transaction<'_>,
    from: &str,
    to: &str,
) -> RepositoryResult<()> {
    if from == to {
        return Err(RepositoryError::DependencyCycle {
            from: from.to_owned(),
            to: to.to_owned(),
        });
    }

    // Would `from` become reachable from `to`? DFS over the edge table.
    let mut edges: HashMap<String, Vec<String>> = HashMap::new();
    let mut stmt = tx.prepare("SELECT from_card_id, to_card_id FROM dependencies")?;
    let rows = stmt.query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))?;
    for row in rows {
        let (f, t) = row?;
        edges.entry(f).or_default().push(t);
    }
    drop(stmt);

    let mut stack = vec![to.to_owned()];
    let mut seen: HashSet<String> = HashSet::new();
    while let Some(node) = stack.pop() {
        if node == from {
            return Err(RepositoryError::DependencyCycle {
                from: from.to_owned(),
                to: to.to_owned(),
            });
        }
        if !seen.insert(node.clone()) {
            continue;
        }
        if let Some(next) = edges.get(&node) {
            stack.extend(next.iter().cloned());
        }
    }

    tx.execute(
        "INSERT OR IGNORE INTO dependencies (from_card_id, to_card_id) VALUES (?1, ?2)",
        params![from, to],
    )?;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn append_audit(
    tx: &rusqlite::Transaction<'_>,
    card_id: &str,
    at: DateTime<Utc>,
    actor_role: &str,
    event_kind: &str,
    from_status: Option<CardStatus>,
    to_status: Option<CardStatus>,
    wait_reason: Option<WaitReason>,
    detail: &serde_json::Value,
) -> RepositoryResult<()> {
    let seq: i64 = tx.query_row(
        "SELECT COALESCE(MAX(seq), 0) + 1 FROM audit WHERE card_id = ?1",
        params![card_id],
        |r| r.get(0),
    )?;
    tx.execute(
        "INSERT INTO audit (card_id, seq, at, actor_role, event_kind,
                            from_status, to_status, wait_reason, detail)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            card_id,
            seq,
            at.to_rfc3339(),
            actor_role,
            event_kind,
            from_status.map(|s| s.as_str()),
            to_status.map(|s| s.as_str()),
            wait_reason.map(|w| w.as_str()),
            serde_json::to_string(detail).unwrap_or_else(|_| "{}".into()),
        ],
    )?;
    Ok(())
}
