//! Session ledger — sessions, turns, and the append-only event stream.
//!
//! Lives in its own `ledger.db` so audit history and card state can be
//! backed up and inspected independently. Same single-writer discipline
//! as the card store.

use std::path::Path;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};

use ork_domain::session::{SessionOutcome, SessionRecord, TurnRecord};

use crate::error::{RepositoryError, RepositoryResult};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS sessions (
    session_id     TEXT PRIMARY KEY,
    target_card_id TEXT NOT NULL,
    started_at     TEXT NOT NULL,
    ended_at       TEXT,
    turn_count     INTEGER NOT NULL DEFAULT 0,
    outcome        TEXT
);

CREATE TABLE IF NOT EXISTS turns (
    turn_id             TEXT PRIMARY KEY,
    session_id          TEXT NOT NULL REFERENCES sessions(session_id),
    card_id             TEXT NOT NULL,
    role                TEXT NOT NULL,
    prompt_digest       TEXT NOT NULL,
    response_digest     TEXT NOT NULL,
    tool_calls          TEXT NOT NULL DEFAULT '[]',
    transition_proposed TEXT,
    transition_applied  TEXT,
    failure_code        TEXT,
    started_at          TEXT NOT NULL,
    ended_at            TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_turns_session ON turns(session_id);

CREATE TABLE IF NOT EXISTS session_events (
    session_id TEXT NOT NULL REFERENCES sessions(session_id),
    seq        INTEGER NOT NULL,
    at         TEXT NOT NULL,
    kind       TEXT NOT NULL,
    detail     TEXT NOT NULL DEFAULT '{}',
    PRIMARY KEY (session_id, seq)
);
";

/// One ledger event row.
#[derive(Debug, Clone, serde::Serialize)]
pub struct LedgerEvent {
    pub seq: i64,
    pub at: DateTime<Utc>,
    pub kind: String,
    pub detail: serde_json::Value,
}

/// A consistent view of one session: record, turns, events.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SessionSnapshot {
    pub session: SessionRecord,
    pub turns: Vec<TurnRecord>,
    pub events: Vec<LedgerEvent>,
}

pub struct SessionLedger {
    conn: Mutex<Connection>,
}

impl SessionLedger {
    pub fn open(path: &Path) -> RepositoryResult<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA)?;
        tracing::info!(path = %path.display(), "session ledger open");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> RepositoryResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    // ── Writes ─────────────────────────────────────────────────────

    pub fn open_session(&self, session: &SessionRecord) -> RepositoryResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO sessions (session_id, target_card_id, started_at,
                                   ended_at, turn_count, outcome)
             VALUES (?1, ?2, ?3, NULL, 0, NULL)",
            params![
                session.session_id,
                session.target_card_id,
                session.started_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Append one turn and bump the session turn counter atomically.
    pub fn append_turn(&self, turn: &TurnRecord) -> RepositoryResult<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            "INSERT INTO turns (turn_id, session_id, card_id, role,
                                prompt_digest, response_digest, tool_calls,
                                transition_proposed, transition_applied,
                                failure_code, started_at, ended_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                turn.turn_id,
                turn.session_id,
                turn.card_id,
                turn.role,
                turn.prompt_digest,
                turn.response_digest,
                serde_json::to_string(&turn.tool_calls)
                    .unwrap_or_else(|_| "[]".into()),
                turn.transition_proposed
                    .as_ref()
                    .map(|t| serde_json::to_string(t).unwrap_or_default()),
                turn.transition_applied
                    .as_ref()
                    .map(|t| serde_json::to_string(t).unwrap_or_default()),
                turn.failure_code,
                turn.started_at.to_rfc3339(),
                turn.ended_at.to_rfc3339(),
            ],
        )?;
        let changed = tx.execute(
            "UPDATE sessions SET turn_count = turn_count + 1 WHERE session_id = ?1",
            params![turn.session_id],
        )?;
        if changed == 0 {
            return Err(RepositoryError::SessionNotFound(turn.session_id.clone()));
        }
        tx.commit()?;
        Ok(())
    }

    /// Append a ledger event (checkpoint, retry, diagnostic, lesson, ...).
    pub fn append_event(
        &self,
        session_id: &str,
        at: DateTime<Utc>,
        kind: &str,
        detail: &serde_json::Value,
    ) -> RepositoryResult<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let seq: i64 = tx.query_row(
            "SELECT COALESCE(MAX(seq), 0) + 1 FROM session_events WHERE session_id = ?1",
            params![session_id],
            |r| r.get(0),
        )?;
        tx.execute(
            "INSERT INTO session_events (session_id, seq, at, kind, detail)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                session_id,
                seq,
                at.to_rfc3339(),
                kind,
                serde_json::to_string(detail).unwrap_or_else(|_| "{}".into()),
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn close_session(
        &self,
        session_id: &str,
        ended_at: DateTime<Utc>,
        outcome: &SessionOutcome,
    ) -> RepositoryResult<()> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE sessions SET ended_at = ?2, outcome = ?3 WHERE session_id = ?1",
            params![
                session_id,
                ended_at.to_rfc3339(),
                serde_json::to_string(outcome).unwrap_or_default(),
            ],
        )?;
        if changed == 0 {
            return Err(RepositoryError::SessionNotFound(session_id.to_owned()));
        }
        Ok(())
    }

    /// Startup recovery: any session without an `ended_at` was cut off by
    /// a crash or kill — mark it interrupted. Returns how many.
    pub fn mark_interrupted_sessions(&self, at: DateTime<Utc>) -> RepositoryResult<usize> {
        let conn = self.conn.lock();
        let outcome = serde_json::to_string(&SessionOutcome::Interrupted).unwrap_or_default();
        let changed = conn.execute(
            "UPDATE sessions SET ended_at = ?1, outcome = ?2 WHERE ended_at IS NULL",
            params![at.to_rfc3339(), outcome],
        )?;
        if changed > 0 {
            tracing::warn!(count = changed, "marked dangling sessions interrupted");
        }
        Ok(changed)
    }

    // ── Reads ──────────────────────────────────────────────────────

    pub fn get_session(&self, session_id: &str) -> RepositoryResult<SessionRecord> {
        let conn = self.conn.lock();
        query_session(&conn, session_id)?
            .ok_or_else(|| RepositoryError::SessionNotFound(session_id.to_owned()))
    }

    /// Sessions that have not ended.
    pub fn active_sessions(&self) -> RepositoryResult<Vec<SessionRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT session_id FROM sessions WHERE ended_at IS NULL ORDER BY started_at ASC",
        )?;
        let ids: Vec<String> = stmt
            .query_map([], |r| r.get(0))?
            .collect::<Result<_, _>>()?;
        drop(stmt);
        ids.iter()
            .map(|id| {
                query_session(&conn, id)?
                    .ok_or_else(|| RepositoryError::SessionNotFound(id.clone()))
            })
            .collect()
    }

    /// Full snapshot: record plus turns and events in commit order.
    pub fn snapshot(&self, session_id: &str) -> RepositoryResult<SessionSnapshot> {
        let conn = self.conn.lock();
        let session = query_session(&conn, session_id)?
            .ok_or_else(|| RepositoryError::SessionNotFound(session_id.to_owned()))?;

        let mut stmt = conn.prepare(
            "SELECT turn_id, session_id, card_id, role, prompt_digest,
                    response_digest, tool_calls, transition_proposed,
                    transition_applied, failure_code, started_at, ended_at
             FROM turns WHERE session_id = ?1 ORDER BY started_at ASC, turn_id ASC",
        )?;
        let turn_rows = stmt.query_map(params![session_id], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, String>(3)?,
                r.get::<_, String>(4)?,
                r.get::<_, String>(5)?,
                r.get::<_, String>(6)?,
                r.get::<_, Option<String>>(7)?,
                r.get::<_, Option<String>>(8)?,
                r.get::<_, Option<String>>(9)?,
                r.get::<_, String>(10)?,
                r.get::<_, String>(11)?,
            ))
        })?;

        let mut turns = Vec::new();
        for row in turn_rows {
            let (
                turn_id,
                session_id,
                card_id,
                role,
                prompt_digest,
                response_digest,
                tool_calls,
                proposed,
                applied,
                failure_code,
                started_at,
                ended_at,
            ) = row?;
            turns.push(TurnRecord {
                turn_id,
                session_id,
                card_id,
                role,
                prompt_digest,
                response_digest,
                tool_calls: serde_json::from_str(&tool_calls)
                    .map_err(|e| RepositoryError::Corrupt(format!("tool_calls: {e}")))?,
                transition_proposed: parse_opt_json(proposed.as_deref())?,
                transition_applied: parse_opt_json(applied.as_deref())?,
                failure_code,
                started_at: parse_timestamp(&started_at)?,
                ended_at: parse_timestamp(&ended_at)?,
            });
        }
        drop(stmt);

        let mut stmt = conn.prepare(
            "SELECT seq, at, kind, detail FROM session_events
             WHERE session_id = ?1 ORDER BY seq ASC",
        )?;
        let event_rows = stmt.query_map(params![session_id], |r| {
            Ok((
                r.get::<_, i64>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, String>(3)?,
            ))
        })?;
        let mut events = Vec::new();
        for row in event_rows {
            let (seq, at, kind, detail) = row?;
            events.push(LedgerEvent {
                seq,
                at: parse_timestamp(&at)?,
                kind,
                detail: serde_json::from_str(&detail).unwrap_or(serde_json::Value::Null),
            });
        }

        Ok(SessionSnapshot {
            session,
            turns,
            events,
        })
    }
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| RepositoryError::Corrupt(format!("timestamp '{s}'")))
}

fn parse_opt_json<T: serde::de::DeserializeOwned>(
    raw: Option<&str>,
) -> Result<Option<T>, RepositoryError> {
    raw.map(|s| {
        serde_json::from_str(s).map_err(|e| RepositoryError::Corrupt(format!("json column: {e}")))
    })
    .transpose()
}

fn query_session(
    conn: &Connection,
    session_id: &str,
) -> RepositoryResult<Option<SessionRecord>> {
    let row = conn
        .query_row(
            "SELECT session_id, target_card_id, started_at, ended_at, turn_count, outcome
             FROM sessions WHERE session_id = ?1",
            params![session_id],
            |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, String>(2)?,
                    r.get::<_, Option<String>>(3)?,
                    r.get::<_, i64>(4)?,
                    r.get::<_, Option<String>>(5)?,
                ))
            },
        )
        .optional()?;

    let Some((session_id, target_card_id, started_at, ended_at, turn_count, outcome)) = row
    else {
        return Ok(None);
    };

    Ok(Some(SessionRecord {
        session_id,
        target_card_id,
        started_at: parse_timestamp(&started_at)?,
        ended_at: ended_at.as_deref().map(parse_timestamp).transpose()?,
        turn_count: turn_count as u32,
        outcome: parse_opt_json(outcome.as_deref())?,
    }))
}
