//! Durable persistence for cards and the session ledger.
//!
//! Two embedded SQLite files per workspace: `cards.db` (cards,
//! dependencies, audit) and `ledger.db` (sessions, turns, session
//! events). All writes are serialized through a single writer handle;
//! every logical write is one transaction.

pub mod error;
pub mod ledger;
pub mod store;

pub use error::{RepositoryError, RepositoryResult};
pub use ledger::{SessionLedger, SessionSnapshot};
pub use store::{AuditEntry, CardStore, TransitionOutcome, TransitionRequest};
