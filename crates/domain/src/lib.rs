//! Shared domain types for the Orket orchestration engine.
//!
//! Everything here is plain data: cards, sessions, turns, roles, dialects,
//! the typed config, and the error taxonomy. No I/O lives in this crate.

pub mod card;
pub mod clock;
pub mod config;
pub mod digest;
pub mod error;
pub mod role;
pub mod session;
pub mod trace;

pub use card::{Card, CardKind, CardStatus, Priority, WaitReason};
pub use clock::{Clock, SystemClock};
pub use config::Config;
pub use error::{Error, Result};
pub use role::{Dialect, Role};
pub use session::{SessionOutcome, SessionRecord, ToolCall, TurnRecord};
