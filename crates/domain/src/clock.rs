//! Time source and ID generation.
//!
//! Scheduling and ledger ordering are sensitive to time, so everything
//! that needs "now" takes a [`Clock`] instead of calling `Utc::now()`
//! directly. Tests use a manual clock.

use std::sync::Arc;
use std::sync::Mutex;

use chrono::{DateTime, TimeZone, Utc};

/// Monotonic-enough UTC time source.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock implementation.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually advanced clock for tests.
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Start at a fixed, readable epoch.
    pub fn at_epoch() -> Self {
        Self::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap())
    }

    pub fn advance(&self, delta: chrono::Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += delta;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Shared clock handle used throughout the engine.
pub type SharedClock = Arc<dyn Clock>;

/// Mint a new session ID.
pub fn new_session_id() -> String {
    format!("sess-{}", uuid::Uuid::new_v4())
}

/// Mint a new turn ID.
pub fn new_turn_id() -> String {
    format!("turn-{}", uuid::Uuid::new_v4())
}
