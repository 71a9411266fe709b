use std::sync::Arc;

use ork_domain::config::Config;
use ork_engine::{SessionRegistry, TractionLoop};
use ork_repository::{CardStore, SessionLedger};

/// Shared application state passed to all API handlers.
///
/// Everything is behind an `Arc`: the composition root builds one set of
/// services and every surface (CLI loop, HTTP handlers, webhook intake)
/// borrows the same instances.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<CardStore>,
    pub ledger: Arc<SessionLedger>,
    pub registry: Arc<SessionRegistry>,
    pub traction: Arc<TractionLoop>,
    /// Shared webhook secret (raw bytes), read once from
    /// `ORKET_WEBHOOK_SECRET`. `None` = webhook intake disabled.
    pub webhook_secret: Option<Arc<Vec<u8>>>,
}
