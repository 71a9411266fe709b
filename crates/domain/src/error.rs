/// Shared error type used across all Orket crates.
///
/// Component-specific failure sets (transition errors, gate violations,
/// parse issues, provider errors, turn outcomes) are their own enums in
/// their own crates; this type covers the cross-cutting and fatal kinds.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("card not found: {0}")]
    CardNotFound(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("unknown role: {0}")]
    UnknownRole(String),

    #[error("unknown dialect: {0}")]
    UnknownDialect(String),

    #[error("a session is already active for target {0}")]
    SessionActive(String),

    #[error("config: {0}")]
    ConfigInvalid(String),

    #[error("storage corrupt: {0}")]
    StorageCorrupt(String),

    #[error("workspace missing: {0}")]
    WorkspaceMissing(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Fatal errors abort the process with a non-zero exit code; everything
    /// else is recoverable at some level of the orchestrator.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::ConfigInvalid(_) | Error::StorageCorrupt(_) | Error::WorkspaceMissing(_)
        )
    }
}
