/// Repository-level failures.
#[derive(thiserror::Error, Debug)]
pub enum RepositoryError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("card not found: {0}")]
    CardNotFound(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("card already exists: {0}")]
    DuplicateCard(String),

    #[error("dependency {from} -> {to} would close a cycle")]
    DependencyCycle { from: String, to: String },

    #[error("stored row is corrupt: {0}")]
    Corrupt(String),
}

pub type RepositoryResult<T> = std::result::Result<T, RepositoryError>;

impl From<RepositoryError> for ork_domain::error::Error {
    fn from(e: RepositoryError) -> Self {
        use ork_domain::error::Error;
        match e {
            RepositoryError::CardNotFound(id) => Error::CardNotFound(id),
            RepositoryError::SessionNotFound(id) => Error::SessionNotFound(id),
            RepositoryError::Corrupt(detail) => Error::StorageCorrupt(detail),
            other => Error::Other(other.to_string()),
        }
    }
}
