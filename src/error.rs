//! Error type shared by the library modules.
//!
//! The binary wraps these in `anyhow` at its edges; inside the engine every
//! fallible operation returns [`Result`] so callers can tell a missing id from
//! a storage outage or a flaky analysis service.

use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, PersonaError>;

/// The kind of entity an id refers to, for `NotFound` and `PermanentEntity`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Memory,
    Node,
    Association,
    QueueEntry,
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Memory => "memory",
            Self::Node => "node",
            Self::Association => "association",
            Self::QueueEntry => "queue entry",
        })
    }
}

#[derive(Debug, Error)]
pub enum PersonaError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: EntityKind, id: String },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("{kind} {id} is permanent")]
    PermanentEntity { kind: EntityKind, id: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("analysis failed: {0}")]
    Analysis(String),

    #[error("analysis timed out after {0:?}")]
    Timeout(Duration),

    #[error("reply delivery failed: {0}")]
    Delivery(String),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("lock poisoned: {0}")]
    LockPoisoned(String),

    #[error("background task failed: {0}")]
    Task(String),
}

impl PersonaError {
    pub fn not_found(kind: EntityKind, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Failures worth retrying on the next cycle: the analysis service was
    /// unavailable or slow. Everything else is either a caller bug or an
    /// operator problem.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Analysis(_) | Self::Timeout(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Map `QueryReturnedNoRows` to a typed `NotFound`, pass everything else through.
pub(crate) fn or_not_found(err: rusqlite::Error, kind: EntityKind, id: &str) -> PersonaError {
    match err {
        rusqlite::Error::QueryReturnedNoRows => PersonaError::not_found(kind, id),
        other => PersonaError::Storage(other),
    }
}
