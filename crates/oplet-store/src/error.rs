//! Store error taxonomy.

use thiserror::Error;

/// Errors surfaced by store operations.
///
/// Only three shapes are meaningful to callers: missing rows, constraint
/// violations (used for log dedup) and exhausted busy retries. Everything
/// else propagates as the underlying engine error.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record not found")]
    NotFound,

    #[error("constraint violation: {0}")]
    Constraint(String),

    #[error("database still busy after {attempts} attempts")]
    BusyExhausted { attempts: u32 },

    #[error("store connection lock poisoned")]
    Poisoned,

    #[error(transparent)]
    Sqlite(rusqlite::Error),
}

impl StoreError {
    /// True when the underlying engine reported a busy/locked condition
    /// that the retry helper may wait out.
    pub fn is_busy(&self) -> bool {
        match self {
            Self::Sqlite(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match err {
            rusqlite::Error::QueryReturnedNoRows => Self::NotFound,
            rusqlite::Error::SqliteFailure(inner, message)
                if inner.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Self::Constraint(message.unwrap_or_else(|| inner.to_string()))
            }
            other => Self::Sqlite(other),
        }
    }
}
