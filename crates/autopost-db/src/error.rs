//! Database error types.

use autopost_core::{JobId, JobStatus};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("duplicate: {0}")]
    Duplicate(String),

    /// The row no longer matches what the caller expected: another actor
    /// moved it first. Safe to drop and re-read.
    #[error("conflict on job {id}: expected {expected}, found {actual}")]
    Conflict {
        id: JobId,
        expected: String,
        actual: String,
    },

    /// The mutation refused to apply.
    #[error(transparent)]
    Rejected(#[from] autopost_core::Error),

    #[error("corrupt row: {0}")]
    Corrupt(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

impl DbError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, DbError::Conflict { .. })
    }

    pub(crate) fn status_conflict(id: &JobId, expected: JobStatus, actual: JobStatus) -> Self {
        DbError::Conflict {
            id: id.clone(),
            expected: format!("status {}", expected),
            actual: format!("status {}", actual),
        }
    }

    pub(crate) fn lock_conflict(id: &JobId, expected: &str, actual: Option<&str>) -> Self {
        DbError::Conflict {
            id: id.clone(),
            expected: format!("lock held by {}", expected),
            actual: match actual {
                Some(owner) => format!("lock held by {}", owner),
                None => "no lock".to_string(),
            },
        }
    }
}

pub type DbResult<T> = std::result::Result<T, DbError>;
