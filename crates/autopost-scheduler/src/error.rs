//! Pipeline error types.

use autopost_db::DbError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Store(DbError),

    #[error(transparent)]
    Job(#[from] autopost_core::Error),
}

impl From<DbError> for PipelineError {
    fn from(err: DbError) -> Self {
        match err {
            // A mutation refused inside the store is a job error to callers.
            DbError::Rejected(inner) => PipelineError::Job(inner),
            other => PipelineError::Store(other),
        }
    }
}

impl PipelineError {
    /// Lost a race with another actor; the caller should re-read and usually
    /// drop its own result.
    pub fn is_conflict(&self) -> bool {
        matches!(self, PipelineError::Store(DbError::Conflict { .. }))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, PipelineError::Store(DbError::NotFound(_)))
    }
}

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;
