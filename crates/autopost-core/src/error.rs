//! Error types for Autopost.

use thiserror::Error;

use crate::JobStatus;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("invalid transition: {transition} is not allowed from {from}")]
    InvalidTransition {
        from: JobStatus,
        transition: &'static str,
    },

    #[error("invariant violated: {0}")]
    InvariantViolation(String),
}

pub type Result<T> = std::result::Result<T, Error>;
