//! Job store trait.

use async_trait::async_trait;
use autopost_core::{Job, JobId, JobStatus, Phase};
use chrono::{DateTime, Utc};

use crate::{DbError, DbResult};

/// A change applied to a job inside [`JobStore::update_if_status`].
///
/// Runs while the row is held exclusively. Returning an error aborts the
/// update and leaves the stored row unchanged.
pub type Mutation<'a> = Box<dyn FnOnce(&mut Job) -> autopost_core::Result<()> + Send + 'a>;

/// What the caller believes the stored row looks like.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expectation {
    pub status: JobStatus,
    /// When set, the row must also be locked by this worker.
    pub lock_owner: Option<String>,
}

impl Expectation {
    pub fn status(status: JobStatus) -> Self {
        Self {
            status,
            lock_owner: None,
        }
    }

    /// The row must be in `status` and locked by `worker_id`.
    pub fn held(status: JobStatus, worker_id: impl Into<String>) -> Self {
        Self {
            status,
            lock_owner: Some(worker_id.into()),
        }
    }

    pub(crate) fn check(&self, job: &Job) -> DbResult<()> {
        if job.status != self.status {
            return Err(DbError::status_conflict(&job.id, self.status, job.status));
        }
        if let Some(owner) = &self.lock_owner {
            if !job.is_held_by(owner) {
                return Err(DbError::lock_conflict(
                    &job.id,
                    owner,
                    job.lock_owner.as_deref(),
                ));
            }
        }
        Ok(())
    }
}

/// Parameters of an atomic claim.
#[derive(Debug, Clone, Copy)]
pub struct ClaimRequest<'a> {
    pub phase: Phase,
    pub worker_id: &'a str,
    pub now: DateTime<Utc>,
    /// Locks taken before this instant are stale.
    pub stale_before: DateTime<Utc>,
}

/// Filter for listing jobs.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub owner: Option<String>,
    pub status: Option<JobStatus>,
    pub limit: Option<u32>,
}

impl JobFilter {
    pub(crate) fn matches(&self, job: &Job) -> bool {
        self.owner.as_ref().is_none_or(|o| *o == job.owner)
            && self.status.is_none_or(|s| s == job.status)
    }
}

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a new job.
    async fn insert(&self, job: &Job) -> DbResult<Job>;

    async fn get(&self, id: &JobId) -> DbResult<Job>;

    /// Jobs matching `filter`, oldest first.
    async fn list(&self, filter: &JobFilter) -> DbResult<Vec<Job>>;

    /// Atomically verify `expect` against the stored row, apply `mutation`
    /// and persist the result with `updated_at = now`.
    ///
    /// Fails with [`DbError::Conflict`] when the row has moved on. Only the
    /// mutable columns are written; identity, ownership, media and
    /// user-supplied metadata never change.
    async fn update_if_status(
        &self,
        id: &JobId,
        expect: Expectation,
        now: DateTime<Utc>,
        mutation: Mutation<'_>,
    ) -> DbResult<Job>;

    /// Select the next claimable job for the phase and mark it claimed, as a
    /// single atomic operation. Concurrent callers never win the same row.
    async fn claim_next(&self, request: ClaimRequest<'_>) -> DbResult<Option<Job>>;

    /// Clear the lock held by `worker_id` without touching the status.
    /// Returns `false` if the worker did not hold the lock.
    async fn release(&self, id: &JobId, worker_id: &str, now: DateTime<Utc>) -> DbResult<bool>;

    /// Cheap connectivity check.
    async fn ping(&self) -> DbResult<()>;
}
