//! Drives job state transitions against the store.
//!
//! Reviewer operations (`approve`, `cancel`, `reauthorize`) and worker results
//! (`complete_generation`, `complete_publish`) all end in one conditional
//! update, so a transition only lands if the job is still where the caller
//! saw it.

use autopost_core::job::DEFAULT_MAX_RETRIES;
use autopost_core::{
    Clock, CollaboratorError, Error, GeneratedContent, Job, JobId, JobStatus, NewJob,
    PublishReceipt, RetryPolicy, Transition,
};
use autopost_db::{Expectation, JobFilter, JobStore};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::PipelineResult;

/// Re-reads before `cancel` gives up on a job that keeps moving.
const CANCEL_ATTEMPTS: usize = 5;

pub struct Pipeline {
    store: Arc<dyn JobStore>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    default_max_retries: u32,
}

impl Pipeline {
    pub fn new(store: Arc<dyn JobStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            retry: RetryPolicy::default(),
            default_max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_default_max_retries(mut self, max_retries: u32) -> Self {
        self.default_max_retries = max_retries;
        self
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Create a `queued` job.
    pub async fn submit(&self, new: NewJob) -> PipelineResult<Job> {
        let job = Job::new(new, self.default_max_retries, self.clock.now())?;
        let job = self.store.insert(&job).await?;
        info!(
            job_id = %job.id,
            owner = %job.owner,
            platform = %job.platform,
            "Submitted job"
        );
        Ok(job)
    }

    pub async fn get(&self, id: &JobId) -> PipelineResult<Job> {
        Ok(self.store.get(id).await?)
    }

    pub async fn list(&self, filter: &JobFilter) -> PipelineResult<Vec<Job>> {
        Ok(self.store.list(filter).await?)
    }

    /// Move a reviewed job to `scheduled`.
    ///
    /// The post time is `scheduled_time` if given, else the generator's
    /// suggestion, else now.
    pub async fn approve(
        &self,
        id: &JobId,
        scheduled_time: Option<DateTime<Utc>>,
    ) -> PipelineResult<Job> {
        let job = self
            .reviewer_transition(id, Transition::Approved { scheduled_time })
            .await?;
        info!(job_id = %id, scheduled_time = ?job.scheduled_time, "Approved job");
        Ok(job)
    }

    /// Return a `needs_reauth` job to `scheduled` once its credentials were
    /// refreshed.
    pub async fn reauthorize(&self, id: &JobId) -> PipelineResult<Job> {
        let job = self.reviewer_transition(id, Transition::Reauthorized).await?;
        info!(job_id = %id, "Reauthorized job");
        Ok(job)
    }

    /// Cancel a job from any non-terminal state.
    ///
    /// Cancellation wins over an in-flight worker: the worker's own result
    /// then fails with a conflict.
    pub async fn cancel(&self, id: &JobId) -> PipelineResult<Job> {
        let mut attempt = 1;
        loop {
            let current = self.store.get(id).await?;
            if current.status.is_terminal() {
                return Err(Error::InvalidTransition {
                    from: current.status,
                    transition: Transition::Canceled.name(),
                }
                .into());
            }

            match self
                .apply(id, Expectation::status(current.status), Transition::Canceled)
                .await
            {
                Err(e) if e.is_conflict() && attempt < CANCEL_ATTEMPTS => {
                    debug!(job_id = %id, attempt, error = %e, "Cancel raced, retrying");
                    attempt += 1;
                }
                Ok(job) => {
                    info!(job_id = %id, from = %current.status, "Canceled job");
                    return Ok(job);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Record the generator's result for a job held by `worker_id`.
    pub async fn complete_generation(
        &self,
        id: &JobId,
        worker_id: &str,
        result: Result<GeneratedContent, CollaboratorError>,
    ) -> PipelineResult<Job> {
        // Rejected generator credentials are not the platform's: retry them.
        let transition = match result {
            Ok(content) => Transition::GenerationSucceeded(content),
            Err(e) => Transition::GenerationFailed {
                error: e.to_string(),
            },
        };

        let job = self
            .apply(
                id,
                Expectation::held(JobStatus::Generating, worker_id),
                transition,
            )
            .await?;
        log_outcome(&job, worker_id);
        Ok(job)
    }

    /// Record the publisher's result for a job held by `worker_id`.
    pub async fn complete_publish(
        &self,
        id: &JobId,
        worker_id: &str,
        result: Result<PublishReceipt, CollaboratorError>,
    ) -> PipelineResult<Job> {
        let transition = match result {
            Ok(receipt) => Transition::PublishSucceeded(receipt),
            Err(e @ CollaboratorError::Transient(_)) => Transition::PublishFailed {
                error: e.to_string(),
            },
            Err(e @ CollaboratorError::Auth(_)) => Transition::AuthFailed {
                error: e.to_string(),
            },
        };

        let job = self
            .apply(id, Expectation::held(JobStatus::Posting, worker_id), transition)
            .await?;
        log_outcome(&job, worker_id);
        Ok(job)
    }

    async fn reviewer_transition(&self, id: &JobId, transition: Transition) -> PipelineResult<Job> {
        let current = self.store.get(id).await?;
        if !transition.accepts(current.status) {
            return Err(Error::InvalidTransition {
                from: current.status,
                transition: transition.name(),
            }
            .into());
        }
        self.apply(id, Expectation::status(current.status), transition)
            .await
    }

    async fn apply(
        &self,
        id: &JobId,
        expect: Expectation,
        transition: Transition,
    ) -> PipelineResult<Job> {
        let now = self.clock.now();
        let retry = &self.retry;
        let job = self
            .store
            .update_if_status(
                id,
                expect,
                now,
                Box::new(move |job: &mut Job| {
                    transition.apply(job, retry, now).map(|_| ())
                }),
            )
            .await?;
        Ok(job)
    }
}

fn log_outcome(job: &Job, worker_id: &str) {
    match job.status {
        JobStatus::NeedsReview => {
            info!(job_id = %job.id, worker_id, status = %job.status, "Generated content")
        }
        JobStatus::Posted => info!(
            job_id = %job.id,
            worker_id,
            status = %job.status,
            posted_url = job.posted_url.as_deref().unwrap_or_default(),
            "Published job"
        ),
        JobStatus::Queued | JobStatus::Scheduled => warn!(
            job_id = %job.id,
            worker_id,
            status = %job.status,
            retry_count = job.retry_count,
            max_retries = job.max_retries,
            error = job.error_message.as_deref().unwrap_or_default(),
            "Attempt failed, requeued"
        ),
        JobStatus::NeedsReauth => warn!(
            job_id = %job.id,
            worker_id,
            status = %job.status,
            error = job.error_message.as_deref().unwrap_or_default(),
            "Platform rejected credentials"
        ),
        JobStatus::Failed => error!(
            job_id = %job.id,
            worker_id,
            status = %job.status,
            error = job.error_message.as_deref().unwrap_or_default(),
            "Job failed"
        ),
        _ => debug!(job_id = %job.id, worker_id, status = %job.status, "Job updated"),
    }
}
