//! Polling workers.
//!
//! Each worker runs two independent loops: generation
//! (`queued -> generating -> needs_review`) and publishing
//! (`scheduled -> posting -> posted`). All coordination between workers goes
//! through the store.

use autopost_core::{CollaboratorError, Generator, Job, JobId, Phase, Publisher};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::{ClaimManager, Pipeline, PipelineResult};

/// Cooperative stop signal shared by all loops of a process.
#[derive(Debug, Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    /// A trigger and its signal. Send `true` to stop.
    pub fn channel() -> (watch::Sender<bool>, Shutdown) {
        let (tx, rx) = watch::channel(false);
        (tx, Shutdown { rx })
    }

    /// A signal that never fires.
    pub fn never() -> Shutdown {
        let (_tx, rx) = watch::channel(false);
        Shutdown { rx }
    }

    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once shutdown is requested. Pends forever if the trigger was
    /// dropped without firing.
    pub async fn wait(&self) {
        let mut rx = self.rx.clone();
        if rx.wait_for(|stop| *stop).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerSettings {
    /// Sleep when nothing is claimable.
    pub poll_interval: Duration,
    /// Sleep after a store error.
    pub error_backoff: Duration,
    pub generate_timeout: Duration,
    pub publish_timeout: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            error_backoff: Duration::from_secs(5),
            generate_timeout: Duration::from_secs(120),
            publish_timeout: Duration::from_secs(300),
        }
    }
}

/// Result of a single poll iteration.
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    /// Nothing was claimable.
    Idle,
    /// A claimed job reached its next state.
    Completed(Job),
    /// The job moved on while we held it (canceled, or our stale lock was
    /// taken over); our result was discarded.
    Dropped,
    /// Shutdown interrupted the job and its lock was given up.
    Released,
}

pub struct Worker {
    id: String,
    claims: ClaimManager,
    pipeline: Arc<Pipeline>,
    generator: Arc<dyn Generator>,
    publisher: Arc<dyn Publisher>,
    settings: WorkerSettings,
    shutdown: Shutdown,
}

impl Worker {
    pub fn new(
        id: impl Into<String>,
        claims: ClaimManager,
        pipeline: Arc<Pipeline>,
        generator: Arc<dyn Generator>,
        publisher: Arc<dyn Publisher>,
    ) -> Self {
        Self {
            id: id.into(),
            claims,
            pipeline,
            generator,
            publisher,
            settings: WorkerSettings::default(),
            shutdown: Shutdown::never(),
        }
    }

    pub fn with_settings(mut self, settings: WorkerSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_shutdown(mut self, shutdown: Shutdown) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Run both loops until shutdown.
    pub async fn run(&self) {
        info!(
            worker_id = %self.id,
            generator = self.generator.name(),
            publisher = self.publisher.name(),
            "Starting worker"
        );

        tokio::join!(
            self.poll_loop(Phase::Generation, || self.run_generation_once()),
            self.poll_loop(Phase::Publish, || self.run_publish_once()),
        );

        info!(worker_id = %self.id, "Worker stopped");
    }

    /// Claim one queued job and generate its content.
    pub async fn run_generation_once(&self) -> PipelineResult<PollOutcome> {
        let Some(job) = self.claims.claim_next_queued(&self.id).await? else {
            return Ok(PollOutcome::Idle);
        };
        info!(
            job_id = %job.id,
            worker_id = %self.id,
            generator = self.generator.name(),
            "Generating content"
        );

        let limit = self.settings.generate_timeout;
        let result = tokio::select! {
            biased;
            _ = self.shutdown.wait() => {
                self.claims.release(&job.id, &self.id).await?;
                return Ok(PollOutcome::Released);
            }
            result = timeout(limit, self.generator.generate(&job)) => {
                result.unwrap_or_else(|_| Err(timed_out("generator", limit)))
            }
        };

        let completed = self
            .pipeline
            .complete_generation(&job.id, &self.id, result)
            .await;
        self.settle(&job.id, completed).await
    }

    /// Claim one due scheduled job and publish it.
    ///
    /// A publish call is never interrupted by shutdown: abandoning an upload
    /// half way could post twice once the job is reclaimed.
    pub async fn run_publish_once(&self) -> PipelineResult<PollOutcome> {
        let Some(job) = self.claims.claim_next_scheduled(&self.id).await? else {
            return Ok(PollOutcome::Idle);
        };
        info!(
            job_id = %job.id,
            worker_id = %self.id,
            platform = %job.platform,
            publisher = self.publisher.name(),
            "Publishing job"
        );

        let limit = self.settings.publish_timeout;
        let result = timeout(limit, self.publisher.publish(&job))
            .await
            .unwrap_or_else(|_| Err(timed_out("publisher", limit)));

        let completed = self.pipeline.complete_publish(&job.id, &self.id, result).await;
        self.settle(&job.id, completed).await
    }

    async fn poll_loop<F, Fut>(&self, phase: Phase, once: F)
    where
        F: Fn() -> Fut,
        Fut: Future<Output = PipelineResult<PollOutcome>>,
    {
        info!(worker_id = %self.id, %phase, "Starting poll loop");

        while !self.shutdown.is_triggered() {
            let pause = match once().await {
                Ok(PollOutcome::Idle) => self.settings.poll_interval,
                Ok(PollOutcome::Released) => break,
                Ok(PollOutcome::Completed(_) | PollOutcome::Dropped) => continue,
                Err(e) => {
                    warn!(worker_id = %self.id, %phase, error = %e, "Poll failed");
                    self.settings.error_backoff
                }
            };

            tokio::select! {
                _ = self.shutdown.wait() => break,
                _ = sleep(pause) => {}
            }
        }

        info!(worker_id = %self.id, %phase, "Poll loop stopped");
    }

    /// Turn a lost race into [`PollOutcome::Dropped`].
    async fn settle(
        &self,
        id: &JobId,
        completed: PipelineResult<Job>,
    ) -> PipelineResult<PollOutcome> {
        match completed {
            Ok(job) => Ok(PollOutcome::Completed(job)),
            Err(e) if e.is_conflict() => {
                let status = self.pipeline.get(id).await.map(|j| j.status).ok();
                debug!(
                    job_id = %id,
                    worker_id = %self.id,
                    current = ?status,
                    error = %e,
                    "Job moved on, dropping result"
                );
                Ok(PollOutcome::Dropped)
            }
            Err(e) => Err(e),
        }
    }
}

fn timed_out(collaborator: &str, limit: Duration) -> CollaboratorError {
    CollaboratorError::Transient(format!(
        "{} timed out after {}s",
        collaborator,
        limit.as_secs_f64()
    ))
}
