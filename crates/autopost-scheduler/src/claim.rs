//! Claim manager: hands out at most one in-flight job per phase to competing
//! workers.

use autopost_core::{Clock, Job, JobId, Phase};
use autopost_db::{ClaimRequest, DbResult, JobStore};
use chrono::{DateTime, TimeDelta, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Default age after which a claim is considered abandoned.
pub const DEFAULT_STALE_LOCK: Duration = Duration::from_secs(10 * 60);

#[derive(Clone)]
pub struct ClaimManager {
    store: Arc<dyn JobStore>,
    clock: Arc<dyn Clock>,
    stale_after: TimeDelta,
}

impl ClaimManager {
    pub fn new(store: Arc<dyn JobStore>, clock: Arc<dyn Clock>) -> Self {
        Self::with_stale_lock(store, clock, DEFAULT_STALE_LOCK)
    }

    pub fn with_stale_lock(
        store: Arc<dyn JobStore>,
        clock: Arc<dyn Clock>,
        stale_lock: Duration,
    ) -> Self {
        Self {
            store,
            clock,
            stale_after: TimeDelta::from_std(stale_lock).unwrap_or(TimeDelta::MAX),
        }
    }

    /// Claim the oldest claimable `queued` job and move it to `generating`.
    ///
    /// A `generating` job whose lock was released or went stale is picked up
    /// as well, so a crashed generator does not strand its job.
    pub async fn claim_next_queued(&self, worker_id: &str) -> DbResult<Option<Job>> {
        self.claim(Phase::Generation, worker_id).await
    }

    /// Claim the oldest due `scheduled` job and move it to `posting`.
    ///
    /// A `posting` job whose lock was released or went stale is picked up as
    /// well.
    pub async fn claim_next_scheduled(&self, worker_id: &str) -> DbResult<Option<Job>> {
        self.claim(Phase::Publish, worker_id).await
    }

    /// Give up a held job without changing its status.
    pub async fn release(&self, id: &JobId, worker_id: &str) -> DbResult<bool> {
        let released = self.store.release(id, worker_id, self.clock.now()).await?;
        if released {
            info!(job_id = %id, worker_id, "Released job");
        } else {
            debug!(job_id = %id, worker_id, "Release skipped: lock not held");
        }
        Ok(released)
    }

    async fn claim(&self, phase: Phase, worker_id: &str) -> DbResult<Option<Job>> {
        let now = self.clock.now();
        let job = self
            .store
            .claim_next(ClaimRequest {
                phase,
                worker_id,
                now,
                stale_before: self.stale_before(now),
            })
            .await?;

        if let Some(job) = &job {
            debug!(job_id = %job.id, worker_id, %phase, "Claimed job");
        }
        Ok(job)
    }

    fn stale_before(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now.checked_sub_signed(self.stale_after)
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}
