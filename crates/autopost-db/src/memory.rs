//! In-memory job store.
//!
//! Every operation runs under one lock, which gives the same atomicity as the
//! row-level locking of the PostgreSQL store. Used by tests and single-process
//! local runs.

use async_trait::async_trait;
use autopost_core::{Job, JobId, Phase};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::Mutex;

use crate::{ClaimRequest, DbError, DbResult, Expectation, JobFilter, JobStore, Mutation};

#[derive(Debug, Default)]
pub struct MemoryJobStore {
    jobs: Mutex<HashMap<JobId, Job>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Claim order within a phase: generation is oldest-created first,
/// publishing is earliest-scheduled first.
fn claim_order(phase: Phase, job: &Job) -> (DateTime<Utc>, DateTime<Utc>, &JobId) {
    let primary = match phase {
        Phase::Generation => job.created_at,
        Phase::Publish => job.scheduled_time.unwrap_or(job.created_at),
    };
    (primary, job.created_at, &job.id)
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert(&self, job: &Job) -> DbResult<Job> {
        job.check_invariants()?;
        let mut jobs = self.jobs.lock().await;
        if jobs.contains_key(&job.id) {
            return Err(DbError::Duplicate(format!("job {}", job.id)));
        }
        jobs.insert(job.id.clone(), job.clone());
        Ok(job.clone())
    }

    async fn get(&self, id: &JobId) -> DbResult<Job> {
        self.jobs
            .lock()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("job {}", id)))
    }

    async fn list(&self, filter: &JobFilter) -> DbResult<Vec<Job>> {
        let jobs = self.jobs.lock().await;
        let mut matching: Vec<Job> = jobs.values().filter(|j| filter.matches(j)).cloned().collect();
        matching.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
        if let Some(limit) = filter.limit {
            matching.truncate(limit as usize);
        }
        Ok(matching)
    }

    async fn update_if_status(
        &self,
        id: &JobId,
        expect: Expectation,
        now: DateTime<Utc>,
        mutation: Mutation<'_>,
    ) -> DbResult<Job> {
        let mut jobs = self.jobs.lock().await;
        let stored = jobs
            .get_mut(id)
            .ok_or_else(|| DbError::NotFound(format!("job {}", id)))?;
        expect.check(stored)?;

        let mut updated = stored.clone();
        mutation(&mut updated)?;
        preserve_immutable(stored, &mut updated);
        updated.updated_at = now;
        updated.check_invariants()?;

        *stored = updated.clone();
        Ok(updated)
    }

    async fn claim_next(&self, request: ClaimRequest<'_>) -> DbResult<Option<Job>> {
        let mut jobs = self.jobs.lock().await;
        let next = jobs
            .values()
            .filter(|j| j.is_claimable(request.phase, request.now, request.stale_before))
            .min_by(|a, b| claim_order(request.phase, a).cmp(&claim_order(request.phase, b)))
            .map(|j| j.id.clone());

        let Some(id) = next else {
            return Ok(None);
        };
        let Some(job) = jobs.get_mut(&id) else {
            return Ok(None);
        };
        job.mark_claimed(request.phase, request.worker_id, request.now);
        Ok(Some(job.clone()))
    }

    async fn release(&self, id: &JobId, worker_id: &str, now: DateTime<Utc>) -> DbResult<bool> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs
            .get_mut(id)
            .ok_or_else(|| DbError::NotFound(format!("job {}", id)))?;
        if !job.is_held_by(worker_id) {
            return Ok(false);
        }
        job.clear_lock();
        job.updated_at = now;
        Ok(true)
    }

    async fn ping(&self) -> DbResult<()> {
        Ok(())
    }
}

/// Restore the columns a mutation may not rewrite.
fn preserve_immutable(stored: &Job, updated: &mut Job) {
    updated.id = stored.id.clone();
    updated.owner = stored.owner.clone();
    updated.group = stored.group.clone();
    updated.platform = stored.platform;
    updated.media = stored.media.clone();
    updated.user_title = stored.user_title.clone();
    updated.user_hashtags = stored.user_hashtags.clone();
    updated.created_at = stored.created_at;
}

#[cfg(test)]
mod tests {
    use super::*;
    use autopost_core::job::DEFAULT_MAX_RETRIES;
    use autopost_core::{JobStatus, MediaRef, NewJob, Platform, StorageKind, Transition};
    use chrono::TimeDelta;
    use std::sync::Arc;

    fn make_job(now: DateTime<Utc>) -> Job {
        Job::new(
            NewJob {
                owner: "user-1".to_string(),
                group: None,
                platform: Platform::Youtube,
                media: MediaRef {
                    location: "/uploads/a.mp4".to_string(),
                    storage: StorageKind::Local,
                },
                title: Some("Original".to_string()),
                hashtags: vec![],
                max_retries: None,
            },
            DEFAULT_MAX_RETRIES,
            now,
        )
        .unwrap()
    }

    fn claim(worker_id: &str, phase: Phase, now: DateTime<Utc>) -> ClaimRequest<'_> {
        ClaimRequest {
            phase,
            worker_id,
            now,
            stale_before: now - TimeDelta::minutes(10),
        }
    }

    #[tokio::test]
    async fn test_insert_rejects_duplicate() {
        let store = MemoryJobStore::new();
        let job = make_job(Utc::now());
        store.insert(&job).await.unwrap();
        assert!(matches!(
            store.insert(&job).await,
            Err(DbError::Duplicate(_))
        ));
    }

    #[tokio::test]
    async fn test_get_unknown_is_not_found() {
        let store = MemoryJobStore::new();
        let result = store.get(&JobId::from("missing")).await;
        assert!(matches!(result, Err(DbError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_claims_oldest_first() {
        let store = MemoryJobStore::new();
        let now = Utc::now();
        let older = make_job(now - TimeDelta::minutes(2));
        let newer = make_job(now - TimeDelta::minutes(1));
        store.insert(&newer).await.unwrap();
        store.insert(&older).await.unwrap();

        let first = store
            .claim_next(claim("w1", Phase::Generation, now))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.id, older.id);
        assert_eq!(first.status, JobStatus::Generating);
        assert_eq!(first.lock_owner.as_deref(), Some("w1"));
        assert_eq!(first.locked_at, Some(now));

        let second = store
            .claim_next(claim("w2", Phase::Generation, now))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.id, newer.id);

        assert!(store
            .claim_next(claim("w3", Phase::Generation, now))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_concurrent_claims_have_one_winner() {
        let store = Arc::new(MemoryJobStore::new());
        let now = Utc::now();
        store.insert(&make_job(now)).await.unwrap();

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move {
                    let worker = format!("worker-{}", i);
                    store
                        .claim_next(claim(&worker, Phase::Generation, now))
                        .await
                        .unwrap()
                })
            })
            .collect();

        let results = futures::future::join_all(handles).await;
        let winners = results
            .into_iter()
            .filter(|r| matches!(r, Ok(Some(_))))
            .count();
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_update_if_status_conflicts_on_stale_expectation() {
        let store = MemoryJobStore::new();
        let now = Utc::now();
        let job = make_job(now);
        store.insert(&job).await.unwrap();

        let result = store
            .update_if_status(
                &job.id,
                Expectation::status(JobStatus::NeedsReview),
                now,
                Box::new(|j: &mut Job| {
                    j.status = JobStatus::Scheduled;
                    Ok(())
                }),
            )
            .await;
        assert!(matches!(result, Err(DbError::Conflict { .. })));
        assert_eq!(store.get(&job.id).await.unwrap().status, JobStatus::Queued);
    }

    #[tokio::test]
    async fn test_update_if_status_checks_lock_owner() {
        let store = MemoryJobStore::new();
        let now = Utc::now();
        let job = make_job(now);
        store.insert(&job).await.unwrap();
        store
            .claim_next(claim("w1", Phase::Generation, now))
            .await
            .unwrap();

        let result = store
            .update_if_status(
                &job.id,
                Expectation::held(JobStatus::Generating, "w2"),
                now,
                Box::new(|_: &mut Job| Ok(())),
            )
            .await;
        assert!(result.unwrap_err().is_conflict());
    }

    #[tokio::test]
    async fn test_update_keeps_immutable_fields_and_bumps_updated_at() {
        let store = MemoryJobStore::new();
        let now = Utc::now();
        let job = make_job(now);
        store.insert(&job).await.unwrap();

        let later = now + TimeDelta::seconds(5);
        let updated = store
            .update_if_status(
                &job.id,
                Expectation::status(JobStatus::Queued),
                later,
                Box::new(|j: &mut Job| {
                    j.user_title = Some("Rewritten".to_string());
                    Transition::Canceled
                        .apply(j, &Default::default(), later)
                        .map(|_| ())
                }),
            )
            .await
            .unwrap();

        assert_eq!(updated.status, JobStatus::Canceled);
        assert_eq!(updated.user_title.as_deref(), Some("Original"));
        assert_eq!(updated.updated_at, later);
        assert_eq!(updated.created_at, now);
    }

    #[tokio::test]
    async fn test_rejected_mutation_leaves_row_unchanged() {
        let store = MemoryJobStore::new();
        let now = Utc::now();
        let job = make_job(now);
        store.insert(&job).await.unwrap();

        let result = store
            .update_if_status(
                &job.id,
                Expectation::status(JobStatus::Queued),
                now,
                Box::new(|j: &mut Job| {
                    j.posted_url = Some("https://example.com".to_string());
                    Ok(())
                }),
            )
            .await;
        assert!(matches!(result, Err(DbError::Rejected(_))));
        assert!(store.get(&job.id).await.unwrap().posted_url.is_none());
    }

    #[tokio::test]
    async fn test_release_only_by_holder() {
        let store = MemoryJobStore::new();
        let now = Utc::now();
        let job = make_job(now);
        store.insert(&job).await.unwrap();
        store
            .claim_next(claim("w1", Phase::Generation, now))
            .await
            .unwrap();

        assert!(!store.release(&job.id, "w2", now).await.unwrap());
        assert!(store.release(&job.id, "w1", now).await.unwrap());

        let released = store.get(&job.id).await.unwrap();
        assert_eq!(released.status, JobStatus::Generating);
        assert!(!released.is_locked());

        let reclaimed = store
            .claim_next(claim("w2", Phase::Generation, now))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reclaimed.lock_owner.as_deref(), Some("w2"));
    }

    #[tokio::test]
    async fn test_list_filters_by_owner_and_status() {
        let store = MemoryJobStore::new();
        let now = Utc::now();
        let a = make_job(now);
        let mut b = make_job(now + TimeDelta::seconds(1));
        b.owner = "user-2".to_string();
        store.insert(&a).await.unwrap();
        store.insert(&b).await.unwrap();

        let mine = store
            .list(&JobFilter {
                owner: Some("user-1".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].id, a.id);

        let queued = store
            .list(&JobFilter {
                status: Some(JobStatus::Queued),
                limit: Some(1),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].id, a.id);
    }
}
