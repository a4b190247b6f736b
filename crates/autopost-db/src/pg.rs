//! PostgreSQL job store.
//!
//! Claims use `FOR UPDATE SKIP LOCKED` so competing workers skip rows another
//! claim is already taking instead of blocking on them. Conditional updates
//! lock the row with `FOR UPDATE`, compare, and write inside one transaction.
//! Time is always bound from the caller's clock rather than `NOW()`.

use async_trait::async_trait;
use autopost_core::{Job, JobId, MediaRef, Phase};
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::debug;

use crate::{ClaimRequest, DbError, DbResult, Expectation, JobFilter, JobStore, Mutation};

/// A row of `content_jobs`.
#[derive(Debug, Clone, sqlx::FromRow)]
struct JobRow {
    id: String,
    owner: String,
    group_id: Option<String>,
    platform: String,
    media_location: String,
    media_storage: String,
    status: String,
    user_title: Option<String>,
    user_hashtags: Vec<String>,
    ai_title: Option<String>,
    ai_hook: Option<String>,
    ai_hashtags: Vec<String>,
    ai_post_time: Option<DateTime<Utc>>,
    scheduled_time: Option<DateTime<Utc>>,
    retry_count: i32,
    max_retries: i32,
    not_before: Option<DateTime<Utc>>,
    error_message: Option<String>,
    error_at: Option<DateTime<Utc>>,
    posted_url: Option<String>,
    platform_post_id: Option<String>,
    lock_owner: Option<String>,
    locked_at: Option<DateTime<Utc>>,
    needs_reauth: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<JobRow> for Job {
    type Error = DbError;

    fn try_from(row: JobRow) -> DbResult<Self> {
        let corrupt = |field: &str, e: autopost_core::Error| {
            DbError::Corrupt(format!("job {} column {}: {}", row.id, field, e))
        };
        let count = |field: &str, value: i32| {
            u32::try_from(value)
                .map_err(|_| DbError::Corrupt(format!("job {} column {}: {}", row.id, field, value)))
        };

        Ok(Job {
            platform: row.platform.parse().map_err(|e| corrupt("platform", e))?,
            media: MediaRef {
                location: row.media_location.clone(),
                storage: row
                    .media_storage
                    .parse()
                    .map_err(|e| corrupt("media_storage", e))?,
            },
            status: row.status.parse().map_err(|e| corrupt("status", e))?,
            retry_count: count("retry_count", row.retry_count)?,
            max_retries: count("max_retries", row.max_retries)?,
            id: JobId::from(row.id.clone()),
            owner: row.owner,
            group: row.group_id,
            user_title: row.user_title,
            user_hashtags: row.user_hashtags.into_iter().collect(),
            ai_title: row.ai_title,
            ai_hook: row.ai_hook,
            ai_hashtags: row.ai_hashtags.into_iter().collect(),
            ai_post_time: row.ai_post_time,
            scheduled_time: row.scheduled_time,
            not_before: row.not_before,
            error_message: row.error_message,
            error_at: row.error_at,
            posted_url: row.posted_url,
            platform_post_id: row.platform_post_id,
            lock_owner: row.lock_owner,
            locked_at: row.locked_at,
            needs_reauth: row.needs_reauth,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn to_db_count(field: &str, value: u32) -> DbResult<i32> {
    i32::try_from(value).map_err(|_| DbError::Corrupt(format!("{} out of range: {}", field, value)))
}

const CLAIM_GENERATION: &str = r#"
    UPDATE content_jobs
    SET status = 'generating', lock_owner = $1, locked_at = $2, updated_at = $2
    WHERE id = (
        SELECT id FROM content_jobs
        WHERE (
                status = 'queued'
                AND lock_owner IS NULL
                AND (not_before IS NULL OR not_before <= $2)
            )
            OR (
                status = 'generating'
                AND (locked_at IS NULL OR locked_at < $3)
            )
        ORDER BY created_at ASC, id ASC
        LIMIT 1
        FOR UPDATE SKIP LOCKED
    )
    RETURNING *
"#;

const CLAIM_PUBLISH: &str = r#"
    UPDATE content_jobs
    SET status = 'posting', lock_owner = $1, locked_at = $2, updated_at = $2
    WHERE id = (
        SELECT id FROM content_jobs
        WHERE (
                status = 'scheduled'
                AND scheduled_time <= $2
                AND (not_before IS NULL OR not_before <= $2)
                AND (locked_at IS NULL OR locked_at < $3)
            )
            OR (
                status = 'posting'
                AND (locked_at IS NULL OR locked_at < $3)
            )
        ORDER BY scheduled_time ASC, created_at ASC, id ASC
        LIMIT 1
        FOR UPDATE SKIP LOCKED
    )
    RETURNING *
"#;

/// PostgreSQL implementation of JobStore.
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn insert(&self, job: &Job) -> DbResult<Job> {
        job.check_invariants()?;
        let user_hashtags: Vec<String> = job.user_hashtags.iter().cloned().collect();
        let ai_hashtags: Vec<String> = job.ai_hashtags.iter().cloned().collect();

        let row = sqlx::query_as::<_, JobRow>(
            r#"
            INSERT INTO content_jobs (
                id, owner, group_id, platform, media_location, media_storage, status,
                user_title, user_hashtags, ai_title, ai_hook, ai_hashtags, ai_post_time,
                scheduled_time, retry_count, max_retries, not_before, error_message, error_at,
                posted_url, platform_post_id, lock_owner, locked_at, needs_reauth,
                created_at, updated_at
            )
            VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13,
                $14, $15, $16, $17, $18, $19, $20, $21, $22, $23, $24, $25, $26
            )
            RETURNING *
            "#,
        )
        .bind(job.id.as_str())
        .bind(&job.owner)
        .bind(&job.group)
        .bind(job.platform.as_str())
        .bind(&job.media.location)
        .bind(job.media.storage.as_str())
        .bind(job.status.as_str())
        .bind(&job.user_title)
        .bind(&user_hashtags)
        .bind(&job.ai_title)
        .bind(&job.ai_hook)
        .bind(&ai_hashtags)
        .bind(job.ai_post_time)
        .bind(job.scheduled_time)
        .bind(to_db_count("retry_count", job.retry_count)?)
        .bind(to_db_count("max_retries", job.max_retries)?)
        .bind(job.not_before)
        .bind(&job.error_message)
        .bind(job.error_at)
        .bind(&job.posted_url)
        .bind(&job.platform_post_id)
        .bind(&job.lock_owner)
        .bind(job.locked_at)
        .bind(job.needs_reauth)
        .bind(job.created_at)
        .bind(job.updated_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                DbError::Duplicate(format!("job {}", job.id))
            }
            _ => DbError::Database(e),
        })?;

        row.try_into()
    }

    async fn get(&self, id: &JobId) -> DbResult<Job> {
        let row = sqlx::query_as::<_, JobRow>("SELECT * FROM content_jobs WHERE id = $1")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("job {}", id)))?;
        row.try_into()
    }

    async fn list(&self, filter: &JobFilter) -> DbResult<Vec<Job>> {
        let rows = sqlx::query_as::<_, JobRow>(
            r#"
            SELECT * FROM content_jobs
            WHERE ($1::TEXT IS NULL OR owner = $1)
              AND ($2::TEXT IS NULL OR status = $2)
            ORDER BY created_at ASC, id ASC
            LIMIT $3
            "#,
        )
        .bind(&filter.owner)
        .bind(filter.status.map(|s| s.as_str()))
        .bind(filter.limit.map(i64::from))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Job::try_from).collect()
    }

    async fn update_if_status(
        &self,
        id: &JobId,
        expect: Expectation,
        now: DateTime<Utc>,
        mutation: Mutation<'_>,
    ) -> DbResult<Job> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query_as::<_, JobRow>("SELECT * FROM content_jobs WHERE id = $1 FOR UPDATE")
            .bind(id.as_str())
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("job {}", id)))?;
        let current = Job::try_from(row)?;

        // Dropping the transaction rolls back and releases the row lock.
        expect.check(&current)?;

        let mut job = current.clone();
        mutation(&mut job)?;
        job.updated_at = now;
        job.check_invariants()?;

        let ai_hashtags: Vec<String> = job.ai_hashtags.iter().cloned().collect();
        let row = sqlx::query_as::<_, JobRow>(
            r#"
            UPDATE content_jobs
            SET status = $3,
                ai_title = $4,
                ai_hook = $5,
                ai_hashtags = $6,
                ai_post_time = $7,
                scheduled_time = $8,
                retry_count = $9,
                max_retries = $10,
                not_before = $11,
                error_message = $12,
                error_at = $13,
                posted_url = $14,
                platform_post_id = $15,
                lock_owner = $16,
                locked_at = $17,
                needs_reauth = $18,
                updated_at = $19
            WHERE id = $1 AND status = $2
            RETURNING *
            "#,
        )
        .bind(id.as_str())
        .bind(current.status.as_str())
        .bind(job.status.as_str())
        .bind(&job.ai_title)
        .bind(&job.ai_hook)
        .bind(&ai_hashtags)
        .bind(job.ai_post_time)
        .bind(job.scheduled_time)
        .bind(to_db_count("retry_count", job.retry_count)?)
        .bind(to_db_count("max_retries", job.max_retries)?)
        .bind(job.not_before)
        .bind(&job.error_message)
        .bind(job.error_at)
        .bind(&job.posted_url)
        .bind(&job.platform_post_id)
        .bind(&job.lock_owner)
        .bind(job.locked_at)
        .bind(job.needs_reauth)
        .bind(job.updated_at)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        debug!(
            job_id = %id,
            from = %current.status,
            to = %job.status,
            "Job updated"
        );
        row.try_into()
    }

    async fn claim_next(&self, request: ClaimRequest<'_>) -> DbResult<Option<Job>> {
        let query = match request.phase {
            Phase::Generation => CLAIM_GENERATION,
            Phase::Publish => CLAIM_PUBLISH,
        };

        let row = sqlx::query_as::<_, JobRow>(query)
            .bind(request.worker_id)
            .bind(request.now)
            .bind(request.stale_before)
            .fetch_optional(&self.pool)
            .await?;

        row.map(Job::try_from).transpose()
    }

    async fn release(&self, id: &JobId, worker_id: &str, now: DateTime<Utc>) -> DbResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE content_jobs
            SET lock_owner = NULL, locked_at = NULL, updated_at = $3
            WHERE id = $1 AND lock_owner = $2
            "#,
        )
        .bind(id.as_str())
        .bind(worker_id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            // Distinguish "not ours" from "no such job".
            let exists: Option<(String,)> =
                sqlx::query_as("SELECT id FROM content_jobs WHERE id = $1")
                    .bind(id.as_str())
                    .fetch_optional(&self.pool)
                    .await?;
            if exists.is_none() {
                return Err(DbError::NotFound(format!("job {}", id)));
            }
            return Ok(false);
        }
        Ok(true)
    }

    async fn ping(&self) -> DbResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use autopost_core::JobStatus;

    fn row() -> JobRow {
        let now = Utc::now();
        JobRow {
            id: "job-1".to_string(),
            owner: "user-1".to_string(),
            group_id: None,
            platform: "tiktok".to_string(),
            media_location: "/uploads/a.mp4".to_string(),
            media_storage: "local".to_string(),
            status: "needs_review".to_string(),
            user_title: None,
            user_hashtags: vec!["fun".to_string()],
            ai_title: Some("Title".to_string()),
            ai_hook: Some("Hook".to_string()),
            ai_hashtags: vec!["viral".to_string(), "fun".to_string()],
            ai_post_time: Some(now),
            scheduled_time: None,
            retry_count: 1,
            max_retries: 3,
            not_before: None,
            error_message: None,
            error_at: None,
            posted_url: None,
            platform_post_id: None,
            lock_owner: None,
            locked_at: None,
            needs_reauth: false,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_row_converts_to_job() {
        let job = Job::try_from(row()).unwrap();
        assert_eq!(job.status, JobStatus::NeedsReview);
        assert_eq!(job.retry_count, 1);
        assert_eq!(job.ai_hashtags.len(), 2);
        assert_eq!(job.id.as_str(), "job-1");
    }

    #[test]
    fn test_row_with_unknown_status_is_corrupt() {
        let mut bad = row();
        bad.status = "retrying".to_string();
        assert!(matches!(Job::try_from(bad), Err(DbError::Corrupt(_))));
    }

    #[test]
    fn test_row_with_negative_count_is_corrupt() {
        let mut bad = row();
        bad.retry_count = -1;
        assert!(matches!(Job::try_from(bad), Err(DbError::Corrupt(_))));
    }
}
