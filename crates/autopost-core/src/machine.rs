//! Job state machine.
//!
//! Claims (`queued -> generating`, `scheduled -> posting`) are performed by the
//! store's atomic claim operation. Every other status change is a
//! [`Transition`] applied to a job whose current status the store has already
//! matched against [`Transition::accepts`].

use chrono::{DateTime, Utc};

use crate::job::normalize_hashtags;
use crate::{
    Error, GeneratedContent, Job, JobStatus, PublishReceipt, Result, RetryDecision, RetryPolicy,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// `generating -> needs_review`
    GenerationSucceeded(GeneratedContent),
    /// `generating -> queued | failed`
    GenerationFailed { error: String },
    /// `needs_review -> scheduled`
    Approved {
        scheduled_time: Option<DateTime<Utc>>,
    },
    /// `posting -> posted`
    PublishSucceeded(PublishReceipt),
    /// `posting -> scheduled | failed`
    PublishFailed { error: String },
    /// `posting -> needs_reauth`
    AuthFailed { error: String },
    /// any non-terminal state `-> canceled`
    Canceled,
    /// `needs_reauth -> scheduled`, once credentials were refreshed
    Reauthorized,
}

impl Transition {
    pub fn name(&self) -> &'static str {
        match self {
            Transition::GenerationSucceeded(_) => "generation_succeeded",
            Transition::GenerationFailed { .. } => "generation_failed",
            Transition::Approved { .. } => "approve",
            Transition::PublishSucceeded(_) => "publish_succeeded",
            Transition::PublishFailed { .. } => "publish_failed",
            Transition::AuthFailed { .. } => "auth_failed",
            Transition::Canceled => "cancel",
            Transition::Reauthorized => "reauthorize",
        }
    }

    /// Whether this transition may leave `status`.
    pub fn accepts(&self, status: JobStatus) -> bool {
        match self {
            Transition::GenerationSucceeded(_) | Transition::GenerationFailed { .. } => {
                status == JobStatus::Generating
            }
            Transition::Approved { .. } => status == JobStatus::NeedsReview,
            Transition::PublishSucceeded(_)
            | Transition::PublishFailed { .. }
            | Transition::AuthFailed { .. } => status == JobStatus::Posting,
            Transition::Canceled => !status.is_terminal(),
            Transition::Reauthorized => status == JobStatus::NeedsReauth,
        }
    }

    /// Apply the transition and its side effects, returning the new status.
    ///
    /// The job is left untouched when the transition is not legal from its
    /// current status.
    pub fn apply(self, job: &mut Job, policy: &RetryPolicy, now: DateTime<Utc>) -> Result<JobStatus> {
        if !self.accepts(job.status) {
            return Err(Error::InvalidTransition {
                from: job.status,
                transition: self.name(),
            });
        }

        match self {
            Transition::GenerationSucceeded(content) => {
                job.ai_title = Some(content.title);
                job.ai_hook = Some(content.hook);
                job.ai_hashtags = normalize_hashtags(content.hashtags);
                job.ai_post_time = content.post_time;
                job.not_before = None;
                job.clear_error();
                job.clear_lock();
                job.status = JobStatus::NeedsReview;
            }
            Transition::GenerationFailed { error } => {
                fail_with_retry(job, JobStatus::Queued, error, policy, now);
            }
            Transition::Approved { scheduled_time } => {
                job.scheduled_time = Some(scheduled_time.or(job.ai_post_time).unwrap_or(now));
                job.clear_lock();
                job.status = JobStatus::Scheduled;
            }
            Transition::PublishSucceeded(receipt) => {
                job.posted_url = Some(receipt.posted_url);
                job.platform_post_id = Some(receipt.platform_post_id);
                job.not_before = None;
                job.clear_error();
                job.clear_lock();
                job.status = JobStatus::Posted;
            }
            Transition::PublishFailed { error } => {
                fail_with_retry(job, JobStatus::Scheduled, error, policy, now);
            }
            Transition::AuthFailed { error } => {
                job.needs_reauth = true;
                job.record_error(error, now);
                job.clear_lock();
                job.status = JobStatus::NeedsReauth;
            }
            Transition::Canceled => {
                job.clear_lock();
                job.status = JobStatus::Canceled;
            }
            Transition::Reauthorized => {
                job.needs_reauth = false;
                job.not_before = None;
                job.clear_error();
                job.status = JobStatus::Scheduled;
            }
        }

        job.updated_at = now;
        Ok(job.status)
    }
}

/// Return the job to `requeue_to` while retries remain, consuming one;
/// otherwise fail it.
fn fail_with_retry(
    job: &mut Job,
    requeue_to: JobStatus,
    error: String,
    policy: &RetryPolicy,
    now: DateTime<Utc>,
) {
    job.clear_lock();

    match policy.decide(job.retry_count, job.max_retries, now) {
        RetryDecision::Requeue { not_before } => {
            job.retry_count = job.retry_count.saturating_add(1);
            job.record_error(error, now);
            job.not_before = not_before;
            job.status = requeue_to;
        }
        RetryDecision::Terminate => {
            job.record_error(
                format!(
                    "{} (retries exhausted: {}/{})",
                    error, job.retry_count, job.max_retries
                ),
                now,
            );
            job.not_before = None;
            job.status = JobStatus::Failed;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::DEFAULT_MAX_RETRIES;
    use crate::{MediaRef, NewJob, Phase, Platform, StorageKind};
    use chrono::TimeDelta;

    fn job_in(status: JobStatus) -> Job {
        let now = Utc::now();
        let mut job = Job::new(
            NewJob {
                owner: "user-1".to_string(),
                group: Some("brand-a".to_string()),
                platform: Platform::Instagram,
                media: MediaRef {
                    location: "https://cdn.example.com/a.mp4".to_string(),
                    storage: StorageKind::Remote,
                },
                title: None,
                hashtags: vec![],
                max_retries: None,
            },
            DEFAULT_MAX_RETRIES,
            now,
        )
        .unwrap();
        job.status = status;
        if matches!(status, JobStatus::Generating | JobStatus::Posting) {
            job.lock_owner = Some("worker-1".to_string());
            job.locked_at = Some(now);
        }
        job
    }

    fn content() -> GeneratedContent {
        GeneratedContent {
            title: "Five tips".to_string(),
            hook: "You won't believe tip three".to_string(),
            hashtags: vec!["#tips".to_string(), "growth".to_string()],
            post_time: Some(Utc::now() + TimeDelta::hours(2)),
        }
    }

    #[test]
    fn test_generation_success_fills_ai_fields_and_releases() {
        let mut job = job_in(JobStatus::Generating);
        job.record_error("earlier failure", Utc::now());
        let content = content();

        let status = Transition::GenerationSucceeded(content.clone())
            .apply(&mut job, &RetryPolicy::immediate(), Utc::now())
            .unwrap();

        assert_eq!(status, JobStatus::NeedsReview);
        assert_eq!(job.ai_title.as_deref(), Some("Five tips"));
        assert_eq!(job.ai_post_time, content.post_time);
        assert!(job.ai_hashtags.contains("tips"));
        assert!(!job.is_locked());
        assert!(job.error_message.is_none());
        assert!(job.error_at.is_none());
        job.check_invariants().unwrap();
    }

    #[test]
    fn test_generation_failure_requeues_then_fails() {
        let policy = RetryPolicy::immediate();
        let mut job = job_in(JobStatus::Generating);

        for expected_count in 1..=3 {
            let status = Transition::GenerationFailed {
                error: "model overloaded".to_string(),
            }
            .apply(&mut job, &policy, Utc::now())
            .unwrap();
            assert_eq!(status, JobStatus::Queued);
            assert_eq!(job.retry_count, expected_count);
            assert!(!job.is_locked());
            assert_eq!(job.error_message.as_deref(), Some("model overloaded"));

            job.mark_claimed(Phase::Generation, "worker-1", Utc::now());
        }

        let status = Transition::GenerationFailed {
            error: "model overloaded".to_string(),
        }
        .apply(&mut job, &policy, Utc::now())
        .unwrap();
        assert_eq!(status, JobStatus::Failed);
        assert_eq!(job.retry_count, 3);
        assert!(job.error_message.unwrap().contains("retries exhausted: 3/3"));
    }

    #[test]
    fn test_third_failure_requeues_fourth_fails() {
        let policy = RetryPolicy::immediate();
        let mut job = job_in(JobStatus::Posting);
        job.retry_count = 2;

        let status = Transition::PublishFailed {
            error: "503".to_string(),
        }
        .apply(&mut job, &policy, Utc::now())
        .unwrap();
        assert_eq!(status, JobStatus::Scheduled);
        assert_eq!(job.retry_count, 3);
        job.check_invariants().unwrap();

        job.mark_claimed(Phase::Publish, "worker-1", Utc::now());
        let status = Transition::PublishFailed {
            error: "503".to_string(),
        }
        .apply(&mut job, &policy, Utc::now())
        .unwrap();
        assert_eq!(status, JobStatus::Failed);
        assert_eq!(job.retry_count, 3);
        assert!(job.not_before.is_none());
        job.check_invariants().unwrap();
    }

    #[test]
    fn test_zero_retries_fails_first_failure() {
        let mut job = job_in(JobStatus::Generating);
        job.max_retries = 0;

        let status = Transition::GenerationFailed {
            error: "bad prompt".to_string(),
        }
        .apply(&mut job, &RetryPolicy::immediate(), Utc::now())
        .unwrap();
        assert_eq!(status, JobStatus::Failed);
        assert_eq!(job.retry_count, 0);
    }

    #[test]
    fn test_failure_applies_backoff() {
        let now = Utc::now();
        let mut job = job_in(JobStatus::Posting);
        Transition::PublishFailed {
            error: "502".to_string(),
        }
        .apply(&mut job, &RetryPolicy::default(), now)
        .unwrap();

        assert_eq!(job.status, JobStatus::Scheduled);
        assert_eq!(job.not_before, Some(now + TimeDelta::seconds(30)));
    }

    #[test]
    fn test_approve_defaults_to_ai_post_time() {
        let mut job = job_in(JobStatus::NeedsReview);
        let suggested = Utc::now() + TimeDelta::hours(3);
        job.ai_post_time = Some(suggested);

        Transition::Approved {
            scheduled_time: None,
        }
        .apply(&mut job, &RetryPolicy::default(), Utc::now())
        .unwrap();
        assert_eq!(job.status, JobStatus::Scheduled);
        assert_eq!(job.scheduled_time, Some(suggested));
    }

    #[test]
    fn test_approve_prefers_caller_time_and_falls_back_to_now() {
        let now = Utc::now();
        let chosen = now + TimeDelta::days(1);

        let mut job = job_in(JobStatus::NeedsReview);
        job.ai_post_time = Some(now + TimeDelta::hours(3));
        Transition::Approved {
            scheduled_time: Some(chosen),
        }
        .apply(&mut job, &RetryPolicy::default(), now)
        .unwrap();
        assert_eq!(job.scheduled_time, Some(chosen));

        let mut job = job_in(JobStatus::NeedsReview);
        Transition::Approved {
            scheduled_time: None,
        }
        .apply(&mut job, &RetryPolicy::default(), now)
        .unwrap();
        assert_eq!(job.scheduled_time, Some(now));
    }

    #[test]
    fn test_publish_success_sets_success_fields() {
        let mut job = job_in(JobStatus::Posting);
        Transition::PublishSucceeded(PublishReceipt {
            posted_url: "https://instagram.com/p/abc".to_string(),
            platform_post_id: "abc".to_string(),
        })
        .apply(&mut job, &RetryPolicy::default(), Utc::now())
        .unwrap();

        assert_eq!(job.status, JobStatus::Posted);
        assert_eq!(job.platform_post_id.as_deref(), Some("abc"));
        assert!(!job.is_locked());
        job.check_invariants().unwrap();
    }

    #[test]
    fn test_auth_failure_does_not_consume_retry() {
        let mut job = job_in(JobStatus::Posting);
        job.retry_count = 1;

        let status = Transition::AuthFailed {
            error: "token expired".to_string(),
        }
        .apply(&mut job, &RetryPolicy::default(), Utc::now())
        .unwrap();

        assert_eq!(status, JobStatus::NeedsReauth);
        assert!(job.needs_reauth);
        assert_eq!(job.retry_count, 1);
        assert_eq!(job.error_message.as_deref(), Some("token expired"));
        assert!(!job.is_locked());
    }

    #[test]
    fn test_reauthorize_returns_to_scheduled() {
        let mut job = job_in(JobStatus::Posting);
        let scheduled = Utc::now();
        job.scheduled_time = Some(scheduled);
        Transition::AuthFailed {
            error: "token expired".to_string(),
        }
        .apply(&mut job, &RetryPolicy::default(), Utc::now())
        .unwrap();

        Transition::Reauthorized
            .apply(&mut job, &RetryPolicy::default(), Utc::now())
            .unwrap();
        assert_eq!(job.status, JobStatus::Scheduled);
        assert!(!job.needs_reauth);
        assert!(job.error_message.is_none());
        assert_eq!(job.scheduled_time, Some(scheduled));
    }

    #[test]
    fn test_cancel_from_any_non_terminal_state() {
        for status in JobStatus::ALL {
            let mut job = job_in(status);
            let result = Transition::Canceled.apply(&mut job, &RetryPolicy::default(), Utc::now());
            if status.is_terminal() {
                assert!(matches!(result, Err(Error::InvalidTransition { .. })));
                assert_eq!(job.status, status);
            } else {
                assert_eq!(result.unwrap(), JobStatus::Canceled);
                assert!(!job.is_locked());
            }
        }
    }

    #[test]
    fn test_illegal_transition_leaves_job_untouched() {
        let mut job = job_in(JobStatus::Queued);
        let before = job.clone();

        let result = Transition::PublishSucceeded(PublishReceipt {
            posted_url: "u".to_string(),
            platform_post_id: "p".to_string(),
        })
        .apply(&mut job, &RetryPolicy::default(), Utc::now());

        assert!(matches!(
            result,
            Err(Error::InvalidTransition {
                from: JobStatus::Queued,
                ..
            })
        ));
        assert_eq!(job, before);
    }
}
