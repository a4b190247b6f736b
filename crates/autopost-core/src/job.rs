//! The persistent job record and its enumerations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use crate::{Error, JobId, Result};

/// Default retry budget for a job when the caller does not supply one.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Largest retry budget a job can carry; the store keeps it in an `INTEGER`.
pub const MAX_RETRIES_LIMIT: u32 = i32::MAX as u32;

/// Target social network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Tiktok,
    Instagram,
    Youtube,
    Facebook,
    Linkedin,
    X,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Tiktok => "tiktok",
            Platform::Instagram => "instagram",
            Platform::Youtube => "youtube",
            Platform::Facebook => "facebook",
            Platform::Linkedin => "linkedin",
            Platform::X => "x",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "tiktok" => Ok(Platform::Tiktok),
            "instagram" => Ok(Platform::Instagram),
            "youtube" => Ok(Platform::Youtube),
            "facebook" => Ok(Platform::Facebook),
            "linkedin" => Ok(Platform::Linkedin),
            "x" | "twitter" => Ok(Platform::X),
            other => Err(Error::InvalidInput(format!("unknown platform: {}", other))),
        }
    }
}

/// Where the source asset lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageKind {
    /// A path on storage shared with the workers.
    Local,
    /// A URL reachable by the collaborators.
    Remote,
}

impl StorageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageKind::Local => "local",
            StorageKind::Remote => "remote",
        }
    }
}

impl fmt::Display for StorageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StorageKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "local" => Ok(StorageKind::Local),
            "remote" => Ok(StorageKind::Remote),
            other => Err(Error::InvalidInput(format!("unknown storage kind: {}", other))),
        }
    }
}

/// Reference to the uploaded media asset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaRef {
    pub location: String,
    pub storage: StorageKind,
}

/// Pipeline state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Generating,
    NeedsReview,
    Scheduled,
    Posting,
    Posted,
    Failed,
    Canceled,
    NeedsReauth,
}

impl JobStatus {
    pub const ALL: [JobStatus; 9] = [
        JobStatus::Queued,
        JobStatus::Generating,
        JobStatus::NeedsReview,
        JobStatus::Scheduled,
        JobStatus::Posting,
        JobStatus::Posted,
        JobStatus::Failed,
        JobStatus::Canceled,
        JobStatus::NeedsReauth,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Generating => "generating",
            JobStatus::NeedsReview => "needs_review",
            JobStatus::Scheduled => "scheduled",
            JobStatus::Posting => "posting",
            JobStatus::Posted => "posted",
            JobStatus::Failed => "failed",
            JobStatus::Canceled => "canceled",
            JobStatus::NeedsReauth => "needs_reauth",
        }
    }

    /// No further transition of any kind leaves a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Posted | JobStatus::Failed | JobStatus::Canceled
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| Error::InvalidInput(format!("unknown job status: {}", s)))
    }
}

/// A phase of work that a worker claims a job for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Generation,
    Publish,
}

impl Phase {
    /// Status a job waits in before the phase is claimed.
    pub fn waiting_status(&self) -> JobStatus {
        match self {
            Phase::Generation => JobStatus::Queued,
            Phase::Publish => JobStatus::Scheduled,
        }
    }

    /// Status a job holds while a worker owns it for this phase.
    pub fn active_status(&self) -> JobStatus {
        match self {
            Phase::Generation => JobStatus::Generating,
            Phase::Publish => JobStatus::Posting,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Generation => "generation",
            Phase::Publish => "publish",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Caller-supplied data for a new job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewJob {
    pub owner: String,
    pub group: Option<String>,
    pub platform: Platform,
    pub media: MediaRef,
    pub title: Option<String>,
    #[serde(default)]
    pub hashtags: Vec<String>,
    pub max_retries: Option<u32>,
}

/// One piece of content moving through the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub owner: String,
    pub group: Option<String>,
    pub platform: Platform,
    pub media: MediaRef,
    pub status: JobStatus,

    pub user_title: Option<String>,
    pub user_hashtags: BTreeSet<String>,

    pub ai_title: Option<String>,
    pub ai_hook: Option<String>,
    pub ai_hashtags: BTreeSet<String>,
    pub ai_post_time: Option<DateTime<Utc>>,

    pub scheduled_time: Option<DateTime<Utc>>,

    pub retry_count: u32,
    pub max_retries: u32,
    /// A requeued job is not claimable before this instant.
    pub not_before: Option<DateTime<Utc>>,

    pub error_message: Option<String>,
    pub error_at: Option<DateTime<Utc>>,

    pub posted_url: Option<String>,
    pub platform_post_id: Option<String>,

    pub lock_owner: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,

    pub needs_reauth: bool,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Build a fresh `queued` job from intake data.
    pub fn new(new: NewJob, default_max_retries: u32, now: DateTime<Utc>) -> Result<Self> {
        if new.owner.trim().is_empty() {
            return Err(Error::InvalidInput("owner must not be empty".to_string()));
        }
        if new.media.location.trim().is_empty() {
            return Err(Error::InvalidInput(
                "media location must not be empty".to_string(),
            ));
        }
        let max_retries = new.max_retries.unwrap_or(default_max_retries);
        if max_retries > MAX_RETRIES_LIMIT {
            return Err(Error::InvalidInput(format!(
                "max_retries must be at most {}",
                MAX_RETRIES_LIMIT
            )));
        }

        Ok(Self {
            id: JobId::new(),
            owner: new.owner,
            group: new.group,
            platform: new.platform,
            media: new.media,
            status: JobStatus::Queued,
            user_title: new.title.filter(|t| !t.trim().is_empty()),
            user_hashtags: normalize_hashtags(new.hashtags),
            ai_title: None,
            ai_hook: None,
            ai_hashtags: BTreeSet::new(),
            ai_post_time: None,
            scheduled_time: None,
            retry_count: 0,
            max_retries,
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
        })
    }

    pub fn is_locked(&self) -> bool {
        self.lock_owner.is_some()
    }

    pub fn is_held_by(&self, worker_id: &str) -> bool {
        self.lock_owner.as_deref() == Some(worker_id)
    }

    /// Whether a worker may claim this job for `phase` at `now`.
    ///
    /// A job waiting for the phase is claimable once unlocked and past its
    /// `not_before`. A job already in the phase's active status is claimable
    /// only if its lock was released or went stale (older than `stale_before`).
    /// Waiting `scheduled` jobs must also have reached their `scheduled_time`.
    pub fn is_claimable(
        &self,
        phase: Phase,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> bool {
        let lock_free = match self.locked_at {
            None => true,
            Some(locked_at) => locked_at < stale_before,
        };

        if self.status == phase.active_status() {
            return lock_free;
        }
        if self.status != phase.waiting_status() || !lock_free {
            return false;
        }
        if self.not_before.is_some_and(|nb| nb > now) {
            return false;
        }
        match phase {
            Phase::Generation => true,
            Phase::Publish => self.scheduled_time.is_some_and(|t| t <= now),
        }
    }

    /// Mark the job as owned by `worker_id` for `phase`.
    pub fn mark_claimed(&mut self, phase: Phase, worker_id: &str, now: DateTime<Utc>) {
        self.status = phase.active_status();
        self.lock_owner = Some(worker_id.to_string());
        self.locked_at = Some(now);
        self.updated_at = now;
    }

    pub fn clear_lock(&mut self) {
        self.lock_owner = None;
        self.locked_at = None;
    }

    pub fn clear_error(&mut self) {
        self.error_message = None;
        self.error_at = None;
    }

    pub fn record_error(&mut self, message: impl Into<String>, now: DateTime<Utc>) {
        self.error_message = Some(message.into());
        self.error_at = Some(now);
    }

    /// Title to publish: the caller's own title wins over the generated one.
    pub fn effective_title(&self) -> Option<&str> {
        self.user_title.as_deref().or(self.ai_title.as_deref())
    }

    /// Union of caller and generated hashtags.
    pub fn effective_hashtags(&self) -> BTreeSet<String> {
        self.user_hashtags
            .union(&self.ai_hashtags)
            .cloned()
            .collect()
    }

    /// Check the structural invariants every persisted job must satisfy.
    pub fn check_invariants(&self) -> Result<()> {
        if self.lock_owner.is_some() != self.locked_at.is_some() {
            return Err(Error::InvariantViolation(format!(
                "job {}: lock_owner and locked_at must be set together",
                self.id
            )));
        }

        let posted = self.status == JobStatus::Posted;
        let has_success_fields = self.posted_url.is_some() && self.platform_post_id.is_some();
        let has_any_success_field = self.posted_url.is_some() || self.platform_post_id.is_some();
        if posted != has_success_fields || (!posted && has_any_success_field) {
            return Err(Error::InvariantViolation(format!(
                "job {}: posted_url/platform_post_id must be set iff status is posted (status {})",
                self.id, self.status
            )));
        }

        if self.status.is_terminal() && self.is_locked() {
            return Err(Error::InvariantViolation(format!(
                "job {}: terminal job {} still holds a lock",
                self.id, self.status
            )));
        }

        Ok(())
    }
}

/// Trim, strip a leading `#`, drop empties and deduplicate.
pub fn normalize_hashtags<I, S>(tags: I) -> BTreeSet<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    tags.into_iter()
        .map(|t| t.as_ref().trim().trim_start_matches('#').trim().to_string())
        .filter(|t| !t.is_empty())
        .collect()
}
