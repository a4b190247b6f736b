//! Collaborator traits.
//!
//! The pipeline drives two external services between claim and release:
//! an AI generator that writes the post metadata, and a platform publisher
//! that performs the upload.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::Job;

/// Failure reported by a collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CollaboratorError {
    /// Recoverable failure; consumes a retry.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Platform credentials were rejected; retrying cannot succeed.
    #[error("authentication failed: {0}")]
    Auth(String),
}

/// Metadata written by the AI generator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedContent {
    pub title: String,
    pub hook: String,
    #[serde(default)]
    pub hashtags: Vec<String>,
    pub post_time: Option<DateTime<Utc>>,
}

/// Proof of a successful publication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishReceipt {
    pub posted_url: String,
    pub platform_post_id: String,
}

/// Writes title, hook, hashtags and a suggested post time for a job.
#[async_trait]
pub trait Generator: Send + Sync {
    /// Name of this generator, for logs.
    fn name(&self) -> &'static str;

    async fn generate(&self, job: &Job) -> Result<GeneratedContent, CollaboratorError>;
}

/// Posts a reviewed job to its platform.
///
/// Implementations must report rejected credentials as
/// [`CollaboratorError::Auth`] and everything else as
/// [`CollaboratorError::Transient`].
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Name of this publisher, for logs.
    fn name(&self) -> &'static str;

    async fn publish(&self, job: &Job) -> Result<PublishReceipt, CollaboratorError>;
}
