//! Platform publisher over HTTP.

use async_trait::async_trait;
use autopost_config::EndpointConfig;
use autopost_core::{CollaboratorError, Job, MediaRef, Platform, PublishReceipt, Publisher};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::info;

use crate::EndpointClient;

/// Default request timeout for uploads.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Serialize)]
struct PublishRequest<'a> {
    job_id: &'a str,
    owner: &'a str,
    group: Option<&'a str>,
    platform: Platform,
    media: &'a MediaRef,
    title: Option<&'a str>,
    hook: Option<&'a str>,
    hashtags: BTreeSet<String>,
    scheduled_time: Option<DateTime<Utc>>,
}

impl<'a> From<&'a Job> for PublishRequest<'a> {
    fn from(job: &'a Job) -> Self {
        Self {
            job_id: job.id.as_str(),
            owner: &job.owner,
            group: job.group.as_deref(),
            platform: job.platform,
            media: &job.media,
            title: job.effective_title(),
            hook: job.ai_hook.as_deref(),
            hashtags: job.effective_hashtags(),
            scheduled_time: job.scheduled_time,
        }
    }
}

/// Calls an upload service that answers with a [`PublishReceipt`] body.
///
/// The service owns the platform credentials; it must answer 401 or 403 when
/// the owner's platform token was rejected.
#[derive(Debug, Clone)]
pub struct HttpPublisher {
    client: EndpointClient,
}

impl HttpPublisher {
    pub fn new(config: &EndpointConfig) -> reqwest::Result<Self> {
        Ok(Self {
            client: EndpointClient::new(config, DEFAULT_TIMEOUT)?,
        })
    }
}

#[async_trait]
impl Publisher for HttpPublisher {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn publish(&self, job: &Job) -> Result<PublishReceipt, CollaboratorError> {
        let receipt: PublishReceipt = self.client.post_json(&PublishRequest::from(job)).await?;
        info!(
            job_id = %job.id,
            platform = %job.platform,
            platform_post_id = %receipt.platform_post_id,
            "Upload accepted"
        );
        Ok(receipt)
    }
}
