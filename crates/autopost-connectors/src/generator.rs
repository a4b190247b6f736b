//! AI content generator over HTTP.

use async_trait::async_trait;
use autopost_config::EndpointConfig;
use autopost_core::{CollaboratorError, GeneratedContent, Generator, Job, MediaRef, Platform};
use serde::Serialize;
use std::time::Duration;

use crate::EndpointClient;

/// Default request timeout for generation calls.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    job_id: &'a str,
    owner: &'a str,
    group: Option<&'a str>,
    platform: Platform,
    media: &'a MediaRef,
    title: Option<&'a str>,
    hashtags: Vec<&'a str>,
}

impl<'a> From<&'a Job> for GenerateRequest<'a> {
    fn from(job: &'a Job) -> Self {
        Self {
            job_id: job.id.as_str(),
            owner: &job.owner,
            group: job.group.as_deref(),
            platform: job.platform,
            media: &job.media,
            title: job.user_title.as_deref(),
            hashtags: job.user_hashtags.iter().map(String::as_str).collect(),
        }
    }
}

/// Calls a generation service that answers with a [`GeneratedContent`] body.
#[derive(Debug, Clone)]
pub struct HttpGenerator {
    client: EndpointClient,
}

impl HttpGenerator {
    pub fn new(config: &EndpointConfig) -> reqwest::Result<Self> {
        Ok(Self {
            client: EndpointClient::new(config, DEFAULT_TIMEOUT)?,
        })
    }
}

#[async_trait]
impl Generator for HttpGenerator {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn generate(&self, job: &Job) -> Result<GeneratedContent, CollaboratorError> {
        self.client.post_json(&GenerateRequest::from(job)).await
    }
}
