//! Shared JSON-over-HTTP client.

use autopost_config::EndpointConfig;
use autopost_core::CollaboratorError;
use reqwest::StatusCode;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::debug;
use url::Url;

/// Longest response body quoted in an error message.
const MAX_ERROR_BODY: usize = 512;

/// A single collaborator endpoint with optional bearer token.
#[derive(Debug, Clone)]
pub struct EndpointClient {
    client: reqwest::Client,
    url: Url,
    token: Option<String>,
}

impl EndpointClient {
    /// Build a client for `config`. `default_timeout` applies when the
    /// endpoint does not set its own.
    pub fn new(config: &EndpointConfig, default_timeout: Duration) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout.unwrap_or(default_timeout))
            .user_agent(concat!("autopost/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            url: config.url.clone(),
            token: config.token.clone(),
        })
    }

    /// POST `body` and decode a 2xx JSON response.
    pub async fn post_json<B, R>(&self, body: &B) -> Result<R, CollaboratorError>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let mut request = self.client.post(self.url.clone()).json(body);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|e| {
            CollaboratorError::Transient(format!("request to {} failed: {}", self.url, e))
        })?;

        let status = response.status();
        debug!(url = %self.url, %status, "Collaborator responded");
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &text));
        }

        response.json().await.map_err(|e| {
            CollaboratorError::Transient(format!("invalid response from {}: {}", self.url, e))
        })
    }
}

/// Map a non-success status to a collaborator error.
pub fn classify_status(status: StatusCode, body: &str) -> CollaboratorError {
    let body = truncate(body.trim(), MAX_ERROR_BODY);
    let message = if body.is_empty() {
        status.to_string()
    } else {
        format!("{}: {}", status, body)
    };

    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => CollaboratorError::Auth(message),
        _ => CollaboratorError::Transient(message),
    }
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
