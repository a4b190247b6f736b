//! Application configuration parsing.
//!
//! ```kdl
//! database url="postgres://autopost@localhost/autopost" max-connections=10
//! server bind="0.0.0.0:3000"
//! pipeline {
//!     default-max-retries 3
//!     stale-lock-secs 600
//!     poll-interval-ms 1000
//! }
//! generator url="https://ai.internal/generate" token="..." timeout-secs=60
//! publisher url="https://publish.internal/posts" token="..."
//! ```
//!
//! Every section is optional.

use crate::{ConfigError, ConfigResult};
use autopost_core::RetryPolicy;
use autopost_core::job::DEFAULT_MAX_RETRIES;
use kdl::{KdlDocument, KdlNode};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use url::Url;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub server: ServerConfig,
    pub pipeline: PipelineConfig,
    pub generator: Option<EndpointConfig>,
    pub publisher: Option<EndpointConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: Option<String>,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub bind: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 3000)),
        }
    }
}

/// Pipeline tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Retry budget for jobs submitted without their own.
    pub default_max_retries: u32,
    /// A claim older than this is treated as abandoned.
    pub stale_lock: Duration,
    /// Sleep between polls when no job is claimable.
    pub poll_interval: Duration,
    /// Sleep after a store error.
    pub error_backoff: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub generate_timeout: Duration,
    pub publish_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let retry = RetryPolicy::default();
        Self {
            default_max_retries: DEFAULT_MAX_RETRIES,
            stale_lock: Duration::from_secs(10 * 60),
            poll_interval: Duration::from_millis(1000),
            error_backoff: Duration::from_millis(5000),
            backoff_base: retry.backoff_base,
            backoff_max: retry.backoff_max,
            generate_timeout: Duration::from_secs(120),
            publish_timeout: Duration::from_secs(300),
        }
    }
}

impl PipelineConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            backoff_base: self.backoff_base,
            backoff_max: self.backoff_max,
        }
    }
}

/// An HTTP collaborator endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub url: Url,
    pub token: Option<String>,
    pub timeout: Option<Duration>,
}

/// Read and parse a configuration file.
pub fn load_config(path: impl AsRef<Path>) -> ConfigResult<AppConfig> {
    let content = std::fs::read_to_string(path)?;
    parse_config(&content)
}

/// Parse application configuration from KDL text.
pub fn parse_config(kdl: &str) -> ConfigResult<AppConfig> {
    let doc: KdlDocument = kdl.parse()?;
    let mut config = AppConfig::default();

    for node in doc.nodes() {
        match node.name().value() {
            "database" => {
                config.database.url = get_string_prop(node, "url").or(config.database.url);
                if let Some(max) = get_u64_prop(node, "max-connections")? {
                    config.database.max_connections = to_u32("max-connections", max)?;
                }
            }
            "server" => {
                if let Some(bind) = get_string_prop(node, "bind") {
                    config.server.bind = bind.parse().map_err(|e| ConfigError::InvalidValue {
                        field: "server bind".to_string(),
                        message: format!("{}: {}", bind, e),
                    })?;
                }
            }
            "pipeline" => {
                config.pipeline = parse_pipeline(node)?;
            }
            "generator" => {
                config.generator = Some(parse_endpoint(node, "generator")?);
            }
            "publisher" => {
                config.publisher = Some(parse_endpoint(node, "publisher")?);
            }
            _ => {} // Ignore unknown nodes
        }
    }

    Ok(config)
}

fn parse_pipeline(node: &KdlNode) -> ConfigResult<PipelineConfig> {
    let mut pipeline = PipelineConfig::default();

    let Some(children) = node.children() else {
        return Ok(pipeline);
    };

    for child in children.nodes() {
        let field = child.name().value();
        let Some(value) = get_first_u64_arg(child, field)? else {
            continue;
        };

        match field {
            "default-max-retries" => pipeline.default_max_retries = to_u32(field, value)?,
            "stale-lock-secs" => pipeline.stale_lock = Duration::from_secs(value),
            "poll-interval-ms" => pipeline.poll_interval = Duration::from_millis(value),
            "error-backoff-ms" => pipeline.error_backoff = Duration::from_millis(value),
            "backoff-base-secs" => pipeline.backoff_base = Duration::from_secs(value),
            "backoff-max-secs" => pipeline.backoff_max = Duration::from_secs(value),
            "generate-timeout-secs" => pipeline.generate_timeout = Duration::from_secs(value),
            "publish-timeout-secs" => pipeline.publish_timeout = Duration::from_secs(value),
            _ => {}
        }
    }

    if pipeline.poll_interval.is_zero() {
        return Err(ConfigError::InvalidValue {
            field: "poll-interval-ms".to_string(),
            message: "must be greater than zero".to_string(),
        });
    }
    if pipeline.stale_lock.is_zero() {
        return Err(ConfigError::InvalidValue {
            field: "stale-lock-secs".to_string(),
            message: "must be greater than zero".to_string(),
        });
    }
    let longest_call = pipeline.generate_timeout.max(pipeline.publish_timeout);
    if pipeline.stale_lock <= longest_call {
        return Err(ConfigError::InvalidValue {
            field: "stale-lock-secs".to_string(),
            message: format!(
                "must exceed generate-timeout-secs and publish-timeout-secs ({}s)",
                longest_call.as_secs()
            ),
        });
    }

    Ok(pipeline)
}

fn parse_endpoint(node: &KdlNode, section: &str) -> ConfigResult<EndpointConfig> {
    let raw = get_string_prop(node, "url")
        .or_else(|| get_first_string_arg(node))
        .ok_or_else(|| ConfigError::MissingField(format!("{} url", section)))?;

    let url = Url::parse(&raw).map_err(|e| ConfigError::InvalidValue {
        field: format!("{} url", section),
        message: format!("{}: {}", raw, e),
    })?;

    let timeout = get_u64_prop(node, "timeout-secs")?.map(Duration::from_secs);

    Ok(EndpointConfig {
        url,
        token: get_string_prop(node, "token"),
        timeout,
    })
}

// Helper functions for extracting values from KDL nodes

fn get_first_string_arg(node: &KdlNode) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}

fn get_first_u64_arg(node: &KdlNode, field: &str) -> ConfigResult<Option<u64>> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .map(|e| as_u64(field, e.value()))
        .transpose()
}

fn get_string_prop(node: &KdlNode, name: &str) -> Option<String> {
    node.get(name)
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
}

fn get_u64_prop(node: &KdlNode, name: &str) -> ConfigResult<Option<u64>> {
    node.get(name).map(|v| as_u64(name, v)).transpose()
}

fn as_u64(field: &str, value: &kdl::KdlValue) -> ConfigResult<u64> {
    let int = value.as_integer().ok_or_else(|| ConfigError::InvalidValue {
        field: field.to_string(),
        message: format!("expected an integer, got {}", value),
    })?;
    u64::try_from(int).map_err(|_| ConfigError::InvalidValue {
        field: field.to_string(),
        message: format!("expected a non-negative integer, got {}", int),
    })
}

fn to_u32(field: &str, value: u64) -> ConfigResult<u32> {
    u32::try_from(value).map_err(|_| ConfigError::InvalidValue {
        field: field.to_string(),
        message: format!("{} is out of range", value),
    })
}
