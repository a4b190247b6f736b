//! KDL configuration parsing for Autopost.
//!
//! Parses `autopost.kdl`: database, HTTP server, pipeline tuning and the
//! collaborator endpoints.

pub mod error;
pub mod settings;

pub use error::{ConfigError, ConfigResult};
pub use settings::{
    AppConfig, DatabaseConfig, EndpointConfig, PipelineConfig, ServerConfig, load_config,
    parse_config,
};
