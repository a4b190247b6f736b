//! HTTP connectors for the AI generator and the platform publisher.
//!
//! Both POST the job as JSON to a configured endpoint and map the response
//! status onto [`CollaboratorError`](autopost_core::CollaboratorError):
//! 2xx is parsed, 401/403 is an authentication failure and anything else is
//! transient.

pub mod client;
pub mod generator;
pub mod publisher;

pub use client::{EndpointClient, classify_status};
pub use generator::HttpGenerator;
pub use publisher::HttpPublisher;
