//! HTTP API for the Autopost publishing pipeline.
//!
//! Intake and reviewer operations over REST, plus health endpoints.

pub mod error;
pub mod routes;
pub mod state;

pub use state::AppState;
