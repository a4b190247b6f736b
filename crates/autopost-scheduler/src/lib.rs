//! Work claiming, state transitions and polling workers for Autopost.
//!
//! Workers share nothing in memory: every decision goes through the job
//! store's atomic claim and conditional update.

pub mod claim;
pub mod error;
pub mod pipeline;
pub mod worker;

pub use claim::ClaimManager;
pub use error::{PipelineError, PipelineResult};
pub use pipeline::Pipeline;
pub use worker::{PollOutcome, Shutdown, Worker, WorkerSettings};
