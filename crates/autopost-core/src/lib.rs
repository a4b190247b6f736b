//! Core domain types for the Autopost content-publishing pipeline.
//!
//! This crate contains:
//! - Job identifiers and the persistent job record
//! - The job state machine (legal transitions and their side effects)
//! - Retry/backoff policy
//! - Clock abstraction
//! - Collaborator traits (AI generator, platform publisher)

pub mod clock;
pub mod collaborator;
pub mod error;
pub mod id;
pub mod job;
pub mod machine;
pub mod retry;

pub use clock::{Clock, ManualClock, SystemClock};
pub use collaborator::{CollaboratorError, GeneratedContent, Generator, PublishReceipt, Publisher};
pub use error::{Error, Result};
pub use id::JobId;
pub use job::{Job, JobStatus, MediaRef, NewJob, Phase, Platform, StorageKind};
pub use machine::Transition;
pub use retry::{RetryDecision, RetryPolicy};
