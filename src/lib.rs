//! chapterflow: resumable, batched orchestration of slow generation jobs.
//!
//! The crate drives a fixed set of failure-prone, externally-executed
//! generation jobs (one per chapter of a course or book) to completion:
//!
//! - jobs run in small fixed-size **batches** with a cooldown in between,
//!   respecting an expensive, rate-limited upstream service;
//! - each job is wrapped in a **bounded fixed-delay retry** with a generous
//!   per-call timeout;
//! - every state transition is **persisted**, so a run survives a process
//!   restart and resumes without redoing completed work;
//! - progress arrives over a **push channel with a poll fallback**, both
//!   reconciled through a single state machine that never regresses a
//!   completed item;
//! - **stop is cooperative**: in-flight calls finish and are recorded,
//!   nothing new starts.
//!
//! The embedding application supplies the external collaborators as trait
//! objects (see [`remote`]) and consumes progress via
//! [`OrchestratorEvent`]s and [`ProgressSnapshot`] reads.
//!
//! ```no_run
//! use std::sync::Arc;
//! use chapterflow::{
//!     ContentKind, ItemDescriptor, JobStore, Orchestrator, OrchestratorConfig,
//! };
//! # use chapterflow::remote::GenerationBackend;
//! # async fn example(backend: Arc<dyn GenerationBackend>) -> Result<(), Box<dyn std::error::Error>> {
//! let store = JobStore::new("/tmp/app-data")?;
//! let (orchestrator, _events) = Orchestrator::new(
//!     "course-42",
//!     OrchestratorConfig::narration(),
//!     store,
//!     backend,
//! );
//!
//! let items = vec![
//!     ItemDescriptor::new(0, "Chapter 1", ContentKind::Narration),
//!     ItemDescriptor::new(1, "Chapter 2", ContentKind::Narration),
//! ];
//! let summary = orchestrator.start(items).await?;
//! println!("{} succeeded, {} failed", summary.succeeded, summary.failed);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod orchestrator;
pub mod progress;
pub mod remote;
pub mod retry;
pub mod scheduler;
pub mod state;
pub mod stop;
pub mod store;

pub use config::OrchestratorConfig;
pub use error::OrchestratorError;
pub use orchestrator::{Orchestrator, OrchestratorEvent, RunSummary};
pub use progress::ProgressSnapshot;
pub use remote::{
    ContentKind, GenerationBackend, ItemDescriptor, OutputSink, PollSource, PushChannel,
    PushEvent, SubmitOutcome,
};
pub use scheduler::BatchReport;
pub use state::{SharedRunState, Transition, TransitionError};
pub use stop::StopSignal;
pub use store::{GenerationOutput, JobRecord, JobStatus, JobStore, RunRecord};
