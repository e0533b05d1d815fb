use thiserror::Error;

use crate::remote::RemoteError;
use crate::state::TransitionError;
use crate::store::StoreError;

/// Errors surfaced by the orchestration facade.
#[derive(Error, Debug)]
pub enum OrchestratorError {
    /// The durable store failed in a way that threatens resumability.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// A requested transition was rejected by the state machine.
    #[error("transition rejected: {0}")]
    Transition(#[from] TransitionError),

    /// An operation that needs a live run was called before `start`.
    #[error("run has not been started")]
    NotStarted,

    /// Item descriptors must be non-empty and indexed contiguously from 0.
    #[error("invalid item descriptors: {0}")]
    InvalidItems(String),

    /// Finalize was requested while items are still pending or failed.
    #[error("run incomplete: {pending} item(s) have not succeeded")]
    RunIncomplete {
        /// Items not yet successful.
        pending: usize,
    },

    /// The external save collaborator failed; run state is preserved so the
    /// save can be retried without regenerating.
    #[error("saving finalized output failed: {0}")]
    SaveFailed(RemoteError),
}
