//! Contracts for the external collaborators the orchestrator drives.
//!
//! The generation backend, the push channel, the poll endpoint, and the
//! finalize sink are all owned by the embedding application; the
//! orchestrator only assumes the shapes below. Remote calls carry no
//! idempotency guarantee and may take minutes.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::store::GenerationOutput;

/// Errors surfaced by external collaborators.
#[derive(Error, Debug)]
pub enum RemoteError {
    /// Transport-level failure (network drop, 5xx, connect failure).
    #[error("transport error: {0}")]
    Transport(String),

    /// The collaborator answered but the payload was unusable.
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Kind of content a job produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentKind {
    /// Chapter body text.
    Text,
    /// Chapter audio narration.
    Narration,
}

/// Description of one unit of generation work, handed to the backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemDescriptor {
    /// Stable position of the item; doubles as the job identity.
    pub index: usize,
    /// Human-readable label (e.g. a chapter title) for logs and events.
    pub title: String,
    /// Kind of output this item produces.
    pub kind: ContentKind,
    /// Backend-specific generation parameters.
    pub payload: serde_json::Value,
}

impl ItemDescriptor {
    /// Create a descriptor with an empty payload.
    pub fn new(index: usize, title: impl Into<String>, kind: ContentKind) -> Self {
        Self {
            index,
            title: title.into(),
            kind,
            payload: serde_json::Value::Null,
        }
    }

    /// Attach backend-specific parameters.
    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}

/// Outcome of one remote generation call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitOutcome {
    /// Whether the backend accepted and completed the job.
    pub success: bool,
    /// Generated output when `success` is true.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<GenerationOutput>,
    /// Backend-provided failure reason when `success` is false.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl SubmitOutcome {
    /// A successful outcome carrying the generated output.
    pub fn ok(result: GenerationOutput) -> Self {
        Self {
            success: true,
            result: Some(result),
            message: None,
        }
    }

    /// A failed outcome with a reason.
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            result: None,
            message: Some(message.into()),
        }
    }
}

/// The remote generation procedure: submit one job, eventually learn how it
/// went. May be slow; may be retried.
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    async fn submit(&self, item: &ItemDescriptor) -> Result<SubmitOutcome, RemoteError>;
}

/// Progress event delivered over the push channel.
#[derive(Debug, Clone)]
pub struct PushEvent {
    /// Item the event refers to.
    pub index: usize,
    /// In-flight completion hint, presentation only.
    pub progress_percent: Option<u8>,
    /// Set when the remote work for the item finished.
    pub success: Option<bool>,
    /// Remote failure reason, when the item failed.
    pub error: Option<String>,
    /// Generated output, when the item succeeded.
    pub result: Option<GenerationOutput>,
}

/// A persistent server-to-client event stream keyed by content id.
///
/// `connect` represents one connection attempt; the reconciler bounds the
/// number of attempts and falls back to polling when they are exhausted.
/// Delivery is assumed at-least-once; duplicates are deduplicated by the
/// state machine.
#[async_trait]
pub trait PushChannel: Send + Sync {
    async fn connect(&self, content_id: &str) -> Result<mpsc::Receiver<PushEvent>, RemoteError>;
}

/// An item the backend reports as already complete.
#[derive(Debug, Clone)]
pub struct CompletedItem {
    /// Item position.
    pub index: usize,
    /// The finished output.
    pub result: GenerationOutput,
}

/// Periodic request-based progress retrieval; the sole source when the push
/// channel is unavailable and a safety net otherwise.
#[async_trait]
pub trait PollSource: Send + Sync {
    async fn fetch_completed(&self, content_id: &str) -> Result<Vec<CompletedItem>, RemoteError>;
}

/// Destination for the aggregated outputs of a fully successful run.
#[async_trait]
pub trait OutputSink: Send + Sync {
    async fn save(
        &self,
        content_id: &str,
        outputs: Vec<GenerationOutput>,
    ) -> Result<(), RemoteError>;
}
