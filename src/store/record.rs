use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Current persisted run schema version.
pub const RUN_SCHEMA_VERSION: u32 = 1;

/// Reserved failure reason recorded when a job is halted by a user stop
/// rather than by the generation backend.
pub const STOPPED_REASON: &str = "stopped";

/// Lifecycle status of a single generation job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Not yet attempted.
    Idle,
    /// A remote call is outstanding.
    Loading,
    /// Generation finished and a result is recorded.
    Success,
    /// Generation failed; the failure reason is recorded.
    Error,
}

/// Output produced by a completed generation job, tagged by content kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum GenerationOutput {
    /// A generated chapter body.
    Text {
        /// Markdown chapter content.
        content: String,
    },
    /// A generated chapter narration.
    Narration {
        /// Reference to the produced media file.
        media_url: String,
        /// Duration of the narration, when reported by the backend.
        #[serde(skip_serializing_if = "Option::is_none")]
        duration_secs: Option<f64>,
    },
}

/// Persisted state of one generation job.
///
/// Exactly one of `result`/`error` is set once the job leaves
/// `Idle`/`Loading`. `attempts` only ever increases within a run; a manual
/// retry resets auto-retry eligibility by raising `attempts_floor` instead
/// of resetting the counter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    /// Stable position of the job, used as its identity.
    pub index: usize,
    /// Current lifecycle status.
    pub status: JobStatus,
    /// Generated output, present only when `status == Success`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<GenerationOutput>,
    /// Failure reason, present only when `status == Error`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Remote-call attempts made so far.
    pub attempts: u32,
    /// Attempt count at the last manual retry; auto-retry budgets are
    /// measured from here.
    #[serde(default)]
    pub attempts_floor: u32,
}

impl JobRecord {
    /// Create a fresh idle record for the given position.
    pub fn new(index: usize) -> Self {
        Self {
            index,
            status: JobStatus::Idle,
            result: None,
            error: None,
            attempts: 0,
            attempts_floor: 0,
        }
    }

    /// Attempts counted against the current auto-retry budget.
    pub fn auto_attempts(&self) -> u32 {
        self.attempts.saturating_sub(self.attempts_floor)
    }

    /// True when the job errored because the user stopped the run, as
    /// opposed to a genuine generation failure.
    pub fn stopped_by_user(&self) -> bool {
        self.status == JobStatus::Error && self.error.as_deref() == Some(STOPPED_REASON)
    }
}

/// Persisted metadata for one orchestration run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    /// Persisted schema version.
    pub schema_version: u32,
    /// Identifier of this run, generated once and persisted.
    pub run_id: String,
    /// Stable identifier of the content being generated; keys the store.
    pub content_id: String,
    /// Number of jobs, fixed for the run's lifetime.
    pub item_count: usize,
    /// Set when the user requested a stop; the scheduler must not start
    /// new jobs while this is true.
    pub stopped: bool,
    /// When the run was created.
    pub created_at: DateTime<Utc>,
    /// When the run state was last written.
    pub updated_at: DateTime<Utc>,
}

impl RunRecord {
    /// Create a new run record with a freshly generated run id.
    pub fn new(content_id: impl Into<String>, item_count: usize) -> Self {
        let now = Utc::now();
        Self {
            schema_version: RUN_SCHEMA_VERSION,
            run_id: generate_run_id(),
            content_id: content_id.into(),
            item_count,
            stopped: false,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Generate an opaque run identifier unique enough for one store.
pub fn generate_run_id() -> String {
    let timestamp_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    let pid = std::process::id();
    format!("run-{}-{}", timestamp_ms, pid)
}
