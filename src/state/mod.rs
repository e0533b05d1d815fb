//! Per-item state machine and the shared run state it guards.
//!
//! `idle -> loading -> {success | error}`, with `error -> loading` on
//! retry. Every mutation (scheduler, retry loop, push listener, poll tick,
//! manual retry) funnels through [`RunState::apply`], which is what makes
//! the no-regression and attempt-accounting invariants hold no matter which
//! async callback fires first. [`SharedRunState`] wraps the state in a lock
//! and persists after every accepted transition.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::orchestrator::events::{emit, EventSender, OrchestratorEvent};
use crate::store::{
    GenerationOutput, JobRecord, JobStatus, JobStore, PersistedRun, RunRecord, STOPPED_REASON,
};

/// A requested state change for one job.
#[derive(Debug, Clone)]
pub enum Transition {
    /// Begin (or re-begin) work: `idle`/`error` -> `loading`, counting one
    /// attempt. Rejected when the run is stopped or the auto-retry budget
    /// is spent.
    Start,
    /// Record a completed generation. Accepted from any non-`success`
    /// state, since a completion may be observed via poll or push for an
    /// item this process never drove (e.g. after a reload); `success`
    /// itself is absorbing, so a duplicate is a no-op.
    Succeed(GenerationOutput),
    /// Record a failed attempt: `loading` -> `error`. The attempt itself
    /// was counted when it started.
    Fail(String),
    /// Record a user stop against an in-flight or failed item.
    Abort,
    /// User-requested retry of a failed item: grants a fresh auto-retry
    /// budget. The item re-enters the pending set; the scheduler issues
    /// the actual `Start`.
    ManualRetry,
}

/// Whether an accepted transition changed anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    /// State changed and was persisted.
    Applied,
    /// The transition was a duplicate of already-recorded state.
    Deduplicated,
}

/// A transition the state machine refused.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransitionError {
    /// No job exists at this index.
    #[error("no job at index {0}")]
    UnknownIndex(usize),

    /// The run is stopped; no new work may start.
    #[error("run is stopped; not starting item {0}")]
    RunStopped(usize),

    /// The item spent its automatic retry budget: max attempts exhausted.
    #[error("item {index}: max attempts exhausted ({attempts} attempts)")]
    RetryExhausted { index: usize, attempts: u32 },

    /// The transition is not legal from the item's current status.
    #[error("item {index}: transition not allowed from {from:?}")]
    NotAllowed { index: usize, from: JobStatus },
}

/// In-memory state of one run: metadata, job records, and presentation-only
/// per-item percent hints (never persisted).
#[derive(Debug, Clone)]
pub struct RunState {
    /// Run metadata.
    pub run: RunRecord,
    /// Per-item records, ordered by index.
    pub jobs: Vec<JobRecord>,
    /// In-flight percent hints from push events. Presentation only.
    pub percent_hints: HashMap<usize, u8>,
}

impl RunState {
    /// Initialize a fresh run with all-idle jobs.
    pub fn fresh(content_id: impl Into<String>, item_count: usize) -> Self {
        Self {
            run: RunRecord::new(content_id, item_count),
            jobs: (0..item_count).map(JobRecord::new).collect(),
            percent_hints: HashMap::new(),
        }
    }

    /// Reconstruct state from a persisted run.
    pub fn from_persisted(persisted: PersistedRun) -> Self {
        let mut jobs = persisted.jobs;
        for job in &mut jobs {
            match job.status {
                // A persisted loading status means the previous process died
                // mid-call; the item is pending again.
                JobStatus::Loading => job.status = JobStatus::Idle,
                // Errored items get a fresh automatic retry budget each
                // session; the cumulative attempt history is kept.
                JobStatus::Error => job.attempts_floor = job.attempts,
                JobStatus::Idle | JobStatus::Success => {}
            }
        }
        Self {
            run: persisted.run,
            jobs,
            percent_hints: HashMap::new(),
        }
    }

    /// The single mutation entry point. Enforces the transition rules and
    /// the no-regression invariant for every caller.
    pub fn apply(
        &mut self,
        index: usize,
        transition: Transition,
        max_attempts: u32,
    ) -> Result<TransitionOutcome, TransitionError> {
        let stopped = self.run.stopped;
        let job = self
            .jobs
            .get_mut(index)
            .ok_or(TransitionError::UnknownIndex(index))?;

        let outcome = match transition {
            Transition::Start => match job.status {
                JobStatus::Idle | JobStatus::Error if stopped => {
                    return Err(TransitionError::RunStopped(index));
                }
                JobStatus::Idle => {
                    job.status = JobStatus::Loading;
                    job.attempts = job.attempts.saturating_add(1);
                    TransitionOutcome::Applied
                }
                JobStatus::Error => {
                    if job.auto_attempts() >= max_attempts {
                        return Err(TransitionError::RetryExhausted {
                            index,
                            attempts: job.attempts,
                        });
                    }
                    job.status = JobStatus::Loading;
                    job.error = None;
                    job.attempts = job.attempts.saturating_add(1);
                    TransitionOutcome::Applied
                }
                // A completed job is never silently redone.
                JobStatus::Success => TransitionOutcome::Deduplicated,
                JobStatus::Loading => TransitionOutcome::Deduplicated,
            },
            Transition::Succeed(output) => match job.status {
                JobStatus::Success => TransitionOutcome::Deduplicated,
                _ => {
                    job.status = JobStatus::Success;
                    job.result = Some(output);
                    job.error = None;
                    self.percent_hints.remove(&index);
                    TransitionOutcome::Applied
                }
            },
            Transition::Fail(reason) => match job.status {
                JobStatus::Loading => {
                    job.status = JobStatus::Error;
                    job.error = Some(reason);
                    job.result = None;
                    TransitionOutcome::Applied
                }
                // A later failure report never downgrades a success.
                JobStatus::Success => TransitionOutcome::Deduplicated,
                from => return Err(TransitionError::NotAllowed { index, from }),
            },
            Transition::Abort => match job.status {
                JobStatus::Loading | JobStatus::Error => {
                    job.status = JobStatus::Error;
                    job.error = Some(STOPPED_REASON.to_string());
                    job.result = None;
                    TransitionOutcome::Applied
                }
                JobStatus::Idle | JobStatus::Success => TransitionOutcome::Deduplicated,
            },
            Transition::ManualRetry => match job.status {
                JobStatus::Error => {
                    job.attempts_floor = job.attempts;
                    TransitionOutcome::Applied
                }
                from => return Err(TransitionError::NotAllowed { index, from }),
            },
        };

        if outcome == TransitionOutcome::Applied {
            self.run.updated_at = Utc::now();
        }
        Ok(outcome)
    }

    /// Indices eligible for (re)try: idle items plus errored items with
    /// remaining auto-retry budget.
    pub fn pending_indices(&self, max_attempts: u32) -> Vec<usize> {
        self.jobs
            .iter()
            .filter(|job| match job.status {
                JobStatus::Idle => true,
                JobStatus::Error => job.auto_attempts() < max_attempts,
                JobStatus::Loading | JobStatus::Success => false,
            })
            .map(|job| job.index)
            .collect()
    }

    /// Whether every item has succeeded.
    pub fn is_complete(&self) -> bool {
        !self.jobs.is_empty() && self.jobs.iter().all(|j| j.status == JobStatus::Success)
    }

    /// (succeeded, errored) counts.
    pub fn counts(&self) -> (usize, usize) {
        let succeeded = self
            .jobs
            .iter()
            .filter(|j| j.status == JobStatus::Success)
            .count();
        let errored = self
            .jobs
            .iter()
            .filter(|j| j.status == JobStatus::Error)
            .count();
        (succeeded, errored)
    }
}

/// Shared, persistence-backed run state.
///
/// Clones are handles to the same state. Writes go through [`apply`], which
/// takes the write lock, applies the transition, and saves the run, so
/// interleaved async callbacks (scheduler, push, poll) cannot lose updates.
///
/// [`apply`]: SharedRunState::apply
#[derive(Clone)]
pub struct SharedRunState {
    inner: Arc<RwLock<RunState>>,
    store: JobStore,
    max_attempts: u32,
    events: Option<EventSender>,
}

impl SharedRunState {
    /// Wrap run state with its backing store.
    pub fn new(state: RunState, store: JobStore, max_attempts: u32) -> Self {
        Self {
            inner: Arc::new(RwLock::new(state)),
            store,
            max_attempts,
            events: None,
        }
    }

    /// Attach the UI event channel, used to surface persistence failures.
    pub(crate) fn with_events(mut self, events: EventSender) -> Self {
        self.events = Some(events);
        self
    }

    /// Apply a transition and, if it changed state, persist. A failed write
    /// does not abort the run: the in-memory state stays authoritative, and
    /// the failure is surfaced as a [`PersistenceDegraded`] event so the
    /// caller knows the run would not survive a restart from here on.
    ///
    /// [`PersistenceDegraded`]: OrchestratorEvent::PersistenceDegraded
    pub async fn apply(
        &self,
        index: usize,
        transition: Transition,
    ) -> Result<TransitionOutcome, TransitionError> {
        let mut state = self.inner.write().await;
        let outcome = state.apply(index, transition, self.max_attempts)?;
        if outcome == TransitionOutcome::Applied {
            if let Err(err) = self.store.save(&state.run, &state.jobs) {
                warn!(index, %err, "failed to persist run state");
                self.report_save_failure(&err);
            }
        } else {
            debug!(index, "deduplicated transition");
        }
        Ok(outcome)
    }

    fn report_save_failure(&self, err: &crate::store::StoreError) {
        if let Some(events) = &self.events {
            emit(
                events,
                OrchestratorEvent::PersistenceDegraded {
                    error: err.to_string(),
                },
            );
        }
    }

    /// Record a presentation-only percent hint for an in-flight item.
    pub async fn set_percent_hint(&self, index: usize, percent: u8) {
        let mut state = self.inner.write().await;
        if state
            .jobs
            .get(index)
            .map(|j| j.status != JobStatus::Success)
            .unwrap_or(false)
        {
            state.percent_hints.insert(index, percent.min(100));
        }
    }

    /// Set and persist the run-level stopped flag.
    pub async fn set_stopped(&self, stopped: bool) {
        let mut state = self.inner.write().await;
        if state.run.stopped != stopped {
            state.run.stopped = stopped;
            state.run.updated_at = Utc::now();
            if let Err(err) = self.store.save(&state.run, &state.jobs) {
                warn!(%err, "failed to persist stopped flag");
                self.report_save_failure(&err);
            }
        }
    }

    /// Pending indices under the configured attempt cap.
    pub async fn pending_indices(&self) -> Vec<usize> {
        self.inner.read().await.pending_indices(self.max_attempts)
    }

    /// Whether the errored item may still be retried automatically.
    pub async fn auto_retry_eligible(&self, index: usize) -> bool {
        let state = self.inner.read().await;
        state
            .jobs
            .get(index)
            .map(|j| j.status == JobStatus::Error && j.auto_attempts() < self.max_attempts)
            .unwrap_or(false)
    }

    /// Snapshot of one job record.
    pub async fn job(&self, index: usize) -> Option<JobRecord> {
        self.inner.read().await.jobs.get(index).cloned()
    }

    /// Snapshot of all job records.
    pub async fn snapshot_jobs(&self) -> Vec<JobRecord> {
        self.inner.read().await.jobs.clone()
    }

    /// Snapshot of the run record.
    pub async fn run_record(&self) -> RunRecord {
        self.inner.read().await.run.clone()
    }

    /// Whether every item has succeeded.
    pub async fn is_complete(&self) -> bool {
        self.inner.read().await.is_complete()
    }

    /// (succeeded, errored) counts.
    pub async fn counts(&self) -> (usize, usize) {
        self.inner.read().await.counts()
    }

    /// Copy of the presentation-only percent hints.
    pub async fn percent_hints(&self) -> HashMap<usize, u8> {
        self.inner.read().await.percent_hints.clone()
    }

    /// Attempt cap this state was configured with.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}
