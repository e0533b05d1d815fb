//! The orchestration facade.
//!
//! One [`Orchestrator`] drives one content id: it decides between resuming
//! persisted state and starting fresh, runs the batch scheduler with the
//! reconciler alongside, and exposes stop, per-item retry, progress, and
//! finalize to the embedding UI layer.

pub mod events;

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::OrchestratorConfig;
use crate::error::OrchestratorError;
use crate::progress::reconcile::ProgressReconciler;
use crate::progress::{EtaEstimator, ProgressSnapshot};
use crate::remote::{GenerationBackend, ItemDescriptor, OutputSink, PollSource, PushChannel};
use crate::scheduler::BatchScheduler;
use crate::state::{RunState, SharedRunState, Transition};
use crate::stop::StopSignal;
use crate::store::{JobStatus, JobStore};

pub use events::{OrchestratorEvent, EVENT_CHANNEL_CAPACITY};

use events::{emit, EventSender};

/// Summary of one scheduler pass over a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    /// Identifier of the run the pass belonged to.
    pub run_id: String,
    /// Items that are successful after the pass.
    pub succeeded: usize,
    /// Items in error after the pass.
    pub failed: usize,
    /// Whether a stop request ended the pass early.
    pub stopped: bool,
    /// Wall-clock duration of the pass.
    pub elapsed: Duration,
}

/// Facade over the scheduler, reconciler, retry policy, and store.
pub struct Orchestrator {
    content_id: String,
    config: OrchestratorConfig,
    store: JobStore,
    backend: Arc<dyn GenerationBackend>,
    push: Option<Arc<dyn PushChannel>>,
    poll: Option<Arc<dyn PollSource>>,
    stop: StopSignal,
    events: EventSender,
    state: RwLock<Option<SharedRunState>>,
    items: RwLock<Vec<ItemDescriptor>>,
    estimator: RwLock<Option<EtaEstimator>>,
}

impl Orchestrator {
    /// Create an orchestrator for one content id.
    ///
    /// Returns the facade and the receiver for its UI event stream.
    pub fn new(
        content_id: impl Into<String>,
        config: OrchestratorConfig,
        store: JobStore,
        backend: Arc<dyn GenerationBackend>,
    ) -> (Self, mpsc::Receiver<OrchestratorEvent>) {
        let (events, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let orchestrator = Self {
            content_id: content_id.into(),
            config,
            store,
            backend,
            push: None,
            poll: None,
            stop: StopSignal::new(),
            events,
            state: RwLock::new(None),
            items: RwLock::new(Vec::new()),
            estimator: RwLock::new(None),
        };
        (orchestrator, events_rx)
    }

    /// Attach a push channel for near-real-time progress.
    pub fn with_push_channel(mut self, push: Arc<dyn PushChannel>) -> Self {
        self.push = Some(push);
        self
    }

    /// Attach a poll source used as fallback and safety net.
    pub fn with_poll_source(mut self, poll: Arc<dyn PollSource>) -> Self {
        self.poll = Some(poll);
        self
    }

    /// Start (or resume) generation for the given items and drive every
    /// pending job to resolution.
    ///
    /// If persisted state for this content id exists with a matching item
    /// count and is incomplete, it is resumed: already-successful items are
    /// never re-run. Otherwise a fresh run is initialized and persisted.
    pub async fn start(
        &self,
        items: Vec<ItemDescriptor>,
    ) -> Result<RunSummary, OrchestratorError> {
        validate_items(&items)?;

        let (run_state, resumed) = match self.store.load(&self.content_id) {
            Some(persisted) if persisted.run.item_count == items.len() => {
                info!(
                    content_id = %self.content_id,
                    run_id = %persisted.run.run_id,
                    "resuming persisted run"
                );
                (RunState::from_persisted(persisted), true)
            }
            Some(persisted) => {
                warn!(
                    content_id = %self.content_id,
                    persisted_items = persisted.run.item_count,
                    requested_items = items.len(),
                    "persisted run does not match requested items; starting fresh"
                );
                (RunState::fresh(&self.content_id, items.len()), false)
            }
            None => (RunState::fresh(&self.content_id, items.len()), false),
        };

        // Starting (or resuming) expresses fresh user intent: re-arm any
        // earlier stop.
        self.stop.reset();
        if let Err(err) = self.store.clear_stopped(&self.content_id) {
            warn!(%err, "failed to clear persisted stop marker");
        }

        let shared = SharedRunState::new(run_state, self.store.clone(), self.config.max_attempts)
            .with_events(self.events.clone());
        shared.set_stopped(false).await;
        let run = shared.run_record().await;
        self.store.save(&run, &shared.snapshot_jobs().await)?;

        {
            let mut slot = self.state.write().await;
            *slot = Some(shared.clone());
        }
        {
            let mut slot = self.items.write().await;
            *slot = items.clone();
        }

        emit(
            &self.events,
            OrchestratorEvent::RunStarted {
                run_id: run.run_id.clone(),
                item_count: run.item_count,
                resumed,
            },
        );

        self.run_pending(shared, items).await
    }

    /// Request a cooperative stop: in-flight calls finish and are recorded,
    /// nothing new starts. Already-obtained results are kept.
    pub async fn stop(&self) {
        self.stop.trigger();
        if let Err(err) = self.store.mark_stopped(&self.content_id) {
            warn!(%err, "failed to persist stop marker");
        }
        if let Some(state) = self.state.read().await.clone() {
            state.set_stopped(true).await;
        }
        emit(&self.events, OrchestratorEvent::RunStopped);
    }

    /// Re-enter one failed item into the pending set and drive it again.
    /// Grants the item a fresh automatic retry budget.
    pub async fn retry_item(&self, index: usize) -> Result<RunSummary, OrchestratorError> {
        let (state, items) = self.live_run().await?;
        state.apply(index, Transition::ManualRetry).await?;
        self.run_pending(state, items).await
    }

    /// Re-enter every failed item and drive the pending set again.
    pub async fn retry_all_failed(&self) -> Result<RunSummary, OrchestratorError> {
        let (state, items) = self.live_run().await?;
        for job in state.snapshot_jobs().await {
            if job.status == JobStatus::Error {
                state.apply(job.index, Transition::ManualRetry).await?;
            }
        }
        self.run_pending(state, items).await
    }

    /// Current aggregate progress. Pure read, no side effects.
    pub async fn progress(&self) -> ProgressSnapshot {
        let Some(state) = self.state.read().await.clone() else {
            return ProgressSnapshot::empty();
        };
        let run = state.run_record().await;
        let (completed, errored) = state.counts().await;
        let eta = match self.estimator.read().await.as_ref() {
            Some(estimator) => estimator.estimate(completed, run.item_count),
            None => None,
        };
        ProgressSnapshot {
            total: run.item_count,
            completed,
            errored,
            percent_complete: if run.item_count == 0 {
                0.0
            } else {
                completed as f64 / run.item_count as f64
            },
            stopped: run.stopped,
            eta,
            item_percent_hints: state.percent_hints().await,
        }
    }

    /// Per-item records for the UI layer.
    pub async fn jobs(&self) -> Vec<crate::store::JobRecord> {
        match self.state.read().await.clone() {
            Some(state) => state.snapshot_jobs().await,
            None => Vec::new(),
        }
    }

    /// Hand the aggregated results to the external save collaborator and,
    /// only if it succeeds, clear persisted state.
    ///
    /// Calling finalize again after a successful one is a no-op. If the
    /// sink fails, state is preserved so the save can simply be retried.
    pub async fn finalize(&self, sink: &dyn OutputSink) -> Result<(), OrchestratorError> {
        let mut slot = self.state.write().await;
        let Some(state) = slot.as_ref() else {
            // Already finalized (or never started): nothing to do.
            return Ok(());
        };

        let jobs = state.snapshot_jobs().await;
        let outputs: Vec<_> = jobs.iter().filter_map(|j| j.result.clone()).collect();
        if outputs.len() != jobs.len() {
            return Err(OrchestratorError::RunIncomplete {
                pending: jobs.len() - outputs.len(),
            });
        }

        sink.save(&self.content_id, outputs)
            .await
            .map_err(OrchestratorError::SaveFailed)?;

        self.store.clear(&self.content_id)?;
        *slot = None;
        info!(content_id = %self.content_id, "run finalized and cleared");
        Ok(())
    }

    /// Content id this orchestrator drives.
    pub fn content_id(&self) -> &str {
        &self.content_id
    }

    async fn live_run(
        &self,
    ) -> Result<(SharedRunState, Vec<ItemDescriptor>), OrchestratorError> {
        let state = self
            .state
            .read()
            .await
            .clone()
            .ok_or(OrchestratorError::NotStarted)?;
        let items = self.items.read().await.clone();
        Ok((state, items))
    }

    /// Shared tail of `start` and the retry entry points: run the scheduler
    /// with the reconciler alongside, then report.
    async fn run_pending(
        &self,
        state: SharedRunState,
        items: Vec<ItemDescriptor>,
    ) -> Result<RunSummary, OrchestratorError> {
        let started = Instant::now();
        let (completed_before, _) = state.counts().await;
        {
            let mut slot = self.estimator.write().await;
            *slot = Some(EtaEstimator::new(completed_before));
        }

        let reconciler_shutdown = StopSignal::new();
        let reconciler: Option<JoinHandle<()>> =
            if self.push.is_some() || self.poll.is_some() {
                let reconciler = ProgressReconciler::new(
                    self.content_id.clone(),
                    state.clone(),
                    self.push.clone(),
                    self.poll.clone(),
                    self.config.clone(),
                    reconciler_shutdown.clone(),
                    self.events.clone(),
                );
                Some(tokio::spawn(reconciler.run()))
            } else {
                None
            };

        let scheduler = BatchScheduler::new(
            self.config.clone(),
            Arc::clone(&self.backend),
            state.clone(),
            self.stop.clone(),
            self.events.clone(),
        );
        let report = scheduler.run(&items).await;

        reconciler_shutdown.trigger();
        if let Some(handle) = reconciler {
            let _ = handle.await;
        }

        let run = state.run_record().await;
        let (succeeded, failed) = state.counts().await;
        let summary = RunSummary {
            run_id: run.run_id,
            succeeded,
            failed,
            stopped: report.stopped || run.stopped,
            elapsed: started.elapsed(),
        };
        emit(
            &self.events,
            OrchestratorEvent::RunComplete {
                succeeded,
                failed,
                stopped: summary.stopped,
            },
        );
        info!(
            succeeded,
            failed,
            stopped = summary.stopped,
            "scheduler pass finished"
        );
        Ok(summary)
    }
}

fn validate_items(items: &[ItemDescriptor]) -> Result<(), OrchestratorError> {
    if items.is_empty() {
        return Err(OrchestratorError::InvalidItems(
            "no items to generate".to_string(),
        ));
    }
    for (position, item) in items.iter().enumerate() {
        if item.index != position {
            return Err(OrchestratorError::InvalidItems(format!(
                "descriptor at position {} has index {}",
                position, item.index
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::ContentKind;

    #[test]
    fn items_must_be_contiguous_from_zero() {
        assert!(validate_items(&[]).is_err());

        let good = vec![
            ItemDescriptor::new(0, "a", ContentKind::Text),
            ItemDescriptor::new(1, "b", ContentKind::Text),
        ];
        assert!(validate_items(&good).is_ok());

        let bad = vec![
            ItemDescriptor::new(0, "a", ContentKind::Text),
            ItemDescriptor::new(2, "c", ContentKind::Text),
        ];
        assert!(validate_items(&bad).is_err());
    }
}
