//! Batched execution of pending jobs.
//!
//! Pending items are partitioned into fixed-size batches. Each batch fans
//! out concurrently and fans in with `join_all`; a slow job delays only its
//! own batch's fan-in, never its batchmates. Between batches the scheduler
//! sleeps through a cooldown (the upstream generation service is
//! rate-limited), surfacing a one-second countdown and bailing out early if
//! a stop arrives. A stop mid-batch lets the in-flight jobs finish but
//! starts nothing further.

use std::sync::Arc;

use futures::future::join_all;
use tracing::{debug, info};

use crate::config::OrchestratorConfig;
use crate::orchestrator::events::{emit, EventSender, OrchestratorEvent};
use crate::remote::{GenerationBackend, ItemDescriptor};
use crate::retry::{JobOutcome, RetryPolicy};
use crate::state::SharedRunState;
use crate::stop::StopSignal;

/// Aggregate result of one scheduler pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    /// Jobs the pass attempted to drive.
    pub attempted: usize,
    /// Jobs that reached success during the pass.
    pub succeeded: usize,
    /// Jobs that ended the pass terminally failed.
    pub failed: usize,
    /// Whether a stop request cut the pass short.
    pub stopped: bool,
}

/// Drives the pending set to completion in rate-limited batches.
pub struct BatchScheduler {
    config: OrchestratorConfig,
    backend: Arc<dyn GenerationBackend>,
    state: SharedRunState,
    stop: StopSignal,
    events: EventSender,
}

impl BatchScheduler {
    pub fn new(
        config: OrchestratorConfig,
        backend: Arc<dyn GenerationBackend>,
        state: SharedRunState,
        stop: StopSignal,
        events: EventSender,
    ) -> Self {
        Self {
            config,
            backend,
            state,
            stop,
            events,
        }
    }

    /// Run every pending job to resolution, batch by batch.
    pub async fn run(&self, items: &[ItemDescriptor]) -> BatchReport {
        let pending = self.state.pending_indices().await;
        if pending.is_empty() {
            debug!("no pending jobs; nothing to do");
            return BatchReport::default();
        }

        let policy = RetryPolicy::from_config(&self.config);
        let batches: Vec<Vec<usize>> = pending
            .chunks(self.config.batch_size.max(1))
            .map(|chunk| chunk.to_vec())
            .collect();
        let total_batches = batches.len();

        let mut report = BatchReport {
            attempted: pending.len(),
            ..BatchReport::default()
        };

        for (batch_no, batch) in batches.into_iter().enumerate() {
            if self.stop.is_stopped() {
                report.stopped = true;
                break;
            }

            info!(
                batch = batch_no + 1,
                total_batches,
                size = batch.len(),
                "launching batch"
            );
            emit(
                &self.events,
                OrchestratorEvent::BatchStarted {
                    batch: batch_no + 1,
                    total_batches,
                    indices: batch.clone(),
                },
            );

            let jobs = batch.iter().filter_map(|&index| {
                let item = items.iter().find(|item| item.index == index)?;
                let policy = policy.clone();
                let backend = Arc::clone(&self.backend);
                let state = self.state.clone();
                let stop = self.stop.clone();
                let events = self.events.clone();
                Some(async move {
                    policy
                        .execute(item, &backend, &state, &stop, &events)
                        .await
                })
            });

            // Fan-in: the next batch never starts before every call in this
            // one has resolved.
            for outcome in join_all(jobs).await {
                match outcome {
                    JobOutcome::Succeeded => report.succeeded += 1,
                    JobOutcome::Failed => report.failed += 1,
                    JobOutcome::Stopped => report.stopped = true,
                }
            }

            if report.stopped || self.stop.is_stopped() {
                report.stopped = true;
                break;
            }

            let last_batch = batch_no + 1 == total_batches;
            if !last_batch && !self.cooldown().await {
                report.stopped = true;
                break;
            }
        }

        report
    }

    /// Wait out the inter-batch cooldown, ticking once per second.
    ///
    /// Returns `false` if a stop request interrupted the wait.
    async fn cooldown(&self) -> bool {
        let cooldown = self.config.cooldown;
        if cooldown.is_zero() {
            return true;
        }

        let mut remaining = cooldown;
        while !remaining.is_zero() {
            emit(
                &self.events,
                OrchestratorEvent::CooldownTick {
                    remaining_secs: remaining.as_secs(),
                },
            );
            let step = remaining.min(std::time::Duration::from_secs(1));
            if !self.stop.sleep_unless_stopped(step).await {
                return false;
            }
            remaining = remaining.saturating_sub(step);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::mpsc;

    use crate::remote::{ContentKind, RemoteError, SubmitOutcome};
    use crate::state::RunState;
    use crate::store::{GenerationOutput, JobStatus, JobStore};

    /// Backend that logs, per call, which other calls were still in flight
    /// when it started.
    struct TracingBackend {
        log: Mutex<Vec<(usize, Vec<usize>)>>,
        in_flight: Mutex<Vec<usize>>,
        delay: Duration,
    }

    impl TracingBackend {
        fn new(delay: Duration) -> Self {
            Self {
                log: Mutex::new(Vec::new()),
                in_flight: Mutex::new(Vec::new()),
                delay,
            }
        }
    }

    #[async_trait]
    impl GenerationBackend for TracingBackend {
        async fn submit(&self, item: &ItemDescriptor) -> Result<SubmitOutcome, RemoteError> {
            {
                let in_flight = self.in_flight.lock().expect("lock");
                self.log
                    .lock()
                    .expect("lock")
                    .push((item.index, in_flight.clone()));
            }
            self.in_flight.lock().expect("lock").push(item.index);
            tokio::time::sleep(self.delay).await;
            self.in_flight
                .lock()
                .expect("lock")
                .retain(|&i| i != item.index);
            Ok(SubmitOutcome::ok(GenerationOutput::Text {
                content: format!("chapter {}", item.index),
            }))
        }
    }

    fn test_config() -> OrchestratorConfig {
        OrchestratorConfig::narration()
            .with_batch_size(2)
            .with_cooldown(Duration::ZERO)
            .with_retry_delay(Duration::from_millis(1))
            .with_call_timeout(Duration::from_secs(5))
    }

    fn items(count: usize) -> Vec<ItemDescriptor> {
        (0..count)
            .map(|i| ItemDescriptor::new(i, format!("Chapter {}", i + 1), ContentKind::Narration))
            .collect()
    }

    fn shared_state(count: usize, max_attempts: u32) -> (SharedRunState, tempfile::TempDir) {
        let temp_dir = tempfile::TempDir::new().expect("temp dir");
        let store = JobStore::new(temp_dir.path()).expect("store");
        (
            SharedRunState::new(RunState::fresh("content-b", count), store, max_attempts),
            temp_dir,
        )
    }

    #[tokio::test]
    async fn batches_never_overlap() {
        let (state, _guard) = shared_state(5, 5);
        let backend = Arc::new(TracingBackend::new(Duration::from_millis(30)));
        let (tx, _rx) = mpsc::channel(256);

        let scheduler = BatchScheduler::new(
            test_config(),
            backend.clone() as Arc<dyn GenerationBackend>,
            state.clone(),
            StopSignal::new(),
            tx,
        );
        let report = scheduler.run(&items(5)).await;

        assert_eq!(report.attempted, 5);
        assert_eq!(report.succeeded, 5);
        assert_eq!(report.failed, 0);
        assert!(!report.stopped);

        // With batch size 2 over items 0..5, an item may only overlap its
        // batchmate: [0,1], [2,3], [4].
        let log = backend.log.lock().expect("lock");
        assert_eq!(log.len(), 5);
        for (index, concurrent) in log.iter() {
            for other in concurrent {
                assert_eq!(
                    index / 2,
                    other / 2,
                    "item {} saw item {} from another batch in flight",
                    index,
                    other
                );
            }
        }
        assert!(state.is_complete().await);
    }

    #[tokio::test]
    async fn empty_pending_set_reports_nothing_to_do() {
        let (state, _guard) = shared_state(2, 5);
        for i in 0..2 {
            state
                .apply(i, crate::state::Transition::Succeed(GenerationOutput::Text {
                    content: "done".to_string(),
                }))
                .await
                .expect("succeed");
        }
        let backend = Arc::new(TracingBackend::new(Duration::ZERO));
        let (tx, _rx) = mpsc::channel(256);

        let scheduler = BatchScheduler::new(
            test_config(),
            backend.clone() as Arc<dyn GenerationBackend>,
            state,
            StopSignal::new(),
            tx,
        );
        let report = scheduler.run(&items(2)).await;

        assert_eq!(report, BatchReport::default());
        assert!(backend.log.lock().expect("lock").is_empty());
    }

    #[tokio::test]
    async fn stop_mid_run_skips_later_batches_but_finishes_in_flight() {
        let (state, _guard) = shared_state(6, 5);
        let backend = Arc::new(TracingBackend::new(Duration::from_millis(80)));
        let (tx, _rx) = mpsc::channel(256);
        let stop = StopSignal::new();

        let scheduler = BatchScheduler::new(
            test_config().with_cooldown(Duration::from_millis(200)),
            backend.clone() as Arc<dyn GenerationBackend>,
            state.clone(),
            stop.clone(),
            tx,
        );

        let stopper = {
            let stop = stop.clone();
            tokio::spawn(async move {
                // Land the stop during the first batch's calls.
                tokio::time::sleep(Duration::from_millis(40)).await;
                stop.trigger();
            })
        };
        let report = scheduler.run(&items(6)).await;
        stopper.await.expect("join");

        assert!(report.stopped);
        // The first batch's in-flight jobs completed and were recorded.
        let jobs = state.snapshot_jobs().await;
        assert_eq!(jobs[0].status, JobStatus::Success);
        assert_eq!(jobs[1].status, JobStatus::Success);
        // No job from a later batch was ever submitted.
        let log = backend.log.lock().expect("lock");
        assert!(log.iter().all(|(index, _)| *index < 2));
    }

    #[tokio::test]
    async fn cooldown_emits_countdown_and_yields_to_stop() {
        let (state, _guard) = shared_state(4, 5);
        let backend = Arc::new(TracingBackend::new(Duration::ZERO));
        let (tx, mut rx) = mpsc::channel(256);
        let stop = StopSignal::new();

        let scheduler = BatchScheduler::new(
            test_config().with_cooldown(Duration::from_secs(3)),
            backend as Arc<dyn GenerationBackend>,
            state,
            stop.clone(),
            tx,
        );

        let stopper = {
            let stop = stop.clone();
            tokio::spawn(async move {
                // First batch is instantaneous; interrupt the cooldown.
                tokio::time::sleep(Duration::from_millis(100)).await;
                stop.trigger();
            })
        };
        let report = scheduler.run(&items(4)).await;
        stopper.await.expect("join");

        assert!(report.stopped);
        let mut saw_tick = false;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, OrchestratorEvent::CooldownTick { .. }) {
                saw_tick = true;
            }
        }
        assert!(saw_tick);
    }
}
