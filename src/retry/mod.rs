//! Bounded fixed-delay retry around a single remote generation call.
//!
//! The delay is constant rather than exponential, matching the observed
//! production behavior; it is a tunable, not a constant, precisely because
//! that choice deserves revisiting. The stop signal is checked before every
//! attempt and during the delay, and a per-call timeout folds into the
//! ordinary failure path.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::OrchestratorConfig;
use crate::orchestrator::events::{emit, EventSender, OrchestratorEvent};
use crate::remote::{GenerationBackend, ItemDescriptor};
use crate::state::{SharedRunState, Transition, TransitionError};
use crate::stop::StopSignal;

/// How one job's retry loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// The item reached success (possibly recorded by the reconciler
    /// before our own call landed).
    Succeeded,
    /// The item failed and its automatic retry budget is spent.
    Failed,
    /// A stop request aborted the loop.
    Stopped,
}

/// Bounded retry driver for one job at a time.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    retry_delay: Duration,
    call_timeout: Duration,
}

impl RetryPolicy {
    /// Build a policy from the orchestrator configuration.
    pub fn from_config(config: &OrchestratorConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            retry_delay: config.retry_delay,
            call_timeout: config.call_timeout,
        }
    }

    /// Drive one item to success, terminal failure, or stop.
    ///
    /// Every attempt goes through the shared state machine, so attempts are
    /// counted per logical attempt no matter which layer triggered the
    /// retry.
    pub async fn execute(
        &self,
        item: &ItemDescriptor,
        backend: &Arc<dyn GenerationBackend>,
        state: &SharedRunState,
        stop: &StopSignal,
        events: &EventSender,
    ) -> JobOutcome {
        let index = item.index;
        loop {
            if stop.is_stopped() {
                // Between attempts a stop lands immediately; an errored item
                // is re-marked with the stop reason, an idle one untouched.
                let _ = state.apply(index, Transition::Abort).await;
                return JobOutcome::Stopped;
            }

            match state.apply(index, Transition::Start).await {
                Ok(_) => {}
                Err(TransitionError::RetryExhausted { .. }) => return JobOutcome::Failed,
                Err(TransitionError::RunStopped(_)) => return JobOutcome::Stopped,
                Err(err) => {
                    warn!(index, %err, "could not start job");
                    return JobOutcome::Failed;
                }
            }

            // The reconciler may have completed the item before we got the
            // lock; Start on a success dedupes, so re-check.
            if let Some(job) = state.job(index).await {
                if job.status == crate::store::JobStatus::Success {
                    return JobOutcome::Succeeded;
                }
                emit(
                    events,
                    OrchestratorEvent::ItemStarted {
                        index,
                        attempt: job.attempts,
                    },
                );
            }

            let reason = match tokio::time::timeout(self.call_timeout, backend.submit(item)).await
            {
                Ok(Ok(outcome)) if outcome.success => match outcome.result {
                    Some(output) => {
                        if state.apply(index, Transition::Succeed(output)).await.is_ok() {
                            emit(events, OrchestratorEvent::ItemCompleted { index });
                        }
                        return JobOutcome::Succeeded;
                    }
                    None => "backend reported success without a result".to_string(),
                },
                Ok(Ok(outcome)) => outcome
                    .message
                    .unwrap_or_else(|| "generation rejected".to_string()),
                Ok(Err(err)) => err.to_string(),
                Err(_) => format!("timed out after {:?}", self.call_timeout),
            };

            debug!(index, %reason, "generation attempt failed");
            let _ = state.apply(index, Transition::Fail(reason.clone())).await;

            let terminal = !state.auto_retry_eligible(index).await;
            let attempts = state.job(index).await.map(|j| j.attempts).unwrap_or(0);
            emit(
                events,
                OrchestratorEvent::ItemFailed {
                    index,
                    error: reason,
                    attempts,
                    terminal,
                },
            );
            if terminal {
                return JobOutcome::Failed;
            }

            if !stop.sleep_unless_stopped(self.retry_delay).await {
                let _ = state.apply(index, Transition::Abort).await;
                return JobOutcome::Stopped;
            }
        }
    }

    /// Attempt cap this policy enforces.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::mpsc;

    use crate::remote::{ContentKind, RemoteError, SubmitOutcome};
    use crate::state::RunState;
    use crate::store::{GenerationOutput, JobStatus, JobStore};

    /// Backend that fails a fixed number of times before succeeding.
    struct FlakyBackend {
        failures: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl GenerationBackend for FlakyBackend {
        async fn submit(&self, _item: &ItemDescriptor) -> Result<SubmitOutcome, RemoteError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Ok(SubmitOutcome::failed("upstream 503"))
            } else {
                Ok(SubmitOutcome::ok(GenerationOutput::Text {
                    content: "done".to_string(),
                }))
            }
        }
    }

    /// Backend that never answers within any reasonable timeout.
    struct HangingBackend;

    #[async_trait]
    impl GenerationBackend for HangingBackend {
        async fn submit(&self, _item: &ItemDescriptor) -> Result<SubmitOutcome, RemoteError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(SubmitOutcome::failed("unreachable"))
        }
    }

    fn harness(max_attempts: u32) -> (SharedRunState, RetryPolicy, tempfile::TempDir) {
        let temp_dir = tempfile::TempDir::new().expect("temp dir");
        let store = JobStore::new(temp_dir.path()).expect("store");
        let state = SharedRunState::new(RunState::fresh("content-r", 1), store, max_attempts);
        let policy = RetryPolicy {
            max_attempts,
            retry_delay: Duration::from_millis(5),
            call_timeout: Duration::from_millis(100),
        };
        (state, policy, temp_dir)
    }

    fn item() -> ItemDescriptor {
        ItemDescriptor::new(0, "Chapter 1", ContentKind::Text)
    }

    #[tokio::test]
    async fn fails_twice_then_succeeds_with_three_attempts() {
        let (state, policy, _guard) = harness(5);
        let backend: Arc<dyn GenerationBackend> = Arc::new(FlakyBackend {
            failures: 2,
            calls: AtomicU32::new(0),
        });
        let (tx, _rx) = mpsc::channel(64);

        let outcome = policy
            .execute(&item(), &backend, &state, &StopSignal::new(), &tx)
            .await;

        assert_eq!(outcome, JobOutcome::Succeeded);
        let job = state.job(0).await.expect("job");
        assert_eq!(job.status, JobStatus::Success);
        assert_eq!(job.attempts, 3); // two failed attempts plus the successful one
    }

    #[tokio::test]
    async fn exhausting_the_budget_is_terminal() {
        let (state, policy, _guard) = harness(3);
        let backend: Arc<dyn GenerationBackend> = Arc::new(FlakyBackend {
            failures: u32::MAX,
            calls: AtomicU32::new(0),
        });
        let (tx, mut rx) = mpsc::channel(64);

        let outcome = policy
            .execute(&item(), &backend, &state, &StopSignal::new(), &tx)
            .await;

        assert_eq!(outcome, JobOutcome::Failed);
        let job = state.job(0).await.expect("job");
        assert_eq!(job.status, JobStatus::Error);
        assert_eq!(job.attempts, 3);
        assert!(!state.auto_retry_eligible(0).await);

        // The last failure event must be flagged terminal.
        let mut last_terminal = false;
        while let Ok(event) = rx.try_recv() {
            if let OrchestratorEvent::ItemFailed { terminal, .. } = event {
                last_terminal = terminal;
            }
        }
        assert!(last_terminal);
    }

    #[tokio::test]
    async fn timeout_counts_as_an_ordinary_failure() {
        let (state, policy, _guard) = harness(1);
        let backend: Arc<dyn GenerationBackend> = Arc::new(HangingBackend);
        let (tx, _rx) = mpsc::channel(64);

        let outcome = policy
            .execute(&item(), &backend, &state, &StopSignal::new(), &tx)
            .await;

        assert_eq!(outcome, JobOutcome::Failed);
        let job = state.job(0).await.expect("job");
        assert_eq!(job.attempts, 1);
        assert!(job.error.as_deref().unwrap_or("").contains("timed out"));
    }

    #[tokio::test]
    async fn stop_during_retry_delay_aborts_the_loop() {
        let (state, _policy, _guard) = harness(5);
        let policy = RetryPolicy {
            max_attempts: 5,
            retry_delay: Duration::from_secs(60),
            call_timeout: Duration::from_millis(100),
        };
        let backend: Arc<dyn GenerationBackend> = Arc::new(FlakyBackend {
            failures: u32::MAX,
            calls: AtomicU32::new(0),
        });
        let (tx, _rx) = mpsc::channel(64);
        let stop = StopSignal::new();

        let task = {
            let state = state.clone();
            let stop = stop.clone();
            let item = item();
            tokio::spawn(async move { policy.execute(&item, &backend, &state, &stop, &tx).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        stop.trigger();

        assert_eq!(task.await.expect("join"), JobOutcome::Stopped);
        let job = state.job(0).await.expect("job");
        assert!(job.stopped_by_user());
    }
}
