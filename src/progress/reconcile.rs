//! Dual-source progress reconciliation.
//!
//! Progress for a run arrives over two channels that are not synchronized
//! with each other or with the scheduler's own calls: a push event stream
//! and a periodic poll. Both are folded through the shared state machine,
//! which is the single reducer enforcing the no-regression rule: a poll
//! result can never downgrade a success, and duplicate completions
//! deduplicate. The push connection is attempted a bounded number of times;
//! once exhausted the reconciler degrades to poll-only and says so once.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::config::OrchestratorConfig;
use crate::orchestrator::events::{emit, EventSender, OrchestratorEvent};
use crate::remote::{PollSource, PushChannel, PushEvent};
use crate::state::{SharedRunState, Transition, TransitionOutcome};
use crate::stop::StopSignal;
use crate::store::JobStatus;

/// Folds push events and poll results into the shared run state.
pub struct ProgressReconciler {
    content_id: String,
    state: SharedRunState,
    push: Option<Arc<dyn PushChannel>>,
    poll: Option<Arc<dyn PollSource>>,
    config: OrchestratorConfig,
    shutdown: StopSignal,
    events: EventSender,
}

impl ProgressReconciler {
    pub fn new(
        content_id: String,
        state: SharedRunState,
        push: Option<Arc<dyn PushChannel>>,
        poll: Option<Arc<dyn PollSource>>,
        config: OrchestratorConfig,
        shutdown: StopSignal,
        events: EventSender,
    ) -> Self {
        Self {
            content_id,
            state,
            push,
            poll,
            config,
            shutdown,
            events,
        }
    }

    /// Run until shut down or the run completes.
    ///
    /// The push connect loop and the poll timer run concurrently: a slow or
    /// refused push connection never delays the polling safety net.
    pub async fn run(self) {
        let mut poll_timer = tokio::time::interval(self.config.poll_interval);
        poll_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // Skip the immediate first tick so polling starts one interval in.
        poll_timer.tick().await;

        let connect = self.connect_push();
        tokio::pin!(connect);
        let mut connecting = true;
        let mut push_rx: Option<mpsc::Receiver<PushEvent>> = None;

        loop {
            tokio::select! {
                _ = self.shutdown.stopped() => break,
                rx = &mut connect, if connecting => {
                    connecting = false;
                    push_rx = rx;
                }
                event = recv_or_pending(&mut push_rx), if !connecting => {
                    match event {
                        Some(event) => self.fold_push_event(event).await,
                        None => {
                            push_rx = None;
                            emit(
                                &self.events,
                                OrchestratorEvent::PushDegraded {
                                    reason: "push channel closed".to_string(),
                                },
                            );
                        }
                    }
                }
                _ = poll_timer.tick() => self.poll_once().await,
            }

            if self.state.is_complete().await {
                break;
            }
        }
    }

    /// Attempt the push connection, bounded by the configured attempt cap.
    async fn connect_push(&self) -> Option<mpsc::Receiver<PushEvent>> {
        let push = self.push.as_ref()?;
        let attempts = self.config.push_reconnect_attempts.max(1);
        for attempt in 1..=attempts {
            if self.shutdown.is_stopped() {
                return None;
            }
            match push.connect(&self.content_id).await {
                Ok(rx) => {
                    debug!(attempt, "push channel connected");
                    return Some(rx);
                }
                Err(err) => {
                    warn!(attempt, %err, "push channel connection failed");
                    if attempt < attempts {
                        self.shutdown
                            .sleep_unless_stopped(self.config.push_reconnect_delay)
                            .await;
                    }
                }
            }
        }
        emit(
            &self.events,
            OrchestratorEvent::PushDegraded {
                reason: format!(
                    "push channel unavailable after {} attempts; using poll fallback",
                    attempts
                ),
            },
        );
        None
    }

    /// Fold one push event. Field precedence goes to the event at the
    /// moment it arrives, but always via the transition function.
    async fn fold_push_event(&self, event: PushEvent) {
        let index = event.index;

        if let Some(percent) = event.progress_percent {
            self.state.set_percent_hint(index, percent).await;
        }

        if event.success == Some(true) {
            if let Some(output) = event.result {
                match self.state.apply(index, Transition::Succeed(output)).await {
                    Ok(TransitionOutcome::Applied) => {
                        emit(&self.events, OrchestratorEvent::ItemCompleted { index });
                    }
                    Ok(TransitionOutcome::Deduplicated) => {}
                    Err(err) => debug!(index, %err, "push completion not applied"),
                }
            } else {
                debug!(index, "push success event without a result; ignoring");
            }
            return;
        }

        if let Some(error) = event.error {
            // Only an in-flight item can fail; anything else is stale news.
            let loading = self
                .state
                .job(index)
                .await
                .map(|j| j.status == JobStatus::Loading)
                .unwrap_or(false);
            if loading {
                if let Err(err) = self.state.apply(index, Transition::Fail(error)).await {
                    debug!(index, %err, "push failure not applied");
                }
            }
        }
    }

    /// One poll pass. Failures are retried silently on the next tick.
    async fn poll_once(&self) {
        let Some(poll) = self.poll.as_ref() else {
            return;
        };
        match poll.fetch_completed(&self.content_id).await {
            Ok(completed) => {
                for item in completed {
                    match self
                        .state
                        .apply(item.index, Transition::Succeed(item.result))
                        .await
                    {
                        Ok(TransitionOutcome::Applied) => {
                            emit(
                                &self.events,
                                OrchestratorEvent::ItemCompleted { index: item.index },
                            );
                        }
                        Ok(TransitionOutcome::Deduplicated) => {}
                        Err(err) => debug!(index = item.index, %err, "poll result not applied"),
                    }
                }
            }
            Err(err) => debug!(%err, "poll failed; will retry on next tick"),
        }
    }
}

/// Receive from the push stream, or park forever when it is absent so the
/// poll arm of the select keeps running.
async fn recv_or_pending(rx: &mut Option<mpsc::Receiver<PushEvent>>) -> Option<PushEvent> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use crate::remote::{CompletedItem, RemoteError};
    use crate::state::RunState;
    use crate::store::{GenerationOutput, JobStore};

    fn output(index: usize) -> GenerationOutput {
        GenerationOutput::Narration {
            media_url: format!("https://cdn.example.com/ch{}.mp3", index),
            duration_secs: None,
        }
    }

    fn shared_state(count: usize) -> (SharedRunState, tempfile::TempDir) {
        let temp_dir = tempfile::TempDir::new().expect("temp dir");
        let store = JobStore::new(temp_dir.path()).expect("store");
        (
            SharedRunState::new(RunState::fresh("content-p", count), store, 5),
            temp_dir,
        )
    }

    fn test_config() -> OrchestratorConfig {
        OrchestratorConfig::narration()
            .with_poll_interval(Duration::from_millis(20))
            .with_push_reconnect_attempts(2)
            .with_push_reconnect_delay(Duration::from_millis(1))
    }

    /// Poll source that always reports the same completed items.
    struct StaticPoll {
        items: Vec<usize>,
        calls: AtomicU32,
    }

    #[async_trait]
    impl PollSource for StaticPoll {
        async fn fetch_completed(
            &self,
            _content_id: &str,
        ) -> Result<Vec<CompletedItem>, RemoteError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self
                .items
                .iter()
                .map(|&index| CompletedItem {
                    index,
                    result: output(index),
                })
                .collect())
        }
    }

    /// Push channel that refuses every connection attempt.
    struct DeadPush {
        attempts: AtomicU32,
    }

    #[async_trait]
    impl PushChannel for DeadPush {
        async fn connect(
            &self,
            _content_id: &str,
        ) -> Result<mpsc::Receiver<PushEvent>, RemoteError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(RemoteError::Transport("connection refused".to_string()))
        }
    }

    /// Push channel handing out a pre-built receiver.
    struct CannedPush {
        rx: std::sync::Mutex<Option<mpsc::Receiver<PushEvent>>>,
    }

    #[async_trait]
    impl PushChannel for CannedPush {
        async fn connect(
            &self,
            _content_id: &str,
        ) -> Result<mpsc::Receiver<PushEvent>, RemoteError> {
            self.rx
                .lock()
                .expect("lock")
                .take()
                .ok_or_else(|| RemoteError::Transport("already connected".to_string()))
        }
    }

    #[tokio::test]
    async fn poll_alone_completes_the_run() {
        let (state, _guard) = shared_state(2);
        let poll = Arc::new(StaticPoll {
            items: vec![0, 1],
            calls: AtomicU32::new(0),
        });
        let (tx, _rx) = mpsc::channel(64);
        let shutdown = StopSignal::new();

        let reconciler = ProgressReconciler::new(
            "content-p".to_string(),
            state.clone(),
            None,
            Some(poll.clone() as Arc<dyn PollSource>),
            test_config(),
            shutdown,
            tx,
        );
        // Exits on its own once every item is complete.
        tokio::time::timeout(Duration::from_secs(5), reconciler.run())
            .await
            .expect("reconciler finished");

        assert!(state.is_complete().await);
    }

    #[tokio::test]
    async fn exhausted_push_attempts_degrade_to_polling() {
        let (state, _guard) = shared_state(1);
        let push = Arc::new(DeadPush {
            attempts: AtomicU32::new(0),
        });
        let poll = Arc::new(StaticPoll {
            items: vec![0],
            calls: AtomicU32::new(0),
        });
        let (tx, mut rx) = mpsc::channel(64);

        let reconciler = ProgressReconciler::new(
            "content-p".to_string(),
            state.clone(),
            Some(push.clone() as Arc<dyn PushChannel>),
            Some(poll as Arc<dyn PollSource>),
            test_config(),
            StopSignal::new(),
            tx,
        );
        tokio::time::timeout(Duration::from_secs(5), reconciler.run())
            .await
            .expect("reconciler finished");

        assert_eq!(push.attempts.load(Ordering::SeqCst), 2);
        assert!(state.is_complete().await);

        let mut degraded = false;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, OrchestratorEvent::PushDegraded { .. }) {
                degraded = true;
            }
        }
        assert!(degraded);
    }

    #[tokio::test]
    async fn polling_runs_while_push_is_still_connecting() {
        let (state, _guard) = shared_state(1);
        let push = Arc::new(DeadPush {
            attempts: AtomicU32::new(0),
        });
        let poll = Arc::new(StaticPoll {
            items: vec![0],
            calls: AtomicU32::new(0),
        });
        let (tx, _rx) = mpsc::channel(64);

        // Reconnect delays add up to far longer than the poll interval; the
        // run must still complete from poll results alone, well before the
        // push side has given up.
        let config = OrchestratorConfig::narration()
            .with_poll_interval(Duration::from_millis(20))
            .with_push_reconnect_attempts(5)
            .with_push_reconnect_delay(Duration::from_secs(5));

        let reconciler = ProgressReconciler::new(
            "content-p".to_string(),
            state.clone(),
            Some(push as Arc<dyn PushChannel>),
            Some(poll as Arc<dyn PollSource>),
            config,
            StopSignal::new(),
            tx,
        );
        tokio::time::timeout(Duration::from_secs(2), reconciler.run())
            .await
            .expect("poll completed the run before push gave up");

        assert!(state.is_complete().await);
    }

    #[tokio::test]
    async fn push_events_fold_through_the_state_machine() {
        let (state, _guard) = shared_state(2);
        let (push_tx, push_rx) = mpsc::channel(16);
        let push = Arc::new(CannedPush {
            rx: std::sync::Mutex::new(Some(push_rx)),
        });
        let (tx, _rx) = mpsc::channel(64);

        push_tx
            .send(PushEvent {
                index: 0,
                progress_percent: Some(40),
                success: None,
                error: None,
                result: None,
            })
            .await
            .expect("send");
        push_tx
            .send(PushEvent {
                index: 0,
                progress_percent: None,
                success: Some(true),
                error: None,
                result: Some(output(0)),
            })
            .await
            .expect("send");
        push_tx
            .send(PushEvent {
                index: 1,
                progress_percent: None,
                success: Some(true),
                error: None,
                result: Some(output(1)),
            })
            .await
            .expect("send");

        let reconciler = ProgressReconciler::new(
            "content-p".to_string(),
            state.clone(),
            Some(push as Arc<dyn PushChannel>),
            None,
            test_config(),
            StopSignal::new(),
            tx,
        );
        tokio::time::timeout(Duration::from_secs(5), reconciler.run())
            .await
            .expect("reconciler finished");

        assert!(state.is_complete().await);
        // The in-flight hint was superseded by the completion.
        assert!(state.percent_hints().await.is_empty());
    }

    #[tokio::test]
    async fn poll_never_downgrades_a_success() {
        let (state, _guard) = shared_state(1);
        state
            .apply(0, Transition::Succeed(output(0)))
            .await
            .expect("succeed");
        let before = state.job(0).await.expect("job");

        let poll = Arc::new(StaticPoll {
            items: vec![0],
            calls: AtomicU32::new(0),
        });
        let (tx, mut rx) = mpsc::channel(64);

        let reconciler = ProgressReconciler::new(
            "content-p".to_string(),
            state.clone(),
            None,
            Some(poll as Arc<dyn PollSource>),
            test_config(),
            StopSignal::new(),
            tx,
        );
        tokio::time::timeout(Duration::from_secs(5), reconciler.run())
            .await
            .expect("reconciler finished");

        // Same record, and no duplicate completion event was emitted.
        assert_eq!(state.job(0).await.expect("job"), before);
        while let Ok(event) = rx.try_recv() {
            assert!(!matches!(event, OrchestratorEvent::ItemCompleted { .. }));
        }
    }

    #[tokio::test]
    async fn shutdown_signal_ends_the_loop() {
        let (state, _guard) = shared_state(3);
        let poll = Arc::new(StaticPoll {
            items: vec![],
            calls: AtomicU32::new(0),
        });
        let (tx, _rx) = mpsc::channel(64);
        let shutdown = StopSignal::new();

        let reconciler = ProgressReconciler::new(
            "content-p".to_string(),
            state,
            None,
            Some(poll as Arc<dyn PollSource>),
            test_config(),
            shutdown.clone(),
            tx,
        );
        let task = tokio::spawn(reconciler.run());
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.trigger();

        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("reconciler exited")
            .expect("join");
    }
}
