//! Events emitted to the embedding UI layer.
//!
//! Sent with `try_send`: a slow or absent consumer never blocks the
//! scheduler, at the cost of dropped events. Everything an event carries
//! can also be rebuilt from a [`ProgressSnapshot`](crate::progress::ProgressSnapshot)
//! read, so drops are cosmetic.

use tokio::sync::mpsc;
use tracing::trace;

/// Capacity of the UI event channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 128;

/// Progress events surfaced while a run executes.
#[derive(Debug, Clone, PartialEq)]
pub enum OrchestratorEvent {
    /// A run began executing (fresh or resumed).
    RunStarted {
        run_id: String,
        item_count: usize,
        resumed: bool,
    },
    /// A batch of jobs is being launched.
    BatchStarted {
        batch: usize,
        total_batches: usize,
        indices: Vec<usize>,
    },
    /// A remote call for an item was issued.
    ItemStarted { index: usize, attempt: u32 },
    /// An item reached success.
    ItemCompleted { index: usize },
    /// An attempt for an item failed. `terminal` is set once the automatic
    /// retry budget is spent.
    ItemFailed {
        index: usize,
        error: String,
        attempts: u32,
        terminal: bool,
    },
    /// One-second countdown tick during the inter-batch cooldown.
    CooldownTick { remaining_secs: u64 },
    /// The push channel is unavailable; progress continues via polling.
    PushDegraded { reason: String },
    /// A state change could not be persisted. The run keeps executing in
    /// memory, but would not survive a restart from this point on.
    PersistenceDegraded { error: String },
    /// A stop was requested; in-flight work will finish, nothing new starts.
    RunStopped,
    /// The scheduler pass finished.
    RunComplete {
        succeeded: usize,
        failed: usize,
        stopped: bool,
    },
}

/// Sender side of the UI event channel.
pub(crate) type EventSender = mpsc::Sender<OrchestratorEvent>;

/// Best-effort emit; drops are logged at trace only.
pub(crate) fn emit(sender: &EventSender, event: OrchestratorEvent) {
    if sender.try_send(event).is_err() {
        trace!("event channel full or closed; dropping event");
    }
}
