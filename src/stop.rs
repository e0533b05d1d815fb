//! Cooperative stop signalling.
//!
//! A stop is a checked flag, not a preemption: in-flight remote calls run
//! to completion and only the scheduling of new work halts. The signal is
//! consulted at every suspension point (batch boundary, pre-retry,
//! cooldown, reconciler loop).

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

/// Cloneable handle for requesting and observing a cooperative stop.
#[derive(Debug, Clone)]
pub struct StopSignal {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl StopSignal {
    /// Create a new signal in the not-stopped state.
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    /// Request a stop. All clones observe it.
    pub fn trigger(&self) {
        let _ = self.tx.send(true);
    }

    /// Re-arm the signal, e.g. when the user resumes after a stop.
    pub fn reset(&self) {
        let _ = self.tx.send(false);
    }

    /// Synchronous check of the current state.
    pub fn is_stopped(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once a stop has been requested.
    pub async fn stopped(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                // Sender gone; no stop can ever arrive.
                std::future::pending::<()>().await;
            }
        }
    }

    /// Sleep for the full duration unless a stop arrives first.
    ///
    /// Returns `true` if the sleep completed, `false` if it was cut short.
    pub async fn sleep_unless_stopped(&self, duration: Duration) -> bool {
        if self.is_stopped() {
            return false;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => true,
            _ = self.stopped() => false,
        }
    }
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}
