//! Composed cancellation signals.
//!
//! A job executes under a signal composed from the worker's shutdown token,
//! lease health, and an optional job timeout. The first party to trigger the
//! signal records a cause; the runner uses the cause to decide between
//! resetting the job to `queued` (abort) and recording a timeout failure.

use std::sync::{Arc, Mutex, PoisonError};
use tokio_util::sync::CancellationToken;

/// Why a cancellation signal fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortCause {
    /// The worker is shutting down.
    WorkerShutdown,
    /// The worker lost its lease on the job.
    LeaseLost,
    /// The job-level timeout fired.
    JobTimeout,
    /// The run was cancelled.
    RunCancelled,
}

/// A cancellation token paired with the cause of its first trigger.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    token: CancellationToken,
    cause: Arc<Mutex<Option<AbortCause>>>,
}

impl CancelSignal {
    /// Creates an untriggered signal.
    #[must_use]
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            cause: Arc::new(Mutex::new(None)),
        }
    }

    /// Creates a signal that is cancelled when `parent` is, carrying
    /// `parent_cause` when the parent fires first.
    ///
    /// The child can also be triggered independently with its own cause
    /// without affecting the parent. Call [`CancelSignal::disarm`] once the
    /// guarded work is over so the cause watcher can exit.
    #[must_use]
    pub fn child_of(parent: &CancellationToken, parent_cause: AbortCause) -> Self {
        let signal = Self {
            token: parent.child_token(),
            cause: Arc::new(Mutex::new(None)),
        };
        let parent = parent.clone();
        let token = signal.token.clone();
        let cause = Arc::clone(&signal.cause);
        tokio::spawn(async move {
            // Linked tokens fire together, so one wait covers the parent
            // cancelling, the child triggering, and disarming.
            token.cancelled().await;
            if parent.is_cancelled() {
                let mut slot = cause.lock().unwrap_or_else(PoisonError::into_inner);
                slot.get_or_insert(parent_cause);
            }
        });
        signal
    }

    /// Triggers the signal, recording `cause` if no cause is set yet.
    pub fn trigger(&self, cause: AbortCause) {
        {
            let mut slot = self.cause.lock().unwrap_or_else(PoisonError::into_inner);
            slot.get_or_insert(cause);
        }
        self.token.cancel();
    }

    /// Cancels the underlying token without recording a cause, releasing
    /// any watcher tied to it. Only meaningful after the guarded work has
    /// finished.
    pub fn disarm(&self) {
        self.token.cancel();
    }

    /// Returns true once the signal has fired.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Waits for the signal to fire.
    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }

    /// Returns the recorded cause, if the signal fired.
    #[must_use]
    pub fn cause(&self) -> Option<AbortCause> {
        *self.cause.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the underlying token, for handing to executors.
    #[must_use]
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Default for CancelSignal {
    fn default() -> Self {
        Self::new()
    }
}
