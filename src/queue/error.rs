//! Error types for queue operations.

use thiserror::Error;

/// Errors that can occur while adding to or receiving from a queue.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    /// The producer side was already completed; no further adds are accepted.
    #[error("queue '{name}' is completed for adding")]
    Completed {
        /// Queue label used in logs.
        name: &'static str,
    },

    /// The receive was interrupted by the run's cancellation signal.
    #[error("queue '{name}' receive cancelled")]
    Cancelled {
        /// Queue label used in logs.
        name: &'static str,
    },
}

impl QueueError {
    /// Returns true when this error is a cancellation.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}
