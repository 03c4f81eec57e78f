//! Error types for queue, event and stream operations.
//!
//! Errors fall into three families:
//!
//! - **invalid state**: logical misuse such as recording an event twice,
//!   releasing it past zero or waiting on an event that was never recorded;
//! - **backend failure**: a native stream or marker call failed, carried as the
//!   backend's own [`BackendError`];
//! - **fatal**: the context or device was lost and the queue refuses further work.
//!
//! Nothing is retried internally; every failure reaches the caller.

pub use crate::backend::BackendError;

/// Errors returned by the scheduler.
#[derive(Debug, Clone, thiserror::Error)]
pub enum QueueError {
    /// Operation is not valid in the object's current state.
    #[error("Invalid state: expected {expected}, actual {actual}")]
    InvalidState {
        /// State the operation requires.
        expected: String,
        /// State the object is in.
        actual: String,
    },

    /// A dependency list contains an event that cannot be waited on.
    #[error("Invalid event wait list: {0}")]
    InvalidEventWaitList(String),

    /// Timestamps were requested but are not available.
    #[error("Profiling info not available: {0}")]
    ProfilingUnavailable(String),

    /// Queue configuration was rejected.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A native backend call failed.
    #[error("Backend failure: {0}")]
    Backend(#[from] BackendError),

    /// The queue's context or device was lost.
    #[error("Context lost")]
    ContextLost,

    /// The queue refused the operation after an earlier fatal error.
    #[error("Queue aborted after a fatal error")]
    QueueAborted,
}

impl QueueError {
    /// Build an [`QueueError::InvalidState`].
    pub fn invalid_state(expected: impl Into<String>, actual: impl Into<String>) -> Self {
        QueueError::InvalidState {
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// True for logical misuse (state, wait list, profiling, config).
    #[must_use]
    pub fn is_invalid_state(&self) -> bool {
        matches!(
            self,
            QueueError::InvalidState { .. }
                | QueueError::InvalidEventWaitList(_)
                | QueueError::ProfilingUnavailable(_)
                | QueueError::InvalidConfig(_)
        )
    }

    /// True when a native backend call failed.
    #[must_use]
    pub fn is_backend_failure(&self) -> bool {
        matches!(self, QueueError::Backend(_))
    }

    /// True when the owning queue can no longer be used.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        match self {
            QueueError::ContextLost | QueueError::QueueAborted => true,
            QueueError::Backend(e) => e.is_device_lost(),
            _ => false,
        }
    }
}

/// Result type for scheduler operations.
pub type Result<T> = std::result::Result<T, QueueError>;
