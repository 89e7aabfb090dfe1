/*!
# Error Module

This module defines the error handling infrastructure for Lockstep.

Most queue operations cannot fail at all: dropping work after shutdown and
canceling an operation that already ran are silent no-ops. What remains are
programming-contract violations (calling a blocking or reentrancy-checked
operation from inside the queue) and construction-time failures of the
underlying executor.
*/

use thiserror::Error;

/// Result type alias for Lockstep operations
pub type Result<T> = std::result::Result<T, QueueError>;

/// Errors that can occur during Lockstep operations
#[derive(Debug, Error)]
pub enum QueueError {
    /// A reentrancy-checked operation was called from a task body already
    /// running on the same queue. The offending task was not executed.
    #[error("Reentrancy violation: {operation} called from a task running on this queue")]
    Reentrancy { operation: &'static str },

    #[error("Not running on the queue's execution context")]
    NotCurrentQueue,

    #[error("No scheduled operation with tag: {0}")]
    TagNotScheduled(String),

    #[error("Task panicked while the caller was blocked on it")]
    TaskPanicked,

    #[error("Executor unavailable: {0}")]
    ExecutorUnavailable(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl QueueError {
    /// Whether this error reports a misuse of the queue rather than a
    /// failure of the environment.
    pub fn is_contract_violation(&self) -> bool {
        matches!(
            self,
            Self::Reentrancy { .. } | Self::NotCurrentQueue | Self::TagNotScheduled(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::QueueError;

    #[test]
    fn reentrancy_message_names_the_operation() {
        let err = QueueError::Reentrancy {
            operation: "enqueue_blocking",
        };
        assert_eq!(
            err.to_string(),
            "Reentrancy violation: enqueue_blocking called from a task running on this queue"
        );
        assert!(err.is_contract_violation());
    }

    #[test]
    fn executor_failures_are_not_contract_violations() {
        let err = QueueError::ExecutorUnavailable("no threads".into());
        assert!(!err.is_contract_violation());

        let err: QueueError = anyhow::anyhow!("custom executor refused").into();
        assert!(!err.is_contract_violation());
        assert_eq!(err.to_string(), "custom executor refused");
    }
}
