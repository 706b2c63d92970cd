//! Error types for scheduler operations.

use thiserror::Error;

use super::properties::TaskId;

/// Errors produced by the scheduling core.
///
/// A short or empty extraction result is not an error: it means no more
/// eligible work is available right now.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Caller bug: duplicate task id on insert, or malformed extraction input.
    #[error("invalid state: {0}")]
    InvalidState(String),
    /// The properties resolver could not classify a task.
    #[error("cannot resolve properties of task {task_id}: {reason}")]
    ResolutionFailed {
        /// Task that failed resolution.
        task_id: TaskId,
        /// Human-readable cause.
        reason: String,
    },
}

/// Application-facing result using anyhow for higher-level contexts.
pub type AppResult<T> = Result<T, anyhow::Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_state_display() {
        let err = SchedulerError::InvalidState("task 7 already queued".into());
        assert_eq!(err.to_string(), "invalid state: task 7 already queued");
    }

    #[test]
    fn test_resolution_failed_display() {
        let err = SchedulerError::ResolutionFailed {
            task_id: 42,
            reason: "unknown user".into(),
        };
        assert_eq!(
            err.to_string(),
            "cannot resolve properties of task 42: unknown user"
        );
    }
}
