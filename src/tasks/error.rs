//! Task runner error types.

use thiserror::Error;

/// Result type of a queued task.
pub type TaskResult<T> = Result<T, TaskError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    /// the task returned an error
    #[error("task '{name}' failed: {message}")]
    Failed { name: String, message: String },

    /// cancelled before it started (or it observed its token and stopped)
    #[error("task '{name}' was cancelled")]
    Cancelled { name: String },

    /// the task panicked; the worker keeps running
    #[error("task '{name}' panicked: {message}")]
    Panicked { name: String, message: String },

    /// the queue is at capacity
    #[error("task queue is full, '{name}' was not queued")]
    QueueFull { name: String },

    /// the runner shut down before the task reported back
    #[error("task runner stopped before '{name}' finished")]
    WorkerGone { name: String },
}

impl TaskError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, TaskError::Cancelled { .. })
    }

    pub fn task_name(&self) -> &str {
        match self {
            TaskError::Failed { name, .. }
            | TaskError::Cancelled { name }
            | TaskError::Panicked { name, .. }
            | TaskError::QueueFull { name }
            | TaskError::WorkerGone { name } => name,
        }
    }
}
