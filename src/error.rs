//! Error types for the task queue

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for task operations
pub type TaskResult<T> = Result<T, TaskError>;

/// Error types for dispatching, executing and awaiting tasks
#[derive(Error, Debug)]
pub enum TaskError {
    /// Redis connection or operation errors
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Message or result serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The task handler itself returned an error
    #[error("Task handler failed: {message}")]
    Handler { message: String },

    /// No handler registered under this name
    #[error("Unknown task: {name}")]
    UnknownTask { name: String },

    /// A handler is already registered under this name
    #[error("Task already registered: {name}")]
    DuplicateTask { name: String },

    /// Arguments could not be mapped onto the handler's parameters
    #[error("Invalid arguments for task {task}: {message}")]
    InvalidArguments { task: String, message: String },

    /// Client-side wait exceeded its deadline
    #[error("Operation timed out: {operation}")]
    Timeout { operation: String },

    /// Handler ran longer than its time limit
    #[error("Task {task_id} exceeded its time limit of {limit_ms}ms")]
    TimeLimitExceeded { task_id: String, limit_ms: u64 },

    /// A chord header member failed and the body was not fired
    #[error("Chord {chord_id} aborted: {message}")]
    ChordAborted { chord_id: String, message: String },

    /// Task retry limit exceeded
    #[error("Task retry limit exceeded: {task_id} (max retries: {max_retries})")]
    RetryLimitExceeded { task_id: String, max_retries: u32 },

    /// Message transport errors
    #[error("Broker operation failed: {operation}: {reason}")]
    Broker { operation: String, reason: String },

    /// Result store errors
    #[error("Backend operation failed: {operation}: {reason}")]
    Backend { operation: String, reason: String },

    /// Worker errors
    #[error("Worker error: {message}")]
    Worker { message: String },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// A failure recorded by another process that has no local variant
    #[error("Task failed ({kind:?}): {message}")]
    Remote { kind: ErrorKind, message: String },

    /// Generic errors for wrapping other error types
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TaskError {
    /// Create a handler error
    pub fn handler<S: Into<String>>(message: S) -> Self {
        Self::Handler {
            message: message.into(),
        }
    }

    /// Create an invalid arguments error
    pub fn invalid_arguments<S: Into<String>>(task: S, message: S) -> Self {
        Self::InvalidArguments {
            task: task.into(),
            message: message.into(),
        }
    }

    /// Create a broker operation error
    pub fn broker<S: Into<String>>(operation: S, reason: S) -> Self {
        Self::Broker {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Create a backend operation error
    pub fn backend<S: Into<String>>(operation: S, reason: S) -> Self {
        Self::Backend {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Create a worker error
    pub fn worker<S: Into<String>>(message: S) -> Self {
        Self::Worker {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout<S: Into<String>>(operation: S) -> Self {
        Self::Timeout {
            operation: operation.into(),
        }
    }

    /// Check if the error is recoverable (can be retried)
    pub fn is_recoverable(&self) -> bool {
        match self {
            TaskError::Redis(_) => true,
            TaskError::Handler { .. } => true,
            TaskError::Timeout { .. } => true,
            TaskError::TimeLimitExceeded { .. } => true,
            TaskError::Broker { .. } => true,
            TaskError::Backend { .. } => true,
            TaskError::Worker { .. } => true,
            TaskError::Io(_) => true,
            TaskError::Serialization(_) => false,
            TaskError::UnknownTask { .. } => false,
            TaskError::DuplicateTask { .. } => false,
            TaskError::InvalidArguments { .. } => false,
            TaskError::ChordAborted { .. } => false,
            TaskError::RetryLimitExceeded { .. } => false,
            TaskError::Config { .. } => false,
            TaskError::Remote { .. } => false,
            TaskError::Internal(_) => false,
        }
    }
}

/// Classification of a failure stored in the result backend
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Handler,
    UnknownTask,
    InvalidArguments,
    TimeLimitExceeded,
    ChordAborted,
    Other,
}

/// Serializable form of a task failure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorInfo {
    pub kind: ErrorKind,
    pub message: String,
    /// Task name, invocation id or chord id the failure refers to, when the kind needs one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    /// Time limit that was exceeded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit_ms: Option<u64>,
}

impl ErrorInfo {
    pub fn new<S: Into<String>>(kind: ErrorKind, message: S) -> Self {
        Self {
            kind,
            message: message.into(),
            subject: None,
            limit_ms: None,
        }
    }

    /// Rebuild the error a client should see when awaiting this failure
    pub fn into_error(self) -> TaskError {
        let subject = self.subject.unwrap_or_default();
        match self.kind {
            ErrorKind::Handler => TaskError::Handler {
                message: self.message,
            },
            ErrorKind::UnknownTask => TaskError::UnknownTask { name: subject },
            ErrorKind::InvalidArguments => TaskError::InvalidArguments {
                task: subject,
                message: self.message,
            },
            ErrorKind::ChordAborted => TaskError::ChordAborted {
                chord_id: subject,
                message: self.message,
            },
            ErrorKind::TimeLimitExceeded => TaskError::TimeLimitExceeded {
                task_id: subject,
                limit_ms: self.limit_ms.unwrap_or_default(),
            },
            kind => TaskError::Remote {
                kind,
                message: self.message,
            },
        }
    }
}

impl From<&TaskError> for ErrorInfo {
    fn from(error: &TaskError) -> Self {
        match error {
            TaskError::Handler { message } => ErrorInfo::new(ErrorKind::Handler, message.clone()),
            TaskError::UnknownTask { name } => ErrorInfo {
                kind: ErrorKind::UnknownTask,
                message: error.to_string(),
                subject: Some(name.clone()),
                limit_ms: None,
            },
            TaskError::InvalidArguments { task, message } => ErrorInfo {
                kind: ErrorKind::InvalidArguments,
                message: message.clone(),
                subject: Some(task.clone()),
                limit_ms: None,
            },
            TaskError::TimeLimitExceeded { task_id, limit_ms } => ErrorInfo {
                kind: ErrorKind::TimeLimitExceeded,
                message: error.to_string(),
                subject: Some(task_id.clone()),
                limit_ms: Some(*limit_ms),
            },
            TaskError::ChordAborted { chord_id, message } => ErrorInfo {
                kind: ErrorKind::ChordAborted,
                message: message.clone(),
                subject: Some(chord_id.clone()),
                limit_ms: None,
            },
            TaskError::Remote { kind, message } => ErrorInfo::new(*kind, message.clone()),
            other => ErrorInfo::new(ErrorKind::Other, other.to_string()),
        }
    }
}
