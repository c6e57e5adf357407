//! Error types for the scheduler.
//!
//! Errors are explicit and typed. Argument and state errors are returned
//! synchronously from the call that caused them; execution errors surface
//! through [`TaskFuture::get`](crate::future::TaskFuture::get) for
//! future-bearing submissions, or are logged on the worker thread for plain
//! submissions.

use core::fmt;

/// The kind of error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// A construction or setter parameter was out of range.
    InvalidConfiguration,
    /// The scheduler has been shut down and no longer accepts work.
    Shutdown,
    /// A task was handed to a worker that has already been killed.
    WorkerKilled,
    /// A task was handed to a worker that already holds one.
    WorkerOccupied,
    /// The task was cancelled before it started.
    Cancelled,
    /// The OS refused to spawn a scheduler thread.
    ThreadSpawnFailed,
    /// The task panicked while executing.
    ExecutionFailed,
    /// The wait for a task result elapsed before completion.
    ResultTimeout,
}

impl ErrorKind {
    fn as_str(self) -> &'static str {
        match self {
            Self::InvalidConfiguration => "invalid configuration",
            Self::Shutdown => "scheduler shut down",
            Self::WorkerKilled => "worker has been killed",
            Self::WorkerOccupied => "worker already has a task",
            Self::Cancelled => "task cancelled",
            Self::ThreadSpawnFailed => "failed to spawn thread",
            Self::ExecutionFailed => "task execution failed",
            Self::ResultTimeout => "timed out waiting for task result",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error type used throughout the crate.
#[derive(Debug, Clone)]
pub struct Error {
    kind: ErrorKind,
    message: Option<String>,
}

impl Error {
    /// Creates an error of the given kind.
    #[must_use]
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            message: None,
        }
    }

    /// Creates an error with additional context.
    #[must_use]
    pub fn with_message(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: Some(message.into()),
        }
    }

    /// Returns the kind of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Converts a caught panic payload into an execution error, preserving
    /// the panic message when one is available.
    pub(crate) fn from_panic(payload: &(dyn std::any::Any + Send)) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "task panicked".to_string()
        };
        Self::with_message(ErrorKind::ExecutionFailed, message)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.message {
            Some(message) => write!(f, "{}: {message}", self.kind),
            None => write!(f, "{}", self.kind),
        }
    }
}

impl std::error::Error for Error {}
