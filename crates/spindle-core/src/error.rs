//! Error types for the spindle runtime

use core::fmt;

/// Result type for scheduler operations
pub type SchedResult<T> = Result<T, SchedError>;

/// Errors that can occur in scheduler operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedError {
    /// start() called twice
    AlreadyStarted,

    /// start() after stop()
    Stopped,

    /// OS-level failure, carries the errno
    Os(i32),
}

impl fmt::Display for SchedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedError::AlreadyStarted => write!(f, "scheduler already started"),
            SchedError::Stopped => write!(f, "scheduler is stopped"),
            SchedError::Os(errno) => write!(f, "os error: errno {}", errno),
        }
    }
}

impl std::error::Error for SchedError {}
