//! Reactor error type

use core::fmt;

pub type IoResult<T> = Result<T, IoError>;

/// Errors surfaced by the reactor API. Syscall-layer entry points report
/// through errno instead, like the calls they stand in for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IoError {
    /// The direction is already armed on this fd
    EventExists,

    /// OS-level failure, carries the errno
    Os(i32),
}

impl fmt::Display for IoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IoError::EventExists => write!(f, "event already registered for this fd"),
            IoError::Os(errno) => write!(f, "os error: errno {}", errno),
        }
    }
}

impl std::error::Error for IoError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(format!("{}", IoError::Os(9)), "os error: errno 9");
    }
}
