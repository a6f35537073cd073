//! Fiber state type

/// State of a fiber
///
/// A fiber is created `Ready`, becomes `Running` when resumed, goes back to
/// `Ready` when it yields, and ends up `Term` when its entry returns.
/// The thread-root fiber is born `Running` since it represents the stack
/// that is already executing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FiberState {
    /// Resumable: freshly created, reset, or yielded
    Ready = 0,

    /// Currently owns the machine context of its thread
    Running = 1,

    /// Entry returned; only `reset` can revive it
    Term = 2,
}

impl FiberState {
    /// Check if this state allows the fiber to be resumed
    #[inline]
    pub const fn is_resumable(&self) -> bool {
        matches!(self, FiberState::Ready)
    }

    /// Check if the fiber has finished execution
    #[inline]
    pub const fn is_terminated(&self) -> bool {
        matches!(self, FiberState::Term)
    }
}

impl From<u8> for FiberState {
    fn from(v: u8) -> Self {
        match v {
            0 => FiberState::Ready,
            1 => FiberState::Running,
            _ => FiberState::Term,
        }
    }
}

impl From<FiberState> for u8 {
    fn from(state: FiberState) -> u8 {
        state as u8
    }
}
