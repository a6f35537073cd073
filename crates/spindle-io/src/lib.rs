//! # spindle-io
//!
//! The I/O side of the spindle runtime:
//!
//! - `reactor` - `IoManager`, the epoll + eventfd reactor extending the
//!   scheduler with per-fd waiter slots and integrated timers
//! - `fd_manager` - process-wide per-fd metadata registry
//! - `hook` - cooperative replacements for the blocking POSIX calls

pub mod error;
pub mod fd_manager;
pub mod hook;
pub mod reactor;

pub use error::{IoError, IoResult};
pub use fd_manager::{fd_manager, FdCtx, FdManager, TimeoutKind, NO_TIMEOUT};
pub use reactor::{Event, IoManager};

#[inline]
pub(crate) fn errno() -> i32 {
    unsafe { *libc::__errno_location() }
}

#[inline]
pub(crate) fn set_errno(v: i32) {
    unsafe { *libc::__errno_location() = v }
}
