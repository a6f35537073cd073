//! # spindle - cooperative fiber runtime for Linux
//!
//! Write straight-line blocking-style I/O; run thousands of concurrent
//! tasks on a small worker pool.
//!
//! - **Fibers**: stackful coroutines with explicit resume/yield, ~128 KiB
//!   stacks, hand-written context switch (x86_64, aarch64)
//! - **Scheduler**: M:N FIFO dispatch over a fixed thread pool, optional
//!   caller participation
//! - **Reactor**: edge-triggered epoll with an eventfd wakeup and
//!   per-fd/direction waiter slots
//! - **Timers**: deadline-ordered callbacks with cancel/refresh/reset and
//!   clock-regression detection
//! - **Syscall layer**: `hook::{sleep, socket, connect, accept, read,
//!   write, recv, send, close, ...}` run legacy blocking patterns
//!   cooperatively
//!
//! ## Quick Start
//!
//! ```ignore
//! use spindle::{hook, IoManager, Task, ANY_THREAD, Dispatch};
//!
//! fn main() {
//!     let iom = IoManager::new(4, false, "app").expect("reactor");
//!
//!     iom.schedule_task(Task::call(|| {
//!         let fd = hook::socket(libc::AF_INET, libc::SOCK_STREAM, 0);
//!         // ... hook::connect / hook::send / hook::recv look blocking,
//!         // but only this fiber waits - the worker keeps running others.
//!         hook::close(fd);
//!     }, ANY_THREAD));
//!
//!     iom.stop();
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//!  ┌──────────────────────────────────────────────────┐
//!  │                application fibers                │
//!  │      hook::recv / hook::send / hook::sleep       │
//!  └──────────────────────────────────────────────────┘
//!                    │ EAGAIN: arm + park
//!                    ▼
//!  ┌──────────────────────────────────────────────────┐
//!  │   IoManager: epoll (ET) + eventfd + timers       │
//!  │   per-fd waiter slots, FdManager metadata        │
//!  └──────────────────────────────────────────────────┘
//!                    │ readiness / deadline
//!                    ▼
//!  ┌──────────────────────────────────────────────────┐
//!  │   Scheduler: FIFO queue over N worker threads    │
//!  │   each worker: dispatch loop + idle fiber        │
//!  └──────────────────────────────────────────────────┘
//! ```

pub use spindle_core::{FiberState, Semaphore, SpinLock};
pub use spindle_io::{fd_manager, hook, Event, FdCtx, FdManager, IoError, IoManager, IoResult};
pub use spindle_runtime::{
    current_dispatcher, yield_now, Dispatch, Fiber, Scheduler, Task, TaskPayload, Thread, Timer,
    TimerManager, ANY_THREAD,
};

/// Core modules, re-exported for embedders that need the full surface.
pub mod core {
    pub use spindle_core::*;
}
pub mod runtime {
    pub use spindle_runtime::*;
}
pub mod io {
    pub use spindle_io::*;
}
