//! # spindle-runtime
//!
//! The execution core of the spindle fiber runtime:
//!
//! - Stackful fibers with hand-written context switching (x86_64, aarch64)
//! - Per-thread singletons (current fiber, thread root, scheduler peer)
//! - A named `Thread` wrapper with synchronized startup
//! - A deadline-ordered `TimerManager` with clock-regression detection
//! - The FIFO `Scheduler` and its `Dispatch` trait, which the epoll reactor
//!   in `spindle-io` extends

pub mod arch;
pub mod config;
pub mod fiber;
pub mod scheduler;
pub mod thread;
pub mod timer;
pub mod tls;

// Re-exports
pub use fiber::{Fiber, FiberFn};
pub use scheduler::{current_dispatcher, Dispatch, Scheduler, Task, TaskPayload, ANY_THREAD};
pub use thread::Thread;
pub use timer::{Timer, TimerCallback, TimerManager, TimerWaker};

/// Cooperatively yield the current fiber, if this thread is running one.
///
/// On the thread root (or outside the runtime entirely) this degrades to
/// an OS-level yield.
pub fn yield_now() {
    if let (Some(f), Some(root)) = (tls::current_fiber(), tls::thread_root()) {
        if f.id() != root.id() {
            f.yield_now();
            return;
        }
    }
    std::thread::yield_now();
}
