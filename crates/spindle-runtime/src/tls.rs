//! Per-thread singletons
//!
//! Every OS thread that touches the runtime carries: the currently running
//! fiber, the thread-root fiber (the thread's original stack), the
//! scheduler-peer fiber (where scheduler-mode fibers return on yield), the
//! dispatcher driving this thread, a cached kernel tid, a thread name, and
//! the per-thread hook-enable flag consulted by the syscall layer.

use crate::fiber::Fiber;
use crate::scheduler::Dispatch;
use std::cell::{Cell, RefCell};
use std::sync::Arc;

thread_local! {
    /// Fiber currently owning this thread's machine context
    static CURRENT_FIBER: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };

    /// The fiber representing the thread's original stack
    static THREAD_ROOT: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };

    /// Where scheduler-mode fibers return on yield
    static SCHEDULER_PEER: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };

    /// Dispatcher whose worker loop runs on this thread
    static DISPATCHER: RefCell<Option<Arc<dyn Dispatch>>> = const { RefCell::new(None) };

    /// Whether the cooperative syscall layer is active on this thread
    static HOOK_ENABLED: Cell<bool> = const { Cell::new(false) };

    /// Cached kernel tid (gettid), -1 until first use
    static TID: Cell<libc::pid_t> = const { Cell::new(-1) };

    /// Thread name as installed by the Thread wrapper
    static THREAD_NAME: RefCell<Option<String>> = const { RefCell::new(None) };
}

#[inline]
pub fn current_fiber() -> Option<Arc<Fiber>> {
    CURRENT_FIBER.with(|c| c.borrow().clone())
}

#[inline]
pub fn set_current_fiber(f: Arc<Fiber>) {
    CURRENT_FIBER.with(|c| *c.borrow_mut() = Some(f));
}

#[inline]
pub fn thread_root() -> Option<Arc<Fiber>> {
    THREAD_ROOT.with(|c| c.borrow().clone())
}

#[inline]
pub fn set_thread_root(f: Arc<Fiber>) {
    THREAD_ROOT.with(|c| *c.borrow_mut() = Some(f));
}

#[inline]
pub fn scheduler_peer() -> Option<Arc<Fiber>> {
    SCHEDULER_PEER.with(|c| c.borrow().clone())
}

#[inline]
pub fn set_scheduler_peer(f: Arc<Fiber>) {
    SCHEDULER_PEER.with(|c| *c.borrow_mut() = Some(f));
}

#[inline]
pub fn current_dispatcher() -> Option<Arc<dyn Dispatch>> {
    DISPATCHER.with(|c| c.borrow().clone())
}

#[inline]
pub fn set_dispatcher(d: Arc<dyn Dispatch>) {
    DISPATCHER.with(|c| *c.borrow_mut() = Some(d));
}

#[inline]
pub fn clear_dispatcher() {
    DISPATCHER.with(|c| *c.borrow_mut() = None);
}

/// Whether the syscall layer redirects blocking calls on this thread
#[inline]
pub fn hook_enabled() -> bool {
    HOOK_ENABLED.with(|c| c.get())
}

/// Toggle syscall redirection for this thread
#[inline]
pub fn set_hook_enabled(on: bool) {
    HOOK_ENABLED.with(|c| c.set(on));
}

/// Kernel thread id of the calling thread (cached after the first call)
#[inline]
pub fn current_tid() -> libc::pid_t {
    TID.with(|c| {
        let tid = c.get();
        if tid != -1 {
            return tid;
        }
        let tid = unsafe { libc::syscall(libc::SYS_gettid) as libc::pid_t };
        c.set(tid);
        tid
    })
}

/// Name of the calling thread, "main" if never set
pub fn current_name() -> String {
    THREAD_NAME.with(|c| c.borrow().clone().unwrap_or_else(|| "main".to_string()))
}

pub fn set_current_name(name: &str) {
    THREAD_NAME.with(|c| *c.borrow_mut() = Some(name.to_string()));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tid_stable() {
        let a = current_tid();
        let b = current_tid();
        assert!(a > 0);
        assert_eq!(a, b);
    }

    #[test]
    fn test_name_default() {
        std::thread::spawn(|| {
            assert_eq!(current_name(), "main");
            set_current_name("renamed");
            assert_eq!(current_name(), "renamed");
        })
        .join()
        .unwrap();
    }
}
