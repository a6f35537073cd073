//! Stackful fibers
//!
//! A fiber is a coroutine with its own heap-allocated stack and explicit
//! resume/yield. Each OS thread lazily materializes a *thread-root* fiber
//! standing for its original stack; every other fiber switches against a
//! designated peer:
//!
//! - `run_in_scheduler = false`: resume/yield swap with the thread root.
//! - `run_in_scheduler = true`: resume/yield swap with the scheduler-peer
//!   fiber, so the scheduler can run its dispatch loop as a fiber and get
//!   control back whenever a task yields.
//!
//! State machine: READY -> RUNNING on resume, RUNNING -> READY on yield,
//! RUNNING -> TERM when the entry returns. Exactly one fiber per thread is
//! RUNNING at any instant and that fiber owns the thread's machine context.

use crate::arch::{self, Context};
use crate::config;
use crate::tls;
use spindle_core::id::{next_fiber_id, release_fiber_id};
use spindle_core::{sp_trace, FiberState, SpinLock};
use std::alloc::{self, Layout};
use std::cell::UnsafeCell;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

/// Entry callable of a fiber
pub type FiberFn = Box<dyn FnOnce() + Send>;

/// Heap stack of a child fiber. 16-byte aligned; freed on drop.
struct Stack {
    base: NonNull<u8>,
    layout: Layout,
}

impl Stack {
    fn alloc(size: usize) -> Stack {
        let layout = Layout::from_size_align(size, 16).expect("bad stack layout");
        let base = unsafe { alloc::alloc(layout) };
        let Some(base) = NonNull::new(base) else {
            // Out of stacks is out of program.
            alloc::handle_alloc_error(layout);
        };
        Stack { base, layout }
    }

    #[inline]
    fn top(&self) -> *mut u8 {
        unsafe { self.base.as_ptr().add(self.layout.size()) }
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        unsafe { alloc::dealloc(self.base.as_ptr(), self.layout) };
    }
}

/// A stackful coroutine, shared as `Arc<Fiber>`.
pub struct Fiber {
    id: u64,
    state: AtomicU8,
    /// Saved machine context while suspended.
    ctx: UnsafeCell<Context>,
    /// True whenever `ctx` holds a complete suspended image. A resume must
    /// win this flag before loading the context: a waiter can be scheduled
    /// from another thread the instant its wakeup is armed, and this gate
    /// is what makes that resume wait out the context save still in flight
    /// on the yielding thread.
    saved: AtomicBool,
    /// Set by `suspend()`: the scheduler must not re-queue this fiber on
    /// yield, something external (reactor, timer) will.
    parked: AtomicBool,
    /// None for the thread-root fiber, which runs on the OS stack.
    stack: Option<Stack>,
    /// Cleared by the trampoline once it has run, breaking ownership cycles
    /// with captured state.
    entry: SpinLock<Option<FiberFn>>,
    run_in_scheduler: bool,
}

// Safety: `ctx` and the stack are only touched by the thread performing a
// resume/yield on this fiber, and the READY->RUNNING CAS in resume() admits
// exactly one such thread at a time.
unsafe impl Send for Fiber {}
unsafe impl Sync for Fiber {}

impl Fiber {
    /// Create a child fiber in state READY.
    ///
    /// `stack_size == 0` selects the configured default (128 KiB unless
    /// `SPINDLE_STACK_SIZE` overrides it).
    pub fn new<F>(f: F, stack_size: usize, run_in_scheduler: bool) -> Arc<Fiber>
    where
        F: FnOnce() + Send + 'static,
    {
        Self::with_boxed(Box::new(f), stack_size, run_in_scheduler)
    }

    /// Boxed-callable form of [`Fiber::new`]; the scheduler uses this for
    /// queued callables.
    pub fn with_boxed(f: FiberFn, stack_size: usize, run_in_scheduler: bool) -> Arc<Fiber> {
        let size = if stack_size == 0 {
            config::stack_size()
        } else {
            stack_size
        };
        let stack = Stack::alloc(size);
        let mut ctx = Context::new();
        unsafe { arch::init_context(&mut ctx, stack.top(), fiber_entry as usize) };

        let fiber = Arc::new(Fiber {
            id: next_fiber_id(),
            state: AtomicU8::new(FiberState::Ready as u8),
            ctx: UnsafeCell::new(ctx),
            saved: AtomicBool::new(true),
            parked: AtomicBool::new(false),
            stack: Some(stack),
            entry: SpinLock::new(Some(f)),
            run_in_scheduler,
        });
        sp_trace!("fiber {}: created ({} byte stack)", fiber.id, size);
        fiber
    }

    /// The thread-root fiber: no stack of its own, born RUNNING.
    fn new_thread_root() -> Arc<Fiber> {
        Arc::new(Fiber {
            id: next_fiber_id(),
            state: AtomicU8::new(FiberState::Running as u8),
            ctx: UnsafeCell::new(Context::new()),
            saved: AtomicBool::new(false),
            parked: AtomicBool::new(false),
            stack: None,
            entry: SpinLock::new(None),
            run_in_scheduler: false,
        })
    }

    /// The fiber currently running on this thread.
    ///
    /// On first use per thread this materializes the thread-root fiber and
    /// installs it as current, thread root and scheduler peer.
    pub fn current() -> Arc<Fiber> {
        if let Some(f) = tls::current_fiber() {
            return f;
        }
        let root = Fiber::new_thread_root();
        tls::set_current_fiber(root.clone());
        tls::set_thread_root(root.clone());
        tls::set_scheduler_peer(root.clone());
        sp_trace!("fiber {}: thread root materialized", root.id);
        root
    }

    /// Id of the current fiber, None if this thread has never run one.
    pub fn current_id() -> Option<u64> {
        tls::current_fiber().map(|f| f.id)
    }

    /// Install the fiber that scheduler-mode fibers return to on yield.
    pub fn set_scheduler_peer(f: &Arc<Fiber>) {
        tls::set_scheduler_peer(f.clone());
    }

    /// Fibers currently alive in the process (thread roots included).
    pub fn total() -> u64 {
        spindle_core::id::alive_fibers()
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn state(&self) -> FiberState {
        FiberState::from(self.state.load(Ordering::Acquire))
    }

    #[inline]
    fn set_state(&self, s: FiberState) {
        self.state.store(s as u8, Ordering::Release);
    }

    #[inline]
    fn ctx_ptr(&self) -> *mut Context {
        self.ctx.get()
    }

    /// Switch from the designated peer into this fiber.
    ///
    /// Requires state READY; the transition to RUNNING is a CAS so that two
    /// workers handed the same fiber fault loudly instead of corrupting the
    /// context. Returns when the fiber yields or terminates.
    pub fn resume(self: &Arc<Self>) {
        let _ = self.resume_outcome();
    }

    /// [`Fiber::resume`] that also reports how the fiber left the CPU:
    /// its state afterwards and whether it parked itself via `suspend()`.
    /// Both are read before the context image is republished, so the answer
    /// cannot be outdated by a concurrent wakeup.
    pub(crate) fn resume_outcome(self: &Arc<Self>) -> (FiberState, bool) {
        // Win the context image before touching it. A waiter woken from
        // another thread may reach this point while the yielding thread is
        // still in the middle of its context save.
        while self
            .saved
            .compare_exchange(true, false, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            core::hint::spin_loop();
        }

        let flipped = self.state.compare_exchange(
            FiberState::Ready as u8,
            FiberState::Running as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        assert!(
            flipped.is_ok(),
            "resume() on fiber {} in state {:?}",
            self.id,
            self.state()
        );

        // Materializes the thread root on first use, so a bare fiber can be
        // resumed from any thread.
        Fiber::current();
        let peer = if self.run_in_scheduler {
            tls::scheduler_peer().expect("resume(): no scheduler peer on this thread")
        } else {
            tls::thread_root().expect("resume(): no thread root")
        };

        tls::set_current_fiber(self.clone());
        unsafe { arch::switch_context(peer.ctx_ptr(), self.ctx_ptr()) };
        // The fiber is suspended again. Snapshot its exit before the image
        // is republished: nobody else can resume it until then.
        let state = self.state();
        let parked = self.parked.swap(false, Ordering::AcqRel);
        self.saved.store(true, Ordering::Release);
        (state, parked)
    }

    /// Give up the CPU: restore the peer as current and switch to it.
    ///
    /// Must be called by the running fiber itself. RUNNING downgrades to
    /// READY; a TERM fiber stays TERM and is never switched to again.
    pub fn yield_now(&self) {
        let state = self.state();
        assert!(
            state == FiberState::Running || state == FiberState::Term,
            "yield on fiber {} in state {:?}",
            self.id,
            state
        );
        if state != FiberState::Term {
            self.set_state(FiberState::Ready);
        }

        let peer = if self.run_in_scheduler {
            tls::scheduler_peer().expect("yield: no scheduler peer on this thread")
        } else {
            tls::thread_root().expect("yield: no thread root on this thread")
        };
        tls::set_current_fiber(peer.clone());
        unsafe { arch::switch_context(self.ctx_ptr(), peer.ctx_ptr()) };
        // Back here on the next resume().
    }

    /// Yield without being re-queued by the scheduler.
    ///
    /// The fiber stays suspended until something external (a reactor
    /// waiter, a timer callback) schedules it again. This is the suspension
    /// primitive of the syscall layer.
    pub fn suspend(&self) {
        self.parked.store(true, Ordering::Release);
        self.yield_now();
    }

    /// Re-arm a terminated fiber with a new entry, reusing its stack.
    #[cfg(feature = "fiber-reset")]
    pub fn reset<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        assert_eq!(
            self.state(),
            FiberState::Term,
            "reset() on fiber {} that has not terminated",
            self.id
        );
        let stack = self.stack.as_ref().expect("reset() on the thread-root fiber");
        *self.entry.lock() = Some(Box::new(f));
        unsafe { arch::init_context(self.ctx_ptr(), stack.top(), fiber_entry as usize) };
        self.parked.store(false, Ordering::Release);
        self.saved.store(true, Ordering::Release);
        self.set_state(FiberState::Ready);
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        sp_trace!("fiber {}: dropped", self.id);
        release_fiber_id();
    }
}

/// Entry point of every child fiber.
///
/// Holds a strong handle while the callable runs so the fiber cannot be
/// destroyed mid-execution, clears the callable to break ownership cycles,
/// marks TERM and yields for the last time. The final yield never returns:
/// the peer takes over and a TERM fiber is not resumable.
extern "C" fn fiber_entry() {
    let curr = Fiber::current();
    let entry = curr.entry.lock().take();
    if let Some(entry) = entry {
        entry();
    }
    curr.set_state(FiberState::Term);

    let raw = Arc::as_ptr(&curr);
    drop(curr);
    // Safety: whoever resumed this fiber still holds a strong handle across
    // its resume() call, so the allocation outlives this final switch-out.
    unsafe { (*raw).yield_now() };
    unreachable!("terminated fiber resumed");
}
