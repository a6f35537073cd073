//! FIFO fiber scheduler
//!
//! A fixed pool of worker threads drains a single mutex-protected task
//! queue. A task is either a pre-built fiber or a bare callable (wrapped in
//! a fresh fiber at dispatch time), optionally pinned to one worker by
//! kernel tid. Each worker parks in an *idle* fiber when the queue is
//! empty; the reactor overrides that fiber to block in `epoll_wait`.
//!
//! With `use_caller` the constructing thread is one of the workers: no OS
//! thread is spawned for it, and `stop()` resumes a dedicated scheduler
//! fiber on the caller which runs the dispatch loop until everything is
//! drained.
//!
//! The overridable surface (`tickle`, `idle`, `stopping`,
//! `on_thread_start`) lives on the [`Dispatch`] trait so the reactor can
//! extend the scheduler the way a subclass would.

use crate::config;
use crate::fiber::{Fiber, FiberFn};
use crate::thread::Thread;
use crate::tls;
use spindle_core::{sp_debug, sp_warn, FiberState, SchedError, SchedResult, SpinLock};
use std::any::Any;
use std::collections::VecDeque;
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Any worker may run the task.
pub const ANY_THREAD: libc::pid_t = -1;

/// What a task executes.
pub enum TaskPayload {
    /// Resume this fiber (skipped if it already terminated)
    Fiber(Arc<Fiber>),
    /// Run this callable inside a fresh scheduler fiber
    Call(FiberFn),
}

impl From<Arc<Fiber>> for TaskPayload {
    fn from(f: Arc<Fiber>) -> Self {
        TaskPayload::Fiber(f)
    }
}

impl From<FiberFn> for TaskPayload {
    fn from(f: FiberFn) -> Self {
        TaskPayload::Call(f)
    }
}

/// One unit of queued work.
pub struct Task {
    payload: TaskPayload,
    /// Kernel tid this task is pinned to, [`ANY_THREAD`] for none
    thread: libc::pid_t,
}

impl Task {
    pub fn new(payload: TaskPayload, thread: libc::pid_t) -> Task {
        Task { payload, thread }
    }

    pub fn fiber(f: Arc<Fiber>, thread: libc::pid_t) -> Task {
        Task::new(TaskPayload::Fiber(f), thread)
    }

    pub fn call<F>(f: F, thread: libc::pid_t) -> Task
    where
        F: FnOnce() + Send + 'static,
    {
        Task::new(TaskPayload::Call(Box::new(f)), thread)
    }
}

/// Shared scheduler state. Embed it and implement [`Dispatch`] to override
/// the idle strategy; the plain `Scheduler` is itself a complete
/// implementation whose idle fiber naps in a sleep/yield loop.
pub struct Scheduler {
    name: String,
    queue: SpinLock<VecDeque<Task>>,
    threads: SpinLock<Vec<Thread>>,
    /// OS threads to spawn (excludes the caller when `use_caller`)
    thread_count: usize,
    active_threads: AtomicUsize,
    idle_threads: AtomicUsize,
    stop_requested: AtomicBool,
    use_caller: bool,
    /// Kernel tid of the constructing thread, -1 unless `use_caller`
    root_tid: libc::pid_t,
    /// Dispatch-loop fiber resumed on the caller by `stop()`
    root_fiber: SpinLock<Option<Arc<Fiber>>>,
}

impl Scheduler {
    /// `threads` counts the caller when `use_caller` is set, so it must be
    /// at least 1.
    pub fn new(threads: usize, use_caller: bool, name: &str) -> Scheduler {
        assert!(threads > 0, "scheduler needs at least one thread");
        let (thread_count, root_tid) = if use_caller {
            (threads - 1, tls::current_tid())
        } else {
            (threads, -1)
        };
        Scheduler {
            name: name.to_string(),
            queue: SpinLock::new(VecDeque::new()),
            threads: SpinLock::new(Vec::new()),
            thread_count,
            active_threads: AtomicUsize::new(0),
            idle_threads: AtomicUsize::new(0),
            stop_requested: AtomicBool::new(false),
            use_caller,
            root_tid,
            root_fiber: SpinLock::new(None),
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn idle_threads(&self) -> usize {
        self.idle_threads.load(Ordering::Acquire)
    }

    #[inline]
    pub fn active_threads(&self) -> usize {
        self.active_threads.load(Ordering::Acquire)
    }

    /// True once `stop()` has been requested (tasks may still be draining).
    #[inline]
    pub fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::Acquire)
    }

    /// Enqueue and report whether the queue was empty, i.e. whether every
    /// worker may be parked and a tickle is due.
    fn enqueue(&self, task: Task) -> bool {
        let mut q = self.queue.lock();
        let was_empty = q.is_empty();
        q.push_back(task);
        was_empty
    }

    /// Whether the worker with this tid could take a task right now.
    pub fn has_runnable_tasks(&self, tid: libc::pid_t) -> bool {
        self.queue
            .lock()
            .iter()
            .any(|t| t.thread == ANY_THREAD || t.thread == tid)
    }

    /// Base stop condition: stop requested, queue drained, nobody active.
    /// Extensions AND their own conditions on top (the reactor adds "no
    /// armed waiters, no pending timers").
    pub fn base_stopping(&self) -> bool {
        self.stop_requested.load(Ordering::Acquire)
            && self.queue.lock().is_empty()
            && self.active_threads.load(Ordering::Acquire) == 0
    }
}

/// The scheduler's virtual surface. The reactor implements this trait to
/// replace the idle strategy with an `epoll_wait` loop, hook worker-thread
/// startup, and extend the stop condition.
pub trait Dispatch: Send + Sync + 'static {
    /// The embedded scheduler state.
    fn scheduler(&self) -> &Scheduler;

    /// Type-erased self, for downcasting the per-thread dispatcher back to
    /// its concrete type.
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;

    /// Wake one parked worker. The base scheduler's idle fiber polls, so
    /// there is nothing to do.
    fn tickle(&self) {}

    /// Body of the per-worker idle fiber. Runs until [`Dispatch::stopping`]
    /// holds, yielding back to the worker loop between checks.
    fn idle(&self) {
        while !self.stopping() {
            std::thread::sleep(Duration::from_millis(config::idle_sleep_ms()));
            Fiber::current().yield_now();
        }
    }

    /// Whether the dispatch loops may exit.
    fn stopping(&self) -> bool {
        self.scheduler().base_stopping()
    }

    /// Runs first on every worker thread (and on the caller's dispatch
    /// loop). The reactor enables the syscall layer here.
    fn on_thread_start(&self) {}

    /// Enqueue a task, waking a worker if the queue was empty.
    fn schedule_task(&self, task: Task) {
        let need_tickle = self.scheduler().enqueue(task);
        if need_tickle {
            self.tickle();
        }
    }

    /// Convenience form of [`Dispatch::schedule_task`].
    fn schedule<P>(&self, payload: P, thread: libc::pid_t)
    where
        P: Into<TaskPayload>,
        Self: Sized,
    {
        self.schedule_task(Task::new(payload.into(), thread));
    }

    /// Spawn the worker pool. With `use_caller`, also install this
    /// dispatcher and its scheduler fiber on the calling thread.
    fn start(self: &Arc<Self>) -> SchedResult<()>
    where
        Self: Sized,
    {
        let sched = self.scheduler();
        if sched.stop_requested() {
            sp_warn!("{}: start() after stop()", sched.name());
            return Err(SchedError::Stopped);
        }
        if !sched.threads.lock().is_empty() {
            return Err(SchedError::AlreadyStarted);
        }

        let mut threads = Vec::with_capacity(sched.thread_count);
        for i in 0..sched.thread_count {
            let d: Arc<dyn Dispatch> = self.clone();
            let t = Thread::new(
                move || run_worker(d),
                &format!("{}_{}", sched.name(), i),
            )?;
            threads.push(t);
        }
        *sched.threads.lock() = threads;

        if sched.use_caller {
            // The caller becomes a worker: its dispatch loop lives in a
            // dedicated fiber that stop() resumes once draining starts.
            let d: Arc<dyn Dispatch> = self.clone();
            let weak = Arc::downgrade(&d);
            let sched_fiber = Fiber::new(
                move || {
                    if let Some(d) = weak.upgrade() {
                        run_worker(d);
                    }
                },
                0,
                false,
            );
            Fiber::current(); // materialize the caller's thread root first
            Fiber::set_scheduler_peer(&sched_fiber);
            *sched.root_fiber.lock() = Some(sched_fiber);
            tls::set_dispatcher(d);
        }
        sp_debug!(
            "{}: started ({} worker threads, use_caller={})",
            sched.name(),
            sched.thread_count,
            sched.use_caller
        );
        Ok(())
    }

    /// Request shutdown, drain the queue and join every worker.
    ///
    /// With `use_caller` this must run on the constructing thread, which
    /// executes its own dispatch loop here until the queue is empty.
    fn stop(self: &Arc<Self>)
    where
        Self: Sized,
    {
        if self.stopping() {
            return;
        }
        let sched = self.scheduler();
        sched.stop_requested.store(true, Ordering::Release);

        if sched.use_caller {
            assert_eq!(
                tls::current_tid(),
                sched.root_tid,
                "{}: stop() must run on the constructing thread",
                sched.name()
            );
        }

        for _ in 0..sched.thread_count {
            self.tickle();
        }
        let root_fiber = sched.root_fiber.lock().clone();
        if root_fiber.is_some() {
            self.tickle();
        }
        if let Some(f) = root_fiber {
            f.resume();
            sp_debug!("{}: caller dispatch loop drained", sched.name());
        }

        let threads = mem::take(&mut *sched.threads.lock());
        for mut t in threads {
            t.join();
        }

        if sched.use_caller {
            // Mirror of the install in start(): later schedulers on this
            // thread get a clean slate.
            if let Some(root) = tls::thread_root() {
                tls::set_scheduler_peer(root);
            }
            tls::clear_dispatcher();
        }
        sp_debug!("{}: stopped", sched.name());
    }
}

impl Dispatch for Scheduler {
    fn scheduler(&self) -> &Scheduler {
        self
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// The per-thread dispatcher, if this thread belongs to a running
/// scheduler.
pub fn current_dispatcher() -> Option<Arc<dyn Dispatch>> {
    tls::current_dispatcher()
}

/// The dispatch loop: runs on every worker thread and, under `use_caller`,
/// inside the scheduler fiber on the constructing thread.
pub(crate) fn run_worker(d: Arc<dyn Dispatch>) {
    let tid = tls::current_tid();
    d.on_thread_start();
    tls::set_dispatcher(d.clone());
    Fiber::current(); // thread root for this worker

    let idle_d = d.clone();
    let idle_fiber = Fiber::new(move || idle_d.idle(), 0, true);
    sp_debug!("{}: dispatch loop on tid {}", d.scheduler().name(), tid);

    loop {
        let sched = d.scheduler();
        let mut taken: Option<Task> = None;
        let mut tickle_me = false;
        {
            let mut q = sched.queue.lock();
            let mut i = 0;
            while i < q.len() {
                // Pinned to another worker: leave it, but remember that
                // somebody else has work waiting.
                if q[i].thread != ANY_THREAD && q[i].thread != tid {
                    i += 1;
                    tickle_me = true;
                    continue;
                }
                taken = q.remove(i);
                sched.active_threads.fetch_add(1, Ordering::AcqRel);
                break;
            }
            if taken.is_some() {
                tickle_me = tickle_me || i < q.len();
            }
        }
        if tickle_me {
            d.tickle();
        }

        match taken {
            Some(task) => {
                let fiber = match task.payload {
                    TaskPayload::Fiber(f) => f,
                    TaskPayload::Call(cb) => Fiber::with_boxed(cb, 0, true),
                };
                if fiber.state() != FiberState::Term {
                    let (state, parked) = fiber.resume_outcome();
                    // A cooperative yield goes back on the queue; a fiber
                    // parked by suspend() waits for its external wakeup.
                    if state == FiberState::Ready && !parked {
                        d.schedule_task(Task::fiber(fiber, ANY_THREAD));
                    }
                }
                sched.active_threads.fetch_sub(1, Ordering::AcqRel);
            }
            None => {
                // The idle fiber terminating is the worker's exit signal.
                if idle_fiber.state() == FiberState::Term {
                    sp_debug!("{}: dispatch loop on tid {} exits", sched.name(), tid);
                    break;
                }
                sched.idle_threads.fetch_add(1, Ordering::AcqRel);
                idle_fiber.resume();
                sched.idle_threads.fetch_sub(1, Ordering::AcqRel);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    #[test]
    fn test_schedule_twenty_callables_with_caller() {
        let sched = Arc::new(Scheduler::new(3, true, "sched-test"));
        sched.start().unwrap();

        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        for _ in 0..20 {
            let first = Arc::clone(&first);
            let second = Arc::clone(&second);
            sched.schedule_task(Task::call(
                move || {
                    first.fetch_add(1, Ordering::SeqCst);
                    Fiber::current().yield_now();
                    second.fetch_add(1, Ordering::SeqCst);
                },
                ANY_THREAD,
            ));
        }

        let t0 = Instant::now();
        sched.stop();
        assert!(t0.elapsed() < Duration::from_secs(1));

        assert_eq!(first.load(Ordering::SeqCst), 20);
        assert_eq!(second.load(Ordering::SeqCst), 20);
        assert_eq!(sched.active_threads(), 0);
    }

    #[test]
    fn test_scheduler_without_caller() {
        let sched = Arc::new(Scheduler::new(2, false, "pool-test"));
        sched.start().unwrap();

        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..50 {
            let hits = Arc::clone(&hits);
            sched.schedule_task(Task::call(
                move || {
                    hits.fetch_add(1, Ordering::SeqCst);
                },
                ANY_THREAD,
            ));
        }
        sched.stop();
        assert_eq!(hits.load(Ordering::SeqCst), 50);
    }

    #[test]
    fn test_prebuilt_fiber_task_and_yield_resume() {
        let sched = Arc::new(Scheduler::new(2, false, "fiber-task"));
        sched.start().unwrap();

        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        let fiber = Fiber::new(
            move || {
                h.fetch_add(1, Ordering::SeqCst);
            },
            0,
            true,
        );
        sched.schedule_task(Task::fiber(fiber.clone(), ANY_THREAD));
        sched.stop();

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(fiber.state(), FiberState::Term);

        // Scheduling a TERM fiber again is a no-op at dispatch.
        let sched2 = Arc::new(Scheduler::new(1, false, "fiber-task2"));
        sched2.start().unwrap();
        sched2.schedule_task(Task::fiber(fiber, ANY_THREAD));
        sched2.stop();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_tasks_schedule_more_tasks() {
        let sched = Arc::new(Scheduler::new(2, false, "nested"));
        sched.start().unwrap();

        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let hits = Arc::clone(&hits);
            sched.schedule_task(Task::call(
                move || {
                    let inner_hits = Arc::clone(&hits);
                    let d = current_dispatcher().expect("worker has a dispatcher");
                    d.schedule_task(Task::call(
                        move || {
                            inner_hits.fetch_add(1, Ordering::SeqCst);
                        },
                        ANY_THREAD,
                    ));
                },
                ANY_THREAD,
            ));
        }
        sched.stop();
        assert_eq!(hits.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn test_thread_affinity() {
        let sched = Arc::new(Scheduler::new(2, false, "pinned"));
        sched.start().unwrap();

        let target = sched.scheduler().threads.lock()[0].tid();
        let seen = Arc::new(SpinLock::new(Vec::new()));
        for _ in 0..8 {
            let seen = Arc::clone(&seen);
            sched.schedule_task(Task::call(
                move || {
                    seen.lock().push(tls::current_tid());
                },
                target,
            ));
        }
        sched.stop();

        let seen = seen.lock();
        assert_eq!(seen.len(), 8);
        assert!(seen.iter().all(|&tid| tid == target));
    }
}
