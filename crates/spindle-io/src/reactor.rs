//! The epoll reactor
//!
//! `IoManager` extends the scheduler: it keeps an epoll instance, an
//! eventfd used to wake workers parked in `epoll_wait` ("tickle"), and one
//! waiter slot per fd and direction. Workers run the overridden idle fiber,
//! which blocks in `epoll_wait` for at most `min(next timer, 5 s)`, drains
//! expired timers into the task queue, fires ready waiters and yields back
//! to the dispatch loop.
//!
//! Everything is edge-triggered: the reactor stores exactly one waiter per
//! direction and re-arms interest explicitly on every registration, so an
//! edge can never be lost to a waiter that does not exist, and level-ready
//! fds nobody waits on cost nothing.

use crate::error::{IoError, IoResult};
use crate::hook;
use spindle_core::{sp_debug, sp_error, SpinLock};
use spindle_runtime::scheduler::{current_dispatcher, Dispatch, Scheduler, Task, TaskPayload, ANY_THREAD};
use spindle_runtime::thread;
use spindle_runtime::timer::{Timer, TimerManager, TimerWaker};
use spindle_runtime::{Fiber, FiberFn};
use std::any::Any;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, Weak};

const EV_READ: u32 = libc::EPOLLIN as u32;
const EV_WRITE: u32 = libc::EPOLLOUT as u32;
const EV_ET: u32 = libc::EPOLLET as u32;
const EV_ERR_HUP: u32 = (libc::EPOLLERR | libc::EPOLLHUP) as u32;

/// An I/O direction a fiber can wait on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Read,
    Write,
}

impl Event {
    #[inline]
    fn bits(self) -> u32 {
        match self {
            Event::Read => EV_READ,
            Event::Write => EV_WRITE,
        }
    }
}

/// Who gets scheduled when a direction fires: exactly one of fiber or
/// callable, onto the scheduler recorded at registration time (which may
/// belong to a different reactor instance).
#[derive(Default)]
struct Waiter {
    scheduler: Option<Arc<dyn Dispatch>>,
    fiber: Option<Arc<Fiber>>,
    cb: Option<FiberFn>,
}

impl Waiter {
    #[inline]
    fn is_empty(&self) -> bool {
        self.scheduler.is_none() && self.fiber.is_none() && self.cb.is_none()
    }

    fn reset(&mut self) {
        self.scheduler = None;
        self.fiber = None;
        self.cb = None;
    }
}

/// Reactor state for one fd. Invariant: a waiter is non-empty iff its bit
/// is set in `events`, and `events` always equals the kernel-side interest
/// mask (minus the permanent EPOLLET).
struct FdSlots {
    events: u32,
    read: Waiter,
    write: Waiter,
}

impl FdSlots {
    #[inline]
    fn waiter_mut(&mut self, event: Event) -> &mut Waiter {
        match event {
            Event::Read => &mut self.read,
            Event::Write => &mut self.write,
        }
    }
}

struct FdContext {
    fd: RawFd,
    inner: SpinLock<FdSlots>,
}

impl FdContext {
    fn new(fd: RawFd) -> FdContext {
        FdContext {
            fd,
            inner: SpinLock::new(FdSlots {
                events: 0,
                read: Waiter::default(),
                write: Waiter::default(),
            }),
        }
    }
}

/// Scheduler with an epoll-driven idle loop and integrated timers.
pub struct IoManager {
    sched: Scheduler,
    timers: Arc<TimerManager>,
    epfd: RawFd,
    /// eventfd used to interrupt `epoll_wait`
    tickle_fd: RawFd,
    /// Armed waiter count across all fds
    pending_events: AtomicUsize,
    /// Dense per-fd slots, indexed by fd number
    contexts: RwLock<Vec<Arc<FdContext>>>,
}

impl IoManager {
    /// Create the reactor and start its worker pool. `threads` counts the
    /// caller when `use_caller` is set.
    pub fn new(threads: usize, use_caller: bool, name: &str) -> IoResult<Arc<IoManager>> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(IoError::Os(crate::errno()));
        }
        let tickle_fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if tickle_fd < 0 {
            let e = crate::errno();
            unsafe { libc::close(epfd) };
            return Err(IoError::Os(e));
        }

        let mut ev = libc::epoll_event {
            events: (libc::EPOLLIN | libc::EPOLLET) as u32,
            u64: tickle_fd as u64,
        };
        if unsafe { libc::epoll_ctl(epfd, libc::EPOLL_CTL_ADD, tickle_fd, &mut ev) } != 0 {
            let e = crate::errno();
            unsafe {
                libc::close(tickle_fd);
                libc::close(epfd);
            }
            return Err(IoError::Os(e));
        }

        let iom = Arc::new(IoManager {
            sched: Scheduler::new(threads, use_caller, name),
            timers: TimerManager::new(),
            epfd,
            tickle_fd,
            pending_events: AtomicUsize::new(0),
            contexts: RwLock::new(Vec::new()),
        });
        iom.resize_contexts(32);

        let waker: Weak<dyn TimerWaker> = Arc::downgrade(&iom) as Weak<dyn TimerWaker>;
        iom.timers.set_waker(waker);

        iom.start().expect("reactor worker pool failed to start");
        Ok(iom)
    }

    /// The reactor driving the calling worker thread, if any.
    pub fn current() -> Option<Arc<IoManager>> {
        current_dispatcher()?.into_any().downcast::<IoManager>().ok()
    }

    /// Armed waiter count (both directions, all fds).
    #[inline]
    pub fn pending_events(&self) -> usize {
        self.pending_events.load(Ordering::Acquire)
    }

    pub fn timers(&self) -> &Arc<TimerManager> {
        &self.timers
    }

    /// See [`TimerManager::add_timer`].
    pub fn add_timer<F>(&self, ms: u64, f: F, recurring: bool) -> Arc<Timer>
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.timers.add_timer(ms, f, recurring)
    }

    /// See [`TimerManager::add_condition_timer`].
    pub fn add_condition_timer<F, T>(
        &self,
        ms: u64,
        f: F,
        cond: Weak<T>,
        recurring: bool,
    ) -> Arc<Timer>
    where
        F: Fn() + Send + Sync + 'static,
        T: Send + Sync + 'static,
    {
        self.timers.add_condition_timer(ms, f, cond, recurring)
    }

    /// Grow the slot vector so index `min_len - 1` exists. Growth is
    /// monotonic: max(len * 1.5, requested).
    fn resize_contexts(&self, min_len: usize) {
        let mut contexts = self.contexts.write().unwrap();
        if contexts.len() >= min_len {
            return;
        }
        let new_len = (contexts.len() + contexts.len() / 2).max(min_len);
        for fd in contexts.len()..new_len {
            contexts.push(Arc::new(FdContext::new(fd as RawFd)));
        }
    }

    fn context_for(&self, fd: RawFd) -> Arc<FdContext> {
        {
            let contexts = self.contexts.read().unwrap();
            if (fd as usize) < contexts.len() {
                return contexts[fd as usize].clone();
            }
        }
        self.resize_contexts(fd as usize + 1);
        self.contexts.read().unwrap()[fd as usize].clone()
    }

    fn try_context(&self, fd: RawFd) -> Option<Arc<FdContext>> {
        let contexts = self.contexts.read().unwrap();
        contexts.get(fd as usize).cloned()
    }

    /// Arm interest in one direction of `fd`.
    ///
    /// With a callable, that callable is scheduled when the direction
    /// fires; without one, the currently running fiber is parked as the
    /// waiter and simply resumed. Arming an already-armed direction fails
    /// without touching anything.
    pub fn add_event(self: &Arc<Self>, fd: RawFd, event: Event, cb: Option<FiberFn>) -> IoResult<()> {
        let ctx = self.context_for(fd);
        let mut inner = ctx.inner.lock();

        if inner.events & event.bits() != 0 {
            sp_error!(
                "add_event: {:?} already armed on fd {} (events={:#x})",
                event,
                fd,
                inner.events
            );
            return Err(IoError::EventExists);
        }

        let op = if inner.events != 0 {
            libc::EPOLL_CTL_MOD
        } else {
            libc::EPOLL_CTL_ADD
        };
        let mut ev = libc::epoll_event {
            events: EV_ET | inner.events | event.bits(),
            u64: fd as u64,
        };
        if unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) } != 0 {
            let e = crate::errno();
            sp_error!("add_event: epoll_ctl({}, {:?}) failed: errno {}", fd, event, e);
            return Err(IoError::Os(e));
        }

        self.pending_events.fetch_add(1, Ordering::AcqRel);
        inner.events |= event.bits();

        let scheduler: Arc<dyn Dispatch> = match current_dispatcher() {
            Some(d) => d,
            None => self.clone(),
        };
        let waiter = inner.waiter_mut(event);
        debug_assert!(waiter.is_empty());
        waiter.scheduler = Some(scheduler);
        match cb {
            Some(cb) => waiter.cb = Some(cb),
            None => {
                let fiber = Fiber::current();
                debug_assert_eq!(fiber.state(), spindle_core::FiberState::Running);
                waiter.fiber = Some(fiber);
            }
        }
        Ok(())
    }

    /// Disarm one direction without waking anybody. False if the direction
    /// was not armed or the kernel update failed.
    pub fn del_event(&self, fd: RawFd, event: Event) -> bool {
        let Some(ctx) = self.try_context(fd) else {
            return false;
        };
        let mut inner = ctx.inner.lock();
        if inner.events & event.bits() == 0 {
            return false;
        }

        let left = inner.events & !event.bits();
        if !self.update_interest(fd, left, "del_event") {
            return false;
        }
        self.pending_events.fetch_sub(1, Ordering::AcqRel);
        inner.events = left;
        inner.waiter_mut(event).reset();
        true
    }

    /// Disarm one direction and wake its waiter as if the event had fired.
    /// This is how timeouts unblock a parked fiber.
    pub fn cancel_event(&self, fd: RawFd, event: Event) -> bool {
        let Some(ctx) = self.try_context(fd) else {
            return false;
        };
        let mut inner = ctx.inner.lock();
        if inner.events & event.bits() == 0 {
            return false;
        }

        let left = inner.events & !event.bits();
        if !self.update_interest(fd, left, "cancel_event") {
            return false;
        }
        self.trigger(&mut inner, event);
        true
    }

    /// Remove the fd from the reactor entirely, waking both directions.
    pub fn cancel_all(&self, fd: RawFd) -> bool {
        let Some(ctx) = self.try_context(fd) else {
            return false;
        };
        let mut inner = ctx.inner.lock();
        if inner.events == 0 {
            return false;
        }

        if !self.update_interest(fd, 0, "cancel_all") {
            return false;
        }
        if inner.events & EV_READ != 0 {
            self.trigger(&mut inner, Event::Read);
        }
        if inner.events & EV_WRITE != 0 {
            self.trigger(&mut inner, Event::Write);
        }
        debug_assert_eq!(inner.events, 0);
        true
    }

    /// Point the kernel at the residual interest mask (`EPOLL_CTL_MOD`), or
    /// drop the registration when nothing is left (`EPOLL_CTL_DEL`).
    fn update_interest(&self, fd: RawFd, left: u32, who: &str) -> bool {
        let op = if left != 0 {
            libc::EPOLL_CTL_MOD
        } else {
            libc::EPOLL_CTL_DEL
        };
        let mut ev = libc::epoll_event {
            events: EV_ET | left,
            u64: fd as u64,
        };
        if unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) } != 0 {
            sp_error!("{}: epoll_ctl({}) failed: errno {}", who, fd, crate::errno());
            return false;
        }
        true
    }

    /// Hand the waiter to its recorded scheduler and clear the slot.
    /// Caller holds the fd lock; the foreign queue lock nested inside is
    /// fine because no fd lock is ever taken while holding a queue lock.
    fn trigger(&self, inner: &mut FdSlots, event: Event) {
        debug_assert!(inner.events & event.bits() != 0);
        inner.events &= !event.bits();

        let waiter = inner.waiter_mut(event);
        let scheduler = waiter.scheduler.take();
        let task = if let Some(cb) = waiter.cb.take() {
            Some(Task::new(TaskPayload::Call(cb), ANY_THREAD))
        } else {
            waiter.fiber.take().map(|f| Task::fiber(f, ANY_THREAD))
        };
        waiter.reset();

        if let Some(task) = task {
            match scheduler {
                Some(s) => s.schedule_task(task),
                None => self.schedule_task(task),
            }
        }
        self.pending_events.fetch_sub(1, Ordering::AcqRel);
    }
}

impl TimerWaker for IoManager {
    /// A nearer deadline appeared while workers may be deep in a long
    /// `epoll_wait`: poke the eventfd so the wait is recomputed.
    fn on_timer_inserted_at_front(&self) {
        self.tickle();
    }
}

impl Dispatch for IoManager {
    fn scheduler(&self) -> &Scheduler {
        &self.sched
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }

    /// Wake one worker out of `epoll_wait`, but only when somebody is
    /// actually parked there.
    fn tickle(&self) {
        if self.sched.idle_threads() == 0 {
            return;
        }
        let one: u64 = 1;
        let n = unsafe {
            libc::write(
                self.tickle_fd,
                &one as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        // EAGAIN means the counter is saturated: a wakeup is already
        // pending, which is all we wanted.
        if n < 0 && crate::errno() != libc::EAGAIN {
            sp_error!("tickle: eventfd write failed: errno {}", crate::errno());
        }
    }

    fn on_thread_start(&self) {
        hook::set_enabled(true);
    }

    /// Stop only when, on top of the base condition, no waiter is armed
    /// and no timer is pending.
    fn stopping(&self) -> bool {
        !self.timers.has_timer()
            && self.pending_events.load(Ordering::Acquire) == 0
            && self.sched.base_stopping()
    }

    /// The reactor idle fiber, one per worker: block in `epoll_wait`, drain
    /// timers, fire ready waiters, yield back to the dispatch loop.
    fn idle(&self) {
        const MAX_EVENTS: usize = 256;
        const MAX_TIMEOUT_MS: u64 = 5000;
        let mut events =
            vec![libc::epoll_event { events: 0, u64: 0 }; MAX_EVENTS];

        loop {
            if self.stopping() {
                // Pass the wakeup along so the other pollers exit promptly.
                self.tickle();
                sp_debug!("{}: reactor idle exits", self.sched.name());
                break;
            }

            let mut n;
            loop {
                // A task can slip in between the dispatch loop's last queue
                // check and this wait, with the tickle skipped because no
                // worker was idle yet; poll instead of sleeping on it.
                let timeout = if self.sched.has_runnable_tasks(thread::current_tid()) {
                    0
                } else {
                    self.timers
                        .next_timer_ms()
                        .unwrap_or(MAX_TIMEOUT_MS)
                        .min(MAX_TIMEOUT_MS)
                };
                n = unsafe {
                    libc::epoll_wait(
                        self.epfd,
                        events.as_mut_ptr(),
                        MAX_EVENTS as i32,
                        timeout as i32,
                    )
                };
                if n < 0 && crate::errno() == libc::EINTR {
                    continue;
                }
                break;
            }

            let mut cbs = Vec::new();
            self.timers.list_expired(&mut cbs);
            for cb in cbs {
                self.schedule_task(Task::call(move || cb(), ANY_THREAD));
            }

            for i in 0..n.max(0) as usize {
                let ev = events[i];
                let fd = ev.u64 as RawFd;

                if fd == self.tickle_fd {
                    // Edge-triggered: drain the counter completely.
                    let mut buf = [0u8; 8];
                    while unsafe {
                        libc::read(self.tickle_fd, buf.as_mut_ptr() as *mut libc::c_void, 8)
                    } > 0
                    {}
                    continue;
                }

                let Some(ctx) = self.try_context(fd) else {
                    continue;
                };
                let mut inner = ctx.inner.lock();

                // Error/hangup counts as readiness for whichever
                // directions are armed, so waiters observe the failure
                // from the retried syscall instead of hanging.
                let mut bits = ev.events;
                if bits & EV_ERR_HUP != 0 {
                    bits |= (EV_READ | EV_WRITE) & inner.events;
                }
                let ready = bits & (EV_READ | EV_WRITE) & inner.events;
                if ready == 0 {
                    continue;
                }

                let left = inner.events & !ready;
                if !self.update_interest(ctx.fd, left, "idle") {
                    continue;
                }
                if ready & EV_READ != 0 {
                    self.trigger(&mut inner, Event::Read);
                }
                if ready & EV_WRITE != 0 {
                    self.trigger(&mut inner, Event::Write);
                }
            }

            // Let queued tasks (woken fibers, timer callbacks) run.
            Fiber::current().yield_now();
        }
    }
}

impl Drop for IoManager {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.tickle_fd);
            libc::close(self.epfd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::{Duration, Instant};

    fn socketpair() -> (RawFd, RawFd) {
        let mut fds = [0 as RawFd; 2];
        let rc = unsafe {
            libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr())
        };
        assert_eq!(rc, 0);
        for fd in fds {
            let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
            unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
        }
        (fds[0], fds[1])
    }

    fn close_pair(pair: (RawFd, RawFd)) {
        unsafe {
            libc::close(pair.0);
            libc::close(pair.1);
        }
    }

    fn wait_for<F: Fn() -> bool>(cond: F, ms: u64) -> bool {
        let deadline = Instant::now() + Duration::from_millis(ms);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    #[test]
    fn test_add_then_del_restores_state() {
        let iom = IoManager::new(1, false, "reactor-deltest").unwrap();
        let pair = socketpair();

        assert!(iom.add_event(pair.0, Event::Read, Some(Box::new(|| {}))).is_ok());
        assert_eq!(iom.pending_events(), 1);

        assert!(iom.del_event(pair.0, Event::Read));
        assert_eq!(iom.pending_events(), 0);

        // Second del is a no-op, the direction is no longer armed.
        assert!(!iom.del_event(pair.0, Event::Read));

        // And the fd can be armed again from scratch.
        assert!(iom.add_event(pair.0, Event::Read, Some(Box::new(|| {}))).is_ok());
        assert!(iom.del_event(pair.0, Event::Read));

        iom.stop();
        close_pair(pair);
    }

    #[test]
    fn test_duplicate_direction_rejected() {
        let iom = IoManager::new(1, false, "reactor-duptest").unwrap();
        let pair = socketpair();

        assert!(iom.add_event(pair.0, Event::Read, Some(Box::new(|| {}))).is_ok());
        let err = iom.add_event(pair.0, Event::Read, Some(Box::new(|| {})));
        assert_eq!(err, Err(IoError::EventExists));
        assert_eq!(iom.pending_events(), 1);

        assert!(iom.del_event(pair.0, Event::Read));
        iom.stop();
        close_pair(pair);
    }

    #[test]
    fn test_cancel_event_fires_waiter() {
        let iom = IoManager::new(1, false, "reactor-cancel").unwrap();
        let pair = socketpair();

        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        iom.add_event(pair.0, Event::Read, Some(Box::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
        })))
        .unwrap();

        // Nothing was ever written to the peer; cancel fires it anyway.
        assert!(iom.cancel_event(pair.0, Event::Read));
        assert!(wait_for(|| hits.load(Ordering::SeqCst) == 1, 1000));
        assert_eq!(iom.pending_events(), 0);

        // Cancelling again reports nothing armed.
        assert!(!iom.cancel_event(pair.0, Event::Read));

        iom.stop();
        close_pair(pair);
    }

    #[test]
    fn test_both_directions_fire_once() {
        let iom = IoManager::new(2, false, "reactor-both").unwrap();
        let (ours, theirs) = socketpair();

        let reads = Arc::new(AtomicUsize::new(0));
        let writes = Arc::new(AtomicUsize::new(0));

        let r = Arc::clone(&reads);
        iom.add_event(ours, Event::Read, Some(Box::new(move || {
            r.fetch_add(1, Ordering::SeqCst);
        })))
        .unwrap();
        let w = Arc::clone(&writes);
        iom.add_event(ours, Event::Write, Some(Box::new(move || {
            w.fetch_add(1, Ordering::SeqCst);
        })))
        .unwrap();
        assert_eq!(iom.pending_events(), 2);

        // Make the fd readable; it is trivially writable already.
        let msg = b"x";
        let n = unsafe { libc::write(theirs, msg.as_ptr() as *const libc::c_void, 1) };
        assert_eq!(n, 1);

        assert!(wait_for(
            || reads.load(Ordering::SeqCst) == 1 && writes.load(Ordering::SeqCst) == 1,
            2000
        ));
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(reads.load(Ordering::SeqCst), 1);
        assert_eq!(writes.load(Ordering::SeqCst), 1);
        assert_eq!(iom.pending_events(), 0);

        iom.stop();
        close_pair((ours, theirs));
    }

    #[test]
    fn test_cancel_all_fires_both() {
        let iom = IoManager::new(1, false, "reactor-cancelall").unwrap();
        let pair = socketpair();

        let hits = Arc::new(AtomicUsize::new(0));
        for ev in [Event::Read, Event::Write] {
            let h = Arc::clone(&hits);
            iom.add_event(pair.0, ev, Some(Box::new(move || {
                h.fetch_add(1, Ordering::SeqCst);
            })))
            .unwrap();
        }

        assert!(iom.cancel_all(pair.0));
        assert!(wait_for(|| hits.load(Ordering::SeqCst) == 2, 1000));
        assert_eq!(iom.pending_events(), 0);
        assert!(!iom.cancel_all(pair.0));

        iom.stop();
        close_pair(pair);
    }

    #[test]
    fn test_recurring_timer_fires_three_times_in_3500ms() {
        let iom = IoManager::new(2, false, "reactor-timer").unwrap();

        let fired = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&fired);
        let timer = iom.add_timer(1000, move || {
            f.fetch_add(1, Ordering::SeqCst);
        }, true);

        std::thread::sleep(Duration::from_millis(3500));
        assert_eq!(fired.load(Ordering::SeqCst), 3);

        timer.cancel();
        iom.stop();
    }

    #[test]
    fn test_condition_timer_with_dropped_witness() {
        let iom = IoManager::new(1, false, "reactor-cond").unwrap();

        let fired = Arc::new(AtomicUsize::new(0));
        let witness = Arc::new(());
        let f = Arc::clone(&fired);
        iom.add_condition_timer(
            100,
            move || {
                f.fetch_add(1, Ordering::SeqCst);
            },
            Arc::downgrade(&witness),
            false,
        );
        drop(witness);

        std::thread::sleep(Duration::from_millis(300));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        // The timer itself was drained.
        assert!(!iom.timers().has_timer());

        iom.stop();
    }
}
