//! Deadline-ordered timers
//!
//! `TimerManager` keeps an ordered map of absolute wall-clock deadlines in
//! milliseconds. Ties are broken by the timer's address so the order is
//! total. The reactor asks for the next deadline before blocking and drains
//! expired callables afterwards; an `on_timer_inserted_at_front` hook lets
//! it cut an in-flight wait short when a nearer deadline appears.
//!
//! Deadlines live on the wall clock, which can jump backwards. A regression
//! of more than an hour against the last observed time fires every pending
//! timer rather than stalling them for the length of the jump; smaller
//! adjustments (NTP slew) are absorbed by the ordering itself.

use spindle_core::SpinLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

/// Timer callable. `Fn` because recurring timers fire repeatedly.
pub type TimerCallback = Arc<dyn Fn() + Send + Sync>;

/// Fire everything if the clock went back further than this.
const CLOCK_ROLLOVER_MS: u64 = 60 * 60 * 1000;

/// Receives the front-insert notification; the reactor implements this
/// with its worker wakeup.
pub trait TimerWaker: Send + Sync {
    fn on_timer_inserted_at_front(&self);
}

/// Wall clock in milliseconds since the epoch.
#[inline]
fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

struct TimerState {
    /// Period in milliseconds
    ms: u64,
    /// Absolute deadline in wall-clock milliseconds
    deadline: u64,
    /// None once cancelled or fired non-recurring
    cb: Option<TimerCallback>,
}

/// A single deadline registration, shared as `Arc<Timer>`.
///
/// All mutation happens under the owning manager's write lock; the inner
/// spinlock only serializes field access within it.
pub struct Timer {
    recurring: bool,
    state: SpinLock<TimerState>,
    manager: Weak<TimerManager>,
}

impl Timer {
    #[inline]
    fn key(self: &Arc<Self>) -> (u64, usize) {
        (self.state.lock().deadline, Arc::as_ptr(self) as usize)
    }

    /// Remove the timer and clear its callable.
    ///
    /// Returns false if it already fired (non-recurring) or was cancelled.
    pub fn cancel(self: &Arc<Self>) -> bool {
        let Some(mgr) = self.manager.upgrade() else {
            return false;
        };
        let mut inner = mgr.inner.write().unwrap();
        let mut st = self.state.lock();
        if st.cb.is_none() {
            return false;
        }
        st.cb = None;
        inner
            .timers
            .remove(&(st.deadline, Arc::as_ptr(self) as usize));
        true
    }

    /// Push the deadline out to now + period.
    pub fn refresh(self: &Arc<Self>) -> bool {
        let Some(mgr) = self.manager.upgrade() else {
            return false;
        };
        let mut inner = mgr.inner.write().unwrap();
        let mut st = self.state.lock();
        if st.cb.is_none() {
            return false;
        }
        if inner
            .timers
            .remove(&(st.deadline, Arc::as_ptr(self) as usize))
            .is_none()
        {
            return false;
        }
        st.deadline = now_ms() + st.ms;
        inner
            .timers
            .insert((st.deadline, Arc::as_ptr(self) as usize), self.clone());
        true
    }

    /// Change the period. `from_now` measures the new deadline from now,
    /// otherwise from the original start point. Goes through the insert
    /// path, so moving a timer to the front wakes the reactor.
    pub fn reset(self: &Arc<Self>, ms: u64, from_now: bool) -> bool {
        let Some(mgr) = self.manager.upgrade() else {
            return false;
        };
        {
            let mut inner = mgr.inner.write().unwrap();
            let mut st = self.state.lock();
            if ms == st.ms && !from_now {
                return true;
            }
            if st.cb.is_none() {
                return false;
            }
            if inner
                .timers
                .remove(&(st.deadline, Arc::as_ptr(self) as usize))
                .is_none()
            {
                return false;
            }
            let start = if from_now {
                now_ms()
            } else {
                st.deadline.saturating_sub(st.ms)
            };
            st.ms = ms;
            st.deadline = start + ms;
        }
        mgr.insert(self);
        true
    }
}

struct TimerMapInner {
    timers: BTreeMap<(u64, usize), Arc<Timer>>,
    /// Last observed wall time, for regression detection
    previous_ms: u64,
}

/// Ordered multiset of timers, shared with the reactor.
pub struct TimerManager {
    inner: RwLock<TimerMapInner>,
    /// Arms the front-insert hook at most once per quiescent interval
    /// between `next_timer_ms` queries.
    tickled: AtomicBool,
    waker: SpinLock<Option<Weak<dyn TimerWaker>>>,
}

impl TimerManager {
    pub fn new() -> Arc<TimerManager> {
        Arc::new(TimerManager {
            inner: RwLock::new(TimerMapInner {
                timers: BTreeMap::new(),
                previous_ms: now_ms(),
            }),
            tickled: AtomicBool::new(false),
            waker: SpinLock::new(None),
        })
    }

    /// Install the front-insert notification target.
    pub fn set_waker(&self, waker: Weak<dyn TimerWaker>) {
        *self.waker.lock() = Some(waker);
    }

    /// Register a callable to run `ms` milliseconds from now.
    pub fn add_timer<F>(self: &Arc<Self>, ms: u64, f: F, recurring: bool) -> Arc<Timer>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let timer = Arc::new(Timer {
            recurring,
            state: SpinLock::new(TimerState {
                ms,
                deadline: now_ms() + ms,
                cb: Some(Arc::new(f)),
            }),
            manager: Arc::downgrade(self),
        });
        self.insert(&timer);
        timer
    }

    /// Like [`add_timer`], but the callable only runs while `cond` can
    /// still be upgraded. A dead witness turns the firing into a no-op;
    /// the I/O layer uses this so a stale timeout cannot hit an operation
    /// that already completed.
    ///
    /// [`add_timer`]: TimerManager::add_timer
    pub fn add_condition_timer<F, T>(
        self: &Arc<Self>,
        ms: u64,
        f: F,
        cond: Weak<T>,
        recurring: bool,
    ) -> Arc<Timer>
    where
        F: Fn() + Send + Sync + 'static,
        T: Send + Sync + 'static,
    {
        self.add_timer(
            ms,
            move || {
                if cond.upgrade().is_some() {
                    f();
                }
            },
            recurring,
        )
    }

    fn insert(self: &Arc<Self>, timer: &Arc<Timer>) {
        let at_front;
        {
            let mut inner = self.inner.write().unwrap();
            let key = timer.key();
            inner.timers.insert(key, timer.clone());
            let is_first = inner
                .timers
                .first_key_value()
                .map(|(k, _)| *k == key)
                .unwrap_or(false);
            at_front = is_first && !self.tickled.swap(true, Ordering::AcqRel);
        }
        if at_front {
            let waker = self.waker.lock().clone();
            if let Some(w) = waker.and_then(|w| w.upgrade()) {
                w.on_timer_inserted_at_front();
            }
        }
    }

    /// Milliseconds until the earliest deadline: 0 if already due, None if
    /// no timer is registered. Re-arms the front-insert hook.
    pub fn next_timer_ms(&self) -> Option<u64> {
        let inner = self.inner.read().unwrap();
        self.tickled.store(false, Ordering::Release);
        let (&(deadline, _), _) = inner.timers.first_key_value()?;
        Some(deadline.saturating_sub(now_ms()))
    }

    /// Whether any timer is registered.
    pub fn has_timer(&self) -> bool {
        !self.inner.read().unwrap().timers.is_empty()
    }

    /// Drain every due callable into `out`. Recurring timers are re-armed
    /// at now + period; one-shot timers lose their callable. Callables are
    /// invoked by the caller after the lock is released.
    pub fn list_expired(&self, out: &mut Vec<TimerCallback>) {
        self.list_expired_at(now_ms(), out);
    }

    fn list_expired_at(&self, now: u64, out: &mut Vec<TimerCallback>) {
        let mut inner = self.inner.write().unwrap();
        let rollover = now + CLOCK_ROLLOVER_MS < inner.previous_ms;
        inner.previous_ms = now;

        let mut recurring = Vec::new();
        loop {
            let due = match inner.timers.first_key_value() {
                Some((&(deadline, _), _)) => rollover || deadline <= now,
                None => false,
            };
            if !due {
                break;
            }
            let (_, timer) = inner.timers.pop_first().unwrap();
            let mut st = timer.state.lock();
            if let Some(cb) = st.cb.clone() {
                out.push(cb);
            }
            if timer.recurring {
                st.deadline = now + st.ms;
                drop(st);
                recurring.push(timer);
            } else {
                st.cb = None;
            }
        }

        // Re-armed outside the drain loop so a zero-period recurring timer
        // cannot spin it forever.
        for timer in recurring {
            let key = timer.key();
            inner.timers.insert(key, timer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn fired(out: &[TimerCallback]) -> usize {
        for cb in out {
            cb();
        }
        out.len()
    }

    #[test]
    fn test_zero_ms_fires_on_next_drain() {
        let mgr = TimerManager::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        mgr.add_timer(0, move || { h.fetch_add(1, Ordering::SeqCst); }, false);

        assert_eq!(mgr.next_timer_ms(), Some(0));
        let mut out = Vec::new();
        mgr.list_expired(&mut out);
        assert_eq!(fired(&out), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(!mgr.has_timer());
    }

    #[test]
    fn test_next_timer_empty_sentinel() {
        let mgr = TimerManager::new();
        assert_eq!(mgr.next_timer_ms(), None);
    }

    #[test]
    fn test_cancel_idempotent() {
        let mgr = TimerManager::new();
        let timer = mgr.add_timer(50_000, || {}, false);
        assert!(timer.cancel());
        assert!(!timer.cancel());
        assert!(!mgr.has_timer());

        // A fired one-shot timer cancels to false as well.
        let timer = mgr.add_timer(0, || {}, false);
        let mut out = Vec::new();
        mgr.list_expired(&mut out);
        assert_eq!(out.len(), 1);
        assert!(!timer.cancel());
    }

    #[test]
    fn test_recurring_re_arms_period_apart() {
        let mgr = TimerManager::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        mgr.add_timer(100, move || { h.fetch_add(1, Ordering::SeqCst); }, true);

        let base = now_ms();
        let mut out = Vec::new();
        mgr.list_expired_at(base + 100, &mut out);
        assert_eq!(fired(&out), 1);
        out.clear();

        // Not due again before a full period has elapsed.
        mgr.list_expired_at(base + 150, &mut out);
        assert_eq!(out.len(), 0);
        mgr.list_expired_at(base + 200, &mut out);
        assert_eq!(fired(&out), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert!(mgr.has_timer());
    }

    #[test]
    fn test_clock_regression_fires_everything() {
        let mgr = TimerManager::new();
        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let h = Arc::clone(&hits);
            mgr.add_timer(10_000_000, move || { h.fetch_add(1, Ordering::SeqCst); }, false);
        }

        let base = now_ms();
        let mut out = Vec::new();
        mgr.list_expired_at(base, &mut out);
        assert_eq!(out.len(), 0);

        // Jump back two hours: everything fires.
        mgr.list_expired_at(base.saturating_sub(2 * 60 * 60 * 1000), &mut out);
        assert_eq!(fired(&out), 3);
        assert_eq!(hits.load(Ordering::SeqCst), 3);
        assert!(!mgr.has_timer());
    }

    #[test]
    fn test_small_regression_is_ignored() {
        let mgr = TimerManager::new();
        mgr.add_timer(10_000_000, || {}, false);

        let base = now_ms();
        let mut out = Vec::new();
        mgr.list_expired_at(base, &mut out);
        // A one-minute step back is inside the tolerance window.
        mgr.list_expired_at(base.saturating_sub(60 * 1000), &mut out);
        assert_eq!(out.len(), 0);
        assert!(mgr.has_timer());
    }

    #[test]
    fn test_condition_timer_dead_witness() {
        let mgr = TimerManager::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let witness = Arc::new(());
        let h = Arc::clone(&hits);
        mgr.add_condition_timer(
            0,
            move || { h.fetch_add(1, Ordering::SeqCst); },
            Arc::downgrade(&witness),
            false,
        );
        drop(witness);

        let mut out = Vec::new();
        mgr.list_expired(&mut out);
        assert_eq!(fired(&out), 1); // the wrapper runs, the payload does not
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_reset_and_refresh() {
        let mgr = TimerManager::new();
        let timer = mgr.add_timer(1000, || {}, false);

        assert!(timer.reset(5000, true));
        let next = mgr.next_timer_ms().unwrap();
        assert!(next > 4000 && next <= 5000);

        assert!(timer.refresh());
        assert!(mgr.has_timer());

        timer.cancel();
        assert!(!timer.refresh());
        assert!(!timer.reset(100, true));
    }

    #[test]
    fn test_front_insert_hook_once_per_interval() {
        struct CountingWaker(AtomicUsize);
        impl TimerWaker for CountingWaker {
            fn on_timer_inserted_at_front(&self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let mgr = TimerManager::new();
        let waker = Arc::new(CountingWaker(AtomicUsize::new(0)));
        let weak: Weak<dyn TimerWaker> = Arc::downgrade(&waker) as Weak<dyn TimerWaker>;
        mgr.set_waker(weak);

        mgr.add_timer(1000, || {}, false); // new front
        mgr.add_timer(500, || {}, false);  // new front, but hook already armed
        assert_eq!(waker.0.load(Ordering::SeqCst), 1);

        let _ = mgr.next_timer_ms(); // quiescent point re-arms the hook
        mgr.add_timer(100, || {}, false);
        assert_eq!(waker.0.load(Ordering::SeqCst), 2);

        mgr.add_timer(2000, || {}, false); // not at the front, no hook
        assert_eq!(waker.0.load(Ordering::SeqCst), 2);
    }
}
