//! Named OS threads with synchronized startup
//!
//! The constructor does not return until the new thread has installed its
//! thread-locals and published its kernel tid, so a spawner can immediately
//! target the thread (e.g. for task affinity). The OS-visible name comes
//! from `thread::Builder` (truncated by the kernel to 15 bytes).
//!
//! `join()` is the primary termination path; dropping a running `Thread`
//! detaches it.

use crate::tls;
use spindle_core::{SchedError, SchedResult, Semaphore};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

pub struct Thread {
    handle: Option<JoinHandle<()>>,
    tid: libc::pid_t,
    name: String,
}

impl Thread {
    /// Spawn a named thread running `f`. Blocks until the thread is fully
    /// initialized.
    pub fn new<F>(f: F, name: &str) -> SchedResult<Thread>
    where
        F: FnOnce() + Send + 'static,
    {
        let sem = Arc::new(Semaphore::new(0));
        let tid_slot = Arc::new(AtomicI32::new(-1));

        let sem2 = Arc::clone(&sem);
        let tid2 = Arc::clone(&tid_slot);
        let thread_name = name.to_string();
        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                tls::set_current_name(&thread_name);
                tid2.store(tls::current_tid(), Ordering::Release);
                sem2.post();
                f();
            })
            .map_err(|e| SchedError::Os(e.raw_os_error().unwrap_or(0)))?;

        sem.wait();
        Ok(Thread {
            handle: Some(handle),
            tid: tid_slot.load(Ordering::Acquire),
            name: name.to_string(),
        })
    }

    /// Kernel tid of the spawned thread
    #[inline]
    pub fn tid(&self) -> libc::pid_t {
        self.tid
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wait for the thread to finish. A panic on the thread surfaces here
    /// as a normal join error and is ignored; the scheduler treats worker
    /// panics as fatal to that worker only.
    pub fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Kernel tid of the calling thread
#[inline]
pub fn current_tid() -> libc::pid_t {
    tls::current_tid()
}

/// Name of the calling thread
pub fn current_name() -> String {
    tls::current_name()
}
