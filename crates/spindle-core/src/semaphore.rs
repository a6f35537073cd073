//! Counting semaphore
//!
//! Used by the `Thread` wrapper to block the spawning thread until the new
//! thread has finished installing its thread-locals. Built on OS blocking
//! primitives, so it must only be used from plain threads, never from a
//! fiber that should stay cooperative.

use std::sync::{Condvar, Mutex};

/// A counting semaphore on top of `Mutex` + `Condvar`.
pub struct Semaphore {
    count: Mutex<usize>,
    cv: Condvar,
}

impl Semaphore {
    /// Create a semaphore with the given initial permit count
    pub fn new(count: usize) -> Self {
        Self {
            count: Mutex::new(count),
            cv: Condvar::new(),
        }
    }

    /// Block until a permit is available, then take it
    pub fn wait(&self) {
        let mut count = self.count.lock().unwrap();
        while *count == 0 {
            count = self.cv.wait(count).unwrap();
        }
        *count -= 1;
    }

    /// Release one permit, waking a waiter if any
    pub fn post(&self) {
        let mut count = self.count.lock().unwrap();
        *count += 1;
        drop(count);
        self.cv.notify_one();
    }
}

impl Default for Semaphore {
    fn default() -> Self {
        Semaphore::new(0)
    }
}
