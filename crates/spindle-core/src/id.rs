//! Process-wide fiber id allocation
//!
//! Ids are dense, monotonically increasing and never reused. A separate
//! gauge tracks how many fibers are currently alive, which the runtime
//! exposes for diagnostics.

use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_ID: AtomicU64 = AtomicU64::new(0);
static ALIVE: AtomicU64 = AtomicU64::new(0);

/// Allocate the next fiber id and bump the live gauge.
#[inline]
pub fn next_fiber_id() -> u64 {
    ALIVE.fetch_add(1, Ordering::Relaxed);
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

/// Called from the fiber destructor.
#[inline]
pub fn release_fiber_id() {
    ALIVE.fetch_sub(1, Ordering::Relaxed);
}

/// Number of fibers currently alive in the process.
#[inline]
pub fn alive_fibers() -> u64 {
    ALIVE.load(Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_monotonic() {
        let a = next_fiber_id();
        let b = next_fiber_id();
        let c = next_fiber_id();
        assert!(a < b && b < c);
        assert!(alive_fibers() >= 3);
        release_fiber_id();
        release_fiber_id();
        release_fiber_id();
    }
}
