//! Runtime defaults with environment overrides
//!
//! # Environment Variables
//!
//! - `SPINDLE_STACK_SIZE` - fiber stack size in bytes (default 128 KiB)
//! - `SPINDLE_IDLE_SLEEP_MS` - base scheduler idle nap length

use spindle_core::env::env_get;
use std::sync::OnceLock;

/// Default fiber stack size
pub const DEFAULT_STACK_SIZE: usize = 128 * 1024;

/// How long the base scheduler's idle fiber naps between queue checks
pub const DEFAULT_IDLE_SLEEP_MS: u64 = 10;

/// Fiber stack size in bytes, read once from the environment.
#[inline]
pub fn stack_size() -> usize {
    static STACK_SIZE: OnceLock<usize> = OnceLock::new();
    *STACK_SIZE.get_or_init(|| env_get("SPINDLE_STACK_SIZE", DEFAULT_STACK_SIZE).max(4096))
}

/// Idle nap length for the base scheduler in milliseconds.
#[inline]
pub fn idle_sleep_ms() -> u64 {
    static IDLE_SLEEP: OnceLock<u64> = OnceLock::new();
    *IDLE_SLEEP.get_or_init(|| env_get("SPINDLE_IDLE_SLEEP_MS", DEFAULT_IDLE_SLEEP_MS))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stack_size_floor() {
        assert!(stack_size() >= 4096);
    }
}
