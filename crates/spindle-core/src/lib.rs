//! # spindle-core
//!
//! Core types for the spindle fiber runtime.
//!
//! This crate is platform-agnostic and contains no OS-specific code beyond
//! writing to stderr. The fiber primitive, scheduler and reactor live in
//! `spindle-runtime` and `spindle-io`.
//!
//! ## Modules
//!
//! - `state` - Fiber state enum
//! - `id` - Process-wide fiber id allocator
//! - `error` - Error types
//! - `env` - Environment variable utilities
//! - `spinlock` - Internal spinlock primitive
//! - `semaphore` - Counting semaphore for thread startup handshakes
//! - `log` - Leveled stderr logging macros

pub mod env;
pub mod error;
pub mod id;
pub mod log;
pub mod semaphore;
pub mod spinlock;
pub mod state;

// Re-exports for convenience
pub use env::{env_get, env_get_bool};
pub use error::{SchedError, SchedResult};
pub use id::{alive_fibers, next_fiber_id};
pub use semaphore::Semaphore;
pub use spinlock::SpinLock;
pub use state::FiberState;
