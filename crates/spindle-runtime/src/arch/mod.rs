//! Architecture-specific context switching
//!
//! Each architecture module provides:
//! - `Context` - the callee-saved register set of a suspended fiber
//! - `init_context` - prepare a fresh context that enters a trampoline
//! - `switch_context` - voluntary switch between two contexts
//!
//! Only the voluntary (cooperative) switch exists: a fiber gives up the CPU
//! at a call boundary, so caller-saved registers need no preservation.

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        pub mod x86_64;
        pub use x86_64::{Context, init_context, switch_context};
    } else if #[cfg(target_arch = "aarch64")] {
        pub mod aarch64;
        pub use aarch64::{Context, init_context, switch_context};
    } else {
        compile_error!("spindle supports x86_64 and aarch64 only");
    }
}
