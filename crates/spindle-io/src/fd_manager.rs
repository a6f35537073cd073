//! Per-fd runtime metadata
//!
//! The syscall layer needs to know, for every fd it sees: is it a socket,
//! did the runtime force it non-blocking, does the *application* believe it
//! is non-blocking, and what send/recv timeouts apply. `FdManager` is the
//! process-wide registry of that state, a dense vector indexed by fd and
//! lazily populated (on socket creation, on accept, or on first
//! interception of an unknown fd).

use spindle_core::sp_trace;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, RwLock};

/// Timeout sentinel: no timeout configured.
pub const NO_TIMEOUT: u64 = u64::MAX;

/// Which of the two socket timeouts an operation consults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    /// `SO_RCVTIMEO`: reads, accepts
    Recv,
    /// `SO_SNDTIMEO`: writes, connects
    Send,
}

/// Metadata for one fd.
pub struct FdCtx {
    fd: RawFd,
    is_init: bool,
    is_socket: bool,
    /// The runtime keeps sockets kernel-nonblocking; invariant:
    /// `is_socket` implies `sys_nonblock`.
    sys_nonblock: AtomicBool,
    /// What the application asked for via fcntl/ioctl
    user_nonblock: AtomicBool,
    closed: AtomicBool,
    /// Milliseconds, NO_TIMEOUT for none
    recv_timeout: AtomicU64,
    send_timeout: AtomicU64,
}

impl FdCtx {
    /// Inspect the fd and, for sockets, force `O_NONBLOCK` through the raw
    /// fcntl (the kernel flag; the application-visible flag stays under
    /// `user_nonblock`).
    fn new(fd: RawFd) -> FdCtx {
        let mut st: libc::stat = unsafe { std::mem::zeroed() };
        let (is_init, is_socket) = if unsafe { libc::fstat(fd, &mut st) } == -1 {
            (false, false)
        } else {
            (true, (st.st_mode & libc::S_IFMT) == libc::S_IFSOCK)
        };

        let sys_nonblock = if is_socket {
            let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
            if flags != -1 && flags & libc::O_NONBLOCK == 0 {
                unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
            }
            true
        } else {
            false
        };

        sp_trace!("fd {}: context created (socket={})", fd, is_socket);
        FdCtx {
            fd,
            is_init,
            is_socket,
            sys_nonblock: AtomicBool::new(sys_nonblock),
            user_nonblock: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            recv_timeout: AtomicU64::new(NO_TIMEOUT),
            send_timeout: AtomicU64::new(NO_TIMEOUT),
        }
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    #[inline]
    pub fn is_init(&self) -> bool {
        self.is_init
    }

    #[inline]
    pub fn is_socket(&self) -> bool {
        self.is_socket
    }

    #[inline]
    pub fn sys_nonblock(&self) -> bool {
        self.sys_nonblock.load(Ordering::Acquire)
    }

    #[inline]
    pub fn user_nonblock(&self) -> bool {
        self.user_nonblock.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_user_nonblock(&self, on: bool) {
        self.user_nonblock.store(on, Ordering::Release);
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }

    #[inline]
    pub fn timeout(&self, kind: TimeoutKind) -> u64 {
        match kind {
            TimeoutKind::Recv => self.recv_timeout.load(Ordering::Acquire),
            TimeoutKind::Send => self.send_timeout.load(Ordering::Acquire),
        }
    }

    #[inline]
    pub fn set_timeout(&self, kind: TimeoutKind, ms: u64) {
        match kind {
            TimeoutKind::Recv => self.recv_timeout.store(ms, Ordering::Release),
            TimeoutKind::Send => self.send_timeout.store(ms, Ordering::Release),
        }
    }
}

/// Process-wide fd registry.
pub struct FdManager {
    slots: RwLock<Vec<Option<Arc<FdCtx>>>>,
}

impl FdManager {
    fn new() -> FdManager {
        FdManager {
            slots: RwLock::new(vec![None; 64]),
        }
    }

    /// Look up the context for `fd`, creating it when `auto_create` is set.
    pub fn get(&self, fd: RawFd, auto_create: bool) -> Option<Arc<FdCtx>> {
        if fd < 0 {
            return None;
        }
        let idx = fd as usize;

        {
            let slots = self.slots.read().unwrap();
            if idx < slots.len() {
                if let Some(ctx) = &slots[idx] {
                    return Some(ctx.clone());
                }
            }
            if !auto_create {
                return None;
            }
        }

        let mut slots = self.slots.write().unwrap();
        if slots.len() <= idx {
            // Never shrink: a small fd must not undo earlier growth.
            let new_len = (slots.len() + slots.len() / 2).max(idx + 1);
            slots.resize(new_len, None);
        }
        // Re-check: another thread may have created it while we upgraded.
        if slots[idx].is_none() {
            slots[idx] = Some(Arc::new(FdCtx::new(fd)));
        }
        slots[idx].clone()
    }

    /// Drop the context. Does not close the fd; the syscall layer does.
    pub fn del(&self, fd: RawFd) {
        if fd < 0 {
            return;
        }
        let mut slots = self.slots.write().unwrap();
        if (fd as usize) < slots.len() {
            slots[fd as usize] = None;
        }
    }
}

/// The process-wide registry.
pub fn fd_manager() -> &'static FdManager {
    static FD_MANAGER: OnceLock<FdManager> = OnceLock::new();
    FD_MANAGER.get_or_init(FdManager::new)
}
