//! Cooperative replacements for the blocking POSIX calls
//!
//! These are the runtime's equivalents of the libc entry points, exposed as
//! ordinary library functions (no dynamic-linker interposition): same
//! arguments, same return values, same errno discipline, but blocking is
//! replaced by fiber suspension. Reactor worker threads have the layer
//! enabled automatically; any other thread opts in with [`set_enabled`].
//!
//! The pattern shared by every byte-I/O call ([`do_io`]): try the raw
//! syscall once, retry through EINTR, and on EAGAIN arm the reactor for the
//! needed direction (plus a condition timer when the fd carries a
//! SO_RCVTIMEO/SO_SNDTIMEO budget), park the fiber, then retry or fail with
//! ETIMEDOUT. The timer's witness is a per-call record, so a timeout that
//! loses the race against completion fizzles instead of cancelling a
//! finished operation.

use crate::fd_manager::{fd_manager, TimeoutKind, NO_TIMEOUT};
use crate::reactor::{Event, IoManager};
use crate::{errno, set_errno};
use spindle_core::sp_error;
use spindle_runtime::scheduler::{Task, ANY_THREAD};
use spindle_runtime::{tls, Dispatch, Fiber};
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;

/// Whether the calling thread redirects blocking calls through the runtime.
#[inline]
pub fn enabled() -> bool {
    tls::hook_enabled()
}

/// Toggle redirection for the calling thread.
#[inline]
pub fn set_enabled(on: bool) {
    tls::set_hook_enabled(on);
}

/// Default timeout applied by [`connect`], milliseconds. NO_TIMEOUT = none.
static CONNECT_TIMEOUT_MS: AtomicU64 = AtomicU64::new(NO_TIMEOUT);

/// Set the process-wide connect timeout used by [`connect`].
pub fn set_connect_timeout(ms: u64) {
    CONNECT_TIMEOUT_MS.store(ms, Ordering::Release);
}

/// Per-call timeout record. The condition timer holds a weak reference;
/// `cancelled` carries the errno the parked call must fail with.
#[derive(Default)]
struct TimerInfo {
    cancelled: AtomicI32,
}

/// The shared retry/arm/park helper behind all byte-I/O entry points.
fn do_io<F>(fd: RawFd, name: &str, event: Event, tkind: TimeoutKind, raw: F) -> isize
where
    F: Fn() -> isize,
{
    if !tls::hook_enabled() {
        return raw();
    }
    let Some(ctx) = fd_manager().get(fd, false) else {
        return raw();
    };
    if ctx.is_closed() {
        set_errno(libc::EBADF);
        return -1;
    }
    if !ctx.is_socket() || ctx.user_nonblock() {
        return raw();
    }
    let Some(iom) = IoManager::current() else {
        // No reactor on this thread: behave like the un-hooked call on the
        // (kernel-nonblocking) socket.
        return raw();
    };

    let timeout = ctx.timeout(tkind);
    let tinfo = Arc::new(TimerInfo::default());

    loop {
        let mut n = raw();
        while n == -1 && errno() == libc::EINTR {
            n = raw();
        }
        if !(n == -1 && errno() == libc::EAGAIN) {
            return n;
        }

        // Would block: wake on readiness, or on the fd's timeout budget.
        let timer = if timeout != NO_TIMEOUT {
            let winfo = Arc::downgrade(&tinfo);
            let iom2 = iom.clone();
            Some(iom.add_condition_timer(
                timeout,
                move || {
                    let Some(t) = winfo.upgrade() else {
                        return;
                    };
                    if t.cancelled.load(Ordering::Acquire) != 0 {
                        return;
                    }
                    t.cancelled.store(libc::ETIMEDOUT, Ordering::Release);
                    iom2.cancel_event(fd, event);
                },
                Arc::downgrade(&tinfo),
                false,
            ))
        } else {
            None
        };

        if let Err(e) = iom.add_event(fd, event, None) {
            sp_error!("{}: add_event({}, {:?}) failed: {}", name, fd, event, e);
            if let Some(t) = &timer {
                t.cancel();
            }
            return -1;
        }

        Fiber::current().suspend();
        // Woken: either the fd is ready or the timer cancelled the wait.
        if let Some(t) = &timer {
            t.cancel();
        }
        let cancelled = tinfo.cancelled.load(Ordering::Acquire);
        if cancelled != 0 {
            set_errno(cancelled);
            return -1;
        }
    }
}

/// Park the current fiber for `ms`, rescheduling it through the reactor.
fn sleep_ms(ms: u64) {
    let Some(iom) = IoManager::current() else {
        std::thread::sleep(std::time::Duration::from_millis(ms));
        return;
    };
    let fiber = Fiber::current();
    let iom2 = iom.clone();
    let f = fiber.clone();
    iom.add_timer(
        ms,
        move || {
            iom2.schedule_task(Task::fiber(f.clone(), ANY_THREAD));
        },
        false,
    );
    fiber.suspend();
}

pub fn sleep(seconds: u32) -> u32 {
    if !tls::hook_enabled() {
        return unsafe { libc::sleep(seconds) };
    }
    sleep_ms(seconds as u64 * 1000);
    0
}

pub fn usleep(usec: u32) -> i32 {
    if !tls::hook_enabled() {
        return unsafe { libc::usleep(usec) };
    }
    sleep_ms(usec as u64 / 1000);
    0
}

pub fn nanosleep(req: &libc::timespec, rem: Option<&mut libc::timespec>) -> i32 {
    if !tls::hook_enabled() {
        let rem_ptr = rem.map_or(std::ptr::null_mut(), |r| r as *mut libc::timespec);
        return unsafe { libc::nanosleep(req, rem_ptr) };
    }
    let ms = req.tv_sec as u64 * 1000 + req.tv_nsec as u64 / 1_000_000;
    sleep_ms(ms);
    0
}

pub fn socket(domain: i32, ty: i32, protocol: i32) -> i32 {
    if !tls::hook_enabled() {
        return unsafe { libc::socket(domain, ty, protocol) };
    }
    let fd = unsafe { libc::socket(domain, ty, protocol) };
    if fd == -1 {
        sp_error!("socket({}, {}, {}) failed: errno {}", domain, ty, protocol, errno());
        return fd;
    }
    fd_manager().get(fd, true);
    fd
}

/// `connect` with an explicit timeout budget in milliseconds.
///
/// # Safety
///
/// `addr` must point to a valid socket address of length `addrlen`.
pub unsafe fn connect_with_timeout(
    fd: RawFd,
    addr: *const libc::sockaddr,
    addrlen: libc::socklen_t,
    timeout_ms: u64,
) -> i32 {
    if !tls::hook_enabled() {
        return libc::connect(fd, addr, addrlen);
    }
    let Some(ctx) = fd_manager().get(fd, false) else {
        set_errno(libc::EBADF);
        return -1;
    };
    if ctx.is_closed() {
        set_errno(libc::EBADF);
        return -1;
    }
    if !ctx.is_socket() || ctx.user_nonblock() {
        return libc::connect(fd, addr, addrlen);
    }

    let n = libc::connect(fd, addr, addrlen);
    if n == 0 {
        return 0;
    }
    if n != -1 || errno() != libc::EINPROGRESS {
        return n;
    }
    let Some(iom) = IoManager::current() else {
        return n;
    };

    let tinfo = Arc::new(TimerInfo::default());
    let timer = if timeout_ms != NO_TIMEOUT {
        let winfo = Arc::downgrade(&tinfo);
        let iom2 = iom.clone();
        Some(iom.add_condition_timer(
            timeout_ms,
            move || {
                let Some(t) = winfo.upgrade() else {
                    return;
                };
                if t.cancelled.load(Ordering::Acquire) != 0 {
                    return;
                }
                t.cancelled.store(libc::ETIMEDOUT, Ordering::Release);
                iom2.cancel_event(fd, Event::Write);
            },
            Arc::downgrade(&tinfo),
            false,
        ))
    } else {
        None
    };

    match iom.add_event(fd, Event::Write, None) {
        Ok(()) => {
            Fiber::current().suspend();
            if let Some(t) = &timer {
                t.cancel();
            }
            let cancelled = tinfo.cancelled.load(Ordering::Acquire);
            if cancelled != 0 {
                set_errno(cancelled);
                return -1;
            }
        }
        Err(e) => {
            if let Some(t) = &timer {
                t.cancel();
            }
            sp_error!("connect: add_event({}, WRITE) failed: {}", fd, e);
        }
    }

    // The socket is writable (or the wait failed): SO_ERROR decides.
    let mut error: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    if libc::getsockopt(
        fd,
        libc::SOL_SOCKET,
        libc::SO_ERROR,
        &mut error as *mut _ as *mut libc::c_void,
        &mut len,
    ) == -1
    {
        return -1;
    }
    if error == 0 {
        0
    } else {
        set_errno(error);
        -1
    }
}

/// # Safety
///
/// `addr` must point to a valid socket address of length `addrlen`.
pub unsafe fn connect(fd: RawFd, addr: *const libc::sockaddr, addrlen: libc::socklen_t) -> i32 {
    connect_with_timeout(fd, addr, addrlen, CONNECT_TIMEOUT_MS.load(Ordering::Acquire))
}

/// # Safety
///
/// `addr`/`addrlen`, when non-null, must be valid for the accepted peer
/// address to be written through.
pub unsafe fn accept(
    fd: RawFd,
    addr: *mut libc::sockaddr,
    addrlen: *mut libc::socklen_t,
) -> i32 {
    let n = do_io(fd, "accept", Event::Read, TimeoutKind::Recv, || unsafe {
        libc::accept(fd, addr, addrlen) as isize
    });
    if n >= 0 && tls::hook_enabled() {
        fd_manager().get(n as RawFd, true);
    }
    n as i32
}

pub fn read(fd: RawFd, buf: &mut [u8]) -> isize {
    let ptr = buf.as_mut_ptr() as *mut libc::c_void;
    let len = buf.len();
    do_io(fd, "read", Event::Read, TimeoutKind::Recv, move || unsafe {
        libc::read(fd, ptr, len)
    })
}

/// # Safety
///
/// `iov` must point to `iovcnt` valid iovec entries.
pub unsafe fn readv(fd: RawFd, iov: *const libc::iovec, iovcnt: i32) -> isize {
    do_io(fd, "readv", Event::Read, TimeoutKind::Recv, move || unsafe {
        libc::readv(fd, iov, iovcnt)
    })
}

pub fn recv(fd: RawFd, buf: &mut [u8], flags: i32) -> isize {
    let ptr = buf.as_mut_ptr() as *mut libc::c_void;
    let len = buf.len();
    do_io(fd, "recv", Event::Read, TimeoutKind::Recv, move || unsafe {
        libc::recv(fd, ptr, len, flags)
    })
}

/// # Safety
///
/// `src_addr`/`addrlen`, when non-null, must be valid to write the sender
/// address through.
pub unsafe fn recvfrom(
    fd: RawFd,
    buf: &mut [u8],
    flags: i32,
    src_addr: *mut libc::sockaddr,
    addrlen: *mut libc::socklen_t,
) -> isize {
    let ptr = buf.as_mut_ptr() as *mut libc::c_void;
    let len = buf.len();
    do_io(fd, "recvfrom", Event::Read, TimeoutKind::Recv, move || unsafe {
        libc::recvfrom(fd, ptr, len, flags, src_addr, addrlen)
    })
}

/// # Safety
///
/// `msg` must point to a valid msghdr whose buffers are writable.
pub unsafe fn recvmsg(fd: RawFd, msg: *mut libc::msghdr, flags: i32) -> isize {
    do_io(fd, "recvmsg", Event::Read, TimeoutKind::Recv, move || unsafe {
        libc::recvmsg(fd, msg, flags)
    })
}

pub fn write(fd: RawFd, buf: &[u8]) -> isize {
    let ptr = buf.as_ptr() as *const libc::c_void;
    let len = buf.len();
    do_io(fd, "write", Event::Write, TimeoutKind::Send, move || unsafe {
        libc::write(fd, ptr, len)
    })
}

/// # Safety
///
/// `iov` must point to `iovcnt` valid iovec entries.
pub unsafe fn writev(fd: RawFd, iov: *const libc::iovec, iovcnt: i32) -> isize {
    do_io(fd, "writev", Event::Write, TimeoutKind::Send, move || unsafe {
        libc::writev(fd, iov, iovcnt)
    })
}

pub fn send(fd: RawFd, buf: &[u8], flags: i32) -> isize {
    let ptr = buf.as_ptr() as *const libc::c_void;
    let len = buf.len();
    do_io(fd, "send", Event::Write, TimeoutKind::Send, move || unsafe {
        libc::send(fd, ptr, len, flags)
    })
}

/// # Safety
///
/// `dest_addr` must point to a valid socket address of length `addrlen`.
pub unsafe fn sendto(
    fd: RawFd,
    buf: &[u8],
    flags: i32,
    dest_addr: *const libc::sockaddr,
    addrlen: libc::socklen_t,
) -> isize {
    let ptr = buf.as_ptr() as *const libc::c_void;
    let len = buf.len();
    do_io(fd, "sendto", Event::Write, TimeoutKind::Send, move || unsafe {
        libc::sendto(fd, ptr, len, flags, dest_addr, addrlen)
    })
}

/// # Safety
///
/// `msg` must point to a valid msghdr whose buffers are readable.
pub unsafe fn sendmsg(fd: RawFd, msg: *const libc::msghdr, flags: i32) -> isize {
    do_io(fd, "sendmsg", Event::Write, TimeoutKind::Send, move || unsafe {
        libc::sendmsg(fd, msg, flags)
    })
}

/// Close the fd: fire any waiters still parked on it (they observe the
/// close from their retried syscall), drop its runtime metadata, then
/// close for real.
pub fn close(fd: RawFd) -> i32 {
    if !tls::hook_enabled() {
        return unsafe { libc::close(fd) };
    }
    if fd_manager().get(fd, false).is_some() {
        if let Some(iom) = IoManager::current() {
            iom.cancel_all(fd);
        }
        fd_manager().del(fd);
    }
    unsafe { libc::close(fd) }
}

/// `fcntl` for the int-argument commands.
///
/// `F_SETFL` records the application's O_NONBLOCK wish while keeping the
/// socket kernel-nonblocking; `F_GETFL` reports the application's wish
/// back. Everything else passes through.
pub fn fcntl(fd: RawFd, cmd: i32, arg: libc::c_long) -> i32 {
    match cmd {
        libc::F_SETFL => {
            let mut flags = arg as i32;
            match fd_manager().get(fd, false) {
                Some(ctx) if !ctx.is_closed() && ctx.is_socket() => {
                    ctx.set_user_nonblock(flags & libc::O_NONBLOCK != 0);
                    if ctx.sys_nonblock() {
                        flags |= libc::O_NONBLOCK;
                    } else {
                        flags &= !libc::O_NONBLOCK;
                    }
                    unsafe { libc::fcntl(fd, cmd, flags) }
                }
                _ => unsafe { libc::fcntl(fd, cmd, arg as i32) },
            }
        }
        libc::F_GETFL => {
            let flags = unsafe { libc::fcntl(fd, cmd) };
            match fd_manager().get(fd, false) {
                Some(ctx) if !ctx.is_closed() && ctx.is_socket() => {
                    if ctx.user_nonblock() {
                        flags | libc::O_NONBLOCK
                    } else {
                        flags & !libc::O_NONBLOCK
                    }
                }
                _ => flags,
            }
        }
        _ => unsafe { libc::fcntl(fd, cmd, arg) },
    }
}

/// `ioctl`. `FIONBIO` updates the application-visible non-blocking flag
/// like `F_SETFL` does.
///
/// # Safety
///
/// `arg` must be valid for the given request.
pub unsafe fn ioctl(fd: RawFd, request: libc::c_ulong, arg: *mut libc::c_void) -> i32 {
    if request == libc::FIONBIO {
        let user_nonblock = *(arg as *const libc::c_int) != 0;
        if let Some(ctx) = fd_manager().get(fd, false) {
            if !ctx.is_closed() && ctx.is_socket() {
                ctx.set_user_nonblock(user_nonblock);
            }
        }
    }
    libc::ioctl(fd, request, arg)
}

/// # Safety
///
/// `optval`/`optlen` must be valid for the requested option.
pub unsafe fn getsockopt(
    fd: RawFd,
    level: i32,
    optname: i32,
    optval: *mut libc::c_void,
    optlen: *mut libc::socklen_t,
) -> i32 {
    libc::getsockopt(fd, level, optname, optval, optlen)
}

/// `setsockopt`. SO_RCVTIMEO / SO_SNDTIMEO are recorded as the fd's
/// cooperative timeout budget and still forwarded to the kernel.
///
/// # Safety
///
/// `optval` must point to `optlen` valid bytes for the option.
pub unsafe fn setsockopt(
    fd: RawFd,
    level: i32,
    optname: i32,
    optval: *const libc::c_void,
    optlen: libc::socklen_t,
) -> i32 {
    if tls::hook_enabled()
        && level == libc::SOL_SOCKET
        && (optname == libc::SO_RCVTIMEO || optname == libc::SO_SNDTIMEO)
    {
        if let Some(ctx) = fd_manager().get(fd, false) {
            let tv = &*(optval as *const libc::timeval);
            let ms = tv.tv_sec as u64 * 1000 + tv.tv_usec as u64 / 1000;
            let kind = if optname == libc::SO_RCVTIMEO {
                TimeoutKind::Recv
            } else {
                TimeoutKind::Send
            };
            ctx.set_timeout(kind, ms);
        }
    }
    libc::setsockopt(fd, level, optname, optval, optlen)
}

#[cfg(test)]
mod tests {
    use super::*;
    use spindle_core::SpinLock;
    use std::io::{Read as _, Write as _};
    use std::net::TcpListener;
    use std::sync::atomic::AtomicBool;
    use std::time::{Duration, Instant};

    fn sockaddr_v4(port: u16) -> libc::sockaddr_in {
        let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
        addr.sin_family = libc::AF_INET as libc::sa_family_t;
        addr.sin_port = port.to_be();
        addr.sin_addr = libc::in_addr {
            s_addr: u32::from(std::net::Ipv4Addr::LOCALHOST).to_be(),
        };
        addr
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
    fn test_send_recv_through_reactor() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = std::thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            // Hold the reply back so the client's first recv sees EAGAIN
            // and has to park.
            std::thread::sleep(Duration::from_millis(50));
            let mut buf = [0u8; 4];
            conn.read_exact(&mut buf).unwrap();
            assert_eq!(&buf, b"PING");
            conn.write_all(b"PONG").unwrap();
        });

        let iom = IoManager::new(2, false, "hook-echo").unwrap();
        let outcome = Arc::new(SpinLock::new(None::<(i32, isize, isize, [u8; 4])>));
        let done = Arc::new(AtomicBool::new(false));

        let o = Arc::clone(&outcome);
        let d = Arc::clone(&done);
        iom.schedule_task(Task::call(
            move || {
                let fd = socket(libc::AF_INET, libc::SOCK_STREAM, 0);
                let addr = sockaddr_v4(port);
                let rc = unsafe {
                    connect(
                        fd,
                        &addr as *const _ as *const libc::sockaddr,
                        std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
                    )
                };
                let sent = send(fd, b"PING", 0);
                let mut buf = [0u8; 4];
                let n = recv(fd, &mut buf, 0);
                close(fd);
                *o.lock() = Some((rc, sent, n, buf));
                d.store(true, Ordering::Release);
            },
            ANY_THREAD,
        ));

        assert!(wait_for(|| done.load(Ordering::Acquire), 5000));
        let (rc, sent, n, buf) = outcome.lock().take().unwrap();
        assert_eq!(rc, 0);
        assert_eq!(sent, 4);
        assert_eq!(n, 4);
        assert_eq!(&buf, b"PONG");

        server.join().unwrap();
        iom.stop();
    }

    #[test]
    fn test_recv_timeout_is_etimedout_within_window() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = std::thread::spawn(move || {
            // Accept and go silent: the client must time out on its own.
            let (_conn, _) = listener.accept().unwrap();
            std::thread::sleep(Duration::from_millis(800));
        });

        let iom = IoManager::new(2, false, "hook-timeout").unwrap();
        let outcome = Arc::new(SpinLock::new(None::<(i32, i32, isize, i32, Duration)>));

        let o = Arc::clone(&outcome);
        iom.schedule_task(Task::call(
            move || {
                let fd = socket(libc::AF_INET, libc::SOCK_STREAM, 0);
                let addr = sockaddr_v4(port);
                let rc = unsafe {
                    connect(
                        fd,
                        &addr as *const _ as *const libc::sockaddr,
                        std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
                    )
                };
                let tv = libc::timeval {
                    tv_sec: 0,
                    tv_usec: 200_000,
                };
                let so = unsafe {
                    setsockopt(
                        fd,
                        libc::SOL_SOCKET,
                        libc::SO_RCVTIMEO,
                        &tv as *const _ as *const libc::c_void,
                        std::mem::size_of::<libc::timeval>() as libc::socklen_t,
                    )
                };
                let t0 = Instant::now();
                let mut buf = [0u8; 8];
                let n = recv(fd, &mut buf, 0);
                let err = crate::errno();
                let elapsed = t0.elapsed();
                close(fd);
                *o.lock() = Some((rc, so, n, err, elapsed));
            },
            ANY_THREAD,
        ));

        assert!(wait_for(|| outcome.lock().is_some(), 3000));
        let (rc, so, n, err, elapsed) = outcome.lock().take().unwrap();
        assert_eq!(rc, 0);
        assert_eq!(so, 0);
        assert_eq!(n, -1);
        assert_eq!(err, libc::ETIMEDOUT);
        assert!(
            elapsed >= Duration::from_millis(180) && elapsed <= Duration::from_millis(400),
            "timed out after {:?}",
            elapsed
        );

        server.join().unwrap();
        iom.stop();
    }

    #[test]
    fn test_usleep_suspends_for_the_duration() {
        let iom = IoManager::new(2, false, "hook-sleep").unwrap();
        let elapsed = Arc::new(SpinLock::new(None::<Duration>));

        let e = Arc::clone(&elapsed);
        iom.schedule_task(Task::call(
            move || {
                let t0 = Instant::now();
                usleep(200_000);
                *e.lock() = Some(t0.elapsed());
            },
            ANY_THREAD,
        ));

        assert!(wait_for(|| elapsed.lock().is_some(), 3000));
        let elapsed = elapsed.lock().take().unwrap();
        assert!(
            elapsed >= Duration::from_millis(180) && elapsed <= Duration::from_millis(600),
            "slept {:?}",
            elapsed
        );
        iom.stop();
    }

    #[test]
    fn test_fcntl_keeps_user_nonblock_illusion() {
        set_enabled(true);
        let fd = socket(libc::AF_INET, libc::SOCK_STREAM, 0);
        assert!(fd >= 0);

        // The kernel flag is set, the application-visible one is not.
        let kernel = unsafe { libc::fcntl(fd, libc::F_GETFL) };
        assert_ne!(kernel & libc::O_NONBLOCK, 0);
        let seen = fcntl(fd, libc::F_GETFL, 0);
        assert_eq!(seen & libc::O_NONBLOCK, 0);

        // Asking for non-blocking is reflected back.
        assert_ne!(fcntl(fd, libc::F_SETFL, (seen | libc::O_NONBLOCK) as libc::c_long), -1);
        assert_ne!(fcntl(fd, libc::F_GETFL, 0) & libc::O_NONBLOCK, 0);

        // FIONBIO steers the same flag.
        let mut off: libc::c_int = 0;
        let rc = unsafe { ioctl(fd, libc::FIONBIO, &mut off as *mut _ as *mut libc::c_void) };
        assert_eq!(rc, 0);
        assert_eq!(fcntl(fd, libc::F_GETFL, 0) & libc::O_NONBLOCK, 0);

        close(fd);
        set_enabled(false);
    }

    #[test]
    fn test_unhooked_thread_passes_through() {
        assert!(!enabled());
        let fd = socket(libc::AF_INET, libc::SOCK_DGRAM, 0);
        assert!(fd >= 0);
        // Without the hook no context is registered for the fd.
        assert!(fd_manager().get(fd, false).is_none());
        close(fd);
    }
}

