//! TCP echo server on the spindle runtime.
//!
//! One fiber accepts connections; every connection gets its own fiber that
//! reads and writes through the cooperative syscall layer. Blocking-style
//! code, fiber-level concurrency.
//!
//! ```text
//! $ echo [port]          # default 8089
//! $ nc 127.0.0.1 8089
//! ```

use anyhow::{bail, Context, Result};
use spindle::{hook, Dispatch, IoManager, Task, ANY_THREAD};
use std::sync::Arc;

fn main() -> Result<()> {
    let port: u16 = std::env::args()
        .nth(1)
        .map(|p| p.parse())
        .transpose()
        .context("port must be a number")?
        .unwrap_or(8089);

    let listener = bind_listener(port)?;
    eprintln!("echo: listening on 0.0.0.0:{port}");

    let iom = IoManager::new(4, true, "echo").context("starting reactor")?;
    let accept_iom = iom.clone();
    iom.schedule_task(Task::call(
        move || accept_loop(accept_iom, listener),
        ANY_THREAD,
    ));

    // The caller joins the worker pool here and keeps dispatching while the
    // accept waiter is armed; this only returns once the accept loop dies.
    iom.stop();
    Ok(())
}

/// Plain socket setup; the accept path goes through the hook layer.
fn bind_listener(port: u16) -> Result<i32> {
    let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0) };
    if fd < 0 {
        bail!("socket: {}", std::io::Error::last_os_error());
    }

    let opt: libc::c_int = 1;
    unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &opt as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }

    let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    addr.sin_family = libc::AF_INET as libc::sa_family_t;
    addr.sin_port = port.to_be();
    addr.sin_addr.s_addr = libc::INADDR_ANY.to_be();

    let rc = unsafe {
        libc::bind(
            fd,
            &addr as *const _ as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        bail!("bind: {}", std::io::Error::last_os_error());
    }
    if unsafe { libc::listen(fd, 1024) } != 0 {
        bail!("listen: {}", std::io::Error::last_os_error());
    }
    Ok(fd)
}

fn accept_loop(iom: Arc<IoManager>, listener: i32) {
    // Register the pre-made listener with the runtime so accept() parks
    // instead of spinning.
    spindle::fd_manager().get(listener, true);

    loop {
        let conn = unsafe { hook::accept(listener, std::ptr::null_mut(), std::ptr::null_mut()) };
        if conn < 0 {
            eprintln!("echo: accept: {}", std::io::Error::last_os_error());
            break;
        }
        iom.schedule_task(Task::call(move || echo_connection(conn), ANY_THREAD));
    }
}

fn echo_connection(fd: i32) {
    let mut buf = [0u8; 4096];
    loop {
        let n = hook::recv(fd, &mut buf, 0);
        if n <= 0 {
            break;
        }
        let mut off = 0usize;
        while off < n as usize {
            let m = hook::send(fd, &buf[off..n as usize], 0);
            if m <= 0 {
                hook::close(fd);
                return;
            }
            off += m as usize;
        }
    }
    hook::close(fd);
}
