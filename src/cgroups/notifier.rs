//! Event notifier
//!
//! cgroups expose a notification API based on eventfd: userspace creates an
//! eventfd, opens the control file it wants events for (e.g.
//! `memory.oom_control`) and writes `"<eventfd> <control fd> [args]"` into
//! `cgroup.event_control`. The kernel then posts events by incrementing the
//! eventfd counter, which makes an 8-byte read on the eventfd succeed.
//!
//! [`listen`] packages this into a one-shot async completion. The life of a
//! listener:
//!
//! ```text
//! Idle -> Armed      registration written to cgroup.event_control
//! Armed -> Delivered 8-byte read succeeds; future resolves with the counter
//! Armed -> Failed    any I/O error; future resolves with the error
//! Armed -> Cancelled caller dropped the future; nothing is delivered
//! ```
//!
//! The eventfd is owned by the future and closed exactly once on any of the
//! terminal transitions (delivery, failure, or drop).

use std::fs;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::Path;

use tokio::io::unix::AsyncFd;
use tokio::io::Interest;

use crate::error::{CgroupError, Result};

use super::{control_path, verify, write_control};

/// Create a non-blocking, close-on-exec eventfd.
///
/// Prefers the `eventfd2` syscall; on kernels predating it (ENOSYS) falls
/// back to plain `eventfd` and sets CLOEXEC/NONBLOCK through `fcntl`.
fn eventfd(initval: libc::c_uint, flags: libc::c_int) -> io::Result<OwnedFd> {
    let fd = unsafe { libc::syscall(libc::SYS_eventfd2, initval, flags) };
    if fd >= 0 {
        return Ok(unsafe { OwnedFd::from_raw_fd(fd as RawFd) });
    }

    let error = io::Error::last_os_error();
    if error.raw_os_error() != Some(libc::ENOSYS) {
        return Err(error);
    }

    eventfd_fallback(initval, flags)
}

#[cfg(any(target_arch = "x86_64", target_arch = "x86"))]
fn eventfd_fallback(initval: libc::c_uint, flags: libc::c_int) -> io::Result<OwnedFd> {
    let fd = unsafe { libc::syscall(libc::SYS_eventfd, initval) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    let fd = unsafe { OwnedFd::from_raw_fd(fd as RawFd) };

    if flags & libc::EFD_CLOEXEC != 0
        && unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETFD, libc::FD_CLOEXEC) } < 0
    {
        return Err(io::Error::last_os_error());
    }
    if flags & libc::EFD_NONBLOCK != 0
        && unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETFL, libc::O_NONBLOCK) } < 0
    {
        return Err(io::Error::last_os_error());
    }

    Ok(fd)
}

// Architectures newer than eventfd2 never shipped the old syscall.
#[cfg(not(any(target_arch = "x86_64", target_arch = "x86")))]
fn eventfd_fallback(_initval: libc::c_uint, _flags: libc::c_int) -> io::Result<OwnedFd> {
    Err(io::Error::from_raw_os_error(libc::ENOSYS))
}

/// Register an eventfd notifier for the given control file. Returns the
/// armed eventfd; the control fd is only needed during registration and is
/// closed before returning.
fn register_notifier(
    hierarchy: &Path,
    cgroup: &str,
    control: &str,
    args: Option<&str>,
) -> Result<OwnedFd> {
    let efd = eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK)
        .map_err(|e| CgroupError::io("create an eventfd", e))?;

    let path = control_path(hierarchy, cgroup, control);
    let cfile = fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(&path)
        .map_err(|e| CgroupError::io(format!("open {}", path.display()), e))?;

    let mut line = format!("{} {}", efd.as_raw_fd(), cfile.as_raw_fd());
    if let Some(args) = args {
        line.push(' ');
        line.push_str(args);
    }
    write_control(hierarchy, cgroup, "cgroup.event_control", &line)?;

    // cfile drops here; the kernel keeps its own reference to the control.
    Ok(efd)
}

/// Wait for the next event on a cgroup control file.
///
/// One-shot: the returned future resolves with the 64-bit event counter the
/// first time the kernel posts an event, or with an error. Dropping the
/// future cancels the listener and closes the eventfd; no event is delivered
/// after cancellation.
///
/// `args` are control-specific registration arguments (e.g. a threshold for
/// `memory.usage_in_bytes`); OOM listening passes none.
pub async fn listen(
    hierarchy: &Path,
    cgroup: &str,
    control: &str,
    args: Option<&str>,
) -> Result<u64> {
    verify(hierarchy, Some(cgroup), Some(control))?;

    let efd = register_notifier(hierarchy, cgroup, control, args)?;
    let afd = AsyncFd::with_interest(efd, Interest::READABLE)
        .map_err(|e| CgroupError::io("register eventfd with the runtime", e))?;

    loop {
        let mut guard = afd
            .readable()
            .await
            .map_err(|e| CgroupError::io("poll eventfd", e))?;

        match guard.try_io(|inner| {
            let mut buf = [0u8; 8];
            let n = unsafe {
                libc::read(
                    inner.get_ref().as_raw_fd(),
                    buf.as_mut_ptr().cast(),
                    buf.len(),
                )
            };
            if n < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok((n as usize, buf))
        }) {
            Ok(Ok((n, buf))) => {
                if n != std::mem::size_of::<u64>() {
                    return Err(CgroupError::Parse(format!(
                        "read {n} bytes from eventfd, expected 8"
                    )));
                }
                return Ok(u64::from_ne_bytes(buf));
            }
            Ok(Err(e)) => return Err(CgroupError::io("read eventfd", e)),
            // Spurious readiness; wait again.
            Err(_would_block) => continue,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eventfd_is_nonblocking() {
        let efd = eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK).unwrap();

        // Counter is zero; a read must fail with EAGAIN instead of blocking.
        let mut buf = [0u8; 8];
        let n = unsafe { libc::read(efd.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len()) };
        assert_eq!(n, -1);
        assert_eq!(
            io::Error::last_os_error().raw_os_error(),
            Some(libc::EAGAIN)
        );
    }

    #[tokio::test]
    async fn eventfd_read_returns_counter() {
        let efd = eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK).unwrap();

        // Simulate the kernel posting an event by adding to the counter.
        let value: u64 = 3;
        let n = unsafe {
            libc::write(
                efd.as_raw_fd(),
                value.to_ne_bytes().as_ptr().cast(),
                std::mem::size_of::<u64>(),
            )
        };
        assert_eq!(n, 8);

        let afd = AsyncFd::with_interest(efd, Interest::READABLE).unwrap();
        let mut guard = afd.readable().await.unwrap();
        let (n, buf) = guard
            .try_io(|inner| {
                let mut buf = [0u8; 8];
                let n = unsafe {
                    libc::read(inner.get_ref().as_raw_fd(), buf.as_mut_ptr().cast(), buf.len())
                };
                if n < 0 {
                    return Err(io::Error::last_os_error());
                }
                Ok((n as usize, buf))
            })
            .unwrap()
            .unwrap();

        assert_eq!(n, 8);
        assert_eq!(u64::from_ne_bytes(buf), 3);
    }
}
