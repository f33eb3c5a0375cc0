use crate::error_utilities::{log_last_os_err, log_ret_last_os_err};
use std::{
    io, mem,
    os::unix::prelude::{AsRawFd, RawFd},
};
#[cfg(test)]
use tokio::io::unix::AsyncFd;

/// Nonblocking `eventfd` wrapper, the readiness source of loopback channels
#[derive(Debug)]
pub(crate) struct EventFd {
    /// The owned fd
    fd: RawFd,
}

impl EventFd {
    /// Create a new nonblocking, close-on-exec `EventFd`
    pub(crate) fn new() -> io::Result<Self> {
        // SAFETY: ffi
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0_i32 {
            return Err(log_ret_last_os_err());
        }
        Ok(Self { fd })
    }

    /// Make the fd readable
    pub(crate) fn notify(&self) -> io::Result<()> {
        let one = 1_u64;
        // SAFETY: ffi, writes exactly 8 bytes from a live u64
        let ret = unsafe {
            libc::write(
                self.fd,
                (&one as *const u64).cast(),
                mem::size_of::<u64>(),
            )
        };
        if ret < 0 {
            return Err(log_ret_last_os_err());
        }
        Ok(())
    }

    /// Reset the counter so the fd is no longer readable
    pub(crate) fn drain(&self) -> io::Result<()> {
        let mut counter = 0_u64;
        // SAFETY: ffi, reads exactly 8 bytes into a live u64
        let ret = unsafe {
            libc::read(
                self.fd,
                (&mut counter as *mut u64).cast(),
                mem::size_of::<u64>(),
            )
        };
        if ret < 0 {
            let err = errno::errno();
            if err.0 == libc::EAGAIN {
                return Ok(());
            }
            return Err(io::Error::from_raw_os_error(err.0));
        }
        Ok(())
    }

    /// Get the fd and wrap it into Tokio `AsyncFd`
    #[cfg(test)]
    pub(crate) fn async_fd(&self) -> io::Result<AsyncFd<RawFd>> {
        AsyncFd::new(self.fd)
    }
}

impl AsRawFd for EventFd {
    #[inline]
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for EventFd {
    fn drop(&mut self) {
        // SAFETY: ffi, the fd is owned
        let ret = unsafe { libc::close(self.fd) };
        if ret != 0_i32 {
            log_last_os_err();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notify_then_drain() {
        let efd = EventFd::new().unwrap();
        efd.notify().unwrap();
        efd.notify().unwrap();
        efd.drain().unwrap();
        // nothing left, the nonblocking read reports EAGAIN which is swallowed
        efd.drain().unwrap();
    }

    #[tokio::test]
    async fn readable_after_notify() {
        let efd = EventFd::new().unwrap();
        let async_fd = efd.async_fd().unwrap();
        efd.notify().unwrap();
        let mut guard = async_fd.readable().await.unwrap();
        guard.clear_ready();
        efd.drain().unwrap();
    }
}
