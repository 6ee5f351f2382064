use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};

use super::fd::FileDesc;

/// A non-blocking eventfd counter, used to interrupt a blocked epoll wait.
#[derive(Debug)]
pub struct EventFd {
    inner: FileDesc,
}

impl EventFd {
    /// Create an eventfd with initval 0 and `EFD_CLOEXEC | EFD_NONBLOCK`.
    pub fn new() -> io::Result<EventFd> {
        let flags = libc::EFD_CLOEXEC | libc::EFD_NONBLOCK;
        let eventfd = syscall!(eventfd(0, flags))?;
        Ok(EventFd {
            inner: unsafe { FileDesc::new(eventfd) },
        })
    }

    /// Reads and resets the counter.
    pub fn read(&self) -> io::Result<u64> {
        let mut buf = [0u8; 8];
        (&self.inner).read_exact(&mut buf)?;
        Ok(u64::from_ne_bytes(buf))
    }

    /// Adds `val` to the counter, waking any waiter.
    pub fn write(&self, val: u64) -> io::Result<()> {
        let buf: [u8; 8] = val.to_ne_bytes();
        (&self.inner).write_all(&buf)?;
        Ok(())
    }
}

impl AsRawFd for EventFd {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}
