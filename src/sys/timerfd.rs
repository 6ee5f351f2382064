use std::io::{self, Read};
use std::mem;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

use super::fd::FileDesc;

/// A non-blocking `CLOCK_MONOTONIC` timerfd. Expirations surface as
/// readability, so a timer enters an event loop like any other descriptor.
#[derive(Debug)]
pub struct TimerFd {
    inner: FileDesc,
}

impl TimerFd {
    pub fn new() -> io::Result<TimerFd> {
        let flags = libc::TFD_CLOEXEC | libc::TFD_NONBLOCK;
        let timerfd = syscall!(timerfd_create(libc::CLOCK_MONOTONIC, flags))?;
        Ok(TimerFd {
            inner: unsafe { FileDesc::new(timerfd) },
        })
    }

    /// Arms a one-shot expiration `value` from now. A zero `value` would
    /// disarm the timer, so callers must clamp it beforehand.
    pub fn arm(&self, value: Duration) -> io::Result<()> {
        self.settime(value)
    }

    pub fn disarm(&self) -> io::Result<()> {
        self.settime(Duration::ZERO)
    }

    fn settime(&self, value: Duration) -> io::Result<()> {
        let new_value = libc::itimerspec {
            it_interval: duration_to_timespec(Duration::ZERO),
            it_value: duration_to_timespec(value),
        };

        let mut old_value: libc::itimerspec = unsafe { mem::zeroed() };

        syscall!(timerfd_settime(
            self.inner.as_raw_fd(),
            0,
            &new_value,
            &mut old_value
        ))?;

        Ok(())
    }

    /// Returns the number of expirations since the last read.
    pub fn read(&self) -> io::Result<u64> {
        let mut buf = [0u8; 8];
        (&self.inner).read_exact(&mut buf)?;
        Ok(u64::from_ne_bytes(buf))
    }
}

fn duration_to_timespec(duration: Duration) -> libc::timespec {
    libc::timespec {
        tv_sec: duration.as_secs() as libc::time_t,
        tv_nsec: duration.subsec_nanos() as libc::c_long,
    }
}

impl AsRawFd for TimerFd {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}
