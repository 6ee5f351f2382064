use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;
use std::{cmp, fmt};

use libc::{EPOLLERR, EPOLLHUP, EPOLLIN, EPOLLOUT, EPOLLPRI, EPOLLRDHUP};

use crate::ready::Ready;

/// Level-triggered epoll instance.
pub struct Epoll {
    epfd: RawFd,
}

impl Epoll {
    pub fn new() -> io::Result<Epoll> {
        let epfd = syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?;
        Ok(Epoll { epfd })
    }

    /// Waits for readiness, filling `events` up to its capacity. `None`
    /// blocks indefinitely.
    pub fn wait(
        &self,
        events: &mut Vec<libc::epoll_event>,
        timeout: Option<Duration>,
    ) -> io::Result<usize> {
        let timeout = timeout
            .map(|to| cmp::min(to.as_millis(), libc::c_int::MAX as u128) as libc::c_int)
            .unwrap_or(-1);

        events.clear();
        let cnt = syscall!(epoll_wait(
            self.epfd,
            events.as_mut_ptr(),
            events.capacity() as i32,
            timeout
        ))?;

        unsafe { events.set_len(cnt as usize) };

        Ok(cnt as usize)
    }

    pub fn add(&self, fd: RawFd, token: u64, interest: Ready) -> io::Result<()> {
        let mut info = libc::epoll_event {
            events: interest_to_epoll(interest),
            u64: token,
        };

        syscall!(epoll_ctl(self.epfd, libc::EPOLL_CTL_ADD, fd, &mut info))?;
        Ok(())
    }

    pub fn modify(&self, fd: RawFd, token: u64, interest: Ready) -> io::Result<()> {
        let mut info = libc::epoll_event {
            events: interest_to_epoll(interest),
            u64: token,
        };

        syscall!(epoll_ctl(self.epfd, libc::EPOLL_CTL_MOD, fd, &mut info))?;
        Ok(())
    }

    pub fn delete(&self, fd: RawFd) -> io::Result<()> {
        let mut info = libc::epoll_event { events: 0, u64: 0 };

        syscall!(epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, &mut info))?;
        Ok(())
    }
}

fn interest_to_epoll(interest: Ready) -> u32 {
    let mut kind = 0;

    if interest.is_readable() {
        kind |= EPOLLIN | EPOLLPRI;
    }

    if interest.is_writable() {
        kind |= EPOLLOUT;
    }

    kind as u32
}

/// Maps a kernel event mask back onto [`Ready`]. `EPOLLRDHUP` counts as
/// readable so a half-closed peer is observed as a zero-byte read.
pub fn epoll_to_ready(events: u32) -> Ready {
    let events = events as libc::c_int;
    let mut kind = Ready::empty();

    if (events & EPOLLIN) != 0 || (events & EPOLLPRI) != 0 || (events & EPOLLRDHUP) != 0 {
        kind = kind | Ready::readable();
    }

    if (events & EPOLLOUT) != 0 {
        kind = kind | Ready::writable();
    }

    if (events & EPOLLERR) != 0 {
        kind = kind | Ready::error();
    }

    if (events & EPOLLHUP) != 0 {
        kind = kind | Ready::hup();
    }

    kind
}

impl AsRawFd for Epoll {
    fn as_raw_fd(&self) -> RawFd {
        self.epfd
    }
}

impl Drop for Epoll {
    fn drop(&mut self) {
        unsafe {
            let _ = libc::close(self.epfd);
        }
    }
}

impl fmt::Debug for Epoll {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "Epoll({})", self.epfd)
    }
}
