//! Thin wrappers over the Linux primitives the reactor is built on.

use std::io;
use std::os::unix::io::RawFd;

macro_rules! syscall {
    ($fn: ident ( $($arg: expr),* $(,)* ) ) => {{
        let res = unsafe { libc::$fn($($arg, )*) };
        if res == -1 {
            Err(std::io::Error::last_os_error())
        } else {
            Ok(res)
        }
    }};
}

pub mod epoll;
pub mod eventfd;
pub mod fd;
pub mod socket;
pub mod timerfd;

/// Vectored read scattering into two buffers with a single syscall.
pub fn readv2(fd: RawFd, first: &mut [u8], second: &mut [u8]) -> io::Result<usize> {
    let mut iov = [
        libc::iovec {
            iov_base: first.as_mut_ptr() as *mut libc::c_void,
            iov_len: first.len(),
        },
        libc::iovec {
            iov_base: second.as_mut_ptr() as *mut libc::c_void,
            iov_len: second.len(),
        },
    ];

    let n = syscall!(readv(fd, iov.as_mut_ptr(), 2))?;
    Ok(n as usize)
}
