use std::io::{self, Error, ErrorKind, Read, Write};
use std::mem;
use std::net::{SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::unix::io::{AsRawFd, IntoRawFd, RawFd};

use libc::{c_int, c_void, socklen_t};

use super::fd::FileDesc;

fn setsockopt<T>(sock: &Socket, level: c_int, name: c_int, payload: T) -> io::Result<()> {
    let payload = &payload as *const T as *const c_void;
    syscall!(setsockopt(
        sock.as_raw_fd(),
        level,
        name,
        payload,
        mem::size_of::<T>() as socklen_t
    ))?;
    Ok(())
}

fn getsockopt<T: Copy>(sock: &Socket, level: c_int, name: c_int) -> io::Result<T> {
    let mut slot: T = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<T>() as socklen_t;
    syscall!(getsockopt(
        sock.as_raw_fd(),
        level,
        name,
        &mut slot as *mut _ as *mut _,
        &mut len
    ))?;
    assert_eq!(len as usize, mem::size_of::<T>());
    Ok(slot)
}

pub fn sockaddr_to_addr(storage: &libc::sockaddr_storage, len: usize) -> io::Result<SocketAddr> {
    match storage.ss_family as c_int {
        libc::AF_INET => {
            assert!(len >= mem::size_of::<libc::sockaddr_in>());
            let addr = unsafe { *(storage as *const _ as *const libc::sockaddr_in) };
            let ip = u32::from_be(addr.sin_addr.s_addr);
            Ok(SocketAddr::V4(SocketAddrV4::new(
                ip.into(),
                u16::from_be(addr.sin_port),
            )))
        }
        libc::AF_INET6 => {
            assert!(len >= mem::size_of::<libc::sockaddr_in6>());
            let addr = unsafe { *(storage as *const _ as *const libc::sockaddr_in6) };
            Ok(SocketAddr::V6(SocketAddrV6::new(
                addr.sin6_addr.s6_addr.into(),
                u16::from_be(addr.sin6_port),
                u32::from_be(addr.sin6_flowinfo),
                addr.sin6_scope_id,
            )))
        }
        _ => Err(Error::new(ErrorKind::InvalidInput, "invalid address family")),
    }
}

fn addr_to_sockaddr(addr: &SocketAddr) -> (libc::sockaddr_storage, socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let len = match addr {
        SocketAddr::V4(a) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: a.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from(*a.ip()).to_be(),
                },
                sin_zero: [0; 8],
            };
            unsafe { *(&mut storage as *mut _ as *mut libc::sockaddr_in) = sin };
            mem::size_of::<libc::sockaddr_in>()
        }
        SocketAddr::V6(a) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: a.port().to_be(),
                sin6_flowinfo: a.flowinfo().to_be(),
                sin6_addr: libc::in6_addr {
                    s6_addr: a.ip().octets(),
                },
                sin6_scope_id: a.scope_id(),
            };
            unsafe { *(&mut storage as *mut _ as *mut libc::sockaddr_in6) = sin6 };
            mem::size_of::<libc::sockaddr_in6>()
        }
    };
    (storage, len as socklen_t)
}

/// An owned non-blocking TCP socket. The descriptor is created with
/// `SOCK_NONBLOCK | SOCK_CLOEXEC` and closed on drop.
#[derive(Debug)]
pub struct Socket(FileDesc);

impl Socket {
    pub fn stream(family: c_int) -> io::Result<Socket> {
        let fd = syscall!(socket(
            family,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            libc::IPPROTO_TCP
        ))?;
        Ok(Socket(unsafe { FileDesc::new(fd) }))
    }

    pub fn for_addr(addr: &SocketAddr) -> io::Result<Socket> {
        let family = match addr {
            SocketAddr::V4(..) => libc::AF_INET,
            SocketAddr::V6(..) => libc::AF_INET6,
        };
        Socket::stream(family)
    }

    /// Takes ownership of `fd`.
    ///
    /// # Safety
    ///
    /// `fd` must be an open socket not owned elsewhere.
    pub unsafe fn from_raw(fd: RawFd) -> Socket {
        Socket(FileDesc::new(fd))
    }

    pub fn bind(&self, addr: &SocketAddr) -> io::Result<()> {
        let (storage, len) = addr_to_sockaddr(addr);
        syscall!(bind(
            self.as_raw_fd(),
            &storage as *const _ as *const libc::sockaddr,
            len
        ))?;
        Ok(())
    }

    pub fn listen(&self) -> io::Result<()> {
        syscall!(listen(self.as_raw_fd(), libc::SOMAXCONN))?;
        Ok(())
    }

    /// Accepts one pending connection. The returned socket is non-blocking
    /// and close-on-exec.
    pub fn accept(&self) -> io::Result<(Socket, SocketAddr)> {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of_val(&storage) as socklen_t;

        let fd = loop {
            match syscall!(accept4(
                self.as_raw_fd(),
                &mut storage as *mut _ as *mut libc::sockaddr,
                &mut len,
                libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC
            )) {
                Err(ref e) if e.kind() == ErrorKind::Interrupted => (),
                other => break other,
            }
        }?;

        let socket = Socket(unsafe { FileDesc::new(fd) });
        let addr = sockaddr_to_addr(&storage, len as usize)?;
        Ok((socket, addr))
    }

    /// Issues a non-blocking connect. `EINPROGRESS` surfaces as an error
    /// with that raw os code; the caller classifies it.
    pub fn connect(&self, addr: &SocketAddr) -> io::Result<()> {
        let (storage, len) = addr_to_sockaddr(addr);
        syscall!(connect(
            self.as_raw_fd(),
            &storage as *const _ as *const libc::sockaddr,
            len
        ))?;
        Ok(())
    }

    pub fn shutdown_write(&self) -> io::Result<()> {
        syscall!(shutdown(self.as_raw_fd(), libc::SHUT_WR))?;
        Ok(())
    }

    pub fn set_reuse_addr(&self, on: bool) -> io::Result<()> {
        setsockopt(self, libc::SOL_SOCKET, libc::SO_REUSEADDR, on as c_int)
    }

    pub fn set_reuse_port(&self, on: bool) -> io::Result<()> {
        setsockopt(self, libc::SOL_SOCKET, libc::SO_REUSEPORT, on as c_int)
    }

    pub fn set_keepalive(&self, on: bool) -> io::Result<()> {
        setsockopt(self, libc::SOL_SOCKET, libc::SO_KEEPALIVE, on as c_int)
    }

    pub fn set_nodelay(&self, on: bool) -> io::Result<()> {
        setsockopt(self, libc::IPPROTO_TCP, libc::TCP_NODELAY, on as c_int)
    }

    /// Reads and clears `SO_ERROR`.
    pub fn take_error(&self) -> io::Result<Option<io::Error>> {
        let raw: c_int = getsockopt(self, libc::SOL_SOCKET, libc::SO_ERROR)?;
        if raw == 0 {
            Ok(None)
        } else {
            Ok(Some(io::Error::from_raw_os_error(raw)))
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of_val(&storage) as socklen_t;
        syscall!(getsockname(
            self.as_raw_fd(),
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut len
        ))?;
        sockaddr_to_addr(&storage, len as usize)
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of_val(&storage) as socklen_t;
        syscall!(getpeername(
            self.as_raw_fd(),
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut len
        ))?;
        sockaddr_to_addr(&storage, len as usize)
    }

    /// Detects the loopback race where a non-blocking connect to a local
    /// ephemeral port yields identical local and peer endpoints.
    pub fn is_self_connect(&self) -> bool {
        match (self.local_addr(), self.peer_addr()) {
            (Ok(local), Ok(peer)) => local == peer,
            _ => false,
        }
    }

    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        (&self.0).read(buf)
    }

    pub fn write(&self, buf: &[u8]) -> io::Result<usize> {
        (&self.0).write(buf)
    }
}

impl AsRawFd for Socket {
    fn as_raw_fd(&self) -> RawFd {
        self.0.as_raw_fd()
    }
}

impl IntoRawFd for Socket {
    fn into_raw_fd(self) -> RawFd {
        self.0.into_raw_fd()
    }
}

#[cfg(test)]
mod test {
    use std::net::SocketAddr;
    use std::os::unix::io::AsRawFd;

    use super::Socket;

    #[test]
    fn bind_listen_accept_loopback() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let listener = Socket::for_addr(&addr).unwrap();
        listener.set_reuse_addr(true).unwrap();
        listener.bind(&addr).unwrap();
        listener.listen().unwrap();
        let bound = listener.local_addr().unwrap();
        assert_ne!(bound.port(), 0);

        let client = Socket::for_addr(&bound).unwrap();
        match client.connect(&bound) {
            Ok(()) => (),
            Err(e) => assert_eq!(e.raw_os_error(), Some(libc::EINPROGRESS)),
        }

        // Loopback connects complete fast enough to accept right away after
        // a short wait.
        std::thread::sleep(std::time::Duration::from_millis(50));
        let (accepted, peer) = listener.accept().unwrap();
        assert!(accepted.as_raw_fd() >= 0);
        assert_eq!(peer.ip(), bound.ip());
    }

    #[test]
    fn take_error_clean_socket() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let sock = Socket::for_addr(&addr).unwrap();
        assert!(sock.take_error().unwrap().is_none());
    }

    #[test]
    fn sockaddr_round_trip_v6() {
        let addr: SocketAddr = "[::1]:4242".parse().unwrap();
        let (storage, len) = super::addr_to_sockaddr(&addr);
        let back = super::sockaddr_to_addr(&storage, len as usize).unwrap();
        assert_eq!(back, addr);
    }
}
