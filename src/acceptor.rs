use std::cell::RefCell;
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::AsRawFd;
use std::rc::{Rc, Weak};
use std::sync::Arc;

use log::{error, warn};

use crate::channel::Channel;
use crate::event_loop::EventLoop;
use crate::sys::fd::FileDesc;
use crate::sys::socket::Socket;

pub type NewConnectionCallback = Box<dyn FnMut(Socket, SocketAddr)>;

/// Wraps a listening socket on its loop and drains the accept queue on
/// readability.
///
/// A reserved descriptor open on `/dev/null` provides the EMFILE escape
/// hatch: when the process runs out of descriptors the reserve is closed,
/// one connection is accepted and immediately dropped so the peer sees a
/// reset, and the reserve is reopened. Without it the listener would stay
/// ready but undrainable forever.
pub struct Acceptor {
    event_loop: Arc<EventLoop>,
    socket: Socket,
    channel: Rc<Channel>,
    idle_fd: Option<FileDesc>,
    new_connection_cb: Option<NewConnectionCallback>,
}

impl Acceptor {
    pub fn new(
        event_loop: &Arc<EventLoop>,
        addr: &SocketAddr,
        reuse_port: bool,
    ) -> io::Result<Rc<RefCell<Acceptor>>> {
        let socket = Socket::for_addr(addr)?;
        socket.set_reuse_addr(true)?;
        socket.set_reuse_port(reuse_port)?;
        socket.bind(addr)?;

        let channel = Channel::new(event_loop, socket.as_raw_fd());
        let acceptor = Rc::new(RefCell::new(Acceptor {
            event_loop: Arc::clone(event_loop),
            socket,
            channel,
            idle_fd: Some(open_idle_fd()?),
            new_connection_cb: None,
        }));

        let weak: Weak<RefCell<Acceptor>> = Rc::downgrade(&acceptor);
        acceptor.borrow().channel.set_read_callback(move || {
            if let Some(acceptor) = weak.upgrade() {
                acceptor.borrow_mut().handle_read();
            }
        });

        Ok(acceptor)
    }

    pub fn set_new_connection_callback<F>(&mut self, cb: F)
    where
        F: FnMut(Socket, SocketAddr) + 'static,
    {
        self.new_connection_cb = Some(Box::new(cb));
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn listen(&self) -> io::Result<()> {
        self.event_loop.assert_in_loop();
        self.socket.listen()?;
        self.channel.enable_reading();
        Ok(())
    }

    fn handle_read(&mut self) {
        self.event_loop.assert_in_loop();

        loop {
            match self.socket.accept() {
                Ok((socket, peer_addr)) => match self.new_connection_cb.as_mut() {
                    Some(cb) => cb(socket, peer_addr),
                    None => drop(socket),
                },
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(ref e) if e.raw_os_error() == Some(libc::EMFILE) => {
                    warn!("accept: out of file descriptors, resetting one peer");
                    self.recover_from_emfile();
                    return;
                }
                Err(e) => {
                    error!("accept: {}", e);
                    return;
                }
            }
        }
    }

    /// Frees the reserve, takes exactly one pending connection and drops
    /// it, then restores the reserve.
    fn recover_from_emfile(&mut self) {
        self.idle_fd = None;
        match self.socket.accept() {
            Ok((socket, _)) => drop(socket),
            Err(e) => warn!("accept during fd recovery: {}", e),
        }
        match open_idle_fd() {
            Ok(fd) => self.idle_fd = Some(fd),
            Err(e) => error!("reopening reserve fd: {}", e),
        }
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        // Off-loop teardown leaves the channel to the poller; the kernel
        // forgets the fd when the socket closes.
        if self.event_loop.is_in_loop() {
            self.channel.disable_all();
            self.channel.remove();
        }
    }
}

fn open_idle_fd() -> io::Result<FileDesc> {
    let path = b"/dev/null\0";
    let fd = syscall_open(path.as_ptr() as *const libc::c_char)?;
    Ok(unsafe { FileDesc::new(fd) })
}

fn syscall_open(path: *const libc::c_char) -> io::Result<libc::c_int> {
    let fd = unsafe { libc::open(path, libc::O_RDONLY | libc::O_CLOEXEC) };
    if fd == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(fd)
    }
}
