use std::any::Any;
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::AsRawFd;
use std::rc::Rc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use log::{debug, error, warn};

use crate::buffer::Buffer;
use crate::channel::Channel;
use crate::event_loop::{EventLoop, LoopCell};
use crate::sys::socket::Socket;

pub type ConnectionCallback = Arc<dyn Fn(&Arc<TcpConnection>) + Send + Sync>;
pub type MessageCallback = Arc<dyn Fn(&Arc<TcpConnection>, &mut Buffer) + Send + Sync>;
pub type ErrorCallback = Arc<dyn Fn(&Arc<TcpConnection>, &io::Error) + Send + Sync>;

const READ_BUFFER_SIZE: usize = 1024;
const WRITE_BUFFER_SIZE: usize = 1024;

/// Connection lifecycle. The state only ever moves forward along
/// established → disconnecting → disconnected; once disconnected, no user
/// callback fires again.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum ConnState {
    Connecting = 0,
    Connected = 1,
    Disconnecting = 2,
    Disconnected = 3,
}

impl ConnState {
    fn from_u8(v: u8) -> ConnState {
        match v {
            0 => ConnState::Connecting,
            1 => ConnState::Connected,
            2 => ConnState::Disconnecting,
            _ => ConnState::Disconnected,
        }
    }
}

/// The callback set of one connection. Installed on the owning loop before
/// `connect_established`; cleared on close to break reference cycles.
#[derive(Default)]
pub struct Handlers {
    pub connect: Option<ConnectionCallback>,
    pub message: Option<MessageCallback>,
    pub write_complete: Option<ConnectionCallback>,
    pub close: Option<ConnectionCallback>,
    pub error: Option<ErrorCallback>,
}

/// One TCP connection pinned to one loop.
///
/// The connection is shared (`Arc`); scheduled tasks capture it by value so
/// it stays alive until they run. Everything mutable except the state enum
/// lives in loop-affine cells; `shutdown` and `force_close` are the only
/// operations callable from foreign threads and they go through atomic
/// state transitions plus a task hop.
pub struct TcpConnection {
    event_loop: Arc<EventLoop>,
    self_ref: Weak<TcpConnection>,
    socket: Socket,
    peer_addr: SocketAddr,
    state: AtomicU8,
    channel: LoopCell<Option<Rc<Channel>>>,
    read_buf: LoopCell<Buffer>,
    write_buf: LoopCell<Buffer>,
    handlers: LoopCell<Handlers>,
    user_data: LoopCell<Option<Box<dyn Any>>>,
}

impl TcpConnection {
    /// Wraps an accepted or connected socket. Keep-alive goes on right
    /// away; the channel is not materialized until `connect_established`
    /// runs on the owning loop.
    pub fn new(
        event_loop: &Arc<EventLoop>,
        socket: Socket,
        peer_addr: SocketAddr,
    ) -> Arc<TcpConnection> {
        if let Err(e) = socket.set_keepalive(true) {
            warn!("keepalive on {}: {}", peer_addr, e);
        }
        let owner = event_loop.owner_thread();
        Arc::new_cyclic(|self_ref| TcpConnection {
            event_loop: Arc::clone(event_loop),
            self_ref: self_ref.clone(),
            socket,
            peer_addr,
            state: AtomicU8::new(ConnState::Connecting as u8),
            channel: LoopCell::new(owner, None),
            read_buf: LoopCell::new(owner, Buffer::new(READ_BUFFER_SIZE)),
            write_buf: LoopCell::new(owner, Buffer::new(WRITE_BUFFER_SIZE)),
            handlers: LoopCell::new(owner, Handlers::default()),
            user_data: LoopCell::new(owner, None),
        })
    }

    fn strong(&self) -> Arc<TcpConnection> {
        self.self_ref.upgrade().expect("connection alive")
    }

    pub fn event_loop(&self) -> &Arc<EventLoop> {
        &self.event_loop
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn state(&self) -> ConnState {
        ConnState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnState::Connected
    }

    pub fn set_nodelay(&self, on: bool) -> io::Result<()> {
        self.socket.set_nodelay(on)
    }

    /// Replaces the whole handler set. Owner loop only.
    pub fn install_handlers(&self, handlers: Handlers) {
        *self.handlers.borrow_mut() = handlers;
    }

    pub fn set_connect_callback(&self, cb: ConnectionCallback) {
        self.handlers.borrow_mut().connect = Some(cb);
    }

    pub fn set_message_callback(&self, cb: MessageCallback) {
        self.handlers.borrow_mut().message = Some(cb);
    }

    pub fn set_write_complete_callback(&self, cb: ConnectionCallback) {
        self.handlers.borrow_mut().write_complete = Some(cb);
    }

    pub fn set_close_callback(&self, cb: ConnectionCallback) {
        self.handlers.borrow_mut().close = Some(cb);
    }

    pub fn set_error_callback(&self, cb: ErrorCallback) {
        self.handlers.borrow_mut().error = Some(cb);
    }

    pub fn set_user_data(&self, data: Box<dyn Any>) {
        *self.user_data.borrow_mut() = Some(data);
    }

    pub fn get_user_data<T: Clone + 'static>(&self) -> Option<T> {
        self.user_data
            .borrow_mut()
            .as_ref()
            .and_then(|d| d.downcast_ref::<T>().cloned())
    }

    pub fn clear_user_data(&self) {
        *self.user_data.borrow_mut() = None;
    }

    /// Finishes setup on the owning loop: materializes the channel, ties it
    /// weakly to this connection, enables reading, and fires the connect
    /// callback.
    pub fn connect_established(&self) {
        self.event_loop.assert_in_loop();
        let old = self.state.swap(ConnState::Connected as u8, Ordering::AcqRel);
        assert_eq!(ConnState::from_u8(old), ConnState::Connecting);

        let channel = Channel::new(&self.event_loop, self.socket.as_raw_fd());

        let weak = self.self_ref.clone();
        channel.set_read_callback(move || {
            if let Some(conn) = weak.upgrade() {
                conn.handle_read();
            }
        });
        let weak = self.self_ref.clone();
        channel.set_write_callback(move || {
            if let Some(conn) = weak.upgrade() {
                conn.handle_write();
            }
        });
        let weak = self.self_ref.clone();
        channel.set_close_callback(move || {
            if let Some(conn) = weak.upgrade() {
                conn.handle_close();
            }
        });
        let weak = self.self_ref.clone();
        channel.set_error_callback(move || {
            if let Some(conn) = weak.upgrade() {
                conn.handle_channel_error();
            }
        });

        let as_any: Arc<dyn Any + Send + Sync> = self.strong();
        channel.tie(Arc::downgrade(&as_any));

        *self.channel.borrow_mut() = Some(Rc::clone(&channel));
        channel.enable_reading();

        let cb = self.handlers.borrow_mut().connect.clone();
        if let Some(cb) = cb {
            cb(&self.strong());
        }
    }

    /// Final teardown on the owning loop. Idempotent; safe after either a
    /// close-path run or a direct destroy from the server.
    pub fn connect_destroyed(&self) {
        self.event_loop.assert_in_loop();
        let connected = ConnState::Connected as u8;
        let disconnected = ConnState::Disconnected as u8;
        if self
            .state
            .compare_exchange(connected, disconnected, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            if let Some(channel) = self.channel.borrow_mut().clone() {
                channel.disable_all();
            }
        }

        let channel = self.channel.borrow_mut().take();
        if let Some(channel) = channel {
            channel.remove();
        }
        self.clear_user_data();
    }

    /// Writes `data`, preserving call order. Owner loop only. When write
    /// interest is off and the buffer is empty the bytes go straight to the
    /// socket; any remainder is buffered and write interest turned on. The
    /// write-complete callback is always delivered via the task queue, so
    /// its ordering does not depend on which path ran.
    pub fn write(&self, data: &[u8]) -> io::Result<usize> {
        self.event_loop.assert_in_loop();
        let channel = match self.channel.borrow_mut().clone() {
            Some(channel) => channel,
            None => {
                warn!("write on unestablished connection to {}", self.peer_addr);
                return Ok(0);
            }
        };

        let mut written = 0;
        let mut remaining = data.len();

        let buffer_empty = self.write_buf.borrow_mut().is_empty();
        if !channel.has_write_interest() && buffer_empty {
            match self.socket.write(data) {
                Ok(n) => {
                    written = n;
                    remaining -= n;
                    if remaining == 0 {
                        self.queue_write_complete();
                        return Ok(data.len());
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => written = 0,
                Err(e) => {
                    self.handle_error(&e);
                    self.handle_close();
                    return Err(e);
                }
            }
        }

        if remaining > 0 {
            self.write_buf.borrow_mut().append(&data[written..]);
            if !channel.has_write_interest() {
                channel.enable_writing();
            }
        }
        Ok(data.len())
    }

    /// Half-closes the write side. Callable from any thread; the peer
    /// observes EOF while this side continues to read. A shutdown issued
    /// while buffered data is still draining takes effect once the drain
    /// finishes.
    pub fn shutdown(&self) {
        let connected = ConnState::Connected as u8;
        let disconnecting = ConnState::Disconnecting as u8;
        if self
            .state
            .compare_exchange(connected, disconnecting, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let conn = self.strong();
            self.event_loop.run_in_loop(move || conn.shutdown_in_loop());
        }
    }

    fn shutdown_in_loop(&self) {
        self.event_loop.assert_in_loop();
        let writing = self
            .channel
            .borrow_mut()
            .as_ref()
            .map(|ch| ch.has_write_interest())
            .unwrap_or(false);
        if !writing {
            if let Err(e) = self.socket.shutdown_write() {
                warn!("shutdown {}: {}", self.peer_addr, e);
            }
        }
    }

    /// Active close. Callable from any thread; the close path runs at most
    /// once even against a racing peer-driven close.
    pub fn force_close(&self) {
        loop {
            let current = self.state.load(Ordering::Acquire);
            if current == ConnState::Disconnected as u8 {
                return;
            }
            if self
                .state
                .compare_exchange(
                    current,
                    ConnState::Disconnecting as u8,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                if current == ConnState::Connected as u8
                    || current == ConnState::Disconnecting as u8
                {
                    let conn = self.strong();
                    self.event_loop.queue_in_loop(move || conn.handle_close());
                }
                return;
            }
        }
    }

    fn handle_read(&self) {
        self.event_loop.assert_in_loop();
        let result = self.read_buf.borrow_mut().read_fd(self.socket.as_raw_fd());
        match result {
            Ok(0) => self.handle_close(),
            Ok(_) => {
                let cb = self.handlers.borrow_mut().message.clone();
                if let Some(cb) = cb {
                    let conn = self.strong();
                    let mut buf = self.read_buf.borrow_mut();
                    cb(&conn, &mut *buf);
                }
            }
            Err(ref e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => self.handle_error(&e),
        }
    }

    fn handle_write(&self) {
        self.event_loop.assert_in_loop();
        let channel = match self.channel.borrow_mut().clone() {
            Some(channel) => channel,
            None => return,
        };
        if !channel.events().is_writable() {
            return;
        }

        let result = {
            let buf = self.write_buf.borrow_mut();
            self.socket.write(buf.data())
        };
        match result {
            Ok(n) => {
                let empty = {
                    let mut buf = self.write_buf.borrow_mut();
                    buf.pop_front(n);
                    buf.is_empty()
                };
                if empty {
                    channel.disable_writing();
                    self.queue_write_complete();
                    if self.state() == ConnState::Disconnecting {
                        self.shutdown_in_loop();
                    }
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => (),
            Err(e) => {
                self.handle_error(&e);
                self.handle_close();
            }
        }
    }

    /// Idempotent close path, always on the owning loop. Clears interest,
    /// drops the user callbacks so no cycle survives, and fires the close
    /// callback exactly once.
    pub(crate) fn handle_close(&self) {
        self.event_loop.assert_in_loop();
        let old = self.state.swap(ConnState::Disconnected as u8, Ordering::AcqRel);
        if ConnState::from_u8(old) == ConnState::Disconnected {
            return;
        }
        debug!("connection to {} closed", self.peer_addr);

        if let Some(channel) = self.channel.borrow_mut().clone() {
            channel.disable_all();
        }

        let close_cb = {
            let mut handlers = self.handlers.borrow_mut();
            handlers.connect = None;
            handlers.message = None;
            handlers.write_complete = None;
            handlers.error = None;
            handlers.close.take()
        };
        if let Some(cb) = close_cb {
            cb(&self.strong());
        }
    }

    fn handle_channel_error(&self) {
        let e = match self.socket.take_error() {
            Ok(Some(e)) => e,
            Ok(None) => io::Error::new(io::ErrorKind::Other, "unknown socket error"),
            Err(e) => e,
        };
        self.handle_error(&e);
    }

    fn handle_error(&self, e: &io::Error) {
        error!("connection to {}: {}", self.peer_addr, e);
        let cb = self.handlers.borrow_mut().error.clone();
        if let Some(cb) = cb {
            cb(&self.strong(), e);
        }
    }

    fn queue_write_complete(&self) {
        let conn = self.strong();
        self.event_loop.queue_in_loop(move || {
            let cb = conn.handlers.borrow_mut().write_complete.clone();
            if let Some(cb) = cb {
                cb(&conn);
            }
        });
    }
}

impl AsRawFd for TcpConnection {
    fn as_raw_fd(&self) -> std::os::unix::io::RawFd {
        self.socket.as_raw_fd()
    }
}

impl std::fmt::Debug for TcpConnection {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.debug_struct("TcpConnection")
            .field("peer", &self.peer_addr)
            .field("state", &self.state())
            .finish()
    }
}
