use std::net::SocketAddr;
use std::os::unix::io::AsRawFd;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use log::{error, info, warn};

use crate::channel::Channel;
use crate::event_loop::{EventLoop, LoopCell};
use crate::sys::socket::Socket;

pub type NewConnectionCallback = Box<dyn FnMut(Socket) + Send>;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum State {
    Disconnected,
    Connecting,
    Connected,
}

struct Pending {
    socket: Socket,
    channel: Rc<Channel>,
}

struct Inner {
    state: State,
    retry_delay: Duration,
    pending: Option<Pending>,
    // Channels parked here until a queued task frees them on the loop.
    dying_channels: Vec<Rc<Channel>>,
}

/// Drives one asynchronous outbound connect with exponential-backoff retry.
///
/// The attempt socket is registered for writability; once writable, SO_ERROR
/// and the self-connect race decide between delivering the socket and
/// retrying. A scheduled retry is simply the disconnected state with a timer
/// pending. `start` and `stop` may be called from any thread, everything
/// else runs on the loop.
pub struct Connector {
    event_loop: Arc<EventLoop>,
    self_ref: Weak<Connector>,
    peer_addr: SocketAddr,
    running: AtomicBool,
    inner: LoopCell<Inner>,
    new_connection_cb: Mutex<Option<NewConnectionCallback>>,
}

impl Connector {
    pub const INIT_RETRY_DELAY: Duration = Duration::from_millis(500);
    pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

    pub fn new(event_loop: &Arc<EventLoop>, peer_addr: SocketAddr) -> Arc<Connector> {
        Arc::new_cyclic(|self_ref| Connector {
            event_loop: Arc::clone(event_loop),
            self_ref: self_ref.clone(),
            peer_addr,
            running: AtomicBool::new(false),
            inner: LoopCell::new(
                event_loop.owner_thread(),
                Inner {
                    state: State::Disconnected,
                    retry_delay: Connector::INIT_RETRY_DELAY,
                    pending: None,
                    dying_channels: Vec::new(),
                },
            ),
            new_connection_cb: Mutex::new(None),
        })
    }

    fn strong(&self) -> Arc<Connector> {
        self.self_ref.upgrade().expect("connector alive")
    }

    /// The callback receives the connected socket; ownership transfers with
    /// it.
    pub fn set_new_connection_callback<F>(&self, cb: F)
    where
        F: FnMut(Socket) + Send + 'static,
    {
        *self.new_connection_cb.lock().unwrap() = Some(Box::new(cb));
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Begins connecting. Callable from any thread.
    pub fn start(&self) {
        self.running.store(true, Ordering::Release);
        let connector = self.strong();
        self.event_loop.run_in_loop(move || {
            debug_assert_eq!(connector.inner.borrow_mut().state, State::Disconnected);
            if connector.running.load(Ordering::Acquire) {
                connector.connect();
            }
        });
    }

    /// Cancels an in-flight attempt. Callable from any thread.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
        let connector = self.strong();
        self.event_loop.queue_in_loop(move || {
            let connecting = connector.inner.borrow_mut().state == State::Connecting;
            if connecting {
                connector.inner.borrow_mut().state = State::Disconnected;
                let socket = connector.reset_channel();
                drop(socket);
            }
        });
    }

    /// Re-issues from scratch with the backoff reset. Owner thread only.
    pub fn restart(&self) {
        self.event_loop.assert_in_loop();
        {
            let mut inner = self.inner.borrow_mut();
            inner.state = State::Disconnected;
            inner.retry_delay = Connector::INIT_RETRY_DELAY;
        }
        self.start();
    }

    fn connect(&self) {
        self.event_loop.assert_in_loop();

        let socket = match Socket::for_addr(&self.peer_addr) {
            Ok(socket) => socket,
            Err(e) => {
                error!("connector socket: {}", e);
                return;
            }
        };

        match socket.connect(&self.peer_addr) {
            Ok(()) => self.connecting(socket),
            Err(e) => match e.raw_os_error() {
                Some(libc::EINPROGRESS) | Some(libc::EINTR) | Some(libc::EISCONN) => {
                    self.connecting(socket)
                }
                Some(libc::EAGAIN)
                | Some(libc::EADDRINUSE)
                | Some(libc::EADDRNOTAVAIL)
                | Some(libc::ECONNREFUSED)
                | Some(libc::ENETUNREACH) => self.retry(socket),
                _ => {
                    error!("connect to {}: {}", self.peer_addr, e);
                }
            },
        }
    }

    fn connecting(&self, socket: Socket) {
        let channel = Channel::new(&self.event_loop, socket.as_raw_fd());

        let weak = self.self_ref.clone();
        channel.set_write_callback(move || {
            if let Some(connector) = weak.upgrade() {
                connector.handle_write();
            }
        });
        let weak = self.self_ref.clone();
        channel.set_error_callback(move || {
            if let Some(connector) = weak.upgrade() {
                connector.handle_error();
            }
        });

        {
            let mut inner = self.inner.borrow_mut();
            inner.state = State::Connecting;
            inner.pending = Some(Pending {
                socket,
                channel: Rc::clone(&channel),
            });
        }
        channel.enable_writing();
    }

    /// Writability on a connecting socket means the attempt resolved, one
    /// way or the other.
    fn handle_write(&self) {
        if self.inner.borrow_mut().state != State::Connecting {
            return;
        }

        let socket = self.reset_channel();
        let soerr = socket.take_error().unwrap_or(None);
        if let Some(e) = soerr {
            warn!("connect to {}: {}", self.peer_addr, e);
            self.retry(socket);
        } else if socket.is_self_connect() {
            warn!("connect to {}: self connect, retrying", self.peer_addr);
            self.retry(socket);
        } else {
            self.inner.borrow_mut().state = State::Connected;
            if self.running.load(Ordering::Acquire) {
                if let Some(cb) = self.new_connection_cb.lock().unwrap().as_mut() {
                    cb(socket);
                }
            } else {
                drop(socket);
            }
        }
    }

    fn handle_error(&self) {
        if self.inner.borrow_mut().state != State::Connecting {
            return;
        }
        let socket = self.reset_channel();
        if let Ok(Some(e)) = socket.take_error() {
            warn!("connect to {}: {}", self.peer_addr, e);
        }
        self.retry(socket);
    }

    /// Unregisters the attempt channel and takes the socket back. The
    /// channel storage is freed by a queued task, never inside its own
    /// callback.
    fn reset_channel(&self) -> Socket {
        let pending = self
            .inner
            .borrow_mut()
            .pending
            .take()
            .expect("connecting without a pending socket");
        pending.channel.disable_all();
        pending.channel.remove();
        self.inner.borrow_mut().dying_channels.push(pending.channel);

        let connector = self.strong();
        self.event_loop
            .queue_in_loop(move || connector.inner.borrow_mut().dying_channels.clear());
        pending.socket
    }

    /// Closes the failed socket and schedules the next attempt, doubling
    /// the delay up to the cap.
    fn retry(&self, socket: Socket) {
        drop(socket);
        self.inner.borrow_mut().state = State::Disconnected;
        if !self.running.load(Ordering::Acquire) {
            return;
        }

        let delay = {
            let mut inner = self.inner.borrow_mut();
            let delay = inner.retry_delay;
            inner.retry_delay = (delay * 2).min(Connector::MAX_RETRY_DELAY);
            delay
        };
        info!("retry connecting to {} in {:?}", self.peer_addr, delay);

        let connector = self.strong();
        self.event_loop.run_after(delay, move || {
            if connector.running.load(Ordering::Acquire) {
                connector.connect();
            }
        });
    }
}
