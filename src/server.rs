use std::cell::RefCell;
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};
use std::rc::Rc;
use std::sync::{Arc, Mutex, Once, Weak};

use indexmap::IndexMap;
use log::{debug, error, info};

use crate::acceptor::Acceptor;
use crate::connection::{
    ConnectionCallback, ErrorCallback, Handlers, MessageCallback, TcpConnection,
};
use crate::event_loop::{EventLoop, LoopCell};
use crate::sys::socket::Socket;
use crate::thread_pool::{EventLoopThreadPool, ThreadInitCallback};

static IGNORE_SIGPIPE: Once = Once::new();

/// The template callback set cloned onto every accepted connection.
#[derive(Default, Clone)]
struct UserCallbacks {
    connect: Option<ConnectionCallback>,
    message: Option<MessageCallback>,
    write_complete: Option<ConnectionCallback>,
    close: Option<ConnectionCallback>,
    error: Option<ErrorCallback>,
}

struct ServerShared {
    base_loop: Arc<EventLoop>,
    self_ref: Weak<ServerShared>,
    pool: LoopCell<Option<EventLoopThreadPool>>,
    acceptor: LoopCell<Option<Rc<RefCell<Acceptor>>>>,
    // Owned by the base loop; close handlers hop here to drop entries.
    connections: LoopCell<IndexMap<RawFd, Arc<TcpConnection>>>,
    callbacks: Mutex<UserCallbacks>,
}

/// A multi-loop TCP server: one acceptor on the base loop, connections
/// spread round-robin over the pool.
///
/// Every accepted connection is recorded in a base-loop-owned map, gets a
/// clone of the user callbacks plus an internal close handler, and is
/// established on its I/O loop via the task queue. SIGPIPE is ignored
/// process-wide the first time a server is built, so writes to a dead peer
/// come back as errno instead of killing the process.
pub struct TcpServer {
    shared: Arc<ServerShared>,
    addr: SocketAddr,
}

impl TcpServer {
    /// Builds the server on the base loop's thread. `worker_count` of zero
    /// serves connections on the base loop itself.
    pub fn new(
        base_loop: &Arc<EventLoop>,
        listen_addr: SocketAddr,
        reuse_port: bool,
        worker_count: usize,
        thread_init: Option<ThreadInitCallback>,
    ) -> io::Result<TcpServer> {
        base_loop.assert_in_loop();
        IGNORE_SIGPIPE.call_once(|| unsafe {
            libc::signal(libc::SIGPIPE, libc::SIG_IGN);
        });

        let pool = EventLoopThreadPool::new(base_loop, worker_count, thread_init)?;
        let acceptor = Acceptor::new(base_loop, &listen_addr, reuse_port)?;
        let owner = base_loop.owner_thread();

        let shared = Arc::new_cyclic(|self_ref| ServerShared {
            base_loop: Arc::clone(base_loop),
            self_ref: self_ref.clone(),
            pool: LoopCell::new(owner, Some(pool)),
            acceptor: LoopCell::new(owner, Some(Rc::clone(&acceptor))),
            connections: LoopCell::new(owner, IndexMap::new()),
            callbacks: Mutex::new(UserCallbacks::default()),
        });

        let weak: Weak<ServerShared> = Arc::downgrade(&shared);
        acceptor
            .borrow_mut()
            .set_new_connection_callback(move |socket, peer_addr| {
                if let Some(shared) = weak.upgrade() {
                    shared.new_connection(socket, peer_addr);
                }
            });

        Ok(TcpServer {
            shared,
            addr: listen_addr,
        })
    }

    pub fn base_loop(&self) -> &Arc<EventLoop> {
        &self.shared.base_loop
    }

    /// The bound address, useful when listening on port 0.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        let acceptor = self.shared.acceptor.borrow_mut().clone();
        match acceptor {
            Some(acceptor) => acceptor.borrow().local_addr(),
            None => Err(io::Error::new(io::ErrorKind::NotConnected, "server torn down")),
        }
    }

    /// Starts listening. Safe to call from any thread.
    pub fn start(&self) {
        info!("listening on {}", self.addr);
        let shared = Arc::clone(&self.shared);
        self.shared.base_loop.run_in_loop(move || {
            let acceptor = shared.acceptor.borrow_mut().clone();
            if let Some(acceptor) = acceptor {
                if let Err(e) = acceptor.borrow().listen() {
                    error!("listen: {}", e);
                }
            }
        });
    }

    pub fn set_connect_callback<F>(&mut self, cb: F)
    where
        F: Fn(&Arc<TcpConnection>) + Send + Sync + 'static,
    {
        self.shared.callbacks.lock().unwrap().connect = Some(Arc::new(cb));
    }

    pub fn set_message_callback<F>(&mut self, cb: F)
    where
        F: Fn(&Arc<TcpConnection>, &mut crate::buffer::Buffer) + Send + Sync + 'static,
    {
        self.shared.callbacks.lock().unwrap().message = Some(Arc::new(cb));
    }

    pub fn set_write_complete_callback<F>(&mut self, cb: F)
    where
        F: Fn(&Arc<TcpConnection>) + Send + Sync + 'static,
    {
        self.shared.callbacks.lock().unwrap().write_complete = Some(Arc::new(cb));
    }

    pub fn set_close_callback<F>(&mut self, cb: F)
    where
        F: Fn(&Arc<TcpConnection>) + Send + Sync + 'static,
    {
        self.shared.callbacks.lock().unwrap().close = Some(Arc::new(cb));
    }

    pub fn set_error_callback<F>(&mut self, cb: F)
    where
        F: Fn(&Arc<TcpConnection>, &io::Error) + Send + Sync + 'static,
    {
        self.shared.callbacks.lock().unwrap().error = Some(Arc::new(cb));
    }
}

impl ServerShared {
    fn strong(&self) -> Arc<ServerShared> {
        self.self_ref.upgrade().expect("server alive")
    }

    /// Accept-path continuation, on the base loop.
    fn new_connection(&self, socket: Socket, peer_addr: SocketAddr) {
        self.base_loop.assert_in_loop();

        let io_loop = {
            let pool = self.pool.borrow_mut();
            match pool.as_ref() {
                Some(pool) => pool.next_loop(),
                None => return,
            }
        };

        let fd = socket.as_raw_fd();
        let conn = TcpConnection::new(&io_loop, socket, peer_addr);
        self.connections
            .borrow_mut()
            .insert(fd, Arc::clone(&conn));
        debug!("connection from {} on fd {}", peer_addr, fd);

        let user = self.callbacks.lock().unwrap().clone();
        let weak = self.self_ref.clone();
        let close_cb: ConnectionCallback = Arc::new(move |conn: &Arc<TcpConnection>| {
            match weak.upgrade() {
                Some(shared) => shared.handle_close(conn),
                None => {
                    // Server already gone: still destroy on the conn's loop.
                    let conn = Arc::clone(conn);
                    let io_loop = Arc::clone(conn.event_loop());
                    io_loop.queue_in_loop(move || conn.connect_destroyed());
                }
            }
        });

        let handlers = Handlers {
            connect: user.connect,
            message: user.message,
            write_complete: user.write_complete,
            close: Some(close_cb),
            error: user.error,
        };

        // The base loop cannot establish directly; hop to the I/O loop.
        let conn = Arc::clone(&conn);
        io_loop.queue_in_loop(move || {
            conn.install_handlers(handlers);
            conn.connect_established();
        });
    }

    /// Runs as the connection's close callback on its I/O loop: hop to the
    /// base loop to drop the map entry, then back to destroy and tell the
    /// user.
    fn handle_close(&self, conn: &Arc<TcpConnection>) {
        let shared = self.strong();
        let conn = Arc::clone(conn);
        self.base_loop.run_in_loop(move || {
            shared
                .connections
                .borrow_mut()
                .shift_remove(&conn.as_raw_fd());

            let user_close = shared.callbacks.lock().unwrap().close.clone();
            let io_loop = Arc::clone(conn.event_loop());
            io_loop.queue_in_loop(move || {
                // User callback first: destruction clears the user-data
                // slot layered protocols still need.
                if let Some(cb) = user_close {
                    cb(&conn);
                }
                conn.connect_destroyed();
            });
        });
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        self.shared.base_loop.assert_in_loop();

        let connections: Vec<_> = {
            let mut map = self.shared.connections.borrow_mut();
            map.drain(..).collect()
        };
        for (_, conn) in connections {
            let io_loop = Arc::clone(conn.event_loop());
            io_loop.queue_in_loop(move || conn.connect_destroyed());
        }

        // The acceptor unregisters here, on the base loop, and the pool
        // joins its workers after their destroy tasks were queued.
        *self.shared.acceptor.borrow_mut() = None;
        let pool = self.shared.pool.borrow_mut().take();
        drop(pool);
    }
}
