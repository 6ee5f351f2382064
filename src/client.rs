use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use log::info;

use crate::buffer::Buffer;
use crate::connection::{
    ConnectionCallback, ErrorCallback, Handlers, MessageCallback, TcpConnection,
};
use crate::connector::Connector;
use crate::event_loop::EventLoop;
use crate::sys::socket::Socket;

#[derive(Default, Clone)]
struct UserCallbacks {
    connect: Option<ConnectionCallback>,
    message: Option<MessageCallback>,
    write_complete: Option<ConnectionCallback>,
    close: Option<ConnectionCallback>,
    error: Option<ErrorCallback>,
}

struct ClientShared {
    event_loop: Arc<EventLoop>,
    self_ref: Weak<ClientShared>,
    connector: Arc<Connector>,
    running: AtomicBool,
    reconnect: AtomicBool,
    connection: Mutex<Option<Arc<TcpConnection>>>,
    callbacks: Mutex<UserCallbacks>,
}

/// A TCP client: one connector, at most one live connection, both on one
/// loop.
///
/// With reconnect enabled a peer-driven close restarts the connector with
/// its backoff reset, so the client chases the server across restarts.
pub struct TcpClient {
    shared: Arc<ClientShared>,
}

impl TcpClient {
    pub fn new(event_loop: &Arc<EventLoop>, server_addr: SocketAddr) -> TcpClient {
        let connector = Connector::new(event_loop, server_addr);
        let shared = Arc::new_cyclic(|self_ref| ClientShared {
            event_loop: Arc::clone(event_loop),
            self_ref: self_ref.clone(),
            connector: Arc::clone(&connector),
            running: AtomicBool::new(false),
            reconnect: AtomicBool::new(false),
            connection: Mutex::new(None),
            callbacks: Mutex::new(UserCallbacks::default()),
        });

        let weak: Weak<ClientShared> = Arc::downgrade(&shared);
        connector.set_new_connection_callback(move |socket| {
            if let Some(shared) = weak.upgrade() {
                shared.new_connection(socket);
            }
        });

        TcpClient { shared }
    }

    pub fn event_loop(&self) -> &Arc<EventLoop> {
        &self.shared.event_loop
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.shared.connector.peer_addr()
    }

    /// The live connection, if the client is currently connected.
    pub fn connection(&self) -> Option<Arc<TcpConnection>> {
        self.shared.connection.lock().unwrap().clone()
    }

    pub fn enable_reconnect(&self) {
        self.shared.reconnect.store(true, Ordering::Release);
    }

    /// Begins connecting. Callable from any thread.
    pub fn start(&self) {
        self.shared.running.store(true, Ordering::Release);
        self.shared.connector.start();
    }

    /// Cancels an in-flight connect attempt.
    pub fn stop_connect(&self) {
        self.shared.running.store(false, Ordering::Release);
        self.shared.connector.stop();
    }

    /// Half-closes the current connection; reads continue until the peer
    /// closes.
    pub fn shutdown(&self) {
        self.shared.running.store(false, Ordering::Release);
        if let Some(conn) = self.connection() {
            conn.shutdown();
        }
    }

    /// Tears the current connection down actively.
    pub fn force_close(&self) {
        self.shared.running.store(false, Ordering::Release);
        if let Some(conn) = self.connection() {
            conn.force_close();
        }
    }

    pub fn set_connect_callback<F>(&self, cb: F)
    where
        F: Fn(&Arc<TcpConnection>) + Send + Sync + 'static,
    {
        self.shared.callbacks.lock().unwrap().connect = Some(Arc::new(cb));
    }

    pub fn set_message_callback<F>(&self, cb: F)
    where
        F: Fn(&Arc<TcpConnection>, &mut Buffer) + Send + Sync + 'static,
    {
        self.shared.callbacks.lock().unwrap().message = Some(Arc::new(cb));
    }

    pub fn set_write_complete_callback<F>(&self, cb: F)
    where
        F: Fn(&Arc<TcpConnection>) + Send + Sync + 'static,
    {
        self.shared.callbacks.lock().unwrap().write_complete = Some(Arc::new(cb));
    }

    pub fn set_close_callback<F>(&self, cb: F)
    where
        F: Fn(&Arc<TcpConnection>) + Send + Sync + 'static,
    {
        self.shared.callbacks.lock().unwrap().close = Some(Arc::new(cb));
    }

    pub fn set_error_callback<F>(&self, cb: F)
    where
        F: Fn(&Arc<TcpConnection>, &io::Error) + Send + Sync + 'static,
    {
        self.shared.callbacks.lock().unwrap().error = Some(Arc::new(cb));
    }
}

impl Drop for TcpClient {
    fn drop(&mut self) {
        self.shared.connector.stop();
    }
}

impl ClientShared {
    /// Connector success path, on the loop: wrap the socket, install the
    /// callback set, record the connection, establish.
    fn new_connection(&self, socket: Socket) {
        self.event_loop.assert_in_loop();
        let peer_addr = socket
            .peer_addr()
            .unwrap_or_else(|_| self.connector.peer_addr());
        let conn = TcpConnection::new(&self.event_loop, socket, peer_addr);

        let user = self.callbacks.lock().unwrap().clone();
        let weak = self.self_ref.clone();
        let close_cb: ConnectionCallback = Arc::new(move |conn: &Arc<TcpConnection>| {
            match weak.upgrade() {
                Some(shared) => shared.handle_close(conn),
                None => {
                    let conn = Arc::clone(conn);
                    let event_loop = Arc::clone(conn.event_loop());
                    event_loop.queue_in_loop(move || conn.connect_destroyed());
                }
            }
        });

        conn.install_handlers(Handlers {
            connect: user.connect,
            message: user.message,
            write_complete: user.write_complete,
            close: Some(close_cb),
            error: user.error,
        });

        *self.connection.lock().unwrap() = Some(Arc::clone(&conn));
        conn.connect_established();
    }

    fn handle_close(&self, conn: &Arc<TcpConnection>) {
        self.event_loop.assert_in_loop();
        *self.connection.lock().unwrap() = None;

        let user_close = self.callbacks.lock().unwrap().close.clone();
        let conn = Arc::clone(conn);
        self.event_loop.queue_in_loop(move || {
            // User callback first: destruction clears the user-data slot
            // layered protocols still need.
            if let Some(cb) = user_close {
                cb(&conn);
            }
            conn.connect_destroyed();
        });

        if self.reconnect.load(Ordering::Acquire) && self.running.load(Ordering::Acquire) {
            info!("reconnecting to {}", self.connector.peer_addr());
            self.connector.restart();
        }
    }
}
