//! A multi-reactor networking core for Rust focusing on non-blocking TCP,
//! readiness notification, and an HTTP/1.1 layer for building servers,
//! clients, and reverse proxies.
//!
//! The crate is organized around single-threaded [`EventLoop`]s. Each loop
//! multiplexes socket readiness through epoll, drives a timer queue armed by
//! a timerfd, and runs tasks posted from other threads after an eventfd
//! wakeup. Connections never migrate: every callback for a connection runs
//! on the thread of the loop that owns it.
//!
//! # Example
//!
//! ```no_run
//! use relay_io::{EventLoop, TcpServer};
//!
//! let event_loop = EventLoop::new().unwrap();
//! let addr = "127.0.0.1:7000".parse().unwrap();
//! let mut server = TcpServer::new(&event_loop, addr, false, 2, None).unwrap();
//! server.set_message_callback(|conn, buf| {
//!     let bytes = buf.data().to_vec();
//!     conn.write(&bytes).unwrap();
//!     buf.clear();
//! });
//! server.start();
//! event_loop.run();
//! ```

mod acceptor;
mod addr;
mod buffer;
mod channel;
mod client;
mod connection;
mod connector;
mod event_loop;
mod poller;
mod ready;
mod server;
mod thread_pool;
mod timer_queue;

pub mod http;
pub mod sys;

pub use acceptor::Acceptor;
pub use addr::{any, resolve};
pub use buffer::Buffer;
pub use channel::Channel;
pub use client::TcpClient;
pub use connection::{
    ConnState, ConnectionCallback, ErrorCallback, Handlers, MessageCallback, TcpConnection,
};
pub use connector::Connector;
pub use event_loop::{EventLoop, LoopCell, Task};
pub use poller::Poller;
pub use ready::Ready;
pub use server::TcpServer;
pub use thread_pool::{EventLoopThreadPool, ThreadInitCallback};
pub use timer_queue::TimerId;
