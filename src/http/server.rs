use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use log::warn;

use super::context::{HttpCallback, HttpContext};
use super::parser::ParserKind;
use crate::event_loop::EventLoop;
use crate::server::TcpServer;
use crate::thread_pool::ThreadInitCallback;

#[derive(Default)]
struct Callbacks {
    connect: Mutex<Option<HttpCallback>>,
    request: Mutex<Option<HttpCallback>>,
    write_complete: Mutex<Option<HttpCallback>>,
    close: Mutex<Option<HttpCallback>>,
}

/// HTTP/1.1 server over [`TcpServer`].
///
/// Each connection gets an [`HttpContext`] stashed in its user-data slot;
/// the message callback drives the request parser and fires the request
/// callback once per completed message. Bytes that fail to parse earn the
/// peer a 400 and a half-close.
pub struct HttpServer {
    inner: TcpServer,
    callbacks: Arc<Callbacks>,
}

impl HttpServer {
    pub fn new(
        base_loop: &Arc<EventLoop>,
        listen_addr: SocketAddr,
        reuse_port: bool,
        worker_count: usize,
        thread_init: Option<ThreadInitCallback>,
    ) -> io::Result<HttpServer> {
        let mut inner = TcpServer::new(base_loop, listen_addr, reuse_port, worker_count, thread_init)?;
        let callbacks = Arc::new(Callbacks::default());

        let cbs = Arc::clone(&callbacks);
        inner.set_connect_callback(move |conn| {
            let ctx = HttpContext::new(conn, ParserKind::Request);
            conn.set_user_data(Box::new(Arc::clone(&ctx)));
            let connect = cbs.connect.lock().unwrap().clone();
            if let Some(cb) = connect {
                cb(&ctx);
            }
        });

        let cbs = Arc::clone(&callbacks);
        inner.set_message_callback(move |conn, buf| {
            let ctx = match conn.get_user_data::<Arc<HttpContext>>() {
                Some(ctx) => ctx,
                None => {
                    buf.clear();
                    return;
                }
            };

            let parsed = ctx.advance(buf.data());
            buf.clear();
            match parsed {
                Ok(messages) => {
                    let request = cbs.request.lock().unwrap().clone();
                    for message in messages {
                        ctx.set_current(message);
                        if let Some(cb) = request.as_ref() {
                            cb(&ctx);
                        }
                    }
                }
                Err(e) => {
                    warn!("bad request from {}: {}", conn.peer_addr(), e);
                    let _ = ctx.send_error(400);
                }
            }
        });

        let cbs = Arc::clone(&callbacks);
        inner.set_write_complete_callback(move |conn| {
            if let Some(ctx) = conn.get_user_data::<Arc<HttpContext>>() {
                ctx.on_write_complete();
                let write_complete = cbs.write_complete.lock().unwrap().clone();
                if let Some(cb) = write_complete {
                    cb(&ctx);
                }
            }
        });

        let cbs = Arc::clone(&callbacks);
        inner.set_close_callback(move |conn| {
            if let Some(ctx) = conn.get_user_data::<Arc<HttpContext>>() {
                ctx.on_close();
                let close = cbs.close.lock().unwrap().clone();
                if let Some(cb) = close {
                    cb(&ctx);
                }
                conn.clear_user_data();
            }
        });

        Ok(HttpServer { inner, callbacks })
    }

    pub fn base_loop(&self) -> &Arc<EventLoop> {
        self.inner.base_loop()
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    pub fn start(&self) {
        self.inner.start();
    }

    /// Fired once per connection, before any request arrives.
    pub fn set_connect_callback<F>(&self, cb: F)
    where
        F: Fn(&Arc<HttpContext>) + Send + Sync + 'static,
    {
        *self.callbacks.connect.lock().unwrap() = Some(Arc::new(cb));
    }

    /// Fired once per parsed request; the message is surfaced through the
    /// context.
    pub fn set_request_callback<F>(&self, cb: F)
    where
        F: Fn(&Arc<HttpContext>) + Send + Sync + 'static,
    {
        *self.callbacks.request.lock().unwrap() = Some(Arc::new(cb));
    }

    pub fn set_write_complete_callback<F>(&self, cb: F)
    where
        F: Fn(&Arc<HttpContext>) + Send + Sync + 'static,
    {
        *self.callbacks.write_complete.lock().unwrap() = Some(Arc::new(cb));
    }

    pub fn set_close_callback<F>(&self, cb: F)
    where
        F: Fn(&Arc<HttpContext>) + Send + Sync + 'static,
    {
        *self.callbacks.close.lock().unwrap() = Some(Arc::new(cb));
    }
}
