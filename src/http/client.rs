use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use log::warn;

use super::context::{HttpCallback, HttpContext};
use super::parser::ParserKind;
use crate::client::TcpClient;
use crate::connection::TcpConnection;
use crate::event_loop::EventLoop;

#[derive(Default)]
struct Callbacks {
    connect: Mutex<Option<HttpCallback>>,
    response: Mutex<Option<HttpCallback>>,
    close: Mutex<Option<HttpCallback>>,
}

/// HTTP/1.1 client over [`TcpClient`].
///
/// The connect callback hands the handler a context to write its request
/// through; the response callback fires per parsed response. A response
/// framed by connection close is completed when the peer hangs up.
pub struct HttpClient {
    inner: TcpClient,
    callbacks: Arc<Callbacks>,
}

impl HttpClient {
    pub fn new(event_loop: &Arc<EventLoop>, server_addr: SocketAddr) -> HttpClient {
        let inner = TcpClient::new(event_loop, server_addr);
        let callbacks = Arc::new(Callbacks::default());

        let cbs = Arc::clone(&callbacks);
        inner.set_connect_callback(move |conn| {
            let ctx = HttpContext::new(conn, ParserKind::Response);
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
                    let response = cbs.response.lock().unwrap().clone();
                    for message in messages {
                        ctx.set_current(message);
                        if let Some(cb) = response.as_ref() {
                            cb(&ctx);
                        }
                    }
                }
                Err(e) => {
                    warn!("bad response from {}: {}", conn.peer_addr(), e);
                    ctx.force_close();
                }
            }
        });

        let cbs = Arc::clone(&callbacks);
        inner.set_close_callback(move |conn| {
            if let Some(ctx) = conn.get_user_data::<Arc<HttpContext>>() {
                // EOF terminates an unframed response body.
                let leftover = ctx.finish();
                let response = cbs.response.lock().unwrap().clone();
                for message in leftover {
                    ctx.set_current(message);
                    if let Some(cb) = response.as_ref() {
                        cb(&ctx);
                    }
                }

                ctx.on_close();
                let close = cbs.close.lock().unwrap().clone();
                if let Some(cb) = close {
                    cb(&ctx);
                }
                conn.clear_user_data();
            }
        });

        HttpClient { inner, callbacks }
    }

    pub fn event_loop(&self) -> &Arc<EventLoop> {
        self.inner.event_loop()
    }

    pub fn connection(&self) -> Option<Arc<TcpConnection>> {
        self.inner.connection()
    }

    pub fn enable_reconnect(&self) {
        self.inner.enable_reconnect();
    }

    pub fn start(&self) {
        self.inner.start();
    }

    pub fn stop_connect(&self) {
        self.inner.stop_connect();
    }

    pub fn shutdown(&self) {
        self.inner.shutdown();
    }

    pub fn force_close(&self) {
        self.inner.force_close();
    }

    /// Fired when the connection is up, with the context to write the
    /// request through.
    pub fn set_connect_callback<F>(&self, cb: F)
    where
        F: Fn(&Arc<HttpContext>) + Send + Sync + 'static,
    {
        *self.callbacks.connect.lock().unwrap() = Some(Arc::new(cb));
    }

    /// Fired once per parsed response.
    pub fn set_response_callback<F>(&self, cb: F)
    where
        F: Fn(&Arc<HttpContext>) + Send + Sync + 'static,
    {
        *self.callbacks.response.lock().unwrap() = Some(Arc::new(cb));
    }

    pub fn set_close_callback<F>(&self, cb: F)
    where
        F: Fn(&Arc<HttpContext>) + Send + Sync + 'static,
    {
        *self.callbacks.close.lock().unwrap() = Some(Arc::new(cb));
    }
}
