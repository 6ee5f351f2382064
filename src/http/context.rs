use std::any::Any;
use std::io;
use std::sync::Arc;

use log::warn;

use super::parser::{HttpMessage, HttpParser, ParseError, ParserKind};
use super::status;
use crate::connection::TcpConnection;
use crate::event_loop::{EventLoop, LoopCell};

pub type HttpCallback = Arc<dyn Fn(&Arc<HttpContext>) + Send + Sync>;

type ContextHook = Box<dyn FnMut(&Arc<HttpContext>)>;

/// Per-connection HTTP state: the parser, the most recently completed
/// message, write helpers for building messages on the wire, and a small
/// user-data slot for handler state (a reverse proxy parks its upstream
/// client there so it lives exactly as long as the request).
///
/// A context is bound to one connection and therefore to one loop; all of
/// its state is loop-affine.
pub struct HttpContext {
    conn: Arc<TcpConnection>,
    self_ref: std::sync::Weak<HttpContext>,
    parser: LoopCell<HttpParser>,
    current: LoopCell<Option<HttpMessage>>,
    user_data: LoopCell<Option<Box<dyn Any>>>,
    write_complete_cb: LoopCell<Option<ContextHook>>,
    close_cb: LoopCell<Option<ContextHook>>,
}

impl HttpContext {
    pub(crate) fn new(conn: &Arc<TcpConnection>, kind: ParserKind) -> Arc<HttpContext> {
        let owner = conn.event_loop().owner_thread();
        Arc::new_cyclic(|self_ref| HttpContext {
            conn: Arc::clone(conn),
            self_ref: self_ref.clone(),
            parser: LoopCell::new(owner, HttpParser::new(kind)),
            current: LoopCell::new(owner, None),
            user_data: LoopCell::new(owner, None),
            write_complete_cb: LoopCell::new(owner, None),
            close_cb: LoopCell::new(owner, None),
        })
    }

    fn strong(&self) -> Arc<HttpContext> {
        self.self_ref.upgrade().expect("context alive")
    }

    pub fn connection(&self) -> &Arc<TcpConnection> {
        &self.conn
    }

    pub fn event_loop(&self) -> &Arc<EventLoop> {
        self.conn.event_loop()
    }

    /// Runs the parser over freshly read bytes, returning the messages that
    /// completed.
    pub(crate) fn advance(&self, data: &[u8]) -> Result<Vec<HttpMessage>, ParseError> {
        let mut parser = self.parser.borrow_mut();
        parser.advance(data)?;
        let mut messages = Vec::new();
        while let Some(msg) = parser.next_message() {
            messages.push(msg);
        }
        Ok(messages)
    }

    /// EOF seen: completes a read-to-EOF response, if one was in flight.
    pub(crate) fn finish(&self) -> Vec<HttpMessage> {
        let mut parser = self.parser.borrow_mut();
        parser.finish();
        let mut messages = Vec::new();
        while let Some(msg) = parser.next_message() {
            messages.push(msg);
        }
        messages
    }

    pub(crate) fn set_current(&self, message: HttpMessage) {
        *self.current.borrow_mut() = Some(message);
    }

    /// Grants the handler access to the parsed message surfaced by the last
    /// request/response callback.
    pub fn with_message<R>(&self, f: impl FnOnce(&mut HttpMessage) -> R) -> Option<R> {
        self.current.borrow_mut().as_mut().map(f)
    }

    /// Takes the surfaced message out entirely.
    pub fn take_message(&self) -> Option<HttpMessage> {
        self.current.borrow_mut().take()
    }

    pub fn start_request(&self, method: &str, url: &str) -> io::Result<()> {
        self.conn
            .write(format!("{} {} HTTP/1.1\r\n", method, url).as_bytes())?;
        Ok(())
    }

    pub fn start_response(&self, code: u16) -> io::Result<()> {
        let reason = status::reason_phrase(code).unwrap_or("Unknown");
        self.start_response_with(code, reason)
    }

    pub fn start_response_with(&self, code: u16, reason: &str) -> io::Result<()> {
        self.conn
            .write(format!("HTTP/1.1 {} {}\r\n", code, reason).as_bytes())?;
        Ok(())
    }

    pub fn send_header(&self, name: &str, value: &str) -> io::Result<()> {
        self.conn
            .write(format!("{}: {}\r\n", name, value).as_bytes())?;
        Ok(())
    }

    pub fn end_headers(&self) -> io::Result<()> {
        self.conn.write(b"\r\n")?;
        Ok(())
    }

    pub fn send(&self, contents: &[u8]) -> io::Result<usize> {
        self.conn.write(contents)
    }

    pub fn shutdown(&self) {
        self.conn.shutdown();
    }

    pub fn force_close(&self) {
        self.conn.force_close();
    }

    /// Emits a minimal HTML error page and half-closes.
    pub fn send_error(&self, code: u16) -> io::Result<()> {
        let reason = status::reason_phrase(code).unwrap_or("Unknown");
        let detail = status::description(code).unwrap_or("");
        let body = format!(
            "<html><head><title>{code} {reason}</title></head>\
             <body><h1>{code} {reason}</h1><p>{detail}</p></body></html>",
        );

        self.start_response_with(code, reason)?;
        self.send_header("Content-Type", "text/html")?;
        self.send_header("Content-Length", &body.len().to_string())?;
        self.end_headers()?;
        self.send(body.as_bytes())?;
        self.shutdown();
        Ok(())
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

    /// Hook run after a write drains this connection's buffer.
    pub fn set_write_complete_callback<F>(&self, cb: F)
    where
        F: FnMut(&Arc<HttpContext>) + 'static,
    {
        *self.write_complete_cb.borrow_mut() = Some(Box::new(cb));
    }

    /// Hook run once when the connection goes down.
    pub fn set_close_callback<F>(&self, cb: F)
    where
        F: FnMut(&Arc<HttpContext>) + 'static,
    {
        *self.close_cb.borrow_mut() = Some(Box::new(cb));
    }

    pub(crate) fn on_write_complete(&self) {
        let cb = self.write_complete_cb.borrow_mut().take();
        if let Some(mut cb) = cb {
            cb(&self.strong());
            let mut slot = self.write_complete_cb.borrow_mut();
            if slot.is_none() {
                *slot = Some(cb);
            }
        }
    }

    /// Fires the close hook at most once and drops the per-context state
    /// that would otherwise keep the connection alive.
    pub(crate) fn on_close(&self) {
        let cb = self.close_cb.borrow_mut().take();
        if let Some(mut cb) = cb {
            cb(&self.strong());
        }
        *self.write_complete_cb.borrow_mut() = None;
        if self.conn.is_connected() {
            warn!("context closed while connection still established");
        }
        self.clear_user_data();
        *self.current.borrow_mut() = None;
    }
}
