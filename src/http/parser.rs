use std::collections::VecDeque;
use std::fmt;
use std::mem;

use indexmap::IndexMap;

use super::chunk::ChunkDecoder;

pub const MAX_HEADERS: usize = 64;
const MAX_HEAD_SIZE: usize = 64 * 1024;

#[derive(Debug)]
pub enum ParseError {
    Head(httparse::Error),
    HeadTooLarge,
    BadContentLength,
    BadChunk,
}

impl fmt::Display for ParseError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ParseError::Head(e) => write!(fmt, "invalid message head: {}", e),
            ParseError::HeadTooLarge => write!(fmt, "message head too large"),
            ParseError::BadContentLength => write!(fmt, "invalid content-length"),
            ParseError::BadChunk => write!(fmt, "invalid chunked framing"),
        }
    }
}

impl std::error::Error for ParseError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParserKind {
    Request,
    Response,
}

/// One parsed HTTP message: a request when `method` is set, a response when
/// `status` is. Header names are normalized to lowercase; a repeated header
/// keeps its first position and the last value wins.
#[derive(Debug, Clone, Default)]
pub struct HttpMessage {
    pub method: String,
    pub path: String,
    pub version_major: u8,
    pub version_minor: u8,
    pub status: u16,
    pub reason: String,
    pub headers: IndexMap<String, String>,
    pub body: Vec<u8>,
    /// Ordinal of this message on its connection, starting at 0.
    pub sequence: u64,
}

impl HttpMessage {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(|v| v.as_str())
    }

    pub fn set_header(&mut self, name: &str, value: &str) {
        self.headers
            .insert(name.to_ascii_lowercase(), value.to_string());
    }

    pub fn is_request(&self) -> bool {
        !self.method.is_empty()
    }

    /// Keep-alive by header, falling back to the version default.
    pub fn keep_alive(&self) -> bool {
        match self.header("connection") {
            Some(v) => !v.eq_ignore_ascii_case("close"),
            None => !(self.version_major == 1 && self.version_minor == 0),
        }
    }

    /// Re-emits the message on the wire, headers in their current order.
    /// Used when forwarding a rewritten request upstream.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(256 + self.body.len());
        if self.is_request() {
            out.extend_from_slice(
                format!(
                    "{} {} HTTP/{}.{}\r\n",
                    self.method, self.path, self.version_major, self.version_minor
                )
                .as_bytes(),
            );
        } else {
            out.extend_from_slice(
                format!(
                    "HTTP/{}.{} {} {}\r\n",
                    self.version_major, self.version_minor, self.status, self.reason
                )
                .as_bytes(),
            );
        }
        for (name, value) in &self.headers {
            out.extend_from_slice(format!("{}: {}\r\n", name, value).as_bytes());
        }
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&self.body);
        out
    }
}

#[derive(Clone, Copy)]
enum ParseState {
    Head,
    FixedBody { remaining: usize },
    ChunkedBody,
    ReadToEof,
}

/// Incremental HTTP/1.1 parser.
///
/// Bytes go in through [`advance`]; completed messages come out of
/// [`next_message`] in order, so keep-alive pipelining falls out naturally.
/// The optional hooks fire inside `advance`: headers-complete with the
/// in-progress message once its head is parsed, message-complete with each
/// finished message before it is queued.
///
/// Responses that carry neither `Content-Length` nor chunked framing run
/// until EOF; the driver signals that through [`finish`].
///
/// [`advance`]: HttpParser::advance
/// [`next_message`]: HttpParser::next_message
/// [`finish`]: HttpParser::finish
pub struct HttpParser {
    kind: ParserKind,
    state: ParseState,
    pending: Vec<u8>,
    message: HttpMessage,
    chunk: ChunkDecoder,
    next_sequence: u64,
    completed: VecDeque<HttpMessage>,
    headers_cb: Option<Box<dyn FnMut(&HttpMessage)>>,
    message_cb: Option<Box<dyn FnMut(&HttpMessage)>>,
}

impl HttpParser {
    pub fn new(kind: ParserKind) -> HttpParser {
        HttpParser {
            kind,
            state: ParseState::Head,
            pending: Vec::new(),
            message: HttpMessage::default(),
            chunk: ChunkDecoder::new(),
            next_sequence: 0,
            completed: VecDeque::new(),
            headers_cb: None,
            message_cb: None,
        }
    }

    pub fn request() -> HttpParser {
        HttpParser::new(ParserKind::Request)
    }

    pub fn response() -> HttpParser {
        HttpParser::new(ParserKind::Response)
    }

    pub fn set_headers_complete_callback<F: FnMut(&HttpMessage) + 'static>(&mut self, cb: F) {
        self.headers_cb = Some(Box::new(cb));
    }

    pub fn set_message_complete_callback<F: FnMut(&HttpMessage) + 'static>(&mut self, cb: F) {
        self.message_cb = Some(Box::new(cb));
    }

    /// The message currently being parsed.
    pub fn message(&self) -> &HttpMessage {
        &self.message
    }

    /// Pops the next fully parsed message.
    pub fn next_message(&mut self) -> Option<HttpMessage> {
        self.completed.pop_front()
    }

    /// Feeds bytes. May complete zero or more messages.
    pub fn advance(&mut self, data: &[u8]) -> Result<(), ParseError> {
        self.pending.extend_from_slice(data);

        loop {
            match self.state {
                ParseState::Head => {
                    if self.pending.is_empty() {
                        return Ok(());
                    }
                    if !self.parse_head()? {
                        if self.pending.len() > MAX_HEAD_SIZE {
                            return Err(ParseError::HeadTooLarge);
                        }
                        return Ok(());
                    }
                }
                ParseState::FixedBody { remaining } => {
                    let take = remaining.min(self.pending.len());
                    self.message.body.extend_from_slice(&self.pending[..take]);
                    self.pending.drain(..take);
                    let left = remaining - take;
                    if left > 0 {
                        self.state = ParseState::FixedBody { remaining: left };
                        return Ok(());
                    }
                    self.complete_message();
                }
                ParseState::ChunkedBody => {
                    let (consumed, done) = self
                        .chunk
                        .decode(&self.pending, &mut self.message.body)?;
                    self.pending.drain(..consumed);
                    if !done {
                        return Ok(());
                    }
                    self.complete_message();
                }
                ParseState::ReadToEof => {
                    self.message.body.extend_from_slice(&self.pending);
                    self.pending.clear();
                    return Ok(());
                }
            }
        }
    }

    /// Signals EOF: completes an in-flight read-to-EOF response.
    pub fn finish(&mut self) {
        if matches!(self.state, ParseState::ReadToEof) {
            self.complete_message();
        }
    }

    /// Attempts to parse a message head out of the pending bytes. Returns
    /// false when more input is needed.
    fn parse_head(&mut self) -> Result<bool, ParseError> {
        let mut raw_headers = [httparse::EMPTY_HEADER; MAX_HEADERS];

        // A fresh message slot begins here, which is what makes keep-alive
        // reuse of the parser work.
        let mut message = HttpMessage::default();
        let head_len;

        match self.kind {
            ParserKind::Request => {
                let mut req = httparse::Request::new(&mut raw_headers);
                match req.parse(&self.pending).map_err(ParseError::Head)? {
                    httparse::Status::Partial => return Ok(false),
                    httparse::Status::Complete(n) => {
                        head_len = n;
                        message.method = req.method.unwrap_or_default().to_string();
                        message.path = req.path.unwrap_or("/").to_string();
                        message.version_major = 1;
                        message.version_minor = req.version.unwrap_or(1);
                        fill_headers(&mut message, req.headers);
                    }
                }
            }
            ParserKind::Response => {
                let mut resp = httparse::Response::new(&mut raw_headers);
                match resp.parse(&self.pending).map_err(ParseError::Head)? {
                    httparse::Status::Partial => return Ok(false),
                    httparse::Status::Complete(n) => {
                        head_len = n;
                        message.status = resp.code.unwrap_or_default();
                        message.reason = resp.reason.unwrap_or_default().to_string();
                        message.version_major = 1;
                        message.version_minor = resp.version.unwrap_or(1);
                        fill_headers(&mut message, resp.headers);
                    }
                }
            }
        }

        message.sequence = self.next_sequence;
        self.next_sequence += 1;
        self.pending.drain(..head_len);
        self.message = message;

        if let Some(cb) = self.headers_cb.as_mut() {
            cb(&self.message);
        }

        self.state = self.body_framing()?;
        if matches!(self.state, ParseState::Head) {
            // No body at all; the message is already complete.
            self.complete_message();
        }
        Ok(true)
    }

    /// Decides how the body of the just-parsed head is framed.
    fn body_framing(&mut self) -> Result<ParseState, ParseError> {
        if let Some(te) = self.message.header("transfer-encoding") {
            if te.to_ascii_lowercase().contains("chunked") {
                self.chunk.reset();
                return Ok(ParseState::ChunkedBody);
            }
        }

        if let Some(cl) = self.message.header("content-length") {
            let len: usize = cl.trim().parse().map_err(|_| ParseError::BadContentLength)?;
            return Ok(if len == 0 {
                ParseState::Head
            } else {
                ParseState::FixedBody { remaining: len }
            });
        }

        match self.kind {
            // Requests without framing carry no body.
            ParserKind::Request => Ok(ParseState::Head),
            ParserKind::Response => {
                let code = self.message.status;
                if (100..200).contains(&code) || code == 204 || code == 304 {
                    Ok(ParseState::Head)
                } else {
                    Ok(ParseState::ReadToEof)
                }
            }
        }
    }

    fn complete_message(&mut self) {
        self.state = ParseState::Head;
        let message = mem::take(&mut self.message);
        if let Some(cb) = self.message_cb.as_mut() {
            cb(&message);
        }
        self.completed.push_back(message);
    }
}

fn fill_headers(message: &mut HttpMessage, headers: &[httparse::Header]) {
    for h in headers {
        let name = h.name.to_ascii_lowercase();
        let value = String::from_utf8_lossy(h.value).into_owned();
        message.headers.insert(name, value);
    }
}

#[cfg(test)]
mod test {
    use super::{HttpParser, ParseError};

    #[test]
    fn request_with_content_length() {
        let mut parser = HttpParser::request();
        parser
            .advance(b"POST /submit HTTP/1.1\r\nHost: a\r\nContent-Length: 4\r\n\r\nnext")
            .unwrap();

        let msg = parser.next_message().unwrap();
        assert_eq!(msg.method, "POST");
        assert_eq!(msg.path, "/submit");
        assert_eq!(msg.version_minor, 1);
        assert_eq!(msg.header("host"), Some("a"));
        assert_eq!(msg.body, b"next");
        assert_eq!(msg.sequence, 0);
        assert!(parser.next_message().is_none());
    }

    #[test]
    fn request_split_across_reads() {
        let mut parser = HttpParser::request();
        parser.advance(b"GET /pi").unwrap();
        assert!(parser.next_message().is_none());
        parser.advance(b"ng HTTP/1.1\r\n\r").unwrap();
        assert!(parser.next_message().is_none());
        parser.advance(b"\n").unwrap();

        let msg = parser.next_message().unwrap();
        assert_eq!(msg.method, "GET");
        assert_eq!(msg.path, "/ping");
        assert!(msg.body.is_empty());
    }

    #[test]
    fn pipelined_requests_in_one_read() {
        let mut parser = HttpParser::request();
        parser
            .advance(b"GET /a HTTP/1.1\r\n\r\nGET /b HTTP/1.1\r\n\r\n")
            .unwrap();

        let first = parser.next_message().unwrap();
        let second = parser.next_message().unwrap();
        assert_eq!(first.path, "/a");
        assert_eq!(second.path, "/b");
        assert_eq!(first.sequence, 0);
        assert_eq!(second.sequence, 1);
    }

    #[test]
    fn response_with_body() {
        let mut parser = HttpParser::response();
        parser
            .advance(b"HTTP/1.1 200 OK\r\nContent-Length: 4\r\nConnection: close\r\n\r\npong")
            .unwrap();

        let msg = parser.next_message().unwrap();
        assert_eq!(msg.status, 200);
        assert_eq!(msg.reason, "OK");
        assert_eq!(msg.body, b"pong");
        assert!(!msg.keep_alive());
    }

    #[test]
    fn chunked_response() {
        let mut parser = HttpParser::response();
        parser
            .advance(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n")
            .unwrap();
        assert!(parser.next_message().is_none());
        parser.advance(b"4\r\nwiki\r\n5\r\npedia\r\n").unwrap();
        assert!(parser.next_message().is_none());
        parser.advance(b"0\r\n\r\n").unwrap();

        let msg = parser.next_message().unwrap();
        assert_eq!(msg.body, b"wikipedia");
    }

    #[test]
    fn response_read_to_eof() {
        let mut parser = HttpParser::response();
        parser.advance(b"HTTP/1.0 200 OK\r\n\r\npartial bo").unwrap();
        assert!(parser.next_message().is_none());
        parser.advance(b"dy").unwrap();
        parser.finish();

        let msg = parser.next_message().unwrap();
        assert_eq!(msg.body, b"partial body");
    }

    #[test]
    fn no_body_statuses_complete_immediately() {
        let mut parser = HttpParser::response();
        parser.advance(b"HTTP/1.1 204 No Content\r\n\r\n").unwrap();
        let msg = parser.next_message().unwrap();
        assert_eq!(msg.status, 204);
        assert!(msg.body.is_empty());
    }

    #[test]
    fn duplicate_header_last_wins_in_place() {
        let mut parser = HttpParser::request();
        parser
            .advance(b"GET / HTTP/1.1\r\nX-Tag: one\r\nHost: h\r\nX-Tag: two\r\n\r\n")
            .unwrap();

        let msg = parser.next_message().unwrap();
        assert_eq!(msg.header("x-tag"), Some("two"));
        let names: Vec<&str> = msg.headers.keys().map(|k| k.as_str()).collect();
        assert_eq!(names, ["x-tag", "host"]);
    }

    #[test]
    fn headers_complete_hook_fires_before_body() {
        let seen = std::rc::Rc::new(std::cell::Cell::new(false));
        let mut parser = HttpParser::request();
        let flag = std::rc::Rc::clone(&seen);
        parser.set_headers_complete_callback(move |msg| {
            assert_eq!(msg.header("content-length"), Some("4"));
            assert!(msg.body.is_empty());
            flag.set(true);
        });

        parser
            .advance(b"PUT /x HTTP/1.1\r\nContent-Length: 4\r\n\r\nbody")
            .unwrap();
        assert!(seen.get());
        assert_eq!(parser.next_message().unwrap().body, b"body");
    }

    #[test]
    fn malformed_head_is_an_error() {
        let mut parser = HttpParser::request();
        assert!(matches!(
            parser.advance(b"NOT AN HTTP LINE\x01\r\n\r\n"),
            Err(ParseError::Head(_))
        ));
    }

    #[test]
    fn bad_content_length_is_an_error() {
        let mut parser = HttpParser::request();
        assert!(matches!(
            parser.advance(b"GET / HTTP/1.1\r\nContent-Length: ten\r\n\r\n"),
            Err(ParseError::BadContentLength)
        ));
    }

    #[test]
    fn serialize_round_trips_a_request() {
        let mut parser = HttpParser::request();
        parser
            .advance(b"GET /p HTTP/1.1\r\nHost: up\r\n\r\n")
            .unwrap();
        let mut msg = parser.next_message().unwrap();
        msg.set_header("x-forwarded-for", "10.0.0.1:9999");

        let wire = msg.serialize();
        let text = String::from_utf8(wire).unwrap();
        assert!(text.starts_with("GET /p HTTP/1.1\r\n"));
        assert!(text.contains("host: up\r\n"));
        assert!(text.contains("x-forwarded-for: 10.0.0.1:9999\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }
}
