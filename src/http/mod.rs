//! HTTP/1.1 on top of the TCP core: an incremental parser driven by the
//! connection's read buffer, a per-connection context with response/request
//! writing helpers, and server/client wrappers.

mod chunk;
mod context;
mod parser;
mod status;

mod client;
mod server;

pub use chunk::ChunkDecoder;
pub use client::HttpClient;
pub use context::{HttpCallback, HttpContext};
pub use parser::{HttpMessage, HttpParser, ParseError, ParserKind};
pub use server::HttpServer;
pub use status::{description, reason_phrase};
