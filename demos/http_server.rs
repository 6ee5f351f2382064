//! Minimal HTTP server: `cargo run --example http_server`, then
//! `curl http://127.0.0.1:8080/ping`.

use relay_io::http::HttpServer;
use relay_io::EventLoop;

fn main() {
    env_logger::init();

    let event_loop = EventLoop::new().unwrap();
    let addr = "127.0.0.1:8080".parse().unwrap();

    let server = HttpServer::new(&event_loop, addr, false, 2, None).unwrap();
    server.set_request_callback(|ctx| {
        let path = ctx.with_message(|msg| msg.path.clone()).unwrap_or_default();
        match path.as_str() {
            "/ping" => {
                ctx.start_response(200).unwrap();
                ctx.send_header("Content-Length", "4").unwrap();
                ctx.end_headers().unwrap();
                ctx.send(b"pong").unwrap();
            }
            _ => {
                let _ = ctx.send_error(404);
            }
        }
    });

    server.start();
    event_loop.run();
}
