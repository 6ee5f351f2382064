use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::Duration;

use relay_io::http::{HttpClient, HttpServer};
use relay_io::EventLoop;

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

struct ServerHandle {
    event_loop: Arc<EventLoop>,
    addr: SocketAddr,
    thread: thread::JoinHandle<()>,
}

impl ServerHandle {
    fn stop(self) {
        self.event_loop.quit();
        self.thread.join().unwrap();
    }
}

fn spawn_http_server<F>(setup: F) -> ServerHandle
where
    F: FnOnce(&HttpServer) + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    let thread = thread::spawn(move || {
        let base_loop = EventLoop::new().unwrap();
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let server = HttpServer::new(&base_loop, addr, false, 1, None).unwrap();
        setup(&server);
        server.start();
        tx.send((Arc::clone(&base_loop), server.local_addr().unwrap()))
            .unwrap();
        base_loop.run();
    });
    let (event_loop, addr) = rx.recv().unwrap();
    ServerHandle {
        event_loop,
        addr,
        thread,
    }
}

fn ping_server() -> ServerHandle {
    spawn_http_server(|server| {
        server.set_request_callback(|ctx| {
            let path = ctx.with_message(|msg| msg.path.clone()).unwrap();
            assert_eq!(path, "/ping");
            ctx.start_response(200).unwrap();
            ctx.send_header("Content-Length", "4").unwrap();
            ctx.send_header("Connection", "close").unwrap();
            ctx.end_headers().unwrap();
            ctx.send(b"pong").unwrap();
            ctx.shutdown();
        });
    })
}

#[test]
fn http_round_trip_with_raw_client() {
    init_logger();
    let server = ping_server();

    let mut stream = TcpStream::connect(server.addr).unwrap();
    stream
        .write_all(b"GET /ping HTTP/1.1\r\nHost: test\r\n\r\n")
        .unwrap();

    let mut reply = String::new();
    stream.read_to_string(&mut reply).unwrap();
    assert!(reply.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(reply.contains("Content-Length: 4\r\n"));
    assert!(reply.ends_with("pong"));

    server.stop();
}

#[test]
fn http_round_trip_with_http_client() {
    init_logger();
    let server = ping_server();

    let (tx, rx) = mpsc::channel();
    let client_thread = thread::spawn({
        let addr = server.addr;
        move || {
            let event_loop = EventLoop::new().unwrap();
            let client = HttpClient::new(&event_loop, addr);

            client.set_connect_callback(|ctx| {
                ctx.start_request("GET", "/ping").unwrap();
                ctx.send_header("Host", "test").unwrap();
                ctx.end_headers().unwrap();
            });
            let loop_for_quit = Arc::clone(&event_loop);
            client.set_response_callback(move |ctx| {
                let (status, body) = ctx
                    .with_message(|msg| (msg.status, msg.body.clone()))
                    .unwrap();
                tx.send((status, body)).unwrap();
                ctx.force_close();
                loop_for_quit.quit();
            });

            client.start();
            event_loop.run();
        }
    });

    let (status, body) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(status, 200);
    assert_eq!(body, b"pong");

    client_thread.join().unwrap();
    server.stop();
}

#[test]
fn pipelined_requests_each_get_a_response() {
    init_logger();
    let hits = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&hits);

    let server = spawn_http_server(move |server| {
        server.set_request_callback(move |ctx| {
            let path = ctx.with_message(|msg| msg.path.clone()).unwrap();
            seen.fetch_add(1, Ordering::SeqCst);
            let body = format!("hit:{}", path);
            ctx.start_response(200).unwrap();
            ctx.send_header("Content-Length", &body.len().to_string())
                .unwrap();
            ctx.end_headers().unwrap();
            ctx.send(body.as_bytes()).unwrap();
        });
    });

    let mut stream = TcpStream::connect(server.addr).unwrap();
    stream
        .write_all(b"GET /a HTTP/1.1\r\nHost: t\r\n\r\nGET /b HTTP/1.1\r\nHost: t\r\n\r\n")
        .unwrap();

    let mut collected = Vec::new();
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    stream
        .set_read_timeout(Some(Duration::from_millis(100)))
        .unwrap();
    while std::time::Instant::now() < deadline {
        let mut chunk = [0u8; 4096];
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => collected.extend_from_slice(&chunk[..n]),
            Err(_) => {
                let text = String::from_utf8_lossy(&collected);
                if text.contains("hit:/a") && text.contains("hit:/b") {
                    break;
                }
            }
        }
    }

    let text = String::from_utf8_lossy(&collected);
    assert!(text.contains("hit:/a"), "got: {}", text);
    assert!(text.contains("hit:/b"), "got: {}", text);
    let a_at = text.find("hit:/a").unwrap();
    let b_at = text.find("hit:/b").unwrap();
    assert!(a_at < b_at, "responses out of order: {}", text);
    assert_eq!(hits.load(Ordering::SeqCst), 2);

    server.stop();
}

#[test]
fn garbage_bytes_earn_a_400() {
    init_logger();
    let server = spawn_http_server(|server| {
        server.set_request_callback(|_ctx| {
            panic!("no request should parse");
        });
    });

    let mut stream = TcpStream::connect(server.addr).unwrap();
    stream.write_all(b"\x01\x02 utter nonsense\r\n\r\n").unwrap();

    let mut reply = String::new();
    stream.read_to_string(&mut reply).unwrap();
    assert!(reply.starts_with("HTTP/1.1 400 Bad Request\r\n"), "got: {}", reply);

    server.stop();
}

#[test]
fn chunked_request_body_is_reassembled() {
    init_logger();
    let body_seen: Arc<Mutex<Option<Vec<u8>>>> = Arc::new(Mutex::new(None));
    let record = Arc::clone(&body_seen);

    let server = spawn_http_server(move |server| {
        server.set_request_callback(move |ctx| {
            let body = ctx.with_message(|msg| msg.body.clone()).unwrap();
            *record.lock().unwrap() = Some(body);
            ctx.start_response(200).unwrap();
            ctx.send_header("Content-Length", "2").unwrap();
            ctx.send_header("Connection", "close").unwrap();
            ctx.end_headers().unwrap();
            ctx.send(b"ok").unwrap();
            ctx.shutdown();
        });
    });

    let mut stream = TcpStream::connect(server.addr).unwrap();
    stream
        .write_all(
            b"POST /upload HTTP/1.1\r\nHost: t\r\nTransfer-Encoding: chunked\r\n\r\n\
              4\r\nwiki\r\n5\r\npedia\r\n0\r\n\r\n",
        )
        .unwrap();

    let mut reply = String::new();
    stream.read_to_string(&mut reply).unwrap();
    assert!(reply.ends_with("ok"));
    assert_eq!(
        body_seen.lock().unwrap().as_deref(),
        Some(b"wikipedia".as_ref())
    );

    server.stop();
}

#[test]
fn connection_close_response_is_finished_by_eof() {
    init_logger();
    // A raw TCP server that answers without any framing and closes.
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let server_thread = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let mut scratch = [0u8; 1024];
        let _ = stream.read(&mut scratch);
        stream
            .write_all(b"HTTP/1.0 200 OK\r\n\r\nstreamed until close")
            .unwrap();
    });

    let (tx, rx) = mpsc::channel();
    let client_thread = thread::spawn(move || {
        let event_loop = EventLoop::new().unwrap();
        let client = HttpClient::new(&event_loop, addr);
        client.set_connect_callback(|ctx| {
            ctx.start_request("GET", "/stream").unwrap();
            ctx.end_headers().unwrap();
        });
        let loop_for_quit = Arc::clone(&event_loop);
        client.set_response_callback(move |ctx| {
            let body = ctx.with_message(|msg| msg.body.clone()).unwrap();
            tx.send(body).unwrap();
            loop_for_quit.quit();
        });
        client.start();
        event_loop.run();
    });

    let body = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(body, b"streamed until close");

    server_thread.join().unwrap();
    client_thread.join().unwrap();
}
