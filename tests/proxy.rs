use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::Duration;

use relay_io::http::HttpServer;
use relay_io::{EventLoop, TcpClient};

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

/// A request handler wired the way a reverse proxy uses the core: pair the
/// downstream request with an upstream client on the same loop, keep the
/// client alive in the context's user-data slot, stream bytes back, and
/// tear the pairing down exactly once from either side.
#[test]
fn proxied_request_streams_back_and_tears_down_once() {
    init_logger();

    let forwarded_host: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
    let forwarded_for: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
    let upstream_closes = Arc::new(AtomicUsize::new(0));

    // Upstream: records the rewritten headers, answers, half-closes.
    let host_rec = Arc::clone(&forwarded_host);
    let for_rec = Arc::clone(&forwarded_for);
    let closes_rec = Arc::clone(&upstream_closes);
    let upstream = spawn_http_server(move |server| {
        let host_rec = Arc::clone(&host_rec);
        let for_rec = Arc::clone(&for_rec);
        server.set_request_callback(move |ctx| {
            ctx.with_message(|msg| {
                assert_eq!(msg.path, "/resource");
                *host_rec.lock().unwrap() = msg.header("host").map(str::to_string);
                *for_rec.lock().unwrap() =
                    msg.header("x-forwarded-for").map(str::to_string);
            });
            ctx.start_response(200).unwrap();
            ctx.send_header("Content-Length", "13").unwrap();
            ctx.send_header("Connection", "close").unwrap();
            ctx.end_headers().unwrap();
            ctx.send(b"from-upstream").unwrap();
            ctx.shutdown();
        });
        let closes_rec = Arc::clone(&closes_rec);
        server.set_close_callback(move |_ctx| {
            closes_rec.fetch_add(1, Ordering::SeqCst);
        });
    });

    // Downstream: the proxy itself.
    let upstream_addr = upstream.addr;
    let proxy = spawn_http_server(move |server| {
        server.set_request_callback(move |ctx| {
            // Rewrite the parsed request for the upstream hop.
            let peer = ctx.connection().peer_addr();
            let forwarded = ctx
                .with_message(|msg| {
                    msg.path = msg.path.trim_start_matches("/proxy").to_string();
                    if msg.path.is_empty() {
                        msg.path = "/".to_string();
                    }
                    msg.set_header("host", &upstream_addr.to_string());
                    msg.set_header("x-forwarded-for", &peer.to_string());
                    msg.serialize()
                })
                .unwrap();

            let client = Arc::new(TcpClient::new(ctx.event_loop(), upstream_addr));

            client.set_connect_callback(move |up_conn| {
                up_conn.write(&forwarded).unwrap();
            });
            let downstream = Arc::clone(ctx);
            client.set_message_callback(move |_up_conn, buf| {
                downstream.send(buf.data()).unwrap();
                buf.clear();
            });
            let downstream = Arc::clone(ctx);
            client.set_close_callback(move |_up_conn| {
                downstream.force_close();
            });

            client.start();

            // The upstream client lives exactly as long as this exchange.
            ctx.set_user_data(Box::new(Arc::clone(&client)));
            ctx.set_close_callback(|ctx| {
                if let Some(client) = ctx.get_user_data::<Arc<TcpClient>>() {
                    client.force_close();
                }
            });
        });
    });

    let mut stream = TcpStream::connect(proxy.addr).unwrap();
    stream
        .write_all(b"GET /proxy/resource HTTP/1.1\r\nHost: proxy\r\n\r\n")
        .unwrap();

    let mut reply = String::new();
    stream.read_to_string(&mut reply).unwrap();
    assert!(reply.starts_with("HTTP/1.1 200 OK\r\n"), "got: {}", reply);
    assert!(reply.ends_with("from-upstream"), "got: {}", reply);

    thread::sleep(Duration::from_millis(300));
    assert_eq!(
        forwarded_host.lock().unwrap().as_deref(),
        Some(upstream_addr.to_string().as_str())
    );
    assert!(forwarded_for
        .lock()
        .unwrap()
        .as_deref()
        .is_some_and(|v| v.starts_with("127.0.0.1")));
    // One upstream connection, one teardown.
    assert_eq!(upstream_closes.load(Ordering::SeqCst), 1);

    proxy.stop();
    upstream.stop();
}
