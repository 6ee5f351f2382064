//! Echo server: `cargo run --example echo`, then `nc 127.0.0.1 7000`.

use relay_io::{EventLoop, TcpServer};

fn main() {
    env_logger::init();

    let event_loop = EventLoop::new().unwrap();
    let addr = "127.0.0.1:7000".parse().unwrap();

    let mut server = TcpServer::new(&event_loop, addr, false, 2, None).unwrap();
    server.set_connect_callback(|conn| {
        println!("connected: {}", conn.peer_addr());
    });
    server.set_message_callback(|conn, buf| {
        let bytes = buf.data().to_vec();
        buf.clear();
        conn.write(&bytes).unwrap();
    });
    server.set_close_callback(|conn| {
        println!("closed: {}", conn.peer_addr());
    });

    server.start();
    event_loop.run();
}
