use std::fs::File;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use relay_io::{EventLoop, TcpServer};

/// Exhausts the process's descriptor table, so it cannot run alongside the
/// rest of the suite: `cargo test --test emfile -- --ignored`.
#[test]
#[ignore = "lowers the process-wide fd headroom; run alone"]
fn acceptor_recovers_from_fd_exhaustion() {
    let _ = env_logger::builder().is_test(true).try_init();

    let (tx, rx) = mpsc::channel();
    let server_thread = thread::spawn(move || {
        let base_loop = EventLoop::new().unwrap();
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let mut server = TcpServer::new(&base_loop, addr, false, 0, None).unwrap();
        server.set_message_callback(|conn, buf| {
            let bytes = buf.data().to_vec();
            buf.clear();
            conn.write(&bytes).unwrap();
        });
        server.start();
        tx.send((Arc::clone(&base_loop), server.local_addr().unwrap()))
            .unwrap();
        base_loop.run();
    });
    let (event_loop, addr) = rx.recv().unwrap();

    // Burn every available descriptor.
    let mut hoard = Vec::new();
    loop {
        match File::open("/dev/null") {
            Ok(f) => hoard.push(f),
            Err(_) => break,
        }
    }

    // Free exactly one slot: the probe's client socket takes it, leaving
    // the acceptor at EMFILE. The reserve-descriptor trick must answer
    // with an immediate close instead of wedging the listener.
    hoard.pop();
    if let Ok(mut probe) = TcpStream::connect(addr) {
        probe
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let mut scratch = [0u8; 8];
        // Reset or EOF, either way the kernel-level connection was taken
        // off the accept queue.
        let _ = probe.read(&mut scratch);
    }

    // With headroom back, accepting resumes as if nothing happened.
    hoard.clear();
    let mut stream = TcpStream::connect(addr).unwrap();
    stream.write_all(b"still alive").unwrap();
    let mut reply = [0u8; 11];
    stream.read_exact(&mut reply).unwrap();
    assert_eq!(&reply, b"still alive");

    drop(stream);
    event_loop.quit();
    server_thread.join().unwrap();
}
