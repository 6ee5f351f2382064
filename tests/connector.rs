use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

use relay_io::{EventLoop, TcpClient};

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn spawn_loop() -> (Arc<EventLoop>, thread::JoinHandle<()>) {
    let (tx, rx) = mpsc::channel();
    let handle = thread::spawn(move || {
        let event_loop = EventLoop::new().unwrap();
        tx.send(Arc::clone(&event_loop)).unwrap();
        event_loop.run();
    });
    (rx.recv().unwrap(), handle)
}

/// Grabs a loopback port that nothing is listening on right now.
fn idle_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

#[test]
fn refused_connect_backs_off_until_the_server_appears() {
    init_logger();
    let (event_loop, handle) = spawn_loop();
    let addr = idle_port();

    let client = TcpClient::new(&event_loop, addr);
    let connected = Arc::new(AtomicUsize::new(0));
    let count = Arc::clone(&connected);
    client.set_connect_callback(move |_conn| {
        count.fetch_add(1, Ordering::SeqCst);
    });

    let started = Instant::now();
    client.start();

    // First attempt is refused immediately; retries follow at 500ms and
    // 1500ms. Standing the server up after the second failure means the
    // third attempt lands.
    thread::sleep(Duration::from_millis(1100));
    assert_eq!(connected.load(Ordering::SeqCst), 0);
    let listener = TcpListener::bind(addr).unwrap();

    let deadline = Instant::now() + Duration::from_secs(10);
    while connected.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(25));
    }
    assert_eq!(connected.load(Ordering::SeqCst), 1);

    // Backoff means success cannot predate the second retry delay.
    assert!(started.elapsed() >= Duration::from_millis(1400));

    client.force_close();
    drop(listener);
    thread::sleep(Duration::from_millis(100));
    event_loop.quit();
    handle.join().unwrap();
}

#[test]
fn stop_connect_cancels_retries() {
    init_logger();
    let (event_loop, handle) = spawn_loop();
    let addr = idle_port();

    let client = TcpClient::new(&event_loop, addr);
    let connected = Arc::new(AtomicUsize::new(0));
    let count = Arc::clone(&connected);
    client.set_connect_callback(move |_conn| {
        count.fetch_add(1, Ordering::SeqCst);
    });

    client.start();
    thread::sleep(Duration::from_millis(100));
    client.stop_connect();

    // Even with a listener up, a stopped connector must not deliver.
    let _listener = TcpListener::bind(addr).unwrap();
    thread::sleep(Duration::from_millis(1500));
    assert_eq!(connected.load(Ordering::SeqCst), 0);

    event_loop.quit();
    handle.join().unwrap();
}

#[test]
fn reconnect_chases_a_restarting_server() {
    init_logger();
    let (event_loop, handle) = spawn_loop();

    // A real listener that closes every accepted connection right away.
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let accept_thread = thread::spawn(move || {
        // Accept a few connections, dropping each immediately.
        for _ in 0..3 {
            if let Ok((stream, _)) = listener.accept() {
                drop(stream);
            }
        }
    });

    let client = TcpClient::new(&event_loop, addr);
    client.enable_reconnect();
    let connects = Arc::new(AtomicUsize::new(0));
    let count = Arc::clone(&connects);
    client.set_connect_callback(move |_conn| {
        count.fetch_add(1, Ordering::SeqCst);
    });

    client.start();
    let deadline = Instant::now() + Duration::from_secs(10);
    while connects.load(Ordering::SeqCst) < 2 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(25));
    }
    assert!(connects.load(Ordering::SeqCst) >= 2);

    client.stop_connect();
    client.force_close();
    thread::sleep(Duration::from_millis(100));
    event_loop.quit();
    handle.join().unwrap();
    let _ = accept_thread.join();
}
