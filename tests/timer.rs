use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use relay_io::{EventLoop, TimerId};

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

#[test]
fn run_after_fires_once() {
    init_logger();
    let (event_loop, handle) = spawn_loop();
    let fired = Arc::new(AtomicUsize::new(0));

    let count = Arc::clone(&fired);
    event_loop.run_after(Duration::from_millis(30), move || {
        count.fetch_add(1, Ordering::SeqCst);
    });

    thread::sleep(Duration::from_millis(300));
    assert_eq!(fired.load(Ordering::SeqCst), 1);

    event_loop.quit();
    handle.join().unwrap();
}

#[test]
fn run_every_repeats_and_cancel_inside_callback_stops_it() {
    init_logger();
    let (event_loop, handle) = spawn_loop();
    let fired = Arc::new(AtomicUsize::new(0));
    let id_slot: Arc<Mutex<Option<TimerId>>> = Arc::new(Mutex::new(None));

    let count = Arc::clone(&fired);
    let slot = Arc::clone(&id_slot);
    let loop_for_cancel = Arc::clone(&event_loop);
    let id = event_loop.run_every(Duration::from_millis(20), move || {
        let n = count.fetch_add(1, Ordering::SeqCst) + 1;
        if n == 5 {
            // Cancellation from inside the callback must suppress the
            // re-arm.
            let id = slot.lock().unwrap().expect("id recorded");
            loop_for_cancel.cancel(id);
        }
    });
    *id_slot.lock().unwrap() = Some(id);

    thread::sleep(Duration::from_millis(500));
    assert_eq!(fired.load(Ordering::SeqCst), 5);

    event_loop.quit();
    handle.join().unwrap();
}

#[test]
fn repeating_timer_keeps_pace() {
    init_logger();
    let (event_loop, handle) = spawn_loop();
    let fired = Arc::new(AtomicUsize::new(0));

    let count = Arc::clone(&fired);
    let id = event_loop.run_every(Duration::from_millis(50), move || {
        count.fetch_add(1, Ordering::SeqCst);
    });

    thread::sleep(Duration::from_millis(1000));
    let seen = fired.load(Ordering::SeqCst);
    // ~19-20 expected in a quiet second; allow scheduler slack.
    assert!(seen >= 12, "only {} firings in 1s", seen);
    assert!(seen <= 21, "{} firings in 1s", seen);

    event_loop.cancel(id);
    event_loop.quit();
    handle.join().unwrap();
}

#[test]
fn cancel_before_expiry_prevents_firing() {
    init_logger();
    let (event_loop, handle) = spawn_loop();
    let fired = Arc::new(AtomicUsize::new(0));

    let count = Arc::clone(&fired);
    let id = event_loop.run_after(Duration::from_millis(200), move || {
        count.fetch_add(1, Ordering::SeqCst);
    });
    event_loop.cancel(id);

    thread::sleep(Duration::from_millis(400));
    assert_eq!(fired.load(Ordering::SeqCst), 0);

    event_loop.quit();
    handle.join().unwrap();
}

#[test]
fn identical_expiry_fires_in_creation_order() {
    init_logger();
    let (event_loop, handle) = spawn_loop();
    let order: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));

    let when = Instant::now() + Duration::from_millis(50);
    for tag in 0..4u32 {
        let order = Arc::clone(&order);
        event_loop.run_at(when, move || {
            order.lock().unwrap().push(tag);
        });
    }

    thread::sleep(Duration::from_millis(300));
    assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);

    event_loop.quit();
    handle.join().unwrap();
}

#[test]
fn timers_scheduled_from_a_timer_callback() {
    init_logger();
    let (event_loop, handle) = spawn_loop();
    let fired = Arc::new(AtomicUsize::new(0));

    let count = Arc::clone(&fired);
    let inner_loop = Arc::clone(&event_loop);
    event_loop.run_after(Duration::from_millis(20), move || {
        let count = Arc::clone(&count);
        inner_loop.run_after(Duration::from_millis(20), move || {
            count.fetch_add(1, Ordering::SeqCst);
        });
    });

    thread::sleep(Duration::from_millis(300));
    assert_eq!(fired.load(Ordering::SeqCst), 1);

    event_loop.quit();
    handle.join().unwrap();
}
