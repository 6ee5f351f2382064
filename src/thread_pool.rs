use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;

use log::debug;

use crate::event_loop::EventLoop;

pub type ThreadInitCallback = Arc<dyn Fn(&Arc<EventLoop>) + Send + Sync>;

/// N worker threads, each running one event loop, plus round-robin fan-out.
///
/// Construction blocks until every worker has constructed its loop
/// on-thread and reported it back, so `next_loop` never hands out an
/// uninitialized loop. With zero workers the base loop serves connections
/// itself.
pub struct EventLoopThreadPool {
    base_loop: Arc<EventLoop>,
    loops: Vec<Arc<EventLoop>>,
    next: AtomicUsize,
    threads: Vec<thread::JoinHandle<()>>,
}

impl EventLoopThreadPool {
    pub fn new(
        base_loop: &Arc<EventLoop>,
        num_threads: usize,
        init: Option<ThreadInitCallback>,
    ) -> io::Result<EventLoopThreadPool> {
        let (tx, rx) = mpsc::channel();
        let mut threads = Vec::with_capacity(num_threads);

        for i in 0..num_threads {
            let tx = tx.clone();
            let init = init.clone();
            let handle = thread::Builder::new()
                .name(format!("loop-worker-{}", i))
                .spawn(move || {
                    let event_loop = EventLoop::new().expect("worker event loop");
                    if let Some(init) = &init {
                        init(&event_loop);
                    }
                    tx.send(Arc::clone(&event_loop)).expect("loop barrier");
                    event_loop.run();
                    debug!("loop worker {} exiting", i);
                })?;
            threads.push(handle);
        }
        drop(tx);

        // The barrier: one handle per worker before anyone can fan out.
        let mut loops = Vec::with_capacity(num_threads);
        for _ in 0..num_threads {
            loops.push(rx.recv().expect("worker failed before reporting its loop"));
        }

        Ok(EventLoopThreadPool {
            base_loop: Arc::clone(base_loop),
            loops,
            next: AtomicUsize::new(0),
            threads,
        })
    }

    /// Round-robin pick, on the base loop. Falls back to the base loop when
    /// the pool is empty.
    pub fn next_loop(&self) -> Arc<EventLoop> {
        self.base_loop.assert_in_loop();
        if self.loops.is_empty() {
            return Arc::clone(&self.base_loop);
        }

        let idx = self.next.load(Ordering::Relaxed);
        self.next
            .store((idx + 1) % self.loops.len(), Ordering::Relaxed);
        Arc::clone(&self.loops[idx])
    }

    pub fn loops(&self) -> &[Arc<EventLoop>] {
        &self.loops
    }
}

impl Drop for EventLoopThreadPool {
    fn drop(&mut self) {
        for event_loop in &self.loops {
            event_loop.quit();
        }
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
    }
}
