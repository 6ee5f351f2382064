use std::cell::{RefCell, RefMut};
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use concurrent_queue::ConcurrentQueue;
use log::error;

use crate::channel::Channel;
use crate::poller::Poller;
use crate::ready::Ready;
use crate::sys::eventfd::EventFd;
use crate::timer_queue::{Timer, TimerId, TimerQueue};

/// A closure posted to a loop from any thread.
pub type Task = Box<dyn FnOnce() + Send>;

/// Interior-mutable state owned by exactly one loop thread.
///
/// The cell asserts on every access that the caller runs on the owning
/// thread, which is what makes the unchecked `Send`/`Sync` below sound: the
/// contents are only ever touched from that single thread, everything else
/// observes the cell as an opaque field. Borrow conflicts from reentrant
/// callbacks still panic via the inner `RefCell`.
pub struct LoopCell<T> {
    owner: ThreadId,
    inner: RefCell<T>,
}

unsafe impl<T> Send for LoopCell<T> {}
unsafe impl<T> Sync for LoopCell<T> {}

impl<T> LoopCell<T> {
    pub fn new(owner: ThreadId, value: T) -> LoopCell<T> {
        LoopCell {
            owner,
            inner: RefCell::new(value),
        }
    }

    pub fn borrow_mut(&self) -> RefMut<'_, T> {
        self.check();
        self.inner.borrow_mut()
    }

    fn check(&self) {
        assert_eq!(
            thread::current().id(),
            self.owner,
            "loop-owned state touched off its loop thread"
        );
    }
}

/// A single-threaded reactor: one poller, one timer queue, one task queue,
/// one wakeup descriptor.
///
/// The loop must be created on the thread that will [`run`] it and never
/// migrates. All I/O and timer dispatch happens inline on that thread;
/// other threads communicate exclusively through [`queue_in_loop`] /
/// [`run_in_loop`] and the timer API, which hop across via the task queue
/// and an eventfd wakeup.
///
/// [`run`]: EventLoop::run
/// [`queue_in_loop`]: EventLoop::queue_in_loop
/// [`run_in_loop`]: EventLoop::run_in_loop
pub struct EventLoop {
    owner: ThreadId,
    self_ref: std::sync::Weak<EventLoop>,
    running: AtomicBool,
    tasks: ConcurrentQueue<Task>,
    draining_tasks: AtomicBool,
    wakeup: EventFd,
    poller: LoopCell<Poller>,
    timers: LoopCell<TimerQueue>,
    wakeup_channel: LoopCell<Option<Rc<Channel>>>,
}

impl EventLoop {
    pub fn new() -> io::Result<Arc<EventLoop>> {
        let owner = thread::current().id();
        let wakeup = EventFd::new()?;
        let poller = Poller::new()?;
        let timers = TimerQueue::new()?;
        let event_loop = Arc::new_cyclic(|self_ref| EventLoop {
            owner,
            self_ref: self_ref.clone(),
            running: AtomicBool::new(false),
            tasks: ConcurrentQueue::unbounded(),
            draining_tasks: AtomicBool::new(false),
            wakeup,
            poller: LoopCell::new(owner, poller),
            timers: LoopCell::new(owner, timers),
            wakeup_channel: LoopCell::new(owner, None),
        });

        let channel = Channel::new(&event_loop, event_loop.wakeup.as_raw_fd());
        let weak = Arc::downgrade(&event_loop);
        channel.set_read_callback(move || {
            if let Some(event_loop) = weak.upgrade() {
                event_loop.drain_wakeup();
            }
        });
        channel.enable_reading();
        *event_loop.wakeup_channel.borrow_mut() = Some(channel);

        TimerQueue::install(&event_loop);

        Ok(event_loop)
    }

    /// Whether the calling thread owns this loop.
    pub fn is_in_loop(&self) -> bool {
        thread::current().id() == self.owner
    }

    pub fn assert_in_loop(&self) {
        assert!(
            self.is_in_loop(),
            "called off the loop thread (owner {:?}, caller {:?})",
            self.owner,
            thread::current().id()
        );
    }

    pub(crate) fn owner_thread(&self) -> ThreadId {
        self.owner
    }

    /// Runs until [`quit`]. Must be called on the constructing thread.
    ///
    /// Each iteration blocks in the poller, dispatches ready channels, then
    /// drains a snapshot of the task queue so tasks enqueued by the drained
    /// tasks themselves wait for the next iteration.
    ///
    /// [`quit`]: EventLoop::quit
    pub fn run(&self) {
        self.assert_in_loop();
        self.running.store(true, Ordering::Release);

        let mut active: Vec<(RawFd, Ready)> = Vec::new();
        while self.running.load(Ordering::Acquire) {
            active.clear();
            self.poller.borrow_mut().poll(&mut active);
            for &(fd, ready) in active.iter() {
                // Look the channel up per event: an earlier callback in the
                // same batch may have removed it.
                let channel = { self.poller.borrow_mut().channel(fd) };
                if let Some(channel) = channel {
                    channel.set_events(ready);
                    channel.handle_event();
                }
            }
            self.drain_tasks();
        }
    }

    /// Stops the loop after the current iteration. Callable from any
    /// thread.
    pub fn quit(&self) {
        self.running.store(false, Ordering::Release);
        if !self.is_in_loop() {
            self.wake();
        }
    }

    /// Runs `task` inline when called on the owner thread outside the task
    /// drain; queues it otherwise.
    pub fn run_in_loop<F: FnOnce() + Send + 'static>(&self, task: F) {
        if self.is_in_loop() && !self.draining_tasks.load(Ordering::Acquire) {
            task();
        } else {
            self.queue_in_loop(task);
        }
    }

    /// Enqueues `task` for the loop's task phase. Wakes the loop when the
    /// caller is foreign or the loop is currently draining, so the task is
    /// seen no later than the next iteration.
    pub fn queue_in_loop<F: FnOnce() + Send + 'static>(&self, task: F) {
        let _ = self.tasks.push(Box::new(task));
        if !self.is_in_loop() || self.draining_tasks.load(Ordering::Acquire) {
            self.wake();
        }
    }

    fn drain_tasks(&self) {
        self.draining_tasks.store(true, Ordering::Release);
        let pending = self.tasks.len();
        for _ in 0..pending {
            match self.tasks.pop() {
                Ok(task) => task(),
                Err(_) => break,
            }
        }
        self.draining_tasks.store(false, Ordering::Release);
    }

    fn wake(&self) {
        match self.wakeup.write(1) {
            Ok(()) => (),
            // A saturated counter is still readable, the wakeup stands.
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => (),
            Err(e) => {
                error!("eventfd write: {}", e);
                panic!("wakeup write failed: {}", e);
            }
        }
    }

    fn drain_wakeup(&self) {
        match self.wakeup.read() {
            Ok(_) => (),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => (),
            Err(e) => {
                error!("eventfd read: {}", e);
                panic!("wakeup read failed: {}", e);
            }
        }
    }

    /// Schedules `callback` at the absolute instant `when`.
    pub fn run_at<F: FnMut() + Send + 'static>(&self, when: Instant, callback: F) -> TimerId {
        self.schedule(when, None, Box::new(callback))
    }

    /// Schedules `callback` after `delay`.
    pub fn run_after<F: FnMut() + Send + 'static>(&self, delay: Duration, callback: F) -> TimerId {
        self.schedule(Instant::now() + delay, None, Box::new(callback))
    }

    /// Schedules `callback` every `interval`, first firing one interval
    /// from now. Cancelling from inside the callback stops the repetition.
    pub fn run_every<F: FnMut() + Send + 'static>(&self, interval: Duration, callback: F) -> TimerId {
        self.schedule(Instant::now() + interval, Some(interval), Box::new(callback))
    }

    pub fn cancel(&self, id: TimerId) {
        if self.is_in_loop() {
            self.timers.borrow_mut().cancel(id);
        } else {
            let event_loop = self.self_ref.upgrade().expect("loop alive");
            self.queue_in_loop(move || event_loop.timers.borrow_mut().cancel(id));
        }
    }

    fn schedule(
        &self,
        when: Instant,
        interval: Option<Duration>,
        callback: Box<dyn FnMut() + Send>,
    ) -> TimerId {
        let (timer, id) = Timer::new(when, interval, callback);
        if self.is_in_loop() {
            self.timers.borrow_mut().insert(timer);
        } else {
            let event_loop = self.self_ref.upgrade().expect("loop alive");
            self.queue_in_loop(move || event_loop.timers.borrow_mut().insert(timer));
        }
        id
    }

    pub(crate) fn with_timers<R>(&self, f: impl FnOnce(&mut TimerQueue) -> R) -> R {
        let mut timers = self.timers.borrow_mut();
        f(&mut timers)
    }

    /// Fires every due timer. Runs on the loop via the timerfd channel; the
    /// queue stays unborrowed while each callback executes so callbacks can
    /// schedule and cancel freely.
    pub(crate) fn handle_timer_expiry(&self) {
        self.assert_in_loop();
        let expired = self.timers.borrow_mut().begin_expiry();
        for (sequence, mut callback) in expired {
            callback();
            self.timers.borrow_mut().finish_one(sequence, callback);
        }
        self.timers.borrow_mut().end_expiry();
    }

    /// Registers, re-registers, or tombstones `channel` with the poller
    /// according to its interest. Owner thread only.
    pub fn add_or_update_channel(&self, channel: &Rc<Channel>) {
        self.assert_in_loop();
        self.poller.borrow_mut().add_or_update(channel);
    }

    /// Drops `channel` from the poller entirely. Owner thread only.
    pub fn remove_channel(&self, channel: &Rc<Channel>) {
        self.assert_in_loop();
        self.poller.borrow_mut().remove(channel);
    }
}

impl std::fmt::Debug for EventLoop {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.debug_struct("EventLoop")
            .field("owner", &self.owner)
            .field("running", &self.running.load(Ordering::Relaxed))
            .finish()
    }
}
