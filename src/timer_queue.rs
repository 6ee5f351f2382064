use std::collections::{BTreeSet, HashMap, HashSet};
use std::io;
use std::os::unix::io::AsRawFd;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::error;

use crate::channel::Channel;
use crate::event_loop::EventLoop;
use crate::sys::timerfd::TimerFd;

/// Arming below this floor would busy-loop the timerfd.
const MIN_ARM: Duration = Duration::from_millis(1);

static NEXT_SEQUENCE: AtomicU64 = AtomicU64::new(1);

/// Opaque handle for cancelling a timer. Stays valid across the re-arms of
/// a repeating timer.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct TimerId(u64);

pub(crate) struct Timer {
    when: Instant,
    interval: Option<Duration>,
    sequence: u64,
    // Taken out while the callback runs so firing holds no queue borrow.
    callback: Option<Box<dyn FnMut() + Send>>,
}

impl Timer {
    pub(crate) fn new(
        when: Instant,
        interval: Option<Duration>,
        callback: Box<dyn FnMut() + Send>,
    ) -> (Timer, TimerId) {
        let sequence = NEXT_SEQUENCE.fetch_add(1, Ordering::Relaxed);
        (
            Timer {
                when,
                interval,
                sequence,
                callback: Some(callback),
            },
            TimerId(sequence),
        )
    }
}

/// The ordered timer set of one loop.
///
/// Expiries are keyed `(when, sequence)` so ties fire in creation order. A
/// kernel timerfd is always armed to the earliest expiry; its readability
/// drives [`EventLoop::handle_timer_expiry`] through a regular channel.
pub(crate) struct TimerQueue {
    fd: TimerFd,
    channel: Option<Rc<Channel>>,
    queue: BTreeSet<(Instant, u64)>,
    timers: HashMap<u64, Timer>,
    calling_expired: bool,
    cancelled_in_fire: HashSet<u64>,
    fire_now: Instant,
}

impl TimerQueue {
    pub(crate) fn new() -> io::Result<TimerQueue> {
        Ok(TimerQueue {
            fd: TimerFd::new()?,
            channel: None,
            queue: BTreeSet::new(),
            timers: HashMap::new(),
            calling_expired: false,
            cancelled_in_fire: HashSet::new(),
            fire_now: Instant::now(),
        })
    }

    /// Registers the timerfd channel on `event_loop`. Called once, from the
    /// loop's constructor on the owning thread.
    pub(crate) fn install(event_loop: &Arc<EventLoop>) {
        let fd = event_loop.with_timers(|tq| tq.fd.as_raw_fd());
        let channel = Channel::new(event_loop, fd);
        let weak = Arc::downgrade(event_loop);
        channel.set_read_callback(move || {
            if let Some(event_loop) = weak.upgrade() {
                event_loop.handle_timer_expiry();
            }
        });
        channel.enable_reading();
        event_loop.with_timers(|tq| tq.channel = Some(channel));
    }

    pub(crate) fn insert(&mut self, timer: Timer) {
        let key = (timer.when, timer.sequence);
        self.timers.insert(timer.sequence, timer);
        self.queue.insert(key);
        if self.queue.first() == Some(&key) {
            self.rearm();
        }
    }

    /// Cancels by id. Outside a firing pass the timer is dropped
    /// immediately; the timer currently being fired is instead marked so
    /// its re-insertion is suppressed.
    pub(crate) fn cancel(&mut self, id: TimerId) {
        let TimerId(sequence) = id;
        if let Some(timer) = self.timers.get(&sequence) {
            if self.queue.remove(&(timer.when, sequence)) {
                self.timers.remove(&sequence);
                self.rearm();
            } else if self.calling_expired {
                self.cancelled_in_fire.insert(sequence);
            }
        }
    }

    /// Collects every timer due at `now`, removes them from the queue, and
    /// hands back their callbacks in `(expiry, sequence)` order. The queue
    /// stays unborrowed while the loop runs them.
    pub(crate) fn begin_expiry(&mut self) -> Vec<(u64, Box<dyn FnMut() + Send>)> {
        if let Err(e) = self.fd.read() {
            if e.kind() != io::ErrorKind::WouldBlock {
                error!("timerfd read: {}", e);
                panic!("timerfd read failed: {}", e);
            }
        }

        let now = Instant::now();
        self.fire_now = now;
        self.calling_expired = true;
        self.cancelled_in_fire.clear();

        let mut expired = Vec::new();
        while let Some(&(when, sequence)) = self.queue.first() {
            if when > now {
                break;
            }
            self.queue.pop_first();
            let timer = self.timers.get_mut(&sequence).expect("timer in queue");
            expired.push((sequence, timer.callback.take().expect("callback present")));
        }
        expired
    }

    /// Re-files one fired timer: repeating timers not cancelled during the
    /// pass are pushed out by their interval, everything else is dropped.
    pub(crate) fn finish_one(&mut self, sequence: u64, callback: Box<dyn FnMut() + Send>) {
        let cancelled = self.cancelled_in_fire.contains(&sequence);
        let fire_now = self.fire_now;

        let rearmed = match self.timers.get_mut(&sequence) {
            Some(timer) => match timer.interval {
                Some(interval) if !cancelled => {
                    timer.when = fire_now + interval;
                    timer.callback = Some(callback);
                    Some((timer.when, sequence))
                }
                _ => None,
            },
            None => return,
        };

        match rearmed {
            Some(key) => {
                self.queue.insert(key);
            }
            None => {
                self.timers.remove(&sequence);
            }
        }
    }

    pub(crate) fn end_expiry(&mut self) {
        self.calling_expired = false;
        self.cancelled_in_fire.clear();
        self.rearm();
    }

    /// Arms the timerfd to the earliest queued expiry, with a 1 ms floor so
    /// a past-due expiry still fires instead of disarming.
    fn rearm(&self) {
        match self.queue.first() {
            Some(&(when, _)) => {
                let delay = when.saturating_duration_since(Instant::now()).max(MIN_ARM);
                if let Err(e) = self.fd.arm(delay) {
                    error!("timerfd arm: {}", e);
                    panic!("timerfd arm failed: {}", e);
                }
            }
            None => {
                if let Err(e) = self.fd.disarm() {
                    error!("timerfd disarm: {}", e);
                    panic!("timerfd disarm failed: {}", e);
                }
            }
        }
    }
}
