use std::io;
use std::os::unix::io::RawFd;
use std::rc::Rc;

use indexmap::IndexMap;
use log::error;

use crate::channel::{Channel, Registration};
use crate::ready::Ready;
use crate::sys::epoll::{self, Epoll};

const INITIAL_EVENTS: usize = 16;

/// Wraps the epoll instance of one loop and tracks which channels are
/// registered with it.
///
/// A registered channel whose interest drops to empty is tombstoned: it
/// leaves the kernel set but stays in the map until explicitly removed, and
/// re-arming revives it with an add. epoll_ctl failures are programmer or
/// kernel bugs and abort.
pub struct Poller {
    epoll: Epoll,
    channels: IndexMap<RawFd, Rc<Channel>>,
    events: Vec<libc::epoll_event>,
}

impl Poller {
    pub fn new() -> io::Result<Poller> {
        Ok(Poller {
            epoll: Epoll::new()?,
            channels: IndexMap::new(),
            events: Vec::with_capacity(INITIAL_EVENTS),
        })
    }

    /// Blocks until readiness, collecting `(fd, events)` pairs. The scratch
    /// buffer doubles whenever a poll fills it.
    pub fn poll(&mut self, active: &mut Vec<(RawFd, Ready)>) {
        match self.epoll.wait(&mut self.events, None) {
            Ok(n) => {
                for event in &self.events {
                    active.push((event.u64 as RawFd, epoll::epoll_to_ready(event.events)));
                }
                if n == self.events.capacity() {
                    self.events.reserve_exact(n * 2 - self.events.len());
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => (),
            Err(e) => {
                error!("epoll_wait: {}", e);
                panic!("epoll_wait failed: {}", e);
            }
        }
    }

    pub fn channel(&self, fd: RawFd) -> Option<Rc<Channel>> {
        self.channels.get(&fd).cloned()
    }

    pub fn add_or_update(&mut self, channel: &Rc<Channel>) {
        let fd = channel.fd();
        match channel.registration() {
            Registration::Unregistered | Registration::Tombstoned => {
                if channel.registration() == Registration::Unregistered {
                    self.channels.insert(fd, Rc::clone(channel));
                }
                channel.set_registration(Registration::Registered);
                self.ctl(|ep| ep.add(fd, fd as u64, channel.interest()));
            }
            Registration::Registered => {
                if channel.has_no_interest() {
                    channel.set_registration(Registration::Tombstoned);
                    self.ctl(|ep| ep.delete(fd));
                } else {
                    self.ctl(|ep| ep.modify(fd, fd as u64, channel.interest()));
                }
            }
        }
    }

    pub fn remove(&mut self, channel: &Rc<Channel>) {
        let fd = channel.fd();
        self.channels.shift_remove(&fd);
        if channel.registration() == Registration::Registered {
            self.ctl(|ep| ep.delete(fd));
        }
        channel.set_registration(Registration::Unregistered);
    }

    fn ctl(&self, op: impl FnOnce(&Epoll) -> io::Result<()>) {
        if let Err(e) = op(&self.epoll) {
            error!("epoll_ctl: {}", e);
            panic!("epoll_ctl failed: {}", e);
        }
    }
}
