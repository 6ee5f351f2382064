use std::any::Any;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::os::unix::io::RawFd;
use std::rc::{Rc, Weak as RcWeak};
use std::sync::{Arc, Weak};

use crate::event_loop::EventLoop;
use crate::ready::Ready;

pub type EventCallback = Box<dyn FnMut()>;

/// Registration state the poller tracks per channel. A tombstoned channel
/// has been dropped from the kernel set because its interest became empty,
/// but its map entry survives until the channel is explicitly removed.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum Registration {
    Unregistered,
    Registered,
    Tombstoned,
}

/// Binds a descriptor to one event loop: an interest mask, the event mask
/// from the last poll, and the four event callbacks.
///
/// A channel does not own its descriptor, and it is loop-local: it must be
/// created, operated on, and destroyed on its loop's thread. The optional
/// weak tie lets dispatch detect that the owning object died between poll
/// and callback.
pub struct Channel {
    fd: RawFd,
    event_loop: Weak<EventLoop>,
    self_ref: RcWeak<Channel>,
    interest: Cell<Ready>,
    events: Cell<Ready>,
    registration: Cell<Registration>,
    tie: RefCell<Option<Weak<dyn Any + Send + Sync>>>,
    read_cb: RefCell<Option<EventCallback>>,
    write_cb: RefCell<Option<EventCallback>>,
    close_cb: RefCell<Option<EventCallback>>,
    error_cb: RefCell<Option<EventCallback>>,
}

impl Channel {
    pub fn new(event_loop: &Arc<EventLoop>, fd: RawFd) -> Rc<Channel> {
        Rc::new_cyclic(|self_ref| Channel {
            fd,
            event_loop: Arc::downgrade(event_loop),
            self_ref: self_ref.clone(),
            interest: Cell::new(Ready::empty()),
            events: Cell::new(Ready::empty()),
            registration: Cell::new(Registration::Unregistered),
            tie: RefCell::new(None),
            read_cb: RefCell::new(None),
            write_cb: RefCell::new(None),
            close_cb: RefCell::new(None),
            error_cb: RefCell::new(None),
        })
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn interest(&self) -> Ready {
        self.interest.get()
    }

    pub fn has_no_interest(&self) -> bool {
        self.interest.get().is_empty()
    }

    pub fn has_read_interest(&self) -> bool {
        self.interest.get().is_readable()
    }

    pub fn has_write_interest(&self) -> bool {
        self.interest.get().is_writable()
    }

    pub(crate) fn registration(&self) -> Registration {
        self.registration.get()
    }

    pub(crate) fn set_registration(&self, state: Registration) {
        self.registration.set(state);
    }

    pub fn set_read_callback<F: FnMut() + 'static>(&self, cb: F) {
        *self.read_cb.borrow_mut() = Some(Box::new(cb));
    }

    pub fn set_write_callback<F: FnMut() + 'static>(&self, cb: F) {
        *self.write_cb.borrow_mut() = Some(Box::new(cb));
    }

    pub fn set_close_callback<F: FnMut() + 'static>(&self, cb: F) {
        *self.close_cb.borrow_mut() = Some(Box::new(cb));
    }

    pub fn set_error_callback<F: FnMut() + 'static>(&self, cb: F) {
        *self.error_cb.borrow_mut() = Some(Box::new(cb));
    }

    /// Ties dispatch to `owner`'s liveness: once the owner is gone, events
    /// that were already collected are dropped instead of dispatched.
    pub fn tie(&self, owner: Weak<dyn Any + Send + Sync>) {
        *self.tie.borrow_mut() = Some(owner);
    }

    pub(crate) fn set_events(&self, events: Ready) {
        self.events.set(events);
    }

    pub fn events(&self) -> Ready {
        self.events.get()
    }

    pub fn enable_reading(&self) {
        let mut interest = self.interest.get();
        interest.insert(Ready::readable());
        self.interest.set(interest);
        self.apply_interest();
    }

    pub fn disable_reading(&self) {
        let mut interest = self.interest.get();
        interest.remove(Ready::readable());
        self.interest.set(interest);
        self.apply_interest();
    }

    pub fn enable_writing(&self) {
        let mut interest = self.interest.get();
        interest.insert(Ready::writable());
        self.interest.set(interest);
        self.apply_interest();
    }

    pub fn disable_writing(&self) {
        let mut interest = self.interest.get();
        interest.remove(Ready::writable());
        self.interest.set(interest);
        self.apply_interest();
    }

    pub fn disable_all(&self) {
        self.interest.set(Ready::empty());
        self.apply_interest();
    }

    fn apply_interest(&self) {
        let this = self.self_ref.upgrade().expect("channel alive");
        if let Some(event_loop) = self.event_loop.upgrade() {
            event_loop.add_or_update_channel(&this);
        }
    }

    /// Drops the channel from its poller. Interest must already be empty.
    pub fn remove(&self) {
        assert!(self.has_no_interest());
        let this = self.self_ref.upgrade().expect("channel alive");
        if let Some(event_loop) = self.event_loop.upgrade() {
            event_loop.remove_channel(&this);
        }
    }

    pub(crate) fn handle_event(&self) {
        let tied = self.tie.borrow().clone();
        match tied {
            Some(tie) => {
                // Keep the owner alive across dispatch; skip if it is gone.
                if let Some(_guard) = tie.upgrade() {
                    self.dispatch();
                }
            }
            None => self.dispatch(),
        }
    }

    fn dispatch(&self) {
        let events = self.events.get();

        if events.is_hup() && !events.is_readable() {
            Self::invoke(&self.close_cb);
        }

        if events.is_error() {
            Self::invoke(&self.error_cb);
        }

        if events.is_readable() {
            Self::invoke(&self.read_cb);
        }

        if events.is_writable() {
            Self::invoke(&self.write_cb);
        }
    }

    fn invoke(slot: &RefCell<Option<EventCallback>>) {
        if let Some(cb) = slot.borrow_mut().as_mut() {
            cb();
        }
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.debug_struct("Channel")
            .field("fd", &self.fd)
            .field("interest", &self.interest.get())
            .field("registration", &self.registration.get())
            .finish()
    }
}
