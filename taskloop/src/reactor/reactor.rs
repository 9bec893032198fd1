use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Registry, Token};
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::io;
use std::os::fd::RawFd;
use std::time::{Duration, Instant};

use tracing::trace;

use super::timer::TimerHeap;
use super::{EventBase, ReadyCallback, WatchKey};
use crate::config::DEFAULT_EVENTS_CAPACITY;
use crate::error::{Error, Result};
use crate::task::{DelayedClosure, WatchMode};

/// Readiness reported for one descriptor, waiting to be delivered.
#[derive(Debug, Clone, Copy)]
struct Readiness {
    fd: RawFd,
    readable: bool,
    writable: bool,
}

impl Readiness {
    fn matches(&self, mode: WatchMode) -> bool {
        match mode {
            WatchMode::Read => self.readable,
            WatchMode::Write => self.writable,
        }
    }
}

struct Watch {
    fd: RawFd,
    mode: WatchMode,
    persistent: bool,
    callback: ReadyCallback,
}

/// Per-descriptor registration: the OS only sees one registration per fd,
/// with the union of the interests of its watches.
#[derive(Default)]
struct FdRegistration {
    interest: Option<Interest>,
    keys: Vec<WatchKey>,
}

/// Event base backed by the OS poller (epoll on Linux, kqueue on BSDs).
///
/// mio only reports readiness edges. Every descriptor is re-registered after
/// its watches ran, which makes the OS report readiness that is still present
/// on the next poll; watches therefore behave level-triggered, the way a
/// persistent read watch on a socket with unread data is expected to.
///
/// Work is dispatched in passes: poll, run the timers already due, then
/// deliver the queued readiness one descriptor at a time. A quit request
/// between two callbacks leaves the rest queued for the next run instead of
/// dropping it.
pub struct Reactor {
    poll: RefCell<Poll>,
    // Shared registry so watches can be added while events are dispatched
    registry: Registry,
    events: RefCell<Events>,
    pending: RefCell<VecDeque<Readiness>>,
    timers: RefCell<TimerHeap>,
    fds: RefCell<HashMap<RawFd, FdRegistration>>,
    watches: RefCell<HashMap<WatchKey, Watch>>,
    next_key: Cell<u64>,
    quit: Cell<bool>,
}

impl Reactor {
    /// Creates a reactor with the default events buffer.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the OS poller cannot be created.
    pub fn new() -> Result<Self> {
        Self::with_capacity(DEFAULT_EVENTS_CAPACITY)
    }

    /// Creates a reactor that collects up to `events_capacity` readiness
    /// events per poll.
    pub fn with_capacity(events_capacity: usize) -> Result<Self> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        Ok(Self {
            poll: RefCell::new(poll),
            registry,
            events: RefCell::new(Events::with_capacity(events_capacity.max(1))),
            pending: RefCell::new(VecDeque::new()),
            timers: RefCell::new(TimerHeap::new()),
            fds: RefCell::new(HashMap::new()),
            watches: RefCell::new(HashMap::new()),
            next_key: Cell::new(0),
            quit: Cell::new(false),
        })
    }

    /// Number of active descriptor watches.
    #[must_use]
    pub fn watch_count(&self) -> usize {
        self.watches.borrow().len()
    }

    /// Number of armed timers.
    #[must_use]
    pub fn timer_count(&self) -> usize {
        self.timers.borrow().len()
    }

    /// Waits up to `timeout` for readiness and queues what the OS reports.
    fn poll_events(&self, timeout: Option<Duration>) -> Result<()> {
        let mut poll = self.poll.borrow_mut();
        let mut events = self.events.borrow_mut();

        loop {
            match poll.poll(&mut events, timeout) {
                Ok(()) => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    trace!(error = %e, "reactor poll failed");
                    return Err(Error::Poll(e));
                }
            }
        }

        let mut pending = self.pending.borrow_mut();
        for event in events.iter() {
            let ready = Readiness {
                fd: event.token().0 as RawFd,
                readable: event.is_readable() || event.is_read_closed() || event.is_error(),
                writable: event.is_writable() || event.is_write_closed() || event.is_error(),
            };
            trace!(fd = ready.fd, readable = ready.readable, writable = ready.writable, "readiness");
            match pending.iter_mut().find(|queued| queued.fd == ready.fd) {
                Some(queued) => {
                    queued.readable |= ready.readable;
                    queued.writable |= ready.writable;
                }
                None => pending.push_back(ready),
            }
        }
        Ok(())
    }

    /// Runs the earliest timer due at `now`, if there is one.
    fn run_expired_timer(&self, now: Instant) -> bool {
        let callback = self.timers.borrow_mut().pop_expired(now);
        match callback {
            Some(callback) => {
                callback();
                true
            }
            None => false,
        }
    }

    /// Delivers the next queued readiness, if there is one.
    fn dispatch_next_readiness(&self) -> bool {
        let ready = self.pending.borrow_mut().pop_front();
        match ready {
            Some(ready) => {
                self.dispatch(ready);
                true
            }
            None => false,
        }
    }

    /// Runs the timers due when the pass starts, then the readiness queued so
    /// far, one callback at a time. Returns `true` if a quit was requested.
    ///
    /// Timers posted and readiness rearmed by these callbacks wait for the
    /// next pass, so a task that keeps reposting itself cannot starve the
    /// descriptors.
    fn dispatch_pass(&self) -> bool {
        let now = Instant::now();
        let mut timers = self.timers.borrow().len();
        while timers > 0 && !self.quit.get() && self.run_expired_timer(now) {
            timers -= 1;
        }

        let mut events = self.pending.borrow().len();
        while events > 0 && !self.quit.get() && self.dispatch_next_readiness() {
            events -= 1;
        }

        self.quit.replace(false)
    }

    /// Runs the watches of one descriptor that match its readiness, in
    /// registration order, stopping early on a quit request.
    fn dispatch(&self, ready: Readiness) {
        let keys = match self.fds.borrow().get(&ready.fd) {
            Some(registration) => registration.keys.clone(),
            None => return,
        };

        for key in keys {
            let callback = {
                let watches = self.watches.borrow();
                // An earlier callback may have dropped this watch.
                let Some(watch) = watches.get(&key) else {
                    continue;
                };
                if !ready.matches(watch.mode) {
                    continue;
                }
                (watch.callback.clone(), watch.persistent)
            };

            let (callback, persistent) = callback;
            if !persistent {
                self.detach(key);
            }
            callback(ready.fd);

            if self.quit.get() {
                break;
            }
        }

        self.rearm(ready.fd);
    }

    /// Re-registers `fd` so readiness that is still present gets reported by
    /// the next poll.
    fn rearm(&self, fd: RawFd) {
        let interest = self.fds.borrow().get(&fd).and_then(|r| r.interest);
        if let Some(interest) = interest {
            if let Err(e) = self
                .registry
                .reregister(&mut SourceFd(&fd), Token(fd as usize), interest)
            {
                trace!(fd, error = %e, "failed to rearm descriptor");
            }
        }
    }

    /// Removes a watch and shrinks (or drops) the OS registration of its fd.
    fn detach(&self, key: WatchKey) {
        let Some(watch) = self.watches.borrow_mut().remove(&key) else {
            return;
        };

        let mut fds = self.fds.borrow_mut();
        let Some(registration) = fds.get_mut(&watch.fd) else {
            return;
        };
        registration.keys.retain(|k| *k != key);

        let watches = self.watches.borrow();
        let interest = combined_interest(registration.keys.iter().filter_map(|k| watches.get(k)));
        let fd = watch.fd;
        let result = match interest {
            None => {
                fds.remove(&fd);
                self.registry.deregister(&mut SourceFd(&fd))
            }
            Some(interest) if Some(interest) != registration.interest => {
                registration.interest = Some(interest);
                self.registry
                    .reregister(&mut SourceFd(&fd), Token(fd as usize), interest)
            }
            Some(_) => Ok(()),
        };
        // The descriptor may already be closed, in which case the OS dropped
        // the registration on its own.
        if let Err(e) = result {
            trace!(fd, error = %e, "failed to update registration");
        }
    }
}

fn interest_for(mode: WatchMode) -> Interest {
    match mode {
        WatchMode::Read => Interest::READABLE,
        WatchMode::Write => Interest::WRITABLE,
    }
}

fn combined_interest<'a>(watches: impl Iterator<Item = &'a Watch>) -> Option<Interest> {
    watches
        .map(|w| interest_for(w.mode))
        .reduce(|acc, interest| acc | interest)
}

impl EventBase for Reactor {
    fn run(&self) -> Result<()> {
        self.quit.set(false);

        loop {
            // Block only when nothing is queued; otherwise look for new
            // readiness without waiting so descriptors get their turn.
            let timeout = if self.pending.borrow().is_empty() {
                self.timers
                    .borrow()
                    .peek_deadline()
                    .map(|deadline| deadline.saturating_duration_since(Instant::now()))
            } else {
                Some(Duration::ZERO)
            };
            self.poll_events(timeout)?;

            if self.dispatch_pass() {
                return Ok(());
            }
        }
    }

    fn run_until_idle(&self) -> Result<()> {
        self.quit.set(false);
        self.poll_events(Some(Duration::ZERO))?;
        self.dispatch_pass();
        Ok(())
    }

    fn quit_now(&self) {
        self.quit.set(true);
    }

    fn post_delayed(&self, delay: Duration, callback: DelayedClosure) -> Result<()> {
        let deadline = Instant::now()
            .checked_add(delay)
            .ok_or(Error::DelayOverflow(delay))?;
        self.timers.borrow_mut().insert(deadline, callback);
        Ok(())
    }

    fn watch_fd(
        &self,
        fd: RawFd,
        mode: WatchMode,
        persistent: bool,
        callback: ReadyCallback,
    ) -> Result<WatchKey> {
        if fd < 0 {
            return Err(Error::InvalidFd(fd));
        }

        let mut fds = self.fds.borrow_mut();
        let registration = fds.entry(fd).or_default();
        let interest = match registration.interest {
            Some(current) => current | interest_for(mode),
            None => interest_for(mode),
        };
        let token = Token(fd as usize);
        let result = match registration.interest {
            None => self.registry.register(&mut SourceFd(&fd), token, interest),
            Some(current) if current != interest => {
                self.registry.reregister(&mut SourceFd(&fd), token, interest)
            }
            Some(_) => Ok(()),
        };
        if let Err(source) = result {
            if registration.keys.is_empty() {
                fds.remove(&fd);
            }
            return Err(Error::Register { fd, source });
        }
        registration.interest = Some(interest);

        let key = WatchKey(self.next_key.get() + 1);
        self.next_key.set(key.0);
        registration.keys.push(key);
        self.watches.borrow_mut().insert(
            key,
            Watch {
                fd,
                mode,
                persistent,
                callback,
            },
        );
        trace!(fd, %mode, persistent, key = key.0, "watching descriptor");
        Ok(key)
    }

    fn unwatch_fd(&self, key: WatchKey) {
        self.detach(key);
    }
}

impl std::fmt::Debug for Reactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reactor")
            .field("watches", &self.watches.borrow().len())
            .field("timers", &self.timers.borrow().len())
            .field("pending", &self.pending.borrow().len())
            .finish()
    }
}
