//! Deterministic event base for tests.
//!
//! [`LabEventBase`] never touches the OS. Descriptor readiness is whatever the
//! test declares with [`set_ready`](LabEventBase::set_ready), and time only
//! moves through [`advance`](LabEventBase::advance) or when a blocking run has
//! nothing left to do but wait for the next timer.
//!
//! # Differences from the OS-backed [`Reactor`](super::Reactor)
//!
//! - Readiness is level-triggered and explicit: a ready watch keeps firing
//!   until the test (or the callback) clears it.
//! - Each step of a blocking run fires the timers due at its start, then one
//!   ready watch, round-robin in registration order.
//! - A blocking [`run`](EventBase::run) returns once no timer is armed and no
//!   watch is ready, since nothing could ever wake it.
//! - Registrations can be refused on demand to exercise failure paths.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashSet};
use std::ops::Bound;
use std::os::fd::RawFd;
use std::time::{Duration, Instant};

use super::timer::TimerHeap;
use super::{EventBase, ReadyCallback, WatchKey};
use crate::error::{Error, Result};
use crate::task::{DelayedClosure, WatchMode};

struct LabWatch {
    fd: RawFd,
    mode: WatchMode,
    persistent: bool,
    callback: ReadyCallback,
}

/// Virtual event base with a manual clock and declared readiness.
pub struct LabEventBase {
    origin: Instant,
    elapsed: Cell<Duration>,
    timers: RefCell<TimerHeap>,
    watches: RefCell<BTreeMap<WatchKey, LabWatch>>,
    ready: RefCell<HashSet<(RawFd, WatchMode)>>,
    cursor: Cell<Option<WatchKey>>,
    next_key: Cell<u64>,
    quit: Cell<bool>,
    refuse_timers: Cell<bool>,
    refuse_watches: Cell<bool>,
}

impl Default for LabEventBase {
    fn default() -> Self {
        Self::new()
    }
}

impl LabEventBase {
    #[must_use]
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            elapsed: Cell::new(Duration::ZERO),
            timers: RefCell::new(TimerHeap::new()),
            watches: RefCell::new(BTreeMap::new()),
            ready: RefCell::new(HashSet::new()),
            cursor: Cell::new(None),
            next_key: Cell::new(0),
            quit: Cell::new(false),
            refuse_timers: Cell::new(false),
            refuse_watches: Cell::new(false),
        }
    }

    /// Virtual time elapsed since the base was created.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.elapsed.get()
    }

    /// Moves the virtual clock forward. Timers that become due run on the
    /// next `run`/`run_until_idle`.
    pub fn advance(&self, by: Duration) {
        self.elapsed.set(self.elapsed.get() + by);
    }

    /// Declares `fd` ready for `mode` until [`clear_ready`](Self::clear_ready).
    pub fn set_ready(&self, fd: RawFd, mode: WatchMode) {
        self.ready.borrow_mut().insert((fd, mode));
    }

    pub fn clear_ready(&self, fd: RawFd, mode: WatchMode) {
        self.ready.borrow_mut().remove(&(fd, mode));
    }

    /// Makes every following `post_delayed` fail with [`Error::Refused`].
    pub fn refuse_timers(&self, refuse: bool) {
        self.refuse_timers.set(refuse);
    }

    /// Makes every following `watch_fd` fail with [`Error::Refused`].
    pub fn refuse_watches(&self, refuse: bool) {
        self.refuse_watches.set(refuse);
    }

    #[must_use]
    pub fn watch_count(&self) -> usize {
        self.watches.borrow().len()
    }

    #[must_use]
    pub fn timer_count(&self) -> usize {
        self.timers.borrow().len()
    }

    fn now(&self) -> Instant {
        self.origin + self.elapsed.get()
    }

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

    /// Finds the next ready watch after the round-robin cursor.
    fn next_ready_watch(&self) -> Option<WatchKey> {
        let watches = self.watches.borrow();
        let ready = self.ready.borrow();
        let is_ready = |(_, w): &(&WatchKey, &LabWatch)| ready.contains(&(w.fd, w.mode));

        let after = match self.cursor.get() {
            Some(cursor) => watches
                .range((Bound::Excluded(cursor), Bound::Unbounded))
                .find(is_ready),
            None => None,
        };
        after
            .or_else(|| watches.iter().find(is_ready))
            .map(|(key, _)| *key)
    }

    /// Runs the callback of `key` if the watch still exists and is ready.
    fn fire(&self, key: WatchKey) -> bool {
        let target = {
            let mut watches = self.watches.borrow_mut();
            let Some(watch) = watches.get(&key) else {
                return false;
            };
            if !self.ready.borrow().contains(&(watch.fd, watch.mode)) {
                return false;
            }
            let target = (watch.fd, watch.callback.clone());
            if !watch.persistent {
                watches.remove(&key);
            }
            target
        };

        self.cursor.set(Some(key));
        let (fd, callback) = target;
        callback(fd);
        true
    }
}

impl EventBase for LabEventBase {
    fn run(&self) -> Result<()> {
        self.quit.set(false);

        loop {
            // One pass: the timers due now, then one ready watch.
            let now = self.now();
            let mut timers = self.timers.borrow().len();
            let mut progressed = false;
            while timers > 0 && !self.quit.get() && self.run_expired_timer(now) {
                timers -= 1;
                progressed = true;
            }
            if !self.quit.get() {
                if let Some(key) = self.next_ready_watch() {
                    progressed |= self.fire(key);
                }
            }

            if self.quit.replace(false) {
                return Ok(());
            }
            if progressed {
                continue;
            }

            // Idle: jump the virtual clock to the next timer, or give up.
            let next_deadline = self.timers.borrow().peek_deadline();
            match next_deadline {
                Some(deadline) => self.elapsed.set(deadline - self.origin),
                None => return Ok(()),
            }
        }
    }

    fn run_until_idle(&self) -> Result<()> {
        self.quit.set(false);

        let now = self.now();
        let mut timers = self.timers.borrow().len();
        while timers > 0 && !self.quit.get() && self.run_expired_timer(now) {
            timers -= 1;
        }
        if self.quit.replace(false) {
            return Ok(());
        }

        let ready: Vec<WatchKey> = {
            let watches = self.watches.borrow();
            let ready = self.ready.borrow();
            watches
                .iter()
                .filter(|(_, w)| ready.contains(&(w.fd, w.mode)))
                .map(|(key, _)| *key)
                .collect()
        };
        for key in ready {
            self.fire(key);
            if self.quit.replace(false) {
                break;
            }
        }
        Ok(())
    }

    fn quit_now(&self) {
        self.quit.set(true);
    }

    fn post_delayed(&self, delay: Duration, callback: DelayedClosure) -> Result<()> {
        if self.refuse_timers.get() {
            return Err(Error::Refused);
        }
        let deadline = self
            .now()
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
        if self.refuse_watches.get() {
            return Err(Error::Refused);
        }

        let key = WatchKey(self.next_key.get() + 1);
        self.next_key.set(key.0);
        self.watches.borrow_mut().insert(
            key,
            LabWatch {
                fd,
                mode,
                persistent,
                callback,
            },
        );
        Ok(key)
    }

    fn unwatch_fd(&self, key: WatchKey) {
        let removed = self.watches.borrow_mut().remove(&key);
        drop(removed);
    }
}
