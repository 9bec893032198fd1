//! Task identifiers and the bookkeeping entries kept by the message loop.

use std::cell::Cell;
use std::fmt;
use std::os::fd::RawFd;
use std::panic::Location;

use crate::reactor::FdWatcher;

/// A closure run once when its delay expires.
pub type DelayedClosure = Box<dyn FnOnce() + 'static>;

/// A closure run every time (or the one time) a descriptor becomes ready.
pub type IoClosure = Box<dyn FnMut() + 'static>;

/// Opaque handle returned when work is scheduled, used to cancel it.
///
/// Identifiers are unique across delayed tasks and I/O watches that are
/// outstanding at the same time. [`TaskId::NULL`] is never handed out for real
/// work and is what every scheduling call returns on failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl TaskId {
    /// The reserved "no task" identifier.
    pub const NULL: TaskId = TaskId(0);

    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::NULL
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which readiness a descriptor watch waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WatchMode {
    Read,
    Write,
}

impl fmt::Display for WatchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WatchMode::Read => f.write_str("reading"),
            WatchMode::Write => f.write_str("writing"),
        }
    }
}

/// Hands out task identifiers from a growing counter.
#[derive(Debug, Default)]
pub(crate) struct IdAllocator {
    last_id: Cell<u64>,
}

impl IdAllocator {
    #[cfg(test)]
    pub(crate) fn starting_after(last_id: u64) -> Self {
        Self {
            last_id: Cell::new(last_id),
        }
    }

    /// Returns the next identifier that is neither null nor reported as
    /// `in_use`.
    pub(crate) fn next_id(&self, in_use: impl Fn(TaskId) -> bool) -> TaskId {
        loop {
            // Wrapping needs more live registrations than memory can hold, so
            // the scan below always terminates.
            let id = TaskId(self.last_id.get().wrapping_add(1));
            self.last_id.set(id.0);
            if !id.is_null() && !in_use(id) {
                return id;
            }
        }
    }
}

/// A pending timer-triggered closure.
///
/// `closure == None` is a tombstone: the task was cancelled (or is running
/// right now) but its timer is still armed in the event base, so the entry
/// stays around to absorb the firing.
pub(crate) struct DelayedTask {
    pub(crate) location: &'static Location<'static>,
    pub(crate) closure: Option<DelayedClosure>,
}

impl DelayedTask {
    pub(crate) fn is_tombstone(&self) -> bool {
        self.closure.is_none()
    }
}

/// An active descriptor watch.
///
/// The entry owns the event base registration through `watcher`: dropping the
/// entry stops watching the descriptor.
pub(crate) struct IoTask {
    pub(crate) location: &'static Location<'static>,
    pub(crate) fd: RawFd,
    pub(crate) mode: WatchMode,
    pub(crate) persistent: bool,
    /// Taken out while a persistent closure runs and put back afterwards.
    pub(crate) closure: Option<IoClosure>,
    pub(crate) watcher: FdWatcher,
}
