//! The event base the message loop is built on.
//!
//! An [`EventBase`] is a readiness-based I/O multiplexer with integrated
//! timers. It knows nothing about task identifiers or cancellation; it only
//! runs callbacks when a timer expires or a watched descriptor becomes ready.
//!
//! - [`Reactor`]: the production base on top of `mio` (epoll, kqueue).
//! - [`LabEventBase`]: a virtual base for deterministic tests.

pub mod lab;
pub mod reactor;
pub mod timer;

pub use lab::LabEventBase;
pub use reactor::Reactor;
pub use timer::TimerHeap;

use std::fmt;
use std::os::fd::RawFd;
use std::rc::{Rc, Weak};
use std::time::Duration;

use crate::error::Result;
use crate::task::{DelayedClosure, WatchMode};

/// Callback invoked with the ready descriptor.
pub type ReadyCallback = Rc<dyn Fn(RawFd) + 'static>;

/// Identifies one descriptor watch inside an event base.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WatchKey(pub u64);

/// Readiness and timer notification, driven from a single thread.
///
/// Callbacks run on the thread that called [`run`](Self::run) or
/// [`run_until_idle`](Self::run_until_idle) and may call back into the base
/// (post timers, add or drop watches, request a quit). Implementations must
/// not hold internal borrows while a callback executes.
pub trait EventBase {
    /// Dispatches callbacks until [`quit_now`](Self::quit_now) is called.
    ///
    /// A quit requested before this call is discarded.
    fn run(&self) -> Result<()>;

    /// Dispatches the work that is ready right now without blocking.
    fn run_until_idle(&self) -> Result<()>;

    /// Makes the running `run`/`run_until_idle` return once the callback that
    /// is currently executing returns.
    fn quit_now(&self);

    /// Arms a one-shot timer. On success `callback` runs exactly once; an
    /// armed timer cannot be disarmed.
    fn post_delayed(&self, delay: Duration, callback: DelayedClosure) -> Result<()>;

    /// Starts watching `fd` for `mode` readiness.
    ///
    /// A watch that is not `persistent` is deactivated by the base right
    /// before its first delivery.
    fn watch_fd(
        &self,
        fd: RawFd,
        mode: WatchMode,
        persistent: bool,
        callback: ReadyCallback,
    ) -> Result<WatchKey>;

    /// Stops a watch. Unknown or already deactivated keys are ignored.
    fn unwatch_fd(&self, key: WatchKey);
}

/// Owning handle to a descriptor watch; dropping it stops the watch.
///
/// Holds the base weakly so a watch outliving its base is harmless.
pub struct FdWatcher {
    key: WatchKey,
    base: Weak<dyn EventBase>,
}

impl FdWatcher {
    /// Registers a watch on `base` and wraps it in an owning handle.
    pub fn watch(
        base: &Rc<dyn EventBase>,
        fd: RawFd,
        mode: WatchMode,
        persistent: bool,
        callback: ReadyCallback,
    ) -> Result<Self> {
        let key = base.watch_fd(fd, mode, persistent, callback)?;
        Ok(Self {
            key,
            base: Rc::downgrade(base),
        })
    }

    #[must_use]
    pub fn key(&self) -> WatchKey {
        self.key
    }
}

impl Drop for FdWatcher {
    fn drop(&mut self) {
        if let Some(base) = self.base.upgrade() {
            base.unwatch_fd(self.key);
        }
    }
}

impl fmt::Debug for FdWatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FdWatcher").field("key", &self.key).finish()
    }
}
