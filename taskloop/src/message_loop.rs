//! The message loop: cancellable delayed tasks and descriptor watches on top
//! of an [`EventBase`].
//!
//! Every piece of work gets a [`TaskId`] from one identifier space shared by
//! both kinds of tasks, so a single [`cancel`](MessageLoop::cancel) serves both.
//!
//! Closures run on the thread driving the loop and may call back into it
//! through a [`LoopHandle`] (schedule more work, cancel any task including
//! their own, stop the loop).

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::os::fd::RawFd;
use std::panic::Location;
use std::rc::{Rc, Weak};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::LoopConfig;
use crate::error::Result;
use crate::reactor::{EventBase, FdWatcher, Reactor};
use crate::task::{
    DelayedClosure, DelayedTask, IdAllocator, IoClosure, IoTask, TaskId, WatchMode,
};
use crate::telemetry::{self, Kind};

thread_local! {
    static CURRENT: RefCell<Option<LoopHandle>> = const { RefCell::new(None) };
}

/// Bookkeeping shared between the loop, its handles and the callbacks it
/// registers with the event base.
struct LoopInner {
    base: Rc<dyn EventBase>,
    ids: IdAllocator,
    delayed_tasks: RefCell<HashMap<TaskId, DelayedTask>>,
    io_tasks: RefCell<HashMap<TaskId, IoTask>>,
    /// Armed by `run_once`; the first callback to run clears it and quits
    /// the event base.
    run_once: Cell<bool>,
}

impl LoopInner {
    fn next_task_id(&self) -> TaskId {
        let delayed_tasks = self.delayed_tasks.borrow();
        let io_tasks = self.io_tasks.borrow();
        self.ids
            .next_id(|id| delayed_tasks.contains_key(&id) || io_tasks.contains_key(&id))
    }

    fn schedule_delayed(
        self: &Rc<Self>,
        location: &'static Location<'static>,
        closure: DelayedClosure,
        delay: Duration,
    ) -> TaskId {
        let task_id = self.next_task_id();
        let weak = Rc::downgrade(self);
        let scheduled = self.base.post_delayed(
            delay,
            Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.on_delayed_fire(task_id);
                }
            }),
        );

        if let Err(error) = scheduled {
            warn!(%location, ?delay, %error, "failed to schedule delayed task");
            telemetry::increment(telemetry::REGISTRATION_FAILURES, Kind::Delayed);
            return TaskId::NULL;
        }
        debug!(%task_id, %location, ?delay, "scheduled delayed task");

        self.delayed_tasks.borrow_mut().insert(
            task_id,
            DelayedTask {
                location,
                closure: Some(closure),
            },
        );
        telemetry::increment(telemetry::TASKS_SCHEDULED, Kind::Delayed);
        self.record_pending();
        task_id
    }

    fn watch_fd(
        self: &Rc<Self>,
        location: &'static Location<'static>,
        fd: RawFd,
        mode: WatchMode,
        persistent: bool,
        closure: IoClosure,
    ) -> TaskId {
        if fd < 0 {
            debug!(fd, %location, "refusing to watch invalid file descriptor");
            return TaskId::NULL;
        }

        let task_id = self.next_task_id();
        let weak = Rc::downgrade(self);
        let watcher = FdWatcher::watch(
            &self.base,
            fd,
            mode,
            persistent,
            Rc::new(move |fd| {
                if let Some(inner) = weak.upgrade() {
                    inner.on_file_ready(task_id, fd);
                }
            }),
        );
        let persistence = if persistent { "persistently" } else { "just once" };

        let watcher = match watcher {
            Ok(watcher) => watcher,
            Err(error) => {
                warn!(fd, %mode, persistence, %location, %error, "failed to watch file descriptor");
                telemetry::increment(telemetry::REGISTRATION_FAILURES, Kind::Io);
                return TaskId::NULL;
            }
        };
        debug!(%task_id, fd, %mode, persistence, %location, "watching file descriptor");

        self.io_tasks.borrow_mut().insert(
            task_id,
            IoTask {
                location,
                fd,
                mode,
                persistent,
                closure: Some(closure),
                watcher,
            },
        );
        telemetry::increment(telemetry::TASKS_SCHEDULED, Kind::Io);
        self.record_pending();
        task_id
    }

    fn cancel(&self, task_id: TaskId) -> bool {
        if task_id.is_null() {
            return false;
        }

        let mut delayed_tasks = self.delayed_tasks.borrow_mut();
        if let Some(task) = delayed_tasks.get_mut(&task_id) {
            // Already cancelled, or running right now.
            let Some(closure) = task.closure.take() else {
                return false;
            };
            debug!(%task_id, location = %task.location, "cancelled delayed task");
            // The timer cannot be disarmed: keep the tombstone until it fires.
            drop(delayed_tasks);
            drop(closure);
            telemetry::increment(telemetry::TASKS_CANCELLED, Kind::Delayed);
            return true;
        }
        drop(delayed_tasks);

        let removed = self.io_tasks.borrow_mut().remove(&task_id);
        let Some(task) = removed else {
            return false;
        };
        debug!(%task_id, fd = task.fd, location = %task.location, "cancelled file descriptor watch");
        // Dropping the watcher stops watching the descriptor.
        drop(task);
        telemetry::increment(telemetry::TASKS_CANCELLED, Kind::Io);
        self.record_pending();
        true
    }

    fn is_pending(&self, task_id: TaskId) -> bool {
        let armed = self
            .delayed_tasks
            .borrow()
            .get(&task_id)
            .is_some_and(|task| !task.is_tombstone());
        armed || self.io_tasks.borrow().contains_key(&task_id)
    }

    /// Timer trampoline. The event base fires it at most once per task.
    fn on_delayed_fire(self: &Rc<Self>, task_id: TaskId) {
        let armed = {
            let mut delayed_tasks = self.delayed_tasks.borrow_mut();
            let Some(task) = delayed_tasks.get_mut(&task_id) else {
                debug_assert!(false, "timer fired for unknown delayed task {task_id}");
                return;
            };
            // The entry stays as a tombstone while the closure runs, so a
            // cancel from inside the closure fails instead of double-running.
            task.closure.take().map(|closure| (closure, task.location))
        };

        if let Some((closure, location)) = armed {
            debug!(%task_id, %location, "running delayed task");
            closure();
            telemetry::increment(telemetry::TASKS_RUN, Kind::Delayed);
            self.finish_callback();
        }

        let removed = self.delayed_tasks.borrow_mut().remove(&task_id);
        drop(removed);
        self.record_pending();
    }

    /// Readiness trampoline for both read and write watches.
    ///
    /// `self` was upgraded by the watch callback before anything else, so the
    /// loop stays reachable even when the task entry does not survive its
    /// closure.
    fn on_file_ready(self: &Rc<Self>, task_id: TaskId, fd: RawFd) {
        let mut io_tasks = self.io_tasks.borrow_mut();
        let Some(task) = io_tasks.get_mut(&task_id) else {
            debug_assert!(false, "readiness for unknown file descriptor task {task_id}");
            return;
        };
        debug!(%task_id, fd, location = %task.location, "running file descriptor task");

        if task.persistent {
            // Only a run nested inside this same closure finds it taken out.
            // Nothing runs then, so the run-once flag is left for a real task.
            let Some(mut closure) = task.closure.take() else {
                return;
            };
            drop(io_tasks);
            closure();

            // Put the closure back unless the closure cancelled its own task.
            let orphaned = match self.io_tasks.borrow_mut().get_mut(&task_id) {
                Some(task) => {
                    task.closure = Some(closure);
                    None
                }
                None => Some(closure),
            };
            drop(orphaned);
        } else {
            let Some(IoTask {
                closure, watcher, ..
            }) = io_tasks.remove(&task_id)
            else {
                return;
            };
            drop(io_tasks);
            // Stop watching before the closure runs; it must not find its
            // own entry anymore.
            drop(watcher);
            self.record_pending();
            if let Some(mut closure) = closure {
                closure();
            }
        }

        telemetry::increment(telemetry::TASKS_RUN, Kind::Io);
        self.finish_callback();
    }

    fn finish_callback(&self) {
        if self.run_once.replace(false) {
            self.base.quit_now();
        }
    }

    fn record_pending(&self) {
        telemetry::set_pending(Kind::Delayed, self.delayed_tasks.borrow().len());
        telemetry::set_pending(Kind::Io, self.io_tasks.borrow().len());
    }
}

impl Drop for LoopInner {
    fn drop(&mut self) {
        for (task_id, task) in std::mem::take(self.io_tasks.get_mut()) {
            debug!(
                %task_id,
                fd = task.fd,
                location = %task.location,
                "removing file descriptor watch leaked on the message loop"
            );
            drop(task);
        }

        let mut lazily_deleted = 0usize;
        for (task_id, task) in std::mem::take(self.delayed_tasks.get_mut()) {
            if task.is_tombstone() {
                lazily_deleted += 1;
            } else {
                debug!(
                    %task_id,
                    location = %task.location,
                    "removing delayed task leaked on the message loop"
                );
            }
        }
        if lazily_deleted > 0 {
            info!(count = lazily_deleted, "leaking {lazily_deleted} cancelled tasks");
        }
    }
}

/// Single-threaded scheduler for delayed closures and descriptor watches.
///
/// Dropping the loop releases every remaining watch and discards every
/// pending delayed task without running it.
///
/// # Examples
///
/// ```ignore
/// let message_loop = MessageLoop::new()?;
/// let handle = message_loop.handle();
/// message_loop.schedule_delayed(move || handle.stop(), Duration::from_millis(10));
/// message_loop.run()?;
/// ```
pub struct MessageLoop {
    inner: Rc<LoopInner>,
}

impl MessageLoop {
    /// Creates a loop on a new OS-backed [`Reactor`].
    ///
    /// # Errors
    ///
    /// Returns an error if the OS poller cannot be created.
    pub fn new() -> Result<Self> {
        Self::with_config(LoopConfig::default())
    }

    /// Creates a loop on a [`Reactor`] sized by `config`, installing the
    /// metrics exporter when one is configured.
    pub fn with_config(config: LoopConfig) -> Result<Self> {
        if let Some(addr) = config.metrics_addr {
            telemetry::install_prometheus(addr)?;
        }
        let reactor = Reactor::with_capacity(config.events_capacity)?;
        Ok(Self::with_event_base(Rc::new(reactor)))
    }

    /// Creates a loop on any event base.
    #[must_use]
    pub fn with_event_base(base: Rc<dyn EventBase>) -> Self {
        Self {
            inner: Rc::new(LoopInner {
                base,
                ids: IdAllocator::default(),
                delayed_tasks: RefCell::new(HashMap::new()),
                io_tasks: RefCell::new(HashMap::new()),
                run_once: Cell::new(false),
            }),
        }
    }

    #[must_use]
    pub fn event_base(&self) -> &Rc<dyn EventBase> {
        &self.inner.base
    }

    /// A weak handle closures can capture to call back into the loop.
    #[must_use]
    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            inner: Rc::downgrade(&self.inner),
        }
    }

    /// Makes this loop the one returned by [`current`] on this thread.
    pub fn set_as_current(&self) {
        CURRENT.with(|current| *current.borrow_mut() = Some(self.handle()));
    }

    /// Runs `task` as soon as the loop gets to it.
    #[track_caller]
    pub fn post_task(&self, task: impl FnOnce() + 'static) -> TaskId {
        self.schedule_delayed(task, Duration::ZERO)
    }

    /// Runs `task` once, after `delay`.
    ///
    /// Returns [`TaskId::NULL`] if the event base rejects the timer.
    #[track_caller]
    pub fn schedule_delayed(&self, task: impl FnOnce() + 'static, delay: Duration) -> TaskId {
        let location = Location::caller();
        self.inner.schedule_delayed(location, Box::new(task), delay)
    }

    /// Runs `task` when `fd` becomes ready for `mode`, every time if
    /// `persistent`, otherwise once.
    ///
    /// Returns [`TaskId::NULL`] for a negative descriptor or when the event
    /// base refuses to watch it.
    #[track_caller]
    pub fn watch_fd(
        &self,
        fd: RawFd,
        mode: WatchMode,
        persistent: bool,
        task: impl FnMut() + 'static,
    ) -> TaskId {
        let location = Location::caller();
        let task = Box::new(task);
        self.inner.watch_fd(location, fd, mode, persistent, task)
    }

    /// Cancels a delayed task or a descriptor watch.
    ///
    /// Returns `false` for the null id, unknown ids, tasks that were already
    /// cancelled, and delayed tasks that already started running.
    pub fn cancel(&self, task_id: TaskId) -> bool {
        self.inner.cancel(task_id)
    }

    /// Runs tasks until [`stop`](Self::stop) is called.
    pub fn run(&self) -> Result<()> {
        self.inner.base.run()
    }

    /// Runs at most one task.
    ///
    /// With `may_block` the call waits for a timer or a descriptor; otherwise
    /// it only looks at what is ready right now. Returns whether a task ran.
    pub fn run_once(&self, may_block: bool) -> Result<bool> {
        self.inner.run_once.set(true);
        let result = if may_block {
            self.inner.base.run()
        } else {
            self.inner.base.run_until_idle()
        };
        // The first task to run cleared the flag.
        let ran = !self.inner.run_once.replace(false);
        result?;
        Ok(ran)
    }

    /// Makes the running [`run`](Self::run) return after the current task.
    pub fn stop(&self) {
        self.inner.base.quit_now();
    }

    /// Delayed tasks still held by the loop, cancelled ones included until
    /// their timer fires.
    #[must_use]
    pub fn pending_delayed_tasks(&self) -> usize {
        self.inner.delayed_tasks.borrow().len()
    }

    #[must_use]
    pub fn pending_io_tasks(&self) -> usize {
        self.inner.io_tasks.borrow().len()
    }

    /// Whether `task_id` would still run (armed delayed task or live watch).
    #[must_use]
    pub fn is_pending(&self, task_id: TaskId) -> bool {
        self.inner.is_pending(task_id)
    }
}

impl Drop for MessageLoop {
    fn drop(&mut self) {
        let this = Rc::as_ptr(&self.inner);
        let _ = CURRENT.try_with(|current| {
            let mut current = current.borrow_mut();
            if current
                .as_ref()
                .is_some_and(|handle| std::ptr::eq(handle.inner.as_ptr(), this))
            {
                *current = None;
            }
        });
    }
}

impl fmt::Debug for MessageLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageLoop")
            .field("delayed_tasks", &self.pending_delayed_tasks())
            .field("io_tasks", &self.pending_io_tasks())
            .finish()
    }
}

/// Weak, clonable access to a [`MessageLoop`] from inside its closures.
///
/// Once the loop is dropped every call fails: scheduling returns
/// [`TaskId::NULL`] and `cancel` returns `false`.
#[derive(Clone)]
pub struct LoopHandle {
    inner: Weak<LoopInner>,
}

impl LoopHandle {
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.inner.strong_count() > 0
    }

    #[track_caller]
    pub fn post_task(&self, task: impl FnOnce() + 'static) -> TaskId {
        self.schedule_delayed(task, Duration::ZERO)
    }

    #[track_caller]
    pub fn schedule_delayed(&self, task: impl FnOnce() + 'static, delay: Duration) -> TaskId {
        let location = Location::caller();
        match self.inner.upgrade() {
            Some(inner) => inner.schedule_delayed(location, Box::new(task), delay),
            None => {
                debug!(%location, "message loop is gone, dropping delayed task");
                TaskId::NULL
            }
        }
    }

    #[track_caller]
    pub fn watch_fd(
        &self,
        fd: RawFd,
        mode: WatchMode,
        persistent: bool,
        task: impl FnMut() + 'static,
    ) -> TaskId {
        let location = Location::caller();
        match self.inner.upgrade() {
            Some(inner) => inner.watch_fd(location, fd, mode, persistent, Box::new(task)),
            None => {
                debug!(fd, %location, "message loop is gone, not watching file descriptor");
                TaskId::NULL
            }
        }
    }

    pub fn cancel(&self, task_id: TaskId) -> bool {
        self.inner
            .upgrade()
            .is_some_and(|inner| inner.cancel(task_id))
    }

    pub fn stop(&self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.base.quit_now();
        }
    }

    #[must_use]
    pub fn is_pending(&self, task_id: TaskId) -> bool {
        self.inner
            .upgrade()
            .is_some_and(|inner| inner.is_pending(task_id))
    }
}

impl fmt::Debug for LoopHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopHandle")
            .field("alive", &self.is_alive())
            .finish()
    }
}

/// The loop registered with [`MessageLoop::set_as_current`] on this thread.
#[must_use]
pub fn current() -> Option<LoopHandle> {
    CURRENT.with(|current| current.borrow().clone().filter(LoopHandle::is_alive))
}

/// Posts `task` to the current loop of this thread.
///
/// Returns [`TaskId::NULL`] when no loop is current.
#[track_caller]
pub fn post_task(task: impl FnOnce() + 'static) -> TaskId {
    let location = Location::caller();
    match current() {
        Some(handle) => match handle.inner.upgrade() {
            Some(inner) => inner.schedule_delayed(location, Box::new(task), Duration::ZERO),
            None => TaskId::NULL,
        },
        None => {
            warn!(%location, "post_task called without a current message loop");
            TaskId::NULL
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactor::LabEventBase;
    use crate::test_utils::{init_test_logging, DropFlag};
    use std::collections::HashSet;

    fn lab_loop() -> (Rc<LabEventBase>, MessageLoop) {
        init_test_logging();
        let lab = Rc::new(LabEventBase::new());
        let message_loop = MessageLoop::with_event_base(lab.clone());
        (lab, message_loop)
    }

    fn counter() -> (Rc<Cell<u32>>, impl Fn() + Clone) {
        let hits = Rc::new(Cell::new(0));
        let inner = hits.clone();
        (hits, move || inner.set(inner.get() + 1))
    }

    #[test]
    fn ids_are_unique_across_both_tables() {
        let (_lab, message_loop) = lab_loop();
        let mut ids = HashSet::new();
        for fd in 0..8 {
            ids.insert(message_loop.post_task(|| {}));
            ids.insert(message_loop.watch_fd(fd, WatchMode::Read, true, || {}));
        }
        assert_eq!(ids.len(), 16);
        assert!(!ids.contains(&TaskId::NULL));
    }

    #[test]
    fn delayed_task_runs_once() {
        let (lab, message_loop) = lab_loop();
        let (hits, hit) = counter();
        let id = message_loop.schedule_delayed(hit, Duration::from_millis(5));
        assert!(message_loop.is_pending(id));

        assert!(!message_loop.run_once(false).unwrap());
        lab.advance(Duration::from_millis(5));
        assert!(message_loop.run_once(false).unwrap());
        assert_eq!(hits.get(), 1);
        assert_eq!(message_loop.pending_delayed_tasks(), 0);
        assert!(!message_loop.cancel(id));
    }

    #[test]
    fn cancelled_delayed_task_never_runs() {
        let (lab, message_loop) = lab_loop();
        let (hits, hit) = counter();
        let id = message_loop.schedule_delayed(hit, Duration::from_secs(1));

        assert!(message_loop.cancel(id));
        assert!(!message_loop.cancel(id));
        assert!(!message_loop.is_pending(id));
        // The tombstone waits for the timer.
        assert_eq!(message_loop.pending_delayed_tasks(), 1);

        lab.advance(Duration::from_secs(1));
        assert!(!message_loop.run_once(false).unwrap());
        assert_eq!(hits.get(), 0);
        assert_eq!(message_loop.pending_delayed_tasks(), 0);
    }

    #[test]
    fn cancel_releases_the_closure() {
        let (_lab, message_loop) = lab_loop();
        let flag = DropFlag::new();
        let guard = flag.guard();
        let id = message_loop.post_task(move || drop(guard));

        assert!(!flag.is_dropped());
        assert!(message_loop.cancel(id));
        assert!(flag.is_dropped());
    }

    #[test]
    fn delayed_task_cannot_cancel_itself() {
        let (_lab, message_loop) = lab_loop();
        let handle = message_loop.handle();
        let own_id = Rc::new(Cell::new(TaskId::NULL));
        let result = Rc::new(Cell::new(None));

        let id = {
            let own_id = own_id.clone();
            let result = result.clone();
            message_loop.post_task(move || result.set(Some(handle.cancel(own_id.get()))))
        };
        own_id.set(id);

        assert!(message_loop.run_once(true).unwrap());
        assert_eq!(result.get(), Some(false));
        assert_eq!(message_loop.pending_delayed_tasks(), 0);
    }

    #[test]
    fn rejected_timer_leaves_no_state() {
        let (lab, message_loop) = lab_loop();
        lab.refuse_timers(true);
        let flag = DropFlag::new();
        let guard = flag.guard();

        let id = message_loop.post_task(move || drop(guard));
        assert_eq!(id, TaskId::NULL);
        assert_eq!(message_loop.pending_delayed_tasks(), 0);
        assert!(flag.is_dropped());
    }

    #[test]
    fn invalid_or_rejected_watches_return_null() {
        let (lab, message_loop) = lab_loop();
        assert_eq!(message_loop.watch_fd(-1, WatchMode::Read, true, || {}), TaskId::NULL);

        lab.refuse_watches(true);
        assert_eq!(message_loop.watch_fd(3, WatchMode::Write, false, || {}), TaskId::NULL);

        assert_eq!(message_loop.pending_io_tasks(), 0);
        assert_eq!(lab.watch_count(), 0);
    }

    #[test]
    fn cancelled_watch_never_fires() {
        let (lab, message_loop) = lab_loop();
        let (hits, hit) = counter();
        let id = message_loop.watch_fd(5, WatchMode::Read, true, hit);
        assert_eq!(lab.watch_count(), 1);

        assert!(message_loop.cancel(id));
        assert_eq!(lab.watch_count(), 0);
        assert!(!message_loop.cancel(id));

        lab.set_ready(5, WatchMode::Read);
        assert!(!message_loop.run_once(false).unwrap());
        assert_eq!(hits.get(), 0);
    }

    #[test]
    fn one_shot_watch_is_gone_before_its_closure_runs() {
        let (lab, message_loop) = lab_loop();
        let handle = message_loop.handle();
        let own_id = Rc::new(Cell::new(TaskId::NULL));
        let observed = Rc::new(Cell::new(None));

        let id = {
            let own_id = own_id.clone();
            let observed = observed.clone();
            let lab = lab.clone();
            message_loop.watch_fd(6, WatchMode::Write, false, move || {
                observed.set(Some((handle.cancel(own_id.get()), lab.watch_count())));
            })
        };
        own_id.set(id);
        lab.set_ready(6, WatchMode::Write);

        assert!(message_loop.run_once(false).unwrap());
        assert_eq!(observed.get(), Some((false, 0)));
        assert_eq!(message_loop.pending_io_tasks(), 0);

        // Still ready, but nothing watches it anymore.
        assert!(!message_loop.run_once(false).unwrap());
    }

    #[test]
    fn persistent_watch_fires_until_cancelled() {
        let (lab, message_loop) = lab_loop();
        let (hits, hit) = counter();
        let id = message_loop.watch_fd(7, WatchMode::Read, true, hit);
        lab.set_ready(7, WatchMode::Read);

        for expected in 1..=3 {
            assert!(message_loop.run_once(false).unwrap());
            assert_eq!(hits.get(), expected);
        }
        assert!(message_loop.is_pending(id));

        assert!(message_loop.cancel(id));
        assert!(!message_loop.run_once(false).unwrap());
        assert_eq!(hits.get(), 3);
    }

    #[test]
    fn persistent_watch_can_cancel_itself() {
        let (lab, message_loop) = lab_loop();
        let handle = message_loop.handle();
        let own_id = Rc::new(Cell::new(TaskId::NULL));
        let (hits, hit) = counter();
        let cancelled = Rc::new(Cell::new(false));

        let id = {
            let own_id = own_id.clone();
            let cancelled = cancelled.clone();
            message_loop.watch_fd(8, WatchMode::Read, true, move || {
                hit();
                cancelled.set(handle.cancel(own_id.get()));
            })
        };
        own_id.set(id);
        lab.set_ready(8, WatchMode::Read);

        assert!(message_loop.run_once(false).unwrap());
        assert!(cancelled.get());
        assert_eq!(lab.watch_count(), 0);

        assert!(!message_loop.run_once(false).unwrap());
        assert_eq!(hits.get(), 1);
    }

    #[test]
    fn watch_closure_can_cancel_another_task() {
        let (lab, message_loop) = lab_loop();
        let handle = message_loop.handle();
        let (hits, hit) = counter();
        let victim = message_loop.schedule_delayed(hit, Duration::from_millis(1));

        message_loop.watch_fd(9, WatchMode::Read, false, move || {
            assert!(handle.cancel(victim));
        });
        lab.set_ready(9, WatchMode::Read);

        assert!(message_loop.run_once(false).unwrap());
        lab.advance(Duration::from_millis(1));
        assert!(!message_loop.run_once(false).unwrap());
        assert_eq!(hits.get(), 0);
    }

    #[test]
    fn run_once_runs_exactly_one_task() {
        let (_lab, message_loop) = lab_loop();
        let (hits, hit) = counter();
        message_loop.post_task(hit.clone());
        message_loop.post_task(hit);

        assert!(message_loop.run_once(false).unwrap());
        assert_eq!(hits.get(), 1);
        assert!(message_loop.run_once(false).unwrap());
        assert_eq!(hits.get(), 2);
        assert!(!message_loop.run_once(false).unwrap());
    }

    #[test]
    fn run_once_without_work_returns_false() {
        let (_lab, message_loop) = lab_loop();
        assert!(!message_loop.run_once(false).unwrap());
        assert!(!message_loop.run_once(true).unwrap());
    }

    #[test]
    fn run_once_blocks_until_the_timer() {
        let (lab, message_loop) = lab_loop();
        let (hits, hit) = counter();
        message_loop.schedule_delayed(hit, Duration::from_secs(60));

        assert!(message_loop.run_once(true).unwrap());
        assert_eq!(hits.get(), 1);
        assert_eq!(lab.elapsed(), Duration::from_secs(60));
    }

    #[test]
    fn stop_ends_run() {
        let (lab, message_loop) = lab_loop();
        let handle = message_loop.handle();
        let (hits, hit) = counter();
        let counted = hits.clone();
        message_loop.watch_fd(10, WatchMode::Read, true, move || {
            hit();
            if counted.get() == 3 {
                handle.stop();
            }
        });
        lab.set_ready(10, WatchMode::Read);

        message_loop.run().unwrap();
        assert_eq!(hits.get(), 3);
    }

    #[test]
    fn two_persistent_watches_both_fire() {
        let (lab, message_loop) = lab_loop();
        let handle = message_loop.handle();
        let seen = Rc::new(RefCell::new(Vec::new()));

        for fd in [11, 12] {
            let seen = seen.clone();
            let handle = handle.clone();
            message_loop.watch_fd(fd, WatchMode::Read, true, move || {
                let mut seen = seen.borrow_mut();
                if !seen.contains(&fd) {
                    seen.push(fd);
                }
                if seen.len() == 2 {
                    handle.stop();
                }
            });
            lab.set_ready(fd, WatchMode::Read);
        }

        message_loop.run().unwrap();
        assert_eq!(*seen.borrow(), vec![11, 12]);
    }

    #[test]
    fn closures_can_schedule_more_work() {
        let (_lab, message_loop) = lab_loop();
        let handle = message_loop.handle();
        let (hits, hit) = counter();
        message_loop.post_task(move || {
            handle.post_task(hit);
        });

        assert!(message_loop.run_once(false).unwrap());
        assert_eq!(message_loop.pending_delayed_tasks(), 1);
        assert!(message_loop.run_once(false).unwrap());
        assert_eq!(hits.get(), 1);
    }

    #[test]
    fn dropping_the_loop_releases_everything() {
        let (lab, message_loop) = lab_loop();
        let watch_flag = DropFlag::new();
        let delayed_flag = DropFlag::new();
        let (hits, hit) = counter();

        let watch_guard = watch_flag.guard();
        message_loop.watch_fd(13, WatchMode::Read, true, move || {
            let _ = &watch_guard;
        });
        let delayed_guard = delayed_flag.guard();
        message_loop.schedule_delayed(
            move || {
                drop(delayed_guard);
                hit();
            },
            Duration::from_secs(1),
        );
        let cancelled = message_loop.schedule_delayed(|| {}, Duration::from_secs(1));
        assert!(message_loop.cancel(cancelled));
        let handle = message_loop.handle();

        drop(message_loop);
        assert_eq!(lab.watch_count(), 0);
        assert!(watch_flag.is_dropped());
        assert!(delayed_flag.is_dropped());

        // The armed timers still fire, into nothing.
        lab.run().unwrap();
        assert_eq!(hits.get(), 0);
        assert!(!handle.is_alive());
        assert_eq!(handle.post_task(|| {}), TaskId::NULL);
        assert!(!handle.cancel(cancelled));
    }

    fn repost_until(handle: LoopHandle, runs: Rc<Cell<u32>>, limit: u32) {
        let next = handle.clone();
        handle.post_task(move || {
            runs.set(runs.get() + 1);
            if runs.get() == limit {
                next.stop();
            } else {
                repost_until(next, runs, limit);
            }
        });
    }

    #[test]
    fn reposting_task_does_not_starve_ready_watches() {
        let (lab, message_loop) = lab_loop();
        let (io_hits, on_ready) = counter();
        message_loop.watch_fd(14, WatchMode::Read, true, on_ready);
        lab.set_ready(14, WatchMode::Read);

        let runs = Rc::new(Cell::new(0));
        repost_until(message_loop.handle(), runs.clone(), 100);
        message_loop.run().unwrap();

        // Every pass runs one reposted task and then the ready watch; the
        // last task stops the loop before the watch gets its turn.
        assert_eq!(runs.get(), 100);
        assert_eq!(io_hits.get(), 99);
    }

    #[test]
    fn run_once_runs_exactly_one_ready_watch() {
        let (lab, message_loop) = lab_loop();
        let (hits, hit) = counter();
        for fd in [15, 16] {
            message_loop.watch_fd(fd, WatchMode::Read, true, hit.clone());
            lab.set_ready(fd, WatchMode::Read);
        }

        assert!(message_loop.run_once(false).unwrap());
        assert_eq!(hits.get(), 1);
        assert!(message_loop.run_once(false).unwrap());
        assert_eq!(hits.get(), 2);
    }

    #[test]
    fn nested_run_once_skips_the_running_watch() {
        let (lab, message_loop) = lab_loop();
        let message_loop = Rc::new(message_loop);
        let weak = Rc::downgrade(&message_loop);
        let (hits, hit) = counter();
        let nested = Rc::new(Cell::new(None));

        let inner_result = nested.clone();
        message_loop.watch_fd(17, WatchMode::Read, true, move || {
            hit();
            if let Some(message_loop) = weak.upgrade() {
                inner_result.set(Some(message_loop.run_once(false).unwrap()));
            }
        });
        lab.set_ready(17, WatchMode::Read);

        assert!(message_loop.run_once(false).unwrap());
        // The nested run found the closure busy and ran nothing.
        assert_eq!(nested.get(), Some(false));
        assert_eq!(hits.get(), 1);
        assert_eq!(message_loop.pending_io_tasks(), 1);
    }

    #[test]
    fn cancel_null_and_unknown() {
        let (_lab, message_loop) = lab_loop();
        assert!(!message_loop.cancel(TaskId::NULL));
        let id = message_loop.post_task(|| {});
        message_loop.cancel(id);
        assert!(!message_loop.cancel(id));
        assert!(!message_loop.handle().cancel(TaskId::NULL));
    }

    #[test]
    fn current_loop_is_per_thread_and_cleared_on_drop() {
        let (_lab, message_loop) = lab_loop();
        message_loop.set_as_current();
        assert!(current().is_some());

        let (hits, hit) = counter();
        let id = post_task(hit);
        assert!(!id.is_null());
        assert!(message_loop.run_once(false).unwrap());
        assert_eq!(hits.get(), 1);

        std::thread::spawn(|| assert!(current().is_none()))
            .join()
            .unwrap();

        drop(message_loop);
        assert!(current().is_none());
        assert_eq!(post_task(|| {}), TaskId::NULL);
    }
}
