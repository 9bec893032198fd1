//! A single-threaded message loop for delayed tasks and file descriptor
//! watches.
//!
//! The crate is layered like this:
//!
//! - [`reactor`]: the [`EventBase`] trait (timers, descriptor readiness, a
//!   loop that can be run and quit), the mio-backed [`Reactor`] and the
//!   deterministic [`LabEventBase`] used in tests
//! - [`message_loop`]: [`MessageLoop`], which hands out cancellable
//!   [`TaskId`]s for delayed closures and descriptor watches and can run a
//!   single task at a time
//! - [`task`]: task identifiers and the bookkeeping kept per task
//! - [`config`]: [`LoopConfig`] and its `TASKLOOP_*` environment overrides
//!
//! Logging goes through `tracing`; counters and gauges go through `metrics`
//! and can be served by a Prometheus exporter (see [`LoopConfig`]).

pub mod config;
pub mod error;
pub mod message_loop;
pub mod reactor;
pub mod task;
pub mod telemetry;

#[cfg(test)]
pub(crate) mod test_utils;

pub use config::LoopConfig;
pub use error::{Error, Result};
pub use message_loop::{current, post_task, LoopHandle, MessageLoop};
pub use reactor::{EventBase, LabEventBase, Reactor};
pub use task::{TaskId, WatchMode};
