//! Errors reported by the event base and by loop construction.
//!
//! Scheduling calls on [`MessageLoop`](crate::MessageLoop) never return these
//! directly: a rejected registration is reported as [`TaskId::NULL`](crate::TaskId::NULL)
//! and the error is logged. They surface from the event base itself, from
//! `run`/`run_once`, and from building a loop.

use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

use thiserror::Error;

/// Result type used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    /// Waiting for readiness events failed with something other than `EINTR`.
    #[error("failed to poll for events: {0}")]
    Poll(#[source] io::Error),

    /// The OS refused to watch the descriptor (closed fd, regular file, ...).
    #[error("failed to watch file descriptor {fd}: {source}")]
    Register {
        fd: RawFd,
        #[source]
        source: io::Error,
    },

    #[error("invalid file descriptor {0}")]
    InvalidFd(RawFd),

    /// The deadline `now + delay` does not fit in an `Instant`.
    #[error("delay of {0:?} is too large to schedule")]
    DelayOverflow(Duration),

    /// The event base declined the request (fault injection in the lab base).
    #[error("event base refused the request")]
    Refused,

    #[error("invalid value for {var}: {value:?}")]
    Config { var: &'static str, value: String },

    #[error("failed to install metrics exporter: {0}")]
    Metrics(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}
