//! Loop configuration.
//!
//! Values resolve in this order (highest priority first):
//!
//! 1. fields set on [`LoopConfig`] after [`LoopConfig::from_env`]
//! 2. `TASKLOOP_*` environment variables
//! 3. [`LoopConfig::default()`]
//!
//! | Variable | Type | Maps to |
//! |----------|------|---------|
//! | `TASKLOOP_EVENTS_CAPACITY` | `usize` | `events_capacity` |
//! | `TASKLOOP_METRICS_ADDR` | `SocketAddr` | `metrics_addr` |

use std::net::SocketAddr;

use crate::error::{Error, Result};

/// Readiness events collected per poll when nothing else is configured.
pub const DEFAULT_EVENTS_CAPACITY: usize = 1024;

/// Environment variable name for the events buffer capacity.
pub const ENV_EVENTS_CAPACITY: &str = "TASKLOOP_EVENTS_CAPACITY";
/// Environment variable name for the Prometheus listener address.
pub const ENV_METRICS_ADDR: &str = "TASKLOOP_METRICS_ADDR";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopConfig {
    /// Maximum readiness events collected by one poll.
    pub events_capacity: usize,
    /// When set, a Prometheus exporter serves the loop metrics on this address.
    pub metrics_addr: Option<SocketAddr>,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            events_capacity: DEFAULT_EVENTS_CAPACITY,
            metrics_addr: None,
        }
    }
}

impl LoopConfig {
    /// Defaults with environment overrides applied.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if a variable is set to an unparseable value.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_overrides(|name| std::env::var(name).ok())?;
        Ok(config)
    }

    fn apply_overrides(&mut self, read_env: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(val) = read_env(ENV_EVENTS_CAPACITY) {
            self.events_capacity = match val.trim().parse::<usize>() {
                Ok(capacity) if capacity > 0 => capacity,
                _ => return Err(invalid(ENV_EVENTS_CAPACITY, val)),
            };
        }
        if let Some(val) = read_env(ENV_METRICS_ADDR) {
            let addr = val
                .trim()
                .parse::<SocketAddr>()
                .map_err(|_| invalid(ENV_METRICS_ADDR, val.clone()))?;
            self.metrics_addr = Some(addr);
        }
        Ok(())
    }
}

fn invalid(var: &'static str, value: String) -> Error {
    Error::Config { var, value }
}
