//! Metric names and the optional Prometheus exporter.

use std::net::SocketAddr;

use metrics::{counter, gauge};
use tracing::info;

use crate::error::{Error, Result};

pub(crate) const TASKS_SCHEDULED: &str = "taskloop_tasks_scheduled_total";
pub(crate) const TASKS_CANCELLED: &str = "taskloop_tasks_cancelled_total";
pub(crate) const TASKS_RUN: &str = "taskloop_tasks_run_total";
pub(crate) const REGISTRATION_FAILURES: &str = "taskloop_registration_failures_total";
pub(crate) const TASKS_PENDING: &str = "taskloop_tasks_pending";

/// Label value for the two task tables.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Kind {
    Delayed,
    Io,
}

impl Kind {
    fn label(self) -> &'static str {
        match self {
            Kind::Delayed => "delayed",
            Kind::Io => "io",
        }
    }
}

pub(crate) fn increment(name: &'static str, kind: Kind) {
    counter!(name, "kind" => kind.label()).increment(1);
}

pub(crate) fn set_pending(kind: Kind, pending: usize) {
    gauge!(TASKS_PENDING, "kind" => kind.label()).set(pending as f64);
}

/// Serves the loop metrics at `http://{addr}/metrics`.
///
/// Installs the global metrics recorder, so it can succeed once per process.
pub fn install_prometheus(addr: SocketAddr) -> Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| Error::Metrics(e.to_string()))?;
    info!(%addr, "metrics enabled at http://{addr}/metrics");
    Ok(())
}
