//! Helpers shared by the unit tests.

use std::cell::Cell;
use std::rc::Rc;
use std::sync::Once;

static INIT_LOGGING: Once = Once::new();

/// Routes `tracing` output through the test harness writer.
///
/// The first call wins; later calls are no-ops.
pub fn init_test_logging() {
    INIT_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::TRACE)
            .with_test_writer()
            .with_file(true)
            .with_line_number(true)
            .with_target(true)
            .with_ansi(false)
            .try_init();
    });
}

/// Observes when a value captured by a closure is dropped.
#[derive(Debug, Default)]
pub struct DropFlag {
    dropped: Rc<Cell<bool>>,
}

impl DropFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// A value that marks the flag when dropped.
    pub fn guard(&self) -> DropGuard {
        DropGuard(self.dropped.clone())
    }

    pub fn is_dropped(&self) -> bool {
        self.dropped.get()
    }
}

#[derive(Debug)]
pub struct DropGuard(Rc<Cell<bool>>);

impl Drop for DropGuard {
    fn drop(&mut self) {
        self.0.set(true);
    }
}
