//! Shared helpers for the integration tests.

#![allow(dead_code)]

use std::cell::Cell;
use std::rc::Rc;
use std::sync::Once;

use taskloop::MessageLoop;

static INIT_LOGGING: Once = Once::new();

/// Initialize test logging with `tracing-subscriber`'s test writer.
pub fn init_test_logging() {
    INIT_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::TRACE)
            .with_test_writer()
            .with_ansi(false)
            .try_init();
    });
}

/// A loop on the OS reactor with test logging enabled.
pub fn message_loop() -> MessageLoop {
    init_test_logging();
    MessageLoop::new().expect("failed to create message loop")
}

/// A shared invocation counter and a closure that bumps it.
pub fn counter() -> (Rc<Cell<u32>>, impl Fn() + Clone + 'static) {
    let hits = Rc::new(Cell::new(0));
    let inner = hits.clone();
    (hits, move || inner.set(inner.get() + 1))
}
