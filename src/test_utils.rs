//! Shared test helpers: tracing setup and logging assertions.

/// Initializes tracing for tests if not already done.
pub(crate) fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::TRACE)
        .with_test_writer()
        .try_init();
}

/// Phase tracking macro for structured test logging.
#[macro_export]
macro_rules! test_phase {
    ($name:expr) => {
        tracing::info!(test = $name, "=== TEST START ===");
    };
}

/// Marks a test as complete in the log.
#[macro_export]
macro_rules! test_complete {
    ($name:expr) => {
        tracing::info!(test = $name, "=== TEST COMPLETE ===");
    };
}

/// Assertion with logging for better test output.
#[macro_export]
macro_rules! assert_with_log {
    ($cond:expr, $msg:expr, $expected:expr, $actual:expr) => {
        if !$cond {
            tracing::error!(
                message = $msg,
                expected = ?$expected,
                actual = ?$actual,
                "Assertion failed"
            );
        }
        assert!($cond, "{}: expected {:?}, got {:?}", $msg, $expected, $actual);
    };
}
