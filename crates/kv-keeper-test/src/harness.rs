//! Test harness helpers.

use tracing_subscriber::EnvFilter;

/// Default filter for [`init_test_logging`].
pub const DEFAULT_TEST_FILTER: &str = "kv_keeper=debug";

/// Route `tracing` output through the test writer with `filter`.
///
/// Safe to call from every test; only the first call installs a subscriber.
pub fn setup_test_logging(filter: &str) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_test_writer()
        .try_init();
}

/// [`setup_test_logging`] with [`DEFAULT_TEST_FILTER`].
pub fn init_test_logging() {
    setup_test_logging(DEFAULT_TEST_FILTER);
}
