//! Log output for harness runs.
//!
//! The filter comes from `RUST_LOG`, falling back to
//! [`HarnessConfig::DEFAULT_LOG_FILTER`]. Output goes through the test writer
//! so it is captured per test. Set `SOCKWIRE_DEBUG=1` as well to see every
//! wire message at debug level.

use tracing_subscriber::EnvFilter;

use crate::config::HarnessConfig;

/// Output format of [`init_with`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

fn filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(HarnessConfig::DEFAULT_LOG_FILTER))
}

/// Install the compact subscriber. Later calls are no-ops.
pub fn init() {
    init_with(LogFormat::Compact);
}

/// Install a subscriber in `format`. Returns false if one was already set.
pub fn init_with(format: LogFormat) -> bool {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter())
        .with_target(false)
        .with_thread_names(true)
        .with_test_writer();
    let result = match format {
        LogFormat::Compact => builder.compact().try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    result.is_ok()
}
