//! Harness configuration constants.

use std::time::Duration;

/// Limits and timeouts of the control channel.
pub struct HarnessConfig;

impl HarnessConfig {
    /// How long either side waits for a control frame before giving up.
    pub const CONTROL_TIMEOUT: Duration = Duration::from_secs(10);
    /// Largest accepted control frame payload.
    pub const MAX_FRAME_SIZE: usize = 1024 * 1024;
    /// Name of the spawned client thread.
    pub const CLIENT_THREAD_NAME: &'static str = "harness-client";
    /// Exit status of a client body that succeeded.
    pub const EXIT_SUCCESS: i32 = 0;
    /// Exit status of a client that was told not to start.
    pub const EXIT_FAILURE: i32 = 1;
    /// Default log filter when `RUST_LOG` is unset.
    pub const DEFAULT_LOG_FILTER: &'static str = "info,sockwire=debug,sockwire_harness=debug";
}
