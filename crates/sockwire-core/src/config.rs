//! Centralized configuration for sockwire.
//!
//! Wire-level constants are fixed by the protocol; `ConnectionConfig` carries
//! the few knobs a connection reads at runtime.

/// Protocol and transport constants.
pub struct WireConfig;

impl WireConfig {
    /// Default ring buffer capacity per direction.
    pub const BUFFER_CAPACITY: usize = 4096;
    /// `[id u32][opcode u16][size u16]`
    pub const HEADER_SIZE: usize = 8;
    /// Largest encoded message, header included.
    pub const MAX_MESSAGE_SIZE: usize = 4096;
    /// Descriptors carried by a single `sendmsg` call.
    pub const MAX_FDS_OUT: usize = 28;
    /// First id of the range allocated by the display.
    pub const SERVER_ID_START: u32 = 0xff00_0000;
    /// The display object always lives at id 1.
    pub const DISPLAY_ID: u32 = 1;
    /// First id handed out by a client.
    pub const CLIENT_ID_START: u32 = 2;
    /// Environment variable enabling debug-level message tracing.
    pub const DEBUG_ENV: &'static str = "SOCKWIRE_DEBUG";
}

/// Runtime settings of one connection endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Ring buffer capacity per direction; must be a power of two.
    pub buffer_capacity: usize,
    /// Log every message at debug level instead of trace level.
    pub debug: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: WireConfig::BUFFER_CAPACITY,
            debug: false,
        }
    }
}

impl ConnectionConfig {
    /// Defaults, with `debug` taken from `SOCKWIRE_DEBUG`.
    pub fn from_env() -> Self {
        let debug = std::env::var(WireConfig::DEBUG_ENV)
            .map(|value| Self::parse_debug(&value))
            .unwrap_or(false);
        Self {
            debug,
            ..Self::default()
        }
    }

    fn parse_debug(value: &str) -> bool {
        let value = value.trim();
        !(value.is_empty() || value == "0" || value.eq_ignore_ascii_case("false"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ConnectionConfig::default();
        assert_eq!(config.buffer_capacity, 4096);
        assert!(config.buffer_capacity.is_power_of_two());
        assert!(!config.debug);
    }

    #[test]
    fn test_parse_debug() {
        assert!(ConnectionConfig::parse_debug("1"));
        assert!(ConnectionConfig::parse_debug("client"));
        assert!(!ConnectionConfig::parse_debug("0"));
        assert!(!ConnectionConfig::parse_debug(" "));
        assert!(!ConnectionConfig::parse_debug("FALSE"));
    }

    #[test]
    fn test_id_ranges_do_not_overlap() {
        assert!(WireConfig::CLIENT_ID_START > WireConfig::DISPLAY_ID);
        assert!(WireConfig::SERVER_ID_START > WireConfig::CLIENT_ID_START);
    }
}
