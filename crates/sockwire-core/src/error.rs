//! Error types for sockwire.
//!
//! Errors fall into four groups: protocol violations by the peer (fatal to the
//! connection), resource exhaustion of the transport, programming errors by the
//! local caller, and plain I/O failures.

use std::fmt;
use thiserror::Error;

use crate::protocol::DisplayErrorCode;

/// A fatal error reported by the display through its `error` event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolError {
    pub object_id: u32,
    pub interface: String,
    pub code: u32,
    pub message: String,
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{}: error {}: {}",
            self.interface, self.object_id, self.code, self.message
        )
    }
}

/// Main error type for the sockwire crate.
#[derive(Debug, Error)]
pub enum SockwireError {
    // Peer protocol violations
    #[error("Invalid object {id}: {message}")]
    InvalidObject { id: u32, message: String },

    #[error("Invalid method {opcode} on {interface}@{id}")]
    InvalidMethod {
        id: u32,
        interface: &'static str,
        opcode: u16,
    },

    #[error("Malformed message for object {id}: {message}")]
    MalformedMessage { id: u32, message: String },

    #[error("Implementation error: {message}")]
    Implementation { message: String },

    #[error("Protocol error from display: {0}")]
    Protocol(ProtocolError),

    // Transport
    #[error("Outbound buffer full: {pending} bytes pending, {needed} more needed")]
    BufferFull { pending: usize, needed: usize },

    #[error("Connection closed by peer")]
    ConnectionClosed,

    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    // Programming errors
    #[error("Stale resource handle for id {id}")]
    StaleHandle { id: u32 },

    #[error("Object {id} is not registered on this connection")]
    UnregisteredObject { id: u32 },

    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },

    #[error("Invalid signature {signature:?}: {message}")]
    InvalidSignature {
        signature: &'static str,
        message: String,
    },

    #[error("Message of {size} bytes exceeds the {max} byte limit")]
    MessageTooLarge { size: usize, max: usize },

    #[error("Invalid version {version} for global {interface} (max {max})")]
    InvalidGlobalVersion {
        interface: &'static str,
        version: u32,
        max: u32,
    },

    #[error("Unknown global {name}")]
    UnknownGlobal { name: u32 },

    #[error("Unknown client {0}")]
    UnknownClient(u64),

    #[error("Client object ids exhausted below {limit:#x}")]
    IdsExhausted { limit: u32 },
}

/// Result type alias using SockwireError.
pub type Result<T> = std::result::Result<T, SockwireError>;

impl From<std::io::Error> for SockwireError {
    fn from(err: std::io::Error) -> Self {
        SockwireError::Io {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<nix::Error> for SockwireError {
    fn from(err: nix::Error) -> Self {
        std::io::Error::from(err).into()
    }
}

impl From<ProtocolError> for SockwireError {
    fn from(err: ProtocolError) -> Self {
        SockwireError::Protocol(err)
    }
}

impl SockwireError {
    /// Build a malformed-message error.
    pub fn malformed(id: u32, message: impl Into<String>) -> Self {
        SockwireError::MalformedMessage {
            id,
            message: message.into(),
        }
    }

    /// Build an invalid-argument error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        SockwireError::InvalidArgument {
            message: message.into(),
        }
    }

    /// Map onto the display error code posted to a misbehaving client.
    ///
    /// - `invalid_object` (0): unknown or mistyped object references
    /// - `invalid_method` (1): bad opcodes and undecodable arguments
    /// - `no_memory` (2): the outbound buffer could not take the reply
    /// - `implementation` (3): handler failures
    ///
    /// Returns `None` for errors that never travel on the wire.
    pub fn display_error_code(&self) -> Option<DisplayErrorCode> {
        match self {
            SockwireError::InvalidObject { .. } => Some(DisplayErrorCode::InvalidObject),
            SockwireError::InvalidMethod { .. } | SockwireError::MalformedMessage { .. } => {
                Some(DisplayErrorCode::InvalidMethod)
            }
            SockwireError::BufferFull { .. } => Some(DisplayErrorCode::NoMemory),
            SockwireError::Implementation { .. } => Some(DisplayErrorCode::Implementation),
            _ => None,
        }
    }

    /// Check if this error ends the connection.
    pub fn is_fatal(&self) -> bool {
        match self {
            SockwireError::Io { source, .. } => !matches!(
                source.as_ref().map(std::io::Error::kind),
                Some(std::io::ErrorKind::WouldBlock) | Some(std::io::ErrorKind::Interrupted)
            ),
            SockwireError::InvalidObject { .. }
            | SockwireError::InvalidMethod { .. }
            | SockwireError::MalformedMessage { .. }
            | SockwireError::Implementation { .. }
            | SockwireError::Protocol(_)
            | SockwireError::BufferFull { .. }
            | SockwireError::ConnectionClosed => true,
            _ => false,
        }
    }

    /// Check if this is a non-blocking socket reporting "try again".
    pub fn is_would_block(&self) -> bool {
        matches!(
            self,
            SockwireError::Io { source: Some(err), .. } if err.kind() == std::io::ErrorKind::WouldBlock
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SockwireError::InvalidMethod {
            id: 3,
            interface: "sw_registry",
            opcode: 7,
        };
        assert_eq!(err.to_string(), "Invalid method 7 on sw_registry@3");
    }

    #[test]
    fn test_display_error_codes() {
        assert_eq!(
            SockwireError::InvalidObject {
                id: 9,
                message: "unknown".into()
            }
            .display_error_code(),
            Some(DisplayErrorCode::InvalidObject)
        );
        assert_eq!(
            SockwireError::malformed(3, "short").display_error_code(),
            Some(DisplayErrorCode::InvalidMethod)
        );
        assert_eq!(SockwireError::StaleHandle { id: 3 }.display_error_code(), None);
    }

    #[test]
    fn test_fatal_errors() {
        let would_block = SockwireError::from(std::io::Error::from(std::io::ErrorKind::WouldBlock));
        assert!(would_block.is_would_block());
        assert!(!would_block.is_fatal());
        assert!(SockwireError::ConnectionClosed.is_fatal());
        assert!(!SockwireError::StaleHandle { id: 1 }.is_fatal());
    }

    #[test]
    fn test_nix_conversion() {
        let err = SockwireError::from(nix::errno::Errno::EAGAIN);
        assert!(err.is_would_block());
    }
}
