//! Error types for the harness.

use sockwire::SockwireError;
use thiserror::Error;

use crate::control::ControlOp;

/// Result type alias using HarnessError.
pub type Result<T> = std::result::Result<T, HarnessError>;

/// Errors raised while driving a display and its client thread.
#[derive(Error, Debug)]
pub enum HarnessError {
    #[error(transparent)]
    Sockwire(#[from] SockwireError),

    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    #[error("Control frame size {size} exceeds maximum {max}")]
    FrameTooLarge { size: usize, max: usize },

    #[error("Control channel closed")]
    ControlClosed,

    #[error("Timed out waiting for {what}")]
    Timeout { what: String },

    #[error("Bad acknowledge: expected {expected}, got {got}")]
    BadAcknowledge { expected: ControlOp, got: ControlOp },

    #[error("Unexpected control frame: {0}")]
    UnexpectedFrame(String),

    #[error("No control request is pending")]
    NoPendingRequest,

    #[error("Cannot handle {0} here")]
    UnexpectedRequest(ControlOp),

    #[error("No user function was added")]
    NoUserFunc,

    #[error("No client was created")]
    NoClient,

    #[error("Scripted event targets unknown object {id}")]
    UnknownObject { id: u32 },

    #[error("Peer processed {got} items instead of {expected}")]
    CountMismatch { expected: u64, got: u64 },

    #[error("Client exited with {code}")]
    ClientFailed { code: i32 },

    #[error("Client thread panicked")]
    ClientPanicked,
}

impl From<std::io::Error> for HarnessError {
    fn from(err: std::io::Error) -> Self {
        HarnessError::Io {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for HarnessError {
    fn from(err: serde_json::Error) -> Self {
        HarnessError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl HarnessError {
    /// Whether the error came from the peer going away rather than misuse.
    pub fn is_disconnect(&self) -> bool {
        match self {
            HarnessError::ControlClosed => true,
            HarnessError::Sockwire(err) => matches!(err, SockwireError::ConnectionClosed),
            HarnessError::Io { source: Some(err), .. } => matches!(
                err.kind(),
                std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}
