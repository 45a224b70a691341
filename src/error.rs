//! Error types for framewire.

use std::io;

use thiserror::Error;

use crate::protocol::ErrorCode;

/// Main error type for all framewire operations.
#[derive(Debug, Error)]
pub enum FramewireError {
    /// I/O error during socket operations.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// MsgPack serialization error.
    #[error("MsgPack encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    /// MsgPack deserialization error.
    #[error("MsgPack decode error: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),

    /// Configuration could not be loaded or failed validation.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Protocol violation (bad header, orphan fragment, crash sentinel, etc.).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The peer (or local validation) answered with a non-success status.
    #[error("Request failed: {0}")]
    Status(ErrorCode),

    /// Connection closed unexpectedly.
    #[error("Connection closed")]
    ConnectionClosed,

    /// No reply arrived within the allotted time.
    #[error("Timed out waiting for reply")]
    Timeout,

    /// Backpressure timeout - write queue full.
    #[error("Backpressure timeout")]
    BackpressureTimeout,
}

impl FramewireError {
    /// Map this error onto the protocol error taxonomy.
    pub fn code(&self) -> ErrorCode {
        match self {
            FramewireError::Io(e) => map_io_error(e.kind()),
            FramewireError::MsgPackEncode(_) | FramewireError::MsgPackDecode(_) => {
                ErrorCode::InvalidParameters
            }
            FramewireError::Config(_) => ErrorCode::InvalidParameters,
            FramewireError::Protocol(_) => ErrorCode::ProtocolError,
            FramewireError::Status(code) => *code,
            FramewireError::ConnectionClosed => ErrorCode::NoSuchConnection,
            FramewireError::Timeout => ErrorCode::Timeout,
            FramewireError::BackpressureTimeout => ErrorCode::ResourceLimit,
        }
    }

    /// True if the error means the transport is unusable.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            FramewireError::Io(_) | FramewireError::Protocol(_) | FramewireError::ConnectionClosed
        )
    }
}

impl From<ErrorCode> for FramewireError {
    fn from(code: ErrorCode) -> Self {
        FramewireError::Status(code)
    }
}

impl From<figment::Error> for FramewireError {
    fn from(e: figment::Error) -> Self {
        FramewireError::Config(e.to_string())
    }
}

/// Translate a platform-neutral I/O error kind into the connection-level error band.
pub fn map_io_error(kind: io::ErrorKind) -> ErrorCode {
    use io::ErrorKind::*;
    match kind {
        BrokenPipe | ConnectionReset | ConnectionAborted | NotConnected | UnexpectedEof => {
            ErrorCode::NoSuchConnection
        }
        TimedOut | WouldBlock => ErrorCode::Timeout,
        ConnectionRefused | AddrNotAvailable | AddrInUse | NotFound => ErrorCode::NoSuchServer,
        _ => ErrorCode::SocketError,
    }
}

/// Result type alias using FramewireError.
pub type Result<T> = std::result::Result<T, FramewireError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_io_error() {
        assert_eq!(map_io_error(io::ErrorKind::BrokenPipe), ErrorCode::NoSuchConnection);
        assert_eq!(map_io_error(io::ErrorKind::UnexpectedEof), ErrorCode::NoSuchConnection);
        assert_eq!(map_io_error(io::ErrorKind::TimedOut), ErrorCode::Timeout);
        assert_eq!(map_io_error(io::ErrorKind::ConnectionRefused), ErrorCode::NoSuchServer);
        assert_eq!(map_io_error(io::ErrorKind::PermissionDenied), ErrorCode::SocketError);
    }

    #[test]
    fn test_error_codes() {
        let err = FramewireError::Io(io::Error::new(io::ErrorKind::ConnectionReset, "reset"));
        assert_eq!(err.code(), ErrorCode::NoSuchConnection);
        assert!(err.is_transport());

        let err: FramewireError = ErrorCode::AlreadyLocked.into();
        assert_eq!(err.code(), ErrorCode::AlreadyLocked);
        assert!(!err.is_transport());
        assert!(err.to_string().contains("frame already locked"));

        assert_eq!(FramewireError::Timeout.code(), ErrorCode::Timeout);
    }
}
