//! Error types for the tunnel session and lifecycle surface.

use std::io;
use thiserror::Error;

use crate::proto::framing::FrameError;
use crate::proto::message::OpenResultCode;
use crate::proto::settings::SettingsError;
use crate::transport::TransportError;

/// Result type for tunnel operations.
pub type TunnelResult<T> = Result<T, TunnelError>;

/// Error types that can occur in tunnel operations.
#[derive(Debug, Error)]
pub enum TunnelError {
    /// The transport could not be established; the session never left `connecting`
    #[error("Transport unavailable: {0}")]
    TransportUnavailable(TransportError),

    /// The transport failed after it was established
    #[error("Transport lost: {0}")]
    TransportLost(#[from] TransportError),

    /// Malformed frame, out-of-sequence message or oversize frame
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// The server's configuration response cannot be used
    #[error("Configuration invalid: {0}")]
    ConfigurationInvalid(String),

    /// The server declined one flow; never escalates beyond that flow
    #[error("Flow open rejected: {0}")]
    FlowOpenRejected(OpenResultCode),

    /// A start is already pending
    #[error("Tunnel start already pending")]
    AlreadyStarting,

    /// There is nothing left to stop
    #[error("Tunnel already stopped")]
    AlreadyStopped,

    /// A pending start was pre-empted by a stop
    #[error("Tunnel start cancelled")]
    Cancelled,

    /// Local configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Operation not allowed in the current state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Timeout
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// The session is closed
    #[error("Tunnel closed")]
    Closed,

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl From<FrameError> for TunnelError {
    fn from(err: FrameError) -> Self {
        TunnelError::ProtocolViolation(err.to_string())
    }
}

impl From<SettingsError> for TunnelError {
    fn from(err: SettingsError) -> Self {
        TunnelError::ConfigurationInvalid(err.to_string())
    }
}
