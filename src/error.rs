//! Error types and result definitions for the rustmidea crate.
//! Includes numeric error codes and conversion from standard IO/JSON errors.

use thiserror::Error;

/// Represents all possible errors that can occur when talking to an appliance.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MideaError {
    /// Malformed or corrupt bytes on the wire. The stream is considered
    /// desynchronized and the connection is torn down.
    #[error("Invalid frame: {0}")]
    Frame(String),

    /// v3 key negotiation failed
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// Integrity check of an encrypted payload failed (wrong key or corruption)
    #[error("Decryption failed")]
    Decrypt,

    /// No reply within the deadline
    #[error("Timeout waiting for device")]
    Timeout,

    /// Transport-level failure (refused, reset, closed by peer)
    #[error("Connection error: {0}")]
    Connection(String),

    /// Device speaks a protocol generation without a command encoding
    #[error("Unsupported protocol version {0}")]
    UnsupportedVersion(u8),

    /// Token/key lookup failed or credentials are missing
    #[error("Credential error: {0}")]
    Credential(String),

    /// Device did not answer discovery
    #[error("Device '{0}' not found")]
    NotFound(String),

    /// The device answered, but not with a usable response to the command
    #[error("Command failed: {0}")]
    Command(String),

    /// A descriptor field failed validation
    #[error("Invalid device descriptor: {0}")]
    InvalidDescriptor(String),

    /// A pending operation was cancelled by the caller
    #[error("Operation cancelled")]
    Cancelled,

    /// Standard IO error that is not connection-specific
    #[error("IO error: {0}")]
    Io(String),

    /// JSON serialization or deserialization error
    #[error("JSON error: {0}")]
    Json(String),
}

/// A specialized Result type for appliance operations.
pub type Result<T> = std::result::Result<T, MideaError>;

impl From<std::io::Error> for MideaError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::TimedOut => MideaError::Timeout,
            ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::NotConnected
            | ErrorKind::UnexpectedEof => MideaError::Connection(err.to_string()),
            _ => MideaError::Io(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for MideaError {
    fn from(err: serde_json::Error) -> Self {
        MideaError::Json(err.to_string())
    }
}

impl MideaError {
    pub fn code(&self) -> u32 {
        match self {
            MideaError::Frame(_) => ERR_FRAME,
            MideaError::Handshake(_) => ERR_HANDSHAKE,
            MideaError::Decrypt => ERR_DECRYPT,
            MideaError::Timeout => ERR_TIMEOUT,
            MideaError::Connection(_) => ERR_CONNECT,
            MideaError::UnsupportedVersion(_) => ERR_VERSION,
            MideaError::Credential(_) => ERR_CREDENTIAL,
            MideaError::NotFound(_) => ERR_NOT_FOUND,
            MideaError::Command(_) => ERR_COMMAND,
            MideaError::InvalidDescriptor(_) => ERR_PARAMS,
            MideaError::Cancelled => ERR_CANCELLED,
            MideaError::Io(_) => ERR_CONNECT,
            MideaError::Json(_) => ERR_PARAMS,
        }
    }

    /// Only timeouts may be retried, and only by the caller. Codec and crypto
    /// failures could hide a wrong key or a corrupted stream.
    pub fn is_retryable(&self) -> bool {
        matches!(self, MideaError::Timeout)
    }

    /// Whether the error leaves the connection unusable.
    pub fn is_session_fatal(&self) -> bool {
        !matches!(
            self,
            MideaError::Command(_) | MideaError::InvalidDescriptor(_) | MideaError::Json(_)
        )
    }
}

define_error_codes! {
    ERR_SUCCESS = 0 => "Success",
    ERR_FRAME = 901 => "Malformed or corrupt frame",
    ERR_HANDSHAKE = 902 => "Key negotiation failed",
    ERR_DECRYPT = 903 => "Payload integrity check failed",
    ERR_TIMEOUT = 904 => "Timeout waiting for device",
    ERR_CONNECT = 905 => "Network error: unable to connect",
    ERR_VERSION = 906 => "Unsupported protocol version",
    ERR_CREDENTIAL = 907 => "Missing or invalid token and key",
    ERR_NOT_FOUND = 908 => "Device not found",
    ERR_COMMAND = 909 => "Unexpected response from device",
    ERR_PARAMS = 910 => "Invalid parameters",
    ERR_CANCELLED = 911 => "Operation cancelled",
}
