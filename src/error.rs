//! Error types for the varnish control client and cache policy

use std::io::ErrorKind;
use thiserror::Error;

use crate::protocol::CLIS_COMMS;

/// Result type alias for control-protocol operations
pub type Result<T> = std::result::Result<T, VarnishError>;

/// Error types that can occur while talking to a control terminal
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VarnishError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid control terminal '{terminal}': {reason}")]
    InvalidEndpoint { terminal: String, reason: String },

    #[error("Transport error {code}: {message}")]
    Transport { code: i32, message: String },

    /// `code` is the OS errno when the failure came from a socket
    #[error("Resource temporarily unavailable: {message}")]
    WouldBlock { code: Option<i32>, message: String },

    #[error("Network timeout: {0}")]
    Timeout(String),

    #[error("Malformed response frame: {0}")]
    MalformedFrame(String),

    #[error("Authentication failed with status {code}: {message}")]
    AuthenticationFailed { code: i32, message: String },

    #[error("Unexpected greeting status {code}: {message}")]
    UnexpectedGreeting { code: i32, message: String },

    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    #[error("IO error: {0}")]
    IoError(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl From<std::io::Error> for VarnishError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            ErrorKind::WouldBlock => VarnishError::WouldBlock {
                code: err.raw_os_error(),
                message: err.to_string(),
            },
            ErrorKind::TimedOut => VarnishError::Timeout(err.to_string()),
            _ => match err.raw_os_error() {
                Some(code) => VarnishError::Transport {
                    code,
                    message: err.to_string(),
                },
                None => VarnishError::IoError(err.to_string()),
            },
        }
    }
}

impl VarnishError {
    /// Determine if a read that failed with this error may be attempted again
    ///
    /// Only "temporarily unavailable" conditions qualify: the socket would
    /// block, or the receive timeout elapsed before any data arrived. Retrying
    /// anything else risks reading into the middle of a frame.
    pub fn is_transient(&self) -> bool {
        matches!(self, VarnishError::WouldBlock { .. } | VarnishError::Timeout(_))
    }

    /// Status code to record in a `CommandResult` for this error
    ///
    /// Protocol and authentication failures keep the status the server sent.
    /// Transport failures keep their OS error code; anything without one is
    /// reported as the protocol's communication-error status.
    pub fn status_code(&self) -> i32 {
        match self {
            VarnishError::Transport { code, .. } => *code,
            VarnishError::AuthenticationFailed { code, .. } => *code,
            VarnishError::UnexpectedGreeting { code, .. } => *code,
            VarnishError::WouldBlock { code: Some(code), .. } => *code,
            VarnishError::WouldBlock { code: None, .. }
            | VarnishError::Timeout(_)
            | VarnishError::MalformedFrame(_)
            | VarnishError::IoError(_)
            | VarnishError::ConfigError(_)
            | VarnishError::InvalidEndpoint { .. }
            | VarnishError::InvalidCommand(_)
            | VarnishError::InternalError(_) => CLIS_COMMS,
        }
    }

    /// Whether this error means the backend could not be reached at all
    pub fn is_unreachable(&self) -> bool {
        !matches!(
            self,
            VarnishError::AuthenticationFailed { .. } | VarnishError::InvalidCommand(_)
        )
    }

    /// Create an InvalidEndpoint error for a configured terminal entry
    pub fn invalid_endpoint(terminal: impl Into<String>, reason: impl Into<String>) -> Self {
        VarnishError::InvalidEndpoint {
            terminal: terminal.into(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_would_block_is_transient() {
        let err: VarnishError = io::Error::from(ErrorKind::WouldBlock).into();
        assert!(err.is_transient());
        assert_eq!(err.status_code(), CLIS_COMMS);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_would_block_keeps_os_code() {
        // EAGAIN
        let err: VarnishError = io::Error::from_raw_os_error(11).into();
        assert!(matches!(err, VarnishError::WouldBlock { code: Some(11), .. }));
        assert!(err.is_transient());
        assert_eq!(err.status_code(), 11);
    }

    #[test]
    fn test_timeout_is_transient() {
        let err: VarnishError = io::Error::from(ErrorKind::TimedOut).into();
        assert!(matches!(err, VarnishError::Timeout(_)));
        assert!(err.is_transient());
    }

    #[test]
    fn test_os_error_keeps_code() {
        let err: VarnishError = io::Error::from_raw_os_error(111).into();
        assert_eq!(err.status_code(), 111);
        assert!(!err.is_transient());
    }

    #[test]
    fn test_auth_failure_keeps_protocol_status() {
        let err = VarnishError::AuthenticationFailed {
            code: 107,
            message: "Authentication required.".to_string(),
        };
        assert_eq!(err.status_code(), 107);
        assert!(!err.is_unreachable());
    }

    #[test]
    fn test_connect_refused_is_unreachable() {
        let err: VarnishError = io::Error::from_raw_os_error(111).into();
        assert!(err.is_unreachable());
    }
}
