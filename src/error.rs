//! Error taxonomy for the server.
//!
//! Listener-level failures (`ServerError`) are fatal at startup. Everything
//! that goes wrong on a single connection is a `SessionError` and is contained
//! to that session.

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use thiserror::Error;

use crate::config::ConfigError;

/// Listener-level errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("bind failed on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("invalid listen address '{0}'")]
    InvalidAddress(String),
    #[error("reactor runtime error: {0}")]
    Runtime(#[source] io::Error),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Malformed framing on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("bad identifier")]
    BadIdentifier,
    #[error("malformed property line: {0:?}")]
    MalformedProperty(String),
    #[error("header is not valid UTF-8")]
    InvalidUtf8,
    #[error("header exceeds {limit} bytes without a blank-line sentinel")]
    HeaderTooLarge { limit: usize },
    #[error("declared body size {size} exceeds limit {limit}")]
    BodyTooLarge { size: usize, limit: usize },
    #[error("unknown payload type: {0:?}")]
    UnknownPayloadKind(String),
}

/// Failures raised by a payload handler.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("string payload is not valid UTF-8")]
    InvalidText,
    #[error("missing required property '{0}'")]
    MissingProperty(&'static str),
    #[error("invalid resource name {0:?}")]
    InvalidName(String),
    #[error("resource not found: {}", .0.display())]
    NotFound(PathBuf),
    #[error("handler I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Everything that can end a session.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("transport error: {0}")]
    Transport(#[source] io::Error),
    #[error("operation cancelled")]
    Cancelled,
    #[error("handler error: {0}")]
    Handler(#[from] HandlerError),
}

impl SessionError {
    /// Cancellation is an intentional close, not a failure worth reporting.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, SessionError::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bad_identifier_message() {
        assert_eq!(ProtocolError::BadIdentifier.to_string(), "bad identifier");
        let err = SessionError::from(ProtocolError::BadIdentifier);
        assert_eq!(err.to_string(), "protocol error: bad identifier");
        assert!(!err.is_cancelled());
    }

    #[test]
    fn test_cancelled_is_not_failure() {
        assert!(SessionError::Cancelled.is_cancelled());
        let transport = SessionError::Transport(io::Error::from(io::ErrorKind::ConnectionReset));
        assert!(!transport.is_cancelled());
    }
}
