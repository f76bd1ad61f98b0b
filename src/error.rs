//! Error types for the EdgeDB binary protocol engine.
//!
//! Every failure surfaced by the crate is an [`EdgeError`]. The variants follow
//! how a caller is expected to react: protocol violations tear the connection
//! down, missing codecs can be fixed by describing the query again, timeouts
//! may be retried and cancellations may not.

use std::fmt;
use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

// ============================================================================
// Server Error Codes
// ============================================================================

/// Input data did not match the described parameter types.
pub const PARAMETER_TYPE_MISMATCH_ERROR: u32 = 0x0302_0100;
/// The state data sent with a request was built from a stale descriptor.
pub const STATE_MISMATCH_ERROR: u32 = 0x0302_0200;
/// The server closed an idle session.
pub const IDLE_SESSION_TIMEOUT_ERROR: u32 = 0x0406_0100;
/// Transaction conflict class (serialization failures, deadlocks).
pub const TRANSACTION_CONFLICT_ERROR: u32 = 0x0503_0100;

#[derive(Error, Debug)]
pub enum EdgeError {
    /// Malformed frame, unknown discriminant or truncated payload.
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// The server referenced a type id that was never described.
    #[error("No codec for type id {id}: {message}")]
    MissingCodec { id: Uuid, message: String },

    /// A host type could not be reconciled with the wire shape.
    #[error("No converter from {codec} to {host}{}: {reason}", path_suffix(.path))]
    NoTypeConverter {
        host: String,
        codec: String,
        path: String,
        reason: String,
    },

    #[error("Connection closed: {0}")]
    Disconnected(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Operation was cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An ErrorResponse sent by the server.
    #[error("{severity}: {message} (code 0x{code:08x})")]
    Server {
        severity: ErrorSeverity,
        code: u32,
        message: String,
        attributes: Vec<(u16, Vec<u8>)>,
    },

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Configuration error: {0}")]
    Config(String),

    /// A value handed to an encoder does not fit the codec's wire shape.
    #[error("Invalid value: {0}")]
    InvalidValue(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

fn path_suffix(path: &str) -> String {
    if path.is_empty() {
        String::new()
    } else {
        format!(" at `{}`", path)
    }
}

impl EdgeError {
    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        EdgeError::ProtocolViolation(msg.into())
    }

    pub(crate) fn missing_codec(id: Uuid, msg: impl Into<String>) -> Self {
        EdgeError::MissingCodec {
            id,
            message: msg.into(),
        }
    }

    pub(crate) fn invalid_value(msg: impl Into<String>) -> Self {
        EdgeError::InvalidValue(msg.into())
    }

    /// Whether repeating the operation may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            EdgeError::Timeout(_) | EdgeError::MissingCodec { .. } | EdgeError::Disconnected(_) => {
                true
            }
            EdgeError::Server { code, .. } => {
                *code == STATE_MISMATCH_ERROR
                    || *code == IDLE_SESSION_TIMEOUT_ERROR
                    || (*code & 0xffff_ff00) == TRANSACTION_CONFLICT_ERROR
            }
            _ => false,
        }
    }

    /// Whether the connection should be re-established before retrying.
    pub fn is_reconnect_eligible(&self) -> bool {
        matches!(self, EdgeError::Disconnected(_) | EdgeError::Timeout(_))
            || matches!(self, EdgeError::Server { code, .. } if *code == IDLE_SESSION_TIMEOUT_ERROR)
    }

    /// Whether the connection must be torn down after this error.
    pub fn is_fatal_for_connection(&self) -> bool {
        matches!(
            self,
            EdgeError::ProtocolViolation(_) | EdgeError::Io(_) | EdgeError::Disconnected(_)
        )
    }

    /// Server error code, if this error came from an ErrorResponse.
    pub fn server_code(&self) -> Option<u32> {
        match self {
            EdgeError::Server { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// Severity carried by ErrorResponse and LogMessage packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    Debug,
    Info,
    Notice,
    Warning,
    Error,
    Fatal,
    Panic,
    Unknown(u8),
}

impl From<u8> for ErrorSeverity {
    fn from(b: u8) -> Self {
        match b {
            0x14 => ErrorSeverity::Debug,
            0x28 => ErrorSeverity::Info,
            0x3c => ErrorSeverity::Notice,
            0x50 => ErrorSeverity::Warning,
            0x78 => ErrorSeverity::Error,
            0xc8 => ErrorSeverity::Fatal,
            0xff => ErrorSeverity::Panic,
            other => ErrorSeverity::Unknown(other),
        }
    }
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorSeverity::Debug => write!(f, "DEBUG"),
            ErrorSeverity::Info => write!(f, "INFO"),
            ErrorSeverity::Notice => write!(f, "NOTICE"),
            ErrorSeverity::Warning => write!(f, "WARNING"),
            ErrorSeverity::Error => write!(f, "ERROR"),
            ErrorSeverity::Fatal => write!(f, "FATAL"),
            ErrorSeverity::Panic => write!(f, "PANIC"),
            ErrorSeverity::Unknown(b) => write!(f, "SEVERITY({})", b),
        }
    }
}

pub type Result<T> = std::result::Result<T, EdgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        assert!(EdgeError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(!EdgeError::Cancelled.is_retryable());
        assert!(!EdgeError::protocol("bad tag").is_retryable());
        assert!(EdgeError::missing_codec(Uuid::nil(), "unknown").is_retryable());

        let conflict = EdgeError::Server {
            severity: ErrorSeverity::Error,
            code: 0x0503_0101,
            message: "serialization failure".to_string(),
            attributes: vec![],
        };
        assert!(conflict.is_retryable());
        assert!(!conflict.is_fatal_for_connection());
    }

    #[test]
    fn test_no_converter_message_includes_path() {
        let err = EdgeError::NoTypeConverter {
            host: "(i64, str)".to_string(),
            codec: "tuple<int64>".to_string(),
            path: "User.scores".to_string(),
            reason: "Cannot determine inner types of the tuple".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("tuple<int64>"));
        assert!(msg.contains("(i64, str)"));
        assert!(msg.contains("`User.scores`"));
    }

    #[test]
    fn test_severity_from_byte() {
        assert_eq!(ErrorSeverity::from(0x78), ErrorSeverity::Error);
        assert_eq!(ErrorSeverity::from(0x01), ErrorSeverity::Unknown(1));
    }
}
