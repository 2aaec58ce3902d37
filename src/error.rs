//! Error types for call shaping
//!
//! Every error that reaches a caller carries a stable [`Code`] so callers can
//! branch programmatically instead of matching on message text.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for the crate
pub type Result<T> = std::result::Result<T, GaxError>;

/// Canonical RPC status codes (gRPC numbering).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "i32", from = "i32")]
pub enum Code {
    Ok,
    Cancelled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    OutOfRange,
    Unimplemented,
    Internal,
    Unavailable,
    DataLoss,
    Unauthenticated,
}

impl Code {
    /// Map a numeric status to a code; unknown numbers collapse to `Unknown`.
    pub fn from_i32(value: i32) -> Self {
        match value {
            0 => Code::Ok,
            1 => Code::Cancelled,
            3 => Code::InvalidArgument,
            4 => Code::DeadlineExceeded,
            5 => Code::NotFound,
            6 => Code::AlreadyExists,
            7 => Code::PermissionDenied,
            8 => Code::ResourceExhausted,
            9 => Code::FailedPrecondition,
            10 => Code::Aborted,
            11 => Code::OutOfRange,
            12 => Code::Unimplemented,
            13 => Code::Internal,
            14 => Code::Unavailable,
            15 => Code::DataLoss,
            16 => Code::Unauthenticated,
            _ => Code::Unknown,
        }
    }

    pub fn as_i32(self) -> i32 {
        match self {
            Code::Ok => 0,
            Code::Cancelled => 1,
            Code::Unknown => 2,
            Code::InvalidArgument => 3,
            Code::DeadlineExceeded => 4,
            Code::NotFound => 5,
            Code::AlreadyExists => 6,
            Code::PermissionDenied => 7,
            Code::ResourceExhausted => 8,
            Code::FailedPrecondition => 9,
            Code::Aborted => 10,
            Code::OutOfRange => 11,
            Code::Unimplemented => 12,
            Code::Internal => 13,
            Code::Unavailable => 14,
            Code::DataLoss => 15,
            Code::Unauthenticated => 16,
        }
    }
}

impl From<i32> for Code {
    fn from(value: i32) -> Self {
        Code::from_i32(value)
    }
}

impl From<Code> for i32 {
    fn from(code: Code) -> Self {
        code.as_i32()
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({})", self, self.as_i32())
    }
}

/// Main error type
#[derive(Debug, Clone, PartialEq, Error)]
pub enum GaxError {
    /// A queued or in-flight logical call was aborted by its caller
    #[error("cancelled")]
    Cancelled,

    /// A request was rejected locally before reaching the transport
    #[error("{message}")]
    InvalidArgument { message: String },

    /// A wall-clock deadline derived from backoff settings elapsed
    #[error("{message}")]
    DeadlineExceeded { message: String },

    /// Status reported by the remote side, carried verbatim
    #[error("{message}")]
    Remote { code: Code, message: String },

    /// A terminal operation without either a result or an error
    #[error("Malformed operation response: {message}")]
    MalformedResponse { message: String },

    /// A payload could not be decoded
    #[error("Decode error: {message}")]
    Decode { message: String },

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl GaxError {
    /// Stable status code for programmatic branching.
    pub fn code(&self) -> Code {
        match self {
            GaxError::Cancelled => Code::Cancelled,
            GaxError::InvalidArgument { .. } => Code::InvalidArgument,
            GaxError::DeadlineExceeded { .. } => Code::DeadlineExceeded,
            GaxError::Remote { code, .. } => *code,
            GaxError::MalformedResponse { .. } => Code::Internal,
            GaxError::Decode { .. } | GaxError::Serialization(_) => Code::Internal,
        }
    }

    pub fn remote(code: Code, message: impl Into<String>) -> Self {
        GaxError::Remote {
            code,
            message: message.into(),
        }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        GaxError::InvalidArgument {
            message: message.into(),
        }
    }

    pub fn deadline_exceeded(message: impl Into<String>) -> Self {
        GaxError::DeadlineExceeded {
            message: message.into(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, GaxError::Cancelled)
    }
}

impl From<serde_json::Error> for GaxError {
    fn from(err: serde_json::Error) -> Self {
        GaxError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(GaxError::Cancelled.code(), Code::Cancelled);
        assert_eq!(
            GaxError::invalid_argument("too big").code(),
            Code::InvalidArgument
        );
        assert_eq!(
            GaxError::remote(Code::Unavailable, "down").code(),
            Code::Unavailable
        );
        assert_eq!(
            GaxError::MalformedResponse {
                message: "x".into()
            }
            .code(),
            Code::Internal
        );
    }

    #[test]
    fn test_error_display() {
        let err = GaxError::deadline_exceeded("Total timeout exceeded");
        assert_eq!(err.to_string(), "Total timeout exceeded");

        let err = GaxError::remote(Code::FailedPrecondition, "operation error");
        assert_eq!(err.to_string(), "operation error");
    }

    #[test]
    fn test_code_numbering_round_trips_known_values() {
        for n in 0..=16 {
            assert_eq!(Code::from_i32(n).as_i32(), n);
        }
        assert_eq!(Code::from_i32(99), Code::Unknown);
    }

    #[test]
    fn test_code_serializes_as_number() {
        let json = serde_json::to_string(&Code::DeadlineExceeded).unwrap();
        assert_eq!(json, "4");
        let code: Code = serde_json::from_str("9").unwrap();
        assert_eq!(code, Code::FailedPrecondition);
    }

    #[test]
    fn test_from_serde_error() {
        let err: GaxError = serde_json::from_str::<i32>("nope").unwrap_err().into();
        assert!(matches!(err, GaxError::Serialization(_)));
    }
}
