//! Error types for protocol operations

use crate::codes;
use thiserror::Error;

/// Protocol-specific errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Argument encoding did not match what the command expects
    #[error("JSON syntax error")]
    JsonSyntax,

    /// Message framing or header fields are malformed
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Underlying stream failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// Error code reported to the peer when this error aborts a command
    pub fn code(&self) -> i32 {
        match self {
            Self::JsonSyntax => codes::JSON_SYNTAX,
            Self::Protocol(_) => codes::PROTOCOL,
            Self::Serialization(_) => codes::OTHER,
            Self::Io(e) => e.raw_os_error().unwrap_or(codes::OTHER),
        }
    }
}

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_syntax() || err.is_data() || err.is_eof() {
            Self::JsonSyntax
        } else {
            Self::Serialization(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(ProtocolError::JsonSyntax.code(), codes::JSON_SYNTAX);
        assert_eq!(ProtocolError::Protocol("bad".into()).code(), codes::PROTOCOL);

        // ENOENT
        let io = std::io::Error::from_raw_os_error(2);
        assert_eq!(ProtocolError::Io(io).code(), 2);
    }

    #[test]
    fn test_from_json_error() {
        let err = serde_json::from_str::<String>("{").unwrap_err();
        assert!(matches!(ProtocolError::from(err), ProtocolError::JsonSyntax));
    }
}
