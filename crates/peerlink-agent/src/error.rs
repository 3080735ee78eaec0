//! Error types for the agent

use crate::config::ConfigError;
use peerlink_proto::ProtocolError;
use thiserror::Error;

/// Errors that stop the agent
#[derive(Debug, Error)]
pub enum AgentError {
    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Protocol errors
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// `run` was called twice
    #[error("Agent is already running")]
    AlreadyRunning,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = AgentError::from(ConfigError::InvalidValue {
            var: "PEERLINK_LISTEN",
            value: "nowhere".to_string(),
        });
        assert_eq!(
            err.to_string(),
            "Configuration error: invalid value 'nowhere' for PEERLINK_LISTEN"
        );

        let err = AgentError::from(std::io::Error::new(std::io::ErrorKind::AddrInUse, "taken"));
        assert!(matches!(err, AgentError::Io(_)));
    }
}
