//! Error types for Magnetite
//!
//! This module defines the crate-wide error type used across the server,
//! protocol, and cluster layers. Uses `thiserror` for ergonomic error
//! definitions.

use std::io;
use thiserror::Error;

/// Main error type for Magnetite operations
#[derive(Error, Debug)]
pub enum MagnetiteError {
    /// Protocol parsing or encoding error
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Unknown or unimplemented command
    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    /// Wrong number of arguments for a command
    #[error("Wrong number of arguments for '{0}' command")]
    WrongArity(String),

    /// Value cannot be parsed as integer
    #[error("ERR value is not an integer or out of range")]
    NotInteger,

    /// Configuration parsing or validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Raft log file corruption or format mismatch
    #[error("Log file error: {0}")]
    LogFile(String),

    /// The consensus layer rejected or could not complete an operation
    #[error("Raft error: {0}")]
    Raft(String),

    /// Connection was closed
    #[error("Connection closed")]
    ConnectionClosed,

    /// Underlying I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Internal server error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for Magnetite operations
pub type Result<T> = std::result::Result<T, MagnetiteError>;

impl MagnetiteError {
    /// Returns true if this error should close the connection
    #[cold]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            MagnetiteError::Io(_) | MagnetiteError::ConnectionClosed | MagnetiteError::Internal(_)
        )
    }

    /// Convert error to a RESP error string
    #[cold]
    pub fn to_resp_error(&self) -> String {
        match self {
            MagnetiteError::NotInteger => "ERR value is not an integer or out of range".to_string(),
            MagnetiteError::WrongArity(cmd) => {
                format!("ERR wrong number of arguments for '{cmd}' command")
            }
            MagnetiteError::UnknownCommand(cmd) => {
                format!("ERR unknown command '{cmd}'")
            }
            _ => format!("ERR {self}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_is_fatal() {
        assert!(MagnetiteError::ConnectionClosed.is_fatal());
        assert!(MagnetiteError::Internal("test".to_string()).is_fatal());
        assert!(!MagnetiteError::NotInteger.is_fatal());
        assert!(!MagnetiteError::Raft("rejected".to_string()).is_fatal());
    }

    #[test]
    fn test_error_to_resp() {
        assert_eq!(
            MagnetiteError::NotInteger.to_resp_error(),
            "ERR value is not an integer or out of range"
        );
        assert_eq!(
            MagnetiteError::WrongArity("GET".to_string()).to_resp_error(),
            "ERR wrong number of arguments for 'GET' command"
        );
        assert_eq!(
            MagnetiteError::UnknownCommand("FROB".to_string()).to_resp_error(),
            "ERR unknown command 'FROB'"
        );
    }
}
