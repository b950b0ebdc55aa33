//! Error types for code-relay.

use std::time::Duration;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Mailbox error: {0}")]
    Mailbox(#[from] MailboxError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),
}

/// Configuration-related errors. Always fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Mailbox protocol errors.
#[derive(Debug, thiserror::Error)]
pub enum MailboxError {
    #[error("Authentication failed: {reason}")]
    Auth { reason: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        operation: String,
        timeout: Duration,
    },

    #[error("Unexpected server response to {command}: {response}")]
    Protocol { command: String, response: String },

    #[error("Message {id} could not be parsed")]
    Parse { id: String },
}

impl MailboxError {
    /// Whether the error leaves the session unusable.
    ///
    /// Transport failures abort the cycle; anything else is contained to the
    /// message that produced it.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::Auth { .. } | Self::Network(_) | Self::Timeout { .. }
        )
    }

    /// Classify an I/O error raised by a socket operation.
    pub fn from_io(operation: &str, timeout: Duration, err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => Self::Timeout {
                operation: operation.to_string(),
                timeout,
            },
            _ => Self::Network(format!("{operation}: {err}")),
        }
    }
}

/// Delivery errors, scoped to a single destination.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Request to destination {destination} failed: {reason}")]
    Http { destination: String, reason: String },

    #[error("Destination {destination} rejected message with HTTP {status}: {body}")]
    Status {
        destination: String,
        status: u16,
        body: String,
    },
}

/// Keepalive ping failures. Logged, never fatal.
#[derive(Debug, thiserror::Error)]
pub enum KeepaliveError {
    #[error("Keepalive request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Keepalive target answered HTTP {0}")]
    Status(u16),
}

/// Result type alias for the relay.
pub type Result<T> = std::result::Result<T, Error>;
