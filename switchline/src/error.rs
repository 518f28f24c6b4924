//! Error types for switchline.

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Main error type for switchline operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Transport-level failure to establish or keep a session.
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    /// An operation did not complete within its deadline.
    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        /// What was being waited on (usually the command text).
        operation: String,
        timeout: Duration,
    },

    /// The device ran the command but reported a failure.
    #[error("Command '{command}' failed (exit code {exit_code:?}): {stderr}")]
    CommandExecution {
        command: String,
        exit_code: Option<u32>,
        /// Diagnostic output captured alongside the failure.
        stderr: String,
    },

    /// Invalid configuration in the session builder
    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },
}

impl Error {
    pub(crate) fn timeout(operation: impl Into<String>, timeout: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout,
        }
    }

    /// True for [`ConnectionError::Closed`] and [`ConnectionError::NotConnected`].
    pub fn is_connection_lost(&self) -> bool {
        matches!(
            self,
            Error::Connection(ConnectionError::Closed | ConnectionError::NotConnected)
        )
    }

    /// True when the device rejected the supplied credentials.
    pub fn is_authentication(&self) -> bool {
        match self {
            Error::Connection(ConnectionError::AuthenticationFailed { .. }) => true,
            Error::Connection(ConnectionError::AttemptsExhausted { last, .. }) => {
                last.is_authentication()
            }
            _ => false,
        }
    }
}

/// Connection layer errors (TCP, SSH handshake, authentication, lifecycle).
#[derive(Error, Debug)]
pub enum ConnectionError {
    /// Failed to connect to host
    #[error("Connection failed to {host}:{port}: {source}")]
    ConnectFailed {
        host: String,
        port: u16,
        #[source]
        source: io::Error,
    },

    /// SSH handshake or protocol error
    #[error("SSH error: {0}")]
    Ssh(#[from] russh::Error),

    /// Authentication failed
    #[error("Authentication failed for user '{user}'")]
    AuthenticationFailed { user: String },

    /// The server presented a key that differs from known_hosts
    #[error("Host key for {host}:{port} changed (known_hosts line {line})")]
    HostKeyChanged { host: String, port: u16, line: usize },

    /// Strict verification and the host is not in known_hosts
    #[error("Host key for {host}:{port} is not in known_hosts")]
    HostKeyUnknown { host: String, port: u16 },

    /// known_hosts could not be read or written
    #[error("known_hosts error: {0}")]
    KnownHosts(String),

    /// Connection was closed while in use
    #[error("Connection lost")]
    Closed,

    /// No live connection; call connect() first or wait for reconnection
    #[error("Not connected")]
    NotConnected,

    /// Another connect was in progress and did not resolve in time
    #[error("Concurrent connection attempt did not resolve within {0:?}")]
    ConnectWaitExceeded(Duration),

    /// Every connection attempt failed
    #[error("Failed to connect after {attempts} attempts: {last}")]
    AttemptsExhausted {
        attempts: u32,
        #[source]
        last: Box<Error>,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl From<russh::Error> for Error {
    fn from(e: russh::Error) -> Self {
        Error::Connection(ConnectionError::Ssh(e))
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Connection(ConnectionError::Io(e))
    }
}

/// Result type alias using switchline's Error.
pub type Result<T> = std::result::Result<T, Error>;
