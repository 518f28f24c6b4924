//! Session configuration.

use std::path::PathBuf;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

/// Default SSH port.
pub const DEFAULT_SSH_PORT: u16 = 22;

/// Default Telnet port.
pub const DEFAULT_TELNET_PORT: u16 = 23;

/// Wire protocol used to reach the device CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    /// One SSH exec channel per command.
    #[default]
    Ssh,

    /// Raw RFC 854 byte stream with prompt-inferred completion.
    Telnet,
}

impl Transport {
    /// The well-known port for this transport.
    pub fn default_port(self) -> u16 {
        match self {
            Transport::Ssh => DEFAULT_SSH_PORT,
            Transport::Telnet => DEFAULT_TELNET_PORT,
        }
    }
}

/// Host key verification mode, analogous to OpenSSH's `StrictHostKeyChecking`.
#[derive(Debug, Clone, Default)]
pub enum HostKeyVerification {
    /// Reject unknown and changed keys. Connection fails if the host
    /// is not already in known_hosts.
    Strict,

    /// Accept and auto-learn unknown keys, but reject changed keys.
    /// This is the default and matches common SSH client behavior.
    #[default]
    AcceptNew,

    /// Accept all keys without checking. For testing and lab use only.
    Disabled,
}

/// Configuration for one device session.
///
/// Immutable once the session is built; use
/// [`SessionBuilder`](crate::session::SessionBuilder) to construct one.
#[derive(Debug)]
pub struct SessionConfig {
    /// Target host (hostname or IP address).
    pub host: String,

    /// TCP port (22 for SSH, 23 for Telnet unless overridden).
    pub port: u16,

    /// Wire protocol.
    pub transport: Transport,

    /// Username for the SSH handshake or the Telnet `login:` prompt.
    pub username: String,

    /// Password for authentication.
    pub password: SecretString,

    /// Secret answered to the `enable` password prompt. Falls back to
    /// `password` when unset.
    pub enable_secret: Option<SecretString>,

    /// Bound on a single connection attempt, including login.
    pub connect_timeout: Duration,

    /// Timeout applied when a command does not specify one.
    pub command_timeout: Duration,

    /// Period of the idle keepalive check.
    pub keepalive_interval: Duration,

    /// Attempts per connect cycle.
    pub max_attempts: u32,

    /// Base delay of the exponential backoff, and the delay before a
    /// background reconnect.
    pub retry_delay: Duration,

    /// Cap on background reconnect cycles after an unexpected drop.
    /// `None` keeps retrying until `disconnect()`.
    pub max_reconnect_cycles: Option<u32>,

    /// Command used for keepalive and health probes. Each transport has
    /// its own default when unset.
    pub probe_command: Option<String>,

    /// Terminal width reported through NAWS.
    pub terminal_width: u16,

    /// Terminal height reported through NAWS.
    pub terminal_height: u16,

    /// Quiet period after a prompt match before a Telnet command is
    /// declared complete.
    pub prompt_settle: Duration,

    /// Host key verification mode (SSH only).
    pub host_key_verification: HostKeyVerification,

    /// Path to known_hosts file (SSH only).
    pub known_hosts_path: Option<PathBuf>,
}

impl SessionConfig {
    /// Get the socket address for connection.
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// The secret to answer an elevation password prompt with.
    pub(crate) fn elevation_secret(&self) -> &str {
        self.enable_secret
            .as_ref()
            .unwrap_or(&self.password)
            .expose_secret()
    }

    /// Config with defaults for `transport`, used by tests and the builder.
    pub(crate) fn with_defaults(
        transport: Transport,
        host: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port: transport.default_port(),
            transport,
            username: username.into(),
            password: SecretString::from(password.into()),
            enable_secret: None,
            connect_timeout: Duration::from_secs(30),
            command_timeout: Duration::from_secs(30),
            keepalive_interval: Duration::from_secs(10),
            max_attempts: 3,
            retry_delay: Duration::from_secs(1),
            max_reconnect_cycles: None,
            probe_command: None,
            terminal_width: 511,
            terminal_height: 24,
            prompt_settle: Duration::from_millis(50),
            host_key_verification: HostKeyVerification::default(),
            known_hosts_path: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_ports_follow_transport() {
        let ssh = SessionConfig::with_defaults(Transport::Ssh, "10.0.0.1", "admin", "pw");
        let telnet = SessionConfig::with_defaults(Transport::Telnet, "10.0.0.1", "admin", "pw");
        assert_eq!(ssh.port, 22);
        assert_eq!(telnet.port, 23);
        assert_eq!(telnet.socket_addr(), "10.0.0.1:23");
    }

    #[test]
    fn test_elevation_secret_falls_back_to_password() {
        let mut config = SessionConfig::with_defaults(Transport::Telnet, "sw1", "admin", "pw");
        assert_eq!(config.elevation_secret(), "pw");
        config.enable_secret = Some(SecretString::from("en".to_string()));
        assert_eq!(config.elevation_secret(), "en");
    }

    #[test]
    fn test_debug_redacts_password() {
        let config = SessionConfig::with_defaults(Transport::Ssh, "sw1", "admin", "hunter2");
        assert!(!format!("{config:?}").contains("hunter2"));
    }
}
