//! Builder for device sessions.

use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;

use super::{DeviceSession, Session};
use crate::error::{Error, Result};
use crate::transport::config::{HostKeyVerification, SessionConfig, Transport};
use crate::transport::{SshConnector, TelnetConnector};

/// Builder for constructing device sessions.
///
/// # Example
///
/// ```rust,no_run
/// use switchline::session::{CliSession, SessionBuilder};
///
/// # async fn example() -> Result<(), switchline::Error> {
/// let session = SessionBuilder::telnet("192.168.1.10")
///     .username("admin")
///     .password("secret")
///     .enable_secret("enable-secret")
///     .build()?;
/// session.connect().await?;
/// let version = session.execute_command("show version", None).await?;
/// # Ok(())
/// # }
/// ```
pub struct SessionBuilder {
    host: String,
    port: Option<u16>,
    transport: Transport,
    username: Option<String>,
    password: String,
    enable_secret: Option<String>,
    connect_timeout: Duration,
    command_timeout: Duration,
    keepalive_interval: Duration,
    max_attempts: u32,
    retry_delay: Duration,
    max_reconnect_cycles: Option<u32>,
    probe_command: Option<String>,
    terminal_width: u16,
    terminal_height: u16,
    prompt_settle: Duration,
    host_key_verification: HostKeyVerification,
    known_hosts_path: Option<PathBuf>,
}

impl SessionBuilder {
    /// Create a builder for `host` using `transport`.
    pub fn new(host: impl Into<String>, transport: Transport) -> Self {
        let defaults = SessionConfig::with_defaults(transport, "", "", "");
        Self {
            host: host.into(),
            port: None,
            transport,
            username: None,
            password: String::new(),
            enable_secret: None,
            connect_timeout: defaults.connect_timeout,
            command_timeout: defaults.command_timeout,
            keepalive_interval: defaults.keepalive_interval,
            max_attempts: defaults.max_attempts,
            retry_delay: defaults.retry_delay,
            max_reconnect_cycles: defaults.max_reconnect_cycles,
            probe_command: None,
            terminal_width: defaults.terminal_width,
            terminal_height: defaults.terminal_height,
            prompt_settle: defaults.prompt_settle,
            host_key_verification: defaults.host_key_verification,
            known_hosts_path: None,
        }
    }

    /// Builder for an SSH session (port 22 unless overridden).
    pub fn ssh(host: impl Into<String>) -> Self {
        Self::new(host, Transport::Ssh)
    }

    /// Builder for a Telnet session (port 23 unless overridden).
    pub fn telnet(host: impl Into<String>) -> Self {
        Self::new(host, Transport::Telnet)
    }

    /// Set the TCP port.
    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Set the username for authentication.
    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    /// Set the login password.
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = password.into();
        self
    }

    /// Set the secret for the `enable` prompt (defaults to the password).
    pub fn enable_secret(mut self, secret: impl Into<String>) -> Self {
        self.enable_secret = Some(secret.into());
        self
    }

    /// Bound on one connection attempt, including login.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Timeout for commands that do not pass their own.
    pub fn command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Set the keepalive check interval.
    pub fn keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval = interval;
        self
    }

    /// Attempts per connect cycle.
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Base delay for exponential backoff.
    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Stop background reconnection after this many failed cycles.
    pub fn max_reconnect_cycles(mut self, cycles: u32) -> Self {
        self.max_reconnect_cycles = Some(cycles);
        self
    }

    /// Override the keepalive and health probe command.
    pub fn probe_command(mut self, command: impl Into<String>) -> Self {
        self.probe_command = Some(command.into());
        self
    }

    /// Set terminal dimensions reported through NAWS.
    pub fn terminal_size(mut self, width: u16, height: u16) -> Self {
        self.terminal_width = width;
        self.terminal_height = height;
        self
    }

    /// Quiet period after a Telnet prompt match.
    pub fn prompt_settle(mut self, settle: Duration) -> Self {
        self.prompt_settle = settle;
        self
    }

    /// Set host key verification mode.
    pub fn host_key_verification(mut self, mode: HostKeyVerification) -> Self {
        self.host_key_verification = mode;
        self
    }

    /// Set the known_hosts file used for verification.
    pub fn known_hosts_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.known_hosts_path = Some(path.into());
        self
    }

    /// Validate and produce the session configuration.
    pub fn build_config(self) -> Result<SessionConfig> {
        let username = self
            .username
            .filter(|u| !u.is_empty())
            .ok_or_else(|| invalid("Username is required"))?;
        if self.host.is_empty() {
            return Err(invalid("Host is required"));
        }
        if self.max_attempts == 0 {
            return Err(invalid("max_attempts must be at least 1"));
        }
        if self.keepalive_interval.is_zero() {
            return Err(invalid("keepalive_interval must be non-zero"));
        }

        Ok(SessionConfig {
            port: self.port.unwrap_or(self.transport.default_port()),
            host: self.host,
            transport: self.transport,
            username,
            password: SecretString::from(self.password),
            enable_secret: self.enable_secret.map(SecretString::from),
            connect_timeout: self.connect_timeout,
            command_timeout: self.command_timeout,
            keepalive_interval: self.keepalive_interval,
            max_attempts: self.max_attempts,
            retry_delay: self.retry_delay,
            max_reconnect_cycles: self.max_reconnect_cycles,
            probe_command: self.probe_command,
            terminal_width: self.terminal_width,
            terminal_height: self.terminal_height,
            prompt_settle: self.prompt_settle,
            host_key_verification: self.host_key_verification,
            known_hosts_path: self.known_hosts_path,
        })
    }

    /// Build the session for the configured transport.
    ///
    /// This creates the session but does not connect. Call `connect()`
    /// on the returned session to establish the connection.
    pub fn build(self) -> Result<DeviceSession> {
        let config = self.build_config()?;
        Ok(match config.transport {
            Transport::Ssh => DeviceSession::Ssh(Session::new(config, SshConnector)),
            Transport::Telnet => DeviceSession::Telnet(Session::new(config, TelnetConnector)),
        })
    }
}

fn invalid(message: &str) -> Error {
    Error::InvalidConfig {
        message: message.to_string(),
    }
}
