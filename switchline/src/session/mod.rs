//! The session contract and its supervised implementation.
//!
//! Callers talk to a device through [`CliSession`]. [`Session`] implements
//! it for any wire engine; [`DeviceSession`] picks SSH or Telnet at
//! runtime, which is what [`SessionBuilder::build`] returns.

mod builder;
mod stats;
mod supervisor;

pub use builder::SessionBuilder;
pub use stats::{ConnectionState, SessionStats};
pub use supervisor::{CONNECT_WAIT_CEILING, PROBE_TIMEOUT, Session, backoff_delay};

use std::future::Future;
use std::time::Duration;

use crate::error::Result;
use crate::transport::{Connector, SshConnector, TelnetConnector};

/// A supervised SSH session.
pub type SshSession = Session<SshConnector>;

/// A supervised Telnet session.
pub type TelnetSession = Session<TelnetConnector>;

/// The interface every device session offers.
pub trait CliSession: Send + Sync {
    /// Connect, retrying with backoff. A no-op when already connected.
    fn connect(&self) -> impl Future<Output = Result<()>> + Send;

    /// Close the connection and stop background work. Idempotent.
    fn disconnect(&self) -> impl Future<Output = ()> + Send;

    /// Check if the session is connected.
    fn is_connected(&self) -> bool;

    /// Run one command. `None` uses the configured command timeout.
    fn execute_command(
        &self,
        command: &str,
        timeout: Option<Duration>,
    ) -> impl Future<Output = Result<String>> + Send;

    /// Run commands sequentially. Never fails; a failed command yields
    /// an empty string at its index.
    fn execute_multiple_commands(
        &self,
        commands: &[&str],
        timeout: Option<Duration>,
    ) -> impl Future<Output = Vec<String>> + Send;

    /// Probe the device with a short timeout.
    fn health_check(&self) -> impl Future<Output = bool> + Send;

    /// Snapshot of the session's state and activity.
    fn stats(&self) -> SessionStats;
}

impl<C: Connector> CliSession for Session<C> {
    async fn connect(&self) -> Result<()> {
        Session::connect(self).await
    }

    async fn disconnect(&self) {
        Session::disconnect(self).await
    }

    fn is_connected(&self) -> bool {
        Session::is_connected(self)
    }

    async fn execute_command(&self, command: &str, timeout: Option<Duration>) -> Result<String> {
        Session::execute_command(self, command, timeout).await
    }

    async fn execute_multiple_commands(
        &self,
        commands: &[&str],
        timeout: Option<Duration>,
    ) -> Vec<String> {
        Session::execute_multiple_commands(self, commands, timeout).await
    }

    async fn health_check(&self) -> bool {
        Session::health_check(self).await
    }

    fn stats(&self) -> SessionStats {
        Session::stats(self)
    }
}

/// A session over whichever transport the configuration selected.
pub enum DeviceSession {
    Ssh(SshSession),
    Telnet(TelnetSession),
}

impl CliSession for DeviceSession {
    async fn connect(&self) -> Result<()> {
        match self {
            Self::Ssh(s) => s.connect().await,
            Self::Telnet(s) => s.connect().await,
        }
    }

    async fn disconnect(&self) {
        match self {
            Self::Ssh(s) => s.disconnect().await,
            Self::Telnet(s) => s.disconnect().await,
        }
    }

    fn is_connected(&self) -> bool {
        match self {
            Self::Ssh(s) => s.is_connected(),
            Self::Telnet(s) => s.is_connected(),
        }
    }

    async fn execute_command(&self, command: &str, timeout: Option<Duration>) -> Result<String> {
        match self {
            Self::Ssh(s) => s.execute_command(command, timeout).await,
            Self::Telnet(s) => s.execute_command(command, timeout).await,
        }
    }

    async fn execute_multiple_commands(
        &self,
        commands: &[&str],
        timeout: Option<Duration>,
    ) -> Vec<String> {
        match self {
            Self::Ssh(s) => s.execute_multiple_commands(commands, timeout).await,
            Self::Telnet(s) => s.execute_multiple_commands(commands, timeout).await,
        }
    }

    async fn health_check(&self) -> bool {
        match self {
            Self::Ssh(s) => s.health_check().await,
            Self::Telnet(s) => s.health_check().await,
        }
    }

    fn stats(&self) -> SessionStats {
        match self {
            Self::Ssh(s) => s.stats(),
            Self::Telnet(s) => s.stats(),
        }
    }
}
