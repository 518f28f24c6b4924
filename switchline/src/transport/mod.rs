//! Wire layer: the SSH and Telnet protocol engines.
//!
//! Each engine provides a [`Connector`] that performs one connection
//! attempt and yields a live [`Wire`]. The session supervisor owns the
//! retry, keepalive and reconnect policy; engines only know how to open
//! a link, run one command on it and close it.

pub mod config;
pub mod ssh;
pub mod telnet;

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;

use crate::error::Result;

pub use config::{HostKeyVerification, SessionConfig, Transport};
pub use ssh::{SshConnector, SshWire};
pub use telnet::{TelnetConnector, TelnetWire};

/// Performs single connection attempts for one transport.
pub trait Connector: Send + Sync + 'static {
    /// The live link produced by a successful attempt.
    type Wire: Wire;

    /// Open, authenticate and prepare one link.
    ///
    /// The returned [`LinkWatch`] resolves when the underlying socket
    /// closes for any reason.
    fn attempt(
        &self,
        config: &SessionConfig,
    ) -> impl Future<Output = Result<(Self::Wire, LinkWatch)>> + Send;

    /// Upper bound the supervisor puts on one `attempt`.
    ///
    /// Engines that run setup steps after logging in extend it so those
    /// steps can give up on their own before the attempt is cancelled.
    fn attempt_budget(config: &SessionConfig) -> Duration {
        config.connect_timeout
    }
}

/// A connected link able to run one command at a time.
pub trait Wire: Send + 'static {
    /// Lightweight command used for keepalive and health probes.
    const PROBE_COMMAND: &'static str;

    /// Run `command` and return its output.
    fn execute(
        &mut self,
        command: &str,
        timeout: Duration,
    ) -> impl Future<Output = Result<String>> + Send;

    /// Timeout to use for `command` inside a batch.
    fn batch_timeout(_command: &str, timeout: Duration) -> Duration {
        timeout
    }

    /// Inspect a batch command's output for inline device errors.
    fn review_output(_command: &str, _output: &str) {}

    /// Whether the device CLI is in its elevated mode.
    fn elevated(&self) -> bool {
        false
    }

    /// The raw prompt token learned from the device, if any.
    fn learned_prompt(&self) -> Option<&str> {
        None
    }

    /// Forcibly close the link.
    fn close(self) -> impl Future<Output = ()> + Send;
}

/// Held by whatever task keeps a link's socket alive. Dropping it marks
/// the link closed.
#[derive(Debug)]
pub struct LinkAlive(#[allow(dead_code)] watch::Sender<()>);

/// Observes closure of a link.
#[derive(Debug, Clone)]
pub struct LinkWatch(watch::Receiver<()>);

impl LinkWatch {
    /// Create a connected alive/watch pair.
    pub fn pair() -> (LinkAlive, LinkWatch) {
        let (tx, rx) = watch::channel(());
        (LinkAlive(tx), LinkWatch(rx))
    }

    /// Wait until the link closes.
    pub async fn closed(&mut self) {
        while self.0.changed().await.is_ok() {}
    }

    /// Check whether the link has already closed.
    pub fn is_closed(&self) -> bool {
        self.0.has_changed().is_err()
    }
}
