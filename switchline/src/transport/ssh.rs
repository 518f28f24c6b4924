//! SSH engine using russh.
//!
//! Each command runs on its own exec channel, so completion is signalled
//! by the channel closing and no prompt handling is needed. A non-zero
//! exit status turns into [`Error::CommandExecution`].

use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, trace, warn};
use russh::client::{self, Handle, KeyboardInteractiveAuthResponse, Msg};
use russh::keys::PublicKey;
use russh::{Channel, ChannelMsg};
use secrecy::ExposeSecret;

use super::config::HostKeyVerification;
use super::{Connector, LinkAlive, LinkWatch, SessionConfig, Wire};
use crate::error::{ConnectionError, Error, Result};

/// Unanswered keepalives before russh drops the connection.
const KEEPALIVE_MAX: usize = 3;

/// Rounds of keyboard-interactive prompts answered before giving up.
const MAX_INTERACTIVE_ROUNDS: usize = 4;

/// Opens SSH links.
#[derive(Debug, Default, Clone, Copy)]
pub struct SshConnector;

impl Connector for SshConnector {
    type Wire = SshWire;

    async fn attempt(&self, config: &SessionConfig) -> Result<(SshWire, LinkWatch)> {
        SshWire::connect(config).await
    }
}

/// An authenticated SSH connection.
pub struct SshWire {
    session: Handle<SshHandler>,
}

impl SshWire {
    /// Connect to the SSH server and authenticate.
    pub async fn connect(config: &SessionConfig) -> Result<(Self, LinkWatch)> {
        let ssh_config = Arc::new(client::Config {
            keepalive_interval: Some(config.keepalive_interval),
            keepalive_max: KEEPALIVE_MAX,
            ..Default::default()
        });

        let host_key_error: Arc<Mutex<Option<ConnectionError>>> = Arc::new(Mutex::new(None));
        let (alive, watch) = LinkWatch::pair();

        let handler = SshHandler {
            host: config.host.clone(),
            port: config.port,
            host_key_verification: config.host_key_verification.clone(),
            known_hosts_path: config.known_hosts_path.clone(),
            host_key_error: host_key_error.clone(),
            _alive: alive,
        };

        debug!("Opening SSH connection to {}", config.socket_addr());
        let mut session = client::connect(ssh_config, (config.host.as_str(), config.port), handler)
            .await
            .map_err(|e| {
                // Prefer the detailed host key error over russh's generic one.
                let detailed = host_key_error.lock().ok().and_then(|mut slot| slot.take());
                match (detailed, e) {
                    (Some(hk_err), _) => hk_err,
                    (None, russh::Error::IO(source)) => ConnectionError::ConnectFailed {
                        host: config.host.clone(),
                        port: config.port,
                        source,
                    },
                    (None, e) => ConnectionError::Ssh(e),
                }
            })?;

        Self::authenticate(&mut session, config).await?;
        Ok((Self { session }, watch))
    }

    /// Password first, then keyboard-interactive answered with the password.
    async fn authenticate(session: &mut Handle<SshHandler>, config: &SessionConfig) -> Result<()> {
        let user = config.username.as_str();
        let password = config.password.expose_secret();

        if session
            .authenticate_password(user, password)
            .await?
            .success()
        {
            return Ok(());
        }

        debug!("Password auth rejected for '{user}', trying keyboard-interactive");
        let mut response = session
            .authenticate_keyboard_interactive_start(user, None::<String>)
            .await?;

        for _ in 0..MAX_INTERACTIVE_ROUNDS {
            match response {
                KeyboardInteractiveAuthResponse::Success => return Ok(()),
                KeyboardInteractiveAuthResponse::Failure { .. } => break,
                KeyboardInteractiveAuthResponse::InfoRequest { prompts, .. } => {
                    trace!("Answering {} keyboard-interactive prompts", prompts.len());
                    let answers = vec![password.to_string(); prompts.len()];
                    response = session
                        .authenticate_keyboard_interactive_respond(answers)
                        .await?;
                }
            }
        }

        Err(ConnectionError::AuthenticationFailed {
            user: user.to_string(),
        }
        .into())
    }

    async fn run(&mut self, command: &str, timeout: Duration) -> Result<String> {
        let exec = async {
            let mut channel = self.session.channel_open_session().await?;
            channel.exec(true, command).await?;
            Ok::<_, Error>(collect_exec(&mut channel).await)
        };

        let output = match tokio::time::timeout(timeout, exec).await {
            Ok(output) => output?,
            Err(_) => {
                warn!("'{command}' timed out after {timeout:?}, the remote channel may still run");
                return Err(Error::timeout(command, timeout));
            }
        };

        if output.exit_status.is_none() && self.session.is_closed() {
            return Err(ConnectionError::Closed.into());
        }
        output.into_result(command)
    }
}

impl Wire for SshWire {
    const PROBE_COMMAND: &'static str = "show clock";

    async fn execute(&mut self, command: &str, timeout: Duration) -> Result<String> {
        trace!("ssh exec: {command}");
        self.run(command, timeout).await
    }

    async fn close(self) {
        if let Err(e) = self
            .session
            .disconnect(russh::Disconnect::ByApplication, "", "en")
            .await
        {
            debug!("SSH disconnect: {e}");
        }
    }
}

/// One event on an exec channel.
#[derive(Debug)]
pub(crate) enum ExecEvent {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
    Exit(u32),
    Closed,
}

/// Source of exec channel events.
pub(crate) trait ExecSource: Send {
    /// The next event, or `None` once the channel is gone.
    fn next_event(&mut self) -> impl Future<Output = Option<ExecEvent>> + Send;
}

impl ExecSource for Channel<Msg> {
    async fn next_event(&mut self) -> Option<ExecEvent> {
        loop {
            match self.wait().await? {
                ChannelMsg::Data { data } => return Some(ExecEvent::Stdout(data.to_vec())),
                ChannelMsg::ExtendedData { data, ext: 1 } => {
                    return Some(ExecEvent::Stderr(data.to_vec()));
                }
                ChannelMsg::ExitStatus { exit_status } => return Some(ExecEvent::Exit(exit_status)),
                ChannelMsg::Close => return Some(ExecEvent::Closed),
                _ => {}
            }
        }
    }
}

/// Everything an exec channel produced.
#[derive(Debug, Default)]
pub(crate) struct ExecOutput {
    pub(crate) stdout: Vec<u8>,
    pub(crate) stderr: Vec<u8>,
    pub(crate) exit_status: Option<u32>,
}

impl ExecOutput {
    /// Stdout on success, [`Error::CommandExecution`] on a non-zero exit.
    pub(crate) fn into_result(self, command: &str) -> Result<String> {
        match self.exit_status {
            Some(code) if code != 0 => Err(Error::CommandExecution {
                command: command.to_string(),
                exit_code: Some(code),
                stderr: String::from_utf8_lossy(&self.stderr).into_owned(),
            }),
            _ => Ok(String::from_utf8_lossy(&self.stdout).into_owned()),
        }
    }
}

/// Drain an exec channel until it closes.
pub(crate) async fn collect_exec<S: ExecSource>(source: &mut S) -> ExecOutput {
    let mut output = ExecOutput::default();
    while let Some(event) = source.next_event().await {
        match event {
            ExecEvent::Stdout(data) => output.stdout.extend_from_slice(&data),
            ExecEvent::Stderr(data) => output.stderr.extend_from_slice(&data),
            ExecEvent::Exit(code) => output.exit_status = Some(code),
            ExecEvent::Closed => break,
        }
    }
    output
}

/// SSH client handler for russh.
///
/// russh drops the handler when the connection task ends, which releases
/// `_alive` and tells the supervisor the link is gone.
struct SshHandler {
    host: String,
    port: u16,
    host_key_verification: HostKeyVerification,
    known_hosts_path: Option<PathBuf>,
    /// Detailed host key error surfaced by connect() in place of the
    /// generic russh::Error::UnknownKey.
    host_key_error: Arc<Mutex<Option<ConnectionError>>>,
    _alive: LinkAlive,
}

impl SshHandler {
    /// `Ok(true)` if matched, `Ok(false)` if the host is unknown.
    fn check_known_hosts(
        &self,
        pubkey: &PublicKey,
    ) -> std::result::Result<bool, ConnectionError> {
        let result = match &self.known_hosts_path {
            Some(path) => russh::keys::check_known_hosts_path(&self.host, self.port, pubkey, path),
            None => russh::keys::check_known_hosts(&self.host, self.port, pubkey),
        };

        match result {
            Ok(matched) => Ok(matched),
            Err(russh::keys::Error::KeyChanged { line }) => Err(ConnectionError::HostKeyChanged {
                host: self.host.clone(),
                port: self.port,
                line,
            }),
            Err(e) => Err(ConnectionError::KnownHosts(e.to_string())),
        }
    }

    fn learn_host_key(&self, pubkey: &PublicKey) -> std::result::Result<(), ConnectionError> {
        let result = match &self.known_hosts_path {
            Some(path) => {
                russh::keys::known_hosts::learn_known_hosts_path(&self.host, self.port, pubkey, path)
            }
            None => russh::keys::known_hosts::learn_known_hosts(&self.host, self.port, pubkey),
        };
        result.map_err(|e| ConnectionError::KnownHosts(e.to_string()))
    }

    fn reject(&self, error: ConnectionError) -> bool {
        warn!("Rejecting host key for {}:{}: {error}", self.host, self.port);
        if let Ok(mut slot) = self.host_key_error.lock() {
            *slot = Some(error);
        }
        false
    }
}

impl client::Handler for SshHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        let accepted = match self.host_key_verification {
            HostKeyVerification::Disabled => true,
            HostKeyVerification::AcceptNew => match self.check_known_hosts(server_public_key) {
                Ok(true) => true,
                Ok(false) => {
                    if let Err(e) = self.learn_host_key(server_public_key) {
                        warn!("Failed to save host key: {e}");
                    }
                    true
                }
                Err(e) => self.reject(e),
            },
            HostKeyVerification::Strict => match self.check_known_hosts(server_public_key) {
                Ok(true) => true,
                Ok(false) => self.reject(ConnectionError::HostKeyUnknown {
                    host: self.host.clone(),
                    port: self.port,
                }),
                Err(e) => self.reject(e),
            },
        };
        Ok(accepted)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use super::*;

    /// Replays a fixed sequence of channel events.
    struct ScriptedChannel(VecDeque<ExecEvent>);

    impl ScriptedChannel {
        fn new(events: impl IntoIterator<Item = ExecEvent>) -> Self {
            Self(events.into_iter().collect())
        }
    }

    impl ExecSource for ScriptedChannel {
        async fn next_event(&mut self) -> Option<ExecEvent> {
            self.0.pop_front()
        }
    }

    #[tokio::test]
    async fn test_exit_zero_yields_stdout() {
        let mut channel = ScriptedChannel::new([
            ExecEvent::Stdout(b"ICX6450 ".to_vec()),
            ExecEvent::Stdout(b"v8.0.95d".to_vec()),
            ExecEvent::Exit(0),
            ExecEvent::Closed,
        ]);
        let output = collect_exec(&mut channel).await;
        assert_eq!(output.into_result("show version").unwrap(), "ICX6450 v8.0.95d");
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_command_failure() {
        let mut channel = ScriptedChannel::new([
            ExecEvent::Stderr(b"bad command".to_vec()),
            ExecEvent::Exit(1),
            ExecEvent::Closed,
        ]);
        let output = collect_exec(&mut channel).await;
        match output.into_result("show bogus") {
            Err(Error::CommandExecution {
                command,
                exit_code,
                stderr,
            }) => {
                assert_eq!(command, "show bogus");
                assert_eq!(exit_code, Some(1));
                assert_eq!(stderr, "bad command");
            }
            other => panic!("expected command failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_missing_exit_status_is_success() {
        let mut channel = ScriptedChannel::new([ExecEvent::Stdout(b"ok".to_vec())]);
        let output = collect_exec(&mut channel).await;
        assert_eq!(output.exit_status, None);
        assert_eq!(output.into_result("show clock").unwrap(), "ok");
    }

    #[tokio::test]
    async fn test_events_after_close_ignored() {
        let mut channel = ScriptedChannel::new([
            ExecEvent::Stdout(b"a".to_vec()),
            ExecEvent::Closed,
            ExecEvent::Stdout(b"b".to_vec()),
        ]);
        let output = collect_exec(&mut channel).await;
        assert_eq!(output.stdout, b"a");
    }
}
