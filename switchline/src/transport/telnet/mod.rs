//! Telnet engine: one shared byte stream, prompt-inferred completion.
//!
//! A reader task owns the socket's read half. It strips IAC negotiation
//! from the stream, writes the replies back through the shared writer and
//! forwards application bytes to the [`TelnetWire`] over a channel. The
//! wire logs in, tries to elevate, disables paging and then runs one
//! command at a time, answering `--More--` pagers as they appear.

pub mod codec;

use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use log::{debug, info, trace, warn};
use secrecy::ExposeSecret;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use self::codec::Negotiator;
use super::{Connector, LinkAlive, LinkWatch, SessionConfig, Wire};
use crate::channel::prompt::{is_login_prompt, is_password_prompt};
use crate::channel::{OutputBuffer, PromptLearner, normalize_output};
use crate::error::{ConnectionError, Error, Result};

/// Command that requests privileged mode.
const ELEVATE_COMMAND: &str = "enable";

/// Command that turns off the pager for the rest of the session.
const DISABLE_PAGING_COMMAND: &str = "terminal length 0";

/// Keystroke that advances a `--More--` pager by one page.
const PAGER_ADVANCE: &[u8] = b" ";

/// Longest wait for the `enable` and paging steps after login.
const SETUP_STEP_CAP: Duration = Duration::from_secs(5);

/// Slack between the last setup step giving up and the attempt being cancelled.
const SETUP_GRACE: Duration = Duration::from_secs(1);

/// Upper bound on non-`show` commands inside a batch.
const CONFIG_COMMAND_CAP: Duration = Duration::from_secs(10);

/// Inline error texts a device prints instead of failing the command.
const INLINE_ERRORS: &[&str] = &[
    "Invalid input ->",
    "does not exist",
    "Ambiguous input",
    "Incomplete command",
];

const READ_CHUNK: usize = 4096;

/// Chunks buffered between the reader task and the wire.
const CHANNEL_DEPTH: usize = 64;

type SharedWriter = Arc<Mutex<Box<dyn AsyncWrite + Send + Unpin>>>;

/// Opens Telnet links over TCP.
#[derive(Debug, Default, Clone, Copy)]
pub struct TelnetConnector;

impl Connector for TelnetConnector {
    type Wire = TelnetWire;

    async fn attempt(&self, config: &SessionConfig) -> Result<(TelnetWire, LinkWatch)> {
        debug!("Opening telnet connection to {}", config.socket_addr());
        let deadline = Instant::now() + config.connect_timeout;
        let stream = tokio::time::timeout_at(
            deadline,
            TcpStream::connect((config.host.as_str(), config.port)),
        )
        .await
        .map_err(|_| {
            Error::timeout(
                format!("connect to {}", config.socket_addr()),
                config.connect_timeout,
            )
        })?
        .map_err(|source| ConnectionError::ConnectFailed {
            host: config.host.clone(),
            port: config.port,
            source,
        })?;
        stream.set_nodelay(true)?;
        TelnetWire::establish_by(stream, config, deadline).await
    }

    /// TCP connect and login share `connect_timeout`; elevation and paging
    /// each get `setup_wait` on top.
    fn attempt_budget(config: &SessionConfig) -> Duration {
        config.connect_timeout + setup_wait(config) * 2 + SETUP_GRACE
    }
}

/// Wait allowed for each post-login setup step.
fn setup_wait(config: &SessionConfig) -> Duration {
    config.command_timeout.min(SETUP_STEP_CAP)
}

/// A logged-in Telnet CLI session.
pub struct TelnetWire {
    writer: SharedWriter,
    incoming: mpsc::Receiver<Bytes>,
    reader: JoinHandle<()>,
    buffer: OutputBuffer,
    prompt: PromptLearner,
    settle: Duration,
}

impl TelnetWire {
    /// Run the reader task over `stream`, then log in and prepare the CLI.
    ///
    /// Login must finish within `config.connect_timeout`. Elevation and
    /// disabling the pager are then each bounded by the command timeout,
    /// capped at a few seconds, and fall back quietly when they stall.
    pub async fn establish<S>(stream: S, config: &SessionConfig) -> Result<(Self, LinkWatch)>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::establish_by(stream, config, Instant::now() + config.connect_timeout).await
    }

    async fn establish_by<S>(
        stream: S,
        config: &SessionConfig,
        login_deadline: Instant,
    ) -> Result<(Self, LinkWatch)>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let writer: SharedWriter = Arc::new(Mutex::new(Box::new(write_half)));
        let (alive, watch) = LinkWatch::pair();
        let (tx, incoming) = mpsc::channel(CHANNEL_DEPTH);
        let negotiator = Negotiator::new(config.terminal_width, config.terminal_height);
        let reader = tokio::spawn(read_loop(read_half, writer.clone(), negotiator, tx, alive));

        let mut wire = Self {
            writer,
            incoming,
            reader,
            buffer: OutputBuffer::new(),
            prompt: PromptLearner::new(),
            settle: config.prompt_settle,
        };

        if let Err(e) = wire.prepare(config, login_deadline).await {
            wire.close().await;
            return Err(e);
        }
        Ok((wire, watch))
    }

    async fn prepare(&mut self, config: &SessionConfig, login_deadline: Instant) -> Result<()> {
        self.login(config, login_deadline).await?;
        info!(
            "Logged in to {} as '{}'",
            config.socket_addr(),
            config.username
        );

        let wait = setup_wait(config);
        self.elevate(config, Instant::now() + wait).await?;
        if !self.prompt.elevated() {
            return Ok(());
        }

        match self.run(DISABLE_PAGING_COMMAND, wait).await {
            Ok(_) => Ok(()),
            Err(e @ Error::Connection(_)) => Err(e),
            Err(e) => {
                warn!("Could not disable paging: {e}");
                Ok(())
            }
        }
    }

    /// Answer the username and password prompts, each at most once.
    async fn login(&mut self, config: &SessionConfig, deadline: Instant) -> Result<()> {
        let mut sent_user = false;
        let mut sent_password = false;

        loop {
            let line = self.buffer.last_non_empty_line().unwrap_or_default();

            if is_password_prompt(&line) {
                if sent_password {
                    return Err(self.rejected(config));
                }
                self.buffer.clear();
                self.send_line(config.password.expose_secret()).await?;
                sent_password = true;
                continue;
            }

            if is_login_prompt(&line) {
                if sent_user {
                    return Err(self.rejected(config));
                }
                self.buffer.clear();
                self.send_line(&config.username).await?;
                sent_user = true;
                continue;
            }

            if self.prompt.observe(&self.buffer.as_str_lossy()) {
                self.buffer.clear();
                return Ok(());
            }

            if !self.fill(deadline).await? {
                return Err(Error::timeout("telnet login", config.connect_timeout));
            }
        }
    }

    fn rejected(&self, config: &SessionConfig) -> Error {
        warn!("Device re-prompted for credentials; login rejected");
        ConnectionError::AuthenticationFailed {
            user: config.username.clone(),
        }
        .into()
    }

    /// Try to reach the `#` prompt. Failing to elevate is not fatal.
    async fn elevate(&mut self, config: &SessionConfig, deadline: Instant) -> Result<()> {
        if self.prompt.elevated() {
            return Ok(());
        }

        self.drain();
        self.buffer.clear();
        self.send_line(ELEVATE_COMMAND).await?;

        let mut asked_secret = false;
        loop {
            let line = self.buffer.last_non_empty_line().unwrap_or_default();
            if is_password_prompt(&line) {
                if asked_secret {
                    break;
                }
                self.buffer.clear();
                self.send_line(config.elevation_secret()).await?;
                asked_secret = true;
                continue;
            }
            if self.prompt.is_prompt(&line) {
                self.prompt.observe(&line);
                break;
            }
            if !self.fill(deadline).await? {
                break;
            }
        }
        self.buffer.clear();

        if self.prompt.elevated() {
            debug!("Entered privileged mode");
        } else {
            warn!("Could not enter privileged mode, continuing unelevated");
        }
        Ok(())
    }

    /// Send one command and collect its output up to the next prompt.
    async fn run(&mut self, command: &str, timeout: Duration) -> Result<String> {
        self.drain();
        self.buffer.clear();
        let deadline = Instant::now() + timeout;

        trace!("telnet >> {command}");
        self.send_line(command).await?;

        loop {
            let pages = self.buffer.take_pager_markers();
            for _ in 0..pages {
                self.write_raw(PAGER_ADVANCE).await?;
            }

            if pages == 0 && self.prompt.is_prompt(&self.buffer.last_line()) {
                if self.settled(deadline).await? {
                    break;
                }
                continue;
            }

            if Instant::now() >= deadline || !self.fill(deadline).await? {
                if self.buffer.is_empty() {
                    return Err(Error::timeout(command, timeout));
                }
                warn!("'{command}' timed out after {timeout:?}, returning partial output");
                return Ok(self.finish(command));
            }
        }

        self.prompt.observe(&self.buffer.as_str_lossy());
        Ok(self.finish(command))
    }

    /// Wait out the settle window. False if more data arrived.
    async fn settled(&mut self, deadline: Instant) -> Result<bool> {
        if self.settle.is_zero() {
            return Ok(true);
        }
        let until = (Instant::now() + self.settle).min(deadline);
        Ok(!self.fill(until).await?)
    }

    /// Take the buffer and reduce it to the command's output.
    fn finish(&mut self, command: &str) -> String {
        let raw = String::from_utf8_lossy(&self.buffer.take()).into_owned();
        normalize_output(&raw, command, |line| self.prompt.is_prompt(line))
    }

    /// Append the next chunk from the reader task.
    ///
    /// Returns false when `deadline` passes first.
    async fn fill(&mut self, deadline: Instant) -> Result<bool> {
        match tokio::time::timeout_at(deadline, self.incoming.recv()).await {
            Ok(Some(chunk)) => {
                trace!("telnet << {:?}", String::from_utf8_lossy(&chunk));
                self.buffer.extend(&chunk);
                Ok(true)
            }
            Ok(None) => Err(ConnectionError::Closed.into()),
            Err(_) => Ok(false),
        }
    }

    /// Discard output that arrived between commands.
    fn drain(&mut self) {
        while let Ok(stale) = self.incoming.try_recv() {
            trace!("Discarding {} stale bytes", stale.len());
        }
    }

    async fn send_line(&self, line: &str) -> Result<()> {
        let mut data = codec::escape(line.as_bytes());
        data.extend_from_slice(b"\r\n");
        self.write_raw(&data).await
    }

    async fn write_raw(&self, data: &[u8]) -> Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(data).await.map_err(closed)?;
        writer.flush().await.map_err(closed)?;
        Ok(())
    }
}

impl Wire for TelnetWire {
    const PROBE_COMMAND: &'static str = "";

    async fn execute(&mut self, command: &str, timeout: Duration) -> Result<String> {
        self.run(command, timeout).await
    }

    fn batch_timeout(command: &str, timeout: Duration) -> Duration {
        if is_show_command(command) {
            timeout
        } else {
            timeout.min(CONFIG_COMMAND_CAP)
        }
    }

    fn review_output(command: &str, output: &str) {
        if let Some(marker) = INLINE_ERRORS.iter().find(|m| output.contains(*m)) {
            warn!("'{command}' reported an error ({marker}): {output}");
        }
    }

    fn elevated(&self) -> bool {
        self.prompt.elevated()
    }

    fn learned_prompt(&self) -> Option<&str> {
        self.prompt.current().map(|p| p.token())
    }

    async fn close(self) {
        self.reader.abort();
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            debug!("Telnet shutdown: {e}");
        }
    }
}

impl Drop for TelnetWire {
    fn drop(&mut self) {
        // The reader task holds the socket open otherwise.
        self.reader.abort();
    }
}

fn is_show_command(command: &str) -> bool {
    command
        .trim_start()
        .get(..4)
        .is_some_and(|head| head.eq_ignore_ascii_case("show"))
}

fn closed(e: std::io::Error) -> Error {
    debug!("Telnet write failed: {e}");
    ConnectionError::Closed.into()
}

/// Decode the socket until it closes, answering negotiation inline.
///
/// `_alive` is dropped when this task ends, which is what signals link
/// closure to the supervisor.
async fn read_loop<R>(
    mut reader: R,
    writer: SharedWriter,
    negotiator: Negotiator,
    tx: mpsc::Sender<Bytes>,
    _alive: LinkAlive,
) where
    R: AsyncRead + Unpin,
{
    let mut pending = BytesMut::with_capacity(READ_CHUNK);
    loop {
        pending.reserve(READ_CHUNK);
        match reader.read_buf(&mut pending).await {
            Ok(0) => {
                debug!("Telnet peer closed the connection");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                warn!("Telnet read failed: {e}");
                break;
            }
        }

        let decoded = negotiator.decode(&pending);
        pending.advance(decoded.consumed);

        if !decoded.replies.is_empty() {
            trace!("telnet negotiation reply {:02x?}", decoded.replies);
            let mut w = writer.lock().await;
            let sent = match w.write_all(&decoded.replies).await {
                Ok(()) => w.flush().await,
                Err(e) => Err(e),
            };
            if let Err(e) = sent {
                warn!("Telnet negotiation write failed: {e}");
                break;
            }
        }

        if !decoded.data.is_empty() && tx.send(Bytes::from(decoded.data)).await.is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::codec::{cmd, opt};
    use super::*;
    use crate::transport::Transport;

    fn spawn_reader(
        mock: tokio_test::io::Mock,
    ) -> (mpsc::Receiver<Bytes>, LinkWatch, JoinHandle<()>) {
        let (read_half, write_half) = tokio::io::split(mock);
        let writer: SharedWriter = Arc::new(Mutex::new(Box::new(write_half)));
        let (alive, watch) = LinkWatch::pair();
        let (tx, rx) = mpsc::channel(8);
        let task = tokio::spawn(read_loop(
            read_half,
            writer,
            Negotiator::new(80, 24),
            tx,
            alive,
        ));
        (rx, watch, task)
    }

    #[tokio::test]
    async fn test_reader_answers_negotiation_and_forwards_data() {
        let mock = tokio_test::io::Builder::new()
            .read(&[cmd::IAC, cmd::DO, opt::SGA])
            .write(&[cmd::IAC, cmd::WILL, opt::SGA])
            .read(b"login: ")
            .build();
        let (mut rx, mut watch, task) = spawn_reader(mock);

        assert_eq!(rx.recv().await.as_deref(), Some(&b"login: "[..]));
        assert!(rx.recv().await.is_none());
        watch.closed().await;
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_reader_carries_split_command_over() {
        let mock = tokio_test::io::Builder::new()
            .read(&[b'a', cmd::IAC])
            .read(&[cmd::WILL, opt::ECHO, b'b'])
            .write(&[cmd::IAC, cmd::DO, opt::ECHO])
            .build();
        let (mut rx, _watch, task) = spawn_reader(mock);

        assert_eq!(rx.recv().await.as_deref(), Some(&b"a"[..]));
        assert_eq!(rx.recv().await.as_deref(), Some(&b"b"[..]));
        assert!(rx.recv().await.is_none());
        task.await.unwrap();
    }

    #[test]
    fn test_batch_timeout_caps_config_commands() {
        let long = Duration::from_secs(60);
        assert_eq!(TelnetWire::batch_timeout("show running-config", long), long);
        assert_eq!(TelnetWire::batch_timeout("  SHOW vlan", long), long);
        assert_eq!(
            TelnetWire::batch_timeout("vlan 10 name users", long),
            CONFIG_COMMAND_CAP
        );
        assert_eq!(
            TelnetWire::batch_timeout("vlan 10", Duration::from_secs(2)),
            Duration::from_secs(2)
        );
    }

    #[test]
    fn test_show_detection() {
        assert!(is_show_command("show"));
        assert!(!is_show_command("sh"));
        assert!(!is_show_command("interface ethernet 1/1/1"));
    }

    #[test]
    fn test_attempt_budget_covers_setup_steps() {
        let mut config = SessionConfig::with_defaults(Transport::Telnet, "sw1", "admin", "pw");
        assert_eq!(
            TelnetConnector::attempt_budget(&config),
            Duration::from_secs(30 + 5 + 5 + 1)
        );

        config.command_timeout = Duration::from_millis(200);
        assert_eq!(setup_wait(&config), Duration::from_millis(200));
        assert!(
            TelnetConnector::attempt_budget(&config)
                > config.connect_timeout + setup_wait(&config) * 2
        );
    }
}
