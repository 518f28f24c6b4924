//! Telnet engine tests against a scripted switch over an in-memory pipe.

use std::time::{Duration, Instant};

use switchline::session::SessionBuilder;
use switchline::transport::telnet::codec::{cmd, opt};
use switchline::transport::{SessionConfig, TelnetWire, Wire};
use switchline::{ConnectionError, Error};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::task::JoinHandle;

const COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

/// A tiny CLI that behaves like an ICX switch in user mode.
struct FakeSwitch {
    io: DuplexStream,
    password: &'static str,
    enable_secret: &'static str,
    elevated: bool,
    /// Go silent after echoing `enable`.
    stall_enable: bool,
    /// Every IAC sequence the client sent.
    negotiation: Vec<u8>,
    /// Pager advances received.
    spaces: usize,
    /// Commands received after login.
    commands: Vec<String>,
}

impl FakeSwitch {
    fn new(io: DuplexStream) -> Self {
        Self {
            io,
            password: "pw",
            enable_secret: "en",
            elevated: false,
            stall_enable: false,
            negotiation: Vec::new(),
            spaces: 0,
            commands: Vec::new(),
        }
    }

    fn prompt(&self) -> String {
        format!("sw1{}", if self.elevated { '#' } else { '>' })
    }

    async fn send(&mut self, data: impl AsRef<[u8]>) {
        let _ = self.io.write_all(data.as_ref()).await;
    }

    /// Next application byte, recording any IAC sequence on the way.
    async fn next_byte(&mut self) -> Option<u8> {
        loop {
            let byte = self.io.read_u8().await.ok()?;
            if byte != cmd::IAC {
                return Some(byte);
            }
            let verb = self.io.read_u8().await.ok()?;
            self.negotiation.extend([cmd::IAC, verb]);
            match verb {
                cmd::IAC => return Some(cmd::IAC),
                cmd::DO | cmd::DONT | cmd::WILL | cmd::WONT => {
                    let option = self.io.read_u8().await.ok()?;
                    self.negotiation.push(option);
                }
                cmd::SB => loop {
                    let b = self.io.read_u8().await.ok()?;
                    self.negotiation.push(b);
                    if b == cmd::IAC {
                        let next = self.io.read_u8().await.ok()?;
                        self.negotiation.push(next);
                        if next == cmd::SE {
                            break;
                        }
                    }
                },
                _ => {}
            }
        }
    }

    async fn read_line(&mut self) -> Option<String> {
        let mut line = Vec::new();
        loop {
            match self.next_byte().await? {
                b'\n' => return Some(String::from_utf8_lossy(&line).into_owned()),
                b'\r' => {}
                b => line.push(b),
            }
        }
    }

    async fn expect_space(&mut self) -> Option<()> {
        (self.next_byte().await? == b' ').then(|| self.spaces += 1)
    }

    async fn serve(mut self) -> Self {
        self.send([
            cmd::IAC,
            cmd::WILL,
            opt::ECHO,
            cmd::IAC,
            cmd::WILL,
            opt::SGA,
            cmd::IAC,
            cmd::DO,
            opt::NAWS,
        ])
        .await;
        self.send("\r\nUser Access Verification\r\n\r\nlogin: ").await;

        if self.read_line().await.is_none() {
            return self;
        }
        self.send("\r\nPassword: ").await;
        match self.read_line().await {
            Some(p) if p == self.password => {}
            Some(_) => {
                self.send("\r\nLogin incorrect\r\n\r\nlogin: ").await;
                let _ = self.read_line().await;
                return self;
            }
            None => return self,
        }
        let prompt = self.prompt();
        self.send(format!("\r\n{prompt}")).await;

        while let Some(command) = self.read_line().await {
            self.commands.push(command.clone());
            if command == "mute" {
                continue;
            }
            self.send(format!("{command}\r\n")).await;

            match command.as_str() {
                "enable" if self.stall_enable => {}
                "enable" => {
                    self.send("Password:").await;
                    let Some(secret) = self.read_line().await else {
                        break;
                    };
                    if secret == self.enable_secret {
                        self.elevated = true;
                        let prompt = self.prompt();
                        self.send(format!("\r\n{prompt}")).await;
                    } else {
                        let prompt = self.prompt();
                        self.send(format!("\r\nError - incorrect password\r\n{prompt}"))
                            .await;
                    }
                }
                "terminal length 0" | "" => {
                    let prompt = self.prompt();
                    self.send(prompt).await;
                }
                "show version" => {
                    let prompt = self.prompt();
                    self.send(format!("ICX6450 v8.0.95d\r\n{prompt}")).await;
                }
                "show running-config" => {
                    self.send("line 1\r\n--More--").await;
                    if self.expect_space().await.is_none() {
                        break;
                    }
                    self.send("\x08\x08\x08\x08\x08\x08\x08\x08line 2\r\n--Mo")
                        .await;
                    self.send("re--").await;
                    if self.expect_space().await.is_none() {
                        break;
                    }
                    let prompt = self.prompt();
                    self.send(format!("\r        \rline 3\r\n{prompt}")).await;
                }
                "partial" => self.send("half a line").await,
                "bye" => {
                    let _ = self.io.shutdown().await;
                    break;
                }
                other => {
                    let prompt = self.prompt();
                    self.send(format!("Invalid input -> {other}\r\n{prompt}"))
                        .await;
                }
            }
        }
        self
    }
}

fn config(password: &str, enable_secret: &str) -> SessionConfig {
    SessionBuilder::telnet("sw1")
        .username("admin")
        .password(password)
        .enable_secret(enable_secret)
        .connect_timeout(Duration::from_secs(5))
        .prompt_settle(Duration::from_millis(20))
        .build_config()
        .unwrap()
}

fn spawn_switch() -> (DuplexStream, JoinHandle<FakeSwitch>) {
    let (client, server) = tokio::io::duplex(4096);
    (client, tokio::spawn(FakeSwitch::new(server).serve()))
}

async fn logged_in() -> (TelnetWire, JoinHandle<FakeSwitch>) {
    let (client, switch) = spawn_switch();
    let (wire, _link) = TelnetWire::establish(client, &config("pw", "en"))
        .await
        .unwrap();
    (wire, switch)
}

#[tokio::test]
async fn login_elevates_and_disables_paging() {
    let (wire, switch) = logged_in().await;
    assert!(wire.elevated());
    assert_eq!(wire.learned_prompt(), Some("sw1"));

    wire.close().await;
    let switch = switch.await.unwrap();
    assert_eq!(switch.commands, ["enable", "terminal length 0"]);
}

#[tokio::test]
async fn negotiation_answers_reach_the_device() {
    let (wire, switch) = logged_in().await;
    wire.close().await;
    let switch = switch.await.unwrap();

    let seen = &switch.negotiation;
    let contains = |needle: &[u8]| seen.windows(needle.len()).any(|w| w == needle);
    assert!(contains(&[cmd::IAC, cmd::DO, opt::ECHO]));
    assert!(contains(&[cmd::IAC, cmd::DO, opt::SGA]));
    assert!(contains(&[cmd::IAC, cmd::WILL, opt::NAWS]));
    // 511 x 24 with the 0xFF byte doubled.
    assert!(contains(&[
        cmd::IAC,
        cmd::SB,
        opt::NAWS,
        0x01,
        0xFF,
        0xFF,
        0,
        24,
        cmd::IAC,
        cmd::SE
    ]));
}

#[tokio::test]
async fn show_output_is_cleaned() {
    let (mut wire, _switch) = logged_in().await;
    let output = wire.execute("show version", COMMAND_TIMEOUT).await.unwrap();
    assert_eq!(output, "ICX6450 v8.0.95d");
}

#[tokio::test]
async fn pager_gets_one_space_per_marker() {
    let (mut wire, switch) = logged_in().await;
    let output = wire
        .execute("show running-config", COMMAND_TIMEOUT)
        .await
        .unwrap();
    assert_eq!(output, "line 1\nline 2\nline 3");

    wire.close().await;
    assert_eq!(switch.await.unwrap().spaces, 2);
}

#[tokio::test]
async fn probe_command_yields_empty_output() {
    let (mut wire, _switch) = logged_in().await;
    let output = wire
        .execute(TelnetWire::PROBE_COMMAND, COMMAND_TIMEOUT)
        .await
        .unwrap();
    assert_eq!(output, "");
}

#[tokio::test]
async fn inline_errors_are_returned_as_output() {
    let (mut wire, _switch) = logged_in().await;
    let output = wire.execute("shw vlan", COMMAND_TIMEOUT).await.unwrap();
    assert_eq!(output, "Invalid input -> shw vlan");
}

#[tokio::test]
async fn deadline_returns_partial_output() {
    let (mut wire, _switch) = logged_in().await;
    let output = wire
        .execute("partial", Duration::from_millis(300))
        .await
        .unwrap();
    assert_eq!(output, "half a line");
}

#[tokio::test]
async fn deadline_without_output_is_timeout() {
    let (mut wire, _switch) = logged_in().await;
    let err = wire
        .execute("mute", Duration::from_millis(300))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Timeout { .. }), "got {err:?}");
}

#[tokio::test]
async fn wrong_password_is_authentication_failure() {
    let (client, _switch) = spawn_switch();
    let err = TelnetWire::establish(client, &config("nope", "en"))
        .await
        .err()
        .unwrap();
    assert!(err.is_authentication(), "got {err:?}");
}

#[tokio::test]
async fn failed_elevation_is_not_fatal() {
    let (client, switch) = spawn_switch();
    let (wire, _link) = TelnetWire::establish(client, &config("pw", "wrong"))
        .await
        .unwrap();
    assert!(!wire.elevated());

    wire.close().await;
    let switch = switch.await.unwrap();
    assert_eq!(switch.commands, ["enable"]);
}

#[tokio::test]
async fn peer_close_fails_command_and_fires_link_watch() {
    let (client, _switch) = spawn_switch();
    let (mut wire, mut link) = TelnetWire::establish(client, &config("pw", "en"))
        .await
        .unwrap();

    let err = wire.execute("bye", COMMAND_TIMEOUT).await.unwrap_err();
    assert!(
        matches!(err, Error::Connection(ConnectionError::Closed)),
        "got {err:?}"
    );
    link.closed().await;
    assert!(link.is_closed());
}

#[tokio::test]
async fn stalled_enable_falls_back_without_using_connect_budget() {
    let (client, server) = tokio::io::duplex(4096);
    let mut switch = FakeSwitch::new(server);
    switch.stall_enable = true;
    let switch = tokio::spawn(switch.serve());

    let mut config = config("pw", "en");
    config.command_timeout = Duration::from_millis(200);
    let started = Instant::now();
    let (mut wire, _link) = TelnetWire::establish(client, &config).await.unwrap();

    assert!(!wire.elevated());
    assert!(
        started.elapsed() < config.connect_timeout / 2,
        "setup took {:?}",
        started.elapsed()
    );

    let output = wire.execute("show version", COMMAND_TIMEOUT).await.unwrap();
    assert_eq!(output, "ICX6450 v8.0.95d");

    wire.close().await;
    let switch = switch.await.unwrap();
    assert_eq!(switch.commands, ["enable", "show version"]);
}
