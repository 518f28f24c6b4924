//! # Switchline
//!
//! Async CLI session layer for network switches that have no API.
//!
//! Switchline keeps one long-lived SSH or Telnet session per device and
//! exposes it as a uniform command interface: connect, run a command,
//! run a batch, check health, disconnect. Connection lifecycle (retry
//! with exponential backoff, idle keepalive, stale detection, background
//! reconnection) is handled once, for both transports.
//!
//! ## Features
//!
//! - SSH via russh: one exec channel per command, exit status checked
//! - Telnet over raw TCP with IAC negotiation, automatic login and `enable`
//! - Prompt learning, so no per-vendor prompt configuration is needed
//! - `--More--` pager handling and output cleanup
//! - Serializable session statistics
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use switchline::{CliSession, SessionBuilder};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), switchline::Error> {
//!     let session = SessionBuilder::ssh("192.168.1.1")
//!         .username("admin")
//!         .password("secret")
//!         .build()?;
//!
//!     session.connect().await?;
//!
//!     let output = session.execute_command("show version", None).await?;
//!     println!("{output}");
//!
//!     session.disconnect().await;
//!     Ok(())
//! }
//! ```

pub mod channel;
pub mod error;
pub mod session;
pub mod transport;

// Re-export main types for convenience
pub use error::{ConnectionError, Error, Result};
pub use session::{
    CliSession, ConnectionState, DeviceSession, Session, SessionBuilder, SessionStats, SshSession,
    TelnetSession,
};
pub use transport::{HostKeyVerification, SessionConfig, Transport};
