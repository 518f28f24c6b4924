//! Connection state and on-demand session statistics.

use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Serialize, Serializer};

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    /// Background recovery after an unexpected drop.
    Reconnecting,
    /// The last connect cycle exhausted its attempts.
    Error,
}

impl ConnectionState {
    /// Whether a connect cycle is running.
    pub fn is_transient(self) -> bool {
        matches!(self, Self::Connecting | Self::Reconnecting)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Error => "error",
        };
        f.write_str(name)
    }
}

/// Snapshot of a session, computed on demand.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStats {
    pub state: ConnectionState,

    pub connected: bool,

    /// Wall-clock time of the last successful command or connect.
    #[serde(serialize_with = "unix_millis")]
    pub last_activity: Option<SystemTime>,

    /// Time since `last_activity`.
    #[serde(serialize_with = "millis")]
    pub idle_time: Option<Duration>,

    /// Attempts made by the current or last connect cycle. Reset to 0
    /// on success.
    pub attempts: u32,

    /// Whether the device CLI is in its elevated mode.
    pub elevated: bool,

    /// Raw prompt token learned from the device.
    pub learned_prompt: Option<String>,
}

fn unix_millis<S: Serializer>(
    time: &Option<SystemTime>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    let millis = time
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as u64);
    millis.serialize(serializer)
}

fn millis<S: Serializer>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
    duration.map(|d| d.as_millis() as u64).serialize(serializer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_json_shape() {
        let stats = SessionStats {
            state: ConnectionState::Connected,
            connected: true,
            last_activity: Some(UNIX_EPOCH + Duration::from_millis(1_500)),
            idle_time: Some(Duration::from_millis(250)),
            attempts: 0,
            elevated: true,
            learned_prompt: Some("SSH@ICX6450".into()),
        };

        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["state"], "connected");
        assert_eq!(json["lastActivity"], 1500);
        assert_eq!(json["idleTime"], 250);
        assert_eq!(json["learnedPrompt"], "SSH@ICX6450");
    }

    #[test]
    fn test_state_display_matches_serde() {
        for state in [
            ConnectionState::Disconnected,
            ConnectionState::Reconnecting,
            ConnectionState::Error,
        ] {
            let json = serde_json::to_value(state).unwrap();
            assert_eq!(json, state.to_string());
        }
        assert!(ConnectionState::Connecting.is_transient());
        assert!(!ConnectionState::Connected.is_transient());
    }
}
