use serde::{Deserialize, Serialize};

/// Lifecycle state of the dashboard's real-time connection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    /// A backoff timer is pending or a retry handshake is in flight.
    Reconnecting,
    /// The error budget is spent; only an explicit reset leaves this state.
    CircuitOpen,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::CircuitOpen => "circuit_open",
        }
    }

    /// States in which a `connect()` call has nothing to do.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Connected | Self::Connecting)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_disconnected() {
        assert_eq!(ConnectionState::default(), ConnectionState::Disconnected);
    }

    #[test]
    fn active_states() {
        assert!(ConnectionState::Connected.is_active());
        assert!(ConnectionState::Connecting.is_active());
        assert!(!ConnectionState::Reconnecting.is_active());
        assert!(!ConnectionState::CircuitOpen.is_active());
        assert!(!ConnectionState::Disconnected.is_active());
    }

    #[test]
    fn display_matches_serde_name() {
        let json = serde_json::to_string(&ConnectionState::CircuitOpen).unwrap();
        assert_eq!(json, "\"circuit_open\"");
        assert_eq!(ConnectionState::CircuitOpen.to_string(), "circuit_open");
    }
}
