//! Settings schema. All sections deserialize with defaults so a partial file is valid.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Name of the flag guarding the incremental dashboard update path.
pub const INCREMENTAL_UPDATES: &str = "incrementalUpdates";

/// Root settings object.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeskwireSettings {
    pub connection: ConnectionSettings,
    pub monitor: MonitorSettings,
    /// Initial feature flag values.
    pub features: FeatureSettings,
    pub logging: LoggingSettings,
}

/// Real-time connection settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectionSettings {
    /// WebSocket endpoint of the helpdesk server.
    pub url: String,
    /// Agent identity announced on connect. Generated when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    /// Consecutive failed reconnection attempts before giving up.
    pub reconnection_attempts: u32,
    /// Base backoff delay in milliseconds.
    pub reconnection_delay_ms: u64,
    /// Backoff ceiling in milliseconds.
    pub max_reconnection_delay_ms: u64,
    /// Heartbeat period in milliseconds.
    pub heartbeat_interval_ms: u64,
    /// Error budget before the circuit breaker opens.
    pub max_errors: u32,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            url: "ws://localhost:3000/realtime".to_string(),
            agent_id: None,
            reconnection_attempts: 5,
            reconnection_delay_ms: 1_000,
            max_reconnection_delay_ms: 30_000,
            heartbeat_interval_ms: 30_000,
            max_errors: 3,
        }
    }
}

/// Update monitor settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MonitorSettings {
    /// Window error rate above which incremental updates are disabled.
    pub error_threshold: f64,
    /// Number of metrics retained.
    pub capacity: usize,
    /// Number of most recent metrics the error rate is computed over.
    pub window: usize,
    /// Samples required before the error rate may trigger a degrade.
    pub min_samples: usize,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            error_threshold: 0.10,
            capacity: 100,
            window: 20,
            min_samples: 10,
        }
    }
}

/// Feature flag defaults keyed by flag name.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeatureSettings(pub BTreeMap<String, bool>);

impl Default for FeatureSettings {
    fn default() -> Self {
        let mut flags = BTreeMap::new();
        flags.insert(INCREMENTAL_UPDATES.to_string(), false);
        Self(flags)
    }
}

impl FeatureSettings {
    pub fn get(&self, name: &str) -> Option<bool> {
        self.0.get(name).copied()
    }

    pub fn set(&mut self, name: &str, enabled: bool) {
        self.0.insert(name.to_string(), enabled);
    }
}

/// Logging settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default level (`trace`..`error`). `RUST_LOG` takes precedence.
    pub level: String,
    /// Emit JSON lines.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_defaults() {
        let c = ConnectionSettings::default();
        assert_eq!(c.reconnection_attempts, 5);
        assert_eq!(c.reconnection_delay_ms, 1_000);
        assert_eq!(c.max_reconnection_delay_ms, 30_000);
        assert_eq!(c.heartbeat_interval_ms, 30_000);
        assert_eq!(c.max_errors, 3);
        assert!(c.agent_id.is_none());
    }

    #[test]
    fn monitor_defaults() {
        let m = MonitorSettings::default();
        assert_eq!(m.error_threshold, 0.10);
        assert_eq!(m.capacity, 100);
        assert_eq!(m.window, 20);
        assert_eq!(m.min_samples, 10);
    }

    #[test]
    fn incremental_updates_default_off() {
        let f = FeatureSettings::default();
        assert_eq!(f.get(INCREMENTAL_UPDATES), Some(false));
    }

    #[test]
    fn camel_case_keys() {
        let json = serde_json::to_value(DeskwireSettings::default()).unwrap();
        assert!(json["connection"]["reconnectionAttempts"].is_number());
        assert!(json["connection"]["maxReconnectionDelayMs"].is_number());
        assert!(json["monitor"]["errorThreshold"].is_number());
        assert_eq!(json["features"]["incrementalUpdates"], false);
        assert!(json["connection"].get("agentId").is_none());
    }

    #[test]
    fn partial_json_fills_defaults() {
        let s: DeskwireSettings =
            serde_json::from_str(r#"{"connection": {"maxErrors": 7}}"#).unwrap();
        assert_eq!(s.connection.max_errors, 7);
        assert_eq!(s.connection.reconnection_attempts, 5);
        assert_eq!(s.monitor.window, 20);
    }
}
