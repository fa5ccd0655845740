//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`DeskwireSettings::default()`]
//! 2. If `~/.deskwire/settings.json` exists, deep-merge user values over defaults
//! 3. Apply `DESKWIRE_*` environment variable overrides (highest priority)
//! 4. Validate the result

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::{Result, SettingsError};
use crate::types::{DeskwireSettings, INCREMENTAL_UPDATES};

/// Resolve the path to the settings file (`~/.deskwire/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".deskwire").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<DeskwireSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults. Invalid JSON or out-of-range values are errors.
pub fn load_settings_from_path(path: &Path) -> Result<DeskwireSettings> {
    let defaults = serde_json::to_value(DeskwireSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: DeskwireSettings = serde_json::from_value(merged)?;
    apply_overrides(&mut settings, |name| std::env::var(name).ok());
    validate(&settings)?;
    Ok(settings)
}

/// Recursive deep merge of two JSON values.
///
/// - Objects are merged recursively (source overrides target per-key)
/// - Arrays and primitives are replaced entirely by source
/// - Null values in source are skipped (preserving target)
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = match target_map.remove(&key) {
                    Some(target_val) => deep_merge(target_val, source_val),
                    None => source_val,
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `DESKWIRE_*` overrides read through `lookup`.
///
/// Values that fail to parse or fall outside their range are logged and ignored.
pub fn apply_overrides(settings: &mut DeskwireSettings, lookup: impl Fn(&str) -> Option<String>) {
    let read = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

    if let Some(v) = read("DESKWIRE_URL") {
        settings.connection.url = v;
    }
    if let Some(v) = read("DESKWIRE_AGENT_ID") {
        settings.connection.agent_id = Some(v);
    }
    if let Some(v) = read("DESKWIRE_RECONNECTION_ATTEMPTS") {
        if let Some(n) = checked("DESKWIRE_RECONNECTION_ATTEMPTS", &v, parse_u64_range(&v, 1, 1_000)) {
            settings.connection.reconnection_attempts = n as u32;
        }
    }
    if let Some(v) = read("DESKWIRE_RECONNECTION_DELAY") {
        if let Some(n) = checked("DESKWIRE_RECONNECTION_DELAY", &v, parse_u64_range(&v, 10, 600_000)) {
            settings.connection.reconnection_delay_ms = n;
        }
    }
    if let Some(v) = read("DESKWIRE_MAX_RECONNECTION_DELAY") {
        if let Some(n) = checked("DESKWIRE_MAX_RECONNECTION_DELAY", &v, parse_u64_range(&v, 10, 3_600_000)) {
            settings.connection.max_reconnection_delay_ms = n;
        }
    }
    if let Some(v) = read("DESKWIRE_HEARTBEAT_INTERVAL") {
        if let Some(n) = checked("DESKWIRE_HEARTBEAT_INTERVAL", &v, parse_u64_range(&v, 1_000, 600_000)) {
            settings.connection.heartbeat_interval_ms = n;
        }
    }
    if let Some(v) = read("DESKWIRE_MAX_ERRORS") {
        if let Some(n) = checked("DESKWIRE_MAX_ERRORS", &v, parse_u64_range(&v, 1, 1_000)) {
            settings.connection.max_errors = n as u32;
        }
    }
    if let Some(v) = read("DESKWIRE_ERROR_THRESHOLD") {
        if let Some(x) = checked("DESKWIRE_ERROR_THRESHOLD", &v, parse_ratio(&v)) {
            settings.monitor.error_threshold = x;
        }
    }
    if let Some(v) = read("DESKWIRE_INCREMENTAL_UPDATES") {
        if let Some(b) = checked("DESKWIRE_INCREMENTAL_UPDATES", &v, parse_bool(&v)) {
            settings.features.set(INCREMENTAL_UPDATES, b);
        }
    }
    if let Some(v) = read("DESKWIRE_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = read("DESKWIRE_LOG_JSON") {
        if let Some(b) = checked("DESKWIRE_LOG_JSON", &v, parse_bool(&v)) {
            settings.logging.json = b;
        }
    }
}

/// Reject settings the connection layer cannot run with.
pub fn validate(settings: &DeskwireSettings) -> Result<()> {
    let c = &settings.connection;
    if c.url.trim().is_empty() {
        return Err(SettingsError::InvalidValue("connection.url is empty".into()));
    }
    if c.max_errors == 0 {
        return Err(SettingsError::InvalidValue("connection.maxErrors must be at least 1".into()));
    }
    if c.reconnection_attempts == 0 {
        return Err(SettingsError::InvalidValue(
            "connection.reconnectionAttempts must be at least 1".into(),
        ));
    }
    if c.reconnection_delay_ms > c.max_reconnection_delay_ms {
        return Err(SettingsError::InvalidValue(format!(
            "connection.reconnectionDelayMs ({}) exceeds maxReconnectionDelayMs ({})",
            c.reconnection_delay_ms, c.max_reconnection_delay_ms
        )));
    }
    if c.heartbeat_interval_ms == 0 {
        return Err(SettingsError::InvalidValue("connection.heartbeatIntervalMs must be positive".into()));
    }

    let m = &settings.monitor;
    if !(m.error_threshold > 0.0 && m.error_threshold <= 1.0) {
        return Err(SettingsError::InvalidValue(format!(
            "monitor.errorThreshold must be in (0, 1], got {}",
            m.error_threshold
        )));
    }
    if m.window == 0 || m.window > m.capacity {
        return Err(SettingsError::InvalidValue(format!(
            "monitor.window must be in 1..={}, got {}",
            m.capacity, m.window
        )));
    }
    if m.min_samples > m.window {
        return Err(SettingsError::InvalidValue(format!(
            "monitor.minSamples ({}) exceeds window ({})",
            m.min_samples, m.window
        )));
    }
    Ok(())
}

// ── Pure parsing functions ──────────────────────────────────────────────────

/// Parse a string as a boolean.
///
/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a string as a `u64` within an inclusive range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a ratio in `(0, 1]`.
pub fn parse_ratio(val: &str) -> Option<f64> {
    let x: f64 = val.trim().parse().ok()?;
    (x > 0.0 && x <= 1.0).then_some(x)
}

fn checked<T>(key: &str, raw: &str, parsed: Option<T>) -> Option<T> {
    if parsed.is_none() {
        warn!(key, value = %raw, "invalid env override, ignoring");
    }
    parsed
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name: &str| map.get(name).cloned()
    }

    // ── deep_merge ──────────────────────────────────────────────────

    #[test]
    fn merge_nested_override() {
        let target = serde_json::json!({"connection": {"maxErrors": 3, "url": "ws://a"}});
        let source = serde_json::json!({"connection": {"maxErrors": 5}});
        let merged = deep_merge(target, source);
        assert_eq!(merged["connection"]["maxErrors"], 5);
        assert_eq!(merged["connection"]["url"], "ws://a");
    }

    #[test]
    fn merge_null_preserves_target() {
        let target = serde_json::json!({"a": 1, "b": 2});
        let source = serde_json::json!({"a": null});
        let merged = deep_merge(target, source);
        assert_eq!(merged["a"], 1);
        assert_eq!(merged["b"], 2);
    }

    #[test]
    fn merge_array_replace() {
        let target = serde_json::json!({"items": [1, 2, 3]});
        let source = serde_json::json!({"items": [4]});
        assert_eq!(deep_merge(target, source)["items"], serde_json::json!([4]));
    }

    #[test]
    fn merge_adds_new_feature_flags() {
        let target = serde_json::json!({"features": {"incrementalUpdates": false}});
        let source = serde_json::json!({"features": {"typingIndicators": true}});
        let merged = deep_merge(target, source);
        assert_eq!(merged["features"]["incrementalUpdates"], false);
        assert_eq!(merged["features"]["typingIndicators"], true);
    }

    // ── file loading ────────────────────────────────────────────────

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = load_settings_from_path(&dir.path().join("nope.json")).unwrap();
        assert_eq!(settings.connection.max_errors, 3);
    }

    #[test]
    fn file_values_merge_over_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"connection": {"url": "wss://help.example.com/rt", "heartbeatIntervalMs": 15000},
                "features": {"incrementalUpdates": true}}"#,
        )
        .unwrap();

        let settings = load_settings_from_path(&path).unwrap();
        assert_eq!(settings.connection.url, "wss://help.example.com/rt");
        assert_eq!(settings.connection.heartbeat_interval_ms, 15_000);
        assert_eq!(settings.connection.reconnection_attempts, 5);
        assert_eq!(settings.features.get(INCREMENTAL_UPDATES), Some(true));
    }

    #[test]
    fn invalid_json_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(load_settings_from_path(&path), Err(SettingsError::Json(_))));
    }

    #[test]
    fn out_of_range_file_value_fails_validation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"monitor": {"errorThreshold": 1.5}}"#).unwrap();
        assert!(matches!(
            load_settings_from_path(&path),
            Err(SettingsError::InvalidValue(_))
        ));
    }

    // ── env overrides ───────────────────────────────────────────────

    #[test]
    fn env_overrides_apply() {
        let mut s = DeskwireSettings::default();
        apply_overrides(
            &mut s,
            env(&[
                ("DESKWIRE_URL", "ws://10.0.0.2:3000/rt"),
                ("DESKWIRE_AGENT_ID", "17"),
                ("DESKWIRE_MAX_ERRORS", "4"),
                ("DESKWIRE_RECONNECTION_DELAY", "250"),
                ("DESKWIRE_ERROR_THRESHOLD", "0.2"),
                ("DESKWIRE_INCREMENTAL_UPDATES", "on"),
            ]),
        );
        assert_eq!(s.connection.url, "ws://10.0.0.2:3000/rt");
        assert_eq!(s.connection.agent_id.as_deref(), Some("17"));
        assert_eq!(s.connection.max_errors, 4);
        assert_eq!(s.connection.reconnection_delay_ms, 250);
        assert_eq!(s.monitor.error_threshold, 0.2);
        assert_eq!(s.features.get(INCREMENTAL_UPDATES), Some(true));
    }

    #[test]
    fn invalid_env_values_are_ignored() {
        let mut s = DeskwireSettings::default();
        apply_overrides(
            &mut s,
            env(&[
                ("DESKWIRE_MAX_ERRORS", "0"),
                ("DESKWIRE_HEARTBEAT_INTERVAL", "fast"),
                ("DESKWIRE_ERROR_THRESHOLD", "2"),
                ("DESKWIRE_INCREMENTAL_UPDATES", "maybe"),
                ("DESKWIRE_URL", "   "),
            ]),
        );
        let d = DeskwireSettings::default();
        assert_eq!(s.connection.max_errors, d.connection.max_errors);
        assert_eq!(s.connection.heartbeat_interval_ms, d.connection.heartbeat_interval_ms);
        assert_eq!(s.monitor.error_threshold, d.monitor.error_threshold);
        assert_eq!(s.features.get(INCREMENTAL_UPDATES), Some(false));
        assert_eq!(s.connection.url, d.connection.url);
    }

    // ── validation ──────────────────────────────────────────────────

    #[test]
    fn defaults_validate() {
        assert!(validate(&DeskwireSettings::default()).is_ok());
    }

    #[test]
    fn base_delay_above_cap_is_rejected() {
        let mut s = DeskwireSettings::default();
        s.connection.reconnection_delay_ms = 60_000;
        assert!(validate(&s).is_err());
    }

    #[test]
    fn min_samples_above_window_is_rejected() {
        let mut s = DeskwireSettings::default();
        s.monitor.min_samples = 25;
        assert!(validate(&s).is_err());
    }

    // ── parsers ─────────────────────────────────────────────────────

    #[test]
    fn parse_bool_variants() {
        assert_eq!(parse_bool("YES"), Some(true));
        assert_eq!(parse_bool("off"), Some(false));
        assert_eq!(parse_bool("enabled"), None);
    }

    #[test]
    fn parse_ranges() {
        assert_eq!(parse_u64_range("5", 1, 10), Some(5));
        assert_eq!(parse_u64_range("11", 1, 10), None);
        assert_eq!(parse_u64_range("-1", 1, 10), None);
        assert_eq!(parse_ratio("0.1"), Some(0.1));
        assert_eq!(parse_ratio("0"), None);
    }
}
