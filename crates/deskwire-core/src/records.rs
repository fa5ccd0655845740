use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One error observed by the connection manager. Feeds circuit breaker accounting.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorRecord {
    /// Classification such as `connect_error` or `send_error`.
    pub kind: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    /// Monotonic per manager, never reused after an eviction.
    pub sequence: u64,
}

impl ErrorRecord {
    pub fn new(kind: impl Into<String>, message: impl Into<String>, sequence: u64) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            timestamp: Utc::now(),
            sequence,
        }
    }
}

/// Outcome of applying one dashboard update.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UpdateMetric {
    pub event_type: String,
    pub success: bool,
    pub duration_ms: u64,
    pub applied_incrementally: bool,
    pub timestamp: DateTime<Utc>,
}

impl UpdateMetric {
    pub fn new(
        event_type: impl Into<String>,
        success: bool,
        duration_ms: u64,
        applied_incrementally: bool,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            success,
            duration_ms,
            applied_incrementally,
            timestamp: Utc::now(),
        }
    }
}
