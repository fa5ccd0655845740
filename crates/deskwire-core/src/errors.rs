use crate::events::UpdateEventType;

/// Failures reported by a transport channel.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    #[error("connect failed: {0}")]
    ConnectFailed(String),
    #[error("channel is not open")]
    NotOpen,
    #[error("send failed: {0}")]
    SendFailed(String),
    #[error("frame encoding failed: {0}")]
    Encode(String),
}

/// Errors returned by the connection manager's public operations.
#[derive(Clone, Debug, thiserror::Error)]
pub enum ConnectionError {
    /// The error budget is exhausted. Terminal until an explicit reset.
    #[error("circuit breaker open after {errors} errors")]
    CircuitOpen { errors: u32 },
    #[error("transport error: {0}")]
    Transport(#[from] ChannelError),
}

impl ConnectionError {
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }

    /// Short classification string for logging/metrics.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::CircuitOpen { .. } => "circuit_open",
            Self::Transport(_) => "transport",
        }
    }
}

/// Failure of the incremental update path. Always recoverable by a full reload.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum UpdateError {
    #[error("incremental update not implemented for {0}")]
    NotImplemented(UpdateEventType),
    #[error("unknown event type: {0}")]
    UnknownEventType(String),
    #[error("invalid {event_type} payload: {reason}")]
    InvalidPayload { event_type: UpdateEventType, reason: String },
    #[error("render failed: {0}")]
    Render(String),
}

impl UpdateError {
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::NotImplemented(_) => "not_implemented",
            Self::UnknownEventType(_) => "unknown_event_type",
            Self::InvalidPayload { .. } => "invalid_payload",
            Self::Render(_) => "render",
        }
    }
}

/// The full-reload fallback failed. No further degradation path exists.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("full reload failed: {0}")]
pub struct FallbackError(pub String);

/// Error returned by an event subscriber. Isolated per handler.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl From<&str> for HandlerError {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for HandlerError {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<FallbackError> for HandlerError {
    fn from(e: FallbackError) -> Self {
        Self(e.to_string())
    }
}
