use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::AgentId;
use crate::records::ErrorRecord;
use crate::state::ConnectionState;

/// Application events pushed by the helpdesk server.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum ServerEventKind {
    NewMessage,
    ConnectedAgentsUpdate,
    SystemModeUpdate,
    TicketsReassigned,
    CustomerTypingStatus,
    ConversationAssigned,
    ConversationArchived,
    /// Any event name this client does not know about. Passed through untouched.
    Other(String),
}

impl ServerEventKind {
    pub fn from_wire(name: &str) -> Self {
        match name {
            "new-message" => Self::NewMessage,
            "connected-agents-update" => Self::ConnectedAgentsUpdate,
            "system-mode-update" => Self::SystemModeUpdate,
            "tickets-reassigned" => Self::TicketsReassigned,
            "customer-typing-status" => Self::CustomerTypingStatus,
            "conversation-assigned" => Self::ConversationAssigned,
            "conversation-archived" => Self::ConversationArchived,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_wire(&self) -> &str {
        match self {
            Self::NewMessage => "new-message",
            Self::ConnectedAgentsUpdate => "connected-agents-update",
            Self::SystemModeUpdate => "system-mode-update",
            Self::TicketsReassigned => "tickets-reassigned",
            Self::CustomerTypingStatus => "customer-typing-status",
            Self::ConversationAssigned => "conversation-assigned",
            Self::ConversationArchived => "conversation-archived",
            Self::Other(name) => name,
        }
    }
}

impl From<String> for ServerEventKind {
    fn from(s: String) -> Self {
        Self::from_wire(&s)
    }
}

impl From<ServerEventKind> for String {
    fn from(kind: ServerEventKind) -> Self {
        kind.as_wire().to_string()
    }
}

/// A named event with its opaque JSON payload, as delivered by the transport.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ServerEvent {
    pub kind: ServerEventKind,
    pub payload: Value,
}

impl ServerEvent {
    pub fn new(kind: ServerEventKind, payload: Value) -> Self {
        Self { kind, payload }
    }
}

/// Why a connection ended.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "by", content = "detail", rename_all = "snake_case")]
pub enum DisconnectReason {
    /// `disconnect()` was called.
    Client,
    /// The transport closed underneath us.
    Transport(String),
    /// The circuit breaker tripped and tore the connection down.
    CircuitOpen,
}

/// Subscription key for the manager's event registry.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    Connect,
    Disconnect,
    Reconnect,
    CircuitBreakerOpen,
    StateChanged,
    Error,
    Server(ServerEventKind),
}

impl EventKind {
    pub fn name(&self) -> &str {
        match self {
            Self::Connect => "connect",
            Self::Disconnect => "disconnect",
            Self::Reconnect => "reconnect",
            Self::CircuitBreakerOpen => "circuit-breaker-open",
            Self::StateChanged => "state-changed",
            Self::Error => "error",
            Self::Server(kind) => kind.as_wire(),
        }
    }
}

/// Events published to the host application.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    Connected {
        agent_id: AgentId,
    },
    Disconnected {
        reason: DisconnectReason,
    },
    Reconnected {
        /// Number of the attempt that succeeded, starting at 1.
        attempt: u32,
    },
    CircuitBreakerOpen {
        error_count: u32,
        last_error: Option<ErrorRecord>,
    },
    StateChanged {
        from: ConnectionState,
        to: ConnectionState,
    },
    Error(ErrorRecord),
    Server(ServerEvent),
}

impl ClientEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Connected { .. } => EventKind::Connect,
            Self::Disconnected { .. } => EventKind::Disconnect,
            Self::Reconnected { .. } => EventKind::Reconnect,
            Self::CircuitBreakerOpen { .. } => EventKind::CircuitBreakerOpen,
            Self::StateChanged { .. } => EventKind::StateChanged,
            Self::Error(_) => EventKind::Error,
            Self::Server(event) => EventKind::Server(event.kind.clone()),
        }
    }
}

/// Dashboard change events the update dispatcher knows how to apply.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum UpdateEventType {
    NewMessage,
    AssignmentChanged,
    ConversationArchived,
    BulkReassignment,
    Unrecognized(String),
}

impl UpdateEventType {
    pub fn parse(name: &str) -> Self {
        match name {
            "new_message" => Self::NewMessage,
            "assignment_changed" => Self::AssignmentChanged,
            "conversation_archived" => Self::ConversationArchived,
            "bulk_reassignment" => Self::BulkReassignment,
            other => Self::Unrecognized(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::NewMessage => "new_message",
            Self::AssignmentChanged => "assignment_changed",
            Self::ConversationArchived => "conversation_archived",
            Self::BulkReassignment => "bulk_reassignment",
            Self::Unrecognized(name) => name,
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, Self::Unrecognized(_))
    }

    /// Dashboard update carried by a server event, if any.
    pub fn from_server(kind: &ServerEventKind) -> Option<Self> {
        match kind {
            ServerEventKind::NewMessage => Some(Self::NewMessage),
            ServerEventKind::ConversationAssigned => Some(Self::AssignmentChanged),
            ServerEventKind::ConversationArchived => Some(Self::ConversationArchived),
            ServerEventKind::TicketsReassigned => Some(Self::BulkReassignment),
            _ => None,
        }
    }

    pub const KNOWN: [UpdateEventType; 4] = [
        Self::NewMessage,
        Self::AssignmentChanged,
        Self::ConversationArchived,
        Self::BulkReassignment,
    ];
}

impl std::fmt::Display for UpdateEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for UpdateEventType {
    fn from(s: String) -> Self {
        Self::parse(&s)
    }
}

impl From<UpdateEventType> for String {
    fn from(t: UpdateEventType) -> Self {
        t.as_str().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_kinds_map_from_wire_names() {
        assert_eq!(ServerEventKind::from_wire("new-message"), ServerEventKind::NewMessage);
        assert_eq!(
            ServerEventKind::from_wire("tickets-reassigned"),
            ServerEventKind::TicketsReassigned
        );
        assert_eq!(
            ServerEventKind::from_wire("ticket-merged"),
            ServerEventKind::Other("ticket-merged".into())
        );
        assert_eq!(ServerEventKind::Other("x-y".into()).as_wire(), "x-y");
    }

    #[test]
    fn server_kind_serializes_as_wire_name() {
        let json = serde_json::to_string(&ServerEventKind::CustomerTypingStatus).unwrap();
        assert_eq!(json, "\"customer-typing-status\"");
        let parsed: ServerEventKind = serde_json::from_str("\"system-mode-update\"").unwrap();
        assert_eq!(parsed, ServerEventKind::SystemModeUpdate);
    }

    #[test]
    fn client_event_kinds() {
        let evt = ClientEvent::Connected { agent_id: AgentId::from_raw("a1") };
        assert_eq!(evt.kind(), EventKind::Connect);

        let evt = ClientEvent::Server(ServerEvent::new(ServerEventKind::NewMessage, Value::Null));
        assert_eq!(evt.kind(), EventKind::Server(ServerEventKind::NewMessage));
        assert_eq!(evt.kind().name(), "new-message");
        assert_eq!(EventKind::CircuitBreakerOpen.name(), "circuit-breaker-open");
    }

    #[test]
    fn client_event_json_shape() {
        let evt = ClientEvent::StateChanged {
            from: ConnectionState::Connecting,
            to: ConnectionState::Connected,
        };
        let json = serde_json::to_value(&evt).unwrap();
        assert_eq!(json["type"], "state_changed");
        assert_eq!(json["to"], "connected");

        let evt = ClientEvent::Disconnected {
            reason: DisconnectReason::Transport("reset".into()),
        };
        let json = serde_json::to_value(&evt).unwrap();
        assert_eq!(json["reason"]["by"], "transport");
        assert_eq!(json["reason"]["detail"], "reset");
    }

    #[test]
    fn update_types_parse_and_display() {
        for t in UpdateEventType::KNOWN {
            assert!(t.is_known());
            assert_eq!(UpdateEventType::parse(t.as_str()), t);
        }
        let other = UpdateEventType::parse("ticket_merged");
        assert!(!other.is_known());
        assert_eq!(other.to_string(), "ticket_merged");
    }

    #[test]
    fn update_types_from_server_events() {
        assert_eq!(
            UpdateEventType::from_server(&ServerEventKind::NewMessage),
            Some(UpdateEventType::NewMessage)
        );
        assert_eq!(
            UpdateEventType::from_server(&ServerEventKind::TicketsReassigned),
            Some(UpdateEventType::BulkReassignment)
        );
        assert_eq!(UpdateEventType::from_server(&ServerEventKind::SystemModeUpdate), None);
    }
}
