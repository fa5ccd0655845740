//! Incremental view hooks and the in-memory conversation board.

use std::sync::Arc;

use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use deskwire_core::{AgentId, ConversationId, UpdateError, UpdateEventType};

// ─────────────────────────────────────────────────────────────────────────────
// Payloads
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SenderType {
    #[default]
    Customer,
    Agent,
    System,
    Ai,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomingMessage {
    pub conversation_id: ConversationId,
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(default)]
    pub sender_type: SenderType,
    pub content: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignmentChange {
    pub conversation_id: ConversationId,
    /// `None` unassigns.
    #[serde(default)]
    pub assigned_agent_id: Option<AgentId>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveChange {
    pub conversation_id: ConversationId,
    #[serde(default = "archived_default")]
    pub archived: bool,
}

fn archived_default() -> bool {
    true
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkReassignment {
    #[serde(alias = "ticketIds")]
    pub conversation_ids: Vec<ConversationId>,
    #[serde(default)]
    pub from_agent_id: Option<AgentId>,
    #[serde(default)]
    pub to_agent_id: Option<AgentId>,
}

fn parse_payload<T: DeserializeOwned>(
    event_type: UpdateEventType,
    data: &Value,
) -> Result<T, UpdateError> {
    T::deserialize(data).map_err(|e| UpdateError::InvalidPayload {
        event_type,
        reason: e.to_string(),
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Hooks
// ─────────────────────────────────────────────────────────────────────────────

/// Targeted view mutations. Unimplemented hooks send the dispatcher to the
/// full-reload path.
pub trait ViewRenderer: Send + Sync {
    fn apply_new_message(&self, _message: &IncomingMessage) -> Result<(), UpdateError> {
        Err(UpdateError::NotImplemented(UpdateEventType::NewMessage))
    }

    fn apply_assignment(&self, _change: &AssignmentChange) -> Result<(), UpdateError> {
        Err(UpdateError::NotImplemented(UpdateEventType::AssignmentChanged))
    }

    fn apply_archive_status(&self, _change: &ArchiveChange) -> Result<(), UpdateError> {
        Err(UpdateError::NotImplemented(UpdateEventType::ConversationArchived))
    }

    fn apply_bulk_assignment(&self, _change: &BulkReassignment) -> Result<(), UpdateError> {
        Err(UpdateError::NotImplemented(UpdateEventType::BulkReassignment))
    }
}

/// Applies one kind of update in place.
pub trait IncrementalStrategy: Send + Sync {
    fn event_type(&self) -> UpdateEventType;
    fn apply(&self, data: &Value) -> Result<(), UpdateError>;
}

pub struct NewMessageStrategy(pub Arc<dyn ViewRenderer>);
pub struct AssignmentStrategy(pub Arc<dyn ViewRenderer>);
pub struct ArchiveStrategy(pub Arc<dyn ViewRenderer>);
pub struct BulkReassignmentStrategy(pub Arc<dyn ViewRenderer>);

impl IncrementalStrategy for NewMessageStrategy {
    fn event_type(&self) -> UpdateEventType {
        UpdateEventType::NewMessage
    }

    fn apply(&self, data: &Value) -> Result<(), UpdateError> {
        let message: IncomingMessage = parse_payload(self.event_type(), data)?;
        self.0.apply_new_message(&message)
    }
}

impl IncrementalStrategy for AssignmentStrategy {
    fn event_type(&self) -> UpdateEventType {
        UpdateEventType::AssignmentChanged
    }

    fn apply(&self, data: &Value) -> Result<(), UpdateError> {
        let change: AssignmentChange = parse_payload(self.event_type(), data)?;
        self.0.apply_assignment(&change)
    }
}

impl IncrementalStrategy for ArchiveStrategy {
    fn event_type(&self) -> UpdateEventType {
        UpdateEventType::ConversationArchived
    }

    fn apply(&self, data: &Value) -> Result<(), UpdateError> {
        let change: ArchiveChange = parse_payload(self.event_type(), data)?;
        self.0.apply_archive_status(&change)
    }
}

impl IncrementalStrategy for BulkReassignmentStrategy {
    fn event_type(&self) -> UpdateEventType {
        UpdateEventType::BulkReassignment
    }

    fn apply(&self, data: &Value) -> Result<(), UpdateError> {
        let change: BulkReassignment = parse_payload(self.event_type(), data)?;
        self.0.apply_bulk_assignment(&change)
    }
}

/// One strategy per known update type, all backed by `renderer`.
pub fn renderer_strategies(renderer: Arc<dyn ViewRenderer>) -> Vec<Arc<dyn IncrementalStrategy>> {
    vec![
        Arc::new(NewMessageStrategy(Arc::clone(&renderer))),
        Arc::new(AssignmentStrategy(Arc::clone(&renderer))),
        Arc::new(ArchiveStrategy(Arc::clone(&renderer))),
        Arc::new(BulkReassignmentStrategy(renderer)),
    ]
}

// ─────────────────────────────────────────────────────────────────────────────
// Board
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationView {
    pub id: ConversationId,
    #[serde(default)]
    pub assigned_agent: Option<AgentId>,
    #[serde(default)]
    pub archived: bool,
    #[serde(default)]
    pub last_message: Option<String>,
    #[serde(default)]
    pub unread: u32,
    #[serde(default)]
    pub message_count: u64,
}

impl ConversationView {
    pub fn new(id: ConversationId) -> Self {
        Self {
            id,
            assigned_agent: None,
            archived: false,
            last_message: None,
            unread: 0,
            message_count: 0,
        }
    }
}

/// Dashboard state keyed by conversation.
///
/// A change that references a conversation the board has never loaded, or
/// contradicts what the board holds, is rejected so the dispatcher reloads.
#[derive(Default)]
pub struct ConversationBoard {
    conversations: DashMap<ConversationId, ConversationView>,
}

impl ConversationBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace everything with a freshly fetched list.
    pub fn load(&self, conversations: impl IntoIterator<Item = ConversationView>) {
        self.conversations.clear();
        for view in conversations {
            self.conversations.insert(view.id.clone(), view);
        }
        debug!(count = self.conversations.len(), "board loaded");
    }

    pub fn get(&self, id: &ConversationId) -> Option<ConversationView> {
        self.conversations.get(id).map(|v| v.clone())
    }

    pub fn len(&self) -> usize {
        self.conversations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conversations.is_empty()
    }

    pub fn assigned_to(&self, agent: &AgentId) -> Vec<ConversationId> {
        let mut ids: Vec<_> = self
            .conversations
            .iter()
            .filter(|entry| entry.assigned_agent.as_ref() == Some(agent) && !entry.archived)
            .map(|entry| entry.key().clone())
            .collect();
        ids.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        ids
    }

    /// Sorted by id.
    pub fn snapshot(&self) -> Vec<ConversationView> {
        let mut views: Vec<_> = self.conversations.iter().map(|e| e.value().clone()).collect();
        views.sort_by(|a, b| a.id.as_str().cmp(b.id.as_str()));
        views
    }

    fn unknown(id: &ConversationId) -> UpdateError {
        UpdateError::Render(format!("conversation {id} not on board"))
    }
}

impl ViewRenderer for ConversationBoard {
    fn apply_new_message(&self, message: &IncomingMessage) -> Result<(), UpdateError> {
        let mut view = self
            .conversations
            .get_mut(&message.conversation_id)
            .ok_or_else(|| Self::unknown(&message.conversation_id))?;
        view.last_message = Some(message.content.clone());
        view.message_count += 1;
        if message.sender_type == SenderType::Customer {
            view.unread += 1;
        }
        Ok(())
    }

    fn apply_assignment(&self, change: &AssignmentChange) -> Result<(), UpdateError> {
        let mut view = self
            .conversations
            .get_mut(&change.conversation_id)
            .ok_or_else(|| Self::unknown(&change.conversation_id))?;
        view.assigned_agent = change.assigned_agent_id.clone();
        Ok(())
    }

    fn apply_archive_status(&self, change: &ArchiveChange) -> Result<(), UpdateError> {
        let mut view = self
            .conversations
            .get_mut(&change.conversation_id)
            .ok_or_else(|| Self::unknown(&change.conversation_id))?;
        view.archived = change.archived;
        Ok(())
    }

    fn apply_bulk_assignment(&self, change: &BulkReassignment) -> Result<(), UpdateError> {
        // Validate everything first so a rejected batch leaves the board untouched.
        for id in &change.conversation_ids {
            let view = self.conversations.get(id).ok_or_else(|| Self::unknown(id))?;
            if let Some(from) = &change.from_agent_id {
                if view.assigned_agent.as_ref() != Some(from) {
                    return Err(UpdateError::Render(format!(
                        "conversation {id} is not assigned to {from}"
                    )));
                }
            }
        }
        for id in &change.conversation_ids {
            if let Some(mut view) = self.conversations.get_mut(id) {
                view.assigned_agent = change.to_agent_id.clone();
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn conv(id: &str) -> ConversationId {
        ConversationId::from_raw(id)
    }

    fn board_with(ids: &[&str]) -> Arc<ConversationBoard> {
        let board = Arc::new(ConversationBoard::new());
        board.load(ids.iter().map(|id| ConversationView::new(conv(id))));
        board
    }

    struct Inert;
    impl ViewRenderer for Inert {}

    #[test]
    fn default_hooks_are_not_implemented() {
        let strategy = AssignmentStrategy(Arc::new(Inert));
        let err = strategy
            .apply(&json!({"conversationId": 1, "assignedAgentId": 2}))
            .unwrap_err();
        assert_eq!(
            err,
            UpdateError::NotImplemented(UpdateEventType::AssignmentChanged)
        );
    }

    #[test]
    fn invalid_payload_is_reported() {
        let strategy = NewMessageStrategy(board_with(&["1"]));
        let err = strategy.apply(&json!({"content": "hi"})).unwrap_err();
        assert!(matches!(
            err,
            UpdateError::InvalidPayload { event_type: UpdateEventType::NewMessage, .. }
        ));
    }

    #[test]
    fn new_message_updates_counts() {
        let board = board_with(&["1"]);
        let strategy = NewMessageStrategy(board.clone());
        strategy
            .apply(&json!({"conversationId": 1, "content": "hello"}))
            .unwrap();
        strategy
            .apply(&json!({"conversationId": 1, "content": "on it", "senderType": "agent"}))
            .unwrap();

        let view = board.get(&conv("1")).unwrap();
        assert_eq!(view.last_message.as_deref(), Some("on it"));
        assert_eq!(view.message_count, 2);
        assert_eq!(view.unread, 1);
    }

    #[test]
    fn message_for_unknown_conversation_is_rejected() {
        let board = board_with(&["1"]);
        let err = board
            .apply_new_message(&IncomingMessage {
                conversation_id: conv("2"),
                message_id: None,
                sender_type: SenderType::Customer,
                content: "x".into(),
            })
            .unwrap_err();
        assert!(matches!(err, UpdateError::Render(_)));
    }

    #[test]
    fn assignment_and_archive() {
        let board = board_with(&["1", "2"]);
        AssignmentStrategy(board.clone())
            .apply(&json!({"conversationId": "1", "assignedAgentId": "a"}))
            .unwrap();
        ArchiveStrategy(board.clone())
            .apply(&json!({"conversationId": "2"}))
            .unwrap();

        assert_eq!(board.assigned_to(&AgentId::from_raw("a")), vec![conv("1")]);
        assert!(board.get(&conv("2")).unwrap().archived);
    }

    #[test]
    fn bulk_reassignment_is_all_or_nothing() {
        let board = board_with(&["1", "2"]);
        let strategy = BulkReassignmentStrategy(board.clone());
        let err = strategy
            .apply(&json!({"ticketIds": [1, 3], "toAgentId": "b"}))
            .unwrap_err();
        assert!(matches!(err, UpdateError::Render(_)));
        assert!(board.get(&conv("1")).unwrap().assigned_agent.is_none());

        strategy
            .apply(&json!({"conversationIds": [1, 2], "toAgentId": "b"}))
            .unwrap();
        assert_eq!(board.assigned_to(&AgentId::from_raw("b")).len(), 2);
    }

    #[test]
    fn bulk_reassignment_rejects_stale_source() {
        let board = board_with(&["1"]);
        let err = board
            .apply_bulk_assignment(&BulkReassignment {
                conversation_ids: vec![conv("1")],
                from_agent_id: Some(AgentId::from_raw("a")),
                to_agent_id: Some(AgentId::from_raw("b")),
            })
            .unwrap_err();
        assert!(err.to_string().contains("not assigned"));
    }

    #[test]
    fn renderer_strategies_cover_known_types() {
        let strategies = renderer_strategies(Arc::new(Inert));
        let types: Vec<_> = strategies.iter().map(|s| s.event_type()).collect();
        assert_eq!(types, UpdateEventType::KNOWN.to_vec());
    }

    #[test]
    fn snapshot_is_sorted() {
        let board = board_with(&["b", "a", "c"]);
        let ids: Vec<_> = board.snapshot().into_iter().map(|v| v.id.to_string()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert_eq!(board.len(), 3);
        assert!(!board.is_empty());
    }
}
