pub mod errors;
pub mod events;
pub mod ids;
pub mod records;
pub mod state;

pub use errors::{ChannelError, ConnectionError, FallbackError, HandlerError, UpdateError};
pub use events::{ClientEvent, DisconnectReason, EventKind, ServerEvent, ServerEventKind, UpdateEventType};
pub use ids::{AgentId, ConversationId};
pub use records::{ErrorRecord, UpdateMetric};
pub use state::ConnectionState;
