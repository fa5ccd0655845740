//! # deskwire-client
//!
//! Real-time client for the helpdesk dashboard.
//!
//! - [`ConnectionManager`]: one managed event connection with heartbeat,
//!   exponential-backoff reconnection, and a circuit breaker.
//! - [`UpdateDispatcher`]: applies dashboard updates incrementally when the
//!   `incrementalUpdates` flag is on, otherwise (or on failure) requests a
//!   full reload.
//! - [`UpdateMonitor`]: tracks update outcomes and switches incremental
//!   updates off when too many fail.

#![deny(unsafe_code)]

pub mod channel;
pub mod circuit;
pub mod dispatcher;
pub mod flags;
pub mod heartbeat;
pub mod manager;
pub mod mock;
pub mod monitor;
pub mod reconnect;
pub mod registry;
pub mod reload;
pub mod view;

pub use channel::{ConnectionChannel, Frame, TransportEvent, WsChannel};
pub use circuit::{BreakerVerdict, CircuitBreaker};
pub use dispatcher::{DispatchOutcome, ReloadCause, UpdateDispatcher};
pub use flags::{FeatureFlagStore, FlagChange};
pub use heartbeat::{HeartbeatController, HEARTBEAT_EVENT};
pub use manager::{ConnectionConfig, ConnectionManager, ConnectionStatus, AGENT_JOIN_EVENT};
pub use monitor::{Degradation, MonitorConfig, MonitorSummary, TrackDetails, UpdateMonitor};
pub use reconnect::ReconnectionPolicy;
pub use registry::{EventHandler, HandlerFailure, SubscriptionId, SubscriptionRegistry};
pub use reload::{DataLoader, ReloadSignal};
pub use view::{
    ArchiveChange, AssignmentChange, BulkReassignment, ConversationBoard, ConversationView,
    IncomingMessage, IncrementalStrategy, SenderType, ViewRenderer,
};
