//! Routes dashboard updates to the incremental path or the full reload.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tracing::{debug, error, warn};

use deskwire_core::{
    ClientEvent, EventKind, FallbackError, ServerEventKind, UpdateError, UpdateEventType,
};
use deskwire_settings::INCREMENTAL_UPDATES;

use crate::flags::FeatureFlagStore;
use crate::manager::ConnectionManager;
use crate::monitor::{TrackDetails, UpdateMonitor};
use crate::registry::{panic_message, SubscriptionId};
use crate::reload::DataLoader;
use crate::view::{renderer_strategies, IncrementalStrategy, ViewRenderer};

/// Server events that carry dashboard updates.
const BRIDGED_EVENTS: [ServerEventKind; 4] = [
    ServerEventKind::NewMessage,
    ServerEventKind::ConversationAssigned,
    ServerEventKind::ConversationArchived,
    ServerEventKind::TicketsReassigned,
];

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DispatchOutcome {
    Incremental,
    FullReload { cause: ReloadCause },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReloadCause {
    IncrementalDisabled,
    IncrementalFailed(UpdateError),
}

pub struct UpdateDispatcher {
    flags: Arc<FeatureFlagStore>,
    monitor: Arc<UpdateMonitor>,
    loader: Arc<dyn DataLoader>,
    strategies: HashMap<UpdateEventType, Arc<dyn IncrementalStrategy>>,
}

impl UpdateDispatcher {
    pub fn new(
        flags: Arc<FeatureFlagStore>,
        monitor: Arc<UpdateMonitor>,
        loader: Arc<dyn DataLoader>,
    ) -> Self {
        Self {
            flags,
            monitor,
            loader,
            strategies: HashMap::new(),
        }
    }

    /// Register `strategy`, replacing any previous one for its type.
    pub fn with_strategy(mut self, strategy: Arc<dyn IncrementalStrategy>) -> Self {
        self.strategies.insert(strategy.event_type(), strategy);
        self
    }

    pub fn with_renderer(self, renderer: Arc<dyn ViewRenderer>) -> Self {
        renderer_strategies(renderer)
            .into_iter()
            .fold(self, Self::with_strategy)
    }

    pub fn monitor(&self) -> &Arc<UpdateMonitor> {
        &self.monitor
    }

    /// Apply one update.
    ///
    /// With incremental updates enabled the matching strategy runs first; any
    /// failure falls back to a full reload. Either way exactly one metric is
    /// tracked. Only a failed reload is returned as an error.
    pub fn handle(
        &self,
        event_type: &UpdateEventType,
        data: &Value,
    ) -> Result<DispatchOutcome, FallbackError> {
        let started = Instant::now();

        let cause = if self.flags.is_enabled(INCREMENTAL_UPDATES) {
            match self.apply_incremental(event_type, data) {
                Ok(()) => {
                    self.monitor.track(
                        event_type.as_str(),
                        true,
                        elapsed_ms(started),
                        TrackDetails { incremental: true },
                    );
                    debug!(event_type = %event_type, "applied incrementally");
                    return Ok(DispatchOutcome::Incremental);
                }
                Err(e) => {
                    warn!(
                        event_type = %event_type,
                        kind = e.error_kind(),
                        error = %e,
                        "incremental update failed, falling back to full reload"
                    );
                    ReloadCause::IncrementalFailed(e)
                }
            }
        } else {
            ReloadCause::IncrementalDisabled
        };

        let after_error = matches!(cause, ReloadCause::IncrementalFailed(_));
        match self.loader.refresh() {
            Ok(()) => {
                // A reload that followed a failed incremental attempt counts as a failure.
                self.monitor.track(
                    event_type.as_str(),
                    !after_error,
                    elapsed_ms(started),
                    TrackDetails { incremental: false },
                );
                Ok(DispatchOutcome::FullReload { cause })
            }
            Err(e) => {
                error!(event_type = %event_type, error = %e, "full reload failed");
                self.monitor.track(
                    event_type.as_str(),
                    false,
                    elapsed_ms(started),
                    TrackDetails { incremental: false },
                );
                Err(e)
            }
        }
    }

    /// [`handle`](Self::handle) by wire name. Unknown names take the reload path.
    pub fn handle_named(&self, event_type: &str, data: &Value) -> Result<DispatchOutcome, FallbackError> {
        self.handle(&UpdateEventType::parse(event_type), data)
    }

    fn apply_incremental(&self, event_type: &UpdateEventType, data: &Value) -> Result<(), UpdateError> {
        if !event_type.is_known() {
            return Err(UpdateError::UnknownEventType(event_type.to_string()));
        }
        let strategy = self
            .strategies
            .get(event_type)
            .ok_or_else(|| UpdateError::NotImplemented(event_type.clone()))?;
        // A panicking strategy is one more incremental failure.
        panic::catch_unwind(AssertUnwindSafe(|| strategy.apply(data))).unwrap_or_else(|payload| {
            Err(UpdateError::Render(format!(
                "strategy panicked: {}",
                panic_message(payload.as_ref())
            )))
        })
    }

    /// Subscribe to the manager's update-bearing server events.
    pub fn attach(self: &Arc<Self>, manager: &ConnectionManager) -> Vec<(EventKind, SubscriptionId)> {
        BRIDGED_EVENTS
            .into_iter()
            .filter_map(|server_kind| {
                let update_type = UpdateEventType::from_server(&server_kind)?;
                let kind = EventKind::Server(server_kind);
                let dispatcher = Arc::clone(self);
                let id = manager.on(kind.clone(), move |event| {
                    if let ClientEvent::Server(server_event) = event {
                        dispatcher.handle(&update_type, &server_event.payload)?;
                    }
                    Ok(())
                });
                Some((kind, id))
            })
            .collect()
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::MonitorConfig;
    use crate::reload::ReloadSignal;
    use crate::view::{ConversationBoard, ConversationView};
    use deskwire_core::ConversationId;
    use serde_json::json;

    struct Harness {
        flags: Arc<FeatureFlagStore>,
        monitor: Arc<UpdateMonitor>,
        signal: Arc<ReloadSignal>,
        board: Arc<ConversationBoard>,
        dispatcher: UpdateDispatcher,
        _reload_rx: tokio::sync::watch::Receiver<u64>,
    }

    fn harness(incremental: bool) -> Harness {
        let flags = Arc::new(FeatureFlagStore::new());
        flags.set(INCREMENTAL_UPDATES, incremental);
        let monitor = Arc::new(UpdateMonitor::new(MonitorConfig::default(), flags.clone()));
        let signal = Arc::new(ReloadSignal::new());
        let reload_rx = signal.subscribe();
        let board = Arc::new(ConversationBoard::new());
        board.load([ConversationView::new(ConversationId::from_raw("1"))]);
        let dispatcher = UpdateDispatcher::new(flags.clone(), monitor.clone(), signal.clone())
            .with_renderer(board.clone());
        Harness {
            flags,
            monitor,
            signal,
            board,
            dispatcher,
            _reload_rx: reload_rx,
        }
    }

    #[test]
    fn incremental_success_skips_reload() {
        let h = harness(true);
        let outcome = h
            .dispatcher
            .handle(
                &UpdateEventType::AssignmentChanged,
                &json!({"conversationId": 1, "assignedAgentId": "a"}),
            )
            .unwrap();
        assert_eq!(outcome, DispatchOutcome::Incremental);
        assert_eq!(h.signal.generation(), 0);
        assert!(h.board.get(&ConversationId::from_raw("1")).unwrap().assigned_agent.is_some());

        let metrics = h.monitor.metrics();
        assert_eq!(metrics.len(), 1);
        assert!(metrics[0].success && metrics[0].applied_incrementally);
    }

    #[test]
    fn disabled_flag_always_reloads() {
        let h = harness(false);
        let outcome = h
            .dispatcher
            .handle(&UpdateEventType::NewMessage, &json!({"conversationId": 1, "content": "x"}))
            .unwrap();
        assert_eq!(
            outcome,
            DispatchOutcome::FullReload { cause: ReloadCause::IncrementalDisabled }
        );
        assert_eq!(h.signal.generation(), 1);
        let metrics = h.monitor.metrics();
        assert!(metrics[0].success && !metrics[0].applied_incrementally);
        // The board was not touched incrementally.
        assert_eq!(h.board.get(&ConversationId::from_raw("1")).unwrap().message_count, 0);
    }

    #[test]
    fn failed_incremental_reloads_and_counts_failure() {
        let h = harness(true);
        let outcome = h
            .dispatcher
            .handle(&UpdateEventType::ConversationArchived, &json!({"conversationId": 99}))
            .unwrap();
        assert!(matches!(
            outcome,
            DispatchOutcome::FullReload { cause: ReloadCause::IncrementalFailed(UpdateError::Render(_)) }
        ));
        assert_eq!(h.signal.generation(), 1);
        assert!(!h.monitor.metrics()[0].success);
    }

    #[test]
    fn unknown_event_type_reloads() {
        let h = harness(true);
        let outcome = h.dispatcher.handle_named("ticket_merged", &json!({})).unwrap();
        assert_eq!(
            outcome,
            DispatchOutcome::FullReload {
                cause: ReloadCause::IncrementalFailed(UpdateError::UnknownEventType(
                    "ticket_merged".into()
                ))
            }
        );
    }

    #[test]
    fn missing_strategy_reloads() {
        let flags = Arc::new(FeatureFlagStore::new());
        flags.enable(INCREMENTAL_UPDATES);
        let monitor = Arc::new(UpdateMonitor::new(MonitorConfig::default(), flags.clone()));
        let signal = Arc::new(ReloadSignal::new());
        let _rx = signal.subscribe();
        let dispatcher = UpdateDispatcher::new(flags, monitor, signal);

        let outcome = dispatcher
            .handle(&UpdateEventType::BulkReassignment, &json!({}))
            .unwrap();
        assert_eq!(
            outcome,
            DispatchOutcome::FullReload {
                cause: ReloadCause::IncrementalFailed(UpdateError::NotImplemented(
                    UpdateEventType::BulkReassignment
                ))
            }
        );
    }

    struct ExplodingStrategy;

    impl IncrementalStrategy for ExplodingStrategy {
        fn event_type(&self) -> UpdateEventType {
            UpdateEventType::NewMessage
        }

        fn apply(&self, _data: &Value) -> Result<(), UpdateError> {
            panic!("renderer exploded")
        }
    }

    #[test]
    fn panicking_strategy_falls_back_to_reload() {
        let h = harness(true);
        let dispatcher = UpdateDispatcher::new(h.flags.clone(), h.monitor.clone(), h.signal.clone())
            .with_strategy(Arc::new(ExplodingStrategy));

        let outcome = dispatcher
            .handle(&UpdateEventType::NewMessage, &json!({"conversationId": 1}))
            .unwrap();
        match outcome {
            DispatchOutcome::FullReload {
                cause: ReloadCause::IncrementalFailed(UpdateError::Render(message)),
            } => assert!(message.contains("renderer exploded")),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(h.signal.generation(), 1);
        let metrics = h.monitor.metrics();
        assert_eq!(metrics.len(), 1);
        assert!(!metrics[0].success);
    }

    #[test]
    fn failed_reload_is_returned() {
        let flags = Arc::new(FeatureFlagStore::new());
        let monitor = Arc::new(UpdateMonitor::new(MonitorConfig::default(), flags.clone()));
        let dispatcher =
            UpdateDispatcher::new(flags, monitor.clone(), Arc::new(ReloadSignal::new()));

        let err = dispatcher
            .handle(&UpdateEventType::NewMessage, &json!({}))
            .unwrap_err();
        assert!(err.to_string().starts_with("full reload failed"));
        assert!(!monitor.metrics()[0].success);
    }

    #[test]
    fn repeated_failures_degrade_then_reload_cleanly() {
        let h = harness(true);
        for _ in 0..20 {
            let outcome = h
                .dispatcher
                .handle(&UpdateEventType::AssignmentChanged, &json!({"conversationId": 404}))
                .unwrap();
            assert!(matches!(outcome, DispatchOutcome::FullReload { .. }));
        }
        assert!(!h.flags.is_enabled(INCREMENTAL_UPDATES));
        assert_eq!(h.monitor.degradations(), 1);
        assert_eq!(h.signal.generation(), 20);
    }
}
