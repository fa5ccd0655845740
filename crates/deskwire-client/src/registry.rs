//! Subscriber registry keyed by [`EventKind`].
//!
//! Handlers run synchronously in registration order. A handler that returns
//! an error or panics is reported back to the caller and never prevents the
//! remaining handlers from running.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use deskwire_core::{ClientEvent, EventKind, HandlerError};

pub type EventHandler = Arc<dyn Fn(&ClientEvent) -> Result<(), HandlerError> + Send + Sync>;

/// Handle returned by [`SubscriptionRegistry::subscribe`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sub_{}", self.0)
    }
}

/// A handler that failed during dispatch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HandlerFailure {
    pub subscription: SubscriptionId,
    pub event: String,
    pub message: String,
    pub panicked: bool,
}

#[derive(Default)]
pub struct SubscriptionRegistry {
    handlers: Mutex<HashMap<EventKind, Vec<(SubscriptionId, EventHandler)>>>,
    next_id: AtomicU64,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, kind: EventKind, handler: EventHandler) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers.lock().entry(kind).or_default().push((id, handler));
        id
    }

    /// Returns `false` if `id` was not subscribed to `kind`.
    pub fn unsubscribe(&self, kind: &EventKind, id: SubscriptionId) -> bool {
        let mut handlers = self.handlers.lock();
        let Some(list) = handlers.get_mut(kind) else {
            return false;
        };
        let before = list.len();
        list.retain(|(sid, _)| *sid != id);
        let removed = list.len() != before;
        if list.is_empty() {
            handlers.remove(kind);
        }
        removed
    }

    pub fn subscriber_count(&self, kind: &EventKind) -> usize {
        self.handlers.lock().get(kind).map_or(0, Vec::len)
    }

    /// Run every handler for the event's kind.
    ///
    /// The handler list is snapshotted first, so handlers may subscribe or
    /// unsubscribe without deadlocking; such changes apply from the next event.
    pub fn dispatch(&self, event: &ClientEvent) -> Vec<HandlerFailure> {
        let kind = event.kind();
        let snapshot: Vec<(SubscriptionId, EventHandler)> = self
            .handlers
            .lock()
            .get(&kind)
            .cloned()
            .unwrap_or_default();

        let mut failures = Vec::new();
        for (id, handler) in snapshot {
            let failure = match panic::catch_unwind(AssertUnwindSafe(|| handler(event))) {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => HandlerFailure {
                    subscription: id,
                    event: kind.name().to_string(),
                    message: e.0,
                    panicked: false,
                },
                Err(payload) => HandlerFailure {
                    subscription: id,
                    event: kind.name().to_string(),
                    message: format!("handler panicked: {}", panic_message(payload.as_ref())),
                    panicked: true,
                },
            };
            failures.push(failure);
        }
        failures
    }
}

/// Text carried by a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use deskwire_core::{AgentId, DisconnectReason};

    fn connected() -> ClientEvent {
        ClientEvent::Connected {
            agent_id: AgentId::from_raw("1"),
        }
    }

    fn handler(
        f: impl Fn(&ClientEvent) -> Result<(), HandlerError> + Send + Sync + 'static,
    ) -> EventHandler {
        Arc::new(f)
    }

    fn counting(counter: &Arc<AtomicU64>) -> EventHandler {
        let counter = Arc::clone(counter);
        handler(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    #[test]
    fn dispatches_only_matching_kind() {
        let registry = SubscriptionRegistry::new();
        let hits = Arc::new(AtomicU64::new(0));
        registry.subscribe(EventKind::Connect, counting(&hits));

        registry.dispatch(&ClientEvent::Disconnected {
            reason: DisconnectReason::Client,
        });
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        registry.dispatch(&connected());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failing_and_panicking_handlers_are_isolated() {
        let registry = SubscriptionRegistry::new();
        let hits = Arc::new(AtomicU64::new(0));
        let bad = registry.subscribe(EventKind::Connect, handler(|_| Err("boom".into())));
        let panicky = registry.subscribe(EventKind::Connect, handler(|_| panic!("kaboom")));
        registry.subscribe(EventKind::Connect, counting(&hits));

        let failures = registry.dispatch(&connected());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(failures.len(), 2);
        assert_eq!(failures[0].subscription, bad);
        assert_eq!(failures[0].message, "boom");
        assert!(!failures[0].panicked);
        assert_eq!(failures[1].subscription, panicky);
        assert!(failures[1].panicked);
        assert!(failures[1].message.contains("kaboom"));
        assert_eq!(failures[1].event, "connect");
    }

    #[test]
    fn unsubscribe_removes_handler() {
        let registry = SubscriptionRegistry::new();
        let hits = Arc::new(AtomicU64::new(0));
        let id = registry.subscribe(EventKind::Connect, counting(&hits));
        assert_eq!(registry.subscriber_count(&EventKind::Connect), 1);

        assert!(registry.unsubscribe(&EventKind::Connect, id));
        assert!(!registry.unsubscribe(&EventKind::Connect, id));
        assert!(!registry.unsubscribe(&EventKind::Error, id));
        assert_eq!(registry.subscriber_count(&EventKind::Connect), 0);

        registry.dispatch(&connected());
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn handler_may_subscribe_during_dispatch() {
        let registry = Arc::new(SubscriptionRegistry::new());
        let inner = Arc::clone(&registry);
        registry.subscribe(
            EventKind::Connect,
            handler(move |_| {
                inner.subscribe(EventKind::Connect, handler(|_| Ok(())));
                Ok(())
            }),
        );
        assert!(registry.dispatch(&connected()).is_empty());
        assert_eq!(registry.subscriber_count(&EventKind::Connect), 2);
    }

    #[test]
    fn ids_are_unique() {
        let registry = SubscriptionRegistry::new();
        let a = registry.subscribe(EventKind::Error, handler(|_| Ok(())));
        let b = registry.subscribe(EventKind::Error, handler(|_| Ok(())));
        assert_ne!(a, b);
        assert!(a.to_string().starts_with("sub_"));
    }
}
