//! Full-reload fallback.

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::watch;
use tracing::info;

use deskwire_core::FallbackError;

/// Re-fetches the dashboard from scratch. The path of last resort: an error
/// here is fatal for the update that triggered it.
pub trait DataLoader: Send + Sync {
    fn refresh(&self) -> Result<(), FallbackError>;
}

/// Signals the host to refetch by bumping a generation counter.
///
/// The host watches [`ReloadSignal::subscribe`], refetches, and calls
/// [`ReloadSignal::complete`]. Refreshing with nobody watching fails.
pub struct ReloadSignal {
    generation: watch::Sender<u64>,
    pending: AtomicBool,
}

impl Default for ReloadSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl ReloadSignal {
    pub fn new() -> Self {
        let (generation, _) = watch::channel(0);
        Self {
            generation,
            pending: AtomicBool::new(false),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.generation.subscribe()
    }

    pub fn generation(&self) -> u64 {
        *self.generation.borrow()
    }

    /// A reload was requested and not yet completed.
    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }

    pub fn complete(&self) {
        self.pending.store(false, Ordering::Release);
    }
}

impl DataLoader for ReloadSignal {
    fn refresh(&self) -> Result<(), FallbackError> {
        if self.generation.receiver_count() == 0 {
            return Err(FallbackError("no reload listener attached".into()));
        }
        self.pending.store(true, Ordering::Release);
        self.generation.send_modify(|g| *g += 1);
        info!(generation = self.generation(), "full reload requested");
        Ok(())
    }
}
