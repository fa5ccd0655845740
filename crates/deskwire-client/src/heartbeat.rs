//! Periodic liveness frames while a connection is open.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::json;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use deskwire_core::{AgentId, ChannelError};

use crate::channel::{ConnectionChannel, Frame};

pub const HEARTBEAT_EVENT: &str = "heartbeat";

/// Outcome of the heartbeat loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeartbeatResult {
    /// A heartbeat frame could not be written.
    SendFailed(ChannelError),
    /// Stopped by the owner.
    Cancelled,
}

/// Send `{agentId, timestamp}` on `channel` every `interval`.
///
/// The first frame goes out one full interval after start. A failed send
/// ends the loop; the transport reports the underlying disconnect.
pub async fn run_heartbeat(
    channel: Arc<dyn ConnectionChannel>,
    interval: Duration,
    agent_id: AgentId,
    beats: Arc<AtomicU64>,
    cancel: CancellationToken,
) -> HeartbeatResult {
    let mut ticker = time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // interval() completes its first tick immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            () = cancel.cancelled() => return HeartbeatResult::Cancelled,
            _ = ticker.tick() => {
                let frame = Frame::new(
                    HEARTBEAT_EVENT,
                    json!({
                        "agentId": agent_id,
                        "timestamp": Utc::now().to_rfc3339(),
                    }),
                );
                if let Err(e) = channel.send(frame) {
                    warn!(error = %e, "heartbeat send failed");
                    return HeartbeatResult::SendFailed(e);
                }
                let n = beats.fetch_add(1, Ordering::Relaxed) + 1;
                trace!(beats = n, "heartbeat sent");
            }
        }
    }
}

/// Owns at most one running heartbeat task.
pub struct HeartbeatController {
    channel: Arc<dyn ConnectionChannel>,
    interval: Duration,
    running: Mutex<Option<CancellationToken>>,
    beats: Arc<AtomicU64>,
}

impl HeartbeatController {
    pub fn new(channel: Arc<dyn ConnectionChannel>, interval: Duration) -> Self {
        Self {
            channel,
            interval,
            running: Mutex::new(None),
            beats: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Start beating for `agent_id`, replacing any running task.
    pub fn start(&self, agent_id: AgentId) {
        let cancel = CancellationToken::new();
        if let Some(previous) = self.running.lock().replace(cancel.clone()) {
            previous.cancel();
        }
        let channel = Arc::clone(&self.channel);
        let beats = Arc::clone(&self.beats);
        let interval = self.interval;
        debug!(interval_ms = interval.as_millis() as u64, "heartbeat started");
        tokio::spawn(async move {
            let result = run_heartbeat(channel, interval, agent_id, beats, cancel).await;
            debug!(?result, "heartbeat stopped");
        });
    }

    /// Idempotent.
    pub fn stop(&self) {
        if let Some(cancel) = self.running.lock().take() {
            cancel.cancel();
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .as_ref()
            .is_some_and(|c| !c.is_cancelled())
    }

    /// Total frames sent across all runs.
    pub fn beats_sent(&self) -> u64 {
        self.beats.load(Ordering::Relaxed)
    }
}

impl Drop for HeartbeatController {
    fn drop(&mut self) {
        self.stop();
    }
}
