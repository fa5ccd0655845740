//! Scripted in-process channel for driving the manager in tests.
//!
//! Open attempts consume queued results (falling back to a default) and may
//! be slowed by queued delays, sent frames are recorded, and inbound
//! transport events can be injected while a connection is open. The most
//! recently completed open owns the inbound side.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;

use deskwire_core::ChannelError;

use crate::channel::{ConnectionChannel, Frame, TransportEvent};

const SCRIPTED_BUFFER: usize = 64;

#[derive(Default)]
struct Script {
    open_results: VecDeque<Result<(), ChannelError>>,
    open_delays: VecDeque<Duration>,
    opens_in_flight: usize,
    max_concurrent_opens: usize,
    refuse_reason: Option<String>,
    fail_sends: bool,
    open_times: Vec<Instant>,
    close_calls: usize,
    sent: Vec<Frame>,
    inbound: Option<mpsc::Sender<TransportEvent>>,
}

/// Test channel. Accepts every connection unless told otherwise.
#[derive(Default)]
pub struct ScriptedChannel {
    script: Mutex<Script>,
}

impl ScriptedChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every open attempt without a queued result fails with `reason`.
    pub fn refuse_connections(&self, reason: impl Into<String>) {
        self.script.lock().refuse_reason = Some(reason.into());
    }

    pub fn accept_connections(&self) {
        self.script.lock().refuse_reason = None;
    }

    /// Queue the result of the next open attempt.
    pub fn push_open_result(&self, result: Result<(), ChannelError>) {
        self.script.lock().open_results.push_back(result);
    }

    /// Make the next open attempt take `delay` before it resolves.
    pub fn push_open_delay(&self, delay: Duration) {
        self.script.lock().open_delays.push_back(delay);
    }

    /// Highest number of open attempts that were in flight at once.
    pub fn max_concurrent_opens(&self) -> usize {
        self.script.lock().max_concurrent_opens
    }

    pub fn fail_sends(&self, fail: bool) {
        self.script.lock().fail_sends = fail;
    }

    pub fn open_calls(&self) -> usize {
        self.script.lock().open_times.len()
    }

    /// Instants at which each open attempt started.
    pub fn open_times(&self) -> Vec<Instant> {
        self.script.lock().open_times.clone()
    }

    pub fn close_calls(&self) -> usize {
        self.script.lock().close_calls
    }

    pub fn sent(&self) -> Vec<Frame> {
        self.script.lock().sent.clone()
    }

    pub fn sent_named(&self, event: &str) -> Vec<Frame> {
        self.script
            .lock()
            .sent
            .iter()
            .filter(|f| f.event == event)
            .cloned()
            .collect()
    }

    pub fn clear_sent(&self) {
        self.script.lock().sent.clear();
    }

    /// Deliver an inbound event. Returns `false` when no connection is open.
    pub fn inject(&self, event: TransportEvent) -> bool {
        let inbound = self.script.lock().inbound.clone();
        inbound.is_some_and(|tx| tx.try_send(event).is_ok())
    }

    pub fn inject_frame(&self, event: &str, data: Value) -> bool {
        self.inject(TransportEvent::Frame(Frame::new(event, data)))
    }

    pub fn inject_error(&self, message: &str) -> bool {
        self.inject(TransportEvent::Error(message.to_string()))
    }

    /// Simulate the server dropping the connection.
    pub fn drop_connection(&self, reason: &str) -> bool {
        let inbound = self.script.lock().inbound.take();
        inbound.is_some_and(|tx| {
            tx.try_send(TransportEvent::Closed {
                reason: reason.to_string(),
            })
            .is_ok()
        })
    }
}

#[async_trait]
impl ConnectionChannel for ScriptedChannel {
    async fn open(&self, _url: &str) -> Result<mpsc::Receiver<TransportEvent>, ChannelError> {
        let delay = {
            let mut script = self.script.lock();
            script.open_times.push(Instant::now());
            script.opens_in_flight += 1;
            script.max_concurrent_opens = script.max_concurrent_opens.max(script.opens_in_flight);
            script.open_delays.pop_front()
        };
        // Decrements on completion and when the caller drops the open.
        let _in_flight = InFlight(&self.script);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut script = self.script.lock();
        let result = match script.open_results.pop_front() {
            Some(result) => result,
            None => match &script.refuse_reason {
                Some(reason) => Err(ChannelError::ConnectFailed(reason.clone())),
                None => Ok(()),
            },
        };
        result?;
        let (tx, rx) = mpsc::channel(SCRIPTED_BUFFER);
        script.inbound = Some(tx);
        Ok(rx)
    }

    fn send(&self, frame: Frame) -> Result<(), ChannelError> {
        let mut script = self.script.lock();
        if script.inbound.is_none() {
            return Err(ChannelError::NotOpen);
        }
        if script.fail_sends {
            return Err(ChannelError::SendFailed("scripted send failure".into()));
        }
        script.sent.push(frame);
        Ok(())
    }

    fn close(&self) {
        let mut script = self.script.lock();
        script.close_calls += 1;
        script.inbound = None;
    }

    fn is_open(&self) -> bool {
        self.script.lock().inbound.is_some()
    }
}

struct InFlight<'a>(&'a Mutex<Script>);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.lock().opens_in_flight -= 1;
    }
}
