//! Transport boundary: one logical full-duplex event connection.
//!
//! Frames travel as JSON envelopes `{"event": <name>, "data": <payload>}` in
//! both directions. The manager never sees the socket itself, only
//! [`TransportEvent`]s and the synchronous [`ConnectionChannel::send`].

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use deskwire_core::ChannelError;

/// Inbound events buffered between the socket task and the manager.
pub const TRANSPORT_EVENT_BUFFER: usize = 256;
const DEFAULT_SEND_QUEUE: usize = 256;

/// Wire envelope.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

impl Frame {
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }

    pub fn encode(&self) -> Result<String, ChannelError> {
        serde_json::to_string(self).map_err(|e| ChannelError::Encode(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ChannelError> {
        serde_json::from_str(text).map_err(|e| ChannelError::Encode(format!("malformed frame: {e}")))
    }
}

/// What the transport reports back, in delivery order.
#[derive(Clone, Debug, PartialEq)]
pub enum TransportEvent {
    Frame(Frame),
    /// Non-fatal transport problem (malformed frame, write failure).
    Error(String),
    /// The connection ended without the client asking for it.
    Closed { reason: String },
}

/// A connection the manager can open, write to, and close.
///
/// `send` is synchronous: implementations queue the frame and report only
/// whether it was accepted. `close` is idempotent and must not emit
/// [`TransportEvent::Closed`].
#[async_trait]
pub trait ConnectionChannel: Send + Sync {
    async fn open(&self, url: &str) -> Result<mpsc::Receiver<TransportEvent>, ChannelError>;
    fn send(&self, frame: Frame) -> Result<(), ChannelError>;
    fn close(&self);
    fn is_open(&self) -> bool;
}

struct ActiveSocket {
    tx: mpsc::Sender<String>,
    cancel: CancellationToken,
}

/// WebSocket-backed channel.
pub struct WsChannel {
    active: Mutex<Option<ActiveSocket>>,
    send_queue: usize,
}

impl Default for WsChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl WsChannel {
    pub fn new() -> Self {
        Self {
            active: Mutex::new(None),
            send_queue: DEFAULT_SEND_QUEUE,
        }
    }
}

#[async_trait]
impl ConnectionChannel for WsChannel {
    async fn open(&self, url: &str) -> Result<mpsc::Receiver<TransportEvent>, ChannelError> {
        self.close();

        let (ws, _) = connect_async(url)
            .await
            .map_err(|e| ChannelError::ConnectFailed(e.to_string()))?;
        debug!(url, "websocket handshake complete");

        let (events_tx, events_rx) = mpsc::channel(TRANSPORT_EVENT_BUFFER);
        let (out_tx, out_rx) = mpsc::channel::<String>(self.send_queue);
        let cancel = CancellationToken::new();

        tokio::spawn(socket_loop(ws, out_rx, events_tx, cancel.clone()));

        let previous = self.active.lock().replace(ActiveSocket { tx: out_tx, cancel });
        if let Some(previous) = previous {
            previous.cancel.cancel();
        }
        Ok(events_rx)
    }

    fn send(&self, frame: Frame) -> Result<(), ChannelError> {
        let active = self.active.lock();
        let Some(socket) = active.as_ref() else {
            return Err(ChannelError::NotOpen);
        };
        let text = frame.encode()?;
        match socket.tx.try_send(text) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(msg)) => {
                warn!(msg_len = msg.len(), event = %frame.event, "send queue full, dropping frame");
                Err(ChannelError::SendFailed("send queue full".into()))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(ChannelError::NotOpen),
        }
    }

    fn close(&self) {
        if let Some(socket) = self.active.lock().take() {
            socket.cancel.cancel();
        }
    }

    fn is_open(&self) -> bool {
        self.active
            .lock()
            .as_ref()
            .is_some_and(|s| !s.tx.is_closed() && !s.cancel.is_cancelled())
    }
}

type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

/// Owns the socket: forwards queued frames out and decoded frames in.
async fn socket_loop(
    ws: WsStream,
    mut out_rx: mpsc::Receiver<String>,
    events: mpsc::Sender<TransportEvent>,
    cancel: CancellationToken,
) {
    let (mut ws_tx, mut ws_rx) = ws.split();

    let close_reason = loop {
        tokio::select! {
            () = cancel.cancelled() => {
                let _ = ws_tx.send(Message::Close(None)).await;
                return;
            }
            out = out_rx.recv() => {
                let Some(text) = out else {
                    let _ = ws_tx.send(Message::Close(None)).await;
                    return;
                };
                if let Err(e) = ws_tx.send(Message::Text(text.into())).await {
                    let _ = events.send(TransportEvent::Error(format!("write failed: {e}"))).await;
                    break format!("write failed: {e}");
                }
            }
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let event = match Frame::decode(&text) {
                            Ok(frame) => {
                                trace!(event = %frame.event, "frame received");
                                TransportEvent::Frame(frame)
                            }
                            Err(e) => TransportEvent::Error(e.to_string()),
                        };
                        if events.send(event).await.is_err() {
                            return;
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        break frame
                            .map(|f| f.reason.as_str().to_string())
                            .filter(|r| !r.is_empty())
                            .unwrap_or_else(|| "server closed connection".to_string());
                    }
                    // Pings are answered by tungstenite on the next flush.
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break e.to_string(),
                    None => break "stream ended".to_string(),
                }
            }
        }
    };

    if !cancel.is_cancelled() {
        let _ = events.send(TransportEvent::Closed { reason: close_reason }).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_roundtrip_shape() {
        let frame = Frame::new("heartbeat", serde_json::json!({"agentId": "7"}));
        let text = frame.encode().unwrap();
        assert!(text.contains("\"event\":\"heartbeat\""));
        assert_eq!(Frame::decode(&text).unwrap(), frame);
    }

    #[test]
    fn frame_without_data_decodes_to_null() {
        let frame = Frame::decode(r#"{"event":"system-mode-update"}"#).unwrap();
        assert_eq!(frame.event, "system-mode-update");
        assert!(frame.data.is_null());
    }

    #[test]
    fn malformed_frame_is_an_encode_error() {
        let err = Frame::decode("not json").unwrap_err();
        assert!(matches!(err, ChannelError::Encode(_)));
        assert!(err.to_string().contains("malformed frame"));
    }

    #[test]
    fn ws_channel_send_before_open_fails() {
        let channel = WsChannel::new();
        assert!(!channel.is_open());
        assert_eq!(
            channel.send(Frame::new("x", Value::Null)),
            Err(ChannelError::NotOpen)
        );
        channel.close();
    }

    #[tokio::test]
    async fn ws_channel_open_to_unreachable_host_fails() {
        let channel = WsChannel::new();
        let err = channel.open("ws://127.0.0.1:9/realtime").await.unwrap_err();
        assert!(matches!(err, ChannelError::ConnectFailed(_)));
        assert!(!channel.is_open());
    }
}
