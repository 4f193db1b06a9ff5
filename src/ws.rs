//! Production push wire over WebSocket.
//!
//! The backend exposes its pub/sub endpoint at `/ws/chat?token=...`. Frames
//! are JSON (the protocol is an existing one; this module only moves frames):
//!
//! - outbound `{"op":"subscribe","id":N,"channel":"..."}` /
//!   `{"op":"unsubscribe","id":N,"channel":"..."}` /
//!   `{"op":"send","destination":"...","payload":{...}}`
//! - inbound `{"channel":"...","payload":{...}}`
//!
//! A reader task forwards inbound frames into the owner's event channel and
//! a writer task drains an unbounded queue, which keeps the [`WireSession`]
//! methods synchronous and the outbound stream ordered.

use futures_util::{SinkExt as _, StreamExt as _};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_tungstenite::tungstenite::Error as WsError;

use crate::hlog;
use crate::transport::{ConnectionError, PushWire, SendError, WireEvent, WireSession};

#[derive(Debug, Deserialize)]
struct InboundFrame {
    channel: String,
    payload: Value,
}

/// WebSocket-backed [`PushWire`].
#[derive(Debug, Clone)]
pub struct WsWire {
    base_url: String,
}

impl WsWire {
    /// `base_url` is the `ws://`/`wss://` root of the backend.
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

impl PushWire for WsWire {
    type Session = WsWireSession;

    async fn connect(
        &self,
        credential: &str,
        inbound: mpsc::UnboundedSender<WireEvent>,
    ) -> Result<WsWireSession, ConnectionError> {
        let url = format!("{}/ws/chat?token={}", self.base_url, credential);
        let (stream, _response) = connect_async(&url).await.map_err(|error| match &error {
            WsError::Http(response) if response.status().as_u16() == 401 || response.status().as_u16() == 403 => {
                ConnectionError::AuthRejected(error.to_string())
            }
            _ => ConnectionError::Unreachable(error.to_string()),
        })?;

        let (mut write, mut read) = stream.split();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<WsMessage>();

        tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                if let Err(error) = write.send(frame).await {
                    hlog!("ws: write failed: {error}");
                    break;
                }
            }
        });

        tokio::spawn(async move {
            let reason = loop {
                match read.next().await {
                    Some(Ok(WsMessage::Text(text))) => {
                        match serde_json::from_str::<InboundFrame>(&text) {
                            Ok(frame) => {
                                let _ = inbound.send(WireEvent::Frame {
                                    channel: frame.channel,
                                    payload: frame.payload,
                                });
                            }
                            Err(error) => hlog!("ws: unparseable frame dropped: {error}"),
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) => break "closed by server".to_string(),
                    Some(Ok(_)) => {}
                    Some(Err(error)) => break error.to_string(),
                    None => break "stream ended".to_string(),
                }
            };
            let _ = inbound.send(WireEvent::Closed { reason });
        });

        Ok(WsWireSession {
            outbound: outbound_tx,
            next_subscription: 1,
        })
    }
}

/// One live WebSocket connection.
pub struct WsWireSession {
    outbound: mpsc::UnboundedSender<WsMessage>,
    next_subscription: u64,
}

impl WsWireSession {
    fn enqueue(&self, frame: Value) -> Result<(), SendError> {
        let text = frame.to_string();
        self.outbound
            .send(WsMessage::Text(text))
            .map_err(|_| SendError::NotConnected)
    }
}

impl WireSession for WsWireSession {
    fn subscribe(&mut self, channel: &str) -> Result<u64, SendError> {
        let id = self.next_subscription;
        self.next_subscription += 1;
        self.enqueue(json!({ "op": "subscribe", "id": id, "channel": channel }))?;
        Ok(id)
    }

    fn unsubscribe(&mut self, subscription_id: u64, channel: &str) {
        let _ = self.enqueue(json!({
            "op": "unsubscribe",
            "id": subscription_id,
            "channel": channel,
        }));
    }

    fn publish(&mut self, destination: &str, payload: &Value) -> Result<(), SendError> {
        self.enqueue(json!({
            "op": "send",
            "destination": destination,
            "payload": payload,
        }))
    }

    fn close(&mut self) {
        let _ = self.outbound.send(WsMessage::Close(None));
    }
}
