//! WebSocket transport implementation.
//!
//! This module provides a WebSocket client transport using tokio-tungstenite.
//! Each connection runs on its own task, which owns the stream and talks to
//! the [`WebSocketTransport`] handle through an unbounded queue.

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use pulse_protocol::RawMessage;
use std::borrow::Cow;
use tokio::sync::mpsc;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        protocol::{frame::coding::CloseCode, CloseFrame},
        Message,
    },
};
use tracing::{debug, warn};

use crate::traits::{
    CloseEvent, Connector, EventSender, ReadyState, SharedReadyState, Transport, TransportError,
    TransportEvent, CLOSE_NORMAL,
};

/// Status code used when the peer closes without a status.
const CLOSE_NO_STATUS: u16 = 1005;

/// WebSocket transport configuration.
#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    /// Maximum inbound message size in bytes.
    pub max_message_size: usize,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            max_message_size: 8 * 1024 * 1024, // 8 MB
        }
    }
}

/// Creates [`WebSocketTransport`]s.
#[derive(Debug, Clone, Default)]
pub struct WebSocketConnector {
    config: WebSocketConfig,
}

impl WebSocketConnector {
    /// Create a connector with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a connector with custom configuration.
    #[must_use]
    pub fn with_config(config: WebSocketConfig) -> Self {
        Self { config }
    }
}

impl Connector for WebSocketConnector {
    fn connect(&self, endpoint: &str, events: EventSender) -> Box<dyn Transport> {
        let state = SharedReadyState::new(ReadyState::Connecting);
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();

        tokio::spawn(run_connection(
            endpoint.to_string(),
            self.config.clone(),
            state.clone(),
            outgoing_rx,
            events,
        ));

        Box::new(WebSocketTransport {
            state,
            outgoing: outgoing_tx,
        })
    }

    fn name(&self) -> &'static str {
        "websocket"
    }
}

/// Work queued for the connection task.
enum Outgoing {
    Message(RawMessage),
    Close { code: u16, reason: String },
}

/// Handle to a WebSocket connection task.
///
/// Dropping the handle closes the connection without reporting a close event.
pub struct WebSocketTransport {
    state: SharedReadyState,
    outgoing: mpsc::UnboundedSender<Outgoing>,
}

impl Transport for WebSocketTransport {
    fn send(&mut self, message: RawMessage) -> Result<(), TransportError> {
        if self.state.get() != ReadyState::Open {
            return Err(TransportError::ConnectionClosed);
        }
        self.outgoing
            .send(Outgoing::Message(message))
            .map_err(|_| TransportError::ConnectionClosed)
    }

    fn close(&mut self, code: Option<u16>, reason: Option<&str>) {
        if matches!(self.state.get(), ReadyState::Closing | ReadyState::Closed) {
            return;
        }
        self.state.set(ReadyState::Closing);
        let _ = self.outgoing.send(Outgoing::Close {
            code: code.unwrap_or(CLOSE_NORMAL),
            reason: reason.unwrap_or_default().to_string(),
        });
    }

    fn ready_state(&self) -> ReadyState {
        self.state.get()
    }

    fn name(&self) -> &'static str {
        "websocket"
    }
}

/// Drive one WebSocket connection until it closes.
async fn run_connection(
    url: String,
    config: WebSocketConfig,
    state: SharedReadyState,
    mut outgoing: mpsc::UnboundedReceiver<Outgoing>,
    events: EventSender,
) {
    let stream = match connect_async(url.as_str()).await {
        Ok((stream, _response)) => stream,
        Err(e) => {
            warn!(url = %url, error = %e, "WebSocket connect failed");
            state.set(ReadyState::Closed);
            let _ = events.send(TransportEvent::Error(e.to_string()));
            let _ = events.send(TransportEvent::Close(CloseEvent::abnormal(e.to_string())));
            return;
        }
    };

    debug!(url = %url, "WebSocket connected");
    if state.get() == ReadyState::Connecting {
        state.set(ReadyState::Open);
    }
    let _ = events.send(TransportEvent::Open);

    let (mut sink, mut stream) = stream.split();

    let close = loop {
        tokio::select! {
            out = outgoing.recv() => match out {
                Some(Outgoing::Message(message)) => {
                    let message = match message {
                        RawMessage::Text(text) => Message::Text(text),
                        RawMessage::Binary(data) => Message::Binary(data.to_vec()),
                    };
                    if let Err(e) = sink.send(message).await {
                        warn!(error = %e, "WebSocket send failed");
                        let _ = events.send(TransportEvent::Error(e.to_string()));
                        break CloseEvent::abnormal(e.to_string());
                    }
                }
                Some(Outgoing::Close { code, reason }) => {
                    let frame = CloseFrame {
                        code: CloseCode::from(code),
                        reason: Cow::Owned(reason.clone()),
                    };
                    if let Err(e) = sink.send(Message::Close(Some(frame))).await {
                        debug!(error = %e, "Failed to send close frame");
                    }
                    break CloseEvent::new(code, reason);
                }
                None => {
                    // Handle dropped: close quietly.
                    let _ = sink.close().await;
                    state.set(ReadyState::Closed);
                    debug!(url = %url, "WebSocket handle dropped");
                    return;
                }
            },
            msg = stream.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    if text.len() > config.max_message_size {
                        warn!(size = text.len(), max = config.max_message_size, "Skipping oversized message");
                        continue;
                    }
                    let _ = events.send(TransportEvent::Message(RawMessage::Text(text)));
                }
                Some(Ok(Message::Binary(data))) => {
                    if data.len() > config.max_message_size {
                        warn!(size = data.len(), max = config.max_message_size, "Skipping oversized message");
                        continue;
                    }
                    let _ = events.send(TransportEvent::Message(RawMessage::Binary(Bytes::from(data))));
                }
                Some(Ok(Message::Close(frame))) => {
                    debug!("Received close frame");
                    break match frame {
                        Some(frame) => CloseEvent::new(u16::from(frame.code), frame.reason.into_owned()),
                        None => CloseEvent::new(CLOSE_NO_STATUS, ""),
                    };
                }
                Some(Ok(_)) => {
                    // Ping/pong are answered by tungstenite.
                }
                Some(Err(e)) => {
                    warn!(error = %e, "WebSocket error");
                    let _ = events.send(TransportEvent::Error(e.to_string()));
                    break CloseEvent::abnormal(e.to_string());
                }
                None => {
                    debug!("WebSocket stream ended");
                    break CloseEvent::abnormal("stream ended");
                }
            }
        }
    };

    state.set(ReadyState::Closed);
    let _ = events.send(TransportEvent::Close(close));
}
