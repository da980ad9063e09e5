//! In-memory transport.
//!
//! [`MemoryConnector`] hands out transports whose far end is a
//! [`MemoryRemote`] the caller drives directly: open the connection, deliver
//! frames, fail it, close it and inspect what the client sent. Used to test
//! socket and channel behaviour without a network.

use parking_lot::Mutex;
use pulse_protocol::{Frame, RawMessage, Serializer, JsonSerializer};
use std::sync::Arc;

use crate::traits::{
    CloseEvent, Connector, EventSender, ReadyState, SharedReadyState, Transport, TransportError,
    TransportEvent,
};

#[derive(Default)]
struct Shared {
    connections: Vec<Connection>,
}

struct Connection {
    endpoint: String,
    state: SharedReadyState,
    events: EventSender,
    sent: Vec<RawMessage>,
    closed_by_client: Option<CloseEvent>,
}

/// Creates in-memory transports.
#[derive(Clone, Default)]
pub struct MemoryConnector {
    shared: Arc<Mutex<Shared>>,
    skip_heartbeat: bool,
}

impl MemoryConnector {
    /// Create a connector and the remote end that drives it.
    #[must_use]
    pub fn new() -> (Self, MemoryRemote) {
        let connector = Self::default();
        let remote = MemoryRemote {
            shared: Arc::clone(&connector.shared),
        };
        (connector, remote)
    }

    /// Transports created by this connector opt out of heartbeats.
    #[must_use]
    pub fn without_heartbeat(mut self) -> Self {
        self.skip_heartbeat = true;
        self
    }
}

impl Connector for MemoryConnector {
    fn connect(&self, endpoint: &str, events: EventSender) -> Box<dyn Transport> {
        let state = SharedReadyState::new(ReadyState::Connecting);
        let mut shared = self.shared.lock();
        shared.connections.push(Connection {
            endpoint: endpoint.to_string(),
            state: state.clone(),
            events,
            sent: Vec::new(),
            closed_by_client: None,
        });
        Box::new(MemoryTransport {
            index: shared.connections.len() - 1,
            state,
            shared: Arc::clone(&self.shared),
            skip_heartbeat: self.skip_heartbeat,
        })
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// Client side of an in-memory connection.
pub struct MemoryTransport {
    index: usize,
    state: SharedReadyState,
    shared: Arc<Mutex<Shared>>,
    skip_heartbeat: bool,
}

impl Transport for MemoryTransport {
    fn send(&mut self, message: RawMessage) -> Result<(), TransportError> {
        if self.state.get() != ReadyState::Open {
            return Err(TransportError::ConnectionClosed);
        }
        self.shared.lock().connections[self.index].sent.push(message);
        Ok(())
    }

    fn close(&mut self, code: Option<u16>, reason: Option<&str>) {
        if self.state.get() == ReadyState::Closed {
            return;
        }
        self.state.set(ReadyState::Closed);
        let close = CloseEvent::new(
            code.unwrap_or(crate::traits::CLOSE_NORMAL),
            reason.unwrap_or_default(),
        );
        let mut shared = self.shared.lock();
        let connection = &mut shared.connections[self.index];
        connection.closed_by_client = Some(close.clone());
        let _ = connection.events.send(TransportEvent::Close(close));
    }

    fn ready_state(&self) -> ReadyState {
        self.state.get()
    }

    fn skip_heartbeat(&self) -> bool {
        self.skip_heartbeat
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// Remote end of the in-memory transports created by a [`MemoryConnector`].
///
/// Every method acts on the most recent connection.
#[derive(Clone)]
pub struct MemoryRemote {
    shared: Arc<Mutex<Shared>>,
}

impl MemoryRemote {
    fn with_latest<R>(&self, f: impl FnOnce(&mut Connection) -> R) -> Option<R> {
        self.shared.lock().connections.last_mut().map(f)
    }

    /// Number of connections made so far.
    #[must_use]
    pub fn connections(&self) -> usize {
        self.shared.lock().connections.len()
    }

    /// Endpoint URL of the latest connection.
    #[must_use]
    pub fn endpoint(&self) -> Option<String> {
        self.with_latest(|c| c.endpoint.clone())
    }

    /// Ready state of the latest connection.
    #[must_use]
    pub fn ready_state(&self) -> Option<ReadyState> {
        self.with_latest(|c| c.state.get())
    }

    /// Accept the latest connection.
    pub fn open(&self) {
        self.with_latest(|c| {
            c.state.set(ReadyState::Open);
            let _ = c.events.send(TransportEvent::Open);
        });
    }

    /// Deliver a raw message on the latest connection.
    pub fn deliver(&self, message: impl Into<RawMessage>) {
        let message = message.into();
        self.with_latest(|c| {
            let _ = c.events.send(TransportEvent::Message(message));
        });
    }

    /// Deliver a JSON-encoded frame on the latest connection.
    pub fn deliver_frame(&self, frame: &Frame) {
        if let Ok(message) = JsonSerializer.encode(frame) {
            self.deliver(message);
        }
    }

    /// Report a transport error on the latest connection.
    pub fn error(&self, reason: &str) {
        self.with_latest(|c| {
            let _ = c.events.send(TransportEvent::Error(reason.to_string()));
        });
    }

    /// Close the latest connection from the remote side.
    pub fn close(&self, close: CloseEvent) {
        self.with_latest(|c| {
            c.state.set(ReadyState::Closed);
            let _ = c.events.send(TransportEvent::Close(close));
        });
    }

    /// Close reported by the client on the latest connection, if any.
    #[must_use]
    pub fn closed_by_client(&self) -> Option<CloseEvent> {
        self.with_latest(|c| c.closed_by_client.clone()).flatten()
    }

    /// Messages the client sent on the latest connection.
    #[must_use]
    pub fn sent(&self) -> Vec<RawMessage> {
        self.with_latest(|c| c.sent.clone()).unwrap_or_default()
    }

    /// Messages the client sent on the latest connection, decoded as JSON frames.
    #[must_use]
    pub fn sent_frames(&self) -> Vec<Frame> {
        decode_all(self.sent())
    }

    /// Take and decode the messages sent on the latest connection.
    pub fn take_sent_frames(&self) -> Vec<Frame> {
        decode_all(
            self.with_latest(|c| std::mem::take(&mut c.sent))
                .unwrap_or_default(),
        )
    }
}

fn decode_all(messages: Vec<RawMessage>) -> Vec<Frame> {
    messages
        .iter()
        .filter_map(|message| JsonSerializer.decode(message).ok())
        .collect()
}
