//! Transport abstraction traits for Pulse.
//!
//! A transport is a duplex message pipe to one endpoint. The socket owns at
//! most one transport at a time and learns about it exclusively through the
//! [`TransportEvent`]s the transport emits, which makes every transport
//! (WebSocket, long-poll, in-memory) interchangeable.

use pulse_protocol::RawMessage;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Normal closure status code.
pub const CLOSE_NORMAL: u16 = 1000;

/// Status code reported when a connection ends without a close handshake.
pub const CLOSE_ABNORMAL: u16 = 1006;

/// Connection state of a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ReadyState {
    Connecting = 0,
    Open = 1,
    Closing = 2,
    Closed = 3,
}

impl ReadyState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ReadyState::Connecting,
            1 => ReadyState::Open,
            2 => ReadyState::Closing,
            _ => ReadyState::Closed,
        }
    }
}

impl fmt::Display for ReadyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReadyState::Connecting => "connecting",
            ReadyState::Open => "open",
            ReadyState::Closing => "closing",
            ReadyState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// A [`ReadyState`] shared between a transport handle and its I/O task.
#[derive(Debug, Clone)]
pub struct SharedReadyState(Arc<AtomicU8>);

impl SharedReadyState {
    /// Create a shared state with an initial value.
    #[must_use]
    pub fn new(state: ReadyState) -> Self {
        Self(Arc::new(AtomicU8::new(state as u8)))
    }

    /// Read the current state.
    #[must_use]
    pub fn get(&self) -> ReadyState {
        ReadyState::from_u8(self.0.load(Ordering::SeqCst))
    }

    /// Replace the current state.
    pub fn set(&self, state: ReadyState) {
        self.0.store(state as u8, Ordering::SeqCst);
    }
}

/// Why a transport closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseEvent {
    /// Close status code.
    pub code: u16,
    /// Human-readable reason.
    pub reason: String,
}

impl CloseEvent {
    /// Create a close event.
    #[must_use]
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    /// A normal closure.
    #[must_use]
    pub fn normal() -> Self {
        Self::new(CLOSE_NORMAL, "")
    }

    /// A closure without a close handshake.
    #[must_use]
    pub fn abnormal(reason: impl Into<String>) -> Self {
        Self::new(CLOSE_ABNORMAL, reason)
    }

    /// Whether the connection closed cleanly.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.code == CLOSE_NORMAL
    }
}

/// Notifications a transport delivers to its owner.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// The transport is open and may send.
    Open,
    /// A transport-level error. Usually followed by [`TransportEvent::Close`].
    Error(String),
    /// An inbound message.
    Message(RawMessage),
    /// The transport closed.
    Close(CloseEvent),
}

/// Sending half of a transport's event stream.
pub type EventSender = mpsc::UnboundedSender<TransportEvent>;

/// Receiving half of a transport's event stream.
pub type EventReceiver = mpsc::UnboundedReceiver<TransportEvent>;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection was closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Operation timed out.
    #[error("Connection timed out")]
    Timeout,

    /// Failed to send data.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Failed to receive data.
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    /// Protocol error.
    #[error("Protocol error: {0}")]
    Protocol(#[from] pulse_protocol::ProtocolError),

    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// An established (or establishing) connection to one endpoint.
///
/// Implementations never block: `send` queues, `close` starts the closing
/// handshake, and everything observable is reported as a [`TransportEvent`].
pub trait Transport: Send {
    /// Queue a message for delivery.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport cannot accept the message.
    fn send(&mut self, message: RawMessage) -> Result<(), TransportError>;

    /// Close the transport with an optional status code and reason.
    fn close(&mut self, code: Option<u16>, reason: Option<&str>);

    /// Current connection state.
    fn ready_state(&self) -> ReadyState;

    /// Whether the owner should skip its heartbeat loop.
    ///
    /// Transports with their own liveness signal return `true`.
    fn skip_heartbeat(&self) -> bool {
        false
    }

    /// Transport name (e.g., "websocket", "longpoll").
    fn name(&self) -> &'static str;
}

/// Creates transports from an endpoint URL.
pub trait Connector: Send + Sync {
    /// Start connecting to `endpoint`, reporting to `events`.
    fn connect(&self, endpoint: &str, events: EventSender) -> Box<dyn Transport>;

    /// Path segment appended to the socket endpoint for this transport.
    fn endpoint_path(&self) -> &'static str {
        "/websocket"
    }

    /// Connector name.
    fn name(&self) -> &'static str;
}
