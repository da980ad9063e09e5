//! # tenvis-pulse-transport
//!
//! Client transports for the Pulse realtime engine.
//!
//! A transport is a duplex pipe to one endpoint. The socket talks to it
//! through the [`Transport`] trait and listens to it through the
//! [`TransportEvent`]s it emits:
//!
//! - **WebSocket** - The standard, works everywhere
//! - **Long-poll** - HTTP fallback for networks that block WebSockets
//! - **Memory** - In-process transport for tests
//!
//! ## Transport Abstraction
//!
//! Transports are created by a [`Connector`], which lets the socket replace a
//! failed connection without knowing which protocol it speaks.
//!
//! ```rust,ignore
//! use tenvis_pulse_transport::{Connector, TransportEvent, WebSocketConnector};
//!
//! let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
//! let mut transport = WebSocketConnector::new().connect("ws://localhost:4000/socket/websocket", tx);
//! while let Some(event) = rx.recv().await {
//!     // React to open, message, error and close
//! }
//! ```

pub mod longpoll;
pub mod memory;
pub mod params;
pub mod traits;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use longpoll::{HttpClient, HttpMethod, LongPollConnector, LongPollTransport};
pub use memory::{MemoryConnector, MemoryRemote, MemoryTransport};
pub use params::{append_params, serialize_params};
pub use traits::{
    CloseEvent, Connector, EventReceiver, EventSender, ReadyState, SharedReadyState, Transport,
    TransportError, TransportEvent, CLOSE_ABNORMAL, CLOSE_NORMAL,
};

#[cfg(feature = "longpoll")]
pub use longpoll::ReqwestClient;

#[cfg(feature = "websocket")]
pub use websocket::{WebSocketConfig, WebSocketConnector, WebSocketTransport};
