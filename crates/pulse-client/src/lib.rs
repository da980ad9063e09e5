//! # tenvis-pulse-client
//!
//! Realtime client for Pulse: channels multiplexed over one reconnecting
//! socket, request/reply pushes, and presence tracking.
//!
//! - **Socket** - Owns the transport, heartbeats it and reconnects with backoff
//! - **Channel** - One topic; joins, rejoins after failures, routes events
//! - **Push** - An outbound event and its `ok` / `error` / `timeout` reply
//! - **Presence** - Reconciles presence snapshots and diffs into one map
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐  commands   ┌──────────────┐   frames   ┌─────────────┐
//! │  Socket  │────────────▶│ socket task  │───────────▶│  Transport  │
//! │ Channel  │             │  (channels,  │◀───────────│ ws/longpoll │
//! └──────────┘             │   timers)    │   events   └─────────────┘
//!      ▲                   └──────────────┘
//!      │      callbacks           │
//!      └──────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use tenvis_pulse_client::{Socket, SocketOptions};
//! use tenvis_pulse_transport::WebSocketConnector;
//! use serde_json::json;
//!
//! let socket = Socket::new("ws://localhost:4000/socket", WebSocketConnector::new(), SocketOptions::default());
//! socket.connect()?;
//!
//! let channel = socket.channel("room:lobby", json!({}));
//! channel.on("new_msg", |payload| println!("{payload}"));
//! channel
//!     .join()?
//!     .receive("ok", |_| println!("joined"))
//!     .receive("error", |reason| println!("refused: {reason}"));
//!
//! channel.push("new_msg", json!({"body": "hi"}))?;
//! ```

pub mod channel;
pub mod error;
pub mod metrics;
pub mod presence;
pub mod push;
pub mod socket;
pub mod timer;

pub use channel::{Channel, ChannelId, ChannelState, EventCallback};
pub use error::ClientError;
pub use presence::{ChannelPresence, Meta, Presence, PresenceDiff, PresenceEntry, PresenceState};
pub use push::{Push, ReplyHook};
pub use socket::{Socket, SocketOptions};
pub use timer::{default_backoff, stepped_backoff, BackoffFn, RetryTimer};

pub use pulse_protocol::{Frame, Reply};
pub use tenvis_pulse_transport::{CloseEvent, ReadyState};
