//! # pulse-protocol
//!
//! Wire protocol definitions for the Pulse realtime client.
//!
//! This crate defines the frames exchanged between a Pulse client and a
//! server, the reserved topics and events, and the pluggable serializers
//! used to put frames on the wire.
//!
//! ## Frames
//!
//! Every frame carries a `topic`, an `event`, a JSON `payload` and two
//! optional references:
//!
//! - `ref` correlates a request with its `phx_reply`
//! - `join_ref` ties a frame to one join of a channel
//!
//! ## Example
//!
//! ```rust
//! use pulse_protocol::{codec, Frame};
//! use serde_json::json;
//!
//! let frame = Frame::new("room:lobby", "new_msg", json!({"body": "hi"})).with_ref("1");
//!
//! let encoded = codec::encode(&frame).unwrap();
//! let decoded = codec::decode(&encoded).unwrap();
//! assert_eq!(frame, decoded);
//! ```

pub mod codec;
pub mod frames;
pub mod version;

pub use codec::{
    decode, encode, JsonSerializer, MsgPackSerializer, ProtocolError, RawMessage, Serializer,
};
pub use frames::{events, is_lifecycle_event, status, Frame, Reply, PHOENIX_TOPIC};
pub use version::{Version, PROTOCOL_VERSION};
