//! Frame types for the Pulse protocol.
//!
//! A frame is the unit exchanged over a socket. Every frame names the topic
//! it belongs to and the event it carries; request/reply correlation uses the
//! string `ref`, and `join_ref` ties a frame to one join of a channel.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Reserved topic used for socket-level traffic such as heartbeats.
pub const PHOENIX_TOPIC: &str = "phoenix";

/// Event names with protocol meaning.
pub mod events {
    /// Liveness probe sent on [`PHOENIX_TOPIC`](super::PHOENIX_TOPIC).
    pub const HEARTBEAT: &str = "heartbeat";
    /// Join a topic.
    pub const JOIN: &str = "phx_join";
    /// Leave a topic.
    pub const LEAVE: &str = "phx_leave";
    /// Reply to a previously pushed frame, correlated by `ref`.
    pub const REPLY: &str = "phx_reply";
    /// The server closed the channel.
    pub const CLOSE: &str = "phx_close";
    /// The channel crashed server-side, or the transport dropped.
    pub const ERROR: &str = "phx_error";
}

/// Reply statuses with protocol meaning.
pub mod status {
    pub const OK: &str = "ok";
    pub const ERROR: &str = "error";
    /// Synthesized locally when no reply arrives in time.
    pub const TIMEOUT: &str = "timeout";
}

/// A protocol frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    /// Topic the frame is routed by, e.g. `room:lobby`.
    pub topic: String,
    /// Event name.
    pub event: String,
    /// Event payload.
    #[serde(default)]
    pub payload: Value,
    /// Request reference, echoed back in the matching reply.
    #[serde(rename = "ref", default)]
    pub reference: Option<String>,
    /// Reference of the join this frame belongs to.
    #[serde(default)]
    pub join_ref: Option<String>,
}

impl Frame {
    /// Create a new frame without references.
    #[must_use]
    pub fn new(topic: impl Into<String>, event: impl Into<String>, payload: Value) -> Self {
        Self {
            topic: topic.into(),
            event: event.into(),
            payload,
            reference: None,
            join_ref: None,
        }
    }

    /// Set the request reference.
    #[must_use]
    pub fn with_ref(mut self, reference: impl Into<String>) -> Self {
        self.reference = Some(reference.into());
        self
    }

    /// Set the join reference.
    #[must_use]
    pub fn with_join_ref(mut self, join_ref: impl Into<String>) -> Self {
        self.join_ref = Some(join_ref.into());
        self
    }

    /// Create a heartbeat frame.
    #[must_use]
    pub fn heartbeat(reference: impl Into<String>) -> Self {
        Self::new(PHOENIX_TOPIC, events::HEARTBEAT, Value::Object(Default::default()))
            .with_ref(reference)
    }

    /// Create a reply frame, as a server would send it.
    #[must_use]
    pub fn reply(
        topic: impl Into<String>,
        reference: impl Into<String>,
        status: &str,
        response: Value,
    ) -> Self {
        Self::new(
            topic,
            events::REPLY,
            serde_json::json!({ "status": status, "response": response }),
        )
        .with_ref(reference)
    }

    /// Whether this frame carries a channel lifecycle event.
    ///
    /// Lifecycle frames are filtered against the channel's active join
    /// reference so that events from a superseded join are discarded.
    #[must_use]
    pub fn is_lifecycle(&self) -> bool {
        is_lifecycle_event(&self.event)
    }

    /// The reference a lifecycle frame should be matched against.
    ///
    /// Servers that predate `join_ref` send the join reference in `ref`.
    #[must_use]
    pub fn lifecycle_ref(&self) -> Option<&str> {
        self.join_ref.as_deref().or(self.reference.as_deref())
    }
}

/// Whether `event` is one of the channel lifecycle events.
#[must_use]
pub fn is_lifecycle_event(event: &str) -> bool {
    matches!(
        event,
        events::CLOSE | events::ERROR | events::JOIN | events::LEAVE
    )
}

/// Payload of a `phx_reply` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    /// Reply status, e.g. `ok` or `error`.
    pub status: String,
    /// Response body.
    #[serde(default = "empty_object")]
    pub response: Value,
}

fn empty_object() -> Value {
    Value::Object(Default::default())
}

impl Reply {
    /// Create a reply.
    #[must_use]
    pub fn new(status: impl Into<String>, response: Value) -> Self {
        Self {
            status: status.into(),
            response,
        }
    }

    /// The locally synthesized reply for a push that was never answered.
    #[must_use]
    pub fn timeout() -> Self {
        Self::new(status::TIMEOUT, empty_object())
    }

    /// Decode a reply from a `phx_reply` payload.
    ///
    /// Returns `None` when the payload has no `status`.
    #[must_use]
    pub fn from_payload(payload: &Value) -> Option<Self> {
        Self::deserialize(payload).ok()
    }

    /// Whether the reply has the given status.
    #[must_use]
    pub fn is(&self, status: &str) -> bool {
        self.status == status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_frame_field_names() {
        let frame = Frame::new("room:1", "new_msg", json!({"body": "hi"}))
            .with_ref("3")
            .with_join_ref("1");
        let value = serde_json::to_value(&frame).unwrap();

        assert_eq!(
            value,
            json!({
                "topic": "room:1",
                "event": "new_msg",
                "payload": {"body": "hi"},
                "ref": "3",
                "join_ref": "1"
            })
        );
    }

    #[test]
    fn test_lifecycle_events() {
        assert!(Frame::new("t", events::CLOSE, Value::Null).is_lifecycle());
        assert!(Frame::new("t", events::ERROR, Value::Null).is_lifecycle());
        assert!(Frame::new("t", events::JOIN, Value::Null).is_lifecycle());
        assert!(Frame::new("t", events::LEAVE, Value::Null).is_lifecycle());
        assert!(!Frame::new("t", events::REPLY, Value::Null).is_lifecycle());
        assert!(!Frame::new("t", "new_msg", Value::Null).is_lifecycle());
    }

    #[test]
    fn test_lifecycle_ref_prefers_join_ref() {
        let frame = Frame::new("t", events::CLOSE, Value::Null)
            .with_ref("7")
            .with_join_ref("2");
        assert_eq!(frame.lifecycle_ref(), Some("2"));

        let legacy = Frame::new("t", events::CLOSE, Value::Null).with_ref("7");
        assert_eq!(legacy.lifecycle_ref(), Some("7"));
    }

    #[test]
    fn test_reply_from_payload() {
        let reply = Reply::from_payload(&json!({"status": "ok", "response": {"id": 4}})).unwrap();
        assert!(reply.is(status::OK));
        assert_eq!(reply.response, json!({"id": 4}));

        let bare = Reply::from_payload(&json!({"status": "error"})).unwrap();
        assert_eq!(bare.response, json!({}));

        assert!(Reply::from_payload(&json!({"response": {}})).is_none());
        assert!(Reply::from_payload(&Value::Null).is_none());
    }

    #[test]
    fn test_heartbeat_frame() {
        let frame = Frame::heartbeat("12");
        assert_eq!(frame.topic, PHOENIX_TOPIC);
        assert_eq!(frame.event, events::HEARTBEAT);
        assert_eq!(frame.reference.as_deref(), Some("12"));
        assert!(frame.join_ref.is_none());
    }
}
