//! Fixtures shared by the Pulse client benchmarks.

use pulse_protocol::Frame;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tenvis_pulse_client::{
    Channel, ChannelState, Meta, PresenceDiff, PresenceEntry, PresenceState, Socket, SocketOptions,
};
use tenvis_pulse_transport::{MemoryConnector, MemoryRemote};

/// A presence map of `users` keys with `metas` metas each.
#[must_use]
pub fn presence_state(users: usize, metas: usize) -> PresenceState {
    (0..users)
        .map(|user| {
            let entry = PresenceEntry::new(
                (0..metas)
                    .map(|n| Meta::new(format!("{user}.{n}"), json!({"online_at": 1_700_000_000 + n})))
                    .collect(),
            );
            (format!("user:{user}"), entry)
        })
        .collect()
}

/// A diff against [`presence_state`]`(users, _)`: one new meta for every
/// even user and the first meta of every odd user leaving.
#[must_use]
pub fn presence_diff(users: usize) -> PresenceDiff {
    let mut joins = PresenceState::new();
    let mut leaves = PresenceState::new();
    for user in 0..users {
        let key = format!("user:{user}");
        if user % 2 == 0 {
            joins.insert(key, PresenceEntry::new(vec![Meta::new(format!("{user}.new"), json!({}))]));
        } else {
            leaves.insert(key, PresenceEntry::new(vec![Meta::new(format!("{user}.0"), json!({}))]));
        }
    }
    PresenceDiff { joins, leaves }
}

/// A broadcast event on `topic`.
#[must_use]
pub fn channel_event(topic: &str, seq: usize) -> Frame {
    Frame::new(topic, "new_msg", json!({"body": "hello", "seq": seq}))
}

/// A socket over an in-memory transport with one joined channel per topic.
pub struct Fixture {
    pub socket: Socket,
    pub remote: MemoryRemote,
    pub channels: Vec<Channel>,
    /// Number of `new_msg` events dispatched to bindings.
    pub received: Arc<AtomicUsize>,
}

impl Fixture {
    /// Connect and join every topic. Must run inside a tokio runtime.
    pub async fn joined(topics: &[&str]) -> Self {
        let (connector, remote) = MemoryConnector::new();
        let socket = Socket::new("ws://bench.local/socket", connector.without_heartbeat(), SocketOptions::default());
        socket.connect().ok();
        settle().await;
        remote.open();
        settle().await;

        let received = Arc::new(AtomicUsize::new(0));
        let mut channels = Vec::with_capacity(topics.len());
        for topic in topics {
            let channel = socket.channel(topic, json!({}));
            let counter = Arc::clone(&received);
            channel.on("new_msg", move |_| {
                counter.fetch_add(1, Ordering::Relaxed);
            });
            channel.join().ok();
            channels.push(channel);
        }

        while channels.iter().any(|c| c.state() != ChannelState::Joined) {
            settle().await;
            for frame in remote.take_sent_frames() {
                if let Some(reference) = frame.reference {
                    remote.deliver_frame(&Frame::reply(frame.topic, reference, "ok", json!({})));
                }
            }
        }

        Self {
            socket,
            remote,
            channels,
            received,
        }
    }

    /// Wait until `count` events have been dispatched in total.
    pub async fn wait_for(&self, count: usize) {
        while self.received.load(Ordering::Relaxed) < count {
            tokio::task::yield_now().await;
        }
    }
}

/// Let the socket task drain its queues.
pub async fn settle() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}
