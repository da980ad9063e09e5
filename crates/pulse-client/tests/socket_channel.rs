//! Socket and channel behaviour over an in-memory transport.

use parking_lot::Mutex;
use pulse_protocol::{events, Frame, PHOENIX_TOPIC};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tenvis_pulse_client::{
    Channel, ChannelState, ClientError, CloseEvent, ReadyState, Socket, SocketOptions,
};
use tenvis_pulse_transport::{MemoryConnector, MemoryRemote};

const ENDPOINT: &str = "ws://example.test/socket";

fn options() -> SocketOptions {
    SocketOptions {
        reconnect_after: Arc::new(|_| Duration::from_millis(100)),
        rejoin_after: Arc::new(|_| Duration::from_millis(100)),
        ..SocketOptions::default()
    }
}

async fn settle() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}

async fn advance(ms: u64) {
    tokio::time::advance(Duration::from_millis(ms)).await;
    settle().await;
}

async fn connected(options: SocketOptions) -> (Socket, MemoryRemote) {
    let (connector, remote) = MemoryConnector::new();
    let socket = Socket::new(ENDPOINT, connector, options);
    socket.connect().unwrap();
    settle().await;
    remote.open();
    settle().await;
    assert!(socket.is_connected());
    (socket, remote)
}

async fn joined(socket: &Socket, remote: &MemoryRemote, topic: &str) -> Channel {
    let channel = socket.channel(topic, json!({}));
    channel.join().unwrap();
    settle().await;
    let join = remote
        .take_sent_frames()
        .into_iter()
        .rfind(|frame| frame.event == events::JOIN)
        .unwrap();
    let reference = join.reference.unwrap();
    remote.deliver_frame(&Frame::reply(topic, reference, "ok", json!({})));
    settle().await;
    assert_eq!(channel.state(), ChannelState::Joined);
    channel
}

fn counter() -> (Arc<AtomicUsize>, impl Fn() + Send + Sync + 'static) {
    let count = Arc::new(AtomicUsize::new(0));
    let c = Arc::clone(&count);
    (count, move || {
        c.fetch_add(1, Ordering::SeqCst);
    })
}

#[tokio::test(start_paused = true)]
async fn test_connect_uses_endpoint_url() {
    let (connector, remote) = MemoryConnector::new();
    let socket = Socket::new(
        ENDPOINT,
        connector,
        SocketOptions {
            params: json!({"token": "secret"}),
            ..options()
        },
    );
    assert_eq!(
        socket.endpoint_url(),
        "ws://example.test/socket/websocket?token=secret&vsn=1.0.0"
    );
    assert_eq!(socket.connection_state(), ReadyState::Closed);

    socket.connect().unwrap();
    settle().await;
    assert_eq!(socket.connection_state(), ReadyState::Connecting);
    assert_eq!(remote.endpoint().as_deref(), Some(socket.endpoint_url()));

    // A second connect while connecting is ignored.
    socket.connect().unwrap();
    settle().await;
    assert_eq!(remote.connections(), 1);

    remote.open();
    settle().await;
    assert_eq!(socket.connection_state(), ReadyState::Open);
}

#[tokio::test(start_paused = true)]
async fn test_join_and_push_round_trip() {
    let (socket, remote) = connected(options()).await;
    let channel = socket.channel("room:1", json!({"token": "t"}));
    let join = channel.join().unwrap();
    settle().await;

    let sent = remote.take_sent_frames();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].event, events::JOIN);
    assert_eq!(sent[0].payload, json!({"token": "t"}));
    assert_eq!(sent[0].reference.as_deref(), Some("1"));
    assert_eq!(sent[0].join_ref.as_deref(), Some("1"));
    assert_eq!(channel.state(), ChannelState::Joining);

    remote.deliver_frame(&Frame::reply("room:1", "1", "ok", json!({"welcome": true})));
    settle().await;
    assert_eq!(channel.state(), ChannelState::Joined);
    assert_eq!(join.reply().await.response, json!({"welcome": true}));

    let push = channel.push("new_msg", json!({"body": "hi"})).unwrap();
    settle().await;
    let sent = remote.take_sent_frames();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].event, "new_msg");
    assert_eq!(sent[0].reference.as_deref(), Some("2"));
    assert_eq!(sent[0].join_ref.as_deref(), Some("1"));
    assert!(push.is_sent());

    remote.deliver_frame(&Frame::reply("room:1", "2", "ok", json!({"id": 7})));
    settle().await;
    let reply = push.reply().await;
    assert!(reply.is("ok"));
    assert_eq!(reply.response, json!({"id": 7}));
}

#[tokio::test(start_paused = true)]
async fn test_push_timeout_fires_only_timeout_hooks() {
    let (socket, remote) = connected(options()).await;
    let channel = joined(&socket, &remote, "room:1").await;

    let (oks, ok) = counter();
    let (errors, error) = counter();
    let (timeouts, timeout) = counter();
    let push = channel
        .push_with_timeout("slow", json!({}), Duration::from_millis(10))
        .unwrap();
    push.receive("ok", move |_| ok())
        .receive("error", move |_| error())
        .receive("timeout", move |_| timeout());
    settle().await;

    advance(9).await;
    assert_eq!(timeouts.load(Ordering::SeqCst), 0);
    advance(1).await;
    assert_eq!(timeouts.load(Ordering::SeqCst), 1);

    // A reply arriving after the timeout is ignored.
    remote.deliver_frame(&Frame::reply("room:1", "2", "ok", json!({})));
    settle().await;
    assert_eq!(oks.load(Ordering::SeqCst), 0);
    assert_eq!(errors.load(Ordering::SeqCst), 0);
    assert!(push.received().unwrap().is("timeout"));
}

#[tokio::test(start_paused = true)]
async fn test_error_rejoins_once_and_flushes_buffer_in_order() {
    let (socket, remote) = connected(options()).await;
    let channel = joined(&socket, &remote, "room:1").await;

    let (errors, on_error) = counter();
    channel.on_error(move |_| on_error());

    remote.deliver_frame(&Frame::new("room:1", events::ERROR, json!({})).with_join_ref("1"));
    settle().await;
    assert_eq!(channel.state(), ChannelState::Errored);
    assert_eq!(errors.load(Ordering::SeqCst), 1);

    let first = channel.push("a", json!({"n": 1})).unwrap();
    let second = channel.push("b", json!({"n": 2})).unwrap();
    settle().await;
    assert!(remote.take_sent_frames().is_empty());
    assert!(!first.is_sent());

    advance(99).await;
    assert!(remote.sent_frames().is_empty());
    advance(1).await;
    let sent = remote.take_sent_frames();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].event, events::JOIN);
    let rejoin_ref = sent[0].reference.clone().unwrap();
    assert_eq!(channel.state(), ChannelState::Joining);

    // No further attempt while the rejoin is in flight.
    advance(1_000).await;
    assert!(remote.sent_frames().is_empty());

    remote.deliver_frame(&Frame::reply("room:1", rejoin_ref.clone(), "ok", json!({})));
    settle().await;
    assert_eq!(channel.state(), ChannelState::Joined);

    let sent = remote.take_sent_frames();
    let kinds: Vec<&str> = sent.iter().map(|f| f.event.as_str()).collect();
    assert_eq!(kinds, vec!["a", "b"]);
    assert!(sent
        .iter()
        .all(|f| f.join_ref.as_deref() == Some(rejoin_ref.as_str())));
    assert!(first.is_sent() && second.is_sent());
}

#[tokio::test(start_paused = true)]
async fn test_push_before_join_is_rejected() {
    let (socket, remote) = connected(options()).await;
    let channel = socket.channel("room:1", json!({}));

    let err = channel.push("new_msg", json!({})).unwrap_err();
    assert_eq!(
        err,
        ClientError::PushBeforeJoin {
            topic: "room:1".into(),
            event: "new_msg".into()
        }
    );
    settle().await;
    assert!(remote.sent().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_join_twice_is_rejected() {
    let (socket, _remote) = connected(options()).await;
    let channel = socket.channel("room:1", json!({}));
    channel.join().unwrap();
    assert_eq!(
        channel.join().unwrap_err(),
        ClientError::AlreadyJoined {
            topic: "room:1".into()
        }
    );
}

#[tokio::test(start_paused = true)]
async fn test_push_buffered_before_connect_goes_out_after_join() {
    let (connector, remote) = MemoryConnector::new();
    let socket = Socket::new(ENDPOINT, connector, options());
    let channel = socket.channel("room:1", json!({}));
    channel.join().unwrap();
    channel.push("early", json!({"n": 1})).unwrap();
    settle().await;

    socket.connect().unwrap();
    settle().await;
    remote.open();
    settle().await;

    let sent = remote.take_sent_frames();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].event, events::JOIN);
    let join_ref = sent[0].reference.clone().unwrap();

    remote.deliver_frame(&Frame::reply("room:1", join_ref.clone(), "ok", json!({})));
    settle().await;
    let sent = remote.take_sent_frames();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].event, "early");
    assert_eq!(sent[0].join_ref, Some(join_ref));
}

#[tokio::test(start_paused = true)]
async fn test_send_buffer_flushes_in_order_once() {
    let (connector, remote) = MemoryConnector::new();
    let socket = Socket::new(ENDPOINT, connector, options());
    let first = socket.channel("room:1", json!({}));
    let second = socket.channel("room:2", json!({}));
    first.join().unwrap();
    second.join().unwrap();
    settle().await;

    socket.connect().unwrap();
    settle().await;
    remote.open();
    settle().await;

    let topics: Vec<String> = remote.take_sent_frames().into_iter().map(|f| f.topic).collect();
    assert_eq!(topics, vec!["room:1", "room:2"]);

    settle().await;
    assert!(remote.sent_frames().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_leave_while_disconnected_closes_immediately() {
    let (socket, remote) = connected(options()).await;
    let channel = joined(&socket, &remote, "room:1").await;
    let (messages, on_message) = counter();
    channel.on("new_msg", move |_| on_message());

    remote.close(CloseEvent::abnormal("network down"));
    settle().await;
    assert_eq!(channel.state(), ChannelState::Errored);

    let leave = channel.leave();
    settle().await;
    assert_eq!(channel.state(), ChannelState::Closed);
    assert!(leave.received().unwrap().is("ok"));

    // The reconnect does not bring the channel back.
    advance(100).await;
    assert_eq!(remote.connections(), 2);
    remote.open();
    settle().await;
    assert!(remote.sent_frames().is_empty());

    remote.deliver_frame(&Frame::new("room:1", "new_msg", json!({})));
    settle().await;
    assert_eq!(messages.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn test_leave_while_joined_waits_for_reply() {
    let (socket, remote) = connected(options()).await;
    let channel = joined(&socket, &remote, "room:1").await;
    let (closes, on_close) = counter();
    channel.on_close(move |_| on_close());

    let leave = channel.leave();
    settle().await;
    assert_eq!(channel.state(), ChannelState::Leaving);
    let sent = remote.take_sent_frames();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].event, events::LEAVE);
    assert_eq!(sent[0].join_ref.as_deref(), Some("1"));

    remote.deliver_frame(&Frame::reply("room:1", sent[0].reference.clone().unwrap(), "ok", json!({})));
    settle().await;
    assert_eq!(channel.state(), ChannelState::Closed);
    assert_eq!(closes.load(Ordering::SeqCst), 1);
    assert!(leave.received().unwrap().is("ok"));
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_topic_join_leaves_earlier_channel() {
    let (socket, remote) = connected(options()).await;
    let first = joined(&socket, &remote, "room:1").await;

    let second = socket.channel("room:1", json!({}));
    second.join().unwrap();
    settle().await;

    let sent = remote.take_sent_frames();
    let kinds: Vec<&str> = sent.iter().map(|f| f.event.as_str()).collect();
    assert_eq!(kinds, vec![events::LEAVE, events::JOIN]);
    assert_eq!(first.state(), ChannelState::Leaving);
    assert_eq!(second.state(), ChannelState::Joining);

    remote.deliver_frame(&Frame::reply("room:1", sent[0].reference.clone().unwrap(), "ok", json!({})));
    remote.deliver_frame(&Frame::reply("room:1", sent[1].reference.clone().unwrap(), "ok", json!({})));
    settle().await;
    assert_eq!(first.state(), ChannelState::Closed);
    assert_eq!(second.state(), ChannelState::Joined);
}

#[tokio::test(start_paused = true)]
async fn test_stale_join_ref_frames_are_ignored() {
    let (socket, remote) = connected(options()).await;
    let channel = joined(&socket, &remote, "room:1").await;

    remote.deliver_frame(&Frame::new("room:1", events::CLOSE, json!({})).with_join_ref("999"));
    remote.deliver_frame(&Frame::new("room:1", events::ERROR, json!({})).with_join_ref("999"));
    settle().await;
    assert_eq!(channel.state(), ChannelState::Joined);
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_heartbeat_forces_reconnect() {
    let (socket, remote) = connected(SocketOptions {
        heartbeat_interval: Duration::from_secs(1),
        ..options()
    })
    .await;
    let closes = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&closes);
    socket.on_close(move |close| seen.lock().push(close.clone()));
    settle().await;

    advance(1_000).await;
    let sent = remote.take_sent_frames();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].topic, PHOENIX_TOPIC);
    assert_eq!(sent[0].event, events::HEARTBEAT);

    advance(1_000).await;
    let expected = CloseEvent::new(1000, "heartbeat timeout");
    assert_eq!(remote.closed_by_client(), Some(expected.clone()));
    assert_eq!(*closes.lock(), vec![expected]);
    assert_eq!(socket.connection_state(), ReadyState::Closed);

    advance(100).await;
    assert_eq!(remote.connections(), 2);
    remote.open();
    settle().await;
    assert!(socket.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_answered_heartbeat_keeps_connection() {
    let (socket, remote) = connected(SocketOptions {
        heartbeat_interval: Duration::from_secs(1),
        ..options()
    })
    .await;

    for _ in 0..3 {
        advance(1_000).await;
        let heartbeat = remote.take_sent_frames().pop().unwrap();
        assert_eq!(heartbeat.event, events::HEARTBEAT);
        remote.deliver_frame(&Frame::reply(
            PHOENIX_TOPIC,
            heartbeat.reference.unwrap(),
            "ok",
            json!({}),
        ));
        settle().await;
    }

    assert_eq!(remote.connections(), 1);
    assert!(remote.closed_by_client().is_none());
    assert!(socket.is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_transport_close_reconnects_and_rejoins() {
    let (socket, remote) = connected(options()).await;
    let channel = joined(&socket, &remote, "room:1").await;

    remote.close(CloseEvent::abnormal("reset by peer"));
    settle().await;
    assert_eq!(socket.connection_state(), ReadyState::Closed);
    assert_eq!(channel.state(), ChannelState::Errored);

    advance(100).await;
    assert_eq!(remote.connections(), 2);
    remote.open();
    settle().await;

    let sent = remote.take_sent_frames();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].event, events::JOIN);
    remote.deliver_frame(&Frame::reply("room:1", sent[0].reference.clone().unwrap(), "ok", json!({})));
    settle().await;
    assert_eq!(channel.state(), ChannelState::Joined);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_does_not_reconnect() {
    let (socket, remote) = connected(options()).await;
    let channel = joined(&socket, &remote, "room:1").await;

    socket.disconnect(Some(1000), Some("bye")).unwrap();
    settle().await;
    assert_eq!(remote.closed_by_client(), Some(CloseEvent::new(1000, "bye")));
    assert_eq!(socket.connection_state(), ReadyState::Closed);
    assert_eq!(channel.state(), ChannelState::Errored);

    advance(20_000).await;
    assert_eq!(remote.connections(), 1);

    socket.connect().unwrap();
    settle().await;
    remote.open();
    settle().await;
    let sent = remote.take_sent_frames();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].event, events::JOIN);
}

#[tokio::test(start_paused = true)]
async fn test_socket_hooks_and_bad_messages() {
    let (connector, remote) = MemoryConnector::new();
    let socket = Socket::new(ENDPOINT, connector, options());
    let (opens, on_open) = counter();
    let (errors, on_error) = counter();
    let frames = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&frames);
    socket.on_open(on_open);
    socket.on_error(move |_| on_error());
    socket.on_message(move |frame| seen.lock().push(frame.event.clone()));

    socket.connect().unwrap();
    settle().await;
    remote.open();
    settle().await;
    assert_eq!(opens.load(Ordering::SeqCst), 1);

    remote.deliver("not a frame");
    remote.deliver_frame(&Frame::new("room:9", "ping", json!({})));
    settle().await;
    assert_eq!(*frames.lock(), vec!["ping".to_string()]);
    assert!(socket.is_connected());

    remote.error("boom");
    settle().await;
    assert_eq!(errors.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_dropping_handles_closes_transport() {
    let (socket, remote) = connected(options()).await;
    let channel = socket.channel("room:1", json!({}));
    drop(socket);
    settle().await;
    assert!(remote.closed_by_client().is_none());

    drop(channel);
    settle().await;
    assert!(remote.closed_by_client().is_some());
}

#[tokio::test(start_paused = true)]
async fn test_binding_applies_to_frame_delivered_right_after() {
    let (socket, remote) = connected(options()).await;
    let channel = joined(&socket, &remote, "room:1").await;

    for n in 0..20 {
        let event = format!("tick:{n}");
        let (hits, on_tick) = counter();
        channel.on(&event, move |_| on_tick());
        remote.deliver_frame(&Frame::new("room:1", event.as_str(), json!({})));
        settle().await;
        assert_eq!(hits.load(Ordering::SeqCst), 1, "binding missed {event}");
    }
}

#[tokio::test(start_paused = true)]
async fn test_transport_error_alone_keeps_reconnect_backoff() {
    let options = SocketOptions {
        reconnect_after: Arc::new(|attempt| Duration::from_millis(100 * u64::from(attempt))),
        ..options()
    };
    let (socket, remote) = connected(options).await;

    remote.error("post timed out");
    settle().await;
    advance(1_000).await;
    assert_eq!(remote.connections(), 1);
    assert!(socket.is_connected());

    remote.close(CloseEvent::abnormal("gone"));
    settle().await;
    advance(99).await;
    assert_eq!(remote.connections(), 1);
    advance(1).await;
    assert_eq!(remote.connections(), 2);
}
