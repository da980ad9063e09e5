//! WebSocket transport against a local tungstenite server.

#![cfg(feature = "websocket")]

use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tenvis_pulse_transport::{
    Connector, EventReceiver, ReadyState, TransportEvent, WebSocketConfig, WebSocketConnector,
    CLOSE_ABNORMAL,
};
use tokio::net::TcpListener;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use pulse_protocol::RawMessage;

async fn next_event(rx: &mut EventReceiver) -> TransportEvent {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for transport event")
        .expect("event stream ended")
}

/// Echo server that closes after `limit` messages.
async fn spawn_echo(limit: usize) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        let mut seen = 0;
        while let Some(Ok(msg)) = ws.next().await {
            if msg.is_text() || msg.is_binary() {
                ws.send(msg).await.unwrap();
                seen += 1;
                if seen == limit {
                    break;
                }
            }
        }
        // Drop without a close frame.
    });
    format!("ws://{addr}/socket/websocket")
}

#[tokio::test]
async fn test_open_echo_and_abnormal_close() {
    let url = spawn_echo(2).await;
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let mut transport = WebSocketConnector::new().connect(&url, tx);

    assert_eq!(next_event(&mut rx).await, TransportEvent::Open);
    assert_eq!(transport.ready_state(), ReadyState::Open);

    transport.send(RawMessage::from("ping")).unwrap();
    assert_eq!(
        next_event(&mut rx).await,
        TransportEvent::Message(RawMessage::from("ping"))
    );

    transport
        .send(RawMessage::Binary(bytes::Bytes::from_static(b"\x01\x02")))
        .unwrap();
    assert!(matches!(
        next_event(&mut rx).await,
        TransportEvent::Message(RawMessage::Binary(_))
    ));

    loop {
        match next_event(&mut rx).await {
            TransportEvent::Close(close) => {
                assert_eq!(close.code, CLOSE_ABNORMAL);
                break;
            }
            TransportEvent::Error(_) => {}
            other => panic!("unexpected event {other:?}"),
        }
    }
    assert_eq!(transport.ready_state(), ReadyState::Closed);
}

#[tokio::test]
async fn test_client_close_reports_code() {
    let url = spawn_echo(usize::MAX).await;
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let mut transport = WebSocketConnector::new().connect(&url, tx);
    assert_eq!(next_event(&mut rx).await, TransportEvent::Open);

    transport.close(Some(1000), Some("bye"));
    match next_event(&mut rx).await {
        TransportEvent::Close(close) => {
            assert_eq!(close.code, 1000);
            assert_eq!(close.reason, "bye");
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn test_connect_failure_reports_error_then_close() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let transport = WebSocketConnector::new().connect(&format!("ws://{addr}/websocket"), tx);

    assert!(matches!(next_event(&mut rx).await, TransportEvent::Error(_)));
    assert!(matches!(next_event(&mut rx).await, TransportEvent::Close(c) if c.code == CLOSE_ABNORMAL));
    assert_eq!(transport.ready_state(), ReadyState::Closed);
}

#[tokio::test]
async fn test_oversized_message_is_skipped_silently() {
    let url = spawn_echo(usize::MAX).await;
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let connector = WebSocketConnector::with_config(WebSocketConfig {
        max_message_size: 8,
    });
    let mut transport = connector.connect(&url, tx);
    assert_eq!(next_event(&mut rx).await, TransportEvent::Open);

    transport.send(RawMessage::from("far too long for the limit")).unwrap();
    transport.send(RawMessage::from("small")).unwrap();

    assert_eq!(
        next_event(&mut rx).await,
        TransportEvent::Message(RawMessage::from("small"))
    );
    assert_eq!(transport.ready_state(), ReadyState::Open);
}
