//! A subscription session: one socket, one channel per configured topic.
//!
//! Channel events are written to stdout as JSON lines; connection and
//! presence changes go to the log.

use anyhow::{bail, Context, Result};
use pulse_protocol::{events, Frame, PHOENIX_TOPIC};
use serde_json::json;
use std::time::Duration;
use tenvis_pulse_client::{Channel, ChannelPresence, Socket};
use tenvis_pulse_transport::{LongPollConnector, WebSocketConnector};
use tracing::{debug, info, warn};

use crate::config::{Config, TransportKind};
use crate::metrics;

/// How long to wait for each leave to be acknowledged on shutdown.
const LEAVE_GRACE: Duration = Duration::from_secs(2);

/// Render an inbound frame as an output line, or `None` if it is protocol
/// traffic rather than a channel event.
#[must_use]
pub fn render(frame: &Frame) -> Option<String> {
    if frame.topic == PHOENIX_TOPIC || frame.event == events::REPLY {
        return None;
    }
    let line = json!({
        "topic": frame.topic,
        "event": frame.event,
        "payload": frame.payload,
    });
    Some(line.to_string())
}

fn open_socket(config: &Config) -> Socket {
    let options = config.socket_options();
    match config.transport {
        TransportKind::Websocket => Socket::new(&config.endpoint, WebSocketConnector::new(), options),
        TransportKind::Longpoll => Socket::new(&config.endpoint, LongPollConnector::reqwest(), options),
    }
}

fn track_presence(channel: &Channel) -> ChannelPresence {
    let presence = ChannelPresence::new(channel);
    let topic = channel.topic().to_string();

    let t = topic.clone();
    presence.on_join(move |key, previous, joined| {
        if previous.is_none() {
            info!(topic = %t, key = %key, "Presence joined");
        } else {
            debug!(topic = %t, key = %key, metas = joined.metas.len(), "Presence added metas");
        }
    });
    let t = topic.clone();
    presence.on_leave(move |key, remaining, _left| {
        if remaining.is_empty() {
            info!(topic = %t, key = %key, "Presence left");
        } else {
            debug!(topic = %t, key = %key, remaining = remaining.metas.len(), "Presence removed metas");
        }
    });
    presence.on_change(move |current, _previous| {
        metrics::record_presence_change(&topic);
        debug!(topic = %topic, present = current.len(), "Presence synced");
    });
    presence
}

/// Connect, join every topic and print events until interrupted.
///
/// # Errors
///
/// Returns an error if no topics are configured or the socket task dies.
pub async fn run(config: Config) -> Result<()> {
    if config.topics.is_empty() {
        bail!("No topics to join; pass them as arguments, set PULSE_TOPICS or list them in the config file");
    }

    let socket = open_socket(&config);
    info!(url = %socket.endpoint_url(), "Starting subscriber");

    socket.on_open(|| info!("Socket open"));
    socket.on_close(|close| warn!(code = close.code, reason = %close.reason, "Socket closed"));
    socket.on_error(|error| warn!(error = %error, "Socket error"));
    socket.on_message(|frame| {
        if let Some(line) = render(frame) {
            metrics::record_event(&frame.topic);
            println!("{line}");
        }
    });

    let mut channels = Vec::with_capacity(config.topics.len());
    let mut presences = Vec::new();
    for topic in &config.topics {
        let channel = socket.channel(topic, config.join_params.clone());
        if config.presence {
            presences.push(track_presence(&channel));
        }

        let (ok, error, timeout) = (topic.clone(), topic.clone(), topic.clone());
        channel
            .join()
            .with_context(|| format!("Failed to join {topic}"))?
            .receive("ok", move |_| info!(topic = %ok, "Joined"))
            .receive("error", move |reason| warn!(topic = %error, reason = %reason, "Join refused"))
            .receive("timeout", move |_| warn!(topic = %timeout, "Join timed out, retrying"));
        channels.push(channel);
    }

    socket.connect().context("Socket task stopped")?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;
    info!("Shutting down");

    for channel in &channels {
        let leave = channel.leave();
        if tokio::time::timeout(LEAVE_GRACE, leave.reply()).await.is_err() {
            debug!(topic = %channel.topic(), "Leave not acknowledged");
        }
    }
    socket.disconnect(None, None).context("Socket task stopped")?;
    Ok(())
}
