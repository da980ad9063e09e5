//! Client metrics.
//!
//! Recorded through the `metrics` facade; nothing is exported unless the
//! application installs a recorder.

use metrics::{counter, gauge};

/// Metric names.
pub mod names {
    pub const FRAMES_RECEIVED: &str = "pulse_client_frames_received_total";
    pub const FRAMES_SENT: &str = "pulse_client_frames_sent_total";
    pub const BYTES_RECEIVED: &str = "pulse_client_bytes_received_total";
    pub const BYTES_SENT: &str = "pulse_client_bytes_sent_total";
    pub const DECODE_FAILURES: &str = "pulse_client_decode_failures_total";
    pub const RECONNECTS: &str = "pulse_client_reconnects_total";
    pub const HEARTBEAT_TIMEOUTS: &str = "pulse_client_heartbeat_timeouts_total";
    pub const REJOINS: &str = "pulse_client_rejoins_total";
    pub const PUSH_TIMEOUTS: &str = "pulse_client_push_timeouts_total";
    pub const CONNECTED: &str = "pulse_client_connected";
    pub const SEND_BUFFER: &str = "pulse_client_send_buffer_frames";
}

/// Register descriptions for every client metric.
pub fn describe() {
    metrics::describe_counter!(names::FRAMES_RECEIVED, "Frames decoded from the transport");
    metrics::describe_counter!(names::FRAMES_SENT, "Frames written to the transport");
    metrics::describe_counter!(names::BYTES_RECEIVED, "Bytes received from the transport");
    metrics::describe_counter!(names::BYTES_SENT, "Bytes written to the transport");
    metrics::describe_counter!(
        names::DECODE_FAILURES,
        "Inbound messages dropped because they could not be decoded"
    );
    metrics::describe_counter!(names::RECONNECTS, "Reconnect attempts");
    metrics::describe_counter!(
        names::HEARTBEAT_TIMEOUTS,
        "Connections closed because a heartbeat went unanswered"
    );
    metrics::describe_counter!(names::REJOINS, "Channel rejoin attempts");
    metrics::describe_counter!(names::PUSH_TIMEOUTS, "Pushes that timed out without a reply");
    metrics::describe_gauge!(names::CONNECTED, "1 while the socket is open, 0 otherwise");
    metrics::describe_gauge!(names::SEND_BUFFER, "Frames waiting for the transport to open");
}

pub(crate) fn record_frame_received(bytes: usize) {
    counter!(names::FRAMES_RECEIVED).increment(1);
    counter!(names::BYTES_RECEIVED).increment(bytes as u64);
}

pub(crate) fn record_frame_sent(bytes: usize) {
    counter!(names::FRAMES_SENT).increment(1);
    counter!(names::BYTES_SENT).increment(bytes as u64);
}

pub(crate) fn record_decode_failure() {
    counter!(names::DECODE_FAILURES).increment(1);
}

pub(crate) fn record_reconnect() {
    counter!(names::RECONNECTS).increment(1);
}

pub(crate) fn record_heartbeat_timeout() {
    counter!(names::HEARTBEAT_TIMEOUTS).increment(1);
}

pub(crate) fn record_rejoin() {
    counter!(names::REJOINS).increment(1);
}

pub(crate) fn record_push_timeout() {
    counter!(names::PUSH_TIMEOUTS).increment(1);
}

pub(crate) fn set_connected(connected: bool) {
    gauge!(names::CONNECTED).set(if connected { 1.0 } else { 0.0 });
}

pub(crate) fn set_send_buffer(frames: usize) {
    gauge!(names::SEND_BUFFER).set(frames as f64);
}
