//! The socket: one transport connection shared by many channels.
//!
//! [`Socket::new`] spawns a task that owns every piece of mutable state: the
//! transport, the reference counter, the channels, the send buffer and the
//! heartbeat and reconnect timers. [`Socket`] and [`Channel`] handles talk to
//! it over an unbounded command queue, so nothing they do blocks. Timers and
//! transports only hold weak senders; the task exits once the last handle is
//! dropped.

use pulse_protocol::{
    events, status, Frame, JsonSerializer, RawMessage, Reply, Serializer, PROTOCOL_VERSION,
};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tenvis_pulse_transport::{
    append_params, CloseEvent, Connector, EventReceiver, ReadyState, Transport, TransportEvent,
    CLOSE_NORMAL,
};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::channel::{Channel, ChannelCore, ChannelId, ChannelState, EventCallback};
use crate::error::ClientError;
use crate::metrics;
use crate::push::{Outbound, Push};
use crate::timer::{default_backoff, BackoffFn, RetryTimer};

/// Default push timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default heartbeat interval.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Reason given when a connection is closed for a missed heartbeat.
pub const HEARTBEAT_TIMEOUT_REASON: &str = "heartbeat timeout";

/// Socket configuration.
#[derive(Clone)]
pub struct SocketOptions {
    /// Default timeout for pushes, inherited by channels.
    pub timeout: Duration,
    /// Interval between heartbeats.
    pub heartbeat_interval: Duration,
    /// Delay before each reconnect attempt.
    pub reconnect_after: BackoffFn,
    /// Delay before each channel rejoin attempt.
    pub rejoin_after: BackoffFn,
    /// Parameters sent in the endpoint query string.
    pub params: Value,
    /// Frame encoding.
    pub serializer: Arc<dyn Serializer>,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            reconnect_after: default_backoff(),
            rejoin_after: default_backoff(),
            params: Value::Object(Default::default()),
            serializer: Arc::new(JsonSerializer),
        }
    }
}

impl fmt::Debug for SocketOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketOptions")
            .field("timeout", &self.timeout)
            .field("heartbeat_interval", &self.heartbeat_interval)
            .field("params", &self.params)
            .field("serializer", &self.serializer.name())
            .finish_non_exhaustive()
    }
}

/// Build the URL a connector is given: endpoint, transport path, params and
/// protocol version.
#[must_use]
pub fn endpoint_url(endpoint: &str, connector: &dyn Connector, params: &Value) -> String {
    let base = format!(
        "{}{}",
        endpoint.trim_end_matches('/'),
        connector.endpoint_path()
    );
    append_params(
        &append_params(&base, params),
        &serde_json::json!({ "vsn": PROTOCOL_VERSION.to_string() }),
    )
}

type OpenHook = Arc<dyn Fn() + Send + Sync>;
type CloseHook = Arc<dyn Fn(&CloseEvent) + Send + Sync>;
type ErrorHook = Arc<dyn Fn(&str) + Send + Sync>;
type MessageHook = Arc<dyn Fn(&Frame) + Send + Sync>;

pub(crate) enum SocketHook {
    Open(OpenHook),
    Close(CloseHook),
    Error(ErrorHook),
    Message(MessageHook),
}

/// Work for the socket task.
pub(crate) enum Command {
    Connect,
    Disconnect {
        code: Option<u16>,
        reason: Option<String>,
    },
    AddChannel {
        id: ChannelId,
        topic: String,
        join_push: Push,
        state: watch::Sender<ChannelState>,
    },
    Join {
        channel: ChannelId,
        timeout: Duration,
    },
    Push {
        channel: ChannelId,
        push: Push,
    },
    Leave {
        channel: ChannelId,
        push: Push,
    },
    Bind {
        channel: ChannelId,
        event: String,
        callback: EventCallback,
    },
    Unbind {
        channel: ChannelId,
        event: String,
    },
    Hook(SocketHook),
    Heartbeat,
    Reconnect,
    Rejoin(ChannelId),
    PushTimeout {
        channel: ChannelId,
        push: Push,
        reference: String,
    },
}

/// Handle to a socket. Cloning yields another handle to the same socket.
#[derive(Clone)]
pub struct Socket {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ReadyState>,
    endpoint_url: Arc<str>,
    timeout: Duration,
    next_channel: Arc<AtomicU64>,
}

impl Socket {
    /// Create a socket and spawn its task. Does not connect.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(endpoint: &str, connector: impl Connector + 'static, options: SocketOptions) -> Self {
        let connector: Arc<dyn Connector> = Arc::new(connector);
        let url = endpoint_url(endpoint, connector.as_ref(), &options.params);
        let (commands, rx) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(ReadyState::Closed);

        let weak = commands.downgrade();
        let reconnect_tx = weak.clone();
        let reconnect = RetryTimer::new(
            move || post(&reconnect_tx, Command::Reconnect),
            Arc::clone(&options.reconnect_after),
        );

        let runner = Runner {
            core: SocketCore {
                endpoint_url: url.clone(),
                connector,
                serializer: Arc::clone(&options.serializer),
                heartbeat_interval: options.heartbeat_interval,
                conn: None,
                events: None,
                close_seen: false,
                state: ReadyState::Closed,
                state_tx,
                reference: 0,
                send_buffer: VecDeque::new(),
                heartbeat_ref: None,
                heartbeat: None,
                reconnect,
                commands: weak,
            },
            channels: HashMap::new(),
            rejoin_after: options.rejoin_after,
            hooks: Hooks::default(),
        };
        tokio::spawn(runner.run(rx));

        Self {
            commands,
            state,
            endpoint_url: Arc::from(url),
            timeout: options.timeout,
            next_channel: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Open the transport. Does nothing while a connection is live.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::SocketClosed`] if the socket task is gone.
    pub fn connect(&self) -> Result<(), ClientError> {
        self.send(Command::Connect)
    }

    /// Close the transport without reconnecting.
    ///
    /// Channels are errored so a later [`connect`](Self::connect) rejoins them.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::SocketClosed`] if the socket task is gone.
    pub fn disconnect(&self, code: Option<u16>, reason: Option<&str>) -> Result<(), ClientError> {
        self.send(Command::Disconnect {
            code,
            reason: reason.map(str::to_string),
        })
    }

    /// Create a channel for `topic`. Nothing is sent until it is joined.
    pub fn channel(&self, topic: &str, params: Value) -> Channel {
        let id = ChannelId(self.next_channel.fetch_add(1, Ordering::SeqCst));
        let join_push = Push::new(events::JOIN, params, self.timeout);
        let (state_tx, state) = watch::channel(ChannelState::Closed);
        let _ = self.commands.send(Command::AddChannel {
            id,
            topic: topic.to_string(),
            join_push: join_push.clone(),
            state: state_tx,
        });
        Channel::new(id, topic, self.timeout, join_push, state, self.commands.clone())
    }

    /// Run `callback` each time the transport opens.
    pub fn on_open(&self, callback: impl Fn() + Send + Sync + 'static) {
        let _ = self.send(Command::Hook(SocketHook::Open(Arc::new(callback))));
    }

    /// Run `callback` each time the transport closes.
    pub fn on_close(&self, callback: impl Fn(&CloseEvent) + Send + Sync + 'static) {
        let _ = self.send(Command::Hook(SocketHook::Close(Arc::new(callback))));
    }

    /// Run `callback` on every transport error.
    pub fn on_error(&self, callback: impl Fn(&str) + Send + Sync + 'static) {
        let _ = self.send(Command::Hook(SocketHook::Error(Arc::new(callback))));
    }

    /// Run `callback` for every decoded inbound frame, after channel dispatch.
    pub fn on_message(&self, callback: impl Fn(&Frame) + Send + Sync + 'static) {
        let _ = self.send(Command::Hook(SocketHook::Message(Arc::new(callback))));
    }

    /// Connection state as last observed by the socket task.
    #[must_use]
    pub fn connection_state(&self) -> ReadyState {
        *self.state.borrow()
    }

    /// Whether the transport is open.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connection_state() == ReadyState::Open
    }

    /// Subscribe to connection state changes.
    #[must_use]
    pub fn state_changes(&self) -> watch::Receiver<ReadyState> {
        self.state.clone()
    }

    /// URL handed to the connector.
    #[must_use]
    pub fn endpoint_url(&self) -> &str {
        &self.endpoint_url
    }

    fn send(&self, command: Command) -> Result<(), ClientError> {
        self.commands
            .send(command)
            .map_err(|_| ClientError::SocketClosed)
    }
}

impl fmt::Debug for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Socket")
            .field("endpoint_url", &self.endpoint_url)
            .field("state", &self.connection_state())
            .finish()
    }
}

fn post(commands: &mpsc::WeakUnboundedSender<Command>, command: Command) {
    if let Some(tx) = commands.upgrade() {
        let _ = tx.send(command);
    }
}

#[derive(Default)]
struct Hooks {
    open: Vec<OpenHook>,
    close: Vec<CloseHook>,
    error: Vec<ErrorHook>,
    message: Vec<MessageHook>,
}

/// Connection-level state, separate from the channels so both can be
/// borrowed mutably at once.
struct SocketCore {
    endpoint_url: String,
    connector: Arc<dyn Connector>,
    serializer: Arc<dyn Serializer>,
    heartbeat_interval: Duration,
    conn: Option<Box<dyn Transport>>,
    events: Option<EventReceiver>,
    close_seen: bool,
    state: ReadyState,
    state_tx: watch::Sender<ReadyState>,
    reference: u64,
    send_buffer: VecDeque<Frame>,
    heartbeat_ref: Option<String>,
    heartbeat: Option<JoinHandle<()>>,
    reconnect: RetryTimer,
    commands: mpsc::WeakUnboundedSender<Command>,
}

impl SocketCore {
    fn set_state(&mut self, state: ReadyState) {
        self.state = state;
        self.state_tx.send_replace(state);
        metrics::set_connected(state == ReadyState::Open);
    }

    fn connect(&mut self) {
        if let Some(conn) = &self.conn {
            if conn.ready_state() != ReadyState::Closed {
                return;
            }
        }
        self.drop_connection();

        info!(url = %self.endpoint_url, transport = self.connector.name(), "Connecting");
        let (tx, rx) = mpsc::unbounded_channel();
        self.conn = Some(self.connector.connect(&self.endpoint_url, tx));
        self.events = Some(rx);
        self.close_seen = false;
        self.set_state(ReadyState::Connecting);
    }

    /// Forget the current transport without observing any more of its events.
    fn drop_connection(&mut self) {
        self.conn = None;
        self.events = None;
    }

    fn start_heartbeat(&mut self) {
        self.stop_heartbeat();
        let commands = self.commands.clone();
        let period = self.heartbeat_interval;
        let start = Instant::now() + period;
        self.heartbeat = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(start, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(tx) = commands.upgrade() else {
                    return;
                };
                if tx.send(Command::Heartbeat).is_err() {
                    return;
                }
            }
        }));
    }

    fn stop_heartbeat(&mut self) {
        if let Some(task) = self.heartbeat.take() {
            task.abort();
        }
    }

    fn write(&mut self, frame: &Frame) {
        let message = match self.serializer.encode(frame) {
            Ok(message) => message,
            Err(e) => {
                warn!(topic = %frame.topic, event = %frame.event, error = %e, "Failed to encode frame");
                return;
            }
        };
        let len = message.len();
        let Some(conn) = self.conn.as_mut() else {
            return;
        };
        match conn.send(message) {
            Ok(()) => metrics::record_frame_sent(len),
            Err(e) => warn!(topic = %frame.topic, event = %frame.event, error = %e, "Failed to send frame"),
        }
    }

    fn flush_send_buffer(&mut self) {
        if !self.is_connected() || self.send_buffer.is_empty() {
            return;
        }
        debug!(frames = self.send_buffer.len(), "Flushing send buffer");
        while let Some(frame) = self.send_buffer.pop_front() {
            self.write(&frame);
        }
        metrics::set_send_buffer(0);
    }
}

impl Outbound for SocketCore {
    fn make_ref(&mut self) -> String {
        self.reference = self.reference.checked_add(1).unwrap_or(0);
        self.reference.to_string()
    }

    fn push(&mut self, frame: Frame) {
        trace!(topic = %frame.topic, event = %frame.event, reference = ?frame.reference, "Push");
        if self.is_connected() {
            self.write(&frame);
        } else {
            self.send_buffer.push_back(frame);
            metrics::set_send_buffer(self.send_buffer.len());
        }
    }

    fn discard(&mut self, reference: &str) {
        self.send_buffer
            .retain(|frame| frame.reference.as_deref() != Some(reference));
        metrics::set_send_buffer(self.send_buffer.len());
    }

    fn is_connected(&self) -> bool {
        self.state == ReadyState::Open
            && self
                .conn
                .as_ref()
                .is_some_and(|conn| conn.ready_state() == ReadyState::Open)
    }

    fn schedule_timeout(
        &self,
        channel: ChannelId,
        push: Push,
        reference: String,
        after: Duration,
    ) -> JoinHandle<()> {
        let commands = self.commands.clone();
        let deadline = Instant::now() + after;
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            post(
                &commands,
                Command::PushTimeout {
                    channel,
                    push,
                    reference,
                },
            );
        })
    }
}

/// The socket task.
struct Runner {
    core: SocketCore,
    channels: HashMap<ChannelId, ChannelCore>,
    rejoin_after: BackoffFn,
    hooks: Hooks,
}

impl Runner {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        loop {
            // Commands first: calls made before a frame arrived apply before it.
            tokio::select! {
                biased;
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                event = next_event(&mut self.core.events) => self.handle_event(event),
            }
        }

        debug!(url = %self.core.endpoint_url, "Socket task exiting");
        self.core.reconnect.reset();
        self.core.stop_heartbeat();
        if let Some(mut conn) = self.core.conn.take() {
            conn.close(None, None);
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect => self.core.connect(),
            Command::Disconnect { code, reason } => self.disconnect(code, reason.as_deref()),
            Command::AddChannel {
                id,
                topic,
                join_push,
                state,
            } => {
                let commands = self.core.commands.clone();
                let rejoin = RetryTimer::new(
                    move || post(&commands, Command::Rejoin(id)),
                    Arc::clone(&self.rejoin_after),
                );
                let timeout = join_push.timeout();
                let channel = ChannelCore::new(id, topic, join_push, timeout, state, rejoin);
                self.channels.insert(id, channel);
            }
            Command::Join { channel, timeout } => self.join(channel, timeout),
            Command::Push { channel, push } => match self.channels.get_mut(&channel) {
                Some(core) => core.push(push, &mut self.core),
                None => {
                    // Closed channel: the push can only time out.
                    push.start_timeout(channel, &mut self.core);
                }
            },
            Command::Leave { channel, push } => match self.channels.get_mut(&channel) {
                Some(core) => {
                    core.leave(push, &mut self.core);
                    self.reap();
                }
                None => push.trigger(Reply::new(status::OK, Value::Object(Default::default()))),
            },
            Command::Bind {
                channel,
                event,
                callback,
            } => {
                if let Some(core) = self.channels.get_mut(&channel) {
                    core.bind(event, callback);
                }
            }
            Command::Unbind { channel, event } => {
                if let Some(core) = self.channels.get_mut(&channel) {
                    core.unbind(&event);
                }
            }
            Command::Hook(hook) => match hook {
                SocketHook::Open(hook) => self.hooks.open.push(hook),
                SocketHook::Close(hook) => self.hooks.close.push(hook),
                SocketHook::Error(hook) => self.hooks.error.push(hook),
                SocketHook::Message(hook) => self.hooks.message.push(hook),
            },
            Command::Heartbeat => self.heartbeat(),
            Command::Reconnect => {
                if self.core.is_connected() {
                    return;
                }
                metrics::record_reconnect();
                info!(attempt = self.core.reconnect.attempts(), "Reconnecting");
                self.core.drop_connection();
                self.core.connect();
            }
            Command::Rejoin(channel) => {
                if let Some(core) = self.channels.get_mut(&channel) {
                    core.rejoin_tick(&mut self.core);
                }
            }
            Command::PushTimeout {
                channel,
                push,
                reference,
            } => match self.channels.get_mut(&channel) {
                Some(core) => {
                    core.handle_timeout(&reference, push, &mut self.core);
                    self.reap();
                }
                None => {
                    if push.reference().as_deref() == Some(reference.as_str()) {
                        metrics::record_push_timeout();
                        push.trigger(Reply::timeout());
                    }
                }
            },
        }
    }

    fn join(&mut self, id: ChannelId, timeout: Duration) {
        let Some(topic) = self.channels.get(&id).map(|c| c.topic().to_string()) else {
            return;
        };

        // Only one join per topic may be active on a socket.
        for (other_id, other) in &mut self.channels {
            if *other_id != id
                && other.topic() == topic
                && matches!(other.state(), ChannelState::Joining | ChannelState::Joined)
            {
                debug!(topic = %topic, channel = %other_id, "Leaving duplicate channel");
                let leave = Push::new(events::LEAVE, Value::Object(Default::default()), other.timeout());
                other.leave(leave, &mut self.core);
            }
        }

        if let Some(channel) = self.channels.get_mut(&id) {
            channel.join(timeout, &mut self.core);
        }
        self.reap();
    }

    fn disconnect(&mut self, code: Option<u16>, reason: Option<&str>) {
        info!(url = %self.core.endpoint_url, "Disconnecting");
        self.core.reconnect.reset();
        self.core.stop_heartbeat();
        self.core.heartbeat_ref = None;
        if let Some(mut conn) = self.core.conn.take() {
            self.core.events = None;
            conn.close(code, reason);
        }
        self.core.drop_connection();
        self.core.set_state(ReadyState::Closed);
        self.trigger_chan_error();
    }

    fn heartbeat(&mut self) {
        if !self.core.is_connected() {
            return;
        }
        if self.core.heartbeat_ref.take().is_some() {
            warn!(url = %self.core.endpoint_url, "Heartbeat timeout, re-establishing connection");
            metrics::record_heartbeat_timeout();
            if let Some(mut conn) = self.core.conn.take() {
                self.core.events = None;
                conn.close(Some(CLOSE_NORMAL), Some(HEARTBEAT_TIMEOUT_REASON));
            }
            self.core.drop_connection();
            self.on_conn_close(CloseEvent::new(CLOSE_NORMAL, HEARTBEAT_TIMEOUT_REASON));
            return;
        }
        let reference = self.core.make_ref();
        self.core.heartbeat_ref = Some(reference.clone());
        self.core.push(Frame::heartbeat(reference));
    }

    fn handle_event(&mut self, event: Option<TransportEvent>) {
        match event {
            Some(TransportEvent::Open) => self.on_conn_open(),
            Some(TransportEvent::Error(reason)) => self.on_conn_error(&reason),
            Some(TransportEvent::Message(message)) => self.on_conn_message(&message),
            Some(TransportEvent::Close(close)) => self.on_conn_close(close),
            None => {
                self.core.events = None;
                if !self.core.close_seen {
                    self.on_conn_close(CloseEvent::abnormal("transport dropped"));
                }
            }
        }
    }

    fn on_conn_open(&mut self) {
        info!(url = %self.core.endpoint_url, "Connected");
        self.core.set_state(ReadyState::Open);
        self.core.heartbeat_ref = None;
        self.core.flush_send_buffer();
        self.core.reconnect.reset();

        let skip_heartbeat = self
            .core
            .conn
            .as_ref()
            .is_some_and(|conn| conn.skip_heartbeat());
        if !skip_heartbeat {
            self.core.start_heartbeat();
        }

        for hook in &self.hooks.open {
            hook();
        }

        for channel in self.channels.values_mut() {
            channel.rejoin_if_errored(&mut self.core);
        }
    }

    fn on_conn_error(&mut self, reason: &str) {
        warn!(url = %self.core.endpoint_url, error = %reason, "Transport error");
        // Fatal failures are followed by a close, which arms the reconnect.
        self.trigger_chan_error();
        for hook in &self.hooks.error {
            hook(reason);
        }
    }

    fn on_conn_close(&mut self, close: CloseEvent) {
        info!(code = close.code, reason = %close.reason, "Transport closed");
        self.core.close_seen = true;
        self.core.heartbeat_ref = None;
        self.trigger_chan_error();
        self.core.stop_heartbeat();
        self.core.reconnect.schedule();
        self.core.set_state(ReadyState::Closed);
        for hook in &self.hooks.close {
            hook(&close);
        }
    }

    fn on_conn_message(&mut self, message: &RawMessage) {
        let frame = match self.core.serializer.decode(message) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, bytes = message.len(), "Dropping undecodable message");
                metrics::record_decode_failure();
                return;
            }
        };
        metrics::record_frame_received(message.len());

        if frame.reference.is_some() && frame.reference == self.core.heartbeat_ref {
            self.core.heartbeat_ref = None;
        }
        trace!(topic = %frame.topic, event = %frame.event, reference = ?frame.reference, "Received");

        for channel in self
            .channels
            .values_mut()
            .filter(|channel| channel.topic() == frame.topic)
        {
            channel.trigger(&frame, &mut self.core);
        }
        self.reap();

        for hook in &self.hooks.message {
            hook(&frame);
        }
    }

    fn trigger_chan_error(&mut self) {
        for channel in self.channels.values_mut() {
            channel.trigger_error(&mut self.core);
        }
        self.reap();
    }

    /// Stop routing to channels that closed.
    fn reap(&mut self) {
        self.channels.retain(|id, channel| {
            if channel.is_removed() {
                debug!(topic = %channel.topic(), channel = %id, "Removing closed channel");
                false
            } else {
                true
            }
        });
    }
}

async fn next_event(events: &mut Option<EventReceiver>) -> Option<TransportEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
