//! Channels: one topic multiplexed over a socket.
//!
//! A channel moves through five states:
//!
//! ```text
//!            join()            "ok"
//!  Closed ─────────▶ Joining ───────▶ Joined
//!    ▲                 │  ▲              │
//!    │        timeout  │  │ rejoin       │ phx_error
//!    │                 ▼  │              ▼
//!    │              Errored ◀────────────┘
//!    │
//!    └──── Leaving ◀── leave() (any state)
//! ```
//!
//! The socket task owns a [`ChannelCore`] per channel; applications hold
//! cloneable [`Channel`] handles that send commands to it.

use pulse_protocol::{events, status, Frame, Reply};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace, warn};

use crate::error::ClientError;
use crate::metrics;
use crate::push::{Outbound, Push};
use crate::socket::Command;
use crate::timer::RetryTimer;

/// Identifies a channel within its socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(pub(crate) u64);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelState {
    Closed,
    Errored,
    Joining,
    Joined,
    Leaving,
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChannelState::Closed => "closed",
            ChannelState::Errored => "errored",
            ChannelState::Joining => "joining",
            ChannelState::Joined => "joined",
            ChannelState::Leaving => "leaving",
        };
        f.write_str(name)
    }
}

/// Callback bound to a channel event, run with the event payload.
pub type EventCallback = Arc<dyn Fn(&Value) + Send + Sync>;

/// Socket-side state of a channel.
pub(crate) struct ChannelCore {
    id: ChannelId,
    topic: String,
    timeout: Duration,
    state: watch::Sender<ChannelState>,
    bindings: Vec<(String, EventCallback)>,
    join_push: Push,
    push_buffer: Vec<Push>,
    pending: HashMap<String, Push>,
    rejoin_timer: RetryTimer,
    removed: bool,
}

impl ChannelCore {
    pub(crate) fn new(
        id: ChannelId,
        topic: String,
        join_push: Push,
        timeout: Duration,
        state: watch::Sender<ChannelState>,
        rejoin_timer: RetryTimer,
    ) -> Self {
        Self {
            id,
            topic,
            timeout,
            state,
            bindings: Vec::new(),
            join_push,
            push_buffer: Vec::new(),
            pending: HashMap::new(),
            rejoin_timer,
            removed: false,
        }
    }

    pub(crate) fn topic(&self) -> &str {
        &self.topic
    }

    pub(crate) fn timeout(&self) -> Duration {
        self.timeout
    }

    pub(crate) fn state(&self) -> ChannelState {
        *self.state.borrow()
    }

    fn set_state(&self, state: ChannelState) {
        self.state.send_replace(state);
    }

    /// Reference of the active join, used to reject stale lifecycle frames.
    pub(crate) fn join_ref(&self) -> Option<String> {
        self.join_push.reference()
    }

    /// Whether the channel closed and should stop receiving frames.
    pub(crate) fn is_removed(&self) -> bool {
        self.removed
    }

    fn can_push(&self, out: &dyn Outbound) -> bool {
        out.is_connected() && self.state() == ChannelState::Joined
    }

    pub(crate) fn bind(&mut self, event: String, callback: EventCallback) {
        self.bindings.push((event, callback));
    }

    pub(crate) fn unbind(&mut self, event: &str) {
        self.bindings.retain(|(bound, _)| bound != event);
    }

    pub(crate) fn join(&mut self, timeout: Duration, out: &mut dyn Outbound) {
        debug!(topic = %self.topic, "Joining channel");
        self.rejoin(timeout, out);
    }

    pub(crate) fn rejoin(&mut self, timeout: Duration, out: &mut dyn Outbound) {
        if self.state() == ChannelState::Leaving {
            return;
        }
        self.send_join(timeout, out);
    }

    fn send_join(&mut self, timeout: Duration, out: &mut dyn Outbound) {
        self.set_state(ChannelState::Joining);
        if let Some(stale) = self.join_push.reset(timeout) {
            self.pending.remove(&stale);
            out.discard(&stale);
        }

        let join_push = self.join_push.clone();
        self.arm(&join_push, out);
        self.send_push(&join_push, out);
    }

    /// Rejoin timer fired.
    pub(crate) fn rejoin_tick(&mut self, out: &mut dyn Outbound) {
        if self.state() != ChannelState::Errored {
            return;
        }
        if out.is_connected() {
            metrics::record_rejoin();
            self.rejoin(self.timeout, out);
        } else {
            self.rejoin_timer.schedule();
        }
    }

    /// Reset backoff and rejoin right away if errored. Used when the socket reopens.
    pub(crate) fn rejoin_if_errored(&mut self, out: &mut dyn Outbound) {
        if self.state() == ChannelState::Errored {
            self.rejoin_timer.reset();
            metrics::record_rejoin();
            self.rejoin(self.timeout, out);
        }
    }

    pub(crate) fn push(&mut self, push: Push, out: &mut dyn Outbound) {
        if self.can_push(out) {
            self.send_push(&push, out);
        } else {
            trace!(topic = %self.topic, event = %push.event(), "Buffering push until joined");
            self.arm(&push, out);
            self.push_buffer.push(push);
        }
    }

    pub(crate) fn leave(&mut self, leave_push: Push, out: &mut dyn Outbound) {
        debug!(topic = %self.topic, "Leaving channel");
        let joined = self.can_push(out);
        self.rejoin_timer.reset();
        self.set_state(ChannelState::Leaving);

        if out.is_connected() {
            self.send_push(&leave_push, out);
        }
        if !joined {
            let reference = leave_push.reference();
            if let Some(reference) = reference.as_deref() {
                self.pending.remove(reference);
            }
            self.resolve(leave_push, Reply::new(status::OK, Value::Object(Default::default())), out);
        }
    }

    fn arm(&mut self, push: &Push, out: &mut dyn Outbound) {
        if let Some(reference) = push.start_timeout(self.id, out) {
            self.pending.insert(reference, push.clone());
        }
    }

    fn send_push(&mut self, push: &Push, out: &mut dyn Outbound) {
        let join_ref = self.join_ref();
        if let Some(reference) = push.send(self.id, &self.topic, join_ref, out) {
            self.pending.insert(reference, push.clone());
        }
    }

    /// A push timeout fired.
    pub(crate) fn handle_timeout(&mut self, reference: &str, push: Push, out: &mut dyn Outbound) {
        if push.reference().as_deref() != Some(reference) {
            return;
        }
        self.pending.remove(reference);
        self.push_buffer.retain(|buffered| !buffered.ptr_eq(&push));
        metrics::record_push_timeout();
        self.resolve(push, Reply::timeout(), out);
    }

    /// Deliver an inbound frame to this channel.
    pub(crate) fn trigger(&mut self, frame: &Frame, out: &mut dyn Outbound) {
        if frame.is_lifecycle() {
            if let Some(reference) = frame.lifecycle_ref() {
                if self.join_ref().as_deref() != Some(reference) {
                    trace!(topic = %self.topic, event = %frame.event, reference = %reference, "Dropping stale lifecycle frame");
                    return;
                }
            }
        }

        match frame.event.as_str() {
            events::REPLY => self.handle_reply(frame, out),
            events::CLOSE => self.handle_close(),
            events::ERROR => self.handle_error(),
            _ => {}
        }

        self.dispatch(&frame.event, &frame.payload);
    }

    /// Transport-level failure observed by the socket.
    pub(crate) fn trigger_error(&mut self, out: &mut dyn Outbound) {
        let frame = Frame::new(self.topic.clone(), events::ERROR, Value::Null);
        self.trigger(&frame, out);
    }

    fn handle_reply(&mut self, frame: &Frame, out: &mut dyn Outbound) {
        let Some(reference) = frame.reference.as_deref() else {
            return;
        };
        if !self.pending.contains_key(reference) {
            return;
        }
        let Some(reply) = Reply::from_payload(&frame.payload) else {
            warn!(topic = %self.topic, reference = %reference, "Ignoring reply without status");
            return;
        };
        if let Some(push) = self.pending.remove(reference) {
            self.resolve(push, reply, out);
        }
    }

    /// Apply channel-level reactions to a reply, then run the push's hooks.
    fn resolve(&mut self, push: Push, reply: Reply, out: &mut dyn Outbound) {
        if push.ptr_eq(&self.join_push) {
            self.on_join_reply(&reply, out);
        } else if push.event() == events::LEAVE
            && (reply.is(status::OK) || reply.is(status::TIMEOUT))
        {
            debug!(topic = %self.topic, "Left channel");
            let mut close = Frame::new(self.topic.clone(), events::CLOSE, Value::from("leave"));
            close.join_ref = self.join_ref();
            self.trigger(&close, out);
        }
        push.trigger(reply);
    }

    fn on_join_reply(&mut self, reply: &Reply, out: &mut dyn Outbound) {
        if reply.is(status::OK) {
            debug!(topic = %self.topic, join_ref = ?self.join_ref(), "Joined channel");
            self.set_state(ChannelState::Joined);
            self.rejoin_timer.reset();
            for push in std::mem::take(&mut self.push_buffer) {
                self.send_push(&push, out);
            }
            return;
        }

        if self.state() != ChannelState::Joining {
            return;
        }
        self.set_state(ChannelState::Errored);
        if reply.is(status::TIMEOUT) {
            warn!(topic = %self.topic, timeout = ?self.join_push.timeout(), "Join timed out");
            self.rejoin_timer.schedule();
        } else {
            warn!(topic = %self.topic, status = %reply.status, response = %reply.response, "Join refused");
        }
    }

    fn handle_close(&mut self) {
        debug!(topic = %self.topic, join_ref = ?self.join_ref(), "Channel closed");
        self.rejoin_timer.reset();
        self.set_state(ChannelState::Closed);
        self.removed = true;
    }

    fn handle_error(&mut self) {
        if matches!(self.state(), ChannelState::Leaving | ChannelState::Closed) {
            return;
        }
        debug!(topic = %self.topic, "Channel errored");
        self.set_state(ChannelState::Errored);
        self.rejoin_timer.schedule();
    }

    fn dispatch(&self, event: &str, payload: &Value) {
        for (_, callback) in self.bindings.iter().filter(|(bound, _)| bound == event) {
            callback(payload);
        }
    }
}

/// Handle to a channel.
///
/// Cloning yields another handle to the same channel.
#[derive(Clone)]
pub struct Channel {
    id: ChannelId,
    topic: Arc<str>,
    timeout: Duration,
    join_push: Push,
    joined_once: Arc<AtomicBool>,
    state: watch::Receiver<ChannelState>,
    commands: mpsc::UnboundedSender<Command>,
}

impl Channel {
    pub(crate) fn new(
        id: ChannelId,
        topic: &str,
        timeout: Duration,
        join_push: Push,
        state: watch::Receiver<ChannelState>,
        commands: mpsc::UnboundedSender<Command>,
    ) -> Self {
        Self {
            id,
            topic: Arc::from(topic),
            timeout,
            join_push,
            joined_once: Arc::new(AtomicBool::new(false)),
            state,
            commands,
        }
    }

    /// Identifier of this channel within its socket.
    #[must_use]
    pub fn id(&self) -> ChannelId {
        self.id
    }

    /// Topic of this channel.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ChannelState {
        *self.state.borrow()
    }

    /// Subscribe to state changes.
    #[must_use]
    pub fn state_changes(&self) -> watch::Receiver<ChannelState> {
        self.state.clone()
    }

    /// The join push. Its hooks observe every join attempt, including rejoins.
    #[must_use]
    pub fn join_push(&self) -> &Push {
        &self.join_push
    }

    /// Join the topic with the socket's default timeout.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::AlreadyJoined`] if this channel was joined before.
    pub fn join(&self) -> Result<Push, ClientError> {
        self.join_with_timeout(self.timeout)
    }

    /// Join the topic.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::AlreadyJoined`] if this channel was joined before.
    pub fn join_with_timeout(&self, timeout: Duration) -> Result<Push, ClientError> {
        if self.joined_once.swap(true, Ordering::SeqCst) {
            return Err(ClientError::AlreadyJoined {
                topic: self.topic.to_string(),
            });
        }
        self.send(Command::Join {
            channel: self.id,
            timeout,
        })?;
        Ok(self.join_push.clone())
    }

    /// Push an event with the socket's default timeout.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::PushBeforeJoin`] if the channel was never joined.
    pub fn push(&self, event: &str, payload: Value) -> Result<Push, ClientError> {
        self.push_with_timeout(event, payload, self.timeout)
    }

    /// Push an event.
    ///
    /// The push is sent right away when the channel is joined on a connected
    /// socket and buffered until the next successful join otherwise. Its
    /// timeout starts immediately either way.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::PushBeforeJoin`] if the channel was never joined.
    pub fn push_with_timeout(
        &self,
        event: &str,
        payload: Value,
        timeout: Duration,
    ) -> Result<Push, ClientError> {
        if !self.joined_once.load(Ordering::SeqCst) {
            return Err(ClientError::PushBeforeJoin {
                topic: self.topic.to_string(),
                event: event.to_string(),
            });
        }
        let push = Push::new(event, payload, timeout);
        self.send(Command::Push {
            channel: self.id,
            push: push.clone(),
        })?;
        Ok(push)
    }

    /// Leave the topic with the socket's default timeout.
    pub fn leave(&self) -> Push {
        self.leave_with_timeout(self.timeout)
    }

    /// Leave the topic.
    ///
    /// The channel closes once the server acknowledges or the push times out,
    /// and immediately if the channel is not joined on a connected socket.
    pub fn leave_with_timeout(&self, timeout: Duration) -> Push {
        let push = Push::new(events::LEAVE, Value::Object(Default::default()), timeout);
        if self
            .send(Command::Leave {
                channel: self.id,
                push: push.clone(),
            })
            .is_err()
        {
            push.trigger(Reply::new(status::OK, Value::Object(Default::default())));
        }
        push
    }

    /// Bind `callback` to `event`. Bindings run in registration order.
    pub fn on(&self, event: &str, callback: impl Fn(&Value) + Send + Sync + 'static) {
        let _ = self.send(Command::Bind {
            channel: self.id,
            event: event.to_string(),
            callback: Arc::new(callback),
        });
    }

    /// Remove every binding for `event`.
    pub fn off(&self, event: &str) {
        let _ = self.send(Command::Unbind {
            channel: self.id,
            event: event.to_string(),
        });
    }

    /// Run `callback` when the channel closes.
    pub fn on_close(&self, callback: impl Fn(&Value) + Send + Sync + 'static) {
        self.on(events::CLOSE, callback);
    }

    /// Run `callback` when the channel errors.
    pub fn on_error(&self, callback: impl Fn(&Value) + Send + Sync + 'static) {
        self.on(events::ERROR, callback);
    }

    fn send(&self, command: Command) -> Result<(), ClientError> {
        self.commands
            .send(command)
            .map_err(|_| ClientError::SocketClosed)
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("topic", &self.topic)
            .field("state", &self.state())
            .finish()
    }
}
