//! Request/reply pushes.
//!
//! A [`Push`] is one outbound event awaiting a reply. Its reference is
//! assigned lazily when the push is first armed; a `phx_reply` carrying that
//! reference, or the local timeout, records the response and runs every hook
//! registered for its status.

use parking_lot::Mutex;
use pulse_protocol::{status, Frame, Reply};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::trace;

use crate::channel::ChannelId;

/// Callback run with the `response` of a reply.
pub type ReplyHook = Arc<dyn Fn(&Value) + Send + Sync>;

/// What a push needs from the socket that carries it.
pub(crate) trait Outbound {
    /// Allocate the next message reference.
    fn make_ref(&mut self) -> String;

    /// Send a frame now, or buffer it until the transport opens.
    fn push(&mut self, frame: Frame);

    /// Drop a buffered frame that has not been sent yet.
    fn discard(&mut self, reference: &str);

    /// Whether frames are currently written straight to the transport.
    fn is_connected(&self) -> bool;

    /// Deliver a timeout to `push` after `after`, unless cancelled.
    fn schedule_timeout(
        &self,
        channel: ChannelId,
        push: Push,
        reference: String,
        after: Duration,
    ) -> JoinHandle<()>;
}

struct PushState {
    event: String,
    payload: Value,
    timeout: Duration,
    reference: Option<String>,
    received: Option<Reply>,
    hooks: Vec<(String, ReplyHook)>,
    sent: bool,
    timer: Option<JoinHandle<()>>,
}

struct Shared {
    state: Mutex<PushState>,
    replies: watch::Sender<Option<Reply>>,
}

/// Handle to an outbound push. Cloning yields another handle to the same push.
#[derive(Clone)]
pub struct Push {
    shared: Arc<Shared>,
}

impl Push {
    pub(crate) fn new(event: impl Into<String>, payload: Value, timeout: Duration) -> Self {
        let (replies, _) = watch::channel(None);
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(PushState {
                    event: event.into(),
                    payload,
                    timeout,
                    reference: None,
                    received: None,
                    hooks: Vec::new(),
                    sent: false,
                    timer: None,
                }),
                replies,
            }),
        }
    }

    /// Register `callback` for replies with `status`.
    ///
    /// If a reply with that status was already recorded the callback also
    /// runs immediately, so registration order relative to the reply does
    /// not matter.
    pub fn receive(
        &self,
        status: &str,
        callback: impl Fn(&Value) + Send + Sync + 'static,
    ) -> &Self {
        let callback: ReplyHook = Arc::new(callback);
        let already = {
            let mut state = self.shared.state.lock();
            state.hooks.push((status.to_string(), Arc::clone(&callback)));
            state
                .received
                .as_ref()
                .filter(|reply| reply.is(status))
                .map(|reply| reply.response.clone())
        };
        if let Some(response) = already {
            callback(&response);
        }
        self
    }

    /// Wait for the recorded reply, or the next one if none is recorded yet.
    pub async fn reply(&self) -> Reply {
        let mut replies = self.shared.replies.subscribe();
        let reply = match replies.wait_for(Option::is_some).await {
            Ok(reply) => reply.clone().unwrap_or_else(Reply::timeout),
            Err(_) => Reply::timeout(),
        };
        reply
    }

    /// Event name.
    #[must_use]
    pub fn event(&self) -> String {
        self.shared.state.lock().event.clone()
    }

    /// Event payload.
    #[must_use]
    pub fn payload(&self) -> Value {
        self.shared.state.lock().payload.clone()
    }

    /// Reference assigned to the current attempt, if armed.
    #[must_use]
    pub fn reference(&self) -> Option<String> {
        self.shared.state.lock().reference.clone()
    }

    /// The recorded reply, if any.
    #[must_use]
    pub fn received(&self) -> Option<Reply> {
        self.shared.state.lock().received.clone()
    }

    /// Whether the push has been handed to the socket.
    #[must_use]
    pub fn is_sent(&self) -> bool {
        self.shared.state.lock().sent
    }

    /// Timeout of the current attempt.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.shared.state.lock().timeout
    }

    /// Whether `other` is a handle to the same push.
    #[must_use]
    pub fn ptr_eq(&self, other: &Push) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    pub(crate) fn has_received(&self, status: &str) -> bool {
        self.shared
            .state
            .lock()
            .received
            .as_ref()
            .is_some_and(|reply| reply.is(status))
    }

    /// Assign a reference and start the timeout, unless already running.
    ///
    /// Returns the new reference so the channel can route the reply.
    pub(crate) fn start_timeout(
        &self,
        channel: ChannelId,
        out: &mut dyn Outbound,
    ) -> Option<String> {
        let mut state = self.shared.state.lock();
        if state.timer.is_some() {
            return None;
        }
        let reference = out.make_ref();
        state.reference = Some(reference.clone());
        state.timer = Some(out.schedule_timeout(
            channel,
            self.clone(),
            reference.clone(),
            state.timeout,
        ));
        Some(reference)
    }

    /// Hand the push to the socket.
    ///
    /// A push that already timed out is never sent. Returns the reference if
    /// one was assigned by this call.
    pub(crate) fn send(
        &self,
        channel: ChannelId,
        topic: &str,
        join_ref: Option<String>,
        out: &mut dyn Outbound,
    ) -> Option<String> {
        if self.has_received(status::TIMEOUT) {
            return None;
        }
        let assigned = self.start_timeout(channel, out);

        let frame = {
            let mut state = self.shared.state.lock();
            state.sent = true;
            Frame {
                topic: topic.to_string(),
                event: state.event.clone(),
                payload: state.payload.clone(),
                reference: state.reference.clone(),
                join_ref,
            }
        };
        trace!(topic = %topic, event = %frame.event, reference = ?frame.reference, "Sending push");
        out.push(frame);
        assigned
    }

    /// Clear reference, response and sent state for another attempt.
    ///
    /// Hooks are kept. Returns the reference of the abandoned attempt.
    pub(crate) fn reset(&self, timeout: Duration) -> Option<String> {
        let old = {
            let mut state = self.shared.state.lock();
            if let Some(timer) = state.timer.take() {
                timer.abort();
            }
            state.timeout = timeout;
            state.received = None;
            state.sent = false;
            state.reference.take()
        };
        self.shared.replies.send_replace(None);
        old
    }

    /// Record `reply` and run the hooks registered for its status.
    pub(crate) fn trigger(&self, reply: Reply) {
        let hooks: Vec<ReplyHook> = {
            let mut state = self.shared.state.lock();
            if let Some(timer) = state.timer.take() {
                timer.abort();
            }
            state.received = Some(reply.clone());
            state
                .hooks
                .iter()
                .filter(|(status, _)| reply.is(status))
                .map(|(_, hook)| Arc::clone(hook))
                .collect()
        };
        self.shared.replies.send_replace(Some(reply.clone()));
        for hook in hooks {
            hook(&reply.response);
        }
    }
}

impl fmt::Debug for Push {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("Push")
            .field("event", &state.event)
            .field("reference", &state.reference)
            .field("sent", &state.sent)
            .field("received", &state.received)
            .finish()
    }
}
