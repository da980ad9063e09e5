//! HTTP long-poll transport.
//!
//! The long-poll transport emulates a duplex connection with two kinds of
//! request against a session endpoint: a GET that blocks until the server has
//! messages (the poll), and one POST per outbound message. The poll response
//! body is a JSON object `{status, token, messages}`:
//!
//! | status | meaning |
//! |---|---|
//! | 200 | `messages` holds a batch; re-poll |
//! | 204 | nothing to deliver; re-poll |
//! | 410 | a new session was established; open, re-poll |
//! | 0, 500 | transport error; close so the owner reconnects |
//!
//! Any other status is a protocol violation and is handled like an error.
//! The poll cycle is its own liveness signal, so this transport asks its
//! owner to skip heartbeats.

use async_trait::async_trait;
use parking_lot::Mutex;
use pulse_protocol::RawMessage;
use serde::Deserialize;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::params::append_params;
use crate::traits::{
    CloseEvent, Connector, EventSender, ReadyState, SharedReadyState, Transport, TransportError,
    TransportEvent,
};

/// Default timeout for a single HTTP request.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(20);

/// HTTP method used by the long-poll transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
}

/// Minimal HTTP helper the long-poll transport is built on.
///
/// Implementations return the parsed JSON body, `Ok(None)` when the request
/// produced no usable body (network failure, empty or unparsable response),
/// and `Err(TransportError::Timeout)` when `timeout` elapsed.
#[async_trait]
pub trait HttpClient: Send + Sync + 'static {
    /// Perform one request.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Timeout`] when the request timed out, or
    /// another error if the request could not be made at all.
    async fn request(
        &self,
        method: HttpMethod,
        url: &str,
        body: Option<String>,
        timeout: Duration,
    ) -> Result<Option<Value>, TransportError>;
}

/// Body of a poll or post response.
#[derive(Debug, Deserialize)]
struct PollResponse {
    status: u16,
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    messages: Vec<Value>,
}

impl PollResponse {
    fn parse(body: Option<Value>) -> Self {
        body.and_then(|value| Self::deserialize(value).ok())
            .unwrap_or(Self {
                status: 0,
                token: None,
                messages: Vec::new(),
            })
    }
}

/// Rewrite a socket endpoint into its long-poll form.
///
/// `ws://` becomes `http://`, `wss://` becomes `https://` and a trailing
/// `/websocket` path segment becomes `/longpoll`.
#[must_use]
pub fn normalize_endpoint(endpoint: &str) -> String {
    let endpoint = if let Some(rest) = endpoint.strip_prefix("ws://") {
        format!("http://{rest}")
    } else if let Some(rest) = endpoint.strip_prefix("wss://") {
        format!("https://{rest}")
    } else {
        endpoint.to_string()
    };

    let (path, query) = match endpoint.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (endpoint.as_str(), None),
    };
    let path = match path.rfind("/websocket") {
        Some(index) => format!(
            "{}/longpoll{}",
            &path[..index],
            &path[index + "/websocket".len()..]
        ),
        None => path.to_string(),
    };
    match query {
        Some(query) => format!("{path}?{query}"),
        None => path,
    }
}

/// Creates [`LongPollTransport`]s over an [`HttpClient`].
#[derive(Clone)]
pub struct LongPollConnector {
    client: Arc<dyn HttpClient>,
    timeout: Duration,
}

impl LongPollConnector {
    /// Create a connector using `client` for HTTP.
    #[must_use]
    pub fn new(client: Arc<dyn HttpClient>) -> Self {
        Self {
            client,
            timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Set the per-request timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Create a connector backed by [`ReqwestClient`].
    #[cfg(feature = "longpoll")]
    #[must_use]
    pub fn reqwest() -> Self {
        Self::new(Arc::new(ReqwestClient::default()))
    }
}

impl Connector for LongPollConnector {
    fn connect(&self, endpoint: &str, events: EventSender) -> Box<dyn Transport> {
        let session = Arc::new(Session {
            endpoint: normalize_endpoint(endpoint),
            token: Mutex::new(None),
            state: SharedReadyState::new(ReadyState::Connecting),
            closed: AtomicBool::new(false),
            client: Arc::clone(&self.client),
            timeout: self.timeout,
            events,
        });
        debug!(endpoint = %session.endpoint, "Starting long-poll session");

        let poller = tokio::spawn(poll_loop(Arc::clone(&session)));
        Box::new(LongPollTransport { session, poller })
    }

    fn endpoint_path(&self) -> &'static str {
        "/longpoll"
    }

    fn name(&self) -> &'static str {
        "longpoll"
    }
}

/// State shared between the transport handle, the poll task and posts.
struct Session {
    endpoint: String,
    token: Mutex<Option<String>>,
    state: SharedReadyState,
    closed: AtomicBool,
    client: Arc<dyn HttpClient>,
    timeout: Duration,
    events: EventSender,
}

impl Session {
    fn url(&self) -> String {
        match self.token.lock().as_deref() {
            Some(token) => append_params(&self.endpoint, &serde_json::json!({ "token": token })),
            None => self.endpoint.clone(),
        }
    }

    fn emit(&self, event: TransportEvent) {
        if !self.closed.load(Ordering::SeqCst) {
            let _ = self.events.send(event);
        }
    }

    /// Mark the session closed, reporting `close` the first time only.
    fn finish(&self, close: Option<CloseEvent>) {
        self.state.set(ReadyState::Closed);
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(close) = close {
            let _ = self.events.send(TransportEvent::Close(close));
        }
    }

    fn fail(&self, reason: impl Into<String>) {
        let reason = reason.into();
        warn!(endpoint = %self.endpoint, reason = %reason, "Long-poll failure");
        self.emit(TransportEvent::Error(reason.clone()));
        self.finish(Some(CloseEvent::abnormal(reason)));
    }
}

async fn poll_loop(session: Arc<Session>) {
    loop {
        if !matches!(session.state.get(), ReadyState::Open | ReadyState::Connecting) {
            return;
        }

        let result = session
            .client
            .request(HttpMethod::Get, &session.url(), None, session.timeout)
            .await;
        let response = match result {
            Ok(body) => PollResponse::parse(body),
            Err(TransportError::Timeout) => {
                session.fail("timeout");
                return;
            }
            Err(e) => {
                debug!(error = %e, "Poll request failed");
                PollResponse::parse(None)
            }
        };

        if response.token.is_some() {
            *session.token.lock() = response.token;
        }

        match response.status {
            200 => {
                trace!(count = response.messages.len(), "Poll delivered messages");
                for message in response.messages {
                    session.emit(TransportEvent::Message(RawMessage::Text(message.to_string())));
                }
            }
            204 => {}
            410 => {
                debug!(endpoint = %session.endpoint, "Long-poll session opened");
                session.state.set(ReadyState::Open);
                session.emit(TransportEvent::Open);
            }
            0 | 500 => {
                session.fail(format!("poll failed with status {}", response.status));
                return;
            }
            other => {
                session.fail(format!("unhandled poll status {other}"));
                return;
            }
        }
    }
}

/// Handle to a long-poll session.
pub struct LongPollTransport {
    session: Arc<Session>,
    poller: JoinHandle<()>,
}

impl Transport for LongPollTransport {
    fn send(&mut self, message: RawMessage) -> Result<(), TransportError> {
        if self.session.state.get() != ReadyState::Open {
            return Err(TransportError::ConnectionClosed);
        }
        let body = match message {
            RawMessage::Text(text) => text,
            RawMessage::Binary(_) => {
                return Err(TransportError::SendFailed(
                    "long-poll carries text messages only".into(),
                ))
            }
        };

        let session = Arc::clone(&self.session);
        tokio::spawn(async move {
            let result = session
                .client
                .request(HttpMethod::Post, &session.url(), Some(body), session.timeout)
                .await;
            match result {
                Err(TransportError::Timeout) => session.emit(TransportEvent::Error("timeout".into())),
                Ok(body) => {
                    let response = PollResponse::parse(body);
                    if response.status != 200 {
                        session.fail(format!("post failed with status {}", response.status));
                    }
                }
                Err(e) => session.fail(format!("post failed: {e}")),
            }
        });
        Ok(())
    }

    fn close(&mut self, code: Option<u16>, reason: Option<&str>) {
        self.poller.abort();
        let close = match code {
            Some(code) => CloseEvent::new(code, reason.unwrap_or_default()),
            None => CloseEvent::new(crate::traits::CLOSE_NORMAL, reason.unwrap_or_default()),
        };
        self.session.finish(Some(close));
    }

    fn ready_state(&self) -> ReadyState {
        self.session.state.get()
    }

    fn skip_heartbeat(&self) -> bool {
        true
    }

    fn name(&self) -> &'static str {
        "longpoll"
    }
}

impl Drop for LongPollTransport {
    fn drop(&mut self) {
        self.poller.abort();
        self.session.finish(None);
    }
}

/// [`HttpClient`] backed by `reqwest`.
#[cfg(feature = "longpoll")]
#[derive(Debug, Clone, Default)]
pub struct ReqwestClient {
    client: reqwest::Client,
}

#[cfg(feature = "longpoll")]
impl ReqwestClient {
    /// Wrap an existing `reqwest` client.
    #[must_use]
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[cfg(feature = "longpoll")]
#[async_trait]
impl HttpClient for ReqwestClient {
    async fn request(
        &self,
        method: HttpMethod,
        url: &str,
        body: Option<String>,
        timeout: Duration,
    ) -> Result<Option<Value>, TransportError> {
        let method = match method {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
        };
        let mut request = self
            .client
            .request(method, url)
            .timeout(timeout)
            .header(reqwest::header::CONTENT_TYPE, "application/json");
        if let Some(body) = body {
            request = request.body(body);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) if e.is_timeout() => return Err(TransportError::Timeout),
            Err(e) => {
                debug!(error = %e, "HTTP request failed");
                return Ok(None);
            }
        };
        let text = match response.text().await {
            Ok(text) => text,
            Err(e) if e.is_timeout() => return Err(TransportError::Timeout),
            Err(e) => return Err(TransportError::Http(e.to_string())),
        };
        if text.is_empty() {
            return Ok(None);
        }
        match serde_json::from_str(&text) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                warn!(error = %e, "Failed to parse long-poll response");
                Ok(None)
            }
        }
    }
}
