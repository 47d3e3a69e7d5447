//! Pooled WebSocket subscriptions with per-subscriber reconnect.
//!
//! One physical connection per URL is shared by every subscription on that
//! URL. Each connection runs as a driver task that fans frames out over a
//! broadcast channel; each subscription runs as its own task that forwards
//! events to its handlers and owns its backoff.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::Value;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::USER_AGENT;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(1);
const EVENT_CAPACITY: usize = 256;

pub type SubscriptionId = String;
pub type MessageHandler = Arc<dyn Fn(StreamMessage) + Send + Sync>;
pub type ErrorHandler = Arc<dyn Fn(StreamError) + Send + Sync>;

#[derive(Debug, Clone, PartialEq)]
pub enum StreamMessage {
    Json(Value),
    Raw(String),
}

impl StreamMessage {
    pub fn parse(text: String) -> Self {
        match serde_json::from_str::<Value>(&text) {
            Ok(value) => StreamMessage::Json(value),
            Err(_) => StreamMessage::Raw(text),
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            StreamMessage::Json(value) => value.clone(),
            StreamMessage::Raw(text) => Value::String(text.clone()),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StreamError {
    #[error("failed to connect to {url}: {message}")]
    Connect { url: String, message: String },
    #[error("stream transport error: {0}")]
    Transport(String),
    #[error("Failed to reconnect after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

#[async_trait]
pub trait Transport: Send {
    /// Next data frame, or `None` once the peer has closed.
    async fn next_frame(&mut self) -> Option<Result<Frame, StreamError>>;
    async fn close(&mut self);
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Box<dyn Transport>, StreamError>;
}

/// Exponential backoff: `base * 2^(attempt - 1)`, giving up after `max_attempts`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    max_attempts: u32,
    attempts: u32,
}

impl Backoff {
    pub fn new(base: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            max_attempts,
            attempts: 0,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempts >= self.max_attempts {
            return None;
        }
        self.attempts += 1;
        let factor = 1u32.checked_shl(self.attempts - 1).unwrap_or(u32::MAX);
        Some(self.base.saturating_mul(factor))
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}

pub struct TungsteniteConnector {
    user_agent: String,
}

impl TungsteniteConnector {
    pub fn new(user_agent: impl Into<String>) -> Self {
        Self {
            user_agent: user_agent.into(),
        }
    }
}

impl Default for TungsteniteConnector {
    fn default() -> Self {
        Self::new(format!("genie/{}", genie_core::version::PACKAGE))
    }
}

#[async_trait]
impl Connector for TungsteniteConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn Transport>, StreamError> {
        let connect_err = |message: String| StreamError::Connect {
            url: url.to_string(),
            message,
        };
        let mut request = url
            .into_client_request()
            .map_err(|err| connect_err(err.to_string()))?;
        let agent =
            HeaderValue::from_str(&self.user_agent).map_err(|err| connect_err(err.to_string()))?;
        request.headers_mut().insert(USER_AGENT, agent);
        let (socket, _) = connect_async(request)
            .await
            .map_err(|err| connect_err(err.to_string()))?;
        Ok(Box::new(TungsteniteTransport { socket }))
    }
}

struct TungsteniteTransport {
    socket: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Transport for TungsteniteTransport {
    async fn next_frame(&mut self) -> Option<Result<Frame, StreamError>> {
        loop {
            match self.socket.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(Frame::Text(text))),
                Ok(Message::Binary(bytes)) => return Some(Ok(Frame::Binary(bytes))),
                Ok(Message::Close(_)) => return None,
                Ok(_) => continue,
                Err(err) => return Some(Err(StreamError::Transport(err.to_string()))),
            }
        }
    }

    async fn close(&mut self) {
        if let Err(err) = self.socket.close(None).await {
            debug!("websocket close failed: {err}");
        }
    }
}

#[derive(Debug, Clone)]
enum ConnectionEvent {
    Open,
    Message(StreamMessage),
    Error(StreamError),
    Closed,
}

const CONNECTING: u8 = 0;
const OPEN: u8 = 1;
const CLOSING: u8 = 2;
const CLOSED: u8 = 3;

struct Connection {
    id: u64,
    state: Arc<AtomicU8>,
    events: broadcast::Sender<ConnectionEvent>,
    shutdown: CancellationToken,
}

impl Connection {
    fn open(
        id: u64,
        url: &str,
        connector: Arc<dyn Connector>,
    ) -> (Arc<Self>, broadcast::Receiver<ConnectionEvent>) {
        let (events, receiver) = broadcast::channel(EVENT_CAPACITY);
        let connection = Arc::new(Self {
            id,
            state: Arc::new(AtomicU8::new(CONNECTING)),
            events: events.clone(),
            shutdown: CancellationToken::new(),
        });
        tokio::spawn(drive_connection(
            connector,
            url.to_string(),
            connection.state.clone(),
            events,
            connection.shutdown.clone(),
        ));
        (connection, receiver)
    }

    fn is_live(&self) -> bool {
        matches!(self.state.load(Ordering::SeqCst), CONNECTING | OPEN)
    }

    fn is_open(&self) -> bool {
        self.state.load(Ordering::SeqCst) == OPEN
    }

    fn close(&self) {
        let _ = self
            .state
            .compare_exchange(CONNECTING, CLOSING, Ordering::SeqCst, Ordering::SeqCst);
        let _ = self
            .state
            .compare_exchange(OPEN, CLOSING, Ordering::SeqCst, Ordering::SeqCst);
        self.shutdown.cancel();
    }
}

async fn drive_connection(
    connector: Arc<dyn Connector>,
    url: String,
    state: Arc<AtomicU8>,
    events: broadcast::Sender<ConnectionEvent>,
    shutdown: CancellationToken,
) {
    // Send errors only mean nobody is listening any more.
    let publish = |event: ConnectionEvent| {
        let _ = events.send(event);
    };

    let connected = tokio::select! {
        _ = shutdown.cancelled() => {
            state.store(CLOSED, Ordering::SeqCst);
            return;
        }
        result = connector.connect(&url) => result,
    };
    let mut transport = match connected {
        Ok(transport) => transport,
        Err(err) => {
            debug!(%url, "connect failed: {err}");
            state.store(CLOSED, Ordering::SeqCst);
            publish(ConnectionEvent::Error(err));
            publish(ConnectionEvent::Closed);
            return;
        }
    };
    if shutdown.is_cancelled() {
        transport.close().await;
        state.store(CLOSED, Ordering::SeqCst);
        return;
    }
    state.store(OPEN, Ordering::SeqCst);
    debug!(%url, "stream connected");
    publish(ConnectionEvent::Open);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                transport.close().await;
                state.store(CLOSED, Ordering::SeqCst);
                debug!(%url, "stream closed by pool");
                return;
            }
            frame = transport.next_frame() => match frame {
                Some(Ok(Frame::Text(text))) => {
                    publish(ConnectionEvent::Message(StreamMessage::parse(text)));
                }
                Some(Ok(Frame::Binary(bytes))) => {
                    let text = String::from_utf8_lossy(&bytes).into_owned();
                    publish(ConnectionEvent::Message(StreamMessage::parse(text)));
                }
                Some(Err(err)) => {
                    state.store(CLOSED, Ordering::SeqCst);
                    publish(ConnectionEvent::Error(err));
                    publish(ConnectionEvent::Closed);
                    return;
                }
                None => {
                    state.store(CLOSED, Ordering::SeqCst);
                    debug!(%url, "stream closed by peer");
                    publish(ConnectionEvent::Closed);
                    return;
                }
            }
        }
    }
}

struct SubscriptionEntry {
    url: String,
    closed: Arc<AtomicBool>,
    cancel: CancellationToken,
}

#[derive(Default)]
struct PoolState {
    connections: HashMap<String, Arc<Connection>>,
    subscriptions: HashMap<SubscriptionId, SubscriptionEntry>,
}

struct PoolInner {
    connector: Arc<dyn Connector>,
    base_delay: Duration,
    state: Mutex<PoolState>,
    next_subscription: AtomicU64,
    next_connection: AtomicU64,
}

impl PoolInner {
    fn state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Join the live connection for `url` or open a new one. Returns `None`
    /// when the subscription was closed in the meantime.
    fn acquire(
        &self,
        url: &str,
        closed: &AtomicBool,
    ) -> Option<(Arc<Connection>, broadcast::Receiver<ConnectionEvent>)> {
        let mut state = self.state();
        if closed.load(Ordering::SeqCst) {
            return None;
        }
        Some(self.acquire_locked(&mut state, url))
    }

    fn acquire_locked(
        &self,
        state: &mut PoolState,
        url: &str,
    ) -> (Arc<Connection>, broadcast::Receiver<ConnectionEvent>) {
        if let Some(existing) = state.connections.get(url) {
            // Subscribe before the liveness check so no later event is missed.
            let receiver = existing.events.subscribe();
            if existing.is_live() {
                debug!(%url, connection = existing.id, "joining pooled stream");
                return (existing.clone(), receiver);
            }
        }
        let id = self.next_connection.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(%url, connection = id, "opening stream");
        let (connection, receiver) = Connection::open(id, url, self.connector.clone());
        if let Some(previous) = state.connections.insert(url.to_string(), connection.clone()) {
            previous.close();
        }
        (connection, receiver)
    }
}

struct SubscriptionTask {
    id: SubscriptionId,
    url: String,
    on_message: MessageHandler,
    on_error: Option<ErrorHandler>,
    backoff: Backoff,
    closed: Arc<AtomicBool>,
    cancel: CancellationToken,
}

impl SubscriptionTask {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn report(&self, err: StreamError) {
        if self.is_closed() {
            return;
        }
        if let Some(on_error) = &self.on_error {
            on_error(err);
        }
    }

    async fn run(
        mut self,
        pool: Arc<PoolInner>,
        mut events: broadcast::Receiver<ConnectionEvent>,
    ) {
        loop {
            if !self.pump(&mut events).await {
                return;
            }

            let Some(delay) = self.backoff.next_delay() else {
                let attempts = self.backoff.max_attempts();
                warn!(subscription = %self.id, url = %self.url, attempts, "giving up on stream");
                self.report(StreamError::ReconnectExhausted { attempts });
                self.closed.store(true, Ordering::SeqCst);
                return;
            };
            warn!(
                subscription = %self.id,
                url = %self.url,
                attempt = self.backoff.attempts(),
                delay_ms = delay.as_millis() as u64,
                "stream closed, reconnecting"
            );
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }

            let Some((connection, receiver)) = pool.acquire(&self.url, &self.closed) else {
                return;
            };
            events = receiver;
            if connection.is_open() {
                self.backoff.reset();
            }
        }
    }

    /// Forward events until the connection closes. Returns `false` when the
    /// subscription itself was closed.
    async fn pump(&mut self, events: &mut broadcast::Receiver<ConnectionEvent>) -> bool {
        loop {
            let event = tokio::select! {
                _ = self.cancel.cancelled() => return false,
                event = events.recv() => event,
            };
            if self.is_closed() {
                return false;
            }
            match event {
                Ok(ConnectionEvent::Open) => self.backoff.reset(),
                Ok(ConnectionEvent::Message(message)) => (self.on_message)(message),
                Ok(ConnectionEvent::Error(err)) => self.report(err),
                Ok(ConnectionEvent::Closed) | Err(RecvError::Closed) => return true,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(subscription = %self.id, skipped, "subscriber lagged, dropped stream events");
                }
            }
        }
    }
}

/// Connection-pooled, multi-subscriber stream client.
///
/// Must be used from within a Tokio runtime. Dropping the pool closes it.
pub struct StreamPool {
    inner: Arc<PoolInner>,
}

impl StreamPool {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self::with_base_delay(connector, DEFAULT_RECONNECT_DELAY)
    }

    pub fn with_base_delay(connector: Arc<dyn Connector>, base_delay: Duration) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                connector,
                base_delay,
                state: Mutex::new(PoolState::default()),
                next_subscription: AtomicU64::new(0),
                next_connection: AtomicU64::new(0),
            }),
        }
    }

    pub fn tungstenite() -> Self {
        Self::new(Arc::new(TungsteniteConnector::default()))
    }

    pub fn subscribe(
        &self,
        url: impl Into<String>,
        on_message: MessageHandler,
        on_error: Option<ErrorHandler>,
        max_reconnect_attempts: u32,
    ) -> SubscriptionId {
        let url = url.into();
        let id = format!(
            "sub_{}",
            self.inner.next_subscription.fetch_add(1, Ordering::SeqCst)
        );
        let closed = Arc::new(AtomicBool::new(false));
        let cancel = CancellationToken::new();

        let task = SubscriptionTask {
            id: id.clone(),
            url: url.clone(),
            on_message,
            on_error,
            backoff: Backoff::new(self.inner.base_delay, max_reconnect_attempts),
            closed: closed.clone(),
            cancel: cancel.clone(),
        };
        let events = {
            let mut state = self.inner.state();
            let (_, events) = self.inner.acquire_locked(&mut state, &url);
            state.subscriptions.insert(
                id.clone(),
                SubscriptionEntry {
                    url,
                    closed,
                    cancel,
                },
            );
            events
        };
        tokio::spawn(task.run(self.inner.clone(), events));
        id
    }

    /// Close one subscription; the last subscriber on a URL closes its connection.
    pub fn unsubscribe(&self, id: &str) -> bool {
        let connection = {
            let mut state = self.inner.state();
            let Some(entry) = state.subscriptions.remove(id) else {
                return false;
            };
            entry.closed.store(true, Ordering::SeqCst);
            entry.cancel.cancel();
            let still_used = state.subscriptions.values().any(|other| {
                other.url == entry.url && !other.closed.load(Ordering::SeqCst)
            });
            if still_used {
                None
            } else {
                state.connections.remove(&entry.url)
            }
        };
        if let Some(connection) = connection {
            debug!(connection = connection.id, "last subscriber left, closing stream");
            connection.close();
        }
        true
    }

    pub fn close(&self) {
        let mut state = self.inner.state();
        for (_, entry) in state.subscriptions.drain() {
            entry.closed.store(true, Ordering::SeqCst);
            entry.cancel.cancel();
        }
        for (_, connection) in state.connections.drain() {
            connection.close();
        }
    }

    pub fn connection_count(&self) -> usize {
        self.inner.state().connections.len()
    }

    /// Subscriptions that are still active (not unsubscribed, not given up).
    pub fn subscription_count(&self) -> usize {
        self.inner
            .state()
            .subscriptions
            .values()
            .filter(|entry| !entry.closed.load(Ordering::SeqCst))
            .count()
    }
}

impl Drop for StreamPool {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_then_gives_up() {
        let mut backoff = Backoff::new(Duration::from_secs(1), 4);
        let delays: Vec<_> = std::iter::from_fn(|| backoff.next_delay()).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(8),
            ]
        );
        assert_eq!(backoff.attempts(), 4);
        assert_eq!(backoff.next_delay(), None);

        backoff.reset();
        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(1)));
    }

    #[test]
    fn zero_max_attempts_never_retries() {
        let mut backoff = Backoff::new(Duration::from_secs(1), 0);
        assert_eq!(backoff.next_delay(), None);
    }

    #[test]
    fn large_attempt_counts_saturate() {
        let mut backoff = Backoff::new(Duration::from_secs(1), 64);
        let last = std::iter::from_fn(|| backoff.next_delay()).last();
        assert!(last.is_some());
    }

    #[test]
    fn messages_fall_back_to_raw_text() {
        assert_eq!(
            StreamMessage::parse(r#"{"type":"log","line":"ok"}"#.to_string()),
            StreamMessage::Json(serde_json::json!({"type": "log", "line": "ok"}))
        );
        assert_eq!(
            StreamMessage::parse("plain text".to_string()),
            StreamMessage::Raw("plain text".to_string())
        );
        assert_eq!(
            StreamMessage::Raw("x".to_string()).to_value(),
            Value::String("x".to_string())
        );
    }

    #[test]
    fn exhausted_error_names_attempts() {
        assert_eq!(
            StreamError::ReconnectExhausted { attempts: 5 }.to_string(),
            "Failed to reconnect after 5 attempts"
        );
    }
}
